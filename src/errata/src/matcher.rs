// Copyright 2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Pure predicates deciding whether a core identity is covered by a catalog entry.

use log::warn;
use serde::Serialize;

use crate::cpu::{CTR_CACHE_MINLINE_MASK, CTR_EL0_STRICT_MASK, LocalCpu};
use crate::midr::{
    MIDR_ARCHITECTURE_MASK, MIDR_IMPLEMENTOR_MASK, MIDR_PARTNUM_SHIFT, MIDR_VAR_REV_MASK, Midr,
};

/// Implementer, top nibble of the part number and architecture. Matches a family
/// of parts sharing the same major part class.
pub const MIDR_PART_CLASS_MASK: u32 =
    MIDR_IMPLEMENTOR_MASK | (0xf00 << MIDR_PARTNUM_SHIFT) | MIDR_ARCHITECTURE_MASK;

/// Where a matcher is being evaluated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// On the core being checked, with preemption disabled.
    LocalCpu,
    /// On behalf of the whole system.
    System,
}

/// Checks that the matcher runs pinned to the core it inspects. Returns `false`
/// and warns when it does not; the result is still computed.
pub(crate) fn check_local_scope(scope: Scope, cpu: &dyn LocalCpu) -> bool {
    if scope != Scope::LocalCpu || cpu.preemptible() {
        warn!(
            "CPU{}: errata matcher called with {:?} scope (preemptible: {})",
            cpu.id(),
            scope,
            cpu.preemptible()
        );
        return false;
    }
    true
}

/// Predicates that need more than the identity register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Predicate {
    /// The minimum cache line sizes differ from the system value.
    MismatchedCacheLineSize,
    /// Any strict CTR_EL0 field other than the minimum line sizes differs.
    MismatchedCacheType,
    /// Firmware or the SSBS bit say store bypass needs mitigating.
    SsbdMitigation,
}

/// How a catalog entry selects the cores it applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Matcher {
    /// `model` with variant:revision in `[min, max]`.
    Range { model: Midr, min: u32, max: u32 },
    /// `(midr & mask) == model & mask`.
    ModelMask { model: Midr, mask: u32 },
    Custom(Predicate),
}

impl Matcher {
    pub const fn range(model: Midr, min: u32, max: u32) -> Self {
        Matcher::Range { model, min, max }
    }

    pub const fn all_versions(model: Midr) -> Self {
        Matcher::Range {
            model,
            min: 0,
            max: MIDR_VAR_REV_MASK,
        }
    }

    /// Decides identity based matchers. Returns `None` for custom predicates.
    pub fn matches_midr(&self, midr: Midr) -> Option<bool> {
        match *self {
            Matcher::Range { model, min, max } => Some(is_affected_midr_range(midr, model, min, max)),
            Matcher::ModelMask { model, mask } => Some(is_model_mask(midr, model, mask)),
            Matcher::Custom(_) => None,
        }
    }
}

/// Same model and `min <= variant:revision <= max`.
pub fn is_affected_midr_range(midr: Midr, model: Midr, min: u32, max: u32) -> bool {
    midr.is_cpu_model_range(model, min, max)
}

/// `midr` equals `model` on the bits selected by `mask`.
pub fn is_model_mask(midr: Midr, model: Midr, mask: u32) -> bool {
    midr.0 & mask == model.0 & mask
}

/// System-wide view of `CTR_EL0` established by the boot core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTypeReference {
    /// Sanitised system value.
    pub sys_val: u64,
    /// Fields that must be identical on every core.
    pub strict_mask: u64,
}

impl CacheTypeReference {
    pub const fn new(sys_val: u64) -> Self {
        CacheTypeReference {
            sys_val,
            strict_mask: CTR_EL0_STRICT_MASK,
        }
    }
}

/// Compares a core's `CTR_EL0` to the system value under the mask selected by
/// `predicate`. Returns `false` for predicates that are not about cache type.
pub fn has_mismatched_cache_type(
    ctr: u64,
    reference: &CacheTypeReference,
    predicate: Predicate,
) -> bool {
    let mask = match predicate {
        Predicate::MismatchedCacheLineSize => CTR_CACHE_MINLINE_MASK,
        // Skip the min line sizes, they are covered by the entry above.
        Predicate::MismatchedCacheType => CTR_CACHE_MINLINE_MASK ^ reference.strict_mask,
        Predicate::SsbdMitigation => return false,
    };
    ctr & mask != reference.sys_val & mask
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::midr::*;

    // Cortex-A53 style CTR_EL0: RES1, CWG=4, ERG=4, DminLine=4, L1Ip=PIPT, IminLine=4.
    const SYS_CTR: u64 = 0x8444_c004;

    #[test]
    fn test_range_bounds() {
        let matcher = Matcher::range(MIDR_CORTEX_A57, var_rev(0, 0), var_rev(1, 2));
        let model = MIDR_CORTEX_A57;
        assert_eq!(matcher.matches_midr(model.with_var_rev(0, 0)), Some(true));
        assert_eq!(matcher.matches_midr(model.with_var_rev(1, 0)), Some(true));
        assert_eq!(matcher.matches_midr(model.with_var_rev(1, 2)), Some(true));
        // One above the upper bound.
        assert_eq!(matcher.matches_midr(model.with_var_rev(1, 3)), Some(false));
        assert_eq!(matcher.matches_midr(model.with_var_rev(2, 0)), Some(false));
        // Same version, other model.
        assert_eq!(
            matcher.matches_midr(MIDR_CORTEX_A53.with_var_rev(0, 0)),
            Some(false)
        );
    }

    #[test]
    fn test_range_lower_bound() {
        let matcher = Matcher::range(MIDR_KRYO4G, var_rev(12, 14), var_rev(13, 14));
        assert_eq!(
            matcher.matches_midr(MIDR_KRYO4G.with_var_rev(12, 13)),
            Some(false)
        );
        assert_eq!(
            matcher.matches_midr(MIDR_KRYO4G.with_var_rev(12, 14)),
            Some(true)
        );
        assert_eq!(
            matcher.matches_midr(MIDR_KRYO4G.with_var_rev(13, 15)),
            Some(false)
        );
    }

    #[test]
    fn test_kryo_part_class() {
        let matcher = Matcher::ModelMask {
            model: MIDR_QCOM_KRYO,
            mask: MIDR_PART_CLASS_MASK,
        };
        // Any 0x2XX part from Qualcomm, any version.
        assert_eq!(
            matcher.matches_midr(Midr::cpu_model(ARM_CPU_IMP_QCOM, 0x211).with_var_rev(3, 7)),
            Some(true)
        );
        assert_eq!(
            matcher.matches_midr(Midr::cpu_model(ARM_CPU_IMP_QCOM, 0x2ff)),
            Some(true)
        );
        assert_eq!(matcher.matches_midr(MIDR_QCOM_FALKOR), Some(false));
        assert_eq!(
            matcher.matches_midr(Midr::cpu_model(ARM_CPU_IMP_ARM, 0x211)),
            Some(false)
        );
    }

    #[test]
    fn test_custom_is_not_identity_based() {
        let matcher = Matcher::Custom(Predicate::SsbdMitigation);
        assert_eq!(matcher.matches_midr(MIDR_CORTEX_A76), None);
    }

    #[test]
    fn test_mismatched_cache_line_size() {
        let reference = CacheTypeReference::new(SYS_CTR);
        let line_size = Predicate::MismatchedCacheLineSize;
        let cache_type = Predicate::MismatchedCacheType;

        assert!(!has_mismatched_cache_type(SYS_CTR, &reference, line_size));
        assert!(!has_mismatched_cache_type(SYS_CTR, &reference, cache_type));

        // Smaller IminLine.
        let ctr = 0x8444_c003;
        assert!(has_mismatched_cache_type(ctr, &reference, line_size));
        assert!(!has_mismatched_cache_type(ctr, &reference, cache_type));

        // Smaller DminLine.
        let ctr = 0x8443_c004;
        assert!(has_mismatched_cache_type(ctr, &reference, line_size));
        assert!(!has_mismatched_cache_type(ctr, &reference, cache_type));
    }

    #[test]
    fn test_mismatched_cache_type() {
        let reference = CacheTypeReference::new(SYS_CTR);

        // DIC differs.
        let ctr = SYS_CTR | (1 << 29);
        assert!(has_mismatched_cache_type(
            ctr,
            &reference,
            Predicate::MismatchedCacheType
        ));
        assert!(!has_mismatched_cache_type(
            ctr,
            &reference,
            Predicate::MismatchedCacheLineSize
        ));

        // L1Ip is not strict.
        let ctr = 0x8444_8004;
        assert!(!has_mismatched_cache_type(
            ctr,
            &reference,
            Predicate::MismatchedCacheType
        ));
        assert!(!has_mismatched_cache_type(
            ctr,
            &reference,
            Predicate::MismatchedCacheLineSize
        ));

        assert!(!has_mismatched_cache_type(
            !SYS_CTR,
            &reference,
            Predicate::SsbdMitigation
        ));
    }

    fn model() -> impl Strategy<Value = Midr> {
        prop_oneof![
            Just(MIDR_CORTEX_A53),
            Just(MIDR_CORTEX_A57),
            Just(MIDR_CORTEX_A76),
            Just(MIDR_THUNDERX),
            Just(MIDR_KRYO4G),
        ]
    }

    #[test]
    fn test_range_match_property() {
        let cfg = ProptestConfig::with_cases(1000);
        proptest!(cfg, |(
            model in model(),
            other in model(),
            variant in 0..16u32,
            revision in 0..16u32,
            min in 0..=MIDR_VAR_REV_MASK,
            max in 0..=MIDR_VAR_REV_MASK
        )| {
            let midr = other.with_var_rev(variant, revision);
            let ordinal = var_rev(variant, revision);
            let expected = model == other && min <= ordinal && ordinal <= max;
            prop_assert_eq!(is_affected_midr_range(midr, model, min, max), expected);
        });
    }

    #[test]
    fn test_range_edges_property() {
        // Versions are walked as a dense index: variant in the high nibble,
        // revision in the low one.
        let at = |model: Midr, index: u32| model.with_var_rev(index >> 4, index & 0xf);
        proptest!(|(model in model(), lo in 1..0xfeu32, len in 0..0x80u32)| {
            let hi = (lo + len).min(0xfe);
            let matcher = Matcher::range(
                model,
                var_rev(lo >> 4, lo & 0xf),
                var_rev(hi >> 4, hi & 0xf),
            );

            prop_assert_eq!(matcher.matches_midr(at(model, lo)), Some(true));
            prop_assert_eq!(matcher.matches_midr(at(model, hi)), Some(true));
            prop_assert_eq!(matcher.matches_midr(at(model, lo - 1)), Some(false));
            prop_assert_eq!(matcher.matches_midr(at(model, hi + 1)), Some(false));
        });
    }

    #[test]
    fn test_all_versions_property() {
        proptest!(|(model in model(), other in model(), variant in 0..16u32, revision in 0..16u32)| {
            let matcher = Matcher::all_versions(model);
            let midr = other.with_var_rev(variant, revision);
            prop_assert_eq!(matcher.matches_midr(midr), Some(model == other));
        });
    }

    #[test]
    fn test_model_mask_ignores_unmasked_bits() {
        proptest!(|(midr in any::<u32>(), noise in any::<u32>(), model in any::<u32>())| {
            let mask = MIDR_PART_CLASS_MASK;
            let twin = Midr((midr & mask) | (noise & !mask));
            prop_assert_eq!(
                is_model_mask(Midr(midr), Midr(model), mask),
                is_model_mask(twin, Midr(model), mask)
            );
        });
    }
}
