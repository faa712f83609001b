// Copyright 2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Layout of the Main ID Register (`MIDR_EL1`) and the processor models
//! referenced by the errata catalog.

use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Serializer};

// Field layout, from the Arm ARM description of MIDR_EL1.
pub const MIDR_REVISION_SHIFT: u32 = 0;
pub const MIDR_REVISION_MASK: u32 = 0xf << MIDR_REVISION_SHIFT;
pub const MIDR_PARTNUM_SHIFT: u32 = 4;
pub const MIDR_PARTNUM_MASK: u32 = 0xfff << MIDR_PARTNUM_SHIFT;
pub const MIDR_ARCHITECTURE_SHIFT: u32 = 16;
pub const MIDR_ARCHITECTURE_MASK: u32 = 0xf << MIDR_ARCHITECTURE_SHIFT;
pub const MIDR_VARIANT_SHIFT: u32 = 20;
pub const MIDR_VARIANT_MASK: u32 = 0xf << MIDR_VARIANT_SHIFT;
pub const MIDR_IMPLEMENTOR_SHIFT: u32 = 24;
pub const MIDR_IMPLEMENTOR_MASK: u32 = 0xff << MIDR_IMPLEMENTOR_SHIFT;

/// Bits identifying a processor model: implementer, architecture and part number.
pub const MIDR_CPU_MODEL_MASK: u32 =
    MIDR_IMPLEMENTOR_MASK | MIDR_PARTNUM_MASK | MIDR_ARCHITECTURE_MASK;
/// Bits identifying a model revision: variant and revision.
pub const MIDR_VAR_REV_MASK: u32 = MIDR_VARIANT_MASK | MIDR_REVISION_MASK;

pub const ARM_CPU_IMP_ARM: u32 = 0x41;
pub const ARM_CPU_IMP_BRCM: u32 = 0x42;
pub const ARM_CPU_IMP_CAVIUM: u32 = 0x43;
pub const ARM_CPU_IMP_QCOM: u32 = 0x51;

pub const ARM_CPU_PART_CORTEX_A53: u32 = 0xd03;
pub const ARM_CPU_PART_CORTEX_A57: u32 = 0xd07;
pub const ARM_CPU_PART_CORTEX_A72: u32 = 0xd08;
pub const ARM_CPU_PART_CORTEX_A73: u32 = 0xd09;
pub const ARM_CPU_PART_CORTEX_A75: u32 = 0xd0a;
pub const ARM_CPU_PART_CORTEX_A76: u32 = 0xd0b;

pub const BRCM_CPU_PART_VULCAN: u32 = 0x516;

pub const CAVIUM_CPU_PART_THUNDERX: u32 = 0x0a1;
pub const CAVIUM_CPU_PART_THUNDERX_81XX: u32 = 0x0a2;
pub const CAVIUM_CPU_PART_THUNDERX_83XX: u32 = 0x0a3;
pub const CAVIUM_CPU_PART_THUNDERX2: u32 = 0x0af;

pub const QCOM_CPU_PART_FALKOR_V1: u32 = 0x800;
pub const QCOM_CPU_PART_FALKOR: u32 = 0xc00;
pub const QCOM_CPU_PART_KRYO: u32 = 0x200;
pub const QCOM_CPU_PART_KRYO2XX_GOLD: u32 = 0x800;
pub const QCOM_CPU_PART_KRYO2XX_SILVER: u32 = 0x801;
pub const QCOM_CPU_PART_KRYO4G: u32 = 0x804;

pub const MIDR_CORTEX_A53: Midr = Midr::cpu_model(ARM_CPU_IMP_ARM, ARM_CPU_PART_CORTEX_A53);
pub const MIDR_CORTEX_A57: Midr = Midr::cpu_model(ARM_CPU_IMP_ARM, ARM_CPU_PART_CORTEX_A57);
pub const MIDR_CORTEX_A72: Midr = Midr::cpu_model(ARM_CPU_IMP_ARM, ARM_CPU_PART_CORTEX_A72);
pub const MIDR_CORTEX_A73: Midr = Midr::cpu_model(ARM_CPU_IMP_ARM, ARM_CPU_PART_CORTEX_A73);
pub const MIDR_CORTEX_A75: Midr = Midr::cpu_model(ARM_CPU_IMP_ARM, ARM_CPU_PART_CORTEX_A75);
pub const MIDR_CORTEX_A76: Midr = Midr::cpu_model(ARM_CPU_IMP_ARM, ARM_CPU_PART_CORTEX_A76);
pub const MIDR_BRCM_VULCAN: Midr = Midr::cpu_model(ARM_CPU_IMP_BRCM, BRCM_CPU_PART_VULCAN);
pub const MIDR_THUNDERX: Midr = Midr::cpu_model(ARM_CPU_IMP_CAVIUM, CAVIUM_CPU_PART_THUNDERX);
pub const MIDR_THUNDERX_81XX: Midr =
    Midr::cpu_model(ARM_CPU_IMP_CAVIUM, CAVIUM_CPU_PART_THUNDERX_81XX);
pub const MIDR_THUNDERX_83XX: Midr =
    Midr::cpu_model(ARM_CPU_IMP_CAVIUM, CAVIUM_CPU_PART_THUNDERX_83XX);
pub const MIDR_CAVIUM_THUNDERX2: Midr =
    Midr::cpu_model(ARM_CPU_IMP_CAVIUM, CAVIUM_CPU_PART_THUNDERX2);
pub const MIDR_QCOM_FALKOR_V1: Midr = Midr::cpu_model(ARM_CPU_IMP_QCOM, QCOM_CPU_PART_FALKOR_V1);
pub const MIDR_QCOM_FALKOR: Midr = Midr::cpu_model(ARM_CPU_IMP_QCOM, QCOM_CPU_PART_FALKOR);
pub const MIDR_QCOM_KRYO: Midr = Midr::cpu_model(ARM_CPU_IMP_QCOM, QCOM_CPU_PART_KRYO);
pub const MIDR_KRYO2XX_GOLD: Midr = Midr::cpu_model(ARM_CPU_IMP_QCOM, QCOM_CPU_PART_KRYO2XX_GOLD);
pub const MIDR_KRYO2XX_SILVER: Midr =
    Midr::cpu_model(ARM_CPU_IMP_QCOM, QCOM_CPU_PART_KRYO2XX_SILVER);
pub const MIDR_KRYO4G: Midr = Midr::cpu_model(ARM_CPU_IMP_QCOM, QCOM_CPU_PART_KRYO4G);

/// Builds the composite variant:revision ordinal used by range matching.
pub const fn var_rev(variant: u32, revision: u32) -> u32 {
    ((variant << MIDR_VARIANT_SHIFT) & MIDR_VARIANT_MASK)
        | ((revision << MIDR_REVISION_SHIFT) & MIDR_REVISION_MASK)
}

/// Errors while parsing a textual `MIDR_EL1` value.
#[derive(Debug, thiserror::Error, displaydoc::Display, PartialEq, Eq)]
pub enum MidrParseError {
    /// Invalid MIDR_EL1 value `{0}`: {1}
    InvalidValue(String, std::num::ParseIntError),
    /// MIDR_EL1 value `{0}` has bits set above bit 31
    Overflow(String),
}

/// Identity of a processor core, as read from `MIDR_EL1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Midr(pub u32);

impl Midr {
    /// Identity of `part_num` from `implementer`, with the architecture field set to
    /// "defined by ID registers" and variant/revision cleared.
    pub const fn cpu_model(implementer: u32, part_num: u32) -> Self {
        Midr(
            ((implementer << MIDR_IMPLEMENTOR_SHIFT) & MIDR_IMPLEMENTOR_MASK)
                | ((0xf << MIDR_ARCHITECTURE_SHIFT) & MIDR_ARCHITECTURE_MASK)
                | ((part_num << MIDR_PARTNUM_SHIFT) & MIDR_PARTNUM_MASK),
        )
    }

    /// Same model with the given variant and revision.
    pub const fn with_var_rev(self, variant: u32, revision: u32) -> Self {
        Midr((self.0 & !MIDR_VAR_REV_MASK) | var_rev(variant, revision))
    }

    pub const fn implementer(self) -> u32 {
        (self.0 & MIDR_IMPLEMENTOR_MASK) >> MIDR_IMPLEMENTOR_SHIFT
    }

    pub const fn variant(self) -> u32 {
        (self.0 & MIDR_VARIANT_MASK) >> MIDR_VARIANT_SHIFT
    }

    pub const fn architecture(self) -> u32 {
        (self.0 & MIDR_ARCHITECTURE_MASK) >> MIDR_ARCHITECTURE_SHIFT
    }

    pub const fn part_num(self) -> u32 {
        (self.0 & MIDR_PARTNUM_MASK) >> MIDR_PARTNUM_SHIFT
    }

    pub const fn revision(self) -> u32 {
        (self.0 & MIDR_REVISION_MASK) >> MIDR_REVISION_SHIFT
    }

    /// Implementer, architecture and part number, with variant/revision masked out.
    pub const fn model(self) -> u32 {
        self.0 & MIDR_CPU_MODEL_MASK
    }

    /// The variant:revision composite ordinal, still in register position.
    pub const fn var_rev(self) -> u32 {
        self.0 & MIDR_VAR_REV_MASK
    }

    /// Whether this identity is `model` with a variant:revision inside `[min, max]`.
    pub const fn is_cpu_model_range(self, model: Midr, min: u32, max: u32) -> bool {
        let rv = self.var_rev();
        self.model() == model.model() && rv >= min && rv <= max
    }
}

impl fmt::Display for Midr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl Serialize for Midr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl FromStr for Midr {
    type Err = MidrParseError;

    /// Accepts the hexadecimal form exported by sysfs (`0x00000000410fd034`),
    /// with or without the `0x` prefix.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        let value = u64::from_str_radix(digits, 16)
            .map_err(|err| MidrParseError::InvalidValue(s.to_string(), err))?;
        u32::try_from(value)
            .map(Midr)
            .map_err(|_| MidrParseError::Overflow(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_extraction() {
        // Cortex-A53 r0p4.
        let midr = Midr(0x410f_d034);
        assert_eq!(midr.implementer(), ARM_CPU_IMP_ARM);
        assert_eq!(midr.variant(), 0);
        assert_eq!(midr.architecture(), 0xf);
        assert_eq!(midr.part_num(), ARM_CPU_PART_CORTEX_A53);
        assert_eq!(midr.revision(), 4);
        assert_eq!(midr.model(), MIDR_CORTEX_A53.0);
        assert_eq!(midr.var_rev(), 4);
    }

    #[test]
    fn test_var_rev() {
        assert_eq!(var_rev(0, 0), 0);
        assert_eq!(var_rev(1, 2), 0x0010_0002);
        assert_eq!(var_rev(0xa, 4), 0x00a0_0004);
        // Out of range fields are clipped to their width.
        assert_eq!(var_rev(0x1f, 0x1f), MIDR_VAR_REV_MASK);

        let midr = MIDR_KRYO2XX_SILVER.with_var_rev(0xa, 4);
        assert_eq!(midr.0, 0x51af_8014);
    }

    #[test]
    fn test_is_cpu_model_range() {
        let a57_r1p2 = MIDR_CORTEX_A57.with_var_rev(1, 2);
        assert!(a57_r1p2.is_cpu_model_range(MIDR_CORTEX_A57, var_rev(0, 0), var_rev(1, 2)));
        assert!(!a57_r1p2.is_cpu_model_range(MIDR_CORTEX_A57, var_rev(0, 0), var_rev(1, 1)));
        assert!(!a57_r1p2.is_cpu_model_range(MIDR_CORTEX_A72, 0, MIDR_VAR_REV_MASK));
    }

    #[test]
    fn test_parse_midr() {
        assert_eq!(
            "0x00000000410fd034\n".parse::<Midr>().unwrap(),
            Midr(0x410f_d034)
        );
        assert_eq!("410FD034".parse::<Midr>().unwrap(), Midr(0x410f_d034));
        assert_eq!(
            "0x1410fd034".parse::<Midr>().unwrap_err(),
            MidrParseError::Overflow("0x1410fd034".to_string())
        );
        assert!(matches!(
            "midr".parse::<Midr>().unwrap_err(),
            MidrParseError::InvalidValue(..)
        ));
    }

    #[test]
    fn test_display() {
        assert_eq!(MIDR_CORTEX_A76.to_string(), "0x410fd0b0");
        assert_eq!(
            serde_json::to_string(&MIDR_CORTEX_A76).unwrap(),
            "\"0x410fd0b0\""
        );
    }
}
