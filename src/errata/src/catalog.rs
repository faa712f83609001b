// Copyright 2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The table of known errata and speculative execution mitigations.

use serde::Serialize;

use crate::capabilities::Capability;
use crate::matcher::{Matcher, Predicate};
#[cfg(any(
    feature = "erratum-826319",
    feature = "erratum-827319",
    feature = "erratum-824069",
    feature = "erratum-819472",
    feature = "erratum-832075",
    feature = "erratum-834220",
    feature = "erratum-845719",
    feature = "cavium-23154",
    feature = "cavium-27456",
    feature = "cavium-30115",
    feature = "falkor-1003",
    feature = "falkor-1009",
    feature = "erratum-1286807",
    feature = "erratum-858921",
    feature = "harden-branch-predictor",
    feature = "erratum-1188873"
))]
use crate::midr;

/// What to do on a core matched by a catalog entry.
///
/// Every action may run more than once on the same core and leaves the same
/// state each time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EnableAction {
    /// Trap EL0 cache maintenance instructions (clear `SCTLR_EL1.UCI`).
    TrapCacheMaintenance,
    /// Trap EL0 reads of `CTR_EL0` (clear `SCTLR_EL1.UCT`).
    TrapCtrAccess,
    /// Install the firmware branch predictor hardening callback.
    HardenBranchPredictor,
}

/// One row of the errata catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogEntry {
    /// Shown when the erratum is detected.
    pub description: Option<&'static str>,
    pub capability: Capability,
    pub matcher: Matcher,
    pub enable: Option<EnableAction>,
}

impl CatalogEntry {
    pub const fn new(capability: Capability, matcher: Matcher) -> Self {
        CatalogEntry {
            description: None,
            capability,
            matcher,
            enable: None,
        }
    }

    pub const fn with_description(mut self, description: &'static str) -> Self {
        self.description = Some(description);
        self
    }

    pub const fn with_enable(mut self, action: EnableAction) -> Self {
        self.enable = Some(action);
        self
    }

    /// Name used in log lines: the description, or the capability.
    pub fn label(&self) -> String {
        match self.description {
            Some(description) => description.to_string(),
            None => self.capability.to_string(),
        }
    }
}

/// The arm64 errata catalog, with the rows selected by the enabled features.
pub fn arm64_errata() -> Vec<CatalogEntry> {
    use Capability::*;

    let mut errata = Vec::new();

    #[cfg(any(
        feature = "erratum-826319",
        feature = "erratum-827319",
        feature = "erratum-824069"
    ))]
    // Cortex-A53 r0p[012]
    errata.push(
        CatalogEntry::new(
            WorkaroundCleanCache,
            Matcher::range(midr::MIDR_CORTEX_A53, 0x00, 0x02),
        )
        .with_description("ARM errata 826319, 827319, 824069")
        .with_enable(EnableAction::TrapCacheMaintenance),
    );

    #[cfg(feature = "erratum-819472")]
    // Cortex-A53 r0p[01]
    errata.push(
        CatalogEntry::new(
            WorkaroundCleanCache,
            Matcher::range(midr::MIDR_CORTEX_A53, 0x00, 0x01),
        )
        .with_description("ARM errata 819472")
        .with_enable(EnableAction::TrapCacheMaintenance),
    );

    #[cfg(feature = "erratum-832075")]
    // Cortex-A57 r0p0 - r1p2
    errata.push(
        CatalogEntry::new(
            WorkaroundDeviceLoadAcquire,
            Matcher::range(midr::MIDR_CORTEX_A57, midr::var_rev(0, 0), midr::var_rev(1, 2)),
        )
        .with_description("ARM erratum 832075"),
    );

    #[cfg(feature = "erratum-834220")]
    // Cortex-A57 r0p0 - r1p2
    errata.push(
        CatalogEntry::new(
            Workaround834220,
            Matcher::range(midr::MIDR_CORTEX_A57, midr::var_rev(0, 0), midr::var_rev(1, 2)),
        )
        .with_description("ARM erratum 834220"),
    );

    #[cfg(feature = "erratum-845719")]
    errata.extend([
        // Cortex-A53 r0p[01234]
        CatalogEntry::new(Workaround845719, Matcher::range(midr::MIDR_CORTEX_A53, 0x00, 0x04))
            .with_description("ARM erratum 845719"),
        // Kryo2xx Silver rAp4
        CatalogEntry::new(
            Workaround845719,
            Matcher::range(midr::MIDR_KRYO2XX_SILVER, midr::var_rev(0xa, 4), midr::var_rev(0xa, 4)),
        )
        .with_description("Kryo2xx Silver erratum 845719"),
    ]);

    #[cfg(feature = "cavium-23154")]
    // ThunderX pass 1.x
    errata.push(
        CatalogEntry::new(WorkaroundCavium23154, Matcher::range(midr::MIDR_THUNDERX, 0x00, 0x01))
            .with_description("Cavium erratum 23154"),
    );

    #[cfg(feature = "cavium-27456")]
    errata.extend([
        // ThunderX T88 pass 1.x - 2.1
        CatalogEntry::new(
            WorkaroundCavium27456,
            Matcher::range(midr::MIDR_THUNDERX, midr::var_rev(0, 0), midr::var_rev(1, 1)),
        )
        .with_description("Cavium erratum 27456"),
        // ThunderX T81 pass 1.0
        CatalogEntry::new(
            WorkaroundCavium27456,
            Matcher::range(midr::MIDR_THUNDERX_81XX, 0x00, 0x00),
        )
        .with_description("Cavium erratum 27456"),
    ]);

    #[cfg(feature = "cavium-30115")]
    errata.extend([
        // ThunderX T88 pass 1.x - 2.2
        CatalogEntry::new(
            WorkaroundCavium30115,
            Matcher::range(midr::MIDR_THUNDERX, 0x00, midr::var_rev(1, 2)),
        )
        .with_description("Cavium erratum 30115"),
        // ThunderX T81 pass 1.0 - 1.2
        CatalogEntry::new(
            WorkaroundCavium30115,
            Matcher::range(midr::MIDR_THUNDERX_81XX, 0x00, 0x02),
        )
        .with_description("Cavium erratum 30115"),
        // ThunderX T83 pass 1.0
        CatalogEntry::new(
            WorkaroundCavium30115,
            Matcher::range(midr::MIDR_THUNDERX_83XX, 0x00, 0x00),
        )
        .with_description("Cavium erratum 30115"),
    ]);

    errata.extend([
        CatalogEntry::new(
            MismatchedCacheLineSize,
            Matcher::Custom(Predicate::MismatchedCacheLineSize),
        )
        .with_description("Mismatched cache line size")
        .with_enable(EnableAction::TrapCtrAccess),
        CatalogEntry::new(
            MismatchedCacheType,
            Matcher::Custom(Predicate::MismatchedCacheType),
        )
        .with_description("Mismatched cache type")
        .with_enable(EnableAction::TrapCtrAccess),
    ]);

    #[cfg(feature = "falkor-1003")]
    errata.extend([
        CatalogEntry::new(
            WorkaroundQcomFalkorE1003,
            Matcher::range(midr::MIDR_QCOM_FALKOR_V1, midr::var_rev(0, 0), midr::var_rev(0, 0)),
        )
        .with_description("Qualcomm Technologies Falkor erratum 1003"),
        CatalogEntry::new(
            WorkaroundQcomFalkorE1003,
            Matcher::ModelMask {
                model: midr::MIDR_QCOM_KRYO,
                mask: crate::matcher::MIDR_PART_CLASS_MASK,
            },
        )
        .with_description("Qualcomm Technologies Kryo erratum 1003"),
    ]);

    #[cfg(feature = "falkor-1009")]
    errata.push(
        CatalogEntry::new(
            WorkaroundRepeatTlbi,
            Matcher::range(midr::MIDR_QCOM_FALKOR_V1, midr::var_rev(0, 0), midr::var_rev(0, 0)),
        )
        .with_description("Qualcomm Technologies Falkor erratum 1009"),
    );

    #[cfg(feature = "erratum-1286807")]
    errata.extend([
        // Cortex-A76 r0p0 to r3p0
        CatalogEntry::new(
            WorkaroundRepeatTlbi,
            Matcher::range(midr::MIDR_CORTEX_A76, midr::var_rev(0, 0), midr::var_rev(3, 0)),
        )
        .with_description("ARM erratum 1286807"),
        CatalogEntry::new(
            WorkaroundRepeatTlbi,
            Matcher::range(midr::MIDR_KRYO4G, midr::var_rev(12, 14), midr::var_rev(13, 14)),
        ),
    ]);

    #[cfg(feature = "erratum-858921")]
    errata.extend([
        // Cortex-A73 all versions
        CatalogEntry::new(Workaround858921, Matcher::all_versions(midr::MIDR_CORTEX_A73))
            .with_description("ARM erratum 858921"),
        // Kryo2xx Gold all versions
        CatalogEntry::new(Workaround858921, Matcher::all_versions(midr::MIDR_KRYO2XX_GOLD))
            .with_description("ARM erratum 858921"),
    ]);

    #[cfg(feature = "harden-branch-predictor")]
    errata.extend(
        [
            Matcher::all_versions(midr::MIDR_CORTEX_A57),
            Matcher::all_versions(midr::MIDR_CORTEX_A72),
            Matcher::all_versions(midr::MIDR_CORTEX_A73),
            Matcher::all_versions(midr::MIDR_CORTEX_A75),
            Matcher::all_versions(midr::MIDR_BRCM_VULCAN),
            Matcher::all_versions(midr::MIDR_CAVIUM_THUNDERX2),
            Matcher::range(midr::MIDR_KRYO4G, midr::var_rev(12, 14), midr::var_rev(13, 14)),
            Matcher::all_versions(midr::MIDR_KRYO2XX_GOLD),
        ]
        .map(|matcher| {
            CatalogEntry::new(HardenBranchPredictor, matcher)
                .with_enable(EnableAction::HardenBranchPredictor)
        }),
    );

    #[cfg(feature = "ssbd")]
    errata.push(
        CatalogEntry::new(Ssbd, Matcher::Custom(Predicate::SsbdMitigation))
            .with_description("Speculative Store Bypass Disable"),
    );

    #[cfg(feature = "erratum-1188873")]
    errata.extend([
        // Cortex-A76 r0p0 to r2p0
        CatalogEntry::new(
            Workaround1188873,
            Matcher::range(midr::MIDR_CORTEX_A76, midr::var_rev(0, 0), midr::var_rev(2, 0)),
        )
        .with_description("ARM erratum 1188873"),
        // Kryo-4G r15p14
        CatalogEntry::new(
            Workaround1188873,
            Matcher::range(midr::MIDR_KRYO4G, midr::var_rev(15, 14), midr::var_rev(15, 15)),
        )
        .with_description("ARM erratum 1188873"),
    ]);

    errata
}
