// Copyright 2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::midr::Midr;

/// Index of a possible core, as numbered by the bring-up framework.
pub type CpuId = usize;

// ID_AA64PFR0_EL1.CSV2: branch targets trained in one context cannot be
// used speculatively in another.
pub const ID_AA64PFR0_CSV2_SHIFT: u32 = 56;

// SCTLR_EL1 trap controls for EL0 accesses.
/// EL0 access to CTR_EL0 is not trapped when set.
pub const SCTLR_EL1_UCT: u64 = 1 << 15;
/// EL0 cache maintenance by VA is not trapped when set.
pub const SCTLR_EL1_UCI: u64 = 1 << 26;

// CTR_EL0 fields.
pub const CTR_IMINLINE_SHIFT: u32 = 0;
pub const CTR_L1IP_SHIFT: u32 = 14;
pub const CTR_DMINLINE_SHIFT: u32 = 16;
pub const CTR_CACHE_MINLINE_MASK: u64 = (0xf << CTR_DMINLINE_SHIFT) | (0xf << CTR_IMINLINE_SHIFT);
/// Bits of CTR_EL0 that must agree across all cores. Only L1Ip may differ.
pub const CTR_EL0_STRICT_MASK: u64 = !(0x3 << CTR_L1IP_SHIFT);

/// Extracts the 4-bit unsigned ID register field starting at `shift`.
pub const fn feature_extract_unsigned_field(reg: u64, shift: u32) -> u64 {
    (reg >> shift) & 0xf
}

/// Access to the core this code is running on.
///
/// Every method acts on the calling core only. Implementations must not be
/// shared with, or invoked on behalf of, another core.
pub trait LocalCpu {
    /// Index of this core.
    fn id(&self) -> CpuId;

    /// Reads `MIDR_EL1`.
    fn read_midr(&self) -> Midr;

    /// Reads `ID_AA64PFR0_EL1`.
    fn read_id_aa64pfr0(&self) -> u64;

    /// Reads `CTR_EL0`.
    fn read_ctr(&self) -> u64;

    /// Whether the caller can currently be preempted or migrated.
    fn preemptible(&self) -> bool {
        false
    }

    /// Clears then sets bits in `SCTLR_EL1`.
    fn config_sctlr_el1(&self, clear: u64, set: u64);

    /// Writes `PSTATE.SSBS`. Setting the bit allows speculative store bypass.
    fn set_pstate_ssbs(&self, ssbs: bool);

    /// Overwrites the return-address predictor history with 16 `bl . + 4`.
    fn sanitize_link_stack(&self);
}
