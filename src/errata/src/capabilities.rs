// Copyright 2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::cpu::CpuId;

/// What a detected erratum or mitigation means for the rest of the system.
///
/// Several catalog entries may resolve to the same capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum Capability {
    WorkaroundCleanCache,
    WorkaroundDeviceLoadAcquire,
    Workaround834220,
    Workaround845719,
    WorkaroundCavium23154,
    WorkaroundCavium27456,
    WorkaroundCavium30115,
    MismatchedCacheLineSize,
    MismatchedCacheType,
    WorkaroundQcomFalkorE1003,
    WorkaroundRepeatTlbi,
    Workaround858921,
    HardenBranchPredictor,
    Ssbd,
    Workaround1188873,
    /// Hardware speculative store bypass safe bit (`PSTATE.SSBS`). Detected by
    /// the feature scan, only consumed here.
    Ssbs,
}

impl Capability {
    const fn bit(self) -> u64 {
        1 << (self as u8)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Where detected capabilities are recorded.
pub trait CapabilitySink: Send + Sync {
    /// Records `capability` for `cpu`. Returns `false` if it was already present.
    fn register(&self, cpu: CpuId, capability: Capability) -> bool;

    /// Whether `cpu` has `capability`.
    fn has_cap(&self, cpu: CpuId, capability: Capability) -> bool;
}

/// Per-core capability bitmaps.
#[derive(Debug)]
pub struct CpuCapabilities {
    cpus: Vec<AtomicU64>,
}

impl CpuCapabilities {
    /// Creates empty bitmaps for `possible_cpus` cores.
    pub fn new(possible_cpus: usize) -> Self {
        CpuCapabilities {
            cpus: (0..possible_cpus).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    /// Whether any core has `capability`.
    pub fn system_has_cap(&self, capability: Capability) -> bool {
        self.cpus
            .iter()
            .any(|caps| caps.load(Ordering::Acquire) & capability.bit() != 0)
    }
}

impl CapabilitySink for CpuCapabilities {
    fn register(&self, cpu: CpuId, capability: Capability) -> bool {
        match self.cpus.get(cpu) {
            Some(caps) => caps.fetch_or(capability.bit(), Ordering::AcqRel) & capability.bit() == 0,
            None => false,
        }
    }

    fn has_cap(&self, cpu: CpuId, capability: Capability) -> bool {
        self.cpus
            .get(cpu)
            .is_some_and(|caps| caps.load(Ordering::Acquire) & capability.bit() != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_registration_wins() {
        let caps = CpuCapabilities::new(2);
        assert!(caps.register(0, Capability::Workaround845719));
        assert!(!caps.register(0, Capability::Workaround845719));
        assert!(caps.has_cap(0, Capability::Workaround845719));
        assert!(!caps.has_cap(1, Capability::Workaround845719));
        assert!(caps.system_has_cap(Capability::Workaround845719));
        assert!(!caps.system_has_cap(Capability::Ssbd));
    }

    #[test]
    fn test_out_of_range_cpu() {
        let caps = CpuCapabilities::new(1);
        assert!(!caps.register(4, Capability::Ssbd));
        assert!(!caps.has_cap(4, Capability::Ssbd));
    }

    #[test]
    fn test_bits_are_distinct() {
        assert_ne!(Capability::Ssbd.bit(), Capability::Ssbs.bit());
        assert_eq!(Capability::WorkaroundCleanCache.bit(), 1);
        assert_eq!(Capability::Ssbd.to_string(), "Ssbd");
    }
}
