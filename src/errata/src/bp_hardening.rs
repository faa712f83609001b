// Copyright 2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Branch predictor hardening (Spectre variant 2).
//!
//! Affected cores get a callback run on every exit from a lower exception
//! level. When the callback reaches firmware through `SMC`, the hypervisor
//! vectors used for guests also need the call, so a copy of the vector code is
//! placed in one of a few 2 KiB slots of a reserved region. Cores sharing a
//! callback share its slot.

use std::fmt;
use std::ops::Range;
use std::sync::Mutex;

use log::{debug, info};
use serde::Serialize;

use crate::catalog::CatalogEntry;
use crate::cpu::{ID_AA64PFR0_CSV2_SHIFT, LocalCpu, feature_extract_unsigned_field};
use crate::matcher::Scope;
use crate::metrics::IncMetric;
use crate::midr::{MIDR_QCOM_FALKOR, MIDR_QCOM_FALKOR_V1};
use crate::percpu::BpHardeningData;
use crate::smccc::{self, ARM_SMCCC_ARCH_WORKAROUND_1, Conduit, FirmwareTransport, SmcccVersion};
use crate::{Errata, Platform};

/// Size of one hypervisor vector slot.
pub const BP_HARDEN_SLOT_SIZE: usize = 0x800;
/// Distance between two exception vector entries.
pub const VECTOR_ENTRY_SIZE: usize = 0x80;

/// Prologue calling `SMCCC_ARCH_WORKAROUND_1` from a hypervisor vector entry,
/// preserving x0-x3:
///
/// ```text
/// sub  sp, sp, #(8 * 4)
/// stp  x2, x3, [sp, #(8 * 0)]
/// stp  x0, x1, [sp, #(8 * 2)]
/// mov  w0, #ARM_SMCCC_ARCH_WORKAROUND_1
/// smc  #0
/// ldp  x2, x3, [sp, #(8 * 0)]
/// ldp  x0, x1, [sp, #(8 * 2)]
/// add  sp, sp, #(8 * 4)
/// ```
const SMCCC_WORKAROUND_1_SMC_INSNS: [u32; 8] = [
    0xd100_83ff,
    0xa900_0fe2,
    0xa901_07e0,
    0x3201_83e0,
    0xd400_0003,
    0xa940_0fe2,
    0xa941_07e0,
    0x9100_83ff,
];

const fn insns_to_bytes<const N: usize, const B: usize>(insns: [u32; N]) -> [u8; B] {
    let mut bytes = [0u8; B];
    let mut i = 0;
    while i < N {
        let le = insns[i].to_le_bytes();
        bytes[i * 4] = le[0];
        bytes[i * 4 + 1] = le[1];
        bytes[i * 4 + 2] = le[2];
        bytes[i * 4 + 3] = le[3];
        i += 1;
    }
    bytes
}

/// Encoded form of the `SMCCC_ARCH_WORKAROUND_1` vector prologue.
pub static SMCCC_WORKAROUND_1_SMC: [u8; 32] = insns_to_bytes(SMCCC_WORKAROUND_1_SMC_INSNS);

/// Errors while installing branch predictor hardening.
#[derive(Debug, thiserror::Error, displaydoc::Display, PartialEq, Eq)]
pub enum BpHardeningError {
    /// No hypervisor vector slot left for {callback}: all {slots} slots are in use.
    SlotsExhausted {
        callback: HardeningCallback,
        slots: usize,
    },
    /// Vector code of {0} bytes does not fit in a 0x80 byte vector entry.
    VectorCodeTooLarge(usize),
    /// Failed to record hardening state: {0}
    PerCpu(#[from] crate::percpu::PerCpuError),
}

/// The hardening sequence run by a core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum HardeningCallback {
    /// `SMCCC_ARCH_WORKAROUND_1` through `SMC`.
    SmcWorkaround1,
    /// `SMCCC_ARCH_WORKAROUND_1` through `HVC`.
    HvcWorkaround1,
    /// Return stack overwrite for Falkor.
    LinkStackSanitization,
}

impl HardeningCallback {
    /// Runs the hardening sequence on the calling core.
    pub fn invoke(self, cpu: &dyn LocalCpu, firmware: &dyn FirmwareTransport) {
        match self {
            HardeningCallback::SmcWorkaround1 => {
                firmware.smc(ARM_SMCCC_ARCH_WORKAROUND_1, &[]);
            }
            HardeningCallback::HvcWorkaround1 => {
                firmware.hvc(ARM_SMCCC_ARCH_WORKAROUND_1, &[]);
            }
            HardeningCallback::LinkStackSanitization => cpu.sanitize_link_stack(),
        }
    }
}

impl fmt::Display for HardeningCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HardeningCallback::SmcWorkaround1 => write!(f, "SMC workaround 1"),
            HardeningCallback::HvcWorkaround1 => write!(f, "HVC workaround 1"),
            HardeningCallback::LinkStackSanitization => write!(f, "link stack sanitization"),
        }
    }
}

/// The reserved hypervisor vector region.
pub trait VectorMemory: Send + fmt::Debug {
    /// Size of the region in bytes.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies `data` at `offset`. Callers keep the write inside `0..len()`.
    fn write(&mut self, offset: usize, data: &[u8]);

    /// Makes the instructions in `range` visible to instruction fetch on all cores.
    fn flush_icache(&mut self, range: Range<usize>);

    /// Current contents of the region.
    fn as_bytes(&self) -> &[u8];
}

impl VectorMemory for Vec<u8> {
    fn len(&self) -> usize {
        Vec::len(self)
    }

    fn write(&mut self, offset: usize, data: &[u8]) {
        self[offset..offset + data.len()].copy_from_slice(data);
    }

    // Plain memory has no instruction stream to synchronise.
    fn flush_icache(&mut self, _range: Range<usize>) {}

    fn as_bytes(&self) -> &[u8] {
        self
    }
}

#[derive(Debug)]
struct SlotAllocator {
    mem: Box<dyn VectorMemory>,
    last_slot: Option<usize>,
}

impl SlotAllocator {
    fn capacity(&self) -> usize {
        self.mem.len() / BP_HARDEN_SLOT_SIZE
    }

    /// Fills `slot` with `code` repeated at every vector entry.
    fn copy_vectors(&mut self, slot: usize, code: &[u8]) {
        let base = slot * BP_HARDEN_SLOT_SIZE;
        for entry in (0..BP_HARDEN_SLOT_SIZE).step_by(VECTOR_ENTRY_SIZE) {
            self.mem.write(base + entry, code);
        }
        self.mem.flush_icache(base..base + BP_HARDEN_SLOT_SIZE);
    }
}

/// Hypervisor vector slots shared by all cores.
#[derive(Debug)]
pub struct HypVectors {
    // Guards the next free slot, the region and the scan of other cores'
    // callbacks, which must happen as one step.
    inner: Mutex<SlotAllocator>,
}

impl HypVectors {
    pub fn new(mem: Box<dyn VectorMemory>) -> Self {
        HypVectors {
            inner: Mutex::new(SlotAllocator {
                mem,
                last_slot: None,
            }),
        }
    }

    /// Number of slots the region can hold.
    pub fn capacity(&self) -> usize {
        crate::extract_guard(self.inner.lock()).capacity()
    }

    /// Number of slots handed out so far.
    pub fn allocated(&self) -> usize {
        crate::extract_guard(self.inner.lock())
            .last_slot
            .map_or(0, |slot| slot + 1)
    }

    /// Copy of the contents of `slot`, if it is inside the region.
    pub fn slot_contents(&self, slot: usize) -> Option<Vec<u8>> {
        let inner = crate::extract_guard(self.inner.lock());
        let start = slot.checked_mul(BP_HARDEN_SLOT_SIZE)?;
        inner
            .mem
            .as_bytes()
            .get(start..start + BP_HARDEN_SLOT_SIZE)
            .map(<[u8]>::to_vec)
    }
}

impl Errata {
    /// Records `callback` as the branch predictor hardening of the calling core.
    ///
    /// Does nothing when `entry` does not match the core or when the core
    /// reports CSV2. With `vector_code` and hypervisor vectors available, the
    /// code is installed in the slot owned by `callback`, allocating one if no
    /// core uses `callback` yet.
    pub fn install_bp_hardening_cb(
        &self,
        entry: &CatalogEntry,
        platform: &Platform<'_>,
        callback: HardeningCallback,
        vector_code: Option<&[u8]>,
    ) -> Result<Option<BpHardeningData>, BpHardeningError> {
        self.check_scope(Scope::LocalCpu, platform.cpu);
        self.install_hardening(entry, platform, callback, vector_code)
    }

    fn install_hardening(
        &self,
        entry: &CatalogEntry,
        platform: &Platform<'_>,
        callback: HardeningCallback,
        vector_code: Option<&[u8]>,
    ) -> Result<Option<BpHardeningData>, BpHardeningError> {
        let cpu = platform.cpu;
        if !self.applies(entry, platform) {
            return Ok(None);
        }

        let pfr0 = cpu.read_id_aa64pfr0();
        if feature_extract_unsigned_field(pfr0, ID_AA64PFR0_CSV2_SHIFT) != 0 {
            debug!("CPU{}: CSV2 present, skipping branch predictor hardening", cpu.id());
            self.metrics.bp_hardening_not_needed.inc();
            return Ok(None);
        }

        if let Some(code) = vector_code {
            if code.len() > VECTOR_ENTRY_SIZE {
                return Err(BpHardeningError::VectorCodeTooLarge(code.len()));
            }
        }

        let data = match (&self.hyp_vectors, vector_code) {
            (Some(vectors), Some(code)) => {
                let mut inner = crate::extract_guard(vectors.inner.lock());
                let slot = match platform.percpu.find_callback(callback).flatten() {
                    Some(slot) => {
                        self.metrics.bp_slots_reused.inc();
                        slot
                    }
                    None => {
                        let slot = inner.last_slot.map_or(0, |last| last + 1);
                        if slot >= inner.capacity() {
                            return Err(BpHardeningError::SlotsExhausted {
                                callback,
                                slots: inner.capacity(),
                            });
                        }
                        inner.last_slot = Some(slot);
                        inner.copy_vectors(slot, code);
                        self.metrics.bp_slots_allocated.inc();
                        info!("Allocated hypervisor vector slot {slot} for {callback}");
                        slot
                    }
                };
                let data = BpHardeningData {
                    slot: Some(slot),
                    callback,
                };
                platform
                    .percpu
                    .update(cpu.id(), |state| state.bp_hardening = Some(data))?;
                data
            }
            // Nothing to patch: guests and hosts without hypervisor vectors
            // only need the callback.
            _ => {
                let data = BpHardeningData {
                    slot: None,
                    callback,
                };
                platform
                    .percpu
                    .update(cpu.id(), |state| state.bp_hardening = Some(data))?;
                data
            }
        };

        Ok(Some(data))
    }

    /// Selects the firmware based branch predictor hardening for the calling
    /// core and installs it.
    ///
    /// Runs as the enable action of an entry that already matched, so the
    /// scope is not checked again.
    pub(crate) fn enable_smccc_arch_workaround_1(
        &self,
        entry: &CatalogEntry,
        platform: &Platform<'_>,
    ) -> Result<Option<BpHardeningData>, BpHardeningError> {
        let cpu = platform.cpu;
        let firmware = platform.firmware;
        let midr = cpu.read_midr();

        if !self.applies(entry, platform) {
            return Ok(None);
        }

        if firmware.smccc_version() == SmcccVersion::V1_0 {
            return Ok(None);
        }

        let conduit = firmware.conduit();
        let supported = smccc::arch_features(firmware, ARM_SMCCC_ARCH_WORKAROUND_1)
            .is_some_and(|res| res >= 0);
        if !supported {
            return Ok(None);
        }

        let (mut callback, vector_code): (_, Option<&[u8]>) = match conduit {
            // We are a guest, the hypervisor vectors are not ours to patch.
            Conduit::Hvc => (HardeningCallback::HvcWorkaround1, None),
            Conduit::Smc => (
                HardeningCallback::SmcWorkaround1,
                Some(&SMCCC_WORKAROUND_1_SMC[..]),
            ),
            Conduit::None => return Ok(None),
        };

        if midr.model() == MIDR_QCOM_FALKOR.model() || midr.model() == MIDR_QCOM_FALKOR_V1.model()
        {
            callback = HardeningCallback::LinkStackSanitization;
        }

        self.install_hardening(entry, platform, callback, vector_code)
    }
}
