// Copyright 2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::cell::Cell;
use std::collections::HashMap;
use std::ops::Range;
use std::sync::{Arc, Mutex};

use crate::Errata;
use crate::bp_hardening::VectorMemory;
use crate::catalog::CatalogEntry;
use crate::config::MitigationConfig;
use crate::cpu::{CpuId, LocalCpu, SCTLR_EL1_UCI, SCTLR_EL1_UCT};
use crate::matcher::CacheTypeReference;
use crate::midr::Midr;
use crate::smccc::{
    ARM_SMCCC_ARCH_FEATURES_FUNC_ID, Conduit, FirmwareTransport, SMCCC_RET_NOT_SUPPORTED,
    SmcccVersion,
};

/// `CTR_EL0` of the boot core in tests.
pub const SYS_CTR: u64 = 0x8444_c004;

/// Engine with the default policy and [`SYS_CTR`] as the system cache type.
pub fn test_errata(catalog: Vec<CatalogEntry>) -> Errata {
    Errata::new(
        catalog,
        &MitigationConfig::default(),
        CacheTypeReference::new(SYS_CTR),
    )
}

#[derive(Debug)]
pub struct MockCpu {
    id: CpuId,
    midr: Midr,
    pfr0: u64,
    ctr: u64,
    preemptible: bool,
    sctlr: Cell<u64>,
    sctlr_writes: Cell<usize>,
    ssbs: Cell<Option<bool>>,
    link_stack_sanitizations: Cell<usize>,
}

impl MockCpu {
    pub fn new(id: CpuId, midr: Midr) -> Self {
        MockCpu {
            id,
            midr,
            pfr0: 0,
            ctr: SYS_CTR,
            preemptible: false,
            // EL0 cache maintenance and CTR_EL0 reads allowed at reset.
            sctlr: Cell::new(SCTLR_EL1_UCI | SCTLR_EL1_UCT | 1),
            sctlr_writes: Cell::new(0),
            ssbs: Cell::new(None),
            link_stack_sanitizations: Cell::new(0),
        }
    }

    pub fn with_pfr0(mut self, pfr0: u64) -> Self {
        self.pfr0 = pfr0;
        self
    }

    pub fn with_ctr(mut self, ctr: u64) -> Self {
        self.ctr = ctr;
        self
    }

    pub fn preemptible(mut self) -> Self {
        self.preemptible = true;
        self
    }

    pub fn sctlr(&self) -> u64 {
        self.sctlr.get()
    }

    pub fn sctlr_writes(&self) -> usize {
        self.sctlr_writes.get()
    }

    pub fn ssbs(&self) -> Option<bool> {
        self.ssbs.get()
    }

    pub fn link_stack_sanitizations(&self) -> usize {
        self.link_stack_sanitizations.get()
    }
}

impl LocalCpu for MockCpu {
    fn id(&self) -> CpuId {
        self.id
    }

    fn read_midr(&self) -> Midr {
        self.midr
    }

    fn read_id_aa64pfr0(&self) -> u64 {
        self.pfr0
    }

    fn read_ctr(&self) -> u64 {
        self.ctr
    }

    fn preemptible(&self) -> bool {
        self.preemptible
    }

    fn config_sctlr_el1(&self, clear: u64, set: u64) {
        self.sctlr.set((self.sctlr.get() & !clear) | set);
        self.sctlr_writes.set(self.sctlr_writes.get() + 1);
    }

    fn set_pstate_ssbs(&self, ssbs: bool) {
        self.ssbs.set(Some(ssbs));
    }

    fn sanitize_link_stack(&self) {
        self.link_stack_sanitizations
            .set(self.link_stack_sanitizations.get() + 1);
    }
}

pub type FirmwareCall = (Conduit, u32, Vec<u64>);

/// Firmware answering `SMCCC_ARCH_FEATURES` from a table and recording calls.
#[derive(Debug)]
pub struct MockFirmware {
    version: SmcccVersion,
    conduit: Conduit,
    features: HashMap<u32, i32>,
    calls: Mutex<Vec<FirmwareCall>>,
}

impl MockFirmware {
    pub fn new(conduit: Conduit) -> Self {
        MockFirmware {
            version: SmcccVersion::V1_1,
            conduit,
            features: HashMap::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_version(mut self, version: SmcccVersion) -> Self {
        self.version = version;
        self
    }

    pub fn with_feature(mut self, function_id: u32, answer: i32) -> Self {
        self.features.insert(function_id, answer);
        self
    }

    pub fn calls(&self) -> Vec<FirmwareCall> {
        self.calls.lock().unwrap().clone()
    }

    fn handle(&self, conduit: Conduit, function_id: u32, args: &[u64]) -> u64 {
        self.calls
            .lock()
            .unwrap()
            .push((conduit, function_id, args.to_vec()));
        if function_id != ARM_SMCCC_ARCH_FEATURES_FUNC_ID {
            return 0;
        }
        let answer = args
            .first()
            .and_then(|func| u32::try_from(*func).ok())
            .and_then(|func| self.features.get(&func).copied())
            .unwrap_or(SMCCC_RET_NOT_SUPPORTED);
        // Sign extended into x0.
        i64::from(answer) as u64
    }
}

impl FirmwareTransport for MockFirmware {
    fn smccc_version(&self) -> SmcccVersion {
        self.version
    }

    fn conduit(&self) -> Conduit {
        self.conduit
    }

    fn hvc(&self, function_id: u32, args: &[u64]) -> u64 {
        self.handle(Conduit::Hvc, function_id, args)
    }

    fn smc(&self, function_id: u32, args: &[u64]) -> u64 {
        self.handle(Conduit::Smc, function_id, args)
    }
}

/// I-cache flushes seen by a [`RecordingVectors`].
#[derive(Debug, Clone, Default)]
pub struct FlushLog(Arc<Mutex<Vec<Range<usize>>>>);

impl FlushLog {
    pub fn flushes(&self) -> Vec<Range<usize>> {
        self.0.lock().unwrap().clone()
    }
}

/// Vector memory backed by a `Vec<u8>` that remembers i-cache flushes.
#[derive(Debug)]
pub struct RecordingVectors {
    mem: Vec<u8>,
    log: FlushLog,
}

impl RecordingVectors {
    pub fn new(len: usize) -> (Self, FlushLog) {
        let log = FlushLog::default();
        (
            RecordingVectors {
                mem: vec![0; len],
                log: log.clone(),
            },
            log,
        )
    }
}

impl VectorMemory for RecordingVectors {
    fn len(&self) -> usize {
        self.mem.len()
    }

    fn write(&mut self, offset: usize, data: &[u8]) {
        VectorMemory::write(&mut self.mem, offset, data);
    }

    fn flush_icache(&mut self, range: Range<usize>) {
        self.log.0.lock().unwrap().push(range);
    }

    fn as_bytes(&self) -> &[u8] {
        &self.mem
    }
}
