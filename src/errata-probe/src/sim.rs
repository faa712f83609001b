// Copyright 2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Cores and firmware simulated in memory, recording what the engine asks of them.

use std::cell::Cell;
use std::sync::Mutex;

use errata::cpu::{CpuId, LocalCpu, SCTLR_EL1_UCI, SCTLR_EL1_UCT};
use errata::midr::Midr;
use errata::smccc::{
    ARM_SMCCC_ARCH_FEATURES_FUNC_ID, ARM_SMCCC_ARCH_WORKAROUND_1, ARM_SMCCC_ARCH_WORKAROUND_2,
    Conduit, FirmwareTransport, SMCCC_RET_NOT_SUPPORTED, SmcccVersion,
};
use log::trace;
use serde::Serialize;

/// Reset value of `SCTLR_EL1` in the simulation: EL0 may use cache
/// maintenance instructions and read `CTR_EL0`.
const SCTLR_EL1_RESET: u64 = SCTLR_EL1_UCI | SCTLR_EL1_UCT;

/// Register values of a simulated core.
#[derive(Debug, Clone, Copy)]
pub struct CpuRegs {
    pub midr: Midr,
    pub id_aa64pfr0: u64,
    pub ctr: u64,
}

/// What the engine did to a simulated core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CpuActions {
    /// EL0 cache maintenance traps to EL1.
    pub traps_cache_maintenance: bool,
    /// EL0 reads of `CTR_EL0` trap to EL1.
    pub traps_ctr_access: bool,
    pub pstate_ssbs: Option<bool>,
    pub link_stack_sanitizations: usize,
}

#[derive(Debug)]
pub struct SimulatedCpu {
    id: CpuId,
    regs: CpuRegs,
    sctlr: Cell<u64>,
    ssbs: Cell<Option<bool>>,
    link_stack_sanitizations: Cell<usize>,
}

impl SimulatedCpu {
    pub fn new(id: CpuId, regs: CpuRegs) -> Self {
        SimulatedCpu {
            id,
            regs,
            sctlr: Cell::new(SCTLR_EL1_RESET),
            ssbs: Cell::new(None),
            link_stack_sanitizations: Cell::new(0),
        }
    }

    pub fn actions(&self) -> CpuActions {
        let sctlr = self.sctlr.get();
        CpuActions {
            traps_cache_maintenance: sctlr & SCTLR_EL1_UCI == 0,
            traps_ctr_access: sctlr & SCTLR_EL1_UCT == 0,
            pstate_ssbs: self.ssbs.get(),
            link_stack_sanitizations: self.link_stack_sanitizations.get(),
        }
    }
}

impl LocalCpu for SimulatedCpu {
    fn id(&self) -> CpuId {
        self.id
    }

    fn read_midr(&self) -> Midr {
        self.regs.midr
    }

    fn read_id_aa64pfr0(&self) -> u64 {
        self.regs.id_aa64pfr0
    }

    fn read_ctr(&self) -> u64 {
        self.regs.ctr
    }

    fn config_sctlr_el1(&self, clear: u64, set: u64) {
        self.sctlr.set((self.sctlr.get() & !clear) | set);
    }

    fn set_pstate_ssbs(&self, ssbs: bool) {
        self.ssbs.set(Some(ssbs));
    }

    fn sanitize_link_stack(&self) {
        self.link_stack_sanitizations
            .set(self.link_stack_sanitizations.get() + 1);
    }
}

/// One call received by the simulated firmware.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FirmwareCall {
    pub conduit: Conduit,
    #[serde(serialize_with = "serialize_function_id")]
    pub function_id: u32,
    pub args: Vec<u64>,
    pub result: i64,
}

fn serialize_function_id<S: serde::Serializer>(id: &u32, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(&format_args!("{id:#010x}"))
}

/// Firmware answering `SMCCC_ARCH_FEATURES` for the two workaround functions.
#[derive(Debug)]
pub struct SimulatedFirmware {
    version: SmcccVersion,
    conduit: Conduit,
    workaround_1: i32,
    workaround_2: i32,
    calls: Mutex<Vec<FirmwareCall>>,
}

impl SimulatedFirmware {
    pub fn new(version: SmcccVersion, conduit: Conduit, workaround_1: i32, workaround_2: i32) -> Self {
        SimulatedFirmware {
            version,
            conduit,
            workaround_1,
            workaround_2,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<FirmwareCall> {
        match self.calls.lock() {
            Ok(calls) => calls.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn answer(&self, function_id: u32, args: &[u64]) -> i32 {
        if function_id != ARM_SMCCC_ARCH_FEATURES_FUNC_ID {
            return 0;
        }
        match args.first().copied().map(u32::try_from) {
            Some(Ok(ARM_SMCCC_ARCH_WORKAROUND_1)) => self.workaround_1,
            Some(Ok(ARM_SMCCC_ARCH_WORKAROUND_2)) => self.workaround_2,
            _ => SMCCC_RET_NOT_SUPPORTED,
        }
    }

    fn handle(&self, conduit: Conduit, function_id: u32, args: &[u64]) -> u64 {
        let result = i64::from(self.answer(function_id, args));
        trace!("{conduit:?} {function_id:#x} {args:?} -> {result}");
        let call = FirmwareCall {
            conduit,
            function_id,
            args: args.to_vec(),
            result,
        };
        match self.calls.lock() {
            Ok(mut calls) => calls.push(call),
            Err(poisoned) => poisoned.into_inner().push(call),
        }
        // x0 holds the sign extended status.
        u64::from_ne_bytes(result.to_ne_bytes())
    }
}

impl FirmwareTransport for SimulatedFirmware {
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

#[cfg(test)]
mod tests {
    use errata::midr::MIDR_CORTEX_A57;
    use errata::smccc::{self, SMCCC_RET_NOT_REQUIRED, SMCCC_RET_SUCCESS};

    use super::*;

    #[test]
    fn test_firmware_answers() {
        let fw = SimulatedFirmware::new(
            SmcccVersion::V1_1,
            Conduit::Smc,
            SMCCC_RET_SUCCESS,
            SMCCC_RET_NOT_REQUIRED,
        );
        assert_eq!(
            smccc::arch_features(&fw, ARM_SMCCC_ARCH_WORKAROUND_1),
            Some(SMCCC_RET_SUCCESS)
        );
        assert_eq!(
            smccc::arch_features(&fw, ARM_SMCCC_ARCH_WORKAROUND_2),
            Some(SMCCC_RET_NOT_REQUIRED)
        );
        assert_eq!(
            smccc::arch_features(&fw, 0x8400_0000),
            Some(SMCCC_RET_NOT_SUPPORTED)
        );

        let calls = fw.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[1].result, -2);
        assert_eq!(
            serde_json::to_value(&calls[0]).unwrap()["function_id"],
            "0x80000001"
        );
    }

    #[test]
    fn test_cpu_actions() {
        let cpu = SimulatedCpu::new(
            0,
            CpuRegs {
                midr: MIDR_CORTEX_A57,
                id_aa64pfr0: 0,
                ctr: 0,
            },
        );
        assert_eq!(
            cpu.actions(),
            CpuActions {
                traps_cache_maintenance: false,
                traps_ctr_access: false,
                pstate_ssbs: None,
                link_stack_sanitizations: 0,
            }
        );

        cpu.config_sctlr_el1(SCTLR_EL1_UCT, 0);
        cpu.set_pstate_ssbs(false);
        cpu.sanitize_link_stack();
        let actions = cpu.actions();
        assert!(actions.traps_ctr_access);
        assert!(!actions.traps_cache_maintenance);
        assert_eq!(actions.pstate_ssbs, Some(false));
        assert_eq!(actions.link_stack_sanitizations, 1);
    }
}
