// Copyright 2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Mutex;

use serde::Serialize;

use crate::bp_hardening::HardeningCallback;
use crate::cpu::{CpuId, LocalCpu};
use crate::extract_guard;
use crate::smccc::FirmwareTransport;

/// Errors while accessing the per-core arena.
#[derive(Debug, thiserror::Error, displaydoc::Display, PartialEq, Eq)]
pub enum PerCpuError {
    /// CPU{0} is outside of the {1} possible CPUs.
    InvalidCpu(CpuId, usize),
}

/// Branch predictor hardening installed on a core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BpHardeningData {
    /// Hypervisor vector slot, if vectors were patched for this callback.
    pub slot: Option<usize>,
    /// Run on every exit from a lower exception level.
    pub callback: HardeningCallback,
}

/// Mitigation state of one core.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PerCpuMitigation {
    pub bp_hardening: Option<BpHardeningData>,
    /// The SSBD firmware call has to be toggled around lower exception levels.
    pub ssbd_callback_required: bool,
}

/// Mitigation state for every possible core, indexed by [`CpuId`].
///
/// Owned by the bring-up framework. An entry is only written while its core is
/// being brought up, by code running on that core.
#[derive(Debug)]
pub struct PerCpuArena {
    cpus: Vec<Mutex<PerCpuMitigation>>,
}

impl PerCpuArena {
    /// Creates zeroed state for `possible_cpus` cores.
    pub fn new(possible_cpus: usize) -> Self {
        PerCpuArena {
            cpus: (0..possible_cpus)
                .map(|_| Mutex::new(PerCpuMitigation::default()))
                .collect(),
        }
    }

    /// Number of possible cores.
    pub fn len(&self) -> usize {
        self.cpus.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cpus.is_empty()
    }

    fn slot(&self, cpu: CpuId) -> Result<&Mutex<PerCpuMitigation>, PerCpuError> {
        self.cpus
            .get(cpu)
            .ok_or(PerCpuError::InvalidCpu(cpu, self.cpus.len()))
    }

    /// Snapshot of the state of `cpu`.
    pub fn get(&self, cpu: CpuId) -> Result<PerCpuMitigation, PerCpuError> {
        Ok(*extract_guard(self.slot(cpu)?.lock()))
    }

    pub(crate) fn update<F>(&self, cpu: CpuId, f: F) -> Result<(), PerCpuError>
    where
        F: FnOnce(&mut PerCpuMitigation),
    {
        let mut guard = extract_guard(self.slot(cpu)?.lock());
        f(&mut guard);
        Ok(())
    }

    /// Slot of the first core already using `callback`.
    ///
    /// The outer `Option` tells whether some core uses the callback at all.
    pub(crate) fn find_callback(&self, callback: HardeningCallback) -> Option<Option<usize>> {
        self.cpus.iter().find_map(|cpu| {
            extract_guard(cpu.lock())
                .bp_hardening
                .filter(|data| data.callback == callback)
                .map(|data| data.slot)
        })
    }

    /// Whether the SSBD callback has to run for `cpu` around lower exception levels.
    pub fn ssbd_callback_required(&self, cpu: CpuId) -> bool {
        self.get(cpu)
            .map(|state| state.ssbd_callback_required)
            .unwrap_or(false)
    }

    /// Runs the branch predictor hardening callback recorded for the calling core.
    ///
    /// Returns whether a callback ran.
    pub fn apply_bp_hardening(&self, cpu: &dyn LocalCpu, firmware: &dyn FirmwareTransport) -> bool {
        match self.get(cpu.id()).ok().and_then(|state| state.bp_hardening) {
            Some(data) => {
                data.callback.invoke(cpu, firmware);
                true
            }
            None => false,
        }
    }
}
