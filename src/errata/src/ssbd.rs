// Copyright 2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Speculative Store Bypass Disable (Spectre variant 4).
//!
//! Each core asks firmware through `SMCCC_ARCH_WORKAROUND_2`, or uses its own
//! `PSTATE.SSBS` bit when it has one, then applies the operator policy.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};

use log::warn;
use serde::{Serialize, Serializer};

use crate::capabilities::Capability;
use crate::catalog::CatalogEntry;
use crate::matcher::Scope;
use crate::metrics::IncMetric;
use crate::smccc::{
    self, ARM_SMCCC_ARCH_WORKAROUND_2, SMCCC_RET_NOT_REQUIRED, SMCCC_RET_NOT_REQUIRED_ON_THIS_CPU,
    SMCCC_RET_NOT_SUPPORTED, SMCCC_RET_SUCCESS, SmcccVersion,
};
use crate::{Errata, Platform};

/// System wide speculative store bypass policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum SsbdState {
    /// Enabled around lower exception levels on cores that need it.
    #[default]
    Kernel,
    /// Always enabled.
    ForceEnable,
    /// Never enabled.
    ForceDisable,
    /// Firmware cannot tell whether the mitigation is needed.
    Unknown,
    /// Firmware reported the system as not affected.
    Mitigated,
}

impl SsbdState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => SsbdState::Kernel,
            1 => SsbdState::ForceEnable,
            2 => SsbdState::ForceDisable,
            4 => SsbdState::Mitigated,
            _ => SsbdState::Unknown,
        }
    }
}

/// Operator spellings, matched as prefixes in this order.
const SSBD_OPTIONS: [(&str, SsbdState); 3] = [
    ("force-on", SsbdState::ForceEnable),
    ("force-off", SsbdState::ForceDisable),
    ("kernel", SsbdState::Kernel),
];

/// Errors while parsing the `ssbd=` option.
#[derive(Debug, thiserror::Error, displaydoc::Display, PartialEq, Eq)]
pub enum SsbdParseError {
    /// Empty ssbd option.
    Empty,
    /// Invalid ssbd option `{0}`, expected one of force-on, force-off, kernel.
    Invalid(String),
}

impl FromStr for SsbdState {
    type Err = SsbdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(SsbdParseError::Empty);
        }
        SSBD_OPTIONS
            .iter()
            .find(|(name, _)| s.starts_with(name))
            .map(|(_, state)| *state)
            .ok_or_else(|| SsbdParseError::Invalid(s.to_string()))
    }
}

impl fmt::Display for SsbdState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SsbdState::Kernel => "kernel",
            SsbdState::ForceEnable => "force-on",
            SsbdState::ForceDisable => "force-off",
            SsbdState::Unknown => "unknown",
            SsbdState::Mitigated => "mitigated",
        };
        f.write_str(name)
    }
}

impl Serialize for SsbdState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Policy cell shared by every core.
#[derive(Debug)]
pub struct SsbdPolicy(AtomicU8);

impl SsbdPolicy {
    pub const fn new(state: SsbdState) -> Self {
        SsbdPolicy(AtomicU8::new(state as u8))
    }

    pub fn get(&self) -> SsbdState {
        SsbdState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: SsbdState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

impl Errata {
    /// Decides whether the calling core needs the store bypass mitigation and
    /// applies the policy to it.
    pub fn has_ssbd_mitigation(
        &self,
        entry: &CatalogEntry,
        platform: &Platform<'_>,
        scope: Scope,
    ) -> bool {
        self.check_scope(scope, platform.cpu);
        self.ssbd_required(entry, platform)
    }

    /// Asks firmware whether the calling core needs the mitigation.
    ///
    /// `None` means there is nothing to apply on this core.
    fn query_ssbd_firmware(&self, entry: &CatalogEntry, platform: &Platform<'_>) -> Option<bool> {
        let cpu = platform.cpu;
        let firmware = platform.firmware;

        if firmware.smccc_version() == SmcccVersion::V1_0 {
            info_once!("SSBD: SMCCC 1.0 firmware, mitigation state unknown");
            self.ssbd.set(SsbdState::Unknown);
            return None;
        }

        let Some(val) = smccc::arch_features(firmware, ARM_SMCCC_ARCH_WORKAROUND_2) else {
            info_once!("SSBD: no firmware conduit, mitigation state unknown");
            self.ssbd.set(SsbdState::Unknown);
            return None;
        };

        match val {
            SMCCC_RET_NOT_SUPPORTED => {
                info_once!("SSBD: firmware does not implement ARCH_WORKAROUND_2");
                self.ssbd.set(SsbdState::Unknown);
                None
            }
            SMCCC_RET_NOT_REQUIRED => {
                info_once!("{} mitigation not required", entry.label());
                self.ssbd.set(SsbdState::Mitigated);
                None
            }
            SMCCC_RET_SUCCESS => Some(true),
            SMCCC_RET_NOT_REQUIRED_ON_THIS_CPU => Some(false),
            other => {
                warn!(
                    "CPU{}: unexpected ARCH_WORKAROUND_2 feature value {other}, not mitigating",
                    cpu.id()
                );
                self.metrics.ssbd_fw_contract_violations.inc();
                None
            }
        }
    }

    pub(crate) fn ssbd_required(&self, entry: &CatalogEntry, platform: &Platform<'_>) -> bool {
        let cpu = platform.cpu;
        let has_ssbs = platform.capabilities.has_cap(cpu.id(), Capability::Ssbs);

        // With SSBS the core controls the mitigation itself.
        let required = if has_ssbs {
            true
        } else {
            match self.query_ssbd_firmware(entry, platform) {
                Some(required) => required,
                None => return false,
            }
        };

        match self.ssbd.get() {
            SsbdState::ForceDisable => {
                self.set_ssbd_mitigation(platform, false);
                info_once!("{} disabled from command-line", entry.label());
                false
            }
            SsbdState::Kernel => {
                if required {
                    if let Err(err) = platform
                        .percpu
                        .update(cpu.id(), |state| state.ssbd_callback_required = true)
                    {
                        warn!("CPU{}: cannot record SSBD state: {err}", cpu.id());
                    }
                    self.set_ssbd_mitigation(platform, true);
                }
                required
            }
            SsbdState::ForceEnable => {
                self.set_ssbd_mitigation(platform, true);
                info_once!("{} forced from command-line", entry.label());
                true
            }
            state => {
                warn!("CPU{}: SSBD policy is {state}, leaving the core alone", cpu.id());
                required
            }
        }
    }

    /// Turns the store bypass mitigation on or off for the calling core.
    pub fn set_ssbd_mitigation(&self, platform: &Platform<'_>, enable: bool) {
        let cpu = platform.cpu;
        if platform.capabilities.has_cap(cpu.id(), Capability::Ssbs) {
            // SSBS set means bypass allowed.
            cpu.set_pstate_ssbs(!enable);
            return;
        }

        let firmware = platform.firmware;
        let res = smccc::call(
            firmware,
            firmware.conduit(),
            ARM_SMCCC_ARCH_WORKAROUND_2,
            &[u64::from(enable)],
        );
        if res.is_none() {
            warn_once!("SSBD: no firmware conduit to toggle the mitigation");
            self.metrics.ssbd_missing_conduit.inc();
        }
    }
}
