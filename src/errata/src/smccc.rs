// Copyright 2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! SMC Calling Convention pieces used by the mitigations: the function ids, the
//! return codes and the transport seam.

use serde::Serialize;

/// `SMCCC_ARCH_FEATURES`: asks firmware whether a function id is implemented.
pub const ARM_SMCCC_ARCH_FEATURES_FUNC_ID: u32 = 0x8000_0001;
/// `SMCCC_ARCH_WORKAROUND_1`: branch predictor invalidation (CVE-2017-5715).
pub const ARM_SMCCC_ARCH_WORKAROUND_1: u32 = 0x8000_8000;
/// `SMCCC_ARCH_WORKAROUND_2`: speculative store bypass control (CVE-2018-3639).
pub const ARM_SMCCC_ARCH_WORKAROUND_2: u32 = 0x8000_7fff;

pub const SMCCC_RET_SUCCESS: i32 = 0;
pub const SMCCC_RET_NOT_SUPPORTED: i32 = -1;
pub const SMCCC_RET_NOT_REQUIRED: i32 = -2;
/// Returned by `SMCCC_ARCH_FEATURES(SMCCC_ARCH_WORKAROUND_2)` when the calling
/// core is not affected. Part of the firmware interface, not a status code.
pub const SMCCC_RET_NOT_REQUIRED_ON_THIS_CPU: i32 = 1;

/// SMCCC version implemented by firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SmcccVersion {
    /// No `SMCCC_ARCH_FEATURES`, no architectural workarounds.
    V1_0,
    V1_1,
}

/// Instruction used to reach firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Conduit {
    None,
    /// Hypervisor call: we are a guest.
    Hvc,
    /// Secure monitor call: we own EL2 or there is no hypervisor.
    Smc,
}

/// Firmware call transport, discovered outside of this crate.
pub trait FirmwareTransport: Send + Sync {
    fn smccc_version(&self) -> SmcccVersion;

    fn conduit(&self) -> Conduit;

    /// Issues an SMCCC 1.1 `HVC` and returns `x0`.
    fn hvc(&self, function_id: u32, args: &[u64]) -> u64;

    /// Issues an SMCCC 1.1 `SMC` and returns `x0`.
    fn smc(&self, function_id: u32, args: &[u64]) -> u64;
}

/// Issues `function_id` over `conduit`. Returns `None` when there is no conduit.
pub fn call(
    firmware: &dyn FirmwareTransport,
    conduit: Conduit,
    function_id: u32,
    args: &[u64],
) -> Option<u64> {
    match conduit {
        Conduit::Hvc => Some(firmware.hvc(function_id, args)),
        Conduit::Smc => Some(firmware.smc(function_id, args)),
        Conduit::None => None,
    }
}

/// Queries `SMCCC_ARCH_FEATURES` for `function_id` over the active conduit.
///
/// The result is the signed 32-bit status from `x0`, or `None` when there is
/// no conduit to ask.
pub fn arch_features(firmware: &dyn FirmwareTransport, function_id: u32) -> Option<i32> {
    call(
        firmware,
        firmware.conduit(),
        ARM_SMCCC_ARCH_FEATURES_FUNC_ID,
        &[u64::from(function_id)],
    )
    // Only the low 32 bits carry the status.
    .map(|res| res as u32 as i32)
}
