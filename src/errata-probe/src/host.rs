// Copyright 2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Identity of the host cores, as exported by sysfs.

use std::fs;
use std::path::{Path, PathBuf};

use errata::cpu::CpuId;
use errata::midr::{Midr, MidrParseError};
use log::debug;

/// Where the kernel lists the possible cores.
pub const SYSFS_CPU_ROOT: &str = "/sys/devices/system/cpu";
/// Per-core `MIDR_EL1`, relative to the core directory.
const MIDR_EL1_PATH: &str = "regs/identification/midr_el1";

#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum HostError {
    /// Failed to list {0}: {1}
    ListCpus(PathBuf, std::io::Error),
    /// Failed to read {0}: {1}
    ReadMidr(PathBuf, std::io::Error),
    /// Failed to parse {0}: {1}
    ParseMidr(PathBuf, MidrParseError),
    /// No core under {0} exports its MIDR_EL1.
    NoCpus(PathBuf),
}

/// Index of a `cpuN` directory name.
fn cpu_index(name: &str) -> Option<CpuId> {
    let digits = name.strip_prefix("cpu")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Reads `MIDR_EL1` of every online core under `root`, ordered by core index.
///
/// Offline cores do not export their registers and are skipped.
pub fn read_midrs(root: &Path) -> Result<Vec<(CpuId, Midr)>, HostError> {
    let entries = fs::read_dir(root).map_err(|err| HostError::ListCpus(root.to_path_buf(), err))?;

    let mut cpus = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| HostError::ListCpus(root.to_path_buf(), err))?;
        let Some(id) = entry.file_name().to_str().and_then(cpu_index) else {
            continue;
        };

        let path = entry.path().join(MIDR_EL1_PATH);
        if !path.exists() {
            debug!("CPU{id}: no {MIDR_EL1_PATH}, skipping");
            continue;
        }
        let raw = fs::read_to_string(&path).map_err(|err| HostError::ReadMidr(path.clone(), err))?;
        let midr = raw
            .parse::<Midr>()
            .map_err(|err| HostError::ParseMidr(path, err))?;
        cpus.push((id, midr));
    }

    if cpus.is_empty() {
        return Err(HostError::NoCpus(root.to_path_buf()));
    }
    cpus.sort_unstable_by_key(|(id, _)| *id);
    Ok(cpus)
}
