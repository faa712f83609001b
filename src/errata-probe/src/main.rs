// Copyright 2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::fs::read_to_string;
use std::path::PathBuf;
use std::thread;

use clap::{Parser, ValueEnum};
use errata::bp_hardening::BP_HARDEN_SLOT_SIZE;
use errata::capabilities::{Capability, CapabilitySink, CpuCapabilities};
use errata::catalog::arm64_errata;
use errata::config::MitigationConfig;
use errata::cpu::CpuId;
use errata::matcher::CacheTypeReference;
use errata::metrics::ErrataMetrics;
use errata::midr::Midr;
use errata::percpu::{PerCpuArena, PerCpuMitigation};
use errata::smccc::{Conduit, SMCCC_RET_SUCCESS, SmcccVersion};
use errata::ssbd::SsbdState;
use errata::{Errata, ErrataError, ErrataReport, Platform};
use log::{info, warn};
use serde::Serialize;

use crate::logger::{LOGGER, LevelFilter, LogFormat};
use crate::sim::{CpuActions, CpuRegs, FirmwareCall, SimulatedCpu, SimulatedFirmware};

mod host;
mod logger;
mod sim;

const EXIT_CODE_ERROR: i32 = 1;

#[derive(Debug, thiserror::Error, displaydoc::Display)]
enum ProbeError {
    /// Failed to read host cores: {0}
    Host(#[from] host::HostError),
    /// Failed to read mitigation config file: {0}
    ConfigFile(#[from] std::io::Error),
    /// Invalid mitigation config file: {0}
    ConfigFormat(serde_json::Error),
    /// CPU{0} failed to come up: {1}
    BringUp(CpuId, ErrataError),
    /// Failed to start CPU{0}: {1}
    StartCpu(CpuId, std::io::Error),
    /// CPU{0} bring-up thread panicked
    BringUpPanic(CpuId),
    /// Failed to serialize the report: {0}
    Report(serde_json::Error),
}

type Result<T> = std::result::Result<T, ProbeError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ConduitArg {
    None,
    Hvc,
    Smc,
}

impl From<ConduitArg> for Conduit {
    fn from(arg: ConduitArg) -> Self {
        match arg {
            ConduitArg::None => Conduit::None,
            ConduitArg::Hvc => Conduit::Hvc,
            ConduitArg::Smc => Conduit::Smc,
        }
    }
}

fn parse_hex(s: &str) -> std::result::Result<u64, std::num::ParseIntError> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(digits, 16)
}

/// Evaluates the arm64 errata catalog against a set of cores and prints what
/// would be detected and installed on each of them.
#[derive(Debug, Parser)]
#[command(version)]
struct Cli {
    /// MIDR_EL1 of each simulated core. The host cores are read from sysfs
    /// when none is given.
    #[arg(long, value_name = "MIDR", num_args = 1..)]
    midr: Vec<Midr>,
    /// Directory listing the host cores.
    #[arg(long, value_name = "PATH", default_value = host::SYSFS_CPU_ROOT)]
    sysfs: PathBuf,
    /// CTR_EL0 of the simulated cores.
    #[arg(long, value_parser = parse_hex, default_value = "0x8444c004")]
    ctr: u64,
    /// System CTR_EL0 the cores are compared against. Defaults to --ctr.
    #[arg(long, value_parser = parse_hex)]
    sys_ctr: Option<u64>,
    /// ID_AA64PFR0_EL1 of the simulated cores.
    #[arg(long, value_parser = parse_hex, default_value = "0")]
    pfr0: u64,
    /// Cores implement PSTATE.SSBS.
    #[arg(long)]
    ssbs: bool,
    /// Kernel command line carrying the `ssbd=` option.
    #[arg(long, default_value = "")]
    cmdline: String,
    /// JSON mitigation config. Takes precedence over --cmdline.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Instruction used to reach firmware.
    #[arg(long, value_enum, default_value_t = ConduitArg::Smc)]
    conduit: ConduitArg,
    /// Firmware only implements SMCCC 1.0.
    #[arg(long)]
    smccc_1_0: bool,
    /// SMCCC_ARCH_FEATURES answer for ARCH_WORKAROUND_1.
    #[arg(long, default_value_t = SMCCC_RET_SUCCESS, allow_negative_numbers = true)]
    wa1: i32,
    /// SMCCC_ARCH_FEATURES answer for ARCH_WORKAROUND_2.
    #[arg(long, default_value_t = SMCCC_RET_SUCCESS, allow_negative_numbers = true)]
    wa2: i32,
    /// Hypervisor vector slots reserved for branch predictor hardening, 0 for none.
    #[arg(long, default_value_t = 4)]
    hyp_slots: usize,
    /// Log level.
    #[arg(long, default_value = "warn")]
    level: LevelFilter,
    /// Show the level of log lines.
    #[arg(long)]
    show_level: bool,
    /// Show the source location of log lines.
    #[arg(long)]
    show_log_origin: bool,
    /// Append log lines to this file instead of stderr.
    #[arg(long, value_name = "PATH")]
    log_path: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct CoreReport {
    #[serde(flatten)]
    errata: ErrataReport,
    mitigation: PerCpuMitigation,
    actions: CpuActions,
}

#[derive(Debug, Serialize)]
struct ProbeReport<'a> {
    config: MitigationConfig,
    ssbd: SsbdState,
    cores: Vec<CoreReport>,
    hyp_slots_allocated: Option<usize>,
    firmware_calls: Vec<FirmwareCall>,
    metrics: &'a ErrataMetrics,
}

fn mitigation_config(cli: &Cli) -> Result<MitigationConfig> {
    if let Some(path) = &cli.config {
        let raw = read_to_string(path)?;
        return serde_json::from_str(&raw).map_err(ProbeError::ConfigFormat);
    }
    // A bad option is reported and the defaults apply.
    Ok(MitigationConfig::from_cmdline(&cli.cmdline).unwrap_or_else(|err| {
        warn!("{err}, using the default mitigation options");
        MitigationConfig::default()
    }))
}

fn cores(cli: &Cli) -> Result<Vec<(CpuId, Midr)>> {
    if cli.midr.is_empty() {
        return Ok(host::read_midrs(&cli.sysfs)?);
    }
    Ok(cli.midr.iter().copied().enumerate().collect())
}

fn run(cli: Cli) -> Result<String> {
    let config = mitigation_config(&cli)?;
    let cores = cores(&cli)?;
    let possible_cpus = cores.iter().map(|(id, _)| id + 1).max().unwrap_or(0);

    let mut errata = Errata::new(
        arm64_errata(),
        &config,
        CacheTypeReference::new(cli.sys_ctr.unwrap_or(cli.ctr)),
    );
    if cli.hyp_slots > 0 {
        errata = errata.with_hyp_vectors(Box::new(vec![0u8; cli.hyp_slots * BP_HARDEN_SLOT_SIZE]));
    }

    let version = match cli.smccc_1_0 {
        true => SmcccVersion::V1_0,
        false => SmcccVersion::V1_1,
    };
    let firmware = SimulatedFirmware::new(version, cli.conduit.into(), cli.wa1, cli.wa2);
    let capabilities = CpuCapabilities::new(possible_cpus);
    let percpu = PerCpuArena::new(possible_cpus);

    info!(
        "Evaluating {} errata on {} cores",
        errata.catalog().len(),
        cores.len()
    );

    // Every core brings itself up, like secondaries coming online.
    let results = thread::scope(|scope| {
        let handles: Vec<_> = cores
            .iter()
            .map(|&(id, midr)| {
                let (errata, firmware, capabilities, percpu) =
                    (&errata, &firmware, &capabilities, &percpu);
                let regs = CpuRegs {
                    midr,
                    id_aa64pfr0: cli.pfr0,
                    ctr: cli.ctr,
                };
                let ssbs = cli.ssbs;
                let handle = thread::Builder::new()
                    .name(format!("cpu{id}"))
                    .spawn_scoped(scope, move || -> std::result::Result<_, ErrataError> {
                        let cpu = SimulatedCpu::new(id, regs);
                        // Detected by the feature scan before the errata run.
                        if ssbs {
                            capabilities.register(id, Capability::Ssbs);
                        }
                        let platform = Platform::new(&cpu, firmware, capabilities, percpu);
                        let report = errata.update_cpu_errata(&platform)?;
                        percpu.apply_bp_hardening(&cpu, firmware);
                        Ok((report, cpu.actions()))
                    });
                (id, handle)
            })
            .collect();

        handles
            .into_iter()
            .map(|(id, handle)| match handle {
                Ok(handle) => match handle.join() {
                    Ok(result) => result.map_err(|err| ProbeError::BringUp(id, err)),
                    Err(_) => Err(ProbeError::BringUpPanic(id)),
                },
                Err(err) => Err(ProbeError::StartCpu(id, err)),
            })
            .collect::<Result<Vec<(ErrataReport, CpuActions)>>>()
    })?;

    let mut reports = Vec::with_capacity(results.len());
    for (report, actions) in results {
        let mitigation = percpu
            .get(report.cpu)
            .map_err(|err| ProbeError::BringUp(report.cpu, err.into()))?;
        reports.push(CoreReport {
            errata: report,
            mitigation,
            actions,
        });
    }

    let report = ProbeReport {
        config,
        ssbd: errata.ssbd_state(),
        cores: reports,
        hyp_slots_allocated: errata.hyp_vectors().map(|vectors| vectors.allocated()),
        firmware_calls: firmware.calls(),
        metrics: errata.metrics(),
    };
    serde_json::to_string_pretty(&report).map_err(ProbeError::Report)
}

fn main() {
    let cli = Cli::parse();

    let format = LogFormat {
        show_level: cli.show_level,
        show_log_origin: cli.show_log_origin,
    };
    if let Err(err) = LOGGER.init(cli.level, format, cli.log_path.as_deref()) {
        eprintln!("Error: failed to initialize the logger: {err}");
    }

    match run(cli) {
        Ok(report) => println!("{report}"),
        Err(err) => {
            eprintln!("Error: {err}");
            std::process::exit(EXIT_CODE_ERROR);
        }
    }
}
