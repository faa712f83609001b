// Copyright 2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Detection of arm64 CPU errata and installation of their mitigations.
//!
//! The bring-up framework calls [`Errata::update_cpu_errata`] once on every
//! core entering service, before the core runs general workloads. The engine
//! evaluates the catalog against the core, records the detected capabilities
//! and runs the enable action of every matching entry. Branch predictor
//! hardening and speculative store bypass control are the two mitigations that
//! need firmware.

#[macro_use]
mod logger;

pub mod bp_hardening;
pub mod capabilities;
pub mod catalog;
pub mod config;
pub mod cpu;
pub mod matcher;
pub mod metrics;
pub mod midr;
pub mod percpu;
pub mod smccc;
pub mod ssbd;

#[cfg(test)]
pub(crate) mod test_utils;

use std::fmt;
use std::sync::LockResult;

use log::{debug, info};
use serde::Serialize;

use crate::bp_hardening::{BpHardeningError, HypVectors, VectorMemory};
use crate::capabilities::{Capability, CapabilitySink};
use crate::catalog::{CatalogEntry, EnableAction};
use crate::config::MitigationConfig;
use crate::cpu::{CpuId, LocalCpu, SCTLR_EL1_UCI, SCTLR_EL1_UCT};
use crate::matcher::{CacheTypeReference, Matcher, Predicate, Scope};
use crate::metrics::{ErrataMetrics, IncMetric};
use crate::midr::Midr;
use crate::percpu::{BpHardeningData, PerCpuArena, PerCpuError};
use crate::smccc::FirmwareTransport;
use crate::ssbd::{SsbdPolicy, SsbdState};

pub(crate) fn extract_guard<G>(lock_result: LockResult<G>) -> G {
    match lock_result {
        Ok(guard) => guard,
        // Per-core records and the slot allocator hold plain data that stays
        // consistent even if the holder panicked.
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Errors returned while bringing up a core.
///
/// Any of them means the core cannot be safely marked available.
#[derive(Debug, thiserror::Error, displaydoc::Display, PartialEq, Eq)]
pub enum ErrataError {
    /// Branch predictor hardening failed: {0}
    BpHardening(#[from] BpHardeningError),
    /// Per-CPU state unavailable: {0}
    PerCpu(#[from] PerCpuError),
}

/// Everything the engine needs from the core being brought up.
pub struct Platform<'a> {
    pub cpu: &'a dyn LocalCpu,
    pub firmware: &'a dyn FirmwareTransport,
    pub capabilities: &'a dyn CapabilitySink,
    pub percpu: &'a PerCpuArena,
}

impl<'a> Platform<'a> {
    pub fn new(
        cpu: &'a dyn LocalCpu,
        firmware: &'a dyn FirmwareTransport,
        capabilities: &'a dyn CapabilitySink,
        percpu: &'a PerCpuArena,
    ) -> Self {
        Platform {
            cpu,
            firmware,
            capabilities,
            percpu,
        }
    }
}

impl fmt::Debug for Platform<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Platform")
            .field("cpu", &self.cpu.id())
            .field("conduit", &self.firmware.conduit())
            .field("percpu", &self.percpu)
            .finish_non_exhaustive()
    }
}

/// A catalog entry that matched a core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatchedErratum {
    pub description: Option<&'static str>,
    pub capability: Capability,
    /// The capability was not yet registered for the core.
    pub first: bool,
    pub enable: Option<EnableAction>,
    /// Hardening installed by the enable action, if any.
    pub bp_hardening: Option<BpHardeningData>,
}

/// Outcome of evaluating the catalog on one core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrataReport {
    pub cpu: CpuId,
    pub midr: Midr,
    pub matched: Vec<MatchedErratum>,
}

/// The errata engine: a catalog plus the system wide mitigation state.
#[derive(Debug)]
pub struct Errata {
    catalog: Vec<CatalogEntry>,
    pub(crate) ssbd: SsbdPolicy,
    pub(crate) hyp_vectors: Option<HypVectors>,
    ctr_reference: CacheTypeReference,
    pub(crate) metrics: ErrataMetrics,
}

impl Errata {
    /// Creates an engine for `catalog`.
    ///
    /// `ctr_reference` is the system `CTR_EL0` established on the boot core.
    pub fn new(
        catalog: Vec<CatalogEntry>,
        config: &MitigationConfig,
        ctr_reference: CacheTypeReference,
    ) -> Self {
        Errata {
            catalog,
            ssbd: SsbdPolicy::new(config.ssbd),
            hyp_vectors: None,
            ctr_reference,
            metrics: ErrataMetrics::new(),
        }
    }

    /// Uses `mem` as the reserved hypervisor vector region for hardening slots.
    pub fn with_hyp_vectors(mut self, mem: Box<dyn VectorMemory>) -> Self {
        self.hyp_vectors = Some(HypVectors::new(mem));
        self
    }

    pub fn catalog(&self) -> &[CatalogEntry] {
        &self.catalog
    }

    pub fn hyp_vectors(&self) -> Option<&HypVectors> {
        self.hyp_vectors.as_ref()
    }

    pub fn metrics(&self) -> &ErrataMetrics {
        &self.metrics
    }

    /// Current speculative store bypass policy.
    pub fn ssbd_state(&self) -> SsbdState {
        self.ssbd.get()
    }

    pub(crate) fn check_scope(&self, scope: Scope, cpu: &dyn LocalCpu) {
        if !matcher::check_local_scope(scope, cpu) {
            self.metrics.scope_violations.inc();
        }
    }

    /// Whether `entry` applies to the core described by `platform`.
    ///
    /// Must run on that core with preemption disabled. The speculative store
    /// bypass predicate also applies the mitigation policy.
    pub fn matches(&self, entry: &CatalogEntry, platform: &Platform<'_>, scope: Scope) -> bool {
        self.check_scope(scope, platform.cpu);
        self.applies(entry, platform)
    }

    /// [`Errata::matches`] for a caller that already checked its scope.
    pub(crate) fn applies(&self, entry: &CatalogEntry, platform: &Platform<'_>) -> bool {
        let cpu = platform.cpu;
        match entry.matcher {
            Matcher::Custom(Predicate::SsbdMitigation) => self.ssbd_required(entry, platform),
            Matcher::Custom(predicate) => matcher::has_mismatched_cache_type(
                cpu.read_ctr(),
                &self.ctr_reference,
                predicate,
            ),
            ref identity => identity
                .matches_midr(cpu.read_midr())
                .unwrap_or(false),
        }
    }

    fn run_enable(
        &self,
        entry: &CatalogEntry,
        platform: &Platform<'_>,
    ) -> Result<Option<BpHardeningData>, ErrataError> {
        let cpu = platform.cpu;
        match entry.enable {
            None => Ok(None),
            Some(EnableAction::TrapCacheMaintenance) => {
                cpu.config_sctlr_el1(SCTLR_EL1_UCI, 0);
                Ok(None)
            }
            Some(EnableAction::TrapCtrAccess) => {
                cpu.config_sctlr_el1(SCTLR_EL1_UCT, 0);
                Ok(None)
            }
            Some(EnableAction::HardenBranchPredictor) => {
                Ok(self.enable_smccc_arch_workaround_1(entry, platform)?)
            }
        }
    }

    /// Evaluates the catalog on the calling core.
    ///
    /// Every matching entry runs its enable action and then registers its
    /// capability, in catalog order. An error means the core must not be
    /// brought online, and the failing entry's capability is not registered.
    pub fn update_cpu_errata(&self, platform: &Platform<'_>) -> Result<ErrataReport, ErrataError> {
        let cpu = platform.cpu;
        let id = cpu.id();
        // Fail early rather than half way through the catalog.
        platform.percpu.get(id)?;

        let midr = cpu.read_midr();
        debug!("CPU{id}: checking {} errata for MIDR {midr}", self.catalog.len());

        let mut matched = Vec::new();
        for entry in &self.catalog {
            if !self.matches(entry, platform, Scope::LocalCpu) {
                continue;
            }
            self.metrics.errata_matched.inc();

            let bp_hardening = self.run_enable(entry, platform)?;

            let first = platform.capabilities.register(id, entry.capability);
            if first {
                if let Some(description) = entry.description {
                    info!("CPU{id}: enabled workaround for {description}");
                }
            }
            matched.push(MatchedErratum {
                description: entry.description,
                capability: entry.capability,
                first,
                enable: entry.enable,
                bp_hardening,
            });
        }

        Ok(ErrataReport {
            cpu: id,
            midr,
            matched,
        })
    }
}
