// Copyright 2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Counters describing what the errata engine did.
//!
//! Counters are lockless and can be bumped from any core. Serializing an
//! [`ErrataMetrics`] reports the increments since the previous serialization,
//! while [`IncMetric::count`] keeps the running total.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Serialize, Serializer};

/// Used for defining new types of metrics that act as a counter.
pub trait IncMetric {
    /// Adds `value` to the current counter.
    fn add(&self, value: u64);
    /// Increments by 1 unit the current counter.
    fn inc(&self) {
        self.add(1);
    }
    /// Returns current value of the counter.
    fn count(&self) -> u64;
}

/// Counter that can be incremented from several cores at once.
///
/// Holds the running total and the total at the last serialization.
#[derive(Debug, Default)]
pub struct SharedIncMetric(AtomicU64, AtomicU64);

impl SharedIncMetric {
    /// Const default construction.
    pub const fn new() -> Self {
        Self(AtomicU64::new(0), AtomicU64::new(0))
    }
}

impl IncMetric for SharedIncMetric {
    fn add(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    fn count(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Serialize for SharedIncMetric {
    /// Reports the delta since the last serialization and starts a new interval.
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let snapshot = self.0.load(Ordering::Relaxed);
        let res = serializer.serialize_u64(snapshot - self.1.load(Ordering::Relaxed));

        if res.is_ok() {
            self.1.store(snapshot, Ordering::Relaxed);
        }
        res
    }
}

/// Metrics of the errata engine.
#[derive(Debug, Default, Serialize)]
pub struct ErrataMetrics {
    /// Catalog entries that matched a core.
    pub errata_matched: SharedIncMetric,
    /// Hypervisor vector slots filled with hardening code.
    pub bp_slots_allocated: SharedIncMetric,
    /// Hardening installs that reused another core's slot.
    pub bp_slots_reused: SharedIncMetric,
    /// Cores where CSV2 made branch predictor hardening unnecessary.
    pub bp_hardening_not_needed: SharedIncMetric,
    /// Unexpected values returned by the SSBD firmware query.
    pub ssbd_fw_contract_violations: SharedIncMetric,
    /// SSBD toggles attempted without a firmware conduit.
    pub ssbd_missing_conduit: SharedIncMetric,
    /// Matchers evaluated outside of a pinned, non-preemptible context.
    pub scope_violations: SharedIncMetric,
}

impl ErrataMetrics {
    pub const fn new() -> Self {
        ErrataMetrics {
            errata_matched: SharedIncMetric::new(),
            bp_slots_allocated: SharedIncMetric::new(),
            bp_slots_reused: SharedIncMetric::new(),
            bp_hardening_not_needed: SharedIncMetric::new(),
            ssbd_fw_contract_violations: SharedIncMetric::new(),
            ssbd_missing_conduit: SharedIncMetric::new(),
            scope_violations: SharedIncMetric::new(),
        }
    }
}
