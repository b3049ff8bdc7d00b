//! Metrics for member rendezvous.
//!
//! Provides counters and gauges for monitoring registration and translation
//! behavior.
//!
//! ## Available Metrics
//!
//! ### Counters
//! - `rendezvous_seed_loads_total` - Seed-address loading passes
//! - `rendezvous_registrations_total` - Address registrations written
//! - `rendezvous_reconcile_written_total` - Reconciliations that rewrote the canonical list
//! - `rendezvous_reconcile_unchanged_total` - Reconciliations that found nothing to do
//! - `rendezvous_reconcile_skipped_total` - Reconciliations skipped on lock contention
//! - `rendezvous_foreign_addresses_total` - Unexplained registered addresses encountered
//! - `rendezvous_translator_rebuilds_total` - Effective mapping rebuilds
//!
//! ### Gauges
//! - `rendezvous_seed_addresses` - Addresses produced by the last seed load
//! - `rendezvous_translator_mappings` - Distinct keys in the effective mapping

use metrics::{counter, describe_counter, describe_gauge, gauge};

use crate::registrar::ReconcileOutcome;

/// Initialize metric descriptions.
///
/// Call this once at application startup to register all metric descriptions.
/// This makes metrics more discoverable in monitoring systems.
pub fn init_metrics() {
    // Counters
    describe_counter!(
        "rendezvous_seed_loads_total",
        "Total number of seed-address loading passes"
    );
    describe_counter!(
        "rendezvous_registrations_total",
        "Total number of address registrations written"
    );
    describe_counter!(
        "rendezvous_reconcile_written_total",
        "Total number of reconciliations that rewrote the canonical list"
    );
    describe_counter!(
        "rendezvous_reconcile_unchanged_total",
        "Total number of reconciliations that found registry and topology in agreement"
    );
    describe_counter!(
        "rendezvous_reconcile_skipped_total",
        "Total number of reconciliations skipped because the lock was contended"
    );
    describe_counter!(
        "rendezvous_foreign_addresses_total",
        "Total number of registered addresses matching neither topology nor departures"
    );
    describe_counter!(
        "rendezvous_translator_rebuilds_total",
        "Total number of effective address mapping rebuilds"
    );

    // Gauges
    describe_gauge!(
        "rendezvous_seed_addresses",
        "Number of addresses produced by the last seed load"
    );
    describe_gauge!(
        "rendezvous_translator_mappings",
        "Current number of distinct keys in the effective address mapping"
    );
}

/// Record a seed-address loading pass and its yield.
pub fn record_seed_load(count: usize) {
    counter!("rendezvous_seed_loads_total").increment(1);
    gauge!("rendezvous_seed_addresses").set(count as f64);
}

/// Record an address registration.
pub fn record_registration() {
    counter!("rendezvous_registrations_total").increment(1);
}

/// Record the outcome of a reconciliation attempt.
pub fn record_reconcile(outcome: ReconcileOutcome) {
    match outcome {
        ReconcileOutcome::Written => {
            counter!("rendezvous_reconcile_written_total").increment(1);
        }
        ReconcileOutcome::Unchanged => {
            counter!("rendezvous_reconcile_unchanged_total").increment(1);
        }
        ReconcileOutcome::Skipped => {
            counter!("rendezvous_reconcile_skipped_total").increment(1);
        }
    }
}

/// Record unexplained registered addresses found during reconciliation.
pub fn record_foreign_addresses(count: usize) {
    counter!("rendezvous_foreign_addresses_total").increment(count as u64);
}

/// Record an effective mapping rebuild.
pub fn record_translator_rebuild() {
    counter!("rendezvous_translator_rebuilds_total").increment(1);
}

/// Update the effective mapping size gauge.
pub fn set_translator_mappings(count: usize) {
    gauge!("rendezvous_translator_mappings").set(count as f64);
}
