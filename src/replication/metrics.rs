//! Prometheus metrics for the replication control plane.
//!
//! Counters cover the part lifecycle (merges executed, parts fetched, parts
//! rendered obsolete) and the log fan-in; gauges expose the queue depth and
//! leadership so an operator can see at a glance which replica proposes
//! merges and whether a queue is draining.
//!
//! # Safety
//!
//! All metrics live in a custom registry with the `replitree` prefix to avoid
//! name collisions with other libraries using the default registry.
//! Registration errors are handled gracefully: if a metric fails to register,
//! a detached fallback metric is used instead of panicking.

use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use tracing::warn;

/// Custom registry for replitree metrics.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("replitree".to_string()), None).unwrap_or_else(|_| Registry::new())
});

fn register_int_counter_safe(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("valid metric name");
    if let Err(e) = registry.register(Box::new(counter.clone())) {
        warn!(metric = name, error = %e, "Failed to register metric, using detached fallback");
    }
    counter
}

fn register_int_gauge_safe(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::new(name, help).expect("valid metric name");
    if let Err(e) = registry.register(Box::new(gauge.clone())) {
        warn!(metric = name, error = %e, "Failed to register metric, using detached fallback");
    }
    gauge
}

macro_rules! define_counter {
    ($name:ident, $metric_name:expr, $help:expr) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounter> =
            Lazy::new(|| register_int_counter_safe(&REGISTRY, $metric_name, $help));
    };
}

macro_rules! define_gauge {
    ($name:ident, $metric_name:expr, $help:expr) => {
        #[doc = $help]
        pub static $name: Lazy<IntGauge> =
            Lazy::new(|| register_int_gauge_safe(&REGISTRY, $metric_name, $help));
    };
}

define_counter!(
    PART_MERGES,
    "part_merges_total",
    "Merges executed locally from replicated log entries"
);
define_counter!(
    PART_FETCHES,
    "part_fetches_total",
    "Parts fetched from peer replicas"
);
define_counter!(
    MERGED_PART_FETCHES,
    "merged_part_fetches_total",
    "Fetches that replaced a local merge whose inputs were missing"
);
define_counter!(
    OBSOLETE_PARTS,
    "obsolete_parts_total",
    "Local parts rendered obsolete by a fetched covering part"
);
define_counter!(
    LOG_ENTRIES_PULLED,
    "log_entries_pulled_total",
    "Log entries copied from peer logs into the local queue"
);
define_gauge!(QUEUE_SIZE, "queue_size", "Entries currently in the replication queue");
define_gauge!(
    IS_LEADER,
    "is_leader",
    "1 while this replica is the elected merge proposer"
);

/// Render all replitree metrics in the Prometheus text format.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let before = PART_FETCHES.get();
        PART_FETCHES.inc();
        PART_FETCHES.inc();
        assert_eq!(PART_FETCHES.get(), before + 2);
    }

    #[test]
    fn gather_renders_prefix() {
        PART_MERGES.inc();
        let text = gather();
        assert!(text.contains("replitree_part_merges_total"));
    }
}
