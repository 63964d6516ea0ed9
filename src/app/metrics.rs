//! Prometheus-based metrics module
//!
//! Dispatch-core meters, registered on a dedicated registry. There is no
//! exposition endpoint here; embedders gather from `REGISTRY`.

use lazy_static::lazy_static;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    /// Total connections handled by the dispatcher
    pub static ref DISPATCHER_CONNECTIONS_TOTAL: IntCounter = IntCounter::new(
        "nodus_dispatcher_connections_total",
        "Total number of connections handled by the dispatcher"
    ).unwrap();

    /// Currently active connections
    pub static ref DISPATCHER_CONNECTIONS_ACTIVE: IntGauge = IntGauge::new(
        "nodus_dispatcher_connections_active",
        "Number of currently active connections"
    ).unwrap();

    /// Dispatches that found no outbound handler
    pub static ref DISPATCHER_CONNECTIONS_FAILED: IntCounter = IntCounter::new(
        "nodus_dispatcher_connections_failed",
        "Total number of dispatches without a usable outbound handler"
    ).unwrap();

    /// Sniffing outcomes per protocol
    pub static ref SNIFF_RESULTS: IntCounterVec = IntCounterVec::new(
        Opts::new("nodus_sniff_results_total", "Sniffing outcomes per detected protocol"),
        &["protocol"]
    ).unwrap();

    /// Routing decisions that matched a rule
    pub static ref ROUTER_PICKS_TOTAL: IntCounter = IntCounter::new(
        "nodus_router_picks_total",
        "Routing decisions that matched a rule"
    ).unwrap();

    /// Routing decisions that fell back to the default outbound
    pub static ref ROUTER_DEFAULTS_TOTAL: IntCounter = IntCounter::new(
        "nodus_router_defaults_total",
        "Routing decisions that fell back to the default outbound"
    ).unwrap();
}

/// Register all metrics with the global registry. Safe to call repeatedly.
pub fn init_metrics() {
    REGISTRY.register(Box::new(DISPATCHER_CONNECTIONS_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(DISPATCHER_CONNECTIONS_ACTIVE.clone())).ok();
    REGISTRY.register(Box::new(DISPATCHER_CONNECTIONS_FAILED.clone())).ok();
    REGISTRY.register(Box::new(SNIFF_RESULTS.clone())).ok();
    REGISTRY.register(Box::new(ROUTER_PICKS_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(ROUTER_DEFAULTS_TOTAL.clone())).ok();
}
