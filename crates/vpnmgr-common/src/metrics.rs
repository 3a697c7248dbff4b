//! Prometheus counters for the dependency coordinator.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Resolution path label values for `vpnmgr_dependencies_resolved_total`.
pub const PATH_LISTENER: &str = "listener";
pub const PATH_POLL: &str = "poll";

/// Counters and gauges describing deferred-event traffic.
#[derive(Clone)]
pub struct DeferMetrics {
    // Counters
    pub events_deferred_total: IntCounter,
    pub events_dispatched_total: IntCounter,
    pub events_expired_total: IntCounter,
    pub dependencies_resolved_total: IntCounterVec,
    pub registration_failures_total: IntCounter,
    pub handler_failures_total: IntCounter,

    // Gauges
    pub events_pending: IntGauge,
    pub listeners_active: IntGauge,

    // Registry for export
    pub registry: Arc<Registry>,
}

impl DeferMetrics {
    /// Creates the collector with its own registry.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let events_deferred_total = IntCounter::with_opts(Opts::new(
            "vpnmgr_events_deferred_total",
            "Total number of events queued for dependency resolution",
        ))?;
        registry.register(Box::new(events_deferred_total.clone()))?;

        let events_dispatched_total = IntCounter::with_opts(Opts::new(
            "vpnmgr_events_dispatched_total",
            "Total number of events replayed into their handler",
        ))?;
        registry.register(Box::new(events_dispatched_total.clone()))?;

        let events_expired_total = IntCounter::with_opts(Opts::new(
            "vpnmgr_events_expired_total",
            "Total number of events dropped after exhausting their retry budget",
        ))?;
        registry.register(Box::new(events_expired_total.clone()))?;

        let dependencies_resolved_total = IntCounterVec::new(
            Opts::new(
                "vpnmgr_dependencies_resolved_total",
                "Total number of dependencies struck, by resolution path",
            ),
            &["path"],
        )?;
        registry.register(Box::new(dependencies_resolved_total.clone()))?;

        let registration_failures_total = IntCounter::with_opts(Opts::new(
            "vpnmgr_listener_registration_failures_total",
            "Total number of wildcard listeners that never became active",
        ))?;
        registry.register(Box::new(registration_failures_total.clone()))?;

        let handler_failures_total = IntCounter::with_opts(Opts::new(
            "vpnmgr_handler_failures_total",
            "Total number of dispatched events the handler failed to apply",
        ))?;
        registry.register(Box::new(handler_failures_total.clone()))?;

        let events_pending = IntGauge::with_opts(Opts::new(
            "vpnmgr_events_pending",
            "Current number of deferred events",
        ))?;
        registry.register(Box::new(events_pending.clone()))?;

        let listeners_active = IntGauge::with_opts(Opts::new(
            "vpnmgr_listeners_active",
            "Current number of registered wildcard listeners",
        ))?;
        registry.register(Box::new(listeners_active.clone()))?;

        Ok(Self {
            events_deferred_total,
            events_dispatched_total,
            events_expired_total,
            dependencies_resolved_total,
            registration_failures_total,
            handler_failures_total,
            events_pending,
            listeners_active,
            registry: Arc::new(registry),
        })
    }

    /// Record dependencies struck through `path`.
    pub fn record_resolved(&self, path: &str, count: usize) {
        self.dependencies_resolved_total
            .with_label_values(&[path])
            .inc_by(count as u64);
    }

    /// Number of dependencies struck through `path` so far.
    pub fn resolved(&self, path: &str) -> u64 {
        self.dependencies_resolved_total.with_label_values(&[path]).get()
    }

    /// Renders every metric in the Prometheus text format.
    pub fn gather_text(&self) -> String {
        let mut buffer = Vec::new();
        if TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .is_err()
        {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
