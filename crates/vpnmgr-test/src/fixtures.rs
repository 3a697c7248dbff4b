//! Test fixtures for deferred-event scenarios
//!
//! Provides identifiers for the VPN tables, coordinator configurations tuned
//! for fast tests, and a ready-made [`TestEnv`].

use crate::recorder::RecordingHandler;
use std::sync::Arc;
use vpnmgr_common::{
    DeferConfig, DeferMetrics, DependencyCoordinator, DependencyData, EventType,
    InstanceIdentifier, ListenerKey, LogicalDatastoreType, MemoryDataStore,
};

/// Identifier fixtures for the VPN tables
pub mod ids {
    use super::*;

    /// `/vpn-instances/vpn-instance[name]` (CONFIG)
    pub fn vpn_instance(name: &str) -> InstanceIdentifier {
        InstanceIdentifier::builder("vpn-instances")
            .child("vpn-instance", name)
            .build()
    }

    /// `/vpn-instance-op-data/vpn-instance-op-data-entry[name]` (OPERATIONAL)
    pub fn vpn_instance_op(name: &str) -> InstanceIdentifier {
        InstanceIdentifier::builder("vpn-instance-op-data")
            .child("vpn-instance-op-data-entry", name)
            .build()
    }

    /// `/vpn-interfaces/vpn-interface[name]` (CONFIG)
    pub fn vpn_interface(name: &str) -> InstanceIdentifier {
        InstanceIdentifier::builder("vpn-interfaces")
            .child("vpn-interface", name)
            .build()
    }

    /// `/interfaces-state/interface[name]` (OPERATIONAL)
    pub fn interface_state(name: &str) -> InstanceIdentifier {
        InstanceIdentifier::builder("interfaces-state")
            .child("interface", name)
            .build()
    }
}

/// Coordinator configurations
pub mod configs {
    use super::*;
    use vpnmgr_common::ResolutionMode;

    /// Short ticks so real-time tests finish quickly.
    pub fn fast() -> DeferConfig {
        DeferConfig {
            default_retry_budget: 50,
            default_poll_interval_ms: 100,
            sweep_tick_ms: 20,
            registration_max_attempts: 3,
            registration_retry_tick_ms: 10,
            ..DeferConfig::default()
        }
    }

    /// Events expire after two 100ms poll intervals.
    pub fn short_budget() -> DeferConfig {
        DeferConfig {
            default_retry_budget: 2,
            default_poll_interval_ms: 100,
            ..fast()
        }
    }

    /// Every event resolved by the sweep only.
    pub fn poll_only() -> DeferConfig {
        DeferConfig {
            default_resolution_mode: ResolutionMode::Poll,
            ..fast()
        }
    }
}

/// A store, a recording handler and a started coordinator wired together.
pub struct TestEnv {
    pub store: Arc<MemoryDataStore>,
    pub handler: Arc<RecordingHandler>,
    pub coordinator: DependencyCoordinator<String>,
}

impl TestEnv {
    /// Builds and starts a coordinator with `config`.
    pub fn start(config: DeferConfig) -> Self {
        let store = Arc::new(MemoryDataStore::new());
        let handler = Arc::new(RecordingHandler::new());
        let metrics = DeferMetrics::new().expect("metrics registry");
        let coordinator =
            DependencyCoordinator::<String>::new(config, store.clone(), handler.clone(), metrics)
                .expect("valid coordinator config");
        coordinator.start();
        Self {
            store,
            handler,
            coordinator,
        }
    }

    /// Builds an ADD event for `vpn-interface[name]` carrying `name` as its
    /// payload.
    pub fn add_event(
        &self,
        name: &str,
        dependencies: Vec<DependencyData>,
    ) -> vpnmgr_common::DeferredEvent<String> {
        self.coordinator
            .event_builder()
            .key(ids::vpn_interface(name))
            .event_type(EventType::Add)
            .new_payload(name.to_string())
            .dependencies(dependencies)
            .build()
            .expect("valid deferred event")
    }

    /// Writes an empty record at `id`.
    pub fn write(&self, store: LogicalDatastoreType, id: InstanceIdentifier) {
        self.store
            .put(store, id, serde_json::json!({}))
            .expect("concrete identifier");
    }

    /// Deletes the record at `id`.
    pub fn delete(&self, store: LogicalDatastoreType, id: &InstanceIdentifier) {
        self.store.delete(store, id);
    }

    /// Registry key of the listener watching `interfaces-state/interface[*]`.
    pub fn interface_state_listener(&self) -> ListenerKey {
        ListenerKey::new(
            ids::interface_state("x").to_wildcard(),
            LogicalDatastoreType::Operational,
        )
    }

    /// Stops the coordinator.
    pub async fn stop(self) {
        self.coordinator.shutdown().await;
    }
}
