//! VPN interface binding
//!
//! A `vpn-interface` config entry can only be bound once its VPN instance
//! has an operational entry and the interface itself is up. Config changes
//! that arrive earlier are deferred through the [`DependencyCoordinator`]
//! and replayed into [`VpnInterfaceHandler`], which publishes the
//! `vpn-interface-op-data` entry.

use crate::mac_entry_cache::MacEntryCache;
use crate::tables;
use crate::types::{InterfaceOpState, VpnInstanceOpData, VpnInterface, VpnInterfaceOpData};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use vpnmgr_common::{
    ChangeHandler, ChangeNotification, DataBroker, DeferError, DependencyCoordinator,
    DependencyData, Disposition, EventType, InstanceIdentifier, LogicalDatastoreType, MemoryDataStore,
    Result, TaskError, TaskResult,
};

/// Publishes and withdraws `vpn-interface-op-data` entries.
pub struct VpnInterfaceHandler {
    store: Arc<MemoryDataStore>,
}

impl VpnInterfaceHandler {
    pub fn new(store: Arc<MemoryDataStore>) -> Self {
        Self { store }
    }

    async fn bind(&self, intf: &VpnInterface) -> TaskResult<()> {
        // A removal or a newer change may have overtaken the deferred event
        let current = self
            .store
            .get(LogicalDatastoreType::Config, &tables::vpn_interface(&intf.name))
            .ok_or_else(|| {
                TaskError::ignored(format!(
                    "vpn-interface {} was removed while deferred",
                    intf.name
                ))
            })?;
        let current: VpnInterface = serde_json::from_value(current).map_err(|e| {
            TaskError::invalid_entry(format!("malformed vpn-interface {}: {}", intf.name, e))
        })?;
        if &current != intf {
            return Err(TaskError::ignored(format!(
                "vpn-interface {} changed to VPN {} while deferred",
                intf.name, current.vpn_instance_name
            )));
        }

        let vpn_op = self
            .store
            .read(
                LogicalDatastoreType::Operational,
                &tables::vpn_instance_op(&intf.vpn_instance_name),
            )
            .await
            .map_err(|e| TaskError::internal(e.to_string()))?
            .ok_or_else(|| {
                TaskError::invalid_entry(format!(
                    "VPN instance {} has no operational entry",
                    intf.vpn_instance_name
                ))
            })?;
        let vpn_op: VpnInstanceOpData = serde_json::from_value(vpn_op).map_err(|e| {
            TaskError::invalid_entry(format!(
                "malformed operational entry for VPN {}: {}",
                intf.vpn_instance_name, e
            ))
        })?;

        let entry = VpnInterfaceOpData {
            name: intf.name.clone(),
            vpn_instance_name: intf.vpn_instance_name.clone(),
            vpn_id: vpn_op.vpn_id,
            ip_addresses: intf.ip_addresses.clone(),
            state: InterfaceOpState::Active,
        };
        let value = serde_json::to_value(&entry).map_err(|e| TaskError::internal(e.to_string()))?;
        self.store
            .put(
                LogicalDatastoreType::Operational,
                tables::vpn_interface_op(&intf.name),
                value,
            )
            .map_err(|e| TaskError::write_failed(e.to_string()))?;

        info!(
            interface = %intf.name,
            vpn = %intf.vpn_instance_name,
            vpn_id = vpn_op.vpn_id,
            "Bound VPN interface"
        );
        Ok(())
    }

    fn unbind(&self, intf: &VpnInterface) -> TaskResult<()> {
        let removed = self.store.delete(
            LogicalDatastoreType::Operational,
            &tables::vpn_interface_op(&intf.name),
        );
        if !removed {
            return Err(TaskError::ignored(format!(
                "vpn-interface {} was not bound",
                intf.name
            )));
        }
        info!(interface = %intf.name, vpn = %intf.vpn_instance_name, "Unbound VPN interface");
        Ok(())
    }
}

#[async_trait]
impl ChangeHandler<VpnInterface> for VpnInterfaceHandler {
    fn name(&self) -> &str {
        "vpn-interface"
    }

    async fn on_add(&self, _key: &InstanceIdentifier, intf: &VpnInterface) -> TaskResult<()> {
        self.bind(intf).await
    }

    async fn on_update(
        &self,
        _key: &InstanceIdentifier,
        old: &VpnInterface,
        new: &VpnInterface,
    ) -> TaskResult<()> {
        if old.vpn_instance_name != new.vpn_instance_name {
            if let Err(e) = self.unbind(old) {
                debug!(interface = %old.name, error = %e, "Nothing to unbind before rebinding");
            }
        }
        self.bind(new).await
    }

    async fn on_remove(&self, _key: &InstanceIdentifier, intf: &VpnInterface) -> TaskResult<()> {
        self.unbind(intf)
    }
}

/// Turns `vpn-interfaces` config changes into deferred bind events.
pub struct VpnInterfaceManager {
    coordinator: DependencyCoordinator<VpnInterface>,
    handler: Arc<VpnInterfaceHandler>,
    store: Arc<MemoryDataStore>,
    mac_cache: Option<Arc<MacEntryCache>>,
    /// Last applied config per interface name
    known: Mutex<HashMap<String, VpnInterface>>,
}

impl VpnInterfaceManager {
    pub fn new(
        coordinator: DependencyCoordinator<VpnInterface>,
        handler: Arc<VpnInterfaceHandler>,
        store: Arc<MemoryDataStore>,
    ) -> Self {
        Self {
            coordinator,
            handler,
            store,
            mac_cache: None,
            known: Mutex::new(HashMap::new()),
        }
    }

    /// Withdraws MAC entries learned on an interface when it is removed.
    pub fn with_mac_cache(mut self, mac_cache: Arc<MacEntryCache>) -> Self {
        self.mac_cache = Some(mac_cache);
        self
    }

    /// Records a binding needs before it can be published.
    pub fn dependencies(intf: &VpnInterface) -> Vec<DependencyData> {
        vec![
            DependencyData::presence(
                tables::vpn_instance_op(&intf.vpn_instance_name),
                LogicalDatastoreType::Operational,
            ),
            DependencyData::presence(
                tables::interface_state(&intf.name),
                LogicalDatastoreType::Operational,
            ),
        ]
    }

    /// Binds a new interface now, or once its dependencies appear.
    #[instrument(skip(self, intf), fields(interface = %intf.name))]
    pub async fn interface_added(&self, intf: VpnInterface) -> Result<Disposition<VpnInterface>> {
        self.known.lock().insert(intf.name.clone(), intf.clone());

        let event = self
            .coordinator
            .event_builder()
            .key(tables::vpn_interface(&intf.name))
            .event_type(EventType::Add)
            .dependencies(Self::dependencies(&intf))
            .new_payload(intf)
            .build()?;
        self.coordinator.defer_or_dispatch(event).await
    }

    /// Rebinds a changed interface now, or once the new VPN is ready.
    #[instrument(skip(self, old, new), fields(interface = %new.name))]
    pub async fn interface_updated(
        &self,
        old: VpnInterface,
        new: VpnInterface,
    ) -> Result<Disposition<VpnInterface>> {
        self.known.lock().insert(new.name.clone(), new.clone());

        let event = self
            .coordinator
            .event_builder()
            .key(tables::vpn_interface(&new.name))
            .event_type(EventType::Update)
            .dependencies(Self::dependencies(&new))
            .old_payload(old)
            .new_payload(new)
            .build()?;
        self.coordinator.defer_or_dispatch(event).await
    }

    /// Unbinds a removed interface. Removals have no preconditions and are
    /// applied directly.
    #[instrument(skip(self, intf), fields(interface = %intf.name))]
    pub async fn interface_removed(&self, intf: VpnInterface) -> TaskResult<()> {
        self.known.lock().remove(&intf.name);
        if let Some(cache) = &self.mac_cache {
            cache.forget_port(&intf.name);
        }
        self.handler
            .on_remove(&tables::vpn_interface(&intf.name), &intf)
            .await
    }

    /// Applies one `vpn-interfaces` change notification.
    pub async fn apply(&self, notification: ChangeNotification) -> Result<()> {
        let identifier = notification.identifier;
        let Some(name) = identifier.last_key().map(str::to_string) else {
            warn!(identifier = %identifier, "Ignoring change without interface key");
            return Ok(());
        };

        match notification.modification.expects_data() {
            Some(true) => {
                let Some(value) = self.store.get(LogicalDatastoreType::Config, &identifier) else {
                    debug!(interface = %name, "Entry already gone, skipping write");
                    return Ok(());
                };
                let intf: VpnInterface = serde_json::from_value(value).map_err(|e| {
                    DeferError::store("decode", format!("vpn-interface {}: {}", name, e))
                })?;

                let previous = self.known.lock().get(&name).cloned();
                match previous {
                    Some(old) if old == intf => {
                        debug!(interface = %name, "Config unchanged");
                    }
                    Some(old) => {
                        self.interface_updated(old, intf).await?;
                    }
                    None => {
                        self.interface_added(intf).await?;
                    }
                }
            }
            Some(false) => {
                let previous = self.known.lock().get(&name).cloned();
                if let Some(old) = previous {
                    if let Err(e) = self.interface_removed(old).await {
                        debug!(interface = %name, error = %e, "Removal had nothing to withdraw");
                    }
                }
            }
            None => {
                warn!(
                    interface = %name,
                    modification = ?notification.modification,
                    "Unexpected modification type"
                );
            }
        }
        Ok(())
    }

    /// Follows `vpn-interfaces` in CONFIG until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let mut subscription = self
            .store
            .register_listener(
                LogicalDatastoreType::Config,
                &tables::vpn_interfaces_wildcard(),
            )
            .await?;
        info!("Listening to vpn-interface changes");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                batch = subscription.recv() => match batch {
                    Some(batch) => {
                        for notification in batch {
                            if let Err(e) = self.apply(notification).await {
                                warn!(error = %e, "Failed to apply vpn-interface change");
                            }
                        }
                    }
                    None => {
                        warn!("vpn-interface subscription closed");
                        break;
                    }
                },
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;
    use vpnmgr_common::{DeferConfig, DeferMetrics};
    use vpnmgr_test::{wait_until, DEFAULT_DEADLINE};

    struct Fixture {
        store: Arc<MemoryDataStore>,
        coordinator: DependencyCoordinator<VpnInterface>,
        manager: Arc<VpnInterfaceManager>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryDataStore::new());
        let handler = Arc::new(VpnInterfaceHandler::new(store.clone()));
        let config = DeferConfig {
            default_poll_interval_ms: 100,
            default_retry_budget: 50,
            sweep_tick_ms: 20,
            registration_retry_tick_ms: 10,
            ..DeferConfig::default()
        };
        let coordinator = DependencyCoordinator::<VpnInterface>::new(
            config,
            store.clone(),
            handler.clone(),
            DeferMetrics::new().unwrap(),
        )
        .unwrap();
        coordinator.start();
        let manager = Arc::new(VpnInterfaceManager::new(
            coordinator.clone(),
            handler,
            store.clone(),
        ));
        Fixture {
            store,
            coordinator,
            manager,
        }
    }

    fn configure(store: &MemoryDataStore, intf: &VpnInterface) {
        store
            .put(
                LogicalDatastoreType::Config,
                tables::vpn_interface(&intf.name),
                serde_json::to_value(intf).unwrap(),
            )
            .unwrap();
    }

    fn vpn_ready(store: &MemoryDataStore, vpn: &str, vpn_id: u32) {
        store
            .put(
                LogicalDatastoreType::Operational,
                tables::vpn_instance_op(vpn),
                json!({"vpn-instance-name": vpn, "vpn-id": vpn_id}),
            )
            .unwrap();
    }

    fn interface_up(store: &MemoryDataStore, name: &str) {
        store
            .put(
                LogicalDatastoreType::Operational,
                tables::interface_state(name),
                json!({"oper-status": "up"}),
            )
            .unwrap();
    }

    fn op_data(store: &MemoryDataStore, name: &str) -> Option<VpnInterfaceOpData> {
        store
            .get(LogicalDatastoreType::Operational, &tables::vpn_interface_op(name))
            .map(|v| serde_json::from_value(v).unwrap())
    }

    #[tokio::test]
    async fn test_add_waits_for_vpn_and_interface() {
        let f = fixture();
        let intf = VpnInterface::new("tap0", "vpn1").with_address("10.0.0.1/24");
        configure(&f.store, &intf);

        let disposition = f.manager.interface_added(intf).await.unwrap();
        assert!(!disposition.is_dispatched());

        interface_up(&f.store, "tap0");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(op_data(&f.store, "tap0").is_none());

        vpn_ready(&f.store, "vpn1", 7);
        wait_until("tap0 to be bound", DEFAULT_DEADLINE, || {
            op_data(&f.store, "tap0").is_some()
        })
        .await
        .unwrap();

        let entry = op_data(&f.store, "tap0").unwrap();
        assert_eq!(entry.vpn_id, 7);
        assert_eq!(entry.state, InterfaceOpState::Active);
        assert_eq!(entry.ip_addresses, vec!["10.0.0.1/24".to_string()]);
        f.coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_add_binds_immediately_when_ready() {
        let f = fixture();
        let intf = VpnInterface::new("tap0", "vpn1");
        configure(&f.store, &intf);
        vpn_ready(&f.store, "vpn1", 3);
        interface_up(&f.store, "tap0");

        let disposition = f.manager.interface_added(intf).await.unwrap();
        assert!(disposition.is_dispatched());
        assert_eq!(op_data(&f.store, "tap0").unwrap().vpn_id, 3);
        assert_eq!(f.coordinator.pending_count(), 0);
        f.coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_update_moves_interface_to_new_vpn() {
        let f = fixture();
        let old = VpnInterface::new("tap0", "vpn1");
        let new = VpnInterface::new("tap0", "vpn2");
        configure(&f.store, &old);
        vpn_ready(&f.store, "vpn1", 1);
        interface_up(&f.store, "tap0");
        assert!(f.manager.interface_added(old.clone()).await.unwrap().is_dispatched());

        configure(&f.store, &new);
        let disposition = f.manager.interface_updated(old, new).await.unwrap();
        assert!(!disposition.is_dispatched());
        assert_eq!(op_data(&f.store, "tap0").unwrap().vpn_instance_name, "vpn1");

        vpn_ready(&f.store, "vpn2", 2);
        wait_until("tap0 to move to vpn2", DEFAULT_DEADLINE, || {
            op_data(&f.store, "tap0").map(|e| e.vpn_id) == Some(2)
        })
        .await
        .unwrap();
        f.coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_remove_withdraws_op_data() {
        let f = fixture();
        let intf = VpnInterface::new("tap0", "vpn1");
        configure(&f.store, &intf);
        vpn_ready(&f.store, "vpn1", 1);
        interface_up(&f.store, "tap0");
        f.manager.interface_added(intf.clone()).await.unwrap();
        assert!(op_data(&f.store, "tap0").is_some());

        f.manager.interface_removed(intf.clone()).await.unwrap();
        assert!(op_data(&f.store, "tap0").is_none());

        let again = f.manager.interface_removed(intf).await;
        assert!(matches!(again, Err(TaskError::Ignored { .. })));
        f.coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_remove_withdraws_learned_macs() {
        let store = Arc::new(MemoryDataStore::new());
        let handler = Arc::new(VpnInterfaceHandler::new(store.clone()));
        let coordinator = DependencyCoordinator::<VpnInterface>::new(
            DeferConfig::default(),
            store.clone(),
            handler.clone(),
            DeferMetrics::new().unwrap(),
        )
        .unwrap();
        let cache = Arc::new(MacEntryCache::new(
            store.clone(),
            Duration::from_secs(300),
            Duration::from_secs(1),
        ));
        let manager = VpnInterfaceManager::new(coordinator, handler, store.clone())
            .with_mac_cache(cache.clone());

        let addr = "10.0.0.5".parse().unwrap();
        cache.learn("vpn1", addr, "aa:aa:aa:aa:aa:aa", "tap0").unwrap();

        let _ = manager
            .interface_removed(VpnInterface::new("tap0", "vpn1"))
            .await;
        assert!(!cache.contains("vpn1", addr));
        assert!(store
            .get(
                LogicalDatastoreType::Operational,
                &tables::learnt_vip_to_port("vpn1", addr)
            )
            .is_none());
    }

    #[tokio::test]
    async fn test_deferred_add_after_removal_is_ignored() {
        let f = fixture();
        let intf = VpnInterface::new("tap0", "vpn1");
        configure(&f.store, &intf);
        f.manager.interface_added(intf.clone()).await.unwrap();

        f.store
            .delete(LogicalDatastoreType::Config, &tables::vpn_interface("tap0"));
        let _ = f.manager.interface_removed(intf).await;

        vpn_ready(&f.store, "vpn1", 1);
        interface_up(&f.store, "tap0");
        wait_until("deferred add to drain", DEFAULT_DEADLINE, || {
            f.coordinator.pending_count() == 0
        })
        .await
        .unwrap();
        assert!(op_data(&f.store, "tap0").is_none());
        f.coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_stale_add_does_not_override_newer_update() {
        let f = fixture();
        let first = VpnInterface::new("tap0", "vpn1");
        let second = VpnInterface::new("tap0", "vpn2");
        configure(&f.store, &first);
        assert!(!f.manager.interface_added(first.clone()).await.unwrap().is_dispatched());

        configure(&f.store, &second);
        assert!(!f
            .manager
            .interface_updated(first, second)
            .await
            .unwrap()
            .is_dispatched());

        interface_up(&f.store, "tap0");
        vpn_ready(&f.store, "vpn2", 2);
        wait_until("tap0 to bind to vpn2", DEFAULT_DEADLINE, || {
            op_data(&f.store, "tap0").map(|e| e.vpn_id) == Some(2)
        })
        .await
        .unwrap();

        vpn_ready(&f.store, "vpn1", 1);
        wait_until("stale add to drain", DEFAULT_DEADLINE, || {
            f.coordinator.pending_count() == 0
        })
        .await
        .unwrap();

        let entry = op_data(&f.store, "tap0").unwrap();
        assert_eq!(entry.vpn_instance_name, "vpn2");
        assert_eq!(entry.vpn_id, 2);
        f.coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_malformed_vpn_entry_is_invalid() {
        let store = Arc::new(MemoryDataStore::new());
        let handler = VpnInterfaceHandler::new(store.clone());
        let intf = VpnInterface::new("tap0", "vpn1");
        configure(&store, &intf);
        store
            .put(
                LogicalDatastoreType::Operational,
                tables::vpn_instance_op("vpn1"),
                json!({"vpn-instance-name": "vpn1"}),
            )
            .unwrap();

        let result = handler.on_add(&tables::vpn_interface("tap0"), &intf).await;
        assert!(matches!(result, Err(TaskError::InvalidEntry { .. })));
    }

    #[tokio::test]
    async fn test_run_follows_config_changes() {
        let f = fixture();
        let shutdown = CancellationToken::new();
        let runner = {
            let manager = Arc::clone(&f.manager);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { manager.run(shutdown).await })
        };
        wait_until("manager subscription", DEFAULT_DEADLINE, || {
            f.store.subscriber_count() >= 1
        })
        .await
        .unwrap();

        configure(&f.store, &VpnInterface::new("tap0", "vpn1"));
        vpn_ready(&f.store, "vpn1", 9);
        interface_up(&f.store, "tap0");
        wait_until("tap0 to be bound", DEFAULT_DEADLINE, || {
            op_data(&f.store, "tap0").is_some()
        })
        .await
        .unwrap();

        f.store
            .delete(LogicalDatastoreType::Config, &tables::vpn_interface("tap0"));
        wait_until("tap0 to be unbound", DEFAULT_DEADLINE, || {
            op_data(&f.store, "tap0").is_none()
        })
        .await
        .unwrap();

        shutdown.cancel();
        runner.await.unwrap().unwrap();
        f.coordinator.shutdown().await;
    }
}
