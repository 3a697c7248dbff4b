//! In-memory datastore backend.
//!
//! [`MemoryDataStore`] implements [`DataBroker`] over two ordered maps (one
//! per logical store) and fans every write and delete out to the wildcard
//! subscriptions whose pattern matches the changed identifier. It backs the
//! daemon when no external datastore adapter is wired in, and the tests.

use crate::datastore::{
    ChangeNotification, DataBroker, LogicalDatastoreType, ModificationType, Subscription,
};
use crate::error::{DeferError, Result};
use crate::identifier::InstanceIdentifier;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::debug;

struct Subscriber {
    store: LogicalDatastoreType,
    pattern: InstanceIdentifier,
    sender: mpsc::UnboundedSender<Vec<ChangeNotification>>,
}

/// Datastore held entirely in memory.
#[derive(Default)]
pub struct MemoryDataStore {
    config: RwLock<BTreeMap<InstanceIdentifier, Value>>,
    operational: RwLock<BTreeMap<InstanceIdentifier, Value>>,
    subscribers: Mutex<Vec<Subscriber>>,
    failing_registrations: AtomicU32,
    registrations: AtomicU64,
}

impl MemoryDataStore {
    /// Creates an empty datastore.
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self, store: LogicalDatastoreType) -> &RwLock<BTreeMap<InstanceIdentifier, Value>> {
        match store {
            LogicalDatastoreType::Config => &self.config,
            LogicalDatastoreType::Operational => &self.operational,
        }
    }

    fn ensure_concrete(identifier: &InstanceIdentifier) -> Result<()> {
        if identifier.is_wildcarded() {
            return Err(DeferError::invalid_identifier(
                identifier.to_string(),
                "records can only be written at concrete identifiers",
            ));
        }
        Ok(())
    }

    /// Creates or replaces the record at `identifier` (WRITE).
    pub fn put(
        &self,
        store: LogicalDatastoreType,
        identifier: InstanceIdentifier,
        value: Value,
    ) -> Result<()> {
        Self::ensure_concrete(&identifier)?;
        self.table(store).write().insert(identifier.clone(), value);
        self.notify(store, vec![ChangeNotification::written(identifier)]);
        Ok(())
    }

    /// Merges `value` into the existing record. An existing object record
    /// produces SUBTREE_MODIFIED; otherwise this behaves like [`put`].
    ///
    /// [`put`]: MemoryDataStore::put
    pub fn merge(
        &self,
        store: LogicalDatastoreType,
        identifier: InstanceIdentifier,
        value: Value,
    ) -> Result<()> {
        Self::ensure_concrete(&identifier)?;
        let modification = {
            let mut table = self.table(store).write();
            let merged = match (table.get_mut(&identifier), &value) {
                (Some(Value::Object(existing)), Value::Object(update)) => {
                    existing.extend(update.clone());
                    true
                }
                _ => false,
            };
            if merged {
                ModificationType::SubtreeModified
            } else {
                table.insert(identifier.clone(), value);
                ModificationType::Write
            }
        };
        self.notify(store, vec![ChangeNotification::new(identifier, modification)]);
        Ok(())
    }

    /// Deletes the record at `identifier`. Returns false (and notifies
    /// nobody) if there was no such record.
    pub fn delete(&self, store: LogicalDatastoreType, identifier: &InstanceIdentifier) -> bool {
        let removed = self.table(store).write().remove(identifier).is_some();
        if removed {
            self.notify(store, vec![ChangeNotification::deleted(identifier.clone())]);
        }
        removed
    }

    /// Returns a copy of the record at `identifier`.
    pub fn get(&self, store: LogicalDatastoreType, identifier: &InstanceIdentifier) -> Option<Value> {
        self.table(store).read().get(identifier).cloned()
    }

    /// Returns the number of records in `store`.
    pub fn len(&self, store: LogicalDatastoreType) -> usize {
        self.table(store).read().len()
    }

    pub fn is_empty(&self, store: LogicalDatastoreType) -> bool {
        self.table(store).read().is_empty()
    }

    /// Delivers raw notifications to matching subscribers without touching
    /// stored data.
    pub fn publish(&self, store: LogicalDatastoreType, notifications: Vec<ChangeNotification>) {
        self.notify(store, notifications);
    }

    /// Makes the next `count` listener registrations fail.
    pub fn fail_next_registrations(&self, count: u32) {
        self.failing_registrations.store(count, Ordering::SeqCst);
    }

    /// Total successful registrations so far.
    pub fn registration_count(&self) -> u64 {
        self.registrations.load(Ordering::SeqCst)
    }

    /// Number of subscriptions whose receiver is still alive.
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|sub| !sub.sender.is_closed());
        subscribers.len()
    }

    fn notify(&self, store: LogicalDatastoreType, notifications: Vec<ChangeNotification>) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|sub| {
            if sub.store != store {
                return !sub.sender.is_closed();
            }
            let batch: Vec<ChangeNotification> = notifications
                .iter()
                .filter(|n| sub.pattern.matches(&n.identifier))
                .cloned()
                .collect();
            if batch.is_empty() {
                return !sub.sender.is_closed();
            }
            match sub.sender.send(batch) {
                Ok(()) => true,
                Err(_) => {
                    debug!(pattern = %sub.pattern, store = %sub.store, "Dropping closed subscription");
                    false
                }
            }
        });
    }
}

#[async_trait]
impl DataBroker for MemoryDataStore {
    async fn read(
        &self,
        store: LogicalDatastoreType,
        identifier: &InstanceIdentifier,
    ) -> Result<Option<Value>> {
        Ok(self.get(store, identifier))
    }

    async fn register_listener(
        &self,
        store: LogicalDatastoreType,
        pattern: &InstanceIdentifier,
    ) -> Result<Subscription> {
        let should_fail = self
            .failing_registrations
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(DeferError::store(
                "register",
                format!("registration of {} rejected", pattern),
            ));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers.lock().push(Subscriber {
            store,
            pattern: pattern.clone(),
            sender,
        });
        self.registrations.fetch_add(1, Ordering::SeqCst);
        Ok(Subscription::new(receiver))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use LogicalDatastoreType::{Config, Operational};

    fn vpn(name: &str) -> InstanceIdentifier {
        InstanceIdentifier::builder("vpn-instances")
            .child("vpn-instance", name)
            .build()
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryDataStore::new();
        store.put(Config, vpn("vpn1"), json!({"rd": "100:1"})).unwrap();

        assert_eq!(store.read(Config, &vpn("vpn1")).await.unwrap(), Some(json!({"rd": "100:1"})));
        assert!(store.exists(Config, &vpn("vpn1")).await.unwrap());
        assert!(!store.exists(Operational, &vpn("vpn1")).await.unwrap());
        assert_eq!(store.len(Config), 1);

        assert!(store.delete(Config, &vpn("vpn1")));
        assert!(!store.delete(Config, &vpn("vpn1")));
        assert!(store.is_empty(Config));
    }

    #[test]
    fn test_put_rejects_wildcard() {
        let store = MemoryDataStore::new();
        assert!(store.put(Config, vpn("vpn1").to_wildcard(), json!({})).is_err());
    }

    #[tokio::test]
    async fn test_wildcard_fan_out() {
        let store = MemoryDataStore::new();
        let mut sub = store
            .register_listener(Config, &vpn("x").to_wildcard())
            .await
            .unwrap();
        let mut other_store = store
            .register_listener(Operational, &vpn("x").to_wildcard())
            .await
            .unwrap();

        store.put(Config, vpn("vpn1"), json!({"rd": "100:1"})).unwrap();
        store.merge(Config, vpn("vpn1"), json!({"rt": "100:2"})).unwrap();
        store.delete(Config, &vpn("vpn1"));
        store.put(Operational, vpn("vpn1"), json!({})).unwrap();

        assert_eq!(sub.recv().await.unwrap(), vec![ChangeNotification::written(vpn("vpn1"))]);
        assert_eq!(
            sub.recv().await.unwrap(),
            vec![ChangeNotification::new(vpn("vpn1"), ModificationType::SubtreeModified)]
        );
        assert_eq!(sub.recv().await.unwrap(), vec![ChangeNotification::deleted(vpn("vpn1"))]);
        assert_eq!(
            other_store.recv().await.unwrap(),
            vec![ChangeNotification::written(vpn("vpn1"))]
        );
        assert_eq!(
            store.get(Config, &vpn("vpn1")),
            None,
            "merge followed by delete leaves nothing"
        );
    }

    #[tokio::test]
    async fn test_injected_registration_failures() {
        let store = MemoryDataStore::new();
        store.fail_next_registrations(2);

        let pattern = vpn("x").to_wildcard();
        assert!(store.register_listener(Config, &pattern).await.is_err());
        assert!(store.register_listener(Config, &pattern).await.is_err());
        let sub = store.register_listener(Config, &pattern).await.unwrap();

        assert_eq!(store.registration_count(), 1);
        assert_eq!(store.subscriber_count(), 1);
        drop(sub);
        assert_eq!(store.subscriber_count(), 0);
    }
}
