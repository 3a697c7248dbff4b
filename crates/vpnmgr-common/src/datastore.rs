//! Narrow interface to the structured datastore.
//!
//! The engine needs two things from the datastore: point reads, used by the
//! poll path, and wildcard change subscriptions, used by
//! [`WildCardListener`](crate::WildCardListener). Both are behind the
//! [`DataBroker`] trait so the real datastore adapter stays outside this
//! crate.

use crate::error::Result;
use crate::identifier::InstanceIdentifier;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

/// Logical datastore a record lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicalDatastoreType {
    /// Intended configuration
    Config,
    /// Derived operational state
    Operational,
}

impl LogicalDatastoreType {
    /// Returns the store name as used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogicalDatastoreType::Config => "CONFIG",
            LogicalDatastoreType::Operational => "OPERATIONAL",
        }
    }
}

impl fmt::Display for LogicalDatastoreType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a record changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModificationType {
    /// Record created or replaced
    Write,
    /// A descendant of the record changed
    SubtreeModified,
    /// Record removed
    Delete,
    /// A modification code this engine does not understand
    Unrecognized(u8),
}

impl ModificationType {
    /// Maps the modification onto dependency polarity: `Some(true)` for
    /// presence, `Some(false)` for absence, `None` when unrecognized.
    pub fn expects_data(&self) -> Option<bool> {
        match self {
            ModificationType::Write | ModificationType::SubtreeModified => Some(true),
            ModificationType::Delete => Some(false),
            ModificationType::Unrecognized(_) => None,
        }
    }
}

/// A single change delivered by a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotification {
    /// Concrete identifier of the changed record
    pub identifier: InstanceIdentifier,
    /// Kind of change
    pub modification: ModificationType,
}

impl ChangeNotification {
    /// Creates a notification.
    pub fn new(identifier: InstanceIdentifier, modification: ModificationType) -> Self {
        Self {
            identifier,
            modification,
        }
    }

    /// Creates a WRITE notification.
    pub fn written(identifier: InstanceIdentifier) -> Self {
        Self::new(identifier, ModificationType::Write)
    }

    /// Creates a DELETE notification.
    pub fn deleted(identifier: InstanceIdentifier) -> Self {
        Self::new(identifier, ModificationType::Delete)
    }
}

/// Stream of notification batches for one wildcard subscription.
///
/// Dropping the subscription closes it; the datastore stops delivering on
/// its next write.
#[derive(Debug)]
pub struct Subscription {
    receiver: mpsc::UnboundedReceiver<Vec<ChangeNotification>>,
}

impl Subscription {
    /// Wraps the receiving half of a notification channel.
    pub fn new(receiver: mpsc::UnboundedReceiver<Vec<ChangeNotification>>) -> Self {
        Self { receiver }
    }

    /// Waits for the next batch. Returns `None` once the datastore side
    /// has gone away.
    pub async fn recv(&mut self) -> Option<Vec<ChangeNotification>> {
        self.receiver.recv().await
    }
}

/// Datastore access used by the engine.
#[async_trait]
pub trait DataBroker: Send + Sync {
    /// Reads the record at `identifier`.
    async fn read(
        &self,
        store: LogicalDatastoreType,
        identifier: &InstanceIdentifier,
    ) -> Result<Option<serde_json::Value>>;

    /// Subscribes to changes of every record matching `pattern`.
    async fn register_listener(
        &self,
        store: LogicalDatastoreType,
        pattern: &InstanceIdentifier,
    ) -> Result<Subscription>;

    /// Returns true if a record exists at `identifier`.
    async fn exists(
        &self,
        store: LogicalDatastoreType,
        identifier: &InstanceIdentifier,
    ) -> Result<bool> {
        Ok(self.read(store, identifier).await?.is_some())
    }
}
