//! Deferred dependency resolution for the VPN manager.
//!
//! A change event for a VPN interface, adjacency or route frequently arrives
//! before the records it needs (or while records it must outlive still
//! exist). Instead of failing, the event is suspended in a
//! [`DependencyCoordinator`] until every [`DependencyData`] holds, then
//! replayed into its [`ChangeHandler`].
//!
//! - [`DeferredEvent`]: suspended event plus its outstanding dependencies
//! - [`DependencyData`]: "record X must exist / must not exist"
//! - [`WildCardListener`]: one change subscription per wildcard pattern,
//!   shared by every waiting event
//! - [`DependencyCoordinator`]: listener registry, poll sweep, expiry and
//!   dispatch
//! - [`DataBroker`]: datastore reads and subscriptions, with
//!   [`MemoryDataStore`] as the in-process implementation
//!
//! # Example
//!
//! ```ignore
//! use vpnmgr_common::{DependencyCoordinator, DependencyData, EventType, LogicalDatastoreType};
//!
//! let event = coordinator
//!     .event_builder()
//!     .key(vpn_interface_id("tap0"))
//!     .event_type(EventType::Add)
//!     .new_payload(interface)
//!     .dependency(DependencyData::presence(vpn_op_id("vpn1"), LogicalDatastoreType::Operational))
//!     .build()?;
//! coordinator.defer(event).await?;
//! ```

mod config;
mod coordinator;
mod datastore;
mod dependency;
mod error;
mod event;
mod handler;
mod identifier;
mod listener;
mod memory;
mod metrics;
mod task;

pub use config::DeferConfig;
pub use coordinator::{DependencyCoordinator, Disposition};
pub use datastore::{
    ChangeNotification, DataBroker, LogicalDatastoreType, ModificationType, Subscription,
};
pub use dependency::DependencyData;
pub use error::{DeferError, Result};
pub use event::{
    DeferOutcome, DeferredEvent, DeferredEventBuilder, EventSequence, EventType, ResolutionMode,
    DEFAULT_POLL_INTERVAL, DEFAULT_RETRY_BUDGET,
};
pub use handler::ChangeHandler;
pub use identifier::{InstanceIdentifier, InstanceIdentifierBuilder, PathArgument};
pub use listener::{BatchResolution, ListenerKey, ListenerState, WildCardListener};
pub use memory::MemoryDataStore;
pub use metrics::{DeferMetrics, PATH_LISTENER, PATH_POLL};
pub use task::{TaskError, TaskResult, TaskResultExt, TaskStatus};
