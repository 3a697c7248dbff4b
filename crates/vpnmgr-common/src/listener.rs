//! Wildcard change listeners.
//!
//! One [`WildCardListener`] exists per `(pattern, store)` pair with at least
//! one deferred event waiting on it. It bridges "a dependency is watched
//! through wildcard pattern P" to "every deferred event whose concrete target
//! lies under P".
//!
//! # State machine
//!
//! ```text
//! Registering ──(subscribed)──▶ Active ──(idle / shutdown)──▶ Closed
//!      │                                                        ▲
//!      └──(attempts exhausted)──▶ Failed ──(idle / shutdown)────┘
//! ```
//!
//! A `Failed` listener is inert: it keeps its waiting maps so the sweep can
//! resolve its events by direct reads, but never sees a notification.
//!
//! # Locking
//!
//! The waiting maps live behind one mutex per listener. Lock order is
//! waiting maps, then listener state, then an event's dependency lock. No
//! lock is held while the handler runs or while awaiting.

use crate::datastore::{ChangeNotification, DataBroker, LogicalDatastoreType, Subscription};
use crate::dependency::DependencyData;
use crate::error::{DeferError, Result};
use crate::event::DeferredEvent;
use crate::identifier::InstanceIdentifier;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Registry key of a listener.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerKey {
    pub pattern: InstanceIdentifier,
    pub store: LogicalDatastoreType,
}

impl ListenerKey {
    pub fn new(pattern: InstanceIdentifier, store: LogicalDatastoreType) -> Self {
        Self { pattern, store }
    }

    /// Key of the listener watching `dependency`.
    pub fn for_dependency(dependency: &DependencyData) -> Self {
        Self::new(dependency.wildcard().clone(), dependency.store())
    }
}

impl fmt::Display for ListenerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.store, self.pattern)
    }
}

/// Lifecycle of a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerState {
    /// Subscription setup in progress
    Registering,
    /// Receiving notifications
    Active,
    /// Registration abandoned; inert
    Failed,
    /// Torn down; accepts no new waiters
    Closed,
}

/// Outcome of feeding one notification batch through a listener.
#[derive(Debug)]
pub struct BatchResolution<T> {
    /// Events that became fully resolved, FIFO by `queued_at`
    pub resolved: Vec<Arc<DeferredEvent<T>>>,
    /// Number of dependencies struck
    pub struck: usize,
}

impl<T> Default for BatchResolution<T> {
    fn default() -> Self {
        Self {
            resolved: Vec::new(),
            struck: 0,
        }
    }
}

struct WaitingMaps<T> {
    waiting_for_add: HashMap<InstanceIdentifier, Vec<Arc<DeferredEvent<T>>>>,
    waiting_for_delete: HashMap<InstanceIdentifier, Vec<Arc<DeferredEvent<T>>>>,
    /// Event seq -> dependencies of that event watched here. Its length is
    /// the listener's reference count.
    pending: HashMap<u64, Vec<DependencyData>>,
}

impl<T> WaitingMaps<T> {
    fn new() -> Self {
        Self {
            waiting_for_add: HashMap::new(),
            waiting_for_delete: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    fn map_mut(
        &mut self,
        expect_data: bool,
    ) -> &mut HashMap<InstanceIdentifier, Vec<Arc<DeferredEvent<T>>>> {
        if expect_data {
            &mut self.waiting_for_add
        } else {
            &mut self.waiting_for_delete
        }
    }

    fn unlink(&mut self, seq: u64, target: &InstanceIdentifier, expect_data: bool) {
        let map = self.map_mut(expect_data);
        if let Some(list) = map.get_mut(target) {
            list.retain(|event| event.seq() != seq);
            if list.is_empty() {
                map.remove(target);
            }
        }
    }

    /// Drops `removed` from the pending queue of event `seq`. Returns false
    /// if the event had no queue here.
    fn release(&mut self, seq: u64, removed: &[DependencyData]) -> bool {
        match self.pending.get_mut(&seq) {
            Some(queue) => {
                queue.retain(|dep| !removed.contains(dep));
                if queue.is_empty() {
                    self.pending.remove(&seq);
                }
                true
            }
            None => false,
        }
    }
}

/// Listener for one wildcard pattern in one logical store.
pub struct WildCardListener<T> {
    key: ListenerKey,
    state: Mutex<ListenerState>,
    waiting: Mutex<WaitingMaps<T>>,
    cancel: CancellationToken,
}

impl<T> WildCardListener<T> {
    /// Creates a listener in the `Registering` state. `parent` cancels it
    /// on coordinator shutdown.
    pub fn new(key: ListenerKey, parent: &CancellationToken) -> Self {
        Self {
            key,
            state: Mutex::new(ListenerState::Registering),
            waiting: Mutex::new(WaitingMaps::new()),
            cancel: parent.child_token(),
        }
    }

    pub fn key(&self) -> &ListenerKey {
        &self.key
    }

    pub fn state(&self) -> ListenerState {
        *self.state.lock()
    }

    pub fn is_active(&self) -> bool {
        self.state() == ListenerState::Active
    }

    /// Token cancelled when the listener closes.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Number of deferred events depending on this listener.
    pub fn dependent_count(&self) -> usize {
        self.waiting.lock().pending.len()
    }

    /// Total entries across both waiting maps.
    pub fn waiting_len(&self) -> usize {
        let waiting = self.waiting.lock();
        waiting.waiting_for_add.values().map(Vec::len).sum::<usize>()
            + waiting.waiting_for_delete.values().map(Vec::len).sum::<usize>()
    }

    /// Returns true if event `seq` appears in either waiting map.
    pub fn is_waiting(&self, seq: u64) -> bool {
        let waiting = self.waiting.lock();
        waiting
            .waiting_for_add
            .values()
            .chain(waiting.waiting_for_delete.values())
            .any(|list| list.iter().any(|event| event.seq() == seq))
    }

    /// Concrete targets with waiters, with the polarity they wait for.
    pub fn waiting_targets(&self) -> Vec<(InstanceIdentifier, bool)> {
        let waiting = self.waiting.lock();
        waiting
            .waiting_for_add
            .keys()
            .map(|id| (id.clone(), true))
            .chain(waiting.waiting_for_delete.keys().map(|id| (id.clone(), false)))
            .collect()
    }

    /// Registers `event` as waiting on `dependency`.
    ///
    /// Returns false if the listener is already closed; the caller must
    /// obtain a fresh listener for the pattern. Checked under the same lock
    /// as [`close_if_idle`](Self::close_if_idle), so a waiter is never added
    /// to a listener that is being torn down.
    pub fn add_waiter(&self, event: &Arc<DeferredEvent<T>>, dependency: DependencyData) -> bool {
        let mut waiting = self.waiting.lock();
        if self.state() == ListenerState::Closed {
            return false;
        }

        let list = waiting
            .map_mut(dependency.expect_data())
            .entry(dependency.target().clone())
            .or_default();
        if !list.iter().any(|e| e.seq() == event.seq()) {
            list.push(Arc::clone(event));
        }

        let queue = waiting.pending.entry(event.seq()).or_default();
        if !queue.contains(&dependency) {
            queue.push(dependency);
        }
        true
    }

    /// Applies one batch of notifications.
    ///
    /// For each notification the complete waiting list of the changed
    /// identifier is taken out of the map, so a concurrent batch for the
    /// same identifier cannot process the same waiters twice. Resolved
    /// events are returned for dispatch; nothing is dispatched here.
    pub fn on_data_changed(&self, notifications: &[ChangeNotification]) -> BatchResolution<T> {
        let mut result = BatchResolution::default();

        for notification in notifications {
            let expect_data = match notification.modification.expects_data() {
                Some(expect_data) => expect_data,
                None => {
                    warn!(
                        listener = %self.key,
                        identifier = %notification.identifier,
                        modification = ?notification.modification,
                        "Unexpected modification type, dropping notification"
                    );
                    continue;
                }
            };

            let waiters = self
                .waiting
                .lock()
                .map_mut(expect_data)
                .remove(&notification.identifier);
            let Some(waiters) = waiters else {
                debug!(
                    listener = %self.key,
                    identifier = %notification.identifier,
                    "No deferred event waiting on notification"
                );
                continue;
            };

            for event in waiters {
                match self.resolve_waiter(&event, &notification.identifier, expect_data) {
                    Ok(struck) => {
                        result.struck += struck;
                        if struck > 0 && event.is_resolved() {
                            result.resolved.push(event);
                        }
                    }
                    Err(e) => {
                        warn!(listener = %self.key, error = %e, "Failed to resolve deferred event");
                    }
                }
            }
        }

        result.resolved.sort();
        result.resolved.dedup_by_key(|event| event.seq());
        result
    }

    fn resolve_waiter(
        &self,
        event: &Arc<DeferredEvent<T>>,
        target: &InstanceIdentifier,
        expect_data: bool,
    ) -> Result<usize> {
        if event.is_terminal() {
            debug!(key = %event.key(), "Deferred event already completed");
            self.waiting.lock().pending.remove(&event.seq());
            return Ok(0);
        }

        let removed = event.remove_resolved_dependency(target, self.key.store, expect_data);
        let tracked = self.waiting.lock().release(event.seq(), &removed);
        if !tracked && !removed.is_empty() {
            return Err(DeferError::resolution(
                event.key(),
                target,
                format!("event is not tracked by listener {}", self.key),
            ));
        }

        debug!(
            key = %event.key(),
            target = %target,
            struck = removed.len(),
            remaining = event.dependency_count(),
            "Dependency resolved by notification"
        );
        Ok(removed.len())
    }

    /// Strikes `dependency` of `event` after it was found satisfied by a
    /// direct read, and unlinks the event from the waiting map.
    pub fn strike(&self, event: &DeferredEvent<T>, dependency: &DependencyData) -> Vec<DependencyData> {
        {
            let mut waiting = self.waiting.lock();
            waiting.unlink(event.seq(), dependency.target(), dependency.expect_data());
            waiting.release(event.seq(), std::slice::from_ref(dependency));
        }
        event.remove_resolved_dependency(dependency.target(), dependency.store(), dependency.expect_data())
    }

    /// Removes every trace of event `seq` (dispatched or expired elsewhere).
    /// Returns the remaining dependent count.
    pub fn forget(&self, seq: u64) -> usize {
        let mut waiting = self.waiting.lock();
        if let Some(dependencies) = waiting.pending.remove(&seq) {
            for dependency in dependencies {
                waiting.unlink(seq, dependency.target(), dependency.expect_data());
            }
        }
        waiting.pending.len()
    }

    /// Closes the listener if no event depends on it. Returns true if this
    /// call closed it.
    pub fn close_if_idle(&self) -> bool {
        let mut waiting = self.waiting.lock();
        if !waiting.pending.is_empty() {
            return false;
        }
        let closed = self.transition_closed();
        if closed {
            waiting.waiting_for_add.clear();
            waiting.waiting_for_delete.clear();
        }
        closed
    }

    /// Closes the listener unconditionally.
    pub fn close(&self) {
        let _waiting = self.waiting.lock();
        self.transition_closed();
    }

    /// Marks a listener whose subscription went away as inert. Its waiters
    /// are then resolved by direct reads.
    pub fn fail(&self) {
        let mut state = self.state.lock();
        if *state != ListenerState::Closed {
            *state = ListenerState::Failed;
        }
    }

    fn transition_closed(&self) -> bool {
        let mut state = self.state.lock();
        if *state == ListenerState::Closed {
            return false;
        }
        *state = ListenerState::Closed;
        self.cancel.cancel();
        true
    }

    /// Establishes the wildcard subscription, retrying every `tick` up to
    /// `max_attempts` times. On exhaustion the listener becomes `Failed`.
    pub async fn register(
        &self,
        broker: &dyn DataBroker,
        max_attempts: u32,
        tick: Duration,
    ) -> Result<Subscription> {
        for attempt in 1..=max_attempts {
            if self.cancel.is_cancelled() {
                break;
            }
            debug!(listener = %self.key, attempt, "Registering wildcard listener");

            match broker.register_listener(self.key.store, &self.key.pattern).await {
                Ok(subscription) => {
                    let mut state = self.state.lock();
                    if *state != ListenerState::Registering {
                        return Err(DeferError::store(
                            "register",
                            format!("listener {} closed during registration", self.key),
                        ));
                    }
                    *state = ListenerState::Active;
                    info!(listener = %self.key, attempt, "Wildcard listener active");
                    return Ok(subscription);
                }
                Err(e) => {
                    warn!(listener = %self.key, attempt, max_attempts, error = %e, "Listener registration attempt failed");
                    if attempt < max_attempts {
                        tokio::select! {
                            _ = self.cancel.cancelled() => break,
                            _ = tokio::time::sleep(tick) => {}
                        }
                    }
                }
            }
        }

        if self.cancel.is_cancelled() {
            return Err(DeferError::store(
                "register",
                format!("listener {} closed during registration", self.key),
            ));
        }

        {
            let mut state = self.state.lock();
            if *state == ListenerState::Registering {
                *state = ListenerState::Failed;
            }
        }
        error!(
            listener = %self.key,
            max_attempts,
            "Giving up on wildcard listener registration, dependent events fall back to polling"
        );
        Err(DeferError::Registration {
            pattern: self.key.pattern.to_string(),
            store: self.key.store,
            attempts: max_attempts,
        })
    }
}
