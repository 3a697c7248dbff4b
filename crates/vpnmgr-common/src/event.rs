//! Deferred events and their builder.
//!
//! A [`DeferredEvent`] is a change notification that could not be processed
//! when it arrived because records it depends on were missing (or still
//! present). It carries the original event plus the outstanding
//! [`DependencyData`] set; the dependency set only ever shrinks.

use crate::datastore::{DataBroker, LogicalDatastoreType};
use crate::dependency::DependencyData;
use crate::error::{DeferError, Result};
use crate::identifier::InstanceIdentifier;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Default number of poll intervals an event may stay deferred.
pub const DEFAULT_RETRY_BUDGET: u32 = 3;

/// Default interval between direct re-reads of an event's dependencies.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);

const STATE_PENDING: u8 = 0;
const STATE_DISPATCHED: u8 = 1;
const STATE_EXPIRED: u8 = 2;

/// Source of event sequence numbers.
///
/// Each coordinator owns one; clones share the counter. Sequence numbers
/// identify an event inside the listener maps and break FIFO ties, so the
/// events deferred into one coordinator must all be numbered by its
/// sequence.
#[derive(Debug, Clone, Default)]
pub struct EventSequence(Arc<AtomicU64>);

impl EventSequence {
    pub fn new() -> Self {
        Self::default()
    }

    fn next(&self) -> u64 {
        self.0.fetch_add(1, AtomicOrdering::Relaxed) + 1
    }

    /// Returns true if both handles share one counter.
    pub fn same_as(&self, other: &EventSequence) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Kind of change being replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Add,
    Update,
    Remove,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Add => "add",
            EventType::Update => "update",
            EventType::Remove => "remove",
        }
    }
}

/// How an event's dependencies get re-checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionMode {
    /// Direct re-read on every poll interval
    Poll,
    /// Wildcard change subscription
    #[default]
    Reactive,
}

/// Terminal outcome of a deferred event, as seen by a bounded waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeferOutcome {
    /// Replayed into the handler
    Dispatched,
    /// Retry budget exhausted; dropped without dispatch
    Expired,
    /// The waiter gave up first; the event is still queued
    TimedOut,
}

/// A suspended change event waiting for its dependencies.
pub struct DeferredEvent<T> {
    seq: u64,
    sequence: EventSequence,
    key: InstanceIdentifier,
    event_type: EventType,
    old_payload: Option<T>,
    new_payload: T,
    broker: Arc<dyn DataBroker>,
    /// Outstanding dependencies. Lock scope: this event only.
    dependencies: Mutex<Vec<DependencyData>>,
    retry_budget: u32,
    poll_interval: Duration,
    queued_at: Instant,
    expires_at: Instant,
    last_checked_at: Mutex<Instant>,
    resolution_mode: ResolutionMode,
    state: AtomicU8,
    waiter: Mutex<Option<oneshot::Sender<DeferOutcome>>>,
}

impl<T> DeferredEvent<T> {
    /// Starts a builder numbering its event from `sequence`.
    pub fn builder(sequence: &EventSequence) -> DeferredEventBuilder<T> {
        DeferredEventBuilder::new(sequence)
    }

    /// Sequence number, unique within the event's [`EventSequence`].
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// The sequence that numbered this event.
    pub fn sequence(&self) -> &EventSequence {
        &self.sequence
    }

    pub fn key(&self) -> &InstanceIdentifier {
        &self.key
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    /// Previous payload; only present for [`EventType::Update`].
    pub fn old_payload(&self) -> Option<&T> {
        self.old_payload.as_ref()
    }

    pub fn new_payload(&self) -> &T {
        &self.new_payload
    }

    /// Datastore handle used for direct dependency reads.
    pub fn broker(&self) -> &Arc<dyn DataBroker> {
        &self.broker
    }

    pub fn retry_budget(&self) -> u32 {
        self.retry_budget
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn queued_at(&self) -> Instant {
        self.queued_at
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    pub fn last_checked_at(&self) -> Instant {
        *self.last_checked_at.lock()
    }

    pub fn resolution_mode(&self) -> ResolutionMode {
        self.resolution_mode
    }

    /// Records a direct re-check at `now`.
    pub fn mark_checked(&self, now: Instant) {
        *self.last_checked_at.lock() = now;
    }

    /// Returns true if a poll re-check is due at `now`.
    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.last_checked_at() + self.poll_interval
    }

    /// Returns true if the retry budget is exhausted at `now`.
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// Snapshot of the outstanding dependencies.
    pub fn pending_dependencies(&self) -> Vec<DependencyData> {
        self.dependencies.lock().clone()
    }

    pub fn dependency_count(&self) -> usize {
        self.dependencies.lock().len()
    }

    /// Removes every outstanding dependency on `(target, store)` with the
    /// given polarity and returns the removed entries.
    pub fn remove_resolved_dependency(
        &self,
        target: &InstanceIdentifier,
        store: LogicalDatastoreType,
        expect_data: bool,
    ) -> Vec<DependencyData> {
        let mut dependencies = self.dependencies.lock();
        let mut removed = Vec::new();
        dependencies.retain(|dep| {
            if dep.resolved_by(target, store, expect_data) {
                removed.push(dep.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    /// True once every dependency has been struck. Never reverts.
    pub fn is_resolved(&self) -> bool {
        self.dependencies.lock().is_empty()
    }

    /// True once the event was dispatched or expired.
    pub fn is_terminal(&self) -> bool {
        self.state.load(AtomicOrdering::Acquire) != STATE_PENDING
    }

    /// Moves the event into its terminal state. Only the first caller wins;
    /// the winner is the one allowed to dispatch (or drop) the event.
    pub fn try_complete(&self, outcome: DeferOutcome) -> bool {
        let target = match outcome {
            DeferOutcome::Dispatched => STATE_DISPATCHED,
            DeferOutcome::Expired => STATE_EXPIRED,
            DeferOutcome::TimedOut => return false,
        };
        let won = self
            .state
            .compare_exchange(STATE_PENDING, target, AtomicOrdering::AcqRel, AtomicOrdering::Acquire)
            .is_ok();
        if won {
            if let Some(waiter) = self.waiter.lock().take() {
                let _ = waiter.send(outcome);
            }
        }
        won
    }

    /// Returns a receiver fired with the terminal outcome. Replaces any
    /// earlier waiter.
    pub fn subscribe_outcome(&self) -> oneshot::Receiver<DeferOutcome> {
        let (tx, rx) = oneshot::channel();
        *self.waiter.lock() = Some(tx);
        rx
    }

    fn order_key(&self) -> (Instant, u64) {
        (self.queued_at, self.seq)
    }
}

impl<T> fmt::Debug for DeferredEvent<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredEvent")
            .field("seq", &self.seq)
            .field("key", &self.key.to_string())
            .field("event_type", &self.event_type)
            .field("dependencies", &*self.dependencies.lock())
            .field("retry_budget", &self.retry_budget)
            .field("poll_interval", &self.poll_interval)
            .field("resolution_mode", &self.resolution_mode)
            .finish()
    }
}

impl<T> PartialEq for DeferredEvent<T> {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl<T> Eq for DeferredEvent<T> {}

impl<T> PartialOrd for DeferredEvent<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// FIFO by `queued_at`, ties broken by build order.
impl<T> Ord for DeferredEvent<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.order_key().cmp(&other.order_key())
    }
}

/// Validating builder for [`DeferredEvent`].
pub struct DeferredEventBuilder<T> {
    sequence: EventSequence,
    key: Option<InstanceIdentifier>,
    event_type: Option<EventType>,
    old_payload: Option<T>,
    new_payload: Option<T>,
    broker: Option<Arc<dyn DataBroker>>,
    dependencies: Vec<DependencyData>,
    retry_budget: u32,
    poll_interval: Duration,
    resolution_mode: ResolutionMode,
}

impl<T> DeferredEventBuilder<T> {
    pub fn new(sequence: &EventSequence) -> Self {
        Self {
            sequence: sequence.clone(),
            key: None,
            event_type: None,
            old_payload: None,
            new_payload: None,
            broker: None,
            dependencies: Vec::new(),
            retry_budget: DEFAULT_RETRY_BUDGET,
            poll_interval: DEFAULT_POLL_INTERVAL,
            resolution_mode: ResolutionMode::default(),
        }
    }

    pub fn key(mut self, key: InstanceIdentifier) -> Self {
        self.key = Some(key);
        self
    }

    pub fn event_type(mut self, event_type: EventType) -> Self {
        self.event_type = Some(event_type);
        self
    }

    pub fn old_payload(mut self, old: T) -> Self {
        self.old_payload = Some(old);
        self
    }

    pub fn new_payload(mut self, new: T) -> Self {
        self.new_payload = Some(new);
        self
    }

    pub fn broker(mut self, broker: Arc<dyn DataBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn dependency(mut self, dependency: DependencyData) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn dependencies(mut self, dependencies: impl IntoIterator<Item = DependencyData>) -> Self {
        self.dependencies.extend(dependencies);
        self
    }

    pub fn retry_budget(mut self, retry_budget: u32) -> Self {
        self.retry_budget = retry_budget;
        self
    }

    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn resolution_mode(mut self, mode: ResolutionMode) -> Self {
        self.resolution_mode = mode;
        self
    }

    /// Validates the collected fields and builds the event.
    ///
    /// Duplicate dependencies collapse into one.
    pub fn build(self) -> Result<DeferredEvent<T>> {
        let key = self
            .key
            .ok_or_else(|| DeferError::invalid_state("key is not set"))?;
        let event_type = self
            .event_type
            .ok_or_else(|| DeferError::invalid_state(format!("event type is not set for {}", key)))?;
        let new_payload = self
            .new_payload
            .ok_or_else(|| DeferError::invalid_state(format!("new payload is not set for {}", key)))?;
        let broker = self
            .broker
            .ok_or_else(|| DeferError::invalid_state(format!("data broker is not set for {}", key)))?;

        match (event_type, self.old_payload.is_some()) {
            (EventType::Update, false) => {
                return Err(DeferError::invalid_state(format!(
                    "update of {} has no old payload",
                    key
                )));
            }
            (EventType::Add | EventType::Remove, true) => {
                return Err(DeferError::invalid_state(format!(
                    "{} of {} carries an old payload",
                    event_type.as_str(),
                    key
                )));
            }
            _ => {}
        }

        if self.dependencies.is_empty() {
            return Err(DeferError::invalid_state(format!(
                "dependency list is empty for {}",
                key
            )));
        }
        if self.retry_budget == 0 || self.poll_interval.is_zero() {
            return Err(DeferError::invalid_state(format!(
                "retry budget and poll interval must be non-zero for {}",
                key
            )));
        }

        let mut seen = HashSet::new();
        let dependencies: Vec<DependencyData> = self
            .dependencies
            .into_iter()
            .filter(|dep| seen.insert(dep.clone()))
            .collect();

        let now = Instant::now();
        Ok(DeferredEvent {
            seq: self.sequence.next(),
            sequence: self.sequence,
            key,
            event_type,
            old_payload: self.old_payload,
            new_payload,
            broker,
            dependencies: Mutex::new(dependencies),
            retry_budget: self.retry_budget,
            poll_interval: self.poll_interval,
            queued_at: now,
            expires_at: now + self.poll_interval * self.retry_budget,
            last_checked_at: Mutex::new(now),
            resolution_mode: self.resolution_mode,
            state: AtomicU8::new(STATE_PENDING),
            waiter: Mutex::new(None),
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryDataStore;
    use LogicalDatastoreType::{Config, Operational};

    fn broker() -> Arc<dyn DataBroker> {
        Arc::new(MemoryDataStore::new())
    }

    fn id(list: &str, key: &str) -> InstanceIdentifier {
        InstanceIdentifier::builder("root").child(list, key).build()
    }

    fn add_event(seq: &EventSequence, deps: Vec<DependencyData>) -> DeferredEvent<String> {
        DeferredEvent::builder(seq)
            .key(id("vpn-interface", "tap0"))
            .event_type(EventType::Add)
            .new_payload("tap0".to_string())
            .broker(broker())
            .dependencies(deps)
            .build()
            .unwrap()
    }

    #[test]
    fn test_build_computes_expiry() {
        let seq = EventSequence::new();
        let event: DeferredEvent<String> = DeferredEvent::builder(&seq)
            .key(id("vpn-interface", "tap0"))
            .event_type(EventType::Add)
            .new_payload("tap0".to_string())
            .broker(broker())
            .dependency(DependencyData::presence(id("vpn", "vpn1"), Operational))
            .retry_budget(2)
            .poll_interval(Duration::from_millis(100))
            .build()
            .unwrap();

        assert_eq!(event.expires_at() - event.queued_at(), Duration::from_millis(200));
        assert_eq!(event.last_checked_at(), event.queued_at());
        assert_eq!(event.resolution_mode(), ResolutionMode::Reactive);
        assert!(event.old_payload().is_none());
        assert!(!event.is_resolved());
    }

    #[test]
    fn test_build_rejects_missing_fields() {
        let seq = EventSequence::new();
        let dep = DependencyData::presence(id("vpn", "vpn1"), Operational);

        let no_deps: Result<DeferredEvent<String>> = DeferredEvent::builder(&seq)
            .key(id("vpn-interface", "tap0"))
            .event_type(EventType::Add)
            .new_payload("x".to_string())
            .broker(broker())
            .build();
        assert!(matches!(no_deps, Err(DeferError::InvalidState { .. })));

        let no_payload: Result<DeferredEvent<String>> = DeferredEvent::builder(&seq)
            .key(id("vpn-interface", "tap0"))
            .event_type(EventType::Add)
            .broker(broker())
            .dependency(dep.clone())
            .build();
        assert!(matches!(no_payload, Err(DeferError::InvalidState { .. })));

        let no_type: Result<DeferredEvent<String>> = DeferredEvent::builder(&seq)
            .key(id("vpn-interface", "tap0"))
            .new_payload("x".to_string())
            .broker(broker())
            .dependency(dep.clone())
            .build();
        assert!(matches!(no_type, Err(DeferError::InvalidState { .. })));

        let no_key: Result<DeferredEvent<String>> = DeferredEvent::builder(&seq)
            .event_type(EventType::Add)
            .new_payload("x".to_string())
            .broker(broker())
            .dependency(dep.clone())
            .build();
        assert!(matches!(no_key, Err(DeferError::InvalidState { .. })));

        let no_broker: Result<DeferredEvent<String>> = DeferredEvent::builder(&seq)
            .key(id("vpn-interface", "tap0"))
            .event_type(EventType::Add)
            .new_payload("x".to_string())
            .dependency(dep)
            .build();
        assert!(matches!(no_broker, Err(DeferError::InvalidState { .. })));
    }

    #[test]
    fn test_build_checks_old_payload_against_type() {
        let seq = EventSequence::new();
        let dep = DependencyData::presence(id("vpn", "vpn1"), Operational);

        let update_without_old: Result<DeferredEvent<String>> = DeferredEvent::builder(&seq)
            .key(id("vpn-interface", "tap0"))
            .event_type(EventType::Update)
            .new_payload("new".to_string())
            .broker(broker())
            .dependency(dep.clone())
            .build();
        assert!(update_without_old.is_err());

        let add_with_old: Result<DeferredEvent<String>> = DeferredEvent::builder(&seq)
            .key(id("vpn-interface", "tap0"))
            .event_type(EventType::Add)
            .old_payload("old".to_string())
            .new_payload("new".to_string())
            .broker(broker())
            .dependency(dep.clone())
            .build();
        assert!(add_with_old.is_err());

        let update = DeferredEvent::builder(&seq)
            .key(id("vpn-interface", "tap0"))
            .event_type(EventType::Update)
            .old_payload("old".to_string())
            .new_payload("new".to_string())
            .broker(broker())
            .dependency(dep)
            .build()
            .unwrap();
        assert_eq!(update.old_payload().map(String::as_str), Some("old"));
    }

    #[test]
    fn test_duplicate_dependencies_collapse() {
        let seq = EventSequence::new();
        let dep = DependencyData::presence(id("vpn", "vpn1"), Operational);
        let event = add_event(&seq, vec![dep.clone(), dep]);
        assert_eq!(event.dependency_count(), 1);
    }

    #[test]
    fn test_remove_resolved_dependency_respects_polarity_and_store() {
        let seq = EventSequence::new();
        let d1 = DependencyData::presence(id("vpn", "vpn1"), Operational);
        let d2 = DependencyData::absence(id("intf", "tap0"), Config);
        let event = add_event(&seq, vec![d1.clone(), d2.clone()]);

        // wrong polarity and wrong store leave both in place
        assert!(event
            .remove_resolved_dependency(d1.target(), Operational, false)
            .is_empty());
        assert!(event
            .remove_resolved_dependency(d2.target(), Operational, false)
            .is_empty());

        let removed = event.remove_resolved_dependency(d1.target(), Operational, true);
        assert_eq!(removed, vec![d1]);
        assert_eq!(event.pending_dependencies(), vec![d2.clone()]);
        assert!(!event.is_resolved());

        let removed = event.remove_resolved_dependency(d2.target(), Config, false);
        assert_eq!(removed, vec![d2]);
        assert!(event.is_resolved());

        // repeated strikes are no-ops and resolution sticks
        let d1_target = id("vpn", "vpn1");
        assert!(event
            .remove_resolved_dependency(&d1_target, Operational, true)
            .is_empty());
        assert!(event.is_resolved());
    }

    #[test]
    fn test_fifo_ordering() {
        let seq = EventSequence::new();
        let dep = DependencyData::presence(id("vpn", "vpn1"), Operational);
        let first = add_event(&seq, vec![dep.clone()]);
        let second = add_event(&seq, vec![dep]);

        assert!(first < second);
        let mut events = vec![&second, &first];
        events.sort();
        assert_eq!(events[0].seq(), first.seq());
    }

    #[test]
    fn test_sequence_numbers_are_per_sequence() {
        let dep = DependencyData::presence(id("vpn", "vpn1"), Operational);
        let seq = EventSequence::new();
        let other = EventSequence::new();

        let a = add_event(&seq, vec![dep.clone()]);
        let b = add_event(&seq, vec![dep.clone()]);
        let c = add_event(&other, vec![dep]);

        assert_eq!((a.seq(), b.seq(), c.seq()), (1, 2, 1));
        assert!(a.sequence().same_as(&seq));
        assert!(b.sequence().same_as(&seq.clone()));
        assert!(!c.sequence().same_as(&seq));
    }

    #[test]
    fn test_try_complete_wins_once() {
        let seq = EventSequence::new();
        let event = add_event(&seq, vec![DependencyData::presence(id("vpn", "vpn1"), Operational)]);
        let mut rx = event.subscribe_outcome();

        assert!(!event.is_terminal());
        assert!(!event.try_complete(DeferOutcome::TimedOut));
        assert!(event.try_complete(DeferOutcome::Dispatched));
        assert!(!event.try_complete(DeferOutcome::Expired));
        assert!(!event.try_complete(DeferOutcome::Dispatched));
        assert!(event.is_terminal());
        assert_eq!(rx.try_recv().unwrap(), DeferOutcome::Dispatched);
    }

    #[test]
    fn test_due_and_expiry() {
        let seq = EventSequence::new();
        let event: DeferredEvent<String> = DeferredEvent::builder(&seq)
            .key(id("vpn-interface", "tap0"))
            .event_type(EventType::Remove)
            .new_payload("tap0".to_string())
            .broker(broker())
            .dependency(DependencyData::absence(id("vpn", "vpn1"), Config))
            .retry_budget(2)
            .poll_interval(Duration::from_millis(100))
            .resolution_mode(ResolutionMode::Poll)
            .build()
            .unwrap();
        let start = event.queued_at();

        assert!(!event.is_due(start));
        assert!(event.is_due(start + Duration::from_millis(100)));
        event.mark_checked(start + Duration::from_millis(100));
        assert!(!event.is_due(start + Duration::from_millis(150)));

        assert!(!event.is_expired(start + Duration::from_millis(199)));
        assert!(event.is_expired(start + Duration::from_millis(200)));
    }
}
