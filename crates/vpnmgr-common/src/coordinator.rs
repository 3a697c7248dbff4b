//! The dependency coordinator.
//!
//! [`DependencyCoordinator`] owns every deferred event, the wildcard listener
//! registry and the periodic sweep. It is constructed explicitly and handed
//! to the components that need to defer work; there is no global instance.
//!
//! # Resolution paths
//!
//! - **Listener**: each reactive dependency is attached to the
//!   [`WildCardListener`] for its `(pattern, store)`. Notification batches
//!   strike dependencies and the resolved events are dispatched in FIFO
//!   order.
//! - **Poll**: the sweep re-reads the dependencies of poll-mode events, and
//!   of reactive dependencies whose listener is not active, once per poll
//!   interval. It also expires events whose retry budget ran out.
//!
//! Whichever path resolves an event first claims it through
//! [`DeferredEvent::try_complete`], so each event is dispatched or expired
//! exactly once.
//!
//! # Locking
//!
//! | Lock | Scope |
//! |------|-------|
//! | `pending` | the deferred-event table, never held across `.await` |
//! | `listeners` (DashMap shard) | create-if-absent and checked teardown |
//! | listener waiting maps | one listener |
//! | event dependencies | one event |
//!
//! The handler always runs with no lock held. A handler panic is caught
//! and counted as a handler failure.

use crate::config::DeferConfig;
use crate::datastore::{ChangeNotification, DataBroker};
use crate::dependency::DependencyData;
use crate::error::{DeferError, Result};
use crate::event::{
    DeferOutcome, DeferredEvent, DeferredEventBuilder, EventSequence, EventType, ResolutionMode,
};
use crate::handler::ChangeHandler;
use crate::listener::{ListenerKey, ListenerState, WildCardListener};
use crate::metrics::{DeferMetrics, PATH_LISTENER, PATH_POLL};
use crate::task::TaskError;
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What [`DependencyCoordinator::defer_or_dispatch`] did with an event.
#[derive(Debug)]
pub enum Disposition<T> {
    /// Every dependency already held; the handler has run
    Dispatched,
    /// The event is queued
    Deferred(Arc<DeferredEvent<T>>),
}

impl<T> Disposition<T> {
    pub fn is_dispatched(&self) -> bool {
        matches!(self, Disposition::Dispatched)
    }
}

struct PendingEntry<T> {
    event: Arc<DeferredEvent<T>>,
    /// Listeners the event was attached to
    listeners: Vec<ListenerKey>,
}

struct Inner<T> {
    config: DeferConfig,
    broker: Arc<dyn DataBroker>,
    handler: Arc<dyn ChangeHandler<T>>,
    metrics: DeferMetrics,
    sequence: EventSequence,
    listeners: DashMap<ListenerKey, Arc<WildCardListener<T>>>,
    /// Deferred events in FIFO order
    pending: Mutex<BTreeMap<(Instant, u64), PendingEntry<T>>>,
    shutdown: CancellationToken,
    sweep: Mutex<Option<JoinHandle<()>>>,
}

/// Holds deferred events until their dependencies resolve.
pub struct DependencyCoordinator<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for DependencyCoordinator<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + Sync + 'static> DependencyCoordinator<T> {
    /// Creates a coordinator. Call [`start`](Self::start) to run the sweep.
    pub fn new(
        config: DeferConfig,
        broker: Arc<dyn DataBroker>,
        handler: Arc<dyn ChangeHandler<T>>,
        metrics: DeferMetrics,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                broker,
                handler,
                metrics,
                sequence: EventSequence::new(),
                listeners: DashMap::new(),
                pending: Mutex::new(BTreeMap::new()),
                shutdown: CancellationToken::new(),
                sweep: Mutex::new(None),
            }),
        })
    }

    /// Spawns the sweep task. Calling it again is a no-op.
    pub fn start(&self) {
        let mut sweep = self.inner.sweep.lock();
        if sweep.is_some() || self.inner.shutdown.is_cancelled() {
            return;
        }

        let inner = Arc::clone(&self.inner);
        *sweep = Some(tokio::spawn(async move { inner.run_sweep().await }));
        info!(
            handler = self.inner.handler.name(),
            sweep_tick_ms = self.inner.config.sweep_tick_ms,
            "Dependency coordinator started"
        );
    }

    /// Stops the sweep and closes every listener. Events still pending are
    /// dropped without dispatch.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();

        let sweep = self.inner.sweep.lock().take();
        if let Some(handle) = sweep {
            if let Err(e) = handle.await {
                warn!(error = %e, "Sweep task ended abnormally");
            }
        }

        for entry in self.inner.listeners.iter() {
            entry.value().close();
        }
        self.inner.listeners.clear();
        self.inner.metrics.listeners_active.set(0);

        let abandoned = {
            let mut pending = self.inner.pending.lock();
            let count = pending.len();
            pending.clear();
            count
        };
        self.inner.metrics.events_pending.set(0);
        info!(abandoned, "Dependency coordinator stopped");
    }

    /// Returns a builder pre-populated with the configured defaults, the
    /// coordinator's data broker and its event sequence.
    pub fn event_builder(&self) -> DeferredEventBuilder<T> {
        DeferredEvent::builder(&self.inner.sequence)
            .broker(Arc::clone(&self.inner.broker))
            .retry_budget(self.inner.config.default_retry_budget)
            .poll_interval(self.inner.config.poll_interval())
            .resolution_mode(self.inner.config.default_resolution_mode)
    }

    /// Queues `event` until its dependencies resolve or it expires.
    pub async fn defer(&self, event: DeferredEvent<T>) -> Result<Arc<DeferredEvent<T>>> {
        Inner::defer(&self.inner, Arc::new(event)).await
    }

    /// Reads every dependency once; dispatches immediately if all of them
    /// already hold, otherwise defers.
    pub async fn defer_or_dispatch(&self, event: DeferredEvent<T>) -> Result<Disposition<T>> {
        if self.inner.shutdown.is_cancelled() {
            return Err(DeferError::invalid_state("coordinator is shut down"));
        }
        self.inner.check_sequence(&event)?;

        let event = Arc::new(event);
        let struck = self.inner.check_direct(&event, event.pending_dependencies()).await;
        self.inner.metrics.record_resolved(PATH_POLL, struck);

        if event.is_resolved() {
            if event.try_complete(DeferOutcome::Dispatched) {
                self.inner.dispatch(&event).await;
            }
            return Ok(Disposition::Dispatched);
        }

        Inner::defer(&self.inner, Arc::clone(&event)).await?;
        Ok(Disposition::Deferred(event))
    }

    /// Defers `event` and waits up to `timeout` for its outcome.
    ///
    /// [`DeferOutcome::TimedOut`] does not cancel the event: it stays queued
    /// and still ends in dispatch or expiry.
    pub async fn defer_and_wait(&self, event: DeferredEvent<T>, timeout: Duration) -> Result<DeferOutcome> {
        let outcome = event.subscribe_outcome();
        let key = event.key().clone();
        self.defer(event).await?;

        match tokio::time::timeout(timeout, outcome).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(DeferError::invalid_state(format!(
                "deferred event {} was discarded by shutdown",
                key
            ))),
            Err(_) => {
                debug!(key = %key, ?timeout, "Gave up waiting for deferred event");
                Ok(DeferOutcome::TimedOut)
            }
        }
    }

    /// Runs one sweep pass immediately.
    pub async fn sweep(&self) {
        self.inner.sweep_once(Instant::now()).await;
    }

    /// Number of events currently deferred.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Number of listeners in the registry.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    /// State of the listener for `key`, if one is registered.
    pub fn listener_state(&self, key: &ListenerKey) -> Option<ListenerState> {
        self.inner.listeners.get(key).map(|l| l.value().state())
    }

    /// Number of events the listener for `key` still holds.
    pub fn listener_dependents(&self, key: &ListenerKey) -> Option<usize> {
        self.inner.listeners.get(key).map(|l| l.value().dependent_count())
    }

    /// Returns true if event `seq` sits in the waiting map of any listener.
    pub fn is_waiting(&self, seq: u64) -> bool {
        self.inner.listeners.iter().any(|l| l.value().is_waiting(seq))
    }

    pub fn metrics(&self) -> &DeferMetrics {
        &self.inner.metrics
    }

    /// Sequence that numbers events for this coordinator.
    pub fn sequence(&self) -> &EventSequence {
        &self.inner.sequence
    }

    pub fn config(&self) -> &DeferConfig {
        &self.inner.config
    }
}

impl<T: Send + Sync + 'static> Inner<T> {
    async fn defer(self: &Arc<Self>, event: Arc<DeferredEvent<T>>) -> Result<Arc<DeferredEvent<T>>> {
        if self.shutdown.is_cancelled() {
            return Err(DeferError::invalid_state("coordinator is shut down"));
        }
        self.check_sequence(&event)?;
        if event.is_terminal() {
            return Err(DeferError::invalid_state(format!(
                "event {} was already completed",
                event.key()
            )));
        }
        if event.is_resolved() {
            if event.try_complete(DeferOutcome::Dispatched) {
                self.dispatch(&event).await;
            }
            return Ok(event);
        }

        let dependencies = event.pending_dependencies();
        let mut keys: Vec<ListenerKey> = Vec::new();
        if event.resolution_mode() == ResolutionMode::Reactive {
            for dependency in &dependencies {
                let key = ListenerKey::for_dependency(dependency);
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
        }

        let pending = {
            let mut table = self.pending.lock();
            table.insert(
                (event.queued_at(), event.seq()),
                PendingEntry {
                    event: Arc::clone(&event),
                    listeners: keys,
                },
            );
            table.len()
        };
        self.metrics.events_deferred_total.inc();
        self.metrics.events_pending.set(pending as i64);

        if event.resolution_mode() == ResolutionMode::Reactive {
            for dependency in dependencies {
                self.attach(&event, dependency);
            }
        }

        debug!(
            key = %event.key(),
            event_type = event.event_type().as_str(),
            dependencies = event.dependency_count(),
            mode = ?event.resolution_mode(),
            "Event deferred"
        );

        // The dependency may have appeared between the caller's check and
        // the listener attachment.
        let inner = Arc::clone(self);
        let recheck = Arc::clone(&event);
        tokio::spawn(async move { inner.recheck(&recheck).await });

        Ok(event)
    }

    fn check_sequence(&self, event: &DeferredEvent<T>) -> Result<()> {
        if !event.sequence().same_as(&self.sequence) {
            return Err(DeferError::invalid_state(format!(
                "event {} was not numbered by this coordinator",
                event.key()
            )));
        }
        Ok(())
    }

    /// Attaches `event` to the listener for `dependency`, creating it if
    /// absent. Retries when it races a teardown of the same pattern.
    fn attach(self: &Arc<Self>, event: &Arc<DeferredEvent<T>>, dependency: DependencyData) {
        let key = ListenerKey::for_dependency(&dependency);
        loop {
            let mut created = false;
            let listener = Arc::clone(
                self.listeners
                    .entry(key.clone())
                    .or_insert_with(|| {
                        created = true;
                        Arc::new(WildCardListener::new(key.clone(), &self.shutdown))
                    })
                    .value(),
            );

            if created {
                self.metrics.listeners_active.inc();
                let inner = Arc::clone(self);
                let task_listener = Arc::clone(&listener);
                tokio::spawn(async move { inner.run_listener(task_listener).await });
            }

            if listener.add_waiter(event, dependency.clone()) {
                return;
            }

            if self
                .listeners
                .remove_if(&key, |_, current| Arc::ptr_eq(current, &listener))
                .is_some()
            {
                self.metrics.listeners_active.dec();
            }
        }
    }

    async fn run_listener(self: Arc<Self>, listener: Arc<WildCardListener<T>>) {
        let _guard = FailOnExit(listener.as_ref());
        let registration = listener
            .register(
                self.broker.as_ref(),
                self.config.registration_max_attempts,
                self.config.registration_retry_tick(),
            )
            .await;
        let mut subscription = match registration {
            Ok(subscription) => subscription,
            Err(e) => {
                if !listener.cancellation().is_cancelled() {
                    self.metrics.registration_failures_total.inc();
                    debug!(listener = %listener.key(), error = %e, "Listener left inert");
                }
                return;
            }
        };

        self.activation_recheck(&listener).await;

        loop {
            tokio::select! {
                _ = listener.cancellation().cancelled() => break,
                batch = subscription.recv() => match batch {
                    Some(batch) => self.handle_batch(&listener, &batch).await,
                    None => {
                        warn!(listener = %listener.key(), "Subscription closed by datastore, falling back to polling");
                        break;
                    }
                },
            }
        }
        debug!(listener = %listener.key(), "Listener task finished");
    }

    /// Re-reads every target the listener has waiters for. Changes emitted
    /// before the subscription existed were never delivered.
    async fn activation_recheck(&self, listener: &Arc<WildCardListener<T>>) {
        let store = listener.key().store;
        let mut batch = Vec::new();
        for (target, expect_data) in listener.waiting_targets() {
            match self.broker.exists(store, &target).await {
                Ok(exists) if exists == expect_data => {
                    batch.push(if expect_data {
                        ChangeNotification::written(target)
                    } else {
                        ChangeNotification::deleted(target)
                    });
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(listener = %listener.key(), target = %target, error = %e, "Activation re-read failed");
                }
            }
        }
        if !batch.is_empty() {
            debug!(listener = %listener.key(), count = batch.len(), "Replaying changes missed before activation");
            self.handle_batch(listener, &batch).await;
        }
    }

    async fn handle_batch(&self, listener: &WildCardListener<T>, batch: &[ChangeNotification]) {
        let resolution = listener.on_data_changed(batch);
        if resolution.struck > 0 {
            self.metrics.record_resolved(PATH_LISTENER, resolution.struck);
        }
        for event in resolution.resolved {
            self.complete(&event).await;
        }
        self.release_listener(listener.key());
    }

    /// Claims a resolved event and replays it into the handler.
    async fn complete(&self, event: &Arc<DeferredEvent<T>>) {
        if !event.try_complete(DeferOutcome::Dispatched) {
            return;
        }
        self.retire(event);
        self.dispatch(event).await;
    }

    /// Removes a terminal event from the pending table and from every
    /// listener it was attached to.
    fn retire(&self, event: &DeferredEvent<T>) {
        let (entry, pending) = {
            let mut table = self.pending.lock();
            let entry = table.remove(&(event.queued_at(), event.seq()));
            (entry, table.len())
        };
        self.metrics.events_pending.set(pending as i64);

        let Some(entry) = entry else {
            return;
        };
        for key in &entry.listeners {
            let listener = self.listeners.get(key).map(|l| Arc::clone(l.value()));
            if let Some(listener) = listener {
                listener.forget(event.seq());
            }
            self.release_listener(key);
        }
    }

    /// Tears the listener down if nothing depends on it any more.
    fn release_listener(&self, key: &ListenerKey) {
        if self
            .listeners
            .remove_if(key, |_, listener| listener.close_if_idle())
            .is_some()
        {
            self.metrics.listeners_active.dec();
            info!(listener = %key, "Wildcard listener torn down");
        }
    }

    async fn dispatch(&self, event: &DeferredEvent<T>) {
        let key = event.key();
        let call = async {
            match event.event_type() {
                EventType::Add => self.handler.on_add(key, event.new_payload()).await,
                EventType::Update => match event.old_payload() {
                    Some(old) => self.handler.on_update(key, old, event.new_payload()).await,
                    None => Err(TaskError::internal("update without old payload")),
                },
                EventType::Remove => self.handler.on_remove(key, event.new_payload()).await,
            }
        };
        // A panicking handler must not take the listener task down with it
        let result = match AssertUnwindSafe(call).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(TaskError::internal(format!(
                "handler panicked: {}",
                panic_message(panic.as_ref())
            ))),
        };
        self.metrics.events_dispatched_total.inc();

        match result {
            Ok(()) => {
                info!(
                    key = %key,
                    event_type = event.event_type().as_str(),
                    handler = self.handler.name(),
                    waited_ms = event.queued_at().elapsed().as_millis() as u64,
                    "Deferred event dispatched"
                );
            }
            Err(e) => {
                let status = e.to_status();
                if status.is_failure() {
                    self.metrics.handler_failures_total.inc();
                }
                warn!(
                    key = %key,
                    event_type = event.event_type().as_str(),
                    handler = self.handler.name(),
                    status = status.as_str(),
                    error = %e,
                    "Handler did not apply deferred event"
                );
            }
        }
    }

    /// Reads `dependencies` directly and strikes the satisfied ones.
    /// Returns the number struck.
    async fn check_direct(&self, event: &Arc<DeferredEvent<T>>, dependencies: Vec<DependencyData>) -> usize {
        let mut struck = 0;
        for dependency in dependencies {
            let exists = match event.broker().exists(dependency.store(), dependency.target()).await {
                Ok(exists) => exists,
                Err(e) => {
                    warn!(key = %event.key(), dependency = %dependency, error = %e, "Direct dependency read failed");
                    continue;
                }
            };
            if !dependency.is_satisfied_by(exists) {
                continue;
            }

            let listener = if event.resolution_mode() == ResolutionMode::Reactive {
                self.listeners
                    .get(&ListenerKey::for_dependency(&dependency))
                    .map(|l| Arc::clone(l.value()))
            } else {
                None
            };
            let removed = match listener {
                Some(listener) => listener.strike(event, &dependency),
                None => event.remove_resolved_dependency(
                    dependency.target(),
                    dependency.store(),
                    dependency.expect_data(),
                ),
            };
            if !removed.is_empty() {
                debug!(key = %event.key(), dependency = %dependency, "Dependency resolved by direct read");
            }
            struck += removed.len();
        }
        struck
    }

    async fn recheck(&self, event: &Arc<DeferredEvent<T>>) {
        if event.is_terminal() {
            return;
        }
        let struck = self.check_direct(event, event.pending_dependencies()).await;
        if struck > 0 {
            self.metrics.record_resolved(PATH_POLL, struck);
        }
        if event.is_resolved() {
            self.complete(event).await;
        }
    }

    async fn run_sweep(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.sweep_tick());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                now = ticker.tick() => self.sweep_once(now).await,
            }
        }
        debug!("Sweep task finished");
    }

    /// Expires overdue events and re-reads the dependencies that no active
    /// listener covers.
    async fn sweep_once(&self, now: Instant) {
        let snapshot: Vec<Arc<DeferredEvent<T>>> = self
            .pending
            .lock()
            .values()
            .map(|entry| Arc::clone(&entry.event))
            .collect();

        for event in snapshot {
            if event.is_terminal() {
                continue;
            }

            if event.is_expired(now) {
                if event.try_complete(DeferOutcome::Expired) {
                    self.retire(&event);
                    self.metrics.events_expired_total.inc();
                    error!(
                        key = %event.key(),
                        event_type = event.event_type().as_str(),
                        retry_budget = event.retry_budget(),
                        unresolved = %format_dependencies(&event.pending_dependencies()),
                        "Deferred event expired, dropping it"
                    );
                }
                continue;
            }

            if !event.is_due(now) {
                continue;
            }
            event.mark_checked(now);

            let dependencies: Vec<DependencyData> = match event.resolution_mode() {
                ResolutionMode::Poll => event.pending_dependencies(),
                ResolutionMode::Reactive => event
                    .pending_dependencies()
                    .into_iter()
                    .filter(|dep| !self.listener_is_active(&ListenerKey::for_dependency(dep)))
                    .collect(),
            };
            if dependencies.is_empty() {
                continue;
            }

            let struck = self.check_direct(&event, dependencies).await;
            if struck > 0 {
                self.metrics.record_resolved(PATH_POLL, struck);
            }
            if event.is_resolved() {
                self.complete(&event).await;
            }
        }
    }

    fn listener_is_active(&self, key: &ListenerKey) -> bool {
        self.listeners
            .get(key)
            .map(|l| l.value().is_active())
            .unwrap_or(false)
    }
}

/// Marks a listener FAILED when its task ends without being cancelled, so
/// the sweep polls the dependencies it was covering.
struct FailOnExit<'a, T>(&'a WildCardListener<T>);

impl<T> Drop for FailOnExit<'_, T> {
    fn drop(&mut self) {
        if !self.0.cancellation().is_cancelled() {
            self.0.fail();
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

fn format_dependencies(dependencies: &[DependencyData]) -> String {
    dependencies
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
