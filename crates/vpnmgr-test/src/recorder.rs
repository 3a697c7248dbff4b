//! Recording change handler
//!
//! Captures every dispatch the coordinator performs so tests can assert on
//! order and multiplicity.

use async_trait::async_trait;
use parking_lot::Mutex;
use vpnmgr_common::{ChangeHandler, EventType, InstanceIdentifier, TaskError, TaskResult};

/// One replayed event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub event_type: EventType,
    pub key: InstanceIdentifier,
    pub old: Option<String>,
    pub payload: String,
}

/// Handler that records dispatches. Keys listed with
/// [`fail_on`](RecordingHandler::fail_on) are recorded and then rejected;
/// keys listed with [`panic_on`](RecordingHandler::panic_on) panic without
/// being recorded.
#[derive(Default)]
pub struct RecordingHandler {
    dispatches: Mutex<Vec<Dispatch>>,
    failing: Mutex<Vec<InstanceIdentifier>>,
    panicking: Mutex<Vec<InstanceIdentifier>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every dispatch for `key` return a write failure.
    pub fn fail_on(&self, key: InstanceIdentifier) {
        self.failing.lock().push(key);
    }

    /// Makes every dispatch for `key` panic.
    pub fn panic_on(&self, key: InstanceIdentifier) {
        self.panicking.lock().push(key);
    }

    /// Snapshot of all dispatches in arrival order.
    pub fn dispatches(&self) -> Vec<Dispatch> {
        self.dispatches.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.dispatches.lock().len()
    }

    /// Number of dispatches for `key`.
    pub fn count_for(&self, key: &InstanceIdentifier) -> usize {
        self.dispatches.lock().iter().filter(|d| &d.key == key).count()
    }

    /// Payloads in dispatch order.
    pub fn payloads(&self) -> Vec<String> {
        self.dispatches.lock().iter().map(|d| d.payload.clone()).collect()
    }

    fn record(
        &self,
        event_type: EventType,
        key: &InstanceIdentifier,
        old: Option<&String>,
        payload: &str,
    ) -> TaskResult<()> {
        if self.panicking.lock().contains(key) {
            panic!("handler blew up on {}", key);
        }
        self.dispatches.lock().push(Dispatch {
            event_type,
            key: key.clone(),
            old: old.cloned(),
            payload: payload.to_string(),
        });
        if self.failing.lock().contains(key) {
            return Err(TaskError::write_failed(format!("rejected {}", key)));
        }
        Ok(())
    }
}

#[async_trait]
impl ChangeHandler<String> for RecordingHandler {
    fn name(&self) -> &str {
        "recording"
    }

    async fn on_add(&self, key: &InstanceIdentifier, payload: &String) -> TaskResult<()> {
        self.record(EventType::Add, key, None, payload)
    }

    async fn on_update(&self, key: &InstanceIdentifier, old: &String, new: &String) -> TaskResult<()> {
        self.record(EventType::Update, key, Some(old), new)
    }

    async fn on_remove(&self, key: &InstanceIdentifier, payload: &String) -> TaskResult<()> {
        self.record(EventType::Remove, key, None, payload)
    }
}
