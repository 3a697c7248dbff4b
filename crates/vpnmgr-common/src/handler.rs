//! The business-logic callback a resolved event is replayed into.

use crate::identifier::InstanceIdentifier;
use crate::task::TaskResult;
use async_trait::async_trait;

/// Destination of a deferred event once all of its dependencies resolved.
///
/// Each concrete listener implements this trait and is composed into a
/// [`DependencyCoordinator`](crate::DependencyCoordinator). The coordinator
/// calls exactly one of these methods, exactly once, per dispatched event.
///
/// # Thread Safety
///
/// Calls arrive from the sweep task and from any listener task, possibly
/// concurrently for different events. A handler may itself defer new events
/// through the coordinator; no engine lock is held during the call.
#[async_trait]
pub trait ChangeHandler<T>: Send + Sync {
    /// Returns the handler name (for logging).
    fn name(&self) -> &str;

    /// Replays a creation.
    async fn on_add(&self, key: &InstanceIdentifier, payload: &T) -> TaskResult<()>;

    /// Replays a modification.
    async fn on_update(&self, key: &InstanceIdentifier, old: &T, new: &T) -> TaskResult<()>;

    /// Replays a removal. `payload` is the removed record.
    async fn on_remove(&self, key: &InstanceIdentifier, payload: &T) -> TaskResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct CountingHandler {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ChangeHandler<u32> for CountingHandler {
        fn name(&self) -> &str {
            "counting"
        }

        async fn on_add(&self, key: &InstanceIdentifier, payload: &u32) -> TaskResult<()> {
            self.calls.lock().push(format!("add {} {}", key, payload));
            Ok(())
        }

        async fn on_update(&self, key: &InstanceIdentifier, old: &u32, new: &u32) -> TaskResult<()> {
            self.calls.lock().push(format!("update {} {}->{}", key, old, new));
            Ok(())
        }

        async fn on_remove(&self, key: &InstanceIdentifier, payload: &u32) -> TaskResult<()> {
            self.calls.lock().push(format!("remove {} {}", key, payload));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_handler_trait_object() {
        let handler = CountingHandler {
            calls: Mutex::new(Vec::new()),
        };
        let dyn_handler: &dyn ChangeHandler<u32> = &handler;
        let key = InstanceIdentifier::builder("vpn-instances")
            .child("vpn-instance", "vpn1")
            .build();

        dyn_handler.on_add(&key, &1).await.unwrap();
        dyn_handler.on_update(&key, &1, &2).await.unwrap();
        dyn_handler.on_remove(&key, &2).await.unwrap();

        assert_eq!(dyn_handler.name(), "counting");
        assert_eq!(
            *handler.calls.lock(),
            vec![
                "add /vpn-instances/vpn-instance[vpn1] 1".to_string(),
                "update /vpn-instances/vpn-instance[vpn1] 1->2".to_string(),
                "remove /vpn-instances/vpn-instance[vpn1] 2".to_string(),
            ]
        );
    }
}
