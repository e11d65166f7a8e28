//! Per-execution event fan-out.
//!
//! The hub maintains one topic per execution. Delivery is bounded and
//! non-blocking: a slow subscriber loses events (it observes how many via
//! `Lagged`), other subscribers and the executor are never stalled.

use std::collections::HashMap;
use std::sync::RwLock;

use tokio::sync::broadcast;
use tracing::debug;

use testmesh_core::ResourceId;
use testmesh_core::event::ExecutionEvent;

/// Buffered events per subscriber before the oldest get dropped.
const TOPIC_CAPACITY: usize = 256;

/// Per-execution broadcast hub.
///
/// Modeled as an injected dependency rather than a global so tests can
/// substitute recording subscribers.
#[derive(Debug, Default)]
pub struct BroadcastHub {
    topics: RwLock<HashMap<ResourceId, broadcast::Sender<ExecutionEvent>>>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to an execution's events. The topic is created on first
    /// subscription; events broadcast before that are not replayed.
    pub fn subscribe(&self, execution_id: ResourceId) -> broadcast::Receiver<ExecutionEvent> {
        let mut topics = self.topics.write().unwrap();
        topics
            .entry(execution_id)
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .subscribe()
    }

    /// Deliver an event to every subscriber of its execution. Never blocks:
    /// per-subscriber buffers are bounded and overflow drops the oldest
    /// events for that subscriber only.
    pub fn broadcast(&self, event: ExecutionEvent) {
        let topics = self.topics.read().unwrap();
        if let Some(sender) = topics.get(&event.execution_id) {
            // Send only fails when no receiver is listening.
            let _ = sender.send(event);
        }
    }

    /// Drop an execution's topic. Subscribers drain their buffered events
    /// and then observe a closed channel.
    pub fn close(&self, execution_id: ResourceId) {
        let removed = self.topics.write().unwrap().remove(&execution_id);
        if removed.is_some() {
            debug!(execution_id = %execution_id, "Closed broadcast topic");
        }
    }

    /// Number of live subscribers for an execution.
    pub fn subscriber_count(&self, execution_id: ResourceId) -> usize {
        self.topics
            .read()
            .unwrap()
            .get(&execution_id)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use testmesh_core::execution::{Execution, ExecutionStep};

    fn step_event(execution_id: ResourceId, step_id: &str) -> ExecutionEvent {
        let step = ExecutionStep::start(execution_id, step_id, step_id, "log");
        ExecutionEvent::step_started(&step)
    }

    #[tokio::test]
    async fn test_events_reach_subscriber_in_order() {
        let hub = BroadcastHub::new();
        let execution_id = ResourceId::new();
        let mut rx = hub.subscribe(execution_id);

        hub.broadcast(step_event(execution_id, "a"));
        hub.broadcast(step_event(execution_id, "b"));

        assert_eq!(rx.recv().await.unwrap().data["step_id"], "a");
        assert_eq!(rx.recv().await.unwrap().data["step_id"], "b");
    }

    #[tokio::test]
    async fn test_topics_are_isolated_per_execution() {
        let hub = BroadcastHub::new();
        let exec_a = ResourceId::new();
        let exec_b = ResourceId::new();
        let mut rx_a = hub.subscribe(exec_a);
        let _rx_b = hub.subscribe(exec_b);

        hub.broadcast(step_event(exec_b, "only-b"));
        hub.broadcast(step_event(exec_a, "only-a"));

        assert_eq!(rx_a.recv().await.unwrap().data["step_id"], "only-a");
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_without_subscribers_does_not_block() {
        let hub = BroadcastHub::new();
        let execution_id = ResourceId::new();
        // No topic at all, then a topic whose receiver was dropped.
        hub.broadcast(step_event(execution_id, "x"));
        drop(hub.subscribe(execution_id));
        hub.broadcast(step_event(execution_id, "y"));
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags_without_stalling_others() {
        let hub = BroadcastHub::new();
        let execution_id = ResourceId::new();
        let mut slow = hub.subscribe(execution_id);
        let mut fast = hub.subscribe(execution_id);

        // Overflow the slow subscriber's buffer while the fast one drains.
        for i in 0..(TOPIC_CAPACITY + 50) {
            hub.broadcast(step_event(execution_id, &format!("s{i}")));
            assert!(fast.try_recv().is_ok());
        }

        // The slow subscriber observes how many events it lost.
        match slow.try_recv() {
            Err(broadcast::error::TryRecvError::Lagged(n)) => assert!(n >= 50),
            other => panic!("expected lag, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_close_lets_subscribers_drain() {
        let hub = BroadcastHub::new();
        let mut execution = Execution::new(ResourceId::new(), HashMap::new());
        execution.start(1);
        let execution_id = execution.id;

        let mut rx = hub.subscribe(execution_id);
        hub.broadcast(ExecutionEvent::execution_started(&execution, "f"));
        hub.close(execution_id);

        assert!(rx.recv().await.is_ok());
        assert!(rx.recv().await.is_err()); // closed after draining
        assert_eq!(hub.subscriber_count(execution_id), 0);
    }
}
