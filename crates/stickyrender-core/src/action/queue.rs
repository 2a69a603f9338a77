//! FIFO action queue with a single in-flight slot

use crate::error::QueueError;
use crate::types::{Action, ActionArgs, ActionFailure, ActionId, ActionOutcome, ActionStatus};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{oneshot, Notify};
use tracing::{debug, trace, warn};

struct Entry {
    action: Action,
    tx: oneshot::Sender<ActionOutcome>,
}

impl Entry {
    fn resolve(self, outcome: ActionOutcome) {
        if self.tx.send(outcome).is_err() {
            trace!("Submitter of action {} is no longer waiting", self.action.id);
        }
    }
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Entry>,
    in_progress: Option<Entry>,
    closed: bool,
}

/// Thread-safe FIFO of pending actions.
///
/// Any number of producers may enqueue; exactly one consumer (the dispatch
/// loop) dequeues. At most one action is IN_PROGRESS at a time: the next
/// action is handed out only after the current one has been finished.
pub struct ActionQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    next_id: AtomicU64,
}

impl ActionQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Append an action. Never blocks.
    pub fn enqueue(&self, name: impl Into<String>, args: ActionArgs) -> Result<ActionHandle, QueueError> {
        let mut action = Action::new(name, args);
        let (tx, rx) = oneshot::channel();

        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(QueueError::Closed(action.name));
            }
            action.id = self.next_id.fetch_add(1, Ordering::SeqCst);
            debug!("Enqueued action {} '{}' ({} pending)", action.id, action.name, state.pending.len() + 1);
            state.pending.push_back(Entry {
                action: action.clone(),
                tx,
            });
        }
        self.notify.notify_one();

        Ok(ActionHandle {
            id: action.id,
            name: action.name,
            rx,
        })
    }

    /// Wait for the next action and move it into the in-flight slot.
    ///
    /// Returns `None` once the queue has been closed.
    pub async fn dequeue_blocking(&self) -> Option<Action> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock();
                if state.closed {
                    return None;
                }
                if state.in_progress.is_none() {
                    if let Some(mut entry) = state.pending.pop_front() {
                        entry.action.status = ActionStatus::InProgress;
                        let action = entry.action.clone();
                        state.in_progress = Some(entry);
                        trace!("Dequeued action {} '{}'", action.id, action.name);
                        return Some(action);
                    }
                }
            }
            notified.await;
        }
    }

    /// Resolve the in-flight action and free the slot.
    ///
    /// Returns false if `id` is not the in-flight action.
    pub fn finish(&self, id: ActionId, result: Result<serde_json::Value, ActionFailure>) -> bool {
        let entry = {
            let mut state = self.state.lock();
            match state.in_progress.as_ref() {
                Some(entry) if entry.action.id == id => state.in_progress.take(),
                _ => None,
            }
        };

        let Some(mut entry) = entry else {
            warn!("Attempted to finish action {} which is not in progress", id);
            return false;
        };

        let outcome = match result {
            Ok(value) => {
                entry.action.status = ActionStatus::Done;
                ActionOutcome::done(&entry.action, value)
            }
            Err(failure) => {
                entry.action.status = ActionStatus::Failed;
                debug!("Action {} '{}' failed: {}", entry.action.id, entry.action.name, failure);
                ActionOutcome::failed(&entry.action, failure)
            }
        };
        entry.resolve(outcome);
        self.notify.notify_one();
        true
    }

    /// Remove a not-yet-started action. In-flight actions cannot be cancelled here.
    pub fn cancel(&self, id: ActionId) -> bool {
        let entry = {
            let mut state = self.state.lock();
            let position = state.pending.iter().position(|e| e.action.id == id);
            position.and_then(|i| state.pending.remove(i))
        };

        match entry {
            Some(mut entry) => {
                entry.action.status = ActionStatus::Failed;
                debug!("Cancelled pending action {} '{}'", entry.action.id, entry.action.name);
                let outcome = ActionOutcome::failed(&entry.action, ActionFailure::Cancelled);
                entry.resolve(outcome);
                true
            }
            None => false,
        }
    }

    /// Refuse further enqueues, fail everything still pending and wake the consumer.
    ///
    /// The in-flight action, if any, stays in its slot until finished.
    pub fn close(&self) {
        let drained: Vec<Entry> = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.pending.drain(..).collect()
        };

        if !drained.is_empty() {
            debug!("Closing action queue, failing {} pending action(s)", drained.len());
        }
        for mut entry in drained {
            entry.action.status = ActionStatus::Failed;
            let outcome = ActionOutcome::failed(&entry.action, ActionFailure::QueueClosed);
            entry.resolve(outcome);
        }
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Number of pending actions, not counting the in-flight one
    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when nothing is pending and nothing is in flight
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.pending.is_empty() && state.in_progress.is_none()
    }

    /// Snapshot of the in-flight action
    pub fn current(&self) -> Option<Action> {
        self.state.lock().in_progress.as_ref().map(|e| e.action.clone())
    }
}

impl Default for ActionQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle returned by [`ActionQueue::enqueue`], resolves once the action is DONE or FAILED.
#[derive(Debug)]
pub struct ActionHandle {
    id: ActionId,
    name: String,
    rx: oneshot::Receiver<ActionOutcome>,
}

impl ActionHandle {
    pub fn id(&self) -> ActionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the outcome. A dropped queue counts as a closed queue.
    pub async fn wait(self) -> ActionOutcome {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => ActionOutcome {
                id: self.id,
                name: self.name,
                status: ActionStatus::Failed,
                result: None,
                failure: Some(ActionFailure::QueueClosed),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DispatchError;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use tokio_test::{assert_pending, assert_ready, task};

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = ActionQueue::new();
        for name in ["a", "b", "c"] {
            queue.enqueue(name, ActionArgs::new()).unwrap();
        }

        let mut seen = Vec::new();
        while !queue.is_empty() {
            let action = queue.dequeue_blocking().await.unwrap();
            seen.push(action.name.clone());
            queue.finish(action.id, Ok(serde_json::Value::Null));
        }
        assert_eq!(seen, vec!["a", "b", "c"]);
        assert!(queue.is_idle());
    }

    #[test]
    fn test_dequeue_waits_for_in_flight_slot() {
        let queue = ActionQueue::new();
        queue.enqueue("first", ActionArgs::new()).unwrap();
        queue.enqueue("second", ActionArgs::new()).unwrap();

        let first = {
            let mut dequeue = task::spawn(queue.dequeue_blocking());
            assert_ready!(dequeue.poll()).unwrap()
        };
        assert_eq!(first.status, ActionStatus::InProgress);
        assert_eq!(queue.current().map(|a| a.id), Some(first.id));

        let mut dequeue = task::spawn(queue.dequeue_blocking());
        assert_pending!(dequeue.poll());

        assert!(queue.finish(first.id, Ok(serde_json::json!(null))));
        assert!(dequeue.is_woken());
        let second = assert_ready!(dequeue.poll()).unwrap();
        assert_eq!(second.name, "second");
    }

    #[test]
    fn test_dequeue_blocks_when_empty() {
        let queue = ActionQueue::new();
        let mut dequeue = task::spawn(queue.dequeue_blocking());
        assert_pending!(dequeue.poll());

        queue.enqueue("late", ActionArgs::new()).unwrap();
        assert!(dequeue.is_woken());
        let action = assert_ready!(dequeue.poll()).unwrap();
        assert_eq!(action.name, "late");
    }

    #[tokio::test]
    async fn test_enqueue_does_not_block_while_in_flight() {
        let queue = ActionQueue::new();
        queue.enqueue("render", ActionArgs::new()).unwrap();
        let _in_flight = queue.dequeue_blocking().await.unwrap();

        for i in 0..100 {
            queue.enqueue(format!("action-{}", i), ActionArgs::new()).unwrap();
        }
        assert_eq!(queue.len(), 100);
    }

    #[tokio::test]
    async fn test_finish_resolves_handle() {
        let queue = ActionQueue::new();
        let handle = queue.enqueue("scene_file", ActionArgs::new()).unwrap();
        let action = queue.dequeue_blocking().await.unwrap();
        queue.finish(
            action.id,
            Err(ActionFailure::Dispatch(DispatchError::HandlerFailed {
                command: "scene_file".to_string(),
                message: "missing".to_string(),
            })),
        );

        let outcome = handle.wait().await;
        assert_eq!(outcome.status, ActionStatus::Failed);
        assert!(outcome.failure.is_some());
    }

    #[tokio::test]
    async fn test_finish_rejects_wrong_id() {
        let queue = ActionQueue::new();
        queue.enqueue("a", ActionArgs::new()).unwrap();
        let action = queue.dequeue_blocking().await.unwrap();
        assert!(!queue.finish(action.id + 1, Ok(serde_json::Value::Null)));
        assert!(queue.current().is_some());
    }

    #[tokio::test]
    async fn test_cancel_only_pending() {
        let queue = ActionQueue::new();
        let running = queue.enqueue("running", ActionArgs::new()).unwrap();
        let waiting = queue.enqueue("waiting", ActionArgs::new()).unwrap();
        let action = queue.dequeue_blocking().await.unwrap();

        assert!(!queue.cancel(running.id()));
        assert!(queue.cancel(waiting.id()));
        let outcome = waiting.wait().await;
        assert_eq!(outcome.failure, Some(ActionFailure::Cancelled));
        assert_eq!(queue.current().map(|a| a.id), Some(action.id));
    }

    #[tokio::test]
    async fn test_close_fails_pending_and_refuses_enqueue() {
        let queue = ActionQueue::new();
        let handle = queue.enqueue("pending", ActionArgs::new()).unwrap();
        queue.close();

        assert_eq!(handle.wait().await.failure, Some(ActionFailure::QueueClosed));
        assert!(matches!(queue.enqueue("late", ActionArgs::new()), Err(QueueError::Closed(n)) if n == "late"));
        assert!(queue.dequeue_blocking().await.is_none());
    }

    #[test]
    fn test_close_wakes_consumer() {
        let queue = ActionQueue::new();
        let mut dequeue = task::spawn(queue.dequeue_blocking());
        assert_pending!(dequeue.poll());
        queue.close();
        assert!(dequeue.is_woken());
        assert!(assert_ready!(dequeue.poll()).is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_in_progress_under_concurrent_producers() {
        let queue = Arc::new(ActionQueue::new());
        let mut producers = Vec::new();
        for p in 0..8 {
            let queue = Arc::clone(&queue);
            producers.push(tokio::spawn(async move {
                for i in 0..25 {
                    queue.enqueue(format!("p{}-{}", p, i), ActionArgs::new()).unwrap();
                    tokio::task::yield_now().await;
                }
            }));
        }

        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                let mut per_producer: Vec<Vec<usize>> = vec![Vec::new(); 8];
                for _ in 0..200 {
                    let action = queue.dequeue_blocking().await.unwrap();
                    assert_eq!(queue.current().map(|a| a.id), Some(action.id));

                    let mut again = task::spawn(queue.dequeue_blocking());
                    assert_pending!(again.poll());
                    drop(again);

                    let (p, i) = action.name[1..].split_once('-').unwrap();
                    per_producer[p.parse::<usize>().unwrap()].push(i.parse().unwrap());
                    queue.finish(action.id, Ok(serde_json::Value::Null));
                }
                per_producer
            })
        };

        for producer in producers {
            producer.await.unwrap();
        }
        let per_producer = consumer.await.unwrap();
        for seq in per_producer {
            assert_eq!(seq, (0..25).collect::<Vec<_>>());
        }
        assert!(queue.is_idle());
    }
}
