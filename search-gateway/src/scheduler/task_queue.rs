//! Bounded FIFO queue of non-streaming search requests.
//!
//! Requests wait here until a worker picks them up. The queue never grows
//! past its capacity: producers wait a bounded time for a free slot and are
//! refused with [`GatewayError::Overloaded`] otherwise.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, Semaphore};

use crate::error::GatewayError;
use crate::models::request::SearchRequest;

/// Outcome delivered to the originator of a task.
pub type TaskResult = Result<String, GatewayError>;

/// A queued request together with its single-assignment result slot.
pub struct Task {
    pub request: SearchRequest,
    result_tx: oneshot::Sender<TaskResult>,
    /// When this task was created.
    pub enqueued_at: Instant,
    /// Set by the worker that dequeues the task.
    pub started_at: Option<Instant>,
}

impl Task {
    /// Create a task and the receiver its originator awaits.
    ///
    /// If the task is dropped without being resolved the receiver observes a
    /// closed channel, so the originator never waits forever.
    pub fn new(request: SearchRequest) -> (Self, oneshot::Receiver<TaskResult>) {
        let (result_tx, result_rx) = oneshot::channel();
        let task = Self {
            request,
            result_tx,
            enqueued_at: Instant::now(),
            started_at: None,
        };
        (task, result_rx)
    }

    pub fn mark_started(&mut self) -> Instant {
        *self.started_at.get_or_insert_with(Instant::now)
    }

    /// Resolve the result slot. Consumes the task, so it can happen once.
    ///
    /// Returns `false` when the originator already gave up waiting.
    pub fn resolve(self, result: TaskResult) -> bool {
        self.result_tx.send(result).is_ok()
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("request_id", &self.request.id)
            .field("mode", &self.request.mode)
            .finish()
    }
}

/// Bounded queue with timed enqueue and dequeue.
pub struct TaskQueue {
    capacity: usize,
    items: Mutex<VecDeque<Task>>,
    /// One permit per free slot.
    slots: Semaphore,
    /// One permit per queued task.
    ready: Semaphore,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            slots: Semaphore::new(capacity),
            ready: Semaphore::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Task>> {
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a task, waiting at most `timeout` for a free slot.
    pub async fn enqueue(&self, task: Task, timeout: Duration) -> Result<(), GatewayError> {
        match tokio::time::timeout(timeout, self.slots.acquire()).await {
            Ok(Ok(permit)) => permit.forget(),
            Ok(Err(_)) => return Err(GatewayError::Internal("task queue closed".to_string())),
            Err(_) => {
                tracing::warn!(
                    request_id = %task.request.id,
                    capacity = self.capacity,
                    "Task queue full, rejecting request"
                );
                return Err(GatewayError::Overloaded);
            }
        }

        self.lock().push_back(task);
        self.ready.add_permits(1);
        Ok(())
    }

    /// Take the oldest task, waiting at most `timeout` for one to arrive.
    pub async fn dequeue(&self, timeout: Duration) -> Option<Task> {
        match tokio::time::timeout(timeout, self.ready.acquire()).await {
            Ok(Ok(permit)) => permit.forget(),
            _ => return None,
        }

        let task = self.lock().pop_front();
        if task.is_some() {
            self.slots.add_permits(1);
        }
        task
    }

    /// Number of tasks waiting for a worker.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::models::request::{DeliveryMode, SearchPayload};

    fn create_test_task(query: &str) -> (Task, oneshot::Receiver<TaskResult>) {
        let payload = SearchPayload {
            query: Some(query.to_string()),
            ..SearchPayload::default()
        };
        Task::new(SearchRequest::from_payload(&payload, DeliveryMode::Json).unwrap())
    }

    const SHORT: Duration = Duration::from_millis(20);

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = TaskQueue::new(10);
        for q in ["a", "b", "c"] {
            let (task, _rx) = create_test_task(q);
            queue.enqueue(task, SHORT).await.unwrap();
        }
        assert_eq!(queue.len(), 3);

        let order: Vec<String> = [
            queue.dequeue(SHORT).await.unwrap(),
            queue.dequeue(SHORT).await.unwrap(),
            queue.dequeue(SHORT).await.unwrap(),
        ]
        .into_iter()
        .map(|t| t.request.query)
        .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_overloaded_then_succeeds_after_space_frees() {
        let queue = TaskQueue::new(2);
        for q in ["a", "b"] {
            let (task, _rx) = create_test_task(q);
            queue.enqueue(task, SHORT).await.unwrap();
        }

        let (task, mut rx) = create_test_task("c");
        let err = queue.enqueue(task, SHORT).await.unwrap_err();
        assert!(matches!(err, GatewayError::Overloaded));
        // The rejected task was dropped, so its originator is not left waiting.
        assert!(rx.try_recv().is_err());
        assert_eq!(queue.len(), 2);

        queue.dequeue(SHORT).await.unwrap();
        let (task, _rx) = create_test_task("d");
        queue.enqueue(task, SHORT).await.unwrap();
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_enqueue_waits_for_space() {
        let queue = Arc::new(TaskQueue::new(1));
        let (task, _rx) = create_test_task("a");
        queue.enqueue(task, SHORT).await.unwrap();

        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                queue.dequeue(SHORT).await
            })
        };

        let (task, _rx) = create_test_task("b");
        queue.enqueue(task, Duration::from_secs(2)).await.unwrap();
        assert_eq!(consumer.await.unwrap().unwrap().request.query, "a");
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_dequeue_times_out_on_empty_queue() {
        let queue = TaskQueue::new(4);
        let started = Instant::now();
        assert!(queue.dequeue(SHORT).await.is_none());
        assert!(started.elapsed() >= SHORT);
    }

    #[tokio::test]
    async fn test_resolve_exactly_once() {
        let (task, rx) = create_test_task("a");
        assert!(task.resolve(Ok("answer".to_string())));
        assert_eq!(rx.await.unwrap().unwrap(), "answer");

        let (task, rx) = create_test_task("b");
        drop(rx);
        assert!(!task.resolve(Ok("nobody listening".to_string())));
    }

    #[tokio::test]
    async fn test_dropped_task_closes_slot() {
        let (task, rx) = create_test_task("a");
        drop(task);
        assert!(rx.await.is_err());
    }
}
