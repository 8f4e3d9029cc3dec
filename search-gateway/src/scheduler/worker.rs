//! Worker pool draining the task queue.
//!
//! Each worker runs an async loop that polls the queue, runs the pipeline
//! for the task under a limiter permit and resolves the task's result slot
//! with the aggregated answer.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{FutureExt, StreamExt};
use search_common::split_sources;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::active::ActiveRequestEntry;
use super::task_queue::Task;
use crate::error::GatewayError;
use crate::models::request::DeliveryMode;
use crate::pipeline::{FrameStream, Invocation, PipelineError};
use crate::AppState;

/// Answer returned when the pipeline produced no final text.
pub const NO_RESULTS: &str = "No results found";

/// Pause after a worker-level failure before polling again.
const CRASH_BACKOFF: Duration = Duration::from_millis(100);

/// Fixed set of workers sharing the queue and the concurrency limiter.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl WorkerPool {
    /// Spawn `scheduler.workers` workers on the current runtime.
    pub fn spawn(state: Arc<AppState>) -> Self {
        let count = state.config.scheduler.workers;
        let (shutdown, shutdown_rx) = watch::channel(false);

        let handles = (0..count)
            .map(|worker_id| {
                let state = state.clone();
                let shutdown_rx = shutdown_rx.clone();
                tokio::spawn(async move { run_worker(worker_id, state, shutdown_rx).await })
            })
            .collect();

        tracing::info!("Started {} request processing workers", count);

        Self { handles, shutdown }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Ask every worker to stop after its current task and wait for them.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::warn!("Worker exited abnormally: {}", e);
            }
        }
        tracing::info!("Request workers stopped");
    }
}

async fn run_worker(worker_id: usize, state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    let poll_interval = state.config.scheduler.poll_interval();

    loop {
        if *shutdown.borrow() {
            break;
        }

        let task = tokio::select! {
            _ = shutdown.changed() => break,
            task = state.queue.dequeue(poll_interval) => task,
        };

        // Empty poll: loop back so shutdown is noticed promptly.
        let Some(task) = task else { continue };

        let outcome = AssertUnwindSafe(process_task(&state, task)).catch_unwind().await;
        if let Err(panic) = outcome {
            state.stats.record_outcome(false, None);
            tracing::error!(
                worker_id,
                panic = %panic_message(panic.as_ref()),
                "Worker error while processing task"
            );
            tokio::time::sleep(CRASH_BACKOFF).await;
        }
    }

    tracing::debug!(worker_id, "Worker stopped");
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run one task to completion and resolve its result slot.
///
/// The permit and the active entry are held by guards, so they are released
/// on every path out of this function, including unwinding.
async fn process_task(state: &AppState, mut task: Task) {
    if task.request.mode == DeliveryMode::Sse {
        tracing::error!(request_id = %task.request.id, "Streaming request reached the task queue");
        task.resolve(Err(GatewayError::Internal(
            "streaming requests must not be queued".to_string(),
        )));
        return;
    }

    let permit = match state.limiter.acquire().await {
        Ok(permit) => permit,
        Err(e) => {
            task.resolve(Err(e));
            return;
        }
    };
    let started = task.mark_started();
    let active = state
        .active
        .register(ActiveRequestEntry::for_request(&task.request));

    tracing::info!(
        request_id = %task.request.id,
        queued_ms = started.duration_since(task.enqueued_at).as_millis() as u64,
        "Processing request"
    );

    let invocation = Invocation::new(task.request.query.clone(), task.request.image.clone())
        .deep(task.request.deep);

    let result = match state.pipeline.invoke(invocation).await {
        Ok(frames) => aggregate_answer(frames).await,
        Err(e) => Err(e),
    };

    // Free the slot before waking the originator.
    drop(active);
    drop(permit);

    match result {
        Ok(answer) => {
            let latency = started.elapsed();
            state.stats.record_outcome(true, Some(latency));
            tracing::info!(
                request_id = %task.request.id,
                latency_ms = latency.as_millis() as u64,
                "Request completed"
            );
            let request_id = task.request.id.clone();
            if !task.resolve(Ok(answer)) {
                tracing::debug!(request_id = %request_id, "Originator stopped waiting for result");
            }
        }
        Err(e) => {
            state.stats.record_outcome(false, None);
            tracing::error!(request_id = %task.request.id, error = %e, "Error processing request");
            task.resolve(Err(e.into()));
        }
    }
}

/// Drain a pipeline run into a single answer.
///
/// Only `final` / `final-part` payloads make up the answer. The first valid
/// sources block seen in any frame is prefixed to the answer.
pub async fn aggregate_answer(mut frames: FrameStream) -> Result<String, PipelineError> {
    let mut parts: Vec<String> = Vec::new();
    let mut sources: Option<String> = None;

    while let Some(frame) = frames.next().await {
        let frame = frame?;

        let data = match split_sources(&frame.data) {
            Some((inner, rest)) => {
                if sources.is_none() {
                    match serde_json::from_str::<serde_json::Value>(inner) {
                        Ok(value) => sources = Some(value.to_string()),
                        Err(e) => tracing::debug!("Ignoring malformed sources block: {}", e),
                    }
                }
                rest
            }
            None => frame.data.clone(),
        };

        if !data.is_empty() && frame.is_answer_part() {
            parts.push(data);
        }
    }

    let answer = parts.join("\n").trim().to_string();
    let answer = if answer.is_empty() {
        NO_RESULTS.to_string()
    } else {
        answer
    };

    Ok(match sources {
        Some(sources) => format!("[SOURCES]{}[/SOURCES]\n\n{}", sources, answer),
        None => answer,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::models::request::{SearchPayload, SearchRequest};
    use crate::scheduler::task_queue::TaskResult;
    use crate::test_util::{create_test_state, ScriptedPipeline};
    use tokio::sync::oneshot;

    fn scheduler(workers: usize, max_concurrent: usize) -> SchedulerConfig {
        SchedulerConfig {
            workers,
            max_concurrent,
            poll_interval_ms: 20,
            frame_yield_ms: 0,
            ..SchedulerConfig::default()
        }
    }

    fn json_task(query: &str) -> (Task, oneshot::Receiver<TaskResult>) {
        let payload = SearchPayload {
            query: Some(query.to_string()),
            ..SearchPayload::default()
        };
        Task::new(SearchRequest::from_payload(&payload, DeliveryMode::Json).unwrap())
    }

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_aggregates_final_parts() {
        let pipeline = ScriptedPipeline::new([
            "event: info\nstage: searching\ndata: thinking",
            "event: final-part\ndata: Part one",
            "event: final\ndata: Part two",
        ]);
        let answer = aggregate_answer(pipeline.frames()).await.unwrap();
        assert_eq!(answer, "Part one\nPart two");
    }

    #[tokio::test]
    async fn test_empty_answer_defaults() {
        let pipeline = ScriptedPipeline::new(["event: info\ndata: nothing final"]);
        let answer = aggregate_answer(pipeline.frames()).await.unwrap();
        assert_eq!(answer, NO_RESULTS);
    }

    #[tokio::test]
    async fn test_sources_prefixed_once() {
        let pipeline = ScriptedPipeline::new([
            "event: info\ndata: [SOURCES][\"https://a\"][/SOURCES]",
            "event: final\ndata: Answer [SOURCES][\"https://b\"][/SOURCES]",
        ]);
        let answer = aggregate_answer(pipeline.frames()).await.unwrap();
        assert_eq!(answer, "[SOURCES][\"https://a\"][/SOURCES]\n\nAnswer");
    }

    #[tokio::test]
    async fn test_worker_resolves_success() {
        let pipeline = ScriptedPipeline::new(["event: final\ndata: 42"]);
        let state = create_test_state(pipeline.clone(), scheduler(2, 2));
        let pool = WorkerPool::spawn(state.clone());
        assert_eq!(pool.len(), 2);

        let (task, rx) = json_task("meaning of life");
        state.queue.enqueue(task, WAIT).await.unwrap();

        let result = tokio::time::timeout(WAIT, rx).await.unwrap().unwrap();
        assert_eq!(result.unwrap(), "42");
        assert_eq!(state.stats.successful(), 1);
        assert_eq!(pipeline.invocations()[0].correlation_id, None);

        pool.shutdown().await;
        assert!(state.active.is_empty());
        assert_eq!(state.limiter.available(), 2);
    }

    #[tokio::test]
    async fn test_worker_resolves_failure() {
        let pipeline = ScriptedPipeline::new(["event: info\ndata: working"])
            .with_error("search agent crashed");
        let state = create_test_state(pipeline, scheduler(1, 1));
        let pool = WorkerPool::spawn(state.clone());

        let (task, rx) = json_task("q");
        state.queue.enqueue(task, WAIT).await.unwrap();

        let result = tokio::time::timeout(WAIT, rx).await.unwrap().unwrap();
        let err = result.unwrap_err();
        assert!(err.to_string().contains("search agent crashed"));
        assert_eq!(state.stats.failed(), 1);
        assert_eq!(state.stats.successful(), 0);

        pool.shutdown().await;
        assert_eq!(state.limiter.available(), 1);
        assert!(state.active.is_empty());
    }

    #[tokio::test]
    async fn test_worker_rejects_streaming_task() {
        let pipeline = ScriptedPipeline::new(["event: final\ndata: never"]);
        let state = create_test_state(pipeline.clone(), scheduler(1, 1));
        let pool = WorkerPool::spawn(state.clone());

        let payload = SearchPayload {
            query: Some("q".to_string()),
            ..SearchPayload::default()
        };
        let (task, rx) =
            Task::new(SearchRequest::from_payload(&payload, DeliveryMode::Sse).unwrap());
        state.queue.enqueue(task, WAIT).await.unwrap();

        let result = tokio::time::timeout(WAIT, rx).await.unwrap().unwrap();
        assert!(matches!(result, Err(GatewayError::Internal(_))));
        assert!(pipeline.invocations().is_empty());

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_every_task_resolved_and_limit_respected() {
        let pipeline = ScriptedPipeline::new(["event: final\ndata: ok"])
            .with_frame_delay(Duration::from_millis(5));
        let state = create_test_state(pipeline.clone(), scheduler(8, 3));
        let pool = WorkerPool::spawn(state.clone());

        let mut receivers = Vec::new();
        for i in 0..30 {
            let (task, rx) = json_task(&format!("query {}", i));
            state.queue.enqueue(task, WAIT).await.unwrap();
            receivers.push(rx);
        }

        for rx in receivers {
            let result = tokio::time::timeout(WAIT, rx).await.unwrap().unwrap();
            assert_eq!(result.unwrap(), "ok");
        }

        assert!(pipeline.peak_concurrency() <= 3);
        assert_eq!(state.stats.successful(), 30);

        pool.shutdown().await;
        assert_eq!(state.limiter.available(), 3);
    }

    #[tokio::test]
    async fn test_pool_survives_panicking_pipeline() {
        let pipeline = ScriptedPipeline::new(["event: final\ndata: fine"]).panic_on_invoke(1);
        let state = create_test_state(pipeline, scheduler(1, 1));
        let pool = WorkerPool::spawn(state.clone());

        let (task, rx) = json_task("first");
        state.queue.enqueue(task, WAIT).await.unwrap();
        // The task was dropped while unwinding; its originator still wakes up.
        assert!(tokio::time::timeout(WAIT, rx).await.unwrap().is_err());

        let (task, rx) = json_task("second");
        state.queue.enqueue(task, WAIT).await.unwrap();
        let result = tokio::time::timeout(WAIT, rx).await.unwrap().unwrap();
        assert_eq!(result.unwrap(), "fine");

        assert_eq!(state.stats.failed(), 1);
        assert_eq!(state.stats.successful(), 1);
        assert_eq!(state.limiter.available(), 1);
        assert!(state.active.is_empty());
        pool.shutdown().await;
    }
}
