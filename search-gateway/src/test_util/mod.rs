//! Helpers for exercising the gateway without a real pipeline.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use search_common::ProtocolFrame;

use crate::config::{Config, SchedulerConfig};
use crate::pipeline::{FrameStream, Invocation, PipelineError, PipelineInvoker};
use crate::AppState;

#[derive(Debug, Clone)]
enum ScriptItem {
    Frame(String),
    Error(String),
}

#[derive(Debug, Default)]
struct Recorder {
    invocations: Mutex<Vec<Invocation>>,
    running: AtomicUsize,
    peak: AtomicUsize,
    pulled: AtomicUsize,
}

/// Pipeline that replays a fixed script of protocol blocks on every run.
#[derive(Debug, Clone)]
pub struct ScriptedPipeline {
    script: Arc<Vec<ScriptItem>>,
    frame_delay: Duration,
    invoke_error: Option<String>,
    panics_left: Arc<AtomicUsize>,
    recorder: Arc<Recorder>,
}

/// Counts a run as in progress until its frame stream is dropped.
struct RunGuard(Arc<Recorder>);

impl RunGuard {
    fn start(recorder: Arc<Recorder>) -> Self {
        let now = recorder.running.fetch_add(1, Ordering::SeqCst) + 1;
        recorder.peak.fetch_max(now, Ordering::SeqCst);
        Self(recorder)
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.0.running.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedPipeline {
    /// Script made of raw protocol blocks, e.g. `"event: final\ndata: hi"`.
    pub fn new<I, S>(blocks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            script: Arc::new(
                blocks
                    .into_iter()
                    .map(|b| ScriptItem::Frame(b.into()))
                    .collect(),
            ),
            frame_delay: Duration::ZERO,
            invoke_error: None,
            panics_left: Arc::new(AtomicUsize::new(0)),
            recorder: Arc::new(Recorder::default()),
        }
    }

    /// Fail mid-run after the scripted frames.
    pub fn with_error(mut self, message: &str) -> Self {
        let mut script = (*self.script).clone();
        script.push(ScriptItem::Error(message.to_string()));
        self.script = Arc::new(script);
        self
    }

    /// Sleep before yielding each frame.
    pub fn with_frame_delay(mut self, delay: Duration) -> Self {
        self.frame_delay = delay;
        self
    }

    /// Fail every run before the first frame.
    pub fn failing(mut self, message: &str) -> Self {
        self.invoke_error = Some(message.to_string());
        self
    }

    /// Panic inside `invoke` for the next `count` runs.
    pub fn panic_on_invoke(self, count: usize) -> Self {
        self.panics_left.store(count, Ordering::SeqCst);
        self
    }

    /// All invocations received so far.
    pub fn invocations(&self) -> Vec<Invocation> {
        self.recorder
            .invocations
            .lock()
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    /// Highest number of runs that were open at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.recorder.peak.load(Ordering::SeqCst)
    }

    /// Runs whose frame stream is still open.
    pub fn running(&self) -> usize {
        self.recorder.running.load(Ordering::SeqCst)
    }

    /// Frames handed out across all runs.
    pub fn frames_pulled(&self) -> usize {
        self.recorder.pulled.load(Ordering::SeqCst)
    }

    /// A fresh run of the script, without recording an invocation.
    pub fn frames(&self) -> FrameStream {
        let guard = RunGuard::start(self.recorder.clone());
        let script = self.script.clone();
        let delay = self.frame_delay;
        let recorder = self.recorder.clone();

        stream::unfold((0usize, guard), move |(index, guard)| {
            let script = script.clone();
            let recorder = recorder.clone();
            async move {
                let item = script.get(index)?.clone();
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                recorder.pulled.fetch_add(1, Ordering::SeqCst);
                let item = match item {
                    ScriptItem::Frame(block) => Ok(ProtocolFrame::parse(&block)),
                    ScriptItem::Error(message) => Err(PipelineError::Upstream(message)),
                };
                Some((item, (index + 1, guard)))
            }
        })
        .boxed()
    }
}

#[async_trait]
impl PipelineInvoker for ScriptedPipeline {
    async fn invoke(&self, invocation: Invocation) -> Result<FrameStream, PipelineError> {
        if let Ok(mut invocations) = self.recorder.invocations.lock() {
            invocations.push(invocation);
        }

        let should_panic = self
            .panics_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_panic {
            panic!("scripted pipeline panic");
        }

        if let Some(message) = &self.invoke_error {
            return Err(PipelineError::Upstream(message.clone()));
        }

        Ok(self.frames())
    }
}

/// Test configuration with the given scheduler limits.
pub fn test_config(scheduler: SchedulerConfig) -> Config {
    Config {
        scheduler,
        ..Config::default()
    }
}

/// Shared state wired to a test pipeline.
pub fn create_test_state<P>(pipeline: P, scheduler: SchedulerConfig) -> Arc<AppState>
where
    P: PipelineInvoker + 'static,
{
    Arc::new(AppState::new(test_config(scheduler), Arc::new(pipeline)))
}
