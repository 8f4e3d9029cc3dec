//! One streaming (SSE) search session.
//!
//! A session owns everything a streaming request holds while it runs: its
//! admission place (an active registry entry once running), its limiter
//! permit and the pipeline's frame stream.
//! All of them live in the state threaded through [`stream::unfold`], so when
//! the client goes away and the response stream is dropped they are released
//! together and the run is recorded as failed.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use futures_util::stream::{self, BoxStream, StreamExt};
use rand::Rng;
use search_common::ChatCompletionChunk;
use tokio::sync::OwnedSemaphorePermit;

use super::reframer::StreamReframer;
use crate::error::{GatewayError, OVERLOADED_MESSAGE};
use crate::models::request::SearchRequest;
use crate::pipeline::{FrameStream, Invocation};
use crate::scheduler::{ActiveRequestEntry, ActiveRequestGuard, Reservation, StatsRegistry};
use crate::AppState;

/// Payload of the last event of every admitted stream.
pub const DONE_MARKER: &str = "[DONE]";

/// Event payloads of one streaming response, in order.
pub type SseStream = BoxStream<'static, String>;

/// Entry point of the streaming path.
pub struct SseSession;

impl SseSession {
    /// Admit a streaming request and return its event payloads.
    ///
    /// When the in-flight cap is reached the stream is a single overload
    /// error event with no `[DONE]` marker. Otherwise the request holds a
    /// place immediately and the pipeline starts on first poll, once a
    /// limiter permit is free. It appears in the active registry only from
    /// then on.
    pub fn open(state: Arc<AppState>, request: SearchRequest) -> SseStream {
        let limit = state.config.scheduler.max_concurrent;
        let Some(reservation) = state.active.try_reserve(limit) else {
            tracing::warn!(
                request_id = %request.id,
                limit,
                "Streaming request rejected, server at capacity"
            );
            return stream::once(async { overloaded_event() }).boxed();
        };

        tracing::info!(
            request_id = %request.id,
            deep = request.deep,
            query = %request.query_preview(),
            "Starting streaming request"
        );

        let session = Session {
            reframer: StreamReframer::new(&state.config.pipeline.model_label),
            outcome: OutcomeGuard {
                stats: state.stats.clone(),
                request_id: request.id.clone(),
                recorded: false,
            },
            correlation_id: new_correlation_id(),
            phase: Phase::Starting,
            pending: VecDeque::new(),
            reservation: Some(reservation),
            active: None,
            permit: None,
            frames: None,
            started: Instant::now(),
            pause_before_next: false,
            request,
            state,
        };

        stream::unfold(session, |session| session.next_event()).boxed()
    }
}

/// The single event sent when admission is refused.
pub fn overloaded_event() -> String {
    error_event(OVERLOADED_MESSAGE)
}

fn error_event(message: &str) -> String {
    serde_json::json!({ "error": message }).to_string()
}

/// Correlation id handed to the pipeline, `search-<unix ms>-<4 digits>`.
fn new_correlation_id() -> String {
    let suffix: u16 = rand::thread_rng().gen_range(1000..=9999);
    format!("search-{}-{}", chrono::Utc::now().timestamp_millis(), suffix)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Waiting for a permit and starting the pipeline.
    Starting,
    /// Forwarding frames.
    Pumping,
    /// Resources released, `[DONE]` still to send.
    Finishing,
    Closed,
}

/// Records the session outcome exactly once.
///
/// Dropping it without an outcome means the stream was abandoned.
struct OutcomeGuard {
    stats: Arc<StatsRegistry>,
    request_id: String,
    recorded: bool,
}

impl OutcomeGuard {
    fn record(&mut self, success: bool, started: Instant) {
        if self.recorded {
            return;
        }
        self.recorded = true;
        let latency = success.then(|| started.elapsed());
        self.stats.record_outcome(success, latency);
    }
}

impl Drop for OutcomeGuard {
    fn drop(&mut self) {
        if !self.recorded {
            self.stats.record_outcome(false, None);
            tracing::info!(request_id = %self.request_id, "Streaming client disconnected");
        }
    }
}

struct Session {
    state: Arc<AppState>,
    request: SearchRequest,
    correlation_id: String,
    reframer: StreamReframer,
    phase: Phase,
    pending: VecDeque<String>,
    reservation: Option<Reservation>,
    // Declared before `permit`: the entry goes first on drop.
    active: Option<ActiveRequestGuard>,
    permit: Option<OwnedSemaphorePermit>,
    frames: Option<FrameStream>,
    started: Instant,
    pause_before_next: bool,
    outcome: OutcomeGuard,
}

impl Session {
    async fn next_event(mut self) -> Option<(String, Self)> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some((event, self));
            }

            match self.phase {
                Phase::Starting => match self.start().await {
                    Ok(frames) => {
                        self.frames = Some(frames);
                        self.phase = Phase::Pumping;
                    }
                    Err(e) => self.fail(&e),
                },
                Phase::Pumping => self.pump().await,
                Phase::Finishing => {
                    self.pending.push_back(DONE_MARKER.to_string());
                    self.phase = Phase::Closed;
                }
                Phase::Closed => return None,
            }
        }
    }

    async fn start(&mut self) -> Result<FrameStream, GatewayError> {
        self.permit = Some(self.state.limiter.acquire().await?);
        if let Some(reservation) = self.reservation.take() {
            self.active = Some(reservation.activate(ActiveRequestEntry::for_request(&self.request)));
        }

        let invocation = Invocation::new(self.request.query.clone(), self.request.image.clone())
            .with_correlation_id(self.correlation_id.clone())
            .deep(self.request.deep);

        tracing::debug!(
            request_id = %self.request.id,
            correlation_id = %self.correlation_id,
            "Invoking pipeline"
        );

        Ok(self.state.pipeline.invoke(invocation).await?)
    }

    async fn pump(&mut self) {
        if self.pause_before_next {
            self.pause_before_next = false;
            let pause = self.state.config.scheduler.frame_yield();
            if pause.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(pause).await;
            }
        }

        let next = match self.frames.as_mut() {
            Some(frames) => frames.next().await,
            None => None,
        };

        match next {
            Some(Ok(frame)) => {
                let reframed = self.reframer.process(&frame);
                for chunk in &reframed.chunks {
                    self.push_chunk(chunk);
                }
                if reframed.terminal {
                    self.complete();
                } else {
                    self.pause_before_next = true;
                }
            }
            Some(Err(e)) => self.fail(&e.into()),
            // Pipeline ended without a terminal frame.
            None => self.complete(),
        }
    }

    fn push_chunk(&mut self, chunk: &ChatCompletionChunk) {
        match serde_json::to_string(chunk) {
            Ok(json) => self.pending.push_back(json),
            Err(e) => tracing::warn!(request_id = %self.request.id, "Dropping unserializable chunk: {}", e),
        }
    }

    fn complete(&mut self) {
        self.outcome.record(true, self.started);
        tracing::info!(
            request_id = %self.request.id,
            latency_ms = self.started.elapsed().as_millis() as u64,
            "Streaming request completed"
        );
        self.release();
    }

    fn fail(&mut self, error: &GatewayError) {
        self.outcome.record(false, self.started);
        tracing::error!(request_id = %self.request.id, error = %error, "Streaming request failed");
        self.pending.push_back(error_event(&error.to_string()));
        self.release();
    }

    /// Stop reading the pipeline and give the permit back before the
    /// closing marker goes out.
    fn release(&mut self) {
        self.frames = None;
        self.reservation = None;
        self.active = None;
        self.permit = None;
        self.phase = Phase::Finishing;
    }
}
