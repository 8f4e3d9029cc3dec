use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderName, Method},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::get,
    Json, Router,
};
use futures_util::StreamExt;
use search_common::{MessageChoice, SearchResponse};

use crate::config::ChatEnvelope;
use crate::error::GatewayError;
use crate::models::request::{
    DeliveryMode, EnvelopeShape, SearchParams, SearchPayload, SearchRequest,
};
use crate::scheduler::Task;
use crate::stream::SseSession;
use crate::AppState;

const X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

/// GET parameters or the JSON body, depending on the method.
///
/// A body that is not valid JSON is treated as empty and fails validation
/// later with a clear message.
fn read_payload(method: &Method, params: SearchParams, body: &Bytes, stream_default: bool) -> SearchPayload {
    if method == Method::GET {
        params.into_payload(stream_default)
    } else {
        serde_json::from_slice(body).unwrap_or_default()
    }
}

/// GET|POST /search - aggregated JSON answer
async fn search(
    State(state): State<Arc<AppState>>,
    method: Method,
    Query(params): Query<SearchParams>,
    body: Bytes,
) -> Response {
    state.stats.record_submitted();
    let payload = read_payload(&method, params, &body, false);

    if payload.wants_stream() || payload.wants_deep() {
        return stream_response(state, &payload);
    }

    let request = match SearchRequest::from_payload(&payload, DeliveryMode::Json) {
        Ok(request) => request,
        Err(e) => return e.into_response(),
    };

    tracing::info!(
        request_id = %request.id,
        query = %request.query_preview(),
        has_image = request.image.is_some(),
        "Queued search request"
    );

    let shape = request.envelope;
    let scheduler = &state.config.scheduler;
    let (task, rx) = Task::new(request);
    if let Err(e) = state.queue.enqueue(task, scheduler.enqueue_timeout()).await {
        return e.into_response();
    }

    let text = await_answer(rx, scheduler.result_timeout()).await;
    Json(envelope(shape, state.config.response.chat_envelope, text)).into_response()
}

/// Wait for the worker's result. Failures and timeouts become answer text.
async fn await_answer(
    rx: tokio::sync::oneshot::Receiver<crate::scheduler::TaskResult>,
    timeout: Duration,
) -> String {
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(Ok(answer))) => answer,
        Ok(Ok(Err(e))) => format!("Error: {}", e),
        // Worker dropped the task without resolving it.
        Ok(Err(_)) => format!(
            "Error: {}",
            GatewayError::Internal("request was not completed".to_string())
        ),
        Err(_) => GatewayError::Timeout.to_string(),
    }
}

fn envelope(shape: EnvelopeShape, chat: ChatEnvelope, text: String) -> SearchResponse {
    match (shape, chat) {
        (EnvelopeShape::Flat, _) => SearchResponse::Result { result: text },
        (EnvelopeShape::Chat, ChatEnvelope::Choices) => SearchResponse::Choices {
            choices: vec![MessageChoice::assistant(text)],
        },
        (EnvelopeShape::Chat, ChatEnvelope::Array) => {
            SearchResponse::Messages(vec![MessageChoice::assistant(text)])
        }
    }
}

/// GET|POST /search/sse - live chat.completion.chunk events
async fn search_sse(
    State(state): State<Arc<AppState>>,
    method: Method,
    Query(params): Query<SearchParams>,
    body: Bytes,
) -> Response {
    state.stats.record_submitted();
    let payload = read_payload(&method, params, &body, true);
    stream_response(state, &payload)
}

fn stream_response(state: Arc<AppState>, payload: &SearchPayload) -> Response {
    let request = match SearchRequest::from_payload(payload, DeliveryMode::Sse) {
        Ok(request) => request,
        Err(e) => return e.into_response(),
    };

    let events = SseSession::open(state, request)
        .map(|data| Ok::<_, Infallible>(Event::default().data(data)));

    (
        [
            (header::CACHE_CONTROL, "no-cache"),
            (X_ACCEL_BUFFERING, "no"),
        ],
        Sse::new(events).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))),
    )
        .into_response()
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/search", get(search).post(search))
        .route("/search/sse", get(search_sse).post(search_sse))
        .route("/search/*rest", get(search).post(search))
        .with_state(state)
}
