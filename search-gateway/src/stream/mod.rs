//! Streaming delivery: frame reframing and the per-request SSE session.

pub mod reframer;
pub mod session;

pub use reframer::{Reframed, StreamReframer};
pub use session::{overloaded_event, SseSession, SseStream, DONE_MARKER};
