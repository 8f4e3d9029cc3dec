//! Search Gateway Common Types
//!
//! Wire types shared by the gateway and anything that talks to it: the
//! answer pipeline's progress protocol and the client-facing response shapes.

pub mod chat;
pub mod protocol;

pub use chat::{
    AssistantMessage, ChatCompletionChunk, ChunkChoice, ChunkDelta, ErrorBody, MessageChoice,
    SearchResponse,
};
pub use protocol::{split_sources, FrameLine, FrameMeta, ProtocolFrame};
