//! Translation of pipeline frames into `chat.completion.chunk` events.

use search_common::chat::{new_chunk_id, unix_now};
use search_common::protocol::{SOURCES_CLOSE, SOURCES_OPEN};
use search_common::{split_sources, ChatCompletionChunk, ChunkDelta, ProtocolFrame};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RoleState {
    Pending,
    Sent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourcesState {
    Pending,
    Sent,
}

/// Chunks produced for one frame.
#[derive(Debug, Default)]
pub struct Reframed {
    pub chunks: Vec<ChatCompletionChunk>,
    /// The frame ended the answer; no further frames should be read.
    pub terminal: bool,
}

/// Per-stream state machine turning frames into chunks.
///
/// Every chunk of one stream shares the same id, creation time and model
/// label. The role marker is attached to the first content chunk only, and
/// the first sources block is forwarded once as a chunk of its own.
#[derive(Debug)]
pub struct StreamReframer {
    id: String,
    created: i64,
    model: String,
    role: RoleState,
    sources: SourcesState,
    finished: bool,
}

impl StreamReframer {
    pub fn new(model: &str) -> Self {
        Self::with_identity(new_chunk_id(), unix_now(), model)
    }

    pub fn with_identity(id: impl Into<String>, created: i64, model: &str) -> Self {
        Self {
            id: id.into(),
            created,
            model: model.to_string(),
            role: RoleState::Pending,
            sources: SourcesState::Pending,
            finished: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Reframe one pipeline frame.
    ///
    /// Once a terminal frame has been processed, later frames produce nothing.
    pub fn process(&mut self, frame: &ProtocolFrame) -> Reframed {
        if self.finished {
            return Reframed {
                chunks: Vec::new(),
                terminal: true,
            };
        }

        let mut chunks = Vec::new();
        let mut payload = frame.data.clone();

        if self.sources == SourcesState::Pending {
            if let Some((inner, rest)) = split_sources(&frame.data) {
                chunks.push(self.chunk(ChunkDelta {
                    content: Some(format!("{}{}{}", SOURCES_OPEN, inner, SOURCES_CLOSE)),
                    ..ChunkDelta::default()
                }));
                self.sources = SourcesState::Sent;
                payload = rest;
            }
        }

        let meta = frame.meta();
        if !payload.is_empty() || meta.is_some() {
            let mut delta = ChunkDelta {
                role: None,
                content: (!payload.is_empty()).then_some(payload),
                search_meta: meta,
            };
            if self.role == RoleState::Pending {
                delta.role = Some("assistant".to_string());
                self.role = RoleState::Sent;
            }
            chunks.push(self.chunk(delta));
        }

        let terminal = frame.is_terminal();
        if terminal {
            let stop = self
                .chunk(ChunkDelta {
                    content: Some(String::new()),
                    ..ChunkDelta::default()
                })
                .with_finish_reason("stop");
            chunks.push(stop);
            self.finished = true;
        }

        Reframed { chunks, terminal }
    }

    fn chunk(&self, delta: ChunkDelta) -> ChatCompletionChunk {
        ChatCompletionChunk::new(&self.id, self.created, &self.model, delta)
    }
}
