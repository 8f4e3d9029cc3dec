//! OpenAI-compatible response types produced for search clients.

use serde::{Deserialize, Serialize};

use crate::protocol::FrameMeta;

/// Object name carried by every streamed chunk.
pub const CHUNK_OBJECT: &str = "chat.completion.chunk";

/// One streamed `chat.completion.chunk` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: ChunkDelta,
    /// Always `null`; kept so strict OpenAI clients find the field.
    pub logprobs: Option<serde_json::Value>,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Pipeline progress side channel, under the key existing stream
    /// clients read.
    #[serde(
        rename = "elixpo_meta",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub search_meta: Option<FrameMeta>,
}

impl ChatCompletionChunk {
    pub fn new(id: &str, created: i64, model: &str, delta: ChunkDelta) -> Self {
        Self {
            id: id.to_string(),
            object: CHUNK_OBJECT.to_string(),
            created,
            model: model.to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                logprobs: None,
                finish_reason: None,
            }],
        }
    }

    /// Mark the (single) choice with a finish reason.
    pub fn with_finish_reason(mut self, reason: &str) -> Self {
        for choice in &mut self.choices {
            choice.finish_reason = Some(reason.to_string());
        }
        self
    }

    /// The delta of the first choice.
    pub fn delta(&self) -> Option<&ChunkDelta> {
        self.choices.first().map(|c| &c.delta)
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.choices.first().and_then(|c| c.finish_reason.as_deref())
    }
}

/// Generate a fresh stream id.
pub fn new_chunk_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4())
}

/// Current unix timestamp in seconds.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Assistant message inside a non-streaming response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageChoice {
    pub message: AssistantMessage,
}

impl MessageChoice {
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            message: AssistantMessage {
                role: "assistant".to_string(),
                content: content.into(),
            },
        }
    }
}

/// Non-streaming response body, shaped after the inbound request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SearchResponse {
    /// `{"result": "..."}` for flat `query`/`image` requests.
    Result { result: String },
    /// `{"choices": [{"message": {...}}]}` for chat-style requests.
    Choices { choices: Vec<MessageChoice> },
    /// `[{"message": {...}}]` legacy chat envelope.
    Messages(Vec<MessageChoice>),
}

impl SearchResponse {
    /// The answer text regardless of envelope.
    pub fn content(&self) -> &str {
        match self {
            SearchResponse::Result { result } => result,
            SearchResponse::Choices { choices } | SearchResponse::Messages(choices) => choices
                .first()
                .map(|c| c.message.content.as_str())
                .unwrap_or_default(),
        }
    }
}

/// `{"error": "..."}` body used by both HTTP errors and SSE error events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_serialization_shape() {
        let chunk = ChatCompletionChunk::new(
            "chatcmpl-1",
            1_700_000_000,
            "elixposearch",
            ChunkDelta {
                role: Some("assistant".to_string()),
                content: Some("hello".to_string()),
                search_meta: None,
            },
        );
        let json = serde_json::to_value(&chunk).unwrap();
        assert_eq!(json["object"], "chat.completion.chunk");
        assert_eq!(json["choices"][0]["delta"]["role"], "assistant");
        assert_eq!(json["choices"][0]["delta"]["content"], "hello");
        assert!(json["choices"][0]["delta"].get("elixpo_meta").is_none());
        assert!(json["choices"][0]["logprobs"].is_null());
        assert!(json["choices"][0]["finish_reason"].is_null());
    }

    #[test]
    fn test_progress_metadata_key() {
        let chunk = ChatCompletionChunk::new(
            "id",
            0,
            "elixposearch",
            ChunkDelta {
                search_meta: Some(FrameMeta {
                    stage: Some("crawling".to_string()),
                    progress: Some(40),
                    ..FrameMeta::default()
                }),
                ..ChunkDelta::default()
            },
        );
        let json = serde_json::to_value(&chunk).unwrap();
        let delta = &json["choices"][0]["delta"];
        assert_eq!(delta["elixpo_meta"]["stage"], "crawling");
        assert_eq!(delta["elixpo_meta"]["progress"], 40);
        assert!(delta.get("search_meta").is_none());

        let back: ChatCompletionChunk = serde_json::from_value(json).unwrap();
        assert_eq!(back, chunk);
    }

    #[test]
    fn test_finish_reason() {
        let chunk = ChatCompletionChunk::new("id", 0, "m", ChunkDelta::default())
            .with_finish_reason("stop");
        assert_eq!(chunk.finish_reason(), Some("stop"));
    }

    #[test]
    fn test_response_envelopes() {
        let flat = SearchResponse::Result {
            result: "answer".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&flat).unwrap(),
            serde_json::json!({"result": "answer"})
        );

        let chat = SearchResponse::Choices {
            choices: vec![MessageChoice::assistant("answer")],
        };
        assert_eq!(
            serde_json::to_value(&chat).unwrap(),
            serde_json::json!({"choices": [{"message": {"role": "assistant", "content": "answer"}}]})
        );

        let legacy = SearchResponse::Messages(vec![MessageChoice::assistant("answer")]);
        assert_eq!(
            serde_json::to_value(&legacy).unwrap(),
            serde_json::json!([{"message": {"role": "assistant", "content": "answer"}}])
        );
        assert_eq!(legacy.content(), "answer");
    }
}
