//! Inbound search requests and their normalised form.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::GatewayError;

/// Longest query prefix kept in logs and the active request registry.
pub const QUERY_PREVIEW_CHARS: usize = 50;

pub const MISSING_INPUT_MESSAGE: &str = "Missing query or image";
pub const MULTIPLE_IMAGES_MESSAGE: &str =
    "Only one image can be processed per request. Please submit a single image.";

/// How the answer is delivered to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    Json,
    Sse,
}

impl DeliveryMode {
    fn id_prefix(self) -> &'static str {
        match self {
            DeliveryMode::Json => "json",
            DeliveryMode::Sse => "sse",
        }
    }
}

/// Which response envelope the caller expects, based on how it asked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeShape {
    /// Flat `query` / `image` fields.
    Flat,
    /// Chat-style `messages` list.
    Chat,
}

/// Image reference supplied with a request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ImageInput {
    #[default]
    None,
    Single(String),
    /// More than one image was supplied; always rejected.
    Multiple,
}

/// POST body (or GET parameters mapped onto it).
///
/// Every field is read leniently: a value of the wrong type is treated as
/// absent instead of failing the whole body.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchPayload {
    #[serde(default, deserialize_with = "lenient_list")]
    pub messages: Vec<InboundMessage>,
    #[serde(default, deserialize_with = "lenient")]
    pub query: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub message: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub prompt: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub image: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub image_url: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub user_image: Option<String>,
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub stream: Option<bool>,
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub deep: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InboundMessage {
    #[serde(default, deserialize_with = "lenient")]
    pub role: String,
    #[serde(default, deserialize_with = "lenient")]
    pub content: Option<MessageContent>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(#[serde(deserialize_with = "lenient_list")] Vec<ContentPart>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        #[serde(default)]
        text: String,
    },
    ImageUrl {
        #[serde(default)]
        image_url: Option<ImageUrlPart>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageUrlPart {
    #[serde(default)]
    pub url: Option<String>,
}

/// GET query parameters for the search routes.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchParams {
    pub query: Option<String>,
    pub image: Option<String>,
    pub image_url: Option<String>,
    pub stream: Option<String>,
    pub deep: Option<String>,
}

impl SearchParams {
    /// Map GET parameters onto a payload. `stream_default` applies when the
    /// parameter is absent.
    pub fn into_payload(self, stream_default: bool) -> SearchPayload {
        let flag = |v: Option<String>, default: bool| {
            Some(v.map_or(default, |s| s.trim().eq_ignore_ascii_case("true")))
        };
        SearchPayload {
            query: self.query.map(|q| q.trim().to_string()),
            image: self.image.or(self.image_url),
            stream: flag(self.stream, stream_default),
            deep: flag(self.deep, false),
            ..SearchPayload::default()
        }
    }
}

/// The value if it has the expected shape, otherwise the default.
fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).unwrap_or_default())
}

/// Well-formed items of a list; anything that is not a list is empty.
fn lenient_list<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let items = match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Array(items) => items,
        _ => return Ok(Vec::new()),
    };
    Ok(items
        .into_iter()
        .filter_map(|item| serde_json::from_value(item).ok())
        .collect())
}

/// Accepts `true`, `"true"`, `1` and friends; anything else is `false`.
fn deserialize_flag<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.map(|v| match v {
        serde_json::Value::Bool(b) => b,
        serde_json::Value::String(s) => s.trim().eq_ignore_ascii_case("true"),
        serde_json::Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        _ => false,
    }))
}

/// Query, image and envelope pulled out of a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extracted {
    pub query: String,
    pub image: ImageInput,
    pub envelope: EnvelopeShape,
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

impl SearchPayload {
    pub fn wants_stream(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    pub fn wants_deep(&self) -> bool {
        self.deep.unwrap_or(false)
    }

    /// Pull the query and image out of the last user message, falling back
    /// to the flat fields.
    pub fn extract(&self) -> Extracted {
        let mut query = String::new();
        let mut image: Option<String> = None;
        let mut image_count = 0usize;
        let mut envelope = EnvelopeShape::Flat;

        if let Some(msg) = self.messages.iter().rev().find(|m| m.role == "user") {
            match &msg.content {
                Some(MessageContent::Text(text)) => query = text.trim().to_string(),
                Some(MessageContent::Parts(parts)) => {
                    let mut texts = Vec::new();
                    for part in parts {
                        match part {
                            ContentPart::Text { text } => {
                                let text = text.trim();
                                if !text.is_empty() {
                                    texts.push(text);
                                }
                            }
                            ContentPart::ImageUrl { image_url } => {
                                let url = image_url.as_ref().and_then(|i| non_empty(&i.url));
                                if let Some(url) = url {
                                    image_count += 1;
                                    image.get_or_insert(url);
                                }
                            }
                            ContentPart::Unknown => {}
                        }
                    }
                    query = texts.join(" ");
                }
                None => {}
            }
            envelope = EnvelopeShape::Chat;
        }

        if query.is_empty() {
            query = non_empty(&self.query)
                .or_else(|| non_empty(&self.message))
                .or_else(|| non_empty(&self.prompt))
                .unwrap_or_default();
        }

        if image.is_none() {
            image = non_empty(&self.image)
                .or_else(|| non_empty(&self.image_url))
                .or_else(|| non_empty(&self.user_image));
        }

        let image = match image {
            _ if image_count > 1 => ImageInput::Multiple,
            Some(url) => ImageInput::Single(url),
            None => ImageInput::None,
        };

        Extracted {
            query,
            image,
            envelope,
        }
    }
}

/// A validated, immutable search request.
#[derive(Debug, Clone, Serialize)]
pub struct SearchRequest {
    pub id: String,
    pub query: String,
    pub image: Option<String>,
    pub mode: DeliveryMode,
    pub deep: bool,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub envelope: EnvelopeShape,
}

impl SearchRequest {
    /// Validate a payload and build a request for the given delivery mode.
    ///
    /// Multiple images and requests with neither query nor image are
    /// rejected here, before any queue slot or permit is taken.
    pub fn from_payload(payload: &SearchPayload, mode: DeliveryMode) -> Result<Self, GatewayError> {
        let extracted = payload.extract();

        let image = match extracted.image {
            ImageInput::Multiple => {
                return Err(GatewayError::InvalidInput(MULTIPLE_IMAGES_MESSAGE.to_string()))
            }
            ImageInput::Single(url) => Some(url),
            ImageInput::None => None,
        };

        if extracted.query.is_empty() && image.is_none() {
            return Err(GatewayError::InvalidInput(MISSING_INPUT_MESSAGE.to_string()));
        }

        Ok(Self {
            id: new_request_id(mode),
            query: extracted.query,
            image,
            mode,
            deep: payload.wants_deep(),
            created_at: Utc::now(),
            envelope: extracted.envelope,
        })
    }

    /// Query prefix suitable for logs.
    pub fn query_preview(&self) -> String {
        self.query.chars().take(QUERY_PREVIEW_CHARS).collect()
    }
}

fn new_request_id(mode: DeliveryMode) -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", mode.id_prefix(), &hex[..8])
}
