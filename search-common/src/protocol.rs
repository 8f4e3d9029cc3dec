//! Line-prefixed progress protocol spoken by the answer pipeline.
//!
//! The pipeline emits its progress as blocks of text. Each block is one
//! frame; every line in the block is either a named field or a payload line:
//!
//! ```text
//! event: info
//! stage: searching
//! progress: 40
//! task: 2
//! data: Looking at 5 sources
//! data: ...and summarising them
//! ```
//!
//! Multiple `data:` lines are joined with newlines into a single payload.
//! A frame ends the answer when its event is `final` / `FINAL_ANSWER` or
//! when it carries `finished: yes`.
//!
//! Blocks are parsed exactly once into an immutable [`ProtocolFrame`]; the
//! scheduler and the stream reframer both consume that value.

use serde::{Deserialize, Serialize};

/// Event name for a complete final answer.
pub const EVENT_FINAL: &str = "final";
/// Event name for one part of a multi-part final answer.
pub const EVENT_FINAL_PART: &str = "final-part";
/// Alternate end-of-answer event name used by the deep research variant.
pub const EVENT_FINAL_ANSWER: &str = "FINAL_ANSWER";

/// Opening marker of an embedded sources block.
pub const SOURCES_OPEN: &str = "[SOURCES]";
/// Closing marker of an embedded sources block.
pub const SOURCES_CLOSE: &str = "[/SOURCES]";

/// A single classified line of a protocol block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameLine<'a> {
    Event(&'a str),
    Stage(&'a str),
    /// `None` when the value is not an integer.
    Progress(Option<i64>),
    Finished(&'a str),
    /// `None` when the value is not an integer.
    Task(Option<i64>),
    Data(&'a str),
    /// Blank lines, comments and unknown prefixes.
    Other,
}

impl<'a> FrameLine<'a> {
    /// Classify one line of a block.
    pub fn parse(line: &'a str) -> Self {
        let field = |prefix: &str| line.strip_prefix(prefix).map(str::trim);

        if let Some(v) = field("event:") {
            FrameLine::Event(v)
        } else if let Some(v) = field("stage:") {
            FrameLine::Stage(v)
        } else if let Some(v) = field("progress:") {
            FrameLine::Progress(v.parse().ok())
        } else if let Some(v) = field("finished:") {
            FrameLine::Finished(v)
        } else if let Some(v) = field("task:") {
            FrameLine::Task(v.parse().ok())
        } else if let Some(v) = field("data:") {
            FrameLine::Data(v)
        } else {
            FrameLine::Other
        }
    }
}

/// One parsed block from the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtocolFrame {
    pub event: Option<String>,
    pub stage: Option<String>,
    pub progress: Option<i64>,
    pub finished: Option<String>,
    pub task: Option<i64>,
    /// All `data:` lines joined with `\n`. Empty when the frame had none.
    pub data: String,
}

impl ProtocolFrame {
    /// Parse a block of text into a frame.
    ///
    /// Later lines of the same kind win, except `data:` lines which accumulate.
    pub fn parse(block: &str) -> Self {
        let mut frame = ProtocolFrame::default();
        let mut data_lines: Vec<&str> = Vec::new();

        for line in block.lines() {
            match FrameLine::parse(line) {
                FrameLine::Event(v) => frame.event = Some(v.to_string()),
                FrameLine::Stage(v) => frame.stage = Some(v.to_string()),
                FrameLine::Progress(v) => frame.progress = v,
                FrameLine::Finished(v) => frame.finished = Some(v.to_string()),
                FrameLine::Task(v) => frame.task = v,
                FrameLine::Data(v) => data_lines.push(v),
                FrameLine::Other => {}
            }
        }

        frame.data = data_lines.join("\n");
        frame
    }

    /// Whether this frame contributes to an aggregated (non-streaming) answer.
    pub fn is_answer_part(&self) -> bool {
        matches!(self.event.as_deref(), Some(EVENT_FINAL) | Some(EVENT_FINAL_PART))
    }

    /// Whether this frame marks the end of the answer.
    pub fn is_terminal(&self) -> bool {
        let final_event = matches!(
            self.event.as_deref(),
            Some(EVENT_FINAL) | Some(EVENT_FINAL_ANSWER)
        );
        let finished = self
            .finished
            .as_deref()
            .is_some_and(|f| f.eq_ignore_ascii_case("yes"));
        final_event || finished
    }

    /// Progress metadata carried by this frame, if any field is present.
    pub fn meta(&self) -> Option<FrameMeta> {
        let meta = FrameMeta {
            progress: self.progress,
            stage: self.stage.clone(),
            task: self.task,
            finished: self.finished.clone(),
        };
        (!meta.is_empty()).then_some(meta)
    }
}

/// Progress metadata forwarded to streaming clients alongside content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished: Option<String>,
}

impl FrameMeta {
    pub fn is_empty(&self) -> bool {
        self.progress.is_none()
            && self.stage.is_none()
            && self.task.is_none()
            && self.finished.is_none()
    }
}

/// Split the first `[SOURCES]...[/SOURCES]` span out of a payload.
///
/// Returns the text between the markers and the payload with the whole span
/// removed (trimmed). `None` when either marker is missing.
pub fn split_sources(payload: &str) -> Option<(&str, String)> {
    let open = payload.find(SOURCES_OPEN)?;
    let inner_start = open + SOURCES_OPEN.len();
    let close = inner_start + payload[inner_start..].find(SOURCES_CLOSE)?;
    let span_end = close + SOURCES_CLOSE.len();

    let inner = &payload[inner_start..close];
    let mut rest = String::with_capacity(payload.len() - (span_end - open));
    rest.push_str(&payload[..open]);
    rest.push_str(&payload[span_end..]);

    Some((inner, rest.trim().to_string()))
}
