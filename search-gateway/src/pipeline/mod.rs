//! Answer pipeline abstraction.
//!
//! The pipeline is an external collaborator: given a query (and optionally an
//! image) it produces a lazy sequence of [`ProtocolFrame`]s. The gateway only
//! sees it through [`PipelineInvoker`].

mod http;

pub use http::HttpPipeline;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use search_common::ProtocolFrame;

/// Lazy, abandonable sequence of frames from one pipeline run.
pub type FrameStream = BoxStream<'static, Result<ProtocolFrame, PipelineError>>;

/// Errors raised by a pipeline run.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Pipeline returned error: {0}")]
    Upstream(String),

    #[error("Pipeline transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Pipeline protocol error: {0}")]
    Protocol(String),
}

/// Which pipeline to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipelineVariant {
    #[default]
    Standard,
    DeepResearch,
}

/// Arguments for a single pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub query: String,
    pub image: Option<String>,
    /// Threads a streaming request through the pipeline's internal events.
    pub correlation_id: Option<String>,
    pub variant: PipelineVariant,
}

impl Invocation {
    pub fn new(query: impl Into<String>, image: Option<String>) -> Self {
        Self {
            query: query.into(),
            image,
            correlation_id: None,
            variant: PipelineVariant::Standard,
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn deep(mut self, deep: bool) -> Self {
        self.variant = if deep {
            PipelineVariant::DeepResearch
        } else {
            PipelineVariant::Standard
        };
        self
    }
}

/// Something that can run the answer pipeline.
#[async_trait]
pub trait PipelineInvoker: Send + Sync {
    /// Start a run. Errors before the first frame surface here; errors
    /// during the run surface as items of the returned stream.
    async fn invoke(&self, invocation: Invocation) -> Result<FrameStream, PipelineError>;
}
