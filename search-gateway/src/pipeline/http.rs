//! HTTP client for a pipeline service that streams protocol blocks.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, Stream, StreamExt};
use reqwest::Client;
use search_common::ProtocolFrame;
use serde::Serialize;

use super::{FrameStream, Invocation, PipelineError, PipelineInvoker, PipelineVariant};
use crate::config::PipelineConfig;

/// Pipeline reachable over HTTP.
///
/// Each run is a POST whose response body is a sequence of protocol blocks
/// separated by blank lines, streamed as they are produced.
pub struct HttpPipeline {
    http_client: Client,
    base_url: String,
    standard_path: String,
    deep_path: String,
}

#[derive(Debug, Serialize)]
struct PipelineRunRequest<'a> {
    query: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    event_id: Option<&'a str>,
}

impl HttpPipeline {
    pub fn new(config: &PipelineConfig) -> Result<Self, PipelineError> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            http_client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            standard_path: config.standard_path.clone(),
            deep_path: config.deep_path.clone(),
        })
    }

    fn url_for(&self, variant: PipelineVariant) -> String {
        let path = match variant {
            PipelineVariant::Standard => &self.standard_path,
            PipelineVariant::DeepResearch => &self.deep_path,
        };
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl PipelineInvoker for HttpPipeline {
    async fn invoke(&self, invocation: Invocation) -> Result<FrameStream, PipelineError> {
        let url = self.url_for(invocation.variant);
        let body = PipelineRunRequest {
            query: &invocation.query,
            image: invocation.image.as_deref(),
            event_id: invocation.correlation_id.as_deref(),
        };

        tracing::debug!(url = %url, variant = ?invocation.variant, "Invoking pipeline");

        let response = self.http_client.post(&url).json(&body).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(PipelineError::Upstream(format!("HTTP {}: {}", status, text)));
        }

        Ok(frames_from_bytes(response.bytes_stream()))
    }
}

/// Largest block accepted before the run is treated as broken.
const MAX_BLOCK_BYTES: usize = 1024 * 1024;

/// Reassembles blank-line separated blocks from arbitrary byte chunks.
struct BlockReader<S> {
    body: S,
    buffer: Vec<u8>,
    /// Bytes of `buffer` already known to hold no separator.
    scanned: usize,
    max_block: usize,
    done: bool,
}

impl<S> BlockReader<S> {
    fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend(bytes.iter().copied().filter(|b| *b != b'\r'));
    }

    /// Next complete non-blank block in the buffer.
    fn next_block(&mut self) -> Option<Vec<u8>> {
        loop {
            // Step back one byte: the separator may straddle two pushes.
            let start = self.scanned.saturating_sub(1);
            let Some(offset) = self.buffer[start..].windows(2).position(|w| w == b"\n\n") else {
                self.scanned = self.buffer.len();
                return None;
            };
            let pos = start + offset;
            let block: Vec<u8> = self.buffer.drain(..pos + 2).take(pos).collect();
            self.scanned = 0;
            if !block.iter().all(u8::is_ascii_whitespace) {
                return Some(block);
            }
        }
    }

    fn overflowed(&self) -> bool {
        self.buffer.len() > self.max_block
    }

    /// Whatever is left once the body has ended.
    fn take_remainder(&mut self) -> Option<Vec<u8>> {
        let rest = std::mem::take(&mut self.buffer);
        self.scanned = 0;
        (!rest.iter().all(u8::is_ascii_whitespace)).then_some(rest)
    }
}

fn decode(block: Vec<u8>) -> Result<ProtocolFrame, PipelineError> {
    let text = String::from_utf8(block)
        .map_err(|e| PipelineError::Protocol(format!("frame is not valid UTF-8: {}", e)))?;
    Ok(ProtocolFrame::parse(&text))
}

/// Turn a streamed response body into a frame stream.
pub(crate) fn frames_from_bytes<S, B, E>(body: S) -> FrameStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<PipelineError> + Send + 'static,
{
    frames_with_limit(body, MAX_BLOCK_BYTES)
}

fn frames_with_limit<S, B, E>(body: S, max_block: usize) -> FrameStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<PipelineError> + Send + 'static,
{
    let reader = BlockReader {
        body: Box::pin(body),
        buffer: Vec::new(),
        scanned: 0,
        max_block,
        done: false,
    };

    stream::unfold(reader, |mut reader| async move {
        loop {
            if let Some(block) = reader.next_block() {
                return Some((decode(block), reader));
            }
            if reader.done {
                let rest = reader.take_remainder()?;
                return Some((decode(rest), reader));
            }
            if reader.overflowed() {
                let size = reader.buffer.len();
                reader.done = true;
                reader.buffer.clear();
                reader.scanned = 0;
                return Some((
                    Err(PipelineError::Protocol(format!(
                        "block exceeds {} bytes without a separator ({} buffered)",
                        reader.max_block, size
                    ))),
                    reader,
                ));
            }
            match reader.body.next().await {
                Some(Ok(bytes)) => reader.push(bytes.as_ref()),
                Some(Err(e)) => {
                    reader.done = true;
                    reader.buffer.clear();
                    reader.scanned = 0;
                    return Some((Err(e.into()), reader));
                }
                None => reader.done = true,
            }
        }
    })
    .boxed()
}
