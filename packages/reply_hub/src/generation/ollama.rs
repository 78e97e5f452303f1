//! Ollama-compatible chat backend.
//!
//! POSTs `{model, messages, stream: true}` and reads the newline-delimited
//! JSON response chunk by chunk. Each line looks like
//! `{"message":{"content":"..."},"done":false}`; the last one has
//! `"done":true`. A line carrying `"error"` aborts the stream.

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::GenerationConfig;
use crate::error::GenerationError;
use crate::models::ToolCall;

use super::{Delta, DeltaSink, GenerationRequest, Generator, PromptMessage};

pub struct OllamaGenerator {
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

impl OllamaGenerator {
    pub fn new(config: &GenerationConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .context("Failed to build HTTP client for generation backend")?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
        })
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [PromptMessage],
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    message: Option<ChunkMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Vec<ChunkToolCall>,
}

#[derive(Debug, Deserialize)]
struct ChunkToolCall {
    function: ToolCall,
}

impl ChatChunk {
    fn into_delta(self) -> Delta {
        let (content, tool_calls) = match self.message {
            Some(m) => (
                m.content,
                m.tool_calls.into_iter().map(|t| t.function).collect(),
            ),
            None => (String::new(), Vec::new()),
        };
        Delta {
            content,
            tool_calls,
            done: self.done,
        }
    }
}

/// Splits a byte stream into complete lines. Bytes after the last newline
/// (including a partial multi-byte character) stay buffered until the next
/// chunk arrives.
#[derive(Default)]
pub(crate) struct LineDecoder {
    buf: Vec<u8>,
}

impl LineDecoder {
    /// Feed a chunk and return every complete, non-blank line.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]);
            let text = text.trim();
            if !text.is_empty() {
                lines.push(text.to_string());
            }
        }
        lines
    }

    /// Whatever is left once the body has ended without a trailing newline.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buf);
        let text = String::from_utf8_lossy(&rest).trim().to_string();
        (!text.is_empty()).then_some(text)
    }
}

/// Decode one NDJSON line and hand it to the sink. Returns true once the
/// terminal chunk has been forwarded.
fn forward_line(line: &str, on_delta: &mut DeltaSink<'_>) -> Result<bool, GenerationError> {
    let chunk: ChatChunk =
        serde_json::from_str(line).map_err(|e| GenerationError::Decode(e.to_string()))?;
    if let Some(err) = chunk.error {
        return Err(GenerationError::Backend(err));
    }
    let delta = chunk.into_delta();
    let done = delta.done;
    on_delta(delta)?;
    Ok(done)
}

#[async_trait]
impl Generator for OllamaGenerator {
    async fn stream(
        &self,
        request: GenerationRequest,
        on_delta: &mut DeltaSink<'_>,
    ) -> Result<(), GenerationError> {
        debug!(
            conversation = %request.conversation_id,
            message = %request.message_id,
            model = %self.model,
            "Requesting generation"
        );

        let body = ChatRequest {
            model: &self.model,
            messages: &request.history,
            stream: true,
        };
        let mut response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| GenerationError::Backend(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let mut lines = LineDecoder::default();
        while let Some(bytes) = response
            .chunk()
            .await
            .map_err(|e| GenerationError::Backend(e.to_string()))?
        {
            for line in lines.push(&bytes) {
                if forward_line(&line, on_delta)? {
                    return Ok(());
                }
            }
        }
        if let Some(line) = lines.finish() {
            forward_line(&line, on_delta)?;
        }

        // No terminal chunk: the caller decides whether that is a failure.
        Ok(())
    }
}
