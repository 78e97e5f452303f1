//! Generation collaborator boundary.
//!
//! A [`Generator`] turns a conversation history into a stream of [`Delta`]s.
//! The streaming core only sees this trait; the concrete backend lives in
//! [`ollama`].

use async_trait::async_trait;
use serde::Serialize;

use crate::error::GenerationError;
use crate::models::{Role, ToolCall};

pub mod ollama;
#[cfg(test)]
pub(crate) mod test_support;

pub use ollama::OllamaGenerator;

/// One incremental chunk of model output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Delta {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    /// Set on the terminal chunk only.
    pub done: bool,
}

impl Delta {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn terminal(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            done: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub conversation_id: String,
    pub message_id: String,
    /// Durable history including the user message that triggered this run.
    pub history: Vec<PromptMessage>,
}

/// Callback receiving deltas in order. Returning an error aborts the stream.
pub type DeltaSink<'a> = dyn FnMut(Delta) -> Result<(), GenerationError> + Send + 'a;

/// Contract: `on_delta` is called zero or more times with `done == false`,
/// then at most once with `done == true`. An error return without a
/// terminal call is a failed generation; an immediate terminal call is a
/// valid empty response.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn stream(
        &self,
        request: GenerationRequest,
        on_delta: &mut DeltaSink<'_>,
    ) -> Result<(), GenerationError>;
}
