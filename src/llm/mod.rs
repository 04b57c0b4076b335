//! Language model service contract
//!
//! The relay talks to a locally hosted model through the `LanguageModel` trait.
//! `OllamaClient` is the shipped implementation.

mod ollama;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use ollama::OllamaClient;

use crate::Result;

/// Role of a chat message sent to the model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// A single message in a model prompt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    /// Create a system message
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    /// Create a user message
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    /// Create an assistant message
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Sampling parameters forwarded to the model; `None` leaves the server default
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SamplingParams {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub presence_penalty: Option<f32>,
    pub frequency_penalty: Option<f32>,
}

/// Chat completion backend
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &'static str;

    /// Produce a reply for the given prompt
    async fn complete(&self, messages: &[ChatMessage], sampling: &SamplingParams)
    -> Result<String>;

    /// Check the backend is reachable
    ///
    /// Default implementation assumes it is.
    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
