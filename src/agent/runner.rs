//! Inference turn runner

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::prompt::PromptBuilder;
use crate::config::ConversationConfig;
use crate::llm::{LanguageModel, SamplingParams};
use crate::memory::{ConversationStore, ConversationTurn};
use crate::{Error, Result};

/// Runs one user utterance through the language model and records the exchange
///
/// Memory is only written after the model has produced a non-empty reply, and
/// then both turns are committed together. A failed, timed-out or cancelled
/// call leaves the channel's history exactly as it was.
pub struct InferenceOrchestrator {
    model: Arc<dyn LanguageModel>,
    memory: ConversationStore,
    prompt: PromptBuilder,
    sampling: SamplingParams,
    timeout: Duration,
}

impl InferenceOrchestrator {
    /// Create an orchestrator over a model and a memory store
    #[must_use]
    pub fn new(
        model: Arc<dyn LanguageModel>,
        memory: ConversationStore,
        config: &ConversationConfig,
        timeout: Duration,
    ) -> Self {
        Self {
            model,
            memory,
            prompt: PromptBuilder::new(config.system_prompt.clone()),
            sampling: config.sampling,
            timeout,
        }
    }

    /// Shared memory store
    #[must_use]
    pub const fn memory(&self) -> &ConversationStore {
        &self.memory
    }

    /// Backend behind this orchestrator
    #[must_use]
    pub fn model(&self) -> &Arc<dyn LanguageModel> {
        &self.model
    }

    /// Produce a reply for `user_text` in the context of the channel's history
    ///
    /// # Errors
    ///
    /// Returns [`Error::Inference`] if the model fails, times out or replies with nothing
    pub async fn handle_utterance(&self, channel_id: &str, user_text: &str) -> Result<String> {
        self.handle_utterance_cancellable(channel_id, user_text, &CancellationToken::new())
            .await
    }

    /// Like [`Self::handle_utterance`] but abandons the call when `cancel` fires
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] on cancellation, otherwise as `handle_utterance`
    pub async fn handle_utterance_cancellable(
        &self,
        channel_id: &str,
        user_text: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let history = self.memory.snapshot(channel_id);
        let messages = self.prompt.build(&history, user_text);

        tracing::debug!(
            channel_id,
            model = self.model.name(),
            messages = messages.len(),
            "requesting completion"
        );

        let call = tokio::time::timeout(self.timeout, self.model.complete(&messages, &self.sampling));

        let reply = tokio::select! {
            () = cancel.cancelled() => {
                return Err(Error::Cancelled(format!("inference for {channel_id}")));
            }
            result = call => match result {
                Ok(Ok(reply)) => reply,
                Ok(Err(e)) => {
                    tracing::warn!(channel_id, error = %e, "completion failed");
                    return Err(match e {
                        Error::Inference(_) => e,
                        other => Error::Inference(other.to_string()),
                    });
                }
                Err(_) => {
                    tracing::warn!(channel_id, timeout_secs = self.timeout.as_secs_f64(), "completion timed out");
                    return Err(Error::Inference(format!(
                        "no reply within {:.0}s",
                        self.timeout.as_secs_f64()
                    )));
                }
            },
        };

        let reply = reply.trim().to_string();
        if reply.is_empty() {
            return Err(Error::Inference("model returned an empty reply".to_string()));
        }

        // Session torn down while the reply was in flight
        if cancel.is_cancelled() {
            return Err(Error::Cancelled(format!("inference for {channel_id}")));
        }

        self.memory.append_exchange(
            channel_id,
            ConversationTurn::user(user_text),
            ConversationTurn::assistant(reply.clone()),
        );

        tracing::info!(channel_id, reply_len = reply.len(), "reply generated");
        Ok(reply)
    }
}
