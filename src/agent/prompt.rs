//! Prompt assembly for a single turn

use crate::llm::ChatMessage;
use crate::memory::ConversationTurn;

/// Builds the message list sent to the language model
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    system_prompt: String,
}

impl PromptBuilder {
    /// Create a builder with the persona system prompt
    #[must_use]
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
        }
    }

    /// System instruction, then history oldest first, then the new user text
    ///
    /// An empty system prompt is omitted.
    #[must_use]
    pub fn build(&self, history: &[ConversationTurn], user_text: &str) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(history.len() + 2);

        if !self.system_prompt.trim().is_empty() {
            messages.push(ChatMessage::system(self.system_prompt.clone()));
        }
        messages.extend(history.iter().map(ConversationTurn::to_message));
        messages.push(ChatMessage::user(user_text));

        messages
    }
}
