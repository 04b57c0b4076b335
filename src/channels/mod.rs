//! Text channel adapters
//!
//! Each channel implements the `Channel` trait. The relay posts replies and
//! notices through it and receives user messages from the adapter's receiver.

mod console;
mod discord;

use async_trait::async_trait;

pub use console::ConsoleChannel;
pub use discord::DiscordChannel;

use crate::Result;

/// A message from a channel
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// Message identifier (platform-specific)
    pub id: String,

    /// Channel identifier
    pub channel_id: String,

    /// Sender identifier
    pub sender_id: String,

    /// Sender display name
    pub sender_name: String,

    /// Message content
    pub content: String,

    /// Whether this is a direct message
    pub is_dm: bool,
}

/// A message to send to a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    /// Channel identifier
    pub channel_id: String,

    /// Message content (plain text, may contain markdown)
    pub content: String,

    /// Optional reply-to message ID
    pub reply_to: Option<String>,
}

impl OutgoingMessage {
    /// Create a simple `text` message
    #[must_use]
    pub const fn text(channel_id: String, content: String) -> Self {
        Self {
            channel_id,
            content,
            reply_to: None,
        }
    }

    /// Create a `reply` message
    #[must_use]
    pub const fn reply(channel_id: String, content: String, reply_to: String) -> Self {
        Self {
            channel_id,
            content,
            reply_to: Some(reply_to),
        }
    }

    /// Split content into chunks of at most `limit` characters
    ///
    /// Prefers line breaks, then spaces, and only cuts mid-word when a single
    /// word exceeds the limit.
    #[must_use]
    pub fn chunks(&self, limit: usize) -> Vec<String> {
        split_content(&self.content, limit)
    }
}

fn split_content(content: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    let mut chunks = Vec::new();
    let mut rest = content.trim();

    while rest.chars().count() > limit {
        let byte_at = |n: usize| rest.char_indices().nth(n).map_or(rest.len(), |(i, _)| i);
        let hard_end = byte_at(limit);
        // One extra char so a break right after the limit is still found
        let window = &rest[..byte_at(limit + 1)];

        let cut = window
            .rfind('\n')
            .or_else(|| window.rfind(' '))
            .filter(|&i| i > 0)
            .unwrap_or(hard_end);

        chunks.push(rest[..cut].trim_end().to_string());
        rest = rest[cut..].trim_start();
    }

    if !rest.is_empty() {
        chunks.push(rest.to_string());
    }
    chunks
}

/// Trait for text channel adapters
#[async_trait]
pub trait Channel: Send + Sync {
    /// Get the channel name
    fn name(&self) -> &'static str;

    /// Connect to the channel
    async fn connect(&mut self) -> Result<()>;

    /// Disconnect from the channel
    async fn disconnect(&mut self) -> Result<()>;

    /// Send a message
    async fn send(&self, message: OutgoingMessage) -> Result<()>;

    /// Check if connected
    fn is_connected(&self) -> bool;

    /// Send typing indicator to show the bot is processing
    ///
    /// Default implementation is a no-op for channels that don't support typing
    async fn send_typing(&self, _channel_id: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_content_is_one_chunk() {
        let msg = OutgoingMessage::text("c".into(), "hello there".into());
        assert_eq!(msg.chunks(2000), vec!["hello there"]);
    }

    #[test]
    fn test_splits_on_whitespace() {
        let msg = OutgoingMessage::text("c".into(), "aaaa bbbb cccc".into());
        assert_eq!(msg.chunks(9), vec!["aaaa bbbb", "cccc"]);
    }

    #[test]
    fn test_long_word_is_cut() {
        let msg = OutgoingMessage::text("c".into(), "abcdefghij".into());
        assert_eq!(msg.chunks(4), vec!["abcd", "efgh", "ij"]);
    }

    #[test]
    fn test_empty_content_has_no_chunks() {
        let msg = OutgoingMessage::text("c".into(), "   ".into());
        assert!(msg.chunks(10).is_empty());
    }
}
