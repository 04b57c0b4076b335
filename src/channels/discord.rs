//! Discord channel adapter using serenity

use std::sync::Arc;

use async_trait::async_trait;
use serenity::Client;
use serenity::all::{ChannelId, Context, CreateMessage, EventHandler, GatewayIntents, Message, MessageId, Ready};
use tokio::sync::mpsc;

use super::{Channel, IncomingMessage, OutgoingMessage};
use crate::{Error, Result};

/// Discord's per-message content limit
const MESSAGE_LIMIT: usize = 2000;

/// Discord channel adapter
pub struct DiscordChannel {
    token: String,
    message_tx: Option<mpsc::Sender<IncomingMessage>>,
    http: Option<Arc<serenity::http::Http>>,
    connected: bool,
}

impl DiscordChannel {
    /// Create a send-only Discord adapter
    ///
    /// # Arguments
    ///
    /// * `token` - Discord bot token
    #[must_use]
    pub const fn new(token: String) -> Self {
        Self {
            token,
            message_tx: None,
            http: None,
            connected: false,
        }
    }

    /// Create with a message receiver
    ///
    /// Returns the channel and a receiver for incoming messages
    #[must_use]
    pub fn with_receiver(token: String) -> (Self, mpsc::Receiver<IncomingMessage>) {
        let (tx, rx) = mpsc::channel(100);
        let channel = Self {
            token,
            message_tx: Some(tx),
            http: None,
            connected: false,
        };
        (channel, rx)
    }

    fn http(&self) -> Result<&Arc<serenity::http::Http>> {
        self.http
            .as_ref()
            .ok_or_else(|| Error::Channel("Discord not connected".to_string()))
    }
}

fn parse_channel_id(channel_id: &str) -> Result<ChannelId> {
    channel_id
        .parse::<u64>()
        .ok()
        .filter(|&id| id != 0)
        .map(ChannelId::new)
        .ok_or_else(|| Error::Channel(format!("invalid Discord channel ID: {channel_id}")))
}

#[async_trait]
impl Channel for DiscordChannel {
    fn name(&self) -> &'static str {
        "discord"
    }

    async fn connect(&mut self) -> Result<()> {
        let intents = GatewayIntents::GUILD_MESSAGES
            | GatewayIntents::DIRECT_MESSAGES
            | GatewayIntents::MESSAGE_CONTENT;

        let handler = DiscordHandler {
            message_tx: self.message_tx.clone(),
        };

        let mut client = Client::builder(&self.token, intents)
            .event_handler(handler)
            .await
            .map_err(|e| Error::Channel(format!("Discord client error: {e}")))?;

        self.http = Some(client.http.clone());

        // Spawn the client in a background task
        tokio::spawn(async move {
            if let Err(e) = client.start().await {
                tracing::error!(error = %e, "Discord client error");
            }
        });

        self.connected = true;
        tracing::info!("Discord channel connected");

        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.connected = false;
        self.http = None;
        tracing::info!("Discord channel disconnected");
        Ok(())
    }

    async fn send(&self, message: OutgoingMessage) -> Result<()> {
        let http = self.http()?;
        let channel = parse_channel_id(&message.channel_id)?;

        for (i, chunk) in message.chunks(MESSAGE_LIMIT).into_iter().enumerate() {
            let mut builder = CreateMessage::new().content(chunk);
            if i == 0 {
                if let Some(reply_to) = message.reply_to.as_deref().and_then(|id| id.parse::<u64>().ok()) {
                    builder = builder.reference_message((channel, MessageId::new(reply_to)));
                }
            }

            channel
                .send_message(http, builder)
                .await
                .map_err(|e| Error::Channel(format!("Discord send error: {e}")))?;
        }

        tracing::debug!(channel_id = %message.channel_id, "Discord message sent");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn send_typing(&self, channel_id: &str) -> Result<()> {
        let http = self.http()?;
        let channel = parse_channel_id(channel_id)?;

        channel
            .broadcast_typing(http)
            .await
            .map_err(|e| Error::Channel(format!("Discord typing error: {e}")))?;

        tracing::debug!(channel_id, "Discord typing indicator sent");
        Ok(())
    }
}

/// Discord event handler
struct DiscordHandler {
    message_tx: Option<mpsc::Sender<IncomingMessage>>,
}

#[async_trait]
impl EventHandler for DiscordHandler {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        tracing::info!(user = %ready.user.name, "Discord bot ready");
    }

    async fn message(&self, _ctx: Context, msg: Message) {
        // Ignore bot messages, including our own replies
        if msg.author.bot {
            return;
        }

        let incoming = IncomingMessage {
            id: msg.id.to_string(),
            channel_id: msg.channel_id.to_string(),
            sender_id: msg.author.id.to_string(),
            sender_name: msg.author.name.clone(),
            content: msg.content.clone(),
            is_dm: msg.guild_id.is_none(),
        };

        tracing::debug!(
            author = %msg.author.name,
            channel_id = %msg.channel_id,
            is_dm = incoming.is_dm,
            "Discord message received"
        );

        if let Some(tx) = &self.message_tx {
            if let Err(e) = tx.send(incoming).await {
                tracing::warn!(error = %e, "Failed to forward Discord message");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_channel_id() {
        assert!(parse_channel_id("123456789012345678").is_ok());
        assert!(parse_channel_id("0").is_err());
        assert!(parse_channel_id("general").is_err());
    }

    #[tokio::test]
    async fn test_send_before_connect_fails() {
        let channel = DiscordChannel::new("token".to_string());
        let err = channel
            .send(OutgoingMessage::text("1".into(), "hi".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Channel(_)));
    }
}
