//! Console outlet for voice-only use

use std::io::Write;

use async_trait::async_trait;

use super::{Channel, OutgoingMessage};
use crate::Result;

/// Prints replies to stdout
#[derive(Debug, Default)]
pub struct ConsoleChannel {
    connected: bool,
}

impl ConsoleChannel {
    /// Create a console outlet
    #[must_use]
    pub const fn new() -> Self {
        Self { connected: true }
    }
}

#[async_trait]
impl Channel for ConsoleChannel {
    fn name(&self) -> &'static str {
        "console"
    }

    async fn connect(&mut self) -> Result<()> {
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.connected = false;
        Ok(())
    }

    async fn send(&self, message: OutgoingMessage) -> Result<()> {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "[{}] {}", message.channel_id, message.content)?;
        stdout.flush()?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}
