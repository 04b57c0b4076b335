//! Chat command parsing

/// A parsed chat message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    /// Attach the voice connection to this channel
    Join,
    /// Detach the voice connection
    Leave,
    /// Forget the conversation
    Reset,
    /// Answer a question directly
    Ask(String),
    /// Accept the next utterance without the wake phrase
    Listen,
    /// Show available commands
    Help,
    /// Ordinary message, checked for the wake phrase
    Message(String),
}

impl ChatCommand {
    /// Parse `input` against the command `prefix`
    ///
    /// Unknown `!commands` are treated as ordinary messages. Command names are
    /// case-insensitive.
    #[must_use]
    pub fn parse(input: &str, prefix: &str) -> Self {
        let trimmed = input.trim();
        let Some(after_prefix) = trimmed.strip_prefix(prefix) else {
            return Self::Message(trimmed.to_string());
        };

        // Extract command name (first word after the prefix)
        let command_end = after_prefix
            .find(char::is_whitespace)
            .unwrap_or(after_prefix.len());
        let command = after_prefix[..command_end].to_ascii_lowercase();
        let remaining = after_prefix[command_end..].trim().to_string();

        match command.as_str() {
            "join" => Self::Join,
            "leave" => Self::Leave,
            "reset" => Self::Reset,
            "ask" => Self::Ask(remaining),
            "listen" => Self::Listen,
            "help" => Self::Help,
            _ => Self::Message(trimmed.to_string()),
        }
    }
}

/// Help text listing the commands for `prefix`
#[must_use]
pub fn help_text(prefix: &str, wake_phrase: &str) -> String {
    format!(
        "Say or type \"{wake_phrase}\" followed by a question.\n\
         `{prefix}join` listen in voice here\n\
         `{prefix}leave` stop listening\n\
         `{prefix}ask <question>` ask without the wake phrase\n\
         `{prefix}listen` answer the next thing said without the wake phrase\n\
         `{prefix}reset` forget this conversation"
    )
}
