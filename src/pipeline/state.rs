//! Pipeline states and turn outcomes

use std::fmt;

use crate::error::FailureKind;

/// Where a channel is in the capture → reply cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PipelineState {
    /// No voice connection and no text activity yet
    #[default]
    Idle,
    /// Waiting for speech or a message
    Listening,
    /// Buffering an utterance
    Capturing,
    /// Waiting on the speech-to-text service
    Transcribing,
    /// Deciding whether the channel may trigger again
    CooldownCheck,
    /// Waiting on the language model
    Inferring,
    /// Posting the reply and queueing speech
    Replying,
}

impl PipelineState {
    /// Whether a turn is in flight
    #[must_use]
    pub const fn is_busy(self) -> bool {
        matches!(
            self,
            Self::Transcribing | Self::CooldownCheck | Self::Inferring | Self::Replying
        )
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Capturing => "capturing",
            Self::Transcribing => "transcribing",
            Self::CooldownCheck => "cooldown_check",
            Self::Inferring => "inferring",
            Self::Replying => "replying",
        };
        f.write_str(name)
    }
}

/// A reply delivered to a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub text: String,
    /// Synthesized speech, present when a voice connection received it
    pub audio: Option<Vec<u8>>,
}

/// Result of feeding one event into the coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// Event consumed with nothing to report (buffering, no wake phrase, unknown channel)
    Ignored,
    /// The model answered
    Replied(Reply),
    /// A fixed response was posted without involving the model
    Notice(String),
    /// Dropped without telling the user
    Dropped(FailureKind),
    /// A notice for this failure was posted
    Failed(FailureKind),
    /// Another turn is already running in this channel
    Busy,
    /// The session was torn down while the turn was running
    Cancelled,
}

impl TurnOutcome {
    /// Text posted to the channel, if any
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Replied(reply) => Some(&reply.text),
            Self::Notice(text) => Some(text),
            Self::Failed(kind) => kind.notice(),
            Self::Ignored | Self::Dropped(_) | Self::Busy | Self::Cancelled => None,
        }
    }

    /// Synthesized audio, if any
    #[must_use]
    pub fn audio(&self) -> Option<&[u8]> {
        match self {
            Self::Replied(reply) => reply.audio.as_deref(),
            _ => None,
        }
    }

    /// Failure classification, if the turn failed
    #[must_use]
    pub const fn failure(&self) -> Option<FailureKind> {
        match self {
            Self::Dropped(kind) | Self::Failed(kind) => Some(*kind),
            _ => None,
        }
    }
}
