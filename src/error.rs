//! Error types for the relay

use thiserror::Error;

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the relay
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Audio device or encoding error
    #[error("audio error: {0}")]
    Audio(String),

    /// Speech-to-text service failed or timed out
    #[error("transcription unavailable: {0}")]
    Transcription(String),

    /// Language model failed, timed out, or returned nothing
    #[error("inference unavailable: {0}")]
    Inference(String),

    /// Text-to-speech service failed
    #[error("synthesis unavailable: {0}")]
    Synthesis(String),

    /// Playback on a voice connection failed
    #[error("playback error: {0}")]
    Playback(String),

    /// Channel error
    #[error("channel error: {0}")]
    Channel(String),

    /// Operation was cancelled because its session was torn down
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Failure classes surfaced by the pipeline
///
/// Silent kinds are never reported to the user; recoverable kinds produce at
/// most one notice per utterance cycle; fatal kinds stop the session from starting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Utterance too short or noise only
    CaptureDiscarded,
    /// Trigger arrived inside the channel's cooldown window
    CooldownRejected,
    /// Speech-to-text failed or timed out
    TranscriptionUnavailable,
    /// Language model failed or timed out
    InferenceUnavailable,
    /// Text-to-speech failed
    SynthesisUnavailable,
    /// Configuration rejected at startup
    ConfigurationInvalid,
}

impl FailureKind {
    /// Whether this failure is dropped without notifying the channel
    #[must_use]
    pub const fn is_silent(self) -> bool {
        matches!(self, Self::CaptureDiscarded | Self::CooldownRejected)
    }

    /// Whether this failure prevents a session from starting
    #[must_use]
    pub const fn is_fatal(self) -> bool {
        matches!(self, Self::ConfigurationInvalid)
    }

    /// User-facing notice for recoverable failures
    #[must_use]
    pub const fn notice(self) -> Option<&'static str> {
        match self {
            Self::TranscriptionUnavailable => {
                Some("Sorry, I couldn't understand that audio. Please try again.")
            }
            Self::InferenceUnavailable => {
                Some("The language model is unavailable right now. Please try again shortly.")
            }
            Self::SynthesisUnavailable => Some("I couldn't generate a voice reply this time."),
            Self::CaptureDiscarded | Self::CooldownRejected | Self::ConfigurationInvalid => None,
        }
    }
}

impl Error {
    /// Classify this error into the pipeline failure taxonomy
    #[must_use]
    pub const fn kind(&self) -> FailureKind {
        match self {
            Self::Config(_) | Self::Toml(_) => FailureKind::ConfigurationInvalid,
            Self::Transcription(_) | Self::Audio(_) => FailureKind::TranscriptionUnavailable,
            Self::Synthesis(_) | Self::Playback(_) => FailureKind::SynthesisUnavailable,
            Self::Inference(_)
            | Self::Channel(_)
            | Self::Cancelled(_)
            | Self::Io(_)
            | Self::Http(_)
            | Self::Serialization(_) => FailureKind::InferenceUnavailable,
        }
    }
}
