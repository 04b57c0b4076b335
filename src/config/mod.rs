//! Configuration management for the relay
//!
//! Values resolve with priority: environment → config file → defaults.
//! Configuration is read once at startup; changes require a restart.

pub mod file;

use std::path::Path;
use std::time::Duration;

use secrecy::SecretString;

use crate::llm::SamplingParams;
use crate::{Error, Result};

use file::RelayConfigFile;

/// Default wake phrase
pub const DEFAULT_WAKE_PHRASE: &str = "hey assistant";

/// Default system instruction for the language model
pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful voice assistant in a chat channel. Keep responses concise and conversational.";

/// Relay configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Wake phrase, cooldown and capture tuning
    pub voice: VoiceConfig,

    /// Prompt and sampling configuration
    pub conversation: ConversationConfig,

    /// Local Ollama server
    pub ollama: OllamaConfig,

    /// Speech-to-text service
    pub stt: SttConfig,

    /// Text-to-speech service
    pub tts: TtsConfig,

    /// Discord text channel
    pub discord: DiscordConfig,

    /// Session lifetime
    pub session: SessionConfig,
}

/// Voice capture and wake phrase configuration
#[derive(Debug, Clone)]
pub struct VoiceConfig {
    /// Enable the local voice connection
    pub enabled: bool,

    /// Phrase that activates a response cycle
    pub wake_phrase: String,

    /// Minimum time between accepted triggers per channel
    pub cooldown: Duration,

    /// Silence run that closes an utterance
    pub silence_threshold: Duration,

    /// Hard cap on a single utterance
    pub max_utterance: Duration,

    /// Utterances with less speech than this are discarded
    pub min_speech: Duration,

    /// RMS level above which a frame counts as speech
    pub speech_energy_threshold: f32,

    /// Synthesis voice identifier
    pub voice_id: String,

    /// How long an on-demand listen window stays open
    pub listen_window: Duration,

    /// Require the wake phrase on plain text messages
    pub text_requires_wake_phrase: bool,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            wake_phrase: DEFAULT_WAKE_PHRASE.to_string(),
            cooldown: Duration::from_secs(5),
            silence_threshold: Duration::from_millis(800),
            max_utterance: Duration::from_secs(30),
            min_speech: Duration::from_millis(300),
            speech_energy_threshold: 0.03,
            voice_id: "af_heart".to_string(),
            listen_window: Duration::from_secs(20),
            text_requires_wake_phrase: true,
        }
    }
}

/// Conversation configuration
#[derive(Debug, Clone)]
pub struct ConversationConfig {
    /// System instruction prepended to every prompt
    pub system_prompt: String,

    /// Maximum turns kept per channel
    pub max_history: usize,

    /// Sampling parameters passed to the model
    pub sampling: SamplingParams,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            max_history: 10,
            sampling: SamplingParams {
                max_tokens: Some(256),
                temperature: Some(0.7),
                top_p: Some(0.9),
                presence_penalty: None,
                frequency_penalty: None,
            },
        }
    }
}

/// Ollama configuration
#[derive(Debug, Clone)]
pub struct OllamaConfig {
    /// Base URL of the Ollama server
    pub host: String,

    /// Model identifier
    pub model: String,

    /// Bounded wait for a single completion
    pub request_timeout: Duration,

    /// Use the streaming chat endpoint
    pub stream: bool,

    /// How long Ollama keeps the model loaded (e.g. "5m")
    pub keep_alive: Option<String>,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            host: "http://localhost:11434".to_string(),
            model: "llama3.1".to_string(),
            request_timeout: Duration::from_secs(60),
            stream: true,
            keep_alive: None,
        }
    }
}

/// Speech-to-text configuration
#[derive(Debug, Clone)]
pub struct SttConfig {
    /// Base URL of an OpenAI-compatible transcription server
    pub url: String,

    /// Transcription model
    pub model: String,

    /// Optional bearer token
    pub api_key: Option<String>,

    /// Bounded wait for a single transcription
    pub timeout: Duration,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8000".to_string(),
            model: "Systran/faster-whisper-small".to_string(),
            api_key: None,
            timeout: Duration::from_secs(20),
        }
    }
}

/// Text-to-speech configuration
#[derive(Debug, Clone)]
pub struct TtsConfig {
    /// Base URL of an OpenAI-compatible speech server
    pub url: String,

    /// Synthesis model
    pub model: String,

    /// Optional bearer token
    pub api_key: Option<String>,

    /// Speed multiplier
    pub speed: f32,

    /// Bounded wait for a single synthesis
    pub timeout: Duration,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8880".to_string(),
            model: "kokoro".to_string(),
            api_key: None,
            speed: 1.0,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Discord configuration
#[derive(Debug, Clone)]
pub struct DiscordConfig {
    /// Bot token; Discord is disabled without one
    pub token: Option<SecretString>,

    /// Prefix for text commands (e.g. "!")
    pub command_prefix: String,

    /// Text channel that receives replies for the local voice connection
    pub voice_text_channel_id: Option<String>,
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            token: None,
            command_prefix: "!".to_string(),
            voice_text_channel_id: None,
        }
    }
}

/// Session lifetime configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Sessions idle longer than this are evicted
    pub idle_horizon: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_horizon: Duration::from_secs(30 * 60),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            voice: VoiceConfig::default(),
            conversation: ConversationConfig::default(),
            ollama: OllamaConfig::default(),
            stt: SttConfig::default(),
            tts: TtsConfig::default(),
            discord: DiscordConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the environment and config file
    ///
    /// Uses `path` when given, otherwise `~/.config/vox/relay/config.toml` if present.
    ///
    /// # Errors
    ///
    /// Returns error if an explicit config file is missing or malformed, or if the
    /// resulting configuration fails validation
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_options(path, false)
    }

    /// Load configuration with explicit voice disable option
    ///
    /// # Errors
    ///
    /// Returns error if an explicit config file is missing or malformed, or if the
    /// resulting configuration fails validation
    pub fn load_with_options(path: Option<&Path>, disable_voice: bool) -> Result<Self> {
        let fc = match path {
            Some(p) => file::read_config_file(p)?,
            None => file::load_config_file(),
        };

        let mut config = Self::resolve(fc, |key| std::env::var(key).ok())?;
        if disable_voice {
            config.voice.enabled = false;
        }

        config.validate()?;
        Ok(config)
    }

    /// Build a configuration from a parsed file and an environment lookup
    ///
    /// # Errors
    ///
    /// Returns error if an environment override cannot be parsed
    pub fn resolve<F>(fc: RelayConfigFile, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let voice = VoiceConfig {
            enabled: env_parse(&env, "VOX_VOICE_ENABLED")?
                .or(fc.voice.enabled)
                .unwrap_or(defaults.voice.enabled),
            wake_phrase: env("VOX_WAKE_PHRASE")
                .or(fc.voice.wake_phrase)
                .unwrap_or(defaults.voice.wake_phrase),
            cooldown: seconds(
                env_parse(&env, "VOX_COOLDOWN_SECONDS")?.or(fc.voice.cooldown_seconds),
                defaults.voice.cooldown,
            )?,
            silence_threshold: seconds(
                fc.voice.silence_threshold_seconds,
                defaults.voice.silence_threshold,
            )?,
            max_utterance: seconds(
                fc.voice.max_utterance_duration_seconds,
                defaults.voice.max_utterance,
            )?,
            min_speech: seconds(fc.voice.min_speech_seconds, defaults.voice.min_speech)?,
            speech_energy_threshold: fc
                .voice
                .speech_energy_threshold
                .unwrap_or(defaults.voice.speech_energy_threshold),
            voice_id: env("VOX_VOICE_ID")
                .or(fc.voice.voice_id)
                .unwrap_or(defaults.voice.voice_id),
            listen_window: seconds(
                fc.voice.listen_window_seconds,
                defaults.voice.listen_window,
            )?,
            text_requires_wake_phrase: fc
                .voice
                .text_requires_wake_phrase
                .unwrap_or(defaults.voice.text_requires_wake_phrase),
        };

        let sampling = SamplingParams {
            max_tokens: fc
                .conversation
                .max_tokens
                .or(defaults.conversation.sampling.max_tokens),
            temperature: fc
                .conversation
                .temperature
                .or(defaults.conversation.sampling.temperature),
            top_p: fc.conversation.top_p.or(defaults.conversation.sampling.top_p),
            presence_penalty: fc
                .conversation
                .presence_penalty
                .or(defaults.conversation.sampling.presence_penalty),
            frequency_penalty: fc
                .conversation
                .frequency_penalty
                .or(defaults.conversation.sampling.frequency_penalty),
        };

        let conversation = ConversationConfig {
            system_prompt: fc
                .conversation
                .system_prompt
                .unwrap_or(defaults.conversation.system_prompt),
            max_history: env_parse(&env, "VOX_MAX_HISTORY")?
                .or(fc.conversation.max_history)
                .unwrap_or(defaults.conversation.max_history),
            sampling,
        };

        let ollama = OllamaConfig {
            host: env("OLLAMA_HOST")
                .or(fc.ollama.host)
                .unwrap_or(defaults.ollama.host),
            model: env("OLLAMA_MODEL")
                .or(fc.ollama.model)
                .unwrap_or(defaults.ollama.model),
            request_timeout: seconds(
                fc.ollama.request_timeout_seconds,
                defaults.ollama.request_timeout,
            )?,
            stream: fc.ollama.stream.unwrap_or(defaults.ollama.stream),
            keep_alive: env("OLLAMA_KEEP_ALIVE").or(fc.ollama.keep_alive),
        };

        let stt = SttConfig {
            url: env("VOX_STT_URL")
                .or(fc.stt.url)
                .unwrap_or(defaults.stt.url),
            model: env("VOX_STT_MODEL")
                .or(fc.stt.model)
                .unwrap_or(defaults.stt.model),
            api_key: env("VOX_STT_API_KEY").or(fc.stt.api_key),
            timeout: seconds(fc.stt.timeout_seconds, defaults.stt.timeout)?,
        };

        let tts = TtsConfig {
            url: env("VOX_TTS_URL")
                .or(fc.tts.url)
                .unwrap_or(defaults.tts.url),
            model: env("VOX_TTS_MODEL")
                .or(fc.tts.model)
                .unwrap_or(defaults.tts.model),
            api_key: env("VOX_TTS_API_KEY").or(fc.tts.api_key),
            speed: fc.tts.speed.unwrap_or(defaults.tts.speed),
            timeout: seconds(fc.tts.timeout_seconds, defaults.tts.timeout)?,
        };

        let discord = DiscordConfig {
            token: env("DISCORD_TOKEN")
                .or(fc.discord.token)
                .map(SecretString::from),
            command_prefix: fc
                .discord
                .command_prefix
                .unwrap_or(defaults.discord.command_prefix),
            voice_text_channel_id: env("VOX_VOICE_TEXT_CHANNEL")
                .or(fc.discord.voice_text_channel_id),
        };

        let session = SessionConfig {
            idle_horizon: seconds(
                fc.session.idle_horizon_seconds,
                defaults.session.idle_horizon,
            )?,
        };

        Ok(Self {
            voice,
            conversation,
            ollama,
            stt,
            tts,
            discord,
            session,
        })
    }

    /// Check invariants that must hold before any session starts
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first invalid value
    pub fn validate(&self) -> Result<()> {
        if self.voice.wake_phrase.trim().is_empty() {
            return Err(Error::Config("voice.wake_phrase must not be empty".to_string()));
        }
        if self.conversation.max_history == 0 {
            return Err(Error::Config(
                "conversation.max_history must be at least 1".to_string(),
            ));
        }
        if self.voice.max_utterance.is_zero() {
            return Err(Error::Config(
                "voice.max_utterance_duration_seconds must be positive".to_string(),
            ));
        }
        if self.voice.silence_threshold.is_zero()
            || self.voice.silence_threshold >= self.voice.max_utterance
        {
            return Err(Error::Config(
                "voice.silence_threshold_seconds must be positive and below the utterance cap"
                    .to_string(),
            ));
        }
        if self.voice.min_speech >= self.voice.max_utterance {
            return Err(Error::Config(
                "voice.min_speech_seconds must be below the utterance cap".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.voice.speech_energy_threshold) {
            return Err(Error::Config(
                "voice.speech_energy_threshold must be within [0, 1)".to_string(),
            ));
        }
        if !(0.25..=4.0).contains(&self.tts.speed) {
            return Err(Error::Config("tts.speed must be between 0.25 and 4.0".to_string()));
        }
        for (name, url) in [
            ("ollama.host", &self.ollama.host),
            ("stt.url", &self.stt.url),
            ("tts.url", &self.tts.url),
        ] {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(Error::Config(format!("{name} must be an http(s) URL: {url}")));
            }
        }
        if self.discord.command_prefix.trim().is_empty() {
            return Err(Error::Config(
                "discord.command_prefix must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parse an optional environment override
fn env_parse<T, F>(env: &F, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    env(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|_| Error::Config(format!("invalid value for {key}: {raw}")))
        })
        .transpose()
}

/// Convert optional seconds into a duration, rejecting negative or non-finite values
fn seconds(value: Option<f64>, default: Duration) -> Result<Duration> {
    match value {
        None => Ok(default),
        Some(v) => Duration::try_from_secs_f64(v)
            .map_err(|_| Error::Config(format!("invalid duration in seconds: {v}"))),
    }
}
