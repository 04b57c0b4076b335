//! TOML configuration file loading
//!
//! Supports `~/.config/vox/relay/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::{Error, Result};

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct RelayConfigFile {
    /// Wake phrase, cooldown and capture tuning
    #[serde(default)]
    pub voice: VoiceFileConfig,

    /// Prompt and sampling configuration
    #[serde(default)]
    pub conversation: ConversationFileConfig,

    /// Local Ollama server
    #[serde(default)]
    pub ollama: OllamaFileConfig,

    /// Speech-to-text service
    #[serde(default)]
    pub stt: SttFileConfig,

    /// Text-to-speech service
    #[serde(default)]
    pub tts: TtsFileConfig,

    /// Discord text channel
    #[serde(default)]
    pub discord: DiscordFileConfig,

    /// Session lifetime
    #[serde(default)]
    pub session: SessionFileConfig,
}

/// Voice capture and wake phrase configuration
#[derive(Debug, Default, Deserialize)]
pub struct VoiceFileConfig {
    /// Enable the local voice connection
    pub enabled: Option<bool>,

    /// Wake phrase (e.g. "hey assistant")
    pub wake_phrase: Option<String>,

    /// Minimum seconds between accepted triggers per channel
    pub cooldown_seconds: Option<f64>,

    /// Silence run that closes an utterance
    pub silence_threshold_seconds: Option<f64>,

    /// Hard cap on a single utterance
    pub max_utterance_duration_seconds: Option<f64>,

    /// Utterances with less speech than this are discarded
    pub min_speech_seconds: Option<f64>,

    /// RMS level above which a frame counts as speech
    pub speech_energy_threshold: Option<f32>,

    /// Synthesis voice identifier
    pub voice_id: Option<String>,

    /// Window opened by the on-demand listen command
    pub listen_window_seconds: Option<f64>,

    /// Require the wake phrase on plain text messages
    pub text_requires_wake_phrase: Option<bool>,
}

/// Conversation configuration
#[derive(Debug, Default, Deserialize)]
pub struct ConversationFileConfig {
    pub system_prompt: Option<String>,
    pub max_history: Option<usize>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub presence_penalty: Option<f32>,
    pub frequency_penalty: Option<f32>,
}

/// Ollama configuration
#[derive(Debug, Default, Deserialize)]
pub struct OllamaFileConfig {
    /// Base URL (e.g. `http://localhost:11434`)
    pub host: Option<String>,
    pub model: Option<String>,
    pub request_timeout_seconds: Option<f64>,
    pub stream: Option<bool>,
    pub keep_alive: Option<String>,
}

/// Speech-to-text configuration
#[derive(Debug, Default, Deserialize)]
pub struct SttFileConfig {
    /// Base URL of an OpenAI-compatible transcription server
    pub url: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub timeout_seconds: Option<f64>,
}

/// Text-to-speech configuration
#[derive(Debug, Default, Deserialize)]
pub struct TtsFileConfig {
    /// Base URL of an OpenAI-compatible speech server
    pub url: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub speed: Option<f32>,
    pub timeout_seconds: Option<f64>,
}

/// Discord configuration (token may also come from `DISCORD_TOKEN`)
#[derive(Debug, Default, Deserialize)]
pub struct DiscordFileConfig {
    pub token: Option<String>,
    pub command_prefix: Option<String>,
    /// Text channel that receives replies for the local voice connection
    pub voice_text_channel_id: Option<String>,
}

/// Session configuration
#[derive(Debug, Default, Deserialize)]
pub struct SessionFileConfig {
    /// Sessions idle longer than this are evicted
    pub idle_horizon_seconds: Option<f64>,
}

/// Load the TOML config file from the standard path
///
/// Returns `RelayConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> RelayConfigFile {
    let Some(path) = config_file_path() else {
        return RelayConfigFile::default();
    };

    if !path.exists() {
        return RelayConfigFile::default();
    }

    match read_config_file(&path) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to load config file, using defaults"
            );
            RelayConfigFile::default()
        }
    }
}

/// Read and parse a config file at an explicit path
///
/// # Errors
///
/// Returns error if the file is missing or not valid TOML for this schema
pub fn read_config_file(path: &Path) -> Result<RelayConfigFile> {
    if !path.exists() {
        return Err(Error::Config(format!(
            "configuration file not found: {}",
            path.display()
        )));
    }

    let content = std::fs::read_to_string(path)?;
    let config: RelayConfigFile = toml::from_str(&content)?;
    tracing::info!(path = %path.display(), "loaded config file");
    Ok(config)
}

/// Return the config file path: `~/.config/vox/relay/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("vox").join("relay").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_parses() {
        let parsed: RelayConfigFile = toml::from_str(
            r#"
            [voice]
            wake_phrase = "hey assistant"
            cooldown_seconds = 5.0

            [ollama]
            model = "llama3.1"
            "#,
        )
        .unwrap();

        assert_eq!(parsed.voice.wake_phrase.as_deref(), Some("hey assistant"));
        assert_eq!(parsed.voice.cooldown_seconds, Some(5.0));
        assert_eq!(parsed.ollama.model.as_deref(), Some("llama3.1"));
        assert!(parsed.discord.token.is_none());
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let err = read_config_file(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
