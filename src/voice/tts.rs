//! Text-to-speech (TTS) processing

use async_trait::async_trait;

use crate::config::TtsConfig;
use crate::{Error, Result};

/// Converts reply text into an encoded audio payload
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Synthesize `text` with the given voice
    ///
    /// # Errors
    ///
    /// Returns [`Error::Synthesis`] if the service fails or returns no audio
    async fn synthesize(&self, text: &str, voice_id: &str) -> Result<Vec<u8>>;
}

#[derive(serde::Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    speed: f32,
    response_format: &'a str,
}

/// Client for an OpenAI-compatible `/v1/audio/speech` endpoint
///
/// Always requests WAV output.
pub struct SpeechSynthesizer {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    speed: f32,
}

impl SpeechSynthesizer {
    /// Create a client from configuration
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn new(config: &TtsConfig) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;

        Ok(Self {
            client,
            endpoint: format!("{}/v1/audio/speech", config.url.trim_end_matches('/')),
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
            model: config.model.clone(),
            speed: config.speed,
        })
    }

    /// Endpoint this client posts to
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Synthesizer for SpeechSynthesizer {
    async fn synthesize(&self, text: &str, voice_id: &str) -> Result<Vec<u8>> {
        let request = SpeechRequest {
            model: &self.model,
            input: text,
            voice: voice_id,
            speed: self.speed,
            response_format: "wav",
        };

        let mut builder = self.client.post(&self.endpoint).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::Synthesis(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Synthesis(format!("TTS error {status}: {body}")));
        }

        let audio = response
            .bytes()
            .await
            .map_err(|e| Error::Synthesis(e.to_string()))?;

        if audio.is_empty() {
            return Err(Error::Synthesis("TTS returned no audio".to_string()));
        }

        tracing::debug!(bytes = audio.len(), voice = voice_id, "speech synthesized");
        Ok(audio.to_vec())
    }
}
