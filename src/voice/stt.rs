//! Speech-to-text (STT) processing

use std::time::Duration;

use async_trait::async_trait;

use crate::config::SttConfig;
use crate::{Error, Result};

/// Converts a WAV utterance into text
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe WAV audio bytes
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transcription`] if the service fails
    async fn transcribe(&self, audio: &[u8]) -> Result<String>;
}

/// Response from an OpenAI-compatible transcription endpoint
#[derive(serde::Deserialize)]
struct WhisperResponse {
    text: String,
}

/// Client for an OpenAI-compatible `/v1/audio/transcriptions` endpoint
///
/// Works against hosted Whisper or a local faster-whisper server.
pub struct WhisperTranscriber {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
}

impl WhisperTranscriber {
    /// Create a client from configuration
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn new(config: &SttConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout + Duration::from_secs(5))
            .build()?;

        Ok(Self {
            client,
            endpoint: format!(
                "{}/v1/audio/transcriptions",
                config.url.trim_end_matches('/')
            ),
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
            model: config.model.clone(),
        })
    }

    /// Endpoint this client posts to
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Transcriber for WhisperTranscriber {
    async fn transcribe(&self, audio: &[u8]) -> Result<String> {
        tracing::debug!(audio_bytes = audio.len(), "starting transcription");

        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(audio.to_vec())
                    .file_name("audio.wav")
                    .mime_str("audio/wav")
                    .map_err(|e| Error::Transcription(e.to_string()))?,
            )
            .text("model", self.model.clone())
            .text("response_format", "json");

        let mut request = self.client.post(&self.endpoint).multipart(form);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            tracing::error!(error = %e, "transcription request failed");
            Error::Transcription(e.to_string())
        })?;

        let status = response.status();
        tracing::debug!(status = %status, "received response");

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "transcription API error");
            return Err(Error::Transcription(format!("API error {status}: {body}")));
        }

        let result: WhisperResponse = response.json().await.map_err(|e| {
            tracing::error!(error = %e, "failed to parse response");
            Error::Transcription(e.to_string())
        })?;

        let text = result.text.trim().to_string();
        tracing::info!(transcript = %text, "transcription complete");
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_joins_base_url() {
        let config = SttConfig {
            url: "http://localhost:8000/".to_string(),
            ..SttConfig::default()
        };
        let stt = WhisperTranscriber::new(&config).unwrap();
        assert_eq!(stt.endpoint(), "http://localhost:8000/v1/audio/transcriptions");
    }

    #[test]
    fn test_empty_api_key_is_ignored() {
        let config = SttConfig {
            api_key: Some(String::new()),
            ..SttConfig::default()
        };
        let stt = WhisperTranscriber::new(&config).unwrap();
        assert!(stt.api_key.is_none());
    }
}
