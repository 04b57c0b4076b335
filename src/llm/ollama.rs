//! Ollama chat client

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use super::{ChatMessage, LanguageModel, SamplingParams};
use crate::config::OllamaConfig;
use crate::{Error, Result};

/// Chat request body for `/api/chat`
#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Options::is_empty")]
    options: Options,
    #[serde(skip_serializing_if = "Option::is_none")]
    keep_alive: Option<&'a str>,
}

/// Model options; Ollama calls the token limit `num_predict`
#[derive(Serialize, Default)]
struct Options {
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f32>,
}

impl Options {
    const fn from_sampling(sampling: &SamplingParams) -> Self {
        Self {
            num_predict: sampling.max_tokens,
            temperature: sampling.temperature,
            top_p: sampling.top_p,
            presence_penalty: sampling.presence_penalty,
            frequency_penalty: sampling.frequency_penalty,
        }
    }

    const fn is_empty(&self) -> bool {
        self.num_predict.is_none()
            && self.temperature.is_none()
            && self.top_p.is_none()
            && self.presence_penalty.is_none()
            && self.frequency_penalty.is_none()
    }
}

/// One chat response object (whole body, or one NDJSON line when streaming)
#[derive(Deserialize, Default)]
struct ChatChunk {
    #[serde(default)]
    message: Option<ChunkMessage>,
    #[serde(default)]
    done: bool,
}

#[derive(Deserialize, Default)]
struct ChunkMessage {
    #[serde(default)]
    content: String,
}

/// Client for a local Ollama server
pub struct OllamaClient {
    client: reqwest::Client,
    host: String,
    model: String,
    stream: bool,
    keep_alive: Option<String>,
}

impl OllamaClient {
    /// Create a new Ollama client
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn new(config: &OllamaConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            client,
            host: config.host.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            stream: config.stream,
            keep_alive: config.keep_alive.clone(),
        })
    }

    /// Model identifier requests are sent to
    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    fn request<'a>(
        &'a self,
        messages: &'a [ChatMessage],
        sampling: &SamplingParams,
        stream: bool,
    ) -> ChatRequest<'a> {
        ChatRequest {
            model: &self.model,
            messages,
            stream,
            options: Options::from_sampling(sampling),
            keep_alive: self.keep_alive.as_deref(),
        }
    }

    async fn post_chat(&self, body: &ChatRequest<'_>) -> Result<reqwest::Response> {
        let url = format!("{}/api/chat", self.host);
        tracing::debug!(
            model = %self.model,
            messages = body.messages.len(),
            stream = body.stream,
            "sending Ollama request"
        );

        let response = self.client.post(&url).json(body).send().await.map_err(|e| {
            tracing::error!(error = %e, "Ollama request failed");
            Error::Inference(format!("Ollama request failed: {e}"))
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Ollama API error");
            return Err(Error::Inference(format!("Ollama API error {status}: {body}")));
        }

        Ok(response)
    }

    async fn complete_once(
        &self,
        messages: &[ChatMessage],
        sampling: &SamplingParams,
    ) -> Result<String> {
        let response = self.post_chat(&self.request(messages, sampling, false)).await?;
        let chunk: ChatChunk = response
            .json()
            .await
            .map_err(|e| Error::Inference(format!("invalid Ollama response: {e}")))?;

        Ok(chunk.message.map(|m| m.content).unwrap_or_default())
    }

    async fn complete_streaming(
        &self,
        messages: &[ChatMessage],
        sampling: &SamplingParams,
    ) -> Result<String> {
        let response = self.post_chat(&self.request(messages, sampling, true)).await?;
        let mut stream = response.bytes_stream();
        let mut pending = Vec::new();
        let mut reply = String::new();

        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|e| Error::Inference(format!("Ollama stream error: {e}")))?;
            pending.extend_from_slice(&bytes);

            if drain_lines(&mut pending, &mut reply) {
                return Ok(reply);
            }
        }

        // Trailing object without a final newline
        if !pending.is_empty() {
            pending.push(b'\n');
            drain_lines(&mut pending, &mut reply);
        }

        Ok(reply)
    }
}

/// Consume complete NDJSON lines from `pending`, appending content to `reply`
///
/// Returns true once a `done` object has been seen. Lines that fail to parse
/// are skipped.
fn drain_lines(pending: &mut Vec<u8>, reply: &mut String) -> bool {
    while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
        let line: Vec<u8> = pending.drain(..=pos).collect();
        let line = line.trim_ascii();
        if line.is_empty() {
            continue;
        }

        match serde_json::from_slice::<ChatChunk>(line) {
            Ok(chunk) => {
                if let Some(message) = chunk.message {
                    reply.push_str(&message.content);
                }
                if chunk.done {
                    pending.clear();
                    return true;
                }
            }
            Err(e) => {
                tracing::trace!(error = %e, "skipping malformed stream line");
            }
        }
    }

    false
}

#[async_trait]
impl LanguageModel for OllamaClient {
    fn name(&self) -> &'static str {
        "ollama"
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        sampling: &SamplingParams,
    ) -> Result<String> {
        let reply = if self.stream {
            self.complete_streaming(messages, sampling).await?
        } else {
            self.complete_once(messages, sampling).await?
        };

        tracing::debug!(reply_len = reply.len(), "Ollama responded");
        Ok(reply)
    }

    async fn ping(&self) -> Result<()> {
        let url = format!("{}/api/version", self.host);
        let response = self.client.get(&url).send().await.map_err(|e| {
            Error::Inference(format!(
                "unable to reach Ollama at {}: {e}. Check that the service is running",
                self.host
            ))
        })?;

        if !response.status().is_success() {
            return Err(Error::Inference(format!(
                "Ollama at {} answered {}",
                self.host,
                response.status()
            )));
        }

        Ok(())
    }
}
