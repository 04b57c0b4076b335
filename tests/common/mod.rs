//! Shared test utilities

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use vox_relay::channels::{Channel, IncomingMessage, OutgoingMessage};
use vox_relay::llm::{ChatMessage, LanguageModel, SamplingParams};
use vox_relay::voice::{AudioFrame, AudioSink, Synthesizer, Transcriber};
use vox_relay::{Config, Error, PipelineCoordinator, PipelineServices, Result};

/// Frame length used by the helpers
pub const FRAME_MS: u32 = 100;
const RATE: u32 = 16000;

/// Transcriber returning scripted transcripts, then `fallback`
pub struct MockTranscriber {
    script: Mutex<VecDeque<Result<String>>>,
    fallback: Mutex<String>,
    pub delay: Mutex<Duration>,
    pub calls: AtomicUsize,
}

impl MockTranscriber {
    pub fn new(fallback: &str) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(fallback.to_string()),
            delay: Mutex::new(Duration::ZERO),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, result: Result<String>) {
        self.script.lock().unwrap().push_back(result);
    }

    pub fn set_fallback(&self, text: &str) {
        *self.fallback.lock().unwrap() = text.to_string();
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transcriber for MockTranscriber {
    async fn transcribe(&self, audio: &[u8]) -> Result<String> {
        assert!(audio.starts_with(b"RIFF"), "transcriber expects WAV input");
        self.calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        tokio::time::sleep(delay).await;

        let scripted = self.script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(self.fallback.lock().unwrap().clone()))
    }
}

/// Language model that answers "reply to: <last user message>"
#[derive(Default)]
pub struct MockModel {
    failures: Mutex<VecDeque<Error>>,
    pub delay: Mutex<Duration>,
    pub prompts: Mutex<Vec<Vec<ChatMessage>>>,
}

impl MockModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, error: Error) {
        self.failures.lock().unwrap().push_back(error);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

#[async_trait]
impl LanguageModel for MockModel {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn complete(&self, messages: &[ChatMessage], _sampling: &SamplingParams) -> Result<String> {
        self.prompts.lock().unwrap().push(messages.to_vec());

        let delay = *self.delay.lock().unwrap();
        tokio::time::sleep(delay).await;

        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }

        let last = messages.last().map(|m| m.content.clone()).unwrap_or_default();
        Ok(format!("reply to: {last}"))
    }
}

/// Synthesizer that encodes the text itself as the audio payload
#[derive(Default)]
pub struct MockSynthesizer {
    pub fail: Mutex<bool>,
    pub delay: Mutex<Duration>,
    pub calls: AtomicUsize,
}

impl MockSynthesizer {
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }
}

#[async_trait]
impl Synthesizer for MockSynthesizer {
    async fn synthesize(&self, text: &str, _voice_id: &str) -> Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        tokio::time::sleep(delay).await;

        if *self.fail.lock().unwrap() {
            return Err(Error::Synthesis("tts offline".to_string()));
        }
        Ok(text.as_bytes().to_vec())
    }
}

/// Sink that records start/end events and takes `play_time` per job
pub struct MockSink {
    pub events: Mutex<Vec<String>>,
    pub play_time: Duration,
}

impl MockSink {
    pub fn new(play_time: Duration) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            play_time,
        }
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl AudioSink for MockSink {
    async fn play(&self, audio: &[u8], cancel: &CancellationToken) -> Result<()> {
        let name = String::from_utf8_lossy(audio).to_string();
        self.events.lock().unwrap().push(format!("start {name}"));
        tokio::select! {
            () = cancel.cancelled() => {
                self.events.lock().unwrap().push(format!("stopped {name}"));
            }
            () = tokio::time::sleep(self.play_time) => {
                self.events.lock().unwrap().push(format!("end {name}"));
            }
        }
        Ok(())
    }
}

/// Outlet recording everything posted
#[derive(Default)]
pub struct MockChannel {
    pub sent: Mutex<Vec<OutgoingMessage>>,
}

impl MockChannel {
    pub fn texts(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|m| m.content.clone()).collect()
    }

    pub fn texts_for(&self, channel_id: &str) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.channel_id == channel_id)
            .map(|m| m.content.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }
}

#[async_trait]
impl Channel for MockChannel {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        Ok(())
    }

    async fn send(&self, message: OutgoingMessage) -> Result<()> {
        self.sent.lock().unwrap().push(message);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        true
    }
}

/// Configuration with short thresholds and no cooldown
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.voice.cooldown = Duration::ZERO;
    config.voice.silence_threshold = Duration::from_millis(300);
    config.voice.min_speech = Duration::from_millis(200);
    config.voice.max_utterance = Duration::from_secs(3);
    config.voice.listen_window = Duration::from_secs(20);
    config.stt.timeout = Duration::from_millis(200);
    config.ollama.request_timeout = Duration::from_millis(500);
    config
}

/// A coordinator wired to mocks
pub struct Harness {
    pub coordinator: Arc<PipelineCoordinator>,
    pub transcriber: Arc<MockTranscriber>,
    pub model: Arc<MockModel>,
    pub synthesizer: Arc<MockSynthesizer>,
    pub sink: Arc<MockSink>,
    pub outlet: Arc<MockChannel>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(&test_config())
    }

    pub fn with_config(config: &Config) -> Self {
        Self::with_playback(config, Duration::from_millis(50))
    }

    /// Harness whose sink takes `play_time` per reply
    pub fn with_playback(config: &Config, play_time: Duration) -> Self {
        let transcriber = Arc::new(MockTranscriber::new(""));
        let model = Arc::new(MockModel::new());
        let synthesizer = Arc::new(MockSynthesizer::default());
        let sink = Arc::new(MockSink::new(play_time));
        let outlet = Arc::new(MockChannel::default());

        let services = PipelineServices {
            transcriber: Arc::clone(&transcriber) as Arc<dyn Transcriber>,
            model: Arc::clone(&model) as Arc<dyn LanguageModel>,
            synthesizer: Arc::clone(&synthesizer) as Arc<dyn Synthesizer>,
            sink: Arc::clone(&sink) as Arc<dyn AudioSink>,
            outlet: Arc::clone(&outlet) as Arc<dyn Channel>,
        };

        let coordinator =
            Arc::new(PipelineCoordinator::new(config, services).expect("valid test config"));

        Self {
            coordinator,
            transcriber,
            model,
            synthesizer,
            sink,
            outlet,
        }
    }

    /// Feed speech then enough silence to close the utterance, returning the last outcome
    pub async fn speak(&self, channel_id: &str, speech_ms: u32) -> vox_relay::TurnOutcome {
        for frame in speech(speech_ms) {
            self.coordinator.on_audio_frame(channel_id, frame).await;
        }
        let mut last = vox_relay::TurnOutcome::Ignored;
        for frame in silence(300) {
            last = self.coordinator.on_audio_frame(channel_id, frame).await;
        }
        last
    }
}

/// Labelled speech frames covering `ms`
pub fn speech(ms: u32) -> Vec<AudioFrame> {
    frames(ms, true)
}

/// Labelled silence frames covering `ms`
pub fn silence(ms: u32) -> Vec<AudioFrame> {
    frames(ms, false)
}

fn frames(ms: u32, speech: bool) -> Vec<AudioFrame> {
    let per_frame = (RATE / 1000 * FRAME_MS) as usize;
    let level = if speech { 0.2 } else { 0.0 };
    (0..ms / FRAME_MS)
        .map(|_| AudioFrame::labelled(vec![level; per_frame], RATE, speech))
        .collect()
}

/// A chat message from a test user
pub fn message(channel_id: &str, content: &str) -> IncomingMessage {
    IncomingMessage {
        id: "1".to_string(),
        channel_id: channel_id.to_string(),
        sender_id: "42".to_string(),
        sender_name: "tester".to_string(),
        content: content.to_string(),
        is_dm: false,
    }
}
