//! Per-channel turn sequencing
//!
//! The coordinator owns every piece of cross-channel state (sessions, frame
//! buffers, cooldowns, playback) and drives one channel at a time through
//! `Listening → Capturing → Transcribing → CooldownCheck → Inferring →
//! Replying → Listening`. Each entry point returns a [`TurnOutcome`] and
//! never an error: external failures are classified, reported to the channel
//! at most once per cycle, and the channel goes back to listening.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use super::state::{PipelineState, Reply, TurnOutcome};
use crate::agent::InferenceOrchestrator;
use crate::channels::{Channel, OutgoingMessage};
use crate::config::Config;
use crate::cooldown::CooldownRegistry;
use crate::error::FailureKind;
use crate::llm::LanguageModel;
use crate::memory::ConversationStore;
use crate::session::{Claim, SessionRegistry, TurnGuard};
use crate::voice::{
    AudioFrame, AudioSink, CaptureSettings, FrameBuffer, PlaybackQueue, PushOutcome, Synthesizer,
    Transcriber, Utterance, WakePhrase, normalize,
};
use crate::{Error, Result};

/// Acknowledgement for a wake phrase with nothing after it
pub const WAKE_ACK: &str = "Yes?";

/// Posted when a spoken "stop" interrupts playback
pub const PLAYBACK_STOPPED: &str = "Stopped the current voice playback.";

/// External services the coordinator drives
#[derive(Clone)]
pub struct PipelineServices {
    pub transcriber: Arc<dyn Transcriber>,
    pub model: Arc<dyn LanguageModel>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub sink: Arc<dyn AudioSink>,
    pub outlet: Arc<dyn Channel>,
}

/// How a turn was started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    /// Wake phrase heard or typed; subject to cooldown
    Wake,
    /// Explicit request (`!ask`, listen window); skips cooldown
    Direct,
}

/// Sequences capture, transcription, inference and reply for every channel
pub struct PipelineCoordinator {
    wake: WakePhrase,
    voice_enabled: bool,
    text_requires_wake_phrase: bool,
    listen_window: Duration,
    transcription_timeout: Duration,
    idle_horizon: Duration,
    frames: Mutex<FrameBuffer>,
    sessions: SessionRegistry,
    cooldown: CooldownRegistry,
    orchestrator: InferenceOrchestrator,
    playback: PlaybackQueue,
    transcriber: Arc<dyn Transcriber>,
    outlet: Arc<dyn Channel>,
}

impl PipelineCoordinator {
    /// Build a coordinator from validated configuration
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the wake phrase cannot be compiled
    pub fn new(config: &Config, services: PipelineServices) -> Result<Self> {
        let wake = WakePhrase::new(&config.voice.wake_phrase)?;
        let memory = ConversationStore::new(config.conversation.max_history);

        Ok(Self {
            wake,
            voice_enabled: config.voice.enabled,
            text_requires_wake_phrase: config.voice.text_requires_wake_phrase,
            listen_window: config.voice.listen_window,
            transcription_timeout: config.stt.timeout,
            idle_horizon: config.session.idle_horizon,
            frames: Mutex::new(FrameBuffer::new(CaptureSettings::from(&config.voice))),
            sessions: SessionRegistry::new(),
            cooldown: CooldownRegistry::new(config.voice.cooldown),
            orchestrator: InferenceOrchestrator::new(
                services.model,
                memory,
                &config.conversation,
                config.ollama.request_timeout,
            ),
            playback: PlaybackQueue::new(
                services.synthesizer,
                services.sink,
                config.voice.voice_id.clone(),
            ),
            transcriber: services.transcriber,
            outlet: services.outlet,
        })
    }

    /// Live sessions
    #[must_use]
    pub const fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Conversation memory shared by all channels
    #[must_use]
    pub const fn memory(&self) -> &ConversationStore {
        self.orchestrator.memory()
    }

    /// Trigger cooldowns
    #[must_use]
    pub const fn cooldown(&self) -> &CooldownRegistry {
        &self.cooldown
    }

    /// Playback queues
    #[must_use]
    pub const fn playback(&self) -> &PlaybackQueue {
        &self.playback
    }

    /// Compiled wake phrase
    #[must_use]
    pub const fn wake_phrase(&self) -> &WakePhrase {
        &self.wake
    }

    /// Current state of a channel
    #[must_use]
    pub fn state(&self, channel_id: &str) -> PipelineState {
        self.sessions.state(channel_id)
    }

    /// Attach a voice connection to the channel and start listening
    pub async fn on_join(&self, channel_id: &str) -> TurnOutcome {
        if !self.voice_enabled {
            return self
                .notice(channel_id, "Voice is disabled for this relay.")
                .await;
        }

        self.discard_frames(channel_id);
        let newly = self.sessions.connect_voice(channel_id, Instant::now());
        tracing::info!(channel_id, newly, "voice connection attached");

        let text = if newly {
            format!("Listening for \"{}\".", self.wake.phrase())
        } else {
            "Already listening here.".to_string()
        };
        self.notice(channel_id, &text).await
    }

    /// Tear down the channel's voice connection and session
    ///
    /// In-flight work is cancelled and pending playback discarded. The
    /// conversation history is kept.
    pub async fn on_leave(&self, channel_id: &str) -> TurnOutcome {
        let removed = self.sessions.remove(channel_id);
        self.discard_frames(channel_id);
        self.cooldown.clear(channel_id);
        self.playback.close(channel_id).await;

        match removed {
            Some(session) if session.voice_connected => {
                tracing::info!(channel_id, "voice connection detached");
                self.notice(channel_id, "Left the voice channel.").await
            }
            _ => TurnOutcome::Ignored,
        }
    }

    /// Forget the channel's conversation and abort anything in flight
    pub async fn on_reset(&self, channel_id: &str) -> TurnOutcome {
        self.sessions.reset(channel_id, Instant::now());
        self.discard_frames(channel_id);
        self.cooldown.clear(channel_id);
        self.playback.close(channel_id).await;
        self.memory().reset(channel_id);

        tracing::info!(channel_id, "channel reset");
        self.notice(channel_id, "Conversation history cleared.").await
    }

    /// Handle a plain text message
    pub async fn on_text_message(&self, channel_id: &str, text: &str) -> TurnOutcome {
        let now = Instant::now();
        self.sessions.touch(channel_id, now);

        let text = normalize(text);
        if text.is_empty() {
            return TurnOutcome::Ignored;
        }

        let window_open = self.sessions.listen_window_open(channel_id, now);
        let (command, trigger) = if window_open {
            (self.wake.strip(&text).unwrap_or(text), Trigger::Direct)
        } else if let Some(command) = self.wake.strip(&text) {
            (command, Trigger::Wake)
        } else if self.text_requires_wake_phrase {
            return TurnOutcome::Ignored;
        } else {
            (text, Trigger::Wake)
        };

        if command.is_empty() {
            return self.acknowledge(channel_id, now).await;
        }

        // A busy channel leaves the window open for the next message
        let Some(guard) = self.begin(channel_id, PipelineState::CooldownCheck) else {
            return TurnOutcome::Busy;
        };
        if window_open {
            self.sessions.take_listen_window(channel_id, now);
        }
        let outcome = self.respond(&guard, &command, trigger, false).await;
        self.sessions.finish(&guard);
        outcome
    }

    /// Answer a question directly, without the wake phrase or cooldown
    pub async fn on_ask(&self, channel_id: &str, question: &str) -> TurnOutcome {
        self.sessions.touch(channel_id, Instant::now());

        let question = normalize(question);
        if question.is_empty() {
            return self
                .notice(channel_id, "Ask me something, e.g. `!ask what time is it in Tokyo`.")
                .await;
        }

        let Some(guard) = self.begin(channel_id, PipelineState::Inferring) else {
            return TurnOutcome::Busy;
        };
        let outcome = self.respond(&guard, &question, Trigger::Direct, false).await;
        self.sessions.finish(&guard);
        outcome
    }

    /// Accept the next utterance or message without the wake phrase
    ///
    /// The window closes after one use or when `listen_window` elapses.
    pub async fn listen_once(&self, channel_id: &str) -> TurnOutcome {
        let now = Instant::now();
        self.sessions
            .open_listen_window(channel_id, now, now + self.listen_window);

        tracing::debug!(channel_id, window_secs = self.listen_window.as_secs(), "listen window opened");
        self.notice(channel_id, "Listening...").await
    }

    /// Feed one audio frame and run the turn if it completes an utterance
    pub async fn on_audio_frame(&self, channel_id: &str, frame: AudioFrame) -> TurnOutcome {
        match self.push_audio_frame(channel_id, frame) {
            Ok(Some(utterance)) => self.process_utterance(utterance).await,
            Ok(None) => TurnOutcome::Ignored,
            Err(kind) => TurnOutcome::Dropped(kind),
        }
    }

    /// Buffer one audio frame without running the turn
    ///
    /// Returns the completed utterance when the frame closes one. Frames for
    /// channels without a voice connection are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`FailureKind::CaptureDiscarded`] when the closed buffer held
    /// too little speech.
    pub fn push_audio_frame(
        &self,
        channel_id: &str,
        frame: AudioFrame,
    ) -> std::result::Result<Option<Utterance>, FailureKind> {
        if !self.sessions.voice_connected(channel_id) {
            return Ok(None);
        }

        let outcome = self
            .frames
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_frame(channel_id, frame);

        let now = Instant::now();
        match outcome {
            PushOutcome::Idle => Ok(None),
            PushOutcome::Buffering => {
                self.sessions.set_recording(channel_id, true, now);
                Ok(None)
            }
            PushOutcome::Discarded { speech_duration } => {
                self.sessions.set_recording(channel_id, false, now);
                tracing::debug!(
                    channel_id,
                    speech_ms = speech_duration.as_millis(),
                    "capture discarded"
                );
                Err(FailureKind::CaptureDiscarded)
            }
            PushOutcome::Completed(mut utterance) => {
                utterance.generation = self.sessions.set_recording(channel_id, false, now);
                tracing::debug!(
                    channel_id,
                    duration_ms = utterance.duration.as_millis(),
                    reason = ?utterance.reason,
                    "utterance captured"
                );
                Ok(Some(utterance))
            }
        }
    }

    /// Run a captured utterance through transcription, wake detection and reply
    ///
    /// An utterance whose session was left or reset since capture is
    /// cancelled without touching the channel.
    pub async fn process_utterance(&self, utterance: Utterance) -> TurnOutcome {
        let channel_id = utterance.channel_id.clone();
        let guard = match self.sessions.try_resume(
            &channel_id,
            utterance.generation,
            PipelineState::Transcribing,
            Instant::now(),
        ) {
            Claim::Granted(guard) => guard,
            Claim::Busy => {
                tracing::debug!(channel_id, "channel busy, utterance dropped");
                return TurnOutcome::Busy;
            }
            Claim::Stale => {
                tracing::debug!(
                    channel_id,
                    generation = utterance.generation,
                    "utterance outlived its session"
                );
                return TurnOutcome::Cancelled;
            }
        };
        let outcome = self.voice_turn(&guard, &utterance).await;
        self.sessions.finish(&guard);
        outcome
    }

    /// Evict sessions idle past the configured horizon, with their history
    pub async fn evict_idle(&self, now: Instant) -> Vec<String> {
        let idle = self.sessions.idle_channels(now, self.idle_horizon);

        for channel_id in &idle {
            self.sessions.remove(channel_id);
            self.discard_frames(channel_id);
            self.cooldown.clear(channel_id);
            self.playback.close(channel_id).await;
            self.memory().reset(channel_id);
        }

        if !idle.is_empty() {
            tracing::info!(evicted = idle.len(), "idle sessions evicted");
        }
        idle
    }

    /// Close every playback worker
    pub async fn shutdown(&self) {
        self.playback.shutdown().await;
    }

    fn begin(&self, channel_id: &str, state: PipelineState) -> Option<TurnGuard> {
        let guard = self.sessions.try_begin(channel_id, state, Instant::now());
        if guard.is_none() {
            tracing::debug!(channel_id, "turn dropped, channel busy");
        }
        guard
    }

    async fn voice_turn(&self, guard: &TurnGuard, utterance: &Utterance) -> TurnOutcome {
        let channel_id = guard.channel_id.as_str();

        let transcript = match self.transcribe(utterance, &guard.cancel).await {
            Ok(text) => normalize(&text),
            Err(Error::Cancelled(_)) => return TurnOutcome::Cancelled,
            Err(e) => {
                tracing::warn!(channel_id, error = %e, "transcription failed");
                return self.fail(channel_id, FailureKind::TranscriptionUnavailable).await;
            }
        };

        if transcript.is_empty() {
            tracing::debug!(channel_id, "empty transcript");
            return TurnOutcome::Dropped(FailureKind::CaptureDiscarded);
        }

        // Only interrupts when something is actually playing
        if is_stop_command(&transcript) && self.playback.stop_current(channel_id) {
            return self.notice(channel_id, PLAYBACK_STOPPED).await;
        }

        let now = Instant::now();
        let (command, trigger) = if self.sessions.take_listen_window(channel_id, now) {
            (
                self.wake.strip(&transcript).unwrap_or(transcript),
                Trigger::Direct,
            )
        } else if let Some(command) = self.wake.strip(&transcript) {
            (command, Trigger::Wake)
        } else {
            tracing::debug!(channel_id, transcript = %transcript, "no wake phrase");
            return TurnOutcome::Ignored;
        };

        if command.is_empty() {
            return self.acknowledge(channel_id, now).await;
        }

        self.respond(guard, &command, trigger, true).await
    }

    async fn transcribe(&self, utterance: &Utterance, cancel: &CancellationToken) -> Result<String> {
        let wav = utterance.to_wav()?;
        let call = tokio::time::timeout(self.transcription_timeout, self.transcriber.transcribe(&wav));

        tokio::select! {
            () = cancel.cancelled() => Err(Error::Cancelled("transcription".to_string())),
            result = call => match result {
                Ok(result) => result,
                Err(_) => Err(Error::Transcription(format!(
                    "no transcript within {:.0}s",
                    self.transcription_timeout.as_secs_f64()
                ))),
            },
        }
    }

    async fn respond(
        &self,
        guard: &TurnGuard,
        text: &str,
        trigger: Trigger,
        speak: bool,
    ) -> TurnOutcome {
        let channel_id = guard.channel_id.as_str();

        if trigger == Trigger::Wake {
            self.sessions
                .set_state(channel_id, guard.generation, PipelineState::CooldownCheck);
            if !self.cooldown.try_trigger(channel_id, Instant::now()) {
                return TurnOutcome::Dropped(FailureKind::CooldownRejected);
            }
        }

        self.sessions
            .set_state(channel_id, guard.generation, PipelineState::Inferring);
        let reply = match self
            .orchestrator
            .handle_utterance_cancellable(channel_id, text, &guard.cancel)
            .await
        {
            Ok(reply) => reply,
            Err(Error::Cancelled(_)) => return TurnOutcome::Cancelled,
            Err(e) => return self.fail(channel_id, e.kind()).await,
        };

        self.sessions
            .set_state(channel_id, guard.generation, PipelineState::Replying);
        self.post(channel_id, &reply).await;

        let audio = if speak && self.sessions.voice_connected(channel_id) {
            self.speak(channel_id, &reply, &guard.cancel).await
        } else {
            None
        };

        TurnOutcome::Replied(Reply { text: reply, audio })
    }

    async fn speak(&self, channel_id: &str, reply: &str, cancel: &CancellationToken) -> Option<Vec<u8>> {
        let audio = tokio::select! {
            () = cancel.cancelled() => return None,
            result = self.playback.synthesize(reply) => result,
        };

        match audio {
            Ok(_) if cancel.is_cancelled() => None,
            Ok(audio) => {
                self.playback.enqueue(channel_id, audio.clone());
                Some(audio)
            }
            Err(e) => {
                // Text reply already delivered
                tracing::warn!(channel_id, error = %e, "speech synthesis failed");
                None
            }
        }
    }

    async fn acknowledge(&self, channel_id: &str, now: Instant) -> TurnOutcome {
        self.sessions
            .open_listen_window(channel_id, now, now + self.listen_window);
        self.notice(channel_id, WAKE_ACK).await
    }

    async fn fail(&self, channel_id: &str, kind: FailureKind) -> TurnOutcome {
        if kind.is_silent() {
            return TurnOutcome::Dropped(kind);
        }
        if let Some(text) = kind.notice() {
            self.post(channel_id, text).await;
        }
        TurnOutcome::Failed(kind)
    }

    async fn notice(&self, channel_id: &str, text: &str) -> TurnOutcome {
        self.post(channel_id, text).await;
        TurnOutcome::Notice(text.to_string())
    }

    async fn post(&self, channel_id: &str, text: &str) {
        let message = OutgoingMessage::text(channel_id.to_string(), text.to_string());
        if let Err(e) = self.outlet.send(message).await {
            tracing::warn!(channel_id, channel = self.outlet.name(), error = %e, "failed to post message");
        }
    }

    fn discard_frames(&self, channel_id: &str) {
        self.frames
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .discard(channel_id);
    }
}

/// Whether a transcript asks the assistant to stop talking
#[must_use]
pub fn is_stop_command(text: &str) -> bool {
    text.split(|c: char| !c.is_alphanumeric())
        .any(|word| word.eq_ignore_ascii_case("stop"))
}
