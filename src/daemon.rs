//! Daemon - the main relay service
//!
//! Wires the configured services into a [`PipelineCoordinator`], feeds it
//! microphone frames and chat messages, and evicts idle sessions.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use secrecy::ExposeSecret;
use tokio::sync::mpsc;

use crate::channels::{Channel, ConsoleChannel, DiscordChannel, IncomingMessage, OutgoingMessage};
use crate::commands::{ChatCommand, help_text};
use crate::llm::OllamaClient;
use crate::pipeline::{PipelineCoordinator, PipelineServices, TurnOutcome};
use crate::voice::{
    AudioSink, MicrophoneSource, NullSink, SpeakerSink, SpeechSynthesizer, WhisperTranscriber,
};
use crate::{Config, Result};

/// Channel id used when replies go to the console
pub const LOCAL_CHANNEL: &str = "local";

/// How often idle sessions are swept
const EVICTION_INTERVAL: Duration = Duration::from_secs(60);

/// Maps chat messages onto coordinator entry points
///
/// The relay has a single physical microphone, so at most one channel holds
/// the voice connection at a time. Joining elsewhere moves it.
pub struct CommandRouter {
    coordinator: Arc<PipelineCoordinator>,
    outlet: Arc<dyn Channel>,
    prefix: String,
    voice_channel: Arc<Mutex<Option<String>>>,
}

impl CommandRouter {
    /// Create a router for `coordinator`, posting help through `outlet`
    #[must_use]
    pub fn new(
        coordinator: Arc<PipelineCoordinator>,
        outlet: Arc<dyn Channel>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            coordinator,
            outlet,
            prefix: prefix.into(),
            voice_channel: Arc::new(Mutex::new(None)),
        }
    }

    /// Channel currently holding the voice connection
    #[must_use]
    pub fn voice_channel(&self) -> Option<String> {
        self.voice_channel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Coordinator behind this router
    #[must_use]
    pub const fn coordinator(&self) -> &Arc<PipelineCoordinator> {
        &self.coordinator
    }

    /// Attach the voice connection to `channel_id`, leaving any previous channel
    pub async fn join(&self, channel_id: &str) -> TurnOutcome {
        let previous = self
            .voice_channel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(channel_id.to_string());

        if let Some(previous) = previous.filter(|p| p != channel_id) {
            self.coordinator.on_leave(&previous).await;
        }

        let outcome = self.coordinator.on_join(channel_id).await;
        if !self.coordinator.sessions().voice_connected(channel_id) {
            self.voice_channel
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take();
        }
        outcome
    }

    /// Detach the voice connection if `channel_id` holds it
    pub async fn leave(&self, channel_id: &str) -> TurnOutcome {
        {
            let mut voice = self.voice_channel.lock().unwrap_or_else(|e| e.into_inner());
            if voice.as_deref() == Some(channel_id) {
                voice.take();
            }
        }
        self.coordinator.on_leave(channel_id).await
    }

    /// Dispatch one chat message
    pub async fn dispatch(&self, message: &IncomingMessage) -> TurnOutcome {
        let channel_id = message.channel_id.as_str();
        let command = ChatCommand::parse(&message.content, &self.prefix);

        tracing::debug!(channel_id, sender = %message.sender_name, ?command, "dispatching message");

        match command {
            ChatCommand::Join => self.join(channel_id).await,
            ChatCommand::Leave => self.leave(channel_id).await,
            ChatCommand::Reset => self.coordinator.on_reset(channel_id).await,
            ChatCommand::Listen => self.coordinator.listen_once(channel_id).await,
            ChatCommand::Ask(question) => {
                let _ = self.outlet.send_typing(channel_id).await;
                self.coordinator.on_ask(channel_id, &question).await
            }
            ChatCommand::Help => {
                let text = help_text(&self.prefix, self.coordinator.wake_phrase().phrase());
                if let Err(e) = self
                    .outlet
                    .send(OutgoingMessage::text(channel_id.to_string(), text.clone()))
                    .await
                {
                    tracing::warn!(channel_id, error = %e, "failed to post help");
                }
                TurnOutcome::Notice(text)
            }
            ChatCommand::Message(text) => self.coordinator.on_text_message(channel_id, &text).await,
        }
    }
}

/// The relay daemon - owns configuration and runs until interrupted
pub struct Daemon {
    config: Config,
}

impl Daemon {
    /// Create a new daemon instance
    #[must_use]
    pub const fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run the daemon until interrupted
    ///
    /// # Errors
    ///
    /// Returns error if a service client or the Discord connection cannot be set up
    #[allow(clippy::future_not_send)]
    pub async fn run(self) -> Result<()> {
        let config = self.config;

        let (outlet, mut messages): (Arc<dyn Channel>, Option<mpsc::Receiver<IncomingMessage>>) =
            match config
                .discord
                .token
                .as_ref()
                .map(ExposeSecret::expose_secret)
                .filter(|t| !t.trim().is_empty())
            {
                Some(token) => {
                    let (mut discord, rx) = DiscordChannel::with_receiver(token.to_string());
                    discord.connect().await?;
                    (Arc::new(discord), Some(rx))
                }
                None => {
                    tracing::info!("no Discord token, replies go to the console");
                    (Arc::new(ConsoleChannel::new()), None)
                }
            };

        let sink: Arc<dyn AudioSink> = if config.voice.enabled {
            Arc::new(SpeakerSink::new()?)
        } else {
            Arc::new(NullSink)
        };

        let services = PipelineServices {
            transcriber: Arc::new(WhisperTranscriber::new(&config.stt)?),
            model: Arc::new(OllamaClient::new(&config.ollama)?),
            synthesizer: Arc::new(SpeechSynthesizer::new(&config.tts)?),
            sink,
            outlet: Arc::clone(&outlet),
        };

        let coordinator = Arc::new(PipelineCoordinator::new(&config, services)?);
        let router = Arc::new(CommandRouter::new(
            Arc::clone(&coordinator),
            Arc::clone(&outlet),
            config.discord.command_prefix.clone(),
        ));

        // Set up shutdown signal
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = shutdown_tx.send(()).await;
            }
        });

        let mut microphone = if config.voice.enabled {
            let mut mic = MicrophoneSource::new()?;
            mic.start()?;

            let home = config
                .discord
                .voice_text_channel_id
                .clone()
                .or_else(|| messages.is_none().then(|| LOCAL_CHANNEL.to_string()));
            if let Some(channel_id) = home {
                router.join(&channel_id).await;
            }
            Some(mic)
        } else {
            None
        };

        tracing::info!(
            wake_phrase = coordinator.wake_phrase().phrase(),
            voice = microphone.is_some(),
            channel = outlet.name(),
            "relay running"
        );

        let mut frame_tick = tokio::time::interval(Duration::from_millis(100));
        let mut evict_tick = tokio::time::interval(EVICTION_INTERVAL);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("shutdown requested");
                    break;
                }
                Some(message) = recv(&mut messages) => {
                    let router = Arc::clone(&router);
                    tokio::spawn(async move {
                        let outcome = router.dispatch(&message).await;
                        tracing::debug!(channel_id = %message.channel_id, ?outcome, "message handled");
                    });
                }
                _ = frame_tick.tick(), if microphone.is_some() => {
                    if let Some(mic) = &microphone {
                        pump_frames(mic, &router);
                    }
                }
                _ = evict_tick.tick() => {
                    coordinator.evict_idle(Instant::now()).await;
                }
            }
        }

        if let Some(mic) = microphone.as_mut() {
            mic.stop();
        }
        coordinator.shutdown().await;
        Ok(())
    }
}

/// Receive from an optional message stream; pending forever when absent
async fn recv(messages: &mut Option<mpsc::Receiver<IncomingMessage>>) -> Option<IncomingMessage> {
    match messages {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Route captured frames to the channel holding the voice connection
///
/// Completed utterances run on their own task so capture keeps going while
/// the turn is in flight.
fn pump_frames(mic: &MicrophoneSource, router: &CommandRouter) {
    let frames = mic.take_frames();
    let Some(channel_id) = router.voice_channel() else {
        return;
    };

    for frame in frames {
        match router.coordinator().push_audio_frame(&channel_id, frame) {
            Ok(Some(utterance)) => {
                let coordinator = Arc::clone(router.coordinator());
                tokio::spawn(async move {
                    let outcome = coordinator.process_utterance(utterance).await;
                    tracing::debug!(?outcome, "utterance handled");
                });
            }
            Ok(None) => {}
            Err(kind) => tracing::trace!(?kind, "capture dropped"),
        }
    }
}
