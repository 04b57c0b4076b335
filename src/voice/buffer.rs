//! Utterance buffering and boundary detection
//!
//! Frames are pushed per channel. Buffering starts at the first speech frame
//! and the utterance closes when the trailing silence run reaches the silence
//! threshold or the buffer reaches the hard duration cap. Utterances with too
//! little speech are dropped without any downstream call.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::capture::samples_to_wav;
use crate::config::VoiceConfig;
use crate::Result;

/// A chunk of mono audio from a voice source
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// PCM samples in [-1.0, 1.0]
    pub samples: Vec<f32>,

    /// Samples per second
    pub sample_rate: u32,

    /// Speech/silence label supplied by the source, if it has one
    pub speech: Option<bool>,
}

impl AudioFrame {
    /// Create an unlabelled frame; speech is derived from its energy
    #[must_use]
    pub const fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            speech: None,
        }
    }

    /// Create a frame with an external speech/silence label
    #[must_use]
    pub const fn labelled(samples: Vec<f32>, sample_rate: u32, speech: bool) -> Self {
        Self {
            samples,
            sample_rate,
            speech: Some(speech),
        }
    }

    /// Playback duration of this frame
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / f64::from(self.sample_rate))
    }

    /// Whether this frame counts as speech at the given RMS threshold
    #[must_use]
    pub fn is_speech(&self, energy_threshold: f32) -> bool {
        self.speech
            .unwrap_or_else(|| calculate_energy(&self.samples) > energy_threshold)
    }
}

/// Boundary thresholds for utterance capture
#[derive(Debug, Clone, Copy)]
pub struct CaptureSettings {
    /// Silence run that closes an utterance
    pub silence_threshold: Duration,

    /// Hard cap on buffered duration
    pub max_utterance: Duration,

    /// Minimum speech for an utterance to be kept
    pub min_speech: Duration,

    /// RMS level above which an unlabelled frame is speech
    pub energy_threshold: f32,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self::from(&VoiceConfig::default())
    }
}

impl From<&VoiceConfig> for CaptureSettings {
    fn from(config: &VoiceConfig) -> Self {
        Self {
            silence_threshold: config.silence_threshold,
            max_utterance: config.max_utterance,
            min_speech: config.min_speech,
            energy_threshold: config.speech_energy_threshold,
        }
    }
}

/// Why an utterance was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Trailing silence reached the threshold
    Silence,
    /// Buffered duration reached the cap
    MaxDuration,
}

/// A completed utterance ready for transcription
#[derive(Debug, Clone)]
pub struct Utterance {
    pub channel_id: String,
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub started_at: Instant,
    pub duration: Duration,
    pub speech_duration: Duration,
    pub reason: CloseReason,
    /// Session incarnation that captured it, stamped by the coordinator
    pub generation: u64,
}

impl Utterance {
    /// Encode as 16-bit mono WAV
    ///
    /// # Errors
    ///
    /// Returns error if WAV encoding fails
    pub fn to_wav(&self) -> Result<Vec<u8>> {
        samples_to_wav(&self.samples, self.sample_rate)
    }
}

/// Result of pushing one frame
#[derive(Debug)]
pub enum PushOutcome {
    /// Silence with nothing buffered
    Idle,
    /// Frame buffered; utterance still open
    Buffering,
    /// Utterance closed with enough speech
    Completed(Utterance),
    /// Utterance closed but was too short; nothing to transcribe
    Discarded { speech_duration: Duration },
}

/// In-progress capture for one channel
#[derive(Debug)]
struct UtteranceBuffer {
    start_time: Instant,
    sample_rate: u32,
    samples: Vec<f32>,
    silence_run_samples: usize,
    speech_samples: usize,
}

impl UtteranceBuffer {
    fn new(sample_rate: u32) -> Self {
        Self {
            start_time: Instant::now(),
            sample_rate,
            samples: Vec::new(),
            silence_run_samples: 0,
            speech_samples: 0,
        }
    }

    fn duration_of(&self, samples: usize) -> Duration {
        samples_to_duration(samples, self.sample_rate)
    }
}

/// Per-channel audio frame buffer
#[derive(Debug)]
pub struct FrameBuffer {
    settings: CaptureSettings,
    buffers: HashMap<String, UtteranceBuffer>,
}

impl FrameBuffer {
    /// Create a frame buffer with the given thresholds
    #[must_use]
    pub fn new(settings: CaptureSettings) -> Self {
        Self {
            settings,
            buffers: HashMap::new(),
        }
    }

    /// Thresholds in use
    #[must_use]
    pub const fn settings(&self) -> &CaptureSettings {
        &self.settings
    }

    /// Append a frame to the channel's active utterance
    pub fn push_frame(&mut self, channel_id: &str, frame: AudioFrame) -> PushOutcome {
        if frame.samples.is_empty() || frame.sample_rate == 0 {
            return self.outcome_without_close(channel_id);
        }

        let is_speech = frame.is_speech(self.settings.energy_threshold);

        if !self.buffers.contains_key(channel_id) {
            if !is_speech {
                return PushOutcome::Idle;
            }
            tracing::trace!(channel_id, "speech started");
            self.buffers
                .insert(channel_id.to_string(), UtteranceBuffer::new(frame.sample_rate));
        }

        let Some(buffer) = self.buffers.get_mut(channel_id) else {
            return PushOutcome::Idle;
        };

        if frame.sample_rate != buffer.sample_rate {
            tracing::warn!(
                channel_id,
                expected = buffer.sample_rate,
                got = frame.sample_rate,
                "dropping frame with mismatched sample rate"
            );
            return PushOutcome::Buffering;
        }

        let cap = duration_to_samples(self.settings.max_utterance, buffer.sample_rate);
        let room = cap.saturating_sub(buffer.samples.len());
        let take = frame.samples.len().min(room);
        buffer.samples.extend_from_slice(&frame.samples[..take]);

        if is_speech {
            buffer.silence_run_samples = 0;
            buffer.speech_samples += take;
        } else {
            buffer.silence_run_samples += take;
        }

        let silence_limit = duration_to_samples(self.settings.silence_threshold, buffer.sample_rate);
        let reason = if buffer.samples.len() >= cap {
            Some(CloseReason::MaxDuration)
        } else if buffer.silence_run_samples >= silence_limit {
            Some(CloseReason::Silence)
        } else {
            None
        };

        match reason {
            Some(reason) => self.close(channel_id, reason),
            None => PushOutcome::Buffering,
        }
    }

    fn outcome_without_close(&self, channel_id: &str) -> PushOutcome {
        if self.buffers.contains_key(channel_id) {
            PushOutcome::Buffering
        } else {
            PushOutcome::Idle
        }
    }

    fn close(&mut self, channel_id: &str, reason: CloseReason) -> PushOutcome {
        let Some(buffer) = self.buffers.remove(channel_id) else {
            return PushOutcome::Idle;
        };

        let speech_duration = buffer.duration_of(buffer.speech_samples);
        if speech_duration < self.settings.min_speech {
            tracing::debug!(
                channel_id,
                speech_ms = speech_duration.as_millis(),
                "utterance too short, discarded"
            );
            return PushOutcome::Discarded { speech_duration };
        }

        let duration = buffer.duration_of(buffer.samples.len());
        tracing::debug!(
            channel_id,
            duration_ms = duration.as_millis(),
            speech_ms = speech_duration.as_millis(),
            ?reason,
            "utterance complete"
        );

        PushOutcome::Completed(Utterance {
            channel_id: channel_id.to_string(),
            samples: buffer.samples,
            sample_rate: buffer.sample_rate,
            started_at: buffer.start_time,
            duration,
            speech_duration,
            reason,
            generation: 0,
        })
    }

    /// Drop any in-flight capture for a channel
    ///
    /// Returns true if something was discarded.
    pub fn discard(&mut self, channel_id: &str) -> bool {
        let discarded = self.buffers.remove(channel_id).is_some();
        if discarded {
            tracing::debug!(channel_id, "in-flight capture discarded");
        }
        discarded
    }

    /// Whether a capture is open for the channel
    #[must_use]
    pub fn is_capturing(&self, channel_id: &str) -> bool {
        self.buffers.contains_key(channel_id)
    }

    /// Buffered duration for the channel's open capture
    #[must_use]
    pub fn buffered(&self, channel_id: &str) -> Duration {
        self.buffers
            .get(channel_id)
            .map_or(Duration::ZERO, |b| b.duration_of(b.samples.len()))
    }
}

#[allow(clippy::cast_precision_loss)]
fn samples_to_duration(samples: usize, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(samples as f64 / f64::from(sample_rate))
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn duration_to_samples(duration: Duration, sample_rate: u32) -> usize {
    (duration.as_secs_f64() * f64::from(sample_rate)).round() as usize
}

/// Calculate RMS energy of audio samples
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn calculate_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}
