//! Audio playback to speakers

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Sample rate for playback (matches common TTS output)
const PLAYBACK_SAMPLE_RATE: u32 = 24000;

/// A voice connection that can play synthesized audio
///
/// `play` resolves once the audio has finished or `cancel` fired. Cancellation
/// is not an error.
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Play an encoded audio payload (WAV or MP3)
    async fn play(&self, audio: &[u8], cancel: &CancellationToken) -> Result<()>;
}

/// Decoded mono PCM
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl DecodedAudio {
    /// Playback length
    #[must_use]
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        #[allow(clippy::cast_precision_loss)]
        Duration::from_secs_f64(self.samples.len() as f64 / f64::from(self.sample_rate))
    }
}

/// Plays audio to the default output device
pub struct SpeakerSink {
    config: StreamConfig,
}

impl SpeakerSink {
    /// Open the default output device
    ///
    /// # Errors
    ///
    /// Returns error if audio device cannot be opened
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Playback("no output device available".to_string()))?;

        let supported_config = device
            .supported_output_configs()
            .map_err(|e| Error::Playback(e.to_string()))?
            .find(|c| {
                c.channels() == 1
                    && c.min_sample_rate() <= SampleRate(PLAYBACK_SAMPLE_RATE)
                    && c.max_sample_rate() >= SampleRate(PLAYBACK_SAMPLE_RATE)
            })
            .or_else(|| {
                // Fallback: try stereo
                device.supported_output_configs().ok()?.find(|c| {
                    c.channels() == 2
                        && c.min_sample_rate() <= SampleRate(PLAYBACK_SAMPLE_RATE)
                        && c.max_sample_rate() >= SampleRate(PLAYBACK_SAMPLE_RATE)
                })
            })
            .ok_or_else(|| Error::Playback("no suitable output config found".to_string()))?;

        let config = supported_config
            .with_sample_rate(SampleRate(PLAYBACK_SAMPLE_RATE))
            .config();

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = PLAYBACK_SAMPLE_RATE,
            channels = config.channels,
            "audio playback initialized"
        );

        Ok(Self { config })
    }

    /// Play decoded samples, blocking the current thread until done or cancelled
    fn play_blocking(
        config: &StreamConfig,
        audio: DecodedAudio,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if audio.samples.is_empty() {
            return Ok(());
        }

        let samples = resample(&audio.samples, audio.sample_rate, PLAYBACK_SAMPLE_RATE)?;
        let sample_count = samples.len();

        let device = cpal::default_host()
            .default_output_device()
            .ok_or_else(|| Error::Playback("no output device".to_string()))?;

        let channels = usize::from(config.channels);
        let samples = Arc::new(samples);
        let position = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicBool::new(false));

        let stream = {
            let samples = Arc::clone(&samples);
            let position = Arc::clone(&position);
            let finished = Arc::clone(&finished);
            device
                .build_output_stream(
                    config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        for frame in data.chunks_mut(channels) {
                            let pos = position.load(Ordering::Relaxed);
                            let sample = if let Some(&s) = samples.get(pos) {
                                position.store(pos + 1, Ordering::Relaxed);
                                s
                            } else {
                                finished.store(true, Ordering::Relaxed);
                                0.0
                            };
                            frame.fill(sample);
                        }
                    },
                    |err| {
                        tracing::error!(error = %err, "audio playback error");
                    },
                    None,
                )
                .map_err(|e| Error::Playback(e.to_string()))?
        };

        stream.play().map_err(|e| Error::Playback(e.to_string()))?;

        let duration_ms = (sample_count as u64 * 1000) / u64::from(PLAYBACK_SAMPLE_RATE);
        let start = Instant::now();
        let timeout = Duration::from_millis(duration_ms + 500);

        while !finished.load(Ordering::Relaxed) {
            if cancel.is_cancelled() {
                tracing::debug!("playback interrupted");
                return Ok(());
            }
            if start.elapsed() > timeout {
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }

        // Let the device drain its last buffer
        std::thread::sleep(Duration::from_millis(100));

        drop(stream);
        tracing::debug!(samples = sample_count, "playback complete");

        Ok(())
    }
}

#[async_trait]
impl AudioSink for SpeakerSink {
    async fn play(&self, audio: &[u8], cancel: &CancellationToken) -> Result<()> {
        let decoded = decode_audio(audio)?;
        let config = self.config.clone();
        let cancel = cancel.clone();

        tokio::task::spawn_blocking(move || Self::play_blocking(&config, decoded, &cancel))
            .await
            .map_err(|e| Error::Playback(format!("playback task failed: {e}")))?
    }
}

/// Sink that drops audio; used when voice is disabled
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

#[async_trait]
impl AudioSink for NullSink {
    async fn play(&self, audio: &[u8], _cancel: &CancellationToken) -> Result<()> {
        tracing::trace!(bytes = audio.len(), "audio dropped, voice disabled");
        Ok(())
    }
}

/// Decode a WAV or MP3 payload to mono f32 samples
///
/// # Errors
///
/// Returns error if the payload is neither format or fails to decode
pub fn decode_audio(data: &[u8]) -> Result<DecodedAudio> {
    if data.starts_with(b"RIFF") {
        decode_wav(data)
    } else {
        decode_mp3(data)
    }
}

/// Decode WAV bytes to mono f32 samples
fn decode_wav(data: &[u8]) -> Result<DecodedAudio> {
    let reader =
        hound::WavReader::new(Cursor::new(data)).map_err(|e| Error::Playback(e.to_string()))?;
    let spec = reader.spec();
    let channels = usize::from(spec.channels.max(1));

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::Playback(e.to_string()))?,
        hound::SampleFormat::Int => {
            #[allow(clippy::cast_precision_loss)]
            let scale = (1_i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| Error::Playback(e.to_string()))?
        }
    };

    #[allow(clippy::cast_precision_loss)]
    let samples = interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect();

    Ok(DecodedAudio {
        samples,
        sample_rate: spec.sample_rate,
    })
}

/// Decode MP3 bytes to mono f32 samples
fn decode_mp3(mp3_data: &[u8]) -> Result<DecodedAudio> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(mp3_data));
    let mut samples = Vec::new();
    let mut sample_rate = PLAYBACK_SAMPLE_RATE;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                if let Ok(rate) = u32::try_from(frame.sample_rate) {
                    sample_rate = rate;
                }
                if frame.channels == 2 {
                    // Stereo: average channels
                    samples.extend(frame.data.chunks(2).map(|chunk| {
                        let left = f32::from(chunk[0]) / 32768.0;
                        let right = f32::from(chunk.get(1).copied().unwrap_or(chunk[0])) / 32768.0;
                        f32::midpoint(left, right)
                    }));
                } else {
                    samples.extend(frame.data.iter().map(|&s| f32::from(s) / 32768.0));
                }
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(Error::Playback(format!("MP3 decode error: {e}"))),
        }
    }

    if samples.is_empty() {
        return Err(Error::Playback("audio payload contained no frames".to_string()));
    }

    Ok(DecodedAudio {
        samples,
        sample_rate,
    })
}

/// Resample mono audio to a new sample rate
///
/// The final partial chunk is zero-padded and the resampler's delay trimmed,
/// so the output covers the whole input.
///
/// # Errors
///
/// Returns [`Error::Playback`] if the resampler rejects the rates
fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    use rubato::{FftFixedIn, Resampler};

    if from_rate == to_rate || from_rate == 0 || to_rate == 0 || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let chunk_size = 1024;
    let sub_chunks = 2;
    let mut resampler =
        FftFixedIn::<f64>::new(from_rate as usize, to_rate as usize, chunk_size, sub_chunks, 1)
            .map_err(|e| Error::Playback(format!("failed to create resampler: {e}")))?;

    #[allow(clippy::cast_possible_truncation)]
    let expected = (samples.len() as u64 * u64::from(to_rate)).div_ceil(u64::from(from_rate))
        as usize;
    let delay = resampler.output_delay();

    let input: Vec<f64> = samples.iter().map(|&s| f64::from(s)).collect();
    let mut output = Vec::with_capacity(expected + delay + chunk_size * 2);
    let mut offset = 0;

    while output.len() < expected + delay {
        let needed = resampler.input_frames_next();
        let mut chunk = vec![0.0; needed];
        if offset < input.len() {
            let end = (offset + needed).min(input.len());
            chunk[..end - offset].copy_from_slice(&input[offset..end]);
        }
        offset += needed;

        let result = resampler
            .process(&[chunk], None)
            .map_err(|e| Error::Playback(format!("resampling failed: {e}")))?;
        output.extend_from_slice(&result[0]);
    }

    #[allow(clippy::cast_possible_truncation)]
    Ok(output[delay..delay + expected]
        .iter()
        .map(|&s| s as f32)
        .collect())
}
