//! Voice processing module
//!
//! Handles frame buffering, wake phrase detection, transcription, synthesis
//! and serialized playback.

mod buffer;
mod capture;
mod playback;
mod queue;
mod stt;
mod tts;
mod wake_word;

pub use buffer::{
    AudioFrame, CaptureSettings, CloseReason, FrameBuffer, PushOutcome, Utterance,
    calculate_energy,
};
pub use capture::{FRAME_SAMPLES, MicrophoneSource, SAMPLE_RATE, input_device_available, samples_to_wav};
pub use playback::{AudioSink, DecodedAudio, NullSink, SpeakerSink, decode_audio};
pub use queue::{PlaybackJob, PlaybackQueue};
pub use stt::{Transcriber, WhisperTranscriber};
pub use tts::{SpeechSynthesizer, Synthesizer};
pub use wake_word::{Transcript, WakePhrase, matches, normalize};
