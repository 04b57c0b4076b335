//! Vox Relay - wake-word voice and text relay to a local language model
//!
//! This library provides the core functionality for the relay:
//! - Utterance capture and wake phrase detection
//! - Speech-to-text and text-to-speech service clients
//! - Per-channel conversation memory and trigger cooldowns
//! - The pipeline coordinator sequencing a turn end to end
//! - Discord and console text channels
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    Interfaces                       │
//! │        Microphone / Speaker  │  Discord  │ Console  │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │               Pipeline Coordinator                  │
//! │  Frame Buffer │ Wake Phrase │ Cooldown │ Playback   │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                Local Services                       │
//! │   Ollama  │  Whisper (STT)  │  Kokoro (TTS)         │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod agent;
pub mod channels;
pub mod commands;
pub mod config;
pub mod cooldown;
pub mod daemon;
pub mod error;
pub mod llm;
pub mod memory;
pub mod pipeline;
pub mod preflight;
pub mod session;
pub mod voice;

pub use config::Config;
pub use daemon::{CommandRouter, Daemon};
pub use error::{Error, FailureKind, Result};
pub use pipeline::{PipelineCoordinator, PipelineServices, PipelineState, TurnOutcome};
