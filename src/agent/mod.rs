//! Inference orchestration
//!
//! Turns a user utterance plus the channel's history into a model reply.

mod prompt;
mod runner;

pub use prompt::PromptBuilder;
pub use runner::InferenceOrchestrator;
