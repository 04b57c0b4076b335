//! Voice and text pipeline

mod coordinator;
mod state;

pub use coordinator::{
    PLAYBACK_STOPPED, PipelineCoordinator, PipelineServices, WAKE_ACK, is_stop_command,
};
pub use state::{PipelineState, Reply, TurnOutcome};
