//! Read-only views derived from [`KernelState`].

use super::state::{KernelState, Phase};

/// A model is loaded and nothing is broken.
pub fn is_embed_ready(state: &KernelState) -> bool {
    state.model.is_some() && state.phase != Phase::Error
}

pub fn is_kernel_busy(state: &KernelState) -> bool {
    state.phase == Phase::Running
}

/// Phase name as older status displays expect it.
pub fn legacy_status(state: &KernelState) -> &'static str {
    match state.phase {
        Phase::Booting => "initializing",
        Phase::Idle => "idle",
        Phase::LoadingModel => "loading_model",
        Phase::Running => "embedding",
        Phase::Stopping => "stopping",
        Phase::Paused => "paused",
        Phase::Error => "error",
    }
}

/// Fraction of the live run completed, if a run is live.
pub fn run_progress(state: &KernelState) -> Option<f64> {
    let run = state.run.as_ref()?;
    if run.total == 0 {
        return Some(1.0);
    }
    Some((run.current as f64 / run.total as f64).min(1.0))
}

/// Work is waiting in the queue.
pub fn has_backlog(state: &KernelState) -> bool {
    state.queue.pending_jobs > 0
}
