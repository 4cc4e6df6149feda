//! The kernel reducer: `(state, event) -> state`.
//!
//! Pure and deterministic. [`try_reduce`] reports rejected transitions as a
//! [`Rejection`]; [`reduce`] logs them and hands back the prior state
//! untouched. A rejection is a protective no-op, never a failure.

use thiserror::Error;

use super::event::KernelEvent;
use super::state::{ErrorCode, KernelError, KernelState, Phase};

/// Why an event was dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("{event} not accepted in phase {phase}")]
    InvalidPhase { event: &'static str, phase: Phase },
    #[error("SET_PHASE {from} -> {to} is not allowed")]
    DisallowedTransition { from: Phase, to: Phase },
    #[error("{event} ignored: no run is live")]
    NoLiveRun { event: &'static str },
}

/// Phases `SET_PHASE` may move to from `from`.
pub fn allowed_targets(from: Phase) -> &'static [Phase] {
    match from {
        Phase::Booting => &[Phase::Idle, Phase::LoadingModel, Phase::Error],
        Phase::Idle => &[Phase::LoadingModel, Phase::Error],
        Phase::LoadingModel => &[Phase::Idle, Phase::Error],
        Phase::Running => &[Phase::Stopping, Phase::Error],
        Phase::Stopping => &[Phase::Paused, Phase::Error],
        Phase::Paused => &[Phase::Idle, Phase::LoadingModel, Phase::Error],
        Phase::Error => &[Phase::Idle, Phase::Booting, Phase::LoadingModel],
    }
}

/// Apply `event`, logging and ignoring rejected transitions.
pub fn reduce(state: &KernelState, event: &KernelEvent) -> KernelState {
    match try_reduce(state, event) {
        Ok(next) => next,
        Err(rejection) => {
            tracing::warn!(
                event = event.name(),
                phase = %state.phase,
                reason = %rejection,
                "kernel transition rejected"
            );
            state.clone()
        }
    }
}

/// Fold a sequence of events.
pub fn reduce_all<'a>(
    state: &KernelState,
    events: impl IntoIterator<Item = &'a KernelEvent>,
) -> KernelState {
    events
        .into_iter()
        .fold(state.clone(), |acc, event| reduce(&acc, event))
}

pub fn try_reduce(state: &KernelState, event: &KernelEvent) -> Result<KernelState, Rejection> {
    let mut next = state.clone();

    match event {
        KernelEvent::InitCoreReady => {
            if state.phase != Phase::Booting {
                return Err(invalid(event, state));
            }
            next.phase = Phase::Idle;
        }
        KernelEvent::InitCoreFailed { error } => {
            next.phase = Phase::Error;
            next.run = None;
            next.last_error = Some(error.clone());
        }

        KernelEvent::ModelSwitchRequested => {
            if state.phase.has_live_run() {
                return Err(invalid(event, state));
            }
            next.phase = Phase::LoadingModel;
        }
        KernelEvent::ModelSwitchSucceeded { model } => {
            next.model = Some(model.clone());
            if matches!(state.phase, Phase::LoadingModel | Phase::Booting) {
                next.phase = Phase::Idle;
            }
        }
        KernelEvent::ModelSwitchFailed { error, reason } => {
            let mut error = error.clone();
            if error.context.is_none() {
                error.context = Some(serde_json::json!({ "reason": reason }));
            }
            next.phase = Phase::Error;
            next.run = None;
            next.last_error = Some(error);
        }

        KernelEvent::QueueSnapshotUpdated { queue } => {
            next.queue = *queue;
        }

        // Intent events; the orchestration glue acts on them.
        KernelEvent::RunRequested | KernelEvent::RefreshRequested => {}

        KernelEvent::RunStarted { run } => {
            if !matches!(state.phase, Phase::Idle | Phase::Paused | Phase::Booting) {
                return Err(invalid(event, state));
            }
            next.phase = Phase::Running;
            next.run = Some(run.clone());
            next.flags.stop_requested = false;
            next.last_error = None;
        }
        KernelEvent::RunProgress {
            current,
            total,
            current_entity_key,
            current_source_path,
        } => {
            let run = match (state.phase.has_live_run(), next.run.as_mut()) {
                (true, Some(run)) => run,
                _ => return Err(Rejection::NoLiveRun { event: event.name() }),
            };
            run.current = *current;
            run.total = *total;
            run.current_entity_key = current_entity_key.clone();
            run.current_source_path = current_source_path.clone();
        }
        KernelEvent::RunFinished => {
            if !state.phase.has_live_run() {
                return Err(Rejection::NoLiveRun { event: event.name() });
            }
            next.phase = if state.flags.stop_requested {
                Phase::Paused
            } else {
                Phase::Idle
            };
            next.run = None;
            next.flags.stop_requested = false;
        }
        KernelEvent::RunFailed { error } => {
            if !state.phase.has_live_run() {
                return Err(Rejection::NoLiveRun { event: event.name() });
            }
            if state.flags.stop_requested {
                // Graceful stop wins over the failure.
                next.phase = Phase::Paused;
            } else {
                next.phase = Phase::Error;
                next.last_error = Some(error.clone());
            }
            next.run = None;
            next.flags.stop_requested = false;
        }

        KernelEvent::StopRequested => {
            next.flags.stop_requested = true;
            if state.phase == Phase::Running {
                next.phase = Phase::Stopping;
            }
        }
        KernelEvent::StopCompleted => {
            next.phase = Phase::Paused;
            next.run = None;
            next.flags.stop_requested = false;
        }
        KernelEvent::StopTimeout { at } => {
            next.phase = Phase::Error;
            next.run = None;
            next.flags.stop_requested = false;
            next.last_error = Some(KernelError {
                code: ErrorCode::StopTimeout,
                message: "embedding run did not stop within the timeout".to_string(),
                context: state
                    .run
                    .as_ref()
                    .map(|run| serde_json::json!({ "runId": run.id, "current": run.current })),
                at: *at,
            });
        }
        KernelEvent::ResumeRequested => {
            if state.phase != Phase::Paused {
                return Err(invalid(event, state));
            }
            next.phase = Phase::Idle;
        }

        KernelEvent::ReimportRequested => {
            next.reimport_in_progress = true;
        }
        KernelEvent::ReimportCompleted => {
            next.reimport_in_progress = false;
        }
        KernelEvent::ReimportFailed { error } => {
            next.reimport_in_progress = false;
            next.last_error = Some(error.clone());
        }

        KernelEvent::SetPhase { phase } => {
            let target = *phase;
            if target == state.phase {
                return Ok(next);
            }
            if !allowed_targets(state.phase).contains(&target) {
                return Err(Rejection::DisallowedTransition {
                    from: state.phase,
                    to: target,
                });
            }
            next.phase = target;
            if !target.has_live_run() {
                next.run = None;
            }
        }
        KernelEvent::ResetError => {
            next.last_error = None;
            if state.phase == Phase::Error {
                next.phase = Phase::Idle;
            }
        }
    }

    Ok(next)
}

fn invalid(event: &KernelEvent, state: &KernelState) -> Rejection {
    Rejection::InvalidPhase {
        event: event.name(),
        phase: state.phase,
    }
}
