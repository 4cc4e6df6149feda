//! Events accepted by the kernel reducer.
//!
//! Event names serialize in `SCREAMING_SNAKE_CASE` (`{"type":"RUN_STARTED",...}`)
//! and are part of the contract with status displays.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::{KernelError, ModelRef, Phase, QueueSnapshot, RunInfo};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KernelEvent {
    InitCoreReady,
    InitCoreFailed {
        error: KernelError,
    },
    ModelSwitchRequested,
    ModelSwitchSucceeded {
        model: ModelRef,
    },
    ModelSwitchFailed {
        error: KernelError,
        reason: String,
    },
    QueueSnapshotUpdated {
        queue: QueueSnapshot,
    },
    RunRequested,
    RunStarted {
        run: RunInfo,
    },
    RunProgress {
        current: usize,
        total: usize,
        current_entity_key: Option<String>,
        current_source_path: Option<String>,
    },
    RunFinished,
    RunFailed {
        error: KernelError,
    },
    StopRequested,
    StopCompleted,
    StopTimeout {
        at: DateTime<Utc>,
    },
    ResumeRequested,
    RefreshRequested,
    ReimportRequested,
    ReimportCompleted,
    ReimportFailed {
        error: KernelError,
    },
    SetPhase {
        phase: Phase,
    },
    ResetError,
}

impl KernelEvent {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            KernelEvent::InitCoreReady => "INIT_CORE_READY",
            KernelEvent::InitCoreFailed { .. } => "INIT_CORE_FAILED",
            KernelEvent::ModelSwitchRequested => "MODEL_SWITCH_REQUESTED",
            KernelEvent::ModelSwitchSucceeded { .. } => "MODEL_SWITCH_SUCCEEDED",
            KernelEvent::ModelSwitchFailed { .. } => "MODEL_SWITCH_FAILED",
            KernelEvent::QueueSnapshotUpdated { .. } => "QUEUE_SNAPSHOT_UPDATED",
            KernelEvent::RunRequested => "RUN_REQUESTED",
            KernelEvent::RunStarted { .. } => "RUN_STARTED",
            KernelEvent::RunProgress { .. } => "RUN_PROGRESS",
            KernelEvent::RunFinished => "RUN_FINISHED",
            KernelEvent::RunFailed { .. } => "RUN_FAILED",
            KernelEvent::StopRequested => "STOP_REQUESTED",
            KernelEvent::StopCompleted => "STOP_COMPLETED",
            KernelEvent::StopTimeout { .. } => "STOP_TIMEOUT",
            KernelEvent::ResumeRequested => "RESUME_REQUESTED",
            KernelEvent::RefreshRequested => "REFRESH_REQUESTED",
            KernelEvent::ReimportRequested => "REIMPORT_REQUESTED",
            KernelEvent::ReimportCompleted => "REIMPORT_COMPLETED",
            KernelEvent::ReimportFailed { .. } => "REIMPORT_FAILED",
            KernelEvent::SetPhase { .. } => "SET_PHASE",
            KernelEvent::ResetError => "RESET_ERROR",
        }
    }
}
