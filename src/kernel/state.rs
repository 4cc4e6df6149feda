//! Kernel state value types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Named state of the embedding-run lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Booting,
    Idle,
    LoadingModel,
    Running,
    Stopping,
    Paused,
    Error,
}

impl Phase {
    pub const ALL: [Phase; 7] = [
        Phase::Booting,
        Phase::Idle,
        Phase::LoadingModel,
        Phase::Running,
        Phase::Stopping,
        Phase::Paused,
        Phase::Error,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Booting => "booting",
            Phase::Idle => "idle",
            Phase::LoadingModel => "loading_model",
            Phase::Running => "running",
            Phase::Stopping => "stopping",
            Phase::Paused => "paused",
            Phase::Error => "error",
        }
    }

    /// A run is live (and `run` is populated) only in these phases.
    pub fn has_live_run(self) -> bool {
        matches!(self, Phase::Running | Phase::Stopping)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The loaded embedding model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRef {
    pub id: String,
    pub adapter: String,
    pub dims: usize,
}

/// Bookkeeping for the live embedding run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunInfo {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub current: usize,
    pub total: usize,
    pub current_entity_key: Option<String>,
    pub current_source_path: Option<String>,
}

impl RunInfo {
    pub fn new(total: usize) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            current: 0,
            total,
            current_entity_key: None,
            current_source_path: None,
        }
    }
}

/// Read-only projection of the job queue, pushed in by the scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    pub pending_jobs: usize,
    pub stale_total: usize,
    pub stale_embeddable_total: usize,
    pub queued_total: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelFlags {
    pub stop_requested: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InitFailed,
    ModelSwitchFailed,
    RunFailed,
    StopTimeout,
    ReimportFailed,
    ProviderRetriesExhausted,
}

/// Structured failure surfaced through `last_error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
    pub at: DateTime<Utc>,
}

impl KernelError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: None,
            at: Utc::now(),
        }
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }
}

/// Single source of truth for the embedding subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelState {
    pub phase: Phase,
    pub model: Option<ModelRef>,
    pub run: Option<RunInfo>,
    pub queue: QueueSnapshot,
    pub flags: KernelFlags,
    pub last_error: Option<KernelError>,
    pub reimport_in_progress: bool,
}

impl KernelState {
    /// The state every process starts in.
    pub fn booting() -> Self {
        Self {
            phase: Phase::Booting,
            model: None,
            run: None,
            queue: QueueSnapshot::default(),
            flags: KernelFlags::default(),
            last_error: None,
            reimport_in_progress: false,
        }
    }
}

impl Default for KernelState {
    fn default() -> Self {
        Self::booting()
    }
}
