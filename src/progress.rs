//! Embedding run progress reporting.
//!
//! Renders kernel state changes during `corpus index` so users see which
//! phase the embedder is in and how much of the backlog is left.
//! Progress is emitted on **stderr** so stdout remains parseable for scripts.

use std::io::Write;
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::kernel::selectors::legacy_status;
use crate::kernel::{Kernel, KernelState, Phase};

/// Reports kernel state. Implementations write to stderr (human or JSON).
pub trait ProgressReporter: Send + Sync {
    fn report(&self, state: &KernelState);
}

/// Human-friendly progress on stderr: "index  embedding  1,234 / 5,000 entities".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, state: &KernelState) {
        let line = match (&state.run, &state.last_error) {
            (Some(run), _) => {
                let mut line = format!(
                    "index  {}  {} / {} entities",
                    legacy_status(state),
                    format_number(run.current as u64),
                    format_number(run.total as u64)
                );
                if let Some(path) = &run.current_source_path {
                    line.push_str(&format!("  ({})", path));
                }
                line
            }
            (None, Some(err)) if state.phase == Phase::Error => {
                format!("index  error  {:?}: {}", err.code, err.message)
            }
            (None, _) => format!(
                "index  {}  {} pending",
                legacy_status(state),
                format_number(state.queue.pending_jobs as u64)
            ),
        };
        let _ = writeln!(std::io::stderr().lock(), "{}", line);
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, state: &KernelState) {
        let obj = serde_json::json!({
            "event": "progress",
            "phase": state.phase,
            "current": state.run.as_ref().map(|r| r.current),
            "total": state.run.as_ref().map(|r| r.total),
            "pending": state.queue.pending_jobs,
            "error": state.last_error.as_ref().map(|e| &e.message),
        });
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _state: &KernelState) {}
}

/// What a reporter needs to redraw. Snapshot-only changes that leave this
/// untouched are not reported.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Visible {
    phase: Phase,
    current: Option<usize>,
    total: Option<usize>,
    has_error: bool,
}

impl Visible {
    fn of(state: &KernelState) -> Self {
        Self {
            phase: state.phase,
            current: state.run.as_ref().map(|r| r.current),
            total: state.run.as_ref().map(|r| r.total),
            has_error: state.last_error.is_some(),
        }
    }
}

/// Report every visible kernel change until the task is aborted.
pub fn spawn_watcher(kernel: &Kernel, reporter: Arc<dyn ProgressReporter>) -> JoinHandle<()> {
    let mut rx = kernel.subscribe();
    tokio::spawn(async move {
        let mut last: Option<Visible> = None;
        while rx.changed().await.is_ok() {
            let state = rx.borrow_and_update().clone();
            let visible = Visible::of(&state);
            if last.as_ref() != Some(&visible) {
                reporter.report(&state);
                last = Some(visible);
            }
        }
    })
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Arc<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Arc::new(NoProgress),
            ProgressMode::Human => Arc::new(StderrProgress),
            ProgressMode::Json => Arc::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{KernelEvent, QueueSnapshot};
    use std::sync::Mutex;
    use std::time::Duration;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    struct Recorder(Mutex<Vec<Phase>>);

    impl ProgressReporter for Recorder {
        fn report(&self, state: &KernelState) {
            self.0.lock().unwrap().push(state.phase);
        }
    }

    #[tokio::test]
    async fn watcher_skips_invisible_changes() {
        let kernel = Kernel::new();
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let handle = spawn_watcher(&kernel, recorder.clone());

        kernel.dispatch(KernelEvent::InitCoreReady);
        tokio::time::sleep(Duration::from_millis(20)).await;
        kernel.dispatch(KernelEvent::QueueSnapshotUpdated {
            queue: QueueSnapshot {
                stale_total: 3,
                ..Default::default()
            },
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.abort();

        assert_eq!(*recorder.0.lock().unwrap(), vec![Phase::Idle]);
    }
}
