//! Embedding lifecycle state machine.
//!
//! ```text
//!  booting ─INIT_CORE_READY─▶ idle ◀───────── RESUME_REQUESTED ───────── paused
//!                             │  ▲                                          ▲
//!                 RUN_STARTED │  │ RUN_FINISHED                STOP_COMPLETED │
//!                             ▼  │                                          │
//!                            running ──STOP_REQUESTED──▶ stopping ──────────┘
//!                             │                            │
//!                  RUN_FAILED └─────────▶ error ◀──────────┘ STOP_TIMEOUT
//! ```
//!
//! The [`reducer`] is the only code that produces new state. [`Kernel`]
//! owns the current value, swaps it wholesale after each event and
//! broadcasts it to observers over a `tokio::sync::watch` channel.

pub mod event;
pub mod reducer;
pub mod selectors;
pub mod state;

use std::sync::Arc;

use tokio::sync::watch;

pub use event::KernelEvent;
pub use reducer::{reduce, reduce_all, try_reduce, Rejection};
pub use state::{
    ErrorCode, KernelError, KernelFlags, KernelState, ModelRef, Phase, QueueSnapshot, RunInfo,
};

/// Process-wide holder of [`KernelState`].
pub struct Kernel {
    tx: watch::Sender<Arc<KernelState>>,
}

impl Kernel {
    /// A kernel in the `booting` phase.
    pub fn new() -> Self {
        Self::with_state(KernelState::booting())
    }

    pub fn with_state(state: KernelState) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(state));
        Self { tx }
    }

    /// Apply an event and return the resulting state. Subscribers are only
    /// woken when the state actually changed.
    pub fn dispatch(&self, event: KernelEvent) -> Arc<KernelState> {
        tracing::debug!(event = event.name(), "kernel dispatch");
        self.tx.send_if_modified(|current| {
            let next = reduce(current, &event);
            if next == **current {
                false
            } else {
                *current = Arc::new(next);
                true
            }
        });
        self.state()
    }

    pub fn state(&self) -> Arc<KernelState> {
        self.tx.borrow().clone()
    }

    pub fn phase(&self) -> Phase {
        self.tx.borrow().phase
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<KernelState>> {
        self.tx.subscribe()
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_swaps_state() {
        let kernel = Kernel::new();
        let before = kernel.state();
        let after = kernel.dispatch(KernelEvent::InitCoreReady);
        assert_eq!(before.phase, Phase::Booting);
        assert_eq!(after.phase, Phase::Idle);
        assert_eq!(kernel.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn subscribers_see_changes_only() {
        let kernel = Kernel::new();
        let mut rx = kernel.subscribe();
        rx.borrow_and_update();

        kernel.dispatch(KernelEvent::ResumeRequested);
        assert!(!rx.has_changed().unwrap());

        kernel.dispatch(KernelEvent::InitCoreReady);
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().phase, Phase::Idle);
    }
}
