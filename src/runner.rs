//! The embedding run loop.
//!
//! [`EmbedRunner::run`] drains the [`JobQueue`](crate::queue::JobQueue) in
//! batches through an [`EmbeddingProvider`], reporting every step to the
//! [`Kernel`] as events. It never touches kernel state directly.
//!
//! ```text
//!   RUN_STARTED
//!     └─ loop: stop requested? ─yes─▶ exit
//!              drain batch ─empty─▶ exit
//!              skip vanished / up-to-date entities
//!              embed_with_retry ─fatal─▶ re-enqueue, RUN_FAILED
//!                  └─ transient, retries exhausted ─▶ re-enqueue, defer
//!              RUN_PROGRESS + QUEUE_SNAPSHOT_UPDATED
//!   RUN_FINISHED
//! ```
//!
//! Stopping is cooperative: [`request_stop`] raises the flag and waits for
//! the loop to leave the live phases, escalating to `STOP_TIMEOUT` when it
//! does not within the window.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::embedding::error::{DeferralCounter, ProviderError, RetryPolicy};
use crate::embedding::EmbeddingProvider;
use crate::kernel::selectors::is_embed_ready;
use crate::kernel::{ErrorCode, Kernel, KernelError, KernelEvent, ModelRef, Phase, RunInfo};
use crate::models::EmbedJob;
use crate::queue;
use crate::scheduler::Scheduler;
use crate::store::{EntityStore, StoredEmbedding};

/// Why a run did not complete.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("embedding is not ready (phase {phase})")]
    NotReady { phase: Phase },
    #[error("cannot switch model while a run is live")]
    Busy,
    #[error(transparent)]
    Provider(ProviderError),
    #[error("gave up after {deferrals} consecutive deferred batches: {last}")]
    RetriesExhausted { deferrals: u32, last: ProviderError },
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl RunError {
    /// The error as surfaced through `last_error`.
    pub fn to_kernel_error(&self) -> KernelError {
        match self {
            RunError::Provider(e) => KernelError::new(ErrorCode::RunFailed, e.to_string())
                .with_context(serde_json::json!({ "status": e.status() })),
            RunError::RetriesExhausted { deferrals, last } => {
                KernelError::new(ErrorCode::ProviderRetriesExhausted, self.to_string())
                    .with_context(serde_json::json!({
                        "deferrals": deferrals,
                        "status": last.status(),
                    }))
            }
            other => KernelError::new(ErrorCode::RunFailed, other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub batch_size: usize,
    pub max_deferrals: u32,
    pub retry: RetryPolicy,
}

impl RunOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            batch_size: config.embedding.batch_size,
            max_deferrals: config.run.max_deferrals,
            retry: config.run.retry_policy(&config.embedding),
        }
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            batch_size: 32,
            max_deferrals: DeferralCounter::DEFAULT_MAX,
            retry: RetryPolicy::default(),
        }
    }
}

/// Counters for one finished run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub run_id: String,
    pub embedded: usize,
    pub skipped: usize,
    pub deferred: usize,
    pub batches: usize,
    /// The loop exited on a stop request rather than an empty queue.
    pub stopped: bool,
}

/// How a [`request_stop`] call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// No run was live; only the flag was raised.
    NoRun,
    Completed,
    TimedOut,
}

/// Report the result of core initialization to the kernel.
pub fn boot(kernel: &Kernel, init: anyhow::Result<()>) -> anyhow::Result<()> {
    match &init {
        Ok(()) => {
            kernel.dispatch(KernelEvent::InitCoreReady);
        }
        Err(e) => {
            kernel.dispatch(KernelEvent::InitCoreFailed {
                error: KernelError::new(ErrorCode::InitFailed, format!("{e:#}")),
            });
        }
    }
    init
}

/// Load `provider`'s model and record the outcome in the kernel.
pub async fn switch_model(
    kernel: &Kernel,
    provider: &dyn EmbeddingProvider,
) -> Result<ModelRef, RunError> {
    let state = kernel.dispatch(KernelEvent::ModelSwitchRequested);
    if state.phase != Phase::LoadingModel {
        return Err(RunError::Busy);
    }

    match provider.load().await {
        Ok(model) => {
            info!(model = %model.id, adapter = %model.adapter, dims = model.dims, "model loaded");
            kernel.dispatch(KernelEvent::ModelSwitchSucceeded {
                model: model.clone(),
            });
            Ok(model)
        }
        Err(e) => {
            warn!(adapter = provider.adapter(), err = %e, "model load failed");
            kernel.dispatch(KernelEvent::ModelSwitchFailed {
                error: KernelError::new(ErrorCode::ModelSwitchFailed, e.message()),
                reason: e.to_string(),
            });
            Err(RunError::Provider(e))
        }
    }
}

/// Ask the live run to stop and wait up to `timeout` for it to do so.
pub async fn request_stop(kernel: &Kernel, timeout: Duration) -> StopOutcome {
    let before = kernel.phase();
    kernel.dispatch(KernelEvent::StopRequested);
    if !before.has_live_run() {
        return StopOutcome::NoRun;
    }

    let mut rx = kernel.subscribe();
    let left = tokio::time::timeout(timeout, async move {
        rx.wait_for(|s| !s.phase.has_live_run()).await.is_ok()
    })
    .await;

    match left {
        Ok(_) => {
            if kernel.phase() != Phase::Error {
                kernel.dispatch(KernelEvent::StopCompleted);
            }
            info!("embedding run stopped");
            StopOutcome::Completed
        }
        Err(_) => {
            warn!(timeout_ms = timeout.as_millis() as u64, "embedding run did not stop in time");
            kernel.dispatch(KernelEvent::StopTimeout { at: Utc::now() });
            StopOutcome::TimedOut
        }
    }
}

/// Drives embedding runs for one provider.
pub struct EmbedRunner {
    kernel: Arc<Kernel>,
    scheduler: Arc<Scheduler>,
    store: Arc<dyn EntityStore>,
    provider: Arc<dyn EmbeddingProvider>,
    options: RunOptions,
}

impl EmbedRunner {
    pub fn new(
        kernel: Arc<Kernel>,
        scheduler: Arc<Scheduler>,
        store: Arc<dyn EntityStore>,
        provider: Arc<dyn EmbeddingProvider>,
        options: RunOptions,
    ) -> Self {
        Self {
            kernel,
            scheduler,
            store,
            provider,
            options,
        }
    }

    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    pub async fn request_stop(&self, timeout: Duration) -> StopOutcome {
        request_stop(&self.kernel, timeout).await
    }

    /// Run until the queue is empty, a stop is requested, or a failure
    /// aborts the run.
    pub async fn run(&self) -> Result<RunSummary, RunError> {
        let state = self.kernel.state();
        if !is_embed_ready(&state) {
            return Err(RunError::NotReady { phase: state.phase });
        }

        let total = queue::lock(self.scheduler.queue()).len();
        let run = RunInfo::new(total);
        let run_id = run.id.clone();
        let started = self.kernel.dispatch(KernelEvent::RunStarted { run });
        if started.run.as_ref().map(|r| r.id.as_str()) != Some(run_id.as_str()) {
            return Err(RunError::NotReady {
                phase: started.phase,
            });
        }
        info!(run_id = %run_id, total, "embedding run started");

        match self.drain(&run_id, total).await {
            Ok(summary) => {
                info!(
                    run_id = %run_id,
                    embedded = summary.embedded,
                    skipped = summary.skipped,
                    deferred = summary.deferred,
                    stopped = summary.stopped,
                    "embedding run finished"
                );
                self.kernel.dispatch(KernelEvent::RunFinished);
                Ok(summary)
            }
            Err(e) => {
                warn!(run_id = %run_id, err = %e, "embedding run failed");
                self.kernel.dispatch(KernelEvent::RunFailed {
                    error: e.to_kernel_error(),
                });
                Err(e)
            }
        }
    }

    async fn drain(&self, run_id: &str, mut total: usize) -> Result<RunSummary, RunError> {
        let mut summary = RunSummary {
            run_id: run_id.to_string(),
            ..Default::default()
        };
        let mut deferrals = DeferralCounter::new(self.options.max_deferrals);
        let mut current = 0usize;

        loop {
            let state = self.kernel.state();
            if state.flags.stop_requested || !state.phase.has_live_run() {
                summary.stopped = true;
                break;
            }

            let batch = queue::lock(self.scheduler.queue()).drain_batch(self.options.batch_size);
            if batch.is_empty() {
                break;
            }
            summary.batches += 1;

            let mut settled = HashSet::new();
            if let Err(e) = self
                .process_batch(&batch, &mut settled, &mut summary, &mut deferrals)
                .await
            {
                let restored = self.requeue(&batch, &settled);
                if let Err(snap) = self.scheduler.publish_snapshot().await {
                    warn!(run_id, err = %snap, "queue snapshot failed");
                }
                debug!(run_id, restored, "unfinished jobs returned to the queue");
                return Err(e);
            }

            current += batch.len();
            let pending = queue::lock(self.scheduler.queue()).len();
            total = total.max(current + pending);
            let last = batch.last();
            self.kernel.dispatch(KernelEvent::RunProgress {
                current,
                total,
                current_entity_key: last.map(|j| j.entity_key.clone()),
                current_source_path: last.map(|j| j.source_path.clone()),
            });
            self.scheduler.publish_snapshot().await?;
        }

        Ok(summary)
    }

    /// Embed and save one batch. Keys that are done with (saved, vanished
    /// or already current) are added to `settled`.
    async fn process_batch(
        &self,
        batch: &[EmbedJob],
        settled: &mut HashSet<String>,
        summary: &mut RunSummary,
        deferrals: &mut DeferralCounter,
    ) -> Result<(), RunError> {
        let mut work = Vec::with_capacity(batch.len());
        for job in batch {
            match self.store.get(&job.entity_key).await? {
                Some(entity) if entity.needs_embedding() => work.push(entity),
                _ => {
                    summary.skipped += 1;
                    settled.insert(job.entity_key.clone());
                }
            }
        }
        if work.is_empty() {
            return Ok(());
        }

        let inputs: Vec<String> = work.iter().map(|e| e.content.clone()).collect();
        match self.embed_with_retry(&inputs).await {
            Ok(vectors) => {
                for (entity, vector) in work.iter().zip(vectors) {
                    let saved = self
                        .store
                        .save_embedding(
                            &entity.key,
                            StoredEmbedding {
                                vector,
                                model: self.provider.model_name().to_string(),
                                content_hash: entity.content_hash.clone(),
                            },
                        )
                        .await?;
                    settled.insert(entity.key.clone());
                    if saved {
                        summary.embedded += 1;
                    } else {
                        summary.skipped += 1;
                    }
                }
                deferrals.reset();
                Ok(())
            }
            Err(e) if e.is_transient() => {
                let deferred = self.requeue(batch, settled);
                summary.deferred += deferred;
                if !deferrals.defer() {
                    return Err(RunError::RetriesExhausted {
                        deferrals: deferrals.count(),
                        last: e,
                    });
                }
                warn!(
                    deferred,
                    consecutive = deferrals.count(),
                    max = deferrals.max(),
                    "batch deferred after transient failures"
                );
                Ok(())
            }
            Err(e) => Err(RunError::Provider(e)),
        }
    }

    /// Return the unsettled jobs of `batch` to the queue. A newer job for
    /// the same key wins.
    fn requeue(&self, batch: &[EmbedJob], settled: &HashSet<String>) -> usize {
        let mut q = queue::lock(self.scheduler.queue());
        let mut restored = 0;
        for job in batch {
            if !settled.contains(&job.entity_key) && !q.has(&job.entity_key) {
                q.enqueue(job.clone());
                restored += 1;
            }
        }
        restored
    }

    /// Embed one batch, retrying transient failures with backoff.
    ///
    /// Each attempt is bounded by the request timeout. Fatal errors return
    /// immediately. A stop request cuts the backoff short and returns the
    /// last transient error.
    pub async fn embed_with_retry(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let policy = &self.options.retry;
        let mut attempt = 0u32;

        loop {
            let result =
                match tokio::time::timeout(policy.request_timeout, self.provider.embed_batch(inputs))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ProviderError::timeout(format!(
                        "embedding request exceeded {}ms",
                        policy.request_timeout.as_millis()
                    ))),
                };

            let err = match result {
                Ok(vectors) if vectors.len() == inputs.len() => {
                    if attempt > 0 {
                        info!(attempt, batch_size = inputs.len(), "batch embed succeeded after retry");
                    }
                    return Ok(vectors);
                }
                Ok(vectors) => {
                    return Err(ProviderError::malformed(format!(
                        "expected {} embeddings, got {}",
                        inputs.len(),
                        vectors.len()
                    )))
                }
                Err(e) => e,
            };

            if !err.is_transient() {
                return Err(err);
            }
            if attempt >= policy.max_retries {
                warn!(
                    attempt = attempt + 1,
                    max_retries = policy.max_retries,
                    err = %err,
                    "all retries exhausted"
                );
                return Err(err);
            }

            let backoff = policy.backoff_for_attempt(attempt, err.retry_after());
            warn!(
                attempt = attempt + 1,
                max_retries = policy.max_retries,
                backoff_ms = backoff.as_millis() as u64,
                err = %err,
                "retryable batch error, will retry"
            );

            let mut rx = self.kernel.subscribe();
            let stop = async move {
                let _ = rx.wait_for(|s| s.flags.stop_requested).await;
            };
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = stop => {
                    debug!("stop requested during backoff");
                    return Err(err);
                }
            }
            attempt += 1;
        }
    }
}
