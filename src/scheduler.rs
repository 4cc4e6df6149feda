//! Change-notification handling.
//!
//! The scheduler is the only writer of the [`JobQueue`](crate::queue::JobQueue)
//! besides the run loop. A file create/modify becomes an [`ingest`],
//! a delete becomes a [`remove`], and after every change the scheduler
//! pushes a fresh [`QueueSnapshot`] into the kernel.
//!
//! [`ingest`]: Scheduler::ingest
//! [`remove`]: Scheduler::remove

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;

use crate::blocks::parse_source;
use crate::connector_fs::SourceFile;
use crate::kernel::{Kernel, KernelEvent, QueueSnapshot};
use crate::queue::{self, SharedQueue};
use crate::store::EntityStore;

/// A change reported by the host file watcher.
#[derive(Debug, Clone)]
pub enum ChangeEvent {
    Upsert(SourceFile),
    Delete(String),
    Rename { from: String, file: SourceFile },
}

/// What one ingest did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub entities: usize,
    pub enqueued: usize,
    pub removed: usize,
}

impl IngestReport {
    fn absorb(&mut self, other: IngestReport) {
        self.entities += other.entities;
        self.enqueued += other.enqueued;
        self.removed += other.removed;
    }
}

pub struct Scheduler {
    queue: SharedQueue,
    store: Arc<dyn EntityStore>,
    kernel: Arc<Kernel>,
    min_embed_chars: usize,
}

impl Scheduler {
    pub fn new(
        queue: SharedQueue,
        store: Arc<dyn EntityStore>,
        kernel: Arc<Kernel>,
        min_embed_chars: usize,
    ) -> Self {
        Self {
            queue,
            store,
            kernel,
            min_embed_chars,
        }
    }

    pub fn queue(&self) -> &SharedQueue {
        &self.queue
    }

    pub async fn handle(&self, event: ChangeEvent) -> Result<IngestReport> {
        match event {
            ChangeEvent::Upsert(file) => self.ingest(&file).await,
            ChangeEvent::Delete(path) => {
                let removed = self.remove(&path).await?;
                Ok(IngestReport {
                    removed,
                    ..Default::default()
                })
            }
            ChangeEvent::Rename { from, file } => self.rename(&from, &file).await,
        }
    }

    /// Parse, store and enqueue one source file, then publish a snapshot.
    pub async fn ingest(&self, file: &SourceFile) -> Result<IngestReport> {
        let report = self.ingest_quiet(file).await?;
        self.publish_snapshot().await?;
        Ok(report)
    }

    /// Ingest many files with a single snapshot at the end.
    pub async fn ingest_all(&self, files: &[SourceFile]) -> Result<IngestReport> {
        let mut total = IngestReport::default();
        for file in files {
            total.absorb(self.ingest_quiet(file).await?);
        }
        self.publish_snapshot().await?;
        Ok(total)
    }

    async fn ingest_quiet(&self, file: &SourceFile) -> Result<IngestReport> {
        let parsed = parse_source(&file.rel_path, &file.body, file.modified_at);
        let entities = parsed.into_entities();
        let fresh: HashSet<&str> = entities.iter().map(|e| e.key.as_str()).collect();

        let mut report = IngestReport {
            entities: entities.len(),
            ..Default::default()
        };

        let vanished: Vec<String> = self
            .store
            .keys_for_source(&file.rel_path)
            .await?
            .into_iter()
            .filter(|key| !fresh.contains(key.as_str()))
            .collect();
        for key in &vanished {
            self.store.delete(key).await?;
        }
        report.removed = vanished.len();

        let mut jobs = Vec::new();
        let mut settled = Vec::new();
        for entity in entities {
            let key = entity.key.clone();
            self.store.upsert(entity).await?;
            let Some(stored) = self.store.get(&key).await? else {
                continue;
            };
            if stored.needs_embedding() && stored.is_embeddable(self.min_embed_chars) {
                jobs.push(stored.embed_job());
            } else {
                settled.push(key);
            }
        }

        {
            let mut q = queue::lock(&self.queue);
            for key in vanished.iter().chain(settled.iter()) {
                q.remove(key);
            }
            for job in jobs {
                q.enqueue(job);
                report.enqueued += 1;
            }
        }

        tracing::debug!(
            path = %file.rel_path,
            entities = report.entities,
            enqueued = report.enqueued,
            removed = report.removed,
            "ingested source"
        );
        Ok(report)
    }

    /// Drop a source, its blocks and their queued jobs.
    pub async fn remove(&self, source_path: &str) -> Result<usize> {
        let dequeued = queue::lock(&self.queue).remove_by_source_path(source_path);
        let mut removed = self.store.delete_source_blocks(source_path).await?;
        if self.store.delete(source_path).await? {
            removed += 1;
        }
        tracing::debug!(path = source_path, removed, dequeued, "removed source");
        self.publish_snapshot().await?;
        Ok(removed)
    }

    pub async fn rename(&self, from: &str, file: &SourceFile) -> Result<IngestReport> {
        let removed = self.remove(from).await?;
        let mut report = self.ingest(file).await?;
        report.removed += removed;
        Ok(report)
    }

    pub async fn snapshot(&self) -> Result<QueueSnapshot> {
        let stale = self.store.stale_counts(self.min_embed_chars).await?;
        let q = queue::lock(&self.queue);
        Ok(QueueSnapshot {
            pending_jobs: q.len(),
            stale_total: stale.total,
            stale_embeddable_total: stale.embeddable,
            queued_total: q.inserted_total(),
        })
    }

    /// Push the current queue projection into the kernel.
    pub async fn publish_snapshot(&self) -> Result<QueueSnapshot> {
        let queue = self.snapshot().await?;
        self.kernel
            .dispatch(KernelEvent::QueueSnapshotUpdated { queue });
        Ok(queue)
    }
}
