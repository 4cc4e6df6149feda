//! Ordered, deduplicating queue of pending embedding jobs.
//!
//! Bursts of change notifications collapse into one entry per entity key.
//! A repeated key replaces the stored payload (latest write wins) but keeps
//! the position of the first insertion, so a file edited a hundred times
//! still waits its original turn.
//!
//! # Layout
//!
//! ```text
//!  index: key ──▶ slot
//!  slots: [ Node{job, prev, next} | free | Node | ... ]
//!  head ─▶ oldest ◀─▶ ... ◀─▶ newest ◀─ tail
//! ```
//!
//! Ordering lives in the intrusive linked list threaded through `slots`;
//! payloads are replaced in place so a dedup never touches the links.
//!
//! Callbacks fire on edges only: `on_queue_has_items` on 0→1,
//! `on_queue_empty` on 1→0 (dequeue, remove, remove-by-source, clear).

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::models::EmbedJob;

/// Edge-triggered queue notification.
pub type QueueCallback = Box<dyn FnMut() + Send>;

/// Queue shared between the scheduler and the run loop.
///
/// Critical sections are short and never span an `.await`.
pub type SharedQueue = Arc<Mutex<JobQueue>>;

/// Lock a [`SharedQueue`], recovering the guard from a poisoned lock.
pub fn lock(queue: &SharedQueue) -> MutexGuard<'_, JobQueue> {
    queue.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Construction options for [`JobQueue`].
#[derive(Default)]
pub struct QueueOptions {
    pub on_queue_has_items: Option<QueueCallback>,
    pub on_queue_empty: Option<QueueCallback>,
}

impl QueueOptions {
    pub fn on_has_items(mut self, f: impl FnMut() + Send + 'static) -> Self {
        self.on_queue_has_items = Some(Box::new(f));
        self
    }

    pub fn on_empty(mut self, f: impl FnMut() + Send + 'static) -> Self {
        self.on_queue_empty = Some(Box::new(f));
        self
    }
}

/// Result of [`JobQueue::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Key was absent; the job was appended at the tail.
    Inserted,
    /// Key was present; payload replaced, position kept.
    Replaced,
}

struct Node {
    job: EmbedJob,
    prev: Option<usize>,
    next: Option<usize>,
}

pub struct JobQueue {
    index: HashMap<String, usize>,
    slots: Vec<Option<Node>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    inserted_total: u64,
    on_queue_has_items: Option<QueueCallback>,
    on_queue_empty: Option<QueueCallback>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::with_options(QueueOptions::default())
    }

    pub fn with_options(options: QueueOptions) -> Self {
        Self {
            index: HashMap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            inserted_total: 0,
            on_queue_has_items: options.on_queue_has_items,
            on_queue_empty: options.on_queue_empty,
        }
    }

    /// Wrap a new queue for sharing across tasks.
    pub fn shared(options: QueueOptions) -> SharedQueue {
        Arc::new(Mutex::new(Self::with_options(options)))
    }

    /// Insert or replace a job.
    pub fn enqueue(&mut self, job: EmbedJob) -> EnqueueOutcome {
        if let Some(&slot) = self.index.get(&job.entity_key) {
            if let Some(node) = self.slots[slot].as_mut() {
                node.job = job;
            }
            return EnqueueOutcome::Replaced;
        }

        let was_empty = self.is_empty();
        let key = job.entity_key.clone();
        let node = Node {
            job,
            prev: self.tail,
            next: None,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(node);
                slot
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };

        match self.tail {
            Some(tail) => {
                if let Some(t) = self.slots[tail].as_mut() {
                    t.next = Some(slot);
                }
            }
            None => self.head = Some(slot),
        }
        self.tail = Some(slot);
        self.index.insert(key, slot);
        self.inserted_total += 1;

        if was_empty {
            if let Some(cb) = self.on_queue_has_items.as_mut() {
                cb();
            }
        }
        EnqueueOutcome::Inserted
    }

    /// Remove and return the oldest job.
    pub fn dequeue(&mut self) -> Option<EmbedJob> {
        let head = self.head?;
        let job = self.unlink(head);
        self.notify_if_drained();
        job
    }

    /// Dequeue up to `n` jobs from the head.
    pub fn drain_batch(&mut self, n: usize) -> Vec<EmbedJob> {
        let mut batch = Vec::with_capacity(n.min(self.len()));
        while batch.len() < n {
            let Some(head) = self.head else { break };
            if let Some(job) = self.unlink(head) {
                batch.push(job);
            }
        }
        if !batch.is_empty() {
            self.notify_if_drained();
        }
        batch
    }

    pub fn peek(&self) -> Option<&EmbedJob> {
        self.head
            .and_then(|slot| self.slots[slot].as_ref())
            .map(|node| &node.job)
    }

    pub fn has(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&EmbedJob> {
        self.index
            .get(key)
            .and_then(|&slot| self.slots[slot].as_ref())
            .map(|node| &node.job)
    }

    pub fn remove(&mut self, key: &str) -> Option<EmbedJob> {
        let slot = *self.index.get(key)?;
        let job = self.unlink(slot);
        self.notify_if_drained();
        job
    }

    /// Remove every job belonging to `source_path`: the source itself and
    /// all of its block keys. Returns the number removed.
    pub fn remove_by_source_path(&mut self, source_path: &str) -> usize {
        let slots: Vec<usize> = self
            .index
            .values()
            .copied()
            .filter(|&slot| {
                self.slots[slot]
                    .as_ref()
                    .is_some_and(|node| node.job.source_path == source_path)
            })
            .collect();

        for &slot in &slots {
            self.unlink(slot);
        }
        if !slots.is_empty() {
            self.notify_if_drained();
        }
        slots.len()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Entries appended (not replaced) over the queue's lifetime.
    pub fn inserted_total(&self) -> u64 {
        self.inserted_total
    }

    /// Iterate in FIFO order.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            queue: self,
            cursor: self.head,
        }
    }

    /// Snapshot in FIFO order.
    pub fn to_vec(&self) -> Vec<EmbedJob> {
        self.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        let was_empty = self.is_empty();
        self.index.clear();
        self.slots.clear();
        self.free.clear();
        self.head = None;
        self.tail = None;
        if !was_empty {
            if let Some(cb) = self.on_queue_empty.as_mut() {
                cb();
            }
        }
    }

    fn unlink(&mut self, slot: usize) -> Option<EmbedJob> {
        let node = self.slots[slot].take()?;
        match node.prev {
            Some(prev) => {
                if let Some(p) = self.slots[prev].as_mut() {
                    p.next = node.next;
                }
            }
            None => self.head = node.next,
        }
        match node.next {
            Some(next) => {
                if let Some(n) = self.slots[next].as_mut() {
                    n.prev = node.prev;
                }
            }
            None => self.tail = node.prev,
        }
        self.index.remove(&node.job.entity_key);
        self.free.push(slot);
        Some(node.job)
    }

    fn notify_if_drained(&mut self) {
        if self.is_empty() {
            // Slots are only reusable garbage once nothing is linked.
            self.slots.clear();
            self.free.clear();
            if let Some(cb) = self.on_queue_empty.as_mut() {
                cb();
            }
        }
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobQueue")
            .field("len", &self.len())
            .field("inserted_total", &self.inserted_total)
            .field("head", &self.peek().map(|j| j.entity_key.as_str()))
            .finish()
    }
}

/// FIFO iterator over queued jobs.
pub struct Iter<'a> {
    queue: &'a JobQueue,
    cursor: Option<usize>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a EmbedJob;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.queue.slots[self.cursor?].as_ref()?;
        self.cursor = node.next;
        Some(&node.job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn job(key: &str, hash: &str) -> EmbedJob {
        EmbedJob::new(key, hash)
    }

    fn keys(q: &JobQueue) -> Vec<String> {
        q.iter().map(|j| j.entity_key.clone()).collect()
    }

    fn counting_queue() -> (JobQueue, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let has = Arc::new(AtomicUsize::new(0));
        let empty = Arc::new(AtomicUsize::new(0));
        let (h, e) = (has.clone(), empty.clone());
        let q = JobQueue::with_options(
            QueueOptions::default()
                .on_has_items(move || {
                    h.fetch_add(1, Ordering::SeqCst);
                })
                .on_empty(move || {
                    e.fetch_add(1, Ordering::SeqCst);
                }),
        );
        (q, has, empty)
    }

    #[test]
    fn repeated_key_keeps_latest_payload() {
        let mut q = JobQueue::new();
        assert_eq!(q.enqueue(job("note.md", "h1")), EnqueueOutcome::Inserted);
        assert_eq!(q.enqueue(job("note.md", "h2")), EnqueueOutcome::Replaced);
        assert_eq!(q.enqueue(job("note.md", "h3")), EnqueueOutcome::Replaced);
        assert_eq!(q.len(), 1);
        assert_eq!(q.dequeue().unwrap().content_hash, "h3");
        assert!(q.dequeue().is_none());
    }

    #[test]
    fn replace_keeps_first_position() {
        let mut q = JobQueue::new();
        q.enqueue(job("a", "1"));
        q.enqueue(job("b", "1"));
        q.enqueue(job("a", "2"));
        let first = q.dequeue().unwrap();
        assert_eq!(first.entity_key, "a");
        assert_eq!(first.content_hash, "2");
        assert_eq!(q.dequeue().unwrap().entity_key, "b");
    }

    #[test]
    fn burst_of_edits_collapses() {
        let mut q = JobQueue::new();
        for i in 0..100 {
            q.enqueue(job("hot.md", &format!("h{i}")));
        }
        q.enqueue(job("cold.md", "c"));
        assert_eq!(q.len(), 2);
        assert_eq!(q.get("hot.md").unwrap().content_hash, "h99");
        assert_eq!(q.inserted_total(), 2);
    }

    #[test]
    fn size_never_exceeds_distinct_keys() {
        let mut q = JobQueue::new();
        let ks = ["a", "b", "c", "a", "b", "d", "a", "c"];
        let mut seen = std::collections::HashSet::new();
        for (i, k) in ks.iter().enumerate() {
            q.enqueue(job(k, &i.to_string()));
            seen.insert(*k);
            assert!(q.len() <= seen.len());
        }
        assert_eq!(q.get("a").unwrap().content_hash, "6");
        assert_eq!(keys(&q), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn peek_has_no_side_effects() {
        let mut q = JobQueue::new();
        assert!(q.peek().is_none());
        q.enqueue(job("a", "1"));
        q.enqueue(job("b", "1"));
        assert_eq!(q.peek().unwrap().entity_key, "a");
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn callbacks_fire_on_edges_only() {
        let (mut q, has, empty) = counting_queue();
        q.enqueue(job("a", "1"));
        q.enqueue(job("a", "2"));
        q.enqueue(job("b", "1"));
        assert_eq!(has.load(Ordering::SeqCst), 1);
        assert_eq!(empty.load(Ordering::SeqCst), 0);

        q.dequeue();
        assert_eq!(empty.load(Ordering::SeqCst), 0);
        q.dequeue();
        assert_eq!(empty.load(Ordering::SeqCst), 1);
        assert!(q.dequeue().is_none());
        assert_eq!(empty.load(Ordering::SeqCst), 1);

        q.enqueue(job("c", "1"));
        assert_eq!(has.load(Ordering::SeqCst), 2);
        q.clear();
        assert_eq!(empty.load(Ordering::SeqCst), 2);
        q.clear();
        assert_eq!(empty.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn remove_by_source_path_covers_blocks() {
        let (mut q, _has, empty) = counting_queue();
        q.enqueue(job("a.md", "1"));
        q.enqueue(job("b.md", "1"));
        q.enqueue(job("a.md#Intro", "1"));
        q.enqueue(job("a.md#Intro#Deep", "1"));

        assert_eq!(q.remove_by_source_path("a.md"), 3);
        assert_eq!(keys(&q), vec!["b.md"]);
        assert_eq!(empty.load(Ordering::SeqCst), 0);

        assert_eq!(q.remove_by_source_path("b.md"), 1);
        assert!(q.is_empty());
        assert_eq!(empty.load(Ordering::SeqCst), 1);
        assert_eq!(q.remove_by_source_path("b.md"), 0);
        assert_eq!(empty.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn remove_middle_relinks_order() {
        let mut q = JobQueue::new();
        for k in ["a", "b", "c", "d"] {
            q.enqueue(job(k, "1"));
        }
        assert!(q.remove("b").is_some());
        assert!(q.remove("d").is_some());
        assert!(q.remove("zzz").is_none());
        q.enqueue(job("e", "1"));
        assert_eq!(keys(&q), vec!["a", "c", "e"]);
        assert!(!q.has("b"));
        assert_eq!(q.to_vec().len(), 3);
    }

    #[test]
    fn drain_batch_respects_order_and_limit() {
        let (mut q, _has, empty) = counting_queue();
        for k in ["a", "b", "c"] {
            q.enqueue(job(k, "1"));
        }
        let batch: Vec<_> = q.drain_batch(2).into_iter().map(|j| j.entity_key).collect();
        assert_eq!(batch, vec!["a", "b"]);
        assert_eq!(empty.load(Ordering::SeqCst), 0);
        assert_eq!(q.drain_batch(5).len(), 1);
        assert_eq!(empty.load(Ordering::SeqCst), 1);
        assert!(q.drain_batch(5).is_empty());
    }
}
