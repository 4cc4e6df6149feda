//! Entity storage.
//!
//! The [`EntityStore`] trait is the entity-lookup capability the scheduler,
//! run loop and context strategies share. Keys are entity keys as defined
//! in [`crate::models`]: a source path, or a source path plus `#Heading`
//! fragments for blocks.
//!
//! [`InMemoryEntityStore`] keeps everything in a `BTreeMap` behind a
//! `tokio::sync::RwLock`. Vector search is brute-force cosine similarity
//! over every stored embedding.

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::embedding::cosine_similarity;
use crate::models::EmbedJob;

/// A vector attached to an entity, tagged with the content it was built from.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredEmbedding {
    pub vector: Vec<f32>,
    pub model: String,
    pub content_hash: String,
}

/// A source document or one heading block inside it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub key: String,
    pub source_path: String,
    pub content: String,
    pub content_hash: String,
    pub modified_at: DateTime<Utc>,
    /// Link targets as written in the source, normalized to vault paths.
    pub links: Vec<String>,
    #[serde(skip)]
    pub embedding: Option<StoredEmbedding>,
}

impl Entity {
    /// Anything other than the source entity itself.
    pub fn is_block(&self) -> bool {
        self.key != self.source_path
    }

    /// A job to (re-)embed this entity at its current content.
    pub fn embed_job(&self) -> EmbedJob {
        EmbedJob::for_source(&self.key, &self.source_path, &self.content_hash)
    }

    /// The stored vector is missing or was built from older content.
    pub fn needs_embedding(&self) -> bool {
        match &self.embedding {
            Some(e) => e.content_hash != self.content_hash,
            None => true,
        }
    }

    /// Long enough to be worth embedding.
    pub fn is_embeddable(&self, min_chars: usize) -> bool {
        self.content.trim().chars().count() >= min_chars.max(1)
    }
}

/// Counts of entities whose embedding is stale.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StaleCounts {
    pub total: usize,
    pub embeddable: usize,
}

#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Entity>>;

    /// Insert or replace an entity. An existing embedding is kept so
    /// staleness can be judged against the new content hash.
    async fn upsert(&self, entity: Entity) -> Result<()>;

    /// Remove one entity. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Remove every block of `source_path`, leaving the source entity.
    async fn delete_source_blocks(&self, source_path: &str) -> Result<usize>;

    /// Keys of the source entity and all its blocks, in key order.
    async fn keys_for_source(&self, source_path: &str) -> Result<Vec<String>>;

    /// Attach a vector. Returns `false` if the entity no longer exists.
    async fn save_embedding(&self, key: &str, embedding: StoredEmbedding) -> Result<bool>;

    /// All source (non-block) entities.
    async fn sources(&self) -> Result<Vec<Entity>>;

    /// Entities ranked by cosine similarity to `query`, best first.
    async fn nearest(&self, query: &[f32], limit: usize) -> Result<Vec<(Entity, f32)>>;

    async fn stale_counts(&self, min_embed_chars: usize) -> Result<StaleCounts>;

    async fn len(&self) -> Result<usize>;
}

/// In-memory [`EntityStore`].
pub struct InMemoryEntityStore {
    entities: RwLock<BTreeMap<String, Entity>>,
}

impl InMemoryEntityStore {
    pub fn new() -> Self {
        Self {
            entities: RwLock::new(BTreeMap::new()),
        }
    }
}

impl Default for InMemoryEntityStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EntityStore for InMemoryEntityStore {
    async fn get(&self, key: &str) -> Result<Option<Entity>> {
        Ok(self.entities.read().await.get(key).cloned())
    }

    async fn upsert(&self, mut entity: Entity) -> Result<()> {
        let mut entities = self.entities.write().await;
        if entity.embedding.is_none() {
            if let Some(existing) = entities.get(&entity.key) {
                entity.embedding = existing.embedding.clone();
            }
        }
        entities.insert(entity.key.clone(), entity);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entities.write().await.remove(key).is_some())
    }

    async fn delete_source_blocks(&self, source_path: &str) -> Result<usize> {
        let mut entities = self.entities.write().await;
        let before = entities.len();
        entities.retain(|_, e| !(e.is_block() && e.source_path == source_path));
        Ok(before - entities.len())
    }

    async fn keys_for_source(&self, source_path: &str) -> Result<Vec<String>> {
        let entities = self.entities.read().await;
        Ok(entities
            .values()
            .filter(|e| e.source_path == source_path)
            .map(|e| e.key.clone())
            .collect())
    }

    async fn save_embedding(&self, key: &str, embedding: StoredEmbedding) -> Result<bool> {
        let mut entities = self.entities.write().await;
        match entities.get_mut(key) {
            Some(entity) => {
                entity.embedding = Some(embedding);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn sources(&self) -> Result<Vec<Entity>> {
        let entities = self.entities.read().await;
        Ok(entities.values().filter(|e| !e.is_block()).cloned().collect())
    }

    async fn nearest(&self, query: &[f32], limit: usize) -> Result<Vec<(Entity, f32)>> {
        let entities = self.entities.read().await;
        let mut scored: Vec<(Entity, f32)> = entities
            .values()
            .filter_map(|e| {
                let emb = e.embedding.as_ref()?;
                Some((e.clone(), cosine_similarity(query, &emb.vector)))
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    async fn stale_counts(&self, min_embed_chars: usize) -> Result<StaleCounts> {
        let entities = self.entities.read().await;
        let mut counts = StaleCounts::default();
        for entity in entities.values().filter(|e| e.needs_embedding()) {
            counts.total += 1;
            if entity.is_embeddable(min_embed_chars) {
                counts.embeddable += 1;
            }
        }
        Ok(counts)
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.entities.read().await.len())
    }
}
