//! Built-in context strategies.
//!
//! | Strategy | Priority | Item type | Source |
//! |----------|----------|-----------|--------|
//! | `manual` | 4 | manual | `manual_selections` keys |
//! | `semantic` | 3 | semantic | `query` embedded, nearest stored vectors |
//! | `linked` | 2 | linked | links out of `target_path` |
//! | `recent` | 1 | recent | most recently modified sources |
//! | `target` | 1 | source, block | `target_path` and its blocks |
//!
//! Each strategy walks its candidates in order and skips any that would
//! overflow its allocated budget.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::ContextStrategy;
use crate::embedding::EmbeddingProvider;
use crate::models::{ContextItem, ContextItemType, ContextParams, EntityRef};
use crate::store::{Entity, EntityStore};

/// Running total against one strategy's budget.
struct Budget {
    available: usize,
    used: usize,
}

impl Budget {
    fn new(available: usize) -> Self {
        Self { available, used: 0 }
    }

    fn take(&mut self, tokens: usize) -> bool {
        if self.used + tokens > self.available {
            return false;
        }
        self.used += tokens;
        true
    }
}

async fn collect<S: ContextStrategy + ?Sized>(
    strategy: &S,
    candidates: impl IntoIterator<Item = (Entity, ContextItemType, Option<f32>)>,
    available: usize,
) -> Vec<ContextItem> {
    let mut budget = Budget::new(available);
    let mut items = Vec::new();
    for (entity, item_type, score) in candidates {
        let tokens = strategy.count_tokens(&entity.content).await;
        if !budget.take(tokens) {
            tracing::trace!(strategy = strategy.name(), key = %entity.key, tokens, "over budget");
            continue;
        }
        items.push(ContextItem {
            key: entity.key.clone(),
            content: entity.content,
            item_type,
            tokens,
            entity: Some(EntityRef {
                key: entity.key,
                source_path: entity.source_path,
                score,
            }),
        });
    }
    items
}

// ============ manual ============

pub struct ManualStrategy {
    store: Arc<dyn EntityStore>,
}

impl ManualStrategy {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ContextStrategy for ManualStrategy {
    fn name(&self) -> &str {
        "manual"
    }
    fn priority(&self) -> u32 {
        4
    }

    async fn gather(&self, params: &ContextParams, available: usize) -> Result<Vec<ContextItem>> {
        let mut candidates = Vec::new();
        for key in &params.manual_selections {
            match self.store.get(key).await? {
                Some(entity) => candidates.push((entity, ContextItemType::Manual, None)),
                None => tracing::debug!(key = %key, "manual selection not found"),
            }
        }
        Ok(collect(self, candidates, available).await)
    }
}

// ============ semantic ============

pub struct SemanticStrategy {
    store: Arc<dyn EntityStore>,
    provider: Arc<dyn EmbeddingProvider>,
    limit: usize,
}

impl SemanticStrategy {
    pub fn new(store: Arc<dyn EntityStore>, provider: Arc<dyn EmbeddingProvider>, limit: usize) -> Self {
        Self {
            store,
            provider,
            limit,
        }
    }
}

#[async_trait]
impl ContextStrategy for SemanticStrategy {
    fn name(&self) -> &str {
        "semantic"
    }
    fn priority(&self) -> u32 {
        3
    }

    async fn count_tokens(&self, text: &str) -> usize {
        self.provider.count_tokens(text)
    }

    async fn gather(&self, params: &ContextParams, available: usize) -> Result<Vec<ContextItem>> {
        let query = match params.query.as_deref().map(str::trim) {
            Some(q) if !q.is_empty() => q.to_string(),
            _ => return Ok(Vec::new()),
        };

        let vectors = self
            .provider
            .embed_batch(&[query])
            .await
            .context("Failed to embed query")?;
        let query_vec = vectors
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("provider returned no query embedding"))?;

        let hits = self.store.nearest(&query_vec, self.limit).await?;
        let candidates = hits
            .into_iter()
            .filter(|(e, _)| params.target_path.as_deref() != Some(e.source_path.as_str()))
            .map(|(e, score)| (e, ContextItemType::Semantic, Some(score)));
        Ok(collect(self, candidates, available).await)
    }
}

// ============ linked ============

pub struct LinkedStrategy {
    store: Arc<dyn EntityStore>,
}

impl LinkedStrategy {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store }
    }

    /// Exact vault path first, then any source with the same file name.
    async fn resolve(&self, link: &str, sources: &[Entity]) -> Result<Option<Entity>> {
        if let Some(entity) = self.store.get(link).await? {
            return Ok(Some(entity));
        }
        let name = file_name(link);
        Ok(sources.iter().find(|s| file_name(&s.key) == name).cloned())
    }
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[async_trait]
impl ContextStrategy for LinkedStrategy {
    fn name(&self) -> &str {
        "linked"
    }
    fn priority(&self) -> u32 {
        2
    }

    async fn gather(&self, params: &ContextParams, available: usize) -> Result<Vec<ContextItem>> {
        let Some(target) = params.target_path.as_deref() else {
            return Ok(Vec::new());
        };
        let Some(entity) = self.store.get(target).await? else {
            return Ok(Vec::new());
        };

        let sources = self.store.sources().await?;
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        for link in &entity.links {
            if let Some(linked) = self.resolve(link, &sources).await? {
                if linked.key != target && seen.insert(linked.key.clone()) {
                    candidates.push((linked, ContextItemType::Linked, None));
                }
            }
        }
        Ok(collect(self, candidates, available).await)
    }
}

// ============ recent ============

pub struct RecentStrategy {
    store: Arc<dyn EntityStore>,
    limit: usize,
}

impl RecentStrategy {
    pub fn new(store: Arc<dyn EntityStore>, limit: usize) -> Self {
        Self { store, limit }
    }
}

#[async_trait]
impl ContextStrategy for RecentStrategy {
    fn name(&self) -> &str {
        "recent"
    }
    fn priority(&self) -> u32 {
        1
    }

    async fn gather(&self, params: &ContextParams, available: usize) -> Result<Vec<ContextItem>> {
        let mut sources = self.store.sources().await?;
        sources.retain(|s| params.target_path.as_deref() != Some(s.key.as_str()));
        // newest first, key order on ties
        sources.sort_by(|a, b| b.modified_at.cmp(&a.modified_at).then_with(|| a.key.cmp(&b.key)));
        sources.truncate(self.limit);

        let candidates = sources
            .into_iter()
            .map(|e| (e, ContextItemType::Recent, None));
        Ok(collect(self, candidates, available).await)
    }
}

// ============ target ============

pub struct TargetStrategy {
    store: Arc<dyn EntityStore>,
}

impl TargetStrategy {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ContextStrategy for TargetStrategy {
    fn name(&self) -> &str {
        "target"
    }
    fn priority(&self) -> u32 {
        1
    }

    async fn gather(&self, params: &ContextParams, available: usize) -> Result<Vec<ContextItem>> {
        let Some(target) = params.target_path.as_deref() else {
            return Ok(Vec::new());
        };

        let mut candidates = Vec::new();
        for key in self.store.keys_for_source(target).await? {
            if let Some(entity) = self.store.get(&key).await? {
                let item_type = if entity.is_block() {
                    ContextItemType::Block
                } else {
                    ContextItemType::Source
                };
                candidates.push((entity, item_type, None));
            }
        }
        // source before its blocks
        candidates.sort_by_key(|(e, _, _)| e.is_block());
        Ok(collect(self, candidates, available).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::parse_source;
    use crate::embedding::error::ProviderError;
    use crate::store::{InMemoryEntityStore, StoredEmbedding};
    use chrono::{Duration, TimeZone, Utc};

    async fn store_with(files: &[(&str, &str, i64)]) -> Arc<InMemoryEntityStore> {
        let store = Arc::new(InMemoryEntityStore::new());
        for (path, body, day) in files {
            let at = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap() + Duration::days(*day);
            for entity in parse_source(path, body, at).into_entities() {
                store.upsert(entity).await.unwrap();
            }
        }
        store
    }

    fn params(target: Option<&str>) -> ContextParams {
        ContextParams {
            target_path: target.map(str::to_string),
            ..ContextParams::with_max_tokens(1_000)
        }
    }

    fn keys(items: &[ContextItem]) -> Vec<&str> {
        items.iter().map(|i| i.key.as_str()).collect()
    }

    #[tokio::test]
    async fn manual_skips_missing_and_over_budget() {
        let store = store_with(&[("a.md", "aaaa", 0), ("b.md", &"b".repeat(40), 0)]).await;
        let mut p = params(None);
        p.manual_selections = vec!["a.md".into(), "missing.md".into(), "b.md".into()];

        let items = ManualStrategy::new(store).gather(&p, 5).await.unwrap();
        assert_eq!(keys(&items), vec!["a.md"]);
        assert_eq!(items[0].item_type, ContextItemType::Manual);
        assert_eq!(items[0].tokens, 1);
    }

    #[tokio::test]
    async fn linked_follows_wikilinks_and_paths() {
        let store = store_with(&[
            ("notes/a.md", "see [[b]] and [c](../c.md) and [[a]]", 0),
            ("deep/b.md", "bee", 0),
            ("c.md", "sea", 0),
        ])
        .await;
        let items = LinkedStrategy::new(store)
            .gather(&params(Some("notes/a.md")), 100)
            .await
            .unwrap();
        assert_eq!(keys(&items), vec!["deep/b.md", "c.md"]);
        assert!(items.iter().all(|i| i.item_type == ContextItemType::Linked));
    }

    #[tokio::test]
    async fn recent_orders_by_modification_and_skips_target() {
        let store = store_with(&[("old.md", "o", 0), ("new.md", "n", 5), ("mid.md", "m", 2)]).await;
        let items = RecentStrategy::new(store, 2)
            .gather(&params(Some("new.md")), 100)
            .await
            .unwrap();
        assert_eq!(keys(&items), vec!["mid.md", "old.md"]);
    }

    #[tokio::test]
    async fn target_yields_source_then_blocks() {
        let store = store_with(&[("t.md", "intro\n# One\nx\n# Two\ny\n", 0)]).await;
        let items = TargetStrategy::new(store)
            .gather(&params(Some("t.md")), 1_000)
            .await
            .unwrap();
        assert_eq!(keys(&items), vec!["t.md", "t.md#One", "t.md#Two"]);
        assert_eq!(items[0].item_type, ContextItemType::Source);
        assert_eq!(items[1].item_type, ContextItemType::Block);
    }

    struct AxisProvider;

    #[async_trait]
    impl EmbeddingProvider for AxisProvider {
        fn adapter(&self) -> &str {
            "mock"
        }
        fn model_name(&self) -> &str {
            "axis"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
            Ok(inputs
                .iter()
                .map(|s| if s.contains("rust") { vec![1.0, 0.0] } else { vec![0.0, 1.0] })
                .collect())
        }
        fn count_tokens(&self, text: &str) -> usize {
            text.split_whitespace().count()
        }
    }

    #[tokio::test]
    async fn semantic_ranks_by_similarity() {
        let store = store_with(&[("r.md", "rust is fast and safe", 0), ("g.md", "garden", 0)]).await;
        for (key, v) in [("r.md", vec![1.0, 0.0]), ("g.md", vec![0.0, 1.0])] {
            store
                .save_embedding(
                    key,
                    StoredEmbedding {
                        vector: v,
                        model: "axis".into(),
                        content_hash: String::new(),
                    },
                )
                .await
                .unwrap();
        }

        let strategy = SemanticStrategy::new(store, Arc::new(AxisProvider), 1);
        let mut p = params(None);
        assert!(strategy.gather(&p, 100).await.unwrap().is_empty());

        p.query = Some("learning rust".into());
        let items = strategy.gather(&p, 100).await.unwrap();
        assert_eq!(keys(&items), vec!["r.md"]);
        // charged with the provider's tokenizer
        assert_eq!(items[0].tokens, 5);
        let score = items[0].entity.as_ref().unwrap().score.unwrap();
        assert!((score - 1.0).abs() < 1e-6);
    }
}
