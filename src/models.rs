//! Core data models used throughout the crate.
//!
//! These types represent the embedding jobs that flow through the
//! [`JobQueue`](crate::queue::JobQueue) and the context items that flow out
//! of the [`ContextManager`](crate::context::ContextManager).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Separator between a source path and its heading fragments in a block key.
pub const BLOCK_DELIMITER: char = '#';

/// Returns the source-only portion of an entity key.
///
/// `notes/a.md#Intro#Details` → `notes/a.md`; a plain source key is
/// returned as-is.
pub fn source_path_of(entity_key: &str) -> &str {
    match entity_key.find(BLOCK_DELIMITER) {
        Some(pos) => &entity_key[..pos],
        None => entity_key,
    }
}

/// A pending unit of embedding work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbedJob {
    pub entity_key: String,
    pub content_hash: String,
    pub source_path: String,
    pub enqueued_at: DateTime<Utc>,
}

impl EmbedJob {
    /// Build a job stamped with the current time, deriving `source_path`
    /// from the key. Only valid when the source path itself contains no
    /// `#`; jobs for stored entities come from
    /// [`Entity::embed_job`](crate::store::Entity::embed_job).
    pub fn new(entity_key: impl Into<String>, content_hash: impl Into<String>) -> Self {
        let entity_key = entity_key.into();
        let source_path = source_path_of(&entity_key).to_string();
        Self::for_source(entity_key, source_path, content_hash)
    }

    /// Build a job with an explicit source path.
    pub fn for_source(
        entity_key: impl Into<String>,
        source_path: impl Into<String>,
        content_hash: impl Into<String>,
    ) -> Self {
        Self {
            entity_key: entity_key.into(),
            content_hash: content_hash.into(),
            source_path: source_path.into(),
            enqueued_at: Utc::now(),
        }
    }
}

/// Where a context item came from. Also decides truncation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextItemType {
    Manual,
    Semantic,
    Recent,
    Linked,
    Source,
    Block,
}

impl ContextItemType {
    /// Fixed priority used when the combined result overflows `max_tokens`.
    /// Higher survives longer.
    pub fn truncation_priority(self) -> u8 {
        match self {
            ContextItemType::Manual => 3,
            ContextItemType::Semantic => 2,
            ContextItemType::Recent | ContextItemType::Linked => 1,
            ContextItemType::Source | ContextItemType::Block => 0,
        }
    }
}

/// Back-reference from a context item to the stored entity it was built from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRef {
    pub key: String,
    pub source_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

/// A single candidate piece of context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextItem {
    /// Unique per gather; the first strategy to produce a key keeps it.
    pub key: String,
    pub content: String,
    #[serde(rename = "type")]
    pub item_type: ContextItemType,
    /// Cost charged against the token budget.
    pub tokens: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity: Option<EntityRef>,
}

/// Caller-supplied inputs to [`ContextManager::gather`](crate::context::ContextManager::gather).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextParams {
    pub max_tokens: usize,
    /// Fixed budgets for named strategies, honored before proportional split.
    #[serde(default)]
    pub strategy_budgets: HashMap<String, usize>,
    #[serde(default)]
    pub manual_selections: Vec<String>,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub target_path: Option<String>,
}

impl ContextParams {
    pub fn with_max_tokens(max_tokens: usize) -> Self {
        Self {
            max_tokens,
            ..Default::default()
        }
    }
}

/// Observability data attached to every [`ContextResult`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextMetadata {
    pub elapsed_ms: u64,
    /// Strategies that returned at least one item, in invocation order.
    pub strategies_used: Vec<String>,
    /// Strategies whose `gather` returned an error.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_strategies: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_path: Option<String>,
}

/// The assembled, budget-bounded context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextResult {
    pub items: Vec<ContextItem>,
    pub total_tokens: usize,
    pub tokens_by_strategy: BTreeMap<String, usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truncated_items: Option<Vec<String>>,
    pub metadata: ContextMetadata,
}
