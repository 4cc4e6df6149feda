//! Context assembly under a token budget.
//!
//! A [`ContextManager`] fans a [`ContextParams`] request out to the
//! enabled [`ContextStrategy`]s in its [`StrategyRegistry`], gives each a
//! slice of the budget, and merges what they return.
//!
//! ```text
//!  ContextParams
//!       │
//!       ▼
//!  enabled strategies, by priority ──▶ allocate_budgets
//!       │
//!       ▼  (sequential)
//!  manual ─▶ semantic ─▶ linked ─▶ recent ─▶ target
//!       │        first key wins; failures are isolated
//!       ▼
//!  total > max_tokens ? truncate_to_budget : as-is
//!       │
//!       ▼
//!  ContextResult
//! ```

pub mod budget;
pub mod strategies;
pub mod truncate;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::ContextConfig;
use crate::embedding::EmbeddingProvider;
use crate::models::{ContextItem, ContextMetadata, ContextParams, ContextResult};
use crate::store::EntityStore;
use crate::tokens;

pub use budget::allocate_budgets;
pub use strategies::{
    LinkedStrategy, ManualStrategy, RecentStrategy, SemanticStrategy, TargetStrategy,
};
pub use truncate::{truncate_to_budget, Truncation};

// ═══════════════════════════════════════════════════════════════════════
// Strategy Trait
// ═══════════════════════════════════════════════════════════════════════

/// A retrieval strategy contributing candidate items under a token budget.
///
/// Strategies run one after another in descending [`priority`] order.
/// Higher-priority strategies therefore win when two produce the same key.
/// An error from [`gather`] is logged and the strategy contributes nothing;
/// it never fails the overall request.
///
/// [`priority`]: ContextStrategy::priority
/// [`gather`]: ContextStrategy::gather
#[async_trait]
pub trait ContextStrategy: Send + Sync {
    /// Unique name, used for registration, budgets and reporting.
    fn name(&self) -> &str;

    /// Relative weight for budget allocation and invocation order.
    fn priority(&self) -> u32;

    /// Whether the strategy runs when config says nothing about it.
    fn default_enabled(&self) -> bool {
        true
    }

    /// Token cost of `text`.
    async fn count_tokens(&self, text: &str) -> usize {
        tokens::count_tokens(text)
    }

    /// Produce items whose combined `tokens` fit in `available_tokens`.
    async fn gather(
        &self,
        params: &ContextParams,
        available_tokens: usize,
    ) -> Result<Vec<ContextItem>>;
}

// ═══════════════════════════════════════════════════════════════════════
// Strategy Registry
// ═══════════════════════════════════════════════════════════════════════

/// Strategies keyed by name, in registration order.
pub struct StrategyRegistry {
    strategies: Vec<Arc<dyn ContextStrategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self {
            strategies: Vec::new(),
        }
    }

    /// Registry with the built-in strategies. `semantic` is only added when
    /// an embedding provider is available.
    pub fn with_builtins(
        store: Arc<dyn EntityStore>,
        provider: Option<Arc<dyn EmbeddingProvider>>,
        config: &ContextConfig,
    ) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ManualStrategy::new(store.clone())));
        if let Some(provider) = provider {
            registry.register(Arc::new(SemanticStrategy::new(
                store.clone(),
                provider,
                config.semantic_limit,
            )));
        }
        registry.register(Arc::new(LinkedStrategy::new(store.clone())));
        registry.register(Arc::new(RecentStrategy::new(
            store.clone(),
            config.recent_limit,
        )));
        registry.register(Arc::new(TargetStrategy::new(store)));
        registry
    }

    /// Register a strategy. A strategy with the same name is replaced in
    /// place, keeping its position.
    pub fn register(&mut self, strategy: Arc<dyn ContextStrategy>) {
        match self
            .strategies
            .iter()
            .position(|s| s.name() == strategy.name())
        {
            Some(i) => self.strategies[i] = strategy,
            None => self.strategies.push(strategy),
        }
    }

    pub fn strategies(&self) -> &[Arc<dyn ContextStrategy>] {
        &self.strategies
    }

    pub fn find(&self, name: &str) -> Option<&dyn ContextStrategy> {
        self.strategies
            .iter()
            .find(|s| s.name() == name)
            .map(|s| s.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Context Manager
// ═══════════════════════════════════════════════════════════════════════

pub struct ContextManager {
    registry: StrategyRegistry,
    enabled: HashMap<String, bool>,
}

impl ContextManager {
    pub fn new(registry: StrategyRegistry) -> Self {
        Self {
            registry,
            enabled: HashMap::new(),
        }
    }

    /// Manager with the `enabled` overrides from `[context.strategies.*]`.
    pub fn from_config(registry: StrategyRegistry, config: &ContextConfig) -> Self {
        let mut manager = Self::new(registry);
        for (name, cfg) in &config.strategies {
            if let Some(enabled) = cfg.enabled {
                manager.set_enabled(name, enabled);
            }
        }
        manager
    }

    pub fn registry(&self) -> &StrategyRegistry {
        &self.registry
    }

    pub fn set_enabled(&mut self, name: &str, enabled: bool) {
        self.enabled.insert(name.to_string(), enabled);
    }

    pub fn is_enabled(&self, strategy: &dyn ContextStrategy) -> bool {
        self.enabled
            .get(strategy.name())
            .copied()
            .unwrap_or_else(|| strategy.default_enabled())
    }

    /// Enabled strategies, highest priority first. Equal priorities keep
    /// registration order.
    pub fn active(&self) -> Vec<Arc<dyn ContextStrategy>> {
        let mut active: Vec<_> = self
            .registry
            .strategies()
            .iter()
            .filter(|s| self.is_enabled(s.as_ref()))
            .cloned()
            .collect();
        active.sort_by_key(|s| std::cmp::Reverse(s.priority()));
        active
    }

    pub async fn gather(&self, params: &ContextParams) -> ContextResult {
        let started = Instant::now();
        let active = self.active();

        let weights: Vec<(&str, u32)> = active.iter().map(|s| (s.name(), s.priority())).collect();
        let budgets = allocate_budgets(&weights, params.max_tokens, &params.strategy_budgets);

        let mut seen: HashSet<String> = HashSet::new();
        let mut items: Vec<ContextItem> = Vec::new();
        let mut tokens_by_strategy: BTreeMap<String, usize> = BTreeMap::new();
        let mut metadata = ContextMetadata {
            query: params.query.clone(),
            target_path: params.target_path.clone(),
            ..Default::default()
        };

        for (strategy, budget) in active.iter().zip(budgets) {
            let name = strategy.name();
            let returned = match strategy.gather(params, budget).await {
                Ok(returned) => returned,
                Err(e) => {
                    tracing::warn!(strategy = name, err = %e, "context strategy failed");
                    metadata.failed_strategies.push(name.to_string());
                    continue;
                }
            };
            if returned.is_empty() {
                continue;
            }
            metadata.strategies_used.push(name.to_string());

            for item in returned {
                if !seen.insert(item.key.clone()) {
                    tracing::debug!(strategy = name, key = %item.key, "duplicate context item dropped");
                    continue;
                }
                *tokens_by_strategy.entry(name.to_string()).or_default() += item.tokens;
                items.push(item);
            }
        }

        let mut total_tokens: usize = items.iter().map(|i| i.tokens).sum();
        let mut truncated_items = None;
        if total_tokens > params.max_tokens {
            let cut = truncate_to_budget(items, params.max_tokens);
            tracing::info!(
                total_tokens,
                max_tokens = params.max_tokens,
                dropped = cut.dropped.len(),
                "context truncated"
            );
            items = cut.kept;
            total_tokens = cut.total_tokens;
            truncated_items = Some(cut.dropped);
        }

        metadata.elapsed_ms = started.elapsed().as_millis() as u64;

        ContextResult {
            items,
            total_tokens,
            tokens_by_strategy,
            truncated_items,
            metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ContextItemType;

    /// Returns fixed items regardless of budget, or fails.
    struct Fixed {
        name: &'static str,
        priority: u32,
        items: Vec<(&'static str, usize)>,
        fail: bool,
    }

    impl Fixed {
        fn new(name: &'static str, priority: u32, items: Vec<(&'static str, usize)>) -> Self {
            Self {
                name,
                priority,
                items,
                fail: false,
            }
        }
    }

    #[async_trait]
    impl ContextStrategy for Fixed {
        fn name(&self) -> &str {
            self.name
        }
        fn priority(&self) -> u32 {
            self.priority
        }
        async fn gather(&self, _params: &ContextParams, _available: usize) -> Result<Vec<ContextItem>> {
            if self.fail {
                anyhow::bail!("backend down");
            }
            Ok(self
                .items
                .iter()
                .map(|(key, tokens)| ContextItem {
                    key: key.to_string(),
                    content: format!("{} from {}", key, self.name),
                    item_type: ContextItemType::Recent,
                    tokens: *tokens,
                    entity: None,
                })
                .collect())
        }
    }

    /// Records the budget it was handed.
    struct Probe {
        name: &'static str,
        priority: u32,
        seen: std::sync::Mutex<Option<usize>>,
    }

    #[async_trait]
    impl ContextStrategy for Probe {
        fn name(&self) -> &str {
            self.name
        }
        fn priority(&self) -> u32 {
            self.priority
        }
        async fn gather(&self, _params: &ContextParams, available: usize) -> Result<Vec<ContextItem>> {
            *self.seen.lock().unwrap() = Some(available);
            Ok(Vec::new())
        }
    }

    fn manager(strategies: Vec<Arc<dyn ContextStrategy>>) -> ContextManager {
        let mut registry = StrategyRegistry::new();
        for s in strategies {
            registry.register(s);
        }
        ContextManager::new(registry)
    }

    #[tokio::test]
    async fn higher_priority_wins_duplicate_keys() {
        let low = Arc::new(Fixed::new("low", 1, vec![("shared", 5), ("low-only", 5)]));
        let high = Arc::new(Fixed::new("high", 3, vec![("shared", 7)]));
        let result = manager(vec![low, high])
            .gather(&ContextParams::with_max_tokens(100))
            .await;

        let shared = result.items.iter().find(|i| i.key == "shared").unwrap();
        assert_eq!(shared.content, "shared from high");
        assert_eq!(result.items.len(), 2);
        assert_eq!(result.tokens_by_strategy["high"], 7);
        assert_eq!(result.tokens_by_strategy["low"], 5);
        assert_eq!(result.total_tokens, 12);
        assert_eq!(result.metadata.strategies_used, vec!["high", "low"]);
        assert!(result.truncated_items.is_none());
    }

    #[tokio::test]
    async fn failing_strategy_is_isolated() {
        let mut broken = Fixed::new("broken", 5, vec![("x", 1)]);
        broken.fail = true;
        let ok = Arc::new(Fixed::new("ok", 1, vec![("y", 1)]));
        let result = manager(vec![Arc::new(broken), ok])
            .gather(&ContextParams::with_max_tokens(10))
            .await;
        assert_eq!(result.items.len(), 1);
        assert_eq!(result.metadata.failed_strategies, vec!["broken"]);
        assert_eq!(result.metadata.strategies_used, vec!["ok"]);
    }

    #[tokio::test]
    async fn budgets_follow_priority_and_custom() {
        let a = Arc::new(Probe {
            name: "a",
            priority: 3,
            seen: Default::default(),
        });
        let b = Arc::new(Probe {
            name: "b",
            priority: 1,
            seen: Default::default(),
        });
        let m = manager(vec![a.clone(), b.clone()]);

        m.gather(&ContextParams::with_max_tokens(100)).await;
        assert_eq!(*a.seen.lock().unwrap(), Some(75));
        assert_eq!(*b.seen.lock().unwrap(), Some(25));

        let mut params = ContextParams::with_max_tokens(100);
        params.strategy_budgets.insert("b".to_string(), 60);
        m.gather(&params).await;
        assert_eq!(*a.seen.lock().unwrap(), Some(40));
        assert_eq!(*b.seen.lock().unwrap(), Some(60));
    }

    #[tokio::test]
    async fn overflow_is_truncated() {
        let greedy = Arc::new(Fixed::new("greedy", 1, vec![("a", 40), ("b", 40), ("c", 40)]));
        let result = manager(vec![greedy])
            .gather(&ContextParams::with_max_tokens(100))
            .await;
        assert_eq!(result.total_tokens, 80);
        assert_eq!(result.truncated_items, Some(vec!["c".to_string()]));
    }

    #[tokio::test]
    async fn disabled_strategies_are_skipped() {
        let a = Arc::new(Fixed::new("a", 1, vec![("x", 1)]));
        let mut m = manager(vec![a]);
        m.set_enabled("a", false);
        let result = m.gather(&ContextParams::with_max_tokens(10)).await;
        assert!(result.items.is_empty());
        assert!(m.active().is_empty());
    }

    #[test]
    fn register_replaces_in_place() {
        let mut registry = StrategyRegistry::new();
        registry.register(Arc::new(Fixed::new("a", 1, vec![])));
        registry.register(Arc::new(Fixed::new("b", 1, vec![])));
        registry.register(Arc::new(Fixed::new("a", 9, vec![])));
        let names: Vec<_> = registry.strategies().iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(registry.find("a").unwrap().priority(), 9);
        assert_eq!(registry.len(), 2);
    }
}
