use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::embedding::error::{DeferralCounter, RetryPolicy};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub vault: VaultConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub context: ContextConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct VaultConfig {
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.md".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Entities shorter than this are never queued for embedding.
    #[serde(default = "default_min_embed_chars")]
    pub min_embed_chars: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            min_embed_chars: default_min_embed_chars(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    32
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_min_embed_chars() -> usize {
    1
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RunConfig {
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
    #[serde(default = "default_max_deferrals")]
    pub max_deferrals: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            stop_timeout_ms: default_stop_timeout_ms(),
            max_deferrals: default_max_deferrals(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

fn default_stop_timeout_ms() -> u64 {
    5_000
}
fn default_max_deferrals() -> u32 {
    DeferralCounter::DEFAULT_MAX
}
fn default_initial_backoff_ms() -> u64 {
    1_000
}
fn default_max_backoff_ms() -> u64 {
    60_000
}

impl RunConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    /// Retry policy combining run settings with the provider's limits.
    pub fn retry_policy(&self, embedding: &EmbeddingConfig) -> RetryPolicy {
        RetryPolicy {
            max_retries: embedding.max_retries,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            request_timeout: Duration::from_secs(embedding.timeout_secs),
            ..Default::default()
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ContextConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_recent_limit")]
    pub recent_limit: usize,
    #[serde(default = "default_semantic_limit")]
    pub semantic_limit: usize,
    #[serde(default)]
    pub strategies: HashMap<String, StrategyConfig>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            recent_limit: default_recent_limit(),
            semantic_limit: default_semantic_limit(),
            strategies: HashMap::new(),
        }
    }
}

fn default_max_tokens() -> usize {
    4_000
}
fn default_recent_limit() -> usize {
    5
}
fn default_semantic_limit() -> usize {
    10
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StrategyConfig {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub budget: Option<usize>,
}

impl ContextConfig {
    /// Budgets configured per strategy, used when the caller gives none.
    pub fn strategy_budgets(&self) -> HashMap<String, usize> {
        self.strategies
            .iter()
            .filter_map(|(name, cfg)| cfg.budget.map(|b| (name.clone(), b)))
            .collect()
    }
}

impl Config {
    /// A config rooted at `root` with every other section defaulted.
    pub fn minimal(root: impl Into<PathBuf>) -> Self {
        Self {
            vault: VaultConfig {
                root: root.into(),
                include_globs: default_include_globs(),
                exclude_globs: Vec::new(),
                follow_symlinks: false,
            },
            embedding: EmbeddingConfig::default(),
            run: RunConfig::default(),
            context: ContextConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }

    if config.run.max_deferrals == 0 {
        anyhow::bail!("run.max_deferrals must be >= 1");
    }

    if config.run.initial_backoff_ms > config.run.max_backoff_ms {
        anyhow::bail!("run.initial_backoff_ms must not exceed run.max_backoff_ms");
    }

    if config.context.max_tokens == 0 {
        anyhow::bail!("context.max_tokens must be > 0");
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_src: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_src)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn minimal_file_gets_defaults() {
        let config = parse("[vault]\nroot = \"./notes\"\n").unwrap();
        assert_eq!(config.vault.include_globs, vec!["**/*.md"]);
        assert!(!config.embedding.is_enabled());
        assert_eq!(config.run.max_deferrals, 20);
        assert_eq!(config.context.max_tokens, 4_000);
    }

    #[test]
    fn enabled_provider_needs_model_and_dims() {
        let err = parse("[vault]\nroot = \".\"\n[embedding]\nprovider = \"openai\"\n")
            .unwrap_err()
            .to_string();
        assert!(err.contains("dims"), "{err}");

        let ok = parse(
            "[vault]\nroot = \".\"\n[embedding]\nprovider = \"ollama\"\nmodel = \"nomic-embed-text\"\ndims = 768\n",
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn unknown_provider_rejected() {
        assert!(parse("[vault]\nroot = \".\"\n[embedding]\nprovider = \"magic\"\n").is_err());
    }

    #[test]
    fn strategy_budgets_from_config() {
        let config = parse(
            r#"
[vault]
root = "."

[context]
max_tokens = 1000

[context.strategies.recent]
enabled = false
budget = 200

[context.strategies.manual]
enabled = true
"#,
        )
        .unwrap();
        let budgets = config.context.strategy_budgets();
        assert_eq!(budgets.get("recent"), Some(&200));
        assert!(!budgets.contains_key("manual"));
        assert_eq!(config.context.strategies["recent"].enabled, Some(false));
    }

    #[test]
    fn retry_policy_uses_run_and_embedding() {
        let config = Config::minimal(".");
        let policy = config.run.retry_policy(&config.embedding);
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.initial_backoff, Duration::from_secs(1));
        assert_eq!(policy.request_timeout, Duration::from_secs(30));
    }
}
