//! Embedding provider abstraction and HTTP adapters.
//!
//! The crate never computes embeddings itself. It talks to an adapter
//! through [`EmbeddingProvider::embed_batch`] and classifies every failure
//! into the [`ProviderError`] taxonomy so the run loop can decide between
//! retry and abort.
//!
//! - **[`DisabledProvider`]**: always fails fatally; used when no provider is configured.
//! - **[`OpenAiProvider`]**: `POST {url}/embeddings` on any OpenAI-compatible API.
//! - **[`OllamaProvider`]**: `POST {url}/api/embed` on a local Ollama instance.
//!
//! Adapters make a single attempt per call. Retry, backoff and the
//! request timeout live in the run loop ([`crate::runner`]), which is the
//! one place that owns the retry budget.

pub mod error;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;

use crate::config::EmbeddingConfig;
use crate::kernel::ModelRef;
use crate::tokens;

pub use error::{classify_status, ProviderError, RetryPolicy};

/// An embedding backend.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Adapter identifier (e.g. `"openai"`).
    fn adapter(&self) -> &str;
    /// Model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Embedding vector dimensionality.
    fn dims(&self) -> usize;

    /// Prepare the model for use. Remote adapters have nothing to load.
    async fn load(&self) -> Result<ModelRef, ProviderError> {
        Ok(ModelRef {
            id: self.model_name().to_string(),
            adapter: self.adapter().to_string(),
            dims: self.dims(),
        })
    }

    /// Embed a batch of inputs, returning one vector per input in order.
    async fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, ProviderError>;

    /// Token cost of `text` under this model.
    fn count_tokens(&self, text: &str) -> usize {
        tokens::count_tokens(text)
    }
}

/// Build the provider named in config.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledProvider)),
        "openai" => Ok(Arc::new(OpenAiProvider::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaProvider::new(config)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

// ============ Disabled Provider ============

/// Provider used when `embedding.provider = "disabled"`.
pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn adapter(&self) -> &str {
        "disabled"
    }
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }

    async fn load(&self) -> Result<ModelRef, ProviderError> {
        Err(ProviderError::fatal(400, "embedding provider is disabled"))
    }

    async fn embed_batch(&self, _inputs: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Err(ProviderError::fatal(400, "embedding provider is disabled"))
    }
}

// ============ OpenAI-compatible Provider ============

/// Embedding provider for OpenAI-compatible `/embeddings` endpoints.
///
/// Reads the bearer token from `OPENAI_API_KEY`.
pub struct OpenAiProvider {
    model: String,
    dims: usize,
    url: String,
    client: reqwest::Client,
}

impl OpenAiProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model,
            dims,
            url,
            client,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiProvider {
    fn adapter(&self) -> &str {
        "openai"
    }
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn load(&self) -> Result<ModelRef, ProviderError> {
        if std::env::var("OPENAI_API_KEY").is_err() {
            return Err(ProviderError::fatal(
                401,
                "OPENAI_API_KEY environment variable not set",
            ));
        }
        Ok(ModelRef {
            id: self.model.clone(),
            adapter: "openai".to_string(),
            dims: self.dims,
        })
    }

    async fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| ProviderError::fatal(401, "OPENAI_API_KEY not set"))?;

        let body = serde_json::json!({
            "model": self.model,
            "input": inputs,
        });

        let response = self
            .client
            .post(format!("{}/embeddings", self.url.trim_end_matches('/')))
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| error::classify_reqwest(&e))?;

        let json = read_json(response, "OpenAI").await?;
        let vectors = parse_openai_response(&json)?;
        check_count(inputs.len(), vectors)
    }
}

/// Extract `data[].embedding`, ordered by `data[].index` when present.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, ProviderError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| ProviderError::malformed("Invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| ProviderError::malformed("Invalid OpenAI response: missing embedding"))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(pos);
        indexed.push((index, to_f32_vec(embedding)));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama Provider ============

/// Embedding provider for a local Ollama instance (`/api/embed`).
pub struct OllamaProvider {
    model: String,
    dims: usize,
    url: String,
    client: reqwest::Client,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model,
            dims,
            url,
            client,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn adapter(&self) -> &str {
        "ollama"
    }
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        let body = serde_json::json!({
            "model": self.model,
            "input": inputs,
        });

        let response = self
            .client
            .post(format!("{}/api/embed", self.url.trim_end_matches('/')))
            .json(&body)
            .send()
            .await
            .map_err(|e| error::classify_reqwest(&e))?;

        let json = read_json(response, "Ollama").await?;
        let vectors = parse_ollama_response(&json)?;
        check_count(inputs.len(), vectors)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, ProviderError> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| {
            ProviderError::malformed("Invalid Ollama response: missing embeddings array")
        })?;

    embeddings
        .iter()
        .map(|embedding| {
            embedding.as_array().map(|a| to_f32_vec(a)).ok_or_else(|| {
                ProviderError::malformed("Invalid Ollama response: embedding is not an array")
            })
        })
        .collect()
}

// ============ Shared helpers ============

/// Turn a response into JSON, classifying non-success statuses.
async fn read_json(
    response: reqwest::Response,
    label: &str,
) -> Result<serde_json::Value, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return response
            .json()
            .await
            .map_err(|e| ProviderError::malformed(format!("{} response: {}", label, e)));
    }

    let retry_after = error::parse_retry_after(
        response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok()),
    );
    let body_text = response.text().await.unwrap_or_default();
    Err(classify_status(
        status.as_u16(),
        format!("{} API error {}: {}", label, status, body_text),
        retry_after,
    ))
}

fn check_count(expected: usize, vectors: Vec<Vec<f32>>) -> Result<Vec<Vec<f32>>, ProviderError> {
    if vectors.len() != expected {
        return Err(ProviderError::malformed(format!(
            "expected {} embeddings, got {}",
            expected,
            vectors.len()
        )));
    }
    Ok(vectors)
}

fn to_f32_vec(values: &[serde_json::Value]) -> Vec<f32> {
    values
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns `0.0` for empty vectors or vectors of different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
