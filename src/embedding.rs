//! Embedding provider implementations.
//!
//! Concrete [`EmbeddingModelProvider`]s:
//! - **[`OpenAIProvider`]**: calls the OpenAI embeddings API with retry and backoff.
//! - **[`OllamaProvider`]**: calls a local Ollama instance's `/api/embed` endpoint.
//! - **[`HashEmbeddingProvider`]**: deterministic offline vectors, no network.
//!
//! Every provider returns unit-length vectors. Use [`create_provider`] to
//! build one from the `[embedding]` config section.
//!
//! ```rust
//! # use knowledge::config::EmbeddingConfig;
//! # use knowledge::embedding::create_provider;
//! let config = EmbeddingConfig::default(); // provider = "hash"
//! let provider = create_provider(&config).unwrap();
//! assert_eq!(provider.name(), "hash");
//! ```

use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::Value;

pub use knowledge_core::embedding::{
    Embedder, EmbeddingFunc, EmbeddingModelProvider, HashEmbeddingProvider,
};
use knowledge_core::embedding::normalize;
use knowledge_core::models::EmbeddingsProviderConfig;

use crate::config::EmbeddingConfig;
use crate::http;

const DEFAULT_HASH_DIMS: usize = 256;

/// Build and configure the provider named in `config`.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Box<dyn EmbeddingModelProvider>> {
    let mut provider: Box<dyn EmbeddingModelProvider> = match config.provider.as_str() {
        OpenAIProvider::NAME => Box::new(OpenAIProvider::new(config)),
        OllamaProvider::NAME => Box::new(OllamaProvider::new(config)),
        HashEmbeddingProvider::NAME => Box::new(HashEmbeddingProvider::new(
            config.model.clone().unwrap_or_default(),
            config.dims.unwrap_or(DEFAULT_HASH_DIMS),
        )),
        other => bail!("Unknown embedding provider: {}", other),
    };
    provider.configure()?;
    if provider.name() == HashEmbeddingProvider::NAME {
        tracing::warn!(
            model = provider.embedding_model_name(),
            "hash embedding provider in use: vectors are hashed tokens, not semantic \
             embeddings; set [embedding] provider to \"openai\" or \"ollama\" for semantic search"
        );
    }
    tracing::debug!(
        provider = provider.name(),
        model = provider.embedding_model_name(),
        "embedding provider ready"
    );
    Ok(provider)
}

fn first_embedding(mut vectors: Vec<Vec<f32>>) -> Result<Vec<f32>> {
    if vectors.is_empty() {
        bail!("Empty embedding response");
    }
    let mut vec = vectors.swap_remove(0);
    normalize(&mut vec);
    Ok(vec)
}

// ============ OpenAI Provider ============

/// Embedding provider using the OpenAI API.
///
/// Calls the `POST /v1/embeddings` endpoint with the configured model.
/// Requires the `OPENAI_API_KEY` environment variable at embed time.
#[derive(Debug, Clone)]
pub struct OpenAIProvider {
    model: String,
    dims: Option<usize>,
    timeout_secs: u64,
    max_retries: u32,
    api_key: Option<String>,
}

impl OpenAIProvider {
    pub const NAME: &'static str = "openai";
    pub const DEFAULT_MODEL: &'static str = "text-embedding-3-small";

    pub fn new(config: &EmbeddingConfig) -> Self {
        Self {
            model: config.model.clone().unwrap_or_default(),
            dims: config.dims,
            timeout_secs: config.timeout_secs,
            max_retries: config.max_retries,
            api_key: None,
        }
    }
}

impl EmbeddingModelProvider for OpenAIProvider {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn embedding_model_name(&self) -> &str {
        &self.model
    }

    fn use_embedding_model(&mut self, model: &str) {
        self.model = model.to_string();
    }

    fn embedding_func(&self) -> Result<EmbeddingFunc> {
        Ok(Arc::new(OpenAIEmbedder {
            client: http::client(self.timeout_secs)?,
            model: self.model.clone(),
            dims: self.dims,
            max_retries: self.max_retries,
            api_key: self.api_key.clone(),
        }))
    }

    fn configure(&mut self) -> Result<()> {
        if self.model.is_empty() {
            self.model = Self::DEFAULT_MODEL.to_string();
        }
        if self.api_key.is_none() {
            self.api_key = std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty());
        }
        Ok(())
    }

    fn config(&self) -> EmbeddingsProviderConfig {
        let mut config = serde_json::Map::new();
        config.insert("model".into(), self.model.clone().into());
        if let Some(dims) = self.dims {
            config.insert("dims".into(), (dims as u64).into());
        }
        EmbeddingsProviderConfig {
            provider_type: Self::NAME.to_string(),
            config,
        }
    }

    fn required_fields(&self) -> &'static [&'static str] {
        &["model", "dims"]
    }

    fn clone_box(&self) -> Box<dyn EmbeddingModelProvider> {
        Box::new(self.clone())
    }
}

struct OpenAIEmbedder {
    client: reqwest::Client,
    model: String,
    dims: Option<usize>,
    max_retries: u32,
    api_key: Option<String>,
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| anyhow!("OPENAI_API_KEY environment variable not set"))?;

        let mut body = serde_json::json!({
            "model": self.model,
            "input": [text],
        });
        if let Some(dims) = self.dims {
            body["dimensions"] = dims.into();
        }

        let json = http::send_json_with_retry("OpenAI", self.max_retries, || {
            self.client
                .post("https://api.openai.com/v1/embeddings")
                .header("Authorization", format!("Bearer {}", api_key))
                .header("Content-Type", "application/json")
                .json(&body)
        })
        .await?;
        first_embedding(parse_openai_response(&json)?)
    }
}

/// Extract the `data[].embedding` arrays, in input order.
fn parse_openai_response(json: &Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow!("Invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let vec = item
            .get("embedding")
            .and_then(http::f32_array)
            .ok_or_else(|| anyhow!("Invalid OpenAI response: missing embedding"))?;
        let index = item
            .get("index")
            .and_then(Value::as_u64)
            .map(|i| i as usize)
            .unwrap_or(pos);
        indexed.push((index, vec));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama Provider ============

/// Embedding provider using a local Ollama instance.
///
/// Calls `POST /api/embed` on the configured URL (default:
/// `http://localhost:11434`). Requires an embedding model pulled into
/// Ollama (e.g. `ollama pull nomic-embed-text`).
#[derive(Debug, Clone)]
pub struct OllamaProvider {
    model: String,
    url: String,
    timeout_secs: u64,
    max_retries: u32,
}

impl OllamaProvider {
    pub const NAME: &'static str = "ollama";
    pub const DEFAULT_MODEL: &'static str = "nomic-embed-text";
    pub const DEFAULT_URL: &'static str = "http://localhost:11434";

    pub fn new(config: &EmbeddingConfig) -> Self {
        Self {
            model: config.model.clone().unwrap_or_default(),
            url: config.url.clone().unwrap_or_default(),
            timeout_secs: config.timeout_secs,
            max_retries: config.max_retries,
        }
    }
}

impl EmbeddingModelProvider for OllamaProvider {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn embedding_model_name(&self) -> &str {
        &self.model
    }

    fn use_embedding_model(&mut self, model: &str) {
        self.model = model.to_string();
    }

    fn embedding_func(&self) -> Result<EmbeddingFunc> {
        Ok(Arc::new(OllamaEmbedder {
            client: http::client(self.timeout_secs)?,
            model: self.model.clone(),
            url: self.url.trim_end_matches('/').to_string(),
            max_retries: self.max_retries,
        }))
    }

    fn configure(&mut self) -> Result<()> {
        if self.model.is_empty() {
            self.model = Self::DEFAULT_MODEL.to_string();
        }
        if self.url.is_empty() {
            self.url = std::env::var("OLLAMA_HOST")
                .ok()
                .filter(|u| !u.is_empty())
                .unwrap_or_else(|| Self::DEFAULT_URL.to_string());
        }
        Ok(())
    }

    fn config(&self) -> EmbeddingsProviderConfig {
        let mut config = serde_json::Map::new();
        config.insert("model".into(), self.model.clone().into());
        config.insert("url".into(), self.url.clone().into());
        EmbeddingsProviderConfig {
            provider_type: Self::NAME.to_string(),
            config,
        }
    }

    fn clone_box(&self) -> Box<dyn EmbeddingModelProvider> {
        Box::new(self.clone())
    }
}

struct OllamaEmbedder {
    client: reqwest::Client,
    model: String,
    url: String,
    max_retries: u32,
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": [text],
        });
        let endpoint = format!("{}/api/embed", self.url);
        let json = http::send_json_with_retry("Ollama", self.max_retries, || {
            self.client
                .post(&endpoint)
                .header("Content-Type", "application/json")
                .json(&body)
        })
        .await
        .map_err(|e| anyhow!("{} (is Ollama running at {}?)", e, self.url))?;
        first_embedding(parse_ollama_response(&json)?)
    }
}

fn parse_ollama_response(json: &Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow!("Invalid Ollama response: missing embeddings array"))?;

    embeddings
        .iter()
        .map(|e| {
            http::f32_array(e)
                .ok_or_else(|| anyhow!("Invalid Ollama response: embedding is not an array"))
        })
        .collect()
}
