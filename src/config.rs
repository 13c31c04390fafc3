//! TOML configuration for the `know` binary and the [`Datastore`](crate::datastore::Datastore).
//!
//! Every section is optional; missing values fall back to the defaults
//! below. [`load_config`] validates the result and applies the `KNOW_*`
//! environment overrides.
//!
//! ```toml
//! [index]
//! dsn = "sqlite://data/knowledge.sqlite"
//!
//! [vectorstore]
//! dsn = "sqlite://data/knowledge.sqlite"
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-small"
//!
//! [ingestion]
//! reuse_files = true
//! is_duplicate = "ignore"
//!
//! [[ingestion.flows]]
//! filetypes = ["text/markdown"]
//! splitter = { name = "markdown", options = { max_tokens = 400 } }
//! transformers = [{ name = "filter_markdown_docs_no_content" }]
//!
//! [[ingestion.flows]]
//! filetypes = ["application/octet-stream"]
//! loader = "text"
//!
//! [retrieval]
//! top_k = 8
//! retriever = "merging"
//!
//! [[retrieval.postprocessors]]
//! name = "similarity"
//! options = { threshold = 0.3 }
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;

/// Env switch: prefer the configured embedding model over a dataset's.
pub const ENV_PREFER_NEW_EMBEDDING_MODEL: &str = "KNOW_PREFER_NEW_EMBEDDING_MODEL";
/// Env switch: fail ingestion on non-model embedding config mismatches.
pub const ENV_STRICT_EMBEDDING_CONFIG_CHECK: &str = "KNOW_STRICT_EMBEDDING_CONFIG_CHECK";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub index: BackendConfig,
    #[serde(default)]
    pub vectorstore: BackendConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub ingestion: IngestionConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
}

/// Connection string of a storage backend: `sqlite://<path>` or `memory://`.
#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    #[serde(default = "default_dsn")]
    pub dsn: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self { dsn: default_dsn() }
    }
}

fn default_dsn() -> String {
    "sqlite://data/knowledge.sqlite".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Base URL, for providers that talk to a local server.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub prefer_new_model: bool,
    #[serde(default)]
    pub strict_config_check: bool,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            url: None,
            dims: None,
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            prefer_new_model: false,
            strict_config_check: false,
        }
    }
}

fn default_provider() -> String {
    "hash".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestionConfig {
    #[serde(default)]
    pub reuse_files: bool,
    #[serde(default)]
    pub reuse_embeddings: bool,
    /// Name of the duplicate check, see [`crate::dedupe`].
    #[serde(default = "default_is_duplicate")]
    pub is_duplicate: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default)]
    pub overlap_tokens: usize,
    #[serde(default)]
    pub flows: Vec<FlowConfig>,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            reuse_files: false,
            reuse_embeddings: false,
            is_duplicate: default_is_duplicate(),
            max_tokens: default_max_tokens(),
            overlap_tokens: 0,
            flows: Vec::new(),
        }
    }
}

fn default_is_duplicate() -> String {
    "upsert".to_string()
}
fn default_max_tokens() -> usize {
    knowledge_core::splitter::DEFAULT_MAX_TOKENS
}

/// Ingestion flow override for a set of filetypes.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct FlowConfig {
    pub filetypes: Vec<String>,
    /// Loader name; unset means the filetype's built-in loader.
    #[serde(default)]
    pub loader: Option<String>,
    #[serde(default)]
    pub splitter: Option<ComponentConfig>,
    #[serde(default)]
    pub transformers: Vec<ComponentConfig>,
}

/// A named registry entry with free-form options.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ComponentConfig {
    pub name: String,
    #[serde(default)]
    pub options: serde_json::Map<String, Value>,
}

impl ComponentConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            options: serde_json::Map::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_retriever")]
    pub retriever: String,
    #[serde(default)]
    pub retriever_options: serde_json::Map<String, Value>,
    #[serde(default)]
    pub postprocessors: Vec<ComponentConfig>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            retriever: default_retriever(),
            retriever_options: serde_json::Map::new(),
            postprocessors: Vec::new(),
        }
    }
}

fn default_top_k() -> usize {
    knowledge_core::retrievers::DEFAULT_TOP_K
}
fn default_retriever() -> String {
    "basic".to_string()
}

/// Read, parse and validate a config file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate config text, then apply environment overrides.
pub fn parse_config(content: &str) -> Result<Config> {
    let mut config: Config =
        toml::from_str(content).with_context(|| "Failed to parse config file")?;
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

impl Config {
    /// A non-empty `KNOW_*` switch turns the matching option on.
    pub fn apply_env_overrides(&mut self) {
        if env_flag(ENV_PREFER_NEW_EMBEDDING_MODEL) {
            self.embedding.prefer_new_model = true;
        }
        if env_flag(ENV_STRICT_EMBEDDING_CONFIG_CHECK) {
            self.embedding.strict_config_check = true;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.ingestion.max_tokens == 0 {
            bail!("ingestion.max_tokens must be > 0");
        }
        if self.ingestion.overlap_tokens >= self.ingestion.max_tokens {
            bail!("ingestion.overlap_tokens must be smaller than ingestion.max_tokens");
        }
        if self.retrieval.top_k < 1 {
            bail!("retrieval.top_k must be >= 1");
        }

        match self.embedding.provider.as_str() {
            "openai" | "ollama" | "hash" => {}
            other => bail!(
                "Unknown embedding provider: '{}'. Must be openai, ollama, or hash.",
                other
            ),
        }
        if self.embedding.dims == Some(0) {
            bail!("embedding.dims must be > 0 when set");
        }

        for (i, flow) in self.ingestion.flows.iter().enumerate() {
            if flow.filetypes.is_empty() {
                bail!("ingestion.flows[{}] must list at least one filetype", i);
            }
        }
        Ok(())
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name).map(|v| !v.is_empty()).unwrap_or(false)
}

/// Config written by `know init`.
pub const DEFAULT_CONFIG: &str = r#"# Knowledge configuration

[index]
dsn = "sqlite://data/knowledge.sqlite"

[vectorstore]
dsn = "sqlite://data/knowledge.sqlite"

[embedding]
# openai | ollama | hash (offline token hashing, not semantic)
provider = "hash"
dims = 256

[ingestion]
reuse_files = true
reuse_embeddings = true
is_duplicate = "upsert"
max_tokens = 700

[retrieval]
top_k = 10
retriever = "basic"
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.index.dsn, "sqlite://data/knowledge.sqlite");
        assert_eq!(config.embedding.provider, "hash");
        assert_eq!(config.ingestion.is_duplicate, "upsert");
        assert_eq!(config.retrieval.top_k, 10);
        assert_eq!(config.retrieval.retriever, "basic");
    }

    #[test]
    fn test_default_config_parses() {
        let config = parse_config(DEFAULT_CONFIG).unwrap();
        assert!(config.ingestion.reuse_files);
        assert_eq!(config.embedding.dims, Some(256));
    }

    #[test]
    fn test_flows_and_postprocessors() {
        let config = parse_config(
            r#"
[[ingestion.flows]]
filetypes = ["text/markdown"]
splitter = { name = "markdown", options = { max_tokens = 400 } }
transformers = [{ name = "filter_markdown_docs_no_content" }]

[[ingestion.flows]]
filetypes = ["application/octet-stream"]
loader = "text"

[retrieval]
retriever = "merging"
retriever_options = { top_k = 4 }

[[retrieval.postprocessors]]
name = "similarity"
options = { threshold = 0.3 }
"#,
        )
        .unwrap();
        let flow = &config.ingestion.flows[0];
        assert_eq!(flow.filetypes, vec!["text/markdown"]);
        assert!(flow.loader.is_none());
        assert_eq!(config.ingestion.flows[1].loader.as_deref(), Some("text"));
        let splitter = flow.splitter.as_ref().unwrap();
        assert_eq!(splitter.options.get("max_tokens"), Some(&Value::from(400)));
        assert_eq!(config.retrieval.postprocessors[0].name, "similarity");
        assert_eq!(
            config.retrieval.retriever_options.get("top_k"),
            Some(&Value::from(4))
        );
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(parse_config("[embedding]\nprovider = \"magic\"\n").is_err());
        assert!(parse_config("[ingestion]\nmax_tokens = 0\n").is_err());
        assert!(parse_config("[ingestion]\nmax_tokens = 10\noverlap_tokens = 10\n").is_err());
        assert!(parse_config("[retrieval]\ntop_k = 0\n").is_err());
        assert!(parse_config("[[ingestion.flows]]\nfiletypes = []\n").is_err());
    }
}
