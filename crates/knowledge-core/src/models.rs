//! Core data models used throughout Knowledge.
//!
//! These types represent the chunks, files, and datasets that flow through
//! the ingestion and retrieval pipeline. Storage backends own every record;
//! these are plain values.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Open metadata map attached to every [`Document`].
pub type Metadata = serde_json::Map<String, Value>;

/// Well-known metadata keys. Everything the engine reads or writes in
/// [`Document::metadata`] goes through one of these.
pub mod keys {
    pub const DOC_INDEX: &str = "docIndex";
    pub const DOCS_TOTAL: &str = "docsTotal";
    pub const EMBEDDING_MODEL: &str = "embeddingModel";
    pub const FILE_CHECKSUM: &str = "fileChecksum";
    pub const ABS_PATH: &str = "absPath";
    pub const FILENAME: &str = "filename";
    pub const FILE_SIZE: &str = "fileSize";
    /// Stamped on search results, never persisted.
    pub const DATASET_ID: &str = "datasetID";
    /// Stamped by the re-ranking postprocessor.
    pub const RERANK_RELEVANCE_SCORE: &str = "rerankRelevanceScore";

    /// Keys the ingestion pipeline owns. Caller-supplied extra metadata
    /// never overwrites these.
    pub const RESERVED: &[&str] = &[
        DOC_INDEX,
        DOCS_TOTAL,
        EMBEDDING_MODEL,
        FILE_CHECKSUM,
        ABS_PATH,
        FILENAME,
        FILE_SIZE,
    ];
}

/// One retrievable content chunk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub metadata: Metadata,
    /// Populated by similarity search; backends do not persist it.
    #[serde(default)]
    pub similarity_score: f32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub embedding: Vec<f32>,
}

impl Document {
    /// A fresh chunk with a random UUID and no metadata.
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn set_metadata(&mut self, key: &str, value: impl Into<Value>) {
        self.metadata.insert(key.to_string(), value.into());
    }

    /// Position of this chunk within its file, if stamped.
    ///
    /// Accepts both integer and float encodings (JSON round-trips may turn
    /// one into the other).
    pub fn doc_index(&self) -> Option<i64> {
        match self.metadata.get(keys::DOC_INDEX)? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            _ => None,
        }
    }

    pub fn docs_total(&self) -> Option<i64> {
        self.metadata.get(keys::DOCS_TOTAL).and_then(Value::as_i64)
    }

    pub fn embedding_model(&self) -> Option<&str> {
        self.metadata.get(keys::EMBEDDING_MODEL).and_then(Value::as_str)
    }

    pub fn abs_path(&self) -> Option<&str> {
        self.metadata.get(keys::ABS_PATH).and_then(Value::as_str)
    }

    pub fn file_checksum(&self) -> Option<&str> {
        self.metadata.get(keys::FILE_CHECKSUM).and_then(Value::as_str)
    }

    pub fn filename(&self) -> Option<&str> {
        self.metadata.get(keys::FILENAME).and_then(Value::as_str)
    }

    /// Read a metadata value as a string for equality filtering.
    ///
    /// Strings compare by content, every other JSON value by its compact
    /// JSON rendering (`3`, `true`).
    pub fn metadata_str(&self, key: &str) -> Option<String> {
        self.metadata.get(key).map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}

/// Sort by similarity score, best first.
pub fn sort_by_similarity(docs: &mut [Document]) {
    docs.sort_by(|a, b| {
        b.similarity_score
            .partial_cmp(&a.similarity_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

/// Order chunks by their existing `docIndex` and re-stamp `docIndex` /
/// `docsTotal` to match the final order.
///
/// Chunks without a `docIndex` are treated as already in place: they keep
/// their slot, and only the chunks carrying an index are reordered among
/// the slots they occupy. The reorder is stable, so running this twice is
/// a no-op the second time.
pub fn sort_and_ensure_doc_index(docs: &mut [Document]) {
    let indexed_slots: Vec<usize> = docs
        .iter()
        .enumerate()
        .filter(|(_, d)| d.doc_index().is_some())
        .map(|(i, _)| i)
        .collect();

    if indexed_slots.len() > 1 {
        let mut indexed: Vec<Document> = indexed_slots
            .iter()
            .map(|&i| std::mem::take(&mut docs[i]))
            .collect();
        indexed.sort_by_key(|d| d.doc_index().unwrap_or_default());
        for (slot, doc) in indexed_slots.into_iter().zip(indexed) {
            docs[slot] = doc;
        }
    }

    let total = docs.len();
    for (i, doc) in docs.iter_mut().enumerate() {
        doc.set_metadata(keys::DOC_INDEX, i as i64);
        doc.set_metadata(keys::DOCS_TOTAL, total as i64);
    }
}

/// Embedding provider configuration recorded on a dataset.
///
/// `config` carries the provider's exported fields, `model` among them.
/// Secrets are never recorded here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingsProviderConfig {
    #[serde(rename = "type")]
    pub provider_type: String,
    #[serde(default)]
    pub config: serde_json::Map<String, Value>,
}

impl EmbeddingsProviderConfig {
    pub fn model_name(&self) -> Option<&str> {
        self.config.get("model").and_then(Value::as_str)
    }

    /// Names of the given fields whose values differ between two configs.
    pub fn mismatched_fields<'a>(&self, other: &Self, fields: &[&'a str]) -> Vec<&'a str> {
        fields
            .iter()
            .copied()
            .filter(|f| self.config.get(*f) != other.config.get(*f))
            .collect()
    }
}

/// A named collection of files sharing one embedding configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embeddings_provider_config: Option<EmbeddingsProviderConfig>,
}

impl Dataset {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            embeddings_provider_config: None,
        }
    }

    pub fn embedding_model_name(&self) -> Option<&str> {
        self.embeddings_provider_config
            .as_ref()
            .and_then(|c| c.model_name())
    }
}

/// Source-file attributes. Empty fields act as wildcards when used as a
/// lookup filter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub name: String,
    pub absolute_path: String,
    pub size: i64,
    pub modified_at: Option<DateTime<Utc>>,
    pub checksum: String,
}

/// Reference from a file to one of its stored chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileDocument {
    pub id: String,
    pub file_id: String,
    pub dataset: String,
    pub index: i64,
}

/// A logical source file that produced one or more chunks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct File {
    pub id: String,
    pub dataset: String,
    pub metadata: FileMetadata,
    #[serde(default)]
    pub documents: Vec<FileDocument>,
}

/// Results for a single query of a retrieval run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryResponse {
    pub query: String,
    pub num_results: usize,
    pub result_documents: Vec<Document>,
}

/// Everything a retrieval run returns, before and after postprocessing.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetrievalResponse {
    pub datasets: Vec<String>,
    pub responses: Vec<QueryResponse>,
}
