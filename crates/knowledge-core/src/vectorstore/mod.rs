//! Vectorstore port: persistence and similarity search for embedded chunks.
//!
//! The [`Vectorstore`] trait is the storage contract for [`Document`]s
//! grouped into collections (one collection per dataset). Backends are
//! selected once by connection-string scheme; the in-memory backend lives
//! in [`memory`], the SQLite backend in the `knowledge` app crate.
//!
//! Implementations must be `Send + Sync` to work with async runtimes. All
//! methods return `anyhow::Result`; the engine attaches operation context
//! when it surfaces a failure.

pub mod memory;

use std::path::Path;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::embedding::{cosine_similarity, Embedder, EmbeddingFunc};
use crate::filter::{matches_all, matches_metadata, MetadataFilter, WhereDocument};
use crate::models::Document;

/// Storage contract for embedded chunks.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`create_collection`](Vectorstore::create_collection) | Create a collection if missing |
/// | [`add_documents`](Vectorstore::add_documents) | Embed (where needed) and store chunks |
/// | [`similarity_search`](Vectorstore::similarity_search) | Top-k cosine search with filters |
/// | [`remove_collection`](Vectorstore::remove_collection) | Drop a collection and its chunks |
/// | [`remove_document`](Vectorstore::remove_document) | Delete by id and/or filters |
/// | [`get_document`](Vectorstore::get_document) | Fetch one chunk with its embedding |
/// | [`get_documents`](Vectorstore::get_documents) | Fetch chunks matching filters |
/// | [`export_collections_to_file`](Vectorstore::export_collections_to_file) | Dump collections as JSON |
/// | [`import_collections_from_file`](Vectorstore::import_collections_from_file) | Load a JSON dump |
#[async_trait]
pub trait Vectorstore: Send + Sync {
    async fn create_collection(&self, collection: &str) -> Result<()>;

    /// Store chunks, returning their ids in input order.
    ///
    /// Chunks without an id get a fresh one; chunks without an embedding
    /// are embedded with `embedder`, or the store default when `None`.
    async fn add_documents(
        &self,
        docs: Vec<Document>,
        collection: &str,
        embedder: Option<EmbeddingFunc>,
    ) -> Result<Vec<String>>;

    /// Return up to `k` chunks ordered by cosine similarity to `query`,
    /// restricted to chunks passing both filters. `similarity_score` is set
    /// on every result.
    async fn similarity_search(
        &self,
        query: &str,
        k: usize,
        collection: &str,
        metadata_filter: &MetadataFilter,
        content_filter: &[WhereDocument],
        embedder: Option<EmbeddingFunc>,
    ) -> Result<Vec<Document>>;

    async fn remove_collection(&self, collection: &str) -> Result<()>;

    /// Delete one chunk by id, or every chunk passing the filters.
    ///
    /// A call with no id and no filters is rejected rather than wiping the
    /// collection.
    async fn remove_document(
        &self,
        document_id: Option<&str>,
        collection: &str,
        metadata_filter: &MetadataFilter,
        content_filter: &[WhereDocument],
    ) -> Result<()>;

    /// Fetch one chunk, embedding included. `Ok(None)` when absent.
    async fn get_document(&self, document_id: &str, collection: &str) -> Result<Option<Document>>;

    /// Fetch every chunk passing the filters; `None` searches all
    /// collections.
    async fn get_documents(
        &self,
        collection: Option<&str>,
        metadata_filter: &MetadataFilter,
        content_filter: &[WhereDocument],
    ) -> Result<Vec<Document>>;

    async fn import_collections_from_file(&self, path: &Path, collections: &[String]) -> Result<()>;

    async fn export_collections_to_file(&self, path: &Path, collections: &[String]) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// One collection in an export file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionExport {
    pub name: String,
    pub documents: Vec<Document>,
}

/// JSON export format shared by all backends.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExportFile {
    pub collections: Vec<CollectionExport>,
}

impl ExportFile {
    pub fn read(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Keep only the named collections; an empty list keeps everything.
    pub fn retain_collections(&mut self, collections: &[String]) {
        if !collections.is_empty() {
            self.collections.retain(|c| collections.contains(&c.name));
        }
    }
}

/// Reject a removal that would match every chunk.
pub fn ensure_targeted_removal(
    document_id: Option<&str>,
    metadata_filter: &MetadataFilter,
    content_filter: &[WhereDocument],
) -> Result<()> {
    let has_id = document_id.is_some_and(|id| !id.is_empty());
    if !has_id && metadata_filter.is_empty() && content_filter.is_empty() {
        bail!("refusing to remove documents without an id or a filter");
    }
    Ok(())
}

/// Give every chunk an id and an embedding.
pub async fn prepare_documents(docs: &mut [Document], embedder: &dyn Embedder) -> Result<()> {
    for doc in docs.iter_mut() {
        if doc.id.is_empty() {
            doc.id = uuid::Uuid::new_v4().to_string();
        }
        if doc.embedding.is_empty() {
            doc.embedding = embedder.embed(&doc.content).await?;
        }
    }
    Ok(())
}

/// True when a chunk passes both the metadata and the content filters.
pub fn passes_filters(
    doc: &Document,
    metadata_filter: &MetadataFilter,
    content_filter: &[WhereDocument],
) -> bool {
    matches_metadata(metadata_filter, doc) && matches_all(content_filter, doc)
}

/// Score candidates against a query vector and keep the best `k`.
///
/// Returned chunks carry their `similarity_score`; embeddings are dropped
/// from the results.
pub fn rank_by_similarity(
    query_vec: &[f32],
    candidates: impl IntoIterator<Item = Document>,
    k: usize,
) -> Vec<Document> {
    let mut scored: Vec<Document> = candidates
        .into_iter()
        .map(|mut doc| {
            doc.similarity_score = cosine_similarity(query_vec, &doc.embedding);
            doc.embedding = Vec::new();
            doc
        })
        .collect();
    crate::models::sort_by_similarity(&mut scored);
    scored.truncate(k);
    scored
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_removal_requires_target() {
        let empty = MetadataFilter::new();
        assert!(ensure_targeted_removal(None, &empty, &[]).is_err());
        assert!(ensure_targeted_removal(Some(""), &empty, &[]).is_err());
        assert!(ensure_targeted_removal(Some("id"), &empty, &[]).is_ok());
        assert!(
            ensure_targeted_removal(None, &empty, &[WhereDocument::Contains("x".into())]).is_ok()
        );
    }

    #[test]
    fn test_rank_by_similarity_orders_and_truncates() {
        let docs = vec![
            Document {
                embedding: vec![0.0, 1.0],
                ..Document::new("far")
            },
            Document {
                embedding: vec![1.0, 0.0],
                ..Document::new("near")
            },
            Document {
                embedding: vec![0.7, 0.7],
                ..Document::new("mid")
            },
        ];
        let ranked = rank_by_similarity(&[1.0, 0.0], docs, 2);
        let contents: Vec<&str> = ranked.iter().map(|d| d.content.as_str()).collect();
        assert_eq!(contents, vec!["near", "mid"]);
        assert!((ranked[0].similarity_score - 1.0).abs() < 1e-6);
        assert!(ranked.iter().all(|d| d.embedding.is_empty()));
    }

    #[test]
    fn test_export_file_retain() {
        let mut export = ExportFile {
            collections: vec![
                CollectionExport {
                    name: "a".into(),
                    documents: vec![],
                },
                CollectionExport {
                    name: "b".into(),
                    documents: vec![],
                },
            ],
        };
        export.retain_collections(&[]);
        assert_eq!(export.collections.len(), 2);
        export.retain_collections(&["b".to_string()]);
        assert_eq!(export.collections.len(), 1);
        assert_eq!(export.collections[0].name, "b");
    }
}
