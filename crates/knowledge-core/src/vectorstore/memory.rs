//! In-memory [`Vectorstore`] for tests and ephemeral use (`memory://`).
//!
//! Collections are insertion-ordered `Vec`s behind a `std::sync::RwLock`.
//! Similarity search is brute-force cosine similarity over the collection.
//! The lock is never held across an `.await`: embeddings are computed
//! before the write lock is taken.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::embedding::EmbeddingFunc;
use crate::filter::{MetadataFilter, WhereDocument};
use crate::models::Document;

use super::{
    ensure_targeted_removal, passes_filters, prepare_documents, rank_by_similarity,
    CollectionExport, ExportFile, Vectorstore,
};

type Collections = BTreeMap<String, Vec<Document>>;

/// In-memory vectorstore.
pub struct InMemoryVectorstore {
    collections: RwLock<Collections>,
    default_embedder: EmbeddingFunc,
}

impl InMemoryVectorstore {
    pub fn new(default_embedder: EmbeddingFunc) -> Self {
        Self {
            collections: RwLock::new(Collections::new()),
            default_embedder,
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Collections>> {
        self.collections
            .read()
            .map_err(|_| anyhow!("vectorstore lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Collections>> {
        self.collections
            .write()
            .map_err(|_| anyhow!("vectorstore lock poisoned"))
    }

    fn embedder(&self, embedder: Option<EmbeddingFunc>) -> EmbeddingFunc {
        embedder.unwrap_or_else(|| self.default_embedder.clone())
    }
}

#[async_trait]
impl Vectorstore for InMemoryVectorstore {
    async fn create_collection(&self, collection: &str) -> Result<()> {
        self.write()?.entry(collection.to_string()).or_default();
        Ok(())
    }

    async fn add_documents(
        &self,
        mut docs: Vec<Document>,
        collection: &str,
        embedder: Option<EmbeddingFunc>,
    ) -> Result<Vec<String>> {
        let embedder = self.embedder(embedder);
        prepare_documents(&mut docs, embedder.as_ref()).await?;

        let ids: Vec<String> = docs.iter().map(|d| d.id.clone()).collect();
        let mut collections = self.write()?;
        let stored = collections.entry(collection.to_string()).or_default();
        for mut doc in docs {
            doc.similarity_score = 0.0;
            match stored.iter_mut().find(|d| d.id == doc.id) {
                Some(existing) => *existing = doc,
                None => stored.push(doc),
            }
        }
        Ok(ids)
    }

    async fn similarity_search(
        &self,
        query: &str,
        k: usize,
        collection: &str,
        metadata_filter: &MetadataFilter,
        content_filter: &[WhereDocument],
        embedder: Option<EmbeddingFunc>,
    ) -> Result<Vec<Document>> {
        let query_vec = self.embedder(embedder).embed(query).await?;
        let candidates: Vec<Document> = {
            let collections = self.read()?;
            let stored = collections
                .get(collection)
                .ok_or_else(|| anyhow!("collection {:?} does not exist", collection))?;
            stored
                .iter()
                .filter(|d| passes_filters(d, metadata_filter, content_filter))
                .cloned()
                .collect()
        };
        Ok(rank_by_similarity(&query_vec, candidates, k))
    }

    async fn remove_collection(&self, collection: &str) -> Result<()> {
        self.write()?.remove(collection);
        Ok(())
    }

    async fn remove_document(
        &self,
        document_id: Option<&str>,
        collection: &str,
        metadata_filter: &MetadataFilter,
        content_filter: &[WhereDocument],
    ) -> Result<()> {
        ensure_targeted_removal(document_id, metadata_filter, content_filter)?;
        let document_id = document_id.filter(|id| !id.is_empty());
        let mut collections = self.write()?;
        if let Some(stored) = collections.get_mut(collection) {
            stored.retain(|d| {
                let targeted = document_id.map_or(true, |id| d.id == id)
                    && passes_filters(d, metadata_filter, content_filter);
                !targeted
            });
        }
        Ok(())
    }

    async fn get_document(&self, document_id: &str, collection: &str) -> Result<Option<Document>> {
        let collections = self.read()?;
        Ok(collections
            .get(collection)
            .and_then(|stored| stored.iter().find(|d| d.id == document_id))
            .cloned())
    }

    async fn get_documents(
        &self,
        collection: Option<&str>,
        metadata_filter: &MetadataFilter,
        content_filter: &[WhereDocument],
    ) -> Result<Vec<Document>> {
        let collections = self.read()?;
        let docs = collections
            .iter()
            .filter(|(name, _)| collection.map_or(true, |c| c == name.as_str()))
            .flat_map(|(_, stored)| stored.iter())
            .filter(|d| passes_filters(d, metadata_filter, content_filter))
            .cloned()
            .collect();
        Ok(docs)
    }

    async fn import_collections_from_file(&self, path: &Path, collections: &[String]) -> Result<()> {
        let mut export = ExportFile::read(path)?;
        export.retain_collections(collections);
        let mut stored = self.write()?;
        for c in export.collections {
            let target = stored.entry(c.name).or_default();
            for doc in c.documents {
                target.retain(|d| d.id != doc.id);
                target.push(doc);
            }
        }
        Ok(())
    }

    async fn export_collections_to_file(&self, path: &Path, collections: &[String]) -> Result<()> {
        let mut export = ExportFile {
            collections: self
                .read()?
                .iter()
                .map(|(name, docs)| CollectionExport {
                    name: name.clone(),
                    documents: docs.clone(),
                })
                .collect(),
        };
        export.retain_collections(collections);
        export.write(path)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{EmbeddingModelProvider, HashEmbeddingProvider};

    fn store() -> (InMemoryVectorstore, HashEmbeddingProvider) {
        let provider = HashEmbeddingProvider::new("test-model", 64);
        let vs = InMemoryVectorstore::new(provider.embedding_func().unwrap());
        (vs, provider)
    }

    #[tokio::test]
    async fn test_add_assigns_ids_and_embeds() {
        let (vs, provider) = store();
        let mut pre = Document::new("already embedded");
        pre.embedding = vec![1.0; 64];
        let mut blank = Document::new("needs vector");
        blank.id = String::new();

        let ids = vs.add_documents(vec![pre, blank], "ds", None).await.unwrap();
        assert_eq!(ids.len(), 2);
        assert!(!ids[1].is_empty());
        assert_eq!(provider.embed_calls(), 1);

        let stored = vs.get_document(&ids[1], "ds").await.unwrap().unwrap();
        assert_eq!(stored.embedding.len(), 64);
        assert!(vs.get_document("missing", "ds").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_similarity_search_with_filters() {
        let (vs, _) = store();
        vs.add_documents(
            vec![
                Document::new("rust borrow checker").with_metadata("lang", "rust"),
                Document::new("python garbage collector").with_metadata("lang", "python"),
                Document::new("rust async runtime").with_metadata("lang", "rust"),
            ],
            "ds",
            None,
        )
        .await
        .unwrap();

        let results = vs
            .similarity_search("rust borrow", 5, "ds", &MetadataFilter::new(), &[], None)
            .await
            .unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].content, "rust borrow checker");
        assert!(results[0].similarity_score >= results[1].similarity_score);

        let mut meta = MetadataFilter::new();
        meta.insert("lang".into(), "rust".into());
        let filtered = vs
            .similarity_search(
                "rust",
                5,
                "ds",
                &meta,
                &[WhereDocument::NotContains("async".into())],
                None,
            )
            .await
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].content, "rust borrow checker");
    }

    #[tokio::test]
    async fn test_remove_document_by_filter_and_guard() {
        let (vs, _) = store();
        vs.add_documents(
            vec![
                Document::new("a").with_metadata("absPath", "/x"),
                Document::new("b").with_metadata("absPath", "/y"),
            ],
            "ds",
            None,
        )
        .await
        .unwrap();

        assert!(vs
            .remove_document(None, "ds", &MetadataFilter::new(), &[])
            .await
            .is_err());

        let mut meta = MetadataFilter::new();
        meta.insert("absPath".into(), "/x".into());
        vs.remove_document(None, "ds", &meta, &[]).await.unwrap();
        let left = vs
            .get_documents(Some("ds"), &MetadataFilter::new(), &[])
            .await
            .unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].content, "b");
    }

    #[tokio::test]
    async fn test_export_import() {
        let (vs, _) = store();
        vs.add_documents(vec![Document::new("kept")], "a", None)
            .await
            .unwrap();
        vs.add_documents(vec![Document::new("skipped")], "b", None)
            .await
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.json");
        vs.export_collections_to_file(&path, &["a".to_string()])
            .await
            .unwrap();

        let (other, _) = store();
        other.import_collections_from_file(&path, &[]).await.unwrap();
        let docs = other
            .get_documents(None, &MetadataFilter::new(), &[])
            .await
            .unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].content, "kept");
        assert_eq!(docs[0].embedding.len(), 64);
    }
}
