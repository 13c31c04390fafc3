//! The datastore façade: ingestion, retrieval and management over one
//! [`Index`] and one [`Vectorstore`].
//!
//! A [`Datastore`] owns no document state. It holds the two backend
//! handles, the shared embedding provider and its [`DatastoreOptions`];
//! every record lives in the backends.
//!
//! Each dataset maps to one vectorstore collection of the same name.
//! Searches and ingestions embed with the dataset's recorded model: when
//! it differs from the shared provider's model, a clone of the provider is
//! switched to the dataset model for that one call. Setting
//! `prefer_new_model` disables the switch.
//!
//! [`Ingest`](Datastore::ingest) lives in [`crate::ingest`] and
//! [`retrieve`](Datastore::retrieve) in [`crate::retrieve`].

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use knowledge_core::embedding::{EmbeddingFunc, EmbeddingModelProvider};
use knowledge_core::error::BackendContext;
use knowledge_core::filter::{validate_all, MetadataFilter, WhereDocument};
use knowledge_core::index::Index;
use knowledge_core::models::{keys, Dataset, Document, File};
use knowledge_core::store::Store;
use knowledge_core::vectorstore::{ExportFile, Vectorstore};
use knowledge_core::{Error, Result};

use crate::config::{Config, RetrievalConfig};
use crate::db::{self, Backends};
use crate::dedupe::{get_duplicate_check, DuplicateCheck, Upsert};
use crate::embedding::create_provider;
use crate::flows::IngestionFlows;

/// Behavior switches of a [`Datastore`].
pub struct DatastoreOptions {
    /// Keep using the shared provider's model even for datasets recorded
    /// with another one.
    pub prefer_new_model: bool,
    /// Fail ingestion when non-model provider fields disagree with the
    /// dataset's recorded config.
    pub strict_config_check: bool,
    pub reuse_files: bool,
    pub reuse_embeddings: bool,
    pub duplicate_check: Arc<dyn DuplicateCheck>,
    pub flows: IngestionFlows,
    pub retrieval: RetrievalConfig,
}

impl Default for DatastoreOptions {
    fn default() -> Self {
        Self {
            prefer_new_model: false,
            strict_config_check: false,
            reuse_files: false,
            reuse_embeddings: false,
            duplicate_check: Arc::new(Upsert),
            flows: IngestionFlows::default(),
            retrieval: RetrievalConfig::default(),
        }
    }
}

impl DatastoreOptions {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            prefer_new_model: config.embedding.prefer_new_model,
            strict_config_check: config.embedding.strict_config_check,
            reuse_files: config.ingestion.reuse_files,
            reuse_embeddings: config.ingestion.reuse_embeddings,
            duplicate_check: get_duplicate_check(&config.ingestion.is_duplicate)?,
            flows: IngestionFlows::from_config(&config.ingestion)?,
            retrieval: config.retrieval.clone(),
        })
    }
}

pub struct Datastore {
    pub(crate) index: Arc<dyn Index>,
    pub(crate) vectorstore: Arc<dyn Vectorstore>,
    pub(crate) provider: Box<dyn EmbeddingModelProvider>,
    pub(crate) opts: DatastoreOptions,
}

impl Datastore {
    pub fn new(
        backends: Backends,
        provider: Box<dyn EmbeddingModelProvider>,
        opts: DatastoreOptions,
    ) -> Self {
        Self {
            index: backends.index,
            vectorstore: backends.vectorstore,
            provider,
            opts,
        }
    }

    /// Build the provider and open the backends named in `config`.
    pub async fn open(config: &Config) -> Result<Self> {
        let provider = create_provider(&config.embedding)
            .map_err(|e| Error::Config(format!("embedding provider: {:#}", e)))?;
        let default_embedder = provider
            .embedding_func()
            .backend(|| "build embedding function")?;
        let backends = db::open_backends(
            &config.index.dsn,
            &config.vectorstore.dsn,
            default_embedder,
        )
        .await?;
        let opts = DatastoreOptions::from_config(config)?;
        tracing::info!(
            provider = provider.name(),
            model = provider.embedding_model_name(),
            "datastore opened"
        );
        Ok(Self::new(backends, provider, opts))
    }

    pub fn provider(&self) -> &dyn EmbeddingModelProvider {
        self.provider.as_ref()
    }

    pub fn options(&self) -> &DatastoreOptions {
        &self.opts
    }

    /// Dataset `id`, or [`Error::DatasetNotFound`].
    pub(crate) async fn require_dataset(&self, id: &str) -> Result<Dataset> {
        self.index
            .get_dataset(id)
            .await
            .backend(|| format!("get dataset {}", id))?
            .ok_or_else(|| Error::DatasetNotFound(id.to_string()))
    }

    /// The embedding function and model name to use for `dataset`.
    pub(crate) fn embedder_for(&self, dataset: &Dataset) -> Result<(EmbeddingFunc, String)> {
        let current = self.provider.embedding_model_name();
        match dataset.embedding_model_name() {
            Some(model) if model != current && !self.opts.prefer_new_model => {
                let mut provider = self.provider.clone_box();
                provider.use_embedding_model(model);
                let func = provider
                    .embedding_func()
                    .backend(|| format!("build embedding function for model {}", model))?;
                Ok((func, model.to_string()))
            }
            _ => {
                let func = self
                    .provider
                    .embedding_func()
                    .backend(|| "build embedding function")?;
                Ok((func, current.to_string()))
            }
        }
    }

    // ----- datasets -----

    /// Create a dataset and its vectorstore collection.
    pub async fn create_dataset(&self, dataset: &Dataset) -> Result<()> {
        if dataset.id.trim().is_empty() {
            return Err(Error::InvalidInput("dataset id must not be empty".into()));
        }
        self.index
            .create_dataset(dataset)
            .await
            .backend(|| format!("create dataset {}", dataset.id))?;
        self.vectorstore
            .create_collection(&dataset.id)
            .await
            .backend(|| format!("create collection {}", dataset.id))?;
        tracing::info!(dataset = %dataset.id, "dataset created");
        Ok(())
    }

    pub async fn get_dataset(&self, id: &str) -> Result<Option<Dataset>> {
        self.index
            .get_dataset(id)
            .await
            .backend(|| format!("get dataset {}", id))
    }

    pub async fn list_datasets(&self) -> Result<Vec<Dataset>> {
        self.index.list_datasets().await.backend(|| "list datasets")
    }

    pub async fn update_dataset(&self, dataset: &Dataset) -> Result<()> {
        self.require_dataset(&dataset.id).await?;
        self.index
            .update_dataset(dataset)
            .await
            .backend(|| format!("update dataset {}", dataset.id))
    }

    /// Delete a dataset, its files and its collection.
    pub async fn delete_dataset(&self, id: &str) -> Result<()> {
        self.require_dataset(id).await?;
        self.index
            .delete_dataset(id)
            .await
            .backend(|| format!("delete dataset {}", id))?;
        self.vectorstore
            .remove_collection(id)
            .await
            .backend(|| format!("remove collection {}", id))?;
        tracing::info!(dataset = %id, "dataset deleted");
        Ok(())
    }

    // ----- files and documents -----

    pub async fn find_file(&self, dataset: &str, file_id: &str) -> Result<Option<File>> {
        self.index
            .find_file(dataset, file_id)
            .await
            .backend(|| format!("find file {}", file_id))
    }

    /// Delete a file record and every chunk it references.
    pub async fn delete_file(&self, dataset: &str, file_id: &str) -> Result<()> {
        self.require_dataset(dataset).await?;
        let Some(file) = self.find_file(dataset, file_id).await? else {
            return Ok(());
        };
        let none = MetadataFilter::new();
        for doc in &file.documents {
            self.vectorstore
                .remove_document(Some(&doc.id), dataset, &none, &[])
                .await
                .backend(|| format!("remove document {}", doc.id))?;
        }
        self.index
            .delete_file(dataset, file_id)
            .await
            .backend(|| format!("delete file {}", file_id))?;
        tracing::info!(
            dataset = %dataset,
            file_id = %file_id,
            chunks = file.documents.len(),
            "file deleted"
        );
        Ok(())
    }

    /// Delete one chunk from both backends. A file left without chunks is
    /// removed from the index.
    pub async fn delete_document(&self, dataset: &str, document_id: &str) -> Result<()> {
        if document_id.is_empty() {
            return Err(Error::InvalidInput("document id must not be empty".into()));
        }
        self.require_dataset(dataset).await?;
        self.vectorstore
            .remove_document(Some(document_id), dataset, &MetadataFilter::new(), &[])
            .await
            .backend(|| format!("remove document {}", document_id))?;
        self.index
            .delete_document(dataset, document_id)
            .await
            .backend(|| format!("delete index entry for document {}", document_id))?;
        tracing::debug!(dataset = %dataset, document_id = %document_id, "document deleted");
        Ok(())
    }

    pub async fn get_dataset_for_document(&self, document_id: &str) -> Result<Option<Dataset>> {
        self.index
            .get_dataset_for_document(document_id)
            .await
            .backend(|| format!("get dataset for document {}", document_id))
    }

    pub async fn get_file_for_document(&self, document_id: &str) -> Result<Option<File>> {
        self.index
            .get_file_for_document(document_id)
            .await
            .backend(|| format!("get file for document {}", document_id))
    }

    // ----- export / import -----

    /// Write the named collections (all when empty) to a JSON file.
    pub async fn export_collections(&self, path: &Path, collections: &[String]) -> Result<()> {
        self.vectorstore
            .export_collections_to_file(path, collections)
            .await
            .backend(|| format!("export collections to {}", path.display()))
    }

    /// Load collections from a JSON file. Datasets missing for an imported
    /// collection are created without a recorded provider config.
    pub async fn import_collections(&self, path: &Path, collections: &[String]) -> Result<()> {
        let mut export =
            ExportFile::read(path).backend(|| format!("read export {}", path.display()))?;
        export.retain_collections(collections);

        self.vectorstore
            .import_collections_from_file(path, collections)
            .await
            .backend(|| format!("import collections from {}", path.display()))?;

        for collection in &export.collections {
            if self.get_dataset(&collection.name).await?.is_none() {
                self.index
                    .create_dataset(&Dataset::new(collection.name.as_str()))
                    .await
                    .backend(|| format!("create dataset {}", collection.name))?;
            }
            tracing::info!(
                dataset = %collection.name,
                documents = collection.documents.len(),
                "collection imported"
            );
        }
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        self.vectorstore.close().await.backend(|| "close vectorstore")
    }
}

fn stamp_dataset(docs: &mut [Document], dataset: &str) {
    for doc in docs {
        doc.set_metadata(keys::DATASET_ID, dataset);
    }
}

#[async_trait]
impl Store for Datastore {
    async fn list_datasets(&self) -> Result<Vec<Dataset>> {
        Datastore::list_datasets(self).await
    }

    async fn get_dataset(&self, id: &str) -> Result<Option<Dataset>> {
        Datastore::get_dataset(self, id).await
    }

    async fn similarity_search(
        &self,
        query: &str,
        k: usize,
        dataset: &str,
        metadata_filter: &MetadataFilter,
        content_filter: &[WhereDocument],
    ) -> Result<Vec<Document>> {
        validate_all(content_filter)?;
        let ds = self.require_dataset(dataset).await?;
        let (embedder, model) = self.embedder_for(&ds)?;

        let mut docs = self
            .vectorstore
            .similarity_search(query, k, dataset, metadata_filter, content_filter, Some(embedder))
            .await
            .backend(|| format!("similarity search in {}", dataset))?;
        stamp_dataset(&mut docs, dataset);
        tracing::debug!(
            dataset = %dataset,
            model = %model,
            results = docs.len(),
            "similarity search"
        );
        Ok(docs)
    }

    async fn get_documents(
        &self,
        dataset: &str,
        metadata_filter: &MetadataFilter,
        content_filter: &[WhereDocument],
    ) -> Result<Vec<Document>> {
        validate_all(content_filter)?;
        self.require_dataset(dataset).await?;
        let mut docs = self
            .vectorstore
            .get_documents(Some(dataset), metadata_filter, content_filter)
            .await
            .backend(|| format!("get documents of {}", dataset))?;
        stamp_dataset(&mut docs, dataset);
        Ok(docs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use knowledge_core::embedding::HashEmbeddingProvider;
    use knowledge_core::index::memory::InMemoryIndex;
    use knowledge_core::models::EmbeddingsProviderConfig;
    use knowledge_core::vectorstore::memory::InMemoryVectorstore;

    fn datastore(opts: DatastoreOptions) -> (Datastore, HashEmbeddingProvider) {
        let provider = HashEmbeddingProvider::new("model-a", 64);
        let backends = Backends {
            index: Arc::new(InMemoryIndex::new()),
            vectorstore: Arc::new(InMemoryVectorstore::new(
                provider.embedding_func().unwrap(),
            )),
        };
        (
            Datastore::new(backends, Box::new(provider.clone()), opts),
            provider,
        )
    }

    fn dataset_with_model(id: &str, model: &str) -> Dataset {
        let mut config = serde_json::Map::new();
        config.insert("model".into(), model.into());
        Dataset {
            id: id.into(),
            embeddings_provider_config: Some(EmbeddingsProviderConfig {
                provider_type: "hash".into(),
                config,
            }),
        }
    }

    #[tokio::test]
    async fn test_dataset_lifecycle() {
        let (ds, _) = datastore(DatastoreOptions::default());
        assert!(matches!(
            ds.create_dataset(&Dataset::new(" ")).await,
            Err(Error::InvalidInput(_))
        ));

        ds.create_dataset(&Dataset::new("docs")).await.unwrap();
        assert_eq!(ds.list_datasets().await.unwrap().len(), 1);

        let updated = dataset_with_model("docs", "model-a");
        ds.update_dataset(&updated).await.unwrap();
        assert_eq!(ds.get_dataset("docs").await.unwrap(), Some(updated));

        ds.delete_dataset("docs").await.unwrap();
        assert!(ds.get_dataset("docs").await.unwrap().is_none());
        assert!(ds.delete_dataset("docs").await.unwrap_err().is_dataset_not_found());
        assert!(ds
            .update_dataset(&Dataset::new("nope"))
            .await
            .unwrap_err()
            .is_dataset_not_found());
    }

    #[tokio::test]
    async fn test_search_stamps_dataset_and_validates() {
        let (ds, _) = datastore(DatastoreOptions::default());
        ds.create_dataset(&Dataset::new("docs")).await.unwrap();
        ds.vectorstore
            .add_documents(vec![Document::new("rust ownership")], "docs", None)
            .await
            .unwrap();

        let hits = ds
            .similarity_search("ownership", 5, "docs", &MetadataFilter::new(), &[])
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].metadata_str(keys::DATASET_ID).as_deref(), Some("docs"));

        let bad = [WhereDocument::Contains(String::new())];
        assert!(matches!(
            ds.similarity_search("x", 5, "docs", &MetadataFilter::new(), &bad)
                .await,
            Err(Error::InvalidFilter(_))
        ));
        assert!(ds
            .similarity_search("x", 5, "missing", &MetadataFilter::new(), &[])
            .await
            .unwrap_err()
            .is_dataset_not_found());
    }

    #[tokio::test]
    async fn test_embedder_follows_dataset_model() {
        let (ds, _) = datastore(DatastoreOptions::default());
        let (_, model) = ds.embedder_for(&dataset_with_model("d", "model-b")).unwrap();
        assert_eq!(model, "model-b");
        let (_, model) = ds.embedder_for(&Dataset::new("d")).unwrap();
        assert_eq!(model, "model-a");
        assert_eq!(ds.provider().embedding_model_name(), "model-a");

        let (ds, _) = datastore(DatastoreOptions {
            prefer_new_model: true,
            ..Default::default()
        });
        let (_, model) = ds.embedder_for(&dataset_with_model("d", "model-b")).unwrap();
        assert_eq!(model, "model-a");
    }
}
