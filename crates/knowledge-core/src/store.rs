//! Read-side storage abstraction used by retrievers.
//!
//! The [`Store`] trait is the narrow view of a datastore that retrieval
//! strategies need: dataset lookup, similarity search and filtered chunk
//! listing. The `knowledge` app crate's `Datastore` is the production
//! implementation; it resolves each dataset's embedding model and stamps
//! `datasetID` on every chunk it returns.

use async_trait::async_trait;

use crate::error::Result;
use crate::filter::{MetadataFilter, WhereDocument};
use crate::models::{Dataset, Document};

#[async_trait]
pub trait Store: Send + Sync {
    async fn list_datasets(&self) -> Result<Vec<Dataset>>;

    /// `Ok(None)` when the dataset does not exist.
    async fn get_dataset(&self, id: &str) -> Result<Option<Dataset>>;

    /// Top-`k` chunks of `dataset` by similarity to `query`.
    async fn similarity_search(
        &self,
        query: &str,
        k: usize,
        dataset: &str,
        metadata_filter: &MetadataFilter,
        content_filter: &[WhereDocument],
    ) -> Result<Vec<Document>>;

    /// Every chunk of `dataset` passing the filters.
    async fn get_documents(
        &self,
        dataset: &str,
        metadata_filter: &MetadataFilter,
        content_filter: &[WhereDocument],
    ) -> Result<Vec<Document>>;
}
