//! Index port: datasets, files and the chunk references they own.
//!
//! The [`Index`] records which file produced which chunks, and which
//! embedding configuration each dataset was built with. It never stores
//! chunk content; that lives in the [`Vectorstore`](crate::vectorstore::Vectorstore).
//!
//! Not-found lookups return `Ok(None)`.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{Dataset, File, FileMetadata};

#[async_trait]
pub trait Index: Send + Sync {
    async fn create_dataset(&self, dataset: &Dataset) -> Result<()>;

    async fn get_dataset(&self, id: &str) -> Result<Option<Dataset>>;

    async fn list_datasets(&self) -> Result<Vec<Dataset>>;

    async fn update_dataset(&self, dataset: &Dataset) -> Result<()>;

    /// Delete a dataset together with its files.
    async fn delete_dataset(&self, id: &str) -> Result<()>;

    async fn create_file(&self, file: &File) -> Result<()>;

    async fn get_file(&self, id: &str) -> Result<Option<File>>;

    /// Find a file by id within a dataset.
    async fn find_file(&self, dataset: &str, file_id: &str) -> Result<Option<File>>;

    /// Find files whose metadata matches `filter`.
    ///
    /// Empty string fields and a zero size in `filter` are wildcards.
    /// `dataset = None` searches every dataset.
    async fn find_files_by_metadata(
        &self,
        dataset: Option<&str>,
        filter: &FileMetadata,
        include_documents: bool,
    ) -> Result<Vec<File>>;

    async fn delete_file(&self, dataset: &str, file_id: &str) -> Result<()>;

    /// Drop one chunk reference. A file left without chunks is deleted.
    async fn delete_document(&self, dataset: &str, document_id: &str) -> Result<()>;

    async fn get_dataset_for_document(&self, document_id: &str) -> Result<Option<Dataset>>;

    async fn get_file_for_document(&self, document_id: &str) -> Result<Option<File>>;
}

/// True when `meta` satisfies every non-wildcard field of `filter`.
pub fn file_metadata_matches(filter: &FileMetadata, meta: &FileMetadata) -> bool {
    (filter.name.is_empty() || filter.name == meta.name)
        && (filter.absolute_path.is_empty() || filter.absolute_path == meta.absolute_path)
        && (filter.checksum.is_empty() || filter.checksum == meta.checksum)
        && (filter.size == 0 || filter.size == meta.size)
        && filter.modified_at.map_or(true, |t| meta.modified_at == Some(t))
}
