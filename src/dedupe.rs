//! Duplicate checks run before a file is loaded.
//!
//! A check decides whether an incoming file should be skipped. Checks are
//! selected by name from configuration, or passed directly on
//! [`IngestOpts`](crate::ingest::IngestOpts).
//!
//! | Name | Behavior |
//! |------|----------|
//! | `upsert` | Never a duplicate; re-ingestion replaces the file's chunks |
//! | `ignore` | Duplicate when the dataset already has a file at the same absolute path |

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use knowledge_core::index::Index;
use knowledge_core::models::FileMetadata;
use knowledge_core::Error;

#[async_trait]
pub trait DuplicateCheck: Send + Sync {
    fn name(&self) -> &str;

    async fn is_duplicate(&self, index: &dyn Index, dataset: &str, file: &FileMetadata)
        -> Result<bool>;
}

/// Look up a duplicate check by name.
pub fn get_duplicate_check(name: &str) -> knowledge_core::Result<Arc<dyn DuplicateCheck>> {
    match name {
        Upsert::NAME | "" => Ok(Arc::new(Upsert)),
        IgnoreExisting::NAME => Ok(Arc::new(IgnoreExisting)),
        other => Err(Error::Config(format!("unknown duplicate check {:?}", other))),
    }
}

pub struct Upsert;

impl Upsert {
    pub const NAME: &'static str = "upsert";
}

#[async_trait]
impl DuplicateCheck for Upsert {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn is_duplicate(&self, _: &dyn Index, _: &str, _: &FileMetadata) -> Result<bool> {
        Ok(false)
    }
}

pub struct IgnoreExisting;

impl IgnoreExisting {
    pub const NAME: &'static str = "ignore";
}

#[async_trait]
impl DuplicateCheck for IgnoreExisting {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn is_duplicate(
        &self,
        index: &dyn Index,
        dataset: &str,
        file: &FileMetadata,
    ) -> Result<bool> {
        if file.absolute_path.is_empty() {
            return Ok(false);
        }
        let filter = FileMetadata {
            absolute_path: file.absolute_path.clone(),
            ..Default::default()
        };
        let existing = index
            .find_files_by_metadata(Some(dataset), &filter, false)
            .await?;
        Ok(!existing.is_empty())
    }
}
