//! In-memory [`Index`] for tests and ephemeral use (`memory://`).

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use crate::models::{Dataset, File, FileMetadata};

use super::{file_metadata_matches, Index};

#[derive(Default)]
struct State {
    datasets: BTreeMap<String, Dataset>,
    /// Files in creation order.
    files: Vec<File>,
}

/// In-memory index.
#[derive(Default)]
pub struct InMemoryIndex {
    state: RwLock<State>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>> {
        self.state.read().map_err(|_| anyhow!("index lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>> {
        self.state.write().map_err(|_| anyhow!("index lock poisoned"))
    }
}

#[async_trait]
impl Index for InMemoryIndex {
    async fn create_dataset(&self, dataset: &Dataset) -> Result<()> {
        let mut state = self.write()?;
        if state.datasets.contains_key(&dataset.id) {
            bail!("dataset {:?} already exists", dataset.id);
        }
        state.datasets.insert(dataset.id.clone(), dataset.clone());
        Ok(())
    }

    async fn get_dataset(&self, id: &str) -> Result<Option<Dataset>> {
        Ok(self.read()?.datasets.get(id).cloned())
    }

    async fn list_datasets(&self) -> Result<Vec<Dataset>> {
        Ok(self.read()?.datasets.values().cloned().collect())
    }

    async fn update_dataset(&self, dataset: &Dataset) -> Result<()> {
        let mut state = self.write()?;
        match state.datasets.get_mut(&dataset.id) {
            Some(existing) => {
                *existing = dataset.clone();
                Ok(())
            }
            None => bail!("dataset {:?} does not exist", dataset.id),
        }
    }

    async fn delete_dataset(&self, id: &str) -> Result<()> {
        let mut state = self.write()?;
        state.datasets.remove(id);
        state.files.retain(|f| f.dataset != id);
        Ok(())
    }

    async fn create_file(&self, file: &File) -> Result<()> {
        let mut state = self.write()?;
        if !state.datasets.contains_key(&file.dataset) {
            bail!("dataset {:?} does not exist", file.dataset);
        }
        state.files.retain(|f| f.id != file.id);
        state.files.push(file.clone());
        Ok(())
    }

    async fn get_file(&self, id: &str) -> Result<Option<File>> {
        Ok(self.read()?.files.iter().find(|f| f.id == id).cloned())
    }

    async fn find_file(&self, dataset: &str, file_id: &str) -> Result<Option<File>> {
        Ok(self
            .read()?
            .files
            .iter()
            .find(|f| f.dataset == dataset && f.id == file_id)
            .cloned())
    }

    async fn find_files_by_metadata(
        &self,
        dataset: Option<&str>,
        filter: &FileMetadata,
        include_documents: bool,
    ) -> Result<Vec<File>> {
        let state = self.read()?;
        Ok(state
            .files
            .iter()
            .filter(|f| dataset.map_or(true, |d| f.dataset == d))
            .filter(|f| file_metadata_matches(filter, &f.metadata))
            .map(|f| {
                let mut f = f.clone();
                if !include_documents {
                    f.documents.clear();
                }
                f
            })
            .collect())
    }

    async fn delete_file(&self, dataset: &str, file_id: &str) -> Result<()> {
        self.write()?
            .files
            .retain(|f| !(f.dataset == dataset && f.id == file_id));
        Ok(())
    }

    async fn delete_document(&self, dataset: &str, document_id: &str) -> Result<()> {
        let mut state = self.write()?;
        for file in state.files.iter_mut().filter(|f| f.dataset == dataset) {
            file.documents.retain(|d| d.id != document_id);
        }
        state
            .files
            .retain(|f| f.dataset != dataset || !f.documents.is_empty());
        Ok(())
    }

    async fn get_dataset_for_document(&self, document_id: &str) -> Result<Option<Dataset>> {
        let state = self.read()?;
        Ok(state
            .files
            .iter()
            .find(|f| f.documents.iter().any(|d| d.id == document_id))
            .and_then(|f| state.datasets.get(&f.dataset))
            .cloned())
    }

    async fn get_file_for_document(&self, document_id: &str) -> Result<Option<File>> {
        Ok(self
            .read()?
            .files
            .iter()
            .find(|f| f.documents.iter().any(|d| d.id == document_id))
            .cloned())
    }
}
