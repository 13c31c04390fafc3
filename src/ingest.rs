//! Ingestion pipeline orchestration.
//!
//! [`Datastore::ingest`] turns one file's bytes into stored chunks:
//!
//! 1. Resolve the dataset (never auto-created).
//! 2. Reconcile the dataset's recorded embedding config with the provider.
//!    A dataset without one gets the provider's, saved just before step 10.
//! 3. Run the duplicate check; a duplicate is skipped with `Ok(vec![])`.
//! 4. Detect the filetype and pick its ingestion flow. A flow with no
//!    loader, configured or built in, means [`Error::UnsupportedFileType`].
//! 5. Checksum the content and build the chunk metadata.
//! 6. Reuse the chunks of an identical file when `reuse_files` is on.
//! 7. Otherwise load, split and transform. Zero chunks is `Ok(vec![])`.
//! 8. Stamp `docIndex` / `docsTotal`.
//! 9. Copy vectors of identical chunks when `reuse_embeddings` is on, then
//!    embed the rest.
//! 10. Clear the dataset's previous chunks for the same path.
//! 11. Write chunks to the vectorstore, then the file record to the index.
//!
//! Nothing is written before step 10, so skips, load failures and
//! embedding failures leave both backends untouched. A failure in step 11
//! is not rolled back.
//! Two concurrent ingestions of the same path into the same dataset may
//! interleave steps 10 and 11 and leave both chunk sets behind.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use knowledge_core::embedding::EmbeddingFunc;
use knowledge_core::error::BackendContext;
use knowledge_core::filter::{MetadataFilter, WhereDocument};
use knowledge_core::models::{
    keys, sort_and_ensure_doc_index, Dataset, Document, File, FileDocument, FileMetadata,
    Metadata,
};
use knowledge_core::vectorstore::prepare_documents;
use knowledge_core::{Error, Result};

use crate::datastore::Datastore;
use crate::dedupe::DuplicateCheck;
use crate::filetypes::detect_filetype;
use crate::flows::inject_metadata;

/// Per-call ingestion options.
#[derive(Clone, Default)]
pub struct IngestOpts {
    /// Absolute path of the source; defaults to the filename.
    pub abs_path: Option<String>,
    /// Extra metadata stamped on every chunk. Reserved keys are ignored.
    pub extra_metadata: Metadata,
    /// Overrides the configured duplicate check.
    pub is_duplicate: Option<Arc<dyn DuplicateCheck>>,
    pub modified_at: Option<DateTime<Utc>>,
}

/// Hex SHA-256 of a file's content.
pub fn checksum(content: &[u8]) -> String {
    format!("{:x}", Sha256::digest(content))
}

impl Datastore {
    /// Ingest one file into `dataset` and return the stored chunk ids.
    pub async fn ingest(
        &self,
        dataset: &str,
        filename: &str,
        content: &[u8],
        opts: IngestOpts,
    ) -> Result<Vec<String>> {
        if filename.is_empty() {
            return Err(Error::InvalidInput("filename must not be empty".into()));
        }

        let ds = self.require_dataset(dataset).await?;
        let (ds, record_config) = self.reconcile_embedding_config(ds)?;
        let (embedder, model) = self.embedder_for(&ds)?;

        let abs_path = opts.abs_path.clone().unwrap_or_else(|| filename.to_string());
        let file_meta = FileMetadata {
            name: filename.to_string(),
            absolute_path: abs_path.clone(),
            size: content.len() as i64,
            modified_at: opts.modified_at,
            checksum: checksum(content),
        };

        let check = opts
            .is_duplicate
            .clone()
            .unwrap_or_else(|| self.opts.duplicate_check.clone());
        let duplicate = check
            .is_duplicate(self.index.as_ref(), dataset, &file_meta)
            .await
            .backend(|| format!("duplicate check {}", check.name()))?;
        if duplicate {
            tracing::info!(
                dataset = %dataset,
                filename = %filename,
                check = check.name(),
                status = "duplicate",
                "file skipped"
            );
            return Ok(Vec::new());
        }

        let filetype = detect_filetype(filename, content);
        let flow = self.opts.flows.for_filetype(&filetype);
        let Some(loader) = flow.loader(&filetype) else {
            tracing::warn!(
                dataset = %dataset,
                filename = %filename,
                filetype = %filetype,
                status = "unsupported",
                "file skipped"
            );
            return Err(Error::UnsupportedFileType {
                file_type: filetype,
            });
        };

        let metadata = chunk_metadata(&opts.extra_metadata, &file_meta, &model);
        let flow_err = |source: anyhow::Error| Error::Flow {
            filename: filename.to_string(),
            source,
        };

        let reused = if self.opts.reuse_files {
            self.reuse_file_chunks(&file_meta.checksum, &model).await
        } else {
            None
        };
        let reused_file = reused.is_some();
        let mut chunks = match reused {
            Some(docs) => inject_metadata(docs, &metadata).map_err(flow_err)?,
            None => {
                let loaded = loader(content).map_err(flow_err)?;
                flow.run(loaded, &metadata).map_err(flow_err)?
            }
        };

        if chunks.is_empty() {
            tracing::info!(
                dataset = %dataset,
                filename = %filename,
                filetype = %filetype,
                status = "empty",
                "no chunks produced"
            );
            return Ok(Vec::new());
        }

        sort_and_ensure_doc_index(&mut chunks);

        if self.opts.reuse_embeddings {
            self.reuse_embeddings(&mut chunks, &model).await;
        }
        // Embed before clearing so a provider failure keeps the previous
        // version of the file intact.
        prepare_documents(&mut chunks, embedder.as_ref())
            .await
            .backend(|| format!("embed chunks of {}", filename))?;

        if record_config {
            self.index
                .update_dataset(&ds)
                .await
                .backend(|| format!("update dataset {}", dataset))?;
            tracing::info!(
                dataset = %dataset,
                provider = self.provider.name(),
                model = %model,
                "embedding config recorded"
            );
        }
        self.clear_path(dataset, &abs_path).await?;
        let ids = self.persist(&ds, chunks, file_meta, embedder).await?;

        tracing::info!(
            dataset = %dataset,
            filename = %filename,
            filetype = %filetype,
            chunks = ids.len(),
            reused_file,
            status = "stored",
            "file ingested"
        );
        Ok(ids)
    }

    /// Read a file from disk and ingest it under its file name.
    pub async fn ingest_path(
        &self,
        dataset: &str,
        path: &Path,
        mut opts: IngestOpts,
    ) -> Result<Vec<String>> {
        let content = tokio::fs::read(path)
            .await
            .backend(|| format!("read {}", path.display()))?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        if opts.abs_path.is_none() {
            let abs = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
            opts.abs_path = Some(abs.display().to_string());
        }
        if opts.modified_at.is_none() {
            opts.modified_at = tokio::fs::metadata(path)
                .await
                .and_then(|m| m.modified())
                .ok()
                .map(DateTime::<Utc>::from);
        }
        self.ingest(dataset, &filename, &content, opts).await
    }

    /// Attach the provider config to a dataset that has none, and apply
    /// the strict check to one that has. The flag tells whether the
    /// dataset still needs to be saved.
    fn reconcile_embedding_config(&self, mut dataset: Dataset) -> Result<(Dataset, bool)> {
        let current = self.provider.config();
        let Some(recorded) = dataset.embeddings_provider_config.clone() else {
            dataset.embeddings_provider_config = Some(current);
            return Ok((dataset, true));
        };

        if recorded.provider_type != current.provider_type {
            tracing::warn!(
                dataset = %dataset.id,
                recorded = %recorded.provider_type,
                current = %current.provider_type,
                "embedding provider differs from the dataset's"
            );
        }
        if recorded.model_name() != current.model_name() {
            tracing::warn!(
                dataset = %dataset.id,
                recorded = recorded.model_name().unwrap_or_default(),
                current = current.model_name().unwrap_or_default(),
                prefer_new_model = self.opts.prefer_new_model,
                "embedding model differs from the dataset's"
            );
        }

        if self.opts.strict_config_check {
            let fields: Vec<&str> = self
                .provider
                .required_fields()
                .iter()
                .copied()
                .filter(|f| *f != "model")
                .collect();
            let mut mismatched = current.mismatched_fields(&recorded, &fields);
            if recorded.provider_type != current.provider_type {
                mismatched.insert(0, "type");
            }
            if !mismatched.is_empty() {
                return Err(Error::EmbeddingConfigMismatch(format!(
                    "dataset {} differs in {}",
                    dataset.id,
                    mismatched.join(", ")
                )));
            }
        }
        Ok((dataset, false))
    }

    /// Chunks of a previously ingested file with the same checksum,
    /// cloned under new ids.
    ///
    /// Candidates embedded with another model are skipped. A candidate
    /// whose chunks cannot all be fetched is abandoned for the next one.
    async fn reuse_file_chunks(&self, checksum: &str, model: &str) -> Option<Vec<Document>> {
        let filter = FileMetadata {
            checksum: checksum.to_string(),
            ..Default::default()
        };
        let candidates = match self.index.find_files_by_metadata(None, &filter, true).await {
            Ok(files) => files,
            Err(e) => {
                tracing::warn!(error = %e, "file reuse lookup failed");
                return None;
            }
        };

        'candidates: for file in candidates {
            if file.documents.is_empty() {
                continue;
            }
            match self.index.get_dataset(&file.dataset).await {
                Ok(Some(owner)) if owner.embedding_model_name() == Some(model) => {}
                Ok(_) => continue,
                Err(e) => {
                    tracing::warn!(file_id = %file.id, error = %e, "file reuse candidate skipped");
                    continue;
                }
            }

            let mut docs = Vec::with_capacity(file.documents.len());
            for entry in &file.documents {
                match self.vectorstore.get_document(&entry.id, &file.dataset).await {
                    Ok(Some(doc)) if !doc.embedding.is_empty() => docs.push(Document {
                        id: Uuid::new_v4().to_string(),
                        similarity_score: 0.0,
                        ..doc
                    }),
                    Ok(_) => {
                        tracing::debug!(
                            file_id = %file.id,
                            document_id = %entry.id,
                            "file reuse candidate incomplete"
                        );
                        continue 'candidates;
                    }
                    Err(e) => {
                        tracing::warn!(
                            file_id = %file.id,
                            document_id = %entry.id,
                            error = %e,
                            "file reuse candidate fetch failed"
                        );
                        continue 'candidates;
                    }
                }
            }
            tracing::debug!(file_id = %file.id, chunks = docs.len(), "reusing file chunks");
            return Some(docs);
        }
        None
    }

    /// Fill missing embeddings from stored chunks with identical content
    /// embedded by `model`. Lookup failures leave the chunk to be embedded.
    async fn reuse_embeddings(&self, chunks: &mut [Document], model: &str) {
        let mut found: HashMap<String, Option<Vec<f32>>> = HashMap::new();
        let mut reused = 0usize;
        for chunk in chunks.iter_mut().filter(|c| c.embedding.is_empty()) {
            if !found.contains_key(&chunk.content) {
                let vector = self.find_embedding(&chunk.content, model).await;
                found.insert(chunk.content.clone(), vector);
            }
            if let Some(Some(vector)) = found.get(&chunk.content) {
                chunk.embedding = vector.clone();
                reused += 1;
            }
        }
        if reused > 0 {
            tracing::debug!(reused, "embeddings reused");
        }
    }

    async fn find_embedding(&self, content: &str, model: &str) -> Option<Vec<f32>> {
        let content_filter = [WhereDocument::Equals(content.to_string())];
        let stored = match self
            .vectorstore
            .get_documents(None, &MetadataFilter::new(), &content_filter)
            .await
        {
            Ok(docs) => docs,
            Err(e) => {
                tracing::warn!(error = %e, "embedding reuse lookup failed");
                return None;
            }
        };

        for doc in stored.into_iter().filter(|d| !d.embedding.is_empty()) {
            let matches = match doc.embedding_model() {
                Some(m) => m == model,
                None => matches!(
                    self.index.get_dataset_for_document(&doc.id).await,
                    Ok(Some(owner)) if owner.embedding_model_name() == Some(model)
                ),
            };
            if matches {
                return Some(doc.embedding);
            }
        }
        None
    }

    /// Remove the dataset's chunks previously ingested from `abs_path`.
    async fn clear_path(&self, dataset: &str, abs_path: &str) -> Result<()> {
        let mut filter = MetadataFilter::new();
        filter.insert(keys::ABS_PATH.to_string(), abs_path.to_string());
        self.vectorstore
            .remove_document(None, dataset, &filter, &[])
            .await
            .backend(|| format!("clear chunks of {}", abs_path))
    }

    /// Store chunks, drop stale file records for the path and record the
    /// new file.
    async fn persist(
        &self,
        dataset: &Dataset,
        chunks: Vec<Document>,
        file_meta: FileMetadata,
        embedder: EmbeddingFunc,
    ) -> Result<Vec<String>> {
        let ids = self
            .vectorstore
            .add_documents(chunks, &dataset.id, Some(embedder))
            .await
            .backend(|| format!("add documents to {}", dataset.id))?;

        let by_path = FileMetadata {
            absolute_path: file_meta.absolute_path.clone(),
            ..Default::default()
        };
        let stale = self
            .index
            .find_files_by_metadata(Some(&dataset.id), &by_path, false)
            .await
            .backend(|| format!("find files for {}", file_meta.absolute_path))?;
        for file in stale {
            self.index
                .delete_file(&dataset.id, &file.id)
                .await
                .backend(|| format!("delete file {}", file.id))?;
        }

        let file_id = Uuid::new_v4().to_string();
        let file = File {
            documents: ids
                .iter()
                .enumerate()
                .map(|(i, id)| FileDocument {
                    id: id.clone(),
                    file_id: file_id.clone(),
                    dataset: dataset.id.clone(),
                    index: i as i64,
                })
                .collect(),
            id: file_id,
            dataset: dataset.id.clone(),
            metadata: file_meta,
        };
        self.index
            .create_file(&file)
            .await
            .backend(|| format!("create file {}", file.id))?;
        Ok(ids)
    }
}

/// Caller metadata plus the reserved file keys. Reserved keys given by the
/// caller are dropped.
fn chunk_metadata(extra: &Metadata, file: &FileMetadata, model: &str) -> Metadata {
    let mut metadata: Metadata = extra
        .iter()
        .filter(|(k, _)| !keys::RESERVED.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    metadata.insert(keys::FILENAME.into(), file.name.clone().into());
    metadata.insert(keys::ABS_PATH.into(), file.absolute_path.clone().into());
    metadata.insert(keys::FILE_SIZE.into(), file.size.into());
    metadata.insert(keys::EMBEDDING_MODEL.into(), model.into());
    metadata.insert(keys::FILE_CHECKSUM.into(), file.checksum.clone().into());
    metadata
}
