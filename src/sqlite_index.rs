//! SQLite-backed [`Index`] implementation.
//!
//! Datasets, files and file→chunk references live in the `datasets`,
//! `files` and `file_documents` tables (see [`crate::migrate`]). Multi-row
//! writes run inside a transaction.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{Sqlite, SqliteRow};
use sqlx::{QueryBuilder, Row, SqlitePool};

use knowledge_core::index::Index;
use knowledge_core::models::{Dataset, EmbeddingsProviderConfig, File, FileDocument, FileMetadata};

const FILE_COLUMNS: &str = "id, dataset, name, absolute_path, size, modified_at, checksum";

/// SQLite implementation of the [`Index`] trait.
pub struct SqliteIndex {
    pool: SqlitePool,
}

impl SqliteIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn load_documents(&self, file: &mut File) -> Result<()> {
        let rows = sqlx::query(
            "SELECT id, file_id, dataset, doc_index FROM file_documents WHERE file_id = ? ORDER BY doc_index ASC",
        )
        .bind(&file.id)
        .fetch_all(&self.pool)
        .await?;

        file.documents = rows
            .iter()
            .map(|row| FileDocument {
                id: row.get("id"),
                file_id: row.get("file_id"),
                dataset: row.get("dataset"),
                index: row.get("doc_index"),
            })
            .collect();
        Ok(())
    }

    async fn fetch_files(
        &self,
        mut query: QueryBuilder<'_, Sqlite>,
        include_documents: bool,
    ) -> Result<Vec<File>> {
        query.push(" ORDER BY rowid ASC");
        let rows = query.build().fetch_all(&self.pool).await?;
        let mut files = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut file = file_from_row(row)?;
            if include_documents {
                self.load_documents(&mut file).await?;
            }
            files.push(file);
        }
        Ok(files)
    }

    async fn file_owning_document(&self, document_id: &str) -> Result<Option<File>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM files WHERE id = (SELECT file_id FROM file_documents WHERE id = ? LIMIT 1)",
            FILE_COLUMNS
        ))
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let mut file = file_from_row(&row)?;
                self.load_documents(&mut file).await?;
                Ok(Some(file))
            }
            None => Ok(None),
        }
    }
}

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn file_from_row(row: &SqliteRow) -> Result<File> {
    let modified_at: Option<String> = row.get("modified_at");
    let modified_at = modified_at
        .map(|s| DateTime::parse_from_rfc3339(&s).map(|t| t.with_timezone(&Utc)))
        .transpose()
        .context("invalid modified_at timestamp in files table")?;

    Ok(File {
        id: row.get("id"),
        dataset: row.get("dataset"),
        metadata: FileMetadata {
            name: row.get("name"),
            absolute_path: row.get("absolute_path"),
            size: row.get("size"),
            modified_at,
            checksum: row.get("checksum"),
        },
        documents: Vec::new(),
    })
}

fn dataset_from_row(row: &SqliteRow) -> Result<Dataset> {
    let config: Option<String> = row.get("embeddings_provider_config");
    let embeddings_provider_config = config
        .map(|json| serde_json::from_str::<EmbeddingsProviderConfig>(&json))
        .transpose()
        .context("invalid embeddings_provider_config in datasets table")?;
    Ok(Dataset {
        id: row.get("id"),
        embeddings_provider_config,
    })
}

fn config_json(dataset: &Dataset) -> Result<Option<String>> {
    Ok(dataset
        .embeddings_provider_config
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?)
}

#[async_trait]
impl Index for SqliteIndex {
    async fn create_dataset(&self, dataset: &Dataset) -> Result<()> {
        let exists: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM datasets WHERE id = ?")
            .bind(&dataset.id)
            .fetch_one(&self.pool)
            .await?;
        if exists {
            bail!("dataset {:?} already exists", dataset.id);
        }

        sqlx::query(
            "INSERT INTO datasets (id, embeddings_provider_config, created_at) VALUES (?, ?, ?)",
        )
        .bind(&dataset.id)
        .bind(config_json(dataset)?)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_dataset(&self, id: &str) -> Result<Option<Dataset>> {
        let row = sqlx::query("SELECT id, embeddings_provider_config FROM datasets WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(dataset_from_row).transpose()
    }

    async fn list_datasets(&self) -> Result<Vec<Dataset>> {
        let rows = sqlx::query("SELECT id, embeddings_provider_config FROM datasets ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(dataset_from_row).collect()
    }

    async fn update_dataset(&self, dataset: &Dataset) -> Result<()> {
        let result = sqlx::query("UPDATE datasets SET embeddings_provider_config = ? WHERE id = ?")
            .bind(config_json(dataset)?)
            .bind(&dataset.id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            bail!("dataset {:?} does not exist", dataset.id);
        }
        Ok(())
    }

    async fn delete_dataset(&self, id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM file_documents WHERE dataset = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM files WHERE dataset = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM datasets WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn create_file(&self, file: &File) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let dataset_exists: bool =
            sqlx::query_scalar("SELECT COUNT(*) > 0 FROM datasets WHERE id = ?")
                .bind(&file.dataset)
                .fetch_one(&mut *tx)
                .await?;
        if !dataset_exists {
            bail!("dataset {:?} does not exist", file.dataset);
        }

        sqlx::query("DELETE FROM file_documents WHERE file_id = ?")
            .bind(&file.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM files WHERE id = ?")
            .bind(&file.id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO files (id, dataset, name, absolute_path, size, modified_at, checksum, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&file.id)
        .bind(&file.dataset)
        .bind(&file.metadata.name)
        .bind(&file.metadata.absolute_path)
        .bind(file.metadata.size)
        .bind(file.metadata.modified_at.as_ref().map(format_ts))
        .bind(&file.metadata.checksum)
        .bind(Utc::now().timestamp())
        .execute(&mut *tx)
        .await?;

        for doc in &file.documents {
            sqlx::query(
                "INSERT INTO file_documents (id, file_id, dataset, doc_index) VALUES (?, ?, ?, ?)",
            )
            .bind(&doc.id)
            .bind(&file.id)
            .bind(&file.dataset)
            .bind(doc.index)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_file(&self, id: &str) -> Result<Option<File>> {
        let mut query = QueryBuilder::new(format!("SELECT {} FROM files WHERE id = ", FILE_COLUMNS));
        query.push_bind(id);
        Ok(self.fetch_files(query, true).await?.into_iter().next())
    }

    async fn find_file(&self, dataset: &str, file_id: &str) -> Result<Option<File>> {
        let mut query = QueryBuilder::new(format!("SELECT {} FROM files WHERE id = ", FILE_COLUMNS));
        query.push_bind(file_id);
        query.push(" AND dataset = ");
        query.push_bind(dataset);
        Ok(self.fetch_files(query, true).await?.into_iter().next())
    }

    async fn find_files_by_metadata(
        &self,
        dataset: Option<&str>,
        filter: &FileMetadata,
        include_documents: bool,
    ) -> Result<Vec<File>> {
        let mut query = QueryBuilder::new(format!("SELECT {} FROM files WHERE 1 = 1", FILE_COLUMNS));
        if let Some(dataset) = dataset {
            query.push(" AND dataset = ");
            query.push_bind(dataset.to_string());
        }
        if !filter.name.is_empty() {
            query.push(" AND name = ");
            query.push_bind(filter.name.clone());
        }
        if !filter.absolute_path.is_empty() {
            query.push(" AND absolute_path = ");
            query.push_bind(filter.absolute_path.clone());
        }
        if !filter.checksum.is_empty() {
            query.push(" AND checksum = ");
            query.push_bind(filter.checksum.clone());
        }
        if filter.size != 0 {
            query.push(" AND size = ");
            query.push_bind(filter.size);
        }
        if let Some(ts) = &filter.modified_at {
            query.push(" AND modified_at = ");
            query.push_bind(format_ts(ts));
        }
        self.fetch_files(query, include_documents).await
    }

    async fn delete_file(&self, dataset: &str, file_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM file_documents WHERE file_id = ? AND dataset = ?")
            .bind(file_id)
            .bind(dataset)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM files WHERE id = ? AND dataset = ?")
            .bind(file_id)
            .bind(dataset)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn delete_document(&self, dataset: &str, document_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM file_documents WHERE id = ? AND dataset = ?")
            .bind(document_id)
            .bind(dataset)
            .execute(&mut *tx)
            .await?;
        // Files left without chunks go too.
        sqlx::query(
            "DELETE FROM files WHERE dataset = ? AND id NOT IN (SELECT DISTINCT file_id FROM file_documents)",
        )
        .bind(dataset)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_dataset_for_document(&self, document_id: &str) -> Result<Option<Dataset>> {
        match self.file_owning_document(document_id).await? {
            Some(file) => self.get_dataset(&file.dataset).await,
            None => Ok(None),
        }
    }

    async fn get_file_for_document(&self, document_id: &str) -> Result<Option<File>> {
        self.file_owning_document(document_id).await
    }
}
