//! SQLite-backed [`Vectorstore`] implementation.
//!
//! Chunks live in the `documents` table with their metadata as JSON text
//! and their embedding as a little-endian f32 BLOB. Similarity is brute
//! force: candidate rows are loaded and scored with cosine similarity in
//! Rust.
//!
//! Content filters are pushed into SQL (`instr` is a case-sensitive
//! substring test, matching [`WhereDocument::matches`]). Metadata filters
//! are narrowed in SQL to rows carrying the key, then compared in Rust so
//! that non-string values follow the same rendering rules as the
//! in-memory backend.

use std::path::Path;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{Sqlite, SqliteRow};
use sqlx::{QueryBuilder, Row, SqlitePool};

use knowledge_core::embedding::{blob_to_vec, vec_to_blob, EmbeddingFunc};
use knowledge_core::filter::{matches_metadata, MetadataFilter, WhereDocument};
use knowledge_core::models::{Document, Metadata};
use knowledge_core::vectorstore::{
    ensure_targeted_removal, prepare_documents, rank_by_similarity, CollectionExport, ExportFile,
    Vectorstore,
};

/// SQLite implementation of the [`Vectorstore`] trait.
pub struct SqliteVectorstore {
    pool: SqlitePool,
    default_embedder: EmbeddingFunc,
}

impl SqliteVectorstore {
    pub fn new(pool: SqlitePool, default_embedder: EmbeddingFunc) -> Self {
        Self {
            pool,
            default_embedder,
        }
    }

    fn embedder(&self, embedder: Option<EmbeddingFunc>) -> EmbeddingFunc {
        embedder.unwrap_or_else(|| self.default_embedder.clone())
    }

    async fn collection_exists(&self, collection: &str) -> Result<bool> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) > 0 FROM collections WHERE name = ?")
                .bind(collection)
                .fetch_one(&self.pool)
                .await?,
        )
    }

    async fn collection_names(&self) -> Result<Vec<String>> {
        Ok(
            sqlx::query_scalar("SELECT name FROM collections ORDER BY name ASC")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    /// Load the rows of `collection` (or every collection) passing the
    /// filters, optionally restricted to one id.
    async fn select(
        &self,
        collection: Option<&str>,
        document_id: Option<&str>,
        metadata_filter: &MetadataFilter,
        content_filter: &[WhereDocument],
    ) -> Result<Vec<(String, Document)>> {
        let mut query: QueryBuilder<'_, Sqlite> = QueryBuilder::new(
            "SELECT collection, id, content, metadata_json, embedding FROM documents WHERE 1 = 1",
        );
        if let Some(collection) = collection {
            query.push(" AND collection = ");
            query.push_bind(collection.to_string());
        }
        if let Some(id) = document_id {
            query.push(" AND id = ");
            query.push_bind(id.to_string());
        }
        for key in metadata_filter.keys() {
            query.push(" AND json_type(metadata_json, ");
            query.push_bind(json_path(key));
            query.push(") IS NOT NULL");
        }
        for filter in content_filter {
            query.push(" AND ");
            push_where_document(&mut query, filter);
        }
        query.push(" ORDER BY rowid ASC");

        let rows = query.build().fetch_all(&self.pool).await?;
        let mut docs = Vec::with_capacity(rows.len());
        for row in &rows {
            let doc = document_from_row(row)?;
            if matches_metadata(metadata_filter, &doc) {
                docs.push((row.get("collection"), doc));
            }
        }
        Ok(docs)
    }

    async fn upsert(&self, docs: &[Document], collection: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT OR IGNORE INTO collections (name) VALUES (?)")
            .bind(collection)
            .execute(&mut *tx)
            .await?;

        for doc in docs {
            let metadata_json = serde_json::to_string(&doc.metadata)?;
            sqlx::query(
                r#"
                INSERT INTO documents (id, collection, content, metadata_json, embedding)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(collection, id) DO UPDATE SET
                    content = excluded.content,
                    metadata_json = excluded.metadata_json,
                    embedding = excluded.embedding
                "#,
            )
            .bind(&doc.id)
            .bind(collection)
            .bind(&doc.content)
            .bind(metadata_json)
            .bind(vec_to_blob(&doc.embedding))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

fn json_path(key: &str) -> String {
    format!("$.\"{}\"", key.replace('"', "\\\""))
}

/// Append the SQL form of one content filter.
fn push_where_document(query: &mut QueryBuilder<'_, Sqlite>, filter: &WhereDocument) {
    match filter {
        WhereDocument::Equals(v) => {
            query.push("content = ");
            query.push_bind(v.clone());
        }
        WhereDocument::Contains(v) => {
            query.push("instr(content, ");
            query.push_bind(v.clone());
            query.push(") > 0");
        }
        WhereDocument::NotContains(v) => {
            query.push("instr(content, ");
            query.push_bind(v.clone());
            query.push(") = 0");
        }
        WhereDocument::And(children) | WhereDocument::Or(children) => {
            let joiner = if matches!(filter, WhereDocument::And(_)) {
                " AND "
            } else {
                " OR "
            };
            query.push("(");
            for (i, child) in children.iter().enumerate() {
                if i > 0 {
                    query.push(joiner);
                }
                push_where_document(query, child);
            }
            query.push(")");
        }
    }
}

fn document_from_row(row: &SqliteRow) -> Result<Document> {
    let metadata_json: String = row.get("metadata_json");
    let metadata: Metadata = serde_json::from_str(&metadata_json)
        .context("invalid metadata_json in documents table")?;
    let blob: Vec<u8> = row.get("embedding");
    Ok(Document {
        id: row.get("id"),
        content: row.get("content"),
        metadata,
        similarity_score: 0.0,
        embedding: blob_to_vec(&blob),
    })
}

#[async_trait]
impl Vectorstore for SqliteVectorstore {
    async fn create_collection(&self, collection: &str) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO collections (name) VALUES (?)")
            .bind(collection)
            .execute(&self.pool)
            .await?;
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
        self.upsert(&docs, collection).await?;
        Ok(docs.into_iter().map(|d| d.id).collect())
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
        if !self.collection_exists(collection).await? {
            bail!("collection {:?} does not exist", collection);
        }
        let query_vec = self.embedder(embedder).embed(query).await?;
        let candidates = self
            .select(Some(collection), None, metadata_filter, content_filter)
            .await?;
        Ok(rank_by_similarity(
            &query_vec,
            candidates.into_iter().map(|(_, d)| d),
            k,
        ))
    }

    async fn remove_collection(&self, collection: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM documents WHERE collection = ?")
            .bind(collection)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM collections WHERE name = ?")
            .bind(collection)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
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

        let targets = self
            .select(Some(collection), document_id, metadata_filter, content_filter)
            .await?;
        if targets.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for (_, doc) in &targets {
            sqlx::query("DELETE FROM documents WHERE collection = ? AND id = ?")
                .bind(collection)
                .bind(&doc.id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_document(&self, document_id: &str, collection: &str) -> Result<Option<Document>> {
        let row = sqlx::query(
            "SELECT id, content, metadata_json, embedding FROM documents WHERE collection = ? AND id = ?",
        )
        .bind(collection)
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(document_from_row).transpose()
    }

    async fn get_documents(
        &self,
        collection: Option<&str>,
        metadata_filter: &MetadataFilter,
        content_filter: &[WhereDocument],
    ) -> Result<Vec<Document>> {
        Ok(self
            .select(collection, None, metadata_filter, content_filter)
            .await?
            .into_iter()
            .map(|(_, d)| d)
            .collect())
    }

    async fn import_collections_from_file(&self, path: &Path, collections: &[String]) -> Result<()> {
        let mut export = ExportFile::read(path)
            .with_context(|| format!("Failed to read export file: {}", path.display()))?;
        export.retain_collections(collections);
        for c in export.collections {
            let mut docs = c.documents;
            prepare_documents(&mut docs, self.default_embedder.as_ref()).await?;
            self.upsert(&docs, &c.name).await?;
            tracing::debug!(collection = %c.name, documents = docs.len(), "collection imported");
        }
        Ok(())
    }

    async fn export_collections_to_file(&self, path: &Path, collections: &[String]) -> Result<()> {
        let mut export = ExportFile::default();
        for name in self.collection_names().await? {
            let documents = self
                .get_documents(Some(&name), &MetadataFilter::new(), &[])
                .await?;
            export.collections.push(CollectionExport { name, documents });
        }
        export.retain_collections(collections);
        export.write(path)
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}
