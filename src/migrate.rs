//! SQLite schema for the index and vectorstore backends.
//!
//! All statements are idempotent, so migrations run on every open.
//!
//! | Table | Owner | Contents |
//! |-------|-------|----------|
//! | `datasets` | index | dataset id + embedding provider config (JSON) |
//! | `files` | index | file metadata, one row per ingestion |
//! | `file_documents` | index | ordered chunk references of a file |
//! | `collections` | vectorstore | collection names |
//! | `documents` | vectorstore | chunk content, metadata (JSON), embedding (f32 BLOB) |

use anyhow::Result;
use sqlx::SqlitePool;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS datasets (
            id TEXT PRIMARY KEY,
            embeddings_provider_config TEXT,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS files (
            id TEXT PRIMARY KEY,
            dataset TEXT NOT NULL,
            name TEXT NOT NULL,
            absolute_path TEXT NOT NULL,
            size INTEGER NOT NULL DEFAULT 0,
            modified_at TEXT,
            checksum TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (dataset) REFERENCES datasets(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS file_documents (
            id TEXT NOT NULL,
            file_id TEXT NOT NULL,
            dataset TEXT NOT NULL,
            doc_index INTEGER NOT NULL,
            PRIMARY KEY (file_id, id),
            FOREIGN KEY (file_id) REFERENCES files(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS collections (
            name TEXT PRIMARY KEY
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT NOT NULL,
            collection TEXT NOT NULL,
            content TEXT NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            embedding BLOB NOT NULL,
            PRIMARY KEY (collection, id),
            FOREIGN KEY (collection) REFERENCES collections(name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_files_dataset ON files(dataset)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_files_checksum ON files(checksum)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_files_path ON files(dataset, absolute_path)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_file_documents_id ON file_documents(id)")
        .execute(pool)
        .await?;

    Ok(())
}
