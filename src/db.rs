//! SQLite connection management and backend selection.
//!
//! Backends are chosen once, by connection-string scheme:
//!
//! | DSN | Backend |
//! |-----|---------|
//! | `sqlite://<path>` | [`SqliteIndex`] / [`SqliteVectorstore`] |
//! | `memory://` | [`InMemoryIndex`] / [`InMemoryVectorstore`] |
//!
//! # Write-Ahead Logging (WAL)
//!
//! WAL mode is enabled for all connections, which allows concurrent
//! readers and a single writer without blocking.
//!
//! # Connection Pool
//!
//! Uses `sqlx::SqlitePool` with up to 5 concurrent connections. When the
//! index and the vectorstore point at the same file they share one pool.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use knowledge_core::embedding::EmbeddingFunc;
use knowledge_core::index::memory::InMemoryIndex;
use knowledge_core::index::Index;
use knowledge_core::vectorstore::memory::InMemoryVectorstore;
use knowledge_core::vectorstore::Vectorstore;
use knowledge_core::Error;

use crate::migrate;
use crate::sqlite_index::SqliteIndex;
use crate::sqlite_vectorstore::SqliteVectorstore;

/// A parsed backend connection string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dsn {
    Sqlite(PathBuf),
    Memory,
}

impl FromStr for Dsn {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if let Some(path) = s.strip_prefix("sqlite://") {
            if path.is_empty() {
                return Err(Error::Config(format!("sqlite DSN without a path: {:?}", s)));
            }
            return Ok(Dsn::Sqlite(PathBuf::from(path)));
        }
        if s == "memory://" || s == "memory" {
            return Ok(Dsn::Memory);
        }
        Err(Error::Config(format!(
            "unsupported backend DSN {:?} (expected sqlite://<path> or memory://)",
            s
        )))
    }
}

/// Create a connection pool to a SQLite database file.
///
/// - Creates the database file and parent directories if they don't exist.
/// - Enables WAL journal mode for concurrent read/write.
/// - Returns a pool with up to 5 connections.
pub async fn connect(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// The two storage backends a datastore runs on.
pub struct Backends {
    pub index: Arc<dyn Index>,
    pub vectorstore: Arc<dyn Vectorstore>,
}

/// Open (and migrate) the backends named by two DSNs.
///
/// `default_embedder` is the vectorstore's embedder for calls that do not
/// supply one.
pub async fn open_backends(
    index_dsn: &str,
    vectorstore_dsn: &str,
    default_embedder: EmbeddingFunc,
) -> knowledge_core::Result<Backends> {
    let index_dsn: Dsn = index_dsn.parse()?;
    let vectorstore_dsn: Dsn = vectorstore_dsn.parse()?;

    let mut index_pool: Option<(PathBuf, SqlitePool)> = None;

    let index: Arc<dyn Index> = match index_dsn {
        Dsn::Memory => Arc::new(InMemoryIndex::new()),
        Dsn::Sqlite(path) => {
            let pool = open_sqlite(&path)
                .await
                .map_err(|e| Error::backend("open index", e))?;
            index_pool = Some((path, pool.clone()));
            Arc::new(SqliteIndex::new(pool))
        }
    };

    let vectorstore: Arc<dyn Vectorstore> = match vectorstore_dsn {
        Dsn::Memory => Arc::new(InMemoryVectorstore::new(default_embedder)),
        Dsn::Sqlite(path) => {
            let pool = match index_pool {
                Some((index_path, pool)) if index_path == path => pool,
                _ => open_sqlite(&path)
                    .await
                    .map_err(|e| Error::backend("open vectorstore", e))?,
            };
            Arc::new(SqliteVectorstore::new(pool, default_embedder))
        }
    };

    tracing::debug!(component = "db", "storage backends opened");
    Ok(Backends { index, vectorstore })
}

async fn open_sqlite(path: &Path) -> Result<SqlitePool> {
    let pool = connect(path).await?;
    migrate::run_migrations(&pool).await?;
    Ok(pool)
}
