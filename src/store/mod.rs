//! Persistent storage for documents, chunks, embeddings and the entity graph
//!
//! Sole owner of the schema. A single `SqlitePool` serializes writes; the
//! vector index is a sqlite-vec `vec0` virtual table whose dimension is
//! stamped into the DDL at creation and cannot change without rebuilding
//! the store.

mod chunks;
mod documents;
mod graph;
mod schema;
mod search;
mod types;

pub use types::{
    Chunk, ChunkImage, ChunkImageInsert, Community, Document, DocumentStatus, DocumentUpsert,
    Entity, EntityUpsert, QueryLogEntry, Relationship, RelationshipInsert, SearchHit, StoreStats,
};

use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use schema::{CURRENT_SCHEMA_VERSION, MIGRATIONS, SCHEMA_VERSION_TABLE};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::sync::Once;
use std::time::Duration;
use tracing::{debug, info};

static VEC_EXTENSION: Once = Once::new();

/// Register the sqlite-vec extension for every future connection.
///
/// SAFETY: `sqlite3_vec_init` is the extension entry point exported by the
/// sqlite-vec crate; `sqlite3_auto_extension` expects the sqlite extension
/// init signature, and the transmute adapts the concrete fn pointer to the
/// FFI-declared one. This is the registration pattern documented by the
/// sqlite-vec crate.
#[allow(unsafe_code)]
fn register_vector_extension() {
    VEC_EXTENSION.call_once(|| unsafe {
        libsqlite3_sys::sqlite3_auto_extension(Some(std::mem::transmute(
            sqlite_vec::sqlite3_vec_init as *const (),
        )));
    });
}

/// The persistent store
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    dimension: usize,
}

impl Store {
    /// Open or create the store, apply migrations and validate the vector
    /// index dimension.
    pub async fn open(config: &StoreConfig) -> Result<Self> {
        register_vector_extension();

        let in_memory = config.database_path == ":memory:";
        if !in_memory {
            if let Some(parent) = Path::new(&config.database_path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(&config.database_path)
            .in_memory(in_memory)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        // A second :memory: connection would open a different database, so
        // the in-memory pool is pinned to one connection.
        let (max_connections, min_connections) = if in_memory {
            (1, 1)
        } else {
            (config.max_connections, config.min_connections)
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .max_lifetime(Duration::from_secs(config.connection_lifetime_secs))
            .connect_with(options)
            .await
            .map_err(StoreError::from_sqlx)?;

        let store = Self {
            pool,
            dimension: config.embedding_dimension,
        };
        store.migrate().await?;
        store.ensure_vector_table().await?;

        info!(
            "Store ready at {} (schema v{}, dimension {})",
            config.database_path, CURRENT_SCHEMA_VERSION, config.embedding_dimension
        );
        Ok(store)
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Configured embedding dimension
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Apply any outstanding migrations, each in its own transaction.
    async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA_VERSION_TABLE)
            .execute(&self.pool)
            .await
            .map_err(StoreError::from_sqlx)?;

        let current: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
                .fetch_one(&self.pool)
                .await
                .map_err(StoreError::from_sqlx)?;
        let current = current.unwrap_or(0);

        for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
            debug!(
                "Applying migration v{}: {}",
                migration.version, migration.description
            );
            let mut tx = self.pool.begin().await.map_err(StoreError::from_sqlx)?;
            sqlx::raw_sql(migration.sql)
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::Migration(format!("v{}: {e}", migration.version)))?;
            sqlx::query(
                "INSERT INTO schema_version (version, description, applied_at) VALUES (?1, ?2, ?3)",
            )
            .bind(migration.version)
            .bind(migration.description)
            .bind(chrono::Utc::now().to_rfc3339())
            .execute(&mut *tx)
            .await
            .map_err(StoreError::from_sqlx)?;
            tx.commit().await.map_err(StoreError::from_sqlx)?;
        }

        Ok(())
    }

    /// Create the vec0 virtual table, or verify its stamped dimension.
    async fn ensure_vector_table(&self) -> Result<()> {
        let existing: Option<String> = sqlx::query_scalar(
            "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = 'vec_chunks'",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::from_sqlx)?;

        match existing {
            Some(ddl) => {
                let existing_dim = parse_vec_dimension(&ddl).unwrap_or(0);
                if existing_dim != self.dimension {
                    return Err(StoreError::VectorDimension {
                        existing: existing_dim,
                        configured: self.dimension,
                    }
                    .into());
                }
            }
            None => {
                let ddl = format!(
                    "CREATE VIRTUAL TABLE vec_chunks USING vec0(chunk_id INTEGER PRIMARY KEY, embedding FLOAT[{}] distance_metric=cosine)",
                    self.dimension
                );
                sqlx::query(&ddl)
                    .execute(&self.pool)
                    .await
                    .map_err(StoreError::from_sqlx)?;
            }
        }

        Ok(())
    }

    /// Aggregate counters, for the CLI `list` summary and diagnostics.
    pub async fn stats(&self) -> Result<StoreStats> {
        let documents = self.count("SELECT COUNT(*) FROM documents").await?;
        let chunks = self.count("SELECT COUNT(*) FROM chunks").await?;
        let embeddings = self.count("SELECT COUNT(*) FROM vec_chunks").await?;
        let entities = self.count("SELECT COUNT(*) FROM entities").await?;
        let relationships = self.count("SELECT COUNT(*) FROM relationships").await?;

        let schema_version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
                .fetch_one(&self.pool)
                .await
                .map_err(StoreError::from_sqlx)?;

        Ok(StoreStats {
            documents,
            chunks,
            embeddings,
            entities,
            relationships,
            schema_version: schema_version.unwrap_or(0),
        })
    }

    async fn count(&self, sql: &str) -> Result<usize> {
        let row = sqlx::query(sql)
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::from_sqlx)?;
        let count: i64 = row.get(0);
        Ok(count as usize)
    }
}

/// Parse the dimension out of a vec0 CREATE TABLE statement.
fn parse_vec_dimension(ddl: &str) -> Option<usize> {
    let lower = ddl.to_ascii_lowercase();
    let start = lower.find("float[")? + "float[".len();
    let end = lower[start..].find(']')? + start;
    lower[start..end].trim().parse().ok()
}
