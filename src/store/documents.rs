//! Document rows, cascade deletion and the query log

use super::types::{
    metadata_from_json, metadata_to_json, Document, DocumentStatus, DocumentUpsert, QueryLogEntry,
};
use super::Store;
use crate::error::{Result, StoreError};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::{debug, info};

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Decode(format!("bad timestamp {raw:?}: {e}")).into())
}

fn document_from_row(row: &SqliteRow) -> Result<Document> {
    let status: String = row.get("status");
    let metadata: String = row.get("metadata");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");

    Ok(Document {
        id: row.get("id"),
        path: row.get("path"),
        filename: row.get("filename"),
        format: row.get("format"),
        content_hash: row.get("content_hash"),
        parse_method: row.get("parse_method"),
        status: DocumentStatus::parse(&status),
        language: row.get("language"),
        metadata: metadata_from_json(&metadata),
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

impl Store {
    /// Insert or update a document; `path` is the conflict key. Returns the
    /// row id whether the row was inserted or updated.
    pub async fn upsert_document(&self, doc: &DocumentUpsert) -> Result<i64> {
        let now = Utc::now().to_rfc3339();
        let id: i64 = sqlx::query_scalar(
            r"
            INSERT INTO documents (path, filename, format, content_hash, parse_method, status, metadata, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
            ON CONFLICT(path) DO UPDATE SET
                filename = excluded.filename,
                format = excluded.format,
                content_hash = excluded.content_hash,
                parse_method = excluded.parse_method,
                status = excluded.status,
                metadata = excluded.metadata,
                updated_at = excluded.updated_at
            RETURNING id
            ",
        )
        .bind(&doc.path)
        .bind(&doc.filename)
        .bind(&doc.format)
        .bind(&doc.content_hash)
        .bind(&doc.parse_method)
        .bind(doc.status.as_str())
        .bind(metadata_to_json(&doc.metadata))
        .bind(&now)
        .fetch_one(self.pool())
        .await
        .map_err(StoreError::from_sqlx)?;

        debug!("Upserted document {} as id {}", doc.path, id);
        Ok(id)
    }

    pub async fn get_document(&self, id: i64) -> Result<Option<Document>> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(StoreError::from_sqlx)?;
        row.as_ref().map(document_from_row).transpose()
    }

    pub async fn get_document_by_path(&self, path: &str) -> Result<Option<Document>> {
        let row = sqlx::query("SELECT * FROM documents WHERE path = ?1")
            .bind(path)
            .fetch_optional(self.pool())
            .await
            .map_err(StoreError::from_sqlx)?;
        row.as_ref().map(document_from_row).transpose()
    }

    pub async fn list_documents(&self) -> Result<Vec<Document>> {
        let rows = sqlx::query("SELECT * FROM documents ORDER BY id")
            .fetch_all(self.pool())
            .await
            .map_err(StoreError::from_sqlx)?;
        rows.iter().map(document_from_row).collect()
    }

    pub async fn set_document_status(&self, id: i64, status: DocumentStatus) -> Result<()> {
        sqlx::query("UPDATE documents SET status = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(status.as_str())
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(StoreError::from_sqlx)?;
        Ok(())
    }

    pub async fn set_document_parse_method(&self, id: i64, parse_method: &str) -> Result<()> {
        sqlx::query("UPDATE documents SET parse_method = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(parse_method)
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(StoreError::from_sqlx)?;
        Ok(())
    }

    pub async fn set_document_language(&self, id: i64, language: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE documents SET language = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(language)
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(StoreError::from_sqlx)?;
        Ok(())
    }

    /// Transactional cascade: graph links, relationships sourced from the
    /// document's chunks, embeddings, images, chunks, then the document row.
    pub async fn delete_document(&self, id: i64) -> Result<()> {
        self.cascade_delete(id, true).await?;
        info!("Deleted document {}", id);
        Ok(())
    }

    /// The same cascade minus the final row delete: document metadata
    /// survives (used for `failed` cleanup).
    pub async fn delete_document_data(&self, id: i64) -> Result<()> {
        self.cascade_delete(id, false).await?;
        debug!("Deleted data for document {}", id);
        Ok(())
    }

    async fn cascade_delete(&self, id: i64, delete_row: bool) -> Result<()> {
        let mut tx = self.pool().begin().await.map_err(StoreError::from_sqlx)?;

        // children follow their parents in position order, so deleting in
        // reverse position order never violates the parent FK
        let chunk_ids: Vec<i64> = sqlx::query_scalar(
            "SELECT id FROM chunks WHERE document_id = ?1 ORDER BY position_in_doc DESC",
        )
        .bind(id)
        .fetch_all(&mut *tx)
        .await
        .map_err(StoreError::from_sqlx)?;

        sqlx::query(
            "DELETE FROM entity_chunks WHERE chunk_id IN (SELECT id FROM chunks WHERE document_id = ?1)",
        )
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::from_sqlx)?;

        sqlx::query(
            "DELETE FROM relationships WHERE source_chunk_id IN (SELECT id FROM chunks WHERE document_id = ?1)",
        )
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::from_sqlx)?;

        sqlx::query("DELETE FROM chunk_images WHERE document_id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::from_sqlx)?;

        // vec0 tables only support point deletes on the primary key; the
        // FTS mirror rows are removed by the chunk delete trigger
        for chunk_id in &chunk_ids {
            sqlx::query("DELETE FROM vec_chunks WHERE chunk_id = ?1")
                .bind(chunk_id)
                .execute(&mut *tx)
                .await
                .map_err(StoreError::from_sqlx)?;
            sqlx::query("DELETE FROM chunks WHERE id = ?1")
                .bind(chunk_id)
                .execute(&mut *tx)
                .await
                .map_err(StoreError::from_sqlx)?;
        }

        if delete_row {
            sqlx::query("DELETE FROM documents WHERE id = ?1")
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(StoreError::from_sqlx)?;
        }

        tx.commit().await.map_err(StoreError::from_sqlx)?;
        Ok(())
    }

    /// Append one query audit record.
    pub async fn log_query(&self, entry: &QueryLogEntry) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO query_log (id, question, answer, confidence, rounds, sources, error_kind, error_message, elapsed_ms, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ",
        )
        .bind(entry.id.to_string())
        .bind(&entry.question)
        .bind(&entry.answer)
        .bind(entry.confidence)
        .bind(entry.rounds)
        .bind(serde_json::to_string(&entry.sources).unwrap_or_else(|_| "[]".to_string()))
        .bind(&entry.error_kind)
        .bind(&entry.error_message)
        .bind(entry.elapsed_ms)
        .bind(entry.created_at.to_rfc3339())
        .execute(self.pool())
        .await
        .map_err(StoreError::from_sqlx)?;
        Ok(())
    }

    /// Most recent query audit records, newest first.
    pub async fn recent_queries(&self, limit: usize) -> Result<Vec<QueryLogEntry>> {
        let rows = sqlx::query("SELECT * FROM query_log ORDER BY created_at DESC LIMIT ?1")
            .bind(limit as i64)
            .fetch_all(self.pool())
            .await
            .map_err(StoreError::from_sqlx)?;

        rows.iter()
            .map(|row| {
                let id: String = row.get("id");
                let sources: String = row.get("sources");
                let created_at: String = row.get("created_at");
                Ok(QueryLogEntry {
                    id: uuid::Uuid::parse_str(&id)
                        .map_err(|e| StoreError::Decode(e.to_string()))?,
                    question: row.get("question"),
                    answer: row.get("answer"),
                    confidence: row.get("confidence"),
                    rounds: row.get("rounds"),
                    sources: serde_json::from_str(&sources).unwrap_or_default(),
                    error_kind: row.get("error_kind"),
                    error_message: row.get("error_message"),
                    elapsed_ms: row.get("elapsed_ms"),
                    created_at: parse_timestamp(&created_at)?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::memory_store;
    use super::*;
    use std::collections::HashMap;

    fn upsert(path: &str, hash: &str) -> DocumentUpsert {
        DocumentUpsert {
            path: path.to_string(),
            filename: path.rsplit('/').next().unwrap_or(path).to_string(),
            format: "txt".to_string(),
            content_hash: hash.to_string(),
            parse_method: "native".to_string(),
            status: DocumentStatus::Pending,
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_upsert_document_conflict_on_path() {
        let store = memory_store(4).await;

        let first = store.upsert_document(&upsert("/a/doc.txt", "h1")).await.unwrap();
        let second = store.upsert_document(&upsert("/a/doc.txt", "h2")).await.unwrap();
        assert_eq!(first, second);

        let doc = store.get_document(first).await.unwrap().unwrap();
        assert_eq!(doc.content_hash, "h2");
        assert_eq!(store.list_documents().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_status_and_language_updates() {
        let store = memory_store(4).await;
        let id = store.upsert_document(&upsert("/a/doc.txt", "h1")).await.unwrap();

        store
            .set_document_status(id, DocumentStatus::Ready)
            .await
            .unwrap();
        store.set_document_language(id, Some("es")).await.unwrap();

        let doc = store.get_document(id).await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Ready);
        assert_eq!(doc.language.as_deref(), Some("es"));
    }

    #[tokio::test]
    async fn test_get_missing_document_is_none() {
        let store = memory_store(4).await;
        assert!(store.get_document(999).await.unwrap().is_none());
        assert!(store
            .get_document_by_path("/missing")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_query_log_roundtrip() {
        let store = memory_store(4).await;
        let entry = QueryLogEntry {
            id: uuid::Uuid::new_v4(),
            question: "what is the fill level?".to_string(),
            answer: "95 percent".to_string(),
            confidence: 0.8,
            rounds: 1,
            sources: vec!["spec.pdf".to_string()],
            error_kind: None,
            error_message: None,
            elapsed_ms: 120,
            created_at: Utc::now(),
        };
        store.log_query(&entry).await.unwrap();

        let recent = store.recent_queries(10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, entry.id);
        assert_eq!(recent[0].sources, vec!["spec.pdf".to_string()]);
    }
}
