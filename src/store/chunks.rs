//! Chunk batches, embeddings and extracted images

use super::types::{embedding_to_bytes, metadata_from_json, metadata_to_json, Chunk, ChunkImage, ChunkImageInsert};
use super::Store;
use crate::chunker::{content_hash, PendingChunk};
use crate::error::{Result, StoreError};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::debug;

fn chunk_from_row(row: &SqliteRow) -> Chunk {
    let metadata: String = row.get("metadata");
    Chunk {
        id: row.get("id"),
        document_id: row.get("document_id"),
        parent_chunk_id: row.get("parent_chunk_id"),
        content: row.get("content"),
        chunk_type: row.get("chunk_type"),
        heading: row.get("heading"),
        page_number: row.get("page_number"),
        position_in_doc: row.get("position_in_doc"),
        token_count: row.get("token_count"),
        metadata: metadata_from_json(&metadata),
        content_hash: row.get("content_hash"),
    }
}

impl Store {
    /// Insert a chunk batch atomically, remapping each chunk's temporary
    /// parent position to the real row id assigned earlier in the same
    /// batch. Returns real ids in input order. The FTS mirror is kept in
    /// sync by triggers.
    pub async fn insert_chunks(
        &self,
        document_id: i64,
        chunks: &[PendingChunk],
    ) -> Result<Vec<i64>> {
        let mut tx = self.pool().begin().await.map_err(StoreError::from_sqlx)?;
        let mut real_ids: Vec<i64> = Vec::with_capacity(chunks.len());

        for chunk in chunks {
            let parent_id = match chunk.parent {
                Some(position) => Some(*real_ids.get(position).ok_or_else(|| {
                    StoreError::Conflict(format!(
                        "chunk at position {} references unseen parent {}",
                        chunk.position, position
                    ))
                })?),
                None => None,
            };

            let id: i64 = sqlx::query_scalar(
                r"
                INSERT INTO chunks (document_id, parent_chunk_id, content, chunk_type, heading, page_number, position_in_doc, token_count, metadata, content_hash)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                RETURNING id
                ",
            )
            .bind(document_id)
            .bind(parent_id)
            .bind(&chunk.content)
            .bind(chunk.chunk_type.as_str())
            .bind(&chunk.heading)
            .bind(chunk.page_number)
            .bind(chunk.position as i64)
            .bind(chunk.token_count as i64)
            .bind(metadata_to_json(&chunk.metadata))
            .bind(content_hash(&chunk.content))
            .fetch_one(&mut *tx)
            .await
            .map_err(StoreError::from_sqlx)?;

            real_ids.push(id);
        }

        tx.commit().await.map_err(StoreError::from_sqlx)?;
        debug!(
            "Inserted {} chunks for document {}",
            real_ids.len(),
            document_id
        );
        Ok(real_ids)
    }

    pub async fn get_chunk(&self, id: i64) -> Result<Option<Chunk>> {
        let row = sqlx::query("SELECT * FROM chunks WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(StoreError::from_sqlx)?;
        Ok(row.as_ref().map(chunk_from_row))
    }

    pub async fn get_chunks_for_document(&self, document_id: i64) -> Result<Vec<Chunk>> {
        let rows =
            sqlx::query("SELECT * FROM chunks WHERE document_id = ?1 ORDER BY position_in_doc")
                .bind(document_id)
                .fetch_all(self.pool())
                .await
                .map_err(StoreError::from_sqlx)?;
        Ok(rows.iter().map(chunk_from_row).collect())
    }

    pub async fn chunk_count(&self, document_id: i64) -> Result<usize> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE document_id = ?1")
                .bind(document_id)
                .fetch_one(self.pool())
                .await
                .map_err(StoreError::from_sqlx)?;
        Ok(count as usize)
    }

    /// Chunk ids whose content or heading contains `needle`,
    /// case-insensitively. Used by the evaluator's coverage diagnosis.
    pub async fn find_chunks_containing(&self, needle: &str, limit: usize) -> Result<Vec<i64>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            r"
            SELECT id FROM chunks
            WHERE instr(lower(content), lower(?1)) > 0
               OR instr(lower(heading), lower(?1)) > 0
            LIMIT ?2
            ",
        )
        .bind(needle)
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await
        .map_err(StoreError::from_sqlx)?;
        Ok(ids)
    }

    /// Attach an embedding to a chunk; re-insert replaces.
    pub async fn upsert_embedding(&self, chunk_id: i64, embedding: &[f32]) -> Result<()> {
        self.upsert_embeddings(&[(chunk_id, embedding.to_vec())]).await
    }

    /// Attach embeddings to chunks in one transaction; re-insert replaces.
    pub async fn upsert_embeddings(&self, embeddings: &[(i64, Vec<f32>)]) -> Result<()> {
        let mut tx = self.pool().begin().await.map_err(StoreError::from_sqlx)?;

        for (chunk_id, embedding) in embeddings {
            if embedding.len() != self.dimension() {
                return Err(crate::error::ProviderError::DimensionMismatch {
                    expected: self.dimension(),
                    actual: embedding.len(),
                }
                .into());
            }
            // vec0 has no upsert; replace is delete + insert
            sqlx::query("DELETE FROM vec_chunks WHERE chunk_id = ?1")
                .bind(chunk_id)
                .execute(&mut *tx)
                .await
                .map_err(StoreError::from_sqlx)?;
            sqlx::query("INSERT INTO vec_chunks (chunk_id, embedding) VALUES (?1, ?2)")
                .bind(chunk_id)
                .bind(embedding_to_bytes(embedding))
                .execute(&mut *tx)
                .await
                .map_err(StoreError::from_sqlx)?;
        }

        tx.commit().await.map_err(StoreError::from_sqlx)?;
        Ok(())
    }

    pub async fn has_embedding(&self, chunk_id: i64) -> Result<bool> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM vec_chunks WHERE chunk_id = ?1")
                .bind(chunk_id)
                .fetch_one(self.pool())
                .await
                .map_err(StoreError::from_sqlx)?;
        Ok(count > 0)
    }

    pub async fn insert_chunk_image(&self, image: &ChunkImageInsert) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r"
            INSERT INTO chunk_images (chunk_id, document_id, caption, mime_type, width, height, page_number, data)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            RETURNING id
            ",
        )
        .bind(image.chunk_id)
        .bind(image.document_id)
        .bind(&image.caption)
        .bind(&image.mime_type)
        .bind(image.width)
        .bind(image.height)
        .bind(image.page_number)
        .bind(&image.data)
        .fetch_one(self.pool())
        .await
        .map_err(StoreError::from_sqlx)?;
        Ok(id)
    }

    pub async fn images_for_chunk(&self, chunk_id: i64) -> Result<Vec<ChunkImage>> {
        let rows = sqlx::query("SELECT * FROM chunk_images WHERE chunk_id = ?1 ORDER BY id")
            .bind(chunk_id)
            .fetch_all(self.pool())
            .await
            .map_err(StoreError::from_sqlx)?;

        Ok(rows
            .iter()
            .map(|row| ChunkImage {
                id: row.get("id"),
                chunk_id: row.get("chunk_id"),
                document_id: row.get("document_id"),
                caption: row.get("caption"),
                mime_type: row.get("mime_type"),
                width: row.get("width"),
                height: row.get("height"),
                page_number: row.get("page_number"),
                data: row.get("data"),
            })
            .collect())
    }
}
