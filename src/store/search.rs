//! Vector, full-text and graph search over stored chunks

use super::types::{embedding_to_bytes, SearchHit};
use super::Store;
use crate::error::{ProviderError, Result, StoreError};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::debug;

fn hit_from_row(row: &SqliteRow) -> SearchHit {
    SearchHit {
        chunk_id: row.get("chunk_id"),
        document_id: row.get("document_id"),
        content: row.get("content"),
        heading: row.get("heading"),
        chunk_type: row.get("chunk_type"),
        page_number: row.get("page_number"),
        filename: row.get("filename"),
        path: row.get("path"),
        score: row.get("score"),
    }
}

impl Store {
    /// KNN search over the vec0 index. Results are sorted by descending
    /// `score = 1 − cosine distance`.
    pub async fn vector_search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        if query.len() != self.dimension() {
            return Err(ProviderError::DimensionMismatch {
                expected: self.dimension(),
                actual: query.len(),
            }
            .into());
        }

        // vec0 MATCH errors on an empty table
        let populated: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM vec_chunks")
            .fetch_one(self.pool())
            .await
            .map_err(StoreError::from_sqlx)?;
        if populated == 0 {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            r"
            SELECT v.chunk_id AS chunk_id, 1.0 - v.distance AS score,
                   c.document_id, c.content, c.heading, c.chunk_type, c.page_number,
                   d.filename, d.path
            FROM vec_chunks v
            JOIN chunks c ON c.id = v.chunk_id
            JOIN documents d ON d.id = c.document_id
            WHERE v.embedding MATCH ?1 AND k = ?2
            ORDER BY v.distance
            ",
        )
        .bind(embedding_to_bytes(query))
        .bind(k as i64)
        .fetch_all(self.pool())
        .await
        .map_err(StoreError::from_sqlx)?;

        debug!("Vector search returned {} hits", rows.len());
        Ok(rows.iter().map(hit_from_row).collect())
    }

    /// FTS5 MATCH query. Results are sorted by descending
    /// `score = −bm25 rank`.
    pub async fn fts_search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            r"
            SELECT chunks_fts.rowid AS chunk_id, -bm25(chunks_fts) AS score,
                   c.document_id, c.content, c.heading, c.chunk_type, c.page_number,
                   d.filename, d.path
            FROM chunks_fts
            JOIN chunks c ON c.id = chunks_fts.rowid
            JOIN documents d ON d.id = c.document_id
            WHERE chunks_fts MATCH ?1
            ORDER BY score DESC
            LIMIT ?2
            ",
        )
        .bind(query)
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await
        .map_err(StoreError::from_sqlx)?;

        debug!("FTS search for {:?} returned {} hits", query, rows.len());
        Ok(rows.iter().map(hit_from_row).collect())
    }

    /// Distinct chunks linked to any of the seed entities through
    /// `entity_chunks`. A chunk scores the maximum weight of any
    /// relationship touching its linking entity, defaulting to 0.5.
    pub async fn graph_search(&self, entity_ids: &[i64], limit: usize) -> Result<Vec<SearchHit>> {
        if entity_ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders: Vec<String> = (0..entity_ids.len())
            .map(|i| format!("?{}", i + 1))
            .collect();
        let sql = format!(
            r"
            SELECT c.id AS chunk_id, COALESCE(MAX(r.weight), 0.5) AS score,
                   c.document_id, c.content, c.heading, c.chunk_type, c.page_number,
                   d.filename, d.path
            FROM entity_chunks ec
            JOIN chunks c ON c.id = ec.chunk_id
            JOIN documents d ON d.id = c.document_id
            LEFT JOIN relationships r
              ON r.source_entity_id = ec.entity_id OR r.target_entity_id = ec.entity_id
            WHERE ec.entity_id IN ({})
            GROUP BY c.id
            ORDER BY score DESC, c.id
            LIMIT ?{}
            ",
            placeholders.join(", "),
            entity_ids.len() + 1
        );

        let mut query = sqlx::query(&sql);
        for id in entity_ids {
            query = query.bind(id);
        }
        query = query.bind(limit as i64);

        let rows = query
            .fetch_all(self.pool())
            .await
            .map_err(StoreError::from_sqlx)?;

        debug!(
            "Graph search over {} entities returned {} hits",
            entity_ids.len(),
            rows.len()
        );
        Ok(rows.iter().map(hit_from_row).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::memory_store;
    use super::super::types::{DocumentStatus, DocumentUpsert, EntityUpsert, RelationshipInsert};
    use super::*;
    use crate::chunker::{ChunkType, PendingChunk};
    use std::collections::HashMap;

    async fn seed(store: &Store, contents: &[&str]) -> Vec<i64> {
        let doc = store
            .upsert_document(&DocumentUpsert {
                path: "/docs/search.txt".to_string(),
                filename: "search.txt".to_string(),
                format: "txt".to_string(),
                content_hash: "hash".to_string(),
                parse_method: "native".to_string(),
                status: DocumentStatus::Ready,
                metadata: HashMap::new(),
            })
            .await
            .unwrap();
        let batch: Vec<PendingChunk> = contents
            .iter()
            .enumerate()
            .map(|(i, content)| PendingChunk {
                position: i,
                parent: None,
                content: content.to_string(),
                chunk_type: ChunkType::Paragraph,
                heading: format!("Heading {i}"),
                page_number: 1,
                token_count: 5,
                metadata: HashMap::new(),
            })
            .collect();
        store.insert_chunks(doc, &batch).await.unwrap()
    }

    #[tokio::test]
    async fn test_vector_search_nearest_first() {
        let store = memory_store(4).await;
        let ids = seed(&store, &["alpha text", "beta text", "gamma text"]).await;

        store
            .upsert_embeddings(&[
                (ids[0], vec![1.0, 0.0, 0.0, 0.0]),
                (ids[1], vec![0.0, 1.0, 0.0, 0.0]),
                (ids[2], vec![0.9, 0.1, 0.0, 0.0]),
            ])
            .await
            .unwrap();

        let hits = store.vector_search(&[1.0, 0.0, 0.0, 0.0], 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        // exact match first, with score ≈ 1
        assert_eq!(hits[0].chunk_id, ids[0]);
        assert!(hits[0].score > 0.99);
        assert_eq!(hits[1].chunk_id, ids[2]);
        assert!(hits[0].score >= hits[1].score);
    }

    #[tokio::test]
    async fn test_vector_search_empty_index() {
        let store = memory_store(4).await;
        seed(&store, &["alpha"]).await;
        let hits = store.vector_search(&[1.0, 0.0, 0.0, 0.0], 5).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_vector_search_wrong_dimension() {
        let store = memory_store(4).await;
        assert!(store.vector_search(&[1.0, 0.0], 5).await.is_err());
    }

    #[tokio::test]
    async fn test_fts_search_matches_content_and_heading() {
        let store = memory_store(4).await;
        let ids = seed(
            &store,
            &[
                "The minimum tensile strength is 500 MPa",
                "Unrelated paragraph about packaging",
            ],
        )
        .await;

        let hits = store.fts_search("tensile", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, ids[0]);
        assert_eq!(hits[0].filename, "search.txt");

        // heading terms are indexed too
        let hits = store.fts_search("\"Heading\"", 10).await.unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[tokio::test]
    async fn test_fts_rows_follow_chunk_deletes() {
        let store = memory_store(4).await;
        seed(&store, &["searchable body"]).await;
        assert_eq!(store.fts_search("searchable", 10).await.unwrap().len(), 1);

        let doc = store
            .get_document_by_path("/docs/search.txt")
            .await
            .unwrap()
            .unwrap();
        store.delete_document(doc.id).await.unwrap();
        assert!(store.fts_search("searchable", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_graph_search_scores_and_soundness() {
        let store = memory_store(4).await;
        let ids = seed(&store, &["steel chunk", "aluminium chunk"]).await;

        let steel = store
            .upsert_entity_and_link(
                &EntityUpsert {
                    name: "steel".to_string(),
                    entity_type: "material".to_string(),
                    ..Default::default()
                },
                ids[0],
            )
            .await
            .unwrap();
        let aluminium = store
            .upsert_entity_and_link(
                &EntityUpsert {
                    name: "aluminium".to_string(),
                    entity_type: "material".to_string(),
                    ..Default::default()
                },
                ids[1],
            )
            .await
            .unwrap();
        store
            .insert_relationship(&RelationshipInsert {
                source_entity_id: steel,
                target_entity_id: aluminium,
                relation_type: "alternative_to".to_string(),
                weight: 0.8,
                description: String::new(),
                source_chunk_id: Some(ids[0]),
            })
            .await
            .unwrap();

        // only the seeded entity's chunk comes back
        let hits = store.graph_search(&[steel], 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, ids[0]);
        assert!((hits[0].score - 0.8).abs() < 1e-9);

        // an entity with no relationships defaults to 0.5
        let unlinked = store
            .upsert_entity_and_link(
                &EntityUpsert {
                    name: "zinc".to_string(),
                    entity_type: "material".to_string(),
                    ..Default::default()
                },
                ids[1],
            )
            .await
            .unwrap();
        let hits = store.graph_search(&[unlinked], 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!((hits[0].score - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_graph_search_no_seeds() {
        let store = memory_store(4).await;
        assert!(store.graph_search(&[], 10).await.unwrap().is_empty());
    }
}
