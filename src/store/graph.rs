//! Entity and relationship graph

use super::types::{metadata_from_json, metadata_to_json, Community, Entity, EntityUpsert, Relationship, RelationshipInsert};
use super::Store;
use crate::error::{EngineError, Result, StoreError};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::{debug, warn};

fn entity_from_row(row: &SqliteRow) -> Entity {
    let metadata: String = row.get("metadata");
    Entity {
        id: row.get("id"),
        name: row.get("name"),
        entity_type: row.get("entity_type"),
        description: row.get("description"),
        name_en: row.get("name_en"),
        metadata: metadata_from_json(&metadata),
    }
}

impl Store {
    /// Upsert an entity and link it to a chunk in a single transaction.
    ///
    /// The two-statement form (upsert, then link) loses an FK race under
    /// concurrent ingestion: the second writer sees the entity row but its
    /// `entity_chunks` insert lands before the row is visible to it. One
    /// transaction, retried once on conflict, closes that window. This is
    /// a contract of the store, not an optimization.
    pub async fn upsert_entity_and_link(
        &self,
        entity: &EntityUpsert,
        chunk_id: i64,
    ) -> Result<i64> {
        let mut attempt = 0;
        loop {
            match self.try_upsert_entity_and_link(entity, chunk_id).await {
                Ok(id) => return Ok(id),
                Err(EngineError::Store(StoreError::Conflict(message))) if attempt == 0 => {
                    warn!(
                        "Retrying entity upsert for {:?} after conflict: {}",
                        entity.name, message
                    );
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_upsert_entity_and_link(
        &self,
        entity: &EntityUpsert,
        chunk_id: i64,
    ) -> Result<i64> {
        let mut tx = self.pool().begin().await.map_err(StoreError::from_sqlx)?;

        let id: i64 = sqlx::query_scalar(
            r"
            INSERT INTO entities (name, entity_type, description, name_en, metadata)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(name, entity_type) DO UPDATE SET
                description = CASE
                    WHEN excluded.description <> '' THEN excluded.description
                    ELSE entities.description
                END,
                name_en = COALESCE(excluded.name_en, entities.name_en),
                metadata = CASE
                    WHEN excluded.metadata <> '{}' THEN excluded.metadata
                    ELSE entities.metadata
                END
            RETURNING id
            ",
        )
        .bind(&entity.name)
        .bind(&entity.entity_type)
        .bind(&entity.description)
        .bind(&entity.name_en)
        .bind(metadata_to_json(&entity.metadata))
        .fetch_one(&mut *tx)
        .await
        .map_err(StoreError::from_sqlx)?;

        sqlx::query("INSERT OR IGNORE INTO entity_chunks (entity_id, chunk_id) VALUES (?1, ?2)")
            .bind(id)
            .bind(chunk_id)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::from_sqlx)?;

        tx.commit().await.map_err(StoreError::from_sqlx)?;
        Ok(id)
    }

    pub async fn insert_relationship(&self, rel: &RelationshipInsert) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r"
            INSERT INTO relationships (source_entity_id, target_entity_id, relation_type, weight, description, source_chunk_id)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            RETURNING id
            ",
        )
        .bind(rel.source_entity_id)
        .bind(rel.target_entity_id)
        .bind(&rel.relation_type)
        .bind(rel.weight.clamp(0.0, 1.0))
        .bind(&rel.description)
        .bind(rel.source_chunk_id)
        .fetch_one(self.pool())
        .await
        .map_err(StoreError::from_sqlx)?;
        Ok(id)
    }

    pub async fn get_entity(&self, id: i64) -> Result<Option<Entity>> {
        let row = sqlx::query("SELECT * FROM entities WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(StoreError::from_sqlx)?;
        Ok(row.as_ref().map(entity_from_row))
    }

    /// Entities whose name contains any of the given terms,
    /// case-insensitively.
    pub async fn search_entities_by_terms(
        &self,
        terms: &[String],
        limit: usize,
    ) -> Result<Vec<Entity>> {
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let clauses: Vec<String> = (0..terms.len())
            .map(|i| format!("instr(lower(name), lower(?{})) > 0", i + 1))
            .collect();
        let sql = format!(
            "SELECT * FROM entities WHERE {} LIMIT ?{}",
            clauses.join(" OR "),
            terms.len() + 1
        );

        let mut query = sqlx::query(&sql);
        for term in terms {
            query = query.bind(term);
        }
        query = query.bind(limit as i64);

        let rows = query
            .fetch_all(self.pool())
            .await
            .map_err(StoreError::from_sqlx)?;
        Ok(rows.iter().map(entity_from_row).collect())
    }

    /// Best-effort cross-language lookup through the optional English name.
    pub async fn search_entities_by_name_en(
        &self,
        terms: &[String],
        limit: usize,
    ) -> Result<Vec<Entity>> {
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let clauses: Vec<String> = (0..terms.len())
            .map(|i| format!("instr(lower(coalesce(name_en, '')), lower(?{})) > 0", i + 1))
            .collect();
        let sql = format!(
            "SELECT * FROM entities WHERE {} LIMIT ?{}",
            clauses.join(" OR "),
            terms.len() + 1
        );

        let mut query = sqlx::query(&sql);
        for term in terms {
            query = query.bind(term);
        }
        query = query.bind(limit as i64);

        let rows = query
            .fetch_all(self.pool())
            .await
            .map_err(StoreError::from_sqlx)?;
        Ok(rows.iter().map(entity_from_row).collect())
    }

    /// Entities one relationship hop away from any of the seeds.
    pub async fn get_related_entities(
        &self,
        entity_ids: &[i64],
        limit: usize,
    ) -> Result<Vec<Entity>> {
        if entity_ids.is_empty() {
            return Ok(Vec::new());
        }

        let p1 = placeholders(entity_ids.len(), 0);
        let p2 = placeholders(entity_ids.len(), entity_ids.len());
        let p3 = placeholders(entity_ids.len(), entity_ids.len() * 2);
        let sql = format!(
            r"
            SELECT DISTINCT e.* FROM entities e
            JOIN relationships r
              ON (r.target_entity_id = e.id AND r.source_entity_id IN ({p1}))
              OR (r.source_entity_id = e.id AND r.target_entity_id IN ({p2}))
            WHERE e.id NOT IN ({p3})
            LIMIT ?{last}
            ",
            last = entity_ids.len() * 3 + 1
        );

        let mut query = sqlx::query(&sql);
        for _ in 0..3 {
            for id in entity_ids {
                query = query.bind(id);
            }
        }
        query = query.bind(limit as i64);

        let rows = query
            .fetch_all(self.pool())
            .await
            .map_err(StoreError::from_sqlx)?;
        Ok(rows.iter().map(entity_from_row).collect())
    }

    /// Relationships touching any of the given entities.
    pub async fn relationships_for_entities(
        &self,
        entity_ids: &[i64],
    ) -> Result<Vec<Relationship>> {
        if entity_ids.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT * FROM relationships WHERE source_entity_id IN ({p1}) OR target_entity_id IN ({p2})",
            p1 = placeholders(entity_ids.len(), 0),
            p2 = placeholders(entity_ids.len(), entity_ids.len()),
        );

        let mut query = sqlx::query(&sql);
        for _ in 0..2 {
            for id in entity_ids {
                query = query.bind(id);
            }
        }

        let rows = query
            .fetch_all(self.pool())
            .await
            .map_err(StoreError::from_sqlx)?;
        Ok(rows
            .iter()
            .map(|row| Relationship {
                id: row.get("id"),
                source_entity_id: row.get("source_entity_id"),
                target_entity_id: row.get("target_entity_id"),
                relation_type: row.get("relation_type"),
                weight: row.get("weight"),
                description: row.get("description"),
                source_chunk_id: row.get("source_chunk_id"),
            })
            .collect())
    }

    /// Store or refresh a community clustering row.
    pub async fn upsert_community(
        &self,
        id: Option<i64>,
        level: i64,
        summary: &str,
        entity_ids: &[i64],
    ) -> Result<i64> {
        let entity_json =
            serde_json::to_string(entity_ids).unwrap_or_else(|_| "[]".to_string());
        let id: i64 = match id {
            Some(id) => {
                sqlx::query(
                    "UPDATE communities SET level = ?1, summary = ?2, entity_ids = ?3 WHERE id = ?4",
                )
                .bind(level)
                .bind(summary)
                .bind(&entity_json)
                .bind(id)
                .execute(self.pool())
                .await
                .map_err(StoreError::from_sqlx)?;
                id
            }
            None => sqlx::query_scalar(
                "INSERT INTO communities (level, summary, entity_ids) VALUES (?1, ?2, ?3) RETURNING id",
            )
            .bind(level)
            .bind(summary)
            .bind(&entity_json)
            .fetch_one(self.pool())
            .await
            .map_err(StoreError::from_sqlx)?,
        };
        debug!("Upserted community {}", id);
        Ok(id)
    }

    pub async fn list_communities(&self) -> Result<Vec<Community>> {
        let rows = sqlx::query("SELECT * FROM communities ORDER BY level, id")
            .fetch_all(self.pool())
            .await
            .map_err(StoreError::from_sqlx)?;
        Ok(rows
            .iter()
            .map(|row| {
                let entity_ids: String = row.get("entity_ids");
                Community {
                    id: row.get("id"),
                    level: row.get("level"),
                    summary: row.get("summary"),
                    entity_ids: serde_json::from_str(&entity_ids).unwrap_or_default(),
                }
            })
            .collect())
    }

    /// Count of entity→chunk links, used by tests and diagnostics.
    pub async fn entity_link_count(&self, entity_id: i64) -> Result<usize> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM entity_chunks WHERE entity_id = ?1")
                .bind(entity_id)
                .fetch_one(self.pool())
                .await
                .map_err(StoreError::from_sqlx)?;
        Ok(count as usize)
    }
}

fn placeholders(count: usize, offset: usize) -> String {
    (0..count)
        .map(|i| format!("?{}", offset + i + 1))
        .collect::<Vec<_>>()
        .join(", ")
}
