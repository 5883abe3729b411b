//! Row types for the persistent store

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Lifecycle state of an ingested document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Pending,
    Parsing,
    Ready,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Parsing => "parsing",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "parsing" => Self::Parsing,
            "ready" => Self::Ready,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// A stored document row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: i64,
    pub path: String,
    pub filename: String,
    pub format: String,
    pub content_hash: String,
    pub parse_method: String,
    pub status: DocumentStatus,
    pub language: Option<String>,
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for a document upsert; `path` is the conflict key
#[derive(Debug, Clone)]
pub struct DocumentUpsert {
    pub path: String,
    pub filename: String,
    pub format: String,
    pub content_hash: String,
    pub parse_method: String,
    pub status: DocumentStatus,
    pub metadata: HashMap<String, String>,
}

/// A stored chunk row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: i64,
    pub document_id: i64,
    pub parent_chunk_id: Option<i64>,
    pub content: String,
    pub chunk_type: String,
    pub heading: String,
    pub page_number: i32,
    pub position_in_doc: i64,
    pub token_count: i64,
    pub metadata: HashMap<String, String>,
    pub content_hash: String,
}

/// A hit from any of the three searchers, with document provenance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub chunk_id: i64,
    pub document_id: i64,
    pub content: String,
    pub heading: String,
    pub chunk_type: String,
    pub page_number: i32,
    pub filename: String,
    pub path: String,
    pub score: f64,
}

/// A named concept extracted from the corpus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: i64,
    pub name: String,
    pub entity_type: String,
    pub description: String,
    pub name_en: Option<String>,
    pub metadata: HashMap<String, String>,
}

/// Fields for an entity upsert; `(name, entity_type)` is the conflict key
#[derive(Debug, Clone, Default)]
pub struct EntityUpsert {
    pub name: String,
    pub entity_type: String,
    pub description: String,
    pub name_en: Option<String>,
    pub metadata: HashMap<String, String>,
}

/// A directed weighted edge between two entities
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub id: i64,
    pub source_entity_id: i64,
    pub target_entity_id: i64,
    pub relation_type: String,
    pub weight: f64,
    pub description: String,
    pub source_chunk_id: Option<i64>,
}

/// Fields for a relationship insert
#[derive(Debug, Clone)]
pub struct RelationshipInsert {
    pub source_entity_id: i64,
    pub target_entity_id: i64,
    pub relation_type: String,
    pub weight: f64,
    pub description: String,
    pub source_chunk_id: Option<i64>,
}

/// An entity clustering result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Community {
    pub id: i64,
    pub level: i64,
    pub summary: String,
    pub entity_ids: Vec<i64>,
}

/// A binary image extracted from a chunk
#[derive(Debug, Clone)]
pub struct ChunkImage {
    pub id: i64,
    pub chunk_id: i64,
    pub document_id: i64,
    pub caption: String,
    pub mime_type: String,
    pub width: i32,
    pub height: i32,
    pub page_number: i32,
    pub data: Vec<u8>,
}

/// Fields for a chunk image insert
#[derive(Debug, Clone)]
pub struct ChunkImageInsert {
    pub chunk_id: i64,
    pub document_id: i64,
    pub caption: String,
    pub mime_type: String,
    pub width: i32,
    pub height: i32,
    pub page_number: i32,
    pub data: Vec<u8>,
}

/// An append-only audit record for one query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryLogEntry {
    pub id: Uuid,
    pub question: String,
    pub answer: String,
    pub confidence: f64,
    pub rounds: i64,
    /// Source filenames cited by the answer, serialized as JSON
    pub sources: Vec<String>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub elapsed_ms: i64,
    pub created_at: DateTime<Utc>,
}

/// Aggregate store counters
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub documents: usize,
    pub chunks: usize,
    pub embeddings: usize,
    pub entities: usize,
    pub relationships: usize,
    pub schema_version: i64,
}

/// Serialize a metadata map for storage
pub(crate) fn metadata_to_json(metadata: &HashMap<String, String>) -> String {
    serde_json::to_string(metadata).unwrap_or_else(|_| "{}".to_string())
}

/// Deserialize a metadata map from storage
pub(crate) fn metadata_from_json(data: &str) -> HashMap<String, String> {
    serde_json::from_str(data).unwrap_or_default()
}

/// Serialize an embedding as little-endian f32 bytes
pub(crate) fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding
        .iter()
        .flat_map(|f| f.to_le_bytes().to_vec())
        .collect()
}

/// Deserialize an embedding from little-endian f32 bytes
#[allow(dead_code)]
pub(crate) fn embedding_from_bytes(data: &[u8]) -> Vec<f32> {
    data.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_status_roundtrip() {
        for status in [
            DocumentStatus::Pending,
            DocumentStatus::Parsing,
            DocumentStatus::Ready,
            DocumentStatus::Failed,
        ] {
            assert_eq!(DocumentStatus::parse(status.as_str()), status);
        }
    }

    #[test]
    fn test_embedding_serialization_roundtrip() {
        let embedding = vec![1.5f32, -2.3, 0.0, 42.1];
        let bytes = embedding_to_bytes(&embedding);
        assert_eq!(bytes.len(), 16);
        let decoded = embedding_from_bytes(&bytes);
        for (original, roundtripped) in embedding.iter().zip(decoded.iter()) {
            assert!((original - roundtripped).abs() < f32::EPSILON);
        }
    }

    #[test]
    fn test_metadata_json_fallback() {
        assert!(metadata_from_json("not json").is_empty());
        let mut map = HashMap::new();
        map.insert("lang".to_string(), "es".to_string());
        let roundtripped = metadata_from_json(&metadata_to_json(&map));
        assert_eq!(roundtripped.get("lang").map(String::as_str), Some("es"));
    }
}
