//! Hybrid retrieval: three searchers fused into one ranked list
//!
//! Vector similarity, full-text search and the entity graph run
//! concurrently; their ranked outputs are combined by weighted reciprocal
//! rank. A failing searcher degrades the query instead of failing it.

mod features;

pub use features::{significant_words, QueryFeatures};

use crate::config::RetrievalConfig;
use crate::error::{EngineError, Result};
use crate::llm::EmbeddingProvider;
use crate::store::{SearchHit, Store};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Which searcher produced (or contributed to) a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMethod {
    Vector,
    Fts,
    Graph,
}

/// One fused retrieval result with per-method provenance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub chunk_id: i64,
    pub document_id: i64,
    pub content: String,
    pub heading: String,
    pub page_number: i32,
    pub filename: String,
    /// Weighted reciprocal-rank fusion score
    pub score: f64,
    /// Searchers that returned this chunk
    pub methods: Vec<SearchMethod>,
    pub vector_rank: Option<usize>,
    pub fts_rank: Option<usize>,
    pub graph_rank: Option<usize>,
}

/// Effective fusion weights after per-query adjustment
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FusionWeights {
    pub vector: f64,
    pub fts: f64,
    pub graph: f64,
}

/// Observability record emitted alongside each retrieval
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchTrace {
    pub vector_count: usize,
    pub fts_count: usize,
    pub graph_count: usize,
    pub fused_count: usize,
    pub weights: FusionWeights,
    pub identifiers_detected: bool,
    pub elapsed_ms: u64,
}

/// Identifier queries double the lexical weight and halve the vector weight
const IDENTIFIER_FTS_BOOST: f64 = 2.0;
const IDENTIFIER_VECTOR_DAMPEN: f64 = 0.5;

/// The hybrid retriever
pub struct Retriever {
    store: Store,
    embedder: Arc<dyn EmbeddingProvider>,
    config: RetrievalConfig,
}

impl Retriever {
    pub fn new(store: Store, embedder: Arc<dyn EmbeddingProvider>, config: RetrievalConfig) -> Self {
        Self {
            store,
            embedder,
            config,
        }
    }

    /// Run all three searchers and fuse their rankings.
    pub async fn retrieve(
        &self,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<(Vec<RetrievalResult>, SearchTrace)> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled {
                resource: format!("retrieval for {query:?}"),
            });
        }

        let started = Instant::now();
        let features = QueryFeatures::extract(query);

        let mut weights = FusionWeights {
            vector: self.config.vector_weight,
            fts: self.config.fts_weight,
            graph: self.config.graph_weight,
        };
        if features.identifiers_detected {
            weights.fts *= IDENTIFIER_FTS_BOOST;
            weights.vector *= IDENTIFIER_VECTOR_DAMPEN;
        }

        let (vector, fts, graph) = tokio::join!(
            self.vector_candidates(query),
            self.fts_candidates(&features),
            self.graph_candidates(&features),
        );

        let vector = degraded("vector", vector);
        let fts = degraded("fts", fts);
        let graph = degraded("graph", graph);

        let trace_counts = (vector.len(), fts.len(), graph.len());
        let results = fuse(
            &[
                (SearchMethod::Vector, weights.vector, vector),
                (SearchMethod::Fts, weights.fts, fts),
                (SearchMethod::Graph, weights.graph, graph),
            ],
            self.config.max_results,
        );

        let trace = SearchTrace {
            vector_count: trace_counts.0,
            fts_count: trace_counts.1,
            graph_count: trace_counts.2,
            fused_count: results.len(),
            weights,
            identifiers_detected: features.identifiers_detected,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        debug!(
            "Retrieval for {:?}: {}/{}/{} candidates, {} fused",
            query, trace.vector_count, trace.fts_count, trace.graph_count, trace.fused_count
        );

        Ok((results, trace))
    }

    async fn vector_candidates(&self, query: &str) -> Result<Vec<SearchHit>> {
        let vectors = self.embedder.embed(&[query.to_string()]).await?;
        let embedding = vectors
            .into_iter()
            .next()
            .ok_or_else(|| crate::error::ProviderError::InvalidResponse("no embedding".into()))?;
        self.store
            .vector_search(&embedding, self.config.max_results)
            .await
    }

    async fn fts_candidates(&self, features: &QueryFeatures) -> Result<Vec<SearchHit>> {
        self.store
            .fts_search(&features.fts_query, self.config.max_results)
            .await
    }

    async fn graph_candidates(&self, features: &QueryFeatures) -> Result<Vec<SearchHit>> {
        if features.graph_terms.is_empty() {
            return Ok(Vec::new());
        }

        let mut entities = self
            .store
            .search_entities_by_terms(&features.graph_terms, self.config.max_results)
            .await?;
        // best-effort cross-language hits through English canonical names
        let by_name_en = self
            .store
            .search_entities_by_name_en(&features.graph_terms, self.config.max_results)
            .await?;
        for entity in by_name_en {
            if !entities.iter().any(|e| e.id == entity.id) {
                entities.push(entity);
            }
        }

        let mut ids: Vec<i64> = entities.iter().map(|e| e.id).collect();
        if self.config.expand_graph && !ids.is_empty() {
            let related = self
                .store
                .get_related_entities(&ids, self.config.max_results)
                .await?;
            for entity in related {
                if !ids.contains(&entity.id) {
                    ids.push(entity.id);
                }
            }
        }

        self.store.graph_search(&ids, self.config.max_results).await
    }
}

fn degraded(name: &str, outcome: Result<Vec<SearchHit>>) -> Vec<SearchHit> {
    match outcome {
        Ok(hits) => hits,
        Err(e) => {
            warn!("{} searcher degraded: {}", name, e);
            Vec::new()
        }
    }
}

/// Weighted reciprocal-rank fusion over the searcher outputs.
///
/// Each chunk scores `Σ weight × 1 / (1 + rank)` over the searchers that
/// returned it. Ties break on ascending chunk id so repeated retrievals
/// order identically.
fn fuse(
    ranked: &[(SearchMethod, f64, Vec<SearchHit>)],
    max_results: usize,
) -> Vec<RetrievalResult> {
    let mut fused: HashMap<i64, RetrievalResult> = HashMap::new();

    for (method, weight, hits) in ranked {
        for (rank, hit) in hits.iter().enumerate() {
            let contribution = weight / (1.0 + rank as f64);
            let entry = fused.entry(hit.chunk_id).or_insert_with(|| RetrievalResult {
                chunk_id: hit.chunk_id,
                document_id: hit.document_id,
                content: hit.content.clone(),
                heading: hit.heading.clone(),
                page_number: hit.page_number,
                filename: hit.filename.clone(),
                score: 0.0,
                methods: Vec::new(),
                vector_rank: None,
                fts_rank: None,
                graph_rank: None,
            });
            entry.score += contribution;
            if !entry.methods.contains(method) {
                entry.methods.push(*method);
            }
            match method {
                SearchMethod::Vector => entry.vector_rank = Some(rank),
                SearchMethod::Fts => entry.fts_rank = Some(rank),
                SearchMethod::Graph => entry.graph_rank = Some(rank),
            }
        }
    }

    let mut results: Vec<RetrievalResult> = fused.into_values().collect();
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.chunk_id.cmp(&b.chunk_id))
    });
    results.truncate(max_results);
    results
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(chunk_id: i64) -> SearchHit {
        SearchHit {
            chunk_id,
            document_id: 1,
            content: format!("content {chunk_id}"),
            heading: String::new(),
            chunk_type: "paragraph".to_string(),
            page_number: 1,
            filename: "doc.txt".to_string(),
            path: "/doc.txt".to_string(),
            score: 1.0,
        }
    }

    #[test]
    fn test_fuse_reciprocal_rank_scores() {
        let results = fuse(
            &[
                (SearchMethod::Vector, 1.0, vec![hit(1), hit(2)]),
                (SearchMethod::Fts, 1.0, vec![hit(2), hit(1)]),
            ],
            10,
        );

        // both chunks: 1/1 + 1/2 = 1.5, tie broken by ascending chunk id
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].chunk_id, 1);
        assert_eq!(results[1].chunk_id, 2);
        assert!((results[0].score - 1.5).abs() < 1e-9);
        assert!((results[1].score - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_fuse_tracks_methods_and_ranks() {
        let results = fuse(
            &[
                (SearchMethod::Vector, 1.0, vec![hit(7)]),
                (SearchMethod::Graph, 0.5, vec![hit(7), hit(9)]),
            ],
            10,
        );

        let top = &results[0];
        assert_eq!(top.chunk_id, 7);
        assert_eq!(top.methods, vec![SearchMethod::Vector, SearchMethod::Graph]);
        assert_eq!(top.vector_rank, Some(0));
        assert_eq!(top.graph_rank, Some(0));
        assert_eq!(top.fts_rank, None);
        // 1.0/1 + 0.5/1
        assert!((top.score - 1.5).abs() < 1e-9);

        let second = &results[1];
        assert_eq!(second.chunk_id, 9);
        assert_eq!(second.graph_rank, Some(1));
        assert!((second.score - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_fuse_weight_bias() {
        // with FTS boosted, its top hit outranks the vector top hit
        let results = fuse(
            &[
                (SearchMethod::Vector, 0.5, vec![hit(1)]),
                (SearchMethod::Fts, 2.0, vec![hit(2)]),
            ],
            10,
        );
        assert_eq!(results[0].chunk_id, 2);
    }

    #[test]
    fn test_fuse_truncates_to_max_results() {
        let hits: Vec<SearchHit> = (1..=30).map(hit).collect();
        let results = fuse(&[(SearchMethod::Fts, 1.0, hits)], 5);
        assert_eq!(results.len(), 5);
        // top ranks survive the cut
        assert_eq!(results[0].chunk_id, 1);
    }

    #[test]
    fn test_fuse_deterministic() {
        let inputs = [
            (SearchMethod::Vector, 1.0, vec![hit(3), hit(1), hit(2)]),
            (SearchMethod::Fts, 1.0, vec![hit(2), hit(3)]),
            (SearchMethod::Graph, 0.5, vec![hit(1)]),
        ];
        let first = fuse(&inputs, 10);
        let second = fuse(&inputs, 10);
        let order_a: Vec<i64> = first.iter().map(|r| r.chunk_id).collect();
        let order_b: Vec<i64> = second.iter().map(|r| r.chunk_id).collect();
        assert_eq!(order_a, order_b);
    }
}
