//! Document ingestion pipeline
//!
//! Orchestrates parser → chunker → embedding provider → store under
//! hash-based idempotency. A failure at any step after the document upsert
//! marks the document `failed` and removes its partial data; there is never
//! a dangling half-ingested document.

use crate::chunker::Chunker;
use crate::error::{EngineError, Result};
use crate::llm::EmbeddingProvider;
use crate::parse::{DocumentFormat, DocumentParser, ParseResult, TextParser};
use crate::store::{ChunkImageInsert, DocumentStatus, DocumentUpsert, EntityUpsert, RelationshipInsert, Store};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Result of one ingestion call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestOutcome {
    pub document_id: i64,
    /// False when the byte-identical document was already ingested
    pub changed: bool,
    pub chunks_inserted: usize,
}

/// A relationship between two extracted entities, by name
#[derive(Debug, Clone)]
pub struct ExtractedRelationship {
    pub source: String,
    pub target: String,
    pub relation_type: String,
    pub weight: f64,
    pub description: String,
}

/// Entities and relationships extracted from one chunk
#[derive(Debug, Clone, Default)]
pub struct ExtractionResult {
    pub entities: Vec<EntityUpsert>,
    pub relationships: Vec<ExtractedRelationship>,
}

/// Out-of-core collaborator that mines entities from chunk text
#[async_trait]
pub trait EntityExtractor: Send + Sync {
    async fn extract(&self, content: &str) -> Result<ExtractionResult>;
}

/// The ingestion pipeline
pub struct Ingestor {
    store: Store,
    embedder: Arc<dyn EmbeddingProvider>,
    chunker: Chunker,
    parsers: HashMap<DocumentFormat, Arc<dyn DocumentParser>>,
    extractor: Option<Arc<dyn EntityExtractor>>,
    embed_batch_size: usize,
}

impl Ingestor {
    pub fn new(store: Store, embedder: Arc<dyn EmbeddingProvider>, chunker: Chunker) -> Self {
        let mut parsers: HashMap<DocumentFormat, Arc<dyn DocumentParser>> = HashMap::new();
        parsers.insert(DocumentFormat::Txt, Arc::new(TextParser));
        Self {
            store,
            embedder,
            chunker,
            parsers,
            extractor: None,
            embed_batch_size: 32,
        }
    }

    /// Register a parser for a document format
    pub fn with_parser(mut self, format: DocumentFormat, parser: Arc<dyn DocumentParser>) -> Self {
        self.parsers.insert(format, parser);
        self
    }

    /// Register an entity extractor
    pub fn with_extractor(mut self, extractor: Arc<dyn EntityExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn with_embed_batch_size(mut self, size: usize) -> Self {
        self.embed_batch_size = size.max(1);
        self
    }

    /// Ingest the file at `path`.
    ///
    /// Re-ingesting a byte-identical, already-ready document is a no-op
    /// returning `changed = false`.
    pub async fn ingest(&self, path: &Path, cancel: &CancellationToken) -> Result<IngestOutcome> {
        let bytes = tokio::fs::read(path).await?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let content_hash = format!("{:x}", hasher.finalize());

        let format = DocumentFormat::from_path(path)?;
        let path_str = path.display().to_string();

        if let Some(existing) = self.store.get_document_by_path(&path_str).await? {
            if existing.content_hash == content_hash && existing.status == DocumentStatus::Ready {
                debug!("Document {} unchanged, skipping", path_str);
                return Ok(IngestOutcome {
                    document_id: existing.id,
                    changed: false,
                    chunks_inserted: 0,
                });
            }
            // content changed: clear stale chunks before re-ingesting
            self.store.delete_document_data(existing.id).await?;
        }

        let filename = path
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| path_str.clone());

        let document_id = self
            .store
            .upsert_document(&DocumentUpsert {
                path: path_str.clone(),
                filename,
                format: format.as_str().to_string(),
                content_hash,
                parse_method: "native".to_string(),
                status: DocumentStatus::Pending,
                metadata: HashMap::new(),
            })
            .await?;

        match self.run_pipeline(document_id, path, format, cancel).await {
            Ok(chunks_inserted) => {
                self.store
                    .set_document_status(document_id, DocumentStatus::Ready)
                    .await?;
                info!(
                    "Ingested {} as document {} ({} chunks)",
                    path_str, document_id, chunks_inserted
                );
                Ok(IngestOutcome {
                    document_id,
                    changed: true,
                    chunks_inserted,
                })
            }
            Err(e) => {
                warn!("Ingestion of {} failed: {}", path_str, e);
                self.store
                    .set_document_status(document_id, DocumentStatus::Failed)
                    .await?;
                self.store.delete_document_data(document_id).await?;
                Err(e)
            }
        }
    }

    async fn run_pipeline(
        &self,
        document_id: i64,
        path: &Path,
        format: DocumentFormat,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let parser = self.parsers.get(&format).ok_or_else(|| {
            EngineError::InvalidConfig(format!(
                "no parser registered for format {}",
                format.as_str()
            ))
        })?;

        self.store
            .set_document_status(document_id, DocumentStatus::Parsing)
            .await?;

        self.check_cancel(cancel, document_id, "parsing")?;
        let parsed: ParseResult = parser.parse(path).await?;
        self.store
            .set_document_parse_method(document_id, parsed.method.as_str())
            .await?;

        let language = detect_language(&parsed.sections);
        self.store
            .set_document_language(document_id, language)
            .await?;

        self.check_cancel(cancel, document_id, "chunking")?;
        let plan = self.chunker.chunk(&parsed.sections);
        if plan.chunks.is_empty() {
            return Ok(0);
        }
        let real_ids = self.store.insert_chunks(document_id, &plan.chunks).await?;

        for (batch_index, batch) in plan.chunks.chunks(self.embed_batch_size).enumerate() {
            self.check_cancel(cancel, document_id, "embedding")?;
            let texts: Vec<String> = batch.iter().map(|c| c.content.clone()).collect();
            let vectors = self.embedder.embed(&texts).await?;
            let offset = batch_index * self.embed_batch_size;
            let rows: Vec<(i64, Vec<f32>)> = vectors
                .into_iter()
                .enumerate()
                .map(|(i, v)| (real_ids[offset + i], v))
                .collect();
            self.store.upsert_embeddings(&rows).await?;
        }

        for image in &parsed.images {
            let Some(position) = plan
                .section_chunks
                .get(image.section_index)
                .and_then(|positions| positions.first())
            else {
                warn!(
                    "Image on page {} references unknown section {}, skipping",
                    image.page_number, image.section_index
                );
                continue;
            };
            self.store
                .insert_chunk_image(&ChunkImageInsert {
                    chunk_id: real_ids[*position],
                    document_id,
                    caption: String::new(),
                    mime_type: image.mime_type.clone(),
                    width: image.width,
                    height: image.height,
                    page_number: image.page_number,
                    data: image.data.clone(),
                })
                .await?;
        }

        if let Some(extractor) = &self.extractor {
            self.check_cancel(cancel, document_id, "entity extraction")?;
            self.extract_entities(extractor, &plan, &real_ids).await?;
        }

        Ok(real_ids.len())
    }

    async fn extract_entities(
        &self,
        extractor: &Arc<dyn EntityExtractor>,
        plan: &crate::chunker::ChunkPlan,
        real_ids: &[i64],
    ) -> Result<()> {
        for (chunk, chunk_id) in plan.chunks.iter().zip(real_ids) {
            let extraction = extractor.extract(&chunk.content).await?;
            if extraction.entities.is_empty() {
                continue;
            }

            let mut ids_by_name: HashMap<String, i64> = HashMap::new();
            for entity in &extraction.entities {
                let id = self.store.upsert_entity_and_link(entity, *chunk_id).await?;
                ids_by_name.insert(entity.name.clone(), id);
            }

            for rel in &extraction.relationships {
                let (Some(source), Some(target)) =
                    (ids_by_name.get(&rel.source), ids_by_name.get(&rel.target))
                else {
                    warn!(
                        "Relationship {} -> {} references unextracted entity, skipping",
                        rel.source, rel.target
                    );
                    continue;
                };
                self.store
                    .insert_relationship(&RelationshipInsert {
                        source_entity_id: *source,
                        target_entity_id: *target,
                        relation_type: rel.relation_type.clone(),
                        weight: rel.weight,
                        description: rel.description.clone(),
                        source_chunk_id: Some(*chunk_id),
                    })
                    .await?;
            }
        }
        Ok(())
    }

    fn check_cancel(
        &self,
        cancel: &CancellationToken,
        document_id: i64,
        stage: &str,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled {
                resource: format!("{stage} document {document_id}"),
            });
        }
        Ok(())
    }
}

const ENGLISH_STOPWORDS: &[&str] = &[
    "the", "and", "of", "to", "in", "is", "that", "for", "with", "shall", "this", "are", "be",
];
const SPANISH_STOPWORDS: &[&str] = &[
    "el", "la", "los", "las", "de", "del", "que", "en", "por", "para", "con", "una", "este",
];
const PORTUGUESE_STOPWORDS: &[&str] = &[
    "o", "os", "das", "dos", "não", "uma", "em", "para", "com", "por", "que", "ao", "seu",
];
const FRENCH_STOPWORDS: &[&str] = &[
    "le", "les", "des", "du", "une", "et", "est", "dans", "pour", "avec", "sur", "par", "ce",
];

/// Sample size for language detection, in words
const LANGUAGE_SAMPLE_WORDS: usize = 1000;

/// Minimum stopword hits before a language is reported
const LANGUAGE_MIN_HITS: usize = 3;

/// Heuristic stopword-based language detection over a sample of section
/// contents. Returns an ISO code or None when no language dominates.
pub fn detect_language(sections: &[crate::parse::Section]) -> Option<&'static str> {
    let mut words = Vec::new();
    for section in sections {
        for word in section.content.split_whitespace() {
            words.push(word.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase());
            if words.len() >= LANGUAGE_SAMPLE_WORDS {
                break;
            }
        }
        if words.len() >= LANGUAGE_SAMPLE_WORDS {
            break;
        }
    }

    let count_hits = |stopwords: &[&str]| {
        words
            .iter()
            .filter(|w| stopwords.contains(&w.as_str()))
            .count()
    };

    let candidates = [
        ("en", count_hits(ENGLISH_STOPWORDS)),
        ("es", count_hits(SPANISH_STOPWORDS)),
        ("pt", count_hits(PORTUGUESE_STOPWORDS)),
        ("fr", count_hits(FRENCH_STOPWORDS)),
    ];

    candidates
        .into_iter()
        .max_by_key(|(_, hits)| *hits)
        .filter(|(_, hits)| *hits >= LANGUAGE_MIN_HITS)
        .map(|(code, _)| code)
}
