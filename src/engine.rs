//! Engine facade coordinating ingestion, retrieval and reasoning

use crate::chunker::Chunker;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::eval::Evaluator;
use crate::ingest::{EntityExtractor, IngestOutcome, Ingestor};
use crate::llm::{
    ChatProvider, EmbeddingProvider, OpenAiChatProvider, OpenAiEmbeddingProvider,
};
use crate::parse::{DocumentFormat, DocumentParser};
use crate::reasoning::{Answer, ReasoningEngine};
use crate::retrieval::Retriever;
use crate::store::{Document, QueryLogEntry, Store, StoreStats};
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// The hybrid retrieval-augmented reasoning engine
pub struct Engine {
    config: EngineConfig,
    store: Store,
    chat: Arc<dyn ChatProvider>,
    ingestor: Ingestor,
    reasoner: ReasoningEngine,
}

impl Engine {
    /// Create an engine with OpenAI-compatible HTTP providers built from
    /// the configuration.
    pub async fn new(config: EngineConfig) -> Result<Self> {
        let chat: Arc<dyn ChatProvider> =
            Arc::new(OpenAiChatProvider::new(config.provider.clone())?);
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(OpenAiEmbeddingProvider::new(
            config.provider.clone(),
            config.store.embedding_dimension,
        )?);
        Self::with_providers(config, chat, embedder).await
    }

    /// Create an engine with caller-supplied providers.
    pub async fn with_providers(
        config: EngineConfig,
        chat: Arc<dyn ChatProvider>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| EngineError::InvalidConfig(e.to_string()))?;

        if embedder.dimension() != config.store.embedding_dimension {
            return Err(EngineError::InvalidConfig(format!(
                "embedding provider dimension {} does not match store dimension {}",
                embedder.dimension(),
                config.store.embedding_dimension
            )));
        }

        let store = Store::open(&config.store).await?;

        let ingestor = Ingestor::new(
            store.clone(),
            Arc::clone(&embedder),
            Chunker::new(config.chunker.clone()),
        )
        .with_embed_batch_size(config.provider.embed_batch_size);

        let retriever = Retriever::new(
            store.clone(),
            Arc::clone(&embedder),
            config.retrieval.clone(),
        );
        let reasoner = ReasoningEngine::new(retriever, Arc::clone(&chat), config.reasoning.clone());

        info!("Engine initialized");
        Ok(Self {
            config,
            store,
            chat,
            ingestor,
            reasoner,
        })
    }

    /// Register a parser for a document format.
    pub fn with_parser(mut self, format: DocumentFormat, parser: Arc<dyn DocumentParser>) -> Self {
        self.ingestor = self.ingestor.with_parser(format, parser);
        self
    }

    /// Register an entity extractor.
    pub fn with_extractor(mut self, extractor: Arc<dyn EntityExtractor>) -> Self {
        self.ingestor = self.ingestor.with_extractor(extractor);
        self
    }

    /// Ingest a document.
    pub async fn ingest(&self, path: &Path) -> Result<IngestOutcome> {
        self.ingest_with_cancel(path, &CancellationToken::new())
            .await
    }

    pub async fn ingest_with_cancel(
        &self,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<IngestOutcome> {
        self.ingestor.ingest(path, cancel).await
    }

    /// Answer a question. Every call is stateless and appends one query
    /// log record, including the final error kind on failure.
    pub async fn query(&self, question: &str) -> Result<Answer> {
        self.query_with_cancel(question, &CancellationToken::new())
            .await
    }

    pub async fn query_with_cancel(
        &self,
        question: &str,
        cancel: &CancellationToken,
    ) -> Result<Answer> {
        let started = Instant::now();
        let outcome = self.reasoner.answer(question, cancel).await;
        let elapsed_ms = started.elapsed().as_millis() as i64;

        let entry = match &outcome {
            Ok(answer) => {
                let mut sources: Vec<String> = Vec::new();
                for source in &answer.sources {
                    if !sources.contains(&source.filename) {
                        sources.push(source.filename.clone());
                    }
                }
                QueryLogEntry {
                    id: Uuid::new_v4(),
                    question: question.to_string(),
                    answer: answer.text.clone(),
                    confidence: answer.confidence,
                    rounds: answer.rounds as i64,
                    sources,
                    error_kind: answer.error.clone(),
                    error_message: None,
                    elapsed_ms,
                    created_at: Utc::now(),
                }
            }
            Err(e) => QueryLogEntry {
                id: Uuid::new_v4(),
                question: question.to_string(),
                answer: String::new(),
                confidence: 0.0,
                rounds: 0,
                sources: Vec::new(),
                error_kind: Some(e.category().to_string()),
                error_message: Some(e.to_string()),
                elapsed_ms,
                created_at: Utc::now(),
            },
        };

        if let Err(log_error) = self.store.log_query(&entry).await {
            warn!("Failed to write query log: {}", log_error);
        }

        outcome
    }

    /// Cascade-delete a document and everything derived from it.
    pub async fn delete_document(&self, id: i64) -> Result<()> {
        self.store.delete_document(id).await
    }

    pub async fn list_documents(&self) -> Result<Vec<Document>> {
        self.store.list_documents().await
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        self.store.stats().await
    }

    /// Direct store access, used by the evaluator's coverage diagnosis.
    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Build an evaluator over this engine.
    pub fn evaluator(&self) -> Evaluator<'_> {
        Evaluator::new(self, self.config.evaluation.clone())
    }

    /// The chat provider, reused by the evaluator's LLM judge.
    pub(crate) fn chat_provider(&self) -> Arc<dyn ChatProvider> {
        Arc::clone(&self.chat)
    }
}
