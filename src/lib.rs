//! Docent: hybrid retrieval-augmented reasoning over office documents
//!
//! The engine ingests documents into a persistent store, then answers
//! natural-language questions by combining three retrieval signals:
//! - dense vector similarity over a sqlite-vec index
//! - lexical full-text search over an FTS5 mirror
//! - an entity/relationship graph
//!
//! Fused results feed a bounded multi-round reasoning loop against a chat
//! model, and an evaluation harness diagnoses per-fact coverage loss across
//! the pipeline stages.
//!
//! # Example
//!
//! ```rust,no_run
//! use docent::{Engine, EngineConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let engine = Engine::new(EngineConfig::default()).await?;
//!
//!     engine.ingest(std::path::Path::new("material-spec.txt")).await?;
//!     let answer = engine
//!         .query("What is the minimum tensile strength requirement?")
//!         .await?;
//!
//!     println!("{} (confidence {:.2})", answer.text, answer.confidence);
//!     Ok(())
//! }
//! ```

pub mod chunker;
pub mod classify;
pub mod config;
pub mod engine;
pub mod error;
pub mod eval;
pub mod ingest;
pub mod llm;
pub mod parse;
pub mod reasoning;
pub mod retrieval;
pub mod store;

// Re-export main types
pub use chunker::{estimate_tokens, ChunkPlan, ChunkType, Chunker, PendingChunk};
pub use config::{
    ChunkerConfig, EngineConfig, EvaluationConfig, ProviderConfig, ReasoningConfig,
    RetrievalConfig, StoreConfig,
};
pub use engine::Engine;
pub use error::{EngineError, ProviderError, Result, StoreError};
pub use eval::{
    CoverageStage, Dataset, EvalReport, Evaluator, GroundTruthCheck, GroundTruthSnippet,
    TestCase, TestResult,
};
pub use ingest::{EntityExtractor, ExtractionResult, IngestOutcome, Ingestor};
pub use llm::{
    ChatProvider, ChatRequest, ChatResponse, EmbeddingProvider, Message, OpenAiChatProvider,
    OpenAiEmbeddingProvider, Role,
};
pub use parse::{
    DocumentFormat, DocumentParser, ExtractedImage, ParseMethod, ParseResult, Section,
    SectionType, TextParser,
};
pub use reasoning::{Answer, ReasoningEngine, ReasoningStep, TokenUsage};
pub use retrieval::{
    QueryFeatures, RetrievalResult, Retriever, SearchMethod, SearchTrace,
};
pub use store::{Document, DocumentStatus, Entity, SearchHit, Store};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
