//! Configuration management for the engine

use serde::{Deserialize, Serialize};

/// Main configuration for the engine
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    /// Store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Chunker configuration
    #[serde(default)]
    pub chunker: ChunkerConfig,

    /// Retrieval configuration
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// Reasoning loop configuration
    #[serde(default)]
    pub reasoning: ReasoningConfig,

    /// Chat and embedding provider configuration
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Evaluation configuration
    #[serde(default)]
    pub evaluation: EvaluationConfig,
}

/// Persistent store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the database file, or ":memory:" for an in-memory store
    pub database_path: String,

    /// Embedding dimension, stamped into the vector index DDL at creation.
    /// Changing it requires rebuilding the store.
    pub embedding_dimension: usize,

    /// Maximum pool connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Connections kept ready in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Maximum connection lifetime in seconds
    #[serde(default = "default_connection_lifetime")]
    pub connection_lifetime_secs: u64,
}

fn default_max_connections() -> u32 {
    4
}

fn default_min_connections() -> u32 {
    2
}

fn default_connection_lifetime() -> u64 {
    30 * 60
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: ".docent/engine.db".to_string(),
            embedding_dimension: 768,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connection_lifetime_secs: default_connection_lifetime(),
        }
    }
}

/// Chunker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkerConfig {
    /// Maximum estimated tokens per chunk fragment
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    /// Tokens of trailing text prepended to the next fragment
    #[serde(default = "default_overlap")]
    pub overlap: usize,
}

fn default_max_tokens() -> usize {
    1024
}

fn default_overlap() -> usize {
    128
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            overlap: default_overlap(),
        }
    }
}

/// Retrieval configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Maximum fused results per query
    #[serde(default = "default_max_results")]
    pub max_results: usize,

    /// Base weight of the vector searcher
    #[serde(default = "default_vector_weight")]
    pub vector_weight: f64,

    /// Base weight of the full-text searcher
    #[serde(default = "default_fts_weight")]
    pub fts_weight: f64,

    /// Base weight of the graph searcher
    #[serde(default = "default_graph_weight")]
    pub graph_weight: f64,

    /// Expand seed entities one hop through the relationship graph
    #[serde(default = "default_true")]
    pub expand_graph: bool,
}

fn default_max_results() -> usize {
    20
}

fn default_vector_weight() -> f64 {
    1.0
}

fn default_fts_weight() -> f64 {
    1.0
}

fn default_graph_weight() -> f64 {
    0.5
}

fn default_true() -> bool {
    true
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            max_results: default_max_results(),
            vector_weight: default_vector_weight(),
            fts_weight: default_fts_weight(),
            graph_weight: default_graph_weight(),
            expand_graph: true,
        }
    }
}

/// Reasoning loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningConfig {
    /// Maximum chat rounds per query
    #[serde(default = "default_max_rounds")]
    pub max_rounds: usize,

    /// Minimum confidence to accept an answer before the final round
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
}

fn default_max_rounds() -> usize {
    2
}

fn default_confidence_threshold() -> f64 {
    0.3
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            max_rounds: default_max_rounds(),
            confidence_threshold: default_confidence_threshold(),
        }
    }
}

/// Chat and embedding provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Base URL of the OpenAI-compatible API
    pub base_url: String,

    /// API key, usually supplied via DOCENT_PROVIDER__API_KEY
    #[serde(default)]
    pub api_key: Option<String>,

    /// Chat model name
    pub chat_model: String,

    /// Embedding model name
    pub embedding_model: String,

    /// Temperature for chat requests
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Request timeout in seconds
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,

    /// Texts per embedding request
    #[serde(default = "default_embed_batch")]
    pub embed_batch_size: usize,
}

fn default_temperature() -> f32 {
    0.1
}

fn default_provider_timeout() -> u64 {
    60
}

fn default_embed_batch() -> usize {
    32
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434/v1".to_string(),
            api_key: None,
            chat_model: "llama3.2".to_string(),
            embedding_model: "nomic-embed-text".to_string(),
            temperature: default_temperature(),
            timeout_secs: default_provider_timeout(),
            embed_batch_size: default_embed_batch(),
        }
    }
}

/// Evaluation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationConfig {
    /// Minimum accuracy for the pass gate
    #[serde(default = "default_pass_accuracy")]
    pub pass_accuracy: f64,

    /// Minimum context recall for the pass gate
    #[serde(default = "default_pass_recall")]
    pub pass_context_recall: f64,

    /// Ask an LLM judge to score semantic fact coverage
    #[serde(default)]
    pub use_judge: bool,
}

fn default_pass_accuracy() -> f64 {
    0.5
}

fn default_pass_recall() -> f64 {
    0.5
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            pass_accuracy: default_pass_accuracy(),
            pass_context_recall: default_pass_recall(),
            use_judge: false,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a file
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(&path)?;
        let config = match path.as_ref().extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            Some("toml") => toml::from_str(&content)?,
            Some("yaml") | Some("yml") => serde_yml::from_str(&content)?,
            _ => return Err(anyhow::anyhow!("Unsupported config file format")),
        };
        Ok(config)
    }

    /// Load configuration from a file with DOCENT_* environment overrides.
    /// Nested fields use double underscores, e.g. DOCENT_PROVIDER__API_KEY.
    pub fn load<P: AsRef<std::path::Path>>(path: Option<P>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path.as_ref()));
        }
        let settings = builder
            .add_source(config::Environment::with_prefix("DOCENT").separator("__"))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Save configuration to a file
    pub fn to_file<P: AsRef<std::path::Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = match path.as_ref().extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::to_string_pretty(self)?,
            Some("toml") => toml::to_string(self)?,
            Some("yaml") | Some("yml") => serde_yml::to_string(self)?,
            _ => return Err(anyhow::anyhow!("Unsupported config file format")),
        };
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.store.embedding_dimension == 0 {
            return Err(anyhow::anyhow!(
                "Embedding dimension must be greater than 0"
            ));
        }

        if self.reasoning.max_rounds == 0 {
            return Err(anyhow::anyhow!("max_rounds must be at least 1"));
        }

        if !(0.0..=1.0).contains(&self.reasoning.confidence_threshold) {
            return Err(anyhow::anyhow!(
                "Confidence threshold must be between 0.0 and 1.0"
            ));
        }

        for (name, w) in [
            ("vector_weight", self.retrieval.vector_weight),
            ("fts_weight", self.retrieval.fts_weight),
            ("graph_weight", self.retrieval.graph_weight),
        ] {
            if w < 0.0 {
                return Err(anyhow::anyhow!("{} cannot be negative", name));
            }
        }

        if self.retrieval.max_results == 0 {
            return Err(anyhow::anyhow!("max_results must be at least 1"));
        }

        if self.provider.chat_model.is_empty() {
            return Err(anyhow::anyhow!("Chat model name cannot be empty"));
        }

        if self.provider.embedding_model.is_empty() {
            return Err(anyhow::anyhow!("Embedding model name cannot be empty"));
        }

        Ok(())
    }
}
