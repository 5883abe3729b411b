//! Shared fixtures: deterministic providers and engine construction

use async_trait::async_trait;
use docent::{
    ChatProvider, ChatRequest, ChatResponse, EmbeddingProvider, Engine, EngineConfig, Result,
    StoreConfig,
};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const DIMENSION: usize = 8;

/// Deterministic embedder: vectors derive from a content hash, so equal
/// texts embed equally and round-trips are exact.
pub struct HashEmbedder;

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|text| {
                let mut hasher = Sha256::new();
                hasher.update(text.as_bytes());
                let digest = hasher.finalize();
                (0..DIMENSION)
                    .map(|i| f32::from(digest[i % digest.len()]) / 255.0 + 0.01)
                    .collect()
            })
            .collect())
    }

    fn dimension(&self) -> usize {
        DIMENSION
    }
}

/// Chat provider that replays a fixed script of responses.
pub struct ScriptedChat {
    responses: Mutex<VecDeque<String>>,
    calls: AtomicUsize,
}

impl ScriptedChat {
    pub fn new(responses: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.iter().map(|s| s.to_string()).collect()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatProvider for ScriptedChat {
    async fn chat(&self, _request: ChatRequest) -> Result<ChatResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let content = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                r#"{"text": "script exhausted", "confidence": 0.0, "found": false}"#.to_string()
            });
        Ok(ChatResponse {
            content,
            model: "scripted-model".to_string(),
            prompt_tokens: 20,
            completion_tokens: 10,
            total_tokens: 30,
        })
    }

    fn model(&self) -> &str {
        "scripted-model"
    }
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        store: StoreConfig {
            database_path: ":memory:".to_string(),
            embedding_dimension: DIMENSION,
            ..Default::default()
        },
        ..Default::default()
    }
}

pub async fn engine_with_script(responses: &[&str]) -> (Engine, Arc<ScriptedChat>) {
    let chat = ScriptedChat::new(responses);
    let engine = Engine::with_providers(test_config(), chat.clone(), Arc::new(HashEmbedder))
        .await
        .unwrap();
    (engine, chat)
}

/// A small corpus in the native text format: headings the classifier
/// recognizes, a requirement with a figure, and a definitions block.
pub const MATERIAL_SPEC: &str = "\
MATERIAL SPECIFICATIONS
General requirements for structural steel plates used in construction.

Section 3.2 Tensile Strength
The minimum tensile strength shall be 500 MPa for all plate grades.

DEFINITIONS
\"Force Majeure\" means an event beyond the reasonable control of the affected party.

FILLING
The fill level is 95 percent of nominal capacity.
";

pub fn write_fixture(dir: &tempfile::TempDir, name: &str, content: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, content).unwrap();
    path
}
