//! Evaluation datasets

use serde::{Deserialize, Serialize};

/// A question with its expected facts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub question: String,
    /// Each fact may carry pipe-separated alternatives; matching any
    /// alternative counts the fact as covered.
    pub expected_facts: Vec<String>,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub explanation: String,
}

fn default_category() -> String {
    "general".to_string()
}

/// A named set of test cases
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    pub name: String,
    #[serde(default)]
    pub difficulty: String,
    pub tests: Vec<TestCase>,
}

impl Dataset {
    /// Load a dataset from a JSON or YAML file
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(&path)?;
        let dataset = match path.as_ref().extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            Some("yaml") | Some("yml") => serde_yml::from_str(&content)?,
            _ => return Err(anyhow::anyhow!("Unsupported dataset file format")),
        };
        Ok(dataset)
    }
}

/// Split one expected fact into its pipe-separated alternatives.
pub fn fact_alternatives(fact: &str) -> Vec<&str> {
    fact.split('|')
        .map(str::trim)
        .filter(|alt| !alt.is_empty())
        .collect()
}

/// A known-relevant span of a source file, for retrieval precision checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroundTruthSnippet {
    pub file_path: String,
    pub start: usize,
    pub end: usize,
    pub text: String,
}
