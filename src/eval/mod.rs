//! Evaluation harness
//!
//! Runs a dataset of questions against the engine, scores each answer, and
//! diagnoses per expected fact at which pipeline stage coverage was lost
//! (chunk, embedding, retrieval or model).

mod dataset;
pub mod metrics;

pub use dataset::{fact_alternatives, Dataset, GroundTruthSnippet, TestCase};

use crate::config::EvaluationConfig;
use crate::engine::Engine;
use crate::error::Result;
use crate::llm::{system_message, user_message, ChatProvider, ChatRequest};
use crate::retrieval::significant_words;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{info, warn};

/// Pipeline stage where an expected fact was lost
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoverageStage {
    Pass,
    ChunkMiss,
    EmbeddingMiss,
    RetrievalMiss,
    ModelMiss,
}

/// Diagnosis for one expected fact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroundTruthCheck {
    pub fact: String,
    pub stage: CoverageStage,
}

/// Scores for one test, each in [0, 1]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestMetrics {
    pub accuracy: f64,
    /// Substring accuracy, kept when the LLM judge overrides `accuracy`
    pub strict_accuracy: Option<f64>,
    pub context_recall: f64,
    pub faithfulness: f64,
    pub relevance: f64,
    pub citation_quality: f64,
    pub claim_grounding: f64,
    pub hallucination_score: f64,
}

/// Precision and recall of retrieval at a cutoff
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetrievalAtK {
    pub k: usize,
    pub precision: f64,
    pub recall: f64,
}

/// Outcome of one test case
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub question: String,
    pub category: String,
    pub passed: bool,
    pub metrics: TestMetrics,
    pub diagnosis: Vec<GroundTruthCheck>,
    pub answer: String,
    pub rounds: usize,
    pub error: Option<String>,
    pub retrieval: Vec<RetrievalAtK>,
}

/// Aggregate for one category
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CategorySummary {
    pub tests: usize,
    pub passed: usize,
    pub avg_accuracy: f64,
    pub avg_context_recall: f64,
}

/// Full evaluation report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalReport {
    pub dataset: String,
    pub difficulty: String,
    pub total: usize,
    pub passed: usize,
    pub pass_rate: f64,
    pub averages: TestMetrics,
    /// Per-category breakdown; BTreeMap keeps categories sorted
    pub per_category: BTreeMap<String, CategorySummary>,
    pub results: Vec<TestResult>,
}

/// Cutoffs for retrieval precision/recall
const PRECISION_KS: &[usize] = &[1, 4, 8, 16, 32, 64];

/// Significant-word overlap for same-file snippet relevance
const SNIPPET_OVERLAP: f64 = 0.5;

/// Chunk candidates examined per fact during diagnosis
const DIAGNOSIS_CHUNK_LIMIT: usize = 50;

/// The evaluation harness
pub struct Evaluator<'a> {
    engine: &'a Engine,
    config: EvaluationConfig,
    judge: Option<Arc<dyn ChatProvider>>,
    /// Immutable after `set_ground_truth`
    ground_truth: HashMap<String, Vec<GroundTruthSnippet>>,
}

impl<'a> Evaluator<'a> {
    pub fn new(engine: &'a Engine, config: EvaluationConfig) -> Self {
        let judge = if config.use_judge {
            Some(engine.chat_provider())
        } else {
            None
        };
        Self {
            engine,
            config,
            judge,
            ground_truth: HashMap::new(),
        }
    }

    /// Enable the LLM judge for semantic fact coverage.
    pub fn with_judge(mut self) -> Self {
        self.judge = Some(self.engine.chat_provider());
        self
    }

    /// Provide known-relevant snippets per question, keyed by question
    /// text. Read-only once the run starts.
    pub fn set_ground_truth(&mut self, snippets: HashMap<String, Vec<GroundTruthSnippet>>) {
        self.ground_truth = snippets;
    }

    /// Run every test in the dataset and aggregate a report.
    pub async fn run(&self, dataset: &Dataset) -> Result<EvalReport> {
        info!(
            "Evaluating dataset {:?} ({} tests)",
            dataset.name,
            dataset.tests.len()
        );

        let mut results = Vec::with_capacity(dataset.tests.len());
        for test in &dataset.tests {
            results.push(self.run_test(test).await?);
        }

        Ok(aggregate(dataset, results))
    }

    async fn run_test(&self, test: &TestCase) -> Result<TestResult> {
        let (answer_text, sources, rounds, error) = match self.engine.query(&test.question).await {
            Ok(answer) => (answer.text, answer.sources, answer.rounds, answer.error),
            Err(e) => {
                warn!("Query failed for {:?}: {}", test.question, e);
                (String::new(), Vec::new(), 0, Some(e.category().to_string()))
            }
        };

        let context = sources
            .iter()
            .map(|s| format!("{} {}", s.content, s.heading))
            .collect::<Vec<_>>()
            .join(" ");
        let source_filenames: Vec<String> = {
            let mut names = Vec::new();
            for source in &sources {
                if !names.contains(&source.filename) {
                    names.push(source.filename.clone());
                }
            }
            names
        };

        let substring_accuracy = metrics::accuracy(&answer_text, &test.expected_facts);
        let (accuracy, strict_accuracy) = match &self.judge {
            Some(judge) => match judge_accuracy(judge, &answer_text, &test.expected_facts).await {
                Ok(judged) => (judged, Some(substring_accuracy)),
                Err(e) => {
                    warn!("LLM judge failed, falling back to substring accuracy: {}", e);
                    (substring_accuracy, None)
                }
            },
            None => (substring_accuracy, None),
        };

        let test_metrics = TestMetrics {
            accuracy,
            strict_accuracy,
            context_recall: metrics::context_recall(&context, &test.expected_facts),
            faithfulness: metrics::faithfulness(&answer_text, &source_filenames),
            relevance: metrics::relevance(&test.question, &sources),
            citation_quality: metrics::citation_quality(&answer_text, &source_filenames),
            claim_grounding: metrics::claim_grounding(&answer_text, &context),
            hallucination_score: metrics::hallucination_score(&answer_text, &sources),
        };

        let passed = test_metrics.accuracy >= self.config.pass_accuracy
            && test_metrics.context_recall >= self.config.pass_context_recall;

        let mut diagnosis = Vec::with_capacity(test.expected_facts.len());
        for fact in &test.expected_facts {
            diagnosis.push(GroundTruthCheck {
                fact: fact.clone(),
                stage: self.diagnose_fact(fact, &answer_text, &sources).await?,
            });
        }

        let retrieval = match self.ground_truth.get(&test.question) {
            Some(snippets) if !snippets.is_empty() => precision_recall(&sources, snippets),
            _ => Vec::new(),
        };

        Ok(TestResult {
            question: test.question.clone(),
            category: test.category.clone(),
            passed,
            metrics: test_metrics,
            diagnosis,
            answer: answer_text,
            rounds,
            error,
            retrieval,
        })
    }

    /// Walk the pipeline stages for one fact and report the first loss.
    async fn diagnose_fact(
        &self,
        fact: &str,
        answer: &str,
        sources: &[crate::retrieval::RetrievalResult],
    ) -> Result<CoverageStage> {
        if metrics::fact_covered(answer, fact) {
            return Ok(CoverageStage::Pass);
        }

        let mut holding_chunks: Vec<i64> = Vec::new();
        for alternative in fact_alternatives(fact) {
            let found = self
                .engine
                .store()
                .find_chunks_containing(alternative, DIAGNOSIS_CHUNK_LIMIT)
                .await?;
            for id in found {
                if !holding_chunks.contains(&id) {
                    holding_chunks.push(id);
                }
            }
        }
        if holding_chunks.is_empty() {
            return Ok(CoverageStage::ChunkMiss);
        }

        let mut any_embedded = false;
        for chunk_id in &holding_chunks {
            if self.engine.store().has_embedding(*chunk_id).await? {
                any_embedded = true;
                break;
            }
        }
        if !any_embedded {
            return Ok(CoverageStage::EmbeddingMiss);
        }

        let retrieved = sources
            .iter()
            .any(|source| holding_chunks.contains(&source.chunk_id));
        if !retrieved {
            return Ok(CoverageStage::RetrievalMiss);
        }

        Ok(CoverageStage::ModelMiss)
    }
}

/// Judge response payload
#[derive(Debug, Deserialize)]
struct JudgeVerdict {
    #[serde(default)]
    covered: Vec<usize>,
}

/// Ask the judge which expected facts the answer covers semantically.
async fn judge_accuracy(
    judge: &Arc<dyn ChatProvider>,
    answer: &str,
    expected_facts: &[String],
) -> Result<f64> {
    if expected_facts.is_empty() {
        return Ok(1.0);
    }

    let facts_list = expected_facts
        .iter()
        .enumerate()
        .map(|(i, fact)| format!("{i}: {fact}"))
        .collect::<Vec<_>>()
        .join("\n");

    let request = ChatRequest::new(vec![
        system_message(
            "You judge whether an answer semantically covers expected facts. \
             Respond with a JSON object: {\"covered\": [<indices of covered facts>]}.",
        ),
        user_message(format!(
            "Answer:\n{answer}\n\nExpected facts (alternatives separated by |):\n{facts_list}"
        )),
    ])
    .json_object();

    let response = judge.chat(request).await?;
    let verdict: JudgeVerdict = serde_json::from_str(response.content.trim())
        .map_err(|e| crate::error::ProviderError::InvalidResponse(e.to_string()))?;

    let covered = verdict
        .covered
        .iter()
        .filter(|i| **i < expected_facts.len())
        .count();
    Ok(covered as f64 / expected_facts.len() as f64)
}

/// Precision and recall at the standard cutoffs.
///
/// A chunk is relevant to a snippet when it contains the snippet text, or
/// comes from the same file with more than 50% significant-word overlap.
fn precision_recall(
    sources: &[crate::retrieval::RetrievalResult],
    snippets: &[GroundTruthSnippet],
) -> Vec<RetrievalAtK> {
    PRECISION_KS
        .iter()
        .map(|&k| {
            let top: Vec<_> = sources.iter().take(k).collect();
            if top.is_empty() {
                return RetrievalAtK {
                    k,
                    precision: 0.0,
                    recall: 0.0,
                };
            }

            let relevant_chunks = top
                .iter()
                .filter(|chunk| snippets.iter().any(|s| chunk_matches_snippet(chunk, s)))
                .count();
            let covered_snippets = snippets
                .iter()
                .filter(|s| top.iter().any(|chunk| chunk_matches_snippet(chunk, s)))
                .count();

            RetrievalAtK {
                k,
                precision: relevant_chunks as f64 / top.len() as f64,
                recall: covered_snippets as f64 / snippets.len() as f64,
            }
        })
        .collect()
}

fn chunk_matches_snippet(
    chunk: &crate::retrieval::RetrievalResult,
    snippet: &GroundTruthSnippet,
) -> bool {
    if metrics::text_contains(&chunk.content, &snippet.text) {
        return true;
    }

    let snippet_file = snippet
        .file_path
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(&snippet.file_path);
    if !chunk.filename.eq_ignore_ascii_case(snippet_file) {
        return false;
    }

    let wanted = significant_words(&snippet.text);
    if wanted.is_empty() {
        return false;
    }
    let text = metrics::normalize(&format!("{} {}", chunk.content, chunk.heading));
    let hits = wanted.iter().filter(|w| text.contains(w.as_str())).count();
    hits as f64 / wanted.len() as f64 > SNIPPET_OVERLAP
}

/// Fold per-test results into the aggregate report.
fn aggregate(dataset: &Dataset, results: Vec<TestResult>) -> EvalReport {
    let total = results.len();
    let passed = results.iter().filter(|r| r.passed).count();

    let mut averages = TestMetrics::default();
    let mut strict_sum = 0.0;
    let mut strict_count = 0usize;
    let mut per_category: BTreeMap<String, CategorySummary> = BTreeMap::new();

    for result in &results {
        averages.accuracy += result.metrics.accuracy;
        averages.context_recall += result.metrics.context_recall;
        averages.faithfulness += result.metrics.faithfulness;
        averages.relevance += result.metrics.relevance;
        averages.citation_quality += result.metrics.citation_quality;
        averages.claim_grounding += result.metrics.claim_grounding;
        averages.hallucination_score += result.metrics.hallucination_score;
        if let Some(strict) = result.metrics.strict_accuracy {
            strict_sum += strict;
            strict_count += 1;
        }

        let summary = per_category.entry(result.category.clone()).or_default();
        summary.tests += 1;
        if result.passed {
            summary.passed += 1;
        }
        summary.avg_accuracy += result.metrics.accuracy;
        summary.avg_context_recall += result.metrics.context_recall;
    }

    if total > 0 {
        let n = total as f64;
        averages.accuracy /= n;
        averages.context_recall /= n;
        averages.faithfulness /= n;
        averages.relevance /= n;
        averages.citation_quality /= n;
        averages.claim_grounding /= n;
        averages.hallucination_score /= n;
    }
    averages.strict_accuracy = (strict_count > 0).then(|| strict_sum / strict_count as f64);

    for summary in per_category.values_mut() {
        if summary.tests > 0 {
            summary.avg_accuracy /= summary.tests as f64;
            summary.avg_context_recall /= summary.tests as f64;
        }
    }

    EvalReport {
        dataset: dataset.name.clone(),
        difficulty: dataset.difficulty.clone(),
        total,
        passed,
        pass_rate: if total > 0 {
            passed as f64 / total as f64
        } else {
            0.0
        },
        averages,
        per_category,
        results,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::RetrievalResult;

    fn result(category: &str, accuracy: f64, recall: f64, passed: bool) -> TestResult {
        TestResult {
            question: "q".to_string(),
            category: category.to_string(),
            passed,
            metrics: TestMetrics {
                accuracy,
                context_recall: recall,
                ..Default::default()
            },
            diagnosis: Vec::new(),
            answer: String::new(),
            rounds: 1,
            error: None,
            retrieval: Vec::new(),
        }
    }

    fn chunk(content: &str, filename: &str) -> RetrievalResult {
        RetrievalResult {
            chunk_id: 1,
            document_id: 1,
            content: content.to_string(),
            heading: String::new(),
            page_number: 1,
            filename: filename.to_string(),
            score: 1.0,
            methods: vec![],
            vector_rank: None,
            fts_rank: None,
            graph_rank: None,
        }
    }

    fn dataset() -> Dataset {
        Dataset {
            name: "unit".to_string(),
            difficulty: "easy".to_string(),
            tests: Vec::new(),
        }
    }

    #[test]
    fn test_aggregate_per_category_sorted() {
        let results = vec![
            result("zeta", 1.0, 1.0, true),
            result("alpha", 0.0, 0.0, false),
            result("alpha", 1.0, 1.0, true),
        ];
        let report = aggregate(&dataset(), results);

        assert_eq!(report.total, 3);
        assert_eq!(report.passed, 2);
        let categories: Vec<&String> = report.per_category.keys().collect();
        assert_eq!(categories, vec!["alpha", "zeta"]);
        let alpha = &report.per_category["alpha"];
        assert_eq!(alpha.tests, 2);
        assert_eq!(alpha.passed, 1);
        assert!((alpha.avg_accuracy - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_aggregate_empty_dataset() {
        let report = aggregate(&dataset(), Vec::new());
        assert_eq!(report.total, 0);
        assert!((report.pass_rate - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_precision_recall_at_k() {
        let sources = vec![
            chunk("contains the snippet text verbatim here", "spec.txt"),
            chunk("unrelated content about packaging", "other.txt"),
        ];
        let snippets = vec![GroundTruthSnippet {
            file_path: "/corpus/spec.txt".to_string(),
            start: 0,
            end: 10,
            text: "the snippet text".to_string(),
        }];

        let metrics = precision_recall(&sources, &snippets);
        assert_eq!(metrics.len(), PRECISION_KS.len());

        let at1 = metrics[0];
        assert_eq!(at1.k, 1);
        assert!((at1.precision - 1.0).abs() < 1e-9);
        assert!((at1.recall - 1.0).abs() < 1e-9);

        let at4 = metrics[1];
        // both retrieved chunks considered, one relevant
        assert!((at4.precision - 0.5).abs() < 1e-9);
        assert!((at4.recall - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_chunk_matches_snippet_same_file_overlap() {
        let snippet = GroundTruthSnippet {
            file_path: "/corpus/spec.txt".to_string(),
            start: 0,
            end: 10,
            text: "minimum tensile strength requirement".to_string(),
        };
        // no verbatim text, same file, strong word overlap
        let same_file = chunk("the tensile strength minimum values", "spec.txt");
        assert!(chunk_matches_snippet(&same_file, &snippet));

        let wrong_file = chunk("the tensile strength minimum values", "other.txt");
        assert!(!chunk_matches_snippet(&wrong_file, &snippet));
    }
}
