//! Bounded multi-round reasoning over retrieved context
//!
//! A state machine that retrieves, prompts the chat model for a structured
//! answer, inspects confidence, and optionally reformulates the query for
//! another round. Rounds are hard-bounded; a run makes at most
//! `max_rounds` answer calls plus one reformulation call per transition.

use crate::config::ReasoningConfig;
use crate::error::{EngineError, Result};
use crate::llm::{system_message, user_message, ChatProvider, ChatRequest};
use crate::retrieval::{RetrievalResult, Retriever, SearchTrace};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Structured payload the model is asked to return
#[derive(Debug, Clone, Deserialize)]
struct ModelAnswer {
    #[serde(alias = "answer", default)]
    text: String,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    found: bool,
}

/// Token usage accumulated over all model calls of one query
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Record of one reasoning round
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningStep {
    /// 1-based round number
    pub round: usize,
    /// Query used for this round's retrieval
    pub query: String,
    /// Chunks retrieved for this round
    pub retrieved: usize,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub elapsed_ms: u64,
    /// Parse problems encountered without failing the round
    pub issues: Vec<String>,
    /// Query produced for the next round, when reformulation ran
    pub reformulated_query: Option<String>,
}

/// Final answer with full provenance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    pub text: String,
    pub confidence: f64,
    pub found: bool,
    /// Rounds actually executed
    pub rounds: usize,
    pub model_used: String,
    pub sources: Vec<RetrievalResult>,
    pub reasoning: Vec<ReasoningStep>,
    pub retrieval_trace: Option<SearchTrace>,
    pub usage: TokenUsage,
    /// Set when the loop ended abnormally (e.g. "cancelled")
    pub error: Option<String>,
}

/// States of the per-query loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RoundState {
    RoundStart,
    AwaitingModel,
    Evaluating,
    Reformulating,
    Done,
}

/// The reasoning engine
pub struct ReasoningEngine {
    retriever: Retriever,
    chat: Arc<dyn ChatProvider>,
    config: ReasoningConfig,
}

impl ReasoningEngine {
    pub fn new(retriever: Retriever, chat: Arc<dyn ChatProvider>, config: ReasoningConfig) -> Self {
        Self {
            retriever,
            chat,
            config,
        }
    }

    /// Answer a question with at most `max_rounds` chat rounds.
    pub async fn answer(&self, question: &str, cancel: &CancellationToken) -> Result<Answer> {
        let mut state = RoundState::RoundStart;
        let mut round = 0usize;
        let mut current_query = question.to_string();

        let mut steps: Vec<ReasoningStep> = Vec::new();
        let mut usage = TokenUsage::default();
        let mut sources: Vec<RetrievalResult> = Vec::new();
        let mut trace: Option<SearchTrace> = None;
        let mut best = ModelAnswer {
            text: String::new(),
            confidence: 0.0,
            found: false,
        };

        loop {
            match state {
                RoundState::RoundStart => {
                    if cancel.is_cancelled() {
                        return Ok(self.finish_cancelled(
                            question, round, steps, usage, sources, trace, best,
                        ));
                    }
                    round += 1;
                    debug!("Round {} retrieving for {:?}", round, current_query);
                    let (results, search_trace) =
                        self.retriever.retrieve(&current_query, cancel).await?;
                    sources = results;
                    trace = Some(search_trace);
                    state = RoundState::AwaitingModel;
                }

                RoundState::AwaitingModel => {
                    let started = Instant::now();
                    let prompt = build_prompt(question, &sources);
                    let request = ChatRequest::new(prompt).json_object();

                    let response = tokio::select! {
                        _ = cancel.cancelled() => {
                            return Ok(self.finish_cancelled(
                                question, round, steps, usage, sources, trace, best,
                            ));
                        }
                        outcome = self.chat.chat(request) => outcome?,
                    };

                    usage.prompt_tokens += response.prompt_tokens;
                    usage.completion_tokens += response.completion_tokens;
                    usage.total_tokens += response.total_tokens;

                    let (parsed, issues) = parse_structured(&response.content);
                    best = parsed;
                    steps.push(ReasoningStep {
                        round,
                        query: current_query.clone(),
                        retrieved: sources.len(),
                        prompt_tokens: response.prompt_tokens,
                        completion_tokens: response.completion_tokens,
                        elapsed_ms: (started.elapsed().as_millis() as u64).max(1),
                        issues,
                        reformulated_query: None,
                    });
                    state = RoundState::Evaluating;
                }

                RoundState::Evaluating => {
                    let accepted =
                        best.found && best.confidence >= self.config.confidence_threshold;
                    if accepted || round >= self.config.max_rounds {
                        state = RoundState::Done;
                    } else {
                        state = RoundState::Reformulating;
                    }
                }

                RoundState::Reformulating => {
                    if cancel.is_cancelled() {
                        return Ok(self.finish_cancelled(
                            question, round, steps, usage, sources, trace, best,
                        ));
                    }
                    match self.reformulate(question, &current_query).await {
                        Ok((query, call_usage)) => {
                            usage.prompt_tokens += call_usage.prompt_tokens;
                            usage.completion_tokens += call_usage.completion_tokens;
                            usage.total_tokens += call_usage.total_tokens;
                            if let Some(step) = steps.last_mut() {
                                step.reformulated_query = Some(query.clone());
                            }
                            current_query = query;
                        }
                        Err(e) => {
                            // a failed reformulation keeps the original query
                            warn!("Reformulation failed, retrying with same query: {}", e);
                        }
                    }
                    state = RoundState::RoundStart;
                }

                RoundState::Done => {
                    info!(
                        "Answered in {} round(s), confidence {:.2}",
                        round, best.confidence
                    );
                    return Ok(Answer {
                        text: best.text,
                        confidence: best.confidence,
                        found: best.found,
                        rounds: round,
                        model_used: self.chat.model().to_string(),
                        sources,
                        reasoning: steps,
                        retrieval_trace: trace,
                        usage,
                        error: None,
                    });
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_cancelled(
        &self,
        question: &str,
        round: usize,
        steps: Vec<ReasoningStep>,
        usage: TokenUsage,
        sources: Vec<RetrievalResult>,
        trace: Option<SearchTrace>,
        best: ModelAnswer,
    ) -> Answer {
        warn!("Query {:?} cancelled in round {}", question, round);
        Answer {
            text: best.text,
            confidence: best.confidence,
            found: best.found,
            rounds: round,
            model_used: self.chat.model().to_string(),
            sources,
            reasoning: steps,
            retrieval_trace: trace,
            usage,
            error: Some("cancelled".to_string()),
        }
    }

    /// Ask the model for an expanded or re-focused search query.
    async fn reformulate(&self, question: &str, previous: &str) -> Result<(String, TokenUsage)> {
        let request = ChatRequest::new(vec![
            system_message(
                "You improve search queries over a technical document corpus. \
                 Respond with only the improved query text, nothing else.",
            ),
            user_message(format!(
                "The search \"{previous}\" did not surface enough evidence to answer:\n\
                 {question}\n\n\
                 Propose an expanded or re-focused search query."
            )),
        ]);

        let response = self.chat.chat(request).await?;
        let usage = TokenUsage {
            prompt_tokens: response.prompt_tokens,
            completion_tokens: response.completion_tokens,
            total_tokens: response.total_tokens,
        };
        let query = response.content.trim().trim_matches('"').trim().to_string();
        if query.is_empty() {
            return Ok((previous.to_string(), usage));
        }
        Ok((query, usage))
    }
}

/// Assemble the per-round prompt: preamble, cited context, question and the
/// structured-output instruction.
fn build_prompt(question: &str, sources: &[RetrievalResult]) -> Vec<crate::llm::Message> {
    let mut context = String::new();
    if sources.is_empty() {
        context.push_str("(no matching context was retrieved)\n");
    }
    for (i, source) in sources.iter().enumerate() {
        let heading = if source.heading.is_empty() {
            "untitled"
        } else {
            &source.heading
        };
        context.push_str(&format!(
            "[{n}] {file}, page {page}, {heading}\n{content}\n\n",
            n = i + 1,
            file = source.filename,
            page = source.page_number,
            heading = heading,
            content = source.content,
        ));
    }

    vec![
        system_message(
            "You answer questions strictly from the provided document excerpts. \
             Cite the source filename and section when possible. If the excerpts \
             do not contain the answer, say so.",
        ),
        user_message(format!(
            "Context:\n\n{context}Question: {question}\n\n\
             Respond with a JSON object: {{\"text\": \"<answer with citations>\", \
             \"confidence\": <0.0-1.0>, \"found\": <true|false>}}."
        )),
    ]
}

/// Parse the model's structured response, falling back to balanced-brace
/// extraction. Problems are reported, never fatal.
fn parse_structured(content: &str) -> (ModelAnswer, Vec<String>) {
    let mut issues = Vec::new();

    if let Ok(parsed) = serde_json::from_str::<ModelAnswer>(content.trim()) {
        return (clamp(parsed), issues);
    }

    if let Some(candidate) = extract_json_object(content) {
        if let Ok(parsed) = serde_json::from_str::<ModelAnswer>(&candidate) {
            issues.push("response was not pure JSON; extracted embedded object".to_string());
            return (clamp(parsed), issues);
        }
    }

    issues.push("failed to parse structured response; using raw text".to_string());
    (
        ModelAnswer {
            text: content.trim().to_string(),
            confidence: 0.0,
            found: false,
        },
        issues,
    )
}

fn clamp(mut answer: ModelAnswer) -> ModelAnswer {
    answer.confidence = answer.confidence.clamp(0.0, 1.0);
    answer
}

/// Find the first balanced `{…}` object in free-form text.
fn extract_json_object(content: &str) -> Option<String> {
    let start = content.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in content[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(content[start..=start + offset].to_string());
                }
            }
            _ => {}
        }
    }
    None
}
