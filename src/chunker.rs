//! Hierarchical chunking of parsed sections
//!
//! Translates a `Section` tree into a flat, ordered sequence of store-ready
//! chunks. Hierarchy survives as `parent` indexes into the emitted slice;
//! the store remaps those temporary positions to row ids at insert time.

use crate::config::ChunkerConfig;
use crate::parse::{Section, SectionType};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::LazyLock;

/// Kind of a retrievable chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkType {
    Section,
    Paragraph,
    Table,
    Definition,
    Requirement,
    Annex,
}

impl ChunkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Section => "section",
            Self::Paragraph => "paragraph",
            Self::Table => "table",
            Self::Definition => "definition",
            Self::Requirement => "requirement",
            Self::Annex => "annex",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "paragraph" => Self::Paragraph,
            "table" => Self::Table,
            "definition" => Self::Definition,
            "requirement" => Self::Requirement,
            "annex" => Self::Annex,
            _ => Self::Section,
        }
    }
}

/// A chunk ready for insertion, identified by its position in the plan
#[derive(Debug, Clone)]
pub struct PendingChunk {
    /// Monotonic position within the document; doubles as the temporary id
    pub position: usize,
    /// Position of the parent chunk within the same plan
    pub parent: Option<usize>,
    pub content: String,
    pub chunk_type: ChunkType,
    pub heading: String,
    pub page_number: i32,
    pub token_count: usize,
    pub metadata: HashMap<String, String>,
}

/// Output of a chunking pass
#[derive(Debug, Clone, Default)]
pub struct ChunkPlan {
    pub chunks: Vec<PendingChunk>,
    /// Plan positions emitted per section, in traversal (pre-)order.
    /// Used to attach extracted images to their chunk.
    pub section_chunks: Vec<Vec<usize>>,
}

/// Length cap for the parent chunk's content excerpt
const PARENT_EXCERPT_CHARS: usize = 200;

static PARAGRAPH_BREAK: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"\n[ \t]*\n").unwrap());

/// Estimate the token count of a text: `ceil(words × 1.3)`.
pub fn estimate_tokens(text: &str) -> usize {
    let words = text.split_whitespace().count();
    (words as f64 * 1.3).ceil() as usize
}

/// SHA-256 hex digest of a chunk's content.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Section-tree chunker
pub struct Chunker {
    config: ChunkerConfig,
}

impl Chunker {
    pub fn new(config: ChunkerConfig) -> Self {
        Self { config }
    }

    /// Words carried from the tail of a flushed fragment into the next one
    fn overlap_words(&self) -> usize {
        ((self.config.overlap as f64 / 1.3).floor() as usize).max(1)
    }

    /// Flatten a section tree into an ordered chunk plan.
    ///
    /// Each chunk's `parent`, when present, refers to an earlier position
    /// in the returned slice. Empty input yields an empty plan.
    pub fn chunk(&self, sections: &[Section]) -> ChunkPlan {
        let mut plan = ChunkPlan::default();
        for section in sections {
            self.walk(section, None, &mut plan);
        }
        plan
    }

    fn walk(&self, section: &Section, parent: Option<usize>, plan: &mut ChunkPlan) {
        let section_slot = plan.section_chunks.len();
        plan.section_chunks.push(Vec::new());

        let parent_position = plan.chunks.len();
        let excerpt = truncate_at_whitespace(section.content.trim(), PARENT_EXCERPT_CHARS);
        let parent_content = match (section.heading.is_empty(), excerpt.is_empty()) {
            (false, false) => format!("{}\n\n{}", section.heading, excerpt),
            (false, true) => section.heading.clone(),
            (true, _) => excerpt,
        };
        plan.chunks.push(PendingChunk {
            position: parent_position,
            parent,
            token_count: estimate_tokens(&parent_content),
            content: parent_content,
            chunk_type: chunk_type_for(section.section_type),
            heading: section.heading.clone(),
            page_number: section.page_number,
            metadata: section.metadata.clone(),
        });
        plan.section_chunks[section_slot].push(parent_position);

        if !section.content.trim().is_empty() {
            for fragment in self.split_content(&section.content) {
                let position = plan.chunks.len();
                plan.chunks.push(PendingChunk {
                    position,
                    parent: Some(parent_position),
                    token_count: estimate_tokens(&fragment),
                    content: fragment,
                    chunk_type: ChunkType::Paragraph,
                    heading: section.heading.clone(),
                    page_number: section.page_number,
                    metadata: HashMap::new(),
                });
                plan.section_chunks[section_slot].push(position);
            }
        }

        for child in &section.children {
            self.walk(child, Some(parent_position), plan);
        }
    }

    /// Split section content into fragments within the token budget.
    ///
    /// Splits at blank-line paragraph boundaries first; a paragraph that
    /// alone exceeds the budget is split at sentence boundaries. Each
    /// flush carries the trailing overlap words into the next fragment.
    pub fn split_content(&self, content: &str) -> Vec<String> {
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }
        if estimate_tokens(trimmed) <= self.config.max_tokens {
            return vec![trimmed.to_string()];
        }

        let paragraphs: Vec<&str> = PARAGRAPH_BREAK
            .split(trimmed)
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect();

        let mut fragments = Vec::new();
        let mut current = String::new();

        for paragraph in paragraphs {
            if estimate_tokens(paragraph) > self.config.max_tokens {
                // Oversized paragraph: flush what we have, then split it
                // at sentence boundaries under the same overlap policy.
                let carry = self.flush(&mut fragments, &mut current);
                current = self.split_sentences(paragraph, &mut fragments, carry);
                continue;
            }

            let candidate_tokens = estimate_tokens(&current) + estimate_tokens(paragraph);
            if !current.is_empty() && candidate_tokens > self.config.max_tokens {
                let carry = self.flush(&mut fragments, &mut current);
                current = carry;
            }
            if !current.is_empty() {
                current.push_str("\n\n");
            }
            current.push_str(paragraph);
        }

        if !current.trim().is_empty() {
            fragments.push(current.trim().to_string());
        }

        fragments
    }

    /// Split one oversized paragraph at sentence boundaries, pushing full
    /// fragments and returning the still-open remainder.
    fn split_sentences(
        &self,
        paragraph: &str,
        fragments: &mut Vec<String>,
        carry: String,
    ) -> String {
        let mut current = carry;
        for sentence in split_sentence_boundaries(paragraph) {
            let candidate_tokens = estimate_tokens(&current) + estimate_tokens(&sentence);
            if !current.is_empty() && candidate_tokens > self.config.max_tokens {
                current = self.flush(fragments, &mut current);
            }
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(&sentence);
        }
        current
    }

    /// Push the current fragment and return the overlap carry for the next.
    fn flush(&self, fragments: &mut Vec<String>, current: &mut String) -> String {
        let text = current.trim().to_string();
        current.clear();
        if text.is_empty() {
            return String::new();
        }
        let words: Vec<&str> = text.split_whitespace().collect();
        let carry_from = words.len().saturating_sub(self.overlap_words());
        let carry = words[carry_from..].join(" ");
        fragments.push(text);
        carry
    }
}

fn chunk_type_for(section_type: SectionType) -> ChunkType {
    match section_type {
        SectionType::Table => ChunkType::Table,
        SectionType::Definition => ChunkType::Definition,
        SectionType::Requirement => ChunkType::Requirement,
        SectionType::Paragraph => ChunkType::Paragraph,
        SectionType::Annex => ChunkType::Annex,
        SectionType::Section => ChunkType::Section,
    }
}

/// Cut text at the last whitespace within `max_chars`, appending "…".
fn truncate_at_whitespace(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut_byte = text
        .char_indices()
        .nth(max_chars)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    let head = &text[..cut_byte];
    let cut = head
        .rfind(|c: char| c.is_whitespace())
        .unwrap_or(head.len());
    format!("{}…", head[..cut].trim_end())
}

/// Split at `.`, `?`, `!` followed by whitespace or end of string. The
/// terminator stays with its sentence.
fn split_sentence_boundaries(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if matches!(c, '.' | '?' | '!') {
            let at_end = i + 1 >= bytes.len();
            let before_space = !at_end && bytes[i + 1].is_ascii_whitespace();
            if at_end || before_space {
                let sentence = text[start..=i].trim();
                if !sentence.is_empty() {
                    sentences.push(sentence.to_string());
                }
                start = i + 1;
            }
        }
        i += 1;
    }
    let tail = text[start.min(text.len())..].trim();
    if !tail.is_empty() {
        sentences.push(tail.to_string());
    }
    sentences
}
