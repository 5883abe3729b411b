//! Query feature extraction
//!
//! Pure analysis of the incoming question: identifier detection (standards
//! and clause numbers), stopword-stripped FTS query construction, and the
//! significant terms used to seed graph search.

use regex::Regex;
use std::sync::LazyLock;
use unicode_segmentation::UnicodeSegmentation;

/// Standards-style tokens ("ISO 9001", "MIL-STD-810") and clause numbers
/// ("4.2.1") bias retrieval toward lexical search.
static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[A-Z]{2,}[-_\s]?\d+\b|\b\d+(?:\.\d+)+\b").unwrap());

pub(crate) const STOPWORDS_EN: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "has", "have", "how", "in",
    "is", "it", "its", "of", "on", "or", "that", "the", "this", "to", "was", "what", "when",
    "where", "which", "who", "why", "will", "with",
];

pub(crate) const STOPWORDS_ES: &[&str] = &[
    "al", "como", "con", "cual", "cuál", "de", "del", "donde", "dónde", "el", "en", "es", "la",
    "las", "lo", "los", "para", "por", "que", "qué", "se", "son", "un", "una", "y",
];

fn is_stopword(word: &str) -> bool {
    STOPWORDS_EN.contains(&word) || STOPWORDS_ES.contains(&word)
}

/// Minimum length of a significant word
const SIGNIFICANT_WORD_LEN: usize = 4;

/// Lowercased non-stopword words of length ≥ 4, in text order.
pub fn significant_words(text: &str) -> Vec<String> {
    text.unicode_words()
        .map(str::to_lowercase)
        .filter(|w| w.chars().count() >= SIGNIFICANT_WORD_LEN && !is_stopword(w))
        .collect()
}

/// Extracted features of one query
#[derive(Debug, Clone, Default)]
pub struct QueryFeatures {
    /// The query contains a standards or clause identifier
    pub identifiers_detected: bool,
    /// The matched identifier substrings
    pub identifiers: Vec<String>,
    /// OR-joined FTS5 MATCH query with stopwords removed
    pub fts_query: String,
    /// Significant terms used to seed entity lookup
    pub graph_terms: Vec<String>,
}

impl QueryFeatures {
    /// Analyze a query string.
    pub fn extract(query: &str) -> Self {
        let identifiers: Vec<String> = IDENTIFIER
            .find_iter(query)
            .map(|m| m.as_str().to_string())
            .collect();
        let identifiers_detected = !identifiers.is_empty();

        // words already covered by an identifier phrase are not repeated
        let identifier_words: Vec<String> = identifiers
            .iter()
            .flat_map(|id| id.unicode_words().map(str::to_lowercase))
            .collect();

        let mut terms: Vec<String> = Vec::new();
        for word in query.unicode_words() {
            let lower = word.to_lowercase();
            if is_stopword(&lower) || identifier_words.contains(&lower) {
                continue;
            }
            if !terms.contains(&lower) {
                terms.push(lower);
            }
        }

        // identifiers are quoted so FTS tokenization keeps them intact
        let mut fts_parts: Vec<String> = identifiers
            .iter()
            .map(|id| format!("\"{}\"", id.replace('"', "\"\"")))
            .collect();
        fts_parts.extend(terms.iter().cloned());
        let fts_query = fts_parts.join(" OR ");

        let graph_terms = significant_words(query);

        Self {
            identifiers_detected,
            identifiers,
            fts_query,
            graph_terms,
        }
    }
}
