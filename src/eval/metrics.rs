//! Scoring metrics for evaluation runs
//!
//! All metrics land in [0, 1]. Fact matching runs over a normalized text
//! form (collapsed Unicode whitespace, unified hyphen variants, zero-width
//! characters stripped) with space-less and hyphen-less fallbacks to absorb
//! model-inserted formatting.

use super::dataset::fact_alternatives;
use crate::retrieval::{significant_words, RetrievalResult};

/// Unicode hyphen variants that LLM output substitutes for '-'
const HYPHEN_VARIANTS: &[char] = &[
    '\u{2010}', '\u{2011}', '\u{2012}', '\u{2013}', '\u{2014}', '\u{2015}', '\u{2212}',
];

/// Zero-width characters stripped before matching
const ZERO_WIDTH: &[char] = &['\u{200b}', '\u{200c}', '\u{200d}', '\u{feff}'];

/// Normalize text for substring matching.
pub fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_was_space = false;
    for c in text.chars() {
        if ZERO_WIDTH.contains(&c) {
            continue;
        }
        let c = if HYPHEN_VARIANTS.contains(&c) { '-' } else { c };
        if c.is_whitespace() {
            if !last_was_space {
                out.push(' ');
                last_was_space = true;
            }
        } else {
            out.extend(c.to_lowercase());
            last_was_space = false;
        }
    }
    out.trim().to_string()
}

/// Normalized containment with space-less and hyphen-less fallbacks.
pub fn text_contains(haystack: &str, needle: &str) -> bool {
    let h = normalize(haystack);
    let n = normalize(needle);
    if n.is_empty() {
        return false;
    }
    if h.contains(&n) {
        return true;
    }

    let spaceless = |s: &str| s.replace(' ', "");
    if spaceless(&h).contains(&spaceless(&n)) {
        return true;
    }

    let bare = |s: &str| s.replace([' ', '-'], "");
    bare(&h).contains(&bare(&n))
}

/// True when any pipe-separated alternative of `fact` appears in `text`.
pub fn fact_covered(text: &str, fact: &str) -> bool {
    fact_alternatives(fact)
        .iter()
        .any(|alt| text_contains(text, alt))
}

/// Fraction of expected facts covered by the answer text.
pub fn accuracy(answer: &str, expected_facts: &[String]) -> f64 {
    fraction_covered(answer, expected_facts)
}

/// Fraction of expected facts covered by the retrieved context.
pub fn context_recall(context: &str, expected_facts: &[String]) -> f64 {
    fraction_covered(context, expected_facts)
}

fn fraction_covered(text: &str, expected_facts: &[String]) -> f64 {
    if expected_facts.is_empty() {
        return 1.0;
    }
    let covered = expected_facts
        .iter()
        .filter(|fact| fact_covered(text, fact))
        .count();
    covered as f64 / expected_facts.len() as f64
}

/// Phrases signalling the model answered from outside the corpus
const EXTERNAL_KNOWLEDGE_INDICATORS: &[&str] = &[
    "based on my knowledge",
    "in general",
    "typically",
    "usually",
    "as an ai",
    "commonly known",
    "general knowledge",
];

/// Penalty per external-knowledge indicator
const EXTERNAL_PENALTY: f64 = 0.2;

/// Bonus per distinct cited source filename, up to three
const SOURCE_BONUS: f64 = 0.1;
const SOURCE_BONUS_CAP: usize = 3;

/// Start at 1.0, subtract for external-knowledge phrasing, add for cited
/// source filenames, clamp to [0, 1].
pub fn faithfulness(answer: &str, source_filenames: &[String]) -> f64 {
    let lower = answer.to_lowercase();
    let mut score = 1.0;

    for indicator in EXTERNAL_KNOWLEDGE_INDICATORS {
        if lower.contains(indicator) {
            score -= EXTERNAL_PENALTY;
        }
    }

    let cited = distinct_cited(answer, source_filenames).min(SOURCE_BONUS_CAP);
    score += cited as f64 * SOURCE_BONUS;

    score.clamp(0.0, 1.0)
}

fn distinct_cited(answer: &str, source_filenames: &[String]) -> usize {
    let lower = answer.to_lowercase();
    let mut seen: Vec<&String> = Vec::new();
    for filename in source_filenames {
        if !seen.contains(&filename) && lower.contains(&filename.to_lowercase()) {
            seen.push(filename);
        }
    }
    seen.len()
}

/// Minimum share of the question's significant words a relevant chunk holds
const RELEVANCE_OVERLAP: f64 = 0.3;

/// Fraction of retrieved chunks whose content and heading carry at least
/// 30% of the question's significant words.
pub fn relevance(question: &str, sources: &[RetrievalResult]) -> f64 {
    if sources.is_empty() {
        return 0.0;
    }
    let wanted = significant_words(question);
    if wanted.is_empty() {
        return 1.0;
    }

    let relevant = sources
        .iter()
        .filter(|source| {
            let text = normalize(&format!("{} {}", source.content, source.heading));
            let hits = wanted.iter().filter(|w| text.contains(w.as_str())).count();
            hits as f64 / wanted.len() as f64 >= RELEVANCE_OVERLAP
        })
        .count();
    relevant as f64 / sources.len() as f64
}

/// Words that indicate the answer points back into the document
const CITATION_KEYWORDS: &[&str] = &[
    "section", "article", "clause", "page", "annex", "chapter", "sección", "capítulo", "anexo",
    "tabla", "tabela", "figura", "figure", "página",
];

const CITATION_BASE: f64 = 0.5;
const CITATION_KEYWORD_BONUS: f64 = 0.1;
const CITATION_KEYWORD_CAP: usize = 3;
const CITATION_FILENAME_BONUS: f64 = 0.1;

/// 0.5 base, plus 0.1 per distinct citation keyword (up to three), plus 0.1
/// when any source filename is referenced.
pub fn citation_quality(answer: &str, source_filenames: &[String]) -> f64 {
    let lower = answer.to_lowercase();

    let keywords = CITATION_KEYWORDS
        .iter()
        .filter(|k| lower.contains(*k))
        .count()
        .min(CITATION_KEYWORD_CAP);
    let mut score = CITATION_BASE + keywords as f64 * CITATION_KEYWORD_BONUS;

    if distinct_cited(answer, source_filenames) > 0 {
        score += CITATION_FILENAME_BONUS;
    }

    score.clamp(0.0, 1.0)
}

/// Fraction of the answer's significant terms and numbers present in the
/// source corpus text.
pub fn claim_grounding(answer: &str, corpus: &str) -> f64 {
    let claims = terms_and_numbers(answer);
    if claims.is_empty() {
        return 1.0;
    }
    let corpus_norm = normalize(corpus);
    let grounded = claims
        .iter()
        .filter(|claim| corpus_norm.contains(claim.as_str()))
        .count();
    grounded as f64 / claims.len() as f64
}

/// Numbers below this are too common to signal hallucination
const TRIVIAL_NUMBER_MAX: i64 = 10;

/// Minimum length of a "long technical term"
const TECHNICAL_TERM_LEN: usize = 8;

const NUMBER_WEIGHT: f64 = 1.0;
const TERM_WEIGHT: f64 = 0.5;

/// Returned when no sources exist to ground against
const NO_SOURCE_SCORE: f64 = 0.5;

/// `1 − penalty/max_penalty` over the answer's checkable claims: ungrounded
/// numbers weigh 1.0, ungrounded long technical terms 0.5. Trivial numbers
/// (0–10) are excluded. With no sources the score is indeterminate (0.5).
pub fn hallucination_score(answer: &str, sources: &[RetrievalResult]) -> f64 {
    if sources.is_empty() {
        return NO_SOURCE_SCORE;
    }

    let corpus = normalize(
        &sources
            .iter()
            .map(|s| format!("{} {}", s.content, s.heading))
            .collect::<Vec<_>>()
            .join(" "),
    );

    let mut max_penalty = 0.0;
    let mut penalty = 0.0;
    for claim in terms_and_numbers(answer) {
        let weight = if claim.chars().next().is_some_and(|c| c.is_ascii_digit()) {
            NUMBER_WEIGHT
        } else {
            TERM_WEIGHT
        };
        max_penalty += weight;
        if !corpus.contains(claim.as_str()) {
            penalty += weight;
        }
    }

    if max_penalty == 0.0 {
        return 1.0;
    }
    (1.0 - penalty / max_penalty).clamp(0.0, 1.0)
}

/// The answer's checkable claims: non-trivial numbers and long terms.
fn terms_and_numbers(text: &str) -> Vec<String> {
    let normalized = normalize(text);
    let mut claims = Vec::new();

    for word in normalized.split_whitespace() {
        let token = word.trim_matches(|c: char| !c.is_alphanumeric() && c != '.');
        if token.is_empty() {
            continue;
        }
        let numeric = token.chars().next().is_some_and(|c| c.is_ascii_digit());
        if numeric {
            let value: Option<i64> = token
                .trim_end_matches('.')
                .replace('.', "")
                .parse()
                .ok();
            if let Some(v) = value {
                if (0..=TRIVIAL_NUMBER_MAX).contains(&v) {
                    continue;
                }
            }
            if !claims.contains(&token.to_string()) {
                claims.push(token.to_string());
            }
        } else if token.chars().count() >= TECHNICAL_TERM_LEN && !claims.contains(&token.to_string())
        {
            claims.push(token.to_string());
        }
    }

    claims
}
