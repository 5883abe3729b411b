//! Structural classifiers for document text
//!
//! Pure, stateless heuristics shared by the parsers and the chunker:
//! heading detection, content typing, RFC-2119 requirement keywords,
//! standards references, clause numbering, definitions, cross-references
//! and table preservation.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

static NUMBERED_HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+(\.\d+)*\.?\s+\S").unwrap());

static SECTION_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(section|chapter|article|part|secci[oó]n|cap[ií]tulo|anexo|art[ií]culo|se[cç][aã]o|artigo|chapitre|annexe)\b",
    )
    .unwrap()
});

static CAPTION_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(tabla|tabela|tableau|figura|figure|cuadro|gr[aá]fico)\s+\d").unwrap()
});

static CLAUSE_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^(\d+(?:\.\d+)+)\s").unwrap());

static STANDARDS_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b(ISO/IEC|ISO|IEC|ASTM|IEEE|ANSI|BS\s?EN|BS|EN|DIN|NFPA|ASME|AWS|MIL-STD|SAE|API)[\s-]?([A-Z]?\d+(?:[.:\-]\d+)*)\b",
    )
    .unwrap()
});

static QUOTED_DEFINITION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^[“"]([^”"]+)[”"]\s+(?:shall\s+mean|means)\s+(.+)$"#).unwrap()
});

static COLON_DEFINITION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Z][A-Za-z0-9 /\-]{0,60}?):\s+(.+)$").unwrap());

static CROSS_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:clause|section|article|schedule|appendix|annex)\s+(\d+(?:\.\d+)*|[A-Z])\b|\(see\s+(\d+(?:\.\d+)*)\)",
    )
    .unwrap()
});

static MARKDOWN_SEPARATOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\-\|\s:]{3,}$").unwrap());

/// Maximum length of a heading line
const MAX_HEADING_LEN: usize = 120;

/// Check whether a line reads as a heading.
///
/// Headings are short all-caps lines, numbered prefixes ("3.", "3.2"),
/// language-specific section words, or table/figure captions followed by a
/// digit.
pub fn is_heading(line: &str) -> bool {
    let line = line.trim();
    if line.is_empty() || line.len() > MAX_HEADING_LEN {
        return false;
    }

    if line.len() > 2 && is_all_caps(line) {
        return true;
    }

    NUMBERED_HEADING.is_match(line)
        || SECTION_PREFIX.is_match(line)
        || CAPTION_PREFIX.is_match(line)
}

fn is_all_caps(line: &str) -> bool {
    let mut has_letter = false;
    for c in line.chars() {
        if c.is_alphabetic() {
            has_letter = true;
            if c.is_lowercase() {
                return false;
            }
        }
    }
    has_letter
}

/// Content classification of a block of text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Table,
    Definition,
    Requirement,
    Section,
    Paragraph,
}

/// Classify a block of text. Priority: table, definition, requirement,
/// section, paragraph.
pub fn content_type(text: &str) -> ContentType {
    if !detect_tables(text).is_empty() {
        ContentType::Table
    } else if !extract_definitions(text).is_empty() {
        ContentType::Definition
    } else if !detect_requirements(text).is_empty() {
        ContentType::Requirement
    } else if CLAUSE_NUMBER.is_match(text) {
        ContentType::Section
    } else {
        ContentType::Paragraph
    }
}

/// Binding strength of a requirement keyword
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequirementLevel {
    Mandatory,
    Recommended,
    Optional,
}

/// A detected requirement statement
#[derive(Debug, Clone, PartialEq)]
pub struct Requirement {
    pub text: String,
    pub keyword: &'static str,
    pub level: RequirementLevel,
    /// Zero-based line index within the input text
    pub line: usize,
}

/// RFC-2119 keywords, strongest first. Two-word forms precede their
/// one-word prefixes so "SHALL NOT" never reports as "SHALL".
const REQUIREMENT_KEYWORDS: &[(&str, RequirementLevel)] = &[
    ("SHALL NOT", RequirementLevel::Mandatory),
    ("MUST NOT", RequirementLevel::Mandatory),
    ("SHALL", RequirementLevel::Mandatory),
    ("MUST", RequirementLevel::Mandatory),
    ("SHOULD NOT", RequirementLevel::Recommended),
    ("SHOULD", RequirementLevel::Recommended),
    ("REQUIRED", RequirementLevel::Mandatory),
    ("RECOMMENDED", RequirementLevel::Recommended),
    ("MAY", RequirementLevel::Optional),
    ("OPTIONAL", RequirementLevel::Optional),
];

/// Find the strongest requirement keyword on each non-blank line.
pub fn detect_requirements(text: &str) -> Vec<Requirement> {
    let mut requirements = Vec::new();

    for (line_index, line) in text.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        // Case-insensitive matching reads lowercase "shall"/"must" prose
        // as requirements too; standards use either convention.
        let upper = trimmed.to_uppercase();
        for (keyword, level) in REQUIREMENT_KEYWORDS {
            if contains_word(&upper, keyword) {
                requirements.push(Requirement {
                    text: trimmed.to_string(),
                    keyword,
                    level: *level,
                    line: line_index,
                });
                break;
            }
        }
    }

    requirements
}

fn contains_word(haystack: &str, needle: &str) -> bool {
    let bytes = haystack.as_bytes();
    let mut start = 0;
    while let Some(pos) = haystack[start..].find(needle) {
        let at = start + pos;
        let before_ok = at == 0 || !bytes[at - 1].is_ascii_alphanumeric();
        let end = at + needle.len();
        let after_ok = end >= bytes.len() || !bytes[end].is_ascii_alphanumeric();
        if before_ok && after_ok {
            return true;
        }
        start = at + 1;
    }
    false
}

/// A reference to an external standard
#[derive(Debug, Clone, PartialEq)]
pub struct StandardsReference {
    /// The matched substring, e.g. "ISO 9001:2015"
    pub text: String,
    /// The standards body tag, e.g. "ISO"
    pub body: String,
    /// Byte offset of the match
    pub offset: usize,
}

/// Find ISO/IEC/ASTM/IEEE/ANSI/BS/EN/DIN/NFPA/ASME/AWS/MIL-STD/SAE/API
/// style references.
pub fn detect_standards_references(text: &str) -> Vec<StandardsReference> {
    STANDARDS_REF
        .captures_iter(text)
        .map(|caps| {
            let whole = caps.get(0).unwrap();
            StandardsReference {
                text: whole.as_str().to_string(),
                body: caps[1].to_string(),
                offset: whole.start(),
            }
        })
        .collect()
}

/// A hierarchical clause boundary ("4.2.1 ...")
#[derive(Debug, Clone, PartialEq)]
pub struct ClauseBoundary {
    pub number: String,
    /// Byte offset of the clause start
    pub offset: usize,
}

/// Find hierarchical clause numbers at line starts.
pub fn detect_clause_boundaries(text: &str) -> Vec<ClauseBoundary> {
    CLAUSE_NUMBER
        .captures_iter(text)
        .map(|caps| {
            let whole = caps.get(0).unwrap();
            ClauseBoundary {
                number: caps[1].to_string(),
                offset: whole.start(),
            }
        })
        .collect()
}

/// Partition text at clause boundaries, keeping any preamble as the first
/// element.
pub fn split_by_clauses(text: &str) -> Vec<String> {
    let boundaries = detect_clause_boundaries(text);
    if boundaries.is_empty() {
        return vec![text.to_string()];
    }

    let mut parts = Vec::new();
    if boundaries[0].offset > 0 {
        let preamble = &text[..boundaries[0].offset];
        if !preamble.trim().is_empty() {
            parts.push(preamble.trim_end().to_string());
        }
    }
    for (i, boundary) in boundaries.iter().enumerate() {
        let end = boundaries
            .get(i + 1)
            .map(|b| b.offset)
            .unwrap_or(text.len());
        parts.push(text[boundary.offset..end].trim_end().to_string());
    }

    parts
}

/// A detected term definition
#[derive(Debug, Clone, PartialEq)]
pub struct Definition {
    pub term: String,
    pub definition: String,
    /// Zero-based line index of the definition start
    pub line: usize,
}

/// Extract `"Term" means …`, `"Term" shall mean …` and `Term: definition`
/// forms. Indented continuation lines are appended to the open definition.
pub fn extract_definitions(text: &str) -> Vec<Definition> {
    let mut definitions: Vec<Definition> = Vec::new();

    for (line_index, line) in text.lines().enumerate() {
        let trimmed = line.trim_end();

        if let Some(caps) = QUOTED_DEFINITION.captures(trimmed.trim_start()) {
            definitions.push(Definition {
                term: caps[1].trim().to_string(),
                definition: caps[2].trim().to_string(),
                line: line_index,
            });
            continue;
        }

        if !line.starts_with(char::is_whitespace) {
            if let Some(caps) = COLON_DEFINITION.captures(trimmed) {
                definitions.push(Definition {
                    term: caps[1].trim().to_string(),
                    definition: caps[2].trim().to_string(),
                    line: line_index,
                });
                continue;
            }
        }

        // Continuation: indented, non-empty, not opening a clause or a
        // new definition
        if line.starts_with(char::is_whitespace)
            && !trimmed.trim().is_empty()
            && !CLAUSE_NUMBER.is_match(trimmed.trim_start())
        {
            if let Some(open) = definitions.last_mut() {
                open.definition.push(' ');
                open.definition.push_str(trimmed.trim());
            }
        }
    }

    definitions
}

/// A cross-reference to another clause, section or annex
#[derive(Debug, Clone, PartialEq)]
pub struct CrossReference {
    pub text: String,
    pub target: String,
    pub offset: usize,
}

/// Find clause/section/article/schedule/appendix/annex references and
/// "(see N.N)" forms.
pub fn detect_cross_references(text: &str) -> Vec<CrossReference> {
    CROSS_REFERENCE
        .captures_iter(text)
        .map(|caps| {
            let whole = caps.get(0).unwrap();
            let target = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str().to_string())
                .unwrap_or_default();
            CrossReference {
                text: whole.as_str().to_string(),
                target,
                offset: whole.start(),
            }
        })
        .collect()
}

/// A run of contiguous table lines
#[derive(Debug, Clone, PartialEq)]
pub struct TableBlock {
    pub text: String,
    /// Zero-based line index of the first table line
    pub start_line: usize,
    /// Zero-based line index one past the last table line
    pub end_line: usize,
}

fn is_table_line(line: &str) -> bool {
    if line.contains('|') && !line.trim().is_empty() {
        return true;
    }
    if line.matches('\t').count() >= 2 {
        return true;
    }
    let trimmed = line.trim();
    trimmed.len() >= 3 && trimmed.contains('-') && MARKDOWN_SEPARATOR.is_match(trimmed)
}

/// Find tables: runs of at least two contiguous table lines.
pub fn detect_tables(text: &str) -> Vec<TableBlock> {
    let lines: Vec<&str> = text.lines().collect();
    let mut tables = Vec::new();
    let mut run_start: Option<usize> = None;

    for (i, line) in lines.iter().enumerate() {
        if is_table_line(line) {
            run_start.get_or_insert(i);
        } else if let Some(start) = run_start.take() {
            if i - start >= 2 {
                tables.push(TableBlock {
                    text: lines[start..i].join("\n"),
                    start_line: start,
                    end_line: i,
                });
            }
        }
    }
    if let Some(start) = run_start {
        if lines.len() - start >= 2 {
            tables.push(TableBlock {
                text: lines[start..].join("\n"),
                start_line: start,
                end_line: lines.len(),
            });
        }
    }

    tables
}

/// A segment of text, either an atomic table or surrounding prose
#[derive(Debug, Clone, PartialEq)]
pub struct TextBlock {
    pub text: String,
    pub is_table: bool,
}

/// Split text so tables stay atomic, with prose between them in document
/// order.
pub fn preserve_table_chunks(text: &str) -> Vec<TextBlock> {
    let tables = detect_tables(text);
    if tables.is_empty() {
        return vec![TextBlock {
            text: text.to_string(),
            is_table: false,
        }];
    }

    let lines: Vec<&str> = text.lines().collect();
    let mut blocks = Vec::new();
    let mut cursor = 0;

    for table in &tables {
        if table.start_line > cursor {
            let prose = lines[cursor..table.start_line].join("\n");
            if !prose.trim().is_empty() {
                blocks.push(TextBlock {
                    text: prose,
                    is_table: false,
                });
            }
        }
        blocks.push(TextBlock {
            text: table.text.clone(),
            is_table: true,
        });
        cursor = table.end_line;
    }
    if cursor < lines.len() {
        let prose = lines[cursor..].join("\n");
        if !prose.trim().is_empty() {
            blocks.push(TextBlock {
                text: prose,
                is_table: false,
            });
        }
    }

    blocks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_heading_all_caps() {
        assert!(is_heading("MATERIAL SPECIFICATIONS"));
        assert!(is_heading("SCOPE AND FIELD OF APPLICATION"));
        assert!(!is_heading("AB")); // too short
        assert!(!is_heading("Normal prose sentence."));
    }

    #[test]
    fn test_is_heading_numbered() {
        assert!(is_heading("3. Scope"));
        assert!(is_heading("3.2 Tensile Strength"));
        assert!(is_heading("10.4.1 Sampling"));
        assert!(!is_heading("3.2")); // number alone, no title
    }

    #[test]
    fn test_is_heading_language_prefixes() {
        assert!(is_heading("Section 4 — Materials"));
        assert!(is_heading("Capítulo 2: Definiciones"));
        assert!(is_heading("Anexo B"));
        assert!(is_heading("Chapitre 3"));
        assert!(is_heading("Seção 5 Requisitos"));
    }

    #[test]
    fn test_is_heading_captions_need_digit() {
        assert!(is_heading("Tabla 3 Resultados"));
        assert!(is_heading("Figure 12: Assembly"));
        assert!(!is_heading("figura sin número"));
    }

    #[test]
    fn test_is_heading_length_cap() {
        let long = "A".repeat(121);
        assert!(!is_heading(&long));
    }

    #[test]
    fn test_content_type_priority() {
        let table = "col a | col b\n1 | 2";
        assert_eq!(content_type(table), ContentType::Table);

        let definition = r#""Force Majeure" means an event beyond control"#;
        assert_eq!(content_type(definition), ContentType::Definition);

        let requirement = "The coating SHALL withstand 500 MPa.";
        assert_eq!(content_type(requirement), ContentType::Requirement);

        let section = "4.1 General\nSome body text";
        assert_eq!(content_type(section), ContentType::Section);

        assert_eq!(content_type("Just plain prose."), ContentType::Paragraph);
    }

    #[test]
    fn test_detect_requirements_strength_order() {
        let text = "The valve SHALL NOT leak.\n\nOperators SHOULD wear gloves.\nUse MAY be recorded.";
        let reqs = detect_requirements(text);
        assert_eq!(reqs.len(), 3);
        assert_eq!(reqs[0].keyword, "SHALL NOT");
        assert_eq!(reqs[0].level, RequirementLevel::Mandatory);
        assert_eq!(reqs[0].line, 0);
        assert_eq!(reqs[1].keyword, "SHOULD");
        assert_eq!(reqs[1].level, RequirementLevel::Recommended);
        assert_eq!(reqs[1].line, 2);
        assert_eq!(reqs[2].keyword, "MAY");
        assert_eq!(reqs[2].level, RequirementLevel::Optional);
    }

    #[test]
    fn test_detect_requirements_word_boundaries() {
        // "dismay" and "mustard" are not keywords
        let text = "To their dismay the mustard spilled.";
        assert!(detect_requirements(text).is_empty());
    }

    #[test]
    fn test_detect_standards_references() {
        let text = "Conforms to ISO 9001:2015 and ASTM A36, see also MIL-STD-810.";
        let refs = detect_standards_references(text);
        assert_eq!(refs.len(), 3);
        assert_eq!(refs[0].text, "ISO 9001:2015");
        assert_eq!(refs[0].body, "ISO");
        assert_eq!(refs[0].offset, 12);
        assert_eq!(refs[1].body, "ASTM");
        assert_eq!(refs[2].body, "MIL-STD");
    }

    #[test]
    fn test_clause_boundaries_and_split() {
        let text = "Preamble text.\n4.1 First clause body\nmore\n4.2 Second clause";
        let boundaries = detect_clause_boundaries(text);
        assert_eq!(boundaries.len(), 2);
        assert_eq!(boundaries[0].number, "4.1");

        let parts = split_by_clauses(text);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "Preamble text.");
        assert!(parts[1].starts_with("4.1"));
        assert!(parts[2].starts_with("4.2"));
    }

    #[test]
    fn test_split_by_clauses_no_boundaries() {
        let parts = split_by_clauses("no clauses here");
        assert_eq!(parts, vec!["no clauses here".to_string()]);
    }

    #[test]
    fn test_extract_definitions_forms() {
        let text = concat!(
            "\"Force Majeure\" means an event beyond the reasonable control\n",
            "  of the affected party.\n",
            "\"Goods\" shall mean the items listed in Schedule 1.\n",
            "Tolerance: permitted deviation from the nominal value\n",
        );
        let defs = extract_definitions(text);
        assert_eq!(defs.len(), 3);
        assert_eq!(defs[0].term, "Force Majeure");
        assert!(defs[0].definition.ends_with("the affected party."));
        assert_eq!(defs[1].term, "Goods");
        assert_eq!(defs[2].term, "Tolerance");
        assert_eq!(defs[2].line, 3);
    }

    #[test]
    fn test_detect_cross_references() {
        let text = "As required by Clause 4.2 and Annex B (see 7.1).";
        let refs = detect_cross_references(text);
        assert_eq!(refs.len(), 3);
        assert_eq!(refs[0].target, "4.2");
        assert_eq!(refs[1].target, "B");
        assert_eq!(refs[2].target, "7.1");
    }

    #[test]
    fn test_detect_tables_contiguous_runs() {
        let text = "intro\nA | B\n1 | 2\n3 | 4\noutro";
        let tables = detect_tables(text);
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].start_line, 1);
        assert_eq!(tables[0].end_line, 4);

        // a single table line is not a table
        assert!(detect_tables("prose\nA | B\nprose").is_empty());
    }

    #[test]
    fn test_detect_tables_tabs_and_separators() {
        let text = "name\tsize\tgrade\nbolt\tM8\t8.8";
        assert_eq!(detect_tables(text).len(), 1);

        let md = "| A | B |\n|---|---|\n| 1 | 2 |";
        assert_eq!(detect_tables(md).len(), 1);
    }

    #[test]
    fn test_preserve_table_chunks_order() {
        let text = "before\nA | B\n1 | 2\nafter";
        let blocks = preserve_table_chunks(text);
        assert_eq!(blocks.len(), 3);
        assert!(!blocks[0].is_table);
        assert_eq!(blocks[0].text, "before");
        assert!(blocks[1].is_table);
        assert!(!blocks[2].is_table);
        assert_eq!(blocks[2].text, "after");
    }
}
