//! Parser contract and section post-processing
//!
//! Concrete PDF/DOCX/XLSX/PPTX extractors are external collaborators; this
//! module fixes the interface they emit. A native plain-text parser is
//! included so the engine is exercisable end-to-end without them.

use crate::classify;
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Supported document formats
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DocumentFormat {
    Pdf,
    Docx,
    Xlsx,
    Pptx,
    Txt,
}

impl DocumentFormat {
    /// Detect the format from a file extension
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .map(|s| s.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "pdf" => Ok(Self::Pdf),
            "docx" => Ok(Self::Docx),
            "xlsx" => Ok(Self::Xlsx),
            "pptx" => Ok(Self::Pptx),
            "txt" | "text" | "md" => Ok(Self::Txt),
            other => Err(EngineError::InvalidConfig(format!(
                "unknown document format: .{other}"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Docx => "docx",
            Self::Xlsx => "xlsx",
            Self::Pptx => "pptx",
            Self::Txt => "txt",
        }
    }
}

/// How a document was parsed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ParseMethod {
    Native,
    Vision,
    External,
}

impl ParseMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Native => "native",
            Self::Vision => "vision",
            Self::External => "external",
        }
    }
}

/// Structural role of a parsed section
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SectionType {
    Section,
    Paragraph,
    Table,
    Definition,
    Requirement,
    Annex,
}

/// A parsed section of a document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Section {
    pub heading: String,
    pub content: String,
    pub level: i32,
    pub page_number: i32,
    pub section_type: SectionType,
    #[serde(default)]
    pub children: Vec<Section>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Section {
    pub fn new(heading: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            heading: heading.into(),
            content: content.into(),
            level: 1,
            page_number: 1,
            section_type: SectionType::Section,
            children: Vec::new(),
            metadata: HashMap::new(),
        }
    }
}

/// An image extracted from a document
#[derive(Debug, Clone)]
pub struct ExtractedImage {
    pub data: Vec<u8>,
    pub mime_type: String,
    pub page_number: i32,
    /// Index of the section (in traversal order) the image belongs to
    pub section_index: usize,
    pub width: i32,
    pub height: i32,
}

/// Output of a document parser
#[derive(Debug, Clone)]
pub struct ParseResult {
    pub sections: Vec<Section>,
    pub images: Vec<ExtractedImage>,
    pub method: ParseMethod,
    pub metadata: HashMap<String, String>,
}

/// Trait for document parsers
#[async_trait]
pub trait DocumentParser: Send + Sync {
    /// Parse the file at `path` into a section tree
    async fn parse(&self, path: &Path) -> Result<ParseResult>;
}

/// Heading separator produced when an empty-content heading adopts the next
/// one. Merged headings are never treated as running headers.
const MERGED_HEADING_SEPARATOR: &str = " — ";

/// Collapse running headers that repeat across page boundaries.
///
/// A heading seen on at least `max(3, total_pages / 4)` distinct pages is a
/// layout artifact, not a content heading: its heading text and level are
/// replaced by the last real heading seen. Content, page number and type
/// are untouched.
pub fn collapse_running_headers(sections: &mut [Section], total_pages: usize) {
    let threshold = 3.max(total_pages / 4);

    let mut pages_per_heading: HashMap<&str, std::collections::HashSet<i32>> = HashMap::new();
    for section in sections.iter() {
        if section.heading.is_empty() || section.heading.contains(MERGED_HEADING_SEPARATOR) {
            continue;
        }
        pages_per_heading
            .entry(section.heading.as_str())
            .or_default()
            .insert(section.page_number);
    }

    let running: std::collections::HashSet<String> = pages_per_heading
        .into_iter()
        .filter(|(_, pages)| pages.len() >= threshold)
        .map(|(heading, _)| heading.to_string())
        .collect();

    if running.is_empty() {
        return;
    }

    let mut last_real: Option<(String, i32)> = None;
    for section in sections.iter_mut() {
        if running.contains(&section.heading) {
            if let Some((heading, level)) = &last_real {
                section.heading = heading.clone();
                section.level = *level;
            }
        } else if !section.heading.is_empty() {
            last_real = Some((section.heading.clone(), section.level));
        }
    }
}

/// Native parser for plain-text documents.
///
/// Splits on detected headings and classifies section content so `.txt`
/// fixtures behave like their office-format counterparts.
pub struct TextParser;

#[async_trait]
impl DocumentParser for TextParser {
    async fn parse(&self, path: &Path) -> Result<ParseResult> {
        let text =
            tokio::fs::read_to_string(path)
                .await
                .map_err(|e| EngineError::CorruptedInput {
                    path: path.display().to_string(),
                    message: e.to_string(),
                })?;

        Ok(ParseResult {
            sections: sections_from_text(&text),
            images: Vec::new(),
            method: ParseMethod::Native,
            metadata: HashMap::new(),
        })
    }
}

/// Split raw text into flat sections at detected headings.
pub fn sections_from_text(text: &str) -> Vec<Section> {
    let mut sections: Vec<Section> = Vec::new();
    let mut heading = String::new();
    let mut level = 1;
    let mut body: Vec<&str> = Vec::new();

    let flush = |sections: &mut Vec<Section>, heading: &str, level: i32, body: &[&str]| {
        let content = body.join("\n").trim().to_string();
        if heading.is_empty() && content.is_empty() {
            return;
        }
        let section_type = section_type_for(&content);
        sections.push(Section {
            heading: heading.to_string(),
            content,
            level,
            page_number: 1,
            section_type,
            children: Vec::new(),
            metadata: HashMap::new(),
        });
    };

    for line in text.lines() {
        let trimmed = line.trim();
        if classify::is_heading(trimmed) {
            flush(&mut sections, &heading, level, &body);
            heading = trimmed.to_string();
            level = heading_level(trimmed);
            body.clear();
        } else {
            body.push(line);
        }
    }
    flush(&mut sections, &heading, level, &body);

    sections
}

fn section_type_for(content: &str) -> SectionType {
    match classify::content_type(content) {
        classify::ContentType::Table => SectionType::Table,
        classify::ContentType::Definition => SectionType::Definition,
        classify::ContentType::Requirement => SectionType::Requirement,
        classify::ContentType::Section => SectionType::Section,
        classify::ContentType::Paragraph => SectionType::Paragraph,
    }
}

/// Nesting depth from a numbered heading prefix ("3.2.1" is level 3).
fn heading_level(heading: &str) -> i32 {
    let prefix: String = heading
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    if prefix.chars().any(|c| c.is_ascii_digit()) {
        prefix.trim_end_matches('.').matches('.').count() as i32 + 1
    } else {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_path() {
        assert_eq!(
            DocumentFormat::from_path(Path::new("a/b/spec.PDF")).unwrap(),
            DocumentFormat::Pdf
        );
        assert_eq!(
            DocumentFormat::from_path(Path::new("notes.txt")).unwrap(),
            DocumentFormat::Txt
        );
        assert!(DocumentFormat::from_path(Path::new("archive.zip")).is_err());
    }

    #[test]
    fn test_sections_from_text_splits_on_headings() {
        let text = "1. Introduction\nSome intro text.\n\n2. Requirements\nThe system shall respond.";
        let sections = sections_from_text(text);
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].heading, "1. Introduction");
        assert_eq!(sections[1].heading, "2. Requirements");
        assert_eq!(sections[1].section_type, SectionType::Requirement);
    }

    #[test]
    fn test_heading_level_from_numbering() {
        assert_eq!(heading_level("3. Scope"), 1);
        assert_eq!(heading_level("3.2 Tensile"), 2);
        assert_eq!(heading_level("3.2.1 Detail"), 3);
        assert_eq!(heading_level("ANNEX"), 1);
    }

    #[test]
    fn test_collapse_running_headers() {
        let mut sections: Vec<Section> = Vec::new();
        sections.push(Section {
            heading: "Material Specifications".to_string(),
            content: "Intro".to_string(),
            level: 1,
            page_number: 1,
            section_type: SectionType::Section,
            children: Vec::new(),
            metadata: HashMap::new(),
        });
        for page in 1..=6 {
            sections.push(Section {
                heading: "ACME Corp — Confidential".to_string(),
                content: format!("Body on page {page}"),
                level: 1,
                page_number: page,
                section_type: SectionType::Paragraph,
                children: Vec::new(),
                metadata: HashMap::new(),
            });
        }

        // 6 distinct pages >= max(3, 8/4), but the merged heading is exempt
        collapse_running_headers(&mut sections, 8);
        assert!(sections[1..]
            .iter()
            .all(|s| s.heading == "ACME Corp — Confidential"));

        // A plain repeated header gets replaced by the last real heading
        let mut sections: Vec<Section> = vec![Section {
            heading: "Material Specifications".to_string(),
            content: "Intro".to_string(),
            level: 2,
            page_number: 1,
            section_type: SectionType::Section,
            children: Vec::new(),
            metadata: HashMap::new(),
        }];
        for page in 1..=6 {
            sections.push(Section {
                heading: "Confidential Draft".to_string(),
                content: format!("Body on page {page}"),
                level: 1,
                page_number: page,
                section_type: SectionType::Paragraph,
                children: Vec::new(),
                metadata: HashMap::new(),
            });
        }
        collapse_running_headers(&mut sections, 8);
        for section in &sections[1..] {
            assert_eq!(section.heading, "Material Specifications");
            assert_eq!(section.level, 2);
            assert!(section.content.starts_with("Body on page"));
        }
        // content, page numbers and type survive
        assert_eq!(sections[3].page_number, 3);
        assert_eq!(sections[3].section_type, SectionType::Paragraph);
    }
}
