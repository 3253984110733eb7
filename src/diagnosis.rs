//! Diagnosis Table - Versioned Conclusion Content
//!
//! Two independent lookups:
//! 1. Exact label match gives the conclusion text. Unknown labels fail.
//! 2. Citation rules classify the label by prefix/equality, first match wins,
//!    with a default branch. This never fails and does not consult step 1.

use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

use crate::error::ReportError;

pub type DiagnosisCode = String;

const BUILTIN_TABLE: &str = include_str!("../data/diagnoses.json");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosisTable {
    pub version: Version,
    pub entries: Vec<DiagnosisEntry>,
    #[serde(default)]
    pub citations: CitationRules,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosisEntry {
    pub label: DiagnosisCode,
    pub conclusion: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CitationRules {
    #[serde(default)]
    pub rules: Vec<CitationRule>,
    #[serde(default)]
    pub default: Citation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CitationRule {
    #[serde(rename = "match")]
    pub matcher: LabelMatch,
    #[serde(flatten)]
    pub citation: Citation,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LabelMatch {
    Prefix(String),
    Equals(String),
}

impl LabelMatch {
    pub fn matches(&self, label: &str) -> bool {
        match self {
            Self::Prefix(p) => label.starts_with(p.as_str()),
            Self::Equals(e) => label == e,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Citation {
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub reference: Option<String>,
}

/// Resolved clinical text for one diagnosis.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConclusionRecord {
    pub conclusion_text: String,
    pub author_citation: Option<String>,
    pub full_reference: Option<String>,
}

impl DiagnosisTable {
    /// The table shipped with the crate.
    pub fn builtin() -> Result<Self, ReportError> {
        Self::from_json(BUILTIN_TABLE)
    }

    pub fn load(path: &Path) -> Result<Self, ReportError> {
        let content = fs::read_to_string(path)
            .map_err(|e| ReportError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, ReportError> {
        let table: Self = serde_json::from_str(content)
            .map_err(|e| ReportError::Config(format!("diagnosis table: {e}")))?;
        table.check()?;
        Ok(table)
    }

    /// Every declared code must resolve to non-empty text, exactly once.
    fn check(&self) -> Result<(), ReportError> {
        let mut seen = HashSet::new();
        for entry in &self.entries {
            if entry.conclusion.trim().is_empty() {
                return Err(ReportError::Config(format!(
                    "diagnosis '{}' has empty conclusion text",
                    entry.label
                )));
            }
            if !seen.insert(entry.label.as_str()) {
                return Err(ReportError::Config(format!(
                    "diagnosis '{}' declared twice",
                    entry.label
                )));
            }
        }
        Ok(())
    }

    /// Codes in declaration order.
    pub fn codes(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.label.as_str())
    }

    pub fn conclusion(&self, code: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.label == code)
            .map(|e| e.conclusion.as_str())
    }

    /// Citation for any label; falls through to the default.
    pub fn classify_citation(&self, label: &str) -> &Citation {
        self.citations
            .rules
            .iter()
            .find(|r| r.matcher.matches(label))
            .map(|r| &r.citation)
            .unwrap_or(&self.citations.default)
    }

    pub fn resolve(&self, code: &str) -> Result<ConclusionRecord, ReportError> {
        let conclusion = self
            .conclusion(code)
            .ok_or_else(|| ReportError::UnknownDiagnosisCode(code.to_string()))?;
        let citation = self.classify_citation(code);
        Ok(ConclusionRecord {
            conclusion_text: conclusion.to_string(),
            author_citation: citation.author.clone(),
            full_reference: citation.reference.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_table_loads() {
        let table = DiagnosisTable::builtin().unwrap();
        assert_eq!(table.version, Version::new(1, 0, 0));
        assert_eq!(table.codes().count(), 4);
    }

    #[test]
    fn every_declared_code_resolves() {
        let table = DiagnosisTable::builtin().unwrap();
        for code in table.codes() {
            let record = table.resolve(code).unwrap();
            assert!(!record.conclusion_text.is_empty(), "{code}");
        }
    }

    #[test]
    fn unknown_code_fails() {
        let table = DiagnosisTable::builtin().unwrap();
        let err = table.resolve("Tricomoníase").unwrap_err();
        assert!(matches!(err, ReportError::UnknownDiagnosisCode(ref c) if c == "Tricomoníase"));
    }

    #[test]
    fn citation_prefix_equality_and_default() {
        let table = DiagnosisTable::builtin().unwrap();
        let vag = table.classify_citation("Vaginose Bacteriana");
        assert_eq!(vag, table.classify_citation("Vaginose Citolítica"));
        assert!(vag.author.as_deref().unwrap().starts_with("Nugent"));

        let cand = table.classify_citation("Candidíase");
        assert!(cand.author.as_deref().unwrap().starts_with("Sobel"));

        let other = table.classify_citation("Vaginite Aeróbia");
        assert_eq!(other, &table.citations.default);
    }

    #[test]
    fn citation_classification_is_independent_of_table() {
        let table = DiagnosisTable::builtin().unwrap();
        // Not a declared code, still classified.
        let c = table.classify_citation("Vaginose Mista");
        assert!(c.author.as_deref().unwrap().starts_with("Nugent"));
    }

    #[test]
    fn duplicate_label_rejected() {
        let json = r#"{
            "version": "1.0.0",
            "entries": [
                {"label": "A", "conclusion": "x"},
                {"label": "A", "conclusion": "y"}
            ]
        }"#;
        assert!(matches!(DiagnosisTable::from_json(json), Err(ReportError::Config(_))));
    }

    #[test]
    fn empty_conclusion_rejected() {
        let json = r#"{"version": "1.0.0", "entries": [{"label": "A", "conclusion": "  "}]}"#;
        assert!(matches!(DiagnosisTable::from_json(json), Err(ReportError::Config(_))));
    }

    #[test]
    fn missing_citations_resolve_to_none() {
        let json = r#"{"version": "2.1.0", "entries": [{"label": "A", "conclusion": "texto"}]}"#;
        let table = DiagnosisTable::from_json(json).unwrap();
        let record = table.resolve("A").unwrap();
        assert_eq!(record.conclusion_text, "texto");
        assert!(record.author_citation.is_none());
        assert!(record.full_reference.is_none());
    }
}
