//! Report Context - Field Mapping Fed Into The Template
//!
//! Keys here are the template placeholder contract. A template must expose
//! every one of them.

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use std::path::PathBuf;

use crate::diagnosis::ConclusionRecord;
use crate::error::ReportError;

pub const PATIENT_NAME: &str = "patient_name";
pub const COLLECTION_DATE: &str = "collection_date";
pub const TODAY: &str = "today";
pub const DIAGNOSIS: &str = "diagnosis";
pub const CONCLUSION: &str = "conclusion";
pub const AUTHOR_CITATION: &str = "author_citation";
pub const FULL_REFERENCE: &str = "full_reference";
pub const CAPTIONS: [&str; 3] = ["caption_1", "caption_2", "caption_3"];
pub const IMAGES: [&str; 3] = ["image_1", "image_2", "image_3"];

pub const TEXT_FIELDS: [&str; 10] = [
    PATIENT_NAME,
    COLLECTION_DATE,
    TODAY,
    DIAGNOSIS,
    CONCLUSION,
    AUTHOR_CITATION,
    FULL_REFERENCE,
    CAPTIONS[0],
    CAPTIONS[1],
    CAPTIONS[2],
];

/// An image embedded by reference to an on-disk file.
#[derive(Debug, Clone, PartialEq)]
pub struct InlineImage {
    pub path: PathBuf,
    pub width_mm: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Image(InlineImage),
}

/// Ordered field-name to value mapping.
#[derive(Debug, Clone, Default)]
pub struct ReportContext {
    fields: Vec<(String, FieldValue)>,
}

impl ReportContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace, keeping the original position on replace.
    pub fn set(&mut self, key: &str, value: FieldValue) {
        match self.fields.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value,
            None => self.fields.push((key.to_string(), value)),
        }
    }

    pub fn set_text(&mut self, key: &str, value: impl Into<String>) {
        self.set(key, FieldValue::Text(value.into()));
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Every text field and all three image slots must be present.
    pub fn check_complete(&self) -> Result<(), ReportError> {
        let missing: Vec<&str> = TEXT_FIELDS
            .iter()
            .filter(|k| !matches!(self.get(k), Some(FieldValue::Text(_))))
            .chain(IMAGES.iter().filter(|k| !matches!(self.get(k), Some(FieldValue::Image(_)))))
            .copied()
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ReportError::InsufficientInput(format!(
                "missing report fields: {}",
                missing.join(", ")
            )))
        }
    }
}

/// Source of "now". Injected so render-time dates are testable.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Calendar date in `zone`, regardless of the host's local zone.
pub fn today_in(clock: &dyn Clock, zone: FixedOffset) -> NaiveDate {
    clock.now().with_timezone(&zone).date_naive()
}

pub fn format_date(date: NaiveDate, format: &str) -> String {
    date.format(format).to_string()
}

/// Patient-derived inputs for one report.
#[derive(Debug, Clone)]
pub struct PatientFields {
    pub name: String,
    pub collection_date: NaiveDate,
}

/// Text fields gathered before images are materialized.
pub struct TextFields<'a> {
    pub patient: &'a PatientFields,
    pub diagnosis: &'a str,
    pub record: &'a ConclusionRecord,
    pub captions: &'a [String],
    pub today: NaiveDate,
    pub date_format: &'a str,
}

impl TextFields<'_> {
    pub fn apply(&self, ctx: &mut ReportContext) {
        ctx.set_text(PATIENT_NAME, self.patient.name.trim());
        ctx.set_text(COLLECTION_DATE, format_date(self.patient.collection_date, self.date_format));
        ctx.set_text(TODAY, format_date(self.today, self.date_format));
        ctx.set_text(DIAGNOSIS, self.diagnosis);
        ctx.set_text(CONCLUSION, self.record.conclusion_text.as_str());
        ctx.set_text(AUTHOR_CITATION, self.record.author_citation.clone().unwrap_or_default());
        ctx.set_text(FULL_REFERENCE, self.record.full_reference.clone().unwrap_or_default());
        for (i, key) in CAPTIONS.iter().enumerate() {
            ctx.set_text(key, self.captions.get(i).map(|c| c.trim()).unwrap_or(""));
        }
    }
}

/// Trim, collapse internal whitespace into `separator`, drop path-hostile characters.
pub fn normalize_name(name: &str, separator: &str) -> String {
    name.split_whitespace()
        .map(|part| {
            part.chars()
                .filter(|c| !matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|'))
                .collect::<String>()
        })
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(separator)
}

/// Deterministic output name: same patient name, same file name.
pub fn output_file_name(prefix: &str, name: &str, separator: &str) -> String {
    let stem = normalize_name(name, separator);
    if prefix.is_empty() {
        format!("{stem}.docx")
    } else {
        format!("{prefix}{separator}{stem}.docx")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn name_normalization() {
        assert_eq!(normalize_name("  Maria   Silva ", "_"), "Maria_Silva");
        assert_eq!(normalize_name("Ana\tde  Souza", "-"), "Ana-de-Souza");
        assert_eq!(normalize_name("a/b  c", "_"), "ab_c");
    }

    #[test]
    fn file_name_is_deterministic() {
        let a = output_file_name("Laudo", "Maria Silva", "_");
        let b = output_file_name("Laudo", " Maria  Silva", "_");
        assert_eq!(a, "Laudo_Maria_Silva.docx");
        assert_eq!(a, b);
        assert_eq!(output_file_name("", "Maria Silva", "_"), "Maria_Silva.docx");
    }

    #[test]
    fn today_uses_fixed_zone() {
        // 01:30 UTC on the 2nd is still the 1st at UTC-3.
        let clock = FixedClock(Utc.with_ymd_and_hms(2024, 3, 2, 1, 30, 0).unwrap());
        let zone = FixedOffset::west_opt(3 * 3600).unwrap();
        assert_eq!(today_in(&clock, zone), NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
    }

    #[test]
    fn date_format_day_month_year() {
        let d = NaiveDate::from_ymd_opt(2024, 5, 7).unwrap();
        assert_eq!(format_date(d, "%d/%m/%Y"), "07/05/2024");
    }

    #[test]
    fn set_replaces_in_place() {
        let mut ctx = ReportContext::new();
        ctx.set_text("a", "1");
        ctx.set_text("b", "2");
        ctx.set_text("a", "3");
        let keys: Vec<_> = ctx.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(ctx.get("a"), Some(&FieldValue::Text("3".into())));
    }

    #[test]
    fn incomplete_context_lists_missing_fields() {
        let mut ctx = ReportContext::new();
        ctx.set_text(PATIENT_NAME, "Maria");
        let err = ctx.check_complete().unwrap_err().to_string();
        assert!(err.contains("image_1"));
        assert!(err.contains("conclusion"));
        assert!(!err.contains("patient_name"));
    }

    #[test]
    fn text_fields_fill_everything_but_images() {
        let patient = PatientFields {
            name: " Maria Silva ".into(),
            collection_date: NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
        };
        let record = ConclusionRecord {
            conclusion_text: "texto".into(),
            author_citation: None,
            full_reference: Some("ref".into()),
        };
        let captions = vec!["um".to_string()];
        let mut ctx = ReportContext::new();
        TextFields {
            patient: &patient,
            diagnosis: "Candidíase",
            record: &record,
            captions: &captions,
            today: NaiveDate::from_ymd_opt(2024, 1, 20).unwrap(),
            date_format: "%d/%m/%Y",
        }
        .apply(&mut ctx);

        assert_eq!(ctx.len(), TEXT_FIELDS.len());
        assert_eq!(ctx.get(PATIENT_NAME), Some(&FieldValue::Text("Maria Silva".into())));
        assert_eq!(ctx.get(COLLECTION_DATE), Some(&FieldValue::Text("15/01/2024".into())));
        assert_eq!(ctx.get(AUTHOR_CITATION), Some(&FieldValue::Text(String::new())));
        assert_eq!(ctx.get(CAPTIONS[2]), Some(&FieldValue::Text(String::new())));
    }
}
