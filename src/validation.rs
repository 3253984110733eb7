//! Request Validation - Rule/Policy Separation
//!
//! Rules produce structured violations.
//! Errors block report generation; warnings are recorded and logged.

use image::GenericImageView;
use serde::{Deserialize, Serialize};

use crate::context::{normalize_name, CAPTIONS, IMAGES};
use crate::pipeline::ReportRequest;

pub const REQUIRED_IMAGES: usize = IMAGES.len();

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    Error,
    Warning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationViolation {
    pub rule: String,
    pub severity: ViolationSeverity,
    pub message: String,
    pub expected: Option<String>,
    pub actual: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub violations: Vec<ValidationViolation>,
}

impl ValidationResult {
    pub fn from_violations(violations: Vec<ValidationViolation>) -> Self {
        let valid = !violations.iter().any(|v| v.severity == ViolationSeverity::Error);
        Self { valid, violations }
    }

    pub fn errors(&self) -> impl Iterator<Item = &ValidationViolation> {
        self.violations.iter().filter(|v| v.severity == ViolationSeverity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ValidationViolation> {
        self.violations.iter().filter(|v| v.severity == ViolationSeverity::Warning)
    }

    /// One line per blocking violation.
    pub fn error_summary(&self) -> String {
        self.errors()
            .map(|v| format!("{}: {}", v.rule, v.message))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Validation rule trait - produces violations
pub trait ValidationRule {
    fn name(&self) -> &'static str;
    fn validate(&self, request: &ReportRequest) -> Vec<ValidationViolation>;
}

// --- Concrete Rules ---

pub struct ImageCountRule;

impl ValidationRule for ImageCountRule {
    fn name(&self) -> &'static str { "image_count" }

    fn validate(&self, request: &ReportRequest) -> Vec<ValidationViolation> {
        let count = request.images.len();
        if count < REQUIRED_IMAGES {
            vec![ValidationViolation {
                rule: self.name().to_string(),
                severity: ViolationSeverity::Error,
                message: format!("{REQUIRED_IMAGES} images are required"),
                expected: Some(REQUIRED_IMAGES.to_string()),
                actual: Some(count.to_string()),
            }]
        } else if count > REQUIRED_IMAGES {
            vec![ValidationViolation {
                rule: self.name().to_string(),
                severity: ViolationSeverity::Warning,
                message: format!("only the first {REQUIRED_IMAGES} images are used"),
                expected: Some(REQUIRED_IMAGES.to_string()),
                actual: Some(count.to_string()),
            }]
        } else {
            vec![]
        }
    }
}

pub struct RequiredFieldsRule;

impl ValidationRule for RequiredFieldsRule {
    fn name(&self) -> &'static str { "required_fields" }

    fn validate(&self, request: &ReportRequest) -> Vec<ValidationViolation> {
        let mut violations = vec![];

        if normalize_name(&request.patient.name, "_").is_empty() {
            violations.push(ValidationViolation {
                rule: self.name().to_string(),
                severity: ViolationSeverity::Error,
                message: "patient name is required".to_string(),
                expected: None,
                actual: Some(format!("{:?}", request.patient.name)),
            });
        }

        if request.diagnosis.trim().is_empty() {
            violations.push(ValidationViolation {
                rule: self.name().to_string(),
                severity: ViolationSeverity::Error,
                message: "diagnosis is required".to_string(),
                expected: None,
                actual: None,
            });
        }

        if request.captions.len() > CAPTIONS.len() {
            violations.push(ValidationViolation {
                rule: self.name().to_string(),
                severity: ViolationSeverity::Warning,
                message: format!("only the first {} captions are used", CAPTIONS.len()),
                expected: Some(CAPTIONS.len().to_string()),
                actual: Some(request.captions.len().to_string()),
            });
        }

        violations
    }
}

pub struct ImageDimensionsRule;

impl ValidationRule for ImageDimensionsRule {
    fn name(&self) -> &'static str { "image_dimensions" }

    fn validate(&self, request: &ReportRequest) -> Vec<ValidationViolation> {
        request
            .images
            .iter()
            .take(REQUIRED_IMAGES)
            .enumerate()
            .filter_map(|(i, img)| {
                let (w, h) = img.dimensions();
                (w == 0 || h == 0).then(|| ValidationViolation {
                    rule: self.name().to_string(),
                    severity: ViolationSeverity::Error,
                    message: format!("image {} is empty", i + 1),
                    expected: Some("positive width and height".to_string()),
                    actual: Some(format!("{w}x{h}")),
                })
            })
            .collect()
    }
}

/// Validator runs every rule and collects violations
pub struct Validator {
    rules: Vec<Box<dyn ValidationRule + Send + Sync>>,
}

impl Validator {
    pub fn new() -> Self {
        Self {
            rules: vec![
                Box::new(ImageCountRule),
                Box::new(RequiredFieldsRule),
                Box::new(ImageDimensionsRule),
            ],
        }
    }

    pub fn validate(&self, request: &ReportRequest) -> ValidationResult {
        let violations = self
            .rules
            .iter()
            .flat_map(|rule| rule.validate(request))
            .collect();
        ValidationResult::from_violations(violations)
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}
