//! Laudo Core - Microscopy Report Compiler
//!
//! # Guarantees
//! 1. Extraction Never Fails (center-square fallback)
//! 2. Templates Are Contracts (every placeholder filled, nothing unknown)
//! 3. Validation Is Protective
//! 4. Deterministic Output
//! 5. No Artifact Outlives Its Operation

pub mod artifacts;
pub mod config;
pub mod context;
pub mod diagnosis;
pub mod error;
pub mod hashing;
pub mod hough;
pub mod pipeline;
pub mod render;
pub mod roi;
pub mod template;
pub mod validation;

pub use config::{CropPolicy, ReportConfig};
pub use context::{Clock, FixedClock, PatientFields, ReportContext, SystemClock};
pub use diagnosis::{ConclusionRecord, DiagnosisCode, DiagnosisTable};
pub use error::ReportError;
pub use hashing::{canonical_json, compute_request_fingerprint, sha256_hex};
pub use pipeline::{RenderedDocument, ReportPipeline, ReportRequest};
pub use roi::{extract, RasterImage, RoiExtractor};
pub use template::{HttpFetcher, TemplateFetcher, TemplateHandle, TemplateLocator};
pub use validation::{ValidationResult, ValidationRule, ValidationViolation, ViolationSeverity};

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
