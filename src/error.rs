//! Report Errors - One Kind Per Abort Path
//!
//! Every variant aborts the whole report operation. Nothing is retried.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("Insufficient input: {0}")]
    InsufficientInput(String),

    #[error("Invalid image {index}: {reason}")]
    InvalidImage { index: usize, reason: String },

    #[error("Unknown diagnosis code: {0}")]
    UnknownDiagnosisCode(String),

    #[error("Template fetch failed: {0}")]
    TemplateFetchFailed(String),

    #[error("Template fetch exceeded {0}s deadline")]
    TemplateFetchTimedOut(u64),

    #[error("Render failed: {0}")]
    RenderFailed(String),

    #[error("Persist failed: {0}")]
    PersistFailed(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ReportError {
    /// Stable machine-readable kind, used by the CLI JSON output.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InsufficientInput(_) => "insufficient_input",
            Self::InvalidImage { .. } => "invalid_image",
            Self::UnknownDiagnosisCode(_) => "unknown_diagnosis_code",
            Self::TemplateFetchFailed(_) => "template_fetch_failed",
            Self::TemplateFetchTimedOut(_) => "template_fetch_timed_out",
            Self::RenderFailed(_) => "render_failed",
            Self::PersistFailed(_) => "persist_failed",
            Self::Config(_) => "config",
        }
    }
}
