//! Runtime Configuration
//!
//! Every field has a default so an empty `{}` document is a valid config.

use chrono::format::{Item, StrftimeItems};
use chrono::{FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ReportError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportConfig {
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default = "default_image_width_mm")]
    pub image_width_mm: f64,
    #[serde(default = "default_utc_offset_hours")]
    pub utc_offset_hours: i32,
    #[serde(default = "default_date_format")]
    pub date_format: String,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub use_system_proxy: bool,
    #[serde(default = "default_export_url_pattern")]
    pub export_url_pattern: String,
    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,
    #[serde(default = "default_name_separator")]
    pub name_separator: String,
    #[serde(default)]
    pub crop_policy: CropPolicy,
    #[serde(default = "default_preview_max_side")]
    pub preview_max_side: u32,
}

/// What to do when a detected circle's bounding box is clamped at an image edge.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CropPolicy {
    /// Keep the clamped box as-is; it may be non-square.
    #[default]
    Clamp,
    /// Shrink the clamped box to a square centered on the circle.
    Square,
}

fn default_work_dir() -> PathBuf { std::env::temp_dir() }
fn default_image_width_mm() -> f64 { 101.6 }
fn default_utc_offset_hours() -> i32 { -3 }
fn default_date_format() -> String { "%d/%m/%Y".to_string() }
fn default_fetch_timeout_secs() -> u64 { 30 }
fn default_true() -> bool { true }
fn default_export_url_pattern() -> String {
    "https://docs.google.com/feeds/download/documents/Export?id={id}&exportFormat=docx".to_string()
}
fn default_file_prefix() -> String { "Laudo".to_string() }
fn default_name_separator() -> String { "_".to_string() }
fn default_preview_max_side() -> u32 { 800 }

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            image_width_mm: default_image_width_mm(),
            utc_offset_hours: default_utc_offset_hours(),
            date_format: default_date_format(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            use_system_proxy: true,
            export_url_pattern: default_export_url_pattern(),
            file_prefix: default_file_prefix(),
            name_separator: default_name_separator(),
            crop_policy: CropPolicy::default(),
            preview_max_side: default_preview_max_side(),
        }
    }
}

impl ReportConfig {
    pub fn load(path: &Path) -> Result<Self, ReportError> {
        let content = fs::read_to_string(path)
            .map_err(|e| ReportError::Config(format!("{}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| ReportError::Config(format!("{}: {e}", path.display())))?;
        config.check()?;
        Ok(config)
    }

    /// Reject values that would only fail later, mid-operation.
    pub fn check(&self) -> Result<(), ReportError> {
        if !(self.image_width_mm > 0.0) {
            return Err(ReportError::Config("imageWidthMm must be positive".into()));
        }
        if self.utc_offset_hours.abs() > 14 {
            return Err(ReportError::Config(format!(
                "utcOffsetHours out of range: {}",
                self.utc_offset_hours
            )));
        }
        if !self.export_url_pattern.contains("{id}") {
            return Err(ReportError::Config("exportUrlPattern must contain {id}".into()));
        }
        if StrftimeItems::new(&self.date_format).any(|item| matches!(item, Item::Error)) {
            return Err(ReportError::Config(format!("invalid dateFormat: {}", self.date_format)));
        }
        if self.preview_max_side == 0 {
            return Err(ReportError::Config("previewMaxSide must be positive".into()));
        }
        Ok(())
    }

    /// Fixed zone used for the render-time "today" date.
    pub fn report_zone(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_hours * 3600).unwrap_or(Utc.fix())
    }
}
