//! Report Pipeline - Single Entry Point
//!
//! CRITICAL: generate MUST call validate internally. No bypass.
//!
//! One `generate` call owns one artifact scope. Whatever happens after the
//! scope is opened, the scope is released before `generate` returns.

use image::{GenericImageView, ImageFormat};
use serde::Serialize;
use std::fs;
use std::io::Cursor;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::artifacts::ArtifactScope;
use crate::config::ReportConfig;
use crate::context::{
    output_file_name, today_in, Clock, FieldValue, InlineImage, PatientFields, ReportContext,
    SystemClock, TextFields, IMAGES,
};
use crate::diagnosis::{ConclusionRecord, DiagnosisCode, DiagnosisTable};
use crate::error::ReportError;
use crate::hashing::{compute_request_fingerprint, image_fingerprint, sha256_hex};
use crate::render::{render, DOCX_MEDIA_TYPE};
use crate::roi::{RasterImage, RoiExtractor};
use crate::template::{acquire, HttpFetcher, TemplateFetcher, TemplateLocator};
use crate::validation::{ValidationResult, Validator, REQUIRED_IMAGES};
use crate::ENGINE_VERSION;

/// Everything needed for one report.
#[derive(Clone)]
pub struct ReportRequest {
    pub patient: PatientFields,
    pub diagnosis: DiagnosisCode,
    pub captions: Vec<String>,
    /// Uncropped photos. Only the first three are used.
    pub images: Vec<RasterImage>,
    pub template: TemplateLocator,
}

/// Finished document handed back to the caller. Nothing on disk backs it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderedDocument {
    pub file_name: String,
    pub media_type: String,
    pub sha256: String,
    pub request_fingerprint: String,
    #[serde(skip)]
    pub bytes: Vec<u8>,
}

#[derive(Serialize)]
struct FingerprintPayload<'a> {
    patient_name: &'a str,
    collection_date: String,
    diagnosis: &'a str,
    captions: &'a [String],
    images: Vec<String>,
    template: &'a TemplateLocator,
}

/// The report pipeline - single entry point for report generation
pub struct ReportPipeline {
    config: ReportConfig,
    diagnoses: Arc<DiagnosisTable>,
    extractor: RoiExtractor,
    validator: Validator,
    fetcher: Box<dyn TemplateFetcher>,
    clock: Box<dyn Clock>,
}

impl ReportPipeline {
    /// Pipeline with the real HTTP fetcher and system clock.
    pub fn new(config: ReportConfig, diagnoses: Arc<DiagnosisTable>) -> Result<Self, ReportError> {
        config.check()?;
        let fetcher = HttpFetcher::new(config.fetch_timeout_secs, config.use_system_proxy)?;
        Ok(Self {
            extractor: RoiExtractor::with_policy(config.crop_policy),
            config,
            diagnoses,
            validator: Validator::new(),
            fetcher: Box::new(fetcher),
            clock: Box::new(SystemClock),
        })
    }

    pub fn with_fetcher(mut self, fetcher: Box<dyn TemplateFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Validate a request
    ///
    /// This is the ONLY validation entry point.
    pub fn validate_request(&self, request: &ReportRequest) -> ValidationResult {
        self.validator.validate(request)
    }

    /// Crop each image to its region of interest, one scoped thread per image.
    ///
    /// Output order matches input order.
    pub fn crop_images(&self, images: &[RasterImage]) -> Vec<RasterImage> {
        let extractor = &self.extractor;
        std::thread::scope(|s| {
            let handles: Vec<_> = images
                .iter()
                .map(|img| s.spawn(move || extractor.extract(img)))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
                .collect()
        })
    }

    /// Generate a report
    ///
    /// CRITICAL: This ALWAYS calls validate_request internally. No bypass possible.
    pub fn generate(&self, request: &ReportRequest) -> Result<RenderedDocument, ReportError> {
        // MANDATORY: Validation is always called. This is non-negotiable.
        let validation = self.validate_request(request);
        for w in validation.warnings() {
            warn!(rule = %w.rule, "{}", w.message);
        }
        if !validation.valid {
            return Err(ReportError::InsufficientInput(validation.error_summary()));
        }

        let record = self.diagnoses.resolve(&request.diagnosis)?;
        let fingerprint = self.fingerprint(request)?;
        let file_name = output_file_name(
            &self.config.file_prefix,
            &request.patient.name,
            &self.config.name_separator,
        );

        let crops = self.crop_images(&request.images[..REQUIRED_IMAGES]);
        debug!(count = crops.len(), "Images cropped");

        let mut scope = ArtifactScope::open(&self.config.work_dir)
            .map_err(|e| ReportError::PersistFailed(format!("artifact directory: {e}")))?;
        info!(
            operation = %scope.operation_id(),
            fingerprint = %fingerprint,
            diagnosis = %request.diagnosis,
            "Report generation started"
        );

        let result = self.assemble(&mut scope, request, &record, &crops, &file_name);
        let released = scope.release();
        debug!(operation = %scope.operation_id(), released, "Artifacts released");

        let bytes = result?;
        let document = RenderedDocument {
            sha256: sha256_hex(&bytes),
            file_name,
            media_type: DOCX_MEDIA_TYPE.to_string(),
            request_fingerprint: fingerprint,
            bytes,
        };
        info!(
            file = %document.file_name,
            size = document.bytes.len(),
            sha256 = %document.sha256,
            "Report rendered"
        );
        Ok(document)
    }

    /// Everything that creates artifacts. The caller releases `scope`.
    fn assemble(
        &self,
        scope: &mut ArtifactScope,
        request: &ReportRequest,
        record: &ConclusionRecord,
        crops: &[RasterImage],
        file_name: &str,
    ) -> Result<Vec<u8>, ReportError> {
        let template = acquire(
            &request.template,
            &self.config.export_url_pattern,
            self.fetcher.as_ref(),
            scope,
        )?;

        let mut ctx = ReportContext::new();
        TextFields {
            patient: &request.patient,
            diagnosis: &request.diagnosis,
            record,
            captions: &request.captions,
            today: today_in(self.clock.as_ref(), self.config.report_zone()),
            date_format: &self.config.date_format,
        }
        .apply(&mut ctx);

        for (i, (key, crop)) in IMAGES.iter().zip(crops).enumerate() {
            let png = encode_png(crop)
                .map_err(|e| ReportError::PersistFailed(format!("image {}: {e}", i + 1)))?;
            let path = scope
                .write(key, "png", &png)
                .map_err(|e| ReportError::PersistFailed(format!("image {}: {e}", i + 1)))?;
            ctx.set(
                key,
                FieldValue::Image(InlineImage {
                    path,
                    width_mm: self.config.image_width_mm,
                }),
            );
        }

        let rendered = render(template.path(), &ctx)?;

        // Round-trip through the scope so the hand-off is exactly what was persisted.
        let output = scope.reserve_named(file_name);
        fs::write(&output, &rendered)
            .map_err(|e| ReportError::PersistFailed(format!("{}: {e}", output.display())))?;
        fs::read(&output).map_err(|e| ReportError::PersistFailed(format!("{}: {e}", output.display())))
    }

    fn fingerprint(&self, request: &ReportRequest) -> Result<String, ReportError> {
        let payload = FingerprintPayload {
            patient_name: request.patient.name.trim(),
            collection_date: request.patient.collection_date.to_string(),
            diagnosis: &request.diagnosis,
            captions: &request.captions,
            images: request
                .images
                .iter()
                .take(REQUIRED_IMAGES)
                .map(|img| {
                    let (w, h) = img.dimensions();
                    image_fingerprint(w, h, &format!("{:?}", img.color()), img.as_bytes())
                })
                .collect(),
            template: &request.template,
        };
        compute_request_fingerprint(&payload, &self.diagnoses.version.to_string(), ENGINE_VERSION)
            .map_err(|e| ReportError::Config(format!("request fingerprint: {e}")))
    }
}

fn encode_png(image: &RasterImage) -> image::ImageResult<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    image.write_to(&mut buf, ImageFormat::Png)?;
    Ok(buf.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Utc};
    use image::{DynamicImage, Rgb, RgbImage};
    use std::sync::Mutex;

    use crate::context::FixedClock;

    struct StaticFetcher(Mutex<u32>);

    impl TemplateFetcher for StaticFetcher {
        fn fetch(&self, _url: &str) -> Result<Vec<u8>, ReportError> {
            *self.0.lock().unwrap() += 1;
            Err(ReportError::TemplateFetchFailed("offline".into()))
        }
    }

    fn pipeline(work_dir: &std::path::Path) -> ReportPipeline {
        let config = ReportConfig {
            work_dir: work_dir.to_path_buf(),
            ..ReportConfig::default()
        };
        ReportPipeline::new(config, Arc::new(DiagnosisTable::builtin().unwrap()))
            .unwrap()
            .with_fetcher(Box::new(StaticFetcher(Mutex::new(0))))
            .with_clock(Box::new(FixedClock(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap())))
    }

    fn request(images: usize) -> ReportRequest {
        ReportRequest {
            patient: PatientFields {
                name: "Maria Silva".into(),
                collection_date: NaiveDate::from_ymd_opt(2024, 2, 28).unwrap(),
            },
            diagnosis: "Candidíase".into(),
            captions: vec![],
            images: (0..images)
                .map(|_| DynamicImage::ImageRgb8(RgbImage::from_pixel(60, 40, Rgb([120, 80, 90]))))
                .collect(),
            template: TemplateLocator::DocumentId("abc".into()),
        }
    }

    #[test]
    fn too_few_images_rejected_before_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let err = pipeline(dir.path()).generate(&request(2)).err().unwrap();
        assert!(matches!(err, ReportError::InsufficientInput(_)));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn unknown_diagnosis_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut req = request(3);
        req.diagnosis = "Inexistente".into();
        let err = pipeline(dir.path()).generate(&req).err().unwrap();
        assert!(matches!(err, ReportError::UnknownDiagnosisCode(_)));
    }

    #[test]
    fn fetch_failure_releases_scope() {
        let dir = tempfile::tempdir().unwrap();
        let err = pipeline(dir.path()).generate(&request(3)).err().unwrap();
        assert!(matches!(err, ReportError::TemplateFetchFailed(_)));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn crops_keep_input_order() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(dir.path());
        let images = vec![
            DynamicImage::ImageRgb8(RgbImage::new(30, 20)),
            DynamicImage::ImageRgb8(RgbImage::new(50, 70)),
            DynamicImage::ImageRgb8(RgbImage::new(10, 10)),
        ];
        let sides: Vec<_> = p.crop_images(&images).iter().map(|c| c.dimensions()).collect();
        assert_eq!(sides, vec![(20, 20), (50, 50), (10, 10)]);
    }

    #[test]
    fn fingerprint_ignores_extra_images() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(dir.path());
        let mut four = request(4);
        four.images[3] = DynamicImage::ImageRgb8(RgbImage::new(5, 5));
        assert_eq!(p.fingerprint(&request(3)).unwrap(), p.fingerprint(&four).unwrap());
    }

    #[test]
    fn invalid_config_rejected() {
        let config = ReportConfig {
            export_url_pattern: "https://no-placeholder".into(),
            ..ReportConfig::default()
        };
        let err = ReportPipeline::new(config, Arc::new(DiagnosisTable::builtin().unwrap()))
            .err()
            .unwrap();
        assert!(matches!(err, ReportError::Config(_)));
    }
}
