//! Laudo CLI - Report compiler front end
//!
//! Commands: diagnoses, crop, generate
//! Outputs JSON to stdout, logs to stderr
//! Returns non-zero on failure

use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use laudo_core::{
    context::PatientFields,
    roi::{decode_image, resize_to_max_side, CropSource},
    DiagnosisTable, ReportConfig, ReportError, ReportPipeline, ReportRequest, RoiExtractor,
    TemplateLocator,
};

#[derive(Parser)]
#[command(name = "laudo-cli")]
#[command(about = "Laudo CLI - Microscopy Report Compiler")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to a JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to a diagnosis table replacing the built-in one
    #[arg(short, long)]
    diagnoses: Option<PathBuf>,

    /// Parent directory for per-operation artifacts
    #[arg(short, long)]
    work_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// List diagnosis codes with their resolved citations
    Diagnoses,

    /// Crop one photo to its optical field
    Crop {
        #[arg(short, long)]
        input: PathBuf,

        #[arg(short, long)]
        output: PathBuf,

        /// Downsample the crop to the configured preview size
        #[arg(long)]
        resize: bool,
    },

    /// Generate a full report
    Generate {
        /// Patient name
        #[arg(long)]
        name: String,

        /// Collection date, YYYY-MM-DD
        #[arg(long)]
        collection_date: NaiveDate,

        /// Diagnosis code, as listed by `diagnoses`
        #[arg(long)]
        diagnosis: String,

        /// Image caption (repeat up to three times)
        #[arg(long = "caption")]
        captions: Vec<String>,

        /// Photo file (repeat three times)
        #[arg(long = "image", required = true)]
        images: Vec<PathBuf>,

        #[command(flatten)]
        template: TemplateArgs,

        /// Directory receiving the finished document
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
    },
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct TemplateArgs {
    /// Template URL (share links are recognized)
    #[arg(long)]
    template_url: Option<String>,

    /// Document-hosting template id
    #[arg(long)]
    template_id: Option<String>,

    /// Local template file
    #[arg(long)]
    template_path: Option<PathBuf>,
}

impl TemplateArgs {
    fn locator(&self) -> Option<TemplateLocator> {
        if let Some(url) = &self.template_url {
            return Some(TemplateLocator::parse(url));
        }
        if let Some(id) = &self.template_id {
            return Some(TemplateLocator::DocumentId(id.trim().to_string()));
        }
        self.template_path.clone().map(TemplateLocator::Path)
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("laudo_core=info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let (config, table) = match load(&cli) {
        Ok(loaded) => loaded,
        Err(e) => {
            emit(&json!({"success": false, "kind": e.kind(), "error": e.to_string()}));
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Commands::Diagnoses => Ok(list_diagnoses(&table)),
        Commands::Crop { input, output, resize } => crop(&config, &input, &output, resize),
        Commands::Generate {
            name,
            collection_date,
            diagnosis,
            captions,
            images,
            template,
            out_dir,
        } => {
            let Some(locator) = template.locator() else {
                emit(&json!({"success": false, "kind": "insufficient_input", "error": "no template given"}));
                return ExitCode::FAILURE;
            };
            generate(
                config,
                table,
                PatientFields { name, collection_date },
                diagnosis,
                captions,
                &images,
                locator,
                &out_dir,
            )
        }
    };

    match result {
        Ok(output) => {
            emit(&output);
            ExitCode::SUCCESS
        }
        Err(e) => {
            emit(&json!({"success": false, "kind": e.kind(), "error": e.to_string()}));
            ExitCode::from(2)
        }
    }
}

fn load(cli: &Cli) -> Result<(ReportConfig, DiagnosisTable), ReportError> {
    let mut config = match &cli.config {
        Some(path) => ReportConfig::load(path)?,
        None => ReportConfig::default(),
    };
    if let Some(dir) = &cli.work_dir {
        config.work_dir = dir.clone();
    }
    let table = match &cli.diagnoses {
        Some(path) => DiagnosisTable::load(path)?,
        None => DiagnosisTable::builtin()?,
    };
    Ok((config, table))
}

fn list_diagnoses(table: &DiagnosisTable) -> Value {
    let entries: Vec<_> = table
        .entries
        .iter()
        .map(|e| {
            let citation = table.classify_citation(&e.label);
            json!({
                "label": e.label,
                "conclusion": e.conclusion,
                "authorCitation": citation.author,
                "fullReference": citation.reference,
            })
        })
        .collect();
    json!({"version": table.version.to_string(), "diagnoses": entries})
}

fn crop(config: &ReportConfig, input: &Path, output: &Path, resize: bool) -> Result<Value, ReportError> {
    let bytes = fs::read(input)
        .map_err(|e| ReportError::InvalidImage { index: 1, reason: format!("{}: {e}", input.display()) })?;
    let image = decode_image(1, &bytes)?;
    if image.width() == 0 || image.height() == 0 {
        return Err(ReportError::InsufficientInput(format!("{} is empty", input.display())));
    }

    let extractor = RoiExtractor::with_policy(config.crop_policy);
    let (crop, source) = extractor.locate(&image);
    let mut cropped = image.crop_imm(crop.x, crop.y, crop.width, crop.height);
    if resize {
        cropped = resize_to_max_side(&cropped, config.preview_max_side);
    }
    cropped
        .save(output)
        .map_err(|e| ReportError::PersistFailed(format!("{}: {e}", output.display())))?;

    let source = match source {
        CropSource::Circle(c) => json!({"kind": "circle", "x": c.x, "y": c.y, "radius": c.radius}),
        CropSource::CenterFallback => json!({"kind": "center_fallback"}),
    };
    Ok(json!({
        "success": true,
        "source": source,
        "crop": {"x": crop.x, "y": crop.y, "width": crop.width, "height": crop.height},
        "output": output.display().to_string(),
        "size": [cropped.width(), cropped.height()],
    }))
}

#[allow(clippy::too_many_arguments)]
fn generate(
    config: ReportConfig,
    table: DiagnosisTable,
    patient: PatientFields,
    diagnosis: String,
    captions: Vec<String>,
    image_paths: &[PathBuf],
    template: TemplateLocator,
    out_dir: &Path,
) -> Result<Value, ReportError> {
    let images = image_paths
        .iter()
        .enumerate()
        .map(|(i, path)| {
            let bytes = fs::read(path).map_err(|e| ReportError::InvalidImage {
                index: i + 1,
                reason: format!("{}: {e}", path.display()),
            })?;
            decode_image(i + 1, &bytes)
        })
        .collect::<Result<Vec<_>, _>>()?;

    let pipeline = ReportPipeline::new(config, Arc::new(table))?;
    let document = pipeline.generate(&ReportRequest {
        patient,
        diagnosis,
        captions,
        images,
        template,
    })?;

    fs::create_dir_all(out_dir)
        .map_err(|e| ReportError::PersistFailed(format!("{}: {e}", out_dir.display())))?;
    let path = out_dir.join(&document.file_name);
    fs::write(&path, &document.bytes)
        .map_err(|e| ReportError::PersistFailed(format!("{}: {e}", path.display())))?;

    Ok(json!({
        "success": true,
        "document": document,
        "path": path.display().to_string(),
        "size": document.bytes.len(),
    }))
}

fn emit(value: &Value) {
    println!("{}", serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string()));
}
