//! ProductLens - product image analysis command line
//!
//! Every command prints its result as pretty JSON on stdout. Logs go to
//! stderr and follow `RUST_LOG` (default `info`).

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

use product_lens::analysis::{AnalysisRequest, Service};
use product_lens::config::{self, AppConfig};
use product_lens::vision::decode_image;
use product_lens::{DetectionThresholds, ProductLens};

/// ProductLens - product image analysis with hybrid brand detection
#[derive(Parser, Debug)]
#[command(name = "product-lens")]
#[command(about = "Brand detection, product counting and freshness scoring for product images")]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

/// Text given inline or read from a file
#[derive(clap::Args, Debug)]
struct TextInput {
    /// OCR text extracted from the image
    #[arg(short, long, conflicts_with = "text_file")]
    text: Option<String>,

    /// File containing the OCR text
    #[arg(long)]
    text_file: Option<PathBuf>,
}

impl TextInput {
    fn read(&self) -> Result<String> {
        match (&self.text, &self.text_file) {
            (Some(text), _) => Ok(text.clone()),
            (None, Some(path)) => {
                std::fs::read_to_string(path).with_context(|| format!("Failed to read text file {:?}", path))
            }
            (None, None) => Ok(String::new()),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Detect the brand of a product (text first, then logo similarity)
    Detect {
        /// Product image
        #[arg(short, long)]
        image: Option<PathBuf>,

        #[command(flatten)]
        text: TextInput,

        /// Minimum text confidence to skip the visual stage
        #[arg(long)]
        ocr_threshold: Option<f32>,

        /// Minimum similarity to accept a visual match
        #[arg(long)]
        visual_threshold: Option<f32>,
    },

    /// Run an analysis job over one image
    Analyze {
        /// Product image
        #[arg(short, long)]
        image: Option<PathBuf>,

        #[command(flatten)]
        text: TextInput,

        /// Services to run (ocr, product_count, freshness, brand); all when omitted
        #[arg(short, long, value_delimiter = ',')]
        services: Vec<Service>,
    },

    /// Count products in an image or a base64 frame
    Count {
        /// Product image
        #[arg(short, long, conflicts_with = "frame")]
        image: Option<PathBuf>,

        /// File holding a base64 frame (plain or data URL)
        #[arg(long)]
        frame: Option<PathBuf>,

        /// Write the annotated image here (image input) or embed it in the output (frame input)
        #[arg(long)]
        annotate: Option<PathBuf>,
    },

    /// Score produce freshness
    Freshness {
        /// Produce image
        #[arg(short, long)]
        image: PathBuf,
    },

    /// Extract product name and label dates from OCR text
    ProductInfo {
        #[command(flatten)]
        text: TextInput,
    },

    /// List the brand table
    Brands,

    /// Precompute reference logo embeddings
    WarmCache,

    /// Download missing ONNX models
    DownloadModels,
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    let app = ProductLens::new(config)?;
    run(&app, cli.command)
}

/// Load configuration from the given file or the default location
fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    match path {
        Some(path) => config::load_config(path),
        None => config::load_or_default(&config::default_config_path()?),
    }
}

fn run(app: &ProductLens, command: Command) -> Result<()> {
    match command {
        Command::Detect {
            image,
            text,
            ocr_threshold,
            visual_threshold,
        } => {
            let defaults = app.default_thresholds();
            let thresholds = DetectionThresholds {
                ocr: ocr_threshold.unwrap_or(defaults.ocr),
                visual: visual_threshold.unwrap_or(defaults.visual),
            };
            let image_bytes = read_optional(image.as_deref())?;
            let result = app.detect_brand(&image_bytes, &text.read()?, Some(thresholds))?;
            print_json(&result)
        }
        Command::Analyze { image, text, services } => {
            let request = AnalysisRequest {
                image_bytes: read_optional(image.as_deref())?,
                ocr_text: text.read()?,
                services,
                thresholds: app.default_thresholds(),
            };
            print_json(&app.analyze(&request))
        }
        Command::Count { image, frame, annotate } => match (image, frame) {
            (Some(path), _) => {
                let image = image::open(&path).with_context(|| format!("Failed to open image {:?}", path))?;
                let result = app.counter().count(&image);
                if let Some(out) = annotate {
                    app.counter()
                        .annotate(&image, &result)
                        .save(&out)
                        .with_context(|| format!("Failed to write annotated image {:?}", out))?;
                    info!("Annotated image written to {:?}", out);
                }
                print_json(&result)
            }
            (None, Some(path)) => {
                let frame = std::fs::read_to_string(&path).with_context(|| format!("Failed to read frame {:?}", path))?;
                print_json(&app.count_frame(&frame, annotate.is_some())?)
            }
            (None, None) => anyhow::bail!("Either --image or --frame is required"),
        },
        Command::Freshness { image } => {
            let bytes = std::fs::read(&image).with_context(|| format!("Failed to read image {:?}", image))?;
            let decoded = decode_image(&bytes).with_context(|| format!("Failed to decode image {:?}", image))?;
            print_json(&app.score_freshness(&decoded))
        }
        Command::ProductInfo { text } => print_json(&app.product_info(&text.read()?)?),
        Command::Brands => print_json(&app.brands().records()),
        Command::WarmCache => {
            let count = app.warm_cache()?;
            print_json(&serde_json::json!({ "reference_embeddings": count }))
        }
        Command::DownloadModels => {
            let downloaded = app.models().ensure_downloadable_models()?;
            info!("{} models ready; restart to load them", downloaded.len());
            print_json(&app.models().model_status())
        }
    }
}

fn read_optional(path: Option<&Path>) -> Result<Vec<u8>> {
    match path {
        Some(path) => std::fs::read(path).with_context(|| format!("Failed to read image {:?}", path)),
        None => Ok(Vec::new()),
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
