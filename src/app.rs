//! Application Coordinator
//!
//! Builds every service from an [`AppConfig`]: brand table, embedding cache,
//! image encoder, hybrid detector and the analysis services. Model files that
//! are missing degrade the matching service instead of failing startup.

use anyhow::{Context, Result};
use image::DynamicImage;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::analysis::{
    AnalysisReport, AnalysisRequest, Analyzer, FreshnessModel, FreshnessResult, FreshnessScorer, FrameCount,
    OnnxFreshnessModel, ProductCounter, ProductInfo, ProductInfoExtractor,
};
use crate::brand::{DetectionThresholds, HybridDetector, HybridResult, TextMatcher, VisualDetector};
use crate::config::AppConfig;
use crate::error::DetectError;
use crate::storage::{self, brands::load_or_create_brands, BrandTable, EmbeddingCache};
use crate::vision::{ClipEncoder, EncoderKind, ImageEncoder, ModelManager, ModelType, ThumbnailEncoder};

/// Resolved data locations
#[derive(Debug, Clone)]
pub struct DataPaths {
    pub brands_file: PathBuf,
    pub reference_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub models_dir: PathBuf,
}

impl DataPaths {
    /// Configured paths, falling back to the platform data and cache directories
    pub fn resolve(config: &AppConfig) -> Result<Self> {
        let general = &config.general;
        let brands_file = match &general.brands_file {
            Some(path) => path.clone(),
            None => storage::get_data_dir()?.join("brands.json"),
        };
        let reference_dir = match &general.reference_dir {
            Some(path) => path.clone(),
            None => storage::get_data_dir()?.join("references"),
        };
        let cache_dir = match &general.cache_dir {
            Some(path) => path.clone(),
            None => storage::get_cache_dir()?.join("embeddings"),
        };
        let models_dir = match &general.models_dir {
            Some(path) => path.clone(),
            None => storage::get_data_dir()?.join("models"),
        };

        Ok(Self {
            brands_file,
            reference_dir,
            cache_dir,
            models_dir,
        })
    }
}

/// Main application coordinator
pub struct ProductLens {
    config: AppConfig,
    paths: DataPaths,
    models: ModelManager,
    detector: Arc<HybridDetector>,
    counter: ProductCounter,
    freshness: FreshnessScorer,
    analyzer: Analyzer,
}

impl ProductLens {
    /// Create the coordinator and every service
    pub fn new(config: AppConfig) -> Result<Self> {
        let paths = DataPaths::resolve(&config)?;
        info!("Data paths: {:?}", paths);

        let brands = Arc::new(load_or_create_brands(&paths.brands_file)?);
        let models = ModelManager::with_dir(paths.models_dir.clone())?;

        let visual = match build_encoder(&config, &models) {
            Some(encoder) => {
                std::fs::create_dir_all(&paths.reference_dir)
                    .with_context(|| format!("Failed to create reference dir {:?}", paths.reference_dir))?;
                let cache = EmbeddingCache::open(&paths.cache_dir)
                    .with_context(|| format!("Failed to open embedding cache {:?}", paths.cache_dir))?;
                Some(Arc::new(VisualDetector::new(
                    encoder,
                    Arc::new(cache),
                    Some(paths.reference_dir.clone()),
                    config.visual,
                )))
            }
            None => None,
        };

        let detector = Arc::new(HybridDetector::new(
            brands.clone(),
            TextMatcher::new(config.text_match),
            visual,
        ));
        let counter = ProductCounter::new(config.counting);
        let freshness = FreshnessScorer::new(load_freshness_model(&config, &models), config.freshness);

        let analyzer = Analyzer::new(
            counter.clone(),
            freshness.clone(),
            ProductInfoExtractor::for_brands(&brands)?,
            detector.clone(),
        );

        Ok(Self {
            config,
            paths,
            models,
            detector,
            counter,
            freshness,
            analyzer,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn paths(&self) -> &DataPaths {
        &self.paths
    }

    pub fn models(&self) -> &ModelManager {
        &self.models
    }

    pub fn brands(&self) -> &BrandTable {
        self.detector.brands()
    }

    pub fn detector(&self) -> Arc<HybridDetector> {
        self.detector.clone()
    }

    /// Thresholds from the configuration file
    pub fn default_thresholds(&self) -> DetectionThresholds {
        self.config.detection.thresholds()
    }

    /// Hybrid brand detection; configured thresholds unless overridden
    pub fn detect_brand(
        &self,
        image_bytes: &[u8],
        ocr_text: &str,
        thresholds: Option<DetectionThresholds>,
    ) -> Result<HybridResult, DetectError> {
        let thresholds = thresholds.unwrap_or_else(|| self.default_thresholds());
        self.detector.detect_brand(image_bytes, ocr_text, thresholds)
    }

    /// Run an analysis job
    pub fn analyze(&self, request: &AnalysisRequest) -> AnalysisReport {
        self.analyzer.run(request)
    }

    pub fn count_frame(&self, frame: &str, annotate: bool) -> Result<FrameCount> {
        self.counter.count_frame(frame, annotate)
    }

    pub fn counter(&self) -> &ProductCounter {
        &self.counter
    }

    pub fn score_freshness(&self, image: &DynamicImage) -> FreshnessResult {
        self.freshness.score(image)
    }

    pub fn product_info(&self, text: &str) -> Result<ProductInfo> {
        Ok(ProductInfoExtractor::for_brands(self.brands())?.extract(text))
    }

    /// Precompute every reference embedding
    pub fn warm_cache(&self) -> Result<usize> {
        let visual = self
            .detector
            .visual()
            .context("Visual detection is disabled (no image encoder available)")?;
        Ok(visual.warm(self.brands())?)
    }
}

fn build_encoder(config: &AppConfig, models: &ModelManager) -> Option<Arc<dyn ImageEncoder>> {
    match config.encoder.kind {
        EncoderKind::Thumbnail => Some(Arc::new(ThumbnailEncoder::default())),
        EncoderKind::Clip => {
            let path = models.model_path(ModelType::ClipVision);
            if !path.exists() {
                warn!(
                    "CLIP model not found at {:?}; run `product-lens download-models` to enable visual detection",
                    path
                );
                return None;
            }
            let version = match clip_model_version(config, models) {
                Ok(version) => version,
                Err(e) => {
                    warn!("Visual detection disabled: {:#}", e);
                    return None;
                }
            };
            match ClipEncoder::load(&path, &version, config.encoder.use_gpu) {
                Ok(encoder) => Some(Arc::new(encoder)),
                Err(e) => {
                    warn!("{}; run `product-lens download-models` to enable visual detection", e);
                    None
                }
            }
        }
    }
}

/// Cache version for CLIP embeddings: configured tag plus the model file checksum
fn clip_model_version(config: &AppConfig, models: &ModelManager) -> Result<String> {
    let fingerprint = models.model_fingerprint(ModelType::ClipVision)?;
    Ok(format!("{}-{}", config.encoder.model_version, fingerprint))
}

fn load_freshness_model(config: &AppConfig, models: &ModelManager) -> Option<Arc<dyn FreshnessModel>> {
    let path = models.model_path(ModelType::Freshness);
    if !path.exists() {
        info!("Freshness model not installed at {:?}", path);
        return None;
    }

    match OnnxFreshnessModel::load(&path, config.freshness.input_size, config.encoder.use_gpu) {
        Ok(model) => Some(Arc::new(model)),
        Err(e) => {
            warn!("Freshness scoring disabled: {:#}", e);
            None
        }
    }
}
