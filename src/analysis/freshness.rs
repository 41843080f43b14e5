//! Freshness scoring for produce images
//!
//! A binary classifier outputs the probability that the item is fresh.

use anyhow::{Context, Result};
use image::DynamicImage;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::vision::{preprocess_image, OnnxSession, PreprocessConfig};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FreshnessConfig {
    /// Probability above which an item is `Fresh`
    pub threshold: f32,
    /// Square model input size
    pub input_size: u32,
}

impl Default for FreshnessConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            input_size: 224,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FreshnessLabel {
    Fresh,
    #[serde(rename = "Not Fresh")]
    NotFresh,
    /// No model, or inference failed
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreshnessResult {
    pub label: FreshnessLabel,
    /// Fresh probability in [0, 1]
    pub probability: Option<f32>,
    /// Probability on a 0-10 scale, one decimal
    pub score: Option<f32>,
}

impl FreshnessResult {
    pub fn unknown() -> Self {
        Self {
            label: FreshnessLabel::Unknown,
            probability: None,
            score: None,
        }
    }
}

/// Produces a fresh probability for an image
pub trait FreshnessModel: Send + Sync {
    fn predict(&self, image: &DynamicImage) -> Result<f32>;
}

/// ONNX freshness classifier: 0-1 scaled NCHW input, first output is the probability
pub struct OnnxFreshnessModel {
    session: Mutex<OnnxSession>,
    preprocess: PreprocessConfig,
}

impl OnnxFreshnessModel {
    pub fn load(model_path: &Path, input_size: u32, use_gpu: bool) -> Result<Self> {
        if !model_path.exists() {
            anyhow::bail!("Freshness model not found at {:?}", model_path);
        }
        let session = OnnxSession::new(model_path, None, use_gpu)?;
        info!("Freshness model loaded from {:?}", model_path);

        Ok(Self {
            session: Mutex::new(session),
            preprocess: PreprocessConfig::unit_scale(input_size),
        })
    }
}

impl FreshnessModel for OnnxFreshnessModel {
    fn predict(&self, image: &DynamicImage) -> Result<f32> {
        let input = preprocess_image(image, &self.preprocess);
        let output = self.session.lock().run(input)?;
        output.first().copied().context("Freshness model returned no output")
    }
}

/// Map a probability to a label
pub fn classify(probability: f32, threshold: f32) -> FreshnessLabel {
    if probability > threshold {
        FreshnessLabel::Fresh
    } else {
        FreshnessLabel::NotFresh
    }
}

/// Scores images with an optional model; without one every result is `Unknown`
#[derive(Clone)]
pub struct FreshnessScorer {
    model: Option<Arc<dyn FreshnessModel>>,
    config: FreshnessConfig,
}

impl FreshnessScorer {
    pub fn new(model: Option<Arc<dyn FreshnessModel>>, config: FreshnessConfig) -> Self {
        Self { model, config }
    }

    pub fn is_available(&self) -> bool {
        self.model.is_some()
    }

    pub fn score(&self, image: &DynamicImage) -> FreshnessResult {
        let Some(model) = &self.model else {
            debug!("No freshness model loaded");
            return FreshnessResult::unknown();
        };

        match model.predict(image) {
            Ok(raw) if raw.is_finite() => {
                let probability = raw.clamp(0.0, 1.0);
                FreshnessResult {
                    label: classify(probability, self.config.threshold),
                    probability: Some(probability),
                    score: Some((probability * 100.0).round() / 10.0),
                }
            }
            Ok(raw) => {
                warn!("Freshness model returned non-finite output {}", raw);
                FreshnessResult::unknown()
            }
            Err(e) => {
                warn!("Freshness inference failed: {:#}", e);
                FreshnessResult::unknown()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    struct FixedModel(f32);

    impl FreshnessModel for FixedModel {
        fn predict(&self, _image: &DynamicImage) -> Result<f32> {
            Ok(self.0)
        }
    }

    struct BrokenModel;

    impl FreshnessModel for BrokenModel {
        fn predict(&self, _image: &DynamicImage) -> Result<f32> {
            anyhow::bail!("session poisoned")
        }
    }

    fn produce() -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(32, 32, Rgb([40, 180, 60])))
    }

    fn scorer(model: impl FreshnessModel + 'static) -> FreshnessScorer {
        let model: Arc<dyn FreshnessModel> = Arc::new(model);
        FreshnessScorer::new(Some(model), FreshnessConfig::default())
    }

    #[test]
    fn test_classify_threshold_is_exclusive() {
        assert_eq!(classify(0.51, 0.5), FreshnessLabel::Fresh);
        assert_eq!(classify(0.5, 0.5), FreshnessLabel::NotFresh);
        assert_eq!(classify(0.1, 0.5), FreshnessLabel::NotFresh);
    }

    #[test]
    fn test_score_scales_to_ten() {
        let result = scorer(FixedModel(0.85)).score(&produce());
        assert_eq!(result.label, FreshnessLabel::Fresh);
        assert_eq!(result.score, Some(8.5));

        let result = scorer(FixedModel(0.2)).score(&produce());
        assert_eq!(result.label, FreshnessLabel::NotFresh);
        assert_eq!(result.score, Some(2.0));
    }

    #[test]
    fn test_out_of_range_output_is_clamped() {
        let result = scorer(FixedModel(3.0)).score(&produce());
        assert_eq!(result.probability, Some(1.0));

        assert_eq!(scorer(FixedModel(f32::NAN)).score(&produce()), FreshnessResult::unknown());
    }

    #[test]
    fn test_missing_or_broken_model_is_unknown() {
        let none = FreshnessScorer::new(None, FreshnessConfig::default());
        assert!(!none.is_available());
        assert_eq!(none.score(&produce()).label, FreshnessLabel::Unknown);

        assert_eq!(scorer(BrokenModel).score(&produce()).label, FreshnessLabel::Unknown);
    }

    #[test]
    fn test_label_serialization() {
        assert_eq!(serde_json::to_value(FreshnessLabel::NotFresh).unwrap(), "Not Fresh");
        assert_eq!(serde_json::to_value(FreshnessLabel::Fresh).unwrap(), "Fresh");
    }

    #[test]
    fn test_missing_model_file_fails_to_load() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(OnnxFreshnessModel::load(&dir.path().join("freshness.onnx"), 224, false).is_err());
    }
}
