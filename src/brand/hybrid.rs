//! Hybrid brand detection
//!
//! Text stage first; the visual stage only runs when the best text
//! confidence is below the caller's OCR threshold. Visual failures
//! (missing model, timeout) degrade to "no visual candidates".

use image::DynamicImage;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::{DetectionMethod, DetectionThresholds, HybridResult, TextMatcher, VisualDetector};
use crate::error::DetectError;
use crate::storage::BrandTable;
use crate::vision::decode_image;

/// Text-then-visual brand detector over a fixed brand table
pub struct HybridDetector {
    brands: Arc<BrandTable>,
    text: TextMatcher,
    visual: Option<Arc<VisualDetector>>,
}

impl HybridDetector {
    pub fn new(brands: Arc<BrandTable>, text: TextMatcher, visual: Option<Arc<VisualDetector>>) -> Self {
        if visual.is_none() {
            info!("Visual brand detection disabled, text matching only");
        }
        Self { brands, text, visual }
    }

    pub fn brands(&self) -> &BrandTable {
        &self.brands
    }

    pub fn visual(&self) -> Option<&VisualDetector> {
        self.visual.as_deref()
    }

    /// Detect the brand in an encoded image and its OCR text
    ///
    /// Empty input yields a `none` result. The only error is undecodable,
    /// non-empty image bytes.
    pub fn detect_brand(
        &self,
        image_bytes: &[u8],
        ocr_text: &str,
        thresholds: DetectionThresholds,
    ) -> Result<HybridResult, DetectError> {
        let started = Instant::now();

        if image_bytes.is_empty() && ocr_text.trim().is_empty() {
            debug!("Nothing to detect: no text and no image");
            return Ok(HybridResult::none(elapsed_ms(started)));
        }

        let image = if image_bytes.is_empty() {
            None
        } else {
            Some(Arc::new(decode_image(image_bytes)?))
        };

        Ok(self.run(started, image, ocr_text, thresholds))
    }

    /// Detect with an already decoded image
    pub fn detect_image(
        &self,
        image: Option<Arc<DynamicImage>>,
        ocr_text: &str,
        thresholds: DetectionThresholds,
    ) -> HybridResult {
        self.run(Instant::now(), image, ocr_text, thresholds)
    }

    /// [`HybridDetector::detect_brand`] on the blocking thread pool
    pub async fn detect_async(
        self: Arc<Self>,
        image_bytes: Vec<u8>,
        ocr_text: String,
        thresholds: DetectionThresholds,
    ) -> Result<HybridResult, DetectError> {
        tokio::task::spawn_blocking(move || self.detect_brand(&image_bytes, &ocr_text, thresholds))
            .await
            .map_err(|e| DetectError::TaskFailed(e.to_string()))?
    }

    fn run(
        &self,
        started: Instant,
        image: Option<Arc<DynamicImage>>,
        ocr_text: &str,
        thresholds: DetectionThresholds,
    ) -> HybridResult {
        let text_candidates = self.text.detect(ocr_text, &self.brands);
        let text_best = text_candidates.first().map_or(0.0, |c| c.confidence);

        if text_best >= thresholds.ocr && !text_candidates.is_empty() {
            debug!("Text confidence {:.2} >= {:.2}, using text result", text_best, thresholds.ocr);
            return HybridResult {
                candidates: text_candidates,
                method_used: DetectionMethod::Text,
                elapsed_ms: elapsed_ms(started),
            };
        }
        debug!("Text confidence {:.2} < {:.2}, trying visual stage", text_best, thresholds.ocr);

        let (Some(image), Some(visual)) = (image, self.visual.as_ref()) else {
            return HybridResult::none(elapsed_ms(started));
        };

        let visual_candidates = match visual.detect(image, &self.brands) {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!("Visual stage skipped: {}", e);
                Vec::new()
            }
        };

        match visual_candidates.first() {
            Some(top) if top.confidence >= thresholds.visual => {
                debug!("Visual match {} ({:.3}) accepted", top.brand_id, top.confidence);
                HybridResult {
                    candidates: visual_candidates,
                    method_used: DetectionMethod::Visual,
                    elapsed_ms: elapsed_ms(started),
                }
            }
            _ => HybridResult::none(elapsed_ms(started)),
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brand::visual::tests::{blank_image, reference_dir, stripes_image};
    use crate::brand::{TextMatchConfig, VisualConfig};
    use crate::error::EncodeError;
    use crate::storage::{BrandRecord, EmbeddingCache};
    use crate::vision::{cosine_similarity, ImageEncoder, ThumbnailEncoder};
    use image::ImageFormat;
    use std::io::Cursor;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _refs: TempDir,
        _cache: TempDir,
        detector: HybridDetector,
    }

    fn png_bytes(image: &DynamicImage) -> Vec<u8> {
        let mut bytes = Vec::new();
        image.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png).unwrap();
        bytes
    }

    fn fixture_with(encoder: Arc<dyn ImageEncoder>, config: VisualConfig) -> Fixture {
        let refs = reference_dir();
        let cache = TempDir::new().unwrap();
        let visual = VisualDetector::new(
            encoder,
            Arc::new(EmbeddingCache::open(cache.path()).unwrap()),
            Some(refs.path().to_path_buf()),
            config,
        );
        let detector = HybridDetector::new(
            Arc::new(BrandTable::builtin()),
            TextMatcher::new(TextMatchConfig::default()),
            Some(Arc::new(visual)),
        );
        Fixture {
            _refs: refs,
            _cache: cache,
            detector,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(ThumbnailEncoder::default()), VisualConfig::default())
    }

    struct FailingEncoder;

    impl ImageEncoder for FailingEncoder {
        fn encode(&self, _image: &DynamicImage) -> Result<Vec<f32>, EncodeError> {
            Err(EncodeError::Unavailable("model file missing".to_string()))
        }

        fn model_version(&self) -> &str {
            "failing"
        }

        fn dimensions(&self) -> usize {
            8
        }
    }

    struct StuckEncoder;

    impl ImageEncoder for StuckEncoder {
        fn encode(&self, _image: &DynamicImage) -> Result<Vec<f32>, EncodeError> {
            std::thread::sleep(Duration::from_millis(500));
            Ok(vec![1.0; 8])
        }

        fn model_version(&self) -> &str {
            "stuck"
        }

        fn dimensions(&self) -> usize {
            8
        }
    }

    #[test]
    fn test_exact_alias_uses_text_stage() {
        let fx = fixture();
        let result = fx
            .detector
            .detect_brand(b"", "MAGGI 2-Minute Noodles", DetectionThresholds::default())
            .unwrap();

        assert_eq!(result.method_used, DetectionMethod::Text);
        let top = result.top().unwrap();
        assert_eq!(top.brand_id.as_str(), "maggi");
        assert_eq!(top.confidence, 1.0);
    }

    #[test]
    fn test_reference_image_without_text_uses_visual_stage() {
        let fx = fixture();
        let result = fx
            .detector
            .detect_brand(&png_bytes(&stripes_image()), "", DetectionThresholds::default())
            .unwrap();

        assert_eq!(result.method_used, DetectionMethod::Visual);
        let top = result.top().unwrap();
        assert_eq!(top.brand_id.as_str(), "cocacola");
        assert!((top.confidence - 1.0).abs() < 1e-4);
        assert!(result.candidates.iter().all(|c| c.method == DetectionMethod::Visual));
    }

    #[test]
    fn test_gibberish_and_blank_image_is_none() {
        let fx = fixture();
        let result = fx
            .detector
            .detect_brand(&png_bytes(&blank_image()), "randomgibberish", DetectionThresholds::default())
            .unwrap();

        assert!(result.candidates.is_empty());
        assert_eq!(result.method_used, DetectionMethod::None);
    }

    #[test]
    fn test_empty_input_is_none() {
        let fx = fixture();
        let result = fx.detector.detect_brand(b"", "   ", DetectionThresholds::default()).unwrap();
        assert!(result.candidates.is_empty());
        assert_eq!(result.method_used, DetectionMethod::None);
    }

    #[test]
    fn test_undecodable_image_is_invalid() {
        let fx = fixture();
        let result = fx
            .detector
            .detect_brand(b"\x00\x01not an image", "MAGGI", DetectionThresholds::default());
        assert!(matches!(result, Err(DetectError::InvalidImage(_))));
    }

    #[test]
    fn test_weak_text_without_image_is_none() {
        let fx = fixture();
        let result = fx
            .detector
            .detect_brand(b"", "Britania", DetectionThresholds { ocr: 0.9, visual: 0.6 })
            .unwrap();
        assert_eq!(result.method_used, DetectionMethod::None);
        assert!(result.candidates.is_empty());
    }

    #[test]
    fn test_unavailable_model_falls_back_to_none() {
        let fx = fixture_with(Arc::new(FailingEncoder), VisualConfig::default());
        let result = fx
            .detector
            .detect_brand(&png_bytes(&stripes_image()), "", DetectionThresholds::default())
            .unwrap();
        assert_eq!(result.method_used, DetectionMethod::None);

        // The text fast path is unaffected
        let result = fx
            .detector
            .detect_brand(&png_bytes(&stripes_image()), "Coca-Cola", DetectionThresholds::default())
            .unwrap();
        assert_eq!(result.method_used, DetectionMethod::Text);
    }

    #[test]
    fn test_encoder_timeout_falls_back_to_none() {
        let config = VisualConfig {
            encode_timeout_ms: 20,
            ..VisualConfig::default()
        };
        let fx = fixture_with(Arc::new(StuckEncoder), config);

        let started = Instant::now();
        let result = fx
            .detector
            .detect_brand(&png_bytes(&stripes_image()), "", DetectionThresholds::default())
            .unwrap();

        assert_eq!(result.method_used, DetectionMethod::None);
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    /// Encodes 32 px wide references as `[1, 0]` and anything else as `[0.6, 0.8]`
    struct FixedEncoder;

    impl ImageEncoder for FixedEncoder {
        fn encode(&self, image: &DynamicImage) -> Result<Vec<f32>, EncodeError> {
            Ok(if image.width() == 32 { vec![1.0, 0.0] } else { vec![0.6, 0.8] })
        }

        fn model_version(&self) -> &str {
            "fixed"
        }

        fn dimensions(&self) -> usize {
            2
        }
    }

    #[test]
    fn test_visual_threshold_boundary() {
        let refs = TempDir::new().unwrap();
        let cache = TempDir::new().unwrap();
        let brand_dir = refs.path().join("acme");
        std::fs::create_dir_all(&brand_dir).unwrap();
        DynamicImage::new_rgb8(32, 32).save(brand_dir.join("logo.png")).unwrap();

        let visual = VisualDetector::new(
            Arc::new(FixedEncoder),
            Arc::new(EmbeddingCache::open(cache.path()).unwrap()),
            Some(refs.path().to_path_buf()),
            VisualConfig::default(),
        );
        let brands = BrandTable::new(vec![BrandRecord::new("acme", "Acme", &["Acme"])]).unwrap();
        let detector = HybridDetector::new(Arc::new(brands), TextMatcher::default(), Some(Arc::new(visual)));

        let score = cosine_similarity(&[0.6, 0.8], &[1.0, 0.0]).clamp(0.0, 1.0);
        let query = png_bytes(&DynamicImage::new_rgb8(48, 48));

        let at = DetectionThresholds { ocr: 0.7, visual: score };
        let result = detector.detect_brand(&query, "", at).unwrap();
        assert_eq!(result.method_used, DetectionMethod::Visual);
        assert_eq!(result.top().unwrap().confidence, score);

        let above = DetectionThresholds {
            ocr: 0.7,
            visual: f32::from_bits(score.to_bits() + 1),
        };
        let result = detector.detect_brand(&query, "", above).unwrap();
        assert_eq!(result.method_used, DetectionMethod::None);
        assert!(result.candidates.is_empty());
    }

    #[test]
    fn test_raising_ocr_threshold_only_falls_through_more() {
        let fx = fixture();
        let image = png_bytes(&stripes_image());

        let mut fell_through = false;
        for step in 0..=10 {
            let thresholds = DetectionThresholds {
                ocr: step as f32 / 10.0,
                visual: 0.6,
            };
            let result = fx.detector.detect_brand(&image, "Britania", thresholds).unwrap();

            if fell_through {
                assert_ne!(result.method_used, DetectionMethod::Text, "ocr threshold {}", thresholds.ocr);
            }
            fell_through |= result.method_used != DetectionMethod::Text;
        }
        assert!(fell_through);
    }

    #[test]
    fn test_detection_is_deterministic() {
        let fx = fixture();
        let image = png_bytes(&stripes_image());

        let first = fx.detector.detect_brand(&image, "Britania", DetectionThresholds { ocr: 0.9, visual: 0.6 }).unwrap();
        for _ in 0..3 {
            let again = fx.detector.detect_brand(&image, "Britania", DetectionThresholds { ocr: 0.9, visual: 0.6 }).unwrap();
            assert_eq!(again.candidates, first.candidates);
            assert_eq!(again.method_used, first.method_used);
        }
        assert_eq!(first.method_used, DetectionMethod::Visual);
    }

    #[test]
    fn test_text_only_detector() {
        let detector = HybridDetector::new(Arc::new(BrandTable::builtin()), TextMatcher::default(), None);
        let image = png_bytes(&stripes_image());

        let result = detector.detect_brand(&image, "Dabur Honey", DetectionThresholds::default()).unwrap();
        assert_eq!(result.top().unwrap().brand_id.as_str(), "dabur");

        let result = detector.detect_brand(&image, "", DetectionThresholds::default()).unwrap();
        assert_eq!(result.method_used, DetectionMethod::None);
    }

    #[tokio::test]
    async fn test_detect_async() {
        let fx = fixture();
        let detector = Arc::new(fx.detector);

        let result = detector
            .clone()
            .detect_async(Vec::new(), "Amul Butter".to_string(), DetectionThresholds::default())
            .await
            .unwrap();
        assert_eq!(result.top().unwrap().brand_id.as_str(), "amul");
        assert_eq!(result.method_used, DetectionMethod::Text);

        let result = detector
            .detect_async(png_bytes(&stripes_image()), String::new(), DetectionThresholds::default())
            .await
            .unwrap();
        assert_eq!(result.method_used, DetectionMethod::Visual);
    }
}
