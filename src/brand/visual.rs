//! Visual-stage brand matching
//!
//! The query image is encoded once and compared against every reference
//! logo embedding of every brand. A brand scores the maximum cosine
//! similarity over its references, clipped to [0, 1].
//!
//! Reference embeddings come from the on-disk [`EmbeddingCache`] and are
//! computed lazily the first time a brand is scored.

use image::DynamicImage;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{sort_candidates, DetectionCandidate, DetectionMethod, Evidence};
use crate::error::VisualError;
use crate::storage::{BrandId, BrandRecord, BrandTable, CacheKey, EmbeddingCache, ReferenceEmbedding};
use crate::vision::{cosine_similarity, ImageEncoder, TimedEncoder};

/// File extensions picked up from reference directories
const REFERENCE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp"];

/// Visual matching parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisualConfig {
    /// Brands scoring below this similarity are dropped
    pub noise_floor: f32,
    /// Upper bound for a single encoder call
    pub encode_timeout_ms: u64,
}

impl Default for VisualConfig {
    fn default() -> Self {
        Self {
            noise_floor: 0.3,
            encode_timeout_ms: 5000,
        }
    }
}

/// Failure while producing one reference embedding
enum ReferenceError {
    /// The reference file could not be read; the reference is skipped
    Unreadable(image::ImageError),
    /// The encoder failed; the whole stage is abandoned
    Encoder(VisualError),
}

/// Embedding-similarity brand detector
pub struct VisualDetector {
    encoder: TimedEncoder,
    cache: Arc<EmbeddingCache>,
    reference_dir: Option<PathBuf>,
    config: VisualConfig,
    /// Reference listing per brand, read once
    listings: RwLock<HashMap<BrandId, Arc<Vec<PathBuf>>>>,
}

impl VisualDetector {
    pub fn new(
        encoder: Arc<dyn ImageEncoder>,
        cache: Arc<EmbeddingCache>,
        reference_dir: Option<PathBuf>,
        config: VisualConfig,
    ) -> Self {
        let timeout = Duration::from_millis(config.encode_timeout_ms.max(1));
        Self {
            encoder: TimedEncoder::new(encoder, timeout),
            cache,
            reference_dir,
            config,
            listings: RwLock::new(HashMap::new()),
        }
    }

    pub fn model_version(&self) -> &str {
        self.encoder.model_version()
    }

    pub fn config(&self) -> &VisualConfig {
        &self.config
    }

    /// Reference images for a brand, in path order
    ///
    /// Explicit references from the brand record plus every image file in
    /// `<reference_dir>/<brand_id>/`. Relative record paths resolve against
    /// the reference directory. The listing is read on first use; files added
    /// later are picked up by a new detector.
    pub fn reference_images(&self, brand: &BrandRecord) -> Arc<Vec<PathBuf>> {
        if let Some(paths) = self.listings.read().get(&brand.id) {
            return paths.clone();
        }

        let paths = Arc::new(self.list_references(brand));
        self.listings
            .write()
            .entry(brand.id.clone())
            .or_insert(paths)
            .clone()
    }

    fn list_references(&self, brand: &BrandRecord) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = brand
            .references
            .iter()
            .map(|path| match &self.reference_dir {
                Some(dir) if path.is_relative() => dir.join(path),
                _ => path.clone(),
            })
            .collect();

        if let Some(dir) = &self.reference_dir {
            let brand_dir = dir.join(brand.id.as_str());
            if let Ok(entries) = std::fs::read_dir(&brand_dir) {
                paths.extend(
                    entries
                        .filter_map(|entry| entry.ok())
                        .map(|entry| entry.path())
                        .filter(|path| path.is_file() && is_reference_image(path)),
                );
            }
        }

        paths.sort();
        paths.dedup();
        paths
    }

    /// Load or compute every reference embedding of a brand
    ///
    /// Unreadable reference files are logged and skipped. Encoder failures
    /// abort with `ModelUnavailable` or `Timeout`.
    pub fn reference_embeddings(&self, brand: &BrandRecord) -> Result<Vec<ReferenceEmbedding>, VisualError> {
        let model_version = self.encoder.model_version().to_string();
        let dims = self.encoder.dimensions();
        let mut embeddings = Vec::new();

        for path in self.reference_images(brand).iter() {
            let key = CacheKey::new(brand.id.clone(), path.clone(), &model_version);
            let result = self.cache.get_or_compute(&key, dims, || {
                debug!("Encoding reference {:?} for {}", path, brand.id);
                let image = image::open(path).map_err(ReferenceError::Unreadable)?;
                self.encoder.encode(Arc::new(image)).map_err(ReferenceError::Encoder)
            });

            match result {
                Ok(vector) => embeddings.push(ReferenceEmbedding {
                    brand_id: brand.id.clone(),
                    source_image_path: path.clone(),
                    model_version: model_version.clone(),
                    vector,
                }),
                Err(ReferenceError::Unreadable(e)) => {
                    warn!("Skipping unreadable reference {:?} for {}: {}", path, brand.id, e);
                }
                Err(ReferenceError::Encoder(e)) => return Err(e),
            }
        }

        Ok(embeddings)
    }

    /// Precompute reference embeddings for every brand; returns how many are available
    pub fn warm(&self, brands: &BrandTable) -> Result<usize, VisualError> {
        let mut total = 0;
        for brand in brands.iter() {
            let count = self.reference_embeddings(brand)?.len();
            debug!("{} reference embeddings for {}", count, brand.id);
            total += count;
        }
        info!("Embedding cache warm: {} references ({})", total, self.model_version());
        Ok(total)
    }

    /// Score every brand against `image`
    ///
    /// Returns brands at or above the noise floor in descending similarity,
    /// ties kept in brand-table order.
    pub fn detect(&self, image: Arc<DynamicImage>, brands: &BrandTable) -> Result<Vec<DetectionCandidate>, VisualError> {
        let query = self.encoder.encode(image)?;
        let mut candidates = Vec::new();

        for brand in brands.iter() {
            let references = self.reference_embeddings(brand)?;
            let mut best: Option<(f32, &ReferenceEmbedding)> = None;

            for reference in &references {
                let similarity = cosine_similarity(&query, &reference.vector);
                if best.map_or(true, |(score, _)| similarity > score) {
                    best = Some((similarity, reference));
                }
            }

            let Some((similarity, reference)) = best else {
                continue;
            };

            let confidence = similarity.clamp(0.0, 1.0);
            if confidence < self.config.noise_floor || confidence <= 0.0 {
                continue;
            }

            candidates.push(DetectionCandidate {
                brand_id: brand.id.clone(),
                display_name: brand.display_name.clone(),
                confidence,
                evidence: Evidence::Visual {
                    reference: reference.source_image_path.clone(),
                    distance: 1.0 - similarity,
                },
                method: DetectionMethod::Visual,
            });
        }

        sort_candidates(&mut candidates);

        if let Some(top) = candidates.first() {
            debug!("Visual match: {} ({:.3}), {} candidates", top.brand_id, top.confidence, candidates.len());
        }
        Ok(candidates)
    }
}

fn is_reference_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| REFERENCE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::EncodeError;
    use crate::vision::ThumbnailEncoder;
    use image::{Rgb, RgbImage};
    use tempfile::TempDir;

    /// Diagonal stripes
    pub(crate) fn stripes_image() -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(64, 64, |x, y| {
            if (x + y) / 8 % 2 == 0 {
                Rgb([200, 20, 30])
            } else {
                Rgb([250, 250, 250])
            }
        }))
    }

    /// Radial-ish gradient
    pub(crate) fn gradient_image() -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(64, 64, |x, y| {
            Rgb([(x * 4) as u8, (y * 4) as u8, ((x * y) % 256) as u8])
        }))
    }

    pub(crate) fn blank_image() -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(64, 64, Rgb([255, 255, 255])))
    }

    /// Reference dir with a stripes logo for cocacola and a gradient for pepsi
    pub(crate) fn reference_dir() -> TempDir {
        let dir = TempDir::new().unwrap();
        for (brand, image) in [("cocacola", stripes_image()), ("pepsi", gradient_image())] {
            let brand_dir = dir.path().join(brand);
            std::fs::create_dir_all(&brand_dir).unwrap();
            image.save(brand_dir.join("logo.png")).unwrap();
        }
        dir
    }

    struct FailingEncoder;

    impl ImageEncoder for FailingEncoder {
        fn encode(&self, _image: &DynamicImage) -> Result<Vec<f32>, EncodeError> {
            Err(EncodeError::Unavailable("no model".to_string()))
        }

        fn model_version(&self) -> &str {
            "failing"
        }

        fn dimensions(&self) -> usize {
            4
        }
    }

    fn detector(refs: &TempDir, cache_dir: &Path) -> VisualDetector {
        VisualDetector::new(
            Arc::new(ThumbnailEncoder::default()),
            Arc::new(EmbeddingCache::open(cache_dir).unwrap()),
            Some(refs.path().to_path_buf()),
            VisualConfig::default(),
        )
    }

    #[test]
    fn test_reference_images_are_sorted_and_filtered() {
        let refs = reference_dir();
        let brand_dir = refs.path().join("cocacola");
        std::fs::write(brand_dir.join("notes.txt"), b"not a logo").unwrap();
        stripes_image().save(brand_dir.join("a_can.JPG")).unwrap();

        let cache = TempDir::new().unwrap();
        let detector = detector(&refs, cache.path());
        let brands = BrandTable::builtin();
        let cocacola = brands.get(&BrandId::new("cocacola")).unwrap();

        let paths = detector.reference_images(cocacola);
        assert_eq!(*paths, vec![brand_dir.join("a_can.JPG"), brand_dir.join("logo.png")]);
    }

    #[test]
    fn test_reference_listing_is_read_once() {
        let refs = reference_dir();
        let cache = TempDir::new().unwrap();
        let detector = detector(&refs, cache.path());
        let brands = BrandTable::builtin();
        let cocacola = brands.get(&BrandId::new("cocacola")).unwrap();

        let first = detector.reference_images(cocacola);
        assert_eq!(first.len(), 1);

        stripes_image().save(refs.path().join("cocacola").join("z_bottle.png")).unwrap();
        let second = detector.reference_images(cocacola);
        assert!(Arc::ptr_eq(&first, &second));

        let restarted = self::detector(&refs, cache.path());
        assert_eq!(restarted.reference_images(cocacola).len(), 2);
    }

    #[test]
    fn test_reference_image_is_top_candidate() {
        let refs = reference_dir();
        let cache = TempDir::new().unwrap();
        let detector = detector(&refs, cache.path());

        let candidates = detector
            .detect(Arc::new(stripes_image()), &BrandTable::builtin())
            .unwrap();

        let top = &candidates[0];
        assert_eq!(top.brand_id.as_str(), "cocacola");
        assert!((top.confidence - 1.0).abs() < 1e-4, "confidence {}", top.confidence);
        assert_eq!(top.method, DetectionMethod::Visual);
        match &top.evidence {
            Evidence::Visual { reference, distance } => {
                assert!(reference.ends_with("cocacola/logo.png"));
                assert!(distance.abs() < 1e-4);
            }
            other => panic!("unexpected evidence {:?}", other),
        }
    }

    #[test]
    fn test_blank_image_matches_nothing() {
        let refs = reference_dir();
        let cache = TempDir::new().unwrap();
        let detector = detector(&refs, cache.path());

        let candidates = detector.detect(Arc::new(blank_image()), &BrandTable::builtin()).unwrap();
        assert!(candidates.is_empty());
    }

    #[test]
    fn test_warm_persists_embeddings() {
        let refs = reference_dir();
        let cache = TempDir::new().unwrap();

        let count = detector(&refs, cache.path()).warm(&BrandTable::builtin()).unwrap();
        assert_eq!(count, 2);

        let files = std::fs::read_dir(cache.path())
            .unwrap()
            .filter(|e| e.as_ref().unwrap().path().extension().is_some_and(|ext| ext == "emb"))
            .count();
        assert_eq!(files, 2);

        // A fresh process reads the persisted vectors back
        let reloaded = detector(&refs, cache.path());
        let brands = BrandTable::builtin();
        let pepsi = brands.get(&BrandId::new("pepsi")).unwrap();
        let embeddings = reloaded.reference_embeddings(pepsi).unwrap();
        let expected = ThumbnailEncoder::default().encode(&gradient_image()).unwrap();
        assert_eq!(*embeddings[0].vector, expected);
    }

    #[test]
    fn test_unreadable_reference_is_skipped() {
        let refs = reference_dir();
        std::fs::write(refs.path().join("cocacola").join("broken.png"), b"garbage").unwrap();
        let cache = TempDir::new().unwrap();
        let detector = detector(&refs, cache.path());

        let brands = BrandTable::builtin();
        let cocacola = brands.get(&BrandId::new("cocacola")).unwrap();
        assert_eq!(detector.reference_embeddings(cocacola).unwrap().len(), 1);

        let candidates = detector.detect(Arc::new(stripes_image()), &brands).unwrap();
        assert_eq!(candidates[0].brand_id.as_str(), "cocacola");
    }

    #[test]
    fn test_encoder_failure_is_model_unavailable() {
        let refs = reference_dir();
        let cache = TempDir::new().unwrap();
        let detector = VisualDetector::new(
            Arc::new(FailingEncoder),
            Arc::new(EmbeddingCache::open(cache.path()).unwrap()),
            Some(refs.path().to_path_buf()),
            VisualConfig::default(),
        );

        let result = detector.detect(Arc::new(stripes_image()), &BrandTable::builtin());
        assert!(matches!(result, Err(VisualError::ModelUnavailable(_))));
        assert!(matches!(detector.warm(&BrandTable::builtin()), Err(VisualError::ModelUnavailable(_))));
    }

    #[test]
    fn test_brands_without_references_are_ignored() {
        let cache = TempDir::new().unwrap();
        let detector = VisualDetector::new(
            Arc::new(ThumbnailEncoder::default()),
            Arc::new(EmbeddingCache::open(cache.path()).unwrap()),
            None,
            VisualConfig::default(),
        );

        let candidates = detector.detect(Arc::new(stripes_image()), &BrandTable::builtin()).unwrap();
        assert!(candidates.is_empty());
    }
}
