//! ProductLens - product image analysis with hybrid brand detection
//!
//! Identifies the brand on a product image from its OCR text, falling back
//! to logo embedding similarity when the text is inconclusive. Also counts
//! items, scores produce freshness and extracts label dates.

pub mod analysis;
pub mod app;
pub mod brand;
pub mod config;
pub mod error;
pub mod storage;
pub mod vision;

pub use app::ProductLens;
pub use brand::{DetectionCandidate, DetectionMethod, DetectionThresholds, Evidence, HybridDetector, HybridResult};
pub use error::{CacheError, DetectError, EncodeError, VisualError};
pub use storage::{BrandId, BrandRecord, BrandTable};
