//! Brand Detection
//!
//! Two-stage brand recognition for product images:
//! - Text matching of OCR output against the brand alias table (fast path)
//! - Embedding similarity against reference logo images (slow path)
//!
//! [`HybridDetector`] runs the text stage first and only falls back to the
//! visual stage when the text confidence is below the caller's threshold.

pub mod hybrid;
pub mod text_match;
pub mod visual;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::storage::BrandId;

pub use hybrid::HybridDetector;
pub use text_match::{TextMatchConfig, TextMatcher};
pub use visual::{VisualConfig, VisualDetector};

/// Which stage produced a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionMethod {
    Text,
    Visual,
    None,
}

/// Why a candidate matched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Evidence {
    /// Best-scoring alias and the substrings of the OCR text that matched it
    Text { alias: String, matched: Vec<String> },
    /// Closest reference image and its cosine distance to the query
    Visual { reference: PathBuf, distance: f32 },
}

/// One brand match with its confidence in [0, 1]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionCandidate {
    pub brand_id: BrandId,
    pub display_name: String,
    pub confidence: f32,
    pub evidence: Evidence,
    pub method: DetectionMethod,
}

/// Outcome of one hybrid detection request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HybridResult {
    /// Candidates in descending confidence order
    pub candidates: Vec<DetectionCandidate>,
    pub method_used: DetectionMethod,
    pub elapsed_ms: u64,
}

impl HybridResult {
    /// Result with no candidates
    pub fn none(elapsed_ms: u64) -> Self {
        Self {
            candidates: Vec::new(),
            method_used: DetectionMethod::None,
            elapsed_ms,
        }
    }

    pub fn top(&self) -> Option<&DetectionCandidate> {
        self.candidates.first()
    }
}

/// Per-call acceptance thresholds for each stage
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectionThresholds {
    /// Minimum text-stage confidence to skip the visual stage
    pub ocr: f32,
    /// Minimum visual-stage similarity to accept a visual match
    pub visual: f32,
}

impl Default for DetectionThresholds {
    fn default() -> Self {
        Self { ocr: 0.70, visual: 0.60 }
    }
}

/// Sort by descending confidence
///
/// The sort is stable, so candidates produced in brand-table order keep that
/// order among equal confidences.
pub(crate) fn sort_candidates(candidates: &mut [DetectionCandidate]) {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, confidence: f32) -> DetectionCandidate {
        DetectionCandidate {
            brand_id: BrandId::new(id),
            display_name: id.to_string(),
            confidence,
            evidence: Evidence::Text {
                alias: id.to_string(),
                matched: vec![],
            },
            method: DetectionMethod::Text,
        }
    }

    #[test]
    fn test_sort_keeps_table_order_on_ties() {
        let mut candidates = vec![
            candidate("amul", 0.5),
            candidate("parle", 0.9),
            candidate("dabur", 0.9),
            candidate("godrej", 0.7),
        ];
        sort_candidates(&mut candidates);

        let ids: Vec<&str> = candidates.iter().map(|c| c.brand_id.as_str()).collect();
        assert_eq!(ids, vec!["parle", "dabur", "godrej", "amul"]);
    }

    #[test]
    fn test_result_serialization() {
        let result = HybridResult {
            candidates: vec![candidate("maggi", 1.0)],
            method_used: DetectionMethod::Text,
            elapsed_ms: 3,
        };
        let json = serde_json::to_value(&result).unwrap();

        assert_eq!(json["method_used"], "text");
        assert_eq!(json["candidates"][0]["brand_id"], "maggi");
        assert_eq!(json["candidates"][0]["evidence"]["kind"], "text");
        assert_eq!(serde_json::to_value(DetectionMethod::None).unwrap(), "none");
    }

    #[test]
    fn test_default_thresholds() {
        let thresholds = DetectionThresholds::default();
        assert_eq!(thresholds.ocr, 0.70);
        assert_eq!(thresholds.visual, 0.60);
    }
}
