//! Analysis jobs
//!
//! A job runs a selection of services over one product image and collects
//! their results into a single report. A failing service is recorded in its
//! own section and never aborts the job.

use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

use super::counting::{CountResult, ProductCounter};
use super::freshness::{FreshnessLabel, FreshnessResult, FreshnessScorer};
use super::product_info::{ProductInfo, ProductInfoExtractor};
use crate::brand::{DetectionThresholds, HybridDetector, HybridResult};
use crate::vision::decode_image;

/// An independently selectable analysis service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Service {
    Ocr,
    ProductCount,
    Freshness,
    Brand,
}

impl Service {
    pub fn all() -> [Service; 4] {
        [Service::Ocr, Service::ProductCount, Service::Freshness, Service::Brand]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Service::Ocr => "ocr",
            Service::ProductCount => "product_count",
            Service::Freshness => "freshness",
            Service::Brand => "brand",
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Service {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "ocr" => Ok(Service::Ocr),
            "product_count" | "count" => Ok(Service::ProductCount),
            "freshness" => Ok(Service::Freshness),
            "brand" => Ok(Service::Brand),
            other => Err(format!("unknown service '{}'", other)),
        }
    }
}

/// Overall job outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    /// Every selected service produced a result
    Success,
    /// Some services produced nothing
    Warning,
    /// No service produced anything
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrSection {
    pub text: String,
    pub product_info: ProductInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountSection {
    #[serde(flatten)]
    pub result: CountResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreshnessSection {
    #[serde(flatten)]
    pub result: FreshnessResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrandSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<HybridResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-service results; only selected services are present
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceResults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ocr: Option<OcrSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_count: Option<CountSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub freshness: Option<FreshnessSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brand: Option<BrandSection>,
}

impl ServiceResults {
    /// Whether a selected service produced a usable result
    pub fn succeeded(&self, service: Service) -> bool {
        match service {
            Service::Ocr => self.ocr.as_ref().is_some_and(|s| !s.text.trim().is_empty()),
            Service::ProductCount => self.product_count.as_ref().is_some_and(|s| s.result.total > 0),
            Service::Freshness => self
                .freshness
                .as_ref()
                .is_some_and(|s| s.result.label != FreshnessLabel::Unknown),
            Service::Brand => self
                .brand
                .as_ref()
                .and_then(|s| s.result.as_ref())
                .is_some_and(|r| !r.candidates.is_empty()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub job_id: String,
    pub status: JobStatus,
    pub services: Vec<Service>,
    pub results: ServiceResults,
    /// Unix timestamp (seconds)
    pub processed_at: u64,
}

/// Input of one analysis job
#[derive(Debug, Clone, Default)]
pub struct AnalysisRequest {
    /// Encoded image (PNG, JPEG, ...)
    pub image_bytes: Vec<u8>,
    /// Text already extracted from the image
    pub ocr_text: String,
    /// Services to run; empty means all
    pub services: Vec<Service>,
    pub thresholds: DetectionThresholds,
}

/// Runs analysis jobs against shared service instances
pub struct Analyzer {
    counter: ProductCounter,
    freshness: FreshnessScorer,
    product_info: ProductInfoExtractor,
    brands: Arc<HybridDetector>,
}

impl Analyzer {
    pub fn new(
        counter: ProductCounter,
        freshness: FreshnessScorer,
        product_info: ProductInfoExtractor,
        brands: Arc<HybridDetector>,
    ) -> Self {
        Self {
            counter,
            freshness,
            product_info,
            brands,
        }
    }

    pub fn run(&self, request: &AnalysisRequest) -> AnalysisReport {
        let job_id = format!("job_{}", uuid::Uuid::new_v4().simple());
        let services = selected_services(&request.services);
        info!("Starting {} with services {:?}", job_id, services);

        let image = if request.image_bytes.is_empty() {
            Err("no image provided".to_string())
        } else {
            decode_image(&request.image_bytes)
                .map(Arc::new)
                .map_err(|e| format!("invalid image: {}", e))
        };

        let mut results = ServiceResults::default();
        for &service in &services {
            match service {
                Service::Ocr => {
                    results.ocr = Some(OcrSection {
                        text: request.ocr_text.trim().to_string(),
                        product_info: self.product_info.extract(&request.ocr_text),
                    });
                }
                Service::ProductCount => results.product_count = Some(self.count(&image)),
                Service::Freshness => results.freshness = Some(self.score_freshness(&image)),
                Service::Brand => results.brand = Some(self.detect_brand(&image, request)),
            }
        }

        let failed: Vec<Service> = services.iter().copied().filter(|s| !results.succeeded(*s)).collect();
        let status = job_status(failed.len(), services.len());
        if !failed.is_empty() {
            warn!("{}: services without results: {:?}", job_id, failed);
        }
        info!("Finished {} with status {:?}", job_id, status);

        AnalysisReport {
            job_id,
            status,
            services,
            results,
            processed_at: crate::storage::unix_timestamp(),
        }
    }

    fn count(&self, image: &Result<Arc<DynamicImage>, String>) -> CountSection {
        match image {
            Ok(image) => CountSection {
                result: self.counter.count(image),
                error: None,
            },
            Err(e) => CountSection {
                result: CountResult {
                    total: 0,
                    detections: Vec::new(),
                },
                error: Some(e.clone()),
            },
        }
    }

    fn score_freshness(&self, image: &Result<Arc<DynamicImage>, String>) -> FreshnessSection {
        match image {
            Ok(image) => FreshnessSection {
                result: self.freshness.score(image),
                error: None,
            },
            Err(e) => FreshnessSection {
                result: FreshnessResult::unknown(),
                error: Some(e.clone()),
            },
        }
    }

    fn detect_brand(&self, image: &Result<Arc<DynamicImage>, String>, request: &AnalysisRequest) -> BrandSection {
        match image {
            Ok(image) => BrandSection {
                result: Some(
                    self.brands
                        .detect_image(Some(image.clone()), &request.ocr_text, request.thresholds),
                ),
                error: None,
            },
            // Text alone can still identify the brand when no image was sent
            Err(_) if request.image_bytes.is_empty() => BrandSection {
                result: Some(self.brands.detect_image(None, &request.ocr_text, request.thresholds)),
                error: None,
            },
            Err(e) => BrandSection {
                result: None,
                error: Some(e.clone()),
            },
        }
    }
}

/// Requested services in first-seen order without duplicates; all when empty
fn selected_services(requested: &[Service]) -> Vec<Service> {
    if requested.is_empty() {
        return Service::all().to_vec();
    }
    let mut services = Vec::new();
    for service in requested {
        if !services.contains(service) {
            services.push(*service);
        }
    }
    services
}

fn job_status(failed: usize, selected: usize) -> JobStatus {
    if failed == selected {
        JobStatus::Failed
    } else if failed > 0 {
        JobStatus::Warning
    } else {
        JobStatus::Success
    }
}
