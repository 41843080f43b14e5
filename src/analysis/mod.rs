//! Analysis Services
//!
//! Independently invokable product image analyses and the job runner that
//! combines them with brand detection into one report.

pub mod counting;
pub mod freshness;
pub mod job;
pub mod product_info;

pub use counting::{BoundingBox, CountResult, CountingConfig, FrameCount, ProductCounter};
pub use freshness::{
    FreshnessConfig, FreshnessLabel, FreshnessModel, FreshnessResult, FreshnessScorer, OnnxFreshnessModel,
};
pub use job::{AnalysisReport, AnalysisRequest, Analyzer, JobStatus, Service, ServiceResults};
pub use product_info::{ProductInfo, ProductInfoExtractor};
