//! Application Configuration
//!
//! Detection thresholds, service parameters and data locations stored in
//! TOML format. Every section and field is optional in the file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::analysis::{CountingConfig, FreshnessConfig};
use crate::brand::{DetectionThresholds, TextMatchConfig, VisualConfig};
use crate::vision::EncoderKind;

/// Application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Data locations
    pub general: GeneralConfig,
    /// Hybrid detection thresholds
    pub detection: DetectionConfig,
    /// Text stage parameters
    pub text_match: TextMatchConfig,
    /// Visual stage parameters
    pub visual: VisualConfig,
    /// Image encoder selection
    pub encoder: EncoderConfig,
    /// Product counting parameters
    pub counting: CountingConfig,
    /// Freshness classifier parameters
    pub freshness: FreshnessConfig,
}

/// Data locations; unset paths fall back to the platform directories
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Brand table (JSON array of brand records)
    pub brands_file: Option<PathBuf>,
    /// Reference logos, one subdirectory per brand id
    pub reference_dir: Option<PathBuf>,
    /// Reference embedding cache
    pub cache_dir: Option<PathBuf>,
    /// ONNX model files
    pub models_dir: Option<PathBuf>,
}

/// Default thresholds applied when a caller does not pass its own
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Minimum text confidence to skip the visual stage
    pub ocr_threshold: f32,
    /// Minimum visual similarity to accept a visual match
    pub visual_threshold: f32,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        let thresholds = DetectionThresholds::default();
        Self {
            ocr_threshold: thresholds.ocr,
            visual_threshold: thresholds.visual,
        }
    }
}

impl DetectionConfig {
    pub fn thresholds(&self) -> DetectionThresholds {
        DetectionThresholds {
            ocr: self.ocr_threshold,
            visual: self.visual_threshold,
        }
    }
}

/// Image encoder settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Encoder backend
    pub kind: EncoderKind,
    /// Try GPU execution for ONNX models
    pub use_gpu: bool,
    /// Version tag of the CLIP model; combined with the model file checksum in cache keys
    pub model_version: String,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            kind: EncoderKind::Clip,
            use_gpu: false,
            model_version: "clip-vit-b32".to_string(),
        }
    }
}

/// Default location of the configuration file
pub fn default_config_path() -> Result<PathBuf> {
    Ok(crate::storage::get_config_dir()?.join("config.toml"))
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {:?}", path))?;
    let config: AppConfig =
        toml::from_str(&content).with_context(|| format!("Failed to parse config {:?}", path))?;
    debug!("Loaded config from {:?}", path);
    Ok(config)
}

/// Load configuration, using defaults when the file does not exist
pub fn load_or_default(path: &Path) -> Result<AppConfig> {
    if path.exists() {
        load_config(path)
    } else {
        info!("No config at {:?}, using defaults", path);
        Ok(AppConfig::default())
    }
}

/// Save configuration to file
pub fn save_config(config: &AppConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)?;
    crate::storage::write_atomic(path, content.as_bytes())
        .with_context(|| format!("Failed to write config {:?}", path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_app_config() {
        let config = AppConfig::default();

        // Detection defaults
        assert!((config.detection.ocr_threshold - 0.70).abs() < 1e-6);
        assert!((config.detection.visual_threshold - 0.60).abs() < 1e-6);

        // Stage defaults
        assert!((config.text_match.noise_floor - 0.1).abs() < 1e-6);
        assert_eq!(config.text_match.min_fuzzy_len, 4);
        assert!((config.visual.noise_floor - 0.3).abs() < 1e-6);
        assert_eq!(config.visual.encode_timeout_ms, 5000);

        // Services
        assert_eq!(config.encoder.kind, EncoderKind::Clip);
        assert_eq!(config.counting.min_contour_area, 500.0);
        assert!((config.freshness.threshold - 0.5).abs() < 1e-6);
        assert!(config.general.brands_file.is_none());
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let config = AppConfig::default();

        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.detection.ocr_threshold, parsed.detection.ocr_threshold);
        assert_eq!(config.encoder.model_version, parsed.encoder.model_version);
        assert_eq!(config.counting, parsed.counting);
        assert_eq!(config.visual, parsed.visual);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let toml_str = r#"
            [detection]
            ocr_threshold = 0.85

            [encoder]
            kind = "thumbnail"

            [general]
            reference_dir = "/srv/logos"
        "#;
        let parsed: AppConfig = toml::from_str(toml_str).unwrap();

        assert!((parsed.detection.ocr_threshold - 0.85).abs() < 1e-6);
        assert!((parsed.detection.visual_threshold - 0.60).abs() < 1e-6);
        assert_eq!(parsed.encoder.kind, EncoderKind::Thumbnail);
        assert_eq!(parsed.encoder.model_version, "clip-vit-b32");
        assert_eq!(parsed.general.reference_dir, Some(PathBuf::from("/srv/logos")));

        let thresholds = parsed.detection.thresholds();
        assert!((thresholds.ocr - 0.85).abs() < 1e-6);
    }

    #[test]
    fn test_save_and_load_config() {
        let mut config = AppConfig::default();
        config.general.cache_dir = Some(PathBuf::from("/tmp/product-lens-cache"));
        config.visual.encode_timeout_ms = 1500;

        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        save_config(&config, &path).unwrap();

        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded.general.cache_dir, config.general.cache_dir);
        assert_eq!(loaded.visual.encode_timeout_ms, 1500);
    }

    #[test]
    fn test_load_config_file_not_found() {
        let result = load_config(Path::new("/nonexistent/path/config.toml"));
        assert!(result.is_err());

        let config = load_or_default(Path::new("/nonexistent/path/config.toml")).unwrap();
        assert_eq!(config.visual.encode_timeout_ms, 5000);
    }

    #[test]
    fn test_load_config_invalid_toml() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "this is not valid toml {{{{").unwrap();

        let result = load_config(temp_file.path());
        assert!(result.is_err());
    }
}
