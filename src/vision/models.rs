//! Model management for ONNX Runtime
//!
//! Handles downloading, caching, and loading of the CLIP vision encoder and
//! the freshness classifier.

use anyhow::{Context, Result};
use futures_util::StreamExt;
use ndarray::Array4;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

/// Environment variable that disables model downloads
pub const OFFLINE_ENV: &str = "PRODUCT_LENS_OFFLINE";

/// Hex digits of the model checksum used in fingerprints
const FINGERPRINT_LEN: usize = 12;

/// Model files managed by [`ModelManager`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelType {
    /// CLIP ViT-B/32 vision tower (image -> 512-d embedding)
    ClipVision,
    /// Binary fresh / not-fresh classifier
    Freshness,
}

impl ModelType {
    /// Get the filename for this model type
    pub fn filename(&self) -> &'static str {
        match self {
            ModelType::ClipVision => "clip-vit-b32-vision.onnx",
            ModelType::Freshness => "freshness.onnx",
        }
    }

    /// Download URL, if the model is publicly hosted
    pub fn download_url(&self) -> Option<&'static str> {
        match self {
            ModelType::ClipVision => {
                Some("https://huggingface.co/Qdrant/clip-ViT-B-32-vision/resolve/main/model.onnx")
            }
            // Trained in-house; must be placed manually
            ModelType::Freshness => None,
        }
    }

    /// Plausible file size for integrity check (in bytes)
    pub fn expected_size_range(&self) -> (u64, u64) {
        match self {
            ModelType::ClipVision => (50_000_000, 1_000_000_000),
            ModelType::Freshness => (1_000, 1_000_000_000),
        }
    }

    /// Display name for progress reporting
    pub fn display_name(&self) -> &'static str {
        match self {
            ModelType::ClipVision => "CLIP Vision Encoder",
            ModelType::Freshness => "Freshness Classifier",
        }
    }

    pub fn all() -> [ModelType; 2] {
        [ModelType::ClipVision, ModelType::Freshness]
    }
}

/// Model manifest tracking downloaded models
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ModelManifest {
    pub version: String,
    pub models: Vec<ModelInfo>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ModelInfo {
    pub model_type: String,
    pub filename: String,
    pub size_bytes: u64,
    pub sha256: Option<String>,
    pub downloaded_at: u64,
}

impl Default for ModelManifest {
    fn default() -> Self {
        Self {
            version: "1.0.0".to_string(),
            models: Vec::new(),
        }
    }
}

/// Status row for one model
#[derive(Debug, Clone, serde::Serialize)]
pub struct ModelStatus {
    pub name: &'static str,
    pub path: PathBuf,
    pub available: bool,
    pub size_bytes: Option<u64>,
}

/// Model manager for downloading and caching ONNX models
pub struct ModelManager {
    models_dir: PathBuf,
}

impl ModelManager {
    /// Create a model manager under the application data directory
    pub fn new() -> Result<Self> {
        let data_dir = crate::storage::get_data_dir()?;
        Self::with_dir(data_dir.join("models"))
    }

    /// Create model manager with custom directory
    pub fn with_dir(models_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&models_dir)
            .with_context(|| format!("Failed to create models directory {:?}", models_dir))?;
        Ok(Self { models_dir })
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Get the path to a specific model file
    pub fn model_path(&self, model_type: ModelType) -> PathBuf {
        self.models_dir.join(model_type.filename())
    }

    /// Check if a model is present with a plausible size
    pub fn is_model_available(&self, model_type: ModelType) -> bool {
        match std::fs::metadata(self.model_path(model_type)) {
            Ok(metadata) => {
                let (min, max) = model_type.expected_size_range();
                (min..=max).contains(&metadata.len())
            }
            Err(_) => false,
        }
    }

    /// Get status of all models
    pub fn model_status(&self) -> Vec<ModelStatus> {
        ModelType::all()
            .iter()
            .map(|&model_type| {
                let path = self.model_path(model_type);
                let size_bytes = std::fs::metadata(&path).ok().map(|m| m.len());
                ModelStatus {
                    name: model_type.display_name(),
                    available: self.is_model_available(model_type),
                    path,
                    size_bytes,
                }
            })
            .collect()
    }

    /// Download a model if not already available; returns the model path
    pub fn ensure_model(&self, model_type: ModelType) -> Result<PathBuf> {
        let path = self.model_path(model_type);

        if self.is_model_available(model_type) {
            debug!("Model {:?} already available at {:?}", model_type, path);
            return Ok(path);
        }

        let Some(url) = model_type.download_url() else {
            anyhow::bail!(
                "{} is not downloadable; place it manually at {:?}",
                model_type.display_name(),
                path
            );
        };

        if std::env::var(OFFLINE_ENV).is_ok() {
            anyhow::bail!(
                "Offline mode: cannot download models. Download {} manually and place it at {:?}",
                url,
                path
            );
        }

        info!("Downloading {} model from {}", model_type.display_name(), url);

        let rt = Runtime::new().context("Failed to create tokio runtime")?;
        let sha256 = rt.block_on(download_file(url, &path))?;

        if !self.is_model_available(model_type) {
            anyhow::bail!("Download completed but model size verification failed");
        }

        self.update_manifest(model_type, sha256)?;
        info!("Successfully downloaded {} model", model_type.display_name());
        Ok(path)
    }

    /// Download every publicly hosted model
    pub fn ensure_downloadable_models(&self) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        for model_type in ModelType::all() {
            if model_type.download_url().is_none() {
                if !self.is_model_available(model_type) {
                    warn!(
                        "{} must be placed manually at {:?}",
                        model_type.display_name(),
                        self.model_path(model_type)
                    );
                }
                continue;
            }
            paths.push(self.ensure_model(model_type)?);
        }
        Ok(paths)
    }

    /// Short content hash of an installed model file
    ///
    /// The file is hashed on every call so a replaced model is always
    /// noticed; the manifest is updated when it disagrees, which also covers
    /// manually placed files.
    pub fn model_fingerprint(&self, model_type: ModelType) -> Result<String> {
        let path = self.model_path(model_type);
        let sha256 = hash_file(&path)?;

        let recorded = self
            .load_manifest()
            .ok()
            .and_then(|m| m.models.into_iter().find(|info| info.filename == model_type.filename()))
            .and_then(|info| info.sha256);
        if recorded.as_deref() != Some(sha256.as_str()) {
            info!("Recording new checksum for {} model", model_type.display_name());
            if let Err(e) = self.update_manifest(model_type, sha256.clone()) {
                warn!("Failed to update model manifest: {:#}", e);
            }
        }

        Ok(sha256[..FINGERPRINT_LEN].to_string())
    }

    fn update_manifest(&self, model_type: ModelType, sha256: String) -> Result<()> {
        let mut manifest = self.load_manifest().unwrap_or_default();
        let metadata = std::fs::metadata(self.model_path(model_type))?;

        let model_info = ModelInfo {
            model_type: format!("{:?}", model_type),
            filename: model_type.filename().to_string(),
            size_bytes: metadata.len(),
            sha256: Some(sha256),
            downloaded_at: crate::storage::unix_timestamp(),
        };

        if let Some(existing) = manifest.models.iter_mut().find(|m| m.filename == model_info.filename) {
            *existing = model_info;
        } else {
            manifest.models.push(model_info);
        }

        self.save_manifest(&manifest)
    }

    /// Load the model manifest
    pub fn load_manifest(&self) -> Result<ModelManifest> {
        let manifest_path = self.models_dir.join("manifest.json");
        if manifest_path.exists() {
            let content = std::fs::read_to_string(&manifest_path)?;
            Ok(serde_json::from_str(&content)?)
        } else {
            Ok(ModelManifest::default())
        }
    }

    /// Save the model manifest
    pub fn save_manifest(&self, manifest: &ModelManifest) -> Result<()> {
        let content = serde_json::to_string_pretty(manifest)?;
        crate::storage::write_atomic(&self.models_dir.join("manifest.json"), content.as_bytes())?;
        Ok(())
    }
}

/// SHA-256 of a file as lowercase hex
fn hash_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path).with_context(|| format!("Failed to open model {:?}", path))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1 << 16];
    loop {
        let read = file
            .read(&mut buffer)
            .with_context(|| format!("Failed to read model {:?}", path))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Stream `url` into `path` via a temp file; returns the SHA-256 of the body
async fn download_file(url: &str, path: &Path) -> Result<String> {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(600))
        .build()
        .context("Failed to create HTTP client")?;

    let response = client
        .get(url)
        .send()
        .await
        .context("Failed to send download request")?;

    if !response.status().is_success() {
        anyhow::bail!("Download failed with status {}: {}", response.status(), url);
    }

    let total_size = response.content_length();
    debug!("Download size: {:?} bytes", total_size);

    let temp_path = path.with_extension("tmp");
    let mut file = std::fs::File::create(&temp_path).context("Failed to create temp file")?;

    let mut hasher = Sha256::new();
    let mut downloaded: u64 = 0;
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("Error reading download stream")?;
        file.write_all(&chunk).context("Failed to write to temp file")?;
        hasher.update(&chunk);
        downloaded += chunk.len() as u64;
    }

    file.flush().context("Failed to flush temp file")?;
    drop(file);
    debug!("Downloaded {} / {:?} bytes", downloaded, total_size);

    std::fs::rename(&temp_path, path).context("Failed to move downloaded file to final location")?;

    Ok(format!("{:x}", hasher.finalize()))
}

/// ONNX Runtime session wrapper for single-image models
pub struct OnnxSession {
    session: Session,
    input_name: String,
    output_name: String,
}

impl OnnxSession {
    /// Load a model, reading `preferred_output` when the model exposes it
    pub fn new(model_path: &Path, preferred_output: Option<&str>, use_gpu: bool) -> Result<Self> {
        info!("Loading ONNX model from {:?}", model_path);

        let builder = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?;

        #[cfg(target_os = "windows")]
        let builder = if use_gpu {
            use ort::execution_providers::DirectMLExecutionProvider;
            match builder.with_execution_providers([DirectMLExecutionProvider::default().build()]) {
                Ok(builder) => {
                    info!("DirectML GPU acceleration enabled");
                    builder
                }
                Err(e) => {
                    warn!("DirectML not available, using CPU: {}", e);
                    Session::builder()?
                        .with_optimization_level(GraphOptimizationLevel::Level3)?
                        .with_intra_threads(4)?
                }
            }
        } else {
            builder
        };

        #[cfg(not(target_os = "windows"))]
        if use_gpu {
            debug!("GPU execution provider not configured on this platform, using CPU");
        }

        let session = builder
            .commit_from_file(model_path)
            .context("Failed to load ONNX model")?;

        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .context("Model has no inputs")?;

        let output_names: Vec<String> = session.outputs.iter().map(|output| output.name.clone()).collect();
        let output_name = preferred_output
            .and_then(|wanted| output_names.iter().find(|name| name.as_str() == wanted))
            .or_else(|| output_names.first())
            .cloned()
            .context("Model has no outputs")?;

        info!("Model loaded. Input: {}, Output: {} (of {:?})", input_name, output_name, output_names);

        Ok(Self {
            session,
            input_name,
            output_name,
        })
    }

    /// Run the model on one NCHW image tensor and return the flattened output
    pub fn run(&mut self, input: Array4<f32>) -> Result<Vec<f32>> {
        let tensor = Tensor::from_array(input)?;
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => tensor])
            .context("ONNX inference failed")?;

        let (_, data) = outputs[self.output_name.as_str()].try_extract_tensor::<f32>()?;
        Ok(data.to_vec())
    }

    pub fn input_name(&self) -> &str {
        &self.input_name
    }

    pub fn output_name(&self) -> &str {
        &self.output_name
    }
}
