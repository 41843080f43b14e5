//! CLIP ViT-B/32 image encoder backed by ONNX Runtime

use image::DynamicImage;
use parking_lot::Mutex;
use std::path::Path;
use tracing::{debug, info};

use super::encoder::{l2_normalize, ImageEncoder};
use super::models::OnnxSession;
use super::preprocess::{preprocess_image, PreprocessConfig};
use crate::error::EncodeError;

/// Embedding size of the ViT-B/32 vision projection
pub const CLIP_DIMENSIONS: usize = 512;

/// Output name exported by the Qdrant CLIP vision model
const EMBEDDING_OUTPUT: &str = "image_embeds";

pub struct ClipEncoder {
    session: Mutex<OnnxSession>,
    preprocess: PreprocessConfig,
    version: String,
}

impl ClipEncoder {
    /// Load the vision tower from `model_path`
    pub fn load(model_path: &Path, model_version: &str, use_gpu: bool) -> Result<Self, EncodeError> {
        if !model_path.exists() {
            return Err(EncodeError::Unavailable(format!(
                "CLIP model not found at {:?}",
                model_path
            )));
        }

        let session = OnnxSession::new(model_path, Some(EMBEDDING_OUTPUT), use_gpu)
            .map_err(|e| EncodeError::Unavailable(format!("{:#}", e)))?;
        info!("CLIP encoder ready ({})", model_version);

        Ok(Self {
            session: Mutex::new(session),
            preprocess: PreprocessConfig::clip(),
            version: model_version.to_string(),
        })
    }
}

impl ImageEncoder for ClipEncoder {
    fn encode(&self, image: &DynamicImage) -> Result<Vec<f32>, EncodeError> {
        let input = preprocess_image(image, &self.preprocess);

        let mut vector = self
            .session
            .lock()
            .run(input)
            .map_err(|e| EncodeError::Failed(format!("{:#}", e)))?;

        if vector.len() != CLIP_DIMENSIONS {
            return Err(EncodeError::Failed(format!(
                "unexpected embedding size {} (expected {})",
                vector.len(),
                CLIP_DIMENSIONS
            )));
        }

        l2_normalize(&mut vector);
        debug!("Encoded {}x{} image with {}", image.width(), image.height(), self.version);
        Ok(vector)
    }

    fn model_version(&self) -> &str {
        &self.version
    }

    fn dimensions(&self) -> usize {
        CLIP_DIMENSIONS
    }
}
