//! Vision Layer
//!
//! Image decoding, embedding encoders and ONNX model management.
//! Supports two encoder backends:
//! - CLIP ViT-B/32 via ONNX Runtime (semantic logo similarity)
//! - Thumbnail encoder (no model file, exact-match similarity only)

pub mod clip;
pub mod encoder;
pub mod models;
pub mod preprocess;

use image::DynamicImage;

pub use clip::ClipEncoder;
pub use encoder::{cosine_similarity, l2_normalize, ImageEncoder, ThumbnailEncoder, TimedEncoder};
pub use models::{ModelManager, ModelType, OnnxSession};
pub use preprocess::{preprocess_image, PreprocessConfig};

/// Encoder backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncoderKind {
    /// CLIP vision tower (requires the model file)
    #[default]
    Clip,
    /// Mean-centered RGB thumbnail
    Thumbnail,
}

/// Decode encoded image bytes (PNG, JPEG, WebP, ...)
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage, image::ImageError> {
    image::load_from_memory(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    #[test]
    fn test_decode_png_bytes() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(3, 2, Rgb([10, 20, 30])));
        let mut bytes = Vec::new();
        image.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png).unwrap();

        let decoded = decode_image(&bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (3, 2));
        assert_eq!(decoded.to_rgb8().get_pixel(1, 1), &Rgb([10, 20, 30]));
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(decode_image(b"definitely not an image").is_err());
    }

    #[test]
    fn test_encoder_kind_serde() {
        let kind: EncoderKind = serde_json::from_str("\"thumbnail\"").unwrap();
        assert_eq!(kind, EncoderKind::Thumbnail);
        assert_eq!(serde_json::to_string(&EncoderKind::Clip).unwrap(), "\"clip\"");
    }
}
