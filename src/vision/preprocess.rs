//! Image preprocessing for ONNX image models
//!
//! Handles resizing, cropping, normalization, and tensor conversion for the
//! CLIP vision encoder and the freshness classifier.

use image::imageops::FilterType;
use image::{DynamicImage, RgbImage};
use ndarray::{Array3, Array4};

/// CLIP image normalization constants
pub const CLIP_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
pub const CLIP_STD: [f32; 3] = [0.268_629_54, 0.261_302_6, 0.275_777_1];

/// How an image is turned into a model input tensor
#[derive(Debug, Clone)]
pub struct PreprocessConfig {
    /// Square model input size (typically 224)
    pub input_size: u32,
    /// Resize shortest side then center crop (true) or stretch to fit (false)
    pub center_crop: bool,
    /// Mean values for normalization [R, G, B]
    pub mean: [f32; 3],
    /// Std values for normalization [R, G, B]
    pub std: [f32; 3],
}

impl PreprocessConfig {
    /// CLIP ViT-B/32: bicubic resize of the shortest side, center crop, CLIP stats
    pub fn clip() -> Self {
        Self {
            input_size: 224,
            center_crop: true,
            mean: CLIP_MEAN,
            std: CLIP_STD,
        }
    }

    /// Plain 0-1 scaling at a fixed size (Keras-style classifiers)
    pub fn unit_scale(input_size: u32) -> Self {
        Self {
            input_size,
            center_crop: false,
            mean: [0.0; 3],
            std: [1.0; 3],
        }
    }
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self::clip()
    }
}

/// Center square of the image scaled to `size`
///
/// Same framing as resizing the shortest side to `size` and cropping, but the
/// crop happens first so extreme aspect ratios never allocate a huge buffer.
pub fn resize_and_center_crop(image: &DynamicImage, size: u32) -> RgbImage {
    let (w, h) = (image.width(), image.height());
    let side = w.min(h);
    if side == 0 {
        return RgbImage::new(size, size);
    }

    let x = (w - side) / 2;
    let y = (h - side) / 2;
    image
        .crop_imm(x, y, side, side)
        .resize_exact(size, size, FilterType::CatmullRom)
        .to_rgb8()
}

/// Convert an RGB image to an HWC f32 array scaled to 0-1
pub fn rgb_to_f32(image: &RgbImage) -> Array3<f32> {
    let (w, h) = image.dimensions();
    Array3::from_shape_fn((h as usize, w as usize, 3), |(y, x, c)| {
        image.get_pixel(x as u32, y as u32).0[c] as f32 / 255.0
    })
}

/// Normalize with per-channel mean/std and convert HWC to NCHW (batch size 1)
pub fn to_nchw(image: &Array3<f32>, mean: &[f32; 3], std: &[f32; 3]) -> Array4<f32> {
    let (h, w, c) = image.dim();
    Array4::from_shape_fn((1, c, h, w), |(_, ch, y, x)| (image[[y, x, ch]] - mean[ch]) / std[ch])
}

/// Full pipeline: image -> normalized NCHW tensor
pub fn preprocess_image(image: &DynamicImage, config: &PreprocessConfig) -> Array4<f32> {
    let size = config.input_size;
    let rgb = if config.center_crop {
        resize_and_center_crop(image, size)
    } else {
        image.resize_exact(size, size, FilterType::Triangle).to_rgb8()
    };

    to_nchw(&rgb_to_f32(&rgb), &config.mean, &config.std)
}
