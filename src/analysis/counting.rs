//! Product counting
//!
//! Counts distinct items on a shelf or table image by contour detection:
//! grayscale, Gaussian blur, inverse adaptive mean threshold, then the
//! outer contours whose polygon area exceeds a minimum.

use anyhow::{Context, Result};
use base64::Engine;
use image::{DynamicImage, GrayImage, ImageFormat, Luma, Rgb, RgbImage};
use imageproc::contours::{find_contours, BorderType};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::filter::{box_filter, gaussian_blur_f32};
use imageproc::rect::Rect;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use tracing::debug;

use crate::vision::decode_image;

const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);

/// Counting parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CountingConfig {
    /// Contours with a smaller polygon area are ignored (pixels)
    pub min_contour_area: f64,
    /// Gaussian blur sigma; 0 disables blurring
    pub blur_sigma: f32,
    /// Radius of the adaptive threshold neighbourhood
    pub block_radius: u32,
    /// A pixel is foreground when it is at least this much darker than its neighbourhood
    pub offset: i32,
}

impl Default for CountingConfig {
    fn default() -> Self {
        Self {
            min_contour_area: 500.0,
            blur_sigma: 1.1,
            block_radius: 5,
            offset: 2,
        }
    }
}

/// Axis-aligned box around one counted item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// Polygon area of the item's contour
    pub area: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountResult {
    pub total: usize,
    /// Boxes in raster scan order
    pub detections: Vec<BoundingBox>,
}

/// Count of a base64 camera frame, optionally with the annotated frame
#[derive(Debug, Clone, Serialize)]
pub struct FrameCount {
    #[serde(flatten)]
    pub count: CountResult,
    /// `data:image/jpeg;base64,...` of the frame with boxes drawn
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotated_frame: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ProductCounter {
    config: CountingConfig,
}

impl ProductCounter {
    pub fn new(config: CountingConfig) -> Self {
        Self { config }
    }

    /// Foreground mask: pixels darker than their local mean by `offset`
    pub fn threshold_mask(&self, image: &DynamicImage) -> GrayImage {
        let gray = image.to_luma8();
        let blurred = if self.config.blur_sigma > 0.0 {
            gaussian_blur_f32(&gray, self.config.blur_sigma)
        } else {
            gray
        };

        let radius = self.config.block_radius.max(1);
        let local_mean = box_filter(&blurred, radius, radius);

        GrayImage::from_fn(blurred.width(), blurred.height(), |x, y| {
            let value = blurred.get_pixel(x, y).0[0] as i32;
            let mean = local_mean.get_pixel(x, y).0[0] as i32;
            if value <= mean - self.config.offset {
                Luma([255])
            } else {
                Luma([0])
            }
        })
    }

    pub fn count(&self, image: &DynamicImage) -> CountResult {
        let mask = self.threshold_mask(image);

        let detections: Vec<BoundingBox> = find_contours::<u32>(&mask)
            .into_iter()
            .filter(|contour| contour.parent.is_none() && matches!(contour.border_type, BorderType::Outer))
            .filter_map(|contour| {
                let points: Vec<(f64, f64)> = contour.points.iter().map(|p| (p.x as f64, p.y as f64)).collect();
                let area = polygon_area(&points);
                if area <= self.config.min_contour_area {
                    return None;
                }
                bounding_box(&contour.points.iter().map(|p| (p.x, p.y)).collect::<Vec<_>>(), area)
            })
            .collect();

        debug!("Counted {} products in {}x{} image", detections.len(), image.width(), image.height());

        CountResult {
            total: detections.len(),
            detections,
        }
    }

    /// Copy of `image` with a 2px box around every detection
    pub fn annotate(&self, image: &DynamicImage, result: &CountResult) -> RgbImage {
        let mut canvas = image.to_rgb8();
        for det in &result.detections {
            draw_hollow_rect_mut(
                &mut canvas,
                Rect::at(det.x as i32, det.y as i32).of_size(det.width.max(1), det.height.max(1)),
                BOX_COLOR,
            );
            if det.width > 2 && det.height > 2 {
                draw_hollow_rect_mut(
                    &mut canvas,
                    Rect::at(det.x as i32 + 1, det.y as i32 + 1).of_size(det.width - 2, det.height - 2),
                    BOX_COLOR,
                );
            }
        }
        canvas
    }

    /// Count a base64 encoded frame (plain or `data:` URL)
    pub fn count_frame(&self, frame: &str, annotate: bool) -> Result<FrameCount> {
        let payload = match frame.split_once(',') {
            Some((header, data)) if header.starts_with("data:") => data,
            _ => frame,
        };

        let bytes = base64::engine::general_purpose::STANDARD
            .decode(payload.trim())
            .context("Frame is not valid base64")?;
        let image = decode_image(&bytes).context("Failed to decode frame")?;

        let count = self.count(&image);
        let annotated_frame = if annotate {
            let annotated = DynamicImage::ImageRgb8(self.annotate(&image, &count));
            let mut jpeg = Vec::new();
            annotated
                .write_to(&mut Cursor::new(&mut jpeg), ImageFormat::Jpeg)
                .context("Failed to encode annotated frame")?;
            Some(format!(
                "data:image/jpeg;base64,{}",
                base64::engine::general_purpose::STANDARD.encode(&jpeg)
            ))
        } else {
            None
        };

        Ok(FrameCount { count, annotated_frame })
    }
}

/// Shoelace area of a closed polygon
fn polygon_area(points: &[(f64, f64)]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let twice: f64 = points
        .iter()
        .zip(points.iter().cycle().skip(1))
        .map(|((x1, y1), (x2, y2))| x1 * y2 - x2 * y1)
        .sum();
    twice.abs() / 2.0
}

fn bounding_box(points: &[(u32, u32)], area: f64) -> Option<BoundingBox> {
    let min_x = points.iter().map(|p| p.0).min()?;
    let max_x = points.iter().map(|p| p.0).max()?;
    let min_y = points.iter().map(|p| p.1).min()?;
    let max_y = points.iter().map(|p| p.1).max()?;

    Some(BoundingBox {
        x: min_x,
        y: min_y,
        width: max_x - min_x + 1,
        height: max_y - min_y + 1,
        area,
    })
}
