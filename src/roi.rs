//! Region-of-Interest Extraction
//!
//! Finds the circular optical field in a microscopy photo and crops a tight
//! box around it. When no circle is found the result is a centered square of
//! side `min(width, height)`. Extraction never fails.

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, GrayImage, Luma};
use imageproc::filter::median_filter;
use tracing::debug;

use crate::config::CropPolicy;
use crate::error::ReportError;
use crate::hough::{detect_circles, Circle, HoughParams};

/// In-memory image. Pipeline stages never mutate one; they produce new ones.
pub type RasterImage = DynamicImage;

/// Detection runs on a copy whose longer side is at most this many pixels.
pub const DETECTION_MAX_SIDE: u32 = 1024;

/// Median window radius (5x5 window).
const MEDIAN_RADIUS: u32 = 2;

/// Axis-aligned crop rectangle in source pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// How a crop was chosen.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CropSource {
    Circle(Circle),
    CenterFallback,
}

#[derive(Debug, Clone)]
pub struct RoiExtractor {
    params: HoughParams,
    policy: CropPolicy,
    detection_max_side: u32,
}

impl RoiExtractor {
    pub fn new(params: HoughParams, policy: CropPolicy) -> Self {
        Self {
            params,
            policy,
            detection_max_side: DETECTION_MAX_SIDE,
        }
    }

    pub fn with_policy(policy: CropPolicy) -> Self {
        Self::new(HoughParams::default(), policy)
    }

    /// Crop `image` to its region of interest.
    ///
    /// The output keeps the input's pixel format.
    ///
    /// # Panics
    ///
    /// Panics if `image` has zero width or height.
    pub fn extract(&self, image: &RasterImage) -> RasterImage {
        let (crop, _) = self.locate(image);
        image.crop_imm(crop.x, crop.y, crop.width, crop.height)
    }

    /// Compute the crop box without copying pixels.
    ///
    /// # Panics
    ///
    /// Panics if `image` has zero width or height.
    pub fn locate(&self, image: &RasterImage) -> (CropBox, CropSource) {
        let (w, h) = image.dimensions();
        assert!(w > 0 && h > 0, "ROI extraction requires a non-empty image, got {w}x{h}");

        let (working, scale) = detection_copy(image, self.detection_max_side);
        let gray = median_filter(&to_luminance(&working), MEDIAN_RADIUS, MEDIAN_RADIUS);

        if let Some(found) = detect_circles(&gray, &self.params).first() {
            let circle = scale.to_source(found);
            if let Some(crop) = circle_crop(&circle, w, h, self.policy) {
                debug!(
                    x = circle.x,
                    y = circle.y,
                    r = circle.radius,
                    crop = format!("{}x{}", crop.width, crop.height),
                    "Circle detected"
                );
                return (crop, CropSource::Circle(circle));
            }
        }

        let crop = center_square(w, h);
        debug!(side = crop.width, "No circle detected, using center crop");
        (crop, CropSource::CenterFallback)
    }
}

impl Default for RoiExtractor {
    fn default() -> Self {
        Self::new(HoughParams::default(), CropPolicy::default())
    }
}

/// Crop with default detector settings. See [`RoiExtractor::extract`].
pub fn extract(image: &RasterImage) -> RasterImage {
    RoiExtractor::default().extract(image)
}

/// Decode PNG/JPEG bytes. `index` is the 1-based slot, used in the error.
pub fn decode_image(index: usize, bytes: &[u8]) -> Result<RasterImage, ReportError> {
    image::load_from_memory(bytes).map_err(|e| ReportError::InvalidImage {
        index,
        reason: e.to_string(),
    })
}

/// Downsample so the longer side is at most `max_side`, keeping aspect ratio.
///
/// Images already within bounds are returned unchanged.
pub fn resize_to_max_side(image: &RasterImage, max_side: u32) -> RasterImage {
    let (w, h) = image.dimensions();
    let (nw, nh) = fit_within(w, h, max_side);
    if (nw, nh) == (w, h) {
        return image.clone();
    }
    image.resize_exact(nw, nh, FilterType::Lanczos3)
}

/// ITU-R BT.601 luminance, matching the usual camera-pipeline weights.
pub fn to_luminance(image: &RasterImage) -> GrayImage {
    let rgb = image.to_rgb8();
    GrayImage::from_fn(rgb.width(), rgb.height(), |x, y| {
        let p = rgb.get_pixel(x, y);
        let luma = 0.299 * p.0[0] as f32 + 0.587 * p.0[1] as f32 + 0.114 * p.0[2] as f32;
        Luma([luma.round().min(255.0) as u8])
    })
}

/// Dimensions scaled so neither side exceeds `max_side`. Never upscales.
pub fn fit_within(width: u32, height: u32, max_side: u32) -> (u32, u32) {
    let longest = width.max(height);
    if longest <= max_side || longest == 0 {
        return (width, height);
    }
    let scale = max_side as f64 / longest as f64;
    let nw = ((width as f64 * scale).round() as u32).clamp(1, max_side);
    let nh = ((height as f64 * scale).round() as u32).clamp(1, max_side);
    (nw, nh)
}

/// Per-axis factors mapping detection-copy coordinates back to the source.
#[derive(Debug, Clone, Copy, PartialEq)]
struct AxisScale {
    x: f32,
    y: f32,
}

impl AxisScale {
    const IDENTITY: Self = Self { x: 1.0, y: 1.0 };

    /// Rounding in `fit_within` can make the two axes differ slightly.
    fn between(source: (u32, u32), copy: (u32, u32)) -> Self {
        Self {
            x: source.0 as f32 / copy.0 as f32,
            y: source.1 as f32 / copy.1 as f32,
        }
    }

    fn to_source(self, found: &Circle) -> Circle {
        Circle {
            x: found.x * self.x,
            y: found.y * self.y,
            radius: found.radius * (self.x + self.y) / 2.0,
            votes: found.votes,
        }
    }
}

fn detection_copy(image: &RasterImage, max_side: u32) -> (RasterImage, AxisScale) {
    let (w, h) = image.dimensions();
    let (nw, nh) = fit_within(w, h, max_side);
    if (nw, nh) == (w, h) {
        return (image.clone(), AxisScale::IDENTITY);
    }
    (
        image.resize_exact(nw, nh, FilterType::Triangle),
        AxisScale::between((w, h), (nw, nh)),
    )
}

/// Bounding box `[x-r, x+r] x [y-r, y+r]` clamped to the image.
///
/// Returns `None` when clamping leaves no area.
pub fn circle_crop(circle: &Circle, width: u32, height: u32, policy: CropPolicy) -> Option<CropBox> {
    let (x, y, r) = (circle.x.round() as i64, circle.y.round() as i64, circle.radius.round() as i64);
    let x1 = (x - r).max(0);
    let y1 = (y - r).max(0);
    let x2 = (x + r).min(width as i64);
    let y2 = (y + r).min(height as i64);
    if x2 <= x1 || y2 <= y1 {
        return None;
    }

    let mut crop = CropBox {
        x: x1 as u32,
        y: y1 as u32,
        width: (x2 - x1) as u32,
        height: (y2 - y1) as u32,
    };

    if policy == CropPolicy::Square && crop.width != crop.height {
        let side = crop.width.min(crop.height) as i64;
        // Center on the circle, then slide back inside the clamped box.
        let sx = (x - side / 2).clamp(x1, x2 - side);
        let sy = (y - side / 2).clamp(y1, y2 - side);
        crop = CropBox {
            x: sx as u32,
            y: sy as u32,
            width: side as u32,
            height: side as u32,
        };
    }

    Some(crop)
}

/// Centered square of side `min(width, height)`.
pub fn center_square(width: u32, height: u32) -> CropBox {
    let side = width.min(height);
    CropBox {
        x: (width - side) / 2,
        y: (height - side) / 2,
        width: side,
        height: side,
    }
}
