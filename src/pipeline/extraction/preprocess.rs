//! Engine-specific image renditions and input quality checks.
//!
//! Each processing step is an independent service (orientation, rendition,
//! quality). `ProfilePreprocessor` composes them per `PreprocessProfile`:
//!
//! - CloudVision: passthrough, only downscaled when very large. The service
//!   does its own normalization.
//! - LocalDeepLearning: upscaled grayscale with normalization, contrast and
//!   sharpness boosts. Never binarized: the engine relies on stroke texture.
//! - RuleBased: grayscale, normalized, mean-threshold binarized and median
//!   filtered. The engine expects near-binary input.
//!
//! All transforms are pure: the input image is never mutated.

use std::io::Cursor;

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, GrayImage, ImageOutputFormat, Luma, RgbImage};
use tracing::debug;

use super::types::{OcrWarning, PreparedImageRef, PreprocessProfile};
use super::ExtractionError;

// ═══════════════════════════════════════════════════════════
// Constants
// ═══════════════════════════════════════════════════════════

/// Maximum input size in bytes before rejecting.
const MAX_IMAGE_BYTES: usize = 50 * 1024 * 1024; // 50 MB

/// Smallest valid PNG is ~67 bytes.
const MIN_IMAGE_BYTES: usize = 67;

/// No rendition ever exceeds this long edge.
pub const SAFETY_MAX_LONG_EDGE: u32 = 4096;

/// No rendition ever exceeds this pixel count.
pub const SAFETY_MAX_PIXELS: u64 = 24_000_000;

/// Long edge of the image used for quality and stroke metrics.
const METRIC_MAX_EDGE: u32 = 1024;

/// Laplacian variance below this = blurry (tuned at ~1000px).
const BLUR_THRESHOLD: f32 = 100.0;

/// RMS contrast below this = poor contrast (near-uniform image).
const CONTRAST_THRESHOLD: f32 = 25.0;

// ═══════════════════════════════════════════════════════════
// Rendition recipes
// ═══════════════════════════════════════════════════════════

/// What a profile does to the source image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenditionRecipe {
    /// Upscale so the long edge reaches this value (never downscales).
    pub upscale_long_edge: Option<u32>,
    /// Downscale when the long edge exceeds this value.
    pub downscale_above: Option<u32>,
    pub grayscale: bool,
    /// Min-max brightness stretch.
    pub normalize: bool,
    /// PIL-style contrast factor; 1.0 leaves the image unchanged.
    pub contrast: f32,
    /// PIL-style sharpness factor; 1.0 leaves the image unchanged.
    pub sharpness: f32,
    pub binarize: bool,
    pub median_filter: bool,
}

impl RenditionRecipe {
    pub fn for_profile(profile: PreprocessProfile) -> Self {
        match profile {
            PreprocessProfile::CloudVision => Self {
                upscale_long_edge: None,
                downscale_above: Some(3072),
                grayscale: false,
                normalize: false,
                contrast: 1.0,
                sharpness: 1.0,
                binarize: false,
                median_filter: false,
            },
            PreprocessProfile::LocalDeepLearning => Self {
                upscale_long_edge: Some(2400),
                downscale_above: None,
                grayscale: true,
                normalize: true,
                contrast: 2.0,
                sharpness: 1.8,
                binarize: false,
                median_filter: false,
            },
            PreprocessProfile::RuleBased => Self {
                upscale_long_edge: Some(1500),
                downscale_above: None,
                grayscale: true,
                normalize: true,
                contrast: 1.0,
                sharpness: 1.0,
                binarize: true,
                median_filter: true,
            },
        }
    }

    /// Output dimensions for a source of `width` x `height`, after the safety cap.
    pub fn target_dimensions(&self, width: u32, height: u32) -> (u32, u32) {
        if width == 0 || height == 0 {
            return (1, 1);
        }
        let long = width.max(height) as f32;
        let mut scale = 1.0f32;
        if let Some(target) = self.upscale_long_edge {
            if long < target as f32 {
                scale = target as f32 / long;
            }
        }
        if let Some(limit) = self.downscale_above {
            if long > limit as f32 {
                scale = limit as f32 / long;
            }
        }
        let w = ((width as f32 * scale).round() as u32).max(1);
        let h = ((height as f32 * scale).round() as u32).max(1);
        cap_dimensions(w, h)
    }
}

/// Shrink dimensions to the safety cap, preserving aspect ratio.
pub fn cap_dimensions(width: u32, height: u32) -> (u32, u32) {
    let mut scale = 1.0f64;
    let long = width.max(height) as f64;
    if long > SAFETY_MAX_LONG_EDGE as f64 {
        scale = SAFETY_MAX_LONG_EDGE as f64 / long;
    }
    let pixels = width as f64 * height as f64 * scale * scale;
    if pixels > SAFETY_MAX_PIXELS as f64 {
        scale *= (SAFETY_MAX_PIXELS as f64 / pixels).sqrt();
    }
    if scale >= 1.0 {
        return (width, height);
    }
    (
        ((width as f64 * scale).floor() as u32).max(1),
        ((height as f64 * scale).floor() as u32).max(1),
    )
}

// ═══════════════════════════════════════════════════════════
// Service traits
// ═══════════════════════════════════════════════════════════

/// Fixes image orientation from EXIF metadata.
///
/// Phone photos embed rotation in EXIF tag 0x0112; without correction a
/// portrait prescription reaches the engines sideways.
pub trait OrientationCorrector: Send + Sync {
    fn correct(&self, raw_bytes: &[u8], image: DynamicImage) -> DynamicImage;
}

/// Assesses image quality without modifying it.
pub trait QualityAssessor: Send + Sync {
    fn assess(&self, image: &RgbImage) -> QualityReport;
}

/// Produces an engine-specific rendition of a decoded image.
pub trait ImagePreprocessor: Send + Sync {
    fn prepare(
        &self,
        image: &DynamicImage,
        profile: PreprocessProfile,
    ) -> Result<PreparedImage, ExtractionError>;
}

// ═══════════════════════════════════════════════════════════
// Result types
// ═══════════════════════════════════════════════════════════

/// Quality assessment report with numeric scores.
#[derive(Debug, Default)]
pub struct QualityReport {
    pub warnings: Vec<OcrWarning>,
    /// Page appears mostly blank (>95% near-white).
    pub is_blank: bool,
    /// Page appears mostly dark (>80% near-black).
    pub is_dark: bool,
    /// Laplacian variance, higher = sharper.
    pub blur_score: f32,
    /// RMS contrast (0-255).
    pub contrast_score: f32,
}

/// An engine-ready rendition.
#[derive(Debug, Clone)]
pub struct PreparedImage {
    pub profile: PreprocessProfile,
    /// Rendition encoded as PNG, ready for any backend.
    pub png_bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Measured on the source image, identical across profiles.
    pub stroke_irregularity: f32,
}

impl PreparedImage {
    pub fn reference(&self) -> PreparedImageRef {
        PreparedImageRef {
            profile: self.profile,
            width: self.width,
            height: self.height,
            stroke_irregularity: self.stroke_irregularity,
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Decoding
// ═══════════════════════════════════════════════════════════

/// Validate, decode and orient raw image bytes.
///
/// This is the only fatal step of the pipeline: nothing can be recognized
/// from an image that does not decode.
pub fn decode_image(
    bytes: &[u8],
    orientation: &dyn OrientationCorrector,
) -> Result<DynamicImage, ExtractionError> {
    validate_image_bytes(bytes)?;
    let img = image::load_from_memory(bytes)
        .map_err(|e| ExtractionError::ImageDecode(e.to_string()))?;
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return Err(ExtractionError::ImageDecode("image has no pixels".into()));
    }
    Ok(orientation.correct(bytes, img))
}

/// Validate image bytes before decoding.
pub fn validate_image_bytes(bytes: &[u8]) -> Result<(), ExtractionError> {
    if bytes.len() < MIN_IMAGE_BYTES {
        return Err(ExtractionError::InvalidInput(
            "Image data too small to be valid".into(),
        ));
    }
    if bytes.len() > MAX_IMAGE_BYTES {
        return Err(ExtractionError::InvalidInput(format!(
            "Image data exceeds {}MB limit",
            MAX_IMAGE_BYTES / (1024 * 1024)
        )));
    }
    Ok(())
}

// ── ExifOrientationCorrector ──────────────────────────────

/// EXIF orientation values:
/// 1 = Normal, 2 = Mirrored, 3 = 180deg, 4 = Flipped V,
/// 5 = Mirrored + 90deg CW, 6 = 90deg CW, 7 = Mirrored + 270deg CW, 8 = 270deg CW
pub struct ExifOrientationCorrector;

impl OrientationCorrector for ExifOrientationCorrector {
    fn correct(&self, raw_bytes: &[u8], image: DynamicImage) -> DynamicImage {
        let orientation = read_exif_orientation(raw_bytes);
        if orientation != 1 {
            debug!(orientation, "Applying EXIF orientation");
        }
        apply_orientation(image, orientation)
    }
}

/// Read EXIF orientation tag. Returns 1 (normal) when absent.
pub fn read_exif_orientation(bytes: &[u8]) -> u32 {
    let mut cursor = Cursor::new(bytes);
    let reader = match exif::Reader::new().read_from_container(&mut cursor) {
        Ok(r) => r,
        Err(_) => return 1,
    };

    reader
        .get_field(exif::Tag::Orientation, exif::In::PRIMARY)
        .and_then(|f| f.value.get_uint(0))
        .unwrap_or(1)
}

pub fn apply_orientation(img: DynamicImage, orientation: u32) -> DynamicImage {
    match orientation {
        2 => img.fliph(),
        3 => img.rotate180(),
        4 => img.flipv(),
        5 => img.rotate90().fliph(),
        6 => img.rotate90(),
        7 => img.rotate270().fliph(),
        8 => img.rotate270(),
        _ => img,
    }
}

// ═══════════════════════════════════════════════════════════
// ProfilePreprocessor
// ═══════════════════════════════════════════════════════════

/// Production preprocessor: applies the `RenditionRecipe` of each profile.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProfilePreprocessor;

impl ImagePreprocessor for ProfilePreprocessor {
    fn prepare(
        &self,
        image: &DynamicImage,
        profile: PreprocessProfile,
    ) -> Result<PreparedImage, ExtractionError> {
        let recipe = RenditionRecipe::for_profile(profile);
        let (src_w, src_h) = image.dimensions();
        let (w, h) = recipe.target_dimensions(src_w, src_h);

        let stroke_irregularity = stroke_irregularity(&metric_view(image).to_luma8());

        let rendition = if recipe.grayscale {
            let mut gray = image.to_luma8();
            if (w, h) != (src_w, src_h) {
                gray = image::imageops::resize(&gray, w, h, FilterType::CatmullRom);
            }
            if recipe.normalize {
                gray = normalize_brightness(&gray);
            }
            if (recipe.contrast - 1.0).abs() > f32::EPSILON {
                gray = enhance_contrast(&gray, recipe.contrast);
            }
            if (recipe.sharpness - 1.0).abs() > f32::EPSILON {
                gray = enhance_sharpness(&gray, recipe.sharpness);
            }
            if recipe.binarize {
                gray = binarize_mean(&gray);
            }
            if recipe.median_filter {
                gray = median_filter_3x3(&gray);
            }
            DynamicImage::ImageLuma8(gray)
        } else {
            let mut rgb = image.to_rgb8();
            if (w, h) != (src_w, src_h) {
                rgb = image::imageops::resize(&rgb, w, h, FilterType::CatmullRom);
            }
            DynamicImage::ImageRgb8(rgb)
        };

        let png_bytes = encode_png(&rendition)?;

        debug!(
            profile = ?profile,
            source = format!("{src_w}x{src_h}"),
            output = format!("{w}x{h}"),
            png_size = png_bytes.len(),
            stroke_irregularity,
            "Rendition prepared"
        );

        Ok(PreparedImage {
            profile,
            png_bytes,
            width: w,
            height: h,
            stroke_irregularity,
        })
    }
}

/// Downscaled copy used for metrics, so their cost and scale do not depend
/// on the input resolution.
pub fn metric_view(image: &DynamicImage) -> DynamicImage {
    let (w, h) = image.dimensions();
    if w.max(h) <= METRIC_MAX_EDGE {
        return image.clone();
    }
    image.resize(METRIC_MAX_EDGE, METRIC_MAX_EDGE, FilterType::Triangle)
}

// ═══════════════════════════════════════════════════════════
// DocumentQualityAssessor
// ═══════════════════════════════════════════════════════════

/// Blank page, dark image, blur and contrast detection.
///
/// Returns warnings but never blocks recognition.
pub struct DocumentQualityAssessor;

impl QualityAssessor for DocumentQualityAssessor {
    fn assess(&self, image: &RgbImage) -> QualityReport {
        let mut report = QualityReport::default();
        let pixel_count = (image.width() as usize) * (image.height() as usize);

        if pixel_count == 0 {
            return report;
        }

        let white_pixels = image
            .pixels()
            .filter(|p| p.0.iter().all(|c| *c > 240))
            .count();
        if white_pixels as f32 / pixel_count as f32 > 0.95 {
            report.is_blank = true;
            report.warnings.push(OcrWarning::BlankPage);
        }

        let dark_pixels = image
            .pixels()
            .filter(|p| p.0.iter().all(|c| *c < 15))
            .count();
        if dark_pixels as f32 / pixel_count as f32 > 0.80 {
            report.is_dark = true;
            report.warnings.push(OcrWarning::PoorContrast);
        }

        let gray = DynamicImage::ImageRgb8(image.clone()).to_luma8();

        report.blur_score = compute_laplacian_variance(&gray);
        if report.blur_score < BLUR_THRESHOLD && !report.is_blank {
            report.warnings.push(OcrWarning::BlurryImage);
        }

        report.contrast_score = compute_contrast_score(&gray);
        if report.contrast_score < CONTRAST_THRESHOLD && !report.is_blank && !report.is_dark {
            report.warnings.push(OcrWarning::PoorContrast);
        }

        report
    }
}

// ═══════════════════════════════════════════════════════════
// Pixel operations
// ═══════════════════════════════════════════════════════════

/// Min-max stretch of intensities to the full 0-255 range.
pub fn normalize_brightness(img: &GrayImage) -> GrayImage {
    let (mut lo, mut hi) = (u8::MAX, u8::MIN);
    for p in img.pixels() {
        lo = lo.min(p.0[0]);
        hi = hi.max(p.0[0]);
    }
    if hi <= lo {
        return img.clone();
    }
    let range = (hi - lo) as f32;
    let mut out = img.clone();
    for p in out.pixels_mut() {
        p.0[0] = (((p.0[0] - lo) as f32 / range) * 255.0).round() as u8;
    }
    out
}

/// PIL `ImageEnhance.Contrast`: blend against the mean intensity.
pub fn enhance_contrast(img: &GrayImage, factor: f32) -> GrayImage {
    let count = (img.width() as u64 * img.height() as u64).max(1);
    let sum: u64 = img.pixels().map(|p| p.0[0] as u64).sum();
    let mean = (sum as f32 / count as f32 + 0.5).floor();
    let mut out = img.clone();
    for p in out.pixels_mut() {
        let v = mean + factor * (p.0[0] as f32 - mean);
        p.0[0] = v.round().clamp(0.0, 255.0) as u8;
    }
    out
}

/// PIL `ImageEnhance.Sharpness`: blend against a 3x3 smoothed copy.
/// Border pixels are left untouched.
pub fn enhance_sharpness(img: &GrayImage, factor: f32) -> GrayImage {
    let (w, h) = (img.width(), img.height());
    let mut out = img.clone();
    if w < 3 || h < 3 {
        return out;
    }
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let mut acc = 0.0f32;
            for dy in 0..3 {
                for dx in 0..3 {
                    let v = img.get_pixel(x + dx - 1, y + dy - 1).0[0] as f32;
                    acc += if dx == 1 && dy == 1 { 5.0 * v } else { v };
                }
            }
            let smooth = acc / 13.0;
            let orig = img.get_pixel(x, y).0[0] as f32;
            let v = smooth + factor * (orig - smooth);
            out.put_pixel(x, y, Luma([v.round().clamp(0.0, 255.0) as u8]));
        }
    }
    out
}

/// Threshold at the mean intensity: above = white, else black.
pub fn binarize_mean(img: &GrayImage) -> GrayImage {
    let count = (img.width() as u64 * img.height() as u64).max(1);
    let sum: u64 = img.pixels().map(|p| p.0[0] as u64).sum();
    let mean = sum as f32 / count as f32;
    let mut out = img.clone();
    for p in out.pixels_mut() {
        p.0[0] = if p.0[0] as f32 > mean { 255 } else { 0 };
    }
    out
}

/// 3x3 median filter with edge clamping.
pub fn median_filter_3x3(img: &GrayImage) -> GrayImage {
    let (w, h) = (img.width(), img.height());
    let mut out = GrayImage::new(w, h);
    let mut window = [0u8; 9];
    for y in 0..h {
        for x in 0..w {
            let mut i = 0;
            for dy in -1i64..=1 {
                for dx in -1i64..=1 {
                    let sx = (x as i64 + dx).clamp(0, w as i64 - 1) as u32;
                    let sy = (y as i64 + dy).clamp(0, h as i64 - 1) as u32;
                    window[i] = img.get_pixel(sx, sy).0[0];
                    i += 1;
                }
            }
            window.sort_unstable();
            out.put_pixel(x, y, Luma([window[4]]));
        }
    }
    out
}

/// Stroke irregularity: std of |vertical gradient| + std of |horizontal gradient|.
///
/// Printed text has uniform strokes and a low value; handwriting and pen
/// pressure variation push it up.
pub fn stroke_irregularity(img: &GrayImage) -> f32 {
    let (w, h) = (img.width(), img.height());
    let vertical = if h > 1 {
        std_dev((0..h - 1).flat_map(|y| {
            (0..w).map(move |x| {
                (img.get_pixel(x, y + 1).0[0] as f64 - img.get_pixel(x, y).0[0] as f64).abs()
            })
        }))
    } else {
        0.0
    };
    let horizontal = if w > 1 {
        std_dev((0..h).flat_map(|y| {
            (0..w - 1).map(move |x| {
                (img.get_pixel(x + 1, y).0[0] as f64 - img.get_pixel(x, y).0[0] as f64).abs()
            })
        }))
    } else {
        0.0
    };
    (vertical + horizontal) as f32
}

fn std_dev(values: impl Iterator<Item = f64>) -> f64 {
    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    let mut count = 0u64;
    for v in values {
        sum += v;
        sum_sq += v * v;
        count += 1;
    }
    if count == 0 {
        return 0.0;
    }
    let mean = sum / count as f64;
    ((sum_sq / count as f64) - mean * mean).max(0.0).sqrt()
}

/// Laplacian variance, the standard blur metric. Kernel `[0,1,0; 1,-4,1; 0,1,0]`.
pub fn compute_laplacian_variance(img: &GrayImage) -> f32 {
    let (w, h) = (img.width(), img.height());
    if w < 3 || h < 3 {
        return 0.0;
    }
    let px = |x: u32, y: u32| img.get_pixel(x, y).0[0] as f64;
    let laplacians = (1..h - 1).flat_map(|y| {
        (1..w - 1).map(move |x| {
            px(x, y - 1) + px(x, y + 1) + px(x - 1, y) + px(x + 1, y) - 4.0 * px(x, y)
        })
    });
    let sd = std_dev(laplacians);
    (sd * sd) as f32
}

/// RMS contrast: standard deviation of grayscale intensities.
pub fn compute_contrast_score(img: &GrayImage) -> f32 {
    std_dev(img.pixels().map(|p| p.0[0] as f64)) as f32
}

pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, ExtractionError> {
    let mut cursor = Cursor::new(Vec::new());
    img.write_to(&mut cursor, ImageOutputFormat::Png)
        .map_err(|e| ExtractionError::ImageProcessing(format!("PNG encoding failed: {e}")))?;
    Ok(cursor.into_inner())
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn make_png(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb(color)));
        encode_png(&img).unwrap()
    }

    /// Black horizontal bars on white, like lines of printed text.
    fn striped(width: u32, height: u32) -> DynamicImage {
        let mut img = RgbImage::from_pixel(width, height, Rgb([255, 255, 255]));
        for y in 0..height {
            if (y / 4) % 3 == 0 {
                for x in 0..width {
                    img.put_pixel(x, y, Rgb([0, 0, 0]));
                }
            }
        }
        DynamicImage::ImageRgb8(img)
    }

    // ── recipes ──

    #[test]
    fn local_profile_upscales_to_2400() {
        let recipe = RenditionRecipe::for_profile(PreprocessProfile::LocalDeepLearning);
        assert_eq!(recipe.target_dimensions(1200, 900), (2400, 1800));
        assert!(!recipe.binarize);
    }

    #[test]
    fn rule_profile_upscales_to_1500_and_binarizes() {
        let recipe = RenditionRecipe::for_profile(PreprocessProfile::RuleBased);
        assert_eq!(recipe.target_dimensions(600, 750), (1200, 1500));
        assert!(recipe.binarize && recipe.grayscale);
    }

    #[test]
    fn large_inputs_are_not_upscaled() {
        let recipe = RenditionRecipe::for_profile(PreprocessProfile::RuleBased);
        assert_eq!(recipe.target_dimensions(2000, 1000), (2000, 1000));
    }

    #[test]
    fn cloud_profile_passthrough_until_3072() {
        let recipe = RenditionRecipe::for_profile(PreprocessProfile::CloudVision);
        assert_eq!(recipe.target_dimensions(1000, 800), (1000, 800));
        assert_eq!(recipe.target_dimensions(6144, 3072), (3072, 1536));
    }

    #[test]
    fn safety_cap_bounds_long_edge_and_pixels() {
        let (w, h) = cap_dimensions(10_000, 500);
        assert!(w <= SAFETY_MAX_LONG_EDGE);
        assert!(h >= 1);

        let (w, h) = cap_dimensions(4000, 4000);
        assert!(w as u64 * h as u64 <= SAFETY_MAX_PIXELS);
        assert_eq!(w, h);

        assert_eq!(cap_dimensions(800, 600), (800, 600));
    }

    #[test]
    fn extreme_aspect_upscale_falls_back_to_cap() {
        let recipe = RenditionRecipe::for_profile(PreprocessProfile::LocalDeepLearning);
        let (w, h) = recipe.target_dimensions(3, 2000);
        assert!(w >= 1 && h <= SAFETY_MAX_LONG_EDGE);
    }

    // ── prepare ──

    #[test]
    fn prepare_does_not_mutate_input() {
        let source = striped(200, 120);
        let before = source.to_rgb8();
        let _ = ProfilePreprocessor
            .prepare(&source, PreprocessProfile::RuleBased)
            .unwrap();
        assert_eq!(source.to_rgb8(), before);
    }

    #[test]
    fn rule_rendition_is_binary() {
        let prepared = ProfilePreprocessor
            .prepare(&striped(150, 100), PreprocessProfile::RuleBased)
            .unwrap();
        assert_eq!((prepared.width, prepared.height), (1500, 1000));
        let decoded = image::load_from_memory(&prepared.png_bytes).unwrap().to_luma8();
        assert_eq!(decoded.dimensions(), (1500, 1000));
        assert!(decoded.pixels().all(|p| p.0[0] == 0 || p.0[0] == 255));
    }

    #[test]
    fn cloud_rendition_keeps_color_and_size() {
        let prepared = ProfilePreprocessor
            .prepare(&striped(300, 200), PreprocessProfile::CloudVision)
            .unwrap();
        assert_eq!((prepared.width, prepared.height), (300, 200));
        assert_eq!(prepared.reference().profile, PreprocessProfile::CloudVision);
    }

    #[test]
    fn stroke_metric_identical_across_profiles() {
        let source = striped(120, 90);
        let a = ProfilePreprocessor
            .prepare(&source, PreprocessProfile::CloudVision)
            .unwrap();
        let b = ProfilePreprocessor
            .prepare(&source, PreprocessProfile::LocalDeepLearning)
            .unwrap();
        assert_eq!(a.stroke_irregularity, b.stroke_irregularity);
    }

    // ── pixel operations ──

    #[test]
    fn normalize_stretches_range() {
        let mut img = GrayImage::from_pixel(4, 1, Luma([100]));
        img.put_pixel(0, 0, Luma([50]));
        img.put_pixel(3, 0, Luma([150]));
        let out = normalize_brightness(&img);
        assert_eq!(out.get_pixel(0, 0).0[0], 0);
        assert_eq!(out.get_pixel(3, 0).0[0], 255);
        assert_eq!(out.get_pixel(1, 0).0[0], 128);
    }

    #[test]
    fn normalize_flat_image_unchanged() {
        let img = GrayImage::from_pixel(5, 5, Luma([77]));
        assert_eq!(normalize_brightness(&img), img);
    }

    #[test]
    fn contrast_pushes_away_from_mean() {
        let mut img = GrayImage::from_pixel(2, 1, Luma([100]));
        img.put_pixel(1, 0, Luma([160]));
        // mean 130: 100 -> 70, 160 -> 190
        let out = enhance_contrast(&img, 2.0);
        assert_eq!(out.get_pixel(0, 0).0[0], 70);
        assert_eq!(out.get_pixel(1, 0).0[0], 190);
    }

    #[test]
    fn sharpness_leaves_flat_image_unchanged() {
        let img = GrayImage::from_pixel(10, 10, Luma([90]));
        assert_eq!(enhance_sharpness(&img, 1.8), img);
    }

    #[test]
    fn median_removes_salt_noise() {
        let mut img = GrayImage::from_pixel(5, 5, Luma([0]));
        img.put_pixel(2, 2, Luma([255]));
        let out = median_filter_3x3(&img);
        assert!(out.pixels().all(|p| p.0[0] == 0));
    }

    #[test]
    fn binarize_splits_at_mean() {
        let mut img = GrayImage::from_pixel(4, 1, Luma([10]));
        img.put_pixel(3, 0, Luma([200]));
        let out = binarize_mean(&img);
        assert_eq!(out.get_pixel(0, 0).0[0], 0);
        assert_eq!(out.get_pixel(3, 0).0[0], 255);
    }

    #[test]
    fn stroke_irregularity_zero_on_flat_image() {
        let img = GrayImage::from_pixel(20, 20, Luma([200]));
        assert_eq!(stroke_irregularity(&img), 0.0);
    }

    #[test]
    fn stroke_irregularity_high_on_checkerboard_noise() {
        let mut img = GrayImage::new(40, 40);
        for y in 0..40 {
            for x in 0..40 {
                // Irregular pattern with mixed gradient magnitudes
                let v = if (x * 7 + y * 13) % 5 < 2 { 0 } else { 255 };
                img.put_pixel(x, y, Luma([v]));
            }
        }
        assert!(stroke_irregularity(&img) > 60.0);
    }

    // ── quality ──

    #[test]
    fn quality_blank_page_warns() {
        let img = RgbImage::from_pixel(100, 100, Rgb([250, 250, 250]));
        let report = DocumentQualityAssessor.assess(&img);
        assert!(report.is_blank);
        assert!(report.warnings.contains(&OcrWarning::BlankPage));
        assert!(!report.warnings.contains(&OcrWarning::BlurryImage));
    }

    #[test]
    fn quality_dark_image_warns() {
        let img = RgbImage::from_pixel(100, 100, Rgb([5, 5, 5]));
        let report = DocumentQualityAssessor.assess(&img);
        assert!(report.is_dark);
        assert!(report.warnings.contains(&OcrWarning::PoorContrast));
    }

    #[test]
    fn quality_sharp_text_has_no_warnings() {
        let report = DocumentQualityAssessor.assess(&striped(200, 200).to_rgb8());
        assert!(report.warnings.is_empty(), "{:?}", report.warnings);
        assert!(report.blur_score > BLUR_THRESHOLD);
    }

    #[test]
    fn quality_uniform_gray_is_blurry_and_low_contrast() {
        let img = RgbImage::from_pixel(100, 100, Rgb([128, 128, 128]));
        let report = DocumentQualityAssessor.assess(&img);
        assert!(report.warnings.contains(&OcrWarning::BlurryImage));
        assert!(report.warnings.contains(&OcrWarning::PoorContrast));
    }

    // ── decoding ──

    #[test]
    fn decode_rejects_tiny_buffer() {
        let err = decode_image(&[0u8; 10], &ExifOrientationCorrector).unwrap_err();
        assert!(matches!(err, ExtractionError::InvalidInput(_)));
    }

    #[test]
    fn decode_rejects_garbage() {
        let err = decode_image(&[7u8; 500], &ExifOrientationCorrector).unwrap_err();
        assert!(matches!(err, ExtractionError::ImageDecode(_)));
    }

    #[test]
    fn decode_valid_png() {
        let png = make_png(30, 20, [10, 20, 30]);
        let img = decode_image(&png, &ExifOrientationCorrector).unwrap();
        assert_eq!(img.dimensions(), (30, 20));
    }

    #[test]
    fn exif_absent_returns_identity() {
        let png = make_png(10, 10, [128, 128, 128]);
        assert_eq!(read_exif_orientation(&png), 1);
    }

    #[test]
    fn orientation_6_rotates_dimensions() {
        let img = DynamicImage::ImageRgb8(RgbImage::new(40, 10));
        assert_eq!(apply_orientation(img, 6).dimensions(), (10, 40));
    }

    #[test]
    fn metric_view_bounds_size() {
        let img = DynamicImage::ImageRgb8(RgbImage::new(3000, 1500));
        let view = metric_view(&img);
        assert_eq!(view.dimensions(), (1024, 512));
    }
}
