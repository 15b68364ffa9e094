use std::cmp::Ordering;

use facegate_config::{DetectorKind, Dimensions};
use image::imageops;
use image::GrayImage;
use imageproc::integral_image::{integral_image, integral_squared_image};
use serde::Serialize;
use tracing::{debug, warn};

use crate::errors::{AppError, AppResult};
use crate::faces::raster::RasterImage;

const SCALE_FACTOR: f64 = 1.1;
const MIN_WINDOW: u32 = 8;
const MIN_WINDOW_STDDEV: f64 = 8.0;
const NMS_OVERLAP: f64 = 0.3;
const MAX_CANDIDATES: usize = 16;

/// Axis-aligned box in source image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Grows the box on every side by `fraction` of its smaller side, then
    /// clamps it to `bounds`.
    pub fn padded(&self, fraction: f64, bounds: Dimensions) -> BoundingBox {
        let pad = (self.width.min(self.height) as f64 * fraction.max(0.0)).floor() as u32;
        let left = self.x.saturating_sub(pad).min(bounds.width);
        let top = self.y.saturating_sub(pad).min(bounds.height);
        let right = self.right().saturating_add(pad).min(bounds.width);
        let bottom = self.bottom().saturating_add(pad).min(bounds.height);
        BoundingBox::new(
            left,
            top,
            right.saturating_sub(left),
            bottom.saturating_sub(top),
        )
    }

    pub fn intersection_over_union(&self, other: &BoundingBox) -> f64 {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        if right <= left || bottom <= top {
            return 0.0;
        }
        let intersection = (right - left) as f64 * (bottom - top) as f64;
        let union = self.area() as f64 + other.area() as f64 - intersection;
        if union <= 0.0 {
            0.0
        } else {
            intersection / union
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FaceCandidate {
    pub bounding_box: BoundingBox,
    pub confidence: f64,
}

/// A cropped face and where it came from.
#[derive(Debug, Clone)]
pub struct FaceRegion {
    pub image: RasterImage,
    pub bounding_box: BoundingBox,
    pub confidence: f64,
}

/// Detection strategy. Implementations return candidates best first.
pub trait FaceDetector: Send + Sync {
    fn name(&self) -> &'static str;
    fn detect(&self, image: &RasterImage, min_size: Dimensions) -> AppResult<Vec<FaceCandidate>>;
}

impl<T: FaceDetector + ?Sized> FaceDetector for Box<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn detect(&self, image: &RasterImage, min_size: Dimensions) -> AppResult<Vec<FaceCandidate>> {
        (**self).detect(image, min_size)
    }
}

pub fn build_detector(kind: DetectorKind) -> Box<dyn FaceDetector> {
    match kind {
        DetectorKind::Classical => Box::new(ClassicalDetector),
        DetectorKind::Dlib => Box::new(FallbackDetector::new(DlibDetector, ClassicalDetector)),
    }
}

/// Picks the best candidate, pads it and crops it out of the source image.
pub struct FaceLocalizer {
    detector: Box<dyn FaceDetector>,
    detection_threshold: f64,
    padding: f64,
}

impl FaceLocalizer {
    pub fn new(detector: Box<dyn FaceDetector>, detection_threshold: f64, padding: f64) -> Self {
        Self {
            detector,
            detection_threshold,
            padding,
        }
    }

    pub fn detector_name(&self) -> &'static str {
        self.detector.name()
    }

    pub fn localize(
        &self,
        image: &RasterImage,
        min_size: Dimensions,
    ) -> AppResult<Option<FaceRegion>> {
        let candidates = self.detector.detect(image, min_size)?;
        debug!(
            detector = self.detector.name(),
            candidates = candidates.len(),
            "face detection finished"
        );
        let Some(best) = candidates
            .into_iter()
            .find(|candidate| candidate.confidence >= self.detection_threshold)
        else {
            return Ok(None);
        };

        let padded = best.bounding_box.padded(self.padding, image.dimensions());
        if padded.width == 0 || padded.height == 0 {
            return Ok(None);
        }
        let crop = imageops::crop_imm(
            image.as_rgb(),
            padded.x,
            padded.y,
            padded.width,
            padded.height,
        )
        .to_image();
        Ok(Some(FaceRegion {
            image: RasterImage::new(crop)?,
            bounding_box: padded,
            confidence: best.confidence,
        }))
    }
}

/// Sliding-window scanner over Haar-like contrast features: dark eye bands
/// flanked by a brighter bridge, forehead and cheeks.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClassicalDetector;

struct WindowStats {
    sum: GrayTable,
    squares: GrayTable,
}

struct GrayTable(image::ImageBuffer<image::Luma<u64>, Vec<u64>>);

impl GrayTable {
    // Tables carry a leading zero row and column.
    fn rect(&self, x: u32, y: u32, width: u32, height: u32) -> u64 {
        let at = |px: u32, py: u32| self.0.get_pixel(px, py)[0];
        let (x1, y1) = (x + width, y + height);
        (at(x1, y1) + at(x, y)).saturating_sub(at(x, y1) + at(x1, y))
    }
}

impl WindowStats {
    fn new(gray: &GrayImage) -> Self {
        Self {
            sum: GrayTable(integral_image::<_, u64>(gray)),
            squares: GrayTable(integral_squared_image::<_, u64>(gray)),
        }
    }

    fn mean(&self, x: u32, y: u32, width: u32, height: u32) -> f64 {
        let count = (width as u64 * height as u64).max(1) as f64;
        self.sum.rect(x, y, width, height) as f64 / count
    }

    fn stddev(&self, x: u32, y: u32, width: u32, height: u32) -> f64 {
        let count = (width as u64 * height as u64).max(1) as f64;
        let mean = self.sum.rect(x, y, width, height) as f64 / count;
        let mean_sq = self.squares.rect(x, y, width, height) as f64 / count;
        (mean_sq - mean * mean).max(0.0).sqrt()
    }

    /// Mean over a sub-rectangle given as fractions of the window.
    fn region_mean(&self, window: &BoundingBox, fx: (f64, f64), fy: (f64, f64)) -> f64 {
        let side = window.width as f64;
        let x0 = window.x + (side * fx.0).round() as u32;
        let x1 = window.x + (side * fx.1).round() as u32;
        let y0 = window.y + (side * fy.0).round() as u32;
        let y1 = window.y + (side * fy.1).round() as u32;
        self.mean(x0, y0, (x1 - x0).max(1), (y1 - y0).max(1))
    }

    fn score(&self, window: &BoundingBox) -> Option<f64> {
        let spread = self.stddev(window.x, window.y, window.width, window.height);
        if spread < MIN_WINDOW_STDDEV {
            return None;
        }
        let left_eye = self.region_mean(window, (0.15, 0.40), (0.20, 0.45));
        let right_eye = self.region_mean(window, (0.60, 0.85), (0.20, 0.45));
        let bridge = self.region_mean(window, (0.42, 0.58), (0.20, 0.45));
        let forehead = self.region_mean(window, (0.15, 0.85), (0.02, 0.18));
        let cheeks = self.region_mean(window, (0.15, 0.85), (0.50, 0.70));

        let bright = forehead.min(cheeks).min(bridge);
        let dark = left_eye.max(right_eye);
        let confidence = (bright - dark) / (spread + 1.0);
        (confidence > 0.0).then_some(confidence)
    }
}

impl FaceDetector for ClassicalDetector {
    fn name(&self) -> &'static str {
        "classical"
    }

    fn detect(&self, image: &RasterImage, min_size: Dimensions) -> AppResult<Vec<FaceCandidate>> {
        let gray = image.to_gray();
        let (width, height) = gray.dimensions();
        let limit = width.min(height);
        let stats = WindowStats::new(&gray);

        let mut raw = Vec::new();
        let mut side = min_size.width.max(min_size.height).max(MIN_WINDOW);
        while side <= limit {
            let step = (side / 10).max(1);
            let mut y = 0;
            while y + side <= height {
                let mut x = 0;
                while x + side <= width {
                    let window = BoundingBox::new(x, y, side, side);
                    if let Some(confidence) = stats.score(&window) {
                        raw.push(FaceCandidate {
                            bounding_box: window,
                            confidence,
                        });
                    }
                    x += step;
                }
                y += step;
            }
            side = ((side as f64 * SCALE_FACTOR).ceil() as u32).max(side + 1);
        }

        Ok(suppress_overlaps(raw))
    }
}

/// Greedy non-maximum suppression, best confidence first.
fn suppress_overlaps(mut candidates: Vec<FaceCandidate>) -> Vec<FaceCandidate> {
    candidates.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(Ordering::Equal)
    });
    let mut kept: Vec<FaceCandidate> = Vec::new();
    for candidate in candidates {
        if kept.len() >= MAX_CANDIDATES {
            break;
        }
        let overlaps = kept.iter().any(|existing| {
            existing
                .bounding_box
                .intersection_over_union(&candidate.bounding_box)
                > NMS_OVERLAP
        });
        if !overlaps {
            kept.push(candidate);
        }
    }
    kept
}

/// HOG detector from dlib. Only available when built with the `dlib` feature.
#[derive(Debug, Clone, Copy, Default)]
pub struct DlibDetector;

impl FaceDetector for DlibDetector {
    fn name(&self) -> &'static str {
        "dlib"
    }

    #[cfg(feature = "dlib")]
    fn detect(&self, image: &RasterImage, min_size: Dimensions) -> AppResult<Vec<FaceCandidate>> {
        use dlib_face_recognition::{FaceDetector as HogDetector, FaceDetectorTrait, ImageMatrix};

        let matrix = ImageMatrix::from_image(image.as_rgb());
        let detector = HogDetector::new();
        let locations = detector.face_locations(&matrix);
        let bounds = image.dimensions();

        let mut candidates = Vec::with_capacity(locations.len());
        for rect in locations.iter() {
            let left = rect.left.clamp(0, bounds.width as i64) as u32;
            let top = rect.top.clamp(0, bounds.height as i64) as u32;
            let right = rect.right.clamp(0, bounds.width as i64) as u32;
            let bottom = rect.bottom.clamp(0, bounds.height as i64) as u32;
            let bounding_box =
                BoundingBox::new(left, top, right.saturating_sub(left), bottom.saturating_sub(top));
            if bounding_box.width < min_size.width || bounding_box.height < min_size.height {
                continue;
            }
            candidates.push(FaceCandidate {
                bounding_box,
                confidence: 1.0,
            });
        }
        candidates.sort_by(|a, b| b.bounding_box.area().cmp(&a.bounding_box.area()));
        Ok(candidates)
    }

    #[cfg(not(feature = "dlib"))]
    fn detect(&self, _image: &RasterImage, _min_size: Dimensions) -> AppResult<Vec<FaceCandidate>> {
        Err(AppError::DetectorUnavailable {
            detector: "dlib",
            message: "built without the `dlib` feature".into(),
        })
    }
}

/// Runs `secondary` when `primary` reports itself unavailable.
pub struct FallbackDetector<P, S> {
    primary: P,
    secondary: S,
}

impl<P, S> FallbackDetector<P, S> {
    pub fn new(primary: P, secondary: S) -> Self {
        Self { primary, secondary }
    }
}

impl<P: FaceDetector, S: FaceDetector> FaceDetector for FallbackDetector<P, S> {
    fn name(&self) -> &'static str {
        self.primary.name()
    }

    fn detect(&self, image: &RasterImage, min_size: Dimensions) -> AppResult<Vec<FaceCandidate>> {
        match self.primary.detect(image, min_size) {
            Err(AppError::DetectorUnavailable { detector, message }) => {
                warn!(
                    primary = detector,
                    fallback = self.secondary.name(),
                    reason = %message,
                    "face detector unavailable; falling back"
                );
                self.secondary.detect(image, min_size)
            }
            other => other,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    /// 160x160 dark background with a bright face square at (40,40) 80x80,
    /// two dark eyes and a mouth bar.
    pub(crate) fn synthetic_face() -> RgbImage {
        let mut img = RgbImage::from_pixel(160, 160, Rgb([30, 30, 30]));
        fill(&mut img, 40..120, 40..120, 210);
        fill(&mut img, 54..74, 58..72, 35);
        fill(&mut img, 86..106, 58..72, 35);
        fill(&mut img, 66..94, 96..104, 70);
        img
    }

    fn fill(img: &mut RgbImage, xs: std::ops::Range<u32>, ys: std::ops::Range<u32>, value: u8) {
        for y in ys {
            for x in xs.clone() {
                img.put_pixel(x, y, Rgb([value, value, value]));
            }
        }
    }

    struct Unavailable;

    impl FaceDetector for Unavailable {
        fn name(&self) -> &'static str {
            "unavailable"
        }

        fn detect(&self, _: &RasterImage, _: Dimensions) -> AppResult<Vec<FaceCandidate>> {
            Err(AppError::DetectorUnavailable {
                detector: "unavailable",
                message: "offline".into(),
            })
        }
    }

    struct Fixed(Vec<FaceCandidate>);

    impl FaceDetector for Fixed {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn detect(&self, _: &RasterImage, _: Dimensions) -> AppResult<Vec<FaceCandidate>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn classical_detector_finds_synthetic_face() {
        let raster = RasterImage::new(synthetic_face()).unwrap();
        let candidates = ClassicalDetector
            .detect(&raster, Dimensions::new(48, 48))
            .unwrap();
        let best = candidates.first().expect("face expected");
        let center_x = best.bounding_box.x + best.bounding_box.width / 2;
        let center_y = best.bounding_box.y + best.bounding_box.height / 2;
        assert!((40..120).contains(&center_x), "{best:?}");
        assert!((40..120).contains(&center_y), "{best:?}");
        assert!(best.confidence > 0.2);
        assert!(candidates
            .windows(2)
            .all(|pair| pair[0].confidence >= pair[1].confidence));
    }

    #[test]
    fn flat_image_has_no_candidates() {
        let raster = RasterImage::new(RgbImage::from_pixel(96, 96, Rgb([128, 128, 128]))).unwrap();
        let candidates = ClassicalDetector
            .detect(&raster, Dimensions::new(24, 24))
            .unwrap();
        assert!(candidates.is_empty());
    }

    #[test]
    fn min_size_larger_than_image_yields_nothing() {
        let raster = RasterImage::new(synthetic_face()).unwrap();
        let candidates = ClassicalDetector
            .detect(&raster, Dimensions::new(400, 400))
            .unwrap();
        assert!(candidates.is_empty());
    }

    #[test]
    fn padding_is_clamped_to_image_bounds() {
        let bounds = Dimensions::new(100, 100);
        let padded = BoundingBox::new(5, 80, 30, 20).padded(0.5, bounds);
        assert_eq!(padded, BoundingBox::new(0, 70, 45, 30));
        assert!(padded.right() <= 100 && padded.bottom() <= 100);

        let unchanged = BoundingBox::new(10, 10, 20, 20).padded(0.0, bounds);
        assert_eq!(unchanged, BoundingBox::new(10, 10, 20, 20));
    }

    #[test]
    fn localizer_crops_padded_region() {
        let raster = RasterImage::new(synthetic_face()).unwrap();
        let detector = Fixed(vec![FaceCandidate {
            bounding_box: BoundingBox::new(40, 40, 80, 80),
            confidence: 0.9,
        }]);
        let localizer = FaceLocalizer::new(Box::new(detector), 0.2, 0.1);
        let region = localizer
            .localize(&raster, Dimensions::new(48, 48))
            .unwrap()
            .expect("region expected");
        assert_eq!(region.bounding_box, BoundingBox::new(32, 32, 96, 96));
        assert_eq!(region.image.dimensions(), Dimensions::new(96, 96));
    }

    #[test]
    fn localizer_skips_candidates_below_threshold() {
        let raster = RasterImage::new(synthetic_face()).unwrap();
        let detector = Fixed(vec![FaceCandidate {
            bounding_box: BoundingBox::new(40, 40, 80, 80),
            confidence: 0.1,
        }]);
        let localizer = FaceLocalizer::new(Box::new(detector), 0.2, 0.1);
        assert!(localizer
            .localize(&raster, Dimensions::new(48, 48))
            .unwrap()
            .is_none());
    }

    #[test]
    fn fallback_runs_secondary_when_primary_unavailable() {
        let raster = RasterImage::new(synthetic_face()).unwrap();
        let expected = FaceCandidate {
            bounding_box: BoundingBox::new(1, 2, 30, 30),
            confidence: 0.5,
        };
        let detector = FallbackDetector::new(Unavailable, Fixed(vec![expected]));
        let found = detector.detect(&raster, Dimensions::new(8, 8)).unwrap();
        assert_eq!(found, vec![expected]);
    }

    #[cfg(not(feature = "dlib"))]
    #[test]
    fn dlib_kind_falls_back_to_classical_without_feature() {
        let raster = RasterImage::new(synthetic_face()).unwrap();
        let detector = build_detector(DetectorKind::Dlib);
        let found = detector.detect(&raster, Dimensions::new(48, 48)).unwrap();
        assert!(!found.is_empty());
    }

    #[test]
    fn overlap_suppression_keeps_best() {
        let strong = FaceCandidate {
            bounding_box: BoundingBox::new(0, 0, 10, 10),
            confidence: 2.0,
        };
        let weak_overlap = FaceCandidate {
            bounding_box: BoundingBox::new(1, 1, 10, 10),
            confidence: 1.0,
        };
        let separate = FaceCandidate {
            bounding_box: BoundingBox::new(50, 50, 10, 10),
            confidence: 0.5,
        };
        let kept = suppress_overlaps(vec![weak_overlap, separate, strong]);
        assert_eq!(kept, vec![strong, separate]);
    }
}
