use facegate_config::{Dimensions, ExtractionMethod};
use image::imageops::{self, FilterType};
use image::{GrayImage, RgbImage};
use imageproc::filter::laplacian_filter;
use imageproc::gradients::{horizontal_sobel, vertical_sobel};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const HISTOGRAM_BINS: usize = 64;
const COMPOSITE_BINS: usize = 32;
const GRID_BINS: usize = 16;
const PYRAMID_LEVELS: [u32; 2] = [2, 4];
// Largest Sobel magnitude for 8-bit input: |gx| and |gy| both at 4 * 255.
const MAX_GRADIENT: f64 = 1442.5;

/// Fixed-length feature vector. Non-finite components never survive construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding(Vec<f64>);

impl Embedding {
    pub fn new(values: Vec<f64>) -> Self {
        Self(
            values
                .into_iter()
                .map(|value| if value.is_finite() { value } else { 0.0 })
                .collect(),
        )
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_finite(&self) -> bool {
        self.0.iter().all(|value| value.is_finite())
    }

    pub fn l2_norm(&self) -> f64 {
        self.0.iter().map(|value| value * value).sum::<f64>().sqrt()
    }

    pub fn into_vec(self) -> Vec<f64> {
        self.0
    }
}

impl AsRef<[f64]> for Embedding {
    fn as_ref(&self) -> &[f64] {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractionFailure {
    #[error("face region is empty")]
    EmptyInput,
    #[error("unknown extraction method '{0}'")]
    UnknownMethod(String),
}

/// Deterministic, non-learned feature extraction: identical pixels always
/// produce identical embeddings.
#[derive(Debug, Clone, Copy)]
pub struct FeatureExtractor {
    method: ExtractionMethod,
    face_size: Dimensions,
}

impl FeatureExtractor {
    pub fn new(method: ExtractionMethod, face_size: Dimensions) -> Self {
        Self { method, face_size }
    }

    pub fn from_name(name: &str, face_size: Dimensions) -> Result<Self, ExtractionFailure> {
        let method = name
            .parse::<ExtractionMethod>()
            .map_err(|_| ExtractionFailure::UnknownMethod(name.to_string()))?;
        Ok(Self::new(method, face_size))
    }

    pub fn method(&self) -> ExtractionMethod {
        self.method
    }

    /// Length of every embedding this extractor produces.
    pub fn embedding_len(&self) -> usize {
        match self.method {
            ExtractionMethod::Simple => self.face_size.area() * 3,
            ExtractionMethod::Histogram => HISTOGRAM_BINS * 3,
            ExtractionMethod::Composite => {
                let pyramid: u32 = PYRAMID_LEVELS.iter().map(|level| level * level).sum();
                COMPOSITE_BINS * 5 + pyramid as usize * GRID_BINS
            }
        }
    }

    pub fn extract(&self, face: &RgbImage) -> Result<Embedding, ExtractionFailure> {
        if face.width() == 0 || face.height() == 0 || self.face_size.is_empty() {
            return Err(ExtractionFailure::EmptyInput);
        }
        let resized = imageops::resize(
            face,
            self.face_size.width,
            self.face_size.height,
            FilterType::Triangle,
        );
        let values = match self.method {
            ExtractionMethod::Simple => simple_features(&resized),
            ExtractionMethod::Histogram => histogram_features(&resized),
            ExtractionMethod::Composite => composite_features(&resized),
        };
        Ok(Embedding::new(values))
    }
}

fn simple_features(image: &RgbImage) -> Vec<f64> {
    image
        .as_raw()
        .iter()
        .map(|&value| value as f64 / 255.0)
        .collect()
}

fn histogram_features(image: &RgbImage) -> Vec<f64> {
    let mut values = Vec::with_capacity(HISTOGRAM_BINS * 3);
    for channel in 0..3 {
        values.extend(bin_values(
            image.pixels().map(|pixel| pixel[channel]),
            HISTOGRAM_BINS,
        ));
    }
    l1_normalize(&mut values);
    values
}

fn composite_features(image: &RgbImage) -> Vec<f64> {
    let gray = imageops::grayscale(image);
    let mut values = Vec::new();

    let mut global = bin_values(gray.pixels().map(|pixel| pixel[0]), COMPOSITE_BINS);
    l1_normalize(&mut global);
    values.extend(global);

    let mut gradients = gradient_histogram(&gray);
    l1_normalize(&mut gradients);
    values.extend(gradients);

    for channel in 0..3 {
        let mut colour = bin_values(image.pixels().map(|pixel| pixel[channel]), COMPOSITE_BINS);
        l1_normalize(&mut colour);
        values.extend(colour);
    }

    for level in PYRAMID_LEVELS {
        values.extend(grid_histograms(&gray, level));
    }

    let norm = values.iter().map(|value| value * value).sum::<f64>().sqrt();
    if norm > 0.0 {
        values.iter_mut().for_each(|value| *value /= norm);
    }
    values
}

fn gradient_histogram(gray: &GrayImage) -> Vec<f64> {
    let gx = horizontal_sobel(gray);
    let gy = vertical_sobel(gray);
    let mut bins = vec![0.0; COMPOSITE_BINS];
    for (x, y) in gx.pixels().zip(gy.pixels()) {
        let (dx, dy) = (x[0] as f64, y[0] as f64);
        let magnitude = (dx * dx + dy * dy).sqrt();
        let index = ((magnitude / MAX_GRADIENT) * COMPOSITE_BINS as f64) as usize;
        bins[index.min(COMPOSITE_BINS - 1)] += 1.0;
    }
    bins
}

/// Gray histograms over a `cells` x `cells` grid, each cell normalized on its own.
fn grid_histograms(gray: &GrayImage, cells: u32) -> Vec<f64> {
    let (width, height) = gray.dimensions();
    let mut values = Vec::with_capacity((cells * cells) as usize * GRID_BINS);
    for row in 0..cells {
        let y0 = row * height / cells;
        let y1 = (row + 1) * height / cells;
        for col in 0..cells {
            let x0 = col * width / cells;
            let x1 = (col + 1) * width / cells;
            let cell = (y0..y1).flat_map(|y| (x0..x1).map(move |x| gray.get_pixel(x, y)[0]));
            let mut bins = bin_values(cell, GRID_BINS);
            l1_normalize(&mut bins);
            values.extend(bins);
        }
    }
    values
}

fn bin_values(values: impl Iterator<Item = u8>, bins: usize) -> Vec<f64> {
    let mut histogram = vec![0.0; bins];
    for value in values {
        histogram[value as usize * bins / 256] += 1.0;
    }
    histogram
}

fn l1_normalize(values: &mut [f64]) {
    let total: f64 = values.iter().sum();
    if total > 0.0 {
        values.iter_mut().for_each(|value| *value /= total);
    }
}

/// Variance of the Laplacian response; low values mean a blurry image.
pub fn blur_score(image: &RgbImage) -> f64 {
    if image.width() == 0 || image.height() == 0 {
        return 0.0;
    }
    let gray = imageops::grayscale(image);
    let response = laplacian_filter(&gray);
    let count = (response.width() as u64 * response.height() as u64) as f64;
    let (sum, sum_sq) = response.pixels().fold((0.0, 0.0), |(sum, sum_sq), pixel| {
        let value = pixel[0] as f64;
        (sum + value, sum_sq + value * value)
    });
    let mean = sum / count;
    (sum_sq / count - mean * mean).max(0.0)
}
