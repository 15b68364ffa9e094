use std::fs;

use facegate_config::Dimensions;
use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, ImageFormat, RgbImage};
use tracing::debug;

use crate::capture::ImageSource;
use crate::errors::{AppError, AppResult};

/// A decoded, non-empty RGB raster.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterImage {
    pixels: RgbImage,
}

impl RasterImage {
    pub fn new(pixels: RgbImage) -> AppResult<Self> {
        if pixels.width() == 0 || pixels.height() == 0 {
            return Err(AppError::ImageDecode {
                origin: "<raster>".into(),
                message: "image has zero width or height".into(),
            });
        }
        Ok(Self { pixels })
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn dimensions(&self) -> Dimensions {
        Dimensions::new(self.width(), self.height())
    }

    pub fn as_rgb(&self) -> &RgbImage {
        &self.pixels
    }

    pub fn into_rgb(self) -> RgbImage {
        self.pixels
    }

    pub fn to_gray(&self) -> GrayImage {
        imageops::grayscale(&self.pixels)
    }
}

/// Decodes `source` and resizes it to `target` in canonical RGB order.
pub fn normalize(source: &ImageSource, target: Dimensions) -> AppResult<RasterImage> {
    if target.is_empty() {
        return Err(AppError::InvalidInput(format!(
            "target image size {target} must be positive"
        )));
    }

    let decoded = decode(source)?;
    if decoded.width() == 0 || decoded.height() == 0 {
        return Err(AppError::ImageDecode {
            origin: source.origin(),
            message: "image decoded to zero size".into(),
        });
    }

    let rgb = decoded.to_rgb8();
    let resized = if rgb.dimensions() == (target.width, target.height) {
        rgb
    } else {
        debug!(
            from_width = rgb.width(),
            from_height = rgb.height(),
            target = %target,
            "resizing input image"
        );
        imageops::resize(&rgb, target.width, target.height, FilterType::Triangle)
    };
    RasterImage::new(resized)
}

fn decode(source: &ImageSource) -> AppResult<DynamicImage> {
    match source {
        ImageSource::Path(path) => {
            if !path.is_file() {
                return Err(AppError::MissingInput { path: path.clone() });
            }
            let data = fs::read(path).map_err(|_| AppError::MissingInput { path: path.clone() })?;
            decode_bytes(&data, None, source)
        }
        ImageSource::Bytes(data) => decode_bytes(data, None, source),
        ImageSource::Embedded { mime, data } => {
            let format = mime.as_deref().and_then(ImageFormat::from_mime_type);
            decode_bytes(data, format, source)
        }
    }
}

/// The payload's own signature decides the format; `hint` is only used when
/// the bytes cannot be identified.
fn decode_bytes(
    data: &[u8],
    hint: Option<ImageFormat>,
    source: &ImageSource,
) -> AppResult<DynamicImage> {
    if data.is_empty() {
        return Err(AppError::ImageDecode {
            origin: source.origin(),
            message: "Empty image".into(),
        });
    }
    let result = match (image::guess_format(data), hint) {
        (Err(_), Some(format)) => image::load_from_memory_with_format(data, format),
        _ => image::load_from_memory(data),
    };
    result.map_err(|err| AppError::ImageDecode {
        origin: source.origin(),
        message: err.to_string(),
    })
}
