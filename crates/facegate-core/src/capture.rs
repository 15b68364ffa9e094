use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;

use base64::{engine::general_purpose, Engine as _};

use crate::errors::{AppError, AppResult};

const DATA_URI_PREFIX: &str = "data:";

/// Where a single frame comes from.
#[derive(Clone, PartialEq, Eq)]
pub enum ImageSource {
    Path(PathBuf),
    Bytes(Vec<u8>),
    /// A `data:<mime>;base64,<body>` payload, already decoded.
    Embedded { mime: Option<String>, data: Vec<u8> },
}

impl ImageSource {
    /// Interprets caller text as either an embedded data URI or a filesystem path.
    pub fn parse(input: &str) -> AppResult<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(AppError::InvalidInput(
                "image source is empty; expected a path or data URI".into(),
            ));
        }
        if trimmed.starts_with(DATA_URI_PREFIX) {
            return parse_data_uri(trimmed);
        }
        Ok(ImageSource::Path(PathBuf::from(trimmed)))
    }

    pub fn origin(&self) -> String {
        match self {
            ImageSource::Path(path) => path.display().to_string(),
            ImageSource::Bytes(data) => format!("<{} bytes>", data.len()),
            ImageSource::Embedded { mime, data } => format!(
                "<embedded {} ({} bytes)>",
                mime.as_deref().unwrap_or("image"),
                data.len()
            ),
        }
    }
}

impl fmt::Debug for ImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.origin())
    }
}

impl From<PathBuf> for ImageSource {
    fn from(path: PathBuf) -> Self {
        ImageSource::Path(path)
    }
}

impl From<Vec<u8>> for ImageSource {
    fn from(data: Vec<u8>) -> Self {
        ImageSource::Bytes(data)
    }
}

fn parse_data_uri(input: &str) -> AppResult<ImageSource> {
    let rest = &input[DATA_URI_PREFIX.len()..];
    let (header, body) = rest.split_once(',').ok_or_else(|| {
        AppError::InvalidInput("embedded image is missing the ',' separator".into())
    })?;
    let (mime, is_base64) = match header.strip_suffix(";base64") {
        Some(mime) => (mime, true),
        None => (header, false),
    };
    if !is_base64 {
        return Err(AppError::InvalidInput(
            "embedded image must be base64 encoded".into(),
        ));
    }
    if !mime.is_empty() && !mime.starts_with("image/") {
        return Err(AppError::InvalidInput(format!(
            "embedded payload has non-image MIME type '{mime}'"
        )));
    }
    let data = general_purpose::STANDARD
        .decode(body.trim())
        .map_err(|err| AppError::InvalidInput(format!("invalid base64 image payload: {err}")))?;
    Ok(ImageSource::Embedded {
        mime: (!mime.is_empty()).then(|| mime.to_string()),
        data,
    })
}

/// Supplies one frame per verification attempt. Attempt numbers start at 1.
pub trait FrameSource {
    fn next_frame(&mut self, attempt: u32) -> AppResult<ImageSource>;
}

/// Hands out the same image on every attempt.
#[derive(Debug, Clone)]
pub struct RepeatSource {
    source: ImageSource,
}

impl RepeatSource {
    pub fn new(source: ImageSource) -> Self {
        Self { source }
    }
}

impl FrameSource for RepeatSource {
    fn next_frame(&mut self, _attempt: u32) -> AppResult<ImageSource> {
        Ok(self.source.clone())
    }
}

/// Hands out a fixed list of frames in order; running dry is a capture failure.
#[derive(Debug, Clone, Default)]
pub struct SequenceSource {
    frames: VecDeque<ImageSource>,
}

impl SequenceSource {
    pub fn new(frames: impl IntoIterator<Item = ImageSource>) -> Self {
        Self {
            frames: frames.into_iter().collect(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

impl FrameSource for SequenceSource {
    fn next_frame(&mut self, attempt: u32) -> AppResult<ImageSource> {
        self.frames.pop_front().ok_or_else(|| {
            AppError::CaptureUnavailable(format!("no frame available for attempt {attempt}"))
        })
    }
}

/// Adapts a capture callback, such as a camera grab, into a frame source.
pub struct CaptureFn<F>(pub F);

impl<F> FrameSource for CaptureFn<F>
where
    F: FnMut(u32) -> AppResult<ImageSource>,
{
    fn next_frame(&mut self, attempt: u32) -> AppResult<ImageSource> {
        (self.0)(attempt)
    }
}
