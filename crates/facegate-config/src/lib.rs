use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const PRIMARY_CONFIG_PATH: &str = "/etc/facegate/config.toml";
pub const SECONDARY_CONFIG_PATH: &str = "/usr/local/etc/facegate/config.toml";
pub const DEFAULT_IMAGE_SIZE: Dimensions = Dimensions::new(160, 160);
pub const DEFAULT_FACE_SIZE: Dimensions = Dimensions::new(64, 64);
pub const DEFAULT_MIN_FACE_SIZE: Dimensions = Dimensions::new(48, 48);
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.75;
pub const DEFAULT_MAX_VERIFICATION_ATTEMPTS: u32 = 3;
pub const DEFAULT_MIN_BLUR_SCORE: f64 = 100.0;
pub const DEFAULT_FACE_PADDING: f64 = 0.1;
pub const DEFAULT_DETECTION_THRESHOLD: f64 = 0.2;
pub const DEFAULT_STORE_DIR: &str = "/var/lib/facegate";
pub const DEFAULT_CONFIG_VERSION: &str = "1.0";

/// Width and height of a raster, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn area(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Size as written in the config file: either `48` or `[48, 48]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum SizeSpec {
    Square(u32),
    Pair([u32; 2]),
}

impl From<SizeSpec> for Dimensions {
    fn from(spec: SizeSpec) -> Self {
        match spec {
            SizeSpec::Square(side) => Dimensions::new(side, side),
            SizeSpec::Pair([width, height]) => Dimensions::new(width, height),
        }
    }
}

/// Named feature extraction strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    Simple,
    Histogram,
    /// Global, gradient, colour and spatial-pyramid histograms. Historically
    /// labelled `deep_learning`; it is not a learned model.
    #[serde(alias = "deep_learning")]
    Composite,
}

impl ExtractionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionMethod::Simple => "simple",
            ExtractionMethod::Histogram => "histogram",
            ExtractionMethod::Composite => "composite",
        }
    }
}

impl fmt::Display for ExtractionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExtractionMethod {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "simple" => Ok(ExtractionMethod::Simple),
            "histogram" => Ok(ExtractionMethod::Histogram),
            "composite" | "deep_learning" => Ok(ExtractionMethod::Composite),
            other => Err(format!(
                "unknown extraction method '{other}' (expected simple, histogram or composite)"
            )),
        }
    }
}

/// Which face detector backend to run first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    Classical,
    Dlib,
}

impl DetectorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectorKind::Classical => "classical",
            DetectorKind::Dlib => "dlib",
        }
    }
}

impl FromStr for DetectorKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "classical" | "cascade" => Ok(DetectorKind::Classical),
            "dlib" | "hog" => Ok(DetectorKind::Dlib),
            other => Err(format!(
                "unknown detector '{other}' (expected classical or dlib)"
            )),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ConfigFile {
    pub image_size: Option<SizeSpec>,
    pub face_size: Option<SizeSpec>,
    pub min_face_size: Option<SizeSpec>,
    pub similarity_threshold: Option<f64>,
    pub max_verification_attempts: Option<u32>,
    pub min_blur_score: Option<f64>,
    pub extraction_method: Option<String>,
    pub face_padding: Option<f64>,
    pub detection_threshold: Option<f64>,
    pub detector: Option<String>,
    pub store_dir: Option<PathBuf>,
    pub audit_dir: Option<PathBuf>,
    pub config_version: Option<String>,
    pub template_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig {
    pub image_size: Dimensions,
    pub face_size: Dimensions,
    pub min_face_size: Dimensions,
    pub similarity_threshold: f64,
    pub max_verification_attempts: u32,
    pub min_blur_score: f64,
    pub extraction_method: ExtractionMethod,
    pub face_padding: f64,
    pub detection_threshold: f64,
    pub detector: DetectorKind,
    pub store_dir: PathBuf,
    pub audit_dir: PathBuf,
    pub config_version: String,
    pub template_key: Option<String>,
}

impl ResolvedConfig {
    pub fn from_raw(raw: ConfigFile) -> Result<Self, ConfigError> {
        let image_size = raw.image_size.map_or(DEFAULT_IMAGE_SIZE, Dimensions::from);
        let face_size = raw.face_size.map_or(DEFAULT_FACE_SIZE, Dimensions::from);
        let min_face_size = raw
            .min_face_size
            .map_or(DEFAULT_MIN_FACE_SIZE, Dimensions::from);
        for (key, size) in [
            ("image_size", image_size),
            ("face_size", face_size),
            ("min_face_size", min_face_size),
        ] {
            if size.is_empty() {
                return Err(ConfigError::Invalid {
                    key,
                    message: format!("dimensions must be positive, found {size}"),
                });
            }
        }

        let similarity_threshold = raw
            .similarity_threshold
            .unwrap_or(DEFAULT_SIMILARITY_THRESHOLD);
        if !(-1.0..=1.0).contains(&similarity_threshold) {
            return Err(ConfigError::Invalid {
                key: "similarity_threshold",
                message: format!("{similarity_threshold} is outside [-1, 1]"),
            });
        }

        let face_padding = raw.face_padding.unwrap_or(DEFAULT_FACE_PADDING);
        if !face_padding.is_finite() || face_padding < 0.0 {
            return Err(ConfigError::Invalid {
                key: "face_padding",
                message: format!("{face_padding} must be a non-negative fraction"),
            });
        }

        let min_blur_score = raw.min_blur_score.unwrap_or(DEFAULT_MIN_BLUR_SCORE);
        if !min_blur_score.is_finite() || min_blur_score < 0.0 {
            return Err(ConfigError::Invalid {
                key: "min_blur_score",
                message: format!("{min_blur_score} must be a finite, non-negative score"),
            });
        }

        let detection_threshold = raw
            .detection_threshold
            .unwrap_or(DEFAULT_DETECTION_THRESHOLD);
        if !detection_threshold.is_finite() {
            return Err(ConfigError::Invalid {
                key: "detection_threshold",
                message: format!("{detection_threshold} must be finite"),
            });
        }

        let extraction_method = match raw.extraction_method.as_deref() {
            Some(name) => name
                .parse::<ExtractionMethod>()
                .map_err(|message| ConfigError::Invalid {
                    key: "extraction_method",
                    message,
                })?,
            None => ExtractionMethod::Simple,
        };
        let detector = match raw.detector.as_deref() {
            Some(name) => name
                .parse::<DetectorKind>()
                .map_err(|message| ConfigError::Invalid {
                    key: "detector",
                    message,
                })?,
            None => DetectorKind::Classical,
        };

        let store_dir = raw
            .store_dir
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STORE_DIR));
        let audit_dir = raw.audit_dir.unwrap_or_else(|| store_dir.join("audit"));

        Ok(Self {
            image_size,
            face_size,
            min_face_size,
            similarity_threshold,
            max_verification_attempts: raw
                .max_verification_attempts
                .unwrap_or(DEFAULT_MAX_VERIFICATION_ATTEMPTS)
                .max(1),
            min_blur_score,
            extraction_method,
            face_padding,
            detection_threshold,
            detector,
            store_dir,
            audit_dir,
            config_version: raw
                .config_version
                .unwrap_or_else(|| DEFAULT_CONFIG_VERSION.to_string()),
            template_key: raw.template_key.filter(|key| !key.trim().is_empty()),
        })
    }

    /// Same settings rooted at a different store directory; the audit log follows it.
    pub fn with_store_dir(mut self, store_dir: impl Into<PathBuf>) -> Self {
        self.store_dir = store_dir.into();
        self.audit_dir = self.store_dir.join("audit");
        self
    }
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        let store_dir = PathBuf::from(DEFAULT_STORE_DIR);
        Self {
            image_size: DEFAULT_IMAGE_SIZE,
            face_size: DEFAULT_FACE_SIZE,
            min_face_size: DEFAULT_MIN_FACE_SIZE,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            max_verification_attempts: DEFAULT_MAX_VERIFICATION_ATTEMPTS,
            min_blur_score: DEFAULT_MIN_BLUR_SCORE,
            extraction_method: ExtractionMethod::Simple,
            face_padding: DEFAULT_FACE_PADDING,
            detection_threshold: DEFAULT_DETECTION_THRESHOLD,
            detector: DetectorKind::Classical,
            audit_dir: store_dir.join("audit"),
            store_dir,
            config_version: DEFAULT_CONFIG_VERSION.to_string(),
            template_key: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub contents: ConfigFile,
    pub source: PathBuf,
}

impl LoadedConfig {
    pub fn new(contents: ConfigFile, source: PathBuf) -> Self {
        Self { contents, source }
    }

    pub fn source(&self) -> &Path {
        &self.source
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfigWithSource {
    pub resolved: ResolvedConfig,
    pub source: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

pub fn default_search_paths() -> [PathBuf; 2] {
    [
        PathBuf::from(PRIMARY_CONFIG_PATH),
        PathBuf::from(SECONDARY_CONFIG_PATH),
    ]
}

pub fn load_resolved_config() -> Result<ResolvedConfigWithSource, ConfigError> {
    load_resolved_from_paths(&default_search_paths())
}

/// Loads a single, explicitly requested file. Unlike the search list, a
/// missing file is an error here.
pub fn load_explicit(path: &Path) -> Result<ResolvedConfigWithSource, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let parsed = parse_contents(path, &contents)?;
    Ok(ResolvedConfigWithSource {
        resolved: ResolvedConfig::from_raw(parsed)?,
        source: Some(path.to_path_buf()),
    })
}

pub fn load_from_paths(paths: &[PathBuf]) -> Result<Option<LoadedConfig>, ConfigError> {
    for path in paths {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let parsed = parse_contents(path, &contents)?;
                return Ok(Some(LoadedConfig::new(parsed, path.clone())));
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => {
                return Err(ConfigError::Read {
                    path: path.clone(),
                    source: err,
                })
            }
        }
    }

    Ok(None)
}

pub fn load_resolved_from_paths(
    paths: &[PathBuf],
) -> Result<ResolvedConfigWithSource, ConfigError> {
    match load_from_paths(paths)? {
        Some(entry) => Ok(ResolvedConfigWithSource {
            resolved: ResolvedConfig::from_raw(entry.contents)?,
            source: Some(entry.source),
        }),
        None => Ok(ResolvedConfigWithSource {
            resolved: ResolvedConfig::default(),
            source: None,
        }),
    }
}

fn parse_contents(path: &Path, contents: &str) -> Result<ConfigFile, ConfigError> {
    toml::from_str::<ConfigFile>(contents).map_err(|err| ConfigError::Parse {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}
