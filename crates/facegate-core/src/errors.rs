use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use facegate_config::ConfigError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("input file not found or unreadable: {path}")]
    MissingInput { path: PathBuf },

    #[error("failed to decode image {origin}: {message}")]
    ImageDecode { origin: String, message: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid identity '{identity}': {message}")]
    InvalidIdentity { identity: String, message: String },

    #[error("identity {identity} is already enrolled")]
    AlreadyEnrolled { identity: String },

    #[error("identity {identity} is not enrolled")]
    NotEnrolled { identity: String },

    #[error("embedding length mismatch (expected {expected}, found {found})")]
    ShapeMismatch { expected: usize, found: usize },

    #[error("embedding has zero magnitude and cannot be normalized")]
    DegenerateEmbedding,

    #[error("template file {path} is invalid: {message}")]
    InvalidTemplate { path: PathBuf, message: String },

    #[error("template {path} is encrypted and requires a template key")]
    EncryptedTemplateRequiresKey { path: PathBuf },

    #[error("template encryption error: {0}")]
    Encryption(String),

    #[error("failed to read template {path}: {source}")]
    TemplateRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write template {path}: {source}")]
    TemplateWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to append audit record to {path}: {source}")]
    AuditWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("image capture unavailable: {0}")]
    CaptureUnavailable(String),

    #[error("face detector {detector} unavailable: {message}")]
    DetectorUnavailable {
        detector: &'static str,
        message: String,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Coarse classification callers use to tell a correctable request from a
/// broken system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Input,
    NotFound,
    Integrity,
    Resource,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Input => "input",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Integrity => "integrity",
            ErrorKind::Resource => "resource",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::MissingInput { .. }
            | AppError::ImageDecode { .. }
            | AppError::InvalidInput(_)
            | AppError::InvalidIdentity { .. }
            | AppError::AlreadyEnrolled { .. } => ErrorKind::Input,
            AppError::NotEnrolled { .. } => ErrorKind::NotFound,
            AppError::ShapeMismatch { .. }
            | AppError::DegenerateEmbedding
            | AppError::InvalidTemplate { .. }
            | AppError::EncryptedTemplateRequiresKey { .. }
            | AppError::Encryption(_) => ErrorKind::Integrity,
            AppError::TemplateRead { .. }
            | AppError::TemplateWrite { .. }
            | AppError::AuditWrite { .. }
            | AppError::CaptureUnavailable(_)
            | AppError::DetectorUnavailable { .. }
            | AppError::Config(_)
            | AppError::Serialization(_)
            | AppError::Io(_) => ErrorKind::Resource,
        }
    }

    pub fn exit_code(&self) -> ExitCode {
        match self.kind() {
            ErrorKind::Input => ExitCode::from(2),
            ErrorKind::Integrity => ExitCode::from(3),
            ErrorKind::NotFound => ExitCode::from(4),
            ErrorKind::Resource => ExitCode::from(5),
        }
    }

    pub fn human_message(&self) -> String {
        self.to_string()
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_separate_integrity_from_resource() {
        assert_eq!(
            AppError::ShapeMismatch {
                expected: 3,
                found: 4
            }
            .kind(),
            ErrorKind::Integrity
        );
        assert_eq!(AppError::DegenerateEmbedding.kind(), ErrorKind::Integrity);
        assert_eq!(
            AppError::CaptureUnavailable("camera unplugged".into()).kind(),
            ErrorKind::Resource
        );
        assert_eq!(
            AppError::NotEnrolled {
                identity: "alice".into()
            }
            .kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            AppError::MissingInput {
                path: PathBuf::from("/nope.png")
            }
            .kind(),
            ErrorKind::Input
        );
    }

    #[test]
    fn config_errors_convert() {
        let err: AppError = ConfigError::Invalid {
            key: "face_padding",
            message: "negative".into(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::Resource);
        assert!(err.human_message().contains("face_padding"));
    }
}
