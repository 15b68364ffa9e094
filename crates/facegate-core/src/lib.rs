//! Face enrollment and verification: image normalization, face localization,
//! statistical feature extraction, cosine scoring and a bounded retry loop
//! with an append-only audit trail.

pub mod audit;
pub mod capture;
pub mod errors;
pub mod faces;
pub mod liveness;
pub mod service;

pub use audit::{AuditContext, AuditOutcome, AuditRecord, AuditSink, JsonlAuditLog, MemoryAuditSink};
pub use capture::{CaptureFn, FrameSource, ImageSource, RepeatSource, SequenceSource};
pub use errors::{AppError, AppResult, ErrorKind};
pub use liveness::{LivenessCheck, LivenessVerdict, PassThroughLiveness};
pub use service::FaceGate;

pub use facegate_config as config;
