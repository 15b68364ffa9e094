use serde::Serialize;
use tracing::{info, warn};

use crate::capture::ImageSource;
use crate::errors::{AppError, AppResult, ErrorKind};
use crate::faces::extractor::blur_score;
use crate::faces::pipeline::{FaceAnalysis, FacePipeline};
use crate::faces::store::{validate_identity, EnrollmentTemplate, TemplateStore};

#[derive(Debug, Clone)]
pub struct EnrollmentPolicy {
    pub min_blur_score: f64,
    pub config_version: String,
}

/// Why an enrollment request was turned down. These are expected outcomes,
/// not faults.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum EnrollmentRejection {
    AlreadyEnrolled,
    InvalidImage { message: String },
    NoFaceDetected,
    FaceTooBlurry { score: f64, minimum: f64 },
    ExtractionFailed { message: String },
    LivenessRejected { message: String },
}

impl EnrollmentRejection {
    pub fn message(&self) -> String {
        match self {
            EnrollmentRejection::AlreadyEnrolled => "Identity already enrolled".into(),
            EnrollmentRejection::InvalidImage { message } => format!("Invalid image: {message}"),
            EnrollmentRejection::NoFaceDetected => "No face detected in image".into(),
            EnrollmentRejection::FaceTooBlurry { score, minimum } => {
                format!("Face too blurry (score {score:.2} < {minimum:.2})")
            }
            EnrollmentRejection::ExtractionFailed { message } => {
                format!("Failed to compute embedding: {message}")
            }
            EnrollmentRejection::LivenessRejected { message } => {
                format!("Liveness check failed: {message}")
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum EnrollmentStatus {
    Enrolled(EnrollmentTemplate),
    Rejected(EnrollmentRejection),
}

#[derive(Debug, Clone)]
pub struct EnrollmentOutcome {
    pub identity: String,
    pub status: EnrollmentStatus,
    pub logs: Vec<String>,
}

impl EnrollmentOutcome {
    pub fn is_enrolled(&self) -> bool {
        matches!(self.status, EnrollmentStatus::Enrolled(_))
    }

    pub fn template(&self) -> Option<&EnrollmentTemplate> {
        match &self.status {
            EnrollmentStatus::Enrolled(template) => Some(template),
            EnrollmentStatus::Rejected(_) => None,
        }
    }

    pub fn message(&self) -> String {
        match &self.status {
            EnrollmentStatus::Enrolled(template) => format!(
                "Enrolled {} (quality {:.4}, {} features)",
                template.identity,
                template.quality,
                template.embedding.len()
            ),
            EnrollmentStatus::Rejected(rejection) => rejection.message(),
        }
    }
}

/// Single-shot enrollment: one capture, one extraction, one store-or-reject.
pub fn run_enrollment<S>(
    pipeline: &FacePipeline,
    store: &S,
    policy: &EnrollmentPolicy,
    identity: &str,
    source: &ImageSource,
    overwrite: bool,
) -> AppResult<EnrollmentOutcome>
where
    S: TemplateStore + ?Sized,
{
    validate_identity(identity)?;

    let mut logs = Vec::new();
    let reject = |rejection: EnrollmentRejection,
                  mut logs: Vec<String>|
     -> AppResult<EnrollmentOutcome> {
        warn!(identity, reason = %rejection.message(), "enrollment rejected");
        logs.push(rejection.message());
        Ok(EnrollmentOutcome {
            identity: identity.to_string(),
            status: EnrollmentStatus::Rejected(rejection),
            logs,
        })
    };

    if !overwrite && store.exists(identity) {
        return reject(EnrollmentRejection::AlreadyEnrolled, logs);
    }

    logs.push(format!("Loading image from {}", source.origin()));
    let analysis = match pipeline.analyze(source) {
        Ok(analysis) => analysis,
        Err(err) if err.kind() == ErrorKind::Input => {
            return reject(
                EnrollmentRejection::InvalidImage {
                    message: err.human_message(),
                },
                logs,
            )
        }
        Err(err) => return Err(err),
    };

    let (region, embedding) = match analysis {
        FaceAnalysis::Face { region, embedding } => (region, embedding),
        FaceAnalysis::NoFace => return reject(EnrollmentRejection::NoFaceDetected, logs),
        FaceAnalysis::ExtractionFailed(failure) => {
            return reject(
                EnrollmentRejection::ExtractionFailed {
                    message: failure.to_string(),
                },
                logs,
            )
        }
        FaceAnalysis::Spoof(message) => {
            return reject(EnrollmentRejection::LivenessRejected { message }, logs)
        }
    };
    logs.push(format!(
        "Face located at ({}, {}) size {}x{} confidence {:.3}",
        region.bounding_box.x,
        region.bounding_box.y,
        region.bounding_box.width,
        region.bounding_box.height,
        region.confidence
    ));

    let score = blur_score(region.image.as_rgb());
    if score < policy.min_blur_score {
        return reject(
            EnrollmentRejection::FaceTooBlurry {
                score,
                minimum: policy.min_blur_score,
            },
            logs,
        );
    }
    logs.push(format!("Sharpness score {score:.2}"));

    let template = EnrollmentTemplate::new(
        identity,
        embedding,
        policy.config_version.clone(),
        pipeline.extractor().method(),
    )
    .with_source(source.origin());

    let template = match store.save(template, overwrite) {
        Ok(template) => template,
        // Lost a race with a concurrent enrollment of the same identity.
        Err(AppError::AlreadyEnrolled { .. }) => {
            return reject(EnrollmentRejection::AlreadyEnrolled, logs)
        }
        Err(err) => return Err(err),
    };

    info!(
        identity,
        quality = template.quality,
        features = template.embedding.len(),
        overwrite,
        "identity enrolled"
    );
    logs.push(format!(
        "Stored {} template for {} ({} features)",
        template.extraction_method,
        identity,
        template.embedding.len()
    ));

    Ok(EnrollmentOutcome {
        identity: identity.to_string(),
        status: EnrollmentStatus::Enrolled(template),
        logs,
    })
}
