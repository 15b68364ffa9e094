use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, info_span, warn};
use uuid::Uuid;

use crate::audit::{AuditContext, AuditOutcome, AuditRecord, AuditSink};
use crate::capture::FrameSource;
use crate::errors::{AppError, AppResult, ErrorKind};
use crate::faces::comparer::{cosine_similarity, MatchDecision};
use crate::faces::extractor::Embedding;
use crate::faces::pipeline::{FaceAnalysis, FacePipeline};
use crate::faces::store::{validate_identity, TemplateStore};

/// Threshold and attempt budget for one verification request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttemptPolicy {
    pub threshold: f64,
    pub max_attempts: u32,
}

impl AttemptPolicy {
    pub fn new(threshold: f64, max_attempts: u32) -> Self {
        Self {
            threshold,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Where the machine goes once attempt `attempt` has been judged.
    pub fn after_attempt(&self, attempt: u32, accepted: bool) -> VerificationState {
        if accepted {
            VerificationState::Success { attempt }
        } else if attempt >= self.max_attempts {
            VerificationState::Exhausted { attempts: attempt }
        } else {
            VerificationState::Retry { attempt }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum VerificationState {
    Start,
    Capturing { attempt: u32 },
    Scoring { attempt: u32, captured: Embedding },
    Retry { attempt: u32 },
    Success { attempt: u32 },
    Exhausted { attempts: u32 },
    NotEnrolled,
}

impl VerificationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            VerificationState::Success { .. }
                | VerificationState::Exhausted { .. }
                | VerificationState::NotEnrolled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationAttempt {
    pub attempt_number: u32,
    pub similarity: f64,
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Verified,
    Exhausted,
    NotEnrolled,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerificationResult {
    pub identity: String,
    pub request_id: Uuid,
    pub verified: bool,
    pub status: VerificationStatus,
    pub threshold: f64,
    pub attempts: Vec<VerificationAttempt>,
    pub final_message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip)]
    pub logs: Vec<String>,
}

struct AttemptRecorder<'a, A: AuditSink + ?Sized> {
    identity: &'a str,
    policy: AttemptPolicy,
    audit: &'a A,
    context: &'a AuditContext,
    attempts: Vec<VerificationAttempt>,
    logs: Vec<String>,
}

impl<A: AuditSink + ?Sized> AttemptRecorder<'_, A> {
    fn record(
        &mut self,
        attempt: u32,
        similarity: f64,
        success: bool,
        message: String,
    ) -> AppResult<()> {
        self.audit.record(&AuditRecord {
            timestamp: Utc::now(),
            request_id: self.context.request_id,
            identity: self.identity.to_string(),
            similarity,
            threshold: self.policy.threshold,
            outcome: if success {
                AuditOutcome::Success
            } else {
                AuditOutcome::Failure
            },
            attempt_number: attempt,
            notes: message.clone(),
            origin: self.context.origin.clone(),
        })?;
        info!(attempt, similarity, success, "{message}");
        self.logs.push(format!("Attempt {attempt}: {message}"));
        self.attempts.push(VerificationAttempt {
            attempt_number: attempt,
            similarity,
            success,
            message,
        });
        Ok(())
    }

    fn fail(&mut self, attempt: u32, message: String) -> AppResult<VerificationState> {
        self.record(attempt, 0.0, false, message)?;
        Ok(self.policy.after_attempt(attempt, false))
    }
}

/// Drives `Start -> Capturing -> Scoring -> {Success | Retry | Exhausted}`.
/// Each attempt pulls one fresh frame from `frames`; attempts never overlap.
pub fn run_verification<S, A, F>(
    pipeline: &FacePipeline,
    store: &S,
    audit: &A,
    policy: AttemptPolicy,
    identity: &str,
    frames: &mut F,
    context: &AuditContext,
) -> AppResult<VerificationResult>
where
    S: TemplateStore + ?Sized,
    A: AuditSink + ?Sized,
    F: FrameSource + ?Sized,
{
    validate_identity(identity)?;
    let span = info_span!("verify", identity, request_id = %context.request_id);
    let _entered = span.enter();

    let mut recorder = AttemptRecorder {
        identity,
        policy,
        audit,
        context,
        attempts: Vec::new(),
        logs: Vec::new(),
    };
    let mut reference: Option<Embedding> = None;
    let mut state = VerificationState::Start;

    while !state.is_terminal() {
        state = match state {
            VerificationState::Start => match store.load(identity) {
                Ok(embedding) => {
                    reference = Some(embedding);
                    VerificationState::Capturing { attempt: 1 }
                }
                Err(AppError::NotEnrolled { .. }) => VerificationState::NotEnrolled,
                Err(err) => return Err(err),
            },
            VerificationState::Capturing { attempt } => {
                let analysis = frames
                    .next_frame(attempt)
                    .and_then(|source| pipeline.analyze(&source));
                match analysis {
                    Ok(FaceAnalysis::Face { embedding, .. }) => VerificationState::Scoring {
                        attempt,
                        captured: embedding,
                    },
                    Ok(FaceAnalysis::NoFace) => {
                        recorder.fail(attempt, "No face detected in image".into())?
                    }
                    Ok(FaceAnalysis::ExtractionFailed(failure)) => recorder.fail(
                        attempt,
                        format!("Failed to compute embedding from image ({failure})"),
                    )?,
                    Ok(FaceAnalysis::Spoof(reason)) => {
                        recorder.fail(attempt, format!("Liveness check failed: {reason}"))?
                    }
                    Err(err) if err.kind() == ErrorKind::Input => {
                        warn!(attempt, error = %err, "unusable verification frame");
                        recorder.fail(attempt, format!("Invalid image: {err}"))?
                    }
                    Err(err) => return Err(err),
                }
            }
            VerificationState::Scoring { attempt, captured } => {
                let Some(stored) = reference.as_ref() else {
                    return Err(AppError::NotEnrolled {
                        identity: identity.to_string(),
                    });
                };
                let similarity = match cosine_similarity(stored.as_slice(), captured.as_slice()) {
                    Ok(similarity) => similarity,
                    Err(err) => {
                        recorder.record(attempt, 0.0, false, format!("Integrity failure: {err}"))?;
                        error!(attempt, error = %err, "stored template is incompatible with the captured frame");
                        return Err(err);
                    }
                };
                let decision = MatchDecision::judge(similarity, policy.threshold);
                let message = if decision.accepted {
                    format!("Verification successful (similarity: {similarity:.4})")
                } else {
                    format!(
                        "Verification failed - insufficient similarity ({similarity:.4} < {:.4})",
                        policy.threshold
                    )
                };
                recorder.record(attempt, similarity, decision.accepted, message)?;
                policy.after_attempt(attempt, decision.accepted)
            }
            VerificationState::Retry { attempt } => VerificationState::Capturing {
                attempt: attempt + 1,
            },
            terminal => terminal,
        };
    }

    let (verified, status, final_message) = match state {
        VerificationState::Success { attempt } => (
            true,
            VerificationStatus::Verified,
            format!("Verification successful on attempt {attempt}"),
        ),
        VerificationState::Exhausted { attempts } => (
            false,
            VerificationStatus::Exhausted,
            format!("Verification failed after {attempts} attempts"),
        ),
        _ => (
            false,
            VerificationStatus::NotEnrolled,
            format!("No stored embedding for identity {identity}"),
        ),
    };
    info!(verified, attempts = recorder.attempts.len(), "{final_message}");

    let AttemptRecorder {
        attempts, mut logs, ..
    } = recorder;
    logs.push(final_message.clone());
    Ok(VerificationResult {
        identity: identity.to_string(),
        request_id: context.request_id,
        verified,
        status,
        threshold: policy.threshold,
        attempts,
        final_message,
        timestamp: Utc::now(),
        logs,
    })
}
