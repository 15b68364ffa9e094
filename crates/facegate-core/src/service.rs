use std::sync::Arc;

use facegate_config::ResolvedConfig;
use tracing::debug;

use crate::audit::{AuditContext, AuditSink, JsonlAuditLog};
use crate::capture::{FrameSource, ImageSource};
use crate::errors::AppResult;
use crate::faces::enrollment::{run_enrollment, EnrollmentOutcome, EnrollmentPolicy};
use crate::faces::pipeline::FacePipeline;
use crate::faces::store::{
    validate_identity, FilesystemTemplateStore, TemplateKey, TemplateMetadata, TemplateStore,
};
use crate::faces::verification::{run_verification, AttemptPolicy, VerificationResult};

/// Enrollment and verification entry point shared by every caller.
///
/// Requests are independent; the only shared mutable state lives behind the
/// template store and audit sink, so a `FaceGate` can be shared across threads.
pub struct FaceGate {
    pipeline: FacePipeline,
    store: Arc<dyn TemplateStore>,
    audit: Arc<dyn AuditSink>,
    threshold: f64,
    max_attempts: u32,
    enrollment: EnrollmentPolicy,
}

impl FaceGate {
    /// Filesystem-backed gate rooted at `config.store_dir`.
    pub fn from_config(config: &ResolvedConfig) -> AppResult<Self> {
        let key = config
            .template_key
            .as_deref()
            .map(TemplateKey::from_base64)
            .transpose()?;
        debug!(
            store = %config.store_dir.display(),
            audit = %config.audit_dir.display(),
            encrypted = key.is_some(),
            method = %config.extraction_method,
            "opening face gate"
        );
        let store = FilesystemTemplateStore::new(&config.store_dir).with_key(key);
        let audit = JsonlAuditLog::new(&config.audit_dir);
        Ok(Self::with_components(
            config,
            FacePipeline::from_config(config),
            Arc::new(store),
            Arc::new(audit),
        ))
    }

    pub fn with_components(
        config: &ResolvedConfig,
        pipeline: FacePipeline,
        store: Arc<dyn TemplateStore>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            pipeline,
            store,
            audit,
            threshold: config.similarity_threshold,
            max_attempts: config.max_verification_attempts,
            enrollment: EnrollmentPolicy {
                min_blur_score: config.min_blur_score,
                config_version: config.config_version.clone(),
            },
        }
    }

    pub fn store(&self) -> &dyn TemplateStore {
        self.store.as_ref()
    }

    pub fn enroll(
        &self,
        identity: &str,
        source: &ImageSource,
        overwrite: bool,
    ) -> AppResult<EnrollmentOutcome> {
        run_enrollment(
            &self.pipeline,
            self.store.as_ref(),
            &self.enrollment,
            identity,
            source,
            overwrite,
        )
    }

    /// `max_attempts` overrides the configured budget for this request only.
    pub fn verify(
        &self,
        identity: &str,
        frames: &mut dyn FrameSource,
        max_attempts: Option<u32>,
    ) -> AppResult<VerificationResult> {
        self.verify_with_context(identity, frames, max_attempts, &AuditContext::new())
    }

    pub fn verify_with_context(
        &self,
        identity: &str,
        frames: &mut dyn FrameSource,
        max_attempts: Option<u32>,
        context: &AuditContext,
    ) -> AppResult<VerificationResult> {
        let policy = AttemptPolicy::new(self.threshold, max_attempts.unwrap_or(self.max_attempts));
        run_verification(
            &self.pipeline,
            self.store.as_ref(),
            self.audit.as_ref(),
            policy,
            identity,
            frames,
            context,
        )
    }

    pub fn list_enrolled(&self) -> AppResult<Vec<String>> {
        self.store.list()
    }

    pub fn enrollment_info(&self, identity: &str) -> AppResult<TemplateMetadata> {
        validate_identity(identity)?;
        self.store.metadata(identity)
    }
}
