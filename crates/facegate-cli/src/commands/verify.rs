use std::any::Any;
use std::path::PathBuf;
use std::process::ExitCode;

use facegate_core::errors::AppResult;
use facegate_core::faces::VerificationResult;
use facegate_core::{AuditContext, FrameSource, ImageSource, RepeatSource, SequenceSource};
use tracing::warn;

use crate::cli::{OutputMode, VerifyArgs};
use crate::commands::{CommandHandler, REJECTED_EXIT};
use crate::gate::open_gate;
use crate::output::render_verify;

pub struct VerifyHandler {
    args: VerifyArgs,
    run: Box<dyn Fn(&VerifyArgs) -> AppResult<VerificationResult> + Send + Sync>,
    render: Box<dyn Fn(&VerificationResult, OutputMode, bool) -> AppResult<()> + Send + Sync>,
}

impl VerifyHandler {
    pub fn new(args: VerifyArgs, config: Option<PathBuf>) -> Self {
        Self::with_dependencies(
            args,
            move |args| {
                let gate = open_gate(config.as_deref())?;
                let (mut frames, max_attempts) = frame_source(args)?;
                let context = AuditContext::new().with_origin("cli");
                gate.verify_with_context(&args.identity, frames.as_mut(), max_attempts, &context)
            },
            render_verify,
        )
    }

    pub fn with_dependencies(
        args: VerifyArgs,
        run: impl Fn(&VerifyArgs) -> AppResult<VerificationResult> + Send + Sync + 'static,
        render: impl Fn(&VerificationResult, OutputMode, bool) -> AppResult<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            args,
            run: Box::new(run),
            render: Box::new(render),
        }
    }
}

/// A single image is retried as-is; several images are consumed one per
/// attempt, never more attempts than images.
pub fn frame_source(args: &VerifyArgs) -> AppResult<(Box<dyn FrameSource>, Option<u32>)> {
    let mut sources = args
        .images
        .iter()
        .map(|image| ImageSource::parse(image))
        .collect::<AppResult<Vec<_>>>()?;
    if sources.len() == 1 {
        if let Some(source) = sources.pop() {
            return Ok((Box::new(RepeatSource::new(source)), args.max_attempts));
        }
    }
    let available = sources.len() as u32;
    let attempts = match args.max_attempts {
        Some(requested) if requested > available => {
            warn!(
                requested,
                available, "attempt limit exceeds the images supplied; capping"
            );
            available
        }
        Some(requested) => requested,
        None => available,
    };
    Ok((Box::new(SequenceSource::new(sources)), Some(attempts)))
}

impl CommandHandler for VerifyHandler {
    fn execute(&self, mode: OutputMode, verbose: bool) -> AppResult<ExitCode> {
        let result = (self.run)(&self.args)?;
        (self.render)(&result, mode, verbose)?;
        if result.verified {
            Ok(ExitCode::SUCCESS)
        } else {
            Ok(ExitCode::from(REJECTED_EXIT))
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
