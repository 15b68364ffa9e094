use std::any::Any;
use std::path::PathBuf;
use std::process::ExitCode;

use facegate_core::errors::AppResult;
use facegate_core::faces::EnrollmentOutcome;
use facegate_core::ImageSource;

use crate::cli::{EnrollArgs, OutputMode};
use crate::commands::{CommandHandler, REJECTED_EXIT};
use crate::gate::open_gate;
use crate::output::render_enroll;

pub struct EnrollHandler {
    args: EnrollArgs,
    run: Box<dyn Fn(&EnrollArgs) -> AppResult<EnrollmentOutcome> + Send + Sync>,
    render: Box<dyn Fn(&EnrollmentOutcome, OutputMode, bool) -> AppResult<()> + Send + Sync>,
}

impl EnrollHandler {
    pub fn new(args: EnrollArgs, config: Option<PathBuf>) -> Self {
        Self::with_dependencies(
            args,
            move |args| {
                let gate = open_gate(config.as_deref())?;
                let source = ImageSource::parse(&args.image)?;
                gate.enroll(&args.identity, &source, args.overwrite)
            },
            render_enroll,
        )
    }

    pub fn with_dependencies(
        args: EnrollArgs,
        run: impl Fn(&EnrollArgs) -> AppResult<EnrollmentOutcome> + Send + Sync + 'static,
        render: impl Fn(&EnrollmentOutcome, OutputMode, bool) -> AppResult<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            args,
            run: Box::new(run),
            render: Box::new(render),
        }
    }
}

impl CommandHandler for EnrollHandler {
    fn execute(&self, mode: OutputMode, verbose: bool) -> AppResult<ExitCode> {
        let outcome = (self.run)(&self.args)?;
        (self.render)(&outcome, mode, verbose)?;
        if outcome.is_enrolled() {
            Ok(ExitCode::SUCCESS)
        } else {
            Ok(ExitCode::from(REJECTED_EXIT))
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
