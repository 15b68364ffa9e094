use std::any::Any;
use std::path::PathBuf;
use std::process::ExitCode;

use facegate_core::errors::AppResult;
use facegate_core::faces::TemplateMetadata;

use crate::cli::{InfoArgs, OutputMode};
use crate::commands::CommandHandler;
use crate::gate::open_gate;
use crate::output::render_info;

pub struct InfoHandler {
    args: InfoArgs,
    run: Box<dyn Fn(&InfoArgs) -> AppResult<TemplateMetadata> + Send + Sync>,
}

impl InfoHandler {
    pub fn new(args: InfoArgs, config: Option<PathBuf>) -> Self {
        Self::with_dependencies(args, move |args| {
            open_gate(config.as_deref())?.enrollment_info(&args.identity)
        })
    }

    pub fn with_dependencies(
        args: InfoArgs,
        run: impl Fn(&InfoArgs) -> AppResult<TemplateMetadata> + Send + Sync + 'static,
    ) -> Self {
        Self {
            args,
            run: Box::new(run),
        }
    }
}

impl CommandHandler for InfoHandler {
    fn execute(&self, mode: OutputMode, _verbose: bool) -> AppResult<ExitCode> {
        let metadata = (self.run)(&self.args)?;
        render_info(&metadata, mode)?;
        Ok(ExitCode::SUCCESS)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
