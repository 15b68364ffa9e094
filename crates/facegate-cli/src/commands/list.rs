use std::any::Any;
use std::path::PathBuf;
use std::process::ExitCode;

use facegate_core::errors::AppResult;

use crate::cli::OutputMode;
use crate::commands::CommandHandler;
use crate::gate::open_gate;
use crate::output::render_list;

pub struct ListHandler {
    run: Box<dyn Fn() -> AppResult<Vec<String>> + Send + Sync>,
}

impl ListHandler {
    pub fn new(config: Option<PathBuf>) -> Self {
        Self::with_dependencies(move || open_gate(config.as_deref())?.list_enrolled())
    }

    pub fn with_dependencies(
        run: impl Fn() -> AppResult<Vec<String>> + Send + Sync + 'static,
    ) -> Self {
        Self { run: Box::new(run) }
    }
}

impl CommandHandler for ListHandler {
    fn execute(&self, mode: OutputMode, _verbose: bool) -> AppResult<ExitCode> {
        let identities = (self.run)()?;
        render_list(&identities, mode)?;
        Ok(ExitCode::SUCCESS)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
