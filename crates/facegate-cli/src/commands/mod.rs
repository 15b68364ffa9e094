use std::any::Any;
use std::path::PathBuf;
use std::process::ExitCode;

use facegate_core::errors::AppResult;

use crate::cli::{Commands, OutputMode};

/// Exit status when the request was processed but the face was rejected.
pub const REJECTED_EXIT: u8 = 1;

pub trait CommandHandler: Send + Sync {
    fn execute(&self, mode: OutputMode, verbose: bool) -> AppResult<ExitCode>;
    fn as_any(&self) -> &dyn Any;
}

mod enroll;
mod info;
mod list;
mod verify;

pub use enroll::EnrollHandler;
pub use info::InfoHandler;
pub use list::ListHandler;
pub use verify::{frame_source, VerifyHandler};

/// Builds the handler for `command`, loading settings from `config` when set.
pub fn handler_for(command: Commands, config: Option<PathBuf>) -> Box<dyn CommandHandler> {
    match command {
        Commands::Enroll(args) => Box::new(EnrollHandler::new(args, config)),
        Commands::Verify(args) => Box::new(VerifyHandler::new(args, config)),
        Commands::List => Box::new(ListHandler::new(config)),
        Commands::Info(args) => Box::new(InfoHandler::new(args, config)),
    }
}

impl From<Commands> for Box<dyn CommandHandler> {
    fn from(command: Commands) -> Self {
        handler_for(command, None)
    }
}
