pub mod cli;
pub mod commands;
pub mod gate;
pub mod output;

pub use facegate_core::errors;
