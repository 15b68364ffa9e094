use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "facegate",
    about = "Enroll faces and verify them against stored templates",
    version
)]
pub struct Cli {
    /// Emit structured JSON to stdout instead of human-readable logs
    #[arg(long, global = true)]
    pub json: bool,

    /// Increase verbosity (may be used multiple times)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Read settings from this file instead of the default search paths
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn output_mode(&self) -> OutputMode {
        if self.json {
            OutputMode::Json
        } else {
            OutputMode::Human
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Human,
    Json,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Store a reference template for an identity from one image
    Enroll(EnrollArgs),
    /// Check images against an identity's template, retrying up to the attempt limit
    Verify(VerifyArgs),
    /// List enrolled identities
    List,
    /// Show stored metadata for an identity
    Info(InfoArgs),
}

#[derive(Debug, Clone, Args)]
pub struct EnrollArgs {
    /// Identity to enroll
    pub identity: String,

    /// Image path or `data:image/...;base64,` payload
    pub image: String,

    /// Replace an existing template instead of refusing
    #[arg(long)]
    pub overwrite: bool,
}

#[derive(Debug, Clone, Args)]
pub struct VerifyArgs {
    /// Identity to verify
    pub identity: String,

    /// One image per attempt; a single image is reused for every attempt
    #[arg(required = true, num_args = 1..)]
    pub images: Vec<String>,

    /// Attempt limit for this request (defaults to the configured limit, or
    /// to the number of images when several are given, and never exceeds it)
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Clone, Args)]
pub struct InfoArgs {
    /// Identity to inspect
    pub identity: String,
}
