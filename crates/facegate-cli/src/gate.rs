use std::path::Path;

use facegate_config::{load_explicit, load_resolved_config, ResolvedConfig};
use facegate_core::errors::AppResult;
use facegate_core::FaceGate;
use tracing::debug;

/// Explicit `--config` path if given, otherwise the default search list.
pub fn load_config(path: Option<&Path>) -> AppResult<ResolvedConfig> {
    let loaded = match path {
        Some(path) => load_explicit(path)?,
        None => load_resolved_config()?,
    };
    match &loaded.source {
        Some(source) => debug!(path = %source.display(), "loaded configuration"),
        None => debug!("no configuration file found; using defaults"),
    }
    Ok(loaded.resolved)
}

pub fn open_gate(path: Option<&Path>) -> AppResult<FaceGate> {
    FaceGate::from_config(&load_config(path)?)
}
