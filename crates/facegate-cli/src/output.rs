use std::error::Error;
use std::io::{self, Write};

use facegate_core::errors::{AppError, AppResult};
use facegate_core::faces::{
    EnrollmentOutcome, EnrollmentStatus, TemplateMetadata, VerificationResult,
};
use serde_json::{json, Value};

use crate::cli::OutputMode;

fn write_json(payload: &Value) -> AppResult<()> {
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    let serialized = serde_json::to_string(payload)?;
    handle.write_all(serialized.as_bytes())?;
    handle.write_all(b"\n")?;
    Ok(())
}

pub fn enrollment_payload(outcome: &EnrollmentOutcome) -> Value {
    match &outcome.status {
        EnrollmentStatus::Enrolled(template) => json!({
            "success": true,
            "identity": outcome.identity,
            "message": outcome.message(),
            "template": {
                "quality": template.quality,
                "embedding_len": template.embedding.len(),
                "extraction_method": template.extraction_method,
                "config_version": template.config_version,
                "created_at": template.created_at,
            },
        }),
        EnrollmentStatus::Rejected(rejection) => json!({
            "success": false,
            "identity": outcome.identity,
            "message": outcome.message(),
            "rejection": rejection,
        }),
    }
}

pub fn render_enroll(outcome: &EnrollmentOutcome, mode: OutputMode, verbose: bool) -> AppResult<()> {
    match mode {
        OutputMode::Human => {
            if verbose {
                for line in &outcome.logs {
                    tracing::info!("{line}");
                }
            }
            if outcome.is_enrolled() {
                println!("Enrollment successful: {}", outcome.message());
            } else {
                println!("Enrollment rejected: {}", outcome.message());
            }
        }
        OutputMode::Json => write_json(&enrollment_payload(outcome))?,
    }
    Ok(())
}

pub fn render_verify(result: &VerificationResult, mode: OutputMode, verbose: bool) -> AppResult<()> {
    match mode {
        OutputMode::Human => {
            if verbose {
                for line in &result.logs {
                    tracing::info!("{line}");
                }
            }
            for attempt in &result.attempts {
                println!(
                    "attempt {}: similarity {:.4} {}",
                    attempt.attempt_number,
                    attempt.similarity,
                    if attempt.success { "match" } else { "no match" }
                );
            }
            println!("{}", result.final_message);
        }
        OutputMode::Json => write_json(&serde_json::to_value(result)?)?,
    }
    Ok(())
}

pub fn render_list(identities: &[String], mode: OutputMode) -> AppResult<()> {
    match mode {
        OutputMode::Human => {
            if identities.is_empty() {
                println!("No identities enrolled");
            }
            for identity in identities {
                println!("{identity}");
            }
        }
        OutputMode::Json => write_json(&json!({
            "count": identities.len(),
            "identities": identities,
        }))?,
    }
    Ok(())
}

pub fn render_info(metadata: &TemplateMetadata, mode: OutputMode) -> AppResult<()> {
    match mode {
        OutputMode::Human => {
            println!("identity: {}", metadata.identity);
            if let Some(enrolled_at) = metadata.enrolled_at {
                println!("enrolled_at: {}", enrolled_at.to_rfc3339());
            }
            if let Some(quality) = metadata.quality {
                println!("quality: {quality:.4}");
            }
            if let Some(method) = metadata.extraction_method {
                println!("extraction_method: {method}");
            }
            if let Some(len) = metadata.embedding_len {
                println!("embedding_len: {len}");
            }
            if let Some(version) = &metadata.config_version {
                println!("config_version: {version}");
            }
            if let Some(source) = &metadata.source {
                println!("source: {source}");
            }
        }
        OutputMode::Json => write_json(&serde_json::to_value(metadata)?)?,
    }
    Ok(())
}

pub fn error_payload(err: &AppError) -> Value {
    json!({
        "success": false,
        "kind": err.kind().as_str(),
        "error": err.human_message(),
    })
}

pub fn render_error(err: &AppError, mode: OutputMode) {
    match mode {
        OutputMode::Human => {
            eprintln!("error: {}", err.human_message());
        }
        OutputMode::Json => {
            if let Ok(json) = serde_json::to_string(&error_payload(err)) {
                println!("{json}");
            }
        }
    }
    if let Some(source) = err.source() {
        eprintln!("cause: {source}");
    }
}
