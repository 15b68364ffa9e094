use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use facegate_cli::cli::{EnrollArgs, InfoArgs, OutputMode, VerifyArgs};
use facegate_cli::commands::{
    frame_source, CommandHandler, EnrollHandler, InfoHandler, ListHandler, VerifyHandler,
};
use facegate_cli::errors::{AppError, ErrorKind};
use facegate_core::faces::{VerificationAttempt, VerificationResult, VerificationStatus};
use image::{Rgb, RgbImage};
use tempfile::TempDir;
use uuid::Uuid;

fn verify_args(images: &[&str], max_attempts: Option<u32>) -> VerifyArgs {
    VerifyArgs {
        identity: "alice".into(),
        images: images.iter().map(|image| image.to_string()).collect(),
        max_attempts,
    }
}

fn result(verified: bool) -> VerificationResult {
    VerificationResult {
        identity: "alice".into(),
        request_id: Uuid::new_v4(),
        verified,
        status: if verified {
            VerificationStatus::Verified
        } else {
            VerificationStatus::Exhausted
        },
        threshold: 0.75,
        attempts: vec![VerificationAttempt {
            attempt_number: 1,
            similarity: if verified { 0.93 } else { 0.12 },
            success: verified,
            message: String::new(),
        }],
        final_message: String::new(),
        timestamp: Utc::now(),
        logs: Vec::new(),
    }
}

#[test]
fn verified_result_exits_successfully() {
    let render_calls = Arc::new(Mutex::new(Vec::new()));
    let handler = VerifyHandler::with_dependencies(
        verify_args(&["frame.png"], None),
        |_args| Ok(result(true)),
        {
            let render_calls = Arc::clone(&render_calls);
            move |result, mode, verbose| {
                render_calls.lock().unwrap().push((result.verified, mode, verbose));
                Ok(())
            }
        },
    );

    let exit = handler.execute(OutputMode::Human, false).unwrap();
    assert_eq!(exit, ExitCode::SUCCESS);
    assert_eq!(
        render_calls.lock().unwrap().as_slice(),
        &[(true, OutputMode::Human, false)]
    );
}

#[test]
fn exhausted_result_exits_with_rejection_code() {
    let handler = VerifyHandler::with_dependencies(
        verify_args(&["frame.png"], Some(1)),
        |_args| Ok(result(false)),
        |_result, _mode, _verbose| Ok(()),
    );
    assert_eq!(
        handler.execute(OutputMode::Json, false).unwrap(),
        ExitCode::from(1)
    );
}

#[test]
fn single_image_keeps_configured_attempt_limit() {
    let (_, attempts) = frame_source(&verify_args(&["frame.png"], None)).unwrap();
    assert_eq!(attempts, None);
    let (_, attempts) = frame_source(&verify_args(&["frame.png"], Some(4))).unwrap();
    assert_eq!(attempts, Some(4));
}

#[test]
fn several_images_default_to_one_attempt_each() {
    let (_, attempts) = frame_source(&verify_args(&["a.png", "b.png", "c.png"], None)).unwrap();
    assert_eq!(attempts, Some(3));
    let (_, attempts) = frame_source(&verify_args(&["a.png", "b.png", "c.png"], Some(2))).unwrap();
    assert_eq!(attempts, Some(2));
}

#[test]
fn attempt_limit_is_capped_at_image_count() {
    let (mut frames, attempts) =
        frame_source(&verify_args(&["a.png", "b.png"], Some(5))).unwrap();
    assert_eq!(attempts, Some(2));
    assert!(frames.next_frame(1).is_ok());
    assert!(frames.next_frame(2).is_ok());
}

#[test]
fn malformed_embedded_image_is_an_input_error() {
    let err = frame_source(&verify_args(&["data:text/plain;base64,aGk="], None))
        .err()
        .expect("non-image payload");
    assert_eq!(err.kind(), ErrorKind::Input);
}

fn face_image() -> RgbImage {
    let mut img = RgbImage::from_pixel(160, 160, Rgb([30, 30, 30]));
    let regions = [
        ((40, 120), (40, 120), 210),
        ((54, 74), (58, 72), 35),
        ((86, 106), (58, 72), 35),
        ((66, 94), (96, 104), 70),
    ];
    for ((x0, x1), (y0, y1), value) in regions {
        for y in y0..y1 {
            for x in x0..x1 {
                img.put_pixel(x, y, Rgb([value, value, value]));
            }
        }
    }
    img
}

fn write_config(dir: &Path) -> PathBuf {
    let path = dir.join("facegate.toml");
    let contents = format!(
        "store_dir = \"{}\"\nmin_blur_score = 10.0\n",
        dir.join("store").display()
    );
    fs::write(&path, contents).unwrap();
    path
}

#[test]
fn handlers_enroll_list_and_verify_against_config_file() {
    let tmp = TempDir::new().unwrap();
    let config = write_config(tmp.path());
    let image = tmp.path().join("alice.png");
    face_image().save(&image).unwrap();
    let image = image.display().to_string();

    let enroll = EnrollHandler::new(
        EnrollArgs {
            identity: "alice".into(),
            image: image.clone(),
            overwrite: false,
        },
        Some(config.clone()),
    );
    assert_eq!(enroll.execute(OutputMode::Json, false).unwrap(), ExitCode::SUCCESS);
    assert!(tmp.path().join("store/templates/alice.json").is_file());

    let list = ListHandler::new(Some(config.clone()));
    assert_eq!(list.execute(OutputMode::Json, false).unwrap(), ExitCode::SUCCESS);

    let verify = VerifyHandler::new(
        VerifyArgs {
            identity: "alice".into(),
            images: vec![image.clone()],
            max_attempts: None,
        },
        Some(config.clone()),
    );
    assert_eq!(verify.execute(OutputMode::Json, false).unwrap(), ExitCode::SUCCESS);

    let stranger = VerifyHandler::new(
        VerifyArgs {
            identity: "bob".into(),
            images: vec![image],
            max_attempts: None,
        },
        Some(config.clone()),
    );
    assert_eq!(
        stranger.execute(OutputMode::Json, false).unwrap(),
        ExitCode::from(1)
    );

    let info = InfoHandler::new(
        InfoArgs {
            identity: "bob".into(),
        },
        Some(config),
    );
    let err = info.execute(OutputMode::Json, false).unwrap_err();
    assert!(matches!(err, AppError::NotEnrolled { .. }));
}

#[test]
fn surplus_attempt_limit_exhausts_instead_of_failing_capture() {
    let tmp = TempDir::new().unwrap();
    let config = write_config(tmp.path());
    let face = tmp.path().join("alice.png");
    face_image().save(&face).unwrap();
    let blank = tmp.path().join("blank.png");
    RgbImage::from_pixel(160, 160, Rgb([200, 200, 200]))
        .save(&blank)
        .unwrap();

    let enroll = EnrollHandler::new(
        EnrollArgs {
            identity: "alice".into(),
            image: face.display().to_string(),
            overwrite: false,
        },
        Some(config.clone()),
    );
    assert_eq!(enroll.execute(OutputMode::Json, false).unwrap(), ExitCode::SUCCESS);

    let blank = blank.display().to_string();
    let outcome = Arc::new(Mutex::new(None));
    let verify = VerifyHandler::with_dependencies(
        VerifyArgs {
            identity: "alice".into(),
            images: vec![blank.clone(), blank],
            max_attempts: Some(4),
        },
        {
            let config = config.clone();
            move |args| {
                let gate = facegate_cli::gate::open_gate(Some(&config))?;
                let (mut frames, max_attempts) = frame_source(args)?;
                gate.verify(&args.identity, frames.as_mut(), max_attempts)
            }
        },
        {
            let outcome = Arc::clone(&outcome);
            move |result, _mode, _verbose| {
                *outcome.lock().unwrap() = Some((result.status, result.attempts.len()));
                Ok(())
            }
        },
    );

    assert_eq!(
        verify.execute(OutputMode::Json, false).unwrap(),
        ExitCode::from(1)
    );
    assert_eq!(
        *outcome.lock().unwrap(),
        Some((VerificationStatus::Exhausted, 2))
    );
}

#[test]
fn missing_explicit_config_is_reported() {
    let tmp = TempDir::new().unwrap();
    let list = ListHandler::new(Some(tmp.path().join("absent.toml")));
    let err = list.execute(OutputMode::Human, false).unwrap_err();
    assert!(matches!(err, AppError::Config(_)));
}
