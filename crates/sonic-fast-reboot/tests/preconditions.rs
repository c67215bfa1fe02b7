//! Precondition failures must leave the system untouched in every mode.

mod common;

use common::Harness;
use sonic_fast_reboot::{PreconditionError, RebootError, RebootExitCode, RebootMode, RebootOptions};
use std::fs;
use tokio_util::sync::CancellationToken;

async fn run(harness: &Harness, mode: RebootMode, options: &RebootOptions) -> RebootExitCode {
    harness
        .controller(CancellationToken::new())
        .execute(mode, options)
        .await
}

#[tokio::test]
async fn test_unprivileged_fails_in_every_mode() {
    for mode in RebootMode::ALL {
        let mut harness = Harness::new(Some("pre-shutdown-succeeded"));
        harness.host.privileged = false;

        let code = run(&harness, mode, &RebootOptions::default()).await;
        assert_eq!(code, RebootExitCode::Failure, "{}", mode);
        assert!(harness.untouched(), "{} touched the system", mode);
        assert!(!harness.config.paths.lock_file.exists());
    }
}

#[tokio::test]
async fn test_preconditions_checked_before_lock() {
    let mut harness = Harness::new(None);
    harness.host.privileged = false;
    // Lock path under a regular file, so taking the lock would fail.
    let blocker = harness.temp_dir.path().join("not-a-dir");
    fs::write(&blocker, b"").unwrap();
    harness.config.paths.lock_file = blocker.join("fast-reboot.lock");

    let err = harness
        .controller(CancellationToken::new())
        .run(RebootMode::Warm, &RebootOptions::default())
        .await
        .unwrap_err();
    assert!(
        matches!(err, RebootError::Precondition(PreconditionError::NotPrivileged)),
        "{}",
        err
    );
    assert!(err.is_precondition());
    assert!(harness.untouched());
}

#[tokio::test]
async fn test_unsupported_mode() {
    for mode in [RebootMode::Fast, RebootMode::Warm, RebootMode::FastFast] {
        let mut harness = Harness::new(None);
        harness.host.asic = "marvell".to_string();

        let code = run(&harness, mode, &RebootOptions::default()).await;
        assert_eq!(code, RebootExitCode::NotSupported, "{}", mode);
        assert!(harness.untouched());
    }

    let mut harness = Harness::new(None);
    harness.host.asic = "broadcom".to_string();
    let code = run(&harness, RebootMode::FastFast, &RebootOptions::default()).await;
    assert_eq!(code, RebootExitCode::NotSupported);
    assert!(harness.untouched());
}

#[tokio::test]
async fn test_missing_next_image() {
    for mode in [RebootMode::Fast, RebootMode::Warm, RebootMode::FastFast] {
        let mut harness = Harness::new(None);
        harness.image = None;

        let code = run(&harness, mode, &RebootOptions::default()).await;
        assert_eq!(code, RebootExitCode::NextImageNotExists, "{}", mode);
        assert!(harness.untouched());
    }
}

#[tokio::test]
async fn test_next_image_files_missing() {
    let mut harness = Harness::new(None);
    if let Some(image) = harness.image.as_mut() {
        image.initrd = harness.temp_dir.path().join("missing-initrd");
    }

    let code = run(&harness, RebootMode::Warm, &RebootOptions::default()).await;
    assert_eq!(code, RebootExitCode::NextImageNotExists);
    assert!(harness.untouched());
}

#[tokio::test]
async fn test_insufficient_space() {
    for mode in [RebootMode::Fast, RebootMode::Warm, RebootMode::FastFast] {
        let mut harness = Harness::new(None);
        harness.host.space_mb = 10;

        let code = run(&harness, mode, &RebootOptions::default()).await;
        assert_eq!(code, RebootExitCode::FileSystemFull, "{}", mode);
        assert!(harness.untouched());
    }
}

#[tokio::test]
async fn test_dry_run_touches_nothing() {
    let options = RebootOptions {
        dry_run: true,
        ..Default::default()
    };
    for mode in RebootMode::ALL {
        let harness = Harness::new(Some("pre-shutdown-succeeded"));

        let code = run(&harness, mode, &options).await;
        assert_eq!(code, RebootExitCode::Success, "{}", mode);
        assert!(harness.untouched(), "{} touched the system", mode);
        assert!(!harness.config.paths.lock_file.exists());
    }
}
