mod common;

use common::{BlindDetector, DeviceCounter, RecordingObserver, WholeFrameDetector};
use geoattend::{
    CancelToken, EnrollError, EnrollmentCapture, EnrollmentRegistry, EnrollmentSettings,
    SampleStore,
};
use geoattend_core::Identity;
use std::time::Duration;
use tempfile::TempDir;

fn settings(quota: usize) -> EnrollmentSettings {
    EnrollmentSettings {
        sample_quota: quota,
        warmup_frames: 1,
        read_retry: Duration::from_millis(1),
    }
}

fn png_count(dir: &std::path::Path) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| entries.filter_map(Result::ok).count())
        .unwrap_or(0)
}

#[test]
fn test_enroll_reaches_quota_and_registers() {
    let dir = TempDir::new().unwrap();
    let mut registry = EnrollmentRegistry::open(dir.path().join("registry.csv")).unwrap();
    let samples = SampleStore::new(dir.path().join("samples"));
    let devices = DeviceCounter::default();
    let mut observer = RecordingObserver::default();

    let summary = EnrollmentCapture::new(
        settings(5),
        &mut registry,
        &samples,
        WholeFrameDetector,
        &mut observer,
        CancelToken::new(),
    )
    .enroll(" 101 ", " Alice ", || devices.open(false))
    .unwrap();

    assert_eq!(summary.record.identity, Identity(101));
    assert_eq!(summary.record.display_name, "Alice");
    assert_eq!(summary.samples, 5);
    assert!(!summary.cancelled);
    assert_eq!(summary.sample_dir, dir.path().join("samples/101_Alice"));
    assert_eq!(png_count(&summary.sample_dir), 5);
    assert!(summary.sample_dir.join("Alice_101_5.png").exists());
    assert_eq!(observer.samples, 5);
    assert_eq!(devices.released.get(), 1);

    let reloaded = EnrollmentRegistry::open(dir.path().join("registry.csv")).unwrap();
    assert_eq!(reloaded.records().len(), 1);
    assert_eq!(reloaded.display_name(Identity(101)), Some("Alice"));
}

#[test]
fn test_invalid_input_never_opens_camera() {
    let dir = TempDir::new().unwrap();
    let mut registry = EnrollmentRegistry::open(dir.path().join("registry.csv")).unwrap();
    let samples = SampleStore::new(dir.path().join("samples"));
    let devices = DeviceCounter::default();
    let mut observer = RecordingObserver::default();

    for (id, name) in [("", "Alice"), ("101", ""), ("abc", "Alice")] {
        let err = EnrollmentCapture::new(
            settings(5),
            &mut registry,
            &samples,
            WholeFrameDetector,
            &mut observer,
            CancelToken::new(),
        )
        .enroll(id, name, || devices.open(false))
        .unwrap_err();
        assert!(matches!(err, EnrollError::Validation(_)), "{id:?}/{name:?}: {err}");
    }

    assert_eq!(devices.opened.get(), 0);
    assert!(registry.records().is_empty());
    assert!(!dir.path().join("registry.csv").exists());
}

#[test]
fn test_cancel_before_any_sample() {
    let dir = TempDir::new().unwrap();
    let mut registry = EnrollmentRegistry::open(dir.path().join("registry.csv")).unwrap();
    let samples = SampleStore::new(dir.path().join("samples"));
    let devices = DeviceCounter::default();
    let mut observer = RecordingObserver::default();
    let cancel = CancelToken::new();
    let trigger = cancel.clone();

    let err = EnrollmentCapture::new(
        settings(5),
        &mut registry,
        &samples,
        BlindDetector,
        &mut observer,
        cancel,
    )
    .enroll("7", "Bob", || {
        devices.open_with(move |n| {
            if n == 4 {
                trigger.cancel();
            }
        })
    })
    .unwrap_err();

    assert!(matches!(err, EnrollError::Cancelled));
    assert!(registry.records().is_empty());
    assert_eq!(devices.released.get(), 1);
}

#[test]
fn test_cancel_after_samples_still_registers() {
    let dir = TempDir::new().unwrap();
    let mut registry = EnrollmentRegistry::open(dir.path().join("registry.csv")).unwrap();
    let samples = SampleStore::new(dir.path().join("samples"));
    let devices = DeviceCounter::default();
    let mut observer = RecordingObserver::default();
    let cancel = CancelToken::new();
    let trigger = cancel.clone();

    // Read 1 is warm-up; reads 2 and 3 each yield one sample.
    let summary = EnrollmentCapture::new(
        settings(50),
        &mut registry,
        &samples,
        WholeFrameDetector,
        &mut observer,
        cancel,
    )
    .enroll("7", "Bob", || {
        devices.open_with(move |n| {
            if n == 3 {
                trigger.cancel();
            }
        })
    })
    .unwrap();

    assert!(summary.cancelled);
    assert_eq!(summary.samples, 2);
    assert_eq!(registry.display_name(Identity(7)), Some("Bob"));
}

#[test]
fn test_duplicate_enrollment_appends() {
    let dir = TempDir::new().unwrap();
    let mut registry = EnrollmentRegistry::open(dir.path().join("registry.csv")).unwrap();
    let samples = SampleStore::new(dir.path().join("samples"));
    let devices = DeviceCounter::default();
    let mut observer = RecordingObserver::default();

    for name in ["Alice", "Alicia"] {
        EnrollmentCapture::new(
            settings(2),
            &mut registry,
            &samples,
            WholeFrameDetector,
            &mut observer,
            CancelToken::new(),
        )
        .enroll("101", name, || devices.open(false))
        .unwrap();
    }

    assert_eq!(registry.records().len(), 2);
    assert_eq!(registry.display_name(Identity(101)), Some("Alice"));
}
