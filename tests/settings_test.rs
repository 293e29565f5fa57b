//! Functional tests for configuration loading

use std::io::Write;
use tempfile::NamedTempFile;

use genmedia_admission::config::Settings;
use genmedia_admission::AdmissionControl;

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn file_values_override_defaults() {
    let file = write_config(
        r#"
[queue]
max_concurrent = 2

[limiter.donor]
per_minute = 20
per_hour = 600
per_day = 2000
queue_priority = 1
grace_requests = 50

[[router.instances]]
url = "http://gpu-1.internal:7860"
name = "gpu-1"
priority = 1

[[router.instances]]
url = "http://gpu-2.internal:7860"
name = "gpu-2"
priority = 2
"#,
    );

    let settings = Settings::load_from_path(file.path()).unwrap();
    assert_eq!(settings.queue.max_concurrent, 2);
    assert_eq!(settings.limiter.donor.per_minute, 20);
    assert_eq!(settings.limiter.donor.grace_requests, 50);

    // Untouched sections keep their defaults.
    assert_eq!(settings.limiter.anonymous.per_minute, 3);
    assert_eq!(settings.backoff.max_secs, 300);

    assert_eq!(settings.router.instances.len(), 2);
    assert_eq!(settings.router.instances[1].name, "gpu-2");
    assert!(settings.validate().is_ok());
}

#[test]
fn invalid_file_values_are_rejected_by_validation() {
    let file = write_config(
        r#"
[limiter.anonymous]
per_minute = 0
per_hour = 60
per_day = 100
queue_priority = 3
grace_requests = 5
"#,
    );

    let settings = Settings::load_from_path(file.path()).unwrap();
    assert!(settings.validate().is_err());
}

#[test]
fn admission_control_builds_from_loaded_settings() {
    let file = write_config(
        r#"
[workers]
count = 2

[[router.instances]]
url = "http://gpu-1.internal:7860"
name = "gpu-1"
"#,
    );

    let settings = Settings::load_from_path(file.path()).unwrap();
    let control = AdmissionControl::from_settings(settings).unwrap();

    assert!(control.router.is_some());
    assert_eq!(control.settings.workers.count, 2);
}

#[test]
fn router_is_absent_without_configured_instances() {
    let control = AdmissionControl::from_settings(Settings::default()).unwrap();
    assert!(control.router.is_none());
}

#[test]
fn invalid_settings_fail_fast_at_construction() {
    let mut settings = Settings::default();
    settings.queue.max_concurrent = 0;
    assert!(AdmissionControl::from_settings(settings).is_err());
}
