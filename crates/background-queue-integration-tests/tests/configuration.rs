//! Integration tests for settings loading and broker selection
//!
//! These tests verify:
//! - Settings files are layered under `BGQ__*` environment variables
//! - Invalid settings are rejected before any broker is built
//! - The factory picks the broker the settings ask for

use background_queue::{ConfigurationError, QueueError, QueueFactory, QueueKind, QueueSettings};
use serial_test::serial;
use std::io::Write;

const OVERRIDES: [&str; 3] = ["BGQ__LOCAL", "BGQ__PREFIX", "BGQ__AWS__REGION"];

fn clear_overrides() {
    for key in OVERRIDES {
        std::env::remove_var(key);
    }
}

fn settings_file(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

/// Verify that environment variables override values from the settings file
#[test]
#[serial]
fn test_environment_overrides_file() {
    clear_overrides();
    let file = settings_file(
        "prefix: staging\nhostname: builder-7\naws:\n  region: us-east-1\npoll:\n  wait_time_seconds: 5\n",
    );
    std::env::set_var("BGQ__AWS__REGION", "eu-west-1");

    let settings = QueueSettings::load(Some(file.path())).unwrap();
    clear_overrides();

    assert_eq!(settings.prefix, "staging");
    assert_eq!(settings.resolved_hostname(), "builder-7");
    assert_eq!(settings.aws.region, "eu-west-1");
    assert_eq!(settings.poll.wait_time_seconds, 5);
    assert_eq!(settings.poll.max_messages, 10);
}

/// Verify that out-of-range poll settings fail to load
#[test]
#[serial]
fn test_invalid_poll_settings_are_rejected() {
    clear_overrides();
    let file = settings_file("poll:\n  max_messages: 50\n");

    let error = QueueSettings::load(Some(file.path())).unwrap_err();
    assert!(matches!(error, ConfigurationError::Invalid { .. }));
}

/// Verify that a missing settings file is an error
#[test]
#[serial]
fn test_missing_file_is_rejected() {
    clear_overrides();
    let error = QueueSettings::load(Some(std::path::Path::new("/nonexistent/bgq.yaml")));
    assert!(matches!(error, Err(ConfigurationError::Parsing { .. })));
}

/// Verify that `local` selects the in-process broker
#[test]
#[serial]
fn test_local_settings_select_in_process_broker() {
    clear_overrides();
    std::env::set_var("BGQ__LOCAL", "true");
    let settings = QueueSettings::load(None).unwrap();
    clear_overrides();

    let queue = QueueFactory::create(&settings).unwrap();
    assert_eq!(queue.kind(), QueueKind::InProcess);
}

/// Verify that remote settings select the durable broker without contacting the cloud
#[test]
#[serial]
fn test_remote_settings_select_durable_broker() {
    clear_overrides();
    let file = settings_file("prefix: staging\naws:\n  endpoint: http://localhost:4566\n");
    let settings = QueueSettings::load(Some(file.path())).unwrap();

    let queue = QueueFactory::create(&settings).unwrap();
    assert_eq!(queue.kind(), QueueKind::Durable);
}

/// Verify that the factory refuses settings that fail validation
#[test]
fn test_factory_rejects_empty_prefix() {
    let settings = QueueSettings {
        prefix: String::new(),
        ..Default::default()
    };

    let error = QueueFactory::create(&settings).err().unwrap();
    assert!(matches!(error, QueueError::ConfigurationError(_)));
}
