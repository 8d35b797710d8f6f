//! Integration tests for configuration loading

use queue_client::domain::types::{AccuracyTier, PermissionStatus};
use queue_client::infra::{Config, JoinPolicy};
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(content.as_bytes()).unwrap();
    temp_file.flush().unwrap();
    temp_file
}

#[test]
fn test_load_config_from_file() {
    let temp_file = write_config(
        r#"
[api]
base_url = "https://queue.example.test/"
timeout_ms = 4000
token = "secret"

[club]
slug = "tresor"

[location]
target_accuracy_m = 10.0
acceptable_accuracy_m = 25.0
max_wait_ms = 20000
min_duration_ms = 2000
accuracy_tier = "highest"

[geofence]
latitude = 52.5100
longitude = 13.4196
max_distance_m = 300.0
enforce = false

[session]
report_interval_secs = 60
join_policy = "allow_without_fix"

[simulation]
permission = "undetermined"
samples = [{ latitude = 52.51, longitude = 13.42, accuracy_m = 8.0 }]
"#,
    );

    let config = Config::from_file(temp_file.path()).unwrap();

    assert_eq!(config.api_base_url(), "https://queue.example.test");
    assert_eq!(config.api_timeout_ms(), 4000);
    assert_eq!(config.api_token(), Some("secret"));
    assert_eq!(config.club_slug(), "tresor");
    assert_eq!(config.join_policy(), JoinPolicy::AllowWithoutFix);
    assert_eq!(config.simulated_permission(), PermissionStatus::Undetermined);
    assert_eq!(config.simulated_samples().len(), 1);

    let acquisition = config.acquisition();
    assert_eq!(acquisition.target_accuracy_meters, 10.0);
    assert_eq!(acquisition.max_wait, Duration::from_secs(20));
    assert_eq!(acquisition.min_duration, Duration::from_secs(2));
    assert_eq!(acquisition.accuracy_tier, AccuracyTier::Highest);
    let fence = acquisition.geofence.unwrap();
    assert_eq!(fence.max_distance_meters, 300.0);
    assert!(!fence.enforce);

    let session = config.session();
    assert_eq!(session.club_slug, "tresor");
    assert_eq!(session.report_interval, Duration::from_secs(60));
}

#[test]
fn test_partial_file_keeps_defaults() {
    let temp_file = write_config("[club]\nslug = \"berghain\"\n");

    let config = Config::from_file(temp_file.path()).unwrap();

    assert_eq!(config.api_base_url(), "http://localhost:8000");
    assert_eq!(config.join_policy(), JoinPolicy::RequireFix);
    assert_eq!(config.session().report_interval, Duration::from_secs(120));
    assert_eq!(config.acquisition().acceptable_accuracy_meters, 30.0);
    assert!(config.acquisition().geofence.is_some());
}

#[test]
fn test_invalid_file_is_rejected() {
    let temp_file = write_config(
        r#"
[location]
target_accuracy_m = 50.0
acceptable_accuracy_m = 20.0
"#,
    );
    assert!(Config::from_file(temp_file.path()).is_err());

    let garbage = write_config("[location\nnot toml");
    assert!(Config::from_file(garbage.path()).is_err());
}

#[test]
fn test_load_from_path_fallback() {
    let config = Config::load_from_path("/nonexistent/config.toml");
    assert_eq!(config.api_base_url(), "http://localhost:8000");
    assert_eq!(config.club_slug(), "berghain");
    assert_eq!(config.acquisition().max_wait, Duration::from_secs(30));
}

#[test]
fn test_resolve_config_path_from_args() {
    let args = vec!["queue-client".to_string(), "--config".to_string(), "custom.toml".to_string()];
    assert_eq!(Config::resolve_config_path(&args), "custom.toml");
}
