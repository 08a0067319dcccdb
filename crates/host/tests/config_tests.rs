//! Integration tests for configuration parsing
//!
//! Tests host configuration loading, including:
//! - Minimal and full TOML files
//! - Conversion into library policies
//! - Save and reload through the filesystem
//! - Invalid configuration handling

use host::HostConfig;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::tempdir;

const FULL_CONFIG: &str = r#"
[usb]
vendor_id = 0x05ac
default_timeout_ms = 2000

[open]
claim_attempts = 8
claim_retry_delay_us = 500
configuration = 1

[acquire]
retry_interval_ms = 100
attempts_per_second = 10

[event_loop]
slice_ms = 5
max_iterations = 200

[logging]
level = "debug"
"#;

fn write_config(content: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempdir().unwrap();
    let path = dir.path().join("host.toml");
    std::fs::write(&path, content).unwrap();
    (dir, path)
}

// ============================================================================
// Loading
// ============================================================================

mod loading {
    use super::*;

    #[test]
    fn test_load_full_config() {
        let (_dir, path) = write_config(FULL_CONFIG);
        let config = HostConfig::load(Some(path)).unwrap();

        assert_eq!(config.usb.vendor_id, 0x05ac);
        assert_eq!(config.usb.default_timeout_ms, 2000);
        assert_eq!(config.open.claim_attempts, 8);
        assert_eq!(config.acquire.attempts_per_second, 10);
        assert_eq!(config.event_loop.max_iterations, 200);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_load_empty_file_gives_defaults() {
        let (_dir, path) = write_config("");
        let config = HostConfig::load(Some(path)).unwrap();
        assert_eq!(config, HostConfig::default());
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempdir().unwrap();
        let result = HostConfig::load(Some(dir.path().join("absent.toml")));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_rejects_malformed_toml() {
        let (_dir, path) = write_config("[usb\nvendor_id = ");
        let err = HostConfig::load(Some(path)).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse config file"));
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let (_dir, path) = write_config("[logging]\nlevel = \"verbose\"\n");
        assert!(HostConfig::load(Some(path)).is_err());

        let (_dir, path) = write_config("[event_loop]\nmax_iterations = 0\n");
        assert!(HostConfig::load(Some(path)).is_err());
    }
}

// ============================================================================
// Policies
// ============================================================================

mod policies {
    use super::*;

    #[test]
    fn test_policies_from_full_config() {
        let (_dir, path) = write_config(FULL_CONFIG);
        let config = HostConfig::load(Some(path)).unwrap();

        let open = config.open_policy();
        assert_eq!(open.vendor_id, 0x05ac);
        assert_eq!(open.claim_attempts, 8);
        assert_eq!(open.claim_retry_delay, Duration::from_micros(500));
        assert_eq!(open.event_loop.slice, Duration::from_millis(5));
        assert_eq!(open.event_loop.max_iterations, 200);

        let acquire = config.acquire_policy();
        assert_eq!(acquire.retry_interval, Duration::from_millis(100));
        assert_eq!(acquire.budget_for(3), 30);

        assert_eq!(config.default_timeout(), Duration::from_secs(2));
    }
}

// ============================================================================
// Saving
// ============================================================================

mod saving {
    use super::*;

    #[test]
    fn test_save_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("dir").join("host.toml");

        let mut config = HostConfig::default();
        config.open.claim_attempts = 3;
        config.logging.level = "trace".to_string();
        config.save(&path).unwrap();

        assert!(path.exists());
        let reloaded = HostConfig::load(Some(path)).unwrap();
        assert_eq!(reloaded, config);
    }
}
