//! Logging configuration and initialization tests.

use std::path::PathBuf;
use std::sync::Mutex;

use vme_runner::telemetry::{init_logging, LogConfig, LogError, LogFormat};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in ["VME_LOG", "VME_LOG_FORMAT", "VME_LOG_FILE"] {
        std::env::remove_var(key);
    }
}

// =============================================================================
// LogConfig Tests
// =============================================================================

#[test]
fn log_config_default_is_pretty_info() {
    let config = LogConfig::default();
    assert_eq!(config.format, LogFormat::Pretty);
    assert_eq!(config.level, "info");
    assert!(config.output_path.is_none());
}

#[test]
fn log_config_from_env_reads_all_variables() {
    let _lock = ENV_LOCK.lock().unwrap();
    clear_env();
    std::env::set_var("VME_LOG", "vme_runner=debug");
    std::env::set_var("VME_LOG_FORMAT", "JSON");
    std::env::set_var("VME_LOG_FILE", "/tmp/vme-runner.log");
    let config = LogConfig::from_env();
    assert_eq!(config.level, "vme_runner=debug");
    assert_eq!(config.format, LogFormat::Json);
    assert_eq!(config.output_path, Some(PathBuf::from("/tmp/vme-runner.log")));
    clear_env();
}

#[test]
fn log_config_from_env_ignores_bad_format() {
    let _lock = ENV_LOCK.lock().unwrap();
    clear_env();
    std::env::set_var("VME_LOG_FORMAT", "xml");
    std::env::set_var("VME_LOG", "   ");
    let config = LogConfig::from_env();
    assert_eq!(config.format, LogFormat::Pretty);
    assert_eq!(config.level, "info");
    clear_env();
}

#[test]
fn log_format_parses_aliases() {
    assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
    assert_eq!("text".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
    assert!(matches!(
        "yaml".parse::<LogFormat>(),
        Err(LogError::InvalidFormat(_))
    ));
}

// =============================================================================
// LogError Tests
// =============================================================================

#[test]
fn log_error_invalid_filter_display() {
    let error = LogError::InvalidFilter("bad filter".to_string());
    assert!(error.to_string().contains("Invalid log filter"));
    assert!(error.to_string().contains("bad filter"));
}

#[test]
fn log_error_already_initialized_display() {
    let error = LogError::AlreadyInitialized;
    assert!(error.to_string().contains("already initialized"));
}

// =============================================================================
// Initialization
// =============================================================================

#[test]
fn init_rejects_bad_filter_before_installing() {
    let config = LogConfig {
        level: "vme_runner=[".to_string(),
        ..LogConfig::default()
    };
    assert!(matches!(
        init_logging(&config),
        Err(LogError::InvalidFilter(_))
    ));
}

#[test]
fn init_reports_unwritable_file() {
    let config = LogConfig {
        output_path: Some(PathBuf::from("/nonexistent/dir/vme.log")),
        ..LogConfig::default()
    };
    assert!(matches!(init_logging(&config), Err(LogError::FileOpen(_))));
}

#[test]
fn init_writes_json_and_refuses_second_subscriber() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("runner.log");
    let config = LogConfig {
        format: LogFormat::Json,
        level: "info".to_string(),
        output_path: Some(path.clone()),
    };
    init_logging(&config).unwrap();
    tracing::info!(test = "hello", "test started");

    let contents = std::fs::read_to_string(&path).unwrap();
    let line = contents.lines().next().expect("one log line");
    let event: serde_json::Value = serde_json::from_str(line).unwrap();
    assert_eq!(event["fields"]["message"], "test started");
    assert_eq!(event["fields"]["test"], "hello");

    assert!(matches!(
        init_logging(&LogConfig::default()),
        Err(LogError::AlreadyInitialized)
    ));
}
