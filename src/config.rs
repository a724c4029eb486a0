//! Runtime configuration loading from environment variables.
//!
//! All configuration values are loaded from `VME_*` environment variables
//! with sensible defaults. Invalid values fall back to defaults without crashing.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `VME_PLATFORM` | linux | `linux`/`local` or `nitro`/`enclave` |
//! | `VME_TARGET` | x86_64-unknown-linux-fortanixvme | Guest target triple |
//! | `VME_RELEASE` | false | Build guests in release mode |
//! | `VME_CPU_COUNT` | 2 | Default vCPUs per test |
//! | `VME_MEMORY_MB` | 512 | Default memory per test (MiB) |
//! | `VME_CPU_CAPACITY` | host CPUs | Reservable vCPUs |
//! | `VME_MEMORY_CAPACITY_MB` | 8192 | Reservable memory (MiB) |
//! | `VME_TEST_TIMEOUT` | 120 | Per-test wait deadline (secs) |
//! | `VME_TERMINATE_GRACE_MS` | 5000 | Forced-termination grace (ms) |
//! | `VME_CONNECT_DEADLINE_MS` | 10000 | Channel connect deadline (ms) |
//! | `VME_CONNECT_BACKOFF_MS` | 50 | Initial connect backoff (ms) |
//! | `VME_BOOT_BANNER_LINES` | 11 | Enclave stdout lines discarded |
//! | `VME_BENIGN_STDERR` | `Start.*` | Benign enclave stderr pattern |
//! | `VME_COMMENT_MARKER` | `#` | Local stdout comment prefix |
//! | `VME_RUNNER_PORT` | 10000 | Runner proxy listen port |
//! | `VME_MAX_PROXY_SESSIONS` | 64 | Concurrent proxied sessions |
//! | `VME_BUILD_CMD` .. `VME_TERMINATE_ALL_CMD` | see [`crate::command`] | Collaborator templates |

use std::net::SocketAddr;
use std::time::Duration;

use serde::Serialize;

use crate::capability::{CapabilityProfile, Platform};
use crate::channel::{ChannelAddr, ConnectConfig, CID_ANY};
use crate::command::{
    CommandTemplate, DEFAULT_BUILD_CMD, DEFAULT_DESCRIBE_CMD, DEFAULT_MEASURE_CMD,
    DEFAULT_RUN_CMD, DEFAULT_TERMINATE_ALL_CMD,
};
use crate::enclave::{ManagerConfig, NitroCommands, ResourceConfig};
use crate::error::RunnerError;
use crate::filter::FilterConfig;
use crate::orchestrator::OrchestratorConfig;
use crate::proxy::{ProxyConfig, DEFAULT_RUNNER_PORT};
use crate::suite::CaseDefaults;

/// Default guest target triple.
pub const DEFAULT_TARGET: &str = "x86_64-unknown-linux-fortanixvme";

/// Effective runtime configuration summary (serializable).
#[derive(Debug, Clone, Serialize)]
pub struct EffectiveConfig {
    pub platform: String,
    pub target: String,
    pub release: bool,
    pub cpu_count: u32,
    pub memory_mb: u64,
    pub cpu_capacity: u32,
    pub memory_capacity_mb: u64,
    pub test_timeout_secs: u64,
    pub terminate_grace_ms: u64,
    pub connect_deadline_ms: u64,
    pub connect_backoff_ms: u64,
    pub boot_banner_lines: usize,
    pub benign_stderr: String,
    pub comment_marker: String,
    pub runner_port: u32,
    pub max_proxy_sessions: usize,
    pub build_cmd: String,
    pub measure_cmd: String,
    pub run_cmd: String,
    pub describe_cmd: String,
    pub terminate_all_cmd: String,
}

/// Collaborator command templates as configured (unparsed).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandConfig {
    pub build: String,
    pub measure: String,
    pub run: String,
    pub describe: String,
    pub terminate_all: String,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            build: DEFAULT_BUILD_CMD.to_string(),
            measure: DEFAULT_MEASURE_CMD.to_string(),
            run: DEFAULT_RUN_CMD.to_string(),
            describe: DEFAULT_DESCRIBE_CMD.to_string(),
            terminate_all: DEFAULT_TERMINATE_ALL_CMD.to_string(),
        }
    }
}

/// Parsed collaborator templates.
#[derive(Debug, Clone)]
pub struct Templates {
    pub build: CommandTemplate,
    pub measure: CommandTemplate,
    pub nitro: NitroCommands,
}

impl CommandConfig {
    pub fn parse(&self) -> Result<Templates, RunnerError> {
        let parse = |key: &str, text: &str| {
            CommandTemplate::parse(text).map_err(|e| match e {
                RunnerError::Config(msg) => RunnerError::Config(format!("{}: {}", key, msg)),
                other => other,
            })
        };
        Ok(Templates {
            build: parse("VME_BUILD_CMD", &self.build)?,
            measure: parse("VME_MEASURE_CMD", &self.measure)?,
            nitro: NitroCommands {
                run: parse("VME_RUN_CMD", &self.run)?,
                describe: parse("VME_DESCRIBE_CMD", &self.describe)?,
                terminate_all: parse("VME_TERMINATE_ALL_CMD", &self.terminate_all)?,
            },
        })
    }
}

/// All runtime configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub platform: Platform,
    pub target: String,
    pub release: bool,
    pub defaults: CaseDefaults,
    pub resources: ResourceConfig,
    pub manager: ManagerConfig,
    pub connect: ConnectConfig,
    pub filter: FilterConfig,
    pub runner_port: u32,
    pub max_proxy_sessions: usize,
    pub commands: CommandConfig,
}

/// Parse a `u32` env var, returning `default` on missing or invalid.
fn parse_u32(key: &str, default: u32) -> u32 {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<u32>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse a `u64` env var, returning `default` on missing or invalid.
fn parse_u64(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<u64>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse a `usize` env var, returning `default` on missing or invalid.
fn parse_usize(key: &str, default: usize) -> usize {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<usize>().unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => match val.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

/// Non-empty string env var, or `default`.
fn parse_string(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(val) if !val.trim().is_empty() => val,
        _ => default.to_string(),
    }
}

fn load_platform() -> Platform {
    std::env::var("VME_PLATFORM")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or_default()
}

/// Load per-test defaults from environment.
fn load_case_defaults() -> CaseDefaults {
    let cpu_count = parse_u32("VME_CPU_COUNT", 2).max(1);
    let memory_mb = parse_u64("VME_MEMORY_MB", 512).max(64); // floor: 64 MiB
    let timeout_secs = parse_u64("VME_TEST_TIMEOUT", 120).max(1);
    CaseDefaults {
        cpu_count,
        memory_mb,
        timeout: Duration::from_secs(timeout_secs),
    }
}

/// Load reservation capacity from environment.
fn load_resources() -> ResourceConfig {
    let defaults = ResourceConfig::default();
    let cpu_capacity = parse_u32("VME_CPU_CAPACITY", defaults.cpu_capacity).max(1);
    let memory_capacity_mb =
        parse_u64("VME_MEMORY_CAPACITY_MB", defaults.memory_capacity_mb).max(64);
    ResourceConfig {
        cpu_capacity,
        memory_capacity_mb,
    }
}

fn load_manager_config() -> ManagerConfig {
    let grace_ms = parse_u64("VME_TERMINATE_GRACE_MS", 5000).max(100); // floor: 100ms
    ManagerConfig {
        terminate_grace: Duration::from_millis(grace_ms),
        ..ManagerConfig::default()
    }
}

fn load_connect_config() -> ConnectConfig {
    let defaults = ConnectConfig::default();
    let deadline_ms = parse_u64("VME_CONNECT_DEADLINE_MS", 10_000).max(100);
    let backoff_ms = parse_u64("VME_CONNECT_BACKOFF_MS", 50).clamp(1, deadline_ms);
    ConnectConfig {
        deadline: Duration::from_millis(deadline_ms),
        initial_backoff: Duration::from_millis(backoff_ms),
        max_backoff: defaults.max_backoff.max(Duration::from_millis(backoff_ms)),
    }
}

fn load_filter_config() -> FilterConfig {
    let defaults = FilterConfig::default();
    FilterConfig {
        boot_banner_lines: parse_usize("VME_BOOT_BANNER_LINES", defaults.boot_banner_lines),
        benign_stderr: parse_string("VME_BENIGN_STDERR", &defaults.benign_stderr),
        comment_marker: parse_string("VME_COMMENT_MARKER", &defaults.comment_marker),
    }
}

fn load_commands() -> CommandConfig {
    CommandConfig {
        build: parse_string("VME_BUILD_CMD", DEFAULT_BUILD_CMD),
        measure: parse_string("VME_MEASURE_CMD", DEFAULT_MEASURE_CMD),
        run: parse_string("VME_RUN_CMD", DEFAULT_RUN_CMD),
        describe: parse_string("VME_DESCRIBE_CMD", DEFAULT_DESCRIBE_CMD),
        terminate_all: parse_string("VME_TERMINATE_ALL_CMD", DEFAULT_TERMINATE_ALL_CMD),
    }
}

/// Load all configuration from environment variables.
///
/// Missing or invalid values fall back to safe defaults without panicking.
pub fn load() -> EnvConfig {
    let runner_port = parse_u32("VME_RUNNER_PORT", DEFAULT_RUNNER_PORT);
    let runner_port = if runner_port > u32::from(u16::MAX) {
        DEFAULT_RUNNER_PORT
    } else {
        runner_port
    };

    EnvConfig {
        platform: load_platform(),
        target: parse_string("VME_TARGET", DEFAULT_TARGET),
        release: parse_bool("VME_RELEASE", false),
        defaults: load_case_defaults(),
        resources: load_resources(),
        manager: load_manager_config(),
        connect: load_connect_config(),
        filter: load_filter_config(),
        runner_port,
        max_proxy_sessions: parse_usize("VME_MAX_PROXY_SESSIONS", 64).max(1),
        commands: load_commands(),
    }
}

impl EnvConfig {
    /// Address the runner proxy listens on for this host.
    ///
    /// Guests reach the runner over vsock when the host has it; otherwise
    /// the proxy falls back to TCP loopback.
    pub fn proxy_listen_addr(&self, profile: &CapabilityProfile) -> ChannelAddr {
        if profile.vsock_loopback_available {
            ChannelAddr::Vsock {
                cid: CID_ANY,
                port: self.runner_port,
            }
        } else {
            // runner_port is bounded to u16 by `load`.
            let port = u16::try_from(self.runner_port).unwrap_or(DEFAULT_RUNNER_PORT as u16);
            ChannelAddr::Tcp(SocketAddr::from(([127, 0, 0, 1], port)))
        }
    }

    pub fn proxy_config(&self, profile: &CapabilityProfile) -> ProxyConfig {
        let mut proxy = ProxyConfig::new(self.proxy_listen_addr(profile));
        proxy.max_sessions = self.max_proxy_sessions;
        proxy.remote_connect_timeout = self.connect.deadline;
        proxy
    }

    pub fn orchestrator_config(&self, profile: &CapabilityProfile) -> OrchestratorConfig {
        OrchestratorConfig {
            connect: self.connect.clone(),
            proxy: self.proxy_config(profile),
            ..OrchestratorConfig::default()
        }
    }

    /// Misconfigurations worth reporting before any test runs.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.defaults.cpu_count > self.resources.cpu_capacity {
            warnings.push(format!(
                "VME_CPU_COUNT ({}) exceeds VME_CPU_CAPACITY ({}); every default test would be refused",
                self.defaults.cpu_count, self.resources.cpu_capacity
            ));
        }
        if self.defaults.memory_mb > self.resources.memory_capacity_mb {
            warnings.push(format!(
                "VME_MEMORY_MB ({}) exceeds VME_MEMORY_CAPACITY_MB ({})",
                self.defaults.memory_mb, self.resources.memory_capacity_mb
            ));
        }
        if let Err(e) = regex::Regex::new(&self.filter.benign_stderr) {
            warnings.push(format!("VME_BENIGN_STDERR is not a valid pattern: {}", e));
        }
        if let Err(e) = self.commands.parse() {
            warnings.push(e.to_string());
        }
        if self.connect.initial_backoff >= self.connect.deadline {
            warnings.push(format!(
                "VME_CONNECT_BACKOFF_MS ({}) leaves no room for a retry within VME_CONNECT_DEADLINE_MS ({})",
                self.connect.initial_backoff.as_millis(),
                self.connect.deadline.as_millis()
            ));
        }
        warnings
    }

    /// Return a serializable summary of all effective values.
    pub fn effective_config(&self) -> EffectiveConfig {
        EffectiveConfig {
            platform: self.platform.to_string(),
            target: self.target.clone(),
            release: self.release,
            cpu_count: self.defaults.cpu_count,
            memory_mb: self.defaults.memory_mb,
            cpu_capacity: self.resources.cpu_capacity,
            memory_capacity_mb: self.resources.memory_capacity_mb,
            test_timeout_secs: self.defaults.timeout.as_secs(),
            terminate_grace_ms: self.manager.terminate_grace.as_millis() as u64,
            connect_deadline_ms: self.connect.deadline.as_millis() as u64,
            connect_backoff_ms: self.connect.initial_backoff.as_millis() as u64,
            boot_banner_lines: self.filter.boot_banner_lines,
            benign_stderr: self.filter.benign_stderr.clone(),
            comment_marker: self.filter.comment_marker.clone(),
            runner_port: self.runner_port,
            max_proxy_sessions: self.max_proxy_sessions,
            build_cmd: self.commands.build.clone(),
            measure_cmd: self.commands.measure.clone(),
            run_cmd: self.commands.run.clone(),
            describe_cmd: self.commands.describe.clone(),
            terminate_all_cmd: self.commands.terminate_all.clone(),
        }
    }
}

impl EffectiveConfig {
    /// `(VARIABLE, value)` pairs in documentation order.
    pub fn entries(&self) -> Vec<(&'static str, String)> {
        vec![
            ("VME_PLATFORM", self.platform.clone()),
            ("VME_TARGET", self.target.clone()),
            ("VME_RELEASE", self.release.to_string()),
            ("VME_CPU_COUNT", self.cpu_count.to_string()),
            ("VME_MEMORY_MB", self.memory_mb.to_string()),
            ("VME_CPU_CAPACITY", self.cpu_capacity.to_string()),
            ("VME_MEMORY_CAPACITY_MB", self.memory_capacity_mb.to_string()),
            ("VME_TEST_TIMEOUT", self.test_timeout_secs.to_string()),
            ("VME_TERMINATE_GRACE_MS", self.terminate_grace_ms.to_string()),
            ("VME_CONNECT_DEADLINE_MS", self.connect_deadline_ms.to_string()),
            ("VME_CONNECT_BACKOFF_MS", self.connect_backoff_ms.to_string()),
            ("VME_BOOT_BANNER_LINES", self.boot_banner_lines.to_string()),
            ("VME_BENIGN_STDERR", self.benign_stderr.clone()),
            ("VME_COMMENT_MARKER", self.comment_marker.clone()),
            ("VME_RUNNER_PORT", self.runner_port.to_string()),
            ("VME_MAX_PROXY_SESSIONS", self.max_proxy_sessions.to_string()),
            ("VME_BUILD_CMD", self.build_cmd.clone()),
            ("VME_MEASURE_CMD", self.measure_cmd.clone()),
            ("VME_RUN_CMD", self.run_cmd.clone()),
            ("VME_DESCRIBE_CMD", self.describe_cmd.clone()),
            ("VME_TERMINATE_ALL_CMD", self.terminate_all_cmd.clone()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Serialize env-mutating tests to avoid cross-test pollution.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const ENV_KEYS: &[&str] = &[
        "VME_PLATFORM",
        "VME_TARGET",
        "VME_RELEASE",
        "VME_CPU_COUNT",
        "VME_MEMORY_MB",
        "VME_CPU_CAPACITY",
        "VME_MEMORY_CAPACITY_MB",
        "VME_TEST_TIMEOUT",
        "VME_TERMINATE_GRACE_MS",
        "VME_CONNECT_DEADLINE_MS",
        "VME_CONNECT_BACKOFF_MS",
        "VME_BOOT_BANNER_LINES",
        "VME_BENIGN_STDERR",
        "VME_COMMENT_MARKER",
        "VME_RUNNER_PORT",
        "VME_MAX_PROXY_SESSIONS",
        "VME_BUILD_CMD",
        "VME_MEASURE_CMD",
        "VME_RUN_CMD",
        "VME_DESCRIBE_CMD",
        "VME_TERMINATE_ALL_CMD",
    ];

    fn clear_env_vars() {
        for k in ENV_KEYS {
            std::env::remove_var(k);
        }
    }

    #[test]
    fn test_defaults_are_sensible() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        let cfg = load();
        assert_eq!(cfg.platform, Platform::Local);
        assert_eq!(cfg.target, DEFAULT_TARGET);
        assert!(!cfg.release);
        assert_eq!(cfg.defaults.cpu_count, 2);
        assert_eq!(cfg.defaults.memory_mb, 512);
        assert_eq!(cfg.defaults.timeout, Duration::from_secs(120));
        assert_eq!(cfg.resources.memory_capacity_mb, 8192);
        assert_eq!(cfg.manager.terminate_grace, Duration::from_secs(5));
        assert_eq!(cfg.connect.deadline, Duration::from_secs(10));
        assert_eq!(cfg.connect.initial_backoff, Duration::from_millis(50));
        assert_eq!(cfg.filter.boot_banner_lines, 11);
        assert_eq!(cfg.filter.benign_stderr, "Start.*");
        assert_eq!(cfg.filter.comment_marker, "#");
        assert_eq!(cfg.runner_port, 10000);
        assert_eq!(cfg.max_proxy_sessions, 64);
        assert_eq!(cfg.commands, CommandConfig::default());
    }

    #[test]
    fn test_env_vars_override_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("VME_PLATFORM", "nitro");
        std::env::set_var("VME_RELEASE", "true");
        std::env::set_var("VME_CPU_COUNT", "4");
        std::env::set_var("VME_TEST_TIMEOUT", "30");
        std::env::set_var("VME_BOOT_BANNER_LINES", "9");
        std::env::set_var("VME_RUNNER_PORT", "5006");
        std::env::set_var("VME_DESCRIBE_CMD", "fake-cli describe");
        let cfg = load();
        assert_eq!(cfg.platform, Platform::Enclave);
        assert!(cfg.release);
        assert_eq!(cfg.defaults.cpu_count, 4);
        assert_eq!(cfg.defaults.timeout, Duration::from_secs(30));
        assert_eq!(cfg.filter.boot_banner_lines, 9);
        assert_eq!(cfg.runner_port, 5006);
        let templates = cfg.commands.parse().unwrap();
        assert_eq!(templates.nitro.describe.program(), "fake-cli");
        clear_env_vars();
    }

    #[test]
    fn test_invalid_env_falls_back_to_default() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("VME_PLATFORM", "mainframe");
        std::env::set_var("VME_CPU_COUNT", "many");
        std::env::set_var("VME_RELEASE", "perhaps");
        std::env::set_var("VME_RUNNER_PORT", "70000");
        std::env::set_var("VME_BUILD_CMD", "   ");
        let cfg = load();
        assert_eq!(cfg.platform, Platform::Local);
        assert_eq!(cfg.defaults.cpu_count, 2);
        assert!(!cfg.release);
        assert_eq!(cfg.runner_port, 10000);
        assert_eq!(cfg.commands.build, DEFAULT_BUILD_CMD);
        clear_env_vars();
    }

    #[test]
    fn test_floors_applied() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("VME_CPU_COUNT", "0");
        std::env::set_var("VME_TEST_TIMEOUT", "0");
        std::env::set_var("VME_TERMINATE_GRACE_MS", "0");
        std::env::set_var("VME_MAX_PROXY_SESSIONS", "0");
        let cfg = load();
        assert_eq!(cfg.defaults.cpu_count, 1);
        assert!(cfg.defaults.timeout >= Duration::from_secs(1));
        assert!(cfg.manager.terminate_grace >= Duration::from_millis(100));
        assert_eq!(cfg.max_proxy_sessions, 1);
        clear_env_vars();
    }

    #[test]
    fn test_warnings_for_oversized_default_reservation() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("VME_CPU_CAPACITY", "8");
        assert!(load().warnings().is_empty());

        std::env::set_var("VME_CPU_COUNT", "16");
        std::env::set_var("VME_CPU_CAPACITY", "4");
        std::env::set_var("VME_BENIGN_STDERR", "Start(");
        let warnings = load().warnings();
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].contains("VME_CPU_CAPACITY"));
        assert!(warnings[1].contains("VME_BENIGN_STDERR"));
        clear_env_vars();
    }

    #[test]
    fn test_proxy_address_follows_vsock_availability() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        let cfg = load();
        let with_vsock = CapabilityProfile::assumed(Platform::Enclave, true);
        let without = CapabilityProfile::assumed(Platform::Local, false);
        assert_eq!(
            cfg.proxy_listen_addr(&with_vsock),
            ChannelAddr::Vsock {
                cid: CID_ANY,
                port: 10000
            }
        );
        assert_eq!(
            cfg.proxy_listen_addr(&without).to_string(),
            "tcp:127.0.0.1:10000"
        );
    }

    #[test]
    fn test_effective_config_contains_all_fields() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        let eff = load().effective_config();
        let entries = eff.entries();
        assert_eq!(entries.len(), ENV_KEYS.len());
        for key in ENV_KEYS {
            assert!(entries.iter().any(|(k, _)| k == key), "{} missing", key);
        }
        let json = serde_json::to_value(&eff).unwrap();
        assert_eq!(json["runner_port"], 10000);
    }
}
