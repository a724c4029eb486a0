//! Config CLI subcommands: show, defaults, validate.
//!
//! These commands read configuration directly from environment variables
//! and never touch the host.

use crate::config::{self, EffectiveConfig};

use super::{EXIT_FAILURE, EXIT_OK};

/// Print effective config as key-value pairs to stdout.
pub fn run_show(json: bool) -> i32 {
    let cfg = config::load().effective_config();
    if json {
        match serde_json::to_string_pretty(&cfg) {
            Ok(text) => println!("{}", text),
            Err(e) => {
                eprintln!("Error: {}", e);
                return EXIT_FAILURE;
            }
        }
    } else {
        print_config(&cfg);
    }
    EXIT_OK
}

/// Print documented default values (no env overrides) to stdout.
pub fn run_defaults() {
    println!("VME_PLATFORM=linux");
    println!("VME_TARGET={}", config::DEFAULT_TARGET);
    println!("VME_RELEASE=false");
    println!("VME_CPU_COUNT=2");
    println!("VME_MEMORY_MB=512");
    println!("VME_CPU_CAPACITY=<host cpus>");
    println!("VME_MEMORY_CAPACITY_MB=8192");
    println!("VME_TEST_TIMEOUT=120");
    println!("VME_TERMINATE_GRACE_MS=5000");
    println!("VME_CONNECT_DEADLINE_MS=10000");
    println!("VME_CONNECT_BACKOFF_MS=50");
    println!("VME_BOOT_BANNER_LINES=11");
    println!("VME_BENIGN_STDERR=Start.*");
    println!("VME_COMMENT_MARKER=#");
    println!("VME_RUNNER_PORT=10000");
    println!("VME_MAX_PROXY_SESSIONS=64");
    println!("VME_BUILD_CMD={}", crate::command::DEFAULT_BUILD_CMD);
    println!("VME_MEASURE_CMD={}", crate::command::DEFAULT_MEASURE_CMD);
    println!("VME_RUN_CMD={}", crate::command::DEFAULT_RUN_CMD);
    println!("VME_DESCRIBE_CMD={}", crate::command::DEFAULT_DESCRIBE_CMD);
    println!(
        "VME_TERMINATE_ALL_CMD={}",
        crate::command::DEFAULT_TERMINATE_ALL_CMD
    );
}

/// Validate configuration for obvious misconfigurations.
///
/// Returns 0 if valid, 1 if any warnings are found.
pub fn run_validate() -> i32 {
    let warnings = config::load().warnings();
    for warning in &warnings {
        eprintln!("WARNING: {}", warning);
    }
    if warnings.is_empty() {
        println!("Configuration is valid.");
        EXIT_OK
    } else {
        EXIT_FAILURE
    }
}

fn print_config(cfg: &EffectiveConfig) {
    for (key, value) in cfg.entries() {
        println!("{}={}", key, value);
    }
}
