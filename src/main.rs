//! VME runner entry point.
//!
//! ## CLI Subcommands
//!
//! - `vme-runner probe` - Report host capabilities (exit 3 if unusable)
//! - `vme-runner run <suite.toml> [name...]` - Run tests (exit 0 only if all pass)
//! - `vme-runner proxy` - Serve the runner proxy until Ctrl+C
//! - `vme-runner config show|defaults|validate` - Inspect configuration

use std::process::ExitCode;

use vme_runner::cli;
use vme_runner::telemetry::{init_logging, LogConfig};

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("help");

    if !matches!(command, "help" | "--help" | "-h" | "version" | "--version" | "-V") {
        if let Err(e) = init_logging(&LogConfig::from_env()) {
            eprintln!("Logging disabled: {}", e);
        }
    }

    let rest = args.get(2..).unwrap_or(&[]);
    let code = match command {
        "probe" => cli::run_probe(has_flag(rest, "--json")),
        "run" => cli::run_suite(rest).await,
        "proxy" => cli::run_proxy(rest).await,
        "config" => {
            let subcommand = rest.first().map(|s| s.as_str()).unwrap_or("show");
            match subcommand {
                "show" => cli::run_show(has_flag(rest, "--json")),
                "defaults" => {
                    cli::run_defaults();
                    cli::EXIT_OK
                }
                "validate" => cli::run_validate(),
                _ => {
                    eprintln!("Unknown config subcommand: {}", subcommand);
                    print_command_help("config");
                    cli::EXIT_CONFIG
                }
            }
        }
        "help" | "--help" | "-h" => {
            match rest.first() {
                Some(subcommand) => print_command_help(subcommand),
                None => print_usage(),
            }
            cli::EXIT_OK
        }
        "version" | "--version" | "-V" => {
            println!("vme-runner {}", env!("CARGO_PKG_VERSION"));
            cli::EXIT_OK
        }
        _ => {
            eprintln!("Unknown command: {}", command);
            print_usage();
            cli::EXIT_CONFIG
        }
    };
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

fn print_usage() {
    let version = env!("CARGO_PKG_VERSION");
    eprintln!(
        "vme-runner - build, package, launch and verify guest binaries v{}

USAGE:
    vme-runner [COMMAND] [OPTIONS]

COMMANDS:
    probe        Report host capabilities for the configured platform
    run          Run a test suite
    proxy        Serve the runner proxy until Ctrl+C
    config       Inspect configuration (show, defaults, validate)
    version      Show version information
    help         Show this help message

EXAMPLES:
    vme-runner probe
    vme-runner run tests/suite.toml
    VME_PLATFORM=nitro vme-runner run tests/suite.toml hello --json
    vme-runner proxy --listen tcp:127.0.0.1:10000
    vme-runner config validate

ENVIRONMENT:
    VME_PLATFORM     linux (local process) or nitro (enclave)
    VME_TARGET       Guest target triple
    VME_LOG          Log filter (default: info)
    VME_LOG_FORMAT   json or pretty
    See `vme-runner config defaults` for the full list.

EXIT CODES:
    0    Success / every selected test passed
    1    A test failed
    2    Configuration or usage error
    3    Host cannot run guests (see hint)
    130  Interrupted
",
        version
    );
}

/// Print detailed help for a specific command.
fn print_command_help(command: &str) {
    match command {
        "probe" => eprintln!(
            "vme-runner probe - Report host capabilities

USAGE:
    vme-runner probe [--json]

DESCRIPTION:
    Checks the kernel version, the vsock loopback module and the tools the
    configured platform needs. Exits 3 with a hint when the host is unusable.
"
        ),
        "run" => eprintln!(
            "vme-runner run - Run a test suite

USAGE:
    vme-runner run <suite.toml> [name...] [--json]

DESCRIPTION:
    Runs the selected tests in suite order and stops at the first failure.
    Every test is torn down before its result is reported.
"
        ),
        "proxy" => eprintln!(
            "vme-runner proxy - Serve the runner proxy

USAGE:
    vme-runner proxy [--listen ADDR]

DESCRIPTION:
    Accepts guest connection requests on vsock (or TCP loopback) and
    proxies them to remote addresses. ADDR is vsock:CID:PORT or tcp:HOST:PORT.
"
        ),
        "config" => eprintln!(
            "vme-runner config - Inspect configuration

USAGE:
    vme-runner config show [--json]
    vme-runner config defaults
    vme-runner config validate
"
        ),
        _ => {
            eprintln!("No help for `{}`", command);
            print_usage();
        }
    }
}
