//! CLI subcommands for the VME runner.
//!
//! ## Usage
//!
//! ```bash
//! vme-runner probe                     # Report host capabilities
//! vme-runner run suite.toml [name...]  # Run tests, exit 0 only if all pass
//! vme-runner proxy                     # Serve the runner proxy until Ctrl+C
//! vme-runner config show               # Print effective configuration
//! ```

pub mod config_cmd;
pub mod probe_cmd;
pub mod proxy_cmd;
pub mod run_cmd;

pub use config_cmd::{run_defaults, run_show, run_validate};
pub use probe_cmd::run_probe;
pub use proxy_cmd::run_proxy;
pub use run_cmd::run_suite;

use crate::capability::Platform;
use crate::config::Templates;
use crate::error::RunnerError;

/// Every selected test passed / command succeeded.
pub const EXIT_OK: i32 = 0;
/// A test failed or the command did not complete.
pub const EXIT_FAILURE: i32 = 1;
/// Invalid arguments, configuration or suite manifest.
pub const EXIT_CONFIG: i32 = 2;
/// The host cannot run guests (kernel module or tool missing).
pub const EXIT_ENVIRONMENT: i32 = 3;

/// Tools that must be on PATH before anything runs on `platform`.
pub fn required_tools(platform: Platform, templates: &Templates) -> Vec<String> {
    let mut tools = vec![templates.build.program().to_string()];
    if platform == Platform::Enclave {
        for program in [
            templates.measure.program(),
            templates.nitro.run.program(),
            templates.nitro.describe.program(),
            templates.nitro.terminate_all.program(),
        ] {
            if !tools.iter().any(|t| t == program) {
                tools.push(program.to_string());
            }
        }
    }
    tools
}

/// Print `error` (with remediation for environment errors) and map it to an exit code.
pub fn report_error(error: &RunnerError) -> i32 {
    eprintln!("Error: {}", error);
    if let Some(remediation) = error.remediation() {
        eprintln!("  hint: {}", remediation);
    }
    match error {
        e if e.is_environment() => EXIT_ENVIRONMENT,
        RunnerError::Config(_) => EXIT_CONFIG,
        _ => EXIT_FAILURE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CommandConfig;

    #[test]
    fn test_required_tools_local_only_needs_builder() {
        let templates = CommandConfig::default().parse().unwrap();
        assert_eq!(required_tools(Platform::Local, &templates), vec!["cargo"]);
    }

    #[test]
    fn test_required_tools_enclave_deduplicates() {
        let templates = CommandConfig::default().parse().unwrap();
        let tools = required_tools(Platform::Enclave, &templates);
        assert_eq!(tools, vec!["cargo", "nitro-cli"]);
    }

    #[test]
    fn test_error_exit_codes() {
        let env = RunnerError::MissingToolchain {
            tool: "nitro-cli".into(),
        };
        assert_eq!(report_error(&env), EXIT_ENVIRONMENT);
        assert_eq!(report_error(&RunnerError::Config("x".into())), EXIT_CONFIG);
        assert_eq!(report_error(&RunnerError::Build("x".into())), EXIT_FAILURE);
    }
}
