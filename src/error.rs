//! Error taxonomy for the VME runner.
//!
//! Environment errors are detected once at startup and never retried.
//! Every per-test error aborts the batch once teardown has run.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the runner.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Kernel {kernel} supports vsock loopback but module `{module}` is not loaded")]
    UnsupportedKernel { kernel: String, module: String },

    #[error("Required tool `{tool}` not found in PATH")]
    MissingToolchain { tool: String },

    #[error("Build failed: {0}")]
    Build(String),

    #[error("Packaging failed: {0}")]
    PackagingError(String),

    #[error("Launch failed: {0}")]
    LaunchFailed(String),

    #[error("Resources exhausted: requested {requested}, available {available}")]
    ResourceExhausted { requested: String, available: String },

    #[error("Channel {addr} unavailable after {waited:?}: {reason}")]
    ChannelUnavailable {
        addr: String,
        waited: Duration,
        reason: String,
    },

    #[error("Output mismatch in {test}: expected {expected:?}, got {actual:?}")]
    OutputMismatch {
        test: String,
        expected: String,
        actual: String,
    },

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RunnerError {
    /// Returns true for host capability errors detected by the probe.
    pub fn is_environment(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedKernel { .. } | Self::MissingToolchain { .. }
        )
    }

    /// Actionable remediation text for environment errors.
    pub fn remediation(&self) -> Option<String> {
        match self {
            Self::UnsupportedKernel { module, .. } => Some(format!(
                "load the module with `sudo modprobe {}` and retry",
                module
            )),
            Self::MissingToolchain { tool } => Some(format!(
                "install `{}` and make sure it is on PATH",
                tool
            )),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_errors_classified() {
        let kernel = RunnerError::UnsupportedKernel {
            kernel: "5.10".into(),
            module: "vsock_loopback".into(),
        };
        let tool = RunnerError::MissingToolchain { tool: "cargo".into() };
        assert!(kernel.is_environment());
        assert!(tool.is_environment());
        assert!(!RunnerError::LaunchFailed("boom".into()).is_environment());
    }

    #[test]
    fn test_remediation_only_for_environment() {
        let kernel = RunnerError::UnsupportedKernel {
            kernel: "6.1".into(),
            module: "vsock_loopback".into(),
        };
        assert!(kernel.remediation().unwrap().contains("modprobe vsock_loopback"));
        assert!(RunnerError::Build("x".into()).remediation().is_none());
    }

    #[test]
    fn test_mismatch_message_contains_both_values() {
        let err = RunnerError::OutputMismatch {
            test: "answer".into(),
            expected: "result: 42\n".into(),
            actual: "result: 43\n".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("result: 42"));
        assert!(msg.contains("result: 43"));
    }
}
