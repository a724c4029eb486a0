//! Host capability probing.
//!
//! Runs once before any enclave is attempted and produces an immutable
//! [`CapabilityProfile`] that is passed to every component that needs it.
//!
//! vsock loopback is reported available only when the kernel is at least 5.6
//! AND the loopback module is loaded. A kernel new enough to support loopback
//! without the module fails closed with `UnsupportedKernel`; older kernels
//! report the channel as unavailable without looking at modules.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RunnerError;

/// Kernel module providing vsock loopback.
pub const VSOCK_LOOPBACK_MODULE: &str = "vsock_loopback";

/// Execution platform for guest binaries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// Guest runs as a local process (the "linux" platform).
    #[default]
    Local,
    /// Guest runs inside a Nitro enclave.
    Enclave,
}

impl FromStr for Platform {
    type Err = RunnerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "linux" | "local" => Ok(Self::Local),
            "nitro" | "enclave" => Ok(Self::Enclave),
            other => Err(RunnerError::Config(format!("unknown platform `{}`", other))),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Local => write!(f, "linux"),
            Platform::Enclave => write!(f, "nitro"),
        }
    }
}

/// Parsed `major.minor` kernel version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct KernelVersion {
    pub major: u32,
    pub minor: u32,
}

impl KernelVersion {
    /// Parse a release string such as `6.18.44-fc-v130` or `5.4.0-150-generic`.
    pub fn parse(release: &str) -> Option<Self> {
        let mut parts = release.trim().split(|c: char| !c.is_ascii_digit());
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        Some(Self { major, minor })
    }

    /// Kernel version gate for vsock loopback (5.6 and newer).
    pub fn supports_vsock_loopback(&self) -> bool {
        self.major >= 5 && (self.major > 5 || self.minor >= 6)
    }
}

impl fmt::Display for KernelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Immutable description of what the host can do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapabilityProfile {
    pub kernel_major: u32,
    pub kernel_minor: u32,
    pub vsock_loopback_available: bool,
    pub toolchain_present: bool,
    pub platform: Platform,
}

impl CapabilityProfile {
    /// Profile for tests and hosts where probing is not wanted.
    pub fn assumed(platform: Platform, vsock_loopback_available: bool) -> Self {
        Self {
            kernel_major: 0,
            kernel_minor: 0,
            vsock_loopback_available,
            toolchain_present: true,
            platform,
        }
    }
}

/// Source of host facts consulted by the probe.
pub trait HostInspector {
    /// Kernel release string (`uname -r`).
    fn kernel_release(&self) -> std::io::Result<String>;

    /// Whether the named kernel module is loaded or built in.
    fn module_loaded(&self, name: &str) -> bool;

    /// Locate an executable on PATH.
    fn find_tool(&self, name: &str) -> Option<PathBuf>;
}

/// Inspects the running Linux host through procfs and sysfs.
#[derive(Debug, Clone, Default)]
pub struct SystemInspector;

impl HostInspector for SystemInspector {
    fn kernel_release(&self) -> std::io::Result<String> {
        std::fs::read_to_string("/proc/sys/kernel/osrelease")
    }

    fn module_loaded(&self, name: &str) -> bool {
        if Path::new("/sys/module").join(name).exists() {
            return true;
        }
        std::fs::read_to_string("/proc/modules")
            .map(|modules| modules_list_contains(&modules, name))
            .unwrap_or(false)
    }

    fn find_tool(&self, name: &str) -> Option<PathBuf> {
        if name.contains('/') {
            let path = PathBuf::from(name);
            return path.is_file().then_some(path);
        }
        let paths = std::env::var_os("PATH")?;
        std::env::split_paths(&paths)
            .map(|dir| dir.join(name))
            .find(|candidate| candidate.is_file())
    }
}

fn modules_list_contains(modules: &str, name: &str) -> bool {
    modules
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .any(|module| module == name)
}

/// Probe the real host for `platform`, requiring `tools` to be installed.
pub fn probe(platform: Platform, tools: &[&str]) -> Result<CapabilityProfile, RunnerError> {
    probe_with(&SystemInspector, platform, tools)
}

/// Probe using an explicit inspector. Idempotent; performs no mutation.
pub fn probe_with(
    inspector: &dyn HostInspector,
    platform: Platform,
    tools: &[&str],
) -> Result<CapabilityProfile, RunnerError> {
    let release = inspector.kernel_release()?;
    let version = KernelVersion::parse(&release).ok_or_else(|| {
        RunnerError::Config(format!("unparseable kernel release `{}`", release.trim()))
    })?;

    let vsock_loopback_available = if version.supports_vsock_loopback() {
        if !inspector.module_loaded(VSOCK_LOOPBACK_MODULE) {
            return Err(RunnerError::UnsupportedKernel {
                kernel: version.to_string(),
                module: VSOCK_LOOPBACK_MODULE.to_string(),
            });
        }
        true
    } else {
        false
    };

    for tool in tools {
        if inspector.find_tool(tool).is_none() {
            return Err(RunnerError::MissingToolchain {
                tool: (*tool).to_string(),
            });
        }
    }

    let profile = CapabilityProfile {
        kernel_major: version.major,
        kernel_minor: version.minor,
        vsock_loopback_available,
        toolchain_present: true,
        platform,
    };
    tracing::debug!(
        kernel = %version,
        vsock_loopback = vsock_loopback_available,
        platform = %platform,
        "host capability probe complete"
    );
    Ok(profile)
}
