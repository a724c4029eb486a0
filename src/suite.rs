//! Test suite manifests.
//!
//! ```toml
//! [[test]]
//! name = "hello"
//! manifest = "hello/Cargo.toml"
//! expected = "hello/expected.out"
//! peer = ["python3", "peer.py"]
//! timeout_secs = 60
//! runner = true
//!
//! [test.exchange]
//! addr = "vsock:16:5000"
//! send = "ping"
//! expect = "pong"
//! ```
//!
//! Relative paths resolve against the directory holding the manifest.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::channel::ChannelAddr;
use crate::error::RunnerError;
use crate::orchestrator::{Exchange, TestCase};
use crate::peer::PeerCommand;

/// Values used when a test entry leaves them out.
#[derive(Debug, Clone)]
pub struct CaseDefaults {
    pub cpu_count: u32,
    pub memory_mb: u64,
    pub timeout: Duration,
}

impl Default for CaseDefaults {
    fn default() -> Self {
        Self {
            cpu_count: 2,
            memory_mb: 512,
            timeout: Duration::from_secs(120),
        }
    }
}

/// One `[[test]]` entry as written.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestSpec {
    pub name: String,
    pub manifest: PathBuf,
    #[serde(default)]
    pub expected: Option<PathBuf>,
    #[serde(default)]
    pub peer: Option<Vec<String>>,
    #[serde(default)]
    pub cpu_count: Option<u32>,
    #[serde(default)]
    pub memory_mb: Option<u64>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub runner: bool,
    #[serde(default)]
    pub exchange: Option<ExchangeSpec>,
}

/// Channel exchange performed while the guest runs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExchangeSpec {
    pub addr: String,
    pub send: String,
    pub expect: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SuiteFile {
    #[serde(rename = "test", default)]
    tests: Vec<TestSpec>,
}

/// A parsed suite with paths resolved.
#[derive(Debug, Clone)]
pub struct Suite {
    root: PathBuf,
    tests: Vec<TestSpec>,
}

impl Suite {
    pub fn load(path: &Path) -> Result<Self, RunnerError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| RunnerError::Config(format!("{}: {}", path.display(), e)))?;
        let root = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::parse(&text, root)
    }

    pub fn parse(text: &str, root: impl Into<PathBuf>) -> Result<Self, RunnerError> {
        let root = root.into();
        let file: SuiteFile = toml::from_str(text)
            .map_err(|e| RunnerError::Config(format!("suite manifest: {}", e)))?;

        let mut seen = HashSet::new();
        let mut tests = Vec::with_capacity(file.tests.len());
        for mut spec in file.tests {
            if spec.name.trim().is_empty() {
                return Err(RunnerError::Config("test with empty name".into()));
            }
            if !seen.insert(spec.name.clone()) {
                return Err(RunnerError::Config(format!("duplicate test `{}`", spec.name)));
            }
            if matches!(&spec.peer, Some(argv) if argv.is_empty()) {
                return Err(RunnerError::Config(format!("{}: empty peer command", spec.name)));
            }
            if let Some(exchange) = &spec.exchange {
                exchange.addr.parse::<ChannelAddr>()?;
            }
            spec.manifest = resolve(&root, &spec.manifest);
            spec.expected = spec.expected.as_deref().map(|p| resolve(&root, p));
            tests.push(spec);
        }
        Ok(Self { root, tests })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tests(&self) -> &[TestSpec] {
        &self.tests
    }

    /// Tests named in `names`, in suite order; all tests when `names` is empty.
    pub fn select(&self, names: &[String]) -> Result<Vec<&TestSpec>, RunnerError> {
        if let Some(unknown) = names.iter().find(|n| !self.tests.iter().any(|t| &t.name == *n)) {
            return Err(RunnerError::Config(format!("no test named `{}`", unknown)));
        }
        Ok(self
            .tests
            .iter()
            .filter(|t| names.is_empty() || names.contains(&t.name))
            .collect())
    }

    /// Turn a spec into a runnable case, reading its expected output.
    pub fn case(&self, spec: &TestSpec, defaults: &CaseDefaults) -> Result<TestCase, RunnerError> {
        let expected_stdout = match &spec.expected {
            Some(path) => Some(std::fs::read(path).map_err(|e| {
                RunnerError::Config(format!("{}: expected output {}: {}", spec.name, path.display(), e))
            })?),
            None => None,
        };
        let peer = spec.peer.clone().map(|argv| PeerCommand {
            argv,
            cwd: Some(self.root.clone()),
        });
        let exchange = match &spec.exchange {
            Some(x) => Some(Exchange {
                addr: x.addr.parse()?,
                send: x.send.clone().into_bytes(),
                expect: x.expect.clone().into_bytes(),
            }),
            None => None,
        };

        Ok(TestCase {
            name: spec.name.clone(),
            manifest: spec.manifest.clone(),
            expected_stdout,
            peer,
            cpu_count: spec.cpu_count.unwrap_or(defaults.cpu_count),
            memory_mb: spec.memory_mb.unwrap_or(defaults.memory_mb),
            timeout: spec
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            runner: spec.runner,
            exchange,
        })
    }
}

fn resolve(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}
