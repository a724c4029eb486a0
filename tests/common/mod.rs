//! Scripted collaborators shared by the integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use vme_runner::enclave::{EnclaveHost, HostedEnclave, HostedSummary};
use vme_runner::error::RunnerError;
use vme_runner::image::{BuildArtifact, EnclaveImage, Measurer, StagedRootfs};
use vme_runner::toolchain::Builder;

pub const LOCAL_TARGET: &str = "x86_64-unknown-linux-gnu";

/// How a scripted enclave stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitMode {
    /// Exits on its own with this code as soon as it starts.
    Exit(i32),
    /// Runs until the host terminates it.
    UntilTerminated,
    /// Never exits; termination requests are ignored.
    Hang,
}

/// Enclave host that replays canned output.
pub struct ScriptedHost {
    pub mode: ExitMode,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub fail_run: bool,
    tokens: Mutex<HashMap<String, CancellationToken>>,
    pub runs: AtomicUsize,
    pub terminate_calls: AtomicUsize,
    pub terminate_all_calls: AtomicUsize,
}

impl ScriptedHost {
    pub fn new(mode: ExitMode) -> Self {
        Self {
            mode,
            stdout: Vec::new(),
            stderr: Vec::new(),
            fail_run: false,
            tokens: Mutex::new(HashMap::new()),
            runs: AtomicUsize::new(0),
            terminate_calls: AtomicUsize::new(0),
            terminate_all_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_output(mut self, stdout: &str, stderr: &str) -> Self {
        self.stdout = stdout.as_bytes().to_vec();
        self.stderr = stderr.as_bytes().to_vec();
        self
    }

    pub fn failing() -> Self {
        let mut host = Self::new(ExitMode::Exit(0));
        host.fail_run = true;
        host
    }

    pub fn terminates(&self) -> usize {
        self.terminate_calls.load(Ordering::SeqCst)
    }

    pub fn terminate_alls(&self) -> usize {
        self.terminate_all_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EnclaveHost for ScriptedHost {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn run(
        &self,
        _image: &EnclaveImage,
        _cpu_count: u32,
        _memory_mb: u64,
    ) -> Result<HostedEnclave, RunnerError> {
        if self.fail_run {
            return Err(RunnerError::LaunchFailed("scripted launch failure".into()));
        }
        let n = self.runs.fetch_add(1, Ordering::SeqCst);
        let id = format!("scripted-{}", n);
        let token = CancellationToken::new();
        self.tokens.lock().insert(id.clone(), token.clone());

        let exit = match self.mode {
            ExitMode::Exit(code) => async move { Ok(Some(code)) }.boxed(),
            ExitMode::UntilTerminated => async move {
                token.cancelled().await;
                Ok(None)
            }
            .boxed(),
            ExitMode::Hang => futures::future::pending().boxed(),
        };

        Ok(HostedEnclave {
            id,
            stdout: Box::new(std::io::Cursor::new(self.stdout.clone())),
            stderr: Box::new(std::io::Cursor::new(self.stderr.clone())),
            exit,
        })
    }

    async fn describe(&self) -> Result<Vec<HostedSummary>, RunnerError> {
        Ok(self
            .tokens
            .lock()
            .iter()
            .filter(|(_, token)| !token.is_cancelled())
            .map(|(id, _)| HostedSummary {
                id: id.clone(),
                state: "RUNNING".into(),
                cpu_count: None,
                memory_mb: None,
            })
            .collect())
    }

    async fn terminate(&self, id: &str) -> Result<(), RunnerError> {
        self.terminate_calls.fetch_add(1, Ordering::SeqCst);
        if self.mode != ExitMode::Hang {
            if let Some(token) = self.tokens.lock().get(id) {
                token.cancel();
            }
        }
        Ok(())
    }

    async fn terminate_all(&self) -> Result<(), RunnerError> {
        self.terminate_all_calls.fetch_add(1, Ordering::SeqCst);
        if self.mode != ExitMode::Hang {
            for token in self.tokens.lock().values() {
                token.cancel();
            }
        }
        Ok(())
    }
}

pub fn artifact(path: impl Into<PathBuf>, target: &str) -> BuildArtifact {
    BuildArtifact {
        binary_path: path.into(),
        target_triple: target.to_string(),
    }
}

pub fn local_image() -> EnclaveImage {
    EnclaveImage::executable(artifact("/opt/guest/hello", LOCAL_TARGET), "00".repeat(32))
}

/// Builder that writes a fixed binary instead of compiling.
pub struct StaticBuilder {
    pub binary: PathBuf,
    pub target: String,
    pub fail: bool,
    pub builds: AtomicUsize,
}

impl StaticBuilder {
    pub fn new(binary: impl Into<PathBuf>, target: &str) -> Self {
        Self {
            binary: binary.into(),
            target: target.to_string(),
            fail: false,
            builds: AtomicUsize::new(0),
        }
    }

    pub fn failing(target: &str) -> Self {
        let mut builder = Self::new("/nonexistent", target);
        builder.fail = true;
        builder
    }
}

#[async_trait]
impl Builder for StaticBuilder {
    async fn build(&self, manifest: &Path) -> Result<BuildArtifact, RunnerError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(RunnerError::Build(format!(
                "{}: error[E0425]: cannot find value",
                manifest.display()
            )));
        }
        Ok(artifact(self.binary.clone(), &self.target))
    }
}

/// Write a fake ELF executable into `dir`.
pub fn write_elf(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    let mut bytes = b"\x7fELF".to_vec();
    bytes.extend_from_slice(&[2, 1, 1, 0]);
    bytes.extend_from_slice(&[0u8; 56]);
    std::fs::write(&path, bytes).unwrap();
    path
}

pub fn hosted_ids(host: &Arc<ScriptedHost>) -> usize {
    host.runs.load(Ordering::SeqCst)
}

/// Measurer that writes a fixed image instead of calling the enclave CLI.
#[derive(Default)]
pub struct FakeMeasurer {
    pub measured: AtomicUsize,
}

#[async_trait]
impl Measurer for FakeMeasurer {
    async fn measure(
        &self,
        staged: &StagedRootfs,
        output: &Path,
    ) -> Result<BTreeMap<String, String>, RunnerError> {
        self.measured.fetch_add(1, Ordering::SeqCst);
        let image = format!("EIF:{}", staged.entrypoint);
        tokio::fs::write(output, image).await?;
        let mut pcrs = BTreeMap::new();
        pcrs.insert("PCR0".to_string(), "ab".repeat(48));
        Ok(pcrs)
    }
}
