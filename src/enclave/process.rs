//! Local-process enclave host.
//!
//! The "enclave" is the guest executable run as a child process with piped
//! output, leading its own process group. Each child is owned by a
//! supervision future; termination cancels its token, which kills the whole
//! group and reaps the child. Anything the guest forked dies with it.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use super::host::{BoxedReader, EnclaveHost, ExitFuture, HostedEnclave, HostedSummary};
use crate::command::{spawn_grouped, ProcessGroup};
use crate::error::RunnerError;
use crate::image::{EnclaveImage, ImageHandle};

/// Split a spawned child into output streams and an exit future that
/// resolves when the child exits or `token` is cancelled. The child's group
/// is killed on either path so no forked process keeps the pipes open.
pub(crate) fn supervise(
    mut child: Child,
    mut group: ProcessGroup,
    token: CancellationToken,
) -> Result<(BoxedReader, BoxedReader, ExitFuture), RunnerError> {
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| RunnerError::LaunchFailed("child stdout not piped".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| RunnerError::LaunchFailed("child stderr not piped".into()))?;

    let exit = async move {
        tokio::select! {
            status = child.wait() => {
                group.kill();
                status.map(|s| s.code())
            }
            _ = token.cancelled() => {
                group.kill();
                if let Err(e) = child.start_kill() {
                    tracing::debug!(error = %e, "kill after cancellation failed");
                }
                child.wait().await.map(|s| s.code())
            }
        }
    }
    .boxed();

    Ok((Box::new(stdout), Box::new(stderr), exit))
}

struct LocalEntry {
    token: CancellationToken,
    cpu_count: u32,
    memory_mb: u64,
}

/// Hosts guests as local child processes.
#[derive(Default)]
pub struct ProcessHost {
    running: Arc<DashMap<String, LocalEntry>>,
}

impl ProcessHost {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EnclaveHost for ProcessHost {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn run(
        &self,
        image: &EnclaveImage,
        cpu_count: u32,
        memory_mb: u64,
    ) -> Result<HostedEnclave, RunnerError> {
        let path = match image.handle() {
            ImageHandle::Executable { path, .. } => path.clone(),
            ImageHandle::Eif { path, .. } => {
                return Err(RunnerError::LaunchFailed(format!(
                    "process host cannot run enclave image {}",
                    path.display()
                )))
            }
        };

        let mut cmd = Command::new(&path);
        cmd.stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        let (child, group) = spawn_grouped(&mut cmd)
            .map_err(|e| RunnerError::LaunchFailed(format!("{}: {}", path.display(), e)))?;

        let id = uuid::Uuid::new_v4().to_string();
        let token = CancellationToken::new();
        let (stdout, stderr, exit) = supervise(child, group, token.clone())?;

        self.running.insert(
            id.clone(),
            LocalEntry {
                token,
                cpu_count,
                memory_mb,
            },
        );
        let running = self.running.clone();
        let exit_id = id.clone();
        let exit = async move {
            let code = exit.await;
            running.remove(&exit_id);
            code
        }
        .boxed();

        tracing::debug!(%id, path = %path.display(), "local guest started");
        Ok(HostedEnclave {
            id,
            stdout,
            stderr,
            exit,
        })
    }

    async fn describe(&self) -> Result<Vec<HostedSummary>, RunnerError> {
        Ok(self
            .running
            .iter()
            .map(|entry| HostedSummary {
                id: entry.key().clone(),
                state: "RUNNING".to_string(),
                cpu_count: Some(entry.cpu_count),
                memory_mb: Some(entry.memory_mb),
            })
            .collect())
    }

    async fn terminate(&self, id: &str) -> Result<(), RunnerError> {
        if let Some(entry) = self.running.get(id) {
            entry.token.cancel();
        }
        Ok(())
    }

    async fn terminate_all(&self) -> Result<(), RunnerError> {
        for entry in self.running.iter() {
            entry.token.cancel();
        }
        Ok(())
    }
}
