//! Interaction peer process.
//!
//! A peer is a helper process started before the guest is built that talks
//! to the guest over the channel. It leads its own process group, so
//! whatever it forks is stopped with it. The orchestrator owns the handle and
//! must call [`PeerHandle::shutdown`]; a dropped handle still kills the group.
//! Peers are best-effort: a peer that fails or exits early produces a
//! warning, never a test failure.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::command::{spawn_grouped, ProcessGroup};
use crate::error::RunnerError;

const STDERR_TAIL: usize = 4096;

/// Peer program and arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerCommand {
    pub argv: Vec<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

impl PeerCommand {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv, cwd: None }
    }

    pub fn program(&self) -> Option<&str> {
        self.argv.first().map(String::as_str)
    }
}

/// What happened to a peer by the time it was shut down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerReport {
    pub program: String,
    /// The peer had already exited before teardown asked it to stop.
    pub exited_early: bool,
    pub exit_code: Option<i32>,
    pub stderr_tail: String,
}

impl PeerReport {
    /// Warning text for an early or failed exit.
    pub fn warning(&self) -> Option<String> {
        if !self.exited_early || self.exit_code == Some(0) {
            return None;
        }
        let code = self
            .exit_code
            .map_or_else(|| "a signal".to_string(), |c| format!("code {}", c));
        let mut msg = format!("peer `{}` exited early with {}", self.program, code);
        if !self.stderr_tail.trim().is_empty() {
            msg.push_str(": ");
            msg.push_str(self.stderr_tail.trim());
        }
        Some(msg)
    }
}

/// Owned running peer process.
pub struct PeerHandle {
    program: String,
    child: Child,
    group: ProcessGroup,
    stderr: Option<JoinHandle<Vec<u8>>>,
}

impl PeerHandle {
    pub fn start(command: &PeerCommand) -> Result<Self, RunnerError> {
        let program = command
            .program()
            .ok_or_else(|| RunnerError::Config("peer command is empty".into()))?
            .to_string();

        let mut cmd = Command::new(&program);
        cmd.args(&command.argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &command.cwd {
            cmd.current_dir(cwd);
        }
        let (mut child, group) = spawn_grouped(&mut cmd)
            .map_err(|e| RunnerError::LaunchFailed(format!("peer `{}`: {}", program, e)))?;

        let stderr = child.stderr.take().map(|mut pipe| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = pipe.read_to_end(&mut buf).await;
                if buf.len() > STDERR_TAIL {
                    buf.drain(..buf.len() - STDERR_TAIL);
                }
                buf
            })
        });

        tracing::info!(peer = %program, pid = ?child.id(), "interaction peer started");
        Ok(Self {
            program,
            child,
            group,
            stderr,
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Whether the peer is still running.
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Stop the peer and everything it forked, then reap it.
    pub async fn shutdown(mut self, grace: Duration) -> PeerReport {
        let early = self.child.try_wait();
        // Stragglers of an early exit still hold the stderr pipe.
        self.group.kill();
        let (exited_early, status) = match early {
            Ok(Some(status)) => (true, Some(status)),
            _ => {
                if let Err(e) = self.child.start_kill() {
                    tracing::debug!(peer = %self.program, error = %e, "peer kill failed");
                }
                let status = tokio::time::timeout(grace, self.child.wait())
                    .await
                    .ok()
                    .and_then(Result::ok);
                (false, status)
            }
        };

        let stderr_tail = match self.stderr.take() {
            Some(task) => match tokio::time::timeout(grace, task).await {
                Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
                _ => String::new(),
            },
            None => String::new(),
        };

        let report = PeerReport {
            program: self.program.clone(),
            exited_early,
            exit_code: status.and_then(|s| s.code()),
            stderr_tail,
        };
        match report.warning() {
            Some(warning) => tracing::warn!(peer = %self.program, "{}", warning),
            None => tracing::debug!(peer = %self.program, exited_early, "interaction peer stopped"),
        }
        report
    }
}
