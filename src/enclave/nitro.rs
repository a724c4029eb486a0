//! Enclave host driven by an enclave CLI.
//!
//! `run` starts the launch command with the console attached, so the
//! command's stdout carries the boot banner followed by guest output.
//! Only one enclave runs at a time, so stopping one enclave is done with the
//! terminate-all command after the attached console has been cancelled.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use super::host::{EnclaveHost, HostedEnclave, HostedSummary};
use super::process::supervise;
use crate::command::{spawn_grouped, CommandTemplate};
use crate::error::RunnerError;
use crate::image::{EnclaveImage, ImageHandle};

/// Command templates for the enclave CLI.
#[derive(Debug, Clone)]
pub struct NitroCommands {
    pub run: CommandTemplate,
    pub describe: CommandTemplate,
    pub terminate_all: CommandTemplate,
}

/// Hosts guests in enclaves through CLI commands.
pub struct NitroHost {
    commands: NitroCommands,
    attached: Arc<DashMap<String, CancellationToken>>,
}

impl NitroHost {
    pub fn new(commands: NitroCommands) -> Self {
        Self {
            commands,
            attached: Arc::new(DashMap::new()),
        }
    }

    /// Parse the JSON listing printed by the describe command.
    pub fn parse_describe(output: &str) -> Result<Vec<HostedSummary>, RunnerError> {
        let trimmed = output.trim();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(trimmed)
            .map_err(|e| RunnerError::Protocol(format!("describe output: {}", e)))
    }
}

#[async_trait]
impl EnclaveHost for NitroHost {
    fn name(&self) -> &'static str {
        "nitro"
    }

    async fn run(
        &self,
        image: &EnclaveImage,
        cpu_count: u32,
        memory_mb: u64,
    ) -> Result<HostedEnclave, RunnerError> {
        let eif = match image.handle() {
            ImageHandle::Eif { path, .. } => path.to_string_lossy().into_owned(),
            ImageHandle::Executable { path, .. } => {
                return Err(RunnerError::LaunchFailed(format!(
                    "{} is not a measured enclave image",
                    path.display()
                )))
            }
        };
        let cpus = cpu_count.to_string();
        let memory = memory_mb.to_string();
        let vars = [
            ("eif", eif.as_str()),
            ("cpu_count", cpus.as_str()),
            ("memory_mb", memory.as_str()),
        ];

        let mut cmd = self.commands.run.command(&vars);
        let (child, group) = spawn_grouped(&mut cmd)
            .map_err(|e| RunnerError::LaunchFailed(format!("{}: {}", self.commands.run, e)))?;

        let id = uuid::Uuid::new_v4().to_string();
        let token = CancellationToken::new();
        let (stdout, stderr, exit) = supervise(child, group, token.clone())?;
        self.attached.insert(id.clone(), token);

        let attached = self.attached.clone();
        let exit_id = id.clone();
        let exit = async move {
            let code = exit.await;
            attached.remove(&exit_id);
            code
        }
        .boxed();

        tracing::info!(%id, %eif, cpu_count, memory_mb, "enclave launch requested");
        Ok(HostedEnclave {
            id,
            stdout,
            stderr,
            exit,
        })
    }

    async fn describe(&self) -> Result<Vec<HostedSummary>, RunnerError> {
        let output = self.commands.describe.output(&[]).await?;
        if !output.success {
            return Err(RunnerError::LaunchFailed(format!(
                "`{}` failed: {}",
                self.commands.describe,
                output.stderr_tail()
            )));
        }
        Self::parse_describe(&output.stdout)
    }

    async fn terminate(&self, id: &str) -> Result<(), RunnerError> {
        let token = self.attached.get(id).map(|t| t.value().clone());
        if let Some(token) = token {
            token.cancel();
        }
        self.terminate_all().await
    }

    async fn terminate_all(&self) -> Result<(), RunnerError> {
        let tokens: Vec<CancellationToken> =
            self.attached.iter().map(|t| t.value().clone()).collect();
        for token in tokens {
            token.cancel();
        }
        let output = self.commands.terminate_all.output(&[]).await?;
        if !output.success {
            tracing::warn!(
                command = %self.commands.terminate_all,
                stderr = output.stderr_tail(),
                "terminate-all reported failure"
            );
        }
        Ok(())
    }
}
