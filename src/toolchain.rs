//! Build collaborator.
//!
//! Guests are compiled with cargo's JSON message format; the executable is
//! taken from the last `compiler-artifact` message that names one.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;

use crate::command::CommandTemplate;
use crate::error::RunnerError;
use crate::image::BuildArtifact;

/// Produces a guest binary from a manifest.
#[async_trait]
pub trait Builder: Send + Sync {
    async fn build(&self, manifest: &Path) -> Result<BuildArtifact, RunnerError>;
}

/// Builds guests with cargo (or any tool speaking its JSON messages).
pub struct CargoBuilder {
    template: CommandTemplate,
    target: String,
    release: bool,
}

#[derive(Deserialize)]
struct CargoMessage {
    reason: String,
    #[serde(default)]
    executable: Option<PathBuf>,
    #[serde(default)]
    message: Option<Diagnostic>,
}

#[derive(Deserialize)]
struct Diagnostic {
    #[serde(default)]
    level: String,
    #[serde(default)]
    rendered: Option<String>,
}

/// Outcome of scanning cargo's JSON output.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct BuildMessages {
    pub executable: Option<PathBuf>,
    pub errors: Vec<String>,
}

/// Scan `--message-format=json` output. Non-JSON lines are ignored.
pub fn parse_build_messages(stdout: &str) -> BuildMessages {
    let mut out = BuildMessages::default();
    for line in stdout.lines().filter(|l| l.starts_with('{')) {
        let Ok(msg) = serde_json::from_str::<CargoMessage>(line) else {
            continue;
        };
        match msg.reason.as_str() {
            "compiler-artifact" => {
                if let Some(exe) = msg.executable {
                    out.executable = Some(exe);
                }
            }
            "compiler-message" => {
                if let Some(diag) = msg.message {
                    if diag.level == "error" {
                        if let Some(rendered) = diag.rendered {
                            out.errors.push(rendered.trim_end().to_string());
                        }
                    }
                }
            }
            _ => {}
        }
    }
    out
}

impl CargoBuilder {
    pub fn new(template: CommandTemplate, target: impl Into<String>, release: bool) -> Self {
        Self {
            template,
            target: target.into(),
            release,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }
}

#[async_trait]
impl Builder for CargoBuilder {
    async fn build(&self, manifest: &Path) -> Result<BuildArtifact, RunnerError> {
        let manifest_str = manifest.to_string_lossy();
        let vars = [
            ("target", self.target.as_str()),
            ("manifest", manifest_str.as_ref()),
        ];
        let mut cmd = self.template.command(&vars);
        if self.release {
            cmd.arg("--release");
        }

        tracing::info!(manifest = %manifest.display(), target = %self.target, release = self.release, "building guest");
        let output = cmd.output().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RunnerError::MissingToolchain {
                    tool: self.template.program().to_string(),
                }
            } else {
                RunnerError::Build(format!("{}: {}", self.template, e))
            }
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let messages = parse_build_messages(&stdout);
        if !output.status.success() {
            let detail = if messages.errors.is_empty() {
                String::from_utf8_lossy(&output.stderr).trim().to_string()
            } else {
                messages.errors.join("\n")
            };
            return Err(RunnerError::Build(format!(
                "{} ({}): {}",
                manifest.display(),
                output.status,
                detail
            )));
        }

        let binary_path = messages.executable.ok_or_else(|| {
            RunnerError::Build(format!(
                "{}: build produced no executable artifact",
                manifest.display()
            ))
        })?;
        tracing::debug!(binary = %binary_path.display(), "guest built");
        Ok(BuildArtifact {
            binary_path,
            target_triple: self.target.clone(),
        })
    }
}
