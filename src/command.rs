//! Argv templates for external collaborators.
//!
//! Build, measurement and enclave-hosting tools are invoked through
//! templates such as `nitro-cli run-enclave --eif-path {eif}`. Placeholders
//! are substituted per argument, so values containing spaces stay a single
//! argument and are never re-split.

use std::fmt;
use std::io;
use std::process::Stdio;

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};

use crate::error::RunnerError;

/// Default build template. `{target}` and `{manifest}` are always supplied.
pub const DEFAULT_BUILD_CMD: &str =
    "cargo build --target {target} --manifest-path {manifest} --message-format=json";

/// Default measurement template (produces an enclave image from a staged rootfs).
pub const DEFAULT_MEASURE_CMD: &str =
    "nitro-cli build-enclave --docker-dir {rootfs} --docker-uri vme-{name} --output-file {output}";

/// Default enclave launch template. Console output is attached to stdout.
pub const DEFAULT_RUN_CMD: &str =
    "nitro-cli run-enclave --eif-path {eif} --cpu-count {cpu_count} --memory {memory_mb} --debug-mode --attach-console";

/// Default template listing running enclaves as JSON.
pub const DEFAULT_DESCRIBE_CMD: &str = "nitro-cli describe-enclaves";

/// Default template terminating every running enclave.
pub const DEFAULT_TERMINATE_ALL_CMD: &str = "nitro-cli terminate-enclave --all";

/// A program plus argument templates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    program: String,
    args: Vec<String>,
}

impl CommandTemplate {
    /// Parse a whitespace-separated template.
    pub fn parse(template: &str) -> Result<Self, RunnerError> {
        let mut parts = template.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| RunnerError::Config("empty command template".into()))?;
        let args: Vec<String> = parts.collect();
        if let Some(bad) = args.iter().find(|arg| !placeholders_balanced(arg)) {
            return Err(RunnerError::Config(format!(
                "unbalanced placeholder in `{}`",
                bad
            )));
        }
        Ok(Self { program, args })
    }

    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Name of the executable, used by the capability probe.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Substitute `{key}` placeholders and return the concrete argv.
    pub fn render(&self, vars: &[(&str, &str)]) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                vars.iter().fold(arg.clone(), |acc, (key, value)| {
                    acc.replace(&format!("{{{}}}", key), value)
                })
            })
            .collect()
    }

    /// Build a tokio command with piped stdout/stderr.
    pub fn command(&self, vars: &[(&str, &str)]) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.render(vars))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Run to completion, returning stdout on success.
    pub async fn output(&self, vars: &[(&str, &str)]) -> Result<CommandOutput, RunnerError> {
        let output = self.command(vars).output().await?;
        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

impl fmt::Display for CommandTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

fn placeholders_balanced(arg: &str) -> bool {
    let mut open = false;
    for c in arg.chars() {
        match c {
            '{' if open => return false,
            '{' => open = true,
            '}' if !open => return false,
            '}' => open = false,
            _ => {}
        }
    }
    !open
}

/// Captured result of a collaborator invocation.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Last non-empty stderr line, for compact error messages.
    pub fn stderr_tail(&self) -> &str {
        self.stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("")
    }
}

/// Spawn `cmd` as the leader of a new process group.
pub(crate) fn spawn_grouped(cmd: &mut Command) -> io::Result<(Child, ProcessGroup)> {
    cmd.process_group(0);
    let child = cmd.spawn()?;
    let group = ProcessGroup {
        pgid: child
            .id()
            .and_then(|id| i32::try_from(id).ok())
            .map(Pid::from_raw),
    };
    Ok((child, group))
}

/// Process group led by a spawned child. Everything the child forked stays
/// in the group, so killing it leaves no stragglers. Killed on drop.
#[derive(Debug)]
pub(crate) struct ProcessGroup {
    pgid: Option<Pid>,
}

impl ProcessGroup {
    /// SIGKILL every member. Idempotent; an already empty group is fine.
    pub(crate) fn kill(&mut self) {
        let Some(pgid) = self.pgid.take() else {
            return;
        };
        match killpg(pgid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => tracing::debug!(pgid = pgid.as_raw(), error = %e, "killpg failed"),
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}
