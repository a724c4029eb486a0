//! Enclave lifecycle management.
//!
//! State machine: `Allocating -> Running -> Terminating -> Terminated`.
//!
//! Every successful `launch` spawns one supervisor task that owns the
//! reservation, the image and the host's exit future. The supervisor is the
//! only writer of `Terminated`, which it publishes exactly once after
//! releasing resources. `terminate` is idempotent and safe to race with a
//! natural exit and with an in-flight `wait_for_completion`.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::host::{BoxedReader, EnclaveHost, HostedSummary};
use super::resources::{Reservation, ResourceLedger};
use crate::error::RunnerError;
use crate::image::EnclaveImage;

const READ_CHUNK: usize = 8 * 1024;

/// Lifecycle state of one enclave instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum EnclaveState {
    Allocating,
    Running,
    Terminating,
    Terminated,
}

impl fmt::Display for EnclaveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnclaveState::Allocating => write!(f, "allocating"),
            EnclaveState::Running => write!(f, "running"),
            EnclaveState::Terminating => write!(f, "terminating"),
            EnclaveState::Terminated => write!(f, "terminated"),
        }
    }
}

/// Result of a completed enclave run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitOutcome {
    /// `None` when the enclave was killed rather than exiting on its own.
    pub exit_code: Option<i32>,
    pub stdout_bytes: Vec<u8>,
    pub stderr_bytes: Vec<u8>,
}

impl ExitOutcome {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout_bytes).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr_bytes).into_owned()
    }
}

/// Lifecycle manager configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// How long `terminate` waits for the host before abandoning the enclave.
    pub terminate_grace: Duration,
    /// How long output streams may keep draining after exit.
    pub drain_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            terminate_grace: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(2),
        }
    }
}

/// Launch/termination counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ManagerStats {
    pub launched: u64,
    pub terminated: u64,
    pub active: Option<String>,
}

#[derive(Default)]
struct Counters {
    launched: AtomicU64,
    terminated: AtomicU64,
}

/// Owns every enclave instance for the process.
pub struct EnclaveManager {
    host: Arc<dyn EnclaveHost>,
    ledger: ResourceLedger,
    config: ManagerConfig,
    active: Arc<Mutex<Option<String>>>,
    counters: Arc<Counters>,
}

impl EnclaveManager {
    pub fn new(host: Arc<dyn EnclaveHost>, ledger: ResourceLedger, config: ManagerConfig) -> Self {
        Self {
            host,
            ledger,
            config,
            active: Arc::new(Mutex::new(None)),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            launched: self.counters.launched.load(Ordering::SeqCst),
            terminated: self.counters.terminated.load(Ordering::SeqCst),
            active: self.active.lock().clone(),
        }
    }

    pub fn ledger(&self) -> &ResourceLedger {
        &self.ledger
    }

    /// List instances known to the host.
    pub async fn describe(&self) -> Result<Vec<HostedSummary>, RunnerError> {
        self.host.describe().await
    }

    /// Ask the host to stop everything it runs.
    pub async fn terminate_all(&self) -> Result<(), RunnerError> {
        self.host.terminate_all().await
    }

    /// Launch `image` with a fresh reservation. The image is consumed.
    pub async fn launch(
        &self,
        image: EnclaveImage,
        cpu_count: u32,
        memory_mb: u64,
    ) -> Result<EnclaveInstance, RunnerError> {
        let slot = ActiveSlot::claim(&self.active)?;
        let reservation = self.ledger.try_reserve(cpu_count, memory_mb)?;

        let (state_tx, _) = watch::channel(EnclaveState::Allocating);
        let hosted = self
            .host
            .run(&image, cpu_count, memory_mb)
            .await
            .map_err(|e| match e {
                RunnerError::LaunchFailed(_) | RunnerError::ResourceExhausted { .. } => e,
                other => RunnerError::LaunchFailed(other.to_string()),
            })?;

        let id = hosted.id.clone();
        slot.set(&id);
        self.counters.launched.fetch_add(1, Ordering::SeqCst);

        let stdout = Arc::new(Mutex::new(Vec::new()));
        let stderr = Arc::new(Mutex::new(Vec::new()));
        let stdout_task = tokio::spawn(collect_stream(hosted.stdout, stdout.clone()));
        let stderr_task = tokio::spawn(collect_stream(hosted.stderr, stderr.clone()));

        let shared = Arc::new(Shared {
            id: id.clone(),
            state: state_tx,
            outcome: Mutex::new(None),
            stdout,
            stderr,
        });
        shared.state.send_replace(EnclaveState::Running);

        let abandon = CancellationToken::new();
        let supervisor = Supervisor {
            shared: shared.clone(),
            host: self.host.clone(),
            counters: self.counters.clone(),
            drain_timeout: self.config.drain_timeout,
            abandon: abandon.clone(),
            streams: [stdout_task, stderr_task],
            reservation,
            image,
            slot,
        };
        tokio::spawn(supervisor.run(hosted.exit));

        tracing::info!(%id, host = self.host.name(), cpu_count, memory_mb, "enclave running");
        Ok(EnclaveInstance {
            shared,
            host: self.host.clone(),
            abandon,
            terminate_grace: self.config.terminate_grace,
            cpu_count,
            memory_mb,
        })
    }
}

/// Marks the manager's single running slot; cleared on drop.
struct ActiveSlot {
    active: Arc<Mutex<Option<String>>>,
}

impl ActiveSlot {
    fn claim(active: &Arc<Mutex<Option<String>>>) -> Result<Self, RunnerError> {
        let mut guard = active.lock();
        if let Some(current) = guard.as_ref() {
            return Err(RunnerError::LaunchFailed(format!(
                "enclave {} is still active",
                current
            )));
        }
        *guard = Some("allocating".to_string());
        Ok(Self {
            active: active.clone(),
        })
    }

    fn set(&self, id: &str) {
        *self.active.lock() = Some(id.to_string());
    }
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        *self.active.lock() = None;
    }
}

struct Shared {
    id: String,
    state: watch::Sender<EnclaveState>,
    outcome: Mutex<Option<ExitOutcome>>,
    stdout: Arc<Mutex<Vec<u8>>>,
    stderr: Arc<Mutex<Vec<u8>>>,
}

impl Shared {
    /// Move `Running` to `Terminating`. Returns false if already past it.
    fn begin_terminating(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state < EnclaveState::Terminating {
                *state = EnclaveState::Terminating;
                true
            } else {
                false
            }
        })
    }
}

struct Supervisor {
    shared: Arc<Shared>,
    host: Arc<dyn EnclaveHost>,
    counters: Arc<Counters>,
    drain_timeout: Duration,
    abandon: CancellationToken,
    streams: [JoinHandle<()>; 2],
    reservation: Reservation,
    image: EnclaveImage,
    slot: ActiveSlot,
}

impl Supervisor {
    async fn run(self, exit: super::host::ExitFuture) {
        let id = self.shared.id.clone();
        let exit_code = tokio::select! {
            code = exit => match code {
                Ok(code) => code,
                Err(e) => {
                    tracing::warn!(%id, error = %e, "waiting for enclave exit failed");
                    None
                }
            },
            _ = self.abandon.cancelled() => {
                tracing::warn!(%id, "enclave abandoned, forcing host termination");
                if let Err(e) = self.host.terminate(&id).await {
                    tracing::warn!(%id, error = %e, "host termination failed");
                }
                None
            }
        };
        self.shared.begin_terminating();

        let [stdout_task, stderr_task] = self.streams;
        for task in [stdout_task, stderr_task] {
            let abort = task.abort_handle();
            if tokio::time::timeout(self.drain_timeout, task).await.is_err() {
                abort.abort();
                tracing::debug!(%id, "output stream still open after exit, truncated");
            }
        }

        let outcome = ExitOutcome {
            exit_code,
            stdout_bytes: self.shared.stdout.lock().clone(),
            stderr_bytes: self.shared.stderr.lock().clone(),
        };
        *self.shared.outcome.lock() = Some(outcome);

        // Release the reservation, image and slot before announcing Terminated.
        drop(self.reservation);
        drop(self.image);
        drop(self.slot);

        self.counters.terminated.fetch_add(1, Ordering::SeqCst);
        self.shared.state.send_replace(EnclaveState::Terminated);
        tracing::info!(%id, ?exit_code, "enclave terminated");
    }
}

async fn collect_stream(mut reader: BoxedReader, sink: Arc<Mutex<Vec<u8>>>) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => sink.lock().extend_from_slice(&buf[..n]),
            Err(e) => {
                tracing::debug!(error = %e, "output stream read failed");
                break;
            }
        }
    }
}

/// Handle to one launched enclave.
///
/// Dropping a handle whose enclave has not terminated abandons it: the
/// supervisor forces host termination and still releases every resource.
pub struct EnclaveInstance {
    shared: Arc<Shared>,
    host: Arc<dyn EnclaveHost>,
    abandon: CancellationToken,
    terminate_grace: Duration,
    cpu_count: u32,
    memory_mb: u64,
}

impl EnclaveInstance {
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn state(&self) -> EnclaveState {
        *self.shared.state.borrow()
    }

    pub fn cpu_count(&self) -> u32 {
        self.cpu_count
    }

    pub fn memory_mb(&self) -> u64 {
        self.memory_mb
    }

    /// Output captured so far.
    pub fn stdout_snapshot(&self) -> Vec<u8> {
        self.shared.stdout.lock().clone()
    }

    pub fn stderr_snapshot(&self) -> Vec<u8> {
        self.shared.stderr.lock().clone()
    }

    /// Subscribe to state transitions.
    pub fn watch(&self) -> watch::Receiver<EnclaveState> {
        self.shared.state.subscribe()
    }

    /// Wait until the enclave stops, or fail with `Timeout` leaving it
    /// running so the caller can force termination.
    pub async fn wait_for_completion(&self, timeout: Duration) -> Result<ExitOutcome, RunnerError> {
        let mut rx = self.shared.state.subscribe();
        let stopping = tokio::time::timeout(
            timeout,
            rx.wait_for(|s| *s >= EnclaveState::Terminating),
        )
        .await
        .map(|res| res.is_ok());
        if stopping.is_err() {
            return Err(RunnerError::Timeout(timeout));
        }

        let _ = rx.wait_for(|s| *s == EnclaveState::Terminated).await;
        self.shared.outcome.lock().clone().ok_or_else(|| {
            RunnerError::LaunchFailed(format!("enclave {} ended without an outcome", self.id()))
        })
    }

    /// Stop the enclave and wait for `Terminated`. Idempotent.
    pub async fn terminate(&self) -> Result<(), RunnerError> {
        let id = self.id().to_string();
        if self.shared.begin_terminating() {
            tracing::info!(%id, "terminating enclave");
            if let Err(e) = self.host.terminate(&id).await {
                tracing::warn!(%id, error = %e, "host termination failed, abandoning");
                self.abandon.cancel();
            }
        }

        let mut rx = self.shared.state.subscribe();
        let settled = tokio::time::timeout(
            self.terminate_grace,
            rx.wait_for(|s| *s == EnclaveState::Terminated),
        )
        .await
        .map(|res| res.is_ok());
        if settled.is_err() {
            tracing::warn!(%id, grace = ?self.terminate_grace, "enclave ignored termination, abandoning");
            self.abandon.cancel();
            let _ = rx.wait_for(|s| *s == EnclaveState::Terminated).await;
        }
        Ok(())
    }
}

impl Drop for EnclaveInstance {
    fn drop(&mut self) {
        if self.state() != EnclaveState::Terminated {
            self.abandon.cancel();
        }
    }
}

impl fmt::Debug for EnclaveInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnclaveInstance")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .field("cpu_count", &self.cpu_count)
            .field("memory_mb", &self.memory_mb)
            .finish()
    }
}
