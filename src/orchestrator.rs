//! Test orchestration.
//!
//! One test runs through: peer start, build, package, launch, optional
//! channel exchange, wait, teardown, comparison. Teardown runs on every
//! path before a result is produced, so a failing test never leaves an
//! enclave, a peer or a proxy behind. A batch stops at its first failure.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::Instrument;

use crate::capability::{CapabilityProfile, Platform};
use crate::channel::{Channel, ChannelAddr, ConnectConfig};
use crate::enclave::{EnclaveInstance, EnclaveManager, ExitOutcome};
use crate::error::RunnerError;
use crate::filter::OutputPolicy;
use crate::image::ImageLoader;
use crate::peer::{PeerCommand, PeerHandle};
use crate::proxy::{ProxyConfig, ProxyHandle, ProxyServer};
use crate::toolchain::Builder;

/// Host-to-guest exchange run while the guest is up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    pub addr: ChannelAddr,
    pub send: Vec<u8>,
    pub expect: Vec<u8>,
}

/// Everything needed to run one test.
#[derive(Debug, Clone)]
pub struct TestCase {
    pub name: String,
    pub manifest: PathBuf,
    /// Expected stdout document (Local platform), compared byte for byte.
    pub expected_stdout: Option<Vec<u8>>,
    pub peer: Option<PeerCommand>,
    pub cpu_count: u32,
    pub memory_mb: u64,
    pub timeout: Duration,
    /// Serve the runner proxy for the duration of the test.
    pub runner: bool,
    pub exchange: Option<Exchange>,
}

impl TestCase {
    pub fn new(name: impl Into<String>, manifest: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            manifest: manifest.into(),
            expected_stdout: None,
            peer: None,
            cpu_count: 2,
            memory_mb: 512,
            timeout: Duration::from_secs(120),
            runner: false,
            exchange: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TestStatus {
    Pass,
    Fail,
}

/// Immutable record of one test run.
#[derive(Debug, Clone, Serialize)]
pub struct TestResult {
    pub name: String,
    pub platform: Platform,
    pub status: TestStatus,
    pub captured_stdout: String,
    pub captured_stderr: String,
    pub diagnostic: Option<String>,
    pub exit_code: Option<i32>,
    pub warnings: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl TestResult {
    pub fn passed(&self) -> bool {
        self.status == TestStatus::Pass
    }
}

/// A test result plus the error that failed it.
#[derive(Debug)]
pub struct TestRun {
    pub result: TestResult,
    pub error: Option<RunnerError>,
}

/// Results of a fail-fast batch.
#[derive(Debug)]
pub struct BatchReport {
    pub results: Vec<TestResult>,
    /// Error of the failing test, if any.
    pub error: Option<RunnerError>,
    /// Tests never started because an earlier one failed.
    pub not_run: Vec<String>,
}

impl BatchReport {
    pub fn passed(&self) -> bool {
        self.error.is_none() && self.results.iter().all(TestResult::passed)
    }
}

/// Orchestrator tunables.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub connect: ConnectConfig,
    /// Timeout for each send and receive of a channel exchange.
    pub exchange_timeout: Duration,
    /// How long a peer gets to exit once killed.
    pub peer_grace: Duration,
    /// Proxy settings for tests with `runner = true`.
    pub proxy: ProxyConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            connect: ConnectConfig::default(),
            exchange_timeout: Duration::from_secs(10),
            peer_grace: Duration::from_secs(2),
            proxy: ProxyConfig::new(ChannelAddr::Tcp(std::net::SocketAddr::from((
                [127, 0, 0, 1],
                crate::proxy::DEFAULT_RUNNER_PORT as u16,
            )))),
        }
    }
}

/// Resources acquired by a running test, released by teardown.
#[derive(Default)]
struct TestScope {
    peer: Option<PeerHandle>,
    proxy: Option<ProxyHandle>,
    instance: Option<EnclaveInstance>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    warnings: Vec<String>,
}

/// Drives tests end to end.
pub struct Orchestrator {
    profile: CapabilityProfile,
    builder: Arc<dyn Builder>,
    loader: ImageLoader,
    manager: EnclaveManager,
    policy: OutputPolicy,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        profile: CapabilityProfile,
        builder: Arc<dyn Builder>,
        loader: ImageLoader,
        manager: EnclaveManager,
        policy: OutputPolicy,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            profile,
            builder,
            loader,
            manager,
            policy,
            config,
        }
    }

    pub fn profile(&self) -> &CapabilityProfile {
        &self.profile
    }

    pub fn manager(&self) -> &EnclaveManager {
        &self.manager
    }

    /// Run tests in order, stopping at the first failure.
    pub async fn run_batch(&self, cases: &[TestCase]) -> BatchReport {
        let mut results = Vec::with_capacity(cases.len());
        for (i, case) in cases.iter().enumerate() {
            let run = self.run_test(case).await;
            results.push(run.result);
            if let Some(error) = run.error {
                let not_run: Vec<String> = cases[i + 1..].iter().map(|c| c.name.clone()).collect();
                if !not_run.is_empty() {
                    tracing::warn!(test = %case.name, skipped = not_run.len(), "aborting batch after failure");
                }
                return BatchReport {
                    results,
                    error: Some(error),
                    not_run,
                };
            }
        }
        BatchReport {
            results,
            error: None,
            not_run: Vec::new(),
        }
    }

    /// Run one test. Teardown has completed by the time this returns.
    pub async fn run_test(&self, case: &TestCase) -> TestRun {
        let span = tracing::info_span!("test", name = %case.name, platform = %self.policy.platform());
        self.run_test_inner(case).instrument(span).await
    }

    async fn run_test_inner(&self, case: &TestCase) -> TestRun {
        let started_at = Utc::now();
        let clock = Instant::now();
        tracing::info!("test started");

        let mut scope = TestScope::default();
        let executed = self.execute(case, &mut scope).await;
        self.teardown(&mut scope).await;

        let mut exit_code = None;
        let failure = match executed {
            Ok(outcome) => {
                exit_code = outcome.exit_code;
                let compared = self.policy.compare(
                    &outcome.stdout_bytes,
                    &outcome.stderr_bytes,
                    case.expected_stdout.as_deref(),
                );
                match compared {
                    Ok(()) => None,
                    Err(mismatch) => {
                        tracing::warn!(stream = mismatch.stream, "output mismatch");
                        Some((mismatch.diagnostic(), mismatch.into_error(&case.name)))
                    }
                }
            }
            Err(e) => Some((e.to_string(), e)),
        };
        let (status, diagnostic, error) = match failure {
            None => (TestStatus::Pass, None, None),
            Some((diagnostic, e)) => (TestStatus::Fail, Some(diagnostic), Some(e)),
        };

        let result = TestResult {
            name: case.name.clone(),
            platform: self.policy.platform(),
            status,
            captured_stdout: String::from_utf8_lossy(&scope.stdout).into_owned(),
            captured_stderr: String::from_utf8_lossy(&scope.stderr).into_owned(),
            diagnostic,
            exit_code,
            warnings: std::mem::take(&mut scope.warnings),
            started_at,
            duration_ms: clock.elapsed().as_millis() as u64,
        };
        match result.status {
            TestStatus::Pass => tracing::info!(duration_ms = result.duration_ms, "test passed"),
            TestStatus::Fail => tracing::error!(
                duration_ms = result.duration_ms,
                diagnostic = result.diagnostic.as_deref().unwrap_or(""),
                "test failed"
            ),
        }
        TestRun { result, error }
    }

    async fn execute(&self, case: &TestCase, scope: &mut TestScope) -> Result<ExitOutcome, RunnerError> {
        // The peer starts before compilation; the channel retry absorbs any
        // ordering between it and the guest.
        if let Some(command) = &case.peer {
            match PeerHandle::start(command) {
                Ok(peer) => scope.peer = Some(peer),
                Err(e) => {
                    tracing::warn!(error = %e, "interaction peer did not start");
                    scope.warnings.push(format!("interaction peer did not start: {}", e));
                }
            }
        }

        if case.runner {
            let server = ProxyServer::bind(&self.profile, self.config.proxy.clone()).await?;
            scope.proxy = Some(server.spawn());
        }

        let artifact = self.builder.build(&case.manifest).await?;
        let image = self
            .loader
            .package(&artifact, self.policy.platform())
            .await?;
        let instance = self
            .manager
            .launch(image, case.cpu_count, case.memory_mb)
            .await?;
        let instance = scope.instance.insert(instance);

        if let Some(exchange) = &case.exchange {
            self.exchange(exchange, &case.name).await?;
        }

        let outcome = instance.wait_for_completion(case.timeout).await?;
        scope.stdout = outcome.stdout_bytes.clone();
        scope.stderr = outcome.stderr_bytes.clone();
        Ok(outcome)
    }

    async fn exchange(&self, exchange: &Exchange, test: &str) -> Result<(), RunnerError> {
        let timeout = self.config.exchange_timeout;
        let mut channel = Channel::open(&self.profile, exchange.addr, &self.config.connect).await?;
        channel.send(&exchange.send, timeout).await?;
        let reply = channel.recv_up_to(exchange.expect.len(), timeout).await?;
        tracing::debug!(addr = %exchange.addr, sent = exchange.send.len(), received = reply.len(), "channel exchange");
        if let Err(e) = channel.close().await {
            tracing::debug!(error = %e, "channel close failed");
        }
        if reply != exchange.expect {
            return Err(RunnerError::OutputMismatch {
                test: test.to_string(),
                expected: String::from_utf8_lossy(&exchange.expect).into_owned(),
                actual: String::from_utf8_lossy(&reply).into_owned(),
            });
        }
        Ok(())
    }

    async fn teardown(&self, scope: &mut TestScope) {
        if let Some(instance) = scope.instance.take() {
            if let Err(e) = instance.terminate().await {
                tracing::warn!(id = instance.id(), error = %e, "enclave termination failed");
            }
            if scope.stdout.is_empty() && scope.stderr.is_empty() {
                scope.stdout = instance.stdout_snapshot();
                scope.stderr = instance.stderr_snapshot();
            }
        }

        if self.policy.platform() == Platform::Enclave {
            if let Err(e) = self.manager.terminate_all().await {
                tracing::warn!(error = %e, "terminate-all failed");
                scope.warnings.push(format!("terminate-all failed: {}", e));
            }
        }

        if let Some(peer) = scope.peer.take() {
            let report = peer.shutdown(self.config.peer_grace).await;
            if let Some(warning) = report.warning() {
                scope.warnings.push(warning);
            }
        }

        if let Some(proxy) = scope.proxy.take() {
            match proxy.stop().await {
                Ok(stats) => tracing::debug!(?stats, "runner proxy stopped"),
                Err(e) => tracing::warn!(error = %e, "runner proxy did not stop cleanly"),
            }
        }
    }
}
