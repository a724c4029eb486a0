//! Enclave-hosting collaborator interface.

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;

use crate::error::RunnerError;
use crate::image::EnclaveImage;

/// Readable output stream of a hosted enclave.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Resolves with the exit code once the hosted enclave stops.
/// `None` means it was killed rather than exiting on its own.
pub type ExitFuture = BoxFuture<'static, std::io::Result<Option<i32>>>;

/// A started enclave as handed back by the host.
pub struct HostedEnclave {
    pub id: String,
    pub stdout: BoxedReader,
    pub stderr: BoxedReader,
    pub exit: ExitFuture,
}

/// One entry of the host's running-enclave listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostedSummary {
    #[serde(rename = "EnclaveID")]
    pub id: String,
    #[serde(rename = "State", default)]
    pub state: String,
    #[serde(rename = "NumberOfCPUs", default)]
    pub cpu_count: Option<u32>,
    #[serde(rename = "MemoryMiB", default)]
    pub memory_mb: Option<u64>,
}

/// Launches and stops enclaves. Implementations must make `terminate` cause
/// the corresponding [`HostedEnclave::exit`] future to resolve.
#[async_trait]
pub trait EnclaveHost: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Start `image` with the given reservation.
    async fn run(
        &self,
        image: &EnclaveImage,
        cpu_count: u32,
        memory_mb: u64,
    ) -> Result<HostedEnclave, RunnerError>;

    /// List enclaves the host currently knows about.
    async fn describe(&self) -> Result<Vec<HostedSummary>, RunnerError>;

    /// Stop one enclave. Unknown ids are not an error.
    async fn terminate(&self, id: &str) -> Result<(), RunnerError>;

    /// Stop every enclave started through this host.
    async fn terminate_all(&self) -> Result<(), RunnerError>;
}
