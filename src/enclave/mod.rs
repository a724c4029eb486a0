//! Enclave hosting and lifecycle.
//!
//! [`EnclaveManager`] is the only component that reserves CPU and memory and
//! the only one that starts or stops enclaves. Hosts behind
//! [`EnclaveHost`] do the platform-specific work.

mod host;
mod manager;
mod nitro;
mod process;
mod resources;

pub use host::{BoxedReader, EnclaveHost, ExitFuture, HostedEnclave, HostedSummary};
pub use manager::{
    EnclaveInstance, EnclaveManager, EnclaveState, ExitOutcome, ManagerConfig, ManagerStats,
};
pub use nitro::{NitroCommands, NitroHost};
pub use process::ProcessHost;
pub use resources::{Reservation, ResourceConfig, ResourceLedger};
