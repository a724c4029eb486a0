//! VME runner
//!
//! Builds guest binaries, packages them for a platform, launches them as
//! local processes or in enclaves, talks to them over vsock or TCP loopback
//! and verifies their output.
//!
//! # Flow
//!
//! - **Probe**: [`capability`] checks the kernel, vsock loopback and tools once.
//! - **Build**: [`toolchain`] compiles the guest for the configured target.
//! - **Package**: [`image`] validates the artifact and measures enclave images.
//! - **Launch**: [`enclave`] owns instances and their CPU/memory reservations.
//! - **Talk**: [`channel`] opens retried connections; [`proxy`] serves guests.
//! - **Verify**: [`filter`] applies the platform's output comparison.
//!
//! [`orchestrator`] drives these per test and tears everything down on
//! every path before a result is produced.

pub mod capability;
pub mod channel;
pub mod cli;
pub mod command;
pub mod config;
pub mod enclave;
pub mod error;
pub mod filter;
pub mod image;
pub mod orchestrator;
pub mod peer;
pub mod protocol;
pub mod proxy;
pub mod suite;
pub mod telemetry;
pub mod toolchain;

pub use capability::{CapabilityProfile, Platform};
pub use error::RunnerError;
pub use orchestrator::{BatchReport, Orchestrator, TestCase, TestResult, TestStatus};
