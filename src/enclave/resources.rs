//! CPU and memory reservation ledger.
//!
//! The lifecycle manager is the only component that reserves enclave
//! resources. Reservations are RAII guards; dropping the guard returns the
//! capacity, so every exit path releases what it took.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::RunnerError;

/// Reservable host capacity.
#[derive(Debug, Clone)]
pub struct ResourceConfig {
    pub cpu_capacity: u32,
    pub memory_capacity_mb: u64,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            cpu_capacity: num_cpus::get() as u32,
            memory_capacity_mb: 8192,
        }
    }
}

struct LedgerInner {
    config: ResourceConfig,
    reserved_cpus: AtomicU32,
    reserved_memory_mb: AtomicU64,
}

/// Tracks outstanding reservations against host capacity.
#[derive(Clone)]
pub struct ResourceLedger {
    inner: Arc<LedgerInner>,
}

impl ResourceLedger {
    pub fn new(config: ResourceConfig) -> Self {
        Self {
            inner: Arc::new(LedgerInner {
                config,
                reserved_cpus: AtomicU32::new(0),
                reserved_memory_mb: AtomicU64::new(0),
            }),
        }
    }

    /// Reserve `cpu_count` vCPUs and `memory_mb` MiB, or fail with `ResourceExhausted`.
    pub fn try_reserve(&self, cpu_count: u32, memory_mb: u64) -> Result<Reservation, RunnerError> {
        let inner = &self.inner;
        if cpu_count == 0 || memory_mb == 0 {
            return Err(RunnerError::ResourceExhausted {
                requested: format!("{} cpus / {} MiB", cpu_count, memory_mb),
                available: "a non-zero reservation".into(),
            });
        }

        let prev_cpus = inner.reserved_cpus.fetch_add(cpu_count, Ordering::SeqCst);
        if prev_cpus + cpu_count > inner.config.cpu_capacity {
            inner.reserved_cpus.fetch_sub(cpu_count, Ordering::SeqCst);
            return Err(RunnerError::ResourceExhausted {
                requested: format!("{} cpus", cpu_count),
                available: format!(
                    "{} cpus",
                    inner.config.cpu_capacity.saturating_sub(prev_cpus)
                ),
            });
        }

        let prev_memory = inner.reserved_memory_mb.fetch_add(memory_mb, Ordering::SeqCst);
        if prev_memory + memory_mb > inner.config.memory_capacity_mb {
            inner.reserved_memory_mb.fetch_sub(memory_mb, Ordering::SeqCst);
            inner.reserved_cpus.fetch_sub(cpu_count, Ordering::SeqCst);
            return Err(RunnerError::ResourceExhausted {
                requested: format!("{} MiB", memory_mb),
                available: format!(
                    "{} MiB",
                    inner.config.memory_capacity_mb.saturating_sub(prev_memory)
                ),
            });
        }

        tracing::debug!(cpu_count, memory_mb, "reserved enclave resources");
        Ok(Reservation {
            cpu_count,
            memory_mb,
            inner: self.inner.clone(),
        })
    }

    pub fn reserved_cpus(&self) -> u32 {
        self.inner.reserved_cpus.load(Ordering::SeqCst)
    }

    pub fn reserved_memory_mb(&self) -> u64 {
        self.inner.reserved_memory_mb.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &ResourceConfig {
        &self.inner.config
    }
}

/// RAII guard that returns reserved capacity when dropped.
pub struct Reservation {
    cpu_count: u32,
    memory_mb: u64,
    inner: Arc<LedgerInner>,
}

impl Reservation {
    pub fn cpu_count(&self) -> u32 {
        self.cpu_count
    }

    pub fn memory_mb(&self) -> u64 {
        self.memory_mb
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.inner.reserved_cpus.fetch_sub(self.cpu_count, Ordering::SeqCst);
        self.inner
            .reserved_memory_mb
            .fetch_sub(self.memory_mb, Ordering::SeqCst);
        tracing::debug!(
            cpu_count = self.cpu_count,
            memory_mb = self.memory_mb,
            "released enclave resources"
        );
    }
}
