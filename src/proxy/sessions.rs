//! Bounded pool of proxied sessions with drain-on-shutdown.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

/// Outcome of draining the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainResult {
    Complete,
    Timeout { remaining: usize },
}

/// Counts live sessions against a fixed maximum.
pub struct SessionPool {
    active: AtomicUsize,
    max_sessions: usize,
    accepting: AtomicBool,
    notify: Notify,
}

impl SessionPool {
    pub fn new(max_sessions: usize) -> Arc<Self> {
        Arc::new(Self {
            active: AtomicUsize::new(0),
            max_sessions,
            accepting: AtomicBool::new(true),
            notify: Notify::new(),
        })
    }

    /// Try to take a session slot. `None` when full or closed.
    pub fn try_acquire(self: &Arc<Self>) -> Option<SessionGuard> {
        if !self.is_accepting() {
            return None;
        }
        loop {
            let current = self.active.load(Ordering::Relaxed);
            if current >= self.max_sessions {
                return None;
            }

            if self
                .active
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                return Some(SessionGuard { pool: self.clone() });
            }
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Stop handing out slots. Existing sessions are unaffected.
    pub fn close(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    /// Close the pool and wait for live sessions to finish.
    pub async fn drain(&self, timeout: Duration) -> DrainResult {
        self.close();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let count = self.active_count();
            if count == 0 {
                return DrainResult::Complete;
            }

            let remaining_time = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining_time.is_zero() {
                return DrainResult::Timeout { remaining: count };
            }

            tokio::select! {
                _ = self.notify.notified() => continue,
                _ = tokio::time::sleep(remaining_time) => {
                    let final_count = self.active_count();
                    if final_count == 0 {
                        return DrainResult::Complete;
                    }
                    return DrainResult::Timeout { remaining: final_count };
                }
            }
        }
    }

    fn release(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.notify.notify_one();
    }
}

/// Releases its session slot on drop.
pub struct SessionGuard {
    pool: Arc<SessionPool>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.pool.release();
    }
}
