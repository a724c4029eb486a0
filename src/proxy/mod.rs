//! Runner proxy server.
//!
//! Guests reach the outside world through the runner. A guest opens a
//! channel to the runner and sends [`Request::Connect`]; the runner connects
//! to the remote, binds a fresh loopback listener, answers
//! [`Response::Connected`] with its port, accepts the guest's data
//! connection there and copies bytes both ways until either side closes.
//!
//! ```text
//!            remote
//!              ^
//!              |
//!   +------ runner ------+         +--- guest ---+
//!   |  control   data    |<------->|  control    |
//!   +--------------------+<------->|  data       |
//! ```

mod sessions;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::capability::CapabilityProfile;
use crate::channel::{Channel, ChannelAddr, ChannelListener};
use crate::error::RunnerError;
use crate::protocol::{Request, Response};

pub use sessions::{DrainResult, SessionGuard, SessionPool};

/// Default control port guests connect to.
pub const DEFAULT_RUNNER_PORT: u32 = 10000;

/// Proxy server configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen: ChannelAddr,
    pub max_sessions: usize,
    /// How long a guest has to send its request or open the data connection.
    pub request_timeout: Duration,
    pub remote_connect_timeout: Duration,
    /// How long shutdown waits for live sessions.
    pub drain_timeout: Duration,
}

impl ProxyConfig {
    pub fn new(listen: ChannelAddr) -> Self {
        Self {
            listen,
            max_sessions: 64,
            request_timeout: Duration::from_secs(10),
            remote_connect_timeout: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

/// Traffic counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProxyStats {
    pub sessions_accepted: u64,
    pub sessions_rejected: u64,
    pub sessions_failed: u64,
    pub bytes_to_remote: u64,
    pub bytes_from_remote: u64,
}

#[derive(Default)]
struct Counters {
    accepted: AtomicU64,
    rejected: AtomicU64,
    failed: AtomicU64,
    to_remote: AtomicU64,
    from_remote: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> ProxyStats {
        ProxyStats {
            sessions_accepted: self.accepted.load(Ordering::SeqCst),
            sessions_rejected: self.rejected.load(Ordering::SeqCst),
            sessions_failed: self.failed.load(Ordering::SeqCst),
            bytes_to_remote: self.to_remote.load(Ordering::SeqCst),
            bytes_from_remote: self.from_remote.load(Ordering::SeqCst),
        }
    }
}

/// Accepts guest control connections and serves proxy requests.
pub struct ProxyServer {
    listener: ChannelListener,
    config: ProxyConfig,
    pool: Arc<SessionPool>,
    counters: Arc<Counters>,
}

impl ProxyServer {
    pub async fn bind(profile: &CapabilityProfile, config: ProxyConfig) -> Result<Self, RunnerError> {
        let listener = ChannelListener::bind(profile, config.listen).await?;
        let pool = SessionPool::new(config.max_sessions.max(1));
        Ok(Self {
            listener,
            config,
            pool,
            counters: Arc::new(Counters::default()),
        })
    }

    pub fn local_addr(&self) -> ChannelAddr {
        self.listener.local_addr()
    }

    pub fn stats(&self) -> ProxyStats {
        self.counters.snapshot()
    }

    /// Serve until `shutdown` is cancelled, then drain live sessions.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<ProxyStats, RunnerError> {
        let addr = self.local_addr();
        let sessions = shutdown.child_token();
        tracing::info!(%addr, max_sessions = self.pool.max_sessions(), "runner proxy listening");

        loop {
            let guest = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(channel) => channel,
                    Err(e) => {
                        tracing::warn!(%addr, error = %e, "accept failed");
                        continue;
                    }
                },
            };

            let Some(guard) = self.pool.try_acquire() else {
                self.counters.rejected.fetch_add(1, Ordering::SeqCst);
                tracing::warn!(active = self.pool.active_count(), "session limit reached, rejecting guest");
                tokio::spawn(async move {
                    let _ = guest.close().await;
                });
                continue;
            };
            self.counters.accepted.fetch_add(1, Ordering::SeqCst);

            let session = Session {
                config: self.config.clone(),
                counters: self.counters.clone(),
                cancel: sessions.clone(),
                _guard: guard,
            };
            tokio::spawn(session.run(guest));
        }

        match self.pool.drain(self.config.drain_timeout).await {
            DrainResult::Complete => {
                tracing::info!(%addr, "runner proxy drained");
            }
            DrainResult::Timeout { remaining } => {
                tracing::warn!(%addr, remaining, "drain timed out, cutting sessions");
                sessions.cancel();
            }
        }
        Ok(self.counters.snapshot())
    }

    /// Run the server on a background task.
    pub fn spawn(self) -> ProxyHandle {
        let addr = self.local_addr();
        let token = CancellationToken::new();
        let task = tokio::spawn(self.serve(token.clone()));
        ProxyHandle {
            addr,
            token,
            task: Some(task),
        }
    }
}

/// Handle to a proxy running in the background. Dropping it stops the proxy
/// without waiting for the drain.
pub struct ProxyHandle {
    addr: ChannelAddr,
    token: CancellationToken,
    task: Option<JoinHandle<Result<ProxyStats, RunnerError>>>,
}

impl ProxyHandle {
    pub fn local_addr(&self) -> ChannelAddr {
        self.addr
    }

    /// Stop accepting, drain sessions and return the final counters.
    pub async fn stop(mut self) -> Result<ProxyStats, RunnerError> {
        self.token.cancel();
        match self.task.take() {
            Some(task) => task
                .await
                .map_err(|e| RunnerError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?,
            None => Ok(ProxyStats::default()),
        }
    }
}

impl Drop for ProxyHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

struct Session {
    config: ProxyConfig,
    counters: Arc<Counters>,
    cancel: CancellationToken,
    _guard: SessionGuard,
}

impl Session {
    async fn run(self, mut guest: Channel) {
        let peer = guest.peer_addr().unwrap_or_default();
        let result = tokio::select! {
            r = self.handle(&mut guest) => r,
            _ = self.cancel.cancelled() => Err(RunnerError::Protocol("proxy shutting down".into())),
        };
        if let Err(e) = result {
            self.counters.failed.fetch_add(1, Ordering::SeqCst);
            tracing::warn!(guest = %peer, error = %e, "proxy session failed");
        }
        let _ = guest.close().await;
    }

    async fn handle(&self, guest: &mut Channel) -> Result<(), RunnerError> {
        let request: Request = guest.recv_message(self.config.request_timeout).await?;
        tracing::debug!(?request, "guest request");
        match request {
            Request::Connect { addr } => self.connect(guest, &addr).await,
        }
    }

    async fn connect(&self, guest: &mut Channel, remote_addr: &str) -> Result<(), RunnerError> {
        let connect = tokio::time::timeout(
            self.config.remote_connect_timeout,
            TcpStream::connect(remote_addr),
        )
        .await;
        let mut remote = match connect {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(refused(remote_addr, e)),
            Err(_) => return Err(refused(remote_addr, "timed out")),
        };

        let data_listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = data_listener.local_addr()?.port();
        let response = Response::Connected {
            port,
            local_addr: guest.local_addr()?,
            peer_addr: guest.peer_addr()?,
        };
        tracing::debug!(?response, remote = remote_addr, "proxy connected");
        guest.send_message(&response).await?;

        let (mut data, _) = tokio::time::timeout(self.config.request_timeout, data_listener.accept())
            .await
            .map_err(|_| RunnerError::Timeout(self.config.request_timeout))??;
        drop(data_listener);

        let (to_remote, from_remote) = tokio::io::copy_bidirectional(&mut data, &mut remote).await?;
        self.counters.to_remote.fetch_add(to_remote, Ordering::SeqCst);
        self.counters.from_remote.fetch_add(from_remote, Ordering::SeqCst);
        tracing::info!(remote = remote_addr, to_remote, from_remote, "proxied connection closed");
        Ok(())
    }
}

/// Failed requests get no response; the session closes the connection.
fn refused(remote_addr: &str, reason: impl std::fmt::Display) -> RunnerError {
    RunnerError::Protocol(format!("connect {}: {}", remote_addr, reason))
}
