//! Host-guest byte-stream channels.
//!
//! A [`Channel`] is a duplex stream over vsock, or over TCP loopback when
//! the guest runs as a local process. Opening retries with exponential
//! backoff until [`ConnectConfig::deadline`] so the guest may start
//! listening after the host begins connecting. Past the deadline the open
//! fails with `ChannelUnavailable`; it never waits indefinitely.

mod vsock;

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};

use crate::capability::CapabilityProfile;
use crate::error::RunnerError;
use crate::protocol;

pub use self::vsock::{AsyncVsockListener, AsyncVsockStream, CID_ANY, CID_HOST, CID_LOCAL};

/// Channel endpoint address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelAddr {
    Vsock { cid: u32, port: u32 },
    Tcp(SocketAddr),
}

impl ChannelAddr {
    pub fn is_vsock(&self) -> bool {
        matches!(self, ChannelAddr::Vsock { .. })
    }
}

impl FromStr for ChannelAddr {
    type Err = RunnerError;

    /// Parse `vsock:CID:PORT`, `tcp:HOST:PORT` or a bare `HOST:PORT`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let bad = || RunnerError::Config(format!("invalid channel address `{}`", s));
        if let Some(rest) = s.strip_prefix("vsock:") {
            let (cid, port) = rest.split_once(':').ok_or_else(bad)?;
            let cid = if cid == "any" {
                CID_ANY
            } else {
                cid.parse().map_err(|_| bad())?
            };
            let port = port.parse().map_err(|_| bad())?;
            return Ok(ChannelAddr::Vsock { cid, port });
        }
        let tcp = s.strip_prefix("tcp:").unwrap_or(s);
        tcp.parse().map(ChannelAddr::Tcp).map_err(|_| bad())
    }
}

impl fmt::Display for ChannelAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelAddr::Vsock { cid, port } => write!(f, "vsock:{}:{}", cid, port),
            ChannelAddr::Tcp(addr) => write!(f, "tcp:{}", addr),
        }
    }
}

/// Connection establishment policy.
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    /// Give up after this long.
    pub deadline: Duration,
    /// Delay after the first failed attempt; doubles up to `max_backoff`.
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(10),
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
        }
    }
}

enum Stream {
    Tcp(TcpStream),
    Vsock(AsyncVsockStream),
}

/// Open duplex byte stream between host and guest.
pub struct Channel {
    addr: ChannelAddr,
    stream: Stream,
}

fn check_supported(profile: &CapabilityProfile, addr: &ChannelAddr) -> Result<(), RunnerError> {
    if addr.is_vsock() && !profile.vsock_loopback_available {
        return Err(RunnerError::ChannelUnavailable {
            addr: addr.to_string(),
            waited: Duration::ZERO,
            reason: "vsock loopback is not available on this host".into(),
        });
    }
    Ok(())
}

async fn connect_once(addr: ChannelAddr) -> io::Result<Stream> {
    match addr {
        ChannelAddr::Tcp(sock) => {
            let stream = TcpStream::connect(sock).await?;
            stream.set_nodelay(true)?;
            Ok(Stream::Tcp(stream))
        }
        ChannelAddr::Vsock { cid, port } => {
            Ok(Stream::Vsock(AsyncVsockStream::connect(cid, port).await?))
        }
    }
}

impl Channel {
    /// Connect to `addr`, retrying until the deadline elapses.
    pub async fn open(
        profile: &CapabilityProfile,
        addr: ChannelAddr,
        config: &ConnectConfig,
    ) -> Result<Self, RunnerError> {
        check_supported(profile, &addr)?;

        let started = Instant::now();
        let mut backoff = config.initial_backoff;
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let remaining = config.deadline.saturating_sub(started.elapsed());
            let last_error = match tokio::time::timeout(remaining, connect_once(addr)).await {
                Ok(Ok(stream)) => {
                    tracing::debug!(%addr, attempt, "channel connected");
                    return Ok(Self { addr, stream });
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => "connect attempt timed out".to_string(),
            };

            let remaining = config.deadline.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                tracing::warn!(%addr, attempt, error = %last_error, "channel connect deadline elapsed");
                return Err(RunnerError::ChannelUnavailable {
                    addr: addr.to_string(),
                    waited: started.elapsed(),
                    reason: last_error,
                });
            }
            tracing::debug!(%addr, attempt, error = %last_error, ?backoff, "channel not ready, retrying");
            tokio::time::sleep(backoff.min(remaining)).await;
            backoff = (backoff * 2).min(config.max_backoff);
        }
    }

    pub fn addr(&self) -> ChannelAddr {
        self.addr
    }

    pub fn local_addr(&self) -> io::Result<String> {
        match &self.stream {
            Stream::Tcp(s) => s.local_addr().map(|a| a.to_string()),
            Stream::Vsock(s) => s.local_addr(),
        }
    }

    pub fn peer_addr(&self) -> io::Result<String> {
        match &self.stream {
            Stream::Tcp(s) => s.peer_addr().map(|a| a.to_string()),
            Stream::Vsock(s) => s.peer_addr(),
        }
    }

    /// Write all of `data` within `timeout`.
    pub async fn send(&mut self, data: &[u8], timeout: Duration) -> Result<(), RunnerError> {
        tokio::time::timeout(timeout, async {
            self.write_all(data).await?;
            self.flush().await
        })
        .await
        .map_err(|_| RunnerError::Timeout(timeout))??;
        Ok(())
    }

    /// Read whatever is available within `timeout`. `Ok(0)` means the peer
    /// closed its side.
    pub async fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, RunnerError> {
        let n = tokio::time::timeout(timeout, self.read(buf))
            .await
            .map_err(|_| RunnerError::Timeout(timeout))??;
        Ok(n)
    }

    /// Read until `len` bytes arrive or the peer closes, within `timeout`.
    pub async fn recv_up_to(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>, RunnerError> {
        let mut out = Vec::with_capacity(len);
        let result = tokio::time::timeout(timeout, async {
            let mut chunk = [0u8; 4096];
            while out.len() < len {
                let want = (len - out.len()).min(chunk.len());
                let n = self.read(&mut chunk[..want]).await?;
                if n == 0 {
                    break;
                }
                out.extend_from_slice(&chunk[..n]);
            }
            Ok::<_, io::Error>(())
        })
        .await;
        match result {
            Ok(Ok(())) => Ok(out),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(RunnerError::Timeout(timeout)),
        }
    }

    /// Send one protocol message.
    pub async fn send_message<T: Serialize>(&mut self, message: &T) -> Result<(), RunnerError> {
        protocol::write_message(self, message).await?;
        Ok(())
    }

    /// Receive one protocol message within `timeout`.
    pub async fn recv_message<T: DeserializeOwned>(&mut self, timeout: Duration) -> Result<T, RunnerError> {
        let message = tokio::time::timeout(timeout, protocol::read_message(self))
            .await
            .map_err(|_| RunnerError::Timeout(timeout))??;
        Ok(message)
    }

    /// Shut down the write half and drop the stream.
    pub async fn close(mut self) -> Result<(), RunnerError> {
        match self.shutdown().await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel").field("addr", &self.addr).finish()
    }
}

impl AsyncRead for Channel {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.get_mut().stream {
            Stream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Stream::Vsock(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Channel {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut self.get_mut().stream {
            Stream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Stream::Vsock(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().stream {
            Stream::Tcp(s) => Pin::new(s).poll_flush(cx),
            Stream::Vsock(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().stream {
            Stream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Stream::Vsock(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

enum Listener {
    Tcp(TcpListener),
    Vsock(AsyncVsockListener),
}

/// Accepts channels from the other side.
pub struct ChannelListener {
    addr: ChannelAddr,
    listener: Listener,
}

impl ChannelListener {
    /// Bind `addr`. Port 0 picks a free port; see [`ChannelListener::local_addr`].
    pub async fn bind(profile: &CapabilityProfile, addr: ChannelAddr) -> Result<Self, RunnerError> {
        check_supported(profile, &addr)?;
        let (listener, addr) = match addr {
            ChannelAddr::Tcp(sock) => {
                let listener = TcpListener::bind(sock).await?;
                let bound = listener.local_addr()?;
                (Listener::Tcp(listener), ChannelAddr::Tcp(bound))
            }
            ChannelAddr::Vsock { cid, port } => {
                let listener = AsyncVsockListener::bind(cid, port)?;
                let port = listener.local_port()?;
                (Listener::Vsock(listener), ChannelAddr::Vsock { cid, port })
            }
        };
        tracing::debug!(%addr, "channel listener bound");
        Ok(Self { addr, listener })
    }

    pub fn local_addr(&self) -> ChannelAddr {
        self.addr
    }

    /// Wait for the next incoming channel.
    pub async fn accept(&self) -> Result<Channel, RunnerError> {
        let stream = match &self.listener {
            Listener::Tcp(l) => {
                let (stream, _) = l.accept().await?;
                stream.set_nodelay(true)?;
                Stream::Tcp(stream)
            }
            Listener::Vsock(l) => Stream::Vsock(l.accept().await?),
        };
        Ok(Channel {
            addr: self.addr,
            stream,
        })
    }

    /// Like [`ChannelListener::accept`], bounded by `timeout`.
    pub async fn accept_timeout(&self, timeout: Duration) -> Result<Channel, RunnerError> {
        tokio::time::timeout(timeout, self.accept())
            .await
            .map_err(|_| RunnerError::Timeout(timeout))?
    }
}

impl fmt::Debug for ChannelListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelListener")
            .field("addr", &self.addr)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Platform;

    #[test]
    fn test_parse_addresses() {
        assert_eq!(
            "vsock:3:5000".parse::<ChannelAddr>().unwrap(),
            ChannelAddr::Vsock { cid: 3, port: 5000 }
        );
        assert_eq!(
            "vsock:any:10000".parse::<ChannelAddr>().unwrap(),
            ChannelAddr::Vsock {
                cid: CID_ANY,
                port: 10000
            }
        );
        assert_eq!(
            "tcp:127.0.0.1:80".parse::<ChannelAddr>().unwrap(),
            ChannelAddr::Tcp("127.0.0.1:80".parse().unwrap())
        );
        assert_eq!(
            "127.0.0.1:80".parse::<ChannelAddr>().unwrap(),
            ChannelAddr::Tcp("127.0.0.1:80".parse().unwrap())
        );
        assert!("vsock:3".parse::<ChannelAddr>().is_err());
        assert!("vsock:x:1".parse::<ChannelAddr>().is_err());
        assert!("localhost".parse::<ChannelAddr>().is_err());
    }

    #[test]
    fn test_display_round_trips() {
        let addr = ChannelAddr::Vsock { cid: 1, port: 42 };
        assert_eq!(addr.to_string().parse::<ChannelAddr>().unwrap(), addr);
    }

    #[tokio::test]
    async fn test_vsock_refused_without_loopback() {
        let profile = CapabilityProfile::assumed(Platform::Enclave, false);
        let err = Channel::open(
            &profile,
            ChannelAddr::Vsock { cid: 1, port: 5000 },
            &ConnectConfig::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            RunnerError::ChannelUnavailable { waited, .. } if waited == Duration::ZERO
        ));
    }
}
