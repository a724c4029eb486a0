//! Async vsock streams and listeners.
//!
//! The `vsock` crate sockets are switched to non-blocking mode and driven by
//! tokio's reactor through [`AsyncFd`]. Connecting is a blocking syscall and
//! runs on the blocking pool.

use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use vsock::{VsockListener, VsockStream};

/// Bind to any CID.
pub const CID_ANY: u32 = u32::MAX;
/// Local loopback CID.
pub const CID_LOCAL: u32 = 1;
/// Host CID as seen from a guest.
pub const CID_HOST: u32 = 2;

/// Non-blocking vsock stream registered with the tokio reactor.
pub struct AsyncVsockStream {
    inner: AsyncFd<VsockStream>,
}

impl AsyncVsockStream {
    pub async fn connect(cid: u32, port: u32) -> io::Result<Self> {
        let stream =
            tokio::task::spawn_blocking(move || VsockStream::connect_with_cid_port(cid, port))
                .await
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;
        Self::from_std(stream)
    }

    fn from_std(stream: VsockStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self {
            inner: AsyncFd::new(stream)?,
        })
    }

    pub fn local_addr(&self) -> io::Result<String> {
        let addr = self.inner.get_ref().local_addr()?;
        Ok(format!("vsock:{}:{}", addr.cid(), addr.port()))
    }

    pub fn peer_addr(&self) -> io::Result<String> {
        let addr = self.inner.get_ref().peer_addr()?;
        Ok(format!("vsock:{}:{}", addr.cid(), addr.port()))
    }
}

impl AsyncRead for AsyncVsockStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            let mut guard = ready!(this.inner.poll_read_ready_mut(cx))?;
            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|inner| inner.get_mut().read(unfilled)) {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for AsyncVsockStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        loop {
            let mut guard = ready!(this.inner.poll_write_ready_mut(cx))?;
            match guard.try_io(|inner| inner.get_mut().write(buf)) {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(self.inner.get_ref().shutdown(Shutdown::Write))
    }
}

/// Non-blocking vsock listener.
pub struct AsyncVsockListener {
    inner: AsyncFd<VsockListener>,
}

impl AsyncVsockListener {
    pub fn bind(cid: u32, port: u32) -> io::Result<Self> {
        let listener = VsockListener::bind_with_cid_port(cid, port)?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            inner: AsyncFd::new(listener)?,
        })
    }

    pub async fn accept(&self) -> io::Result<AsyncVsockStream> {
        loop {
            let mut guard = self.inner.readable().await?;
            match guard.try_io(|inner| inner.get_ref().accept()) {
                Ok(Ok((stream, _addr))) => return AsyncVsockStream::from_std(stream),
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
    }

    pub fn local_port(&self) -> io::Result<u32> {
        Ok(self.inner.get_ref().local_addr()?.port())
    }
}
