use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, trace};

/// The write/shutdown side of the non-blocking socket abstraction, introduced to
///  facilitate mocking the I/O part away for testing. The read side is driven by the
///  per-connection read loop, which owns the concrete read half directly.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StreamSocket: Send + Sync + 'static {
    /// Writes the whole buffer to the stream, preserving submission order relative to
    ///  other `send_bytes` calls on the same socket.
    async fn send_bytes(&self, buf: &[u8]) -> io::Result<()>;

    /// Shuts down the write direction, prompting the peer (and the local read loop) to
    ///  observe end-of-stream. Errors are logged, not propagated - shutdown is part of
    ///  teardown and has nobody to report to.
    async fn shut_down(&self);

    fn local_addr(&self) -> SocketAddr;
    fn peer_addr(&self) -> SocketAddr;

    /// The raw OS handle, for diagnostics. Bypasses the managed I/O path - applications
    ///  must not read or write through it.
    fn raw_handle(&self) -> RawFd;
}

pub struct TokioStreamSocket {
    writer: AsyncMutex<OwnedWriteHalf>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    raw_fd: RawFd,
}

impl TokioStreamSocket {
    /// Splits a connected stream into the managed write side and the read half that the
    ///  read loop consumes.
    pub fn from_stream(stream: TcpStream) -> io::Result<(TokioStreamSocket, OwnedReadHalf)> {
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        let raw_fd = stream.as_raw_fd();
        let (read_half, write_half) = stream.into_split();

        Ok((
            TokioStreamSocket {
                writer: AsyncMutex::new(write_half),
                local_addr,
                peer_addr,
                raw_fd,
            },
            read_half,
        ))
    }
}

#[async_trait]
impl StreamSocket for TokioStreamSocket {
    async fn send_bytes(&self, buf: &[u8]) -> io::Result<()> {
        trace!("TCP socket: sending {} bytes to {:?}", buf.len(), self.peer_addr);
        let mut writer = self.writer.lock().await;
        writer.write_all(buf).await
    }

    async fn shut_down(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!("error shutting down stream to {:?}: {}", self.peer_addr, e);
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    fn raw_handle(&self) -> RawFd {
        self.raw_fd
    }
}
