use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;

/// What the external parser found at the start of the reassembly buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    /// the first `len` bytes form one complete protocol message
    Complete { len: usize },
    /// the buffer holds the start of a message that is not complete yet
    Partial,
    /// the first `len` bytes are protocol-legal filler (e.g. keep-alive padding) and
    ///  carry no message
    Skip { len: usize },
    /// the buffer does not start with anything the protocol recognizes - the stream is
    ///  beyond recovery since message boundaries are lost
    Invalid,
}

/// The protocol message parser, viewed through the narrowest possible interface: the
///  transport only needs to find message boundaries in a byte stream, actual parsing
///  happens upstack. Injected into the transport at construction.
#[cfg_attr(test, automock)]
pub trait MessageScanner: Send + Sync + 'static {
    fn scan(&self, buf: &[u8]) -> ScanOutcome;
}

/// This trait decouples the transport from the handling of a fully reassembled message.
///
/// It is passed around as an `Arc<dyn ...>` to minimize dependencies of the transport.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageDispatcher: Send + Sync + 'static {
    async fn on_message(&self, peer_addr: SocketAddr, msg: Vec<u8>);
}
