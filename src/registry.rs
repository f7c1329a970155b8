use std::net::SocketAddr;

#[cfg(test)] use mockall::automock;

use crate::config::HostPort;
use crate::connection::ConnectionTransport;

/// Identity of one transport as seen by the registry: the addresses, the direction and
///  the optionally advertised address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportInfo {
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
    pub published_addr: Option<HostPort>,
    /// true for passively accepted connections, false for actively opened ones
    pub is_server: bool,
}

/// The external transport-selection manager. Factories and transports register here so
///  the routing layer can pick a connection for outgoing messages; the transport itself
///  never reads from the registry.
#[cfg_attr(test, automock)]
pub trait TransportRegistry: Send + Sync + 'static {
    fn register_factory(&self, local_addr: SocketAddr, published_addr: Option<HostPort>);
    fn unregister_factory(&self, local_addr: SocketAddr);

    /// Hands the registry a live handle: the routing layer keeps it to send, close or
    ///  probe on the connection - for accepted connections this is the only way the
    ///  handle ever reaches the application. The handle counts as a lifetime holder
    ///  until the registry drops it.
    fn register_transport(&self, transport: ConnectionTransport);

    /// The registry is expected to drop its handle for the matching transport.
    fn unregister_transport(&self, info: &TransportInfo);
}
