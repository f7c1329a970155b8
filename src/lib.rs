//! Stream-oriented connection transport for a text-based signaling protocol.
//!
//! This crate manages TCP connections carrying a message-based protocol over a byte
//!  stream without inherent message boundaries - think SIP-over-TCP style signaling. It
//!  handles the connection plumbing so that protocol logic upstack only ever sees whole
//!  messages:
//!
//! * one [connection::ConnectionTransport] per TCP connection, actively opened or
//!   passively accepted, with an explicit lifecycle
//!   (INIT, CONNECTING, CONNECTED_ACTIVE, CLOSING)
//! * incoming bytes are reassembled into discrete protocol messages: an injected
//!   [message_dispatcher::MessageScanner] finds message boundaries, complete messages are
//!   handed to an injected [message_dispatcher::MessageDispatcher] in receive order, and
//!   trailing bytes are retained for the next read - there is at most one partially
//!   received message buffered per connection
//! * connecting is non-blocking: sends submitted while the connect is still in flight are
//!   queued and flushed in strict submission order once the connection is established, or
//!   failed with the connect error if it is not; the submitter learns the outcome through
//!   a per-send ticket
//! * connections are kept alive with a bidirectional liveness probe: after a configurable
//!   idle interval a probe payload is sent, and the connection is closed if no traffic
//!   arrives before the response deadline. Probe and response payloads are deployment
//!   configuration (CRLF-based by default), not part of this crate's protocol knowledge
//! * per-connection state is touched concurrently by the read loop, timer tasks, the
//!   connect task and application tasks. All of that is coordinated through a
//!   reference-counted [lifetime_guard::LifetimeGuard]: state is torn down exactly once,
//!   when the last holder is gone, and late timer or I/O callbacks degrade to no-ops
//!   instead of touching freed state
//!
//! The crate deliberately knows nothing about the protocol being transported (parsing
//!  and routing live behind the [message_dispatcher::MessageScanner],
//!  [message_dispatcher::MessageDispatcher] and [registry::TransportRegistry]
//!  interfaces), and it does not do UDP or TLS - a TLS variant can wrap the socket layer
//!  without touching the state machine.
//!
//! Entry point is [factory::ConnectionFactory]: it binds and listens per
//!  [config::TransportConfig] (address family, QoS / socket options, accept concurrency)
//!  and opens outgoing connections.

pub mod config;
pub mod connection;
pub mod error;
pub mod factory;
pub mod keep_alive;
pub mod lifetime_guard;
pub mod message_dispatcher;
pub mod pending_send;
pub mod registry;
pub mod stream_socket;
pub mod test_util;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor(unsafe)]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
