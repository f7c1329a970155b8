use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use bytes::Bytes;

use crate::error::TransportError;

/// A host/port pair that is advertised instead of the bound address, for NAT / proxy
///  scenarios where the reachable address differs from the local one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

/// QoS traffic class, mapped to a DSCP / TOS value on the socket. Setting the class is
///  preferable to a raw TOS value since the mapping is kept in one place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QosClass {
    BestEffort,
    Background,
    Video,
    Voice,
    ControlData,
}

impl QosClass {
    /// DSCP code points shifted into the TOS byte: CS1 for background, AF41 for video,
    ///  EF for voice, CS6 for control.
    pub fn tos_value(&self) -> u32 {
        match self {
            QosClass::BestEffort => 0x00,
            QosClass::Background => 0x20,
            QosClass::Video => 0x88,
            QosClass::Voice => 0xb8,
            QosClass::ControlData => 0xc0,
        }
    }
}

/// Low-level socket options applied to listener and connect sockets, expressed as a
///  typed list rather than raw level/name/value triples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketOption {
    NoDelay(bool),
    RecvBufferSize(usize),
    SendBufferSize(usize),
    /// raw TOS byte - prefer [TransportConfig::qos] unless a specific value is required
    Tos(u32),
}

/// Timing and payloads for the bidirectional liveness probe.
///
/// The probe payload and the expected response are deployment configuration, not fixed
///  by the protocol: the probe must merely be a minimal packet that the peer recognizes
///  as a no-op, and the response is whatever the peer sends back for it.
#[derive(Debug, Clone)]
pub struct KeepAliveConfig {
    /// a probe is sent after this much time without send or receive activity
    pub idle_interval: Duration,

    /// how long to wait for a qualifying response after sending a probe before the
    ///  connection is declared dead
    pub response_deadline: Duration,

    pub probe_payload: Bytes,
    pub expected_response: Bytes,
}

impl Default for KeepAliveConfig {
    fn default() -> KeepAliveConfig {
        KeepAliveConfig {
            idle_interval: Duration::from_secs(90),
            response_deadline: Duration::from_secs(10),
            probe_payload: Bytes::from_static(b"\r\n\r\n"),
            expected_response: Bytes::from_static(b"\r\n"),
        }
    }
}

/// Settings consumed once by [crate::factory::ConnectionFactory] at start. Immutable
///  after creation.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub address_family: AddressFamily,

    /// Optional address to bind to. Default is the unspecified address of the configured
    ///  family with port 0, i.e. any interface and an OS-assigned port.
    pub bind_addr: Option<SocketAddr>,

    /// whether SO_REUSEADDR is set on the listener socket
    pub reuse_addr: bool,

    /// optional advertised address, distinct from the bound address
    pub published_addr: Option<HostPort>,

    /// Number of concurrent accept operations kept outstanding by the listener. It is
    ///  recommended that this corresponds to the number of worker threads.
    pub async_accept_count: usize,

    pub qos: Option<QosClass>,
    pub sockopt_params: Vec<SocketOption>,

    pub keep_alive: KeepAliveConfig,

    /// Upper bound for the reassembly buffer: if the scanner still reports an incomplete
    ///  message at this size, the connection is closed rather than buffering without limit.
    pub max_message_size: usize,

    /// size of the buffer handed to each socket read
    pub read_buffer_size: usize,
}

impl TransportConfig {
    pub fn default_ipv4() -> TransportConfig {
        TransportConfig {
            address_family: AddressFamily::Ipv4,
            bind_addr: None,
            reuse_addr: true,
            published_addr: None,
            async_accept_count: 1,
            qos: None,
            sockopt_params: Vec::new(),
            keep_alive: KeepAliveConfig::default(),
            max_message_size: 256 * 1024,
            read_buffer_size: 16 * 1024,
        }
    }

    pub fn default_ipv6() -> TransportConfig {
        TransportConfig {
            address_family: AddressFamily::Ipv6,
            ..TransportConfig::default_ipv4()
        }
    }

    /// The address the listener binds to: the configured one, or the family's
    ///  unspecified address with an OS-assigned port.
    pub fn effective_bind_addr(&self) -> SocketAddr {
        self.bind_addr.unwrap_or(match self.address_family {
            AddressFamily::Ipv4 => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            AddressFamily::Ipv6 => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        })
    }

    pub fn validate(&self) -> Result<(), TransportError> {
        if let Some(bind_addr) = self.bind_addr {
            let family_matches = match self.address_family {
                AddressFamily::Ipv4 => bind_addr.is_ipv4(),
                AddressFamily::Ipv6 => bind_addr.is_ipv6(),
            };
            if !family_matches {
                return Err(TransportError::AddressFamily(format!(
                    "bind address {} does not match configured family {:?}",
                    bind_addr, self.address_family
                )));
            }
        }
        if self.async_accept_count == 0 {
            return Err(TransportError::Bind("async_accept_count must be at least 1".to_string()));
        }
        if self.keep_alive.idle_interval.is_zero() || self.keep_alive.response_deadline.is_zero() {
            return Err(TransportError::Bind("keep-alive intervals must be non-zero".to_string()));
        }
        if self.keep_alive.probe_payload.is_empty() {
            return Err(TransportError::Bind("keep-alive probe payload must not be empty".to_string()));
        }
        if self.read_buffer_size == 0 || self.max_message_size == 0 {
            return Err(TransportError::Bind("buffer sizes must be non-zero".to_string()));
        }
        Ok(())
    }
}
