use std::io;
use thiserror::Error;

/// Error taxonomy of the transport. Connect-time and accept-time failures are reported
///  via return values or the stored [CloseReason] - they are never propagated across
///  task boundaries as panics.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// the listen address was unavailable - fatal to factory start
    #[error("address unavailable for listening: {0}")]
    Bind(String),

    /// unsupported or inconsistent address family - fatal to factory start
    #[error("unsupported address family: {0}")]
    AddressFamily(String),

    /// the asynchronous connect failed - propagated to all queued sends
    #[error("connect failed: {0}")]
    Connect(String),

    /// read/write failure or peer reset on an active connection
    #[error("stream error: {0}")]
    Stream(String),

    /// no qualifying keep-alive response arrived before the deadline
    #[error("no keep-alive response before the deadline")]
    KeepAliveTimeout,

    /// an operation was attempted on a transport that is closing or destroyed
    #[error("transport is closing or destroyed")]
    TransportClosed,
}

impl TransportError {
    pub(crate) fn bind(e: io::Error) -> TransportError {
        TransportError::Bind(e.to_string())
    }

    pub(crate) fn connect(e: io::Error) -> TransportError {
        TransportError::Connect(e.to_string())
    }

    pub(crate) fn stream(e: io::Error) -> TransportError {
        TransportError::Stream(e.to_string())
    }
}

/// Why a transport left CONNECTED_ACTIVE (or never reached it). Stored on the transport
///  for diagnostics when it transitions to CLOSING.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// explicit close requested by the application
    ApplicationClose,
    /// the peer closed or reset the connection
    PeerClosed,
    /// the asynchronous connect completed with an error
    ConnectFailed(String),
    /// a read or write on the active connection failed, or inbound bytes were garbage
    StreamError(String),
    /// the keep-alive response deadline expired
    KeepAliveTimeout,
}

impl CloseReason {
    /// The error reported to senders whose queued entries are failed by this closure.
    pub fn as_error(&self) -> TransportError {
        match self {
            CloseReason::ApplicationClose => TransportError::TransportClosed,
            CloseReason::PeerClosed => TransportError::Stream("peer closed the connection".to_string()),
            CloseReason::ConnectFailed(e) => TransportError::Connect(e.clone()),
            CloseReason::StreamError(e) => TransportError::Stream(e.clone()),
            CloseReason::KeepAliveTimeout => TransportError::KeepAliveTimeout,
        }
    }
}
