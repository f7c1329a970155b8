//! Simple scanner / dispatcher / registry implementations for tests and demos.

use std::net::SocketAddr;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::HostPort;
use crate::connection::ConnectionTransport;
use crate::message_dispatcher::{MessageDispatcher, MessageScanner, ScanOutcome};
use crate::registry::{TransportInfo, TransportRegistry};

/// Newline-terminated messages, with leading CRLF treated as keep-alive filler. A
///  leading NUL byte is reported as unrecoverable garbage.
pub struct LineScanner;

impl MessageScanner for LineScanner {
    fn scan(&self, buf: &[u8]) -> ScanOutcome {
        if buf.starts_with(&[0u8]) {
            return ScanOutcome::Invalid;
        }
        if buf.starts_with(b"\r\n") {
            return ScanOutcome::Skip { len: 2 };
        }
        match buf.iter().position(|&b| b == b'\n') {
            Some(pos) => ScanOutcome::Complete { len: pos + 1 },
            None => ScanOutcome::Partial,
        }
    }
}

/// Forwards every dispatched message into an unbounded channel for test assertions.
pub struct RecordingDispatcher {
    sender: mpsc::UnboundedSender<(SocketAddr, Vec<u8>)>,
}

impl RecordingDispatcher {
    pub fn new() -> (RecordingDispatcher, mpsc::UnboundedReceiver<(SocketAddr, Vec<u8>)>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (RecordingDispatcher { sender }, receiver)
    }
}

#[async_trait]
impl MessageDispatcher for RecordingDispatcher {
    async fn on_message(&self, peer_addr: SocketAddr, msg: Vec<u8>) {
        let _ = self.sender.send((peer_addr, msg));
    }
}

/// Registry that ignores all registrations.
pub struct NullRegistry;

impl TransportRegistry for NullRegistry {
    fn register_factory(&self, _local_addr: SocketAddr, _published_addr: Option<HostPort>) {}
    fn unregister_factory(&self, _local_addr: SocketAddr) {}
    fn register_transport(&self, _transport: ConnectionTransport) {}
    fn unregister_transport(&self, _info: &TransportInfo) {}
}

/// What happened at the registry, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    FactoryRegistered(SocketAddr),
    FactoryUnregistered(SocketAddr),
    TransportRegistered(TransportInfo),
    TransportUnregistered(TransportInfo),
}

/// Registry that records its calls and keeps the registered transport handles, the way
///  a real routing layer would.
#[derive(Default)]
pub struct RecordingRegistry {
    events: Mutex<Vec<RegistryEvent>>,
    transports: Mutex<Vec<ConnectionTransport>>,
}

impl RecordingRegistry {
    pub fn new() -> RecordingRegistry {
        RecordingRegistry::default()
    }

    pub fn events(&self) -> Vec<RegistryEvent> {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Live handles of all currently registered transports.
    pub fn transports(&self) -> Vec<ConnectionTransport> {
        self.transports.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn push(&self, event: RegistryEvent) {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).push(event);
    }
}

impl TransportRegistry for RecordingRegistry {
    fn register_factory(&self, local_addr: SocketAddr, _published_addr: Option<HostPort>) {
        self.push(RegistryEvent::FactoryRegistered(local_addr));
    }

    fn unregister_factory(&self, local_addr: SocketAddr) {
        self.push(RegistryEvent::FactoryUnregistered(local_addr));
    }

    fn register_transport(&self, transport: ConnectionTransport) {
        if let Some(info) = transport.info() {
            self.push(RegistryEvent::TransportRegistered(info));
        }
        self.transports.lock().unwrap_or_else(|p| p.into_inner()).push(transport);
    }

    fn unregister_transport(&self, info: &TransportInfo) {
        self.push(RegistryEvent::TransportUnregistered(info.clone()));
        self.transports
            .lock().unwrap_or_else(|p| p.into_inner())
            .retain(|t| t.info().as_ref() != Some(info));
    }
}
