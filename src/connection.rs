use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::unix::io::RawFd;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tracing::{debug, debug_span, info, trace, warn, Instrument};
use uuid::Uuid;

use crate::config::{AddressFamily, HostPort, TransportConfig};
use crate::error::{CloseReason, TransportError};
use crate::keep_alive::{KeepAliveDriver, KeepAliveScheduler};
use crate::lifetime_guard::{GuardToken, LifetimeGuard};
use crate::message_dispatcher::{MessageDispatcher, MessageScanner, ScanOutcome};
use crate::pending_send::{PendingSendQueue, SendTicket};
use crate::registry::{TransportInfo, TransportRegistry};
use crate::stream_socket::{StreamSocket, TokioStreamSocket};

/// Lifecycle of one connection. There is no explicit 'destroyed' state: a transport is
///  destroyed when its lifetime guard is torn down, i.e. when the last holder (handle,
///  read loop, timer) is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// created, connection establishment not started yet
    Init,
    /// an asynchronous connect is in progress - sends are queued
    Connecting,
    /// fully established, sends go to the socket, the read loop and keep-alive run
    ConnectedActive,
    /// terminal: the socket is shut down and all further operations are rejected
    Closing,
}

/// How a [ConnectionTransport::send] call was handled.
pub enum SendOutcome {
    /// the payload was written to the socket
    Sent,
    /// connect was still pending - the payload was queued, the ticket resolves when it
    ///  is flushed or failed
    Queued(SendTicket),
}

struct ConnectionInner {
    state: TransportState,
    info: TransportInfo,
    is_registered: bool,
    close_reason: Option<CloseReason>,
    socket: Option<Arc<dyn StreamSocket>>,
    reassembly: BytesMut,
    pending: PendingSendQueue,
}

/// One stream connection to a peer, either actively opened or passively accepted.
///
/// This is a cheaply cloneable handle: all clones, the read loop and armed keep-alive
///  timers share one [LifetimeGuard] holding the actual connection state, so a late
///  timer or I/O completion never touches freed state.
pub struct ConnectionTransport {
    core: Arc<ConnectionCore>,
    _token: GuardToken,
}

impl Clone for ConnectionTransport {
    fn clone(&self) -> Self {
        ConnectionTransport {
            core: self.core.clone(),
            _token: self._token.clone(),
        }
    }
}

impl ConnectionTransport {
    pub(crate) fn new(
        remote_addr: SocketAddr,
        is_server: bool,
        published_addr: Option<HostPort>,
        config: Arc<TransportConfig>,
        scanner: Arc<dyn MessageScanner>,
        dispatcher: Arc<dyn MessageDispatcher>,
        registry: Arc<dyn TransportRegistry>,
    ) -> ConnectionTransport {
        // the real local address becomes known once the socket is connected
        let placeholder_local = match config.address_family {
            AddressFamily::Ipv4 => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            AddressFamily::Ipv6 => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };

        let guard = LifetimeGuard::new(ConnectionInner {
            state: TransportState::Init,
            info: TransportInfo {
                local_addr: placeholder_local,
                remote_addr,
                published_addr,
                is_server,
            },
            is_registered: false,
            close_reason: None,
            socket: None,
            reassembly: BytesMut::new(),
            pending: PendingSendQueue::new(),
        });
        let token = guard.acquire();

        let core = Arc::new_cyclic(|weak: &Weak<ConnectionCore>| {
            let driver = SchedulerDriver {
                core: weak.clone(),
                guard: guard.clone(),
            };
            ConnectionCore {
                scheduler: KeepAliveScheduler::new(&config.keep_alive, Arc::new(driver)),
                guard,
                config,
                scanner,
                dispatcher,
                registry,
                correlation_id: Uuid::new_v4(),
            }
        });

        ConnectionTransport { core, _token: token }
    }

    pub(crate) fn mark_connecting(&self) {
        self.core.guard.with(|inner| {
            if inner.state == TransportState::Init {
                inner.state = TransportState::Connecting;
            }
        });
    }

    /// Takes the connected stream into service: transitions to CONNECTED_ACTIVE, flushes
    ///  queued sends in submission order, registers the transport, arms keep-alive and
    ///  starts the read loop.
    pub(crate) async fn activate(&self, stream: TcpStream) -> Result<(), TransportError> {
        let (socket, read_half) = TokioStreamSocket::from_stream(stream)
            .map_err(TransportError::stream)?;
        self.core.activate(Arc::new(socket), read_half).await
    }

    /// Reports a failed asynchronous connect: all queued sends fail with a connect
    ///  error and the transport transitions to CLOSING.
    pub(crate) async fn fail_connect(&self, error: String) {
        self.core.close(CloseReason::ConnectFailed(error)).await;
    }

    /// Sends `payload` on the connection, or queues it if connect is still pending.
    pub async fn send(&self, payload: Bytes) -> Result<SendOutcome, TransportError> {
        self.core.send(payload).await
    }

    /// Closes the connection: pending sends fail, the socket's write direction is shut
    ///  down and the transport is unregistered. Idempotent, including during a pending
    ///  connect.
    pub async fn close(&self) {
        self.core.close(CloseReason::ApplicationClose).await;
    }

    /// Asks for a keep-alive probe ahead of the idle schedule. No-op if a probe response
    ///  is already being awaited, and also before the connection is established - only a
    ///  transport that is closing or destroyed reports an error.
    pub fn request_keep_alive(&self) -> Result<(), TransportError> {
        match self.core.guard.with(|inner| inner.state) {
            Some(TransportState::ConnectedActive) => {
                self.core.scheduler.request_probe();
                Ok(())
            }
            Some(TransportState::Init) | Some(TransportState::Connecting) => {
                trace!("keep-alive requested before the connection is established - ignoring");
                Ok(())
            }
            Some(TransportState::Closing) | None => Err(TransportError::TransportClosed),
        }
    }

    /// `None` once the transport is destroyed.
    pub fn state(&self) -> Option<TransportState> {
        self.core.guard.with(|inner| inner.state)
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.core.guard.with(|inner| inner.close_reason.clone()).flatten()
    }

    pub fn info(&self) -> Option<TransportInfo> {
        self.core.guard.with(|inner| inner.info.clone())
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.core.guard.with(|inner| inner.info.remote_addr)
    }

    /// The raw OS handle of the underlying socket, for diagnostics. `None` unless the
    ///  connection is established.
    pub fn socket_handle(&self) -> Option<RawFd> {
        self.core.guard
            .with(|inner| inner.socket.as_ref().map(|s| s.raw_handle()))
            .flatten()
    }

    pub fn is_awaiting_keep_alive_response(&self) -> bool {
        self.core.scheduler.is_awaiting_response()
    }
}

struct ConnectionCore {
    guard: LifetimeGuard<ConnectionInner>,
    config: Arc<TransportConfig>,
    scanner: Arc<dyn MessageScanner>,
    dispatcher: Arc<dyn MessageDispatcher>,
    registry: Arc<dyn TransportRegistry>,
    scheduler: Arc<KeepAliveScheduler>,
    correlation_id: Uuid,
}

enum SendAction {
    Write(Arc<dyn StreamSocket>),
    Queued(SendTicket),
    Closed,
}

impl ConnectionCore {
    /// A fresh application-facing handle, e.g. for handing the transport to the
    ///  registry. Holds its own guard token.
    fn handle(self: &Arc<Self>) -> ConnectionTransport {
        ConnectionTransport {
            core: self.clone(),
            _token: self.guard.acquire(),
        }
    }

    async fn send(&self, payload: Bytes) -> Result<SendOutcome, TransportError> {
        let action = self.guard.with(|inner| match inner.state {
            TransportState::Init | TransportState::Connecting => {
                SendAction::Queued(inner.pending.enqueue(payload.clone()))
            }
            TransportState::ConnectedActive => match &inner.socket {
                Some(socket) => SendAction::Write(socket.clone()),
                None => SendAction::Closed,
            },
            TransportState::Closing => SendAction::Closed,
        });

        match action {
            None | Some(SendAction::Closed) => Err(TransportError::TransportClosed),
            Some(SendAction::Queued(ticket)) => {
                trace!("connect pending - queueing send of {} bytes", payload.len());
                Ok(SendOutcome::Queued(ticket))
            }
            Some(SendAction::Write(socket)) => match socket.send_bytes(payload.as_ref()).await {
                Ok(()) => {
                    self.scheduler.on_send_activity();
                    Ok(SendOutcome::Sent)
                }
                Err(e) => {
                    let msg = e.to_string();
                    self.close(CloseReason::StreamError(msg.clone())).await;
                    Err(TransportError::Stream(msg))
                }
            },
        }
    }

    async fn activate(
        self: &Arc<Self>,
        socket: Arc<dyn StreamSocket>,
        read_half: OwnedReadHalf,
    ) -> Result<(), TransportError> {
        let activated = self.guard.with(|inner| {
            if inner.state == TransportState::Closing {
                return None;
            }
            inner.state = TransportState::ConnectedActive;
            inner.info.local_addr = socket.local_addr();
            inner.info.remote_addr = socket.peer_addr();
            inner.socket = Some(socket.clone());
            Some((inner.pending.flush_all(), inner.info.clone()))
        });

        let (flush, info) = match activated {
            Some(Some(x)) => x,
            Some(None) => {
                // closed while the connect was in flight - release the socket quietly
                debug!("connection was closed before establishment completed - discarding socket");
                socket.shut_down().await;
                return Ok(());
            }
            None => {
                socket.shut_down().await;
                return Err(TransportError::TransportClosed);
            }
        };

        info!("connection established: {} -> {} ({})",
            info.local_addr, info.remote_addr, if info.is_server { "accepted" } else { "opened" });

        // the registry call must not run under the state lock, so a close() racing with
        //  the registration is resolved by re-checking the state afterwards: whoever
        //  sees is_registered == false withdraws the registration here
        self.registry.register_transport(self.handle());
        let registered = self.guard
            .with(|inner| {
                if inner.state == TransportState::ConnectedActive {
                    inner.is_registered = true;
                    true
                }
                else {
                    false
                }
            })
            .unwrap_or(false);
        if !registered {
            debug!("connection was closed while registering - withdrawing the registration");
            self.registry.unregister_transport(&info);
            for entry in flush {
                entry.complete(Err(TransportError::TransportClosed));
            }
            return Ok(());
        }

        let mut flush_error: Option<TransportError> = None;
        for entry in flush {
            match &flush_error {
                None => match socket.send_bytes(entry.payload().as_ref()).await {
                    Ok(()) => entry.complete(Ok(())),
                    Err(e) => {
                        let err = TransportError::Stream(e.to_string());
                        entry.complete(Err(err.clone()));
                        flush_error = Some(err);
                    }
                },
                Some(err) => entry.complete(Err(err.clone())),
            }
        }
        if let Some(err) = flush_error {
            warn!("flushing queued sends failed: {}", err);
            self.close(CloseReason::StreamError(err.to_string())).await;
            return Err(err);
        }

        self.scheduler.start();
        self.spawn_read_loop(read_half);
        Ok(())
    }

    fn spawn_read_loop(self: &Arc<Self>, read_half: OwnedReadHalf) {
        let core = self.clone();
        let token = self.guard.acquire();
        let span = debug_span!("conn", id = %self.correlation_id);
        tokio::spawn(
            async move {
                core.read_loop(read_half, token).await;
            }
            .instrument(span),
        );
    }

    async fn read_loop(&self, mut read_half: OwnedReadHalf, token: GuardToken) {
        let _token = token;
        let mut buf = vec![0u8; self.config.read_buffer_size];
        loop {
            match read_half.read(&mut buf).await {
                Ok(0) => {
                    debug!("peer closed the connection");
                    self.close(CloseReason::PeerClosed).await;
                    break;
                }
                Ok(n) => {
                    if !self.on_data_received(&buf[..n]).await {
                        break;
                    }
                }
                Err(e) => {
                    // reads racing with a local shutdown fail as well - close() is
                    //  idempotent, so the first reason wins
                    debug!("read failed: {}", e);
                    self.close(CloseReason::StreamError(e.to_string())).await;
                    break;
                }
            }
        }
        trace!("read loop terminated");
    }

    /// Appends received bytes to the reassembly buffer, carves out complete messages and
    ///  dispatches them. Returns false when the read loop should stop.
    async fn on_data_received(&self, data: &[u8]) -> bool {
        self.scheduler.on_receive_activity();

        let scanned = self.guard.with(|inner| {
            if inner.state != TransportState::ConnectedActive {
                trace!("discarding {} bytes received while not active", data.len());
                return Ok((Vec::new(), inner.info.remote_addr));
            }
            inner.reassembly.extend_from_slice(data);

            let mut messages = Vec::new();
            while !inner.reassembly.is_empty() {
                match self.scanner.scan(&inner.reassembly) {
                    ScanOutcome::Complete { len } => {
                        if len == 0 || len > inner.reassembly.len() {
                            return Err("scanner reported an inconsistent message length");
                        }
                        messages.push(inner.reassembly.split_to(len).to_vec());
                    }
                    ScanOutcome::Skip { len } => {
                        if len == 0 || len > inner.reassembly.len() {
                            return Err("scanner reported an inconsistent skip length");
                        }
                        let skipped = inner.reassembly.split_to(len);
                        if skipped.as_ref() == self.config.keep_alive.expected_response.as_ref() {
                            debug!("received keep-alive response");
                        }
                    }
                    ScanOutcome::Partial => break,
                    ScanOutcome::Invalid => {
                        return Err("unparseable inbound data - message boundaries are lost");
                    }
                }
            }

            if inner.reassembly.len() > self.config.max_message_size {
                return Err("incomplete message exceeds the maximum message size");
            }
            Ok((messages, inner.info.remote_addr))
        });

        match scanned {
            None => false,
            Some(Err(reason)) => {
                warn!("closing connection: {}", reason);
                self.close(CloseReason::StreamError(reason.to_string())).await;
                false
            }
            Some(Ok((messages, peer_addr))) => {
                for msg in messages {
                    trace!("dispatching {} byte message from {}", msg.len(), peer_addr);
                    self.dispatcher.on_message(peer_addr, msg).await;
                }
                self.guard.with(|inner| inner.state == TransportState::ConnectedActive)
                    .unwrap_or(false)
            }
        }
    }

    async fn close(&self, reason: CloseReason) {
        let cleanup = self.guard.with(|inner| {
            if inner.state == TransportState::Closing {
                return None;
            }
            info!("closing connection to {}: {:?}", inner.info.remote_addr, reason);
            inner.state = TransportState::Closing;
            inner.close_reason = Some(reason.clone());
            inner.pending.fail_all(&reason.as_error());
            let socket = inner.socket.take();
            let registered_info = std::mem::take(&mut inner.is_registered).then(|| inner.info.clone());
            Some((socket, registered_info))
        });

        let Some(Some((socket, registered_info))) = cleanup else {
            trace!("close: already closing or destroyed");
            return;
        };

        self.scheduler.stop();
        if let Some(info) = registered_info {
            self.registry.unregister_transport(&info);
        }
        if let Some(socket) = socket {
            socket.shut_down().await;
        }
    }

    async fn send_probe(&self) -> bool {
        let socket = match self.guard.with(|inner| {
            if inner.state == TransportState::ConnectedActive {
                inner.socket.clone()
            }
            else {
                None
            }
        }) {
            Some(Some(socket)) => socket,
            _ => return false,
        };

        match socket.send_bytes(self.config.keep_alive.probe_payload.as_ref()).await {
            Ok(()) => {
                trace!("keep-alive probe sent");
                true
            }
            Err(e) => {
                let msg = e.to_string();
                debug!("keep-alive probe failed: {}", msg);
                self.close(CloseReason::StreamError(msg)).await;
                false
            }
        }
    }
}

/// Connects the scheduler's upcalls to the connection without a strong reference cycle:
///  the scheduler outliving the connection core just means its probes report failure.
struct SchedulerDriver {
    core: Weak<ConnectionCore>,
    guard: LifetimeGuard<ConnectionInner>,
}

#[async_trait]
impl KeepAliveDriver for SchedulerDriver {
    fn hold(&self) -> GuardToken {
        self.guard.acquire()
    }

    async fn send_probe(&self) -> bool {
        match self.core.upgrade() {
            Some(core) => core.send_probe().await,
            None => false,
        }
    }

    async fn on_response_deadline(&self) {
        if let Some(core) = self.core.upgrade() {
            core.close(CloseReason::KeepAliveTimeout).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{LineScanner, NullRegistry, RecordingDispatcher, RecordingRegistry, RegistryEvent};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio::time;

    fn new_transport(
        remote_addr: SocketAddr,
        config: Arc<TransportConfig>,
        dispatcher: Arc<dyn MessageDispatcher>,
        registry: Arc<dyn TransportRegistry>,
    ) -> ConnectionTransport {
        ConnectionTransport::new(
            remote_addr,
            false,
            None,
            config,
            Arc::new(LineScanner),
            dispatcher,
            registry,
        )
    }

    async fn connected_pair(
        config: Arc<TransportConfig>,
        registry: Arc<dyn TransportRegistry>,
    ) -> (ConnectionTransport, TcpStream, mpsc::UnboundedReceiver<(SocketAddr, Vec<u8>)>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        let (dispatcher, received) = RecordingDispatcher::new();
        let transport = new_transport(addr, config, Arc::new(dispatcher), registry);
        transport.mark_connecting();
        transport.activate(client).await.unwrap();
        (transport, server, received)
    }

    async fn wait_for_closing(transport: &ConnectionTransport) {
        for _ in 0..200 {
            if transport.state() == Some(TransportState::Closing) {
                return;
            }
            time::sleep(Duration::from_millis(5)).await;
        }
        panic!("transport did not reach CLOSING");
    }

    #[tokio::test]
    async fn test_sends_during_connect_are_queued_and_flushed_in_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (dispatcher, _received) = RecordingDispatcher::new();
        let transport = new_transport(
            addr,
            Arc::new(TransportConfig::default_ipv4()),
            Arc::new(dispatcher),
            Arc::new(NullRegistry),
        );
        transport.mark_connecting();
        assert_eq!(transport.state(), Some(TransportState::Connecting));

        let t1 = match transport.send(Bytes::from_static(b"first\n")).await.unwrap() {
            SendOutcome::Queued(t) => t,
            SendOutcome::Sent => panic!("send must be queued while connecting"),
        };
        let t2 = match transport.send(Bytes::from_static(b"second\n")).await.unwrap() {
            SendOutcome::Queued(t) => t,
            SendOutcome::Sent => panic!("send must be queued while connecting"),
        };

        let client = TcpStream::connect(addr).await.unwrap();
        let (mut server, _) = listener.accept().await.unwrap();
        transport.activate(client).await.unwrap();
        assert_eq!(transport.state(), Some(TransportState::ConnectedActive));

        assert_eq!(t1.outcome().await, Ok(()));
        assert_eq!(t2.outcome().await, Ok(()));

        let mut buf = [0u8; 13];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"first\nsecond\n");
    }

    #[tokio::test]
    async fn test_connect_failure_fails_queued_sends() {
        let (dispatcher, _received) = RecordingDispatcher::new();
        let transport = new_transport(
            "127.0.0.1:9".parse().unwrap(),
            Arc::new(TransportConfig::default_ipv4()),
            Arc::new(dispatcher),
            Arc::new(NullRegistry),
        );
        transport.mark_connecting();

        let first = match transport.send(Bytes::from_static(b"lost\n")).await.unwrap() {
            SendOutcome::Queued(t) => t,
            SendOutcome::Sent => panic!("send must be queued while connecting"),
        };
        let second = match transport.send(Bytes::from_static(b"also lost\n")).await.unwrap() {
            SendOutcome::Queued(t) => t,
            SendOutcome::Sent => panic!("send must be queued while connecting"),
        };

        transport.fail_connect("connection refused".to_string()).await;

        assert_eq!(first.outcome().await, Err(TransportError::Connect("connection refused".to_string())));
        assert_eq!(second.outcome().await, Err(TransportError::Connect("connection refused".to_string())));
        assert_eq!(transport.state(), Some(TransportState::Closing));
        assert_eq!(transport.close_reason(), Some(CloseReason::ConnectFailed("connection refused".to_string())));
    }

    #[tokio::test]
    async fn test_send_on_active_connection() {
        let config = Arc::new(TransportConfig::default_ipv4());
        let (transport, mut server, _received) = connected_pair(config, Arc::new(NullRegistry)).await;

        assert!(matches!(
            transport.send(Bytes::from_static(b"MESSAGE hi\n")).await.unwrap(),
            SendOutcome::Sent
        ));

        let mut buf = [0u8; 11];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"MESSAGE hi\n");
    }

    #[tokio::test]
    async fn test_received_messages_are_reassembled_and_dispatched() {
        let config = Arc::new(TransportConfig::default_ipv4());
        let (transport, mut server, mut received) = connected_pair(config, Arc::new(NullRegistry)).await;

        server.write_all(b"INVITE a\nINV").await.unwrap();
        let (peer, msg) = received.recv().await.unwrap();
        assert_eq!(msg, b"INVITE a\n");
        assert_eq!(Some(peer), transport.remote_addr());

        // the fragment completes with the next read
        server.write_all(b"ITE b\n").await.unwrap();
        let (_, msg) = received.recv().await.unwrap();
        assert_eq!(msg, b"INVITE b\n");
    }

    #[tokio::test]
    async fn test_keep_alive_filler_is_skipped() {
        let config = Arc::new(TransportConfig::default_ipv4());
        let (_transport, mut server, mut received) = connected_pair(config, Arc::new(NullRegistry)).await;

        server.write_all(b"\r\nPING\n").await.unwrap();
        let (_, msg) = received.recv().await.unwrap();
        assert_eq!(msg, b"PING\n");
    }

    #[tokio::test]
    async fn test_garbage_input_closes_the_connection() {
        let config = Arc::new(TransportConfig::default_ipv4());
        let (transport, mut server, _received) = connected_pair(config, Arc::new(NullRegistry)).await;

        server.write_all(b"\0\0\0\0").await.unwrap();
        wait_for_closing(&transport).await;
        assert!(matches!(transport.close_reason(), Some(CloseReason::StreamError(_))));
    }

    #[tokio::test]
    async fn test_oversized_incomplete_message_closes_the_connection() {
        let mut config = TransportConfig::default_ipv4();
        config.max_message_size = 8;
        let (transport, mut server, _received) = connected_pair(Arc::new(config), Arc::new(NullRegistry)).await;

        server.write_all(b"no newline in sight here").await.unwrap();
        wait_for_closing(&transport).await;
        assert!(matches!(transport.close_reason(), Some(CloseReason::StreamError(_))));
    }

    #[tokio::test]
    async fn test_peer_close_is_detected_and_unregisters() {
        let config = Arc::new(TransportConfig::default_ipv4());
        let registry = Arc::new(RecordingRegistry::new());
        let (transport, server, _received) = connected_pair(config, registry.clone()).await;

        drop(server);
        wait_for_closing(&transport).await;
        assert_eq!(transport.close_reason(), Some(CloseReason::PeerClosed));

        let events = registry.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], RegistryEvent::TransportRegistered(_)));
        assert!(matches!(events[1], RegistryEvent::TransportUnregistered(_)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_rejects_further_sends() {
        let config = Arc::new(TransportConfig::default_ipv4());
        let (transport, mut server, _received) = connected_pair(config, Arc::new(NullRegistry)).await;

        transport.close().await;
        assert_eq!(transport.state(), Some(TransportState::Closing));
        assert_eq!(transport.close_reason(), Some(CloseReason::ApplicationClose));

        // peer observes EOF from the write-side shutdown
        let mut buf = [0u8; 16];
        assert_eq!(server.read(&mut buf).await.unwrap(), 0);

        transport.close().await;
        assert_eq!(transport.close_reason(), Some(CloseReason::ApplicationClose));

        assert_eq!(
            transport.send(Bytes::from_static(b"late\n")).await.err(),
            Some(TransportError::TransportClosed)
        );
        assert_eq!(transport.request_keep_alive(), Err(TransportError::TransportClosed));
    }

    #[tokio::test]
    async fn test_close_during_pending_connect_discards_late_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (dispatcher, _received) = RecordingDispatcher::new();
        let transport = new_transport(
            addr,
            Arc::new(TransportConfig::default_ipv4()),
            Arc::new(dispatcher),
            Arc::new(NullRegistry),
        );
        transport.mark_connecting();
        transport.close().await;

        // the connect completes after the close - the socket must be discarded
        let client = TcpStream::connect(addr).await.unwrap();
        let (mut server, _) = listener.accept().await.unwrap();
        transport.activate(client).await.unwrap();

        assert_eq!(transport.state(), Some(TransportState::Closing));
        let mut buf = [0u8; 16];
        assert_eq!(server.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_inconsistent_scanner_length_closes_the_connection() {
        use crate::message_dispatcher::MockMessageScanner;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (mut server, _) = listener.accept().await.unwrap();

        let mut scanner = MockMessageScanner::new();
        scanner.expect_scan()
            .return_const(ScanOutcome::Complete { len: 999 });
        let (dispatcher, _received) = RecordingDispatcher::new();

        let transport = ConnectionTransport::new(
            addr,
            false,
            None,
            Arc::new(TransportConfig::default_ipv4()),
            Arc::new(scanner),
            Arc::new(dispatcher),
            Arc::new(NullRegistry),
        );
        transport.mark_connecting();
        transport.activate(client).await.unwrap();

        server.write_all(b"ok\n").await.unwrap();
        wait_for_closing(&transport).await;
        assert!(matches!(transport.close_reason(), Some(CloseReason::StreamError(_))));
    }

    #[tokio::test]
    async fn test_socket_handle_available_while_active() {
        let config = Arc::new(TransportConfig::default_ipv4());
        let (transport, _server, _received) = connected_pair(config, Arc::new(NullRegistry)).await;

        assert!(transport.socket_handle().is_some());
        transport.close().await;
        assert_eq!(transport.socket_handle(), None);
    }

    fn short_keep_alive_config(idle_ms: u64, deadline_ms: u64) -> Arc<TransportConfig> {
        let mut config = TransportConfig::default_ipv4();
        config.keep_alive.idle_interval = Duration::from_millis(idle_ms);
        config.keep_alive.response_deadline = Duration::from_millis(deadline_ms);
        Arc::new(config)
    }

    #[tokio::test]
    async fn test_silent_peer_probe_and_timeout() {
        let config = short_keep_alive_config(100, 200);
        let (transport, mut server, _received) = connected_pair(config, Arc::new(NullRegistry)).await;

        // the idle timer fires and the probe payload shows up on the wire
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"\r\n\r\n");
        assert!(transport.is_awaiting_keep_alive_response());

        // the peer never answers
        wait_for_closing(&transport).await;
        assert_eq!(transport.close_reason(), Some(CloseReason::KeepAliveTimeout));
    }

    #[tokio::test]
    async fn test_outbound_sends_do_not_defeat_dead_peer_detection() {
        let config = short_keep_alive_config(100, 400);
        let (transport, mut server, _received) = connected_pair(config, Arc::new(NullRegistry)).await;

        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert!(transport.is_awaiting_keep_alive_response());

        // outgoing traffic proves nothing about the peer - the deadline must stay armed
        transport.send(Bytes::from_static(b"still there?\n")).await.unwrap();
        assert!(transport.is_awaiting_keep_alive_response());

        wait_for_closing(&transport).await;
        assert_eq!(transport.close_reason(), Some(CloseReason::KeepAliveTimeout));
    }

    #[tokio::test]
    async fn test_keep_alive_request_while_connecting_is_ignored() {
        let (dispatcher, _received) = RecordingDispatcher::new();
        let transport = new_transport(
            "127.0.0.1:9".parse().unwrap(),
            Arc::new(TransportConfig::default_ipv4()),
            Arc::new(dispatcher),
            Arc::new(NullRegistry),
        );
        transport.mark_connecting();

        assert_eq!(transport.request_keep_alive(), Ok(()));
        assert!(!transport.is_awaiting_keep_alive_response());
    }

    /// Closes the transport from inside the registration call, simulating an application
    ///  close landing between the state transition and the registry call.
    struct ClosingRegistry {
        events: Mutex<Vec<&'static str>>,
    }

    impl ClosingRegistry {
        fn new() -> ClosingRegistry {
            ClosingRegistry { events: Mutex::new(Vec::new()) }
        }
    }

    impl TransportRegistry for ClosingRegistry {
        fn register_factory(&self, _local_addr: SocketAddr, _published_addr: Option<HostPort>) {}
        fn unregister_factory(&self, _local_addr: SocketAddr) {}

        fn register_transport(&self, transport: ConnectionTransport) {
            transport.core.guard.with(|inner| {
                inner.state = TransportState::Closing;
                inner.close_reason = Some(CloseReason::ApplicationClose);
            });
            self.events.lock().unwrap().push("register");
        }

        fn unregister_transport(&self, _info: &TransportInfo) {
            self.events.lock().unwrap().push("unregister");
        }
    }

    #[tokio::test]
    async fn test_close_racing_with_registration_withdraws_the_registration() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let registry = Arc::new(ClosingRegistry::new());
        let (dispatcher, _received) = RecordingDispatcher::new();
        let transport = new_transport(
            addr,
            Arc::new(TransportConfig::default_ipv4()),
            Arc::new(dispatcher),
            registry.clone(),
        );
        transport.mark_connecting();
        let ticket = match transport.send(Bytes::from_static(b"raced\n")).await.unwrap() {
            SendOutcome::Queued(t) => t,
            SendOutcome::Sent => panic!("send must be queued while connecting"),
        };

        let client = TcpStream::connect(addr).await.unwrap();
        let (_server, _) = listener.accept().await.unwrap();
        transport.activate(client).await.unwrap();

        // no stale entry: the registration was withdrawn again, and the queued send
        //  was failed instead of being flushed to the closed connection
        assert_eq!(*registry.events.lock().unwrap(), vec!["register", "unregister"]);
        assert_eq!(transport.state(), Some(TransportState::Closing));
        assert_eq!(ticket.outcome().await, Err(TransportError::TransportClosed));
    }
}
