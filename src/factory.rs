use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::net::{TcpListener, TcpSocket};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use crate::config::{AddressFamily, HostPort, SocketOption, TransportConfig};
use crate::connection::ConnectionTransport;
use crate::error::TransportError;
use crate::message_dispatcher::{MessageDispatcher, MessageScanner};
use crate::registry::TransportRegistry;

const LISTEN_BACKLOG: i32 = 128;

/// Everything an accept slot needs to turn an accepted stream into a transport. Shared
///  by value so the accept tasks do not keep the factory itself alive.
#[derive(Clone)]
struct AcceptContext {
    config: Arc<TransportConfig>,
    scanner: Arc<dyn MessageScanner>,
    dispatcher: Arc<dyn MessageDispatcher>,
    registry: Arc<dyn TransportRegistry>,
    local_addr: SocketAddr,
}

/// Entry point of the transport: binds and listens per configuration, keeps
///  `async_accept_count` concurrent accept operations outstanding, and opens outgoing
///  connections without blocking the caller.
///
/// Must be started from within a tokio runtime - the listener and all connection tasks
///  live on the ambient runtime.
pub struct ConnectionFactory {
    ctx: AcceptContext,
    accept_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionFactory {
    /// Validates the configuration, binds and listens, registers the factory with the
    ///  registry and spawns the accept loops.
    pub fn start(
        config: TransportConfig,
        registry: Arc<dyn TransportRegistry>,
        scanner: Arc<dyn MessageScanner>,
        dispatcher: Arc<dyn MessageDispatcher>,
    ) -> Result<ConnectionFactory, TransportError> {
        config.validate()?;

        let std_listener = bind_listener(&config)?;
        let listener = TcpListener::from_std(std_listener).map_err(TransportError::bind)?;
        let local_addr = listener.local_addr().map_err(TransportError::bind)?;

        info!("transport factory listening on {} (accept concurrency {})",
            local_addr, config.async_accept_count);
        registry.register_factory(local_addr, config.published_addr.clone());

        let ctx = AcceptContext {
            config: Arc::new(config),
            scanner,
            dispatcher,
            registry,
            local_addr,
        };

        let listener = Arc::new(listener);
        let accept_tasks = (0..ctx.config.async_accept_count)
            .map(|slot| {
                let ctx = ctx.clone();
                let listener = listener.clone();
                tokio::spawn(async move {
                    accept_loop(ctx, slot, listener).await;
                })
            })
            .collect();

        Ok(ConnectionFactory {
            ctx,
            accept_tasks: Mutex::new(accept_tasks),
        })
    }

    /// The actually bound address (relevant with an OS-assigned port).
    pub fn local_addr(&self) -> SocketAddr {
        self.ctx.local_addr
    }

    /// Opens a connection to `remote_addr` without blocking: the returned transport is
    ///  in CONNECTING and accepts (queues) sends immediately; a spawned task completes
    ///  the connect and flushes the queue, or fails all queued sends.
    pub fn connect(&self, remote_addr: SocketAddr) -> Result<ConnectionTransport, TransportError> {
        self.connect_published(remote_addr, None)
    }

    /// Like [ConnectionFactory::connect], but advertising `published_addr` for this
    ///  connection instead of the factory-wide published address.
    pub fn connect_published(
        &self,
        remote_addr: SocketAddr,
        published_addr: Option<HostPort>,
    ) -> Result<ConnectionTransport, TransportError> {
        let family_matches = match self.ctx.config.address_family {
            AddressFamily::Ipv4 => remote_addr.is_ipv4(),
            AddressFamily::Ipv6 => remote_addr.is_ipv6(),
        };
        if !family_matches {
            return Err(TransportError::AddressFamily(format!(
                "remote address {} does not match configured family {:?}",
                remote_addr, self.ctx.config.address_family
            )));
        }

        let connect_socket = prepare_connect_socket(&self.ctx.config)?;

        let transport = ConnectionTransport::new(
            remote_addr,
            false,
            published_addr.or_else(|| self.ctx.config.published_addr.clone()),
            self.ctx.config.clone(),
            self.ctx.scanner.clone(),
            self.ctx.dispatcher.clone(),
            self.ctx.registry.clone(),
        );
        transport.mark_connecting();
        debug!("opening connection to {}", remote_addr);

        let completion_handle = transport.clone();
        tokio::spawn(async move {
            match connect_socket.connect(remote_addr).await {
                Ok(stream) => {
                    if let Err(e) = completion_handle.activate(stream).await {
                        debug!("taking connection to {} into service failed: {}", remote_addr, e);
                    }
                }
                Err(e) => {
                    debug!("connect to {} failed: {}", remote_addr, e);
                    completion_handle.fail_connect(e.to_string()).await;
                }
            }
        });

        Ok(transport)
    }

    /// Stops accepting and unregisters the factory. Established connections are not
    ///  affected. Idempotent.
    pub fn shut_down(&self) {
        let mut tasks = self.accept_tasks.lock().unwrap_or_else(|p| p.into_inner());
        if tasks.is_empty() {
            return;
        }
        info!("shutting down transport factory on {}", self.ctx.local_addr);
        for task in tasks.drain(..) {
            task.abort();
        }
        self.ctx.registry.unregister_factory(self.ctx.local_addr);
    }
}

impl Drop for ConnectionFactory {
    fn drop(&mut self) {
        self.shut_down();
    }
}

async fn accept_loop(ctx: AcceptContext, slot: usize, listener: Arc<TcpListener>) {
    debug!("accept slot {} on {} started", slot, ctx.local_addr);
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                debug!("accepted connection from {}", peer_addr);
                if let Err(e) = apply_options(&SockRef::from(&stream), &ctx.config) {
                    warn!("applying socket options to accepted connection from {} failed: {}", peer_addr, e);
                }

                let transport = ConnectionTransport::new(
                    peer_addr,
                    true,
                    ctx.config.published_addr.clone(),
                    ctx.config.clone(),
                    ctx.scanner.clone(),
                    ctx.dispatcher.clone(),
                    ctx.registry.clone(),
                );
                // from here the read loop owns the connection; the handle can go away
                if let Err(e) = transport.activate(stream).await {
                    warn!("taking accepted connection from {} into service failed: {}", peer_addr, e);
                }
            }
            Err(e) => {
                // transient (e.g. out of file descriptors) - log and keep the slot alive
                warn!("accept on {} failed: {}", ctx.local_addr, e);
                time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

fn bind_listener(config: &TransportConfig) -> Result<std::net::TcpListener, TransportError> {
    let socket = new_socket(config).map_err(TransportError::bind)?;
    if config.reuse_addr {
        socket.set_reuse_address(true).map_err(TransportError::bind)?;
    }
    apply_options(&socket, config).map_err(TransportError::bind)?;

    let bind_addr = config.effective_bind_addr();
    socket.bind(&bind_addr.into()).map_err(TransportError::bind)?;
    socket.listen(LISTEN_BACKLOG).map_err(TransportError::bind)?;
    Ok(socket.into())
}

fn prepare_connect_socket(config: &TransportConfig) -> Result<TcpSocket, TransportError> {
    let socket = new_socket(config).map_err(TransportError::connect)?;
    apply_options(&socket, config).map_err(TransportError::connect)?;
    Ok(TcpSocket::from_std_stream(socket.into()))
}

fn new_socket(config: &TransportConfig) -> io::Result<Socket> {
    let domain = match config.address_family {
        AddressFamily::Ipv4 => Domain::IPV4,
        AddressFamily::Ipv6 => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Applies QoS and the configured low-level options. Used for the listener, connect
///  sockets and accepted streams alike.
fn apply_options(socket: &Socket, config: &TransportConfig) -> io::Result<()> {
    if let Some(qos) = config.qos {
        set_tos(socket, config.address_family, qos.tos_value())?;
    }
    for opt in &config.sockopt_params {
        match opt {
            SocketOption::NoDelay(v) => socket.set_tcp_nodelay(*v)?,
            SocketOption::RecvBufferSize(n) => socket.set_recv_buffer_size(*n)?,
            SocketOption::SendBufferSize(n) => socket.set_send_buffer_size(*n)?,
            SocketOption::Tos(v) => set_tos(socket, config.address_family, *v)?,
        }
    }
    Ok(())
}

fn set_tos(socket: &Socket, family: AddressFamily, tos: u32) -> io::Result<()> {
    match family {
        AddressFamily::Ipv4 => socket.set_tos_v4(tos),
        AddressFamily::Ipv6 => socket.set_tclass_v6(tos),
    }
}
