use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use anyhow::bail;
use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use socket2::SockRef;
use tracing::{debug, info, warn};

use crate::config::TcpTransportDescriptor;
use crate::connection_handle::{ConnectionHandle, ConnectionState};
use crate::control_listener::ControlListener;
use crate::locator::Locator;
use crate::message_dispatcher::MessageDispatcher;
use crate::message_framer::MessageFramer;
use crate::physical_header::PhysicalHeader;
use crate::receive_loop::run_receive_loop;
use crate::rtcp_message_manager::RtcpMessageManager;

/// The transport-side bookkeeping that the control protocol calls back into: which logical
///  ports this node accepts data on, and which connections are alive.
#[derive(Default)]
struct ConnectionRegistry {
    input_ports: RwLock<FxHashSet<u16>>,
    connections: Mutex<FxHashMap<u64, Arc<ConnectionHandle>>>,
}

impl ConnectionRegistry {
    fn insert(&self, handle: Arc<ConnectionHandle>) {
        self.connections.lock().insert(handle.id(), handle);
    }

    fn remove(&self, id: u64) -> Option<Arc<ConnectionHandle>> {
        self.connections.lock().remove(&id)
    }

    fn snapshot(&self) -> Vec<Arc<ConnectionHandle>> {
        self.connections.lock().values().cloned().collect()
    }
}

impl ControlListener for ConnectionRegistry {
    fn is_logical_port_open(&self, logical_port: u16) -> bool {
        self.input_ports.read().contains(&logical_port)
    }

    fn on_connection_bound(&self, handle: &Arc<ConnectionHandle>, remote_locator: &Locator) {
        info!("{:?}: accepted connection bound to {}", handle, remote_locator);
    }

    fn on_connection_closed(&self, handle: &Arc<ConnectionHandle>) {
        if self.remove(handle.id()).is_some() {
            debug!("{:?}: removed closed connection", handle);
        }
    }
}

/// TcpEndPoint ties the control protocol to actual TCP connections: it connects and accepts
///  streams, runs a receive loop on a dedicated thread per connection, and offers an API for
///  sending application data on logical ports the peer has confirmed.
///
/// Keep alive is driven either by [TcpEndPoint::start_keep_alive], or from the outside by
///  calling [TcpEndPoint::keep_alive_tick] at the configured keep alive frequency.
pub struct TcpEndPoint {
    config: Arc<TcpTransportDescriptor>,
    registry: Arc<ConnectionRegistry>,
    manager: Arc<RtcpMessageManager>,
    dispatcher: Arc<dyn MessageDispatcher>,
}

impl TcpEndPoint {
    pub fn new(config: TcpTransportDescriptor, local_addr: SocketAddr, dispatcher: Arc<dyn MessageDispatcher>) -> anyhow::Result<TcpEndPoint> {
        config.validate()?;

        let local_locator = match local_addr {
            SocketAddr::V4(addr) => Locator::tcp_v4(addr, 0, config.wan_addr),
            SocketAddr::V6(_) => Locator::from_socket_addr(local_addr, 0),
        };
        info!("initializing TCP end point with local locator {}", local_locator);

        let registry = Arc::new(ConnectionRegistry::default());
        let manager = Arc::new(RtcpMessageManager::new(registry.clone(), local_locator, MessageFramer::new(config.endianness)));

        Ok(TcpEndPoint {
            config: Arc::new(config),
            registry,
            manager,
            dispatcher,
        })
    }

    pub fn config(&self) -> &TcpTransportDescriptor {
        &self.config
    }

    pub fn local_locator(&self) -> Locator {
        self.manager.local_locator()
    }

    /// Starts accepting data on a logical port. Returns `false` if it was already open.
    pub fn open_input_port(&self, logical_port: u16) -> bool {
        debug!("opening input logical port {}", logical_port);
        self.registry.input_ports.write().insert(logical_port)
    }

    pub fn close_input_port(&self, logical_port: u16) -> bool {
        debug!("closing input logical port {}", logical_port);
        self.registry.input_ports.write().remove(&logical_port)
    }

    pub fn is_input_port_open(&self, logical_port: u16) -> bool {
        self.registry.is_logical_port_open(logical_port)
    }

    /// Connects to a remote end point, starting the bind handshake. The logical ports are
    ///  requested once the connection is bound.
    pub fn connect(&self, remote: SocketAddr, logical_ports: &[u16]) -> anyhow::Result<Arc<ConnectionHandle>> {
        debug!("connecting to {:?}", remote);
        let stream = TcpStream::connect_timeout(&remote, self.config.connect_timeout)?;
        self.configure_stream(&stream)?;

        let handle = Arc::new(ConnectionHandle::new(Box::new(stream)));
        for &logical_port in logical_ports {
            self.manager.send_open_logical_port_request(&handle, logical_port)?;
        }
        self.register(&handle)?;

        if let Err(e) = self.manager.send_connection_request(&handle) {
            self.forget(&handle);
            return Err(e);
        }
        Ok(handle)
    }

    /// Takes over a stream accepted by a listening socket. The connection then waits for the
    ///  peer's bind request.
    pub fn accept(&self, stream: TcpStream) -> anyhow::Result<Arc<ConnectionHandle>> {
        let local_addr = stream.local_addr()?;
        if !self.config.is_interface_allowed(&local_addr.ip()) {
            bail!("rejecting connection from {:?}: interface {} is not whitelisted", stream.peer_addr().ok(), local_addr.ip());
        }
        self.configure_stream(&stream)?;

        let handle = Arc::new(ConnectionHandle::new(Box::new(stream)));
        handle.lock().change_state(ConnectionState::WaitingForBind);
        self.register(&handle)?;
        debug!("{:?}: accepted connection", handle);
        Ok(handle)
    }

    fn configure_stream(&self, stream: &TcpStream) -> anyhow::Result<()> {
        stream.set_nodelay(true)?;
        stream.set_read_timeout(self.config.read_timeout)?;

        let socket = SockRef::from(stream);
        if let Some(size) = self.config.send_buffer_size {
            socket.set_send_buffer_size(size)?;
        }
        if let Some(size) = self.config.receive_buffer_size {
            socket.set_recv_buffer_size(size)?;
        }
        Ok(())
    }

    fn register(&self, handle: &Arc<ConnectionHandle>) -> anyhow::Result<()> {
        handle.set_dispatcher(self.dispatcher.clone());
        self.registry.insert(handle.clone());

        if let Err(e) = self.spawn_worker(handle) {
            self.forget(handle);
            return Err(e);
        }
        Ok(())
    }

    fn spawn_worker(&self, handle: &Arc<ConnectionHandle>) -> anyhow::Result<()> {
        let reader = handle.try_clone_reader()?;
        let worker_handle = handle.clone();
        let manager = self.manager.clone();
        let max_frame_len = self.config.max_message_size;

        let worker = thread::Builder::new()
            .name(format!("rtcp-rx-{}", handle.id()))
            .spawn(move || run_receive_loop(worker_handle, manager, reader, max_frame_len))?;
        handle.attach_worker(worker)
    }

    fn forget(&self, handle: &Arc<ConnectionHandle>) {
        handle.destroy();
        self.registry.remove(handle.id());
    }

    /// Sends application data on a logical port the peer confirmed as open.
    pub fn send(&self, handle: &ConnectionHandle, logical_port: u16, payload: &[u8]) -> anyhow::Result<()> {
        if PhysicalHeader::SERIALIZED_LEN + payload.len() > self.config.max_message_size as usize {
            bail!("message of {} bytes exceeds the maximum message size of {}", payload.len(), self.config.max_message_size);
        }

        let mut connection = handle.lock();
        if connection.state() != ConnectionState::Established {
            bail!("{:?} is not established", handle);
        }
        if !connection.is_logical_port_opened(logical_port) {
            bail!("logical port {} is not open on {:?}", logical_port, handle);
        }
        self.manager.framer().send_data_message(&mut connection, logical_port, payload)
    }

    /// Unbinds (best effort) and tears down a connection.
    pub fn close(&self, handle: &Arc<ConnectionHandle>) {
        if handle.is_alive() && handle.state() == ConnectionState::Established {
            if let Err(e) = self.manager.send_unbind_connection_request(handle) {
                debug!("{:?}: error sending unbind request: {}", handle, e);
            }
        }
        debug!("{:?}: closing connection", handle);
        self.forget(handle);
    }

    /// Closes connections whose keep alive was not acknowledged in time, sends keep alive
    ///  requests on all other bound connections, and discards requests that were not answered
    ///  within the transaction timeout.
    pub fn keep_alive_tick(&self) {
        let now = Instant::now();
        for handle in self.registry.snapshot() {
            if !handle.is_alive() {
                self.forget(&handle);
                continue;
            }
            if handle.state() != ConnectionState::Established {
                continue;
            }

            let since_ack = now.saturating_duration_since(handle.last_keep_alive_ack());
            if since_ack > self.config.keep_alive_timeout {
                warn!("{:?}: no keep alive acknowledged for {:?} - closing", handle, since_ack);
                self.close(&handle);
                continue;
            }
            if let Err(e) = self.manager.send_keep_alive_request(&handle) {
                warn!("{:?}: error sending keep alive: {}", handle, e);
            }
        }

        self.manager.expire_unconfirmed(self.config.transaction_timeout);
    }

    /// Runs [TcpEndPoint::keep_alive_tick] every [TcpTransportDescriptor::keep_alive_frequency]
    ///  on a dedicated thread. The thread terminates once the end point is dropped.
    pub fn start_keep_alive(self: &Arc<Self>) -> anyhow::Result<JoinHandle<()>> {
        let frequency = self.config.keep_alive_frequency;
        let end_point: Weak<TcpEndPoint> = Arc::downgrade(self);

        let keep_alive = thread::Builder::new()
            .name("rtcp-keep-alive".to_string())
            .spawn(move || {
                loop {
                    thread::sleep(frequency);
                    match end_point.upgrade() {
                        Some(end_point) => end_point.keep_alive_tick(),
                        None => break,
                    }
                }
                debug!("end point dropped, stopping keep alive");
            })?;
        Ok(keep_alive)
    }

    /// The live connection bound to the given remote locator, regardless of logical port
    pub fn connection_for(&self, locator: &Locator) -> Option<Arc<ConnectionHandle>> {
        let wanted = locator.with_logical_port(0);
        self.registry.snapshot()
            .into_iter()
            .filter(|h| h.is_alive())
            .find(|h| h.remote_locator().map(|l| l.with_logical_port(0)) == Some(wanted))
    }

    pub fn connections(&self) -> Vec<Arc<ConnectionHandle>> {
        self.registry.snapshot()
    }

    /// Unbinds and tears down all connections. This is also done on drop.
    pub fn shutdown(&self) {
        let connections = self.registry.snapshot();
        if !connections.is_empty() {
            info!("shutting down {} connection(s)", connections.len());
        }
        for handle in connections {
            self.close(&handle);
        }
    }
}

impl Drop for TcpEndPoint {
    fn drop(&mut self) {
        self.shutdown();
    }
}
