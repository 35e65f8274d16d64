use std::collections::BTreeSet;
use std::fmt::{Debug, Formatter};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use anyhow::{anyhow, bail};
#[cfg(test)] use mockall::automock;
use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{debug, error, trace, warn};

use crate::locator::Locator;
use crate::message_dispatcher::MessageDispatcher;

/// A connected byte stream as produced by the connection factory. This abstraction exists so
///  the protocol can be tested without sockets; production code uses [TcpStream].
#[cfg_attr(test, automock)]
pub trait StreamConnection: Send + 'static {
    /// A single write call, returning the number of bytes actually written. Callers treat a
    ///  short write as a failure rather than retrying.
    fn write_some(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// An independent reading end of the same stream, for the connection's worker thread
    fn try_clone_reader(&self) -> io::Result<Box<dyn Read + Send>>;

    fn peer_addr(&self) -> Option<SocketAddr>;
}

impl StreamConnection for TcpStream {
    fn write_some(&mut self, buf: &[u8]) -> io::Result<usize> {
        Write::write(self, buf)
    }

    fn try_clone_reader(&self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(self.try_clone()?))
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        TcpStream::peer_addr(self).ok()
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    /// server side: accepted, waiting for the client's bind request
    WaitingForBind,
    /// client side: bind request sent
    WaitingForBindResponse,
    Established,
}

impl ConnectionState {
    fn rank(&self) -> u8 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::WaitingForBind | ConnectionState::WaitingForBindResponse => 1,
            ConnectionState::Established => 2,
        }
    }
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

struct HandleInner {
    connection: Option<Box<dyn StreamConnection>>,
    state: ConnectionState,
    remote_locator: Option<Locator>,
    /// logical ports this side wants to send on, but the peer has not confirmed yet
    pending_logical_ports: BTreeSet<u16>,
    opened_logical_ports: BTreeSet<u16>,
    last_keep_alive_ack: Instant,
}

/// Owns one byte-stream connection and everything that lives exactly as long as it: the
///  liveness flag, the worker thread running its receive loop, the connection state and the
///  logical port bookkeeping.
///
/// The dispatch target is shared, not owned - the handle only holds an `Arc` to it and drops
///  that on [ConnectionHandle::destroy].
///
/// All state inspection, state transitions and writes go through a [ConnectionGuard] obtained
///  from [ConnectionHandle::lock]. The lock is not reentrant: code holding a guard must use the
///  guard for everything, and must never call [ConnectionHandle::destroy] or any other locking
///  method on the same handle.
pub struct ConnectionHandle {
    id: u64,
    peer_addr: Option<SocketAddr>,
    alive: AtomicBool,
    only_multicast_purpose: AtomicBool,
    inner: Mutex<HandleInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
    dispatcher: RwLock<Option<Arc<dyn MessageDispatcher>>>,
}

impl Debug for ConnectionHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.peer_addr {
            Some(addr) => write!(f, "Connection#{}[{}]", self.id, addr),
            None => write!(f, "Connection#{}", self.id),
        }
    }
}

impl ConnectionHandle {
    pub fn new(connection: Box<dyn StreamConnection>) -> ConnectionHandle {
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let peer_addr = connection.peer_addr();
        trace!(id, ?peer_addr, "new connection handle");

        ConnectionHandle {
            id,
            peer_addr,
            alive: AtomicBool::new(true),
            only_multicast_purpose: AtomicBool::new(false),
            inner: Mutex::new(HandleInner {
                connection: Some(connection),
                state: ConnectionState::Disconnected,
                remote_locator: None,
                pending_logical_ports: BTreeSet::new(),
                opened_logical_ports: BTreeSet::new(),
                last_keep_alive_ack: Instant::now(),
            }),
            worker: Mutex::new(None),
            dispatcher: RwLock::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Hands the receive loop's thread to this handle, which joins it on [ConnectionHandle::destroy].
    pub fn attach_worker(&self, worker: JoinHandle<()>) -> anyhow::Result<()> {
        let mut slot = self.worker.lock();
        if slot.is_some() {
            bail!("{:?} already has a worker thread attached", self);
        }
        *slot = Some(worker);
        Ok(())
    }

    pub fn has_worker(&self) -> bool {
        self.worker.lock().is_some()
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Marks the connection as no longer alive. This is a cooperative signal: the worker sees it
    ///  on its next loop iteration, a read that is currently blocked is not interrupted.
    pub fn disable(&self) {
        if self.alive.swap(false, Ordering::AcqRel) {
            debug!(id = self.id, "disabling connection");
        }
    }

    /// Disables the connection, waits for the worker thread (if any) to terminate, and releases
    ///  the connection and the dispatch target. Afterwards the connection is never touched again.
    ///
    /// If this is called on the worker thread itself (e.g. because the worker dropped the last
    ///  reference to the handle), the join is skipped since the worker is already on its way out.
    pub fn destroy(&self) {
        self.disable();

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if worker.thread().id() == thread::current().id() {
                debug!(id = self.id, "destroying connection from its own worker thread - not joining");
            }
            else {
                trace!(id = self.id, "waiting for worker thread to terminate");
                if worker.join().is_err() {
                    error!(id = self.id, "connection worker thread panicked");
                }
            }
        }

        if self.inner.lock().connection.take().is_some() {
            debug!(id = self.id, "released connection");
        }
        self.dispatcher.write().take();
    }

    pub fn set_dispatcher(&self, dispatcher: Arc<dyn MessageDispatcher>) {
        *self.dispatcher.write() = Some(dispatcher);
    }

    pub fn dispatcher(&self) -> Option<Arc<dyn MessageDispatcher>> {
        self.dispatcher.read().clone()
    }

    pub fn set_only_multicast_purpose(&self, value: bool) {
        self.only_multicast_purpose.store(value, Ordering::Release);
    }

    pub fn only_multicast_purpose(&self) -> bool {
        self.only_multicast_purpose.load(Ordering::Acquire)
    }

    pub fn try_clone_reader(&self) -> anyhow::Result<Box<dyn Read + Send>> {
        match &self.inner.lock().connection {
            Some(connection) => Ok(connection.try_clone_reader()?),
            None => Err(anyhow!("{:?} was destroyed", self)),
        }
    }

    /// Acquires the lock that makes "inspect state, send, transition state" sequences atomic
    ///  with regard to other threads using the same connection.
    pub fn lock(&self) -> ConnectionGuard<'_> {
        ConnectionGuard {
            handle_id: self.id,
            alive: &self.alive,
            inner: self.inner.lock(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state()
    }

    pub fn remote_locator(&self) -> Option<Locator> {
        self.lock().remote_locator()
    }

    pub fn is_logical_port_opened(&self, logical_port: u16) -> bool {
        self.lock().is_logical_port_opened(logical_port)
    }

    pub fn opened_logical_ports(&self) -> Vec<u16> {
        self.lock().inner.opened_logical_ports.iter().copied().collect()
    }

    pub fn pending_logical_ports(&self) -> Vec<u16> {
        self.lock().pending_logical_ports()
    }

    pub fn last_keep_alive_ack(&self) -> Instant {
        self.lock().inner.last_keep_alive_ack
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Exclusive access to a connection's mutable state and its write side, see
///  [ConnectionHandle::lock].
pub struct ConnectionGuard<'a> {
    handle_id: u64,
    alive: &'a AtomicBool,
    inner: MutexGuard<'a, HandleInner>,
}

impl ConnectionGuard<'_> {
    pub fn handle_id(&self) -> u64 {
        self.handle_id
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state
    }

    /// Moves the connection state forward. Transitions never go backwards (or sideways between
    ///  the client and server waiting states) - such requests are refused and logged.
    pub fn change_state(&mut self, new_state: ConnectionState) -> bool {
        let old_state = self.inner.state;
        if old_state == new_state {
            return true;
        }
        if new_state.rank() <= old_state.rank() {
            warn!(id = self.handle_id, "refusing connection state transition {:?} -> {:?}", old_state, new_state);
            return false;
        }

        debug!(id = self.handle_id, "connection state {:?} -> {:?}", old_state, new_state);
        self.inner.state = new_state;
        true
    }

    /// Writes the buffer to the connection with a single write call. Writing fewer bytes than
    ///  requested is a failure; so is writing to a disabled or destroyed connection.
    pub fn write(&mut self, buf: &[u8]) -> anyhow::Result<()> {
        if !self.alive.load(Ordering::Acquire) {
            bail!("connection #{} is disabled", self.handle_id);
        }
        let connection = match self.inner.connection.as_mut() {
            Some(connection) => connection,
            None => bail!("connection #{} was destroyed", self.handle_id),
        };

        let num_written = connection.write_some(buf)?;
        if num_written < buf.len() {
            bail!("connection #{}: partial write of {} out of {} bytes", self.handle_id, num_written, buf.len());
        }
        trace!(id = self.handle_id, len = buf.len(), "wrote frame");
        Ok(())
    }

    pub fn remote_locator(&self) -> Option<Locator> {
        self.inner.remote_locator
    }

    pub fn set_remote_locator(&mut self, locator: Locator) {
        self.inner.remote_locator = Some(locator);
    }

    /// Registers a logical port this side wants to use. Returns `false` if it is already opened.
    pub fn add_pending_logical_port(&mut self, logical_port: u16) -> bool {
        if self.inner.opened_logical_ports.contains(&logical_port) {
            return false;
        }
        self.inner.pending_logical_ports.insert(logical_port);
        true
    }

    pub fn is_logical_port_pending(&self, logical_port: u16) -> bool {
        self.inner.pending_logical_ports.contains(&logical_port)
    }

    pub fn pending_logical_ports(&self) -> Vec<u16> {
        self.inner.pending_logical_ports.iter().copied().collect()
    }

    pub fn mark_logical_port_opened(&mut self, logical_port: u16) {
        self.inner.pending_logical_ports.remove(&logical_port);
        self.inner.opened_logical_ports.insert(logical_port);
    }

    /// The peer closed a logical port: it goes back to pending so it can be re-negotiated.
    ///  Returns `false` if the port was not opened on this connection.
    pub fn mark_logical_port_closed(&mut self, logical_port: u16) -> bool {
        if self.inner.opened_logical_ports.remove(&logical_port) {
            self.inner.pending_logical_ports.insert(logical_port);
            true
        }
        else {
            false
        }
    }

    pub fn is_logical_port_opened(&self, logical_port: u16) -> bool {
        self.inner.opened_logical_ports.contains(&logical_port)
    }

    pub fn record_keep_alive_ack(&mut self, at: Instant) {
        self.inner.last_keep_alive_ack = at;
    }
}
