use std::sync::Arc;
#[cfg(test)] use mockall::automock;

use crate::connection_handle::ConnectionHandle;
use crate::locator::Locator;

/// Callbacks from the control protocol into the transport that owns the connections.
///
/// Implementations must not call back into the message manager for the same connection
///  synchronously: they are invoked from protocol processing (typically on the connection's
///  worker thread), though never while a connection lock is held.
#[cfg_attr(test, automock)]
pub trait ControlListener: Send + Sync + 'static {
    /// whether this node accepts data on the given logical port
    fn is_logical_port_open(&self, logical_port: u16) -> bool;

    /// a connection completed the bind handshake as the server side
    fn on_connection_bound(&self, handle: &Arc<ConnectionHandle>, remote_locator: &Locator);

    /// the peer unbound the connection, or its receive loop terminated
    fn on_connection_closed(&self, handle: &Arc<ConnectionHandle>);
}
