use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail};
use bytes::BytesMut;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::connection_handle::{ConnectionGuard, ConnectionHandle, ConnectionState};
use crate::control_header::ControlMessageKind;
use crate::control_listener::ControlListener;
use crate::control_messages::{BindConnectionResponse, CheckLogicalPortsRequest, CheckLogicalPortsResponse, ConnectionRequest, KeepAliveRequest, LogicalPortIsClosedRequest, OpenLogicalPortRequest, ResponseCode, MAX_PORTS_PER_CHECK, PROTOCOL_VERSION};
use crate::locator::Locator;
use crate::message_framer::{ControlFrame, MessageFramer};
use crate::transaction::{PendingRequest, TransactionId, UnconfirmedTransactions};

struct ManagerState {
    next_transaction_id: TransactionId,
    unconfirmed: UnconfirmedTransactions,
}

impl ManagerState {
    fn allocate_transaction_id(&mut self) -> TransactionId {
        let result = self.next_transaction_id;
        self.next_transaction_id = result.next();
        result
    }
}

/// Drives the RTCP control exchange for all connections of a transport: it builds and sends
///  requests, answers and applies inbound messages, moves connections through their state
///  machine and keeps track of requests awaiting a response.
///
/// Locking: a connection's lock is always acquired before the manager's internal lock, never
///  the other way around. [ControlListener] callbacks are made with neither lock held.
pub struct RtcpMessageManager {
    listener: Arc<dyn ControlListener>,
    local_locator: Locator,
    framer: MessageFramer,
    state: Mutex<ManagerState>,
}

impl RtcpMessageManager {
    pub fn new(listener: Arc<dyn ControlListener>, local_locator: Locator, framer: MessageFramer) -> RtcpMessageManager {
        RtcpMessageManager {
            listener,
            local_locator,
            framer,
            state: Mutex::new(ManagerState {
                next_transaction_id: TransactionId::default(),
                unconfirmed: UnconfirmedTransactions::default(),
            }),
        }
    }

    pub fn local_locator(&self) -> Locator {
        self.local_locator
    }

    pub fn framer(&self) -> &MessageFramer {
        &self.framer
    }

    pub fn get_transaction_id(&self) -> TransactionId {
        self.state.lock().allocate_transaction_id()
    }

    pub fn is_logical_port_open(&self, logical_port: u16) -> bool {
        self.listener.is_logical_port_open(logical_port)
    }

    pub fn on_connection_closed(&self, handle: &Arc<ConnectionHandle>) {
        let num_dropped = self.state.lock().unconfirmed.remove_connection(handle.id());
        if num_dropped > 0 {
            debug!("{:?}: dropped {} unconfirmed requests of closed connection", handle, num_dropped);
        }
        self.listener.on_connection_closed(handle);
    }

    /// Removes and returns requests that were sent more than `older_than` ago without being
    ///  answered. Nothing expires unless this is called.
    pub fn expire_unconfirmed(&self, older_than: Duration) -> Vec<(TransactionId, PendingRequest)> {
        let expired = self.state.lock().unconfirmed.expire(Instant::now(), older_than);
        for (transaction_id, request) in &expired {
            debug!(?transaction_id, "request expired without response: {:?}", request);
        }
        expired
    }

    pub fn unconfirmed_len(&self) -> usize {
        self.state.lock().unconfirmed.len()
    }

    /// Sends a tracked request on a connection that is already locked by the caller. The
    ///  transaction is registered before the write so that a response racing the write's return
    ///  is recognized, and withdrawn if the write fails.
    fn send_request(&self, connection: &mut ConnectionGuard, kind: ControlMessageKind, request: PendingRequest, payload: &[u8]) -> anyhow::Result<TransactionId> {
        let transaction_id = {
            let mut state = self.state.lock();
            let transaction_id = state.allocate_transaction_id();
            state.unconfirmed.insert(transaction_id, connection.handle_id(), request, Instant::now());
            transaction_id
        };

        if let Err(e) = self.framer.send_data(connection, kind, transaction_id, payload, None) {
            self.state.lock().unconfirmed.remove(transaction_id);
            return Err(e);
        }
        Ok(transaction_id)
    }

    fn send_response(&self, connection: &mut ConnectionGuard, kind: ControlMessageKind, transaction_id: TransactionId, response_code: ResponseCode, payload: &[u8]) -> anyhow::Result<()> {
        debug!(?transaction_id, "responding {:?} with {:?}", kind, response_code);
        self.framer.send_data(connection, kind, transaction_id, payload, Some(response_code))
    }

    fn ensure_established(connection: &ConnectionGuard, what: &str) -> anyhow::Result<()> {
        if connection.state() != ConnectionState::Established {
            bail!("cannot send {} on a connection in state {:?}", what, connection.state());
        }
        Ok(())
    }

    /// Client side: starts the bind handshake on a freshly connected handle.
    pub fn send_connection_request(&self, handle: &ConnectionHandle) -> anyhow::Result<()> {
        let mut connection = handle.lock();
        if connection.state() != ConnectionState::Disconnected {
            bail!("{:?}: bind request requires state Disconnected, but state is {:?}", handle, connection.state());
        }

        let mut payload = BytesMut::new();
        ConnectionRequest::new(self.local_locator).ser(&mut payload, self.framer.endianness());
        let transaction_id = self.send_request(&mut connection, ControlMessageKind::BindConnectionRequest, PendingRequest::BindConnection, &payload)?;

        connection.change_state(ConnectionState::WaitingForBindResponse);
        debug!(?transaction_id, "{:?}: sent bind request", handle);
        Ok(())
    }

    /// Registers a logical port this side wants to send on. If the connection is not bound yet,
    ///  the request goes out as soon as the bind completes.
    pub fn send_open_logical_port_request(&self, handle: &ConnectionHandle, logical_port: u16) -> anyhow::Result<()> {
        let mut connection = handle.lock();
        if !connection.add_pending_logical_port(logical_port) {
            debug!("{:?}: logical port {} is already open", handle, logical_port);
            return Ok(());
        }
        if connection.state() != ConnectionState::Established {
            debug!("{:?}: deferring open request for logical port {} until the connection is bound", handle, logical_port);
            return Ok(());
        }
        self.send_open_logical_port_locked(&mut connection, logical_port)
    }

    fn send_open_logical_port_locked(&self, connection: &mut ConnectionGuard, logical_port: u16) -> anyhow::Result<()> {
        let mut payload = BytesMut::new();
        OpenLogicalPortRequest { logical_port }.ser(&mut payload, self.framer.endianness());
        let transaction_id = self.send_request(connection, ControlMessageKind::OpenLogicalPortRequest, PendingRequest::OpenLogicalPort { logical_port }, &payload)?;
        trace!(?transaction_id, "requested opening logical port {}", logical_port);
        Ok(())
    }

    pub fn send_check_logical_ports_request(&self, handle: &ConnectionHandle, logical_ports: &[u16]) -> anyhow::Result<()> {
        let mut connection = handle.lock();
        Self::ensure_established(&connection, "check logical ports request")?;
        self.send_check_logical_ports_locked(&mut connection, logical_ports)
    }

    fn send_check_logical_ports_locked(&self, connection: &mut ConnectionGuard, logical_ports: &[u16]) -> anyhow::Result<()> {
        if logical_ports.len() > MAX_PORTS_PER_CHECK {
            bail!("cannot check {} logical ports in a single request, the maximum is {}", logical_ports.len(), MAX_PORTS_PER_CHECK);
        }

        let mut payload = BytesMut::new();
        CheckLogicalPortsRequest { logical_ports: logical_ports.to_vec() }.ser(&mut payload, self.framer.endianness());
        let transaction_id = self.send_request(connection, ControlMessageKind::CheckLogicalPortsRequest, PendingRequest::CheckLogicalPorts { logical_ports: logical_ports.to_vec() }, &payload)?;
        trace!(?transaction_id, "checking logical ports {:?}", logical_ports);
        Ok(())
    }

    pub fn send_keep_alive_request(&self, handle: &ConnectionHandle) -> anyhow::Result<()> {
        let mut connection = handle.lock();
        Self::ensure_established(&connection, "keep alive request")?;

        let mut payload = BytesMut::new();
        KeepAliveRequest { locator: self.local_locator }.ser(&mut payload, self.framer.endianness());
        let transaction_id = self.send_request(&mut connection, ControlMessageKind::KeepAliveRequest, PendingRequest::KeepAlive, &payload)?;
        trace!(?transaction_id, "{:?}: sent keep alive", handle);
        Ok(())
    }

    /// Tells the peer that data it sent on `logical_port` was not accepted here.
    pub fn send_logical_port_is_closed_request(&self, handle: &ConnectionHandle, logical_port: u16) -> anyhow::Result<()> {
        let mut connection = handle.lock();
        Self::ensure_established(&connection, "logical port closed notification")?;

        let mut payload = BytesMut::new();
        LogicalPortIsClosedRequest { logical_port }.ser(&mut payload, self.framer.endianness());
        self.send_request(&mut connection, ControlMessageKind::LogicalPortIsClosedRequest, PendingRequest::LogicalPortIsClosed { logical_port }, &payload)?;
        debug!("{:?}: notified peer that logical port {} is closed", handle, logical_port);
        Ok(())
    }

    /// Unbind has no response, so it is not tracked as unconfirmed.
    pub fn send_unbind_connection_request(&self, handle: &ConnectionHandle) -> anyhow::Result<()> {
        let mut connection = handle.lock();
        let transaction_id = self.get_transaction_id();
        self.framer.send_data(&mut connection, ControlMessageKind::UnbindConnectionRequest, transaction_id, &[], None)?;
        debug!(?transaction_id, "{:?}: sent unbind request", handle);
        Ok(())
    }

    /// Entry point for a complete control frame received on `handle`. Frames that fail the CRC
    ///  check or cannot be parsed are logged and dropped without reaching any handler.
    ///
    /// Returns `true` if the message was acted upon: a request was answered, or a response
    ///  matched an outstanding transaction.
    pub fn process_rtcp_message(&self, handle: &Arc<ConnectionHandle>, buffer: &[u8]) -> bool {
        match self.try_process_rtcp_message(handle, buffer) {
            Ok(handled) => handled,
            Err(e) => {
                warn!("{:?}: dropping control message: {}", handle, e);
                false
            }
        }
    }

    fn try_process_rtcp_message(&self, handle: &Arc<ConnectionHandle>, buffer: &[u8]) -> anyhow::Result<bool> {
        let frame = MessageFramer::decode_control_frame(buffer)?;
        let order = frame.header.endianness();
        let transaction_id = frame.header.transaction_id;
        let mut payload = frame.payload;
        trace!(?transaction_id, "{:?}: received {:?}", handle, frame.header.kind);

        let handled = match frame.header.kind {
            ControlMessageKind::BindConnectionRequest => {
                let request = ConnectionRequest::deser(&mut payload, order)?;
                self.process_connection_request(handle, transaction_id, &request)?;
                true
            }
            ControlMessageKind::OpenLogicalPortRequest => {
                let request = OpenLogicalPortRequest::deser(&mut payload, order)?;
                self.process_open_logical_port_request(handle, transaction_id, request.logical_port)?;
                true
            }
            ControlMessageKind::CheckLogicalPortsRequest => {
                let request = CheckLogicalPortsRequest::deser(&mut payload, order)?;
                self.process_check_logical_ports_request(handle, transaction_id, &request.logical_ports)?;
                true
            }
            ControlMessageKind::KeepAliveRequest => {
                let request = KeepAliveRequest::deser(&mut payload, order)?;
                self.process_keep_alive_request(handle, transaction_id, &request.locator)?;
                true
            }
            ControlMessageKind::LogicalPortIsClosedRequest => {
                let request = LogicalPortIsClosedRequest::deser(&mut payload, order)?;
                self.process_logical_port_is_closed_request(handle, request.logical_port)
            }
            ControlMessageKind::UnbindConnectionRequest => {
                self.process_unbind_connection_request(handle);
                true
            }
            ControlMessageKind::BindConnectionResponse => {
                let code = Self::response_code(&frame)?;
                let response = if code == ResponseCode::Ok {
                    Some(BindConnectionResponse::deser(&mut payload, order)?)
                }
                else {
                    None
                };
                self.process_bind_connection_response(handle, transaction_id, code, response.as_ref())
            }
            ControlMessageKind::OpenLogicalPortResponse => {
                let code = Self::response_code(&frame)?;
                self.process_open_logical_port_response(handle, transaction_id, code)
            }
            ControlMessageKind::CheckLogicalPortsResponse => {
                let code = Self::response_code(&frame)?;
                let response = CheckLogicalPortsResponse::deser(&mut payload, order)?;
                self.process_check_logical_ports_response(handle, transaction_id, code, &response.logical_ports)
            }
            ControlMessageKind::KeepAliveResponse => {
                let code = Self::response_code(&frame)?;
                self.process_keep_alive_response(handle, transaction_id, code)
            }
        };
        Ok(handled)
    }

    fn response_code(frame: &ControlFrame) -> anyhow::Result<ResponseCode> {
        frame.response_code
            .ok_or_else(|| anyhow!("{:?} without status code", frame.header.kind))
    }

    /// Server side of the bind handshake. The response echoes the request's transaction id.
    pub fn process_connection_request(&self, handle: &Arc<ConnectionHandle>, transaction_id: TransactionId, request: &ConnectionRequest) -> anyhow::Result<()> {
        let mut payload = BytesMut::new();
        BindConnectionResponse { locator: self.local_locator }.ser(&mut payload, self.framer.endianness());

        let bound_locator = {
            let mut connection = handle.lock();
            if request.protocol_version != PROTOCOL_VERSION {
                warn!("{:?}: bind request with incompatible protocol version {:?}", handle, request.protocol_version);
                self.send_response(&mut connection, ControlMessageKind::BindConnectionResponse, transaction_id, ResponseCode::IncompatibleVersion, &payload)?;
                return Ok(());
            }

            match connection.state() {
                ConnectionState::WaitingForBind => {
                    self.send_response(&mut connection, ControlMessageKind::BindConnectionResponse, transaction_id, ResponseCode::Ok, &payload)?;
                    connection.change_state(ConnectionState::Established);
                    connection.set_remote_locator(request.transport_locator);
                    Some(request.transport_locator)
                }
                ConnectionState::Established => {
                    debug!("{:?}: duplicate bind request", handle);
                    self.send_response(&mut connection, ControlMessageKind::BindConnectionResponse, transaction_id, ResponseCode::ExistingConnection, &payload)?;
                    None
                }
                state => {
                    warn!("{:?}: bind request in state {:?}", handle, state);
                    self.send_response(&mut connection, ControlMessageKind::BindConnectionResponse, transaction_id, ResponseCode::ServerError, &payload)?;
                    None
                }
            }
        };

        if let Some(remote_locator) = bound_locator {
            debug!("{:?}: bound to {}", handle, remote_locator);
            self.listener.on_connection_bound(handle, &remote_locator);
        }
        Ok(())
    }

    pub fn process_open_logical_port_request(&self, handle: &Arc<ConnectionHandle>, transaction_id: TransactionId, logical_port: u16) -> anyhow::Result<()> {
        let is_open = self.listener.is_logical_port_open(logical_port);

        let mut connection = handle.lock();
        let code = if connection.state() != ConnectionState::Established {
            ResponseCode::ServerError
        }
        else if is_open {
            ResponseCode::Ok
        }
        else {
            ResponseCode::InvalidPort
        };
        self.send_response(&mut connection, ControlMessageKind::OpenLogicalPortResponse, transaction_id, code, &[])
    }

    pub fn process_check_logical_ports_request(&self, handle: &Arc<ConnectionHandle>, transaction_id: TransactionId, logical_ports: &[u16]) -> anyhow::Result<()> {
        let open_ports = logical_ports.iter()
            .copied()
            .filter(|&p| self.listener.is_logical_port_open(p))
            .collect::<Vec<_>>();

        let mut connection = handle.lock();
        let (code, response) = if connection.state() != ConnectionState::Established {
            (ResponseCode::ServerError, CheckLogicalPortsResponse { logical_ports: Vec::new() })
        }
        else {
            (ResponseCode::Ok, CheckLogicalPortsResponse { logical_ports: open_ports })
        };

        let mut payload = BytesMut::new();
        response.ser(&mut payload, self.framer.endianness());
        self.send_response(&mut connection, ControlMessageKind::CheckLogicalPortsResponse, transaction_id, code, &payload)
    }

    pub fn process_keep_alive_request(&self, handle: &Arc<ConnectionHandle>, transaction_id: TransactionId, locator: &Locator) -> anyhow::Result<()> {
        let mut connection = handle.lock();
        let code = if connection.state() != ConnectionState::Established {
            ResponseCode::ServerError
        }
        else if connection.remote_locator().as_ref() != Some(locator) {
            warn!("{:?}: keep alive from unknown locator {}", handle, locator);
            ResponseCode::UnknownLocator
        }
        else {
            ResponseCode::Ok
        };
        self.send_response(&mut connection, ControlMessageKind::KeepAliveResponse, transaction_id, code, &[])
    }

    /// The peer does not accept data on `logical_port`: the port goes back to pending on this
    ///  connection. Returns `false` if it was not open in the first place.
    pub fn process_logical_port_is_closed_request(&self, handle: &Arc<ConnectionHandle>, logical_port: u16) -> bool {
        let was_open = handle.lock().mark_logical_port_closed(logical_port);
        if was_open {
            debug!("{:?}: peer closed logical port {}", handle, logical_port);
        }
        else {
            debug!("{:?}: peer closed logical port {} which was not open", handle, logical_port);
        }
        was_open
    }

    pub fn process_unbind_connection_request(&self, handle: &Arc<ConnectionHandle>) {
        debug!("{:?}: peer unbound the connection", handle);
        handle.disable();
        self.listener.on_connection_closed(handle);
    }

    /// Removes the outstanding transaction if it exists, was sent on `handle` and belongs to a
    ///  request `matches` accepts. A response on another connection or for a different request
    ///  kind leaves the entry in place.
    fn confirm(&self, handle: &ConnectionHandle, transaction_id: TransactionId, matches: impl FnOnce(&PendingRequest) -> bool) -> Option<PendingRequest> {
        let confirmed = self.state.lock().unconfirmed.remove_if(transaction_id, handle.id(), matches);
        if confirmed.is_none() {
            debug!(?transaction_id, "discarding response for unknown or unrelated transaction");
        }
        confirmed
    }

    pub fn process_bind_connection_response(&self, handle: &Arc<ConnectionHandle>, transaction_id: TransactionId, code: ResponseCode, response: Option<&BindConnectionResponse>) -> bool {
        let mut connection = handle.lock();
        if self.confirm(handle, transaction_id, |r| matches!(r, PendingRequest::BindConnection)).is_none() {
            return false;
        }

        match (code, response) {
            (ResponseCode::Ok, Some(response)) => {
                if connection.state() != ConnectionState::WaitingForBindResponse {
                    warn!("{:?}: bind response in state {:?} - ignoring", handle, connection.state());
                    return true;
                }
                connection.change_state(ConnectionState::Established);
                connection.set_remote_locator(response.locator);
                debug!("{:?}: bound to {}", handle, response.locator);

                for logical_port in connection.pending_logical_ports() {
                    if let Err(e) = self.send_open_logical_port_locked(&mut connection, logical_port) {
                        warn!("{:?}: error requesting logical port {}: {}", handle, logical_port, e);
                    }
                }
            }
            (code, _) => {
                warn!("{:?}: bind request was answered with {:?}", handle, code);
            }
        }
        true
    }

    pub fn process_open_logical_port_response(&self, handle: &Arc<ConnectionHandle>, transaction_id: TransactionId, code: ResponseCode) -> bool {
        let mut connection = handle.lock();
        let logical_port = match self.confirm(handle, transaction_id, |r| matches!(r, PendingRequest::OpenLogicalPort { .. })) {
            Some(PendingRequest::OpenLogicalPort { logical_port }) => logical_port,
            _ => return false,
        };

        match code {
            ResponseCode::Ok => {
                debug!("{:?}: logical port {} is open", handle, logical_port);
                connection.mark_logical_port_opened(logical_port);
            }
            ResponseCode::InvalidPort => {
                debug!("{:?}: peer does not accept logical port {} (yet)", handle, logical_port);
                let to_check = {
                    let state = self.state.lock();
                    connection.pending_logical_ports().into_iter()
                        .filter(|&p| !state.unconfirmed.has_open_request(handle.id(), p))
                        .collect::<Vec<_>>()
                };
                if to_check.is_empty() {
                    return true;
                }
                if let Err(e) = self.send_check_logical_ports_locked(&mut connection, &to_check) {
                    warn!("{:?}: error checking logical ports: {}", handle, e);
                }
            }
            code => {
                warn!("{:?}: open request for logical port {} was answered with {:?}", handle, logical_port, code);
            }
        }
        true
    }

    pub fn process_check_logical_ports_response(&self, handle: &Arc<ConnectionHandle>, transaction_id: TransactionId, code: ResponseCode, open_ports: &[u16]) -> bool {
        let mut connection = handle.lock();
        let requested = match self.confirm(handle, transaction_id, |r| matches!(r, PendingRequest::CheckLogicalPorts { .. })) {
            Some(PendingRequest::CheckLogicalPorts { logical_ports }) => logical_ports,
            _ => return false,
        };

        if code != ResponseCode::Ok {
            warn!("{:?}: check request for logical ports was answered with {:?}", handle, code);
            return true;
        }

        for &logical_port in open_ports {
            if !requested.contains(&logical_port) {
                debug!("{:?}: peer reported logical port {} that was not asked for", handle, logical_port);
                continue;
            }
            if connection.is_logical_port_pending(logical_port) {
                if let Err(e) = self.send_open_logical_port_locked(&mut connection, logical_port) {
                    warn!("{:?}: error requesting logical port {}: {}", handle, logical_port, e);
                }
            }
        }
        true
    }

    pub fn process_keep_alive_response(&self, handle: &Arc<ConnectionHandle>, transaction_id: TransactionId, code: ResponseCode) -> bool {
        let mut connection = handle.lock();
        if self.confirm(handle, transaction_id, |r| matches!(r, PendingRequest::KeepAlive)).is_none() {
            return false;
        }

        match code {
            ResponseCode::Ok => connection.record_keep_alive_ack(Instant::now()),
            code => warn!("{:?}: keep alive was answered with {:?}", handle, code),
        }
        true
    }
}
