use std::io::{ErrorKind, Read};
use std::sync::Arc;

use anyhow::bail;
use bytes::BytesMut;
use tracing::{debug, trace, warn};

use crate::connection_handle::{ConnectionHandle, ConnectionState};
use crate::message_framer::MessageFramer;
use crate::physical_header::PhysicalHeader;
use crate::rtcp_message_manager::RtcpMessageManager;

const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Reassembles frames from a byte stream that delivers them in arbitrary chunks.
pub struct FrameReader {
    buf: BytesMut,
    max_frame_len: u32,
}

impl FrameReader {
    pub fn new(max_frame_len: u32) -> FrameReader {
        FrameReader {
            buf: BytesMut::new(),
            max_frame_len,
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Splits off the next complete frame if it is fully buffered. An error means that framing
    ///  is lost, and the stream can not be used any longer.
    pub fn next_frame(&mut self) -> anyhow::Result<Option<BytesMut>> {
        let frame_len = match PhysicalHeader::peek_length(&self.buf)? {
            Some(len) => len,
            None => return Ok(None),
        };
        if (frame_len as usize) < PhysicalHeader::SERIALIZED_LEN {
            bail!("frame length {} is shorter than the physical header", frame_len);
        }
        if frame_len > self.max_frame_len {
            bail!("frame length {} exceeds the configured maximum of {}", frame_len, self.max_frame_len);
        }

        if self.buf.len() < frame_len as usize {
            return Ok(None);
        }
        Ok(Some(self.buf.split_to(frame_len as usize)))
    }
}

/// The body of a connection's worker thread: reads frames until the connection is disabled or
///  the stream fails, and notifies the owning transport when it terminates.
///
/// `reader` should have a read timeout so the loop notices a disabled connection without
///  waiting for the peer to send something.
pub fn run_receive_loop(handle: Arc<ConnectionHandle>, manager: Arc<RtcpMessageManager>, mut reader: Box<dyn Read + Send>, max_frame_len: u32) {
    debug!("{:?}: starting receive loop", handle);

    let mut frames = FrameReader::new(max_frame_len);
    let mut read_buf = vec![0u8; READ_CHUNK_SIZE];

    while handle.is_alive() {
        match reader.read(&mut read_buf) {
            Ok(0) => {
                debug!("{:?}: connection closed by peer", handle);
                handle.disable();
            }
            Ok(n) => {
                trace!("{:?}: received {} bytes", handle, n);
                frames.extend(&read_buf[..n]);
                loop {
                    match frames.next_frame() {
                        Ok(Some(frame)) => on_frame(&handle, &manager, &frame),
                        Ok(None) => break,
                        Err(e) => {
                            warn!("{:?}: lost framing, closing connection: {}", handle, e);
                            handle.disable();
                            break;
                        }
                    }
                }
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted) => {}
            Err(e) => {
                debug!("{:?}: error reading from connection: {}", handle, e);
                handle.disable();
            }
        }
    }

    debug!("{:?}: receive loop terminated", handle);
    manager.on_connection_closed(&handle);
}

fn on_frame(handle: &Arc<ConnectionHandle>, manager: &RtcpMessageManager, frame: &[u8]) {
    if PhysicalHeader::peek_logical_port(frame) == Some(PhysicalHeader::CONTROL_LOGICAL_PORT) {
        manager.process_rtcp_message(handle, frame);
    }
    else {
        on_data_frame(handle, manager, frame);
    }
}

fn on_data_frame(handle: &Arc<ConnectionHandle>, manager: &RtcpMessageManager, frame: &[u8]) {
    let state = handle.state();
    if state != ConnectionState::Established {
        warn!("{:?}: dropping data frame on a connection in state {:?}", handle, state);
        return;
    }

    let (logical_port, payload) = match MessageFramer::decode_data_frame(frame) {
        Ok(decoded) => decoded,
        Err(e) => {
            warn!("{:?}: dropping data frame: {}", handle, e);
            return;
        }
    };

    if !manager.is_logical_port_open(logical_port) {
        debug!("{:?}: received data for logical port {} which is not open", handle, logical_port);
        if let Err(e) = manager.send_logical_port_is_closed_request(handle, logical_port) {
            debug!("{:?}: error sending logical port closed notification: {}", handle, e);
        }
        return;
    }

    match handle.dispatcher() {
        Some(dispatcher) => dispatcher.on_message(logical_port, payload),
        None => debug!("{:?}: no dispatcher for message on logical port {} - dropping", handle, logical_port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_header::ControlMessageKind;
    use crate::control_listener::MockControlListener;
    use crate::control_messages::{LogicalPortIsClosedRequest, ResponseCode};
    use crate::locator::Locator;
    use crate::message_dispatcher::MockMessageDispatcher;
    use crate::test_util::{control_frame, decode, RecordingHandle};
    use crate::util::buf_ext::Endianness;
    use mockall::predicate::eq;
    use rstest::rstest;
    use std::collections::VecDeque;
    use std::io;
    use std::net::SocketAddrV4;
    use std::str::FromStr;

    /// Hands out a predefined sequence of read results, then signals EOF
    struct ScriptedReader(VecDeque<io::Result<Vec<u8>>>);

    impl Read for ScriptedReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.pop_front() {
                None => Ok(0),
                Some(Err(e)) => Err(e),
                Some(Ok(data)) => {
                    buf[..data.len()].copy_from_slice(&data);
                    Ok(data.len())
                }
            }
        }
    }

    fn manager(listener: MockControlListener) -> Arc<RtcpMessageManager> {
        let locator = Locator::tcp_v4(SocketAddrV4::from_str("10.0.0.1:7400").unwrap(), 0, None);
        Arc::new(RtcpMessageManager::new(Arc::new(listener), locator, MessageFramer::new(Endianness::Big)))
    }

    fn data_frame(logical_port: u16, payload: &[u8]) -> Vec<u8> {
        MessageFramer::encode_data_frame(logical_port, payload).unwrap().to_vec()
    }

    #[test]
    fn test_frame_reader_partial_reads() {
        let frame = data_frame(7411, b"some payload");
        let mut reader = FrameReader::new(1024);

        for (i, b) in frame.iter().enumerate() {
            assert!(reader.next_frame().unwrap().is_none(), "premature frame after {} bytes", i);
            reader.extend(&[*b]);
        }
        assert_eq!(reader.next_frame().unwrap().unwrap().as_ref(), frame.as_slice());
        assert_eq!(reader.buffered_len(), 0);
    }

    #[test]
    fn test_frame_reader_multiple_frames_in_one_chunk() {
        let first = data_frame(1, b"a");
        let second = data_frame(2, b"bc");
        let mut reader = FrameReader::new(1024);

        let mut chunk = first.clone();
        chunk.extend_from_slice(&second);
        chunk.extend_from_slice(&second[..5]);
        reader.extend(&chunk);

        assert_eq!(reader.next_frame().unwrap().unwrap().as_ref(), first.as_slice());
        assert_eq!(reader.next_frame().unwrap().unwrap().as_ref(), second.as_slice());
        assert!(reader.next_frame().unwrap().is_none());
        assert_eq!(reader.buffered_len(), 5);
    }

    #[rstest]
    #[case::bad_magic(b"RTPS\0\0\0\x20\0\0\0\0\0\x01")]
    #[case::too_short(b"RTCP\0\0\0\x0d\0\0\0\0\0\x01")]
    #[case::too_long(b"RTCP\0\0\x04\x01\0\0\0\0\0\x01")]
    fn test_frame_reader_lost_framing(#[case] data: &[u8]) {
        let mut reader = FrameReader::new(1024);
        reader.extend(data);
        assert!(reader.next_frame().is_err());
    }

    #[test]
    fn test_dispatches_data_on_open_port() {
        let mut listener = MockControlListener::new();
        listener.expect_is_logical_port_open()
            .with(eq(7411))
            .return_const(true);
        listener.expect_on_connection_closed()
            .times(1)
            .return_const(());

        let mut dispatcher = MockMessageDispatcher::new();
        dispatcher.expect_on_message()
            .withf(|port, msg| *port == 7411 && msg == b"hello")
            .times(1)
            .return_const(());

        let connection = RecordingHandle::in_state(ConnectionState::Established);
        connection.handle.set_dispatcher(Arc::new(dispatcher));

        let frame = data_frame(7411, b"hello");
        let reader = ScriptedReader(VecDeque::from(vec![
            Ok(frame[..3].to_vec()),
            Err(io::Error::from(io::ErrorKind::WouldBlock)),
            Ok(frame[3..].to_vec()),
        ]));

        run_receive_loop(connection.handle.clone(), manager(listener), Box::new(reader), 1024);

        assert!(!connection.handle.is_alive());
        assert!(connection.take_writes().is_empty());
    }

    #[test]
    fn test_data_on_closed_port_is_answered() {
        let mut listener = MockControlListener::new();
        listener.expect_is_logical_port_open()
            .return_const(false);
        listener.expect_on_connection_closed()
            .return_const(());

        // no expectations: dispatching would fail the test
        let dispatcher = MockMessageDispatcher::new();

        let connection = RecordingHandle::in_state(ConnectionState::Established);
        connection.handle.set_dispatcher(Arc::new(dispatcher));

        let reader = ScriptedReader(VecDeque::from(vec![Ok(data_frame(99, b"hello"))]));
        run_receive_loop(connection.handle.clone(), manager(listener), Box::new(reader), 1024);

        let written = connection.single_write();
        let notification = decode(&written);
        assert_eq!(notification.header.kind, ControlMessageKind::LogicalPortIsClosedRequest);
        let mut payload = notification.payload;
        assert_eq!(LogicalPortIsClosedRequest::deser(&mut payload, Endianness::Big).unwrap().logical_port, 99);
    }

    #[rstest]
    #[case::server_before_bind(ConnectionState::WaitingForBind)]
    #[case::client_before_bind(ConnectionState::WaitingForBindResponse)]
    #[case::disconnected(ConnectionState::Disconnected)]
    fn test_data_before_bind_is_dropped(#[case] state: ConnectionState) {
        let mut listener = MockControlListener::new();
        listener.expect_is_logical_port_open()
            .return_const(true);
        listener.expect_on_connection_closed()
            .return_const(());

        // no expectations: dispatching would fail the test
        let dispatcher = MockMessageDispatcher::new();

        let connection = RecordingHandle::in_state(state);
        connection.handle.set_dispatcher(Arc::new(dispatcher));

        let reader = ScriptedReader(VecDeque::from(vec![Ok(data_frame(7411, b"hello"))]));
        run_receive_loop(connection.handle.clone(), manager(listener), Box::new(reader), 1024);

        assert_eq!(connection.handle.state(), state);
        assert!(connection.take_writes().is_empty());
    }

    #[test]
    fn test_control_frames_go_to_manager() {
        let mut listener = MockControlListener::new();
        listener.expect_is_logical_port_open()
            .with(eq(1))
            .return_const(true);
        listener.expect_on_connection_closed()
            .return_const(());

        let connection = RecordingHandle::in_state(ConnectionState::Established);
        let frame = control_frame(Endianness::Little, ControlMessageKind::OpenLogicalPortRequest, 1, b"\x01\x00", None);

        let reader = ScriptedReader(VecDeque::from(vec![Ok(frame)]));
        run_receive_loop(connection.handle.clone(), manager(listener), Box::new(reader), 1024);

        let written = connection.single_write();
        let response = decode(&written);
        assert_eq!(response.header.kind, ControlMessageKind::OpenLogicalPortResponse);
        assert_eq!(response.response_code, Some(ResponseCode::Ok));
    }

    #[test]
    fn test_lost_framing_disables_connection() {
        let mut listener = MockControlListener::new();
        listener.expect_on_connection_closed()
            .times(1)
            .return_const(());

        let connection = RecordingHandle::in_state(ConnectionState::Established);
        // the reader would deliver a valid frame afterwards, but the loop must not read it
        let reader = ScriptedReader(VecDeque::from(vec![
            Ok(b"GARBAGE GARBAGE GARBAGE".to_vec()),
            Ok(data_frame(1, b"x")),
        ]));
        run_receive_loop(connection.handle.clone(), manager(listener), Box::new(reader), 1024);

        assert!(!connection.handle.is_alive());
        assert!(connection.take_writes().is_empty());
    }

    #[test]
    fn test_io_error_disables_connection() {
        let mut listener = MockControlListener::new();
        listener.expect_on_connection_closed()
            .times(1)
            .return_const(());

        let connection = RecordingHandle::in_state(ConnectionState::Established);
        let reader = ScriptedReader(VecDeque::from(vec![
            Err(io::Error::from(io::ErrorKind::ConnectionReset)),
            Ok(data_frame(1, b"x")),
        ]));
        run_receive_loop(connection.handle.clone(), manager(listener), Box::new(reader), 1024);

        assert!(!connection.handle.is_alive());
    }
}
