use std::io;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::connection_handle::{ConnectionHandle, ConnectionState, MockStreamConnection};
use crate::control_header::ControlMessageKind;
use crate::control_messages::ResponseCode;
use crate::message_framer::{ControlFrame, MessageFramer};
use crate::transaction::TransactionId;
use crate::util::buf_ext::Endianness;

/// A connection handle on top of a mocked stream that records every frame written to it
pub struct RecordingHandle {
    pub handle: Arc<ConnectionHandle>,
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl RecordingHandle {
    pub fn new() -> RecordingHandle {
        let writes = Arc::new(Mutex::new(Vec::<Vec<u8>>::new()));

        let mut connection = MockStreamConnection::new();
        connection.expect_peer_addr()
            .return_const(None);
        let w = writes.clone();
        connection.expect_write_some()
            .returning(move |buf| {
                w.lock().push(buf.to_vec());
                Ok(buf.len())
            });

        RecordingHandle {
            handle: Arc::new(ConnectionHandle::new(Box::new(connection))),
            writes,
        }
    }

    pub fn in_state(state: ConnectionState) -> RecordingHandle {
        let result = Self::new();
        assert!(result.handle.lock().change_state(state));
        result
    }

    /// A handle whose every write fails with an I/O error
    pub fn failing() -> RecordingHandle {
        let mut connection = MockStreamConnection::new();
        connection.expect_peer_addr()
            .return_const(None);
        connection.expect_write_some()
            .returning(|_| Err(io::Error::from(io::ErrorKind::BrokenPipe)));

        RecordingHandle {
            handle: Arc::new(ConnectionHandle::new(Box::new(connection))),
            writes: Default::default(),
        }
    }

    pub fn take_writes(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.writes.lock())
    }

    pub fn single_write(&self) -> Vec<u8> {
        let mut writes = self.take_writes();
        assert_eq!(writes.len(), 1, "expected exactly one write");
        writes.remove(0)
    }
}

pub fn control_frame(order: Endianness, kind: ControlMessageKind, transaction_id: u32, payload: &[u8], response_code: Option<ResponseCode>) -> Vec<u8> {
    MessageFramer::new(order)
        .encode_control_frame(kind, TransactionId::from_raw(transaction_id), payload, response_code)
        .unwrap()
        .to_vec()
}

pub fn decode(frame: &[u8]) -> ControlFrame<'_> {
    MessageFramer::decode_control_frame(frame).unwrap()
}
