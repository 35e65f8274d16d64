use anyhow::bail;
use bytes::{BufMut, BytesMut};
use tracing::trace;

use crate::connection_handle::ConnectionGuard;
use crate::control_header::{ControlFlags, ControlHeader, ControlMessageKind};
use crate::control_messages::ResponseCode;
use crate::physical_header::PhysicalHeader;
use crate::safe_converter::PrecheckedCast;
use crate::transaction::TransactionId;
use crate::util::buf_ext::Endianness;

/// A control frame after parsing and integrity checking, borrowing its payload from the
///  receive buffer.
#[derive(Debug)]
pub struct ControlFrame<'a> {
    pub header: ControlHeader,
    pub response_code: Option<ResponseCode>,
    pub payload: &'a [u8],
}

/// Assembles and parses frames. A frame is written with exactly one write call; there is no
///  fragmentation.
///
/// Control frame:
/// ```ascii
/// physical header (14) | control header (8) | status code (4, responses only) | payload
/// ```
///
/// Data frame:
/// ```ascii
/// physical header (14, logical port != 0, CRC big endian) | payload
/// ```
#[derive(Debug, Clone)]
pub struct MessageFramer {
    endianness: Endianness,
}

impl MessageFramer {
    pub const MAX_CONTROL_LEN: usize = u16::MAX as usize;

    pub fn new(endianness: Endianness) -> MessageFramer {
        MessageFramer { endianness }
    }

    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    pub fn fill_headers(&self, kind: ControlMessageKind, transaction_id: TransactionId, payload_len: usize, response_code: Option<ResponseCode>) -> anyhow::Result<(PhysicalHeader, ControlHeader)> {
        let status_len = if response_code.is_some() { ResponseCode::SERIALIZED_LEN } else { 0 };
        let control_len = ControlHeader::SERIALIZED_LEN + status_len + payload_len;
        if control_len > Self::MAX_CONTROL_LEN {
            bail!("control message {:?} of {} bytes exceeds the maximum of {}", kind, control_len, Self::MAX_CONTROL_LEN);
        }

        let control_header = ControlHeader {
            kind,
            flags: ControlFlags::new(self.endianness, kind.is_response(), kind.requires_response(), true),
            length: control_len.prechecked_cast(),
            transaction_id,
        };
        let physical_header = PhysicalHeader {
            length: (control_len + PhysicalHeader::SERIALIZED_LEN).prechecked_cast(),
            crc: 0,
            logical_port: PhysicalHeader::CONTROL_LOGICAL_PORT,
        };
        Ok((physical_header, control_header))
    }

    pub fn encode_control_frame(&self, kind: ControlMessageKind, transaction_id: TransactionId, payload: &[u8], response_code: Option<ResponseCode>) -> anyhow::Result<BytesMut> {
        let (mut physical_header, control_header) = self.fill_headers(kind, transaction_id, payload.len(), response_code)?;

        let mut body = BytesMut::with_capacity(control_header.length as usize);
        control_header.ser(&mut body);
        if let Some(code) = response_code {
            code.ser(&mut body, self.endianness);
        }
        body.put_slice(payload);
        physical_header.calculate_crc(&body);

        let mut frame = BytesMut::with_capacity(physical_header.length as usize);
        physical_header.ser(&mut frame, self.endianness);
        frame.put_slice(&body);
        Ok(frame)
    }

    /// Writes physical header, control header, status code (responses only) and payload as a
    ///  single write.
    pub fn send_data(&self, connection: &mut ConnectionGuard, kind: ControlMessageKind, transaction_id: TransactionId, payload: &[u8], response_code: Option<ResponseCode>) -> anyhow::Result<()> {
        let frame = self.encode_control_frame(kind, transaction_id, payload, response_code)?;
        trace!(?kind, ?transaction_id, ?response_code, len = frame.len(), "sending control message");
        connection.write(&frame)
    }

    pub fn encode_data_frame(logical_port: u16, payload: &[u8]) -> anyhow::Result<BytesMut> {
        if logical_port == PhysicalHeader::CONTROL_LOGICAL_PORT {
            bail!("logical port {} is reserved for control messages", logical_port);
        }
        let frame_len = PhysicalHeader::SERIALIZED_LEN + payload.len();
        if frame_len > u32::MAX as usize {
            bail!("data message of {} bytes is too big for a single frame", payload.len());
        }

        let mut header = PhysicalHeader {
            length: frame_len.prechecked_cast(),
            crc: 0,
            logical_port,
        };
        header.calculate_crc(payload);

        let mut frame = BytesMut::with_capacity(frame_len);
        header.ser(&mut frame, Endianness::Big);
        frame.put_slice(payload);
        Ok(frame)
    }

    pub fn send_data_message(&self, connection: &mut ConnectionGuard, logical_port: u16, payload: &[u8]) -> anyhow::Result<()> {
        let frame = Self::encode_data_frame(logical_port, payload)?;
        trace!(logical_port, len = frame.len(), "sending data message");
        connection.write(&frame)
    }

    pub fn decode_data_frame(frame: &[u8]) -> anyhow::Result<(u16, &[u8])> {
        let mut buf = frame;
        let header = PhysicalHeader::deser(&mut buf, Endianness::Big)?;
        if header.is_control() {
            bail!("not a data frame");
        }
        if header.length as usize != frame.len() {
            bail!("frame length mismatch: header says {}, frame has {} bytes", header.length, frame.len());
        }
        if !header.check_crc(buf) {
            bail!("CRC mismatch in data frame for logical port {}", header.logical_port);
        }
        Ok((header.logical_port, buf))
    }

    /// Parses a complete control frame, validating length and CRC before looking at the
    ///  control header's content.
    pub fn decode_control_frame(frame: &[u8]) -> anyhow::Result<ControlFrame<'_>> {
        if frame.len() < PhysicalHeader::SERIALIZED_LEN + ControlHeader::SERIALIZED_LEN {
            bail!("frame of {} bytes is too short for a control message", frame.len());
        }
        let body = &frame[PhysicalHeader::SERIALIZED_LEN..];
        let order = ControlHeader::peek_endianness(body)?;

        let physical_header = PhysicalHeader::deser(&mut &frame[..], order)?;
        if !physical_header.is_control() {
            bail!("frame for logical port {} is not a control message", physical_header.logical_port);
        }
        if physical_header.length as usize != frame.len() {
            bail!("frame length mismatch: header says {}, frame has {} bytes", physical_header.length, frame.len());
        }
        if !physical_header.check_crc(body) {
            bail!("CRC mismatch in control message");
        }

        let mut buf = body;
        let header = ControlHeader::deser(&mut buf)?;
        if header.length as usize != body.len() {
            bail!("control header length {} does not match the {} bytes received", header.length, body.len());
        }
        if header.is_response() != header.kind.is_response() {
            bail!("response flag inconsistent with message kind {:?}", header.kind);
        }

        let response_code = if header.kind.is_response() {
            Some(ResponseCode::deser(&mut buf, order)?)
        }
        else {
            None
        };

        Ok(ControlFrame {
            header,
            response_code,
            payload: buf,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection_handle::{ConnectionHandle, MockStreamConnection};
    use crate::test_util::RecordingHandle;
    use rstest::rstest;

    #[rstest]
    #[case::request_no_payload(ControlMessageKind::UnbindConnectionRequest, 0, None, 8, 22)]
    #[case::request_payload(ControlMessageKind::OpenLogicalPortRequest, 2, None, 10, 24)]
    #[case::response_no_payload(ControlMessageKind::KeepAliveResponse, 0, Some(ResponseCode::Ok), 12, 26)]
    #[case::response_payload(ControlMessageKind::BindConnectionResponse, 24, Some(ResponseCode::Ok), 36, 50)]
    fn test_fill_headers(#[case] kind: ControlMessageKind, #[case] payload_len: usize, #[case] response_code: Option<ResponseCode>, #[case] control_len: u16, #[case] frame_len: u32) {
        let framer = MessageFramer::new(Endianness::Big);
        let (physical, control) = framer.fill_headers(kind, TransactionId::from_raw(9), payload_len, response_code).unwrap();

        assert_eq!(control.length, control_len);
        assert_eq!(control.kind, kind);
        assert_eq!(control.transaction_id, TransactionId::from_raw(9));
        assert_eq!(control.is_response(), kind.is_response());
        assert_eq!(control.flags.contains(ControlFlags::MUST_REPLY), kind.requires_response());
        assert!(control.flags.contains(ControlFlags::LAST_FRAGMENT));
        assert_eq!(physical.length, frame_len);
        assert!(physical.is_control());
    }

    #[test]
    fn test_fill_headers_too_big() {
        let framer = MessageFramer::new(Endianness::Big);
        assert!(framer.fill_headers(ControlMessageKind::CheckLogicalPortsRequest, TransactionId::default(), 70_000, None).is_err());
    }

    #[test]
    fn test_encode_control_frame_layout() {
        let framer = MessageFramer::new(Endianness::Big);
        let frame = framer.encode_control_frame(ControlMessageKind::OpenLogicalPortResponse, TransactionId::from_raw(3), b"", Some(ResponseCode::InvalidPort)).unwrap();

        assert_eq!(frame.len(), 26);
        assert_eq!(&frame[..8], b"RTCP\0\0\0\x1a");
        assert_eq!(&frame[12..14], b"\0\0");
        assert_eq!(&frame[14..], b"\xE2\x0A\0\x0C\0\0\0\x03\0\0\0\x04");
    }

    #[rstest]
    #[case::big(Endianness::Big)]
    #[case::little(Endianness::Little)]
    fn test_decode_control_frame(#[case] order: Endianness) {
        let framer = MessageFramer::new(order);
        let frame = framer.encode_control_frame(ControlMessageKind::CheckLogicalPortsResponse, TransactionId::from_raw(77), b"\x01\x02\x03", Some(ResponseCode::Ok)).unwrap();

        let decoded = MessageFramer::decode_control_frame(&frame).unwrap();
        assert_eq!(decoded.header.kind, ControlMessageKind::CheckLogicalPortsResponse);
        assert_eq!(decoded.header.transaction_id, TransactionId::from_raw(77));
        assert_eq!(decoded.header.endianness(), order);
        assert_eq!(decoded.response_code, Some(ResponseCode::Ok));
        assert_eq!(decoded.payload, b"\x01\x02\x03");
    }

    #[test]
    fn test_decode_control_frame_flipped_bit() {
        let framer = MessageFramer::new(Endianness::Little);
        let frame = framer.encode_control_frame(ControlMessageKind::OpenLogicalPortRequest, TransactionId::from_raw(1), b"\x01\x02", None).unwrap();

        for i in PhysicalHeader::SERIALIZED_LEN..frame.len() {
            let mut corrupted = frame.to_vec();
            corrupted[i] ^= 0x10;
            assert!(MessageFramer::decode_control_frame(&corrupted).is_err(), "corruption at offset {} went undetected", i);
        }
    }

    #[rstest]
    #[case::truncated(|f: &mut Vec<u8>| { f.pop(); })]
    #[case::trailing_garbage(|f: &mut Vec<u8>| f.push(0))]
    #[case::data_port(|f: &mut Vec<u8>| f[13] = 1)]
    #[case::bad_magic(|f: &mut Vec<u8>| f[0] = b'X')]
    fn test_decode_control_frame_malformed(#[case] corrupt: fn(&mut Vec<u8>)) {
        let framer = MessageFramer::new(Endianness::Big);
        let mut frame = framer.encode_control_frame(ControlMessageKind::KeepAliveRequest, TransactionId::from_raw(1), b"abcd", None).unwrap().to_vec();
        corrupt(&mut frame);
        assert!(MessageFramer::decode_control_frame(&frame).is_err());
    }

    #[test]
    fn test_data_frame() {
        let frame = MessageFramer::encode_data_frame(7411, b"payload").unwrap();
        assert_eq!(frame.len(), PhysicalHeader::SERIALIZED_LEN + 7);

        let (logical_port, payload) = MessageFramer::decode_data_frame(&frame).unwrap();
        assert_eq!(logical_port, 7411);
        assert_eq!(payload, b"payload");

        let mut corrupted = frame.to_vec();
        corrupted[15] ^= 1;
        assert!(MessageFramer::decode_data_frame(&corrupted).is_err());
    }

    #[test]
    fn test_data_frame_on_control_port() {
        assert!(MessageFramer::encode_data_frame(0, b"payload").is_err());
    }

    #[test]
    fn test_send_data_single_write() {
        let connection = RecordingHandle::new();

        let framer = MessageFramer::new(Endianness::Little);
        framer.send_data(&mut connection.handle.lock(), ControlMessageKind::BindConnectionResponse, TransactionId::from_raw(4), b"xyz", Some(ResponseCode::ExistingConnection)).unwrap();

        let written = connection.single_write();
        let decoded = MessageFramer::decode_control_frame(&written).unwrap();
        assert_eq!(decoded.header.kind, ControlMessageKind::BindConnectionResponse);
        assert_eq!(decoded.response_code, Some(ResponseCode::ExistingConnection));
        assert_eq!(decoded.payload, b"xyz");
    }

    #[test]
    fn test_send_data_partial_write() {
        let mut connection = MockStreamConnection::new();
        connection.expect_peer_addr()
            .return_const(None);
        connection.expect_write_some()
            .times(1)
            .returning(|buf| Ok(buf.len() / 2));
        let handle = ConnectionHandle::new(Box::new(connection));

        let framer = MessageFramer::new(Endianness::Little);
        assert!(framer.send_data(&mut handle.lock(), ControlMessageKind::KeepAliveRequest, TransactionId::from_raw(4), b"xyz", None).is_err());
    }
}
