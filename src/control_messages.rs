use anyhow::bail;
use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::locator::Locator;
use crate::safe_converter::{PrecheckedCast, SafeCast};
use crate::util::buf_ext::{BufExt, BufMutExt, Endianness};

/// Status code carried by every response, between control header and payload.
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum ResponseCode {
    Void = 0,
    Ok = 1,
    ServerError = 2,
    UnknownLocator = 3,
    InvalidPort = 4,
    BadRequest = 5,
    IncompatibleVersion = 6,
    ExistingConnection = 7,
}

impl ResponseCode {
    pub const SERIALIZED_LEN: usize = size_of::<u32>();

    pub fn ser(&self, buf: &mut impl BufMut, order: Endianness) {
        buf.put_u32_ordered((*self).into(), order);
    }

    pub fn deser(buf: &mut impl Buf, order: Endianness) -> anyhow::Result<ResponseCode> {
        let raw = buf.try_get_u32_ordered(order)?;
        match ResponseCode::try_from_primitive(raw) {
            Ok(code) => Ok(code),
            Err(_) => bail!("unknown response code {}", raw),
        }
    }
}

pub const PROTOCOL_VERSION: [u8; 2] = [1, 0];
pub const VENDOR_ID: [u8; 2] = [0x01, 0x0F];

/// Upper bound for the number of ports in a check-logical-ports message, keeping the control
///  message length within its u16 length field.
pub const MAX_PORTS_PER_CHECK: usize = 4096;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConnectionRequest {
    pub protocol_version: [u8; 2],
    pub vendor_id: [u8; 2],
    pub transport_locator: Locator,
}
impl ConnectionRequest {
    pub fn new(transport_locator: Locator) -> ConnectionRequest {
        ConnectionRequest {
            protocol_version: PROTOCOL_VERSION,
            vendor_id: VENDOR_ID,
            transport_locator,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut, order: Endianness) {
        buf.put_slice(&self.protocol_version);
        buf.put_slice(&self.vendor_id);
        self.transport_locator.ser(buf, order);
    }

    pub fn deser(buf: &mut impl Buf, order: Endianness) -> anyhow::Result<ConnectionRequest> {
        let protocol_version = buf.try_get_octets::<2>()?;
        let vendor_id = buf.try_get_octets::<2>()?;
        let transport_locator = Locator::deser(buf, order)?;
        Ok(ConnectionRequest {
            protocol_version,
            vendor_id,
            transport_locator,
        })
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BindConnectionResponse {
    pub locator: Locator,
}
impl BindConnectionResponse {
    pub fn ser(&self, buf: &mut impl BufMut, order: Endianness) {
        self.locator.ser(buf, order);
    }

    pub fn deser(buf: &mut impl Buf, order: Endianness) -> anyhow::Result<BindConnectionResponse> {
        Ok(BindConnectionResponse {
            locator: Locator::deser(buf, order)?,
        })
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct KeepAliveRequest {
    pub locator: Locator,
}
impl KeepAliveRequest {
    pub fn ser(&self, buf: &mut impl BufMut, order: Endianness) {
        self.locator.ser(buf, order);
    }

    pub fn deser(buf: &mut impl Buf, order: Endianness) -> anyhow::Result<KeepAliveRequest> {
        Ok(KeepAliveRequest {
            locator: Locator::deser(buf, order)?,
        })
    }
}

/// Shared by the open-logical-port request and the logical-port-is-closed notification: both
///  carry a single logical port.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct LogicalPortMessage {
    pub logical_port: u16,
}
impl LogicalPortMessage {
    pub fn ser(&self, buf: &mut impl BufMut, order: Endianness) {
        buf.put_u16_ordered(self.logical_port, order);
    }

    pub fn deser(buf: &mut impl Buf, order: Endianness) -> anyhow::Result<LogicalPortMessage> {
        Ok(LogicalPortMessage {
            logical_port: buf.try_get_u16_ordered(order)?,
        })
    }
}

impl From<u16> for LogicalPortMessage {
    fn from(logical_port: u16) -> Self {
        LogicalPortMessage { logical_port }
    }
}

pub type OpenLogicalPortRequest = LogicalPortMessage;
pub type LogicalPortIsClosedRequest = LogicalPortMessage;

/// A list of logical ports: the ports asked about in a check-logical-ports request, or the
///  subset of them that is open in the corresponding response.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct LogicalPortList {
    pub logical_ports: Vec<u16>,
}
impl LogicalPortList {
    pub fn ser(&self, buf: &mut impl BufMut, order: Endianness) {
        buf.put_u32_ordered(self.logical_ports.len().prechecked_cast(), order);
        for &port in &self.logical_ports {
            buf.put_u16_ordered(port, order);
        }
    }

    pub fn deser(buf: &mut impl Buf, order: Endianness) -> anyhow::Result<LogicalPortList> {
        let num_ports: usize = buf.try_get_u32_ordered(order)?.safe_cast();
        if num_ports > MAX_PORTS_PER_CHECK {
            bail!("logical port list with {} entries exceeds the maximum of {}", num_ports, MAX_PORTS_PER_CHECK);
        }
        let mut logical_ports = Vec::with_capacity(num_ports);
        for _ in 0..num_ports {
            logical_ports.push(buf.try_get_u16_ordered(order)?);
        }
        Ok(LogicalPortList { logical_ports })
    }
}

pub type CheckLogicalPortsRequest = LogicalPortList;
pub type CheckLogicalPortsResponse = LogicalPortList;

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;
    use std::net::SocketAddrV4;
    use std::str::FromStr;

    #[rstest]
    #[case::ok(ResponseCode::Ok, 1)]
    #[case::existing(ResponseCode::ExistingConnection, 7)]
    #[case::server_error(ResponseCode::ServerError, 2)]
    fn test_response_code_ser(#[case] code: ResponseCode, #[case] raw: u32) {
        let mut buf = BytesMut::new();
        code.ser(&mut buf, Endianness::Big);
        assert_eq!(buf.as_ref(), &raw.to_be_bytes());

        let mut b: &[u8] = &buf;
        assert_eq!(ResponseCode::deser(&mut b, Endianness::Big).unwrap(), code);
    }

    #[test]
    fn test_response_code_unknown() {
        let mut buf: &[u8] = &[0, 0, 0, 99];
        assert!(ResponseCode::deser(&mut buf, Endianness::Big).is_err());
    }

    #[test]
    fn test_connection_request_layout() {
        let locator = Locator::tcp_v4(SocketAddrV4::from_str("127.0.0.1:7400").unwrap(), 0, None);
        let request = ConnectionRequest::new(locator);

        let mut buf = BytesMut::new();
        request.ser(&mut buf, Endianness::Little);
        assert_eq!(buf.len(), 4 + Locator::SERIALIZED_LEN);
        assert_eq!(&buf[..4], &[1, 0, 0x01, 0x0F]);

        let mut b: &[u8] = &buf;
        assert_eq!(ConnectionRequest::deser(&mut b, Endianness::Little).unwrap(), request);
        assert!(b.is_empty());
    }

    #[rstest]
    #[case::empty(vec![], b"\0\0\0\0")]
    #[case::one(vec![7411], b"\0\0\0\x01\x1c\xf3")]
    #[case::two(vec![1, 2], b"\0\0\0\x02\0\x01\0\x02")]
    fn test_port_list_ser(#[case] logical_ports: Vec<u16>, #[case] expected: &[u8]) {
        let list = LogicalPortList { logical_ports };

        let mut buf = BytesMut::new();
        list.ser(&mut buf, Endianness::Big);
        assert_eq!(buf.as_ref(), expected);

        let mut b: &[u8] = &buf;
        assert_eq!(LogicalPortList::deser(&mut b, Endianness::Big).unwrap(), list);
    }

    #[rstest]
    #[case::truncated(b"\0\0\0\x02\0\x01")]
    #[case::too_many(b"\0\x01\0\0")]
    fn test_port_list_deser_invalid(#[case] mut buf: &[u8]) {
        assert!(LogicalPortList::deser(&mut buf, Endianness::Big).is_err());
    }
}
