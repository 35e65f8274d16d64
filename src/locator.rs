use std::fmt::{Debug, Display, Formatter};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::util::buf_ext::{BufExt, BufMutExt, Endianness};

#[repr(i32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum LocatorKind {
    Invalid = -1,
    Reserved = 0,
    UdpV4 = 1,
    UdpV6 = 2,
    TcpV4 = 4,
    TcpV6 = 8,
}

/// A [Locator] identifies a reachable endpoint: a kind, a port and a 16-byte address.
///
/// For the TCP kinds, the port is split in two: the low 16 bits are the physical (TCP) port,
///  the high 16 bits are the logical port that is multiplexed over the connection. An IPv4
///  address lives in the last four address bytes, and the four bytes before that carry the
///  WAN address if the node is behind a NAT.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct Locator {
    pub kind: LocatorKind,
    pub port: u32,
    pub address: [u8; 16],
}

impl Locator {
    pub const SERIALIZED_LEN: usize = size_of::<i32>() + size_of::<u32>() + 16;

    pub fn tcp_v4(addr: SocketAddrV4, logical_port: u16, wan_addr: Option<Ipv4Addr>) -> Locator {
        let mut address = [0u8; 16];
        if let Some(wan) = wan_addr {
            address[8..12].copy_from_slice(&wan.octets());
        }
        address[12..].copy_from_slice(&addr.ip().octets());

        Locator {
            kind: LocatorKind::TcpV4,
            port: ((logical_port as u32) << 16) | addr.port() as u32,
            address,
        }
    }

    pub fn from_socket_addr(addr: SocketAddr, logical_port: u16) -> Locator {
        match addr {
            SocketAddr::V4(addr) => Self::tcp_v4(addr, logical_port, None),
            SocketAddr::V6(addr) => Locator {
                kind: LocatorKind::TcpV6,
                port: ((logical_port as u32) << 16) | addr.port() as u32,
                address: addr.ip().octets(),
            },
        }
    }

    pub fn physical_port(&self) -> u16 {
        (self.port & 0xffff) as u16
    }

    pub fn logical_port(&self) -> u16 {
        (self.port >> 16) as u16
    }

    pub fn with_logical_port(&self, logical_port: u16) -> Locator {
        Locator {
            port: ((logical_port as u32) << 16) | self.physical_port() as u32,
            ..*self
        }
    }

    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        match self.kind {
            LocatorKind::TcpV4 | LocatorKind::UdpV4 => {
                Some(Ipv4Addr::new(self.address[12], self.address[13], self.address[14], self.address[15]))
            }
            _ => None,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut, order: Endianness) {
        buf.put_i32_ordered(self.kind.into(), order);
        buf.put_u32_ordered(self.port, order);
        buf.put_slice(&self.address);
    }

    pub fn deser(buf: &mut impl Buf, order: Endianness) -> anyhow::Result<Locator> {
        let kind = LocatorKind::try_from_primitive(buf.try_get_i32_ordered(order)?)?;
        let port = buf.try_get_u32_ordered(order)?;
        let address = buf.try_get_octets::<16>()?;
        Ok(Locator {
            kind,
            port,
            address,
        })
    }
}

impl Debug for Locator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

impl Display for Locator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.ipv4() {
            Some(ip) => write!(f, "{:?}:[{}]:{}/{}", self.kind, ip, self.physical_port(), self.logical_port()),
            None => write!(f, "{:?}:[{:02x?}]:{}/{}", self.kind, self.address, self.physical_port(), self.logical_port()),
        }
    }
}
