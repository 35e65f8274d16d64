use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use anyhow::bail;

use crate::physical_header::PhysicalHeader;
use crate::util::buf_ext::Endianness;

/// Configuration of a TCP transport and its control protocol.
#[derive(Debug, Clone)]
pub struct TcpTransportDescriptor {
    /// Socket send buffer size, `None` keeps the OS default
    pub send_buffer_size: Option<usize>,
    /// Socket receive buffer size, `None` keeps the OS default
    pub receive_buffer_size: Option<usize>,

    /// This is the maximum size of a single frame, headers included. A peer announcing a bigger
    ///  frame is considered broken, and its connection is closed since there is no way to skip
    ///  the frame and resynchronize the stream.
    pub max_message_size: u32,

    /// Local interfaces that accepted connections may arrive on. Empty means all interfaces.
    pub interface_whitelist: Vec<IpAddr>,

    /// Public address of this node if it is behind a NAT, announced as part of its locator
    pub wan_addr: Option<Ipv4Addr>,

    /// Interval between keep alive requests on each bound connection
    pub keep_alive_frequency: Duration,
    /// A connection that did not have a keep alive acknowledged for this long is closed
    pub keep_alive_timeout: Duration,
    /// Requests not answered within this time are discarded
    pub transaction_timeout: Duration,

    /// Read timeout of the receive loop. This bounds the time a disabled connection's worker
    ///  needs to notice and terminate, since blocking reads are not interrupted.
    pub read_timeout: Option<Duration>,
    pub connect_timeout: Duration,

    /// Byte order for control messages sent by this node
    pub endianness: Endianness,
}

impl Default for TcpTransportDescriptor {
    fn default() -> Self {
        TcpTransportDescriptor {
            send_buffer_size: None,
            receive_buffer_size: None,
            max_message_size: 64 * 1024 * 1024,
            interface_whitelist: Vec::new(),
            wan_addr: None,
            keep_alive_frequency: Duration::from_secs(5),
            keep_alive_timeout: Duration::from_secs(15),
            transaction_timeout: Duration::from_secs(10),
            read_timeout: Some(Duration::from_millis(500)),
            connect_timeout: Duration::from_secs(5),
            endianness: Endianness::native(),
        }
    }
}

impl TcpTransportDescriptor {
    pub fn validate(&self) -> anyhow::Result<()> {
        if (self.max_message_size as usize) < PhysicalHeader::SERIALIZED_LEN + u16::MAX as usize {
            bail!("max message size {} is too small to hold a control message", self.max_message_size);
        }
        if self.keep_alive_frequency.is_zero() {
            bail!("keep alive frequency must not be zero");
        }
        if self.keep_alive_timeout <= self.keep_alive_frequency {
            bail!("keep alive timeout {:?} must be longer than the keep alive frequency {:?}", self.keep_alive_timeout, self.keep_alive_frequency);
        }
        if self.transaction_timeout.is_zero() {
            bail!("transaction timeout must not be zero");
        }
        if self.read_timeout == Some(Duration::ZERO) {
            bail!("read timeout must not be zero - use `None` for blocking reads");
        }
        if self.send_buffer_size == Some(0) || self.receive_buffer_size == Some(0) {
            bail!("socket buffer sizes must not be zero");
        }
        Ok(())
    }

    pub fn is_interface_allowed(&self, addr: &IpAddr) -> bool {
        self.interface_whitelist.is_empty() || self.interface_whitelist.contains(addr)
    }
}
