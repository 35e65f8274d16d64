use anyhow::bail;
use bytes::{Buf, BufMut};
use crc::{Crc, CRC_32_ISCSI};

use crate::util::buf_ext::{BufExt, BufMutExt, Endianness};

const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// The fixed-size header in front of every frame on a connection, control or data.
///
/// ```ascii
///  0: magic "RTCP" (4 bytes)
///  4: total frame length including this header (u32, network byte order)
///  8: CRC-32C over everything after this header (u32, byte order of the control header)
/// 12: target logical port (u16, network byte order) - 0 for control messages
/// ```
///
/// Length and logical port are always big endian: the receiver must be able to frame the
///  stream before it has seen a control header, and data frames do not have one.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PhysicalHeader {
    pub length: u32,
    pub crc: u32,
    pub logical_port: u16,
}

impl PhysicalHeader {
    pub const MAGIC: &'static [u8; 4] = b"RTCP";
    pub const SERIALIZED_LEN: usize = 4 + size_of::<u32>() + size_of::<u32>() + size_of::<u16>();
    pub const CONTROL_LOGICAL_PORT: u16 = 0;

    const OFFSET_LENGTH: usize = 4;
    const OFFSET_LOGICAL_PORT: usize = 12;

    pub fn is_control(&self) -> bool {
        self.logical_port == Self::CONTROL_LOGICAL_PORT
    }

    pub fn ser(&self, buf: &mut impl BufMut, crc_order: Endianness) {
        buf.put_slice(Self::MAGIC);
        buf.put_u32(self.length);
        buf.put_u32_ordered(self.crc, crc_order);
        buf.put_u16(self.logical_port);
    }

    pub fn deser(buf: &mut impl Buf, crc_order: Endianness) -> anyhow::Result<PhysicalHeader> {
        let magic = buf.try_get_octets::<4>()?;
        if &magic != Self::MAGIC {
            bail!("invalid frame magic {:02x?}", magic);
        }
        let length = buf.try_get_u32_ordered(Endianness::Big)?;
        let crc = buf.try_get_u32_ordered(crc_order)?;
        let logical_port = buf.try_get_u16_ordered(Endianness::Big)?;
        Ok(PhysicalHeader {
            length,
            crc,
            logical_port,
        })
    }

    /// Reads the frame length from a (possibly incomplete) frame prefix without consuming it,
    ///  returning `None` if not enough bytes are available yet.
    pub fn peek_length(buf: &[u8]) -> anyhow::Result<Option<u32>> {
        if buf.len() < Self::SERIALIZED_LEN {
            return Ok(None);
        }
        if &buf[..4] != Self::MAGIC {
            bail!("invalid frame magic {:02x?}", &buf[..4]);
        }
        let mut length_buf = &buf[Self::OFFSET_LENGTH..];
        Ok(Some(length_buf.get_u32()))
    }

    pub fn peek_logical_port(buf: &[u8]) -> Option<u16> {
        if buf.len() < Self::SERIALIZED_LEN {
            return None;
        }
        let mut port_buf = &buf[Self::OFFSET_LOGICAL_PORT..];
        Some(port_buf.get_u16())
    }

    /// Sets the CRC for the bytes following this header, i.e. control header, status and
    ///  payload of a control frame or the payload of a data frame.
    pub fn calculate_crc(&mut self, data: &[u8]) {
        self.crc = CASTAGNOLI.checksum(data);
    }

    pub fn check_crc(&self, data: &[u8]) -> bool {
        self.crc == CASTAGNOLI.checksum(data)
    }
}
