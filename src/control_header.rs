use anyhow::{anyhow, bail};
use bitflags::bitflags;
use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::transaction::TransactionId;
use crate::util::buf_ext::{BufExt, BufMutExt, Endianness};

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum ControlMessageKind {
    BindConnectionRequest = 0xD1,
    OpenLogicalPortRequest = 0xD2,
    CheckLogicalPortsRequest = 0xD3,
    KeepAliveRequest = 0xD4,
    LogicalPortIsClosedRequest = 0xD5,
    UnbindConnectionRequest = 0xD6,
    BindConnectionResponse = 0xE1,
    OpenLogicalPortResponse = 0xE2,
    CheckLogicalPortsResponse = 0xE3,
    KeepAliveResponse = 0xE4,
}

impl ControlMessageKind {
    pub fn is_response(&self) -> bool {
        u8::from(*self) & 0xF0 == 0xE0
    }

    /// Requests that the peer answers with a matching response kind. Port-closed notifications
    ///  and unbind are one-way.
    pub fn requires_response(&self) -> bool {
        matches!(self,
            ControlMessageKind::BindConnectionRequest
            | ControlMessageKind::OpenLogicalPortRequest
            | ControlMessageKind::CheckLogicalPortsRequest
            | ControlMessageKind::KeepAliveRequest
        )
    }
}

bitflags! {
    #[derive(Debug, PartialEq, Eq, Copy, Clone)]
    pub struct ControlFlags: u8 {
        const LITTLE_ENDIAN = 0b0000_0001;
        const RESPONSE      = 0b0000_0010;
        const MUST_REPLY    = 0b0000_0100;
        const LAST_FRAGMENT = 0b0000_1000;
    }
}

impl ControlFlags {
    pub fn new(endianness: Endianness, is_response: bool, must_reply: bool, last_fragment: bool) -> ControlFlags {
        let mut flags = ControlFlags::empty();
        flags.set(ControlFlags::LITTLE_ENDIAN, endianness == Endianness::Little);
        flags.set(ControlFlags::RESPONSE, is_response);
        flags.set(ControlFlags::MUST_REPLY, must_reply);
        flags.set(ControlFlags::LAST_FRAGMENT, last_fragment);
        flags
    }

    pub fn endianness(&self) -> Endianness {
        if self.contains(ControlFlags::LITTLE_ENDIAN) {
            Endianness::Little
        }
        else {
            Endianness::Big
        }
    }
}

/// Header of an RTCP control message, following the physical header on logical port 0:
///
/// ```ascii
/// 0: kind (u8)
/// 1: flags (u8) - bit 0: little endian, bit 1: response, bit 2: must reply, bit 3: last fragment
/// 2: length (u16) - control header, status code (if any) and payload
/// 4: transaction id (u32)
/// ```
///
/// All multi-byte fields are in the byte order announced by the endianness flag.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ControlHeader {
    pub kind: ControlMessageKind,
    pub flags: ControlFlags,
    pub length: u16,
    pub transaction_id: TransactionId,
}

impl ControlHeader {
    pub const SERIALIZED_LEN: usize = size_of::<u8>() + size_of::<u8>() + size_of::<u16>() + size_of::<u32>();

    pub fn endianness(&self) -> Endianness {
        self.flags.endianness()
    }

    pub fn is_response(&self) -> bool {
        self.flags.contains(ControlFlags::RESPONSE)
    }

    /// The byte order of a control frame's content, read from the flags byte without parsing
    ///  the rest of the header.
    pub fn peek_endianness(buf: &[u8]) -> anyhow::Result<Endianness> {
        let flags = buf.get(1)
            .ok_or_else(|| anyhow!("control header too short to contain flags"))?;
        Ok(ControlFlags::from_bits_retain(*flags).endianness())
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        let order = self.endianness();
        buf.put_u8(self.kind.into());
        buf.put_u8(self.flags.bits());
        buf.put_u16_ordered(self.length, order);
        buf.put_u32_ordered(self.transaction_id.to_raw(), order);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<ControlHeader> {
        let raw_kind = buf.try_get_octet()?;
        let kind = match ControlMessageKind::try_from_primitive(raw_kind) {
            Ok(kind) => kind,
            Err(_) => bail!("unrecognized control message kind 0x{:02X}", raw_kind),
        };
        let flags = ControlFlags::from_bits_retain(buf.try_get_octet()?);
        let order = flags.endianness();
        let length = buf.try_get_u16_ordered(order)?;
        let transaction_id = TransactionId::from_raw(buf.try_get_u32_ordered(order)?);

        Ok(ControlHeader {
            kind,
            flags,
            length,
            transaction_id,
        })
    }
}
