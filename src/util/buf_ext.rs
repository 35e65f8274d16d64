use anyhow::bail;
use bytes::{Buf, BufMut};

/// Byte order of the multi-byte fields in a control frame, as announced by the control
///  header's endianness flag.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Endianness {
    Big,
    Little,
}

impl Endianness {
    pub const fn native() -> Endianness {
        if cfg!(target_endian = "little") {
            Endianness::Little
        }
        else {
            Endianness::Big
        }
    }
}

impl Default for Endianness {
    fn default() -> Self {
        Self::native()
    }
}

macro_rules! get_try_impl {
    ($try_getter: ident, $ty:ty, $be_getter: ident, $le_getter: ident) => {
        fn $try_getter(&mut self, order: Endianness) -> anyhow::Result<$ty> {
            if self.remaining() < size_of::<$ty>() {
                bail!("buffer underflow: expected {} bytes, {} remaining", size_of::<$ty>(), self.remaining());
            }
            Ok(match order {
                Endianness::Big => self.$be_getter(),
                Endianness::Little => self.$le_getter(),
            })
        }
    }
}

macro_rules! put_impl {
    ($putter: ident, $ty:ty, $be_putter: ident, $le_putter: ident) => {
        fn $putter(&mut self, v: $ty, order: Endianness) {
            match order {
                Endianness::Big => self.$be_putter(v),
                Endianness::Little => self.$le_putter(v),
            }
        }
    }
}

/// Checked reads with an explicit byte order, named apart from `bytes`' own `try_get_*`
///  methods so that both can be in scope.
pub trait BufExt: Buf {
    fn try_get_octet(&mut self) -> anyhow::Result<u8> {
        if !self.has_remaining() {
            bail!("buffer underflow: expected 1 byte, none remaining");
        }
        Ok(self.get_u8())
    }

    get_try_impl!(try_get_u16_ordered, u16, get_u16, get_u16_le);
    get_try_impl!(try_get_u32_ordered, u32, get_u32, get_u32_le);
    get_try_impl!(try_get_i32_ordered, i32, get_i32, get_i32_le);

    fn try_get_octets<const N: usize>(&mut self) -> anyhow::Result<[u8; N]> {
        if self.remaining() < N {
            bail!("buffer underflow: expected {} bytes, {} remaining", N, self.remaining());
        }
        let mut result = [0u8; N];
        self.copy_to_slice(&mut result);
        Ok(result)
    }
}

pub trait BufMutExt: BufMut {
    put_impl!(put_u16_ordered, u16, put_u16, put_u16_le);
    put_impl!(put_u32_ordered, u32, put_u32, put_u32_le);
    put_impl!(put_i32_ordered, i32, put_i32, put_i32_le);
}

impl <T: Buf> BufExt for T {
}

impl <T: BufMut> BufMutExt for T {
}
