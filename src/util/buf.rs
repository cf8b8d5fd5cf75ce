//! Fixed-width big-endian number encoding on top of the `bytes` crate. Writing uses `BufMut`'s
//!  `put_*` methods directly, this module adds reads that fail instead of panicking on underflow,
//!  and the encoding of `i32` lists used for resend requests.

use anyhow::anyhow;
use bytes::{Buf, BufMut};

pub const I32_SIZE: usize = size_of::<i32>();
pub const I64_SIZE: usize = size_of::<i64>();

macro_rules! get_checked_impl {
    ($checked_getter: ident, $ty:ty, $getter: ident) => {
        fn $checked_getter(&mut self) -> anyhow::Result<$ty> {
            if self.remaining() < size_of::<$ty>() {
                return Err(anyhow!("buffer underflow: {} bytes required, {} remaining", size_of::<$ty>(), self.remaining()));
            }
            Ok(self.$getter())
        }
    }
}

pub trait BufExt: Buf {
    get_checked_impl!(checked_get_i8, i8, get_i8);
    get_checked_impl!(checked_get_u8, u8, get_u8);
    get_checked_impl!(checked_get_i32, i32, get_i32);
    get_checked_impl!(checked_get_i64, i64, get_i64);

    /// reads i32 values until the buffer is exhausted
    fn checked_get_i32_list(&mut self) -> anyhow::Result<Vec<i32>> {
        if self.remaining() % I32_SIZE != 0 {
            return Err(anyhow!("buffer of {} bytes does not contain a whole number of i32 values", self.remaining()));
        }

        let mut result = Vec::with_capacity(self.remaining() / I32_SIZE);
        while self.has_remaining() {
            result.push(self.get_i32());
        }
        Ok(result)
    }
}

pub trait BufMutExt: BufMut {
    fn put_i32_list(&mut self, values: &[i32]) {
        for &v in values {
            self.put_i32(v);
        }
    }
}

impl <T: Buf> BufExt for T {
}

impl <T: BufMut> BufMutExt for T {
}
