use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use crate::error::ProtocolError;
use crate::util::buf::BufExt;

/// Marks the start of every request header. A header-sized block that does not start with this
///  value is discarded by the receiver.
pub const HEADER_SENTINEL: i32 = -1;

#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(i8)]
pub enum RequestKind {
    CloseConnection = 0,
    AckRequest = 1,
    EchoRequest = 2,
    ThroughputMetricsRequest = 3,
}

/// The fixed-size header preceding every request:
///
/// ```ascii
///  0: sentinel (i32 BE, always HEADER_SENTINEL)
///  4: request kind (i8)
///  5: total byte count (i32 BE) - the number of payload bytes following the header
///  9: chunk size (i32 BE) - the payload is sent and answered in chunks of this size, the last
///      chunk holding the remainder
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    pub request_kind: RequestKind,
    pub total_byte_count: i32,
    pub chunk_size: i32,
}

impl Header {
    pub const SERIALIZED_LEN: usize = size_of::<i32>() + size_of::<i8>() + 2*size_of::<i32>();

    pub fn new(request_kind: RequestKind, total_byte_count: i32, chunk_size: i32) -> Header {
        Header {
            request_kind,
            total_byte_count,
            chunk_size,
        }
    }

    pub fn close_connection() -> Header {
        Header::new(RequestKind::CloseConnection, 0, 0)
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_i32(HEADER_SENTINEL);
        buf.put_i8(self.request_kind.into());
        buf.put_i32(self.total_byte_count);
        buf.put_i32(self.chunk_size);
    }

    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(Self::SERIALIZED_LEN);
        self.ser(&mut buf);
        buf
    }

    /// checks if a header-sized block starts with the header sentinel
    pub fn has_sentinel(raw: &[u8]) -> bool {
        raw.len() >= size_of::<i32>() && raw[..size_of::<i32>()] == HEADER_SENTINEL.to_be_bytes()
    }

    /// This is intended to be called after [Header::has_sentinel] confirmed that the buffer starts
    ///  with a header. An unknown request kind is a protocol violation.
    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Header> {
        let sentinel = buf.checked_get_i32()?;
        if sentinel != HEADER_SENTINEL {
            return Err(ProtocolError::violation(format!("header does not start with the sentinel but with {}", sentinel)).into());
        }

        let raw_kind = buf.checked_get_i8()?;
        let request_kind = RequestKind::try_from(raw_kind)
            .map_err(|_| ProtocolError::violation(format!("unrecognized request kind {}", raw_kind)))?;

        let total_byte_count = buf.checked_get_i32()?;
        let chunk_size = buf.checked_get_i32()?;
        Ok(Header {
            request_kind,
            total_byte_count,
            chunk_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::close(RequestKind::CloseConnection, 0, 0)]
    #[case::ack(RequestKind::AckRequest, 1024*1024, 4096)]
    #[case::echo(RequestKind::EchoRequest, 64, 64)]
    #[case::throughput(RequestKind::ThroughputMetricsRequest, 1024, 1024)]
    #[case::max(RequestKind::EchoRequest, i32::MAX, i32::MAX)]
    fn test_ser_deser(#[case] kind: RequestKind, #[case] total: i32, #[case] chunk_size: i32) {
        let original = Header::new(kind, total, chunk_size);

        let buf = original.to_bytes();
        assert_eq!(buf.len(), Header::SERIALIZED_LEN);
        assert!(Header::has_sentinel(&buf));

        let mut b: &[u8] = &buf;
        let deser = Header::deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser, original);
    }

    #[test]
    fn test_wire_layout() {
        let buf = Header::new(RequestKind::ThroughputMetricsRequest, 0x01020304, 0x0a0b0c0d).to_bytes();
        assert_eq!(buf.as_ref(), &[255,255,255,255, 3, 1,2,3,4, 10,11,12,13]);
        assert_eq!(Header::SERIALIZED_LEN, 13);
    }

    #[rstest]
    #[case::sentinel(&[255,255,255,255, 0,0,0,0,0,0,0,0,0], true)]
    #[case::payload(&[1,2,3,4, 0,0,0,0,0,0,0,0,0], false)]
    #[case::eot(&[255,255,255,254, 0,0,0,0,0,0,0,0,0], false)]
    #[case::short(&[255,255,255], false)]
    fn test_has_sentinel(#[case] raw: &[u8], #[case] expected: bool) {
        assert_eq!(Header::has_sentinel(raw), expected);
    }

    #[rstest]
    #[case::unknown_kind(&[255,255,255,255, 4, 0,0,0,0, 0,0,0,0])]
    #[case::negative_kind(&[255,255,255,255, 255, 0,0,0,0, 0,0,0,0])]
    #[case::no_sentinel(&[0,0,0,0, 1, 0,0,0,0, 0,0,0,0])]
    fn test_deser_violation(#[case] mut raw: &[u8]) {
        let e = Header::deser(&mut raw).unwrap_err();
        assert!(matches!(ProtocolError::of(&e), Some(ProtocolError::ProtocolViolation(_))));
    }

    #[test]
    fn test_deser_truncated() {
        let mut raw: &[u8] = &[255,255,255,255, 1, 0,0];
        assert!(Header::deser(&mut raw).is_err());
    }
}
