//! Fixed-length, pre-allocated packet buffers. Their main purpose is to allow
//!  aggressive reuse through [`super::PacketPool`] and to move received
//!  packets into message storage without copying the payload.
//!
//! The buffers implement `BufMut` to fit into the `bytes` ecosystem.

use std::borrow::Borrow;
use std::fmt::{Debug, Formatter};
use bytes::buf::UninitSlice;

/// A fixed-capacity, dynamically allocated buffer
#[derive(Eq)]
pub struct PacketBuf {
    buf: Vec<u8>,
    len: usize,
}

impl PacketBuf {
    /// create a new PacketBuf instance with the given buffer capacity
    pub fn new(capacity: usize) -> PacketBuf {
        PacketBuf {
            // buffers are reused aggressively, so we trade the overhead of
            //  one-time initialization for simplicity
            buf: vec![0; capacity],
            len: 0,
        }
    }

    pub fn from_slice(capacity: usize, data: &[u8]) -> PacketBuf {
        let mut result = PacketBuf::new(capacity);
        bytes::BufMut::put_slice(&mut result, data);
        result
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// make the entire underlying buffer available through as_ref() etc.,
    ///  e.g. for handing it to the driver as a receive target
    pub fn maximize_len(&mut self) {
        self.len = self.capacity();
    }

    pub fn truncate(&mut self, len: usize) {
        assert!(len <= self.capacity());
        if len < self.len {
            self.len = len;
        }
    }

    /// set the visible length, e.g. after the driver wrote into the raw
    ///  backing store. The backing store is allocated zeroed, so every byte
    ///  below `capacity` is initialized.
    pub fn set_len(&mut self, len: usize) {
        assert!(len <= self.capacity());
        self.len = len;
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }
}

impl PartialEq for PacketBuf {
    fn eq(&self, other: &Self) -> bool {
        self.as_ref().eq(other.as_ref())
    }
}

impl Debug for PacketBuf {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.as_ref().fmt(f)
    }
}

impl Borrow<[u8]> for PacketBuf {
    fn borrow(&self) -> &[u8] {
        self.as_ref()
    }
}

impl AsRef<[u8]> for PacketBuf {
    fn as_ref(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl AsMut<[u8]> for PacketBuf {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..self.len]
    }
}

unsafe impl bytes::BufMut for PacketBuf {
    fn remaining_mut(&self) -> usize {
        self.buf.len() - self.len
    }

    unsafe fn advance_mut(&mut self, cnt: usize) {
        assert!(self.len + cnt <= self.capacity());
        self.len += cnt;
    }

    fn chunk_mut(&mut self) -> &mut UninitSlice {
        UninitSlice::new(&mut self.buf[self.len..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;
    use rstest::rstest;

    fn new_buf(capacity: usize, content: &[u8]) -> PacketBuf {
        PacketBuf::from_slice(capacity, content)
    }

    #[rstest]
    #[case::empty(new_buf(100, b""), 0)]
    #[case::simple(new_buf(100, b"abc"), 3)]
    fn test_len(#[case] buf: PacketBuf, #[case] expected: usize) {
        assert_eq!(buf.len(), expected);
        assert_eq!(buf.is_empty(), expected == 0);
    }

    #[rstest]
    #[case::empty_100(new_buf(100, b""), 100)]
    #[case::data_100(new_buf(100, b"abc"), 100)]
    #[case::full(new_buf(5, b"abcde"), 5)]
    fn test_capacity(#[case] buf: PacketBuf, #[case] expected: usize) {
        assert_eq!(buf.capacity(), expected);
    }

    #[rstest]
    #[case::empty(new_buf(3, b""), b"\0\0\0")]
    #[case::data(new_buf(4, b"abc"), b"abc\0")]
    #[case::full(new_buf(5, b"abcde"), b"abcde")]
    fn test_maximize_len(#[case] mut buf: PacketBuf, #[case] expected: &[u8]) {
        buf.maximize_len();
        assert_eq!(buf.as_ref(), expected);
    }

    #[rstest]
    #[case::shrink(new_buf(10, b"abcde"), 2, b"ab")]
    #[case::same(new_buf(10, b"abcde"), 5, b"abcde")]
    #[case::grow_is_noop(new_buf(10, b"abcde"), 7, b"abcde")]
    fn test_truncate(#[case] mut buf: PacketBuf, #[case] len: usize, #[case] expected: &[u8]) {
        buf.truncate(len);
        assert_eq!(buf.as_ref(), expected);
    }

    #[test]
    fn test_clear() {
        let mut buf = new_buf(10, b"abc");
        let capacity = buf.capacity();

        buf.clear();

        assert_eq!(buf.len(), 0);
        assert_eq!(buf.as_ref(), b"");
        assert_eq!(buf.capacity(), capacity);
    }

    #[rstest]
    #[case::empty                    (new_buf(100, b""),   new_buf(100, b""),   true)]
    #[case::empty_different_capacity (new_buf(100, b""),   new_buf(200, b""),   true)]
    #[case::simple                   (new_buf(100, b"hi"), new_buf(200, b"hi"), true)]
    #[case::different                (new_buf(100, b"hi"), new_buf(100, b"yo"), false)]
    #[case::prefix                   (new_buf(100, b"h"),  new_buf(100, b"hi"), false)]
    fn test_eq(#[case] buf1: PacketBuf, #[case] buf2: PacketBuf, #[case] expected: bool) {
        assert_eq!(buf1.eq(&buf2), expected);
        assert_eq!(buf2.eq(&buf1), expected);
    }

    #[test]
    fn test_as_mut_modification() {
        let mut buf = new_buf(20, b"abc");
        buf.as_mut()[0] = 65;
        assert_eq!(buf.as_ref(), b"Abc");
    }

    #[test]
    fn test_buf_mut_chunk_mut() {
        let mut buffer = PacketBuf::new(1000);
        buffer.put_slice(b"hello");

        assert_eq!(buffer.remaining_mut(), 1000 - 5);

        let chunk = buffer.chunk_mut();
        assert_eq!(chunk.len(), 1000 - 5);

        chunk[..7].copy_from_slice(b" world!");
        assert_eq!(buffer.as_ref(), b"hello");

        unsafe { buffer.advance_mut(6); }
        assert_eq!(buffer.remaining_mut(), 1000 - 11);
        assert_eq!(buffer.as_ref(), b"hello world");
    }

    #[test]
    fn test_set_len_after_external_write() {
        let mut buffer = PacketBuf::new(10);
        buffer.maximize_len();
        buffer.as_mut()[..3].copy_from_slice(b"abc");
        buffer.set_len(3);
        assert_eq!(buffer.as_ref(), b"abc");
    }
}
