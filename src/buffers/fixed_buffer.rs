//! Fixed-length reusable buffers. Their main purpose is to minimize copying and allocation
//!  on the frame transmit path:
//!
//! * backed by a fixed-length, pre-allocated buffer
//! * implement `BufMut` to fit into the `bytes` ecosystem
//! * writable in place through `as_mut()`, which is how sequence numbers get patched into
//!    already-serialized frames

use std::borrow::Borrow;
use std::fmt::{Debug, Formatter};

use bytes::buf::UninitSlice;

/// A fixed-length dynamically allocated buffer
#[derive(Eq)]
pub struct FixedBuf {
    buf: Vec<u8>,
    len: usize,
}
impl FixedBuf {
    /// create a new FixedBuf instance with the given buffer capacity
    pub fn new(capacity: usize) -> FixedBuf {
        FixedBuf {
            // buffers are reused aggressively, so we trade the overhead of one-time
            //  initialization for simplicity
            buf: vec![0; capacity],
            len: 0,
        }
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

    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn truncate(&mut self, len: usize) {
        assert!(len <= self.capacity());
        if len < self.len {
            self.len = len;
        }
    }

    /// This is a convenience function for test code. It derives the buffer's capacity from the
    ///  slice used for initialization, which is a shortcut not intended for production usage.
    #[cfg(test)]
    pub fn from_slice(len: usize, data: &[u8]) -> FixedBuf {
        let mut result = FixedBuf::new(len);
        bytes::BufMut::put_slice(&mut result, data);
        result
    }
}

impl PartialEq for FixedBuf {
    fn eq(&self, other: &Self) -> bool {
        self.as_ref().eq(other.as_ref())
    }
}

impl Debug for FixedBuf {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.as_ref().fmt(f)
    }
}

impl Borrow<[u8]> for FixedBuf {
    fn borrow(&self) -> &[u8] {
        self.as_ref()
    }
}

impl AsRef<[u8]> for FixedBuf {
    fn as_ref(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}
impl AsMut<[u8]> for FixedBuf {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..self.len]
    }
}

unsafe impl bytes::BufMut for FixedBuf {
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

    fn new_fixed_buf(capacity: usize, content: &[u8]) -> FixedBuf {
        let mut result = FixedBuf::new(capacity);
        result.put_slice(content);
        result
    }

    #[rstest]
    #[case::empty(new_fixed_buf(100, b""), 0)]
    #[case::simple(new_fixed_buf(100, b"abc"), 3)]
    fn test_len(#[case] buf: FixedBuf, #[case] expected: usize) {
        assert_eq!(buf.len(), expected);
        assert_eq!(buf.is_empty(), expected == 0);
    }

    #[rstest]
    #[case::empty_100(new_fixed_buf(100, b""), 100)]
    #[case::data_200(new_fixed_buf(200, b"abc"), 200)]
    #[case::full(new_fixed_buf(5, b"abcde"), 5)]
    fn test_capacity(#[case] buf: FixedBuf, #[case] expected: usize) {
        assert_eq!(buf.capacity(), expected);
    }

    #[rstest]
    #[case::empty(new_fixed_buf(100, b""))]
    #[case::data(new_fixed_buf(200, b"123"))]
    #[case::full(new_fixed_buf(5, b"12345"))]
    fn test_clear(#[case] mut buf: FixedBuf) {
        let capacity = buf.capacity();

        buf.clear();

        assert_eq!(0, buf.len());
        assert_eq!(b"", buf.as_ref());
        assert_eq!(capacity, buf.capacity());
    }

    #[rstest]
    #[case::shorter(3, b"hel")]
    #[case::same(5, b"hello")]
    #[case::longer(8, b"hello")]
    fn test_truncate(#[case] len: usize, #[case] expected: &[u8]) {
        let mut buf = new_fixed_buf(20, b"hello");
        buf.truncate(len);
        assert_eq!(buf.as_ref(), expected);
    }

    #[rstest]
    #[case::empty                    (new_fixed_buf(100, b""),   new_fixed_buf(100, b""),   true)]
    #[case::empty_different_capacity (new_fixed_buf(100, b""),   new_fixed_buf(200, b""),   true)]
    #[case::simple_different_capacity(new_fixed_buf(100, b"hi"), new_fixed_buf(200, b"hi"), true)]
    #[case::different                (new_fixed_buf(100, b"hi"), new_fixed_buf(100, b"yo"), false)]
    #[case::prefix                   (new_fixed_buf(100, b"h"),  new_fixed_buf(100, b"hi"), false)]
    fn test_eq(#[case] buf1: FixedBuf, #[case] buf2: FixedBuf, #[case] expected: bool) {
        assert_eq!(buf1.eq(&buf2), expected);
        assert_eq!(buf2.eq(&buf1), expected);
    }

    #[rstest]
    #[case::data(new_fixed_buf(20, b"abc"), b"Abc")]
    #[case::full(new_fixed_buf(5, b"qrstu"), b"Arstu")]
    fn test_as_mut_modification(#[case] mut buf: FixedBuf, #[case] expected: &[u8]) {
        buf.as_mut()[0] = 65;
        assert_eq!(buf.as_ref(), expected);
    }

    #[test]
    fn test_buf_mut_chunk_mut() {
        let mut buffer = FixedBuf::new(1000);
        buffer.put_slice(b"hello");

        assert_eq!(buffer.remaining_mut(), 1000 - 5);

        let chunk = buffer.chunk_mut();
        chunk[..7].copy_from_slice(b" world!");

        assert_eq!(buffer.as_ref(), b"hello");
        unsafe { buffer.advance_mut(6); }
        assert_eq!(buffer.remaining_mut(), 1000 - 11);

        assert_eq!(buffer.as_ref(), b"hello world");
    }
}
