//! A byte queue with append, consume, peek, and tag rollback.
//!
//! [`OctetBuf`] backs two things: the per-server TCP reassembly buffer,
//! where a consumer speculatively reads a length prefix and rolls back if
//! the rest of the frame has not arrived yet, and the per-server TCP send
//! queue, where written bytes are consumed from the front.

use bytes::{Buf, BytesMut};

/// Consumed space is reclaimed once it exceeds this many octets.
const RECLAIM_THRESHOLD: usize = 4096;

//------------ OctetBuf ------------------------------------------------------

/// A byte queue with a rollback tag.
///
/// Octets are appended at the back and consumed from the front. A tag
/// marks the current read position; [`rollback_tag`] moves the read
/// position back to the tag, [`clear_tag`] commits everything consumed
/// since the tag was set.
///
/// [`rollback_tag`]: Self::rollback_tag
/// [`clear_tag`]: Self::clear_tag
#[derive(Debug, Default)]
pub struct OctetBuf {
    /// The stored octets, including already consumed ones.
    data: BytesMut,

    /// The read offset into `data`.
    start: usize,

    /// The read offset at the time the tag was set.
    tag: Option<usize>,
}

impl OctetBuf {
    /// Creates a new, empty buffer.
    pub fn new() -> Self {
        Default::default()
    }

    /// Returns the number of unconsumed octets.
    pub fn len(&self) -> usize {
        self.data.len() - self.start
    }

    /// Returns whether there are no unconsumed octets.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends octets at the back of the buffer.
    pub fn append_slice(&mut self, slice: &[u8]) {
        self.data.extend_from_slice(slice);
    }

    /// Returns the unconsumed octets.
    pub fn peek(&self) -> &[u8] {
        &self.data[self.start..]
    }

    /// Consumes `count` octets from the front.
    ///
    /// Returns `false` and consumes nothing if fewer octets are available.
    pub fn consume(&mut self, count: usize) -> bool {
        if count > self.len() {
            return false;
        }
        self.start += count;
        self.reclaim();
        true
    }

    /// Consumes and returns a big-endian 16 bit value.
    pub fn fetch_be16(&mut self) -> Option<u16> {
        let bytes = self.peek();
        if bytes.len() < 2 {
            return None;
        }
        let value = u16::from_be_bytes([bytes[0], bytes[1]]);
        self.start += 2;
        Some(value)
    }

    /// Places the tag at the current read position.
    ///
    /// Any previously set tag is replaced.
    pub fn tag(&mut self) {
        self.tag = Some(self.start);
    }

    /// Moves the read position back to the tag.
    pub fn rollback_tag(&mut self) {
        if let Some(tag) = self.tag.take() {
            self.start = tag;
        }
    }

    /// Returns the octets consumed since the tag was set.
    pub fn tagged(&self) -> &[u8] {
        match self.tag {
            Some(tag) => &self.data[tag..self.start],
            None => &[],
        }
    }

    /// Drops the tag, committing everything consumed since it was set.
    pub fn clear_tag(&mut self) {
        self.tag = None;
        self.reclaim();
    }

    /// Drops all content and the tag.
    pub fn clear(&mut self) {
        self.data.clear();
        self.start = 0;
        self.tag = None;
    }

    /// Releases consumed space if no tag pins it down.
    fn reclaim(&mut self) {
        if self.tag.is_none() && self.start >= RECLAIM_THRESHOLD {
            self.data.advance(self.start);
            self.start = 0;
        }
    }
}

//============ Test ==========================================================

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn append_consume_peek() {
        let mut buf = OctetBuf::new();
        assert!(buf.is_empty());
        buf.append_slice(b"hello");
        buf.append_slice(b" world");
        assert_eq!(buf.len(), 11);
        assert_eq!(buf.peek(), b"hello world");
        assert!(buf.consume(6));
        assert_eq!(buf.peek(), b"world");
        assert!(!buf.consume(6));
        assert_eq!(buf.peek(), b"world");
        assert!(buf.consume(5));
        assert!(buf.is_empty());
    }

    #[test]
    fn fetch_be16() {
        let mut buf = OctetBuf::new();
        buf.append_slice(&[0x01, 0x02, 0x03]);
        assert_eq!(buf.fetch_be16(), Some(0x0102));
        assert_eq!(buf.fetch_be16(), None);
        assert_eq!(buf.peek(), &[0x03]);
    }

    #[test]
    fn rollback_restores_position() {
        let mut buf = OctetBuf::new();
        buf.append_slice(&[0x00, 0x04, b'a', b'b']);
        buf.tag();
        assert_eq!(buf.fetch_be16(), Some(4));
        // Frame incomplete, roll back to before the length.
        assert!(!buf.consume(4));
        buf.rollback_tag();
        assert_eq!(buf.len(), 4);

        buf.append_slice(b"cd");
        buf.tag();
        assert_eq!(buf.fetch_be16(), Some(4));
        assert!(buf.consume(4));
        assert_eq!(buf.tagged(), &[0x00, 0x04, b'a', b'b', b'c', b'd']);
        buf.clear_tag();
        assert!(buf.is_empty());
    }

    #[test]
    fn reclaims_consumed_space() {
        let mut buf = OctetBuf::new();
        buf.append_slice(&vec![0; RECLAIM_THRESHOLD + 8]);
        assert!(buf.consume(RECLAIM_THRESHOLD + 1));
        assert_eq!(buf.len(), 7);
        assert_eq!(buf.start, 0);
    }
}
