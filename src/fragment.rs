use bytes::BufMut;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::buffers::big_buffer::BigBufferPool;
use crate::buffers::fixed_buffer::FixedBuf;
use crate::error::TunnelError;
use crate::frame::FragmentHeader;

/// Message ids roll over a `u16`, skipping 0 so an id is always distinguishable from an
///  unset field.
pub const MAX_MSG_ID: u16 = u16::MAX;

pub fn next_msg_id(current: u16) -> u16 {
    if current == MAX_MSG_ID {
        1
    }
    else {
        current + 1
    }
}

/// A big message on its way out, fragment by fragment.
///
/// The transmit path pulls chunks as frame buffers and window space become available, so a
///  message may sit here partially sent across several dispatch passes. Progress only moves
///  forward; a pulled chunk is committed.
pub struct OutboundFragmentation {
    buf: FixedBuf,
    msg_id: u16,
    container_type: u8,
    bytes_sent: usize,
    next_fragment: u32,
    /// set for a fragmented authentication message: every fragment keeps the login's
    ///  window privilege, or the login would stall after its first fragment
    bypass_flow_control: bool,
}

impl OutboundFragmentation {
    pub fn new(
        buf: FixedBuf,
        msg_id: u16,
        container_type: u8,
        bypass_flow_control: bool,
    ) -> OutboundFragmentation {
        OutboundFragmentation {
            buf,
            msg_id,
            container_type,
            bytes_sent: 0,
            next_fragment: 1,
            bypass_flow_control,
        }
    }

    pub fn msg_id(&self) -> u16 {
        self.msg_id
    }

    pub fn bypass_flow_control(&self) -> bool {
        self.bypass_flow_control
    }

    pub fn is_done(&self) -> bool {
        self.bytes_sent == self.buf.len()
    }

    /// the next fragment's header and payload slice; the chunk counts as sent once pulled
    pub fn next_chunk(&mut self, max_fragment_size: usize) -> (FragmentHeader, bool, &[u8]) {
        debug_assert!(!self.is_done());

        let start = self.bytes_sent;
        let end = usize::min(start + max_fragment_size, self.buf.len());

        let header = FragmentHeader {
            total_msg_len: self.buf.len() as u32,
            fragment_number: self.next_fragment,
            msg_id: self.msg_id,
            container_type: self.container_type,
        };
        self.bytes_sent = end;
        self.next_fragment += 1;

        let msg_complete = self.bytes_sent == self.buf.len();
        (header, msg_complete, &self.buf.as_ref()[start..end])
    }

    /// hand the big buffer back for returning to its pool
    pub fn into_buf(self) -> FixedBuf {
        self.buf
    }
}

/// Inbound reassembly table, keyed by message id.
///
/// Fragments of a given message arrive in order because they ride the stream's regular
///  sequencing; fragments of different messages never interleave on the wire, but a stale
///  entry can linger if the peer abandoned a message, so fragment 1 always starts fresh.
pub struct Reassembler {
    entries: FxHashMap<u16, ReassemblyEntry>,
}

struct ReassemblyEntry {
    buf: FixedBuf,
    total_len: u32,
    next_fragment: u32,
    container_type: u8,
}

impl Reassembler {
    pub fn new() -> Reassembler {
        Reassembler {
            entries: FxHashMap::default(),
        }
    }

    /// Feed one received fragment. Returns the completely reassembled message (and its
    ///  container type) once the last fragment arrived; the caller owns the returned buffer
    ///  and returns it to the big buffer pool after delivery.
    pub fn on_fragment(
        &mut self,
        header: &FragmentHeader,
        payload: &[u8],
        pool: &BigBufferPool,
    ) -> Result<Option<(FixedBuf, u8)>, TunnelError> {
        if header.fragment_number == 1 {
            if let Some(stale) = self.entries.remove(&header.msg_id) {
                warn!("fragment 1 for msg id {} replaces an incomplete reassembly", header.msg_id);
                pool.return_to_pool(stale.buf);
            }

            let mut buf = pool.try_get(header.total_msg_len as usize)?;
            buf.put_slice(payload);

            let entry = ReassemblyEntry {
                buf,
                total_len: header.total_msg_len,
                next_fragment: 2,
                container_type: header.container_type,
            };
            return self.finalize_if_complete(header.msg_id, entry);
        }

        let Some(mut entry) = self.entries.remove(&header.msg_id) else {
            debug!("discarding fragment {} of unknown msg id {}", header.fragment_number, header.msg_id);
            return Ok(None);
        };

        if header.fragment_number != entry.next_fragment || header.total_msg_len != entry.total_len {
            warn!("discarding out-of-sequence fragment {} of msg id {}", header.fragment_number, header.msg_id);
            pool.return_to_pool(entry.buf);
            return Ok(None);
        }
        if entry.buf.len() + payload.len() > entry.total_len as usize {
            pool.return_to_pool(entry.buf);
            return Err(TunnelError::Protocol(format!(
                "fragments of msg id {} exceed the declared total of {} bytes",
                header.msg_id, entry.total_len
            )));
        }

        entry.buf.put_slice(payload);
        entry.next_fragment += 1;
        self.finalize_if_complete(header.msg_id, entry)
    }

    fn finalize_if_complete(
        &mut self,
        msg_id: u16,
        entry: ReassemblyEntry,
    ) -> Result<Option<(FixedBuf, u8)>, TunnelError> {
        if entry.buf.len() == entry.total_len as usize {
            Ok(Some((entry.buf, entry.container_type)))
        }
        else {
            self.entries.insert(msg_id, entry);
            Ok(None)
        }
    }

    /// tear-down path: give up on all partial messages and hand their buffers back
    pub fn drain(&mut self) -> Vec<FixedBuf> {
        self.entries.drain().map(|(_, entry)| entry.buf).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::regular(1, 2)]
    #[case::wrap_skips_zero(MAX_MSG_ID, 1)]
    fn test_next_msg_id(#[case] current: u16, #[case] expected: u16) {
        assert_eq!(next_msg_id(current), expected);
    }

    #[test]
    fn test_outbound_split() {
        let payload = vec![7u8; 10000];
        let mut big = FixedBuf::new(16384);
        big.put_slice(&payload);

        let mut outbound = OutboundFragmentation::new(big, 42, 5, false);

        let (header, complete, chunk) = outbound.next_chunk(4096);
        assert_eq!(header, FragmentHeader { total_msg_len: 10000, fragment_number: 1, msg_id: 42, container_type: 5 });
        assert!(!complete);
        assert_eq!(chunk.len(), 4096);

        let (header, complete, chunk) = outbound.next_chunk(4096);
        assert_eq!(header.fragment_number, 2);
        assert!(!complete);
        assert_eq!(chunk.len(), 4096);
        assert!(!outbound.is_done());

        let (header, complete, chunk) = outbound.next_chunk(4096);
        assert_eq!(header.fragment_number, 3);
        assert!(complete);
        assert_eq!(chunk.len(), 1808);
        assert!(outbound.is_done());
    }

    #[test]
    fn test_outbound_resumes_where_it_stopped() {
        let mut big = FixedBuf::new(1000);
        big.put_slice(&(0..=255).cycle().take(1000).map(|n| n as u8).collect::<Vec<_>>());

        let mut outbound = OutboundFragmentation::new(big, 1, 0, false);

        let (_, _, chunk1) = outbound.next_chunk(400);
        let first = chunk1.to_vec();

        // a later dispatch pass continues exactly after the committed chunk
        let (header, _, chunk2) = outbound.next_chunk(400);
        assert_eq!(header.fragment_number, 2);
        assert_eq!(chunk2[0], first[first.len() - 1].wrapping_add(1));
    }

    fn frag_header(msg_id: u16, fragment_number: u32, total: u32) -> FragmentHeader {
        FragmentHeader {
            total_msg_len: total,
            fragment_number,
            msg_id,
            container_type: 5,
        }
    }

    #[test]
    fn test_reassembly_roundtrip() {
        let pool = BigBufferPool::new(4096, 4);
        let mut reassembler = Reassembler::new();

        let payload: Vec<u8> = (0..10000u32).map(|n| n as u8).collect();

        assert!(reassembler.on_fragment(&frag_header(9, 1, 10000), &payload[..4096], &pool).unwrap().is_none());
        assert!(reassembler.on_fragment(&frag_header(9, 2, 10000), &payload[4096..8192], &pool).unwrap().is_none());

        let (buf, container_type) = reassembler
            .on_fragment(&frag_header(9, 3, 10000), &payload[8192..], &pool)
            .unwrap()
            .unwrap();
        assert_eq!(buf.as_ref(), payload.as_slice());
        assert_eq!(container_type, 5);
    }

    #[test]
    fn test_single_fragment_message_completes_immediately() {
        let pool = BigBufferPool::new(4096, 4);
        let mut reassembler = Reassembler::new();

        let result = reassembler.on_fragment(&frag_header(3, 1, 4), &[1, 2, 3, 4], &pool).unwrap();
        assert_eq!(result.unwrap().0.as_ref(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_unknown_msg_id_ignored() {
        let pool = BigBufferPool::new(4096, 4);
        let mut reassembler = Reassembler::new();

        assert!(reassembler.on_fragment(&frag_header(3, 2, 100), &[1, 2], &pool).unwrap().is_none());
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_fragment_one_replaces_stale_entry() {
        let pool = BigBufferPool::new(4096, 4);
        let mut reassembler = Reassembler::new();

        assert!(reassembler.on_fragment(&frag_header(3, 1, 100), &[1, 2], &pool).unwrap().is_none());
        assert!(reassembler.on_fragment(&frag_header(3, 1, 4), &[5, 6], &pool).unwrap().is_none());

        let result = reassembler.on_fragment(&frag_header(3, 2, 4), &[7, 8], &pool).unwrap();
        assert_eq!(result.unwrap().0.as_ref(), &[5, 6, 7, 8]);
        // the stale entry's buffer went back to the pool
        assert_eq!(pool.outstanding(), 1);
    }

    #[test]
    fn test_overflow_is_a_protocol_error() {
        let pool = BigBufferPool::new(4096, 4);
        let mut reassembler = Reassembler::new();

        assert!(reassembler.on_fragment(&frag_header(3, 1, 3), &[1, 2], &pool).unwrap().is_none());
        let result = reassembler.on_fragment(&frag_header(3, 2, 3), &[3, 4], &pool);
        assert!(matches!(result, Err(TunnelError::Protocol(_))));
    }

    #[test]
    fn test_drain() {
        let pool = BigBufferPool::new(4096, 4);
        let mut reassembler = Reassembler::new();

        reassembler.on_fragment(&frag_header(1, 1, 100), &[1], &pool).unwrap();
        reassembler.on_fragment(&frag_header(2, 1, 100), &[2], &pool).unwrap();

        assert_eq!(reassembler.drain().len(), 2);
    }
}
