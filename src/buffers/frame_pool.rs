use std::sync::Mutex;

use tracing::{debug, trace};

use crate::buffers::fixed_buffer::FixedBuf;
use crate::error::TunnelError;
use crate::queue_msg::Expiry;
use crate::seq_num::SeqNum;

/// A frame travelling through the transmit pipeline: the serialized bytes plus the
///  bookkeeping the pipeline needs.
///
/// A frame is in exactly one place at a time - the transmit queue, the retry slot after a
///  partial write, or the ack-wait map. That invariant holds by construction because the
///  frame is moved between those containers rather than linked into several.
pub struct FrameBuf {
    pub buf: FixedBuf,

    /// assigned when the frame is first written to the channel, not when it is submitted
    pub seq_num: Option<SeqNum>,

    /// true once the frame made it onto the wire at least once
    pub ever_transmitted: bool,

    /// The first authentication frame of a stream is sent even if the send window has no
    ///  room for it - without this the login could deadlock a small window.
    pub bypass_flow_control: bool,

    pub queue_meta: Option<QueueFrameMeta>,
}

impl FrameBuf {
    pub fn new(buf: FixedBuf) -> FrameBuf {
        FrameBuf {
            buf,
            seq_num: None,
            ever_transmitted: false,
            bypass_flow_control: false,
            queue_meta: None,
        }
    }
}

/// Bookkeeping for a data frame that carries a queue-layer message: which substream it
///  belongs to (for persistence release on ack and dead letters on expiry), its queue-level
///  sequence number, identifier and destination, and its expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueFrameMeta {
    pub substream_id: u16,
    pub queue_seq: SeqNum,
    pub identifier: i64,
    pub dest_name: String,
    pub expiry: Expiry,
}

/// A bounded pool of frame buffers.
///
/// The bound is the stream's guaranteed-output-buffers setting: once that many buffers are
///  in flight, acquisition fails with a transient error until acks (or a close) return
///  buffers to the pool. This is what puts backpressure on submitters.
pub struct FrameBufferPool {
    buf_size: usize,
    state: Mutex<PoolState>,
}

struct PoolState {
    free: Vec<FixedBuf>,
    outstanding: usize,
    max_outstanding: usize,
}

impl FrameBufferPool {
    pub fn new(buf_size: usize, max_outstanding: usize) -> Self {
        FrameBufferPool {
            buf_size,
            state: Mutex::new(PoolState {
                free: Vec::with_capacity(max_outstanding),
                outstanding: 0,
                max_outstanding,
            }),
        }
    }

    pub fn outstanding(&self) -> usize {
        self.state.lock().unwrap().outstanding
    }

    pub fn try_get(&self) -> Result<FrameBuf, TunnelError> {
        let mut state = self.state.lock().unwrap();
        if state.outstanding == state.max_outstanding {
            debug!("frame buffer pool exhausted: {} buffers in flight", state.outstanding);
            return Err(TunnelError::BuffersExhausted);
        }
        state.outstanding += 1;

        let buf = match state.free.pop() {
            Some(buf) => {
                trace!("returning buffer from pool");
                buf
            }
            None => {
                trace!("no buffer in pool: creating new buffer");
                FixedBuf::new(self.buf_size)
            }
        };
        Ok(FrameBuf::new(buf))
    }

    pub fn return_to_pool(&self, frame: FrameBuf) {
        let mut buf = frame.buf;
        assert_eq!(buf.capacity(), self.buf_size,
                   "returned buffer does not have the regular capacity of {} bytes", self.buf_size);
        buf.clear();

        let mut state = self.state.lock().unwrap();
        debug_assert!(state.outstanding > 0);
        state.outstanding -= 1;
        state.free.push(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    #[test]
    fn test_exhaustion_and_return() {
        let pool = FrameBufferPool::new(10, 2);

        let a = pool.try_get().unwrap();
        let _b = pool.try_get().unwrap();
        assert_eq!(pool.outstanding(), 2);

        assert!(matches!(pool.try_get(), Err(TunnelError::BuffersExhausted)));

        pool.return_to_pool(a);
        assert_eq!(pool.outstanding(), 1);
        assert!(pool.try_get().is_ok());
    }

    #[test]
    fn test_cleared_on_return() {
        let pool = FrameBufferPool::new(10, 2);

        let mut frame = pool.try_get().unwrap();
        frame.buf.put_u8(1);
        frame.buf.put_u8(2);
        pool.return_to_pool(frame);

        assert_eq!(pool.try_get().unwrap().buf.as_ref(), b"");
    }
}
