//! A *tunnel stream* is a reliable, ordered, flow-controlled logical stream tunneled through
//!  an unreliable message-oriented transport, with an optional guaranteed-delivery queue
//!  layer on top.
//!
//! ## Design goals
//!
//! * The underlying transport hands over whole frames but guarantees neither delivery nor
//!   order - everything above (sequencing, acks, NAK-driven retransmission) exists because
//!   of that
//! * The abstraction is sending / receiving *messages* (defined-length chunks of data), not
//!   a byte stream
//! * Strictly in-order delivery to the application: a frame arriving out of order is not
//!   buffered but dropped and NAK'ed together with the gap in front of it, making the peer
//!   re-send the whole range
//! * Byte-based flow control (optional, negotiated): a sender stops once the unacknowledged
//!   bytes in flight would exceed the receive window the peer advertised, so a slow consumer
//!   throttles its producer instead of being flooded
//!   * the first frame after the open handshake may bypass the window if authentication is
//!     negotiated - the login must never deadlock behind a tiny window
//! * Big messages are fragmented to the negotiated fragment size and reassembled on the
//!   receive side before delivery
//! * A symmetric close handshake (FIN / FIN-ACK / final FIN-ACK) so both sides know all data
//!   was delivered before resources are released; unanswered handshake frames are re-sent
//!   with exponential backoff and a bounded retry budget
//! * An optional queue layer ("substreams"): named queues multiplexed inside one stream,
//!   each with its own sequence counters, per-message acknowledgement, expiry, and a local
//!   persistence log that survives reconnects - replay on reconnect gives exactly-once
//!   delivery per queue on top of the stream's at-least-once guarantee
//!
//! ## Frame header
//!
//! All numbers in network byte order (BE):
//!
//! ```ascii
//! 0:  opcode (u8):
//!     * 0x01 open request
//!     * 0x02 open refresh
//!     * 0x03 data
//!     * 0x04 data (retransmit)
//!     * 0x05 ack
//!     * 0x06 close
//! 1:  flags (u8), meaning depends on the opcode:
//!     * data:  bit 0: fragmented, bit 1: message complete
//!     * ack:   bit 0: FIN, bit 1: final FIN-ACK
//!     * open refresh: bit 0: ok
//! ```
//!
//! A data frame continues with the sequence number (u32) and, if fragmented, the fragment
//!  header (total message length u32, 1-based fragment number u32, message id u16, container
//!  type u8), then the payload. The sequence number is assigned when the frame is actually
//!  written to the transport, so frames parked by backpressure never leave holes in the
//!  numbering.
//!
//! An ack frame continues with the cumulative sequence number (u32), the advertised receive
//!  window (u32), and two range lists (u8 count, then inclusive `start`/`end` u32 pairs
//!  each): selectively acknowledged ranges and NAK'ed ranges. A FIN-flagged ack carries the
//!  FIN's *own* sequence number - the FIN consumes a number of the sender's data numbering so
//!  the peer's cumulative ack covers it.
//!
//! Queue-layer messages travel inside the payload of regular data frames and are routed to
//!  their substream on streams negotiated with the persistent-queue guarantee.

pub mod ack_ranges;
pub mod buffers;
pub mod channel;
pub mod config;
pub mod cos;
pub mod error;
pub mod fragment;
pub mod frame;
pub mod listener;
pub mod persist;
pub mod queue_msg;
pub mod seq_num;
pub mod stream;
pub mod substream;

#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor(unsafe)]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
