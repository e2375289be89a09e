use std::time::Duration;

use anyhow::bail;

use crate::cos::{ClassOfService, FlowControlKind};

/// Baseline retransmission delay after a close-handshake frame went unanswered. Doubles with
///  each attempt.
pub const DEFAULT_RETRANSMIT_TIMEOUT: Duration = Duration::from_millis(150);

pub const DEFAULT_MAX_RETRANSMIT_ATTEMPTS: u32 = 4;

pub struct TunnelStreamConfig {
    /// The stream id carried in every handshake frame. Both sides must use the same id; a
    ///  frame with an unexpected id is a protocol violation.
    pub stream_id: i32,

    pub domain_type: u8,
    pub service_id: u16,

    /// How long to wait for the peer's refresh after sending an open request before the open
    ///  fails with a timeout.
    pub response_timeout: Duration,

    /// Base delay before re-sending an unanswered close-handshake frame. The actual delay is
    ///  `2^attempt` times this value.
    pub retransmit_timeout: Duration,

    /// Number of re-sends of a close-handshake frame before the stream is torn down forcibly.
    pub max_retransmit_attempts: u32,

    /// The number of frame buffers pre-allocated for this stream. Submitting while all of
    ///  them are queued or waiting for an ack fails with a transient error.
    pub guaranteed_output_buffers: usize,

    /// The class of service requested in the open handshake. The peer may negotiate it
    ///  down, see [ClassOfService::check_received].
    pub cos: ClassOfService,
}

impl TunnelStreamConfig {
    pub fn new(stream_id: i32, domain_type: u8, service_id: u16) -> TunnelStreamConfig {
        TunnelStreamConfig {
            stream_id,
            domain_type,
            service_id,
            response_timeout: Duration::from_secs(5),
            retransmit_timeout: DEFAULT_RETRANSMIT_TIMEOUT,
            max_retransmit_attempts: DEFAULT_MAX_RETRANSMIT_ATTEMPTS,
            guaranteed_output_buffers: 50,
            cos: ClassOfService::default(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.cos.max_fragment_size < crate::frame::DATA_FRAG_HEADER_LEN as u32 + 1 {
            bail!("max fragment size is too small to hold a fragment header plus payload");
        }
        if self.cos.max_msg_size < self.cos.max_fragment_size {
            bail!("max message size is smaller than the max fragment size");
        }
        if self.cos.flow_control == FlowControlKind::Bidirectional
            && (self.cos.send_window_size == 0 || self.cos.recv_window_size == 0)
        {
            bail!("bidirectional flow control requires non-zero window sizes");
        }
        if self.guaranteed_output_buffers == 0 {
            bail!("at least one guaranteed output buffer is required");
        }
        if self.response_timeout.is_zero() {
            bail!("response timeout must be non-zero");
        }
        if self.retransmit_timeout.is_zero() {
            bail!("retransmit timeout must be non-zero");
        }

        Ok(())
    }

    /// The full serialized size of a frame buffer: worst-case header plus fragment payload.
    pub fn frame_buf_size(&self) -> usize {
        crate::frame::FRAME_HEADER_RESERVE + self.cos.max_fragment_size as usize
    }
}
