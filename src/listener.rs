#[cfg(test)] use mockall::automock;

use crate::queue_msg::QueueMsg;

/// Stream-level state changes reported to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    Open,
    /// the stream is gone but may be re-opened, e.g. after an open timeout or a rejected
    ///  open request
    ClosedRecoverable,
    Closed,
}

/// Application-facing callbacks. Exactly one terminal status event is emitted per stream
///  lifetime (unless suppressed at close time); queue callbacks only fire on streams with
///  the persistent-queue guarantee.
#[cfg_attr(test, automock)]
pub trait TunnelStreamListener: Send + Sync + 'static {
    /// a complete (reassembled if necessary) application payload arrived in order
    fn on_data(&self, payload: &[u8]);

    fn on_status(&self, status: StreamStatus);

    fn on_substream_status(&self, substream_id: u16, open: bool);

    /// queue data delivered on an open substream
    fn on_queue_msg(&self, msg: &QueueMsg);

    /// the peer (or the local replay logic after a reconnect) confirmed delivery of a queue
    ///  message
    fn on_queue_ack(&self, ack: &QueueMsg);

    /// a queue message expired or came back as a dead letter
    fn on_queue_expired(&self, dead_letter: &QueueMsg);
}
