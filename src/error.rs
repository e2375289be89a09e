/// Failure classes of the tunnel stream engine.
///
/// `BuffersExhausted` is the only transient class - callers are expected to retry after the
///  next dispatch has drained buffers. Everything else is either rejected synchronously
///  (`Validation`) or ends the stream via a status event.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// transient: the frame buffer pool is exhausted; retry after the next dispatch
    #[error("frame buffers exhausted")]
    BuffersExhausted,

    #[error("transport channel failure: {0}")]
    Channel(String),

    #[error("no refresh received within the response timeout")]
    OpenTimeout,

    #[error("close handshake retry budget exhausted")]
    CloseTimeout,

    #[error("invalid request: {0}")]
    Validation(String),
}

impl TunnelError {
    /// true iff the caller may simply retry later without any recovery action
    pub fn is_transient(&self) -> bool {
        matches!(self, TunnelError::BuffersExhausted)
    }
}
