use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

/// Result of handing a frame to the transport.
///
/// `WriteAgain` is not an error: the transport could not take the frame right now, and the
///  caller keeps the frame and retries it first on the next dispatch pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    WriteAgain,
    Error(String),
}

/// This is an abstraction for the message-oriented transport a tunnel stream rides on,
///  introduced to facilitate mocking the I/O part away for testing.
///
/// The transport is unreliable and unordered from the stream's point of view - everything
///  above (sequencing, acks, retransmission) exists because of that.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TransportChannel: Send + Sync + 'static {
    async fn write_frame(&self, frame: &[u8]) -> WriteOutcome;
}
