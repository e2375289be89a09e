use anyhow::bail;
use bytes::{Buf, BufMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;

/// The tunnel stream protocol version spoken by this implementation.
pub const STREAM_VERSION: u8 = 2;

/// Default window size if bidirectional flow control is enabled but no explicit size
///  was configured.
pub const DEFAULT_BIDIRECTIONAL_WINDOW_SIZE: u32 = 6144 * 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControlKind {
    None,
    Bidirectional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuaranteeKind {
    None,
    /// messages are sequenced per named queue and persisted locally for replay-on-reconnect
    PersistentQueue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthenticationKind {
    None,
    /// the first frame of the stream is a login exchange that bypasses flow control
    OmmLogin,
}

/// Negotiated session parameters. Immutable once the open handshake completes - almost every
///  protocol decision (fragment sizing, window checks, feature gating) reads from this.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassOfService {
    pub stream_version: u8,
    pub max_fragment_size: u32,
    pub max_msg_size: u32,
    pub flow_control: FlowControlKind,
    pub send_window_size: u32,
    pub recv_window_size: u32,
    pub guarantee: GuaranteeKind,
    pub authentication: AuthenticationKind,
}

impl ClassOfService {
    pub const SERIALIZED_LEN: usize = 1 + 4 + 4 + 1 + 4 + 4 + 1 + 1;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.stream_version);
        buf.put_u32(self.max_fragment_size);
        buf.put_u32(self.max_msg_size);
        buf.put_u8(match self.flow_control {
            FlowControlKind::None => 0,
            FlowControlKind::Bidirectional => 1,
        });
        buf.put_u32(self.send_window_size);
        buf.put_u32(self.recv_window_size);
        buf.put_u8(match self.guarantee {
            GuaranteeKind::None => 0,
            GuaranteeKind::PersistentQueue => 1,
        });
        buf.put_u8(match self.authentication {
            AuthenticationKind::None => 0,
            AuthenticationKind::OmmLogin => 1,
        });
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<ClassOfService> {
        let stream_version = buf.try_get_u8()?;
        let max_fragment_size = buf.try_get_u32()?;
        let max_msg_size = buf.try_get_u32()?;
        let flow_control = match buf.try_get_u8()? {
            0 => FlowControlKind::None,
            1 => FlowControlKind::Bidirectional,
            n => bail!("unknown flow control kind {}", n),
        };
        let send_window_size = buf.try_get_u32()?;
        let recv_window_size = buf.try_get_u32()?;
        let guarantee = match buf.try_get_u8()? {
            0 => GuaranteeKind::None,
            1 => GuaranteeKind::PersistentQueue,
            n => bail!("unknown guarantee kind {}", n),
        };
        let authentication = match buf.try_get_u8()? {
            0 => AuthenticationKind::None,
            1 => AuthenticationKind::OmmLogin,
            n => bail!("unknown authentication kind {}", n),
        };

        Ok(ClassOfService {
            stream_version,
            max_fragment_size,
            max_msg_size,
            flow_control,
            send_window_size,
            recv_window_size,
            guarantee,
            authentication,
        })
    }

    /// Check the class of service the peer sent back in its refresh against what we requested.
    ///
    /// The peer may downgrade the stream version and shrink the fragment size, but it must
    ///  not change the feature gates we requested - a mismatch there means the two sides
    ///  would disagree on the protocol, so the open fails.
    pub fn check_received(&self, received: &ClassOfService) -> anyhow::Result<()> {
        if received.stream_version > self.stream_version {
            bail!(
                "peer negotiated stream version {} above the requested {}",
                received.stream_version,
                self.stream_version
            );
        }
        if received.max_fragment_size > self.max_fragment_size {
            bail!(
                "peer negotiated max fragment size {} above the requested {}",
                received.max_fragment_size,
                self.max_fragment_size
            );
        }
        if received.flow_control != self.flow_control {
            bail!("peer changed the flow control kind");
        }
        if received.guarantee != self.guarantee {
            bail!("peer changed the guarantee kind");
        }
        if received.authentication != self.authentication {
            bail!("peer changed the authentication kind");
        }
        Ok(())
    }
}

impl Default for ClassOfService {
    fn default() -> Self {
        ClassOfService {
            stream_version: STREAM_VERSION,
            max_fragment_size: 6144,
            max_msg_size: 6144,
            flow_control: FlowControlKind::None,
            send_window_size: DEFAULT_BIDIRECTIONAL_WINDOW_SIZE,
            recv_window_size: DEFAULT_BIDIRECTIONAL_WINDOW_SIZE,
            guarantee: GuaranteeKind::None,
            authentication: AuthenticationKind::None,
        }
    }
}
