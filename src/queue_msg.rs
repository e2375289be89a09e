use anyhow::bail;
use bytes::{Buf, BufMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;

use crate::seq_num::SeqNum;

pub const QM_REQUEST: u8 = 0x01;
pub const QM_REFRESH: u8 = 0x02;
pub const QM_STATUS: u8 = 0x03;
pub const QM_DATA: u8 = 0x04;
pub const QM_ACK: u8 = 0x05;
pub const QM_DEAD_LETTER: u8 = 0x06;
pub const QM_CLOSE: u8 = 0x07;

const FLAG_POSSIBLE_DUPLICATE: u8 = 0x01;

/// Lifetime of a queue data message while it sits in the transmit queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Expiry {
    #[default]
    None,
    /// expire unless the message can go out right away
    Immediate,
    /// absolute deadline, milliseconds since the epoch
    At(i64),
}

impl Expiry {
    pub fn to_wire(&self) -> i64 {
        match self {
            Expiry::None => 0,
            Expiry::Immediate => -1,
            Expiry::At(millis) => *millis,
        }
    }

    pub fn from_wire(raw: i64) -> anyhow::Result<Expiry> {
        match raw {
            0 => Ok(Expiry::None),
            -1 => Ok(Expiry::Immediate),
            millis if millis > 0 => Ok(Expiry::At(millis)),
            _ => bail!("invalid expiry value {}", raw),
        }
    }
}

/// Why a queue data message came back as a dead letter instead of being delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndeliverableCode {
    Unspecified,
    Expired,
    QueueDepthExceeded,
}

impl UndeliverableCode {
    fn to_wire(&self) -> u8 {
        match self {
            UndeliverableCode::Unspecified => 0,
            UndeliverableCode::Expired => 1,
            UndeliverableCode::QueueDepthExceeded => 2,
        }
    }

    fn from_wire(raw: u8) -> anyhow::Result<UndeliverableCode> {
        match raw {
            0 => Ok(UndeliverableCode::Unspecified),
            1 => Ok(UndeliverableCode::Expired),
            2 => Ok(UndeliverableCode::QueueDepthExceeded),
            n => bail!("unknown undeliverable code {}", n),
        }
    }
}

/// A queue-layer protocol message. These travel as payload inside regular data frames of the
///  owning stream; the queue layer's sequence numbers are independent of the stream's.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueMsg {
    Request {
        substream_id: u16,
        source_name: String,
    },
    Refresh {
        substream_id: u16,
        source_name: String,
        /// highest queue sequence number the responder has received from the requester -
        ///  drives replay-on-reconnect on the requester side
        last_in_seq_num: SeqNum,
        last_out_seq_num: SeqNum,
    },
    Status {
        substream_id: u16,
        open: bool,
    },
    Data {
        substream_id: u16,
        seq_num: SeqNum,
        identifier: i64,
        source_name: String,
        dest_name: String,
        expiry: Expiry,
        possible_duplicate: bool,
        payload: Vec<u8>,
    },
    Ack {
        substream_id: u16,
        seq_num: SeqNum,
        identifier: i64,
        source_name: String,
        dest_name: String,
    },
    DeadLetter {
        substream_id: u16,
        seq_num: SeqNum,
        identifier: i64,
        /// reversed relative to the original data message: the dead letter travels back
        ///  towards the sender
        source_name: String,
        dest_name: String,
        code: UndeliverableCode,
        possible_duplicate: bool,
    },
    Close {
        substream_id: u16,
    },
}

impl QueueMsg {
    pub fn substream_id(&self) -> u16 {
        match self {
            QueueMsg::Request { substream_id, .. } => *substream_id,
            QueueMsg::Refresh { substream_id, .. } => *substream_id,
            QueueMsg::Status { substream_id, .. } => *substream_id,
            QueueMsg::Data { substream_id, .. } => *substream_id,
            QueueMsg::Ack { substream_id, .. } => *substream_id,
            QueueMsg::DeadLetter { substream_id, .. } => *substream_id,
            QueueMsg::Close { substream_id } => *substream_id,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        match self {
            QueueMsg::Request { substream_id, source_name } => {
                buf.put_u8(QM_REQUEST);
                buf.put_u16(*substream_id);
                ser_name(buf, source_name);
            }
            QueueMsg::Refresh { substream_id, source_name, last_in_seq_num, last_out_seq_num } => {
                buf.put_u8(QM_REFRESH);
                buf.put_u16(*substream_id);
                ser_name(buf, source_name);
                buf.put_u32(last_in_seq_num.to_raw());
                buf.put_u32(last_out_seq_num.to_raw());
            }
            QueueMsg::Status { substream_id, open } => {
                buf.put_u8(QM_STATUS);
                buf.put_u16(*substream_id);
                buf.put_u8(if *open { 1 } else { 0 });
            }
            QueueMsg::Data { substream_id, seq_num, identifier, source_name, dest_name, expiry, possible_duplicate, payload } => {
                buf.put_u8(QM_DATA);
                buf.put_u8(if *possible_duplicate { FLAG_POSSIBLE_DUPLICATE } else { 0 });
                buf.put_u16(*substream_id);
                buf.put_u32(seq_num.to_raw());
                buf.put_i64(*identifier);
                ser_name(buf, source_name);
                ser_name(buf, dest_name);
                buf.put_i64(expiry.to_wire());
                buf.put_slice(payload);
            }
            QueueMsg::Ack { substream_id, seq_num, identifier, source_name, dest_name } => {
                buf.put_u8(QM_ACK);
                buf.put_u16(*substream_id);
                buf.put_u32(seq_num.to_raw());
                buf.put_i64(*identifier);
                ser_name(buf, source_name);
                ser_name(buf, dest_name);
            }
            QueueMsg::DeadLetter { substream_id, seq_num, identifier, source_name, dest_name, code, possible_duplicate } => {
                buf.put_u8(QM_DEAD_LETTER);
                buf.put_u8(if *possible_duplicate { FLAG_POSSIBLE_DUPLICATE } else { 0 });
                buf.put_u16(*substream_id);
                buf.put_u32(seq_num.to_raw());
                buf.put_i64(*identifier);
                ser_name(buf, source_name);
                ser_name(buf, dest_name);
                buf.put_u8(code.to_wire());
            }
            QueueMsg::Close { substream_id } => {
                buf.put_u8(QM_CLOSE);
                buf.put_u16(*substream_id);
            }
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<QueueMsg> {
        let opcode = buf.try_get_u8()?;

        match opcode {
            QM_REQUEST => {
                let substream_id = buf.try_get_u16()?;
                let source_name = deser_name(buf)?;
                Ok(QueueMsg::Request { substream_id, source_name })
            }
            QM_REFRESH => {
                let substream_id = buf.try_get_u16()?;
                let source_name = deser_name(buf)?;
                let last_in_seq_num = SeqNum::from_raw(buf.try_get_u32()?);
                let last_out_seq_num = SeqNum::from_raw(buf.try_get_u32()?);
                Ok(QueueMsg::Refresh { substream_id, source_name, last_in_seq_num, last_out_seq_num })
            }
            QM_STATUS => {
                let substream_id = buf.try_get_u16()?;
                let open = buf.try_get_u8()? != 0;
                Ok(QueueMsg::Status { substream_id, open })
            }
            QM_DATA => {
                let flags = buf.try_get_u8()?;
                let substream_id = buf.try_get_u16()?;
                let seq_num = SeqNum::from_raw(buf.try_get_u32()?);
                let identifier = buf.try_get_i64()?;
                let source_name = deser_name(buf)?;
                let dest_name = deser_name(buf)?;
                let expiry = Expiry::from_wire(buf.try_get_i64()?)?;

                let mut payload = vec![0; buf.remaining()];
                buf.copy_to_slice(&mut payload);

                Ok(QueueMsg::Data {
                    substream_id,
                    seq_num,
                    identifier,
                    source_name,
                    dest_name,
                    expiry,
                    possible_duplicate: flags & FLAG_POSSIBLE_DUPLICATE != 0,
                    payload,
                })
            }
            QM_ACK => {
                let substream_id = buf.try_get_u16()?;
                let seq_num = SeqNum::from_raw(buf.try_get_u32()?);
                let identifier = buf.try_get_i64()?;
                let source_name = deser_name(buf)?;
                let dest_name = deser_name(buf)?;
                Ok(QueueMsg::Ack { substream_id, seq_num, identifier, source_name, dest_name })
            }
            QM_DEAD_LETTER => {
                let flags = buf.try_get_u8()?;
                let substream_id = buf.try_get_u16()?;
                let seq_num = SeqNum::from_raw(buf.try_get_u32()?);
                let identifier = buf.try_get_i64()?;
                let source_name = deser_name(buf)?;
                let dest_name = deser_name(buf)?;
                let code = UndeliverableCode::from_wire(buf.try_get_u8()?)?;
                Ok(QueueMsg::DeadLetter {
                    substream_id,
                    seq_num,
                    identifier,
                    source_name,
                    dest_name,
                    code,
                    possible_duplicate: flags & FLAG_POSSIBLE_DUPLICATE != 0,
                })
            }
            QM_CLOSE => {
                let substream_id = buf.try_get_u16()?;
                Ok(QueueMsg::Close { substream_id })
            }
            _ => bail!("unknown queue message opcode {:#x}", opcode),
        }
    }
}

/// queue names go on the wire as a one-byte length prefix plus UTF-8 bytes
fn ser_name(buf: &mut impl BufMut, name: &str) {
    debug_assert!(name.len() <= u8::MAX as usize);
    buf.put_u8(name.len() as u8);
    buf.put_slice(name.as_bytes());
}

fn deser_name(buf: &mut impl Buf) -> anyhow::Result<String> {
    let len = buf.try_get_u8()? as usize;
    if buf.remaining() < len {
        bail!("truncated queue name");
    }
    let mut raw = vec![0; len];
    buf.copy_to_slice(&mut raw);
    Ok(String::from_utf8(raw)?)
}
