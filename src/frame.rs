use anyhow::bail;
use bitflags::bitflags;
use bytes::{Buf, BufMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;

use crate::ack_ranges::AckRangeSet;
use crate::cos::ClassOfService;
use crate::seq_num::SeqNum;

pub const OP_OPEN_REQUEST: u8 = 0x01;
pub const OP_OPEN_REFRESH: u8 = 0x02;
pub const OP_DATA: u8 = 0x03;
pub const OP_RETRANSMIT: u8 = 0x04;
pub const OP_ACK: u8 = 0x05;
pub const OP_CLOSE: u8 = 0x06;

/// offset of the sequence number inside a serialized data frame - patched in place when the
///  number is assigned at transmit time
const SEQ_NUM_OFFSET: usize = 2;

/// serialized length of a data frame header without a fragment header
pub const DATA_HEADER_LEN: usize = 6;
/// serialized length of a data frame header including the fragment header
pub const DATA_FRAG_HEADER_LEN: usize = DATA_HEADER_LEN + 4 + 4 + 2 + 1;

/// Space reserved at the start of every pooled frame buffer. Sized for the largest header so
///  a buffer can back any frame kind.
pub const FRAME_HEADER_RESERVE: usize = DATA_FRAG_HEADER_LEN;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DataFlags: u8 {
        const FRAGMENTED   = 0x01;
        const MSG_COMPLETE = 0x02;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AckFlags: u8 {
        /// this ACK frame doubles as a FIN for the close handshake
        const FIN = 0x01;
        /// final FIN-ACK, last frame of the close handshake
        const FINAL_FIN_ACK = 0x02;
    }
}

/// Per-fragment metadata carried by data frames of a fragmented message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub total_msg_len: u32,
    /// 1-based
    pub fragment_number: u32,
    pub msg_id: u16,
    /// container / content tag of the original message, restored on reassembly
    pub container_type: u8,
}

/// A protocol frame as it goes over the channel. The byte layout is owned by this module;
///  everything above deals in these structured values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    OpenRequest {
        stream_id: i32,
        domain_type: u8,
        service_id: u16,
        cos: ClassOfService,
    },
    OpenRefresh {
        stream_id: i32,
        ok: bool,
        cos: ClassOfService,
    },
    Data {
        seq_num: SeqNum,
        retransmit: bool,
        msg_complete: bool,
        fragment: Option<FragmentHeader>,
        payload: Vec<u8>,
    },
    Ack {
        seq_num: SeqNum,
        recv_window: u32,
        flags: AckFlags,
        ack_ranges: AckRangeSet,
        nak_ranges: AckRangeSet,
    },
    Close {
        stream_id: i32,
    },
}

impl Frame {
    pub fn ser(&self, buf: &mut impl BufMut) {
        match self {
            Frame::OpenRequest { stream_id, domain_type, service_id, cos } => {
                buf.put_u8(OP_OPEN_REQUEST);
                buf.put_u8(0);
                buf.put_i32(*stream_id);
                buf.put_u8(*domain_type);
                buf.put_u16(*service_id);
                cos.ser(buf);
            }
            Frame::OpenRefresh { stream_id, ok, cos } => {
                buf.put_u8(OP_OPEN_REFRESH);
                buf.put_u8(if *ok { 1 } else { 0 });
                buf.put_i32(*stream_id);
                cos.ser(buf);
            }
            Frame::Data { seq_num, retransmit, msg_complete, fragment, payload } => {
                ser_data_header(buf, *seq_num, *retransmit, *msg_complete, *fragment);
                buf.put_slice(payload);
            }
            Frame::Ack { seq_num, recv_window, flags, ack_ranges, nak_ranges } => {
                buf.put_u8(OP_ACK);
                buf.put_u8(flags.bits());
                buf.put_u32(seq_num.to_raw());
                buf.put_u32(*recv_window);
                ser_ranges(buf, ack_ranges);
                ser_ranges(buf, nak_ranges);
            }
            Frame::Close { stream_id } => {
                buf.put_u8(OP_CLOSE);
                buf.put_u8(0);
                buf.put_i32(*stream_id);
            }
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Frame> {
        let opcode = buf.try_get_u8()?;
        let flags = buf.try_get_u8()?;

        match opcode {
            OP_OPEN_REQUEST => {
                let stream_id = buf.try_get_i32()?;
                let domain_type = buf.try_get_u8()?;
                let service_id = buf.try_get_u16()?;
                let cos = ClassOfService::deser(buf)?;
                Ok(Frame::OpenRequest { stream_id, domain_type, service_id, cos })
            }
            OP_OPEN_REFRESH => {
                let stream_id = buf.try_get_i32()?;
                let cos = ClassOfService::deser(buf)?;
                Ok(Frame::OpenRefresh { stream_id, ok: flags & 1 != 0, cos })
            }
            OP_DATA | OP_RETRANSMIT => {
                let data_flags = DataFlags::from_bits(flags)
                    .ok_or_else(|| anyhow::anyhow!("invalid data frame flags {:#x}", flags))?;
                let seq_num = SeqNum::from_raw(buf.try_get_u32()?);

                let fragment = if data_flags.contains(DataFlags::FRAGMENTED) {
                    Some(FragmentHeader {
                        total_msg_len: buf.try_get_u32()?,
                        fragment_number: buf.try_get_u32()?,
                        msg_id: buf.try_get_u16()?,
                        container_type: buf.try_get_u8()?,
                    })
                }
                else {
                    None
                };

                let mut payload = vec![0; buf.remaining()];
                buf.copy_to_slice(&mut payload);

                Ok(Frame::Data {
                    seq_num,
                    retransmit: opcode == OP_RETRANSMIT,
                    msg_complete: data_flags.contains(DataFlags::MSG_COMPLETE),
                    fragment,
                    payload,
                })
            }
            OP_ACK => {
                let ack_flags = AckFlags::from_bits(flags)
                    .ok_or_else(|| anyhow::anyhow!("invalid ack frame flags {:#x}", flags))?;
                let seq_num = SeqNum::from_raw(buf.try_get_u32()?);
                let recv_window = buf.try_get_u32()?;
                let ack_ranges = deser_ranges(buf)?;
                let nak_ranges = deser_ranges(buf)?;
                Ok(Frame::Ack { seq_num, recv_window, flags: ack_flags, ack_ranges, nak_ranges })
            }
            OP_CLOSE => {
                let stream_id = buf.try_get_i32()?;
                Ok(Frame::Close { stream_id })
            }
            _ => bail!("unknown frame opcode {:#x}", opcode),
        }
    }
}

/// Serialize a data frame header. Used both by `Frame::ser` and by the submit path, which
///  writes the header into a pooled buffer with a placeholder sequence number that is
///  patched at transmit time.
pub fn ser_data_header(
    buf: &mut impl BufMut,
    seq_num: SeqNum,
    retransmit: bool,
    msg_complete: bool,
    fragment: Option<FragmentHeader>,
) {
    let mut flags = DataFlags::empty();
    if msg_complete {
        flags |= DataFlags::MSG_COMPLETE;
    }
    if fragment.is_some() {
        flags |= DataFlags::FRAGMENTED;
    }

    buf.put_u8(if retransmit { OP_RETRANSMIT } else { OP_DATA });
    buf.put_u8(flags.bits());
    buf.put_u32(seq_num.to_raw());
    if let Some(frag) = fragment {
        buf.put_u32(frag.total_msg_len);
        buf.put_u32(frag.fragment_number);
        buf.put_u16(frag.msg_id);
        buf.put_u8(frag.container_type);
    }
}

/// Patch the sequence number of an already-serialized data frame in place. Sequence numbers
///  are assigned at actual transmit time, not at submit time.
pub fn patch_seq_num(frame: &mut [u8], seq_num: SeqNum) {
    frame[SEQ_NUM_OFFSET..SEQ_NUM_OFFSET + 4].copy_from_slice(&seq_num.to_raw().to_be_bytes());
}

/// Rewrite the opcode of an already-serialized data frame to "retransmit", keeping
///  everything else (including the sequence number) intact.
pub fn set_retransmit_opcode(frame: &mut [u8]) {
    debug_assert!(frame[0] == OP_DATA || frame[0] == OP_RETRANSMIT);
    frame[0] = OP_RETRANSMIT;
}

fn ser_ranges(buf: &mut impl BufMut, ranges: &AckRangeSet) {
    let count = ranges.iter_bounded().count();
    buf.put_u8(count as u8);
    for (start, end) in ranges.iter_bounded() {
        buf.put_u32(start);
        buf.put_u32(end);
    }
}

fn deser_ranges(buf: &mut impl Buf) -> anyhow::Result<AckRangeSet> {
    let count = buf.try_get_u8()?;
    let mut ranges = AckRangeSet::new();
    for _ in 0..count {
        let start = buf.try_get_u32()?;
        let end = buf.try_get_u32()?;
        if start > end {
            bail!("invalid range {}..={} in ack frame", start, end);
        }
        ranges.insert(start, end);
    }
    Ok(ranges)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    fn ranges(pairs: &[(u32, u32)]) -> AckRangeSet {
        let mut result = AckRangeSet::new();
        for &(start, end) in pairs {
            result.insert(start, end);
        }
        result
    }

    #[rstest]
    #[case::data_plain(
        Frame::Data { seq_num: SeqNum::from_raw(7), retransmit: false, msg_complete: true, fragment: None, payload: vec![1,2,3] },
        vec![3, 2, 0,0,0,7, 1,2,3],
    )]
    #[case::data_retransmit(
        Frame::Data { seq_num: SeqNum::from_raw(259), retransmit: true, msg_complete: true, fragment: None, payload: vec![9] },
        vec![4, 2, 0,0,1,3, 9],
    )]
    #[case::data_fragment(
        Frame::Data {
            seq_num: SeqNum::from_raw(1),
            retransmit: false,
            msg_complete: false,
            fragment: Some(FragmentHeader { total_msg_len: 10000, fragment_number: 2, msg_id: 515, container_type: 5 }),
            payload: vec![8,8],
        },
        vec![3, 1, 0,0,0,1, 0,0,39,16, 0,0,0,2, 2,3, 5, 8,8],
    )]
    #[case::last_fragment(
        Frame::Data {
            seq_num: SeqNum::from_raw(2),
            retransmit: false,
            msg_complete: true,
            fragment: Some(FragmentHeader { total_msg_len: 300, fragment_number: 3, msg_id: 1, container_type: 0 }),
            payload: vec![],
        },
        vec![3, 3, 0,0,0,2, 0,0,1,44, 0,0,0,3, 0,1, 0],
    )]
    #[case::ack_empty(
        Frame::Ack { seq_num: SeqNum::from_raw(3), recv_window: 12288, flags: AckFlags::empty(), ack_ranges: ranges(&[]), nak_ranges: ranges(&[]) },
        vec![5, 0, 0,0,0,3, 0,0,48,0, 0, 0],
    )]
    #[case::ack_with_nak(
        Frame::Ack { seq_num: SeqNum::from_raw(3), recv_window: 100, flags: AckFlags::empty(), ack_ranges: ranges(&[]), nak_ranges: ranges(&[(4, 4)]) },
        vec![5, 0, 0,0,0,3, 0,0,0,100, 0, 1, 0,0,0,4, 0,0,0,4],
    )]
    #[case::ack_with_sel_ack(
        Frame::Ack { seq_num: SeqNum::from_raw(9), recv_window: 100, flags: AckFlags::empty(), ack_ranges: ranges(&[(11, 12), (15, 15)]), nak_ranges: ranges(&[(10, 10), (13, 14)]) },
        vec![5, 0, 0,0,0,9, 0,0,0,100, 2, 0,0,0,11, 0,0,0,12, 0,0,0,15, 0,0,0,15, 2, 0,0,0,10, 0,0,0,10, 0,0,0,13, 0,0,0,14],
    )]
    #[case::fin(
        Frame::Ack { seq_num: SeqNum::from_raw(17), recv_window: 0, flags: AckFlags::FIN, ack_ranges: ranges(&[]), nak_ranges: ranges(&[]) },
        vec![5, 1, 0,0,0,17, 0,0,0,0, 0, 0],
    )]
    #[case::final_fin_ack(
        Frame::Ack { seq_num: SeqNum::from_raw(18), recv_window: 0, flags: AckFlags::FINAL_FIN_ACK, ack_ranges: ranges(&[]), nak_ranges: ranges(&[]) },
        vec![5, 2, 0,0,0,18, 0,0,0,0, 0, 0],
    )]
    #[case::close(
        Frame::Close { stream_id: 5 },
        vec![6, 0, 0,0,0,5],
    )]
    fn test_ser_deser(#[case] frame: Frame, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        frame.ser(&mut buf);
        assert_eq!(buf.as_ref(), expected.as_slice());

        let mut b: &[u8] = &buf;
        let deser = Frame::deser(&mut b).unwrap();
        assert!(!b.has_remaining());
        assert_eq!(deser, frame);
    }

    #[test]
    fn test_open_request_roundtrip() {
        let frame = Frame::OpenRequest {
            stream_id: 5,
            domain_type: 199,
            service_id: 1,
            cos: ClassOfService::default(),
        };
        let mut buf = BytesMut::new();
        frame.ser(&mut buf);

        let mut b: &[u8] = &buf;
        assert_eq!(Frame::deser(&mut b).unwrap(), frame);
    }

    #[test]
    fn test_open_refresh_roundtrip() {
        let frame = Frame::OpenRefresh {
            stream_id: 5,
            ok: true,
            cos: ClassOfService::default(),
        };
        let mut buf = BytesMut::new();
        frame.ser(&mut buf);

        let mut b: &[u8] = &buf;
        assert_eq!(Frame::deser(&mut b).unwrap(), frame);
    }

    #[test]
    fn test_patch_seq_num() {
        let mut buf = BytesMut::new();
        ser_data_header(&mut buf, SeqNum::ZERO, false, true, None);
        buf.put_slice(&[1, 2, 3]);

        patch_seq_num(&mut buf, SeqNum::from_raw(0x01020304));
        assert_eq!(buf.as_ref(), &[3, 2, 1,2,3,4, 1,2,3]);
    }

    #[test]
    fn test_set_retransmit_opcode() {
        let mut buf = BytesMut::new();
        ser_data_header(&mut buf, SeqNum::from_raw(9), false, true, None);

        set_retransmit_opcode(&mut buf);
        assert_eq!(buf.as_ref(), &[4, 2, 0,0,0,9]);
    }

    #[rstest]
    #[case::unknown_opcode(vec![0x77, 0, 0,0,0,0])]
    #[case::truncated_ack(vec![5, 0, 0,0,0,3, 0,0])]
    #[case::invalid_range(vec![5, 0, 0,0,0,3, 0,0,0,0, 0, 1, 0,0,0,9, 0,0,0,4])]
    #[case::invalid_data_flags(vec![3, 0x80, 0,0,0,1])]
    fn test_deser_rejects(#[case] bytes: Vec<u8>) {
        let mut b: &[u8] = &bytes;
        assert!(Frame::deser(&mut b).is_err());
    }
}
