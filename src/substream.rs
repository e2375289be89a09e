use std::sync::Arc;

use anyhow::bail;
use bytes::BytesMut;
use tracing::{debug, warn};

use crate::persist::PersistenceLog;
use crate::queue_msg::{Expiry, QueueMsg, UndeliverableCode};
use crate::seq_num::SeqNum;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubstreamState {
    NotOpen,
    WaitingRefresh,
    Open,
}

/// What a freshly received substream refresh asks the parent stream to do: deliver locally
///  synthesized acks for messages the peer had confirmed before a disconnect, and put the
///  unconfirmed remainder back on the wire.
pub struct RefreshActions {
    pub synthesized_acks: Vec<QueueMsg>,
    pub retransmits: Vec<QueueMsg>,
}

/// A named queue multiplexed inside a tunnel stream, with its own sequence counters layered
///  on top of the stream's. This gives exactly-once delivery within the queue on top of the
///  stream's at-least-once guarantee.
///
/// Owned by the parent stream's substream table and protected by the parent's lock; all
///  methods return the queue messages to send rather than sending them, so the parent stays
///  in charge of framing and transmission.
pub struct TunnelSubstream {
    substream_id: u16,
    queue_name: String,
    state: SubstreamState,
    last_out_seq_num: SeqNum,
    last_in_seq_num: SeqNum,
    persistence: Option<Arc<dyn PersistenceLog>>,
}

impl TunnelSubstream {
    /// Requester side: create the substream and the open request to send. Sequence counters
    ///  resume from the persistence log if there is one.
    pub fn open(
        substream_id: u16,
        queue_name: String,
        persistence: Option<Arc<dyn PersistenceLog>>,
    ) -> anyhow::Result<(TunnelSubstream, QueueMsg)> {
        let (last_out_seq_num, last_in_seq_num) = match &persistence {
            Some(log) => log.last_seq_nums()?,
            None => (SeqNum::ZERO, SeqNum::ZERO),
        };

        let request = QueueMsg::Request {
            substream_id,
            source_name: queue_name.clone(),
        };
        let substream = TunnelSubstream {
            substream_id,
            queue_name,
            state: SubstreamState::WaitingRefresh,
            last_out_seq_num,
            last_in_seq_num,
            persistence,
        };
        Ok((substream, request))
    }

    /// Responder side: accept a peer's open request. The refresh reports our last-received
    ///  sequence number, which is what drives the requester's replay.
    pub fn accept(
        substream_id: u16,
        queue_name: String,
        persistence: Option<Arc<dyn PersistenceLog>>,
    ) -> anyhow::Result<(TunnelSubstream, QueueMsg)> {
        let (last_out_seq_num, last_in_seq_num) = match &persistence {
            Some(log) => log.last_seq_nums()?,
            None => (SeqNum::ZERO, SeqNum::ZERO),
        };

        let refresh = QueueMsg::Refresh {
            substream_id,
            source_name: queue_name.clone(),
            last_in_seq_num,
            last_out_seq_num,
        };
        let substream = TunnelSubstream {
            substream_id,
            queue_name,
            state: SubstreamState::Open,
            last_out_seq_num,
            last_in_seq_num,
            persistence,
        };
        Ok((substream, refresh))
    }

    pub fn substream_id(&self) -> u16 {
        self.substream_id
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn state(&self) -> SubstreamState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == SubstreamState::Open
    }

    /// The peer's refresh arrived: open up, then reconcile the persistence log against the
    ///  sequence number the peer reports as received.
    ///
    /// Everything in the log at or below that number was delivered - the peer's ack just
    ///  never reached us - so an ack is synthesized locally and the record freed. Everything
    ///  above it is retransmitted exactly once, flagged possible-duplicate if it had been on
    ///  the wire before.
    pub fn handle_refresh(&mut self, peer_last_in_seq_num: SeqNum) -> anyhow::Result<RefreshActions> {
        if self.state != SubstreamState::WaitingRefresh {
            bail!("substream {} received a refresh in state {:?}", self.substream_id, self.state);
        }
        self.state = SubstreamState::Open;

        let Some(log) = self.persistence.clone() else {
            return Ok(RefreshActions { synthesized_acks: Vec::new(), retransmits: Vec::new() });
        };

        let mut synthesized_acks = Vec::new();
        for record in log.release_up_to(peer_last_in_seq_num)? {
            match deser_logged(&record.msg)? {
                QueueMsg::Data { substream_id, seq_num, identifier, source_name, dest_name, .. } => {
                    // the ack travels back towards us, so the names flip
                    synthesized_acks.push(QueueMsg::Ack {
                        substream_id,
                        seq_num,
                        identifier,
                        source_name: dest_name,
                        dest_name: source_name,
                    });
                }
                other => bail!("persistence log contained a non-data message: {:?}", other),
            }
        }

        let mut retransmits = Vec::new();
        for record in log.replay_since(peer_last_in_seq_num)? {
            match deser_logged(&record.msg)? {
                QueueMsg::Data { substream_id, seq_num, identifier, source_name, dest_name, expiry, payload, .. } => {
                    retransmits.push(QueueMsg::Data {
                        substream_id,
                        seq_num,
                        identifier,
                        source_name,
                        dest_name,
                        expiry,
                        possible_duplicate: record.transmitted,
                        payload,
                    });
                }
                other => bail!("persistence log contained a non-data message: {:?}", other),
            }
        }

        debug!("substream {} open: {} synthesized acks, {} replayed messages",
            self.substream_id, synthesized_acks.len(), retransmits.len());
        Ok(RefreshActions { synthesized_acks, retransmits })
    }

    /// Build the next outbound queue data message and log it before it goes anywhere near
    ///  the wire.
    pub fn next_data_msg(
        &mut self,
        dest_name: String,
        identifier: i64,
        expiry: Expiry,
        payload: Vec<u8>,
    ) -> anyhow::Result<QueueMsg> {
        if self.state != SubstreamState::Open {
            bail!("substream {} is not open", self.substream_id);
        }

        let seq_num = self.last_out_seq_num.next();
        let msg = QueueMsg::Data {
            substream_id: self.substream_id,
            seq_num,
            identifier,
            source_name: self.queue_name.clone(),
            dest_name,
            expiry,
            possible_duplicate: false,
            payload,
        };

        if let Some(log) = &self.persistence {
            let mut buf = BytesMut::new();
            msg.ser(&mut buf);
            log.append(seq_num, &buf)?;
        }

        self.last_out_seq_num = seq_num;
        Ok(msg)
    }

    /// the parent stream put the frame carrying this queue message on the wire
    pub fn on_transmitted(&self, seq_num: SeqNum) -> anyhow::Result<()> {
        if let Some(log) = &self.persistence {
            log.mark_transmitted(seq_num)?;
        }
        Ok(())
    }

    /// Queue data arrived. Returns whether to deliver it to the application (duplicates are
    ///  suppressed but still re-acked, in case our earlier ack was lost) and the ack to send.
    pub fn handle_data(&mut self, msg: &QueueMsg) -> anyhow::Result<(bool, QueueMsg)> {
        let QueueMsg::Data { substream_id, seq_num, identifier, source_name, dest_name, .. } = msg else {
            bail!("not a queue data message");
        };

        let deliver = seq_num.is_after(self.last_in_seq_num);
        if deliver {
            if *seq_num != self.last_in_seq_num.next() {
                // the underlying stream is ordered and reliable, so this means the peer's
                //  counter and ours diverged
                warn!("substream {}: expected queue seq {} but received {}",
                    self.substream_id, self.last_in_seq_num.next(), seq_num);
            }
            self.last_in_seq_num = *seq_num;
            if let Some(log) = &self.persistence {
                log.save_last_in_seq_num(*seq_num)?;
            }
        }
        else {
            debug!("substream {}: suppressing duplicate queue seq {}", self.substream_id, seq_num);
        }

        let ack = QueueMsg::Ack {
            substream_id: *substream_id,
            seq_num: *seq_num,
            identifier: *identifier,
            source_name: dest_name.clone(),
            dest_name: source_name.clone(),
        };
        Ok((deliver, ack))
    }

    /// the peer confirmed delivery; the record leaves the log
    pub fn handle_ack(&mut self, seq_num: SeqNum) -> anyhow::Result<()> {
        if let Some(log) = &self.persistence {
            log.remove(seq_num)?;
        }
        Ok(())
    }

    /// A locally queued message expired before it could be transmitted: drop it from the log
    ///  and build the dead letter the application sees, names reversed as if the peer had
    ///  refused it.
    pub fn expire_local(
        &mut self,
        seq_num: SeqNum,
        identifier: i64,
        dest_name: String,
        possible_duplicate: bool,
    ) -> anyhow::Result<QueueMsg> {
        if let Some(log) = &self.persistence {
            log.remove(seq_num)?;
        }

        Ok(QueueMsg::DeadLetter {
            substream_id: self.substream_id,
            seq_num,
            identifier,
            source_name: dest_name,
            dest_name: self.queue_name.clone(),
            code: UndeliverableCode::Expired,
            possible_duplicate,
        })
    }

    /// a dead letter from the peer also frees the logged record
    pub fn handle_dead_letter(&mut self, seq_num: SeqNum) -> anyhow::Result<()> {
        if let Some(log) = &self.persistence {
            log.remove(seq_num)?;
        }
        Ok(())
    }

    pub fn close_msg(&mut self) -> QueueMsg {
        self.state = SubstreamState::NotOpen;
        QueueMsg::Close {
            substream_id: self.substream_id,
        }
    }
}

fn deser_logged(raw: &[u8]) -> anyhow::Result<QueueMsg> {
    let mut buf: &[u8] = raw;
    QueueMsg::deser(&mut buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::MemoryPersistenceLog;

    fn seq(raw: u32) -> SeqNum {
        SeqNum::from_raw(raw)
    }

    fn data_msg(substream_id: u16, seq_num: u32, payload: &[u8]) -> QueueMsg {
        QueueMsg::Data {
            substream_id,
            seq_num: seq(seq_num),
            identifier: seq_num as i64,
            source_name: "PEER".to_string(),
            dest_name: "ME".to_string(),
            expiry: Expiry::None,
            possible_duplicate: false,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn test_open_then_refresh_without_persistence() {
        let (mut substream, request) = TunnelSubstream::open(3, "ME".to_string(), None).unwrap();
        assert_eq!(request, QueueMsg::Request { substream_id: 3, source_name: "ME".to_string() });
        assert_eq!(substream.state(), SubstreamState::WaitingRefresh);

        let actions = substream.handle_refresh(seq(0)).unwrap();
        assert!(actions.synthesized_acks.is_empty());
        assert!(actions.retransmits.is_empty());
        assert!(substream.is_open());
    }

    #[test]
    fn test_refresh_in_wrong_state_rejected() {
        let (mut substream, _) = TunnelSubstream::open(3, "ME".to_string(), None).unwrap();
        substream.handle_refresh(seq(0)).unwrap();

        assert!(substream.handle_refresh(seq(0)).is_err());
    }

    #[test]
    fn test_outbound_sequencing_and_logging() {
        let log = Arc::new(MemoryPersistenceLog::new());
        let (mut substream, _) = TunnelSubstream::open(3, "ME".to_string(), Some(log.clone())).unwrap();
        substream.handle_refresh(seq(0)).unwrap();

        let msg1 = substream.next_data_msg("PEER".to_string(), 7, Expiry::None, vec![1]).unwrap();
        let msg2 = substream.next_data_msg("PEER".to_string(), 8, Expiry::None, vec![2]).unwrap();

        assert!(matches!(msg1, QueueMsg::Data { seq_num, .. } if seq_num == seq(1)));
        assert!(matches!(msg2, QueueMsg::Data { seq_num, .. } if seq_num == seq(2)));
        assert_eq!(log.replay_since(seq(0)).unwrap().len(), 2);

        substream.handle_ack(seq(1)).unwrap();
        assert_eq!(log.replay_since(seq(0)).unwrap().len(), 1);
    }

    #[test]
    fn test_replay_on_reconnect() {
        let log = Arc::new(MemoryPersistenceLog::new());

        // first connection: three messages sent, peer confirmed only the first
        {
            let (mut substream, _) = TunnelSubstream::open(3, "ME".to_string(), Some(log.clone())).unwrap();
            substream.handle_refresh(seq(0)).unwrap();

            for identifier in 1..=3 {
                let msg = substream.next_data_msg("PEER".to_string(), identifier, Expiry::None, vec![identifier as u8]).unwrap();
                if let QueueMsg::Data { seq_num, .. } = msg {
                    substream.on_transmitted(seq_num).unwrap();
                }
            }
            substream.handle_ack(seq(1)).unwrap();
        }

        // reconnect: the peer's refresh says it received up to seq 2
        let (mut substream, _) = TunnelSubstream::open(3, "ME".to_string(), Some(log.clone())).unwrap();
        let actions = substream.handle_refresh(seq(2)).unwrap();

        // seq 2 was delivered but never acked to us: ack synthesized, names flipped
        assert_eq!(actions.synthesized_acks.len(), 1);
        assert_eq!(
            actions.synthesized_acks[0],
            QueueMsg::Ack {
                substream_id: 3,
                seq_num: seq(2),
                identifier: 2,
                source_name: "PEER".to_string(),
                dest_name: "ME".to_string(),
            },
        );

        // seq 3 was on the wire but unconfirmed: retransmitted once, flagged possible-duplicate
        assert_eq!(actions.retransmits.len(), 1);
        assert!(matches!(
            &actions.retransmits[0],
            QueueMsg::Data { seq_num, possible_duplicate: true, .. } if *seq_num == seq(3)
        ));

        // nothing already acknowledged before the disconnect is replayed
        assert_eq!(log.replay_since(seq(0)).unwrap().len(), 1);

        // a second refresh cycle must not replay seq 3 again once it is acked
        substream.handle_ack(seq(3)).unwrap();
        assert!(log.replay_since(seq(0)).unwrap().is_empty());
    }

    #[test]
    fn test_counters_resume_from_log() {
        let log = Arc::new(MemoryPersistenceLog::new());
        log.append(seq(5), b"x").unwrap();
        log.save_last_in_seq_num(seq(9)).unwrap();
        log.remove(seq(5)).unwrap();

        let (mut substream, _) = TunnelSubstream::open(3, "ME".to_string(), Some(log)).unwrap();
        substream.handle_refresh(seq(5)).unwrap();

        let msg = substream.next_data_msg("PEER".to_string(), 1, Expiry::None, vec![]).unwrap();
        assert!(matches!(msg, QueueMsg::Data { seq_num, .. } if seq_num == seq(6)));

        // inbound seq 9 was already delivered before the restart
        let (deliver, _) = substream.handle_data(&data_msg(3, 9, b"dup")).unwrap();
        assert!(!deliver);
        let (deliver, _) = substream.handle_data(&data_msg(3, 10, b"new")).unwrap();
        assert!(deliver);
    }

    #[test]
    fn test_inbound_delivery_and_duplicate_suppression() {
        let (mut substream, _) = TunnelSubstream::accept(3, "ME".to_string(), None).unwrap();

        let (deliver, ack) = substream.handle_data(&data_msg(3, 1, b"a")).unwrap();
        assert!(deliver);
        assert_eq!(
            ack,
            QueueMsg::Ack {
                substream_id: 3,
                seq_num: seq(1),
                identifier: 1,
                source_name: "ME".to_string(),
                dest_name: "PEER".to_string(),
            },
        );

        // the same message again: no second delivery, but the ack is repeated
        let (deliver, ack) = substream.handle_data(&data_msg(3, 1, b"a")).unwrap();
        assert!(!deliver);
        assert!(matches!(ack, QueueMsg::Ack { seq_num, .. } if seq_num == seq(1)));
    }

    #[test]
    fn test_expire_local() {
        let log = Arc::new(MemoryPersistenceLog::new());
        let (mut substream, _) = TunnelSubstream::open(3, "ME".to_string(), Some(log.clone())).unwrap();
        substream.handle_refresh(seq(0)).unwrap();

        substream.next_data_msg("PEER".to_string(), 7, Expiry::Immediate, vec![1]).unwrap();

        let dead_letter = substream.expire_local(seq(1), 7, "PEER".to_string(), false).unwrap();
        assert_eq!(
            dead_letter,
            QueueMsg::DeadLetter {
                substream_id: 3,
                seq_num: seq(1),
                identifier: 7,
                source_name: "PEER".to_string(),
                dest_name: "ME".to_string(),
                code: UndeliverableCode::Expired,
                possible_duplicate: false,
            },
        );
        assert!(log.replay_since(seq(0)).unwrap().is_empty());
    }
}
