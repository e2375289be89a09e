use std::collections::BTreeMap;
use std::sync::Mutex;

#[cfg(test)] use mockall::automock;

use crate::seq_num::SeqNum;

/// A queue message sitting in the local log: its queue sequence number, whether it ever made
///  it onto the wire, and its serialized bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedRecord {
    pub seq_num: SeqNum,
    pub transmitted: bool,
    pub msg: Vec<u8>,
}

/// Local crash-recovery log for a substream's outbound queue messages.
///
/// Messages are appended before they are first transmitted and stay in the log until the
///  peer acknowledges them (or they expire locally). On reconnect the peer's refresh reports
///  the highest sequence number it received; [PersistenceLog::release_up_to] returns the
///  records that covers so acknowledgements can be synthesized for them, and
///  [PersistenceLog::replay_since] yields the rest for retransmission.
///
/// The on-disk format (if any) is the implementation's business; implementations are
///  synchronous because the reference usage is a small local file.
#[cfg_attr(test, automock)]
pub trait PersistenceLog: Send + Sync + 'static {
    fn append(&self, seq_num: SeqNum, msg: &[u8]) -> anyhow::Result<()>;

    fn mark_transmitted(&self, seq_num: SeqNum) -> anyhow::Result<()>;

    /// all records with a sequence number after the given one, in sequence order
    fn replay_since(&self, seq_num: SeqNum) -> anyhow::Result<Vec<PersistedRecord>>;

    /// remove all records up to and including the given sequence number, returning them
    fn release_up_to(&self, seq_num: SeqNum) -> anyhow::Result<Vec<PersistedRecord>>;

    /// remove a single record, e.g. when it expired before ever being acknowledged
    fn remove(&self, seq_num: SeqNum) -> anyhow::Result<()>;

    /// `(last outbound seq num in the log, last inbound seq num saved)` - the starting point
    ///  for the sequence counters when a substream re-opens over this log
    fn last_seq_nums(&self) -> anyhow::Result<(SeqNum, SeqNum)>;

    /// record the highest inbound queue sequence number delivered to the application, so the
    ///  refresh after a reconnect can tell the peer what we already have
    fn save_last_in_seq_num(&self, seq_num: SeqNum) -> anyhow::Result<()>;
}

/// In-memory implementation, for streams without crash recovery across process restarts and
///  for tests.
#[derive(Default)]
pub struct MemoryPersistenceLog {
    state: Mutex<MemoryLogState>,
}

#[derive(Default)]
struct MemoryLogState {
    records: BTreeMap<u32, (bool, Vec<u8>)>,
    last_out_seq_num: SeqNum,
    last_in_seq_num: SeqNum,
}

impl MemoryPersistenceLog {
    pub fn new() -> Self {
        Default::default()
    }
}

impl PersistenceLog for MemoryPersistenceLog {
    fn append(&self, seq_num: SeqNum, msg: &[u8]) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.records.insert(seq_num.to_raw(), (false, msg.to_vec()));
        state.last_out_seq_num = seq_num;
        Ok(())
    }

    fn mark_transmitted(&self, seq_num: SeqNum) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some((transmitted, _)) = state.records.get_mut(&seq_num.to_raw()) {
            *transmitted = true;
        }
        Ok(())
    }

    fn replay_since(&self, seq_num: SeqNum) -> anyhow::Result<Vec<PersistedRecord>> {
        let state = self.state.lock().unwrap();
        Ok(state.records
            .iter()
            .filter(|(&raw, _)| SeqNum::from_raw(raw).is_after(seq_num))
            .map(|(&raw, (transmitted, msg))| PersistedRecord {
                seq_num: SeqNum::from_raw(raw),
                transmitted: *transmitted,
                msg: msg.clone(),
            })
            .collect())
    }

    fn release_up_to(&self, seq_num: SeqNum) -> anyhow::Result<Vec<PersistedRecord>> {
        let mut state = self.state.lock().unwrap();
        let released: Vec<u32> = state.records
            .keys()
            .filter(|&&raw| SeqNum::from_raw(raw).is_at_or_before(seq_num))
            .copied()
            .collect();

        let mut result = Vec::with_capacity(released.len());
        for raw in released {
            if let Some((transmitted, msg)) = state.records.remove(&raw) {
                result.push(PersistedRecord {
                    seq_num: SeqNum::from_raw(raw),
                    transmitted,
                    msg,
                });
            }
        }
        Ok(result)
    }

    fn remove(&self, seq_num: SeqNum) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.records.remove(&seq_num.to_raw());
        Ok(())
    }

    fn last_seq_nums(&self) -> anyhow::Result<(SeqNum, SeqNum)> {
        let state = self.state.lock().unwrap();
        Ok((state.last_out_seq_num, state.last_in_seq_num))
    }

    fn save_last_in_seq_num(&self, seq_num: SeqNum) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.last_in_seq_num = seq_num;
        Ok(())
    }
}
