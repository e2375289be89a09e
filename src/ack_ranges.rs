use std::collections::BTreeMap;
use std::ops::Bound::Included;

/// The maximum number of ranges that fit into a single ACK frame - if more gaps accumulate,
///  the overflow is reported in a later frame once the first batch is resolved.
pub const MAX_RANGES_PER_FRAME: usize = 255;

/// A sparse ordered set of inclusive sequence-number ranges, used both for selective
///  acknowledgement and for NAK signalling.
///
/// Ranges are coalesced on insert, so the set never contains adjacent or overlapping entries.
/// Stored as `start -> inclusive end` over the raw sequence numbers; the send and receive
///  windows keep live ranges close together, so raw ordering is sufficient here.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AckRangeSet(BTreeMap<u32, u32>);

impl AckRangeSet {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn clear(&mut self) {
        self.0.clear()
    }

    pub fn contains(&self, x: u32) -> bool {
        self.pred(x).is_some_and(|(_, end)| end >= x)
    }

    pub fn insert_one(&mut self, x: u32) {
        self.insert(x, x);
    }

    /// insert the inclusive range `start..=end`, merging with overlapping or adjacent ranges
    pub fn insert(&mut self, mut start: u32, mut end: u32) {
        debug_assert!(start <= end);

        if let Some((pred_start, pred_end)) = self.pred(start) {
            if pred_end >= end {
                return; // wholly contained
            }
            if pred_end != u32::MAX && pred_end + 1 >= start {
                // extend overlapping / adjacent predecessor
                self.0.remove(&pred_start);
                start = pred_start;
            }
        }

        while let Some((succ_start, succ_end)) = self.succ(start) {
            if end != u32::MAX && succ_start > end + 1 {
                break;
            }
            // overlapping / adjacent successor
            self.0.remove(&succ_start);
            end = end.max(succ_end);
        }

        self.0.insert(start, end);
    }

    /// remove everything at or below the given sequence number (used when the cumulative
    ///  ack point advances past recorded gaps)
    pub fn remove_up_to(&mut self, x: u32) {
        let affected: Vec<(u32, u32)> = self.0
            .range(..=x)
            .map(|(&s, &e)| (s, e))
            .collect();

        for (start, end) in affected {
            self.0.remove(&start);
            if end > x {
                self.0.insert(x + 1, end);
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.0.iter().map(|(&s, &e)| (s, e))
    }

    /// the first `MAX_RANGES_PER_FRAME` ranges, for encoding into a single ACK frame
    pub fn iter_bounded(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.iter().take(MAX_RANGES_PER_FRAME)
    }

    /// closest range beginning at or before `x`
    fn pred(&self, x: u32) -> Option<(u32, u32)> {
        self.0
            .range((Included(0), Included(x)))
            .next_back()
            .map(|(&s, &e)| (s, e))
    }

    /// closest range beginning after `x`
    fn succ(&self, x: u32) -> Option<(u32, u32)> {
        self.0
            .range(x.wrapping_add(1)..)
            .next()
            .map(|(&s, &e)| (s, e))
    }
}
