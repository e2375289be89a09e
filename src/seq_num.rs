use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

/// A frame sequence number with wrap-around semantics: 0 follows after `u32::MAX`.
///
/// NB: Because of the wrap-around there is no total order on sequence numbers - comparisons
///      are meaningful only between numbers that are close to each other (well within half the
///      number range), which the send / receive windows guarantee.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct SeqNum(u32);

impl Display for SeqNum {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SeqNum {
    pub const ZERO: SeqNum = SeqNum(0);

    pub fn from_raw(value: u32) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }

    pub fn next(&self) -> SeqNum {
        SeqNum(self.0.wrapping_add(1))
    }

    pub fn plus(&self, offset: u32) -> SeqNum {
        SeqNum(self.0.wrapping_add(offset))
    }

    /// Wrap-around aware comparison: interprets the difference as a signed number, so a
    ///  sequence number just past the wrap point compares greater than one just before it.
    pub fn cmp_wrapping(&self, other: SeqNum) -> Ordering {
        (self.0.wrapping_sub(other.0) as i32).cmp(&0)
    }

    pub fn is_after(&self, other: SeqNum) -> bool {
        self.cmp_wrapping(other) == Ordering::Greater
    }

    pub fn is_at_or_before(&self, other: SeqNum) -> bool {
        self.cmp_wrapping(other) != Ordering::Greater
    }
}
