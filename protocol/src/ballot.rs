//! Ballots totally order every operation in the protocol.

use core::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Stable, cluster-unique identifier of a proposer. Breaks ties between
/// ballots with equal counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ProposerId(pub u64);

impl fmt::Display for ProposerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotone per-proposer epoch, bumped by garbage collection. Acceptors can
/// be told the current ages so they reject messages from stale proposers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Age(pub u64);

impl Age {
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Age {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier attached to every prepare and accept.
///
/// Ordering is lexicographic on (counter, proposer id), so ballots from
/// distinct proposers never compare equal unless both fields match.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Ballot {
    pub counter: u64,
    pub id: ProposerId,
}

impl Ballot {
    /// The ballot of a register that has never been promised or accepted.
    pub const ZERO: Self = Self {
        counter: 0,
        id: ProposerId(0),
    };

    #[must_use]
    pub fn new(counter: u64, id: ProposerId) -> Self {
        Self { counter, id }
    }

    #[must_use]
    pub fn counter(&self) -> u64 {
        self.counter
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl fmt::Display for Ballot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.counter, self.id)
    }
}
