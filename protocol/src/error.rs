//! Error kinds and structured `error_stack` context types.

use core::fmt;

use crate::ballot::Ballot;

/// Error kinds the protocol produces or propagates.
///
/// Operations return `error_stack::Report<ProtocolError>`; the kind is the
/// report context, so `Report::current_context` is the matcher. Wrapping a
/// failure with step provenance attaches a [`StepContext`] and leaves the
/// kind intact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// A stale ballot was observed; the conflicting acceptor's promise
    /// travels as a [`Promised`] attachment.
    Conflict,
    /// A register that was expected to be empty holds a value.
    NotEmpty,
    /// Too few acceptors responded to reach the configured quorum.
    QuorumFailure,
    /// Cancellation was observed. Never retried; cleanup still runs.
    Canceled,
    /// Network or serialization failure on the way to a node.
    Transport,
    /// An acceptor registration was already in the requested state.
    ConfigMismatch,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::Conflict => "ballot conflict",
            Self::NotEmpty => "register not empty",
            Self::QuorumFailure => "quorum not reached",
            Self::Canceled => "operation canceled",
            Self::Transport => "transport failure",
            Self::ConfigMismatch => "configuration already in requested state",
        };
        f.write_str(msg)
    }
}

impl core::error::Error for ProtocolError {}

/// Attachment carrying the promised ballot returned alongside a
/// [`ProtocolError::Conflict`], so proposers can fast-forward their counter.
#[derive(Debug, Clone, Copy)]
pub struct Promised(pub Ballot);

impl fmt::Display for Promised {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "promised ballot {}", self.0)
    }
}

/// Error context: which reconfiguration or garbage-collection step failed.
#[derive(Debug, Clone, Copy)]
pub struct StepContext {
    pub step: &'static str,
}

impl fmt::Display for StepContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "during {}", self.step)
    }
}

impl StepContext {
    pub const GROW_ADD_ACCEPTER: Self = Self {
        step: "grow step 1 (add accepter)",
    };
    pub const GROW_IDENTITY_READ: Self = Self {
        step: "grow step 2 (identity read)",
    };
    pub const GROW_ADD_PREPARER: Self = Self {
        step: "grow step 3 (add preparer)",
    };
    pub const SHRINK_REMOVE_PREPARER: Self = Self {
        step: "shrink step 1 (remove preparer)",
    };
    pub const SHRINK_IDENTITY_READ: Self = Self {
        step: "shrink step 2 (identity read)",
    };
    pub const SHRINK_REMOVE_ACCEPTER: Self = Self {
        step: "shrink step 3 (remove accepter)",
    };
    pub const GC_IDENTITY_READ: Self = Self {
        step: "gc phase a (identity read)",
    };
    pub const GC_FAST_FORWARD: Self = Self {
        step: "gc phase b (fast-forward)",
    };
    pub const GC_AGE_BROADCAST: Self = Self {
        step: "gc phase c (age broadcast)",
    };
    pub const GC_REMOVE_IF_EMPTY: Self = Self {
        step: "gc phase d (remove if empty)",
    };
}
