//! Core protocol traits: the acceptor capability set and the proposer.
//!
//! Naming note: `Acceptor` (noun) is the whole composite node; `Accepter`
//! (agent noun of the verb) is the second-phase capability only.
//!
//! Async methods are declared as `impl Future + Send` so callers can fan
//! them out onto spawned tasks; implementations write plain `async fn`.

use core::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use error_stack::Report;

use crate::ballot::{Age, Ballot, ProposerId};
use crate::error::ProtocolError;

/// Something with a unique, stable endpoint, typically
/// `"protocol://host:port"`. Used for de-duplication and logging; must be
/// pure and side-effect free.
pub trait Addresser {
    fn address(&self) -> String;
}

/// First-phase responsibilities of an acceptor.
pub trait Preparer {
    /// If `ballot` is greater than the stored promise, atomically promise it
    /// and return the currently accepted value with its ballot. Otherwise
    /// fail with [`ProtocolError::Conflict`] carrying the stored promise as
    /// a [`crate::error::Promised`] attachment.
    fn prepare(
        &self,
        key: &str,
        ballot: Ballot,
    ) -> impl Future<Output = Result<(Bytes, Ballot), Report<ProtocolError>>> + Send;
}

/// Second-phase responsibilities of an acceptor.
pub trait Accepter {
    /// If `ballot` is at least the stored promise, atomically set both the
    /// promised and accepted ballots to it and store `value`. Otherwise fail
    /// with [`ProtocolError::Conflict`].
    fn accept(
        &self,
        key: &str,
        ballot: Ballot,
        value: Bytes,
    ) -> impl Future<Output = Result<(), Report<ProtocolError>>> + Send;
}

/// Garbage-collection responsibilities of an acceptor.
pub trait Remover {
    /// Delete the register iff it exists, holds the empty value, and has
    /// been accepted at least once. An absent register is success
    /// (idempotent); anything else is [`ProtocolError::NotEmpty`].
    fn remove_if_empty(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<(), Report<ProtocolError>>> + Send;
}

/// A complete, uniquely-addressable acceptor.
pub trait Acceptor: Addresser + Preparer + Accepter + Remover + Send + Sync + 'static {}

impl<T> Acceptor for T where T: Addresser + Preparer + Accepter + Remover + Send + Sync + 'static {}

/// A per-node actor that drives two-phase proposals against acceptors.
pub trait Proposer: Send + Sync + 'static {
    type Acceptor: Acceptor;

    fn id(&self) -> ProposerId;

    /// Run one consensus round: issue a fresh ballot strictly greater than
    /// any ballot previously used or observed, reach a prepare quorum, apply
    /// `change` to the value of the highest returned accepted ballot, and
    /// reach an accept quorum for the result. Conflicts fast-forward the
    /// counter and may be retried; the retry policy is internal.
    fn propose<F>(
        &self,
        key: &str,
        change: F,
    ) -> impl Future<Output = Result<(Bytes, Ballot), Report<ProtocolError>>> + Send
    where
        F: FnMut(Bytes) -> Bytes + Send;

    /// Identity read requiring acknowledgement from every acceptor in both
    /// sets, not merely a majority. Any acceptor failure is fatal for the
    /// call.
    fn full_identity_read(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<Bytes, Report<ProtocolError>>> + Send;

    /// Guarantee that every subsequent ballot issued by this proposer has a
    /// counter strictly greater than `tombstone`, drop cached state at or
    /// below it, and bump the proposer's age. Returns the new age.
    fn fast_forward(
        &self,
        tombstone: u64,
    ) -> impl Future<Output = Result<Age, Report<ProtocolError>>> + Send;

    /// Configuration changes. Each is atomic relative to concurrent
    /// `propose` calls: a proposal sees the old set entirely or the new set
    /// entirely for each phase. A registration already in the requested
    /// state is [`ProtocolError::ConfigMismatch`].
    fn add_accepter(&self, target: &Arc<Self::Acceptor>) -> Result<(), Report<ProtocolError>>;
    fn add_preparer(&self, target: &Arc<Self::Acceptor>) -> Result<(), Report<ProtocolError>>;
    fn remove_preparer(&self, target: &Arc<Self::Acceptor>) -> Result<(), Report<ProtocolError>>;
    fn remove_accepter(&self, target: &Arc<Self::Acceptor>) -> Result<(), Report<ProtocolError>>;
}
