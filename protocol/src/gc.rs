//! Garbage collection: erasing a deleted key across the cluster.

use core::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use error_stack::{Report, ResultExt};
use rand::Rng;
use rand::seq::IndexedRandom;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::acceptor::MemoryAcceptor;
use crate::ballot::{Age, Ballot, ProposerId};
use crate::error::{ProtocolError, StepContext};
use crate::traits::{Acceptor, Proposer, Remover};

/// Delay between garbage-collection attempts.
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Terminal form of a key: the ballot and (empty) state committed by a
/// deletion proposal. Input to [`garbage_collect`].
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Tombstone {
    pub ballot: Ballot,
    pub state: Bytes,
}

/// Hook for phase (c): informing acceptors of the minimum age now required
/// of each proposer. How acceptors enforce the ages is deployment policy.
pub trait AgePolicy<A: Acceptor>: Send + Sync {
    fn enforce(
        &self,
        ages: &[(ProposerId, Age)],
        acceptors: &[Arc<A>],
    ) -> impl Future<Output = Result<(), Report<ProtocolError>>> + Send;
}

/// No acceptor-side age enforcement.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoAgeEnforcement;

impl<A: Acceptor> AgePolicy<A> for NoAgeEnforcement {
    async fn enforce(
        &self,
        _ages: &[(ProposerId, Age)],
        _acceptors: &[Arc<A>],
    ) -> Result<(), Report<ProtocolError>> {
        Ok(())
    }
}

/// Record the broadcast ages on in-memory acceptors.
#[derive(Clone, Copy, Debug, Default)]
pub struct RecordAges;

impl AgePolicy<MemoryAcceptor> for RecordAges {
    async fn enforce(
        &self,
        ages: &[(ProposerId, Age)],
        acceptors: &[Arc<MemoryAcceptor>],
    ) -> Result<(), Report<ProtocolError>> {
        for acceptor in acceptors {
            acceptor.observe_ages(ages);
        }
        Ok(())
    }
}

/// Erase `key` from the cluster after a deletion proposal committed
/// `tombstone`. Runs until success or cancellation, retrying failed attempts
/// after a 1-second back-off; every phase is idempotent, so partial progress
/// is always safe.
pub async fn garbage_collect<P, G>(
    cancel: &CancellationToken,
    key: &str,
    tombstone: &Tombstone,
    proposers: &[Arc<P>],
    acceptors: &[Arc<P::Acceptor>],
    ages: &G,
    rng: &mut impl Rng,
) -> Result<(), Report<ProtocolError>>
where
    P: Proposer,
    G: AgePolicy<P::Acceptor>,
{
    loop {
        let result = tokio::select! {
            () = cancel.cancelled() => return Err(Report::new(ProtocolError::Canceled)),
            result = attempt(key, tombstone, proposers, acceptors, ages, rng) => result,
        };
        match result {
            Ok(()) => {
                debug!(key, "key garbage collected");
                return Ok(());
            }
            Err(report) => {
                warn!(key, ?report, "garbage collection attempt failed, retrying");
                tokio::select! {
                    () = tokio::time::sleep(RETRY_DELAY) => {}
                    () = cancel.cancelled() => return Err(Report::new(ProtocolError::Canceled)),
                }
            }
        }
    }
}

async fn attempt<P, G>(
    key: &str,
    tombstone: &Tombstone,
    proposers: &[Arc<P>],
    acceptors: &[Arc<P::Acceptor>],
    ages: &G,
    rng: &mut impl Rng,
) -> Result<(), Report<ProtocolError>>
where
    P: Proposer,
    G: AgePolicy<P::Acceptor>,
{
    // (a) Identity read at max quorum: once this succeeds, every acceptor
    // has accepted the empty value at a ballot at or above the tombstone.
    let Some(proposer) = proposers.choose(rng) else {
        return Err(Report::new(ProtocolError::QuorumFailure).attach("no proposers"));
    };
    let state = proposer
        .full_identity_read(key)
        .await
        .attach(StepContext::GC_IDENTITY_READ)?;
    if !state.is_empty() {
        return Err(Report::new(ProtocolError::NotEmpty).attach(StepContext::GC_IDENTITY_READ));
    }

    // (b) After this, no proposer can ever propose on this key with a ballot
    // at or below the tombstone.
    let new_ages = broadcast_fast_forward(tombstone.ballot.counter(), proposers)
        .await
        .attach(StepContext::GC_FAST_FORWARD)?;

    // (c) Acceptors learn the new ages through the policy hook.
    ages.enforce(&new_ages, acceptors)
        .await
        .attach(StepContext::GC_AGE_BROADCAST)?;

    // (d) Remove the register everywhere; 100% quorum.
    broadcast_remove_if_empty(key, acceptors)
        .await
        .attach(StepContext::GC_REMOVE_IF_EMPTY)?;

    Ok(())
}

/// Propose the identity function for `key` through every proposer at once.
/// Every returned state must be empty; the largest returned counter is the
/// tombstone counter for the key.
pub async fn broadcast_identity<P: Proposer>(
    key: &str,
    proposers: &[Arc<P>],
) -> Result<u64, Report<ProtocolError>> {
    let (tx, mut rx) = mpsc::channel(proposers.len().max(1));
    for proposer in proposers {
        let proposer = Arc::clone(proposer);
        let tx = tx.clone();
        let key = key.to_owned();
        tokio::spawn(async move {
            let result = proposer.propose(&key, |x| x).await;
            let _ = tx.send(result).await;
        });
    }
    drop(tx);

    // Collect every reply, even after a failure; the first error fails the
    // whole batch.
    let mut tombstone = 0u64;
    let mut failure = None;
    while let Some(result) = rx.recv().await {
        match result {
            Ok((state, ballot)) => {
                if state.is_empty() {
                    tombstone = tombstone.max(ballot.counter());
                } else {
                    failure.get_or_insert_with(|| {
                        Report::new(ProtocolError::NotEmpty)
                            .attach("identity read returned a live value")
                    });
                }
            }
            Err(report) => {
                failure.get_or_insert(report);
            }
        }
    }
    match failure {
        Some(report) => Err(report),
        None => Ok(tombstone),
    }
}

/// Fast-forward every proposer past the tombstone counter, collecting the
/// new age of each.
pub async fn broadcast_fast_forward<P: Proposer>(
    tombstone: u64,
    proposers: &[Arc<P>],
) -> Result<Vec<(ProposerId, Age)>, Report<ProtocolError>> {
    let (tx, mut rx) = mpsc::channel(proposers.len().max(1));
    for proposer in proposers {
        let proposer = Arc::clone(proposer);
        let tx = tx.clone();
        tokio::spawn(async move {
            let id = proposer.id();
            let result = proposer.fast_forward(tombstone).await.map(|age| (id, age));
            let _ = tx.send(result).await;
        });
    }
    drop(tx);

    let mut ages = Vec::with_capacity(proposers.len());
    let mut failure = None;
    while let Some(result) = rx.recv().await {
        match result {
            Ok(age) => ages.push(age),
            Err(report) => {
                failure.get_or_insert(report);
            }
        }
    }
    match failure {
        Some(report) => Err(report),
        None => Ok(ages),
    }
}

/// Remove the register for `key` on every acceptor. All acceptors must
/// acknowledge; any failure fails the batch.
pub async fn broadcast_remove_if_empty<A: Acceptor>(
    key: &str,
    acceptors: &[Arc<A>],
) -> Result<(), Report<ProtocolError>> {
    let (tx, mut rx) = mpsc::channel(acceptors.len().max(1));
    for acceptor in acceptors {
        let acceptor = Arc::clone(acceptor);
        let tx = tx.clone();
        let key = key.to_owned();
        tokio::spawn(async move {
            let result = acceptor.remove_if_empty(&key).await;
            let _ = tx.send(result).await;
        });
    }
    drop(tx);

    let mut failure = None;
    while let Some(result) = rx.recv().await {
        if let Err(report) = result {
            failure.get_or_insert(report);
        }
    }
    match failure {
        Some(report) => Err(report),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proposer::MemoryProposer;

    fn cluster(
        n_proposers: u64,
        n_acceptors: usize,
    ) -> (Vec<Arc<MemoryProposer<MemoryAcceptor>>>, Vec<Arc<MemoryAcceptor>>) {
        let acceptors: Vec<_> = (0..n_acceptors)
            .map(|i| Arc::new(MemoryAcceptor::new(format!("mem://a{i}"))))
            .collect();
        let proposers: Vec<_> = (0..n_proposers)
            .map(|i| {
                Arc::new(MemoryProposer::with_seed(
                    ProposerId(i),
                    acceptors.clone(),
                    i,
                ))
            })
            .collect();
        (proposers, acceptors)
    }

    #[tokio::test]
    async fn broadcast_identity_takes_the_largest_counter() {
        let (proposers, _acceptors) = cluster(3, 3);

        // An empty key: every identity read commits the empty value.
        let tombstone = broadcast_identity("gone", &proposers).await.unwrap();
        assert!(tombstone > 0);

        // Re-running can only move the counter forward.
        let again = broadcast_identity("gone", &proposers).await.unwrap();
        assert!(again > tombstone);
    }

    #[tokio::test]
    async fn broadcast_identity_rejects_live_values() {
        let (proposers, _acceptors) = cluster(3, 3);
        proposers[0]
            .propose("live", |_| Bytes::from_static(b"v"))
            .await
            .unwrap();

        let err = broadcast_identity("live", &proposers[..1]).await.unwrap_err();
        assert_eq!(*err.current_context(), ProtocolError::NotEmpty);
    }

    #[tokio::test]
    async fn broadcast_fast_forward_collects_every_age() {
        let (proposers, _acceptors) = cluster(3, 3);

        let ages = broadcast_fast_forward(10, &proposers).await.unwrap();
        assert_eq!(ages.len(), 3);
        for (_, age) in ages {
            assert_eq!(age, Age(1));
        }
        for proposer in &proposers {
            let (_, ballot) = proposer.propose("k", |x| x).await.unwrap();
            assert!(ballot.counter() > 10);
        }
    }
}
