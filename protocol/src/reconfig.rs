//! Cluster membership changes.
//!
//! Growing and shrinking mutate one phase set at a time across every
//! proposer, with a forced identity read on the zero key in between, so any
//! prepare quorum and any accept quorum keep intersecting throughout the
//! change. The same steps run in reverse order to shrink.
//!
//! Growing from an even acceptor count to an odd one could skip the identity
//! read, but membership changes are rare and operator-driven, the acceptor
//! count can drift between proposers mid-change, and one process for every
//! change is worth a round-trip. The optimization is deliberately not taken.

use std::sync::Arc;

use error_stack::{Report, ResultExt};
use rand::Rng;
use rand::seq::IndexedRandom;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::ZEROKEY;
use crate::error::{ProtocolError, StepContext};
use crate::traits::Proposer;

/// Inverse of a successfully applied configuration step.
#[derive(Clone, Copy, Debug)]
enum Inverse {
    AddAccepter,
    AddPreparer,
    RemovePreparer,
    RemoveAccepter,
}

struct Undo<'a, P: Proposer> {
    proposer: &'a Arc<P>,
    inverse: Inverse,
}

/// Play the undo stack in reverse, best-effort. A registration already in
/// the requested state means that entry needs no reverting; other failures
/// are logged and swallowed, there is nothing else to do.
fn unwind<P: Proposer>(undo: &[Undo<'_, P>], target: &Arc<P::Acceptor>) {
    for entry in undo.iter().rev() {
        let result = match entry.inverse {
            Inverse::AddAccepter => entry.proposer.add_accepter(target),
            Inverse::AddPreparer => entry.proposer.add_preparer(target),
            Inverse::RemovePreparer => entry.proposer.remove_preparer(target),
            Inverse::RemoveAccepter => entry.proposer.remove_accepter(target),
        };
        if let Err(report) = result {
            if *report.current_context() != ProtocolError::ConfigMismatch {
                warn!(proposer = %entry.proposer.id(), ?report, "undo step failed");
            }
        }
    }
}

/// `propose(zerokey, x -> x)` on one proposer, flushing any pending state
/// under the transitional configuration.
async fn identity_read<P: Proposer>(
    cancel: &CancellationToken,
    proposer: &P,
) -> Result<(), Report<ProtocolError>> {
    tokio::select! {
        () = cancel.cancelled() => Err(Report::new(ProtocolError::Canceled)),
        result = proposer.propose(ZEROKEY, |x| x) => result.map(|_| ()),
    }
}

/// Add `target` to the cluster: accepter on every proposer, identity read on
/// one random proposer, then preparer on every proposer.
///
/// On failure the already-applied steps are reverted best-effort and the
/// error names the step that failed. Cancellation is a step failure like any
/// other: the undo stack still runs.
pub async fn grow_cluster<P: Proposer>(
    cancel: &CancellationToken,
    target: &Arc<P::Acceptor>,
    proposers: &[Arc<P>],
    rng: &mut impl Rng,
) -> Result<(), Report<ProtocolError>> {
    let mut undo = Vec::new();
    match grow_steps(cancel, target, proposers, rng, &mut undo).await {
        Ok(()) => {
            debug!(proposers = proposers.len(), "cluster grown");
            Ok(())
        }
        Err(report) => {
            unwind(&undo, target);
            Err(report)
        }
    }
}

async fn grow_steps<'a, P: Proposer>(
    cancel: &CancellationToken,
    target: &Arc<P::Acceptor>,
    proposers: &'a [Arc<P>],
    rng: &mut impl Rng,
    undo: &mut Vec<Undo<'a, P>>,
) -> Result<(), Report<ProtocolError>> {
    for proposer in proposers {
        proposer
            .add_accepter(target)
            .attach(StepContext::GROW_ADD_ACCEPTER)?;
        undo.push(Undo {
            proposer,
            inverse: Inverse::RemoveAccepter,
        });
    }

    let Some(proposer) = proposers.choose(rng) else {
        return Err(Report::new(ProtocolError::QuorumFailure).attach("no proposers"));
    };
    identity_read(cancel, proposer.as_ref())
        .await
        .attach(StepContext::GROW_IDENTITY_READ)?;

    for proposer in proposers {
        proposer
            .add_preparer(target)
            .attach(StepContext::GROW_ADD_PREPARER)?;
        undo.push(Undo {
            proposer,
            inverse: Inverse::RemovePreparer,
        });
    }

    Ok(())
}

/// Remove `target` from the cluster: the grow steps, mirrored.
pub async fn shrink_cluster<P: Proposer>(
    cancel: &CancellationToken,
    target: &Arc<P::Acceptor>,
    proposers: &[Arc<P>],
    rng: &mut impl Rng,
) -> Result<(), Report<ProtocolError>> {
    let mut undo = Vec::new();
    match shrink_steps(cancel, target, proposers, rng, &mut undo).await {
        Ok(()) => {
            debug!(proposers = proposers.len(), "cluster shrunk");
            Ok(())
        }
        Err(report) => {
            unwind(&undo, target);
            Err(report)
        }
    }
}

async fn shrink_steps<'a, P: Proposer>(
    cancel: &CancellationToken,
    target: &Arc<P::Acceptor>,
    proposers: &'a [Arc<P>],
    rng: &mut impl Rng,
    undo: &mut Vec<Undo<'a, P>>,
) -> Result<(), Report<ProtocolError>> {
    for proposer in proposers {
        proposer
            .remove_preparer(target)
            .attach(StepContext::SHRINK_REMOVE_PREPARER)?;
        undo.push(Undo {
            proposer,
            inverse: Inverse::AddPreparer,
        });
    }

    let Some(proposer) = proposers.choose(rng) else {
        return Err(Report::new(ProtocolError::QuorumFailure).attach("no proposers"));
    };
    identity_read(cancel, proposer.as_ref())
        .await
        .attach(StepContext::SHRINK_IDENTITY_READ)?;

    for proposer in proposers {
        proposer
            .remove_accepter(target)
            .attach(StepContext::SHRINK_REMOVE_ACCEPTER)?;
        undo.push(Undo {
            proposer,
            inverse: Inverse::AddAccepter,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;
    use crate::acceptor::MemoryAcceptor;
    use crate::ballot::ProposerId;
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
    async fn no_proposers_is_an_error() {
        let cancel = CancellationToken::new();
        let target = Arc::new(MemoryAcceptor::new("mem://a4"));
        let mut rng = StdRng::seed_from_u64(0);

        let err = grow_cluster::<MemoryProposer<MemoryAcceptor>>(&cancel, &target, &[], &mut rng)
            .await
            .unwrap_err();
        assert_eq!(*err.current_context(), ProtocolError::QuorumFailure);
    }

    #[tokio::test]
    async fn cancellation_reverts_applied_steps() {
        let (proposers, _acceptors) = cluster(3, 3);
        let target = Arc::new(MemoryAcceptor::new("mem://a4"));
        let mut rng = StdRng::seed_from_u64(0);

        let cancel = CancellationToken::new();
        cancel.cancel();

        // Step 1 applies before the identity read observes cancellation, so
        // the undo stack has something to revert.
        let err = grow_cluster(&cancel, &target, &proposers, &mut rng)
            .await
            .unwrap_err();
        assert_eq!(*err.current_context(), ProtocolError::Canceled);

        for proposer in &proposers {
            assert_eq!(proposer.accept_addresses().len(), 3);
            assert_eq!(proposer.prepare_addresses().len(), 3);
        }
    }
}
