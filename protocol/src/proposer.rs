//! In-memory proposer: ballot issuance, two-phase rounds, configuration.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use error_stack::Report;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::ballot::{Age, Ballot, ProposerId};
use crate::error::{ProtocolError, Promised};
use crate::traits::{Accepter, Acceptor, Addresser, Preparer, Proposer};

/// Conflicted rounds are retried at most this many times before the error
/// surfaces to the caller.
const MAX_ATTEMPTS: u32 = 3;

/// Delay before the first conflict retry; doubles per retry up to
/// [`RETRY_CAP`].
const RETRY_BASE: Duration = Duration::from_millis(10);
const RETRY_CAP: Duration = Duration::from_secs(1);

/// Quorum mode for one round.
#[derive(Clone, Copy, Debug)]
enum Quorum {
    /// Strict majority of the phase set.
    Majority,
    /// Every member of the phase set.
    All,
}

impl Quorum {
    fn size(self, members: usize) -> usize {
        match self {
            Self::Majority => members / 2 + 1,
            Self::All => members,
        }
    }
}

struct Inner<A> {
    counter: u64,
    age: Age,
    prepare_set: BTreeMap<String, Arc<A>>,
    accept_set: BTreeMap<String, Arc<A>>,
    /// Accepted state this proposer last committed, by key.
    cache: BTreeMap<String, (Ballot, Bytes)>,
    rng: StdRng,
}

/// An in-memory proposer.
///
/// Both phase sets are keyed by acceptor address, which de-duplicates
/// targets. All state sits behind one lock that is never held across a
/// network call: each phase snapshots its set and quorum before fanning out,
/// so concurrent configuration changes are seen entirely or not at all.
pub struct MemoryProposer<A> {
    id: ProposerId,
    inner: Mutex<Inner<A>>,
}

impl<A: Acceptor> MemoryProposer<A> {
    #[must_use]
    pub fn new(id: ProposerId, acceptors: impl IntoIterator<Item = Arc<A>>) -> Self {
        Self::with_rng(id, acceptors, StdRng::from_os_rng())
    }

    /// Deterministic variant for tests: seeded retry jitter.
    #[must_use]
    pub fn with_seed(id: ProposerId, acceptors: impl IntoIterator<Item = Arc<A>>, seed: u64) -> Self {
        Self::with_rng(id, acceptors, StdRng::seed_from_u64(seed))
    }

    fn with_rng(id: ProposerId, acceptors: impl IntoIterator<Item = Arc<A>>, rng: StdRng) -> Self {
        let set: BTreeMap<String, Arc<A>> = acceptors
            .into_iter()
            .map(|acceptor| (acceptor.address(), acceptor))
            .collect();
        Self {
            id,
            inner: Mutex::new(Inner {
                counter: 0,
                age: Age::default(),
                prepare_set: set.clone(),
                accept_set: set,
                cache: BTreeMap::new(),
                rng,
            }),
        }
    }

    /// Addresses currently receiving prepare messages.
    #[must_use]
    pub fn prepare_addresses(&self) -> Vec<String> {
        self.inner.lock().unwrap().prepare_set.keys().cloned().collect()
    }

    /// Addresses currently receiving accept messages.
    #[must_use]
    pub fn accept_addresses(&self) -> Vec<String> {
        self.inner.lock().unwrap().accept_set.keys().cloned().collect()
    }

    /// The accepted state this proposer last committed for `key`, if it has
    /// not been invalidated by a fast-forward.
    #[must_use]
    pub fn cached(&self, key: &str) -> Option<(Ballot, Bytes)> {
        self.inner.lock().unwrap().cache.get(key).cloned()
    }

    #[must_use]
    pub fn age(&self) -> Age {
        self.inner.lock().unwrap().age
    }

    /// One two-phase round at the given quorum mode.
    async fn round<F>(
        &self,
        key: &str,
        change: &mut F,
        quorum: Quorum,
    ) -> Result<(Bytes, Ballot), Report<ProtocolError>>
    where
        F: FnMut(Bytes) -> Bytes + Send,
    {
        // Issue a fresh ballot and snapshot the prepare phase.
        let (ballot, preparers, prepare_quorum) = {
            let mut inner = self.inner.lock().unwrap();
            inner.counter += 1;
            let ballot = Ballot::new(inner.counter, self.id);
            let preparers: Vec<Arc<A>> = inner.prepare_set.values().cloned().collect();
            let prepare_quorum = quorum.size(preparers.len());
            (ballot, preparers, prepare_quorum)
        };
        if preparers.is_empty() {
            return Err(Report::new(ProtocolError::QuorumFailure).attach("no preparers configured"));
        }
        trace!(proposer = %self.id, key, %ballot, targets = preparers.len(), "prepare phase");

        let (tx, mut rx) = mpsc::channel(preparers.len());
        for acceptor in preparers {
            let tx = tx.clone();
            let key = key.to_owned();
            tokio::spawn(async move {
                let result = acceptor.prepare(&key, ballot).await;
                let _ = tx.send(result).await;
            });
        }
        drop(tx);

        // Collect every reply; the value of the highest accepted ballot is
        // the current state.
        let mut current = Bytes::new();
        let mut current_ballot = Ballot::ZERO;
        let mut confirmations = 0usize;
        let mut conflicted: Option<Ballot> = None;
        while let Some(result) = rx.recv().await {
            match result {
                Ok((value, accepted)) => {
                    confirmations += 1;
                    if accepted >= current_ballot {
                        current_ballot = accepted;
                        current = value;
                    }
                }
                Err(report) => {
                    if let Some(Promised(promised)) = report.downcast_ref::<Promised>() {
                        conflicted = Some(conflicted.map_or(*promised, |b| b.max(*promised)));
                    }
                }
            }
        }
        if confirmations < prepare_quorum {
            return Err(self.quorum_error(conflicted, "prepare quorum failed"));
        }

        let state = change(current);

        // Snapshot the accept phase.
        let (accepters, accept_quorum) = {
            let inner = self.inner.lock().unwrap();
            let accepters: Vec<Arc<A>> = inner.accept_set.values().cloned().collect();
            let accept_quorum = quorum.size(accepters.len());
            (accepters, accept_quorum)
        };
        if accepters.is_empty() {
            return Err(Report::new(ProtocolError::QuorumFailure).attach("no accepters configured"));
        }
        trace!(proposer = %self.id, key, %ballot, targets = accepters.len(), "accept phase");

        let (tx, mut rx) = mpsc::channel(accepters.len());
        for acceptor in accepters {
            let tx = tx.clone();
            let key = key.to_owned();
            let state = state.clone();
            tokio::spawn(async move {
                let result = acceptor.accept(&key, ballot, state).await;
                let _ = tx.send(result).await;
            });
        }
        drop(tx);

        let mut acknowledgements = 0usize;
        let mut conflicted: Option<Ballot> = None;
        while let Some(result) = rx.recv().await {
            match result {
                Ok(()) => acknowledgements += 1,
                Err(report) => {
                    if let Some(Promised(promised)) = report.downcast_ref::<Promised>() {
                        conflicted = Some(conflicted.map_or(*promised, |b| b.max(*promised)));
                    }
                }
            }
        }
        if acknowledgements < accept_quorum {
            return Err(self.quorum_error(conflicted, "accept quorum failed"));
        }

        // Committing the empty state is a deletion; there is nothing left
        // worth caching.
        let mut inner = self.inner.lock().unwrap();
        if state.is_empty() {
            inner.cache.remove(key);
        } else {
            inner.cache.insert(key.to_owned(), (ballot, state.clone()));
        }
        Ok((state, ballot))
    }

    /// Drive rounds until one commits, retrying conflicted rounds with
    /// jittered backoff. Other failures surface immediately.
    async fn run<F>(
        &self,
        key: &str,
        change: &mut F,
        quorum: Quorum,
    ) -> Result<(Bytes, Ballot), Report<ProtocolError>>
    where
        F: FnMut(Bytes) -> Bytes + Send,
    {
        let mut retries = 0;
        loop {
            match self.round(key, change, quorum).await {
                Ok((state, ballot)) => {
                    debug!(proposer = %self.id, key, %ballot, "proposal committed");
                    return Ok((state, ballot));
                }
                Err(report)
                    if *report.current_context() == ProtocolError::Conflict
                        && retries + 1 < MAX_ATTEMPTS =>
                {
                    let delay = self.retry_delay(retries);
                    trace!(proposer = %self.id, key, retries, ?delay, "conflicted, retrying");
                    tokio::time::sleep(delay).await;
                    retries += 1;
                }
                Err(report) => return Err(report),
            }
        }
    }

    /// How long to wait before retry number `retries`: doubled each round up
    /// to a cap, smeared by the proposer's rng so colliding proposers drift
    /// apart instead of re-colliding.
    fn retry_delay(&self, retries: u32) -> Duration {
        let doubled = RETRY_BASE.saturating_mul(1u32 << retries.min(16));
        let capped = doubled.min(RETRY_CAP);
        let smear = self.inner.lock().unwrap().rng.random_range(0.5..1.5);
        capped.mul_f64(smear)
    }

    /// Fast-forward past any observed promise and build the round error.
    fn quorum_error(
        &self,
        conflicted: Option<Ballot>,
        step: &'static str,
    ) -> Report<ProtocolError> {
        match conflicted {
            Some(promised) => {
                let mut inner = self.inner.lock().unwrap();
                inner.counter = inner.counter.max(promised.counter);
                Report::new(ProtocolError::Conflict)
                    .attach(Promised(promised))
                    .attach(step)
            }
            None => Report::new(ProtocolError::QuorumFailure).attach(step),
        }
    }
}

impl<A: Acceptor> Proposer for MemoryProposer<A> {
    type Acceptor = A;

    fn id(&self) -> ProposerId {
        self.id
    }

    async fn propose<F>(&self, key: &str, mut change: F) -> Result<(Bytes, Ballot), Report<ProtocolError>>
    where
        F: FnMut(Bytes) -> Bytes + Send,
    {
        self.run(key, &mut change, Quorum::Majority).await
    }

    async fn full_identity_read(&self, key: &str) -> Result<Bytes, Report<ProtocolError>> {
        let mut identity = |x| x;
        let (state, _ballot) = self.run(key, &mut identity, Quorum::All).await?;
        Ok(state)
    }

    async fn fast_forward(&self, tombstone: u64) -> Result<Age, Report<ProtocolError>> {
        let mut inner = self.inner.lock().unwrap();
        inner.counter = inner.counter.max(tombstone);
        inner.cache.retain(|_, (ballot, _)| ballot.counter > tombstone);
        inner.age = inner.age.next();
        debug!(proposer = %self.id, tombstone, age = %inner.age, "fast-forwarded");
        Ok(inner.age)
    }

    fn add_accepter(&self, target: &Arc<A>) -> Result<(), Report<ProtocolError>> {
        let mut inner = self.inner.lock().unwrap();
        let address = target.address();
        if inner.accept_set.contains_key(&address) {
            return Err(Report::new(ProtocolError::ConfigMismatch)
                .attach(format!("{address} is already an accepter")));
        }
        debug!(proposer = %self.id, %address, "accepter added");
        inner.accept_set.insert(address, Arc::clone(target));
        Ok(())
    }

    fn add_preparer(&self, target: &Arc<A>) -> Result<(), Report<ProtocolError>> {
        let mut inner = self.inner.lock().unwrap();
        let address = target.address();
        if inner.prepare_set.contains_key(&address) {
            return Err(Report::new(ProtocolError::ConfigMismatch)
                .attach(format!("{address} is already a preparer")));
        }
        debug!(proposer = %self.id, %address, "preparer added");
        inner.prepare_set.insert(address, Arc::clone(target));
        Ok(())
    }

    fn remove_preparer(&self, target: &Arc<A>) -> Result<(), Report<ProtocolError>> {
        let mut inner = self.inner.lock().unwrap();
        let address = target.address();
        if inner.prepare_set.remove(&address).is_none() {
            return Err(Report::new(ProtocolError::ConfigMismatch)
                .attach(format!("{address} is not a preparer")));
        }
        debug!(proposer = %self.id, %address, "preparer removed");
        Ok(())
    }

    fn remove_accepter(&self, target: &Arc<A>) -> Result<(), Report<ProtocolError>> {
        let mut inner = self.inner.lock().unwrap();
        let address = target.address();
        if inner.accept_set.remove(&address).is_none() {
            return Err(Report::new(ProtocolError::ConfigMismatch)
                .attach(format!("{address} is not an accepter")));
        }
        debug!(proposer = %self.id, %address, "accepter removed");
        Ok(())
    }
}
