//! End-to-end scenarios over the in-memory cluster.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use caspaxos_protocol::{
    Accepter, Addresser, Age, Ballot, MemoryAcceptor, MemoryProposer, Preparer, Proposer,
    ProposerId, ProtocolError, RecordAges, Remover, Tombstone, garbage_collect, grow_cluster,
    shrink_cluster,
};
use error_stack::Report;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio_util::sync::CancellationToken;

/// Route this test's tracing output through the test writer for the
/// lifetime of the returned guard. `RUST_LOG` overrides the default filter.
fn init_tracing() -> tracing::subscriber::DefaultGuard {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("caspaxos_protocol=debug"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .finish();
    tracing::subscriber::set_default(subscriber)
}

fn cluster(
    n_proposers: u64,
    n_acceptors: usize,
) -> (
    Vec<Arc<MemoryProposer<MemoryAcceptor>>>,
    Vec<Arc<MemoryAcceptor>>,
) {
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
async fn write_then_read_through_another_proposer() {
    let _guard = init_tracing();
    let (proposers, _acceptors) = cluster(3, 3);

    let (state, b1) = proposers[0]
        .propose("x", |_| Bytes::from_static(&[1, 2, 3]))
        .await
        .unwrap();
    assert_eq!(state, Bytes::from_static(&[1, 2, 3]));

    let (state, b2) = proposers[1].propose("x", |x| x).await.unwrap();
    assert_eq!(state, Bytes::from_static(&[1, 2, 3]));
    assert!(b2 > b1);
}

#[tokio::test]
async fn grow_adds_the_target_to_both_phases() {
    let _guard = init_tracing();
    let (proposers, _acceptors) = cluster(3, 3);
    let target = Arc::new(MemoryAcceptor::new("mem://a4"));
    let mut rng = StdRng::seed_from_u64(1);

    grow_cluster(&CancellationToken::new(), &target, &proposers, &mut rng)
        .await
        .unwrap();

    for proposer in &proposers {
        assert!(proposer.prepare_addresses().contains(&"mem://a4".to_owned()));
        assert!(proposer.accept_addresses().contains(&"mem://a4".to_owned()));
    }

    // The four-acceptor configuration commits writes.
    let (state, _) = proposers[0]
        .propose("y", |_| Bytes::from_static(&[9]))
        .await
        .unwrap();
    assert_eq!(state, Bytes::from_static(&[9]));
    assert!(target.has_register("y"));
}

#[tokio::test]
async fn shrink_restores_the_original_configuration() {
    let _guard = init_tracing();
    let (proposers, _acceptors) = cluster(3, 3);
    let target = Arc::new(MemoryAcceptor::new("mem://a4"));
    let mut rng = StdRng::seed_from_u64(2);
    let cancel = CancellationToken::new();

    grow_cluster(&cancel, &target, &proposers, &mut rng)
        .await
        .unwrap();
    shrink_cluster(&cancel, &target, &proposers, &mut rng)
        .await
        .unwrap();

    for proposer in &proposers {
        assert_eq!(proposer.prepare_addresses().len(), 3);
        assert_eq!(proposer.accept_addresses().len(), 3);
        assert!(!proposer.prepare_addresses().contains(&"mem://a4".to_owned()));
    }
}

// --- Failure injection: proposer whose add_preparer refuses ---

struct FailingProposer {
    inner: MemoryProposer<MemoryAcceptor>,
    fail_add_preparer: bool,
}

impl Proposer for FailingProposer {
    type Acceptor = MemoryAcceptor;

    fn id(&self) -> ProposerId {
        self.inner.id()
    }

    async fn propose<F>(&self, key: &str, change: F) -> Result<(Bytes, Ballot), Report<ProtocolError>>
    where
        F: FnMut(Bytes) -> Bytes + Send,
    {
        self.inner.propose(key, change).await
    }

    async fn full_identity_read(&self, key: &str) -> Result<Bytes, Report<ProtocolError>> {
        self.inner.full_identity_read(key).await
    }

    async fn fast_forward(&self, tombstone: u64) -> Result<Age, Report<ProtocolError>> {
        self.inner.fast_forward(tombstone).await
    }

    fn add_accepter(&self, target: &Arc<MemoryAcceptor>) -> Result<(), Report<ProtocolError>> {
        self.inner.add_accepter(target)
    }

    fn add_preparer(&self, target: &Arc<MemoryAcceptor>) -> Result<(), Report<ProtocolError>> {
        if self.fail_add_preparer {
            return Err(Report::new(ProtocolError::Transport).attach("injected failure"));
        }
        self.inner.add_preparer(target)
    }

    fn remove_preparer(&self, target: &Arc<MemoryAcceptor>) -> Result<(), Report<ProtocolError>> {
        self.inner.remove_preparer(target)
    }

    fn remove_accepter(&self, target: &Arc<MemoryAcceptor>) -> Result<(), Report<ProtocolError>> {
        self.inner.remove_accepter(target)
    }
}

#[tokio::test]
async fn failed_grow_reverts_every_proposer() {
    let _guard = init_tracing();
    let acceptors: Vec<_> = (0..3)
        .map(|i| Arc::new(MemoryAcceptor::new(format!("mem://a{i}"))))
        .collect();
    let proposers: Vec<_> = (0..3u64)
        .map(|i| {
            Arc::new(FailingProposer {
                inner: MemoryProposer::with_seed(ProposerId(i), acceptors.clone(), i),
                fail_add_preparer: i == 2,
            })
        })
        .collect();
    let target = Arc::new(MemoryAcceptor::new("mem://a4"));
    let mut rng = StdRng::seed_from_u64(3);

    let err = grow_cluster(&CancellationToken::new(), &target, &proposers, &mut rng)
        .await
        .unwrap_err();
    assert_eq!(*err.current_context(), ProtocolError::Transport);

    for proposer in &proposers {
        assert!(!proposer.inner.prepare_addresses().contains(&"mem://a4".to_owned()));
        assert!(!proposer.inner.accept_addresses().contains(&"mem://a4".to_owned()));
    }
}

#[tokio::test(start_paused = true)]
async fn gc_erases_a_deleted_key() {
    let _guard = init_tracing();
    let (proposers, acceptors) = cluster(3, 3);

    proposers[0]
        .propose("z", |_| Bytes::from_static(b"doomed"))
        .await
        .unwrap();

    // Delete: propose the empty state, keep the resulting ballot.
    let (state, ballot) = proposers[0].propose("z", |_| Bytes::new()).await.unwrap();
    let tombstone = Tombstone { ballot, state };

    let cancel = CancellationToken::new();
    let mut rng = StdRng::seed_from_u64(4);
    garbage_collect(
        &cancel,
        "z",
        &tombstone,
        &proposers,
        &acceptors,
        &RecordAges,
        &mut rng,
    )
    .await
    .unwrap();

    for acceptor in &acceptors {
        assert!(!acceptor.has_register("z"));
        // A fresh prepare sees an absent register.
        let (value, accepted) = acceptor
            .prepare("z", Ballot::new(u64::MAX, ProposerId(9)))
            .await
            .unwrap();
        assert!(value.is_empty());
        assert!(accepted.is_zero());
    }
    for proposer in &proposers {
        assert!(proposer.cached("z").is_none());
        assert_eq!(proposer.age(), Age(1));
    }
    for acceptor in &acceptors {
        for id in 0..3 {
            assert_eq!(acceptor.required_age(ProposerId(id)), Some(Age(1)));
        }
    }
}

#[tokio::test(start_paused = true)]
async fn gc_twice_is_idempotent() {
    let _guard = init_tracing();
    let (proposers, acceptors) = cluster(3, 3);

    let (state, ballot) = proposers[1].propose("z", |_| Bytes::new()).await.unwrap();
    let tombstone = Tombstone { ballot, state };

    let cancel = CancellationToken::new();
    let mut rng = StdRng::seed_from_u64(5);
    for _ in 0..2 {
        garbage_collect(
            &cancel,
            "z",
            &tombstone,
            &proposers,
            &acceptors,
            &RecordAges,
            &mut rng,
        )
        .await
        .unwrap();
    }

    for acceptor in &acceptors {
        assert!(!acceptor.has_register("z"));
    }
}

#[tokio::test(start_paused = true)]
async fn gc_on_live_key_retries_until_canceled() {
    let _guard = init_tracing();
    let (proposers, acceptors) = cluster(3, 3);

    proposers[0]
        .propose("z", |_| Bytes::from_static(b"live"))
        .await
        .unwrap();
    let tombstone = Tombstone {
        ballot: Ballot::new(1, ProposerId(0)),
        state: Bytes::new(),
    };

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        canceller.cancel();
    });

    let mut rng = StdRng::seed_from_u64(6);
    let err = garbage_collect(
        &cancel,
        "z",
        &tombstone,
        &proposers,
        &acceptors,
        &RecordAges,
        &mut rng,
    )
    .await
    .unwrap_err();
    assert_eq!(*err.current_context(), ProtocolError::Canceled);

    // Nothing was removed.
    for acceptor in &acceptors {
        assert!(acceptor.has_register("z"));
    }
}

// --- Failure injection: acceptor that can be taken down ---

struct FlakyAcceptor {
    inner: MemoryAcceptor,
    down: AtomicBool,
}

impl FlakyAcceptor {
    fn new(address: &str) -> Self {
        Self {
            inner: MemoryAcceptor::new(address),
            down: AtomicBool::new(false),
        }
    }

    fn check(&self) -> Result<(), Report<ProtocolError>> {
        if self.down.load(Ordering::SeqCst) {
            Err(Report::new(ProtocolError::Transport).attach("acceptor unreachable"))
        } else {
            Ok(())
        }
    }
}

impl Addresser for FlakyAcceptor {
    fn address(&self) -> String {
        self.inner.address()
    }
}

impl Preparer for FlakyAcceptor {
    async fn prepare(&self, key: &str, ballot: Ballot) -> Result<(Bytes, Ballot), Report<ProtocolError>> {
        self.check()?;
        self.inner.prepare(key, ballot).await
    }
}

impl Accepter for FlakyAcceptor {
    async fn accept(&self, key: &str, ballot: Ballot, value: Bytes) -> Result<(), Report<ProtocolError>> {
        self.check()?;
        self.inner.accept(key, ballot, value).await
    }
}

impl Remover for FlakyAcceptor {
    async fn remove_if_empty(&self, key: &str) -> Result<(), Report<ProtocolError>> {
        self.check()?;
        self.inner.remove_if_empty(key).await
    }
}

#[tokio::test]
async fn full_identity_read_requires_every_acceptor() {
    let _guard = init_tracing();
    let acceptors: Vec<_> = (0..3)
        .map(|i| Arc::new(FlakyAcceptor::new(&format!("mem://a{i}"))))
        .collect();
    let proposer = MemoryProposer::with_seed(ProposerId(1), acceptors.clone(), 7);

    proposer
        .propose("x", |_| Bytes::from_static(b"v"))
        .await
        .unwrap();
    acceptors[2].down.store(true, Ordering::SeqCst);

    // A majority proposal still commits...
    let (state, _) = proposer.propose("x", |x| x).await.unwrap();
    assert_eq!(state, Bytes::from_static(b"v"));

    // ...but the max-quorum read does not.
    let err = proposer.full_identity_read("x").await.unwrap_err();
    assert_eq!(*err.current_context(), ProtocolError::QuorumFailure);

    acceptors[2].down.store(false, Ordering::SeqCst);
    let state = proposer.full_identity_read("x").await.unwrap();
    assert_eq!(state, Bytes::from_static(b"v"));
}
