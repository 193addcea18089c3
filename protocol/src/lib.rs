//! Client-facing protocol of a CASPaxos replicated register.
//!
//! Every key is an independent single-decree register; every write is a
//! client-supplied change function applied atomically against the current
//! state. On top of the per-key proposer/acceptor engine sit the membership
//! procedures and the delete path:
//!
//! - **Proposers** drive two-phase prepare/accept rounds ([`Proposer`],
//!   [`MemoryProposer`])
//! - **Acceptors** keep one register per key ([`Acceptor`] and its
//!   capability traits, [`MemoryAcceptor`])
//! - **Reconfiguration** adds or removes an acceptor while every
//!   intermediate quorum keeps intersecting ([`grow_cluster`],
//!   [`shrink_cluster`])
//! - **Garbage collection** erases a deleted key cluster-wide
//!   ([`garbage_collect`], [`broadcast_identity`], [`Tombstone`])
//!
//! # Quick start
//!
//! ```ignore
//! use caspaxos_protocol::{MemoryAcceptor, MemoryProposer, Proposer, ProposerId};
//!
//! let acceptors: Vec<_> = (0..3)
//!     .map(|i| Arc::new(MemoryAcceptor::new(format!("mem://a{i}"))))
//!     .collect();
//! let proposer = MemoryProposer::new(ProposerId(1), acceptors.clone());
//!
//! let (state, ballot) = proposer.propose("greeting", |_| "hi".into()).await?;
//! ```

#![warn(clippy::pedantic)]

pub mod acceptor;
pub mod ballot;
pub mod error;
pub mod gc;
pub mod proposer;
pub mod reconfig;
mod traits;

pub use acceptor::MemoryAcceptor;
pub use ballot::{Age, Ballot, ProposerId};
pub use error::{ProtocolError, Promised, StepContext};
pub use gc::{
    AgePolicy, NoAgeEnforcement, RecordAges, Tombstone, broadcast_fast_forward,
    broadcast_identity, broadcast_remove_if_empty, garbage_collect,
};
pub use proposer::MemoryProposer;
pub use reconfig::{grow_cluster, shrink_cluster};
pub use traits::{Accepter, Acceptor, Addresser, Preparer, Proposer, Remover};

/// The zero key. Reserved for the identity reads that configuration changes
/// force; it is a real key in the register space but carries no user
/// semantics.
pub const ZEROKEY: &str = "";
