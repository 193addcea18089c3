//! In-memory acceptor: one register per key behind a single lock.

use std::collections::BTreeMap;
use std::sync::Mutex;

use bytes::Bytes;
use error_stack::Report;
use tracing::trace;

use crate::ballot::{Age, Ballot, ProposerId};
use crate::error::{ProtocolError, Promised};
use crate::traits::{Accepter, Addresser, Preparer, Remover};

/// Per-key acceptor state. An absent register is equivalent to zero ballots
/// and an empty value.
#[derive(Clone, Debug, Default)]
struct Register {
    promised: Ballot,
    accepted: Ballot,
    value: Bytes,
}

/// A complete in-memory acceptor.
///
/// Prepare and accept are atomic against each other per acceptor (a single
/// lock guards the register map), which covers the required per
/// (acceptor, key) atomicity.
pub struct MemoryAcceptor {
    address: String,
    registers: Mutex<BTreeMap<String, Register>>,
    ages: Mutex<BTreeMap<ProposerId, Age>>,
}

impl MemoryAcceptor {
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            registers: Mutex::new(BTreeMap::new()),
            ages: Mutex::new(BTreeMap::new()),
        }
    }

    /// Record the minimum age required of each proposer, as broadcast by
    /// garbage collection. Ages only ratchet forward.
    ///
    /// Rejection of messages from proposers below their recorded age is left
    /// to a policy layer; this acceptor only records.
    pub fn observe_ages(&self, ages: &[(ProposerId, Age)]) {
        let mut recorded = self.ages.lock().unwrap();
        for &(id, age) in ages {
            let entry = recorded.entry(id).or_default();
            if age > *entry {
                *entry = age;
            }
        }
    }

    /// The minimum age recorded for a proposer, if any.
    #[must_use]
    pub fn required_age(&self, id: ProposerId) -> Option<Age> {
        self.ages.lock().unwrap().get(&id).copied()
    }

    /// Whether a register exists for `key`.
    #[must_use]
    pub fn has_register(&self, key: &str) -> bool {
        self.registers.lock().unwrap().contains_key(key)
    }
}

impl Addresser for MemoryAcceptor {
    fn address(&self) -> String {
        self.address.clone()
    }
}

impl Preparer for MemoryAcceptor {
    async fn prepare(
        &self,
        key: &str,
        ballot: Ballot,
    ) -> Result<(Bytes, Ballot), Report<ProtocolError>> {
        let mut registers = self.registers.lock().unwrap();
        let current = registers.get(key).cloned().unwrap_or_default();

        if ballot > current.promised {
            trace!(acceptor = %self.address, key, %ballot, "promised");
            registers.insert(
                key.to_owned(),
                Register {
                    promised: ballot,
                    ..current.clone()
                },
            );
            Ok((current.value, current.accepted))
        } else {
            trace!(acceptor = %self.address, key, %ballot, promised = %current.promised, "prepare conflict");
            Err(Report::new(ProtocolError::Conflict).attach(Promised(current.promised)))
        }
    }
}

impl Accepter for MemoryAcceptor {
    async fn accept(
        &self,
        key: &str,
        ballot: Ballot,
        value: Bytes,
    ) -> Result<(), Report<ProtocolError>> {
        let mut registers = self.registers.lock().unwrap();
        let current = registers.get(key).cloned().unwrap_or_default();

        if ballot >= current.promised {
            trace!(acceptor = %self.address, key, %ballot, "accepted");
            registers.insert(
                key.to_owned(),
                Register {
                    promised: ballot,
                    accepted: ballot,
                    value,
                },
            );
            Ok(())
        } else {
            trace!(acceptor = %self.address, key, %ballot, promised = %current.promised, "accept conflict");
            Err(Report::new(ProtocolError::Conflict).attach(Promised(current.promised)))
        }
    }
}

impl Remover for MemoryAcceptor {
    async fn remove_if_empty(&self, key: &str) -> Result<(), Report<ProtocolError>> {
        let mut registers = self.registers.lock().unwrap();
        match registers.get(key) {
            // Already gone; removal is idempotent.
            None => Ok(()),
            Some(register) if !register.value.is_empty() => {
                Err(Report::new(ProtocolError::NotEmpty).attach("register holds a value"))
            }
            Some(register) if register.accepted.is_zero() => {
                Err(Report::new(ProtocolError::NotEmpty).attach("register was never accepted"))
            }
            Some(_) => {
                trace!(acceptor = %self.address, key, "register removed");
                registers.remove(key);
                Ok(())
            }
        }
    }
}
