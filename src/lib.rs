// src/lib.rs

pub mod types;
pub mod target;
pub mod merkle;
pub mod config;
pub mod clock;
pub mod ledger;
pub mod diff;
pub mod contracts;
pub mod validation;
pub mod consensus;
pub mod chain;
pub mod fork;
pub mod consistency;
pub mod storage;
pub mod consensus_set;

#[cfg(test)]
mod testing;
#[cfg(test)]
mod acceptance;

pub use config::ConsensusParams;
pub use consensus::{ConsensusEngine, ConsensusError, ProofOfWork};
pub use consensus_set::ConsensusSet;
pub use consistency::ConsistencyFault;
pub use storage::{MemoryStorage, SledStorage, Storage, StorageError};
