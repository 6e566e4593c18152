use thiserror::Error;

use crate::config::{ConfigError, ConsensusParams};
use crate::contracts::ContractError;
use crate::storage::StorageError;
use crate::target::Target;
use crate::types::{Block, BlockHeight, CryptoError, Timestamp};

/// Outcomes of `accept_block` other than success.
#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("Block is known to be invalid")]
    DoSBlock,
    #[error("Block already exists in the block tree")]
    BlockKnown,
    #[error("Block's parent is unknown")]
    Orphan,
    #[error("Block does not meet its target")]
    MissedTarget,
    #[error("Block exceeds the size limit")]
    LargeBlock,
    #[error("Block timestamp is too early")]
    EarlyTimestamp,
    #[error("Block timestamp is too far in the future, block held for reconsideration")]
    FutureTimestamp,
    #[error("Block timestamp is too far in the future to be considered")]
    ExtremeFutureTimestamp,
    #[error("Block has invalid miner payouts")]
    BadMinerPayouts,
    #[error("Block does not extend the heaviest chain")]
    NonExtendingBlock,
    #[error("Transaction coin inputs do not equal its outputs")]
    SiacoinInputOutputMismatch,
    #[error("Transaction fund inputs do not equal its outputs")]
    FundInputOutputMismatch,
    #[error("Transaction spends a coin output that does not exist")]
    MissingCoinOutput,
    #[error("Transaction spends a fund output that does not exist")]
    MissingFundOutput,
    #[error("Transaction references a file contract that does not exist")]
    MissingFileContract,
    #[error("Unlock conditions do not match the output being spent")]
    UnlockHashMismatch,
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),
    #[error("File contract error: {0}")]
    FileContract(#[from] ContractError),
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Consensus set halted after a consistency fault")]
    Halted,
    #[error("Stored chain does not start at this genesis block")]
    GenesisMismatch,
}

impl ConsensusError {
    /// True when the error comes from validating a block's transactions
    /// against the ledger. Such a verdict never changes for the same block,
    /// so the block is remembered as invalid.
    pub fn is_contextual(&self) -> bool {
        matches!(
            self,
            ConsensusError::SiacoinInputOutputMismatch
                | ConsensusError::FundInputOutputMismatch
                | ConsensusError::MissingCoinOutput
                | ConsensusError::MissingFundOutput
                | ConsensusError::MissingFileContract
                | ConsensusError::UnlockHashMismatch
                | ConsensusError::InvalidSignature(_)
                | ConsensusError::InvalidTransaction(_)
                | ConsensusError::FileContract(_)
        )
    }
}

/// What the header checks need to know about a block's parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParentContext {
    /// Height of the parent; the candidate sits one above it
    pub height: BlockHeight,
    /// Target every child of the parent must meet
    pub child_target: Target,
    /// Median of the parent's recent ancestor timestamps
    pub earliest_timestamp: Timestamp,
}

/// Header-level validation that needs no ledger state.
pub trait ConsensusEngine: Send + Sync {
    fn validate_header(
        &self,
        block: &Block,
        parent: &ParentContext,
        now: Timestamp,
    ) -> Result<(), ConsensusError>;
}

/// Proof-of-work header rules.
pub struct ProofOfWork {
    params: ConsensusParams,
}

impl ProofOfWork {
    pub fn new(params: ConsensusParams) -> Self {
        Self { params }
    }

    /// Miner payouts must be present, non-zero and sum to the subsidy plus
    /// every fee in the block.
    pub fn check_miner_payouts(&self, block: &Block, height: BlockHeight) -> Result<(), ConsensusError> {
        if block.miner_payouts.is_empty() || block.miner_payouts.iter().any(|p| p.value == 0) {
            return Err(ConsensusError::BadMinerPayouts);
        }
        let mut expected = self.params.coinbase(height);
        for txn in &block.transactions {
            for fee in &txn.miner_fees {
                expected = expected.checked_add(*fee).ok_or(ConsensusError::BadMinerPayouts)?;
            }
        }
        let mut paid: u128 = 0;
        for payout in &block.miner_payouts {
            paid = paid.checked_add(payout.value).ok_or(ConsensusError::BadMinerPayouts)?;
        }
        if paid != expected {
            return Err(ConsensusError::BadMinerPayouts);
        }
        Ok(())
    }
}

impl ConsensusEngine for ProofOfWork {
    fn validate_header(
        &self,
        block: &Block,
        parent: &ParentContext,
        now: Timestamp,
    ) -> Result<(), ConsensusError> {
        let id = block.id()?;
        if !parent.child_target.is_met_by(&id) {
            return Err(ConsensusError::MissedTarget);
        }
        if block.encoded_size()? > self.params.block_size_limit {
            return Err(ConsensusError::LargeBlock);
        }
        if block.timestamp < parent.earliest_timestamp {
            return Err(ConsensusError::EarlyTimestamp);
        }
        self.check_miner_payouts(block, parent.height + 1)?;
        if block.timestamp > now.saturating_add(self.params.extreme_future_threshold) {
            return Err(ConsensusError::ExtremeFutureTimestamp);
        }
        if block.timestamp > now.saturating_add(self.params.future_threshold) {
            return Err(ConsensusError::FutureTimestamp);
        }
        Ok(())
    }
}
