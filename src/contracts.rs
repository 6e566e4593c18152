//! File contract rules.
//!
//! A file contract escrows `payout - tax` until either a storage proof is
//! submitted inside `[window_start, window_end)` or the window closes. The
//! tax goes to the fee pool when the contract is formed. Revisions may
//! replace everything but the payout, up to the start of the window.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConsensusParams;
use crate::merkle::{segment_count, verify_segment, SEGMENT_SIZE};
use crate::types::{
    hash_all, BlockHeight, BlockId, CoinOutput, ContractId, CryptoError, Currency, FileContract,
    FileContractRevision, ProofStatus, StorageProof, UnlockHash,
};

#[derive(Debug, Error)]
pub enum ContractError {
    #[error("File contract has a zero payout")]
    ZeroPayout,
    #[error("File contract has a zero-valued output")]
    ZeroValuedOutput,
    #[error("Proof window starts at {window_start}, which is not after height {height}")]
    WindowStartInPast {
        window_start: BlockHeight,
        height: BlockHeight,
    },
    #[error("Proof window [{window_start}, {window_end}) is empty")]
    EmptyWindow {
        window_start: BlockHeight,
        window_end: BlockHeight,
    },
    #[error("{status:?} proof outputs sum to {found}, expected {expected}")]
    OutputSumMismatch {
        status: ProofStatus,
        expected: Currency,
        found: Currency,
    },
    #[error("Revision submitted at height {height}, once the window opened at {window_start}")]
    RevisionAfterWindowStart {
        window_start: BlockHeight,
        height: BlockHeight,
    },
    #[error("Revision number {proposed} does not exceed {current}")]
    RevisionNumberNotIncreasing { current: u64, proposed: u64 },
    #[error("Revision unlock conditions do not match the contract")]
    RevisionUnlockMismatch,
    #[error("Storage proof at height {height} is outside window [{window_start}, {window_end})")]
    ProofOutsideWindow {
        window_start: BlockHeight,
        window_end: BlockHeight,
        height: BlockHeight,
    },
    #[error("Storage proof segment is {0} bytes")]
    SegmentTooLarge(usize),
    #[error("Storage proof does not match the file merkle root")]
    InvalidStorageProof,
    #[error("No canonical block at height {0} to seed the storage proof")]
    MissingTrigger(BlockHeight),
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

/// Read-only snapshot of an open contract, as returned by queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileContractView {
    pub id: ContractId,
    pub file_size: u64,
    pub file_merkle_root: [u8; 32],
    pub window_start: BlockHeight,
    pub window_end: BlockHeight,
    pub payout: Currency,
    /// Coins held until the contract resolves
    pub escrow: Currency,
    pub valid_proof_outputs: Vec<CoinOutput>,
    pub missed_proof_outputs: Vec<CoinOutput>,
    pub unlock_hash: UnlockHash,
    pub revision_number: u64,
}

impl FileContractView {
    pub fn new(id: ContractId, contract: &FileContract, params: &ConsensusParams) -> Self {
        Self {
            id,
            file_size: contract.file_size,
            file_merkle_root: contract.file_merkle_root,
            window_start: contract.window_start,
            window_end: contract.window_end,
            payout: contract.payout,
            escrow: escrow(contract, params),
            valid_proof_outputs: contract.valid_proof_outputs.clone(),
            missed_proof_outputs: contract.missed_proof_outputs.clone(),
            unlock_hash: contract.unlock_hash,
            revision_number: contract.revision_number,
        }
    }
}

/// Coins a contract holds after the tax has been taken.
pub fn escrow(contract: &FileContract, params: &ConsensusParams) -> Currency {
    contract.payout - params.contract_tax(contract.payout)
}

fn output_sum(outputs: &[CoinOutput]) -> Currency {
    outputs
        .iter()
        .fold(0, |acc, output| acc.saturating_add(output.value))
}

fn check_outputs(
    status: ProofStatus,
    outputs: &[CoinOutput],
    expected: Currency,
) -> Result<(), ContractError> {
    if outputs.iter().any(|output| output.value == 0) {
        return Err(ContractError::ZeroValuedOutput);
    }
    let found = output_sum(outputs);
    if found != expected {
        return Err(ContractError::OutputSumMismatch {
            status,
            expected,
            found,
        });
    }
    Ok(())
}

fn check_window(
    window_start: BlockHeight,
    window_end: BlockHeight,
    height: BlockHeight,
) -> Result<(), ContractError> {
    if window_start <= height {
        return Err(ContractError::WindowStartInPast {
            window_start,
            height,
        });
    }
    if window_end <= window_start {
        return Err(ContractError::EmptyWindow {
            window_start,
            window_end,
        });
    }
    Ok(())
}

/// Rules for a contract formed in a block at `height`.
pub fn check_new_contract(
    contract: &FileContract,
    height: BlockHeight,
    params: &ConsensusParams,
) -> Result<(), ContractError> {
    if contract.payout == 0 {
        return Err(ContractError::ZeroPayout);
    }
    check_window(contract.window_start, contract.window_end, height)?;
    let expected = escrow(contract, params);
    check_outputs(ProofStatus::Valid, &contract.valid_proof_outputs, expected)?;
    check_outputs(ProofStatus::Missed, &contract.missed_proof_outputs, expected)?;
    Ok(())
}

/// Check `revision` against the contract it replaces and return the revised
/// contract. The payout never changes.
pub fn check_revision(
    current: &FileContract,
    revision: &FileContractRevision,
    height: BlockHeight,
    params: &ConsensusParams,
) -> Result<FileContract, ContractError> {
    if height >= current.window_start {
        return Err(ContractError::RevisionAfterWindowStart {
            window_start: current.window_start,
            height,
        });
    }
    if revision.new_revision_number <= current.revision_number {
        return Err(ContractError::RevisionNumberNotIncreasing {
            current: current.revision_number,
            proposed: revision.new_revision_number,
        });
    }
    if revision.unlock_conditions.unlock_hash()? != current.unlock_hash {
        return Err(ContractError::RevisionUnlockMismatch);
    }
    check_window(revision.new_window_start, revision.new_window_end, height)?;

    let expected = escrow(current, params);
    check_outputs(ProofStatus::Valid, &revision.new_valid_proof_outputs, expected)?;
    check_outputs(ProofStatus::Missed, &revision.new_missed_proof_outputs, expected)?;

    Ok(FileContract {
        file_size: revision.new_file_size,
        file_merkle_root: revision.new_file_merkle_root,
        window_start: revision.new_window_start,
        window_end: revision.new_window_end,
        payout: current.payout,
        valid_proof_outputs: revision.new_valid_proof_outputs.clone(),
        missed_proof_outputs: revision.new_missed_proof_outputs.clone(),
        unlock_hash: revision.new_unlock_hash,
        revision_number: revision.new_revision_number,
    })
}

/// Segment a proof for `contract_id` must reveal, seeded by the block at
/// `window_start - 1`.
pub fn storage_proof_segment(trigger: &BlockId, contract_id: &ContractId, file_size: u64) -> u64 {
    let segments = segment_count(file_size);
    if segments == 0 {
        return 0;
    }
    let seed = hash_all(&[trigger.as_bytes(), contract_id.as_bytes()]);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&seed[..8]);
    u64::from_be_bytes(prefix) % segments
}

/// Verify `proof` against the open contract it names at `height`.
pub fn check_storage_proof(
    contract_id: &ContractId,
    contract: &FileContract,
    proof: &StorageProof,
    height: BlockHeight,
    trigger: &BlockId,
) -> Result<(), ContractError> {
    if height < contract.window_start || height >= contract.window_end {
        return Err(ContractError::ProofOutsideWindow {
            window_start: contract.window_start,
            window_end: contract.window_end,
            height,
        });
    }
    if proof.segment.len() > SEGMENT_SIZE {
        return Err(ContractError::SegmentTooLarge(proof.segment.len()));
    }
    let index = storage_proof_segment(trigger, contract_id, contract.file_size);
    let verified = verify_segment(
        &proof.segment,
        &proof.hash_set,
        segment_count(contract.file_size),
        index,
        &contract.file_merkle_root,
    );
    if !verified {
        return Err(ContractError::InvalidStorageProof);
    }
    Ok(())
}
