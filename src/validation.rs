//! Transaction validation and block diff generation.
//!
//! `generate_block_diffs` is the only place a block's transactions are
//! checked against the ledger. It reads the ledger at the block's parent
//! through a [`PendingLedger`] overlay and never mutates it, so a block that
//! fails leaves no trace.

use std::collections::{BTreeMap, BTreeSet};

use ed25519_dalek::Signature;

use crate::config::ConsensusParams;
use crate::consensus::ConsensusError;
use crate::contracts::{check_new_contract, check_revision, check_storage_proof, ContractError};
use crate::diff::{DiffDirection, DiffSet, LedgerDiff};
use crate::ledger::{Ledger, LedgerView, PendingLedger};
use crate::merkle::SEGMENT_SIZE;
use crate::types::{
    Block, BlockHeight, BlockId, CoinOutput, Currency, FundOutput, Hash256, ProofStatus, Transaction,
    UnlockConditions, UnlockHash,
};

/// Ids of the blocks on the chain being extended, by height.
pub trait CanonicalIds {
    fn canonical_id(&self, height: BlockHeight) -> Option<BlockId>;
}

fn add(a: Currency, b: Currency) -> Result<Currency, ConsensusError> {
    a.checked_add(b)
        .ok_or_else(|| ConsensusError::InvalidTransaction("value overflow".into()))
}

fn sum(mut values: impl Iterator<Item = Currency>) -> Result<Currency, ConsensusError> {
    values.try_fold(0, add)
}

/// Rules that depend only on the transaction itself.
pub fn check_transaction_standalone(txn: &Transaction) -> Result<(), ConsensusError> {
    if txn.coin_outputs.iter().any(|output| output.value == 0)
        || txn.fund_outputs.iter().any(|output| output.value == 0)
    {
        return Err(ConsensusError::InvalidTransaction("zero-valued output".into()));
    }

    if !txn.storage_proofs.is_empty()
        && (!txn.coin_outputs.is_empty()
            || !txn.file_contracts.is_empty()
            || !txn.file_contract_revisions.is_empty())
    {
        return Err(ConsensusError::InvalidTransaction(
            "storage proof transactions may not create outputs, contracts or revisions".into(),
        ));
    }
    if let Some(proof) = txn
        .storage_proofs
        .iter()
        .find(|proof| proof.segment.len() > SEGMENT_SIZE)
    {
        return Err(ContractError::SegmentTooLarge(proof.segment.len()).into());
    }

    let mut seen = BTreeSet::new();
    let parents = txn
        .coin_inputs
        .iter()
        .map(|input| input.parent_id.0)
        .chain(txn.fund_inputs.iter().map(|input| input.parent_id.0))
        .chain(txn.file_contract_revisions.iter().map(|rev| rev.parent_id.0))
        .chain(txn.storage_proofs.iter().map(|proof| proof.parent_id.0));
    for parent in parents {
        if !seen.insert(parent) {
            return Err(ConsensusError::InvalidTransaction(format!(
                "{} is spent twice in one transaction",
                hex::encode(parent)
            )));
        }
    }
    Ok(())
}

/// Every input must carry exactly `signatures_required` valid signatures
/// from distinct keys, and no signature may name an unknown input.
pub fn check_signatures(txn: &Transaction, height: BlockHeight) -> Result<(), ConsensusError> {
    let mut required: BTreeMap<Hash256, (&UnlockConditions, BTreeSet<u64>)> = BTreeMap::new();
    let conditions = txn
        .coin_inputs
        .iter()
        .map(|input| (input.parent_id.0, &input.unlock_conditions))
        .chain(
            txn.fund_inputs
                .iter()
                .map(|input| (input.parent_id.0, &input.unlock_conditions)),
        )
        .chain(
            txn.file_contract_revisions
                .iter()
                .map(|rev| (rev.parent_id.0, &rev.unlock_conditions)),
        );
    for (parent, unlock) in conditions {
        if unlock.timelock > height {
            return Err(ConsensusError::InvalidTransaction(format!(
                "input is timelocked until height {}",
                unlock.timelock
            )));
        }
        required.insert(parent, (unlock, BTreeSet::new()));
    }

    if txn.signatures.is_empty() {
        if required.values().any(|(unlock, _)| unlock.signatures_required > 0) {
            return Err(ConsensusError::InvalidSignature("missing signatures".into()));
        }
        return Ok(());
    }

    let id = txn.id()?;
    for sig in &txn.signatures {
        let (unlock, used) = required.get_mut(&sig.parent_id).ok_or_else(|| {
            ConsensusError::InvalidSignature("signature for an unknown input".into())
        })?;
        let key = usize::try_from(sig.public_key_index)
            .ok()
            .and_then(|index| unlock.public_keys.get(index))
            .ok_or_else(|| ConsensusError::InvalidSignature("public key index out of range".into()))?;
        if !used.insert(sig.public_key_index) {
            return Err(ConsensusError::InvalidSignature("public key used twice".into()));
        }
        let signature: Signature = sig.signature.into();
        key.verify(id.as_bytes(), &signature)
            .map_err(|err| ConsensusError::InvalidSignature(err.to_string()))?;
    }

    for (unlock, used) in required.values() {
        if used.len() as u64 != unlock.signatures_required {
            return Err(ConsensusError::InvalidSignature(format!(
                "{} signatures given, {} required",
                used.len(),
                unlock.signatures_required
            )));
        }
    }
    Ok(())
}

fn check_unlock(unlock: &UnlockConditions, expected: &UnlockHash) -> Result<(), ConsensusError> {
    if unlock.unlock_hash()? != *expected {
        return Err(ConsensusError::UnlockHashMismatch);
    }
    Ok(())
}

struct BlockContext<'a> {
    height: BlockHeight,
    params: &'a ConsensusParams,
    canonical: &'a dyn CanonicalIds,
}

impl BlockContext<'_> {
    fn maturity(&self) -> BlockHeight {
        self.height + self.params.maturity_delay
    }
}

fn apply_transaction(
    pending: &mut PendingLedger<'_>,
    txn: &Transaction,
    ctx: &BlockContext<'_>,
) -> Result<(), ConsensusError> {
    // Coins.
    let mut coins_in: Currency = 0;
    for input in &txn.coin_inputs {
        let output = pending
            .coin_output(&input.parent_id)
            .ok_or(ConsensusError::MissingCoinOutput)?;
        check_unlock(&input.unlock_conditions, &output.unlock_hash)?;
        coins_in = add(coins_in, output.value)?;
        pending.record(LedgerDiff::CoinOutput {
            direction: DiffDirection::Revert,
            id: input.parent_id,
            output,
        });
    }
    let coins_out = sum(txn
        .coin_outputs
        .iter()
        .map(|output| output.value)
        .chain(txn.file_contracts.iter().map(|fc| fc.payout))
        .chain(txn.miner_fees.iter().copied()))?;
    if coins_in != coins_out {
        return Err(ConsensusError::SiacoinInputOutputMismatch);
    }
    for (index, output) in txn.coin_outputs.iter().enumerate() {
        pending.record(LedgerDiff::CoinOutput {
            direction: DiffDirection::Apply,
            id: txn.coin_output_id(index)?,
            output: output.clone(),
        });
    }

    // Contracts.
    for (index, contract) in txn.file_contracts.iter().enumerate() {
        check_new_contract(contract, ctx.height, ctx.params)?;
        pending.record(LedgerDiff::FileContract {
            direction: DiffDirection::Apply,
            id: txn.file_contract_id(index)?,
            contract: contract.clone(),
        });
        let previous = pending.fee_pool();
        let adjusted = previous
            .checked_add(ctx.params.contract_tax(contract.payout))
            .ok_or_else(|| ConsensusError::InvalidTransaction("fee pool overflow".into()))?;
        pending.record(LedgerDiff::FeePool { previous, adjusted });
    }

    for revision in &txn.file_contract_revisions {
        let current = pending
            .file_contract(&revision.parent_id)
            .ok_or(ConsensusError::MissingFileContract)?;
        let revised = check_revision(&current, revision, ctx.height, ctx.params)?;
        pending.record(LedgerDiff::FileContract {
            direction: DiffDirection::Revert,
            id: revision.parent_id,
            contract: current,
        });
        pending.record(LedgerDiff::FileContract {
            direction: DiffDirection::Apply,
            id: revision.parent_id,
            contract: revised,
        });
    }

    for proof in &txn.storage_proofs {
        let contract = pending
            .file_contract(&proof.parent_id)
            .ok_or(ConsensusError::MissingFileContract)?;
        let trigger_height = contract.window_start.saturating_sub(1);
        let trigger = ctx
            .canonical
            .canonical_id(trigger_height)
            .ok_or(ContractError::MissingTrigger(trigger_height))?;
        check_storage_proof(&proof.parent_id, &contract, proof, ctx.height, &trigger)?;
        for (index, output) in contract.valid_proof_outputs.iter().enumerate() {
            pending.record(LedgerDiff::DelayedOutput {
                direction: DiffDirection::Apply,
                maturity_height: ctx.maturity(),
                id: proof.parent_id.storage_proof_output_id(ProofStatus::Valid, index),
                output: output.clone(),
            });
        }
        pending.record(LedgerDiff::FileContract {
            direction: DiffDirection::Revert,
            id: proof.parent_id,
            contract,
        });
    }

    // Funds.
    let mut funds_in: Currency = 0;
    for input in &txn.fund_inputs {
        let output = pending
            .fund_output(&input.parent_id)
            .ok_or(ConsensusError::MissingFundOutput)?;
        check_unlock(&input.unlock_conditions, &output.unlock_hash)?;
        funds_in = add(funds_in, output.value)?;

        let pool = pending.fee_pool();
        let claim = pool.saturating_sub(output.claim_start) / ctx.params.fund_count * output.value;
        if claim > 0 {
            pending.record(LedgerDiff::DelayedOutput {
                direction: DiffDirection::Apply,
                maturity_height: ctx.maturity(),
                id: input.parent_id.claim_output_id(),
                output: CoinOutput {
                    value: claim,
                    unlock_hash: input.claim_unlock_hash,
                },
            });
        }
        pending.record(LedgerDiff::FundOutput {
            direction: DiffDirection::Revert,
            id: input.parent_id,
            output,
        });
    }
    let funds_out = sum(txn.fund_outputs.iter().map(|output| output.value))?;
    if funds_in != funds_out {
        return Err(ConsensusError::FundInputOutputMismatch);
    }
    let claim_start = pending.fee_pool();
    for (index, output) in txn.fund_outputs.iter().enumerate() {
        pending.record(LedgerDiff::FundOutput {
            direction: DiffDirection::Apply,
            id: txn.fund_output_id(index)?,
            output: FundOutput {
                value: output.value,
                unlock_hash: output.unlock_hash,
                claim_start,
            },
        });
    }
    Ok(())
}

/// Compute the diffs of `block` applied at `height` on top of `ledger`,
/// validating every transaction on the way.
pub fn generate_block_diffs(
    block: &Block,
    height: BlockHeight,
    ledger: &Ledger,
    params: &ConsensusParams,
    canonical: &dyn CanonicalIds,
) -> Result<DiffSet, ConsensusError> {
    let block_id = block.id()?;
    let ctx = BlockContext {
        height,
        params,
        canonical,
    };
    let mut pending = PendingLedger::new(ledger);

    for txn in &block.transactions {
        check_transaction_standalone(txn)?;
        check_signatures(txn, height)?;
        apply_transaction(&mut pending, txn, &ctx)?;
    }

    for (index, payout) in block.miner_payouts.iter().enumerate() {
        pending.record(LedgerDiff::DelayedOutput {
            direction: DiffDirection::Apply,
            maturity_height: ctx.maturity(),
            id: block.miner_payout_id(index)?,
            output: payout.clone(),
        });
    }

    let matured: Vec<_> = pending
        .base()
        .delayed_at(height)
        .map(|(id, output)| (*id, output.clone()))
        .collect();
    for (id, output) in matured {
        pending.record(LedgerDiff::DelayedOutput {
            direction: DiffDirection::Revert,
            maturity_height: height,
            id,
            output: output.clone(),
        });
        pending.record(LedgerDiff::CoinOutput {
            direction: DiffDirection::Apply,
            id,
            output,
        });
    }

    let expiring: Vec<_> = pending
        .base()
        .file_contracts()
        .filter(|(_, contract)| contract.window_end == height)
        .map(|(id, _)| *id)
        .collect();
    for id in expiring {
        let Some(contract) = pending.file_contract(&id) else {
            continue;
        };
        if contract.window_end != height {
            continue;
        }
        for (index, output) in contract.missed_proof_outputs.iter().enumerate() {
            pending.record(LedgerDiff::DelayedOutput {
                direction: DiffDirection::Apply,
                maturity_height: ctx.maturity(),
                id: id.storage_proof_output_id(ProofStatus::Missed, index),
                output: output.clone(),
            });
        }
        pending.record(LedgerDiff::FileContract {
            direction: DiffDirection::Revert,
            id,
            contract,
        });
    }

    Ok(DiffSet::new(block_id, height, pending.into_diffs()))
}

/// The genesis block for `params`: one transaction carrying every genesis
/// allocation.
pub fn genesis_block(params: &ConsensusParams) -> Block {
    Block {
        parent_id: BlockId::default(),
        nonce: 0,
        timestamp: params.genesis_timestamp,
        miner_payouts: Vec::new(),
        transactions: vec![Transaction {
            coin_outputs: params.genesis_coin_outputs.clone(),
            fund_outputs: params
                .genesis_fund_outputs
                .iter()
                .map(|output| FundOutput {
                    claim_start: 0,
                    ..output.clone()
                })
                .collect(),
            ..Default::default()
        }],
    }
}

/// Diffs of the genesis block. Genesis is trusted and skips validation.
pub fn genesis_diffs(block: &Block) -> Result<DiffSet, ConsensusError> {
    let mut diffs = Vec::new();
    for txn in &block.transactions {
        for (index, output) in txn.coin_outputs.iter().enumerate() {
            diffs.push(LedgerDiff::CoinOutput {
                direction: DiffDirection::Apply,
                id: txn.coin_output_id(index)?,
                output: output.clone(),
            });
        }
        for (index, output) in txn.fund_outputs.iter().enumerate() {
            diffs.push(LedgerDiff::FundOutput {
                direction: DiffDirection::Apply,
                id: txn.fund_output_id(index)?,
                output: output.clone(),
            });
        }
    }
    Ok(DiffSet::new(block.id()?, 0, diffs))
}
