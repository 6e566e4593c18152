//! Reversible ledger deltas.
//!
//! Every change a block makes to the ledger is recorded as a `LedgerDiff`.
//! A block's diffs are computed once into a `DiffSet` and then applied or
//! reverted as a unit; `revert(apply(ledger)) == ledger` exactly.

use serde::{Deserialize, Serialize};

use crate::ledger::Ledger;
use crate::types::{
    BlockHeight, BlockId, CoinOutput, ContractId, Currency, FileContract, FundOutput, FundOutputId,
    OutputId,
};

/// Whether a diff adds its entry (`Apply`) or removes it (`Revert`) when
/// the block it belongs to is applied. Reverting the block inverts it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiffDirection {
    Apply,
    Revert,
}

impl DiffDirection {
    /// True when a diff recorded with `self` inserts its entry while the
    /// ledger moves in direction `mode`.
    pub fn creates_under(self, mode: DiffDirection) -> bool {
        self == mode
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerDiff {
    CoinOutput {
        direction: DiffDirection,
        id: OutputId,
        output: CoinOutput,
    },
    FundOutput {
        direction: DiffDirection,
        id: FundOutputId,
        output: FundOutput,
    },
    FileContract {
        direction: DiffDirection,
        id: ContractId,
        contract: FileContract,
    },
    DelayedOutput {
        direction: DiffDirection,
        maturity_height: BlockHeight,
        id: OutputId,
        output: CoinOutput,
    },
    FeePool {
        previous: Currency,
        adjusted: Currency,
    },
}

/// All diffs produced by one block, in the order they were generated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSet {
    pub block_id: BlockId,
    pub height: BlockHeight,
    pub diffs: Vec<LedgerDiff>,
}

impl DiffSet {
    pub fn new(block_id: BlockId, height: BlockHeight, diffs: Vec<LedgerDiff>) -> Self {
        Self {
            block_id,
            height,
            diffs,
        }
    }

    /// Apply the diffs in order. A diff that does not match the ledger is a
    /// consistency fault and halts.
    pub fn apply(&self, ledger: &mut Ledger) {
        for diff in &self.diffs {
            ledger.commit(diff, DiffDirection::Apply);
        }
    }

    /// Undo [`DiffSet::apply`] by inverting each diff in reverse order.
    pub fn revert(&self, ledger: &mut Ledger) {
        for diff in self.diffs.iter().rev() {
            ledger.commit(diff, DiffDirection::Revert);
        }
    }

    pub fn len(&self) -> usize {
        self.diffs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.diffs.is_empty()
    }
}
