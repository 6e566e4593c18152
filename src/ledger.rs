//! Ledger State.
//!
//! The ledger holds the unspent coin and fund outputs, open file contracts,
//! delayed outputs keyed by maturity height and the fee pool. It is mutated
//! only through [`crate::diff::DiffSet`]; every other component reads it
//! through [`LedgerView`].

use std::collections::BTreeMap;
use std::fmt::Display;

use crate::consistency::{halt, ConsistencyFault};
use crate::diff::{DiffDirection, LedgerDiff};
use crate::types::{
    encode, hash_all, BlockHeight, CoinOutput, ContractId, CryptoError, Currency, FileContract,
    FundOutput, FundOutputId, Hash256, OutputId,
};

/// Point lookups against some version of the ledger.
pub trait LedgerView {
    fn coin_output(&self, id: &OutputId) -> Option<CoinOutput>;
    fn fund_output(&self, id: &FundOutputId) -> Option<FundOutput>;
    fn file_contract(&self, id: &ContractId) -> Option<FileContract>;
    fn fee_pool(&self) -> Currency;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ledger {
    pub(crate) coin_outputs: BTreeMap<OutputId, CoinOutput>,
    pub(crate) fund_outputs: BTreeMap<FundOutputId, FundOutput>,
    pub(crate) file_contracts: BTreeMap<ContractId, FileContract>,
    /// Never holds an empty inner map.
    pub(crate) delayed_outputs: BTreeMap<BlockHeight, BTreeMap<OutputId, CoinOutput>>,
    pub(crate) fee_pool: Currency,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delayed_output(&self, maturity_height: BlockHeight, id: &OutputId) -> Option<&CoinOutput> {
        self.delayed_outputs.get(&maturity_height)?.get(id)
    }

    /// Delayed outputs that mature at exactly `height`.
    pub fn delayed_at(&self, height: BlockHeight) -> impl Iterator<Item = (&OutputId, &CoinOutput)> {
        self.delayed_outputs
            .get(&height)
            .into_iter()
            .flat_map(|bucket| bucket.iter())
    }

    pub fn coin_outputs(&self) -> impl Iterator<Item = (&OutputId, &CoinOutput)> {
        self.coin_outputs.iter()
    }

    pub fn fund_outputs(&self) -> impl Iterator<Item = (&FundOutputId, &FundOutput)> {
        self.fund_outputs.iter()
    }

    pub fn file_contracts(&self) -> impl Iterator<Item = (&ContractId, &FileContract)> {
        self.file_contracts.iter()
    }

    pub fn delayed_outputs(&self) -> impl Iterator<Item = (BlockHeight, &OutputId, &CoinOutput)> {
        self.delayed_outputs
            .iter()
            .flat_map(|(height, bucket)| bucket.iter().map(move |(id, output)| (*height, id, output)))
    }

    /// SHA-256 over the canonical encoding of every map and the fee pool.
    ///
    /// Two ledgers have equal digests exactly when their contents are equal,
    /// independent of the order in which entries were inserted.
    pub fn digest(&self) -> Result<Hash256, CryptoError> {
        let encoded = encode(&(
            &self.coin_outputs,
            &self.fund_outputs,
            &self.file_contracts,
            &self.delayed_outputs,
            self.fee_pool,
        ))?;
        Ok(hash_all(&[b"ledger", &encoded]))
    }

    /// Commit one diff moving in direction `mode`. Inserting an entry that
    /// already exists, or removing one that is absent or different, halts.
    pub(crate) fn commit(&mut self, diff: &LedgerDiff, mode: DiffDirection) {
        match diff {
            LedgerDiff::CoinOutput {
                direction,
                id,
                output,
            } => {
                if direction.creates_under(mode) {
                    insert_unique(&mut self.coin_outputs, "coin output", *id, output);
                } else {
                    remove_exact(&mut self.coin_outputs, "coin output", *id, output);
                }
            }
            LedgerDiff::FundOutput {
                direction,
                id,
                output,
            } => {
                if direction.creates_under(mode) {
                    insert_unique(&mut self.fund_outputs, "fund output", *id, output);
                } else {
                    remove_exact(&mut self.fund_outputs, "fund output", *id, output);
                }
            }
            LedgerDiff::FileContract {
                direction,
                id,
                contract,
            } => {
                if direction.creates_under(mode) {
                    insert_unique(&mut self.file_contracts, "file contract", *id, contract);
                } else {
                    remove_exact(&mut self.file_contracts, "file contract", *id, contract);
                }
            }
            LedgerDiff::DelayedOutput {
                direction,
                maturity_height,
                id,
                output,
            } => {
                if direction.creates_under(mode) {
                    let bucket = self.delayed_outputs.entry(*maturity_height).or_default();
                    insert_unique(bucket, "delayed output", *id, output);
                } else {
                    let Some(bucket) = self.delayed_outputs.get_mut(maturity_height) else {
                        halt(ConsistencyFault::MissingEntry {
                            kind: "delayed output",
                            id: id.to_string(),
                        })
                    };
                    remove_exact(bucket, "delayed output", *id, output);
                    if bucket.is_empty() {
                        self.delayed_outputs.remove(maturity_height);
                    }
                }
            }
            LedgerDiff::FeePool { previous, adjusted } => {
                let (from, to) = match mode {
                    DiffDirection::Apply => (*previous, *adjusted),
                    DiffDirection::Revert => (*adjusted, *previous),
                };
                if self.fee_pool != from {
                    halt(ConsistencyFault::FeePoolMismatch {
                        expected: from,
                        found: self.fee_pool,
                    });
                }
                self.fee_pool = to;
            }
        }
    }
}

impl LedgerView for Ledger {
    fn coin_output(&self, id: &OutputId) -> Option<CoinOutput> {
        self.coin_outputs.get(id).cloned()
    }

    fn fund_output(&self, id: &FundOutputId) -> Option<FundOutput> {
        self.fund_outputs.get(id).cloned()
    }

    fn file_contract(&self, id: &ContractId) -> Option<FileContract> {
        self.file_contracts.get(id).cloned()
    }

    fn fee_pool(&self) -> Currency {
        self.fee_pool
    }
}

fn insert_unique<K, V>(map: &mut BTreeMap<K, V>, kind: &'static str, id: K, value: &V)
where
    K: Ord + Display,
    V: Clone,
{
    if map.contains_key(&id) {
        halt(ConsistencyFault::DuplicateEntry {
            kind,
            id: id.to_string(),
        });
    }
    map.insert(id, value.clone());
}

fn remove_exact<K, V>(map: &mut BTreeMap<K, V>, kind: &'static str, id: K, value: &V)
where
    K: Ord + Display,
    V: PartialEq,
{
    match map.remove(&id) {
        None => halt(ConsistencyFault::MissingEntry {
            kind,
            id: id.to_string(),
        }),
        Some(existing) if existing != *value => halt(ConsistencyFault::EntryMismatch {
            kind,
            id: id.to_string(),
        }),
        Some(_) => {}
    }
}

/// Ledger overlay used while a block's diffs are being generated.
///
/// Each recorded diff is reflected in the overlay, so later transactions in
/// the same block see the effects of earlier ones while the base ledger
/// stays untouched.
pub(crate) struct PendingLedger<'a> {
    base: &'a Ledger,
    coin_outputs: BTreeMap<OutputId, Option<CoinOutput>>,
    fund_outputs: BTreeMap<FundOutputId, Option<FundOutput>>,
    file_contracts: BTreeMap<ContractId, Option<FileContract>>,
    fee_pool: Currency,
    diffs: Vec<LedgerDiff>,
}

impl<'a> PendingLedger<'a> {
    pub(crate) fn new(base: &'a Ledger) -> Self {
        Self {
            base,
            coin_outputs: BTreeMap::new(),
            fund_outputs: BTreeMap::new(),
            file_contracts: BTreeMap::new(),
            fee_pool: base.fee_pool,
            diffs: Vec::new(),
        }
    }

    pub(crate) fn base(&self) -> &Ledger {
        self.base
    }

    pub(crate) fn record(&mut self, diff: LedgerDiff) {
        let creates = |direction: &DiffDirection| direction.creates_under(DiffDirection::Apply);
        match &diff {
            LedgerDiff::CoinOutput {
                direction,
                id,
                output,
            } => {
                let entry = creates(direction).then(|| output.clone());
                self.coin_outputs.insert(*id, entry);
            }
            LedgerDiff::FundOutput {
                direction,
                id,
                output,
            } => {
                let entry = creates(direction).then(|| output.clone());
                self.fund_outputs.insert(*id, entry);
            }
            LedgerDiff::FileContract {
                direction,
                id,
                contract,
            } => {
                let entry = creates(direction).then(|| contract.clone());
                self.file_contracts.insert(*id, entry);
            }
            LedgerDiff::DelayedOutput { .. } => {}
            LedgerDiff::FeePool { adjusted, .. } => self.fee_pool = *adjusted,
        }
        self.diffs.push(diff);
    }

    pub(crate) fn into_diffs(self) -> Vec<LedgerDiff> {
        self.diffs
    }
}

impl LedgerView for PendingLedger<'_> {
    fn coin_output(&self, id: &OutputId) -> Option<CoinOutput> {
        match self.coin_outputs.get(id) {
            Some(entry) => entry.clone(),
            None => self.base.coin_output(id),
        }
    }

    fn fund_output(&self, id: &FundOutputId) -> Option<FundOutput> {
        match self.fund_outputs.get(id) {
            Some(entry) => entry.clone(),
            None => self.base.fund_output(id),
        }
    }

    fn file_contract(&self, id: &ContractId) -> Option<FileContract> {
        match self.file_contracts.get(id) {
            Some(entry) => entry.clone(),
            None => self.base.file_contract(id),
        }
    }

    fn fee_pool(&self) -> Currency {
        self.fee_pool
    }
}
