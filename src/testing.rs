//! Test harness: a consensus set with a funded wallet and a miner that
//! solves the easy targets of `ConsensusParams::testing`.

use std::sync::Arc;

use ed25519_dalek::SigningKey;

use crate::clock::{Clock, ManualClock};
use crate::config::ConsensusParams;
use crate::consensus_set::ConsensusSet;
use crate::storage::MemoryStorage;
use crate::types::{
    Block, BlockId, CoinInput, CoinOutput, Currency, FundOutput, FundOutputId, OutputId,
    PublicKey, Transaction, UnlockConditions, UnlockHash,
};
use crate::validation::genesis_block;

/// Every tester shares the wallet, so their genesis blocks match.
pub fn wallet_key() -> SigningKey {
    SigningKey::from_bytes(&[7u8; 32])
}

pub fn wallet_conditions() -> UnlockConditions {
    UnlockConditions::standard(PublicKey::from(wallet_key().verifying_key()))
}

pub fn params() -> ConsensusParams {
    let mut params = ConsensusParams::testing();
    params.genesis_coin_outputs = vec![CoinOutput {
        value: 1_000 * params.coin_precision,
        unlock_hash: wallet_conditions().unlock_hash().unwrap(),
    }];
    params.genesis_fund_outputs = vec![FundOutput {
        value: params.fund_count,
        unlock_hash: UnlockConditions::anyone_can_spend().unlock_hash().unwrap(),
        claim_start: 0,
    }];
    params
}

pub fn genesis_coin() -> (OutputId, Currency) {
    let params = params();
    let genesis = genesis_block(&params);
    (
        genesis.transactions[0].coin_output_id(0).unwrap(),
        params.genesis_coin_outputs[0].value,
    )
}

pub fn genesis_fund() -> FundOutputId {
    genesis_block(&params()).transactions[0].fund_output_id(0).unwrap()
}

pub struct Tester {
    pub cs: ConsensusSet<MemoryStorage>,
    pub clock: Arc<ManualClock>,
    /// Where this tester's miner payouts go
    pub payout: UnlockHash,
}

impl Tester {
    pub fn new(tag: u8) -> Self {
        let clock = Arc::new(ManualClock::new(params().genesis_timestamp));
        Self::with_clock(tag, clock)
    }

    /// A tester reading the same clock as others, so blocks mined by one are
    /// never in the future for another.
    pub fn with_clock(tag: u8, clock: Arc<ManualClock>) -> Self {
        let shared: Arc<dyn Clock> = clock.clone();
        let cs = ConsensusSet::open(params(), MemoryStorage::new(), shared).unwrap();
        Self {
            cs,
            clock,
            payout: UnlockHash([tag; 32]),
        }
    }

    /// An unsolved child of `parent` paying the subsidy and fees to this
    /// tester.
    pub fn block_on(&self, parent: BlockId, transactions: Vec<Transaction>) -> Block {
        let height = self.cs.block_height(&parent).expect("parent is known") + 1;
        let fees: Currency = transactions.iter().map(Transaction::total_miner_fees).sum();
        let earliest = self
            .cs
            .earliest_child_timestamp(&parent)
            .expect("parent is known");
        Block {
            parent_id: parent,
            nonce: 0,
            timestamp: earliest.max(self.clock.now()),
            miner_payouts: vec![CoinOutput {
                value: self.cs.params().coinbase(height) + fees,
                unlock_hash: self.payout,
            }],
            transactions,
        }
    }

    /// Search nonces until the block meets its parent's child target.
    pub fn solve(&self, mut block: Block) -> Block {
        let target = self
            .cs
            .child_target(&block.parent_id)
            .expect("parent is known");
        while !target.is_met_by(&block.id().unwrap()) {
            block.nonce += 1;
        }
        block
    }

    pub fn mine_on(&self, parent: BlockId, transactions: Vec<Transaction>) -> Block {
        let block = self.solve(self.block_on(parent, transactions));
        self.clock.advance(self.cs.params().block_frequency);
        block
    }

    pub fn mine(&self, transactions: Vec<Transaction>) -> Block {
        self.mine_on(self.cs.current_block_id(), transactions)
    }

    pub fn mine_and_accept(&self, transactions: Vec<Transaction>) -> Block {
        let block = self.mine(transactions);
        self.cs.accept_block(block.clone()).unwrap();
        block
    }

    pub fn mine_blocks(&self, count: usize) -> Vec<Block> {
        (0..count).map(|_| self.mine_and_accept(Vec::new())).collect()
    }

    /// Spend the genesis wallet output into `outputs` plus `fees`, with a
    /// signature from the wallet key.
    pub fn wallet_spend(
        &self,
        outputs: Vec<CoinOutput>,
        contracts: Vec<crate::types::FileContract>,
        fees: Vec<Currency>,
    ) -> Transaction {
        let (coin_id, _) = genesis_coin();
        let mut txn = Transaction {
            coin_inputs: vec![CoinInput {
                parent_id: coin_id,
                unlock_conditions: wallet_conditions(),
            }],
            coin_outputs: outputs,
            file_contracts: contracts,
            miner_fees: fees,
            ..Default::default()
        };
        txn.sign(coin_id.0, 0, &wallet_key()).unwrap();
        txn
    }

    /// Submit every block, ignoring non-extending and known results.
    pub fn feed(&self, blocks: &[Block]) {
        for block in blocks {
            let _ = self.cs.accept_block(block.clone());
        }
    }
}
