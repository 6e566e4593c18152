//! End-to-end behaviour of `ConsensusSet::accept_block`.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::rngs::OsRng;

use crate::chain::NodeStatus;
use crate::clock::{Clock, ManualClock};
use crate::consensus::ConsensusError;
use crate::consensus_set::ConsensusSet;
use crate::consistency::ConsistencyFault;
use crate::contracts::ContractError;
use crate::merkle::{build_proof, merkle_root};
use crate::storage::{MemoryStorage, SledStorage, Storage, StorageBatch, StorageError};
use crate::testing::{genesis_coin, genesis_fund, params, wallet_conditions, wallet_key, Tester};
use crate::types::{
    Block, BlockId, CoinInput, CoinOutput, ContractId, FileContract, FileContractRevision, FundInput,
    FundOutput, OutputId, ProofStatus, StorageProof, Transaction, UnlockConditions, UnlockHash,
};
use crate::validation::genesis_block;

const VALID_HASH: UnlockHash = UnlockHash([0xaa; 32]);
const MISSED_HASH: UnlockHash = UnlockHash([0xbb; 32]);

fn unbalanced_spend(tester: &Tester) -> Transaction {
    let (_, coins) = genesis_coin();
    tester.wallet_spend(
        vec![CoinOutput {
            value: coins + 1,
            unlock_hash: UnlockHash([5u8; 32]),
        }],
        Vec::new(),
        Vec::new(),
    )
}

fn random_file(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::Rng::fill(&mut OsRng, &mut data[..]);
    data
}

fn new_contract(data: &[u8], payout: u128, window_start: u64, window_end: u64) -> FileContract {
    let escrow = payout - params().contract_tax(payout);
    FileContract {
        file_size: data.len() as u64,
        file_merkle_root: merkle_root(data),
        window_start,
        window_end,
        payout,
        valid_proof_outputs: vec![CoinOutput {
            value: escrow,
            unlock_hash: VALID_HASH,
        }],
        missed_proof_outputs: vec![CoinOutput {
            value: escrow,
            unlock_hash: MISSED_HASH,
        }],
        unlock_hash: wallet_conditions().unlock_hash().unwrap(),
        revision_number: 0,
    }
}

/// Fund `contract` from the genesis wallet output in the next block.
fn form_contract(tester: &Tester, contract: FileContract) -> ContractId {
    let (_, coins) = genesis_coin();
    let change = CoinOutput {
        value: coins - contract.payout,
        unlock_hash: UnlockHash([5u8; 32]),
    };
    let txn = tester.wallet_spend(vec![change], vec![contract], Vec::new());
    let id = txn.file_contract_id(0).unwrap();
    tester.mine_and_accept(vec![txn]);
    id
}

fn proof_for(tester: &Tester, id: &ContractId, data: &[u8]) -> StorageProof {
    let segment_index = tester.cs.storage_proof_segment(id).unwrap();
    let (segment, hash_set) = build_proof(data, segment_index).unwrap();
    StorageProof {
        parent_id: *id,
        segment,
        hash_set,
    }
}

/// Memory storage whose commits fail while `failing` is set.
#[derive(Default)]
struct FlakyStorage {
    inner: MemoryStorage,
    failing: AtomicBool,
}

impl FlakyStorage {
    fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl Storage for FlakyStorage {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        self.inner.get(key)
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        self.inner.scan_prefix(prefix)
    }

    fn apply_batch(&self, batch: StorageBatch) -> Result<(), StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Corrupt("batch rejected by disk".into()));
        }
        self.inner.apply_batch(batch)
    }
}

fn flaky_set(miner: &Tester) -> ConsensusSet<FlakyStorage> {
    let clock: Arc<dyn Clock> = miner.clock.clone();
    ConsensusSet::open(params(), FlakyStorage::default(), clock).unwrap()
}

#[test]
fn genesis_and_known_blocks_report_known() {
    let tester = Tester::new(1);
    let genesis = genesis_block(&params());
    for _ in 0..3 {
        assert!(matches!(
            tester.cs.accept_block(genesis.clone()),
            Err(ConsensusError::BlockKnown)
        ));
    }

    let block = tester.mine_and_accept(Vec::new());
    assert!(matches!(
        tester.cs.accept_block(block),
        Err(ConsensusError::BlockKnown)
    ));
    assert_eq!(tester.cs.current_height(), 1);
}

#[test]
fn orphans_are_rejected() {
    let tester = Tester::new(1);
    let mut block = tester.block_on(tester.cs.current_block_id(), Vec::new());
    block.parent_id = BlockId([9u8; 32]);
    assert!(matches!(
        tester.cs.accept_block(block),
        Err(ConsensusError::Orphan)
    ));
}

#[test]
fn missed_target_is_never_cached() {
    let tester = Tester::new(1);
    let genesis_id = tester.cs.current_block_id();
    let target = tester.cs.child_target(&genesis_id).unwrap();
    let mut block = tester.block_on(genesis_id, Vec::new());
    while target.is_met_by(&block.id().unwrap()) {
        block.nonce += 1;
    }
    for _ in 0..2 {
        assert!(matches!(
            tester.cs.accept_block(block.clone()),
            Err(ConsensusError::MissedTarget)
        ));
    }
}

#[test]
fn oversized_blocks_are_rejected() {
    let tester = Tester::new(1);
    let limit = tester.cs.params().block_size_limit as usize;
    let txn = Transaction {
        arbitrary_data: vec![vec![0u8; limit]],
        ..Default::default()
    };
    let block = tester.mine(vec![txn]);
    assert!(matches!(
        tester.cs.accept_block(block),
        Err(ConsensusError::LargeBlock)
    ));
}

#[test]
fn early_timestamps_are_rejected_for_good() {
    let tester = Tester::new(1);
    let genesis_id = tester.cs.current_block_id();
    let mut block = tester.block_on(genesis_id, Vec::new());
    block.timestamp = params().genesis_timestamp - 1;
    let block = tester.solve(block);

    for _ in 0..2 {
        assert!(matches!(
            tester.cs.accept_block(block.clone()),
            Err(ConsensusError::EarlyTimestamp)
        ));
        tester.clock.advance(100);
    }
    assert!(!tester.cs.contains_block(&block.id().unwrap()));
}

#[test]
fn future_blocks_are_held_until_time_passes() {
    let tester = Tester::new(1);
    let threshold = tester.cs.params().future_threshold;
    let mut block = tester.block_on(tester.cs.current_block_id(), Vec::new());
    block.timestamp = tester.clock.now() + threshold + 1;
    let block = tester.solve(block);
    let id = block.id().unwrap();

    assert!(matches!(
        tester.cs.accept_block(block.clone()),
        Err(ConsensusError::FutureTimestamp)
    ));
    assert!(!tester.cs.contains_block(&id));
    assert_eq!(tester.cs.held_blocks(), 1);
    assert!(tester.cs.reconsider_held_blocks().is_empty());
    assert_eq!(tester.cs.current_height(), 0);

    tester.clock.advance(1);
    let results = tester.cs.reconsider_held_blocks();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].0, id);
    assert!(results[0].1.is_ok());
    assert_eq!(tester.cs.current_block_id(), id);
    assert_eq!(tester.cs.held_blocks(), 0);
}

#[test]
fn future_blocks_can_also_be_resubmitted() {
    let tester = Tester::new(1);
    let threshold = tester.cs.params().future_threshold;
    let mut block = tester.block_on(tester.cs.current_block_id(), Vec::new());
    block.timestamp = tester.clock.now() + threshold + 2;
    let block = tester.solve(block);

    assert!(matches!(
        tester.cs.accept_block(block.clone()),
        Err(ConsensusError::FutureTimestamp)
    ));
    tester.clock.advance(2);
    tester.cs.accept_block(block).unwrap();
    assert_eq!(tester.cs.current_height(), 1);
    assert_eq!(tester.cs.held_blocks(), 0);
}

#[test]
fn extreme_future_blocks_are_never_held() {
    let tester = Tester::new(1);
    let extreme = tester.cs.params().extreme_future_threshold;
    let mut block = tester.block_on(tester.cs.current_block_id(), Vec::new());
    block.timestamp = tester.clock.now() + extreme + 1;
    let block = tester.solve(block);

    assert!(matches!(
        tester.cs.accept_block(block.clone()),
        Err(ConsensusError::ExtremeFutureTimestamp)
    ));
    assert_eq!(tester.cs.held_blocks(), 0);
    tester.clock.advance(extreme + 1);
    assert!(tester.cs.reconsider_held_blocks().is_empty());
    assert!(!tester.cs.contains_block(&block.id().unwrap()));
}

#[test]
fn miner_payouts_must_match_subsidy_and_fees() {
    let tester = Tester::new(1);
    let genesis_id = tester.cs.current_block_id();
    let coinbase = tester.cs.params().coinbase(1);

    let mut overpaid = tester.block_on(genesis_id, Vec::new());
    overpaid.miner_payouts[0].value += 1;

    let mut missing = tester.block_on(genesis_id, Vec::new());
    missing.miner_payouts.clear();

    let mut zero_split = tester.block_on(genesis_id, Vec::new());
    zero_split.miner_payouts.push(CoinOutput {
        value: 0,
        unlock_hash: tester.payout,
    });

    for block in [overpaid, missing, zero_split] {
        assert!(matches!(
            tester.cs.accept_block(tester.solve(block)),
            Err(ConsensusError::BadMinerPayouts)
        ));
    }

    let mut split = tester.block_on(genesis_id, Vec::new());
    split.miner_payouts = vec![
        CoinOutput {
            value: coinbase - 1,
            unlock_hash: tester.payout,
        },
        CoinOutput {
            value: 1,
            unlock_hash: tester.payout,
        },
    ];
    tester.cs.accept_block(tester.solve(split)).unwrap();
}

#[test]
fn miner_payouts_mature_after_the_delay() {
    let tester = Tester::new(1);
    let delay = tester.cs.params().maturity_delay;
    let block = tester.mine_and_accept(Vec::new());
    let payout_id = block.miner_payout_id(0).unwrap();
    let coinbase = tester.cs.params().coinbase(1);

    assert_eq!(
        tester.cs.delayed_output(1 + delay, &payout_id).unwrap().value,
        coinbase
    );
    assert!(tester.cs.output_value(&payout_id).is_none());

    tester.mine_blocks(delay as usize - 1);
    assert!(tester.cs.output_value(&payout_id).is_none());
    tester.mine_blocks(1);
    assert_eq!(tester.cs.output_value(&payout_id), Some(coinbase));
    assert!(tester.cs.delayed_output(1 + delay, &payout_id).is_none());
}

#[test]
fn spending_coins_moves_value() {
    let tester = Tester::new(1);
    let (coin_id, coins) = genesis_coin();
    let txn = tester.wallet_spend(
        vec![CoinOutput {
            value: coins - 10,
            unlock_hash: UnlockHash([5u8; 32]),
        }],
        Vec::new(),
        vec![10],
    );
    let new_id = txn.coin_output_id(0).unwrap();
    let block = tester.mine_and_accept(vec![txn.clone()]);

    assert_eq!(tester.cs.output_value(&new_id), Some(coins - 10));
    assert!(tester.cs.output_value(&coin_id).is_none());
    assert_eq!(
        block.miner_payouts[0].value,
        tester.cs.params().coinbase(1) + 10
    );

    // The same spend again finds nothing to spend.
    let mut again = txn;
    again.arbitrary_data.push(b"again".to_vec());
    again.signatures.clear();
    again.sign(coin_id.0, 0, &wallet_key()).unwrap();
    let block = tester.mine(vec![again]);
    assert!(matches!(
        tester.cs.accept_block(block),
        Err(ConsensusError::MissingCoinOutput)
    ));
    assert_eq!(tester.cs.current_height(), 1);
}

#[test]
fn contextually_invalid_blocks_become_dos_blocks() {
    let tester = Tester::new(1);
    let block = tester.solve(tester.block_on(tester.cs.current_block_id(), vec![unbalanced_spend(&tester)]));
    let id = block.id().unwrap();

    assert!(matches!(
        tester.cs.accept_block(block.clone()),
        Err(ConsensusError::SiacoinInputOutputMismatch)
    ));
    assert!(!tester.cs.contains_block(&id));
    assert!(matches!(
        tester.cs.accept_block(block),
        Err(ConsensusError::DoSBlock)
    ));
    assert_eq!(tester.cs.current_height(), 0);
}

#[test]
fn equal_weight_keeps_first_seen_chain() {
    let tester = Tester::new(1);
    let genesis_id = tester.cs.current_block_id();
    let first = tester.mine_and_accept(Vec::new());
    let first_id = first.id().unwrap();

    let rival = tester.mine_on(genesis_id, Vec::new());
    let rival_id = rival.id().unwrap();
    assert!(matches!(
        tester.cs.accept_block(rival),
        Err(ConsensusError::NonExtendingBlock)
    ));
    assert_eq!(tester.cs.current_block_id(), first_id);
    assert_eq!(tester.cs.block_status(&rival_id), Some(NodeStatus::Pending));

    // One more block on the rival makes it heavier.
    let rival_child = tester.mine_on(rival_id, Vec::new());
    tester.cs.accept_block(rival_child.clone()).unwrap();
    assert_eq!(tester.cs.current_block_id(), rival_child.id().unwrap());
    assert_eq!(tester.cs.block_status(&first_id), Some(NodeStatus::Reverted));
    assert_eq!(tester.cs.block_status(&rival_id), Some(NodeStatus::Canonical));
}

#[test]
fn reorg_reverts_and_reapplies_to_identical_digests() {
    let clock = Arc::new(ManualClock::new(params().genesis_timestamp));
    let a = Tester::with_clock(1, clock.clone());
    let b = Tester::with_clock(2, clock.clone());
    let fresh = Tester::with_clock(3, clock);

    let (_, coins) = genesis_coin();
    let spend = a.wallet_spend(
        vec![CoinOutput {
            value: coins,
            unlock_hash: UnlockHash([6u8; 32]),
        }],
        Vec::new(),
        Vec::new(),
    );
    let a1 = a.mine_and_accept(vec![spend]);
    let a1_id = a1.id().unwrap();

    let b_blocks = b.mine_blocks(2);
    a.feed(&b_blocks);
    assert_eq!(a.cs.current_block_id(), b.cs.current_block_id());
    assert_eq!(a.cs.ledger_digest().unwrap(), b.cs.ledger_digest().unwrap());
    assert_eq!(a.cs.block_status(&a1_id), Some(NodeStatus::Reverted));

    // Grow the first branch past the second; a1 comes back from its cache.
    let mut a_blocks = vec![a1];
    for _ in 0..3 {
        let parent = a_blocks.last().unwrap().id().unwrap();
        let block = a.mine_on(parent, Vec::new());
        a.feed(std::slice::from_ref(&block));
        a_blocks.push(block);
    }
    assert_eq!(a.cs.current_block_id(), a_blocks[3].id().unwrap());
    assert_eq!(a.cs.block_status(&a1_id), Some(NodeStatus::Canonical));

    fresh.feed(&a_blocks);
    assert_eq!(fresh.cs.current_block_id(), a.cs.current_block_id());
    assert_eq!(a.cs.ledger_digest().unwrap(), fresh.cs.ledger_digest().unwrap());
}

#[test]
fn independent_testers_converge() {
    let clock = Arc::new(ManualClock::new(params().genesis_timestamp));
    let testers: Vec<Tester> = (1..=3)
        .map(|tag| Tester::with_clock(tag, clock.clone()))
        .collect();

    let chains: Vec<Vec<Block>> = testers
        .iter()
        .zip([3usize, 5, 4])
        .map(|(tester, count)| tester.mine_blocks(count))
        .collect();
    let heaviest = chains[1].last().unwrap().id().unwrap();

    for tester in &testers {
        for chain in &chains {
            tester.feed(chain);
        }
    }
    let digest = testers[0].cs.ledger_digest().unwrap();
    for tester in &testers {
        assert_eq!(tester.cs.current_block_id(), heaviest);
        assert_eq!(tester.cs.current_height(), 5);
        assert_eq!(tester.cs.ledger_digest().unwrap(), digest);
    }

    // The first tester now builds on the common chain.
    let extension = testers[0].mine_blocks(2);
    for tester in &testers[1..] {
        tester.feed(&extension);
    }
    let digest = testers[0].cs.ledger_digest().unwrap();
    for tester in &testers {
        assert_eq!(tester.cs.current_height(), 7);
        assert_eq!(tester.cs.ledger_digest().unwrap(), digest);
    }
}

#[test]
fn buried_invalid_branch_is_purged_when_it_gets_heavier() {
    let tester = Tester::new(1);
    let genesis_id = tester.cs.current_block_id();
    tester.mine_blocks(2);
    let tip = tester.cs.current_block_id();
    let digest = tester.cs.ledger_digest().unwrap();

    let bad = tester.solve(tester.block_on(genesis_id, vec![unbalanced_spend(&tester)]));
    let bad_id = bad.id().unwrap();
    assert!(matches!(
        tester.cs.accept_block(bad),
        Err(ConsensusError::NonExtendingBlock)
    ));
    let child = tester.mine_on(bad_id, Vec::new());
    let child_id = child.id().unwrap();
    assert!(matches!(
        tester.cs.accept_block(child.clone()),
        Err(ConsensusError::NonExtendingBlock)
    ));
    let grandchild = tester.mine_on(child_id, Vec::new());
    let grandchild_id = grandchild.id().unwrap();

    assert!(matches!(
        tester.cs.accept_block(grandchild),
        Err(ConsensusError::SiacoinInputOutputMismatch)
    ));
    for id in [bad_id, child_id, grandchild_id] {
        assert!(!tester.cs.contains_block(&id));
    }
    assert_eq!(tester.cs.current_block_id(), tip);
    assert_eq!(tester.cs.ledger_digest().unwrap(), digest);

    // Only the failing block is poisoned; its child is simply an orphan now.
    assert!(matches!(
        tester.cs.accept_block(child),
        Err(ConsensusError::Orphan)
    ));
}

#[test]
fn file_contract_paid_by_valid_proof() {
    let tester = Tester::new(1);
    let delay = tester.cs.params().maturity_delay;
    let data = random_file(1_000);
    let payout = 100 * tester.cs.params().coin_precision;
    let contract = new_contract(&data, payout, 3, 6);
    let escrow = contract.valid_proof_outputs[0].value;

    let id = form_contract(&tester, contract);
    let view = tester.cs.contract_state(&id).unwrap();
    assert_eq!(view.escrow, escrow);
    assert_eq!(view.payout, payout);
    assert_eq!(tester.cs.fee_pool(), payout - escrow);

    // Height 2 is the trigger block for the proof.
    tester.mine_blocks(1);
    let proof = Transaction {
        storage_proofs: vec![proof_for(&tester, &id, &data)],
        ..Default::default()
    };
    tester.mine_and_accept(vec![proof]);
    assert_eq!(tester.cs.current_height(), 3);
    assert!(tester.cs.contract_state(&id).is_none());

    let valid_id = id.storage_proof_output_id(ProofStatus::Valid, 0);
    let missed_id = id.storage_proof_output_id(ProofStatus::Missed, 0);
    assert_eq!(tester.cs.delayed_output(3 + delay, &valid_id).unwrap().value, escrow);

    tester.mine_blocks(delay as usize);
    assert_eq!(tester.cs.output_value(&valid_id), Some(escrow));
    assert!(tester.cs.output_value(&missed_id).is_none());
    assert!(tester.cs.delayed_output(6 + delay, &missed_id).is_none());
}

#[test]
fn file_contract_pays_missed_outputs_when_window_closes() {
    let tester = Tester::new(1);
    let delay = tester.cs.params().maturity_delay;
    let data = random_file(300);
    let contract = new_contract(&data, 100 * tester.cs.params().coin_precision, 3, 6);
    let escrow = contract.missed_proof_outputs[0].value;
    let id = form_contract(&tester, contract);

    tester.mine_blocks(4);
    assert_eq!(tester.cs.current_height(), 5);
    assert!(tester.cs.contract_state(&id).is_some());

    tester.mine_blocks(1);
    assert!(tester.cs.contract_state(&id).is_none());
    let missed_id = id.storage_proof_output_id(ProofStatus::Missed, 0);
    let valid_id = id.storage_proof_output_id(ProofStatus::Valid, 0);
    assert_eq!(tester.cs.delayed_output(6 + delay, &missed_id).unwrap().value, escrow);
    assert!(tester.cs.delayed_output(6 + delay, &valid_id).is_none());

    tester.mine_blocks(delay as usize);
    assert_eq!(tester.cs.output_value(&missed_id), Some(escrow));
    assert!(tester.cs.output_value(&valid_id).is_none());
}

#[test]
fn bad_storage_proofs_are_rejected() {
    let tester = Tester::new(1);
    let data = random_file(1_000);
    let contract = new_contract(&data, 100 * tester.cs.params().coin_precision, 3, 6);
    let id = form_contract(&tester, contract);
    tester.mine_blocks(1);

    let mut proof = proof_for(&tester, &id, &data);
    proof.segment[0] ^= 0xff;
    let block = tester.mine(vec![Transaction {
        storage_proofs: vec![proof],
        ..Default::default()
    }]);
    assert!(matches!(
        tester.cs.accept_block(block.clone()),
        Err(ConsensusError::FileContract(ContractError::InvalidStorageProof))
    ));
    assert!(matches!(
        tester.cs.accept_block(block),
        Err(ConsensusError::DoSBlock)
    ));
    assert!(tester.cs.contract_state(&id).is_some());
}

#[test]
fn revisions_replace_contract_terms() {
    let tester = Tester::new(1);
    let data = random_file(500);
    let contract = new_contract(&data, 100 * tester.cs.params().coin_precision, 3, 6);
    let id = form_contract(&tester, contract.clone());

    let revision = |number: u64| {
        let mut txn = Transaction {
            file_contract_revisions: vec![FileContractRevision {
                parent_id: id,
                unlock_conditions: wallet_conditions(),
                new_revision_number: number,
                new_file_size: contract.file_size,
                new_file_merkle_root: contract.file_merkle_root,
                new_window_start: 4,
                new_window_end: 8,
                new_valid_proof_outputs: contract.valid_proof_outputs.clone(),
                new_missed_proof_outputs: contract.missed_proof_outputs.clone(),
                new_unlock_hash: contract.unlock_hash,
            }],
            arbitrary_data: vec![number.to_le_bytes().to_vec()],
            ..Default::default()
        };
        txn.sign(id.0, 0, &wallet_key()).unwrap();
        txn
    };

    tester.mine_and_accept(vec![revision(1)]);
    let view = tester.cs.contract_state(&id).unwrap();
    assert_eq!(view.revision_number, 1);
    assert_eq!((view.window_start, view.window_end), (4, 8));

    let stale = tester.mine(vec![revision(1)]);
    assert!(matches!(
        tester.cs.accept_block(stale),
        Err(ConsensusError::FileContract(
            ContractError::RevisionNumberNotIncreasing { .. }
        ))
    ));
    assert_eq!(tester.cs.contract_state(&id).unwrap().revision_number, 1);
}

#[test]
fn revisions_are_refused_once_the_window_opens() {
    let tester = Tester::new(1);
    let data = random_file(500);
    let contract = new_contract(&data, 100 * tester.cs.params().coin_precision, 3, 6);
    let id = form_contract(&tester, contract.clone());
    tester.mine_blocks(1);

    let mut txn = Transaction {
        file_contract_revisions: vec![FileContractRevision {
            parent_id: id,
            unlock_conditions: wallet_conditions(),
            new_revision_number: 1,
            new_file_size: contract.file_size,
            new_file_merkle_root: [0x11; 32],
            new_window_start: 5,
            new_window_end: 9,
            new_valid_proof_outputs: contract.valid_proof_outputs.clone(),
            new_missed_proof_outputs: contract.missed_proof_outputs.clone(),
            new_unlock_hash: contract.unlock_hash,
        }],
        ..Default::default()
    };
    txn.sign(id.0, 0, &wallet_key()).unwrap();

    // Mined at height 3, the first height of the window.
    let late = tester.mine(vec![txn]);
    assert!(matches!(
        tester.cs.accept_block(late),
        Err(ConsensusError::FileContract(
            ContractError::RevisionAfterWindowStart {
                window_start: 3,
                height: 3
            }
        ))
    ));
    let view = tester.cs.contract_state(&id).unwrap();
    assert_eq!(view.revision_number, 0);
    assert_eq!(view.file_merkle_root, contract.file_merkle_root);
    assert_eq!((view.window_start, view.window_end), (3, 6));
}

#[test]
fn fund_shares_claim_their_part_of_the_fee_pool() {
    let tester = Tester::new(1);
    let delay = tester.cs.params().maturity_delay;
    let fund_count = tester.cs.params().fund_count;
    let data = random_file(64);
    form_contract(&tester, new_contract(&data, 400_000_000, 3, 6));
    assert_eq!(tester.cs.fee_pool(), 15_600_000);

    let fund_id = genesis_fund();
    let claim_hash = UnlockHash([0xcc; 32]);
    let txn = Transaction {
        fund_inputs: vec![FundInput {
            parent_id: fund_id,
            unlock_conditions: UnlockConditions::anyone_can_spend(),
            claim_unlock_hash: claim_hash,
        }],
        fund_outputs: vec![FundOutput {
            value: fund_count,
            unlock_hash: UnlockHash([0xdd; 32]),
            claim_start: 0,
        }],
        ..Default::default()
    };
    let new_fund = txn.fund_output_id(0).unwrap();
    tester.mine_and_accept(vec![txn]);

    let expected = 15_600_000 / fund_count * fund_count;
    let claim_id = fund_id.claim_output_id();
    let claim = tester.cs.delayed_output(2 + delay, &claim_id).unwrap();
    assert_eq!(claim.value, expected);
    assert_eq!(claim.unlock_hash, claim_hash);
    assert!(tester.cs.fund_output(&fund_id).is_none());
    assert_eq!(tester.cs.fund_output(&new_fund).unwrap().claim_start, 15_600_000);

    tester.mine_blocks(delay as usize);
    assert_eq!(tester.cs.output_value(&claim_id), Some(expected));
}

#[test]
fn split_fund_shares_claim_in_proportion() {
    let tester = Tester::new(1);
    let delay = tester.cs.params().maturity_delay;
    let fund_count = tester.cs.params().fund_count;
    let (coin_id, coins) = genesis_coin();
    let payout = 400_000_000;

    let mut first = Transaction {
        coin_inputs: vec![CoinInput {
            parent_id: coin_id,
            unlock_conditions: wallet_conditions(),
        }],
        coin_outputs: vec![CoinOutput {
            value: coins - payout,
            unlock_hash: wallet_conditions().unlock_hash().unwrap(),
        }],
        file_contracts: vec![new_contract(&random_file(64), payout, 3, 6)],
        ..Default::default()
    };
    first.sign(coin_id.0, 0, &wallet_key()).unwrap();
    let change_id = first.coin_output_id(0).unwrap();
    tester.mine_and_accept(vec![first]);
    assert_eq!(tester.cs.fee_pool(), 15_600_000);

    let anyone = UnlockConditions::anyone_can_spend();
    let split = Transaction {
        fund_inputs: vec![FundInput {
            parent_id: genesis_fund(),
            unlock_conditions: anyone.clone(),
            claim_unlock_hash: UnlockHash([0xcc; 32]),
        }],
        fund_outputs: vec![
            FundOutput {
                value: fund_count - 1,
                unlock_hash: anyone.unlock_hash().unwrap(),
                claim_start: 0,
            },
            FundOutput {
                value: 1,
                unlock_hash: anyone.unlock_hash().unwrap(),
                claim_start: 0,
            },
        ],
        ..Default::default()
    };
    let large = split.fund_output_id(0).unwrap();
    let small = split.fund_output_id(1).unwrap();
    tester.mine_and_accept(vec![split]);
    assert_eq!(tester.cs.fund_output(&large).unwrap().claim_start, 15_600_000);
    assert_eq!(tester.cs.fund_output(&small).unwrap().claim_start, 15_600_000);

    let mut second = Transaction {
        coin_inputs: vec![CoinInput {
            parent_id: change_id,
            unlock_conditions: wallet_conditions(),
        }],
        coin_outputs: vec![CoinOutput {
            value: coins - 2 * payout,
            unlock_hash: UnlockHash([5u8; 32]),
        }],
        file_contracts: vec![new_contract(&random_file(64), payout, 5, 8)],
        ..Default::default()
    };
    second.sign(change_id.0, 0, &wallet_key()).unwrap();
    tester.mine_and_accept(vec![second]);
    assert_eq!(tester.cs.fee_pool(), 31_200_000);

    let claim = |hash: u8| UnlockHash([hash; 32]);
    let spend = Transaction {
        fund_inputs: vec![
            FundInput {
                parent_id: large,
                unlock_conditions: anyone.clone(),
                claim_unlock_hash: claim(0xd1),
            },
            FundInput {
                parent_id: small,
                unlock_conditions: anyone.clone(),
                claim_unlock_hash: claim(0xd2),
            },
        ],
        fund_outputs: vec![FundOutput {
            value: fund_count,
            unlock_hash: UnlockHash([0xdd; 32]),
            claim_start: 0,
        }],
        ..Default::default()
    };
    tester.mine_and_accept(vec![spend]);

    let per_share = (31_200_000 - 15_600_000) / fund_count;
    let large_claim = tester.cs.delayed_output(4 + delay, &large.claim_output_id()).unwrap();
    let small_claim = tester.cs.delayed_output(4 + delay, &small.claim_output_id()).unwrap();
    assert_eq!(small_claim.value, per_share);
    assert_eq!(small_claim.unlock_hash, claim(0xd2));
    assert_eq!(large_claim.value, per_share * (fund_count - 1));
    assert_eq!(large_claim.unlock_hash, claim(0xd1));

    tester.mine_blocks(delay as usize);
    assert_eq!(tester.cs.output_value(&small.claim_output_id()), Some(per_share));
}

#[test]
fn inconsistent_ledger_halts_the_set() {
    let tester = Tester::new(1);
    tester.mine_blocks(1);
    tester.cs.state.write().ledger.coin_outputs.insert(
        OutputId([0xee; 32]),
        CoinOutput {
            value: 1,
            unlock_hash: UnlockHash::default(),
        },
    );

    let block = tester.mine(Vec::new());
    let result = catch_unwind(AssertUnwindSafe(|| tester.cs.accept_block(block.clone())));
    let payload = result.expect_err("audit must halt on extra coins");
    assert!(matches!(
        payload.downcast_ref::<ConsistencyFault>(),
        Some(ConsistencyFault::CoinSupply { .. })
    ));

    assert!(tester.cs.is_halted());
    assert!(matches!(
        tester.cs.accept_block(block),
        Err(ConsensusError::Halted)
    ));
}

#[test]
fn failed_commit_keeps_the_previous_tip() {
    let miner = Tester::new(1);
    let blocks = miner.mine_blocks(2);
    let cs = flaky_set(&miner);
    cs.accept_block(blocks[0].clone()).unwrap();
    let digest = cs.ledger_digest().unwrap();
    let next = blocks[1].id().unwrap();

    cs.storage().set_failing(true);
    assert!(matches!(
        cs.accept_block(blocks[1].clone()),
        Err(ConsensusError::Storage(_))
    ));
    assert_eq!(cs.current_height(), 1);
    assert_eq!(cs.current_block_id(), blocks[0].id().unwrap());
    assert!(!cs.contains_block(&next));
    assert_eq!(cs.ledger_digest().unwrap(), digest);
    assert!(!cs.is_halted());

    cs.storage().set_failing(false);
    cs.accept_block(blocks[1].clone()).unwrap();
    assert_eq!(cs.current_block_id(), next);
    assert_eq!(cs.ledger_digest().unwrap(), miner.cs.ledger_digest().unwrap());
}

#[test]
fn failed_commit_undoes_a_reorg() {
    let miner = Tester::new(1);
    let genesis_id = miner.cs.current_block_id();
    let main = miner.mine_and_accept(Vec::new());
    let side = miner.mine_on(genesis_id, Vec::new());
    miner.feed(&[side.clone()]);
    let side_child = miner.mine_on(side.id().unwrap(), Vec::new());

    let cs = flaky_set(&miner);
    cs.accept_block(main.clone()).unwrap();
    let digest = cs.ledger_digest().unwrap();

    cs.storage().set_failing(true);
    assert!(matches!(
        cs.accept_block(side.clone()),
        Err(ConsensusError::Storage(_))
    ));
    assert!(!cs.contains_block(&side.id().unwrap()));

    cs.storage().set_failing(false);
    assert!(matches!(
        cs.accept_block(side.clone()),
        Err(ConsensusError::NonExtendingBlock)
    ));

    cs.storage().set_failing(true);
    assert!(matches!(
        cs.accept_block(side_child.clone()),
        Err(ConsensusError::Storage(_))
    ));
    assert_eq!(cs.current_block_id(), main.id().unwrap());
    assert_eq!(cs.block_status(&main.id().unwrap()), Some(NodeStatus::Canonical));
    assert!(!cs.contains_block(&side_child.id().unwrap()));
    assert_eq!(cs.ledger_digest().unwrap(), digest);

    cs.storage().set_failing(false);
    cs.accept_block(side_child.clone()).unwrap();
    assert_eq!(cs.current_block_id(), side_child.id().unwrap());
    assert_eq!(cs.current_height(), 2);
}

#[test]
fn invalid_blocks_are_not_cached_when_the_commit_fails() {
    let miner = Tester::new(1);
    let bad = miner.solve(miner.block_on(miner.cs.current_block_id(), vec![unbalanced_spend(&miner)]));
    let cs = flaky_set(&miner);

    cs.storage().set_failing(true);
    assert!(matches!(
        cs.accept_block(bad.clone()),
        Err(ConsensusError::Storage(_))
    ));

    cs.storage().set_failing(false);
    assert!(matches!(
        cs.accept_block(bad.clone()),
        Err(ConsensusError::SiacoinInputOutputMismatch)
    ));
    assert!(matches!(cs.accept_block(bad), Err(ConsensusError::DoSBlock)));
}

#[test]
fn chain_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let miner = Tester::new(1);
    let blocks = miner.mine_blocks(3);
    let side = miner.mine_on(blocks[0].id().unwrap(), Vec::new());
    let bad = miner.solve(miner.block_on(blocks[2].id().unwrap(), vec![unbalanced_spend(&miner)]));
    let clock: Arc<dyn Clock> = miner.clock.clone();

    let (tip, digest) = {
        let cs = ConsensusSet::open(params(), SledStorage::new(dir.path()).unwrap(), clock.clone())
            .unwrap();
        for block in &blocks {
            cs.accept_block(block.clone()).unwrap();
        }
        assert!(matches!(
            cs.accept_block(side.clone()),
            Err(ConsensusError::NonExtendingBlock)
        ));
        assert!(matches!(
            cs.accept_block(bad.clone()),
            Err(ConsensusError::SiacoinInputOutputMismatch)
        ));
        cs.storage().flush().unwrap();
        (cs.current_block_id(), cs.ledger_digest().unwrap())
    };

    let cs = ConsensusSet::open(params(), SledStorage::new(dir.path()).unwrap(), clock.clone())
        .unwrap();
    assert_eq!(cs.current_height(), 3);
    assert_eq!(cs.current_block_id(), tip);
    assert_eq!(cs.ledger_digest().unwrap(), digest);
    assert_eq!(
        cs.block_status(&side.id().unwrap()),
        Some(NodeStatus::Pending)
    );
    assert!(matches!(cs.accept_block(bad), Err(ConsensusError::DoSBlock)));
    assert!(matches!(
        cs.accept_block(blocks[1].clone()),
        Err(ConsensusError::BlockKnown)
    ));
    drop(cs);

    let mut other = params();
    other.genesis_timestamp += 1;
    assert!(matches!(
        ConsensusSet::open(other, SledStorage::new(dir.path()).unwrap(), clock),
        Err(ConsensusError::GenesisMismatch)
    ));
}

#[test]
fn readers_see_whole_blocks_while_a_writer_runs() {
    let miner = Tester::new(1);
    let blocks = miner.mine_blocks(6);
    let follower = Tester::with_clock(2, miner.clock.clone());

    std::thread::scope(|scope| {
        scope.spawn(|| follower.feed(&blocks));
        for _ in 0..2 {
            scope.spawn(|| {
                let mut last = 0;
                while last < 6 {
                    let height = follower.cs.current_height();
                    assert!(height >= last);
                    assert!(follower.cs.block_at_height(height).is_some());
                    last = height;
                }
            });
        }
    });
    assert_eq!(follower.cs.current_block_id(), miner.cs.current_block_id());
}
