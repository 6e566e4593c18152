//! The consensus set: one owned chain state behind a single-writer lock.
//!
//! `accept_block` runs the full pipeline (negative cache, duplicate and
//! orphan checks, header validation, tree insertion, fork choice) under the
//! write lock. Queries take the read lock and always see a fully applied
//! chain.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::chain::{ChainIndex, NodeIndex, NodeStatus};
use crate::clock::{Clock, SystemClock};
use crate::config::ConsensusParams;
use crate::consensus::{ConsensusEngine, ConsensusError, ParentContext, ProofOfWork};
use crate::consistency::{audit, halt, ConsistencyFault};
use crate::contracts::{storage_proof_segment, ContractError, FileContractView};
use crate::fork::fork_to;
use crate::ledger::{Ledger, LedgerView};
use crate::storage::{Storage, StorageBatch, StorageError};
use crate::target::Target;
use crate::types::{
    hash_all, Block, BlockHeight, BlockId, CoinOutput, ContractId, Currency, FundOutput,
    FundOutputId, Hash256, OutputId, Timestamp,
};
use crate::validation::{genesis_block, genesis_diffs, CanonicalIds};

pub struct ChainState {
    pub(crate) index: ChainIndex,
    pub(crate) ledger: Ledger,
    dos_blocks: HashSet<BlockId>,
    /// Blocks rejected as `FutureTimestamp`, waiting for the clock
    held: BTreeMap<BlockId, Block>,
    /// Set while a chain switch is in progress. A switch that unwinds
    /// leaves it set and the set refuses further writes.
    halted: bool,
}

pub struct ConsensusSet<S: Storage, E: ConsensusEngine = ProofOfWork> {
    params: ConsensusParams,
    storage: Arc<S>,
    engine: Arc<E>,
    clock: Arc<dyn Clock>,
    pub(crate) state: RwLock<ChainState>,
}

impl<S: Storage> ConsensusSet<S, ProofOfWork> {
    /// Open a proof-of-work consensus set on `storage`, replaying any chain
    /// already stored there.
    pub fn new(params: ConsensusParams, storage: S) -> Result<Self, ConsensusError> {
        Self::open(params, storage, Arc::new(SystemClock))
    }

    /// Like [`ConsensusSet::new`] with an explicit clock.
    pub fn open(
        params: ConsensusParams,
        storage: S,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConsensusError> {
        let engine = ProofOfWork::new(params.clone());
        Self::with_engine(params, storage, engine, clock)
    }
}

impl<S: Storage, E: ConsensusEngine> ConsensusSet<S, E> {
    pub fn with_engine(
        params: ConsensusParams,
        storage: S,
        engine: E,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConsensusError> {
        params.validate()?;

        let genesis = genesis_block(&params);
        let genesis_id = genesis.id()?;
        let diffs = genesis_diffs(&genesis)?;
        let mut ledger = Ledger::new();
        diffs.apply(&mut ledger);
        audit(&ledger, &params, 0);
        let index = ChainIndex::new(genesis.clone(), genesis_id, diffs, &params);

        let set = ConsensusSet {
            params,
            storage: Arc::new(storage),
            engine: Arc::new(engine),
            clock,
            state: RwLock::new(ChainState {
                index,
                ledger,
                dos_blocks: HashSet::new(),
                held: BTreeMap::new(),
                halted: false,
            }),
        };
        set.load(&genesis, genesis_id)?;
        Ok(set)
    }

    /// Rebuild the chain from storage, or seed storage with genesis.
    fn load(&self, genesis: &Block, genesis_id: BlockId) -> Result<(), ConsensusError> {
        let stored_path = self.storage.get_path()?;
        if stored_path.is_empty() {
            let mut batch = StorageBatch::default();
            batch.put_block(&genesis_id, genesis)?;
            batch.set_path(0, &genesis_id);
            self.storage.apply_batch(batch)?;
            return Ok(());
        }
        if stored_path[0] != genesis_id {
            return Err(ConsensusError::GenesisMismatch);
        }

        let mut guard = self.state.write();
        let state = &mut *guard;
        for id in &stored_path[1..] {
            let block = self
                .storage
                .get_block(id)?
                .ok_or(StorageError::NotFound)?;
            let parent = state.index.current_tip();
            if state.index.node(parent).map(|node| node.id) != Some(block.parent_id) {
                return Err(StorageError::Corrupt(format!("path entry {}", id)).into());
            }
            let node = state
                .index
                .insert(block, *id, parent, &self.params)
                .ok_or(ConsensusError::Orphan)?;
            fork_to(&mut state.index, &mut state.ledger, &self.params, node)
                .map_err(|failed| failed.cause)?;
        }

        // Side branches come back as pending blocks.
        let mut remaining: Vec<Block> = self
            .storage
            .get_blocks()?
            .into_iter()
            .filter(|block| block.id().map_or(false, |id| !state.index.contains(&id)))
            .collect();
        loop {
            let before = remaining.len();
            let mut deferred = Vec::new();
            for block in remaining {
                let id = block.id()?;
                match state.index.node_for(&block.parent_id) {
                    Some(parent) => {
                        state.index.insert(block, id, parent, &self.params);
                    }
                    None => deferred.push(block),
                }
            }
            remaining = deferred;
            if remaining.is_empty() || remaining.len() == before {
                break;
            }
        }

        state.dos_blocks = self.storage.get_dos_blocks()?.into_iter().collect();
        info!(
            height = state.index.current_height(),
            blocks = state.index.len(),
            "loaded consensus set from storage"
        );
        Ok(())
    }

    pub fn params(&self) -> &ConsensusParams {
        &self.params
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// Submit a block. See [`ConsensusError`] for the possible outcomes.
    pub fn accept_block(&self, block: Block) -> Result<(), ConsensusError> {
        let mut guard = self.state.write();
        if guard.halted {
            return Err(ConsensusError::Halted);
        }
        self.accept_locked(&mut guard, block)
    }

    /// Resubmit every held block whose timestamp is no longer too far in
    /// the future, earliest first. Blocks still ahead of the clock stay held.
    pub fn reconsider_held_blocks(&self) -> Vec<(BlockId, Result<(), ConsensusError>)> {
        let mut guard = self.state.write();
        if guard.halted {
            return Vec::new();
        }
        let horizon = self.clock.now().saturating_add(self.params.future_threshold);
        let mut ready: Vec<(BlockId, Block)> = guard
            .held
            .iter()
            .filter(|(_, block)| block.timestamp <= horizon)
            .map(|(id, block)| (*id, block.clone()))
            .collect();
        ready.sort_by_key(|(_, block)| block.timestamp);

        let mut results = Vec::with_capacity(ready.len());
        for (id, block) in ready {
            guard.held.remove(&id);
            let result = self.accept_locked(&mut guard, block);
            results.push((id, result));
        }
        results
    }

    fn accept_locked(&self, state: &mut ChainState, block: Block) -> Result<(), ConsensusError> {
        let id = block.id()?;
        if state.dos_blocks.contains(&id) {
            return Err(ConsensusError::DoSBlock);
        }
        if state.index.contains(&id) {
            return Err(ConsensusError::BlockKnown);
        }
        let Some(parent) = state.index.node_for(&block.parent_id) else {
            return Err(ConsensusError::Orphan);
        };

        let context = self.parent_context(&state.index, parent)?;
        match self.engine.validate_header(&block, &context, self.clock.now()) {
            Ok(()) => {}
            Err(ConsensusError::FutureTimestamp) => {
                self.hold(state, id, block);
                return Err(ConsensusError::FutureTimestamp);
            }
            Err(err) => return Err(err),
        }
        state.held.remove(&id);

        let mut batch = StorageBatch::default();
        batch.put_block(&id, &block)?;
        let node = state
            .index
            .insert(block, id, parent, &self.params)
            .ok_or(ConsensusError::Orphan)?;

        let tip_weight = state
            .index
            .node(state.index.current_tip())
            .map_or(0, |tip| tip.weight);
        let weight = state.index.node(node).map_or(0, |n| n.weight);
        if weight <= tip_weight {
            if let Err(err) = self.storage.apply_batch(batch) {
                state.index.purge(node);
                return Err(err.into());
            }
            debug!(block = %id, height = context.height + 1, "block does not extend the heaviest chain");
            return Err(ConsensusError::NonExtendingBlock);
        }

        let old_tip = state.index.current_tip();
        let old_path = canonical_ids(&state.index);
        state.halted = true;
        let switched = fork_to(&mut state.index, &mut state.ledger, &self.params, node);
        state.halted = false;

        match switched {
            Ok(_) => {
                persist_path(&mut batch, &old_path, &canonical_ids(&state.index));
                if let Err(err) = self.storage.apply_batch(batch) {
                    self.restore_tip(state, old_tip, node);
                    warn!(block = %id, error = %err, "commit failed, chain switch undone");
                    return Err(err.into());
                }
                info!(
                    block = %id,
                    height = state.index.current_height(),
                    "new tip"
                );
                Ok(())
            }
            Err(failed) => {
                let poison = failed.cause.is_contextual();
                if poison {
                    batch.mark_dos(&failed.invalid);
                }
                for purged in &failed.purged {
                    batch.delete_block(purged);
                }
                self.storage.apply_batch(batch)?;
                if poison {
                    state.dos_blocks.insert(failed.invalid);
                }
                warn!(block = %id, error = %failed.cause, "block rejected during full validation");
                Err(failed.cause)
            }
        }
    }

    /// Return to `old_tip` after a switch to `node` could not be committed,
    /// and drop `node`, which never reached storage.
    fn restore_tip(&self, state: &mut ChainState, old_tip: NodeIndex, node: NodeIndex) {
        state.halted = true;
        if let Err(failed) = fork_to(&mut state.index, &mut state.ledger, &self.params, old_tip) {
            halt(ConsistencyFault::BrokenChain(format!(
                "previous tip could not be restored: {}",
                failed.cause
            )));
        }
        state.halted = false;
        state.index.purge(node);
    }

    fn hold(&self, state: &mut ChainState, id: BlockId, block: Block) {
        if state.held.len() >= self.params.max_held_blocks && !state.held.contains_key(&id) {
            let latest = state
                .held
                .iter()
                .max_by_key(|(_, held)| held.timestamp)
                .map(|(held_id, held)| (*held_id, held.timestamp));
            match latest {
                Some((latest_id, timestamp)) if timestamp > block.timestamp => {
                    state.held.remove(&latest_id);
                }
                _ => {
                    debug!(block = %id, "holding area full, dropping future block");
                    return;
                }
            }
        }
        debug!(block = %id, timestamp = block.timestamp, "holding future block");
        state.held.insert(id, block);
    }

    fn parent_context(&self, index: &ChainIndex, parent: NodeIndex) -> Result<ParentContext, ConsensusError> {
        let node = index.node(parent).ok_or(ConsensusError::Orphan)?;
        Ok(ParentContext {
            height: node.height,
            child_target: node.child_target,
            earliest_timestamp: index.earliest_child_timestamp(parent, &self.params),
        })
    }

    pub fn current_height(&self) -> BlockHeight {
        self.state.read().index.current_height()
    }

    pub fn current_block_id(&self) -> BlockId {
        let state = self.state.read();
        let tip = state.index.current_tip();
        state.index.node(tip).map(|node| node.id).unwrap_or_default()
    }

    pub fn current_block(&self) -> Block {
        let state = self.state.read();
        let tip = state.index.current_tip();
        state
            .index
            .node(tip)
            .map(|node| node.block.clone())
            .unwrap_or_default()
    }

    pub fn block_at_height(&self, height: BlockHeight) -> Option<Block> {
        let state = self.state.read();
        let index = state.index.path_at(height)?;
        state.index.node(index).map(|node| node.block.clone())
    }

    pub fn block_status(&self, id: &BlockId) -> Option<NodeStatus> {
        let state = self.state.read();
        let index = state.index.node_for(id)?;
        state.index.node(index).map(|node| node.status)
    }

    pub fn block_height(&self, id: &BlockId) -> Option<BlockHeight> {
        let state = self.state.read();
        let index = state.index.node_for(id)?;
        state.index.node(index).map(|node| node.height)
    }

    /// True when the block is anywhere in the block tree.
    pub fn contains_block(&self, id: &BlockId) -> bool {
        self.state.read().index.contains(id)
    }

    pub fn held_blocks(&self) -> usize {
        self.state.read().held.len()
    }

    pub fn output_value(&self, id: &OutputId) -> Option<Currency> {
        self.coin_output(id).map(|output| output.value)
    }

    pub fn coin_output(&self, id: &OutputId) -> Option<CoinOutput> {
        self.state.read().ledger.coin_output(id)
    }

    pub fn fund_output(&self, id: &FundOutputId) -> Option<FundOutput> {
        self.state.read().ledger.fund_output(id)
    }

    pub fn delayed_output(&self, maturity_height: BlockHeight, id: &OutputId) -> Option<CoinOutput> {
        self.state
            .read()
            .ledger
            .delayed_output(maturity_height, id)
            .cloned()
    }

    pub fn contract_state(&self, id: &ContractId) -> Option<FileContractView> {
        let contract = self.state.read().ledger.file_contract(id)?;
        Some(FileContractView::new(*id, &contract, &self.params))
    }

    pub fn fee_pool(&self) -> Currency {
        self.state.read().ledger.fee_pool()
    }

    /// Target a child of `id` must meet.
    pub fn child_target(&self, id: &BlockId) -> Option<Target> {
        let state = self.state.read();
        let index = state.index.node_for(id)?;
        state.index.node(index).map(|node| node.child_target)
    }

    pub fn earliest_child_timestamp(&self, id: &BlockId) -> Option<Timestamp> {
        let state = self.state.read();
        let index = state.index.node_for(id)?;
        Some(state.index.earliest_child_timestamp(index, &self.params))
    }

    /// Segment a storage proof for the open contract `id` must reveal.
    pub fn storage_proof_segment(&self, id: &ContractId) -> Result<u64, ConsensusError> {
        let state = self.state.read();
        let contract = state
            .ledger
            .file_contract(id)
            .ok_or(ConsensusError::MissingFileContract)?;
        let trigger_height = contract.window_start.saturating_sub(1);
        let trigger = state
            .index
            .canonical_id(trigger_height)
            .ok_or(ContractError::MissingTrigger(trigger_height))?;
        Ok(storage_proof_segment(&trigger, id, contract.file_size))
    }

    /// Digest of the current path and the ledger. Two sets with the same
    /// digest agree on both.
    pub fn ledger_digest(&self) -> Result<Hash256, ConsensusError> {
        let state = self.state.read();
        let mut parts: Vec<Vec<u8>> = canonical_ids(&state.index)
            .iter()
            .map(|id| id.to_bytes().to_vec())
            .collect();
        parts.push(state.ledger.digest()?.to_vec());
        let slices: Vec<&[u8]> = parts.iter().map(Vec::as_slice).collect();
        Ok(hash_all(&slices))
    }

    /// Canonical blocks from genesis to the tip.
    pub fn canonical_blocks(&self) -> Vec<Block> {
        self.state
            .read()
            .index
            .canonical_blocks()
            .map(|node| node.block.clone())
            .collect()
    }

    pub fn is_halted(&self) -> bool {
        self.state.read().halted
    }
}

fn canonical_ids(index: &ChainIndex) -> Vec<BlockId> {
    index.canonical_blocks().map(|node| node.id).collect()
}

/// Record the difference between two current paths.
fn persist_path(batch: &mut StorageBatch, old: &[BlockId], new: &[BlockId]) {
    for (height, id) in new.iter().enumerate() {
        if old.get(height) != Some(id) {
            batch.set_path(height as BlockHeight, id);
        }
    }
    for height in new.len()..old.len() {
        batch.clear_path(height as BlockHeight);
    }
}
