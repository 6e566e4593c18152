//! Fork-choice and reorg controller.
//!
//! [`fork_to`] moves the current path onto the branch ending at a target
//! node: it reverts canonical blocks down to the common ancestor, then
//! applies the branch block by block, computing and caching diffs for
//! blocks that have never been applied. If any block on the branch fails
//! validation the switch is undone, the original path is restored from
//! cached diffs and the failing block is purged with its descendants.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::chain::{ChainIndex, NodeIndex, NodeStatus};
use crate::config::ConsensusParams;
use crate::consensus::ConsensusError;
use crate::consistency::{audit, halt, ConsistencyFault};
use crate::diff::DiffSet;
use crate::ledger::Ledger;
use crate::types::BlockId;
use crate::validation::generate_block_diffs;

/// Blocks that left and joined the current path during a switch.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SwitchSummary {
    /// Tip first
    pub reverted: Vec<BlockId>,
    /// Ancestor first
    pub applied: Vec<BlockId>,
}

/// A switch that was abandoned because a block on the new branch is invalid.
#[derive(Debug)]
pub struct FailedSwitch {
    pub cause: ConsensusError,
    /// The block that failed validation
    pub invalid: BlockId,
    /// Every block removed from the tree, the invalid block first
    pub purged: Vec<BlockId>,
}

fn broken(message: &str) -> ! {
    halt(ConsistencyFault::BrokenChain(message.to_string()))
}

fn cached_diffs(chain: &ChainIndex, index: NodeIndex) -> Arc<DiffSet> {
    match chain.node(index).and_then(|node| node.diffs.clone()) {
        Some(diffs) => diffs,
        None => broken("applied block has no cached diffs"),
    }
}

fn set_status(chain: &mut ChainIndex, index: NodeIndex, status: NodeStatus) {
    if let Some(node) = chain.node_mut(index) {
        node.status = status;
    }
}

/// Revert the tip. Returns the node that was removed from the path.
fn revert_tip(chain: &mut ChainIndex, ledger: &mut Ledger) -> NodeIndex {
    let tip = chain.current_tip();
    cached_diffs(chain, tip).revert(ledger);
    if chain.pop_path().is_none() {
        broken("attempted to revert genesis");
    }
    set_status(chain, tip, NodeStatus::Reverted);
    tip
}

/// Apply `index`, which must be a child of the tip, using its cached diffs.
fn reapply(chain: &mut ChainIndex, ledger: &mut Ledger, params: &ConsensusParams, index: NodeIndex) {
    cached_diffs(chain, index).apply(ledger);
    chain.push_path(index);
    set_status(chain, index, NodeStatus::Canonical);
    audit(ledger, params, chain.current_height());
}

/// Apply `index` on top of the tip, computing its diffs if it has never
/// been applied.
fn apply_node(
    chain: &mut ChainIndex,
    ledger: &mut Ledger,
    params: &ConsensusParams,
    index: NodeIndex,
) -> Result<(), ConsensusError> {
    let Some(node) = chain.node(index) else {
        broken("branch node missing from the tree")
    };
    if node.diffs.is_some() {
        reapply(chain, ledger, params, index);
        return Ok(());
    }

    let diffs = generate_block_diffs(&node.block, node.height, ledger, params, &*chain)?;
    let diffs = Arc::new(diffs);
    diffs.apply(ledger);
    if let Some(node) = chain.node_mut(index) {
        node.diffs = Some(diffs);
        node.status = NodeStatus::Canonical;
    }
    chain.push_path(index);
    audit(ledger, params, chain.current_height());
    Ok(())
}

/// Make `target` the tip of the current path.
pub fn fork_to(
    chain: &mut ChainIndex,
    ledger: &mut Ledger,
    params: &ConsensusParams,
    target: NodeIndex,
) -> Result<SwitchSummary, FailedSwitch> {
    let tip = chain.current_tip();
    let Some(ancestor) = chain.common_ancestor(tip, target) else {
        broken("target shares no ancestor with the current path")
    };

    let mut reverted = Vec::new();
    while chain.current_tip() != ancestor {
        reverted.push(revert_tip(chain, ledger));
    }

    let mut branch = Vec::new();
    let mut cursor = target;
    while cursor != ancestor {
        branch.push(cursor);
        cursor = match chain.node(cursor).and_then(|node| node.parent) {
            Some(parent) => parent,
            None => broken("branch does not reach the common ancestor"),
        };
    }
    branch.reverse();

    for (position, index) in branch.iter().enumerate() {
        if let Err(cause) = apply_node(chain, ledger, params, *index) {
            for _ in 0..position {
                revert_tip(chain, ledger);
            }
            for original in reverted.iter().rev() {
                reapply(chain, ledger, params, *original);
            }
            let purged = chain.purge(*index);
            let invalid = purged.first().copied().unwrap_or_default();
            warn!(
                block = %invalid,
                purged = purged.len(),
                error = %cause,
                "abandoned chain switch, invalid block on new branch"
            );
            return Err(FailedSwitch {
                cause,
                invalid,
                purged,
            });
        }
    }

    let id_of = |index: &NodeIndex| chain.node(*index).map(|node| node.id).unwrap_or_default();
    let summary = SwitchSummary {
        reverted: reverted.iter().map(id_of).collect(),
        applied: branch.iter().map(id_of).collect(),
    };
    if summary.reverted.is_empty() {
        debug!(height = chain.current_height(), "extended current path");
    } else {
        info!(
            height = chain.current_height(),
            reverted = summary.reverted.len(),
            applied = summary.applied.len(),
            "switched to heavier chain"
        );
    }
    Ok(summary)
}
