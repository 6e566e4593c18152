//! Chain Index.
//!
//! Every known block lives in an arena of [`BlockNode`]s addressed by
//! [`NodeIndex`]. Parents are stored as indices and children are found
//! through a secondary index keyed by parent id, so the tree has no
//! ownership cycles. The current path lists the canonical chain from
//! genesis to the tip.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::ConsensusParams;
use crate::diff::DiffSet;
use crate::target::{adjusted_child_target, Target, Weight};
use crate::types::{Block, BlockHeight, BlockId, Timestamp};
use crate::validation::CanonicalIds;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeIndex(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    /// In the tree, never applied
    Pending,
    /// On the current path
    Canonical,
    /// Applied once, then reverted by a reorg
    Reverted,
}

#[derive(Debug, Clone)]
pub struct BlockNode {
    pub block: Block,
    pub id: BlockId,
    pub parent: Option<NodeIndex>,
    pub height: BlockHeight,
    /// Target this block met
    pub target: Target,
    /// Target the children of this block must meet
    pub child_target: Target,
    /// Cumulative work from genesis up to and including this block
    pub weight: Weight,
    /// Insertion order, used to break weight ties in favour of the first seen
    pub seen: u64,
    pub status: NodeStatus,
    /// Computed the first time the block is applied
    pub diffs: Option<Arc<DiffSet>>,
}

#[derive(Debug, Default)]
pub struct ChainIndex {
    nodes: Vec<Option<BlockNode>>,
    by_id: HashMap<BlockId, NodeIndex>,
    children: HashMap<BlockId, Vec<NodeIndex>>,
    current_path: Vec<NodeIndex>,
    next_seen: u64,
}

impl ChainIndex {
    /// Index seeded with the genesis block, already canonical with `diffs`.
    pub fn new(genesis: Block, genesis_id: BlockId, diffs: DiffSet, params: &ConsensusParams) -> Self {
        let root = BlockNode {
            block: genesis,
            id: genesis_id,
            parent: None,
            height: 0,
            target: Target::MAX,
            child_target: params.root_target,
            weight: 0,
            seen: 0,
            status: NodeStatus::Canonical,
            diffs: Some(Arc::new(diffs)),
        };
        let mut index = ChainIndex {
            next_seen: 1,
            ..Default::default()
        };
        index.nodes.push(Some(root));
        index.by_id.insert(genesis_id, NodeIndex(0));
        index.current_path.push(NodeIndex(0));
        index
    }

    pub fn genesis(&self) -> NodeIndex {
        NodeIndex(0)
    }

    pub fn contains(&self, id: &BlockId) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn node_for(&self, id: &BlockId) -> Option<NodeIndex> {
        self.by_id.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Look up a live node. Indices handed out by this index stay valid
    /// until the node is purged.
    pub fn node(&self, index: NodeIndex) -> Option<&BlockNode> {
        self.nodes.get(index.0).and_then(Option::as_ref)
    }

    pub(crate) fn node_mut(&mut self, index: NodeIndex) -> Option<&mut BlockNode> {
        self.nodes.get_mut(index.0).and_then(Option::as_mut)
    }

    pub fn current_tip(&self) -> NodeIndex {
        self.current_path
            .last()
            .copied()
            .unwrap_or(NodeIndex(0))
    }

    pub fn current_height(&self) -> BlockHeight {
        self.current_path.len().saturating_sub(1) as BlockHeight
    }

    pub fn path_at(&self, height: BlockHeight) -> Option<NodeIndex> {
        usize::try_from(height)
            .ok()
            .and_then(|h| self.current_path.get(h))
            .copied()
    }

    pub fn current_path(&self) -> &[NodeIndex] {
        &self.current_path
    }

    pub(crate) fn push_path(&mut self, index: NodeIndex) {
        self.current_path.push(index);
    }

    pub(crate) fn pop_path(&mut self) -> Option<NodeIndex> {
        if self.current_path.len() <= 1 {
            return None;
        }
        self.current_path.pop()
    }

    pub fn children_of(&self, id: &BlockId) -> &[NodeIndex] {
        self.children.get(id).map_or(&[], Vec::as_slice)
    }

    /// Walk `steps` parents up from `index`, stopping at genesis.
    pub fn ancestor(&self, index: NodeIndex, steps: u64) -> NodeIndex {
        let mut current = index;
        for _ in 0..steps {
            match self.node(current).and_then(|node| node.parent) {
                Some(parent) => current = parent,
                None => break,
            }
        }
        current
    }

    /// Minimum timestamp for a child of `index`: the median of the last
    /// `median_timestamp_window` timestamps ending at `index`, repeating
    /// genesis when the chain is shorter.
    pub fn earliest_child_timestamp(&self, index: NodeIndex, params: &ConsensusParams) -> Timestamp {
        let mut timestamps = Vec::with_capacity(params.median_timestamp_window);
        let mut current = self.node(index);
        let mut last = 0;
        for _ in 0..params.median_timestamp_window {
            if let Some(node) = current {
                last = node.block.timestamp;
                current = node.parent.and_then(|parent| self.node(parent));
            }
            timestamps.push(last);
        }
        timestamps.sort_unstable();
        timestamps[timestamps.len() / 2]
    }

    /// Insert `block` as a child of `parent`. The caller has already checked
    /// that the block meets `parent`'s child target.
    pub fn insert(
        &mut self,
        block: Block,
        id: BlockId,
        parent: NodeIndex,
        params: &ConsensusParams,
    ) -> Option<NodeIndex> {
        let (height, target, weight, parent_id) = {
            let parent_node = self.node(parent)?;
            (
                parent_node.height + 1,
                parent_node.child_target,
                parent_node
                    .weight
                    .saturating_add(parent_node.child_target.difficulty()),
                parent_node.id,
            )
        };

        let window = params.target_window;
        let oldest = self.ancestor(parent, height.min(window).saturating_sub(1));
        let oldest_timestamp = self.node(oldest)?.block.timestamp;
        let child_target = adjusted_child_target(
            target,
            block.timestamp.saturating_sub(oldest_timestamp),
            height.min(window),
            params.block_frequency,
        );

        let index = NodeIndex(self.nodes.len());
        self.nodes.push(Some(BlockNode {
            block,
            id,
            parent: Some(parent),
            height,
            target,
            child_target,
            weight,
            seen: self.next_seen,
            status: NodeStatus::Pending,
            diffs: None,
        }));
        self.next_seen += 1;
        self.by_id.insert(id, index);
        self.children.entry(parent_id).or_default().push(index);
        Some(index)
    }

    /// Nearest node that is an ancestor of (or equal to) both nodes.
    pub fn common_ancestor(&self, a: NodeIndex, b: NodeIndex) -> Option<NodeIndex> {
        let mut a = a;
        let mut b = b;
        let height = |index: NodeIndex| self.node(index).map(|node| node.height);
        while height(a)? > height(b)? {
            a = self.node(a)?.parent?;
        }
        while height(b)? > height(a)? {
            b = self.node(b)?.parent?;
        }
        while a != b {
            a = self.node(a)?.parent?;
            b = self.node(b)?.parent?;
        }
        Some(a)
    }

    /// Remove `index` and every descendant from the tree. Returns the ids
    /// removed, `index` first.
    pub fn purge(&mut self, index: NodeIndex) -> Vec<BlockId> {
        let mut removed = Vec::new();
        let mut stack = vec![index];
        while let Some(next) = stack.pop() {
            let Some(node) = self.nodes.get_mut(next.0).and_then(Option::take) else {
                continue;
            };
            self.by_id.remove(&node.id);
            if let Some(children) = self.children.remove(&node.id) {
                stack.extend(children);
            }
            if let Some(parent) = node.parent.and_then(|p| self.nodes.get(p.0)).and_then(Option::as_ref) {
                let parent_id = parent.id;
                if let Some(siblings) = self.children.get_mut(&parent_id) {
                    siblings.retain(|sibling| *sibling != next);
                    if siblings.is_empty() {
                        self.children.remove(&parent_id);
                    }
                }
            }
            removed.push(node.id);
        }
        removed
    }

    /// Canonical blocks from genesis to the tip.
    pub fn canonical_blocks(&self) -> impl Iterator<Item = &BlockNode> {
        self.current_path.iter().filter_map(|index| self.node(*index))
    }
}

impl CanonicalIds for ChainIndex {
    fn canonical_id(&self, height: BlockHeight) -> Option<BlockId> {
        self.path_at(height)
            .and_then(|index| self.node(index))
            .map(|node| node.id)
    }
}
