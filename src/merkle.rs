//! Segment Merkle trees for storage proofs.
//!
//! Files are split into [`SEGMENT_SIZE`]-byte segments. Leaves are
//! `H(0x00 || segment)` and interior nodes `H(0x01 || left || right)`. A
//! tree over `n` leaves puts the largest power of two strictly below `n` on
//! the left, so unbalanced trees lean right.

use crate::types::{hash_all, Hash256};

pub const SEGMENT_SIZE: usize = 64;

const LEAF_PREFIX: &[u8] = &[0x00];
const NODE_PREFIX: &[u8] = &[0x01];

pub fn leaf_hash(segment: &[u8]) -> Hash256 {
    hash_all(&[LEAF_PREFIX, segment])
}

pub fn node_hash(left: &Hash256, right: &Hash256) -> Hash256 {
    hash_all(&[NODE_PREFIX, left, right])
}

/// Number of segments in a file of `file_size` bytes.
pub fn segment_count(file_size: u64) -> u64 {
    file_size.div_ceil(SEGMENT_SIZE as u64)
}

fn split_point(n: usize) -> usize {
    let mut k = 1;
    while k * 2 < n {
        k *= 2;
    }
    k
}

fn subtree_root(leaves: &[Hash256]) -> Hash256 {
    match leaves.len() {
        0 => [0u8; 32],
        1 => leaves[0],
        n => {
            let k = split_point(n);
            node_hash(&subtree_root(&leaves[..k]), &subtree_root(&leaves[k..]))
        }
    }
}

fn leaves(data: &[u8]) -> Vec<Hash256> {
    data.chunks(SEGMENT_SIZE).map(leaf_hash).collect()
}

/// Merkle root of `data`. The root of an empty file is all zeroes.
pub fn merkle_root(data: &[u8]) -> Hash256 {
    subtree_root(&leaves(data))
}

fn audit_path(index: usize, leaves: &[Hash256]) -> Vec<Hash256> {
    if leaves.len() <= 1 {
        return Vec::new();
    }
    let k = split_point(leaves.len());
    if index < k {
        let mut path = audit_path(index, &leaves[..k]);
        path.push(subtree_root(&leaves[k..]));
        path
    } else {
        let mut path = audit_path(index - k, &leaves[k..]);
        path.push(subtree_root(&leaves[..k]));
        path
    }
}

/// Build the proof for segment `index` of `data`: the segment itself and
/// the sibling hashes from the leaf upwards.
pub fn build_proof(data: &[u8], index: u64) -> Option<(Vec<u8>, Vec<Hash256>)> {
    let index = usize::try_from(index).ok()?;
    let segment = data.chunks(SEGMENT_SIZE).nth(index)?.to_vec();
    let hash_set = audit_path(index, &leaves(data));
    Some((segment, hash_set))
}

fn root_from_path(leaf: Hash256, index: u64, leaf_count: u64, path: &[Hash256]) -> Option<Hash256> {
    if leaf_count == 1 {
        return path.is_empty().then_some(leaf);
    }
    let (sibling, rest) = path.split_last()?;
    let k = split_point(usize::try_from(leaf_count).ok()?) as u64;
    if index < k {
        let left = root_from_path(leaf, index, k, rest)?;
        Some(node_hash(&left, sibling))
    } else {
        let right = root_from_path(leaf, index - k, leaf_count - k, rest)?;
        Some(node_hash(sibling, &right))
    }
}

/// Check that `segment` sits at `index` in a tree of `leaf_count` leaves
/// with the given `root`.
pub fn verify_segment(
    segment: &[u8],
    hash_set: &[Hash256],
    leaf_count: u64,
    index: u64,
    root: &Hash256,
) -> bool {
    if segment.len() > SEGMENT_SIZE || leaf_count == 0 || index >= leaf_count {
        return false;
    }
    root_from_path(leaf_hash(segment), index, leaf_count, hash_set)
        .map_or(false, |computed| &computed == root)
}
