//! Proof-of-work targets.
//!
//! A block meets a target when its id, read as a big-endian 256-bit
//! integer, is not greater than the target. Lower targets are harder and
//! carry more weight in fork choice.

use serde::{Deserialize, Serialize};

use crate::types::{format_hex, BlockId, Timestamp};

/// Bounds on how far one block may move the target: 1001/1000 up, 999/1000 down.
const MAX_ADJUSTMENT_UP: (u64, u64) = (1001, 1000);
const MAX_ADJUSTMENT_DOWN: (u64, u64) = (999, 1000);

/// Cumulative proof-of-work weight of a chain.
pub type Weight = u128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Target(pub [u8; 32]);

impl Target {
    pub const MAX: Target = Target([0xff; 32]);

    pub fn is_met_by(&self, id: &BlockId) -> bool {
        id.0 <= self.0
    }

    /// Weight contributed by a block that met this target.
    ///
    /// Uses the top 128 bits of the target; the result never increases as
    /// the target grows, so lower targets always weigh at least as much.
    pub fn difficulty(&self) -> Weight {
        let mut top = [0u8; 16];
        top.copy_from_slice(&self.0[..16]);
        let value = u128::from_be_bytes(top);
        u128::MAX / value.saturating_add(1)
    }

    /// Multiply the target by `numerator / denominator` exactly, saturating
    /// at [`Target::MAX`].
    pub fn mul_ratio(&self, numerator: u64, denominator: u64) -> Target {
        if denominator == 0 {
            return *self;
        }

        let limbs = self.limbs();
        let mut product = [0u64; 5];
        let mut carry: u128 = 0;
        for (i, limb) in limbs.iter().enumerate() {
            let value = (*limb as u128) * (numerator as u128) + carry;
            product[i] = value as u64;
            carry = value >> 64;
        }
        product[4] = carry as u64;

        let mut quotient = [0u64; 5];
        let mut remainder: u128 = 0;
        for i in (0..5).rev() {
            let current = (remainder << 64) | product[i] as u128;
            quotient[i] = (current / denominator as u128) as u64;
            remainder = current % denominator as u128;
        }
        if quotient[4] != 0 {
            return Target::MAX;
        }

        let mut bytes = [0u8; 32];
        for (i, limb) in quotient[..4].iter().enumerate() {
            let start = 32 - (i + 1) * 8;
            bytes[start..start + 8].copy_from_slice(&limb.to_be_bytes());
        }
        Target(bytes)
    }

    /// Little-endian 64-bit limbs.
    fn limbs(&self) -> [u64; 4] {
        let mut limbs = [0u64; 4];
        for (i, limb) in limbs.iter_mut().enumerate() {
            let start = 32 - (i + 1) * 8;
            let mut chunk = [0u8; 8];
            chunk.copy_from_slice(&self.0[start..start + 8]);
            *limb = u64::from_be_bytes(chunk);
        }
        limbs
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&format_hex(&self.0))
    }
}

/// Target for the children of a new block.
///
/// `elapsed` is the time between the window's oldest block and the new
/// block, `blocks` the number of blocks in that window. The ratio of
/// elapsed to expected time is clamped before it is applied.
pub fn adjusted_child_target(
    parent_child_target: Target,
    elapsed: Timestamp,
    blocks: u64,
    block_frequency: u64,
) -> Target {
    let expected = (block_frequency as u128) * (blocks as u128);
    if expected == 0 {
        return parent_child_target;
    }
    let elapsed = elapsed as u128;

    let (numerator, denominator) = if elapsed * MAX_ADJUSTMENT_UP.1 as u128
        > expected * MAX_ADJUSTMENT_UP.0 as u128
    {
        MAX_ADJUSTMENT_UP
    } else if elapsed * (MAX_ADJUSTMENT_DOWN.1 as u128) < expected * MAX_ADJUSTMENT_DOWN.0 as u128 {
        MAX_ADJUSTMENT_DOWN
    } else {
        // Inside the clamp band both values fit in u64.
        (elapsed as u64, expected as u64)
    };
    parent_child_target.mul_ratio(numerator, denominator)
}
