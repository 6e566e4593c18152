//! Protocol parameters.
//!
//! Every node that processes the same block sequence must run with the same
//! `ConsensusParams`; changing any of them forks the chain. Parameters can
//! be built programmatically or loaded from a JSON file, with every field
//! optional and defaulting to the production value.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::target::Target;
use crate::types::{BlockHeight, CoinOutput, Currency, FundOutput, Timestamp};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read parameter file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse parameter file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid consensus parameters: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusParams {
    /// Maximum encoded size of a block in bytes
    pub block_size_limit: u64,
    /// Intended seconds between blocks
    pub block_frequency: u64,
    /// Number of blocks considered when adjusting the target
    pub target_window: u64,
    /// Number of ancestors whose median bounds a child's timestamp
    pub median_timestamp_window: usize,
    /// Blocks further ahead of the clock than this are held
    pub future_threshold: Timestamp,
    /// Blocks further ahead of the clock than this are discarded
    pub extreme_future_threshold: Timestamp,
    /// Blocks between an output's creation and its spendability for
    /// miner payouts, contract payouts and fee-pool claims
    pub maturity_delay: BlockHeight,
    pub initial_coinbase: Currency,
    pub minimum_coinbase: Currency,
    /// Base units per whole coin
    pub coin_precision: Currency,
    /// Total number of fund shares in existence
    pub fund_count: Currency,
    pub tax_numerator: Currency,
    pub tax_denominator: Currency,
    /// Target the genesis block's children must meet
    pub root_target: Target,
    pub genesis_timestamp: Timestamp,
    pub genesis_coin_outputs: Vec<CoinOutput>,
    pub genesis_fund_outputs: Vec<FundOutput>,
    /// Future-timestamped blocks kept for reconsideration
    pub max_held_blocks: usize,
}

impl Default for ConsensusParams {
    fn default() -> Self {
        let mut root_target = [0u8; 32];
        root_target[4] = 0x20;
        Self {
            block_size_limit: 2_000_000,
            block_frequency: 600,
            target_window: 1000,
            median_timestamp_window: 11,
            future_threshold: 3 * 60 * 60,
            extreme_future_threshold: 5 * 60 * 60,
            maturity_delay: 50,
            initial_coinbase: 300_000,
            minimum_coinbase: 30_000,
            coin_precision: 10u128.pow(24),
            fund_count: 10_000,
            tax_numerator: 39,
            tax_denominator: 1000,
            root_target: Target(root_target),
            genesis_timestamp: 1_433_600_000,
            genesis_coin_outputs: Vec::new(),
            genesis_fund_outputs: Vec::new(),
            max_held_blocks: 256,
        }
    }
}

impl ConsensusParams {
    /// Parameters for fast local chains: cheap targets, short windows and a
    /// three-block maturity delay. Genesis allocations are left to the caller.
    pub fn testing() -> Self {
        let mut root_target = [0xffu8; 32];
        root_target[0] = 0x0f;
        Self {
            block_size_limit: 100_000,
            block_frequency: 1,
            target_window: 20,
            future_threshold: 3,
            extreme_future_threshold: 6,
            maturity_delay: 3,
            root_target: Target(root_target),
            max_held_blocks: 16,
            ..Self::default()
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let params: ConsensusParams = serde_json::from_str(&contents)?;
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.maturity_delay == 0 {
            return Err(ConfigError::Invalid("maturity delay must be at least one block".into()));
        }
        if self.median_timestamp_window == 0 {
            return Err(ConfigError::Invalid("median timestamp window must be positive".into()));
        }
        if self.target_window == 0 || self.block_frequency == 0 {
            return Err(ConfigError::Invalid("target window and block frequency must be positive".into()));
        }
        if self.extreme_future_threshold < self.future_threshold {
            return Err(ConfigError::Invalid(
                "extreme future threshold is below the future threshold".into(),
            ));
        }
        if self.tax_denominator == 0 || self.tax_numerator > self.tax_denominator {
            return Err(ConfigError::Invalid("tax rate must be a fraction no larger than one".into()));
        }
        if self.fund_count == 0 {
            return Err(ConfigError::Invalid("fund count must be positive".into()));
        }
        if self.minimum_coinbase > self.initial_coinbase {
            return Err(ConfigError::Invalid("minimum coinbase exceeds initial coinbase".into()));
        }
        let funds = self
            .genesis_fund_outputs
            .iter()
            .fold(0u128, |acc, output| acc.saturating_add(output.value));
        if !self.genesis_fund_outputs.is_empty() && funds != self.fund_count {
            return Err(ConfigError::Invalid(format!(
                "genesis allocates {} fund shares, expected {}",
                funds, self.fund_count
            )));
        }
        if self.genesis_coin_outputs.iter().any(|output| output.value == 0)
            || self.genesis_fund_outputs.iter().any(|output| output.value == 0)
        {
            return Err(ConfigError::Invalid("genesis allocates a zero-valued output".into()));
        }
        Ok(())
    }

    /// Block subsidy at `height`.
    pub fn coinbase(&self, height: BlockHeight) -> Currency {
        self.initial_coinbase
            .saturating_sub(height as u128)
            .max(self.minimum_coinbase)
            .saturating_mul(self.coin_precision)
    }

    pub fn genesis_coins(&self) -> Currency {
        self.genesis_coin_outputs
            .iter()
            .fold(0, |acc, output| acc.saturating_add(output.value))
    }

    /// Coins in existence once the block at `height` is applied.
    pub fn expected_supply(&self, height: BlockHeight) -> Currency {
        let height = height as u128;
        // Subsidy falls by one whole coin per block until it reaches the floor.
        let declining = height.min(self.initial_coinbase.saturating_sub(self.minimum_coinbase));
        let declining_sum = declining * self.initial_coinbase - declining * (declining + 1) / 2;
        let floor_sum = (height - declining) * self.minimum_coinbase;
        self.genesis_coins()
            .saturating_add((declining_sum + floor_sum).saturating_mul(self.coin_precision))
    }

    /// Tax taken into the fee pool when a contract with `payout` is formed,
    /// rounded down to a multiple of the fund count so claims divide evenly.
    pub fn contract_tax(&self, payout: Currency) -> Currency {
        let tax = payout.saturating_mul(self.tax_numerator) / self.tax_denominator;
        tax - tax % self.fund_count
    }
}
