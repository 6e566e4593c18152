//! Consistency Checker.
//!
//! Audits the ledger after every applied block. A failure here means the
//! engine itself produced a bad ledger, so it is not reported as a
//! validation error: [`halt`] logs the fault and unwinds with the fault as
//! the panic payload.

use thiserror::Error;
use tracing::error;

use crate::config::ConsensusParams;
use crate::ledger::Ledger;
use crate::types::{BlockHeight, Currency};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsistencyFault {
    #[error("{kind} {id} created twice")]
    DuplicateEntry { kind: &'static str, id: String },
    #[error("{kind} {id} removed but not present")]
    MissingEntry { kind: &'static str, id: String },
    #[error("{kind} {id} removed with different contents")]
    EntryMismatch { kind: &'static str, id: String },
    #[error("fee pool is {found}, diff expected {expected}")]
    FeePoolMismatch { expected: Currency, found: Currency },
    #[error("coin supply at height {height} is {found}, expected {expected}")]
    CoinSupply {
        height: BlockHeight,
        expected: Currency,
        found: Currency,
    },
    #[error("fund supply is {found}, expected {expected}")]
    FundSupply { expected: Currency, found: Currency },
    #[error("fund output {0} claims from beyond the fee pool")]
    ClaimBeyondPool(String),
    #[error("delayed output {id} matured at {maturity} but is still delayed at height {height}")]
    StaleDelayedOutput {
        id: String,
        maturity: BlockHeight,
        height: BlockHeight,
    },
    #[error("file contract {id} outlived its window ending at {window_end} (height {height})")]
    StaleContract {
        id: String,
        window_end: BlockHeight,
        height: BlockHeight,
    },
    #[error("value overflow while totalling the ledger")]
    Overflow,
    #[error("block tree is broken: {0}")]
    BrokenChain(String),
}

/// Stop processing. Never returns.
pub fn halt(fault: ConsistencyFault) -> ! {
    error!(%fault, "consensus ledger is inconsistent, halting");
    std::panic::panic_any(fault)
}

/// Check the invariants of a ledger whose canonical tip is at `height`.
pub fn check_ledger(
    ledger: &Ledger,
    params: &ConsensusParams,
    height: BlockHeight,
) -> Result<(), ConsistencyFault> {
    let mut coins: Currency = 0;
    let mut add = |value: Currency| -> Result<(), ConsistencyFault> {
        coins = coins.checked_add(value).ok_or(ConsistencyFault::Overflow)?;
        Ok(())
    };

    for (_, output) in ledger.coin_outputs() {
        add(output.value)?;
    }

    for (maturity, id, output) in ledger.delayed_outputs() {
        if maturity <= height {
            return Err(ConsistencyFault::StaleDelayedOutput {
                id: id.to_string(),
                maturity,
                height,
            });
        }
        add(output.value)?;
    }

    for (id, contract) in ledger.file_contracts() {
        if contract.window_end <= height {
            return Err(ConsistencyFault::StaleContract {
                id: id.to_string(),
                window_end: contract.window_end,
                height,
            });
        }
        add(contract.payout - params.contract_tax(contract.payout))?;
    }

    let pool = ledger.fee_pool;
    let mut funds: Currency = 0;
    for (id, output) in ledger.fund_outputs() {
        if output.claim_start > pool {
            return Err(ConsistencyFault::ClaimBeyondPool(id.to_string()));
        }
        funds = funds
            .checked_add(output.value)
            .ok_or(ConsistencyFault::Overflow)?;
        let claim = (pool - output.claim_start) / params.fund_count;
        add(claim
            .checked_mul(output.value)
            .ok_or(ConsistencyFault::Overflow)?)?;
    }

    let expected_funds = params
        .genesis_fund_outputs
        .iter()
        .fold(0u128, |acc, output| acc.saturating_add(output.value));
    if funds != expected_funds {
        return Err(ConsistencyFault::FundSupply {
            expected: expected_funds,
            found: funds,
        });
    }
    // Without fund shares the pool has no claimants and is counted whole.
    if expected_funds == 0 {
        add(pool)?;
    }

    let expected = params.expected_supply(height);
    if coins != expected {
        return Err(ConsistencyFault::CoinSupply {
            height,
            expected,
            found: coins,
        });
    }
    Ok(())
}

/// Run [`check_ledger`] and halt on failure.
pub fn audit(ledger: &Ledger, params: &ConsensusParams, height: BlockHeight) {
    if let Err(fault) = check_ledger(ledger, params, height) {
        halt(fault);
    }
}
