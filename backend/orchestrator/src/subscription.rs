//! Investor subscriptions against tranche capacity.
//!
//! Allocation is a plain cap: an investor receives what they asked for, or
//! whatever capacity the tranche has left, whichever is smaller.

use serde::Serialize;
use serde_json::json;
use tracing::info;

use crate::errors::{OrchestratorError, Result};
use crate::ledger::{amount_arg, decimal_string, to_base_units, Address, Ledger, LedgerCall};
use crate::sequencer::{ReceiptTiming, Sequencer};
use crate::tranches::{TrancheId, SERIES_ID};

/// Inclusive bounds on a single subscription request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionBand {
    pub min: u128,
    pub max: u128,
}

impl Default for SubscriptionBand {
    fn default() -> Self {
        Self {
            min: 10_000,
            max: 500_000,
        }
    }
}

impl SubscriptionBand {
    pub fn validate(&self, requested: u128) -> Result<()> {
        if requested < self.min || requested > self.max {
            return Err(OrchestratorError::Validation(format!(
                "subscription amount must be between {} and {}, got {requested}",
                self.min, self.max
            )));
        }
        Ok(())
    }
}

/// `min(requested, notional - already_subscribed)`.
pub fn allocate(requested: u128, notional: u128, already_subscribed: u128) -> u128 {
    requested.min(notional.saturating_sub(already_subscribed))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionOutcome {
    pub tranche: TrancheId,
    pub investor: Address,
    #[serde(serialize_with = "decimal_string")]
    pub requested: u128,
    #[serde(serialize_with = "decimal_string")]
    pub accepted: u128,
    #[serde(serialize_with = "decimal_string")]
    pub remaining_capacity: u128,
}

/// Contracts and identities a subscription touches.
pub struct SubscriptionParties<'a> {
    pub operator: &'a Address,
    pub investor: &'a Address,
    pub stablecoin: &'a Address,
    pub pool: &'a Address,
}

/// Credit the investor, let them authorise the pool, then invest. Each step
/// confirms before the next is placed.
pub async fn execute<L: Ledger>(
    ledger: &L,
    timing: ReceiptTiming,
    parties: &SubscriptionParties<'_>,
    tranche: TrancheId,
    amount: u128,
    decimals: u32,
) -> Result<()> {
    let funded = to_base_units(amount, decimals)?;

    let mut operator = Sequencer::begin(ledger, parties.operator.clone(), timing).await?;
    operator
        .submit(LedgerCall::invoke(
            parties.stablecoin,
            "mint",
            vec![json!(parties.investor), amount_arg(funded)],
        ))
        .await?;

    let mut investor = Sequencer::begin(ledger, parties.investor.clone(), timing).await?;
    investor
        .submit(LedgerCall::invoke(
            parties.stablecoin,
            "approve",
            vec![json!(parties.pool), amount_arg(funded)],
        ))
        .await?;
    investor
        .submit(LedgerCall::invoke(
            parties.pool,
            "invest",
            vec![json!(tranche.class_id()), json!(SERIES_ID), amount_arg(amount)],
        ))
        .await?;

    info!(%tranche, investor = %parties.investor, amount, "subscription recorded");
    Ok(())
}
