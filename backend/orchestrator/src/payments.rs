//! Coupon payment deposit and distribution.
//!
//! A deposit funds every tranche with the same per-tranche amount and reports,
//! per tranche, whether the pool now holds at least the expected payout. A
//! distribution pays out the selected tranche to its investors; the payout
//! itself is best-effort and its failures are reported rather than raised.

use serde::Serialize;
use serde_json::json;
use tracing::{error, info, warn};

use crate::errors::{OrchestratorError, Result};
use crate::events::PaymentDeposited;
use crate::ledger::{
    amount_arg, as_address, as_array, as_bool, as_u128, as_u32, decimal_string, tuple_field,
    Address, Ledger, LedgerCall,
};
use crate::loans::bps_to_percent;
use crate::sequencer::{ReceiptTiming, Sequencer};
use crate::tranches::{TrancheId, SERIES_ID};

/// Funding state of one tranche after a deposit round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentCycle {
    pub tranche: TrancheId,
    pub series_id: u64,
    #[serde(serialize_with = "decimal_string")]
    pub deposited_amount: u128,
    #[serde(serialize_with = "decimal_string")]
    pub expected_payout: u128,
    pub fully_funded: bool,
}

impl PaymentCycle {
    pub fn new(tranche: TrancheId, deposited_amount: u128, expected_payout: u128) -> Self {
        Self {
            tranche,
            series_id: SERIES_ID,
            deposited_amount,
            expected_payout,
            fully_funded: deposited_amount >= expected_payout,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DepositReport {
    #[serde(serialize_with = "decimal_string")]
    pub payment_amount: u128,
    #[serde(serialize_with = "decimal_string")]
    pub total_amount: u128,
    pub events: Vec<PaymentDeposited>,
    pub cycles: Vec<PaymentCycle>,
}

fn tranche_key(tranche: TrancheId) -> Vec<serde_json::Value> {
    vec![json!(tranche.class_id()), json!(SERIES_ID)]
}

/// Read the pool's deposited and expected figures for one tranche.
pub async fn read_cycle<L: Ledger>(ledger: &L, pool: &Address, tranche: TrancheId) -> Result<PaymentCycle> {
    let expected = ledger
        .query(pool, "getTotalExpectedPayout", tranche_key(tranche))
        .await?;
    let deposited = ledger.query(pool, "payments", tranche_key(tranche)).await?;
    Ok(PaymentCycle::new(
        tranche,
        as_u128(&deposited, "payments")?,
        as_u128(&expected, "getTotalExpectedPayout")?,
    ))
}

/// Fund `payment_amount` into every tranche from the operator account.
///
/// The operator mints and approves the combined total once, then deposits
/// into Senior, Mezzanine and Junior in that order.
pub async fn deposit<L: Ledger>(
    ledger: &L,
    timing: ReceiptTiming,
    operator: &Address,
    pool: &Address,
    payment_amount: u128,
) -> Result<DepositReport> {
    if payment_amount == 0 {
        return Err(OrchestratorError::Validation(
            "payment amount must be positive".to_string(),
        ));
    }
    let total_amount = payment_amount
        .checked_mul(TrancheId::ALL.len() as u128)
        .ok_or_else(|| OrchestratorError::Validation(format!("payment amount {payment_amount} is too large")))?;

    let stablecoin = as_address(&ledger.query(pool, "stablecoin", vec![]).await?, "stablecoin")?;

    let mut batch = Sequencer::begin(ledger, operator.clone(), timing).await?;
    batch
        .submit(LedgerCall::invoke(
            &stablecoin,
            "mint",
            vec![json!(operator), amount_arg(total_amount)],
        ))
        .await?;
    batch
        .submit(LedgerCall::invoke(
            &stablecoin,
            "approve",
            vec![json!(pool), amount_arg(total_amount)],
        ))
        .await?;

    let mut events = Vec::new();
    let mut cycles = Vec::with_capacity(TrancheId::ALL.len());
    for tranche in TrancheId::ALL {
        let mut args = tranche_key(tranche);
        args.push(amount_arg(payment_amount));
        let receipt = batch
            .submit(LedgerCall::invoke(pool, "depositPayment", args))
            .await?;
        events.extend(PaymentDeposited::decode_all(&receipt, pool)?);

        let cycle = read_cycle(ledger, pool, tranche).await?;
        info!(
            %tranche,
            deposited = cycle.deposited_amount,
            expected = cycle.expected_payout,
            fully_funded = cycle.fully_funded,
            "payment deposited"
        );
        cycles.push(cycle);
    }

    Ok(DepositReport {
        payment_amount,
        total_amount,
        events,
        cycles,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributionOutcome {
    /// Nothing deposited for the tranche; no payout attempted.
    NoDeposit,
    /// The tranche has no investors; no payout attempted.
    NoInvestors,
    Distributed,
    /// Approval or payout failed; see `error`.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvestorReturn {
    pub investor: Address,
    #[serde(serialize_with = "decimal_string")]
    pub principal: u128,
    #[serde(serialize_with = "decimal_string")]
    pub expected_total: u128,
    /// `expected_total - principal`; negative when the pool reports a loss.
    pub expected_interest: String,
}

impl InvestorReturn {
    pub fn new(investor: Address, principal: u128, expected_total: u128) -> Self {
        let interest = if expected_total >= principal {
            (expected_total - principal).to_string()
        } else {
            format!("-{}", principal - expected_total)
        };
        Self {
            investor,
            principal,
            expected_total,
            expected_interest: interest,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DistributionReport {
    pub tranche: TrancheId,
    pub outcome: DistributionOutcome,
    /// True only once the payout call confirmed.
    pub distribution_complete: bool,
    pub interest_rate_percent: Option<f64>,
    pub total_expected: Option<String>,
    pub total_available: Option<String>,
    pub fully_funded: Option<bool>,
    pub investors: Vec<InvestorReturn>,
    pub approvals_granted: Vec<Address>,
    pub skipped_investors: Vec<Address>,
    pub error: Option<String>,
}

impl DistributionReport {
    fn empty(tranche: TrancheId, outcome: DistributionOutcome) -> Self {
        Self {
            tranche,
            outcome,
            distribution_complete: false,
            interest_rate_percent: None,
            total_expected: None,
            total_available: None,
            fully_funded: None,
            investors: Vec::new(),
            approvals_granted: Vec::new(),
            skipped_investors: Vec::new(),
            error: None,
        }
    }
}

/// Identities and contracts involved in a distribution.
pub struct DistributionParties<'a> {
    pub operator: &'a Address,
    /// Accounts the orchestrator may sign for; only these can be asked to
    /// grant payout approvals.
    pub signers: &'a [Address],
    pub pool: &'a Address,
}

pub async fn distribute<L: Ledger>(
    ledger: &L,
    timing: ReceiptTiming,
    parties: &DistributionParties<'_>,
    tranche: TrancheId,
) -> Result<DistributionReport> {
    let pool = parties.pool;
    let tranche_token = as_address(&ledger.query(pool, "trancheToken", vec![]).await?, "trancheToken")?;

    let available = as_u128(&ledger.query(pool, "payments", tranche_key(tranche)).await?, "payments")?;
    if available == 0 {
        info!(%tranche, "no payments to distribute");
        return Ok(DistributionReport::empty(tranche, DistributionOutcome::NoDeposit));
    }

    let expected = as_u128(
        &ledger.query(pool, "getTotalExpectedPayout", tranche_key(tranche)).await?,
        "getTotalExpectedPayout",
    )?;
    let terms = ledger.query(pool, "tranches", tranche_key(tranche)).await?;
    let rate_bps = as_u32(tuple_field(&terms, 1, "interestRateBps")?, "interestRateBps")?;

    let mut report = DistributionReport {
        interest_rate_percent: Some(bps_to_percent(rate_bps)),
        total_expected: Some(expected.to_string()),
        total_available: Some(available.to_string()),
        fully_funded: Some(available >= expected),
        ..DistributionReport::empty(tranche, DistributionOutcome::Distributed)
    };

    let listed = ledger.query(pool, "getInvestors", tranche_key(tranche)).await?;
    let investors = as_array(&listed, "getInvestors")?
        .iter()
        .map(|v| as_address(v, "investor"))
        .collect::<Result<Vec<_>>>()?;
    if investors.is_empty() {
        info!(%tranche, "no investors found");
        report.outcome = DistributionOutcome::NoInvestors;
        return Ok(report);
    }

    for investor in investors {
        let mut args = tranche_key(tranche);
        args.push(json!(investor));
        let held = as_u128(
            &ledger.query(pool, "investorHoldings", args.clone()).await?,
            "investorHoldings",
        )?;
        if held == 0 {
            continue;
        }
        let expected_total = as_u128(
            &ledger.query(pool, "getExpectedReturn", args).await?,
            "getExpectedReturn",
        )?;
        report.investors.push(InvestorReturn::new(investor, held, expected_total));
    }

    match settle(ledger, timing, parties, &tranche_token, tranche, &mut report).await {
        Ok(()) => {
            report.distribution_complete = true;
            info!(%tranche, investors = report.investors.len(), "payments distributed");
        }
        Err(e) => {
            error!(%tranche, "error distributing payments: {e}");
            report.outcome = DistributionOutcome::Failed;
            report.error = Some(e.to_string());
        }
    }
    Ok(report)
}

/// Make sure every participating investor has authorised the pool on the
/// tranche token, then pay out. Approvals are only granted when missing.
async fn settle<L: Ledger>(
    ledger: &L,
    timing: ReceiptTiming,
    parties: &DistributionParties<'_>,
    tranche_token: &Address,
    tranche: TrancheId,
    report: &mut DistributionReport,
) -> Result<()> {
    let participants: Vec<Address> = report.investors.iter().map(|r| r.investor.clone()).collect();
    for investor in participants {
        if !parties.signers.contains(&investor) {
            warn!(%investor, "cannot sign for investor; leaving payout approval to them");
            report.skipped_investors.push(investor);
            continue;
        }

        let approved = ledger
            .query(
                tranche_token,
                "isApprovedFor",
                vec![json!(investor), json!(parties.pool)],
            )
            .await?;
        if as_bool(&approved, "isApprovedFor")? {
            continue;
        }

        let mut batch = Sequencer::begin(ledger, investor.clone(), timing).await?;
        batch
            .submit(LedgerCall::invoke(
                tranche_token,
                "setApprovalFor",
                vec![json!(parties.pool), json!(true)],
            ))
            .await?;
        report.approvals_granted.push(investor);
    }

    let mut operator = Sequencer::begin(ledger, parties.operator.clone(), timing).await?;
    operator
        .submit(LedgerCall::invoke(
            parties.pool,
            "distributePayments",
            tranche_key(tranche),
        ))
        .await?;
    Ok(())
}
