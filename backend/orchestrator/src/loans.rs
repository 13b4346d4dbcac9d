//! Synthetic loan generation, tokenization and single-loan reads.

use std::ops::RangeInclusive;

use chrono::{DateTime, Months, Utc};
use rand::Rng;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::errors::{OrchestratorError, Result};
use crate::events::LoanMinted;
use crate::ledger::{amount_arg, as_i64, as_u128, as_u32, decimal_string, tuple_field, Address, Ledger, LedgerCall};
use crate::sequencer::Sequencer;

pub const PRINCIPAL_RANGE: RangeInclusive<u128> = 100_000..=1_000_000;
pub const RATE_BPS_RANGE: RangeInclusive<u32> = 100..=1_000;

/// Loan terms. Maturity is a Unix timestamp in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoanRecord {
    #[serde(serialize_with = "decimal_string")]
    pub principal: u128,
    pub interest_rate_bps: u32,
    pub maturity_timestamp_ms: i64,
    pub token_id: Option<u64>,
}

/// Draw `count` loans with maturities between one and five years after `now`.
pub fn generate_loans<R: Rng>(rng: &mut R, count: usize, now: DateTime<Utc>) -> Vec<LoanRecord> {
    let earliest = now.checked_add_months(Months::new(12)).unwrap_or(now);
    let latest = now.checked_add_months(Months::new(60)).unwrap_or(earliest);
    let (min_ms, max_ms) = (earliest.timestamp_millis(), latest.timestamp_millis());

    (0..count)
        .map(|_| LoanRecord {
            principal: rng.gen_range(PRINCIPAL_RANGE),
            interest_rate_bps: rng.gen_range(RATE_BPS_RANGE),
            maturity_timestamp_ms: if max_ms > min_ms {
                rng.gen_range(min_ms..max_ms)
            } else {
                min_ms
            },
            token_id: None,
        })
        .collect()
}

/// Mint one loan token per record into `pool`, in order, and return the
/// token ids recovered from each `LoanMinted` event.
///
/// Each record's `token_id` is set as soon as its mint is confirmed, so a
/// call that fails part-way leaves the confirmed mints recorded. Records
/// that already carry a token id are not minted again.
pub async fn tokenize<L: Ledger>(
    batch: &mut Sequencer<'_, L>,
    registry: &Address,
    pool: &Address,
    loans: &mut [LoanRecord],
) -> Result<Vec<u64>> {
    let total = loans.len();
    let mut done = loans.iter().filter(|loan| loan.token_id.is_some()).count();
    if done > 0 {
        info!(done, total, "resuming tokenization");
    }
    for loan in loans.iter_mut().filter(|loan| loan.token_id.is_none()) {
        let call = LedgerCall::invoke(
            registry,
            "mint",
            vec![
                json!(pool),
                amount_arg(loan.principal),
                json!(loan.interest_rate_bps),
                json!(loan.maturity_timestamp_ms),
            ],
        );
        let minted = match batch.submit(call).await {
            Ok(receipt) => LoanMinted::decode(&receipt, registry),
            Err(e) => Err(e),
        };
        match minted {
            Ok(event) => {
                loan.token_id = Some(event.token_id);
                done += 1;
            }
            Err(e) => {
                warn!(done, total, "tokenization stopped part-way; confirmed mints are kept");
                return Err(e);
            }
        }
    }
    let token_ids: Vec<u64> = loans.iter().filter_map(|loan| loan.token_id).collect();
    info!(identity = %batch.identity(), count = token_ids.len(), "loans tokenized");
    Ok(token_ids)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoanDetail {
    /// Position in mint order.
    pub index: u64,
    pub token_id: u64,
    #[serde(serialize_with = "decimal_string")]
    pub principal: u128,
    pub interest_rate_percent: f64,
    pub maturity: String,
}

/// Read the `index`-th minted loan (token `token_id`) back from the registry
/// and render it for humans.
pub async fn fetch_loan_detail<L: Ledger>(
    ledger: &L,
    registry: &Address,
    index: u64,
    token_id: u64,
) -> Result<LoanDetail> {
    let data = ledger.query(registry, "getLoanData", vec![json!(token_id)]).await?;
    let principal = as_u128(tuple_field(&data, 0, "principal")?, "principal")?;
    let rate_bps = as_u32(tuple_field(&data, 1, "interestRateBps")?, "interestRateBps")?;
    let maturity_ms = as_i64(tuple_field(&data, 2, "maturityTimestamp")?, "maturityTimestamp")?;

    Ok(LoanDetail {
        index,
        token_id,
        principal,
        interest_rate_percent: bps_to_percent(rate_bps),
        maturity: describe_maturity(maturity_ms)?,
    })
}

pub fn bps_to_percent(bps: u32) -> f64 {
    f64::from(bps) / 100.0
}

pub fn describe_maturity(timestamp_ms: i64) -> Result<String> {
    DateTime::<Utc>::from_timestamp_millis(timestamp_ms)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .ok_or_else(|| OrchestratorError::Rpc(format!("maturity {timestamp_ms} is out of range")))
}

/// Principal of a minted loan token, as recorded by the registry.
pub async fn principal_of<L: Ledger>(ledger: &L, registry: &Address, token_id: u64) -> Result<u128> {
    let data: Value = ledger.query(registry, "loanData", vec![json!(token_id)]).await?;
    as_u128(tuple_field(&data, 0, "principal")?, "loanData.principal")
}
