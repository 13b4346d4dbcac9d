//! Tranche classes, loan partitioning and notional aggregation.
//!
//! Loans are split into exactly three seniority-ranked tranches. Each
//! tranche's notional is the sum of its member loans' principals as recorded
//! by the loan registry; the pool then receives one `createTranche` call per
//! tranche, Senior first.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::errors::{OrchestratorError, Result};
use crate::ledger::{
    amount_arg, as_address, as_array, as_u128, as_u32, as_u64, decimal_string, tuple_field, Address, Ledger,
    LedgerCall,
};
use crate::loans::principal_of;
use crate::sequencer::Sequencer;

/// Every tranche is issued as series 1 of its class.
pub const SERIES_ID: u64 = 1;

/// Upper bound for a tranche coupon rate: 100%.
pub const MAX_RATE_BPS: u32 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TrancheId {
    Senior,
    Mezzanine,
    Junior,
}

impl TrancheId {
    /// Seniority order, which is also the order calls are issued in.
    pub const ALL: [TrancheId; 3] = [Self::Senior, Self::Mezzanine, Self::Junior];

    /// Class id used by the pool and the tranche token.
    pub fn class_id(self) -> u64 {
        match self {
            Self::Senior => 1,
            Self::Mezzanine => 2,
            Self::Junior => 3,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim() {
            "Senior" => Some(Self::Senior),
            "Mezzanine" => Some(Self::Mezzanine),
            "Junior" => Some(Self::Junior),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Senior => "Senior",
            Self::Mezzanine => "Mezzanine",
            Self::Junior => "Junior",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for TrancheId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tranche as created on the ledger during this session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrancheClass {
    pub id: TrancheId,
    pub member_token_ids: Vec<u64>,
    #[serde(serialize_with = "decimal_string")]
    pub notional: u128,
    pub interest_rate_bps: u32,
    pub fully_funded: bool,
}

/// Assignment of loan token ids to the three tranches. Buckets are disjoint
/// and free of duplicates by construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranchePartition {
    buckets: [Vec<u64>; 3],
}

impl TranchePartition {
    pub fn new(buckets: [Vec<u64>; 3]) -> Result<Self> {
        let mut seen = BTreeSet::new();
        for id in buckets.iter().flatten() {
            if !seen.insert(*id) {
                return Err(OrchestratorError::DuplicateLoanAssignment(*id));
            }
        }
        Ok(Self { buckets })
    }

    /// Split `ids` in order into consecutive buckets of the given sizes.
    #[cfg(test)]
    pub fn by_sizes(ids: &[u64], sizes: [usize; 3]) -> Result<Self> {
        let needed: usize = sizes.iter().sum();
        if needed > ids.len() {
            return Err(OrchestratorError::Validation(format!(
                "partition needs {needed} loans, only {} available",
                ids.len()
            )));
        }
        let mut rest = ids;
        let buckets = sizes.map(|size| {
            let (head, tail) = rest.split_at(size);
            rest = tail;
            head.to_vec()
        });
        Self::new(buckets)
    }

    /// Parse three comma-separated buckets. Each bucket is either an
    /// inclusive range `a-b` or a `;`-separated list of ids.
    ///
    /// `"1-6,7-12,13-19"` is the 6/6/7 split.
    pub fn parse(raw: &str) -> Result<Self> {
        let parts: Vec<&str> = raw.split(',').map(str::trim).collect();
        let [senior, mezzanine, junior] = parts.as_slice() else {
            return Err(OrchestratorError::Config(format!(
                "tranche partition `{raw}` must have exactly three buckets"
            )));
        };
        Self::new([parse_bucket(senior)?, parse_bucket(mezzanine)?, parse_bucket(junior)?])
    }

    pub fn members(&self, tranche: TrancheId) -> &[u64] {
        &self.buckets[tranche.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (TrancheId, &[u64])> + '_ {
        TrancheId::ALL.into_iter().map(move |t| (t, self.members(t)))
    }

    /// Fails when a member id was never minted in this session.
    pub fn check_minted(&self, minted: &[u64]) -> Result<()> {
        let minted: BTreeSet<u64> = minted.iter().copied().collect();
        for (tranche, ids) in self.iter() {
            if let Some(id) = ids.iter().find(|id| !minted.contains(*id)) {
                return Err(OrchestratorError::Precondition(format!(
                    "{tranche} tranche references loan token {id}, which has not been minted"
                )));
            }
        }
        Ok(())
    }

    /// Minted ids that no tranche claims, in mint order.
    pub fn unassigned(&self, minted: &[u64]) -> Vec<u64> {
        let assigned: BTreeSet<u64> = self.buckets.iter().flatten().copied().collect();
        minted.iter().copied().filter(|id| !assigned.contains(id)).collect()
    }
}

fn parse_bucket(raw: &str) -> Result<Vec<u64>> {
    let invalid = || OrchestratorError::Config(format!("invalid tranche bucket `{raw}`"));
    if let Some((start, end)) = raw.split_once('-') {
        let start: u64 = start.trim().parse().map_err(|_| invalid())?;
        let end: u64 = end.trim().parse().map_err(|_| invalid())?;
        if start > end {
            return Err(invalid());
        }
        return Ok((start..=end).collect());
    }
    raw.split(';')
        .map(|id| id.trim().parse().map_err(|_| invalid()))
        .collect()
}

/// Coupon rates in basis points, one per tranche.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RateSchedule {
    pub senior_bps: u32,
    pub mezzanine_bps: u32,
    pub junior_bps: u32,
}

impl RateSchedule {
    pub fn validate(&self) -> Result<()> {
        for tranche in TrancheId::ALL {
            let bps = self.rate(tranche);
            if bps == 0 || bps > MAX_RATE_BPS {
                return Err(OrchestratorError::Validation(format!(
                    "{tranche} rate must be between 1 and {MAX_RATE_BPS} bps, got {bps}"
                )));
            }
        }
        Ok(())
    }

    pub fn rate(&self, tranche: TrancheId) -> u32 {
        match tranche {
            TrancheId::Senior => self.senior_bps,
            TrancheId::Mezzanine => self.mezzanine_bps,
            TrancheId::Junior => self.junior_bps,
        }
    }
}

pub fn sum_notional(principals: impl IntoIterator<Item = u128>) -> Result<u128> {
    principals.into_iter().try_fold(0u128, |acc, p| {
        acc.checked_add(p)
            .ok_or_else(|| OrchestratorError::Validation("tranche notional overflows u128".to_string()))
    })
}

/// Read every member loan's principal and sum per tranche.
pub async fn aggregate_notional<L: Ledger>(
    ledger: &L,
    registry: &Address,
    partition: &TranchePartition,
) -> Result<BTreeMap<TrancheId, u128>> {
    let mut notionals = BTreeMap::new();
    for (tranche, ids) in partition.iter() {
        let mut principals = Vec::with_capacity(ids.len());
        for id in ids {
            principals.push(principal_of(ledger, registry, *id).await?);
        }
        let notional = sum_notional(principals)?;
        info!(%tranche, loans = ids.len(), notional, "aggregated tranche notional");
        notionals.insert(tranche, notional);
    }
    Ok(notionals)
}

/// Issue the three `createTranche` calls in seniority order and return the
/// session-side view of what was created.
///
/// A tranche the pool already reports (non-zero notional or members) is not created
/// again; its terms are taken from the ledger instead. This lets a call that
/// failed part-way be retried.
pub async fn create_tranches<L: Ledger>(
    batch: &mut Sequencer<'_, L>,
    pool: &Address,
    partition: &TranchePartition,
    notionals: &BTreeMap<TrancheId, u128>,
    rates: &RateSchedule,
) -> Result<BTreeMap<TrancheId, TrancheClass>> {
    let mut created = BTreeMap::new();
    for (tranche, ids) in partition.iter() {
        let notional = notionals.get(&tranche).copied().ok_or_else(|| {
            OrchestratorError::Precondition(format!("no notional computed for {tranche}"))
        })?;
        let bps = rates.rate(tranche);

        let existing = read_tranche(batch.ledger(), pool, tranche).await?;
        if existing.total_notional > 0 || !existing.loan_ids.is_empty() {
            if existing.total_notional != notional || existing.interest_rate_bps != bps {
                warn!(
                    %tranche,
                    notional = existing.total_notional,
                    bps = existing.interest_rate_bps,
                    "tranche already exists with different terms; keeping the ledger's"
                );
            } else {
                info!(%tranche, "tranche already exists; skipping");
            }
            created.insert(
                tranche,
                TrancheClass {
                    id: tranche,
                    member_token_ids: existing.loan_ids,
                    notional: existing.total_notional,
                    interest_rate_bps: existing.interest_rate_bps,
                    fully_funded: false,
                },
            );
            continue;
        }

        batch
            .submit(LedgerCall::invoke(
                pool,
                "createTranche",
                vec![json!(tranche.class_id()), json!(ids), amount_arg(notional), json!(bps)],
            ))
            .await?;
        created.insert(
            tranche,
            TrancheClass {
                id: tranche,
                member_token_ids: ids.to_vec(),
                notional,
                interest_rate_bps: bps,
                fully_funded: false,
            },
        );
    }
    Ok(created)
}

/// A tranche as the pool reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrancheInfo {
    pub tranche: TrancheId,
    pub loan_ids: Vec<u64>,
    /// Registry contract of each member loan, parallel to `loan_ids`.
    pub loan_contracts: Vec<Address>,
    #[serde(serialize_with = "decimal_string")]
    pub total_notional: u128,
    pub interest_rate_bps: u32,
}

pub async fn read_tranche<L: Ledger>(ledger: &L, pool: &Address, tranche: TrancheId) -> Result<TrancheInfo> {
    let key = vec![json!(tranche.class_id()), json!(SERIES_ID)];
    let terms = ledger.query(pool, "tranches", key.clone()).await?;
    let raw_contracts = ledger.query(pool, "getLoanContracts", key.clone()).await?;
    let raw_ids = ledger.query(pool, "getLoanIds", key).await?;

    let loan_ids = as_array(&raw_ids, "getLoanIds")?
        .iter()
        .map(|v| as_u64(v, "loan id"))
        .collect::<Result<Vec<_>>>()?;
    let loan_contracts = as_array(&raw_contracts, "getLoanContracts")?
        .iter()
        .map(|v| as_address(v, "loan contract"))
        .collect::<Result<Vec<_>>>()?;
    Ok(TrancheInfo {
        tranche,
        loan_ids,
        loan_contracts,
        total_notional: as_u128(tuple_field(&terms, 0, "totalNotional")?, "totalNotional")?,
        interest_rate_bps: as_u32(tuple_field(&terms, 1, "interestRateBps")?, "interestRateBps")?,
    })
}

/// Read back all three tranches concurrently.
pub async fn read_back<L: Ledger>(ledger: &L, pool: &Address) -> Result<Vec<TrancheInfo>> {
    let (senior, mezzanine, junior) = tokio::try_join!(
        read_tranche(ledger, pool, TrancheId::Senior),
        read_tranche(ledger, pool, TrancheId::Mezzanine),
        read_tranche(ledger, pool, TrancheId::Junior),
    )?;
    for info in [&senior, &mezzanine, &junior] {
        if info.loan_ids.is_empty() {
            warn!(tranche = %info.tranche, "pool reports no loans for tranche");
        }
    }
    Ok(vec![senior, mezzanine, junior])
}
