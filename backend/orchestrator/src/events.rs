//! Typed views over the structured events the securitization contracts emit.
//!
//! Only the events the workflow reads back are decoded; everything else in a
//! receipt is ignored.

use serde::Serialize;

use crate::errors::{OrchestratorError, Result};
use crate::ledger::{as_u128, as_u64, decimal_string, Address, LogEntry, Receipt};

/// Recognised event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A loan token was minted by the loan registry.
    LoanMinted,
    /// A coupon payment was deposited into a tranche.
    PaymentDeposited,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LoanMinted => "LoanMinted",
            Self::PaymentDeposited => "PaymentDeposited",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoanMinted {
    pub token_id: u64,
}

impl LoanMinted {
    /// Recover the minted token id from a `mint` receipt.
    pub fn decode(receipt: &Receipt, registry: &Address) -> Result<Self> {
        let log = receipt.require_event(registry, EventKind::LoanMinted.as_str())?;
        let token_id = arg(log, "tokenId", 0).and_then(|v| as_u64(v, "LoanMinted.tokenId"))?;
        Ok(Self { token_id })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentDeposited {
    pub class_id: u64,
    pub series_id: u64,
    #[serde(serialize_with = "decimal_string")]
    pub amount: u128,
}

impl PaymentDeposited {
    /// Every `PaymentDeposited` emitted by the pool in this receipt.
    /// A deposit receipt without one is an error.
    pub fn decode_all(receipt: &Receipt, pool: &Address) -> Result<Vec<Self>> {
        let name = EventKind::PaymentDeposited.as_str();
        let decoded = receipt
            .events(pool, name)
            .map(Self::from_log)
            .collect::<Result<Vec<_>>>()?;
        if decoded.is_empty() {
            return Err(OrchestratorError::EventNotFound {
                event: name.to_string(),
                tx_hash: receipt.tx_hash.clone(),
            });
        }
        Ok(decoded)
    }

    fn from_log(log: &LogEntry) -> Result<Self> {
        Ok(Self {
            class_id: as_u64(arg(log, "classId", 0)?, "PaymentDeposited.classId")?,
            series_id: as_u64(arg(log, "seriesId", 1)?, "PaymentDeposited.seriesId")?,
            amount: as_u128(arg(log, "amount", 2)?, "PaymentDeposited.amount")?,
        })
    }
}

/// Event args arrive either as a named object or positionally.
fn arg<'a>(log: &'a LogEntry, name: &str, index: usize) -> Result<&'a serde_json::Value> {
    log.args
        .get(name)
        .or_else(|| log.args.get(index))
        .ok_or_else(|| {
            OrchestratorError::Rpc(format!(
                "{} event from {} lacks `{name}`",
                log.event, log.address
            ))
        })
}
