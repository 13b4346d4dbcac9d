//! The interface the orchestrator needs from the external ledger.
//!
//! The ledger deploys contracts, executes state-changing calls under an
//! account/nonce model, emits structured events and answers read-only
//! queries. [`crate::rpc::RpcLedger`] is the production implementation.

use std::fmt;
use std::future::Future;

use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::errors::{OrchestratorError, Result};

/// A ledger account or contract address, normalised to lowercase `0x` hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let body = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .ok_or_else(|| OrchestratorError::Validation(format!("address `{raw}` lacks 0x prefix")))?;
        let bytes = hex::decode(body)
            .map_err(|e| OrchestratorError::Validation(format!("address `{raw}` is not hex: {e}")))?;
        if bytes.len() != 20 {
            return Err(OrchestratorError::Validation(format!(
                "address `{raw}` must be 20 bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self(format!("0x{}", hex::encode(bytes))))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Address {
    type Error = OrchestratorError;

    fn try_from(raw: String) -> Result<Self> {
        Self::parse(&raw)
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A state-changing ledger call, signed by whichever identity submits it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LedgerCall {
    Deploy {
        artifact: String,
        args: Vec<Value>,
    },
    Invoke {
        contract: Address,
        method: String,
        args: Vec<Value>,
    },
}

impl LedgerCall {
    pub fn deploy(artifact: impl Into<String>, args: Vec<Value>) -> Self {
        Self::Deploy {
            artifact: artifact.into(),
            args,
        }
    }

    pub fn invoke(contract: &Address, method: impl Into<String>, args: Vec<Value>) -> Self {
        Self::Invoke {
            contract: contract.clone(),
            method: method.into(),
            args,
        }
    }

    /// Method name for invocations, `deploy` for deployments.
    #[cfg(test)]
    pub fn method(&self) -> &str {
        match self {
            Self::Deploy { .. } => "deploy",
            Self::Invoke { method, .. } => method,
        }
    }
}

impl fmt::Display for LedgerCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deploy { artifact, .. } => write!(f, "deploy {artifact}"),
            Self::Invoke {
                contract, method, ..
            } => write!(f, "{method}@{contract}"),
        }
    }
}

/// A structured event emitted by a contract during a confirmed call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub address: Address,
    pub event: String,
    #[serde(default)]
    pub args: Value,
}

/// Confirmation record for a finalized call.
#[derive(Debug, Clone, PartialEq)]
pub struct Receipt {
    pub tx_hash: String,
    pub succeeded: bool,
    pub contract_address: Option<Address>,
    pub revert_reason: Option<String>,
    pub logs: Vec<LogEntry>,
}

impl Receipt {
    /// All events named `event` emitted by `emitter`, in log order.
    pub fn events<'a>(
        &'a self,
        emitter: &'a Address,
        event: &'a str,
    ) -> impl Iterator<Item = &'a LogEntry> + 'a {
        self.logs
            .iter()
            .filter(move |log| &log.address == emitter && log.event == event)
    }

    /// First event named `event` emitted by `emitter`.
    pub fn decode_event(&self, emitter: &Address, event: &str) -> Option<&LogEntry> {
        self.logs
            .iter()
            .find(|log| &log.address == emitter && log.event == event)
    }

    /// Like [`Receipt::decode_event`], but a missing event is an error.
    pub fn require_event(&self, emitter: &Address, event: &str) -> Result<&LogEntry> {
        self.decode_event(emitter, event)
            .ok_or_else(|| OrchestratorError::EventNotFound {
                event: event.to_string(),
                tx_hash: self.tx_hash.clone(),
            })
    }
}

/// Transport-level access to the ledger.
///
/// `submit` places a signed call and returns its transaction hash without
/// waiting; confirmation is observed through `receipt`, which yields `None`
/// while the call is still pending. Ordering and nonce bookkeeping live in
/// [`crate::sequencer::Sequencer`], not here.
pub trait Ledger: Send + Sync {
    fn pending_nonce(&self, identity: &Address) -> impl Future<Output = Result<u64>> + Send;

    fn submit(
        &self,
        from: &Address,
        nonce: u64,
        call: &LedgerCall,
    ) -> impl Future<Output = Result<String>> + Send;

    fn receipt(&self, tx_hash: &str) -> impl Future<Output = Result<Option<Receipt>>> + Send;

    fn query(
        &self,
        contract: &Address,
        method: &str,
        args: Vec<Value>,
    ) -> impl Future<Output = Result<Value>> + Send;
}

// ─────────────────────────────────────────────────────────
// Value helpers
// ─────────────────────────────────────────────────────────

/// Encode an amount for the wire. uint256 values travel as decimal strings.
pub fn amount_arg(amount: u128) -> Value {
    Value::String(amount.to_string())
}

pub fn as_u128(value: &Value, what: &str) -> Result<u128> {
    let parsed = match value {
        Value::Number(n) => n.as_u64().map(u128::from),
        Value::String(s) => match s.strip_prefix("0x") {
            Some(hex_digits) => u128::from_str_radix(hex_digits, 16).ok(),
            None => s.parse().ok(),
        },
        _ => None,
    };
    parsed.ok_or_else(|| OrchestratorError::Rpc(format!("{what}: expected unsigned integer, got {value}")))
}

pub fn as_u64(value: &Value, what: &str) -> Result<u64> {
    let wide = as_u128(value, what)?;
    u64::try_from(wide).map_err(|_| OrchestratorError::Rpc(format!("{what}: {wide} overflows u64")))
}

pub fn as_u32(value: &Value, what: &str) -> Result<u32> {
    let wide = as_u128(value, what)?;
    u32::try_from(wide).map_err(|_| OrchestratorError::Rpc(format!("{what}: {wide} overflows u32")))
}

pub fn as_i64(value: &Value, what: &str) -> Result<i64> {
    let wide = as_u128(value, what)?;
    i64::try_from(wide).map_err(|_| OrchestratorError::Rpc(format!("{what}: {wide} overflows i64")))
}

pub fn as_bool(value: &Value, what: &str) -> Result<bool> {
    value
        .as_bool()
        .ok_or_else(|| OrchestratorError::Rpc(format!("{what}: expected bool, got {value}")))
}

pub fn as_address(value: &Value, what: &str) -> Result<Address> {
    let raw = value
        .as_str()
        .ok_or_else(|| OrchestratorError::Rpc(format!("{what}: expected address, got {value}")))?;
    Address::parse(raw).map_err(|e| OrchestratorError::Rpc(format!("{what}: {e}")))
}

pub fn as_array<'a>(value: &'a Value, what: &str) -> Result<&'a Vec<Value>> {
    value
        .as_array()
        .ok_or_else(|| OrchestratorError::Rpc(format!("{what}: expected array, got {value}")))
}

/// Pick a field out of a multi-value return, which the ledger may render
/// either positionally (`[a, b]`) or by name (`{"a": .., "b": ..}`).
pub fn tuple_field<'a>(value: &'a Value, index: usize, name: &str) -> Result<&'a Value> {
    let field = match value {
        Value::Array(items) => items.get(index),
        Value::Object(map) => map.get(name),
        _ => None,
    };
    field.ok_or_else(|| OrchestratorError::Rpc(format!("missing field `{name}` (#{index}) in {value}")))
}

/// Scale a whole-token amount into base units (`amount × 10^decimals`).
pub fn to_base_units(amount: u128, decimals: u32) -> Result<u128> {
    10u128
        .checked_pow(decimals)
        .and_then(|scale| amount.checked_mul(scale))
        .ok_or_else(|| {
            OrchestratorError::Validation(format!(
                "amount {amount} overflows when scaled by 10^{decimals}"
            ))
        })
}

/// `serialize_with` helper rendering amounts as decimal strings.
pub fn decimal_string<S: Serializer>(amount: &u128, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_str(amount)
}
