//! Ledger JSON-RPC client.
//!
//! ## Resilience
//!
//! * Reads (`ledger_call`, nonce lookups, receipt polling) are retried with
//!   exponential back-off on transport errors, rate limiting and soft RPC
//!   errors, up to [`Backoff::max_attempts`] attempts.
//! * Submissions (`ledger_deploy`, `ledger_sendTransaction`) are sent exactly
//!   once. A failed submission is reported to the caller, who decides whether
//!   to start a new batch with a fresh nonce.

use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::errors::{OrchestratorError, Result};
use crate::ledger::{as_u64, Address, Ledger, LedgerCall, LogEntry, Receipt};

const INITIAL_BACKOFF_MS: u64 = 500;
const MAX_BACKOFF_MS: u64 = 8_000;
const MAX_READ_ATTEMPTS: u32 = 5;

// ─────────────────────────────────────────────────────────
// JSON-RPC response shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RpcResponse {
    pub result: Option<Value>,
    pub error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcError {
    /// Malformed requests and unknown methods will not succeed on retry.
    fn is_hard(&self) -> bool {
        matches!(self.code, -32600 | -32601 | -32602)
    }
}

#[derive(Debug, Deserialize)]
pub struct RawReceipt {
    #[serde(rename = "transactionHash")]
    pub transaction_hash: String,
    pub status: Value,
    #[serde(rename = "contractAddress", default)]
    pub contract_address: Option<String>,
    #[serde(rename = "revertReason", default)]
    pub revert_reason: Option<String>,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
}

impl TryFrom<RawReceipt> for Receipt {
    type Error = OrchestratorError;

    fn try_from(raw: RawReceipt) -> Result<Self> {
        let succeeded = match &raw.status {
            Value::Bool(ok) => *ok,
            Value::Number(n) => n.as_u64() == Some(1),
            Value::String(s) => matches!(s.as_str(), "success" | "0x1" | "1"),
            other => {
                return Err(OrchestratorError::Rpc(format!(
                    "unrecognised receipt status {other}"
                )))
            }
        };
        let contract_address = raw
            .contract_address
            .as_deref()
            .map(Address::parse)
            .transpose()
            .map_err(|e| OrchestratorError::Rpc(format!("receipt contractAddress: {e}")))?;
        Ok(Receipt {
            tx_hash: raw.transaction_hash,
            succeeded,
            contract_address,
            revert_reason: raw.revert_reason,
            logs: raw.logs,
        })
    }
}

// ─────────────────────────────────────────────────────────
// Client
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(INITIAL_BACKOFF_MS),
            max: Duration::from_millis(MAX_BACKOFF_MS),
            max_attempts: MAX_READ_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RpcLedger {
    client: Client,
    rpc_url: String,
    backoff: Backoff,
}

/// Why a single request did not produce a result.
enum Attempt {
    Retryable(String),
    Fatal(OrchestratorError),
}

impl RpcLedger {
    pub fn new(client: Client, rpc_url: impl Into<String>) -> Self {
        Self {
            client,
            rpc_url: rpc_url.into(),
            backoff: Backoff::default(),
        }
    }

    #[cfg(test)]
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// One JSON-RPC round trip. `Ok(None)` is a `null` result.
    async fn request_once(&self, method: &str, params: &Value) -> std::result::Result<Option<Value>, Attempt> {
        let response = self
            .client
            .post(&self.rpc_url)
            .json(&json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": method,
                "params": params,
            }))
            .send()
            .await
            .map_err(|e| Attempt::Retryable(format!("request failed: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(Attempt::Retryable("rate-limited by ledger".to_string()));
        }
        if status.is_server_error() {
            return Err(Attempt::Retryable(format!("ledger returned {status}")));
        }

        let body: RpcResponse = response
            .json()
            .await
            .map_err(|e| Attempt::Fatal(OrchestratorError::Http(e)))?;
        if let Some(err) = body.error {
            let message = format!("RPC error {} on {method}: {}", err.code, err.message);
            return Err(if err.is_hard() {
                Attempt::Fatal(OrchestratorError::Rpc(message))
            } else {
                Attempt::Retryable(message)
            });
        }
        Ok(body.result)
    }

    /// Idempotent request with back-off.
    async fn read(&self, method: &str, params: Value) -> Result<Option<Value>> {
        let mut delay = self.backoff.initial;
        let mut attempt = 1;
        loop {
            match self.request_once(method, &params).await {
                Ok(result) => return Ok(result),
                Err(Attempt::Fatal(e)) => return Err(e),
                Err(Attempt::Retryable(reason)) if attempt < self.backoff.max_attempts => {
                    warn!("{method}: {reason} (attempt {attempt}, retrying in {delay:?})");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.backoff.max);
                    attempt += 1;
                }
                Err(Attempt::Retryable(reason)) => {
                    return Err(OrchestratorError::Rpc(format!(
                        "{method}: {reason} (gave up after {attempt} attempts)"
                    )))
                }
            }
        }
    }

    /// State-changing request: sent once, never retried.
    async fn send(&self, method: &str, params: Value) -> Result<Value> {
        match self.request_once(method, &params).await {
            Ok(Some(result)) => Ok(result),
            Ok(None) => Err(OrchestratorError::Rpc(format!("empty result from {method}"))),
            Err(Attempt::Fatal(e)) => Err(e),
            Err(Attempt::Retryable(reason)) => Err(OrchestratorError::Rpc(format!("{method}: {reason}"))),
        }
    }
}

fn expect_result(method: &str, result: Option<Value>) -> Result<Value> {
    result.ok_or_else(|| OrchestratorError::Rpc(format!("empty result from {method}")))
}

fn submission_params(from: &Address, nonce: u64, call: &LedgerCall) -> (&'static str, Value) {
    match call {
        LedgerCall::Deploy { artifact, args } => (
            "ledger_deploy",
            json!([{ "from": from, "nonce": nonce, "artifact": artifact, "args": args }]),
        ),
        LedgerCall::Invoke {
            contract,
            method,
            args,
        } => (
            "ledger_sendTransaction",
            json!([{ "from": from, "nonce": nonce, "to": contract, "method": method, "args": args }]),
        ),
    }
}

impl Ledger for RpcLedger {
    async fn pending_nonce(&self, identity: &Address) -> Result<u64> {
        let method = "ledger_getTransactionCount";
        let result = self.read(method, json!([identity, "pending"])).await?;
        as_u64(&expect_result(method, result)?, "transaction count")
    }

    async fn submit(&self, from: &Address, nonce: u64, call: &LedgerCall) -> Result<String> {
        let (method, params) = submission_params(from, nonce, call);
        let result = self.send(method, params).await?;
        let tx_hash = result
            .as_str()
            .ok_or_else(|| OrchestratorError::Rpc(format!("{method} returned {result}, expected a hash")))?;
        debug!(%from, nonce, %call, tx_hash, "transaction accepted by ledger");
        Ok(tx_hash.to_string())
    }

    async fn receipt(&self, tx_hash: &str) -> Result<Option<Receipt>> {
        match self.read("ledger_getTransactionReceipt", json!([tx_hash])).await? {
            None | Some(Value::Null) => Ok(None),
            Some(raw) => {
                let raw: RawReceipt = serde_json::from_value(raw)?;
                Receipt::try_from(raw).map(Some)
            }
        }
    }

    async fn query(&self, contract: &Address, method: &str, args: Vec<Value>) -> Result<Value> {
        let rpc_method = "ledger_call";
        let result = self
            .read(rpc_method, json!([{ "to": contract, "method": method, "args": args }]))
            .await?;
        expect_result(rpc_method, result)
    }
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
