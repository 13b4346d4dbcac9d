//! Ordered, nonce-tracked submission of ledger calls for one signing identity.
//!
//! A [`Sequencer`] is a batch: it reads the identity's pending nonce once at
//! [`Sequencer::begin`], then every [`Sequencer::submit`] places one call,
//! waits for its receipt and only then advances the local nonce. The first
//! failure halts the batch; later submits fail without touching the ledger.
//! Mutating calls are never retried here.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::errors::{OrchestratorError, Result};
use crate::ledger::{Address, Ledger, LedgerCall, Receipt};

/// Bounds on how long a batch waits for each receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiptTiming {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for ReceiptTiming {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(500),
        }
    }
}

pub struct Sequencer<'a, L: Ledger> {
    ledger: &'a L,
    identity: Address,
    next_nonce: u64,
    timing: ReceiptTiming,
    halted: Option<String>,
}

impl<'a, L: Ledger> Sequencer<'a, L> {
    pub async fn begin(ledger: &'a L, identity: Address, timing: ReceiptTiming) -> Result<Self> {
        let next_nonce = ledger.pending_nonce(&identity).await?;
        debug!(identity = %identity, nonce = next_nonce, "sequencer batch opened");
        Ok(Self {
            ledger,
            identity,
            next_nonce,
            timing,
            halted: None,
        })
    }

    pub fn identity(&self) -> &Address {
        &self.identity
    }

    /// The ledger this batch submits to, for reads between submissions.
    pub fn ledger(&self) -> &'a L {
        self.ledger
    }

    /// Nonce the next submitted call will carry.
    #[cfg(test)]
    pub fn next_nonce(&self) -> u64 {
        self.next_nonce
    }

    #[cfg(test)]
    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    pub async fn submit(&mut self, call: LedgerCall) -> Result<Receipt> {
        if let Some(reason) = &self.halted {
            return Err(OrchestratorError::LedgerCall {
                call: call.to_string(),
                cause: format!("batch halted after earlier failure: {reason}"),
            });
        }

        match self.place(&call).await {
            Ok(receipt) => {
                self.next_nonce += 1;
                Ok(receipt)
            }
            Err(e) => {
                warn!(identity = %self.identity, nonce = self.next_nonce, %call, "halting batch: {e}");
                self.halted = Some(e.to_string());
                Err(e)
            }
        }
    }

    async fn place(&self, call: &LedgerCall) -> Result<Receipt> {
        let nonce = self.next_nonce;
        let tx_hash = self
            .ledger
            .submit(&self.identity, nonce, call)
            .await
            .map_err(|e| call_error(call, e))?;
        debug!(identity = %self.identity, nonce, %call, %tx_hash, "submitted");

        let receipt = self.await_receipt(call, &tx_hash).await?;
        if !receipt.succeeded {
            return Err(OrchestratorError::LedgerCall {
                call: call.to_string(),
                cause: receipt
                    .revert_reason
                    .clone()
                    .unwrap_or_else(|| "transaction reverted".to_string()),
            });
        }

        info!(identity = %self.identity, nonce, %call, %tx_hash, "confirmed");
        Ok(receipt)
    }

    async fn await_receipt(&self, call: &LedgerCall, tx_hash: &str) -> Result<Receipt> {
        let poll = async {
            loop {
                match self.ledger.receipt(tx_hash).await {
                    Ok(Some(receipt)) => return Ok(receipt),
                    Ok(None) => tokio::time::sleep(self.timing.poll_interval).await,
                    Err(e) => return Err(call_error(call, e)),
                }
            }
        };

        tokio::time::timeout(self.timing.timeout, poll)
            .await
            .map_err(|_| OrchestratorError::LedgerTimeout {
                call: call.to_string(),
                secs: self.timing.timeout.as_secs(),
            })?
    }
}

fn call_error(call: &LedgerCall, e: OrchestratorError) -> OrchestratorError {
    match e {
        already @ OrchestratorError::LedgerCall { .. } => already,
        other => OrchestratorError::LedgerCall {
            call: call.to_string(),
            cause: other.to_string(),
        },
    }
}
