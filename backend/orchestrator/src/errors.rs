//! Application-wide error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Out-of-band user input (loan index, subscription amount, rates).
    #[error("Validation error: {0}")]
    Validation(String),

    /// Operation invoked before the workflow reached a stage that allows it.
    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Loan token {0} is assigned to more than one tranche slot")]
    DuplicateLoanAssignment(u64),

    /// A mutating ledger call reverted, was rejected, or belongs to a halted batch.
    #[error("Ledger call `{call}` failed: {cause}")]
    LedgerCall { call: String, cause: String },

    #[error("Event `{event}` not found in receipt of {tx_hash}")]
    EventNotFound { event: String, tx_hash: String },

    #[error("Timed out after {secs}s waiting for `{call}` to confirm")]
    LedgerTimeout { call: String, secs: u64 },

    /// JSON-RPC error object or a result that does not have the expected shape.
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl OrchestratorError {
    /// Short machine-readable tag used in API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Precondition(_) => "precondition",
            Self::DuplicateLoanAssignment(_) => "duplicate_loan_assignment",
            Self::LedgerCall { .. } => "ledger_call",
            Self::EventNotFound { .. } => "event_not_found",
            Self::LedgerTimeout { .. } => "ledger_timeout",
            Self::Rpc(_) => "rpc",
            Self::Http(_) => "http",
            Self::Json(_) => "json",
            Self::Config(_) => "config",
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
