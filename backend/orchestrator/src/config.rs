//! Application configuration loaded from environment variables.

use std::time::Duration;

use crate::errors::{OrchestratorError, Result};
use crate::ledger::Address;
use crate::sequencer::ReceiptTiming;
use crate::subscription::SubscriptionBand;
use crate::tranches::TranchePartition;

#[derive(Debug, Clone)]
pub struct Config {
    /// Ledger JSON-RPC endpoint (e.g. http://127.0.0.1:8545)
    pub ledger_rpc_url: String,
    /// Account that deploys contracts, mints and services payments
    pub operator: Address,
    /// Account that subscribes to tranches
    pub investor: Address,
    /// Port for the REST API server
    pub api_port: u16,
    /// Upper bound on each outbound HTTP request
    pub http_timeout: Duration,
    /// How long to wait for receipts, and how often to poll for them
    pub receipt_timing: ReceiptTiming,
    /// Decimals of the settlement stablecoin
    pub stablecoin_decimals: u32,
    /// Number of synthetic loans generated when the pool is deployed
    pub loan_count: usize,
    /// Which loan token ids back which tranche
    pub partition: TranchePartition,
    pub subscription_band: SubscriptionBand,
    pub artifacts: Artifacts,
}

/// Contract artifact names the ledger deploys from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifacts {
    pub stablecoin: String,
    pub loan_registry: String,
    pub pool: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let required = |key: &str| {
            lookup(key).ok_or_else(|| {
                OrchestratorError::Config(format!("{key} environment variable is required"))
            })
        };

        let subscription_band = SubscriptionBand {
            min: parse(&var("SUBSCRIPTION_MIN", "10000"), "SUBSCRIPTION_MIN")?,
            max: parse(&var("SUBSCRIPTION_MAX", "500000"), "SUBSCRIPTION_MAX")?,
        };
        if subscription_band.min == 0 || subscription_band.min > subscription_band.max {
            return Err(OrchestratorError::Config(
                "SUBSCRIPTION_MIN must be positive and not above SUBSCRIPTION_MAX".to_string(),
            ));
        }

        let operator = address(&required("OPERATOR_ADDRESS")?, "OPERATOR_ADDRESS")?;
        let investor = address(&required("INVESTOR_ADDRESS")?, "INVESTOR_ADDRESS")?;
        if operator == investor {
            return Err(OrchestratorError::Config(
                "OPERATOR_ADDRESS and INVESTOR_ADDRESS must differ".to_string(),
            ));
        }

        Ok(Config {
            ledger_rpc_url: var("LEDGER_RPC_URL", "http://127.0.0.1:8545"),
            operator,
            investor,
            api_port: parse(&var("API_PORT", "3000"), "API_PORT")?,
            http_timeout: Duration::from_secs(parse(&var("HTTP_TIMEOUT_SECS", "30"), "HTTP_TIMEOUT_SECS")?),
            receipt_timing: ReceiptTiming {
                timeout: Duration::from_secs(parse(
                    &var("RECEIPT_TIMEOUT_SECS", "60"),
                    "RECEIPT_TIMEOUT_SECS",
                )?),
                poll_interval: Duration::from_millis(parse(
                    &var("RECEIPT_POLL_INTERVAL_MS", "500"),
                    "RECEIPT_POLL_INTERVAL_MS",
                )?),
            },
            stablecoin_decimals: parse(&var("STABLECOIN_DECIMALS", "18"), "STABLECOIN_DECIMALS")?,
            loan_count: parse(&var("LOAN_COUNT", "20"), "LOAN_COUNT")?,
            partition: TranchePartition::parse(&var("TRANCHE_PARTITION", "1-6,7-12,13-19"))?,
            subscription_band,
            artifacts: Artifacts {
                stablecoin: var("STABLECOIN_ARTIFACT", "MockERC20"),
                loan_registry: var("LOAN_REGISTRY_ARTIFACT", "LoanNFT"),
                pool: var("POOL_ARTIFACT", "Pool"),
            },
        })
    }

    /// Accounts the orchestrator can sign for.
    pub fn signers(&self) -> Vec<Address> {
        vec![self.operator.clone(), self.investor.clone()]
    }
}

fn parse<T: std::str::FromStr>(raw: &str, key: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| OrchestratorError::Config(format!("Invalid {key}")))
}

fn address(raw: &str, key: &str) -> Result<Address> {
    Address::parse(raw).map_err(|e| OrchestratorError::Config(format!("{key}: {e}")))
}
