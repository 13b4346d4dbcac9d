//! Stage workflow controller.
//!
//! [`Orchestrator`] owns the ledger client, the configuration and the one
//! [`WorkflowSession`]. Every operation follows the same shape: check the
//! stage gate, validate input, talk to the ledger, and only then write the
//! confirmed results into the session and advance the stage. An early return
//! anywhere before the last step leaves the session untouched, except that
//! tokenization keeps the mints confirmed before a failure so a retry resumes
//! after them.

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::config::Config;
use crate::errors::{OrchestratorError, Result};
use crate::ledger::{
    amount_arg, as_address, as_u128, as_u32, decimal_string, to_base_units, tuple_field, Address,
    Ledger, LedgerCall,
};
use crate::loans::{self, LoanDetail, LoanRecord};
use crate::payments::{self, DepositReport, DistributionParties, DistributionReport};
use crate::sequencer::Sequencer;
use crate::session::{Operation, WorkflowSession};
use crate::subscription::{self, SubscriptionOutcome, SubscriptionParties};
use crate::tranches::{self, RateSchedule, TrancheId, TrancheInfo, SERIES_ID};

// ─────────────────────────────────────────────────────────
// Operation outputs
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Deployed {
    pub address: Address,
    pub tx_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvestorFunded {
    pub recipient: Address,
    /// Whole tokens as requested.
    #[serde(serialize_with = "decimal_string")]
    pub amount: u128,
    #[serde(serialize_with = "decimal_string")]
    pub base_units: u128,
    pub tx_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolDeployed {
    pub address: Address,
    pub tx_hash: String,
    pub loans: Vec<LoanRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoansTokenized {
    pub token_ids: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranchesCreated {
    pub tranches: Vec<TrancheInfo>,
    /// Minted loans no tranche claims.
    pub unassigned: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Holdings {
    pub investor: Address,
    pub senior: String,
    pub mezzanine: String,
    pub junior: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BalanceReport {
    pub tranche: TrancheId,
    #[serde(serialize_with = "decimal_string")]
    pub balance: u128,
    #[serde(serialize_with = "decimal_string")]
    pub principal: u128,
    #[serde(serialize_with = "decimal_string")]
    pub expected_return: u128,
    pub interest: String,
    pub interest_rate_percent: f64,
}

/// What a client needs to render the workflow.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot<'a> {
    pub complete: bool,
    pub operator: &'a Address,
    pub investor: &'a Address,
    pub available_operations: Vec<Operation>,
    #[serde(flatten)]
    pub session: &'a WorkflowSession,
}

pub struct Orchestrator<L: Ledger> {
    ledger: L,
    config: Config,
    session: WorkflowSession,
}

impl<L: Ledger> Orchestrator<L> {
    pub fn new(ledger: L, config: Config) -> Self {
        Self {
            ledger,
            config,
            session: WorkflowSession::new(),
        }
    }

    #[cfg(test)]
    pub fn session(&self) -> &WorkflowSession {
        &self.session
    }

    #[cfg(test)]
    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub fn snapshot(&self) -> SessionSnapshot<'_> {
        SessionSnapshot {
            complete: self.session.is_complete(),
            operator: &self.config.operator,
            investor: &self.config.investor,
            available_operations: Operation::available_at(self.session.stage()),
            session: &self.session,
        }
    }

    /// Start a new run. Nothing on the ledger is touched.
    pub fn reset(&mut self) {
        info!(previous_stage = self.session.stage(), "workflow reset");
        self.session = WorkflowSession::new();
    }

    async fn operator_batch(&self) -> Result<Sequencer<'_, L>> {
        Sequencer::begin(&self.ledger, self.config.operator.clone(), self.config.receipt_timing).await
    }

    fn finish(&mut self, op: Operation) {
        self.session.complete(op);
        info!(operation = %op, stage = self.session.stage(), "stage complete");
    }

    async fn deploy(&self, artifact: &str, args: Vec<Value>) -> Result<Deployed> {
        let mut batch = self.operator_batch().await?;
        let call = LedgerCall::deploy(artifact, args);
        let receipt = batch.submit(call.clone()).await?;
        let address = receipt
            .contract_address
            .clone()
            .ok_or_else(|| OrchestratorError::LedgerCall {
                call: call.to_string(),
                cause: "receipt carries no contract address".to_string(),
            })?;
        info!(%artifact, %address, "contract deployed");
        Ok(Deployed {
            address,
            tx_hash: receipt.tx_hash,
        })
    }

    // ─────────────────────────────────────────────────────
    // Stages 1–5: contracts and loans
    // ─────────────────────────────────────────────────────

    pub async fn deploy_base_token(&mut self) -> Result<Deployed> {
        self.session.ensure_allowed(Operation::DeployBaseToken)?;
        let deployed = self.deploy(&self.config.artifacts.stablecoin, vec![]).await?;
        self.session.deployed.stablecoin = Some(deployed.address.clone());
        self.finish(Operation::DeployBaseToken);
        Ok(deployed)
    }

    /// Mint `amount` whole stablecoin tokens to `recipient`.
    pub async fn fund_investor(&mut self, recipient: &str, amount: u128) -> Result<InvestorFunded> {
        self.session.ensure_allowed(Operation::FundInvestor)?;
        let recipient = Address::parse(recipient)?;
        if amount == 0 {
            return Err(OrchestratorError::Validation("amount must be positive".to_string()));
        }
        let base_units = to_base_units(amount, self.config.stablecoin_decimals)?;
        let stablecoin = self.session.stablecoin()?.clone();

        let mut batch = self.operator_batch().await?;
        let receipt = batch
            .submit(LedgerCall::invoke(
                &stablecoin,
                "mint",
                vec![json!(recipient), amount_arg(base_units)],
            ))
            .await?;

        self.finish(Operation::FundInvestor);
        Ok(InvestorFunded {
            recipient,
            amount,
            base_units,
            tx_hash: receipt.tx_hash,
        })
    }

    pub async fn deploy_loan_registry(&mut self) -> Result<Deployed> {
        self.session.ensure_allowed(Operation::DeployLoanRegistry)?;
        let deployed = self.deploy(&self.config.artifacts.loan_registry, vec![]).await?;
        self.session.deployed.loan_registry = Some(deployed.address.clone());
        self.finish(Operation::DeployLoanRegistry);
        Ok(deployed)
    }

    /// Deploy the pool against the given (or session) registry and
    /// stablecoin, then generate the loan book to tokenize next.
    pub async fn deploy_pool(
        &mut self,
        loan_registry: Option<&str>,
        stablecoin: Option<&str>,
    ) -> Result<PoolDeployed> {
        self.session.ensure_allowed(Operation::DeployPool)?;
        let loan_registry = match loan_registry {
            Some(raw) => Address::parse(raw)?,
            None => self.session.loan_registry()?.clone(),
        };
        let stablecoin = match stablecoin {
            Some(raw) => Address::parse(raw)?,
            None => self.session.stablecoin()?.clone(),
        };

        let deployed = self
            .deploy(
                &self.config.artifacts.pool,
                vec![json!(loan_registry), json!(stablecoin)],
            )
            .await?;
        let loans = loans::generate_loans(&mut rand::thread_rng(), self.config.loan_count, Utc::now());

        self.session.deployed.pool = Some(deployed.address.clone());
        self.session.generated_loans = loans.clone();
        self.finish(Operation::DeployPool);
        Ok(PoolDeployed {
            address: deployed.address,
            tx_hash: deployed.tx_hash,
            loans,
        })
    }

    pub async fn tokenize_loans(&mut self) -> Result<LoansTokenized> {
        self.session.ensure_allowed(Operation::TokenizeLoans)?;
        let registry = self.session.loan_registry()?.clone();
        let pool = self.session.pool()?.clone();
        if self.session.generated_loans.is_empty() {
            return Err(OrchestratorError::Precondition("no loans have been generated".to_string()));
        }

        let mut batch =
            Sequencer::begin(&self.ledger, self.config.operator.clone(), self.config.receipt_timing).await?;
        let token_ids =
            loans::tokenize(&mut batch, &registry, &pool, &mut self.session.generated_loans).await?;

        self.session.minted_loan_token_ids = token_ids.clone();
        self.finish(Operation::TokenizeLoans);
        Ok(LoansTokenized { token_ids })
    }

    pub async fn fetch_loan_detail(&mut self, index: u64) -> Result<LoanDetail> {
        self.session.ensure_allowed(Operation::FetchLoanDetail)?;
        let minted = &self.session.minted_loan_token_ids;
        let token_id = usize::try_from(index)
            .ok()
            .and_then(|i| minted.get(i).copied())
            .ok_or_else(|| {
                OrchestratorError::Validation(format!(
                    "loan index must be between 0 and {}, got {index}",
                    minted.len().saturating_sub(1)
                ))
            })?;
        let registry = self.session.loan_registry()?.clone();

        let detail = loans::fetch_loan_detail(&self.ledger, &registry, index, token_id).await?;
        self.finish(Operation::FetchLoanDetail);
        Ok(detail)
    }

    // ─────────────────────────────────────────────────────
    // Stages 7–10: tranches and subscriptions
    // ─────────────────────────────────────────────────────

    pub async fn create_tranches(&mut self, rates: RateSchedule) -> Result<TranchesCreated> {
        self.session.ensure_allowed(Operation::CreateTranches)?;
        rates.validate()?;
        let registry = self.session.loan_registry()?.clone();
        let pool = self.session.pool()?.clone();
        let partition = &self.config.partition;
        partition.check_minted(&self.session.minted_loan_token_ids)?;
        let unassigned = partition.unassigned(&self.session.minted_loan_token_ids);
        if !unassigned.is_empty() {
            warn!(?unassigned, "minted loans left out of every tranche");
        }

        let notionals = tranches::aggregate_notional(&self.ledger, &registry, partition).await?;
        let mut batch = self.operator_batch().await?;
        let created = tranches::create_tranches(&mut batch, &pool, partition, &notionals, &rates).await?;
        let read_back = tranches::read_back(&self.ledger, &pool).await?;

        self.session.tranches = created;
        self.finish(Operation::CreateTranches);
        Ok(TranchesCreated {
            tranches: read_back,
            unassigned,
        })
    }

    pub async fn subscribe_tranche(&mut self, tranche: &str, requested: u128) -> Result<SubscriptionOutcome> {
        self.session.ensure_allowed(Operation::SubscribeTranche)?;
        let tranche = TrancheId::from_name(tranche).ok_or_else(|| {
            OrchestratorError::Validation(format!(
                "tranche must be Senior, Mezzanine or Junior, got `{tranche}`"
            ))
        })?;
        self.config.subscription_band.validate(requested)?;

        let notional = self.session.tranche(tranche)?.notional;
        let already = self.session.subscribed(tranche);
        let accepted = subscription::allocate(requested, notional, already);
        if accepted == 0 {
            return Err(OrchestratorError::Validation(format!(
                "{tranche} tranche is fully subscribed"
            )));
        }
        let stablecoin = self.session.stablecoin()?.clone();
        let pool = self.session.pool()?.clone();

        let parties = SubscriptionParties {
            operator: &self.config.operator,
            investor: &self.config.investor,
            stablecoin: &stablecoin,
            pool: &pool,
        };
        subscription::execute(
            &self.ledger,
            self.config.receipt_timing,
            &parties,
            tranche,
            accepted,
            self.config.stablecoin_decimals,
        )
        .await?;

        let total = already + accepted;
        self.session.subscribed.insert(tranche, total);
        self.session.selected_tranche = Some(tranche);
        self.finish(Operation::SubscribeTranche);
        Ok(SubscriptionOutcome {
            tranche,
            investor: self.config.investor.clone(),
            requested,
            accepted,
            remaining_capacity: notional.saturating_sub(total),
        })
    }

    pub async fn query_holdings(&mut self) -> Result<Holdings> {
        self.session.ensure_allowed(Operation::QueryHoldings)?;
        let pool = self.session.pool()?.clone();
        let investor = self.config.investor.clone();

        let ledger = &self.ledger;
        let (senior, mezzanine, junior) = tokio::try_join!(
            holding_of(ledger, &pool, &investor, TrancheId::Senior),
            holding_of(ledger, &pool, &investor, TrancheId::Mezzanine),
            holding_of(ledger, &pool, &investor, TrancheId::Junior),
        )?;

        let holdings = Holdings {
            investor,
            senior: senior.to_string(),
            mezzanine: mezzanine.to_string(),
            junior: junior.to_string(),
        };
        self.finish(Operation::QueryHoldings);
        Ok(holdings)
    }

    pub async fn query_balance(&mut self) -> Result<BalanceReport> {
        self.session.ensure_allowed(Operation::QueryBalance)?;
        let tranche = self.session.selected_tranche()?;
        let pool = self.session.pool()?.clone();
        let investor = &self.config.investor;
        let ledger = &self.ledger;

        let token = as_address(&ledger.query(&pool, "trancheToken", vec![]).await?, "trancheToken")?;
        let class = json!(tranche.class_id());
        let balance = as_u128(
            &ledger
                .query(&token, "balanceOf", vec![json!(investor), class.clone(), json!(SERIES_ID)])
                .await?,
            "balanceOf",
        )?;
        let expected_return = as_u128(
            &ledger
                .query(&pool, "getExpectedReturn", vec![class.clone(), json!(SERIES_ID), json!(investor)])
                .await?,
            "getExpectedReturn",
        )?;
        let terms = ledger.query(&pool, "tranches", vec![class, json!(SERIES_ID)]).await?;
        let rate_bps = as_u32(tuple_field(&terms, 1, "interestRateBps")?, "interestRateBps")?;

        let interest = if expected_return >= balance {
            (expected_return - balance).to_string()
        } else {
            format!("-{}", balance - expected_return)
        };
        self.finish(Operation::QueryBalance);
        Ok(BalanceReport {
            tranche,
            balance,
            principal: balance,
            expected_return,
            interest,
            interest_rate_percent: loans::bps_to_percent(rate_bps),
        })
    }

    // ─────────────────────────────────────────────────────
    // Stages 11–12: payments
    // ─────────────────────────────────────────────────────

    pub async fn deposit_payment(&mut self, payment_amount: u128) -> Result<DepositReport> {
        self.session.ensure_allowed(Operation::DepositPayment)?;
        if payment_amount == 0 {
            return Err(OrchestratorError::Validation(
                "payment amount must be positive".to_string(),
            ));
        }
        let pool = self.session.pool()?.clone();

        let report = payments::deposit(
            &self.ledger,
            self.config.receipt_timing,
            &self.config.operator,
            &pool,
            payment_amount,
        )
        .await?;

        for cycle in &report.cycles {
            if let Some(class) = self.session.tranches.get_mut(&cycle.tranche) {
                class.fully_funded = cycle.fully_funded;
            }
        }
        self.finish(Operation::DepositPayment);
        Ok(report)
    }

    pub async fn distribute_payment(&mut self) -> Result<DistributionReport> {
        self.session.ensure_allowed(Operation::DistributePayment)?;
        let tranche = self.session.selected_tranche()?;
        let pool = self.session.pool()?.clone();
        let signers = self.config.signers();

        let parties = DistributionParties {
            operator: &self.config.operator,
            signers: &signers,
            pool: &pool,
        };
        let report =
            payments::distribute(&self.ledger, self.config.receipt_timing, &parties, tranche).await?;

        if let (Some(class), Some(funded)) = (self.session.tranches.get_mut(&tranche), report.fully_funded) {
            class.fully_funded = funded;
        }
        self.finish(Operation::DistributePayment);
        Ok(report)
    }
}

async fn holding_of<L: Ledger>(ledger: &L, pool: &Address, investor: &Address, tranche: TrancheId) -> Result<u128> {
    let held = ledger
        .query(
            pool,
            "investorHoldings",
            vec![json!(tranche.class_id()), json!(SERIES_ID), json!(investor)],
        )
        .await?;
    as_u128(&held, "investorHoldings")
}
