//! The single in-memory workflow session and its stage gating.
//!
//! ```text
//!  1 deploy-base-token ─► 2 fund-investor ─► 3 deploy-loan-registry ─► 4 deploy-pool
//!  ─► 5 tokenize-loans ─► 6 fetch-loan-detail ─► 7 create-tranches ─► 8 subscribe-tranche
//!  ─► 9 query-holdings ─► 10 query-balance ─► 11 deposit-payment ─► 12 distribute-payment ─► 13
//! ```
//!
//! Stages only move forward. Repeatable operations may run again from the
//! stage they produced without moving it.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::errors::{OrchestratorError, Result};
use crate::ledger::Address;
use crate::loans::LoanRecord;
use crate::tranches::{TrancheClass, TrancheId};

pub const INITIAL_STAGE: u8 = 1;
pub const FINAL_STAGE: u8 = 13;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operation {
    DeployBaseToken,
    FundInvestor,
    DeployLoanRegistry,
    DeployPool,
    TokenizeLoans,
    FetchLoanDetail,
    CreateTranches,
    SubscribeTranche,
    QueryHoldings,
    QueryBalance,
    DepositPayment,
    DistributePayment,
}

impl Operation {
    pub const ALL: [Operation; 12] = [
        Self::DeployBaseToken,
        Self::FundInvestor,
        Self::DeployLoanRegistry,
        Self::DeployPool,
        Self::TokenizeLoans,
        Self::FetchLoanDetail,
        Self::CreateTranches,
        Self::SubscribeTranche,
        Self::QueryHoldings,
        Self::QueryBalance,
        Self::DepositPayment,
        Self::DistributePayment,
    ];

    /// Stage the workflow must be at for the first run of this operation.
    pub fn entry_stage(self) -> u8 {
        self as u8 + 1
    }

    pub fn resulting_stage(self) -> u8 {
        self.entry_stage() + 1
    }

    pub fn is_repeatable(self) -> bool {
        matches!(
            self,
            Self::FundInvestor
                | Self::FetchLoanDetail
                | Self::SubscribeTranche
                | Self::QueryHoldings
                | Self::QueryBalance
                | Self::DepositPayment
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::DeployBaseToken => "deploy-base-token",
            Self::FundInvestor => "fund-investor",
            Self::DeployLoanRegistry => "deploy-loan-registry",
            Self::DeployPool => "deploy-pool",
            Self::TokenizeLoans => "tokenize-loans",
            Self::FetchLoanDetail => "fetch-loan-detail",
            Self::CreateTranches => "create-tranches",
            Self::SubscribeTranche => "subscribe-tranche",
            Self::QueryHoldings => "query-holdings",
            Self::QueryBalance => "query-balance",
            Self::DepositPayment => "deposit-payment",
            Self::DistributePayment => "distribute-payment",
        }
    }

    /// Operations that may run at `stage`.
    pub fn available_at(stage: u8) -> Vec<Operation> {
        Self::ALL
            .into_iter()
            .filter(|op| {
                op.entry_stage() == stage || (op.is_repeatable() && op.resulting_stage() == stage)
            })
            .collect()
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeployedContracts {
    pub stablecoin: Option<Address>,
    pub loan_registry: Option<Address>,
    pub pool: Option<Address>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkflowSession {
    stage: u8,
    pub deployed: DeployedContracts,
    pub generated_loans: Vec<LoanRecord>,
    pub minted_loan_token_ids: Vec<u64>,
    pub tranches: BTreeMap<TrancheId, TrancheClass>,
    pub selected_tranche: Option<TrancheId>,
    /// Capacity already sold per tranche during this session.
    #[serde(serialize_with = "serialize_subscribed")]
    pub subscribed: BTreeMap<TrancheId, u128>,
}

impl Default for WorkflowSession {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowSession {
    pub fn new() -> Self {
        Self {
            stage: INITIAL_STAGE,
            deployed: DeployedContracts::default(),
            generated_loans: Vec::new(),
            minted_loan_token_ids: Vec::new(),
            tranches: BTreeMap::new(),
            selected_tranche: None,
            subscribed: BTreeMap::new(),
        }
    }

    pub fn stage(&self) -> u8 {
        self.stage
    }

    pub fn is_complete(&self) -> bool {
        self.stage == FINAL_STAGE
    }

    /// Reject `op` unless the session is at a stage that permits it.
    pub fn ensure_allowed(&self, op: Operation) -> Result<()> {
        let first_run = self.stage == op.entry_stage();
        let rerun = op.is_repeatable() && self.stage == op.resulting_stage();
        if first_run || rerun {
            return Ok(());
        }
        Err(OrchestratorError::Precondition(format!(
            "{op} requires stage {} but the workflow is at stage {}",
            op.entry_stage(),
            self.stage
        )))
    }

    /// Record that `op` completed. Never moves the stage backwards.
    pub fn complete(&mut self, op: Operation) {
        self.stage = self.stage.max(op.resulting_stage());
    }

    pub fn stablecoin(&self) -> Result<&Address> {
        self.deployed
            .stablecoin
            .as_ref()
            .ok_or_else(|| missing("the stablecoin has not been deployed"))
    }

    pub fn loan_registry(&self) -> Result<&Address> {
        self.deployed
            .loan_registry
            .as_ref()
            .ok_or_else(|| missing("the loan registry has not been deployed"))
    }

    pub fn pool(&self) -> Result<&Address> {
        self.deployed
            .pool
            .as_ref()
            .ok_or_else(|| missing("the pool has not been deployed"))
    }

    pub fn selected_tranche(&self) -> Result<TrancheId> {
        self.selected_tranche
            .ok_or_else(|| missing("no tranche has been subscribed to yet"))
    }

    pub fn tranche(&self, id: TrancheId) -> Result<&TrancheClass> {
        self.tranches
            .get(&id)
            .ok_or_else(|| missing("tranches have not been created"))
    }

    pub fn subscribed(&self, id: TrancheId) -> u128 {
        self.subscribed.get(&id).copied().unwrap_or(0)
    }
}

fn missing(what: &str) -> OrchestratorError {
    OrchestratorError::Precondition(what.to_string())
}

fn serialize_subscribed<S: serde::Serializer>(
    subscribed: &BTreeMap<TrancheId, u128>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_map(subscribed.iter().map(|(k, v)| (k, v.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_are_numbered_one_to_thirteen() {
        assert_eq!(Operation::DeployBaseToken.entry_stage(), 1);
        assert_eq!(Operation::DeployBaseToken.resulting_stage(), 2);
        assert_eq!(Operation::CreateTranches.entry_stage(), 7);
        assert_eq!(Operation::DistributePayment.resulting_stage(), FINAL_STAGE);
        for pair in Operation::ALL.windows(2) {
            assert_eq!(pair[0].resulting_stage(), pair[1].entry_stage());
        }
    }

    #[test]
    fn out_of_order_operations_are_rejected() {
        let session = WorkflowSession::new();
        assert!(session.ensure_allowed(Operation::DeployBaseToken).is_ok());
        for op in &Operation::ALL[1..] {
            assert!(matches!(
                session.ensure_allowed(*op),
                Err(OrchestratorError::Precondition(_))
            ));
        }
    }

    #[test]
    fn repeatable_operations_rerun_without_regressing() {
        let mut session = WorkflowSession::new();
        for op in &Operation::ALL[..8] {
            session.ensure_allowed(*op).unwrap();
            session.complete(*op);
        }
        assert_eq!(session.stage(), 9);

        // Subscribing again is fine; creating tranches again is not.
        assert!(session.ensure_allowed(Operation::SubscribeTranche).is_ok());
        assert!(session.ensure_allowed(Operation::CreateTranches).is_err());
        session.complete(Operation::SubscribeTranche);
        assert_eq!(session.stage(), 9);
        assert_eq!(
            Operation::available_at(9),
            vec![Operation::SubscribeTranche, Operation::QueryHoldings]
        );
    }

    #[test]
    fn terminal_stage_allows_nothing() {
        let mut session = WorkflowSession::new();
        for op in Operation::ALL {
            session.complete(op);
        }
        assert!(session.is_complete());
        assert!(Operation::available_at(FINAL_STAGE).is_empty());
        assert!(Operation::ALL.iter().all(|op| session.ensure_allowed(*op).is_err()));
    }

    #[test]
    fn missing_data_is_a_precondition_error() {
        let session = WorkflowSession::new();
        assert!(matches!(session.pool(), Err(OrchestratorError::Precondition(_))));
        assert!(session.selected_tranche().is_err());
        assert!(session.tranche(TrancheId::Junior).is_err());
        assert_eq!(session.subscribed(TrancheId::Senior), 0);
    }
}
