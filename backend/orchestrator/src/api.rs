//! Axum REST API handlers.
//!
//! One route per workflow operation. The orchestrator sits behind a single
//! async mutex, so operations run one at a time in arrival order.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::warn;

use crate::errors::OrchestratorError;
use crate::ledger::{as_u128, Ledger};
use crate::loans::LoanDetail;
use crate::payments::{DepositReport, DistributionReport};
use crate::subscription::SubscriptionOutcome;
use crate::tranches::RateSchedule;
use crate::workflow::{
    BalanceReport, Deployed, Holdings, InvestorFunded, LoansTokenized, Orchestrator, PoolDeployed,
    TranchesCreated,
};

pub struct ApiState<L: Ledger> {
    pub orchestrator: Mutex<Orchestrator<L>>,
}

impl<L: Ledger> ApiState<L> {
    pub fn new(orchestrator: Orchestrator<L>) -> Self {
        Self {
            orchestrator: Mutex::new(orchestrator),
        }
    }
}

type Shared<L> = State<Arc<ApiState<L>>>;

// ─────────────────────────────────────────────────────────
// Request / response shapes
// ─────────────────────────────────────────────────────────

/// Amounts may be sent as JSON numbers or decimal strings.
fn amount<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
    let raw = Value::deserialize(deserializer)?;
    as_u128(&raw, "amount").map_err(serde::de::Error::custom)
}

#[derive(Debug, Deserialize)]
pub struct FundInvestorRequest {
    pub recipient: String,
    #[serde(deserialize_with = "amount")]
    pub amount: u128,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeployPoolRequest {
    pub loan_registry: Option<String>,
    pub stablecoin: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LoanDetailRequest {
    pub index: u64,
}

#[derive(Debug, Deserialize)]
pub struct SubscribeRequest {
    pub tranche: String,
    #[serde(deserialize_with = "amount")]
    pub amount: u128,
}

#[derive(Debug, Deserialize)]
pub struct DepositRequest {
    #[serde(deserialize_with = "amount")]
    pub amount: u128,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: &'static str,
}

/// Error half of every handler's result.
#[derive(Debug)]
pub struct ApiError(pub OrchestratorError);

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        Self(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(OrchestratorError::Validation(rejection.body_text()))
    }
}

pub fn status_for(e: &OrchestratorError) -> StatusCode {
    match e {
        OrchestratorError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        OrchestratorError::Precondition(_) | OrchestratorError::DuplicateLoanAssignment(_) => {
            StatusCode::CONFLICT
        }
        OrchestratorError::LedgerCall { .. }
        | OrchestratorError::EventNotFound { .. }
        | OrchestratorError::Rpc(_)
        | OrchestratorError::Http(_)
        | OrchestratorError::Json(_) => StatusCode::BAD_GATEWAY,
        OrchestratorError::LedgerTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        OrchestratorError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            warn!(kind = self.0.kind(), "operation failed: {}", self.0);
        }
        let body = ErrorResponse {
            error: self.0.to_string(),
            kind: self.0.kind(),
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `GET /session`
pub async fn session<L: Ledger>(State(state): Shared<L>) -> Response {
    let orchestrator = state.orchestrator.lock().await;
    Json(orchestrator.snapshot()).into_response()
}

/// `POST /reset`
pub async fn reset<L: Ledger>(State(state): Shared<L>) -> Response {
    let mut orchestrator = state.orchestrator.lock().await;
    orchestrator.reset();
    Json(orchestrator.snapshot()).into_response()
}

/// `POST /deploy-base-token`
pub async fn deploy_base_token<L: Ledger>(State(state): Shared<L>) -> ApiResult<Deployed> {
    let mut orchestrator = state.orchestrator.lock().await;
    Ok(Json(orchestrator.deploy_base_token().await?))
}

/// `POST /fund-investor`
pub async fn fund_investor<L: Ledger>(
    State(state): Shared<L>,
    payload: Result<Json<FundInvestorRequest>, JsonRejection>,
) -> ApiResult<InvestorFunded> {
    let Json(req) = payload?;
    let mut orchestrator = state.orchestrator.lock().await;
    Ok(Json(orchestrator.fund_investor(&req.recipient, req.amount).await?))
}

/// `POST /deploy-loan-registry`
pub async fn deploy_loan_registry<L: Ledger>(State(state): Shared<L>) -> ApiResult<Deployed> {
    let mut orchestrator = state.orchestrator.lock().await;
    Ok(Json(orchestrator.deploy_loan_registry().await?))
}

/// `POST /deploy-pool`
///
/// Both addresses are optional and default to the ones deployed earlier in
/// the session. An empty body is accepted.
pub async fn deploy_pool<L: Ledger>(
    State(state): Shared<L>,
    payload: Option<Json<DeployPoolRequest>>,
) -> ApiResult<PoolDeployed> {
    let req = payload.map(|Json(req)| req).unwrap_or_default();
    let mut orchestrator = state.orchestrator.lock().await;
    let deployed = orchestrator
        .deploy_pool(req.loan_registry.as_deref(), req.stablecoin.as_deref())
        .await?;
    Ok(Json(deployed))
}

/// `POST /tokenize-loans`
pub async fn tokenize_loans<L: Ledger>(State(state): Shared<L>) -> ApiResult<LoansTokenized> {
    let mut orchestrator = state.orchestrator.lock().await;
    Ok(Json(orchestrator.tokenize_loans().await?))
}

/// `POST /loan-detail`
pub async fn loan_detail<L: Ledger>(
    State(state): Shared<L>,
    payload: Result<Json<LoanDetailRequest>, JsonRejection>,
) -> ApiResult<LoanDetail> {
    let Json(req) = payload?;
    let mut orchestrator = state.orchestrator.lock().await;
    Ok(Json(orchestrator.fetch_loan_detail(req.index).await?))
}

/// `POST /create-tranches`
pub async fn create_tranches<L: Ledger>(
    State(state): Shared<L>,
    payload: Result<Json<RateSchedule>, JsonRejection>,
) -> ApiResult<TranchesCreated> {
    let Json(rates) = payload?;
    let mut orchestrator = state.orchestrator.lock().await;
    Ok(Json(orchestrator.create_tranches(rates).await?))
}

/// `POST /subscribe`
pub async fn subscribe<L: Ledger>(
    State(state): Shared<L>,
    payload: Result<Json<SubscribeRequest>, JsonRejection>,
) -> ApiResult<SubscriptionOutcome> {
    let Json(req) = payload?;
    let mut orchestrator = state.orchestrator.lock().await;
    Ok(Json(orchestrator.subscribe_tranche(&req.tranche, req.amount).await?))
}

/// `POST /holdings`
pub async fn holdings<L: Ledger>(State(state): Shared<L>) -> ApiResult<Holdings> {
    let mut orchestrator = state.orchestrator.lock().await;
    Ok(Json(orchestrator.query_holdings().await?))
}

/// `POST /balance`
pub async fn balance<L: Ledger>(State(state): Shared<L>) -> ApiResult<BalanceReport> {
    let mut orchestrator = state.orchestrator.lock().await;
    Ok(Json(orchestrator.query_balance().await?))
}

/// `POST /deposit-payment`
pub async fn deposit_payment<L: Ledger>(
    State(state): Shared<L>,
    payload: Result<Json<DepositRequest>, JsonRejection>,
) -> ApiResult<DepositReport> {
    let Json(req) = payload?;
    let mut orchestrator = state.orchestrator.lock().await;
    Ok(Json(orchestrator.deposit_payment(req.amount).await?))
}

/// `POST /distribute-payment`
pub async fn distribute_payment<L: Ledger>(State(state): Shared<L>) -> ApiResult<DistributionReport> {
    let mut orchestrator = state.orchestrator.lock().await;
    Ok(Json(orchestrator.distribute_payment().await?))
}
