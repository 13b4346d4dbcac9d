//! Loan securitization orchestrator: entry point.
//!
//! Drives a loan pool through its lifecycle on an external ledger (contract
//! deployment, loan tokenization, tranching, investor subscriptions and
//! coupon payments) and exposes each stage as an Axum REST endpoint.

mod api;
mod config;
mod errors;
mod events;
mod ledger;
mod loans;
mod payments;
mod rpc;
mod sequencer;
mod session;
mod subscription;
mod tranches;
mod workflow;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::Config;
use rpc::RpcLedger;
use workflow::Orchestrator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;

    let client = Client::builder().timeout(config.http_timeout).build()?;
    let ledger = RpcLedger::new(client, config.ledger_rpc_url.clone());
    info!(
        rpc = %config.ledger_rpc_url,
        operator = %config.operator,
        investor = %config.investor,
        "ledger client ready"
    );

    let addr = format!("0.0.0.0:{}", config.api_port);
    let state = Arc::new(api::ApiState::new(Orchestrator::new(ledger, config)));
    let app = router(state);

    // ─── Shutdown on Ctrl-C ───────────────────────────────
    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for shutdown signal: {e}");
        }
        trigger.cancel();
    });

    info!("API listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("orchestrator stopped");
    Ok(())
}

fn router(state: Arc<api::ApiState<RpcLedger>>) -> Router {
    Router::new()
        .route("/health", get(api::health))
        .route("/session", get(api::session::<RpcLedger>))
        .route("/reset", post(api::reset::<RpcLedger>))
        .route("/deploy-base-token", post(api::deploy_base_token::<RpcLedger>))
        .route("/fund-investor", post(api::fund_investor::<RpcLedger>))
        .route("/deploy-loan-registry", post(api::deploy_loan_registry::<RpcLedger>))
        .route("/deploy-pool", post(api::deploy_pool::<RpcLedger>))
        .route("/tokenize-loans", post(api::tokenize_loans::<RpcLedger>))
        .route("/loan-detail", post(api::loan_detail::<RpcLedger>))
        .route("/create-tranches", post(api::create_tranches::<RpcLedger>))
        .route("/subscribe", post(api::subscribe::<RpcLedger>))
        .route("/holdings", post(api::holdings::<RpcLedger>))
        .route("/balance", post(api::balance::<RpcLedger>))
        .route("/deposit-payment", post(api::deposit_payment::<RpcLedger>))
        .route("/distribute-payment", post(api::distribute_payment::<RpcLedger>))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
