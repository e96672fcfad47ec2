//! GovFund sync service entry point.
//!
//! Detects the wallet endpoint, builds the sync client against the deployed
//! GovFund contract and exposes it over a small Axum REST API. Optional
//! background tasks keep the cache current between requests.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use govfund_sync::api::{self, ApiState};
use govfund_sync::rpc::RpcClient;
use govfund_sync::{sync, Config, ContractSyncClient, GovFundContract, RpcWallet};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;

    let http = Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?;
    let chain = Arc::new(RpcClient::new(http.clone(), config.rpc_url.clone()));
    let wallet_rpc = Arc::new(RpcClient::new(http, config.wallet_url.clone()));

    let shutdown = CancellationToken::new();

    // ─── Wallet ───────────────────────────────────────────
    let wallet = match RpcWallet::detect(wallet_rpc).await {
        Ok(wallet) => {
            wallet.spawn_watcher(
                Duration::from_secs(config.wallet_poll_interval_secs.max(1)),
                shutdown.child_token(),
            );
            Some(Arc::new(wallet))
        }
        Err(e) => {
            warn!("{e}; connection requests will fail until restart");
            None
        }
    };

    let contract = GovFundContract::new(chain, config.contract_address);
    let client = ContractSyncClient::new(wallet, contract, config.client.clone());
    info!("GovFund contract: {}", config.contract_address);

    if config.auto_connect {
        match client.restore_session().await {
            Ok(true) => info!("Resumed wallet session"),
            Ok(false) => info!("No authorized wallet account to resume"),
            Err(e) => warn!("Could not resume wallet session: {e}"),
        }
    }

    // ─── Background refresh ───────────────────────────────
    if config.refresh_interval_secs > 0 {
        tokio::spawn(sync::run(
            client.clone(),
            Duration::from_secs(config.refresh_interval_secs),
            shutdown.child_token(),
        ));
    }

    // ─── REST API ─────────────────────────────────────────
    let app = api::router(Arc::new(ApiState { client }))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    shutdown.cancel();
    Ok(())
}
