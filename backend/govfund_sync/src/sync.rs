//! Long-running background task that keeps the client's cache in step with
//! changes made by other users of the contract.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::client::ContractSyncClient;
use crate::contract::ChainReader;
use crate::wallet::WalletProvider;

/// Refresh the cache every `interval` while a wallet is connected, until
/// `cancel` fires.
pub async fn run<W, R>(client: ContractSyncClient<W, R>, interval: Duration, cancel: CancellationToken)
where
    W: WalletProvider,
    R: ChainReader + 'static,
{
    info!("Background refresh every {}s", interval.as_secs());

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        if !client.connection().is_connected() {
            debug!("skipping background refresh: not connected");
            continue;
        }
        // The previous snapshot stays published when a refresh fails.
        if let Err(e) = client.refresh_all().await {
            error!("Background refresh failed: {e}");
        }
    }

    info!("Background refresh stopped");
}
