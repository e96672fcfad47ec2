//! Wallet provider boundary.
//!
//! A wallet grants account access, hands out a signer for an authorized
//! account and reports when the user switches account or network. The sync
//! client only talks to wallets through [`WalletProvider`] and
//! [`TransactionSigner`].
//!
//! [`RpcWallet`] implements both over a JSON-RPC endpoint that manages its
//! own accounts (a wallet bridge, or a dev node such as anvil). Endpoints
//! have no push channel, so account and chain changes are detected by a
//! polling watcher.

use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, B256, U256, U64};
use async_trait::async_trait;
use serde_json::json;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{Result, SyncError};
use crate::rpc::{CallFailure, RpcClient, TxRequest, USER_REJECTED_CODE};

const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Notification pushed by the wallet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletEvent {
    /// The authorized accounts changed; empty means access was revoked.
    AccountsChanged(Vec<Address>),
    /// The wallet switched to another chain.
    ChainChanged(u64),
}

/// Capability to submit transactions on behalf of one account.
#[async_trait]
pub trait TransactionSigner: Send + Sync {
    fn address(&self) -> Address;

    /// Sign and broadcast `request`, returning its hash once the wallet has
    /// accepted it. Inclusion is not awaited.
    async fn send_transaction(&self, request: TxRequest) -> Result<B256>;
}

#[async_trait]
pub trait WalletProvider: Send + Sync + 'static {
    type Signer: TransactionSigner + 'static;

    /// Ask the user for account access. May prompt.
    async fn request_accounts(&self) -> Result<Vec<Address>>;

    /// Accounts already authorized, without prompting.
    async fn accounts(&self) -> Result<Vec<Address>>;

    async fn chain_id(&self) -> Result<u64>;

    /// A fresh signer for an authorized account.
    async fn signer(&self, address: Address) -> Result<Self::Signer>;

    async fn balance(&self, address: Address) -> Result<U256>;

    fn subscribe(&self) -> broadcast::Receiver<WalletEvent>;
}

// ─────────────────────────────────────────────────────────
// JSON-RPC wallet
// ─────────────────────────────────────────────────────────

pub struct RpcWallet {
    rpc: Arc<RpcClient>,
    events: broadcast::Sender<WalletEvent>,
}

impl RpcWallet {
    /// Query the endpoint once. An endpoint that does not answer at all is
    /// treated as an absent provider.
    pub async fn detect(rpc: Arc<RpcClient>) -> Result<Self> {
        match rpc.request::<U64>("eth_chainId", json!([])).await {
            Ok(chain_id) => {
                info!("Wallet provider detected at {} (chain {chain_id})", rpc.url());
            }
            Err(CallFailure::Transport(e)) => {
                return Err(SyncError::ProviderUnavailable(format!(
                    "no wallet at {}: {e}",
                    rpc.url()
                )));
            }
            Err(other) => {
                return Err(SyncError::ProviderUnavailable(format!(
                    "{} is not a wallet endpoint: {}",
                    rpc.url(),
                    SyncError::from(other)
                )));
            }
        }

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self { rpc, events })
    }

    /// Poll accounts and chain id every `interval` and broadcast changes
    /// until `cancel` fires.
    pub fn spawn_watcher(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let rpc = Arc::clone(&self.rpc);
        let events = self.events.clone();

        tokio::spawn(async move {
            let mut last_accounts: Option<Vec<Address>> = None;
            let mut last_chain: Option<u64> = None;

            loop {
                match poll_wallet(&rpc).await {
                    Ok((accounts, chain_id)) => {
                        for event in diff_wallet_state(
                            &mut last_accounts,
                            &mut last_chain,
                            accounts,
                            chain_id,
                        ) {
                            debug!(?event, "wallet state changed");
                            // No subscribers is fine.
                            let _ = events.send(event);
                        }
                    }
                    Err(e) => warn!("Wallet poll failed: {e}"),
                }

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            info!("Wallet watcher stopped");
        })
    }
}

async fn poll_wallet(rpc: &RpcClient) -> Result<(Vec<Address>, u64)> {
    let accounts: Vec<Address> = rpc.read("eth_accounts", json!([])).await?;
    let chain_id = rpc.chain_id().await?;
    Ok((accounts, chain_id))
}

/// Compare a fresh poll against the last one. The first poll only seeds the
/// state.
fn diff_wallet_state(
    last_accounts: &mut Option<Vec<Address>>,
    last_chain: &mut Option<u64>,
    accounts: Vec<Address>,
    chain_id: u64,
) -> Vec<WalletEvent> {
    let mut events = Vec::new();

    if let Some(prev) = last_chain.replace(chain_id) {
        if prev != chain_id {
            events.push(WalletEvent::ChainChanged(chain_id));
        }
    }
    match last_accounts {
        Some(prev) if *prev != accounts => {
            events.push(WalletEvent::AccountsChanged(accounts.clone()));
            *prev = accounts;
        }
        Some(_) => {}
        None => *last_accounts = Some(accounts),
    }

    events
}

#[async_trait]
impl WalletProvider for RpcWallet {
    type Signer = RpcSigner;

    async fn request_accounts(&self) -> Result<Vec<Address>> {
        match self
            .rpc
            .request::<Vec<Address>>("eth_requestAccounts", json!([]))
            .await
        {
            Ok(accounts) => Ok(accounts),
            Err(CallFailure::Rpc(e)) if e.code == USER_REJECTED_CODE => Err(
                SyncError::Connection(format!("account access rejected: {}", e.message)),
            ),
            // Plain nodes have no prompt; their unlocked accounts are authorized.
            Err(CallFailure::Rpc(e)) if e.code == -32601 => self.accounts().await,
            Err(other) => Err(SyncError::Connection(SyncError::from(other).to_string())),
        }
    }

    async fn accounts(&self) -> Result<Vec<Address>> {
        self.rpc.read("eth_accounts", json!([])).await
    }

    async fn chain_id(&self) -> Result<u64> {
        self.rpc.chain_id().await
    }

    async fn signer(&self, address: Address) -> Result<RpcSigner> {
        if !self.accounts().await?.contains(&address) {
            return Err(SyncError::Connection(format!(
                "account {address} is not authorized by the wallet"
            )));
        }
        Ok(RpcSigner {
            rpc: Arc::clone(&self.rpc),
            address,
        })
    }

    async fn balance(&self, address: Address) -> Result<U256> {
        self.rpc.balance(address).await
    }

    fn subscribe(&self) -> broadcast::Receiver<WalletEvent> {
        self.events.subscribe()
    }
}

/// Signs through the wallet endpoint's `eth_sendTransaction`.
pub struct RpcSigner {
    rpc: Arc<RpcClient>,
    address: Address,
}

#[async_trait]
impl TransactionSigner for RpcSigner {
    fn address(&self) -> Address {
        self.address
    }

    async fn send_transaction(&self, mut request: TxRequest) -> Result<B256> {
        request.from = Some(self.address);
        self.rpc
            .request("eth_sendTransaction", json!([request]))
            .await
            .map_err(|failure| match failure {
                CallFailure::Rpc(e) => e.into_send_error(),
                other => other.into(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_poll_only_seeds() {
        let (mut accounts, mut chain) = (None, None);
        let events = diff_wallet_state(&mut accounts, &mut chain, vec![Address::repeat_byte(1)], 1);
        assert!(events.is_empty());
        assert_eq!(chain, Some(1));
    }

    #[test]
    fn detects_account_and_chain_changes() {
        let a = Address::repeat_byte(1);
        let b = Address::repeat_byte(2);
        let (mut accounts, mut chain) = (None, None);
        diff_wallet_state(&mut accounts, &mut chain, vec![a], 1);

        let events = diff_wallet_state(&mut accounts, &mut chain, vec![b], 1);
        assert_eq!(events, vec![WalletEvent::AccountsChanged(vec![b])]);

        let events = diff_wallet_state(&mut accounts, &mut chain, vec![], 5);
        assert_eq!(
            events,
            vec![
                WalletEvent::ChainChanged(5),
                WalletEvent::AccountsChanged(vec![])
            ]
        );

        let events = diff_wallet_state(&mut accounts, &mut chain, vec![], 5);
        assert!(events.is_empty());
    }
}
