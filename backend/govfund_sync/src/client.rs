//! # ContractSyncClient
//!
//! Single owner of the wallet connection, the cached chain state and every
//! state-changing call against the GovFund contract.
//!
//! | Phase       | Operations                                                   |
//! |-------------|--------------------------------------------------------------|
//! | Connection  | [`connect`], [`restore_session`], [`disconnect`]             |
//! | Sync        | [`refresh_all`]                                              |
//! | Treasury    | [`deposit_funds`], [`withdraw_funds`]                        |
//! | Projects    | [`create_project`], [`confirm_work`], [`approve_work`], [`send_payment`] |
//! | Queries     | [`connection`], [`snapshot`], [`get_contractor_balance`], [`last_status`] |
//!
//! Every mutation runs in two phases, both finished before it returns:
//! submit and await inclusion, then reload the cache through the refresh
//! gate. Local checks run first and never touch the network.
//!
//! The connection carries an epoch that changes on every connect and reset.
//! Work started under an older epoch may finish its network calls but is
//! never allowed to publish into the cache.
//!
//! [`connect`]: ContractSyncClient::connect
//! [`restore_session`]: ContractSyncClient::restore_session
//! [`disconnect`]: ContractSyncClient::disconnect
//! [`refresh_all`]: ContractSyncClient::refresh_all
//! [`deposit_funds`]: ContractSyncClient::deposit_funds
//! [`withdraw_funds`]: ContractSyncClient::withdraw_funds
//! [`create_project`]: ContractSyncClient::create_project
//! [`confirm_work`]: ContractSyncClient::confirm_work
//! [`approve_work`]: ContractSyncClient::approve_work
//! [`send_payment`]: ContractSyncClient::send_payment
//! [`connection`]: ContractSyncClient::connection
//! [`snapshot`]: ContractSyncClient::snapshot
//! [`get_contractor_balance`]: ContractSyncClient::get_contractor_balance
//! [`last_status`]: ContractSyncClient::last_status

use std::str::FromStr;
use std::sync::{Arc, Weak};

use alloy_primitives::{Address, U256};
use chrono::Utc;
use tokio::sync::{broadcast, watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::amount::format_ether;
use crate::config::ClientConfig;
use crate::contract::{ChainReader, ContractCall, GovFundContract, TxReceipt};
use crate::errors::{Result, SyncError};
use crate::refresh::{RefreshGate, RefreshOutcome};
use crate::types::{
    ChainSnapshot, ConnectionState, ConnectionStatus, ContractTreasury, Project, StatusMessage,
};
use crate::wallet::{TransactionSigner, WalletEvent, WalletProvider};

/// Handle to the sync client. Cheap to clone; all clones share one state.
pub struct ContractSyncClient<W: WalletProvider, R: ChainReader> {
    inner: Arc<Inner<W, R>>,
}

impl<W: WalletProvider, R: ChainReader> Clone for ContractSyncClient<W, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<W: WalletProvider, R> {
    wallet: Option<Arc<W>>,
    contract: GovFundContract<R>,
    config: ClientConfig,
    session: RwLock<Session<W::Signer>>,
    refresh: RefreshGate,
    connection: watch::Sender<ConnectionState>,
    snapshot: watch::Sender<Arc<ChainSnapshot>>,
    status: watch::Sender<Option<StatusMessage>>,
}

struct Session<S> {
    epoch: u64,
    signer: Option<Arc<S>>,
    events: Option<CancellationToken>,
}

impl<S> Session<S> {
    fn current_signer(&self) -> Result<(Arc<S>, u64)> {
        self.signer
            .as_ref()
            .map(|s| (Arc::clone(s), self.epoch))
            .ok_or(SyncError::NotConnected)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum AccountAccess {
    /// May prompt the user.
    Request,
    /// Only accounts the wallet already authorized.
    Existing,
}

impl<W, R> ContractSyncClient<W, R>
where
    W: WalletProvider,
    R: ChainReader + 'static,
{
    /// Build a disconnected client. `wallet` is `None` when no provider was
    /// found; every connection attempt then fails with
    /// [`SyncError::ProviderUnavailable`].
    pub fn new(wallet: Option<Arc<W>>, contract: GovFundContract<R>, config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                wallet,
                contract,
                config,
                session: RwLock::new(Session {
                    epoch: 0,
                    signer: None,
                    events: None,
                }),
                refresh: RefreshGate::new(),
                connection: watch::Sender::new(ConnectionState::default()),
                snapshot: watch::Sender::new(Arc::new(ChainSnapshot::default())),
                status: watch::Sender::new(None),
            }),
        }
    }

    // ─────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────

    pub fn connection(&self) -> ConnectionState {
        self.inner.connection.borrow().clone()
    }

    /// The cached state as one immutable snapshot.
    pub fn snapshot(&self) -> Arc<ChainSnapshot> {
        Arc::clone(&self.inner.snapshot.borrow())
    }

    pub fn projects(&self) -> Vec<Project> {
        self.snapshot().projects.clone()
    }

    pub fn last_status(&self) -> Option<StatusMessage> {
        self.inner.status.borrow().clone()
    }

    /// Receive every snapshot the client publishes.
    pub fn subscribe_snapshots(&self) -> watch::Receiver<Arc<ChainSnapshot>> {
        self.inner.snapshot.subscribe()
    }

    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection.subscribe()
    }

    /// Cumulative wei paid to the contractor of `project_id`, from the cache.
    pub fn get_contractor_balance(&self, project_id: u64) -> Result<U256> {
        self.snapshot()
            .project(project_id)
            .map(|p| p.contractor_disbursed_balance)
            .ok_or_else(|| SyncError::NotFound(format!("project {project_id}")))
    }

    // ─────────────────────────────────────────────────────────
    // Connection
    // ─────────────────────────────────────────────────────────

    /// Request account access and load the full contract state.
    pub async fn connect(&self) -> Result<()> {
        let result = self.open_session(AccountAccess::Request).await.map(|_| ());
        self.record(&result, || "Wallet connected".to_string());
        result
    }

    /// Connect with an account the wallet has already authorized, without
    /// prompting. Returns `false` when there is none.
    pub async fn restore_session(&self) -> Result<bool> {
        let result = self.open_session(AccountAccess::Existing).await;
        if let Ok(true) = result {
            self.record(&result, || "Wallet session restored".to_string());
        } else if result.is_err() {
            self.record(&result, String::new);
        }
        result
    }

    /// Forget the connection and the cache. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        self.reset("disconnected by caller").await;
        self.record::<()>(&Ok(()), || "Wallet disconnected".to_string());
    }

    async fn open_session(&self, access: AccountAccess) -> Result<bool> {
        let wallet = self.wallet()?;

        let epoch = {
            let mut session = self.inner.session.write().await;
            let status = self.inner.connection.borrow().status;
            match status {
                ConnectionStatus::Connecting => {
                    return Err(SyncError::Connection(
                        "a connection attempt is already in progress".to_string(),
                    ));
                }
                ConnectionStatus::Connected => {
                    drop(session);
                    self.refresh_all_inner().await?;
                    return Ok(true);
                }
                ConnectionStatus::Disconnected => {}
            }
            session.epoch += 1;
            self.inner.connection.send_replace(ConnectionState {
                status: ConnectionStatus::Connecting,
                address: None,
                chain_id: None,
            });
            session.epoch
        };

        match self.establish(&wallet, access, epoch).await {
            Ok(connected) => Ok(connected),
            Err(e) => {
                warn!("Connection attempt failed: {e}");
                self.reset_epoch(epoch).await;
                Err(e)
            }
        }
    }

    async fn establish(&self, wallet: &Arc<W>, access: AccountAccess, epoch: u64) -> Result<bool> {
        let accounts = match access {
            AccountAccess::Request => wallet.request_accounts().await?,
            AccountAccess::Existing => wallet.accounts().await.map_err(as_connection_error)?,
        };
        let Some(address) = accounts.first().copied() else {
            if access == AccountAccess::Existing {
                self.reset_epoch(epoch).await;
                return Ok(false);
            }
            return Err(SyncError::Connection(
                "wallet returned no accounts".to_string(),
            ));
        };

        let signer = wallet.signer(address).await.map_err(as_connection_error)?;
        let chain_id = wallet.chain_id().await.map_err(as_connection_error)?;

        let events = CancellationToken::new();
        {
            let mut session = self.inner.session.write().await;
            if session.epoch != epoch {
                return Err(SyncError::Abandoned(
                    "connection was reset while connecting".to_string(),
                ));
            }
            session.signer = Some(Arc::new(signer));
            session.events = Some(events.clone());
        }
        tokio::spawn(watch_wallet(
            Arc::downgrade(&self.inner),
            wallet.subscribe(),
            address,
            events,
        ));

        self.refresh_all_inner().await.map_err(as_connection_error)?;

        let session = self.inner.session.read().await;
        if session.epoch != epoch {
            return Err(SyncError::Abandoned(
                "connection was reset while connecting".to_string(),
            ));
        }
        self.inner.connection.send_replace(ConnectionState {
            status: ConnectionStatus::Connected,
            address: Some(address),
            chain_id: Some(chain_id),
        });
        info!(%address, chain_id, "Wallet connected");
        Ok(true)
    }

    async fn reset(&self, reason: &str) {
        let mut session = self.inner.session.write().await;
        session.epoch += 1;
        self.clear(&mut session, reason);
    }

    /// Reset only if nothing else has taken over the session since `epoch`.
    async fn reset_epoch(&self, epoch: u64) {
        let mut session = self.inner.session.write().await;
        if session.epoch == epoch {
            session.epoch += 1;
            self.clear(&mut session, "connection attempt failed");
        }
    }

    fn clear(&self, session: &mut Session<W::Signer>, reason: &str) {
        let was_connected = session.signer.take().is_some();
        if let Some(events) = session.events.take() {
            events.cancel();
        }
        self.inner
            .connection
            .send_replace(ConnectionState::default());
        self.inner
            .snapshot
            .send_replace(Arc::new(ChainSnapshot::default()));
        if was_connected {
            info!("Wallet disconnected: {reason}");
        }
    }

    // ─────────────────────────────────────────────────────────
    // Sync
    // ─────────────────────────────────────────────────────────

    /// Re-read the whole contract state and replace the cache in one step.
    /// On failure the previous cache is kept.
    pub async fn refresh_all(&self) -> Result<()> {
        let result = self.refresh_all_inner().await;
        if result.is_err() {
            self.record(&result, String::new);
        }
        result
    }

    async fn refresh_all_inner(&self) -> Result<()> {
        let outcome = self.inner.refresh.run(|| self.load_and_publish()).await?;
        if outcome == RefreshOutcome::Coalesced {
            debug!("refresh satisfied by a concurrent refresh");
        }
        Ok(())
    }

    async fn load_and_publish(&self) -> Result<()> {
        let (signer, epoch) = self.inner.session.read().await.current_signer()?;
        let snapshot = self.load_snapshot(signer.address()).await?;

        let session = self.inner.session.read().await;
        if session.epoch != epoch {
            return Err(SyncError::Abandoned(
                "connection changed during refresh".to_string(),
            ));
        }
        debug!(
            projects = snapshot.projects.len(),
            treasury = %snapshot.treasury.total_balance,
            "publishing snapshot"
        );
        self.inner.snapshot.send_replace(Arc::new(snapshot));
        Ok(())
    }

    async fn load_snapshot(&self, account: Address) -> Result<ChainSnapshot> {
        let wallet = self.wallet()?;
        let contract = &self.inner.contract;

        let (total_balance, approver, count, account_balance) = tokio::try_join!(
            contract.treasury_balance(),
            contract.approver(),
            contract.project_count(),
            wallet.balance(account),
        )?;

        let mut projects = Vec::new();
        for id in 0..count {
            projects.push(contract.load_project(id).await?);
        }

        Ok(ChainSnapshot {
            treasury: ContractTreasury {
                total_balance,
                approver,
            },
            projects,
            account_balance,
        })
    }

    // ─────────────────────────────────────────────────────────
    // Mutations
    // ─────────────────────────────────────────────────────────

    /// Register a new project. `budget` is in wei.
    pub async fn create_project(
        &self,
        name: &str,
        details: &str,
        contractor_name: &str,
        contractor_address: &str,
        budget: U256,
    ) -> Result<TxReceipt> {
        let result = self
            .create_project_inner(name, details, contractor_name, contractor_address, budget)
            .await;
        self.record(&result, || format!("Project \"{name}\" created"));
        result
    }

    async fn create_project_inner(
        &self,
        name: &str,
        details: &str,
        contractor_name: &str,
        contractor_address: &str,
        budget: U256,
    ) -> Result<TxReceipt> {
        if name.trim().is_empty() {
            return Err(SyncError::Validation("project name is empty".to_string()));
        }
        let contractor = parse_wallet_address(contractor_address)?;
        require_positive(budget, "budget")?;
        self.require_connected()?;
        self.require_account_balance(budget)?;

        self.submit_and_refresh(ContractCall::CreateProject {
            name: name.to_string(),
            details: details.to_string(),
            contractor_name: contractor_name.to_string(),
            contractor,
            budget,
        })
        .await
    }

    /// Deposit `amount` wei into the treasury.
    pub async fn deposit_funds(&self, amount: U256) -> Result<TxReceipt> {
        let result = async {
            require_positive(amount, "amount")?;
            self.require_connected()?;
            self.require_account_balance(amount)?;
            self.submit_and_refresh(ContractCall::DepositFunds { amount })
                .await
        }
        .await;
        self.record(&result, || format!("Deposited {} ETH", format_ether(amount)));
        result
    }

    /// Withdraw `amount` wei from the treasury.
    pub async fn withdraw_funds(&self, amount: U256) -> Result<TxReceipt> {
        let result = async {
            require_positive(amount, "amount")?;
            self.require_connected()?;
            let available = self.snapshot().treasury.total_balance;
            if amount > available {
                return Err(SyncError::InsufficientTreasury {
                    available,
                    requested: amount,
                });
            }
            self.submit_and_refresh(ContractCall::WithdrawFunds { amount })
                .await
        }
        .await;
        self.record(&result, || format!("Withdrew {} ETH", format_ether(amount)));
        result
    }

    /// Confirm the work on `project_id`. Only its contractor may do this.
    pub async fn confirm_work(&self, project_id: u64) -> Result<TxReceipt> {
        let result = async {
            let address = self.require_connected()?;
            let project = self.cached_project(project_id)?;
            if project.contractor_address != address {
                return Err(SyncError::Unauthorized(format!(
                    "only contractor {} can confirm work on project {project_id}",
                    project.contractor_address
                )));
            }
            if project.work_confirmed {
                return Err(SyncError::Precondition(format!(
                    "work on project {project_id} is already confirmed"
                )));
            }
            self.submit_and_refresh(ContractCall::ConfirmWork { project_id })
                .await
        }
        .await;
        self.record(&result, || format!("Work confirmed on project {project_id}"));
        result
    }

    /// Approve confirmed work on `project_id`. Only the approver may do this.
    pub async fn approve_work(&self, project_id: u64) -> Result<TxReceipt> {
        let result = async {
            let address = self.require_connected()?;
            let project = self.cached_project(project_id)?;
            if !project.work_confirmed {
                return Err(SyncError::Precondition(format!(
                    "work on project {project_id} has not been confirmed by the contractor"
                )));
            }
            if project.work_approved {
                return Err(SyncError::Precondition(format!(
                    "work on project {project_id} is already approved"
                )));
            }
            let approver = self.snapshot().treasury.approver;
            if approver != address {
                return Err(SyncError::Unauthorized(format!(
                    "only approver {approver} can approve work"
                )));
            }
            self.submit_and_refresh(ContractCall::ApproveWork { project_id })
                .await
        }
        .await;
        self.record(&result, || format!("Work approved on project {project_id}"));
        result
    }

    /// Pay `amount` wei to the contractor of `project_id`.
    pub async fn send_payment(&self, project_id: u64, amount: U256) -> Result<TxReceipt> {
        let result = async {
            require_positive(amount, "amount")?;
            self.require_connected()?;
            let project = self.cached_project(project_id)?;
            let exceeded = || SyncError::BudgetExceeded {
                project_id,
                disbursed: project.contractor_disbursed_balance,
                amount,
                budget: project.budget,
            };
            let total = project
                .contractor_disbursed_balance
                .checked_add(amount)
                .ok_or_else(exceeded)?;
            if total > project.budget {
                return Err(exceeded());
            }
            self.submit_and_refresh(ContractCall::SendPayment { project_id, amount })
                .await
        }
        .await;
        self.record(&result, || {
            format!(
                "Paid {} ETH to the contractor of project {project_id}",
                format_ether(amount)
            )
        });
        result
    }

    async fn submit_and_refresh(&self, call: ContractCall) -> Result<TxReceipt> {
        let (signer, epoch) = self.inner.session.read().await.current_signer()?;
        let request = call.to_request(self.inner.contract.address(), signer.address());

        info!(op = call.label(), from = %signer.address(), "Submitting transaction");
        let tx_hash = signer.send_transaction(request.clone()).await?;
        drop(signer);

        let inclusion = self.inner.contract.wait_for_inclusion(
            tx_hash,
            &request,
            self.inner.config.receipt_poll_interval,
        );
        let receipt = match tokio::time::timeout(self.inner.config.inclusion_timeout, inclusion).await
        {
            Ok(receipt) => receipt?,
            Err(_) => {
                warn!(op = call.label(), %tx_hash, "Gave up waiting for inclusion");
                return Err(SyncError::TransactionTimeout { tx_hash });
            }
        };
        info!(
            op = call.label(),
            %tx_hash,
            block = receipt.block_number,
            "Transaction included"
        );

        if self.inner.session.read().await.epoch != epoch {
            return Err(SyncError::Abandoned(format!(
                "connection changed while {} was in flight (tx {tx_hash})",
                call.label()
            )));
        }

        // The transaction is final from here; a failed reload only leaves the
        // cache stale until the next refresh.
        match self.refresh_all_inner().await {
            Ok(()) => Ok(receipt),
            Err(e @ SyncError::Abandoned(_)) => Err(e),
            Err(e) => {
                warn!(op = call.label(), %tx_hash, "Refresh after inclusion failed: {e}");
                Ok(receipt)
            }
        }
    }

    // ─────────────────────────────────────────────────────────
    // Helpers
    // ─────────────────────────────────────────────────────────

    fn wallet(&self) -> Result<Arc<W>> {
        self.inner.wallet.clone().ok_or_else(|| {
            SyncError::ProviderUnavailable("no wallet provider is installed".to_string())
        })
    }

    fn require_connected(&self) -> Result<Address> {
        let connection = self.inner.connection.borrow();
        match (connection.status, connection.address) {
            (ConnectionStatus::Connected, Some(address)) => Ok(address),
            _ => Err(SyncError::NotConnected),
        }
    }

    fn require_account_balance(&self, required: U256) -> Result<()> {
        let available = self.snapshot().account_balance;
        if available < required {
            return Err(SyncError::InsufficientFunds {
                available,
                required,
            });
        }
        Ok(())
    }

    fn cached_project(&self, project_id: u64) -> Result<Project> {
        self.snapshot()
            .project(project_id)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(format!("project {project_id}")))
    }

    fn record<T>(&self, result: &Result<T>, success: impl FnOnce() -> String) {
        let message = match result {
            Ok(_) => StatusMessage::Success {
                message: success(),
                at: Utc::now(),
            },
            Err(e) => StatusMessage::Error {
                kind: e.kind().to_string(),
                message: e.to_string(),
                at: Utc::now(),
            },
        };
        self.inner.status.send_replace(Some(message));
    }
}

/// React to wallet notifications for the session that `address` opened.
async fn watch_wallet<W, R>(
    inner: Weak<Inner<W, R>>,
    mut events: broadcast::Receiver<WalletEvent>,
    address: Address,
    cancel: CancellationToken,
) where
    W: WalletProvider,
    R: ChainReader + 'static,
{
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        let event = match event {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Missed {skipped} wallet events");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some(inner) = inner.upgrade() else { break };
        let client = ContractSyncClient { inner };

        match event {
            WalletEvent::AccountsChanged(accounts) if accounts.is_empty() => {
                warn!("Wallet revoked account access");
                client.reset("wallet revoked account access").await;
                break;
            }
            WalletEvent::AccountsChanged(accounts) if accounts[0] == address => {}
            WalletEvent::AccountsChanged(accounts) => {
                // The old signer is void; the caller reconnects as the new account.
                warn!(from = %address, to = %accounts[0], "Wallet switched account");
                client.reset("wallet switched account").await;
                break;
            }
            WalletEvent::ChainChanged(chain_id) => {
                warn!(chain_id, "Wallet switched chain");
                client.reset("wallet switched chain").await;
                break;
            }
        }
    }
}

/// Parse a `0x`-prefixed account address. Mixed-case input must carry a
/// valid EIP-55 checksum.
pub fn parse_wallet_address(input: &str) -> Result<Address> {
    let trimmed = input.trim();
    let invalid = || SyncError::Validation(format!("invalid wallet address: {input:?}"));

    let hex = trimmed.strip_prefix("0x").ok_or_else(invalid)?;
    if hex.len() != 40 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(invalid());
    }

    let mixed_case =
        hex.chars().any(|c| c.is_ascii_lowercase()) && hex.chars().any(|c| c.is_ascii_uppercase());
    let address = if mixed_case {
        Address::parse_checksummed(trimmed, None).map_err(|_| {
            SyncError::Validation(format!("wallet address has a bad checksum: {input:?}"))
        })?
    } else {
        Address::from_str(trimmed).map_err(|_| invalid())?
    };

    if address.is_zero() {
        return Err(SyncError::Validation(
            "wallet address must not be the zero address".to_string(),
        ));
    }
    Ok(address)
}

fn require_positive(amount: U256, what: &str) -> Result<()> {
    if amount.is_zero() {
        return Err(SyncError::Validation(format!("{what} must be greater than zero")));
    }
    Ok(())
}

fn as_connection_error(e: SyncError) -> SyncError {
    match e {
        SyncError::Connection(_) | SyncError::ProviderUnavailable(_) | SyncError::Abandoned(_) => e,
        other => SyncError::Connection(other.to_string()),
    }
}
