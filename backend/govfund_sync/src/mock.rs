//! In-memory chain and wallet for tests.
//!
//! [`MockChain`] executes the GovFund contract rules against plain Rust state
//! and answers ABI-encoded calls the way a node would. [`MockWallet`] is one
//! user's wallet attached to that chain; several wallets may share a chain.
//!
//! Knobs exist for the failure modes the client has to survive: failing
//! reads, slow reads, signatures the user declines, transactions that
//! never get included and transactions that revert once included.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use alloy_sol_types::{SolCall, SolInterface};
use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::bindings::IGovFund::{self, IGovFundCalls};
use crate::contract::{ChainReader, TxReceipt};
use crate::errors::{Result, SyncError};
use crate::rpc::TxRequest;
use crate::wallet::{TransactionSigner, WalletEvent, WalletProvider};

pub const MOCK_CHAIN_ID: u64 = 31337;
const GENESIS_TIMESTAMP: u64 = 1_704_067_200;

#[derive(Debug, Clone)]
struct MockProject {
    name: String,
    details: String,
    contractor_name: String,
    contractor: Address,
    starting_date: u64,
    budget: U256,
    is_active: bool,
    work_confirmed: bool,
    work_approved: bool,
    disbursed: U256,
}

#[derive(Debug, Default)]
struct ChainState {
    government: Address,
    treasury: U256,
    projects: Vec<MockProject>,
    balances: HashMap<Address, U256>,
    receipts: HashMap<B256, TxReceipt>,
    pending: Vec<(B256, Address, IGovFundCalls, U256)>,
    /// Revert reasons of failed transactions, by including block.
    revert_reasons: HashMap<u64, String>,
    block: u64,
    /// Stored disbursed balances are replaced by this for one project.
    corrupt_disbursed: Option<(u64, U256)>,
    /// Answer to `getProjectCount` instead of the real count.
    reported_count: Option<U256>,
}

/// The GovFund contract plus the little of a node the client needs.
pub struct MockChain {
    contract: Address,
    state: Mutex<ChainState>,
    reads: AtomicUsize,
    sent: AtomicUsize,
    failing_reads: AtomicUsize,
    failing_calls: AtomicBool,
    read_delay_ms: AtomicU64,
    hold_inclusion: AtomicBool,
    nonce: AtomicU64,
}

impl MockChain {
    /// A chain with the contract deployed by `government`.
    pub fn new(contract: Address, government: Address) -> Arc<Self> {
        Arc::new(Self {
            contract,
            state: Mutex::new(ChainState {
                government,
                ..ChainState::default()
            }),
            reads: AtomicUsize::new(0),
            sent: AtomicUsize::new(0),
            failing_reads: AtomicUsize::new(0),
            failing_calls: AtomicBool::new(false),
            read_delay_ms: AtomicU64::new(0),
            hold_inclusion: AtomicBool::new(false),
            nonce: AtomicU64::new(0),
        })
    }

    pub fn contract_address(&self) -> Address {
        self.contract
    }

    fn state(&self) -> MutexGuard<'_, ChainState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn fund_account(&self, account: Address, amount: U256) {
        *self.state().balances.entry(account).or_default() += amount;
    }

    pub fn balance_of(&self, account: Address) -> U256 {
        self.state().balances.get(&account).copied().unwrap_or_default()
    }

    pub fn treasury(&self) -> U256 {
        self.state().treasury
    }

    /// Move funds into the treasury outside of any client, as another user
    /// of the contract would.
    pub fn external_deposit(&self, amount: U256) {
        self.state().treasury += amount;
    }

    /// Drain the treasury outside of any client.
    pub fn external_withdraw(&self, amount: U256) {
        let mut state = self.state();
        state.treasury = state.treasury.saturating_sub(amount);
    }

    pub fn project_count(&self) -> usize {
        self.state().projects.len()
    }

    /// Number of reads served so far (calls, receipts, balances).
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of transactions submitted so far.
    pub fn sent_transactions(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }

    /// Fail the next `n` reads with a transport-style error.
    pub fn fail_next_reads(&self, n: usize) {
        self.failing_reads.store(n, Ordering::SeqCst);
    }

    /// While set, every contract call fails. Receipts and balances are
    /// still served.
    pub fn fail_calls(&self, fail: bool) {
        self.failing_calls.store(fail, Ordering::SeqCst);
    }

    pub fn set_read_delay(&self, delay: Duration) {
        self.read_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// While set, submitted transactions stay pending.
    pub fn hold_inclusion(&self, hold: bool) {
        self.hold_inclusion.store(hold, Ordering::SeqCst);
    }

    /// Include every pending transaction, in submission order.
    pub fn include_pending(&self) {
        let mut state = self.state();
        let pending = std::mem::take(&mut state.pending);
        for (tx_hash, from, call, value) in pending {
            let outcome = execute(&mut state, from, call, value);
            let block = seal(&mut state, tx_hash, outcome.is_ok());
            if let Err(reason) = outcome {
                state.revert_reasons.insert(block, reason);
            }
        }
    }

    /// Make the contract report a disbursed balance that breaks its own
    /// budget invariant.
    pub fn corrupt_disbursed(&self, project_id: u64, disbursed: U256) {
        self.state().corrupt_disbursed = Some((project_id, disbursed));
    }

    /// Make `getProjectCount` answer `count`, or the real count for `None`.
    pub fn report_project_count(&self, count: Option<U256>) {
        self.state().reported_count = count;
    }

    async fn begin_read(&self) -> Result<()> {
        let delay = self.read_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.reads.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(SyncError::ChainRead("connection reset by peer".to_string()));
        }
        Ok(())
    }

    fn submit(&self, from: Address, request: &TxRequest) -> Result<B256> {
        if request.to != self.contract {
            return Err(SyncError::TransactionReverted {
                reason: "unknown contract".to_string(),
            });
        }
        let call = IGovFundCalls::abi_decode(&request.input, true).map_err(|e| {
            SyncError::TransactionReverted {
                reason: format!("undecodable call data: {e}"),
            }
        })?;

        self.sent.fetch_add(1, Ordering::SeqCst);
        let nonce = self.nonce.fetch_add(1, Ordering::SeqCst);
        let tx_hash = keccak256([from.as_slice(), &nonce.to_be_bytes()[..]].concat());

        let mut state = self.state();
        if self.hold_inclusion.load(Ordering::SeqCst) {
            state.pending.push((tx_hash, from, call, request.value));
            return Ok(tx_hash);
        }

        // Like gas estimation, a failing call is refused before broadcast.
        execute(&mut state, from, call, request.value)
            .map_err(|reason| SyncError::TransactionReverted { reason })?;
        seal(&mut state, tx_hash, true);
        Ok(tx_hash)
    }

    fn answer(&self, call: IGovFundCalls) -> std::result::Result<Vec<u8>, String> {
        let state = self.state();
        let project = |id: U256| {
            project_index(&state, id).map(|idx| (idx as u64, &state.projects[idx]))
        };

        let output = match call {
            IGovFundCalls::getProjectCount(_) => {
                let count = state
                    .reported_count
                    .unwrap_or_else(|| U256::from(state.projects.len()));
                IGovFund::getProjectCountCall::abi_encode_returns(&(count,))
            }
            IGovFundCalls::getProjectDetails(c) => {
                let (_, p) = project(c.projectId)?;
                IGovFund::getProjectDetailsCall::abi_encode_returns(&(
                    p.name.clone(),
                    p.details.clone(),
                    p.contractor_name.clone(),
                    p.contractor,
                    U256::from(p.starting_date),
                    p.budget,
                    p.is_active,
                ))
            }
            IGovFundCalls::contractorWorkDone(c) => {
                let (_, p) = project(c.projectId)?;
                let confirmed = p.work_confirmed && p.contractor == c.contractor;
                IGovFund::contractorWorkDoneCall::abi_encode_returns(&(confirmed,))
            }
            IGovFundCalls::governmentApproved(c) => {
                let (_, p) = project(c.projectId)?;
                let approved = p.work_approved && p.contractor == c.contractor;
                IGovFund::governmentApprovedCall::abi_encode_returns(&(approved,))
            }
            IGovFundCalls::getContractorBalance(c) => {
                let (id, p) = project(c.projectId)?;
                let disbursed = match state.corrupt_disbursed {
                    Some((corrupt_id, value)) if corrupt_id == id => value,
                    _ => p.disbursed,
                };
                IGovFund::getContractorBalanceCall::abi_encode_returns(&(disbursed,))
            }
            IGovFundCalls::getContractBalance(_) => {
                IGovFund::getContractBalanceCall::abi_encode_returns(&(state.treasury,))
            }
            IGovFundCalls::government(_) => {
                IGovFund::governmentCall::abi_encode_returns(&(state.government,))
            }
            _ => return Err("state-changing function called through eth_call".to_string()),
        };
        Ok(output)
    }
}

/// Apply `call` to the contract state, or return the revert reason.
fn execute(
    state: &mut ChainState,
    from: Address,
    call: IGovFundCalls,
    value: U256,
) -> std::result::Result<(), String> {
    match call {
        IGovFundCalls::createProject(c) => {
            only_government(state, from)?;
            if c.projectBudget.is_zero() {
                return Err("Budget must be greater than zero".to_string());
            }
            let starting_date = GENESIS_TIMESTAMP + state.block * 12;
            state.projects.push(MockProject {
                name: c.projectName,
                details: c.projectDetails,
                contractor_name: c.contractorName,
                contractor: c.contractor,
                starting_date,
                budget: c.projectBudget,
                is_active: true,
                work_confirmed: false,
                work_approved: false,
                disbursed: U256::ZERO,
            });
        }
        IGovFundCalls::depositFunds(_) => {
            let balance = state.balances.entry(from).or_default();
            if *balance < value {
                return Err("insufficient funds for transfer".to_string());
            }
            *balance -= value;
            state.treasury += value;
        }
        IGovFundCalls::withdrawFunds(c) => {
            only_government(state, from)?;
            if c.amount > state.treasury {
                return Err("Insufficient contract balance".to_string());
            }
            state.treasury -= c.amount;
            *state.balances.entry(from).or_default() += c.amount;
        }
        IGovFundCalls::contractorWorkDoneConfirmation(c) => {
            let idx = project_index(state, c.projectId)?;
            let project = &mut state.projects[idx];
            if project.contractor != from {
                return Err("Only the project contractor can confirm".to_string());
            }
            project.work_confirmed = true;
        }
        IGovFundCalls::governmentApproveWork(c) => {
            only_government(state, from)?;
            let idx = project_index(state, c.projectId)?;
            let project = &mut state.projects[idx];
            if !project.work_confirmed {
                return Err("Contractor has not confirmed work".to_string());
            }
            project.work_approved = true;
        }
        IGovFundCalls::sendFundsToContractor(c) => {
            only_government(state, from)?;
            let idx = project_index(state, c.projectId)?;
            if c.amount > state.treasury {
                return Err("Insufficient contract balance".to_string());
            }
            let project = &mut state.projects[idx];
            let disbursed = project.disbursed + c.amount;
            if disbursed > project.budget {
                return Err("Payment exceeds project budget".to_string());
            }
            project.disbursed = disbursed;
            if project.work_approved && disbursed == project.budget {
                project.is_active = false;
            }
            let contractor = project.contractor;
            state.treasury -= c.amount;
            *state.balances.entry(contractor).or_default() += c.amount;
        }
        _ => return Err("view function sent as a transaction".to_string()),
    }
    Ok(())
}

fn only_government(state: &ChainState, from: Address) -> std::result::Result<(), String> {
    if from == state.government {
        Ok(())
    } else {
        Err("Only government can call this function".to_string())
    }
}

fn project_index(state: &ChainState, id: U256) -> std::result::Result<usize, String> {
    u64::try_from(id)
        .ok()
        .map(|id| id as usize)
        .filter(|id| *id < state.projects.len())
        .ok_or_else(|| "Invalid project ID".to_string())
}

/// Include `tx_hash` in a new block and return the block number.
fn seal(state: &mut ChainState, tx_hash: B256, success: bool) -> u64 {
    state.block += 1;
    let receipt = TxReceipt {
        tx_hash,
        block_number: state.block,
        success,
    };
    state.receipts.insert(tx_hash, receipt);
    state.block
}

#[async_trait]
impl ChainReader for MockChain {
    async fn call(&self, request: &TxRequest) -> Result<Bytes> {
        self.begin_read().await?;
        if self.failing_calls.load(Ordering::SeqCst) {
            return Err(SyncError::ChainRead("eth_call timed out".to_string()));
        }
        if request.to != self.contract {
            return Ok(Bytes::new());
        }
        let call = IGovFundCalls::abi_decode(&request.input, true)
            .map_err(|e| SyncError::ChainRead(format!("undecodable call: {e}")))?;
        self.answer(call)
            .map(Bytes::from)
            .map_err(|reason| SyncError::ChainRead(format!("execution reverted: {reason}")))
    }

    async fn transaction_receipt(&self, tx_hash: B256) -> Result<Option<TxReceipt>> {
        self.begin_read().await?;
        Ok(self.state().receipts.get(&tx_hash).copied())
    }

    async fn revert_reason(&self, request: &TxRequest, included_in: u64) -> Option<String> {
        if request.to != self.contract {
            return None;
        }
        self.state().revert_reasons.get(&included_in).cloned()
    }
}

// ─────────────────────────────────────────────────────────
// Wallet
// ─────────────────────────────────────────────────────────

/// One user's wallet on a [`MockChain`].
pub struct MockWallet {
    chain: Arc<MockChain>,
    accounts: Mutex<Vec<Address>>,
    authorized: AtomicBool,
    reject_access: AtomicBool,
    reject_signing: Arc<AtomicBool>,
    chain_id: AtomicU64,
    events: broadcast::Sender<WalletEvent>,
}

impl MockWallet {
    pub fn new(chain: Arc<MockChain>, account: Address) -> Arc<Self> {
        let (events, _) = broadcast::channel(16);
        Arc::new(Self {
            chain,
            accounts: Mutex::new(vec![account]),
            authorized: AtomicBool::new(false),
            reject_access: AtomicBool::new(false),
            reject_signing: Arc::new(AtomicBool::new(false)),
            chain_id: AtomicU64::new(MOCK_CHAIN_ID),
            events,
        })
    }

    fn accounts_guard(&self) -> MutexGuard<'_, Vec<Address>> {
        self.accounts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Treat the account as authorized already, as after an earlier visit.
    pub fn pre_authorize(&self) {
        self.authorized.store(true, Ordering::SeqCst);
    }

    pub fn reject_access_requests(&self, reject: bool) {
        self.reject_access.store(reject, Ordering::SeqCst);
    }

    pub fn reject_signing(&self, reject: bool) {
        self.reject_signing.store(reject, Ordering::SeqCst);
    }

    pub fn switch_account(&self, account: Address) {
        *self.accounts_guard() = vec![account];
        let _ = self.events.send(WalletEvent::AccountsChanged(vec![account]));
    }

    pub fn revoke_access(&self) {
        self.authorized.store(false, Ordering::SeqCst);
        self.accounts_guard().clear();
        let _ = self.events.send(WalletEvent::AccountsChanged(Vec::new()));
    }

    pub fn switch_chain(&self, chain_id: u64) {
        self.chain_id.store(chain_id, Ordering::SeqCst);
        let _ = self.events.send(WalletEvent::ChainChanged(chain_id));
    }
}

#[async_trait]
impl WalletProvider for MockWallet {
    type Signer = MockSigner;

    async fn request_accounts(&self) -> Result<Vec<Address>> {
        if self.reject_access.load(Ordering::SeqCst) {
            return Err(SyncError::Connection(
                "User rejected the request".to_string(),
            ));
        }
        self.authorized.store(true, Ordering::SeqCst);
        Ok(self.accounts_guard().clone())
    }

    async fn accounts(&self) -> Result<Vec<Address>> {
        if !self.authorized.load(Ordering::SeqCst) {
            return Ok(Vec::new());
        }
        Ok(self.accounts_guard().clone())
    }

    async fn chain_id(&self) -> Result<u64> {
        Ok(self.chain_id.load(Ordering::SeqCst))
    }

    async fn signer(&self, address: Address) -> Result<MockSigner> {
        if !self.accounts_guard().contains(&address) {
            return Err(SyncError::Connection(format!(
                "account {address} is not authorized"
            )));
        }
        Ok(MockSigner {
            chain: Arc::clone(&self.chain),
            address,
            reject: Arc::clone(&self.reject_signing),
        })
    }

    async fn balance(&self, address: Address) -> Result<U256> {
        self.chain.begin_read().await?;
        Ok(self.chain.balance_of(address))
    }

    fn subscribe(&self) -> broadcast::Receiver<WalletEvent> {
        self.events.subscribe()
    }
}

pub struct MockSigner {
    chain: Arc<MockChain>,
    address: Address,
    reject: Arc<AtomicBool>,
}

#[async_trait]
impl TransactionSigner for MockSigner {
    fn address(&self) -> Address {
        self.address
    }

    async fn send_transaction(&self, request: TxRequest) -> Result<B256> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(SyncError::TransactionRejected(
                "User denied transaction signature".to_string(),
            ));
        }
        self.chain.submit(self.address, &request)
    }
}
