//! End-to-end tests of [`ContractSyncClient`] against the in-memory chain.

use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, U256};

use crate::client::ContractSyncClient;
use crate::config::ClientConfig;
use crate::contract::GovFundContract;
use crate::errors::SyncError;
use crate::mock::{MockChain, MockWallet};
use crate::types::{AccountRoles, ConnectionStatus, StatusMessage};

type TestClient = ContractSyncClient<MockWallet, MockChain>;

const GOVERNMENT: Address = Address::repeat_byte(0x11);
const CONTRACTOR: Address = Address::repeat_byte(0x22);
const OUTSIDER: Address = Address::repeat_byte(0x33);
const CONTRACT: Address = Address::repeat_byte(0xc0);

fn wei(amount: u64) -> U256 {
    U256::from(amount)
}

fn test_config() -> ClientConfig {
    ClientConfig {
        inclusion_timeout: Duration::from_millis(300),
        receipt_poll_interval: Duration::from_millis(5),
    }
}

fn client_for(chain: &Arc<MockChain>, account: Address) -> (Arc<MockWallet>, TestClient) {
    let wallet = MockWallet::new(Arc::clone(chain), account);
    let contract = GovFundContract::new(Arc::clone(chain), chain.contract_address());
    let client = ContractSyncClient::new(Some(Arc::clone(&wallet)), contract, test_config());
    (wallet, client)
}

struct Setup {
    chain: Arc<MockChain>,
    government: TestClient,
    government_wallet: Arc<MockWallet>,
    contractor: TestClient,
}

async fn setup() -> Setup {
    let chain = MockChain::new(CONTRACT, GOVERNMENT);
    chain.fund_account(GOVERNMENT, wei(10_000_000));
    chain.fund_account(OUTSIDER, wei(5_000_000));

    let (government_wallet, government) = client_for(&chain, GOVERNMENT);
    let (_, contractor) = client_for(&chain, CONTRACTOR);
    government.connect().await.unwrap();
    contractor.connect().await.unwrap();

    Setup {
        chain,
        government,
        government_wallet,
        contractor,
    }
}

/// Government creates "Road A" and funds the treasury.
async fn setup_with_project() -> Setup {
    let s = setup().await;
    s.government.deposit_funds(wei(2_000_000)).await.unwrap();
    s.government
        .create_project(
            "Road A",
            "Repave Main St",
            "Acme Co",
            &CONTRACTOR.to_string(),
            wei(1_000_000),
        )
        .await
        .unwrap();
    s.contractor.refresh_all().await.unwrap();
    s
}

async fn wait_for_status(client: &TestClient, status: ConnectionStatus) {
    let mut rx = client.subscribe_connection();
    tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|c| c.status == status))
        .await
        .expect("connection status did not change in time")
        .unwrap();
}

async fn wait_for_sent(chain: &MockChain, count: usize) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while chain.sent_transactions() < count {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("transaction was not sent in time");
}

// ─────────────────────────────────────────────────────────
// Connection
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn connect_publishes_address_and_snapshot() {
    let s = setup().await;

    let connection = s.government.connection();
    assert_eq!(connection.status, ConnectionStatus::Connected);
    assert_eq!(connection.address, Some(GOVERNMENT));
    assert!(connection.chain_id.is_some());

    let snapshot = s.government.snapshot();
    assert_eq!(snapshot.treasury.approver, GOVERNMENT);
    assert_eq!(snapshot.account_balance, wei(10_000_000));
    assert!(snapshot.projects.is_empty());

    let roles = AccountRoles::derive(GOVERNMENT, &snapshot);
    assert!(roles.is_approver);
    assert!(matches!(
        s.government.last_status(),
        Some(StatusMessage::Success { .. })
    ));
}

#[tokio::test]
async fn missing_provider_fails_every_connection_attempt() {
    let chain = MockChain::new(CONTRACT, GOVERNMENT);
    let contract = GovFundContract::new(Arc::clone(&chain), CONTRACT);
    let client: TestClient = ContractSyncClient::new(None, contract, test_config());

    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, SyncError::ProviderUnavailable(_)));
    assert_eq!(client.connection().status, ConnectionStatus::Disconnected);
    assert_eq!(chain.reads(), 0);
}

#[tokio::test]
async fn rejected_access_request_leaves_client_disconnected() {
    let chain = MockChain::new(CONTRACT, GOVERNMENT);
    let (wallet, client) = client_for(&chain, GOVERNMENT);
    wallet.reject_access_requests(true);

    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, SyncError::Connection(_)));
    assert_eq!(client.connection().status, ConnectionStatus::Disconnected);

    // The user can simply try again.
    wallet.reject_access_requests(false);
    client.connect().await.unwrap();
    assert!(client.connection().is_connected());
}

#[tokio::test]
async fn restore_session_needs_prior_authorization() {
    let chain = MockChain::new(CONTRACT, GOVERNMENT);
    let (wallet, client) = client_for(&chain, GOVERNMENT);

    assert!(!client.restore_session().await.unwrap());
    assert_eq!(client.connection().status, ConnectionStatus::Disconnected);

    wallet.pre_authorize();
    assert!(client.restore_session().await.unwrap());
    assert_eq!(client.connection().address, Some(GOVERNMENT));
}

#[tokio::test]
async fn disconnect_is_idempotent() {
    let s = setup_with_project().await;

    s.government.disconnect().await;
    s.government.disconnect().await;

    assert_eq!(s.government.connection().status, ConnectionStatus::Disconnected);
    assert!(s.government.projects().is_empty());
    assert!(matches!(
        s.government.deposit_funds(wei(1)).await.unwrap_err(),
        SyncError::NotConnected
    ));
}

#[tokio::test]
async fn chain_switch_resets_the_connection() {
    let s = setup_with_project().await;

    s.government_wallet.switch_chain(1);
    wait_for_status(&s.government, ConnectionStatus::Disconnected).await;

    assert!(s.government.snapshot().projects.is_empty());
    assert_eq!(s.government.connection().address, None);
}

#[tokio::test]
async fn account_switch_resets_and_allows_reconnecting_as_new_account() {
    let s = setup().await;

    s.government_wallet.switch_account(OUTSIDER);
    wait_for_status(&s.government, ConnectionStatus::Disconnected).await;

    s.government.connect().await.unwrap();
    assert_eq!(s.government.connection().address, Some(OUTSIDER));
    assert_eq!(s.government.snapshot().account_balance, wei(5_000_000));
}

#[tokio::test]
async fn unreadable_contract_fails_connect_as_a_connection_error() {
    let chain = MockChain::new(CONTRACT, GOVERNMENT);
    let (_, client) = client_for(&chain, GOVERNMENT);
    chain.fail_next_reads(usize::MAX);

    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, SyncError::Connection(_)), "got {err:?}");
    assert_eq!(client.connection().status, ConnectionStatus::Disconnected);
    assert!(client.snapshot().projects.is_empty());

    chain.fail_next_reads(0);
    client.connect().await.unwrap();
    assert_eq!(client.connection().status, ConnectionStatus::Connected);
}

#[tokio::test]
async fn revoked_access_resets_the_connection() {
    let s = setup().await;

    s.government_wallet.revoke_access();
    wait_for_status(&s.government, ConnectionStatus::Disconnected).await;
}

// ─────────────────────────────────────────────────────────
// Project lifecycle
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn road_a_lifecycle() {
    let s = setup_with_project().await;

    let projects = s.government.projects();
    assert_eq!(projects.len(), 1);
    let road = &projects[0];
    assert_eq!(road.id, 0);
    assert_eq!(road.name, "Road A");
    assert_eq!(road.contractor_address, CONTRACTOR);
    assert_eq!(road.budget, wei(1_000_000));
    assert!(road.is_active);
    assert!(!road.work_confirmed);

    s.contractor.confirm_work(0).await.unwrap();
    assert!(s.contractor.projects()[0].work_confirmed);

    s.government.refresh_all().await.unwrap();
    s.government.approve_work(0).await.unwrap();
    assert!(s.government.projects()[0].work_approved);

    s.government.send_payment(0, wei(400_000)).await.unwrap();
    assert_eq!(s.government.get_contractor_balance(0).unwrap(), wei(400_000));
    assert_eq!(s.government.snapshot().treasury.total_balance, wei(1_600_000));
    assert_eq!(s.chain.balance_of(CONTRACTOR), wei(400_000));

    let err = s.government.send_payment(0, wei(700_000)).await.unwrap_err();
    assert!(matches!(err, SyncError::BudgetExceeded { project_id: 0, .. }));
    assert_eq!(s.government.get_contractor_balance(0).unwrap(), wei(400_000));
}

#[tokio::test]
async fn paying_out_the_full_budget_completes_the_project() {
    let s = setup_with_project().await;
    s.contractor.confirm_work(0).await.unwrap();
    s.government.refresh_all().await.unwrap();
    s.government.approve_work(0).await.unwrap();

    s.government.send_payment(0, wei(600_000)).await.unwrap();
    s.government.send_payment(0, wei(400_000)).await.unwrap();

    let project = &s.government.projects()[0];
    assert_eq!(project.contractor_disbursed_balance, project.budget);
    assert!(!project.is_active);
    assert_eq!(project.remaining_budget(), U256::ZERO);
}

#[tokio::test]
async fn approve_before_confirm_is_a_precondition_error() {
    let s = setup_with_project().await;
    let sent = s.chain.sent_transactions();

    let err = s.government.approve_work(0).await.unwrap_err();
    assert!(matches!(err, SyncError::Precondition(_)));
    assert_eq!(s.chain.sent_transactions(), sent);
    assert!(matches!(
        s.government.last_status(),
        Some(StatusMessage::Error { .. })
    ));
}

#[tokio::test]
async fn only_the_contractor_can_confirm() {
    let s = setup_with_project().await;
    let sent = s.chain.sent_transactions();

    let err = s.government.confirm_work(0).await.unwrap_err();
    assert!(matches!(err, SyncError::Unauthorized(_)));
    assert_eq!(s.chain.sent_transactions(), sent);
}

#[tokio::test]
async fn only_the_approver_can_approve() {
    let s = setup_with_project().await;
    s.contractor.confirm_work(0).await.unwrap();
    let (_, outsider) = client_for(&s.chain, OUTSIDER);
    outsider.connect().await.unwrap();
    assert!(outsider.projects()[0].work_confirmed);
    let sent = s.chain.sent_transactions();

    let err = outsider.approve_work(0).await.unwrap_err();
    assert!(matches!(err, SyncError::Unauthorized(_)), "got {err:?}");
    assert_eq!(s.chain.sent_transactions(), sent);
    assert!(!outsider.projects()[0].work_approved);
}

#[tokio::test]
async fn invalid_input_never_touches_the_network() {
    let s = setup().await;
    let reads = s.chain.reads();
    let sent = s.chain.sent_transactions();

    let err = s
        .government
        .create_project("Road A", "Repave", "Acme Co", "0xCONTRACTOR", wei(1_000_000))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Validation(_)));

    let err = s
        .government
        .create_project("Road A", "Repave", "Acme Co", &CONTRACTOR.to_string(), U256::ZERO)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Validation(_)));

    assert!(matches!(
        s.government.send_payment(0, U256::ZERO).await.unwrap_err(),
        SyncError::Validation(_)
    ));

    assert_eq!(s.chain.reads(), reads);
    assert_eq!(s.chain.sent_transactions(), sent);
}

#[tokio::test]
async fn local_balance_checks() {
    let s = setup().await;
    let sent = s.chain.sent_transactions();

    let err = s
        .government
        .create_project("Bridge", "", "Acme Co", &CONTRACTOR.to_string(), wei(20_000_000))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::InsufficientFunds { .. }));

    let err = s.government.withdraw_funds(wei(1)).await.unwrap_err();
    assert!(matches!(err, SyncError::InsufficientTreasury { .. }));

    assert_eq!(s.chain.sent_transactions(), sent);
}

#[tokio::test]
async fn unknown_project_is_not_found() {
    let s = setup().await;

    assert!(matches!(
        s.government.get_contractor_balance(7).unwrap_err(),
        SyncError::NotFound(_)
    ));
    assert!(matches!(
        s.government.send_payment(7, wei(1)).await.unwrap_err(),
        SyncError::NotFound(_)
    ));
}

#[tokio::test]
async fn deposit_and_withdraw_move_treasury_funds() {
    let s = setup().await;

    s.government.deposit_funds(wei(3_000)).await.unwrap();
    assert_eq!(s.government.snapshot().treasury.total_balance, wei(3_000));
    assert_eq!(s.government.snapshot().account_balance, wei(9_997_000));

    s.government.withdraw_funds(wei(1_000)).await.unwrap();
    assert_eq!(s.government.snapshot().treasury.total_balance, wei(2_000));
    assert_eq!(s.chain.treasury(), wei(2_000));
}

// ─────────────────────────────────────────────────────────
// Transaction failures
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn declined_signature_is_reported_as_rejected() {
    let s = setup().await;
    s.government_wallet.reject_signing(true);

    let err = s.government.deposit_funds(wei(1_000)).await.unwrap_err();
    assert!(matches!(err, SyncError::TransactionRejected(_)));
    assert!(err.is_retryable());
    assert_eq!(s.chain.treasury(), U256::ZERO);
}

#[tokio::test]
async fn chain_revert_is_surfaced_verbatim() {
    let s = setup_with_project().await;
    let (_, outsider) = client_for(&s.chain, OUTSIDER);
    outsider.connect().await.unwrap();

    // The outsider sees a healthy treasury but is not the government.
    let err = outsider.withdraw_funds(wei(1_000)).await.unwrap_err();
    match err {
        SyncError::TransactionReverted { reason } => {
            assert_eq!(reason, "Only government can call this function");
        }
        other => panic!("expected a revert, got {other:?}"),
    }
    assert_eq!(s.chain.treasury(), wei(2_000_000));
}

#[tokio::test]
async fn inclusion_timeout_is_ambiguous_until_refreshed() {
    let s = setup().await;
    s.chain.hold_inclusion(true);

    let err = s.government.deposit_funds(wei(5_000)).await.unwrap_err();
    assert!(matches!(err, SyncError::TransactionTimeout { .. }));
    assert_eq!(s.government.snapshot().treasury.total_balance, U256::ZERO);

    // The transaction lands later; a refresh picks it up.
    s.chain.include_pending();
    s.government.refresh_all().await.unwrap();
    assert_eq!(s.government.snapshot().treasury.total_balance, wei(5_000));
}

#[tokio::test]
async fn receipt_lookup_failure_does_not_resend() {
    let s = setup().await;
    let sent = s.chain.sent_transactions();

    // The first read after broadcast is the receipt lookup.
    s.chain.fail_next_reads(1);
    s.government.deposit_funds(wei(5_000)).await.unwrap();

    assert_eq!(s.chain.sent_transactions(), sent + 1);
    assert_eq!(s.chain.treasury(), wei(5_000));
    assert_eq!(s.government.snapshot().treasury.total_balance, wei(5_000));
}

#[tokio::test]
async fn unreadable_receipts_end_in_a_timeout() {
    let s = setup().await;
    let sent = s.chain.sent_transactions();

    s.chain.fail_next_reads(usize::MAX);
    let err = s.government.deposit_funds(wei(5_000)).await.unwrap_err();
    assert!(matches!(err, SyncError::TransactionTimeout { .. }), "got {err:?}");
    assert!(!err.is_retryable());
    assert_eq!(s.chain.sent_transactions(), sent + 1);

    s.chain.fail_next_reads(0);
    s.government.refresh_all().await.unwrap();
    assert_eq!(s.government.snapshot().treasury.total_balance, wei(5_000));
}

#[tokio::test]
async fn included_transaction_succeeds_when_the_reload_fails() {
    let s = setup().await;
    let sent = s.chain.sent_transactions();

    s.chain.fail_calls(true);
    s.government.deposit_funds(wei(42)).await.unwrap();
    assert_eq!(s.chain.sent_transactions(), sent + 1);
    assert_eq!(s.chain.treasury(), wei(42));
    assert_eq!(s.government.snapshot().treasury.total_balance, U256::ZERO);

    s.chain.fail_calls(false);
    s.government.refresh_all().await.unwrap();
    assert_eq!(s.government.snapshot().treasury.total_balance, wei(42));
}

#[tokio::test]
async fn revert_after_inclusion_carries_the_contract_reason() {
    let s = setup_with_project().await;
    s.chain.hold_inclusion(true);
    let sent = s.chain.sent_transactions();

    let government = s.government.clone();
    let withdraw = tokio::spawn(async move { government.withdraw_funds(wei(1_500_000)).await });
    wait_for_sent(&s.chain, sent + 1).await;

    // Someone else drains the treasury before the withdrawal lands.
    s.chain.external_withdraw(wei(1_000_000));
    s.chain.include_pending();

    let err = withdraw.await.unwrap().unwrap_err();
    match err {
        SyncError::TransactionReverted { reason } => {
            assert_eq!(reason, "Insufficient contract balance");
        }
        other => panic!("expected a revert, got {other:?}"),
    }
    assert_eq!(s.chain.treasury(), wei(1_000_000));
}

#[tokio::test]
async fn connection_change_abandons_an_in_flight_mutation() {
    let s = setup().await;
    s.chain.hold_inclusion(true);
    let sent = s.chain.sent_transactions();

    let government = s.government.clone();
    let deposit = tokio::spawn(async move { government.deposit_funds(wei(7_000)).await });
    wait_for_sent(&s.chain, sent + 1).await;

    s.government_wallet.switch_chain(1);
    wait_for_status(&s.government, ConnectionStatus::Disconnected).await;
    s.chain.include_pending();

    let err = deposit.await.unwrap().unwrap_err();
    assert!(matches!(err, SyncError::Abandoned(_)), "got {err:?}");
    assert_eq!(s.chain.treasury(), wei(7_000));
    assert_eq!(s.government.snapshot().treasury.total_balance, U256::ZERO);
    assert_eq!(s.government.connection().status, ConnectionStatus::Disconnected);
}

// ─────────────────────────────────────────────────────────
// Refresh
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn failed_refresh_keeps_the_previous_snapshot() {
    let s = setup_with_project().await;
    let before = s.government.snapshot();

    s.chain.fail_next_reads(usize::MAX);
    let err = s.government.refresh_all().await.unwrap_err();
    assert!(matches!(err, SyncError::ChainRead(_)));
    assert!(Arc::ptr_eq(&before, &s.government.snapshot()));

    s.chain.fail_next_reads(0);
    s.government.refresh_all().await.unwrap();
}

#[tokio::test]
async fn concurrent_refreshes_end_on_the_latest_state() {
    let s = setup().await;
    s.chain.set_read_delay(Duration::from_millis(5));

    let mut tasks = Vec::new();
    for step in 1..=5u64 {
        s.chain.external_deposit(wei(step));
        let client = s.government.clone();
        tasks.push(tokio::spawn(async move { client.refresh_all().await }));
        tokio::time::sleep(Duration::from_millis(3)).await;
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(s.government.snapshot().treasury.total_balance, s.chain.treasury());
    assert_eq!(s.chain.treasury(), wei(15));
}

#[tokio::test]
async fn implausible_project_count_keeps_the_previous_snapshot() {
    let s = setup_with_project().await;
    let before = s.government.snapshot();

    s.chain.report_project_count(Some(U256::MAX));
    let err = s.government.refresh_all().await.unwrap_err();
    assert!(matches!(err, SyncError::ChainRead(_)), "got {err:?}");
    assert!(Arc::ptr_eq(&before, &s.government.snapshot()));

    s.chain.report_project_count(None);
    s.government.refresh_all().await.unwrap();
    assert_eq!(s.government.projects().len(), 1);
}

#[tokio::test]
async fn corrupted_disbursement_is_a_data_integrity_error() {
    let s = setup_with_project().await;
    s.chain.corrupt_disbursed(0, wei(1_000_001));

    let err = s.government.refresh_all().await.unwrap_err();
    assert!(matches!(err, SyncError::DataIntegrity(_)));
    assert_eq!(s.government.get_contractor_balance(0).unwrap(), U256::ZERO);
}

#[tokio::test]
async fn snapshot_subscribers_see_mutations() {
    let s = setup().await;
    let mut snapshots = s.government.subscribe_snapshots();

    s.government.deposit_funds(wei(42)).await.unwrap();

    assert!(snapshots.has_changed().unwrap());
    assert_eq!(snapshots.borrow_and_update().treasury.total_balance, wei(42));
}
