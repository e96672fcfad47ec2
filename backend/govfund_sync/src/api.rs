//! Axum REST API handlers.
//!
//! Amounts come in as decimal ether strings and go out as both wei (decimal
//! string) and ether. No amount is ever a JSON number.

use std::sync::Arc;

use alloy_primitives::{Address, B256, U256};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::amount::{format_ether, parse_ether};
use crate::client::ContractSyncClient;
use crate::contract::{ChainReader, TxReceipt};
use crate::errors::SyncError;
use crate::types::{AccountRoles, ConnectionState, Project, StatusMessage};
use crate::wallet::WalletProvider;

pub struct ApiState<W: WalletProvider, R: ChainReader> {
    pub client: ContractSyncClient<W, R>,
}

/// Every route, with `state` attached. Layers are added by the caller.
pub fn router<W, R>(state: Arc<ApiState<W, R>>) -> Router
where
    W: WalletProvider,
    R: ChainReader + 'static,
{
    Router::new()
        .route("/health", get(health))
        .route("/connection", get(get_connection::<W, R>))
        .route("/connect", post(connect::<W, R>))
        .route("/disconnect", post(disconnect::<W, R>))
        .route("/refresh", post(refresh::<W, R>))
        .route("/status", get(get_status::<W, R>))
        .route("/treasury", get(get_treasury::<W, R>))
        .route("/treasury/deposit", post(deposit::<W, R>))
        .route("/treasury/withdraw", post(withdraw::<W, R>))
        .route(
            "/projects",
            get(list_projects::<W, R>).post(create_project::<W, R>),
        )
        .route("/projects/:id", get(get_project::<W, R>))
        .route(
            "/projects/:id/contractor-balance",
            get(get_contractor_balance::<W, R>),
        )
        .route("/projects/:id/confirm", post(confirm_work::<W, R>))
        .route("/projects/:id/approve", post(approve_work::<W, R>))
        .route("/projects/:id/payments", post(send_payment::<W, R>))
        .with_state(state)
}

// ─────────────────────────────────────────────────────────
// Response shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct AmountView {
    pub wei: String,
    pub ether: String,
}

impl From<U256> for AmountView {
    fn from(wei: U256) -> Self {
        Self {
            wei: wei.to_string(),
            ether: format_ether(wei),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ProjectView {
    pub id: u64,
    pub name: String,
    pub details: String,
    pub contractor_name: String,
    pub contractor_address: Address,
    pub budget: AmountView,
    pub contractor_disbursed_balance: AmountView,
    pub remaining_budget: AmountView,
    pub starting_date: DateTime<Utc>,
    pub is_active: bool,
    pub work_confirmed: bool,
    pub work_approved: bool,
}

impl From<&Project> for ProjectView {
    fn from(p: &Project) -> Self {
        Self {
            id: p.id,
            name: p.name.clone(),
            details: p.details.clone(),
            contractor_name: p.contractor_name.clone(),
            contractor_address: p.contractor_address,
            budget: p.budget.into(),
            contractor_disbursed_balance: p.contractor_disbursed_balance.into(),
            remaining_budget: p.remaining_budget().into(),
            starting_date: p.starting_date,
            is_active: p.is_active,
            work_confirmed: p.work_confirmed,
            work_approved: p.work_approved,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ProjectsResponse {
    pub count: usize,
    pub projects: Vec<ProjectView>,
}

#[derive(Debug, Serialize)]
pub struct TreasuryResponse {
    pub total_balance: AmountView,
    pub approver: Address,
    pub account_balance: AmountView,
}

#[derive(Debug, Serialize)]
pub struct ConnectionResponse {
    #[serde(flatten)]
    pub state: ConnectionState,
    /// Present only while connected.
    pub roles: Option<AccountRoles>,
}

#[derive(Debug, Serialize)]
pub struct ContractorBalanceResponse {
    pub project_id: u64,
    pub disbursed: AmountView,
}

#[derive(Debug, Serialize)]
pub struct ReceiptResponse {
    pub tx_hash: B256,
    pub block_number: u64,
}

impl From<TxReceipt> for ReceiptResponse {
    fn from(r: TxReceipt) -> Self {
        Self {
            tx_hash: r.tx_hash,
            block_number: r.block_number,
        }
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Stable error kind, e.g. `budget_exceeded`.
    pub error: &'static str,
    pub message: String,
}

// ─────────────────────────────────────────────────────────
// Request shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
    #[serde(default)]
    pub details: String,
    pub contractor_name: String,
    pub contractor_address: String,
    /// Ether, as a decimal string.
    pub budget: String,
}

#[derive(Debug, Deserialize)]
pub struct AmountRequest {
    /// Ether, as a decimal string.
    pub amount: String,
}

// ─────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────

/// [`SyncError`] rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub SyncError);

impl From<SyncError> for ApiError {
    fn from(e: SyncError) -> Self {
        Self(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            SyncError::Validation(_) => StatusCode::BAD_REQUEST,
            SyncError::Unauthorized(_) => StatusCode::FORBIDDEN,
            SyncError::NotFound(_) => StatusCode::NOT_FOUND,
            SyncError::NotConnected
            | SyncError::TransactionRejected(_)
            | SyncError::Abandoned(_)
            | SyncError::Connection(_) => StatusCode::CONFLICT,
            SyncError::InsufficientFunds { .. }
            | SyncError::InsufficientTreasury { .. }
            | SyncError::BudgetExceeded { .. }
            | SyncError::Precondition(_)
            | SyncError::TransactionReverted { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            SyncError::TransactionTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            SyncError::ChainRead(_) | SyncError::Rpc { .. } | SyncError::Http(_) => {
                StatusCode::BAD_GATEWAY
            }
            SyncError::ProviderUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            SyncError::DataIntegrity(_) | SyncError::Config(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!("Request failed: {}", self.0);
        }
        let body = ErrorResponse {
            error: self.0.kind(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

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

/// `GET /connection`
pub async fn get_connection<W, R>(State(state): State<Arc<ApiState<W, R>>>) -> impl IntoResponse
where
    W: WalletProvider,
    R: ChainReader + 'static,
{
    Json(connection_response(&state.client))
}

/// `POST /connect`
///
/// Prompts the wallet for account access when it has not been granted yet.
pub async fn connect<W, R>(State(state): State<Arc<ApiState<W, R>>>) -> ApiResult<ConnectionResponse>
where
    W: WalletProvider,
    R: ChainReader + 'static,
{
    state.client.connect().await?;
    Ok(Json(connection_response(&state.client)))
}

/// `POST /disconnect`
pub async fn disconnect<W, R>(State(state): State<Arc<ApiState<W, R>>>) -> impl IntoResponse
where
    W: WalletProvider,
    R: ChainReader + 'static,
{
    state.client.disconnect().await;
    Json(connection_response(&state.client))
}

/// `POST /refresh`
pub async fn refresh<W, R>(State(state): State<Arc<ApiState<W, R>>>) -> ApiResult<ProjectsResponse>
where
    W: WalletProvider,
    R: ChainReader + 'static,
{
    state.client.refresh_all().await?;
    Ok(Json(projects_response(&state.client.projects())))
}

/// `GET /status`
///
/// The outcome of the last operation, or `null` before the first one.
pub async fn get_status<W, R>(
    State(state): State<Arc<ApiState<W, R>>>,
) -> Json<Option<StatusMessage>>
where
    W: WalletProvider,
    R: ChainReader + 'static,
{
    Json(state.client.last_status())
}

/// `GET /treasury`
pub async fn get_treasury<W, R>(State(state): State<Arc<ApiState<W, R>>>) -> Json<TreasuryResponse>
where
    W: WalletProvider,
    R: ChainReader + 'static,
{
    let snapshot = state.client.snapshot();
    Json(TreasuryResponse {
        total_balance: snapshot.treasury.total_balance.into(),
        approver: snapshot.treasury.approver,
        account_balance: snapshot.account_balance.into(),
    })
}

/// `POST /treasury/deposit`
pub async fn deposit<W, R>(
    State(state): State<Arc<ApiState<W, R>>>,
    Json(body): Json<AmountRequest>,
) -> ApiResult<ReceiptResponse>
where
    W: WalletProvider,
    R: ChainReader + 'static,
{
    let amount = parse_ether(&body.amount)?;
    let receipt = state.client.deposit_funds(amount).await?;
    Ok(Json(receipt.into()))
}

/// `POST /treasury/withdraw`
pub async fn withdraw<W, R>(
    State(state): State<Arc<ApiState<W, R>>>,
    Json(body): Json<AmountRequest>,
) -> ApiResult<ReceiptResponse>
where
    W: WalletProvider,
    R: ChainReader + 'static,
{
    let amount = parse_ether(&body.amount)?;
    let receipt = state.client.withdraw_funds(amount).await?;
    Ok(Json(receipt.into()))
}

/// `GET /projects`
pub async fn list_projects<W, R>(State(state): State<Arc<ApiState<W, R>>>) -> Json<ProjectsResponse>
where
    W: WalletProvider,
    R: ChainReader + 'static,
{
    Json(projects_response(&state.client.projects()))
}

/// `POST /projects`
pub async fn create_project<W, R>(
    State(state): State<Arc<ApiState<W, R>>>,
    Json(body): Json<CreateProjectRequest>,
) -> ApiResult<ReceiptResponse>
where
    W: WalletProvider,
    R: ChainReader + 'static,
{
    let budget = parse_ether(&body.budget)?;
    let receipt = state
        .client
        .create_project(
            &body.name,
            &body.details,
            &body.contractor_name,
            &body.contractor_address,
            budget,
        )
        .await?;
    Ok(Json(receipt.into()))
}

/// `GET /projects/:id`
pub async fn get_project<W, R>(
    State(state): State<Arc<ApiState<W, R>>>,
    Path(project_id): Path<u64>,
) -> ApiResult<ProjectView>
where
    W: WalletProvider,
    R: ChainReader + 'static,
{
    let snapshot = state.client.snapshot();
    let project = snapshot
        .project(project_id)
        .ok_or_else(|| SyncError::NotFound(format!("project {project_id}")))?;
    Ok(Json(project.into()))
}

/// `GET /projects/:id/contractor-balance`
pub async fn get_contractor_balance<W, R>(
    State(state): State<Arc<ApiState<W, R>>>,
    Path(project_id): Path<u64>,
) -> ApiResult<ContractorBalanceResponse>
where
    W: WalletProvider,
    R: ChainReader + 'static,
{
    let disbursed = state.client.get_contractor_balance(project_id)?;
    Ok(Json(ContractorBalanceResponse {
        project_id,
        disbursed: disbursed.into(),
    }))
}

/// `POST /projects/:id/confirm`
pub async fn confirm_work<W, R>(
    State(state): State<Arc<ApiState<W, R>>>,
    Path(project_id): Path<u64>,
) -> ApiResult<ReceiptResponse>
where
    W: WalletProvider,
    R: ChainReader + 'static,
{
    let receipt = state.client.confirm_work(project_id).await?;
    Ok(Json(receipt.into()))
}

/// `POST /projects/:id/approve`
pub async fn approve_work<W, R>(
    State(state): State<Arc<ApiState<W, R>>>,
    Path(project_id): Path<u64>,
) -> ApiResult<ReceiptResponse>
where
    W: WalletProvider,
    R: ChainReader + 'static,
{
    let receipt = state.client.approve_work(project_id).await?;
    Ok(Json(receipt.into()))
}

/// `POST /projects/:id/payments`
pub async fn send_payment<W, R>(
    State(state): State<Arc<ApiState<W, R>>>,
    Path(project_id): Path<u64>,
    Json(body): Json<AmountRequest>,
) -> ApiResult<ReceiptResponse>
where
    W: WalletProvider,
    R: ChainReader + 'static,
{
    let amount = parse_ether(&body.amount)?;
    let receipt = state.client.send_payment(project_id, amount).await?;
    Ok(Json(receipt.into()))
}

fn connection_response<W, R>(client: &ContractSyncClient<W, R>) -> ConnectionResponse
where
    W: WalletProvider,
    R: ChainReader + 'static,
{
    let state = client.connection();
    let roles = match (state.is_connected(), state.address) {
        (true, Some(address)) => Some(AccountRoles::derive(address, &client.snapshot())),
        _ => None,
    };
    ConnectionResponse { state, roles }
}

fn projects_response(projects: &[Project]) -> ProjectsResponse {
    ProjectsResponse {
        count: projects.len(),
        projects: projects.iter().map(ProjectView::from).collect(),
    }
}
