//! Client-wide error types.

use alloy_primitives::{B256, U256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Wallet provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Wallet is not connected")]
    NotConnected,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Insufficient funds: account balance {available} is below {required}")]
    InsufficientFunds { available: U256, required: U256 },

    #[error("Insufficient treasury: contract balance {available} is below {requested}")]
    InsufficientTreasury { available: U256, requested: U256 },

    #[error(
        "Budget exceeded for project {project_id}: {disbursed} already paid, {amount} requested, budget {budget}"
    )]
    BudgetExceeded {
        project_id: u64,
        disbursed: U256,
        amount: U256,
        budget: U256,
    },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Transaction rejected by signer: {0}")]
    TransactionRejected(String),

    #[error("Transaction reverted: {reason}")]
    TransactionReverted { reason: String },

    #[error("Timed out waiting for inclusion of transaction {tx_hash}")]
    TransactionTimeout { tx_hash: B256 },

    #[error("Operation abandoned: {0}")]
    Abandoned(String),

    #[error("Chain read error: {0}")]
    ChainRead(String),

    #[error("Data integrity error: {0}")]
    DataIntegrity(String),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// Stable identifier for the error kind, used by the status slot and the
    /// HTTP layer.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ProviderUnavailable(_) => "provider_unavailable",
            Self::Connection(_) => "connection",
            Self::NotConnected => "not_connected",
            Self::Validation(_) => "validation",
            Self::InsufficientFunds { .. } => "insufficient_funds",
            Self::InsufficientTreasury { .. } => "insufficient_treasury",
            Self::BudgetExceeded { .. } => "budget_exceeded",
            Self::Unauthorized(_) => "unauthorized",
            Self::Precondition(_) => "precondition",
            Self::NotFound(_) => "not_found",
            Self::TransactionRejected(_) => "transaction_rejected",
            Self::TransactionReverted { .. } => "transaction_reverted",
            Self::TransactionTimeout { .. } => "transaction_timeout",
            Self::Abandoned(_) => "abandoned",
            Self::ChainRead(_) => "chain_read",
            Self::DataIntegrity(_) => "data_integrity",
            Self::Rpc { .. } => "rpc",
            Self::Http(_) => "http",
            Self::Config(_) => "config",
        }
    }

    /// Whether retrying the same call unchanged can reasonably succeed.
    ///
    /// A timed-out transaction is not: it may still be included, so the
    /// caller refreshes before submitting again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection(_)
                | Self::TransactionRejected(_)
                | Self::ChainRead(_)
                | Self::Http(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
