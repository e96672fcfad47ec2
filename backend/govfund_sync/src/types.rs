//! # Types
//!
//! Immutable views of the GovFund contract that the sync client publishes.
//!
//! The client never hands out mutable access to its cache. Every refresh
//! builds a complete new [`ChainSnapshot`] and swaps it in as a whole, so a
//! reader holding an `Arc<ChainSnapshot>` always sees one consistent read of
//! the chain.
//!
//! ## Connection lifecycle
//!
//! ```text
//! Disconnected ──► Connecting ──► Connected
//!      ▲               │              │
//!      └───────────────┘              │
//!      └──────────────────────────────┘
//! ```

use alloy_primitives::{Address, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of the wallet connection.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Public view of the connection. The signer itself is never part of it.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    /// Connected account; `None` unless `status` is `Connected`.
    pub address: Option<Address>,
    pub chain_id: Option<u64>,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }
}

/// One construction project as recorded on-chain.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Project {
    /// Contract-assigned, sequential from 0.
    pub id: u64,
    pub name: String,
    pub details: String,
    pub contractor_name: String,
    pub contractor_address: Address,
    /// Budget in wei.
    pub budget: U256,
    pub starting_date: DateTime<Utc>,
    /// Cleared only when the project reaches its terminal state.
    pub is_active: bool,
    /// Set by the contractor.
    pub work_confirmed: bool,
    /// Set by the approver, only after `work_confirmed`.
    pub work_approved: bool,
    /// Cumulative wei paid to the contractor; never above `budget`.
    pub contractor_disbursed_balance: U256,
}

impl Project {
    /// Wei that can still be paid out before the budget is exhausted.
    pub fn remaining_budget(&self) -> U256 {
        self.budget.saturating_sub(self.contractor_disbursed_balance)
    }
}

/// The contract's pooled funds.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct ContractTreasury {
    /// Aggregate contract balance in wei.
    pub total_balance: U256,
    /// The designated approver ("government") account.
    pub approver: Address,
}

/// A complete, consistent read of the contract as seen by one account.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct ChainSnapshot {
    pub treasury: ContractTreasury,
    pub projects: Vec<Project>,
    /// Native balance of the connected account, in wei.
    pub account_balance: U256,
}

impl ChainSnapshot {
    pub fn project(&self, id: u64) -> Option<&Project> {
        // Ids are sequential, so the index is the fast path.
        match self.projects.get(id as usize) {
            Some(p) if p.id == id => Some(p),
            _ => self.projects.iter().find(|p| p.id == id),
        }
    }
}

/// Outcome of the last operation, for display by consumers.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StatusMessage {
    Success {
        message: String,
        at: DateTime<Utc>,
    },
    Error {
        kind: String,
        message: String,
        at: DateTime<Utc>,
    },
}

/// Roles the connected account may hold, derived from a snapshot.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct AccountRoles {
    pub is_approver: bool,
    pub is_contractor: bool,
}

impl AccountRoles {
    pub fn derive(address: Address, snapshot: &ChainSnapshot) -> Self {
        Self {
            is_approver: snapshot.treasury.approver == address,
            is_contractor: snapshot
                .projects
                .iter()
                .any(|p| p.contractor_address == address),
        }
    }
}
