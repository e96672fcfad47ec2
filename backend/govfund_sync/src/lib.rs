//! GovFund contract state synchronization.
//!
//! [`ContractSyncClient`] connects to a wallet, keeps a consistent cached
//! copy of the GovFund contract's projects and treasury, and runs every
//! state-changing call as submit, await inclusion, then reload.

pub mod amount;
pub mod api;
pub mod bindings;
pub mod client;
pub mod config;
pub mod contract;
pub mod errors;
pub mod refresh;
pub mod rpc;
pub mod sync;
pub mod types;
pub mod wallet;

#[cfg(any(test, feature = "testutils"))]
pub mod mock;

#[cfg(test)]
mod test_client;

pub use client::{parse_wallet_address, ContractSyncClient};
pub use config::{ClientConfig, Config};
pub use contract::{ChainReader, GovFundContract, TxReceipt};
pub use errors::{Result, SyncError};
pub use types::{
    AccountRoles, ChainSnapshot, ConnectionState, ConnectionStatus, ContractTreasury, Project,
    StatusMessage,
};
pub use wallet::{RpcWallet, TransactionSigner, WalletEvent, WalletProvider};
