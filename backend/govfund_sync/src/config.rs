//! Application configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use alloy_primitives::Address;

use crate::errors::{Result, SyncError};

#[derive(Debug, Clone)]
pub struct Config {
    /// Chain JSON-RPC endpoint used for contract reads and receipts
    pub rpc_url: String,
    /// Wallet JSON-RPC endpoint (account access and signing); defaults to `rpc_url`
    pub wallet_url: String,
    /// The deployed GovFund contract address
    pub contract_address: Address,
    /// Port for the REST API server
    pub api_port: u16,
    /// Settings handed to the sync client itself
    pub client: ClientConfig,
    /// How often (in seconds) the wallet is polled for account / chain changes
    pub wallet_poll_interval_secs: u64,
    /// Background refresh period in seconds; `0` disables the refresher
    pub refresh_interval_secs: u64,
    /// Resume an already-authorized wallet session at startup
    pub auto_connect: bool,
}

/// Tunables of [`crate::client::ContractSyncClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Upper bound on waiting for a submitted transaction to be included
    pub inclusion_timeout: Duration,
    /// Delay between two receipt lookups while awaiting inclusion
    pub receipt_poll_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            inclusion_timeout: Duration::from_secs(120),
            receipt_poll_interval: Duration::from_millis(1000),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let rpc_url =
            env_var("RPC_URL").unwrap_or_else(|_| "http://127.0.0.1:8545".to_string());
        let contract_address = env_var("CONTRACT_ADDRESS").map_err(|_| {
            SyncError::Config("CONTRACT_ADDRESS environment variable is required".to_string())
        })?;

        Ok(Config {
            wallet_url: env_var("WALLET_URL").unwrap_or_else(|_| rpc_url.clone()),
            rpc_url,
            contract_address: Address::from_str(contract_address.trim())
                .map_err(|_| SyncError::Config("Invalid CONTRACT_ADDRESS".to_string()))?,
            api_port: parse_or("API_PORT", 3001)?,
            client: ClientConfig {
                inclusion_timeout: Duration::from_secs(parse_or("INCLUSION_TIMEOUT_SECS", 120)?),
                receipt_poll_interval: Duration::from_millis(parse_or(
                    "RECEIPT_POLL_INTERVAL_MS",
                    1000,
                )?),
            },
            wallet_poll_interval_secs: parse_or("WALLET_POLL_INTERVAL_SECS", 2)?,
            refresh_interval_secs: parse_or("REFRESH_INTERVAL_SECS", 0)?,
            auto_connect: parse_or("AUTO_CONNECT", false)?,
        })
    }
}

fn parse_or<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env_var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| SyncError::Config(format!("Invalid {key}"))),
        Err(_) => Ok(default),
    }
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| SyncError::Config(format!("Missing env var: {key}")))
}
