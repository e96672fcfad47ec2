//! Ethereum JSON-RPC transport over HTTP.
//!
//! ## Resilience
//!
//! * Reads (`eth_call`, receipts, balances, accounts) are retried with
//!   exponential back-off on transport errors, rate limiting and soft RPC
//!   errors, at most [`MAX_READ_ATTEMPTS`] times.
//! * Writes (`eth_sendTransaction`, `eth_requestAccounts`) are sent exactly
//!   once. A failed write is surfaced to the caller, never replayed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use alloy_primitives::{Address, Bytes, B256, U256, U64};
use alloy_sol_types::{Revert, SolError};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::contract::{ChainReader, TxReceipt};
use crate::errors::{Result, SyncError};

const MAX_READ_ATTEMPTS: u32 = 4;
const MAX_BACKOFF_MS: u64 = 8_000;
const INITIAL_BACKOFF_MS: u64 = 500;

/// EIP-1193 "user rejected the request".
pub const USER_REJECTED_CODE: i64 = 4001;
/// Geth / anvil code for `execution reverted`.
const EXECUTION_REVERTED_CODE: i64 = 3;

// ─────────────────────────────────────────────────────────
// JSON-RPC response shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    pub data: Option<Value>,
}

impl RpcError {
    /// Revert payload attached to the error, if the node sent one.
    ///
    /// Nodes disagree on the shape: geth and anvil send a hex string,
    /// others nest it as `{"data": "0x…"}`.
    pub fn revert_data(&self) -> Option<Bytes> {
        let raw = match self.data.as_ref()? {
            Value::String(s) => s.as_str(),
            Value::Object(map) => map.get("data")?.as_str()?,
            _ => return None,
        };
        raw.parse().ok()
    }

    fn is_revert(&self) -> bool {
        self.code == EXECUTION_REVERTED_CODE || self.message.to_lowercase().contains("revert")
    }

    /// Map an error returned for a transaction submission.
    pub fn into_send_error(self) -> SyncError {
        if self.code == USER_REJECTED_CODE {
            return SyncError::TransactionRejected(self.message);
        }
        if self.is_revert() {
            let reason = self
                .revert_data()
                .and_then(|data| decode_revert(&data))
                .unwrap_or(self.message);
            return SyncError::TransactionReverted { reason };
        }
        SyncError::Rpc {
            code: self.code,
            message: self.message,
        }
    }

    // Malformed requests will not get better by retrying.
    fn is_hard(&self) -> bool {
        matches!(self.code, -32600 | -32601 | -32602) || self.is_revert()
    }
}

/// The `Error(string)` reason verbatim, else alloy's rendering of panics
/// and other standard revert payloads.
fn decode_revert(data: &[u8]) -> Option<String> {
    match Revert::abi_decode(data, true) {
        Ok(revert) => Some(revert.reason),
        Err(_) => alloy_sol_types::decode_revert_reason(data),
    }
}

/// Transaction or call request, serialized the way `eth_call` and
/// `eth_sendTransaction` expect it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TxRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<Address>,
    pub to: Address,
    #[serde(rename = "data")]
    pub input: Bytes,
    #[serde(skip_serializing_if = "U256::is_zero")]
    pub value: U256,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawReceipt {
    transaction_hash: B256,
    block_number: Option<U64>,
    status: Option<U64>,
}

// ─────────────────────────────────────────────────────────
// Client
// ─────────────────────────────────────────────────────────

/// Thin JSON-RPC client bound to one endpoint.
#[derive(Debug)]
pub struct RpcClient {
    http: Client,
    url: String,
    next_id: AtomicU64,
}

/// Failure of a single JSON-RPC round-trip.
#[derive(Debug)]
pub enum CallFailure {
    Transport(reqwest::Error),
    RateLimited,
    Rpc(RpcError),
    EmptyResult,
    Decode(serde_json::Error),
}

impl CallFailure {
    fn describe(&self) -> String {
        match self {
            Self::Transport(e) => e.to_string(),
            Self::RateLimited => "rate limited".to_string(),
            Self::Rpc(e) => format!("{} {}", e.code, e.message),
            Self::EmptyResult => "empty result".to_string(),
            Self::Decode(e) => e.to_string(),
        }
    }
}

impl From<CallFailure> for SyncError {
    fn from(failure: CallFailure) -> Self {
        match failure {
            CallFailure::Transport(e) => SyncError::Http(e),
            CallFailure::RateLimited => SyncError::Rpc {
                code: 429,
                message: "rate limited".to_string(),
            },
            CallFailure::Rpc(e) => SyncError::Rpc {
                code: e.code,
                message: e.message,
            },
            other => SyncError::ChainRead(other.describe()),
        }
    }
}

impl RpcClient {
    pub fn new(http: Client, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// One JSON-RPC round-trip, no retry.
    pub async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> std::result::Result<T, CallFailure> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let resp = self
            .http
            .post(&self.url)
            .json(&json!({
                "jsonrpc": "2.0",
                "id": id,
                "method": method,
                "params": params,
            }))
            .send()
            .await
            .map_err(CallFailure::Transport)?;

        if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(CallFailure::RateLimited);
        }

        let body: RpcResponse<Value> = resp.json().await.map_err(CallFailure::Transport)?;
        if let Some(err) = body.error {
            return Err(CallFailure::Rpc(err));
        }
        match body.result {
            // `null` is a legitimate answer for e.g. a pending receipt.
            Some(value) => serde_json::from_value(value).map_err(CallFailure::Decode),
            None => serde_json::from_value(Value::Null).map_err(|_| CallFailure::EmptyResult),
        }
    }

    /// A read with bounded exponential back-off. Exhausted or hard failures
    /// become [`SyncError::ChainRead`].
    pub async fn read<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let mut backoff = INITIAL_BACKOFF_MS;
        let mut attempt = 1;

        loop {
            match self.request(method, params.clone()).await {
                Ok(value) => return Ok(value),
                Err(CallFailure::Rpc(err)) if err.is_hard() => {
                    return Err(SyncError::ChainRead(format!(
                        "{method} failed: {} {}",
                        err.code, err.message
                    )));
                }
                Err(failure @ (CallFailure::Decode(_) | CallFailure::EmptyResult)) => {
                    return Err(SyncError::ChainRead(format!(
                        "{method} returned a malformed response: {}",
                        failure.describe()
                    )));
                }
                Err(failure) if attempt < MAX_READ_ATTEMPTS => {
                    warn!(
                        "{method} failed (attempt {attempt}/{MAX_READ_ATTEMPTS}, retry in {backoff}ms): {}",
                        failure.describe()
                    );
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF_MS);
                    attempt += 1;
                }
                Err(failure) => {
                    return Err(SyncError::ChainRead(format!(
                        "{method} failed after {attempt} attempts: {}",
                        failure.describe()
                    )));
                }
            }
        }
    }

    pub async fn chain_id(&self) -> Result<u64> {
        let id: U64 = self.read("eth_chainId", json!([])).await?;
        Ok(id.to::<u64>())
    }

    pub async fn balance(&self, address: Address) -> Result<U256> {
        self.read("eth_getBalance", json!([address, "latest"])).await
    }
}

#[async_trait]
impl ChainReader for RpcClient {
    async fn call(&self, request: &TxRequest) -> Result<Bytes> {
        debug!(to = %request.to, "eth_call");
        self.read("eth_call", json!([request, "latest"])).await
    }

    async fn transaction_receipt(&self, tx_hash: B256) -> Result<Option<TxReceipt>> {
        let raw: Option<RawReceipt> = self
            .read("eth_getTransactionReceipt", json!([tx_hash]))
            .await?;
        Ok(raw.and_then(|r| {
            // A receipt without a block number is still pending on some nodes.
            let block_number = r.block_number?.to::<u64>();
            Some(TxReceipt {
                tx_hash: r.transaction_hash,
                block_number,
                success: r.status.map(|s| s == U64::from(1)).unwrap_or(true),
            })
        }))
    }

    /// Replays the request on top of the block before the one it landed in.
    async fn revert_reason(&self, request: &TxRequest, included_in: u64) -> Option<String> {
        let parent = U64::from(included_in.saturating_sub(1));
        match self.request::<Bytes>("eth_call", json!([request, parent])).await {
            Err(CallFailure::Rpc(err)) if err.is_revert() => match err.into_send_error() {
                SyncError::TransactionReverted { reason } => Some(reason),
                _ => None,
            },
            Ok(_) => {
                debug!(included_in, "replay did not revert");
                None
            }
            Err(failure) => {
                debug!(included_in, "replay failed: {}", failure.describe());
                None
            }
        }
    }
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
