//! Typed access to the GovFund contract.
//!
//! [`ChainReader`] is the raw read boundary (`eth_call`, receipts).
//! [`GovFundContract`] encodes and decodes the contract's named operations on
//! top of it and validates every response into the schema in [`crate::types`];
//! anything that does not fit is a [`SyncError::ChainRead`], never a default.

use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, Bytes, B256, U256};
use alloy_sol_types::SolCall;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::bindings::IGovFund;
use crate::errors::{Result, SyncError};
use crate::rpc::TxRequest;
use crate::types::Project;

/// Upper bound on a plausible `getProjectCount`; anything above is a
/// malformed response.
pub const MAX_PROJECTS: u64 = 100_000;

/// Read side of the chain.
#[async_trait]
pub trait ChainReader: Send + Sync {
    /// Execute a read-only call against the latest block.
    async fn call(&self, request: &TxRequest) -> Result<Bytes>;

    /// Receipt of an included transaction, `None` while it is still pending
    /// (or was dropped).
    async fn transaction_receipt(&self, tx_hash: B256) -> Result<Option<TxReceipt>>;

    /// Revert reason of `request`, which failed when included in block
    /// `included_in`. `None` when the reader cannot recover it.
    async fn revert_reason(&self, _request: &TxRequest, _included_in: u64) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: B256,
    pub block_number: u64,
    pub success: bool,
}

/// A state-changing contract operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContractCall {
    CreateProject {
        name: String,
        details: String,
        contractor_name: String,
        contractor: Address,
        budget: U256,
    },
    DepositFunds {
        amount: U256,
    },
    WithdrawFunds {
        amount: U256,
    },
    ConfirmWork {
        project_id: u64,
    },
    ApproveWork {
        project_id: u64,
    },
    SendPayment {
        project_id: u64,
        amount: U256,
    },
}

impl ContractCall {
    pub fn label(&self) -> &'static str {
        match self {
            Self::CreateProject { .. } => "create_project",
            Self::DepositFunds { .. } => "deposit_funds",
            Self::WithdrawFunds { .. } => "withdraw_funds",
            Self::ConfirmWork { .. } => "confirm_work",
            Self::ApproveWork { .. } => "approve_work",
            Self::SendPayment { .. } => "send_payment",
        }
    }

    /// Build the transaction `from` would submit to `contract`.
    pub fn to_request(&self, contract: Address, from: Address) -> TxRequest {
        let (input, value) = match self {
            Self::CreateProject {
                name,
                details,
                contractor_name,
                contractor,
                budget,
            } => (
                IGovFund::createProjectCall {
                    projectName: name.clone(),
                    projectDetails: details.clone(),
                    contractorName: contractor_name.clone(),
                    contractor: *contractor,
                    projectBudget: *budget,
                }
                .abi_encode(),
                U256::ZERO,
            ),
            // The deposit is the transaction value itself.
            Self::DepositFunds { amount } => (IGovFund::depositFundsCall {}.abi_encode(), *amount),
            Self::WithdrawFunds { amount } => (
                IGovFund::withdrawFundsCall { amount: *amount }.abi_encode(),
                U256::ZERO,
            ),
            Self::ConfirmWork { project_id } => (
                IGovFund::contractorWorkDoneConfirmationCall {
                    projectId: U256::from(*project_id),
                }
                .abi_encode(),
                U256::ZERO,
            ),
            Self::ApproveWork { project_id } => (
                IGovFund::governmentApproveWorkCall {
                    projectId: U256::from(*project_id),
                }
                .abi_encode(),
                U256::ZERO,
            ),
            Self::SendPayment { project_id, amount } => (
                IGovFund::sendFundsToContractorCall {
                    projectId: U256::from(*project_id),
                    amount: *amount,
                }
                .abi_encode(),
                U256::ZERO,
            ),
        };

        TxRequest {
            from: Some(from),
            to: contract,
            input: input.into(),
            value,
        }
    }
}

/// Typed facade over one deployed GovFund contract.
pub struct GovFundContract<R> {
    reader: Arc<R>,
    address: Address,
}

impl<R> Clone for GovFundContract<R> {
    fn clone(&self) -> Self {
        Self {
            reader: Arc::clone(&self.reader),
            address: self.address,
        }
    }
}

impl<R: ChainReader> GovFundContract<R> {
    pub fn new(reader: Arc<R>, address: Address) -> Self {
        Self { reader, address }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    async fn view<C: SolCall>(&self, call: C) -> Result<C::Return> {
        let request = TxRequest {
            from: None,
            to: self.address,
            input: call.abi_encode().into(),
            value: U256::ZERO,
        };
        let output = self.reader.call(&request).await?;
        C::abi_decode_returns(&output, true).map_err(|e| {
            SyncError::ChainRead(format!("{} returned malformed data: {e}", C::SIGNATURE))
        })
    }

    pub async fn project_count(&self) -> Result<u64> {
        let count = self.view(IGovFund::getProjectCountCall {}).await?._0;
        u64::try_from(count)
            .ok()
            .filter(|count| *count <= MAX_PROJECTS)
            .ok_or_else(|| SyncError::ChainRead(format!("project count out of range: {count}")))
    }

    pub async fn treasury_balance(&self) -> Result<U256> {
        Ok(self.view(IGovFund::getContractBalanceCall {}).await?._0)
    }

    pub async fn approver(&self) -> Result<Address> {
        Ok(self.view(IGovFund::governmentCall {}).await?._0)
    }

    pub async fn contractor_disbursed_balance(&self, project_id: u64) -> Result<U256> {
        let call = IGovFund::getContractorBalanceCall {
            projectId: U256::from(project_id),
        };
        Ok(self.view(call).await?._0)
    }

    pub async fn work_confirmed(&self, project_id: u64, contractor: Address) -> Result<bool> {
        let call = IGovFund::contractorWorkDoneCall {
            projectId: U256::from(project_id),
            contractor,
        };
        Ok(self.view(call).await?._0)
    }

    pub async fn work_approved(&self, project_id: u64, contractor: Address) -> Result<bool> {
        let call = IGovFund::governmentApprovedCall {
            projectId: U256::from(project_id),
            contractor,
        };
        Ok(self.view(call).await?._0)
    }

    /// Read and validate one full project record.
    pub async fn load_project(&self, project_id: u64) -> Result<Project> {
        let details = self
            .view(IGovFund::getProjectDetailsCall {
                projectId: U256::from(project_id),
            })
            .await?;
        let contractor = details.contractor;

        let (work_confirmed, work_approved, disbursed) = tokio::try_join!(
            self.work_confirmed(project_id, contractor),
            self.work_approved(project_id, contractor),
            self.contractor_disbursed_balance(project_id),
        )?;

        let starting_date = to_datetime(details.startingDate).ok_or_else(|| {
            SyncError::ChainRead(format!(
                "project {project_id} has an invalid starting date: {}",
                details.startingDate
            ))
        })?;

        if disbursed > details.projectBudget {
            return Err(SyncError::DataIntegrity(format!(
                "project {project_id} disbursed {disbursed} exceeds its budget {}",
                details.projectBudget
            )));
        }

        debug!(project_id, %contractor, "loaded project");

        Ok(Project {
            id: project_id,
            name: details.projectName,
            details: details.projectDetails,
            contractor_name: details.contractorName,
            contractor_address: contractor,
            budget: details.projectBudget,
            starting_date,
            is_active: details.isActive,
            work_confirmed,
            work_approved,
            contractor_disbursed_balance: disbursed,
        })
    }

    /// Poll for the receipt of `tx_hash`, sent as `request`, until it is
    /// included.
    ///
    /// Never gives up on its own; callers bound it with a timeout. Once the
    /// transaction is out a failed lookup says nothing about its outcome, so
    /// it counts as still pending. A receipt with a failed status becomes
    /// [`SyncError::TransactionReverted`].
    pub async fn wait_for_inclusion(
        &self,
        tx_hash: B256,
        request: &TxRequest,
        poll_interval: Duration,
    ) -> Result<TxReceipt> {
        loop {
            match self.reader.transaction_receipt(tx_hash).await {
                Ok(Some(receipt)) if receipt.success => return Ok(receipt),
                Ok(Some(receipt)) => {
                    let reason = self
                        .reader
                        .revert_reason(request, receipt.block_number)
                        .await
                        .unwrap_or_else(|| {
                            format!(
                                "transaction {tx_hash} reverted in block {}",
                                receipt.block_number
                            )
                        });
                    return Err(SyncError::TransactionReverted { reason });
                }
                Ok(None) => {}
                Err(e) => warn!(%tx_hash, "Receipt lookup failed, still waiting: {e}"),
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}

fn to_datetime(seconds: U256) -> Option<DateTime<Utc>> {
    let seconds = i64::try_from(seconds).ok()?;
    DateTime::from_timestamp(seconds, 0)
}
