use async_trait::async_trait;
use thiserror::Error;

use countersign_core::domain::approval::{Approval, ApprovalId, ContractId, Principal};
use countersign_core::domain::paging::{PageRequest, PagedResult};
use countersign_core::errors::WorkflowError;

pub mod approval;
pub mod memory;

pub use approval::SqlApprovalRepository;
pub use memory::InMemoryApprovalRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("stored approval failed validation: {0}")]
    Restore(WorkflowError),
    #[error("approval {approval_id} is no longer at version {expected_version}")]
    VersionConflict { approval_id: ApprovalId, expected_version: u32 },
    #[error("contract {contract_id} already has a pending approval")]
    DuplicatePending { contract_id: ContractId },
}

/// Persistence for the approval aggregate.
///
/// Writers compare versions: `update` succeeds only if the stored version still equals
/// `expected_version`, and writes the aggregate with its steps as one unit. Reads return
/// restored aggregates, never partially loaded ones.
#[async_trait]
pub trait ApprovalRepository: Send + Sync {
    async fn find_by_id(&self, id: &ApprovalId) -> Result<Option<Approval>, RepositoryError>;

    /// Stores a freshly created approval with all of its steps.
    async fn insert(&self, approval: &Approval) -> Result<(), RepositoryError>;

    async fn update(&self, approval: &Approval, expected_version: u32)
        -> Result<(), RepositoryError>;

    async fn find_pending_for_contract(
        &self,
        contract_id: &ContractId,
    ) -> Result<Option<Approval>, RepositoryError>;

    /// Non-archived approvals of a contract, newest first.
    async fn list_for_contract(
        &self,
        contract_id: &ContractId,
    ) -> Result<Vec<Approval>, RepositoryError>;

    /// Pending approvals whose active step the principal may decide, newest first.
    async fn list_pending_for_approver(
        &self,
        principal: &Principal,
        page: PageRequest,
    ) -> Result<PagedResult<Approval>, RepositoryError>;
}
