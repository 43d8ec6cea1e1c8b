//! Application service tying the approval aggregate to a repository and an event sink.
//!
//! Each mutating call is one optimistic-concurrency unit: load, mutate in memory, then write
//! back against the loaded version. Events go to the sink only after the write committed.

use thiserror::Error;
use tracing::{info, warn};

use countersign_core::config::WorkflowConfig;
use countersign_core::domain::approval::{
    ApplyDecision, Approval, ApprovalId, ContractId, Principal, StepDefinition,
};
use countersign_core::domain::paging::{PageRequest, PagedResult, MAX_PAGE_SIZE};
use countersign_core::errors::{InterfaceError, WorkflowError};
use countersign_core::events::{WorkflowEvent, WorkflowEventSink};

use crate::repositories::{ApprovalRepository, RepositoryError};

#[derive(Debug, Error)]
pub enum WorkflowServiceError {
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
    #[error(transparent)]
    Repository(RepositoryError),
}

impl From<RepositoryError> for WorkflowServiceError {
    fn from(error: RepositoryError) -> Self {
        match error {
            RepositoryError::VersionConflict { approval_id, expected_version } => {
                Self::Workflow(WorkflowError::ConcurrentModification {
                    approval_id,
                    expected_version,
                })
            }
            RepositoryError::DuplicatePending { contract_id } => {
                Self::Workflow(WorkflowError::DuplicatePendingApproval { contract_id })
            }
            RepositoryError::Restore(error) => Self::Workflow(error),
            other => Self::Repository(other),
        }
    }
}

impl WorkflowServiceError {
    pub fn as_workflow(&self) -> Option<&WorkflowError> {
        match self {
            Self::Workflow(error) => Some(error),
            Self::Repository(_) => None,
        }
    }

    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        match self {
            Self::Workflow(error) => error.into_interface(correlation_id),
            Self::Repository(error) if is_transient(&error) => {
                InterfaceError::service_unavailable(error.to_string(), correlation_id)
            }
            Self::Repository(error) => {
                InterfaceError::Internal { message: error.to_string(), correlation_id }
            }
        }
    }
}

fn is_transient(error: &RepositoryError) -> bool {
    match error {
        RepositoryError::Database(sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed) => true,
        RepositoryError::Database(sqlx::Error::Io(_)) => true,
        RepositoryError::Database(sqlx::Error::Database(db_err)) => {
            let message = db_err.message();
            message.contains("database is locked") || message.contains("database is busy")
        }
        _ => false,
    }
}

pub struct ApprovalWorkflowService<R, S> {
    repository: R,
    sink: S,
    max_page_size: u32,
}

impl<R, S> ApprovalWorkflowService<R, S>
where
    R: ApprovalRepository,
    S: WorkflowEventSink,
{
    pub fn new(repository: R, sink: S) -> Self {
        Self { repository, sink, max_page_size: MAX_PAGE_SIZE }
    }

    pub fn with_config(repository: R, sink: S, config: &WorkflowConfig) -> Self {
        Self { repository, sink, max_page_size: config.max_page_size.max(1) }
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    /// Opens a new approval chain for a contract that has no pending approval.
    pub async fn create(
        &self,
        contract_id: ContractId,
        definitions: &[StepDefinition],
    ) -> Result<ApprovalId, WorkflowServiceError> {
        let approval = Approval::create(contract_id, definitions)?;

        if self.repository.find_pending_for_contract(approval.contract_id()).await?.is_some() {
            warn!(
                event_name = "approval.create_rejected",
                contract_id = %approval.contract_id(),
                "contract already has a pending approval"
            );
            return Err(WorkflowError::DuplicatePendingApproval {
                contract_id: approval.contract_id().clone(),
            }
            .into());
        }

        self.repository.insert(&approval).await?;
        info!(
            event_name = "approval.created",
            correlation_id = %approval.id(),
            approval_id = %approval.id(),
            contract_id = %approval.contract_id(),
            step_count = approval.steps().len(),
            "approval chain created"
        );

        if let Some(step) = approval.active_step() {
            self.sink.emit(WorkflowEvent::step_activated(&approval, step, approval.created_at()));
        }
        Ok(approval.id().clone())
    }

    pub async fn apply(&self, command: ApplyDecision) -> Result<Approval, WorkflowServiceError> {
        let mut approval = self.load(&command.approval_id).await?;
        let loaded_version = approval.version();

        let outcome = approval
            .apply(
                &command.step_id,
                command.decision,
                &command.principal,
                command.comments.as_deref(),
                command.expected_version,
            )
            .map_err(|error| {
                warn!(
                    event_name = "approval.decision_refused",
                    correlation_id = %command.approval_id,
                    approval_id = %command.approval_id,
                    step_id = %command.step_id,
                    user_id = %command.principal.user_id,
                    error_kind = error.kind(),
                    "decision refused"
                );
                error
            })?;

        self.persist(&approval, loaded_version).await?;
        info!(
            event_name = "approval.step_decided",
            correlation_id = %approval.id(),
            approval_id = %approval.id(),
            contract_id = %approval.contract_id(),
            step_id = %command.step_id,
            decision = command.decision.as_str(),
            user_id = %command.principal.user_id,
            status = %outcome.to,
            version = approval.version(),
            "approval step decided"
        );

        self.publish(outcome.events);
        Ok(approval)
    }

    /// Administrative cancellation. Callers are expected to have authorized the operator.
    pub async fn cancel(
        &self,
        approval_id: &ApprovalId,
        reason: &str,
    ) -> Result<Approval, WorkflowServiceError> {
        let mut approval = self.load(approval_id).await?;
        let loaded_version = approval.version();
        let outcome = approval.cancel(reason)?;

        self.persist(&approval, loaded_version).await?;
        info!(
            event_name = "approval.cancelled",
            correlation_id = %approval.id(),
            approval_id = %approval.id(),
            contract_id = %approval.contract_id(),
            "approval cancelled"
        );

        self.publish(outcome.events);
        Ok(approval)
    }

    pub async fn archive(&self, approval_id: &ApprovalId) -> Result<Approval, WorkflowServiceError> {
        let mut approval = self.load(approval_id).await?;
        let loaded_version = approval.version();
        approval.archive()?;

        self.persist(&approval, loaded_version).await?;
        info!(
            event_name = "approval.archived",
            correlation_id = %approval.id(),
            approval_id = %approval.id(),
            contract_id = %approval.contract_id(),
            "approval archived"
        );
        Ok(approval)
    }

    pub async fn get(&self, approval_id: &ApprovalId) -> Result<Approval, WorkflowServiceError> {
        self.load(approval_id).await
    }

    pub async fn pending_for_contract(
        &self,
        contract_id: &ContractId,
    ) -> Result<Option<Approval>, WorkflowServiceError> {
        Ok(self.repository.find_pending_for_contract(contract_id).await?)
    }

    pub async fn history_for_contract(
        &self,
        contract_id: &ContractId,
    ) -> Result<Vec<Approval>, WorkflowServiceError> {
        Ok(self.repository.list_for_contract(contract_id).await?)
    }

    /// Approvals whose active step `principal` may decide. Paging arguments are clamped.
    pub async fn pending_for_approver(
        &self,
        principal: &Principal,
        page: u32,
        page_size: u32,
    ) -> Result<PagedResult<Approval>, WorkflowServiceError> {
        let request = PageRequest::bounded(page, page_size, self.max_page_size);
        Ok(self.repository.list_pending_for_approver(principal, request).await?)
    }

    async fn load(&self, approval_id: &ApprovalId) -> Result<Approval, WorkflowServiceError> {
        self.repository
            .find_by_id(approval_id)
            .await?
            .ok_or_else(|| WorkflowError::ApprovalNotFound(approval_id.clone()).into())
    }

    async fn persist(
        &self,
        approval: &Approval,
        loaded_version: u32,
    ) -> Result<(), WorkflowServiceError> {
        self.repository.update(approval, loaded_version).await.map_err(|error| {
            if matches!(error, RepositoryError::VersionConflict { .. }) {
                warn!(
                    event_name = "approval.conflict",
                    correlation_id = %approval.id(),
                    approval_id = %approval.id(),
                    expected_version = loaded_version,
                    "approval changed concurrently; write discarded"
                );
            }
            WorkflowServiceError::from(error)
        })
    }

    fn publish(&self, events: Vec<WorkflowEvent>) {
        for event in events {
            self.sink.emit(event);
        }
    }
}
