use thiserror::Error;

use crate::domain::approval::{ApprovalId, ApprovalStatus, ContractId, StepId};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("invalid workflow definition: {0}")]
    InvalidWorkflowDefinition(String),
    #[error("contract {contract_id} already has a pending approval")]
    DuplicatePendingApproval { contract_id: ContractId },
    #[error("approval not found: {0}")]
    ApprovalNotFound(ApprovalId),
    #[error("step {step_id} is not the active step of approval {approval_id}")]
    NotActiveStep { approval_id: ApprovalId, step_id: StepId },
    #[error("user `{user_id}` may not decide step {step_id}")]
    Forbidden { user_id: String, step_id: StepId },
    #[error(
        "approval {approval_id} changed since it was reviewed (expected version {expected_version}, found {actual_version})"
    )]
    AlreadyDecided { approval_id: ApprovalId, expected_version: u32, actual_version: u32 },
    #[error("approval {approval_id} was modified concurrently (loaded version {expected_version})")]
    ConcurrentModification { approval_id: ApprovalId, expected_version: u32 },
    #[error("cannot {action} approval {approval_id} in status `{status}`")]
    InvalidTransition { approval_id: ApprovalId, status: ApprovalStatus, action: &'static str },
    #[error("workflow invariant violation: {0}")]
    InvariantViolation(String),
}

impl WorkflowError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidWorkflowDefinition(_) => "invalid_workflow_definition",
            Self::DuplicatePendingApproval { .. } => "duplicate_pending_approval",
            Self::ApprovalNotFound(_) => "approval_not_found",
            Self::NotActiveStep { .. } => "not_active_step",
            Self::Forbidden { .. } => "forbidden",
            Self::AlreadyDecided { .. } => "already_decided",
            Self::ConcurrentModification { .. } => "concurrent_modification",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::InvariantViolation(_) => "invariant_violation",
        }
    }

    /// True when the caller should reload the approval before deciding whether to resubmit.
    pub fn requires_reload(&self) -> bool {
        matches!(
            self,
            Self::NotActiveStep { .. }
                | Self::AlreadyDecided { .. }
                | Self::ConcurrentModification { .. }
        )
    }

    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let mut mapped = InterfaceError::from(self);
        mapped.set_correlation_id(correlation_id.into());
        mapped
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("not found: {message}")]
    NotFound { message: String, correlation_id: String },
    #[error("forbidden: {message}")]
    Forbidden { message: String, correlation_id: String },
    #[error("conflict: {message}")]
    Conflict { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn service_unavailable(message: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        Self::ServiceUnavailable { message: message.into(), correlation_id: correlation_id.into() }
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::NotFound { .. } => "The requested approval does not exist.",
            Self::Forbidden { .. } => "You are not the approver for the current step.",
            Self::Conflict { .. } => {
                "The approval changed since you loaded it. Refresh and decide again."
            }
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }

    pub fn error_class(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => "bad_request",
            Self::NotFound { .. } => "not_found",
            Self::Forbidden { .. } => "forbidden",
            Self::Conflict { .. } => "conflict",
            Self::ServiceUnavailable { .. } => "service_unavailable",
            Self::Internal { .. } => "internal",
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::BadRequest { correlation_id, .. }
            | Self::NotFound { correlation_id, .. }
            | Self::Forbidden { correlation_id, .. }
            | Self::Conflict { correlation_id, .. }
            | Self::ServiceUnavailable { correlation_id, .. }
            | Self::Internal { correlation_id, .. } => correlation_id,
        }
    }

    fn set_correlation_id(&mut self, value: String) {
        match self {
            Self::BadRequest { correlation_id, .. }
            | Self::NotFound { correlation_id, .. }
            | Self::Forbidden { correlation_id, .. }
            | Self::Conflict { correlation_id, .. }
            | Self::ServiceUnavailable { correlation_id, .. }
            | Self::Internal { correlation_id, .. } => *correlation_id = value,
        }
    }
}

impl From<WorkflowError> for InterfaceError {
    fn from(value: WorkflowError) -> Self {
        let message = value.to_string();
        let correlation_id = "unassigned".to_owned();
        match value {
            WorkflowError::InvalidWorkflowDefinition(_) => Self::BadRequest { message, correlation_id },
            WorkflowError::ApprovalNotFound(_) => Self::NotFound { message, correlation_id },
            WorkflowError::Forbidden { .. } => Self::Forbidden { message, correlation_id },
            WorkflowError::DuplicatePendingApproval { .. }
            | WorkflowError::NotActiveStep { .. }
            | WorkflowError::AlreadyDecided { .. }
            | WorkflowError::ConcurrentModification { .. }
            | WorkflowError::InvalidTransition { .. } => Self::Conflict { message, correlation_id },
            WorkflowError::InvariantViolation(_) => Self::Internal { message, correlation_id },
        }
    }
}
