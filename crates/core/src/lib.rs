pub mod approvals;
pub mod config;
pub mod domain;
pub mod errors;
pub mod events;

pub use approvals::TransitionOutcome;
pub use domain::approval::{
    ApplyDecision, Approval, ApprovalId, ApprovalRecord, ApprovalStatus, ApprovalStep,
    ApproverBinding, ContractId, Decision, Principal, StepDefinition, StepId, StepStatus,
};
pub use domain::paging::{PageRequest, PagedResult};
pub use errors::{InterfaceError, WorkflowError};
pub use events::{InMemoryEventSink, TracingEventSink, WorkflowEvent, WorkflowEventSink};

pub use chrono;
