use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::WorkflowError;

macro_rules! string_id {
    ($name:ident) => {
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(ApprovalId);
string_id!(ContractId);
string_id!(StepId);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Cancelled,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Approved,
    Rejected,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

/// Decision an approver submits against the active step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "approve" | "approved" => Some(Self::Approve),
            "reject" | "rejected" => Some(Self::Reject),
            _ => None,
        }
    }

    pub(crate) fn step_status(&self) -> StepStatus {
        match self {
            Self::Approve => StepStatus::Approved,
            Self::Reject => StepStatus::Rejected,
        }
    }
}

/// Who may decide a step. A binding is either a specific user or a role, never both.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ApproverBinding {
    User(String),
    Role(String),
}

impl ApproverBinding {
    /// Builds a binding from the two nullable storage columns.
    pub fn from_columns(
        approver_user_id: Option<String>,
        approver_role: Option<String>,
    ) -> Result<Self, String> {
        let user_id = approver_user_id.map(|value| value.trim().to_string()).filter(|v| !v.is_empty());
        let role = approver_role.map(|value| value.trim().to_string()).filter(|v| !v.is_empty());

        match (user_id, role) {
            (Some(user_id), None) => Ok(Self::User(user_id)),
            (None, Some(role)) => Ok(Self::Role(role)),
            (Some(_), Some(_)) => {
                Err("binding sets both approver_user_id and approver_role".to_string())
            }
            (None, None) => Err("binding sets neither approver_user_id nor approver_role".to_string()),
        }
    }

    pub fn approver_user_id(&self) -> Option<&str> {
        match self {
            Self::User(user_id) => Some(user_id),
            Self::Role(_) => None,
        }
    }

    pub fn approver_role(&self) -> Option<&str> {
        match self {
            Self::User(_) => None,
            Self::Role(role) => Some(role),
        }
    }
}

impl fmt::Display for ApproverBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(user_id) => write!(f, "user:{user_id}"),
            Self::Role(role) => write!(f, "role:{role}"),
        }
    }
}

/// One entry of the ordered binding list supplied by the workflow-definition source.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub approver_user_id: Option<String>,
    pub approver_role: Option<String>,
}

impl StepDefinition {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self { approver_user_id: Some(user_id.into()), approver_role: None }
    }

    pub fn role(role: impl Into<String>) -> Self {
        Self { approver_user_id: None, approver_role: Some(role.into()) }
    }

    pub fn binding(&self) -> Result<ApproverBinding, String> {
        ApproverBinding::from_columns(self.approver_user_id.clone(), self.approver_role.clone())
    }
}

/// Parses `user:<id>` or `role:<name>`.
impl FromStr for StepDefinition {
    type Err = WorkflowError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let Some((kind, target)) = value.split_once(':') else {
            return Err(WorkflowError::InvalidWorkflowDefinition(format!(
                "step `{value}` must look like `user:<id>` or `role:<name>`"
            )));
        };

        match kind.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(Self::user(target.trim())),
            "role" => Ok(Self::role(target.trim())),
            other => Err(WorkflowError::InvalidWorkflowDefinition(format!(
                "unknown binding kind `{other}` (expected user|role)"
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalStep {
    pub id: StepId,
    pub approval_id: ApprovalId,
    pub step_order: u32,
    pub binding: ApproverBinding,
    pub status: StepStatus,
    pub actioned_by_user_id: Option<String>,
    pub actioned_at: Option<DateTime<Utc>>,
    pub comments: Option<String>,
}

impl ApprovalStep {
    pub fn approver_user_id(&self) -> Option<&str> {
        self.binding.approver_user_id()
    }

    pub fn approver_role(&self) -> Option<&str> {
        self.binding.approver_role()
    }

    pub fn is_pending(&self) -> bool {
        self.status == StepStatus::Pending
    }
}

/// Authenticated caller: identity plus the role set held at call time.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: String,
    pub roles: Vec<String>,
}

impl Principal {
    pub fn new<I, R>(user_id: impl Into<String>, roles: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<String>,
    {
        Self { user_id: user_id.into(), roles: roles.into_iter().map(Into::into).collect() }
    }
}

/// Command submitted to the workflow service for one decision.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyDecision {
    pub approval_id: ApprovalId,
    pub step_id: StepId,
    pub decision: Decision,
    pub principal: Principal,
    pub comments: Option<String>,
    /// Version the caller saw when it decided. `None` skips the staleness check.
    pub expected_version: Option<u32>,
}

/// Aggregate root for one approval chain. State changes only through the transition engine
/// (`create`, `apply`, `cancel`, `archive`), so the step invariants cannot be bypassed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Approval {
    pub(crate) id: ApprovalId,
    pub(crate) contract_id: ContractId,
    pub(crate) status: ApprovalStatus,
    pub(crate) steps: Vec<ApprovalStep>,
    pub(crate) cancellation_reason: Option<String>,
    pub(crate) version: u32,
    pub(crate) is_archived: bool,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) updated_at: DateTime<Utc>,
}

/// Flat persisted form of an approval, validated by [`Approval::restore`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApprovalRecord {
    pub id: ApprovalId,
    pub contract_id: ContractId,
    pub status: ApprovalStatus,
    pub steps: Vec<ApprovalStep>,
    pub cancellation_reason: Option<String>,
    pub version: u32,
    pub is_archived: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Approval {
    pub fn restore(record: ApprovalRecord) -> Result<Self, WorkflowError> {
        let mut steps = record.steps;
        steps.sort_by_key(|step| step.step_order);

        let approval = Self {
            id: record.id,
            contract_id: record.contract_id,
            status: record.status,
            steps,
            cancellation_reason: record.cancellation_reason,
            version: record.version,
            is_archived: record.is_archived,
            created_at: record.created_at,
            updated_at: record.updated_at,
        };

        match approval.chain_violation() {
            Some(violation) => Err(WorkflowError::InvariantViolation(format!(
                "approval {}: {violation}",
                approval.id
            ))),
            None => Ok(approval),
        }
    }

    pub fn id(&self) -> &ApprovalId {
        &self.id
    }

    pub fn contract_id(&self) -> &ContractId {
        &self.contract_id
    }

    pub fn status(&self) -> ApprovalStatus {
        self.status
    }

    pub fn steps(&self) -> &[ApprovalStep] {
        &self.steps
    }

    pub fn step(&self, step_id: &StepId) -> Option<&ApprovalStep> {
        self.steps.iter().find(|step| &step.id == step_id)
    }

    pub fn cancellation_reason(&self) -> Option<&str> {
        self.cancellation_reason.as_deref()
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn is_archived(&self) -> bool {
        self.is_archived
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The lowest-order step still awaiting a decision. Derived on every call, never stored.
    pub fn active_step(&self) -> Option<&ApprovalStep> {
        if self.status != ApprovalStatus::Pending {
            return None;
        }
        self.steps.iter().find(|step| step.is_pending())
    }

    pub(crate) fn active_index(&self) -> Option<usize> {
        if self.status != ApprovalStatus::Pending {
            return None;
        }
        self.steps.iter().position(ApprovalStep::is_pending)
    }

    /// Describes the first broken chain invariant, if any.
    pub(crate) fn chain_violation(&self) -> Option<String> {
        if self.steps.is_empty() {
            return Some("approval has no steps".to_string());
        }
        if self.version == 0 {
            return Some("version must start at 1".to_string());
        }

        for (index, step) in self.steps.iter().enumerate() {
            let expected_order = index as u32 + 1;
            if step.step_order != expected_order {
                return Some(format!(
                    "step orders must be contiguous from 1; found {} at position {expected_order}",
                    step.step_order
                ));
            }
            if step.approval_id != self.id {
                return Some(format!("step {} belongs to approval {}", step.id, step.approval_id));
            }
        }

        // Every chain is a run of approved steps followed by a tail whose shape
        // depends on the aggregate status.
        let head = self.steps.iter().take_while(|step| step.status == StepStatus::Approved).count();
        let tail = &self.steps[head..];
        let tail_all = |status: StepStatus| tail.iter().all(|step| step.status == status);

        let consistent = match self.status {
            ApprovalStatus::Pending => !tail.is_empty() && tail_all(StepStatus::Pending),
            ApprovalStatus::Approved => tail.is_empty(),
            ApprovalStatus::Rejected => match tail.split_first() {
                Some((rejected, rest)) => {
                    rejected.status == StepStatus::Rejected
                        && rest.iter().all(|step| step.status == StepStatus::Skipped)
                }
                None => false,
            },
            ApprovalStatus::Cancelled => !tail.is_empty() && tail_all(StepStatus::Skipped),
        };

        if !consistent {
            return Some(format!(
                "step statuses [{}] are inconsistent with approval status `{}`",
                self.steps.iter().map(|step| step.status.as_str()).collect::<Vec<_>>().join(", "),
                self.status
            ));
        }

        if self.is_archived && !self.status.is_terminal() {
            return Some("a pending approval cannot be archived".to_string());
        }

        None
    }
}
