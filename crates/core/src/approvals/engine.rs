//! Transition engine for the approval aggregate.
//!
//! Every mutator validates against the derived active step, applies the change and its
//! cascade to sibling steps, and bumps the aggregate version once. Persistence compares
//! that version at write time; nothing here touches storage.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::approvals::resolver;
use crate::domain::approval::{
    Approval, ApprovalId, ApprovalStatus, ApprovalStep, ContractId, Decision, Principal,
    StepDefinition, StepId, StepStatus,
};
use crate::errors::WorkflowError;
use crate::events::WorkflowEvent;

/// Result of a successful transition, with the events to publish once it is persisted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TransitionOutcome {
    pub approval_id: ApprovalId,
    pub from: ApprovalStatus,
    pub to: ApprovalStatus,
    pub decided_step: Option<StepId>,
    pub events: Vec<WorkflowEvent>,
}

impl Approval {
    pub fn create(
        contract_id: ContractId,
        definitions: &[StepDefinition],
    ) -> Result<Self, WorkflowError> {
        Self::create_at(contract_id, definitions, Utc::now())
    }

    pub fn create_at(
        contract_id: ContractId,
        definitions: &[StepDefinition],
        now: DateTime<Utc>,
    ) -> Result<Self, WorkflowError> {
        if contract_id.0.trim().is_empty() {
            return Err(WorkflowError::InvalidWorkflowDefinition(
                "contract id must not be empty".to_string(),
            ));
        }
        if definitions.is_empty() {
            return Err(WorkflowError::InvalidWorkflowDefinition(
                "at least one approval step is required".to_string(),
            ));
        }

        let id = ApprovalId(Uuid::now_v7().to_string());
        let steps = definitions
            .iter()
            .enumerate()
            .map(|(index, definition)| {
                let binding = definition.binding().map_err(|reason| {
                    WorkflowError::InvalidWorkflowDefinition(format!("step {}: {reason}", index + 1))
                })?;
                Ok(ApprovalStep {
                    id: StepId(Uuid::new_v4().to_string()),
                    approval_id: id.clone(),
                    step_order: index as u32 + 1,
                    binding,
                    status: StepStatus::Pending,
                    actioned_by_user_id: None,
                    actioned_at: None,
                    comments: None,
                })
            })
            .collect::<Result<Vec<_>, WorkflowError>>()?;

        Ok(Self {
            id,
            contract_id,
            status: ApprovalStatus::Pending,
            steps,
            cancellation_reason: None,
            version: 1,
            is_archived: false,
            created_at: now,
            updated_at: now,
        })
    }

    /// Applies an approve/reject decision to the active step.
    ///
    /// `expected_version` is the version the caller authorized against; a mismatch with the
    /// current version fails with [`WorkflowError::AlreadyDecided`].
    pub fn apply(
        &mut self,
        step_id: &StepId,
        decision: Decision,
        principal: &Principal,
        comments: Option<&str>,
        expected_version: Option<u32>,
    ) -> Result<TransitionOutcome, WorkflowError> {
        resolver::authorize(self, step_id, principal)?;

        if let Some(expected_version) = expected_version {
            if expected_version != self.version {
                return Err(WorkflowError::AlreadyDecided {
                    approval_id: self.id.clone(),
                    expected_version,
                    actual_version: self.version,
                });
            }
        }

        let index = self.active_index().ok_or_else(|| {
            WorkflowError::InvariantViolation(format!("approval {} lost its active step", self.id))
        })?;
        let now = Utc::now();
        let from = self.status;
        let mut events = Vec::new();

        let step = &mut self.steps[index];
        step.status = decision.step_status();
        step.actioned_by_user_id = Some(principal.user_id.clone());
        step.actioned_at = Some(now);
        step.comments = comments.map(str::trim).filter(|text| !text.is_empty()).map(str::to_string);

        match decision {
            Decision::Reject => {
                self.skip_remaining(now);
                self.status = ApprovalStatus::Rejected;
            }
            Decision::Approve if index + 1 == self.steps.len() => {
                self.status = ApprovalStatus::Approved;
            }
            Decision::Approve => {
                events.push(WorkflowEvent::step_activated(self, &self.steps[index + 1], now));
            }
        }

        if self.status.is_terminal() {
            events.push(WorkflowEvent::approval_finalized(self, now));
        }
        self.touch(now);

        Ok(TransitionOutcome {
            approval_id: self.id.clone(),
            from,
            to: self.status,
            decided_step: Some(step_id.clone()),
            events,
        })
    }

    /// Administrative cancellation; only a pending approval can be cancelled.
    pub fn cancel(&mut self, reason: &str) -> Result<TransitionOutcome, WorkflowError> {
        if self.status != ApprovalStatus::Pending {
            return Err(WorkflowError::InvalidTransition {
                approval_id: self.id.clone(),
                status: self.status,
                action: "cancel",
            });
        }

        let now = Utc::now();
        let from = self.status;
        self.skip_remaining(now);
        self.status = ApprovalStatus::Cancelled;
        self.cancellation_reason =
            Some(reason.trim()).filter(|text| !text.is_empty()).map(str::to_string);
        let events = vec![WorkflowEvent::approval_finalized(self, now)];
        self.touch(now);

        Ok(TransitionOutcome {
            approval_id: self.id.clone(),
            from,
            to: self.status,
            decided_step: None,
            events,
        })
    }

    /// Soft-deletes a terminal approval.
    pub fn archive(&mut self) -> Result<(), WorkflowError> {
        if !self.status.is_terminal() || self.is_archived {
            return Err(WorkflowError::InvalidTransition {
                approval_id: self.id.clone(),
                status: self.status,
                action: "archive",
            });
        }

        self.is_archived = true;
        self.touch(Utc::now());
        Ok(())
    }

    fn skip_remaining(&mut self, now: DateTime<Utc>) {
        for step in self.steps.iter_mut().filter(|step| step.is_pending()) {
            step.status = StepStatus::Skipped;
            step.actioned_at = Some(now);
        }
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.version += 1;
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use crate::domain::approval::{
        Approval, ApprovalStatus, ContractId, Decision, Principal, StepDefinition, StepStatus,
    };
    use crate::errors::WorkflowError;
    use crate::events::WorkflowEvent;

    fn three_step() -> Approval {
        Approval::create(
            ContractId("C-100".to_string()),
            &[
                StepDefinition::role("DeptHead"),
                StepDefinition::user("U42"),
                StepDefinition::role("CEO"),
            ],
        )
        .expect("valid definition")
    }

    fn head() -> Principal {
        Principal::new("U1", ["DeptHead"])
    }

    fn u42() -> Principal {
        Principal::new("U42", Vec::<String>::new())
    }

    fn ceo() -> Principal {
        Principal::new("U9", ["CEO"])
    }

    fn assert_single_active_step(approval: &Approval) {
        if approval.status() != ApprovalStatus::Pending {
            assert!(approval.active_step().is_none());
            return;
        }
        let pending: Vec<_> = approval.steps().iter().filter(|step| step.is_pending()).collect();
        let active = approval.active_step().expect("pending approval has an active step");
        assert_eq!(pending[0].id, active.id);
        for step in approval.steps().iter().filter(|step| step.step_order < active.step_order) {
            assert!(matches!(step.status, StepStatus::Approved | StepStatus::Skipped));
        }
    }

    #[test]
    fn create_builds_contiguous_pending_chain() {
        let approval = three_step();

        assert_eq!(approval.status(), ApprovalStatus::Pending);
        assert_eq!(approval.version(), 1);
        let orders: Vec<u32> = approval.steps().iter().map(|step| step.step_order).collect();
        assert_eq!(orders, vec![1, 2, 3]);
        assert!(approval.steps().iter().all(|step| step.approval_id == *approval.id()));
        assert_eq!(approval.active_step().map(|step| step.step_order), Some(1));
        assert!(approval.chain_violation().is_none());
    }

    #[test]
    fn create_rejects_empty_or_malformed_definitions() {
        let empty = Approval::create(ContractId("C-1".to_string()), &[]);
        assert!(matches!(empty, Err(WorkflowError::InvalidWorkflowDefinition(_))));

        let neither = Approval::create(
            ContractId("C-1".to_string()),
            &[StepDefinition::role("CEO"), StepDefinition::default()],
        );
        match neither {
            Err(WorkflowError::InvalidWorkflowDefinition(message)) => {
                assert!(message.starts_with("step 2"), "unexpected message: {message}");
            }
            other => panic!("expected invalid definition, got {other:?}"),
        }

        let both = Approval::create(
            ContractId("C-1".to_string()),
            &[StepDefinition {
                approver_user_id: Some("U42".to_string()),
                approver_role: Some("CEO".to_string()),
            }],
        );
        assert!(matches!(both, Err(WorkflowError::InvalidWorkflowDefinition(_))));
    }

    #[test]
    fn documented_three_step_scenario() {
        let mut approval = three_step();
        let ids: Vec<_> = approval.steps().iter().map(|step| step.id.clone()).collect();

        let first = approval.apply(&ids[0], Decision::Approve, &head(), Some("ok"), None).unwrap();
        assert_eq!(first.to, ApprovalStatus::Pending);
        assert_eq!(approval.active_step().map(|step| step.id.clone()), Some(ids[1].clone()));
        assert!(matches!(
            first.events.as_slice(),
            [WorkflowEvent::StepActivated { step_order: 2, .. }]
        ));
        assert_single_active_step(&approval);

        approval.apply(&ids[1], Decision::Approve, &u42(), None, None).unwrap();
        assert_eq!(approval.status(), ApprovalStatus::Pending);
        assert_eq!(approval.active_step().map(|step| step.id.clone()), Some(ids[2].clone()));
        assert_single_active_step(&approval);

        let last = approval.apply(&ids[2], Decision::Reject, &ceo(), Some("budget"), None).unwrap();
        assert_eq!(last.from, ApprovalStatus::Pending);
        assert_eq!(last.to, ApprovalStatus::Rejected);
        assert_eq!(approval.steps()[2].status, StepStatus::Rejected);
        assert_eq!(approval.steps()[2].comments.as_deref(), Some("budget"));
        assert_eq!(approval.steps()[2].actioned_by_user_id.as_deref(), Some("U9"));
        assert!(matches!(
            last.events.as_slice(),
            [WorkflowEvent::ApprovalFinalized { status: ApprovalStatus::Rejected, .. }]
        ));

        let again = approval.apply(&ids[2], Decision::Reject, &ceo(), None, None);
        assert!(matches!(again, Err(WorkflowError::NotActiveStep { .. })));
        assert_eq!(approval.version(), 4);
        assert!(approval.chain_violation().is_none());
    }

    #[test]
    fn rejection_skips_every_later_pending_step() {
        let mut approval = three_step();
        let first = approval.steps()[0].id.clone();

        approval.apply(&first, Decision::Reject, &head(), None, None).unwrap();

        assert_eq!(approval.status(), ApprovalStatus::Rejected);
        let statuses: Vec<_> = approval.steps().iter().map(|step| step.status).collect();
        assert_eq!(statuses, vec![StepStatus::Rejected, StepStatus::Skipped, StepStatus::Skipped]);
        assert!(approval.steps()[1].actioned_at.is_some());
        assert!(approval.steps()[1].actioned_by_user_id.is_none());
        assert_eq!(approval.version(), 2, "cascade is a single version bump");
    }

    #[test]
    fn approving_last_step_approves_the_approval() {
        let mut approval = Approval::create(
            ContractId("C-2".to_string()),
            &[StepDefinition::user("U42")],
        )
        .unwrap();
        let only = approval.steps()[0].id.clone();

        let outcome = approval.apply(&only, Decision::Approve, &u42(), None, None).unwrap();

        assert_eq!(outcome.to, ApprovalStatus::Approved);
        assert!(approval.active_step().is_none());
        assert!(matches!(
            approval.apply(&only, Decision::Approve, &u42(), None, None),
            Err(WorkflowError::NotActiveStep { .. })
        ));
    }

    #[test]
    fn out_of_order_and_unauthorized_decisions_leave_state_untouched() {
        let mut approval = three_step();
        let before = approval.clone();
        let second = approval.steps()[1].id.clone();
        let first = approval.steps()[0].id.clone();

        assert!(matches!(
            approval.apply(&second, Decision::Approve, &u42(), None, None),
            Err(WorkflowError::NotActiveStep { .. })
        ));
        assert!(matches!(
            approval.apply(&first, Decision::Approve, &ceo(), None, None),
            Err(WorkflowError::Forbidden { .. })
        ));
        assert_eq!(approval, before);
    }

    #[test]
    fn stale_expected_version_is_already_decided() {
        let mut approval = three_step();
        let first = approval.steps()[0].id.clone();

        let result = approval.apply(&first, Decision::Approve, &head(), None, Some(7));
        assert!(matches!(
            result,
            Err(WorkflowError::AlreadyDecided { expected_version: 7, actual_version: 1, .. })
        ));

        approval.apply(&first, Decision::Approve, &head(), None, Some(1)).unwrap();
        assert_eq!(approval.version(), 2);
    }

    #[test]
    fn cancel_skips_pending_steps_and_is_terminal() {
        let mut approval = three_step();
        let first = approval.steps()[0].id.clone();
        approval.apply(&first, Decision::Approve, &head(), None, None).unwrap();

        let outcome = approval.cancel("  contract withdrawn ").unwrap();

        assert_eq!(outcome.to, ApprovalStatus::Cancelled);
        assert_eq!(approval.cancellation_reason(), Some("contract withdrawn"));
        let statuses: Vec<_> = approval.steps().iter().map(|step| step.status).collect();
        assert_eq!(statuses, vec![StepStatus::Approved, StepStatus::Skipped, StepStatus::Skipped]);
        assert!(matches!(
            approval.cancel("again"),
            Err(WorkflowError::InvalidTransition { action: "cancel", .. })
        ));
        let second = approval.steps()[1].id.clone();
        assert!(matches!(
            approval.apply(&second, Decision::Approve, &u42(), None, None),
            Err(WorkflowError::NotActiveStep { .. })
        ));
    }

    #[test]
    fn archive_requires_terminal_state() {
        let mut approval = three_step();
        assert!(matches!(
            approval.archive(),
            Err(WorkflowError::InvalidTransition { action: "archive", .. })
        ));

        approval.cancel("superseded").unwrap();
        approval.archive().unwrap();
        assert!(approval.is_archived());
        assert!(approval.archive().is_err());
        assert!(approval.chain_violation().is_none());
    }

    #[test]
    fn create_at_records_supplied_timestamp() {
        let at = Utc::now() - Duration::days(3);
        let approval =
            Approval::create_at(ContractId("C-3".to_string()), &[StepDefinition::role("HR")], at)
                .unwrap();
        assert_eq!(approval.created_at(), at);
        assert_eq!(approval.updated_at(), at);
    }
}
