//! Approver resolution.
//!
//! A user binding is matched by identity only; a role binding is matched against the
//! principal's role set. A step never matches both ways, and only the approval's active
//! step is ever considered.

use crate::domain::approval::{Approval, ApprovalStep, ApproverBinding, Principal, StepId};
use crate::errors::WorkflowError;

pub fn normalize_role(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}

pub fn step_matches(step: &ApprovalStep, principal: &Principal) -> bool {
    match &step.binding {
        ApproverBinding::User(user_id) => principal.user_id == *user_id,
        ApproverBinding::Role(role) => {
            let wanted = normalize_role(role);
            principal.roles.iter().any(|held| normalize_role(held) == wanted)
        }
    }
}

pub fn can_act(approval: &Approval, principal: &Principal) -> bool {
    approval.active_step().is_some_and(|step| step_matches(step, principal))
}

/// Confirms `step_id` is the active step and that `principal` is bound to it.
pub fn authorize<'a>(
    approval: &'a Approval,
    step_id: &StepId,
    principal: &Principal,
) -> Result<&'a ApprovalStep, WorkflowError> {
    let active = approval.active_step().filter(|step| &step.id == step_id).ok_or_else(|| {
        WorkflowError::NotActiveStep {
            approval_id: approval.id().clone(),
            step_id: step_id.clone(),
        }
    })?;

    if !step_matches(active, principal) {
        return Err(WorkflowError::Forbidden {
            user_id: principal.user_id.clone(),
            step_id: step_id.clone(),
        });
    }

    Ok(active)
}

pub fn actionable<'a, I>(approvals: I, principal: &Principal) -> Vec<&'a Approval>
where
    I: IntoIterator<Item = &'a Approval>,
{
    approvals.into_iter().filter(|approval| can_act(approval, principal)).collect()
}

#[cfg(test)]
mod tests {
    use super::{actionable, authorize, can_act, step_matches};
    use crate::domain::approval::{
        Approval, ContractId, Decision, Principal, StepDefinition, StepId,
    };
    use crate::errors::WorkflowError;

    fn chain() -> Approval {
        Approval::create(
            ContractId("C-1".to_string()),
            &[
                StepDefinition::role("DeptHead"),
                StepDefinition::user("U42"),
                StepDefinition::role("CEO"),
            ],
        )
        .expect("valid definition")
    }

    #[test]
    fn user_binding_matches_by_identity_regardless_of_roles() {
        let approval = chain();
        let step = &approval.steps()[1];

        assert!(step_matches(step, &Principal::new("U42", Vec::<String>::new())));
        assert!(step_matches(step, &Principal::new("U42", ["Intern"])));
        assert!(!step_matches(step, &Principal::new("U43", ["U42", "CEO"])));
    }

    #[test]
    fn role_binding_matches_normalized_role_membership() {
        let approval = chain();
        let step = &approval.steps()[0];

        assert!(step_matches(step, &Principal::new("U1", [" depthead "])));
        assert!(!step_matches(step, &Principal::new("DeptHead", ["Finance"])));
    }

    #[test]
    fn only_active_step_is_actionable() {
        let approval = chain();
        let ceo = Principal::new("U9", ["CEO"]);
        let head = Principal::new("U1", ["DeptHead"]);

        assert!(!can_act(&approval, &ceo), "step 3 is not reachable yet");
        assert!(can_act(&approval, &head));

        let future_step = approval.steps()[2].id.clone();
        assert!(matches!(
            authorize(&approval, &future_step, &ceo),
            Err(WorkflowError::NotActiveStep { .. })
        ));
    }

    #[test]
    fn authorize_reports_forbidden_for_unbound_principal() {
        let approval = chain();
        let active = approval.steps()[0].id.clone();

        let result = authorize(&approval, &active, &Principal::new("U42", ["Finance"]));
        assert!(matches!(result, Err(WorkflowError::Forbidden { ref user_id, .. }) if user_id == "U42"));

        let unknown = authorize(&approval, &StepId("missing".to_string()), &Principal::default());
        assert!(matches!(unknown, Err(WorkflowError::NotActiveStep { .. })));
    }

    #[test]
    fn actionable_filters_by_active_step() {
        let mut advanced = chain();
        let first = advanced.steps()[0].id.clone();
        advanced
            .apply(&first, Decision::Approve, &Principal::new("U1", ["DeptHead"]), None, None)
            .expect("approve step 1");
        let fresh = chain();

        let u42 = Principal::new("U42", Vec::<String>::new());
        let matches = actionable([&advanced, &fresh], &u42);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].id(), advanced.id());
    }
}
