use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::approval::{
    Approval, ApprovalId, ApprovalStatus, ApprovalStep, ApproverBinding, ContractId, StepId,
};

/// Notifications for the external delivery collaborator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkflowEvent {
    StepActivated {
        approval_id: ApprovalId,
        contract_id: ContractId,
        step_id: StepId,
        step_order: u32,
        binding: ApproverBinding,
        occurred_at: DateTime<Utc>,
    },
    ApprovalFinalized {
        approval_id: ApprovalId,
        contract_id: ContractId,
        status: ApprovalStatus,
        occurred_at: DateTime<Utc>,
    },
}

impl WorkflowEvent {
    pub fn step_activated(approval: &Approval, step: &ApprovalStep, at: DateTime<Utc>) -> Self {
        Self::StepActivated {
            approval_id: approval.id().clone(),
            contract_id: approval.contract_id().clone(),
            step_id: step.id.clone(),
            step_order: step.step_order,
            binding: step.binding.clone(),
            occurred_at: at,
        }
    }

    pub fn approval_finalized(approval: &Approval, at: DateTime<Utc>) -> Self {
        Self::ApprovalFinalized {
            approval_id: approval.id().clone(),
            contract_id: approval.contract_id().clone(),
            status: approval.status(),
            occurred_at: at,
        }
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            Self::StepActivated { .. } => "approval.step_activated",
            Self::ApprovalFinalized { .. } => "approval.finalized",
        }
    }

    pub fn approval_id(&self) -> &ApprovalId {
        match self {
            Self::StepActivated { approval_id, .. } | Self::ApprovalFinalized { approval_id, .. } => {
                approval_id
            }
        }
    }
}

pub trait WorkflowEventSink: Send + Sync {
    fn emit(&self, event: WorkflowEvent);
}

#[derive(Clone, Default)]
pub struct InMemoryEventSink {
    events: Arc<Mutex<Vec<WorkflowEvent>>>,
}

impl InMemoryEventSink {
    pub fn events(&self) -> Vec<WorkflowEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl WorkflowEventSink for InMemoryEventSink {
    fn emit(&self, event: WorkflowEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

/// Publishes events as structured log records.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingEventSink;

impl WorkflowEventSink for TracingEventSink {
    fn emit(&self, event: WorkflowEvent) {
        let payload = serde_json::to_string(&event).unwrap_or_else(|error| error.to_string());
        tracing::info!(
            event_name = event.event_name(),
            approval_id = %event.approval_id(),
            payload = %payload,
            "workflow event emitted"
        );
    }
}

#[cfg(test)]
mod tests {
    use crate::domain::approval::{Approval, ContractId, StepDefinition};
    use crate::events::{InMemoryEventSink, TracingEventSink, WorkflowEvent, WorkflowEventSink};

    #[test]
    fn in_memory_sink_collects_events_in_order() {
        let approval = Approval::create(
            ContractId("C-1".to_string()),
            &[StepDefinition::role("HR"), StepDefinition::user("U2")],
        )
        .expect("valid definition");
        let sink = InMemoryEventSink::default();

        sink.emit(WorkflowEvent::step_activated(&approval, &approval.steps()[0], approval.created_at()));
        sink.emit(WorkflowEvent::approval_finalized(&approval, approval.created_at()));

        let names: Vec<_> = sink.events().iter().map(WorkflowEvent::event_name).collect();
        assert_eq!(names, vec!["approval.step_activated", "approval.finalized"]);
        assert!(sink.events().iter().all(|event| event.approval_id() == approval.id()));
    }

    #[test]
    fn events_serialize_with_kind_tag() {
        let approval =
            Approval::create(ContractId("C-2".to_string()), &[StepDefinition::user("U42")])
                .expect("valid definition");
        let event = WorkflowEvent::step_activated(&approval, &approval.steps()[0], approval.created_at());

        let json = serde_json::to_value(&event).expect("serialize event");
        assert_eq!(json["kind"], "step_activated");
        assert_eq!(json["step_order"], 1);
        assert_eq!(json["binding"]["kind"], "user");
        assert_eq!(json["binding"]["value"], "U42");

        TracingEventSink.emit(event);
    }
}
