use std::collections::HashMap;

use tokio::sync::RwLock;

use countersign_core::approvals::can_act;
use countersign_core::domain::approval::{
    Approval, ApprovalId, ApprovalStatus, ContractId, Principal,
};
use countersign_core::domain::paging::{PageRequest, PagedResult};

use super::{ApprovalRepository, RepositoryError};

/// Process-local store with the same compare-and-swap semantics as the SQL repository.
/// Version checks happen under the write lock.
#[derive(Default)]
pub struct InMemoryApprovalRepository {
    approvals: RwLock<HashMap<String, Approval>>,
}

fn newest_first(approvals: &mut [Approval]) {
    approvals.sort_by(|left, right| {
        right.created_at().cmp(&left.created_at()).then_with(|| right.id().cmp(left.id()))
    });
}

#[async_trait::async_trait]
impl ApprovalRepository for InMemoryApprovalRepository {
    async fn find_by_id(&self, id: &ApprovalId) -> Result<Option<Approval>, RepositoryError> {
        let approvals = self.approvals.read().await;
        Ok(approvals.get(&id.0).cloned())
    }

    async fn insert(&self, approval: &Approval) -> Result<(), RepositoryError> {
        let mut approvals = self.approvals.write().await;

        let duplicate = approval.status() == ApprovalStatus::Pending
            && approvals.values().any(|existing| {
                existing.contract_id() == approval.contract_id()
                    && existing.status() == ApprovalStatus::Pending
            });
        if duplicate {
            return Err(RepositoryError::DuplicatePending {
                contract_id: approval.contract_id().clone(),
            });
        }

        approvals.insert(approval.id().0.clone(), approval.clone());
        Ok(())
    }

    async fn update(
        &self,
        approval: &Approval,
        expected_version: u32,
    ) -> Result<(), RepositoryError> {
        let mut approvals = self.approvals.write().await;

        match approvals.get_mut(&approval.id().0) {
            Some(stored) if stored.version() == expected_version => {
                *stored = approval.clone();
                Ok(())
            }
            _ => Err(RepositoryError::VersionConflict {
                approval_id: approval.id().clone(),
                expected_version,
            }),
        }
    }

    async fn find_pending_for_contract(
        &self,
        contract_id: &ContractId,
    ) -> Result<Option<Approval>, RepositoryError> {
        let approvals = self.approvals.read().await;
        Ok(approvals
            .values()
            .find(|approval| {
                approval.contract_id() == contract_id
                    && approval.status() == ApprovalStatus::Pending
                    && !approval.is_archived()
            })
            .cloned())
    }

    async fn list_for_contract(
        &self,
        contract_id: &ContractId,
    ) -> Result<Vec<Approval>, RepositoryError> {
        let approvals = self.approvals.read().await;
        let mut history: Vec<Approval> = approvals
            .values()
            .filter(|approval| approval.contract_id() == contract_id && !approval.is_archived())
            .cloned()
            .collect();
        newest_first(&mut history);
        Ok(history)
    }

    async fn list_pending_for_approver(
        &self,
        principal: &Principal,
        page: PageRequest,
    ) -> Result<PagedResult<Approval>, RepositoryError> {
        let approvals = self.approvals.read().await;
        let mut actionable: Vec<Approval> = approvals
            .values()
            .filter(|approval| !approval.is_archived() && can_act(approval, principal))
            .cloned()
            .collect();
        newest_first(&mut actionable);
        Ok(PagedResult::from_ordered(actionable, page))
    }
}
