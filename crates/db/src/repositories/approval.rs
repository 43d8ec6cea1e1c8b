use std::collections::{BTreeSet, HashMap};

use countersign_core::approvals::normalize_role;
use countersign_core::chrono::{DateTime, SecondsFormat, Utc};
use countersign_core::domain::approval::{
    Approval, ApprovalId, ApprovalRecord, ApprovalStatus, ApprovalStep, ApproverBinding,
    ContractId, Principal, StepId, StepStatus,
};
use countersign_core::domain::paging::{PageRequest, PagedResult};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection};

use super::{ApprovalRepository, RepositoryError};
use crate::DbPool;

const APPROVAL_COLUMNS: &str = "a.id, a.contract_id, a.status, a.cancellation_reason, a.version,
     a.is_archived, a.created_at, a.updated_at";

pub struct SqlApprovalRepository {
    pool: DbPool,
}

impl SqlApprovalRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn column<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T, RepositoryError>
where
    T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
{
    row.try_get(name).map_err(|e| RepositoryError::Decode(e.to_string()))
}

fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(name: &str, value: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Decode(format!("{name} `{value}`: {e}")))
}

fn decode_version(value: i64) -> Result<u32, RepositoryError> {
    u32::try_from(value).map_err(|_| RepositoryError::Decode(format!("version `{value}` out of range")))
}

fn row_to_step(row: &SqliteRow) -> Result<ApprovalStep, RepositoryError> {
    let status_str: String = column(row, "status")?;
    let status = StepStatus::parse(&status_str)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown step status `{status_str}`")))?;
    let binding =
        ApproverBinding::from_columns(column(row, "approver_user_id")?, column(row, "approver_role")?)
            .map_err(RepositoryError::Decode)?;
    let step_order: i64 = column(row, "step_order")?;
    let actioned_at = column::<Option<String>>(row, "actioned_at")?
        .map(|value| parse_timestamp("actioned_at", &value))
        .transpose()?;

    Ok(ApprovalStep {
        id: StepId(column(row, "id")?),
        approval_id: ApprovalId(column(row, "approval_id")?),
        step_order: u32::try_from(step_order).map_err(|_| {
            RepositoryError::Decode(format!("step_order `{step_order}` out of range"))
        })?,
        binding,
        status,
        actioned_by_user_id: column(row, "actioned_by_user_id")?,
        actioned_at,
        comments: column(row, "comments")?,
    })
}

fn row_to_record(row: &SqliteRow, steps: Vec<ApprovalStep>) -> Result<ApprovalRecord, RepositoryError> {
    let status_str: String = column(row, "status")?;
    let status = ApprovalStatus::parse(&status_str)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown approval status `{status_str}`")))?;
    let created_at: String = column(row, "created_at")?;
    let updated_at: String = column(row, "updated_at")?;

    Ok(ApprovalRecord {
        id: ApprovalId(column(row, "id")?),
        contract_id: ContractId(column(row, "contract_id")?),
        status,
        steps,
        cancellation_reason: column(row, "cancellation_reason")?,
        version: decode_version(column(row, "version")?)?,
        is_archived: column(row, "is_archived")?,
        created_at: parse_timestamp("created_at", &created_at)?,
        updated_at: parse_timestamp("updated_at", &updated_at)?,
    })
}

async fn load_steps(
    conn: &mut SqliteConnection,
    approval_ids: &[String],
) -> Result<HashMap<String, Vec<ApprovalStep>>, RepositoryError> {
    let mut steps: HashMap<String, Vec<ApprovalStep>> = HashMap::new();
    if approval_ids.is_empty() {
        return Ok(steps);
    }

    let mut builder = QueryBuilder::<Sqlite>::new(
        "SELECT id, approval_id, step_order, approver_user_id, approver_role, status,
                actioned_by_user_id, actioned_at, comments
         FROM approval_step WHERE approval_id IN (",
    );
    let mut separated = builder.separated(", ");
    for id in approval_ids {
        separated.push_bind(id.as_str());
    }
    builder.push(") ORDER BY approval_id, step_order");

    let rows = builder.build().fetch_all(&mut *conn).await?;
    for row in &rows {
        let step = row_to_step(row)?;
        steps.entry(step.approval_id.0.clone()).or_default().push(step);
    }
    Ok(steps)
}

/// Turns approval rows into restored aggregates, keeping row order.
async fn hydrate(
    conn: &mut SqliteConnection,
    rows: &[SqliteRow],
) -> Result<Vec<Approval>, RepositoryError> {
    let ids = rows.iter().map(|row| column::<String>(row, "id")).collect::<Result<Vec<_>, _>>()?;
    let mut steps = load_steps(conn, &ids).await?;

    rows.iter()
        .zip(&ids)
        .map(|(row, id)| {
            let record = row_to_record(row, steps.remove(id).unwrap_or_default())?;
            Approval::restore(record).map_err(RepositoryError::Restore)
        })
        .collect()
}

/// Restricts `a`/`s` to pending approvals whose active step the principal is bound to.
fn push_actionable_filter(builder: &mut QueryBuilder<'_, Sqlite>, principal: &Principal) {
    let roles: BTreeSet<String> = principal
        .roles
        .iter()
        .map(|role| normalize_role(role))
        .filter(|role| !role.is_empty())
        .collect();

    builder.push(
        " FROM approval a
          JOIN approval_step s ON s.approval_id = a.id
          WHERE a.status = 'pending'
            AND a.is_archived = 0
            AND s.status = 'pending'
            AND NOT EXISTS (
                SELECT 1 FROM approval_step earlier
                WHERE earlier.approval_id = a.id
                  AND earlier.status = 'pending'
                  AND earlier.step_order < s.step_order
            )
            AND (s.approver_user_id = ",
    );
    builder.push_bind(principal.user_id.clone());

    if !roles.is_empty() {
        builder.push(" OR (s.approver_user_id IS NULL AND lower(s.approver_role) IN (");
        let mut separated = builder.separated(", ");
        for role in roles {
            separated.push_bind(role);
        }
        builder.push("))");
    }
    builder.push(")");
}

fn map_insert_error(error: sqlx::Error, contract_id: &ContractId) -> RepositoryError {
    if let sqlx::Error::Database(db_err) = &error {
        if db_err.is_unique_violation() && db_err.message().contains("contract_id") {
            return RepositoryError::DuplicatePending { contract_id: contract_id.clone() };
        }
    }
    RepositoryError::Database(error)
}

#[async_trait::async_trait]
impl ApprovalRepository for SqlApprovalRepository {
    async fn find_by_id(&self, id: &ApprovalId) -> Result<Option<Approval>, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&format!("SELECT {APPROVAL_COLUMNS} FROM approval a WHERE a.id = ?"))
            .bind(&id.0)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut approvals = hydrate(&mut *tx, std::slice::from_ref(&row)).await?;
        tx.commit().await?;
        Ok(approvals.pop())
    }

    async fn insert(&self, approval: &Approval) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO approval (id, contract_id, status, cancellation_reason, version,
                                   is_archived, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&approval.id().0)
        .bind(&approval.contract_id().0)
        .bind(approval.status().as_str())
        .bind(approval.cancellation_reason())
        .bind(i64::from(approval.version()))
        .bind(approval.is_archived())
        .bind(format_timestamp(approval.created_at()))
        .bind(format_timestamp(approval.updated_at()))
        .execute(&mut *tx)
        .await
        .map_err(|error| map_insert_error(error, approval.contract_id()))?;

        for step in approval.steps() {
            sqlx::query(
                "INSERT INTO approval_step (id, approval_id, step_order, approver_user_id,
                                            approver_role, status, actioned_by_user_id,
                                            actioned_at, comments)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&step.id.0)
            .bind(&step.approval_id.0)
            .bind(i64::from(step.step_order))
            .bind(step.approver_user_id())
            .bind(step.approver_role())
            .bind(step.status.as_str())
            .bind(step.actioned_by_user_id.as_deref())
            .bind(step.actioned_at.map(format_timestamp))
            .bind(step.comments.as_deref())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn update(
        &self,
        approval: &Approval,
        expected_version: u32,
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE approval
             SET status = ?, cancellation_reason = ?, version = ?, is_archived = ?, updated_at = ?
             WHERE id = ? AND version = ?",
        )
        .bind(approval.status().as_str())
        .bind(approval.cancellation_reason())
        .bind(i64::from(approval.version()))
        .bind(approval.is_archived())
        .bind(format_timestamp(approval.updated_at()))
        .bind(&approval.id().0)
        .bind(i64::from(expected_version))
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::VersionConflict {
                approval_id: approval.id().clone(),
                expected_version,
            });
        }

        for step in approval.steps() {
            let updated = sqlx::query(
                "UPDATE approval_step
                 SET status = ?, actioned_by_user_id = ?, actioned_at = ?, comments = ?
                 WHERE id = ? AND approval_id = ?",
            )
            .bind(step.status.as_str())
            .bind(step.actioned_by_user_id.as_deref())
            .bind(step.actioned_at.map(format_timestamp))
            .bind(step.comments.as_deref())
            .bind(&step.id.0)
            .bind(&step.approval_id.0)
            .execute(&mut *tx)
            .await?;

            if updated.rows_affected() == 0 {
                return Err(RepositoryError::Decode(format!(
                    "step {} of approval {} is missing from storage",
                    step.id,
                    approval.id()
                )));
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn find_pending_for_contract(
        &self,
        contract_id: &ContractId,
    ) -> Result<Option<Approval>, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&format!(
            "SELECT {APPROVAL_COLUMNS} FROM approval a
             WHERE a.contract_id = ? AND a.status = 'pending' AND a.is_archived = 0"
        ))
        .bind(&contract_id.0)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut approvals = hydrate(&mut *tx, std::slice::from_ref(&row)).await?;
        tx.commit().await?;
        Ok(approvals.pop())
    }

    async fn list_for_contract(
        &self,
        contract_id: &ContractId,
    ) -> Result<Vec<Approval>, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(&format!(
            "SELECT {APPROVAL_COLUMNS} FROM approval a
             WHERE a.contract_id = ? AND a.is_archived = 0
             ORDER BY a.created_at DESC, a.id DESC"
        ))
        .bind(&contract_id.0)
        .fetch_all(&mut *tx)
        .await?;

        let approvals = hydrate(&mut *tx, &rows).await?;
        tx.commit().await?;
        Ok(approvals)
    }

    async fn list_pending_for_approver(
        &self,
        principal: &Principal,
        page: PageRequest,
    ) -> Result<PagedResult<Approval>, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let mut count_query = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) AS count");
        push_actionable_filter(&mut count_query, principal);
        let total: i64 = count_query.build().fetch_one(&mut *tx).await?.try_get("count")?;

        let mut page_query = QueryBuilder::<Sqlite>::new(format!("SELECT {APPROVAL_COLUMNS}"));
        push_actionable_filter(&mut page_query, principal);
        page_query.push(" ORDER BY a.created_at DESC, a.id DESC LIMIT ");
        page_query.push_bind(i64::from(page.limit()));
        page_query.push(" OFFSET ");
        page_query.push_bind(i64::try_from(page.offset()).unwrap_or(i64::MAX));
        let rows = page_query.build().fetch_all(&mut *tx).await?;

        let approvals = hydrate(&mut *tx, &rows).await?;
        tx.commit().await?;

        Ok(PagedResult::new(approvals, page, u64::try_from(total).unwrap_or_default()))
    }
}
