use sqlx::migrate::{MigrateError, Migrator};

use crate::DbPool;

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

pub async fn run_pending(pool: &DbPool) -> Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}

#[cfg(test)]
mod tests {
    use sqlx::Row;

    use super::run_pending;
    use crate::{connect_with_settings, migrations::MIGRATOR};

    const MANAGED_SCHEMA_OBJECTS: &[&str] = &[
        "approval",
        "approval_step",
        "idx_approval_pending_contract",
        "idx_approval_contract_created",
        "idx_approval_status_created",
        "idx_approval_step_approval_status",
        "idx_approval_step_user",
        "idx_approval_step_role",
    ];

    async fn table_count(pool: &sqlx::SqlitePool, table: &str) -> i64 {
        sqlx::query(
            "SELECT COUNT(*) AS count FROM sqlite_master WHERE type = 'table' AND name = ?",
        )
        .bind(table)
        .fetch_one(pool)
        .await
        .expect("check table")
        .get::<i64, _>("count")
    }

    #[tokio::test]
    async fn migrations_create_workflow_tables() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("run migrations");

        assert_eq!(table_count(&pool, "approval").await, 1);
        assert_eq!(table_count(&pool, "approval_step").await, 1);
    }

    #[tokio::test]
    async fn step_binding_check_rejects_both_and_neither() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("run migrations");

        sqlx::query(
            "INSERT INTO approval (id, contract_id, status, created_at, updated_at)
             VALUES ('A-1', 'C-1', 'pending', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
        )
        .execute(&pool)
        .await
        .expect("insert approval");

        let both = sqlx::query(
            "INSERT INTO approval_step (id, approval_id, step_order, approver_user_id, approver_role, status)
             VALUES ('S-1', 'A-1', 1, 'U1', 'CEO', 'pending')",
        )
        .execute(&pool)
        .await;
        assert!(both.is_err(), "step with both bindings must be rejected");

        let neither = sqlx::query(
            "INSERT INTO approval_step (id, approval_id, step_order, status)
             VALUES ('S-2', 'A-1', 1, 'pending')",
        )
        .execute(&pool)
        .await;
        assert!(neither.is_err(), "step without a binding must be rejected");
    }

    #[tokio::test]
    async fn pending_index_allows_one_pending_approval_per_contract() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("run migrations");

        let insert = |id: &'static str, status: &'static str| {
            sqlx::query(
                "INSERT INTO approval (id, contract_id, status, created_at, updated_at)
                 VALUES (?, 'C-1', ?, '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
            )
            .bind(id)
            .bind(status)
        };

        insert("A-1", "rejected").execute(&pool).await.expect("terminal approval");
        insert("A-2", "pending").execute(&pool).await.expect("first pending approval");
        let duplicate = insert("A-3", "pending").execute(&pool).await;

        let unique_violation = matches!(
            duplicate,
            Err(sqlx::Error::Database(ref db_err)) if db_err.is_unique_violation()
        );
        assert!(unique_violation, "second pending approval should violate the partial index");
    }

    #[tokio::test]
    async fn migrations_up_down_up_preserves_schema_signature() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("run migrations");

        let initial_signature = managed_schema_signature(&pool).await;
        assert_eq!(
            initial_signature.len(),
            MANAGED_SCHEMA_OBJECTS.len(),
            "initial migration pass should create all managed schema objects",
        );

        MIGRATOR.undo(&pool, 0).await.expect("undo migrations");
        assert!(
            managed_schema_signature(&pool).await.is_empty(),
            "managed schema objects should be removed after full undo",
        );

        run_pending(&pool).await.expect("re-run migrations");
        assert_eq!(
            managed_schema_signature(&pool).await,
            initial_signature,
            "up/down/up should preserve migration-managed schema signature",
        );
    }

    async fn managed_schema_signature(pool: &sqlx::SqlitePool) -> Vec<(String, String, String)> {
        let mut signature: Vec<(String, String, String)> = sqlx::query(
            "SELECT type, name, IFNULL(sql, '') AS sql
             FROM sqlite_master
             WHERE type IN ('table', 'index')",
        )
        .fetch_all(pool)
        .await
        .expect("load schema objects")
        .into_iter()
        .filter_map(|row| {
            let name = row.get::<String, _>("name");
            if MANAGED_SCHEMA_OBJECTS.contains(&name.as_str()) {
                Some((row.get::<String, _>("type"), name, row.get::<String, _>("sql")))
            } else {
                None
            }
        })
        .collect();
        signature.sort();
        signature
    }
}
