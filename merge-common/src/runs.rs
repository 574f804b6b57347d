//! Run bookkeeping: one row per import in `kunden_import_runs`, doubling as the guard that keeps
//! two merges of the same import from running at once.
use std::time;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use thiserror::Error;

use crate::error::DatabaseError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "merge_status")]
#[sqlx(rename_all = "lowercase")]
pub enum MergeStatus {
    /// Staged, waiting to be merged.
    Pending,
    /// Claimed by a merge.
    Running,
    Merged,
    Failed,
}

#[derive(Error, Debug)]
pub enum RunError {
    #[error("import {0} does not exist")]
    NotFound(i64),
    #[error("import {0} has already been merged")]
    AlreadyMerged(i64),
    #[error("import {0} is being merged by another run")]
    InProgress(i64),
    #[error("import {0} is not claimed by a running merge")]
    NotRunning(i64),
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct ImportRun {
    pub import_id: i64,
    pub imported_at: DateTime<Utc>,
    pub imported_by: String,
    pub file_name: Option<String>,
    pub staged_rows: i64,
    pub inserted_rows: i64,
    pub updated_rows: i64,
    pub deactivated_rows: i64,
    pub error_rows: i64,
    pub merged: bool,
    pub merge_status: MergeStatus,
    pub merge_started_at: Option<DateTime<Utc>>,
    pub merged_at: Option<DateTime<Utc>>,
    pub failed_stage: Option<String>,
    pub failure_reason: Option<String>,
}

/// Registered by the staging producer once all rows of an import are staged.
#[derive(Debug, Clone)]
pub struct NewImportRun {
    pub import_id: i64,
    pub imported_at: DateTime<Utc>,
    pub imported_by: String,
    pub file_name: Option<String>,
    pub staged_rows: i64,
}

/// Effect of a merge on the registry, recorded on completion or failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunCounts {
    pub inserted: u64,
    pub updated: u64,
    pub deactivated: u64,
    pub with_errors: u64,
}

fn to_db(count: u64) -> i64 {
    i64::try_from(count).unwrap_or(i64::MAX)
}

#[async_trait]
pub trait RunStore {
    /// Atomically move a pending or failed import to running.
    async fn claim(&self, import_id: i64) -> Result<ImportRun, RunError>;

    /// Claim the oldest pending import, if there is one.
    async fn claim_next(&self) -> Result<Option<ImportRun>, RunError>;

    /// Mark a running import as merged.
    async fn complete(&self, import_id: i64, counts: &RunCounts) -> Result<(), RunError>;

    /// Mark a running import as failed in `stage`.
    async fn fail(
        &self,
        import_id: i64,
        stage: &str,
        reason: &str,
        counts: &RunCounts,
    ) -> Result<(), RunError>;

    /// Put imports that have been running for longer than `timeout` back to pending.
    async fn release_stalled(&self, timeout: time::Duration) -> Result<u64, RunError>;
}

#[derive(Clone)]
pub struct PgRunStore {
    pool: PgPool,
}

impl PgRunStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn register(&self, run: &NewImportRun) -> Result<(), RunError> {
        let base_query = r#"
INSERT INTO kunden_import_runs
    (import_id, imported_at, imported_by, file_name, staged_rows)
VALUES
    ($1, $2, $3, $4, $5)
        "#;

        sqlx::query(base_query)
            .bind(run.import_id)
            .bind(run.imported_at)
            .bind(&run.imported_by)
            .bind(&run.file_name)
            .bind(run.staged_rows)
            .execute(&self.pool)
            .await
            .map_err(|error| DatabaseError::query("INSERT", error))?;

        Ok(())
    }

    pub async fn get(&self, import_id: i64) -> Result<Option<ImportRun>, RunError> {
        let run = sqlx::query_as("SELECT * FROM kunden_import_runs WHERE import_id = $1")
            .bind(import_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| DatabaseError::query("SELECT", error))?;

        Ok(run)
    }
}

#[async_trait]
impl RunStore for PgRunStore {
    async fn claim(&self, import_id: i64) -> Result<ImportRun, RunError> {
        let base_query = r#"
UPDATE
    kunden_import_runs
SET
    merge_status = 'running'::merge_status,
    merge_started_at = NOW(),
    failed_stage = NULL,
    failure_reason = NULL
WHERE
    import_id = $1
    AND merge_status IN ('pending'::merge_status, 'failed'::merge_status)
RETURNING
    *
        "#;

        let claimed: Option<ImportRun> = sqlx::query_as(base_query)
            .bind(import_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| DatabaseError::query("UPDATE", error))?;

        if let Some(run) = claimed {
            return Ok(run);
        }

        match self.get(import_id).await? {
            None => Err(RunError::NotFound(import_id)),
            Some(run) if run.merge_status == MergeStatus::Merged => {
                Err(RunError::AlreadyMerged(import_id))
            }
            Some(_) => Err(RunError::InProgress(import_id)),
        }
    }

    async fn claim_next(&self) -> Result<Option<ImportRun>, RunError> {
        let base_query = r#"
WITH next_pending AS (
    SELECT
        import_id
    FROM
        kunden_import_runs
    WHERE
        merge_status = 'pending'::merge_status
    ORDER BY
        imported_at
    LIMIT 1
    FOR UPDATE SKIP LOCKED
)
UPDATE
    kunden_import_runs
SET
    merge_status = 'running'::merge_status,
    merge_started_at = NOW()
FROM
    next_pending
WHERE
    kunden_import_runs.import_id = next_pending.import_id
RETURNING
    kunden_import_runs.*
        "#;

        let run = sqlx::query_as(base_query)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| DatabaseError::query("UPDATE", error))?;

        Ok(run)
    }

    async fn complete(&self, import_id: i64, counts: &RunCounts) -> Result<(), RunError> {
        let base_query = r#"
UPDATE
    kunden_import_runs
SET
    merge_status = 'merged'::merge_status,
    merged = TRUE,
    merged_at = NOW(),
    inserted_rows = $2,
    updated_rows = $3,
    deactivated_rows = $4,
    error_rows = $5
WHERE
    import_id = $1
    AND merge_status = 'running'::merge_status
        "#;

        let result = sqlx::query(base_query)
            .bind(import_id)
            .bind(to_db(counts.inserted))
            .bind(to_db(counts.updated))
            .bind(to_db(counts.deactivated))
            .bind(to_db(counts.with_errors))
            .execute(&self.pool)
            .await
            .map_err(|error| DatabaseError::query("UPDATE", error))?;

        if result.rows_affected() == 0 {
            return Err(RunError::NotRunning(import_id));
        }
        Ok(())
    }

    async fn fail(
        &self,
        import_id: i64,
        stage: &str,
        reason: &str,
        counts: &RunCounts,
    ) -> Result<(), RunError> {
        let base_query = r#"
UPDATE
    kunden_import_runs
SET
    merge_status = 'failed'::merge_status,
    merged = FALSE,
    failed_stage = $2,
    failure_reason = $3,
    inserted_rows = $4,
    updated_rows = $5,
    deactivated_rows = $6,
    error_rows = $7
WHERE
    import_id = $1
    AND merge_status = 'running'::merge_status
        "#;

        let result = sqlx::query(base_query)
            .bind(import_id)
            .bind(stage)
            .bind(reason)
            .bind(to_db(counts.inserted))
            .bind(to_db(counts.updated))
            .bind(to_db(counts.deactivated))
            .bind(to_db(counts.with_errors))
            .execute(&self.pool)
            .await
            .map_err(|error| DatabaseError::query("UPDATE", error))?;

        if result.rows_affected() == 0 {
            return Err(RunError::NotRunning(import_id));
        }
        Ok(())
    }

    async fn release_stalled(&self, timeout: time::Duration) -> Result<u64, RunError> {
        let base_query = r#"
UPDATE
    kunden_import_runs
SET
    merge_status = 'pending'::merge_status,
    merge_started_at = NULL
WHERE
    merge_status = 'running'::merge_status
    AND merge_started_at < NOW() - make_interval(secs => $1)
        "#;

        let result = sqlx::query(base_query)
            .bind(timeout.as_secs_f64())
            .execute(&self.pool)
            .await
            .map_err(|error| DatabaseError::query("UPDATE", error))?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_run(import_id: i64, imported_at: DateTime<Utc>) -> NewImportRun {
        NewImportRun {
            import_id,
            imported_at,
            imported_by: "sachbearbeitung".to_owned(),
            file_name: Some("kunden.xlsx".to_owned()),
            staged_rows: 10,
        }
    }

    #[test]
    fn test_to_db_saturates() {
        assert_eq!(to_db(42), 42);
        assert_eq!(to_db(u64::MAX), i64::MAX);
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires PostgreSQL with PostGIS"]
    async fn test_claim_guards_against_second_merge(db: PgPool) {
        let store = PgRunStore::new(db);
        store.register(&new_run(1, Utc::now())).await.expect("failed to register run");

        let run = store.claim(1).await.expect("first claim should succeed");
        assert_eq!(run.merge_status, MergeStatus::Running);
        assert!(run.merge_started_at.is_some());

        assert!(matches!(store.claim(1).await, Err(RunError::InProgress(1))));
        assert!(matches!(store.claim(2).await, Err(RunError::NotFound(2))));
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires PostgreSQL with PostGIS"]
    async fn test_complete_records_counts(db: PgPool) {
        let store = PgRunStore::new(db);
        store.register(&new_run(1, Utc::now())).await.expect("failed to register run");
        store.claim(1).await.expect("claim failed");

        let counts = RunCounts {
            inserted: 3,
            updated: 2,
            deactivated: 1,
            with_errors: 4,
        };
        store.complete(1, &counts).await.expect("complete failed");

        let run = store.get(1).await.expect("get failed").expect("run should exist");
        assert!(run.merged);
        assert_eq!(run.merge_status, MergeStatus::Merged);
        assert_eq!(run.inserted_rows, 3);
        assert_eq!(run.updated_rows, 2);
        assert_eq!(run.deactivated_rows, 1);
        assert_eq!(run.error_rows, 4);
        assert!(run.merged_at.is_some());
        assert!(matches!(store.claim(1).await, Err(RunError::AlreadyMerged(1))));
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires PostgreSQL with PostGIS"]
    async fn test_failed_run_can_be_claimed_again(db: PgPool) {
        let store = PgRunStore::new(db);
        store.register(&new_run(1, Utc::now())).await.expect("failed to register run");
        store.claim(1).await.expect("claim failed");

        let counts = RunCounts {
            inserted: 200,
            ..Default::default()
        };
        store
            .fail(1, "write_customers", "connection reset", &counts)
            .await
            .expect("fail failed");

        let run = store.get(1).await.expect("get failed").expect("run should exist");
        assert!(!run.merged);
        assert_eq!(run.merge_status, MergeStatus::Failed);
        assert_eq!(run.failed_stage.as_deref(), Some("write_customers"));
        assert_eq!(run.inserted_rows, 200);

        // Only explicit claims pick up failed runs.
        assert!(store.claim_next().await.expect("claim_next failed").is_none());
        let reclaimed = store.claim(1).await.expect("reclaim failed");
        assert_eq!(reclaimed.failed_stage, None);
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires PostgreSQL with PostGIS"]
    async fn test_claim_next_takes_oldest_pending(db: PgPool) {
        let store = PgRunStore::new(db);
        let now = Utc::now();
        store
            .register(&new_run(2, now))
            .await
            .expect("failed to register run");
        store
            .register(&new_run(1, now - chrono::Duration::minutes(5)))
            .await
            .expect("failed to register run");

        let first = store.claim_next().await.expect("claim_next failed").expect("run expected");
        let second = store.claim_next().await.expect("claim_next failed").expect("run expected");

        assert_eq!(first.import_id, 1);
        assert_eq!(second.import_id, 2);
        assert!(store.claim_next().await.expect("claim_next failed").is_none());
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires PostgreSQL with PostGIS"]
    async fn test_release_stalled(db: PgPool) {
        let store = PgRunStore::new(db.clone());
        store.register(&new_run(1, Utc::now())).await.expect("failed to register run");
        store.claim(1).await.expect("claim failed");
        sqlx::query(
            "UPDATE kunden_import_runs SET merge_started_at = NOW() - INTERVAL '2 hours' WHERE import_id = 1",
        )
        .execute(&db)
        .await
        .expect("failed to age run");

        let released = store
            .release_stalled(time::Duration::from_secs(3600))
            .await
            .expect("release failed");

        assert_eq!(released, 1);
        let run = store.get(1).await.expect("get failed").expect("run should exist");
        assert_eq!(run.merge_status, MergeStatus::Pending);
    }
}
