//! Execution audit log.
//!
//! A record is inserted once in `STARTED` and moved exactly once to a terminal
//! status. The end transition is a conditional update on `status = 'STARTED'`,
//! so a second `end_run` for the same id matches nothing and is reported as
//! [`LoadCtlError::UnknownExecutionId`].

use chrono::{DateTime, Utc};
use libsql::params;
use loadctl_shared::{
    ExecutionId, ExecutionRecord, LoadCtlError, NewRun, Result, RunFilter, RunOutcome, RunStatus,
    SourceId,
};
use uuid::Uuid;

use crate::{
    Storage, db_err, get_i64, get_opt_i64, get_opt_string, get_string, now_ts, parse_ts, to_ts,
};

const EXECUTION_COLUMNS: &str = "execution_id, source_id, run_id, pipeline_name, activity_name, \
     status, started_at, completed_at, rows_processed, rows_failed, error_message";

impl Storage {
    /// Insert a fresh `STARTED` record and return its id.
    pub async fn start_run(&self, run: &NewRun) -> Result<ExecutionId> {
        self.check_writable()?;
        let id = ExecutionId::new();
        let id_str = id.to_string();

        self.conn
            .execute(
                "INSERT INTO execution_log
                   (execution_id, source_id, run_id, pipeline_name, activity_name, status, started_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    id_str.as_str(),
                    run.source_id.map(|s| s.0),
                    run.run_id.as_deref(),
                    run.pipeline_name.as_str(),
                    run.activity_name.as_str(),
                    RunStatus::Started.as_str(),
                    now_ts(),
                ],
            )
            .await
            .map_err(db_err)?;

        tracing::info!(
            execution_id = %id,
            pipeline = %run.pipeline_name,
            activity = %run.activity_name,
            source_id = ?run.source_id,
            run_id = ?run.run_id,
            "run started"
        );
        Ok(id)
    }

    /// Move a `STARTED` record to its terminal outcome.
    ///
    /// Exactly one row must match; an unknown or already-terminal id fails
    /// with [`LoadCtlError::UnknownExecutionId`]. The completion timestamp is
    /// never earlier than the start timestamp.
    pub async fn end_run(&self, id: ExecutionId, outcome: &RunOutcome) -> Result<ExecutionRecord> {
        self.check_writable()?;
        let status = RunStatus::from(outcome.status);
        let id_str = id.to_string();

        let mut rows = self
            .conn
            .query(
                &format!(
                    "UPDATE execution_log
                     SET status = ?2,
                         completed_at = CASE WHEN ?3 < started_at THEN started_at ELSE ?3 END,
                         rows_processed = ?4,
                         rows_failed = ?5,
                         error_message = ?6
                     WHERE execution_id = ?1 AND status = 'STARTED'
                     RETURNING {EXECUTION_COLUMNS}"
                ),
                params![
                    id_str.as_str(),
                    status.as_str(),
                    now_ts(),
                    row_count(outcome.rows_processed)?,
                    row_count(outcome.rows_failed)?,
                    outcome.error_message.as_deref(),
                ],
            )
            .await
            .map_err(db_err)?;

        let record = match rows.next().await.map_err(db_err)? {
            Some(row) => row_to_execution(&row)?,
            None => {
                tracing::warn!(execution_id = %id, "end_run matched no open execution");
                return Err(LoadCtlError::UnknownExecutionId(id));
            }
        };

        tracing::info!(
            execution_id = %id,
            status = %record.status,
            rows_processed = record.rows_processed,
            rows_failed = record.rows_failed,
            "run ended"
        );
        Ok(record)
    }

    /// Fetch one execution record.
    pub async fn get_execution(&self, id: ExecutionId) -> Result<Option<ExecutionRecord>> {
        let id_str = id.to_string();
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {EXECUTION_COLUMNS} FROM execution_log WHERE execution_id = ?1"),
                params![id_str.as_str()],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row_to_execution(&row)?)),
            None => Ok(None),
        }
    }

    /// Run history matching `filter`, newest first.
    pub async fn list_executions(&self, filter: &RunFilter) -> Result<Vec<ExecutionRecord>> {
        let limit = filter.limit.map(i64::from).unwrap_or(-1);
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {EXECUTION_COLUMNS} FROM execution_log
                     WHERE (?1 IS NULL OR source_id = ?1)
                       AND (?2 IS NULL OR pipeline_name = ?2)
                       AND (?3 IS NULL OR run_id = ?3)
                       AND (?4 IS NULL OR status = ?4)
                     ORDER BY started_at DESC, execution_id DESC
                     LIMIT ?5"
                ),
                params![
                    filter.source_id.map(|s| s.0),
                    filter.pipeline_name.as_deref(),
                    filter.run_id.as_deref(),
                    filter.status.map(|s| s.as_str()),
                    limit,
                ],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(row_to_execution(&row)?);
        }
        Ok(results)
    }

    /// `STARTED` records that began before `started_before`, oldest first.
    pub async fn list_open_runs(&self, started_before: DateTime<Utc>) -> Result<Vec<ExecutionRecord>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {EXECUTION_COLUMNS} FROM execution_log
                     WHERE status = 'STARTED' AND started_at < ?1
                     ORDER BY started_at, execution_id"
                ),
                params![to_ts(started_before)],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(row_to_execution(&row)?);
        }
        Ok(results)
    }
}

fn row_count(n: u64) -> Result<i64> {
    i64::try_from(n).map_err(|_| LoadCtlError::invalid(format!("row count {n} is out of range")))
}

/// Convert a database row to an [`ExecutionRecord`].
fn row_to_execution(row: &libsql::Row) -> Result<ExecutionRecord> {
    let id = get_string(row, 0)?;
    Ok(ExecutionRecord {
        execution_id: ExecutionId(
            Uuid::parse_str(&id)
                .map_err(|e| LoadCtlError::parse(format!("invalid execution id '{id}': {e}")))?,
        ),
        source_id: get_opt_i64(row, 1)?.map(SourceId),
        run_id: get_opt_string(row, 2)?,
        pipeline_name: get_string(row, 3)?,
        activity_name: get_string(row, 4)?,
        status: get_string(row, 5)?.parse()?,
        started_at: parse_ts(&get_string(row, 6)?)?,
        completed_at: get_opt_string(row, 7)?
            .map(|s| parse_ts(&s))
            .transpose()?,
        rows_processed: get_i64(row, 8)?.max(0) as u64,
        rows_failed: get_i64(row, 9)?.max(0) as u64,
        error_message: get_opt_string(row, 10)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use crate::test_support::*;
    use loadctl_shared::{
        ExecutionId, LoadCtlError, NewRun, RunFilter, RunOutcome, RunStatus, SourceId,
    };

    #[tokio::test]
    async fn start_creates_open_record() {
        let storage = test_storage().await;
        let id = storage
            .start_run(&NewRun::new("pl_orders", "copy_orders"))
            .await
            .expect("start");

        let record = storage.get_execution(id).await.unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Started);
        assert_eq!(record.completed_at, None);
        assert_eq!(record.source_id, None);
        assert_eq!(record.pipeline_name, "pl_orders");
        assert_eq!(record.rows_processed, 0);
    }

    #[tokio::test]
    async fn end_updates_only_target_row() {
        let storage = test_storage().await;
        let source = registered(&storage, "orders").await;
        let id = storage
            .start_run(
                &NewRun::new("pl_orders", "copy_orders")
                    .for_source(source)
                    .with_run_id("adf-run-1"),
            )
            .await
            .unwrap();
        let other = storage
            .start_run(&NewRun::new("pl_orders", "copy_customers"))
            .await
            .unwrap();

        let record = storage
            .end_run(id, &RunOutcome::success(1000))
            .await
            .expect("end");
        assert_eq!(record.status, RunStatus::Success);
        assert_eq!(record.rows_processed, 1000);
        assert_eq!(record.rows_failed, 0);
        assert_eq!(record.source_id, Some(source));
        assert_eq!(record.run_id.as_deref(), Some("adf-run-1"));
        let completed = record.completed_at.expect("completed_at set");
        assert!(completed >= record.started_at);

        let untouched = storage.get_execution(other).await.unwrap().unwrap();
        assert_eq!(untouched.status, RunStatus::Started);
        assert_eq!(untouched.completed_at, None);
    }

    #[tokio::test]
    async fn second_end_is_rejected() {
        let storage = test_storage().await;
        let id = storage
            .start_run(&NewRun::new("pl_orders", "copy_orders"))
            .await
            .unwrap();
        storage.end_run(id, &RunOutcome::success(10)).await.unwrap();

        let err = storage
            .end_run(id, &RunOutcome::failed("late failure"))
            .await
            .unwrap_err();
        assert!(matches!(err, LoadCtlError::UnknownExecutionId(e) if e == id));

        let record = storage.get_execution(id).await.unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Success);
        assert_eq!(record.error_message, None);
    }

    #[tokio::test]
    async fn end_of_unknown_id_is_rejected() {
        let storage = test_storage().await;
        let err = storage
            .end_run(ExecutionId::new(), &RunOutcome::success(1))
            .await
            .unwrap_err();
        assert!(matches!(err, LoadCtlError::UnknownExecutionId(_)));
    }

    #[tokio::test]
    async fn failure_and_quarantine_keep_metrics() {
        let storage = test_storage().await;
        let failed = storage
            .start_run(&NewRun::new("pl_orders", "copy_orders"))
            .await
            .unwrap();
        let record = storage
            .end_run(failed, &RunOutcome::failed("source unreachable"))
            .await
            .unwrap();
        assert_eq!(record.status, RunStatus::Failed);
        assert_eq!(record.error_message.as_deref(), Some("source unreachable"));

        let quarantined = storage
            .start_run(&NewRun::new("pl_orders", "validate_orders"))
            .await
            .unwrap();
        let record = storage
            .end_run(quarantined, &RunOutcome::quarantined(480, 20))
            .await
            .unwrap();
        assert_eq!(record.status, RunStatus::Quarantined);
        assert_eq!(record.rows_failed, 20);
    }

    #[tokio::test]
    async fn unknown_source_reference_is_a_constraint_violation() {
        let storage = test_storage().await;
        let err = storage
            .start_run(&NewRun::new("pl_orders", "copy_orders").for_source(SourceId(404)))
            .await
            .unwrap_err();
        assert!(matches!(err, LoadCtlError::ConstraintViolation(_)));
    }

    #[tokio::test]
    async fn terminal_records_are_immutable_in_storage() {
        let storage = test_storage().await;
        let id = storage
            .start_run(&NewRun::new("pl_orders", "copy_orders"))
            .await
            .unwrap();
        storage.end_run(id, &RunOutcome::success(5)).await.unwrap();

        let err = storage
            .conn
            .execute(
                "UPDATE execution_log SET rows_processed = 6 WHERE execution_id = ?1",
                libsql::params![id.to_string()],
            )
            .await
            .map_err(crate::db_err)
            .unwrap_err();
        assert!(matches!(err, LoadCtlError::ConstraintViolation(_)));
    }

    #[tokio::test]
    async fn history_filters_and_orders_newest_first() {
        let storage = test_storage().await;
        let orders = registered(&storage, "orders").await;
        let customers = registered(&storage, "customers").await;

        let first = storage
            .start_run(&NewRun::new("pl_daily", "copy_orders").for_source(orders))
            .await
            .unwrap();
        storage
            .end_run(first, &RunOutcome::failed("timeout"))
            .await
            .unwrap();
        // Retry is a new record, not a reopened one.
        let retry = storage
            .start_run(&NewRun::new("pl_daily", "copy_orders").for_source(orders))
            .await
            .unwrap();
        storage
            .start_run(&NewRun::new("pl_daily", "copy_customers").for_source(customers))
            .await
            .unwrap();

        let history = storage
            .list_executions(&RunFilter {
                source_id: Some(orders),
                ..Default::default()
            })
            .await
            .unwrap();
        let ids: Vec<ExecutionId> = history.iter().map(|r| r.execution_id).collect();
        assert_eq!(ids, vec![retry, first]);

        let failed = storage
            .list_executions(&RunFilter {
                status: Some(RunStatus::Failed),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].execution_id, first);

        let limited = storage
            .list_executions(&RunFilter {
                pipeline_name: Some("pl_daily".into()),
                limit: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn open_runs_are_listed_until_ended() {
        let storage = test_storage().await;
        let open = storage
            .start_run(&NewRun::new("pl_orders", "copy_orders"))
            .await
            .unwrap();
        let closed = storage
            .start_run(&NewRun::new("pl_orders", "copy_customers"))
            .await
            .unwrap();
        storage.end_run(closed, &RunOutcome::success(1)).await.unwrap();

        let later = Utc::now() + Duration::seconds(1);
        let ids: Vec<ExecutionId> = storage
            .list_open_runs(later)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.execution_id)
            .collect();
        assert_eq!(ids, vec![open]);

        let earlier = Utc::now() - Duration::hours(1);
        assert!(storage.list_open_runs(earlier).await.unwrap().is_empty());
    }
}
