//! The control-plane operation surface consumed by orchestrators and workers.
//!
//! [`ControlPlane`] owns no state beyond the storage handle and the configured
//! watermark policy. Each operation validates its parameters, resolves source
//! references, and dispatches to [`Storage`].

use std::path::Path;

use chrono::{Duration, Utc};
use tracing::{debug, info, instrument};

use loadctl_shared::{
    AppConfig, ExecutionId, ExecutionRecord, LoadCtlError, NewRun, NewSource, Result, RunFilter,
    RunOutcome, SourceConfig, SourceId, SourceUpdate, Watermark, WatermarkAdvance,
    WatermarkPolicy,
};
use loadctl_storage::Storage;

use crate::plan::ExtractPlan;

/// Composition of the source registry, watermark store, and execution log.
pub struct ControlPlane {
    storage: Storage,
    policy: WatermarkPolicy,
}

impl ControlPlane {
    pub fn new(storage: Storage, policy: WatermarkPolicy) -> Self {
        Self { storage, policy }
    }

    /// Open the control database named by `config` (or `db_path` when given).
    pub async fn open(config: &AppConfig, db_path: Option<&Path>) -> Result<Self> {
        let path = match db_path {
            Some(p) => p.to_path_buf(),
            None => config.database.resolved_path()?,
        };
        debug!(path = %path.display(), "opening control database");

        let storage =
            Storage::open_with_busy_timeout(&path, config.database.busy_timeout_ms).await?;
        Ok(Self::new(storage, config.watermarks.policy))
    }

    /// Open an existing control database for inspection only.
    pub async fn open_readonly(config: &AppConfig, db_path: Option<&Path>) -> Result<Self> {
        let path = match db_path {
            Some(p) => p.to_path_buf(),
            None => config.database.resolved_path()?,
        };
        let storage = Storage::open_readonly(&path).await?;
        storage
            .set_busy_timeout(config.database.busy_timeout_ms)
            .await?;
        Ok(Self::new(storage, config.watermarks.policy))
    }

    pub fn policy(&self) -> WatermarkPolicy {
        self.policy
    }

    // -----------------------------------------------------------------------
    // Source registry
    // -----------------------------------------------------------------------

    /// Active sources ordered by id, or the single active source `id`.
    ///
    /// An unknown id is not an error: it returns an empty list.
    pub async fn get_source_config(&self, id: Option<SourceId>) -> Result<Vec<SourceConfig>> {
        self.storage.get_sources(id).await
    }

    /// Every registered source including deactivated ones.
    pub async fn list_all_sources(&self) -> Result<Vec<SourceConfig>> {
        self.storage.list_all_sources().await
    }

    #[instrument(skip_all, fields(name = %source.name))]
    pub async fn register_source(&self, source: &NewSource) -> Result<SourceId> {
        self.storage.register_source(source).await
    }

    /// Soft-delete a source. Its watermarks and run history are kept.
    #[instrument(skip(self))]
    pub async fn deactivate_source(&self, id: SourceId) -> Result<SourceConfig> {
        self.storage.set_source_active(id, false).await
    }

    #[instrument(skip(self))]
    pub async fn activate_source(&self, id: SourceId) -> Result<SourceConfig> {
        self.storage.set_source_active(id, true).await
    }

    #[instrument(skip(self, update))]
    pub async fn update_source(&self, id: SourceId, update: SourceUpdate) -> Result<SourceConfig> {
        self.storage.update_source(id, update).await
    }

    /// Register configured sources whose names are not yet in the registry.
    ///
    /// Existing names are left as they are. Returns the names registered.
    #[instrument(skip_all, fields(configured = seeds.len()))]
    pub async fn sync_sources(&self, seeds: &[NewSource]) -> Result<Vec<String>> {
        let mut registered = Vec::new();
        for seed in seeds {
            if self
                .storage
                .get_source_by_name(seed.name.trim())
                .await?
                .is_some()
            {
                debug!(name = %seed.name, "source already registered");
                continue;
            }
            match self.storage.register_source(seed).await {
                Ok(_) => registered.push(seed.name.trim().to_string()),
                // Another process registered it since the lookup.
                Err(LoadCtlError::DuplicateSourceName(_)) => {}
                Err(e) => return Err(e),
            }
        }
        info!(registered = registered.len(), "synced sources from config");
        Ok(registered)
    }

    // -----------------------------------------------------------------------
    // Watermarks
    // -----------------------------------------------------------------------

    /// Advance the `(source_id, column)` watermark under the configured policy.
    #[instrument(skip(self))]
    pub async fn advance_watermark(
        &self,
        source_id: SourceId,
        column: &str,
        new_value: &str,
    ) -> Result<WatermarkAdvance> {
        let (column, new_value) = watermark_args(column, new_value)?;
        self.require_active(source_id).await?;
        self.storage
            .advance_watermark(source_id, column, new_value, self.policy)
            .await
    }

    /// Advance only if the stored value still equals `expected`.
    #[instrument(skip(self))]
    pub async fn compare_and_advance_watermark(
        &self,
        source_id: SourceId,
        column: &str,
        expected: Option<&str>,
        new_value: &str,
    ) -> Result<WatermarkAdvance> {
        let (column, new_value) = watermark_args(column, new_value)?;
        self.require_active(source_id).await?;
        self.storage
            .compare_and_advance_watermark(source_id, column, expected, new_value, self.policy)
            .await
    }

    /// Read a watermark. Works for deactivated sources too.
    pub async fn get_watermark(
        &self,
        source_id: SourceId,
        column: &str,
    ) -> Result<Option<Watermark>> {
        self.require_registered(source_id).await?;
        self.storage.get_watermark(source_id, column.trim()).await
    }

    pub async fn list_watermarks(&self, source_id: SourceId) -> Result<Vec<Watermark>> {
        self.require_registered(source_id).await?;
        self.storage.list_watermarks(source_id).await
    }

    /// Decide between a full reload and an incremental pull for an active source.
    pub async fn plan_extract(&self, source_id: SourceId) -> Result<ExtractPlan> {
        let source = self.require_active(source_id).await?;
        let watermark = match &source.merge_key {
            Some(column) if source.load_strategy.is_incremental() => {
                self.storage.get_watermark(source_id, column).await?
            }
            _ => None,
        };
        let plan = ExtractPlan::for_source(&source, watermark.as_ref());
        debug!(source_id = %source_id, incremental = plan.is_incremental(), "planned extract");
        Ok(plan)
    }

    // -----------------------------------------------------------------------
    // Execution log
    // -----------------------------------------------------------------------

    /// Open a new execution record. Every attempt, including retries, gets its own.
    #[instrument(skip_all, fields(pipeline = %run.pipeline_name, activity = %run.activity_name))]
    pub async fn start_run(&self, run: &NewRun) -> Result<ExecutionId> {
        let run = NewRun {
            pipeline_name: non_empty("pipeline name", &run.pipeline_name)?,
            activity_name: non_empty("activity name", &run.activity_name)?,
            source_id: run.source_id,
            run_id: run
                .run_id
                .as_deref()
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(String::from),
        };
        if let Some(source_id) = run.source_id {
            self.require_registered(source_id).await?;
        }
        self.storage.start_run(&run).await
    }

    /// Close a `STARTED` record with its terminal outcome.
    #[instrument(skip(self, outcome), fields(status = ?outcome.status))]
    pub async fn end_run(&self, id: ExecutionId, outcome: &RunOutcome) -> Result<ExecutionRecord> {
        let outcome = RunOutcome {
            error_message: outcome
                .error_message
                .as_deref()
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(String::from),
            ..outcome.clone()
        };
        self.storage.end_run(id, &outcome).await
    }

    pub async fn get_execution(&self, id: ExecutionId) -> Result<Option<ExecutionRecord>> {
        self.storage.get_execution(id).await
    }

    pub async fn list_executions(&self, filter: &RunFilter) -> Result<Vec<ExecutionRecord>> {
        self.storage.list_executions(filter).await
    }

    /// Runs still `STARTED` after `older_than`. Nothing times out on its own.
    pub async fn list_open_runs(&self, older_than: Duration) -> Result<Vec<ExecutionRecord>> {
        self.storage.list_open_runs(Utc::now() - older_than).await
    }

    // -----------------------------------------------------------------------
    // Validation helpers
    // -----------------------------------------------------------------------

    async fn require_active(&self, id: SourceId) -> Result<SourceConfig> {
        self.storage
            .get_sources(Some(id))
            .await?
            .into_iter()
            .next()
            .ok_or(LoadCtlError::ConfigNotFound(id))
    }

    async fn require_registered(&self, id: SourceId) -> Result<SourceConfig> {
        self.storage
            .get_source(id)
            .await?
            .ok_or(LoadCtlError::ConfigNotFound(id))
    }
}

fn non_empty(field: &str, value: &str) -> Result<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(LoadCtlError::invalid(format!("{field} must not be empty")));
    }
    Ok(value.to_string())
}

fn watermark_args<'a>(column: &'a str, new_value: &'a str) -> Result<(&'a str, &'a str)> {
    let column = column.trim();
    if column.is_empty() {
        return Err(LoadCtlError::invalid("watermark column must not be empty"));
    }
    if new_value.is_empty() {
        return Err(LoadCtlError::invalid("watermark value must not be empty"));
    }
    Ok((column, new_value))
}
