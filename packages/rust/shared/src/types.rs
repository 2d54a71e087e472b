//! Core domain types for the control plane: sources, watermarks, executions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{LoadCtlError, Result};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Surrogate key of a registered source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(pub i64);

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SourceId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(s.trim().parse()?))
    }
}

/// A UUID v7 wrapper for execution records (time-sortable correlation token).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(pub Uuid);

impl ExecutionId {
    /// Generate a new time-sortable execution identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ExecutionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s.trim())?))
    }
}

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

/// Implements the upper-case storage encoding shared by all control-plane enums.
macro_rules! db_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// Upper-case encoding used in the database.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = LoadCtlError;

            fn from_str(s: &str) -> Result<Self> {
                match s.trim().to_ascii_uppercase().as_str() {
                    $($text => Ok(Self::$variant),)+
                    other => Err(LoadCtlError::parse(format!(
                        "unknown {} '{other}'",
                        stringify!($name)
                    ))),
                }
            }
        }
    };
}

/// Kind of system a source is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    File,
    Api,
    Database,
}

db_enum!(SourceType {
    File => "FILE",
    Api => "API",
    Database => "DATABASE",
});

/// How a source is loaded on each run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadStrategy {
    Full,
    Incremental,
}

db_enum!(LoadStrategy {
    Full => "FULL",
    Incremental => "INCREMENTAL",
});

impl LoadStrategy {
    pub fn is_incremental(&self) -> bool {
        matches!(self, Self::Incremental)
    }
}

/// Lifecycle state of an execution record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Started,
    Success,
    Failed,
    Quarantined,
}

db_enum!(RunStatus {
    Started => "STARTED",
    Success => "SUCCESS",
    Failed => "FAILED",
    Quarantined => "QUARANTINED",
});

impl RunStatus {
    /// Whether no further transition is allowed out of this state.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Started)
    }
}

/// The terminal subset of [`RunStatus`] accepted by `end_run`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalStatus {
    Success,
    Failed,
    Quarantined,
}

impl From<TerminalStatus> for RunStatus {
    fn from(status: TerminalStatus) -> Self {
        match status {
            TerminalStatus::Success => RunStatus::Success,
            TerminalStatus::Failed => RunStatus::Failed,
            TerminalStatus::Quarantined => RunStatus::Quarantined,
        }
    }
}

impl std::str::FromStr for TerminalStatus {
    type Err = LoadCtlError;

    fn from_str(s: &str) -> Result<Self> {
        match s.parse::<RunStatus>()? {
            RunStatus::Success => Ok(Self::Success),
            RunStatus::Failed => Ok(Self::Failed),
            RunStatus::Quarantined => Ok(Self::Quarantined),
            RunStatus::Started => Err(LoadCtlError::invalid(
                "STARTED is not a terminal status",
            )),
        }
    }
}

/// Whether watermarks may move backwards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WatermarkPolicy {
    /// New values must compare `>=` the current value (numerically when both
    /// are numbers, otherwise as text).
    #[default]
    Monotonic,
    /// Any value is accepted, including regressions.
    AllowRegression,
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

/// One loadable source as stored in the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: SourceId,
    /// Unique human key.
    pub name: String,
    pub source_type: SourceType,
    /// URI or path template the worker reads from.
    pub location: String,
    pub target_table: String,
    pub load_strategy: LoadStrategy,
    /// Source column tracked by the watermark (incremental sources only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_key: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Registration request for a new source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSource {
    pub name: String,
    pub source_type: SourceType,
    pub location: String,
    pub target_table: String,
    pub load_strategy: LoadStrategy,
    #[serde(default)]
    pub merge_key: Option<String>,
}

impl NewSource {
    /// Trim fields and check load-strategy consistency.
    ///
    /// Incremental sources need a merge key; full sources have theirs dropped.
    pub fn normalized(self) -> Result<Self> {
        let name = required("name", self.name)?;
        let location = required("location", self.location)?;
        let target_table = required("target table", self.target_table)?;

        let merge_key = self
            .merge_key
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty());

        let merge_key = match (self.load_strategy, merge_key) {
            (LoadStrategy::Incremental, None) => {
                return Err(LoadCtlError::invalid(format!(
                    "incremental source '{name}' requires a merge key"
                )));
            }
            (LoadStrategy::Incremental, key) => key,
            (LoadStrategy::Full, _) => None,
        };

        Ok(Self {
            name,
            source_type: self.source_type,
            location,
            target_table,
            load_strategy: self.load_strategy,
            merge_key,
        })
    }
}

fn required(field: &str, value: String) -> Result<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(LoadCtlError::invalid(format!("{field} must not be empty")));
    }
    Ok(value.to_string())
}

/// Metadata correction for an existing source. `None` keeps the stored value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceUpdate {
    #[serde(default)]
    pub source_type: Option<SourceType>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub target_table: Option<String>,
    #[serde(default)]
    pub load_strategy: Option<LoadStrategy>,
    #[serde(default)]
    pub merge_key: Option<String>,
}

impl SourceConfig {
    /// Merge an update into this source, producing a validated replacement.
    pub fn apply(&self, update: SourceUpdate) -> Result<NewSource> {
        NewSource {
            name: self.name.clone(),
            source_type: update.source_type.unwrap_or(self.source_type),
            location: update.location.unwrap_or_else(|| self.location.clone()),
            target_table: update
                .target_table
                .unwrap_or_else(|| self.target_table.clone()),
            load_strategy: update.load_strategy.unwrap_or(self.load_strategy),
            merge_key: update.merge_key.or_else(|| self.merge_key.clone()),
        }
        .normalized()
    }
}

// ---------------------------------------------------------------------------
// Watermarks
// ---------------------------------------------------------------------------

/// Incremental progress for one (source, column) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Watermark {
    pub source_id: SourceId,
    pub column_name: String,
    /// Value of `current_value` before the latest advance.
    pub last_value: Option<String>,
    pub current_value: String,
    pub updated_at: DateTime<Utc>,
}

/// One-step delta produced by an advance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatermarkAdvance {
    pub source_id: SourceId,
    pub column_name: String,
    pub previous: Option<String>,
    pub current: String,
}

// ---------------------------------------------------------------------------
// Executions
// ---------------------------------------------------------------------------

/// Parameters of `start_run`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewRun {
    pub pipeline_name: String,
    pub activity_name: String,
    #[serde(default)]
    pub source_id: Option<SourceId>,
    /// External correlation id supplied by the orchestrator.
    #[serde(default)]
    pub run_id: Option<String>,
}

impl NewRun {
    pub fn new(pipeline_name: impl Into<String>, activity_name: impl Into<String>) -> Self {
        Self {
            pipeline_name: pipeline_name.into(),
            activity_name: activity_name.into(),
            source_id: None,
            run_id: None,
        }
    }

    pub fn for_source(mut self, source_id: SourceId) -> Self {
        self.source_id = Some(source_id);
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }
}

/// Terminal outcome passed to `end_run`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub status: TerminalStatus,
    pub rows_processed: u64,
    pub rows_failed: u64,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl RunOutcome {
    pub fn success(rows_processed: u64) -> Self {
        Self {
            status: TerminalStatus::Success,
            rows_processed,
            rows_failed: 0,
            error_message: None,
        }
    }

    pub fn failed(error_message: impl Into<String>) -> Self {
        Self {
            status: TerminalStatus::Failed,
            rows_processed: 0,
            rows_failed: 0,
            error_message: Some(error_message.into()),
        }
    }

    pub fn quarantined(rows_processed: u64, rows_failed: u64) -> Self {
        Self {
            status: TerminalStatus::Quarantined,
            rows_processed,
            rows_failed,
            error_message: None,
        }
    }
}

/// One tracked invocation of a pipeline activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: ExecutionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<SourceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub pipeline_name: String,
    pub activity_name: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub rows_processed: u64,
    pub rows_failed: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Filter for listing execution history. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunFilter {
    pub source_id: Option<SourceId>,
    pub pipeline_name: Option<String>,
    pub run_id: Option<String>,
    pub status: Option<RunStatus>,
    pub limit: Option<u32>,
}
