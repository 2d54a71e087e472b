//! Extract planning: full reload vs. incremental pull from the last watermark.

use serde::Serialize;

use loadctl_shared::{LoadStrategy, SourceConfig, SourceId, Watermark};

/// What a worker should extract for one source on this run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum ExtractPlan {
    /// Reload everything into the target table.
    Full {
        source_id: SourceId,
        location: String,
        target_table: String,
    },
    /// Pull rows whose `column` is past `since`. `since = None` on the first run.
    Incremental {
        source_id: SourceId,
        location: String,
        target_table: String,
        column: String,
        since: Option<String>,
    },
}

impl ExtractPlan {
    /// Build the plan for `source` given the stored watermark of its merge key.
    pub(crate) fn for_source(source: &SourceConfig, watermark: Option<&Watermark>) -> Self {
        match (source.load_strategy, source.merge_key.as_ref()) {
            (LoadStrategy::Incremental, Some(column)) => Self::Incremental {
                source_id: source.id,
                location: source.location.clone(),
                target_table: source.target_table.clone(),
                column: column.clone(),
                since: watermark.map(|w| w.current_value.clone()),
            },
            // Incremental sources always carry a merge key.
            _ => Self::Full {
                source_id: source.id,
                location: source.location.clone(),
                target_table: source.target_table.clone(),
            },
        }
    }

    pub fn is_incremental(&self) -> bool {
        matches!(self, Self::Incremental { .. })
    }
}
