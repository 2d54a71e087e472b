//! Watermark checkpoints.
//!
//! Each (source, column) row holds a one-step history: `current_value` is the
//! latest advance and `last_value` the value it replaced. Advancing is a single
//! conditional upsert, so concurrent writers on the same key are serialized by
//! the `UNIQUE(source_id, column_name)` constraint and no update is lost.

use libsql::params;
use loadctl_shared::{
    LoadCtlError, Result, SourceId, Watermark, WatermarkAdvance, WatermarkPolicy,
};

use crate::{Storage, db_err, get_i64, get_opt_string, get_string, now_ts, parse_ts};

impl Storage {
    /// Advance the watermark for `(source_id, column)` to `new_value`.
    ///
    /// Inserts `(last = NULL, current = new_value)` on first use, otherwise
    /// shifts `current` into `last` and stores `new_value`. Under
    /// [`WatermarkPolicy::Monotonic`] a value ordering before the stored one is
    /// refused with [`LoadCtlError::WatermarkRegression`].
    pub async fn advance_watermark(
        &self,
        source_id: SourceId,
        column: &str,
        new_value: &str,
        policy: WatermarkPolicy,
    ) -> Result<WatermarkAdvance> {
        self.check_writable()?;
        let allow_regression = i64::from(policy == WatermarkPolicy::AllowRegression);

        let mut rows = self
            .conn
            .query(
                &format!(
                    "INSERT INTO watermark (source_id, column_name, last_value, current_value, updated_at)
                     VALUES (?1, ?2, NULL, ?3, ?4)
                     ON CONFLICT(source_id, column_name) DO UPDATE SET
                       last_value = watermark.current_value,
                       current_value = excluded.current_value,
                       updated_at = excluded.updated_at
                     WHERE ?5 = 1 OR {}
                     RETURNING last_value, current_value",
                    not_before("excluded.current_value", "watermark.current_value")
                ),
                params![source_id.0, column, new_value, now_ts(), allow_regression],
            )
            .await
            .map_err(db_err)?;

        let advanced = match rows.next().await.map_err(db_err)? {
            Some(row) => WatermarkAdvance {
                source_id,
                column_name: column.to_string(),
                previous: get_opt_string(&row, 0)?,
                current: get_string(&row, 1)?,
            },
            None => {
                drop(rows);
                let current = self
                    .get_watermark(source_id, column)
                    .await?
                    .map(|w| w.current_value)
                    .unwrap_or_default();
                tracing::warn!(
                    source_id = %source_id,
                    column,
                    current = %current,
                    attempted = new_value,
                    "refused watermark regression"
                );
                return Err(LoadCtlError::WatermarkRegression {
                    source_id,
                    column: column.to_string(),
                    current,
                    attempted: new_value.to_string(),
                });
            }
        };
        drop(rows);

        tracing::info!(
            source_id = %source_id,
            column,
            previous = advanced.previous.as_deref().unwrap_or("<none>"),
            current = %advanced.current,
            "advanced watermark"
        );
        Ok(advanced)
    }

    /// Advance only if the stored current value still equals `expected`.
    ///
    /// `expected = None` means "no watermark yet". A mismatch fails with
    /// [`LoadCtlError::WatermarkRaceCondition`] and leaves the row unchanged.
    pub async fn compare_and_advance_watermark(
        &self,
        source_id: SourceId,
        column: &str,
        expected: Option<&str>,
        new_value: &str,
        policy: WatermarkPolicy,
    ) -> Result<WatermarkAdvance> {
        self.check_writable()?;
        let allow_regression = i64::from(policy == WatermarkPolicy::AllowRegression);

        let mut rows = match expected {
            None => self
                .conn
                .query(
                    "INSERT INTO watermark (source_id, column_name, last_value, current_value, updated_at)
                     VALUES (?1, ?2, NULL, ?3, ?4)
                     ON CONFLICT(source_id, column_name) DO NOTHING
                     RETURNING last_value, current_value",
                    params![source_id.0, column, new_value, now_ts()],
                )
                .await
                .map_err(db_err)?,
            Some(expected) => self
                .conn
                .query(
                    &format!(
                        "UPDATE watermark
                         SET last_value = current_value, current_value = ?3, updated_at = ?4
                         WHERE source_id = ?1 AND column_name = ?2 AND current_value = ?5
                           AND (?6 = 1 OR {})
                         RETURNING last_value, current_value",
                        not_before("?3", "current_value")
                    ),
                    params![source_id.0, column, new_value, now_ts(), expected, allow_regression],
                )
                .await
                .map_err(db_err)?,
        };

        if let Some(row) = rows.next().await.map_err(db_err)? {
            let advanced = WatermarkAdvance {
                source_id,
                column_name: column.to_string(),
                previous: get_opt_string(&row, 0)?,
                current: get_string(&row, 1)?,
            };
            drop(rows);
            tracing::info!(
                source_id = %source_id,
                column,
                current = %advanced.current,
                "advanced watermark (compare-and-set)"
            );
            return Ok(advanced);
        }
        drop(rows);

        let actual = self
            .get_watermark(source_id, column)
            .await?
            .map(|w| w.current_value);

        if actual.as_deref() == expected {
            // Expectation held, so the monotonic guard refused the value.
            return Err(LoadCtlError::WatermarkRegression {
                source_id,
                column: column.to_string(),
                current: actual.unwrap_or_default(),
                attempted: new_value.to_string(),
            });
        }

        tracing::warn!(
            source_id = %source_id,
            column,
            expected = expected.unwrap_or("<none>"),
            actual = actual.as_deref().unwrap_or("<none>"),
            "watermark changed concurrently"
        );
        Err(LoadCtlError::WatermarkRaceCondition {
            source_id,
            column: column.to_string(),
            expected: expected.map(String::from),
            actual,
        })
    }

    /// Read the watermark for `(source_id, column)`, if one was ever written.
    pub async fn get_watermark(&self, source_id: SourceId, column: &str) -> Result<Option<Watermark>> {
        let mut rows = self
            .conn
            .query(
                "SELECT source_id, column_name, last_value, current_value, updated_at
                 FROM watermark WHERE source_id = ?1 AND column_name = ?2",
                params![source_id.0, column],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row_to_watermark(&row)?)),
            None => Ok(None),
        }
    }

    /// All watermarks of a source, ordered by column name.
    pub async fn list_watermarks(&self, source_id: SourceId) -> Result<Vec<Watermark>> {
        let mut rows = self
            .conn
            .query(
                "SELECT source_id, column_name, last_value, current_value, updated_at
                 FROM watermark WHERE source_id = ?1 ORDER BY column_name",
                params![source_id.0],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(row_to_watermark(&row)?);
        }
        Ok(results)
    }
}

/// SQL predicate: `new` does not order before `current`.
///
/// Two canonical numeric literals (`999`, `1000`, `-3`, `2.5`) compare as
/// numbers; anything else, such as ISO-8601 timestamps, compares as text.
fn not_before(new: &str, current: &str) -> String {
    format!(
        "(CASE WHEN CAST(CAST({new} AS NUMERIC) AS TEXT) = {new} \
                AND CAST(CAST({current} AS NUMERIC) AS TEXT) = {current} \
           THEN CAST({new} AS NUMERIC) >= CAST({current} AS NUMERIC) \
           ELSE {new} >= {current} END)"
    )
}

/// Convert a database row to a [`Watermark`].
fn row_to_watermark(row: &libsql::Row) -> Result<Watermark> {
    Ok(Watermark {
        source_id: SourceId(get_i64(row, 0)?),
        column_name: get_string(row, 1)?,
        last_value: get_opt_string(row, 2)?,
        current_value: get_string(row, 3)?,
        updated_at: parse_ts(&get_string(row, 4)?)?,
    })
}
