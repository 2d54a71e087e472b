//! Source registry: the catalog of loadable sources.
//!
//! Sources are never deleted. Deactivation hides a source from
//! [`Storage::get_sources`] while its watermarks and run history stay intact.

use libsql::params;
use loadctl_shared::{LoadCtlError, NewSource, Result, SourceConfig, SourceId, SourceUpdate};

use crate::{Storage, db_err, get_i64, get_opt_string, get_string, now_ts, parse_ts};

const SOURCE_COLUMNS: &str = "source_id, source_name, source_type, location, target_table, \
     load_strategy, merge_key, is_active, created_at, updated_at";

impl Storage {
    /// Register a new source. Returns its surrogate id.
    ///
    /// Fails with [`LoadCtlError::DuplicateSourceName`] when the name is taken
    /// and [`LoadCtlError::InvalidConfig`] when an incremental source lacks a
    /// merge key.
    pub async fn register_source(&self, source: &NewSource) -> Result<SourceId> {
        self.check_writable()?;
        let source = source.clone().normalized()?;
        let now = now_ts();

        let result = self
            .conn
            .query(
                "INSERT INTO source_config
                   (source_name, source_type, location, target_table, load_strategy,
                    merge_key, is_active, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?7)
                 RETURNING source_id",
                params![
                    source.name.as_str(),
                    source.source_type.as_str(),
                    source.location.as_str(),
                    source.target_table.as_str(),
                    source.load_strategy.as_str(),
                    source.merge_key.as_deref(),
                    now.as_str(),
                ],
            )
            .await;

        let mut rows = match result {
            Ok(rows) => rows,
            Err(e) => return Err(name_conflict(e, &source.name)),
        };

        let id = match rows.next().await {
            Ok(Some(row)) => SourceId(get_i64(&row, 0)?),
            Ok(None) => {
                return Err(LoadCtlError::Storage(
                    "insert into source_config returned no id".into(),
                ));
            }
            Err(e) => return Err(name_conflict(e, &source.name)),
        };

        tracing::info!(
            source_id = %id,
            name = %source.name,
            strategy = %source.load_strategy,
            "registered source"
        );
        Ok(id)
    }

    /// Active sources ordered by id, or the single active source `id`.
    ///
    /// An unknown or inactive id yields an empty list.
    pub async fn get_sources(&self, id: Option<SourceId>) -> Result<Vec<SourceConfig>> {
        let mut rows = match id {
            Some(id) => self
                .conn
                .query(
                    &format!(
                        "SELECT {SOURCE_COLUMNS} FROM source_config
                         WHERE is_active = 1 AND source_id = ?1"
                    ),
                    params![id.0],
                )
                .await
                .map_err(db_err)?,
            None => self
                .conn
                .query(
                    &format!(
                        "SELECT {SOURCE_COLUMNS} FROM source_config
                         WHERE is_active = 1 ORDER BY source_id"
                    ),
                    params![],
                )
                .await
                .map_err(db_err)?,
        };

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(row_to_source(&row)?);
        }
        tracing::debug!(requested = ?id, found = results.len(), "read source config");
        Ok(results)
    }

    /// Every source, active or not, ordered by id.
    pub async fn list_all_sources(&self) -> Result<Vec<SourceConfig>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {SOURCE_COLUMNS} FROM source_config ORDER BY source_id"),
                params![],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(row_to_source(&row)?);
        }
        Ok(results)
    }

    /// Look up a source by id regardless of its active flag.
    pub async fn get_source(&self, id: SourceId) -> Result<Option<SourceConfig>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {SOURCE_COLUMNS} FROM source_config WHERE source_id = ?1"),
                params![id.0],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row_to_source(&row)?)),
            None => Ok(None),
        }
    }

    /// Look up a source by its unique name regardless of its active flag.
    pub async fn get_source_by_name(&self, name: &str) -> Result<Option<SourceConfig>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {SOURCE_COLUMNS} FROM source_config WHERE source_name = ?1"),
                params![name.trim()],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row_to_source(&row)?)),
            None => Ok(None),
        }
    }

    /// Toggle the active flag. Watermarks and logs are left untouched.
    pub async fn set_source_active(&self, id: SourceId, active: bool) -> Result<SourceConfig> {
        self.check_writable()?;
        let mut rows = self
            .conn
            .query(
                &format!(
                    "UPDATE source_config SET is_active = ?1, updated_at = ?2
                     WHERE source_id = ?3
                     RETURNING {SOURCE_COLUMNS}"
                ),
                params![i64::from(active), now_ts(), id.0],
            )
            .await
            .map_err(db_err)?;

        let source = match rows.next().await.map_err(db_err)? {
            Some(row) => row_to_source(&row)?,
            None => return Err(LoadCtlError::ConfigNotFound(id)),
        };

        tracing::info!(source_id = %id, active, "changed source active flag");
        Ok(source)
    }

    /// Correct a source's metadata. The name and id are immutable.
    pub async fn update_source(&self, id: SourceId, update: SourceUpdate) -> Result<SourceConfig> {
        self.check_writable()?;
        let stored = self
            .get_source(id)
            .await?
            .ok_or(LoadCtlError::ConfigNotFound(id))?;
        let next = stored.apply(update)?;

        let mut rows = self
            .conn
            .query(
                &format!(
                    "UPDATE source_config
                     SET source_type = ?1, location = ?2, target_table = ?3,
                         load_strategy = ?4, merge_key = ?5, updated_at = ?6
                     WHERE source_id = ?7
                     RETURNING {SOURCE_COLUMNS}"
                ),
                params![
                    next.source_type.as_str(),
                    next.location.as_str(),
                    next.target_table.as_str(),
                    next.load_strategy.as_str(),
                    next.merge_key.as_deref(),
                    now_ts(),
                    id.0,
                ],
            )
            .await
            .map_err(db_err)?;

        let source = match rows.next().await.map_err(db_err)? {
            Some(row) => row_to_source(&row)?,
            None => return Err(LoadCtlError::ConfigNotFound(id)),
        };

        tracing::info!(source_id = %id, strategy = %source.load_strategy, "updated source");
        Ok(source)
    }
}

/// Map a UNIQUE failure on the source name to [`LoadCtlError::DuplicateSourceName`].
fn name_conflict(e: libsql::Error, name: &str) -> LoadCtlError {
    let message = e.to_string();
    if message.contains("UNIQUE") && message.contains("source_name") {
        LoadCtlError::DuplicateSourceName(name.to_string())
    } else {
        db_err(e)
    }
}

/// Convert a database row to a [`SourceConfig`].
fn row_to_source(row: &libsql::Row) -> Result<SourceConfig> {
    Ok(SourceConfig {
        id: SourceId(get_i64(row, 0)?),
        name: get_string(row, 1)?,
        source_type: get_string(row, 2)?.parse()?,
        location: get_string(row, 3)?,
        target_table: get_string(row, 4)?,
        load_strategy: get_string(row, 5)?.parse()?,
        merge_key: get_opt_string(row, 6)?,
        active: get_i64(row, 7)? != 0,
        created_at: parse_ts(&get_string(row, 8)?)?,
        updated_at: parse_ts(&get_string(row, 9)?)?,
    })
}

#[cfg(test)]
mod tests {
    use crate::test_support::*;
    use loadctl_shared::{LoadCtlError, LoadStrategy, NewSource, SourceId, SourceUpdate};

    #[tokio::test]
    async fn register_and_get() {
        let storage = test_storage().await;
        let id = storage
            .register_source(&incremental_source("orders"))
            .await
            .expect("register");

        let found = storage.get_sources(Some(id)).await.expect("get");
        assert_eq!(found.len(), 1);
        let source = &found[0];
        assert_eq!(source.id, id);
        assert_eq!(source.name, "orders");
        assert_eq!(source.load_strategy, LoadStrategy::Incremental);
        assert_eq!(source.merge_key.as_deref(), Some("updated_at"));
        assert!(source.active);
        assert_eq!(source.created_at, source.updated_at);
    }

    #[tokio::test]
    async fn duplicate_name_is_rejected() {
        let storage = test_storage().await;
        storage
            .register_source(&incremental_source("orders"))
            .await
            .unwrap();

        let err = storage
            .register_source(&full_source("orders"))
            .await
            .unwrap_err();
        assert!(matches!(err, LoadCtlError::DuplicateSourceName(name) if name == "orders"));
    }

    #[tokio::test]
    async fn incremental_without_merge_key_is_rejected() {
        let storage = test_storage().await;
        let source = NewSource {
            merge_key: None,
            ..incremental_source("orders")
        };
        let err = storage.register_source(&source).await.unwrap_err();
        assert!(matches!(err, LoadCtlError::InvalidConfig { .. }));
        assert!(storage.list_all_sources().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn full_source_stores_no_merge_key() {
        let storage = test_storage().await;
        let source = NewSource {
            merge_key: Some("updated_at".into()),
            ..full_source("products")
        };
        let id = storage.register_source(&source).await.unwrap();
        let stored = storage.get_source(id).await.unwrap().unwrap();
        assert_eq!(stored.merge_key, None);
    }

    #[tokio::test]
    async fn listing_returns_active_sources_by_id() {
        let storage = test_storage().await;
        let a = registered(&storage, "customers").await;
        let b = registered(&storage, "products").await;
        let c = registered(&storage, "orders").await;

        storage.set_source_active(b, false).await.unwrap();

        let ids: Vec<SourceId> = storage
            .get_sources(None)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec![a, c]);
        assert!(storage.get_sources(Some(b)).await.unwrap().is_empty());
        assert_eq!(storage.list_all_sources().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn unknown_id_yields_empty_list() {
        let storage = test_storage().await;
        registered(&storage, "orders").await;
        let found = storage.get_sources(Some(SourceId(7))).await.unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn toggling_unknown_source_fails() {
        let storage = test_storage().await;
        let err = storage
            .set_source_active(SourceId(42), false)
            .await
            .unwrap_err();
        assert!(matches!(err, LoadCtlError::ConfigNotFound(SourceId(42))));
    }

    #[tokio::test]
    async fn reactivation_restores_visibility() {
        let storage = test_storage().await;
        let id = registered(&storage, "orders").await;
        storage.set_source_active(id, false).await.unwrap();
        let source = storage.set_source_active(id, true).await.unwrap();
        assert!(source.active);
        assert_eq!(storage.get_sources(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn update_corrects_metadata() {
        let storage = test_storage().await;
        let id = storage
            .register_source(&full_source("customers"))
            .await
            .unwrap();

        let updated = storage
            .update_source(
                id,
                SourceUpdate {
                    load_strategy: Some(LoadStrategy::Incremental),
                    merge_key: Some("updated_date".into()),
                    ..Default::default()
                },
            )
            .await
            .expect("update");
        assert_eq!(updated.load_strategy, LoadStrategy::Incremental);
        assert_eq!(updated.merge_key.as_deref(), Some("updated_date"));
        assert_eq!(updated.name, "customers");
        assert!(updated.updated_at >= updated.created_at);

        let by_name = storage.get_source_by_name("customers").await.unwrap().unwrap();
        assert_eq!(by_name, updated);
    }

    #[tokio::test]
    async fn update_rejects_inconsistent_strategy() {
        let storage = test_storage().await;
        let id = storage
            .register_source(&full_source("customers"))
            .await
            .unwrap();
        let err = storage
            .update_source(
                id,
                SourceUpdate {
                    load_strategy: Some(LoadStrategy::Incremental),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LoadCtlError::InvalidConfig { .. }));
    }

    #[tokio::test]
    async fn sources_cannot_be_deleted() {
        let storage = test_storage().await;
        let id = registered(&storage, "orders").await;
        let err = storage
            .conn
            .execute(
                "DELETE FROM source_config WHERE source_id = ?1",
                libsql::params![id.0],
            )
            .await
            .map_err(crate::db_err)
            .unwrap_err();
        assert!(matches!(err, LoadCtlError::ConstraintViolation(_)));
    }
}
