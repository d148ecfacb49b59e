//! Durable filter storage.
//!
//! [`FilterStore`] is the seam the engine depends on; [`SqliteFilterStore`]
//! is the SQLite implementation. Every operation retries on `SQLITE_BUSY` /
//! `SQLITE_LOCKED` with exponential backoff before giving up with
//! [`FilterError::StoreUnavailable`].

use crate::config::StoreConfig;
use crate::error::{FilterError, Result};
use crate::models::{Filter, FilterCriteria, FilterPatch, FilterPerformance};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::{ToSql, Type};
use rusqlite::{params, params_from_iter, Connection, ErrorCode, Row, TransactionBehavior};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

// Stays well below SQLITE_MAX_VARIABLE_NUMBER on every SQLite build.
const USAGE_CHUNK_SIZE: usize = 500;

const FILTER_COLUMNS: &str = "filter_id, name, description, criteria, actions, priority, \
     effectiveness_score, created_at, last_used, usage_count, false_positive_rate, \
     performance_metrics, is_active";

#[async_trait]
pub trait FilterStore: Send + Sync {
    /// Persist a new filter. Fails with `Validation` on a duplicate id.
    async fn create(&self, filter: &Filter) -> Result<Filter>;

    async fn get(&self, filter_id: &str) -> Result<Option<Filter>>;

    /// Active filters, highest priority first, ties in insertion order.
    async fn list_active(&self) -> Result<Vec<Filter>>;

    async fn list_all(&self) -> Result<Vec<Filter>>;

    /// Returns `false` when no filter has this id.
    async fn update(&self, filter_id: &str, patch: &FilterPatch) -> Result<bool>;

    /// Removes the filter and its performance records.
    async fn delete(&self, filter_id: &str) -> Result<bool>;

    /// Increment `usage_count` and set `last_used` for all ids in one
    /// transaction.
    async fn batch_update_usage(&self, filter_ids: &[String], timestamp: DateTime<Utc>)
        -> Result<()>;

    async fn record_performance(&self, performance: &FilterPerformance) -> Result<()>;

    async fn performance_for(&self, filter_id: &str) -> Result<Vec<FilterPerformance>>;
}

pub struct SqliteFilterStore {
    conn: Arc<Mutex<Connection>>,
    config: StoreConfig,
}

impl SqliteFilterStore {
    pub fn open(db_path: &str, config: StoreConfig) -> Result<Self> {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path)?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        Self::with_connection(conn, config)
    }

    pub fn in_memory(config: StoreConfig) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, config)
    }

    fn with_connection(conn: Connection, config: StoreConfig) -> Result<Self> {
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            config,
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS filters (
                filter_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                criteria TEXT NOT NULL,
                actions TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                effectiveness_score REAL NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                last_used TEXT NOT NULL,
                usage_count INTEGER NOT NULL DEFAULT 0,
                false_positive_rate REAL NOT NULL DEFAULT 0,
                performance_metrics TEXT NOT NULL DEFAULT '{}',
                is_active INTEGER NOT NULL DEFAULT 1
            );
            CREATE INDEX IF NOT EXISTS idx_filters_active_priority
                ON filters (is_active, priority DESC);
            CREATE TABLE IF NOT EXISTS filter_performance (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                filter_id TEXT NOT NULL,
                accuracy REAL NOT NULL,
                precision_score REAL NOT NULL,
                recall REAL NOT NULL,
                f1_score REAL NOT NULL,
                processing_time_ms REAL NOT NULL,
                sample_count INTEGER NOT NULL,
                true_positives INTEGER NOT NULL,
                false_positives INTEGER NOT NULL,
                false_negatives INTEGER NOT NULL,
                recorded_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_filter_performance_filter
                ON filter_performance (filter_id);",
        )?;
        Ok(())
    }

    /// One attempt with the connection locked, on the blocking pool so that
    /// SQLite's busy wait never stalls a runtime worker. The closure is
    /// handed back for the next attempt.
    async fn run_once<T, F>(&self, mut f: F) -> Result<(F, Result<T>)>
    where
        F: FnMut(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let task = tokio::task::spawn_blocking(move || {
            let result = match conn.lock() {
                Ok(mut conn) => f(&mut *conn),
                Err(_) => Err(FilterError::StoreUnavailable {
                    attempts: 0,
                    message: "connection mutex poisoned".to_string(),
                }),
            };
            (f, result)
        });
        task.await.map_err(|e| {
            log::error!("Filter store task failed: {e}");
            FilterError::StoreUnavailable {
                attempts: 0,
                message: format!("store task failed: {e}"),
            }
        })
    }

    async fn with_retry<T, F>(&self, operation: &str, f: F) -> Result<T>
    where
        F: FnMut(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let attempts = self.config.retry_attempts.max(1);
        let mut attempt = 1;
        let mut f = f;
        loop {
            let (returned, result) = self.run_once(f).await?;
            f = returned;
            match result {
                Err(e) if e.is_busy() => {
                    if attempt >= attempts {
                        log::error!("Filter store {operation} failed after {attempt} attempts: {e}");
                        return Err(FilterError::StoreUnavailable {
                            attempts: attempt,
                            message: e.to_string(),
                        });
                    }
                    let delay = self.config.backoff(attempt);
                    log::warn!(
                        "Filter store busy during {operation} (attempt {attempt}/{attempts}), retrying in {delay:?}"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Write a column directly, skipping validation. Lets tests plant rows
    /// that an older or hand-edited database could contain.
    #[cfg(test)]
    pub(crate) fn overwrite_column(&self, filter_id: &str, column: &'static str, value: &str) {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            &format!("UPDATE filters SET {column} = ?1 WHERE filter_id = ?2"),
            params![value, filter_id],
        )
        .unwrap();
    }

    fn query_filters(conn: &Connection, sql: &str, args: &[&dyn ToSql]) -> Result<Vec<Filter>> {
        let mut stmt = conn.prepare(sql)?;
        let filters = stmt
            .query_map(args, row_to_filter)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(filters)
    }
}

fn conversion_error<E>(index: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(err))
}

fn json_column<T: serde::de::DeserializeOwned>(row: &Row, index: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(index)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(index, e))
}

fn time_column(row: &Row, index: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(index)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(index, e))
}

fn count_column(row: &Row, index: usize) -> rusqlite::Result<u64> {
    let value: i64 = row.get(index)?;
    Ok(value.max(0) as u64)
}

fn row_to_filter(row: &Row) -> rusqlite::Result<Filter> {
    let filter_id: String = row.get(0)?;
    let name: String = row.get(1)?;
    let description: String = row.get(2)?;
    let criteria: FilterCriteria = json_column(row, 3)?;

    let mut filter = Filter::with_id(
        filter_id,
        &name,
        &description,
        criteria,
        json_column(row, 4)?,
        row.get(5)?,
        time_column(row, 7)?,
    );
    if !filter.compiled().invalid_patterns.is_empty() {
        log::warn!(
            "Filter {} has patterns that no longer compile; it will never match",
            filter.filter_id
        );
    }

    filter.effectiveness_score = row.get(6)?;
    filter.last_used = time_column(row, 8)?;
    filter.usage_count = count_column(row, 9)?;
    filter.false_positive_rate = row.get(10)?;
    filter.performance_metrics = json_column(row, 11)?;
    filter.is_active = row.get(12)?;
    Ok(filter)
}

fn row_to_performance(row: &Row) -> rusqlite::Result<FilterPerformance> {
    Ok(FilterPerformance {
        filter_id: row.get(0)?,
        accuracy: row.get(1)?,
        precision: row.get(2)?,
        recall: row.get(3)?,
        f1_score: row.get(4)?,
        processing_time_ms: row.get(5)?,
        sample_count: count_column(row, 6)?,
        true_positives: count_column(row, 7)?,
        false_positives: count_column(row, 8)?,
        false_negatives: count_column(row, 9)?,
        recorded_at: time_column(row, 10)?,
    })
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation)
}

/// Builds `UPDATE <table> SET col = ?1, ... WHERE key = ?n`.
///
/// Column names only come from the `&'static str` literals below; every
/// value is a bound parameter.
struct UpdateBuilder {
    table: &'static str,
    assignments: Vec<&'static str>,
    values: Vec<Box<dyn ToSql>>,
}

impl UpdateBuilder {
    fn new(table: &'static str) -> Self {
        Self {
            table,
            assignments: Vec::new(),
            values: Vec::new(),
        }
    }

    fn set<V: ToSql + 'static>(&mut self, column: &'static str, value: V) -> &mut Self {
        self.assignments.push(column);
        self.values.push(Box::new(value));
        self
    }

    fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    fn execute(mut self, conn: &Connection, key_column: &'static str, key: &str) -> Result<usize> {
        let set_clause = self
            .assignments
            .iter()
            .enumerate()
            .map(|(i, column)| format!("{column} = ?{}", i + 1))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE {} SET {set_clause} WHERE {key_column} = ?{}",
            self.table,
            self.values.len() + 1
        );
        self.values.push(Box::new(key.to_string()));

        let changed = conn.execute(&sql, params_from_iter(self.values.iter().map(|v| v.as_ref())))?;
        Ok(changed)
    }
}

fn patch_to_update(patch: &FilterPatch) -> Result<UpdateBuilder> {
    let mut update = UpdateBuilder::new("filters");
    if let Some(name) = &patch.name {
        update.set("name", name.clone());
    }
    if let Some(description) = &patch.description {
        update.set("description", description.clone());
    }
    if let Some(criteria) = &patch.criteria {
        update.set("criteria", serde_json::to_string(criteria)?);
    }
    if let Some(actions) = &patch.actions {
        update.set("actions", serde_json::to_string(actions)?);
    }
    if let Some(priority) = patch.priority {
        update.set("priority", priority);
    }
    if let Some(score) = patch.effectiveness_score {
        update.set("effectiveness_score", score);
    }
    if let Some(rate) = patch.false_positive_rate {
        update.set("false_positive_rate", rate);
    }
    if let Some(metrics) = &patch.performance_metrics {
        update.set("performance_metrics", serde_json::to_string(metrics)?);
    }
    if let Some(is_active) = patch.is_active {
        update.set("is_active", is_active);
    }
    Ok(update)
}

#[async_trait]
impl FilterStore for SqliteFilterStore {
    async fn create(&self, filter: &Filter) -> Result<Filter> {
        filter.validate()?;
        let criteria = serde_json::to_string(filter.criteria())?;
        let actions = serde_json::to_string(&filter.actions)?;
        let metrics = serde_json::to_string(&filter.performance_metrics)?;
        let row = filter.clone();

        self.with_retry("create", move |conn| {
            let inserted = conn.execute(
                "INSERT INTO filters (filter_id, name, description, criteria, actions, priority,
                    effectiveness_score, created_at, last_used, usage_count, false_positive_rate,
                    performance_metrics, is_active)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    row.filter_id,
                    row.name,
                    row.description,
                    criteria,
                    actions,
                    row.priority,
                    row.effectiveness_score,
                    row.created_at.to_rfc3339(),
                    row.last_used.to_rfc3339(),
                    row.usage_count as i64,
                    row.false_positive_rate,
                    metrics,
                    row.is_active,
                ],
            );
            match inserted {
                Ok(_) => Ok(()),
                Err(e) if is_constraint_violation(&e) => Err(FilterError::Validation(format!(
                    "duplicate filter id: {}",
                    row.filter_id
                ))),
                Err(e) => Err(e.into()),
            }
        })
        .await?;

        log::debug!("Created filter {} ({})", filter.filter_id, filter.name);
        Ok(filter.clone())
    }

    async fn get(&self, filter_id: &str) -> Result<Option<Filter>> {
        let sql = format!("SELECT {FILTER_COLUMNS} FROM filters WHERE filter_id = ?1");
        let filter_id = filter_id.to_string();
        self.with_retry("get", move |conn| {
            let mut filters = Self::query_filters(conn, &sql, params![filter_id])?;
            Ok(filters.pop())
        })
        .await
    }

    async fn list_active(&self) -> Result<Vec<Filter>> {
        let sql = format!(
            "SELECT {FILTER_COLUMNS} FROM filters WHERE is_active = 1
             ORDER BY priority DESC, rowid ASC"
        );
        self.with_retry("list_active", move |conn| Self::query_filters(conn, &sql, params![]))
            .await
    }

    async fn list_all(&self) -> Result<Vec<Filter>> {
        let sql = format!("SELECT {FILTER_COLUMNS} FROM filters ORDER BY priority DESC, rowid ASC");
        self.with_retry("list_all", move |conn| Self::query_filters(conn, &sql, params![]))
            .await
    }

    async fn update(&self, filter_id: &str, patch: &FilterPatch) -> Result<bool> {
        patch.validate()?;
        let patch = patch.clone();
        let filter_id = filter_id.to_string();
        let changed = self
            .with_retry("update", move |conn| {
                let update = patch_to_update(&patch)?;
                if update.is_empty() {
                    return Ok(0);
                }
                update.execute(conn, "filter_id", &filter_id)
            })
            .await?;
        Ok(changed > 0)
    }

    async fn delete(&self, filter_id: &str) -> Result<bool> {
        let filter_id = filter_id.to_string();
        let deleted = self
            .with_retry("delete", move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                tx.execute(
                    "DELETE FROM filter_performance WHERE filter_id = ?1",
                    params![filter_id],
                )?;
                let deleted = tx.execute("DELETE FROM filters WHERE filter_id = ?1", params![filter_id])?;
                tx.commit()?;
                Ok(deleted)
            })
            .await?;
        Ok(deleted > 0)
    }

    async fn batch_update_usage(
        &self,
        filter_ids: &[String],
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        let mut seen = HashSet::new();
        let ids: Vec<String> = filter_ids
            .iter()
            .filter(|id| seen.insert(*id))
            .cloned()
            .collect();
        let id_count = ids.len();
        if ids.is_empty() {
            return Ok(());
        }
        let last_used = timestamp.to_rfc3339();

        let updated = self
            .with_retry("batch_update_usage", move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let mut updated = 0;
                for chunk in ids.chunks(USAGE_CHUNK_SIZE) {
                    let placeholders = (0..chunk.len())
                        .map(|i| format!("?{}", i + 2))
                        .collect::<Vec<_>>()
                        .join(", ");
                    let sql = format!(
                        "UPDATE filters SET usage_count = usage_count + 1, last_used = ?1
                         WHERE filter_id IN ({placeholders})"
                    );
                    let mut args: Vec<&dyn ToSql> = Vec::with_capacity(chunk.len() + 1);
                    args.push(&last_used);
                    args.extend(chunk.iter().map(|id| id as &dyn ToSql));
                    updated += tx.execute(&sql, args.as_slice())?;
                }
                tx.commit()?;
                Ok(updated)
            })
            .await?;

        log::debug!("Recorded usage for {updated} of {id_count} filters");
        Ok(())
    }

    async fn record_performance(&self, performance: &FilterPerformance) -> Result<()> {
        let record = performance.clone();
        let inserted = self
            .with_retry("record_performance", move |conn| {
                let inserted = conn.execute(
                    "INSERT INTO filter_performance (filter_id, accuracy, precision_score, recall,
                        f1_score, processing_time_ms, sample_count, true_positives,
                        false_positives, false_negatives, recorded_at)
                     SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11
                     WHERE EXISTS (SELECT 1 FROM filters WHERE filter_id = ?1)",
                    params![
                        record.filter_id,
                        record.accuracy,
                        record.precision,
                        record.recall,
                        record.f1_score,
                        record.processing_time_ms,
                        record.sample_count as i64,
                        record.true_positives as i64,
                        record.false_positives as i64,
                        record.false_negatives as i64,
                        record.recorded_at.to_rfc3339(),
                    ],
                )?;
                Ok(inserted)
            })
            .await?;

        if inserted == 0 {
            return Err(FilterError::NotFound(performance.filter_id.clone()));
        }
        Ok(())
    }

    async fn performance_for(&self, filter_id: &str) -> Result<Vec<FilterPerformance>> {
        let filter_id = filter_id.to_string();
        self.with_retry("performance_for", move |conn| {
            let mut stmt = conn.prepare(
                "SELECT filter_id, accuracy, precision_score, recall, f1_score, processing_time_ms,
                        sample_count, true_positives, false_positives, false_negatives, recorded_at
                 FROM filter_performance WHERE filter_id = ?1 ORDER BY id ASC",
            )?;
            let records = stmt
                .query_map(params![filter_id], row_to_performance)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(records)
        })
        .await
    }
}
