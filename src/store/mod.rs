//! Persistent tender datastore backed by SQLite.
//!
//! Two logical tables: `runs` (one row per portal run) and `tenders` (one
//! row per canonical tender id per portal in the current state, attached to
//! the run that last touched it). A unique index on
//! `(portal_key, tender_id_extracted)` enforces current-state uniqueness;
//! re-sighted tenders are superseded in place, never duplicated.
//!
//! Uses WAL mode for concurrent reads during writes. Mutations for a given
//! portal are serialized through a short-held per-portal mutex on top of the
//! store's own transactions; read queries never take that lock.

pub mod backup;

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;

use crate::config::normalize_portal_name;
use crate::tender_id::normalize_closing_date;

/// Delay before the single retry of a conflicted write.
const CONFLICT_RETRY_DELAY: Duration = Duration::from_millis(150);

/// SQL schema for the tender datastore.
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    portal_name TEXT NOT NULL,
    base_url TEXT,
    scope_mode TEXT,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    status TEXT,
    expected_total_tenders INTEGER DEFAULT 0,
    extracted_total_tenders INTEGER DEFAULT 0,
    skipped_existing_total INTEGER DEFAULT 0,
    partial_saved INTEGER DEFAULT 0,
    output_file_path TEXT,
    output_file_type TEXT
);

CREATE TABLE IF NOT EXISTS tenders (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id INTEGER NOT NULL,
    portal_name TEXT,
    portal_key TEXT NOT NULL,
    department_name TEXT,
    tender_id_extracted TEXT NOT NULL,
    published_date TEXT,
    closing_date TEXT,
    opening_date TEXT,
    title_ref TEXT,
    organisation_chain TEXT,
    direct_url TEXT,
    status_url TEXT,
    emd_amount TEXT,
    emd_amount_numeric REAL,
    lifecycle_status TEXT NOT NULL DEFAULT 'active',
    cancelled_source TEXT,
    first_seen_at TEXT NOT NULL,
    last_seen_at TEXT NOT NULL,
    FOREIGN KEY (run_id) REFERENCES runs(id) ON DELETE CASCADE
);

CREATE UNIQUE INDEX IF NOT EXISTS ux_tenders_portal_tender
    ON tenders(portal_key, tender_id_extracted);
CREATE INDEX IF NOT EXISTS idx_tenders_run_id ON tenders(run_id);
CREATE INDEX IF NOT EXISTS idx_tenders_tender_id ON tenders(tender_id_extracted);

CREATE VIEW IF NOT EXISTS v_tender_export AS
SELECT
    t.run_id AS run_id,
    t.portal_name AS portal_name,
    t.portal_key AS portal_key,
    t.department_name AS department_name,
    t.tender_id_extracted AS tender_id_extracted,
    t.published_date AS published_date,
    t.closing_date AS closing_date,
    t.opening_date AS opening_date,
    t.title_ref AS title_ref,
    t.organisation_chain AS organisation_chain,
    t.direct_url AS direct_url,
    t.status_url AS status_url,
    t.emd_amount AS emd_amount,
    t.emd_amount_numeric AS emd_amount_numeric,
    t.lifecycle_status AS lifecycle_status,
    r.scope_mode AS scope_mode,
    r.started_at AS run_started_at,
    r.completed_at AS run_completed_at,
    r.status AS run_status
FROM tenders t
JOIN runs r ON r.id = t.run_id;
"#;

/// Store-level errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store conflict persisted after retry: {0}")]
    Conflict(String),
    #[error("run {0} not found")]
    RunNotFound(i64),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Scope of a portal run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ScopeMode {
    #[default]
    All,
    Selected,
    Import,
    WatchTriggered,
}

impl ScopeMode {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Selected => "selected",
            Self::Import => "import",
            Self::WatchTriggered => "watch-triggered",
        }
    }
}

/// Tender lifecycle states. `Cancelled` is sticky: re-sighting the same id
/// never resurrects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleStatus {
    Active,
    Expired,
    Cancelled,
}

impl LifecycleStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        }
    }
}

/// One extracted tender row, ready for persistence. `tender_id` is already
/// canonical (validated by the scraper before it reaches the store).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TenderRecord {
    pub portal_name: String,
    pub department_name: String,
    pub tender_id: String,
    pub published_date: String,
    pub closing_date: String,
    pub opening_date: String,
    pub title_ref: String,
    pub organisation_chain: String,
    pub direct_url: String,
    pub status_url: String,
    pub emd_amount: String,
    pub emd_amount_numeric: Option<f64>,
}

/// Counters returned by `upsert_current_tenders`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertCounters {
    pub inserted_new: u64,
    pub updated_closing_date: u64,
    pub unchanged: u64,
}

impl UpsertCounters {
    pub fn absorb(&mut self, other: UpsertCounters) {
        self.inserted_new += other.inserted_new;
        self.updated_closing_date += other.updated_closing_date;
        self.unchanged += other.unchanged;
    }
}

/// Finalization arguments for a run.
#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    pub status: String,
    pub expected_total: u64,
    pub extracted_total: u64,
    pub skipped_existing_total: u64,
    pub partial_saved: bool,
    pub output_file_path: Option<String>,
    pub output_file_type: Option<String>,
}

/// A row of the export view, in exporter column order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExportRow {
    pub department_name: String,
    pub published_date: String,
    pub closing_date: String,
    pub opening_date: String,
    pub organisation_chain: String,
    pub title_ref: String,
    pub tender_id_extracted: String,
    pub direct_url: String,
    pub status_url: String,
}

/// SQLite-backed primary datastore for tender runs and extracted tenders.
#[derive(Clone)]
pub struct TenderStore {
    pool: SqlitePool,
    portal_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl TenderStore {
    /// Open (or create) the store at `db_path` and bootstrap the schema.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        sqlx::raw_sql(SCHEMA_SQL).execute(&pool).await?;
        debug!("Tender store opened at {}", db_path.display());

        Ok(Self {
            pool,
            portal_locks: Arc::new(DashMap::new()),
        })
    }

    fn portal_lock(&self, portal_name: &str) -> Arc<Mutex<()>> {
        self.portal_locks
            .entry(normalize_portal_name(portal_name))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Create a run record in status `running`. Serialized against
    /// finalization of runs for the same portal.
    pub async fn start_run(
        &self,
        portal_name: &str,
        base_url: &str,
        scope_mode: ScopeMode,
    ) -> Result<i64, StoreError> {
        let lock = self.portal_lock(portal_name);
        let _guard = lock.lock().await;

        let result = sqlx::query(
            "INSERT INTO runs (portal_name, base_url, scope_mode, started_at, status)
             VALUES (?, ?, ?, ?, 'running')",
        )
        .bind(portal_name.trim())
        .bind(base_url.trim())
        .bind(scope_mode.as_str())
        .bind(now_iso())
        .execute(&self.pool)
        .await?;

        let run_id = result.last_insert_rowid();
        info!("Run {run_id} started for portal '{portal_name}' (scope={})", scope_mode.as_str());
        Ok(run_id)
    }

    /// Remove rows previously attached to this run and insert the supplied
    /// list. Rows whose canonical pair already exists under another run are
    /// re-attached to this run in place. One transaction. Returns the number
    /// of rows written.
    pub async fn replace_run_tenders(
        &self,
        run_id: i64,
        rows: &[TenderRecord],
    ) -> Result<u64, StoreError> {
        self.with_conflict_retry(|| self.replace_run_tenders_tx(run_id, rows))
            .await
    }

    async fn replace_run_tenders_tx(
        &self,
        run_id: i64,
        rows: &[TenderRecord],
    ) -> Result<u64, StoreError> {
        let now = now_iso();
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM tenders WHERE run_id = ?")
            .bind(run_id)
            .execute(&mut *tx)
            .await?;

        for row in rows {
            sqlx::query(
                "INSERT INTO tenders (
                     run_id, portal_name, portal_key, department_name, tender_id_extracted,
                     published_date, closing_date, opening_date, title_ref, organisation_chain,
                     direct_url, status_url, emd_amount, emd_amount_numeric,
                     lifecycle_status, first_seen_at, last_seen_at
                 )
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'active', ?, ?)
                 ON CONFLICT(portal_key, tender_id_extracted) DO UPDATE SET
                     run_id = excluded.run_id,
                     department_name = excluded.department_name,
                     published_date = excluded.published_date,
                     closing_date = excluded.closing_date,
                     opening_date = excluded.opening_date,
                     title_ref = excluded.title_ref,
                     organisation_chain = excluded.organisation_chain,
                     direct_url = excluded.direct_url,
                     status_url = excluded.status_url,
                     emd_amount = excluded.emd_amount,
                     emd_amount_numeric = excluded.emd_amount_numeric,
                     last_seen_at = excluded.last_seen_at",
            )
            .bind(run_id)
            .bind(row.portal_name.trim())
            .bind(normalize_portal_name(&row.portal_name))
            .bind(row.department_name.trim())
            .bind(row.tender_id.trim())
            .bind(row.published_date.trim())
            .bind(row.closing_date.trim())
            .bind(row.opening_date.trim())
            .bind(row.title_ref.trim())
            .bind(row.organisation_chain.trim())
            .bind(row.direct_url.trim())
            .bind(row.status_url.trim())
            .bind(row.emd_amount.trim())
            .bind(row.emd_amount_numeric)
            .bind(&now)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(rows.len() as u64)
    }

    /// Apply the reconciliation rule to each row, one transaction per call
    /// (the scraper calls this once per department batch).
    ///
    /// Per row: absent -> insert as `active` with first-seen = last-seen =
    /// now; present with an equal normalized closing date -> touch last-seen;
    /// present with a different closing date -> update the mutable attributes
    /// and count the reprocess. `cancelled` lifecycle is preserved across
    /// updates.
    pub async fn upsert_current_tenders(
        &self,
        portal_name: &str,
        run_id: i64,
        rows: &[TenderRecord],
    ) -> Result<UpsertCounters, StoreError> {
        let lock = self.portal_lock(portal_name);
        let _guard = lock.lock().await;
        self.with_conflict_retry(|| self.upsert_current_tenders_tx(portal_name, run_id, rows))
            .await
    }

    async fn upsert_current_tenders_tx(
        &self,
        portal_name: &str,
        run_id: i64,
        rows: &[TenderRecord],
    ) -> Result<UpsertCounters, StoreError> {
        let portal_key = normalize_portal_name(portal_name);
        let now = now_iso();
        let mut counters = UpsertCounters::default();
        let mut tx = self.pool.begin().await?;

        for row in rows {
            let tender_id = row.tender_id.trim();
            let existing: Option<(i64, String)> = sqlx::query_as(
                "SELECT id, closing_date FROM tenders
                 WHERE portal_key = ? AND tender_id_extracted = ?",
            )
            .bind(&portal_key)
            .bind(tender_id)
            .fetch_optional(&mut *tx)
            .await?;

            match existing {
                None => {
                    sqlx::query(
                        "INSERT INTO tenders (
                             run_id, portal_name, portal_key, department_name, tender_id_extracted,
                             published_date, closing_date, opening_date, title_ref,
                             organisation_chain, direct_url, status_url, emd_amount,
                             emd_amount_numeric, lifecycle_status, first_seen_at, last_seen_at
                         )
                         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'active', ?, ?)",
                    )
                    .bind(run_id)
                    .bind(portal_name.trim())
                    .bind(&portal_key)
                    .bind(row.department_name.trim())
                    .bind(tender_id)
                    .bind(row.published_date.trim())
                    .bind(row.closing_date.trim())
                    .bind(row.opening_date.trim())
                    .bind(row.title_ref.trim())
                    .bind(row.organisation_chain.trim())
                    .bind(row.direct_url.trim())
                    .bind(row.status_url.trim())
                    .bind(row.emd_amount.trim())
                    .bind(row.emd_amount_numeric)
                    .bind(&now)
                    .bind(&now)
                    .execute(&mut *tx)
                    .await?;
                    counters.inserted_new += 1;
                }
                Some((row_id, existing_closing)) => {
                    if normalize_closing_date(&existing_closing)
                        == normalize_closing_date(&row.closing_date)
                    {
                        sqlx::query("UPDATE tenders SET last_seen_at = ? WHERE id = ?")
                            .bind(&now)
                            .bind(row_id)
                            .execute(&mut *tx)
                            .await?;
                        counters.unchanged += 1;
                    } else {
                        sqlx::query(
                            "UPDATE tenders SET
                                 run_id = ?,
                                 department_name = ?,
                                 published_date = ?,
                                 closing_date = ?,
                                 opening_date = ?,
                                 title_ref = ?,
                                 organisation_chain = ?,
                                 direct_url = ?,
                                 status_url = ?,
                                 emd_amount = ?,
                                 emd_amount_numeric = ?,
                                 last_seen_at = ?
                             WHERE id = ?",
                        )
                        .bind(run_id)
                        .bind(row.department_name.trim())
                        .bind(row.published_date.trim())
                        .bind(row.closing_date.trim())
                        .bind(row.opening_date.trim())
                        .bind(row.title_ref.trim())
                        .bind(row.organisation_chain.trim())
                        .bind(row.direct_url.trim())
                        .bind(row.status_url.trim())
                        .bind(row.emd_amount.trim())
                        .bind(row.emd_amount_numeric)
                        .bind(&now)
                        .bind(row_id)
                        .execute(&mut *tx)
                        .await?;
                        counters.updated_closing_date += 1;
                    }
                }
            }
        }

        tx.commit().await?;
        Ok(counters)
    }

    /// Finalize a run: completed-at = now plus the outcome counters.
    /// Idempotent when called again with identical values.
    pub async fn finalize_run(&self, run_id: i64, outcome: &RunOutcome) -> Result<(), StoreError> {
        let portal_name: Option<(String,)> =
            sqlx::query_as("SELECT portal_name FROM runs WHERE id = ?")
                .bind(run_id)
                .fetch_optional(&self.pool)
                .await?;
        let Some((portal_name,)) = portal_name else {
            return Err(StoreError::RunNotFound(run_id));
        };

        let lock = self.portal_lock(&portal_name);
        let _guard = lock.lock().await;

        sqlx::query(
            "UPDATE runs SET
                 completed_at = ?,
                 status = ?,
                 expected_total_tenders = ?,
                 extracted_total_tenders = ?,
                 skipped_existing_total = ?,
                 partial_saved = ?,
                 output_file_path = ?,
                 output_file_type = ?
             WHERE id = ?",
        )
        .bind(now_iso())
        .bind(&outcome.status)
        .bind(outcome.expected_total as i64)
        .bind(outcome.extracted_total as i64)
        .bind(outcome.skipped_existing_total as i64)
        .bind(i64::from(outcome.partial_saved))
        .bind(outcome.output_file_path.as_deref())
        .bind(outcome.output_file_type.as_deref())
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        info!("Run {run_id} finalized: {}", outcome.status);
        Ok(())
    }

    /// Fast-path dedup set: every canonical id currently stored for the
    /// portal. Non-blocking with respect to writers.
    pub async fn existing_tender_ids_for_portal(
        &self,
        portal_name: &str,
    ) -> Result<HashSet<String>, StoreError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT tender_id_extracted FROM tenders WHERE portal_key = ?")
                .bind(normalize_portal_name(portal_name))
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Snapshot of canonical id -> stored closing date, used to decide
    /// whether a known id is unchanged or needs a closing-date update.
    pub async fn existing_tender_snapshot_for_portal(
        &self,
        portal_name: &str,
    ) -> Result<HashMap<String, String>, StoreError> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT tender_id_extracted, closing_date FROM tenders WHERE portal_key = ?",
        )
        .bind(normalize_portal_name(portal_name))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }

    /// Touch `last_seen_at` for ids the fast-path filter skipped: the
    /// portal still lists them, so the sighting counts even though nothing
    /// else changed. Returns rows touched.
    pub async fn touch_last_seen(
        &self,
        portal_name: &str,
        tender_ids: &[String],
    ) -> Result<u64, StoreError> {
        if tender_ids.is_empty() {
            return Ok(0);
        }
        let portal_key = normalize_portal_name(portal_name);
        let now = now_iso();
        let mut touched = 0u64;

        for chunk in tender_ids.chunks(500) {
            let placeholders: Vec<&str> = chunk.iter().map(|_| "?").collect();
            let sql = format!(
                "UPDATE tenders SET last_seen_at = ?
                 WHERE portal_key = ? AND tender_id_extracted IN ({})",
                placeholders.join(", ")
            );
            let mut query = sqlx::query(&sql).bind(&now).bind(&portal_key);
            for id in chunk {
                query = query.bind(id.trim());
            }
            touched += query.execute(&self.pool).await?.rows_affected();
        }
        Ok(touched)
    }

    /// Transition lifecycle to `cancelled` for each id that currently exists
    /// under the portal, recording the source tag. Returns rows updated.
    pub async fn mark_cancelled(
        &self,
        portal_name: &str,
        tender_ids: &[String],
        source_tag: &str,
    ) -> Result<u64, StoreError> {
        if tender_ids.is_empty() {
            return Ok(0);
        }
        let lock = self.portal_lock(portal_name);
        let _guard = lock.lock().await;

        let portal_key = normalize_portal_name(portal_name);
        let now = now_iso();
        let mut updated = 0u64;
        let mut tx = self.pool.begin().await?;

        for chunk in tender_ids.chunks(500) {
            let placeholders: Vec<&str> = chunk.iter().map(|_| "?").collect();
            let sql = format!(
                "UPDATE tenders SET lifecycle_status = 'cancelled', cancelled_source = ?, last_seen_at = ?
                 WHERE portal_key = ? AND tender_id_extracted IN ({})",
                placeholders.join(", ")
            );
            let mut query = sqlx::query(&sql).bind(source_tag).bind(&now).bind(&portal_key);
            for id in chunk {
                query = query.bind(id.trim());
            }
            updated += query.execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;
        info!("Marked {updated} tender(s) cancelled on '{portal_name}' (source={source_tag})");
        Ok(updated)
    }

    /// Lifecycle status for one tender, if present.
    pub async fn lifecycle_for(
        &self,
        portal_name: &str,
        tender_id: &str,
    ) -> Result<Option<String>, StoreError> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT lifecycle_status FROM tenders
             WHERE portal_key = ? AND tender_id_extracted = ?",
        )
        .bind(normalize_portal_name(portal_name))
        .bind(tender_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(status,)| status))
    }

    /// Output paths recorded on finalized runs, used by the importer to
    /// skip files that already landed.
    pub async fn recorded_output_paths(&self) -> Result<HashSet<String>, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT output_file_path FROM runs
             WHERE output_file_path IS NOT NULL AND TRIM(output_file_path) <> ''",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(path,)| path).collect())
    }

    /// Recovery scan: mark runs left in `running` (a crash mid-batch) as
    /// `interrupted`. Returns the number of runs touched.
    pub async fn mark_interrupted_runs(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE runs SET status = 'interrupted', completed_at = ?
             WHERE status = 'running'",
        )
        .bind(now_iso())
        .execute(&self.pool)
        .await?;
        let touched = result.rows_affected();
        if touched > 0 {
            warn!("Recovery scan marked {touched} run(s) interrupted");
        }
        Ok(touched)
    }

    /// Delete a run; its in-run tender rows go with it (cascade).
    pub async fn delete_run(&self, run_id: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM runs WHERE id = ?")
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Export-view rows for one run, ordered by department then id.
    pub async fn export_rows_for_run(&self, run_id: i64) -> Result<Vec<ExportRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT department_name, published_date, closing_date, opening_date,
                    organisation_chain, title_ref, tender_id_extracted, direct_url, status_url
             FROM v_tender_export
             WHERE run_id = ?
             ORDER BY department_name ASC, tender_id_extracted ASC",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|row| export_row_from(&row)).collect())
    }

    /// Export-view rows for a portal's full current state.
    pub async fn export_rows_for_portal(
        &self,
        portal_name: &str,
    ) -> Result<Vec<ExportRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT department_name, published_date, closing_date, opening_date,
                    organisation_chain, title_ref, tender_id_extracted, direct_url, status_url
             FROM v_tender_export
             WHERE portal_key = ?
             ORDER BY department_name ASC, tender_id_extracted ASC",
        )
        .bind(normalize_portal_name(portal_name))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|row| export_row_from(&row)).collect())
    }

    /// Count of current-state rows for a portal.
    pub async fn tender_count_for_portal(&self, portal_name: &str) -> Result<i64, StoreError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tenders WHERE portal_key = ?")
            .bind(normalize_portal_name(portal_name))
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    /// Close the connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Run `op` once, retrying a single time after a short backoff when the
    /// database reports a conflict. A second failure surfaces as
    /// `StoreError::Conflict`.
    async fn with_conflict_retry<T, F, Fut>(&self, op: F) -> Result<T, StoreError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, StoreError>>,
    {
        match op().await {
            Ok(value) => Ok(value),
            Err(StoreError::Sqlx(sqlx::Error::Database(db_err))) => {
                warn!("Store write conflict ({db_err}); retrying once");
                tokio::time::sleep(CONFLICT_RETRY_DELAY).await;
                match op().await {
                    Ok(value) => Ok(value),
                    Err(StoreError::Sqlx(sqlx::Error::Database(db_err))) => {
                        Err(StoreError::Conflict(db_err.to_string()))
                    }
                    Err(other) => Err(other),
                }
            }
            Err(other) => Err(other),
        }
    }
}

fn export_row_from(row: &sqlx::sqlite::SqliteRow) -> ExportRow {
    ExportRow {
        department_name: row.get::<Option<String>, _>(0).unwrap_or_default(),
        published_date: row.get::<Option<String>, _>(1).unwrap_or_default(),
        closing_date: row.get::<Option<String>, _>(2).unwrap_or_default(),
        opening_date: row.get::<Option<String>, _>(3).unwrap_or_default(),
        organisation_chain: row.get::<Option<String>, _>(4).unwrap_or_default(),
        title_ref: row.get::<Option<String>, _>(5).unwrap_or_default(),
        tender_id_extracted: row.get::<Option<String>, _>(6).unwrap_or_default(),
        direct_url: row.get::<Option<String>, _>(7).unwrap_or_default(),
        status_url: row.get::<Option<String>, _>(8).unwrap_or_default(),
    }
}

/// Local wall-clock timestamp with second precision, matching run records.
#[must_use]
pub fn now_iso() -> String {
    chrono::Local::now().format("%Y-%m-%dT%H:%M:%S").to_string()
}
