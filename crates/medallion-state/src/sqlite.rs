//! `SQLite`-backed implementation of [`StateBackend`].
//!
//! Uses a single `Mutex<Connection>` for thread safety.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{NaiveDateTime, Utc};
use medallion_types::error::ErrorCategory;
use medallion_types::schema::Schema;
use medallion_types::state::{
    CursorState, PipelineId, ProcessedFile, RunRecord, RunStats, StageState, StageStatus,
    TableName, TriggerOutcome, ViolationRecord,
};
use rusqlite::{Connection, OptionalExtension};

use crate::backend::StateBackend;
use crate::error::{self, StateError};

/// `SQLite` datetime format (UTC, no timezone suffix).
const SQLITE_DATETIME_FMT: &str = "%Y-%m-%d %H:%M:%S";

/// Idempotent DDL for state tables.
const CREATE_TABLES: &str = r"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS processed_files (
    pipeline TEXT NOT NULL,
    table_name TEXT NOT NULL,
    path TEXT NOT NULL,
    size INTEGER NOT NULL,
    modified_ms INTEGER NOT NULL,
    records INTEGER NOT NULL DEFAULT 0,
    parse_errors INTEGER NOT NULL DEFAULT 0,
    processed_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (pipeline, table_name, path, size, modified_ms)
);

CREATE TABLE IF NOT EXISTS stage_cursors (
    pipeline TEXT NOT NULL,
    table_name TEXT NOT NULL,
    cursor_key TEXT NOT NULL,
    cursor_field TEXT,
    cursor_value TEXT,
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (pipeline, table_name, cursor_key)
);

CREATE TABLE IF NOT EXISTS stage_status (
    pipeline TEXT NOT NULL,
    table_name TEXT NOT NULL,
    status TEXT NOT NULL,
    reason TEXT,
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (pipeline, table_name)
);

CREATE TABLE IF NOT EXISTS table_schemas (
    pipeline TEXT NOT NULL,
    table_name TEXT NOT NULL,
    schema_json TEXT NOT NULL,
    schema_version INTEGER NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (pipeline, table_name)
);

CREATE TABLE IF NOT EXISTS stage_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pipeline TEXT NOT NULL,
    table_name TEXT NOT NULL,
    outcome TEXT NOT NULL,
    started_at TEXT NOT NULL DEFAULT (datetime('now')),
    finished_at TEXT,
    records_in INTEGER DEFAULT 0,
    records_out INTEGER DEFAULT 0,
    records_dropped INTEGER DEFAULT 0,
    records_warned INTEGER DEFAULT 0,
    parse_errors INTEGER DEFAULT 0,
    files_processed INTEGER DEFAULT 0,
    error_category TEXT,
    error_message TEXT
);

CREATE INDEX IF NOT EXISTS idx_runs_pipeline_table ON stage_runs (pipeline, table_name);

CREATE TABLE IF NOT EXISTS violation_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pipeline TEXT NOT NULL,
    run_id INTEGER NOT NULL REFERENCES stage_runs(id),
    table_name TEXT NOT NULL,
    constraint_name TEXT NOT NULL,
    policy TEXT NOT NULL,
    record_json TEXT NOT NULL,
    message TEXT NOT NULL,
    occurred_at TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_violations_pipeline_table
    ON violation_records (pipeline, table_name);
";

/// `SQLite`-backed state storage.
///
/// Create with [`SqliteStateBackend::open`] for file-backed persistence
/// or [`SqliteStateBackend::in_memory`] for tests.
pub struct SqliteStateBackend {
    conn: Mutex<Connection>,
}

impl SqliteStateBackend {
    /// Open or create a `SQLite` state database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Io`] if the directory can't be created,
    /// or [`StateError::Backend`] if the database can't be opened.
    pub fn open(path: &Path) -> error::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(StateError::backend)?;
        conn.execute_batch(CREATE_TABLES)
            .map_err(|e| StateError::backend_context("open: create tables", e))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory `SQLite` backend (for tests and ephemeral runs).
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Backend`] if the in-memory database can't
    /// be initialized.
    pub fn in_memory() -> error::Result<Self> {
        let conn = Connection::open_in_memory().map_err(StateError::backend)?;
        conn.execute_batch(CREATE_TABLES)
            .map_err(|e| StateError::backend_context("in_memory: create tables", e))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Acquire the connection lock.
    fn lock_conn(&self) -> error::Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StateError::LockPoisoned)
    }

    /// Format current UTC time for `SQLite` storage.
    fn now_sqlite() -> String {
        Utc::now().format(SQLITE_DATETIME_FMT).to_string()
    }

    /// Convert a `SQLite` datetime string to ISO-8601.
    fn sqlite_to_iso8601(raw: &str) -> String {
        NaiveDateTime::parse_from_str(raw, SQLITE_DATETIME_FMT).map_or_else(
            |_| raw.to_string(),
            |ndt| format!("{}Z", ndt.format("%Y-%m-%dT%H:%M:%S")),
        )
    }

    /// Convert an ISO-8601 string to `SQLite` datetime format.
    fn iso8601_to_sqlite(iso: &str) -> String {
        chrono::DateTime::parse_from_rfc3339(iso).map_or_else(
            |_| iso.to_string(),
            |dt| dt.format(SQLITE_DATETIME_FMT).to_string(),
        )
    }

    #[allow(clippy::cast_sign_loss)]
    fn to_u64(v: i64) -> u64 {
        v.max(0) as u64
    }

    #[cfg(test)]
    fn count_violations_for_run(&self, pipeline: &PipelineId, run_id: i64) -> error::Result<i64> {
        let conn = self.lock_conn()?;
        conn.query_row(
            "SELECT COUNT(*) FROM violation_records WHERE pipeline = ?1 AND run_id = ?2",
            rusqlite::params![pipeline.as_str(), run_id],
            |row| row.get(0),
        )
        .map_err(StateError::backend)
    }
}

impl StateBackend for SqliteStateBackend {
    fn processed_files(
        &self,
        pipeline: &PipelineId,
        table: &TableName,
    ) -> error::Result<Vec<ProcessedFile>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT path, size, modified_ms, records, parse_errors FROM processed_files \
                 WHERE pipeline = ?1 AND table_name = ?2 ORDER BY modified_ms, path",
            )
            .map_err(|e| StateError::backend_context("processed_files: prepare", e))?;
        let rows = stmt
            .query_map(
                rusqlite::params![pipeline.as_str(), table.as_str()],
                |row| {
                    Ok(ProcessedFile {
                        path: row.get(0)?,
                        size: Self::to_u64(row.get(1)?),
                        modified_ms: row.get(2)?,
                        records: Self::to_u64(row.get(3)?),
                        parse_errors: Self::to_u64(row.get(4)?),
                    })
                },
            )
            .map_err(|e| StateError::backend_context("processed_files: query", e))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| StateError::backend_context("processed_files: row", e))
    }

    #[allow(clippy::cast_possible_wrap)]
    fn mark_files_processed(
        &self,
        pipeline: &PipelineId,
        table: &TableName,
        files: &[ProcessedFile],
    ) -> error::Result<()> {
        if files.is_empty() {
            return Ok(());
        }

        let conn = self.lock_conn()?;
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| StateError::backend_context("mark_files_processed: begin tx", e))?;
        let mut stmt = tx
            .prepare(
                "INSERT OR IGNORE INTO processed_files \
                 (pipeline, table_name, path, size, modified_ms, records, parse_errors) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )
            .map_err(|e| StateError::backend_context("mark_files_processed: prepare", e))?;
        for file in files {
            stmt.execute(rusqlite::params![
                pipeline.as_str(),
                table.as_str(),
                file.path,
                file.size as i64,
                file.modified_ms,
                file.records as i64,
                file.parse_errors as i64,
            ])
            .map_err(|e| StateError::backend_context("mark_files_processed: execute", e))?;
        }
        drop(stmt);
        tx.commit()
            .map_err(|e| StateError::backend_context("mark_files_processed: commit", e))
    }

    fn get_cursor(
        &self,
        pipeline: &PipelineId,
        table: &TableName,
        key: &str,
    ) -> error::Result<Option<CursorState>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT cursor_field, cursor_value, updated_at FROM stage_cursors \
                 WHERE pipeline = ?1 AND table_name = ?2 AND cursor_key = ?3",
            )
            .map_err(StateError::backend)?;

        let result = stmt.query_row(
            rusqlite::params![pipeline.as_str(), table.as_str(), key],
            |row| {
                let cursor_field: Option<String> = row.get(0)?;
                let cursor_value: Option<String> = row.get(1)?;
                let updated_at_str: String = row.get(2)?;
                Ok((cursor_field, cursor_value, updated_at_str))
            },
        );

        match result {
            Ok((cursor_field, cursor_value, updated_at_str)) => Ok(Some(CursorState {
                cursor_field,
                cursor_value,
                updated_at: Self::sqlite_to_iso8601(&updated_at_str),
            })),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StateError::backend(e)),
        }
    }

    fn set_cursor(
        &self,
        pipeline: &PipelineId,
        table: &TableName,
        key: &str,
        cursor: &CursorState,
    ) -> error::Result<()> {
        let conn = self.lock_conn()?;
        let updated_at = Self::iso8601_to_sqlite(&cursor.updated_at);
        conn.execute(
            "INSERT INTO stage_cursors \
             (pipeline, table_name, cursor_key, cursor_field, cursor_value, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(pipeline, table_name, cursor_key) \
             DO UPDATE SET cursor_field = ?4, cursor_value = ?5, updated_at = ?6",
            rusqlite::params![
                pipeline.as_str(),
                table.as_str(),
                key,
                cursor.cursor_field,
                cursor.cursor_value,
                updated_at,
            ],
        )
        .map_err(StateError::backend)?;
        Ok(())
    }

    fn get_schema(
        &self,
        pipeline: &PipelineId,
        table: &TableName,
    ) -> error::Result<Option<Schema>> {
        let conn = self.lock_conn()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT schema_json FROM table_schemas WHERE pipeline = ?1 AND table_name = ?2",
                rusqlite::params![pipeline.as_str(), table.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StateError::backend_context("get_schema", e))?;
        raw.map(|json| serde_json::from_str(&json).map_err(StateError::from))
            .transpose()
    }

    #[allow(clippy::cast_possible_wrap)]
    fn set_schema(
        &self,
        pipeline: &PipelineId,
        table: &TableName,
        schema: &Schema,
    ) -> error::Result<()> {
        let json = serde_json::to_string(schema)?;
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO table_schemas (pipeline, table_name, schema_json, schema_version, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(pipeline, table_name) \
             DO UPDATE SET schema_json = ?3, schema_version = ?4, updated_at = ?5",
            rusqlite::params![
                pipeline.as_str(),
                table.as_str(),
                json,
                schema.version() as i64,
                Self::now_sqlite(),
            ],
        )
        .map_err(|e| StateError::backend_context("set_schema", e))?;
        Ok(())
    }

    fn get_stage_status(
        &self,
        pipeline: &PipelineId,
        table: &TableName,
    ) -> error::Result<Option<StageState>> {
        let conn = self.lock_conn()?;
        let row: Option<(String, Option<String>, String)> = conn
            .query_row(
                "SELECT status, reason, updated_at FROM stage_status \
                 WHERE pipeline = ?1 AND table_name = ?2",
                rusqlite::params![pipeline.as_str(), table.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(|e| StateError::backend_context("get_stage_status", e))?;

        Ok(row.map(|(status, reason, updated_at)| StageState {
            status: StageStatus::parse(&status).unwrap_or_default(),
            reason,
            updated_at: Self::sqlite_to_iso8601(&updated_at),
        }))
    }

    fn set_stage_status(
        &self,
        pipeline: &PipelineId,
        table: &TableName,
        status: StageStatus,
        reason: Option<&str>,
    ) -> error::Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO stage_status (pipeline, table_name, status, reason, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(pipeline, table_name) \
             DO UPDATE SET status = ?3, reason = ?4, updated_at = ?5",
            rusqlite::params![
                pipeline.as_str(),
                table.as_str(),
                status.as_str(),
                reason,
                Self::now_sqlite(),
            ],
        )
        .map_err(|e| StateError::backend_context("set_stage_status", e))?;
        Ok(())
    }

    fn clear_table_state(&self, pipeline: &PipelineId, table: &TableName) -> error::Result<()> {
        let conn = self.lock_conn()?;
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| StateError::backend_context("clear_table_state: begin tx", e))?;
        for sql in [
            "DELETE FROM processed_files WHERE pipeline = ?1 AND table_name = ?2",
            "DELETE FROM stage_cursors WHERE pipeline = ?1 AND table_name = ?2",
            "DELETE FROM table_schemas WHERE pipeline = ?1 AND table_name = ?2",
        ] {
            tx.execute(sql, rusqlite::params![pipeline.as_str(), table.as_str()])
                .map_err(|e| StateError::backend_context("clear_table_state: delete", e))?;
        }
        tx.commit()
            .map_err(|e| StateError::backend_context("clear_table_state: commit", e))
    }

    fn start_run(&self, pipeline: &PipelineId, table: &TableName) -> error::Result<i64> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO stage_runs (pipeline, table_name, outcome) VALUES (?1, ?2, ?3)",
            rusqlite::params![
                pipeline.as_str(),
                table.as_str(),
                TriggerOutcome::Running.as_str()
            ],
        )
        .map_err(|e| StateError::backend_context("start_run", e))?;
        Ok(conn.last_insert_rowid())
    }

    #[allow(clippy::cast_possible_wrap)]
    fn complete_run(
        &self,
        run_id: i64,
        outcome: TriggerOutcome,
        stats: &RunStats,
    ) -> error::Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE stage_runs SET outcome = ?1, finished_at = datetime('now'), \
             records_in = ?2, records_out = ?3, records_dropped = ?4, records_warned = ?5, \
             parse_errors = ?6, files_processed = ?7, error_category = ?8, error_message = ?9 \
             WHERE id = ?10",
            rusqlite::params![
                outcome.as_str(),
                stats.records_in as i64,
                stats.records_out as i64,
                stats.records_dropped as i64,
                stats.records_warned as i64,
                stats.parse_errors as i64,
                stats.files_processed as i64,
                stats.error_category.map(ErrorCategory::as_str),
                stats.error_message,
                run_id,
            ],
        )
        .map_err(|e| StateError::backend_context("complete_run", e))?;
        Ok(())
    }

    #[allow(clippy::cast_possible_wrap)]
    fn list_runs(
        &self,
        pipeline: &PipelineId,
        table: Option<&TableName>,
        limit: usize,
    ) -> error::Result<Vec<RunRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, table_name, outcome, started_at, finished_at, records_in, \
                 records_out, records_dropped, records_warned, parse_errors, files_processed, \
                 error_category, error_message FROM stage_runs \
                 WHERE pipeline = ?1 AND (?2 IS NULL OR table_name = ?2) \
                 ORDER BY id DESC LIMIT ?3",
            )
            .map_err(|e| StateError::backend_context("list_runs: prepare", e))?;
        let rows = stmt
            .query_map(
                rusqlite::params![
                    pipeline.as_str(),
                    table.map(TableName::as_str),
                    limit as i64
                ],
                |row| {
                    let outcome: String = row.get(2)?;
                    let started_at: String = row.get(3)?;
                    let finished_at: Option<String> = row.get(4)?;
                    let category: Option<String> = row.get(11)?;
                    Ok(RunRecord {
                        run_id: row.get(0)?,
                        table: TableName::new(row.get::<_, String>(1)?),
                        outcome: TriggerOutcome::parse(&outcome)
                            .unwrap_or(TriggerOutcome::Failure),
                        started_at: Self::sqlite_to_iso8601(&started_at),
                        finished_at: finished_at.as_deref().map(Self::sqlite_to_iso8601),
                        stats: RunStats {
                            records_in: Self::to_u64(row.get(5)?),
                            records_out: Self::to_u64(row.get(6)?),
                            records_dropped: Self::to_u64(row.get(7)?),
                            records_warned: Self::to_u64(row.get(8)?),
                            parse_errors: Self::to_u64(row.get(9)?),
                            files_processed: Self::to_u64(row.get(10)?),
                            error_category: category.as_deref().and_then(ErrorCategory::parse),
                            error_message: row.get(12)?,
                        },
                    })
                },
            )
            .map_err(|e| StateError::backend_context("list_runs: query", e))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| StateError::backend_context("list_runs: row", e))
    }

    fn insert_violations(
        &self,
        pipeline: &PipelineId,
        run_id: i64,
        records: &[ViolationRecord],
    ) -> error::Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        let conn = self.lock_conn()?;
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| StateError::backend_context("insert_violations: begin tx", e))?;
        let mut stmt = tx
            .prepare(
                "INSERT INTO violation_records \
                 (pipeline, run_id, table_name, constraint_name, policy, record_json, message, occurred_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )
            .map_err(|e| StateError::backend_context("insert_violations: prepare", e))?;

        let mut count = 0u64;
        for record in records {
            stmt.execute(rusqlite::params![
                pipeline.as_str(),
                run_id,
                record.table.as_str(),
                record.constraint,
                record.policy.as_str(),
                record.record_json,
                record.message,
                record.occurred_at,
            ])
            .map_err(|e| StateError::backend_context("insert_violations: execute", e))?;
            count += 1;
        }
        drop(stmt);
        tx.commit()
            .map_err(|e| StateError::backend_context("insert_violations: commit", e))?;

        Ok(count)
    }

    fn violation_counts(
        &self,
        pipeline: &PipelineId,
        table: &TableName,
    ) -> error::Result<Vec<(String, u64)>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT constraint_name, COUNT(*) FROM violation_records \
                 WHERE pipeline = ?1 AND table_name = ?2 \
                 GROUP BY constraint_name ORDER BY constraint_name",
            )
            .map_err(|e| StateError::backend_context("violation_counts: prepare", e))?;
        let rows = stmt
            .query_map(
                rusqlite::params![pipeline.as_str(), table.as_str()],
                |row| Ok((row.get::<_, String>(0)?, Self::to_u64(row.get(1)?))),
            )
            .map_err(|e| StateError::backend_context("violation_counts: query", e))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| StateError::backend_context("violation_counts: row", e))
    }
}
