#![allow(clippy::missing_errors_doc)]

//! `SQLite` persistence for runs, playbooks, categories and conditions.
//!
//! [`SqliteStore`] implements every store trait from `runbook_core`, plus the
//! legacy [`runbook_core::KvStore`] layout and the one-shot migration out of it.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rusqlite::functions::FunctionFlags;
use rusqlite::types::{Type, Value};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use runbook_core::{search, RunbookError};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

mod categories;
mod checklists;
mod conditions;
mod kv;
pub mod migration;
mod permissions;
mod platform;
mod playbooks;
pub mod query;
mod runs;
mod schema;

pub use migration::{MigrationReport, MigrationState, SkippedRecord};
pub use schema::KV_MIGRATION_VERSION;

/// Name of the SQL scalar function that applies search normalization.
pub(crate) const NORMALIZE_FN: &str = "rb_normalize";

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub busy_timeout_ms: u64,
    pub journal_mode_wal: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./runbook.sqlite3"),
            busy_timeout_ms: 5000,
            journal_mode_wal: true,
        }
    }
}

impl StoreConfig {
    #[must_use]
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            path: PathBuf::from(":memory:"),
            journal_mode_wal: false,
            ..Self::default()
        }
    }
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
    kv_migration: Mutex<MigrationState>,
}

impl SqliteStore {
    pub fn open(config: &StoreConfig) -> Result<Self> {
        let conn = Connection::open(&config.path).with_context(|| {
            format!("failed to open sqlite database at {}", config.path.display())
        })?;

        if config.journal_mode_wal {
            conn.execute_batch("PRAGMA journal_mode = WAL;")
                .context("failed to enable WAL journal mode")?;
        }
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .context("failed to enable foreign keys")?;
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))
            .context("failed to configure busy timeout")?;
        register_functions(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            kv_migration: Mutex::new(MigrationState::NotStarted),
        })
    }

    pub fn open_path(path: &Path) -> Result<Self> {
        Self::open(&StoreConfig::at(path))
    }

    /// Applies the relational schema. Safe to call repeatedly.
    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(schema::SCHEMA_MIGRATIONS)
            .context("failed to ensure schema_migrations exists")?;
        conn.execute_batch(schema::SCHEMA_V1)
            .context("failed to apply relational schema")?;
        record_version(&conn, schema::SCHEMA_VERSION)
            .context("failed to register relational schema migration")?;
        Ok(())
    }

    /// Highest applied schema version, or 0 before [`Self::migrate`].
    pub fn schema_version(&self) -> Result<i64> {
        let conn = self.conn()?;
        let has_table: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schema_migrations')",
                [],
                |row| row.get(0),
            )
            .context("failed to inspect sqlite_master")?;
        if !has_table {
            return Ok(0);
        }
        let version = conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                row.get::<_, Option<i64>>(0)
            })
            .context("failed to read schema version")?;
        Ok(version.unwrap_or(0))
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("sqlite connection lock poisoned"))
    }
}

fn register_functions(conn: &Connection) -> Result<()> {
    conn.create_scalar_function(
        NORMALIZE_FN,
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let value: Option<String> = ctx.get(0)?;
            Ok(value.map(|text| search::normalize(&text)))
        },
    )
    .context("failed to register search normalization function")
}

pub(crate) fn record_version(conn: &Connection, version: i64) -> Result<()> {
    let now = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .context("failed to format migration timestamp")?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )?;
    Ok(())
}

pub(crate) fn version_applied(conn: &Connection, version: i64) -> Result<bool> {
    let applied = conn
        .query_row(
            "SELECT 1 FROM schema_migrations WHERE version = ?1",
            params![version],
            |row| row.get::<_, i64>(0),
        )
        .optional()
        .context("failed to read schema_migrations")?;
    Ok(applied.is_some())
}

pub(crate) fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

pub(crate) fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

/// `?, ?, ?` for an `IN (...)` list of `count` values.
pub(crate) fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

pub(crate) fn text_values(values: &[String]) -> Vec<Value> {
    values.iter().cloned().map(Value::Text).collect()
}

pub(crate) fn conversion_error(column: usize, kind: Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        kind,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

pub(crate) fn not_found(what: String) -> anyhow::Error {
    anyhow::Error::new(RunbookError::NotFound(what))
}

pub(crate) fn invalid_argument(what: String) -> anyhow::Error {
    anyhow::Error::new(RunbookError::InvalidArgument(what))
}

/// Unique and primary-key violations become `DuplicateEntry`; anything else
/// passes through.
pub(crate) fn write_error(err: rusqlite::Error, what: impl FnOnce() -> String) -> anyhow::Error {
    let duplicate = matches!(
        &err,
        rusqlite::Error::SqliteFailure(inner, _)
            if inner.code == ErrorCode::ConstraintViolation
                && matches!(
                    inner.extended_code,
                    rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                        | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                )
    );
    if duplicate {
        anyhow::Error::new(RunbookError::DuplicateEntry(what()))
    } else {
        anyhow::Error::new(err)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    #![allow(clippy::missing_panics_doc)]

    use super::*;
    use runbook_core::{Checklist, ChecklistItem, Run, RunStatus};

    pub fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    pub fn fixture_store() -> SqliteStore {
        let store = must(SqliteStore::open(&StoreConfig::in_memory()));
        must(store.migrate());
        store
    }

    pub fn fixture_run(name: &str, team_id: &str, channel_id: &str) -> Run {
        Run {
            name: name.to_string(),
            team_id: team_id.to_string(),
            channel_id: channel_id.to_string(),
            owner_user_id: "owner".to_string(),
            reporter_user_id: "owner".to_string(),
            current_status: RunStatus::Reported,
            checklists: vec![
                Checklist::new(
                    "triage",
                    vec![
                        ChecklistItem::new("page oncall"),
                        ChecklistItem::new("open bridge"),
                        ChecklistItem::new("post status"),
                    ],
                ),
                Checklist::new("wrap up", Vec::new()),
            ],
            ..Run::default()
        }
    }
}
