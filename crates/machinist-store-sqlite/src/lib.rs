#![allow(clippy::missing_errors_doc)]

use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use machinist_core::{
    parse_rfc3339_utc, Machine, MachineStore, NewMachine, DESCRIPTION_MAX_CHARS, NAME_MAX_CHARS,
    NAME_MIN_CHARS, YEAR_OF_PRODUCTION_MAX, YEAR_OF_PRODUCTION_MIN,
};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use time::{OffsetDateTime, UtcOffset};
use tracing::debug;
use ulid::Ulid;

const MACHINES_MIGRATION_VERSION: i64 = 1;

pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

fn machines_schema_v1() -> String {
    format!(
        r"
CREATE TABLE IF NOT EXISTS machines (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL CHECK (length(name) BETWEEN {NAME_MIN_CHARS} AND {NAME_MAX_CHARS}),
  description TEXT CHECK (description IS NULL OR length(description) <= {DESCRIPTION_MAX_CHARS}),
  year_of_production INTEGER CHECK (
    year_of_production IS NULL
    OR year_of_production BETWEEN {YEAR_OF_PRODUCTION_MIN} AND {YEAR_OF_PRODUCTION_MAX}
  ),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  deleted INTEGER NOT NULL DEFAULT 0 CHECK (deleted IN (0, 1))
);

CREATE INDEX IF NOT EXISTS idx_machines_deleted_updated
  ON machines(deleted, updated_at DESC);

CREATE TRIGGER IF NOT EXISTS trg_machines_no_delete
BEFORE DELETE ON machines
BEGIN
  SELECT RAISE(FAIL, 'machines are soft-deleted only');
END;

CREATE TRIGGER IF NOT EXISTS trg_machines_identity_immutable
BEFORE UPDATE OF id, created_at ON machines
WHEN NEW.id IS NOT OLD.id OR NEW.created_at IS NOT OLD.created_at
BEGIN
  SELECT RAISE(FAIL, 'machine id and created_at are immutable');
END;

CREATE TRIGGER IF NOT EXISTS trg_machines_no_undelete
BEFORE UPDATE OF deleted ON machines
WHEN OLD.deleted = 1 AND NEW.deleted = 0
BEGIN
  SELECT RAISE(FAIL, 'deleted machines cannot be restored');
END;
"
    )
}

const MACHINE_COLUMNS: &str =
    "id, name, description, year_of_production, created_at, updated_at, deleted";

pub struct SqliteMachineStore {
    conn: Connection,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: Option<i64>,
    pub target_version: i64,
}

impl SqliteMachineStore {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_busy_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    /// Opens `path`, waiting at most `busy_timeout` for a lock held by another
    /// connection. A statement that cannot get its lock in time fails without
    /// writing; [`is_busy`] recognizes that failure.
    pub fn open_with_busy_timeout(path: &Path, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.busy_timeout(busy_timeout).context("failed to set sqlite busy timeout")?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(&machines_schema_v1())
            .context("failed to apply machines schema")?;

        let now = format_sortable(OffsetDateTime::now_utc())?;
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![MACHINES_MIGRATION_VERSION, now],
            )
            .context("failed to register machines schema migration")?;
        if inserted > 0 {
            debug!(version = MACHINES_MIGRATION_VERSION, "applied machines schema migration");
        }

        Ok(())
    }

    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let has_migrations = table_exists(&self.conn, "schema_migrations")?;
        let current_version = if has_migrations {
            self.conn
                .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                    row.get::<_, Option<i64>>(0)
                })
                .context("failed to read schema_migrations")?
        } else {
            None
        };

        Ok(SchemaStatus { current_version, target_version: MACHINES_MIGRATION_VERSION })
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl MachineStore for SqliteMachineStore {
    fn insert(&mut self, machine: NewMachine) -> Result<Machine> {
        let stored = machine.into_machine(Ulid::new().to_string());
        self.conn
            .execute(
                "INSERT INTO machines(id, name, description, year_of_production, created_at, updated_at, deleted)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    stored.id,
                    stored.name,
                    stored.description,
                    stored.year_of_production,
                    format_sortable(stored.created_at)?,
                    format_sortable(stored.updated_at)?,
                    bool_to_sql(stored.deleted),
                ],
            )
            .with_context(|| format!("failed to insert machine {}", stored.id))?;

        Ok(stored)
    }

    fn find_by_id(&self, id: &str) -> Result<Option<Machine>> {
        self.conn
            .query_row(
                &format!("SELECT {MACHINE_COLUMNS} FROM machines WHERE id = ?1"),
                params![id],
                parse_machine_row,
            )
            .optional()
            .with_context(|| format!("failed to load machine {id}"))
    }

    fn find_all_not_deleted(&self) -> Result<Vec<Machine>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {MACHINE_COLUMNS} FROM machines
                 WHERE deleted = 0
                 ORDER BY updated_at DESC, id DESC"
            ))
            .context("failed to prepare machine listing")?;
        let rows = stmt.query_map([], parse_machine_row)?;
        collect_rows(rows).context("failed to list machines")
    }

    fn save(&mut self, machine: &Machine) -> Result<Machine> {
        let changed = self
            .conn
            .execute(
                "UPDATE machines SET
                   name = ?2,
                   description = ?3,
                   year_of_production = ?4,
                   created_at = ?5,
                   updated_at = ?6,
                   deleted = ?7
                 WHERE id = ?1",
                params![
                    machine.id,
                    machine.name,
                    machine.description,
                    machine.year_of_production,
                    format_sortable(machine.created_at)?,
                    format_sortable(machine.updated_at)?,
                    bool_to_sql(machine.deleted),
                ],
            )
            .with_context(|| format!("failed to save machine {}", machine.id))?;

        if changed == 0 {
            return Err(anyhow!("machine {} is not stored", machine.id));
        }

        Ok(machine.clone())
    }
}

/// Reports whether `err` or any of its sources is `SQLite` giving up on a
/// locked database.
#[must_use]
pub fn is_busy(err: &(dyn std::error::Error + 'static)) -> bool {
    std::iter::successors(Some(err), |err| err.source()).any(|err| {
        err.downcast_ref::<rusqlite::Error>().and_then(rusqlite::Error::sqlite_error_code)
            == Some(ErrorCode::DatabaseBusy)
    })
}

/// RFC3339 with a fixed nine-digit fraction, so text order is time order.
fn format_sortable(value: OffsetDateTime) -> Result<String> {
    value
        .to_offset(UtcOffset::UTC)
        .format(time::macros::format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:9]Z"
        ))
        .context("failed to format timestamp")
}

fn parse_machine_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Machine> {
    Ok(Machine {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        year_of_production: row.get(3)?,
        created_at: parse_timestamp_column(row, 4)?,
        updated_at: parse_timestamp_column(row, 5)?,
        deleted: row.get::<_, i64>(6)? != 0,
    })
}

fn parse_timestamp_column(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<OffsetDateTime> {
    let raw: String = row.get(index)?;
    parse_rfc3339_utc(&raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(
            index,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, err.to_string())),
        )
    })
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE type = 'table' AND name = ?1
             LIMIT 1",
            params![table_name],
            |_| Ok(()),
        )
        .optional()
        .context("failed to query sqlite_master")?
        .is_some();

    Ok(exists)
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
