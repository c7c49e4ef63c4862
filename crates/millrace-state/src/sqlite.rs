//! `SQLite`-backed implementation of [`MetaStore`].
//!
//! Uses a single `Mutex<Connection>` for thread safety; writes serialize
//! here, readers ride the WAL.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use millrace_types::model::{PipelineStatus, Resource, Step, StepDef, Task};
use rusqlite::{Connection, OptionalExtension};

use crate::backend::MetaStore;
use crate::error::{self, StateError};

/// Idempotent DDL for the three metadata tables.
const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS step (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    name      TEXT NOT NULL,
    script    TEXT NOT NULL,
    is_start  INTEGER NOT NULL DEFAULT 0,
    parallel  INTEGER,
    inputs    TEXT NOT NULL DEFAULT '[]',
    version   INTEGER NOT NULL DEFAULT 1,
    UNIQUE (name, version)
);

CREATE TABLE IF NOT EXISTS resource (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL,
    object_hash TEXT NOT NULL,
    created_at  TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE (name, object_hash)
);

CREATE TABLE IF NOT EXISTS task (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    step_id           INTEGER NOT NULL REFERENCES step(id),
    input_resource_id INTEGER REFERENCES resource(id),
    processed         INTEGER NOT NULL DEFAULT 0,
    error             TEXT,
    UNIQUE (step_id, input_resource_id)
);

CREATE INDEX IF NOT EXISTS idx_step_name ON step (name);
CREATE INDEX IF NOT EXISTS idx_resource_name ON resource (name);
CREATE INDEX IF NOT EXISTS idx_task_step ON task (step_id);
CREATE INDEX IF NOT EXISTS idx_task_processed ON task (processed);
CREATE INDEX IF NOT EXISTS idx_task_input_resource ON task (input_resource_id);
";

const STEP_COLS: &str = "id, name, script, is_start, parallel, inputs, version";
const RESOURCE_COLS: &str = "id, name, object_hash, created_at";
const TASK_COLS: &str = "id, step_id, input_resource_id, processed, error";

/// `SQLite`-backed metadata storage.
///
/// Create with [`SqliteMetaStore::open`] for file-backed persistence or
/// [`SqliteMetaStore::in_memory`] for tests.
pub struct SqliteMetaStore {
    conn: Mutex<Connection>,
}

/// A step row before the `inputs` JSON column is decoded.
struct RawStep {
    id: i64,
    name: String,
    script: String,
    is_start: bool,
    parallel: Option<i64>,
    inputs: String,
    version: i64,
}

fn raw_step(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawStep> {
    Ok(RawStep {
        id: row.get(0)?,
        name: row.get(1)?,
        script: row.get(2)?,
        is_start: row.get(3)?,
        parallel: row.get(4)?,
        inputs: row.get(5)?,
        version: row.get(6)?,
    })
}

fn decode_step(raw: RawStep) -> error::Result<Step> {
    let inputs: Vec<String> = serde_json::from_str(&raw.inputs)?;
    Ok(Step {
        id: raw.id,
        name: raw.name,
        script: raw.script,
        is_start: raw.is_start,
        parallel: raw.parallel.and_then(|p| u32::try_from(p).ok()),
        inputs,
        version: raw.version,
    })
}

fn resource_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Resource> {
    Ok(Resource {
        id: row.get(0)?,
        name: row.get(1)?,
        object_hash: row.get(2)?,
        created_at: row.get(3)?,
    })
}

fn task_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        step_id: row.get(1)?,
        input_resource_id: row.get(2)?,
        processed: row.get(3)?,
        error: row.get(4)?,
    })
}

fn encode_inputs(inputs: &[String]) -> error::Result<String> {
    Ok(serde_json::to_string(inputs)?)
}

impl SqliteMetaStore {
    /// Open or create the metadata database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Io`] if the parent directory can't be
    /// created, or [`StateError::Sqlite`] if the database can't be opened
    /// or initialized.
    pub fn open(path: &Path) -> error::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(60))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory metadata store (for testing).
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Sqlite`] if the in-memory database can't be
    /// initialized.
    pub fn in_memory() -> error::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Acquire the connection lock.
    fn lock_conn(&self) -> error::Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StateError::LockPoisoned)
    }

    fn query_step(
        conn: &Connection,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> error::Result<Option<Step>> {
        conn.query_row(sql, params, raw_step)
            .optional()?
            .map(decode_step)
            .transpose()
    }

    fn query_resources(
        conn: &Connection,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> error::Result<Vec<Resource>> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, resource_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

impl MetaStore for SqliteMetaStore {
    fn upsert_step(&self, def: &StepDef) -> error::Result<i64> {
        let inputs_json = encode_inputs(&def.inputs)?;
        let conn = self.lock_conn()?;
        let tx = conn.unchecked_transaction()?;

        let latest: Option<(i64, String, String)> = tx
            .query_row(
                "SELECT id, script, inputs FROM step \
                 WHERE name = ?1 ORDER BY version DESC LIMIT 1",
                [&def.name],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        if let Some((id, script, inputs)) = latest {
            if script == def.script && inputs == inputs_json {
                tx.execute(
                    "UPDATE step SET is_start = ?1, parallel = ?2 WHERE id = ?3",
                    rusqlite::params![def.is_start, def.parallel, id],
                )?;
                tx.commit()?;
                return Ok(id);
            }
        }

        let version: i64 = tx.query_row(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM step WHERE name = ?1",
            [&def.name],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO step (name, script, is_start, parallel, inputs, version) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                def.name,
                def.script,
                def.is_start,
                def.parallel,
                inputs_json,
                version
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }

    fn step_by_id(&self, id: i64) -> error::Result<Option<Step>> {
        let conn = self.lock_conn()?;
        Self::query_step(
            &conn,
            &format!("SELECT {STEP_COLS} FROM step WHERE id = ?1"),
            [id],
        )
    }

    fn current_step(&self, name: &str) -> error::Result<Option<Step>> {
        let conn = self.lock_conn()?;
        Self::query_step(
            &conn,
            &format!("SELECT {STEP_COLS} FROM step WHERE name = ?1 ORDER BY version DESC LIMIT 1"),
            [name],
        )
    }

    fn start_step(&self) -> error::Result<Option<Step>> {
        let conn = self.lock_conn()?;
        Self::query_step(
            &conn,
            &format!(
                "SELECT {STEP_COLS} FROM step WHERE is_start = 1 ORDER BY version DESC LIMIT 1"
            ),
            [],
        )
    }

    fn tainted_steps(&self) -> error::Result<Vec<Step>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT s1.id, s1.name, s1.script, s1.is_start, s1.parallel, s1.inputs, s1.version \
             FROM step s1 \
             JOIN step s2 ON s2.name = s1.name \
             WHERE s1.version < s2.version \
               AND (s1.script <> s2.script OR s1.inputs <> s2.inputs) \
             GROUP BY s1.id \
             ORDER BY s1.name, s1.version",
        ))?;
        let raws = stmt
            .query_map([], raw_step)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raws.into_iter().map(decode_step).collect()
    }

    fn migrate_tainted_tasks(&self, tainted_step_id: i64) -> error::Result<u64> {
        let conn = self.lock_conn()?;
        let tx = conn.unchecked_transaction()?;

        let name: String = tx
            .query_row(
                "SELECT name FROM step WHERE id = ?1",
                [tainted_step_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(StateError::UnknownStep(tainted_step_id))?;
        let latest_id: i64 = tx.query_row(
            "SELECT id FROM step WHERE name = ?1 ORDER BY version DESC LIMIT 1",
            [&name],
            |row| row.get(0),
        )?;
        if latest_id == tainted_step_id {
            tx.commit()?;
            return Ok(0);
        }

        // The UNIQUE constraint does not dedupe NULL inputs, so the seed
        // task needs an explicit existence guard.
        let migrated = tx.execute(
            "INSERT INTO task (step_id, input_resource_id, processed, error) \
             SELECT ?1, t.input_resource_id, 0, NULL \
             FROM task t \
             WHERE t.step_id = ?2 \
               AND (t.input_resource_id IS NOT NULL \
                    OR NOT EXISTS (SELECT 1 FROM task x \
                                   WHERE x.step_id = ?1 AND x.input_resource_id IS NULL)) \
             ON CONFLICT (step_id, input_resource_id) DO NOTHING",
            rusqlite::params![latest_id, tainted_step_id],
        )?;
        tx.commit()?;
        Ok(migrated as u64)
    }

    fn create_resource(&self, name: &str, object_hash: &str) -> error::Result<i64> {
        let conn = self.lock_conn()?;
        // Insert-on-conflict-do-nothing then select, so concurrent
        // identical inserts converge on one row.
        conn.execute(
            "INSERT INTO resource (name, object_hash) VALUES (?1, ?2) \
             ON CONFLICT (name, object_hash) DO NOTHING",
            rusqlite::params![name, object_hash],
        )?;
        let id = conn.query_row(
            "SELECT id FROM resource WHERE name = ?1 AND object_hash = ?2",
            rusqlite::params![name, object_hash],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    fn resource_by_id(&self, id: i64) -> error::Result<Option<Resource>> {
        let conn = self.lock_conn()?;
        Ok(conn
            .query_row(
                &format!("SELECT {RESOURCE_COLS} FROM resource WHERE id = ?1"),
                [id],
                resource_from_row,
            )
            .optional()?)
    }

    fn resources_by_name(&self, name: &str) -> error::Result<Vec<Resource>> {
        let conn = self.lock_conn()?;
        Self::query_resources(
            &conn,
            &format!(
                "SELECT {RESOURCE_COLS} FROM resource WHERE name = ?1 \
                 ORDER BY created_at DESC, id DESC"
            ),
            [name],
        )
    }

    fn unconsumed_resources(
        &self,
        name: &str,
        consuming_step_id: i64,
    ) -> error::Result<Vec<Resource>> {
        let conn = self.lock_conn()?;
        Self::query_resources(
            &conn,
            &format!(
                "SELECT {RESOURCE_COLS} FROM resource r \
                 WHERE r.name = ?1 \
                   AND NOT EXISTS (SELECT 1 FROM task t \
                                   WHERE t.step_id = ?2 AND t.input_resource_id = r.id) \
                 ORDER BY r.created_at DESC, r.id DESC"
            ),
            rusqlite::params![name, consuming_step_id],
        )
    }

    fn schedule_tasks_for_step(&self, step_id: i64) -> error::Result<u64> {
        let inputs = {
            let conn = self.lock_conn()?;
            Self::query_step(
                &conn,
                &format!("SELECT {STEP_COLS} FROM step WHERE id = ?1"),
                [step_id],
            )?
            .ok_or(StateError::UnknownStep(step_id))?
            .inputs
        };
        if inputs.is_empty() {
            return Ok(0);
        }
        let inputs_json = encode_inputs(&inputs)?;

        let conn = self.lock_conn()?;
        let inserted = conn.execute(
            "INSERT INTO task (step_id, input_resource_id, processed, error) \
             SELECT ?1, r.id, 0, NULL \
             FROM resource r \
             WHERE r.name IN (SELECT value FROM json_each(?2)) \
               AND NOT EXISTS (SELECT 1 FROM task t \
                               WHERE t.step_id = ?1 AND t.input_resource_id = r.id)",
            rusqlite::params![step_id, inputs_json],
        )?;
        Ok(inserted as u64)
    }

    fn create_seed_task(&self, step_id: i64) -> error::Result<Option<i64>> {
        let conn = self.lock_conn()?;
        let inserted = conn.execute(
            "INSERT INTO task (step_id, input_resource_id, processed, error) \
             SELECT ?1, NULL, 0, NULL \
             WHERE NOT EXISTS (SELECT 1 FROM task WHERE step_id = ?1)",
            [step_id],
        )?;
        if inserted == 0 {
            Ok(None)
        } else {
            Ok(Some(conn.last_insert_rowid()))
        }
    }

    fn unprocessed_tasks(&self, step_id: i64) -> error::Result<Vec<Task>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLS} FROM task \
             WHERE step_id = ?1 AND processed = 0 ORDER BY id"
        ))?;
        let rows = stmt.query_map([step_id], task_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn mark_processed(&self, task_id: i64, error: Option<&str>) -> error::Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE task SET processed = 1, error = ?2 WHERE id = ?1",
            rusqlite::params![task_id, error],
        )?;
        Ok(())
    }

    fn mark_step_undone(&self, step_id: i64) -> error::Result<u64> {
        let conn = self.lock_conn()?;
        let deleted = conn.execute("DELETE FROM task WHERE step_id = ?1", [step_id])?;
        Ok(deleted as u64)
    }

    fn reset_step_tasks(&self, step_id: i64) -> error::Result<u64> {
        let conn = self.lock_conn()?;
        let reset = conn.execute(
            "UPDATE task SET processed = 0, error = NULL WHERE step_id = ?1",
            [step_id],
        )?;
        Ok(reset as u64)
    }

    fn count_tasks_for_step(&self, step_id: i64) -> error::Result<u64> {
        let conn = self.lock_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM task WHERE step_id = ?1",
            [step_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn count_resources(&self) -> error::Result<u64> {
        let conn = self.lock_conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM resource", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn pipeline_status(&self) -> error::Result<PipelineStatus> {
        let conn = self.lock_conn()?;
        let total: i64 = conn.query_row("SELECT COUNT(*) FROM task", [], |row| row.get(0))?;
        let processed: i64 = conn.query_row(
            "SELECT COUNT(*) FROM task WHERE processed = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(PipelineStatus {
            total_tasks: total as u64,
            processed_tasks: processed as u64,
        })
    }

    fn checkpoint(&self) -> error::Result<()> {
        let conn = self.lock_conn()?;
        // wal_checkpoint returns a (busy, log, checkpointed) row.
        conn.query_row("PRAGMA wal_checkpoint(RESTART)", [], |_| Ok(()))?;
        Ok(())
    }
}
