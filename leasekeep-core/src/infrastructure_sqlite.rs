//! SQLite-backed resource store and reclaim queue.
//! Lease state and pending reclaims persist across server restarts.
//!
//! Enable with the `sqlite` feature flag:
//! ```toml
//! leasekeep-core = { path = "../leasekeep-core", features = ["sqlite"] }
//! ```

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::time::Duration;

use crate::error::StoreError;
use crate::infrastructure::{
    Mutation, Precondition, ReclaimQueue, Rejection, ResourceStore, UpdateOutcome,
};
use crate::state::LeaseKernel;
use crate::types::*;

const RESOURCE_COLUMNS: &str = "name, acquired_at, period_ms, key";
const JOB_COLUMNS: &str =
    "id, resource, acquired_at, key, period_ms, due_at, attempts, last_error, state";

/// A persistent store backed by SQLite.
///
/// Uses WAL mode. Every transition runs in a `BEGIN IMMEDIATE` transaction,
/// which takes the database write lock before the row is read. Transitions
/// on different resources are therefore serialized here; per-row
/// independence only holds for the in-memory store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a SQLite database at the given path.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(Duration::from_secs(5))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS resources (
                name        TEXT PRIMARY KEY,
                acquired_at INTEGER,
                period_ms   INTEGER,
                key         TEXT,
                CHECK ((acquired_at IS NULL) = (key IS NULL)),
                CHECK (period_ms IS NULL OR acquired_at IS NOT NULL)
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_resources_held_key
                ON resources(key) WHERE key IS NOT NULL;

            CREATE TABLE IF NOT EXISTS reclaim_jobs (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                resource    TEXT NOT NULL,
                acquired_at INTEGER NOT NULL,
                key         TEXT NOT NULL,
                period_ms   INTEGER,
                due_at      INTEGER NOT NULL,
                attempts    INTEGER NOT NULL DEFAULT 0,
                last_error  TEXT,
                state       TEXT NOT NULL DEFAULT 'Pending',
                UNIQUE (resource, acquired_at, key, period_ms)
            );
            CREATE INDEX IF NOT EXISTS idx_reclaim_jobs_due ON reclaim_jobs(state, due_at);",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn parse_job_state(s: &str) -> ReclaimJobState {
        match s {
            "Dead" => ReclaimJobState::Dead,
            _ => ReclaimJobState::Pending,
        }
    }

    fn row_to_resource(row: &rusqlite::Row) -> rusqlite::Result<Resource> {
        Ok(Resource {
            name: row.get(0)?,
            acquired_at: row.get(1)?,
            period_ms: row.get(2)?,
            key: row.get(3)?,
        })
    }

    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<ReclaimJob> {
        let state_str: String = row.get(8)?;

        Ok(ReclaimJob {
            id: row.get(0)?,
            acquisition: Acquisition {
                resource: row.get(1)?,
                acquired_at: row.get(2)?,
                key: row.get(3)?,
                period_ms: row.get(4)?,
            },
            due_at: row.get(5)?,
            attempts: row.get(6)?,
            last_error: row.get(7)?,
            state: Self::parse_job_state(&state_str),
        })
    }
}

impl ResourceStore for SqliteStore {
    fn find_by_name(&self, name: &str) -> Result<Option<Resource>, StoreError> {
        let conn = self.conn.lock();
        let resource = conn
            .query_row(
                &format!("SELECT {RESOURCE_COLUMNS} FROM resources WHERE name = ?1"),
                params![name],
                Self::row_to_resource,
            )
            .optional()?;
        Ok(resource)
    }

    fn find_by_key(&self, key: &str) -> Result<Option<Resource>, StoreError> {
        let conn = self.conn.lock();
        let resource = conn
            .query_row(
                &format!("SELECT {RESOURCE_COLUMNS} FROM resources WHERE key = ?1"),
                params![key],
                Self::row_to_resource,
            )
            .optional()?;
        Ok(resource)
    }

    fn list(&self) -> Result<Vec<Resource>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare(&format!("SELECT {RESOURCE_COLUMNS} FROM resources ORDER BY name"))?;
        let resources = stmt
            .query_map([], Self::row_to_resource)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(resources)
    }

    fn provision(&self, name: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "INSERT OR IGNORE INTO resources (name) VALUES (?1)",
            params![name],
        )?;
        Ok(rows > 0)
    }

    fn transactional_update(
        &self,
        name: &str,
        precondition: &Precondition<'_>,
        mutation: &Mutation<'_>,
    ) -> Result<UpdateOutcome, StoreError> {
        let mut conn = self.conn.lock();
        // Dropping `tx` without commit rolls back.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current = tx
            .query_row(
                &format!("SELECT {RESOURCE_COLUMNS} FROM resources WHERE name = ?1"),
                params![name],
                Self::row_to_resource,
            )
            .optional()?;
        let Some(current) = current else {
            return Ok(UpdateOutcome::Rejected {
                reason: Rejection::NotFound,
                current: None,
            });
        };

        let key_holder: Option<String> = match precondition {
            Precondition::Free {
                unique_key: Some(key),
            } => tx
                .query_row(
                    "SELECT name FROM resources WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?,
            _ => None,
        };

        if let Err(reason) = LeaseKernel::check(precondition, &current, key_holder.as_deref()) {
            return Ok(UpdateOutcome::Rejected {
                reason,
                current: Some(current),
            });
        }

        let next = LeaseKernel::apply(mutation, &current);
        tx.execute(
            "UPDATE resources SET acquired_at = ?2, period_ms = ?3, key = ?4 WHERE name = ?1",
            params![name, next.acquired_at, next.period_ms, next.key],
        )?;
        tx.commit()?;

        Ok(UpdateOutcome::Applied(next))
    }
}

impl ReclaimQueue for SqliteStore {
    fn enqueue(&self, acquisition: &Acquisition, due_at: u64) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "INSERT OR IGNORE INTO reclaim_jobs (resource, acquired_at, key, period_ms, due_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                acquisition.resource,
                acquisition.acquired_at,
                acquisition.key,
                acquisition.period_ms,
                due_at,
            ],
        )?;
        Ok(rows > 0)
    }

    fn due(&self, now: u64, limit: usize) -> Result<Vec<ReclaimJob>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM reclaim_jobs
             WHERE state = 'Pending' AND due_at <= ?1
             ORDER BY due_at, id LIMIT ?2"
        ))?;
        let jobs = stmt
            .query_map(params![now, limit as i64], Self::row_to_job)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    fn complete(&self, id: u64) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM reclaim_jobs WHERE id = ?1", params![id])?;
        Ok(())
    }

    fn retry(&self, id: u64, next_due: u64, error: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE reclaim_jobs SET attempts = attempts + 1, due_at = ?2, last_error = ?3
             WHERE id = ?1",
            params![id, next_due, error],
        )?;
        Ok(())
    }

    fn bury(&self, id: u64, error: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE reclaim_jobs SET attempts = attempts + 1, state = 'Dead', last_error = ?2
             WHERE id = ?1",
            params![id, error],
        )?;
        Ok(())
    }

    fn dead(&self) -> Result<Vec<ReclaimJob>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM reclaim_jobs WHERE state = 'Dead' ORDER BY id"
        ))?;
        let jobs = stmt
            .query_map([], Self::row_to_job)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    fn pending_count(&self) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM reclaim_jobs WHERE state = 'Pending'",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}
