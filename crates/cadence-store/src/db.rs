//! Database handle and schema migrations.

use std::path::Path;
use std::sync::Mutex;

use cadence_core::{CadenceError, Result};
use rusqlite::Connection;

/// SQLite-backed store for sequences, enrollments, and buffered events.
///
/// Each worker process may hold its own `SequenceDb` on the same file; WAL
/// mode plus a busy timeout make concurrent conditional updates safe.
pub struct SequenceDb {
    pub(crate) conn: Mutex<Connection>,
}

impl SequenceDb {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| CadenceError::Store(format!("DB open: {e}")))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| CadenceError::Store(format!("WAL: {e}")))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(|e| CadenceError::Store(format!("busy_timeout: {e}")))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| CadenceError::Store(format!("DB open: {e}")))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        self.lock()
            .execute_batch(
                "
            -- Sequence definitions (read-only for the scheduler)
            CREATE TABLE IF NOT EXISTS sequences (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                name TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'draft',
                settings TEXT NOT NULL DEFAULT '{}',   -- JSON SequenceSettings
                created_at TEXT NOT NULL
            );

            -- Ordered steps; step_number is contiguous from 1 per sequence,
            -- maintained by the definition layer
            CREATE TABLE IF NOT EXISTS steps (
                id TEXT PRIMARY KEY,
                sequence_id TEXT NOT NULL,
                step_number INTEGER NOT NULL,
                kind TEXT NOT NULL,                    -- JSON tagged StepKind
                UNIQUE (sequence_id, step_number),
                FOREIGN KEY (sequence_id) REFERENCES sequences(id) ON DELETE CASCADE
            );

            -- Enrollment execution state. The lease columns implement the
            -- claim manager: claimed rows carry lease_owner until released
            -- or until lease_expires_at passes (crashed worker recovery).
            CREATE TABLE IF NOT EXISTS enrollments (
                id TEXT PRIMARY KEY,
                sequence_id TEXT NOT NULL,
                person_id TEXT NOT NULL,
                current_step INTEGER NOT NULL DEFAULT 1,
                status TEXT NOT NULL DEFAULT 'active',
                next_send_at TEXT,
                completed_at TEXT,
                reply_detected_at TEXT,
                bounce_detected_at TEXT,
                failure_count INTEGER NOT NULL DEFAULT 0,
                ledger TEXT NOT NULL DEFAULT '{}',     -- JSON EngagementLedger
                lease_owner TEXT,
                lease_expires_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (sequence_id) REFERENCES sequences(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_enrollments_due
                ON enrollments (status, next_send_at);
            CREATE INDEX IF NOT EXISTS idx_enrollments_person
                ON enrollments (person_id, sequence_id);

            -- External events buffered while their enrollment is leased;
            -- drained transactionally by the dispatcher around process_step
            CREATE TABLE IF NOT EXISTS pending_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                enrollment_id TEXT NOT NULL,
                step_number INTEGER,
                kind TEXT NOT NULL,
                occurred_at TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_pending_events_enrollment
                ON pending_events (enrollment_id);
         ",
            )
            .map_err(|e| CadenceError::Store(format!("Migration: {e}")))?;
        Ok(())
    }

    pub(crate) fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned mutex means a panic mid-statement; propagating the
        // panic is the only sound option.
        self.conn.lock().expect("sqlite connection mutex poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_and_migrate() {
        let dir = std::env::temp_dir().join("cadence-db-test");
        std::fs::create_dir_all(&dir).ok();
        let db = SequenceDb::open(&dir.join("test.db")).unwrap();
        // Migrations are idempotent
        db.migrate().unwrap();
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_open_in_memory() {
        let db = SequenceDb::open_in_memory().unwrap();
        db.migrate().unwrap();
    }
}
