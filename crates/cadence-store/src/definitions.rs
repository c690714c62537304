//! Definition store: sequences and their ordered steps.
//!
//! The scheduler consumes definitions read-only. The write side here is the
//! minimum the surrounding CRM's definition layer needs to persist into the
//! shared database (and what tests and the demo seeder use); step
//! numbering/reordering rules are enforced upstream.

use cadence_core::{
    CadenceError, Result, Sequence, SequenceDefinition, SequenceSettings, SequenceStatus, Step,
    StepKind,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use crate::db::SequenceDb;

impl SequenceDb {
    /// Upsert a sequence definition row.
    pub fn save_sequence(&self, sequence: &Sequence) -> Result<()> {
        let settings = serde_json::to_string(&sequence.settings)?;
        self.lock()
            .execute(
                "INSERT OR REPLACE INTO sequences (id, tenant_id, name, status, settings, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    sequence.id,
                    sequence.tenant_id,
                    sequence.name,
                    sequence.status.as_str(),
                    settings,
                    sequence.created_at.to_rfc3339(),
                ],
            )
            .map_err(|e| CadenceError::Store(format!("Save sequence: {e}")))?;
        Ok(())
    }

    /// Upsert a step row.
    pub fn save_step(&self, step: &Step) -> Result<()> {
        let kind = serde_json::to_string(&step.kind)?;
        self.lock()
            .execute(
                "INSERT OR REPLACE INTO steps (id, sequence_id, step_number, kind)
                 VALUES (?1, ?2, ?3, ?4)",
                params![step.id, step.sequence_id, step.step_number, kind],
            )
            .map_err(|e| CadenceError::Store(format!("Save step: {e}")))?;
        Ok(())
    }

    /// Load a sequence by id.
    pub fn sequence(&self, id: &str) -> Result<Option<Sequence>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT id, tenant_id, name, status, settings, created_at
                 FROM sequences WHERE id = ?1",
                [id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| CadenceError::Store(format!("Load sequence: {e}")))?;

        let Some((id, tenant_id, name, status, settings, created_at)) = row else {
            return Ok(None);
        };
        let settings: SequenceSettings = serde_json::from_str(&settings)?;
        Ok(Some(Sequence {
            id,
            tenant_id,
            name,
            status: SequenceStatus::parse(&status)
                .ok_or_else(|| CadenceError::Store(format!("Unknown sequence status: {status}")))?,
            settings,
            created_at: parse_ts(&created_at)?,
        }))
    }

    /// Load a sequence with its ordered steps.
    pub fn definition(&self, sequence_id: &str) -> Result<SequenceDefinition> {
        let sequence = self
            .sequence(sequence_id)?
            .ok_or_else(|| CadenceError::SequenceNotFound(sequence_id.to_string()))?;

        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, sequence_id, step_number, kind FROM steps
                 WHERE sequence_id = ?1 ORDER BY step_number",
            )
            .map_err(|e| CadenceError::Store(format!("Load steps: {e}")))?;
        let rows = stmt
            .query_map([sequence_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, u32>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .map_err(|e| CadenceError::Store(format!("Load steps: {e}")))?;

        let mut steps = Vec::new();
        for row in rows {
            let (id, sequence_id, step_number, kind) =
                row.map_err(|e| CadenceError::Store(format!("Load steps: {e}")))?;
            let kind: StepKind = serde_json::from_str(&kind)?;
            steps.push(Step {
                id,
                sequence_id,
                step_number,
                kind,
            });
        }
        Ok(SequenceDefinition { sequence, steps })
    }

    /// Whether a sequence is in `active` status.
    pub fn is_sequence_active(&self, sequence_id: &str) -> Result<bool> {
        Ok(self
            .sequence(sequence_id)?
            .is_some_and(|s| s.status == SequenceStatus::Active))
    }

    /// Delete a sequence along with its steps, enrollments, and any events
    /// still buffered for those enrollments. Rejected while any referencing
    /// enrollment is still active.
    pub fn delete_sequence(&self, sequence_id: &str) -> Result<()> {
        let conn = self.lock();
        let active: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM enrollments
                 WHERE sequence_id = ?1 AND status = 'active'",
                [sequence_id],
                |row| row.get(0),
            )
            .map_err(|e| CadenceError::Store(format!("Count enrollments: {e}")))?;
        if active > 0 {
            return Err(CadenceError::Conflict(format!(
                "sequence {sequence_id} has {active} active enrollment(s)"
            )));
        }
        conn.execute(
            "DELETE FROM pending_events WHERE enrollment_id IN
             (SELECT id FROM enrollments WHERE sequence_id = ?1)",
            [sequence_id],
        )
        .map_err(|e| CadenceError::Store(format!("Delete pending events: {e}")))?;
        conn.execute("DELETE FROM enrollments WHERE sequence_id = ?1", [sequence_id])
            .map_err(|e| CadenceError::Store(format!("Delete enrollments: {e}")))?;
        conn.execute("DELETE FROM steps WHERE sequence_id = ?1", [sequence_id])
            .map_err(|e| CadenceError::Store(format!("Delete steps: {e}")))?;
        conn.execute("DELETE FROM sequences WHERE id = ?1", [sequence_id])
            .map_err(|e| CadenceError::Store(format!("Delete sequence: {e}")))?;
        Ok(())
    }
}

/// Parse an RFC3339 timestamp stored by this crate.
pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| CadenceError::Store(format!("Bad timestamp '{s}': {e}")))
}

/// Parse an optional RFC3339 timestamp.
pub(crate) fn parse_ts_opt(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.map(|s| parse_ts(&s)).transpose()
}
