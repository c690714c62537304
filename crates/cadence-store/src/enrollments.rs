//! Enrollment repository, claim manager, and pending-event buffer.
//!
//! Claiming is the one real race in the system. It is closed by a single
//! conditional UPDATE per row: a worker owns an enrollment only if its
//! UPDATE matched, and an expired lease is reclaimable by anyone: the sole
//! crash-recovery mechanism for dead workers.

use cadence_core::{
    CadenceError, EngagementEvent, EngagementLedger, Enrollment, EnrollmentStatus, EventKind,
    EventTarget, Result,
};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension, Row};

use crate::db::SequenceDb;
use crate::definitions::{parse_ts, parse_ts_opt};

impl SequenceDb {
    /// Create an enrollment, enforcing the one-live-enrollment invariant:
    /// rejected while an active or paused enrollment already exists for the
    /// same (person, sequence) pair. Atomic: the guard and the insert are
    /// one statement.
    pub fn insert_enrollment(&self, enrollment: &Enrollment) -> Result<()> {
        let ledger = serde_json::to_string(&enrollment.ledger)?;
        let changes = self
            .lock()
            .execute(
                "INSERT INTO enrollments
                 (id, sequence_id, person_id, current_step, status, next_send_at,
                  completed_at, reply_detected_at, bounce_detected_at, failure_count,
                  ledger, lease_owner, lease_expires_at, created_at, updated_at)
                 SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15
                 WHERE NOT EXISTS (
                     SELECT 1 FROM enrollments
                     WHERE person_id = ?3 AND sequence_id = ?2
                       AND status IN ('active', 'paused')
                 )",
                params![
                    enrollment.id,
                    enrollment.sequence_id,
                    enrollment.person_id,
                    enrollment.current_step,
                    enrollment.status.as_str(),
                    enrollment.next_send_at.map(|t| t.to_rfc3339()),
                    enrollment.completed_at.map(|t| t.to_rfc3339()),
                    enrollment.reply_detected_at.map(|t| t.to_rfc3339()),
                    enrollment.bounce_detected_at.map(|t| t.to_rfc3339()),
                    enrollment.failure_count,
                    ledger,
                    enrollment.lease_owner,
                    enrollment.lease_expires_at.map(|t| t.to_rfc3339()),
                    enrollment.created_at.to_rfc3339(),
                    enrollment.updated_at.to_rfc3339(),
                ],
            )
            .map_err(|e| CadenceError::Store(format!("Insert enrollment: {e}")))?;
        if changes == 0 {
            return Err(CadenceError::Conflict(format!(
                "person {} already has a live enrollment in sequence {}",
                enrollment.person_id, enrollment.sequence_id
            )));
        }
        Ok(())
    }

    /// Unconditional upsert. Used by a worker that holds the lease (single
    /// writer once claimed) and by tests.
    pub fn save_enrollment(&self, enrollment: &Enrollment) -> Result<()> {
        let ledger = serde_json::to_string(&enrollment.ledger)?;
        self.lock()
            .execute(
                "INSERT OR REPLACE INTO enrollments
                 (id, sequence_id, person_id, current_step, status, next_send_at,
                  completed_at, reply_detected_at, bounce_detected_at, failure_count,
                  ledger, lease_owner, lease_expires_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    enrollment.id,
                    enrollment.sequence_id,
                    enrollment.person_id,
                    enrollment.current_step,
                    enrollment.status.as_str(),
                    enrollment.next_send_at.map(|t| t.to_rfc3339()),
                    enrollment.completed_at.map(|t| t.to_rfc3339()),
                    enrollment.reply_detected_at.map(|t| t.to_rfc3339()),
                    enrollment.bounce_detected_at.map(|t| t.to_rfc3339()),
                    enrollment.failure_count,
                    ledger,
                    enrollment.lease_owner,
                    enrollment.lease_expires_at.map(|t| t.to_rfc3339()),
                    enrollment.created_at.to_rfc3339(),
                    enrollment.updated_at.to_rfc3339(),
                ],
            )
            .map_err(|e| CadenceError::Store(format!("Save enrollment: {e}")))?;
        Ok(())
    }

    /// Guarded write for the event ingestor: applies only while the row is
    /// unleased (or the lease expired) and untouched since it was read.
    /// Returns false when the row changed underneath; caller retries or
    /// buffers.
    pub fn update_if_unleased(
        &self,
        enrollment: &Enrollment,
        read_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let ledger = serde_json::to_string(&enrollment.ledger)?;
        let changes = self
            .lock()
            .execute(
                "UPDATE enrollments SET
                     current_step = ?2, status = ?3, next_send_at = ?4,
                     completed_at = ?5, reply_detected_at = ?6, bounce_detected_at = ?7,
                     failure_count = ?8, ledger = ?9, updated_at = ?10
                 WHERE id = ?1
                   AND (lease_owner IS NULL OR lease_expires_at < ?11)
                   AND updated_at = ?12",
                params![
                    enrollment.id,
                    enrollment.current_step,
                    enrollment.status.as_str(),
                    enrollment.next_send_at.map(|t| t.to_rfc3339()),
                    enrollment.completed_at.map(|t| t.to_rfc3339()),
                    enrollment.reply_detected_at.map(|t| t.to_rfc3339()),
                    enrollment.bounce_detected_at.map(|t| t.to_rfc3339()),
                    enrollment.failure_count,
                    ledger,
                    enrollment.updated_at.to_rfc3339(),
                    now.to_rfc3339(),
                    read_at.to_rfc3339(),
                ],
            )
            .map_err(|e| CadenceError::Store(format!("Update enrollment: {e}")))?;
        Ok(changes == 1)
    }

    /// Load an enrollment by id.
    pub fn enrollment(&self, id: &str) -> Result<Option<Enrollment>> {
        let conn = self.lock();
        conn.query_row(
            &format!("SELECT {ENROLLMENT_COLUMNS} FROM enrollments WHERE id = ?1"),
            [id],
            row_to_enrollment,
        )
        .optional()
        .map_err(|e| CadenceError::Store(format!("Load enrollment: {e}")))?
        .transpose()
    }

    /// Most recent enrollment for a (person, sequence) pair, which is how the event
    /// ingestor resolves person-addressed signals.
    pub fn find_enrollment(&self, person_id: &str, sequence_id: &str) -> Result<Option<Enrollment>> {
        let conn = self.lock();
        conn.query_row(
            &format!(
                "SELECT {ENROLLMENT_COLUMNS} FROM enrollments
                 WHERE person_id = ?1 AND sequence_id = ?2
                 ORDER BY created_at DESC LIMIT 1"
            ),
            [person_id, sequence_id],
            row_to_enrollment,
        )
        .optional()
        .map_err(|e| CadenceError::Store(format!("Find enrollment: {e}")))?
        .transpose()
    }

    // ─── Claim Manager ──────────────────────────────────────

    /// Atomically lease up to `batch_size` due enrollments to `worker_id`.
    ///
    /// Candidates are read first, but ownership is decided solely by the
    /// conditional UPDATE: under racing workers each row is claimed by
    /// exactly one of them per lease cycle.
    pub fn claim_due(
        &self,
        worker_id: &str,
        batch_size: usize,
        lease_duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let now_s = now.to_rfc3339();
        let expires_s = (now + lease_duration).to_rfc3339();

        let candidates: Vec<String> = {
            let conn = self.lock();
            let mut stmt = conn
                .prepare(
                    "SELECT id FROM enrollments
                     WHERE status = 'active'
                       AND next_send_at IS NOT NULL AND next_send_at <= ?1
                       AND (lease_owner IS NULL OR lease_expires_at < ?1)
                     ORDER BY next_send_at ASC
                     LIMIT ?2",
                )
                .map_err(|e| CadenceError::Store(format!("Claim select: {e}")))?;
            let rows = stmt
                .query_map(params![now_s, batch_size as i64], |row| row.get(0))
                .map_err(|e| CadenceError::Store(format!("Claim select: {e}")))?;
            rows.collect::<std::result::Result<_, _>>()
                .map_err(|e| CadenceError::Store(format!("Claim select: {e}")))?
        };

        let mut claimed = Vec::new();
        for id in candidates {
            let changes = self
                .lock()
                .execute(
                    "UPDATE enrollments
                     SET lease_owner = ?2, lease_expires_at = ?3, updated_at = ?4
                     WHERE id = ?1
                       AND status = 'active'
                       AND next_send_at IS NOT NULL AND next_send_at <= ?4
                       AND (lease_owner IS NULL OR lease_expires_at < ?4)",
                    params![id, worker_id, expires_s, now_s],
                )
                .map_err(|e| CadenceError::Store(format!("Claim update: {e}")))?;
            // changes == 0 means another worker won this row, not an error
            if changes == 1 {
                claimed.push(id);
            }
        }
        if !claimed.is_empty() {
            tracing::debug!("🔒 Worker {} claimed {} enrollment(s)", worker_id, claimed.len());
        }
        Ok(claimed)
    }

    /// Release a lease. Called on completion of processing, success or
    /// failure. A mismatched owner is a no-op (the lease expired and was
    /// reclaimed).
    pub fn release(&self, enrollment_id: &str, worker_id: &str) -> Result<()> {
        self.lock()
            .execute(
                "UPDATE enrollments SET lease_owner = NULL, lease_expires_at = NULL
                 WHERE id = ?1 AND lease_owner = ?2",
                params![enrollment_id, worker_id],
            )
            .map_err(|e| CadenceError::Store(format!("Release lease: {e}")))?;
        Ok(())
    }

    // ─── Pending-event buffer ──────────────────────────────

    /// Buffer an external event for an enrollment that is currently leased.
    pub fn buffer_event(&self, enrollment_id: &str, event: &EngagementEvent) -> Result<()> {
        self.lock()
            .execute(
                "INSERT INTO pending_events (enrollment_id, step_number, kind, occurred_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    enrollment_id,
                    event.step_number,
                    event.kind.as_str(),
                    event.occurred_at.to_rfc3339(),
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(|e| CadenceError::Store(format!("Buffer event: {e}")))?;
        Ok(())
    }

    /// Drain buffered events for one enrollment, oldest first. Read and
    /// delete happen in one transaction so a crash cannot drop events.
    pub fn take_pending_events(&self, enrollment_id: &str) -> Result<Vec<EngagementEvent>> {
        let mut conn = self.lock();
        let tx = conn
            .transaction()
            .map_err(|e| CadenceError::Store(format!("Event txn: {e}")))?;

        let events = {
            let mut stmt = tx
                .prepare(
                    "SELECT step_number, kind, occurred_at FROM pending_events
                     WHERE enrollment_id = ?1 ORDER BY id ASC",
                )
                .map_err(|e| CadenceError::Store(format!("Drain events: {e}")))?;
            let rows = stmt
                .query_map([enrollment_id], |row| {
                    Ok((
                        row.get::<_, Option<u32>>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })
                .map_err(|e| CadenceError::Store(format!("Drain events: {e}")))?;

            let mut events = Vec::new();
            for row in rows {
                let (step_number, kind, occurred_at) =
                    row.map_err(|e| CadenceError::Store(format!("Drain events: {e}")))?;
                let kind = parse_event_kind(&kind)?;
                events.push(EngagementEvent {
                    target: EventTarget::Enrollment(enrollment_id.to_string()),
                    step_number,
                    kind,
                    occurred_at: parse_ts(&occurred_at)?,
                });
            }
            events
        };

        tx.execute(
            "DELETE FROM pending_events WHERE enrollment_id = ?1",
            [enrollment_id],
        )
        .map_err(|e| CadenceError::Store(format!("Drain events: {e}")))?;
        tx.commit()
            .map_err(|e| CadenceError::Store(format!("Event txn: {e}")))?;
        Ok(events)
    }

    /// Number of enrollments with due work at `now`. Dispatcher stats.
    pub fn due_count(&self, now: DateTime<Utc>) -> Result<u64> {
        self.lock()
            .query_row(
                "SELECT COUNT(*) FROM enrollments
                 WHERE status = 'active'
                   AND next_send_at IS NOT NULL AND next_send_at <= ?1",
                [now.to_rfc3339()],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as u64)
            .map_err(|e| CadenceError::Store(format!("Due count: {e}")))
    }
}

const ENROLLMENT_COLUMNS: &str = "id, sequence_id, person_id, current_step, status, next_send_at, \
     completed_at, reply_detected_at, bounce_detected_at, failure_count, \
     ledger, lease_owner, lease_expires_at, created_at, updated_at";

/// Map a SELECTed row (ENROLLMENT_COLUMNS order) to an Enrollment. Decoding
/// failures surface as store errors, not silently skipped rows.
fn row_to_enrollment(row: &Row<'_>) -> rusqlite::Result<Result<Enrollment>> {
    let status: String = row.get(4)?;
    let ledger: String = row.get(10)?;
    let next_send_at: Option<String> = row.get(5)?;
    let completed_at: Option<String> = row.get(6)?;
    let reply_detected_at: Option<String> = row.get(7)?;
    let bounce_detected_at: Option<String> = row.get(8)?;
    let lease_expires_at: Option<String> = row.get(12)?;
    let created_at: String = row.get(13)?;
    let updated_at: String = row.get(14)?;

    let id: String = row.get(0)?;
    let sequence_id: String = row.get(1)?;
    let person_id: String = row.get(2)?;
    let current_step: u32 = row.get(3)?;
    let failure_count: u32 = row.get(9)?;
    let lease_owner: Option<String> = row.get(11)?;

    Ok((|| {
        let status = EnrollmentStatus::parse(&status)
            .ok_or_else(|| CadenceError::Store(format!("Unknown enrollment status: {status}")))?;
        let ledger: EngagementLedger = serde_json::from_str(&ledger)?;
        Ok(Enrollment {
            id,
            sequence_id,
            person_id,
            current_step,
            status,
            next_send_at: parse_ts_opt(next_send_at)?,
            completed_at: parse_ts_opt(completed_at)?,
            reply_detected_at: parse_ts_opt(reply_detected_at)?,
            bounce_detected_at: parse_ts_opt(bounce_detected_at)?,
            failure_count,
            ledger,
            lease_owner,
            lease_expires_at: parse_ts_opt(lease_expires_at)?,
            created_at: parse_ts(&created_at)?,
            updated_at: parse_ts(&updated_at)?,
        })
    })())
}

fn parse_event_kind(s: &str) -> Result<EventKind> {
    match s {
        "open" => Ok(EventKind::Open),
        "click" => Ok(EventKind::Click),
        "reply" => Ok(EventKind::Reply),
        "bounce" => Ok(EventKind::Bounce),
        "unsubscribe" => Ok(EventKind::Unsubscribe),
        _ => Err(CadenceError::Store(format!("Unknown event kind: {s}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::{Sequence, SequenceStatus};

    fn db_with_sequence() -> (SequenceDb, String) {
        let db = SequenceDb::open_in_memory().unwrap();
        let mut seq = Sequence::new("tenant-1", "Outreach");
        seq.status = SequenceStatus::Active;
        db.save_sequence(&seq).unwrap();
        (db, seq.id)
    }

    #[test]
    fn test_insert_and_load_round_trip() {
        let (db, seq_id) = db_with_sequence();
        let mut e = Enrollment::new(&seq_id, "person-1", Utc::now());
        e.ledger.record_send(1, "msg-1");
        db.insert_enrollment(&e).unwrap();

        let loaded = db.enrollment(&e.id).unwrap().unwrap();
        assert_eq!(loaded.person_id, "person-1");
        assert_eq!(loaded.current_step, 1);
        assert_eq!(loaded.status, EnrollmentStatus::Active);
        assert_eq!(loaded.ledger.last_message_id(), Some("msg-1"));
    }

    #[test]
    fn test_duplicate_live_enrollment_rejected() {
        let (db, seq_id) = db_with_sequence();
        let e1 = Enrollment::new(&seq_id, "person-1", Utc::now());
        db.insert_enrollment(&e1).unwrap();

        let e2 = Enrollment::new(&seq_id, "person-1", Utc::now());
        assert!(matches!(
            db.insert_enrollment(&e2).unwrap_err(),
            CadenceError::Conflict(_)
        ));

        // After the first terminates, re-enrollment creates a fresh row
        let mut done = db.enrollment(&e1.id).unwrap().unwrap();
        done.status = EnrollmentStatus::Replied;
        done.next_send_at = None;
        db.save_enrollment(&done).unwrap();
        db.insert_enrollment(&e2).unwrap();
    }

    #[test]
    fn test_claim_due_excludes_undue_and_terminal() {
        let (db, seq_id) = db_with_sequence();
        let now = Utc::now();

        let due = Enrollment::new(&seq_id, "p-due", now - Duration::minutes(1));
        let future = Enrollment::new(&seq_id, "p-future", now + Duration::hours(1));
        let mut replied = Enrollment::new(&seq_id, "p-replied", now - Duration::minutes(1));
        replied.status = EnrollmentStatus::Replied;
        replied.next_send_at = None;
        db.insert_enrollment(&due).unwrap();
        db.insert_enrollment(&future).unwrap();
        db.save_enrollment(&replied).unwrap();

        let claimed = db.claim_due("w1", 10, Duration::seconds(120), now).unwrap();
        assert_eq!(claimed, vec![due.id.clone()]);

        // Already-leased rows are not claimable again
        let again = db.claim_due("w2", 10, Duration::seconds(120), now).unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn test_expired_lease_is_reclaimable() {
        let (db, seq_id) = db_with_sequence();
        let now = Utc::now();
        let e = Enrollment::new(&seq_id, "p-1", now - Duration::minutes(5));
        db.insert_enrollment(&e).unwrap();

        let claimed = db.claim_due("w1", 10, Duration::seconds(60), now).unwrap();
        assert_eq!(claimed.len(), 1);

        // Within the lease: locked out
        assert!(db
            .claim_due("w2", 10, Duration::seconds(60), now)
            .unwrap()
            .is_empty());

        // After expiry any worker may reclaim (crash recovery)
        let later = now + Duration::seconds(61);
        let reclaimed = db.claim_due("w2", 10, Duration::seconds(60), later).unwrap();
        assert_eq!(reclaimed, vec![e.id]);
    }

    #[test]
    fn test_release_requires_owner() {
        let (db, seq_id) = db_with_sequence();
        let now = Utc::now();
        let e = Enrollment::new(&seq_id, "p-1", now);
        db.insert_enrollment(&e).unwrap();
        db.claim_due("w1", 10, Duration::seconds(60), now).unwrap();

        db.release(&e.id, "w2").unwrap(); // wrong owner: no-op
        assert!(db.enrollment(&e.id).unwrap().unwrap().lease_owner.is_some());

        db.release(&e.id, "w1").unwrap();
        assert!(db.enrollment(&e.id).unwrap().unwrap().lease_owner.is_none());
    }

    #[test]
    fn test_update_if_unleased_cas() {
        let (db, seq_id) = db_with_sequence();
        let now = Utc::now();
        let e = Enrollment::new(&seq_id, "p-1", now);
        db.insert_enrollment(&e).unwrap();

        let mut read = db.enrollment(&e.id).unwrap().unwrap();
        let read_at = read.updated_at;
        read.ledger.record_open(1);
        read.updated_at = now + Duration::seconds(1);
        assert!(db.update_if_unleased(&read, read_at, now).unwrap());

        // Stale read_at: rejected
        let mut stale = db.enrollment(&e.id).unwrap().unwrap();
        stale.ledger.record_click(1);
        assert!(!db.update_if_unleased(&stale, read_at, now).unwrap());

        // Leased row: rejected
        db.claim_due("w1", 10, Duration::seconds(60), now).unwrap();
        let fresh = db.enrollment(&e.id).unwrap().unwrap();
        let fresh_read_at = fresh.updated_at;
        assert!(!db.update_if_unleased(&fresh, fresh_read_at, now).unwrap());
    }

    #[test]
    fn test_event_buffer_drains_in_order() {
        let (db, seq_id) = db_with_sequence();
        let e = Enrollment::new(&seq_id, "p-1", Utc::now());
        db.insert_enrollment(&e).unwrap();

        for kind in [EventKind::Open, EventKind::Click, EventKind::Reply] {
            db.buffer_event(
                &e.id,
                &EngagementEvent {
                    target: EventTarget::Enrollment(e.id.clone()),
                    step_number: Some(1),
                    kind,
                    occurred_at: Utc::now(),
                },
            )
            .unwrap();
        }

        let drained = db.take_pending_events(&e.id).unwrap();
        assert_eq!(drained.len(), 3);
        assert_eq!(drained[0].kind, EventKind::Open);
        assert_eq!(drained[2].kind, EventKind::Reply);

        // Drained means gone
        assert!(db.take_pending_events(&e.id).unwrap().is_empty());
    }
}
