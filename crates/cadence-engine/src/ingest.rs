//! Event ingestor: applies external engagement signals (open, click, reply,
//! bounce, unsubscribe) to enrollments.
//!
//! Events race with the dispatcher. The write path is a compare-and-set
//! guarded on the lease and the row version: while a worker holds the lease
//! the event goes into the pending buffer instead, and the worker drains the
//! buffer around its own writes. Either way the signal lands exactly once.

use std::sync::Arc;

use cadence_core::{CadenceError, EngagementEvent, Enrollment, EventTarget, Result};
use cadence_store::SequenceDb;
use chrono::Utc;
use tracing::{debug, info};

use crate::machine;

/// What happened to an ingested event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Applied directly to the enrollment row.
    Applied,
    /// The enrollment is leased; buffered for the holding worker.
    Buffered,
    /// The event changed nothing (duplicate signal, tracking disabled).
    NoOp,
}

/// CAS attempts before giving up and buffering.
const MAX_APPLY_ATTEMPTS: u32 = 4;

pub struct EventIngestor {
    db: Arc<SequenceDb>,
}

impl EventIngestor {
    pub fn new(db: Arc<SequenceDb>) -> Self {
        Self { db }
    }

    /// Ingest one engagement event.
    pub fn ingest(&self, event: &EngagementEvent) -> Result<IngestOutcome> {
        let enrollment = self.resolve(event)?;
        let definition = self.db.definition(&enrollment.sequence_id)?;
        let settings = definition.settings();

        let mut enrollment = enrollment;
        for attempt in 0..MAX_APPLY_ATTEMPTS {
            let read_at = enrollment.updated_at;
            let now = Utc::now();

            let mut updated = enrollment.clone();
            if !machine::apply_engagement(&mut updated, event, settings) {
                debug!(
                    "💤 Event {} for enrollment {} is a no-op",
                    event.kind.as_str(),
                    updated.id
                );
                return Ok(IngestOutcome::NoOp);
            }
            updated.updated_at = now;

            if self.db.update_if_unleased(&updated, read_at, now)? {
                info!(
                    "📥 Applied {} event to enrollment {} (status {})",
                    event.kind.as_str(),
                    updated.id,
                    updated.status.as_str()
                );
                return Ok(IngestOutcome::Applied);
            }

            // Lost the race. Leased row → hand the event to the worker;
            // otherwise re-read and retry against the fresh version.
            let fresh = self
                .db
                .enrollment(&enrollment.id)?
                .ok_or_else(|| CadenceError::EnrollmentNotFound(enrollment.id.clone()))?;
            let leased = fresh.lease_owner.is_some()
                && fresh.lease_expires_at.is_some_and(|at| at >= now);
            if leased {
                self.db.buffer_event(&fresh.id, event)?;
                info!(
                    "📮 Buffered {} event for leased enrollment {} (held by {})",
                    event.kind.as_str(),
                    fresh.id,
                    fresh.lease_owner.as_deref().unwrap_or("?")
                );
                return Ok(IngestOutcome::Buffered);
            }
            debug!(
                "🔄 Event apply retry {} for enrollment {}",
                attempt + 1,
                fresh.id
            );
            enrollment = fresh;
        }

        // Contended past the attempt budget; the buffer always works
        self.db.buffer_event(&enrollment.id, event)?;
        Ok(IngestOutcome::Buffered)
    }

    fn resolve(&self, event: &EngagementEvent) -> Result<Enrollment> {
        match &event.target {
            EventTarget::Enrollment(id) => self
                .db
                .enrollment(id)?
                .ok_or_else(|| CadenceError::EnrollmentNotFound(id.clone())),
            EventTarget::PersonSequence {
                person_id,
                sequence_id,
            } => self
                .db
                .find_enrollment(person_id, sequence_id)?
                .ok_or_else(|| {
                    CadenceError::EnrollmentNotFound(format!(
                        "person {person_id} in sequence {sequence_id}"
                    ))
                }),
        }
    }
}
