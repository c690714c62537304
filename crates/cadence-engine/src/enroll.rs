//! Enrollment entry points: enroll a person into a sequence, and the
//! user-facing pause/resume controls.

use cadence_core::{CadenceError, Enrollment, Result};
use cadence_store::SequenceDb;
use chrono::{DateTime, Utc};
use tracing::info;

use crate::{machine, window};

/// Enroll a person into a sequence. The first step comes due at the next
/// permitted send instant from `now`. Rejected when the sequence is not
/// active, and when the person already has a live (active or paused)
/// enrollment in it.
pub fn enroll(
    db: &SequenceDb,
    sequence_id: &str,
    person_id: &str,
    now: DateTime<Utc>,
) -> Result<Enrollment> {
    let definition = db.definition(sequence_id)?;
    if !db.is_sequence_active(sequence_id)? {
        return Err(CadenceError::Conflict(format!(
            "sequence {} is {}, not active",
            sequence_id,
            definition.sequence.status.as_str()
        )));
    }

    let next_send_at = window::next_permitted(now, definition.settings());
    let enrollment = Enrollment::new(sequence_id, person_id, next_send_at);
    db.insert_enrollment(&enrollment)?;
    info!(
        "➕ Enrolled person {} in sequence {} (first step due {})",
        person_id, sequence_id, next_send_at
    );
    Ok(enrollment)
}

/// Pause an active enrollment. While a worker holds the lease the call fails
/// with `Conflict`; the worker finishes at most the step it is on, and the
/// caller retries after the claim releases. Returns false when the enrollment
/// was not active.
pub fn pause_enrollment(db: &SequenceDb, enrollment_id: &str, now: DateTime<Utc>) -> Result<bool> {
    transition(db, enrollment_id, now, |e, _, now| machine::pause(e, now))
}

/// Resume a paused enrollment, re-clamping its due time into the send window.
pub fn resume_enrollment(db: &SequenceDb, enrollment_id: &str, now: DateTime<Utc>) -> Result<bool> {
    transition(db, enrollment_id, now, machine::resume)
}

/// Version-race retries before giving up.
const MAX_TRANSITION_ATTEMPTS: u32 = 4;

fn transition(
    db: &SequenceDb,
    enrollment_id: &str,
    now: DateTime<Utc>,
    apply: impl Fn(&mut Enrollment, &cadence_core::SequenceSettings, DateTime<Utc>) -> bool,
) -> Result<bool> {
    let mut enrollment = db
        .enrollment(enrollment_id)?
        .ok_or_else(|| CadenceError::EnrollmentNotFound(enrollment_id.to_string()))?;
    let definition = db.definition(&enrollment.sequence_id)?;

    for _ in 0..MAX_TRANSITION_ATTEMPTS {
        let read_at = enrollment.updated_at;
        let mut updated = enrollment.clone();
        if !apply(&mut updated, definition.settings(), now) {
            return Ok(false);
        }
        updated.updated_at = Utc::now();
        if db.update_if_unleased(&updated, read_at, Utc::now())? {
            info!(
                "⏯️ Enrollment {} is now {}",
                updated.id,
                updated.status.as_str()
            );
            return Ok(true);
        }

        let fresh = db
            .enrollment(enrollment_id)?
            .ok_or_else(|| CadenceError::EnrollmentNotFound(enrollment_id.to_string()))?;
        let leased = fresh.lease_owner.is_some()
            && fresh.lease_expires_at.is_some_and(|at| at >= Utc::now());
        if leased {
            return Err(CadenceError::Conflict(format!(
                "enrollment {} is being processed by {}; retry after the claim releases",
                enrollment_id,
                fresh.lease_owner.as_deref().unwrap_or("?")
            )));
        }
        enrollment = fresh;
    }
    Err(CadenceError::Conflict(format!(
        "enrollment {enrollment_id} kept changing underneath the transition"
    )))
}
