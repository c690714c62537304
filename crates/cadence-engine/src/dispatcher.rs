//! Dispatcher: the worker loop that finds due enrollments, leases them, and
//! runs them through the step processor.
//!
//! Each worker is an independent tokio task on a fixed poll interval. All
//! coordination happens through the claim manager in the store: workers never
//! talk to each other, and a worker that dies mid-batch loses nothing; its
//! leases expire and the rows become claimable again.

use std::sync::Arc;

use cadence_core::{CadenceConfig, CadenceError, Enrollment, Result, SequenceDefinition};
use cadence_store::SequenceDb;
use chrono::{DateTime, Duration, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::machine::{self, ProcessOutcome, StepProcessor};

/// Immediately-consecutive steps processed per claim before yielding the
/// enrollment back to the queue. Bounds condition chains and zero-delay runs.
const STEP_BUDGET: u32 = 25;

/// Counters from one poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub claimed: usize,
    pub sent: usize,
    pub completed: usize,
    pub retried: usize,
    pub failed: usize,
    pub events_applied: usize,
}

impl WorkerStats {
    fn absorb(&mut self, outcome: &ProcessOutcome) {
        match outcome {
            ProcessOutcome::Sent { .. } => self.sent += 1,
            ProcessOutcome::Completed => self.completed += 1,
            ProcessOutcome::Retrying { .. } => self.retried += 1,
            ProcessOutcome::FailedPermanently { .. } => self.failed += 1,
            ProcessOutcome::Waiting { .. }
            | ProcessOutcome::Branched { .. }
            | ProcessOutcome::Skipped => {}
        }
    }
}

/// One worker's view of the engine.
pub struct Dispatcher {
    db: Arc<SequenceDb>,
    processor: StepProcessor,
    worker_id: String,
    batch_size: usize,
    lease_duration: Duration,
}

impl Dispatcher {
    pub fn new(
        db: Arc<SequenceDb>,
        processor: StepProcessor,
        worker_id: String,
        config: &CadenceConfig,
    ) -> Self {
        Self {
            db,
            processor,
            worker_id,
            batch_size: config.batch_size,
            lease_duration: Duration::seconds(config.lease_duration_secs as i64),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// One poll cycle: claim a batch of due enrollments and process each.
    /// Per-enrollment failures are logged and counted, never fatal to the
    /// cycle.
    pub async fn poll_once(&self, now: DateTime<Utc>) -> Result<WorkerStats> {
        let mut stats = WorkerStats::default();
        let claimed = self
            .db
            .claim_due(&self.worker_id, self.batch_size, self.lease_duration, now)?;
        stats.claimed = claimed.len();

        for id in claimed {
            let terminal = match self.process_claimed(&id, now, &mut stats).await {
                Ok(terminal) => terminal,
                Err(e) => {
                    warn!(
                        "⚠️ Worker {} failed on enrollment {}: {}",
                        self.worker_id, id, e
                    );
                    false
                }
            };
            // Lease comes off whatever happened; owner-guarded, so a lease
            // lost to expiry is left alone
            if let Err(e) = self.db.release(&id, &self.worker_id) {
                warn!("⚠️ Worker {} release of {} failed: {}", self.worker_id, id, e);
            }
            // A terminal enrollment is never claimed again, so anything that
            // slipped into its buffer after the last drain would sit there
            // forever. Sweep once after the lease is off; from here on the
            // ingestor writes the unleased row directly.
            if terminal {
                if let Err(e) = self.sweep_terminal(&id, &mut stats) {
                    warn!(
                        "⚠️ Worker {} event sweep of {} failed: {}",
                        self.worker_id, id, e
                    );
                }
            }
        }
        Ok(stats)
    }

    /// Run one claimed enrollment for up to `STEP_BUDGET` steps, persisting
    /// after every step and draining buffered events between steps. Returns
    /// whether the enrollment ended in a terminal state.
    async fn process_claimed(
        &self,
        enrollment_id: &str,
        now: DateTime<Utc>,
        stats: &mut WorkerStats,
    ) -> Result<bool> {
        let mut enrollment = self
            .db
            .enrollment(enrollment_id)?
            .ok_or_else(|| CadenceError::EnrollmentNotFound(enrollment_id.to_string()))?;
        let definition = self.db.definition(&enrollment.sequence_id)?;

        if !self.db.is_sequence_active(&enrollment.sequence_id)? {
            // Paused/archived sequence: leave the enrollment untouched; it
            // becomes claimable again once the sequence reactivates
            debug!(
                "⏸️ Sequence {} inactive, skipping enrollment {}",
                enrollment.sequence_id, enrollment.id
            );
            return Ok(false);
        }

        // Events buffered while the row sat due (reply/bounce may terminate
        // before anything is sent)
        stats.events_applied += self.drain_events(&mut enrollment, &definition)?;

        let mut budget = STEP_BUDGET;
        while enrollment.is_due(now) && budget > 0 {
            budget -= 1;
            let outcome = self
                .processor
                .process_step(&mut enrollment, &definition, now)
                .await?;
            self.db.save_enrollment(&enrollment)?;
            stats.absorb(&outcome);

            stats.events_applied += self.drain_events(&mut enrollment, &definition)?;
            if enrollment.status.is_terminal() {
                break;
            }
        }
        if budget == 0 && enrollment.is_due(now) {
            debug!(
                "⏳ Enrollment {} hit the step budget, requeueing",
                enrollment.id
            );
        }
        Ok(enrollment.status.is_terminal())
    }

    /// Final drain for an enrollment that just went terminal. Runs after the
    /// lease release so an event buffered in the gap between the in-claim
    /// drain and the release is still picked up.
    fn sweep_terminal(&self, enrollment_id: &str, stats: &mut WorkerStats) -> Result<()> {
        let Some(mut enrollment) = self.db.enrollment(enrollment_id)? else {
            return Ok(());
        };
        let definition = self.db.definition(&enrollment.sequence_id)?;
        stats.events_applied += self.drain_events(&mut enrollment, &definition)?;
        Ok(())
    }

    /// Apply and persist any events buffered for this enrollment. The worker
    /// holds the lease, so plain saves are safe here.
    fn drain_events(
        &self,
        enrollment: &mut Enrollment,
        definition: &SequenceDefinition,
    ) -> Result<usize> {
        let events = self.db.take_pending_events(&enrollment.id)?;
        if events.is_empty() {
            return Ok(0);
        }
        let mut applied = 0;
        for event in &events {
            if machine::apply_engagement(enrollment, event, definition.settings()) {
                applied += 1;
            }
        }
        if applied > 0 {
            self.db.save_enrollment(enrollment)?;
            debug!(
                "📥 Applied {} buffered event(s) to enrollment {}",
                applied, enrollment.id
            );
        }
        Ok(applied)
    }
}

/// Spawn `config.workers` polling workers. Each gets its own dispatcher and
/// runs until the task is aborted.
pub fn spawn_workers(
    db: Arc<SequenceDb>,
    processor: StepProcessor,
    config: &CadenceConfig,
) -> Vec<JoinHandle<()>> {
    let poll_interval = std::time::Duration::from_secs(config.poll_interval_secs);
    (0..config.workers)
        .map(|i| {
            let worker_id = format!("worker-{}-{}", std::process::id(), i);
            let dispatcher = Dispatcher::new(db.clone(), processor.clone(), worker_id, config);
            tokio::spawn(async move {
                info!(
                    "🚀 Worker {} polling every {:?}",
                    dispatcher.worker_id(),
                    poll_interval
                );
                let mut ticker = tokio::time::interval(poll_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    match dispatcher.poll_once(Utc::now()).await {
                        Ok(stats) if stats.claimed > 0 => {
                            info!(
                                "📊 Worker {}: claimed {} sent {} completed {} retried {} failed {} events {}",
                                dispatcher.worker_id(),
                                stats.claimed,
                                stats.sent,
                                stats.completed,
                                stats.retried,
                                stats.failed,
                                stats.events_applied
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!("❌ Worker {} poll failed: {}", dispatcher.worker_id(), e),
                    }
                }
            })
        })
        .collect()
}
