//! Enrollment state machine: processes one due step and mutates the
//! enrollment in memory. Persistence and leasing stay in the dispatcher; this
//! module only decides what the next state is.

use std::sync::Arc;

use cadence_core::{
    CadenceError, Channel, DeliveryTransport, EngagementEvent, Enrollment, EnrollmentStatus,
    EventKind, OutboundMessage, Result, RetryConfig, SequenceDefinition, SequenceSettings, Step,
    StepKind, TaskSink, VariableSource,
};
use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::{backoff, condition, render, window};

/// What processing one step did to the enrollment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// A message went out; the next step is due immediately.
    Sent { step_number: u32, channel: Channel },
    /// A delay step scheduled the next step.
    Waiting { until: DateTime<Utc> },
    /// A condition step moved execution to another step.
    Branched { to: u32 },
    /// Execution ran past the last step.
    Completed,
    /// Transient delivery failure; the step retries later.
    Retrying { attempt: u32, until: DateTime<Utc> },
    /// Permanent delivery failure recorded. `advanced` tells whether the
    /// enrollment moved past the step or was parked for operator attention.
    FailedPermanently { step_number: u32, advanced: bool },
    /// The enrollment was no longer active (an event pre-empted it).
    Skipped,
}

/// Processes due steps against the collaborator traits. Cheap to clone across
/// workers.
#[derive(Clone)]
pub struct StepProcessor {
    transport: Arc<dyn DeliveryTransport>,
    variables: Arc<dyn VariableSource>,
    tasks: Arc<dyn TaskSink>,
    retry: RetryConfig,
    /// When false, a permanent failure parks the enrollment instead of
    /// advancing past the failed step.
    advance_on_permanent_failure: bool,
}

impl StepProcessor {
    pub fn new(
        transport: Arc<dyn DeliveryTransport>,
        variables: Arc<dyn VariableSource>,
        tasks: Arc<dyn TaskSink>,
        retry: RetryConfig,
        advance_on_permanent_failure: bool,
    ) -> Self {
        Self {
            transport,
            variables,
            tasks,
            retry,
            advance_on_permanent_failure,
        }
    }

    /// Process the enrollment's current step at `now`. Mutates `enrollment`
    /// to its post-step state; the caller persists it.
    pub async fn process_step(
        &self,
        enrollment: &mut Enrollment,
        definition: &SequenceDefinition,
        now: DateTime<Utc>,
    ) -> Result<ProcessOutcome> {
        if enrollment.status != EnrollmentStatus::Active {
            // A reply/bounce/unsubscribe landed between claim and processing
            enrollment.next_send_at = None;
            return Ok(ProcessOutcome::Skipped);
        }

        if enrollment.current_step > definition.last_step_number() {
            self.complete(enrollment, definition, now).await;
            return Ok(ProcessOutcome::Completed);
        }

        let Some(step) = definition.step(enrollment.current_step) else {
            // Steps renumbered under a live enrollment; finish rather than
            // spin on a hole forever
            warn!(
                "⚠️ Enrollment {} points at missing step {} of sequence {}, completing",
                enrollment.id, enrollment.current_step, enrollment.sequence_id
            );
            self.complete(enrollment, definition, now).await;
            return Ok(ProcessOutcome::Completed);
        };

        let settings = definition.settings();
        match &step.kind {
            StepKind::Email { subject, body } => {
                self.send_message(
                    enrollment,
                    definition,
                    step,
                    Channel::Email,
                    Some(subject),
                    body,
                    now,
                )
                .await
            }
            StepKind::Sms { body } => {
                self.send_message(enrollment, definition, step, Channel::Sms, None, body, now)
                    .await
            }
            StepKind::Delay { amount, unit } => {
                let until = if unit.is_day_granular() && settings.send_days.is_some() {
                    window::add_send_days(now, unit.days(*amount), settings)
                } else {
                    window::next_permitted(now + unit.duration(*amount), settings)
                };
                self.advance(enrollment, definition, Some(until), now).await;
                if enrollment.status == EnrollmentStatus::Completed {
                    Ok(ProcessOutcome::Completed)
                } else {
                    Ok(ProcessOutcome::Waiting { until })
                }
            }
            StepKind::Condition(cond) => {
                let to = condition::evaluate(cond, &enrollment.ledger, settings, step.step_number);
                info!(
                    "🔀 Enrollment {} condition at step {} → step {}",
                    enrollment.id, step.step_number, to
                );
                enrollment.current_step = to;
                enrollment.failure_count = 0;
                enrollment.updated_at = now;
                if to > definition.last_step_number() {
                    self.complete(enrollment, definition, now).await;
                    Ok(ProcessOutcome::Completed)
                } else {
                    enrollment.next_send_at = Some(now);
                    Ok(ProcessOutcome::Branched { to })
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn send_message(
        &self,
        enrollment: &mut Enrollment,
        definition: &SequenceDefinition,
        step: &Step,
        channel: Channel,
        subject: Option<&str>,
        body: &str,
        now: DateTime<Utc>,
    ) -> Result<ProcessOutcome> {
        let settings = definition.settings();
        let vars = self.variables.variables_for(&enrollment.person_id).await?;

        let address_key = match channel {
            Channel::Email => "email",
            Channel::Sms => "phone",
        };
        let Some(to) = vars.get(address_key).filter(|a| !a.is_empty()).cloned() else {
            return self
                .record_failure(
                    enrollment,
                    definition,
                    step.step_number,
                    CadenceError::permanent(format!(
                        "person {} has no {} address",
                        enrollment.person_id, address_key
                    )),
                    now,
                )
                .await;
        };

        let thread_hint = if settings.send_as_reply && channel == Channel::Email {
            enrollment.ledger.last_message_id().map(str::to_string)
        } else {
            None
        };

        let message = OutboundMessage {
            channel,
            to,
            subject: subject.map(|s| render::render(s, &vars)),
            body: render::render(body, &vars),
            thread_hint,
        };

        match self.transport.send(&message).await {
            Ok(receipt) => {
                info!(
                    "📤 Enrollment {} sent {} step {} (message {})",
                    enrollment.id, channel, step.step_number, receipt.message_id
                );
                enrollment
                    .ledger
                    .record_send(step.step_number, &receipt.message_id);
                enrollment.failure_count = 0;
                self.advance(enrollment, definition, Some(now), now).await;
                if enrollment.status == EnrollmentStatus::Completed {
                    Ok(ProcessOutcome::Completed)
                } else {
                    Ok(ProcessOutcome::Sent {
                        step_number: step.step_number,
                        channel,
                    })
                }
            }
            Err(err) => {
                self.record_failure(enrollment, definition, step.step_number, err, now)
                    .await
            }
        }
    }

    /// Apply a delivery failure to the enrollment. Transient failures back
    /// off until the attempt budget runs out, then degrade to permanent.
    async fn record_failure(
        &self,
        enrollment: &mut Enrollment,
        definition: &SequenceDefinition,
        step_number: u32,
        err: CadenceError,
        now: DateTime<Utc>,
    ) -> Result<ProcessOutcome> {
        if err.is_transient_delivery() {
            enrollment.failure_count += 1;
            if enrollment.failure_count < self.retry.max_attempts {
                let until = window::next_permitted(
                    now + backoff::delay(enrollment.failure_count, &self.retry),
                    definition.settings(),
                );
                warn!(
                    "🔁 Enrollment {} step {} transient failure #{}: {} (retry at {})",
                    enrollment.id, step_number, enrollment.failure_count, err, until
                );
                enrollment.next_send_at = Some(until);
                enrollment.updated_at = now;
                return Ok(ProcessOutcome::Retrying {
                    attempt: enrollment.failure_count,
                    until,
                });
            }
            warn!(
                "🛑 Enrollment {} step {} exhausted {} attempts, treating as permanent",
                enrollment.id, step_number, self.retry.max_attempts
            );
        } else {
            warn!(
                "🛑 Enrollment {} step {} permanent failure: {}",
                enrollment.id, step_number, err
            );
        }

        enrollment.ledger.record_failure(step_number);
        enrollment.failure_count = 0;
        if self.advance_on_permanent_failure {
            self.advance(enrollment, definition, Some(now), now).await;
            Ok(ProcessOutcome::FailedPermanently {
                step_number,
                advanced: true,
            })
        } else {
            // Parked: active but never due until an operator intervenes
            enrollment.next_send_at = None;
            enrollment.updated_at = now;
            Ok(ProcessOutcome::FailedPermanently {
                step_number,
                advanced: false,
            })
        }
    }

    /// Move to the next step, or complete if there is none.
    async fn advance(
        &self,
        enrollment: &mut Enrollment,
        definition: &SequenceDefinition,
        next_send_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) {
        enrollment.current_step += 1;
        enrollment.updated_at = now;
        if enrollment.current_step > definition.last_step_number() {
            self.complete(enrollment, definition, now).await;
        } else {
            enrollment.next_send_at = next_send_at;
        }
    }

    async fn complete(
        &self,
        enrollment: &mut Enrollment,
        definition: &SequenceDefinition,
        now: DateTime<Utc>,
    ) {
        enrollment.status = EnrollmentStatus::Completed;
        enrollment.completed_at = Some(now);
        enrollment.next_send_at = None;
        enrollment.updated_at = now;
        info!("🏁 Enrollment {} completed", enrollment.id);

        if let Some(days) = definition.settings().follow_up_delay_days {
            let due_at = now + Duration::days(i64::from(days));
            if let Err(e) = self.tasks.create_follow_up(enrollment, due_at).await {
                // Task creation is best-effort; completion stands
                warn!(
                    "⚠️ Follow-up task for enrollment {} failed: {}",
                    enrollment.id, e
                );
            }
        }
    }
}

/// Apply an external engagement event to an enrollment in memory. Pure state
/// transition; returns whether anything changed. Signals for disabled
/// tracking switches are dropped.
pub fn apply_event(
    enrollment: &mut Enrollment,
    kind: EventKind,
    step_number: Option<u32>,
    occurred_at: DateTime<Utc>,
    settings: &SequenceSettings,
) -> bool {
    let step = step_number.unwrap_or(enrollment.current_step.saturating_sub(1).max(1));
    let changed = match kind {
        EventKind::Open => {
            if !settings.track_opens || enrollment.ledger.opened(step) {
                false
            } else {
                enrollment.ledger.record_open(step);
                true
            }
        }
        EventKind::Click => {
            if !settings.track_clicks || enrollment.ledger.clicked(step) {
                false
            } else {
                enrollment.ledger.record_click(step);
                true
            }
        }
        EventKind::Reply => {
            let mut changed = false;
            if enrollment.reply_detected_at.is_none() {
                enrollment.reply_detected_at = Some(occurred_at);
                changed = true;
            }
            if settings.stop_on_reply && !enrollment.status.is_terminal() {
                enrollment.status = EnrollmentStatus::Replied;
                enrollment.next_send_at = None;
                changed = true;
            }
            changed
        }
        EventKind::Bounce => {
            let mut changed = false;
            if enrollment.bounce_detected_at.is_none() {
                enrollment.bounce_detected_at = Some(occurred_at);
                changed = true;
            }
            if settings.stop_on_bounce && !enrollment.status.is_terminal() {
                enrollment.status = EnrollmentStatus::Bounced;
                enrollment.next_send_at = None;
                changed = true;
            }
            changed
        }
        EventKind::Unsubscribe => {
            if enrollment.status.is_terminal() {
                false
            } else {
                enrollment.status = EnrollmentStatus::Unsubscribed;
                enrollment.next_send_at = None;
                true
            }
        }
    };
    if changed {
        enrollment.updated_at = occurred_at.max(enrollment.updated_at);
    }
    changed
}

/// Convenience for `apply_event` from a full event struct.
pub fn apply_engagement(
    enrollment: &mut Enrollment,
    event: &EngagementEvent,
    settings: &SequenceSettings,
) -> bool {
    apply_event(
        enrollment,
        event.kind,
        event.step_number,
        event.occurred_at,
        settings,
    )
}

/// Pause an active enrollment. Status-only change; the stored due time stays
/// put but `is_due` goes false.
pub fn pause(enrollment: &mut Enrollment, now: DateTime<Utc>) -> bool {
    if enrollment.status != EnrollmentStatus::Active {
        return false;
    }
    enrollment.status = EnrollmentStatus::Paused;
    enrollment.updated_at = now;
    true
}

/// Resume a paused enrollment, re-clamping the due time to the send window
/// so work missed while paused does not fire outside it.
pub fn resume(enrollment: &mut Enrollment, settings: &SequenceSettings, now: DateTime<Utc>) -> bool {
    if enrollment.status != EnrollmentStatus::Paused {
        return false;
    }
    enrollment.status = EnrollmentStatus::Active;
    let base = enrollment.next_send_at.map_or(now, |at| at.max(now));
    enrollment.next_send_at = Some(window::next_permitted(base, settings));
    enrollment.updated_at = now;
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{DryRunTransport, NoopTaskSink, StaticVariables};
    use async_trait::async_trait;
    use cadence_core::{
        ConditionKind, DelayUnit, DeliveryReceipt, Sequence, SequenceStatus, StepCondition,
    };
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn retry_config() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            base_backoff_secs: 60,
            max_backoff_secs: 3600,
            jitter: false,
        }
    }

    fn vars() -> StaticVariables {
        StaticVariables(
            [
                ("email", "ada@example.com"),
                ("phone", "+15550100"),
                ("first_name", "Ada"),
            ]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        )
    }

    fn definition(steps: Vec<StepKind>) -> SequenceDefinition {
        let mut sequence = Sequence::new("tenant-1", "Onboarding");
        sequence.status = SequenceStatus::Active;
        let steps = steps
            .into_iter()
            .enumerate()
            .map(|(i, kind)| Step::new(&sequence.id, (i + 1) as u32, kind))
            .collect();
        SequenceDefinition { sequence, steps }
    }

    fn processor(transport: Arc<dyn DeliveryTransport>) -> StepProcessor {
        StepProcessor::new(
            transport,
            Arc::new(vars()),
            Arc::new(NoopTaskSink),
            retry_config(),
            true,
        )
    }

    fn now() -> DateTime<Utc> {
        // Wednesday
        Utc.with_ymd_and_hms(2026, 3, 4, 12, 0, 0).unwrap()
    }

    struct FailingTransport {
        failures_left: AtomicU32,
        error: fn() -> CadenceError,
    }

    #[async_trait]
    impl DeliveryTransport for FailingTransport {
        async fn send(&self, _message: &OutboundMessage) -> Result<DeliveryReceipt> {
            if self.failures_left.fetch_sub(1, Ordering::SeqCst) > 0 {
                Err((self.error)())
            } else {
                Ok(DeliveryReceipt {
                    message_id: "msg-ok".into(),
                })
            }
        }
    }

    #[tokio::test]
    async fn test_email_step_sends_and_advances() {
        let transport = Arc::new(DryRunTransport::new());
        let proc = processor(transport.clone());
        let def = definition(vec![
            StepKind::Email {
                subject: "Hi {{first_name}}".into(),
                body: "Welcome, {{first_name}}!".into(),
            },
            StepKind::Delay {
                amount: 1,
                unit: DelayUnit::Days,
            },
        ]);
        let mut e = Enrollment::new(&def.sequence.id, "person-1", now());

        let outcome = proc.process_step(&mut e, &def, now()).await.unwrap();
        assert_eq!(
            outcome,
            ProcessOutcome::Sent {
                step_number: 1,
                channel: Channel::Email
            }
        );
        assert_eq!(e.current_step, 2);
        assert_eq!(e.next_send_at, Some(now()));
        assert!(e.ledger.0.get(&1).unwrap().sent);

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "ada@example.com");
        assert_eq!(sent[0].subject.as_deref(), Some("Hi Ada"));
        assert_eq!(sent[0].body, "Welcome, Ada!");
    }

    #[tokio::test]
    async fn test_last_send_completes_enrollment() {
        let proc = processor(Arc::new(DryRunTransport::new()));
        let def = definition(vec![StepKind::Email {
            subject: "One".into(),
            body: "Only".into(),
        }]);
        let mut e = Enrollment::new(&def.sequence.id, "person-1", now());

        let outcome = proc.process_step(&mut e, &def, now()).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Completed);
        assert_eq!(e.status, EnrollmentStatus::Completed);
        assert_eq!(e.completed_at, Some(now()));
        assert!(e.next_send_at.is_none());
    }

    #[tokio::test]
    async fn test_delay_step_schedules_next() {
        let proc = processor(Arc::new(DryRunTransport::new()));
        let def = definition(vec![
            StepKind::Delay {
                amount: 2,
                unit: DelayUnit::Hours,
            },
            StepKind::Sms {
                body: "ping".into(),
            },
        ]);
        let mut e = Enrollment::new(&def.sequence.id, "person-1", now());

        let outcome = proc.process_step(&mut e, &def, now()).await.unwrap();
        let until = now() + Duration::hours(2);
        assert_eq!(outcome, ProcessOutcome::Waiting { until });
        assert_eq!(e.current_step, 2);
        assert_eq!(e.next_send_at, Some(until));
    }

    #[tokio::test]
    async fn test_day_delay_counts_send_days() {
        let proc = processor(Arc::new(DryRunTransport::new()));
        let mut def = definition(vec![
            StepKind::Delay {
                amount: 2,
                unit: DelayUnit::Days,
            },
            StepKind::Sms {
                body: "ping".into(),
            },
        ]);
        def.sequence.settings = SequenceSettings {
            send_window_start: chrono::NaiveTime::from_hms_opt(9, 0, 0),
            send_window_end: chrono::NaiveTime::from_hms_opt(17, 0, 0),
            send_days: Some(vec![
                chrono::Weekday::Mon,
                chrono::Weekday::Tue,
                chrono::Weekday::Wed,
                chrono::Weekday::Thu,
                chrono::Weekday::Fri,
            ]),
            ..SequenceSettings::default()
        };
        // Friday 16:00 + 2 send days → Tuesday 09:00
        let friday = Utc.with_ymd_and_hms(2026, 3, 6, 16, 0, 0).unwrap();
        let mut e = Enrollment::new(&def.sequence.id, "person-1", friday);

        let outcome = proc.process_step(&mut e, &def, friday).await.unwrap();
        let tuesday = Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, 0).unwrap();
        assert_eq!(outcome, ProcessOutcome::Waiting { until: tuesday });
    }

    #[tokio::test]
    async fn test_condition_branches_on_open() {
        let proc = processor(Arc::new(DryRunTransport::new()));
        let def = definition(vec![
            StepKind::Email {
                subject: "s".into(),
                body: "b".into(),
            },
            StepKind::Condition(StepCondition {
                kind: ConditionKind::NotOpened,
                reference_step: 1,
                branch_to: 4,
            }),
            StepKind::Sms {
                body: "opened path".into(),
            },
            StepKind::Sms {
                body: "unopened path".into(),
            },
        ]);
        let mut e = Enrollment::new(&def.sequence.id, "person-1", now());
        e.current_step = 2;

        // Never opened → branch to 4
        let outcome = proc.process_step(&mut e, &def, now()).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Branched { to: 4 });
        assert_eq!(e.current_step, 4);

        // Opened → fall through to 3
        let mut e2 = Enrollment::new(&def.sequence.id, "person-2", now());
        e2.current_step = 2;
        e2.ledger.record_open(1);
        let outcome = proc.process_step(&mut e2, &def, now()).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Branched { to: 3 });
    }

    #[tokio::test]
    async fn test_transient_failure_backs_off_then_degrades() {
        let transport = Arc::new(FailingTransport {
            failures_left: AtomicU32::new(10),
            error: || CadenceError::transient("timeout"),
        });
        let proc = processor(transport);
        let def = definition(vec![
            StepKind::Email {
                subject: "s".into(),
                body: "b".into(),
            },
            StepKind::Sms {
                body: "next".into(),
            },
        ]);
        let mut e = Enrollment::new(&def.sequence.id, "person-1", now());

        let o1 = proc.process_step(&mut e, &def, now()).await.unwrap();
        assert_eq!(
            o1,
            ProcessOutcome::Retrying {
                attempt: 1,
                until: now() + Duration::seconds(60)
            }
        );
        assert_eq!(e.current_step, 1);

        let o2 = proc.process_step(&mut e, &def, now()).await.unwrap();
        assert!(matches!(o2, ProcessOutcome::Retrying { attempt: 2, .. }));

        // Third failure exhausts max_attempts = 3 → permanent, advances
        let o3 = proc.process_step(&mut e, &def, now()).await.unwrap();
        assert_eq!(
            o3,
            ProcessOutcome::FailedPermanently {
                step_number: 1,
                advanced: true
            }
        );
        assert_eq!(e.current_step, 2);
        assert_eq!(e.failure_count, 0);
        assert!(e.ledger.0.get(&1).unwrap().failed);
    }

    #[tokio::test]
    async fn test_permanent_failure_parks_when_configured() {
        let transport = Arc::new(FailingTransport {
            failures_left: AtomicU32::new(10),
            error: || CadenceError::permanent("mailbox does not exist"),
        });
        let proc = StepProcessor::new(
            transport,
            Arc::new(vars()),
            Arc::new(NoopTaskSink),
            retry_config(),
            false,
        );
        let def = definition(vec![
            StepKind::Email {
                subject: "s".into(),
                body: "b".into(),
            },
            StepKind::Sms {
                body: "next".into(),
            },
        ]);
        let mut e = Enrollment::new(&def.sequence.id, "person-1", now());

        let outcome = proc.process_step(&mut e, &def, now()).await.unwrap();
        assert_eq!(
            outcome,
            ProcessOutcome::FailedPermanently {
                step_number: 1,
                advanced: false
            }
        );
        assert_eq!(e.current_step, 1);
        assert_eq!(e.status, EnrollmentStatus::Active);
        assert!(e.next_send_at.is_none());
    }

    #[tokio::test]
    async fn test_missing_recipient_is_permanent() {
        let proc = StepProcessor::new(
            Arc::new(DryRunTransport::new()),
            Arc::new(StaticVariables(Default::default())),
            Arc::new(NoopTaskSink),
            retry_config(),
            true,
        );
        let def = definition(vec![
            StepKind::Email {
                subject: "s".into(),
                body: "b".into(),
            },
            StepKind::Sms {
                body: "next".into(),
            },
        ]);
        let mut e = Enrollment::new(&def.sequence.id, "person-1", now());

        let outcome = proc.process_step(&mut e, &def, now()).await.unwrap();
        assert_eq!(
            outcome,
            ProcessOutcome::FailedPermanently {
                step_number: 1,
                advanced: true
            }
        );
    }

    #[tokio::test]
    async fn test_send_as_reply_threads_onto_last_message() {
        let transport = Arc::new(DryRunTransport::new());
        let mut def = definition(vec![
            StepKind::Email {
                subject: "first".into(),
                body: "b".into(),
            },
            StepKind::Email {
                subject: "second".into(),
                body: "b".into(),
            },
        ]);
        def.sequence.settings.send_as_reply = true;
        let proc = processor(transport.clone());
        let mut e = Enrollment::new(&def.sequence.id, "person-1", now());

        proc.process_step(&mut e, &def, now()).await.unwrap();
        proc.process_step(&mut e, &def, now()).await.unwrap();

        let sent = transport.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].thread_hint.is_none());
        assert_eq!(
            sent[1].thread_hint.as_deref(),
            e.ledger.0.get(&1).unwrap().message_id.as_deref()
        );
    }

    #[tokio::test]
    async fn test_completion_emits_follow_up_task() {
        struct RecordingSink(Mutex<Vec<DateTime<Utc>>>);

        #[async_trait]
        impl TaskSink for RecordingSink {
            async fn create_follow_up(
                &self,
                _enrollment: &Enrollment,
                due_at: DateTime<Utc>,
            ) -> Result<()> {
                self.0.lock().unwrap().push(due_at);
                Ok(())
            }
        }

        let sink = Arc::new(RecordingSink(Mutex::new(Vec::new())));
        let mut def = definition(vec![StepKind::Email {
            subject: "s".into(),
            body: "b".into(),
        }]);
        def.sequence.settings.follow_up_delay_days = Some(3);
        let proc = StepProcessor::new(
            Arc::new(DryRunTransport::new()),
            Arc::new(vars()),
            sink.clone(),
            retry_config(),
            true,
        );
        let mut e = Enrollment::new(&def.sequence.id, "person-1", now());

        proc.process_step(&mut e, &def, now()).await.unwrap();
        assert_eq!(e.status, EnrollmentStatus::Completed);
        let due = sink.0.lock().unwrap().clone();
        assert_eq!(due, vec![now() + Duration::days(3)]);
    }

    #[tokio::test]
    async fn test_inactive_enrollment_is_skipped() {
        let proc = processor(Arc::new(DryRunTransport::new()));
        let def = definition(vec![StepKind::Sms { body: "b".into() }]);
        let mut e = Enrollment::new(&def.sequence.id, "person-1", now());
        e.status = EnrollmentStatus::Replied;

        let outcome = proc.process_step(&mut e, &def, now()).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Skipped);
        assert!(e.next_send_at.is_none());
    }

    #[test]
    fn test_apply_reply_terminates_when_stop_on_reply() {
        let settings = SequenceSettings::default();
        let mut e = Enrollment::new("seq", "person", now());
        e.ledger.record_send(1, "msg-1");

        assert!(apply_event(&mut e, EventKind::Reply, None, now(), &settings));
        assert_eq!(e.status, EnrollmentStatus::Replied);
        assert_eq!(e.reply_detected_at, Some(now()));
        assert!(e.next_send_at.is_none());
    }

    #[test]
    fn test_apply_reply_records_only_when_stop_disabled() {
        let settings = SequenceSettings {
            stop_on_reply: false,
            ..SequenceSettings::default()
        };
        let mut e = Enrollment::new("seq", "person", now());

        assert!(apply_event(&mut e, EventKind::Reply, None, now(), &settings));
        assert_eq!(e.status, EnrollmentStatus::Active);
        assert_eq!(e.reply_detected_at, Some(now()));
        assert!(e.next_send_at.is_some());
    }

    #[test]
    fn test_apply_open_is_idempotent_and_respects_tracking() {
        let settings = SequenceSettings::default();
        let mut e = Enrollment::new("seq", "person", now());

        assert!(apply_event(&mut e, EventKind::Open, Some(1), now(), &settings));
        assert!(!apply_event(&mut e, EventKind::Open, Some(1), now(), &settings));
        assert!(e.ledger.opened(1));

        let no_tracking = SequenceSettings {
            track_opens: false,
            ..SequenceSettings::default()
        };
        let mut e2 = Enrollment::new("seq", "person", now());
        assert!(!apply_event(&mut e2, EventKind::Open, Some(1), now(), &no_tracking));
        assert!(!e2.ledger.opened(1));
    }

    #[test]
    fn test_apply_unsubscribe_always_terminates() {
        let settings = SequenceSettings {
            stop_on_reply: false,
            stop_on_bounce: false,
            ..SequenceSettings::default()
        };
        let mut e = Enrollment::new("seq", "person", now());
        assert!(apply_event(&mut e, EventKind::Unsubscribe, None, now(), &settings));
        assert_eq!(e.status, EnrollmentStatus::Unsubscribed);

        // Terminal states are sticky
        assert!(!apply_event(&mut e, EventKind::Reply, None, now(), &settings));
        assert_eq!(e.status, EnrollmentStatus::Unsubscribed);
    }

    #[test]
    fn test_pause_and_resume() {
        let settings = SequenceSettings::default();
        let mut e = Enrollment::new("seq", "person", now());

        assert!(pause(&mut e, now()));
        assert_eq!(e.status, EnrollmentStatus::Paused);
        assert!(!e.is_due(now()));
        assert!(!pause(&mut e, now()));

        let later = now() + Duration::hours(5);
        assert!(resume(&mut e, &settings, later));
        assert_eq!(e.status, EnrollmentStatus::Active);
        assert_eq!(e.next_send_at, Some(later));
        assert!(!resume(&mut e, &settings, later));
    }

    #[test]
    fn test_resume_keeps_future_due_time() {
        let settings = SequenceSettings::default();
        let future = now() + Duration::days(2);
        let mut e = Enrollment::new("seq", "person", future);
        pause(&mut e, now());
        resume(&mut e, &settings, now());
        assert_eq!(e.next_send_at, Some(future));
    }
}
