//! Sequence and enrollment data model.
//!
//! A `Sequence` is an ordered list of `Step`s (email, sms, delay, condition)
//! owned by a tenant. An `Enrollment` is one person's progress through one
//! sequence, the unit of execution state the scheduler operates on.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

// ─── Sequence definition ──────────────────────────────────────

/// Sequence lifecycle status. Steps may only be mutated while not `Active`;
/// that rule is enforced by the definition layer, not here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceStatus {
    Draft,
    Active,
    Paused,
    Archived,
}

impl SequenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(Self::Draft),
            "active" => Some(Self::Active),
            "paused" => Some(Self::Paused),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }
}

/// Per-sequence behavior switches and the send window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceSettings {
    /// Thread follow-up emails onto the prior message when possible.
    #[serde(default)]
    pub send_as_reply: bool,
    /// Terminate the enrollment when the person replies.
    #[serde(default = "default_true")]
    pub stop_on_reply: bool,
    /// Terminate the enrollment when a message bounces.
    #[serde(default = "default_true")]
    pub stop_on_bounce: bool,
    /// Record open signals. When disabled, open-based conditions always read
    /// the ledger as "never opened".
    #[serde(default = "default_true")]
    pub track_opens: bool,
    /// Record click signals. Same contract as `track_opens`.
    #[serde(default = "default_true")]
    pub track_clicks: bool,
    /// Local time-of-day the send window opens. None = no window.
    #[serde(default)]
    pub send_window_start: Option<NaiveTime>,
    /// Local time-of-day the send window closes (exclusive).
    #[serde(default)]
    pub send_window_end: Option<NaiveTime>,
    /// Allowed weekdays. None = every day.
    #[serde(default)]
    pub send_days: Option<Vec<Weekday>>,
    /// IANA timezone name the window is evaluated in. None = UTC.
    #[serde(default)]
    pub timezone: Option<String>,
    /// Days after completion before a follow-up task is requested.
    #[serde(default)]
    pub follow_up_delay_days: Option<u32>,
}

fn default_true() -> bool {
    true
}

impl Default for SequenceSettings {
    fn default() -> Self {
        Self {
            send_as_reply: false,
            stop_on_reply: true,
            stop_on_bounce: true,
            track_opens: true,
            track_clicks: true,
            send_window_start: None,
            send_window_end: None,
            send_days: None,
            timezone: None,
            follow_up_delay_days: None,
        }
    }
}

impl SequenceSettings {
    /// Whether a weekday is an allowed send day.
    pub fn allows_day(&self, day: Weekday) -> bool {
        match &self.send_days {
            Some(days) => days.contains(&day),
            None => true,
        }
    }
}

/// A sequence definition (read-only for the scheduler).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sequence {
    pub id: String,
    /// Owning tenant.
    pub tenant_id: String,
    pub name: String,
    pub status: SequenceStatus,
    #[serde(default)]
    pub settings: SequenceSettings,
    pub created_at: DateTime<Utc>,
}

impl Sequence {
    pub fn new(tenant_id: &str, name: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            name: name.to_string(),
            status: SequenceStatus::Draft,
            settings: SequenceSettings::default(),
            created_at: Utc::now(),
        }
    }
}

/// Delay units for `delay` steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayUnit {
    Minutes,
    Hours,
    Days,
    Weeks,
}

impl DelayUnit {
    /// Literal wall-clock duration of `amount` units.
    pub fn duration(&self, amount: u32) -> chrono::Duration {
        let amount = i64::from(amount);
        match self {
            Self::Minutes => chrono::Duration::minutes(amount),
            Self::Hours => chrono::Duration::hours(amount),
            Self::Days => chrono::Duration::days(amount),
            Self::Weeks => chrono::Duration::weeks(amount),
        }
    }

    /// Day-granular units are counted in allowed send days when the sequence
    /// restricts its send days.
    pub fn is_day_granular(&self) -> bool {
        matches!(self, Self::Days | Self::Weeks)
    }

    /// Number of days represented by `amount` units, for day-granular units.
    pub fn days(&self, amount: u32) -> u32 {
        match self {
            Self::Days => amount,
            Self::Weeks => amount * 7,
            _ => 0,
        }
    }
}

/// Engagement check performed by a `condition` step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionKind {
    Opened,
    Clicked,
    NotOpened,
    NotClicked,
}

/// A branch point: inspect the ledger entry of a prior step and jump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepCondition {
    pub kind: ConditionKind,
    /// The prior step whose engagement is inspected.
    pub reference_step: u32,
    /// Step to jump to when the check passes.
    pub branch_to: u32,
}

/// Closed step variant; one handler per tag in the state machine keeps
/// `process_step` exhaustive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    Email { subject: String, body: String },
    Sms { body: String },
    Delay { amount: u32, unit: DelayUnit },
    Condition(StepCondition),
}

impl StepKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Email { .. } => "email",
            Self::Sms { .. } => "sms",
            Self::Delay { .. } => "delay",
            Self::Condition(_) => "condition",
        }
    }
}

/// One ordered unit of a sequence. `step_number` is unique and contiguous
/// from 1 within a sequence (maintained by the definition layer).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub sequence_id: String,
    pub step_number: u32,
    pub kind: StepKind,
}

impl Step {
    pub fn new(sequence_id: &str, step_number: u32, kind: StepKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sequence_id: sequence_id.to_string(),
            step_number,
            kind,
        }
    }
}

/// A sequence together with its ordered steps, as loaded from the
/// definition store.
#[derive(Debug, Clone)]
pub struct SequenceDefinition {
    pub sequence: Sequence,
    /// Ordered by step_number ascending.
    pub steps: Vec<Step>,
}

impl SequenceDefinition {
    pub fn step(&self, step_number: u32) -> Option<&Step> {
        self.steps.iter().find(|s| s.step_number == step_number)
    }

    /// Highest step number, or 0 for an empty sequence.
    pub fn last_step_number(&self) -> u32 {
        self.steps.iter().map(|s| s.step_number).max().unwrap_or(0)
    }

    pub fn settings(&self) -> &SequenceSettings {
        &self.sequence.settings
    }
}

// ─── Enrollment ──────────────────────────────────────────────

/// Enrollment lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Active,
    Paused,
    Completed,
    Bounced,
    Replied,
    Unsubscribed,
}

impl EnrollmentStatus {
    /// Terminal states never hold pending work (`next_send_at` is None).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Bounced | Self::Replied | Self::Unsubscribed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Bounced => "bounced",
            Self::Replied => "replied",
            Self::Unsubscribed => "unsubscribed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            "bounced" => Some(Self::Bounced),
            "replied" => Some(Self::Replied),
            "unsubscribed" => Some(Self::Unsubscribed),
            _ => None,
        }
    }
}

/// Per-step engagement record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepEngagement {
    #[serde(default)]
    pub sent: bool,
    #[serde(default)]
    pub opened: bool,
    #[serde(default)]
    pub clicked: bool,
    /// Set when a permanent delivery failure was recorded for this step.
    #[serde(default)]
    pub failed: bool,
    /// Transport message id of the send, used as a thread hint for
    /// `send_as_reply`.
    #[serde(default)]
    pub message_id: Option<String>,
}

/// Per-enrollment record of which steps were sent/opened/clicked, keyed by
/// step number.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EngagementLedger(pub BTreeMap<u32, StepEngagement>);

impl EngagementLedger {
    pub fn opened(&self, step_number: u32) -> bool {
        self.0.get(&step_number).is_some_and(|e| e.opened)
    }

    pub fn clicked(&self, step_number: u32) -> bool {
        self.0.get(&step_number).is_some_and(|e| e.clicked)
    }

    pub fn record_send(&mut self, step_number: u32, message_id: &str) {
        let entry = self.0.entry(step_number).or_default();
        entry.sent = true;
        entry.message_id = Some(message_id.to_string());
    }

    pub fn record_failure(&mut self, step_number: u32) {
        self.0.entry(step_number).or_default().failed = true;
    }

    pub fn record_open(&mut self, step_number: u32) {
        self.0.entry(step_number).or_default().opened = true;
    }

    pub fn record_click(&mut self, step_number: u32) {
        self.0.entry(step_number).or_default().clicked = true;
    }

    /// Message id of the most recent sent step, for threading replies.
    pub fn last_message_id(&self) -> Option<&str> {
        self.0
            .iter()
            .rev()
            .find(|(_, e)| e.sent)
            .and_then(|(_, e)| e.message_id.as_deref())
    }
}

/// One person's progress through one sequence, the unit of execution state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: String,
    pub sequence_id: String,
    pub person_id: String,
    /// Next step to process (1-based).
    pub current_step: u32,
    pub status: EnrollmentStatus,
    /// When the current step becomes due. None = no pending work.
    pub next_send_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub reply_detected_at: Option<DateTime<Utc>>,
    pub bounce_detected_at: Option<DateTime<Utc>>,
    /// Consecutive delivery failures at the current step.
    pub failure_count: u32,
    pub ledger: EngagementLedger,
    /// Worker currently holding the processing lease.
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Enrollment {
    /// Create a fresh active enrollment at step 1.
    pub fn new(sequence_id: &str, person_id: &str, next_send_at: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sequence_id: sequence_id.to_string(),
            person_id: person_id.to_string(),
            current_step: 1,
            status: EnrollmentStatus::Active,
            next_send_at: Some(next_send_at),
            completed_at: None,
            reply_detected_at: None,
            bounce_detected_at: None,
            failure_count: 0,
            ledger: EngagementLedger::default(),
            lease_owner: None,
            lease_expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the enrollment has due work at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == EnrollmentStatus::Active
            && self.next_send_at.is_some_and(|at| at <= now)
    }
}

// ─── External events ──────────────────────────────────────────

/// How an external event addresses its enrollment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventTarget {
    Enrollment(String),
    PersonSequence {
        person_id: String,
        sequence_id: String,
    },
}

/// Kind of asynchronous engagement signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Open,
    Click,
    Reply,
    Bounce,
    Unsubscribe,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Click => "click",
            Self::Reply => "reply",
            Self::Bounce => "bounce",
            Self::Unsubscribe => "unsubscribe",
        }
    }
}

/// Asynchronous signal pushed by the engagement/event source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngagementEvent {
    pub target: EventTarget,
    /// Step the signal refers to (open/click).
    pub step_number: Option<u32>,
    pub kind: EventKind,
    pub occurred_at: DateTime<Utc>,
}

// ─── Outbound messages ────────────────────────────────────────

/// Outbound channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Sms,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Email => write!(f, "email"),
            Self::Sms => write!(f, "sms"),
        }
    }
}

/// Rendered payload handed to the delivery transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub channel: Channel,
    pub to: String,
    /// Email only.
    pub subject: Option<String>,
    pub body: String,
    /// Prior message id when the sequence threads replies.
    pub thread_hint: Option<String>,
}

/// Transport acknowledgement of a send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub message_id: String,
}

/// Resolved substitution variables for one person.
pub type Variables = HashMap<String, String>;
