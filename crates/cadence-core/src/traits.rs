//! Collaborator traits: the seams where the engine calls out of this core.
//!
//! Real implementations (SMTP/SMS providers, CRM person lookup, task CRUD)
//! live outside this workspace; the engine only depends on these contracts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::{DeliveryReceipt, Enrollment, OutboundMessage, Variables};

/// Message delivery provider. Implementations must be idempotent-safe to
/// retry: the scheduler may resend the same logical message after a timeout.
///
/// Failures are classified through `CadenceError`: `TransientDelivery` is
/// retried with backoff, `PermanentDelivery` is not.
#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    async fn send(&self, message: &OutboundMessage) -> Result<DeliveryReceipt>;
}

/// Resolves named placeholders (`first_name`, `company_name`, `sender_email`,
/// ...) for one person at send time. The reserved keys `email` and `phone`
/// provide the recipient address for the respective channel.
///
/// Unresolved variables render as empty strings; they never fail a send.
#[async_trait]
pub trait VariableSource: Send + Sync {
    async fn variables_for(&self, person_id: &str) -> Result<Variables>;
}

/// Receives follow-up task requests when an enrollment completes and the
/// sequence has `follow_up_delay_days` configured.
#[async_trait]
pub trait TaskSink: Send + Sync {
    async fn create_follow_up(&self, enrollment: &Enrollment, due_at: DateTime<Utc>)
        -> Result<()>;
}
