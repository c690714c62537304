//! Built-in collaborator implementations: a dry-run transport that records
//! instead of delivering, a static variable source, and a no-op task sink.
//! Useful for local runs (`--dry-run`) and as test doubles.

use std::sync::Mutex;

use async_trait::async_trait;
use cadence_core::{
    DeliveryReceipt, DeliveryTransport, Enrollment, OutboundMessage, Result, TaskSink, Variables,
    VariableSource,
};
use chrono::{DateTime, Utc};
use tracing::info;

/// Records outbound messages instead of delivering them. Every send succeeds
/// with a fresh message id.
#[derive(Default)]
pub struct DryRunTransport {
    sent: Mutex<Vec<OutboundMessage>>,
}

impl DryRunTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages recorded so far, in send order.
    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeliveryTransport for DryRunTransport {
    async fn send(&self, message: &OutboundMessage) -> Result<DeliveryReceipt> {
        info!(
            "📨 [dry-run] {} to {}: {}",
            message.channel,
            message.to,
            message.subject.as_deref().unwrap_or(&message.body)
        );
        self.sent.lock().unwrap().push(message.clone());
        Ok(DeliveryReceipt {
            message_id: format!("dry-{}", uuid::Uuid::new_v4()),
        })
    }
}

/// Serves the same variable map for every person.
pub struct StaticVariables(pub Variables);

#[async_trait]
impl VariableSource for StaticVariables {
    async fn variables_for(&self, _person_id: &str) -> Result<Variables> {
        Ok(self.0.clone())
    }
}

/// Discards follow-up task requests.
#[derive(Default)]
pub struct NoopTaskSink;

#[async_trait]
impl TaskSink for NoopTaskSink {
    async fn create_follow_up(
        &self,
        enrollment: &Enrollment,
        due_at: DateTime<Utc>,
    ) -> Result<()> {
        info!(
            "📋 [noop] follow-up for enrollment {} due {}",
            enrollment.id, due_at
        );
        Ok(())
    }
}
