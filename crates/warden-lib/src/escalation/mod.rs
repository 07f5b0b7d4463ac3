//! Escalation to human operators
//!
//! Once automatic recovery is exhausted the engine hands one
//! [`EscalationEvent`] to the [`EscalationSink`], which forwards it to an
//! [`EscalationChannel`]. The sink never makes decisions; failed hand-offs wait
//! in an outbox until the next flush.

mod channels;
mod sink;

pub use channels::{LogChannel, WebhookChannel};
pub use sink::{EscalationEvent, EscalationSeverity, EscalationSink};

use async_trait::async_trait;

/// Destination for escalation events
#[async_trait]
pub trait EscalationChannel: Send + Sync {
    /// Deliver one event; an error leaves it queued for the next flush
    async fn deliver(&self, event: &EscalationEvent) -> anyhow::Result<()>;

    /// Short name for logs
    fn name(&self) -> &'static str;
}
