//! Traits implemented by the consumer's collaborators: business logic,
//! alerting and failure auditing.

use crate::envelope::Envelope;
use crate::error::ConsumerError;
use async_trait::async_trait;

/// Business logic applied to each decoded envelope.
///
/// Implement this trait for your processing logic. The consumer acknowledges,
/// retries or dead-letters the delivery according to the returned result;
/// the handler never talks to the broker.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Processes a single envelope.
    ///
    /// # Returns
    /// `Ok(())` if the envelope was processed successfully. Any error counts as a
    /// failed attempt and is subject to the retry policy.
    async fn handle_message(&self, envelope: &Envelope) -> Result<(), ConsumerError>;

    /// A name for the handler, used for logging and identification.
    fn handler_name(&self) -> &str;
}

/// Notified once a message has exhausted its retry budget.
#[async_trait]
pub trait AlertSender: Send + Sync {
    async fn send_alert(&self, envelope: &Envelope, reason: &ConsumerError) -> Result<(), ConsumerError>;
}

/// Records terminally failed messages for later investigation.
#[async_trait]
pub trait AuditRecorder: Send + Sync {
    async fn record_failure(
        &self,
        envelope: &Envelope,
        reason: &ConsumerError,
        attempt_count: u32,
    ) -> Result<(), ConsumerError>;
}
