//! Dead-letter side effects: alerting and failure auditing.

use crate::envelope::Envelope;
use crate::error::ConsumerError;
use crate::handler::{AlertSender, AuditRecorder};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Upper bound on each collaborator call unless overridden.
pub const DEFAULT_COLLABORATOR_TIMEOUT: Duration = Duration::from_secs(5);

/// Runs the alert and audit collaborators for a dead-lettered message.
///
/// Both calls are best-effort and bounded by a timeout: failures and overruns
/// are logged and never returned, so they cannot hold up the rejection of the
/// delivery.
#[derive(Clone)]
pub struct DeadLetterReporter {
    alert: Arc<dyn AlertSender>,
    audit: Arc<dyn AuditRecorder>,
    timeout: Duration,
}

impl DeadLetterReporter {
    pub fn new(alert: Arc<dyn AlertSender>, audit: Arc<dyn AuditRecorder>) -> Self {
        Self { alert, audit, timeout: DEFAULT_COLLABORATOR_TIMEOUT }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn report(&self, envelope: &Envelope, reason: &ConsumerError, attempt_count: u32) {
        if let Err(e) = self.bounded(self.alert.send_alert(envelope, reason)).await {
            log::error!("Failed to send dead-letter alert for message {}: {}", envelope.id, e);
        }

        if let Err(e) = self.bounded(self.audit.record_failure(envelope, reason, attempt_count)).await {
            log::error!("Failed to record dead-lettered message {}: {}", envelope.id, e);
        }
    }

    async fn bounded<F>(&self, call: F) -> Result<(), ConsumerError>
    where
        F: Future<Output = Result<(), ConsumerError>>,
    {
        tokio::time::timeout(self.timeout, call)
            .await
            .unwrap_or_else(|_| Err(ConsumerError::Collaborator(format!("timed out after {:?}", self.timeout))))
    }
}

impl Default for DeadLetterReporter {
    fn default() -> Self {
        Self::new(Arc::new(LogAlertSender), Arc::new(LogAuditRecorder))
    }
}

/// Alert sender that only writes a warning to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAlertSender;

#[async_trait]
impl AlertSender for LogAlertSender {
    async fn send_alert(&self, envelope: &Envelope, reason: &ConsumerError) -> Result<(), ConsumerError> {
        log::warn!("ALERT: message {} ({}) failed permanently: {}", envelope.id, envelope.kind, reason);
        Ok(())
    }
}

/// Audit recorder that writes the failed message to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAuditRecorder;

#[async_trait]
impl AuditRecorder for LogAuditRecorder {
    async fn record_failure(
        &self,
        envelope: &Envelope,
        reason: &ConsumerError,
        attempt_count: u32,
    ) -> Result<(), ConsumerError> {
        log::info!(
            "Recorded failed message {} after {} attempts: {}. Data: {}",
            envelope.id, attempt_count, reason, envelope.data
        );
        Ok(())
    }
}
