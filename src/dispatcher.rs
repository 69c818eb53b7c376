//! Drives a single delivery from raw bytes to exactly one ack or reject.

use crate::attempt::DeliveryContext;
use crate::broker::{Broker, DelayRoute};
use crate::dlq::DeadLetterReporter;
use crate::envelope::Envelope;
use crate::error::ConsumerError;
use crate::handler::MessageHandler;
use crate::retry::{Outcome, RetryDecision, RetryPolicy};
use std::sync::Arc;
use std::time::Duration;

/// How a delivery was resolved with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Processed successfully and acknowledged.
    Accepted,
    /// Body could not be decoded; rejected without requeue and never retried.
    Malformed,
    /// Rejected without requeue so the dead-letter chain redelivers it.
    RetryScheduled { attempt: u32 },
    /// A copy was published to the delay route and the original acknowledged.
    RetryDelayed { attempt: u32, delay: Duration },
    /// Retry budget exhausted; reported and rejected without requeue.
    DeadLettered { attempt: u32 },
}

/// Decodes, processes and resolves deliveries one at a time.
///
/// Every call to [`Dispatcher::dispatch`] issues exactly one ack or reject
/// unless the broker itself fails, in which case the transport error is returned.
pub struct Dispatcher<H: MessageHandler, B: Broker> {
    handler: Arc<H>,
    broker: Arc<B>,
    policy: RetryPolicy,
    delay_route: DelayRoute,
    handler_timeout: Option<Duration>,
    reporter: DeadLetterReporter,
}

impl<H: MessageHandler, B: Broker> Dispatcher<H, B> {
    pub fn new(handler: Arc<H>, broker: Arc<B>, policy: RetryPolicy) -> Self {
        Self {
            handler,
            broker,
            policy,
            delay_route: DelayRoute::default(),
            handler_timeout: None,
            reporter: DeadLetterReporter::default(),
        }
    }

    pub fn with_delay_route(mut self, route: DelayRoute) -> Self {
        self.delay_route = route;
        self
    }

    /// Handler calls exceeding `timeout` count as failed attempts.
    pub fn with_handler_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn with_reporter(mut self, reporter: DeadLetterReporter) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Processes one delivery to resolution.
    pub async fn dispatch(&self, ctx: DeliveryContext) -> Result<Disposition, ConsumerError> {
        let tag = ctx.delivery_tag;

        let envelope = match Envelope::decode(&ctx.body) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::error!(
                    "Failed to parse message, rejecting without retry. Tag: {}, Error: {}, Body: {}",
                    tag,
                    e,
                    String::from_utf8_lossy(&ctx.body)
                );
                self.broker.reject(tag).await?;
                return Ok(Disposition::Malformed);
            }
        };

        let attempt = ctx.attempt_count();
        log::info!(
            "Received message {} ({}) [attempt {}/{}]. Tag: {}",
            envelope.id,
            envelope.kind,
            attempt,
            self.policy.config().max_retries,
            tag
        );
        if attempt > 0 {
            log::debug!("Redelivery history for {}: {:?}", envelope.id, ctx.death_records());
        }

        match self.run_handler(&envelope).await {
            Ok(()) => self.accept(tag, &envelope).await,
            Err(reason) => {
                log::error!("Failed to process message {}. Tag: {}, Error: {}", envelope.id, tag, reason);
                self.resolve_failure(tag, &envelope, attempt, reason).await
            }
        }
    }

    async fn run_handler(&self, envelope: &Envelope) -> Result<(), ConsumerError> {
        let processing = self.handler.handle_message(envelope);
        match self.handler_timeout {
            Some(limit) => tokio::time::timeout(limit, processing)
                .await
                .unwrap_or(Err(ConsumerError::HandlerTimeout(limit))),
            None => processing.await,
        }
    }

    async fn accept(&self, tag: u64, envelope: &Envelope) -> Result<Disposition, ConsumerError> {
        self.broker.ack(tag).await?;
        log::info!("Message {} processed successfully by '{}'. Tag: {}", envelope.id, self.handler.handler_name(), tag);
        Ok(Disposition::Accepted)
    }

    async fn resolve_failure(
        &self,
        tag: u64,
        envelope: &Envelope,
        attempt: u32,
        reason: ConsumerError,
    ) -> Result<Disposition, ConsumerError> {
        let max_retries = self.policy.config().max_retries;

        match self.policy.decide(Outcome::Failure, attempt) {
            RetryDecision::Accept => self.accept(tag, envelope).await,
            RetryDecision::RetryImmediate => {
                self.broker.reject(tag).await?;
                log::warn!(
                    "Message {} rejected for retry via dead-letter chain ({}/{}).",
                    envelope.id,
                    attempt + 1,
                    max_retries
                );
                Ok(Disposition::RetryScheduled { attempt })
            }
            RetryDecision::RetryDelayed { delay } => self.retry_delayed(tag, envelope, attempt, delay).await,
            RetryDecision::DeadLetter => {
                log::warn!(
                    "Message {} exceeded max retries ({}), sending to dead letter.",
                    envelope.id, max_retries
                );
                self.reporter.report(envelope, &reason, attempt).await;
                self.broker.reject(tag).await?;
                Ok(Disposition::DeadLettered { attempt })
            }
        }
    }

    /// Publishes a delayed copy and acknowledges the original only once the
    /// copy is confirmed. If the publish fails the original is rejected instead.
    async fn retry_delayed(
        &self,
        tag: u64,
        envelope: &Envelope,
        attempt: u32,
        delay: Duration,
    ) -> Result<Disposition, ConsumerError> {
        let published = match envelope.encode() {
            Ok(body) => self.broker.publish_delayed(&self.delay_route, &body, delay).await,
            Err(e) => Err(e),
        };

        if let Err(e) = published {
            log::error!(
                "Failed to publish message {} to delay route '{}', rejecting original. Error: {}",
                envelope.id, self.delay_route, e
            );
            self.broker.reject(tag).await?;
            return Err(e);
        }

        self.broker.ack(tag).await?;
        log::warn!(
            "Message {} scheduled for retry in {:?} ({}/{}).",
            envelope.id,
            delay,
            attempt + 1,
            self.policy.config().max_retries
        );
        Ok(Disposition::RetryDelayed { attempt, delay })
    }
}
