//! # RabbitMQ Retry Consumer
//! A RabbitMQ consumer that counts attempts from the broker's `x-death` history
//! and decides, once per delivery, whether to accept, retry or dead-letter a message.

pub mod attempt;
pub mod broker;
pub mod dispatcher;
pub mod dlq;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod retry;
pub mod worker;

#[cfg(test)]
mod testing;

// Re-export key components for easy access
pub use attempt::{DeathRecord, DeliveryContext};
pub use broker::{Broker, DelayRoute, LapinBroker};
pub use dispatcher::{Dispatcher, Disposition};
pub use dlq::{DeadLetterReporter, LogAlertSender, LogAuditRecorder};
pub use envelope::{Envelope, Timestamp};
pub use error::ConsumerError;
pub use handler::{AlertSender, AuditRecorder, MessageHandler};
pub use retry::{Outcome, RetryDecision, RetryPolicy, RetryPolicyConfig, RetryStrategy};
pub use worker::{ConsumerConfig, RetryConsumer};
