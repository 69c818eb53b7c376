//! Test doubles shared by the unit tests.

use crate::broker::{Broker, DelayRoute};
use crate::envelope::{Envelope, Timestamp};
use crate::error::ConsumerError;
use crate::handler::{AlertSender, AuditRecorder, MessageHandler};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub fn sample_envelope(id: &str) -> Envelope {
    Envelope {
        id: id.to_string(),
        kind: "order.created".to_string(),
        data: serde_json::value::to_raw_value(&serde_json::json!({ "amount": 42 })).unwrap(),
        created_at: Timestamp::parse("2024-05-01T12:00:00Z").unwrap(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerCall {
    Ack(u64),
    Reject(u64),
    Publish { route: DelayRoute, body: Vec<u8>, expiration: Duration },
}

/// Records every broker call, including ones made to fail.
#[derive(Default)]
pub struct RecordingBroker {
    calls: Mutex<Vec<BrokerCall>>,
    fail_publish: bool,
    fail_ack: bool,
    fail_reject: bool,
}

fn channel_closed() -> ConsumerError {
    ConsumerError::Transport(lapin::Error::InvalidChannelState(lapin::ChannelState::Closed))
}

impl RecordingBroker {
    pub fn failing_publish() -> Self {
        Self { fail_publish: true, ..Default::default() }
    }

    pub fn failing_ack() -> Self {
        Self { fail_ack: true, ..Default::default() }
    }

    pub fn failing_reject() -> Self {
        Self { fail_reject: true, ..Default::default() }
    }

    pub fn calls(&self) -> Vec<BrokerCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of ack and reject calls.
    pub fn resolutions(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, BrokerCall::Ack(_) | BrokerCall::Reject(_)))
            .count()
    }

    fn push(&self, call: BrokerCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Broker for RecordingBroker {
    async fn ack(&self, delivery_tag: u64) -> Result<(), ConsumerError> {
        self.push(BrokerCall::Ack(delivery_tag));
        if self.fail_ack {
            return Err(channel_closed());
        }
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64) -> Result<(), ConsumerError> {
        self.push(BrokerCall::Reject(delivery_tag));
        if self.fail_reject {
            return Err(channel_closed());
        }
        Ok(())
    }

    async fn publish_delayed(&self, route: &DelayRoute, body: &[u8], delay: Duration) -> Result<(), ConsumerError> {
        if self.fail_publish {
            return Err(ConsumerError::PublishNotConfirmed { route: route.to_string() });
        }
        self.push(BrokerCall::Publish { route: route.clone(), body: body.to_vec(), expiration: delay });
        Ok(())
    }
}

/// Handler that succeeds or fails on every call, optionally after a delay.
pub struct CountingHandler {
    calls: AtomicUsize,
    fail: bool,
    latency: Duration,
}

impl CountingHandler {
    pub fn succeeding() -> Self {
        Self { calls: AtomicUsize::new(0), fail: false, latency: Duration::ZERO }
    }

    pub fn failing() -> Self {
        Self { fail: true, ..Self::succeeding() }
    }

    pub fn slow(latency: Duration) -> Self {
        Self { latency, ..Self::succeeding() }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageHandler for CountingHandler {
    async fn handle_message(&self, envelope: &Envelope) -> Result<(), ConsumerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.fail {
            return Err(ConsumerError::Handler(format!("cannot process {}", envelope.id).into()));
        }
        Ok(())
    }

    fn handler_name(&self) -> &str {
        "counting"
    }
}

#[derive(Default)]
pub struct CountingAlert {
    calls: AtomicUsize,
    fail: bool,
}

impl CountingAlert {
    pub fn failing() -> Self {
        Self { fail: true, ..Default::default() }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AlertSender for CountingAlert {
    async fn send_alert(&self, _envelope: &Envelope, _reason: &ConsumerError) -> Result<(), ConsumerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(ConsumerError::Collaborator("alert channel down".into()));
        }
        Ok(())
    }
}

/// Alert sender that never completes.
pub struct HangingAlert;

#[async_trait]
impl AlertSender for HangingAlert {
    async fn send_alert(&self, _envelope: &Envelope, _reason: &ConsumerError) -> Result<(), ConsumerError> {
        std::future::pending().await
    }
}

pub struct CountingAudit {
    calls: AtomicUsize,
    last_attempt_count: AtomicU32,
    fail: bool,
}

impl Default for CountingAudit {
    fn default() -> Self {
        Self { calls: AtomicUsize::new(0), last_attempt_count: AtomicU32::new(u32::MAX), fail: false }
    }
}

impl CountingAudit {
    pub fn failing() -> Self {
        Self { fail: true, ..Default::default() }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_attempt_count(&self) -> Option<u32> {
        match self.last_attempt_count.load(Ordering::SeqCst) {
            u32::MAX => None,
            n => Some(n),
        }
    }
}

#[async_trait]
impl AuditRecorder for CountingAudit {
    async fn record_failure(
        &self,
        _envelope: &Envelope,
        _reason: &ConsumerError,
        attempt_count: u32,
    ) -> Result<(), ConsumerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.last_attempt_count.store(attempt_count, Ordering::SeqCst);
        if self.fail {
            return Err(ConsumerError::Collaborator("audit store unavailable".into()));
        }
        Ok(())
    }
}
