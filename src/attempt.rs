//! Delivery context and the attempt counter derived from broker redelivery metadata.

use lapin::{
    message::Delivery,
    types::{AMQPValue, FieldTable},
};

/// Header populated by RabbitMQ each time a message is dead-lettered.
pub const DEATH_HEADER: &str = "x-death";

/// Everything the dispatcher needs from one broker delivery.
///
/// Owned by the dispatcher until the delivery is acknowledged or rejected.
#[derive(Debug, Clone, Default)]
pub struct DeliveryContext {
    pub delivery_tag: u64,
    pub body: Vec<u8>,
    pub headers: FieldTable,
}

impl DeliveryContext {
    pub fn new(delivery_tag: u64, body: Vec<u8>, headers: FieldTable) -> Self {
        Self { delivery_tag, body, headers }
    }

    /// The broker's redelivery history, if the header is present and is a sequence.
    pub fn attempt_history(&self) -> Option<&[AMQPValue]> {
        match self.headers.inner().get(DEATH_HEADER) {
            Some(AMQPValue::FieldArray(entries)) => Some(entries.as_slice()),
            _ => None,
        }
    }

    /// Number of prior deliveries of this logical message. Zero on first delivery
    /// or when the broker does not attach redelivery history.
    pub fn attempt_count(&self) -> u32 {
        self.attempt_history()
            .map(|entries| u32::try_from(entries.len()).unwrap_or(u32::MAX))
            .unwrap_or(0)
    }

    /// Summaries of the well-formed redelivery history entries.
    pub fn death_records(&self) -> Vec<DeathRecord> {
        self.attempt_history()
            .unwrap_or_default()
            .iter()
            .filter_map(DeathRecord::from_amqp)
            .collect()
    }
}

impl From<&Delivery> for DeliveryContext {
    fn from(delivery: &Delivery) -> Self {
        Self {
            delivery_tag: delivery.delivery_tag,
            body: delivery.data.clone(),
            headers: delivery.properties.headers().clone().unwrap_or_default(),
        }
    }
}

/// One entry of the `x-death` header, used for diagnostics only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeathRecord {
    pub queue: String,
    pub reason: String,
    pub count: i64,
}

impl DeathRecord {
    fn from_amqp(value: &AMQPValue) -> Option<Self> {
        let AMQPValue::FieldTable(table) = value else {
            return None;
        };
        let fields = table.inner();
        let text = |key: &str| fields.get(key).and_then(|v| v.as_long_string()).map(|s| s.to_string());

        let count = match fields.get("count") {
            Some(AMQPValue::LongLongInt(n)) => *n,
            Some(AMQPValue::LongInt(n)) => i64::from(*n),
            Some(AMQPValue::ShortInt(n)) => i64::from(*n),
            _ => 1,
        };

        Some(Self {
            queue: text("queue")?,
            reason: text("reason").unwrap_or_default(),
            count,
        })
    }
}
