//! The business message envelope and its JSON codec.

use crate::error::ConsumerError;
use chrono::{DateTime, FixedOffset, Offset, SecondsFormat, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::value::RawValue;

/// A decoded business message.
///
/// The wire format is a JSON object with the keys `id`, `type`, `data` and
/// `created` (RFC 3339). `data` is kept as the exact JSON text it arrived as
/// and defaults to `null` when absent; `created` keeps its original text and
/// offset. Re-encoding therefore reproduces both fields byte for byte.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "null_data")]
    pub data: Box<RawValue>,
    #[serde(rename = "created")]
    pub created_at: Timestamp,
}

fn null_data() -> Box<RawValue> {
    RawValue::NULL.to_owned()
}

impl Envelope {
    /// Decodes an envelope from a raw delivery body.
    ///
    /// Any error here is a [`ConsumerError::Parse`], which the dispatcher
    /// dead-letters without consulting the retry policy.
    pub fn decode(body: &[u8]) -> Result<Self, ConsumerError> {
        Ok(serde_json::from_slice(body)?)
    }

    /// Encodes the envelope for the delayed-retry route.
    pub fn encode(&self) -> Result<Vec<u8>, ConsumerError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserializes the opaque payload into a handler-specific type.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T, ConsumerError> {
        Ok(serde_json::from_str(self.data.get())?)
    }
}

impl PartialEq for Envelope {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.kind == other.kind
            && self.data.get() == other.data.get()
            && self.created_at == other.created_at
    }
}

/// An RFC 3339 timestamp that remembers the text it was parsed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timestamp {
    raw: String,
    value: DateTime<FixedOffset>,
}

impl Timestamp {
    pub fn parse(raw: impl Into<String>) -> Result<Self, chrono::ParseError> {
        let raw = raw.into();
        let value = DateTime::parse_from_rfc3339(&raw)?;
        Ok(Self { raw, value })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn as_datetime(&self) -> &DateTime<FixedOffset> {
        &self.value
    }

    pub fn to_utc(&self) -> DateTime<Utc> {
        self.value.with_timezone(&Utc)
    }
}

impl<Tz: TimeZone> From<DateTime<Tz>> for Timestamp
where
    Tz::Offset: std::fmt::Display,
{
    fn from(dt: DateTime<Tz>) -> Self {
        let offset = dt.offset().fix();
        Self {
            raw: dt.to_rfc3339_opts(SecondsFormat::AutoSi, offset.local_minus_utc() == 0),
            value: dt.with_timezone(&offset),
        }
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Timestamp::parse(raw).map_err(serde::de::Error::custom)
    }
}
