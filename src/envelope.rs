//! Event envelope shared by every producer and consumer.
//!
//! On the wire an envelope is a single JSON object: the envelope fields sit
//! next to the domain fields of the payload.
//!
//! ```json
//! {
//!   "eventId": "1b4e28ba-2fa1-11d2-883f-0016d3cca427",
//!   "eventType": "order.created",
//!   "partitionKey": "a@x.com",
//!   "schemaVersion": 1,
//!   "producedAt": "2025-01-01T12:00:00Z",
//!   "orderId": "V1StGXR8_Z",
//!   "userEmail": "a@x.com",
//!   "items": [{ "itemId": "p1", "quantity": 2 }],
//!   "price": 100.0
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::bus::Record;
use crate::error::{BusError, HandlerError};

/// Field names owned by the envelope; payloads must not use them.
pub const RESERVED_FIELDS: [&str; 5] = [
    "eventId",
    "eventType",
    "partitionKey",
    "schemaVersion",
    "producedAt",
];

/// Accepted in place of `producedAt` for producers that predate it.
const LEGACY_TIMESTAMP_FIELD: &str = "timeStamp";

/// Trait for payload types that travel on a topic.
///
/// The type is the contract between the producing service and every
/// consumer: topic name, field names and schema version live here instead of
/// in string literals scattered across services.
///
/// # Example
///
/// ```
/// use serde::{Deserialize, Serialize};
/// use orderflow::Event;
///
/// #[derive(Debug, Serialize, Deserialize)]
/// #[serde(rename_all = "camelCase")]
/// pub struct InvoiceIssued {
///     pub invoice_id: String,
///     pub customer: String,
/// }
///
/// impl Event for InvoiceIssued {
///     const TOPIC: &'static str = "invoice.issued";
///
///     fn partition_key(&self) -> Option<String> {
///         Some(self.customer.clone())
///     }
/// }
/// ```
pub trait Event: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Topic this event is published to; also its `eventType`.
    const TOPIC: &'static str;

    /// Highest schema version this type understands.
    const SCHEMA_VERSION: u32 = 1;

    /// Domain key that orders this event relative to others, if any.
    fn partition_key(&self) -> Option<String> {
        None
    }
}

/// A payload wrapped with its routing and identity metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<T> {
    /// Unique per produced message
    pub event_id: String,
    /// Topic name of the event
    pub event_type: String,
    /// Key the producer routed the message with
    pub partition_key: String,
    pub schema_version: u32,
    pub produced_at: DateTime<Utc>,
    pub payload: T,
}

impl<T> Envelope<T> {
    /// Wrap `payload` with a fresh event id and the current time.
    pub fn new(event_type: impl Into<String>, partition_key: impl Into<String>, payload: T) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            partition_key: partition_key.into(),
            schema_version: 1,
            produced_at: Utc::now(),
            payload,
        }
    }

    pub fn with_schema_version(mut self, schema_version: u32) -> Self {
        self.schema_version = schema_version;
        self
    }
}

impl<E: Event> Envelope<E> {
    /// Wrap a contract event, stamping its topic and schema version.
    pub fn for_event(payload: E, partition_key: impl Into<String>) -> Self {
        Self::new(E::TOPIC, partition_key, payload).with_schema_version(E::SCHEMA_VERSION)
    }
}

impl<T: Serialize> Envelope<T> {
    /// Serialize to the flat JSON wire format.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, BusError> {
        let fail = |cause: String| BusError::Serialization {
            event_type: self.event_type.clone(),
            cause,
        };

        let fields = match serde_json::to_value(&self.payload).map_err(|e| fail(e.to_string()))? {
            Value::Object(fields) => fields,
            other => {
                return Err(fail(format!(
                    "payload must serialize to a JSON object, got {}",
                    json_kind(&other)
                )))
            }
        };
        if let Some(field) = RESERVED_FIELDS.iter().find(|f| fields.contains_key(**f)) {
            return Err(fail(format!("payload uses reserved field {field}")));
        }

        let mut object = Map::with_capacity(fields.len() + RESERVED_FIELDS.len());
        object.insert("eventId".into(), Value::String(self.event_id.clone()));
        object.insert("eventType".into(), Value::String(self.event_type.clone()));
        object.insert(
            "partitionKey".into(),
            Value::String(self.partition_key.clone()),
        );
        object.insert("schemaVersion".into(), Value::from(self.schema_version));
        object.insert(
            "producedAt".into(),
            serde_json::to_value(self.produced_at).map_err(|e| fail(e.to_string()))?,
        );
        object.extend(fields);

        serde_json::to_vec(&Value::Object(object)).map_err(|e| fail(e.to_string()))
    }
}

/// An envelope whose payload has not been bound to a type yet.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEnvelope {
    pub event_id: String,
    pub event_type: String,
    pub partition_key: Option<String>,
    pub schema_version: u32,
    pub produced_at: DateTime<Utc>,
    pub payload: Map<String, Value>,
}

impl RawEnvelope {
    /// Parse a message body read from `topic`.
    ///
    /// A missing `eventType` defaults to the topic, a missing `schemaVersion`
    /// to 1, and `timeStamp` is accepted in place of `producedAt`.
    pub fn from_slice(topic: &str, bytes: &[u8]) -> Result<Self, BusError> {
        let fail = |cause: String| BusError::Deserialization {
            topic: topic.to_string(),
            cause,
        };

        let mut map = match serde_json::from_slice::<Value>(bytes).map_err(|e| fail(e.to_string()))? {
            Value::Object(map) => map,
            other => {
                return Err(fail(format!(
                    "envelope must be a JSON object, got {}",
                    json_kind(&other)
                )))
            }
        };

        let event_id = take_string(&mut map, "eventId")
            .map_err(fail)?
            .ok_or_else(|| fail("missing eventId".into()))?;
        let event_type = take_string(&mut map, "eventType")
            .map_err(fail)?
            .unwrap_or_else(|| topic.to_string());
        let partition_key = take_string(&mut map, "partitionKey").map_err(fail)?;

        let schema_version = match map.remove("schemaVersion") {
            None => 1,
            Some(value) => value
                .as_u64()
                .and_then(|v| u32::try_from(v).ok())
                .filter(|v| *v > 0)
                .ok_or_else(|| fail(format!("invalid schemaVersion {value}")))?,
        };

        let produced_at = map
            .remove("producedAt")
            .or_else(|| map.remove(LEGACY_TIMESTAMP_FIELD))
            .ok_or_else(|| fail("missing producedAt".into()))?;
        let produced_at: DateTime<Utc> =
            serde_json::from_value(produced_at).map_err(|e| fail(format!("producedAt: {e}")))?;

        Ok(Self {
            event_id,
            event_type,
            partition_key,
            schema_version,
            produced_at,
            payload: map,
        })
    }

    /// Parse a consumed record, falling back to the record key for `partitionKey`.
    pub fn from_record(record: &Record) -> Result<Self, BusError> {
        let mut raw = Self::from_slice(&record.topic, &record.payload)?;
        if raw.partition_key.is_none() {
            raw.partition_key = record.key.clone();
        }
        Ok(raw)
    }

    /// Bind the payload to a contract type.
    ///
    /// Fails when the event type belongs to another contract or when the
    /// producer used a newer schema than `E` understands.
    pub fn into_typed<E: Event>(self) -> Result<Envelope<E>, HandlerError> {
        if self.event_type != E::TOPIC {
            return Err(HandlerError::DecodeFailed(format!(
                "event type {} does not match {}",
                self.event_type,
                E::TOPIC
            )));
        }
        if self.schema_version > E::SCHEMA_VERSION {
            return Err(HandlerError::DecodeFailed(format!(
                "schema version {} of {} is newer than supported version {}",
                self.schema_version,
                self.event_type,
                E::SCHEMA_VERSION
            )));
        }

        let payload: E = serde_json::from_value(Value::Object(self.payload))?;
        Ok(Envelope {
            event_id: self.event_id,
            event_type: self.event_type,
            partition_key: self.partition_key.unwrap_or_default(),
            schema_version: self.schema_version,
            produced_at: self.produced_at,
            payload,
        })
    }
}

fn take_string(map: &mut Map<String, Value>, field: &str) -> Result<Option<String>, String> {
    match map.remove(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(other) => Err(format!("{field} must be a string, got {}", json_kind(&other))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
