use tidemark_core::{Event, UNSET_TIMESTAMP};

/// Metadata keys carried next to the payload on transports that support
/// headers (Kafka record headers, NATS message headers).
pub mod headers {
    pub const EVENT_ID: &str = "event-id";
    pub const AGGREGATE_ID: &str = "aggregate-id";
    pub const EVENT_TYPE: &str = "event-type";
    pub const TIMESTAMP: &str = "event-timestamp";
}

/// Header pairs describing `event`, in a fixed order.
pub fn outbound_headers(event: &Event) -> [(&'static str, String); 4] {
    [
        (headers::EVENT_ID, event.id.clone()),
        (headers::AGGREGATE_ID, event.aggregate_id.clone()),
        (headers::EVENT_TYPE, event.event_type.clone()),
        (headers::TIMESTAMP, event.timestamp.to_string()),
    ]
}

/// A transport-native message reduced to the parts every backend can offer.
///
/// Adapters build one of these per inbound message and convert it with
/// [`InboundMessage::into_event`], so the payload-to-event mapping is the same
/// for every backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundMessage {
    pub payload: Vec<u8>,
    /// Partitioning key (Kafka record key); used as the aggregate id fallback.
    pub key: Option<String>,
    pub headers: Vec<(String, String)>,
    /// Broker-assigned timestamp, used when no timestamp header is present.
    pub broker_timestamp: Option<i64>,
}

impl InboundMessage {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            ..Self::default()
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_broker_timestamp(mut self, timestamp: i64) -> Self {
        self.broker_timestamp = Some(timestamp);
        self
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Build the event: payload becomes `data`; everything else comes from
    /// metadata when present and is left empty (or unset) otherwise.
    pub fn into_event(self) -> Event {
        let id = self.header(headers::EVENT_ID).unwrap_or_default().to_string();
        let event_type = self.header(headers::EVENT_TYPE).unwrap_or_default().to_string();
        let aggregate_id = self
            .header(headers::AGGREGATE_ID)
            .map(str::to_string)
            .or_else(|| self.key.clone())
            .unwrap_or_default();
        let timestamp = self
            .header(headers::TIMESTAMP)
            .and_then(|t| t.parse::<i64>().ok())
            .or(self.broker_timestamp)
            .unwrap_or(UNSET_TIMESTAMP);

        Event {
            id,
            aggregate_id,
            event_type,
            data: String::from_utf8_lossy(&self.payload).into_owned(),
            timestamp,
        }
    }
}
