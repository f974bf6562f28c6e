//! The immutable event record shared by the bus, the store and projections.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{new_event_id, now_millis};

/// Timestamp of an event whose producer did not supply one. `0` is a valid
/// timestamp and is kept as is.
pub const UNSET_TIMESTAMP: i64 = i64::MIN;

fn unset_timestamp() -> i64 {
    UNSET_TIMESTAMP
}

/// An immutable record of a state change.
///
/// Wire and storage shape: `{id, aggregate_id, type, data, timestamp}`.
/// Every field defaults when absent so that malformed input surfaces as a
/// [`DomainError::Validation`] from [`Event::validate`] rather than as a
/// decode failure.
///
/// `data` is opaque: nothing in the pipeline inspects it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Event {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub aggregate_id: String,
    #[serde(rename = "type", default)]
    pub event_type: String,
    #[serde(default)]
    pub data: String,
    /// Ordering key, milliseconds since the Unix epoch for minted events.
    /// Absent on the wire decodes to [`UNSET_TIMESTAMP`].
    #[serde(default = "unset_timestamp")]
    pub timestamp: i64,
}

impl Event {
    /// Mint a new event with a fresh id and the current time.
    pub fn new(
        aggregate_id: impl Into<String>,
        event_type: impl Into<String>,
        data: impl Into<String>,
    ) -> Self {
        Self {
            id: new_event_id(),
            aggregate_id: aggregate_id.into(),
            event_type: event_type.into(),
            data: data.into(),
            timestamp: now_millis(),
        }
    }

    /// Replace the id (tests and replays of externally-identified events).
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Replace the ordering timestamp.
    pub fn at(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Assign an id and a timestamp when the producer did not supply them.
    ///
    /// Transports that only carry a payload (no metadata) yield events with
    /// an empty id and an unset timestamp; ingestion fills them here.
    pub fn fill_defaults(&mut self) {
        if self.id.is_empty() {
            self.id = new_event_id();
        }
        if !self.has_timestamp() {
            self.timestamp = now_millis();
        }
    }

    pub fn has_timestamp(&self) -> bool {
        self.timestamp != UNSET_TIMESTAMP
    }

    /// Check the structural invariants: non-empty `id`, `aggregate_id` and `type`.
    pub fn validate(&self) -> DomainResult<()> {
        if self.id.trim().is_empty() {
            return Err(DomainError::validation("event id must not be empty"));
        }
        if self.aggregate_id.trim().is_empty() {
            return Err(DomainError::validation("aggregate_id must not be empty"));
        }
        if self.event_type.trim().is_empty() {
            return Err(DomainError::validation("type must not be empty"));
        }
        Ok(())
    }
}

/// Half-open timestamp window `[from, to)`; `None` leaves a side unbounded.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub from: Option<i64>,
    pub to: Option<i64>,
}

impl TimeRange {
    pub fn new(from: i64, to: i64) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
        }
    }

    /// The unbounded window.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn since(from: i64) -> Self {
        Self {
            from: Some(from),
            to: None,
        }
    }

    pub fn until(to: i64) -> Self {
        Self {
            from: None,
            to: Some(to),
        }
    }

    pub fn contains(&self, timestamp: i64) -> bool {
        self.from.is_none_or(|from| timestamp >= from) && self.to.is_none_or(|to| timestamp < to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_type_field_under_its_wire_name() {
        let e = Event::new("a1", "EventType1", "d1").with_id("e1").at(1);
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["type"], "EventType1");
        assert_eq!(json["aggregate_id"], "a1");
        assert_eq!(json["timestamp"], 1);
        assert!(json.get("event_type").is_none());
    }

    #[test]
    fn missing_fields_decode_and_fail_validation() {
        let e: Event = serde_json::from_str(r#"{"type":"EventType1"}"#).unwrap();
        assert_eq!(e.aggregate_id, "");
        assert!(matches!(e.validate(), Err(DomainError::Validation(_))));
    }

    #[test]
    fn validation_requires_id_aggregate_and_type() {
        assert!(Event::new("a1", "t", "").validate().is_ok());
        assert!(Event::new("a1", "t", "").with_id("").validate().is_err());
        assert!(Event::new("", "t", "").validate().is_err());
        assert!(Event::new("a1", " ", "").validate().is_err());
    }

    #[test]
    fn fill_defaults_only_touches_missing_fields() {
        let mut bare = Event {
            id: String::new(),
            aggregate_id: "a1".into(),
            event_type: "t".into(),
            data: "x".into(),
            timestamp: UNSET_TIMESTAMP,
        };
        bare.fill_defaults();
        assert!(!bare.id.is_empty());
        assert!(bare.timestamp > 0);

        let mut full = Event::new("a1", "t", "x").with_id("e1").at(5);
        full.fill_defaults();
        assert_eq!(full.id, "e1");
        assert_eq!(full.timestamp, 5);
    }

    #[test]
    fn explicit_zero_timestamp_survives_defaults() {
        let mut epoch: Event =
            serde_json::from_str(r#"{"id":"e0","aggregate_id":"a1","type":"t","timestamp":0}"#).unwrap();
        epoch.fill_defaults();
        assert_eq!(epoch.timestamp, 0);

        let mut absent: Event =
            serde_json::from_str(r#"{"id":"e1","aggregate_id":"a1","type":"t"}"#).unwrap();
        assert!(!absent.has_timestamp());
        absent.fill_defaults();
        assert!(absent.timestamp > 0);
    }

    #[test]
    fn time_range_is_half_open() {
        let r = TimeRange::new(10, 20);
        assert!(r.contains(10));
        assert!(r.contains(19));
        assert!(!r.contains(20));
        assert!(!r.contains(9));
        assert!(TimeRange::all().contains(i64::MIN));
        assert!(TimeRange::since(5).contains(i64::MAX));
        assert!(!TimeRange::until(5).contains(5));
    }
}
