//! Identifier and clock helpers used when minting events.

use chrono::Utc;
use uuid::Uuid;

/// Create a fresh event identifier.
///
/// Uses UUIDv7 (time-ordered). Prefer passing ids explicitly in tests for
/// determinism.
pub fn new_event_id() -> String {
    Uuid::now_v7().to_string()
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
