//! Telemetry events and their log-entry encoding.
//!
//! Events travel through the durable log as flat string field maps (the
//! shape Redis Streams and most log backends store natively). The gateway
//! side builds an [`Event`] and encodes it with [`Event::to_fields`]; the
//! engine side decodes entries into a [`ReceivedEvent`] with
//! [`ReceivedEvent::decode`].
//!
//! Decoding never fails. Missing or empty fields become `None`, and a
//! timestamp that does not parse falls back to the time the entry was
//! received, so a single sloppy producer cannot wedge the consumer.
//!
//! # Example
//!
//! ```
//! use pulse_core::event::{Event, ReceivedEvent};
//! use chrono::{TimeZone, Utc};
//!
//! let at = Utc.with_ymd_and_hms(2024, 3, 15, 14, 30, 0).unwrap();
//! let event = Event::page_view("usr_789", "sess_456", "/products", at);
//!
//! let received = ReceivedEvent::decode(&event.to_fields(), Utc::now());
//! assert_eq!(received.user_id.as_deref(), Some("usr_789"));
//! assert!(received.is_page_view());
//! assert!(!received.timestamp_fallback);
//! ```

use crate::environment::epoch_seconds;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// The `event_type` value that counts towards top pages.
pub const PAGE_VIEW: &str = "page_view";

/// Field names used in the log-entry encoding.
pub mod field {
    /// Event type (e.g. `page_view`, `click`)
    pub const EVENT_TYPE: &str = "event_type";
    /// Page URL the event happened on
    pub const PAGE_URL: &str = "page_url";
    /// User identifier
    pub const USER_ID: &str = "user_id";
    /// Session identifier
    pub const SESSION_ID: &str = "session_id";
    /// ISO 8601 / RFC 3339 timestamp
    pub const TIMESTAMP: &str = "timestamp";
}

/// Flat string field map carried by a log entry.
pub type Fields = BTreeMap<String, String>;

/// Identifier the log assigns to an appended entry (e.g. `1710513000000-0`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryId(String);

impl EntryId {
    /// Wrap a raw entry identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for EntryId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for EntryId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// One entry read from the durable log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEntry {
    /// Log-assigned identifier, used for acknowledgement
    pub id: EntryId,
    /// Encoded event fields
    pub fields: Fields,
}

impl LogEntry {
    /// Create a log entry.
    #[must_use]
    pub fn new(id: impl Into<EntryId>, fields: Fields) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }
}

/// A telemetry event as emitted by a client and validated by the gateway.
///
/// Events are immutable once emitted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Event type (e.g. `page_view`)
    pub event_type: String,
    /// Page the event happened on
    pub page_url: String,
    /// User identifier
    pub user_id: String,
    /// Session identifier
    pub session_id: String,
    /// When the event happened, as reported by the client
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Create an event.
    #[must_use]
    pub fn new(
        event_type: impl Into<String>,
        page_url: impl Into<String>,
        user_id: impl Into<String>,
        session_id: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            page_url: page_url.into(),
            user_id: user_id.into(),
            session_id: session_id.into(),
            timestamp,
        }
    }

    /// Create a `page_view` event.
    #[must_use]
    pub fn page_view(
        user_id: impl Into<String>,
        session_id: impl Into<String>,
        page_url: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self::new(PAGE_VIEW, page_url, user_id, session_id, timestamp)
    }

    /// Encode the event as log-entry fields.
    ///
    /// The timestamp is written as RFC 3339 with a `Z` suffix.
    #[must_use]
    pub fn to_fields(&self) -> Fields {
        let mut fields = Fields::new();
        fields.insert(field::EVENT_TYPE.to_string(), self.event_type.clone());
        fields.insert(field::PAGE_URL.to_string(), self.page_url.clone());
        fields.insert(field::USER_ID.to_string(), self.user_id.clone());
        fields.insert(field::SESSION_ID.to_string(), self.session_id.clone());
        fields.insert(
            field::TIMESTAMP.to_string(),
            self.timestamp
                .to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true),
        );
        fields
    }
}

/// An event decoded from a log entry on the consumer side.
///
/// Every identifier is optional: an absent or empty field simply skips the
/// aggregates that depend on it.
#[derive(Clone, Debug, PartialEq)]
pub struct ReceivedEvent {
    /// Event type, if present
    pub event_type: Option<String>,
    /// Page URL, if present
    pub page_url: Option<String>,
    /// User identifier, if present
    pub user_id: Option<String>,
    /// Session identifier, if present
    pub session_id: Option<String>,
    /// Event time in fractional epoch seconds
    pub timestamp: f64,
    /// `true` when the timestamp was missing or unparseable and the receive
    /// time was used instead
    pub timestamp_fallback: bool,
}

impl ReceivedEvent {
    /// Decode entry fields, falling back to `received_at` for the timestamp.
    #[must_use]
    pub fn decode(fields: &Fields, received_at: DateTime<Utc>) -> Self {
        let parsed = non_empty(fields, field::TIMESTAMP).and_then(|raw| parse_timestamp(&raw));
        let timestamp_fallback = parsed.is_none();
        let timestamp = epoch_seconds(parsed.unwrap_or(received_at));

        Self {
            event_type: non_empty(fields, field::EVENT_TYPE),
            page_url: non_empty(fields, field::PAGE_URL),
            user_id: non_empty(fields, field::USER_ID),
            session_id: non_empty(fields, field::SESSION_ID),
            timestamp,
            timestamp_fallback,
        }
    }

    /// Whether this event counts towards top pages.
    #[must_use]
    pub fn is_page_view(&self) -> bool {
        self.event_type.as_deref() == Some(PAGE_VIEW)
    }

    /// Event type for metric labels (`unknown` when absent).
    #[must_use]
    pub fn event_type_label(&self) -> &str {
        self.event_type.as_deref().unwrap_or("unknown")
    }
}

fn non_empty(fields: &Fields, name: &str) -> Option<String> {
    fields
        .get(name)
        .filter(|value| !value.is_empty())
        .cloned()
}

/// Parse an ISO 8601 timestamp.
///
/// Accepts RFC 3339 (`2024-03-15T14:30:00Z`, `...+02:00`), the space
/// separated variant (`2024-03-15 14:30:00+00:00`), naive date-times and bare
/// dates. Naive values are interpreted as UTC.
#[must_use]
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();

    if let Ok(time) = DateTime::parse_from_rfc3339(raw) {
        return Some(time.with_timezone(&Utc));
    }
    if let Ok(time) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%:z") {
        return Some(time.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    #[test]
    fn encode_uses_rfc3339_with_z_suffix() {
        let event = Event::page_view("u1", "s1", "/home", at(1_710_513_000));
        let fields = event.to_fields();
        assert_eq!(fields[field::TIMESTAMP], "2024-03-15T14:30:00Z");
        assert_eq!(fields[field::EVENT_TYPE], PAGE_VIEW);
        assert_eq!(fields.len(), 5);
    }

    #[test]
    fn decode_reads_all_fields() {
        let event = Event::new("click", "/cart", "u1", "s1", at(1_710_513_000));
        let received = ReceivedEvent::decode(&event.to_fields(), at(0));

        assert_eq!(received.event_type.as_deref(), Some("click"));
        assert_eq!(received.page_url.as_deref(), Some("/cart"));
        assert_eq!(received.user_id.as_deref(), Some("u1"));
        assert_eq!(received.session_id.as_deref(), Some("s1"));
        assert!((received.timestamp - 1_710_513_000.0).abs() < 1e-6);
        assert!(!received.is_page_view());
    }

    #[test]
    fn unparseable_timestamp_falls_back_to_receive_time() {
        let mut fields = Event::page_view("u1", "s1", "/", at(5)).to_fields();
        fields.insert(field::TIMESTAMP.to_string(), "yesterday-ish".to_string());

        let received = ReceivedEvent::decode(&fields, at(1_000));
        assert!(received.timestamp_fallback);
        assert!((received.timestamp - 1_000.0).abs() < 1e-6);
    }

    #[test]
    fn missing_timestamp_falls_back_to_receive_time() {
        let fields = Fields::from([(field::USER_ID.to_string(), "u1".to_string())]);
        let received = ReceivedEvent::decode(&fields, at(42));
        assert!(received.timestamp_fallback);
        assert!((received.timestamp - 42.0).abs() < 1e-6);
        assert_eq!(received.event_type_label(), "unknown");
    }

    #[test]
    fn empty_fields_decode_as_absent() {
        let fields = Fields::from([
            (field::USER_ID.to_string(), String::new()),
            (field::SESSION_ID.to_string(), "s1".to_string()),
        ]);
        let received = ReceivedEvent::decode(&fields, at(0));
        assert_eq!(received.user_id, None);
        assert_eq!(received.session_id.as_deref(), Some("s1"));
    }

    #[test]
    fn parses_common_iso_variants() {
        let expected = at(1_710_513_000);
        for raw in [
            "2024-03-15T14:30:00Z",
            "2024-03-15T14:30:00+00:00",
            "2024-03-15T16:30:00+02:00",
            "2024-03-15 14:30:00+00:00",
            "2024-03-15T14:30:00",
            "2024-03-15 14:30:00.000",
        ] {
            assert_eq!(parse_timestamp(raw), Some(expected), "{raw}");
        }
        assert_eq!(parse_timestamp("2024-03-15"), Some(at(1_710_460_800)));
        assert_eq!(parse_timestamp("not a time"), None);
    }

    #[test]
    fn event_round_trips_through_serde_json() {
        let event = Event::page_view("u1", "s1", "/home", at(1_710_513_000));
        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
