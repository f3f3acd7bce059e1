//! Shared types for the crossing monitor

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Newtype wrapper for crossing IDs to provide type safety
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CrossingId(pub String);

impl CrossingId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CrossingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CrossingId {
    fn from(value: &str) -> Self {
        CrossingId(value.to_string())
    }
}

/// A single position sample from the device
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: DateTime<Utc>,
}

impl Position {
    pub fn new(latitude: f64, longitude: f64, timestamp: DateTime<Utc>) -> Self {
        Self { latitude, longitude, timestamp }
    }
}

/// Location permission as reported by the position source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authorization {
    NotDetermined,
    Authorized,
    Denied,
}

impl Authorization {
    pub fn as_str(&self) -> &str {
        match self {
            Authorization::NotDetermined => "not_determined",
            Authorization::Authorized => "authorized",
            Authorization::Denied => "denied",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CrossingKind {
    #[serde(rename = "RAIL")]
    Rail,
    #[serde(rename = "DRAW_BRIDGE")]
    DrawBridge,
}

impl CrossingKind {
    pub fn as_str(&self) -> &str {
        match self {
            CrossingKind::Rail => "rail",
            CrossingKind::DrawBridge => "draw_bridge",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CrossingStatus {
    Open,
    Closed,
    Warning,
    Unknown,
}

impl CrossingStatus {
    pub fn as_str(&self) -> &str {
        match self {
            CrossingStatus::Open => "open",
            CrossingStatus::Closed => "closed",
            CrossingStatus::Warning => "warning",
            CrossingStatus::Unknown => "unknown",
        }
    }
}

/// A monitored crossing as served by the remote crossing service
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrossingRecord {
    pub id: CrossingId,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: CrossingKind,
    pub status: CrossingStatus,
    pub location: Location,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub last_updated: DateTime<Utc>,
    /// Minutes of expected delay, when the service knows it
    #[serde(default, rename = "estimatedDelay")]
    pub estimated_delay_minutes: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_optional_timestamp")]
    pub next_update: Option<DateTime<Utc>>,
}

impl CrossingRecord {
    /// Stand-in record used when a session is started before any crossing is known
    pub fn placeholder() -> Self {
        Self {
            id: CrossingId::from("unknown"),
            name: "Unknown".to_string(),
            kind: CrossingKind::Rail,
            status: CrossingStatus::Unknown,
            location: Location { latitude: 0.0, longitude: 0.0 },
            last_updated: Utc::now(),
            estimated_delay_minutes: None,
            next_update: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Stale,
}

impl Freshness {
    pub fn as_str(&self) -> &str {
        match self {
            Freshness::Fresh => "fresh",
            Freshness::Stale => "stale",
        }
    }
}

/// Immutable copy of the crossing directory at one point in time
#[derive(Debug, Clone, PartialEq)]
pub struct DirectorySnapshot {
    pub records: Vec<CrossingRecord>,
    pub captured_at: DateTime<Utc>,
    pub freshness: Freshness,
}

impl DirectorySnapshot {
    pub fn fresh(records: Vec<CrossingRecord>) -> Self {
        Self { records, captured_at: Utc::now(), freshness: Freshness::Fresh }
    }

    /// Snapshot served when nothing has ever been fetched successfully
    pub fn empty_stale() -> Self {
        Self { records: Vec::new(), captured_at: Utc::now(), freshness: Freshness::Stale }
    }

    /// Same records and capture time, marked stale
    pub fn to_stale(&self) -> Self {
        Self {
            records: self.records.clone(),
            captured_at: self.captured_at,
            freshness: Freshness::Stale,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_fresh(&self) -> bool {
        self.freshness == Freshness::Fresh
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

/// Result of evaluating one position against one snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct ProximityDecision {
    pub crossing_id: CrossingId,
    pub crossing_name: String,
    pub status: CrossingStatus,
    pub distance_m: f64,
    pub eta_minutes: u32,
    pub within_gate: bool,
    pub summary: String,
}

/// Opaque identifier the session host hands back on create
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionHandle(pub String);

impl SessionHandle {
    /// Time-ordered handle for hosts that mint their own identifiers
    pub fn new_v7() -> Self {
        SessionHandle(uuid::Uuid::now_v7().to_string())
    }
}

impl std::fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Static attributes fixed at session creation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionAttributes {
    pub crossing_id: CrossingId,
    pub crossing_name: String,
}

/// Mutable state pushed on every create/update
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionContent {
    pub minutes_remaining: u32,
    pub summary: String,
}

/// The single live session currently shown to the user
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiveSession {
    pub handle: SessionHandle,
    pub crossing_id: CrossingId,
    pub crossing_name: String,
    pub minutes_remaining: u32,
    pub summary: String,
    pub stale_at: DateTime<Utc>,
    /// Seeded by a manual start and not yet adopted by an evaluation cycle
    pub manual: bool,
}

impl LiveSession {
    pub fn content(&self) -> SessionContent {
        SessionContent { minutes_remaining: self.minutes_remaining, summary: self.summary.clone() }
    }
}

/// Epoch values at or above this are taken as milliseconds (year 5138 in seconds)
const EPOCH_MS_THRESHOLD: i64 = 100_000_000_000;

/// Parse a textual timestamp: RFC 3339, offset-less ISO 8601 (UTC), or numeric epoch
pub fn parse_timestamp_str(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Some(naive.and_utc());
        }
    }
    if let Ok(n) = value.parse::<i64>() {
        return timestamp_from_epoch(n);
    }
    value.parse::<f64>().ok().and_then(timestamp_from_epoch_secs_f64)
}

/// Integer epoch in seconds, or milliseconds when large enough
pub fn timestamp_from_epoch(value: i64) -> Option<DateTime<Utc>> {
    if value.abs() >= EPOCH_MS_THRESHOLD {
        DateTime::from_timestamp_millis(value)
    } else {
        DateTime::from_timestamp(value, 0)
    }
}

fn timestamp_from_epoch_secs_f64(value: f64) -> Option<DateTime<Utc>> {
    if !value.is_finite() {
        return None;
    }
    let secs = value.floor();
    let nanos = ((value - secs) * 1e9).round().min(999_999_999.0) as u32;
    DateTime::from_timestamp(secs as i64, nanos)
}

pub(crate) fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::{self, Visitor};

    struct TimestampVisitor;

    impl<'de> Visitor<'de> for TimestampVisitor {
        type Value = DateTime<Utc>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("an ISO 8601 string or epoch timestamp")
        }

        fn visit_str<E>(self, value: &str) -> Result<DateTime<Utc>, E>
        where
            E: de::Error,
        {
            parse_timestamp_str(value)
                .ok_or_else(|| E::custom(format!("unrecognized timestamp {value:?}")))
        }

        fn visit_u64<E>(self, value: u64) -> Result<DateTime<Utc>, E>
        where
            E: de::Error,
        {
            i64::try_from(value)
                .ok()
                .and_then(timestamp_from_epoch)
                .ok_or_else(|| E::custom(format!("epoch timestamp out of range: {value}")))
        }

        fn visit_i64<E>(self, value: i64) -> Result<DateTime<Utc>, E>
        where
            E: de::Error,
        {
            timestamp_from_epoch(value)
                .ok_or_else(|| E::custom(format!("epoch timestamp out of range: {value}")))
        }

        fn visit_f64<E>(self, value: f64) -> Result<DateTime<Utc>, E>
        where
            E: de::Error,
        {
            timestamp_from_epoch_secs_f64(value)
                .ok_or_else(|| E::custom(format!("epoch timestamp out of range: {value}")))
        }
    }

    deserializer.deserialize_any(TimestampVisitor)
}

fn deserialize_optional_timestamp<'de, D>(
    deserializer: D,
) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::{self, Visitor};

    struct OptionalTimestampVisitor;

    impl<'de> Visitor<'de> for OptionalTimestampVisitor {
        type Value = Option<DateTime<Utc>>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("null or a timestamp")
        }

        fn visit_none<E>(self) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(None)
        }

        fn visit_unit<E>(self) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(None)
        }

        fn visit_some<D2>(self, deserializer: D2) -> Result<Self::Value, D2::Error>
        where
            D2: Deserializer<'de>,
        {
            deserialize_timestamp(deserializer).map(Some)
        }
    }

    deserializer.deserialize_option(OptionalTimestampVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record_json(last_updated: &str) -> String {
        format!(
            r#"{{
                "id": "x-1",
                "name": "Atlantic Ave",
                "type": "RAIL",
                "status": "WARNING",
                "lastUpdated": {last_updated},
                "location": {{"latitude": 26.45, "longitude": -80.07}}
            }}"#
        )
    }

    #[test]
    fn test_timestamp_encodings() {
        let expected = Utc.with_ymd_and_hms(2025, 4, 20, 12, 0, 0).unwrap();

        for encoded in [
            r#""2025-04-20T12:00:00Z""#,
            r#""2025-04-20T08:00:00-04:00""#,
            r#""2025-04-20T12:00:00""#,
            "1745150400",
            "1745150400000",
            "1745150400.0",
        ] {
            let record: CrossingRecord = serde_json::from_str(&record_json(encoded)).unwrap();
            assert_eq!(record.last_updated, expected, "encoding {encoded}");
        }
    }

    #[test]
    fn test_unparseable_timestamp_rejects_record() {
        let result = serde_json::from_str::<CrossingRecord>(&record_json(r#""yesterday""#));
        assert!(result.is_err());
    }

    #[test]
    fn test_record_optional_fields() {
        let json = r#"{
            "id": "bridge-7",
            "name": "Royal Park Bridge",
            "type": "DRAW_BRIDGE",
            "status": "CLOSED",
            "lastUpdated": "2025-04-20T12:00:00.250Z",
            "location": {"latitude": 26.71, "longitude": -80.04},
            "estimatedDelay": 6.5,
            "nextUpdate": null
        }"#;
        let record: CrossingRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.kind, CrossingKind::DrawBridge);
        assert_eq!(record.status, CrossingStatus::Closed);
        assert_eq!(record.estimated_delay_minutes, Some(6.5));
        assert_eq!(record.next_update, None);
        assert_eq!(record.last_updated.timestamp_subsec_millis(), 250);
    }

    #[test]
    fn test_snapshot_to_stale_keeps_records() {
        let snapshot = DirectorySnapshot::fresh(vec![CrossingRecord::placeholder()]);
        let stale = snapshot.to_stale();
        assert!(snapshot.is_fresh());
        assert!(!stale.is_fresh());
        assert_eq!(stale.records, snapshot.records);
        assert_eq!(stale.captured_at, snapshot.captured_at);
        assert_eq!(snapshot.freshness.as_str(), "fresh");
        assert_eq!(stale.freshness.as_str(), "stale");
    }

    #[test]
    fn test_status_as_str() {
        assert_eq!(CrossingStatus::Open.as_str(), "open");
        assert_eq!(CrossingStatus::Warning.as_str(), "warning");
        assert_eq!(CrossingKind::DrawBridge.as_str(), "draw_bridge");
    }
}
