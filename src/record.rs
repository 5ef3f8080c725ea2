//! Wire records exchanged between the event stream, aggregators, mergers and the final sink.
//!
//! Field names follow the JSON already produced and consumed around these services:
//!
//! ```text
//! event:   { "ts": 1609459200, "uid": "u1" }
//! partial: { "Date": "Jan  1 00:00 2021", "EncodedHLL": "<base64>",
//!            "Partition": 3, "Bucket": 26824320 }
//! final:   { "Date": "Jan  1 00:00 2021", "Count": 2, "Degraded": false,
//!            "Reports": 4, "Expected": 4 }
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bucket::Granularity;

/// Record that could not be decoded into the expected shape.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("malformed record: {0}")]
    Json(#[from] serde_json::Error),
    #[error("event has an empty identifier")]
    EmptyIdentifier,
    #[error("event timestamp {0} is outside the supported calendar range")]
    TimestampOutOfRange(i64),
}

/// One observation of an identifier at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Unix seconds.
    #[serde(rename = "ts")]
    pub timestamp: i64,
    #[serde(rename = "uid")]
    pub identifier: String,
}

impl Event {
    pub fn new(timestamp: i64, identifier: impl Into<String>) -> Self {
        Self {
            timestamp,
            identifier: identifier.into(),
        }
    }

    /// Decode and validate an event payload.
    pub fn from_slice(payload: &[u8]) -> Result<Self, RecordError> {
        let event: Event = serde_json::from_slice(payload)?;
        if event.identifier.is_empty() {
            return Err(RecordError::EmptyIdentifier);
        }
        // Any granularity accepts every timestamp chrono can place on the calendar.
        if Granularity::Second.bucket_key(event.timestamp).is_none() {
            return Err(RecordError::TimestampOutOfRange(event.timestamp));
        }
        Ok(event)
    }
}

/// Serialized sketch of one bucket as seen by one aggregator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialSummary {
    #[serde(rename = "Date")]
    pub date: String,
    #[serde(rename = "EncodedHLL", with = "base64_bytes")]
    pub encoded_hll: Vec<u8>,
    /// Stream partition the contributing aggregator consumed.
    #[serde(rename = "Partition", default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<u32>,
    /// Bucket ordinal, used to order flushes chronologically.
    #[serde(rename = "Bucket", default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<i64>,
}

impl PartialSummary {
    pub fn from_slice(payload: &[u8]) -> Result<Self, RecordError> {
        Ok(serde_json::from_slice(payload)?)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, RecordError> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Distinct count of one bucket.
///
/// `degraded` is set when the count was emitted before every expected contribution arrived,
/// so it may under-count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalSummary {
    #[serde(rename = "Date")]
    pub date: String,
    #[serde(rename = "Count")]
    pub count: u64,
    #[serde(rename = "Degraded", default)]
    pub degraded: bool,
    #[serde(rename = "Reports", default, skip_serializing_if = "Option::is_none")]
    pub reports: Option<u32>,
    #[serde(rename = "Expected", default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<u32>,
}

impl FinalSummary {
    /// Summary produced by a single aggregator that owns the whole stream.
    pub fn standalone(date: impl Into<String>, count: u64) -> Self {
        Self {
            date: date.into(),
            count,
            degraded: false,
            reports: None,
            expected: None,
        }
    }

    pub fn from_slice(payload: &[u8]) -> Result<Self, RecordError> {
        Ok(serde_json::from_slice(payload)?)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, RecordError> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Byte fields travel as standard base64 strings inside JSON.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded.as_bytes()).map_err(Error::custom)
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_event_from_slice() {
        let event = Event::from_slice(br#"{"ts":1609459200,"uid":"u1"}"#).unwrap();
        assert_eq!(event, Event::new(1_609_459_200, "u1"));
    }

    #[test]
    fn test_event_ignores_extra_fields() {
        let event = Event::from_slice(br#"{"ts":5,"uid":"u1","country":"PT"}"#).unwrap();
        assert_eq!(event.timestamp, 5);
    }

    #[test_case(br#"{"uid":"u1"}"#.as_slice(); "missing timestamp")]
    #[test_case(br#"{"ts":1}"#.as_slice(); "missing identifier")]
    #[test_case(br#"{"ts":"soon","uid":"u1"}"#.as_slice(); "string timestamp")]
    #[test_case(br#"{"ts":1.5,"uid":"u1"}"#.as_slice(); "fractional timestamp")]
    #[test_case(br#"{"ts":1,"uid":""}"#.as_slice(); "empty identifier")]
    #[test_case(br#"{"ts":9223372036854775807,"uid":"u1"}"#.as_slice(); "timestamp out of range")]
    #[test_case(b"not json".as_slice(); "not json")]
    fn test_event_rejects_malformed(payload: &[u8]) {
        assert!(Event::from_slice(payload).is_err());
    }

    #[test]
    fn test_partial_summary_wire_format() {
        let summary = PartialSummary {
            date: "Jan  1 2021".to_string(),
            encoded_hll: b"[0,null]".to_vec(),
            partition: Some(3),
            bucket: Some(18_628),
        };
        let json = String::from_utf8(summary.to_vec().unwrap()).unwrap();
        assert_eq!(
            json,
            r#"{"Date":"Jan  1 2021","EncodedHLL":"WzAsbnVsbF0=","Partition":3,"Bucket":18628}"#
        );
        assert_eq!(PartialSummary::from_slice(json.as_bytes()).unwrap(), summary);
    }

    #[test]
    fn test_partial_summary_without_partition() {
        let summary =
            PartialSummary::from_slice(br#"{"Date":"2021","EncodedHLL":"WzAsbnVsbF0="}"#).unwrap();
        assert_eq!(summary.partition, None);
        assert_eq!(summary.bucket, None);
        assert_eq!(summary.encoded_hll, b"[0,null]");
    }

    #[test]
    fn test_partial_summary_rejects_invalid_base64() {
        assert!(PartialSummary::from_slice(br#"{"Date":"2021","EncodedHLL":"%%%"}"#).is_err());
    }

    #[test_case(FinalSummary::standalone("Jan 2021", 7) => r#"{"Date":"Jan 2021","Count":7,"Degraded":false}"#; "standalone")]
    #[test_case(FinalSummary { date: "2021".into(), count: 3, degraded: true, reports: Some(1), expected: Some(2) }
        => r#"{"Date":"2021","Count":3,"Degraded":true,"Reports":1,"Expected":2}"#; "degraded")]
    fn test_final_summary_wire_format(summary: FinalSummary) -> String {
        String::from_utf8(summary.to_vec().unwrap()).unwrap()
    }

    #[test]
    fn test_final_summary_accepts_legacy_records() {
        let summary = FinalSummary::from_slice(br#"{"Date":"2021","Count":12}"#).unwrap();
        assert_eq!(summary, FinalSummary::standalone("2021", 12));
    }
}
