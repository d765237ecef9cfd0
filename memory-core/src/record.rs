//! Long-term memory record, one per session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::event::{MediaMeta, MediaModality};

/// Summary of a voice or image upload as it is stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaSummary {
    pub summary: String,
    pub modality: MediaModality,
    pub meta: MediaMeta,
}

/// Session-level metadata of a record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordMeta {
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub locale: Option<String>,
    pub intent: Option<String>,
}

/// Durable, redacted view of a session.
///
/// A record is always written whole; stores never merge fields of two
/// records. Its serialized form is canonical: field order is fixed and no
/// unordered maps are involved, so assembling the same events twice yields
/// byte-identical JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRecord {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub user_messages: Vec<String>,
    pub user_media_summaries: Vec<MediaSummary>,
    pub model_responses: Vec<String>,
    pub meta: RecordMeta,
}

impl MemoryRecord {
    /// Create an empty record for a session
    ///
    /// # Arguments
    /// * `session_id` - The session the record belongs to
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            user_messages: Vec::new(),
            user_media_summaries: Vec::new(),
            model_responses: Vec::new(),
            meta: RecordMeta::default(),
        }
    }

    /// True when no content survived filtering
    pub fn is_empty(&self) -> bool {
        self.user_messages.is_empty() && self.user_media_summaries.is_empty() && self.model_responses.is_empty()
    }

    /// Canonical JSON form used for storage and comparisons
    pub fn to_canonical_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::Value;

    #[test]
    fn test_interchange_field_names() {
        let mut record = MemoryRecord::new("s1");
        record.user_messages.push("hello".to_string());
        record.user_media_summaries.push(MediaSummary {
            summary: "photo of a milk carton".to_string(),
            modality: MediaModality::Image,
            meta: MediaMeta {
                mime: Some("image/png".to_string()),
                ..MediaMeta::default()
            },
        });
        record.meta.started_at = Some(Utc.with_ymd_and_hms(2025, 1, 1, 8, 0, 0).unwrap());
        record.meta.locale = Some("vi-VN".to_string());

        let value: Value = serde_json::from_str(&record.to_canonical_json().unwrap()).unwrap();
        assert_eq!(value["sessionId"], "s1");
        assert_eq!(value["user_messages"][0], "hello");
        assert_eq!(value["user_media_summaries"][0]["modality"], "image");
        assert_eq!(value["user_media_summaries"][0]["meta"]["mime"], "image/png");
        assert!(value["user_media_summaries"][0]["meta"]["durationMs"].is_null());
        assert_eq!(value["meta"]["startedAt"], "2025-01-01T08:00:00Z");
        assert!(value["meta"]["endedAt"].is_null());
        assert!(value["model_responses"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_json_roundtrip() {
        let mut record = MemoryRecord::new("s1");
        record.model_responses.push("xin chào".to_string());
        let json = record.to_canonical_json().unwrap();
        assert_eq!(MemoryRecord::from_json(&json).unwrap(), record);
        assert!(!record.is_empty());
        assert!(MemoryRecord::new("s2").is_empty());
    }
}
