//! Conversation events produced by the turn handler.
//!
//! Events arrive either already typed or as loosely shaped JSON objects. The
//! JSON boundary is where malformed input is detected; once an event is a
//! [`ConversationEvent`] every branch over it is an exhaustive match.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{MemoryError, Result, ValidationError};
use crate::logging::EventDroppedEvent;

/// Average characters per token used by [`estimate_tokens`].
pub const CHARS_PER_TOKEN: usize = 4;

/// Rough producer-side token estimate for a text payload.
///
/// The trimmer never calls this; it only sums `token_count` values that the
/// producer attached to each event.
pub fn estimate_tokens(text: &str) -> u32 {
    let chars = text.chars().count();
    if chars == 0 {
        return 0;
    }
    u32::try_from((chars / CHARS_PER_TOKEN).max(1)).unwrap_or(u32::MAX)
}

/// Discriminant of an event, without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    UserMessage,
    ModelResponse,
    ToolRequest,
    ToolResult,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::UserMessage => "UserMessage",
            EventKind::ModelResponse => "ModelResponse",
            EventKind::ToolRequest => "ToolRequest",
            EventKind::ToolResult => "ToolResult",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "UserMessage" => Some(EventKind::UserMessage),
            "ModelResponse" => Some(EventKind::ModelResponse),
            "ToolRequest" => Some(EventKind::ToolRequest),
            "ToolResult" => Some(EventKind::ToolResult),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Non-text user input modalities. Their raw content is summarized upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaModality {
    Voice,
    Image,
}

impl MediaModality {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaModality::Voice => "voice",
            MediaModality::Image => "image",
        }
    }
}

/// Output channel of a model response. Only text responses exist today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseChannel {
    Text,
}

/// Descriptive metadata the media summarizer attaches to voice/image input.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaMeta {
    pub language: Option<String>,
    pub mime: Option<String>,
    pub duration_ms: Option<u64>,
    pub sha256: Option<String>,
}

impl MediaMeta {
    fn from_object(object: &Map<String, Value>) -> Self {
        Self {
            language: string_field(object, "language"),
            mime: string_field(object, "mime"),
            duration_ms: object.get("durationMs").and_then(Value::as_u64),
            sha256: string_field(object, "sha256"),
        }
    }
}

/// A user message, either typed text or a summarized media upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserMessage {
    Text {
        text: String,
    },
    Media {
        modality: MediaModality,
        summary: String,
        meta: MediaMeta,
    },
}

/// Payload of a conversation event, one variant per event kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum EventBody {
    UserMessage {
        message: UserMessage,
    },
    ModelResponse {
        channel: ResponseChannel,
        text: String,
    },
    ToolRequest {
        tool: String,
        arguments: Value,
    },
    ToolResult {
        tool: String,
        output: Value,
    },
}

/// A single event in a conversation. Never mutated after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationEvent {
    pub id: String,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub token_count: u32,
    pub body: EventBody,
}

impl ConversationEvent {
    fn new(session_id: impl Into<String>, body: EventBody, payload_len_hint: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            timestamp: Utc::now(),
            metadata: BTreeMap::new(),
            token_count: estimate_tokens(payload_len_hint),
            body,
        }
    }

    /// A typed user message
    pub fn user_text(session_id: impl Into<String>, text: impl Into<String>) -> Self {
        let text = text.into();
        let hint = text.clone();
        Self::new(
            session_id,
            EventBody::UserMessage {
                message: UserMessage::Text { text },
            },
            &hint,
        )
    }

    /// A voice or image upload already summarized by the media collaborator
    pub fn user_media(
        session_id: impl Into<String>,
        modality: MediaModality,
        summary: impl Into<String>,
        meta: MediaMeta,
    ) -> Self {
        let summary = summary.into();
        let hint = summary.clone();
        Self::new(
            session_id,
            EventBody::UserMessage {
                message: UserMessage::Media {
                    modality,
                    summary,
                    meta,
                },
            },
            &hint,
        )
    }

    /// A text response from the model
    pub fn model_text(session_id: impl Into<String>, text: impl Into<String>) -> Self {
        let text = text.into();
        let hint = text.clone();
        Self::new(
            session_id,
            EventBody::ModelResponse {
                channel: ResponseChannel::Text,
                text,
            },
            &hint,
        )
    }

    pub fn tool_request(session_id: impl Into<String>, tool: impl Into<String>, arguments: Value) -> Self {
        let hint = arguments.to_string();
        Self::new(
            session_id,
            EventBody::ToolRequest {
                tool: tool.into(),
                arguments,
            },
            &hint,
        )
    }

    pub fn tool_result(session_id: impl Into<String>, tool: impl Into<String>, output: Value) -> Self {
        let hint = output.to_string();
        Self::new(
            session_id,
            EventBody::ToolResult {
                tool: tool.into(),
                output,
            },
            &hint,
        )
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_tokens(mut self, token_count: u32) -> Self {
        self.token_count = token_count;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn kind(&self) -> EventKind {
        match &self.body {
            EventBody::UserMessage { .. } => EventKind::UserMessage,
            EventBody::ModelResponse { .. } => EventKind::ModelResponse,
            EventBody::ToolRequest { .. } => EventKind::ToolRequest,
            EventBody::ToolResult { .. } => EventKind::ToolResult,
        }
    }

    pub fn is_tool_event(&self) -> bool {
        match self.kind() {
            EventKind::ToolRequest | EventKind::ToolResult => true,
            EventKind::UserMessage | EventKind::ModelResponse => false,
        }
    }

    /// Parse a loosely shaped JSON event.
    ///
    /// `session_id` is used when the object carries no `sessionId` of its
    /// own. A missing `tokenCount` is filled in with [`estimate_tokens`].
    pub fn from_value(session_id: &str, value: &Value) -> Result<Self> {
        let object = value.as_object().ok_or_else(|| {
            MemoryError::Validation(ValidationError::InvalidFieldValue {
                field: "event".to_string(),
                value: value_preview(value),
                reason: "expected a JSON object".to_string(),
            })
        })?;

        let kind_str = object
            .get("kind")
            .and_then(Value::as_str)
            .ok_or_else(|| MemoryError::missing_field("event", "kind"))?;
        let kind = EventKind::parse(kind_str).ok_or_else(|| invalid("kind", kind_str, "unknown event kind"))?;

        let body = match kind {
            EventKind::UserMessage => parse_user_message(object)?,
            EventKind::ModelResponse => {
                let channel = match object.get("channel").and_then(Value::as_str) {
                    None | Some("text") => ResponseChannel::Text,
                    Some(other) => return Err(invalid("channel", other, "only 'text' responses are supported")),
                };
                let text = required_str(object, kind, "text")?;
                EventBody::ModelResponse { channel, text }
            }
            EventKind::ToolRequest => EventBody::ToolRequest {
                tool: required_str(object, kind, "tool")?,
                arguments: object.get("args").cloned().unwrap_or(Value::Null),
            },
            EventKind::ToolResult => EventBody::ToolResult {
                tool: required_str(object, kind, "tool")?,
                output: object.get("output").cloned().unwrap_or(Value::Null),
            },
        };

        let timestamp = parse_timestamp(object.get("timestamp"), kind)?;

        let metadata = object
            .get("metadata")
            .and_then(Value::as_object)
            .map(|map| {
                map.iter()
                    .map(|(k, v)| {
                        let v = match v {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        (k.clone(), v)
                    })
                    .collect()
            })
            .unwrap_or_default();

        let token_count = match object.get("tokenCount") {
            Some(raw) => {
                let count = raw.as_u64().ok_or_else(|| invalid("tokenCount", &raw.to_string(), "expected a non-negative integer"))?;
                u32::try_from(count).unwrap_or(u32::MAX)
            }
            None => estimate_tokens(&payload_text(&body)),
        };

        Ok(Self {
            id: object
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            session_id: object
                .get("sessionId")
                .and_then(Value::as_str)
                .unwrap_or(session_id)
                .to_string(),
            timestamp,
            metadata,
            token_count,
            body,
        })
    }
}

/// Result of parsing a batch of raw events
#[derive(Debug, Clone, Default)]
pub struct ParsedEvents {
    pub events: Vec<ConversationEvent>,
    pub dropped: usize,
}

/// Parse raw events, dropping malformed ones with a diagnostic.
///
/// A malformed event never aborts the batch.
pub fn parse_events<'a, I>(session_id: &str, values: I) -> ParsedEvents
where
    I: IntoIterator<Item = &'a Value>,
{
    let mut parsed = ParsedEvents::default();
    for (index, value) in values.into_iter().enumerate() {
        match ConversationEvent::from_value(session_id, value) {
            Ok(event) => parsed.events.push(event),
            Err(err) => {
                parsed.dropped += 1;
                let notice = EventDroppedEvent::new(session_id, index, err.to_string());
                tracing::warn!(target: crate::EVENT_LOGGER_NAME, "{}", notice);
            }
        }
    }
    parsed
}

fn parse_user_message(object: &Map<String, Value>) -> Result<EventBody> {
    let kind = EventKind::UserMessage;
    let modality = object
        .get("modality")
        .and_then(Value::as_str)
        .ok_or_else(|| MemoryError::missing_field(kind.as_str(), "modality"))?;

    let message = match modality {
        "text" => UserMessage::Text {
            text: required_str(object, kind, "text")?,
        },
        "voice" | "image" => {
            let modality = if modality == "voice" {
                MediaModality::Voice
            } else {
                MediaModality::Image
            };
            // A missing summary is not malformed; it makes the event non-persistable.
            let summary = string_field(object, "summary").unwrap_or_default();
            let meta = object
                .get("meta")
                .or_else(|| object.get("metadata"))
                .and_then(Value::as_object)
                .map(MediaMeta::from_object)
                .unwrap_or_default();
            UserMessage::Media {
                modality,
                summary,
                meta,
            }
        }
        other => return Err(invalid("modality", other, "expected text, voice or image")),
    };

    Ok(EventBody::UserMessage { message })
}

fn parse_timestamp(raw: Option<&Value>, kind: EventKind) -> Result<DateTime<Utc>> {
    match raw {
        None | Some(Value::Null) => Err(MemoryError::missing_field(kind.as_str(), "timestamp")),
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| invalid("timestamp", s, &e.to_string())),
        Some(Value::Number(n)) => {
            let secs = n
                .as_f64()
                .ok_or_else(|| invalid("timestamp", &n.to_string(), "expected epoch seconds"))?;
            let millis = (secs * 1000.0).round() as i64;
            Utc.timestamp_millis_opt(millis)
                .single()
                .ok_or_else(|| invalid("timestamp", &n.to_string(), "out of range"))
        }
        Some(other) => Err(invalid("timestamp", &other.to_string(), "expected RFC 3339 string or epoch seconds")),
    }
}

fn payload_text(body: &EventBody) -> String {
    match body {
        EventBody::UserMessage { message } => match message {
            UserMessage::Text { text } => text.clone(),
            UserMessage::Media { summary, .. } => summary.clone(),
        },
        EventBody::ModelResponse { text, .. } => text.clone(),
        EventBody::ToolRequest { arguments, .. } => arguments.to_string(),
        EventBody::ToolResult { output, .. } => output.to_string(),
    }
}

fn required_str(object: &Map<String, Value>, kind: EventKind, field: &str) -> Result<String> {
    object
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| MemoryError::missing_field(kind.as_str(), field))
}

fn string_field(object: &Map<String, Value>, field: &str) -> Option<String> {
    object.get(field).and_then(Value::as_str).map(str::to_string)
}

fn invalid(field: &str, value: &str, reason: &str) -> MemoryError {
    MemoryError::Validation(ValidationError::InvalidFieldValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    })
}

fn value_preview(value: &Value) -> String {
    let mut s = value.to_string();
    if s.len() > 64 {
        let mut cut = 64;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
        s.push('…');
    }
    s
}
