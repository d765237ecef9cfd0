//! Durable memory assembly.
//!
//! The assembler's only input is a slice of [`ConversationEvent`]s. It has no
//! handle on the ephemeral store, so tool state cannot leak into a record.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::classify::classify;
use crate::error::Result;
use crate::event::{ConversationEvent, EventBody, UserMessage};
use crate::logging::{CheckpointEvent, EventDroppedEvent};
use crate::record::{MediaSummary, MemoryRecord, RecordMeta};
use crate::redact::{DataQualityWarning, Redactor};
use crate::store::{upsert_with_timeout, MemoryStore};

/// Event metadata key carrying the user's locale
pub const LOCALE_KEY: &str = "locale";
/// Event metadata key carrying the conversation intent summary
pub const INTENT_KEY: &str = "intent";

/// Session facts known outside the event stream.
///
/// When set, these take precedence over locale/intent found in event
/// metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionAttributes {
    pub locale: Option<String>,
    pub intent: Option<String>,
}

impl SessionAttributes {
    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = Some(locale.into());
        self
    }

    pub fn with_intent(mut self, intent: impl Into<String>) -> Self {
        self.intent = Some(intent.into());
        self
    }
}

/// An assembled record plus the data-quality warnings raised on the way
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assembly {
    pub record: MemoryRecord,
    pub warnings: Vec<DataQualityWarning>,
}

/// Build a record from one session's events.
///
/// Pure: the same events, attributes and rules always produce the same
/// record. Non-persistable events are skipped, text is redacted, and empty
/// texts are left out. Events belonging to another session are dropped with
/// a warning.
pub fn assemble_with(
    redactor: &Redactor,
    session_id: &str,
    events: &[ConversationEvent],
    attrs: &SessionAttributes,
) -> Assembly {
    let mut record = MemoryRecord::new(session_id);
    let mut warnings = Vec::new();
    let mut started_at: Option<DateTime<Utc>> = None;
    let mut ended_at: Option<DateTime<Utc>> = None;
    let mut locale: Option<&str> = None;
    let mut intent: Option<&str> = None;

    let scrub = |text: &str, field: &str, warnings: &mut Vec<DataQualityWarning>| {
        let redacted = redactor.redact_field(text, field);
        warnings.extend(redacted.warnings);
        redacted.text
    };

    for (index, event) in events.iter().enumerate() {
        if event.session_id != session_id {
            let reason = format!("event {} belongs to another session", event.id);
            let notice = EventDroppedEvent::new(session_id, index, reason.clone())
                .with_extra("event_session_id".to_string(), event.session_id.clone().into());
            tracing::warn!(target: crate::EVENT_LOGGER_NAME, "{}", notice);
            warnings.push(DataQualityWarning {
                rule: "session_id".to_string(),
                field: None,
                reason,
            });
            continue;
        }
        if !classify(event) {
            continue;
        }
        match &event.body {
            EventBody::UserMessage { message } => match message {
                UserMessage::Text { text } => {
                    if text.trim().is_empty() {
                        continue;
                    }
                    let text = scrub(text, "user_messages", &mut warnings);
                    record.user_messages.push(text);
                }
                UserMessage::Media { modality, summary, meta } => {
                    let summary = scrub(summary, "user_media_summaries", &mut warnings);
                    record.user_media_summaries.push(MediaSummary {
                        summary,
                        modality: *modality,
                        meta: meta.clone(),
                    });
                }
            },
            EventBody::ModelResponse { text, .. } => {
                if text.trim().is_empty() {
                    continue;
                }
                let text = scrub(text, "model_responses", &mut warnings);
                record.model_responses.push(text);
            }
            EventBody::ToolRequest { .. } | EventBody::ToolResult { .. } => continue,
        }

        started_at = Some(started_at.map_or(event.timestamp, |t| t.min(event.timestamp)));
        ended_at = Some(ended_at.map_or(event.timestamp, |t| t.max(event.timestamp)));
        if let Some(value) = event.metadata.get(LOCALE_KEY) {
            locale = Some(value.as_str());
        }
        if let Some(value) = event.metadata.get(INTENT_KEY) {
            intent = Some(value.as_str());
        }
    }

    let intent = attrs.intent.as_deref().or(intent);
    record.meta = RecordMeta {
        started_at,
        ended_at,
        locale: attrs.locale.clone().or_else(|| locale.map(str::to_string)),
        intent: intent.map(|i| scrub(i, "meta.intent", &mut warnings)),
    };

    Assembly { record, warnings }
}

/// Assemble with the default redaction rules and no session attributes
pub fn assemble(session_id: &str, events: &[ConversationEvent]) -> Assembly {
    assemble_with(&Redactor::default(), session_id, events, &SessionAttributes::default())
}

/// Builds records and writes them through a [`MemoryStore`].
///
/// The assembler performs no retries; a failed upsert is returned to the
/// caller, who can consult [`crate::MemoryError::is_retryable`].
pub struct Assembler {
    store: Arc<dyn MemoryStore>,
    redactor: Redactor,
    upsert_timeout: Duration,
}

impl Assembler {
    /// Create an assembler
    ///
    /// # Arguments
    /// * `store` - The durable backend
    /// * `redactor` - Rules applied to every stored text
    /// * `upsert_timeout` - Deadline for each checkpoint write
    pub fn new(store: Arc<dyn MemoryStore>, redactor: Redactor, upsert_timeout: Duration) -> Self {
        Self {
            store,
            redactor,
            upsert_timeout,
        }
    }

    pub fn store(&self) -> &Arc<dyn MemoryStore> {
        &self.store
    }

    pub fn redactor(&self) -> &Redactor {
        &self.redactor
    }

    pub fn upsert_timeout(&self) -> Duration {
        self.upsert_timeout
    }

    pub fn assemble(&self, session_id: &str, events: &[ConversationEvent], attrs: &SessionAttributes) -> Assembly {
        assemble_with(&self.redactor, session_id, events, attrs)
    }

    /// Write a full record, replacing any prior record for the session
    pub async fn upsert(&self, record: &MemoryRecord) -> Result<()> {
        self.upsert_within(record, self.upsert_timeout).await
    }

    /// Like [`Assembler::upsert`] with an explicit deadline
    pub async fn upsert_within(&self, record: &MemoryRecord, timeout: Duration) -> Result<()> {
        upsert_with_timeout(self.store.as_ref(), record, timeout).await
    }

    /// Assemble and store in one step.
    ///
    /// # Returns
    /// The data-quality warnings raised while assembling
    pub async fn checkpoint(
        &self,
        session_id: &str,
        events: &[ConversationEvent],
        attrs: &SessionAttributes,
    ) -> Result<Vec<DataQualityWarning>> {
        let Assembly { record, warnings } = self.assemble(session_id, events, attrs);
        match self.upsert(&record).await {
            Ok(()) => {
                let event = CheckpointEvent::committed(
                    session_id,
                    record.user_messages.len(),
                    record.user_media_summaries.len(),
                    record.model_responses.len(),
                    warnings.len(),
                );
                tracing::info!(target: crate::EVENT_LOGGER_NAME, "{}", event);
                Ok(warnings)
            }
            Err(err) => {
                let event = CheckpointEvent::failed(session_id, err.to_string());
                tracing::warn!(target: crate::EVENT_LOGGER_NAME, retryable = err.is_retryable(), "{}", event);
                Err(err)
            }
        }
    }

    /// Raw stored record for a session, for retrieval collaborators
    pub async fn load(&self, session_id: &str) -> Result<Option<MemoryRecord>> {
        self.store.get(session_id).await
    }

    pub async fn sessions(&self) -> Result<Vec<String>> {
        self.store.list_sessions().await
    }
}
