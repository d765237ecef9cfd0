//! Persistability rules for conversation events.

use crate::event::{ConversationEvent, EventBody, ResponseChannel, UserMessage};

/// Which path an event takes once it has been classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Eligible for long-term memory
    Persist,
    /// Tool traffic; kept only in the ephemeral store
    Ephemeral,
    /// Neither persisted nor cached (media without a summary)
    Discard,
}

/// Whether an event may contribute to a durable memory record.
///
/// Text user messages and text model responses are persistable. Voice and
/// image uploads are persistable only once they carry a non-empty summary.
/// Tool requests and results never are.
pub fn classify(event: &ConversationEvent) -> bool {
    match &event.body {
        EventBody::UserMessage { message } => match message {
            UserMessage::Text { .. } => true,
            UserMessage::Media { summary, .. } => !summary.trim().is_empty(),
        },
        EventBody::ModelResponse { channel, .. } => match channel {
            ResponseChannel::Text => true,
        },
        EventBody::ToolRequest { .. } | EventBody::ToolResult { .. } => false,
    }
}

/// Route an event to the durable path, the volatile path, or nowhere.
pub fn route(event: &ConversationEvent) -> Route {
    if classify(event) {
        Route::Persist
    } else if event.is_tool_event() {
        Route::Ephemeral
    } else {
        Route::Discard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{MediaMeta, MediaModality};
    use serde_json::json;

    #[test]
    fn test_text_events_are_persistable() {
        assert!(classify(&ConversationEvent::user_text("s1", "hello")));
        assert!(classify(&ConversationEvent::model_text("s1", "hi, how can I help?")));
    }

    #[test]
    fn test_media_requires_summary() {
        for modality in [MediaModality::Voice, MediaModality::Image] {
            let empty = ConversationEvent::user_media("s1", modality, "", MediaMeta::default());
            assert!(!classify(&empty));
            assert_eq!(route(&empty), Route::Discard);

            let blank = ConversationEvent::user_media("s1", modality, "   ", MediaMeta::default());
            assert!(!classify(&blank));

            let summarized = ConversationEvent::user_media(
                "s1",
                modality,
                "asked about milk prices",
                MediaMeta::default(),
            );
            assert!(classify(&summarized));
            assert_eq!(route(&summarized), Route::Persist);
        }
    }

    #[test]
    fn test_tool_events_are_never_persistable() {
        let request = ConversationEvent::tool_request("s1", "search", json!({"q": "sữa"}));
        let result = ConversationEvent::tool_result("s1", "search", json!({"items": []}));
        assert!(!classify(&request));
        assert!(!classify(&result));
        assert_eq!(route(&request), Route::Ephemeral);
        assert_eq!(route(&result), Route::Ephemeral);
    }
}
