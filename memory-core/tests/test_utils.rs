//! Test utilities and helpers for memory-core tests

#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use memory_core::*;
use serde_json::{json, Value};
use std::sync::Arc;

/// Fixed reference instant so assertions on timestamps are stable
pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap()
}

/// `base_time()` plus `seconds`
pub fn at(seconds: i64) -> DateTime<Utc> {
    base_time() + chrono::Duration::seconds(seconds)
}

/// Create a session id with a unique suffix
pub fn unique_session_id(base_name: &str) -> String {
    let unique_id = uuid::Uuid::new_v4().to_string();
    format!("{}_{}", base_name, &unique_id[..8])
}

/// One user message and its model response, ids `u{i}` / `m{i}`
pub fn conversation_turn(session_id: &str, i: usize, user_tokens: u32, model_tokens: u32) -> Vec<ConversationEvent> {
    vec![
        ConversationEvent::user_text(session_id, format!("question {}", i))
            .with_id(format!("u{}", i))
            .with_tokens(user_tokens)
            .at(at(i as i64 * 10)),
        ConversationEvent::model_text(session_id, format!("answer {}", i))
            .with_id(format!("m{}", i))
            .with_tokens(model_tokens)
            .at(at(i as i64 * 10 + 5)),
    ]
}

/// `turns` turns of `tokens_per_turn` tokens each, split evenly
pub fn uniform_history(session_id: &str, turns: usize, tokens_per_turn: u32) -> Vec<ConversationEvent> {
    let half = tokens_per_turn / 2;
    (0..turns)
        .flat_map(|i| conversation_turn(session_id, i, half, tokens_per_turn - half))
        .collect()
}

/// A raw event in the interchange shape
pub fn raw_user_text(text: &str, seconds: i64) -> Value {
    json!({
        "kind": "UserMessage",
        "modality": "text",
        "text": text,
        "timestamp": at(seconds).to_rfc3339(),
    })
}

pub fn raw_voice(summary: Option<&str>, seconds: i64) -> Value {
    let mut event = json!({
        "kind": "UserMessage",
        "modality": "voice",
        "timestamp": at(seconds).to_rfc3339(),
        "meta": {"language": "vi", "mime": "audio/ogg", "durationMs": 4100, "sha256": "9f2c"},
    });
    if let Some(summary) = summary {
        event["summary"] = json!(summary);
    }
    event
}

pub fn raw_model_text(text: &str, seconds: i64) -> Value {
    json!({
        "kind": "ModelResponse",
        "channel": "text",
        "text": text,
        "timestamp": at(seconds).to_rfc3339(),
    })
}

pub fn raw_tool_result(tool: &str, output: Value, seconds: i64) -> Value {
    json!({
        "kind": "ToolResult",
        "tool": tool,
        "output": output,
        "timestamp": at(seconds).to_rfc3339(),
    })
}

/// Ephemeral store driven by a manual clock starting at `base_time()`
pub fn manual_store(config: &EphemeralConfig) -> (Arc<EphemeralStore>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(base_time()));
    let store = Arc::new(EphemeralStore::with_clock(config, clock.clone()));
    (store, clock)
}
