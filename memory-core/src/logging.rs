use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Event for logging a raw conversation event that failed validation
#[derive(Debug, Serialize, Deserialize)]
pub struct EventDroppedEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub session_id: String,
    pub index: usize,
    pub reason: String,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl EventDroppedEvent {
    pub fn new(session_id: &str, index: usize, reason: String) -> Self {
        Self {
            event_type: "EventDropped".to_string(),
            session_id: session_id.to_string(),
            index,
            reason,
            extra: HashMap::new(),
        }
    }

    pub fn with_extra(mut self, key: String, value: Value) -> Self {
        self.extra.insert(key, value);
        self
    }
}

impl std::fmt::Display for EventDroppedEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => write!(f, "{}", json),
            Err(_) => write!(f, "EventDroppedEvent serialization error"),
        }
    }
}

/// Event for logging a redaction rule that failed to evaluate
#[derive(Debug, Serialize, Deserialize)]
pub struct RedactionFaultEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub rule: String,
    pub reason: String,
    pub field: Option<String>,
}

impl RedactionFaultEvent {
    pub fn new(rule: &str, reason: &str) -> Self {
        Self {
            event_type: "RedactionFault".to_string(),
            rule: rule.to_string(),
            reason: reason.to_string(),
            field: None,
        }
    }

    pub fn in_field(mut self, field: &str) -> Self {
        self.field = Some(field.to_string());
        self
    }
}

impl std::fmt::Display for RedactionFaultEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => write!(f, "{}", json),
            Err(_) => write!(f, "RedactionFaultEvent serialization error"),
        }
    }
}

/// Event for logging a trim decision
#[derive(Debug, Serialize, Deserialize)]
pub struct ContextTrimmedEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub total_turns: usize,
    pub turns_kept: usize,
    pub total_tokens: u64,
    pub token_budget: u64,
    pub over_budget: bool,
    pub session_id: Option<String>,
}

impl ContextTrimmedEvent {
    pub fn new(
        total_turns: usize,
        turns_kept: usize,
        total_tokens: u64,
        token_budget: u64,
        over_budget: bool,
    ) -> Self {
        Self {
            event_type: "ContextTrimmed".to_string(),
            total_turns,
            turns_kept,
            total_tokens,
            token_budget,
            over_budget,
            session_id: None,
        }
    }

    pub fn for_session(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }
}

impl std::fmt::Display for ContextTrimmedEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => write!(f, "{}", json),
            Err(_) => write!(f, "ContextTrimmedEvent serialization error"),
        }
    }
}

/// Outcome of a durable checkpoint
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
pub enum CheckpointOutcome {
    Committed,
    Failed,
}

/// Event for logging a durable checkpoint attempt
#[derive(Debug, Serialize, Deserialize)]
pub struct CheckpointEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub session_id: String,
    pub outcome: CheckpointOutcome,
    pub user_messages: usize,
    pub media_summaries: usize,
    pub model_responses: usize,
    pub warnings: usize,
    pub error: Option<String>,
}

impl CheckpointEvent {
    pub fn committed(
        session_id: &str,
        user_messages: usize,
        media_summaries: usize,
        model_responses: usize,
        warnings: usize,
    ) -> Self {
        Self {
            event_type: "Checkpoint".to_string(),
            session_id: session_id.to_string(),
            outcome: CheckpointOutcome::Committed,
            user_messages,
            media_summaries,
            model_responses,
            warnings,
            error: None,
        }
    }

    pub fn failed(session_id: &str, error: String) -> Self {
        Self {
            event_type: "Checkpoint".to_string(),
            session_id: session_id.to_string(),
            outcome: CheckpointOutcome::Failed,
            user_messages: 0,
            media_summaries: 0,
            model_responses: 0,
            warnings: 0,
            error: Some(error),
        }
    }
}

impl std::fmt::Display for CheckpointEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => write!(f, "{}", json),
            Err(_) => write!(f, "CheckpointEvent serialization error"),
        }
    }
}

/// Event for logging a sweep of the ephemeral store
#[derive(Debug, Serialize, Deserialize)]
pub struct SweepEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub removed: usize,
    pub scanned: usize,
    pub batches: usize,
    pub remaining: usize,
}

impl SweepEvent {
    pub fn new(removed: usize, scanned: usize, batches: usize, remaining: usize) -> Self {
        Self {
            event_type: "Sweep".to_string(),
            removed,
            scanned,
            batches,
            remaining,
        }
    }
}

impl std::fmt::Display for SweepEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => write!(f, "{}", json),
            Err(_) => write!(f, "SweepEvent serialization error"),
        }
    }
}

/// Subscriber settings for binaries embedding this crate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json_output: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json_output: false,
        }
    }
}

/// Install a global `tracing` subscriber.
///
/// `RUST_LOG` takes precedence over `config.level`. Returns an error if a
/// global subscriber is already set.
#[cfg(feature = "subscriber")]
pub fn init_tracing(config: &TelemetryConfig) -> crate::error::Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| crate::error::MemoryError::invalid_config("telemetry.level", &config.level, e.to_string()))?;

    let registry = tracing_subscriber::registry().with(filter);
    let result = if config.json_output {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()
    };

    result.map_err(|e| crate::error::MemoryError::other(format!("failed to install tracing subscriber: {}", e)))
}
