//! Per-session orchestration.
//!
//! A [`Session`] is the explicit context object for one conversation. It
//! routes each event to the durable or the volatile path, keeps the durable
//! history used for trimming, and runs checkpoints. Nothing here is global:
//! all shared state lives in the [`MemoryManager`] the session was opened
//! from.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::assembler::{Assembler, Assembly, SessionAttributes};
use crate::classify::{route, Route};
use crate::config::MemoryConfig;
use crate::ephemeral::{session_namespace, spawn_sweeper, EphemeralStore};
use crate::error::Result;
use crate::event::{parse_events, ConversationEvent, EventBody, EventKind};
use crate::redact::{DataQualityWarning, Redactor};
use crate::store::{FileSystemMemoryStore, InMemoryMemoryStore, MemoryStore};
use crate::logging::EventDroppedEvent;
use crate::trim::{SessionContext, Trimmer};

/// Scope of the ephemeral namespace holding a session's tool traffic
pub const TOOL_SCOPE: &str = "tool";

/// Shared services for all sessions of a process
#[derive(Clone)]
pub struct MemoryManager {
    ephemeral: Arc<EphemeralStore>,
    assembler: Arc<Assembler>,
    trimmer: Trimmer,
    sweep_interval: Duration,
}

impl MemoryManager {
    pub fn new(
        ephemeral: Arc<EphemeralStore>,
        assembler: Arc<Assembler>,
        trimmer: Trimmer,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            ephemeral,
            assembler,
            trimmer,
            sweep_interval,
        }
    }

    /// Build every component from configuration over the given store
    pub fn from_config(config: &MemoryConfig, store: Arc<dyn MemoryStore>) -> Result<Self> {
        config.validate()?;
        let redactor = Redactor::from_config(&config.redaction)?;
        Ok(Self::new(
            Arc::new(EphemeralStore::new(&config.ephemeral)),
            Arc::new(Assembler::new(store, redactor, config.storage.upsert_timeout())),
            Trimmer::from_config(&config.context),
            config.ephemeral.sweep_interval(),
        ))
    }

    /// Like [`MemoryManager::from_config`], choosing the store from
    /// `storage.root_dir`: file system when set, in-memory otherwise.
    pub fn open(config: &MemoryConfig) -> Result<Self> {
        let store: Arc<dyn MemoryStore> = match &config.storage.root_dir {
            Some(dir) => Arc::new(FileSystemMemoryStore::new(dir)),
            None => Arc::new(InMemoryMemoryStore::new()),
        };
        Self::from_config(config, store)
    }

    pub fn ephemeral(&self) -> &Arc<EphemeralStore> {
        &self.ephemeral
    }

    pub fn assembler(&self) -> &Arc<Assembler> {
        &self.assembler
    }

    pub fn trimmer(&self) -> &Trimmer {
        &self.trimmer
    }

    /// Start the background sweeper at the configured cadence
    pub fn spawn_sweeper(&self, cancellation: CancellationToken) -> JoinHandle<()> {
        spawn_sweeper(self.ephemeral.clone(), self.sweep_interval, cancellation)
    }

    pub fn open_session(&self, session_id: impl Into<String>) -> Session {
        Session::new(session_id.into(), self.clone())
    }
}

/// One conversation's memory state
///
/// # Example
///
/// ```rust
/// use memory_core::{ConversationEvent, MemoryConfig, MemoryManager};
///
/// let manager = MemoryManager::open(&MemoryConfig::default()).unwrap();
/// let mut session = manager.open_session("s1");
/// session.record(ConversationEvent::user_text("s1", "hi, reach me at a@b.com"));
/// session.record(ConversationEvent::model_text("s1", "hello!"));
///
/// tokio_test::block_on(session.checkpoint()).unwrap();
/// let record = tokio_test::block_on(manager.assembler().load("s1")).unwrap().unwrap();
/// assert_eq!(record.user_messages, vec!["hi, reach me at [REDACTED]".to_string()]);
/// ```
pub struct Session {
    id: String,
    manager: MemoryManager,
    attrs: SessionAttributes,
    /// Persistable events of completed turns
    history: Vec<ConversationEvent>,
    /// Every routed event of the turn in progress, tool traffic included
    current_turn: Vec<ConversationEvent>,
    dropped: usize,
}

impl Session {
    fn new(id: String, manager: MemoryManager) -> Self {
        Self {
            id,
            manager,
            attrs: SessionAttributes::default(),
            history: Vec::new(),
            current_turn: Vec::new(),
            dropped: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn attributes(&self) -> &SessionAttributes {
        &self.attrs
    }

    pub fn set_locale(&mut self, locale: impl Into<String>) {
        self.attrs.locale = Some(locale.into());
    }

    pub fn set_intent(&mut self, intent: impl Into<String>) {
        self.attrs.intent = Some(intent.into());
    }

    /// Durable history of completed turns
    pub fn history(&self) -> &[ConversationEvent] {
        &self.history
    }

    pub fn current_turn(&self) -> &[ConversationEvent] {
        &self.current_turn
    }

    /// Events rejected so far, as malformed or as belonging to another
    /// session
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Route one event.
    ///
    /// Tool events are written to the ephemeral store and stay visible to the
    /// model until the turn closes; they never enter durable history. A
    /// `ModelResponse` closes the turn. An event carrying another session's
    /// id is dropped and reported as [`Route::Discard`].
    pub fn record(&mut self, event: ConversationEvent) -> Route {
        if event.session_id != self.id {
            let index = self.history.len() + self.current_turn.len();
            let notice = EventDroppedEvent::new(&self.id, index, format!("event {} belongs to another session", event.id))
                .with_extra("event_session_id".to_string(), Value::String(event.session_id));
            tracing::warn!(target: crate::EVENT_LOGGER_NAME, "{}", notice);
            self.dropped += 1;
            return Route::Discard;
        }

        let route = route(&event);
        match route {
            Route::Persist => {}
            Route::Ephemeral => self.cache_tool_event(&event),
            Route::Discard => {
                tracing::debug!(session_id = %self.id, event_id = %event.id, "media event without summary discarded");
                return route;
            }
        }

        let closes_turn = event.kind() == EventKind::ModelResponse;
        self.current_turn.push(event);
        if closes_turn {
            self.end_turn();
        }
        route
    }

    /// Parse raw JSON events and route the valid ones.
    ///
    /// # Returns
    /// The number of events dropped from this batch
    pub fn ingest<'a, I>(&mut self, raw: I) -> usize
    where
        I: IntoIterator<Item = &'a Value>,
    {
        let before = self.dropped;
        let parsed = parse_events(&self.id, raw);
        self.dropped += parsed.dropped;
        for event in parsed.events {
            self.record(event);
        }
        self.dropped - before
    }

    /// Close the current turn, keeping only its persistable events
    pub fn end_turn(&mut self) {
        let turn = std::mem::take(&mut self.current_turn);
        self.history
            .extend(turn.into_iter().filter(|e| route(e) == Route::Persist));
    }

    /// Trimmed context for the next model call: durable history followed by
    /// the turn in progress.
    pub fn context(&self) -> SessionContext {
        let window: Vec<ConversationEvent> = self
            .history
            .iter()
            .chain(self.current_turn.iter())
            .cloned()
            .collect();
        self.manager.trimmer.trim_for(&self.id, &window)
    }

    /// Latest cached output of a tool in this session, if not expired
    pub fn tool_output(&self, tool: &str) -> Option<Value> {
        self.manager.ephemeral.get(&self.tool_namespace(), tool)
    }

    /// Latest cached arguments of a tool call in this session
    pub fn tool_arguments(&self, tool: &str) -> Option<Value> {
        self.manager
            .ephemeral
            .get(&self.tool_namespace(), &request_key(tool))
    }

    /// Assemble the record this session would store right now
    pub fn assemble(&self) -> Assembly {
        self.manager
            .assembler
            .assemble(&self.id, &self.persistable_events(), &self.attrs)
    }

    /// Write the session's record, replacing any earlier checkpoint
    pub async fn checkpoint(&self) -> Result<Vec<DataQualityWarning>> {
        self.manager
            .assembler
            .checkpoint(&self.id, &self.persistable_events(), &self.attrs)
            .await
    }

    /// Final checkpoint, then drop the session's volatile state.
    ///
    /// Volatile state is kept when the checkpoint fails so the caller can
    /// retry.
    pub async fn close(&mut self) -> Result<Vec<DataQualityWarning>> {
        self.end_turn();
        let warnings = self.checkpoint().await?;
        let cleared = self.manager.ephemeral.clear_namespace(&self.tool_namespace());
        tracing::debug!(session_id = %self.id, cleared, "session closed");
        Ok(warnings)
    }

    fn persistable_events(&self) -> Vec<ConversationEvent> {
        self.history
            .iter()
            .chain(self.current_turn.iter().filter(|e| route(e) == Route::Persist))
            .cloned()
            .collect()
    }

    fn tool_namespace(&self) -> String {
        session_namespace(&self.id, TOOL_SCOPE)
    }

    fn cache_tool_event(&self, event: &ConversationEvent) {
        let namespace = self.tool_namespace();
        match &event.body {
            EventBody::ToolRequest { tool, arguments } => {
                self.manager.ephemeral.put(&namespace, &request_key(tool), arguments.clone());
            }
            EventBody::ToolResult { tool, output } => {
                self.manager.ephemeral.put(&namespace, tool, output.clone());
            }
            EventBody::UserMessage { .. } | EventBody::ModelResponse { .. } => {}
        }
    }
}

fn request_key(tool: &str) -> String {
    format!("{}.request", tool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{MediaMeta, MediaModality};
    use serde_json::json;

    fn manager() -> MemoryManager {
        MemoryManager::open(&MemoryConfig::default()).unwrap()
    }

    #[test]
    fn test_routing_keeps_tool_data_out_of_history() {
        let manager = manager();
        let mut session = manager.open_session("s1");

        assert_eq!(session.record(ConversationEvent::user_text("s1", "find milk")), Route::Persist);
        assert_eq!(
            session.record(ConversationEvent::tool_request("s1", "search", json!({"q": "milk"}))),
            Route::Ephemeral
        );
        assert_eq!(
            session.record(ConversationEvent::tool_result("s1", "search", json!({"items": ["M1"]}))),
            Route::Ephemeral
        );
        assert_eq!(session.current_turn().len(), 3);
        assert_eq!(session.tool_output("search"), Some(json!({"items": ["M1"]})));
        assert_eq!(session.tool_arguments("search"), Some(json!({"q": "milk"})));

        session.record(ConversationEvent::model_text("s1", "found one"));
        assert!(session.current_turn().is_empty());
        assert_eq!(session.history().len(), 2);
        assert!(session.history().iter().all(|e| !e.is_tool_event()));
    }

    #[test]
    fn test_discarded_media_is_not_kept() {
        let manager = manager();
        let mut session = manager.open_session("s1");
        let route = session.record(ConversationEvent::user_media(
            "s1",
            MediaModality::Image,
            "",
            MediaMeta::default(),
        ));
        assert_eq!(route, Route::Discard);
        assert!(session.current_turn().is_empty());
    }

    #[test]
    fn test_ingest_counts_dropped() {
        let manager = manager();
        let mut session = manager.open_session("s1");
        let raw = vec![
            json!({"kind": "UserMessage", "modality": "text", "text": "hi", "timestamp": "2025-01-01T00:00:00Z"}),
            json!({"kind": "ModelResponse", "timestamp": "2025-01-01T00:00:01Z"}),
        ];
        assert_eq!(session.ingest(&raw), 1);
        assert_eq!(session.dropped(), 1);
        assert_eq!(session.current_turn().len(), 1);
    }

    #[test]
    fn test_foreign_session_events_are_dropped() {
        let manager = manager();
        let mut session = manager.open_session("s1");

        let route = session.record(ConversationEvent::user_text("s2", "not mine"));
        assert_eq!(route, Route::Discard);
        assert!(session.current_turn().is_empty());
        assert_eq!(session.dropped(), 1);

        let raw = vec![
            json!({"kind": "UserMessage", "modality": "text", "text": "mine", "timestamp": "2025-01-01T00:00:00Z"}),
            json!({"kind": "ToolResult", "sessionId": "s2", "tool": "cart", "output": [1], "timestamp": "2025-01-01T00:00:01Z"}),
        ];
        assert_eq!(session.ingest(&raw), 1);
        assert_eq!(session.dropped(), 2);
        assert_eq!(session.current_turn().len(), 1);
        assert_eq!(session.tool_output("cart"), None);
    }

    #[test]
    fn test_context_includes_turn_in_progress() {
        let manager = MemoryManager::open(&MemoryConfig {
            context: crate::config::ContextConfig {
                token_budget: 100,
                max_turns: 5,
            },
            ..MemoryConfig::default()
        })
        .unwrap();
        let mut session = manager.open_session("s1");
        for i in 0..3 {
            session.record(ConversationEvent::user_text("s1", format!("q{}", i)).with_tokens(20));
            session.record(ConversationEvent::model_text("s1", format!("a{}", i)).with_tokens(20));
        }
        session.record(ConversationEvent::user_text("s1", "pending").with_id("pending").with_tokens(30));

        let context = session.context();
        assert_eq!(context.turns_kept, 2);
        assert_eq!(context.events.last().map(|e| e.id.as_str()), Some("pending"));
        assert!(context.total_tokens <= 100);
    }

    #[tokio::test]
    async fn test_close_checkpoints_and_clears_volatile_state() {
        let manager = manager();
        let mut session = manager.open_session("s1");
        session.set_locale("vi-VN");
        session.record(ConversationEvent::user_text("s1", "email me: a@b.com"));
        session.record(ConversationEvent::tool_result("s1", "search", json!([1, 2, 3])));

        session.close().await.unwrap();

        assert_eq!(session.tool_output("search"), None);
        let record = manager.assembler().load("s1").await.unwrap().unwrap();
        assert_eq!(record.user_messages, vec!["email me: [REDACTED]".to_string()]);
        assert_eq!(record.meta.locale.as_deref(), Some("vi-VN"));
        assert_eq!(session.assemble().record, record);
    }
}
