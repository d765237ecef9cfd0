//! # Memory Core
//!
//! Conversation memory for a chat assistant: decides which events may be
//! stored long-term, scrubs sensitive text before storage, keeps tool-call
//! state in a TTL-scoped ephemeral store, and trims history to a token budget
//! before each model call.
//!
//! ## Features
//!
//! - **Closed event model**: every event kind is a variant, matched exhaustively
//! - **Redaction**: ordered, idempotent rules compiled to linear-time matchers
//! - **Ephemeral state**: sharded TTL store with lazy expiry and a batched sweeper
//! - **Durable records**: whole-record upserts with timeouts, in-memory or on disk
//! - **Context trimming**: K most recent turns within a token budget
//!
//! ## Quick Start
//!
//! ```rust
//! use memory_core::{classify, redact, trim, ConversationEvent};
//!
//! let question = ConversationEvent::user_text("s1", "contact me at a@b.com").with_tokens(6);
//! assert!(classify(&question));
//! assert_eq!(redact("contact me at a@b.com"), "contact me at [REDACTED]");
//!
//! let answer = ConversationEvent::model_text("s1", "sure").with_tokens(1);
//! let context = trim(&[question, answer], 3000, 5);
//! assert_eq!(context.turns_kept, 1);
//! ```

#![allow(missing_docs)]
#![warn(clippy::all)]

// Error types (must be first for other modules to use)
pub mod error;

// Event model and the pure per-event functions
pub mod event;
pub mod classify;
pub mod redact;

// Volatile and durable state
pub mod ephemeral;
pub mod record;
pub mod store;
pub mod assembler;

// Context window selection
pub mod trim;

// Per-session orchestration
pub mod session;

// Ambient
pub mod config;
pub mod logging;

pub use error::{ConfigError, MemoryError, Result, SerializationError, StoreError, ValidationError};
pub use event::{
    estimate_tokens, parse_events, ConversationEvent, EventBody, EventKind, MediaMeta, MediaModality,
    ParsedEvents, ResponseChannel, UserMessage,
};
pub use classify::{classify, route, Route};
pub use redact::{
    redact, DataQualityWarning, LiteralRule, PatternRule, Redacted, RedactionRule, Redactor, RuleFault,
    DEFAULT_PLACEHOLDER,
};
pub use ephemeral::{
    session_namespace, spawn_sweeper, Clock, EphemeralEntry, EphemeralStats, EphemeralStore, ManualClock,
    SweepReport, SystemClock,
};
pub use record::{MediaSummary, MemoryRecord, RecordMeta};
pub use store::{upsert_with_timeout, FileSystemMemoryStore, InMemoryMemoryStore, MemoryStore};
pub use assembler::{assemble, assemble_with, Assembler, Assembly, SessionAttributes};
pub use trim::{group_turns, trim, SessionContext, Trimmer, Turn};
pub use session::{MemoryManager, Session};
pub use config::{ContextConfig, EphemeralConfig, MemoryConfig, RedactionConfig, StorageConfig};
pub use logging::TelemetryConfig;
#[cfg(feature = "subscriber")]
pub use logging::init_tracing;

/// Current version of memory-core
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Root logger name for the memory-core library
pub const ROOT_LOGGER_NAME: &str = "memory_core";

/// Event logger name for structured memory events
pub const EVENT_LOGGER_NAME: &str = "memory_core.events";
