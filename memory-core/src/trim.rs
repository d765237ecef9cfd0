//! Token-budget trimming of conversation history.

use serde::{Deserialize, Serialize};

use crate::config::ContextConfig;
use crate::event::{ConversationEvent, EventKind};
use crate::logging::ContextTrimmedEvent;

/// One user turn: everything up to and including the model's response.
///
/// Tool traffic inside a turn belongs to it. The last turn of a history may
/// still be waiting for its response.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Turn<'a> {
    events: &'a [ConversationEvent],
}

impl<'a> Turn<'a> {
    pub fn events(&self) -> &'a [ConversationEvent] {
        self.events
    }

    /// Sum of the producer-supplied token counts
    pub fn tokens(&self) -> u64 {
        self.events.iter().map(|e| u64::from(e.token_count)).sum()
    }

    /// Whether the turn ends with a model response
    pub fn is_complete(&self) -> bool {
        self.events
            .last()
            .map_or(false, |e| e.kind() == EventKind::ModelResponse)
    }
}

/// Split history into turns. A `ModelResponse` closes the current turn.
pub fn group_turns(history: &[ConversationEvent]) -> Vec<Turn<'_>> {
    let mut turns = Vec::new();
    let mut start = 0;
    for (i, event) in history.iter().enumerate() {
        if event.kind() == EventKind::ModelResponse {
            turns.push(Turn {
                events: &history[start..=i],
            });
            start = i + 1;
        }
    }
    if start < history.len() {
        turns.push(Turn {
            events: &history[start..],
        });
    }
    turns
}

/// The bounded history handed to the model for one turn
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionContext {
    pub events: Vec<ConversationEvent>,
    pub total_tokens: u64,
    pub turns_kept: usize,
    pub total_turns: usize,
    /// Set when the most recent turn alone exceeds the budget
    pub over_budget: bool,
}

impl SessionContext {
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ConversationEvent> {
        self.events.iter()
    }
}

/// Select the window of `history` sent with the next model call.
///
/// Keeps the `max_turns` most recent turns, then drops the oldest of them
/// while the window exceeds `token_budget` and more than one turn remains.
/// The most recent turn is never dropped; if it alone is over budget the
/// result is that turn with `over_budget` set. `max_turns == 0` behaves as 1.
pub fn trim(history: &[ConversationEvent], token_budget: u64, max_turns: usize) -> SessionContext {
    let turns = group_turns(history);
    let keep = max_turns.max(1);
    let mut window = &turns[turns.len().saturating_sub(keep)..];
    let mut total: u64 = window.iter().map(Turn::tokens).sum();

    while total > token_budget && window.len() > 1 {
        total -= window[0].tokens();
        window = &window[1..];
    }

    SessionContext {
        events: window.iter().flat_map(|t| t.events().iter().cloned()).collect(),
        total_tokens: total,
        turns_kept: window.len(),
        total_turns: turns.len(),
        over_budget: total > token_budget,
    }
}

/// Configured trimmer.
///
/// # Example
///
/// ```rust
/// use memory_core::{ConversationEvent, Trimmer};
///
/// let mut history = Vec::new();
/// for i in 0..6 {
///     history.push(ConversationEvent::user_text("s1", format!("question {}", i)).with_tokens(50));
///     history.push(ConversationEvent::model_text("s1", format!("answer {}", i)).with_tokens(50));
/// }
///
/// let context = Trimmer::new(450, 5).trim(&history);
/// assert_eq!(context.turns_kept, 4);
/// assert_eq!(context.total_tokens, 400);
/// ```
#[derive(Debug, Clone)]
pub struct Trimmer {
    token_budget: u64,
    max_turns: usize,
}

impl Trimmer {
    /// Create a trimmer
    ///
    /// # Arguments
    /// * `token_budget` - Maximum summed token count of the window
    /// * `max_turns` - Number of most recent turns considered; 0 acts as 1
    pub fn new(token_budget: u64, max_turns: usize) -> Self {
        Self {
            token_budget,
            max_turns: max_turns.max(1),
        }
    }

    pub fn from_config(config: &ContextConfig) -> Self {
        Self::new(config.token_budget, config.max_turns)
    }

    pub fn to_config(&self) -> ContextConfig {
        ContextConfig {
            token_budget: self.token_budget,
            max_turns: self.max_turns,
        }
    }

    pub fn token_budget(&self) -> u64 {
        self.token_budget
    }

    pub fn max_turns(&self) -> usize {
        self.max_turns
    }

    pub fn trim(&self, history: &[ConversationEvent]) -> SessionContext {
        self.trim_logged(history, None)
    }

    /// Trim and tag the emitted log event with a session id
    pub fn trim_for(&self, session_id: &str, history: &[ConversationEvent]) -> SessionContext {
        self.trim_logged(history, Some(session_id))
    }

    fn trim_logged(&self, history: &[ConversationEvent], session_id: Option<&str>) -> SessionContext {
        let context = trim(history, self.token_budget, self.max_turns);
        let mut event = ContextTrimmedEvent::new(
            context.total_turns,
            context.turns_kept,
            context.total_tokens,
            self.token_budget,
            context.over_budget,
        );
        if let Some(session_id) = session_id {
            event = event.for_session(session_id);
        }
        if context.over_budget {
            tracing::warn!(target: crate::EVENT_LOGGER_NAME, "{}", event);
        } else {
            tracing::debug!(target: crate::EVENT_LOGGER_NAME, "{}", event);
        }
        context
    }
}

impl Default for Trimmer {
    fn default() -> Self {
        Self::from_config(&ContextConfig::default())
    }
}
