//! Error handling for memory-core

use thiserror::Error;

/// Result type alias for memory operations
pub type Result<T> = std::result::Result<T, MemoryError>;

/// Main error type for the memory-core library
#[derive(Debug, Error)]
pub enum MemoryError {
    /// Input event validation errors
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
    /// Durable storage errors
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),
    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Generic errors with context
    #[error("{message}")]
    Other {
        /// Error message
        message: String,
        /// Optional source error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

/// Raised while turning a raw event into a [`crate::ConversationEvent`].
#[derive(Debug, Error)]
pub enum ValidationError {
    /// Required field missing
    #[error("Required field missing for {kind}: {field}")]
    RequiredFieldMissing { kind: String, field: String },
    /// Invalid field value
    #[error("Invalid value for field '{field}': '{value}' ({reason})")]
    InvalidFieldValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Durable record storage errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// Write did not complete in time; nothing was committed
    #[error("Upsert for session '{session_id}' timed out after {timeout_ms} ms")]
    Timeout { session_id: String, timeout_ms: u64 },
    /// The backend rejected or failed the write
    #[error("Failed to persist record for session '{session_id}': {reason}")]
    WriteFailed { session_id: String, reason: String },
    /// The backend failed to read a record
    #[error("Failed to read record for session '{session_id}': {reason}")]
    ReadFailed { session_id: String, reason: String },
    /// The backend is temporarily unavailable
    #[error("Storage backend unavailable: {reason}")]
    Unavailable { reason: String },
    /// A stored record could not be decoded
    #[error("Stored record for session '{session_id}' is corrupted: {details}")]
    Corrupted { session_id: String, details: String },
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Invalid configuration value
    #[error("Invalid value for '{key}': '{value}' (expected: {expected})")]
    InvalidValue {
        key: String,
        value: String,
        expected: String,
    },
    /// Configuration parsing failed
    #[error("Failed to parse configuration '{source_name}': {reason}")]
    ParsingFailed { source_name: String, reason: String },
}

/// Serialization/deserialization errors
#[derive(Debug, Error)]
pub enum SerializationError {
    /// JSON serialization failed
    #[error("JSON serialization failed: {details}")]
    JsonSerialization { details: String },
    /// JSON deserialization failed
    #[error("JSON deserialization failed: {details}")]
    JsonDeserialization { details: String },
}

impl From<serde_json::Error> for MemoryError {
    fn from(err: serde_json::Error) -> Self {
        let details = err.to_string();
        let inner = if err.is_data() || err.is_syntax() || err.is_eof() {
            SerializationError::JsonDeserialization { details }
        } else {
            SerializationError::JsonSerialization { details }
        };
        MemoryError::Serialization(inner)
    }
}

impl MemoryError {
    /// Create a generic error with a message
    pub fn other<S: Into<String>>(message: S) -> Self {
        MemoryError::Other {
            message: message.into(),
            source: None,
        }
    }

    /// Shorthand for a missing-field validation error
    pub fn missing_field(kind: impl Into<String>, field: impl Into<String>) -> Self {
        MemoryError::Validation(ValidationError::RequiredFieldMissing {
            kind: kind.into(),
            field: field.into(),
        })
    }

    /// Shorthand for an invalid-value configuration error
    pub fn invalid_config(
        key: impl Into<String>,
        value: impl ToString,
        expected: impl Into<String>,
    ) -> Self {
        MemoryError::Config(ConfigError::InvalidValue {
            key: key.into(),
            value: value.to_string(),
            expected: expected.into(),
        })
    }

    /// Whether the caller may retry the failed operation.
    ///
    /// Only durable storage failures are retryable. Validation and
    /// configuration errors will fail the same way again.
    pub fn is_retryable(&self) -> bool {
        match self {
            MemoryError::Store(StoreError::Corrupted { .. }) => false,
            MemoryError::Store(_) => true,
            MemoryError::Io(_) => true,
            MemoryError::Validation(_)
            | MemoryError::Config(_)
            | MemoryError::Serialization(_)
            | MemoryError::Other { .. } => false,
        }
    }
}
