//! Configuration for memory-core.
//!
//! Every section has serde defaults, so an empty TOML document (or no file at
//! all) yields a working configuration. With the `config-support` feature,
//! [`MemoryConfig::load`] layers a TOML file and `MEMORY__` environment
//! variables, e.g. `MEMORY__CONTEXT__TOKEN_BUDGET=4000`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{MemoryError, Result};
use crate::logging::TelemetryConfig;

/// Default token budget for a model call's history window
pub const DEFAULT_TOKEN_BUDGET: u64 = 3000;
/// Default number of most recent turns considered
pub const DEFAULT_MAX_TURNS: usize = 5;
/// Default TTL for ephemeral entries, in seconds
pub const DEFAULT_TTL_SECS: u64 = 900;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub context: ContextConfig,
    pub ephemeral: EphemeralConfig,
    pub redaction: RedactionConfig,
    pub storage: StorageConfig,
    pub telemetry: TelemetryConfig,
}

/// Context trimming settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Maximum summed token count of the retained window
    pub token_budget: u64,
    /// Maximum number of most recent turns retained (K)
    pub max_turns: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            token_budget: DEFAULT_TOKEN_BUDGET,
            max_turns: DEFAULT_MAX_TURNS,
        }
    }
}

/// Ephemeral store settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EphemeralConfig {
    /// Maximum number of entries before nearest-expiry eviction
    pub capacity: usize,
    /// TTL used by `put` when the namespace has no entry below
    pub default_ttl_secs: u64,
    /// Per-namespace TTLs, keyed by full namespace or by its last segment
    pub namespace_ttls: BTreeMap<String, u64>,
    pub sweep_interval_ms: u64,
    pub sweep_batch_size: usize,
}

impl EphemeralConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl Default for EphemeralConfig {
    fn default() -> Self {
        let mut namespace_ttls = BTreeMap::new();
        namespace_ttls.insert("tool".to_string(), DEFAULT_TTL_SECS);
        Self {
            capacity: 10_000,
            default_ttl_secs: DEFAULT_TTL_SECS,
            namespace_ttls,
            sweep_interval_ms: 30_000,
            sweep_batch_size: 256,
        }
    }
}

/// A caller-supplied regex redaction rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternConfig {
    pub name: String,
    pub pattern: String,
}

/// A caller-supplied secret prefix, e.g. `sk-`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiteralConfig {
    pub name: String,
    pub prefix: String,
}

/// Redaction rule set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedactionConfig {
    pub placeholder: String,
    /// Include the built-in email and phone rules
    pub builtin_rules: bool,
    pub patterns: Vec<PatternConfig>,
    pub literals: Vec<LiteralConfig>,
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            placeholder: crate::redact::DEFAULT_PLACEHOLDER.to_string(),
            builtin_rules: true,
            patterns: Vec::new(),
            literals: Vec::new(),
        }
    }
}

/// Durable storage settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Default timeout for a single upsert
    pub upsert_timeout_ms: u64,
    /// Root directory for the file-system store; in-memory when unset
    pub root_dir: Option<PathBuf>,
}

impl StorageConfig {
    pub fn upsert_timeout(&self) -> Duration {
        Duration::from_millis(self.upsert_timeout_ms)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            upsert_timeout_ms: 5_000,
            root_dir: None,
        }
    }
}

impl MemoryConfig {
    /// Reject values that would make a component misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.context.token_budget == 0 {
            return Err(MemoryError::invalid_config("context.token_budget", 0, "> 0"));
        }
        if self.context.max_turns == 0 {
            return Err(MemoryError::invalid_config("context.max_turns", 0, "> 0"));
        }
        if self.ephemeral.capacity == 0 {
            return Err(MemoryError::invalid_config("ephemeral.capacity", 0, "> 0"));
        }
        if self.ephemeral.sweep_interval_ms == 0 {
            return Err(MemoryError::invalid_config("ephemeral.sweep_interval_ms", 0, "> 0"));
        }
        if self.ephemeral.sweep_batch_size == 0 {
            return Err(MemoryError::invalid_config("ephemeral.sweep_batch_size", 0, "> 0"));
        }
        if self.storage.upsert_timeout_ms == 0 {
            return Err(MemoryError::invalid_config("storage.upsert_timeout_ms", 0, "> 0"));
        }
        // Compiles every pattern and checks none of them matches the placeholder.
        crate::redact::Redactor::from_config(&self.redaction)?;
        Ok(())
    }

    /// Parse and validate a TOML document
    #[cfg(feature = "config-support")]
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: MemoryConfig = toml::from_str(source).map_err(|e| {
            MemoryError::Config(crate::error::ConfigError::ParsingFailed {
                source_name: "<inline>".to_string(),
                reason: e.to_string(),
            })
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load from an optional TOML file overlaid with `MEMORY__*` environment
    /// variables, then validate.
    #[cfg(feature = "config-support")]
    pub fn load(path: Option<&std::path::Path>) -> Result<Self> {
        let source_name = path
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "environment".to_string());
        let parsing_failed = |reason: String| {
            MemoryError::Config(crate::error::ConfigError::ParsingFailed {
                source_name: source_name.clone(),
                reason,
            })
        };

        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(true));
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix("MEMORY")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: MemoryConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| parsing_failed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = MemoryConfig::default();
        config.validate().unwrap();
        assert_eq!(config.context.token_budget, 3000);
        assert_eq!(config.context.max_turns, 5);
        assert_eq!(config.ephemeral.default_ttl(), Duration::from_secs(900));
        assert_eq!(config.redaction.placeholder, "[REDACTED]");
        assert_eq!(config.storage.upsert_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_validate_rejects_zeroes() {
        let mut config = MemoryConfig::default();
        config.context.max_turns = 0;
        assert!(config.validate().is_err());

        let mut config = MemoryConfig::default();
        config.ephemeral.capacity = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("ephemeral.capacity"));
    }

    #[test]
    fn test_validate_rejects_bad_patterns() {
        let mut config = MemoryConfig::default();
        config.redaction.patterns.push(PatternConfig {
            name: "broken".to_string(),
            pattern: "(unclosed".to_string(),
        });
        assert!(config.validate().is_err());
    }

    #[cfg(feature = "config-support")]
    #[test]
    fn test_from_toml_str_partial() {
        let config = MemoryConfig::from_toml_str(
            r#"
            [context]
            token_budget = 450

            [ephemeral.namespace_ttls]
            tool = 60
            cart = 3600

            [[redaction.literals]]
            name = "openai"
            prefix = "sk-"
            "#,
        )
        .unwrap();
        assert_eq!(config.context.token_budget, 450);
        assert_eq!(config.context.max_turns, DEFAULT_MAX_TURNS);
        assert_eq!(config.ephemeral.namespace_ttls.get("cart"), Some(&3600));
        assert_eq!(config.redaction.literals.len(), 1);
        assert!(config.redaction.builtin_rules);
    }

    #[cfg(feature = "config-support")]
    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.toml");
        std::fs::write(&path, "[context]\nmax_turns = 3\n").unwrap();

        let config = MemoryConfig::load(Some(path.as_path())).unwrap();
        assert_eq!(config.context.max_turns, 3);
    }

    #[cfg(feature = "config-support")]
    #[test]
    fn test_invalid_toml_is_parsing_error() {
        let err = MemoryConfig::from_toml_str("[context\ntoken_budget = ").unwrap_err();
        assert!(matches!(
            err,
            MemoryError::Config(crate::error::ConfigError::ParsingFailed { .. })
        ));
    }
}
