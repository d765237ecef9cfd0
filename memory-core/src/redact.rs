//! Removal of sensitive substrings before anything reaches durable memory.
//!
//! A [`Redactor`] applies an ordered list of [`RedactionRule`]s. Pattern rules
//! are compiled with the `regex` crate, which matches in linear time, so a
//! hostile payload cannot trigger catastrophic backtracking.
//!
//! Redaction is idempotent: rules that would match the placeholder itself are
//! rejected when they are added, and the rule set is re-applied until the text
//! stops changing. Text that is still changing after [`MAX_PASSES`] passes is
//! replaced by the bare placeholder.

use regex::{NoExpand, Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::sync::{Arc, OnceLock};

use crate::config::RedactionConfig;
use crate::error::{MemoryError, Result};
use crate::logging::RedactionFaultEvent;

/// Replacement text for every redacted match
pub const DEFAULT_PLACEHOLDER: &str = "[REDACTED]";

/// Email-like tokens
pub const EMAIL_PATTERN: &str = r"[\w._%+-]+@[\w.-]+\.[A-Za-z]{2,}";

/// Phone-number-like digit runs: eight or more digits, optionally separated by
/// single spaces, dots or dashes, with an optional leading `+`.
pub const PHONE_PATTERN: &str = r"(?:\+|\b)\d(?:[ .-]?\d){7,}\b";

/// Upper bound on compiled program size for a single pattern.
const PATTERN_SIZE_LIMIT: usize = 1 << 20;

/// How many times the rule set is re-applied before giving up on convergence.
pub const MAX_PASSES: usize = 4;

/// A rule failed to evaluate. The text is left as it was for that rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleFault {
    pub reason: String,
}

impl RuleFault {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for RuleFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

/// One redaction rule.
///
/// Implementations must run in time linear in the input.
pub trait RedactionRule: fmt::Debug + Send + Sync {
    /// Stable name used in warnings
    fn name(&self) -> &str;

    /// Replace every match in `text` with `placeholder`.
    fn apply<'t>(&self, text: &'t str, placeholder: &str) -> std::result::Result<Cow<'t, str>, RuleFault>;

    /// Whether the rule would match inside the placeholder.
    fn matches_placeholder(&self, placeholder: &str) -> bool;
}

/// A regular-expression rule
#[derive(Debug, Clone)]
pub struct PatternRule {
    name: String,
    regex: Regex,
}

impl PatternRule {
    pub fn new(name: impl Into<String>, pattern: &str) -> Result<Self> {
        let name = name.into();
        let regex = RegexBuilder::new(pattern)
            .size_limit(PATTERN_SIZE_LIMIT)
            .dfa_size_limit(PATTERN_SIZE_LIMIT)
            .build()
            .map_err(|e| MemoryError::invalid_config(format!("redaction.patterns.{}", name), pattern, e.to_string()))?;
        Ok(Self { name, regex })
    }

    pub fn email() -> Self {
        Self::builtin("email", EMAIL_PATTERN)
    }

    pub fn phone() -> Self {
        Self::builtin("phone", PHONE_PATTERN)
    }

    fn builtin(name: &str, pattern: &str) -> Self {
        Self {
            name: name.to_string(),
            // Built-in patterns are constants exercised by the test suite.
            regex: Regex::new(pattern).unwrap_or_else(|e| panic!("invalid built-in pattern {}: {}", name, e)),
        }
    }

    pub fn pattern(&self) -> &str {
        self.regex.as_str()
    }
}

impl RedactionRule for PatternRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply<'t>(&self, text: &'t str, placeholder: &str) -> std::result::Result<Cow<'t, str>, RuleFault> {
        Ok(self.regex.replace_all(text, NoExpand(placeholder)))
    }

    fn matches_placeholder(&self, placeholder: &str) -> bool {
        self.regex.is_match(placeholder)
    }
}

/// A secret prefix such as `sk-` or `ghp_`; the prefix and the rest of the
/// token it starts are replaced.
#[derive(Debug, Clone)]
pub struct LiteralRule {
    name: String,
    prefix: String,
}

impl LiteralRule {
    pub fn new(name: impl Into<String>, prefix: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let prefix = prefix.into();
        if prefix.is_empty() {
            return Err(MemoryError::invalid_config(
                format!("redaction.literals.{}", name),
                "",
                "a non-empty prefix",
            ));
        }
        Ok(Self { name, prefix })
    }

    fn is_token_end(c: char) -> bool {
        c.is_whitespace() || matches!(c, '"' | '\'' | ',' | ';')
    }
}

impl RedactionRule for LiteralRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply<'t>(&self, text: &'t str, placeholder: &str) -> std::result::Result<Cow<'t, str>, RuleFault> {
        if !text.contains(self.prefix.as_str()) {
            return Ok(Cow::Borrowed(text));
        }
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(pos) = rest.find(self.prefix.as_str()) {
            out.push_str(&rest[..pos]);
            out.push_str(placeholder);
            // The token end is searched after the prefix so a prefix that
            // starts with a delimiter still consumes input.
            let tail = &rest[pos + self.prefix.len()..];
            let end = tail.find(Self::is_token_end).unwrap_or(tail.len());
            rest = &tail[end..];
        }
        out.push_str(rest);
        Ok(Cow::Owned(out))
    }

    fn matches_placeholder(&self, placeholder: &str) -> bool {
        placeholder.contains(self.prefix.as_str())
    }
}

/// A redaction problem the caller should know about. Never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataQualityWarning {
    pub rule: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub reason: String,
}

/// Redacted text plus any warnings raised while producing it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redacted {
    pub text: String,
    pub warnings: Vec<DataQualityWarning>,
}

/// Ordered, extensible set of redaction rules
#[derive(Debug, Clone)]
pub struct Redactor {
    rules: Vec<Arc<dyn RedactionRule>>,
    placeholder: String,
}

impl Redactor {
    /// An empty redactor that leaves text untouched
    pub fn new(placeholder: impl Into<String>) -> Self {
        Self {
            rules: Vec::new(),
            placeholder: placeholder.into(),
        }
    }

    /// Email and phone rules with the default placeholder
    pub fn with_defaults() -> Self {
        Self {
            rules: vec![Arc::new(PatternRule::email()), Arc::new(PatternRule::phone())],
            placeholder: DEFAULT_PLACEHOLDER.to_string(),
        }
    }

    pub fn from_config(config: &RedactionConfig) -> Result<Self> {
        if config.placeholder.is_empty() {
            return Err(MemoryError::invalid_config("redaction.placeholder", "", "a non-empty placeholder"));
        }
        let mut redactor = Self::new(config.placeholder.clone());
        if config.builtin_rules {
            redactor.add_rule(Arc::new(PatternRule::email()))?;
            redactor.add_rule(Arc::new(PatternRule::phone()))?;
        }
        for pattern in &config.patterns {
            redactor.add_rule(Arc::new(PatternRule::new(pattern.name.clone(), &pattern.pattern)?))?;
        }
        for literal in &config.literals {
            redactor.add_rule(Arc::new(LiteralRule::new(literal.name.clone(), literal.prefix.clone())?))?;
        }
        Ok(redactor)
    }

    /// Append a rule. Rules run in insertion order.
    pub fn add_rule(&mut self, rule: Arc<dyn RedactionRule>) -> Result<()> {
        if rule.matches_placeholder(&self.placeholder) {
            return Err(MemoryError::invalid_config(
                format!("redaction.rules.{}", rule.name()),
                &self.placeholder,
                "a rule that does not match the placeholder",
            ));
        }
        self.rules.push(rule);
        Ok(())
    }

    pub fn with_rule(mut self, rule: Arc<dyn RedactionRule>) -> Result<Self> {
        self.add_rule(rule)?;
        Ok(self)
    }

    pub fn placeholder(&self) -> &str {
        &self.placeholder
    }

    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    /// Redact `text`, collecting a warning for every rule that faulted.
    ///
    /// A faulting rule is treated as matching nothing. If the rule set has not
    /// settled after [`MAX_PASSES`] passes the whole text becomes the
    /// placeholder, which no rule matches.
    pub fn redact(&self, text: &str) -> Redacted {
        self.redact_in(text, None)
    }

    /// Like [`Redactor::redact`], tagging logs and warnings with the record
    /// field the text belongs to.
    pub fn redact_field(&self, text: &str, field: &str) -> Redacted {
        self.redact_in(text, Some(field))
    }

    fn redact_in(&self, text: &str, field: Option<&str>) -> Redacted {
        let mut current = text.to_string();
        let mut warnings: Vec<DataQualityWarning> = Vec::new();
        let mut converged = false;

        for _ in 0..MAX_PASSES {
            let mut changed = false;
            for rule in &self.rules {
                let next = match rule.apply(&current, &self.placeholder) {
                    Ok(Cow::Owned(replaced)) => Some(replaced),
                    Ok(Cow::Borrowed(_)) => None,
                    Err(fault) => {
                        if !warnings.iter().any(|w| w.rule == rule.name()) {
                            let mut notice = RedactionFaultEvent::new(rule.name(), &fault.reason);
                            if let Some(field) = field {
                                notice = notice.in_field(field);
                            }
                            tracing::warn!(target: crate::EVENT_LOGGER_NAME, "{}", notice);
                            warnings.push(DataQualityWarning {
                                rule: rule.name().to_string(),
                                field: field.map(str::to_string),
                                reason: fault.reason,
                            });
                        }
                        None
                    }
                };
                if let Some(replaced) = next {
                    if replaced != current {
                        current = replaced;
                        changed = true;
                    }
                }
            }
            if !changed {
                converged = true;
                break;
            }
        }

        if !converged {
            tracing::warn!(passes = MAX_PASSES, field, "redaction did not reach a fixed point, text withheld");
            warnings.push(DataQualityWarning {
                rule: "*".to_string(),
                field: field.map(str::to_string),
                reason: format!("rule set still changing text after {} passes", MAX_PASSES),
            });
            current = self.placeholder.clone();
        }

        Redacted {
            text: current,
            warnings,
        }
    }

    /// Redact and discard warnings
    pub fn redact_text(&self, text: &str) -> String {
        self.redact(text).text
    }
}

impl Default for Redactor {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Redact with the default email and phone rules.
pub fn redact(text: &str) -> String {
    static DEFAULT: OnceLock<Redactor> = OnceLock::new();
    DEFAULT.get_or_init(Redactor::with_defaults).redact_text(text)
}
