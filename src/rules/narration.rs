//! Rule identity and the diagnostics rules emit.

use serde::{Deserialize, Serialize};

/// Narration code for a successful rule message.
pub const NARRATION_RULE_SUCCESS: i32 = 0;

/// Narration code emitted when a rule precondition evaluates falsy.
pub const NARRATION_RULE_FAIL_PRECOND: i32 = 100;

/// Narration code emitted for each rule retracted by another rule.
pub const NARRATION_RULE_RETRACTED: i32 = 200;

/// Declaration metadata of one rule. Immutable once the knowledge base is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleMeta {
    /// Rule key, unique within the knowledge base.
    pub key: String,
    /// Human-readable statement of the rule.
    pub statement: String,
    /// Rule revision, packed into narration revisions.
    pub revision: u32,
    /// Lower runs first.
    pub priority: i32,
    /// Parent rule or ruleset, if any.
    pub parent: Option<String>,
    /// Fact fields the rule reads. Informational only.
    pub facts: Vec<String>,
}

/// One diagnostic or result emitted while executing a knowledge base.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleNarration {
    /// One of the `NARRATION_*` codes or a rule-defined code.
    pub code: i32,
    /// Key of the rule that emitted it.
    pub rule: String,
    /// Knowledge base name.
    pub ruleset: String,
    /// `(kb_revision << 16) | rule_revision`.
    pub revision: u64,
    /// Free-form message.
    pub message: Option<String>,
}

impl RuleNarration {
    /// Builds an unstamped narration. The engine fills `rule`, `ruleset` and
    /// `revision` when the narration leaves a rule body.
    #[must_use]
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            rule: String::new(),
            ruleset: String::new(),
            revision: 0,
            message: Some(message.into()),
        }
    }

    /// Returns true for precondition-failure narrations.
    #[must_use]
    pub const fn is_precondition_failure(&self) -> bool {
        self.code == NARRATION_RULE_FAIL_PRECOND
    }

    /// Returns true for retraction narrations.
    #[must_use]
    pub const fn is_retraction(&self) -> bool {
        self.code == NARRATION_RULE_RETRACTED
    }
}

impl std::fmt::Display for RuleNarration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}:{}#{}] {}", self.ruleset, self.rule, self.code, self.message.as_deref().unwrap_or(""))
    }
}

/// A value yielded by a rule body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Emission {
    /// Plain message, narrated with code 0.
    Message(String),
    /// Message with an explicit code.
    Coded {
        /// Narration message.
        message: String,
        /// Narration code.
        code: i32,
    },
    /// Fully built narration; identity fields are overwritten by the engine.
    Narration(RuleNarration),
}

impl Emission {
    /// Plain message, narrated with code 0.
    #[must_use]
    pub fn from_message(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }

    /// Message with an explicit code.
    #[must_use]
    pub fn from_code(message: impl Into<String>, code: i32) -> Self {
        Self::Coded {
            message: message.into(),
            code,
        }
    }

    /// Wraps a prebuilt narration.
    #[must_use]
    pub const fn from_narration(narration: RuleNarration) -> Self {
        Self::Narration(narration)
    }

    /// Converts into a narration stamped with the emitting rule's identity.
    #[must_use]
    pub fn stamp(self, rule: &str, ruleset: &str, revision: u64) -> RuleNarration {
        let (code, message) = match self {
            Self::Message(message) => (NARRATION_RULE_SUCCESS, Some(message)),
            Self::Coded { message, code } => (code, Some(message)),
            Self::Narration(n) => (n.code, n.message),
        };
        RuleNarration {
            code,
            rule: rule.to_string(),
            ruleset: ruleset.to_string(),
            revision,
            message,
        }
    }
}

impl From<&str> for Emission {
    fn from(message: &str) -> Self {
        Self::Message(message.to_string())
    }
}

impl From<String> for Emission {
    fn from(message: String) -> Self {
        Self::Message(message)
    }
}

impl From<(String, i32)> for Emission {
    fn from((message, code): (String, i32)) -> Self {
        Self::Coded { message, code }
    }
}

impl From<RuleNarration> for Emission {
    fn from(narration: RuleNarration) -> Self {
        Self::Narration(narration)
    }
}

/// Ordered emissions returned by a rule body.
pub type Emissions = Vec<Emission>;
