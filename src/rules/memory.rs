//! Per-execution working memory.

use std::collections::BTreeMap;

use crate::error::{ExecutionError, WaypointResult};
use crate::rules::narration::{Emission, Emissions, NARRATION_RULE_RETRACTED};
use crate::value::{Record, Value};

/// Attribute names that cannot be written while attribute protection is on.
pub const RESERVED_ATTRIBUTES: [&str; 3] = ["KE", "Retract", "RetractedRules"];

/// Identifies a rule inside the retraction ledger: `(ruleset, rule_key)`.
pub type RetractionKey = (String, String);

/// Read-only access to working memory.
///
/// Preconditions only ever see memory through this trait, so they cannot
/// write attributes or retract rules.
pub trait MemoryView {
    /// Returns the attribute value, if set.
    fn attribute(&self, name: &str) -> Option<&Value>;

    /// Returns true if `(ruleset, rule_key)` has been retracted in this execution.
    fn is_retracted(&self, ruleset: &str, rule_key: &str) -> bool;

    /// The retraction ledger.
    fn retracted_rules(&self) -> &BTreeMap<RetractionKey, Option<String>>;
}

/// Scratch space for one `KnowledgeEngine::execute` call.
#[derive(Debug, Clone, Default)]
pub struct WorkingMemory {
    ruleset: String,
    protect: bool,
    attributes: Record,
    retracted: BTreeMap<RetractionKey, Option<String>>,
}

impl WorkingMemory {
    /// Creates an empty memory for `ruleset`.
    ///
    /// With `protect` set, reserved names are rejected and every attribute is
    /// write-once.
    #[must_use]
    pub fn new(ruleset: impl Into<String>, protect: bool) -> Self {
        Self {
            ruleset: ruleset.into(),
            protect,
            attributes: Record::new(),
            retracted: BTreeMap::new(),
        }
    }

    /// The ruleset this memory belongs to.
    #[must_use]
    pub fn ruleset(&self) -> &str {
        &self.ruleset
    }

    /// Sets an attribute. Last write wins unless protection is enabled.
    ///
    /// # Errors
    /// With protection enabled, returns [`ExecutionError::ReservedAttribute`]
    /// for reserved names and [`ExecutionError::AttributeLocked`] on a second write.
    /// Values holding NaN or infinity fail with [`ExecutionError::NonFiniteValue`].
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> WaypointResult<()> {
        let value = value.into();
        if !value.is_finite() {
            return Err(ExecutionError::NonFiniteValue {
                field: name.to_string(),
            }
            .into());
        }
        if self.protect {
            if RESERVED_ATTRIBUTES.contains(&name) {
                return Err(ExecutionError::ReservedAttribute {
                    name: name.to_string(),
                }
                .into());
            }
            if self.attributes.contains_key(name) {
                return Err(ExecutionError::AttributeLocked {
                    name: name.to_string(),
                }
                .into());
            }
        }
        self.attributes.insert(name.to_string(), value);
        Ok(())
    }

    /// Returns the attribute value, if set.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    /// All attributes set so far.
    #[must_use]
    pub const fn attributes(&self) -> &Record {
        &self.attributes
    }

    /// Retracts rules of this ruleset for the rest of the execution.
    ///
    /// Returns one code-200 emission per key, to be yielded by the calling rule.
    pub fn retract<S: AsRef<str>>(&mut self, rule_keys: &[S], message: Option<&str>) -> Emissions {
        rule_keys
            .iter()
            .map(|key| {
                let key = key.as_ref();
                self.retracted.insert(
                    (self.ruleset.clone(), key.to_string()),
                    message.map(ToString::to_string),
                );
                Emission::from_code(
                    format!(
                        "Rule [{}:{key}] retracted. Message: {}",
                        self.ruleset,
                        message.unwrap_or("")
                    ),
                    NARRATION_RULE_RETRACTED,
                )
            })
            .collect()
    }
}

impl MemoryView for WorkingMemory {
    fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    fn is_retracted(&self, ruleset: &str, rule_key: &str) -> bool {
        self.retracted
            .contains_key(&(ruleset.to_string(), rule_key.to_string()))
    }

    fn retracted_rules(&self) -> &BTreeMap<RetractionKey, Option<String>> {
        &self.retracted
    }
}
