//! Knowledge bases: a validated context plus a priority-ordered rule table.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{ValidationError, WaypointResult};
use crate::rules::expr::Precondition;
use crate::rules::memory::WorkingMemory;
use crate::rules::narration::{Emissions, RuleMeta};
use crate::value::{Record, ValueKind};

/// What a rule body sees besides working memory.
#[derive(Debug, Clone, Copy)]
pub struct RuleInput<'a> {
    /// The fact being evaluated.
    pub fact: &'a Record,
    /// The knowledge base context.
    pub context: &'a Record,
}

/// A rule body. Emissions are narrated in order.
pub type RuleBody = dyn Fn(RuleInput<'_>, &mut WorkingMemory) -> WaypointResult<Emissions> + Send + Sync;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct FieldSpec {
    name: String,
    kind: ValueKind,
    required: bool,
}

/// Field-level schema for contexts and facts.
///
/// Fields not declared in the schema are accepted as-is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    fields: Vec<FieldSpec>,
}

impl Schema {
    /// Creates an empty schema.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a field that must be present.
    #[must_use]
    pub fn required(mut self, name: impl Into<String>, kind: ValueKind) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            kind,
            required: true,
        });
        self
    }

    /// Declares a field that may be absent or null.
    #[must_use]
    pub fn optional(mut self, name: impl Into<String>, kind: ValueKind) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            kind,
            required: false,
        });
        self
    }

    /// Checks `record` against the declared fields.
    ///
    /// # Errors
    /// Returns the first missing required field or type mismatch.
    pub fn validate(&self, record: &Record) -> Result<(), ValidationError> {
        for field in &self.fields {
            match record.get(&field.name) {
                None if field.required => {
                    return Err(ValidationError::MissingField {
                        field: field.name.clone(),
                    })
                }
                None => {}
                Some(value) if value.is_null() && !field.required => {}
                Some(value) if !field.kind.accepts(value) => {
                    return Err(ValidationError::FieldType {
                        field: field.name.clone(),
                        expected: field.kind.name(),
                        actual: value.type_name(),
                    })
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

/// Declaration of one rule, before registration.
#[derive(Debug, Clone)]
pub struct RuleSpec {
    meta: RuleMeta,
    preconditions: Vec<(Option<String>, String)>,
}

impl RuleSpec {
    /// Starts a rule declaration with priority 0 and revision 0.
    #[must_use]
    pub fn new(key: impl Into<String>, statement: impl Into<String>) -> Self {
        Self {
            meta: RuleMeta {
                key: key.into(),
                statement: statement.into(),
                revision: 0,
                priority: 0,
                parent: None,
                facts: Vec::new(),
            },
            preconditions: Vec::new(),
        }
    }

    /// Lower values fire earlier.
    #[must_use]
    pub const fn priority(mut self, priority: i32) -> Self {
        self.meta.priority = priority;
        self
    }

    /// Sets the rule revision.
    #[must_use]
    pub const fn revision(mut self, revision: u32) -> Self {
        self.meta.revision = revision;
        self
    }

    /// Sets the parent rule or ruleset.
    #[must_use]
    pub fn parent(mut self, parent: impl Into<String>) -> Self {
        self.meta.parent = Some(parent.into());
        self
    }

    /// Lists the fact fields the rule reads.
    #[must_use]
    pub fn facts<I, S>(mut self, facts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.meta.facts = facts.into_iter().map(Into::into).collect();
        self
    }

    /// Appends a precondition. Preconditions are checked in declaration order.
    #[must_use]
    pub fn when(mut self, expression: impl Into<String>) -> Self {
        self.preconditions.push((None, expression.into()));
        self
    }

    /// Appends a labelled precondition; the label appears in failure narrations.
    #[must_use]
    pub fn when_labeled(mut self, label: impl Into<String>, expression: impl Into<String>) -> Self {
        self.preconditions.push((Some(label.into()), expression.into()));
        self
    }
}

/// A registered rule.
#[derive(Clone)]
pub struct Rule {
    qualified_key: String,
    meta: RuleMeta,
    preconditions: Vec<Precondition>,
    body: Arc<RuleBody>,
}

impl Rule {
    /// Declaration metadata.
    #[must_use]
    pub fn meta(&self) -> &RuleMeta {
        &self.meta
    }

    /// `ruleset.key`, the sort tie-breaker.
    #[must_use]
    pub fn qualified_key(&self) -> &str {
        &self.qualified_key
    }

    /// Compiled preconditions, in declaration order.
    #[must_use]
    pub fn preconditions(&self) -> &[Precondition] {
        &self.preconditions
    }

    pub(crate) fn fire(&self, input: RuleInput<'_>, memory: &mut WorkingMemory) -> WaypointResult<Emissions> {
        (self.body)(input, memory)
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("qualified_key", &self.qualified_key)
            .field("priority", &self.meta.priority)
            .field("preconditions", &self.preconditions.len())
            .finish_non_exhaustive()
    }
}

/// An immutable, ordered rule table bound to a context.
#[derive(Debug, Clone)]
pub struct KnowledgeBase {
    name: String,
    revision: u32,
    context: Record,
    fact_schema: Option<Schema>,
    rules: Vec<Rule>,
}

impl KnowledgeBase {
    /// Starts building a knowledge base. `name` is the ruleset name.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> KnowledgeBaseBuilder {
        KnowledgeBaseBuilder {
            name: name.into(),
            revision: 0,
            context: Record::new(),
            context_schema: None,
            fact_schema: None,
            rules: Vec::new(),
            keys: HashSet::new(),
        }
    }

    /// Knowledge base name, used as the ruleset of its narrations.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Knowledge base revision.
    #[must_use]
    pub const fn revision(&self) -> u32 {
        self.revision
    }

    /// Context record, bound as `C`.
    #[must_use]
    pub const fn context(&self) -> &Record {
        &self.context
    }

    /// Rules in firing order: ascending priority, then qualified key.
    #[must_use]
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Narration revision for `rule`: the knowledge base revision in the high bits.
    #[must_use]
    pub fn narration_revision(&self, rule: &RuleMeta) -> u64 {
        (u64::from(self.revision) << 16) | u64::from(rule.revision)
    }

    /// Validates a fact against the fact schema, if any.
    ///
    /// # Errors
    /// Returns the schema violation.
    pub fn check_fact(&self, fact: &Record) -> Result<(), ValidationError> {
        match &self.fact_schema {
            Some(schema) => schema.validate(fact),
            None => Ok(()),
        }
    }
}

/// Builder for [`KnowledgeBase`].
pub struct KnowledgeBaseBuilder {
    name: String,
    revision: u32,
    context: Record,
    context_schema: Option<Schema>,
    fact_schema: Option<Schema>,
    rules: Vec<Rule>,
    keys: HashSet<String>,
}

impl KnowledgeBaseBuilder {
    /// Sets the knowledge base revision.
    #[must_use]
    pub const fn revision(mut self, revision: u32) -> Self {
        self.revision = revision;
        self
    }

    /// Sets the context record.
    #[must_use]
    pub fn context(mut self, context: Record) -> Self {
        self.context = context;
        self
    }

    /// Validates the context against `schema` on build.
    #[must_use]
    pub fn context_schema(mut self, schema: Schema) -> Self {
        self.context_schema = Some(schema);
        self
    }

    /// Validates every fact against `schema` on execute.
    #[must_use]
    pub fn fact_schema(mut self, schema: Schema) -> Self {
        self.fact_schema = Some(schema);
        self
    }

    /// Registers a rule, compiling its preconditions.
    ///
    /// # Errors
    /// Fails on a duplicate rule key or a precondition that does not parse.
    pub fn register<F>(mut self, spec: RuleSpec, body: F) -> Result<Self, ValidationError>
    where
        F: Fn(RuleInput<'_>, &mut WorkingMemory) -> WaypointResult<Emissions> + Send + Sync + 'static,
    {
        if !self.keys.insert(spec.meta.key.clone()) {
            return Err(ValidationError::DuplicateKey {
                kind: "rule",
                key: spec.meta.key,
            });
        }

        let preconditions = spec
            .preconditions
            .iter()
            .map(|(label, source)| {
                let compiled = Precondition::compile(source)?;
                Ok(match label {
                    Some(label) => compiled.with_label(label.clone()),
                    None => compiled,
                })
            })
            .collect::<Result<Vec<_>, ValidationError>>()?;

        self.rules.push(Rule {
            qualified_key: format!("{}.{}", self.name, spec.meta.key),
            meta: spec.meta,
            preconditions,
            body: Arc::new(body),
        });
        Ok(self)
    }

    /// Validates the context and freezes the rule table.
    ///
    /// # Errors
    /// Returns the context schema violation, if any.
    pub fn build(mut self) -> Result<KnowledgeBase, ValidationError> {
        if let Some(schema) = &self.context_schema {
            schema.validate(&self.context)?;
        }

        self.rules.sort_by(|a, b| {
            a.meta
                .priority
                .cmp(&b.meta.priority)
                .then_with(|| a.qualified_key.cmp(&b.qualified_key))
        });

        Ok(KnowledgeBase {
            name: self.name,
            revision: self.revision,
            context: self.context,
            fact_schema: self.fact_schema,
            rules: self.rules,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record;

    fn noop(_: RuleInput<'_>, _: &mut WorkingMemory) -> WaypointResult<Emissions> {
        Ok(Vec::new())
    }

    #[test]
    fn test_rules_sorted_by_priority_then_key() {
        let kb = KnowledgeBase::builder("Kb")
            .register(RuleSpec::new("b", "b").priority(5), noop)
            .unwrap()
            .register(RuleSpec::new("z", "z").priority(-1), noop)
            .unwrap()
            .register(RuleSpec::new("a", "a").priority(5), noop)
            .unwrap()
            .build()
            .unwrap();
        let order: Vec<_> = kb.rules().iter().map(Rule::qualified_key).collect();
        assert_eq!(order, vec!["Kb.z", "Kb.a", "Kb.b"]);
    }

    #[test]
    fn test_duplicate_rule_key_rejected() {
        let err = KnowledgeBase::builder("Kb")
            .register(RuleSpec::new("a", "first"), noop)
            .unwrap()
            .register(RuleSpec::new("a", "second"), noop)
            .err()
            .unwrap();
        assert!(matches!(err, ValidationError::DuplicateKey { kind: "rule", .. }));
    }

    #[test]
    fn test_bad_precondition_fails_at_registration() {
        let result = KnowledgeBase::builder("Kb")
            .register(RuleSpec::new("a", "a").when("F.x =="), noop);
        assert!(matches!(result, Err(ValidationError::InvalidExpression { .. })));
    }

    #[test]
    fn test_context_schema_validated_at_build() {
        let schema = Schema::new().required("ctx01", ValueKind::String);
        let err = KnowledgeBase::builder("Kb")
            .context(record! { "ctx01" => 1 })
            .context_schema(schema.clone())
            .build()
            .unwrap_err();
        assert!(matches!(err, ValidationError::FieldType { .. }));

        let kb = KnowledgeBase::builder("Kb")
            .context(record! { "ctx01" => "test02" })
            .context_schema(schema)
            .build()
            .unwrap();
        assert_eq!(kb.context().len(), 1);
    }

    #[test]
    fn test_fact_schema() {
        let kb = KnowledgeBase::builder("Kb")
            .fact_schema(
                Schema::new()
                    .required("test01", ValueKind::String)
                    .optional("n", ValueKind::Float),
            )
            .build()
            .unwrap();
        assert!(kb.check_fact(&record! { "test01" => "TRUE", "n" => 2 }).is_ok());
        assert!(kb.check_fact(&record! { "test01" => "TRUE", "n" => crate::Value::Null }).is_ok());
        assert!(matches!(
            kb.check_fact(&Record::new()),
            Err(ValidationError::MissingField { .. })
        ));
    }

    #[test]
    fn test_narration_revision_packs_kb_revision() {
        let kb = KnowledgeBase::builder("Kb").revision(2).build().unwrap();
        let spec = RuleSpec::new("a", "a").revision(3);
        assert_eq!(kb.narration_revision(&spec.meta), (2 << 16) | 3);
    }
}
