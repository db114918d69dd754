//! Executes a knowledge base against one fact.

use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::debug;

use crate::error::{ValidationError, WaypointError, WaypointResult};
use crate::rules::expr::Bindings;
use crate::rules::kbase::{KnowledgeBase, RuleInput};
use crate::rules::memory::{MemoryView, WorkingMemory};
use crate::rules::narration::{RuleNarration, NARRATION_RULE_FAIL_PRECOND};
use crate::value::Record;

/// Rule engine settings.
#[derive(Debug, Clone, Default)]
pub struct RuleEngineConfig {
    /// Log every narration at debug level.
    pub debug: bool,
    /// Reject reserved working memory names and make attributes write-once.
    pub protect_memory: bool,
}

impl RuleEngineConfig {
    /// All flags are independent, so every combination is valid.
    ///
    /// # Errors
    /// Never fails today; kept so configs validate uniformly.
    pub const fn validate(self) -> Result<Self, ValidationError> {
        Ok(self)
    }
}

/// Runs a [`KnowledgeBase`] and queues the resulting narrations.
///
/// Narrations accumulate across `execute` calls until drained with
/// [`KnowledgeEngine::consume_narration`].
pub struct KnowledgeEngine {
    kb: Arc<KnowledgeBase>,
    retractable: bool,
    config: RuleEngineConfig,
    tx: Sender<RuleNarration>,
    rx: Receiver<RuleNarration>,
}

impl KnowledgeEngine {
    /// Binds an engine to `kb` with retraction skipping disabled.
    #[must_use]
    pub fn new(kb: Arc<KnowledgeBase>) -> Self {
        let (tx, rx) = unbounded();
        Self {
            kb,
            retractable: false,
            config: RuleEngineConfig::default(),
            tx,
            rx,
        }
    }

    /// When enabled, rules retracted earlier in the same execution are skipped.
    #[must_use]
    pub const fn retractable(mut self, retractable: bool) -> Self {
        self.retractable = retractable;
        self
    }

    /// Replaces the engine configuration.
    #[must_use]
    pub const fn with_config(mut self, config: RuleEngineConfig) -> Self {
        self.config = config;
        self
    }

    /// The knowledge base this engine runs.
    #[must_use]
    pub fn knowledge_base(&self) -> &KnowledgeBase {
        &self.kb
    }

    /// Evaluates every rule against `fact` in priority order.
    ///
    /// Failed preconditions and retractions become narrations. Errors from
    /// a rule body abort the execution and are returned as-is.
    ///
    /// # Errors
    /// Returns fact schema violations and rule body failures.
    pub fn execute(&self, fact: Record) -> WaypointResult<WorkingMemory> {
        self.kb.check_fact(&fact)?;
        let kb = &*self.kb;
        let ruleset = kb.name();
        let mut memory = WorkingMemory::new(ruleset, self.config.protect_memory);

        for rule in kb.rules() {
            let meta = rule.meta();
            if self.retractable && memory.is_retracted(ruleset, &meta.key) {
                debug!(ruleset, rule = %meta.key, "skipping retracted rule");
                continue;
            }

            let revision = kb.narration_revision(meta);
            let env = Bindings {
                fact: &fact,
                context: kb.context(),
                memory: &memory,
            };
            let failed = rule
                .preconditions()
                .iter()
                .find(|precondition| !precondition.evaluate(&env));

            if let Some(precondition) = failed {
                let label = precondition.label().unwrap_or(precondition.source());
                self.emit(RuleNarration {
                    code: NARRATION_RULE_FAIL_PRECOND,
                    rule: meta.key.clone(),
                    ruleset: ruleset.to_string(),
                    revision,
                    message: Some(format!("Unmatched pre-condition [{label}]")),
                })?;
                continue;
            }

            let input = RuleInput {
                fact: &fact,
                context: kb.context(),
            };
            for emission in rule.fire(input, &mut memory)? {
                self.emit(emission.stamp(&meta.key, ruleset, revision))?;
            }
        }

        Ok(memory)
    }

    /// Drains queued narrations in emission order.
    pub fn consume_narration(&self) -> impl Iterator<Item = RuleNarration> + '_ {
        self.rx.try_iter()
    }

    fn emit(&self, narration: RuleNarration) -> WaypointResult<()> {
        if self.config.debug {
            debug!(
                ruleset = %narration.ruleset,
                rule = %narration.rule,
                code = narration.code,
                message = narration.message.as_deref().unwrap_or(""),
                "rule narration"
            );
        }
        // Both ends live in `self`, so the channel cannot be disconnected here.
        self.tx
            .send(narration)
            .map_err(|_| WaypointError::internal("narration queue disconnected"))
    }
}
