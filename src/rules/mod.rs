//! Forward-chaining rule engine.
//!
//! A [`KnowledgeBase`] holds rules sorted by priority. A [`KnowledgeEngine`]
//! runs them against one fact at a time:
//!
//! - rules whose preconditions fail emit a code-100 narration and are skipped
//! - rule bodies may write [`WorkingMemory`] and retract later rules
//! - every emission is queued as a [`RuleNarration`]
//!
//! ```rust,ignore
//! let kb = KnowledgeBase::builder("Pricing")
//!     .context(record! { "region" => "eu" })
//!     .register(RuleSpec::new("vat", "apply VAT").when("C.region == 'eu'"), |_, mem| {
//!         mem.set("vat", 0.2)?;
//!         Ok(vec![Emission::from("VAT applied")])
//!     })?
//!     .build()?;
//! let engine = KnowledgeEngine::new(Arc::new(kb));
//! let memory = engine.execute(record! { "amount" => 10 })?;
//! ```

mod engine;
mod expr;
mod kbase;
mod memory;
mod narration;

pub use engine::{KnowledgeEngine, RuleEngineConfig};
pub use expr::{Bindings, Precondition};
pub use kbase::{KnowledgeBase, KnowledgeBaseBuilder, Rule, RuleBody, RuleInput, RuleSpec, Schema};
pub use memory::{MemoryView, RetractionKey, WorkingMemory, RESERVED_ATTRIBUTES};
pub use narration::{
    Emission, Emissions, RuleMeta, RuleNarration, NARRATION_RULE_FAIL_PRECOND,
    NARRATION_RULE_RETRACTED, NARRATION_RULE_SUCCESS,
};
