//! # Waypoint - Workflows and Rules
//!
//! Waypoint is an embeddable engine for long-running business processes. It
//! has two halves that share one value model:
//!
//! ## Core Concepts
//!
//! - **Workflow**: an instance of a process attached to a resource, made of steps
//! - **Step**: a small state machine; handlers move it between declared states
//! - **Event**: a named input routed to workflow- or step-level handlers
//! - **Knowledge base**: an ordered set of rules with preconditions
//! - **Narration**: the coded record a rule leaves behind (fired, skipped, retracted)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use waypoint::{record, EventData, EventRouter, InMemoryWorkflowStore, WorkflowManager};
//!
//! let manager = WorkflowManager::new(Arc::new(EventRouter::new()), Arc::new(InMemoryWorkflowStore::new()));
//! manager.register(review_definition()?)?;
//!
//! for wf in manager.process_event("submitted", &EventData::for_resource("document", doc_id))? {
//!     manager.commit_workflow(&wf?)?;
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod rules;
pub mod storage;
pub mod value;
pub mod workflow;

// Re-export primary types at crate root for convenience
pub use error::{ExecutionError, ValidationError, WaypointError, WaypointResult};
pub use rules::{
    Emission, KnowledgeBase, KnowledgeEngine, RuleEngineConfig, RuleNarration, RuleSpec, WorkingMemory,
    NARRATION_RULE_FAIL_PRECOND, NARRATION_RULE_RETRACTED, NARRATION_RULE_SUCCESS,
};
pub use storage::{InMemoryWorkflowStore, StorageError, WorkflowStore};
pub use value::{Record, Value, ValueKind};
pub use workflow::{
    EventData, EventRouter, ManagerConfig, StepDef, StepId, StepStatus, Workflow, WorkflowDef, WorkflowHandle,
    WorkflowId, WorkflowManager, WorkflowStatus, FINISH_STATE, INITIAL_STATE,
};
