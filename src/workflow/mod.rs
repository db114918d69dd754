//! Workflow engine.
//!
//! A workflow is a set of steps, each a small state machine, driven by
//! events:
//!
//! - [`WorkflowDef`] declares step types, stages, roles and handlers
//! - [`EventRouter`] maps an event to the handlers and workflows it targets
//! - [`Workflow`] holds one instance; all edits go through
//!   [`Workflow::transaction`] and are journaled as [`Mutation`]s
//! - [`WorkflowManager`] creates, loads and commits workflows and drives
//!   events end to end
//!
//! # Example
//! ```rust,ignore
//! let def = WorkflowDef::builder("review")
//!     .step(StepDef::builder("Draft").states(["WRITING"]).build()?)
//!     .on_start(|wf| wf.add_step("Draft").map(|_| Vec::new()))
//!     .build()?;
//! manager.register(def)?;
//!
//! let wf = manager.create_workflow("review", "document", doc_id, Record::new())?;
//! wf.transaction(|tx| tx.start())?;
//! manager.commit()?;
//! ```

mod definition;
mod manager;
mod model;
mod mutation;
mod router;
mod runner;
mod status;

pub use definition::{
    LifecycleHook, Messages, Role, Stage, StepDef, StepDefBuilder, StepDefInfo, StepHandler, Transition,
    TransitionHook, WorkflowDef, WorkflowDefBuilder, WorkflowDefInfo, WorkflowHandler,
};
pub use manager::{EventDispatch, ManagerConfig, WorkflowHandle, WorkflowManager};
pub use model::{
    OutputRecord, Participant, StageData, StepData, StepId, TransactionId, WorkflowActivity, WorkflowData,
    WorkflowId, WorkflowMessage, WorkflowSnapshot, FINISH_STATE, INITIAL_STATE,
};
pub use mutation::{Mutation, MutationEnvelope, StepPatch, WorkflowPatch};
pub use router::{default_route, EventData, EventRouter, RouteFn, RouteTarget, StepRef, WorkflowRef, WorkflowTrigger};
pub use runner::{NewStep, PendingChanges, StepState, Transaction, Workflow, WorkflowState};
pub use status::{StageStatus, StepStatus, WorkflowStatus};
