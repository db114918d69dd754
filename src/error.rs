//! Error types for Waypoint.
//!
//! Errors are strongly typed using thiserror. Definition-time problems are
//! [`ValidationError`]s, runtime contract violations are [`ExecutionError`]s,
//! and persistence failures are [`StorageError`]s. [`WaypointError`] wraps
//! all three.

use thiserror::Error;
use uuid::Uuid;

pub use crate::storage::StorageError;

/// Validation errors raised while building definitions, configs, or inputs.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is absent.
    #[error("Required field '{field}' is missing")]
    MissingField {
        /// Field name.
        field: String,
    },

    /// A field has the wrong type.
    #[error("Field '{field}' has type {actual}, expected {expected}")]
    FieldType {
        /// Field name.
        field: String,
        /// Expected type.
        expected: &'static str,
        /// Actual type.
        actual: &'static str,
    },

    /// A state label is not upper snake case.
    #[error("Invalid state label '{label}': must match ^[A-Z][A-Z0-9_]*$")]
    InvalidStateLabel {
        /// The state label.
        label: String,
    },

    /// A transition targets a state the step does not declare.
    #[error("Step '{step}' has a transition handler for undeclared state '{state}'")]
    UndeclaredTransition {
        /// Step type key.
        step: String,
        /// The undeclared state.
        state: String,
    },

    /// Two transitions target the same state.
    #[error("Step '{step}' already has a transition handler for state '{state}'")]
    DuplicateTransition {
        /// Step type key.
        step: String,
        /// The state label.
        state: String,
    },

    /// A step references a stage the definition lacks.
    #[error("Step '{step}' references unknown stage '{stage}'")]
    UnknownStage {
        /// Step type key.
        step: String,
        /// Stage key.
        stage: String,
    },

    /// A key is declared twice.
    #[error("Duplicate {kind} key '{key}'")]
    DuplicateKey {
        /// What kind of key.
        kind: &'static str,
        /// The key.
        key: String,
    },

    /// A precondition does not compile.
    #[error("Invalid precondition '{source_text}' at offset {offset}: {reason}")]
    InvalidExpression {
        /// Expression text.
        source_text: String,
        /// Byte offset of the problem.
        offset: usize,
        /// What is wrong.
        reason: String,
    },

    /// A configuration value is out of range.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// What is wrong.
        reason: String,
    },
}

/// Execution errors raised while running rules or workflow actions.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The workflow status forbids the action.
    #[error("Action '{action}' is not allowed at workflow status {status}")]
    StatusNotAllowed {
        /// Action attempted.
        action: &'static str,
        /// Current status.
        status: String,
    },

    /// The step status forbids the action.
    #[error("Step action '{action}' is not allowed at step status {status}")]
    StepStatusNotAllowed {
        /// Action attempted.
        action: &'static str,
        /// Current status.
        status: String,
    },

    /// The definition has no such step type.
    #[error("Workflow '{process_key}' has no step type '{step_key}'")]
    UnknownStepType {
        /// Process key.
        process_key: String,
        /// Step type key.
        step_key: String,
    },

    /// A non-multiple step type was added twice.
    #[error("Step '{instance_key}' already exists (id {step_id}); mark the step type multiple to add it again")]
    DuplicateStep {
        /// Instance key of the existing step.
        instance_key: String,
        /// Id of the existing step.
        step_id: Uuid,
    },

    /// Another step already owns the selector.
    #[error("Step selector {selector} is already in use")]
    DuplicateSelector {
        /// The selector.
        selector: Uuid,
    },

    /// The target state is not declared.
    #[error("Invalid transition for step '{step_key}': unknown state '{label}'")]
    InvalidTransition {
        /// Step type key.
        step_key: String,
        /// The state label.
        label: String,
    },

    /// The step already finished.
    #[error("Step '{step_key}' is finished and cannot transit to '{label}'")]
    TransitionFromFinished {
        /// Step type key.
        step_key: String,
        /// The state label.
        label: String,
    },

    /// The transition's origin restrictions reject the current state.
    #[error("Transition of step '{step_key}' to '{label}' is not allowed from '{origin}'")]
    OriginNotAllowed {
        /// Step type key.
        step_key: String,
        /// The state label.
        label: String,
        /// Current state.
        origin: String,
    },

    /// Transition hooks chained too deep.
    #[error("Transition chain exceeded depth {limit}")]
    TransitionDepthExceeded {
        /// Configured depth limit.
        limit: usize,
    },

    /// The start hook added no step.
    #[error("Workflow started without any step")]
    NoStepsAfterStart,

    /// No step matches the reference.
    #[error("Step not found: {reference}")]
    StepNotFound {
        /// The reference that did not resolve.
        reference: String,
    },

    /// No handler is registered for the event.
    #[error("No handler registered for event '{event}'")]
    UnknownEvent {
        /// Event name.
        event: String,
    },

    /// A step handler matched but the event addresses no step.
    #[error("Event '{event}' targets step '{step_key}' but carries no step selector")]
    MissingSelector {
        /// Event name.
        event: String,
        /// Step type key.
        step_key: String,
    },

    /// The definition declares no such role.
    #[error("Workflow '{process_key}' declares no role '{role}'")]
    UnknownRole {
        /// Process key.
        process_key: String,
        /// Role key.
        role: String,
    },

    /// No definition is registered under the process key.
    #[error("Workflow definition not registered: {process_key}")]
    UnknownDefinition {
        /// Process key.
        process_key: String,
    },

    /// No workflow matches the reference.
    #[error("Workflow not found: {reference}")]
    WorkflowNotFound {
        /// The reference that did not resolve.
        reference: String,
    },

    /// Protected memory rejects a reserved name.
    #[error("Working memory attribute '{name}' is reserved")]
    ReservedAttribute {
        /// Attribute name.
        name: String,
    },

    /// Protected memory rejects a second write.
    #[error("Working memory attribute '{name}' is already set")]
    AttributeLocked {
        /// Attribute name.
        name: String,
    },

    /// A float is NaN or infinite.
    #[error("Value of '{field}' is not a finite number")]
    NonFiniteValue {
        /// Field or attribute holding the value.
        field: String,
    },

    /// A replayed snapshot does not hash to the stored etag.
    #[error("Replay of workflow {workflow_id} produced etag {actual}, stored {expected}")]
    ReplayMismatch {
        /// Workflow id.
        workflow_id: Uuid,
        /// Stored etag.
        expected: String,
        /// Etag of the replayed snapshot.
        actual: String,
    },

    /// A handler aborted the transaction.
    #[error("Handler failed: {message}")]
    Handler {
        /// Failure message.
        message: String,
    },
}

/// Top-level error type for Waypoint.
#[derive(Debug, Error)]
pub enum WaypointError {
    /// Definition or input validation failed.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// A runtime action failed.
    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    /// The store failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// A bug or poisoned lock.
    #[error("Internal error: {message}")]
    Internal {
        /// What went wrong.
        message: String,
    },
}

impl WaypointError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates a handler failure. Handlers use this to abort a transaction.
    #[must_use]
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Execution(ExecutionError::Handler {
            message: message.into(),
        })
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is an execution error.
    #[must_use]
    pub const fn is_execution(&self) -> bool {
        matches!(self, Self::Execution(_))
    }

    /// Returns true if this is a storage error.
    #[must_use]
    pub const fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }

    /// Returns true if this is an internal error.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }

    /// Returns true if a commit was rejected because of a stale revision.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Storage(StorageError::Conflict { .. }))
    }

    /// Returns true if this error is retryable.
    ///
    /// Conflicts are retryable after reloading the workflow.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Storage(e) => matches!(
                e,
                StorageError::Conflict { .. } | StorageError::ConnectionError(_)
            ),
            Self::Validation(_) | Self::Execution(_) | Self::Internal { .. } => false,
        }
    }
}

/// Result type alias for Waypoint operations.
pub type WaypointResult<T> = Result<T, WaypointError>;
