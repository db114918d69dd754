//! Workflow data records.
//!
//! These are plain serializable snapshots. The runner never edits them in
//! place; every change goes through a [`Mutation`](crate::workflow::Mutation)
//! so that replaying the mutation log rebuilds exactly the same records.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{WaypointError, WaypointResult};
use crate::value::Record;
use crate::workflow::status::{StageStatus, StepStatus, WorkflowStatus};

/// State every step starts in.
pub const INITIAL_STATE: &str = "_INITIAL";

/// Terminal step state. Reaching it completes the step.
pub const FINISH_STATE: &str = "_FINISHED";

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Creates an ID from an existing UUID.
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Returns the underlying UUID.
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }
    };
}

uuid_id! {
    /// Unique identifier of a workflow instance.
    WorkflowId
}

uuid_id! {
    /// Identifier of a step, derived from its workflow and instance key.
    StepId
}

uuid_id! {
    /// Identifier of one `Workflow::transaction` scope.
    TransactionId
}

impl WorkflowId {
    /// Creates a new random workflow ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionId {
    /// Creates a new random transaction ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl StepId {
    /// Derives the step ID for `instance_key` within `workflow`.
    ///
    /// The same inputs always give the same ID.
    #[must_use]
    pub fn derive(workflow: WorkflowId, instance_key: &str) -> Self {
        Self(Uuid::new_v5(workflow.as_uuid(), instance_key.as_bytes()))
    }
}

/// Workflow-level record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowData {
    /// Workflow id.
    pub id: WorkflowId,
    /// Key of the definition the workflow runs.
    pub process_key: String,
    /// Title copied from the definition.
    pub title: String,
    /// Revision of the definition the workflow was created from.
    pub definition_revision: u32,
    /// Namespace copied from the definition.
    pub namespace: String,
    /// Kind of resource the workflow is attached to.
    pub resource_name: String,
    /// Id of that resource.
    pub resource_id: Uuid,
    /// Lifecycle status.
    pub status: WorkflowStatus,
    /// Fraction of finished steps, 0.0 to 1.0.
    pub progress: f64,
    /// Creation time.
    pub ts_created: DateTime<Utc>,
    /// Set when the workflow starts.
    pub ts_start: Option<DateTime<Utc>>,
    /// Set when the workflow reaches a terminal status.
    pub ts_finish: Option<DateTime<Utc>>,
}

/// Step record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepData {
    /// Step id.
    pub id: StepId,
    /// Owning workflow.
    pub workflow_id: WorkflowId,
    /// Step type key from the definition.
    pub step_key: String,
    /// Key the id was derived from; differs from `step_key` for multiple steps.
    pub instance_key: String,
    /// Title copied from the step type.
    pub title: String,
    /// Stage the step type belongs to.
    pub stage: Option<String>,
    /// Insertion position within the workflow.
    pub index: u32,
    /// External handle that events use to address the step.
    pub selector: Uuid,
    /// Step or workflow that created this step.
    pub src_step: Option<Uuid>,
    /// Current state label.
    pub state: String,
    /// Lifecycle status.
    pub status: StepStatus,
    /// Last message set on the step.
    pub message: Option<String>,
    /// Creation time.
    pub ts_created: DateTime<Utc>,
    /// Time of the last transition.
    pub ts_transit: Option<DateTime<Utc>>,
    /// Set when the step finishes.
    pub ts_finish: Option<DateTime<Utc>>,
}

impl StepData {
    /// Returns true once the step reached a terminal status.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.status.is_finished()
    }
}

/// Stage record, copied from the definition at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageData {
    /// Stage key.
    pub key: String,
    /// Display title.
    pub title: String,
    /// Free-form stage kind.
    pub kind: String,
    /// Sort order.
    pub order: i32,
    /// Optional description.
    pub description: Option<String>,
    /// Completion status.
    pub status: StageStatus,
}

/// A user attached to a workflow under a role.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Participant {
    /// Role key declared by the definition.
    pub role: String,
    /// User holding the role.
    pub user_id: Uuid,
}

/// One record appended by `output`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputRecord {
    /// When the output was written.
    pub timestamp: DateTime<Utc>,
    /// Output fields.
    pub data: Record,
}

/// A line yielded by a handler or hook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowMessage {
    /// Workflow the message belongs to.
    pub workflow_id: WorkflowId,
    /// When the line was produced.
    pub timestamp: DateTime<Utc>,
    /// Handler that produced the line, e.g. `event:test-event` or `step:Step03`.
    pub source: String,
    /// The line itself.
    pub content: String,
}

/// Audit record of one action performed in a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowActivity {
    /// Workflow the action ran on.
    pub workflow_id: WorkflowId,
    /// Transaction the action ran in.
    pub transaction_id: TransactionId,
    /// When the action ran.
    pub timestamp: DateTime<Utc>,
    /// Action name, e.g. `transit`.
    pub action: String,
    /// Step the action touched, if any.
    pub step_id: Option<StepId>,
    /// Action details.
    pub data: Record,
}

/// Complete persisted state of one workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    /// Workflow record.
    pub workflow: WorkflowData,
    /// Stages, in definition order.
    pub stages: Vec<StageData>,
    /// Every step ever added.
    pub steps: BTreeMap<StepId, StepData>,
    /// Workflow memory.
    pub memory: Record,
    /// Per-step memory.
    pub step_memory: BTreeMap<StepId, Record>,
    /// Params given at creation.
    pub params: Record,
    /// Outputs, in write order.
    pub outputs: Vec<OutputRecord>,
    /// Current participants.
    pub participants: Vec<Participant>,
}

impl WorkflowSnapshot {
    /// An empty snapshot around `workflow`.
    #[must_use]
    pub fn new(workflow: WorkflowData) -> Self {
        Self {
            workflow,
            stages: Vec::new(),
            steps: BTreeMap::new(),
            memory: Record::new(),
            step_memory: BTreeMap::new(),
            params: Record::new(),
            outputs: Vec::new(),
            participants: Vec::new(),
        }
    }

    /// Steps in insertion order.
    #[must_use]
    pub fn steps_in_order(&self) -> Vec<&StepData> {
        let mut steps: Vec<_> = self.steps.values().collect();
        steps.sort_by_key(|s| s.index);
        steps
    }

    /// Finds the step owning `selector`.
    #[must_use]
    pub fn step_by_selector(&self, selector: Uuid) -> Option<&StepData> {
        self.steps.values().find(|s| s.selector == selector)
    }

    /// Content hash of the snapshot, hex encoded.
    ///
    /// # Errors
    /// Returns an internal error if the snapshot does not serialize.
    pub fn etag(&self) -> WaypointResult<String> {
        // Maps are ordered, so the encoding is stable.
        let bytes = serde_json::to_vec(self)
            .map_err(|e| WaypointError::internal(format!("snapshot serialization failed: {e}")))?;
        Ok(blake3::hash(&bytes).to_hex().to_string())
    }
}
