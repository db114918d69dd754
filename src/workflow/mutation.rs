//! Workflow mutations.
//!
//! A mutation is the unit of change of a workflow snapshot. Live edits and
//! replay from storage go through the same [`Mutation::apply`], which is
//! what makes a reloaded workflow identical to the committed one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ExecutionError, WaypointError, WaypointResult};
use crate::value::Record;
use crate::workflow::model::{
    OutputRecord, Participant, StageData, StepData, StepId, TransactionId, WorkflowData,
    WorkflowId, WorkflowSnapshot,
};
use crate::workflow::status::{StageStatus, StepStatus, WorkflowStatus};

/// Partial update of the workflow record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowPatch {
    /// New workflow status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<WorkflowStatus>,
    /// New progress.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    /// Start time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts_start: Option<DateTime<Utc>>,
    /// Finish time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts_finish: Option<DateTime<Utc>>,
}

/// Partial update of a step record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepPatch {
    /// New state label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    /// New step status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StepStatus>,
    /// New step message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Transition time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts_transit: Option<DateTime<Utc>>,
    /// Finish time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts_finish: Option<DateTime<Utc>>,
}

/// One change to a workflow snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Mutation {
    /// Sets the workflow record. Always the first mutation of a log.
    InitializeWorkflow {
        /// The initial record.
        workflow: WorkflowData,
    },
    /// Merged into the params.
    SetParams {
        /// Params to merge.
        params: Record,
    },
    /// Appends a stage.
    AddStage {
        /// The stage record.
        stage: StageData,
    },
    /// Changes a stage status.
    UpdateStage {
        /// Stage key.
        key: String,
        /// New status.
        status: StageStatus,
    },
    /// Patches the workflow record.
    SetState {
        /// Fields to change.
        patch: WorkflowPatch,
    },
    /// Adds a step.
    AddStep {
        /// The step record.
        step: StepData,
    },
    /// Patches a step record.
    UpdateStep {
        /// Step to change.
        step_id: StepId,
        /// Fields to change.
        patch: StepPatch,
    },
    /// Merged into workflow memory.
    SetMemory {
        /// Entries to merge.
        memory: Record,
    },
    /// Merged into the step's memory.
    SetStepMemory {
        /// Step whose memory changes.
        step_id: StepId,
        /// Entries to merge.
        memory: Record,
    },
    /// Appends an output record.
    AddOutput {
        /// The output.
        output: OutputRecord,
    },
    /// Adds a participant.
    AddParticipant {
        /// The participant.
        participant: Participant,
    },
    /// Removes a participant.
    RemoveParticipant {
        /// The participant.
        participant: Participant,
    },
}

impl Mutation {
    /// Short name used in logs and envelopes.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::InitializeWorkflow { .. } => "initialize-workflow",
            Self::SetParams { .. } => "set-params",
            Self::AddStage { .. } => "add-stage",
            Self::UpdateStage { .. } => "update-stage",
            Self::SetState { .. } => "set-state",
            Self::AddStep { .. } => "add-step",
            Self::UpdateStep { .. } => "update-step",
            Self::SetMemory { .. } => "set-memory",
            Self::SetStepMemory { .. } => "set-step-memory",
            Self::AddOutput { .. } => "add-output",
            Self::AddParticipant { .. } => "add-participant",
            Self::RemoveParticipant { .. } => "remove-participant",
        }
    }

    /// Fails with [`ExecutionError::NonFiniteValue`] if a carried record
    /// holds NaN or infinity.
    pub fn check_values(&self) -> Result<(), ExecutionError> {
        let record = match self {
            Self::SetParams { params: record }
            | Self::SetMemory { memory: record }
            | Self::SetStepMemory { memory: record, .. } => record,
            Self::AddOutput { output } => &output.data,
            _ => return Ok(()),
        };
        match record.iter().find(|(_, value)| !value.is_finite()) {
            Some((field, _)) => Err(ExecutionError::NonFiniteValue {
                field: field.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Applies this mutation to `snapshot`.
    ///
    /// # Errors
    /// Fails when the mutation references a step or stage the snapshot lacks.
    pub fn apply(&self, snapshot: &mut WorkflowSnapshot) -> Result<(), ExecutionError> {
        match self {
            Self::InitializeWorkflow { workflow } => snapshot.workflow = workflow.clone(),
            Self::SetParams { params } => {
                snapshot
                    .params
                    .extend(params.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            Self::AddStage { stage } => snapshot.stages.push(stage.clone()),
            Self::UpdateStage { key, status } => {
                let stage = snapshot
                    .stages
                    .iter_mut()
                    .find(|s| &s.key == key)
                    .ok_or_else(|| ExecutionError::StepNotFound {
                        reference: format!("stage {key}"),
                    })?;
                stage.status = *status;
            }
            Self::SetState { patch } => {
                let wf = &mut snapshot.workflow;
                if let Some(status) = patch.status {
                    wf.status = status;
                }
                if let Some(progress) = patch.progress {
                    wf.progress = progress;
                }
                if patch.ts_start.is_some() {
                    wf.ts_start = patch.ts_start;
                }
                if patch.ts_finish.is_some() {
                    wf.ts_finish = patch.ts_finish;
                }
            }
            Self::AddStep { step } => {
                snapshot.steps.insert(step.id, step.clone());
            }
            Self::UpdateStep { step_id, patch } => {
                let step = snapshot
                    .steps
                    .get_mut(step_id)
                    .ok_or_else(|| ExecutionError::StepNotFound {
                        reference: step_id.to_string(),
                    })?;
                if let Some(state) = &patch.state {
                    step.state.clone_from(state);
                }
                if let Some(status) = patch.status {
                    step.status = status;
                }
                if patch.message.is_some() {
                    step.message.clone_from(&patch.message);
                }
                if patch.ts_transit.is_some() {
                    step.ts_transit = patch.ts_transit;
                }
                if patch.ts_finish.is_some() {
                    step.ts_finish = patch.ts_finish;
                }
            }
            Self::SetMemory { memory } => {
                snapshot
                    .memory
                    .extend(memory.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            Self::SetStepMemory { step_id, memory } => {
                if !snapshot.steps.contains_key(step_id) {
                    return Err(ExecutionError::StepNotFound {
                        reference: step_id.to_string(),
                    });
                }
                snapshot
                    .step_memory
                    .entry(*step_id)
                    .or_default()
                    .extend(memory.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            Self::AddOutput { output } => snapshot.outputs.push(output.clone()),
            Self::AddParticipant { participant } => {
                if !snapshot.participants.contains(participant) {
                    snapshot.participants.push(participant.clone());
                }
            }
            Self::RemoveParticipant { participant } => {
                snapshot.participants.retain(|p| p != participant);
            }
        }
        Ok(())
    }
}

/// A mutation stamped with where it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationEnvelope {
    /// Workflow the mutation applies to.
    pub workflow_id: WorkflowId,
    /// Transaction that produced it.
    pub transaction_id: TransactionId,
    /// Action that produced the mutation, e.g. `add_step` or `transit`.
    pub action: String,
    /// Position in the workflow's mutation log, starting at 1.
    pub order: u64,
    /// When it was produced.
    pub timestamp: DateTime<Utc>,
    /// The change itself.
    pub mutation: Mutation,
}

impl WorkflowSnapshot {
    /// Rebuilds a snapshot from its mutation log.
    ///
    /// # Errors
    /// Fails when the log is empty, does not start with an initialization,
    /// or contains a mutation that does not apply.
    pub fn replay(log: &[MutationEnvelope]) -> WaypointResult<Self> {
        let (first, rest) = log
            .split_first()
            .ok_or_else(|| WaypointError::internal("cannot replay an empty mutation log"))?;
        let Mutation::InitializeWorkflow { workflow } = &first.mutation else {
            return Err(WaypointError::internal(format!(
                "mutation log of workflow {} starts with {}",
                first.workflow_id,
                first.mutation.name()
            )));
        };

        let mut snapshot = Self::new(workflow.clone());
        for envelope in rest {
            envelope.mutation.apply(&mut snapshot)?;
        }
        Ok(snapshot)
    }
}
