//! The workflow aggregate.
//!
//! A [`Workflow`] owns one snapshot and the journal of changes not yet
//! committed. All edits happen inside [`Workflow::transaction`]: the closure
//! works on a draft copy, and the draft replaces the live state only if the
//! closure returns `Ok`. Handlers see the draft through [`WorkflowState`]
//! and [`StepState`], which expose edits but not lifecycle actions.

use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ExecutionError, WaypointError, WaypointResult};
use crate::record;
use crate::value::{Record, Value};
use crate::workflow::definition::{LifecycleHook, Messages, WorkflowDef};
use crate::workflow::model::{
    OutputRecord, Participant, StageData, StepData, StepId, TransactionId, WorkflowActivity,
    WorkflowData, WorkflowId, WorkflowMessage, WorkflowSnapshot, FINISH_STATE, INITIAL_STATE,
};
use crate::workflow::mutation::{Mutation, MutationEnvelope, StepPatch, WorkflowPatch};
use crate::workflow::router::{Handler, StepRef, WorkflowTrigger};
use crate::workflow::status::{StageStatus, StepStatus, WorkflowStatus};

/// Changes made since the last commit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingChanges {
    /// Mutations not yet committed.
    pub mutations: Vec<MutationEnvelope>,
    /// Messages not yet committed.
    pub messages: Vec<WorkflowMessage>,
    /// Activities not yet committed.
    pub activities: Vec<WorkflowActivity>,
}

impl PendingChanges {
    /// Returns true if nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty() && self.messages.is_empty() && self.activities.is_empty()
    }
}

/// Parameters for adding a step.
#[derive(Debug, Clone)]
pub struct NewStep {
    step_key: String,
    title: Option<String>,
    selector: Option<Uuid>,
    memory: Record,
}

impl NewStep {
    /// Describes a step of type `step_key`.
    #[must_use]
    pub fn new(step_key: impl Into<String>) -> Self {
        Self {
            step_key: step_key.into(),
            title: None,
            selector: None,
            memory: Record::new(),
        }
    }

    /// Overrides the title declared by the step type.
    #[must_use]
    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Routing selector. Defaults to the step id.
    #[must_use]
    pub const fn selector(mut self, selector: Uuid) -> Self {
        self.selector = Some(selector);
        self
    }

    /// Seeds the step's memory.
    #[must_use]
    pub fn memorize(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.memory.insert(key.into(), value.into());
        self
    }
}

impl From<&str> for NewStep {
    fn from(step_key: &str) -> Self {
        Self::new(step_key)
    }
}

/// Draft state shared by one transaction.
struct Session {
    def: Arc<WorkflowDef>,
    snapshot: WorkflowSnapshot,
    pending: PendingChanges,
    order: u64,
    txn: TransactionId,
    actions: Vec<&'static str>,
    depth: usize,
    max_depth: usize,
}

impl Session {
    fn workflow_id(&self) -> WorkflowId {
        self.snapshot.workflow.id
    }

    fn status(&self) -> WorkflowStatus {
        self.snapshot.workflow.status
    }

    fn ensure_status(&self, action: &'static str, allowed: &[WorkflowStatus]) -> Result<(), ExecutionError> {
        if allowed.contains(&self.status()) {
            Ok(())
        } else {
            Err(ExecutionError::StatusNotAllowed {
                action,
                status: self.status().to_string(),
            })
        }
    }

    fn with_action<R>(
        &mut self,
        action: &'static str,
        f: impl FnOnce(&mut Self) -> WaypointResult<R>,
    ) -> WaypointResult<R> {
        self.actions.push(action);
        let result = f(self);
        self.actions.pop();
        result
    }

    fn mutate(&mut self, mutation: Mutation) -> WaypointResult<()> {
        mutation.check_values()?;
        mutation.apply(&mut self.snapshot)?;
        self.order += 1;
        self.pending.mutations.push(MutationEnvelope {
            workflow_id: self.workflow_id(),
            transaction_id: self.txn,
            action: self.actions.last().copied().unwrap_or("direct").to_string(),
            order: self.order,
            timestamp: Utc::now(),
            mutation,
        });
        Ok(())
    }

    fn record_activity(&mut self, action: &str, step_id: Option<StepId>, data: Record) {
        self.pending.activities.push(WorkflowActivity {
            workflow_id: self.workflow_id(),
            transaction_id: self.txn,
            timestamp: Utc::now(),
            action: action.to_string(),
            step_id,
            data,
        });
    }

    fn record_messages(&mut self, source: &str, lines: Messages) {
        let workflow_id = self.workflow_id();
        self.pending
            .messages
            .extend(lines.into_iter().map(|content| WorkflowMessage {
                workflow_id,
                timestamp: Utc::now(),
                source: source.to_string(),
                content,
            }));
    }

    fn step_data(&self, step_id: StepId) -> Result<&StepData, ExecutionError> {
        self.snapshot
            .steps
            .get(&step_id)
            .ok_or_else(|| ExecutionError::StepNotFound {
                reference: step_id.to_string(),
            })
    }

    fn resolve_step(&self, step: StepRef) -> Result<StepId, ExecutionError> {
        let found = match step {
            StepRef::Id(id) => self.snapshot.steps.get(&id),
            StepRef::Selector(selector) => self.snapshot.step_by_selector(selector),
        };
        found.map(|s| s.id).ok_or_else(|| ExecutionError::StepNotFound {
            reference: step.to_string(),
        })
    }

    fn run_hook(&mut self, hook: Option<LifecycleHook>, source: &str) -> WaypointResult<()> {
        if let Some(hook) = hook {
            let lines = hook(&mut WorkflowState { session: &mut *self })?;
            self.record_messages(source, lines);
        }
        Ok(())
    }

    fn initialize(&mut self, data: WorkflowData, params: Record) -> WaypointResult<()> {
        self.with_action("create", |s| {
            s.mutate(Mutation::InitializeWorkflow { workflow: data })?;
            if !params.is_empty() {
                s.mutate(Mutation::SetParams { params })?;
            }
            let stages: Vec<_> = s.def.stages().to_vec();
            for stage in stages {
                s.mutate(Mutation::AddStage {
                    stage: StageData {
                        key: stage.key,
                        title: stage.title,
                        kind: stage.kind,
                        order: stage.order,
                        description: stage.description,
                        status: StageStatus::Active,
                    },
                })?;
            }
            s.record_activity("create", None, Record::new());
            Ok(())
        })
    }

    fn add_step(&mut self, new: NewStep, src_step: Option<Uuid>) -> WaypointResult<StepId> {
        self.ensure_status("add_step", WorkflowStatus::RUNNING)?;
        self.with_action("add_step", |s| {
            let def = s.def.step(&new.step_key).ok_or_else(|| ExecutionError::UnknownStepType {
                process_key: s.def.key().to_string(),
                step_key: new.step_key.clone(),
            })?;

            let index = s.snapshot.steps.len();
            let instance_key = if def.is_multiple() {
                format!("{}-{index}", new.step_key)
            } else {
                new.step_key.clone()
            };
            let id = StepId::derive(s.workflow_id(), &instance_key);
            if s.snapshot.steps.contains_key(&id) {
                return Err(ExecutionError::DuplicateStep {
                    instance_key,
                    step_id: *id.as_uuid(),
                }
                .into());
            }

            let selector = new.selector.unwrap_or(*id.as_uuid());
            if s.snapshot.step_by_selector(selector).is_some() {
                return Err(ExecutionError::DuplicateSelector { selector }.into());
            }

            let step = StepData {
                id,
                workflow_id: s.workflow_id(),
                step_key: new.step_key.clone(),
                instance_key,
                title: new.title.unwrap_or_else(|| def.title().to_string()),
                stage: def.stage().map(ToString::to_string),
                index: u32::try_from(index).map_err(|_| WaypointError::internal("step index overflow"))?,
                selector,
                src_step,
                state: INITIAL_STATE.to_string(),
                status: StepStatus::Active,
                message: None,
                ts_created: Utc::now(),
                ts_transit: None,
                ts_finish: None,
            };
            s.mutate(Mutation::AddStep { step })?;
            if !new.memory.is_empty() {
                s.mutate(Mutation::SetStepMemory {
                    step_id: id,
                    memory: new.memory,
                })?;
            }

            s.record_activity(
                "add_step",
                Some(id),
                record! { "step_key" => new.step_key.as_str(), "selector" => selector },
            );
            debug!(workflow_id = %s.workflow_id(), step_id = %id, step_key = %new.step_key, "step added");
            Ok(id)
        })
    }

    fn transit(&mut self, step_id: StepId, label: &str) -> WaypointResult<()> {
        self.ensure_status("transit", WorkflowStatus::RUNNING)?;
        let step = self.step_data(step_id)?;
        let step_key = step.step_key.clone();
        let origin = step.state.clone();
        let finished = step.is_finished();

        let def = self.def.step(&step_key).ok_or_else(|| ExecutionError::UnknownStepType {
            process_key: self.def.key().to_string(),
            step_key: step_key.clone(),
        })?;
        if finished {
            return Err(ExecutionError::TransitionFromFinished {
                step_key,
                label: label.to_string(),
            }
            .into());
        }
        if !def.accepts_state(label) {
            return Err(ExecutionError::InvalidTransition {
                step_key,
                label: label.to_string(),
            }
            .into());
        }
        if origin == label {
            warn!(workflow_id = %self.workflow_id(), step_id = %step_id, state = label, "step already in state");
            return Ok(());
        }

        let transition = def.transition(label).cloned();
        if let Some(t) = &transition {
            if !t.permits(&origin) {
                return Err(ExecutionError::OriginNotAllowed {
                    step_key,
                    label: label.to_string(),
                    origin,
                }
                .into());
            }
        }
        if self.depth >= self.max_depth {
            return Err(ExecutionError::TransitionDepthExceeded {
                limit: self.max_depth,
            }
            .into());
        }

        self.with_action("transit", |s| {
            let now = Utc::now();
            let mut patch = StepPatch {
                state: Some(label.to_string()),
                ts_transit: Some(now),
                ..StepPatch::default()
            };
            if label == FINISH_STATE {
                patch.status = Some(StepStatus::Completed);
                patch.ts_finish = Some(now);
            }
            s.mutate(Mutation::UpdateStep { step_id, patch })?;
            s.record_activity(
                "transit",
                Some(step_id),
                record! { "from" => origin.as_str(), "to" => label },
            );
            debug!(workflow_id = %s.workflow_id(), step_id = %step_id, from = %origin, to = label, "step transited");

            if let Some(t) = transition {
                s.depth += 1;
                let lines = t.hook()(&mut StepState { session: &mut *s, step_id }, &origin);
                s.depth -= 1;
                s.record_messages(&format!("transition:{step_key}:{label}"), lines?);
            }
            Ok(())
        })
    }

    fn set_step_status(
        &mut self,
        step_id: StepId,
        action: &'static str,
        from: &[StepStatus],
        to: StepStatus,
        message: Option<String>,
    ) -> WaypointResult<()> {
        self.ensure_status(action, WorkflowStatus::RUNNING)?;
        let current = self.step_data(step_id)?.status;
        if !from.contains(&current) {
            return Err(ExecutionError::StepStatusNotAllowed {
                action,
                status: current.to_string(),
            }
            .into());
        }
        self.with_action(action, |s| {
            let patch = StepPatch {
                status: Some(to),
                message,
                ts_finish: to.is_finished().then(Utc::now),
                ..StepPatch::default()
            };
            s.mutate(Mutation::UpdateStep { step_id, patch })?;
            s.record_activity(action, Some(step_id), Record::new());
            Ok(())
        })
    }

    /// Recomputes progress, status and stage completion from the steps.
    fn reconcile(&mut self) -> WaypointResult<()> {
        let steps = &self.snapshot.steps;
        let total = steps.len();
        let finished = steps.values().filter(|s| s.is_finished()).count();
        let any_error = steps.values().any(|s| s.status == StepStatus::Error);

        #[allow(clippy::cast_precision_loss)]
        let progress = if total == 0 { 0.0 } else { finished as f64 / total as f64 };

        let current = self.status();
        let status = match current {
            WorkflowStatus::Active | WorkflowStatus::Degraded if total > 0 && finished == total => {
                WorkflowStatus::Completed
            }
            WorkflowStatus::Active if any_error => WorkflowStatus::Degraded,
            WorkflowStatus::Degraded if !any_error => WorkflowStatus::Active,
            other => other,
        };

        let completed_stages: Vec<String> = self
            .snapshot
            .stages
            .iter()
            .filter(|stage| stage.status == StageStatus::Active)
            .filter(|stage| {
                let mut in_stage = steps.values().filter(|s| s.stage.as_deref() == Some(stage.key.as_str())).peekable();
                in_stage.peek().is_some() && in_stage.all(StepData::is_finished)
            })
            .map(|stage| stage.key.clone())
            .collect();

        let mut patch = WorkflowPatch::default();
        if (progress - self.snapshot.workflow.progress).abs() > f64::EPSILON {
            patch.progress = Some(progress);
        }
        if status != current {
            patch.status = Some(status);
            if status == WorkflowStatus::Completed {
                patch.ts_finish = Some(Utc::now());
                info!(workflow_id = %self.workflow_id(), "workflow completed");
            }
        }

        self.with_action("reconcile", |s| {
            for key in completed_stages {
                s.mutate(Mutation::UpdateStage {
                    key,
                    status: StageStatus::Completed,
                })?;
            }
            if patch != WorkflowPatch::default() {
                s.mutate(Mutation::SetState { patch })?;
            }
            Ok(())
        })
    }
}

/// Handler view of a workflow inside a transaction.
pub struct WorkflowState<'a> {
    session: &'a mut Session,
}

impl WorkflowState<'_> {
    /// Workflow id.
    #[must_use]
    pub fn id(&self) -> WorkflowId {
        self.session.workflow_id()
    }

    /// Current workflow status.
    #[must_use]
    pub fn status(&self) -> WorkflowStatus {
        self.session.status()
    }

    /// The draft snapshot, including edits made so far in this transaction.
    #[must_use]
    pub fn snapshot(&self) -> &WorkflowSnapshot {
        &self.session.snapshot
    }

    /// Number of steps in the draft.
    #[must_use]
    pub fn step_count(&self) -> usize {
        self.session.snapshot.steps.len()
    }

    /// Adds a step created by the workflow itself.
    ///
    /// # Errors
    /// Fails for unknown step types, duplicate non-multiple steps, duplicate
    /// selectors, and when the workflow is not running.
    pub fn add_step(&mut self, new: impl Into<NewStep>) -> WaypointResult<StepId> {
        let src = *self.id().as_uuid();
        self.session.add_step(new.into(), Some(src))
    }

    /// Merges `memory` into workflow memory.
    ///
    /// # Errors
    /// Fails once the workflow is terminal.
    pub fn memorize(&mut self, memory: Record) -> WaypointResult<()> {
        self.session.ensure_status("memorize", WorkflowStatus::EDITABLE)?;
        self.session
            .with_action("memorize", |s| s.mutate(Mutation::SetMemory { memory }))
    }

    /// Appends one output record.
    ///
    /// # Errors
    /// Fails once the workflow is terminal.
    pub fn output(&mut self, data: Record) -> WaypointResult<()> {
        self.session.ensure_status("output", WorkflowStatus::EDITABLE)?;
        self.session.with_action("output", |s| {
            s.mutate(Mutation::AddOutput {
                output: OutputRecord {
                    timestamp: Utc::now(),
                    data,
                },
            })
        })
    }

    /// Workflow memory overlaid with params.
    #[must_use]
    pub fn recall(&self) -> Record {
        let snap = &self.session.snapshot;
        let mut merged = snap.memory.clone();
        merged.extend(snap.params.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }

    /// Handle on one step of the draft.
    ///
    /// # Errors
    /// Fails if the step does not exist.
    pub fn step(&mut self, step_id: StepId) -> WaypointResult<StepState<'_>> {
        self.session.step_data(step_id)?;
        Ok(StepState {
            session: self.session,
            step_id,
        })
    }

    /// Handle on the step owning `selector`.
    ///
    /// # Errors
    /// Fails if no step has that selector.
    pub fn step_by_selector(&mut self, selector: Uuid) -> WaypointResult<StepState<'_>> {
        let step_id = self.session.resolve_step(StepRef::Selector(selector))?;
        Ok(StepState {
            session: self.session,
            step_id,
        })
    }
}

/// Handler view of one step inside a transaction.
pub struct StepState<'a> {
    session: &'a mut Session,
    step_id: StepId,
}

impl StepState<'_> {
    /// Step id.
    #[must_use]
    pub const fn id(&self) -> StepId {
        self.step_id
    }

    /// Current record of the step.
    ///
    /// # Panics
    /// Never: a `StepState` is only built for an existing step, and steps
    /// are never removed.
    #[must_use]
    pub fn data(&self) -> &StepData {
        &self.session.snapshot.steps[&self.step_id]
    }

    /// Current state label.
    #[must_use]
    pub fn state(&self) -> &str {
        &self.data().state
    }

    /// Step type key.
    #[must_use]
    pub fn step_key(&self) -> &str {
        &self.data().step_key
    }

    /// Moves the step to `label` and runs the transition hook, if any.
    ///
    /// Moving to the current state is a logged no-op.
    ///
    /// # Errors
    /// Fails for undeclared labels, finished steps, disallowed origins,
    /// and transition chains deeper than the configured limit.
    pub fn transit(&mut self, label: &str) -> WaypointResult<()> {
        self.session.transit(self.step_id, label)
    }

    /// Adds a step created by this step.
    ///
    /// # Errors
    /// Same as [`WorkflowState::add_step`].
    pub fn add_step(&mut self, new: impl Into<NewStep>) -> WaypointResult<StepId> {
        let src = *self.step_id.as_uuid();
        self.session.add_step(new.into(), Some(src))
    }

    /// Merges `memory` into this step's memory.
    ///
    /// # Errors
    /// Fails once the workflow is terminal.
    pub fn memorize(&mut self, memory: Record) -> WaypointResult<()> {
        self.session.ensure_status("memorize", WorkflowStatus::EDITABLE)?;
        let step_id = self.step_id;
        self.session
            .with_action("memorize", |s| s.mutate(Mutation::SetStepMemory { step_id, memory }))
    }

    /// Workflow memory, then step memory, then params; later sources win.
    #[must_use]
    pub fn recall(&self) -> Record {
        let snap = &self.session.snapshot;
        let mut merged = snap.memory.clone();
        if let Some(mem) = snap.step_memory.get(&self.step_id) {
            merged.extend(mem.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        merged.extend(snap.params.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }

    /// Marks the step as failed. The workflow degrades on reconcile.
    ///
    /// # Errors
    /// Fails unless the step is active.
    pub fn fail(&mut self, message: impl Into<String>) -> WaypointResult<()> {
        self.session
            .set_step_status(self.step_id, "fail", &[StepStatus::Active], StepStatus::Error, Some(message.into()))
    }

    /// Returns a failed step to active.
    ///
    /// # Errors
    /// Fails unless the step is in error.
    pub fn recover(&mut self) -> WaypointResult<()> {
        self.session
            .set_step_status(self.step_id, "recover", &[StepStatus::Error], StepStatus::Active, None)
    }

    /// Finishes the step without completing it.
    ///
    /// # Errors
    /// Fails unless the step is active.
    pub fn ignore(&mut self) -> WaypointResult<()> {
        self.session
            .set_step_status(self.step_id, "ignore", &[StepStatus::Active], StepStatus::Ignored, None)
    }

    /// Workflow-level view, e.g. to write workflow memory from a step handler.
    pub fn workflow(&mut self) -> WorkflowState<'_> {
        WorkflowState {
            session: self.session,
        }
    }

    /// Handle on another step of the same workflow.
    ///
    /// # Errors
    /// Fails if the step does not exist.
    pub fn step(&mut self, step_id: StepId) -> WaypointResult<StepState<'_>> {
        self.session.step_data(step_id)?;
        Ok(StepState {
            session: self.session,
            step_id,
        })
    }
}

/// A transaction scope: lifecycle actions plus everything [`WorkflowState`] offers.
pub struct Transaction<'a> {
    state: WorkflowState<'a>,
}

impl<'a> Deref for Transaction<'a> {
    type Target = WorkflowState<'a>;

    fn deref(&self) -> &Self::Target {
        &self.state
    }
}

impl DerefMut for Transaction<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.state
    }
}

impl Transaction<'_> {
    fn session(&mut self) -> &mut Session {
        self.state.session
    }

    /// Id of this transaction.
    #[must_use]
    pub fn transaction_id(&self) -> TransactionId {
        self.state.session.txn
    }

    /// Starts a new workflow and runs its start hook.
    ///
    /// # Errors
    /// Fails unless the workflow is new, or if no step exists afterwards.
    pub fn start(&mut self) -> WaypointResult<()> {
        let s = self.session();
        s.ensure_status("start", &[WorkflowStatus::New])?;
        s.with_action("start", |s| {
            s.mutate(Mutation::SetState {
                patch: WorkflowPatch {
                    status: Some(WorkflowStatus::Active),
                    ts_start: Some(Utc::now()),
                    ..WorkflowPatch::default()
                },
            })?;
            let hook = s.def.hooks().on_start.clone();
            s.run_hook(hook, "hook:start")?;
            if s.snapshot.steps.is_empty() {
                return Err(ExecutionError::NoStepsAfterStart.into());
            }
            s.record_activity("start", None, Record::new());
            Ok(())
        })?;
        info!(workflow_id = %s.workflow_id(), "workflow started");
        Ok(())
    }

    /// Runs the handler a trigger resolved to.
    ///
    /// # Errors
    /// Fails unless the workflow is running, if the step cannot be
    /// resolved, or if the handler fails.
    pub fn trigger(&mut self, trigger: &WorkflowTrigger) -> WaypointResult<()> {
        let s = self.session();
        s.ensure_status("trigger", WorkflowStatus::RUNNING)?;
        s.with_action("trigger", |s| {
            let step_id = match &trigger.handler {
                Handler::Workflow(handler) => {
                    let lines = handler(&mut WorkflowState { session: &mut *s }, &trigger.data)?;
                    s.record_messages(&format!("event:{}", trigger.event), lines);
                    None
                }
                Handler::Step { step_key, handler } => {
                    let reference = trigger.step.ok_or_else(|| ExecutionError::MissingSelector {
                        event: trigger.event.clone(),
                        step_key: step_key.clone(),
                    })?;
                    let step_id = s.resolve_step(reference)?;
                    if &s.step_data(step_id)?.step_key != step_key {
                        return Err(ExecutionError::StepNotFound {
                            reference: format!("{step_key} at {reference}"),
                        }
                        .into());
                    }
                    let lines = handler(&mut StepState { session: &mut *s, step_id }, &trigger.data)?;
                    s.record_messages(&format!("step:{step_key}:{}", trigger.event), lines);
                    Some(step_id)
                }
            };
            s.record_activity("trigger", step_id, record! { "event" => trigger.event.as_str() });
            Ok(())
        })
    }

    /// Pauses a running workflow.
    ///
    /// # Errors
    /// Fails unless the workflow is running.
    pub fn pause(&mut self) -> WaypointResult<()> {
        let s = self.session();
        s.ensure_status("pause", WorkflowStatus::RUNNING)?;
        s.with_action("pause", |s| {
            let hook = s.def.hooks().on_pause.clone();
            s.run_hook(hook, "hook:pause")?;
            s.mutate(Mutation::SetState {
                patch: WorkflowPatch {
                    status: Some(WorkflowStatus::Paused),
                    ..WorkflowPatch::default()
                },
            })?;
            s.record_activity("pause", None, Record::new());
            Ok(())
        })
    }

    /// Resumes a paused workflow.
    ///
    /// # Errors
    /// Fails unless the workflow is paused.
    pub fn resume(&mut self) -> WaypointResult<()> {
        let s = self.session();
        s.ensure_status("resume", &[WorkflowStatus::Paused])?;
        s.with_action("resume", |s| {
            s.mutate(Mutation::SetState {
                patch: WorkflowPatch {
                    status: Some(WorkflowStatus::Active),
                    ..WorkflowPatch::default()
                },
            })?;
            let hook = s.def.hooks().on_resume.clone();
            s.run_hook(hook, "hook:resume")?;
            s.record_activity("resume", None, Record::new());
            Ok(())
        })
    }

    /// Cancels the workflow and every unfinished step.
    ///
    /// # Errors
    /// Fails once the workflow is terminal.
    pub fn cancel(&mut self) -> WaypointResult<()> {
        let s = self.session();
        s.ensure_status("cancel", WorkflowStatus::EDITABLE)?;
        s.with_action("cancel", |s| {
            let hook = s.def.hooks().on_cancel.clone();
            s.run_hook(hook, "hook:cancel")?;
            let now = Utc::now();
            let open: Vec<StepId> = s
                .snapshot
                .steps
                .values()
                .filter(|step| !step.is_finished())
                .map(|step| step.id)
                .collect();
            for step_id in open {
                s.mutate(Mutation::UpdateStep {
                    step_id,
                    patch: StepPatch {
                        status: Some(StepStatus::Cancelled),
                        ts_finish: Some(now),
                        ..StepPatch::default()
                    },
                })?;
            }
            s.mutate(Mutation::SetState {
                patch: WorkflowPatch {
                    status: Some(WorkflowStatus::Cancelled),
                    ts_finish: Some(now),
                    ..WorkflowPatch::default()
                },
            })?;
            s.record_activity("cancel", None, Record::new());
            Ok(())
        })?;
        info!(workflow_id = %s.workflow_id(), "workflow cancelled");
        Ok(())
    }

    /// Marks a running workflow as failed.
    ///
    /// # Errors
    /// Fails unless the workflow is running.
    pub fn abort(&mut self) -> WaypointResult<()> {
        let s = self.session();
        s.ensure_status("abort", WorkflowStatus::RUNNING)?;
        s.with_action("abort", |s| {
            let hook = s.def.hooks().on_abort.clone();
            s.run_hook(hook, "hook:abort")?;
            s.mutate(Mutation::SetState {
                patch: WorkflowPatch {
                    status: Some(WorkflowStatus::Failed),
                    ts_finish: Some(Utc::now()),
                    ..WorkflowPatch::default()
                },
            })?;
            s.record_activity("abort", None, Record::new());
            Ok(())
        })
    }

    /// Attaches `user_id` under `role`.
    ///
    /// # Errors
    /// Fails for roles the definition does not declare and for terminal workflows.
    pub fn add_participant(&mut self, role: &str, user_id: Uuid) -> WaypointResult<()> {
        let participant = self.participant(role, user_id)?;
        self.session().with_action("add_participant", |s| {
            s.mutate(Mutation::AddParticipant { participant })?;
            s.record_activity("add_participant", None, record! { "role" => role, "user_id" => user_id });
            Ok(())
        })
    }

    /// Detaches `user_id` from `role`.
    ///
    /// # Errors
    /// Fails for roles the definition does not declare and for terminal workflows.
    pub fn remove_participant(&mut self, role: &str, user_id: Uuid) -> WaypointResult<()> {
        let participant = self.participant(role, user_id)?;
        self.session().with_action("remove_participant", |s| {
            s.mutate(Mutation::RemoveParticipant { participant })?;
            s.record_activity("remove_participant", None, record! { "role" => role, "user_id" => user_id });
            Ok(())
        })
    }

    fn participant(&mut self, role: &str, user_id: Uuid) -> WaypointResult<Participant> {
        let s = self.session();
        s.ensure_status("participant", WorkflowStatus::EDITABLE)?;
        if !s.def.has_role(role) {
            return Err(ExecutionError::UnknownRole {
                process_key: s.def.key().to_string(),
                role: role.to_string(),
            }
            .into());
        }
        Ok(Participant {
            role: role.to_string(),
            user_id,
        })
    }
}

/// A workflow instance.
pub struct Workflow {
    def: Arc<WorkflowDef>,
    snapshot: WorkflowSnapshot,
    pending: PendingChanges,
    revision: u64,
    order: u64,
    max_depth: usize,
}

impl Workflow {
    /// Creates a new, unpersisted workflow in status NEW.
    pub(crate) fn create(
        def: Arc<WorkflowDef>,
        resource_name: &str,
        resource_id: Uuid,
        params: Record,
        max_depth: usize,
    ) -> WaypointResult<Self> {
        let data = WorkflowData {
            id: WorkflowId::new(),
            process_key: def.key().to_string(),
            title: def.title().to_string(),
            definition_revision: def.revision(),
            namespace: def.namespace().to_string(),
            resource_name: resource_name.to_string(),
            resource_id,
            status: WorkflowStatus::New,
            progress: 0.0,
            ts_created: Utc::now(),
            ts_start: None,
            ts_finish: None,
        };
        let mut workflow = Self {
            def,
            snapshot: WorkflowSnapshot::new(data.clone()),
            pending: PendingChanges::default(),
            revision: 0,
            order: 0,
            max_depth,
        };
        workflow.transaction(|tx| tx.session().initialize(data, params))?;
        Ok(workflow)
    }

    /// Rebuilds a workflow from its committed mutation log.
    pub(crate) fn restore(
        def: Arc<WorkflowDef>,
        log: &[MutationEnvelope],
        revision: u64,
        etag: Option<&str>,
        max_depth: usize,
    ) -> WaypointResult<Self> {
        let snapshot = WorkflowSnapshot::replay(log)?;
        if let Some(expected) = etag {
            let actual = snapshot.etag()?;
            if actual != expected {
                return Err(ExecutionError::ReplayMismatch {
                    workflow_id: *snapshot.workflow.id.as_uuid(),
                    expected: expected.to_string(),
                    actual,
                }
                .into());
            }
        }
        Ok(Self {
            def,
            order: log.last().map_or(0, |e| e.order),
            snapshot,
            pending: PendingChanges::default(),
            revision,
            max_depth,
        })
    }

    /// Runs `f` against a draft of this workflow.
    ///
    /// If `f` returns `Ok`, progress and status are reconciled from the
    /// steps and the draft replaces the live workflow. If it returns `Err`,
    /// nothing changes.
    ///
    /// # Errors
    /// Returns whatever `f` returns.
    pub fn transaction<R>(
        &mut self,
        f: impl FnOnce(&mut Transaction<'_>) -> WaypointResult<R>,
    ) -> WaypointResult<R> {
        let mut session = Session {
            def: Arc::clone(&self.def),
            snapshot: self.snapshot.clone(),
            pending: self.pending.clone(),
            order: self.order,
            txn: TransactionId::new(),
            actions: Vec::new(),
            depth: 0,
            max_depth: self.max_depth,
        };
        let mut tx = Transaction {
            state: WorkflowState {
                session: &mut session,
            },
        };
        let result = f(&mut tx).and_then(|value| tx.session().reconcile().map(|()| value));
        match result {
            Ok(value) => {
                self.snapshot = session.snapshot;
                self.pending = session.pending;
                self.order = session.order;
                Ok(value)
            }
            Err(err) => {
                debug!(workflow_id = %self.id(), transaction_id = %session.txn, error = %err, "transaction rolled back");
                Err(err)
            }
        }
    }

    /// Workflow id.
    #[must_use]
    pub fn id(&self) -> WorkflowId {
        self.snapshot.workflow.id
    }

    /// Process key.
    #[must_use]
    pub fn process_key(&self) -> &str {
        &self.snapshot.workflow.process_key
    }

    /// The definition the workflow runs.
    #[must_use]
    pub fn definition(&self) -> &WorkflowDef {
        &self.def
    }

    /// Last committed revision; 0 if never committed.
    #[must_use]
    pub const fn revision(&self) -> u64 {
        self.revision
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> WorkflowStatus {
        self.snapshot.workflow.status
    }

    /// Full snapshot.
    #[must_use]
    pub const fn snapshot(&self) -> &WorkflowSnapshot {
        &self.snapshot
    }

    /// Workflow record.
    #[must_use]
    pub const fn data(&self) -> &WorkflowData {
        &self.snapshot.workflow
    }

    /// Every step ever added, keyed by id.
    #[must_use]
    pub const fn step_id_map(&self) -> &BTreeMap<StepId, StepData> {
        &self.snapshot.steps
    }

    /// Step by id.
    #[must_use]
    pub fn step(&self, step_id: StepId) -> Option<&StepData> {
        self.snapshot.steps.get(&step_id)
    }

    /// Step a trigger's step reference points at.
    #[must_use]
    pub fn resolve(&self, step: StepRef) -> Option<&StepData> {
        match step {
            StepRef::Id(id) => self.snapshot.steps.get(&id),
            StepRef::Selector(selector) => self.snapshot.step_by_selector(selector),
        }
    }

    /// Workflow memory.
    #[must_use]
    pub const fn memory(&self) -> &Record {
        &self.snapshot.memory
    }

    /// Memory of one step.
    #[must_use]
    pub fn step_memory(&self, step_id: StepId) -> Option<&Record> {
        self.snapshot.step_memory.get(&step_id)
    }

    /// Params given at creation.
    #[must_use]
    pub const fn params(&self) -> &Record {
        &self.snapshot.params
    }

    /// Outputs, in write order.
    #[must_use]
    pub fn outputs(&self) -> &[OutputRecord] {
        &self.snapshot.outputs
    }

    /// Current participants.
    #[must_use]
    pub fn participants(&self) -> &[Participant] {
        &self.snapshot.participants
    }

    /// Uncommitted changes.
    #[must_use]
    pub const fn pending(&self) -> &PendingChanges {
        &self.pending
    }

    /// Returns true if there are uncommitted changes.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub(crate) fn take_pending(&mut self) -> PendingChanges {
        std::mem::take(&mut self.pending)
    }

    pub(crate) fn mark_committed(&mut self, revision: u64) {
        self.revision = revision;
    }
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow")
            .field("id", &self.id())
            .field("process_key", &self.process_key())
            .field("status", &self.status())
            .field("revision", &self.revision)
            .field("steps", &self.snapshot.steps.len())
            .field("pending", &self.pending.mutations.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::definition::{Stage, StepDef, Transition};

    fn definition() -> Arc<WorkflowDef> {
        let step = StepDef::builder("Review")
            .stage("S1")
            .states(["OPEN", "DONE"])
            .on_transition("DONE", |step, from| {
                Ok(vec![format!("{} done from {from}", step.step_key())])
            })
            .transition(
                "OPEN",
                Transition::new(|_, _| Ok(Vec::new())).deny_from(["DONE"]),
            )
            .build()
            .unwrap();
        let repeat = StepDef::builder("Note").multiple(true).build().unwrap();
        let once = StepDef::builder("Once").build().unwrap();
        let def = WorkflowDef::builder("review")
            .stage(Stage::new("S1", "Stage 1"))
            .step(step)
            .step(repeat)
            .step(once)
            .on_start(|wf| {
                wf.add_step("Review")?;
                Ok(vec!["started".to_string()])
            })
            .build()
            .unwrap();
        Arc::new(def)
    }

    fn started() -> Workflow {
        let mut wf = Workflow::create(definition(), "doc", Uuid::new_v4(), Record::new(), 16).unwrap();
        wf.transaction(|tx| tx.start()).unwrap();
        wf
    }

    fn review_id(wf: &Workflow) -> StepId {
        StepId::derive(wf.id(), "Review")
    }

    #[test]
    fn test_create_records_initialization() {
        let wf = Workflow::create(definition(), "doc", Uuid::new_v4(), record! { "p" => 1 }, 16).unwrap();
        assert_eq!(wf.status(), WorkflowStatus::New);
        assert_eq!(wf.snapshot().stages.len(), 1);
        let kinds: Vec<_> = wf.pending().mutations.iter().map(|m| m.mutation.name()).collect();
        assert_eq!(kinds, vec!["initialize-workflow", "set-params", "add-stage"]);
        assert_eq!(wf.pending().mutations[0].order, 1);
    }

    #[test]
    fn test_start_runs_hook() {
        let wf = started();
        assert_eq!(wf.status(), WorkflowStatus::Active);
        assert_eq!(wf.step_id_map().len(), 1);
        assert!(wf.pending().messages.iter().any(|m| m.content == "started"));
    }

    #[test]
    fn test_start_requires_a_step() {
        let def = Arc::new(WorkflowDef::builder("empty").build().unwrap());
        let mut wf = Workflow::create(def, "doc", Uuid::new_v4(), Record::new(), 16).unwrap();
        let err = wf.transaction(|tx| tx.start()).unwrap_err();
        assert!(matches!(err, WaypointError::Execution(ExecutionError::NoStepsAfterStart)));
        assert_eq!(wf.status(), WorkflowStatus::New);
    }

    #[test]
    fn test_rollback_discards_everything() {
        let mut wf = started();
        let before = wf.pending().clone();
        let result: WaypointResult<()> = wf.transaction(|tx| {
            tx.add_step("Note")?;
            tx.memorize(record! { "k" => 1 })?;
            Err(WaypointError::handler("abort"))
        });
        assert!(result.is_err());
        assert_eq!(wf.step_id_map().len(), 1);
        assert!(wf.memory().is_empty());
        assert_eq!(wf.pending(), &before);
    }

    #[test]
    fn test_non_multiple_step_added_twice_fails() {
        let mut wf = started();
        wf.transaction(|tx| tx.add_step("Once").map(|_| ())).unwrap();
        let err = wf.transaction(|tx| tx.add_step("Once")).unwrap_err();
        assert!(matches!(err, WaypointError::Execution(ExecutionError::DuplicateStep { .. })));
    }

    #[test]
    fn test_multiple_steps_get_distinct_ids() {
        let mut wf = started();
        let (a, b) = wf
            .transaction(|tx| Ok((tx.add_step("Note")?, tx.add_step("Note")?)))
            .unwrap();
        assert_ne!(a, b);
        assert_eq!(wf.step(a).unwrap().instance_key, "Note-1");
        assert_eq!(wf.step(b).unwrap().instance_key, "Note-2");
        assert_eq!(wf.step(a).unwrap().src_step, Some(*wf.id().as_uuid()));
    }

    #[test]
    fn test_duplicate_selector_fails() {
        let mut wf = started();
        let sel = Uuid::new_v4();
        let err = wf
            .transaction(|tx| {
                tx.add_step(NewStep::new("Note").selector(sel))?;
                tx.add_step(NewStep::new("Note").selector(sel))
            })
            .unwrap_err();
        assert!(matches!(err, WaypointError::Execution(ExecutionError::DuplicateSelector { .. })));
    }

    #[test]
    fn test_transit_runs_hook_with_origin() {
        let mut wf = started();
        let id = review_id(&wf);
        wf.transaction(|tx| tx.step(id)?.transit("DONE")).unwrap();
        assert_eq!(wf.step(id).unwrap().state, "DONE");
        assert!(wf
            .pending()
            .messages
            .iter()
            .any(|m| m.content == format!("Review done from {INITIAL_STATE}")));
    }

    #[test]
    fn test_denied_origin() {
        let mut wf = started();
        let id = review_id(&wf);
        wf.transaction(|tx| tx.step(id)?.transit("DONE")).unwrap();
        let err = wf.transaction(|tx| tx.step(id)?.transit("OPEN")).unwrap_err();
        assert!(matches!(err, WaypointError::Execution(ExecutionError::OriginNotAllowed { .. })));
    }

    #[test]
    fn test_finish_completes_step_and_rejects_further_transit() {
        let mut wf = started();
        let id = review_id(&wf);
        wf.transaction(|tx| {
            tx.add_step("Note")?;
            tx.step(id)?.transit(FINISH_STATE)
        })
        .unwrap();
        let step = wf.step(id).unwrap();
        assert_eq!(step.status, StepStatus::Completed);
        assert!(step.ts_finish.is_some());
        assert_eq!(wf.status(), WorkflowStatus::Active);

        let err = wf.transaction(|tx| tx.step(id)?.transit("OPEN")).unwrap_err();
        assert!(matches!(err, WaypointError::Execution(ExecutionError::TransitionFromFinished { .. })));
    }

    #[test]
    fn test_same_state_transit_is_noop() {
        let mut wf = started();
        let id = review_id(&wf);
        wf.transaction(|tx| tx.step(id)?.transit("OPEN")).unwrap();
        let count = wf.pending().mutations.len();
        wf.transaction(|tx| tx.step(id)?.transit("OPEN")).unwrap();
        assert_eq!(wf.pending().mutations.len(), count);
    }

    #[test]
    fn test_chained_transitions_are_bounded() {
        let step = StepDef::builder("Loop")
            .states(["A", "B"])
            .on_transition("A", |s, _| s.transit("B").map(|()| Vec::new()))
            .on_transition("B", |s, _| s.transit("A").map(|()| Vec::new()))
            .build()
            .unwrap();
        let def = WorkflowDef::builder("loop")
            .step(step)
            .on_start(|wf| wf.add_step("Loop").map(|_| Vec::new()))
            .build()
            .unwrap();
        let mut wf = Workflow::create(Arc::new(def), "doc", Uuid::new_v4(), Record::new(), 4).unwrap();
        wf.transaction(|tx| tx.start()).unwrap();
        let id = StepId::derive(wf.id(), "Loop");
        let err = wf.transaction(|tx| tx.step(id)?.transit("A")).unwrap_err();
        assert!(matches!(err, WaypointError::Execution(ExecutionError::TransitionDepthExceeded { limit: 4 })));
        assert_eq!(wf.step(id).unwrap().state, INITIAL_STATE);
    }

    #[test]
    fn test_reconcile_completes_workflow_and_stage() {
        let mut wf = started();
        let id = review_id(&wf);
        wf.transaction(|tx| tx.step(id)?.transit(FINISH_STATE)).unwrap();
        assert_eq!(wf.status(), WorkflowStatus::Completed);
        assert!(wf.data().ts_finish.is_some());
        assert!((wf.data().progress - 1.0).abs() < f64::EPSILON);
        assert_eq!(wf.snapshot().stages[0].status, StageStatus::Completed);
    }

    #[test]
    fn test_fail_degrades_and_recover_restores() {
        let mut wf = started();
        let id = review_id(&wf);
        wf.transaction(|tx| tx.step(id)?.fail("broken")).unwrap();
        assert_eq!(wf.status(), WorkflowStatus::Degraded);
        assert_eq!(wf.step(id).unwrap().message.as_deref(), Some("broken"));

        wf.transaction(|tx| tx.step(id)?.recover()).unwrap();
        assert_eq!(wf.status(), WorkflowStatus::Active);
    }

    #[test]
    fn test_unchanged_transaction_adds_nothing() {
        let mut wf = started();
        let count = wf.pending().mutations.len();
        wf.transaction(|tx| Ok(tx.recall())).unwrap();
        assert_eq!(wf.pending().mutations.len(), count);
    }

    #[test]
    fn test_recall_layers() {
        let mut wf = Workflow::create(definition(), "doc", Uuid::new_v4(), record! { "k" => "param" }, 16).unwrap();
        wf.transaction(|tx| tx.start()).unwrap();
        let id = review_id(&wf);
        let recalled = wf
            .transaction(|tx| {
                tx.memorize(record! { "k" => "wf", "a" => 1 })?;
                let mut step = tx.step(id)?;
                step.memorize(record! { "a" => 2, "b" => 3 })?;
                Ok(step.recall())
            })
            .unwrap();
        assert_eq!(recalled, record! { "k" => "param", "a" => 2, "b" => 3 });
    }

    #[test]
    fn test_pause_resume_cancel() {
        let mut wf = started();
        wf.transaction(|tx| tx.pause()).unwrap();
        assert_eq!(wf.status(), WorkflowStatus::Paused);
        assert!(wf.transaction(|tx| tx.add_step("Note")).is_err());

        wf.transaction(|tx| tx.resume()).unwrap();
        assert_eq!(wf.status(), WorkflowStatus::Active);

        wf.transaction(|tx| tx.cancel()).unwrap();
        assert_eq!(wf.status(), WorkflowStatus::Cancelled);
        assert!(wf.step_id_map().values().all(|s| s.status == StepStatus::Cancelled));
        assert!(wf.transaction(|tx| tx.cancel()).is_err());
    }

    #[test]
    fn test_participants_require_declared_role() {
        let def = WorkflowDef::builder("p")
            .role(crate::workflow::definition::Role::new("Reviewer", "Reviewer"))
            .build()
            .unwrap();
        let mut wf = Workflow::create(Arc::new(def), "doc", Uuid::new_v4(), Record::new(), 16).unwrap();
        let user = Uuid::new_v4();
        wf.transaction(|tx| tx.add_participant("Reviewer", user)).unwrap();
        assert_eq!(wf.participants().len(), 1);
        assert!(wf.transaction(|tx| tx.add_participant("Ghost", user)).is_err());
        wf.transaction(|tx| tx.remove_participant("Reviewer", user)).unwrap();
        assert!(wf.participants().is_empty());
    }

    #[test]
    fn test_restore_replays_log_and_checks_etag() {
        let mut wf = started();
        let log = wf.take_pending().mutations;
        let etag = wf.snapshot().etag().unwrap();

        let restored = Workflow::restore(definition(), &log, 1, Some(&etag), 16).unwrap();
        assert_eq!(restored.snapshot(), wf.snapshot());
        assert_eq!(restored.revision(), 1);

        let err = Workflow::restore(definition(), &log, 1, Some("bogus"), 16).unwrap_err();
        assert!(matches!(err, WaypointError::Execution(ExecutionError::ReplayMismatch { .. })));
    }
}
