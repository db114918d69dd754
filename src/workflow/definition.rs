//! Workflow definitions.
//!
//! A [`WorkflowDef`] declares the stages, roles and step types of a process
//! plus the handlers that react to events. Definitions are built once at
//! startup with explicit builders and registered with the manager.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::Serialize;

use crate::error::{ValidationError, WaypointResult};
use crate::workflow::model::FINISH_STATE;
use crate::workflow::router::EventData;
use crate::workflow::runner::{StepState, WorkflowState};

/// Lines yielded by a handler, recorded as workflow messages.
pub type Messages = Vec<String>;

/// Handler for an event routed to the workflow itself.
pub type WorkflowHandler = Arc<dyn Fn(&mut WorkflowState<'_>, &EventData) -> WaypointResult<Messages> + Send + Sync>;

/// Handler for an event routed to one step.
pub type StepHandler = Arc<dyn Fn(&mut StepState<'_>, &EventData) -> WaypointResult<Messages> + Send + Sync>;

/// Runs after a step enters a state. Receives the previous state.
pub type TransitionHook = Arc<dyn Fn(&mut StepState<'_>, &str) -> WaypointResult<Messages> + Send + Sync>;

/// Workflow lifecycle hook (start, pause, resume, cancel, abort).
pub type LifecycleHook = Arc<dyn Fn(&mut WorkflowState<'_>) -> WaypointResult<Messages> + Send + Sync>;

const STATE_LABEL_PATTERN: &str = r"^[A-Z][A-Z0-9_]*$";

static STATE_LABEL: OnceLock<Option<Regex>> = OnceLock::new();

fn is_valid_label(label: &str) -> bool {
    STATE_LABEL
        .get_or_init(|| Regex::new(STATE_LABEL_PATTERN).ok())
        .as_ref()
        .is_some_and(|re| re.is_match(label))
}

/// Grouping metadata for steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stage {
    /// Unique key within the definition.
    pub key: String,
    /// Display title.
    pub title: String,
    /// Free-form kind, `general` by default.
    pub kind: String,
    /// Sort order.
    pub order: i32,
    /// Optional description.
    pub description: Option<String>,
}

impl Stage {
    /// Creates a stage of kind `general` at order 0.
    #[must_use]
    pub fn new(key: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            title: title.into(),
            kind: "general".to_string(),
            order: 0,
            description: None,
        }
    }

    /// Sets the stage kind.
    #[must_use]
    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    /// Sets the sort order.
    #[must_use]
    pub const fn order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    /// Sets the description.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// A participant role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Role {
    /// Unique key within the definition.
    pub key: String,
    /// Display title.
    pub title: String,
}

impl Role {
    /// Creates a role.
    #[must_use]
    pub fn new(key: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            title: title.into(),
        }
    }
}

/// An event handler declaration.
#[derive(Clone)]
pub(crate) struct EventBinding<H> {
    pub(crate) event: String,
    pub(crate) priority: i32,
    pub(crate) handler: H,
}

/// Hook plus origin restrictions for entering one state.
#[derive(Clone)]
pub struct Transition {
    allowed_origins: Vec<String>,
    denied_origins: Vec<String>,
    hook: TransitionHook,
}

impl Transition {
    /// Wraps a transition hook. The hook gets the step and the origin state.
    pub fn new<F>(hook: F) -> Self
    where
        F: Fn(&mut StepState<'_>, &str) -> WaypointResult<Messages> + Send + Sync + 'static,
    {
        Self {
            allowed_origins: Vec::new(),
            denied_origins: Vec::new(),
            hook: Arc::new(hook),
        }
    }

    /// Only these origin states may enter. Empty means any.
    #[must_use]
    pub fn allow_from<I, S>(mut self, origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_origins = origins.into_iter().map(Into::into).collect();
        self
    }

    /// These origin states may not enter.
    #[must_use]
    pub fn deny_from<I, S>(mut self, origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.denied_origins = origins.into_iter().map(Into::into).collect();
        self
    }

    /// Returns true if entering from `origin` is permitted.
    #[must_use]
    pub fn permits(&self, origin: &str) -> bool {
        let allowed = self.allowed_origins.is_empty() || self.allowed_origins.iter().any(|o| o == origin);
        allowed && !self.denied_origins.iter().any(|o| o == origin)
    }

    pub(crate) fn hook(&self) -> TransitionHook {
        Arc::clone(&self.hook)
    }
}

/// A step type.
#[derive(Clone)]
pub struct StepDef {
    key: String,
    title: String,
    stage: Option<String>,
    states: Vec<String>,
    multiple: bool,
    handlers: Vec<EventBinding<StepHandler>>,
    transitions: BTreeMap<String, Transition>,
}

impl StepDef {
    /// Starts a step type with the given key. The title defaults to the key.
    #[must_use]
    pub fn builder(key: impl Into<String>) -> StepDefBuilder {
        let key = key.into();
        StepDefBuilder {
            title: key.clone(),
            key,
            stage: None,
            states: Vec::new(),
            multiple: false,
            handlers: Vec::new(),
            transitions: Vec::new(),
        }
    }

    /// Step type key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Display title.
    #[must_use]
    pub fn title(&self) -> &str {
        &self.title
    }

    /// Stage the step type belongs to.
    #[must_use]
    pub fn stage(&self) -> Option<&str> {
        self.stage.as_deref()
    }

    /// Declared state labels, in declaration order.
    #[must_use]
    pub fn states(&self) -> &[String] {
        &self.states
    }

    /// Whether the type may be instantiated more than once per workflow.
    #[must_use]
    pub const fn is_multiple(&self) -> bool {
        self.multiple
    }

    /// Returns true if `label` is declared or is the finish state.
    #[must_use]
    pub fn accepts_state(&self, label: &str) -> bool {
        label == FINISH_STATE || self.states.iter().any(|s| s == label)
    }

    /// Transition registered for entering `label`.
    #[must_use]
    pub fn transition(&self, label: &str) -> Option<&Transition> {
        self.transitions.get(label)
    }

    pub(crate) fn handlers(&self) -> &[EventBinding<StepHandler>] {
        &self.handlers
    }
}

impl fmt::Debug for StepDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDef")
            .field("key", &self.key)
            .field("states", &self.states)
            .field("multiple", &self.multiple)
            .field("handlers", &self.handlers.len())
            .field("transitions", &self.transitions.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Builder for [`StepDef`].
pub struct StepDefBuilder {
    key: String,
    title: String,
    stage: Option<String>,
    states: Vec<String>,
    multiple: bool,
    handlers: Vec<EventBinding<StepHandler>>,
    transitions: Vec<(String, Transition)>,
}

impl StepDefBuilder {
    /// Sets the display title.
    #[must_use]
    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Places the step type in a declared stage.
    #[must_use]
    pub fn stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    /// Declares the step's state labels.
    #[must_use]
    pub fn states<I, S>(mut self, states: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.states = states.into_iter().map(Into::into).collect();
        self
    }

    /// Allows more than one instance per workflow.
    #[must_use]
    pub const fn multiple(mut self, multiple: bool) -> Self {
        self.multiple = multiple;
        self
    }

    /// Handles `event` for the step addressed by the event's selector.
    #[must_use]
    pub fn on_event<F>(mut self, event: impl Into<String>, priority: i32, handler: F) -> Self
    where
        F: Fn(&mut StepState<'_>, &EventData) -> WaypointResult<Messages> + Send + Sync + 'static,
    {
        self.handlers.push(EventBinding {
            event: event.into(),
            priority,
            handler: Arc::new(handler),
        });
        self
    }

    /// Runs `hook` whenever the step enters `state`.
    #[must_use]
    pub fn on_transition<F>(self, state: impl Into<String>, hook: F) -> Self
    where
        F: Fn(&mut StepState<'_>, &str) -> WaypointResult<Messages> + Send + Sync + 'static,
    {
        self.transition(state, Transition::new(hook))
    }

    /// Registers a transition with origin restrictions.
    #[must_use]
    pub fn transition(mut self, state: impl Into<String>, transition: Transition) -> Self {
        self.transitions.push((state.into(), transition));
        self
    }

    /// Validates labels and transitions.
    ///
    /// # Errors
    /// Fails on malformed or duplicate labels, transitions to undeclared
    /// states, and duplicate transitions.
    pub fn build(self) -> Result<StepDef, ValidationError> {
        let mut seen = HashSet::new();
        for label in &self.states {
            if !is_valid_label(label) {
                return Err(ValidationError::InvalidStateLabel {
                    label: label.clone(),
                });
            }
            if !seen.insert(label.as_str()) {
                return Err(ValidationError::DuplicateKey {
                    kind: "state",
                    key: label.clone(),
                });
            }
        }

        let mut transitions = BTreeMap::new();
        for (state, transition) in self.transitions {
            if state != FINISH_STATE && !seen.contains(state.as_str()) {
                return Err(ValidationError::UndeclaredTransition {
                    step: self.key,
                    state,
                });
            }
            if transitions.contains_key(&state) {
                return Err(ValidationError::DuplicateTransition {
                    step: self.key,
                    state,
                });
            }
            transitions.insert(state, transition);
        }

        Ok(StepDef {
            key: self.key,
            title: self.title,
            stage: self.stage,
            states: self.states,
            multiple: self.multiple,
            handlers: self.handlers,
            transitions,
        })
    }
}

/// Lifecycle hooks a workflow may declare.
#[derive(Clone, Default)]
pub(crate) struct Hooks {
    pub(crate) on_start: Option<LifecycleHook>,
    pub(crate) on_pause: Option<LifecycleHook>,
    pub(crate) on_resume: Option<LifecycleHook>,
    pub(crate) on_cancel: Option<LifecycleHook>,
    pub(crate) on_abort: Option<LifecycleHook>,
}

/// A workflow process definition.
#[derive(Clone)]
pub struct WorkflowDef {
    key: String,
    title: String,
    revision: u32,
    namespace: String,
    stages: Vec<Stage>,
    roles: Vec<Role>,
    steps: BTreeMap<String, StepDef>,
    handlers: Vec<EventBinding<WorkflowHandler>>,
    hooks: Hooks,
}

impl WorkflowDef {
    /// Starts a definition with the given process key.
    #[must_use]
    pub fn builder(key: impl Into<String>) -> WorkflowDefBuilder {
        let key = key.into();
        WorkflowDefBuilder {
            title: key.clone(),
            key,
            revision: 0,
            namespace: "generic".to_string(),
            stages: Vec::new(),
            roles: Vec::new(),
            steps: Vec::new(),
            handlers: Vec::new(),
            hooks: Hooks::default(),
        }
    }

    /// The process key workflows of this definition are created under.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Display title.
    #[must_use]
    pub fn title(&self) -> &str {
        &self.title
    }

    /// Definition revision, stored on every workflow created from it.
    #[must_use]
    pub const fn revision(&self) -> u32 {
        self.revision
    }

    /// Namespace, `generic` by default.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Declared stages, in declaration order.
    #[must_use]
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Declared roles.
    #[must_use]
    pub fn roles(&self) -> &[Role] {
        &self.roles
    }

    /// Step type by key.
    #[must_use]
    pub fn step(&self, key: &str) -> Option<&StepDef> {
        self.steps.get(key)
    }

    /// Step types, ordered by key.
    pub fn steps(&self) -> impl Iterator<Item = &StepDef> {
        self.steps.values()
    }

    /// Returns true if `role` is declared.
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r.key == role)
    }

    pub(crate) fn handlers(&self) -> &[EventBinding<WorkflowHandler>] {
        &self.handlers
    }

    pub(crate) const fn hooks(&self) -> &Hooks {
        &self.hooks
    }

    /// Serializable description of this definition.
    #[must_use]
    pub fn info(&self) -> WorkflowDefInfo {
        WorkflowDefInfo {
            key: self.key.clone(),
            title: self.title.clone(),
            revision: self.revision,
            namespace: self.namespace.clone(),
            stages: self.stages.clone(),
            roles: self.roles.clone(),
            steps: self
                .steps
                .values()
                .map(|s| StepDefInfo {
                    key: s.key.clone(),
                    title: s.title.clone(),
                    stage: s.stage.clone(),
                    states: s.states.clone(),
                    multiple: s.multiple,
                })
                .collect(),
        }
    }
}

impl fmt::Debug for WorkflowDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowDef")
            .field("key", &self.key)
            .field("revision", &self.revision)
            .field("steps", &self.steps.values().collect::<Vec<_>>())
            .field("handlers", &self.handlers.len())
            .finish_non_exhaustive()
    }
}

/// Builder for [`WorkflowDef`].
pub struct WorkflowDefBuilder {
    key: String,
    title: String,
    revision: u32,
    namespace: String,
    stages: Vec<Stage>,
    roles: Vec<Role>,
    steps: Vec<StepDef>,
    handlers: Vec<EventBinding<WorkflowHandler>>,
    hooks: Hooks,
}

impl WorkflowDefBuilder {
    /// Sets the display title.
    #[must_use]
    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Sets the definition revision.
    #[must_use]
    pub const fn revision(mut self, revision: u32) -> Self {
        self.revision = revision;
        self
    }

    /// Sets the namespace.
    #[must_use]
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Declares a stage.
    #[must_use]
    pub fn stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    /// Declares a participant role.
    #[must_use]
    pub fn role(mut self, role: Role) -> Self {
        self.roles.push(role);
        self
    }

    /// Adds a step type.
    #[must_use]
    pub fn step(mut self, step: StepDef) -> Self {
        self.steps.push(step);
        self
    }

    /// Handles `event` at workflow level.
    #[must_use]
    pub fn on_event<F>(mut self, event: impl Into<String>, priority: i32, handler: F) -> Self
    where
        F: Fn(&mut WorkflowState<'_>, &EventData) -> WaypointResult<Messages> + Send + Sync + 'static,
    {
        self.handlers.push(EventBinding {
            event: event.into(),
            priority,
            handler: Arc::new(handler),
        });
        self
    }

    /// Runs when the workflow starts. Usually adds the first steps.
    #[must_use]
    pub fn on_start<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut WorkflowState<'_>) -> WaypointResult<Messages> + Send + Sync + 'static,
    {
        self.hooks.on_start = Some(Arc::new(hook));
        self
    }

    /// Runs when the workflow is paused.
    #[must_use]
    pub fn on_pause<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut WorkflowState<'_>) -> WaypointResult<Messages> + Send + Sync + 'static,
    {
        self.hooks.on_pause = Some(Arc::new(hook));
        self
    }

    /// Runs when a paused workflow resumes.
    #[must_use]
    pub fn on_resume<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut WorkflowState<'_>) -> WaypointResult<Messages> + Send + Sync + 'static,
    {
        self.hooks.on_resume = Some(Arc::new(hook));
        self
    }

    /// Runs when the workflow is cancelled.
    #[must_use]
    pub fn on_cancel<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut WorkflowState<'_>) -> WaypointResult<Messages> + Send + Sync + 'static,
    {
        self.hooks.on_cancel = Some(Arc::new(hook));
        self
    }

    /// Runs when the workflow is aborted.
    #[must_use]
    pub fn on_abort<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut WorkflowState<'_>) -> WaypointResult<Messages> + Send + Sync + 'static,
    {
        self.hooks.on_abort = Some(Arc::new(hook));
        self
    }

    /// Checks keys and cross references.
    ///
    /// # Errors
    /// Fails on duplicate stage, role or step keys and on steps referencing
    /// undeclared stages.
    pub fn build(self) -> Result<WorkflowDef, ValidationError> {
        let mut stage_keys = HashSet::new();
        for stage in &self.stages {
            if !stage_keys.insert(stage.key.as_str()) {
                return Err(ValidationError::DuplicateKey {
                    kind: "stage",
                    key: stage.key.clone(),
                });
            }
        }

        let mut role_keys = HashSet::new();
        for role in &self.roles {
            if !role_keys.insert(role.key.as_str()) {
                return Err(ValidationError::DuplicateKey {
                    kind: "role",
                    key: role.key.clone(),
                });
            }
        }

        let mut steps = BTreeMap::new();
        for step in self.steps {
            if let Some(stage) = step.stage.as_deref() {
                if !stage_keys.contains(stage) {
                    return Err(ValidationError::UnknownStage {
                        step: step.key.clone(),
                        stage: stage.to_string(),
                    });
                }
            }
            if steps.contains_key(&step.key) {
                return Err(ValidationError::DuplicateKey {
                    kind: "step",
                    key: step.key,
                });
            }
            steps.insert(step.key.clone(), step);
        }

        Ok(WorkflowDef {
            key: self.key,
            title: self.title,
            revision: self.revision,
            namespace: self.namespace,
            stages: self.stages,
            roles: self.roles,
            steps,
            handlers: self.handlers,
            hooks: self.hooks,
        })
    }
}

/// Serializable summary of a workflow definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkflowDefInfo {
    /// Process key.
    pub key: String,
    /// Display title.
    pub title: String,
    /// Definition revision.
    pub revision: u32,
    /// Namespace.
    pub namespace: String,
    /// Declared stages.
    pub stages: Vec<Stage>,
    /// Declared roles.
    pub roles: Vec<Role>,
    /// Step types, ordered by key.
    pub steps: Vec<StepDefInfo>,
}

/// Serializable summary of a step type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepDefInfo {
    /// Step type key.
    pub key: String,
    /// Display title.
    pub title: String,
    /// Stage key, if any.
    pub stage: Option<String>,
    /// Declared state labels.
    pub states: Vec<String>,
    /// Whether several instances are allowed.
    pub multiple: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_hook(_: &mut StepState<'_>, _: &str) -> WaypointResult<Messages> {
        Ok(Vec::new())
    }

    #[test]
    fn test_state_labels_validated() {
        assert!(is_valid_label("MOON"));
        assert!(is_valid_label("STEP_2"));
        assert!(!is_valid_label("moon"));
        assert!(!is_valid_label("2ND"));

        let err = StepDef::builder("s").states(["TAKE", "bad"]).build().unwrap_err();
        assert!(matches!(err, ValidationError::InvalidStateLabel { .. }));

        let err = StepDef::builder("s").states(["TAKE", "TAKE"]).build().unwrap_err();
        assert!(matches!(err, ValidationError::DuplicateKey { kind: "state", .. }));
    }

    #[test]
    fn test_transition_must_target_declared_state() {
        let err = StepDef::builder("s")
            .states(["TAKE"])
            .on_transition("MOON", noop_hook)
            .build()
            .unwrap_err();
        assert!(matches!(err, ValidationError::UndeclaredTransition { .. }));

        let ok = StepDef::builder("s")
            .states(["TAKE"])
            .on_transition(FINISH_STATE, noop_hook)
            .build();
        assert!(ok.is_ok());
    }

    #[test]
    fn test_duplicate_transition_rejected() {
        let err = StepDef::builder("s")
            .states(["TAKE"])
            .on_transition("TAKE", noop_hook)
            .on_transition("TAKE", noop_hook)
            .build()
            .unwrap_err();
        assert!(matches!(err, ValidationError::DuplicateTransition { .. }));
    }

    #[test]
    fn test_transition_origins() {
        let t = Transition::new(noop_hook).allow_from(["A", "B"]).deny_from(["B"]);
        assert!(t.permits("A"));
        assert!(!t.permits("B"));
        assert!(!t.permits("C"));
        assert!(Transition::new(noop_hook).permits("anything"));
    }

    #[test]
    fn test_step_stage_must_exist() {
        let step = StepDef::builder("Step01").stage("Missing").build().unwrap();
        let err = WorkflowDef::builder("p").step(step).build().unwrap_err();
        assert!(matches!(err, ValidationError::UnknownStage { .. }));
    }

    #[test]
    fn test_duplicate_step_key_rejected() {
        let a = StepDef::builder("Step01").build().unwrap();
        let b = StepDef::builder("Step01").build().unwrap();
        let err = WorkflowDef::builder("p").step(a).step(b).build().unwrap_err();
        assert!(matches!(err, ValidationError::DuplicateKey { kind: "step", .. }));
    }

    #[test]
    fn test_info_lists_steps() {
        let def = WorkflowDef::builder("sample-process")
            .title("Sample")
            .revision(3)
            .stage(Stage::new("Stage01", "Stage 01"))
            .role(Role::new("Role01", "Role 01"))
            .step(
                StepDef::builder("Step03")
                    .stage("Stage01")
                    .states(["TAKE", "MOON"])
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap();
        let info = def.info();
        assert_eq!(info.revision, 3);
        assert_eq!(info.steps.len(), 1);
        assert_eq!(info.steps[0].states, vec!["TAKE", "MOON"]);
        assert!(serde_json::to_string(&info).unwrap().contains("Stage01"));
        assert!(def.has_role("Role01"));
    }
}
