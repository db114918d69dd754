//! Event routing.
//!
//! The [`EventRouter`] maps an event name to the handlers declared for it
//! by registered workflow definitions, and resolves which workflow instance
//! (and step) each handler should run against. It is built once at startup
//! and shared with the manager by `Arc`.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{ExecutionError, WaypointError, WaypointResult};
use crate::value::Record;
use crate::workflow::definition::{StepHandler, WorkflowDef, WorkflowHandler};
use crate::workflow::model::{StepId, WorkflowId};

fn lock_err(context: &'static str) -> WaypointError {
    WaypointError::internal(format!("poisoned lock: {context}"))
}

/// An external event's routing fields plus its payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventData {
    /// Resource the event concerns, routed together with `resource_id`.
    pub resource_name: Option<String>,
    /// Id of that resource.
    pub resource_id: Option<Uuid>,
    /// Takes precedence over the resource fields.
    pub workflow_id: Option<WorkflowId>,
    /// Step addressed by id. Takes precedence over `step_selector`.
    pub step_id: Option<StepId>,
    /// Step addressed by selector.
    pub step_selector: Option<Uuid>,
    /// Handler input; not used for routing.
    pub payload: Record,
}

impl EventData {
    /// Event addressed to the workflow bound to a resource.
    #[must_use]
    pub fn for_resource(resource_name: impl Into<String>, resource_id: Uuid) -> Self {
        Self {
            resource_name: Some(resource_name.into()),
            resource_id: Some(resource_id),
            ..Self::default()
        }
    }

    /// Event addressed to a workflow by id.
    #[must_use]
    pub fn for_workflow(workflow_id: WorkflowId) -> Self {
        Self {
            workflow_id: Some(workflow_id),
            ..Self::default()
        }
    }

    /// Addresses a step by selector.
    #[must_use]
    pub const fn selector(mut self, selector: Uuid) -> Self {
        self.step_selector = Some(selector);
        self
    }

    /// Addresses a step by id.
    #[must_use]
    pub const fn step(mut self, step_id: StepId) -> Self {
        self.step_id = Some(step_id);
        self
    }

    /// Sets the handler input.
    #[must_use]
    pub fn payload(mut self, payload: Record) -> Self {
        self.payload = payload;
        self
    }
}

/// Which workflow instance a trigger addresses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkflowRef {
    /// The latest workflow attached to a resource.
    Resource {
        /// Resource name.
        name: String,
        /// Resource id.
        id: Uuid,
    },
    /// A workflow by id.
    Id(WorkflowId),
}

impl fmt::Display for WorkflowRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resource { name, id } => write!(f, "{name}/{id}"),
            Self::Id(id) => write!(f, "{id}"),
        }
    }
}

/// Which step a step-scoped trigger addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepRef {
    /// The step owning this selector.
    Selector(Uuid),
    /// The step with this id.
    Id(StepId),
}

impl fmt::Display for StepRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Selector(s) => write!(f, "selector {s}"),
            Self::Id(id) => write!(f, "id {id}"),
        }
    }
}

/// Output of a route function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTarget {
    /// Workflow to run on.
    pub workflow: WorkflowRef,
    /// Step to run on; required by step handlers.
    pub step: Option<StepRef>,
}

/// Resolves an event to a target. `None` skips the binding for this event.
pub type RouteFn = Arc<dyn Fn(&EventData) -> Option<RouteTarget> + Send + Sync>;

/// Routing used when no custom route is installed.
///
/// Prefers `workflow_id`, then `resource_name`/`resource_id`. Steps are
/// addressed by `step_id`, then `step_selector`.
#[must_use]
pub fn default_route(data: &EventData) -> Option<RouteTarget> {
    let workflow = match (&data.workflow_id, &data.resource_name, data.resource_id) {
        (Some(id), _, _) => WorkflowRef::Id(*id),
        (None, Some(name), Some(id)) => WorkflowRef::Resource {
            name: name.clone(),
            id,
        },
        _ => return None,
    };
    let step = data
        .step_id
        .map(StepRef::Id)
        .or_else(|| data.step_selector.map(StepRef::Selector));
    Some(RouteTarget { workflow, step })
}

#[derive(Clone)]
pub(crate) enum Handler {
    Workflow(WorkflowHandler),
    Step { step_key: String, handler: StepHandler },
}

#[derive(Clone)]
struct Binding {
    seq: u64,
    process_key: String,
    priority: i32,
    handler: Handler,
}

/// One handler invocation resolved from an event.
#[derive(Clone)]
pub struct WorkflowTrigger {
    /// Event name.
    pub event: String,
    /// Process key of the handler.
    pub process_key: String,
    /// Handler priority; lower runs first.
    pub priority: i32,
    /// Workflow to run on.
    pub workflow: WorkflowRef,
    /// Step to run on, for step handlers.
    pub step: Option<StepRef>,
    /// The event data.
    pub data: EventData,
    pub(crate) handler: Handler,
}

impl WorkflowTrigger {
    /// Step type the trigger targets, `None` for workflow-level handlers.
    #[must_use]
    pub fn step_key(&self) -> Option<&str> {
        match &self.handler {
            Handler::Workflow(_) => None,
            Handler::Step { step_key, .. } => Some(step_key),
        }
    }
}

impl fmt::Debug for WorkflowTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowTrigger")
            .field("event", &self.event)
            .field("process_key", &self.process_key)
            .field("priority", &self.priority)
            .field("workflow", &self.workflow)
            .field("step_key", &self.step_key())
            .field("step", &self.step)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct RoutingTable {
    next_seq: u64,
    bindings: HashMap<String, Vec<Binding>>,
    routes: HashMap<(String, String), RouteFn>,
}

impl RoutingTable {
    fn insert(&mut self, event: &str, process_key: &str, priority: i32, handler: Handler) {
        self.next_seq += 1;
        let entries = self.bindings.entry(event.to_string()).or_default();
        entries.push(Binding {
            seq: self.next_seq,
            process_key: process_key.to_string(),
            priority,
            handler,
        });
        entries.sort_by_key(|b| (b.priority, b.seq));
        if entries.len() > 1 {
            warn!(event, handlers = entries.len(), "multiple handlers registered for event");
        }
    }
}

/// Routing table from event names to handlers.
#[derive(Default)]
pub struct EventRouter {
    table: RwLock<RoutingTable>,
}

impl EventRouter {
    /// Creates a router with no bindings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers every handler of `def`.
    ///
    /// Workflow-level handlers are registered before step handlers, so on
    /// equal priority the workflow handler runs first.
    ///
    /// # Errors
    /// Returns an internal error if the table lock is poisoned.
    pub fn connect(&self, def: &WorkflowDef) -> WaypointResult<()> {
        let mut table = self.table.write().map_err(|_| lock_err("router.connect"))?;
        for binding in def.handlers() {
            table.insert(
                &binding.event,
                def.key(),
                binding.priority,
                Handler::Workflow(Arc::clone(&binding.handler)),
            );
        }
        for step in def.steps() {
            for binding in step.handlers() {
                table.insert(
                    &binding.event,
                    def.key(),
                    binding.priority,
                    Handler::Step {
                        step_key: step.key().to_string(),
                        handler: Arc::clone(&binding.handler),
                    },
                );
            }
        }
        debug!(process_key = def.key(), "connected workflow handlers");
        Ok(())
    }

    /// Installs a custom route for `event` on the `process_key` definition.
    ///
    /// # Errors
    /// Returns an internal error if the table lock is poisoned.
    pub fn set_route<F>(&self, process_key: &str, event: &str, route: F) -> WaypointResult<()>
    where
        F: Fn(&EventData) -> Option<RouteTarget> + Send + Sync + 'static,
    {
        let mut table = self.table.write().map_err(|_| lock_err("router.set_route"))?;
        table
            .routes
            .insert((process_key.to_string(), event.to_string()), Arc::new(route));
        Ok(())
    }

    /// Event names with at least one handler.
    ///
    /// # Errors
    /// Returns an internal error if the table lock is poisoned.
    pub fn events(&self) -> WaypointResult<Vec<String>> {
        let table = self.table.read().map_err(|_| lock_err("router.events"))?;
        let mut events: Vec<_> = table.bindings.keys().cloned().collect();
        events.sort();
        Ok(events)
    }

    /// Resolves `event` into triggers, in handler priority order.
    ///
    /// Bindings whose route returns `None` are skipped.
    ///
    /// # Errors
    /// Fails if no handler is registered for `event`, or if a step-scoped
    /// handler resolves without a step reference.
    pub fn route_event(&self, event: &str, data: &EventData) -> WaypointResult<Vec<WorkflowTrigger>> {
        let table = self.table.read().map_err(|_| lock_err("router.route_event"))?;
        let bindings = table
            .bindings
            .get(event)
            .ok_or_else(|| ExecutionError::UnknownEvent {
                event: event.to_string(),
            })?;

        let mut triggers = Vec::with_capacity(bindings.len());
        for binding in bindings {
            let target = match table
                .routes
                .get(&(binding.process_key.clone(), event.to_string()))
            {
                Some(route) => route(data),
                None => default_route(data),
            };
            let Some(target) = target else {
                debug!(event, process_key = %binding.process_key, "route skipped binding");
                continue;
            };

            if let Handler::Step { step_key, .. } = &binding.handler {
                if target.step.is_none() {
                    return Err(ExecutionError::MissingSelector {
                        event: event.to_string(),
                        step_key: step_key.clone(),
                    }
                    .into());
                }
            }

            triggers.push(WorkflowTrigger {
                event: event.to_string(),
                process_key: binding.process_key.clone(),
                priority: binding.priority,
                workflow: target.workflow,
                step: target.step,
                data: data.clone(),
                handler: binding.handler.clone(),
            });
        }
        Ok(triggers)
    }
}
