//! Workflow orchestration.
//!
//! [`WorkflowManager`] owns registered definitions, an identity cache of
//! loaded workflows and a handle on the store. It creates and loads
//! workflows, commits their pending changes, and drives events end to end
//! through [`WorkflowManager::process_event`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ExecutionError, ValidationError, WaypointError, WaypointResult};
use crate::storage::{StorageError, WorkflowCommit, WorkflowStore};
use crate::value::Record;
use crate::workflow::definition::{WorkflowDef, WorkflowDefInfo};
use crate::workflow::model::{WorkflowActivity, WorkflowId, WorkflowMessage};
use crate::workflow::mutation::MutationEnvelope;
use crate::workflow::router::{EventData, EventRouter, WorkflowRef, WorkflowTrigger};
use crate::workflow::runner::{Transaction, Workflow};

fn lock_err(context: &'static str) -> WaypointError {
    WaypointError::internal(format!("poisoned lock: {context}"))
}

/// Configuration for [`WorkflowManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Deepest chain of transition hooks triggering further transitions.
    pub max_transition_depth: usize,
    /// Commit each workflow right after a handler ran on it.
    pub commit_on_dispatch: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_transition_depth: 16,
            commit_on_dispatch: false,
        }
    }
}

impl ManagerConfig {
    /// Checks the configuration.
    ///
    /// # Errors
    /// Fails if `max_transition_depth` is zero.
    pub fn validate(self) -> Result<Self, ValidationError> {
        if self.max_transition_depth == 0 {
            return Err(ValidationError::InvalidConfig {
                reason: "max_transition_depth must be at least 1".to_string(),
            });
        }
        Ok(self)
    }
}

/// Shared handle on a loaded workflow.
///
/// Clones refer to the same workflow. Locking serializes mutation.
#[derive(Clone)]
pub struct WorkflowHandle {
    id: WorkflowId,
    process_key: Arc<str>,
    inner: Arc<Mutex<Workflow>>,
}

impl WorkflowHandle {
    fn new(workflow: Workflow) -> Self {
        Self {
            id: workflow.id(),
            process_key: Arc::from(workflow.process_key()),
            inner: Arc::new(Mutex::new(workflow)),
        }
    }

    /// Workflow id.
    #[must_use]
    pub const fn id(&self) -> WorkflowId {
        self.id
    }

    /// Process key of the workflow.
    #[must_use]
    pub fn process_key(&self) -> &str {
        &self.process_key
    }

    /// Locks the workflow.
    ///
    /// # Errors
    /// Returns an internal error if a previous holder panicked.
    pub fn lock(&self) -> WaypointResult<MutexGuard<'_, Workflow>> {
        self.inner.lock().map_err(|_| lock_err("workflow"))
    }

    /// Locks the workflow and runs one transaction on it.
    ///
    /// # Errors
    /// Returns the error of `f`, which leaves the workflow unchanged.
    pub fn transaction<R>(&self, f: impl FnOnce(&mut Transaction<'_>) -> WaypointResult<R>) -> WaypointResult<R> {
        self.lock()?.transaction(f)
    }
}

impl std::fmt::Debug for WorkflowHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowHandle")
            .field("id", &self.id)
            .field("process_key", &self.process_key)
            .finish_non_exhaustive()
    }
}

type ResourceKey = (String, String, Uuid);

#[derive(Default)]
struct Cache {
    by_id: HashMap<WorkflowId, WorkflowHandle>,
    by_resource: HashMap<ResourceKey, WorkflowId>,
}

impl Cache {
    fn insert(&mut self, handle: &WorkflowHandle, resource_name: &str, resource_id: Uuid) {
        self.by_resource.insert(
            (handle.process_key().to_string(), resource_name.to_string(), resource_id),
            handle.id(),
        );
        self.by_id.insert(handle.id(), handle.clone());
    }
}

/// Creates, loads, commits and drives workflows.
pub struct WorkflowManager {
    router: Arc<EventRouter>,
    store: Arc<dyn WorkflowStore>,
    config: ManagerConfig,
    definitions: RwLock<HashMap<String, Arc<WorkflowDef>>>,
    cache: RwLock<Cache>,
}

impl WorkflowManager {
    /// Creates a manager with default configuration.
    #[must_use]
    pub fn new(router: Arc<EventRouter>, store: Arc<dyn WorkflowStore>) -> Self {
        Self {
            router,
            store,
            config: ManagerConfig::default(),
            definitions: RwLock::new(HashMap::new()),
            cache: RwLock::new(Cache::default()),
        }
    }

    /// Replaces the configuration.
    ///
    /// # Errors
    /// Fails if `config` does not validate.
    pub fn with_config(mut self, config: ManagerConfig) -> Result<Self, ValidationError> {
        self.config = config.validate()?;
        Ok(self)
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> ManagerConfig {
        self.config
    }

    /// The router events are resolved with.
    #[must_use]
    pub fn router(&self) -> &Arc<EventRouter> {
        &self.router
    }

    /// The backing store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.store
    }

    /// Registers a definition and connects its handlers to the router.
    ///
    /// # Errors
    /// Fails if a definition with the same key is already registered.
    pub fn register(&self, def: WorkflowDef) -> WaypointResult<Arc<WorkflowDef>> {
        let mut defs = self.definitions.write().map_err(|_| lock_err("manager.definitions"))?;
        if defs.contains_key(def.key()) {
            return Err(ValidationError::DuplicateKey {
                kind: "workflow",
                key: def.key().to_string(),
            }
            .into());
        }
        self.router.connect(&def)?;
        let def = Arc::new(def);
        defs.insert(def.key().to_string(), Arc::clone(&def));
        info!(process_key = def.key(), revision = def.revision(), "workflow definition registered");
        Ok(def)
    }

    /// The definition registered under `process_key`.
    ///
    /// # Errors
    /// Fails if no such definition is registered.
    pub fn definition(&self, process_key: &str) -> WaypointResult<Arc<WorkflowDef>> {
        let defs = self.definitions.read().map_err(|_| lock_err("manager.definitions"))?;
        defs.get(process_key).cloned().ok_or_else(|| {
            ExecutionError::UnknownDefinition {
                process_key: process_key.to_string(),
            }
            .into()
        })
    }

    /// Descriptions of every registered definition, by key.
    ///
    /// # Errors
    /// Returns an internal error if the lock is poisoned.
    pub fn definitions(&self) -> WaypointResult<Vec<WorkflowDefInfo>> {
        let defs = self.definitions.read().map_err(|_| lock_err("manager.definitions"))?;
        let mut infos: Vec<_> = defs.values().map(|d| d.info()).collect();
        infos.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(infos)
    }

    /// Creates a workflow in status NEW for a resource.
    ///
    /// Nothing is stored until the workflow is committed.
    ///
    /// # Errors
    /// Fails if `process_key` is not registered.
    pub fn create_workflow(
        &self,
        process_key: &str,
        resource_name: &str,
        resource_id: Uuid,
        params: Record,
    ) -> WaypointResult<WorkflowHandle> {
        let def = self.definition(process_key)?;
        let workflow = Workflow::create(def, resource_name, resource_id, params, self.config.max_transition_depth)?;
        let handle = WorkflowHandle::new(workflow);

        let mut cache = self.cache.write().map_err(|_| lock_err("manager.cache"))?;
        cache.insert(&handle, resource_name, resource_id);
        info!(process_key, workflow_id = %handle.id(), resource_name, %resource_id, "workflow created");
        Ok(handle)
    }

    /// Loads the workflow of `process_key` attached to a resource.
    ///
    /// # Errors
    /// Fails on storage errors and if the stored log does not replay.
    pub fn load_workflow(
        &self,
        process_key: &str,
        resource_name: &str,
        resource_id: Uuid,
    ) -> WaypointResult<Option<WorkflowHandle>> {
        {
            let cache = self.cache.read().map_err(|_| lock_err("manager.cache"))?;
            let key = (process_key.to_string(), resource_name.to_string(), resource_id);
            if let Some(handle) = cache.by_resource.get(&key).and_then(|id| cache.by_id.get(id)) {
                return Ok(Some(handle.clone()));
            }
        }
        match self.store.find_by_resource(process_key, resource_name, resource_id)? {
            Some(record) => self
                .restore(process_key, &record.mutations, record.revision, &record.etag, resource_name, resource_id)
                .map(Some),
            None => Ok(None),
        }
    }

    /// Loads a workflow by id.
    ///
    /// Returns the cached instance if there is one; otherwise replays the
    /// stored log and verifies the result against the stored etag.
    ///
    /// # Errors
    /// Fails if the workflow does not exist under `process_key`, on storage
    /// errors, and if the replayed state does not match the stored etag.
    pub fn load_workflow_by_id(&self, process_key: &str, id: WorkflowId) -> WaypointResult<WorkflowHandle> {
        if let Some(handle) = self.cached(process_key, id)? {
            return Ok(handle);
        }
        let record = self
            .store
            .load(process_key, id)?
            .ok_or_else(|| ExecutionError::WorkflowNotFound {
                reference: format!("{process_key}/{id}"),
            })?;
        self.restore(
            process_key,
            &record.mutations,
            record.revision,
            &record.etag,
            &record.resource_name,
            record.resource_id,
        )
    }

    /// Drops a workflow from the cache, discarding uncommitted changes.
    ///
    /// The next load replays it from the store.
    ///
    /// # Errors
    /// Returns an internal error if the lock is poisoned.
    pub fn evict(&self, id: WorkflowId) -> WaypointResult<bool> {
        let mut cache = self.cache.write().map_err(|_| lock_err("manager.cache"))?;
        cache.by_resource.retain(|_, cached| *cached != id);
        Ok(cache.by_id.remove(&id).is_some())
    }

    /// Commits every cached workflow with pending changes.
    ///
    /// Returns how many were written. Stops at the first failure.
    ///
    /// # Errors
    /// Returns the first commit error.
    pub fn commit(&self) -> WaypointResult<usize> {
        let handles: Vec<WorkflowHandle> = {
            let cache = self.cache.read().map_err(|_| lock_err("manager.cache"))?;
            cache.by_id.values().cloned().collect()
        };
        let mut written = 0;
        for handle in &handles {
            if self.commit_workflow(handle)? {
                written += 1;
            }
        }
        Ok(written)
    }

    /// Commits one workflow's pending changes.
    ///
    /// Returns `false` without touching the store if nothing is pending.
    /// On failure the changes stay pending on `handle`. After a conflict the
    /// workflow is also evicted, so the next load returns the stored state.
    ///
    /// # Errors
    /// - `Storage(Conflict)` if the stored revision moved on since the
    ///   workflow was loaded
    /// - other storage errors
    pub fn commit_workflow(&self, handle: &WorkflowHandle) -> WaypointResult<bool> {
        let mut workflow = handle.lock()?;
        if !workflow.has_pending() {
            return Ok(false);
        }
        let pending = workflow.pending().clone();
        let data = workflow.data();
        let commit = WorkflowCommit {
            workflow_id: workflow.id(),
            process_key: data.process_key.clone(),
            resource_name: data.resource_name.clone(),
            resource_id: data.resource_id,
            base_revision: workflow.revision(),
            etag: workflow.snapshot().etag()?,
            mutations: pending.mutations,
            messages: pending.messages,
            activities: pending.activities,
        };
        let mutations = commit.mutations.len();

        let revision = match self.store.append(commit) {
            Ok(revision) => revision,
            Err(e @ StorageError::Conflict { .. }) => {
                drop(workflow);
                // The cached copy can never commit again; the next load replays the store.
                self.evict(handle.id())?;
                warn!(workflow_id = %handle.id(), "stale workflow evicted after conflict");
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };
        workflow.take_pending();
        workflow.mark_committed(revision);
        info!(workflow_id = %handle.id(), revision, mutations, "workflow committed");
        Ok(true)
    }

    /// Routes `event` and returns a lazy dispatch over the matching handlers.
    ///
    /// Each item is the workflow a handler just ran on, in handler priority
    /// order. Handlers run as the iterator is advanced; commit between items
    /// to make each handler's effects durable before the next one runs.
    ///
    /// Triggers whose workflow does not exist under the handler's process
    /// key are skipped, as are step handlers whose step type differs from
    /// the addressed step. If the event names a workflow id that no trigger
    /// finds, the last item is `ExecutionError::WorkflowNotFound`.
    ///
    /// # Errors
    /// Fails up front if the event has no handler or a step handler has no
    /// step reference.
    pub fn process_event(&self, event: &str, data: &EventData) -> WaypointResult<EventDispatch<'_>> {
        let triggers = self.router.route_event(event, data)?;
        debug!(event, triggers = triggers.len(), "event routed");
        Ok(EventDispatch {
            manager: self,
            triggers: triggers.into_iter(),
            explicit: data.workflow_id,
            found: false,
        })
    }

    /// Messages stored for a workflow.
    ///
    /// # Errors
    /// Propagates storage errors.
    pub fn messages(&self, id: WorkflowId) -> WaypointResult<Vec<WorkflowMessage>> {
        Ok(self.store.messages(id)?)
    }

    /// Activities stored for a workflow.
    ///
    /// # Errors
    /// Propagates storage errors.
    pub fn activities(&self, id: WorkflowId) -> WaypointResult<Vec<WorkflowActivity>> {
        Ok(self.store.activities(id)?)
    }

    fn cached(&self, process_key: &str, id: WorkflowId) -> WaypointResult<Option<WorkflowHandle>> {
        let cache = self.cache.read().map_err(|_| lock_err("manager.cache"))?;
        Ok(cache
            .by_id
            .get(&id)
            .filter(|h| h.process_key() == process_key)
            .cloned())
    }

    fn restore(
        &self,
        process_key: &str,
        log: &[MutationEnvelope],
        revision: u64,
        etag: &str,
        resource_name: &str,
        resource_id: Uuid,
    ) -> WaypointResult<WorkflowHandle> {
        let def = self.definition(process_key)?;
        let workflow = Workflow::restore(def, log, revision, Some(etag), self.config.max_transition_depth)?;
        let handle = WorkflowHandle::new(workflow);

        let mut cache = self.cache.write().map_err(|_| lock_err("manager.cache"))?;
        // Another caller may have loaded it meanwhile; keep the first instance.
        if let Some(existing) = cache.by_id.get(&handle.id()) {
            return Ok(existing.clone());
        }
        cache.insert(&handle, resource_name, resource_id);
        debug!(process_key, workflow_id = %handle.id(), revision, "workflow loaded");
        Ok(handle)
    }

    fn find(&self, trigger: &WorkflowTrigger) -> WaypointResult<Option<WorkflowHandle>> {
        match &trigger.workflow {
            WorkflowRef::Id(id) => match self.load_workflow_by_id(&trigger.process_key, *id) {
                Ok(handle) => Ok(Some(handle)),
                Err(WaypointError::Execution(ExecutionError::WorkflowNotFound { .. })) => Ok(None),
                Err(e) => Err(e),
            },
            WorkflowRef::Resource { name, id } => self.load_workflow(&trigger.process_key, name, *id),
        }
    }

    fn dispatch(&self, trigger: &WorkflowTrigger, explicit: bool) -> WaypointResult<Dispatch> {
        let Some(handle) = self.find(trigger)? else {
            if explicit {
                debug!(
                    event = %trigger.event,
                    process_key = %trigger.process_key,
                    workflow = %trigger.workflow,
                    "workflow not under this process"
                );
            } else {
                warn!(
                    event = %trigger.event,
                    process_key = %trigger.process_key,
                    workflow = %trigger.workflow,
                    "no workflow for trigger"
                );
            }
            return Ok(Dispatch::NoWorkflow);
        };

        // Several step types may handle one event; only the addressed one runs.
        if let (Some(step_key), Some(step)) = (trigger.step_key(), trigger.step) {
            let workflow = handle.lock()?;
            if let Some(found) = workflow.resolve(step).filter(|s| s.step_key != step_key) {
                debug!(
                    event = %trigger.event,
                    workflow_id = %handle.id(),
                    handler_step = step_key,
                    addressed_step = %found.step_key,
                    "step handler skipped"
                );
                return Ok(Dispatch::NotAddressed);
            }
        }

        handle.transaction(|tx| tx.trigger(trigger))?;
        debug!(
            event = %trigger.event,
            workflow_id = %handle.id(),
            step_key = trigger.step_key().unwrap_or("-"),
            "handler dispatched"
        );
        if self.config.commit_on_dispatch {
            self.commit_workflow(&handle)?;
        }
        Ok(Dispatch::Ran(handle))
    }
}

enum Dispatch {
    Ran(WorkflowHandle),
    /// The workflow exists but the handler belongs to another step type.
    NotAddressed,
    NoWorkflow,
}

impl std::fmt::Debug for WorkflowManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Lazy sequence of workflows returned by [`WorkflowManager::process_event`].
#[derive(Debug)]
pub struct EventDispatch<'a> {
    manager: &'a WorkflowManager,
    triggers: std::vec::IntoIter<WorkflowTrigger>,
    /// Workflow id named by the event, until some trigger finds it.
    explicit: Option<WorkflowId>,
    found: bool,
}

impl EventDispatch<'_> {
    /// Triggers not dispatched yet.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.triggers.len()
    }
}

impl Iterator for EventDispatch<'_> {
    type Item = WaypointResult<WorkflowHandle>;

    fn next(&mut self) -> Option<Self::Item> {
        let explicit = self.explicit.is_some();
        for trigger in self.triggers.by_ref() {
            match self.manager.dispatch(&trigger, explicit) {
                Ok(Dispatch::Ran(handle)) => {
                    self.found = true;
                    return Some(Ok(handle));
                }
                Ok(Dispatch::NotAddressed) => self.found = true,
                Ok(Dispatch::NoWorkflow) => {}
                Err(e) => return Some(Err(e)),
            }
        }
        match self.explicit.take() {
            Some(id) if !self.found => Some(Err(ExecutionError::WorkflowNotFound {
                reference: id.to_string(),
            }
            .into())),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record;
    use crate::storage::InMemoryWorkflowStore;
    use crate::workflow::definition::StepDef;

    fn manager() -> WorkflowManager {
        let manager = WorkflowManager::new(Arc::new(EventRouter::new()), Arc::new(InMemoryWorkflowStore::new()));
        let def = WorkflowDef::builder("review")
            .step(StepDef::builder("Review").states(["OPEN"]).build().unwrap())
            .on_start(|wf| wf.add_step("Review").map(|_| Vec::new()))
            .on_event("ping", 0, |wf, _| {
                wf.memorize(record! { "pinged" => true })?;
                Ok(vec!["pong".to_string()])
            })
            .build()
            .unwrap();
        manager.register(def).unwrap();
        manager
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let m = manager();
        let err = m.register(WorkflowDef::builder("review").build().unwrap()).unwrap_err();
        assert!(err.is_validation());
        assert_eq!(m.definitions().unwrap().len(), 1);
    }

    #[test]
    fn test_unknown_definition() {
        let m = manager();
        let err = m.create_workflow("missing", "doc", Uuid::new_v4(), Record::new()).unwrap_err();
        assert!(matches!(err, WaypointError::Execution(ExecutionError::UnknownDefinition { .. })));
    }

    #[test]
    fn test_commit_is_idempotent() {
        let m = manager();
        let wf = m.create_workflow("review", "doc", Uuid::new_v4(), Record::new()).unwrap();
        wf.transaction(|tx| tx.start()).unwrap();

        assert!(m.commit_workflow(&wf).unwrap());
        assert!(!m.commit_workflow(&wf).unwrap());
        assert_eq!(m.commit().unwrap(), 0);
        assert_eq!(wf.lock().unwrap().revision(), 1);
    }

    #[test]
    fn test_load_by_id_after_evict_replays() {
        let m = manager();
        let wf = m.create_workflow("review", "doc", Uuid::new_v4(), Record::new()).unwrap();
        wf.transaction(|tx| tx.start()).unwrap();
        m.commit().unwrap();
        let before = wf.lock().unwrap().snapshot().clone();

        assert!(m.evict(wf.id()).unwrap());
        let loaded = m.load_workflow_by_id("review", wf.id()).unwrap();
        assert_eq!(loaded.lock().unwrap().snapshot(), &before);
        assert!(m.load_workflow_by_id("other", wf.id()).is_err());
    }

    #[test]
    fn test_process_event_by_resource() {
        let m = manager();
        let resource = Uuid::new_v4();
        let wf = m.create_workflow("review", "doc", resource, Record::new()).unwrap();
        wf.transaction(|tx| tx.start()).unwrap();

        let handles: Vec<_> = m
            .process_event("ping", &EventData::for_resource("doc", resource))
            .unwrap()
            .collect::<WaypointResult<_>>()
            .unwrap();
        assert_eq!(handles.len(), 1);
        assert_eq!(handles[0].id(), wf.id());
        assert_eq!(wf.lock().unwrap().memory().get("pinged"), Some(&crate::Value::Bool(true)));
    }

    #[test]
    fn test_event_for_unknown_resource_yields_nothing() {
        let m = manager();
        let dispatched = m
            .process_event("ping", &EventData::for_resource("doc", Uuid::new_v4()))
            .unwrap()
            .count();
        assert_eq!(dispatched, 0);
    }

    #[test]
    fn test_event_for_unknown_workflow_id_is_an_error() {
        let m = manager();
        let missing = WorkflowId::new();
        let results: Vec<_> = m
            .process_event("ping", &EventData::for_workflow(missing))
            .unwrap()
            .collect();
        assert_eq!(results.len(), 1);
        assert!(matches!(
            results[0],
            Err(WaypointError::Execution(ExecutionError::WorkflowNotFound { .. }))
        ));
    }

    #[test]
    fn test_event_for_known_workflow_id() {
        let m = manager();
        let wf = m.create_workflow("review", "doc", Uuid::new_v4(), Record::new()).unwrap();
        wf.transaction(|tx| tx.start()).unwrap();
        m.commit().unwrap();

        let handles: Vec<_> = m
            .process_event("ping", &EventData::for_workflow(wf.id()))
            .unwrap()
            .collect::<WaypointResult<_>>()
            .unwrap();
        assert_eq!(handles.len(), 1);
    }

    #[test]
    fn test_zero_depth_rejected() {
        let cfg = ManagerConfig {
            max_transition_depth: 0,
            ..ManagerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
