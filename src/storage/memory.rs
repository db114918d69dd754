//! In-memory storage backend.
//!
//! Thread-safe implementation of [`WorkflowStore`] for embedded usage and
//! tests. Also used by the journal store as its replayed index.

use std::collections::HashMap;
use std::sync::RwLock;

use uuid::Uuid;

use crate::storage::traits::{StorageError, WorkflowCommit, WorkflowRecord, WorkflowStore};
use crate::workflow::{WorkflowActivity, WorkflowId, WorkflowMessage};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

#[derive(Debug, Default)]
struct StoreState {
    records: HashMap<WorkflowId, WorkflowRecord>,
    /// (process key, resource name, resource id) to workflow ids, in creation order.
    by_resource: HashMap<(String, String, Uuid), Vec<WorkflowId>>,
    messages: HashMap<WorkflowId, Vec<WorkflowMessage>>,
    activities: HashMap<WorkflowId, Vec<WorkflowActivity>>,
}

impl StoreState {
    fn check(&self, commit: &WorkflowCommit) -> Result<(), StorageError> {
        match self.records.get(&commit.workflow_id) {
            Some(record) => record.check_revision(commit),
            None if commit.base_revision == 0 => Ok(()),
            None => Err(StorageError::WorkflowNotFound(commit.workflow_id)),
        }
    }

    fn apply(&mut self, commit: WorkflowCommit) -> Result<u64, StorageError> {
        let id = commit.workflow_id;
        if !self.records.contains_key(&id) {
            if commit.base_revision != 0 {
                return Err(StorageError::WorkflowNotFound(id));
            }
            self.by_resource
                .entry((
                    commit.process_key.clone(),
                    commit.resource_name.clone(),
                    commit.resource_id,
                ))
                .or_default()
                .push(id);
            self.records.insert(id, WorkflowRecord::from_commit(&commit));
        }
        let record = self
            .records
            .get_mut(&id)
            .ok_or(StorageError::WorkflowNotFound(id))?;
        let revision = record.apply_commit(&commit)?;
        self.messages.entry(id).or_default().extend(commit.messages);
        self.activities.entry(id).or_default().extend(commit.activities);
        Ok(revision)
    }
}

/// In-memory workflow store.
#[derive(Debug, Default)]
pub struct InMemoryWorkflowStore {
    state: RwLock<StoreState>,
}

impl InMemoryWorkflowStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored workflows.
    ///
    /// # Errors
    /// Returns `BackendError` if the lock is poisoned.
    pub fn len(&self) -> Result<usize, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("workflow_store.len"))?;
        Ok(state.records.len())
    }

    /// Returns true if no workflow is stored.
    ///
    /// # Errors
    /// Returns `BackendError` if the lock is poisoned.
    pub fn is_empty(&self) -> Result<bool, StorageError> {
        self.len().map(|n| n == 0)
    }

    /// Fails with the error `append` would return, without storing anything.
    pub(crate) fn check(&self, commit: &WorkflowCommit) -> Result<(), StorageError> {
        let state = self.state.read().map_err(|_| lock_err("workflow_store.check"))?;
        state.check(commit)
    }
}

impl WorkflowStore for InMemoryWorkflowStore {
    fn load(&self, process_key: &str, id: WorkflowId) -> Result<Option<WorkflowRecord>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("workflow_store.load"))?;
        Ok(state
            .records
            .get(&id)
            .filter(|r| r.process_key == process_key)
            .cloned())
    }

    fn find_by_resource(
        &self,
        process_key: &str,
        resource_name: &str,
        resource_id: Uuid,
    ) -> Result<Option<WorkflowRecord>, StorageError> {
        let state = self
            .state
            .read()
            .map_err(|_| lock_err("workflow_store.find_by_resource"))?;
        let key = (process_key.to_string(), resource_name.to_string(), resource_id);
        Ok(state
            .by_resource
            .get(&key)
            .and_then(|ids| ids.last())
            .and_then(|id| state.records.get(id))
            .cloned())
    }

    fn append(&self, commit: WorkflowCommit) -> Result<u64, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("workflow_store.append"))?;
        state.check(&commit)?;
        state.apply(commit)
    }

    fn messages(&self, id: WorkflowId) -> Result<Vec<WorkflowMessage>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("workflow_store.messages"))?;
        Ok(state.messages.get(&id).cloned().unwrap_or_default())
    }

    fn activities(&self, id: WorkflowId) -> Result<Vec<WorkflowActivity>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("workflow_store.activities"))?;
        Ok(state.activities.get(&id).cloned().unwrap_or_default())
    }
}
