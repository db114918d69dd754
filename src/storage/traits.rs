//! Abstract storage traits for Waypoint.
//!
//! A store persists workflows as append-only mutation logs. Each commit
//! carries the revision it was computed against; a store must reject a
//! commit whose base revision is stale with [`StorageError::Conflict`].

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::workflow::{MutationEnvelope, WorkflowActivity, WorkflowId, WorkflowMessage};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Workflow not found.
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(WorkflowId),

    /// Commit computed against a stale revision.
    #[error("Revision conflict on workflow {workflow_id}: expected {expected}, stored {actual}")]
    Conflict {
        /// Workflow id.
        workflow_id: Uuid,
        /// Revision the commit was computed against.
        expected: u64,
        /// Revision in the store.
        actual: u64,
    },

    /// Key already exists.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// Stored data failed an integrity check.
    #[error("Corrupted storage: {0}")]
    Corruption(String),

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Connection failed.
    #[error("Connection error: {0}")]
    ConnectionError(String),
}

/// Everything one commit of one workflow writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowCommit {
    /// Workflow the commit belongs to.
    pub workflow_id: WorkflowId,
    /// Process key of the workflow.
    pub process_key: String,
    /// Resource name of the workflow.
    pub resource_name: String,
    /// Resource id of the workflow.
    pub resource_id: Uuid,
    /// Revision the changes were computed against; 0 for a new workflow.
    pub base_revision: u64,
    /// Etag of the snapshot after applying `mutations`.
    pub etag: String,
    /// Mutations, in application order.
    pub mutations: Vec<MutationEnvelope>,
    /// Handler messages produced since the last commit.
    pub messages: Vec<WorkflowMessage>,
    /// Activities recorded since the last commit.
    pub activities: Vec<WorkflowActivity>,
}

/// Persisted state of one workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRecord {
    /// Workflow id.
    pub workflow_id: WorkflowId,
    /// Process key.
    pub process_key: String,
    /// Resource name.
    pub resource_name: String,
    /// Resource id.
    pub resource_id: Uuid,
    /// Number of commits applied.
    pub revision: u64,
    /// Etag of the latest committed snapshot.
    pub etag: String,
    /// Full mutation log, oldest first.
    pub mutations: Vec<MutationEnvelope>,
}

impl WorkflowRecord {
    /// Starts a record from the first commit of a workflow.
    #[must_use]
    pub fn from_commit(commit: &WorkflowCommit) -> Self {
        Self {
            workflow_id: commit.workflow_id,
            process_key: commit.process_key.clone(),
            resource_name: commit.resource_name.clone(),
            resource_id: commit.resource_id,
            revision: 0,
            etag: String::new(),
            mutations: Vec::new(),
        }
    }

    /// Checks the base revision of `commit` and appends its mutations.
    ///
    /// Returns the new revision.
    ///
    /// # Errors
    /// - `Conflict`: if `commit.base_revision` is not the current revision
    pub fn apply_commit(&mut self, commit: &WorkflowCommit) -> Result<u64, StorageError> {
        self.check_revision(commit)?;
        self.revision += 1;
        self.etag.clone_from(&commit.etag);
        self.mutations.extend(commit.mutations.iter().cloned());
        Ok(self.revision)
    }

    /// Fails with `Conflict` unless `commit` was computed against this record.
    ///
    /// # Errors
    /// - `Conflict`: on a stale base revision
    pub fn check_revision(&self, commit: &WorkflowCommit) -> Result<(), StorageError> {
        if commit.base_revision == self.revision {
            Ok(())
        } else {
            Err(StorageError::Conflict {
                workflow_id: *commit.workflow_id.as_uuid(),
                expected: commit.base_revision,
                actual: self.revision,
            })
        }
    }
}

/// Storage trait for workflow logs.
///
/// # Safety Considerations
/// - `append` must be all-or-nothing: either every mutation, message and
///   activity of the commit is stored, or none is
/// - Implementations should handle concurrent access safely
pub trait WorkflowStore: Send + Sync {
    /// Get a workflow by process key and ID.
    fn load(&self, process_key: &str, id: WorkflowId) -> Result<Option<WorkflowRecord>, StorageError>;

    /// Find the workflow of `process_key` attached to a resource.
    ///
    /// If several exist, returns the most recently created one.
    fn find_by_resource(
        &self,
        process_key: &str,
        resource_name: &str,
        resource_id: Uuid,
    ) -> Result<Option<WorkflowRecord>, StorageError>;

    /// Append a commit. Returns the new revision.
    ///
    /// # Errors
    /// - `Conflict`: if `commit.base_revision` is stale
    fn append(&self, commit: WorkflowCommit) -> Result<u64, StorageError>;

    /// Messages recorded for a workflow, oldest first.
    fn messages(&self, id: WorkflowId) -> Result<Vec<WorkflowMessage>, StorageError>;

    /// Activities recorded for a workflow, oldest first.
    fn activities(&self, id: WorkflowId) -> Result<Vec<WorkflowActivity>, StorageError>;
}
