//! File-backed workflow store.

use std::io::{Error as IoError, ErrorKind};
use std::path::Path;
use std::sync::Mutex;

use tracing::info;
use uuid::Uuid;

use super::wal::Journal;
use super::JournalConfig;
use crate::storage::memory::InMemoryWorkflowStore;
use crate::storage::traits::{StorageError, WorkflowCommit, WorkflowRecord, WorkflowStore};
use crate::workflow::{WorkflowActivity, WorkflowId, WorkflowMessage};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

fn io_err(e: &IoError) -> StorageError {
    match e.kind() {
        ErrorKind::InvalidData => StorageError::Corruption(e.to_string()),
        ErrorKind::InvalidInput => StorageError::SerializationError(e.to_string()),
        _ => StorageError::BackendError(e.to_string()),
    }
}

/// Workflow store persisted to an append-only journal.
///
/// Reads are served from an in-memory index rebuilt on open. Appends are
/// checked against the index, written to the journal, then indexed.
#[derive(Debug)]
pub struct JournalWorkflowStore {
    journal: Mutex<Journal>,
    index: InMemoryWorkflowStore,
}

impl JournalWorkflowStore {
    /// Opens or creates the journal at `path` and replays it.
    ///
    /// # Errors
    /// - `Corruption`: if the file is not a journal, or an intact entry does
    ///   not apply on top of the ones before it
    /// - `BackendError`: on I/O failures
    pub fn open(path: &Path, config: &JournalConfig) -> Result<Self, StorageError> {
        let (journal, entries) =
            Journal::open(path, config.sync_on_write, config.max_entry_size).map_err(|e| io_err(&e))?;

        let index = InMemoryWorkflowStore::new();
        let replayed = entries.len();
        for entry in entries {
            let sequence = entry.sequence;
            index.append(entry.commit).map_err(|e| {
                StorageError::Corruption(format!("journal entry {sequence} does not apply: {e}"))
            })?;
        }
        info!(path = %path.display(), entries = replayed, "journal replayed");

        Ok(Self {
            journal: Mutex::new(journal),
            index,
        })
    }

    /// Sequence number of the last journal entry.
    ///
    /// # Errors
    /// Returns `BackendError` if the lock is poisoned.
    pub fn sequence(&self) -> Result<u64, StorageError> {
        let journal = self.journal.lock().map_err(|_| lock_err("journal.sequence"))?;
        Ok(journal.current_sequence())
    }
}

impl WorkflowStore for JournalWorkflowStore {
    fn load(&self, process_key: &str, id: WorkflowId) -> Result<Option<WorkflowRecord>, StorageError> {
        self.index.load(process_key, id)
    }

    fn find_by_resource(
        &self,
        process_key: &str,
        resource_name: &str,
        resource_id: Uuid,
    ) -> Result<Option<WorkflowRecord>, StorageError> {
        self.index.find_by_resource(process_key, resource_name, resource_id)
    }

    fn append(&self, commit: WorkflowCommit) -> Result<u64, StorageError> {
        let mut journal = self.journal.lock().map_err(|_| lock_err("journal.append"))?;
        self.index.check(&commit)?;
        journal.append(&commit).map_err(|e| io_err(&e))?;
        self.index.append(commit)
    }

    fn messages(&self, id: WorkflowId) -> Result<Vec<WorkflowMessage>, StorageError> {
        self.index.messages(id)
    }

    fn activities(&self, id: WorkflowId) -> Result<Vec<WorkflowActivity>, StorageError> {
        self.index.activities(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn commit(id: WorkflowId, base_revision: u64) -> WorkflowCommit {
        WorkflowCommit {
            workflow_id: id,
            process_key: "p".to_string(),
            resource_name: "order".to_string(),
            resource_id: Uuid::nil(),
            base_revision,
            etag: format!("etag-{base_revision}"),
            mutations: Vec::new(),
            messages: Vec::new(),
            activities: Vec::new(),
        }
    }

    #[test]
    fn test_reopen_restores_index() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wf.journal");
        let id = WorkflowId::new();
        let config = JournalConfig::default();

        {
            let store = JournalWorkflowStore::open(&path, &config).unwrap();
            store.append(commit(id, 0)).unwrap();
            store.append(commit(id, 1)).unwrap();
        }

        let store = JournalWorkflowStore::open(&path, &config).unwrap();
        let record = store.load("p", id).unwrap().unwrap();
        assert_eq!(record.revision, 2);
        assert_eq!(store.sequence().unwrap(), 2);
    }

    #[test]
    fn test_stale_commit_never_reaches_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wf.journal");
        let id = WorkflowId::new();
        let store = JournalWorkflowStore::open(&path, &JournalConfig::default()).unwrap();

        store.append(commit(id, 0)).unwrap();
        let len = std::fs::metadata(&path).unwrap().len();

        let err = store.append(commit(id, 0)).unwrap_err();
        assert!(matches!(err, StorageError::Conflict { .. }));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), len);
        assert_eq!(store.sequence().unwrap(), 1);
    }
}
