//! Storage for Waypoint.
//!
//! [`WorkflowStore`] is the persistence interface the manager needs.
//! [`InMemoryWorkflowStore`] is always available; the journal store
//! requires the `persistent` feature.

mod memory;
mod traits;

#[cfg(feature = "persistent")]
pub mod journal;

pub use memory::InMemoryWorkflowStore;
pub use traits::{StorageError, WorkflowCommit, WorkflowRecord, WorkflowStore};
