//! Journal-backed persistence for Waypoint.
//!
//! Every commit becomes one checksummed entry in an append-only file. On
//! open the file is replayed into an in-memory index; reads never touch
//! the disk.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │              JournalWorkflowStore             │
//! ├──────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌────────────────────┐ │
//! │  │ Journal         │  │ InMemory index     │ │
//! │  │ (append-only)   │  │ (replayed on open) │ │
//! │  └─────────────────┘  └────────────────────┘ │
//! └──────────────────────────────────────────────┘
//! ```

mod codec;
mod store;
mod wal;

pub use store::JournalWorkflowStore;
pub use wal::{Journal, JournalEntry};

use std::path::Path;

use crate::error::{ValidationError, WaypointResult};

/// Configuration for the journal store.
#[derive(Debug, Clone)]
pub struct JournalConfig {
    /// Whether to fsync after every append (slower but safer).
    pub sync_on_write: bool,
    /// Largest encoded commit accepted, in bytes.
    pub max_entry_size: usize,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            sync_on_write: true,
            max_entry_size: 64 * 1024 * 1024, // 64 MB
        }
    }
}

impl JournalConfig {
    /// Upper bound imposed by the 4-byte length prefix.
    const MAX_ENTRY_LIMIT: usize = u32::MAX as usize;

    /// Checks the configuration.
    ///
    /// # Errors
    /// Fails if `max_entry_size` is zero or does not fit the length prefix.
    pub fn validate(self) -> Result<Self, ValidationError> {
        if self.max_entry_size == 0 || self.max_entry_size > Self::MAX_ENTRY_LIMIT {
            return Err(ValidationError::InvalidConfig {
                reason: format!(
                    "max_entry_size must be between 1 and {} bytes (got {})",
                    Self::MAX_ENTRY_LIMIT,
                    self.max_entry_size
                ),
            });
        }
        Ok(self)
    }
}

/// Open or create a journal store at the given path.
///
/// # Arguments
/// * `path` - Journal file
/// * `config` - Optional configuration (uses defaults if None)
///
/// # Errors
/// - If the configuration is invalid
/// - If the file cannot be created or is not a journal
/// - If an intact entry fails to replay
///
/// # Example
/// ```rust,ignore
/// use waypoint::storage::journal::open_journal;
///
/// let store = Arc::new(open_journal("./workflows.journal", None)?);
/// let manager = WorkflowManager::new(router, store);
/// ```
pub fn open_journal(path: impl AsRef<Path>, config: Option<JournalConfig>) -> WaypointResult<JournalWorkflowStore> {
    let cfg = config.unwrap_or_default().validate()?;
    Ok(JournalWorkflowStore::open(path.as_ref(), &cfg)?)
}
