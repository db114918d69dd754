//! Append-only journal file.
//!
//! # File Format
//! ```text
//! [MAGIC: 4 bytes][VERSION: 1 byte]
//! [ENTRY 1: codec-encoded JournalEntry]
//! [ENTRY 2: codec-encoded JournalEntry]
//! ...
//! ```
//!
//! Opening a journal reads every entry. A torn or corrupt final entry is
//! cut off so that new entries follow the last good one. A bad entry with
//! data after it is reported as corruption and nothing is truncated.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Error as IoError, ErrorKind, Result as IoResult, Seek, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::codec;
use crate::storage::traits::WorkflowCommit;

/// A single entry in the journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Monotonically increasing sequence number.
    pub sequence: u64,
    /// When this entry was written.
    pub timestamp: DateTime<Utc>,
    /// The commit written.
    pub commit: WorkflowCommit,
}

/// Writer half of a journal file. Not synchronized; callers hold it behind a mutex.
#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
    writer: BufWriter<File>,
    current_sequence: u64,
    sync_on_write: bool,
    max_entry_size: usize,
}

impl Journal {
    /// Opens or creates a journal, returning it with every intact entry.
    ///
    /// # Errors
    /// Fails on I/O errors, if the file is not a journal, or with
    /// `InvalidData` if an entry other than the last one is corrupt.
    pub fn open(path: &Path, sync_on_write: bool, max_entry_size: usize) -> IoResult<(Self, Vec<JournalEntry>)> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let entries = if file.metadata()?.len() == 0 {
            codec::write_header(&mut file)?;
            if sync_on_write {
                file.sync_all()?;
            }
            Vec::new()
        } else {
            let (entries, valid_len) = Self::read_entries(path, max_entry_size)?;
            let file_len = file.metadata()?.len();
            if valid_len < file_len {
                warn!(
                    path = %path.display(),
                    valid_len,
                    file_len,
                    "journal tail discarded"
                );
                file.set_len(valid_len)?;
                if sync_on_write {
                    file.sync_all()?;
                }
            }
            entries
        };
        drop(file);

        let file = OpenOptions::new().append(true).open(path)?;
        let current_sequence = entries.last().map_or(0, |e| e.sequence);
        Ok((
            Self {
                path: path.to_path_buf(),
                writer: BufWriter::new(file),
                current_sequence,
                sync_on_write,
                max_entry_size,
            },
            entries,
        ))
    }

    /// Appends one commit. Returns the sequence number assigned to it.
    ///
    /// # Errors
    /// Fails on I/O errors or if the entry exceeds the size limit.
    pub fn append(&mut self, commit: &WorkflowCommit) -> IoResult<u64> {
        let entry = JournalEntry {
            sequence: self.current_sequence + 1,
            timestamp: Utc::now(),
            commit: commit.clone(),
        };
        let encoded = codec::encode(&entry, self.max_entry_size)?;

        self.writer.write_all(&encoded)?;
        self.writer.flush()?;
        if self.sync_on_write {
            self.writer.get_ref().sync_all()?;
        }

        self.current_sequence = entry.sequence;
        Ok(entry.sequence)
    }

    /// Sequence number of the last entry; 0 for an empty journal.
    #[must_use]
    pub const fn current_sequence(&self) -> u64 {
        self.current_sequence
    }

    /// Journal file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads every entry. Returns them with the byte length of the intact
    /// prefix, which is shorter than the file only when the last entry is torn.
    ///
    /// # Errors
    /// `InvalidData` if a bad entry is followed by more data.
    fn read_entries(path: &Path, max_entry_size: usize) -> IoResult<(Vec<JournalEntry>, u64)> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        codec::read_header(&mut reader)?;

        let mut entries = Vec::new();
        let mut valid_len = codec::HEADER_LEN;
        while valid_len < file_len {
            match codec::decode::<JournalEntry>(&mut reader, max_entry_size) {
                Ok(entry) => {
                    valid_len = reader.stream_position()?;
                    entries.push(entry);
                }
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => {
                    let sequence = entries.last().map_or(0, |last: &JournalEntry| last.sequence) + 1;
                    if reader.stream_position()? < file_len {
                        return Err(IoError::new(
                            ErrorKind::InvalidData,
                            format!("journal entry {sequence} at offset {valid_len} is corrupt: {e}"),
                        ));
                    }
                    warn!(
                        path = %path.display(),
                        sequence,
                        error = %e,
                        "corrupt final journal entry"
                    );
                    break;
                }
            }
        }
        Ok((entries, valid_len))
    }
}
