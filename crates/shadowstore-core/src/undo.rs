//! Undo journal: inverse operations for the single in-flight transaction
//!
//! Every heap or index mutation appends the command that inverts it, to an
//! in-memory list and the `undo.data` file together. `commit` truncates
//! both; `rollback` replays the list in reverse append order. A journal left
//! non-empty by a crash is replayed the same way at the next open, so an
//! unfinished transaction never survives a restart.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::durability::durable_sync;
use crate::error::{StoreError, StoreResult};
use crate::format::RecordUsage;
use crate::heap::DataStore;

const TAG_DELETE: u8 = 2;
const TAG_MODIFY: u8 = 3;
const TAG_NEW_IDENTITY: u8 = 4;
const TAG_DROP_IDENTITY: u8 = 5;
const TAG_EXTEND: u8 = 6;

/// One invertible mutation, captured before the mutation itself runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UndoCommand {
    /// A record was marked unused; restore its prior usage byte
    Delete {
        position: u64,
        prior_usage: RecordUsage,
    },
    /// A record head was rewritten; restore usage and versions
    Modify {
        position: u64,
        prior_usage: RecordUsage,
        prior_instance_version: u64,
        prior_schema_version: u32,
    },
    /// An identity was added to the index; forget it again
    NewIdentity { identity: String },
    /// An identity mapping was removed or remapped; re-point it at `position`
    DropIdentity { identity: String, position: u64 },
    /// The heap grew; truncate it back to its prior length
    Extend { prior_length: u64 },
}

impl UndoCommand {
    /// Apply the inverse operation against the heap and index.
    pub fn revert(&self, store: &mut DataStore) -> StoreResult<()> {
        match self {
            UndoCommand::Delete { position, prior_usage } => {
                store.restore_usage(*position, *prior_usage)
            }
            UndoCommand::Modify {
                position,
                prior_usage,
                prior_instance_version,
                prior_schema_version,
            } => store.restore_record_head(
                *position,
                *prior_usage,
                *prior_instance_version,
                *prior_schema_version,
            ),
            UndoCommand::NewIdentity { identity } => store.forget_identity(identity),
            UndoCommand::DropIdentity { identity, position } => {
                store.restore_identity(identity, *position)
            }
            UndoCommand::Extend { prior_length } => store.truncate_heap(*prior_length),
        }
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            UndoCommand::Delete { position, prior_usage } => {
                buf.push(TAG_DELETE);
                buf.extend_from_slice(&position.to_be_bytes());
                buf.push(prior_usage.as_u8());
            }
            UndoCommand::Modify {
                position,
                prior_usage,
                prior_instance_version,
                prior_schema_version,
            } => {
                buf.push(TAG_MODIFY);
                buf.extend_from_slice(&position.to_be_bytes());
                buf.push(prior_usage.as_u8());
                buf.extend_from_slice(&prior_instance_version.to_be_bytes());
                buf.extend_from_slice(&prior_schema_version.to_be_bytes());
            }
            UndoCommand::NewIdentity { identity } => {
                buf.push(TAG_NEW_IDENTITY);
                buf.push(identity.len() as u8);
                buf.extend_from_slice(identity.as_bytes());
            }
            UndoCommand::DropIdentity { identity, position } => {
                buf.push(TAG_DROP_IDENTITY);
                buf.push(identity.len() as u8);
                buf.extend_from_slice(identity.as_bytes());
                buf.extend_from_slice(&position.to_be_bytes());
            }
            UndoCommand::Extend { prior_length } => {
                buf.push(TAG_EXTEND);
                buf.extend_from_slice(&prior_length.to_be_bytes());
            }
        }
    }
}

/// The undo journal: an in-memory command list and its backing file, kept in
/// lockstep so recovery sees exactly what rollback would have seen.
pub struct UndoLog {
    file: File,
    path: PathBuf,
    commands: Vec<UndoCommand>,
}

impl UndoLog {
    /// Open the journal, parsing any commands a previous run left behind.
    /// A journal that exists but cannot be parsed is fatal: replaying a
    /// partial undo set could corrupt committed state.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|e| StoreError::Io {
                path: Some(path.to_path_buf()),
                kind: e.kind(),
                message: format!("Failed to open undo journal: {}", e),
            })?;

        let mut buf = Vec::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_end(&mut buf).map_err(|e| StoreError::Io {
            path: Some(path.to_path_buf()),
            kind: e.kind(),
            message: format!("Failed to read undo journal: {}", e),
        })?;

        let commands = parse_commands(&buf, path)?;

        Ok(Self { file, path: path.to_path_buf(), commands })
    }

    /// Commands pending from an unfinished transaction
    pub fn has_pending(&self) -> bool {
        !self.commands.is_empty()
    }

    /// Number of pending commands
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Pending commands, oldest first
    pub fn commands(&self) -> &[UndoCommand] {
        &self.commands
    }

    /// Append one command to the journal file and the in-memory list.
    /// Must be called before the mutation it inverts.
    pub fn record(&mut self, command: UndoCommand) -> StoreResult<()> {
        let mut buf = Vec::new();
        command.encode(&mut buf);
        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&buf).map_err(|e| StoreError::Io {
            path: Some(self.path.clone()),
            kind: e.kind(),
            message: format!("Undo journal write failed: {}", e),
        })?;
        self.commands.push(command);
        Ok(())
    }

    /// End the transaction keeping its effects: drop all pending commands
    /// and truncate the journal durably. This is the durability point.
    pub fn commit(&mut self) -> StoreResult<()> {
        self.commands.clear();
        self.truncate()
    }

    /// End the transaction discarding its effects: replay pending commands
    /// in reverse append order, then truncate the journal.
    pub fn rollback(&mut self, store: &mut DataStore) -> StoreResult<()> {
        for command in self.commands.iter().rev() {
            command.revert(store)?;
        }
        self.commands.clear();
        self.truncate()
    }

    fn truncate(&mut self) -> StoreResult<()> {
        self.file.set_len(0).map_err(|e| StoreError::Io {
            path: Some(self.path.clone()),
            kind: e.kind(),
            message: format!("Undo journal truncate failed: {}", e),
        })?;
        self.file.seek(SeekFrom::Start(0))?;
        durable_sync(&self.file).map_err(|e| StoreError::Io {
            path: Some(self.path.clone()),
            kind: e.kind(),
            message: format!("Undo journal sync failed: {}", e),
        })?;
        Ok(())
    }
}

/// Parse the whole journal. Any malformed byte, including a torn tail, is a
/// `JournalCorrupted` error.
fn parse_commands(buf: &[u8], path: &Path) -> StoreResult<Vec<UndoCommand>> {
    let mut commands = Vec::new();
    let mut offset = 0usize;

    while offset < buf.len() {
        let start = offset;
        let tag = buf[offset];
        offset += 1;

        let command = match tag {
            TAG_DELETE => {
                let position = read_u64(buf, &mut offset, path, start)?;
                let prior_usage = read_usage(buf, &mut offset, path, start)?;
                UndoCommand::Delete { position, prior_usage }
            }
            TAG_MODIFY => {
                let position = read_u64(buf, &mut offset, path, start)?;
                let prior_usage = read_usage(buf, &mut offset, path, start)?;
                let prior_instance_version = read_u64(buf, &mut offset, path, start)?;
                let prior_schema_version = read_u32(buf, &mut offset, path, start)?;
                UndoCommand::Modify {
                    position,
                    prior_usage,
                    prior_instance_version,
                    prior_schema_version,
                }
            }
            TAG_NEW_IDENTITY => {
                let identity = read_identity(buf, &mut offset, path, start)?;
                UndoCommand::NewIdentity { identity }
            }
            TAG_DROP_IDENTITY => {
                let identity = read_identity(buf, &mut offset, path, start)?;
                let position = read_u64(buf, &mut offset, path, start)?;
                UndoCommand::DropIdentity { identity, position }
            }
            TAG_EXTEND => {
                let prior_length = read_u64(buf, &mut offset, path, start)?;
                UndoCommand::Extend { prior_length }
            }
            other => {
                return Err(corrupted(path, start, &format!("unknown command tag {}", other)));
            }
        };
        commands.push(command);
    }

    Ok(commands)
}

fn take<'a>(buf: &'a [u8], offset: &mut usize, n: usize, path: &Path, start: usize) -> StoreResult<&'a [u8]> {
    if *offset + n > buf.len() {
        return Err(corrupted(path, start, "command truncated"));
    }
    let slice = &buf[*offset..*offset + n];
    *offset += n;
    Ok(slice)
}

fn read_u64(buf: &[u8], offset: &mut usize, path: &Path, start: usize) -> StoreResult<u64> {
    let bytes = take(buf, offset, 8, path, start)?;
    Ok(u64::from_be_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

fn read_u32(buf: &[u8], offset: &mut usize, path: &Path, start: usize) -> StoreResult<u32> {
    let bytes = take(buf, offset, 4, path, start)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_usage(buf: &[u8], offset: &mut usize, path: &Path, start: usize) -> StoreResult<RecordUsage> {
    let byte = take(buf, offset, 1, path, start)?[0];
    RecordUsage::from_u8(byte)
        .ok_or_else(|| corrupted(path, start, &format!("invalid usage byte {}", byte)))
}

fn read_identity(buf: &[u8], offset: &mut usize, path: &Path, start: usize) -> StoreResult<String> {
    let len = take(buf, offset, 1, path, start)?[0] as usize;
    let bytes = take(buf, offset, len, path, start)?;
    String::from_utf8(bytes.to_vec())
        .map_err(|_| corrupted(path, start, "identity is not valid UTF-8"))
}

fn corrupted(path: &Path, offset: usize, reason: &str) -> StoreError {
    StoreError::JournalCorrupted {
        path: path.to_path_buf(),
        offset: offset as u64,
        reason: reason.to_string(),
    }
}
