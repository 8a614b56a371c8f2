//! Handle table
//!
//! Maps the 32-bit ids a client sees to the files and directories its
//! connection has open. Ids are never reused within one connection.

use std::collections::HashMap;

use crate::error::ProtocolError;
use crate::storage::{DirHandle, FileHandle};

#[derive(Debug)]
pub enum Handle {
    File(FileHandle),
    Dir(DirHandle),
}

#[derive(Debug)]
pub struct HandleTable {
    entries: HashMap<u32, Handle>,
    next_id: u32,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            next_id: 1,
        }
    }
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registers a handle and returns its id.
    pub fn insert(&mut self, handle: Handle) -> Result<u32, ProtocolError> {
        let id = self.next_id;
        self.next_id = id
            .checked_add(1)
            .ok_or_else(|| ProtocolError::warning("handle ids exhausted"))?;
        self.entries.insert(id, handle);
        Ok(id)
    }

    pub fn file_mut(&mut self, id: u32) -> Result<&mut FileHandle, ProtocolError> {
        match self.entries.get_mut(&id) {
            Some(Handle::File(file)) => Ok(file),
            Some(Handle::Dir(_)) => Err(ProtocolError::warning(format!(
                "handle {id} is a directory"
            ))),
            None => Err(unknown(id)),
        }
    }

    pub fn dir_mut(&mut self, id: u32) -> Result<&mut DirHandle, ProtocolError> {
        match self.entries.get_mut(&id) {
            Some(Handle::Dir(dir)) => Ok(dir),
            Some(Handle::File(_)) => Err(ProtocolError::warning(format!(
                "handle {id} is not a directory"
            ))),
            None => Err(unknown(id)),
        }
    }

    /// Removes a file handle; the caller closes it.
    pub fn take_file(&mut self, id: u32) -> Result<FileHandle, ProtocolError> {
        self.file_mut(id)?;
        match self.entries.remove(&id) {
            Some(Handle::File(file)) => Ok(file),
            _ => Err(unknown(id)),
        }
    }

    pub fn take_dir(&mut self, id: u32) -> Result<DirHandle, ProtocolError> {
        self.dir_mut(id)?;
        match self.entries.remove(&id) {
            Some(Handle::Dir(dir)) => Ok(dir),
            _ => Err(unknown(id)),
        }
    }

    /// Empties the table, yielding every open handle.
    pub fn drain(&mut self) -> Vec<(u32, Handle)> {
        let mut handles: Vec<_> = self.entries.drain().collect();
        handles.sort_by_key(|(id, _)| *id);
        handles
    }
}

fn unknown(id: u32) -> ProtocolError {
    ProtocolError::warning(format!("unknown handle {id}"))
}
