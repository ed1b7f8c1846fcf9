//! Process registry
//!
//! One record per connected client process, in connection order.

use super::object::{HandleId, ObjectRegistry};
use super::status::{ConsoleError, Result};

/// Bookkeeping for a connected client process
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessRecord {
    pub process_id: u32,
    pub thread_id: u32,
    pub group_id: u32,
    /// First process of the session
    pub root: bool,
    /// Allowed to take the foreground
    pub foreground: bool,
    /// Primary handles created at connect time
    pub input_handle: Option<HandleId>,
    pub output_handle: Option<HandleId>,
    /// Token the transport addresses this process by, once published
    pub token: Option<u64>,
}

impl ProcessRecord {
    fn new(process_id: u32, thread_id: u32, group_id: u32) -> Self {
        Self {
            process_id,
            thread_id,
            group_id,
            root: false,
            foreground: false,
            input_handle: None,
            output_handle: None,
            token: None,
        }
    }
}

/// Connected processes
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    records: Vec<ProcessRecord>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a record. A process id may be connected only once.
    pub fn allocate(&mut self, process_id: u32, thread_id: u32, group_id: u32) -> Result<&mut ProcessRecord> {
        if self.find(process_id).is_some() {
            return Err(ConsoleError::DuplicateProcess(process_id));
        }
        self.records.push(ProcessRecord::new(process_id, thread_id, group_id));
        let index = self.records.len() - 1;
        Ok(&mut self.records[index])
    }

    /// Remove a record and close the primary handles it still holds
    pub fn free(&mut self, process_id: u32, objects: &mut ObjectRegistry) -> Option<ProcessRecord> {
        let index = self.records.iter().position(|r| r.process_id == process_id)?;
        let record = self.records.remove(index);

        for handle in [record.input_handle, record.output_handle].into_iter().flatten() {
            if let Err(e) = objects.free_handle(handle) {
                tracing::warn!(pid = process_id, %handle, "closing process handle failed: {}", e);
            }
        }
        Some(record)
    }

    pub fn find(&self, process_id: u32) -> Option<&ProcessRecord> {
        self.records.iter().find(|r| r.process_id == process_id)
    }

    pub fn find_mut(&mut self, process_id: u32) -> Option<&mut ProcessRecord> {
        self.records.iter_mut().find(|r| r.process_id == process_id)
    }

    /// Record addressed by a transport token. Unpublished records never match.
    pub fn find_by_token(&self, token: u64) -> Option<&ProcessRecord> {
        self.records.iter().find(|r| r.token == Some(token))
    }

    /// Grant or revoke foreground rights for every connected process.
    /// Returns the ids whose rights changed.
    pub fn modify_focus(&mut self, foreground: bool) -> Vec<u32> {
        self.records
            .iter_mut()
            .filter(|r| r.foreground != foreground)
            .map(|r| {
                r.foreground = foreground;
                r.process_id
            })
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProcessRecord> {
        self.records.iter()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
