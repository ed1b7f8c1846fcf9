//! Global session state
//!
//! Everything the server mutates lives in one [`ConsoleState`] behind the
//! server's single lock. The lock is coarse on purpose and is the main
//! contention point when many clients talk to one session.

use bitflags::bitflags;

use super::object::{Endpoint, ObjectId, ObjectRegistry, Size};
use super::process::{ProcessRecord, ProcessRegistry};
use crate::history::HistoryPool;
use crate::platform::OwnedHandle;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ConsoleFlags: u32 {
        /// Session bring-up has run
        const INITIALIZED = 0b0001;
        /// The console window holds UI focus
        const HAS_FOCUS   = 0b0010;
        /// Hosted behind a pass-through pseudo-console
        const VT_IO       = 0b0100;
    }
}

/// Process-wide session state
#[derive(Debug)]
pub struct ConsoleState {
    pub flags: ConsoleFlags,
    pub objects: ObjectRegistry,
    pub processes: ProcessRegistry,
    pub histories: HistoryPool,
    /// Input endpoint, once initialized
    pub input: Option<ObjectId>,
    /// Output buffer new handles attach to
    pub active_output: Option<ObjectId>,
    pub title: String,
    /// Event signaled when input arrives. Given away on a successful handoff.
    pub input_event: Option<OwnedHandle>,
}

impl ConsoleState {
    pub fn new(histories: HistoryPool) -> Self {
        Self {
            flags: ConsoleFlags::empty(),
            objects: ObjectRegistry::new(),
            processes: ProcessRegistry::new(),
            histories,
            input: None,
            active_output: None,
            title: String::new(),
            input_event: None,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.flags.contains(ConsoleFlags::INITIALIZED)
    }

    /// Processes joining now may take the foreground
    pub fn grants_foreground(&self) -> bool {
        self.flags.intersects(ConsoleFlags::VT_IO | ConsoleFlags::HAS_FOCUS)
    }

    /// Size of the active output buffer
    pub fn active_output_size(&self) -> Option<(Size, Size)> {
        let id = self.active_output?;
        match &self.objects.object(id)?.endpoint {
            Endpoint::Output(out) => Some((out.buffer_size, out.window_size)),
            Endpoint::Input(_) => None,
        }
    }

    /// Drop a process record together with its primary handles
    pub fn release_process(&mut self, process_id: u32) -> Option<ProcessRecord> {
        self.processes.free(process_id, &mut self.objects)
    }

    /// Undo a connection that did not complete: history slot, handles, record
    pub fn rollback_process(&mut self, process_id: u32) {
        self.histories.free(process_id);
        self.release_process(process_id);
    }

    /// Release every process and the session's own endpoints
    pub fn teardown(&mut self) {
        let pids: Vec<u32> = self.processes.iter().map(|r| r.process_id).collect();
        for pid in pids {
            self.rollback_process(pid);
        }
        for id in [self.input.take(), self.active_output.take()].into_iter().flatten() {
            self.objects.unpin(id);
        }
        self.input_event = None;
        self.flags.remove(ConsoleFlags::INITIALIZED);
    }
}
