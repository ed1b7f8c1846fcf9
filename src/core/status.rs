//! Reply status codes and the client-visible error taxonomy.

use std::fmt;

use thiserror::Error;

/// NT-style status written into every reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Status(pub u32);

impl Status {
    pub const SUCCESS: Status = Status(0x0000_0000);
    pub const UNSUCCESSFUL: Status = Status(0xC000_0001);
    pub const NOT_IMPLEMENTED: Status = Status(0xC000_0002);
    pub const INVALID_HANDLE: Status = Status(0xC000_0008);
    pub const INVALID_PARAMETER: Status = Status(0xC000_000D);
    pub const NO_MEMORY: Status = Status(0xC000_0017);
    pub const OBJECT_NAME_COLLISION: Status = Status(0xC000_0035);
    pub const SHARING_VIOLATION: Status = Status(0xC000_0043);
    pub const INVALID_BUFFER_SIZE: Status = Status(0xC000_0206);

    /// Sign bit clear means success or informational (NT_SUCCESS).
    pub fn is_success(self) -> bool {
        (self.0 as i32) >= 0
    }
}

impl Default for Status {
    fn default() -> Self {
        Status::SUCCESS
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010X}", self.0)
    }
}

/// Errors a client can observe through a reply status.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsoleError {
    /// Malformed request; nothing was touched.
    #[error("invalid request: {0}")]
    Validation(&'static str),

    /// A string or size field exceeds its fixed limit.
    #[error("{field} is {len} units, limit is {limit}")]
    BufferSize {
        field: &'static str,
        len: usize,
        limit: usize,
    },

    /// Requested access or sharing conflicts with existing openers.
    #[error("sharing violation on object {0}")]
    AccessConflict(u64),

    /// A fixed-capacity pool or table is exhausted.
    #[error("out of {0}")]
    Allocation(&'static str),

    #[error("handle {0:#x} is not open")]
    InvalidHandle(u64),

    #[error("process {0} is already connected")]
    DuplicateProcess(u32),

    #[error("process {0} is not connected")]
    UnknownProcess(u32),

    /// A collaborator required for bring-up refused.
    #[error("session bring-up failed: {0}")]
    Initialization(String),
}

impl ConsoleError {
    /// Status code reported to the client for this error.
    pub fn status(&self) -> Status {
        match self {
            ConsoleError::Validation(_) => Status::INVALID_PARAMETER,
            ConsoleError::BufferSize { .. } => Status::INVALID_BUFFER_SIZE,
            ConsoleError::AccessConflict(_) => Status::SHARING_VIOLATION,
            ConsoleError::Allocation(_) => Status::NO_MEMORY,
            ConsoleError::InvalidHandle(_) | ConsoleError::UnknownProcess(_) => Status::INVALID_HANDLE,
            ConsoleError::DuplicateProcess(_) => Status::OBJECT_NAME_COLLISION,
            ConsoleError::Initialization(_) => Status::UNSUCCESSFUL,
        }
    }
}

pub type Result<T> = std::result::Result<T, ConsoleError>;
