//! Operating-system resources used by the server.
//!
//! - **windows**: Win32 handles, pipes, events and COM activation
//! - **portable**: stand-ins for hosts without the console driver
//!
//! Owned resources are boxed [`KernelObject`]s. Dropping one closes the
//! underlying OS object, and that is the only place it is closed.

use std::fmt;
use std::io::{self, Read};
use std::sync::Arc;

use thiserror::Error;

#[cfg(windows)]
pub mod windows;

pub mod portable;

/// Raw OS handle value as passed across the handoff boundary
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct RawHandle(pub usize);

impl fmt::Display for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// An OS object this process holds a reference to
pub trait KernelObject: Send + fmt::Debug {
    fn raw(&self) -> RawHandle;
}

/// Owned OS handle, closed on drop
pub type OwnedHandle = Box<dyn KernelObject>;

/// One-directional pipe for host signals
pub struct SignalPipe {
    /// Read end, kept by this process
    pub ours: Box<dyn Read + Send>,
    /// Write end, given to the handoff target
    pub theirs: OwnedHandle,
}

impl fmt::Debug for SignalPipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalPipe").field("theirs", &self.theirs).finish()
    }
}

#[derive(Error, Debug)]
pub enum PlatformError {
    /// An OS call failed; `op` names the step, e.g. "create pipe"
    #[error("Failed to {op}: {source}")]
    Os {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{0} is not available on this platform")]
    Unsupported(&'static str),
}

/// OS services consumed by the session initializer and the handoff path
pub trait HostPlatform: Send + Sync {
    /// Whether this process runs in an interactive, visible user session
    fn is_interactive_session(&self) -> bool;

    /// Manual-reset event signaled when input arrives
    fn create_event(&self) -> Result<OwnedHandle, PlatformError>;

    fn create_signal_pipe(&self) -> Result<SignalPipe, PlatformError>;

    /// A synchronize-only handle to this process, for another process to track
    fn duplicate_current_process(&self) -> Result<OwnedHandle, PlatformError>;

    /// Block until `process` exits
    fn wait_for_exit(&self, process: &dyn KernelObject);
}

/// Platform implementation for the running host
pub fn native() -> Arc<dyn HostPlatform> {
    #[cfg(windows)]
    {
        Arc::new(windows::Win32Platform)
    }
    #[cfg(not(windows))]
    {
        Arc::new(portable::PortablePlatform::new())
    }
}
