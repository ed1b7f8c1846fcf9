//! Platform stand-ins for hosts without the console driver.
//!
//! There is no handoff target to find outside Windows, so the session is
//! reported as non-interactive and the handoff path is never entered. The
//! process handle a handler would track cannot be produced here either.

use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::debug;

use super::{HostPlatform, KernelObject, OwnedHandle, PlatformError, RawHandle, SignalPipe};

/// A process-local token standing in for an OS handle
#[derive(Debug)]
pub struct LocalHandle {
    raw: RawHandle,
}

impl KernelObject for LocalHandle {
    fn raw(&self) -> RawHandle {
        self.raw
    }
}

#[cfg(unix)]
impl KernelObject for std::os::unix::net::UnixStream {
    fn raw(&self) -> RawHandle {
        use std::os::unix::io::AsRawFd;
        RawHandle(self.as_raw_fd() as usize)
    }
}

#[derive(Debug, Default)]
pub struct PortablePlatform {
    next: AtomicUsize,
}

impl PortablePlatform {
    pub fn new() -> Self {
        Self::default()
    }

    fn token(&self) -> OwnedHandle {
        let raw = RawHandle(self.next.fetch_add(1, Ordering::SeqCst) + 1);
        Box::new(LocalHandle { raw })
    }
}

impl HostPlatform for PortablePlatform {
    fn is_interactive_session(&self) -> bool {
        false
    }

    fn create_event(&self) -> Result<OwnedHandle, PlatformError> {
        Ok(self.token())
    }

    #[cfg(unix)]
    fn create_signal_pipe(&self) -> Result<SignalPipe, PlatformError> {
        let (ours, theirs) = std::os::unix::net::UnixStream::pair()
            .map_err(|source| PlatformError::Os { op: "create pipe", source })?;
        Ok(SignalPipe {
            ours: Box::new(ours),
            theirs: Box::new(theirs),
        })
    }

    #[cfg(not(unix))]
    fn create_signal_pipe(&self) -> Result<SignalPipe, PlatformError> {
        Err(PlatformError::Unsupported("signal pipe"))
    }

    fn duplicate_current_process(&self) -> Result<OwnedHandle, PlatformError> {
        Err(PlatformError::Unsupported("process handle duplication"))
    }

    fn wait_for_exit(&self, process: &dyn KernelObject) {
        debug!(handle = %process.raw(), "no process table to wait on; returning");
    }
}
