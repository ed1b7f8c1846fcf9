//! Transport seam
//!
//! The driver connection that delivers requests and accepts replies is an
//! external collaborator. The server only needs three things from it.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use thiserror::Error;

use super::message::Reply;
use crate::core::object::HandleId;
use crate::platform::RawHandle;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("completing request {0:#x} failed")]
    Completion(u64),

    #[error("server handle is not available")]
    NoServerHandle,
}

/// Something a later request can address by token
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Published {
    Handle(HandleId),
    Process(u32),
}

/// Operations the server consumes from the driver connection
pub trait DeviceComm: Send + Sync {
    /// Make `object` addressable and return the token clients will use
    fn put_handle(&self, object: Published) -> u64;

    /// Write a reply back to the client
    fn complete_io(&self, reply: &Reply) -> Result<(), TransportError>;

    /// Handle to the server end of the driver connection
    fn server_handle(&self) -> Result<RawHandle, TransportError>;
}

/// Process tokens are minted above the 32-bit pid range
const PROCESS_TOKEN_BASE: u64 = 0x1_0000_0000;

/// In-memory transport that records replies
#[derive(Debug, Default)]
pub struct LoopbackTransport {
    completed: Mutex<Vec<Reply>>,
    published: Mutex<Vec<Published>>,
    process_tokens: AtomicU64,
    fail_completions: AtomicUsize,
    server: Option<RawHandle>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn with_server_handle(server: RawHandle) -> Self {
        Self {
            server: Some(server),
            ..Self::default()
        }
    }

    /// Make the next `count` completions fail
    #[cfg(test)]
    pub fn fail_next_completions(&self, count: usize) {
        self.fail_completions.store(count, Ordering::SeqCst);
    }

    /// Replies completed so far, oldest first
    pub fn take_completed(&self) -> Vec<Reply> {
        std::mem::take(&mut *lock(&self.completed))
    }

    #[cfg(test)]
    pub fn published(&self) -> Vec<Published> {
        lock(&self.published).clone()
    }
}

impl DeviceComm for LoopbackTransport {
    fn put_handle(&self, object: Published) -> u64 {
        lock(&self.published).push(object);
        match object {
            Published::Handle(id) => id.0,
            Published::Process(_) => PROCESS_TOKEN_BASE + self.process_tokens.fetch_add(1, Ordering::SeqCst) + 1,
        }
    }

    fn complete_io(&self, reply: &Reply) -> Result<(), TransportError> {
        let failing = self
            .fail_completions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TransportError::Completion(reply.identifier));
        }
        lock(&self.completed).push(reply.clone());
        Ok(())
    }

    fn server_handle(&self) -> Result<RawHandle, TransportError> {
        self.server.ok_or(TransportError::NoServerHandle)
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::status::Status;

    fn reply(id: u64) -> Reply {
        Reply {
            identifier: id,
            status: Status::SUCCESS,
            information: 0,
            payload: Vec::new(),
        }
    }

    #[test]
    fn test_records_completions() {
        let transport = LoopbackTransport::new();
        transport.complete_io(&reply(1)).unwrap();
        transport.complete_io(&reply(2)).unwrap();
        let done = transport.take_completed();
        assert_eq!(done.len(), 2);
        assert!(transport.take_completed().is_empty());
    }

    #[test]
    fn test_injected_failures_are_consumed() {
        let transport = LoopbackTransport::new();
        transport.fail_next_completions(1);
        assert_eq!(transport.complete_io(&reply(5)), Err(TransportError::Completion(5)));
        assert!(transport.complete_io(&reply(6)).is_ok());
    }

    #[test]
    fn test_tokens() {
        let transport = LoopbackTransport::new();
        assert_eq!(transport.put_handle(Published::Handle(HandleId(9))), 9);
        assert_eq!(transport.published().len(), 1);
    }

    #[test]
    fn test_process_tokens_are_not_pids() {
        let transport = LoopbackTransport::new();
        let first = transport.put_handle(Published::Process(100));
        let second = transport.put_handle(Published::Process(100));
        assert!(first > u64::from(u32::MAX));
        assert_ne!(first, second);
        assert_eq!(transport.published(), vec![Published::Process(100), Published::Process(100)]);
    }

    #[test]
    fn test_server_handle_when_configured() {
        let transport = LoopbackTransport::with_server_handle(RawHandle(0x500));
        assert_eq!(transport.server_handle(), Ok(RawHandle(0x500)));
    }

    #[test]
    fn test_no_server_handle_by_default() {
        let transport = LoopbackTransport::new();
        assert_eq!(transport.server_handle(), Err(TransportError::NoServerHandle));
    }
}
