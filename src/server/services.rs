//! Collaborator seams
//!
//! Console control, accessibility, window creation, teardown and the API
//! layer live outside the connection server. Notifications are fire-and-log:
//! a failing collaborator is reported through `tracing` and never changes a
//! reply status.

use thiserror::Error;
use tracing::debug;

use super::message::{ApiMessage, Reply};
use crate::core::object::Size;
use crate::core::state::ConsoleState;
use crate::core::status::{ConsoleError, Status};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("{0} is unavailable")]
    Unavailable(&'static str),
}

/// OS-side process control (console application registration, foreground, end task)
pub trait ConsoleControl: Send + Sync {
    fn notify_console_application(&self, process_id: u32) -> Result<(), ServiceError>;

    fn set_foreground(&self, process_id: u32, foreground: bool) -> Result<(), ServiceError>;

    fn end_task(&self, process_id: u32, event_type: u32, ctrl_flags: u32) -> Result<(), ServiceError>;
}

/// Accessibility events for application start and end
pub trait AccessibilityNotifier: Send + Sync {
    fn start_application(&self, process_id: u32) -> Result<(), ServiceError>;

    fn end_application(&self, process_id: u32) -> Result<(), ServiceError>;
}

/// Creates the console window during bring-up
pub trait WindowHost: Send + Sync {
    fn create_window(&self, title: &str, window_size: Size) -> Result<(), ServiceError>;
}

/// What the teardown collaborator decided about the session
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TeardownOutcome {
    /// Other processes remain
    Continue,
    /// The last process left; the session should close
    CloseSession,
}

/// Releases everything a departing process owned
pub trait SessionTeardown: Send + Sync {
    fn remove_console(&self, state: &mut ConsoleState, process_id: u32) -> Result<TeardownOutcome, ConsoleError>;
}

/// The console API layer behind generic requests
pub trait ApiDispatch: Send + Sync {
    /// `None` pends the request; the API layer completes it later.
    fn dispatch(&self, state: &mut ConsoleState, message: &ApiMessage) -> Option<Reply>;
}

/// Control that logs notifications and cannot end tasks
#[derive(Debug, Default)]
pub struct NullControl;

impl ConsoleControl for NullControl {
    fn notify_console_application(&self, process_id: u32) -> Result<(), ServiceError> {
        debug!(pid = process_id, "console application");
        Ok(())
    }

    fn set_foreground(&self, process_id: u32, foreground: bool) -> Result<(), ServiceError> {
        debug!(pid = process_id, foreground, "set foreground");
        Ok(())
    }

    fn end_task(&self, process_id: u32, event_type: u32, ctrl_flags: u32) -> Result<(), ServiceError> {
        debug!(pid = process_id, event_type, ctrl_flags, "end task refused");
        Err(ServiceError::Unavailable("process control"))
    }
}

/// Window host for sessions that never show a window
#[derive(Debug, Default)]
pub struct NoWindow;

impl WindowHost for NoWindow {
    fn create_window(&self, title: &str, window_size: Size) -> Result<(), ServiceError> {
        debug!(title, width = window_size.width, height = window_size.height, "window suppressed");
        Ok(())
    }
}

/// Frees the history slot, primary handles and record of a departing process
#[derive(Debug, Default)]
pub struct DefaultTeardown;

impl SessionTeardown for DefaultTeardown {
    fn remove_console(&self, state: &mut ConsoleState, process_id: u32) -> Result<TeardownOutcome, ConsoleError> {
        state.histories.free(process_id);
        state
            .release_process(process_id)
            .ok_or(ConsoleError::UnknownProcess(process_id))?;

        if state.processes.is_empty() && state.is_initialized() {
            Ok(TeardownOutcome::CloseSession)
        } else {
            Ok(TeardownOutcome::Continue)
        }
    }
}

/// API layer that implements nothing
#[derive(Debug, Default)]
pub struct UnsupportedApi;

impl ApiDispatch for UnsupportedApi {
    fn dispatch(&self, _state: &mut ConsoleState, message: &ApiMessage) -> Option<Reply> {
        Some(message.reply(Status::NOT_IMPLEMENTED))
    }
}
