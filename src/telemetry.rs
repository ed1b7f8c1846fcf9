//! Usage telemetry
//!
//! Counts API calls and records handoff outcomes as `tracing` events under
//! the `telemetry` target, so a subscriber can route them separately.

use std::sync::atomic::{AtomicU32, Ordering};

use tracing::info;

use crate::server::handoff::{HandoffError, HandoffTargetId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApiCall {
    AttachConsole,
    FreeConsole,
}

#[derive(Debug, Default)]
pub struct Telemetry {
    attach_console: AtomicU32,
    free_console: AtomicU32,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log_api_call(&self, call: ApiCall) {
        self.counter(call).fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self, call: ApiCall) -> u32 {
        self.counter(call).load(Ordering::Relaxed)
    }

    fn counter(&self, call: ApiCall) -> &AtomicU32 {
        match call {
            ApiCall::AttachConsole => &self.attach_console,
            ApiCall::FreeConsole => &self.free_console,
        }
    }

    pub fn handoff_succeeded(&self, target: &HandoffTargetId) {
        info!(target: "telemetry", event = "ConsoleHandoffSucceeded", clsid = %target, "successfully handed off console connection");
    }

    pub fn handoff_failed(&self, target: &HandoffTargetId, error: &HandoffError) {
        info!(target: "telemetry", event = "ConsoleHandoffFailed", clsid = %target, error = %error, "failed while attempting handoff");
    }
}
