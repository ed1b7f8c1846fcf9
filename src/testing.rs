//! Test doubles shared by the unit tests.

use std::collections::HashSet;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::core::object::Size;
use crate::platform::{HostPlatform, KernelObject, OwnedHandle, PlatformError, RawHandle, SignalPipe};
use crate::server::handoff::{
    ConsoleHandoff, HandoffActivator, HandoffError, HandoffTargetId, PortableAttachMsg,
};
use crate::server::services::{AccessibilityNotifier, ConsoleControl, ServiceError, WindowHost};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Handle whose close is recorded in a shared log
#[derive(Debug)]
pub struct FakeHandle {
    raw: RawHandle,
    closed: Arc<Mutex<Vec<RawHandle>>>,
}

impl KernelObject for FakeHandle {
    fn raw(&self) -> RawHandle {
        self.raw
    }
}

impl Drop for FakeHandle {
    fn drop(&mut self) {
        lock(&self.closed).push(self.raw);
    }
}

/// Issues [`FakeHandle`]s and remembers which ones were made
#[derive(Clone, Debug)]
pub struct HandleMint {
    next: Arc<AtomicUsize>,
    created: Arc<Mutex<Vec<RawHandle>>>,
    closed: Arc<Mutex<Vec<RawHandle>>>,
}

impl HandleMint {
    fn new() -> Self {
        Self {
            next: Arc::new(AtomicUsize::new(0x1000)),
            created: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn handle(&self) -> OwnedHandle {
        let raw = RawHandle(self.next.fetch_add(4, Ordering::SeqCst));
        lock(&self.created).push(raw);
        Box::new(FakeHandle {
            raw,
            closed: self.closed.clone(),
        })
    }
}

/// Platform that hands out [`FakeHandle`]s and can fail on demand
#[derive(Debug)]
pub struct FakePlatform {
    interactive: bool,
    fail_pipe: bool,
    fail_duplicate: bool,
    mint: HandleMint,
    events: AtomicUsize,
    waits: AtomicUsize,
    signal_bytes: Mutex<Vec<u8>>,
}

impl FakePlatform {
    pub fn new() -> Self {
        Self {
            interactive: true,
            fail_pipe: false,
            fail_duplicate: false,
            mint: HandleMint::new(),
            events: AtomicUsize::new(0),
            waits: AtomicUsize::new(0),
            signal_bytes: Mutex::new(Vec::new()),
        }
    }

    pub fn non_interactive(mut self) -> Self {
        self.interactive = false;
        self
    }

    pub fn failing_pipe(mut self) -> Self {
        self.fail_pipe = true;
        self
    }

    pub fn failing_duplicate(mut self) -> Self {
        self.fail_duplicate = true;
        self
    }

    /// Bytes the next signal pipe will yield on our end
    pub fn with_signals(self, bytes: Vec<u8>) -> Self {
        *lock(&self.signal_bytes) = bytes;
        self
    }

    pub fn mint(&self) -> HandleMint {
        self.mint.clone()
    }

    pub fn closed(&self) -> Vec<RawHandle> {
        lock(&self.mint.closed).clone()
    }

    /// Handles created and not yet closed
    pub fn open_handles(&self) -> usize {
        let closed: HashSet<RawHandle> = self.closed().into_iter().collect();
        lock(&self.mint.created)
            .iter()
            .filter(|h| !closed.contains(h))
            .count()
    }

    pub fn assert_no_double_close(&self) {
        let closed = self.closed();
        let unique: HashSet<RawHandle> = closed.iter().copied().collect();
        assert_eq!(unique.len(), closed.len(), "handle closed twice: {:?}", closed);
    }

    pub fn events_created(&self) -> usize {
        self.events.load(Ordering::SeqCst)
    }

    pub fn waits(&self) -> usize {
        self.waits.load(Ordering::SeqCst)
    }
}

impl HostPlatform for FakePlatform {
    fn is_interactive_session(&self) -> bool {
        self.interactive
    }

    fn create_event(&self) -> Result<OwnedHandle, PlatformError> {
        self.events.fetch_add(1, Ordering::SeqCst);
        Ok(self.mint.handle())
    }

    fn create_signal_pipe(&self) -> Result<SignalPipe, PlatformError> {
        if self.fail_pipe {
            return Err(PlatformError::Os {
                op: "create pipe",
                source: std::io::Error::new(std::io::ErrorKind::Other, "no pipes today"),
            });
        }
        let bytes = std::mem::take(&mut *lock(&self.signal_bytes));
        Ok(SignalPipe {
            ours: Box::new(Cursor::new(bytes)),
            theirs: self.mint.handle(),
        })
    }

    fn duplicate_current_process(&self) -> Result<OwnedHandle, PlatformError> {
        if self.fail_duplicate {
            return Err(PlatformError::Os {
                op: "duplicate process handle",
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied"),
            });
        }
        Ok(self.mint.handle())
    }

    fn wait_for_exit(&self, _process: &dyn KernelObject) {
        self.waits.fetch_add(1, Ordering::SeqCst);
    }
}

/// How the fake handler responds
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandoffScript {
    /// Activation itself fails
    Unregistered,
    /// The handler refuses the session
    Reject,
    /// The handler takes the session
    Accept,
}

/// Arguments the handler received
#[derive(Clone, Debug)]
pub struct HandoffCall {
    pub server: RawHandle,
    pub input_event: RawHandle,
    pub msg: PortableAttachMsg,
    pub signal_pipe: RawHandle,
    pub inbox_process: RawHandle,
}

struct HandlerShared {
    script: HandoffScript,
    mint: HandleMint,
    calls: Mutex<Vec<HandoffCall>>,
    activations: AtomicUsize,
}

pub struct FakeActivator {
    shared: Arc<HandlerShared>,
}

impl FakeActivator {
    /// Representative process handles come from `platform`
    pub fn new(script: HandoffScript, platform: &FakePlatform) -> Self {
        Self {
            shared: Arc::new(HandlerShared {
                script,
                mint: platform.mint(),
                calls: Mutex::new(Vec::new()),
                activations: AtomicUsize::new(0),
            }),
        }
    }

    pub fn last_call(&self) -> Option<HandoffCall> {
        lock(&self.shared.calls).last().cloned()
    }

    pub fn activations(&self) -> usize {
        self.shared.activations.load(Ordering::SeqCst)
    }
}

impl HandoffActivator for FakeActivator {
    fn activate(&self, _target: &HandoffTargetId) -> Result<Box<dyn ConsoleHandoff>, HandoffError> {
        self.shared.activations.fetch_add(1, Ordering::SeqCst);
        if self.shared.script == HandoffScript::Unregistered {
            return Err(HandoffError::Activation("class not registered".to_string()));
        }
        Ok(Box::new(FakeHandoff {
            shared: self.shared.clone(),
        }))
    }
}

struct FakeHandoff {
    shared: Arc<HandlerShared>,
}

impl ConsoleHandoff for FakeHandoff {
    fn establish_handoff(
        &self,
        server: RawHandle,
        input_event: RawHandle,
        msg: &PortableAttachMsg,
        signal_pipe: RawHandle,
        inbox_process: RawHandle,
    ) -> std::io::Result<OwnedHandle> {
        lock(&self.shared.calls).push(HandoffCall {
            server,
            input_event,
            msg: *msg,
            signal_pipe,
            inbox_process,
        });
        match self.shared.script {
            HandoffScript::Accept => Ok(self.shared.mint.handle()),
            _ => Err(std::io::Error::new(std::io::ErrorKind::Other, "E_FAIL")),
        }
    }
}

/// Console control that records calls
#[derive(Debug, Default)]
pub struct RecordingControl {
    calls: Mutex<Vec<String>>,
    fail: bool,
}

impl RecordingControl {
    pub fn failing() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    fn record(&self, call: String) -> Result<(), ServiceError> {
        lock(&self.calls).push(call);
        if self.fail {
            Err(ServiceError::Unavailable("process control"))
        } else {
            Ok(())
        }
    }
}

impl ConsoleControl for RecordingControl {
    fn notify_console_application(&self, process_id: u32) -> Result<(), ServiceError> {
        self.record(format!("notify {}", process_id))
    }

    fn set_foreground(&self, process_id: u32, foreground: bool) -> Result<(), ServiceError> {
        self.record(format!("foreground {} {}", process_id, foreground))
    }

    fn end_task(&self, process_id: u32, event_type: u32, ctrl_flags: u32) -> Result<(), ServiceError> {
        self.record(format!("end_task {} {} {}", process_id, event_type, ctrl_flags))
    }
}

/// Accessibility notifier that records events, or is broken
#[derive(Debug, Default)]
pub struct RecordingAccessibility {
    events: Mutex<Vec<String>>,
    broken: AtomicBool,
}

impl RecordingAccessibility {
    pub fn broken() -> Self {
        let notifier = Self::default();
        notifier.broken.store(true, Ordering::SeqCst);
        notifier
    }

    pub fn events(&self) -> Vec<String> {
        lock(&self.events).clone()
    }

    fn record(&self, event: String) -> Result<(), ServiceError> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(ServiceError::Unavailable("accessibility"));
        }
        lock(&self.events).push(event);
        Ok(())
    }
}

impl AccessibilityNotifier for RecordingAccessibility {
    fn start_application(&self, process_id: u32) -> Result<(), ServiceError> {
        self.record(format!("start {}", process_id))
    }

    fn end_application(&self, process_id: u32) -> Result<(), ServiceError> {
        self.record(format!("end {}", process_id))
    }
}

/// Window host counting window creations
#[derive(Debug, Default)]
pub struct RecordingWindowHost {
    calls: AtomicUsize,
    fail: bool,
}

impl RecordingWindowHost {
    pub fn failing() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail: true,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl WindowHost for RecordingWindowHost {
    fn create_window(&self, _title: &str, _window_size: Size) -> Result<(), ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            Err(ServiceError::Unavailable("desktop"))
        } else {
            Ok(())
        }
    }
}
