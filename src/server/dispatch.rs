//! Request router
//!
//! [`ConsoleServer`] owns the session state behind a single mutex and turns
//! each transport request into object and process lifecycle operations.
//! Every entry point takes the lock first; the guard is released on every
//! exit path. The one exception is a confirmed handoff, which drops the guard
//! before waiting on the new host.

use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, error, info, warn};

use super::handoff::{
    self, EstablishedHandoff, HandoffActivator, HandoffConditions, HandoffError, HandoffNegotiator,
    HandoffTargetId, NoActivator,
};
use super::init::{SessionDefaults, SessionInitializer};
use super::message::{
    ApiMessage, Completion, ConnectInfo, ConnectMessage, ConnectionInformation, CreateObjectInfo,
    Descriptor, ObjectType, Request, TEXTMODE_BUFFER,
};
use super::services::{
    AccessibilityNotifier, ApiDispatch, ConsoleControl, DefaultTeardown, NoWindow, NullControl,
    SessionTeardown, TeardownOutcome, UnsupportedApi, WindowHost,
};
use super::signal::SignalRelay;
use super::transport::{DeviceComm, Published};
use crate::config::LaunchArgs;
use crate::core::object::{AccessMask, Endpoint, HandleId, OutputEndpoint, ShareMode};
use crate::core::state::{ConsoleFlags, ConsoleState};
use crate::core::status::{ConsoleError, Result, Status};
use crate::history::HistoryPool;
use crate::platform::{HostPlatform, OwnedHandle, PlatformError};
use crate::telemetry::{ApiCall, Telemetry};

/// Observable server lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    Running,
    /// Hosting moved elsewhere or the last process left
    ShuttingDown,
}

/// Static server options
#[derive(Clone, Debug, Default)]
pub struct ServerOptions {
    pub launch: LaunchArgs,
    /// Registered handoff handler, if any
    pub handoff_target: Option<HandoffTargetId>,
    pub defaults: SessionDefaults,
}

/// Starts the relay for a confirmed handoff's signal pipe
type RelayStarter = fn(Box<dyn Read + Send>, Arc<dyn ConsoleControl>) -> io::Result<SignalRelay>;

/// Builder for [`ConsoleServer`]; every collaborator has a do-nothing default
pub struct ServerBuilder {
    transport: Arc<dyn DeviceComm>,
    platform: Arc<dyn HostPlatform>,
    options: ServerOptions,
    histories: HistoryPool,
    activator: Arc<dyn HandoffActivator>,
    control: Arc<dyn ConsoleControl>,
    accessibility: Option<Arc<dyn AccessibilityNotifier>>,
    window: Arc<dyn WindowHost>,
    teardown: Arc<dyn SessionTeardown>,
    api: Arc<dyn ApiDispatch>,
    relay_starter: RelayStarter,
}

impl ServerBuilder {
    pub fn options(mut self, options: ServerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn histories(mut self, histories: HistoryPool) -> Self {
        self.histories = histories;
        self
    }

    pub fn activator(mut self, activator: Arc<dyn HandoffActivator>) -> Self {
        self.activator = activator;
        self
    }

    pub fn control(mut self, control: Arc<dyn ConsoleControl>) -> Self {
        self.control = control;
        self
    }

    pub fn accessibility(mut self, notifier: Arc<dyn AccessibilityNotifier>) -> Self {
        self.accessibility = Some(notifier);
        self
    }

    pub fn window(mut self, window: Arc<dyn WindowHost>) -> Self {
        self.window = window;
        self
    }

    #[cfg(test)]
    pub fn teardown(mut self, teardown: Arc<dyn SessionTeardown>) -> Self {
        self.teardown = teardown;
        self
    }

    #[cfg(test)]
    pub fn relay_starter(mut self, starter: RelayStarter) -> Self {
        self.relay_starter = starter;
        self
    }

    pub fn api(mut self, api: Arc<dyn ApiDispatch>) -> Self {
        self.api = api;
        self
    }

    /// Create the server and the input wake event it starts with
    pub fn build(self) -> std::result::Result<ConsoleServer, PlatformError> {
        let mut state = ConsoleState::new(self.histories);
        state.input_event = Some(self.platform.create_event()?);
        if self.options.launch.headless {
            state.flags.insert(ConsoleFlags::VT_IO);
        }

        Ok(ConsoleServer {
            state: Mutex::new(state),
            options: self.options,
            transport: self.transport,
            platform: self.platform,
            activator: self.activator,
            control: self.control,
            accessibility: self.accessibility,
            window: self.window,
            teardown: self.teardown,
            api: self.api,
            relay_starter: self.relay_starter,
            telemetry: Telemetry::new(),
            shutting_down: AtomicBool::new(false),
            relay: Mutex::new(None),
        })
    }
}

/// The connection server
pub struct ConsoleServer {
    state: Mutex<ConsoleState>,
    options: ServerOptions,
    transport: Arc<dyn DeviceComm>,
    platform: Arc<dyn HostPlatform>,
    activator: Arc<dyn HandoffActivator>,
    control: Arc<dyn ConsoleControl>,
    accessibility: Option<Arc<dyn AccessibilityNotifier>>,
    window: Arc<dyn WindowHost>,
    teardown: Arc<dyn SessionTeardown>,
    api: Arc<dyn ApiDispatch>,
    relay_starter: RelayStarter,
    telemetry: Telemetry,
    shutting_down: AtomicBool,
    relay: Mutex<Option<SignalRelay>>,
}

impl ConsoleServer {
    pub fn builder(transport: Arc<dyn DeviceComm>, platform: Arc<dyn HostPlatform>) -> ServerBuilder {
        ServerBuilder {
            transport,
            platform,
            options: ServerOptions::default(),
            histories: HistoryPool::default(),
            activator: Arc::new(NoActivator),
            control: Arc::new(NullControl),
            accessibility: None,
            window: Arc::new(NoWindow),
            teardown: Arc::new(DefaultTeardown),
            api: Arc::new(UnsupportedApi),
            relay_starter: SignalRelay::start,
        }
    }

    /// Route one request
    pub fn dispatch(&self, message: &ApiMessage) -> Completion {
        match &message.request {
            Request::CreateObject(info) => self.create_object(message, info),
            Request::CloseObject => self.close_object(message),
            Request::Connect(connect) => self.connection_request(message, connect),
            Request::Disconnect => self.client_disconnect(message),
            Request::Api(_) => self.generic_dispatch(message),
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        if self.shutting_down.load(Ordering::SeqCst) {
            Lifecycle::ShuttingDown
        } else {
            Lifecycle::Running
        }
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    /// Run `f` with the session locked
    #[cfg(test)]
    pub fn with_state<T>(&self, f: impl FnOnce(&mut ConsoleState) -> T) -> T {
        f(&mut self.lock_state())
    }

    /// Release the session and wait for the signal relay, if one is running
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.lock_state().teardown();

        let relay = self.relay.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(relay) = relay {
            relay.join();
        }
        info!("server shut down");
    }

    fn lock_state(&self) -> MutexGuard<'_, ConsoleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn create_object(&self, message: &ApiMessage, info: &CreateObjectInfo) -> Completion {
        let mut state = self.lock_state();

        let handle = match open_object(&mut state, info) {
            Ok(handle) => handle,
            Err(e) => {
                debug!(?info, "create object failed: {}", e);
                return Completion::Reply(message.reply(e.status()));
            }
        };

        let mut reply = message.reply(Status::SUCCESS);
        reply.information = self.transport.put_handle(Published::Handle(handle));
        if let Err(e) = self.transport.complete_io(&reply) {
            // The client never saw the handle
            warn!(%handle, "delivering new handle failed: {}", e);
            if let Err(e) = state.objects.free_handle(handle) {
                error!(%handle, "releasing undelivered handle failed: {}", e);
            }
        }
        Completion::Completed
    }

    fn close_object(&self, message: &ApiMessage) -> Completion {
        let mut state = self.lock_state();
        let token = message.handle_token();

        let status = match state.objects.free_handle(token) {
            Ok(_) => Status::SUCCESS,
            Err(e) => {
                debug!(handle = %token, "close object failed: {}", e);
                e.status()
            }
        };
        Completion::Reply(message.reply(status))
    }

    fn connection_request(&self, message: &ApiMessage, connect: &ConnectMessage) -> Completion {
        self.telemetry.log_api_call(ApiCall::AttachConsole);
        let mut state = self.lock_state();

        let info = match ConnectInfo::from_message(&message.descriptor, connect) {
            Ok(info) => info,
            Err(e) => {
                warn!(pid = message.descriptor.process, "malformed connect request: {}", e);
                return Completion::Reply(message.reply(e.status()));
            }
        };

        if let Some(target) = self.handoff_target(&state, &info) {
            match self.attempt_handoff(&mut state, &target, &message.descriptor) {
                Ok(representative) => {
                    self.telemetry.handoff_succeeded(&target);
                    self.shutting_down.store(true, Ordering::SeqCst);
                    drop(state);

                    info!(clsid = %target, "handed off, waiting for the new host to exit");
                    self.platform.wait_for_exit(representative.as_ref());
                    return Completion::HandedOff;
                }
                Err(e) => {
                    warn!(clsid = %target, "handoff failed, hosting locally: {}", e);
                    self.telemetry.handoff_failed(&target, &e);
                }
            }
        }

        let process_id = info.process_id;
        let connection = match self.attach_process(&mut state, &info) {
            Ok(connection) => connection,
            Err(e) => {
                warn!(pid = process_id, "connect failed: {}", e);
                return Completion::Reply(message.reply(e.status()));
            }
        };

        let mut reply = message.reply(Status::SUCCESS);
        reply.information = ConnectionInformation::SIZE as u64;
        reply.payload = connection.to_bytes().to_vec();
        if let Err(e) = self.transport.complete_io(&reply) {
            error!(pid = process_id, "delivering connect reply failed: {}", e);
            state.rollback_process(process_id);
            return Completion::Completed;
        }

        let root = state.processes.find(process_id).map(|r| r.root).unwrap_or_default();
        info!(pid = process_id, root, app = %info.app_name, "process attached");
        Completion::Completed
    }

    /// The handler to offer this connection to, if policy allows
    fn handoff_target(&self, state: &ConsoleState, info: &ConnectInfo) -> Option<HandoffTargetId> {
        let conditions = HandoffConditions::for_connect(
            info,
            &self.options.launch,
            self.platform.is_interactive_session(),
            state.is_initialized(),
            self.options.handoff_target.is_some(),
        );

        match handoff::evaluate(&conditions) {
            Ok(()) => self.options.handoff_target,
            Err(reason) => {
                debug!(%reason, "handoff not attempted");
                None
            }
        }
    }

    /// Run the exchange. On success the wake event and the relay belong to
    /// the new host's session; on failure nothing local has changed except,
    /// possibly, the wake event.
    fn attempt_handoff(
        &self,
        state: &mut ConsoleState,
        target: &HandoffTargetId,
        descriptor: &Descriptor,
    ) -> std::result::Result<OwnedHandle, HandoffError> {
        let negotiator = HandoffNegotiator {
            activator: self.activator.as_ref(),
            platform: self.platform.as_ref(),
            transport: self.transport.as_ref(),
        };
        let input_event = state.input_event.as_ref().map(|e| e.raw()).unwrap_or_default();

        let EstablishedHandoff {
            representative,
            signals,
        } = negotiator.establish(target, descriptor, input_event)?;

        // Confirmed: the handler holds its own copy of the wake event
        state.input_event = None;

        let relay = (self.relay_starter)(signals, self.control.clone()).map_err(HandoffError::Relay)?;
        *self.relay.lock().unwrap_or_else(PoisonError::into_inner) = Some(relay);
        Ok(representative)
    }

    /// Local bring-up for one process. Nothing of the process is left behind on error.
    fn attach_process(&self, state: &mut ConsoleState, info: &ConnectInfo) -> Result<ConnectionInformation> {
        let process_id = info.process_id;
        let thread_id = info.thread_id;

        let root = !state.is_initialized();
        state
            .processes
            .allocate(process_id, thread_id, info.process_group_id)?
            .root = root;

        match self.complete_attach(state, process_id, info) {
            Ok(connection) => Ok(connection),
            Err(e) => {
                state.rollback_process(process_id);
                Err(e)
            }
        }
    }

    fn complete_attach(
        &self,
        state: &mut ConsoleState,
        process_id: u32,
        info: &ConnectInfo,
    ) -> Result<ConnectionInformation> {
        if info.console_app {
            if let Err(e) = self.control.notify_console_application(process_id) {
                warn!(pid = process_id, "console application notification failed: {}", e);
            }
        }
        self.notify_accessibility(process_id, true);

        if !state.is_initialized() {
            let initializer = SessionInitializer {
                platform: self.platform.as_ref(),
                window: self.window.as_ref(),
                defaults: &self.options.defaults,
                headless: self.options.launch.headless,
            };
            initializer.allocate_console(state, info)?;
        }

        if let Err(e) = state.histories.allocate(&info.app_name, process_id) {
            warn!(pid = process_id, app = %info.app_name, "no command history: {}", e);
        }

        let foreground = state.grants_foreground();
        for pid in state.processes.modify_focus(foreground) {
            if let Err(e) = self.control.set_foreground(pid, foreground) {
                warn!(pid, foreground, "changing foreground rights failed: {}", e);
            }
        }

        let input = state
            .input
            .ok_or(ConsoleError::Allocation("input endpoint missing"))?;
        let output = state
            .active_output
            .ok_or(ConsoleError::Allocation("output buffer missing"))?;

        let input_handle = state
            .objects
            .allocate_handle(input, AccessMask::READ_WRITE, ShareMode::ALL)?;
        set_primary_handle(state, process_id, input_handle, true)?;

        let output_handle = state
            .objects
            .allocate_handle(output, AccessMask::READ_WRITE, ShareMode::ALL)?;
        set_primary_handle(state, process_id, output_handle, false)?;

        let process = self.transport.put_handle(Published::Process(process_id));
        state
            .processes
            .find_mut(process_id)
            .ok_or(ConsoleError::UnknownProcess(process_id))?
            .token = Some(process);

        Ok(ConnectionInformation {
            process,
            input: self.transport.put_handle(Published::Handle(input_handle)),
            output: self.transport.put_handle(Published::Handle(output_handle)),
        })
    }

    fn client_disconnect(&self, message: &ApiMessage) -> Completion {
        self.telemetry.log_api_call(ApiCall::FreeConsole);
        let token = message.descriptor.process;
        let mut state = self.lock_state();

        let Some(process_id) = state.processes.find_by_token(token).map(|r| r.process_id) else {
            warn!(token, "disconnect for unknown process token");
            return Completion::Reply(message.reply(Status::SUCCESS));
        };

        self.notify_accessibility(process_id, false);
        info!(pid = process_id, "process detached");

        match self.teardown.remove_console(&mut state, process_id) {
            Ok(TeardownOutcome::CloseSession) => {
                info!("last process left, closing session");
                self.shutting_down.store(true, Ordering::SeqCst);
            }
            Ok(TeardownOutcome::Continue) => {}
            Err(e) => warn!(pid = process_id, "removing process failed: {}", e),
        }
        Completion::Reply(message.reply(Status::SUCCESS))
    }

    fn generic_dispatch(&self, message: &ApiMessage) -> Completion {
        let mut state = self.lock_state();
        let token = message.descriptor.process;

        if state.processes.find_by_token(token).is_none() {
            debug!(token, "request from unknown process token");
            return Completion::Reply(message.reply(Status::INVALID_HANDLE));
        }
        match self.api.dispatch(&mut state, message) {
            Some(reply) => Completion::Reply(reply),
            None => Completion::Pending,
        }
    }

    fn notify_accessibility(&self, process_id: u32, start: bool) {
        let Some(notifier) = &self.accessibility else {
            return;
        };
        let result = if start {
            notifier.start_application(process_id)
        } else {
            notifier.end_application(process_id)
        };
        if let Err(e) = result {
            warn!(pid = process_id, start, "accessibility notification failed: {}", e);
        }
    }
}

/// Open a handle for CreateObject
fn open_object(state: &mut ConsoleState, info: &CreateObjectInfo) -> Result<HandleId> {
    if !state.is_initialized() {
        return Err(ConsoleError::Validation("session is not initialized"));
    }

    let object = match info.resolve()? {
        ObjectType::CurrentInput => state.input,
        ObjectType::CurrentOutput => state.active_output,
        ObjectType::NewOutput => {
            if info.buffer_flags != TEXTMODE_BUFFER {
                return Err(ConsoleError::Validation("only text-mode buffers are supported"));
            }
            let (buffer_size, window_size) = state
                .active_output_size()
                .ok_or(ConsoleError::Validation("no active output buffer"))?;
            let id = state.objects.create_object(
                Endpoint::Output(OutputEndpoint {
                    buffer_size,
                    window_size,
                }),
                false,
            );
            let opened = state
                .objects
                .allocate_handle(id, info.desired_access, info.share_mode);
            if opened.is_err() {
                state.objects.unpin(id);
            }
            return opened;
        }
        ObjectType::Generic => None,
    }
    .ok_or(ConsoleError::Validation("endpoint does not exist"))?;

    state
        .objects
        .allocate_handle(object, info.desired_access, info.share_mode)
}

fn set_primary_handle(state: &mut ConsoleState, process_id: u32, handle: HandleId, input: bool) -> Result<()> {
    let Some(record) = state.processes.find_mut(process_id) else {
        state.objects.free_handle(handle)?;
        return Err(ConsoleError::UnknownProcess(process_id));
    };
    if input {
        record.input_handle = Some(handle);
    } else {
        record.output_handle = Some(handle);
    }
    Ok(())
}
