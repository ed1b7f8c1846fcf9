//! Handoff negotiator
//!
//! Decides whether a new session should be hosted by a registered terminal
//! instead of this server, and runs the one-shot protocol exchange with it.
//!
//! The exchange is a pipeline of fallible steps. Every resource created along
//! the way is an [`OwnedHandle`], so an early `?` closes whatever was made so
//! far and nothing else. Once the handler confirms, the local copies of what
//! it received are closed exactly once, and only the representative process
//! and our end of the signal pipe are returned.

use std::fmt;
use std::io::Read;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::message::{ConnectInfo, Descriptor};
use super::transport::{DeviceComm, TransportError};
use crate::config::LaunchArgs;
use crate::platform::{HostPlatform, OwnedHandle, PlatformError, RawHandle, SignalPipe};

/// Class id of a registered handoff handler
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandoffTargetId(pub Uuid);

impl fmt::Display for HandoffTargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}", self.0.hyphenated().to_string().to_uppercase())
    }
}

impl std::str::FromStr for HandoffTargetId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim_matches(|c| c == '{' || c == '}')).map(HandoffTargetId)
    }
}

#[derive(Error, Debug)]
pub enum HandoffError {
    #[error("Failed to activate handoff handler: {0}")]
    Activation(String),

    #[error("Failed to get server handle: {0}")]
    ServerHandle(#[from] TransportError),

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error("Handoff handler refused the session: {0}")]
    Rejected(#[source] std::io::Error),

    #[error("Failed to start signal relay: {0}")]
    Relay(#[source] std::io::Error),
}

/// Inputs to the handoff decision, all known before any local state changes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HandoffConditions {
    pub interactive_session: bool,
    pub handoff_disabled: bool,
    pub force_local: bool,
    pub session_initialized: bool,
    pub console_app: bool,
    pub headless: bool,
    pub target_registered: bool,
    pub is_handoff_target: bool,
    pub window_visible: bool,
    pub hidden_window_requested: bool,
}

impl HandoffConditions {
    /// Conditions for a connect request, given the session-wide inputs
    pub fn for_connect(
        info: &ConnectInfo,
        launch: &LaunchArgs,
        interactive_session: bool,
        session_initialized: bool,
        target_registered: bool,
    ) -> Self {
        Self {
            interactive_session,
            handoff_disabled: launch.force_no_handoff,
            force_local: launch.create_server_handle,
            session_initialized,
            console_app: info.console_app,
            headless: launch.headless,
            target_registered,
            is_handoff_target: launch.handoff_target,
            window_visible: info.window_visible,
            hidden_window_requested: info.requests_hidden_window(),
        }
    }
}

/// Why handoff was not attempted
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decline {
    NotInteractive,
    Disabled,
    ForcedLocal,
    AlreadyInitialized,
    AttachOnly,
    Headless,
    NoTarget,
    AlreadyTarget,
    NoVisibleWindow,
    HiddenWindow,
}

impl fmt::Display for Decline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Decline::NotInteractive => "session is not interactive",
            Decline::Disabled => "handoff disabled by launch argument",
            Decline::ForcedLocal => "local hosting requested",
            Decline::AlreadyInitialized => "session already initialized",
            Decline::AttachOnly => "attach to existing console",
            Decline::Headless => "headless session",
            Decline::NoTarget => "no handoff target registered",
            Decline::AlreadyTarget => "already a handoff target",
            Decline::NoVisibleWindow => "client has no window",
            Decline::HiddenWindow => "client starts hidden or minimized",
        };
        f.write_str(s)
    }
}

/// Evaluate the handoff policy, stopping at the first failing condition
pub fn evaluate(c: &HandoffConditions) -> Result<(), Decline> {
    if !c.interactive_session {
        return Err(Decline::NotInteractive);
    }
    if c.handoff_disabled {
        return Err(Decline::Disabled);
    }
    if c.force_local {
        return Err(Decline::ForcedLocal);
    }
    if c.session_initialized {
        return Err(Decline::AlreadyInitialized);
    }
    if !c.console_app {
        return Err(Decline::AttachOnly);
    }
    if c.headless {
        return Err(Decline::Headless);
    }
    if !c.target_registered {
        return Err(Decline::NoTarget);
    }
    if c.is_handoff_target {
        return Err(Decline::AlreadyTarget);
    }
    if !c.window_visible {
        return Err(Decline::NoVisibleWindow);
    }
    if c.hidden_window_requested {
        return Err(Decline::HiddenWindow);
    }
    Ok(())
}

/// Just enough of the connect request for the handler to pick it up again
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PortableAttachMsg {
    pub id_low_part: u32,
    pub id_high_part: i32,
    pub process: u64,
    pub object: u64,
    pub function: u32,
    pub input_size: u32,
    pub output_size: u32,
}

impl From<&Descriptor> for PortableAttachMsg {
    fn from(d: &Descriptor) -> Self {
        Self {
            id_low_part: d.id_low_part(),
            id_high_part: d.id_high_part(),
            process: d.process,
            object: d.object,
            function: d.function,
            input_size: d.input_size,
            output_size: d.output_size,
        }
    }
}

/// The external handler's single operation
pub trait ConsoleHandoff {
    /// Take over the session. Returns a handle to the process that now
    /// represents it; this server lives until that process exits.
    fn establish_handoff(
        &self,
        server: RawHandle,
        input_event: RawHandle,
        msg: &PortableAttachMsg,
        signal_pipe: RawHandle,
        inbox_process: RawHandle,
    ) -> std::io::Result<OwnedHandle>;
}

/// Finds and instantiates the registered handler (local machine only)
pub trait HandoffActivator: Send + Sync {
    fn activate(&self, target: &HandoffTargetId) -> Result<Box<dyn ConsoleHandoff>, HandoffError>;
}

/// Activator for builds without out-of-process handlers
#[derive(Debug, Default)]
pub struct NoActivator;

impl HandoffActivator for NoActivator {
    fn activate(&self, target: &HandoffTargetId) -> Result<Box<dyn ConsoleHandoff>, HandoffError> {
        Err(HandoffError::Activation(format!("no activator for {}", target)))
    }
}

/// What a confirmed handoff leaves us
pub struct EstablishedHandoff {
    /// Process we wait on before exiting
    pub representative: OwnedHandle,
    /// Our end of the signal pipe
    pub signals: Box<dyn Read + Send>,
}

impl fmt::Debug for EstablishedHandoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EstablishedHandoff")
            .field("representative", &self.representative)
            .finish()
    }
}

/// Runs the protocol exchange
pub struct HandoffNegotiator<'a> {
    pub activator: &'a dyn HandoffActivator,
    pub platform: &'a dyn HostPlatform,
    pub transport: &'a dyn DeviceComm,
}

impl HandoffNegotiator<'_> {
    /// Offer the session described by `descriptor` to `target`
    pub fn establish(
        &self,
        target: &HandoffTargetId,
        descriptor: &Descriptor,
        input_event: RawHandle,
    ) -> Result<EstablishedHandoff, HandoffError> {
        let handoff = self.activator.activate(target)?;

        let msg = PortableAttachMsg::from(descriptor);
        let server = self.transport.server_handle()?;

        let SignalPipe { ours, theirs } = self.platform.create_signal_pipe()?;
        let our_process = self.platform.duplicate_current_process()?;

        let representative = handoff
            .establish_handoff(server, input_event, &msg, theirs.raw(), our_process.raw())
            .map_err(HandoffError::Rejected)?;

        // The handler duplicated what it needs
        drop(theirs);
        drop(our_process);

        Ok(EstablishedHandoff {
            representative,
            signals: ours,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::message::{function, show, ConnectMessage, STARTF_USESHOWWINDOW};
    use crate::server::transport::LoopbackTransport;
    use crate::testing::{FakeActivator, FakePlatform, HandoffScript};

    fn accepting() -> HandoffConditions {
        HandoffConditions {
            interactive_session: true,
            handoff_disabled: false,
            force_local: false,
            session_initialized: false,
            console_app: true,
            headless: false,
            target_registered: true,
            is_handoff_target: false,
            window_visible: true,
            hidden_window_requested: false,
        }
    }

    /// Set condition `i` to its blocking value
    fn block(c: &mut HandoffConditions, i: usize) {
        match i {
            0 => c.interactive_session = false,
            1 => c.handoff_disabled = true,
            2 => c.force_local = true,
            3 => c.session_initialized = true,
            4 => c.console_app = false,
            5 => c.headless = true,
            6 => c.target_registered = false,
            7 => c.is_handoff_target = true,
            8 => c.window_visible = false,
            9 => c.hidden_window_requested = true,
            _ => unreachable!(),
        }
    }

    fn from_bits(bits: u32) -> HandoffConditions {
        let bit = |i: u32| bits & (1 << i) != 0;
        HandoffConditions {
            interactive_session: bit(0),
            handoff_disabled: bit(1),
            force_local: bit(2),
            session_initialized: bit(3),
            console_app: bit(4),
            headless: bit(5),
            target_registered: bit(6),
            is_handoff_target: bit(7),
            window_visible: bit(8),
            hidden_window_requested: bit(9),
        }
    }

    fn descriptor() -> Descriptor {
        Descriptor {
            identifier: (3u64 << 32) | 0x44,
            process: 100,
            object: 7,
            function: function::CONNECT,
            input_size: 1760,
            output_size: 24,
        }
    }

    #[test]
    fn test_accepts_when_all_conditions_hold() {
        assert_eq!(evaluate(&accepting()), Ok(()));
    }

    #[test]
    fn test_each_condition_blocks_alone() {
        let expected = [
            Decline::NotInteractive,
            Decline::Disabled,
            Decline::ForcedLocal,
            Decline::AlreadyInitialized,
            Decline::AttachOnly,
            Decline::Headless,
            Decline::NoTarget,
            Decline::AlreadyTarget,
            Decline::NoVisibleWindow,
            Decline::HiddenWindow,
        ];
        for (i, reason) in expected.iter().enumerate() {
            let mut c = accepting();
            block(&mut c, i);
            assert_eq!(evaluate(&c), Err(*reason));
        }
    }

    #[test]
    fn test_blocking_is_monotonic_over_all_combinations() {
        for bits in 0..(1u32 << 10) {
            for i in 0..10 {
                let mut c = from_bits(bits);
                block(&mut c, i);
                assert!(evaluate(&c).is_err(), "bits={:#b} blocked={}", bits, i);
            }
        }
    }

    #[test]
    fn test_conditions_for_connect() {
        let msg = ConnectMessage {
            console_app: true,
            window_visible: true,
            startup_flags: STARTF_USESHOWWINDOW,
            show_window: show::HIDE,
            ..Default::default()
        };
        let info = ConnectInfo::from_message(&descriptor(), &msg).unwrap();
        let launch = LaunchArgs {
            headless: true,
            handoff_target: true,
            ..Default::default()
        };

        let c = HandoffConditions::for_connect(&info, &launch, true, false, true);
        assert!(c.interactive_session && c.target_registered && c.console_app && c.window_visible);
        assert!(c.headless && c.is_handoff_target && c.hidden_window_requested);
        assert!(!c.handoff_disabled && !c.force_local && !c.session_initialized);
        assert_eq!(evaluate(&c), Err(Decline::Headless));
    }

    #[test]
    fn test_short_circuits_on_first_failure() {
        let mut c = accepting();
        c.headless = true;
        c.interactive_session = false;
        assert_eq!(evaluate(&c), Err(Decline::NotInteractive));
    }

    #[test]
    fn test_target_id_round_trips_braced_form() {
        let id: HandoffTargetId = "{2eaca947-7f5f-4cfa-ba87-8f7fbeefbe69}".parse().unwrap();
        assert_eq!(id.to_string(), "{2EACA947-7F5F-4CFA-BA87-8F7FBEEFBE69}");
        assert!("not-a-guid".parse::<HandoffTargetId>().is_err());
    }

    #[test]
    fn test_portable_msg_copies_identity() {
        let msg = PortableAttachMsg::from(&descriptor());
        assert_eq!(msg.id_low_part, 0x44);
        assert_eq!(msg.id_high_part, 3);
        assert_eq!(msg.process, 100);
        assert_eq!(msg.object, 7);
        assert_eq!(msg.function, function::CONNECT);
    }

    #[test]
    fn test_success_closes_transferred_copies_once() {
        let platform = FakePlatform::new();
        let activator = FakeActivator::new(HandoffScript::Accept, &platform);
        let transport = LoopbackTransport::with_server_handle(RawHandle(0x500));
        let negotiator = HandoffNegotiator {
            activator: &activator,
            platform: &platform,
            transport: &transport,
        };

        let target = HandoffTargetId(Uuid::nil());
        let established = negotiator
            .establish(&target, &descriptor(), RawHandle(0x77))
            .unwrap();

        let call = activator.last_call().unwrap();
        assert_eq!(call.server, RawHandle(0x500));
        assert_eq!(call.input_event, RawHandle(0x77));
        assert_eq!(call.msg.process, 100);

        // Far pipe end and our process duplicate are gone, the representative is not
        let closed = platform.closed();
        assert!(closed.contains(&call.signal_pipe));
        assert!(closed.contains(&call.inbox_process));
        assert!(!closed.contains(&established.representative.raw()));
        platform.assert_no_double_close();
    }

    #[test]
    fn test_rejection_releases_everything_once() {
        let platform = FakePlatform::new();
        let activator = FakeActivator::new(HandoffScript::Reject, &platform);
        let transport = LoopbackTransport::with_server_handle(RawHandle(0x500));
        let negotiator = HandoffNegotiator {
            activator: &activator,
            platform: &platform,
            transport: &transport,
        };

        let err = negotiator
            .establish(&HandoffTargetId(Uuid::nil()), &descriptor(), RawHandle(0x77))
            .unwrap_err();

        assert!(matches!(err, HandoffError::Rejected(_)));
        assert_eq!(platform.open_handles(), 0);
        platform.assert_no_double_close();
    }

    #[test]
    fn test_failure_before_handler_call_never_invokes_it() {
        let platform = FakePlatform::new().failing_duplicate();
        let activator = FakeActivator::new(HandoffScript::Accept, &platform);
        let transport = LoopbackTransport::with_server_handle(RawHandle(0x500));
        let negotiator = HandoffNegotiator {
            activator: &activator,
            platform: &platform,
            transport: &transport,
        };

        let err = negotiator
            .establish(&HandoffTargetId(Uuid::nil()), &descriptor(), RawHandle(0x77))
            .unwrap_err();

        assert!(matches!(
            err,
            HandoffError::Platform(PlatformError::Os { op: "duplicate process handle", .. })
        ));
        assert!(activator.last_call().is_none());
        // The pipe made before the failing step was closed on the way out
        assert_eq!(platform.open_handles(), 0);
        platform.assert_no_double_close();
    }

    #[test]
    fn test_missing_server_handle_fails_early() {
        let platform = FakePlatform::new();
        let activator = FakeActivator::new(HandoffScript::Accept, &platform);
        let transport = LoopbackTransport::new();
        let negotiator = HandoffNegotiator {
            activator: &activator,
            platform: &platform,
            transport: &transport,
        };

        let err = negotiator
            .establish(&HandoffTargetId(Uuid::nil()), &descriptor(), RawHandle(0x77))
            .unwrap_err();
        assert!(matches!(err, HandoffError::ServerHandle(_)));
        assert_eq!(platform.open_handles(), 0);
    }

    #[test]
    fn test_no_activator_declines() {
        let err = NoActivator.activate(&HandoffTargetId(Uuid::nil())).err().unwrap();
        assert!(matches!(err, HandoffError::Activation(_)));
    }
}
