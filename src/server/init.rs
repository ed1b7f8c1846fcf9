//! Session initializer
//!
//! One-time local bring-up run for the first process that connects:
//! creates the input endpoint and main output buffer, picks the title and
//! asks the window host for a window.

use tracing::{info, warn};

use super::message::ConnectInfo;
use super::services::WindowHost;
use crate::core::object::{Endpoint, InputEndpoint, OutputEndpoint, Size};
use crate::core::state::{ConsoleFlags, ConsoleState};
use crate::core::status::{ConsoleError, Result};
use crate::platform::HostPlatform;

/// Values used when the connecting client does not supply them
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionDefaults {
    pub screen_buffer_size: Size,
    pub window_size: Size,
    pub title: String,
}

impl Default for SessionDefaults {
    fn default() -> Self {
        Self {
            screen_buffer_size: Size::new(120, 9001),
            window_size: Size::new(120, 30),
            title: "Console".to_string(),
        }
    }
}

pub struct SessionInitializer<'a> {
    pub platform: &'a dyn HostPlatform,
    pub window: &'a dyn WindowHost,
    pub defaults: &'a SessionDefaults,
    pub headless: bool,
}

impl SessionInitializer<'_> {
    /// Bring the session up. On error the state is left uninitialized.
    pub fn allocate_console(&self, state: &mut ConsoleState, info: &ConnectInfo) -> Result<()> {
        if state.is_initialized() {
            return Ok(());
        }

        // A failed handoff may have given the wake event away
        if state.input_event.is_none() {
            warn!("input event missing, creating a new one");
            let event = self
                .platform
                .create_event()
                .map_err(|e| ConsoleError::Initialization(e.to_string()))?;
            state.input_event = Some(event);
        }
        let wake_event = state
            .input_event
            .as_ref()
            .map(|e| e.raw())
            .unwrap_or_default();

        let title = [info.title.as_str(), info.app_name.as_str()]
            .into_iter()
            .find(|t| !t.is_empty())
            .unwrap_or(self.defaults.title.as_str())
            .to_string();

        let buffer_size = pick(info.screen_buffer_size, self.defaults.screen_buffer_size);
        let mut window_size = pick(info.window_size, self.defaults.window_size);
        window_size.width = window_size.width.min(buffer_size.width);
        window_size.height = window_size.height.min(buffer_size.height);

        let input = state
            .objects
            .create_object(Endpoint::Input(InputEndpoint { wake_event }), true);
        let output = state.objects.create_object(
            Endpoint::Output(OutputEndpoint {
                buffer_size,
                window_size,
            }),
            true,
        );

        if !self.headless {
            if let Err(e) = self.window.create_window(&title, window_size) {
                state.objects.unpin(input);
                state.objects.unpin(output);
                return Err(ConsoleError::Initialization(e.to_string()));
            }
        }

        state.input = Some(input);
        state.active_output = Some(output);
        state.title = title;
        state.flags.insert(ConsoleFlags::INITIALIZED);

        info!(
            title = %state.title,
            width = buffer_size.width,
            height = buffer_size.height,
            headless = self.headless,
            "session initialized"
        );
        Ok(())
    }
}

fn pick(requested: Size, fallback: Size) -> Size {
    if requested.is_empty() {
        fallback
    } else {
        requested
    }
}
