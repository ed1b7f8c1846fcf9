//! Host signal relay
//!
//! After a handoff the new host cannot call process-control APIs on our
//! behalf, so it writes requests into a pipe and this relay performs them.
//!
//! Packet layout (little-endian):
//!
//! ```text
//! u8   code          1 = NotifyApp, 5 = SetForeground, 7 = EndTask
//! u32  size          byte length of the body, including this field
//! ...  body          process id, then code-specific fields
//! ```

use std::io::{self, Read};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use thiserror::Error;
use tracing::{debug, info, warn};

use super::services::ConsoleControl;

const NOTIFY_APP: u8 = 1;
const SET_FOREGROUND: u8 = 5;
const END_TASK: u8 = 7;

/// Largest body accepted; anything bigger is a corrupt stream
const MAX_BODY: u32 = 64;

#[derive(Error, Debug)]
pub enum SignalError {
    #[error("Failed to read signal: {0}")]
    Read(#[from] io::Error),

    #[error("Unknown signal code {0}")]
    UnknownCode(u8),

    #[error("Signal {code} has bad size {size}")]
    BadSize { code: u8, size: u32 },
}

/// A request from the new host
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostSignal {
    NotifyApp {
        process_id: u32,
    },
    SetForeground {
        process_id: u32,
        is_foreground: bool,
    },
    EndTask {
        process_id: u32,
        event_type: u32,
        ctrl_flags: u32,
    },
}

impl HostSignal {
    /// Minimum body size for a signal code
    fn min_size(code: u8) -> Option<u32> {
        match code {
            NOTIFY_APP => Some(8),
            SET_FOREGROUND => Some(9),
            END_TASK => Some(16),
            _ => None,
        }
    }

    /// Encode as written by the host side
    #[cfg(test)]
    pub fn to_bytes(&self) -> Vec<u8> {
        let (code, fields): (u8, Vec<u8>) = match *self {
            HostSignal::NotifyApp { process_id } => (NOTIFY_APP, process_id.to_le_bytes().to_vec()),
            HostSignal::SetForeground { process_id, is_foreground } => {
                let mut f = process_id.to_le_bytes().to_vec();
                f.extend_from_slice(&[u8::from(is_foreground), 0, 0, 0]);
                (SET_FOREGROUND, f)
            }
            HostSignal::EndTask { process_id, event_type, ctrl_flags } => {
                let mut f = process_id.to_le_bytes().to_vec();
                f.extend_from_slice(&event_type.to_le_bytes());
                f.extend_from_slice(&ctrl_flags.to_le_bytes());
                (END_TASK, f)
            }
        };
        let mut bytes = vec![code];
        bytes.extend_from_slice(&(fields.len() as u32 + 4).to_le_bytes());
        bytes.extend_from_slice(&fields);
        bytes
    }
}

/// Read one signal. `Ok(None)` when the stream ends between packets.
pub fn read_signal<R: Read + ?Sized>(reader: &mut R) -> Result<Option<HostSignal>, SignalError> {
    let mut code = [0u8; 1];
    match reader.read_exact(&mut code) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let code = code[0];
    let min = HostSignal::min_size(code).ok_or(SignalError::UnknownCode(code))?;

    let mut size = [0u8; 4];
    reader.read_exact(&mut size)?;
    let size = u32::from_le_bytes(size);
    if size < min || size > MAX_BODY {
        return Err(SignalError::BadSize { code, size });
    }

    let mut body = vec![0u8; (size - 4) as usize];
    reader.read_exact(&mut body)?;
    let u32_at = |at: usize| u32::from_le_bytes([body[at], body[at + 1], body[at + 2], body[at + 3]]);

    let signal = match code {
        NOTIFY_APP => HostSignal::NotifyApp { process_id: u32_at(0) },
        SET_FOREGROUND => HostSignal::SetForeground {
            process_id: u32_at(0),
            is_foreground: body[4] != 0,
        },
        _ => HostSignal::EndTask {
            process_id: u32_at(0),
            event_type: u32_at(4),
            ctrl_flags: u32_at(8),
        },
    };
    Ok(Some(signal))
}

/// Forward one signal to the console control collaborator
fn relay(control: &dyn ConsoleControl, signal: HostSignal) {
    let result = match signal {
        HostSignal::NotifyApp { process_id } => control.notify_console_application(process_id),
        HostSignal::SetForeground { process_id, is_foreground } => control.set_foreground(process_id, is_foreground),
        HostSignal::EndTask { process_id, event_type, ctrl_flags } => {
            control.end_task(process_id, event_type, ctrl_flags)
        }
    };
    if let Err(e) = result {
        warn!(?signal, "relaying host signal failed: {}", e);
    }
}

/// Background thread draining the signal pipe
pub struct SignalRelay {
    thread: Option<JoinHandle<()>>,
}

impl SignalRelay {
    /// Spawn the relay thread
    pub fn start(mut reader: Box<dyn Read + Send>, control: Arc<dyn ConsoleControl>) -> io::Result<Self> {
        let thread = thread::Builder::new()
            .name("host-signal".to_string())
            .spawn(move || {
                loop {
                    match read_signal(&mut *reader) {
                        Ok(Some(signal)) => {
                            debug!(?signal, "host signal");
                            relay(control.as_ref(), signal);
                        }
                        Ok(None) => {
                            info!("signal pipe closed");
                            break;
                        }
                        Err(e) => {
                            warn!("signal relay stopping: {}", e);
                            break;
                        }
                    }
                }
            })?;

        Ok(Self { thread: Some(thread) })
    }

    /// Wait for the pipe to close
    pub fn join(mut self) {
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}
