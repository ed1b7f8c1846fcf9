//! Request and reply shapes exchanged with the transport.

use crate::core::object::{AccessMask, HandleId, ShareMode, Size};
use crate::core::status::{ConsoleError, Status};

/// I/O function codes carried in a descriptor
pub mod function {
    pub const CONNECT: u32 = 1;
    pub const DISCONNECT: u32 = 2;
    pub const CREATE_OBJECT: u32 = 3;
    pub const CLOSE_OBJECT: u32 = 4;
    pub const USER_DEFINED: u32 = 7;
}

/// Fixed header of every request
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Descriptor {
    /// Transport-assigned request identifier
    pub identifier: u64,
    /// Process id on connect, process token afterwards
    pub process: u64,
    /// Thread id on connect, object token afterwards
    pub object: u64,
    pub function: u32,
    pub input_size: u32,
    pub output_size: u32,
}

impl Descriptor {
    pub fn id_low_part(&self) -> u32 {
        self.identifier as u32
    }

    pub fn id_high_part(&self) -> i32 {
        (self.identifier >> 32) as i32
    }
}

/// Object type requested by CreateObject
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectType {
    /// Resolve from the desired access
    Generic,
    CurrentInput,
    CurrentOutput,
    /// A fresh output buffer
    NewOutput,
}

/// Text-mode output buffer flag; the only buffer kind supported
pub const TEXTMODE_BUFFER: u32 = 0x0000_0001;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CreateObjectInfo {
    pub object_type: ObjectType,
    pub desired_access: AccessMask,
    pub share_mode: ShareMode,
    /// Buffer flags for NewOutput
    pub buffer_flags: u32,
}

impl CreateObjectInfo {
    pub fn new(object_type: ObjectType, desired_access: AccessMask, share_mode: ShareMode) -> Self {
        Self {
            object_type,
            desired_access,
            share_mode,
            buffer_flags: TEXTMODE_BUFFER,
        }
    }

    /// Resolve a generic request to input or output from its access.
    /// Read-only means input, write-only means output, anything else is invalid.
    pub fn resolve(&self) -> Result<ObjectType, ConsoleError> {
        match self.object_type {
            ObjectType::Generic => {
                let rw = self.desired_access & AccessMask::READ_WRITE;
                if rw == AccessMask::GENERIC_READ {
                    Ok(ObjectType::CurrentInput)
                } else if rw == AccessMask::GENERIC_WRITE {
                    Ok(ObjectType::CurrentOutput)
                } else {
                    Err(ConsoleError::Validation("generic object needs read-only or write-only access"))
                }
            }
            other => Ok(other),
        }
    }
}

/// Startup flag telling us the client supplied a show-window value
pub const STARTF_USESHOWWINDOW: u32 = 0x0000_0001;

/// Show-window values
pub mod show {
    pub const HIDE: u16 = 0;
    pub const SHOWMINIMIZED: u16 = 2;
    pub const MINIMIZE: u16 = 6;
    pub const SHOWMINNOACTIVE: u16 = 7;
    pub const FORCEMINIMIZE: u16 = 11;
}

/// Limits on connect strings, in UTF-16 units
pub const MAX_APP_NAME_LENGTH: usize = 128;
pub const MAX_TITLE_LENGTH: usize = 261;
pub const MAX_DIRECTORY_LENGTH: usize = 261;

/// Size of the client's connect structure on the wire
pub const CONNECT_MESSAGE_SIZE: u32 = 1760;

/// What a client sends when it connects
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectMessage {
    /// False for AttachConsole, true when the client is starting up
    pub console_app: bool,
    /// False when the client was created without a window
    pub window_visible: bool,
    pub process_group_id: u32,
    pub app_name: String,
    pub title: String,
    pub current_directory: String,
    pub startup_flags: u32,
    pub show_window: u16,
    pub screen_buffer_size: Size,
    pub window_size: Size,
}

/// Validated connect information
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectInfo {
    pub process_id: u32,
    pub thread_id: u32,
    pub console_app: bool,
    pub window_visible: bool,
    pub process_group_id: u32,
    pub app_name: String,
    pub title: String,
    pub current_directory: String,
    pub startup_flags: u32,
    pub show_window: u16,
    pub screen_buffer_size: Size,
    pub window_size: Size,
}

impl ConnectInfo {
    /// Check sizes and clip strings at their terminator
    pub fn from_message(descriptor: &Descriptor, msg: &ConnectMessage) -> Result<Self, ConsoleError> {
        if descriptor.input_size != CONNECT_MESSAGE_SIZE {
            return Err(ConsoleError::BufferSize {
                field: "connect message",
                len: descriptor.input_size as usize,
                limit: CONNECT_MESSAGE_SIZE as usize,
            });
        }

        let process_id =
            u32::try_from(descriptor.process).map_err(|_| ConsoleError::Validation("process id out of range"))?;
        let thread_id =
            u32::try_from(descriptor.object).map_err(|_| ConsoleError::Validation("thread id out of range"))?;

        Ok(Self {
            process_id,
            thread_id,
            console_app: msg.console_app,
            window_visible: msg.window_visible,
            process_group_id: msg.process_group_id,
            app_name: bounded("application name", &msg.app_name, MAX_APP_NAME_LENGTH)?,
            title: bounded("title", &msg.title, MAX_TITLE_LENGTH)?,
            current_directory: bounded("current directory", &msg.current_directory, MAX_DIRECTORY_LENGTH)?,
            startup_flags: msg.startup_flags,
            show_window: msg.show_window,
            screen_buffer_size: msg.screen_buffer_size,
            window_size: msg.window_size,
        })
    }

    /// Whether the client asked to start hidden or minimized
    pub fn requests_hidden_window(&self) -> bool {
        if self.startup_flags & STARTF_USESHOWWINDOW == 0 {
            return false;
        }
        matches!(
            self.show_window,
            show::HIDE | show::SHOWMINIMIZED | show::MINIMIZE | show::SHOWMINNOACTIVE | show::FORCEMINIMIZE
        )
    }
}

fn bounded(field: &'static str, value: &str, limit: usize) -> Result<String, ConsoleError> {
    let clipped = value.split('\0').next().unwrap_or_default();
    let len = clipped.encode_utf16().count();
    if len > limit {
        return Err(ConsoleError::BufferSize { field, len, limit });
    }
    Ok(clipped.to_string())
}

/// Opaque request to the API layer
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ApiPayload {
    pub api_number: u32,
    pub input: Vec<u8>,
}

/// Typed request body
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    CreateObject(CreateObjectInfo),
    /// Handle token is in `descriptor.object`
    CloseObject,
    Connect(ConnectMessage),
    /// Process token is in `descriptor.process`
    Disconnect,
    Api(ApiPayload),
}

/// A request as delivered by the transport
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiMessage {
    pub descriptor: Descriptor,
    pub request: Request,
}

impl ApiMessage {
    pub fn new(descriptor: Descriptor, request: Request) -> Self {
        Self { descriptor, request }
    }

    pub fn handle_token(&self) -> HandleId {
        HandleId(self.descriptor.object)
    }

    /// Reply to this message with `status`
    pub fn reply(&self, status: Status) -> Reply {
        Reply {
            identifier: self.descriptor.identifier,
            status,
            information: 0,
            payload: Vec::new(),
        }
    }
}

/// Reply written back through the transport
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    pub identifier: u64,
    pub status: Status,
    /// Handle token or byte count
    pub information: u64,
    pub payload: Vec<u8>,
}

/// Tokens returned to a client that connected successfully
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConnectionInformation {
    pub process: u64,
    pub input: u64,
    pub output: u64,
}

impl ConnectionInformation {
    pub const SIZE: usize = std::mem::size_of::<ConnectionInformation>();

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..8].copy_from_slice(&self.process.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.input.to_le_bytes());
        bytes[16..24].copy_from_slice(&self.output.to_le_bytes());
        bytes
    }
}

/// How the router finished a request
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Completion {
    /// The caller writes this reply back
    Reply(Reply),
    /// Already completed through the transport
    Completed,
    /// The API layer completes it later
    Pending,
    /// Hosting was handed to another terminal; this server is shutting down
    HandedOff,
}

impl Completion {
    /// The reply still owed to the transport, if any
    #[cfg(test)]
    pub fn into_reply(self) -> Option<Reply> {
        match self {
            Completion::Reply(reply) => Some(reply),
            _ => None,
        }
    }

    #[cfg(test)]
    pub fn status(&self) -> Option<Status> {
        match self {
            Completion::Reply(reply) => Some(reply.status),
            _ => None,
        }
    }
}
