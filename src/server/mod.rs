//! Connection server.
//!
//! - **dispatch**: the request router and the lock around session state
//! - **handoff**: the handoff policy and protocol exchange
//! - **init**: first-connect session bring-up
//! - **message**: request, reply and connect shapes
//! - **services**: collaborator traits and their defaults
//! - **signal**: the host signal relay used after a handoff
//! - **transport**: the driver connection seam and an in-memory loopback
//!
//! # Request flow
//!
//! ```text
//! transport ──► ConsoleServer::dispatch ──┬─ CreateObject / CloseObject ─► ObjectRegistry
//!                                         ├─ Connect ─► handoff? ─► yes: HandedOff
//!                                         │                      └► no:  ProcessRegistry + init
//!                                         ├─ Disconnect ─► SessionTeardown
//!                                         └─ Api ─► ApiDispatch
//! ```

pub mod dispatch;
pub mod handoff;
pub mod init;
pub mod message;
pub mod services;
pub mod signal;
pub mod transport;

pub use dispatch::{ConsoleServer, ServerOptions};
