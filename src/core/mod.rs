//! Session state managed by the server.
//!
//! - **object**: session objects, handles and share-mode enforcement
//! - **process**: per-client process records
//! - **state**: the global session state guarded by the server lock
//! - **status**: reply status codes and the client-visible error taxonomy
//!
//! # Ownership
//!
//! ```text
//! ConsoleState
//! ├── ObjectRegistry   (objects + handles)
//! ├── ProcessRegistry  (records → primary handles)
//! └── HistoryPool      (slots → owning process)
//! ```

pub mod object;
pub mod process;
pub mod state;
pub mod status;
