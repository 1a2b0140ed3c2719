//! potlib-core: Core traits, types, and error definitions for potlib.
//!
//! This crate defines the instrument-agnostic abstractions that the potlib
//! driver crates build on. Consumer applications (plotting frontends, data
//! loggers) depend on these types without pulling in a specific instrument
//! backend or a serial stack.
//!
//! # Key types
//!
//! - [`Transport`] -- byte-level communication channel
//! - [`Sample`] / [`RunStatus`] -- the decoded measurement vocabulary
//! - [`SessionEvent`] -- asynchronous connection lifecycle notifications
//! - [`Error`] / [`Result`] -- error handling

pub mod error;
pub mod events;
pub mod transport;
pub mod types;

// Re-export key types at crate root for ergonomic `use potlib_core::*`.
pub use error::{Error, Result};
pub use events::SessionEvent;
pub use transport::Transport;
pub use types::*;
