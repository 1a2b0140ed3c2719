//! Asynchronous session event types.
//!
//! Events are emitted by the connection session through a
//! `tokio::sync::broadcast` channel as the link to the instrument changes
//! state. Frontends subscribe to these for status indicators without
//! polling the session handle.

use crate::types::RunStatus;

/// An event emitted by a connection session when its state changes.
///
/// Delivered on a best-effort basis through a bounded broadcast channel;
/// slow consumers may miss events.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The handshake completed and the session is ready for tasks.
    Connected,

    /// A submitted task has started executing on the wire.
    TaskStarted,

    /// A task finished with the given terminal status.
    TaskFinished {
        /// Terminal status of the task.
        status: RunStatus,
    },

    /// The session closed its transport and shut down.
    Disconnected,
}
