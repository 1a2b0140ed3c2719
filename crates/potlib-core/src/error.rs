//! Error types for potlib.
//!
//! All fallible operations across the library return [`Result<T>`], which
//! uses [`Error`] as the error type. Transport-layer, protocol-layer, and
//! task-layer errors are all captured here.

/// The error type for all potlib operations.
///
/// Variants cover the full range of failure modes seen when driving a
/// potentiostat over USB-serial: physical transport failures, protocol
/// decode errors, timeouts, parameter validation failures, and the
/// distinguished user-abort path.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A transport-level error (serial port open/read/write failure).
    #[error("transport error: {0}")]
    Transport(String),

    /// A protocol-level error (record length mismatch, unparseable
    /// response line, unexpected framing).
    ///
    /// Distinct from [`Error::Transport`]: the port is healthy but the
    /// byte stream does not match what the firmware is documented to send.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Timed out waiting for a response from the instrument.
    #[error("timeout waiting for response")]
    Timeout,

    /// The instrument never answered the ready probe during connection
    /// establishment. Carries the number of probe attempts made.
    ///
    /// This typically means the board is unpowered, still in its
    /// bootloader, or the wrong device path was given.
    #[error("instrument not ready after {0} probe attempts")]
    HandshakeTimeout(u32),

    /// An invalid parameter was passed to a task constructor.
    ///
    /// Parameter validation is the caller's job; this variant exists so
    /// that construction fails loudly instead of clamping silently.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// The task was stopped by an abort request.
    ///
    /// Not a fault: this is the normal outcome of a user pressing stop
    /// mid-run, and is never logged at error severity.
    #[error("aborted by request")]
    Aborted,

    /// No connection to the instrument has been established.
    #[error("not connected")]
    NotConnected,

    /// The connection to the instrument was lost unexpectedly.
    #[error("connection lost")]
    ConnectionLost,

    /// An underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;
