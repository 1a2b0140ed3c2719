//! Transport trait for instrument communication.
//!
//! The [`Transport`] trait abstracts over the physical link to the
//! potentiostat. The production implementation wraps a USB virtual COM
//! port (`potlib-transport`); tests substitute a deterministic mock
//! (`potlib-test-harness`).
//!
//! Protocol engines (the DStat codec in `potlib-dstat`) operate on a
//! `Transport` rather than directly on a serial port, so the same framing
//! and sample-decoding code runs against real hardware and against
//! scripted byte streams.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

/// Asynchronous byte-level transport to an instrument.
///
/// Implementations handle buffering and error recovery at the physical
/// layer. Protocol-level concerns (command framing, record decoding) are
/// handled by the engine that consumes this trait.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send raw bytes to the instrument.
    ///
    /// Implementations must not return until every byte has been handed
    /// to the underlying link. Implementations over a real serial port
    /// additionally pace the write to honor the instrument's inter-byte
    /// timing requirement (see `potlib-transport`); mocks may deliver the
    /// bytes instantly.
    async fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Receive bytes from the instrument into the provided buffer.
    ///
    /// Returns the number of bytes actually read. Will wait up to `timeout`
    /// for data to arrive; returns [`Error::Timeout`](crate::error::Error::Timeout)
    /// if no data is received within the deadline.
    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Close the transport connection.
    ///
    /// After calling `close()`, subsequent `send()` and `receive()` calls
    /// should return [`Error::NotConnected`](crate::error::Error::NotConnected).
    /// Closing an already-closed transport is a no-op.
    async fn close(&mut self) -> Result<()>;

    /// Check whether the transport is currently connected.
    fn is_connected(&self) -> bool;
}
