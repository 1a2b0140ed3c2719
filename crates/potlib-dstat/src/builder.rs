//! DstatBuilder -- fluent builder for connecting a [`SessionHandle`].
//!
//! Separates configuration from connection so that callers can set up the
//! serial port path, handshake policy, and timeouts before the wake
//! sequence goes out on the wire.
//!
//! # Example
//!
//! ```no_run
//! use potlib_dstat::DstatBuilder;
//! use std::time::Duration;
//!
//! # async fn example() -> potlib_core::Result<()> {
//! let session = DstatBuilder::new()
//!     .serial_port("/dev/ttyACM0")
//!     .read_timeout(Duration::from_secs(2))
//!     .connect()
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use potlib_core::error::{Error, Result};
use potlib_core::transport::Transport;
use potlib_transport::{SerialConfig, SerialTransport};

use crate::protocol::{DEFAULT_READ_TIMEOUT, HANDSHAKE_ATTEMPTS, HANDSHAKE_RETRY_DELAY};
use crate::session::{start_session, SessionConfig, SessionHandle};

/// Fluent builder for a DStat [`SessionHandle`].
///
/// Every knob has the instrument's standard default, so the simplest
/// usage is:
///
/// ```ignore
/// let session = DstatBuilder::new()
///     .serial_port("/dev/ttyACM0")
///     .connect()
///     .await?;
/// ```
pub struct DstatBuilder {
    serial_port: Option<String>,
    baud_rate: u32,
    write_delay: Duration,
    read_timeout: Duration,
    handshake_attempts: u32,
    handshake_retry_delay: Duration,
}

impl DstatBuilder {
    /// Create a builder with the instrument's standard link parameters.
    pub fn new() -> Self {
        DstatBuilder {
            serial_port: None,
            baud_rate: 1_000_000,
            write_delay: Duration::from_millis(1),
            read_timeout: DEFAULT_READ_TIMEOUT,
            handshake_attempts: HANDSHAKE_ATTEMPTS,
            handshake_retry_delay: HANDSHAKE_RETRY_DELAY,
        }
    }

    /// Set the serial port path (e.g. `/dev/ttyACM0` or `COM3`).
    pub fn serial_port(mut self, port: &str) -> Self {
        self.serial_port = Some(port.to_string());
        self
    }

    /// Override the baud rate. The stock firmware always runs at
    /// 1,000,000; this exists for loopback rigs and modified boards.
    pub fn baud_rate(mut self, baud: u32) -> Self {
        self.baud_rate = baud;
        self
    }

    /// Override the inter-byte write pacing delay (default: 1 ms).
    ///
    /// The firmware's UART drops bytes on back-to-back writes; only lower
    /// this for loopback testing.
    pub fn write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = delay;
        self
    }

    /// Set the per-read timeout on the serial port (default: 1 s).
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set how many ready probes are sent while connecting before the
    /// attempt fails (default: 10).
    pub fn handshake_attempts(mut self, attempts: u32) -> Self {
        self.handshake_attempts = attempts;
        self
    }

    /// Set the pause between connection-handshake probes (default: 500 ms).
    pub fn handshake_retry_delay(mut self, delay: Duration) -> Self {
        self.handshake_retry_delay = delay;
        self
    }

    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            read_timeout: self.read_timeout,
            handshake_attempts: self.handshake_attempts,
            handshake_retry_delay: self.handshake_retry_delay,
        }
    }

    /// Connect over a caller-provided transport.
    ///
    /// This is the primary entry point for testing (pass a
    /// `MockTransport` from `potlib-test-harness`) and for advanced use
    /// cases where the caller manages the transport lifecycle directly.
    /// The connection handshake runs before this returns.
    pub async fn connect_with_transport(
        self,
        transport: Box<dyn Transport>,
    ) -> Result<SessionHandle> {
        start_session(transport, self.session_config()).await
    }

    /// Open the serial port and connect.
    ///
    /// Requires that [`serial_port()`](Self::serial_port) has been called.
    pub async fn connect(self) -> Result<SessionHandle> {
        let port = self.serial_port.as_ref().ok_or_else(|| {
            Error::InvalidParameter("serial_port is required for connect()".into())
        })?;
        let config = SerialConfig {
            baud_rate: self.baud_rate,
            write_delay: self.write_delay,
            ..Default::default()
        };

        let transport = SerialTransport::open_with_config(port, config).await?;
        self.connect_with_transport(Box::new(transport)).await
    }
}

impl Default for DstatBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use potlib_test_harness::MockTransport;

    fn ready_mock() -> MockTransport {
        let mut mock = MockTransport::new();
        mock.expect(b"ck", b"");
        mock.expect(b"!", b"C\n");
        mock
    }

    #[tokio::test]
    async fn builder_defaults_connect() {
        let session = DstatBuilder::new()
            .connect_with_transport(Box::new(ready_mock()))
            .await
            .unwrap();
        assert!(session.is_open());
        session.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn builder_fluent_chain() {
        let session = DstatBuilder::new()
            .serial_port("/dev/ttyACM0")
            .baud_rate(1_000_000)
            .write_delay(Duration::from_millis(1))
            .read_timeout(Duration::from_millis(50))
            .handshake_attempts(3)
            .handshake_retry_delay(Duration::from_millis(5))
            .connect_with_transport(Box::new(ready_mock()))
            .await
            .unwrap();
        assert!(session.is_open());
        session.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn builder_serial_port_required_for_connect() {
        let result = DstatBuilder::new().connect().await;
        assert!(matches!(result, Err(Error::InvalidParameter(_))));
    }

    #[tokio::test]
    async fn builder_reports_handshake_failure() {
        let mut mock = MockTransport::new();
        mock.expect(b"ck", b"");
        for _ in 0..3 {
            mock.expect(b"!", b"");
        }
        let result = DstatBuilder::new()
            .handshake_attempts(3)
            .handshake_retry_delay(Duration::from_millis(2))
            .read_timeout(Duration::from_millis(10))
            .connect_with_transport(Box::new(mock))
            .await;
        assert!(matches!(result, Err(Error::HandshakeTimeout(3))));
    }
}
