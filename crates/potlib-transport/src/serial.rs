//! Serial port transport for instrument communication.
//!
//! This module provides [`SerialTransport`], which implements the
//! [`Transport`] trait for the potentiostat's USB virtual COM port.
//!
//! The instrument's UART drops bytes when commands arrive back-to-back at
//! full line rate, so `send()` writes one byte at a time with a short
//! inter-byte delay (1 ms by default, configurable via
//! [`SerialConfig::write_delay`]). All protocol code goes through this
//! paced path; there is no fast path to bypass it.
//!
//! # Example
//!
//! ```no_run
//! use potlib_transport::SerialTransport;
//! use potlib_core::transport::Transport;
//! use std::time::Duration;
//!
//! # async fn example() -> potlib_core::Result<()> {
//! // Open the board's virtual COM port at its fixed 1 Mbaud rate.
//! let mut transport = SerialTransport::open("/dev/ttyACM0", 1_000_000).await?;
//!
//! // Wake the board.
//! transport.send(b"ck").await?;
//!
//! // Receive response with 1 second timeout
//! let mut buf = [0u8; 256];
//! let n = transport.receive(&mut buf, Duration::from_secs(1)).await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use potlib_core::error::{Error, Result};
use potlib_core::transport::Transport;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPortBuilderExt, SerialStream};

/// Serial port configuration.
///
/// Defaults match the instrument's fixed link parameters:
/// - 1,000,000 baud
/// - 8 data bits
/// - 1 stop bit
/// - No parity
/// - No flow control
/// - 1 ms inter-byte write delay
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Baud rate. The instrument always runs at 1,000,000.
    pub baud_rate: u32,
    /// Number of data bits (typically 8)
    pub data_bits: DataBits,
    /// Number of stop bits (typically 1)
    pub stop_bits: StopBits,
    /// Parity checking (typically None)
    pub parity: Parity,
    /// Flow control (None; the board has no handshake lines)
    pub flow_control: FlowControl,
    /// Delay inserted after each transmitted byte.
    ///
    /// The instrument's receive path cannot keep up with back-to-back
    /// bytes at full line rate; 1 ms is the pacing its firmware needs.
    /// Set to zero only for loopback testing.
    pub write_delay: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: 1_000_000,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
            parity: Parity::None,
            flow_control: FlowControl::None,
            write_delay: Duration::from_millis(1),
        }
    }
}

/// Number of data bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataBits {
    Five,
    Six,
    Seven,
    Eight,
}

impl From<DataBits> for tokio_serial::DataBits {
    fn from(bits: DataBits) -> Self {
        match bits {
            DataBits::Five => tokio_serial::DataBits::Five,
            DataBits::Six => tokio_serial::DataBits::Six,
            DataBits::Seven => tokio_serial::DataBits::Seven,
            DataBits::Eight => tokio_serial::DataBits::Eight,
        }
    }
}

/// Number of stop bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopBits {
    One,
    Two,
}

impl From<StopBits> for tokio_serial::StopBits {
    fn from(bits: StopBits) -> Self {
        match bits {
            StopBits::One => tokio_serial::StopBits::One,
            StopBits::Two => tokio_serial::StopBits::Two,
        }
    }
}

/// Parity checking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Odd,
    Even,
}

impl From<Parity> for tokio_serial::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        }
    }
}

/// Flow control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControl {
    None,
    Software,
    Hardware,
}

impl From<FlowControl> for tokio_serial::FlowControl {
    fn from(flow: FlowControl) -> Self {
        match flow {
            FlowControl::None => tokio_serial::FlowControl::None,
            FlowControl::Software => tokio_serial::FlowControl::Software,
            FlowControl::Hardware => tokio_serial::FlowControl::Hardware,
        }
    }
}

/// Serial port transport for the potentiostat's USB virtual COM port.
///
/// Implements the [`Transport`] trait. Writes are paced per
/// [`SerialConfig::write_delay`].
pub struct SerialTransport {
    /// The underlying serial port stream
    port: Option<SerialStream>,
    /// Port name for logging/debugging
    port_name: String,
    /// Delay after each transmitted byte.
    write_delay: Duration,
}

impl SerialTransport {
    /// Open a serial port with the given baud rate and default settings.
    ///
    /// Default settings:
    /// - 8 data bits
    /// - 1 stop bit
    /// - No parity
    /// - No flow control
    /// - 1 ms inter-byte write delay
    ///
    /// # Arguments
    ///
    /// * `port` - Serial port path (e.g., "/dev/ttyACM0" on Linux, "COM3" on Windows)
    /// * `baud_rate` - Baud rate (the instrument runs at 1,000,000)
    ///
    /// # Example
    ///
    /// ```no_run
    /// # use potlib_transport::SerialTransport;
    /// # async fn example() -> potlib_core::Result<()> {
    /// let transport = SerialTransport::open("/dev/ttyACM0", 1_000_000).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn open(port: &str, baud_rate: u32) -> Result<Self> {
        let config = SerialConfig {
            baud_rate,
            ..Default::default()
        };
        Self::open_with_config(port, config).await
    }

    /// Open a serial port with full configuration control.
    ///
    /// # Arguments
    ///
    /// * `port` - Serial port path
    /// * `config` - Full serial port configuration
    ///
    /// # Example
    ///
    /// ```no_run
    /// # use potlib_transport::{SerialTransport, SerialConfig};
    /// # use std::time::Duration;
    /// # async fn example() -> potlib_core::Result<()> {
    /// let config = SerialConfig {
    ///     write_delay: Duration::from_millis(2),
    ///     ..Default::default()
    /// };
    /// let transport = SerialTransport::open_with_config("/dev/ttyACM0", config).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn open_with_config(port: &str, config: SerialConfig) -> Result<Self> {
        tracing::debug!(
            port = %port,
            baud_rate = config.baud_rate,
            data_bits = ?config.data_bits,
            stop_bits = ?config.stop_bits,
            parity = ?config.parity,
            flow_control = ?config.flow_control,
            write_delay_ms = config.write_delay.as_millis() as u64,
            "Opening serial port"
        );

        let serial_stream = tokio_serial::new(port, config.baud_rate)
            .data_bits(config.data_bits.into())
            .stop_bits(config.stop_bits.into())
            .parity(config.parity.into())
            .flow_control(config.flow_control.into())
            .open_native_async()
            .map_err(|e| {
                tracing::error!(port = %port, error = %e, "Failed to open serial port");
                Error::Transport(format!("Failed to open serial port {}: {}", port, e))
            })?;

        tracing::info!(port = %port, baud_rate = config.baud_rate, "Serial port opened successfully");

        Ok(Self {
            port: Some(serial_stream),
            port_name: port.to_string(),
            write_delay: config.write_delay,
        })
    }

    /// Get the name of the serial port.
    pub fn port_name(&self) -> &str {
        &self.port_name
    }
}

#[async_trait]
impl Transport for SerialTransport {
    /// Paced write: one byte at a time, flushed, with `write_delay`
    /// between bytes. See the module docs for why this is mandatory.
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        let port = self.port.as_mut().ok_or(Error::NotConnected)?;

        tracing::trace!(
            port = %self.port_name,
            bytes = data.len(),
            data = ?data,
            "Sending data"
        );

        for byte in data {
            port.write_all(std::slice::from_ref(byte))
                .await
                .map_err(|e| {
                    tracing::error!(
                        port = %self.port_name,
                        error = %e,
                        "Failed to send data"
                    );
                    // Check if this is a broken pipe or connection issue
                    if e.kind() == std::io::ErrorKind::BrokenPipe
                        || e.kind() == std::io::ErrorKind::NotConnected
                    {
                        Error::ConnectionLost
                    } else {
                        Error::Io(e)
                    }
                })?;

            // Push the byte onto the wire before starting its delay.
            port.flush().await.map_err(|e| {
                tracing::error!(
                    port = %self.port_name,
                    error = %e,
                    "Failed to flush serial port"
                );
                Error::Io(e)
            })?;

            if !self.write_delay.is_zero() {
                tokio::time::sleep(self.write_delay).await;
            }
        }

        tracing::trace!(port = %self.port_name, "Data sent successfully");

        Ok(())
    }

    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let port = self.port.as_mut().ok_or(Error::NotConnected)?;

        tracing::trace!(
            port = %self.port_name,
            buf_len = buf.len(),
            timeout_ms = timeout.as_millis() as u64,
            "Waiting for data"
        );

        let result = tokio::time::timeout(timeout, port.read(buf)).await;

        match result {
            Ok(Ok(n)) => {
                tracing::trace!(
                    port = %self.port_name,
                    bytes = n,
                    data = ?&buf[..n],
                    "Received data"
                );
                Ok(n)
            }
            Ok(Err(e)) => {
                tracing::error!(
                    port = %self.port_name,
                    error = %e,
                    "Failed to receive data"
                );
                // Check if this is a connection issue
                if e.kind() == std::io::ErrorKind::BrokenPipe
                    || e.kind() == std::io::ErrorKind::NotConnected
                {
                    Err(Error::ConnectionLost)
                } else {
                    Err(Error::Io(e))
                }
            }
            Err(_) => {
                tracing::trace!(
                    port = %self.port_name,
                    timeout_ms = timeout.as_millis() as u64,
                    "Timeout waiting for data"
                );
                Err(Error::Timeout)
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut port) = self.port.take() {
            tracing::debug!(port = %self.port_name, "Closing serial port");

            // Flush any pending data before closing
            if let Err(e) = port.flush().await {
                tracing::warn!(
                    port = %self.port_name,
                    error = %e,
                    "Failed to flush before closing (continuing anyway)"
                );
            }

            // The port will be dropped here, which closes it
            tracing::info!(port = %self.port_name, "Serial port closed");
        }

        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }
}

// Implement Drop to ensure the port is closed properly
impl Drop for SerialTransport {
    fn drop(&mut self) {
        if self.port.is_some() {
            tracing::debug!(port = %self.port_name, "SerialTransport dropped, closing port");
            // The port will be automatically closed when dropped
        }
    }
}
