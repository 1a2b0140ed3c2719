//! Transport implementations for potlib.
//!
//! This crate provides the concrete implementation of the
//! [`Transport`](potlib_core::Transport) trait from `potlib-core` for the
//! instrument's physical connection:
//!
//! - [`SerialTransport`]: USB virtual COM port with the paced writes the
//!   instrument's UART requires
//!
//! # Example
//!
//! ```no_run
//! use potlib_transport::SerialTransport;
//! use potlib_core::transport::Transport;
//! use std::time::Duration;
//!
//! # async fn example() -> potlib_core::Result<()> {
//! // Open the instrument's virtual COM port.
//! let mut transport = SerialTransport::open("/dev/ttyACM0", 1_000_000).await?;
//!
//! // Probe for the command prompt.
//! transport.send(b"!").await?;
//!
//! // Receive response
//! let mut buf = [0u8; 256];
//! let n = transport.receive(&mut buf, Duration::from_secs(1)).await?;
//! # Ok(())
//! # }
//! ```

pub mod serial;

pub use serial::{DataBits, FlowControl, Parity, SerialConfig, SerialTransport, StopBits};
