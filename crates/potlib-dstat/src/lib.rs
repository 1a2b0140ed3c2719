//! DStat potentiostat protocol backend for potlib.
//!
//! This crate implements the DStat's USB-serial command/data protocol. It
//! provides:
//!
//! - **Protocol codec** ([`protocol`]) -- the wire markers, offset-binary
//!   potential encoding, and the line/record framing reader.
//! - **Command builders** ([`commands`]) -- construct the space-separated
//!   ASCII command strings for every technique and housekeeping operation,
//!   and parse the corresponding responses.
//! - **Sample decoding** ([`decode`]) -- unpack the fixed-width
//!   little-endian binary records and scale raw ADC counts to amperes and
//!   millivolts.
//! - **Measurement catalog** ([`experiment`]) -- validated parameter sets
//!   for chronoamperometry, LSV, CV, SWV, DPV, photodiode, potentiometry
//!   and open-circuit monitoring.
//! - **Connection session** ([`session`]) -- a spawned worker owning the
//!   serial link, executing one task at a time with live sample streaming
//!   and mid-run abort.
//! - **Builder** ([`builder`]) -- fluent connection API with the
//!   instrument's standard link parameters as defaults.
//!
//! # Example
//!
//! ```
//! use potlib_dstat::commands::{cmd_version, parse_version_response};
//! use potlib_dstat::protocol::encode_mv;
//!
//! // Build a "report firmware version" command
//! let cmd = cmd_version();
//! assert_eq!(cmd, "V");
//!
//! // Simulate the version line coming back from the instrument
//! let version = parse_version_response(b"V1.2").unwrap();
//! assert!(version.supports_re_short());
//!
//! // Absolute potentials ride the wire as offset-binary DAC codes
//! assert_eq!(encode_mv(0.0), 32768);
//! ```
//!
//! Driving real hardware goes through the builder:
//!
//! ```no_run
//! use potlib_dstat::{CommandTask, DstatBuilder};
//!
//! # async fn example() -> potlib_core::Result<()> {
//! let mut session = DstatBuilder::new()
//!     .serial_port("/dev/ttyACM0")
//!     .connect()
//!     .await?;
//!
//! session.submit(CommandTask::VersionCheck).await?;
//! let outcome = session.next_result().await;
//! println!("{outcome:?}");
//! session.disconnect().await?;
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod commands;
pub mod decode;
pub mod experiment;
pub mod gain;
pub mod protocol;
pub mod session;
pub mod settings;

// Re-export the primary types for ergonomic `use potlib_dstat::*`.
pub use builder::DstatBuilder;
pub use experiment::{
    AdcSettings, CalibrationParams, DataClass, ExperimentKind, ExperimentRequest,
};
pub use session::{
    CommandTask, RunRecord, SessionConfig, SessionHandle, TaskOutcome, TaskReply,
};
pub use settings::Settings;
