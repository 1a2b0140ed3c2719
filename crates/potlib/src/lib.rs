//! # potlib -- Async Instrument Control for DStat Potentiostats
//!
//! `potlib` is an asynchronous Rust library for driving the open-hardware
//! DStat potentiostat over its USB virtual COM port. It is designed for
//! electrochemistry frontends, lab automation, and long-running data
//! loggers where live sample streaming and a reliable mid-run abort are
//! essential.
//!
//! ## Quick Start
//!
//! Add `potlib` to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! potlib = "0.3"
//! tokio = { version = "1", features = ["full"] }
//! ```
//!
//! Connect to an instrument and check its firmware:
//!
//! ```no_run
//! use potlib::dstat::{CommandTask, DstatBuilder};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut session = DstatBuilder::new()
//!         .serial_port("/dev/ttyACM0")
//!         .connect()
//!         .await?;
//!
//!     session.submit(CommandTask::VersionCheck).await?;
//!     if let Some(outcome) = session.next_result().await {
//!         println!("version check: {}", outcome.status);
//!     }
//!     session.disconnect().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! The library is organized as a workspace of focused crates:
//!
//! | Crate                  | Purpose                                          |
//! |------------------------|--------------------------------------------------|
//! | `potlib-core`          | [`Transport`] trait, sample types, errors, events |
//! | `potlib-transport`     | Paced USB-serial transport implementation        |
//! | `potlib-dstat`         | DStat protocol codec, techniques, session worker |
//! | `potlib-test-harness`  | Scripted mock transport for hardware-free tests  |
//! | **`potlib`**           | This facade crate -- re-exports everything       |
//!
//! Protocol code operates on the [`Transport`] trait, so the same framing
//! and decoding logic runs against real hardware and against scripted
//! byte streams in tests.
//!
//! ## Feature Flags
//!
//! | Feature | Enables                            | Default |
//! |---------|------------------------------------|---------|
//! | `dstat` | [`dstat`] module (DStat protocol)  | yes     |
//!
//! ## Running a Measurement
//!
//! A session executes one task at a time. Samples stream live over the
//! data channel while the run is in progress; the completed-task report
//! carries the full [`RunRecord`](dstat::RunRecord) archive:
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use potlib::dstat::experiment::CvParams;
//! use potlib::dstat::{
//!     AdcSettings, CommandTask, DstatBuilder, ExperimentKind, ExperimentRequest,
//! };
//!
//! # async fn example() -> anyhow::Result<()> {
//! let mut session = DstatBuilder::new()
//!     .serial_port("/dev/ttyACM0")
//!     .connect()
//!     .await?;
//!
//! // Techniques need the firmware version to pick the right gain table.
//! session.submit(CommandTask::VersionCheck).await?;
//! session.next_result().await;
//!
//! let request = ExperimentRequest::new(
//!     ExperimentKind::CyclicVoltammetry(CvParams {
//!         clean_s: 0,
//!         dep_s: 0,
//!         clean_mv: 0.0,
//!         dep_mv: 0.0,
//!         v1_mv: -400.0,
//!         v2_mv: 400.0,
//!         start_mv: 0.0,
//!         scans: 3,
//!         slope_mv_s: 100,
//!     }),
//!     AdcSettings::default(),
//!     2,
//! )?;
//! session.submit(CommandTask::Experiment(request)).await?;
//!
//! let outcome = loop {
//!     while let Some(sample) = session.poll_sample() {
//!         println!("scan {}: {:?}", sample.scan, sample.values.columns());
//!     }
//!     match tokio::time::timeout(Duration::from_millis(200), session.next_result()).await {
//!         Ok(Some(outcome)) => break outcome,
//!         Ok(None) => anyhow::bail!("session closed"),
//!         Err(_) => {} // no verdict yet; keep relaying samples
//!     }
//! };
//! println!("run finished: {}", outcome.status);
//! # Ok(())
//! # }
//! ```
//!
//! A running measurement is stopped with
//! [`abort()`](dstat::SessionHandle::abort); the partial data gathered up
//! to that point still comes back in the run record.
//!
//! ## Event Subscription
//!
//! Sessions emit [`SessionEvent`]s through a broadcast channel. Subscribe
//! to drive status indicators without polling:
//!
//! ```no_run
//! use potlib::SessionEvent;
//! # use potlib::dstat::SessionHandle;
//! # async fn example(session: &SessionHandle) {
//! let mut events = session.subscribe();
//! while let Ok(event) = events.recv().await {
//!     match event {
//!         SessionEvent::TaskFinished { status } => println!("task: {status}"),
//!         other => println!("{other:?}"),
//!     }
//! }
//! # }
//! ```

pub use potlib_core::*;

/// DStat protocol backend.
///
/// Provides [`DstatBuilder`](dstat::DstatBuilder) and
/// [`SessionHandle`](dstat::SessionHandle) for driving a DStat
/// potentiostat: housekeeping queries, EEPROM settings, gain calibration,
/// and the full measurement catalog from chronoamperometry through
/// differential pulse voltammetry.
#[cfg(feature = "dstat")]
pub mod dstat {
    pub use potlib_dstat::*;
}
