//! Core types used throughout potlib.
//!
//! These types form the vocabulary shared between the instrument driver
//! and its consumers: firmware identity, decoded measurement samples, and
//! the terminal status of one task execution.

use std::fmt;
use std::str::FromStr;

/// Firmware version reported by the instrument, as `major.minor`.
///
/// Several wire-protocol details depend on the firmware revision: the
/// selectable gain table changed between 1.1 and 1.2, and 1.2 added the
/// reference-electrode short flag to the gain command plus per-gain trim
/// values stored in the board's settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FirmwareVersion {
    /// Major revision.
    pub major: u16,
    /// Minor revision.
    pub minor: u16,
}

impl FirmwareVersion {
    /// Create a firmware version from its components.
    pub const fn new(major: u16, minor: u16) -> Self {
        FirmwareVersion { major, minor }
    }

    /// Whether the gain command takes the reference-short flag
    /// (firmware 1.2 and later).
    pub fn supports_re_short(&self) -> bool {
        *self >= FirmwareVersion::new(1, 2)
    }

    /// Whether the board stores per-gain trim offsets in its settings
    /// (firmware 1.2 and later).
    pub fn has_gain_trim(&self) -> bool {
        *self >= FirmwareVersion::new(1, 2)
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Error returned when a string cannot be parsed into a [`FirmwareVersion`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseVersionError(String);

impl fmt::Display for ParseVersionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unparseable firmware version: '{}'", self.0)
    }
}

impl std::error::Error for ParseVersionError {}

impl FromStr for FirmwareVersion {
    type Err = ParseVersionError;

    /// Parse a dotted version string such as `"1.2"`.
    ///
    /// Components beyond the second are accepted and ignored, since some
    /// firmware builds report a patch level.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut parts = s.trim().split('.');
        let major = parts
            .next()
            .and_then(|p| p.trim().parse::<u16>().ok())
            .ok_or_else(|| ParseVersionError(s.to_string()))?;
        let minor = parts
            .next()
            .and_then(|p| p.trim().parse::<u16>().ok())
            .ok_or_else(|| ParseVersionError(s.to_string()))?;
        Ok(FirmwareVersion { major, minor })
    }
}

/// Terminal outcome of one task execution.
///
/// Exactly one `RunStatus` is reported per submitted task; the consumer
/// must observe it before submitting the next task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunStatus {
    /// The task ran to completion.
    Done,
    /// The task was stopped by an abort request. Not a fault.
    Aborted,
    /// A transport or protocol failure ended the task early.
    SerialError,
    /// The session was told to disconnect; the worker has shut down.
    Disconnected,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Done => "DONE",
            RunStatus::Aborted => "ABORT",
            RunStatus::SerialError => "SERIAL_ERROR",
            RunStatus::Disconnected => "DISCONNECT",
        };
        write!(f, "{s}")
    }
}

/// The decoded physical values of one measurement record.
///
/// The field shape varies by experiment family: potential sweeps report
/// (potential, current), timed experiments report (time, current) or
/// (time, potential), and pulsed experiments report forward/reverse
/// currents along with their difference.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SampleValues {
    /// Swept-potential point: programmed potential and measured current
    /// (LSV, CV).
    Sweep {
        /// Cell potential in millivolts.
        voltage_mv: f64,
        /// Measured current in amperes.
        current_a: f64,
    },
    /// Timed current point (chronoamperometry, photodiode).
    TimedCurrent {
        /// Elapsed time in seconds.
        time_s: f64,
        /// Measured current in amperes.
        current_a: f64,
    },
    /// Timed potential point (potentiometry, open-circuit monitoring).
    TimedVoltage {
        /// Elapsed time in seconds.
        time_s: f64,
        /// Measured potential in millivolts.
        voltage_mv: f64,
    },
    /// Pulsed point with paired current measurements (SWV, DPV).
    Pulse {
        /// Cell potential in millivolts.
        voltage_mv: f64,
        /// Forward minus reverse current in amperes.
        difference_a: f64,
        /// Forward-pulse current in amperes.
        forward_a: f64,
        /// Reverse-pulse current in amperes.
        reverse_a: f64,
    },
}

impl SampleValues {
    /// The values as an ordered row of floats, x-axis first.
    ///
    /// This is the column order used by text exporters: sweep points give
    /// `[voltage_mv, current_a]`, timed points `[time_s, reading]`, and
    /// pulsed points `[voltage_mv, difference_a, forward_a, reverse_a]`.
    pub fn columns(&self) -> Vec<f64> {
        match *self {
            SampleValues::Sweep {
                voltage_mv,
                current_a,
            } => vec![voltage_mv, current_a],
            SampleValues::TimedCurrent { time_s, current_a } => vec![time_s, current_a],
            SampleValues::TimedVoltage { time_s, voltage_mv } => vec![time_s, voltage_mv],
            SampleValues::Pulse {
                voltage_mv,
                difference_a,
                forward_a,
                reverse_a,
            } => vec![voltage_mv, difference_a, forward_a, reverse_a],
        }
    }
}

/// One decoded measurement point.
///
/// `scan` is the zero-based index of the sweep the point belongs to;
/// multi-scan experiments (successive CV cycles, SWV scans) partition
/// their sample stream into consecutive scan groups. Within one task
/// execution, `scan` never decreases.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// Zero-based scan index.
    pub scan: u32,
    /// Decoded physical values.
    pub values: SampleValues,
}

impl Sample {
    /// Create a sample.
    pub fn new(scan: u32, values: SampleValues) -> Self {
        Sample { scan, values }
    }
}
