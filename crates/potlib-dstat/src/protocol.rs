//! DStat wire-protocol primitives: markers, potential encoding, line framing.
//!
//! The DStat speaks a newline-terminated ASCII protocol over USB serial, with
//! fixed-width little-endian binary records embedded mid-stream. Every
//! exchange follows the same shape:
//!
//! ```text
//! host -> '!'                    probe: ask if the instrument is ready
//! inst -> "C...\n"               ready prompt
//! host -> "EC120 0 ... \n-less"  full command string (space-separated fields)
//! inst -> "#INFO: ...\n"         zero or more diagnostic lines
//! inst -> "B\n" <raw bytes>      a binary data record follows the 'B' line
//! inst -> "S\n"                  scan boundary (multi-scan techniques)
//! inst -> "no command recognised\n"   terminator: command is finished
//! ```
//!
//! # Line prefixes
//!
//! The first non-whitespace byte of each line determines its meaning:
//!
//! | Prefix | Meaning                                              |
//! |--------|------------------------------------------------------|
//! | `C`    | Ready prompt: the instrument will accept a command   |
//! | `B`    | A fixed-width binary record follows immediately      |
//! | `S`    | Scan boundary: subsequent records belong to the next scan |
//! | `#`    | Human-readable diagnostic line                       |
//! | `no`   | End of the current command's output                  |
//!
//! # Potential encoding
//!
//! Absolute potentials are sent as offset-binary 16-bit DAC codes:
//! `code = round(mV * 65536 / 3000 + 32768)`, so -1500 mV maps to 0, 0 mV to
//! 32768 and the +1500 mV rail saturates at 65535. Relative fields (step and
//! pulse heights), times, rates and counts are sent as plain decimal text.

use std::time::{Duration, Instant};

use bytes::BytesMut;
use potlib_core::error::{Error, Result};
use potlib_core::transport::Transport;

/// Bytes written once immediately after opening the port.
pub const WAKE_SEQUENCE: &[u8] = b"ck";

/// Probe byte: "are you ready for a command?".
pub const READY_PROBE: u8 = b'!';

/// Single-byte command that stops the measurement currently running.
pub const ABORT_COMMAND: u8 = b'a';

/// Default number of ready probes sent while establishing a connection.
pub const HANDSHAKE_ATTEMPTS: u32 = 10;

/// Default pause between connection-handshake probes.
pub const HANDSHAKE_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Default per-read timeout on the serial port.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Per-read timeout used while draining stale input.
const FLUSH_READ_TIMEOUT: Duration = Duration::from_millis(10);

/// One response line from the instrument, classified by its prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseLine {
    /// `C` line: the instrument is ready to accept a command.
    Ready,
    /// `B` line: a fixed-width binary record follows on the wire.
    Record,
    /// `S` line: records that follow belong to the next scan.
    ScanBoundary,
    /// `#` line: diagnostic text from the firmware.
    Log(String),
    /// `no` line: output of the current command is complete.
    Done,
    /// Anything else (echoes, partial garbage, task-specific payloads).
    Other(Vec<u8>),
}

/// Classify one line (without its newline) by its first non-whitespace byte.
///
/// # Example
///
/// ```
/// use potlib_dstat::protocol::{classify_line, ResponseLine};
///
/// assert_eq!(classify_line(b"B"), ResponseLine::Record);
/// assert_eq!(classify_line(b"no command recognised"), ResponseLine::Done);
/// ```
pub fn classify_line(line: &[u8]) -> ResponseLine {
    let trimmed = match line.iter().position(|b| !b.is_ascii_whitespace()) {
        Some(start) => &line[start..],
        None => &[][..],
    };

    match trimmed.first() {
        Some(b'n') if trimmed.starts_with(b"no") => ResponseLine::Done,
        Some(b'B') => ResponseLine::Record,
        Some(b'S') => ResponseLine::ScanBoundary,
        Some(b'#') => {
            ResponseLine::Log(String::from_utf8_lossy(trimmed).trim_end().to_string())
        }
        Some(b'C') => ResponseLine::Ready,
        _ => ResponseLine::Other(line.to_vec()),
    }
}

/// Encode an absolute potential in millivolts as an offset-binary DAC code.
///
/// `code = round(mV * 65536 / 3000 + 32768)`, saturating at the 16-bit
/// limits. The usable range is ±1500 mV; -1500 mV encodes to 0 and 0 mV to
/// the midpoint 32768.
///
/// # Example
///
/// ```
/// use potlib_dstat::protocol::encode_mv;
///
/// assert_eq!(encode_mv(-1500.0), 0);
/// assert_eq!(encode_mv(0.0), 32768);
/// assert_eq!(encode_mv(100.0), 34953);
/// ```
pub fn encode_mv(mv: f64) -> u16 {
    (mv * 65536.0 / 3000.0 + 32768.0).round() as u16
}

/// Decode an offset-binary DAC/ADC code back to millivolts.
///
/// Inverse of [`encode_mv`] up to quantisation: one code step is
/// 3000/65536 ≈ 0.0458 mV, so a round trip is exact to within half a step.
pub fn decode_mv(code: u16) -> f64 {
    (f64::from(code) - 32768.0) * 3000.0 / 65536.0
}

/// Encode a photodiode bias potential (0..=1500 mV) in the inverted form the
/// `ER1` photodiode command expects.
///
/// 0 mV is the special code 65535 (bias DAC parked); any other value maps to
/// `65535 - round(mV * 65536 / 3000)`.
pub fn encode_pd_mv(mv: f64) -> u16 {
    if mv == 0.0 {
        65535
    } else {
        (65535.0 - (mv * 65536.0 / 3000.0).round()) as u16
    }
}

/// Buffered line/record reader over a [`Transport`].
///
/// The DStat interleaves newline-terminated text with raw binary records, so
/// a plain line splitter is not enough: after a `B` line the next
/// `record width` bytes must be consumed verbatim, newlines included. This
/// reader owns the carry-over buffer between those two modes.
#[derive(Debug, Default)]
pub struct WireReader {
    buf: BytesMut,
}

impl WireReader {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(512),
        }
    }

    /// Read one line, stripping the trailing `\n` (and `\r` if present).
    ///
    /// Returns `Ok(None)` if no complete line arrived within `timeout`;
    /// partial data stays buffered for the next call. Transport errors other
    /// than the timeout are propagated.
    pub async fn read_line(
        &mut self,
        transport: &mut dyn Transport,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>> {
        let deadline = Instant::now() + timeout;
        let mut scratch = [0u8; 256];

        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let raw = self.buf.split_to(pos + 1);
                let mut line = raw[..pos].to_vec();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Ok(Some(line));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            match transport.receive(&mut scratch, remaining).await {
                Ok(0) => continue,
                Ok(n) => self.buf.extend_from_slice(&scratch[..n]),
                Err(Error::Timeout) => return Ok(None),
                Err(e) => return Err(e),
            }
        }
    }

    /// Read exactly `n` raw bytes (a binary record body).
    ///
    /// Unlike [`read_line`](Self::read_line) this treats a timeout as an
    /// error: once the instrument has announced a record, the full record
    /// must follow.
    pub async fn read_exact(
        &mut self,
        transport: &mut dyn Transport,
        n: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut scratch = [0u8; 256];

        while self.buf.len() < n {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout);
            }
            match transport.receive(&mut scratch, remaining).await {
                Ok(0) => continue,
                Ok(got) => self.buf.extend_from_slice(&scratch[..got]),
                Err(e) => return Err(e),
            }
        }
        Ok(self.buf.split_to(n).to_vec())
    }

    /// Discard everything buffered and drain whatever is sitting in the port.
    ///
    /// Used after the connection handshake and after an abort, where the
    /// instrument may still be flushing output for a command we no longer
    /// care about.
    pub async fn flush_input(&mut self, transport: &mut dyn Transport) -> Result<()> {
        self.buf.clear();
        let mut scratch = [0u8; 256];
        loop {
            match transport.receive(&mut scratch, FLUSH_READ_TIMEOUT).await {
                Ok(0) => break,
                Ok(_) => continue,
                Err(Error::Timeout) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
