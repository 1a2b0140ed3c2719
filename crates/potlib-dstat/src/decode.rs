//! Binary record layouts and physical-unit scaling.
//!
//! Each `B` line announces one little-endian binary record whose width and
//! field layout depend on the running technique. Decoding is pure: raw
//! bytes plus a resolved gain stage in, a [`Sample`] out, so the scaling
//! arithmetic can be pinned down byte-for-byte in tests.

use potlib_core::error::{Error, Result};
use potlib_core::types::{Sample, SampleValues};

use crate::gain::GainSetting;
use crate::protocol::decode_mv;

/// ADC full-scale magnitude, 2^23 - 1 counts.
const ADC_FULL_SCALE: f64 = 8_388_607.0;

/// ADC reference in volts.
const ADC_REFERENCE_VOLTS: f64 = 1.5;

/// Counts per volt on the buffered open-circuit channel.
const OCP_COUNTS_PER_VOLT: f64 = 5.592405e6;

/// Layout of one binary record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordLayout {
    /// `u16` DAC code + `i32` current counts (6 bytes): sweep techniques.
    PotentialCurrent,
    /// `u16` seconds + `u16` milliseconds + `i32` current counts
    /// (8 bytes): chronoamperometry and photodiode runs.
    TimeCurrent,
    /// `u16` seconds + `u16` milliseconds + `i32` potential counts
    /// (8 bytes): potentiometry.
    TimePotential,
    /// As [`TimePotential`](Self::TimePotential), but scaled for the
    /// open-circuit channel.
    TimeOpenCircuit,
    /// `u16` DAC code + `i32` forward + `i32` reverse counts (10 bytes):
    /// square-wave and differential-pulse techniques.
    PotentialForwardReverse,
}

impl RecordLayout {
    /// Record width in bytes on the wire.
    pub const fn width(self) -> usize {
        match self {
            Self::PotentialCurrent => 6,
            Self::TimeCurrent | Self::TimePotential | Self::TimeOpenCircuit => 8,
            Self::PotentialForwardReverse => 10,
        }
    }
}

fn check_width(raw: &[u8], expected: usize) -> Result<()> {
    if raw.len() != expected {
        return Err(Error::Protocol(format!(
            "record is {} bytes, expected {expected}",
            raw.len()
        )));
    }
    Ok(())
}

fn u16_at(raw: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([raw[at], raw[at + 1]])
}

fn i32_at(raw: &[u8], at: usize) -> i32 {
    i32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]])
}

/// Unpack a 6-byte record into its raw (DAC code, current counts) fields.
pub fn unpack_potential_current(raw: &[u8]) -> Result<(u16, i32)> {
    check_width(raw, 6)?;
    Ok((u16_at(raw, 0), i32_at(raw, 2)))
}

/// Unpack an 8-byte record into its raw (seconds, milliseconds, reading)
/// fields.
pub fn unpack_time_reading(raw: &[u8]) -> Result<(u16, u16, i32)> {
    check_width(raw, 8)?;
    Ok((u16_at(raw, 0), u16_at(raw, 2), i32_at(raw, 4)))
}

/// Unpack a 10-byte record into its raw (DAC code, forward, reverse)
/// fields.
pub fn unpack_potential_forward_reverse(raw: &[u8]) -> Result<(u16, i32, i32)> {
    check_width(raw, 10)?;
    Ok((u16_at(raw, 0), i32_at(raw, 2), i32_at(raw, 6)))
}

/// Scale raw current counts to amperes through a gain stage.
pub fn current_amps(counts: i32, gain: &GainSetting) -> f64 {
    (f64::from(counts) + f64::from(gain.trim))
        * (ADC_REFERENCE_VOLTS / gain.value / ADC_FULL_SCALE)
}

fn potential_mv(counts: i32) -> f64 {
    f64::from(counts) * (ADC_REFERENCE_VOLTS / ADC_FULL_SCALE) * 1000.0
}

fn open_circuit_mv(counts: i32) -> f64 {
    f64::from(counts) / OCP_COUNTS_PER_VOLT * 1000.0
}

fn time_seconds(secs: u16, millis: u16) -> f64 {
    f64::from(secs) + f64::from(millis) / 1000.0
}

/// Decodes binary records into physical-unit [`Sample`]s.
#[derive(Debug, Clone)]
pub struct SampleDecoder {
    layout: RecordLayout,
    gain: GainSetting,
}

impl SampleDecoder {
    pub fn new(layout: RecordLayout, gain: GainSetting) -> Self {
        Self { layout, gain }
    }

    /// The layout this decoder expects.
    pub fn layout(&self) -> RecordLayout {
        self.layout
    }

    /// Decode one record. `scan` tags which sweep the sample belongs to.
    ///
    /// Fails with a protocol error if `raw` does not match the layout's
    /// width exactly.
    pub fn decode(&self, scan: u32, raw: &[u8]) -> Result<Sample> {
        let values = match self.layout {
            RecordLayout::PotentialCurrent => {
                let (code, counts) = unpack_potential_current(raw)?;
                SampleValues::Sweep {
                    voltage_mv: decode_mv(code),
                    current_a: current_amps(counts, &self.gain),
                }
            }
            RecordLayout::TimeCurrent => {
                let (secs, millis, counts) = unpack_time_reading(raw)?;
                SampleValues::TimedCurrent {
                    time_s: time_seconds(secs, millis),
                    current_a: current_amps(counts, &self.gain),
                }
            }
            RecordLayout::TimePotential => {
                let (secs, millis, counts) = unpack_time_reading(raw)?;
                SampleValues::TimedVoltage {
                    time_s: time_seconds(secs, millis),
                    voltage_mv: potential_mv(counts),
                }
            }
            RecordLayout::TimeOpenCircuit => {
                let (secs, millis, counts) = unpack_time_reading(raw)?;
                SampleValues::TimedVoltage {
                    time_s: time_seconds(secs, millis),
                    voltage_mv: open_circuit_mv(counts),
                }
            }
            RecordLayout::PotentialForwardReverse => {
                let (code, forward, reverse) = unpack_potential_forward_reverse(raw)?;
                let forward_a = current_amps(forward, &self.gain);
                let reverse_a = current_amps(reverse, &self.gain);
                SampleValues::Pulse {
                    voltage_mv: decode_mv(code),
                    difference_a: forward_a - reverse_a,
                    forward_a,
                    reverse_a,
                }
            }
        };
        Ok(Sample::new(scan, values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record6(code: u16, counts: i32) -> Vec<u8> {
        let mut raw = code.to_le_bytes().to_vec();
        raw.extend_from_slice(&counts.to_le_bytes());
        raw
    }

    fn record8(secs: u16, millis: u16, counts: i32) -> Vec<u8> {
        let mut raw = secs.to_le_bytes().to_vec();
        raw.extend_from_slice(&millis.to_le_bytes());
        raw.extend_from_slice(&counts.to_le_bytes());
        raw
    }

    fn record10(code: u16, forward: i32, reverse: i32) -> Vec<u8> {
        let mut raw = code.to_le_bytes().to_vec();
        raw.extend_from_slice(&forward.to_le_bytes());
        raw.extend_from_slice(&reverse.to_le_bytes());
        raw
    }

    fn gain(value: f64, trim: i32) -> GainSetting {
        GainSetting {
            index: 2,
            value,
            trim,
        }
    }

    fn assert_close(a: f64, b: f64) {
        assert!((a - b).abs() <= 1e-12 * b.abs().max(1.0), "{a} != {b}");
    }

    // ---------------------------------------------------------------
    // Field unpacking
    // ---------------------------------------------------------------

    #[test]
    fn unpack_6_byte_record() {
        let raw = record6(32768, -1000);
        assert_eq!(unpack_potential_current(&raw).unwrap(), (32768, -1000));
    }

    #[test]
    fn unpack_8_byte_record() {
        let raw = record8(12, 500, 250_000);
        assert_eq!(unpack_time_reading(&raw).unwrap(), (12, 500, 250_000));
    }

    #[test]
    fn unpack_10_byte_record() {
        let raw = record10(40000, 1000, -400);
        assert_eq!(
            unpack_potential_forward_reverse(&raw).unwrap(),
            (40000, 1000, -400)
        );
    }

    #[test]
    fn wrong_length_records_are_rejected() {
        // One byte short and one byte long must both fail.
        for len in [5usize, 7] {
            let raw = vec![0u8; len];
            assert!(matches!(
                unpack_potential_current(&raw),
                Err(Error::Protocol(_))
            ));
        }
        for len in [7usize, 9] {
            let raw = vec![0u8; len];
            assert!(matches!(unpack_time_reading(&raw), Err(Error::Protocol(_))));
        }
        for len in [9usize, 11] {
            let raw = vec![0u8; len];
            assert!(matches!(
                unpack_potential_forward_reverse(&raw),
                Err(Error::Protocol(_))
            ));
        }
    }

    // ---------------------------------------------------------------
    // Scaling
    // ---------------------------------------------------------------

    #[test]
    fn current_scaling_applies_gain_and_trim() {
        let g = gain(3e4, 25);
        let amps = current_amps(1000, &g);
        assert_close(amps, 1025.0 * 1.5 / 3e4 / 8_388_607.0);
    }

    #[test]
    fn current_scaling_negative_counts() {
        let g = gain(3e4, 0);
        assert!(current_amps(-1000, &g) < 0.0);
    }

    #[test]
    fn decode_sweep_record() {
        let decoder = SampleDecoder::new(RecordLayout::PotentialCurrent, gain(3e3, 0));
        let sample = decoder.decode(1, &record6(32768, 8_388_607)).unwrap();
        assert_eq!(sample.scan, 1);
        match sample.values {
            SampleValues::Sweep {
                voltage_mv,
                current_a,
            } => {
                assert_close(voltage_mv, 0.0);
                // Full-scale counts at gain 3k: 1.5 V / 3000 ohm = 0.5 mA.
                assert_close(current_a, 1.5 / 3e3);
            }
            other => panic!("expected Sweep, got {other:?}"),
        }
    }

    #[test]
    fn decode_timed_current_record() {
        let decoder = SampleDecoder::new(RecordLayout::TimeCurrent, gain(3e5, -10));
        let sample = decoder.decode(0, &record8(3, 250, 2000)).unwrap();
        match sample.values {
            SampleValues::TimedCurrent { time_s, current_a } => {
                assert_close(time_s, 3.25);
                assert_close(current_a, 1990.0 * 1.5 / 3e5 / 8_388_607.0);
            }
            other => panic!("expected TimedCurrent, got {other:?}"),
        }
    }

    #[test]
    fn decode_potentiometry_record_ignores_gain() {
        let decoder = SampleDecoder::new(RecordLayout::TimePotential, gain(3e7, 999));
        let sample = decoder.decode(0, &record8(60, 0, 8_388_607)).unwrap();
        match sample.values {
            SampleValues::TimedVoltage { time_s, voltage_mv } => {
                assert_close(time_s, 60.0);
                // Full-scale counts on the 1.5 V reference: 1500 mV.
                assert_close(voltage_mv, 1500.0);
            }
            other => panic!("expected TimedVoltage, got {other:?}"),
        }
    }

    #[test]
    fn decode_open_circuit_record_uses_fixed_divisor() {
        let decoder = SampleDecoder::new(
            RecordLayout::TimeOpenCircuit,
            GainSetting {
                index: 0,
                value: 1.0,
                trim: 0,
            },
        );
        let sample = decoder.decode(0, &record8(0, 400, 5_592_405)).unwrap();
        match sample.values {
            SampleValues::TimedVoltage { time_s, voltage_mv } => {
                assert_close(time_s, 0.4);
                assert_close(voltage_mv, 1000.0);
            }
            other => panic!("expected TimedVoltage, got {other:?}"),
        }
    }

    #[test]
    fn decode_pulse_record() {
        let decoder = SampleDecoder::new(RecordLayout::PotentialForwardReverse, gain(300.0, 0));
        let sample = decoder.decode(2, &record10(40000, 1000, 400)).unwrap();
        match sample.values {
            SampleValues::Pulse {
                voltage_mv,
                difference_a,
                forward_a,
                reverse_a,
            } => {
                assert_close(voltage_mv, 331.0546875);
                let unit = 1.5 / 300.0 / 8_388_607.0;
                assert_close(forward_a, 1000.0 * unit);
                assert_close(reverse_a, 400.0 * unit);
                assert_close(difference_a, 600.0 * unit);
            }
            other => panic!("expected Pulse, got {other:?}"),
        }
    }

    #[test]
    fn pulse_difference_is_trim_invariant() {
        // Trim shifts both components identically, so it cancels in the
        // difference.
        let trimmed = SampleDecoder::new(RecordLayout::PotentialForwardReverse, gain(3e4, 500));
        let untrimmed = SampleDecoder::new(RecordLayout::PotentialForwardReverse, gain(3e4, 0));
        let raw = record10(30000, 2200, -300);

        let a = trimmed.decode(0, &raw).unwrap();
        let b = untrimmed.decode(0, &raw).unwrap();
        match (a.values, b.values) {
            (
                SampleValues::Pulse {
                    difference_a: da, ..
                },
                SampleValues::Pulse {
                    difference_a: db, ..
                },
            ) => assert_close(da, db),
            other => panic!("expected Pulse pair, got {other:?}"),
        }
    }

    #[test]
    fn decoding_the_same_record_twice_gives_identical_samples() {
        // Decoding holds no state: a second pass over the same bytes must
        // reproduce the first exactly, for every layout.
        let cases = [
            (RecordLayout::PotentialCurrent, record6(40000, -12345)),
            (RecordLayout::TimeCurrent, record8(7, 250, 98765)),
            (RecordLayout::TimePotential, record8(60, 500, -250_000)),
            (RecordLayout::TimeOpenCircuit, record8(2, 0, 5_592_405)),
            (
                RecordLayout::PotentialForwardReverse,
                record10(30000, 2200, -300),
            ),
        ];
        for (layout, raw) in cases {
            let decoder = SampleDecoder::new(layout, gain(3e4, 25));
            let first = decoder.decode(1, &raw).unwrap();
            let second = decoder.decode(1, &raw).unwrap();
            assert_eq!(first, second, "{layout:?}");
        }

        // Nor does decoding one record disturb the next: an unrelated
        // record in between must not change what the same bytes decode to.
        let decoder = SampleDecoder::new(RecordLayout::PotentialCurrent, gain(3e3, 0));
        let raw = record6(40000, 500);
        let first = decoder.decode(0, &raw).unwrap();
        decoder.decode(0, &record6(20000, -500)).unwrap();
        assert_eq!(decoder.decode(0, &raw).unwrap(), first);
    }

    #[test]
    fn decode_rejects_wrong_width_for_layout() {
        let decoder = SampleDecoder::new(RecordLayout::PotentialCurrent, gain(3e3, 0));
        let err = decoder.decode(0, &record8(0, 0, 0)).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn layout_widths() {
        assert_eq!(RecordLayout::PotentialCurrent.width(), 6);
        assert_eq!(RecordLayout::TimeCurrent.width(), 8);
        assert_eq!(RecordLayout::TimePotential.width(), 8);
        assert_eq!(RecordLayout::TimeOpenCircuit.width(), 8);
        assert_eq!(RecordLayout::PotentialForwardReverse.width(), 10);
    }
}
