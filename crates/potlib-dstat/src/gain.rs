//! Transimpedance gain tables and per-stage trim lookup.
//!
//! The analog front end has eight selectable gain stages. The resistor
//! values (and therefore the divisors used to scale raw ADC counts to
//! amperes) changed between firmware 1.1 and 1.2; 1.2 boards additionally
//! store a measured ADC offset per stage in their EEPROM settings, keyed
//! by the feedback resistor.

use potlib_core::error::{Error, Result};
use potlib_core::types::FirmwareVersion;

use crate::settings::Settings;

/// Number of selectable gain stages.
pub const GAIN_STAGES: usize = 8;

/// Gain divisors for firmware 1.1 boards, indexed by gain code.
const GAIN_TABLE_V1_1: [f64; GAIN_STAGES] = [1e2, 3e2, 3e3, 3e4, 3e5, 3e6, 3e7, 5e8];

/// Gain divisors for firmware 1.2 and later, indexed by gain code.
/// Stage 0 is a unity bypass.
const GAIN_TABLE_V1_2: [f64; GAIN_STAGES] = [1.0, 1e2, 3e3, 3e4, 3e5, 3e6, 3e7, 1e8];

/// EEPROM trim key for each 1.2+ gain stage. The bypass stage has none.
const TRIM_KEYS: [Option<&str>; GAIN_STAGES] = [
    None,
    Some("r100_trim"),
    Some("r3k_trim"),
    Some("r30k_trim"),
    Some("r300k_trim"),
    Some("r3M_trim"),
    Some("r30M_trim"),
    Some("r100M_trim"),
];

/// EEPROM settings key holding the trim for a gain stage, if the stage
/// has one. Calibration tools use this to store a freshly measured offset.
pub fn trim_key(index: u8) -> Option<&'static str> {
    TRIM_KEYS.get(usize::from(index)).copied().flatten()
}

/// A resolved gain stage: everything sample decoding needs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GainSetting {
    /// Gain code as sent on the wire.
    pub index: u8,
    /// Divisor applied when scaling raw counts to amperes.
    pub value: f64,
    /// ADC offset added to raw counts before scaling.
    pub trim: i32,
}

/// Resolve a gain index against the firmware's table and, for trim-capable
/// firmware, the EEPROM trim for that stage.
///
/// Firmware 1.1 has no per-stage trim, so `settings` may be `None` there.
/// For 1.2+ the instrument settings must already have been read, except
/// for the untrimmed bypass stage.
pub fn resolve_gain(
    version: FirmwareVersion,
    settings: Option<&Settings>,
    index: u8,
) -> Result<GainSetting> {
    let idx = usize::from(index);
    if idx >= GAIN_STAGES {
        return Err(Error::InvalidParameter(format!(
            "gain index {index} out of range 0..{GAIN_STAGES}"
        )));
    }

    if !version.has_gain_trim() {
        return Ok(GainSetting {
            index,
            value: GAIN_TABLE_V1_1[idx],
            trim: 0,
        });
    }

    let trim = match TRIM_KEYS[idx] {
        None => 0,
        Some(key) => {
            let settings = settings.ok_or_else(|| {
                Error::InvalidParameter(
                    "gain trim needs the instrument settings; read them first".into(),
                )
            })?;
            let text = settings.get(key).ok_or_else(|| {
                Error::Protocol(format!("instrument settings missing {key}"))
            })?;
            text.trim().parse::<i32>().map_err(|_| {
                Error::Protocol(format!("setting {key} is not an integer: {text:?}"))
            })?
        }
    };

    Ok(GainSetting {
        index,
        value: GAIN_TABLE_V1_2[idx],
        trim,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trim_settings() -> Settings {
        Settings::parse(
            "r100_trim.10:r3k_trim.-20:r30k_trim.30:r300k_trim.40:\
             r3M_trim.50:r30M_trim.60:r100M_trim.70",
        )
        .unwrap()
    }

    #[test]
    fn trim_keys_cover_every_stage_but_the_bypass() {
        assert_eq!(trim_key(0), None);
        assert_eq!(trim_key(2), Some("r3k_trim"));
        assert_eq!(trim_key(7), Some("r100M_trim"));
        assert_eq!(trim_key(8), None);
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let err = resolve_gain(FirmwareVersion::new(1, 2), None, 8).unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(_)));
    }

    #[test]
    fn v1_1_needs_no_settings() {
        let g = resolve_gain(FirmwareVersion::new(1, 1), None, 2).unwrap();
        assert_eq!(g.value, 3e3);
        assert_eq!(g.trim, 0);
    }

    #[test]
    fn v1_1_top_stage_differs_from_v1_2() {
        let old = resolve_gain(FirmwareVersion::new(1, 1), None, 7).unwrap();
        let new = resolve_gain(FirmwareVersion::new(1, 2), Some(&trim_settings()), 7).unwrap();
        assert_eq!(old.value, 5e8);
        assert_eq!(new.value, 1e8);
        assert_eq!(new.trim, 70);
    }

    #[test]
    fn v1_2_bypass_stage_has_no_trim() {
        let g = resolve_gain(FirmwareVersion::new(1, 2), None, 0).unwrap();
        assert_eq!(g.value, 1.0);
        assert_eq!(g.trim, 0);
    }

    #[test]
    fn v1_2_trim_is_read_from_settings() {
        let g = resolve_gain(FirmwareVersion::new(1, 2), Some(&trim_settings()), 2).unwrap();
        assert_eq!(g.value, 3e3);
        assert_eq!(g.trim, -20);
    }

    #[test]
    fn v1_2_trimmed_stage_without_settings_fails() {
        let err = resolve_gain(FirmwareVersion::new(1, 2), None, 2).unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(_)));
    }

    #[test]
    fn missing_trim_key_is_a_protocol_error() {
        let settings = Settings::parse("max_time.180").unwrap();
        let err = resolve_gain(FirmwareVersion::new(1, 2), Some(&settings), 1).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn garbage_trim_value_is_a_protocol_error() {
        let settings = Settings::parse("r100_trim.banana").unwrap();
        let err = resolve_gain(FirmwareVersion::new(1, 2), Some(&settings), 1).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
