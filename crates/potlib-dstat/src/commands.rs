//! Command-string builders and response-line parsers.
//!
//! DStat commands are short ASCII strings: a one- or two-letter opcode
//! followed by space-separated decimal fields, every field terminated by a
//! single space (including the last). Measurement opcodes start with `E`;
//! housekeeping opcodes (`V`, `SR`, `SW`, `T`) stand alone.
//!
//! Absolute potentials travel as offset-binary DAC codes (see
//! [`encode_mv`]); relative steps, times, rates and counts travel as plain
//! decimal text.

use potlib_core::error::{Error, Result};
use potlib_core::types::FirmwareVersion;

use crate::protocol::{encode_mv, encode_pd_mv};
use crate::settings::Settings;

/// `V `: firmware version query.
pub fn cmd_version() -> String {
    "V".to_string()
}

/// `SR`: read the EEPROM settings line.
pub fn cmd_settings_read() -> String {
    "SR".to_string()
}

/// `SW`: write EEPROM settings. Values only, in the order the instrument
/// reported the keys.
pub fn cmd_settings_write(settings: &Settings) -> String {
    format!("SW{}", settings.write_values())
}

/// `T`: read the ambient light sensor.
pub fn cmd_light_sensor() -> String {
    "T".to_string()
}

/// `EA`: configure the ADC front end: `EA<buffer> <rate> <pga> `.
pub fn cmd_adc_setup(buffer: u8, rate: u8, pga: u8) -> String {
    format!("EA{buffer} {rate} {pga} ")
}

/// `EG`: select the transimpedance gain stage.
///
/// Firmware 1.2+ takes a second field that shorts the reference electrode
/// to the counter while the stage switches: `EG<gain> <short> `. Firmware
/// 1.1 only understands the bare form `EG<gain> `.
pub fn cmd_gain(version: FirmwareVersion, gain_index: u8, re_short: bool) -> String {
    if version.supports_re_short() {
        format!("EG{gain_index} {} ", u8::from(re_short))
    } else {
        format!("EG{gain_index} ")
    }
}

/// `ER`: multi-step chronoamperometry.
///
/// `ER<n> <pot_1> .. <pot_n> <time_1> .. <time_n> 0 `, with each step
/// potential offset-binary encoded and each hold time in whole seconds.
/// The trailing `0` fills the interlock slot the firmware shares with
/// [`cmd_photodiode`]; chronoamperometry never engages the shutter.
pub fn cmd_chronoamp(potentials_mv: &[f64], times_s: &[u16]) -> String {
    let mut cmd = format!("ER{}", potentials_mv.len());
    for &mv in potentials_mv {
        cmd.push(' ');
        cmd.push_str(&encode_mv(mv).to_string());
    }
    for &t in times_s {
        cmd.push(' ');
        cmd.push_str(&t.to_string());
    }
    cmd.push_str(" 0 ");
    cmd
}

/// `EL`: linear-sweep voltammetry.
///
/// `EL<clean_s> <dep_s> <clean> <dep> <start> <stop> <slope> ` with the
/// four potentials offset-binary encoded and the slope in mV/s.
pub fn cmd_lsv(
    clean_s: u16,
    dep_s: u16,
    clean_mv: f64,
    dep_mv: f64,
    start_mv: f64,
    stop_mv: f64,
    slope_mv_s: u16,
) -> String {
    format!(
        "EL{clean_s} {dep_s} {} {} {} {} {slope_mv_s} ",
        encode_mv(clean_mv),
        encode_mv(dep_mv),
        encode_mv(start_mv),
        encode_mv(stop_mv),
    )
}

/// `EC`: cyclic voltammetry.
///
/// `EC<clean_s> <dep_s> <clean> <dep> <v1> <v2> <start> <scans> <slope> `
/// with the five potentials offset-binary encoded.
#[allow(clippy::too_many_arguments)]
pub fn cmd_cv(
    clean_s: u16,
    dep_s: u16,
    clean_mv: f64,
    dep_mv: f64,
    v1_mv: f64,
    v2_mv: f64,
    start_mv: f64,
    scans: u8,
    slope_mv_s: u16,
) -> String {
    format!(
        "EC{clean_s} {dep_s} {} {} {} {} {} {scans} {slope_mv_s} ",
        encode_mv(clean_mv),
        encode_mv(dep_mv),
        encode_mv(v1_mv),
        encode_mv(v2_mv),
        encode_mv(start_mv),
    )
}

/// `ES`: square-wave voltammetry.
///
/// `ES<clean_s> <dep_s> <clean> <dep> <start> <stop> <step> <pulse>
/// <freq> <scans> `. Step and pulse heights are relative, so they travel
/// as plain mV.
#[allow(clippy::too_many_arguments)]
pub fn cmd_swv(
    clean_s: u16,
    dep_s: u16,
    clean_mv: f64,
    dep_mv: f64,
    start_mv: f64,
    stop_mv: f64,
    step_mv: u16,
    pulse_mv: u16,
    freq_hz: u16,
    scans: u8,
) -> String {
    format!(
        "ES{clean_s} {dep_s} {} {} {} {} {step_mv} {pulse_mv} {freq_hz} {scans} ",
        encode_mv(clean_mv),
        encode_mv(dep_mv),
        encode_mv(start_mv),
        encode_mv(stop_mv),
    )
}

/// `ED`: differential-pulse voltammetry.
///
/// `ED<clean_s> <dep_s> <clean> <dep> <start> <stop> <step> <pulse>
/// <period> <width> ` with period and pulse width in milliseconds.
#[allow(clippy::too_many_arguments)]
pub fn cmd_dpv(
    clean_s: u16,
    dep_s: u16,
    clean_mv: f64,
    dep_mv: f64,
    start_mv: f64,
    stop_mv: f64,
    step_mv: u16,
    pulse_mv: u16,
    period_ms: u16,
    width_ms: u16,
) -> String {
    format!(
        "ED{clean_s} {dep_s} {} {} {} {} {step_mv} {pulse_mv} {period_ms} {width_ms} ",
        encode_mv(clean_mv),
        encode_mv(dep_mv),
        encode_mv(start_mv),
        encode_mv(stop_mv),
    )
}

/// `ER1`: single-step photodiode/PMT current measurement.
///
/// `ER1 <bias> <time> <interlock> ` where the bias uses the inverted
/// encoding of [`encode_pd_mv`] and interlock is `1` to enforce the
/// shutter interlock, `0` to ignore it.
pub fn cmd_photodiode(voltage_mv: f64, time_s: u16, interlock: bool) -> String {
    format!(
        "ER1 {} {time_s} {} ",
        encode_pd_mv(voltage_mv),
        u8::from(interlock)
    )
}

/// `EP`: potentiometry: `EP<time> 1 `.
pub fn cmd_potentiometry(time_s: u16) -> String {
    format!("EP{time_s} 1 ")
}

/// `EP0 0 `: open-circuit potential monitoring, untimed.
pub fn cmd_open_circuit() -> String {
    "EP0 0 ".to_string()
}

fn line_text(line: &[u8]) -> Result<&str> {
    std::str::from_utf8(line)
        .map_err(|_| Error::Protocol("response line is not valid UTF-8".into()))
}

/// Parse the version response line, e.g. `V1.2`.
pub fn parse_version_response(line: &[u8]) -> Result<FirmwareVersion> {
    let text = line_text(line)?.trim();
    let body = text.strip_prefix('V').unwrap_or(text);
    body.trim()
        .parse::<FirmwareVersion>()
        .map_err(|e| Error::Protocol(format!("bad version line {text:?}: {e}")))
}

/// Parse the settings response line: `S` followed by colon-separated
/// `key.value` pairs.
pub fn parse_settings_response(line: &[u8]) -> Result<Settings> {
    let text = line_text(line)?.trim();
    let body = text.strip_prefix('S').unwrap_or(text);
    Settings::parse(body)
}

/// Parse the light-sensor response line: `T` followed by the reading.
pub fn parse_light_sensor_response(line: &[u8]) -> Result<f64> {
    let text = line_text(line)?.trim();
    let body = text.strip_prefix('T').unwrap_or(text).trim();
    let token = body
        .split_whitespace()
        .next()
        .ok_or_else(|| Error::Protocol(format!("empty light-sensor line {text:?}")))?;
    token
        .parse::<f64>()
        .map_err(|_| Error::Protocol(format!("bad light-sensor reading {token:?}")))
}
