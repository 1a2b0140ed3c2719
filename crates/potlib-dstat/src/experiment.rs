//! Measurement catalog: technique parameters and command assembly.
//!
//! Each technique is described by a plain parameter struct. Wrapping the
//! parameters in an [`ExperimentRequest`] validates every field, so any
//! request that exists is safe to put on the wire; out-of-range values are
//! rejected at construction instead of being clamped.

use potlib_core::error::{Error, Result};
use potlib_core::types::FirmwareVersion;

use crate::commands;
use crate::decode::{RecordLayout, SampleDecoder};
use crate::gain::{self, GainSetting, GAIN_STAGES};
use crate::settings::Settings;

/// Widest potential the DAC can drive, in millivolts.
pub const POTENTIAL_LIMIT_MV: f64 = 1500.0;

/// Hold time used for the idle photodiode monitor, in seconds.
const PMT_IDLE_TIME_S: u16 = 65535;

/// ADC profile used by open-circuit monitoring: buffered input at the
/// lowest data rate.
const OCP_ADC: AdcSettings = AdcSettings {
    buffer: 2,
    rate: 3,
    pga: 1,
};

/// How a technique's samples are organised, for downstream consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataClass {
    /// One series over a single potential or time axis.
    Linear,
    /// One series per scan (cyclic techniques).
    MultiScan,
    /// Difference plus forward/reverse component currents per point.
    Differential,
}

/// ADC front-end configuration sent before every measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdcSettings {
    /// Input buffer code.
    pub buffer: u8,
    /// Data-rate code.
    pub rate: u8,
    /// Programmable-gain-amplifier code.
    pub pga: u8,
}

impl Default for AdcSettings {
    fn default() -> Self {
        AdcSettings {
            buffer: 0,
            rate: 3,
            pga: 1,
        }
    }
}

/// One chronoamperometry step: hold `potential_mv` for `duration_s`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChronoampStep {
    pub potential_mv: f64,
    pub duration_s: u16,
}

/// Multi-step chronoamperometry.
#[derive(Debug, Clone, PartialEq)]
pub struct ChronoampParams {
    pub steps: Vec<ChronoampStep>,
}

impl ChronoampParams {
    fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(Error::InvalidParameter(
                "chronoamperometry needs at least one step".into(),
            ));
        }
        if self.steps.len() > 255 {
            return Err(Error::InvalidParameter(format!(
                "chronoamperometry supports at most 255 steps, got {}",
                self.steps.len()
            )));
        }
        for step in &self.steps {
            check_potential("step potential", step.potential_mv)?;
        }
        Ok(())
    }

    /// Total programmed duration across all steps, in seconds.
    ///
    /// This is the time axis a consumer should reserve for the run.
    pub fn total_time_s(&self) -> u32 {
        self.steps.iter().map(|s| u32::from(s.duration_s)).sum()
    }

    fn command(&self) -> String {
        let potentials: Vec<f64> = self.steps.iter().map(|s| s.potential_mv).collect();
        let times: Vec<u16> = self.steps.iter().map(|s| s.duration_s).collect();
        commands::cmd_chronoamp(&potentials, &times)
    }
}

/// Linear-sweep voltammetry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LsvParams {
    pub clean_s: u16,
    pub dep_s: u16,
    pub clean_mv: f64,
    pub dep_mv: f64,
    pub start_mv: f64,
    pub stop_mv: f64,
    /// Sweep rate in mV/s.
    pub slope_mv_s: u16,
}

impl LsvParams {
    fn validate(&self) -> Result<()> {
        check_potential("cleaning potential", self.clean_mv)?;
        check_potential("deposition potential", self.dep_mv)?;
        check_potential("start potential", self.start_mv)?;
        check_potential("stop potential", self.stop_mv)?;
        if self.start_mv == self.stop_mv {
            return Err(Error::InvalidParameter(
                "sweep start and stop potentials are equal".into(),
            ));
        }
        if self.slope_mv_s == 0 {
            return Err(Error::InvalidParameter("sweep rate must be nonzero".into()));
        }
        Ok(())
    }

    fn command(&self) -> String {
        commands::cmd_lsv(
            self.clean_s,
            self.dep_s,
            self.clean_mv,
            self.dep_mv,
            self.start_mv,
            self.stop_mv,
            self.slope_mv_s,
        )
    }
}

/// Cyclic voltammetry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CvParams {
    pub clean_s: u16,
    pub dep_s: u16,
    pub clean_mv: f64,
    pub dep_mv: f64,
    /// First vertex potential.
    pub v1_mv: f64,
    /// Second vertex potential.
    pub v2_mv: f64,
    pub start_mv: f64,
    pub scans: u8,
    /// Sweep rate in mV/s.
    pub slope_mv_s: u16,
}

impl CvParams {
    fn validate(&self) -> Result<()> {
        check_potential("cleaning potential", self.clean_mv)?;
        check_potential("deposition potential", self.dep_mv)?;
        check_potential("first vertex", self.v1_mv)?;
        check_potential("second vertex", self.v2_mv)?;
        check_potential("start potential", self.start_mv)?;
        if self.v1_mv == self.v2_mv {
            return Err(Error::InvalidParameter(
                "cyclic vertices are equal".into(),
            ));
        }
        if self.scans == 0 {
            return Err(Error::InvalidParameter(
                "cyclic voltammetry needs at least one scan".into(),
            ));
        }
        if self.slope_mv_s == 0 {
            return Err(Error::InvalidParameter("sweep rate must be nonzero".into()));
        }
        Ok(())
    }

    fn command(&self) -> String {
        commands::cmd_cv(
            self.clean_s,
            self.dep_s,
            self.clean_mv,
            self.dep_mv,
            self.v1_mv,
            self.v2_mv,
            self.start_mv,
            self.scans,
            self.slope_mv_s,
        )
    }
}

/// Square-wave voltammetry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SwvParams {
    pub clean_s: u16,
    pub dep_s: u16,
    pub clean_mv: f64,
    pub dep_mv: f64,
    pub start_mv: f64,
    pub stop_mv: f64,
    /// Staircase step height in mV.
    pub step_mv: u16,
    /// Pulse height in mV.
    pub pulse_mv: u16,
    /// Square-wave frequency in Hz.
    pub freq_hz: u16,
    /// Cyclic scan count; 0 runs a plain one-way sweep.
    pub scans: u8,
}

impl SwvParams {
    fn validate(&self) -> Result<()> {
        check_potential("cleaning potential", self.clean_mv)?;
        check_potential("deposition potential", self.dep_mv)?;
        check_potential("start potential", self.start_mv)?;
        check_potential("stop potential", self.stop_mv)?;
        if self.step_mv == 0 {
            return Err(Error::InvalidParameter("step height must be nonzero".into()));
        }
        if self.freq_hz == 0 {
            return Err(Error::InvalidParameter("frequency must be nonzero".into()));
        }
        Ok(())
    }

    fn command(&self) -> String {
        commands::cmd_swv(
            self.clean_s,
            self.dep_s,
            self.clean_mv,
            self.dep_mv,
            self.start_mv,
            self.stop_mv,
            self.step_mv,
            self.pulse_mv,
            self.freq_hz,
            self.scans,
        )
    }
}

/// Differential-pulse voltammetry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DpvParams {
    pub clean_s: u16,
    pub dep_s: u16,
    pub clean_mv: f64,
    pub dep_mv: f64,
    pub start_mv: f64,
    pub stop_mv: f64,
    /// Staircase step height in mV.
    pub step_mv: u16,
    /// Pulse height in mV.
    pub pulse_mv: u16,
    /// Pulse period in ms.
    pub period_ms: u16,
    /// Pulse width in ms. Must be shorter than the period.
    pub width_ms: u16,
}

impl DpvParams {
    fn validate(&self) -> Result<()> {
        check_potential("cleaning potential", self.clean_mv)?;
        check_potential("deposition potential", self.dep_mv)?;
        check_potential("start potential", self.start_mv)?;
        check_potential("stop potential", self.stop_mv)?;
        if self.step_mv == 0 {
            return Err(Error::InvalidParameter("step height must be nonzero".into()));
        }
        if self.period_ms == 0 {
            return Err(Error::InvalidParameter("pulse period must be nonzero".into()));
        }
        if self.width_ms == 0 || self.width_ms >= self.period_ms {
            return Err(Error::InvalidParameter(format!(
                "pulse width {} ms must be between 1 and the period ({} ms)",
                self.width_ms, self.period_ms
            )));
        }
        Ok(())
    }

    fn command(&self) -> String {
        commands::cmd_dpv(
            self.clean_s,
            self.dep_s,
            self.clean_mv,
            self.dep_mv,
            self.start_mv,
            self.stop_mv,
            self.step_mv,
            self.pulse_mv,
            self.period_ms,
            self.width_ms,
        )
    }
}

/// Photodiode/PMT current measurement at a fixed bias.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PdParams {
    /// Bias potential in mV; non-negative, 0 parks the bias DAC.
    pub voltage_mv: f64,
    pub time_s: u16,
    /// Enforce the shutter interlock.
    pub interlock: bool,
}

impl PdParams {
    fn validate(&self) -> Result<()> {
        if !self.voltage_mv.is_finite()
            || self.voltage_mv < 0.0
            || self.voltage_mv > POTENTIAL_LIMIT_MV
        {
            return Err(Error::InvalidParameter(format!(
                "photodiode bias {} mV outside 0..={POTENTIAL_LIMIT_MV} mV",
                self.voltage_mv
            )));
        }
        if self.time_s == 0 {
            return Err(Error::InvalidParameter(
                "measurement time must be nonzero".into(),
            ));
        }
        Ok(())
    }

    fn command(&self) -> String {
        commands::cmd_photodiode(self.voltage_mv, self.time_s, self.interlock)
    }
}

/// Potentiometry: record the cell potential over time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PotParams {
    pub time_s: u16,
}

impl PotParams {
    fn validate(&self) -> Result<()> {
        if self.time_s == 0 {
            return Err(Error::InvalidParameter(
                "measurement time must be nonzero".into(),
            ));
        }
        Ok(())
    }

    fn command(&self) -> String {
        commands::cmd_potentiometry(self.time_s)
    }
}

/// The measurement technique to run, with its parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum ExperimentKind {
    Chronoamperometry(ChronoampParams),
    LinearSweep(LsvParams),
    CyclicVoltammetry(CvParams),
    SquareWave(SwvParams),
    DifferentialPulse(DpvParams),
    Photodiode(PdParams),
    Potentiometry(PotParams),
    /// Open-circuit potential monitoring. Runs on a fixed buffered
    /// low-speed ADC profile; the request's ADC and gain settings are
    /// not used.
    OpenCircuit,
    /// Idle photodiode monitor: bias parked at 0 mV, interlock off, and
    /// an effectively unbounded hold time. Meant to be aborted when the
    /// next real task arrives.
    PmtIdle,
}

impl ExperimentKind {
    fn validate(&self) -> Result<()> {
        match self {
            ExperimentKind::Chronoamperometry(p) => p.validate(),
            ExperimentKind::LinearSweep(p) => p.validate(),
            ExperimentKind::CyclicVoltammetry(p) => p.validate(),
            ExperimentKind::SquareWave(p) => p.validate(),
            ExperimentKind::DifferentialPulse(p) => p.validate(),
            ExperimentKind::Photodiode(p) => p.validate(),
            ExperimentKind::Potentiometry(p) => p.validate(),
            ExperimentKind::OpenCircuit | ExperimentKind::PmtIdle => Ok(()),
        }
    }

    /// Binary record layout this technique streams.
    pub fn layout(&self) -> RecordLayout {
        match self {
            ExperimentKind::Chronoamperometry(_)
            | ExperimentKind::Photodiode(_)
            | ExperimentKind::PmtIdle => RecordLayout::TimeCurrent,
            ExperimentKind::LinearSweep(_) | ExperimentKind::CyclicVoltammetry(_) => {
                RecordLayout::PotentialCurrent
            }
            ExperimentKind::SquareWave(_) | ExperimentKind::DifferentialPulse(_) => {
                RecordLayout::PotentialForwardReverse
            }
            ExperimentKind::Potentiometry(_) => RecordLayout::TimePotential,
            ExperimentKind::OpenCircuit => RecordLayout::TimeOpenCircuit,
        }
    }

    /// How downstream consumers should organise the samples.
    pub fn data_class(&self) -> DataClass {
        match self {
            ExperimentKind::CyclicVoltammetry(_) => DataClass::MultiScan,
            ExperimentKind::SquareWave(_) | ExperimentKind::DifferentialPulse(_) => {
                DataClass::Differential
            }
            _ => DataClass::Linear,
        }
    }

    /// Technique label used in logs and run records.
    pub fn label(&self) -> &'static str {
        match self {
            ExperimentKind::Chronoamperometry(_) => "chronoamperometry",
            ExperimentKind::LinearSweep(_) => "linear sweep voltammetry",
            ExperimentKind::CyclicVoltammetry(_) => "cyclic voltammetry",
            ExperimentKind::SquareWave(_) => "square wave voltammetry",
            ExperimentKind::DifferentialPulse(_) => "differential pulse voltammetry",
            ExperimentKind::Photodiode(_) => "photodiode",
            ExperimentKind::Potentiometry(_) => "potentiometry",
            ExperimentKind::OpenCircuit => "open circuit potential",
            ExperimentKind::PmtIdle => "photodiode idle",
        }
    }
}

/// A validated, fully-specified measurement request.
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentRequest {
    kind: ExperimentKind,
    adc: AdcSettings,
    gain_index: u8,
    re_short: bool,
}

impl ExperimentRequest {
    /// Validate the technique parameters and front-end setup.
    pub fn new(kind: ExperimentKind, adc: AdcSettings, gain_index: u8) -> Result<Self> {
        if usize::from(gain_index) >= GAIN_STAGES {
            return Err(Error::InvalidParameter(format!(
                "gain index {gain_index} out of range 0..{GAIN_STAGES}"
            )));
        }
        kind.validate()?;
        Ok(ExperimentRequest {
            kind,
            adc,
            gain_index,
            re_short: false,
        })
    }

    /// An open-circuit monitoring request (no tunable parameters).
    pub fn open_circuit() -> Self {
        ExperimentRequest {
            kind: ExperimentKind::OpenCircuit,
            adc: OCP_ADC,
            gain_index: 0,
            re_short: false,
        }
    }

    /// Short the reference electrode to the counter while the gain stage
    /// switches. Firmware 1.2+ only; older firmware ignores it.
    pub fn with_re_short(mut self, enabled: bool) -> Self {
        self.re_short = enabled;
        self
    }

    pub fn kind(&self) -> &ExperimentKind {
        &self.kind
    }

    pub fn gain_index(&self) -> u8 {
        self.gain_index
    }

    /// Resolve instrument state into the exact command list and decoder
    /// for this request.
    pub(crate) fn prepare(
        &self,
        version: Option<FirmwareVersion>,
        settings: Option<&Settings>,
    ) -> Result<PreparedExperiment> {
        let technique = match &self.kind {
            ExperimentKind::Chronoamperometry(p) => p.command(),
            ExperimentKind::LinearSweep(p) => p.command(),
            ExperimentKind::CyclicVoltammetry(p) => p.command(),
            ExperimentKind::SquareWave(p) => p.command(),
            ExperimentKind::DifferentialPulse(p) => p.command(),
            ExperimentKind::Photodiode(p) => p.command(),
            ExperimentKind::Potentiometry(p) => p.command(),
            ExperimentKind::PmtIdle => commands::cmd_photodiode(0.0, PMT_IDLE_TIME_S, false),
            ExperimentKind::OpenCircuit => {
                // Fixed profile; no gain command, no version dependency.
                return Ok(PreparedExperiment {
                    commands: vec![
                        commands::cmd_adc_setup(OCP_ADC.buffer, OCP_ADC.rate, OCP_ADC.pga),
                        commands::cmd_open_circuit(),
                    ],
                    decoder: SampleDecoder::new(
                        self.kind.layout(),
                        GainSetting {
                            index: 0,
                            value: 1.0,
                            trim: 0,
                        },
                    ),
                    data_class: self.kind.data_class(),
                    label: self.kind.label(),
                });
            }
        };

        let version = version.ok_or_else(|| {
            Error::InvalidParameter(
                "firmware version unknown; run a version check first".into(),
            )
        })?;
        let gain = gain::resolve_gain(version, settings, self.gain_index)?;

        Ok(PreparedExperiment {
            commands: vec![
                commands::cmd_adc_setup(self.adc.buffer, self.adc.rate, self.adc.pga),
                commands::cmd_gain(version, self.gain_index, self.re_short),
                technique,
            ],
            decoder: SampleDecoder::new(self.kind.layout(), gain),
            data_class: self.kind.data_class(),
            label: self.kind.label(),
        })
    }
}

/// A request resolved against instrument state, ready to execute.
#[derive(Debug, Clone)]
pub(crate) struct PreparedExperiment {
    pub commands: Vec<String>,
    pub decoder: SampleDecoder,
    pub data_class: DataClass,
    pub label: &'static str,
}

/// Gain-calibration run: measure the ADC offset with the bias parked.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationParams {
    time_s: u16,
    adc: AdcSettings,
    gain_index: u8,
}

impl CalibrationParams {
    /// Validate a calibration setup. The instrument streams readings for
    /// `time_s` seconds; the first reading is discarded, so the run must
    /// be long enough to produce at least two.
    pub fn new(time_s: u16, adc: AdcSettings, gain_index: u8) -> Result<Self> {
        if time_s == 0 {
            return Err(Error::InvalidParameter(
                "calibration time must be nonzero".into(),
            ));
        }
        if usize::from(gain_index) >= GAIN_STAGES {
            return Err(Error::InvalidParameter(format!(
                "gain index {gain_index} out of range 0..{GAIN_STAGES}"
            )));
        }
        Ok(CalibrationParams {
            time_s,
            adc,
            gain_index,
        })
    }

    pub fn time_s(&self) -> u16 {
        self.time_s
    }

    pub fn gain_index(&self) -> u8 {
        self.gain_index
    }

    pub(crate) fn prepare(&self, version: Option<FirmwareVersion>) -> Result<Vec<String>> {
        let version = version.ok_or_else(|| {
            Error::InvalidParameter(
                "firmware version unknown; run a version check first".into(),
            )
        })?;
        Ok(vec![
            commands::cmd_adc_setup(self.adc.buffer, self.adc.rate, self.adc.pga),
            commands::cmd_gain(version, self.gain_index, false),
            commands::cmd_photodiode(0.0, self.time_s, false),
        ])
    }
}

/// Reduce a calibration run's raw readings to the stage's trim value:
/// drop the first (settling) reading, take the integer mean of the rest,
/// and clamp to the EEPROM's 16-bit signed range.
pub(crate) fn calibration_mean(counts: &[i32]) -> Result<i16> {
    if counts.len() < 2 {
        return Err(Error::Protocol(format!(
            "calibration run produced {} readings, need at least 2",
            counts.len()
        )));
    }
    let rest = &counts[1..];
    let sum: i64 = rest.iter().map(|&c| i64::from(c)).sum();
    let mean = sum / rest.len() as i64;
    Ok(mean.clamp(i64::from(i16::MIN), i64::from(i16::MAX)) as i16)
}

fn check_potential(name: &str, mv: f64) -> Result<()> {
    if !mv.is_finite() || mv.abs() > POTENTIAL_LIMIT_MV {
        return Err(Error::InvalidParameter(format!(
            "{name} {mv} mV outside the ±{POTENTIAL_LIMIT_MV} mV range"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cv_params() -> CvParams {
        CvParams {
            clean_s: 0,
            dep_s: 0,
            clean_mv: 0.0,
            dep_mv: 0.0,
            v1_mv: -500.0,
            v2_mv: 500.0,
            start_mv: 0.0,
            scans: 1,
            slope_mv_s: 1000,
        }
    }

    fn trim_settings() -> Settings {
        Settings::parse(
            "r100_trim.10:r3k_trim.-20:r30k_trim.30:r300k_trim.40:\
             r3M_trim.50:r30M_trim.60:r100M_trim.70",
        )
        .unwrap()
    }

    // ---------------------------------------------------------------
    // Validation
    // ---------------------------------------------------------------

    #[test]
    fn request_rejects_out_of_range_potential() {
        let mut params = cv_params();
        params.v2_mv = 1501.0;
        let err = ExperimentRequest::new(
            ExperimentKind::CyclicVoltammetry(params),
            AdcSettings::default(),
            2,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(_)));
    }

    #[test]
    fn request_rejects_bad_gain_index() {
        let err = ExperimentRequest::new(
            ExperimentKind::CyclicVoltammetry(cv_params()),
            AdcSettings::default(),
            8,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(_)));
    }

    #[test]
    fn cv_rejects_zero_scans_and_equal_vertices() {
        let mut params = cv_params();
        params.scans = 0;
        assert!(params.validate().is_err());

        let mut params = cv_params();
        params.v2_mv = params.v1_mv;
        assert!(params.validate().is_err());
    }

    #[test]
    fn lsv_rejects_flat_sweep() {
        let params = LsvParams {
            clean_s: 0,
            dep_s: 0,
            clean_mv: 0.0,
            dep_mv: 0.0,
            start_mv: 100.0,
            stop_mv: 100.0,
            slope_mv_s: 100,
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn dpv_rejects_width_at_or_over_period() {
        let mut params = DpvParams {
            clean_s: 0,
            dep_s: 0,
            clean_mv: 0.0,
            dep_mv: 0.0,
            start_mv: -100.0,
            stop_mv: 100.0,
            step_mv: 2,
            pulse_mv: 50,
            period_ms: 200,
            width_ms: 200,
        };
        assert!(params.validate().is_err());
        params.width_ms = 100;
        assert!(params.validate().is_ok());
    }

    #[test]
    fn pd_rejects_negative_bias() {
        let params = PdParams {
            voltage_mv: -1.0,
            time_s: 10,
            interlock: false,
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn chronoamp_rejects_empty_steps() {
        let params = ChronoampParams { steps: Vec::new() };
        assert!(params.validate().is_err());
    }

    #[test]
    fn chronoamp_total_time() {
        let params = ChronoampParams {
            steps: vec![
                ChronoampStep {
                    potential_mv: 100.0,
                    duration_s: 5,
                },
                ChronoampStep {
                    potential_mv: -100.0,
                    duration_s: 10,
                },
            ],
        };
        assert_eq!(params.total_time_s(), 15);
        assert_eq!(params.command(), "ER2 34953 30583 5 10 0 ");
    }

    // ---------------------------------------------------------------
    // Preparation
    // ---------------------------------------------------------------

    #[test]
    fn prepare_without_version_fails() {
        let request = ExperimentRequest::new(
            ExperimentKind::CyclicVoltammetry(cv_params()),
            AdcSettings::default(),
            2,
        )
        .unwrap();
        let err = request.prepare(None, None).unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(_)));
    }

    #[test]
    fn prepare_v1_1_assembles_adc_gain_technique() {
        let request = ExperimentRequest::new(
            ExperimentKind::CyclicVoltammetry(cv_params()),
            AdcSettings::default(),
            2,
        )
        .unwrap();
        let prepared = request
            .prepare(Some(FirmwareVersion::new(1, 1)), None)
            .unwrap();
        assert_eq!(
            prepared.commands,
            vec![
                "EA0 3 1 ".to_string(),
                "EG2 ".to_string(),
                "EC0 0 32768 32768 21845 43691 32768 1 1000 ".to_string(),
            ]
        );
        assert_eq!(prepared.data_class, DataClass::MultiScan);
        assert_eq!(prepared.decoder.layout(), RecordLayout::PotentialCurrent);
    }

    #[test]
    fn prepare_v1_2_gain_flag_and_trim() {
        let request = ExperimentRequest::new(
            ExperimentKind::CyclicVoltammetry(cv_params()),
            AdcSettings::default(),
            2,
        )
        .unwrap()
        .with_re_short(true);
        let prepared = request
            .prepare(Some(FirmwareVersion::new(1, 2)), Some(&trim_settings()))
            .unwrap();
        assert_eq!(prepared.commands[1], "EG2 1 ");
    }

    #[test]
    fn prepare_v1_2_trimmed_stage_needs_settings() {
        let request = ExperimentRequest::new(
            ExperimentKind::CyclicVoltammetry(cv_params()),
            AdcSettings::default(),
            2,
        )
        .unwrap();
        let err = request
            .prepare(Some(FirmwareVersion::new(1, 2)), None)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(_)));
    }

    #[test]
    fn open_circuit_uses_fixed_commands_without_version() {
        let request = ExperimentRequest::open_circuit();
        let prepared = request.prepare(None, None).unwrap();
        assert_eq!(
            prepared.commands,
            vec!["EA2 3 1 ".to_string(), "EP0 0 ".to_string()]
        );
        assert_eq!(prepared.decoder.layout(), RecordLayout::TimeOpenCircuit);
        assert_eq!(prepared.data_class, DataClass::Linear);
    }

    #[test]
    fn pmt_idle_is_a_parked_photodiode_hold() {
        let request = ExperimentRequest::new(
            ExperimentKind::PmtIdle,
            AdcSettings::default(),
            1,
        )
        .unwrap();
        let prepared = request
            .prepare(Some(FirmwareVersion::new(1, 2)), Some(&trim_settings()))
            .unwrap();
        assert_eq!(prepared.commands[2], "ER1 65535 65535 0 ");
        assert_eq!(prepared.decoder.layout(), RecordLayout::TimeCurrent);
    }

    #[test]
    fn technique_labels_and_classes() {
        let kind = ExperimentKind::SquareWave(SwvParams {
            clean_s: 0,
            dep_s: 0,
            clean_mv: 0.0,
            dep_mv: 0.0,
            start_mv: -400.0,
            stop_mv: 400.0,
            step_mv: 4,
            pulse_mv: 25,
            freq_hz: 15,
            scans: 0,
        });
        assert_eq!(kind.label(), "square wave voltammetry");
        assert_eq!(kind.data_class(), DataClass::Differential);
        assert_eq!(kind.layout(), RecordLayout::PotentialForwardReverse);
    }

    // ---------------------------------------------------------------
    // Calibration
    // ---------------------------------------------------------------

    #[test]
    fn calibration_command_list() {
        let params = CalibrationParams::new(10, AdcSettings::default(), 3).unwrap();
        let cmds = params.prepare(Some(FirmwareVersion::new(1, 2))).unwrap();
        assert_eq!(
            cmds,
            vec![
                "EA0 3 1 ".to_string(),
                "EG3 0 ".to_string(),
                "ER1 65535 10 0 ".to_string(),
            ]
        );
    }

    #[test]
    fn calibration_rejects_zero_time() {
        assert!(CalibrationParams::new(0, AdcSettings::default(), 3).is_err());
    }

    #[test]
    fn calibration_mean_drops_first_reading() {
        // First reading (9999) is settling junk and must not count.
        let mean = calibration_mean(&[9999, 10, 20, 30]).unwrap();
        assert_eq!(mean, 20);
    }

    #[test]
    fn calibration_mean_clamps_to_i16() {
        let mean = calibration_mean(&[0, 1_000_000, 1_000_000]).unwrap();
        assert_eq!(mean, i16::MAX);
        let mean = calibration_mean(&[0, -1_000_000]).unwrap();
        assert_eq!(mean, i16::MIN);
    }

    #[test]
    fn calibration_mean_needs_two_readings() {
        assert!(calibration_mean(&[]).is_err());
        assert!(calibration_mean(&[5]).is_err());
    }
}
