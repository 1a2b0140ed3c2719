// potlib test application -- CLI tool for exercising the DStat driver
// against a live instrument on a USB serial port.
//
// Usage:
//   potlib-test-app --port /dev/ttyACM0 info
//   potlib-test-app --port /dev/ttyACM0 settings get
//   potlib-test-app --port /dev/ttyACM0 settings set max_time 300
//   potlib-test-app --port /dev/ttyACM0 calibrate --gain 3 --time 10 --save
//   potlib-test-app --port /dev/ttyACM0 run cv --v1=-400 --v2 400 --scans 3
//   potlib-test-app --port /dev/ttyACM0 run --output steps.tsv ca 200:10 400:5
//   potlib-test-app --port /dev/ttyACM0 monitor --duration 60
//   potlib-test-app --port /dev/ttyACM0 stress --count 200
//   potlib-test-app selftest
//
// `selftest` needs no hardware: it drives the whole command/stream cycle
// against scripted mock transports.
//
// Wire-level logging comes from the driver's tracing spans; run with
// RUST_LOG=potlib_dstat=trace to watch the exchange byte by byte.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};

use potlib::dstat::experiment::{
    AdcSettings, CalibrationParams, ChronoampParams, ChronoampStep, CvParams, DpvParams,
    ExperimentKind, ExperimentRequest, LsvParams, PdParams, PotParams, SwvParams,
};
use potlib::dstat::gain;
use potlib::dstat::{
    CommandTask, DstatBuilder, RunRecord, SessionHandle, Settings, TaskOutcome, TaskReply,
};
use potlib::{FirmwareVersion, RunStatus, Sample, SampleValues};

mod selftest;

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// potlib test application -- exercises the DStat driver from the command line.
#[derive(Parser)]
#[command(name = "potlib-test-app", version, about)]
struct Cli {
    /// Serial port path (e.g. /dev/ttyACM0, COM5).
    /// Required for every command except `selftest`.
    #[arg(long)]
    port: Option<String>,

    /// Override the default 1,000,000 baud line rate.
    #[arg(long)]
    baud: Option<u32>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print firmware version, EEPROM settings, and the light sensor level.
    Info,

    /// EEPROM settings operations.
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },

    /// Read the ambient light sensor.
    Light,

    /// Measure the ADC offset of a gain stage with the cell inputs shorted.
    Calibrate {
        /// Averaging window in seconds.
        #[arg(long, default_value_t = 10)]
        time: u16,

        /// Gain stage to calibrate (stage 0 is the untrimmed bypass).
        #[arg(long, default_value_t = 2)]
        gain: u8,

        /// Store the measured offset in the EEPROM trim for this stage.
        #[arg(long)]
        save: bool,
    },

    /// Run a measurement and stream its samples as they arrive.
    Run {
        /// Write the run's samples to a tab-separated file.
        #[arg(long)]
        output: Option<String>,

        #[command(subcommand)]
        technique: Technique,
    },

    /// Monitor the open-circuit potential.
    Monitor {
        /// Duration in seconds (0 = run until the instrument stops).
        #[arg(long, default_value_t = 30)]
        duration: u64,

        /// Write the recorded trace to a tab-separated file.
        #[arg(long)]
        output: Option<String>,
    },

    /// Stress test: rapid-fire version checks over the serial link.
    Stress {
        /// Number of round trips.
        #[arg(long, default_value_t = 100)]
        count: u32,
    },

    /// Validate the driver against scripted mock transports. No hardware.
    Selftest {
        /// Synthetic records in the streaming phase.
        #[arg(long, default_value_t = 64)]
        records: u32,

        /// Seed for the synthetic ADC counts.
        #[arg(long, default_value_t = 42)]
        seed: u64,

        /// Comma-separated phases to run, or "all".
        #[arg(long, default_value = "all")]
        phases: String,
    },
}

#[derive(Subcommand)]
enum SettingsAction {
    /// Read and print every EEPROM entry.
    Get,

    /// Change one EEPROM entry and write the table back.
    Set {
        /// Settings key (e.g. max_time, r100_trim).
        key: String,
        /// New value.
        value: String,
    },
}

/// Analog front-end options shared by every measurement technique.
#[derive(Args)]
struct FrontEndArgs {
    /// Transimpedance gain stage (0-7).
    #[arg(long, default_value_t = 2)]
    gain: u8,

    /// ADC input buffer code.
    #[arg(long, default_value_t = 0)]
    buffer: u8,

    /// ADC data-rate code.
    #[arg(long, default_value_t = 3)]
    rate: u8,

    /// ADC programmable-gain-amplifier code.
    #[arg(long, default_value_t = 1)]
    pga: u8,

    /// Short the reference electrode while the gain switches (firmware 1.2+).
    #[arg(long)]
    re_short: bool,
}

impl FrontEndArgs {
    fn adc(&self) -> AdcSettings {
        AdcSettings {
            buffer: self.buffer,
            rate: self.rate,
            pga: self.pga,
        }
    }
}

/// Electrode pretreatment options shared by the sweep techniques.
#[derive(Args)]
struct PretreatArgs {
    /// Cleaning time in seconds.
    #[arg(long, default_value_t = 0)]
    clean_s: u16,

    /// Cleaning potential in mV.
    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
    clean_mv: f64,

    /// Deposition time in seconds.
    #[arg(long, default_value_t = 0)]
    dep_s: u16,

    /// Deposition potential in mV.
    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
    dep_mv: f64,
}

#[derive(Subcommand)]
enum Technique {
    /// Cyclic voltammetry.
    Cv {
        /// First vertex potential in mV.
        #[arg(long, default_value_t = -500.0, allow_negative_numbers = true)]
        v1: f64,

        /// Second vertex potential in mV.
        #[arg(long, default_value_t = 500.0, allow_negative_numbers = true)]
        v2: f64,

        /// Start (and end) potential in mV.
        #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
        start: f64,

        /// Number of scans.
        #[arg(long, default_value_t = 1)]
        scans: u8,

        /// Sweep rate in mV/s.
        #[arg(long, default_value_t = 1000)]
        slope: u16,

        #[command(flatten)]
        pretreat: PretreatArgs,

        #[command(flatten)]
        front: FrontEndArgs,
    },

    /// Linear-sweep voltammetry.
    Lsv {
        /// Start potential in mV.
        #[arg(long, default_value_t = -500.0, allow_negative_numbers = true)]
        start: f64,

        /// Stop potential in mV.
        #[arg(long, default_value_t = 500.0, allow_negative_numbers = true)]
        stop: f64,

        /// Sweep rate in mV/s.
        #[arg(long, default_value_t = 1000)]
        slope: u16,

        #[command(flatten)]
        pretreat: PretreatArgs,

        #[command(flatten)]
        front: FrontEndArgs,
    },

    /// Square-wave voltammetry.
    Swv {
        /// Start potential in mV.
        #[arg(long, default_value_t = -400.0, allow_negative_numbers = true)]
        start: f64,

        /// Stop potential in mV.
        #[arg(long, default_value_t = 400.0, allow_negative_numbers = true)]
        stop: f64,

        /// Staircase step height in mV.
        #[arg(long, default_value_t = 5)]
        step: u16,

        /// Pulse height in mV.
        #[arg(long, default_value_t = 25)]
        pulse: u16,

        /// Square-wave frequency in Hz.
        #[arg(long, default_value_t = 15)]
        freq: u16,

        /// Cyclic scan count (0 = plain one-way sweep).
        #[arg(long, default_value_t = 0)]
        scans: u8,

        #[command(flatten)]
        pretreat: PretreatArgs,

        #[command(flatten)]
        front: FrontEndArgs,
    },

    /// Differential-pulse voltammetry.
    Dpv {
        /// Start potential in mV.
        #[arg(long, default_value_t = -400.0, allow_negative_numbers = true)]
        start: f64,

        /// Stop potential in mV.
        #[arg(long, default_value_t = 400.0, allow_negative_numbers = true)]
        stop: f64,

        /// Staircase step height in mV.
        #[arg(long, default_value_t = 5)]
        step: u16,

        /// Pulse height in mV.
        #[arg(long, default_value_t = 50)]
        pulse: u16,

        /// Pulse period in ms.
        #[arg(long, default_value_t = 200)]
        period: u16,

        /// Pulse width in ms.
        #[arg(long, default_value_t = 100)]
        width: u16,

        #[command(flatten)]
        pretreat: PretreatArgs,

        #[command(flatten)]
        front: FrontEndArgs,
    },

    /// Multi-step chronoamperometry.
    Ca {
        /// Potential steps as mV:seconds pairs (e.g. 200:10 400:5).
        #[arg(required = true, value_name = "MV:SECONDS")]
        steps: Vec<String>,

        #[command(flatten)]
        front: FrontEndArgs,
    },

    /// Photodiode current at a fixed bias.
    Pd {
        /// Bias potential in mV (0 parks the bias DAC).
        #[arg(long, default_value_t = 0.0)]
        bias: f64,

        /// Measurement time in seconds.
        #[arg(long, default_value_t = 60)]
        time: u16,

        /// Enforce the shutter interlock.
        #[arg(long)]
        interlock: bool,

        #[command(flatten)]
        front: FrontEndArgs,
    },

    /// Potentiometry: record the cell potential over time.
    Pot {
        /// Measurement time in seconds.
        #[arg(long, default_value_t = 60)]
        time: u16,

        #[command(flatten)]
        front: FrontEndArgs,
    },
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Prompt the user for y/N confirmation. Returns true only if "y" or "Y" entered.
fn confirm(prompt: &str) -> bool {
    print!("{prompt}");
    io::stdout().flush().ok();
    let mut input = String::new();
    if io::stdin().read_line(&mut input).is_err() {
        return false;
    }
    matches!(input.trim(), "y" | "Y")
}

/// Parse one chronoamperometry step argument of the form `mv:seconds`.
fn parse_step(s: &str) -> Result<ChronoampStep> {
    let (mv, secs) = s
        .split_once(':')
        .with_context(|| format!("step '{s}' is not in mV:seconds form"))?;
    Ok(ChronoampStep {
        potential_mv: mv
            .trim()
            .parse()
            .with_context(|| format!("bad potential in step '{s}'"))?,
        duration_s: secs
            .trim()
            .parse()
            .with_context(|| format!("bad duration in step '{s}'"))?,
    })
}

fn print_sample(sample: &Sample) {
    match sample.values {
        SampleValues::Sweep {
            voltage_mv,
            current_a,
        } => {
            println!(
                "  scan {}  {voltage_mv:>9.1} mV  {current_a:>13.6e} A",
                sample.scan
            );
        }
        SampleValues::TimedCurrent { time_s, current_a } => {
            println!("  {time_s:>9.3} s  {current_a:>13.6e} A");
        }
        SampleValues::TimedVoltage { time_s, voltage_mv } => {
            println!("  {time_s:>9.3} s  {voltage_mv:>9.1} mV");
        }
        SampleValues::Pulse {
            voltage_mv,
            difference_a,
            forward_a,
            reverse_a,
        } => {
            println!(
                "  scan {}  {voltage_mv:>9.1} mV  diff {difference_a:>13.6e} A  \
                 (fwd {forward_a:.6e}, rev {reverse_a:.6e})",
                sample.scan
            );
        }
    }
}

fn column_header(record: &RunRecord) -> &'static str {
    match record.samples.first().map(|s| s.values) {
        Some(SampleValues::Sweep { .. }) => "voltage_mv\tcurrent_a",
        Some(SampleValues::TimedCurrent { .. }) => "time_s\tcurrent_a",
        Some(SampleValues::TimedVoltage { .. }) => "time_s\tvoltage_mv",
        Some(SampleValues::Pulse { .. }) => "voltage_mv\tdifference_a\tforward_a\treverse_a",
        None => "",
    }
}

fn summarize_record(record: &RunRecord, live: u64) {
    let scans = record.samples.last().map(|s| s.scan + 1).unwrap_or(0);
    println!();
    println!("Run finished: {}", record.technique);
    println!("  Samples:  {} ({live} streamed live)", record.samples.len());
    println!("  Scans:    {scans}");
    println!("  Commands: {:?}", record.commands);
}

/// Write a run's samples as tab-separated rows, scan index first.
fn export_record(record: &RunRecord, path: &str) -> Result<()> {
    let file = File::create(path).with_context(|| format!("cannot create {path}"))?;
    let mut out = BufWriter::new(file);
    writeln!(out, "# {}", record.technique)?;
    writeln!(out, "# scan\t{}", column_header(record))?;
    for sample in &record.samples {
        let cols: Vec<String> = sample
            .values
            .columns()
            .iter()
            .map(|v| format!("{v:.9e}"))
            .collect();
        writeln!(out, "{}\t{}", sample.scan, cols.join("\t"))?;
    }
    out.flush()?;
    println!("Wrote {} rows to {path}.", record.samples.len());
    Ok(())
}

// ---------------------------------------------------------------------------
// Session plumbing
// ---------------------------------------------------------------------------

async fn open_session(cli: &Cli) -> Result<SessionHandle> {
    let port = cli
        .port
        .as_deref()
        .context("--port is required (only `selftest` runs without hardware)")?;

    let mut builder = DstatBuilder::new().serial_port(port);
    if let Some(baud) = cli.baud {
        builder = builder.baud_rate(baud);
    }

    let session = builder
        .connect()
        .await
        .with_context(|| format!("failed to connect to {port}"))?;
    println!("Connected to {port}.");
    Ok(session)
}

/// Submit one task and wait for its outcome.
async fn run_task(session: &mut SessionHandle, task: CommandTask) -> Result<TaskOutcome> {
    session.submit(task).await?;
    session
        .next_result()
        .await
        .context("session closed before reporting a result")
}

/// Bail unless the task ran to completion.
fn ensure_done(outcome: &TaskOutcome) -> Result<()> {
    if outcome.status == RunStatus::Done {
        return Ok(());
    }
    let detail = outcome
        .error
        .as_ref()
        .map(|e| format!(": {e}"))
        .unwrap_or_default();
    bail!("task ended with status {}{detail}", outcome.status)
}

async fn fetch_version(session: &mut SessionHandle) -> Result<FirmwareVersion> {
    let outcome = run_task(session, CommandTask::VersionCheck).await?;
    ensure_done(&outcome)?;
    match outcome.reply {
        Some(TaskReply::Version(v)) => Ok(v),
        other => bail!("unexpected reply to a version check: {other:?}"),
    }
}

async fn fetch_settings(session: &mut SessionHandle) -> Result<Settings> {
    let outcome = run_task(session, CommandTask::SettingsRead).await?;
    ensure_done(&outcome)?;
    match outcome.reply {
        Some(TaskReply::Settings(s)) => Ok(s),
        other => bail!("unexpected reply to a settings read: {other:?}"),
    }
}

/// Run a measurement, printing samples as they stream in. An elapsed
/// `stop_after` fires an abort, which counts as a clean stop.
async fn stream_run(
    session: &mut SessionHandle,
    request: ExperimentRequest,
    stop_after: Option<Duration>,
    output: Option<&str>,
) -> Result<()> {
    let label = request.kind().label();
    session.submit(CommandTask::Experiment(request)).await?;
    println!("Running {label}...");

    let mut deadline = stop_after.map(|d| Instant::now() + d);
    let mut requested_abort = false;
    let mut live = 0u64;

    // Wait for the run's verdict in short laps, relaying queued samples
    // and watching the stop deadline between waits.
    let tick = Duration::from_millis(100);
    let outcome = loop {
        while let Some(sample) = session.poll_sample() {
            print_sample(&sample);
            live += 1;
        }

        if let Some(dl) = deadline {
            if dl.saturating_duration_since(Instant::now()).is_zero() {
                println!("Duration elapsed; aborting the run.");
                session.abort()?;
                requested_abort = true;
                deadline = None;
            }
        }

        match tokio::time::timeout(tick, session.next_result()).await {
            Ok(Some(outcome)) => break outcome,
            Ok(None) => bail!("session closed before reporting a result"),
            Err(_) => {}
        }
    };

    // Samples decoded after the result won the race are still queued.
    while let Some(sample) = session.poll_sample() {
        print_sample(&sample);
        live += 1;
    }

    let status = outcome.status;
    let detail = outcome
        .error
        .as_ref()
        .map(|e| format!(": {e}"))
        .unwrap_or_default();
    match outcome.reply {
        Some(TaskReply::Run(record)) => {
            summarize_record(&record, live);
            if let Some(path) = output {
                export_record(&record, path)?;
            }
        }
        // A run rejected before the first command produces no record.
        None => {}
        other => bail!("unexpected reply to an experiment: {other:?}"),
    }

    match status {
        RunStatus::Done => Ok(()),
        RunStatus::Aborted if requested_abort => {
            println!("Run stopped by the timed abort.");
            Ok(())
        }
        status => bail!("run ended with status {status}{detail}"),
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_info(session: &mut SessionHandle) -> Result<()> {
    let version = fetch_version(session).await?;
    println!("Firmware:      {version}");
    println!("  RE short:    {}", version.supports_re_short());
    println!("  Gain trim:   {}", version.has_gain_trim());

    let settings = fetch_settings(session).await?;
    println!("EEPROM:        {} entries", settings.len());

    let outcome = run_task(session, CommandTask::LightSensorRead).await?;
    ensure_done(&outcome)?;
    match outcome.reply {
        Some(TaskReply::LightLevel(level)) => println!("Light sensor:  {level:.1}"),
        other => bail!("unexpected reply to a light sensor read: {other:?}"),
    }
    Ok(())
}

async fn cmd_settings_get(session: &mut SessionHandle) -> Result<()> {
    let settings = fetch_settings(session).await?;
    println!("{} EEPROM entries:", settings.len());
    for (key, entry) in settings.iter() {
        println!("  [{:>2}] {key:<12} = {}", entry.ordinal, entry.value);
    }
    Ok(())
}

async fn cmd_settings_set(session: &mut SessionHandle, key: &str, value: &str) -> Result<()> {
    let mut settings = fetch_settings(session).await?;
    let old = settings
        .get(key)
        .map(str::to_owned)
        .with_context(|| format!("the instrument reports no setting named '{key}'"))?;
    settings.set(key, value)?;
    println!("{key}: {old} -> {value}");

    if !confirm("Write EEPROM settings? This survives power cycles. [y/N] ") {
        println!("Not written.");
        return Ok(());
    }
    let outcome = run_task(session, CommandTask::SettingsWrite(settings)).await?;
    ensure_done(&outcome)?;
    println!("Settings written.");
    Ok(())
}

async fn cmd_light(session: &mut SessionHandle) -> Result<()> {
    let outcome = run_task(session, CommandTask::LightSensorRead).await?;
    ensure_done(&outcome)?;
    match outcome.reply {
        Some(TaskReply::LightLevel(level)) => {
            println!("Light sensor: {level:.1}");
            Ok(())
        }
        other => bail!("unexpected reply to a light sensor read: {other:?}"),
    }
}

async fn cmd_calibrate(
    session: &mut SessionHandle,
    time: u16,
    gain_index: u8,
    save: bool,
) -> Result<()> {
    // The gain command depends on the firmware revision, and the trim key
    // lives in the settings table, so read both up front.
    let version = fetch_version(session).await?;
    let settings = fetch_settings(session).await?;

    let params = CalibrationParams::new(time, AdcSettings::default(), gain_index)?;
    println!("Calibrating gain stage {gain_index} over {time} s. Short the cell inputs.");
    let outcome = run_task(session, CommandTask::GainCalibration(params)).await?;
    ensure_done(&outcome)?;
    let offset = match outcome.reply {
        Some(TaskReply::CalibrationOffset(offset)) => offset,
        other => bail!("unexpected reply to a calibration run: {other:?}"),
    };
    println!("Measured offset: {offset} counts");

    if save {
        if !version.has_gain_trim() {
            bail!("firmware {version} has no per-stage trim storage");
        }
        let key = gain::trim_key(gain_index)
            .with_context(|| format!("gain stage {gain_index} has no trim entry"))?;
        let mut updated = settings;
        updated.set(key, offset.to_string())?;

        if !confirm(&format!("Write {key} = {offset} to EEPROM? [y/N] ")) {
            println!("Offset not stored.");
            return Ok(());
        }
        let outcome = run_task(session, CommandTask::SettingsWrite(updated)).await?;
        ensure_done(&outcome)?;
        println!("Trim stored.");
    }
    Ok(())
}

async fn cmd_run(
    session: &mut SessionHandle,
    technique: &Technique,
    output: Option<&str>,
) -> Result<()> {
    // Command encoding needs the firmware version; 1.2+ boards also need
    // the EEPROM trim table before a trimmed gain stage can be resolved.
    let version = fetch_version(session).await?;
    println!("Firmware {version}.");
    if version.has_gain_trim() {
        fetch_settings(session).await?;
    }

    let request = technique_request(technique)?;
    stream_run(session, request, None, output).await
}

fn technique_request(technique: &Technique) -> Result<ExperimentRequest> {
    let (kind, front) = match technique {
        Technique::Cv {
            v1,
            v2,
            start,
            scans,
            slope,
            pretreat,
            front,
        } => (
            ExperimentKind::CyclicVoltammetry(CvParams {
                clean_s: pretreat.clean_s,
                dep_s: pretreat.dep_s,
                clean_mv: pretreat.clean_mv,
                dep_mv: pretreat.dep_mv,
                v1_mv: *v1,
                v2_mv: *v2,
                start_mv: *start,
                scans: *scans,
                slope_mv_s: *slope,
            }),
            front,
        ),
        Technique::Lsv {
            start,
            stop,
            slope,
            pretreat,
            front,
        } => (
            ExperimentKind::LinearSweep(LsvParams {
                clean_s: pretreat.clean_s,
                dep_s: pretreat.dep_s,
                clean_mv: pretreat.clean_mv,
                dep_mv: pretreat.dep_mv,
                start_mv: *start,
                stop_mv: *stop,
                slope_mv_s: *slope,
            }),
            front,
        ),
        Technique::Swv {
            start,
            stop,
            step,
            pulse,
            freq,
            scans,
            pretreat,
            front,
        } => (
            ExperimentKind::SquareWave(SwvParams {
                clean_s: pretreat.clean_s,
                dep_s: pretreat.dep_s,
                clean_mv: pretreat.clean_mv,
                dep_mv: pretreat.dep_mv,
                start_mv: *start,
                stop_mv: *stop,
                step_mv: *step,
                pulse_mv: *pulse,
                freq_hz: *freq,
                scans: *scans,
            }),
            front,
        ),
        Technique::Dpv {
            start,
            stop,
            step,
            pulse,
            period,
            width,
            pretreat,
            front,
        } => (
            ExperimentKind::DifferentialPulse(DpvParams {
                clean_s: pretreat.clean_s,
                dep_s: pretreat.dep_s,
                clean_mv: pretreat.clean_mv,
                dep_mv: pretreat.dep_mv,
                start_mv: *start,
                stop_mv: *stop,
                step_mv: *step,
                pulse_mv: *pulse,
                period_ms: *period,
                width_ms: *width,
            }),
            front,
        ),
        Technique::Ca { steps, front } => {
            let steps: Vec<ChronoampStep> =
                steps.iter().map(|s| parse_step(s)).collect::<Result<_>>()?;
            (
                ExperimentKind::Chronoamperometry(ChronoampParams { steps }),
                front,
            )
        }
        Technique::Pd {
            bias,
            time,
            interlock,
            front,
        } => (
            ExperimentKind::Photodiode(PdParams {
                voltage_mv: *bias,
                time_s: *time,
                interlock: *interlock,
            }),
            front,
        ),
        Technique::Pot { time, front } => (
            ExperimentKind::Potentiometry(PotParams { time_s: *time }),
            front,
        ),
    };

    let request = ExperimentRequest::new(kind, front.adc(), front.gain)
        .context("invalid experiment parameters")?;
    Ok(request.with_re_short(front.re_short))
}

async fn cmd_monitor(
    session: &mut SessionHandle,
    duration: u64,
    output: Option<&str>,
) -> Result<()> {
    println!("Monitoring the open-circuit potential...");
    let stop_after = (duration > 0).then(|| Duration::from_secs(duration));
    stream_run(session, ExperimentRequest::open_circuit(), stop_after, output).await
}

async fn cmd_stress(session: &mut SessionHandle, count: u32) -> Result<()> {
    println!("Stress test: {count} version-check round trips");

    let mut success = 0u32;
    let mut failures = 0u32;
    let start = Instant::now();

    for i in 1..=count {
        match run_task(session, CommandTask::VersionCheck).await {
            Ok(outcome) if outcome.status == RunStatus::Done => success += 1,
            Ok(outcome) => {
                eprintln!("[{i}/{count}] status {}", outcome.status);
                failures += 1;
            }
            Err(e) => {
                eprintln!("[{i}/{count}] {e}");
                failures += 1;
            }
        }
    }

    let elapsed = start.elapsed();
    let rate = if elapsed.as_secs_f64() > 0.0 {
        f64::from(count) / elapsed.as_secs_f64()
    } else {
        0.0
    };

    println!();
    println!("Results:");
    println!("  Round trips:  {count}");
    println!("  Successes:    {success}");
    println!("  Failures:     {failures}");
    println!("  Elapsed:      {:.3} s", elapsed.as_secs_f64());
    println!("  Rate:         {rate:.1} checks/sec");

    if failures > 0 {
        bail!("{failures} out of {count} round trips failed");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    // The selftest drives scripted transports and never opens a port.
    if let Command::Selftest {
        records,
        seed,
        phases,
    } = &cli.command
    {
        let phases = selftest::parse_phases(phases)?;
        return selftest::run_selftest(selftest::SelftestOptions {
            records: *records,
            seed: *seed,
            phases,
        })
        .await;
    }

    let mut session = open_session(&cli).await?;

    let result = match &cli.command {
        Command::Info => cmd_info(&mut session).await,
        Command::Settings { action } => match action {
            SettingsAction::Get => cmd_settings_get(&mut session).await,
            SettingsAction::Set { key, value } => cmd_settings_set(&mut session, key, value).await,
        },
        Command::Light => cmd_light(&mut session).await,
        Command::Calibrate { time, gain, save } => {
            cmd_calibrate(&mut session, *time, *gain, *save).await
        }
        Command::Run { output, technique } => {
            cmd_run(&mut session, technique, output.as_deref()).await
        }
        Command::Monitor { duration, output } => {
            cmd_monitor(&mut session, *duration, output.as_deref()).await
        }
        Command::Stress { count } => cmd_stress(&mut session, *count).await,
        Command::Selftest { .. } => unreachable!("selftest handled above"),
    };

    if let Err(e) = session.disconnect().await {
        eprintln!("Warning: disconnect failed: {e}");
    }
    result
}
