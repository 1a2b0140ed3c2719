// Selftest subcommand -- driver-level validation harness run against
// scripted mock transports. Exercises the wake/probe handshake, the
// housekeeping commands, binary sample streaming, mid-run aborts, and
// session shutdown without an instrument on the bench.

use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;

use potlib::dstat::experiment::{
    AdcSettings, ChronoampParams, ChronoampStep, CvParams, DataClass, ExperimentKind,
    ExperimentRequest,
};
use potlib::dstat::protocol::{decode_mv, encode_mv};
use potlib::dstat::{
    CommandTask, DstatBuilder, SessionHandle, Settings, TaskReply, commands, decode, gain,
};
use potlib::{Error, FirmwareVersion, RunStatus, SampleValues, SessionEvent};
use potlib_test_harness::MockTransport;

// ---------------------------------------------------------------------------
// CLI options (passed from main.rs)
// ---------------------------------------------------------------------------

pub struct SelftestOptions {
    pub records: u32,
    pub seed: u64,
    pub phases: Vec<Phase>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Handshake,
    Housekeeping,
    Streaming,
    Abort,
    Shutdown,
}

const ALL_PHASES: &[Phase] = &[
    Phase::Handshake,
    Phase::Housekeeping,
    Phase::Streaming,
    Phase::Abort,
    Phase::Shutdown,
];

pub fn parse_phases(s: &str) -> Result<Vec<Phase>> {
    if s.eq_ignore_ascii_case("all") {
        return Ok(ALL_PHASES.to_vec());
    }
    let mut phases = Vec::new();
    for part in s.split(',') {
        let p = match part.trim().to_lowercase().as_str() {
            "handshake" => Phase::Handshake,
            "housekeeping" => Phase::Housekeeping,
            "streaming" => Phase::Streaming,
            "abort" => Phase::Abort,
            "shutdown" => Phase::Shutdown,
            other => bail!(
                "unknown phase '{}'. Valid: handshake, housekeeping, streaming, abort, \
                 shutdown, all",
                other
            ),
        };
        phases.push(p);
    }
    Ok(phases)
}

fn phase_label(p: Phase) -> &'static str {
    match p {
        Phase::Handshake => "handshake",
        Phase::Housekeeping => "housekeeping",
        Phase::Streaming => "streaming",
        Phase::Abort => "abort",
        Phase::Shutdown => "shutdown",
    }
}

// ---------------------------------------------------------------------------
// Phase result
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Pass,
    Fail,
}

struct PhaseResult {
    phase: Phase,
    outcome: Outcome,
    detail: String,
}

fn print_results(results: &[PhaseResult]) {
    println!();
    println!("============================================================");
    println!("  Selftest Results");
    println!("============================================================");
    println!();

    for r in results {
        let tag = match r.outcome {
            Outcome::Pass => "[PASS]",
            Outcome::Fail => "[FAIL]",
        };
        println!("{} {}", tag, phase_label(r.phase));
        for line in r.detail.lines() {
            println!("  {}", line);
        }
        println!();
    }

    let pass_count = results.iter().filter(|r| r.outcome == Outcome::Pass).count();
    println!("------------------------------------------------------------");
    println!("  {}/{} phases passed", pass_count, results.len());
    println!("============================================================");
}

// ---------------------------------------------------------------------------
// Script helpers
// ---------------------------------------------------------------------------

/// Mock reads fail fast, so the hardware-sized serial timeouts would only
/// slow the selftest down.
fn test_builder() -> DstatBuilder {
    DstatBuilder::new()
        .read_timeout(Duration::from_millis(25))
        .handshake_retry_delay(Duration::from_millis(20))
}

async fn connect_mock(mock: MockTransport) -> Result<SessionHandle> {
    let session = test_builder()
        .connect_with_transport(Box::new(mock))
        .await?;
    Ok(session)
}

/// Scripted wake + ready probe every session starts with.
fn script_handshake(mock: &mut MockTransport) {
    mock.expect(b"ck", b"");
    mock.expect(b"!", b"C\n");
}

/// Queue one probed command exchange: `!` answered ready, then the
/// command answered with `response`.
fn script_exchange(mock: &mut MockTransport, command: &str, response: &[u8]) {
    mock.expect(b"!", b"C\n");
    mock.expect(command.as_bytes(), response);
}

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

// ---------------------------------------------------------------------------
// Phases
// ---------------------------------------------------------------------------

/// Clean prompt, boot noise before the prompt, and a dead port.
async fn phase_handshake() -> Result<String> {
    let mut mock = MockTransport::new();
    script_handshake(&mut mock);
    let session = connect_mock(mock).await.context("clean handshake failed")?;
    if !session.is_open() {
        bail!("session reports closed right after connecting");
    }
    session.disconnect().await?;

    let mut mock = MockTransport::new();
    mock.expect(b"ck", b"");
    mock.expect(b"!", b"#BOOT junk\n");
    mock.expect(b"!", b"C\n");
    let session = connect_mock(mock)
        .await
        .context("handshake did not survive boot noise")?;
    session.disconnect().await?;

    let mut mock = MockTransport::new();
    mock.expect(b"ck", b"");
    for _ in 0..3 {
        mock.expect(b"!", b"");
    }
    match test_builder()
        .handshake_attempts(3)
        .connect_with_transport(Box::new(mock))
        .await
    {
        Err(Error::HandshakeTimeout(3)) => {}
        Err(other) => bail!("dead port failed with {other} instead of a handshake timeout"),
        Ok(_) => bail!("dead port produced a session"),
    }

    Ok("clean prompt, boot noise, and probe exhaustion all handled".into())
}

/// Version check, settings round trip, and the light sensor.
async fn phase_housekeeping() -> Result<String> {
    let table = "max_time.180:r100_trim.0:r3k_trim.-23:r30k_trim.0:\
                 r300k_trim.0:r3M_trim.0:r30M_trim.0:r100M_trim.0";
    let reference = Settings::parse(table)?;
    let mut edited = reference.clone();
    edited.set("max_time", "300")?;

    let mut mock = MockTransport::new();
    script_handshake(&mut mock);
    script_exchange(&mut mock, "V", b"#INFO: boot ok\nV1.2\nno command recognised\n");
    script_exchange(
        &mut mock,
        "SR",
        format!("S{table}\nno command recognised\n").as_bytes(),
    );
    script_exchange(&mut mock, &commands::cmd_settings_write(&edited), b"");
    script_exchange(&mut mock, "T", b"T658.00\nno command recognised\n");

    let mut session = connect_mock(mock).await?;

    let version = crate::fetch_version(&mut session).await?;
    if version != FirmwareVersion::new(1, 2) {
        bail!("reported firmware {version}, expected 1.2");
    }
    if !version.supports_re_short() || !version.has_gain_trim() {
        bail!("firmware 1.2 capabilities not detected");
    }

    let settings = crate::fetch_settings(&mut session).await?;
    if settings != reference {
        bail!("settings table did not round-trip the scripted payload");
    }
    if settings.get("r3k_trim") != Some("-23") {
        bail!("trim value lost in parsing");
    }

    let mut resend = settings;
    resend.set("max_time", "300")?;
    let outcome = crate::run_task(&mut session, CommandTask::SettingsWrite(resend)).await?;
    crate::ensure_done(&outcome)?;

    let outcome = crate::run_task(&mut session, CommandTask::LightSensorRead).await?;
    crate::ensure_done(&outcome)?;
    match outcome.reply {
        Some(TaskReply::LightLevel(level)) if (level - 658.0).abs() < 1e-9 => {}
        other => bail!("light sensor reply was {other:?}"),
    }

    session.disconnect().await?;
    Ok("version 1.2, settings edit written back in slot order, light level 658".into())
}

/// A two-scan CV with randomised records: every sample must come back
/// decoded, scan-tagged, and archived.
async fn phase_streaming(opts: &SelftestOptions) -> Result<String> {
    let records = opts.records.clamp(2, 4096) as usize;
    let mut rng = StdRng::seed_from_u64(opts.seed);

    let version = FirmwareVersion::new(1, 1);
    let gain_index = 2;
    let gain = gain::resolve_gain(version, None, gain_index)?;
    let request = ExperimentRequest::new(
        ExperimentKind::CyclicVoltammetry(CvParams {
            clean_s: 0,
            dep_s: 0,
            clean_mv: 0.0,
            dep_mv: 0.0,
            v1_mv: -400.0,
            v2_mv: 400.0,
            start_mv: 0.0,
            scans: 2,
            slope_mv_s: 1000,
        }),
        AdcSettings::default(),
        gain_index,
    )?;

    let mut mock = MockTransport::new();
    script_handshake(&mut mock);
    script_exchange(&mut mock, "V", b"V1.1\nno command recognised\n");
    script_exchange(
        &mut mock,
        &commands::cmd_adc_setup(0, 3, 1),
        b"no command recognised\n",
    );
    script_exchange(
        &mut mock,
        &commands::cmd_gain(version, gain_index, false),
        b"no command recognised\n",
    );

    let first_scan = records / 2;
    let mut expected = Vec::with_capacity(records);
    let mut stream = Vec::new();
    for i in 0..records {
        if i == first_scan {
            stream.extend_from_slice(b"S\n");
        }
        let code = encode_mv(rng.gen_range(-400.0..=400.0));
        let counts: i32 = rng.gen_range(-8_388_607..=8_388_607);
        stream.extend_from_slice(b"B\n");
        stream.extend_from_slice(&record6(code, counts));
        expected.push((u32::from(i >= first_scan), decode_mv(code), counts));
    }
    stream.extend_from_slice(b"S\nno command recognised\n");
    script_exchange(
        &mut mock,
        &commands::cmd_cv(0, 0, 0.0, 0.0, -400.0, 400.0, 0.0, 2, 1000),
        &stream,
    );

    let mut session = connect_mock(mock).await?;
    crate::fetch_version(&mut session).await?;

    let outcome = crate::run_task(&mut session, CommandTask::Experiment(request)).await?;
    crate::ensure_done(&outcome)?;
    let mut live = 0usize;
    while session.poll_sample().is_some() {
        live += 1;
    }

    let record = match outcome.reply {
        Some(TaskReply::Run(record)) => record,
        other => bail!("experiment reply was {other:?}"),
    };
    if record.data_class != DataClass::MultiScan {
        bail!("CV was not classed as multi-scan");
    }
    if record.samples.len() != records || live != records {
        bail!(
            "sent {records} records, archived {}, streamed {live}",
            record.samples.len()
        );
    }
    for (i, (sample, (scan, mv, counts))) in record.samples.iter().zip(&expected).enumerate() {
        if sample.scan != *scan {
            bail!("record {i}: scan tag {} != {scan}", sample.scan);
        }
        match sample.values {
            SampleValues::Sweep {
                voltage_mv,
                current_a,
            } => {
                let want = decode::current_amps(*counts, &gain);
                if (voltage_mv - mv).abs() > 1e-9 {
                    bail!("record {i}: potential {voltage_mv} mV != {mv} mV");
                }
                if (current_a - want).abs() > want.abs().max(1e-15) * 1e-9 {
                    bail!("record {i}: current {current_a} A != {want} A");
                }
            }
            other => bail!("record {i}: expected sweep values, got {other:?}"),
        }
    }

    session.disconnect().await?;
    Ok(format!(
        "{records} randomised records over 2 scans decoded, tagged, and archived"
    ))
}

/// Abort a run that has gone quiet; its partial data survives and the
/// session stays usable.
async fn phase_abort() -> Result<String> {
    let version = FirmwareVersion::new(1, 1);
    let request = ExperimentRequest::new(
        ExperimentKind::Chronoamperometry(ChronoampParams {
            steps: vec![ChronoampStep {
                potential_mv: 100.0,
                duration_s: 5,
            }],
        }),
        AdcSettings::default(),
        2,
    )?;

    let mut mock = MockTransport::new();
    script_handshake(&mut mock);
    script_exchange(&mut mock, "V", b"V1.1\nno command recognised\n");
    script_exchange(
        &mut mock,
        &commands::cmd_adc_setup(0, 3, 1),
        b"no command recognised\n",
    );
    script_exchange(
        &mut mock,
        &commands::cmd_gain(version, 2, false),
        b"no command recognised\n",
    );
    // One record arrives, then the stream goes quiet until we abort.
    let mut stream = b"B\n".to_vec();
    stream.extend_from_slice(&record8(0, 100, 4000));
    script_exchange(
        &mut mock,
        &commands::cmd_chronoamp(&[100.0], &[5]),
        &stream,
    );
    mock.expect(b"a", b"");
    script_exchange(&mut mock, "V", b"V1.1\nno command recognised\n");

    let mut session = connect_mock(mock).await?;
    crate::fetch_version(&mut session).await?;

    session.submit(CommandTask::Experiment(request)).await?;
    let first = session
        .next_sample()
        .await
        .context("no sample before the stream went quiet")?;
    if !matches!(first.values, SampleValues::TimedCurrent { .. }) {
        bail!("chronoamperometry sample decoded as {:?}", first.values);
    }

    session.abort()?;
    let outcome = session
        .next_result()
        .await
        .context("session closed during the abort")?;
    if outcome.status != RunStatus::Aborted {
        bail!("aborted run reported {}", outcome.status);
    }
    match outcome.reply {
        Some(TaskReply::Run(record)) if record.samples.len() == 1 => {}
        other => bail!("aborted run kept the wrong data: {other:?}"),
    }

    // The wire is resynchronised; the next task must work.
    crate::fetch_version(&mut session).await?;
    session.disconnect().await?;
    Ok("abort byte sent, one-sample partial record kept, session reusable".into())
}

/// Lifecycle events across an orderly disconnect and a dropped handle.
async fn phase_shutdown() -> Result<String> {
    let mut mock = MockTransport::new();
    script_handshake(&mut mock);
    script_exchange(&mut mock, "V", b"V1.1\nno command recognised\n");

    let mut session = connect_mock(mock).await?;
    let mut events = session.subscribe();
    crate::fetch_version(&mut session).await?;
    session.disconnect().await?;

    let mut saw_started = false;
    let mut saw_done = false;
    let mut saw_disconnected = false;
    while let Ok(event) = events.recv().await {
        match event {
            SessionEvent::TaskStarted => saw_started = true,
            SessionEvent::TaskFinished {
                status: RunStatus::Done,
            } => saw_done = true,
            SessionEvent::Disconnected => saw_disconnected = true,
            _ => {}
        }
    }
    if !saw_started || !saw_done || !saw_disconnected {
        bail!(
            "event stream incomplete: started={saw_started} finished={saw_done} \
             disconnected={saw_disconnected}"
        );
    }

    // Dropping the handle must also stop the worker.
    let mut mock = MockTransport::new();
    script_handshake(&mut mock);
    let session = connect_mock(mock).await?;
    let mut events = session.subscribe();
    drop(session);
    loop {
        match events.recv().await {
            Ok(SessionEvent::Disconnected) => break,
            Ok(_) => continue,
            Err(e) => bail!("event stream closed without Disconnected: {e}"),
        }
    }

    Ok("disconnect and dropped-handle shutdowns both observed via events".into())
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

pub async fn run_selftest(opts: SelftestOptions) -> Result<()> {
    println!(
        "Driver selftest: {} phase(s), seed {}",
        opts.phases.len(),
        opts.seed
    );

    let mut results = Vec::new();
    for &phase in &opts.phases {
        println!();
        println!("--- phase: {} ---", phase_label(phase));
        let start = Instant::now();
        let outcome = match phase {
            Phase::Handshake => phase_handshake().await,
            Phase::Housekeeping => phase_housekeeping().await,
            Phase::Streaming => phase_streaming(&opts).await,
            Phase::Abort => phase_abort().await,
            Phase::Shutdown => phase_shutdown().await,
        };
        let elapsed = start.elapsed();
        match outcome {
            Ok(detail) => results.push(PhaseResult {
                phase,
                outcome: Outcome::Pass,
                detail: format!("{detail}\nelapsed: {:.1} ms", elapsed.as_secs_f64() * 1000.0),
            }),
            Err(e) => results.push(PhaseResult {
                phase,
                outcome: Outcome::Fail,
                detail: format!("{e:#}"),
            }),
        }
    }

    print_results(&results);
    let failures = results.iter().filter(|r| r.outcome == Outcome::Fail).count();
    if failures > 0 {
        bail!("{failures} selftest phase(s) failed");
    }
    Ok(())
}
