//! Connection session: owns the serial link and executes command tasks.
//!
//! A session is a spawned worker that owns the transport exclusively.
//! Consumers talk to it over three channels, mirroring the split the
//! instrument protocol is built around:
//!
//! - a task channel carrying [`CommandTask`]s in, answered by exactly one
//!   [`TaskOutcome`] per task on the result channel;
//! - a control channel for abort/disconnect signals, polled between
//!   bounded reads so a running measurement can always be interrupted;
//! - an unbounded data channel streaming decoded [`Sample`]s live while a
//!   measurement runs.
//!
//! The worker moves through connecting (wake + ready probing), idle
//! (waiting for a task), busy (one task on the wire), and closed. Tasks
//! run strictly one at a time; nothing else touches the port while one is
//! in flight.

use std::time::{Duration, Instant, SystemTime};

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use potlib_core::error::{Error, Result};
use potlib_core::events::SessionEvent;
use potlib_core::transport::Transport;
use potlib_core::types::{FirmwareVersion, RunStatus, Sample};

use crate::commands;
use crate::decode::{self, RecordLayout, SampleDecoder};
use crate::experiment::{
    calibration_mean, CalibrationParams, DataClass, ExperimentRequest,
};
use crate::protocol::{
    classify_line, ResponseLine, WireReader, ABORT_COMMAND, DEFAULT_READ_TIMEOUT,
    HANDSHAKE_ATTEMPTS, HANDSHAKE_RETRY_DELAY, READY_PROBE, WAKE_SEQUENCE,
};
use crate::settings::Settings;

/// Depth of the task and result queues. One task runs at a time; a small
/// queue lets a consumer stage work while the current task drains.
const TASK_QUEUE_DEPTH: usize = 4;

/// Depth of the control-signal queue.
const CONTROL_QUEUE_DEPTH: usize = 8;

/// Fanout capacity of the event channel.
const EVENT_QUEUE_DEPTH: usize = 32;

/// The ready prompt answers a probe promptly when the instrument is idle;
/// give up after this many empty read periods.
const READY_WAIT_ATTEMPTS: u32 = 30;

/// Work submitted to a session.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandTask {
    /// Query the firmware version.
    VersionCheck,
    /// Read the EEPROM settings.
    SettingsRead,
    /// Write EEPROM settings back.
    SettingsWrite(Settings),
    /// Read the ambient light sensor.
    LightSensorRead,
    /// Measure the ADC offset for a gain stage.
    GainCalibration(CalibrationParams),
    /// Run a measurement technique.
    Experiment(ExperimentRequest),
}

/// Ancillary value carried back with a completed task.
#[derive(Debug, Clone)]
pub enum TaskReply {
    /// Firmware version reported by the instrument.
    Version(FirmwareVersion),
    /// EEPROM settings as read.
    Settings(Settings),
    /// Light-sensor reading.
    LightLevel(f64),
    /// Measured ADC offset in raw counts.
    CalibrationOffset(i16),
    /// Everything recorded during a measurement run.
    Run(RunRecord),
}

/// Archive of one measurement run.
///
/// Returned with the run's [`TaskOutcome`] whatever the terminal status;
/// an aborted or failed run still carries the samples gathered up to that
/// point.
#[derive(Debug, Clone)]
pub struct RunRecord {
    /// Technique label, e.g. `"cyclic voltammetry"`.
    pub technique: &'static str,
    /// How the samples are organised.
    pub data_class: DataClass,
    /// The exact command strings sent, in order.
    pub commands: Vec<String>,
    /// Every sample decoded during the run, in arrival order.
    pub samples: Vec<Sample>,
    /// When the run reached its terminal status.
    pub completed_at: SystemTime,
}

/// Terminal report for one task. Exactly one is delivered per submission.
#[derive(Debug)]
pub struct TaskOutcome {
    /// How the task ended.
    pub status: RunStatus,
    /// Ancillary value produced by the task, if any.
    pub reply: Option<TaskReply>,
    /// The failure behind a [`RunStatus::SerialError`]. Protocol
    /// violations and transport faults arrive as their distinct
    /// [`Error`] variants here.
    pub error: Option<Error>,
}

impl TaskOutcome {
    fn done(reply: Option<TaskReply>) -> Self {
        TaskOutcome {
            status: RunStatus::Done,
            reply,
            error: None,
        }
    }

    fn failed(error: Error) -> Self {
        TaskOutcome {
            status: RunStatus::SerialError,
            reply: None,
            error: Some(error),
        }
    }

    fn interrupted(interrupt: Interrupt) -> Self {
        TaskOutcome {
            status: interrupt.status(),
            reply: None,
            error: None,
        }
    }
}

/// Out-of-band signal to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlSignal {
    Abort,
    Disconnect,
}

/// An interrupt observed while a task held the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    Abort,
    Disconnect,
}

impl Interrupt {
    fn status(self) -> RunStatus {
        match self {
            Interrupt::Abort => RunStatus::Aborted,
            Interrupt::Disconnect => RunStatus::Disconnected,
        }
    }
}

/// Tuning knobs for a session worker.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Per-read timeout on the serial port.
    pub read_timeout: Duration,
    /// Ready probes sent while connecting before giving up.
    pub handshake_attempts: u32,
    /// Pause between connection-handshake probes.
    pub handshake_retry_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            read_timeout: DEFAULT_READ_TIMEOUT,
            handshake_attempts: HANDSHAKE_ATTEMPTS,
            handshake_retry_delay: HANDSHAKE_RETRY_DELAY,
        }
    }
}

/// Consumer-side handle to a running session.
///
/// Dropping the handle closes the task channel; the worker notices,
/// closes the port and exits on its own.
#[derive(Debug)]
pub struct SessionHandle {
    task_tx: mpsc::Sender<CommandTask>,
    ctrl_tx: mpsc::Sender<ControlSignal>,
    result_rx: mpsc::Receiver<TaskOutcome>,
    data_rx: mpsc::UnboundedReceiver<Sample>,
    events: broadcast::Sender<SessionEvent>,
    worker: JoinHandle<()>,
}

impl SessionHandle {
    /// Queue a task. Tasks execute strictly in submission order.
    pub async fn submit(&self, task: CommandTask) -> Result<()> {
        self.task_tx
            .send(task)
            .await
            .map_err(|_| Error::NotConnected)
    }

    /// Take the next completed-task report, if one is waiting.
    pub fn poll_result(&mut self) -> Option<TaskOutcome> {
        self.result_rx.try_recv().ok()
    }

    /// Wait for the next completed-task report. `None` once the session
    /// has shut down.
    pub async fn next_result(&mut self) -> Option<TaskOutcome> {
        self.result_rx.recv().await
    }

    /// Take the next live sample, if one is waiting.
    pub fn poll_sample(&mut self) -> Option<Sample> {
        self.data_rx.try_recv().ok()
    }

    /// Wait for the next live sample. `None` once the session has shut
    /// down.
    pub async fn next_sample(&mut self) -> Option<Sample> {
        self.data_rx.recv().await
    }

    /// Ask the running task to stop. Harmless while idle: a stale abort
    /// is discarded before the next task is dispatched.
    pub fn abort(&self) -> Result<()> {
        match self.ctrl_tx.try_send(ControlSignal::Abort) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::NotConnected),
        }
    }

    /// Shut the session down: interrupt anything running, close the port,
    /// and wait for the worker to exit.
    pub async fn disconnect(self) -> Result<()> {
        let SessionHandle {
            ctrl_tx, worker, ..
        } = self;
        let _ = ctrl_tx.send(ControlSignal::Disconnect).await;
        drop(ctrl_tx);
        worker
            .await
            .map_err(|e| Error::Transport(format!("session worker panicked: {e}")))
    }

    /// Subscribe to session lifecycle events.
    ///
    /// Broadcast semantics: a subscriber only sees events emitted after
    /// it subscribed, so the initial connection event is typically gone
    /// by the time a handle is returned.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Whether the worker is still alive.
    pub fn is_open(&self) -> bool {
        !self.worker.is_finished()
    }
}

/// Everything the worker holds besides the transport.
struct WorkerLinks {
    ready: Option<oneshot::Sender<Result<()>>>,
    tasks: mpsc::Receiver<CommandTask>,
    control: mpsc::Receiver<ControlSignal>,
    results: mpsc::Sender<TaskOutcome>,
    data: mpsc::UnboundedSender<Sample>,
    events: broadcast::Sender<SessionEvent>,
}

/// Instrument identity gathered by housekeeping tasks. Gain resolution
/// for measurements draws on this instead of global state.
#[derive(Debug, Default)]
struct SessionState {
    version: Option<FirmwareVersion>,
    settings: Option<Settings>,
}

/// Spawn a session worker over an already-open transport.
///
/// The connection handshake runs before this returns: a handle is only
/// handed out once the instrument has answered the ready probe.
pub(crate) async fn start_session(
    transport: Box<dyn Transport>,
    config: SessionConfig,
) -> Result<SessionHandle> {
    let (task_tx, task_rx) = mpsc::channel(TASK_QUEUE_DEPTH);
    let (ctrl_tx, ctrl_rx) = mpsc::channel(CONTROL_QUEUE_DEPTH);
    let (result_tx, result_rx) = mpsc::channel(TASK_QUEUE_DEPTH);
    let (data_tx, data_rx) = mpsc::unbounded_channel();
    let (events, _) = broadcast::channel(EVENT_QUEUE_DEPTH);
    let (ready_tx, ready_rx) = oneshot::channel();

    let links = WorkerLinks {
        ready: Some(ready_tx),
        tasks: task_rx,
        control: ctrl_rx,
        results: result_tx,
        data: data_tx,
        events: events.clone(),
    };
    let worker = tokio::spawn(session_worker(transport, config, links));

    match ready_rx.await {
        Ok(Ok(())) => Ok(SessionHandle {
            task_tx,
            ctrl_tx,
            result_rx,
            data_rx,
            events,
            worker,
        }),
        Ok(Err(e)) => {
            let _ = worker.await;
            Err(e)
        }
        Err(_) => {
            let _ = worker.await;
            Err(Error::Transport(
                "session worker exited during handshake".into(),
            ))
        }
    }
}

async fn session_worker(
    mut transport: Box<dyn Transport>,
    config: SessionConfig,
    mut links: WorkerLinks,
) {
    let mut reader = WireReader::new();

    let ready = links.ready.take();
    match handshake(transport.as_mut(), &mut reader, &config).await {
        Ok(()) => {
            info!("instrument handshake complete");
            if let Some(tx) = ready {
                let _ = tx.send(Ok(()));
            }
            let _ = links.events.send(SessionEvent::Connected);
        }
        Err(e) => {
            warn!(error = %e, "instrument handshake failed");
            let _ = transport.close().await;
            if let Some(tx) = ready {
                let _ = tx.send(Err(e));
            }
            return;
        }
    }

    let mut state = SessionState::default();

    loop {
        tokio::select! {
            biased;

            signal = links.control.recv() => match signal {
                Some(ControlSignal::Disconnect) | None => break,
                Some(ControlSignal::Abort) => {
                    trace!("abort signal while idle; nothing to stop");
                }
            },

            task = links.tasks.recv() => match task {
                Some(task) => {
                    // Signals queued against a previous run are stale by
                    // now: aborts are dropped, a disconnect is honoured.
                    let mut disconnect = false;
                    while let Ok(signal) = links.control.try_recv() {
                        if signal == ControlSignal::Disconnect {
                            disconnect = true;
                        }
                    }
                    if disconnect {
                        break;
                    }

                    let _ = links.events.send(SessionEvent::TaskStarted);
                    let outcome = run_task(
                        task,
                        transport.as_mut(),
                        &mut reader,
                        &mut state,
                        &config,
                        &mut links.control,
                        &links.data,
                    )
                    .await;
                    let status = outcome.status;
                    let _ = links.events.send(SessionEvent::TaskFinished { status });
                    let _ = links.results.send(outcome).await;
                    if status == RunStatus::Disconnected {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    let _ = transport.close().await;
    let _ = links.events.send(SessionEvent::Disconnected);
    debug!("session worker exited");
}

/// Wake the instrument and probe until it answers ready.
async fn handshake(
    transport: &mut dyn Transport,
    reader: &mut WireReader,
    config: &SessionConfig,
) -> Result<()> {
    transport.send(WAKE_SEQUENCE).await?;
    reader.flush_input(transport).await?;

    for attempt in 1..=config.handshake_attempts {
        transport.send(&[READY_PROBE]).await?;
        let deadline = Instant::now() + config.handshake_retry_delay;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match reader.read_line(transport, remaining).await? {
                Some(line) if matches!(classify_line(&line), ResponseLine::Ready) => {
                    debug!(attempt, "instrument answered ready");
                    return Ok(());
                }
                Some(line) => {
                    trace!(
                        line = %String::from_utf8_lossy(&line),
                        "discarding pre-handshake output"
                    );
                }
                None => break,
            }
        }
    }
    Err(Error::HandshakeTimeout(config.handshake_attempts))
}

fn poll_control(control: &mut mpsc::Receiver<ControlSignal>) -> Option<Interrupt> {
    match control.try_recv() {
        Ok(ControlSignal::Abort) => Some(Interrupt::Abort),
        Ok(ControlSignal::Disconnect) => Some(Interrupt::Disconnect),
        // All handles gone: treat like a disconnect request.
        Err(mpsc::error::TryRecvError::Disconnected) => Some(Interrupt::Disconnect),
        Err(mpsc::error::TryRecvError::Empty) => None,
    }
}

fn line_prefix(line: &[u8]) -> Option<u8> {
    line.iter().copied().find(|b| !b.is_ascii_whitespace())
}

enum SendOutcome {
    Sent,
    Interrupted(Interrupt),
}

/// Per-command handshake: probe, wait for the ready prompt, then write
/// the full command string.
async fn send_command(
    transport: &mut dyn Transport,
    reader: &mut WireReader,
    config: &SessionConfig,
    control: &mut mpsc::Receiver<ControlSignal>,
    command: &str,
) -> Result<SendOutcome> {
    transport.send(&[READY_PROBE]).await?;
    for _ in 0..READY_WAIT_ATTEMPTS {
        if let Some(interrupt) = poll_control(control) {
            return Ok(SendOutcome::Interrupted(interrupt));
        }
        match reader.read_line(transport, config.read_timeout).await? {
            Some(line) => {
                if matches!(classify_line(&line), ResponseLine::Ready) {
                    transport.send(command.as_bytes()).await?;
                    debug!(command, "command sent");
                    return Ok(SendOutcome::Sent);
                }
                trace!(
                    line = %String::from_utf8_lossy(&line),
                    "discarding while waiting for the ready prompt"
                );
            }
            None => {}
        }
    }
    Err(Error::Timeout)
}

enum QueryOutcome {
    Payload(Vec<u8>),
    Interrupted(Interrupt),
}

/// Run a housekeeping query, capturing the payload line with the given
/// prefix byte out of the response stream.
async fn run_query(
    transport: &mut dyn Transport,
    reader: &mut WireReader,
    config: &SessionConfig,
    control: &mut mpsc::Receiver<ControlSignal>,
    command: &str,
    payload_prefix: u8,
) -> Result<QueryOutcome> {
    match send_command(transport, reader, config, control, command).await? {
        SendOutcome::Sent => {}
        SendOutcome::Interrupted(i) => return Ok(QueryOutcome::Interrupted(i)),
    }

    let mut payload: Option<Vec<u8>> = None;
    for _ in 0..READY_WAIT_ATTEMPTS {
        if let Some(interrupt) = poll_control(control) {
            return Ok(QueryOutcome::Interrupted(interrupt));
        }
        match reader.read_line(transport, config.read_timeout).await? {
            None => {}
            Some(line) => {
                // The payload prefix is checked before classification:
                // a settings line starts with `S`, which is also the
                // scan-boundary marker.
                if line_prefix(&line) == Some(payload_prefix) {
                    payload = Some(line);
                    continue;
                }
                match classify_line(&line) {
                    ResponseLine::Done => {
                        reader.flush_input(transport).await?;
                        return match payload {
                            Some(p) => Ok(QueryOutcome::Payload(p)),
                            None => Err(Error::Protocol(format!(
                                "no '{}' line before end of output",
                                payload_prefix as char
                            ))),
                        };
                    }
                    ResponseLine::Log(text) => debug!(line = %text, "instrument log"),
                    _ => trace!("ignoring line while waiting for query payload"),
                }
            }
        }
    }
    Err(Error::Timeout)
}

/// Where decoded records go during a streaming command.
enum RecordSink<'a> {
    /// Decode to physical units, stream live, and archive.
    Samples {
        decoder: &'a SampleDecoder,
        scan: u32,
        samples: &'a mut Vec<Sample>,
        data: &'a mpsc::UnboundedSender<Sample>,
    },
    /// Keep raw ADC counts (gain calibration).
    RawCounts { counts: &'a mut Vec<i32> },
}

impl RecordSink<'_> {
    fn width(&self) -> usize {
        match self {
            RecordSink::Samples { decoder, .. } => decoder.layout().width(),
            RecordSink::RawCounts { .. } => RecordLayout::TimeCurrent.width(),
        }
    }

    fn next_scan(&mut self) {
        if let RecordSink::Samples { scan, .. } = self {
            *scan += 1;
        }
    }

    fn consume(&mut self, raw: &[u8]) -> Result<()> {
        match self {
            RecordSink::Samples {
                decoder,
                scan,
                samples,
                data,
            } => {
                let sample = decoder.decode(*scan, raw)?;
                // The live stream is best-effort; the archive is not.
                let _ = data.send(sample);
                samples.push(sample);
            }
            RecordSink::RawCounts { counts } => {
                let (_, _, reading) = decode::unpack_time_reading(raw)?;
                counts.push(reading);
            }
        }
        Ok(())
    }
}

enum StreamEnd {
    Completed,
    Interrupted(Interrupt),
}

/// Drain one command's output stream: records into the sink, scan
/// boundaries counted, diagnostics logged, until the end-of-output line.
///
/// Unbounded on purpose: cleaning and deposition phases produce nothing
/// for minutes at a time. The control channel is polled between reads,
/// and an interrupt puts the abort byte on the wire before returning.
async fn stream_output(
    transport: &mut dyn Transport,
    reader: &mut WireReader,
    config: &SessionConfig,
    control: &mut mpsc::Receiver<ControlSignal>,
    sink: &mut RecordSink<'_>,
) -> Result<StreamEnd> {
    loop {
        if let Some(interrupt) = poll_control(control) {
            transport.send(&[ABORT_COMMAND]).await?;
            reader.flush_input(transport).await?;
            return Ok(StreamEnd::Interrupted(interrupt));
        }
        match reader.read_line(transport, config.read_timeout).await? {
            None => {}
            Some(line) => match classify_line(&line) {
                ResponseLine::Record => {
                    let raw = reader
                        .read_exact(transport, sink.width(), config.read_timeout)
                        .await?;
                    sink.consume(&raw)?;
                }
                ResponseLine::ScanBoundary => sink.next_scan(),
                ResponseLine::Log(text) => debug!(line = %text, "instrument log"),
                ResponseLine::Done => {
                    reader.flush_input(transport).await?;
                    return Ok(StreamEnd::Completed);
                }
                ResponseLine::Ready | ResponseLine::Other(_) => {
                    trace!("ignoring unexpected line during run");
                }
            },
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_task(
    task: CommandTask,
    transport: &mut dyn Transport,
    reader: &mut WireReader,
    state: &mut SessionState,
    config: &SessionConfig,
    control: &mut mpsc::Receiver<ControlSignal>,
    data: &mpsc::UnboundedSender<Sample>,
) -> TaskOutcome {
    match task {
        CommandTask::VersionCheck => {
            run_version_check(transport, reader, config, control, state).await
        }
        CommandTask::SettingsRead => {
            run_settings_read(transport, reader, config, control, state).await
        }
        CommandTask::SettingsWrite(settings) => {
            run_settings_write(transport, reader, config, control, state, settings).await
        }
        CommandTask::LightSensorRead => {
            run_light_sensor(transport, reader, config, control).await
        }
        CommandTask::GainCalibration(params) => {
            run_calibration(transport, reader, config, control, state, params).await
        }
        CommandTask::Experiment(request) => {
            run_experiment(transport, reader, config, control, state, data, request).await
        }
    }
}

async fn run_version_check(
    transport: &mut dyn Transport,
    reader: &mut WireReader,
    config: &SessionConfig,
    control: &mut mpsc::Receiver<ControlSignal>,
    state: &mut SessionState,
) -> TaskOutcome {
    match run_query(transport, reader, config, control, &commands::cmd_version(), b'V').await
    {
        Ok(QueryOutcome::Payload(line)) => match commands::parse_version_response(&line) {
            Ok(version) => {
                info!(%version, "firmware version");
                state.version = Some(version);
                TaskOutcome::done(Some(TaskReply::Version(version)))
            }
            Err(e) => TaskOutcome::failed(e),
        },
        Ok(QueryOutcome::Interrupted(i)) => TaskOutcome::interrupted(i),
        Err(e) => TaskOutcome::failed(e),
    }
}

async fn run_settings_read(
    transport: &mut dyn Transport,
    reader: &mut WireReader,
    config: &SessionConfig,
    control: &mut mpsc::Receiver<ControlSignal>,
    state: &mut SessionState,
) -> TaskOutcome {
    match run_query(
        transport,
        reader,
        config,
        control,
        &commands::cmd_settings_read(),
        b'S',
    )
    .await
    {
        Ok(QueryOutcome::Payload(line)) => match commands::parse_settings_response(&line) {
            Ok(settings) => {
                debug!(entries = settings.len(), "settings read");
                state.settings = Some(settings.clone());
                TaskOutcome::done(Some(TaskReply::Settings(settings)))
            }
            Err(e) => TaskOutcome::failed(e),
        },
        Ok(QueryOutcome::Interrupted(i)) => TaskOutcome::interrupted(i),
        Err(e) => TaskOutcome::failed(e),
    }
}

async fn run_settings_write(
    transport: &mut dyn Transport,
    reader: &mut WireReader,
    config: &SessionConfig,
    control: &mut mpsc::Receiver<ControlSignal>,
    state: &mut SessionState,
    settings: Settings,
) -> TaskOutcome {
    // The firmware does not acknowledge a settings write; the next
    // command's ready probe resynchronises the stream.
    let command = commands::cmd_settings_write(&settings);
    match send_command(transport, reader, config, control, &command).await {
        Ok(SendOutcome::Sent) => {
            debug!(entries = settings.len(), "settings written");
            state.settings = Some(settings);
            TaskOutcome::done(None)
        }
        Ok(SendOutcome::Interrupted(i)) => TaskOutcome::interrupted(i),
        Err(e) => TaskOutcome::failed(e),
    }
}

async fn run_light_sensor(
    transport: &mut dyn Transport,
    reader: &mut WireReader,
    config: &SessionConfig,
    control: &mut mpsc::Receiver<ControlSignal>,
) -> TaskOutcome {
    match run_query(
        transport,
        reader,
        config,
        control,
        &commands::cmd_light_sensor(),
        b'T',
    )
    .await
    {
        Ok(QueryOutcome::Payload(line)) => {
            match commands::parse_light_sensor_response(&line) {
                Ok(level) => TaskOutcome::done(Some(TaskReply::LightLevel(level))),
                Err(e) => TaskOutcome::failed(e),
            }
        }
        Ok(QueryOutcome::Interrupted(i)) => TaskOutcome::interrupted(i),
        Err(e) => TaskOutcome::failed(e),
    }
}

async fn run_calibration(
    transport: &mut dyn Transport,
    reader: &mut WireReader,
    config: &SessionConfig,
    control: &mut mpsc::Receiver<ControlSignal>,
    state: &mut SessionState,
    params: CalibrationParams,
) -> TaskOutcome {
    let cmds = match params.prepare(state.version) {
        Ok(cmds) => cmds,
        Err(e) => return TaskOutcome::failed(e),
    };
    info!(
        gain = params.gain_index(),
        time_s = params.time_s(),
        "starting gain calibration"
    );

    let mut counts = Vec::new();
    for command in &cmds {
        match send_command(transport, reader, config, control, command).await {
            Ok(SendOutcome::Sent) => {}
            Ok(SendOutcome::Interrupted(i)) => return TaskOutcome::interrupted(i),
            Err(e) => return TaskOutcome::failed(e),
        }
        let mut sink = RecordSink::RawCounts {
            counts: &mut counts,
        };
        match stream_output(transport, reader, config, control, &mut sink).await {
            Ok(StreamEnd::Completed) => {}
            Ok(StreamEnd::Interrupted(i)) => return TaskOutcome::interrupted(i),
            Err(e) => return TaskOutcome::failed(e),
        }
    }

    match calibration_mean(&counts) {
        Ok(offset) => {
            info!(offset, readings = counts.len(), "gain calibration finished");
            TaskOutcome::done(Some(TaskReply::CalibrationOffset(offset)))
        }
        Err(e) => TaskOutcome::failed(e),
    }
}

async fn run_experiment(
    transport: &mut dyn Transport,
    reader: &mut WireReader,
    config: &SessionConfig,
    control: &mut mpsc::Receiver<ControlSignal>,
    state: &mut SessionState,
    data: &mpsc::UnboundedSender<Sample>,
    request: ExperimentRequest,
) -> TaskOutcome {
    let prepared = match request.prepare(state.version, state.settings.as_ref()) {
        Ok(p) => p,
        Err(e) => return TaskOutcome::failed(e),
    };
    info!(technique = prepared.label, "starting run");

    let mut samples = Vec::new();
    let mut status = RunStatus::Done;
    let mut error = None;

    for command in &prepared.commands {
        match send_command(transport, reader, config, control, command).await {
            Ok(SendOutcome::Sent) => {}
            Ok(SendOutcome::Interrupted(i)) => {
                status = i.status();
                break;
            }
            Err(e) => {
                status = RunStatus::SerialError;
                error = Some(e);
                break;
            }
        }
        let mut sink = RecordSink::Samples {
            decoder: &prepared.decoder,
            scan: 0,
            samples: &mut samples,
            data,
        };
        match stream_output(transport, reader, config, control, &mut sink).await {
            Ok(StreamEnd::Completed) => {}
            Ok(StreamEnd::Interrupted(i)) => {
                status = i.status();
                break;
            }
            Err(e) => {
                status = RunStatus::SerialError;
                error = Some(e);
                break;
            }
        }
    }

    let record = RunRecord {
        technique: prepared.label,
        data_class: prepared.data_class,
        commands: prepared.commands,
        samples,
        completed_at: SystemTime::now(),
    };
    info!(
        technique = record.technique,
        samples = record.samples.len(),
        status = %status,
        "run finished"
    );
    TaskOutcome {
        status,
        reply: Some(TaskReply::Run(record)),
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::{
        AdcSettings, ChronoampParams, ChronoampStep, CvParams, ExperimentKind,
    };
    use potlib_core::types::SampleValues;
    use potlib_test_harness::MockTransport;

    fn test_config() -> SessionConfig {
        SessionConfig {
            read_timeout: Duration::from_millis(25),
            handshake_attempts: 10,
            handshake_retry_delay: Duration::from_millis(2),
        }
    }

    fn handshake_mock() -> MockTransport {
        let mut mock = MockTransport::new();
        mock.expect(b"ck", b"");
        mock.expect(b"!", b"C\n");
        mock
    }

    /// Queue one probed command exchange: `!` answered ready, then the
    /// command answered with `response`.
    fn expect_cmd(mock: &mut MockTransport, command: &str, response: &[u8]) {
        mock.expect(b"!", b"C\n");
        mock.expect(command.as_bytes(), response);
    }

    async fn connect(mock: MockTransport) -> SessionHandle {
        start_session(Box::new(mock), test_config()).await.unwrap()
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

    fn cv_request() -> ExperimentRequest {
        ExperimentRequest::new(
            ExperimentKind::CyclicVoltammetry(CvParams {
                clean_s: 0,
                dep_s: 0,
                clean_mv: 0.0,
                dep_mv: 0.0,
                v1_mv: -500.0,
                v2_mv: 500.0,
                start_mv: 0.0,
                scans: 1,
                slope_mv_s: 1000,
            }),
            AdcSettings::default(),
            2,
        )
        .unwrap()
    }

    fn chronoamp_request() -> ExperimentRequest {
        ExperimentRequest::new(
            ExperimentKind::Chronoamperometry(ChronoampParams {
                steps: vec![ChronoampStep {
                    potential_mv: 100.0,
                    duration_s: 5,
                }],
            }),
            AdcSettings::default(),
            2,
        )
        .unwrap()
    }

    // ---------------------------------------------------------------
    // Connection handshake
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn connect_succeeds_on_ready_prompt() {
        let session = connect(handshake_mock()).await;
        assert!(session.is_open());
        session.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn connect_discards_boot_noise_before_ready() {
        let mut mock = MockTransport::new();
        mock.expect(b"ck", b"");
        mock.expect(b"!", b"#BOOT junk\n");
        mock.expect(b"!", b"C\n");
        let session = connect(mock).await;
        assert!(session.is_open());
        session.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn connect_gives_up_after_exactly_ten_probes() {
        let mut mock = MockTransport::new();
        mock.expect(b"ck", b"");
        for _ in 0..10 {
            mock.expect(b"!", b"");
        }
        // An eleventh probe would trip the exhausted-expectations error
        // instead of the handshake timeout.
        let err = start_session(Box::new(mock), test_config())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::HandshakeTimeout(10)));
    }

    // ---------------------------------------------------------------
    // Housekeeping tasks
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn version_check_parses_and_reports() {
        let mut mock = handshake_mock();
        expect_cmd(
            &mut mock,
            "V",
            b"#INFO: boot ok\nV1.2\nno command recognised\n",
        );
        let mut session = connect(mock).await;

        session.submit(CommandTask::VersionCheck).await.unwrap();
        let outcome = session.next_result().await.unwrap();
        assert_eq!(outcome.status, RunStatus::Done);
        match outcome.reply {
            Some(TaskReply::Version(v)) => assert_eq!(v, FirmwareVersion::new(1, 2)),
            other => panic!("expected Version reply, got {other:?}"),
        }
        session.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn garbled_version_line_is_a_protocol_failure() {
        let mut mock = handshake_mock();
        expect_cmd(&mut mock, "V", b"Vpotato\nno command recognised\n");
        let mut session = connect(mock).await;

        session.submit(CommandTask::VersionCheck).await.unwrap();
        let outcome = session.next_result().await.unwrap();
        assert_eq!(outcome.status, RunStatus::SerialError);
        assert!(matches!(outcome.error, Some(Error::Protocol(_))));
        session.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn settings_round_trip() {
        let mut mock = handshake_mock();
        expect_cmd(
            &mut mock,
            "SR",
            b"Smax_time.180:r100_trim.5\nno command recognised\n",
        );
        expect_cmd(&mut mock, "SW180 9 ", b"");
        let mut session = connect(mock).await;

        session.submit(CommandTask::SettingsRead).await.unwrap();
        let outcome = session.next_result().await.unwrap();
        assert_eq!(outcome.status, RunStatus::Done);
        let mut settings = match outcome.reply {
            Some(TaskReply::Settings(s)) => s,
            other => panic!("expected Settings reply, got {other:?}"),
        };
        assert_eq!(settings.get("r100_trim"), Some("5"));

        settings.set("r100_trim", "9").unwrap();
        session
            .submit(CommandTask::SettingsWrite(settings))
            .await
            .unwrap();
        let outcome = session.next_result().await.unwrap();
        assert_eq!(outcome.status, RunStatus::Done);
        session.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn light_sensor_reading() {
        let mut mock = handshake_mock();
        expect_cmd(&mut mock, "T", b"T658.00\nno command recognised\n");
        let mut session = connect(mock).await;

        session.submit(CommandTask::LightSensorRead).await.unwrap();
        let outcome = session.next_result().await.unwrap();
        assert_eq!(outcome.status, RunStatus::Done);
        match outcome.reply {
            Some(TaskReply::LightLevel(level)) => assert!((level - 658.0).abs() < 1e-9),
            other => panic!("expected LightLevel reply, got {other:?}"),
        }
        session.disconnect().await.unwrap();
    }

    // ---------------------------------------------------------------
    // Measurement runs
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn cv_run_streams_and_archives_scan_tagged_samples() {
        let mut mock = handshake_mock();
        expect_cmd(&mut mock, "V", b"V1.1\nno command recognised\n");
        expect_cmd(&mut mock, "EA0 3 1 ", b"no command recognised\n");
        expect_cmd(&mut mock, "EG2 ", b"no command recognised\n");

        // Two scans of three records each, separated by scan boundaries.
        let mut stream = Vec::new();
        for scan in 0..2u16 {
            for i in 1..=3i32 {
                stream.extend_from_slice(b"B\n");
                stream.extend_from_slice(&record6(32768, i32::from(scan) * 1000 + i * 100));
            }
            stream.extend_from_slice(b"S\n");
        }
        stream.extend_from_slice(b"no command recognised\n");
        expect_cmd(
            &mut mock,
            "EC0 0 32768 32768 21845 43691 32768 1 1000 ",
            &stream,
        );

        let mut session = connect(mock).await;
        session.submit(CommandTask::VersionCheck).await.unwrap();
        assert_eq!(session.next_result().await.unwrap().status, RunStatus::Done);

        session
            .submit(CommandTask::Experiment(cv_request()))
            .await
            .unwrap();
        let outcome = session.next_result().await.unwrap();
        assert_eq!(outcome.status, RunStatus::Done);

        let record = match outcome.reply {
            Some(TaskReply::Run(record)) => record,
            other => panic!("expected Run reply, got {other:?}"),
        };
        assert_eq!(record.technique, "cyclic voltammetry");
        assert_eq!(record.data_class, DataClass::MultiScan);
        assert_eq!(record.commands.len(), 3);
        assert_eq!(record.samples.len(), 6);

        let scans: Vec<u32> = record.samples.iter().map(|s| s.scan).collect();
        assert_eq!(scans, vec![0, 0, 0, 1, 1, 1]);

        // v1.1 gain index 2 is 3 kOhm.
        match record.samples[0].values {
            SampleValues::Sweep {
                voltage_mv,
                current_a,
            } => {
                assert!((voltage_mv - 0.0).abs() < 1e-9);
                let expected = 100.0 * 1.5 / 3e3 / 8_388_607.0;
                assert!((current_a - expected).abs() < expected * 1e-9);
            }
            other => panic!("expected Sweep values, got {other:?}"),
        }

        // The live stream carried the same six samples.
        let mut live = 0;
        while session.poll_sample().is_some() {
            live += 1;
        }
        assert_eq!(live, 6);
        session.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn abort_mid_run_stops_cleanly_and_keeps_partial_data() {
        let mut mock = handshake_mock();
        expect_cmd(&mut mock, "V", b"V1.1\nno command recognised\n");
        expect_cmd(&mut mock, "EA0 3 1 ", b"no command recognised\n");
        expect_cmd(&mut mock, "EG2 ", b"no command recognised\n");

        // One record arrives, then the stream goes quiet.
        let mut stream = b"B\n".to_vec();
        stream.extend_from_slice(&record8(0, 100, 4000));
        expect_cmd(&mut mock, "ER1 34953 5 0 ", &stream);
        // The abort byte lands once the worker sees the signal.
        mock.expect(b"a", b"");
        // The session stays usable afterwards.
        expect_cmd(&mut mock, "V", b"V1.1\nno command recognised\n");

        let mut session = connect(mock).await;
        session.submit(CommandTask::VersionCheck).await.unwrap();
        assert_eq!(session.next_result().await.unwrap().status, RunStatus::Done);

        session
            .submit(CommandTask::Experiment(chronoamp_request()))
            .await
            .unwrap();
        // Wait until the run has demonstrably started.
        let first = session.next_sample().await.unwrap();
        assert!(matches!(first.values, SampleValues::TimedCurrent { .. }));

        session.abort().unwrap();
        let outcome = session.next_result().await.unwrap();
        assert_eq!(outcome.status, RunStatus::Aborted);
        match outcome.reply {
            Some(TaskReply::Run(record)) => assert_eq!(record.samples.len(), 1),
            other => panic!("expected Run reply, got {other:?}"),
        }

        session.submit(CommandTask::VersionCheck).await.unwrap();
        assert_eq!(session.next_result().await.unwrap().status, RunStatus::Done);
        session.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn stale_abort_does_not_kill_the_next_task() {
        let mut mock = handshake_mock();
        expect_cmd(&mut mock, "V", b"V1.2\nno command recognised\n");
        let mut session = connect(mock).await;

        // Abort with nothing running, then submit.
        session.abort().unwrap();
        session.submit(CommandTask::VersionCheck).await.unwrap();
        let outcome = session.next_result().await.unwrap();
        assert_eq!(outcome.status, RunStatus::Done);
        session.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn experiment_without_version_check_fails_before_the_wire() {
        let mut session = connect(handshake_mock()).await;

        session
            .submit(CommandTask::Experiment(cv_request()))
            .await
            .unwrap();
        let outcome = session.next_result().await.unwrap();
        assert_eq!(outcome.status, RunStatus::SerialError);
        assert!(matches!(outcome.error, Some(Error::InvalidParameter(_))));
        session.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn calibration_reports_the_trimmed_mean() {
        let mut mock = handshake_mock();
        expect_cmd(&mut mock, "V", b"V1.2\nno command recognised\n");
        expect_cmd(&mut mock, "EA0 3 1 ", b"no command recognised\n");
        expect_cmd(&mut mock, "EG3 0 ", b"no command recognised\n");

        // Three readings; the settling first one is ignored.
        let mut stream = Vec::new();
        for (i, counts) in [(1u16, 9999i32), (2, 10), (3, 20)] {
            stream.extend_from_slice(b"B\n");
            stream.extend_from_slice(&record8(i, 0, counts));
        }
        stream.extend_from_slice(b"no command recognised\n");
        expect_cmd(&mut mock, "ER1 65535 2 0 ", &stream);

        let mut session = connect(mock).await;
        session.submit(CommandTask::VersionCheck).await.unwrap();
        assert_eq!(session.next_result().await.unwrap().status, RunStatus::Done);

        let params = CalibrationParams::new(2, AdcSettings::default(), 3).unwrap();
        session
            .submit(CommandTask::GainCalibration(params))
            .await
            .unwrap();
        let outcome = session.next_result().await.unwrap();
        assert_eq!(outcome.status, RunStatus::Done);
        match outcome.reply {
            Some(TaskReply::CalibrationOffset(offset)) => assert_eq!(offset, 15),
            other => panic!("expected CalibrationOffset reply, got {other:?}"),
        }
        session.disconnect().await.unwrap();
    }

    // ---------------------------------------------------------------
    // Shutdown
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn disconnect_mid_run_aborts_on_the_wire() {
        let mut mock = handshake_mock();
        expect_cmd(&mut mock, "V", b"V1.1\nno command recognised\n");
        expect_cmd(&mut mock, "EA0 3 1 ", b"no command recognised\n");
        expect_cmd(&mut mock, "EG2 ", b"no command recognised\n");
        let mut stream = b"B\n".to_vec();
        stream.extend_from_slice(&record8(0, 100, 4000));
        expect_cmd(&mut mock, "ER1 34953 5 0 ", &stream);
        mock.expect(b"a", b"");

        let mut session = connect(mock).await;
        let mut events = session.subscribe();

        session.submit(CommandTask::VersionCheck).await.unwrap();
        assert_eq!(session.next_result().await.unwrap().status, RunStatus::Done);

        session
            .submit(CommandTask::Experiment(chronoamp_request()))
            .await
            .unwrap();
        let _ = session.next_sample().await.unwrap();
        session.disconnect().await.unwrap();

        // The event stream shows the run being cut short by the
        // disconnect, then the session closing.
        let mut statuses = Vec::new();
        while let Ok(event) = events.recv().await {
            statuses.push(event);
        }
        assert!(statuses.iter().any(|e| matches!(
            e,
            SessionEvent::TaskFinished {
                status: RunStatus::Disconnected
            }
        )));
        assert!(statuses
            .iter()
            .any(|e| matches!(e, SessionEvent::Disconnected)));
    }

    #[tokio::test]
    async fn dropping_the_handle_shuts_the_worker_down() {
        let session = connect(handshake_mock()).await;
        let mut events = session.subscribe();
        drop(session);

        // Worker notices the closed channels and exits.
        loop {
            match events.recv().await {
                Ok(SessionEvent::Disconnected) => break,
                Ok(_) => continue,
                Err(e) => panic!("event stream closed without Disconnected: {e}"),
            }
        }
    }
}
