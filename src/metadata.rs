//! Metadata side channel.
//!
//! The feeder drains the session's discriminator tap and pipes it into an
//! external RDS decoder; the reader turns the decoder's JSON lines into
//! [`WorkerEvent::Metadata`]. Decoder instances are numbered so that output
//! from a replaced instance never reaches the controller.

use std::io;
use std::os::fd::OwnedFd;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use serde_json::{Map, Value};
use tracing::{debug, info, trace, warn};

use crate::config::CommandSpec;
use crate::engine::METADATA_TAP_RATE_HZ;
use crate::error::{RadioError, Result};
use crate::events::WorkerEvent;
use crate::pipe::{PipeReader, PipeWriter, WriteOutcome, READ_TIMEOUT};
use crate::process;
use crate::session::Liveness;

pub const RESPAWN_INTERVAL: Duration = Duration::from_secs(1);
/// Longest one tap chunk may wait on the decoder before it is dropped.
pub const DECODER_WRITE_TIMEOUT: Duration = Duration::from_millis(100);
/// Consecutive dropped chunks after which the decoder is replaced.
pub const MAX_DECODER_STALLS: u32 = 3;
const TAP_CHUNK_BYTES: usize = 16 * 1024;
const LINE_CHUNK_BYTES: usize = 4096;
const MAX_LINE_BYTES: usize = 64 * 1024;

const RICH_TEXT_KEYS: [&str; 5] = ["rtplus", "radio_text_plus", "radiotext_plus", "radiotextplus", "rt_plus"];

/// The fields of one decoder record this receiver cares about. Absent
/// fields are `None` and leave station state untouched.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MetadataRecord {
    pub ps: Option<String>,
    pub radiotext: Option<String>,
    pub rich_text: Option<Value>,
    pub pi: Option<String>,
    pub prog_type: Option<String>,
    pub tp: Option<bool>,
    pub ta: Option<bool>,
    pub stereo: Option<bool>,
    pub alt_freqs: Option<Vec<f64>>,
}

impl MetadataRecord {
    pub fn parse(line: &str) -> Option<MetadataRecord> {
        let value: Value = serde_json::from_str(line.trim()).ok()?;
        let obj = value.as_object()?;
        Some(MetadataRecord {
            ps: text(obj, "ps"),
            radiotext: text(obj, "radiotext"),
            rich_text: RICH_TEXT_KEYS
                .iter()
                .filter_map(|k| obj.get(*k))
                .find(|v| is_truthy(v))
                .cloned(),
            pi: obj.get("pi").and_then(pi_code),
            prog_type: obj.get("prog_type").and_then(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            }),
            tp: obj.get("tp").and_then(Value::as_bool),
            ta: obj.get("ta").and_then(Value::as_bool),
            stereo: obj.get("di").and_then(|di| di.get("stereo")).and_then(Value::as_bool),
            alt_freqs: obj
                .get("alt_frequencies_a")
                .and_then(Value::as_array)
                .map(|list| list.iter().filter_map(frequency).collect()),
        })
    }

    pub fn is_recognized(&self) -> bool {
        self.ps.as_deref().is_some_and(|s| !s.is_empty())
            || self.radiotext.as_deref().is_some_and(|s| !s.is_empty())
            || self.rich_text.is_some()
            || self.pi.is_some()
            || self.prog_type.is_some()
            || self.tp.is_some()
            || self.ta.is_some()
            || self.stereo.is_some()
    }
}

fn text(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(Value::as_str).map(str::to_string)
}

fn pi_code(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => n.as_u64().map(|code| format!("0x{:04X}", code)),
        _ => None,
    }
}

fn frequency(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_end_matches("MHz").trim().parse().ok(),
        _ => None,
    }
}

fn is_truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|x| x != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[derive(Debug)]
pub struct RespawnThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl RespawnThrottle {
    pub fn new(interval: Duration) -> Self {
        RespawnThrottle { interval, last: None }
    }

    pub fn try_acquire(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

/// A running decoder: mono S16LE in, JSON lines out.
pub trait DecoderInstance: Send {
    /// Must not block for long. A decoder that is not taking input fails
    /// with `TimedOut` and the chunk is lost.
    fn write(&mut self, data: &[u8]) -> io::Result<()>;

    fn is_alive(&mut self) -> bool;

    fn take_output(&mut self) -> Option<PipeReader>;

    fn terminate(self: Box<Self>);
}

pub trait DecoderSpawner: Send + Sync {
    fn spawn(&self) -> Result<Box<dyn DecoderInstance>>;
}

pub struct CommandDecoder {
    command: CommandSpec,
}

impl CommandDecoder {
    pub fn new(command: CommandSpec) -> Self {
        CommandDecoder { command }
    }
}

impl DecoderSpawner for CommandDecoder {
    fn spawn(&self) -> Result<Box<dyn DecoderInstance>> {
        let program = process::find_program(&self.command.program).ok_or_else(|| {
            RadioError::DecoderUnavailable(format!("{} not found in PATH", self.command.program))
        })?;
        let args = self
            .command
            .expand(&[("tap_rate", METADATA_TAP_RATE_HZ.to_string())]);
        let mut child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(process::log_stdio("decoder"))
            .spawn()
            .map_err(|e| RadioError::DecoderUnavailable(format!("{}: {}", program.display(), e)))?;
        let stdin = match child.stdin.take() {
            Some(stdin) => Some(PipeWriter::nonblocking(OwnedFd::from(stdin))?),
            None => None,
        };
        let output = match child.stdout.take() {
            Some(stdout) => Some(PipeReader::from_fd(OwnedFd::from(stdout))?),
            None => None,
        };
        debug!("decoder pid {} started", child.id());
        Ok(Box::new(ProcessDecoder { child, stdin, output }))
    }
}

struct ProcessDecoder {
    child: Child,
    stdin: Option<PipeWriter>,
    output: Option<PipeReader>,
}

impl DecoderInstance for ProcessDecoder {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let stdin = self
            .stdin
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "decoder stdin closed"))?;
        match stdin.write_all_timeout(data, DECODER_WRITE_TIMEOUT)? {
            WriteOutcome::Complete => Ok(()),
            WriteOutcome::Stalled { written: 0 } => {
                Err(io::Error::new(io::ErrorKind::TimedOut, "decoder not reading"))
            }
            // Part of a chunk went through; the sample stream is misaligned now.
            WriteOutcome::Stalled { written } => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("decoder stalled after {} of {} bytes", written, data.len()),
            )),
        }
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn take_output(&mut self) -> Option<PipeReader> {
        self.output.take()
    }

    fn terminate(mut self: Box<Self>) {
        drop(self.stdin.take());
        let reaped = thread::Builder::new()
            .name("rds-reaper".into())
            .spawn(move || {
                process::terminate(&mut self.child, Duration::from_secs(1), Duration::from_millis(500));
            });
        if let Err(e) = reaped {
            warn!("cannot spawn decoder reaper: {}", e);
        }
    }
}

#[derive(Clone)]
pub struct MetadataHandle {
    forwarding: Arc<AtomicBool>,
    restart: Arc<AtomicBool>,
    malformed: Arc<AtomicU64>,
    generation: Arc<AtomicU64>,
}

impl MetadataHandle {
    pub fn set_forwarding(&self, on: bool) {
        self.forwarding.store(on, Ordering::Release);
    }

    pub fn is_forwarding(&self) -> bool {
        self.forwarding.load(Ordering::Acquire)
    }

    /// Replace the current decoder instance on the feeder's next pass.
    pub fn request_restart(&self) {
        self.restart.store(true, Ordering::Release);
    }

    pub fn malformed_lines(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

/// Start the `rds-feeder` and `rds-reader` threads for one session. Both
/// exit on their own once the session stops.
pub fn spawn_workers(
    liveness: Liveness,
    tap: Arc<PipeReader>,
    spawner: Arc<dyn DecoderSpawner>,
    forwarding: bool,
    events: Sender<WorkerEvent>,
) -> io::Result<MetadataHandle> {
    let handle = MetadataHandle {
        forwarding: Arc::new(AtomicBool::new(forwarding)),
        restart: Arc::new(AtomicBool::new(false)),
        malformed: Arc::new(AtomicU64::new(0)),
        generation: Arc::new(AtomicU64::new(0)),
    };
    let (out_tx, out_rx) = crossbeam_channel::unbounded();

    let feeder = Feeder {
        liveness: liveness.clone(),
        tap,
        spawner,
        handle: handle.clone(),
        outputs: out_tx,
        events: events.clone(),
    };
    thread::Builder::new()
        .name("rds-feeder".into())
        .spawn(move || feeder.run())?;

    let reader = Reader {
        liveness,
        outputs: out_rx,
        malformed: Arc::clone(&handle.malformed),
        events,
    };
    thread::Builder::new()
        .name("rds-reader".into())
        .spawn(move || reader.run())?;

    Ok(handle)
}

struct Feeder {
    liveness: Liveness,
    tap: Arc<PipeReader>,
    spawner: Arc<dyn DecoderSpawner>,
    handle: MetadataHandle,
    outputs: Sender<(u64, PipeReader)>,
    events: Sender<WorkerEvent>,
}

impl Feeder {
    fn run(self) {
        let session_id = self.liveness.session_id();
        let mut throttle = RespawnThrottle::new(RESPAWN_INTERVAL);
        let mut decoder: Option<Box<dyn DecoderInstance>> = None;
        let mut reported_unavailable = false;
        let mut stalls = 0u32;

        while self.liveness.is_alive() {
            // Always drain so the engine never blocks on a full tap.
            let chunk = self.tap.read(TAP_CHUNK_BYTES, READ_TIMEOUT);
            if chunk.is_none() && !self.tap.is_alive() {
                debug!("session {} tap closed", session_id);
                break;
            }

            let restart = self.handle.restart.swap(false, Ordering::AcqRel);
            let forwarding = self.handle.is_forwarding();
            let exited = decoder.as_mut().is_some_and(|d| !d.is_alive());
            if restart || exited || !forwarding {
                if let Some(old) = decoder.take() {
                    if exited {
                        debug!("decoder exited, will respawn");
                    }
                    old.terminate();
                }
            }
            if !forwarding {
                continue;
            }

            if decoder.is_none() && throttle.try_acquire(Instant::now()) {
                match self.spawner.spawn() {
                    Ok(mut instance) => {
                        let generation = self.handle.generation.fetch_add(1, Ordering::AcqRel) + 1;
                        if let Some(output) = instance.take_output() {
                            let _ = self.outputs.send((generation, output));
                        }
                        trace!("decoder generation {} for session {}", generation, session_id);
                        decoder = Some(instance);
                        reported_unavailable = false;
                        stalls = 0;
                    }
                    Err(e) => {
                        if !reported_unavailable {
                            warn!("metadata decoder unavailable: {}", e);
                            let _ = self.events.send(WorkerEvent::DecoderUnavailable {
                                session_id,
                                reason: e.to_string(),
                            });
                            reported_unavailable = true;
                        }
                    }
                }
            }

            if let (Some(dec), Some(data)) = (decoder.as_mut(), chunk) {
                let replace = match dec.write(&data) {
                    Ok(()) => {
                        stalls = 0;
                        false
                    }
                    Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                        stalls += 1;
                        trace!("dropped {} tap bytes: {}", data.len(), e);
                        if stalls >= MAX_DECODER_STALLS {
                            warn!("decoder stopped reading input, replacing it");
                            true
                        } else {
                            false
                        }
                    }
                    Err(e) => {
                        debug!("decoder stdin broken: {}", e);
                        true
                    }
                };
                if replace {
                    if let Some(old) = decoder.take() {
                        old.terminate();
                    }
                }
            }
        }

        if let Some(old) = decoder.take() {
            old.terminate();
        }
        info!("metadata feeder for session {} exited", session_id);
    }
}

struct Reader {
    liveness: Liveness,
    outputs: Receiver<(u64, PipeReader)>,
    malformed: Arc<AtomicU64>,
    events: Sender<WorkerEvent>,
}

impl Reader {
    fn run(self) {
        let session_id = self.liveness.session_id();
        let mut current: Option<(u64, PipeReader)> = None;
        let mut pending: Vec<u8> = Vec::new();

        while self.liveness.is_alive() {
            // Only the newest instance is ever read.
            while let Ok(next) = self.outputs.try_recv() {
                current = Some(next);
                pending.clear();
            }

            let Some((generation, output)) = current.as_ref() else {
                match self.outputs.recv_timeout(READ_TIMEOUT) {
                    Ok(next) => {
                        current = Some(next);
                        pending.clear();
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
                continue;
            };
            let generation = *generation;

            match output.read(LINE_CHUNK_BYTES, READ_TIMEOUT) {
                Some(bytes) => {
                    pending.extend_from_slice(&bytes);
                    while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
                        let line: Vec<u8> = pending.drain(..=pos).collect();
                        self.handle_line(session_id, generation, &line);
                    }
                    if pending.len() > MAX_LINE_BYTES {
                        self.malformed.fetch_add(1, Ordering::Relaxed);
                        pending.clear();
                    }
                }
                None if !output.is_alive() => {
                    current = None;
                    pending.clear();
                }
                None => {}
            }
        }
        debug!("metadata reader for session {} exited", session_id);
    }

    fn handle_line(&self, session_id: u64, generation: u64, line: &[u8]) {
        let line = String::from_utf8_lossy(line);
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        match MetadataRecord::parse(line) {
            Some(record) if record.is_recognized() => {
                let _ = self.events.send(WorkerEvent::Metadata {
                    session_id,
                    generation,
                    record,
                });
            }
            Some(_) => trace!("ignoring record without station fields"),
            None => {
                let count = self.malformed.fetch_add(1, Ordering::Relaxed) + 1;
                trace!("malformed decoder line #{}: {}", count, line);
            }
        }
    }
}
