#![allow(dead_code)]
//! Scripted engine, sinks and decoder for controller integration tests.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use pulse_fm_rx::config::{CommandSpec, Settings};
use pulse_fm_rx::engine::{DemodEngine, EngineConfig, EngineFactory, EngineOutputs, RateConfig};
use pulse_fm_rx::error::{RadioError, Result};
use pulse_fm_rx::metadata::{CommandDecoder, DecoderInstance, DecoderSpawner};
use pulse_fm_rx::pipe::{self, PipeReader, PipeWriter};
use pulse_fm_rx::sink::{FinishGrace, PcmSink, ProcessSink, SinkFactory, ENCODER_WRITE_TIMEOUT};
use pulse_fm_rx::station::StationDatabase;
use pulse_fm_rx::{Backends, Controller, Notification};

/// Bytes per scripted PCM write: 256 stereo frames.
pub const PCM_WRITE: usize = 1024;

/// Frame `n` of the scripted stream: left = n, right = -n (as i16).
pub fn pattern_frame(n: u64) -> [u8; 4] {
    let l = n as i16;
    let r = l.wrapping_neg();
    let l = l.to_le_bytes();
    let r = r.to_le_bytes();
    [l[0], l[1], r[0], r[1]]
}

pub fn pattern_bytes(start_frame: u64, frames: usize) -> Vec<u8> {
    (0..frames as u64)
        .flat_map(|i| pattern_frame(start_frame + i))
        .collect()
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct EngineStats {
    pub created: AtomicUsize,
    pub alive: AtomicUsize,
    pub max_alive: AtomicUsize,
    pub stops: AtomicUsize,
    pub freqs_hz: Mutex<Vec<u64>>,
    pub live_gains: Mutex<Vec<f64>>,
    /// (event, frequency) in the order engines started and released.
    pub timeline: Mutex<Vec<(&'static str, u64)>>,
}

impl EngineStats {
    pub fn alive(&self) -> usize {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn max_alive(&self) -> usize {
        self.max_alive.load(Ordering::SeqCst)
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn freqs(&self) -> Vec<u64> {
        self.freqs_hz.lock().unwrap().clone()
    }

    pub fn timeline(&self) -> Vec<(&'static str, u64)> {
        self.timeline.lock().unwrap().clone()
    }
}

#[derive(Clone)]
pub struct EngineScript {
    pub live_gain: bool,
    pub tap: bool,
    /// How long `wait` takes after `stop`.
    pub stop_delay: Duration,
    /// Stop producing PCM (closing the stream) after this many writes.
    pub end_after_writes: Option<usize>,
}

impl Default for EngineScript {
    fn default() -> Self {
        EngineScript {
            live_gain: false,
            tap: true,
            stop_delay: Duration::ZERO,
            end_after_writes: None,
        }
    }
}

pub struct ScriptedFactory {
    pub stats: Arc<EngineStats>,
    pub script: Mutex<EngineScript>,
    pub fail_next: AtomicBool,
}

impl ScriptedFactory {
    pub fn new(script: EngineScript) -> Arc<Self> {
        Arc::new(ScriptedFactory {
            stats: Arc::new(EngineStats::default()),
            script: Mutex::new(script),
            fail_next: AtomicBool::new(false),
        })
    }
}

impl EngineFactory for ScriptedFactory {
    fn create(&self) -> Result<Box<dyn DemodEngine>> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(RadioError::EngineUnavailable("usb_claim_interface error -6".into()));
        }
        self.stats.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedEngine {
            stats: Arc::clone(&self.stats),
            script: self.script.lock().unwrap().clone(),
            freq_hz: 0,
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }))
    }
}

struct ScriptedEngine {
    stats: Arc<EngineStats>,
    script: EngineScript,
    freq_hz: u64,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl DemodEngine for ScriptedEngine {
    fn configure(&mut self, config: &EngineConfig) -> Result<()> {
        self.freq_hz = config.center_freq_hz;
        Ok(())
    }

    fn set_gain(&mut self, gain_db: f64) -> bool {
        if self.script.live_gain {
            self.stats.live_gains.lock().unwrap().push(gain_db);
        }
        self.script.live_gain
    }

    fn supports_metadata_tap(&self) -> bool {
        self.script.tap
    }

    fn start(&mut self, outputs: EngineOutputs) -> Result<()> {
        let now_alive = self.stats.alive.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.max_alive.fetch_max(now_alive, Ordering::SeqCst);
        self.stats.freqs_hz.lock().unwrap().push(self.freq_hz);
        self.stats.timeline.lock().unwrap().push(("start", self.freq_hz));
        self.running.store(true, Ordering::SeqCst);

        let running = Arc::clone(&self.running);
        let end_after = self.script.end_after_writes;
        self.worker = Some(thread::spawn(move || {
            produce(running, outputs.pcm, outputs.metadata_tap, end_after)
        }));
        Ok(())
    }

    fn stop(&mut self) {
        self.stats.stops.fetch_add(1, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
    }

    fn wait(&mut self, _timeout: Duration) -> bool {
        thread::sleep(self.script.stop_delay);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        self.stats.timeline.lock().unwrap().push(("release", self.freq_hz));
        self.stats.alive.fetch_sub(1, Ordering::SeqCst);
        true
    }
}

fn produce(running: Arc<AtomicBool>, pcm: Arc<PipeWriter>, tap: Option<Arc<PipeWriter>>, end_after: Option<usize>) {
    let frames_per_write = PCM_WRITE / 4;
    let mut frame = 0u64;
    let mut writes = 0usize;
    while running.load(Ordering::SeqCst) {
        if end_after.is_some_and(|n| writes >= n) {
            pcm.close();
            if let Some(tap) = tap.as_ref() {
                tap.close();
            }
            return;
        }
        if pcm.write_all(&pattern_bytes(frame, frames_per_write)).is_err() {
            return;
        }
        if let Some(tap) = tap.as_ref() {
            let _ = tap.write_all(&[0u8; 256]);
        }
        frame += frames_per_write as u64;
        writes += 1;
        thread::sleep(Duration::from_millis(2));
    }
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct Capture {
    pub bytes: Arc<Mutex<Vec<u8>>>,
    pub finished: Arc<AtomicBool>,
    /// Makes the sink look like its process died.
    pub killed: Arc<AtomicBool>,
}

impl Capture {
    pub fn len(&self) -> usize {
        self.bytes.lock().unwrap().len()
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().unwrap().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
    }
}

pub struct MemorySink {
    capture: Capture,
}

impl PcmSink for MemorySink {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        if self.capture.killed.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "sink process gone"));
        }
        self.capture.bytes.lock().unwrap().extend_from_slice(data);
        Ok(())
    }

    fn is_alive(&mut self) -> bool {
        !self.capture.killed.load(Ordering::SeqCst)
    }

    fn finish(self: Box<Self>, _grace: FinishGrace) -> Result<()> {
        self.capture.finished.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemorySinks {
    pub playbacks: Mutex<Vec<Capture>>,
    pub recordings: Mutex<Vec<(PathBuf, Capture)>>,
    pub fail_playback: AtomicBool,
    /// Record through this real program instead of into memory.
    pub encoder_command: Mutex<Option<CommandSpec>>,
}

impl MemorySinks {
    pub fn last_playback(&self) -> Option<Capture> {
        self.playbacks.lock().unwrap().last().cloned()
    }

    pub fn playback_count(&self) -> usize {
        self.playbacks.lock().unwrap().len()
    }

    pub fn last_recording(&self) -> Option<(PathBuf, Capture)> {
        self.recordings.lock().unwrap().last().cloned()
    }
}

impl SinkFactory for MemorySinks {
    fn playback(&self, _rates: RateConfig) -> Result<Box<dyn PcmSink>> {
        if self.fail_playback.load(Ordering::SeqCst) {
            return Err(RadioError::consumer("playback", "play not found in PATH"));
        }
        let capture = Capture::default();
        self.playbacks.lock().unwrap().push(capture.clone());
        Ok(Box::new(MemorySink { capture }))
    }

    fn encoder(&self, output: &Path, _rates: RateConfig) -> Result<Box<dyn PcmSink>> {
        if let Some(command) = self.encoder_command.lock().unwrap().as_ref() {
            return Ok(Box::new(ProcessSink::spawn("encoder", command, &[], ENCODER_WRITE_TIMEOUT)?));
        }
        let capture = Capture::default();
        self.recordings
            .lock()
            .unwrap()
            .push((output.to_path_buf(), capture.clone()));
        Ok(Box::new(MemorySink { capture }))
    }

    fn recording_extension(&self) -> &'static str {
        "raw"
    }
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct ScriptedDecoder {
    /// Lines every new instance prints right after it starts.
    pub lines: Mutex<Vec<String>>,
    /// Instances report themselves dead immediately.
    pub dies_at_once: AtomicBool,
    pub unavailable: AtomicBool,
    /// When set, only these spawn numbers (0-based) print `lines`.
    pub only_spawns: Mutex<Option<Vec<usize>>>,
    pub spawns: Mutex<Vec<Instant>>,
    pub bytes_in: Arc<AtomicUsize>,
    /// Spawn this real program instead of a scripted instance.
    pub command: Mutex<Option<CommandSpec>>,
}

impl ScriptedDecoder {
    pub fn with_lines(lines: &[&str]) -> Arc<Self> {
        let decoder = ScriptedDecoder::default();
        *decoder.lines.lock().unwrap() = lines.iter().map(|l| l.to_string()).collect();
        Arc::new(decoder)
    }

    pub fn spawn_count(&self) -> usize {
        self.spawns.lock().unwrap().len()
    }

    pub fn spawn_times(&self) -> Vec<Instant> {
        self.spawns.lock().unwrap().clone()
    }
}

impl DecoderSpawner for ScriptedDecoder {
    fn spawn(&self) -> Result<Box<dyn DecoderInstance>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RadioError::DecoderUnavailable("redsea not found in PATH".into()));
        }
        let index = {
            let mut spawns = self.spawns.lock().unwrap();
            spawns.push(Instant::now());
            spawns.len() - 1
        };
        if let Some(command) = self.command.lock().unwrap().as_ref() {
            return CommandDecoder::new(command.clone()).spawn();
        }
        let (reader, writer) = pipe::open()?;
        let prints = match self.only_spawns.lock().unwrap().as_ref() {
            Some(only) => only.contains(&index),
            None => true,
        };
        if prints {
            for line in self.lines.lock().unwrap().iter() {
                writer.write_all(format!("{}\n", line).as_bytes())?;
            }
        }
        Ok(Box::new(ScriptedInstance {
            output: Some(reader),
            writer,
            dead: self.dies_at_once.load(Ordering::SeqCst),
            bytes_in: Arc::clone(&self.bytes_in),
        }))
    }
}

struct ScriptedInstance {
    output: Option<PipeReader>,
    writer: PipeWriter,
    dead: bool,
    bytes_in: Arc<AtomicUsize>,
}

impl DecoderInstance for ScriptedInstance {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.bytes_in.fetch_add(data.len(), Ordering::SeqCst);
        Ok(())
    }

    fn is_alive(&mut self) -> bool {
        !self.dead
    }

    fn take_output(&mut self) -> Option<PipeReader> {
        self.output.take()
    }

    fn terminate(self: Box<Self>) {
        self.writer.close();
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub radio: Controller,
    pub engines: Arc<ScriptedFactory>,
    pub sinks: Arc<MemorySinks>,
    pub decoder: Arc<ScriptedDecoder>,
    pub dir: tempfile::TempDir,
    pub seen: Vec<Notification>,
    cursor: usize,
}

pub fn test_settings(dir: &Path) -> Settings {
    let mut settings = Settings::default();
    settings.recording.output_dir = dir.join("recordings");
    settings.spectrum.enabled = false;
    settings.control.gain_debounce_ms = 100;
    settings.control.stop_timeout_ms = 2000;
    settings.control.scan_dwell_ms = 150;
    settings.control.persist_interval_ms = 0;
    settings
}

impl Harness {
    pub fn new(script: EngineScript, decoder: Arc<ScriptedDecoder>) -> Self {
        Self::with_settings(script, decoder, |_| {})
    }

    pub fn with_settings(
        script: EngineScript,
        decoder: Arc<ScriptedDecoder>,
        tweak: impl FnOnce(&mut Settings),
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = test_settings(dir.path());
        tweak(&mut settings);
        let engines = ScriptedFactory::new(script);
        let sinks = Arc::new(MemorySinks::default());
        let backends = Backends {
            engines: engines.clone(),
            sinks: sinks.clone(),
            decoder: decoder.clone(),
        };
        let db = StationDatabase::empty(dir.path().join("stations.json"));
        Harness {
            radio: Controller::new(settings, backends, db),
            engines,
            sinks,
            decoder,
            dir,
            seen: Vec::new(),
            cursor: 0,
        }
    }

    /// Wait for the next notification matching `pred`. Notifications are
    /// matched in order: each call starts after the previous match, so two
    /// expectations satisfied by one poll batch both succeed.
    pub fn drive_until(&mut self, timeout: Duration, mut pred: impl FnMut(&Notification) -> bool) -> Notification {
        let start = Instant::now();
        loop {
            if let Some(offset) = self.seen[self.cursor..].iter().position(|n| pred(n)) {
                let index = self.cursor + offset;
                self.cursor = index + 1;
                return self.seen[index].clone();
            }
            if start.elapsed() >= timeout {
                panic!("timed out after {:?}; seen: {:?}", timeout, self.seen);
            }
            self.cursor = self.seen.len();
            let notes = self.radio.poll(Instant::now());
            let before = self.seen.len();
            self.seen.extend(notes);
            if self.seen.len() == before {
                thread::sleep(Duration::from_millis(5));
            }
        }
    }

    /// Poll for a fixed time.
    pub fn drive_for(&mut self, duration: Duration) {
        let start = Instant::now();
        while start.elapsed() < duration {
            let notes = self.radio.poll(Instant::now());
            self.seen.extend(notes);
            thread::sleep(Duration::from_millis(5));
        }
    }

    /// Poll until `cond` holds on the harness.
    pub fn wait_for(&mut self, timeout: Duration, mut cond: impl FnMut(&Harness) -> bool) {
        let start = Instant::now();
        while start.elapsed() < timeout {
            let notes = self.radio.poll(Instant::now());
            self.seen.extend(notes);
            if cond(self) {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("condition not met within {:?}; seen: {:?}", timeout, self.seen);
    }

    pub fn tune_and_wait(&mut self, freq_mhz: f64) {
        self.radio.tune(freq_mhz).unwrap();
        let want = pulse_fm_rx::config::mhz_to_khz(freq_mhz);
        self.drive_until(Duration::from_secs(3), |n| {
            matches!(n, Notification::Tuned { freq_khz, .. } if *freq_khz == want)
        });
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.radio.shutdown();
    }
}
