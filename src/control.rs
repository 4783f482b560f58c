//! The control plane. The only place sessions are started and stopped.
//!
//! Every method here returns quickly: anything slow (engine shutdown,
//! encoder finalization) runs on a worker thread and reports back through
//! the event queue, which [`Controller::poll`] drains on the caller's thread.

use std::mem;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Local;
use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, info, warn};

use crate::config::{mhz_to_khz, Settings, MAX_GAIN_DB};
use crate::distributor::{StreamDistributor, VisualizationBuffer, Volume, VIS_BUFFER_CHUNKS};
use crate::engine::{EngineFactory, ProcessEngineFactory};
use crate::error::{RadioError, Result};
use crate::events::{Notification, WorkerEvent};
use crate::metadata::{self, CommandDecoder, DecoderSpawner, MetadataHandle};
use crate::recording::{recording_file_name, RecordingJob, RecordingSlot};
use crate::session::{DeviceSession, SessionRequest, StopCompletion};
use crate::sink::{CommandSinks, NullSink, PcmSink, SinkFactory, ENCODER_GRACE};
use crate::spectrum::{self, FrameSlot, SpectrumParams};
use crate::station::{StationDatabase, StationState};

const RECORDING_PROGRESS_INTERVAL: Duration = Duration::from_secs(1);
const SHUTDOWN_WAIT: Duration = Duration::from_secs(3);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Activity {
    Idle,
    Playback,
    Scanning,
    Probing,
}

#[derive(Clone)]
pub struct Backends {
    pub engines: Arc<dyn EngineFactory>,
    pub sinks: Arc<dyn SinkFactory>,
    pub decoder: Arc<dyn DecoderSpawner>,
}

impl Backends {
    pub fn from_settings(settings: &Settings) -> Self {
        let commands = &settings.commands;
        Backends {
            engines: Arc::new(ProcessEngineFactory::new(commands.engine.clone())),
            sinks: Arc::new(CommandSinks::new(commands.clone(), settings.recording.format)),
            decoder: Arc::new(CommandDecoder::new(commands.decoder.clone())),
        }
    }
}

struct Running {
    session: DeviceSession,
    freq_khz: u32,
    purpose: Activity,
    station: StationState,
    metadata: Option<MetadataHandle>,
    frames: Option<Arc<FrameSlot>>,
    last_metadata: Instant,
}

struct Draining {
    completion: StopCompletion,
    deadline: Instant,
}

#[derive(Clone, Copy, Debug)]
struct PendingStart {
    freq_khz: u32,
    purpose: Activity,
}

struct ScanState {
    channels: Vec<u32>,
    index: usize,
    dwell_until: Option<Instant>,
    found: usize,
}

pub struct Controller {
    settings: Settings,
    backends: Backends,
    events_tx: Sender<WorkerEvent>,
    events_rx: Receiver<WorkerEvent>,

    activity: Activity,
    current: Option<Running>,
    draining: Option<Draining>,
    pending: Option<PendingStart>,
    scan: Option<ScanState>,

    gain_db: f64,
    gain_deadline: Option<Instant>,
    volume: Volume,
    metadata_updates: bool,

    recording: RecordingSlot,
    last_progress: Option<Instant>,

    db: StationDatabase,
    last_persist: Option<Instant>,
    tap_missing_reported: bool,

    outbox: Vec<Notification>,
}

impl Controller {
    pub fn new(settings: Settings, backends: Backends, db: StationDatabase) -> Self {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        Controller {
            gain_db: settings.sdr.gain_db,
            volume: Volume::new(settings.audio.volume),
            metadata_updates: settings.rds.enable_updates_during_playback,
            settings,
            backends,
            events_tx,
            events_rx,
            activity: Activity::Idle,
            current: None,
            draining: None,
            pending: None,
            scan: None,
            gain_deadline: None,
            recording: RecordingSlot::new(),
            last_progress: None,
            db,
            last_persist: None,
            tap_missing_reported: false,
            outbox: Vec::new(),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn activity(&self) -> Activity {
        self.activity
    }

    pub fn gain_db(&self) -> f64 {
        self.gain_db
    }

    pub fn volume(&self) -> u8 {
        self.volume.get()
    }

    pub fn metadata_updates(&self) -> bool {
        self.metadata_updates
    }

    pub fn current_freq_khz(&self) -> Option<u32> {
        self.current.as_ref().map(|r| r.freq_khz)
    }

    pub fn current_session_id(&self) -> Option<u64> {
        self.current.as_ref().map(|r| r.session.id())
    }

    pub fn station(&self) -> Option<&StationState> {
        self.current.as_ref().map(|r| &r.station)
    }

    pub fn database(&self) -> &StationDatabase {
        &self.db
    }

    pub fn is_recording(&self) -> bool {
        self.recording.current().is_some_and(|job| job.is_active())
    }

    pub fn is_draining(&self) -> bool {
        self.draining.as_ref().is_some_and(|d| !d.completion.is_fired())
    }

    pub fn tune(&mut self, freq_mhz: f64) -> Result<()> {
        if matches!(self.activity, Activity::Scanning | Activity::Probing) {
            return Err(RadioError::Busy(self.activity));
        }
        let freq_khz = self.check_band(freq_mhz)?;
        info!("tune to {:.1} MHz", freq_khz as f64 / 1000.0);
        self.gain_deadline = None;
        self.request_session(freq_khz, Activity::Playback, Instant::now())
    }

    pub fn stop(&mut self) {
        if self.scan.is_some() {
            self.cancel_scan();
            return;
        }
        let had_work = self.current.is_some() || self.pending.is_some();
        self.pending = None;
        self.gain_deadline = None;
        self.stop_current(false);
        self.activity = Activity::Idle;
        self.flush_database();
        if had_work {
            self.outbox.push(Notification::Stopped);
        }
    }

    pub fn set_gain(&mut self, gain_db: f64) {
        let gain_db = gain_db.clamp(0.0, MAX_GAIN_DB);
        self.gain_db = gain_db;
        let playing = self
            .current
            .as_ref()
            .filter(|r| r.purpose == Activity::Playback && r.session.is_alive());
        let applied_live = match playing {
            Some(run) => run.session.set_gain_live(gain_db),
            None => false,
        };
        if playing.is_some() && !applied_live {
            // One pending retune; each change pushes it back.
            self.gain_deadline = Some(Instant::now() + self.settings.control.gain_debounce());
        }
        self.outbox.push(Notification::GainChanged { gain_db, applied_live });
    }

    pub fn set_volume(&mut self, percent: u8) {
        self.volume.set(percent);
    }

    pub fn set_metadata_updates(&mut self, enabled: bool) {
        self.metadata_updates = enabled;
        if let Some(run) = self.current.as_ref().filter(|r| r.purpose == Activity::Playback) {
            if let Some(handle) = run.metadata.as_ref() {
                handle.set_forwarding(enabled);
            }
        }
    }

    pub fn start_recording(&mut self) -> Result<PathBuf> {
        let run = self
            .current
            .as_ref()
            .filter(|r| r.purpose == Activity::Playback && r.session.is_alive())
            .ok_or_else(|| RadioError::InvalidState("recording needs an active station".into()))?;
        if let Some(job) = self.recording.current() {
            if job.is_active() {
                return Err(RadioError::InvalidState("already recording".into()));
            }
        }

        let station = match run.station.program_service.as_deref() {
            Some(ps) if !ps.trim().is_empty() => ps.trim().to_string(),
            _ => format!("{:.1}MHz", run.freq_khz as f64 / 1000.0),
        };
        let dir = self.settings.recording_dir();
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(recording_file_name(
            &station,
            Local::now(),
            self.backends.sinks.recording_extension(),
        ));

        let encoder = self.backends.sinks.encoder(&path, run.session.rates())?;
        let job = RecordingJob::new(run.session.id(), path.clone(), encoder);
        if let Some(stale) = self.recording.take() {
            stale.finalize_in_background(ENCODER_GRACE, self.events_tx.clone());
        }
        self.recording.install(job)?;
        self.last_progress = Some(Instant::now());
        info!("recording to {}", path.display());
        self.outbox.push(Notification::RecordingStarted { path: path.clone() });
        Ok(path)
    }

    pub fn stop_recording(&mut self) -> Result<()> {
        if !self.is_recording() {
            return Err(RadioError::InvalidState("not recording".into()));
        }
        self.end_recording(false);
        Ok(())
    }

    pub fn scan(&mut self) -> Result<()> {
        let channels = self.settings.band().channels_khz();
        self.begin_scan(channels, Activity::Scanning)
    }

    pub fn probe(&mut self, freq_mhz: f64) -> Result<()> {
        let freq_khz = self.check_band(freq_mhz)?;
        self.begin_scan(vec![freq_khz], Activity::Probing)
    }

    pub fn cancel_scan(&mut self) {
        let Some(scan) = self.scan.take() else {
            return;
        };
        info!("scan cancelled after {} of {} channels", scan.index, scan.channels.len());
        self.pending = None;
        self.stop_current(false);
        self.activity = Activity::Idle;
        self.flush_database();
        self.outbox.push(Notification::ScanFinished {
            found: scan.found,
            cancelled: true,
        });
    }

    /// Run deferred work and collect notifications. Call regularly from the
    /// UI thread.
    pub fn poll(&mut self, now: Instant) -> Vec<Notification> {
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_event(event, now);
        }

        if self.pending.is_some() {
            if let Err(e) = self.try_start_pending(now) {
                debug!("deferred start failed: {}", e);
            }
        }

        if let Some(deadline) = self.gain_deadline {
            if now >= deadline && !self.is_recording() {
                self.gain_deadline = None;
                if let Some(freq_khz) = self
                    .current
                    .as_ref()
                    .filter(|r| r.purpose == Activity::Playback)
                    .map(|r| r.freq_khz)
                {
                    info!("retuning for gain {:.1} dB", self.gain_db);
                    if let Err(e) = self.request_session(freq_khz, Activity::Playback, now) {
                        warn!("gain retune failed: {}", e);
                    }
                }
            }
        }

        self.advance_scan(now);
        self.report_recording_progress(now);

        if let Some(frame) = self
            .current
            .as_ref()
            .and_then(|r| r.frames.as_ref())
            .and_then(|slot| slot.take_due(now))
        {
            self.outbox.push(Notification::VisualizationFrame(frame));
        }

        self.watch_decoder(now);
        self.persist_if_due(now);

        mem::take(&mut self.outbox)
    }

    /// Stop everything and wait, bounded, for the device to be released.
    /// Meant for process exit.
    pub fn shutdown(&mut self) {
        self.scan = None;
        self.pending = None;
        self.gain_deadline = None;
        self.stop_current(true);
        if let Some(draining) = self.draining.take() {
            if !draining.completion.wait_timeout(SHUTDOWN_WAIT) {
                warn!("{}", RadioError::Timeout("device release at shutdown"));
            }
        }
        self.activity = Activity::Idle;
        self.flush_database();
    }

    fn check_band(&self, freq_mhz: f64) -> Result<u32> {
        let band = self.settings.band();
        let freq_khz = mhz_to_khz(freq_mhz);
        if !freq_mhz.is_finite() || !band.contains_khz(freq_khz) {
            return Err(RadioError::FrequencyOutOfRange {
                freq_mhz,
                min_mhz: band.min_mhz(),
                max_mhz: band.max_mhz(),
            });
        }
        Ok(freq_khz)
    }

    fn begin_scan(&mut self, channels: Vec<u32>, purpose: Activity) -> Result<()> {
        if matches!(self.activity, Activity::Scanning | Activity::Probing) {
            return Err(RadioError::Busy(self.activity));
        }
        let Some(&first) = channels.first() else {
            return Err(RadioError::InvalidState("band has no channels".into()));
        };
        info!("{:?} over {} channel(s)", purpose, channels.len());
        self.gain_deadline = None;
        self.scan = Some(ScanState {
            channels,
            index: 0,
            dwell_until: None,
            found: 0,
        });
        self.request_session(first, purpose, Instant::now())
    }

    /// Stop whatever runs now and queue a start on `freq_khz`. The start
    /// happens once the previous session has released the device.
    fn request_session(&mut self, freq_khz: u32, purpose: Activity, now: Instant) -> Result<()> {
        self.stop_current(false);
        self.pending = Some(PendingStart { freq_khz, purpose });
        self.activity = purpose;
        self.try_start_pending(now)
    }

    fn try_start_pending(&mut self, now: Instant) -> Result<()> {
        let Some(pending) = self.pending else {
            return Ok(());
        };
        if let Some(draining) = self.draining.as_ref() {
            if !draining.completion.is_fired() {
                if now < draining.deadline {
                    return Ok(());
                }
                warn!("{}, starting anyway", RadioError::Timeout("previous session to stop"));
            }
            self.draining = None;
        }
        self.pending = None;

        match self.start_session(pending.freq_khz, pending.purpose, now) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("cannot start session on {} kHz: {}", pending.freq_khz, e);
                self.outbox.push(Notification::TuneFailed {
                    freq_khz: pending.freq_khz,
                    reason: e.to_string(),
                });
                if let Some(scan) = self.scan.take() {
                    self.outbox.push(Notification::ScanFinished {
                        found: scan.found,
                        cancelled: true,
                    });
                }
                self.activity = Activity::Idle;
                Err(e)
            }
        }
    }

    fn start_session(&mut self, freq_khz: u32, purpose: Activity, now: Instant) -> Result<()> {
        let request = SessionRequest::from_settings(&self.settings, freq_khz, self.gain_db, true);
        let session = DeviceSession::start(self.backends.engines.as_ref(), request)?;

        let playback: Box<dyn PcmSink> = if purpose == Activity::Playback {
            match self.backends.sinks.playback(session.rates()) {
                Ok(sink) => sink,
                Err(e) => {
                    self.retire(&session, now);
                    return Err(e);
                }
            }
        } else {
            Box::new(NullSink)
        };

        let want_frames = purpose == Activity::Playback && self.settings.spectrum.enabled;
        let vis_buffer = want_frames.then(|| Arc::new(VisualizationBuffer::new(VIS_BUFFER_CHUNKS)));
        let distributor = StreamDistributor {
            liveness: session.liveness(),
            reader: session.pcm_reader(),
            playback,
            recording: self.recording.clone(),
            visualization: vis_buffer.clone(),
            volume: self.volume.clone(),
            events: self.events_tx.clone(),
        };
        if let Err(e) = distributor.spawn() {
            self.retire(&session, now);
            return Err(e.into());
        }

        let frames = match vis_buffer {
            Some(buffer) => {
                let slot = Arc::new(FrameSlot::new(self.settings.spectrum.fps));
                let params = SpectrumParams::from_settings(&self.settings.spectrum, session.rates().audio_rate_hz);
                match spectrum::spawn_visualization(session.liveness(), buffer, Arc::clone(&slot), params) {
                    Ok(_) => Some(slot),
                    Err(e) => {
                        warn!("visualization disabled: {}", e);
                        None
                    }
                }
            }
            None => None,
        };

        let forwarding = purpose != Activity::Playback || self.metadata_updates;
        let metadata = match session.metadata_tap() {
            Some(tap) => match metadata::spawn_workers(
                session.liveness(),
                tap,
                Arc::clone(&self.backends.decoder),
                forwarding,
                self.events_tx.clone(),
            ) {
                Ok(handle) => Some(handle),
                Err(e) => {
                    warn!("metadata workers not started: {}", e);
                    None
                }
            },
            None => {
                if !self.tap_missing_reported {
                    warn!("demodulator offers no metadata tap, station data will not update");
                    self.outbox.push(Notification::MetadataUnavailable {
                        reason: "demodulator command has no {tap} output".into(),
                    });
                    self.tap_missing_reported = true;
                }
                None
            }
        };

        let station = self
            .db
            .get(freq_khz)
            .cloned()
            .unwrap_or_else(|| StationState::new(freq_khz));

        if purpose == Activity::Playback {
            self.outbox.push(Notification::Tuned {
                freq_khz,
                gain_db: self.gain_db,
            });
            if station.has_program_service() {
                self.outbox.push(Notification::StationChanged(station.clone()));
            }
        } else if let Some(scan) = self.scan.as_mut() {
            scan.dwell_until = Some(now + self.settings.control.scan_dwell());
            self.outbox.push(Notification::ScanProgress {
                freq_khz,
                index: scan.index,
                total: scan.channels.len(),
            });
        }

        self.current = Some(Running {
            session,
            freq_khz,
            purpose,
            station,
            metadata,
            frames,
            last_metadata: now,
        });
        Ok(())
    }

    fn retire(&mut self, session: &DeviceSession, now: Instant) {
        let completion = session.stop(false);
        self.draining = Some(Draining {
            completion,
            deadline: now + self.settings.control.stop_timeout(),
        });
    }

    fn stop_current(&mut self, blocking: bool) {
        self.end_recording(blocking);
        let Some(run) = self.current.take() else {
            return;
        };
        if run.purpose == Activity::Playback && run.station.update_count > 0 {
            self.db.upsert(run.station.clone());
        }
        if let Some(frames) = run.frames.as_ref() {
            frames.clear();
        }
        let completion = run.session.stop(blocking);
        self.draining = Some(Draining {
            completion,
            deadline: Instant::now() + self.settings.control.stop_timeout(),
        });
    }

    fn end_recording(&mut self, blocking: bool) {
        let Some(job) = self.recording.take() else {
            return;
        };
        let path = job.output_path().to_path_buf();
        if job.deactivate() {
            self.outbox.push(Notification::RecordingStopped { path: path.clone() });
        }
        if blocking {
            match job.finalize(ENCODER_GRACE) {
                Ok(()) if job.failure().is_none() => self.outbox.push(Notification::RecordingSaved {
                    path,
                    bytes: job.bytes_in(),
                }),
                Ok(()) => {}
                Err(e) => self.outbox.push(Notification::RecordingFailed { reason: e.to_string() }),
            }
        } else {
            job.finalize_in_background(ENCODER_GRACE, self.events_tx.clone());
        }
    }

    fn handle_event(&mut self, event: WorkerEvent, now: Instant) {
        let current_id = self.current_session_id();
        match event {
            WorkerEvent::PlaybackFailed { session_id, reason } if Some(session_id) == current_id => {
                self.session_lost(reason, now);
            }
            WorkerEvent::PcmEnded { session_id } if Some(session_id) == current_id => {
                self.session_lost("demodulator stream ended".into(), now);
            }
            WorkerEvent::RecordingFailed { session_id, reason } => {
                let Some(job) = self.recording.current().filter(|j| j.session_id() == session_id) else {
                    debug!("ignoring recording failure from session {}", session_id);
                    return;
                };
                self.recording.take();
                job.finalize_in_background(ENCODER_GRACE, self.events_tx.clone());
                if job.claim_failure_report() {
                    self.outbox.push(Notification::RecordingFailed { reason });
                }
            }
            WorkerEvent::RecordingFinalized { job, result } => {
                if let Some(reason) = job.failure() {
                    // The job may have been retired before its failure event arrived.
                    if job.claim_failure_report() {
                        self.outbox.push(Notification::RecordingFailed { reason });
                    }
                    return;
                }
                match result {
                    Ok(()) => self.outbox.push(Notification::RecordingSaved {
                        path: job.output_path().to_path_buf(),
                        bytes: job.bytes_in(),
                    }),
                    Err(reason) => self.outbox.push(Notification::RecordingFailed { reason }),
                }
            }
            WorkerEvent::Metadata {
                session_id,
                generation,
                record,
            } => {
                let Some(run) = self.current.as_mut().filter(|r| r.session.id() == session_id) else {
                    return;
                };
                if run.metadata.as_ref().is_some_and(|h| h.generation() != generation) {
                    debug!("dropping output of superseded decoder {}", generation);
                    return;
                }
                run.last_metadata = now;
                let changed = run.station.apply(&record, Local::now());
                if run.purpose == Activity::Playback {
                    self.db.upsert(run.station.clone());
                    if changed {
                        self.outbox.push(Notification::StationChanged(run.station.clone()));
                    }
                }
            }
            WorkerEvent::DecoderUnavailable { session_id, reason } if Some(session_id) == current_id => {
                self.outbox.push(Notification::MetadataUnavailable { reason });
            }
            _ => debug!("ignoring event from a finished session"),
        }
    }

    fn session_lost(&mut self, reason: String, now: Instant) {
        if self.scan.is_some() {
            debug!("probe session ended early: {}", reason);
            self.finish_channel(now);
            return;
        }
        warn!("playback lost: {}", reason);
        self.outbox.push(Notification::PlaybackError { reason });
        self.gain_deadline = None;
        self.stop_current(false);
        self.activity = Activity::Idle;
        self.outbox.push(Notification::Stopped);
    }

    fn advance_scan(&mut self, now: Instant) {
        let due = self
            .scan
            .as_ref()
            .and_then(|s| s.dwell_until)
            .is_some_and(|until| now >= until);
        if due && self.current.is_some() {
            self.finish_channel(now);
        }
    }

    fn finish_channel(&mut self, now: Instant) {
        if let Some(run) = self.current.as_ref() {
            if run.station.has_program_service() {
                let station = run.station.clone();
                info!("found {}", station.display_name());
                self.db.upsert(station.clone());
                if let Some(scan) = self.scan.as_mut() {
                    scan.found += 1;
                }
                self.outbox.push(Notification::StationFound(station));
            }
        }
        self.stop_current(false);

        let purpose = self.activity;
        let Some(scan) = self.scan.as_mut() else {
            return;
        };
        scan.index += 1;
        scan.dwell_until = None;
        if let Some(&next) = scan.channels.get(scan.index) {
            self.pending = Some(PendingStart { freq_khz: next, purpose });
            if let Err(e) = self.try_start_pending(now) {
                debug!("scan aborted: {}", e);
            }
        } else {
            let found = scan.found;
            self.scan = None;
            self.activity = Activity::Idle;
            self.flush_database();
            info!("scan finished, {} station(s)", found);
            self.outbox.push(Notification::ScanFinished { found, cancelled: false });
        }
    }

    fn report_recording_progress(&mut self, now: Instant) {
        let Some(job) = self.recording.current().filter(|j| j.is_active()) else {
            return;
        };
        let due = self
            .last_progress
            .map_or(true, |last| now.saturating_duration_since(last) >= RECORDING_PROGRESS_INTERVAL);
        if due {
            self.last_progress = Some(now);
            self.outbox.push(Notification::RecordingProgress {
                path: job.output_path().to_path_buf(),
                bytes: job.bytes_in(),
                elapsed: job.elapsed(),
            });
        }
    }

    /// Replace a decoder that has gone quiet for the configured interval.
    fn watch_decoder(&mut self, now: Instant) {
        let limit = Duration::from_secs(self.settings.rds.update_interval_s as u64);
        let Some(run) = self.current.as_mut() else {
            return;
        };
        let Some(handle) = run.metadata.as_ref().filter(|h| h.is_forwarding()) else {
            return;
        };
        if now.saturating_duration_since(run.last_metadata) >= limit {
            debug!("no metadata for {:?}, restarting decoder", limit);
            handle.request_restart();
            run.last_metadata = now;
        }
    }

    fn persist_if_due(&mut self, now: Instant) {
        if !self.db.is_dirty() {
            return;
        }
        let due = self.last_persist.map_or(true, |last| {
            now.saturating_duration_since(last) >= self.settings.control.persist_interval()
        });
        if due {
            self.last_persist = Some(now);
            if let Err(e) = self.db.save() {
                warn!("saving station database failed: {}", e);
            }
        }
    }

    fn flush_database(&mut self) {
        if let Some(run) = self.current.as_ref().filter(|r| r.purpose == Activity::Playback) {
            if run.station.update_count > 0 {
                self.db.upsert(run.station.clone());
            }
        }
        if self.db.is_dirty() {
            self.last_persist = Some(Instant::now());
            if let Err(e) = self.db.save() {
                warn!("saving station database failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{DemodEngine, RateConfig};
    use crate::metadata::DecoderInstance;
    use std::io;
    use std::path::Path;
    use std::thread;

    struct NoEngines;

    impl EngineFactory for NoEngines {
        fn create(&self) -> Result<Box<dyn DemodEngine>> {
            Err(RadioError::EngineUnavailable("no device".into()))
        }
    }

    struct NullSinks;

    impl SinkFactory for NullSinks {
        fn playback(&self, _rates: RateConfig) -> Result<Box<dyn PcmSink>> {
            Ok(Box::new(NullSink))
        }
        fn encoder(&self, _output: &Path, _rates: RateConfig) -> Result<Box<dyn PcmSink>> {
            Ok(Box::new(NullSink))
        }
        fn recording_extension(&self) -> &'static str {
            "raw"
        }
    }

    struct NoDecoder;

    impl DecoderSpawner for NoDecoder {
        fn spawn(&self) -> Result<Box<dyn DecoderInstance>> {
            Err(RadioError::DecoderUnavailable("none".into()))
        }
    }

    struct BrokenEncoder;

    impl PcmSink for BrokenEncoder {
        fn write(&mut self, _data: &[u8]) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "encoder gone"))
        }
        fn is_alive(&mut self) -> bool {
            true
        }
        fn finish(self: Box<Self>, _grace: crate::sink::FinishGrace) -> Result<()> {
            Ok(())
        }
    }

    fn controller(dir: &Path) -> Controller {
        let backends = Backends {
            engines: Arc::new(NoEngines),
            sinks: Arc::new(NullSinks),
            decoder: Arc::new(NoDecoder),
        };
        Controller::new(Settings::default(), backends, StationDatabase::empty(dir.join("stations.json")))
    }

    fn failed_job(session_id: u64) -> Arc<RecordingJob> {
        let job = RecordingJob::new(session_id, PathBuf::from("take.raw"), Box::new(BrokenEncoder));
        assert!(job.write(&[0; 4]).is_err());
        job
    }

    fn recording_failures(radio: &mut Controller, over: Duration) -> usize {
        let start = Instant::now();
        let mut count = 0;
        while start.elapsed() < over {
            count += radio
                .poll(Instant::now())
                .iter()
                .filter(|n| matches!(n, Notification::RecordingFailed { .. }))
                .count();
            thread::sleep(Duration::from_millis(10));
        }
        count
    }

    #[test]
    fn failure_from_another_session_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut radio = controller(dir.path());
        let job = RecordingJob::new(7, PathBuf::from("take.raw"), Box::new(NullSink));
        radio.recording.install(Arc::clone(&job)).unwrap();

        radio
            .events_tx
            .send(WorkerEvent::RecordingFailed {
                session_id: 3,
                reason: "old encoder".into(),
            })
            .unwrap();
        assert_eq!(recording_failures(&mut radio, Duration::from_millis(100)), 0);
        assert!(radio.recording.current().is_some());
        assert!(job.is_active());
    }

    #[test]
    fn failure_of_current_job_is_reported_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut radio = controller(dir.path());
        let job = failed_job(7);
        radio.recording.install(Arc::clone(&job)).unwrap();

        radio
            .events_tx
            .send(WorkerEvent::RecordingFailed {
                session_id: 7,
                reason: "encoder gone".into(),
            })
            .unwrap();
        assert_eq!(recording_failures(&mut radio, Duration::from_millis(300)), 1);
        assert!(radio.recording.current().is_none());
    }

    #[test]
    fn failure_of_retired_job_is_reported_when_finalized() {
        let dir = tempfile::tempdir().unwrap();
        let mut radio = controller(dir.path());
        let job = failed_job(7);
        job.finalize_in_background(ENCODER_GRACE, radio.events_tx.clone());
        assert_eq!(recording_failures(&mut radio, Duration::from_millis(300)), 1);
    }
}
