//! Device session: the single owner of the radio at any instant.
//!
//! A session owns one engine and the pipes it writes into. Starting it
//! validates the rate plan before touching the hardware. Stopping it is
//! split in two: the liveness flag drops and the read ends close right
//! away, while the slow part (engine shutdown, closing write ends) runs on a
//! teardown thread that fires a [`StopCompletion`] when the device is free.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::engine::{DemodEngine, EngineConfig, EngineFactory, EngineOutputs, RateConfig};
use crate::error::Result;
use crate::pipe::{self, PipeReader, PipeWriter};

const ENGINE_WAIT: Duration = Duration::from_secs(2);

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Alive,
    Stopping,
}

/// One-shot event fired when a session's teardown has released the device.
#[derive(Clone, Default)]
pub struct StopCompletion {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopCompletion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fire(&self) {
        let (flag, cvar) = &*self.inner;
        *lock(flag) = true;
        cvar.notify_all();
    }

    pub fn is_fired(&self) -> bool {
        *lock(&self.inner.0)
    }

    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, cvar) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut fired = lock(flag);
        while !*fired {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            fired = match cvar.wait_timeout(fired, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SessionRequest {
    pub freq_hz: u64,
    pub gain_db: f64,
    pub rates: RateConfig,
    pub want_metadata_tap: bool,
    pub ppm_correction: i32,
    pub rf_bandwidth_hz: u32,
    pub deemphasis: bool,
    pub device_args: String,
}

impl SessionRequest {
    pub fn from_settings(settings: &Settings, freq_khz: u32, gain_db: f64, want_metadata_tap: bool) -> Self {
        SessionRequest {
            freq_hz: freq_khz as u64 * 1000,
            gain_db,
            rates: settings.rates(),
            want_metadata_tap,
            ppm_correction: settings.sdr.ppm,
            rf_bandwidth_hz: settings.sdr.rf_bandwidth_hz,
            deemphasis: settings.audio.enable_deemphasis,
            device_args: settings.sdr.device_args.clone(),
        }
    }

    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            center_freq_hz: self.freq_hz,
            sample_rate_hz: self.rates.demod_rate_hz,
            rf_bandwidth_hz: self.rf_bandwidth_hz,
            ppm_correction: self.ppm_correction,
            gain_db: self.gain_db,
            rates: self.rates,
            deemphasis: self.deemphasis,
            device_args: self.device_args.clone(),
        }
    }
}

struct TapChannel {
    reader: Arc<PipeReader>,
    writer: Arc<PipeWriter>,
}

struct SessionCore {
    id: u64,
    tuning_hz: u64,
    rates: RateConfig,
    state: Mutex<SessionState>,
    alive: AtomicBool,
    gain_bits: AtomicU64,
    engine: Mutex<Option<Box<dyn DemodEngine>>>,
    pcm_reader: Arc<PipeReader>,
    pcm_writer: Arc<PipeWriter>,
    tap: Option<TapChannel>,
    completion: StopCompletion,
}

#[derive(Clone)]
pub struct DeviceSession {
    core: Arc<SessionCore>,
}

#[derive(Clone)]
pub struct Liveness {
    core: Arc<SessionCore>,
}

impl Liveness {
    pub fn is_alive(&self) -> bool {
        self.core.alive.load(Ordering::Acquire)
    }

    pub fn session_id(&self) -> u64 {
        self.core.id
    }
}

impl DeviceSession {
    pub fn start(factory: &dyn EngineFactory, request: SessionRequest) -> Result<DeviceSession> {
        request.rates.validate(request.want_metadata_tap)?;

        let mut engine = factory.create()?;
        engine.configure(&request.engine_config())?;

        let (pcm_reader, pcm_writer) = pipe::open()?;
        let tap = if request.want_metadata_tap && engine.supports_metadata_tap() {
            let (reader, writer) = pipe::open()?;
            Some(TapChannel {
                reader: Arc::new(reader),
                writer: Arc::new(writer),
            })
        } else {
            None
        };

        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let core = Arc::new(SessionCore {
            id,
            tuning_hz: request.freq_hz,
            rates: request.rates,
            state: Mutex::new(SessionState::Starting),
            alive: AtomicBool::new(false),
            gain_bits: AtomicU64::new(request.gain_db.to_bits()),
            engine: Mutex::new(None),
            pcm_reader: Arc::new(pcm_reader),
            pcm_writer: Arc::new(pcm_writer),
            tap,
            completion: StopCompletion::new(),
        });
        debug!("session {} starting at {} Hz", id, request.freq_hz);

        let outputs = EngineOutputs {
            pcm: Arc::clone(&core.pcm_writer),
            metadata_tap: core.tap.as_ref().map(|t| Arc::clone(&t.writer)),
        };
        if let Err(e) = engine.start(outputs) {
            warn!("session {} failed to start: {}", id, e);
            core.close_pipes();
            *lock(&core.state) = SessionState::Idle;
            core.completion.fire();
            return Err(e);
        }

        *lock(&core.engine) = Some(engine);
        *lock(&core.state) = SessionState::Alive;
        core.alive.store(true, Ordering::Release);
        info!(
            "session {} alive at {:.1} MHz (tap: {})",
            id,
            request.freq_hz as f64 / 1e6,
            core.tap.is_some()
        );
        Ok(DeviceSession { core })
    }

    pub fn id(&self) -> u64 {
        self.core.id
    }

    pub fn tuning_hz(&self) -> u64 {
        self.core.tuning_hz
    }

    pub fn rates(&self) -> RateConfig {
        self.core.rates
    }

    pub fn gain_db(&self) -> f64 {
        f64::from_bits(self.core.gain_bits.load(Ordering::Relaxed))
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.core.state)
    }

    pub fn is_alive(&self) -> bool {
        self.core.alive.load(Ordering::Acquire)
    }

    pub fn liveness(&self) -> Liveness {
        Liveness {
            core: Arc::clone(&self.core),
        }
    }

    pub fn pcm_reader(&self) -> Arc<PipeReader> {
        Arc::clone(&self.core.pcm_reader)
    }

    pub fn metadata_tap(&self) -> Option<Arc<PipeReader>> {
        self.core.tap.as_ref().map(|t| Arc::clone(&t.reader))
    }

    pub fn completion(&self) -> StopCompletion {
        self.core.completion.clone()
    }

    /// Change gain on the running engine. Returns false when the engine
    /// needs a retune for it, or the session is no longer alive.
    pub fn set_gain_live(&self, gain_db: f64) -> bool {
        if !self.is_alive() {
            return false;
        }
        let mut engine = lock(&self.core.engine);
        let applied = engine.as_mut().map(|e| e.set_gain(gain_db)).unwrap_or(false);
        if applied {
            self.core.gain_bits.store(gain_db.to_bits(), Ordering::Relaxed);
            debug!("session {} gain {:.1} dB applied live", self.core.id, gain_db);
        }
        applied
    }

    /// Stop the session. Calling it again, from any thread, only returns the
    /// same completion event. `blocking` runs the teardown on the caller's
    /// thread and is meant for process exit.
    pub fn stop(&self, blocking: bool) -> StopCompletion {
        let core = &self.core;
        {
            let mut state = lock(&core.state);
            if matches!(*state, SessionState::Stopping | SessionState::Idle) {
                return core.completion.clone();
            }
            *state = SessionState::Stopping;
        }
        core.alive.store(false, Ordering::Release);
        core.pcm_reader.close();
        if let Some(tap) = core.tap.as_ref() {
            tap.reader.close();
        }
        debug!("session {} stopping", core.id);

        if blocking {
            core.teardown();
        } else {
            let bg = Arc::clone(core);
            let spawned = thread::Builder::new()
                .name("session-teardown".into())
                .spawn(move || bg.teardown());
            if let Err(e) = spawned {
                warn!("cannot spawn teardown thread ({}), tearing down inline", e);
                core.teardown();
            }
        }
        core.completion.clone()
    }
}

impl SessionCore {
    fn teardown(&self) {
        let engine = lock(&self.engine).take();
        if let Some(mut engine) = engine {
            engine.stop();
            if !engine.wait(ENGINE_WAIT) {
                warn!("session {} engine did not exit within {:?}", self.id, ENGINE_WAIT);
            }
        }
        self.close_pipes();
        *lock(&self.state) = SessionState::Idle;
        self.completion.fire();
        info!("session {} released the device", self.id);
    }

    fn close_pipes(&self) {
        self.pcm_reader.close();
        self.pcm_writer.close();
        if let Some(tap) = self.tap.as_ref() {
            tap.reader.close();
            tap.writer.close();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
