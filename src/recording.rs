use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use crossbeam_channel::Sender;
use tracing::{info, warn};

use crate::error::{RadioError, Result};
use crate::events::WorkerEvent;
use crate::sink::{FinishGrace, PcmSink};

/// An in-progress recording. Shared between the controller, which starts
/// and stops it, and the distributor, which feeds it.
pub struct RecordingJob {
    session_id: u64,
    output_path: PathBuf,
    started_at: DateTime<Local>,
    started: Instant,
    active: AtomicBool,
    bytes_in: AtomicU64,
    failure: Mutex<Option<String>>,
    failure_reported: AtomicBool,
    encoder: Mutex<Option<Box<dyn PcmSink>>>,
}

impl RecordingJob {
    pub fn new(session_id: u64, output_path: PathBuf, encoder: Box<dyn PcmSink>) -> Arc<RecordingJob> {
        Arc::new(RecordingJob {
            session_id,
            output_path,
            started_at: Local::now(),
            started: Instant::now(),
            active: AtomicBool::new(true),
            bytes_in: AtomicU64::new(0),
            failure: Mutex::new(None),
            failure_reported: AtomicBool::new(false),
            encoder: Mutex::new(Some(encoder)),
        })
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    pub fn started_at(&self) -> DateTime<Local> {
        self.started_at
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Flip the job inactive. Returns true for the call that actually did it.
    pub fn deactivate(&self) -> bool {
        self.active.swap(false, Ordering::AcqRel)
    }

    pub fn failure(&self) -> Option<String> {
        lock(&self.failure).clone()
    }

    /// True for the first caller only, so a failure is announced once.
    pub fn claim_failure_report(&self) -> bool {
        !self.failure_reported.swap(true, Ordering::AcqRel)
    }

    /// Feed unscaled PCM to the encoder. On failure the job deactivates
    /// itself and the reason is kept for the controller.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        if !self.is_active() {
            return Ok(());
        }
        let outcome = {
            let mut encoder = lock(&self.encoder);
            match encoder.as_mut() {
                None => Err("encoder already finalized".to_string()),
                Some(enc) => {
                    if enc.is_alive() {
                        enc.write(data).map_err(|e| e.to_string())
                    } else {
                        Err("encoder exited".to_string())
                    }
                }
            }
        };
        match outcome {
            Ok(()) => {
                self.bytes_in.fetch_add(data.len() as u64, Ordering::Relaxed);
                Ok(())
            }
            Err(reason) => {
                self.deactivate();
                *lock(&self.failure) = Some(reason.clone());
                Err(RadioError::consumer("encoder", reason))
            }
        }
    }

    pub fn finalize(&self, grace: FinishGrace) -> Result<()> {
        self.deactivate();
        let encoder = lock(&self.encoder).take();
        match encoder {
            Some(enc) => enc.finish(grace),
            None => Ok(()),
        }
    }

    /// Finalize on a `recording-finalize` thread and report the outcome as a
    /// [`WorkerEvent::RecordingFinalized`].
    pub fn finalize_in_background(self: &Arc<Self>, grace: FinishGrace, events: Sender<WorkerEvent>) {
        let job = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("recording-finalize".into())
            .spawn(move || {
                let result = job.finalize(grace);
                match &result {
                    Ok(()) => info!(
                        "recording {} finalized ({} bytes in)",
                        job.output_path.display(),
                        job.bytes_in()
                    ),
                    Err(e) => warn!("recording {} finalize failed: {}", job.output_path.display(), e),
                }
                let _ = events.send(WorkerEvent::RecordingFinalized {
                    job: Arc::clone(&job),
                    result: result.map_err(|e| e.to_string()),
                });
            });
        if let Err(e) = spawned {
            warn!("cannot spawn finalize thread: {}", e);
        }
    }
}

#[derive(Clone, Default)]
pub struct RecordingSlot {
    inner: Arc<Mutex<Option<Arc<RecordingJob>>>>,
}

impl RecordingSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, job: Arc<RecordingJob>) -> Result<()> {
        let mut slot = lock(&self.inner);
        if slot.is_some() {
            return Err(RadioError::InvalidState("a recording is already in progress".into()));
        }
        *slot = Some(job);
        Ok(())
    }

    pub fn current(&self) -> Option<Arc<RecordingJob>> {
        lock(&self.inner).clone()
    }

    pub fn take(&self) -> Option<Arc<RecordingJob>> {
        lock(&self.inner).take()
    }
}

/// `recording_<station>_<YYYYmmdd_HHMMSS>.<ext>`, keeping only
/// alphanumerics, `-` and `_` from the station name.
pub fn recording_file_name(station: &str, at: DateTime<Local>, extension: &str) -> String {
    let cleaned: String = station
        .trim()
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_'))
        .map(|c| if c == ' ' { '_' } else { c })
        .collect();
    let name = if cleaned.is_empty() { "unknown".to_string() } else { cleaned };
    format!("recording_{}_{}.{}", name, at.format("%Y%m%d_%H%M%S"), extension)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
