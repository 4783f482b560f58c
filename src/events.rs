use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::metadata::MetadataRecord;
use crate::recording::RecordingJob;
use crate::spectrum::SpectrumSnapshot;
use crate::station::StationState;

/// Reports from worker threads. Drained and handled by the controller on
/// the thread that calls `poll`.
pub enum WorkerEvent {
    PlaybackFailed { session_id: u64, reason: String },
    PcmEnded { session_id: u64 },
    RecordingFailed { session_id: u64, reason: String },
    RecordingFinalized {
        job: Arc<RecordingJob>,
        result: Result<(), String>,
    },
    Metadata {
        session_id: u64,
        generation: u64,
        record: MetadataRecord,
    },
    DecoderUnavailable { session_id: u64, reason: String },
}

#[derive(Clone, Debug)]
pub enum Notification {
    Tuned { freq_khz: u32, gain_db: f64 },
    TuneFailed { freq_khz: u32, reason: String },
    Stopped,
    StationChanged(StationState),
    GainChanged { gain_db: f64, applied_live: bool },
    RecordingStarted { path: PathBuf },
    RecordingProgress { path: PathBuf, bytes: u64, elapsed: Duration },
    RecordingStopped { path: PathBuf },
    RecordingSaved { path: PathBuf, bytes: u64 },
    RecordingFailed { reason: String },
    VisualizationFrame(Arc<SpectrumSnapshot>),
    PlaybackError { reason: String },
    MetadataUnavailable { reason: String },
    ScanProgress { freq_khz: u32, index: usize, total: usize },
    StationFound(StationState),
    ScanFinished { found: usize, cancelled: bool },
}
