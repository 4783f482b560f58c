use std::borrow::Cow;
use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crossbeam_channel::Sender;
use ringbuf::{HeapRb, Rb};
use tracing::{debug, info, warn};

use crate::events::WorkerEvent;
use crate::pipe::{PipeReader, READ_TIMEOUT};
use crate::recording::RecordingSlot;
use crate::session::Liveness;
use crate::sink::{PcmSink, PLAYBACK_GRACE};

pub const FRAME_BYTES: usize = 4;
pub const CHUNK_BYTES: usize = 4096;
pub const VIS_BUFFER_CHUNKS: usize = 10;

pub fn aligned_len(len: usize) -> usize {
    len - len % FRAME_BYTES
}

/// Scale S16LE samples by `volume` percent. 100 passes the input through
/// untouched and 0 yields silence of the same length.
pub fn scale_volume(data: &[u8], volume: u8) -> Cow<'_, [u8]> {
    match volume {
        100 => Cow::Borrowed(data),
        0 => Cow::Owned(vec![0u8; data.len()]),
        v => {
            let factor = v as f32 / 100.0;
            let mut out = Vec::with_capacity(data.len());
            for pair in data.chunks_exact(2) {
                let sample = i16::from_le_bytes([pair[0], pair[1]]) as f32 * factor;
                let scaled = sample.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16;
                out.extend_from_slice(&scaled.to_le_bytes());
            }
            Cow::Owned(out)
        }
    }
}

#[derive(Clone, Debug)]
pub struct Volume(Arc<AtomicU8>);

impl Volume {
    pub fn new(percent: u8) -> Self {
        Volume(Arc::new(AtomicU8::new(percent.min(100))))
    }

    pub fn get(&self) -> u8 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set(&self, percent: u8) {
        self.0.store(percent.min(100), Ordering::Relaxed);
    }
}

/// Bounded chunk queue between the distributor and the visualization
/// worker. Pushing into a full queue evicts the oldest chunk.
pub struct VisualizationBuffer {
    ring: Mutex<HeapRb<Vec<u8>>>,
}

impl VisualizationBuffer {
    pub fn new(capacity: usize) -> Self {
        VisualizationBuffer {
            ring: Mutex::new(HeapRb::new(capacity.max(2))),
        }
    }

    pub fn push(&self, chunk: Vec<u8>) {
        self.lock().push_overwrite(chunk);
    }

    pub fn take_pair(&self) -> Option<(Vec<u8>, Vec<u8>)> {
        let mut ring = self.lock();
        if ring.len() < 2 {
            return None;
        }
        let first = ring.pop()?;
        let second = ring.pop()?;
        Some((first, second))
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, HeapRb<Vec<u8>>> {
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for VisualizationBuffer {
    fn default() -> Self {
        Self::new(VIS_BUFFER_CHUNKS)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DistributorExit {
    SessionStopped,
    PlaybackFailed,
    PcmEnded,
}

pub struct StreamDistributor {
    pub liveness: Liveness,
    pub reader: Arc<PipeReader>,
    pub playback: Box<dyn PcmSink>,
    pub recording: RecordingSlot,
    pub visualization: Option<Arc<VisualizationBuffer>>,
    pub volume: Volume,
    pub events: Sender<WorkerEvent>,
}

impl StreamDistributor {
    pub fn spawn(self) -> io::Result<JoinHandle<DistributorExit>> {
        thread::Builder::new()
            .name("distributor".into())
            .spawn(move || self.run())
    }

    pub fn run(mut self) -> DistributorExit {
        let session_id = self.liveness.session_id();
        debug!("distributor for session {} running", session_id);

        let exit = loop {
            if !self.liveness.is_alive() {
                break DistributorExit::SessionStopped;
            }
            let Some(mut chunk) = self.reader.read(CHUNK_BYTES, READ_TIMEOUT) else {
                if !self.reader.is_alive() && self.liveness.is_alive() {
                    warn!("session {} PCM stream ended", session_id);
                    let _ = self.events.send(WorkerEvent::PcmEnded { session_id });
                    break DistributorExit::PcmEnded;
                }
                continue;
            };
            chunk.truncate(aligned_len(chunk.len()));
            if chunk.is_empty() {
                continue;
            }

            let scaled = scale_volume(&chunk, self.volume.get());
            if let Err(e) = self.playback.write(&scaled) {
                warn!("playback write failed: {}", e);
                let _ = self.events.send(WorkerEvent::PlaybackFailed {
                    session_id,
                    reason: e.to_string(),
                });
                break DistributorExit::PlaybackFailed;
            }

            if let Some(job) = self.recording.current() {
                if job.session_id() == session_id && job.is_active() {
                    if let Err(e) = job.write(&chunk) {
                        warn!("recording stopped: {}", e);
                        let _ = self.events.send(WorkerEvent::RecordingFailed {
                            session_id,
                            reason: e.to_string(),
                        });
                    }
                }
            }

            if let Some(vis) = self.visualization.as_ref() {
                vis.push(chunk);
            }
        };

        if let Err(e) = self.playback.finish(PLAYBACK_GRACE) {
            debug!("playback shutdown: {}", e);
        }
        info!("distributor for session {} exited: {:?}", session_id, exit);
        exit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples(values: &[i16]) -> Vec<u8> {
        values.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn alignment_drops_partial_frames() {
        assert_eq!(aligned_len(4096), 4096);
        assert_eq!(aligned_len(4095), 4092);
        assert_eq!(aligned_len(3), 0);
    }

    #[test]
    fn full_volume_is_bit_identical() {
        let data = samples(&[1, -1, 32767, -32768]);
        assert!(matches!(scale_volume(&data, 100), Cow::Borrowed(_)));
        assert_eq!(&*scale_volume(&data, 100), &data[..]);
    }

    #[test]
    fn zero_volume_is_silence_of_same_length() {
        let data = samples(&[1000, -1000, 5, 7]);
        let out = scale_volume(&data, 0);
        assert_eq!(out.len(), data.len());
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn half_volume_rounds() {
        let input = samples(&[1001, -1001, 3, -32768]);
        let out = scale_volume(&input, 50);
        assert_eq!(&*out, &samples(&[501, -501, 2, -16384])[..]);
    }

    #[test]
    fn visualization_ring_evicts_oldest() {
        let buf = VisualizationBuffer::new(VIS_BUFFER_CHUNKS);
        for i in 0..12u8 {
            buf.push(vec![i]);
        }
        assert_eq!(buf.len(), VIS_BUFFER_CHUNKS);
        let (a, b) = buf.take_pair().unwrap();
        assert_eq!((a[0], b[0]), (2, 3));
    }

    #[test]
    fn visualization_needs_two_chunks() {
        let buf = VisualizationBuffer::default();
        buf.push(vec![1]);
        assert!(buf.take_pair().is_none());
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn volume_is_capped() {
        let v = Volume::new(250);
        assert_eq!(v.get(), 100);
        v.set(40);
        assert_eq!(v.get(), 40);
    }
}
