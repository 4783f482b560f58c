//! Audio spectrum and stereo image of the decoded PCM, for display.

use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rustfft::{num_complex::Complex, Fft, FftPlanner};
use tracing::debug;

use crate::config::SpectrumSettings;
use crate::distributor::VisualizationBuffer;
use crate::session::Liveness;

pub const FFT_SIZE: usize = 1024;
pub const SPECTRUM_BINS: usize = FFT_SIZE / 2;

const IDLE_WAIT: Duration = Duration::from_millis(20);
const MIN_FRAME_SLEEP: Duration = Duration::from_millis(5);
const SILENCE_RMS: f32 = 1e-6;
const EPS: f32 = 1e-12;

#[derive(Clone, Debug, PartialEq)]
pub struct SpectrumParams {
    pub sample_rate_hz: u32,
    pub max_hz: u32,
    pub ymin_dbfs: f32,
    pub ymax_dbfs: f32,
    pub time_alpha: f32,
    pub freq_smoothing_passes: u32,
    pub corr_points: usize,
    pub fps: u32,
}

impl SpectrumParams {
    pub fn from_settings(settings: &SpectrumSettings, sample_rate_hz: u32) -> Self {
        SpectrumParams {
            sample_rate_hz,
            max_hz: settings.max_hz,
            ymin_dbfs: settings.ymin_dbfs,
            ymax_dbfs: settings.ymax_dbfs,
            time_alpha: settings.time_smoothing_alpha,
            freq_smoothing_passes: settings.freq_smoothing_bins,
            corr_points: settings.corr_points,
            fps: settings.fps,
        }
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps.max(1) as f64)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SpectrumSnapshot {
    pub freqs_hz: Vec<f32>,
    pub left_dbfs: Vec<f32>,
    pub right_dbfs: Vec<f32>,
    /// -1 (out of phase) to 1 (mono). 0 when either channel is silent.
    pub correlation: f32,
    pub balance_db: f32,
    /// Decimated (left, right) sample pairs for a goniometer plot.
    pub points: Vec<(f32, f32)>,
}

pub fn blackman(n: usize) -> Vec<f32> {
    if n < 2 {
        return vec![1.0; n];
    }
    let m = (n - 1) as f32;
    (0..n)
        .map(|i| {
            let x = 2.0 * std::f32::consts::PI * i as f32 / m;
            0.42 - 0.5 * x.cos() + 0.08 * (2.0 * x).cos()
        })
        .collect()
}

pub struct SpectrumAnalyzer {
    params: SpectrumParams,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    reference: f32,
    smooth_left: Vec<f32>,
    smooth_right: Vec<f32>,
}

impl SpectrumAnalyzer {
    pub fn new(params: SpectrumParams) -> Self {
        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(FFT_SIZE);
        let window = blackman(FFT_SIZE);
        let coherent_gain = window.iter().sum::<f32>() / FFT_SIZE as f32;
        SpectrumAnalyzer {
            fft,
            window,
            reference: coherent_gain * (FFT_SIZE as f32 / 2.0),
            smooth_left: vec![params.ymin_dbfs; SPECTRUM_BINS],
            smooth_right: vec![params.ymin_dbfs; SPECTRUM_BINS],
            params,
        }
    }

    /// Analyze two consecutive PCM chunks. Short input is zero-padded to
    /// the FFT size; empty input gives nothing.
    pub fn analyze(&mut self, first: &[u8], second: &[u8]) -> Option<SpectrumSnapshot> {
        let (mut left, mut right) = split_channels(first, second, FFT_SIZE);
        if left.is_empty() {
            return None;
        }
        remove_dc(&mut left);
        remove_dc(&mut right);

        let mut db_left = self.dbfs(&left);
        let mut db_right = self.dbfs(&right);
        smooth_frequency(&mut db_left, self.params.freq_smoothing_passes);
        smooth_frequency(&mut db_right, self.params.freq_smoothing_passes);

        let alpha = self.params.time_alpha;
        for (s, d) in self.smooth_left.iter_mut().zip(&db_left) {
            *s = alpha * d + (1.0 - alpha) * *s;
        }
        for (s, d) in self.smooth_right.iter_mut().zip(&db_right) {
            *s = alpha * d + (1.0 - alpha) * *s;
        }

        let ymin = self.params.ymin_dbfs;
        let ymax = self.params.ymax_dbfs.min(0.0).max(ymin);
        let bin_hz = self.params.sample_rate_hz as f32 / FFT_SIZE as f32;
        let shown = (0..SPECTRUM_BINS)
            .take_while(|&k| k as f32 * bin_hz <= self.params.max_hz as f32)
            .count();

        let stereo = stereo_correlation(&left, &right, self.params.corr_points);
        Some(SpectrumSnapshot {
            freqs_hz: (0..shown).map(|k| k as f32 * bin_hz).collect(),
            left_dbfs: self.smooth_left[..shown].iter().map(|v| v.clamp(ymin, ymax)).collect(),
            right_dbfs: self.smooth_right[..shown].iter().map(|v| v.clamp(ymin, ymax)).collect(),
            correlation: stereo.correlation,
            balance_db: stereo.balance_db,
            points: stereo.points,
        })
    }

    fn dbfs(&self, channel: &[f32]) -> Vec<f32> {
        let mut buf: Vec<Complex<f32>> = (0..FFT_SIZE)
            .map(|i| Complex::new(channel.get(i).copied().unwrap_or(0.0) * self.window[i], 0.0))
            .collect();
        self.fft.process(&mut buf);
        buf[..SPECTRUM_BINS]
            .iter()
            .map(|c| 20.0 * (c.norm() / (self.reference + EPS) + EPS).log10())
            .collect()
    }
}

fn split_channels(first: &[u8], second: &[u8], frames: usize) -> (Vec<f32>, Vec<f32>) {
    let mut left = Vec::with_capacity(frames);
    let mut right = Vec::with_capacity(frames);
    let samples = first
        .chunks_exact(4)
        .chain(second.chunks_exact(4))
        .take(frames);
    for frame in samples {
        left.push(i16::from_le_bytes([frame[0], frame[1]]) as f32 / 32768.0);
        right.push(i16::from_le_bytes([frame[2], frame[3]]) as f32 / 32768.0);
    }
    (left, right)
}

fn remove_dc(channel: &mut [f32]) {
    if channel.is_empty() {
        return;
    }
    let mean = channel.iter().sum::<f32>() / channel.len() as f32;
    for v in channel.iter_mut() {
        *v -= mean;
    }
}

/// Repeated [0.25, 0.5, 0.25] passes over the interior bins.
fn smooth_frequency(values: &mut [f32], passes: u32) {
    if values.len() < 3 {
        return;
    }
    for _ in 0..passes {
        let prev = values.to_vec();
        for i in 1..values.len() - 1 {
            values[i] = 0.25 * prev[i - 1] + 0.5 * prev[i] + 0.25 * prev[i + 1];
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct StereoImage {
    pub correlation: f32,
    pub balance_db: f32,
    pub points: Vec<(f32, f32)>,
}

/// Correlation and balance over `points` evenly decimated samples.
pub fn stereo_correlation(left: &[f32], right: &[f32], points: usize) -> StereoImage {
    let len = left.len().min(right.len());
    let step = (len / points.max(1)).max(1);
    let pairs: Vec<(f32, f32)> = (0..len)
        .step_by(step)
        .take(points.max(1))
        .map(|i| (left[i], right[i]))
        .collect();
    if pairs.is_empty() {
        return StereoImage {
            correlation: 0.0,
            balance_db: 0.0,
            points: pairs,
        };
    }

    let n = pairs.len() as f32;
    let rms_l = (pairs.iter().map(|(l, _)| l * l).sum::<f32>() / n + EPS).sqrt();
    let rms_r = (pairs.iter().map(|(_, r)| r * r).sum::<f32>() / n + EPS).sqrt();
    let balance_db = 20.0 * ((rms_l + EPS) / (rms_r + EPS)).log10();
    let correlation = if rms_l < SILENCE_RMS || rms_r < SILENCE_RMS {
        0.0
    } else {
        let cross = pairs.iter().map(|(l, r)| l * r).sum::<f32>() / n;
        (cross / (rms_l * rms_r)).clamp(-1.0, 1.0)
    };
    StereoImage {
        correlation,
        balance_db,
        points: pairs,
    }
}

/// Holds the newest unpublished frame. Older frames are replaced, and
/// [`FrameSlot::take_due`] hands out at most one frame per interval.
pub struct FrameSlot {
    interval: Duration,
    state: Mutex<SlotState>,
}

struct SlotState {
    pending: Option<Arc<SpectrumSnapshot>>,
    last_emit: Option<Instant>,
}

impl FrameSlot {
    pub fn new(fps: u32) -> Self {
        FrameSlot {
            interval: Duration::from_secs_f64(1.0 / fps.max(1) as f64),
            state: Mutex::new(SlotState {
                pending: None,
                last_emit: None,
            }),
        }
    }

    pub fn publish(&self, snapshot: Arc<SpectrumSnapshot>) {
        self.lock().pending = Some(snapshot);
    }

    pub fn take_due(&self, now: Instant) -> Option<Arc<SpectrumSnapshot>> {
        let mut state = self.lock();
        if let Some(last) = state.last_emit {
            if now.saturating_duration_since(last) < self.interval {
                return None;
            }
        }
        let frame = state.pending.take()?;
        state.last_emit = Some(now);
        Some(frame)
    }

    pub fn clear(&self) {
        self.lock().pending = None;
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub fn spawn_visualization(
    liveness: Liveness,
    buffer: Arc<VisualizationBuffer>,
    slot: Arc<FrameSlot>,
    params: SpectrumParams,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new().name("spectrum".into()).spawn(move || {
        let frame_sleep = params.frame_interval().max(MIN_FRAME_SLEEP);
        let mut analyzer = SpectrumAnalyzer::new(params);
        while liveness.is_alive() {
            let Some((first, second)) = buffer.take_pair() else {
                thread::sleep(IDLE_WAIT);
                continue;
            };
            if let Some(snapshot) = analyzer.analyze(&first, &second) {
                slot.publish(Arc::new(snapshot));
            }
            thread::sleep(frame_sleep);
        }
        buffer.clear();
        debug!("spectrum worker for session {} exited", liveness.session_id());
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> SpectrumParams {
        SpectrumParams {
            sample_rate_hz: 48_000,
            max_hz: 24_000,
            ymin_dbfs: -90.0,
            ymax_dbfs: 0.0,
            time_alpha: 1.0,
            freq_smoothing_passes: 0,
            corr_points: 256,
            fps: 66,
        }
    }

    fn tone(freq: f32, amp: f32, right_sign: f32, frames: usize) -> Vec<u8> {
        (0..frames)
            .flat_map(|i| {
                let v = amp * (2.0 * std::f32::consts::PI * freq * i as f32 / 48_000.0).sin();
                let l = (v * 32767.0) as i16;
                let r = (right_sign * v * 32767.0) as i16;
                l.to_le_bytes().into_iter().chain(r.to_le_bytes())
            })
            .collect()
    }

    #[test]
    fn blackman_matches_reference_shape() {
        let w = blackman(1024);
        assert!(w[0].abs() < 1e-6);
        assert!(w[1023].abs() < 1e-6);
        let peak = w.iter().cloned().fold(f32::MIN, f32::max);
        assert!((peak - 1.0).abs() < 1e-3);
    }

    #[test]
    fn full_scale_tone_peaks_near_zero_dbfs() {
        // 46.875 Hz per bin, so 3000 Hz sits on bin 64.
        let pcm = tone(3000.0, 1.0, 1.0, FFT_SIZE);
        let (a, b) = pcm.split_at(pcm.len() / 2);
        let mut analyzer = SpectrumAnalyzer::new(params());
        let snap = analyzer.analyze(a, b).unwrap();
        assert_eq!(snap.left_dbfs.len(), SPECTRUM_BINS);
        let (peak_bin, peak) = snap
            .left_dbfs
            .iter()
            .enumerate()
            .fold((0, f32::MIN), |acc, (i, &v)| if v > acc.1 { (i, v) } else { acc });
        assert_eq!(peak_bin, 64);
        assert!(peak > -1.0 && peak <= 0.0, "peak {}", peak);
        assert!(snap.left_dbfs[300] < -60.0);
    }

    #[test]
    fn max_hz_limits_reported_bins() {
        let mut p = params();
        p.max_hz = 16_000;
        let pcm = tone(1000.0, 0.5, 1.0, FFT_SIZE);
        let (a, b) = pcm.split_at(pcm.len() / 2);
        let snap = SpectrumAnalyzer::new(p).analyze(a, b).unwrap();
        assert!(snap.freqs_hz.last().copied().unwrap() <= 16_000.0);
        assert_eq!(snap.freqs_hz.len(), snap.right_dbfs.len());
    }

    #[test]
    fn correlation_tracks_phase() {
        let pcm = tone(1000.0, 0.5, 1.0, FFT_SIZE);
        let (l, r) = split_channels(&pcm, &[], FFT_SIZE);
        let mono = stereo_correlation(&l, &r, 256);
        assert!(mono.correlation > 0.99);
        assert!(mono.balance_db.abs() < 0.1);
        assert_eq!(mono.points.len(), 256);

        let pcm = tone(1000.0, 0.5, -1.0, FFT_SIZE);
        let (l, r) = split_channels(&pcm, &[], FFT_SIZE);
        assert!(stereo_correlation(&l, &r, 256).correlation < -0.99);
    }

    #[test]
    fn silent_channel_has_zero_correlation() {
        let l = vec![0.5f32; 512];
        let r = vec![0.0f32; 512];
        assert_eq!(stereo_correlation(&l, &r, 64).correlation, 0.0);
    }

    #[test]
    fn frequency_smoothing_spreads_a_spike() {
        let mut v = vec![0.0, 0.0, 4.0, 0.0, 0.0];
        smooth_frequency(&mut v, 1);
        assert_eq!(v, vec![0.0, 1.0, 2.0, 1.0, 0.0]);
    }

    #[test]
    fn frame_slot_keeps_newest_and_paces_output() {
        let slot = FrameSlot::new(10);
        let frame = |c: f32| {
            Arc::new(SpectrumSnapshot {
                freqs_hz: vec![],
                left_dbfs: vec![],
                right_dbfs: vec![],
                correlation: c,
                balance_db: 0.0,
                points: vec![],
            })
        };
        let t0 = Instant::now();
        slot.publish(frame(0.1));
        slot.publish(frame(0.2));
        assert_eq!(slot.take_due(t0).unwrap().correlation, 0.2);
        assert!(slot.take_due(t0).is_none());
        slot.publish(frame(0.3));
        assert!(slot.take_due(t0 + Duration::from_millis(50)).is_none());
        assert_eq!(slot.take_due(t0 + Duration::from_millis(100)).unwrap().correlation, 0.3);
    }
}
