use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::engine::RateConfig;
use crate::error::Result;

pub const APP_DIR: &str = "pulse-fm-rx";
const SETTINGS_FILE: &str = "fm_radio_settings.json";
const STATION_DB_FILE: &str = "fm_stations_database.json";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BandPreset {
    pub id: &'static str,
    pub min_khz: u32,
    pub max_khz: u32,
    pub step_khz: u32,
}

pub const BAND_PRESETS: [BandPreset; 6] = [
    BandPreset { id: "worldwide", min_khz: 87_500, max_khz: 108_000, step_khz: 100 },
    BandPreset { id: "us_ca", min_khz: 87_900, max_khz: 107_900, step_khz: 200 },
    BandPreset { id: "japan", min_khz: 76_000, max_khz: 95_000, step_khz: 100 },
    BandPreset { id: "japan_wide", min_khz: 76_000, max_khz: 99_000, step_khz: 100 },
    BandPreset { id: "brazil", min_khz: 76_100, max_khz: 108_000, step_khz: 100 },
    BandPreset { id: "oirt", min_khz: 65_800, max_khz: 74_000, step_khz: 100 },
];

impl BandPreset {
    pub fn by_id(id: &str) -> Option<&'static BandPreset> {
        BAND_PRESETS.iter().find(|p| p.id == id)
    }

    pub fn min_mhz(&self) -> f64 {
        self.min_khz as f64 / 1000.0
    }

    pub fn max_mhz(&self) -> f64 {
        self.max_khz as f64 / 1000.0
    }

    pub fn contains_khz(&self, khz: u32) -> bool {
        khz >= self.min_khz && khz <= self.max_khz
    }

    pub fn channels_khz(&self) -> Vec<u32> {
        (self.min_khz..=self.max_khz)
            .step_by(self.step_khz.max(1) as usize)
            .collect()
    }
}

pub fn mhz_to_khz(freq_mhz: f64) -> u32 {
    (freq_mhz * 1000.0).round().max(0.0) as u32
}

/// An external program plus its argument template. Arguments may carry
/// `{name}` placeholders filled in by the component that spawns it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: &str, args: &[&str]) -> Self {
        CommandSpec {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    pub fn uses_placeholder(&self, name: &str) -> bool {
        let needle = format!("{{{}}}", name);
        self.args.iter().any(|a| a.contains(&needle))
    }

    pub fn expand(&self, vars: &[(&str, String)]) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                let mut out = arg.clone();
                for (key, value) in vars {
                    out = out.replace(&format!("{{{}}}", key), value);
                }
                out
            })
            .collect()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FmBandSettings {
    pub preset: String,
}

impl Default for FmBandSettings {
    fn default() -> Self {
        FmBandSettings {
            preset: "worldwide".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SdrSettings {
    #[serde(alias = "osmosdr_args")]
    pub device_args: String,
    pub ppm: i32,
    pub rf_bandwidth_hz: u32,
    pub gain_db: f64,
}

pub const MAX_GAIN_DB: f64 = 49.6;

impl Default for SdrSettings {
    fn default() -> Self {
        SdrSettings {
            device_args: "numchan=1 rtl=0".to_string(),
            ppm: 0,
            rf_bandwidth_hz: 200_000,
            gain_db: 42.1,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSettings {
    pub demod_rate_hz: u32,
    pub audio_rate_hz: u32,
    pub enable_deemphasis: bool,
    pub volume: u8,
}

impl Default for AudioSettings {
    fn default() -> Self {
        AudioSettings {
            demod_rate_hz: crate::engine::DEFAULT_DEMOD_RATE_HZ,
            audio_rate_hz: crate::engine::AUDIO_RATE_HZ,
            enable_deemphasis: true,
            volume: 100,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RdsSettings {
    pub enable_updates_during_playback: bool,
    /// Seconds without a decoded record before the decoder instance is
    /// considered wedged and replaced.
    pub update_interval_s: u32,
}

impl Default for RdsSettings {
    fn default() -> Self {
        RdsSettings {
            enable_updates_during_playback: true,
            update_interval_s: 30,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpectrumSettings {
    pub enabled: bool,
    pub max_hz: u32,
    pub ymin_dbfs: f32,
    pub ymax_dbfs: f32,
    pub time_smoothing_alpha: f32,
    pub freq_smoothing_bins: u32,
    pub fps: u32,
    pub corr_points: usize,
}

impl Default for SpectrumSettings {
    fn default() -> Self {
        SpectrumSettings {
            enabled: true,
            max_hz: 16_000,
            ymin_dbfs: -90.0,
            ymax_dbfs: 0.0,
            time_smoothing_alpha: 0.25,
            freq_smoothing_bins: 1,
            fps: 66,
            corr_points: 256,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingFormat {
    Mp3,
    Wav,
}

impl RecordingFormat {
    pub fn extension(self) -> &'static str {
        match self {
            RecordingFormat::Mp3 => "mp3",
            RecordingFormat::Wav => "wav",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingSettings {
    /// Relative paths resolve against the data directory.
    pub output_dir: PathBuf,
    pub format: RecordingFormat,
}

impl Default for RecordingSettings {
    fn default() -> Self {
        RecordingSettings {
            output_dir: PathBuf::from("recordings"),
            format: RecordingFormat::Mp3,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandSettings {
    pub engine: CommandSpec,
    pub playback: CommandSpec,
    pub encoder: CommandSpec,
    pub decoder: CommandSpec,
}

impl Default for CommandSettings {
    fn default() -> Self {
        CommandSettings {
            // rtl_fm emits the composite signal at the decoder rate; tee hands
            // a copy to the tap and sox turns the rest into playback PCM.
            engine: CommandSpec::new(
                "sh",
                &[
                    "-c",
                    "exec rtl_fm -M fm -f {freq_hz} -s {tap_rate} -g {gain_db} -p {ppm} - \
                     | tee {tap} \
                     | sox -t raw -e signed -b 16 -c 1 -r {tap_rate} - \
                       -t raw -e signed -b 16 -c 2 -r {audio_rate} - sinc -15k",
                ],
            ),
            playback: CommandSpec::new(
                "play",
                &[
                    "-t", "raw", "-r", "{audio_rate}", "-e", "signed", "-b", "16", "-c", "2", "-V1", "-q",
                    "--buffer", "8192", "-",
                ],
            ),
            encoder: CommandSpec::new(
                "lame",
                &[
                    "--quiet",
                    "-r",
                    "--signed",
                    "--little-endian",
                    "--bitwidth",
                    "16",
                    "-s",
                    "{audio_rate_khz}",
                    "-m",
                    "j",
                    "--cbr",
                    "-b",
                    "192",
                    "-q",
                    "2",
                    "-",
                    "{output}",
                ],
            ),
            decoder: CommandSpec::new("redsea", &["-r", "{tap_rate}", "-E"]),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlSettings {
    pub gain_debounce_ms: u64,
    pub stop_timeout_ms: u64,
    pub scan_dwell_ms: u64,
    pub persist_interval_ms: u64,
}

impl Default for ControlSettings {
    fn default() -> Self {
        ControlSettings {
            gain_debounce_ms: 1000,
            stop_timeout_ms: 3000,
            scan_dwell_ms: 5000,
            persist_interval_ms: 5000,
        }
    }
}

impl ControlSettings {
    pub fn gain_debounce(&self) -> Duration {
        Duration::from_millis(self.gain_debounce_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn scan_dwell(&self) -> Duration {
        Duration::from_millis(self.scan_dwell_ms)
    }

    pub fn persist_interval(&self) -> Duration {
        Duration::from_millis(self.persist_interval_ms)
    }
}

/// Persisted user settings. Every group and field falls back to its default,
/// so a partial file merges with the built-in values.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub fm_band: FmBandSettings,
    pub sdr: SdrSettings,
    pub audio: AudioSettings,
    pub rds: RdsSettings,
    pub spectrum: SpectrumSettings,
    pub recording: RecordingSettings,
    pub commands: CommandSettings,
    pub control: ControlSettings,
}

impl Settings {
    /// Read settings from `path`. A missing file yields defaults; an
    /// unreadable one is logged and also yields defaults.
    pub fn load(path: &Path) -> Settings {
        let mut settings = match fs::read_to_string(path) {
            Ok(text) => match serde_json::from_str::<Settings>(&text) {
                Ok(s) => s,
                Err(e) => {
                    warn!("ignoring malformed settings file {}: {}", path.display(), e);
                    Settings::default()
                }
            },
            Err(e) => {
                debug!("no settings at {}: {}", path.display(), e);
                Settings::default()
            }
        };
        settings.sanitize();
        settings
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text)?;
        Ok(())
    }

    pub fn sanitize(&mut self) {
        if BandPreset::by_id(&self.fm_band.preset).is_none() {
            warn!("unknown band preset {:?}, using worldwide", self.fm_band.preset);
            self.fm_band.preset = "worldwide".to_string();
        }

        self.sdr.gain_db = self.sdr.gain_db.clamp(0.0, MAX_GAIN_DB);
        self.audio.volume = self.audio.volume.min(100);
        self.rds.update_interval_s = self.rds.update_interval_s.clamp(5, 600);

        let sp = &mut self.spectrum;
        sp.max_hz = sp.max_hz.clamp(1000, 24_000);
        sp.fps = sp.fps.clamp(10, 120);
        sp.corr_points = sp.corr_points.clamp(64, 2048);
        if !sp.time_smoothing_alpha.is_finite() {
            sp.time_smoothing_alpha = 0.25;
        }
        sp.time_smoothing_alpha = sp.time_smoothing_alpha.clamp(0.0, 1.0);
        sp.freq_smoothing_bins = sp.freq_smoothing_bins.min(10);
        if !(sp.ymax_dbfs > sp.ymin_dbfs) {
            sp.ymin_dbfs = -90.0;
            sp.ymax_dbfs = 0.0;
        }
    }

    pub fn band(&self) -> &'static BandPreset {
        BandPreset::by_id(&self.fm_band.preset).unwrap_or(&BAND_PRESETS[0])
    }

    pub fn rates(&self) -> RateConfig {
        RateConfig {
            demod_rate_hz: self.audio.demod_rate_hz,
            audio_rate_hz: self.audio.audio_rate_hz,
        }
    }

    pub fn recording_dir(&self) -> PathBuf {
        if self.recording.output_dir.is_absolute() {
            self.recording.output_dir.clone()
        } else {
            data_dir().join(&self.recording.output_dir)
        }
    }
}

pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

pub fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

pub fn settings_path() -> PathBuf {
    config_dir().join(SETTINGS_FILE)
}

pub fn station_db_path() -> PathBuf {
    data_dir().join(STATION_DB_FILE)
}

pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}
