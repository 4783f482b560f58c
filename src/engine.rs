//! The demodulation engine seam.
//!
//! The receiver never does FM math itself. An engine takes tuning parameters
//! and writes interleaved S16LE stereo PCM into a pipe, plus optionally a
//! mono discriminator tap at the metadata decoder's rate into a second pipe.

use std::os::fd::AsRawFd;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::CommandSpec;
use crate::error::{RadioError, Result};
use crate::pipe::PipeWriter;
use crate::process;

pub const METADATA_TAP_RATE_HZ: u32 = 171_000;
pub const AUDIO_RATE_HZ: u32 = 48_000;
pub const DEFAULT_DEMOD_RATE_HZ: u32 = 240_000;
pub const MAX_RESAMPLER_FACTOR: u32 = 1000;

const DEEMPHASIS_TAU_US: u32 = 50;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateConfig {
    pub demod_rate_hz: u32,
    pub audio_rate_hz: u32,
}

impl Default for RateConfig {
    fn default() -> Self {
        RateConfig {
            demod_rate_hz: DEFAULT_DEMOD_RATE_HZ,
            audio_rate_hz: AUDIO_RATE_HZ,
        }
    }
}

impl RateConfig {
    pub fn audio_decimation(&self) -> Result<u32> {
        if self.demod_rate_hz == 0 || self.audio_rate_hz == 0 {
            return Err(RadioError::Config(format!(
                "rates must be non-zero (demod={} audio={})",
                self.demod_rate_hz, self.audio_rate_hz
            )));
        }
        if self.demod_rate_hz % self.audio_rate_hz != 0 {
            return Err(RadioError::Config(format!(
                "demod_rate={} is not a multiple of audio_rate={}",
                self.demod_rate_hz, self.audio_rate_hz
            )));
        }
        Ok(self.demod_rate_hz / self.audio_rate_hz)
    }

    /// Reduced (interpolation, decimation) pair taking the demodulator rate
    /// to `tap_rate_hz`.
    pub fn tap_resampling(&self, tap_rate_hz: u32) -> Result<(u32, u32)> {
        if self.demod_rate_hz == 0 || tap_rate_hz == 0 {
            return Err(RadioError::Config("tap resampling needs non-zero rates".into()));
        }
        let g = gcd(self.demod_rate_hz, tap_rate_hz);
        let interp = tap_rate_hz / g;
        let decim = self.demod_rate_hz / g;
        if interp > MAX_RESAMPLER_FACTOR || decim > MAX_RESAMPLER_FACTOR {
            return Err(RadioError::Config(format!(
                "tap {} Hz unreachable from {} Hz (factors {}/{})",
                tap_rate_hz, self.demod_rate_hz, interp, decim
            )));
        }
        Ok((interp, decim))
    }

    pub fn validate(&self, want_tap: bool) -> Result<()> {
        self.audio_decimation()?;
        if want_tap {
            self.tap_resampling(METADATA_TAP_RATE_HZ)?;
        }
        Ok(())
    }
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

#[derive(Clone, Debug, PartialEq)]
pub struct EngineConfig {
    pub center_freq_hz: u64,
    pub sample_rate_hz: u32,
    pub rf_bandwidth_hz: u32,
    pub ppm_correction: i32,
    pub gain_db: f64,
    pub rates: RateConfig,
    pub deemphasis: bool,
    pub device_args: String,
}

pub struct EngineOutputs {
    pub pcm: Arc<PipeWriter>,
    pub metadata_tap: Option<Arc<PipeWriter>>,
}

pub trait DemodEngine: Send {
    fn configure(&mut self, config: &EngineConfig) -> Result<()>;

    /// Apply a gain change without restarting. `false` means the engine
    /// cannot do that and needs a retune.
    fn set_gain(&mut self, gain_db: f64) -> bool;

    fn supports_metadata_tap(&self) -> bool;

    fn start(&mut self, outputs: EngineOutputs) -> Result<()>;

    fn stop(&mut self);

    /// Wait for the engine to finish after `stop`. Returns true when it did
    /// within `timeout`.
    fn wait(&mut self, timeout: Duration) -> bool;
}

pub trait EngineFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn DemodEngine>>;
}

/// Engine backed by an external demodulator command. Its stdout is the PCM
/// pipe; when the argument template mentions `{tap}` the tap pipe is passed
/// as `/dev/fd/N`.
pub struct ProcessEngine {
    command: CommandSpec,
    config: Option<EngineConfig>,
    child: Option<Child>,
}

impl ProcessEngine {
    pub fn new(command: CommandSpec) -> Self {
        ProcessEngine {
            command,
            config: None,
            child: None,
        }
    }
}

pub fn template_vars(config: &EngineConfig, tap_path: &str) -> Vec<(&'static str, String)> {
    vec![
        ("freq_hz", config.center_freq_hz.to_string()),
        ("freq_mhz", format!("{:.1}", config.center_freq_hz as f64 / 1e6)),
        ("gain_db", format!("{:.1}", config.gain_db)),
        ("demod_rate", config.rates.demod_rate_hz.to_string()),
        ("audio_rate", config.rates.audio_rate_hz.to_string()),
        ("sample_rate", config.sample_rate_hz.to_string()),
        ("ppm", config.ppm_correction.to_string()),
        ("bandwidth_hz", config.rf_bandwidth_hz.to_string()),
        ("device_args", config.device_args.clone()),
        (
            "deemphasis_us",
            if config.deemphasis { DEEMPHASIS_TAU_US } else { 0 }.to_string(),
        ),
        ("tap", tap_path.to_string()),
        ("tap_rate", METADATA_TAP_RATE_HZ.to_string()),
    ]
}

impl DemodEngine for ProcessEngine {
    fn configure(&mut self, config: &EngineConfig) -> Result<()> {
        self.config = Some(config.clone());
        Ok(())
    }

    fn set_gain(&mut self, _gain_db: f64) -> bool {
        false
    }

    fn supports_metadata_tap(&self) -> bool {
        self.command.uses_placeholder("tap")
    }

    fn start(&mut self, outputs: EngineOutputs) -> Result<()> {
        let config = self
            .config
            .as_ref()
            .ok_or_else(|| RadioError::InvalidState("engine started before configure".into()))?;
        let program = process::find_program(&self.command.program).ok_or_else(|| {
            RadioError::EngineUnavailable(format!("{} not found in PATH", self.command.program))
        })?;

        // Kept alive until the child has inherited it.
        let tap_fd = match &outputs.metadata_tap {
            Some(tap) if self.supports_metadata_tap() => Some(tap.inheritable_fd()?),
            _ => None,
        };
        let tap_path = tap_fd
            .as_ref()
            .map(|fd| format!("/dev/fd/{}", fd.as_raw_fd()))
            .unwrap_or_default();
        let args = self.command.expand(&template_vars(config, &tap_path));

        debug!("spawning engine {} {:?}", program.display(), args);
        let child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(outputs.pcm.to_stdio()?)
            .stderr(process::log_stdio("engine"))
            .spawn()
            .map_err(|e| RadioError::EngineUnavailable(format!("{}: {}", program.display(), e)))?;
        drop(tap_fd);
        // The child owns its duplicates now; our copies would hide its exit
        // from the readers.
        outputs.pcm.close();
        if let Some(tap) = outputs.metadata_tap.as_ref() {
            tap.close();
        }

        info!(
            "engine pid {} tuned to {:.1} MHz",
            child.id(),
            config.center_freq_hz as f64 / 1e6
        );
        self.child = Some(child);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(child) = self.child.as_ref() {
            process::send_sigterm(child);
        }
    }

    fn wait(&mut self, timeout: Duration) -> bool {
        let Some(mut child) = self.child.take() else {
            return true;
        };
        if process::wait_timeout(&mut child, timeout) {
            return true;
        }
        let _ = child.kill();
        process::wait_timeout(&mut child, Duration::from_millis(500))
    }
}

pub struct ProcessEngineFactory {
    command: CommandSpec,
}

impl ProcessEngineFactory {
    pub fn new(command: CommandSpec) -> Self {
        ProcessEngineFactory { command }
    }
}

impl EngineFactory for ProcessEngineFactory {
    fn create(&self) -> Result<Box<dyn DemodEngine>> {
        if process::find_program(&self.command.program).is_none() {
            return Err(RadioError::EngineUnavailable(format!(
                "{} not found in PATH",
                self.command.program
            )));
        }
        Ok(Box::new(ProcessEngine::new(self.command.clone())))
    }
}
