use std::fs::File;
use std::io::{self, BufWriter};
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use hound::{SampleFormat, WavSpec, WavWriter};
use tracing::{debug, warn};

use crate::config::{CommandSettings, CommandSpec, RecordingFormat};
use crate::engine::RateConfig;
use crate::error::{RadioError, Result};
use crate::pipe::{PipeWriter, WriteOutcome};
use crate::process;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FinishGrace {
    pub drain: Duration,
    pub term: Duration,
    pub kill: Duration,
}

pub const PLAYBACK_GRACE: FinishGrace = FinishGrace {
    drain: Duration::ZERO,
    term: Duration::from_secs(1),
    kill: Duration::from_millis(500),
};

pub const ENCODER_GRACE: FinishGrace = FinishGrace {
    drain: Duration::from_secs(3),
    term: Duration::from_secs(2),
    kill: Duration::from_millis(500),
};

/// Longest a single chunk may wait on the player.
pub const PLAYBACK_WRITE_TIMEOUT: Duration = Duration::from_secs(2);
/// Longest a single chunk may wait on an encoder. Short enough that the
/// engine's PCM pipe does not fill up behind it.
pub const ENCODER_WRITE_TIMEOUT: Duration = Duration::from_millis(250);

pub trait PcmSink: Send {
    fn write(&mut self, data: &[u8]) -> io::Result<()>;

    fn is_alive(&mut self) -> bool;

    fn finish(self: Box<Self>, grace: FinishGrace) -> Result<()>;
}

pub struct ProcessSink {
    name: &'static str,
    child: Child,
    stdin: Option<PipeWriter>,
    write_timeout: Duration,
}

impl ProcessSink {
    pub fn spawn(
        name: &'static str,
        command: &CommandSpec,
        vars: &[(&str, String)],
        write_timeout: Duration,
    ) -> Result<ProcessSink> {
        let program = process::find_program(&command.program)
            .ok_or_else(|| RadioError::consumer(name, format!("{} not found in PATH", command.program)))?;
        let args = command.expand(vars);
        debug!("spawning {} {} {:?}", name, program.display(), args);
        let mut child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(process::log_stdio(name))
            .spawn()
            .map_err(|e| RadioError::consumer(name, format!("{}: {}", program.display(), e)))?;
        let stdin = match child.stdin.take() {
            Some(stdin) => Some(PipeWriter::nonblocking(OwnedFd::from(stdin))?),
            None => None,
        };
        Ok(ProcessSink {
            name,
            child,
            stdin,
            write_timeout,
        })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }
}

impl PcmSink for ProcessSink {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let stdin = self
            .stdin
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "stdin closed"))?;
        match stdin.write_all_timeout(data, self.write_timeout)? {
            WriteOutcome::Complete => Ok(()),
            WriteOutcome::Stalled { written } => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!(
                    "{} stopped reading ({} of {} bytes taken in {:?})",
                    self.name,
                    written,
                    data.len(),
                    self.write_timeout
                ),
            )),
        }
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn finish(mut self: Box<Self>, grace: FinishGrace) -> Result<()> {
        drop(self.stdin.take());
        if !grace.drain.is_zero() && process::wait_timeout(&mut self.child, grace.drain) {
            return match self.child.try_wait() {
                Ok(Some(status)) if !status.success() => {
                    Err(RadioError::consumer(self.name, format!("exited with {}", status)))
                }
                _ => Ok(()),
            };
        }
        if !grace.drain.is_zero() {
            warn!("{} (pid {}) did not finish within {:?}", self.name, self.child.id(), grace.drain);
        }
        process::terminate(&mut self.child, grace.term, grace.kill);
        Ok(())
    }
}

/// In-process recorder writing a 16-bit stereo WAV file.
pub struct WavSink {
    writer: Option<WavWriter<BufWriter<File>>>,
    path: PathBuf,
}

impl WavSink {
    pub fn create(path: &Path, sample_rate: u32) -> Result<WavSink> {
        let spec = WavSpec {
            channels: 2,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let writer = WavWriter::create(path, spec).map_err(|e| RadioError::consumer("encoder", e))?;
        Ok(WavSink {
            writer: Some(writer),
            path: path.to_path_buf(),
        })
    }
}

impl PcmSink for WavSink {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "wav writer finalized"))?;
        for pair in data.chunks_exact(2) {
            writer
                .write_sample(i16::from_le_bytes([pair[0], pair[1]]))
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        }
        Ok(())
    }

    fn is_alive(&mut self) -> bool {
        self.writer.is_some()
    }

    fn finish(mut self: Box<Self>, _grace: FinishGrace) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            writer
                .finalize()
                .map_err(|e| RadioError::consumer("encoder", format!("{}: {}", self.path.display(), e)))?;
        }
        Ok(())
    }
}

pub struct NullSink;

impl PcmSink for NullSink {
    fn write(&mut self, _data: &[u8]) -> io::Result<()> {
        Ok(())
    }

    fn is_alive(&mut self) -> bool {
        true
    }

    fn finish(self: Box<Self>, _grace: FinishGrace) -> Result<()> {
        Ok(())
    }
}

pub trait SinkFactory: Send + Sync {
    fn playback(&self, rates: RateConfig) -> Result<Box<dyn PcmSink>>;

    fn encoder(&self, output: &Path, rates: RateConfig) -> Result<Box<dyn PcmSink>>;

    fn recording_extension(&self) -> &'static str;
}

pub struct CommandSinks {
    commands: CommandSettings,
    format: RecordingFormat,
}

impl CommandSinks {
    pub fn new(commands: CommandSettings, format: RecordingFormat) -> Self {
        CommandSinks { commands, format }
    }
}

pub fn audio_vars(rates: RateConfig) -> Vec<(&'static str, String)> {
    let rate = rates.audio_rate_hz;
    let khz = if rate % 1000 == 0 {
        (rate / 1000).to_string()
    } else {
        format!("{}", rate as f64 / 1000.0)
    };
    vec![("audio_rate", rate.to_string()), ("audio_rate_khz", khz)]
}

impl SinkFactory for CommandSinks {
    fn playback(&self, rates: RateConfig) -> Result<Box<dyn PcmSink>> {
        let sink = ProcessSink::spawn(
            "playback",
            &self.commands.playback,
            &audio_vars(rates),
            PLAYBACK_WRITE_TIMEOUT,
        )?;
        Ok(Box::new(sink))
    }

    fn encoder(&self, output: &Path, rates: RateConfig) -> Result<Box<dyn PcmSink>> {
        match self.format {
            RecordingFormat::Wav => Ok(Box::new(WavSink::create(output, rates.audio_rate_hz)?)),
            RecordingFormat::Mp3 => {
                let mut vars = audio_vars(rates);
                vars.push(("output", output.display().to_string()));
                let sink = ProcessSink::spawn("encoder", &self.commands.encoder, &vars, ENCODER_WRITE_TIMEOUT)?;
                Ok(Box::new(sink))
            }
        }
    }

    fn recording_extension(&self) -> &'static str {
        self.format.extension()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Instant;

    #[test]
    fn wav_sink_writes_stereo_samples() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("take.wav");
        let mut sink: Box<dyn PcmSink> = Box::new(WavSink::create(&path, 48_000).unwrap());
        let frames: Vec<u8> = [100i16, -100, 32767, -32768]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        sink.write(&frames).unwrap();
        sink.finish(ENCODER_GRACE).unwrap();

        let mut reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().channels, 2);
        assert_eq!(reader.spec().sample_rate, 48_000);
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![100, -100, 32767, -32768]);
    }

    #[test]
    fn process_sink_passes_bytes_through_cat() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.raw");
        let spec = CommandSpec::new("/bin/sh", &["-c", "cat > {output}"]);
        let vars = vec![("output", out.display().to_string())];
        let mut sink: Box<dyn PcmSink> =
            Box::new(ProcessSink::spawn("encoder", &spec, &vars, ENCODER_WRITE_TIMEOUT).unwrap());
        assert!(sink.is_alive());
        sink.write(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        sink.finish(ENCODER_GRACE).unwrap();
        assert_eq!(fs::read(&out).unwrap(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn process_sink_reports_exit() {
        let spec = CommandSpec::new("/bin/sh", &["-c", "exit 0"]);
        let mut sink = ProcessSink::spawn("playback", &spec, &[], PLAYBACK_WRITE_TIMEOUT).unwrap();
        assert!(process::wait_timeout(&mut sink.child, Duration::from_secs(2)));
        assert!(!sink.is_alive());
        let big = vec![0u8; 1 << 20];
        assert!(sink.write(&big).is_err());
    }

    #[test]
    fn stuck_consumer_times_out_instead_of_blocking() {
        let spec = CommandSpec::new("/bin/sh", &["-c", "sleep 20"]);
        let mut sink = ProcessSink::spawn("encoder", &spec, &[], ENCODER_WRITE_TIMEOUT).unwrap();
        let chunk = vec![0u8; 4096];
        let start = Instant::now();
        let err = (0..64).find_map(|_| sink.write(&chunk).err()).unwrap();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(sink.is_alive());
        Box::new(sink).finish(PLAYBACK_GRACE).unwrap();
    }

    #[test]
    fn missing_program_is_consumer_failure() {
        let sinks = CommandSinks::new(
            CommandSettings {
                playback: CommandSpec::new("no-such-player-xyz", &[]),
                ..CommandSettings::default()
            },
            RecordingFormat::Mp3,
        );
        let err = sinks.playback(RateConfig::default()).err();
        assert!(matches!(err, Some(RadioError::ConsumerFailure { consumer: "playback", .. })));
    }

    #[test]
    fn audio_rate_in_khz() {
        let vars = audio_vars(RateConfig::default());
        assert!(vars.contains(&("audio_rate_khz", "48".to_string())));
        let odd = audio_vars(RateConfig {
            demod_rate_hz: 220_500,
            audio_rate_hz: 44_100,
        });
        assert!(odd.contains(&("audio_rate_khz", "44.1".to_string())));
    }
}
