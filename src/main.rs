use std::env;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError};

use pulse_fm_rx::config::{self, Settings};
use pulse_fm_rx::station::StationDatabase;
use pulse_fm_rx::{logging, Backends, Controller, Notification};

const TICK: Duration = Duration::from_millis(50);

struct Options {
    verbosity: u8,
    settings: Option<PathBuf>,
    freq_mhz: Option<f64>,
    spectrum: bool,
}

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.iter().any(|a| a == "-h" || a == "--help") {
        print_usage();
        return Ok(());
    }
    let opts = parse_args(&args[1..])?;
    logging::init(opts.verbosity);

    let settings_path = opts.settings.unwrap_or_else(config::settings_path);
    let settings = front_end_settings(Settings::load(&settings_path), opts.spectrum);
    let db = StationDatabase::load(&config::station_db_path());
    let backends = Backends::from_settings(&settings);
    let mut radio = Controller::new(settings, backends, db);

    println!("Pulse FM receiver");
    println!("-----------------");
    println!("Type 'help' for commands.");
    println!();

    if let Some(freq) = opts.freq_mhz {
        if let Err(e) = radio.tune(freq) {
            println!("! {}", e);
        }
    }

    let input = spawn_stdin_reader()?;
    loop {
        match input.recv_timeout(TICK) {
            Ok(line) => {
                if !run_command(&mut radio, line.trim()) {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        for note in radio.poll(Instant::now()) {
            show(&note);
        }
    }

    radio.shutdown();
    for note in radio.poll(Instant::now()) {
        show(&note);
    }
    persist_settings(&radio, &settings_path);
    Ok(())
}

fn parse_args(args: &[String]) -> Result<Options> {
    let mut opts = Options {
        verbosity: 0,
        settings: None,
        freq_mhz: None,
        spectrum: false,
    };
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-v" => opts.verbosity += 1,
            "-vv" => opts.verbosity += 2,
            "--settings" => {
                i += 1;
                opts.settings = Some(PathBuf::from(
                    args.get(i).ok_or_else(|| anyhow!("missing settings path"))?,
                ));
            }
            "--freq" => {
                i += 1;
                opts.freq_mhz = Some(
                    args.get(i)
                        .ok_or_else(|| anyhow!("missing frequency"))?
                        .parse::<f64>()?,
                );
            }
            "--spectrum" => opts.spectrum = true,
            other => return Err(anyhow!("unknown arg: {}", other)),
        }
        i += 1;
    }
    Ok(opts)
}

fn spawn_stdin_reader() -> Result<Receiver<String>> {
    let (tx, rx) = crossbeam_channel::unbounded();
    thread::Builder::new().name("stdin".into()).spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    })?;
    Ok(rx)
}

fn run_command(radio: &mut Controller, line: &str) -> bool {
    let mut words = line.split_whitespace();
    let Some(cmd) = words.next() else {
        return true;
    };
    let arg = words.next();
    let result = match (cmd, arg) {
        ("quit" | "exit" | "q", _) => return false,
        ("help" | "?", _) => {
            print_commands();
            Ok(())
        }
        ("tune" | "t", Some(f)) => parse_num(f).and_then(|f| radio.tune(f).map_err(Into::into)),
        ("stop", _) => {
            radio.stop();
            Ok(())
        }
        ("gain" | "g", Some(g)) => parse_num(g).map(|g| radio.set_gain(g)),
        ("vol", Some(v)) => v
            .parse::<u8>()
            .map(|v| radio.set_volume(v))
            .map_err(|e| anyhow!("bad volume: {}", e)),
        ("rec", _) => radio.start_recording().map(|_| ()).map_err(Into::into),
        ("stoprec", _) => radio.stop_recording().map_err(Into::into),
        ("scan", _) => radio.scan().map_err(Into::into),
        ("probe", Some(f)) => parse_num(f).and_then(|f| radio.probe(f).map_err(Into::into)),
        ("cancel", _) => {
            radio.cancel_scan();
            Ok(())
        }
        ("rds", Some("on")) => {
            radio.set_metadata_updates(true);
            Ok(())
        }
        ("rds", Some("off")) => {
            radio.set_metadata_updates(false);
            Ok(())
        }
        ("stations", _) => {
            list_stations(radio);
            Ok(())
        }
        ("status", _) => {
            print_status(radio);
            Ok(())
        }
        _ => Err(anyhow!("unknown command: {} (try 'help')", line)),
    };
    if let Err(e) = result {
        println!("! {}", e);
    }
    true
}

fn parse_num(raw: &str) -> Result<f64> {
    raw.parse::<f64>().map_err(|e| anyhow!("bad number {:?}: {}", raw, e))
}

fn show(note: &Notification) {
    match note {
        Notification::Tuned { freq_khz, gain_db } => {
            println!("> {:.1} MHz, gain {:.1} dB", *freq_khz as f64 / 1000.0, gain_db)
        }
        Notification::TuneFailed { freq_khz, reason } => {
            println!("! cannot tune {:.1} MHz: {}", *freq_khz as f64 / 1000.0, reason)
        }
        Notification::Stopped => println!("> stopped"),
        Notification::StationChanged(st) => {
            let mut line = format!("> {}", st.display_name());
            if let Some(np) = st.now_playing() {
                line.push_str(&format!(" | {}", np));
            } else if let Some(rt) = st.radiotext.as_deref() {
                line.push_str(&format!(" | {}", rt));
            }
            if st.stereo {
                line.push_str(" [stereo]");
            }
            if st.traffic_announcement {
                line.push_str(" [TA]");
            }
            println!("{}", line);
        }
        Notification::GainChanged { gain_db, applied_live } => {
            if *applied_live {
                println!("> gain {:.1} dB", gain_db);
            } else {
                println!("> gain {:.1} dB (retune pending)", gain_db);
            }
        }
        Notification::RecordingStarted { path } => println!("> recording {}", path.display()),
        Notification::RecordingProgress { bytes, elapsed, .. } => {
            print!("\r  rec {:>4}s {:>8} KiB", elapsed.as_secs(), bytes / 1024);
            let _ = io::stdout().flush();
        }
        Notification::RecordingStopped { .. } => println!(),
        Notification::RecordingSaved { path, bytes } => {
            println!("> saved {} ({} KiB of audio)", path.display(), bytes / 1024)
        }
        Notification::RecordingFailed { reason } => println!("! recording failed: {}", reason),
        Notification::VisualizationFrame(frame) => {
            println!(
                "  corr {:+.2} bal {:+.1} dB peak L {:.0} dBFS R {:.0} dBFS",
                frame.correlation,
                frame.balance_db,
                frame.left_dbfs.iter().cloned().fold(f32::MIN, f32::max),
                frame.right_dbfs.iter().cloned().fold(f32::MIN, f32::max),
            )
        }
        Notification::PlaybackError { reason } => println!("! playback: {}", reason),
        Notification::MetadataUnavailable { reason } => println!("! RDS unavailable: {}", reason),
        Notification::ScanProgress { freq_khz, index, total } => {
            print!("\r  scanning {:.1} MHz ({}/{})", *freq_khz as f64 / 1000.0, index + 1, total);
            let _ = io::stdout().flush();
        }
        Notification::StationFound(st) => println!("\n> found {}", st.display_name()),
        Notification::ScanFinished { found, cancelled } => {
            let how = if *cancelled { "cancelled" } else { "finished" };
            println!("\n> scan {}, {} station(s)", how, found)
        }
    }
}

fn list_stations(radio: &Controller) {
    let stations = radio.database().stations_with_metadata();
    if stations.is_empty() {
        println!("no stations yet, try 'scan'");
        return;
    }
    for st in stations {
        println!(
            "  {:>6.1}  {:<8}  {}",
            st.freq,
            st.program_service.as_deref().unwrap_or(""),
            st.radiotext.as_deref().unwrap_or("")
        );
    }
}

fn print_status(radio: &Controller) {
    println!("activity: {:?}", radio.activity());
    if let Some(khz) = radio.current_freq_khz() {
        println!("frequency: {:.1} MHz", khz as f64 / 1000.0);
    }
    println!("gain: {:.1} dB  volume: {}%", radio.gain_db(), radio.volume());
    println!("rds updates: {}", if radio.metadata_updates() { "on" } else { "off" });
    println!("recording: {}", if radio.is_recording() { "yes" } else { "no" });
}

/// Frames would drown the prompt, so the terminal shows them only on request.
fn front_end_settings(mut settings: Settings, spectrum: bool) -> Settings {
    settings.spectrum.enabled = spectrum;
    settings
}

fn persist_settings(radio: &Controller, path: &std::path::Path) {
    // Reload so options forced for this run do not leak into the file.
    let mut settings = Settings::load(path);
    settings.sdr.gain_db = radio.gain_db();
    settings.audio.volume = radio.volume();
    settings.rds.enable_updates_during_playback = radio.metadata_updates();
    if let Err(e) = settings.save(path) {
        tracing::warn!("could not save settings: {}", e);
    }
}

fn print_commands() {
    println!("  tune <MHz>      play a station");
    println!("  stop            stop playback or scan");
    println!("  gain <dB>       set RF gain");
    println!("  vol <0-100>     set volume");
    println!("  rec / stoprec   start or stop recording");
    println!("  scan            scan the band for RDS stations");
    println!("  probe <MHz>     check one frequency for RDS");
    println!("  cancel          cancel a scan");
    println!("  rds on|off      metadata updates during playback");
    println!("  stations        list known stations");
    println!("  status          show receiver state");
    println!("  quit");
}

fn print_usage() {
    println!("pulse-fm-rx [options]");
    println!();
    println!("Options:");
    println!("  --freq <MHz>          tune on startup");
    println!("  --settings <path>     settings file (default: {})", config::settings_path().display());
    println!("  --spectrum            print spectrum/stereo frames");
    println!("  -v, -vv               more logging (RUST_LOG overrides)");
}
