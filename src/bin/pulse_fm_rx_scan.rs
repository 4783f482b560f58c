use std::env;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use pulse_fm_rx::config::{self, BandPreset, Settings};
use pulse_fm_rx::station::{StationDatabase, StationState};
use pulse_fm_rx::{logging, Backends, Controller, Notification};

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.iter().any(|a| a == "-h" || a == "--help") {
        print_usage();
        return Ok(());
    }

    let mut verbosity = 0u8;
    let mut settings_path: Option<PathBuf> = None;
    let mut band: Option<String> = None;
    let mut dwell_ms: Option<u64> = None;
    let mut probe: Option<f64> = None;
    let mut json = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-v" => verbosity += 1,
            "--settings" => {
                i += 1;
                settings_path = Some(PathBuf::from(
                    args.get(i).ok_or_else(|| anyhow!("missing settings path"))?,
                ));
            }
            "--band" => {
                i += 1;
                band = args.get(i).cloned();
            }
            "--dwell-ms" => {
                i += 1;
                dwell_ms = Some(
                    args.get(i)
                        .ok_or_else(|| anyhow!("missing dwell"))?
                        .parse::<u64>()?,
                );
            }
            "--probe" => {
                i += 1;
                probe = Some(
                    args.get(i)
                        .ok_or_else(|| anyhow!("missing frequency"))?
                        .parse::<f64>()?,
                );
            }
            "--json" => json = true,
            other => return Err(anyhow!("unknown arg: {}", other)),
        }
        i += 1;
    }
    logging::init(verbosity.max(1));

    let settings_path = settings_path.unwrap_or_else(config::settings_path);
    let mut settings = Settings::load(&settings_path);
    if let Some(band) = band {
        if BandPreset::by_id(&band).is_none() {
            let known: Vec<&str> = config::BAND_PRESETS.iter().map(|b| b.id).collect();
            return Err(anyhow!("unknown band {:?}, expected one of {}", band, known.join(", ")));
        }
        settings.fm_band.preset = band;
    }
    if let Some(ms) = dwell_ms {
        settings.control.scan_dwell_ms = ms;
    }
    settings.spectrum.enabled = false;

    let db = StationDatabase::load(&config::station_db_path());
    let backends = Backends::from_settings(&settings);
    let mut radio = Controller::new(settings, backends, db);

    match probe {
        Some(freq) => radio.probe(freq)?,
        None => radio.scan()?,
    }

    let mut found: Vec<StationState> = Vec::new();
    let mut finished = false;
    while !finished {
        for note in radio.poll(Instant::now()) {
            match note {
                Notification::ScanProgress { freq_khz, index, total } => {
                    eprintln!("{:.1} MHz ({}/{})", freq_khz as f64 / 1000.0, index + 1, total)
                }
                Notification::StationFound(st) => {
                    eprintln!("  found {}", st.display_name());
                    found.push(st);
                }
                Notification::TuneFailed { reason, .. } => eprintln!("  failed: {}", reason),
                Notification::ScanFinished { .. } => finished = true,
                _ => {}
            }
        }
        thread::sleep(Duration::from_millis(50));
    }
    radio.shutdown();

    if json {
        println!("{}", serde_json::to_string_pretty(&found)?);
    } else {
        for st in &found {
            println!(
                "{:>6.1}  {:<8}  {}",
                st.freq,
                st.program_service.as_deref().unwrap_or(""),
                st.program_type.as_deref().unwrap_or("")
            );
        }
        println!("{} station(s)", found.len());
    }
    Ok(())
}

fn print_usage() {
    println!("pulse-fm-rx-scan [options]");
    println!();
    println!("Scans the FM band for stations broadcasting RDS and stores them");
    println!("in the station database.");
    println!();
    println!("Options:");
    println!("  --band <preset>     band preset (worldwide, us_ca, japan, oirt, ...)");
    println!("  --dwell-ms <ms>     time spent on each channel");
    println!("  --probe <MHz>       check one frequency only");
    println!("  --settings <path>   settings file");
    println!("  --json              print results as JSON");
    println!("  -v                  more logging");
}
