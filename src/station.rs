use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::config::mhz_to_khz;
use crate::error::Result;
use crate::metadata::MetadataRecord;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StationState {
    pub freq: f64,
    #[serde(rename = "ps", default)]
    pub program_service: Option<String>,
    #[serde(default)]
    pub radiotext: Option<String>,
    #[serde(rename = "rtplus", default)]
    pub rich_metadata: Option<Value>,
    #[serde(default)]
    pub pi: Option<String>,
    #[serde(rename = "prog_type", default)]
    pub program_type: Option<String>,
    #[serde(default)]
    pub alt_freqs: Vec<f64>,
    #[serde(default)]
    pub stereo: bool,
    #[serde(rename = "tp", default)]
    pub traffic_program: bool,
    #[serde(rename = "ta", default)]
    pub traffic_announcement: bool,
    #[serde(default)]
    pub last_seen: Option<String>,
    #[serde(rename = "rds_count", default)]
    pub update_count: u64,
}

impl StationState {
    pub fn new(freq_khz: u32) -> Self {
        StationState {
            freq: freq_khz as f64 / 1000.0,
            program_service: None,
            radiotext: None,
            rich_metadata: None,
            pi: None,
            program_type: None,
            alt_freqs: Vec::new(),
            stereo: false,
            traffic_program: false,
            traffic_announcement: false,
            last_seen: None,
            update_count: 0,
        }
    }

    pub fn freq_khz(&self) -> u32 {
        mhz_to_khz(self.freq)
    }

    /// Merge a decoded record field by field. Fields the record does not
    /// carry keep their previous value. Returns true if anything a listener
    /// would display changed.
    pub fn apply(&mut self, record: &MetadataRecord, now: DateTime<Local>) -> bool {
        let before = self.clone();
        self.update_count += 1;
        self.last_seen = Some(now.naive_local().format("%Y-%m-%dT%H:%M:%S%.6f").to_string());

        if let Some(ps) = &record.ps {
            self.program_service = Some(ps.clone());
        }
        if let Some(rt) = &record.radiotext {
            self.radiotext = Some(rt.clone());
        }
        if let Some(rich) = &record.rich_text {
            self.rich_metadata = Some(rich.clone());
        }
        if let Some(pi) = &record.pi {
            self.pi = Some(pi.clone());
        }
        if let Some(pty) = &record.prog_type {
            self.program_type = Some(pty.clone());
        }
        if let Some(af) = &record.alt_freqs {
            self.alt_freqs = af.clone();
        }
        if let Some(stereo) = record.stereo {
            self.stereo = stereo;
        }
        if let Some(tp) = record.tp {
            self.traffic_program = tp;
        }
        if let Some(ta) = record.ta {
            self.traffic_announcement = ta;
        }

        self.program_service != before.program_service
            || self.radiotext != before.radiotext
            || self.rich_metadata != before.rich_metadata
            || self.pi != before.pi
            || self.program_type != before.program_type
            || self.alt_freqs != before.alt_freqs
            || self.stereo != before.stereo
            || self.traffic_program != before.traffic_program
            || self.traffic_announcement != before.traffic_announcement
    }

    /// "Artist - Title" (or just the title) from RadioText Plus fields.
    pub fn now_playing(&self) -> Option<String> {
        let rich = self.rich_metadata.as_ref()?.as_object()?;
        let title = first_text(rich, &["item_title", "title", "song", "track"]);
        let artist = first_text(rich, &["item_artist", "artist", "performer"]);
        match (artist, title) {
            (Some(a), Some(t)) => Some(format!("{} - {}", a, t)),
            (_, t) => t.map(str::to_string),
        }
    }

    pub fn display_name(&self) -> String {
        format!(
            "{:.1} MHz - {}",
            self.freq,
            self.program_service.as_deref().unwrap_or("Unknown")
        )
    }

    pub fn has_program_service(&self) -> bool {
        self.program_service.as_deref().is_some_and(|ps| !ps.trim().is_empty())
    }
}

fn first_text<'a>(map: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|k| map.get(*k).and_then(Value::as_str))
        .find(|s| !s.is_empty())
}

/// Known stations keyed by frequency. Stored as a JSON object whose keys are
/// the frequency in MHz with one decimal.
pub struct StationDatabase {
    path: PathBuf,
    stations: BTreeMap<u32, StationState>,
    dirty: bool,
}

impl StationDatabase {
    pub fn empty(path: PathBuf) -> Self {
        StationDatabase {
            path,
            stations: BTreeMap::new(),
            dirty: false,
        }
    }

    /// Load the database, skipping entries that do not parse. A missing or
    /// corrupt file gives an empty database.
    pub fn load(path: &Path) -> Self {
        let mut db = StationDatabase::empty(path.to_path_buf());
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => {
                debug!("no station database at {}: {}", path.display(), e);
                return db;
            }
        };
        let entries: Map<String, Value> = match serde_json::from_str(&text) {
            Ok(map) => map,
            Err(e) => {
                warn!("station database {} unreadable: {}", path.display(), e);
                return db;
            }
        };
        for (key, value) in entries {
            match serde_json::from_value::<StationState>(value) {
                Ok(station) => {
                    db.stations.insert(station.freq_khz(), station);
                }
                Err(e) => warn!("skipping station {}: {}", key, e),
            }
        }
        debug!("loaded {} stations from {}", db.stations.len(), path.display());
        db
    }

    pub fn save(&mut self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let map: BTreeMap<String, &StationState> = self
            .stations
            .iter()
            .map(|(khz, s)| (format!("{:.1}", *khz as f64 / 1000.0), s))
            .collect();
        let text = serde_json::to_string_pretty(&map)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, text)?;
        fs::rename(&tmp, &self.path)?;
        self.dirty = false;
        Ok(())
    }

    pub fn upsert(&mut self, station: StationState) {
        self.stations.insert(station.freq_khz(), station);
        self.dirty = true;
    }

    pub fn get(&self, freq_khz: u32) -> Option<&StationState> {
        self.stations.get(&freq_khz)
    }

    pub fn stations(&self) -> impl Iterator<Item = &StationState> {
        self.stations.values()
    }

    pub fn stations_with_metadata(&self) -> Vec<&StationState> {
        self.stations.values().filter(|s| s.has_program_service()).collect()
    }

    pub fn len(&self) -> usize {
        self.stations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stations.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(line: &str) -> MetadataRecord {
        MetadataRecord::parse(line).unwrap()
    }

    #[test]
    fn apply_merges_fields_without_erasing() {
        let mut st = StationState::new(99_100);
        let now = Local::now();
        assert!(st.apply(&record(r#"{"ps":"RADIO 1","pi":"0x3201"}"#), now));
        assert!(st.apply(&record(r#"{"radiotext":"Hello","tp":true}"#), now));
        assert_eq!(st.program_service.as_deref(), Some("RADIO 1"));
        assert_eq!(st.pi.as_deref(), Some("0x3201"));
        assert_eq!(st.radiotext.as_deref(), Some("Hello"));
        assert!(st.traffic_program);
        assert_eq!(st.update_count, 2);
        assert!(!st.apply(&record(r#"{"ps":"RADIO 1"}"#), now));
        assert_eq!(st.update_count, 3);
    }

    #[test]
    fn now_playing_prefers_artist_and_title() {
        let mut st = StationState::new(99_100);
        st.rich_metadata = Some(json!({"item_artist": "Band", "item_title": "Song"}));
        assert_eq!(st.now_playing().as_deref(), Some("Band - Song"));
        st.rich_metadata = Some(json!({"track": "Only Title"}));
        assert_eq!(st.now_playing().as_deref(), Some("Only Title"));
        st.rich_metadata = Some(json!("not an object"));
        assert_eq!(st.now_playing(), None);
    }

    #[test]
    fn display_name_falls_back_to_unknown() {
        let st = StationState::new(101_500);
        assert_eq!(st.display_name(), "101.5 MHz - Unknown");
    }

    #[test]
    fn database_round_trips_with_original_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stations.json");
        let mut db = StationDatabase::empty(path.clone());
        let mut st = StationState::new(99_100);
        st.program_service = Some("RADIO 1".into());
        st.stereo = true;
        db.upsert(st.clone());
        assert!(db.is_dirty());
        db.save().unwrap();
        assert!(!db.is_dirty());

        let raw: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["99.1"]["ps"], json!("RADIO 1"));
        assert_eq!(raw["99.1"]["rds_count"], json!(0));

        let loaded = StationDatabase::load(&path);
        assert_eq!(loaded.get(99_100), Some(&st));
    }

    #[test]
    fn load_skips_bad_entries_and_survives_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stations.json");
        fs::write(
            &path,
            r#"{"88.5": {"freq": 88.5, "ps": "JAZZ"}, "90.0": {"ps": 12}, "91.0": "nope"}"#,
        )
        .unwrap();
        let db = StationDatabase::load(&path);
        assert_eq!(db.len(), 1);
        assert_eq!(db.stations_with_metadata()[0].program_service.as_deref(), Some("JAZZ"));

        fs::write(&path, "garbage").unwrap();
        assert!(StationDatabase::load(&path).is_empty());
    }
}
