//! File-backed persistence
//!
//! Everything is plain JSON on disk:
//! - `<config_dir>/config.json`: the [`AppConfig`] document
//! - `<data_dir>/ranking.json`: the time-trial ranking
//! - `<data_dir>/races/<id>.json`: one file per finished race

use anyhow::{anyhow, Context, Result};
use chrono::NaiveDateTime;
use perlap_core::config::AppConfig;
use perlap_core::ranking::{Ranking, RankingStore};
use perlap_core::record::RaceRecord;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const APP_DIR: &str = "perlap";
const DATA_DIR_ENV: &str = "PERLAP_DATA_DIR";

/// Where configuration and data live
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataDirs {
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
}

impl DataDirs {
    /// Both roots under one directory
    pub fn at(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            config_dir: root.clone(),
            data_dir: root,
        }
    }

    /// `PERLAP_DATA_DIR` if set, otherwise the platform's config and data
    /// directories
    pub fn resolve() -> Result<Self> {
        if let Some(root) = std::env::var_os(DATA_DIR_ENV).filter(|v| !v.is_empty()) {
            return Ok(Self::at(root));
        }
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow!("cannot determine the user config directory"))?
            .join(APP_DIR);
        let data_dir = dirs::data_dir()
            .ok_or_else(|| anyhow!("cannot determine the user data directory"))?
            .join(APP_DIR);
        Ok(Self {
            config_dir,
            data_dir,
        })
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join("config.json")
    }

    pub fn ranking_path(&self) -> PathBuf {
        self.data_dir.join("ranking.json")
    }

    pub fn races_dir(&self) -> PathBuf {
        self.data_dir.join("races")
    }
}

/// Write through a temporary file so readers never see a partial document
fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, contents).with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

// === Config ===

#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing or unreadable files give the defaults
    pub fn load(&self) -> AppConfig {
        let json = match fs::read_to_string(&self.path) {
            Ok(json) => json,
            Err(e) => {
                debug!("No config at {}: {}", self.path.display(), e);
                return AppConfig::default();
            }
        };
        AppConfig::from_json(&json).unwrap_or_else(|e| {
            warn!("Ignoring corrupt config {}: {}", self.path.display(), e);
            AppConfig::default()
        })
    }

    pub fn save(&self, config: &AppConfig) -> Result<()> {
        write_atomic(&self.path, &config.to_json_pretty()?)
    }
}

// === Ranking ===

#[derive(Debug, Clone)]
pub struct JsonRankingStore {
    path: PathBuf,
}

impl JsonRankingStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl RankingStore for JsonRankingStore {
    fn load(&self) -> Ranking {
        let Ok(json) = fs::read_to_string(&self.path) else {
            return Ranking::new();
        };
        Ranking::from_json(&json).unwrap_or_else(|e| {
            warn!("Ignoring corrupt ranking {}: {}", self.path.display(), e);
            Ranking::new()
        })
    }

    fn save(&mut self, ranking: &Ranking) -> Result<()> {
        write_atomic(&self.path, &ranking.to_json_pretty()?)
    }
}

// === Race archive ===

/// Listing entry for an archived race
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RaceSummary {
    pub id: String,
    pub date: NaiveDateTime,
    pub duration_ms: u64,
    pub cars: usize,
    pub laps: usize,
}

impl From<&RaceRecord> for RaceSummary {
    fn from(record: &RaceRecord) -> Self {
        Self {
            id: record.id.clone(),
            date: record.date,
            duration_ms: record.duration_ms,
            cars: record.cars.len(),
            laps: record.cars.iter().map(|c| c.laps.len()).sum(),
        }
    }
}

/// Race ids double as file names; only accept what the log generates
fn is_valid_race_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[derive(Debug, Clone)]
pub struct RaceArchive {
    dir: PathBuf,
}

impl RaceArchive {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, id: &str) -> Option<PathBuf> {
        is_valid_race_id(id).then(|| self.dir.join(format!("{}.json", id)))
    }

    pub fn save(&self, record: &RaceRecord) -> Result<PathBuf> {
        let path = self
            .path_for(&record.id)
            .ok_or_else(|| anyhow!("invalid race id {:?}", record.id))?;
        write_atomic(&path, &record.to_json_pretty()?)?;
        Ok(path)
    }

    /// `Ok(None)` for an unknown or malformed id
    pub fn load(&self, id: &str) -> Result<Option<RaceRecord>> {
        let Some(path) = self.path_for(id) else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let record = RaceRecord::from_json(&json)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(Some(record))
    }

    /// Archived races, newest first. Unreadable files are skipped.
    pub fn list(&self) -> Result<Vec<RaceSummary>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to list {}", self.dir.display()))
            }
        };

        let mut races = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = fs::read_to_string(&path)
                .map_err(anyhow::Error::from)
                .and_then(|json| Ok(RaceRecord::from_json(&json)?));
            match parsed {
                Ok(record) => races.push(RaceSummary::from(&record)),
                Err(e) => warn!("Skipping race file {}: {:#}", path.display(), e),
            }
        }

        races.sort_by(|a, b| b.date.cmp(&a.date).then_with(|| b.id.cmp(&a.id)));
        Ok(races)
    }
}
