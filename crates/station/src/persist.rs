//! Snapshot save/restore of history and calibration.
//!
//! The snapshot is one JSON document written next to its final path and
//! renamed into place, so a crash mid-save leaves the previous snapshot
//! intact.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::calibration::Calibration;
use crate::history::History;
use crate::station::{Station, PLANT_COUNT};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub hourly: History,
    #[serde(default)]
    pub minute: History,
    #[serde(default)]
    pub calibration: [Calibration; PLANT_COUNT],
}

impl Snapshot {
    pub fn capture(station: &Station) -> Self {
        Self {
            hourly: station.hourly.clone(),
            minute: station.minute.clone(),
            calibration: [
                station.plants[0].calibration,
                station.plants[1].calibration,
            ],
        }
    }

    /// Replace the station's history and calibration, enforcing the history
    /// bounds on the way in.
    pub fn restore_into(self, station: &mut Station) {
        station.hourly = self.hourly;
        station.minute = self.minute;
        for (plant, calibration) in station.plants.iter_mut().zip(self.calibration) {
            plant.calibration = calibration;
        }
        station.enforce_bounds();
    }
}

/// Read a snapshot. `None` when no snapshot has been saved yet.
pub fn load(path: &Path) -> Result<Option<Snapshot>> {
    let contents = match std::fs::read(path) {
        Ok(c) => c,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("failed to read snapshot: {}", path.display()))
        }
    };
    let snapshot = serde_json::from_slice(&contents)
        .with_context(|| format!("failed to parse snapshot: {}", path.display()))?;
    Ok(Some(snapshot))
}

pub fn save(path: &Path, snapshot: &Snapshot) -> Result<()> {
    let json = serde_json::to_vec(snapshot).context("failed to encode snapshot")?;
    write_atomic(path, &json)
        .with_context(|| format!("failed to save snapshot: {}", path.display()))?;
    info!(path = %path.display(), bytes = json.len(), "snapshot saved");
    Ok(())
}

/// Write `bytes` to `<path>.tmp`, then rename over `path`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = tmp_path(path);
    std::fs::write(&tmp, bytes).with_context(|| format!("failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to rename {} into place", tmp.display()))?;
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

// ===========================================================================
// Tests
// ===========================================================================
