use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::HarvestError;
use crate::record::Roll;

#[derive(Debug, Serialize, Deserialize)]
struct Progress {
    last_scraped_roll: Roll,
}

/// Last durably harvested roll, kept in a small JSON file.
///
/// One store per identifier range: two workers must never share a checkpoint file.
pub struct CheckpointStore {
    path: PathBuf,
    overall_start: Roll,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>, overall_start: Roll) -> Self {
        CheckpointStore {
            path: path.into(),
            overall_start,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing or unreadable state restarts from just before `overall_start`.
    pub fn load(&self) -> Roll {
        let fresh = self.overall_start.saturating_sub(1);
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) => {
                debug!("No checkpoint at {} ({}), starting fresh", self.path.display(), e);
                return fresh;
            }
        };
        match serde_json::from_str::<Progress>(&raw) {
            Ok(p) => p.last_scraped_roll,
            Err(e) => {
                warn!(
                    "Checkpoint {} unreadable ({}), starting from {}",
                    self.path.display(),
                    e,
                    self.overall_start
                );
                fresh
            }
        }
    }

    /// Write to a sibling temp file, sync it, then rename over the checkpoint.
    pub fn save(&self, roll: Roll) -> Result<(), HarvestError> {
        self.write_atomic(roll).map_err(|source| HarvestError::Checkpoint {
            roll,
            path: self.path.clone(),
            source,
        })
    }

    fn write_atomic(&self, roll: Roll) -> std::io::Result<()> {
        let payload = serde_json::to_vec(&Progress {
            last_scraped_roll: roll,
        })?;
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&payload)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)
    }
}
