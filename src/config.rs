use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

use crate::record::Roll;

pub const DEFAULT_URL: &str = "https://sresult.bise-ctg.gov.bd/rxto2025/individual/";

/// What the run does with a roll that exhausted its retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum GapPolicy {
    /// Log it to the failure ledger and keep going; later successes move the checkpoint past it.
    Skip,
    /// Stop the run so the checkpoint never passes an unharvested roll.
    Block,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub url: String,
    pub overall_start: Roll,
    pub overall_end: Roll,
    pub batch_size: u64,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub step_timeout_secs: u64,
    pub failure_threshold: u32,
    pub gap_policy: GapPolicy,
    pub checkpoint_path: PathBuf,
    pub sink_path: PathBuf,
    pub failed_path: PathBuf,
    pub db_path: PathBuf,
    pub exam_type: String,
    pub exam_year: String,
}

impl Settings {
    /// Defaults, then `harvest.toml` (or `file`), then `HARVEST_*` environment variables.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let file_source = match file {
            Some(p) => File::from(p.to_path_buf()).required(true),
            None => File::with_name("harvest").required(false),
        };
        let settings: Settings = Config::builder()
            .set_default("url", DEFAULT_URL)?
            .set_default("overall_start", 300_000i64)?
            .set_default("overall_end", 340_000i64)?
            .set_default("batch_size", 20_000i64)?
            .set_default("max_attempts", 3i64)?
            .set_default("retry_delay_ms", 2_000i64)?
            .set_default("step_timeout_secs", 20i64)?
            .set_default("failure_threshold", 10i64)?
            .set_default("gap_policy", "skip")?
            .set_default("checkpoint_path", "progress.json")?
            .set_default("sink_path", "results.jsonl")?
            .set_default("failed_path", "failed_rolls.jsonl")?
            .set_default("db_path", "data/results.sqlite")?
            .set_default("exam_type", "SSC")?
            .set_default("exam_year", "2025")?
            .add_source(file_source)
            .add_source(Environment::with_prefix("HARVEST").try_parsing(true))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            bail!("batch_size must be at least 1");
        }
        if self.max_attempts == 0 {
            bail!("max_attempts must be at least 1");
        }
        if self.failure_threshold == 0 {
            bail!("failure_threshold must be at least 1");
        }
        if self.overall_start > self.overall_end {
            bail!(
                "overall_start {} is past overall_end {}",
                self.overall_start,
                self.overall_end
            );
        }
        if self.overall_start == 0 {
            bail!("overall_start must be at least 1");
        }
        if self.overall_end == Roll::MAX {
            bail!("overall_end must be below {}", Roll::MAX);
        }
        Ok(())
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }
}

#[cfg(test)]
pub(crate) fn test_settings(dir: &Path) -> Settings {
    Settings {
        url: "http://localhost/".to_string(),
        overall_start: 10,
        overall_end: 12,
        batch_size: 100,
        max_attempts: 3,
        retry_delay_ms: 0,
        step_timeout_secs: 1,
        failure_threshold: 10,
        gap_policy: GapPolicy::Skip,
        checkpoint_path: dir.join("progress.json"),
        sink_path: dir.join("results.jsonl"),
        failed_path: dir.join("failed_rolls.jsonl"),
        db_path: dir.join("results.sqlite"),
        exam_type: "SSC".to_string(),
        exam_year: "2025".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harvest.toml");
        std::fs::write(&path, "batch_size = 50\ngap_policy = \"block\"\n").unwrap();
        let s = Settings::load(Some(&path)).unwrap();
        assert_eq!(s.batch_size, 50);
        assert_eq!(s.gap_policy, GapPolicy::Block);
        assert_eq!(s.max_attempts, 3);
        assert_eq!(s.retry_delay(), Duration::from_secs(2));
    }

    #[test]
    fn rejects_inverted_range() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = test_settings(dir.path());
        s.overall_start = 20;
        assert!(s.validate().is_err());
    }

    #[test]
    fn rejects_zero_batch() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = test_settings(dir.path());
        s.batch_size = 0;
        assert!(s.validate().is_err());
    }
}
