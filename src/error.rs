use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::record::Roll;

/// Failures of a single fetch attempt. All of them are retryable.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("timed out after {}s waiting for {step}", .after.as_secs())]
    Timeout { step: &'static str, after: Duration },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("automation error: {0}")]
    Automation(String),

    #[error("page loaded but marker `{0}` is missing")]
    MarkerMissing(&'static str),
}

/// Fatal errors of a harvest run. Anything here stops the run.
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("failed to persist checkpoint {roll} to {path}: {source}")]
    Checkpoint {
        roll: Roll,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to open record sink {path}: {source}")]
    SinkOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to append roll {roll} to sink: {source}")]
    Sink {
        roll: Roll,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read failure ledger {path}: {source}")]
    LedgerRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to record exhausted roll {roll}: {source}")]
    FailureLedger {
        roll: Roll,
        #[source]
        source: std::io::Error,
    },
}

/// A stored row that does not match the schema this build understands.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("line {line}: unsupported schema version {found} (expected {expected})")]
    Version { line: usize, found: u32, expected: u32 },

    #[error("line {line}: malformed record: {source}")]
    Malformed {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// One subject score token that could not be parsed.
#[derive(Debug, Error)]
#[error("subject {code}: unparseable score token {token:?}")]
pub struct SubjectParseError {
    pub code: String,
    pub token: String,
}

/// A wide row that cannot become a canonical record at all.
#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("row has {found} columns, need at least {needed}")]
    TooFewColumns { found: usize, needed: usize },

    #[error("roll number {0:?} is not numeric")]
    BadRoll(String),
}
