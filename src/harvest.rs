use std::collections::{BTreeMap, BTreeSet, HashSet};

use anyhow::Context;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, error, info, warn};

use crate::breaker::FailureCircuitBreaker;
use crate::checkpoint::CheckpointStore;
use crate::config::{GapPolicy, Settings};
use crate::error::HarvestError;
use crate::fetcher::Fetcher;
use crate::planner::BatchWindow;
use crate::record::{Roll, WideRecord};
use crate::retry::{RetryPolicy, RollOutcome};
use crate::sink::{self, FailedRoll, RecordSink};

/// How a harvest run ended when no fatal error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEnd {
    /// Every roll in the window was attempted.
    Completed,
    /// Checkpoint already at the end of the overall range; nothing to do.
    RangeExhausted,
    /// Too many consecutive rolls failed; `after` is the roll that tripped the breaker.
    CircuitOpen { after: Roll },
    /// Gap policy is `block` and `at` exhausted its retries.
    Blocked { at: Roll },
}

#[derive(Debug)]
pub struct RunSummary {
    pub window: BatchWindow,
    pub end: RunEnd,
    pub harvested: u64,
    pub exhausted: u64,
    pub checkpoint: Roll,
}

/// Progress of one run, threaded through the loop.
struct RunState {
    checkpoint: Roll,
    breaker: FailureCircuitBreaker,
    harvested: u64,
    exhausted: u64,
}

impl RunState {
    fn new(checkpoint: Roll, threshold: u32) -> Self {
        RunState {
            checkpoint,
            breaker: FailureCircuitBreaker::new(threshold),
            harvested: 0,
            exhausted: 0,
        }
    }

    fn on_harvested(&mut self, roll: Roll) {
        self.checkpoint = roll;
        self.harvested += 1;
        self.breaker.record_success();
    }

    /// True if the breaker is now open.
    fn on_exhausted(&mut self) -> bool {
        self.exhausted += 1;
        self.breaker.record_failure()
    }

    fn finish(self, window: BatchWindow, end: RunEnd) -> RunSummary {
        RunSummary {
            window,
            end,
            harvested: self.harvested,
            exhausted: self.exhausted,
            checkpoint: self.checkpoint,
        }
    }
}

/// Harvest the next batch window. The fetcher is closed on every exit path.
pub async fn run_batch<F: Fetcher>(
    settings: &Settings,
    fetcher: &mut F,
) -> Result<RunSummary, HarvestError> {
    let store = CheckpointStore::new(&settings.checkpoint_path, settings.overall_start);
    let result = run_window(settings, &store, fetcher).await;
    fetcher.close().await;
    info!("Fetcher released");
    result
}

async fn run_window<F: Fetcher>(
    settings: &Settings,
    store: &CheckpointStore,
    fetcher: &mut F,
) -> Result<RunSummary, HarvestError> {
    let checkpoint = store.load();
    let window = BatchWindow::plan(
        checkpoint,
        settings.overall_start,
        settings.batch_size,
        settings.overall_end,
    );
    let mut state = RunState::new(checkpoint, settings.failure_threshold);

    if window.is_exhausted() {
        info!(
            "Reached overall end roll {} (checkpoint {}). Nothing to do.",
            settings.overall_end, checkpoint
        );
        return Ok(state.finish(window, RunEnd::RangeExhausted));
    }
    info!("Starting batch from roll {} to {}", window.start, window.end);

    let mut sink = open_sink(settings)?;
    let mut ledger = ledger_rolls(settings)?;
    let policy = RetryPolicy::new(settings.max_attempts, settings.retry_delay());
    let pb = progress_bar(window.len());

    let mut end = RunEnd::Completed;
    for roll in window.rolls() {
        pb.set_message(format!("roll {}", roll));
        match policy.harvest(fetcher, roll).await {
            RollOutcome::Harvested { record, attempts } => {
                // Record must be on disk before the checkpoint moves past it.
                append_with_retry(&mut sink, &record, &policy).await?;
                store.save(roll)?;
                state.on_harvested(roll);
                info!(roll, attempts, "Appended record to {}", sink.path().display());
            }
            RollOutcome::Exhausted(roll) => {
                warn!(
                    roll,
                    "Failed after {} attempts, skipping", settings.max_attempts
                );
                if ledger.insert(roll) {
                    sink::append_failed(&settings.failed_path, roll, settings.max_attempts)
                        .map_err(|source| HarvestError::FailureLedger { roll, source })?;
                } else {
                    debug!(roll, "Already in failure ledger");
                }
                let open = state.on_exhausted();
                if settings.gap_policy == GapPolicy::Block {
                    warn!(roll, "Gap policy is block, stopping before later rolls");
                    end = RunEnd::Blocked { at: roll };
                    pb.inc(1);
                    break;
                }
                if open {
                    error!(
                        "Stopped after {} consecutive failures (threshold {}, last roll {})",
                        state.breaker.consecutive(),
                        state.breaker.threshold(),
                        roll
                    );
                    end = RunEnd::CircuitOpen { after: roll };
                    pb.inc(1);
                    break;
                }
            }
        }
        pb.inc(1);
    }
    pb.finish_and_clear();

    info!(
        "Batch finished: {} harvested, {} failed, last scraped roll {}",
        state.harvested, state.exhausted, state.checkpoint
    );
    Ok(state.finish(window, end))
}

fn open_sink(settings: &Settings) -> Result<RecordSink, HarvestError> {
    RecordSink::open(&settings.sink_path).map_err(|source| HarvestError::SinkOpen {
        path: settings.sink_path.clone(),
        source,
    })
}

fn ledger_rolls(settings: &Settings) -> Result<BTreeSet<Roll>, HarvestError> {
    let entries = sink::load_failed(&settings.failed_path).map_err(|source| HarvestError::LedgerRead {
        path: settings.failed_path.clone(),
        source,
    })?;
    Ok(entries.into_iter().map(|e| e.roll).collect())
}

fn progress_bar(len: u64) -> ProgressBar {
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} {msg} (eta {eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );
    pb
}

#[derive(Debug, Default)]
pub struct RetrySummary {
    pub recovered: u64,
    pub still_failed: u64,
    /// Ledger rolls that were already in the record store and got dropped.
    pub already_sunk: u64,
    pub circuit_open: bool,
}

/// Feed the failure ledger back through the retry policy.
///
/// Recovered rolls are appended to the sink and leave the ledger; the checkpoint is not touched.
pub async fn retry_failed<F: Fetcher>(
    settings: &Settings,
    fetcher: &mut F,
) -> anyhow::Result<RetrySummary> {
    let result = retry_ledger(settings, fetcher).await;
    fetcher.close().await;
    info!("Fetcher released");
    result
}

async fn retry_ledger<F: Fetcher>(
    settings: &Settings,
    fetcher: &mut F,
) -> anyhow::Result<RetrySummary> {
    let mut summary = RetrySummary::default();
    let mut pending: BTreeMap<Roll, FailedRoll> = BTreeMap::new();
    let entries = sink::load_failed(&settings.failed_path).map_err(|source| HarvestError::LedgerRead {
        path: settings.failed_path.clone(),
        source,
    })?;
    for entry in entries {
        match pending.get_mut(&entry.roll) {
            Some(seen) => {
                seen.attempts += entry.attempts;
                seen.failed_at = seen.failed_at.max(entry.failed_at);
            }
            None => {
                pending.insert(entry.roll, entry);
            }
        }
    }
    if pending.is_empty() {
        info!("Failure ledger {} is empty", settings.failed_path.display());
        return Ok(summary);
    }

    if settings.sink_path.exists() {
        let sunk: HashSet<Roll> = sink::load(&settings.sink_path)?.iter().map(|r| r.roll).collect();
        let before = pending.len();
        pending.retain(|roll, _| !sunk.contains(roll));
        summary.already_sunk = (before - pending.len()) as u64;
    }

    let mut sink = open_sink(settings)?;
    let policy = RetryPolicy::new(settings.max_attempts, settings.retry_delay());
    let mut breaker = FailureCircuitBreaker::new(settings.failure_threshold);
    let rolls: Vec<Roll> = pending.keys().copied().collect();
    info!("Retrying {} failed rolls", rolls.len());
    let pb = progress_bar(rolls.len() as u64);

    for roll in rolls {
        pb.set_message(format!("roll {}", roll));
        match policy.harvest(fetcher, roll).await {
            RollOutcome::Harvested { record, attempts } => {
                append_with_retry(&mut sink, &record, &policy).await?;
                pending.remove(&roll);
                breaker.record_success();
                summary.recovered += 1;
                info!(roll, attempts, "Recovered failed roll");
            }
            RollOutcome::Exhausted(roll) => {
                if let Some(entry) = pending.get_mut(&roll) {
                    entry.attempts += settings.max_attempts;
                    entry.failed_at = chrono::Utc::now();
                }
                warn!(roll, "Still failing after {} attempts", settings.max_attempts);
                if breaker.record_failure() {
                    error!(
                        "Stopped after {} consecutive failures (threshold {})",
                        breaker.consecutive(),
                        breaker.threshold()
                    );
                    summary.circuit_open = true;
                    pb.inc(1);
                    break;
                }
            }
        }
        pb.inc(1);
    }
    pb.finish_and_clear();

    let remaining: Vec<FailedRoll> = pending.into_values().collect();
    summary.still_failed = remaining.len() as u64;
    sink::rewrite_failed(&settings.failed_path, &remaining)
        .with_context(|| format!("Failed to rewrite {}", settings.failed_path.display()))?;
    Ok(summary)
}

/// Sink writes get the same attempt budget as fetches; a sink that stays broken is fatal.
async fn append_with_retry(
    sink: &mut RecordSink,
    record: &WideRecord,
    policy: &RetryPolicy,
) -> Result<(), HarvestError> {
    let mut attempt = 1;
    loop {
        match sink.append(record) {
            Ok(()) => return Ok(()),
            Err(source) if attempt >= policy.max_attempts => {
                return Err(HarvestError::Sink {
                    roll: record.roll,
                    source,
                });
            }
            Err(e) => {
                warn!(roll = record.roll, attempt, "Sink write failed: {}, retrying", e);
                attempt += 1;
                if !policy.delay.is_zero() {
                    tokio::time::sleep(policy.delay).await;
                }
            }
        }
    }
}
