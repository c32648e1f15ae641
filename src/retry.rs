use std::time::Duration;

use tracing::{debug, warn};

use crate::error::FetchError;
use crate::extract::extract;
use crate::fetcher::Fetcher;
use crate::record::{Roll, WideRecord};

/// Classification of a single fetch + extract attempt.
#[derive(Debug)]
pub enum AttemptOutcome {
    Success(WideRecord),
    /// Page loaded but Name or Result was empty.
    Blank,
    /// Page loaded but neither result table was present.
    Structural,
    Transient(FetchError),
}

/// Final result for one roll after all attempts.
#[derive(Debug)]
pub enum RollOutcome {
    Harvested { record: WideRecord, attempts: u32 },
    Exhausted(Roll),
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        RetryPolicy {
            max_attempts,
            delay,
        }
    }

    pub async fn harvest<F: Fetcher>(&self, fetcher: &mut F, roll: Roll) -> RollOutcome {
        for attempt in 1..=self.max_attempts {
            debug!(roll, attempt, "Attempt {}/{}", attempt, self.max_attempts);
            match attempt_once(fetcher, roll).await {
                AttemptOutcome::Success(record) => {
                    return RollOutcome::Harvested { record, attempts: attempt };
                }
                AttemptOutcome::Blank => {
                    warn!(roll, attempt, "Blank result detected, retrying");
                }
                AttemptOutcome::Structural => {
                    warn!(roll, attempt, "Result tables missing from page, retrying");
                }
                AttemptOutcome::Transient(e) => {
                    warn!(roll, attempt, "Fetch failed: {}, retrying", e);
                }
            }
            if attempt < self.max_attempts && !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
        }
        RollOutcome::Exhausted(roll)
    }
}

pub async fn attempt_once<F: Fetcher>(fetcher: &mut F, roll: Roll) -> AttemptOutcome {
    let page = match fetcher.fetch(roll).await {
        Ok(page) => page,
        Err(e) => return AttemptOutcome::Transient(e),
    };
    let extraction = extract(&page.html);
    if extraction.is_structurally_absent() {
        return AttemptOutcome::Structural;
    }
    let record = WideRecord::new(roll, &extraction.info, extraction.subjects);
    if record.is_blank() {
        AttemptOutcome::Blank
    } else {
        AttemptOutcome::Success(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::stub::{blank_html, result_html, Reply, StubFetcher};

    fn policy(max: u32) -> RetryPolicy {
        RetryPolicy::new(max, Duration::ZERO)
    }

    fn blanks_then_valid(roll: Roll, k: usize) -> StubFetcher {
        let mut replies = vec![Reply::Page(blank_html(roll)); k - 1];
        replies.push(Reply::Page(result_html(roll, "AYESHA", "REG1")));
        StubFetcher::new().with(roll, replies)
    }

    #[tokio::test]
    async fn valid_after_k_attempts() {
        for k in 1..=3 {
            let mut f = blanks_then_valid(500, k);
            match policy(3).harvest(&mut f, 500).await {
                RollOutcome::Harvested { record, attempts } => {
                    assert_eq!(attempts as usize, k);
                    assert_eq!(record.field("Name"), "AYESHA");
                }
                other => panic!("expected harvest on attempt {}, got {:?}", k, other),
            }
            assert_eq!(f.calls.len(), k);
        }
    }

    #[tokio::test]
    async fn exhausted_when_valid_comes_too_late() {
        let mut f = blanks_then_valid(500, 4);
        let outcome = policy(3).harvest(&mut f, 500).await;
        assert!(matches!(outcome, RollOutcome::Exhausted(500)));
        assert_eq!(f.calls.len(), 3);
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let mut f = StubFetcher::new().with(
            7,
            vec![Reply::Timeout, Reply::Page(result_html(7, "X", "R"))],
        );
        let outcome = policy(3).harvest(&mut f, 7).await;
        assert!(matches!(outcome, RollOutcome::Harvested { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn classifies_each_attempt() {
        let mut f = StubFetcher::new()
            .with(1, vec![Reply::Page("<p>maintenance</p>".into())])
            .with(2, vec![Reply::Page(blank_html(2))])
            .with(3, vec![Reply::Timeout]);
        assert!(matches!(attempt_once(&mut f, 1).await, AttemptOutcome::Structural));
        assert!(matches!(attempt_once(&mut f, 2).await, AttemptOutcome::Blank));
        assert!(matches!(
            attempt_once(&mut f, 3).await,
            AttemptOutcome::Transient(FetchError::Timeout { .. })
        ));
    }
}
