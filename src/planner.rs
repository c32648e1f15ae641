use std::ops::RangeInclusive;

use crate::record::Roll;

/// Inclusive window of rolls to process in one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchWindow {
    pub start: Roll,
    pub end: Roll,
}

impl BatchWindow {
    /// Window following `checkpoint`, clamped to `overall_start..=overall_end`.
    ///
    /// A checkpoint below the range starts at `overall_start`; one at or past
    /// `overall_end` yields an exhausted window.
    pub fn plan(checkpoint: Roll, overall_start: Roll, batch_size: u64, overall_end: Roll) -> Self {
        if checkpoint >= overall_end {
            return BatchWindow {
                start: overall_end.saturating_add(1),
                end: overall_end,
            };
        }
        let start = (checkpoint + 1).max(overall_start);
        let end = start
            .saturating_add(batch_size.saturating_sub(1))
            .min(overall_end);
        BatchWindow { start, end }
    }

    /// True once the checkpoint has reached the end of the overall range.
    pub fn is_exhausted(&self) -> bool {
        self.start > self.end
    }

    pub fn len(&self) -> u64 {
        if self.is_exhausted() {
            0
        } else {
            self.end - self.start + 1
        }
    }

    pub fn rolls(&self) -> RangeInclusive<Roll> {
        self.start..=self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_window() {
        let w = BatchWindow::plan(299999, 300000, 20000, 340000);
        assert_eq!(w, BatchWindow { start: 300000, end: 319999 });
        assert_eq!(w.len(), 20000);
    }

    #[test]
    fn capped_at_overall_end() {
        let w = BatchWindow::plan(329999, 300000, 20000, 340000);
        assert_eq!(w.end, 340000);
        assert_eq!(w.len(), 10001);
    }

    #[test]
    fn exhausted_after_last_roll() {
        let w = BatchWindow::plan(340000, 300000, 20000, 340000);
        assert!(w.is_exhausted());
        assert_eq!(w.len(), 0);
        assert_eq!(w.rolls().count(), 0);
    }

    #[test]
    fn batch_of_one() {
        let w = BatchWindow::plan(9, 10, 1, 12);
        assert_eq!(w.rolls().collect::<Vec<_>>(), vec![10]);
    }

    #[test]
    fn stale_checkpoint_below_range_starts_at_overall_start() {
        let w = BatchWindow::plan(3, 10, 100, 12);
        assert_eq!(w, BatchWindow { start: 10, end: 12 });
    }

    #[test]
    fn checkpoint_past_end_is_exhausted() {
        assert!(BatchWindow::plan(500, 10, 100, 12).is_exhausted());
        let w = BatchWindow::plan(u64::MAX, 10, 100, 12);
        assert!(w.is_exhausted());
        assert_eq!(w.len(), 0);
    }

    #[test]
    fn huge_batch_does_not_overflow() {
        let w = BatchWindow::plan(9, 10, u64::MAX, 12);
        assert_eq!(w, BatchWindow { start: 10, end: 12 });
    }
}
