use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use crate::record::WideRecord;
use crate::sink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupReport {
    pub before: usize,
    pub after: usize,
}

impl DedupReport {
    pub fn removed(&self) -> usize {
        self.before - self.after
    }
}

/// Keep the first record for each (roll, registration id) pair, in input order.
pub fn dedup(records: Vec<WideRecord>) -> (Vec<WideRecord>, DedupReport) {
    let before = records.len();
    let mut seen = HashSet::with_capacity(before);
    let kept: Vec<WideRecord> = records
        .into_iter()
        .filter(|r| seen.insert((r.roll, r.registration_id().to_string())))
        .collect();
    let report = DedupReport {
        before,
        after: kept.len(),
    };
    (kept, report)
}

/// Dedup the store at `input`, writing to `output` (or back over `input`).
pub fn dedup_file(input: &Path, output: Option<&Path>) -> Result<DedupReport> {
    let records = sink::load(input)?;
    let (kept, report) = dedup(records);
    let target = output.unwrap_or(input);
    sink::rewrite(target, &kept)
        .with_context(|| format!("Failed to write deduplicated records to {}", target.display()))?;
    info!(
        "Dedup: {} records before, {} after ({} removed), saved to {}",
        report.before,
        report.after,
        report.removed(),
        target.display()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::sample_record;

    #[test]
    fn keeps_first_occurrence() {
        let mut first = sample_record(10, "R10", &[]);
        first.fields.insert("Name".into(), "FIRST".into());
        let mut second = sample_record(10, "R10", &[]);
        second.fields.insert("Name".into(), "SECOND".into());
        let other_reg = sample_record(10, "R10-B", &[]);
        let input = vec![first.clone(), sample_record(11, "R11", &[]), second, other_reg];

        let (out, report) = dedup(input);
        assert_eq!(report, DedupReport { before: 4, after: 3 });
        assert_eq!(out[0], first);
        assert_eq!(out[1].roll, 11);
        assert_eq!(out[2].registration_id(), "R10-B");
    }

    #[test]
    fn idempotent() {
        let input = vec![
            sample_record(1, "A", &[]),
            sample_record(1, "A", &[]),
            sample_record(2, "B", &[]),
        ];
        let (once, _) = dedup(input);
        let (twice, report) = dedup(once.clone());
        assert_eq!(once, twice);
        assert_eq!(report.removed(), 0);
    }

    #[test]
    fn file_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.jsonl");
        let mut s = sink::RecordSink::open(&path).unwrap();
        for r in [sample_record(1, "A", &[]), sample_record(1, "A", &[]), sample_record(2, "B", &[])] {
            s.append(&r).unwrap();
        }
        drop(s);

        let report = dedup_file(&path, None).unwrap();
        assert_eq!(report, DedupReport { before: 3, after: 2 });
        assert_eq!(sink::load(&path).unwrap().len(), 2);
        assert_eq!(dedup_file(&path, None).unwrap().removed(), 0);
    }
}
