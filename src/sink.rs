use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::SchemaError;
use crate::record::{Roll, WideRecord, SCHEMA};

/// Append-only JSON Lines store of harvested records.
pub struct RecordSink {
    path: PathBuf,
    file: File,
}

impl RecordSink {
    /// Open for appending, dropping any torn final line left by a crash mid-write.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        repair_torn_tail(&path)?;
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(RecordSink { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns only once the line is on disk. A failed write leaves the file as it was.
    pub fn append(&mut self, record: &WideRecord) -> io::Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        write_or_rollback(&mut self.file, |f| {
            f.write_all(&line)?;
            f.flush()?;
            f.sync_data()
        })
    }
}

/// Run `write`, truncating back to the previous length if it fails part-way.
fn write_or_rollback(
    file: &mut File,
    write: impl FnOnce(&mut File) -> io::Result<()>,
) -> io::Result<()> {
    let before = file.metadata()?.len();
    let result = write(file);
    if result.is_err() {
        if let Err(e) = file.set_len(before) {
            warn!("Could not roll back partial write to {} bytes: {}", before, e);
        }
    }
    result
}

fn repair_torn_tail(path: &Path) -> io::Result<()> {
    match fs::metadata(path) {
        Ok(meta) if !meta.is_file() => return Ok(()),
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    }
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if bytes.is_empty() || bytes.ends_with(b"\n") {
        return Ok(());
    }
    let keep = bytes.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
    warn!(
        "Dropping {} bytes of incomplete trailing record in {}",
        bytes.len() - keep,
        path.display()
    );
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(keep as u64)?;
    file.sync_all()
}

#[derive(Deserialize)]
struct VersionProbe {
    schema_version: u32,
}

/// Read every record, failing on the first line that does not match [`SCHEMA`].
pub fn load(path: &Path) -> Result<Vec<WideRecord>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read record store {}", path.display()))?;
    parse_lines(&raw).with_context(|| format!("Invalid record store {}", path.display()))
}

fn parse_lines(raw: &str) -> Result<Vec<WideRecord>, SchemaError> {
    let torn_tail = !raw.is_empty() && !raw.ends_with('\n');
    let lines: Vec<&str> = raw.lines().collect();
    let mut records = Vec::with_capacity(lines.len());

    for (i, text) in lines.iter().enumerate() {
        let line = i + 1;
        if text.trim().is_empty() {
            continue;
        }
        let parsed = serde_json::from_str::<VersionProbe>(text).and_then(|probe| {
            if probe.schema_version != SCHEMA.version {
                return Ok(Err(SchemaError::Version {
                    line,
                    found: probe.schema_version,
                    expected: SCHEMA.version,
                }));
            }
            serde_json::from_str::<WideRecord>(text).map(Ok)
        });
        match parsed {
            Ok(Ok(record)) => records.push(record),
            Ok(Err(e)) => return Err(e),
            Err(e) if torn_tail && line == lines.len() => {
                warn!("Ignoring incomplete final record on line {}: {}", line, e);
            }
            Err(source) => return Err(SchemaError::Malformed { line, source }),
        }
    }
    Ok(records)
}

/// Replace the store with `records` via a temp file and rename.
pub fn rewrite(path: &Path, records: &[WideRecord]) -> io::Result<()> {
    let tmp = path.with_extension("jsonl.tmp");
    {
        let mut file = File::create(&tmp)?;
        for r in records {
            let mut line = serde_json::to_vec(r)?;
            line.push(b'\n');
            file.write_all(&line)?;
        }
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}

/// Write records as CSV. The header is sized for the widest record in the set.
pub fn export_csv(records: &[WideRecord], path: &Path) -> Result<usize> {
    let max_subjects = records.iter().map(|r| r.subjects.len()).max().unwrap_or(0);
    let header = SCHEMA.header(max_subjects);
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    writer.write_record(&header)?;
    for r in records {
        let mut row = r.columns();
        row.resize(header.len(), String::new());
        writer.write_record(&row)?;
    }
    writer.flush()?;
    Ok(records.len())
}

/// One line per roll that exhausted its retries.
#[derive(Debug, Serialize, Deserialize)]
pub struct FailedRoll {
    pub roll: Roll,
    pub attempts: u32,
    pub failed_at: chrono::DateTime<chrono::Utc>,
}

pub fn append_failed(path: &Path, roll: Roll, attempts: u32) -> io::Result<()> {
    let entry = FailedRoll {
        roll,
        attempts,
        failed_at: chrono::Utc::now(),
    };
    let mut line = serde_json::to_vec(&entry)?;
    line.push(b'\n');
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(&line)?;
    file.sync_data()
}

pub fn load_failed(path: &Path) -> io::Result<Vec<FailedRoll>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    raw.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(io::Error::from))
        .collect()
}

/// Replace the failure ledger with `entries`, or remove it when none are left.
pub fn rewrite_failed(path: &Path, entries: &[FailedRoll]) -> io::Result<()> {
    if entries.is_empty() {
        return match fs::remove_file(path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        };
    }
    let tmp = path.with_extension("jsonl.tmp");
    {
        let mut file = File::create(&tmp)?;
        for entry in entries {
            let mut line = serde_json::to_vec(entry)?;
            line.push(b'\n');
            file.write_all(&line)?;
        }
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::sample_record;

    #[test]
    fn append_then_load_keeps_order_and_width() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.jsonl");
        let mut sink = RecordSink::open(&path).unwrap();
        let narrow = sample_record(1, "R1", &[("101", "BANGLA-I", "80(A+)")]);
        let wide = sample_record(
            2,
            "R2",
            &[("101", "BANGLA-I", "80(A+)"), ("107", "ENGLISH-I", "70(A)"), ("109", "MATH", "99(A+)")],
        );
        sink.append(&narrow).unwrap();
        sink.append(&wide).unwrap();

        let loaded = load(&path).unwrap();
        assert_eq!(loaded, vec![narrow, wide]);
        assert_eq!(loaded[1].columns().len(), 21);
    }

    #[test]
    fn reopen_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.jsonl");
        RecordSink::open(&path).unwrap().append(&sample_record(1, "A", &[])).unwrap();
        RecordSink::open(&path).unwrap().append(&sample_record(2, "B", &[])).unwrap();
        let rolls: Vec<_> = load(&path).unwrap().iter().map(|r| r.roll).collect();
        assert_eq!(rolls, vec![1, 2]);
    }

    #[test]
    fn torn_tail_dropped_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.jsonl");
        RecordSink::open(&path).unwrap().append(&sample_record(1, "A", &[])).unwrap();
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"{\"schema_version\":1,\"roll\":2,\"fie").unwrap();
        drop(f);

        assert_eq!(load(&path).unwrap().len(), 1);
        let mut sink = RecordSink::open(&path).unwrap();
        sink.append(&sample_record(3, "C", &[])).unwrap();
        let rolls: Vec<_> = load(&path).unwrap().iter().map(|r| r.roll).collect();
        assert_eq!(rolls, vec![1, 3]);
    }

    #[test]
    fn failed_write_is_rolled_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.jsonl");
        let mut sink = RecordSink::open(&path).unwrap();
        sink.append(&sample_record(1, "A", &[])).unwrap();
        let len = fs::metadata(&path).unwrap().len();

        // Half a line lands, then the device fills up.
        let err = write_or_rollback(&mut sink.file, |f| {
            f.write_all(b"{\"schema_version\":1,\"roll\":2,")?;
            Err(io::Error::new(io::ErrorKind::Other, "no space left on device"))
        })
        .unwrap_err();
        assert_eq!(err.to_string(), "no space left on device");
        assert_eq!(fs::metadata(&path).unwrap().len(), len);

        sink.append(&sample_record(2, "B", &[])).unwrap();
        let rolls: Vec<_> = load(&path).unwrap().iter().map(|r| r.roll).collect();
        assert_eq!(rolls, vec![1, 2]);
    }

    #[test]
    fn unknown_schema_version_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.jsonl");
        let mut r = sample_record(1, "A", &[]);
        r.schema_version = 99;
        fs::write(&path, format!("{}\n", serde_json::to_string(&r).unwrap())).unwrap();
        let err = load(&path).unwrap_err();
        let schema = err.downcast_ref::<SchemaError>().unwrap();
        assert!(matches!(schema, SchemaError::Version { line: 1, found: 99, .. }));
    }

    #[test]
    fn malformed_middle_line_fails_with_line_number() {
        let raw = format!(
            "{}\nnot json\n{}\n",
            serde_json::to_string(&sample_record(1, "A", &[])).unwrap(),
            serde_json::to_string(&sample_record(2, "B", &[])).unwrap()
        );
        assert!(matches!(parse_lines(&raw), Err(SchemaError::Malformed { line: 2, .. })));
    }

    #[test]
    fn csv_header_sized_for_widest_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let records = vec![
            sample_record(1, "A", &[("101", "BANGLA-I", "80(A+)")]),
            sample_record(2, "B", &[("101", "BANGLA-I", "80(A+)"), ("107", "ENGLISH-I", "70(A)")]),
        ];
        export_csv(&records, &path).unwrap();

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let header = reader.headers().unwrap().clone();
        assert_eq!(header.len(), 18);
        let rows: Vec<_> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.len() == 18));
        assert_eq!(&rows[0][15], "");
    }

    #[test]
    fn failed_ledger_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failed.jsonl");
        assert!(load_failed(&path).unwrap().is_empty());
        append_failed(&path, 11, 3).unwrap();
        let failed = load_failed(&path).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].roll, 11);

        rewrite_failed(&path, &[]).unwrap();
        assert!(!path.exists());
        rewrite_failed(&path, &[]).unwrap();
    }
}
