mod breaker;
mod checkpoint;
mod config;
mod db;
mod dedup;
mod error;
mod extract;
mod fetcher;
mod harvest;
mod normalize;
mod planner;
mod record;
mod retry;
mod sink;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};

use crate::checkpoint::CheckpointStore;
use crate::config::{GapPolicy, Settings};
use crate::fetcher::HttpFetcher;
use crate::harvest::{RunEnd, RunSummary};
use crate::normalize::ExamContext;
use crate::planner::BatchWindow;

#[derive(Parser)]
#[command(name = "result_harvester", about = "Resumable exam result harvester")]
struct Cli {
    /// Settings file (default: ./harvest.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Harvest the next batch window after the checkpoint
    Harvest(HarvestArgs),
    /// Re-harvest rolls listed in the failure ledger
    RetryFailed,
    /// Drop duplicate (roll, registration) records from the record store
    Dedup {
        /// Write the cleaned store here instead of overwriting it
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Normalize the record store and insert it into the database
    Import(ExamArgs),
    /// Harvest + dedup + import in one go
    Run {
        #[command(flatten)]
        harvest: HarvestArgs,
        #[command(flatten)]
        exam: ExamArgs,
    },
    /// Export the record store as CSV
    Export {
        #[arg(short, long, default_value = "results.csv")]
        output: PathBuf,
    },
    /// Show checkpoint, next window and record counts
    Status,
    /// Students ranked by total marks
    Rank {
        /// Match name, roll or institution
        #[arg(short, long)]
        search: Option<String>,
        #[arg(short, long)]
        institution: Option<String>,
        #[arg(short, long)]
        year: Option<String>,
        #[arg(short, long)]
        exam_type: Option<String>,
        /// Rank within each institution
        #[arg(long)]
        by_institution: bool,
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,
        #[arg(short, long, default_value = "1")]
        page: usize,
    },
    /// List distinct institutions, years, exam types and groups
    Filters,
    /// Show every stored exam result for one roll number
    Student { roll: String },
}

#[derive(clap::Args)]
struct HarvestArgs {
    /// First roll of the overall range
    #[arg(long)]
    start: Option<u64>,
    /// Last roll of the overall range
    #[arg(long)]
    end: Option<u64>,
    /// Rolls per run
    #[arg(short, long)]
    batch_size: Option<u64>,
    /// What to do with a roll that exhausts its retries
    #[arg(long, value_enum)]
    gap_policy: Option<GapPolicy>,
}

#[derive(clap::Args)]
struct ExamArgs {
    /// Exam type stored with each record (e.g. SSC, HSC)
    #[arg(long)]
    exam_type: Option<String>,
    /// Exam year stored with each record
    #[arg(long)]
    year: Option<String>,
}

impl HarvestArgs {
    fn apply(&self, settings: &mut Settings) -> anyhow::Result<()> {
        if let Some(v) = self.start {
            settings.overall_start = v;
        }
        if let Some(v) = self.end {
            settings.overall_end = v;
        }
        if let Some(v) = self.batch_size {
            settings.batch_size = v;
        }
        if let Some(v) = self.gap_policy {
            settings.gap_policy = v;
        }
        settings.validate()
    }
}

impl ExamArgs {
    fn context(&self, settings: &Settings) -> ExamContext {
        ExamContext {
            exam_type: self.exam_type.clone().unwrap_or_else(|| settings.exam_type.clone()),
            year: self.year.clone().unwrap_or_else(|| settings.exam_year.clone()),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let mut settings = Settings::load(cli.config.as_deref())?;

    let result = match cli.command {
        Commands::Harvest(args) => {
            args.apply(&mut settings)?;
            let summary = harvest_batch(&settings).await?;
            print_summary(&summary);
            Ok(())
        }
        Commands::RetryFailed => {
            let mut fetcher = HttpFetcher::new(&settings.url, settings.step_timeout())?;
            let s = harvest::retry_failed(&settings, &mut fetcher).await?;
            if s.circuit_open {
                println!("Stopped early: too many consecutive failures.");
            }
            println!(
                "Recovered {}, still failing {}, already harvested {}.",
                s.recovered, s.still_failed, s.already_sunk
            );
            Ok(())
        }
        Commands::Dedup { output } => {
            let report = dedup::dedup_file(&settings.sink_path, output.as_deref())?;
            println!(
                "Records: {} before, {} after ({} duplicates removed).",
                report.before,
                report.after,
                report.removed()
            );
            Ok(())
        }
        Commands::Import(exam) => {
            import(&settings, &exam.context(&settings))?;
            Ok(())
        }
        Commands::Run { harvest: args, exam } => {
            args.apply(&mut settings)?;

            // Phase 1: Harvest
            let t_harvest = Instant::now();
            let summary = harvest_batch(&settings).await?;
            print_summary(&summary);
            println!("Harvest took {}", format_duration(t_harvest.elapsed()));
            if !settings.sink_path.exists() {
                println!("Nothing harvested yet, skipping dedup and import.");
                return Ok(());
            }

            // Phase 2: Dedup
            let report = dedup::dedup_file(&settings.sink_path, None)?;
            println!("Dedup removed {} of {} records.", report.removed(), report.before);

            // Phase 3: Import
            import(&settings, &exam.context(&settings))?;
            Ok(())
        }
        Commands::Export { output } => {
            let records = sink::load(&settings.sink_path)?;
            let n = sink::export_csv(&records, &output)?;
            println!("Exported {} records to {}", n, output.display());
            Ok(())
        }
        Commands::Status => status(&settings),
        Commands::Rank {
            search,
            institution,
            year,
            exam_type,
            by_institution,
            limit,
            page,
        } => {
            let conn = db::connect(&settings.db_path)?;
            db::init_schema(&conn)?;
            let q = db::RankQuery {
                search,
                institution,
                year,
                exam_type,
                by_institution,
                limit,
                offset: page.saturating_sub(1) * limit,
            };
            let rows = db::fetch_ranking(&conn, &q)?;
            if rows.is_empty() {
                println!("No students found.");
                return Ok(());
            }

            println!(
                "{:>5} | {:<10} | {:<28} | {:<32} | {:>5} | {:>5} | {:<10}",
                "Rank", "Roll", "Name", "Institution", "GPA", "Total", "Group"
            );
            println!("{}", "-".repeat(114));
            for r in &rows {
                println!(
                    "{:>5} | {:<10} | {:<28} | {:<32} | {:>5} | {:>5} | {:<10}",
                    r.rank,
                    r.roll_number,
                    truncate(&r.student_name, 28),
                    truncate(&r.institution_name, 32),
                    r.gpa,
                    r.total_marks,
                    truncate(&r.group_name, 10)
                );
            }
            println!("\n{} students (page {})", rows.len(), page);
            Ok(())
        }
        Commands::Filters => {
            let conn = db::connect(&settings.db_path)?;
            db::init_schema(&conn)?;
            let f = db::fetch_filters(&conn)?;
            println!("Exam types:   {}", f.exam_types.join(", "));
            println!("Years:        {}", f.years.join(", "));
            println!("Groups:       {}", f.groups.join(", "));
            println!("Institutions: {}", f.institutions.len());
            for i in &f.institutions {
                println!("  {}", i);
            }
            Ok(())
        }
        Commands::Student { roll } => {
            let conn = db::connect(&settings.db_path)?;
            db::init_schema(&conn)?;
            let found = db::fetch_student(&conn, &roll)?;
            if found.is_empty() {
                println!("Student {} not found.", roll);
                return Ok(());
            }
            for s in &found {
                print_student(s);
            }
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

async fn harvest_batch(settings: &Settings) -> anyhow::Result<RunSummary> {
    let mut fetcher = HttpFetcher::new(&settings.url, settings.step_timeout())?;
    let summary = harvest::run_batch(settings, &mut fetcher).await?;
    Ok(summary)
}

fn import(settings: &Settings, exam: &ExamContext) -> anyhow::Result<()> {
    let records = sink::load(&settings.sink_path)?;
    let rows = normalize::normalize_all(&records, exam);
    println!(
        "Normalized {} of {} records ({} {}).",
        rows.len(),
        records.len(),
        exam.exam_type,
        exam.year
    );

    let conn = db::connect(&settings.db_path)?;
    db::init_schema(&conn)?;
    let inserted = db::upsert_students(&conn, &rows)
        .with_context(|| format!("Import into {} failed", settings.db_path.display()))?;
    println!(
        "Inserted {} new students ({} already present).",
        inserted,
        rows.len() - inserted
    );
    Ok(())
}

fn status(settings: &Settings) -> anyhow::Result<()> {
    let store = CheckpointStore::new(&settings.checkpoint_path, settings.overall_start);
    let checkpoint = store.load();
    let window = BatchWindow::plan(
        checkpoint,
        settings.overall_start,
        settings.batch_size,
        settings.overall_end,
    );

    println!("Range:      {}..={}", settings.overall_start, settings.overall_end);
    println!("Checkpoint: {} ({})", checkpoint, store.path().display());
    if window.is_exhausted() {
        println!("Next batch: none (range complete)");
    } else {
        println!("Next batch: {}..={} ({} rolls)", window.start, window.end, window.len());
    }
    println!("Records:    {}", count_records(&settings.sink_path)?);
    let failed: BTreeSet<_> = sink::load_failed(&settings.failed_path)?
        .into_iter()
        .map(|f| f.roll)
        .collect();
    println!("Failed:     {}", failed.len());
    if settings.db_path.exists() {
        let conn = db::connect(&settings.db_path)?;
        db::init_schema(&conn)?;
        println!("Imported:   {}", db::count_students(&conn)?);
    }
    Ok(())
}

fn count_records(path: &Path) -> anyhow::Result<usize> {
    if !path.exists() {
        return Ok(0);
    }
    Ok(sink::load(path)?.len())
}

fn print_summary(s: &RunSummary) {
    match s.end {
        RunEnd::RangeExhausted => {
            println!("Overall range already complete (checkpoint {}).", s.checkpoint);
            return;
        }
        RunEnd::Completed => println!("Batch {}..={} completed.", s.window.start, s.window.end),
        RunEnd::CircuitOpen { after } => {
            println!("Stopped early: too many consecutive failures (last at roll {}).", after)
        }
        RunEnd::Blocked { at } => println!("Stopped at roll {}: retries exhausted.", at),
    }
    println!(
        "Harvested {}, failed {}. Last scraped roll: {}",
        s.harvested, s.exhausted, s.checkpoint
    );
}

fn print_student(s: &normalize::CanonicalRecord) {
    println!("\n{} {} ({})", s.exam_type, s.year, s.board);
    println!("  Roll:        {}", s.roll_number);
    println!("  Name:        {}", s.student_name);
    println!("  Institution: {}", s.institution_name);
    println!("  Group:       {}", s.group_name);
    println!("  GPA:         {}  Total: {}", s.gpa, s.total_marks);
    for (code, m) in &s.subject_marks {
        println!("    {:>4} {:<28} {:>4} {}", code, truncate(&m.name, 28), m.score, m.grade);
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
