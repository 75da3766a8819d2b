use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use tracing_subscriber::EnvFilter;

use matchday_oracle::batch::{BatchReport, run_batch};
use matchday_oracle::config::EngineConfig;
use matchday_oracle::records::{MemoryStore, RecordStore, SqliteStore, write_json_report};
use matchday_oracle::snapshot::BatchSnapshot;

const USAGE: &str = "usage: matchday_oracle --snapshot <file.json> [--config <file.json>] [--db <file.sqlite>] [--report <file.json>]";

fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    let _ = dotenvy::from_filename(".env");
    init_tracing();

    if has_flag("--help") || has_flag("-h") {
        println!("{USAGE}");
        return Ok(());
    }

    let snapshot_path = parse_path_arg("--snapshot")
        .or_else(|| std::env::var("SNAPSHOT_PATH").ok().map(PathBuf::from))
        .ok_or_else(|| anyhow!("missing --snapshot\n{USAGE}"))?;
    let config_path = parse_path_arg("--config");
    let db_path = parse_path_arg("--db").or_else(|| std::env::var("RECORDS_DB").ok().map(PathBuf::from));
    let report_path = parse_path_arg("--report");

    let config = EngineConfig::load(config_path.as_deref()).context("invalid configuration")?;
    let snapshot = BatchSnapshot::load(&snapshot_path)
        .with_context(|| format!("load snapshot {}", snapshot_path.display()))?;

    let mut store: Box<dyn RecordStore> = match db_path.as_ref() {
        Some(path) => Box::new(
            SqliteStore::open(path).with_context(|| format!("open sqlite db {}", path.display()))?,
        ),
        None => Box::new(MemoryStore::new()),
    };

    let report = run_batch(&snapshot, &config, store.as_mut()).context("batch aborted")?;
    print_report(&report);

    if let Some(path) = report_path {
        write_json_report(&path, &report)
            .with_context(|| format!("write report {}", path.display()))?;
        println!("report written to {}", path.display());
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn print_report(report: &BatchReport) {
    println!(
        "fixtures={} published={} pending={} skipped={}",
        report.fixtures_total,
        report.published.len(),
        report.pending.len(),
        report.skipped.len()
    );
    for s in &report.published {
        let (h, d, a) = s.sign_percentages.unwrap_or((0.0, 0.0, 0.0));
        println!(
            "  {:<16} {} vs {}  1={h:.1}% X={d:.1}% 2={a:.1}%  recs={} findings={}",
            s.fixture_id, s.home_team, s.away_team, s.recommendations, s.findings
        );
    }
    for r in &report.recommendations {
        println!(
            "  {:<16} {:<6} {:<10} conf={:>5.1} stars={} [{}]",
            r.fixture_id,
            r.market_type,
            r.predicted_value,
            r.confidence,
            r.stars,
            r.provenance
                .iter()
                .map(|e| e.label())
                .collect::<Vec<_>>()
                .join(",")
        );
    }
    for f in &report.findings {
        println!("  {:<16} [{}] {}", f.fixture_id, f.severity.label(), f.message);
    }
    for s in report.pending.iter() {
        println!("  pending {}: {}", s.fixture_id, s.reason);
    }
    for s in report.skipped.iter() {
        println!("  skipped {}: {}", s.fixture_id, s.reason);
    }
}

fn parse_path_arg(name: &str) -> Option<PathBuf> {
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    for (idx, arg) in args.iter().enumerate() {
        if let Some(raw) = arg.strip_prefix(&format!("{name}="))
            && !raw.trim().is_empty()
        {
            return Some(PathBuf::from(raw.trim()));
        }
        if arg == name
            && let Some(next) = args.get(idx + 1)
            && !next.trim().is_empty()
        {
            return Some(PathBuf::from(next));
        }
    }
    None
}

fn has_flag(name: &str) -> bool {
    std::env::args().skip(1).any(|arg| arg == name)
}
