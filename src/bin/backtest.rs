use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use rayon::prelude::*;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use matchday_oracle::calibration::{self, Outcome, Prob3};
use matchday_oracle::config::EngineConfig;
use matchday_oracle::league_params::BaselineBook;
use matchday_oracle::odds::ImpliedProbabilities;
use matchday_oracle::orchestrator::{EngineContext, EngineKind, run_engine};
use matchday_oracle::snapshot::{BatchSnapshot, FinalScore, Fixture};
use matchday_oracle::team_strength::PeerIndex;

const DEFAULT_BINS: usize = 10;

#[derive(Debug, Clone, Copy)]
struct Scored {
    model: Prob3,
    market: Option<Prob3>,
    outcome: Outcome,
}

#[derive(Debug, Clone)]
struct LeagueReport {
    league: String,
    samples: usize,
    model: calibration::Metrics,
    ece: f64,
    priced: usize,
    model_priced: calibration::Metrics,
    market: calibration::Metrics,
}

fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    let _ = dotenvy::from_filename(".env");
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();

    let snapshot_path = parse_path_arg("--snapshot")
        .or_else(|| std::env::var("SNAPSHOT_PATH").ok().map(PathBuf::from))
        .context("missing --snapshot")?;
    let config = EngineConfig::load(parse_path_arg("--config").as_deref())
        .context("invalid configuration")?;
    let engine = match parse_str_arg("--engine") {
        Some(raw) => raw.parse::<EngineKind>()?,
        None => EngineKind::Production,
    };
    let bins = parse_usize_arg("--bins").unwrap_or(DEFAULT_BINS).clamp(2, 50);
    let verbose = has_flag("--verbose");

    let snapshot = BatchSnapshot::load(&snapshot_path)
        .with_context(|| format!("load snapshot {}", snapshot_path.display()))?;
    // The backtest may target an engine the batch config leaves disabled.
    let variant = EngineConfig {
        engines_enabled: vec![engine],
        ..config.clone()
    }
    .variants()
    .into_iter()
    .next()
    .ok_or_else(|| anyhow!("engine {engine} unavailable"))?;

    let teams = snapshot.team_index();
    let peers = PeerIndex::build(&snapshot.teams);
    let baselines = BaselineBook::build(&snapshot.baselines, &snapshot.fixtures);

    let settled: Vec<(&Fixture, FinalScore)> = snapshot
        .fixtures
        .iter()
        .filter_map(|f| f.result.map(|r| (f, r)))
        .collect();
    if settled.is_empty() {
        return Err(anyhow!("snapshot has no settled fixtures"));
    }

    let scored: Vec<(String, Scored)> = settled
        .par_iter()
        .filter_map(|(fixture, result)| {
            let resolved = match snapshot.resolve(fixture, &teams) {
                Ok(r) => r,
                Err(err) => {
                    warn!(fixture = %fixture.fixture_id, error = %err, "fixture skipped");
                    return None;
                }
            };
            let ctx = EngineContext {
                resolved,
                peers: &peers,
                baseline: baselines.get(&fixture.league),
                h2h_weight: config.h2h_weight,
                seed: config.seed,
            };
            let output = match run_engine(&variant, &ctx, None) {
                Ok(o) => o,
                Err(err) => {
                    warn!(fixture = %fixture.fixture_id, error = %err, "engine failed");
                    return None;
                }
            };
            let market = fixture
                .odds
                .as_ref()
                .and_then(|o| ImpliedProbabilities::from_odds(o).sign);
            if verbose {
                let p = output.report.sign_probabilities();
                println!(
                    "{:<16} {}-{}  1={:.3} X={:.3} 2={:.3}",
                    fixture.fixture_id, result.home_goals, result.away_goals, p.home, p.draw, p.away
                );
            }
            Some((
                fixture.league.clone(),
                Scored {
                    model: output.report.sign_probabilities().normalized(),
                    market,
                    outcome: Outcome::of(*result),
                },
            ))
        })
        .collect();

    let mut by_league: BTreeMap<String, Vec<Scored>> = BTreeMap::new();
    for (league, s) in &scored {
        by_league.entry(league.clone()).or_default().push(*s);
    }

    let reports: Vec<LeagueReport> = by_league
        .iter()
        .map(|(league, rows)| league_report(league, rows, bins))
        .collect();
    for r in &reports {
        println!(
            "league {} samples={} brier={:.4} ll={:.4} acc={:.3} ece={:.4} priced={} ll_model={:.4} ll_market={:.4}",
            r.league,
            r.samples,
            r.model.brier,
            r.model.log_loss,
            r.model.accuracy,
            r.ece,
            r.priced,
            r.model_priced.log_loss,
            r.market.log_loss
        );
    }

    let all: Vec<Scored> = scored.into_iter().map(|(_, s)| s).collect();
    let total = league_report("ALL", &all, bins);
    println!(
        "engine={} fixtures={} scored={} brier={:.4} ll={:.4} acc={:.3} ece={:.4}",
        engine,
        settled.len(),
        total.samples,
        total.model.brier,
        total.model.log_loss,
        total.model.accuracy,
        total.ece
    );
    if total.priced > 0 {
        println!(
            "vs market on {} priced fixtures: brier {:.4} / {:.4}  ll {:.4} / {:.4}",
            total.priced,
            total.model_priced.brier,
            total.market.brier,
            total.model_priced.log_loss,
            total.market.log_loss
        );
    }
    Ok(())
}

fn league_report(league: &str, rows: &[Scored], bins: usize) -> LeagueReport {
    let preds: Vec<Prob3> = rows.iter().map(|s| s.model).collect();
    let outcomes: Vec<Outcome> = rows.iter().map(|s| s.outcome).collect();

    let priced: Vec<(Prob3, Prob3, Outcome)> = rows
        .iter()
        .filter_map(|s| s.market.map(|m| (s.model, m, s.outcome)))
        .collect();
    let priced_model: Vec<Prob3> = priced.iter().map(|(p, _, _)| *p).collect();
    let priced_market: Vec<Prob3> = priced.iter().map(|(_, m, _)| *m).collect();
    let priced_outcomes: Vec<Outcome> = priced.iter().map(|(_, _, o)| *o).collect();

    LeagueReport {
        league: league.to_string(),
        samples: rows.len(),
        model: calibration::evaluate_probs(&preds, &outcomes),
        ece: ece_1x2(&preds, &outcomes, bins),
        priced: priced.len(),
        model_priced: calibration::evaluate_probs(&priced_model, &priced_outcomes),
        market: calibration::evaluate_probs(&priced_market, &priced_outcomes),
    }
}

fn ece_1x2(preds: &[Prob3], outcomes: &[Outcome], bins: usize) -> f64 {
    if preds.is_empty() || preds.len() != outcomes.len() {
        return 0.0;
    }
    [Outcome::Home, Outcome::Draw, Outcome::Away]
        .into_iter()
        .map(|c| {
            calibration::expected_calibration_error(&calibration::calibration_bins(
                preds, outcomes, c, bins,
            ))
        })
        .sum::<f64>()
        / 3.0
}

fn parse_str_arg(name: &str) -> Option<String> {
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    for (idx, arg) in args.iter().enumerate() {
        if let Some(raw) = arg.strip_prefix(&format!("{name}="))
            && !raw.trim().is_empty()
        {
            return Some(raw.trim().to_string());
        }
        if arg == name
            && let Some(next) = args.get(idx + 1)
            && !next.trim().is_empty()
        {
            return Some(next.trim().to_string());
        }
    }
    None
}

fn parse_path_arg(name: &str) -> Option<PathBuf> {
    parse_str_arg(name).map(PathBuf::from)
}

fn parse_usize_arg(name: &str) -> Option<usize> {
    parse_str_arg(name).and_then(|raw| raw.parse::<usize>().ok())
}

fn has_flag(name: &str) -> bool {
    std::env::args().skip(1).any(|arg| arg == name)
}
