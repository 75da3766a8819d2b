use std::fs;
use std::path::PathBuf;

use chrono::{TimeZone, Utc};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use matchday_oracle::confidence::{AnalyzerSettings, OutcomeReport, analyze};
use matchday_oracle::config::EngineConfig;
use matchday_oracle::league_params::{BaselineBook, LeagueBaseline};
use matchday_oracle::markets::{Market, Selection};
use matchday_oracle::match_analysis::{CheckKind, MatchSignals, explain};
use matchday_oracle::orchestrator::{
    EngineContext, EngineKind, MergePolicy, merge_reports, run_engine,
};
use matchday_oracle::simulator::{SimMode, Simulator, TrialScore};
use matchday_oracle::snapshot::{BatchSnapshot, Venue};
use matchday_oracle::team_strength::{
    DefaultSource, PeerIndex, PowerRating, Signal, StrengthModel, StrengthWeights,
};

fn read_fixture(name: &str) -> String {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("tests");
    path.push("fixtures");
    path.push(name);
    fs::read_to_string(path).expect("fixture file should be readable")
}

fn snapshot() -> BatchSnapshot {
    BatchSnapshot::from_json_str(&read_fixture("snapshot.json")).expect("snapshot should parse")
}

#[test]
fn evenly_matched_sides_draw_more_often_than_either_wins() {
    let sim = Simulator::default();
    let home = PowerRating::neutral("home", Venue::Home);
    let away = PowerRating::neutral("away", Venue::Away);
    let baseline = LeagueBaseline::new(1.3, 1.1);
    let mut rng = ChaCha8Rng::seed_from_u64(2026);

    let run = sim
        .simulate(
            Some(&home),
            Some(&away),
            &baseline,
            5_000,
            SimMode::Balanced,
            &mut rng,
        )
        .unwrap();
    let report = analyze(&run.trials, &AnalyzerSettings::default()).unwrap();
    let p = report.sign_probabilities();

    assert!(p.draw > p.home, "draw {} home {}", p.draw, p.home);
    assert!(p.draw > p.away, "draw {} away {}", p.draw, p.away);
    let mean_total = report.stats.mean_total;
    assert!((mean_total - 2.4).abs() < 0.3, "mean total {mean_total}");
}

#[test]
fn unscored_team_degrades_to_league_averages() {
    let snap = snapshot();
    let peers = PeerIndex::build(&snap.teams);
    let model = StrengthModel::new(&peers, StrengthWeights::default());
    let newcomer = snap
        .teams
        .iter()
        .find(|t| t.team_id == "newcomer")
        .unwrap();

    let rating = model.compute_team_power(newcomer, Venue::Away).unwrap();
    assert_eq!(rating.defaulted_count(), Signal::ALL.len());
    assert_eq!(rating.warnings.len(), Signal::ALL.len());
    assert!((0.0..=100.0).contains(&rating.rating));
    for c in &rating.breakdown {
        assert!(c.defaulted);
        assert_eq!(c.default_source, Some(DefaultSource::PeerAverage));
    }
    let again = model.compute_team_power(newcomer, Venue::Away).unwrap();
    assert_eq!(rating, again);
}

#[test]
fn lone_team_in_its_league_rates_mid_scale() {
    let snap = snapshot();
    let peers = PeerIndex::build(&snap.teams);
    let model = StrengthModel::new(&peers, StrengthWeights::default());
    let lonely = snap.teams.iter().find(|t| t.team_id == "lonely").unwrap();

    let rating = model.compute_team_power(lonely, Venue::Home).unwrap();
    assert!((rating.rating - 50.0).abs() < 1e-9, "{}", rating.rating);
    let mv = rating.contribution(Signal::MarketValue).unwrap();
    assert!(mv.raw.is_none());
    assert_eq!(mv.default_source, Some(DefaultSource::Neutral));
}

#[test]
fn peer_extremes_span_the_scale() {
    let snap = snapshot();
    let peers = PeerIndex::build(&snap.teams);
    let model = StrengthModel::new(&peers, StrengthWeights::default());
    let team = |id: &str| snap.teams.iter().find(|t| t.team_id == id).unwrap();

    let inter = model.compute_team_power(team("inter"), Venue::Home).unwrap();
    let lecce = model.compute_team_power(team("lecce"), Venue::Home).unwrap();
    assert!(inter.rating > 90.0, "inter {}", inter.rating);
    assert!(lecce.rating < 10.0, "lecce {}", lecce.rating);
    assert_eq!(inter.attack, 100.0);
    assert_eq!(lecce.defense, 0.0);
}

#[test]
fn engine_run_is_reproducible_for_a_fixed_seed() {
    let snap = snapshot();
    let teams = snap.team_index();
    let peers = PeerIndex::build(&snap.teams);
    let baselines = BaselineBook::build(&snap.baselines, &snap.fixtures);
    let config = EngineConfig {
        trials: 2_000,
        ..EngineConfig::default()
    };
    let fixture = &snap.fixtures[1];
    let ctx = EngineContext {
        resolved: snap.resolve(fixture, &teams).unwrap(),
        peers: &peers,
        baseline: baselines.get(&fixture.league),
        h2h_weight: config.h2h_weight,
        seed: config.seed,
    };

    for variant in config.variants() {
        let a = run_engine(&variant, &ctx, None).unwrap();
        let b = run_engine(&variant, &ctx, None).unwrap();
        assert_eq!(a.report, b.report);
        assert_eq!(a.expected, b.expected);
    }
}

fn lopsided_report(home_wins: usize, draws: usize, away_wins: usize) -> OutcomeReport {
    let mut trials = vec![TrialScore::new(1, 0); home_wins];
    trials.extend(vec![TrialScore::new(0, 0); draws]);
    trials.extend(vec![TrialScore::new(0, 1); away_wins]);
    analyze(&trials, &AnalyzerSettings::default()).unwrap()
}

#[test]
fn strong_engine_disagreement_drops_the_market_and_explains_it() {
    let snap = snapshot();
    let fixture = &snap.fixtures[0];
    // Tight distributions: almost no spread penalty, so the edge alone drives confidence.
    let production = lopsided_report(950, 30, 20);
    let sandbox = lopsided_report(400, 330, 270);
    let policy = MergePolicy {
        tolerance: 15.0,
        thresholds: EngineConfig::default().merge_policy().thresholds,
    };
    let generated_at = Utc.with_ymd_and_hms(2026, 10, 17, 9, 0, 0).unwrap();

    let merged = merge_reports(
        &fixture.fixture_id,
        &[
            (EngineKind::Production, &production),
            (EngineKind::Sandbox, &sandbox),
        ],
        &policy,
        generated_at,
    );

    assert!(merged.recommendation(Market::Sign).is_none());
    let dissent = merged
        .dissents
        .iter()
        .find(|d| d.market == Market::Sign)
        .expect("1X2 dissent");
    assert_eq!(dissent.leader, EngineKind::Production);
    assert_eq!(dissent.leader_selection, Selection::Home);
    assert!(dissent.gap > 15.0);

    let home = PowerRating::neutral("inter", Venue::Home);
    let away = PowerRating::neutral("lecce", Venue::Away);
    let signals = MatchSignals {
        home_name: "Inter",
        away_name: "Lecce",
        home: &home,
        away: &away,
        report: &production,
        dissents: &merged.dissents,
        implied: None,
    };
    let findings = explain(fixture, &merged.recommendations, &signals);
    let disagreements: Vec<_> = findings
        .iter()
        .filter(|f| f.check == CheckKind::EngineDisagreement)
        .collect();
    assert_eq!(disagreements.len(), 1);
    assert_eq!(disagreements[0].fixture_id, fixture.fixture_id);
}
