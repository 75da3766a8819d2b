use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{TimeZone, Utc};

use matchday_oracle::batch::{FixtureSummary, run_batch};
use matchday_oracle::config::EngineConfig;
use matchday_oracle::error::{ConfigError, EngineError};
use matchday_oracle::league_params::BaselineBook;
use matchday_oracle::markets::Market;
use matchday_oracle::match_analysis::Severity;
use matchday_oracle::orchestrator::{
    EngineContext, EngineFailure, EngineKind, FixturePipeline, FixtureStage, run_engine,
};
use matchday_oracle::records::{MemoryStore, RecordStore, SqliteStore};
use matchday_oracle::snapshot::BatchSnapshot;
use matchday_oracle::team_strength::PeerIndex;

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

fn quick_config() -> EngineConfig {
    EngineConfig {
        trials: 3_000,
        ..EngineConfig::default()
    }
}

/// Accept every market the engines agree on.
fn permissive_config() -> EngineConfig {
    EngineConfig {
        merge_tolerance: 100.0,
        confidence_thresholds: Market::ALL.iter().map(|m| (*m, 0.0)).collect::<BTreeMap<_, _>>(),
        ..quick_config()
    }
}

#[test]
fn bad_fixtures_are_isolated_and_the_rest_publish() {
    let snap = snapshot();
    let mut store = MemoryStore::new();
    let report = run_batch(&snap, &quick_config(), &mut store).expect("batch should run");

    assert_eq!(report.fixtures_total, 6);
    let mut published: Vec<&str> = report
        .published
        .iter()
        .map(|s| s.fixture_id.as_str())
        .collect();
    published.sort_unstable();
    assert_eq!(
        published,
        vec!["sa-inter-lecce", "sa-milan-roma", "sa-roma-newcomer"]
    );
    assert!(report.pending.is_empty());

    assert_eq!(report.skip_reason("sa-milan-inter"), Some("settled"));
    assert!(
        report
            .skip_reason("sa-lecce-lecce")
            .is_some_and(|r| r.contains("both sides"))
    );
    assert!(
        report
            .skip_reason("sa-inter-ghost")
            .is_some_and(|r| r.contains("unknown away team ghost"))
    );

    for s in &report.published {
        assert_eq!(s.stage, FixtureStage::Published);
        assert_eq!(s.engines, vec![EngineKind::Production, EngineKind::Sandbox]);
        assert!(s.failed_engines.is_empty());
        let (h, d, a) = s.sign_percentages.expect("primary engine output");
        assert!((h + d + a - 100.0).abs() < 1e-9);
    }
    assert_eq!(store.fixture_count(), 3);
}

#[test]
fn stronger_home_side_dominates_the_sign() {
    let snap = snapshot();
    let mut store = MemoryStore::new();
    let report = run_batch(&snap, &quick_config(), &mut store).unwrap();

    let summary = report.summary("sa-inter-lecce").expect("published");
    let (home, _, away) = summary.sign_percentages.unwrap();
    assert!(home > 70.0, "home share {home}");
    assert!(away < 10.0, "away share {away}");
    let (lh, la) = summary.expected_goals.unwrap();
    assert!(lh > la);
}

#[test]
fn every_recommendation_clears_its_threshold() {
    let snap = snapshot();
    let config = quick_config();
    let policy = config.merge_policy();
    let mut store = MemoryStore::new();
    let report = run_batch(&snap, &config, &mut store).unwrap();

    for r in &report.recommendations {
        assert!(r.confidence + 0.05 >= policy.threshold(r.market_type), "{r:?}");
        assert!((1..=5).contains(&r.stars) || r.confidence < 45.0, "{r:?}");
        assert_eq!(r.provenance.first(), Some(&EngineKind::Production));
        assert_eq!(r.generated_at, report.started_at);
    }
}

#[test]
fn rerun_reproduces_the_same_records_without_duplicates() {
    let snap = snapshot();
    let config = permissive_config();
    let mut store = MemoryStore::new();

    let first = run_batch(&snap, &config, &mut store).unwrap();
    let count_after_first = store.recommendation_count();
    let second = run_batch(&snap, &config, &mut store).unwrap();

    assert!(count_after_first > 0);
    assert_eq!(store.recommendation_count(), count_after_first);
    assert_eq!(first.recommendations.len(), second.recommendations.len());
    for (a, b) in first.recommendations.iter().zip(&second.recommendations) {
        assert_eq!(a.fixture_id, b.fixture_id);
        assert_eq!(a.market_type, b.market_type);
        assert_eq!(a.predicted_value, b.predicted_value);
        assert_eq!(a.confidence, b.confidence);
        assert_eq!(a.stars, b.stars);
        assert_eq!(a.provenance, b.provenance);
    }
}

#[test]
fn sqlite_rerun_overwrites_previous_records() {
    let snap = snapshot();
    let config = permissive_config();
    let mut store = SqliteStore::open_in_memory().unwrap();

    let first = run_batch(&snap, &config, &mut store).unwrap();
    run_batch(&snap, &config, &mut store).unwrap();

    for s in &first.published {
        let stored = store.recommendations(&s.fixture_id).unwrap();
        assert_eq!(stored.len(), s.recommendations);
        assert_eq!(store.findings(&s.fixture_id).unwrap().len(), s.findings);
    }
}

#[test]
fn defaulted_profile_is_called_out() {
    let snap = snapshot();
    let mut store = MemoryStore::new();
    let report = run_batch(&snap, &permissive_config(), &mut store).unwrap();

    let thin = report
        .findings
        .iter()
        .find(|f| f.fixture_id == "sa-roma-newcomer" && f.message.contains("defaulted signals"))
        .expect("thin data finding");
    assert_eq!(thin.severity, Severity::Warning);
    assert!(thin.message.contains("newcomer with 7 defaulted signals"));
}

#[test]
fn zero_trials_aborts_before_any_write() {
    let snap = snapshot();
    let mut store = MemoryStore::new();
    let config = EngineConfig {
        trials: 0,
        ..EngineConfig::default()
    };
    let err = run_batch(&snap, &config, &mut store).unwrap_err();
    assert_eq!(err, EngineError::Config(ConfigError::ZeroTrials));
    assert_eq!(store.fixture_count(), 0);
}

#[test]
fn oversized_trial_count_is_a_config_error() {
    let snap = snapshot();
    let mut store = MemoryStore::new();
    let config = EngineConfig {
        trials: usize::MAX / 4,
        engines_enabled: vec![EngineKind::Production],
        ..EngineConfig::default()
    };
    let err = run_batch(&snap, &config, &mut store).unwrap_err();
    assert!(
        matches!(
            err,
            EngineError::Config(ConfigError::InvalidValue { ref key, .. }) if key == "trials"
        ),
        "{err:?}"
    );
    assert_eq!(store.fixture_count(), 0);
}

#[test]
fn timed_out_engine_is_left_out_of_the_merge() {
    let snap = snapshot();
    let teams = snap.team_index();
    let peers = PeerIndex::build(&snap.teams);
    let baselines = BaselineBook::build(&snap.baselines, &snap.fixtures);
    let config = permissive_config();
    let fixture = snap
        .fixtures
        .iter()
        .find(|f| f.fixture_id == "sa-milan-roma")
        .unwrap();
    let ctx = EngineContext {
        resolved: snap.resolve(fixture, &teams).unwrap(),
        peers: &peers,
        baseline: baselines.get(&fixture.league),
        h2h_weight: config.h2h_weight,
        seed: config.seed,
    };
    let production = config
        .variants()
        .into_iter()
        .find(|v| v.kind == EngineKind::Production)
        .unwrap();

    let mut pipeline = FixturePipeline::new(fixture.fixture_id.clone());
    pipeline
        .record_engines(vec![
            Ok(run_engine(&production, &ctx, None).unwrap()),
            Err(EngineFailure {
                engine: EngineKind::Sandbox,
                error: EngineError::EngineTimeout {
                    engine: EngineKind::Sandbox,
                    budget: Duration::from_millis(10),
                },
            }),
        ])
        .expect("one engine succeeded");
    assert_eq!(pipeline.stage(), FixtureStage::EnginesComputed);

    let generated_at = Utc.with_ymd_and_hms(2026, 10, 17, 9, 0, 0).unwrap();
    let merged = pipeline
        .merge(&config.merge_policy(), generated_at)
        .unwrap()
        .clone();
    assert!(!merged.recommendations.is_empty());
    assert!(merged.dissents.is_empty());
    for r in &merged.recommendations {
        assert_eq!(r.provenance, vec![EngineKind::Production]);
    }
    pipeline.mark_published().unwrap();

    let summary = FixtureSummary::from_pipeline(
        &pipeline,
        "milan".to_string(),
        "roma".to_string(),
        merged.recommendations.len(),
        0,
    );
    assert_eq!(summary.stage, FixtureStage::Published);
    assert_eq!(summary.engines, vec![EngineKind::Production]);
    assert_eq!(summary.failed_engines.len(), 1);
    assert!(
        summary.failed_engines[0].starts_with(&EngineKind::Sandbox.to_string()),
        "{}",
        summary.failed_engines[0]
    );
}

#[test]
fn settled_fixtures_run_on_request() {
    let snap = snapshot();
    let mut store = MemoryStore::new();
    let config = EngineConfig {
        include_settled: true,
        ..quick_config()
    };
    let report = run_batch(&snap, &config, &mut store).unwrap();
    assert!(report.summary("sa-milan-inter").is_some());
    assert_eq!(report.skipped.len(), 2);
}

#[test]
fn exhausted_fixture_budget_leaves_fixtures_pending() {
    let snap = snapshot();
    let mut store = MemoryStore::new();
    let config = EngineConfig {
        fixture_timeout_ms: Some(0),
        ..quick_config()
    };
    let report = run_batch(&snap, &config, &mut store).unwrap();

    assert!(report.published.is_empty());
    assert_eq!(report.pending.len(), 3);
    for p in &report.pending {
        assert!(p.reason.contains("no successful engine"), "{}", p.reason);
    }
    assert_eq!(store.fixture_count(), 0);
}

#[test]
fn heavy_engine_joins_the_merge_when_enabled() {
    let snap = snapshot();
    let mut store = MemoryStore::new();
    let config = EngineConfig {
        trials: 500,
        engines_enabled: vec![
            EngineKind::HeavyMonteCarlo,
            EngineKind::Production,
            EngineKind::Sandbox,
        ],
        heavy_trials_multiplier: 4,
        ..permissive_config()
    };
    let report = run_batch(&snap, &config, &mut store).unwrap();
    let summary = report.summary("sa-milan-roma").unwrap();
    assert_eq!(
        summary.engines,
        vec![
            EngineKind::Production,
            EngineKind::Sandbox,
            EngineKind::HeavyMonteCarlo
        ]
    );
    for r in report
        .recommendations
        .iter()
        .filter(|r| r.fixture_id == "sa-milan-roma")
    {
        assert_eq!(r.provenance.len(), 3);
    }
}
