use std::collections::HashMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::league_params::BaselineBook;
use crate::match_analysis::{Finding, MatchSignals, explain};
use crate::odds::ImpliedProbabilities;
use crate::orchestrator::{
    EngineContext, EngineKind, EngineVariant, FixturePipeline, FixtureStage, MergePolicy,
    run_engines,
};
use crate::records::{FindingRecord, RecommendationRecord, RecordStore};
use crate::snapshot::{BatchSnapshot, Fixture, TeamProfile};
use crate::team_strength::PeerIndex;

#[derive(Debug, Clone, Serialize)]
pub struct SkippedFixture {
    pub fixture_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FixtureSummary {
    pub fixture_id: String,
    pub home_team: String,
    pub away_team: String,
    pub stage: FixtureStage,
    pub engines: Vec<EngineKind>,
    pub failed_engines: Vec<String>,
    pub expected_goals: Option<(f64, f64)>,
    /// 1X2 percentages of the primary engine.
    pub sign_percentages: Option<(f64, f64, f64)>,
    pub recommendations: usize,
    pub findings: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub fixtures_total: usize,
    pub published: Vec<FixtureSummary>,
    /// Left for a retry: no engine succeeded, or the store refused the records.
    pub pending: Vec<SkippedFixture>,
    pub skipped: Vec<SkippedFixture>,
    pub recommendations: Vec<RecommendationRecord>,
    pub findings: Vec<FindingRecord>,
}

impl FixtureSummary {
    pub fn from_pipeline(
        pipeline: &FixturePipeline,
        home_team: String,
        away_team: String,
        recommendations: usize,
        findings: usize,
    ) -> Self {
        let primary = pipeline.primary();
        Self {
            fixture_id: pipeline.fixture_id().to_string(),
            home_team,
            away_team,
            stage: pipeline.stage(),
            engines: pipeline.outputs().iter().map(|o| o.engine).collect(),
            failed_engines: pipeline.failures().iter().map(|f| f.to_string()).collect(),
            expected_goals: primary.map(|o| (o.expected.home, o.expected.away)),
            sign_percentages: primary.map(|o| o.report.sign_percentages()),
            recommendations,
            findings,
        }
    }
}

impl BatchReport {
    pub fn summary(&self, fixture_id: &str) -> Option<&FixtureSummary> {
        self.published.iter().find(|s| s.fixture_id == fixture_id)
    }

    pub fn skip_reason(&self, fixture_id: &str) -> Option<&str> {
        self.skipped
            .iter()
            .chain(self.pending.iter())
            .find(|s| s.fixture_id == fixture_id)
            .map(|s| s.reason.as_str())
    }
}

struct Processed {
    pipeline: FixturePipeline,
    home_team: String,
    away_team: String,
    findings: Vec<Finding>,
}

enum FixtureResult {
    Merged(Box<Processed>),
    Pending(SkippedFixture),
    Skipped(SkippedFixture),
}

struct BatchContext<'a> {
    snapshot: &'a BatchSnapshot,
    config: &'a EngineConfig,
    teams: HashMap<&'a str, &'a TeamProfile>,
    peers: PeerIndex,
    baselines: BaselineBook,
    variants: Vec<EngineVariant>,
    policy: MergePolicy,
    generated_at: DateTime<Utc>,
}

/// Fixtures run in parallel and never share mutable state. A bad fixture is skipped with a
/// reason and one whose engines all failed stays pending. Only configuration problems abort.
pub fn run_batch(
    snapshot: &BatchSnapshot,
    config: &EngineConfig,
    store: &mut dyn RecordStore,
) -> Result<BatchReport, EngineError> {
    config.validate()?;
    let started_at = Utc::now();

    let ctx = BatchContext {
        snapshot,
        config,
        teams: snapshot.team_index(),
        peers: PeerIndex::build(&snapshot.teams),
        baselines: BaselineBook::build(&snapshot.baselines, &snapshot.fixtures),
        variants: config.variants(),
        policy: config.merge_policy(),
        generated_at: started_at,
    };

    let mut skipped = Vec::new();
    let mut runnable: Vec<&Fixture> = Vec::new();
    for f in &snapshot.fixtures {
        if f.is_settled() && !config.include_settled {
            skipped.push(SkippedFixture {
                fixture_id: f.fixture_id.clone(),
                reason: "settled".to_string(),
            });
        } else {
            runnable.push(f);
        }
    }

    info!(
        fixtures = runnable.len(),
        settled = skipped.len(),
        engines = ctx.variants.len(),
        trials = config.trials,
        mode = %config.mode,
        "batch started"
    );

    let results: Vec<FixtureResult> = with_worker_pool(config.worker_threads, || {
        runnable
            .par_iter()
            .map(|f| process_fixture(&ctx, f))
            .collect()
    });

    let mut published = Vec::new();
    let mut pending = Vec::new();
    let mut recommendations = Vec::new();
    let mut findings = Vec::new();

    // Writes happen here, after the parallel phase, one fixture at a time.
    for result in results {
        let processed = match result {
            FixtureResult::Merged(p) => p,
            FixtureResult::Pending(s) => {
                pending.push(s);
                continue;
            }
            FixtureResult::Skipped(s) => {
                skipped.push(s);
                continue;
            }
        };
        let Processed {
            mut pipeline,
            home_team,
            away_team,
            findings: fixture_findings,
        } = *processed;

        let recs: Vec<RecommendationRecord> = pipeline
            .merged()
            .map(|m| m.recommendations.iter().map(RecommendationRecord::from).collect())
            .unwrap_or_default();
        let finding_records: Vec<FindingRecord> =
            fixture_findings.iter().map(FindingRecord::from).collect();

        if let Err(err) = store.replace_fixture(pipeline.fixture_id(), &recs, &finding_records) {
            warn!(fixture = %pipeline.fixture_id(), error = %err, "store rejected records");
            pending.push(SkippedFixture {
                fixture_id: pipeline.fixture_id().to_string(),
                reason: format!("store error: {err}"),
            });
            continue;
        }
        pipeline.mark_published()?;

        published.push(FixtureSummary::from_pipeline(
            &pipeline,
            home_team,
            away_team,
            recs.len(),
            finding_records.len(),
        ));
        recommendations.extend(recs);
        findings.extend(finding_records);
    }

    for s in skipped.iter().chain(pending.iter()) {
        warn!(fixture = %s.fixture_id, reason = %s.reason, "fixture not published");
    }
    info!(
        published = published.len(),
        pending = pending.len(),
        skipped = skipped.len(),
        recommendations = recommendations.len(),
        findings = findings.len(),
        "batch finished"
    );

    Ok(BatchReport {
        started_at,
        finished_at: Utc::now(),
        fixtures_total: snapshot.fixtures.len(),
        published,
        pending,
        skipped,
        recommendations,
        findings,
    })
}

fn process_fixture(ctx: &BatchContext<'_>, fixture: &Fixture) -> FixtureResult {
    let skip = |reason: String| SkippedFixture {
        fixture_id: fixture.fixture_id.clone(),
        reason,
    };

    let resolved = match ctx.snapshot.resolve(fixture, &ctx.teams) {
        Ok(r) => r,
        Err(err) => return FixtureResult::Skipped(skip(err.to_string())),
    };

    let engine_ctx = EngineContext {
        resolved,
        peers: &ctx.peers,
        baseline: ctx.baselines.get(&fixture.league),
        h2h_weight: ctx.config.h2h_weight,
        seed: ctx.config.seed,
    };
    let results = run_engines(
        &ctx.variants,
        &engine_ctx,
        ctx.config.budget(Instant::now()),
    );

    let mut pipeline = FixturePipeline::new(fixture.fixture_id.clone());
    if let Err(err) = pipeline.record_engines(results) {
        let failures = pipeline.failures();
        // Nothing to retry when every engine hit a problem in the input itself.
        let retryable = failures.is_empty() || failures.iter().any(|f| f.error.is_retryable());
        let reason = match failures.first() {
            Some(first) if !retryable => first.error.to_string(),
            _ => err.to_string(),
        };
        return if retryable {
            FixtureResult::Pending(skip(reason))
        } else {
            FixtureResult::Skipped(skip(reason))
        };
    }

    if let Err(err) = pipeline.merge(&ctx.policy, ctx.generated_at) {
        return FixtureResult::Skipped(skip(err.to_string()));
    }

    let findings = match (pipeline.primary(), pipeline.merged()) {
        (Some(primary), Some(merged)) => {
            let signals = MatchSignals {
                home_name: resolved.home.display_name(),
                away_name: resolved.away.display_name(),
                home: &primary.home,
                away: &primary.away,
                report: &primary.report,
                dissents: &merged.dissents,
                implied: fixture.odds.as_ref().map(ImpliedProbabilities::from_odds),
            };
            explain(fixture, &merged.recommendations, &signals)
        }
        _ => Vec::new(),
    };

    FixtureResult::Merged(Box::new(Processed {
        pipeline,
        home_team: resolved.home.team_id.clone(),
        away_team: resolved.away.team_id.clone(),
        findings,
    }))
}

fn with_worker_pool<T>(threads: usize, action: impl FnOnce() -> T + Send) -> T
where
    T: Send,
{
    let mut builder = rayon::ThreadPoolBuilder::new();
    if threads > 0 {
        builder = builder.num_threads(threads);
    }
    match builder.build() {
        Ok(pool) => pool.install(action),
        Err(_) => action(),
    }
}
