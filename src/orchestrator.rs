//! Runs one fixture under several engine variants and merges their reports.
//!
//! A fixture moves `Pending -> EnginesComputed -> Merged -> Published`. Engines that fail or
//! run past their deadline are left out of the merge; with no engine left the fixture stays
//! `Pending` so a later run can retry it.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::confidence::{AnalyzerSettings, MarketOutcome, OutcomeReport, analyze};
use crate::error::{ConfigError, EngineError};
use crate::league_params::LeagueBaseline;
use crate::markets::{Market, Selection};
use crate::simulator::{Deadline, ExpectedGoals, SimMode, SimOptions, SimParams, Simulator};
use crate::snapshot::{HeadToHead, ResolvedFixture, Venue};
use crate::team_strength::{PeerIndex, PowerRating, StrengthModel, StrengthWeights};

/// Meetings needed before a head-to-head record carries its full weight.
const H2H_FULL_WEIGHT_MEETINGS: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineKind {
    Production,
    Sandbox,
    HeavyMonteCarlo,
}

impl EngineKind {
    /// Tie-break order of the merge, most trusted first.
    pub const ALL: [EngineKind; 3] = [
        EngineKind::Production,
        EngineKind::Sandbox,
        EngineKind::HeavyMonteCarlo,
    ];

    pub fn label(self) -> &'static str {
        match self {
            EngineKind::Production => "production",
            EngineKind::Sandbox => "sandbox",
            EngineKind::HeavyMonteCarlo => "heavy-monte-carlo",
        }
    }

    fn priority(self) -> usize {
        match self {
            EngineKind::Production => 0,
            EngineKind::Sandbox => 1,
            EngineKind::HeavyMonteCarlo => 2,
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for EngineKind {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "production" | "prod" => Ok(EngineKind::Production),
            "sandbox" => Ok(EngineKind::Sandbox),
            "heavy-monte-carlo" | "heavy" => Ok(EngineKind::HeavyMonteCarlo),
            _ => Err(ConfigError::UnknownEngine(raw.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixtureStage {
    Pending,
    EnginesComputed,
    Merged,
    Published,
}

impl FixtureStage {
    pub fn next(self) -> Option<FixtureStage> {
        match self {
            FixtureStage::Pending => Some(FixtureStage::EnginesComputed),
            FixtureStage::EnginesComputed => Some(FixtureStage::Merged),
            FixtureStage::Merged => Some(FixtureStage::Published),
            FixtureStage::Published => None,
        }
    }
}

/// Everything one engine needs beyond the fixture itself.
#[derive(Debug, Clone)]
pub struct EngineVariant {
    pub kind: EngineKind,
    pub weights: StrengthWeights,
    pub mode: SimMode,
    pub trials: usize,
    pub params: SimParams,
    pub analyzer: AnalyzerSettings,
}

#[derive(Debug, Clone)]
pub struct EngineOutput {
    pub engine: EngineKind,
    pub home: PowerRating,
    pub away: PowerRating,
    pub expected: ExpectedGoals,
    pub report: OutcomeReport,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineFailure {
    pub engine: EngineKind,
    pub error: EngineError,
}

impl fmt::Display for EngineFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.engine, self.error)
    }
}

/// Shared, read-only inputs for every engine of one fixture.
#[derive(Debug, Clone, Copy)]
pub struct EngineContext<'a> {
    pub resolved: ResolvedFixture<'a>,
    pub peers: &'a PeerIndex,
    pub baseline: LeagueBaseline,
    /// Rating points granted by a fully weighted, one-sided head-to-head record.
    pub h2h_weight: f64,
    pub seed: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EngineBudget {
    pub engine_timeout: Option<Duration>,
    pub fixture_deadline: Option<Instant>,
}

impl EngineBudget {
    fn deadline_for(&self, engine: EngineKind) -> Option<Deadline> {
        let now = Instant::now();
        let remaining = self
            .fixture_deadline
            .map(|at| at.saturating_duration_since(now));
        let budget = match (self.engine_timeout, remaining) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (None, None) => return None,
        };
        Some(Deadline {
            at: now + budget,
            engine,
            budget,
        })
    }
}

/// Stable per-(seed, fixture, engine) RNG seed, so reruns reproduce the same trials.
pub fn derive_seed(seed: u64, fixture_id: &str, engine: EngineKind) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(seed.to_le_bytes());
    hasher.update(fixture_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(engine.label().as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

/// Rating points in the home side's favor implied by the head-to-head record.
pub fn head_to_head_tilt(h2h: Option<HeadToHead>, weight: f64) -> f64 {
    let Some(h2h) = h2h else {
        return 0.0;
    };
    if !h2h.weighted_score.is_finite() || h2h.meetings == 0 {
        return 0.0;
    }
    let reach = (h2h.meetings as f64 / H2H_FULL_WEIGHT_MEETINGS).min(1.0);
    weight * h2h.weighted_score.clamp(-1.0, 1.0) * reach
}

/// strength -> simulate -> analyze for one engine variant.
pub fn run_engine(
    variant: &EngineVariant,
    ctx: &EngineContext<'_>,
    deadline: Option<Deadline>,
) -> Result<EngineOutput, EngineError> {
    let started = Instant::now();
    let fixture = ctx.resolved.fixture;

    let model = StrengthModel::new(ctx.peers, variant.weights);
    let home = model.compute_team_power(ctx.resolved.home, Venue::Home)?;
    let away = model.compute_team_power(ctx.resolved.away, Venue::Away)?;

    let simulator = Simulator::new(variant.params);
    let mut rng =
        ChaCha8Rng::seed_from_u64(derive_seed(ctx.seed, &fixture.fixture_id, variant.kind));
    let opts = SimOptions {
        trials: variant.trials,
        mode: variant.mode,
        tilt: head_to_head_tilt(fixture.head_to_head, ctx.h2h_weight),
        deadline,
    };
    let run = simulator.simulate_with(Some(&home), Some(&away), &ctx.baseline, &opts, &mut rng)?;
    let report = analyze(&run.trials, &variant.analyzer)?;

    if let Some(d) = deadline
        && Instant::now() > d.at
    {
        return Err(EngineError::EngineTimeout {
            engine: variant.kind,
            budget: d.budget,
        });
    }

    let elapsed = started.elapsed();
    debug!(
        fixture = %fixture.fixture_id,
        engine = %variant.kind,
        trials = run.len(),
        lambda_home = run.expected.home,
        lambda_away = run.expected.away,
        elapsed_ms = elapsed.as_millis() as u64,
        "engine finished"
    );

    Ok(EngineOutput {
        engine: variant.kind,
        home,
        away,
        expected: run.expected,
        report,
        elapsed,
    })
}

/// Runs every variant in parallel. Results come back in variant order.
pub fn run_engines(
    variants: &[EngineVariant],
    ctx: &EngineContext<'_>,
    budget: EngineBudget,
) -> Vec<Result<EngineOutput, EngineFailure>> {
    variants
        .par_iter()
        .map(|variant| {
            run_engine(variant, ctx, budget.deadline_for(variant.kind)).map_err(|error| {
                warn!(
                    fixture = %ctx.resolved.fixture.fixture_id,
                    engine = %variant.kind,
                    error = %error,
                    "engine failed; excluded from merge"
                );
                EngineFailure {
                    engine: variant.kind,
                    error,
                }
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergePolicy {
    /// Largest confidence gap (points) still counted as agreement.
    pub tolerance: f64,
    pub thresholds: BTreeMap<Market, f64>,
}

impl MergePolicy {
    pub fn threshold(&self, market: Market) -> f64 {
        self.thresholds
            .get(&market)
            .copied()
            .unwrap_or_else(|| market.default_threshold())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub fixture_id: String,
    pub market: Market,
    pub selection: Selection,
    pub predicted_value: String,
    /// 0–100.
    pub confidence: f64,
    pub probability: f64,
    pub stars: u8,
    /// Engines that agreed, in tie-break order. Never empty.
    pub provenance: Vec<EngineKind>,
    pub generated_at: DateTime<Utc>,
}

impl Recommendation {
    /// Equal in everything except the generation time.
    pub fn same_prediction(&self, other: &Recommendation) -> bool {
        self.fixture_id == other.fixture_id
            && self.market == other.market
            && self.selection == other.selection
            && self.predicted_value == other.predicted_value
            && self.confidence == other.confidence
            && self.probability == other.probability
            && self.stars == other.stars
            && self.provenance == other.provenance
    }
}

/// A market dropped because an engine disagreed with the leader.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Dissent {
    pub market: Market,
    pub leader: EngineKind,
    pub leader_selection: Selection,
    pub leader_confidence: f64,
    pub dissenter: EngineKind,
    pub dissenter_selection: Selection,
    /// Dissenter's confidence for the leader's selection.
    pub dissenter_confidence: f64,
    pub gap: f64,
}

impl Dissent {
    pub fn is_directional(&self) -> bool {
        self.leader_selection != self.dissenter_selection
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BelowThreshold {
    pub market: Market,
    pub selection: Selection,
    pub confidence: f64,
    pub threshold: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct MergeOutcome {
    pub recommendations: Vec<Recommendation>,
    pub dissents: Vec<Dissent>,
    pub below_threshold: Vec<BelowThreshold>,
}

impl MergeOutcome {
    pub fn recommendation(&self, market: Market) -> Option<&Recommendation> {
        self.recommendations.iter().find(|r| r.market == market)
    }
}

pub fn stars_for(confidence: f64) -> u8 {
    match confidence {
        c if c >= 85.0 => 5,
        c if c >= 75.0 => 4,
        c if c >= 65.0 => 3,
        c if c >= 55.0 => 2,
        c if c >= 45.0 => 1,
        _ => 0,
    }
}

/// Per-market merge of one report per engine.
///
/// The leader is the engine with the highest confidence in its own pick (ties go to the more
/// trusted engine). Every other engine must pick the same selection and rate it within
/// `tolerance` of the leader, otherwise the market is dropped and a [`Dissent`] recorded.
/// The merged confidence shrinks with the mean gap, so more agreement never lowers it.
pub fn merge_reports(
    fixture_id: &str,
    reports: &[(EngineKind, &OutcomeReport)],
    policy: &MergePolicy,
    generated_at: DateTime<Utc>,
) -> MergeOutcome {
    let mut ordered: Vec<(EngineKind, &OutcomeReport)> = reports.to_vec();
    ordered.sort_by_key(|(kind, _)| kind.priority());

    let mut out = MergeOutcome::default();
    for market in Market::ALL {
        let candidates: Vec<(EngineKind, &MarketOutcome)> = ordered
            .iter()
            .filter_map(|(kind, report)| report.market(market).map(|m| (*kind, m)))
            .collect();
        let Some(&(leader, lead)) = candidates
            .iter()
            .fold(None, |best: Option<&(EngineKind, &MarketOutcome)>, c| match best {
                Some(b) if b.1.pick_confidence() >= c.1.pick_confidence() => Some(b),
                _ => Some(c),
            })
        else {
            continue;
        };

        let pick = lead.pick;
        let lead_conf = lead.pick_confidence();
        let mut gaps = Vec::with_capacity(candidates.len());
        let mut dissented = false;
        for (kind, other) in &candidates {
            if *kind == leader {
                continue;
            }
            let conf = other.confidence_for(pick);
            let gap = (lead_conf - conf).abs();
            if other.pick != pick || gap > policy.tolerance {
                out.dissents.push(Dissent {
                    market,
                    leader,
                    leader_selection: pick,
                    leader_confidence: lead_conf,
                    dissenter: *kind,
                    dissenter_selection: other.pick,
                    dissenter_confidence: conf,
                    gap,
                });
                dissented = true;
            } else {
                gaps.push(gap);
            }
        }
        if dissented {
            continue;
        }

        let mean_gap = if gaps.is_empty() {
            0.0
        } else {
            gaps.iter().sum::<f64>() / gaps.len() as f64
        };
        let confidence = (lead_conf * (1.0 - mean_gap / 100.0)).clamp(0.0, 100.0);
        let threshold = policy.threshold(market);
        if confidence < threshold {
            out.below_threshold.push(BelowThreshold {
                market,
                selection: pick,
                confidence,
                threshold,
            });
            continue;
        }

        let probability = candidates
            .iter()
            .map(|(_, m)| m.probability_of(pick))
            .sum::<f64>()
            / candidates.len() as f64;

        out.recommendations.push(Recommendation {
            fixture_id: fixture_id.to_string(),
            market,
            selection: pick,
            predicted_value: pick.predicted_value(market),
            confidence,
            probability,
            stars: stars_for(confidence),
            provenance: candidates.iter().map(|(kind, _)| *kind).collect(),
            generated_at,
        });
    }
    out
}

/// Per-fixture state machine around the engine outputs and the merge.
#[derive(Debug, Clone)]
pub struct FixturePipeline {
    fixture_id: String,
    stage: FixtureStage,
    outputs: Vec<EngineOutput>,
    failures: Vec<EngineFailure>,
    merged: Option<MergeOutcome>,
}

impl FixturePipeline {
    pub fn new(fixture_id: impl Into<String>) -> Self {
        Self {
            fixture_id: fixture_id.into(),
            stage: FixtureStage::Pending,
            outputs: Vec::new(),
            failures: Vec::new(),
            merged: None,
        }
    }

    pub fn fixture_id(&self) -> &str {
        &self.fixture_id
    }

    pub fn stage(&self) -> FixtureStage {
        self.stage
    }

    pub fn outputs(&self) -> &[EngineOutput] {
        &self.outputs
    }

    pub fn failures(&self) -> &[EngineFailure] {
        &self.failures
    }

    pub fn merged(&self) -> Option<&MergeOutcome> {
        self.merged.as_ref()
    }

    /// Output of the most trusted engine that succeeded.
    pub fn primary(&self) -> Option<&EngineOutput> {
        self.outputs.iter().min_by_key(|o| o.engine.priority())
    }

    fn advance(&mut self, to: FixtureStage) -> Result<(), EngineError> {
        if self.stage.next() != Some(to) {
            return Err(EngineError::InvalidTransition {
                from: self.stage,
                to,
            });
        }
        self.stage = to;
        Ok(())
    }

    /// Stores engine results. Without a single success the fixture stays `Pending`.
    pub fn record_engines(
        &mut self,
        results: Vec<Result<EngineOutput, EngineFailure>>,
    ) -> Result<(), EngineError> {
        if self.stage != FixtureStage::Pending {
            return Err(EngineError::InvalidTransition {
                from: self.stage,
                to: FixtureStage::EnginesComputed,
            });
        }
        self.outputs.clear();
        self.failures.clear();
        for r in results {
            match r {
                Ok(o) => self.outputs.push(o),
                Err(f) => self.failures.push(f),
            }
        }
        if self.outputs.is_empty() {
            return Err(EngineError::NoSuccessfulEngine {
                fixture_id: self.fixture_id.clone(),
            });
        }
        self.advance(FixtureStage::EnginesComputed)
    }

    pub fn merge(
        &mut self,
        policy: &MergePolicy,
        generated_at: DateTime<Utc>,
    ) -> Result<&MergeOutcome, EngineError> {
        if self.stage != FixtureStage::EnginesComputed {
            return Err(EngineError::InvalidTransition {
                from: self.stage,
                to: FixtureStage::Merged,
            });
        }
        let reports: Vec<(EngineKind, &OutcomeReport)> =
            self.outputs.iter().map(|o| (o.engine, &o.report)).collect();
        let merged = merge_reports(&self.fixture_id, &reports, policy, generated_at);
        self.advance(FixtureStage::Merged)?;
        Ok(self.merged.insert(merged))
    }

    /// Call only once the record store accepted this fixture's records.
    pub fn mark_published(&mut self) -> Result<(), EngineError> {
        self.advance(FixtureStage::Published)
    }
}
