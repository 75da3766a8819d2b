//! Turns a set of simulated trials into per-market probabilities and confidence scores.
//!
//! Confidence combines two things: how far the selection's share sits above an even split of
//! its market (`edge`), and how spread out the goal count driving that market is. A wide spread
//! always costs confidence, so for a fixed share the score strictly falls as the standard
//! deviation grows.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::calibration::Prob3;
use crate::error::EngineError;
use crate::markets::{Market, Selection, sign_of, sign_of_goals};
use crate::simulator::TrialScore;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerSettings {
    /// Exact scores inspected by the sign/score consistency check.
    pub top_k_scores: usize,
    /// Confidence cut applied to the sign when it is missing from the top-k scores.
    pub sign_penalty_pct: f64,
    /// Normalized entropy at or above which a market counts as near-uniform.
    pub near_uniform_entropy: f64,
    /// Confidence ceiling for near-uniform markets.
    pub near_uniform_cap: f64,
    /// Scorelines listed in the exact-score market.
    pub exact_score_candidates: usize,
}

impl Default for AnalyzerSettings {
    fn default() -> Self {
        Self {
            top_k_scores: 3,
            sign_penalty_pct: 20.0,
            near_uniform_entropy: 0.97,
            near_uniform_cap: 10.0,
            exact_score_candidates: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SelectionOutcome {
    pub selection: Selection,
    pub count: usize,
    /// Trial share, 0–1.
    pub probability: f64,
    /// 0–100.
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnalysisFlag {
    DegenerateSample,
    NearUniform { market: Market },
    SignScoreMismatch { sign: Selection, penalty_pct: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarketOutcome {
    pub market: Market,
    pub pick: Selection,
    pub selections: Vec<SelectionOutcome>,
    /// Standard deviation of the goal count that drives this market.
    pub spread: f64,
    /// Entropy of the selection shares, normalized to 0–1.
    pub entropy: f64,
    pub flags: Vec<AnalysisFlag>,
}

impl MarketOutcome {
    fn selection(&self, selection: Selection) -> Option<&SelectionOutcome> {
        self.selections.iter().find(|s| s.selection == selection)
    }

    pub fn probability_of(&self, selection: Selection) -> f64 {
        self.selection(selection).map(|s| s.probability).unwrap_or(0.0)
    }

    pub fn confidence_for(&self, selection: Selection) -> f64 {
        self.selection(selection).map(|s| s.confidence).unwrap_or(0.0)
    }

    pub fn pick_confidence(&self) -> f64 {
        self.confidence_for(self.pick)
    }

    pub fn pick_probability(&self) -> f64 {
        self.probability_of(self.pick)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreShare {
    pub home_goals: u8,
    pub away_goals: u8,
    pub count: usize,
    pub probability: f64,
}

impl ScoreShare {
    pub fn sign(&self) -> Selection {
        sign_of_goals(self.home_goals, self.away_goals)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispersionStats {
    pub mean_home: f64,
    pub mean_away: f64,
    pub mean_total: f64,
    pub std_total: f64,
    pub std_diff: f64,
    pub skewness: Option<f64>,
    pub excess_kurtosis: Option<f64>,
    /// Pearson correlation of home and away goals.
    pub correlation: Option<f64>,
    pub sign_entropy: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutcomeReport {
    pub trials: usize,
    pub markets: Vec<MarketOutcome>,
    pub top_scores: Vec<ScoreShare>,
    pub stats: DispersionStats,
    pub flags: Vec<AnalysisFlag>,
}

impl OutcomeReport {
    pub fn market(&self, market: Market) -> Option<&MarketOutcome> {
        self.markets.iter().find(|m| m.market == market)
    }

    pub fn sign_probabilities(&self) -> Prob3 {
        match self.market(Market::Sign) {
            Some(m) => Prob3 {
                home: m.probability_of(Selection::Home),
                draw: m.probability_of(Selection::Draw),
                away: m.probability_of(Selection::Away),
            },
            None => Prob3::uniform(),
        }
    }

    /// 1X2 shares as percentages that sum to exactly 100.
    pub fn sign_percentages(&self) -> (f64, f64, f64) {
        let p = self.sign_probabilities();
        let home = p.home * 100.0;
        let away = p.away * 100.0;
        // Put any tiny rounding residue into draw.
        (home, 100.0 - home - away, away)
    }

    pub fn favorite(&self) -> Selection {
        self.market(Market::Sign)
            .map(|m| m.pick)
            .unwrap_or(Selection::Draw)
    }

    pub fn has_flag(&self, pred: impl Fn(&AnalysisFlag) -> bool) -> bool {
        self.flags.iter().any(pred)
    }
}

/// Confidence (0–100) of a selection with share `probability` in a market whose even split is
/// `baseline`, given the spread of the underlying count and its reference spread.
pub fn confidence_score(probability: f64, baseline: f64, spread: f64, spread_ref: f64) -> f64 {
    if !(0.0..1.0).contains(&baseline) || probability <= baseline {
        return 0.0;
    }
    let edge = ((probability - baseline) / (1.0 - baseline)).clamp(0.0, 1.0);
    let ratio = spread.max(0.0) / spread_ref.max(1e-9);
    (100.0 * edge.sqrt() / (1.0 + ratio * ratio)).clamp(0.0, 100.0)
}

pub fn analyze(
    trials: &[TrialScore],
    settings: &AnalyzerSettings,
) -> Result<OutcomeReport, EngineError> {
    if trials.is_empty() {
        return Err(EngineError::EmptyRun);
    }
    let n = trials.len();
    let degenerate = n < 2;

    let stats = dispersion_stats(trials);
    let spread_min_side = std_dev(
        &trials
            .iter()
            .map(|t| t.home_goals.min(t.away_goals) as f64)
            .collect::<Vec<_>>(),
    );

    let sign_counts = [
        (Selection::Home, trials.iter().filter(|t| t.diff() > 0).count()),
        (Selection::Draw, trials.iter().filter(|t| t.diff() == 0).count()),
        (Selection::Away, trials.iter().filter(|t| t.diff() < 0).count()),
    ];
    let [(_, home), (_, draw), (_, away)] = sign_counts;

    let mut markets = Vec::with_capacity(Market::ALL.len());
    markets.push(build_market(
        Market::Sign,
        &sign_counts,
        n,
        stats.std_diff,
        3.0,
        settings,
        degenerate,
    ));
    markets.push(build_market(
        Market::DoubleChance,
        &[
            (Selection::HomeOrDraw, home + draw),
            (Selection::DrawOrAway, draw + away),
            (Selection::HomeOrAway, home + away),
        ],
        n,
        stats.std_diff,
        3.0,
        settings,
        degenerate,
    ));
    for market in [Market::OverUnder15, Market::OverUnder25, Market::OverUnder35] {
        let line = market.line().unwrap_or(2.5);
        let over = trials.iter().filter(|t| t.total() as f64 > line).count();
        markets.push(build_market(
            market,
            &[(Selection::Over, over), (Selection::Under, n - over)],
            n,
            stats.std_total,
            3.0,
            settings,
            degenerate,
        ));
    }
    let btts = trials
        .iter()
        .filter(|t| t.home_goals > 0 && t.away_goals > 0)
        .count();
    markets.push(build_market(
        Market::Btts,
        &[(Selection::Yes, btts), (Selection::No, n - btts)],
        n,
        spread_min_side,
        2.0,
        settings,
        degenerate,
    ));

    let scores = score_shares(trials);
    let candidates: Vec<(Selection, usize)> = scores
        .iter()
        .take(settings.exact_score_candidates.max(1))
        .map(|s| {
            (
                Selection::Score {
                    home: s.home_goals,
                    away: s.away_goals,
                },
                s.count,
            )
        })
        .collect();
    markets.push(build_exact_score_market(
        &candidates,
        scores.len(),
        n,
        stats.std_total,
        settings,
        degenerate,
    ));

    let mut flags = Vec::new();
    if degenerate {
        flags.push(AnalysisFlag::DegenerateSample);
    }

    // Cross-market consistency: the favorite sign should show up among the likeliest scores.
    let top_k: Vec<&ScoreShare> = scores.iter().take(settings.top_k_scores.max(1)).collect();
    if let Some(sign_market) = markets.iter_mut().find(|m| m.market == Market::Sign) {
        let sign = sign_market.pick;
        if !top_k.iter().any(|s| s.sign() == sign) {
            let pct = settings.sign_penalty_pct.clamp(0.0, 100.0);
            if let Some(sel) = sign_market
                .selections
                .iter_mut()
                .find(|s| s.selection == sign)
            {
                sel.confidence *= 1.0 - pct / 100.0;
            }
            let flag = AnalysisFlag::SignScoreMismatch {
                sign,
                penalty_pct: pct,
            };
            sign_market.flags.push(flag.clone());
            flags.push(flag);
        }
    }

    for m in &markets {
        for f in &m.flags {
            if matches!(f, AnalysisFlag::NearUniform { .. }) {
                flags.push(f.clone());
            }
        }
    }

    let top_scores = scores
        .into_iter()
        .take(settings.top_k_scores.max(settings.exact_score_candidates))
        .collect();

    Ok(OutcomeReport {
        trials: n,
        markets,
        top_scores,
        stats,
        flags,
    })
}

fn build_market(
    market: Market,
    counts: &[(Selection, usize)],
    n: usize,
    spread: f64,
    spread_ref: f64,
    settings: &AnalyzerSettings,
    degenerate: bool,
) -> MarketOutcome {
    let probs: Vec<f64> = counts.iter().map(|(_, c)| *c as f64 / n as f64).collect();
    let total: f64 = probs.iter().sum();
    // Even split; double chance selections cover two outcomes each, so their shares sum to 2.
    let baseline = total / counts.len().max(1) as f64;
    let entropy = normalized_entropy(&probs.iter().map(|p| p / total.max(1e-12)).collect::<Vec<_>>());
    assemble(
        market, counts, &probs, baseline, entropy, spread, spread_ref, settings, degenerate,
    )
}

fn build_exact_score_market(
    candidates: &[(Selection, usize)],
    distinct: usize,
    n: usize,
    spread: f64,
    settings: &AnalyzerSettings,
    degenerate: bool,
) -> MarketOutcome {
    let probs: Vec<f64> = candidates
        .iter()
        .map(|(_, c)| *c as f64 / n as f64)
        .collect();
    let baseline = 1.0 / distinct.max(1) as f64;
    // Entropy over the listed candidates plus the unlisted remainder as one bucket.
    let mut dist = probs.clone();
    let rest = 1.0 - probs.iter().sum::<f64>();
    if rest > 1e-12 {
        dist.push(rest);
    }
    let entropy = if distinct <= 1 {
        0.0
    } else {
        entropy_nats(&dist) / (distinct as f64).ln()
    };
    assemble(
        Market::ExactScore,
        candidates,
        &probs,
        baseline,
        entropy.clamp(0.0, 1.0),
        spread,
        3.0,
        settings,
        degenerate,
    )
}

#[allow(clippy::too_many_arguments)]
fn assemble(
    market: Market,
    counts: &[(Selection, usize)],
    probs: &[f64],
    baseline: f64,
    entropy: f64,
    spread: f64,
    spread_ref: f64,
    settings: &AnalyzerSettings,
    degenerate: bool,
) -> MarketOutcome {
    let mut flags = Vec::new();
    let near_uniform = !degenerate && entropy >= settings.near_uniform_entropy;
    if near_uniform {
        flags.push(AnalysisFlag::NearUniform { market });
    }

    let selections: Vec<SelectionOutcome> = counts
        .iter()
        .zip(probs)
        .map(|((selection, count), p)| {
            let mut confidence = if degenerate {
                0.0
            } else {
                confidence_score(*p, baseline, spread, spread_ref)
            };
            if near_uniform {
                confidence = confidence.min(settings.near_uniform_cap);
            }
            SelectionOutcome {
                selection: *selection,
                count: *count,
                probability: *p,
                confidence,
            }
        })
        .collect();

    // Highest share wins; earlier selections win ties.
    let pick = selections
        .iter()
        .fold(None::<&SelectionOutcome>, |best, s| match best {
            Some(b) if b.count >= s.count => Some(b),
            _ => Some(s),
        })
        .map(|s| s.selection)
        .unwrap_or(counts[0].0);

    MarketOutcome {
        market,
        pick,
        selections,
        spread,
        entropy,
        flags,
    }
}

/// Scorelines by descending frequency, ties ordered by home then away goals.
fn score_shares(trials: &[TrialScore]) -> Vec<ScoreShare> {
    let mut counts: BTreeMap<(u8, u8), usize> = BTreeMap::new();
    for t in trials {
        *counts.entry((t.home_goals, t.away_goals)).or_insert(0) += 1;
    }
    let n = trials.len() as f64;
    let mut out: Vec<ScoreShare> = counts
        .into_iter()
        .map(|((h, a), count)| ScoreShare {
            home_goals: h,
            away_goals: a,
            count,
            probability: count as f64 / n,
        })
        .collect();
    out.sort_by(|x, y| {
        y.count
            .cmp(&x.count)
            .then(x.home_goals.cmp(&y.home_goals))
            .then(x.away_goals.cmp(&y.away_goals))
    });
    out
}

fn dispersion_stats(trials: &[TrialScore]) -> DispersionStats {
    let home: Vec<f64> = trials.iter().map(|t| t.home_goals as f64).collect();
    let away: Vec<f64> = trials.iter().map(|t| t.away_goals as f64).collect();
    let total: Vec<f64> = trials.iter().map(|t| t.total() as f64).collect();
    let diff: Vec<f64> = trials.iter().map(|t| t.diff() as f64).collect();

    let n = trials.len() as f64;
    let sign_probs = {
        let h = trials.iter().filter(|t| sign_of(**t) == Selection::Home).count() as f64;
        let d = trials.iter().filter(|t| sign_of(**t) == Selection::Draw).count() as f64;
        [h / n, d / n, (n - h - d) / n]
    };

    let (skewness, excess_kurtosis) = shape_moments(&total);

    DispersionStats {
        mean_home: mean(&home),
        mean_away: mean(&away),
        mean_total: mean(&total),
        std_total: std_dev(&total),
        std_diff: std_dev(&diff),
        skewness,
        excess_kurtosis,
        correlation: pearson(&home, &away),
        sign_entropy: normalized_entropy(&sign_probs),
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    var.sqrt()
}

fn shape_moments(values: &[f64]) -> (Option<f64>, Option<f64>) {
    if values.len() < 2 {
        return (None, None);
    }
    let m = mean(values);
    let n = values.len() as f64;
    let m2 = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / n;
    if m2 <= 1e-12 {
        return (None, None);
    }
    let m3 = values.iter().map(|v| (v - m).powi(3)).sum::<f64>() / n;
    let m4 = values.iter().map(|v| (v - m).powi(4)).sum::<f64>() / n;
    (Some(m3 / m2.powf(1.5)), Some(m4 / (m2 * m2) - 3.0))
}

fn pearson(xs: &[f64], ys: &[f64]) -> Option<f64> {
    if xs.len() < 2 || xs.len() != ys.len() {
        return None;
    }
    let mx = mean(xs);
    let my = mean(ys);
    let mut cov = 0.0;
    let mut vx = 0.0;
    let mut vy = 0.0;
    for (x, y) in xs.iter().zip(ys) {
        cov += (x - mx) * (y - my);
        vx += (x - mx).powi(2);
        vy += (y - my).powi(2);
    }
    if vx <= 1e-12 || vy <= 1e-12 {
        return None;
    }
    Some(cov / (vx.sqrt() * vy.sqrt()))
}

fn entropy_nats(probs: &[f64]) -> f64 {
    probs
        .iter()
        .filter(|p| **p > 0.0)
        .map(|p| -p * p.ln())
        .sum()
}

fn normalized_entropy(probs: &[f64]) -> f64 {
    if probs.len() < 2 {
        return 0.0;
    }
    (entropy_nats(probs) / (probs.len() as f64).ln()).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repeat(score: (u8, u8), n: usize) -> Vec<TrialScore> {
        vec![TrialScore::new(score.0, score.1); n]
    }

    #[test]
    fn single_trial_is_degenerate_not_fatal() {
        let report = analyze(&[TrialScore::new(1, 0)], &AnalyzerSettings::default()).unwrap();
        assert_eq!(report.trials, 1);
        assert!(report.has_flag(|f| *f == AnalysisFlag::DegenerateSample));
        assert!(report.markets.iter().all(|m| m.pick_confidence() == 0.0));
        assert_eq!(report.favorite(), Selection::Home);
        assert!(report.stats.skewness.is_none());
        assert!(report.stats.correlation.is_none());
    }

    #[test]
    fn empty_input_is_rejected() {
        assert_eq!(
            analyze(&[], &AnalyzerSettings::default()).unwrap_err(),
            EngineError::EmptyRun
        );
    }

    #[test]
    fn sign_percentages_sum_to_one_hundred() {
        let mut trials = repeat((1, 0), 7);
        trials.extend(repeat((0, 0), 5));
        trials.extend(repeat((1, 2), 3));
        let report = analyze(&trials, &AnalyzerSettings::default()).unwrap();
        let (h, d, a) = report.sign_percentages();
        assert!((h + d + a - 100.0).abs() < 1e-9);
        assert!((h - 700.0 / 15.0).abs() < 1e-9);
    }

    #[test]
    fn near_uniform_sign_is_flagged_and_capped() {
        let mut trials = repeat((1, 0), 34);
        trials.extend(repeat((1, 1), 33));
        trials.extend(repeat((0, 1), 33));
        let report = analyze(&trials, &AnalyzerSettings::default()).unwrap();
        let sign = report.market(Market::Sign).unwrap();
        assert!(sign.flags.contains(&AnalysisFlag::NearUniform { market: Market::Sign }));
        assert!(sign.pick_confidence() <= 10.0);
    }

    #[test]
    fn sign_missing_from_top_scores_is_penalized() {
        // Home wins are spread thin across many scorelines; draws concentrate on 1-1 and 0-0.
        let mut trials = Vec::new();
        for h in 1..=8u8 {
            trials.extend(repeat((h, 0), 5));
        }
        trials.extend(repeat((1, 1), 14));
        trials.extend(repeat((0, 0), 13));
        trials.extend(repeat((2, 2), 12));
        let report = analyze(&trials, &AnalyzerSettings::default()).unwrap();
        let sign = report.market(Market::Sign).unwrap();
        assert_eq!(sign.pick, Selection::Home);
        assert!(report.has_flag(|f| matches!(f, AnalysisFlag::SignScoreMismatch { .. })));

        let unpenalized = confidence_score(sign.pick_probability(), 1.0 / 3.0, sign.spread, 3.0);
        assert!((sign.pick_confidence() - unpenalized * 0.8).abs() < 1e-9);
    }

    #[test]
    fn wider_goal_difference_lowers_sign_confidence() {
        let tight = repeat((2, 0), 100);
        let mut medium = repeat((1, 0), 50);
        medium.extend(repeat((3, 0), 50));
        let mut wide = repeat((1, 0), 50);
        wide.extend(repeat((5, 0), 50));

        let settings = AnalyzerSettings::default();
        let c: Vec<f64> = [tight, medium, wide]
            .iter()
            .map(|t| {
                analyze(t, &settings)
                    .unwrap()
                    .market(Market::Sign)
                    .unwrap()
                    .confidence_for(Selection::Home)
            })
            .collect();
        assert!(c[0] > c[1] && c[1] > c[2], "{c:?}");
    }

    #[test]
    fn double_chance_uses_two_thirds_baseline() {
        let mut trials = repeat((1, 0), 60);
        trials.extend(repeat((0, 0), 20));
        trials.extend(repeat((0, 1), 20));
        let report = analyze(&trials, &AnalyzerSettings::default()).unwrap();
        let dc = report.market(Market::DoubleChance).unwrap();
        assert_eq!(dc.pick, Selection::HomeOrDraw);
        assert!((dc.probability_of(Selection::HomeOrDraw) - 0.8).abs() < 1e-12);
        assert_eq!(dc.confidence_for(Selection::DrawOrAway), 0.0);
    }

    #[test]
    fn correlation_and_moments_are_reported() {
        let mut trials = repeat((0, 0), 10);
        trials.extend(repeat((2, 2), 10));
        trials.extend(repeat((1, 0), 5));
        let report = analyze(&trials, &AnalyzerSettings::default()).unwrap();
        assert!(report.stats.correlation.unwrap() > 0.5);
        assert!(report.stats.skewness.is_some());
        assert!(report.stats.excess_kurtosis.is_some());
    }
}
