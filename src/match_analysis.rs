use serde::{Deserialize, Serialize};

use crate::calibration::{Outcome, Prob3};
use crate::confidence::{AnalysisFlag, OutcomeReport};
use crate::markets::{Market, Selection};
use crate::odds::ImpliedProbabilities;
use crate::orchestrator::{Dissent, Recommendation};
use crate::snapshot::{Fixture, HeadToHead};
use crate::team_strength::{PowerRating, Signal};

const HIGH_ATTACK_INDEX: f64 = 70.0;
const LOW_EXPECTED_GOALS: f64 = 1.0;
const LOW_RELIABILITY_INDEX: f64 = 30.0;
const HIGH_CONFIDENCE: f64 = 70.0;
const MARKET_GAP: f64 = 0.15;
const HOT_FORM_INDEX: f64 = 75.0;
const POWER_DEFICIT: f64 = 15.0;
const H2H_MIN_MEETINGS: u32 = 3;
const H2H_STRONG_SCORE: f64 = 0.3;
const THIN_DATA_DEFAULTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn label(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    AttackVsGoals,
    ReliabilityVsConfidence,
    BookmakerSurprise,
    BookmakerVariant,
    OverGoalsGap,
    BttsGap,
    EngineDisagreement,
    FormVsPower,
    HeadToHeadContradiction,
    SignScoreAnomaly,
    ThinData,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Finding {
    pub fixture_id: String,
    pub check: CheckKind,
    pub severity: Severity,
    pub message: String,
}

/// Final signals of one fixture: ratings and report of the primary engine, plus the merge's
/// dissents and the bookmaker view when available.
#[derive(Debug, Clone, Copy)]
pub struct MatchSignals<'a> {
    pub home_name: &'a str,
    pub away_name: &'a str,
    pub home: &'a PowerRating,
    pub away: &'a PowerRating,
    pub report: &'a OutcomeReport,
    pub dissents: &'a [Dissent],
    pub implied: Option<ImpliedProbabilities>,
}

type Check = fn(&Fixture, &[Recommendation], &MatchSignals<'_>) -> Option<(CheckKind, Severity, String)>;

const CHECKS: [Check; 11] = [
    attack_vs_goals,
    reliability_vs_confidence,
    bookmaker_surprise,
    bookmaker_variant,
    over_goals_gap,
    btts_gap,
    engine_disagreement,
    form_vs_power,
    head_to_head_contradiction,
    sign_score_anomaly,
    thin_data,
];

pub fn explain(
    fixture: &Fixture,
    recommendations: &[Recommendation],
    signals: &MatchSignals<'_>,
) -> Vec<Finding> {
    CHECKS
        .iter()
        .filter_map(|check| check(fixture, recommendations, signals))
        .map(|(check, severity, message)| Finding {
            fixture_id: fixture.fixture_id.clone(),
            check,
            severity,
            message,
        })
        .collect()
}

fn outcome_of(sel: Selection) -> Option<Outcome> {
    match sel {
        Selection::Home => Some(Outcome::Home),
        Selection::Draw => Some(Outcome::Draw),
        Selection::Away => Some(Outcome::Away),
        _ => None,
    }
}

fn outcome_label(outcome: Outcome) -> &'static str {
    match outcome {
        Outcome::Home => "1",
        Outcome::Draw => "X",
        Outcome::Away => "2",
    }
}

fn attack_vs_goals(
    _: &Fixture,
    _: &[Recommendation],
    s: &MatchSignals<'_>,
) -> Option<(CheckKind, Severity, String)> {
    let sides = [
        (s.home_name, s.home.attack, s.report.stats.mean_home),
        (s.away_name, s.away.attack, s.report.stats.mean_away),
    ];
    let (name, attack, goals) = sides
        .into_iter()
        .find(|(_, attack, goals)| *attack >= HIGH_ATTACK_INDEX && *goals < LOW_EXPECTED_GOALS)?;
    Some((
        CheckKind::AttackVsGoals,
        Severity::Warning,
        format!("{name} has attack index {attack:.0} but only {goals:.2} simulated goals"),
    ))
}

fn reliability_vs_confidence(
    _: &Fixture,
    recs: &[Recommendation],
    s: &MatchSignals<'_>,
) -> Option<(CheckKind, Severity, String)> {
    let top = recs
        .iter()
        .filter(|r| r.confidence >= HIGH_CONFIDENCE)
        .max_by(|a, b| a.confidence.total_cmp(&b.confidence))?;
    let shaky = [(s.home_name, s.home), (s.away_name, s.away)]
        .into_iter()
        .find_map(|(name, rating)| {
            let c = rating.contribution(Signal::Reliability)?;
            (c.defaulted || c.normalized <= LOW_RELIABILITY_INDEX).then_some((name, c))
        })?;
    let (name, c) = shaky;
    let detail = if c.defaulted {
        "no reliability data".to_string()
    } else {
        format!("reliability index {:.0}", c.normalized)
    };
    Some((
        CheckKind::ReliabilityVsConfidence,
        Severity::Warning,
        format!(
            "{name} has {detail} while {} {} is rated {:.0}",
            top.market,
            top.predicted_value,
            top.confidence
        ),
    ))
}

fn bookmaker_sign(s: &MatchSignals<'_>) -> Option<Prob3> {
    s.implied.and_then(|i| i.sign)
}

fn bookmaker_surprise(
    _: &Fixture,
    _: &[Recommendation],
    s: &MatchSignals<'_>,
) -> Option<(CheckKind, Severity, String)> {
    let book = bookmaker_sign(s)?;
    let sim = s.report.sign_probabilities();
    let book_fav = book.favorite();
    let sim_fav = sim.favorite();
    if book_fav == sim_fav {
        return None;
    }
    // The market's favorite is an outright underdog in the simulation.
    let severity = if sim.get(book_fav) < 1.0 / 3.0 && book.get(book_fav) >= 0.55 {
        Severity::Critical
    } else {
        Severity::Warning
    };
    Some((
        CheckKind::BookmakerSurprise,
        severity,
        format!(
            "bookmakers favor {} ({:.0}%) but the simulation favors {} ({:.0}%)",
            outcome_label(book_fav),
            book.get(book_fav) * 100.0,
            outcome_label(sim_fav),
            sim.get(sim_fav) * 100.0
        ),
    ))
}

fn bookmaker_variant(
    _: &Fixture,
    _: &[Recommendation],
    s: &MatchSignals<'_>,
) -> Option<(CheckKind, Severity, String)> {
    let book = bookmaker_sign(s)?.ranking();
    let sim = s.report.sign_probabilities().ranking();
    if book[0] != sim[0] || book[1] == sim[1] {
        return None;
    }
    Some((
        CheckKind::BookmakerVariant,
        Severity::Info,
        format!(
            "same favorite {} but bookmakers rank {} second, the simulation {}",
            outcome_label(book[0]),
            outcome_label(book[1]),
            outcome_label(sim[1])
        ),
    ))
}

fn market_gap(
    kind: CheckKind,
    label: &str,
    book: Option<f64>,
    sim: f64,
) -> Option<(CheckKind, Severity, String)> {
    let book = book?;
    let gap = sim - book;
    if gap.abs() < MARKET_GAP {
        return None;
    }
    Some((
        kind,
        Severity::Warning,
        format!(
            "{label}: bookmakers {:.0}% vs simulation {:.0}%",
            book * 100.0,
            sim * 100.0
        ),
    ))
}

fn over_goals_gap(
    _: &Fixture,
    _: &[Recommendation],
    s: &MatchSignals<'_>,
) -> Option<(CheckKind, Severity, String)> {
    let sim = s
        .report
        .market(Market::OverUnder25)?
        .probability_of(Selection::Over);
    market_gap(
        CheckKind::OverGoalsGap,
        "over 2.5",
        s.implied.and_then(|i| i.over_2_5),
        sim,
    )
}

fn btts_gap(
    _: &Fixture,
    _: &[Recommendation],
    s: &MatchSignals<'_>,
) -> Option<(CheckKind, Severity, String)> {
    let sim = s.report.market(Market::Btts)?.probability_of(Selection::Yes);
    market_gap(
        CheckKind::BttsGap,
        "both teams to score",
        s.implied.and_then(|i| i.btts_yes),
        sim,
    )
}

fn engine_disagreement(
    _: &Fixture,
    _: &[Recommendation],
    s: &MatchSignals<'_>,
) -> Option<(CheckKind, Severity, String)> {
    if s.dissents.is_empty() {
        return None;
    }
    let severity = if s.dissents.iter().any(Dissent::is_directional) {
        Severity::Critical
    } else {
        Severity::Warning
    };
    let detail: Vec<String> = s
        .dissents
        .iter()
        .map(|d| {
            format!(
                "{} {}: {} {:.0} vs {} {:.0}",
                d.market,
                d.leader_selection,
                d.leader,
                d.leader_confidence,
                d.dissenter,
                d.dissenter_confidence
            )
        })
        .collect();
    Some((
        CheckKind::EngineDisagreement,
        severity,
        format!("engines disagree, no recommendation for {}", detail.join("; ")),
    ))
}

fn form_vs_power(
    _: &Fixture,
    _: &[Recommendation],
    s: &MatchSignals<'_>,
) -> Option<(CheckKind, Severity, String)> {
    let sides = [
        (s.home_name, s.home, s.away),
        (s.away_name, s.away, s.home),
    ];
    let (name, form, deficit) = sides.into_iter().find_map(|(name, me, them)| {
        let form = me.contribution(Signal::Form).filter(|c| !c.defaulted)?.normalized;
        let deficit = them.rating - me.rating;
        (form >= HOT_FORM_INDEX && deficit >= POWER_DEFICIT).then_some((name, form, deficit))
    })?;
    Some((
        CheckKind::FormVsPower,
        Severity::Info,
        format!("{name} is in form ({form:.0}) despite a {deficit:.0}-point power deficit"),
    ))
}

fn head_to_head_contradiction(
    fixture: &Fixture,
    _: &[Recommendation],
    s: &MatchSignals<'_>,
) -> Option<(CheckKind, Severity, String)> {
    let HeadToHead {
        weighted_score,
        meetings,
    } = fixture.head_to_head?;
    if meetings < H2H_MIN_MEETINGS || weighted_score.abs() < H2H_STRONG_SCORE {
        return None;
    }
    let h2h_side = if weighted_score > 0.0 {
        Outcome::Home
    } else {
        Outcome::Away
    };
    let sim_fav = outcome_of(s.report.favorite())?;
    if sim_fav == Outcome::Draw || sim_fav == h2h_side {
        return None;
    }
    Some((
        CheckKind::HeadToHeadContradiction,
        Severity::Info,
        format!(
            "head-to-head over {meetings} meetings leans {} ({weighted_score:+.2}) against the simulated favorite {}",
            outcome_label(h2h_side),
            outcome_label(sim_fav)
        ),
    ))
}

fn sign_score_anomaly(
    _: &Fixture,
    _: &[Recommendation],
    s: &MatchSignals<'_>,
) -> Option<(CheckKind, Severity, String)> {
    let (sign, pct) = s.report.flags.iter().find_map(|f| match f {
        AnalysisFlag::SignScoreMismatch { sign, penalty_pct } => Some((*sign, *penalty_pct)),
        _ => None,
    })?;
    let scores: Vec<String> = s
        .report
        .top_scores
        .iter()
        .take(3)
        .map(|t| format!("{}-{}", t.home_goals, t.away_goals))
        .collect();
    Some((
        CheckKind::SignScoreAnomaly,
        Severity::Warning,
        format!(
            "favorite sign {sign} is absent from the likeliest scores ({}); confidence cut by {pct:.0}%",
            scores.join(", ")
        ),
    ))
}

fn thin_data(
    _: &Fixture,
    recs: &[Recommendation],
    s: &MatchSignals<'_>,
) -> Option<(CheckKind, Severity, String)> {
    if recs.is_empty() {
        return None;
    }
    let (name, n) = [(s.home_name, s.home), (s.away_name, s.away)]
        .into_iter()
        .map(|(name, r)| (name, r.defaulted_count()))
        .find(|(_, n)| *n >= THIN_DATA_DEFAULTS)?;
    Some((
        CheckKind::ThinData,
        Severity::Warning,
        format!(
            "{} recommendation(s) rest on {name} with {n} defaulted signals",
            recs.len()
        ),
    ))
}
