use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ConfigError, EngineError, MissingSignalWarning};
use crate::snapshot::{TeamProfile, Venue};

const MID_SCALE: f64 = 50.0;
const SCALE_MAX: f64 = 100.0;
const AGE_SLOPE_PER_YEAR: f64 = 0.06;
const AGE_MULT_MIN: f64 = 0.5;
const AGE_MULT_MAX: f64 = 1.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    Attack,
    Defense,
    FieldFactor,
    Strength,
    Form,
    Reliability,
    MarketValue,
}

impl Signal {
    pub const ALL: [Signal; 7] = [
        Signal::Attack,
        Signal::Defense,
        Signal::FieldFactor,
        Signal::Strength,
        Signal::Form,
        Signal::Reliability,
        Signal::MarketValue,
    ];

    /// Documented bounds of the raw score. Market value is only bounded below.
    pub fn range(self) -> (f64, f64) {
        match self {
            Signal::Attack | Signal::Defense | Signal::Reliability => (0.0, 10.0),
            Signal::FieldFactor => (0.0, 7.0),
            Signal::Strength => (0.0, 9.0),
            Signal::Form => (0.0, 25.0),
            Signal::MarketValue => (0.0, f64::MAX),
        }
    }

    /// Midpoint used when neither the team nor any peer carries the signal.
    pub fn neutral(self) -> Option<f64> {
        match self {
            Signal::MarketValue => None,
            other => {
                let (lo, hi) = other.range();
                Some((lo + hi) / 2.0)
            }
        }
    }

    pub fn is_venue_specific(self) -> bool {
        matches!(
            self,
            Signal::Attack | Signal::Defense | Signal::FieldFactor
        )
    }

    fn normalization(self) -> Normalization {
        match self {
            Signal::MarketValue => Normalization::RatioToAverage,
            _ => Normalization::MinMax,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Signal::Attack => "attack",
            Signal::Defense => "defense",
            Signal::FieldFactor => "field factor",
            Signal::Strength => "strength",
            Signal::Form => "form",
            Signal::Reliability => "reliability",
            Signal::MarketValue => "market value",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Normalization {
    MinMax,
    RatioToAverage,
}

/// Weights of the composite rating. Must be non-negative and sum to 1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrengthWeights {
    pub attack: f64,
    pub defense: f64,
    pub field_factor: f64,
    pub strength: f64,
    pub form: f64,
    pub reliability: f64,
    pub market_value: f64,
}

impl Default for StrengthWeights {
    fn default() -> Self {
        Self {
            attack: 0.22,
            defense: 0.20,
            field_factor: 0.10,
            strength: 0.14,
            form: 0.14,
            reliability: 0.08,
            market_value: 0.12,
        }
    }
}

impl StrengthWeights {
    /// Alternative blend for the sandbox engine: leans on recent form and squad value.
    pub fn sandbox() -> Self {
        Self {
            attack: 0.18,
            defense: 0.16,
            field_factor: 0.08,
            strength: 0.12,
            form: 0.24,
            reliability: 0.06,
            market_value: 0.16,
        }
    }

    pub fn weight(&self, signal: Signal) -> f64 {
        match signal {
            Signal::Attack => self.attack,
            Signal::Defense => self.defense,
            Signal::FieldFactor => self.field_factor,
            Signal::Strength => self.strength,
            Signal::Form => self.form,
            Signal::Reliability => self.reliability,
            Signal::MarketValue => self.market_value,
        }
    }

    pub fn sum(&self) -> f64 {
        Signal::ALL.iter().map(|s| self.weight(*s)).sum()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let sum = self.sum();
        let any_negative = Signal::ALL
            .iter()
            .any(|s| !self.weight(*s).is_finite() || self.weight(*s) < 0.0);
        if any_negative || (sum - 1.0).abs() > 1e-6 {
            return Err(ConfigError::InvalidWeights { sum });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct SignalStats {
    min: f64,
    max: f64,
    mean: f64,
}

impl SignalStats {
    fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut sum = 0.0;
        for v in values {
            min = min.min(*v);
            max = max.max(*v);
            sum += v;
        }
        Some(Self {
            min,
            max,
            mean: sum / values.len() as f64,
        })
    }
}

type StatKey = (Signal, Option<Venue>);

/// League peer group: per-signal distribution of every team in the league.
#[derive(Debug, Clone, Default)]
pub struct PeerGroup {
    size: usize,
    mean_age: Option<f64>,
    stats: HashMap<StatKey, SignalStats>,
}

impl PeerGroup {
    fn build(members: &[&TeamProfile]) -> Self {
        let ages: Vec<f64> = members
            .iter()
            .filter_map(|t| t.average_age.filter(|a| a.is_finite() && *a > 0.0))
            .collect();
        let mean_age = SignalStats::from_values(&ages).map(|s| s.mean);

        let mut stats = HashMap::new();
        for signal in Signal::ALL {
            let venues: &[Option<Venue>] = if signal.is_venue_specific() {
                &[Some(Venue::Home), Some(Venue::Away)]
            } else {
                &[None]
            };
            for venue in venues {
                let values: Vec<f64> = members
                    .iter()
                    .filter_map(|t| raw_signal(t, signal, *venue, mean_age))
                    .collect();
                if let Some(s) = SignalStats::from_values(&values) {
                    stats.insert((signal, *venue), s);
                }
            }
        }

        Self {
            size: members.len(),
            mean_age,
            stats,
        }
    }

    fn stats(&self, signal: Signal, venue: Venue) -> Option<SignalStats> {
        let key_venue = signal.is_venue_specific().then_some(venue);
        self.stats.get(&(signal, key_venue)).copied()
    }

    fn normalize(&self, signal: Signal, venue: Venue, value: f64) -> f64 {
        if self.size <= 1 {
            return MID_SCALE;
        }
        let Some(stats) = self.stats(signal, venue) else {
            return MID_SCALE;
        };
        match signal.normalization() {
            Normalization::MinMax => {
                let denom = stats.max - stats.min;
                if denom <= 1e-9 {
                    MID_SCALE
                } else {
                    (SCALE_MAX * (value - stats.min) / denom).clamp(0.0, SCALE_MAX)
                }
            }
            Normalization::RatioToAverage => {
                if stats.mean <= 1e-9 {
                    MID_SCALE
                } else {
                    (MID_SCALE * value / stats.mean).clamp(0.0, SCALE_MAX)
                }
            }
        }
    }
}

/// Peer groups for every league in the batch. Built once, shared read-only.
#[derive(Debug, Clone, Default)]
pub struct PeerIndex {
    leagues: HashMap<String, PeerGroup>,
}

impl PeerIndex {
    pub fn build(teams: &[TeamProfile]) -> Self {
        let mut by_league: HashMap<&str, Vec<&TeamProfile>> = HashMap::new();
        for t in teams {
            by_league.entry(t.league.as_str()).or_default().push(t);
        }
        let leagues = by_league
            .into_iter()
            .map(|(league, members)| (league.to_string(), PeerGroup::build(&members)))
            .collect();
        Self { leagues }
    }

    pub fn group(&self, league: &str) -> Option<&PeerGroup> {
        self.leagues.get(league)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultSource {
    PeerAverage,
    Neutral,
}

/// One line of the rating's explanation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignalContribution {
    pub signal: Signal,
    /// Raw value actually used (after clamping or defaulting). `None` only for a market value
    /// nobody in the league reported.
    pub raw: Option<f64>,
    pub normalized: f64,
    pub weight: f64,
    pub contribution: f64,
    pub defaulted: bool,
    pub default_source: Option<DefaultSource>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PowerRating {
    pub team_id: String,
    pub venue: Venue,
    /// Composite rating, 0–100.
    pub rating: f64,
    /// Venue attack index, 0–100 (50 = league average).
    pub attack: f64,
    /// Venue defense index, 0–100 (higher concedes less).
    pub defense: f64,
    pub age_multiplier: f64,
    pub breakdown: Vec<SignalContribution>,
    pub warnings: Vec<MissingSignalWarning>,
}

impl PowerRating {
    /// Mid-scale rating with no breakdown. Useful when a caller already decided on a default.
    pub fn neutral(team_id: &str, venue: Venue) -> Self {
        Self {
            team_id: team_id.to_string(),
            venue,
            rating: MID_SCALE,
            attack: MID_SCALE,
            defense: MID_SCALE,
            age_multiplier: 1.0,
            breakdown: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn contribution(&self, signal: Signal) -> Option<&SignalContribution> {
        self.breakdown.iter().find(|c| c.signal == signal)
    }

    pub fn defaulted_count(&self) -> usize {
        self.breakdown.iter().filter(|c| c.defaulted).count()
    }
}

pub struct StrengthModel<'a> {
    peers: &'a PeerIndex,
    weights: StrengthWeights,
}

impl<'a> StrengthModel<'a> {
    pub fn new(peers: &'a PeerIndex, weights: StrengthWeights) -> Self {
        Self { peers, weights }
    }

    /// Composite home/away power rating with a per-signal breakdown.
    ///
    /// Missing signals never fail the call: each one degrades to the league average (or the
    /// documented midpoint when no peer has it) and is reported as a warning.
    pub fn compute_team_power(
        &self,
        profile: &TeamProfile,
        venue: Venue,
    ) -> Result<PowerRating, EngineError> {
        validate_identifier("team_id", &profile.team_id)?;
        validate_identifier("league", &profile.league)?;

        let singleton;
        let group = match self.peers.group(&profile.league) {
            Some(g) => g,
            None => {
                singleton = PeerGroup::build(&[profile]);
                &singleton
            }
        };

        let age_multiplier = age_multiplier(profile, group.mean_age);
        let mut breakdown = Vec::with_capacity(Signal::ALL.len());
        let mut warnings = Vec::new();
        let mut rating = 0.0;

        for signal in Signal::ALL {
            let weight = self.weights.weight(signal);
            let observed = raw_signal(profile, signal, Some(venue), group.mean_age);
            let (raw, default_source) = match observed {
                Some(v) => (Some(v), None),
                None => {
                    let (value, source) = match group.stats(signal, venue) {
                        Some(s) if group.size > 1 => (Some(s.mean), DefaultSource::PeerAverage),
                        _ => (signal.neutral(), DefaultSource::Neutral),
                    };
                    let warning = MissingSignalWarning {
                        team_id: profile.team_id.clone(),
                        signal,
                        substituted: value.unwrap_or(MID_SCALE),
                    };
                    warn!(
                        team = %profile.team_id,
                        signal = %signal,
                        source = ?source,
                        "missing signal degraded to default"
                    );
                    warnings.push(warning);
                    (value, Some(source))
                }
            };

            let normalized = match raw {
                Some(v) => group.normalize(signal, venue, v),
                None => MID_SCALE,
            };
            let contribution = weight * normalized;
            rating += contribution;
            breakdown.push(SignalContribution {
                signal,
                raw,
                normalized,
                weight,
                contribution,
                defaulted: default_source.is_some(),
                default_source,
            });
        }

        let index_of = |signal: Signal| {
            breakdown
                .iter()
                .find(|c| c.signal == signal)
                .map(|c| c.normalized)
                .unwrap_or(MID_SCALE)
        };
        let attack = index_of(Signal::Attack);
        let defense = index_of(Signal::Defense);

        Ok(PowerRating {
            team_id: profile.team_id.clone(),
            venue,
            rating: rating.clamp(0.0, SCALE_MAX),
            attack,
            defense,
            age_multiplier,
            breakdown,
            warnings,
        })
    }
}

fn validate_identifier(field: &'static str, value: &str) -> Result<(), EngineError> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed.len() != value.len() || value.chars().any(char::is_control) {
        return Err(EngineError::MalformedIdentifier {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

fn age_multiplier(profile: &TeamProfile, mean_age: Option<f64>) -> f64 {
    if let Some(m) = profile.age_multiplier.filter(|m| m.is_finite()) {
        return m.clamp(AGE_MULT_MIN, AGE_MULT_MAX);
    }
    match (profile.average_age.filter(|a| a.is_finite() && *a > 0.0), mean_age) {
        (Some(age), Some(mean)) => {
            (1.0 + AGE_SLOPE_PER_YEAR * (mean - age)).clamp(AGE_MULT_MIN, AGE_MULT_MAX)
        }
        _ => 1.0,
    }
}

/// Clamped raw value of a signal, or `None` when absent or unusable.
/// `venue` is ignored for venue-independent signals; peer stats pass `None` for those.
fn raw_signal(
    profile: &TeamProfile,
    signal: Signal,
    venue: Option<Venue>,
    mean_age: Option<f64>,
) -> Option<f64> {
    let scores = venue.map(|v| profile.venue(v));
    let value = match signal {
        Signal::Attack => scores.and_then(|s| s.attack),
        Signal::Defense => scores.and_then(|s| s.defense),
        Signal::FieldFactor => scores.and_then(|s| s.field_factor),
        Signal::Strength => profile.strength,
        Signal::Form => profile.form,
        Signal::Reliability => profile.reliability,
        Signal::MarketValue => profile
            .market_value
            .map(|v| v * age_multiplier(profile, mean_age)),
    }?;
    if !value.is_finite() {
        return None;
    }
    let (lo, hi) = signal.range();
    Some(value.clamp(lo, hi))
}
