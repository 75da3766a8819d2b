use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use rand::Rng;
use rand_distr::{Distribution, Gamma, Poisson};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, EngineError};
use crate::league_params::LeagueBaseline;
use crate::orchestrator::EngineKind;
use crate::team_strength::PowerRating;

const LAMBDA_MIN: f64 = 0.15;
const LAMBDA_MAX: f64 = 4.50;
const DEADLINE_CHECK_EVERY: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SimMode {
    Balanced,
    DefensiveLeaning,
    UpsetProne,
}

impl SimMode {
    pub fn label(self) -> &'static str {
        match self {
            SimMode::Balanced => "balanced",
            SimMode::DefensiveLeaning => "defensive-leaning",
            SimMode::UpsetProne => "upset-prone",
        }
    }
}

impl fmt::Display for SimMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for SimMode {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "balanced" => Ok(SimMode::Balanced),
            "defensive-leaning" | "defensive" => Ok(SimMode::DefensiveLeaning),
            "upset-prone" | "upset" => Ok(SimMode::UpsetProne),
            _ => Err(ConfigError::UnknownMode(raw.to_string())),
        }
    }
}

/// Variance injected on top of the expected goals. Never moves the means.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VariancePreset {
    /// Multiplier on the shared (draw-correlated) goal component.
    pub shared_scale: f64,
    /// Shape of a mean-one Gamma applied per trial to each side's independent rate.
    /// `None` keeps plain Poisson noise; smaller shapes mean heavier tails.
    #[serde(default)]
    pub dispersion_shape: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimParams {
    /// Log-rate change per 100 rating points of power differential.
    pub rating_k: f64,
    /// Log-rate weight of the attack vs opposing defense cross term.
    pub cross_weight: f64,
    /// Share of the weaker side's rate that is common to both sides at full parity.
    pub parity_share: f64,
    /// Rating gap (points) over which parity decays by a factor e.
    pub parity_scale: f64,
    pub max_goals: u8,
    pub balanced: VariancePreset,
    pub defensive_leaning: VariancePreset,
    pub upset_prone: VariancePreset,
}

impl Default for SimParams {
    fn default() -> Self {
        Self {
            rating_k: 1.6,
            cross_weight: 0.35,
            parity_share: 0.6,
            parity_scale: 12.0,
            max_goals: 10,
            balanced: VariancePreset {
                shared_scale: 1.0,
                dispersion_shape: None,
            },
            defensive_leaning: VariancePreset {
                shared_scale: 1.35,
                dispersion_shape: Some(25.0),
            },
            upset_prone: VariancePreset {
                shared_scale: 0.6,
                dispersion_shape: Some(3.0),
            },
        }
    }
}

impl SimParams {
    pub fn preset(&self, mode: SimMode) -> VariancePreset {
        match mode {
            SimMode::Balanced => self.balanced,
            SimMode::DefensiveLeaning => self.defensive_leaning,
            SimMode::UpsetProne => self.upset_prone,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ExpectedGoals {
    pub home: f64,
    pub away: f64,
    /// Rate of the component shared by both sides (before the mode's scaling).
    pub shared: f64,
    /// 1 for identical ratings, decaying toward 0 as the gap grows.
    pub parity: f64,
}

impl ExpectedGoals {
    pub fn total(&self) -> f64 {
        self.home + self.away
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrialScore {
    pub home_goals: u8,
    pub away_goals: u8,
}

impl TrialScore {
    pub fn new(home_goals: u8, away_goals: u8) -> Self {
        Self {
            home_goals,
            away_goals,
        }
    }

    pub fn total(&self) -> u32 {
        self.home_goals as u32 + self.away_goals as u32
    }

    pub fn diff(&self) -> i32 {
        self.home_goals as i32 - self.away_goals as i32
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationRun {
    pub mode: SimMode,
    pub expected: ExpectedGoals,
    pub trials: Vec<TrialScore>,
}

impl SimulationRun {
    pub fn len(&self) -> usize {
        self.trials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trials.is_empty()
    }
}

/// Cooperative deadline checked inside the trial loop.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    pub at: Instant,
    pub engine: EngineKind,
    pub budget: Duration,
}

impl Deadline {
    pub fn after(engine: EngineKind, budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
            engine,
            budget,
        }
    }

    fn check(&self) -> Result<(), EngineError> {
        if Instant::now() >= self.at {
            return Err(EngineError::EngineTimeout {
                engine: self.engine,
                budget: self.budget,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SimOptions {
    pub trials: usize,
    pub mode: SimMode,
    /// Extra rating points in the home side's favor (head-to-head tilt).
    pub tilt: f64,
    pub deadline: Option<Deadline>,
}

impl SimOptions {
    pub fn new(trials: usize, mode: SimMode) -> Self {
        Self {
            trials,
            mode,
            tilt: 0.0,
            deadline: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Simulator {
    params: SimParams,
}

impl Simulator {
    pub fn new(params: SimParams) -> Self {
        Self { params }
    }

    pub fn expected_goals(
        &self,
        home: &PowerRating,
        away: &PowerRating,
        baseline: &LeagueBaseline,
        tilt: f64,
    ) -> ExpectedGoals {
        let p = &self.params;
        let baseline = baseline.sanitized();
        let gap = home.rating - away.rating + if tilt.is_finite() { tilt } else { 0.0 };
        let delta = gap / 100.0;

        let cross_home = p.cross_weight * (index_unit(home.attack) - index_unit(away.defense));
        let cross_away = p.cross_weight * (index_unit(away.attack) - index_unit(home.defense));

        let lambda_home = clamp(
            baseline.home_goals * (cross_home + p.rating_k * delta / 2.0).exp(),
            LAMBDA_MIN,
            LAMBDA_MAX,
        );
        let lambda_away = clamp(
            baseline.away_goals * (cross_away - p.rating_k * delta / 2.0).exp(),
            LAMBDA_MIN,
            LAMBDA_MAX,
        );

        let parity = (-gap.abs() / p.parity_scale.max(1e-6)).exp();
        let shared = p.parity_share.clamp(0.0, 0.9) * parity * lambda_home.min(lambda_away);

        ExpectedGoals {
            home: lambda_home,
            away: lambda_away,
            shared,
            parity,
        }
    }

    /// Draw `trials` independent score pairs.
    pub fn simulate<R: Rng + ?Sized>(
        &self,
        home: Option<&PowerRating>,
        away: Option<&PowerRating>,
        baseline: &LeagueBaseline,
        trials: usize,
        mode: SimMode,
        rng: &mut R,
    ) -> Result<SimulationRun, EngineError> {
        self.simulate_with(home, away, baseline, &SimOptions::new(trials, mode), rng)
    }

    pub fn simulate_with<R: Rng + ?Sized>(
        &self,
        home: Option<&PowerRating>,
        away: Option<&PowerRating>,
        baseline: &LeagueBaseline,
        opts: &SimOptions,
        rng: &mut R,
    ) -> Result<SimulationRun, EngineError> {
        let home = home.ok_or(EngineError::MissingRating { side: "home" })?;
        let away = away.ok_or(EngineError::MissingRating { side: "away" })?;
        if opts.trials == 0 {
            return Err(ConfigError::ZeroTrials.into());
        }

        let expected = self.expected_goals(home, away, baseline, opts.tilt);
        let preset = self.params.preset(opts.mode);

        // Scaling the shared part moves goals between the components; the totals keep their means.
        let shared = (expected.shared * preset.shared_scale.max(0.0))
            .min(0.9 * expected.home.min(expected.away));
        let indep_home = expected.home - shared;
        let indep_away = expected.away - shared;

        let gamma = preset
            .dispersion_shape
            .filter(|k| k.is_finite() && *k > 0.0)
            .and_then(|k| Gamma::new(k, 1.0 / k).ok());
        let fixed_home = poisson(indep_home);
        let fixed_away = poisson(indep_away);
        let common = poisson(shared);
        let cap = self.params.max_goals as u32;

        let mut out = Vec::with_capacity(opts.trials);
        for i in 0..opts.trials {
            if i % DEADLINE_CHECK_EVERY == 0
                && let Some(deadline) = opts.deadline.as_ref()
            {
                deadline.check()?;
            }

            let (x1, x2) = match gamma.as_ref() {
                Some(g) => {
                    let gh: f64 = g.sample(rng);
                    let ga: f64 = g.sample(rng);
                    (
                        draw(&poisson(indep_home * gh), rng),
                        draw(&poisson(indep_away * ga), rng),
                    )
                }
                None => (draw(&fixed_home, rng), draw(&fixed_away, rng)),
            };
            let z = draw(&common, rng);

            out.push(TrialScore {
                home_goals: (x1 + z).min(cap) as u8,
                away_goals: (x2 + z).min(cap) as u8,
            });
        }

        Ok(SimulationRun {
            mode: opts.mode,
            expected,
            trials: out,
        })
    }
}

fn poisson(lambda: f64) -> Option<Poisson<f64>> {
    if lambda.is_finite() && lambda > 1e-9 {
        Poisson::new(lambda).ok()
    } else {
        None
    }
}

fn draw<R: Rng + ?Sized>(dist: &Option<Poisson<f64>>, rng: &mut R) -> u32 {
    match dist {
        Some(d) => {
            let v: f64 = d.sample(rng);
            v.max(0.0) as u32
        }
        None => 0,
    }
}

/// 0–100 index to -1..1 around the league average.
fn index_unit(index: f64) -> f64 {
    ((index - 50.0) / 50.0).clamp(-1.0, 1.0)
}

fn clamp(v: f64, lo: f64, hi: f64) -> f64 {
    v.max(lo).min(hi)
}
