use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::snapshot::Fixture;

const DEFAULT_HOME_GOALS: f64 = 1.45;
const DEFAULT_AWAY_GOALS: f64 = 1.15;

/// Average goals scored by home and away sides in one league.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LeagueBaseline {
    pub home_goals: f64,
    pub away_goals: f64,
    #[serde(default)]
    pub sample_matches: usize,
}

impl LeagueBaseline {
    pub fn new(home_goals: f64, away_goals: f64) -> Self {
        Self {
            home_goals,
            away_goals,
            sample_matches: 0,
        }
    }

    pub fn defaults() -> Self {
        Self::new(DEFAULT_HOME_GOALS, DEFAULT_AWAY_GOALS)
    }

    /// Clamp into a plausible range; a zero baseline would make every simulated score 0-0.
    pub fn sanitized(self) -> Self {
        let fix = |v: f64, default: f64| {
            if v.is_finite() && v > 0.0 {
                v.clamp(0.2, 4.0)
            } else {
                default
            }
        };
        Self {
            home_goals: fix(self.home_goals, DEFAULT_HOME_GOALS),
            away_goals: fix(self.away_goals, DEFAULT_AWAY_GOALS),
            sample_matches: self.sample_matches,
        }
    }
}

impl Default for LeagueBaseline {
    fn default() -> Self {
        Self::defaults()
    }
}

/// Estimate a league baseline from its settled fixtures.
pub fn compute_league_baseline(league: &str, fixtures: &[Fixture]) -> LeagueBaseline {
    let mut home_goals = 0.0;
    let mut away_goals = 0.0;
    let mut n = 0usize;

    for f in fixtures {
        if f.league != league {
            continue;
        }
        let Some(result) = f.result else {
            continue;
        };
        home_goals += result.home_goals as f64;
        away_goals += result.away_goals as f64;
        n += 1;
    }

    let d = LeagueBaseline::defaults();
    let mut out = d;
    out.sample_matches = n;
    if n > 0 {
        out.home_goals = home_goals / n as f64;
        out.away_goals = away_goals / n as f64;
    }

    // Shrink small samples toward defaults to avoid wild swings.
    const MIN_N: f64 = 200.0;
    let w = ((n as f64) / MIN_N).clamp(0.0, 1.0);
    out.home_goals = (1.0 - w) * d.home_goals + w * out.home_goals;
    out.away_goals = (1.0 - w) * d.away_goals + w * out.away_goals;
    out.sanitized()
}

/// Per-league baselines for one batch: supplied values win over estimates.
#[derive(Debug, Clone, Default)]
pub struct BaselineBook {
    by_league: HashMap<String, LeagueBaseline>,
}

impl BaselineBook {
    pub fn build(supplied: &HashMap<String, LeagueBaseline>, fixtures: &[Fixture]) -> Self {
        let mut by_league = HashMap::new();
        for f in fixtures {
            if by_league.contains_key(&f.league) {
                continue;
            }
            let baseline = match supplied.get(&f.league) {
                Some(b) => b.sanitized(),
                None => compute_league_baseline(&f.league, fixtures),
            };
            by_league.insert(f.league.clone(), baseline);
        }
        for (league, b) in supplied {
            by_league
                .entry(league.clone())
                .or_insert_with(|| b.sanitized());
        }
        Self { by_league }
    }

    pub fn get(&self, league: &str) -> LeagueBaseline {
        self.by_league.get(league).copied().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::FinalScore;
    use chrono::{TimeZone, Utc};

    fn settled(id: usize, league: &str, h: u8, a: u8) -> Fixture {
        Fixture {
            fixture_id: format!("f{id}"),
            league: league.to_string(),
            kickoff: Utc.with_ymd_and_hms(2026, 1, 1, 15, 0, 0).unwrap(),
            home_team: "h".to_string(),
            away_team: "a".to_string(),
            odds: None,
            head_to_head: None,
            result: Some(FinalScore {
                home_goals: h,
                away_goals: a,
            }),
        }
    }

    #[test]
    fn small_samples_stay_near_defaults() {
        let fixtures = vec![settled(1, "l", 5, 5), settled(2, "l", 5, 5)];
        let b = compute_league_baseline("l", &fixtures);
        assert_eq!(b.sample_matches, 2);
        assert!((b.home_goals - DEFAULT_HOME_GOALS).abs() < 0.05);
    }

    #[test]
    fn large_samples_follow_the_data() {
        let fixtures: Vec<Fixture> = (0..400).map(|i| settled(i, "l", 2, 1)).collect();
        let b = compute_league_baseline("l", &fixtures);
        assert!((b.home_goals - 2.0).abs() < 1e-9);
        assert!((b.away_goals - 1.0).abs() < 1e-9);
    }

    #[test]
    fn supplied_baselines_take_precedence() {
        let fixtures: Vec<Fixture> = (0..400).map(|i| settled(i, "l", 3, 0)).collect();
        let supplied = HashMap::from([("l".to_string(), LeagueBaseline::new(1.3, 1.1))]);
        let book = BaselineBook::build(&supplied, &fixtures);
        assert_eq!(book.get("l").home_goals, 1.3);
        assert_eq!(book.get("unknown"), LeagueBaseline::defaults());
    }

    #[test]
    fn sanitized_replaces_non_positive_values() {
        let b = LeagueBaseline::new(0.0, f64::NAN).sanitized();
        assert_eq!(b.home_goals, DEFAULT_HOME_GOALS);
        assert_eq!(b.away_goals, DEFAULT_AWAY_GOALS);
    }
}
