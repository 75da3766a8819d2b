use std::collections::HashMap;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, StoreError};
use crate::league_params::LeagueBaseline;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Venue {
    Home,
    Away,
}

impl Venue {
    pub fn label(self) -> &'static str {
        match self {
            Venue::Home => "home",
            Venue::Away => "away",
        }
    }
}

/// Venue-specific scores. Attack/defense are 0–10, field factor 0–7.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VenueScores {
    #[serde(default)]
    pub attack: Option<f64>,
    #[serde(default)]
    pub defense: Option<f64>,
    #[serde(default)]
    pub field_factor: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamProfile {
    pub team_id: String,
    #[serde(default)]
    pub name: String,
    pub league: String,
    #[serde(default)]
    pub home: VenueScores,
    #[serde(default)]
    pub away: VenueScores,
    /// General team quality, 0–9.
    #[serde(default)]
    pub strength: Option<f64>,
    /// Upstream-computed multiplier, 0.5–1.5. Takes precedence over `average_age`.
    #[serde(default)]
    pub age_multiplier: Option<f64>,
    #[serde(default)]
    pub average_age: Option<f64>,
    /// Lucifero recency-weighted form, 0–25.
    #[serde(default)]
    pub form: Option<f64>,
    /// 0–10.
    #[serde(default)]
    pub reliability: Option<f64>,
    #[serde(default)]
    pub market_value: Option<f64>,
    #[serde(default)]
    pub formation: Option<String>,
}

impl TeamProfile {
    pub fn venue(&self, venue: Venue) -> &VenueScores {
        match venue {
            Venue::Home => &self.home,
            Venue::Away => &self.away,
        }
    }

    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.team_id
        } else {
            &self.name
        }
    }
}

/// Decimal prices. Any price at or below 1.0 is treated as absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BookmakerOdds {
    #[serde(default)]
    pub home: Option<f64>,
    #[serde(default)]
    pub draw: Option<f64>,
    #[serde(default)]
    pub away: Option<f64>,
    #[serde(default)]
    pub over_2_5: Option<f64>,
    #[serde(default)]
    pub under_2_5: Option<f64>,
    #[serde(default)]
    pub btts_yes: Option<f64>,
    #[serde(default)]
    pub btts_no: Option<f64>,
}

/// Recency-decayed head-to-head aggregate, from the home side's perspective (-1..=1).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HeadToHead {
    pub weighted_score: f64,
    #[serde(default)]
    pub meetings: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalScore {
    pub home_goals: u8,
    pub away_goals: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fixture {
    pub fixture_id: String,
    pub league: String,
    pub kickoff: DateTime<Utc>,
    pub home_team: String,
    pub away_team: String,
    #[serde(default)]
    pub odds: Option<BookmakerOdds>,
    #[serde(default)]
    pub head_to_head: Option<HeadToHead>,
    /// Present once the real result is known; the fixture is frozen from then on.
    #[serde(default)]
    pub result: Option<FinalScore>,
}

impl Fixture {
    pub fn is_settled(&self) -> bool {
        self.result.is_some()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchSnapshot {
    #[serde(default)]
    pub teams: Vec<TeamProfile>,
    #[serde(default)]
    pub fixtures: Vec<Fixture>,
    #[serde(default)]
    pub baselines: HashMap<String, LeagueBaseline>,
}

/// A fixture whose team references resolved against the snapshot.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedFixture<'a> {
    pub fixture: &'a Fixture,
    pub home: &'a TeamProfile,
    pub away: &'a TeamProfile,
}

impl BatchSnapshot {
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let raw = fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, StoreError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn team_index(&self) -> HashMap<&str, &TeamProfile> {
        self.teams.iter().map(|t| (t.team_id.as_str(), t)).collect()
    }

    pub fn resolve<'a>(
        &'a self,
        fixture: &'a Fixture,
        teams: &HashMap<&str, &'a TeamProfile>,
    ) -> Result<ResolvedFixture<'a>, EngineError> {
        let malformed = |reason: String| EngineError::MalformedFixture {
            fixture_id: fixture.fixture_id.clone(),
            reason,
        };

        if fixture.fixture_id.trim().is_empty() {
            return Err(malformed("empty fixture id".to_string()));
        }
        if fixture.home_team.trim().is_empty() || fixture.away_team.trim().is_empty() {
            return Err(malformed("empty team reference".to_string()));
        }
        if fixture.home_team == fixture.away_team {
            return Err(malformed(format!(
                "team {} on both sides",
                fixture.home_team
            )));
        }
        if let Some(h2h) = fixture.head_to_head
            && !h2h.weighted_score.is_finite()
        {
            return Err(malformed("non-finite head-to-head score".to_string()));
        }

        let home = teams
            .get(fixture.home_team.as_str())
            .copied()
            .ok_or_else(|| malformed(format!("unknown home team {}", fixture.home_team)))?;
        let away = teams
            .get(fixture.away_team.as_str())
            .copied()
            .ok_or_else(|| malformed(format!("unknown away team {}", fixture.away_team)))?;

        Ok(ResolvedFixture {
            fixture,
            home,
            away,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SNAPSHOT_JSON: &str = r#"{
        "teams": [
            {"team_id": "inter", "league": "serie-a", "home": {"attack": 8.1}, "strength": 8},
            {"team_id": "lecce", "league": "serie-a"}
        ],
        "fixtures": [
            {"fixture_id": "f1", "league": "serie-a", "kickoff": "2026-10-18T18:45:00Z",
             "home_team": "inter", "away_team": "lecce",
             "odds": {"home": 1.35, "draw": 5.0, "away": 9.0}}
        ]
    }"#;

    #[test]
    fn sparse_documents_load_with_defaults() {
        let snap = BatchSnapshot::from_json_str(SNAPSHOT_JSON).expect("snapshot should parse");
        assert_eq!(snap.teams.len(), 2);
        let lecce = &snap.teams[1];
        assert!(lecce.reliability.is_none());
        assert!(lecce.home.attack.is_none());
        assert!(snap.baselines.is_empty());
        assert!(!snap.fixtures[0].is_settled());
    }

    #[test]
    fn resolve_rejects_same_team_on_both_sides() {
        let mut snap = BatchSnapshot::from_json_str(SNAPSHOT_JSON).unwrap();
        snap.fixtures[0].away_team = "inter".to_string();
        let teams = snap.team_index();
        let err = snap.resolve(&snap.fixtures[0], &teams).unwrap_err();
        assert!(matches!(err, EngineError::MalformedFixture { .. }));
    }

    #[test]
    fn resolve_rejects_unknown_team() {
        let mut snap = BatchSnapshot::from_json_str(SNAPSHOT_JSON).unwrap();
        snap.fixtures[0].away_team = "ghost".to_string();
        let teams = snap.team_index();
        let err = snap.resolve(&snap.fixtures[0], &teams).unwrap_err();
        assert!(err.to_string().contains("unknown away team ghost"));
    }
}
