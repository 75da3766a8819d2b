use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::simulator::TrialScore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Market {
    #[serde(rename = "1X2")]
    Sign,
    #[serde(rename = "DC")]
    DoubleChance,
    #[serde(rename = "OU1.5")]
    OverUnder15,
    #[serde(rename = "OU2.5")]
    OverUnder25,
    #[serde(rename = "OU3.5")]
    OverUnder35,
    #[serde(rename = "BTTS")]
    Btts,
    #[serde(rename = "CS")]
    ExactScore,
}

/// Minimum merged confidence before a market is recommended.
pub static DEFAULT_THRESHOLDS: Lazy<BTreeMap<Market, f64>> = Lazy::new(|| {
    BTreeMap::from([
        (Market::Sign, 55.0),
        (Market::DoubleChance, 60.0),
        (Market::OverUnder15, 60.0),
        (Market::OverUnder25, 55.0),
        (Market::OverUnder35, 55.0),
        (Market::Btts, 55.0),
        (Market::ExactScore, 20.0),
    ])
});

impl Market {
    pub const ALL: [Market; 7] = [
        Market::Sign,
        Market::DoubleChance,
        Market::OverUnder15,
        Market::OverUnder25,
        Market::OverUnder35,
        Market::Btts,
        Market::ExactScore,
    ];

    pub fn code(self) -> &'static str {
        match self {
            Market::Sign => "1X2",
            Market::DoubleChance => "DC",
            Market::OverUnder15 => "OU1.5",
            Market::OverUnder25 => "OU2.5",
            Market::OverUnder35 => "OU3.5",
            Market::Btts => "BTTS",
            Market::ExactScore => "CS",
        }
    }

    /// Goal line of an over/under market.
    pub fn line(self) -> Option<f64> {
        match self {
            Market::OverUnder15 => Some(1.5),
            Market::OverUnder25 => Some(2.5),
            Market::OverUnder35 => Some(3.5),
            _ => None,
        }
    }

    pub fn default_threshold(self) -> f64 {
        DEFAULT_THRESHOLDS.get(&self).copied().unwrap_or(55.0)
    }
}

impl fmt::Display for Market {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.code())
    }
}

impl FromStr for Market {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let key = raw.trim().to_ascii_uppercase();
        Market::ALL
            .into_iter()
            .find(|m| m.code() == key)
            .ok_or_else(|| ConfigError::UnknownMarket(raw.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Selection {
    Home,
    Draw,
    Away,
    HomeOrDraw,
    DrawOrAway,
    HomeOrAway,
    Over,
    Under,
    Yes,
    No,
    Score { home: u8, away: u8 },
}

impl Selection {
    pub fn code(&self) -> String {
        match self {
            Selection::Home => "1".to_string(),
            Selection::Draw => "X".to_string(),
            Selection::Away => "2".to_string(),
            Selection::HomeOrDraw => "1X".to_string(),
            Selection::DrawOrAway => "X2".to_string(),
            Selection::HomeOrAway => "12".to_string(),
            Selection::Over => "Over".to_string(),
            Selection::Under => "Under".to_string(),
            Selection::Yes => "Yes".to_string(),
            Selection::No => "No".to_string(),
            Selection::Score { home, away } => format!("{home}-{away}"),
        }
    }

    /// Human-readable value for a recommendation record, e.g. "Over 2.5".
    pub fn predicted_value(&self, market: Market) -> String {
        match market.line() {
            Some(line) => format!("{} {line:.1}", self.code()),
            None => self.code(),
        }
    }

    /// The 1X2 sign this selection points at, when it points at exactly one.
    pub fn as_sign(&self) -> Option<Selection> {
        match self {
            Selection::Home | Selection::Draw | Selection::Away => Some(*self),
            Selection::Score { home, away } => Some(sign_of_goals(*home, *away)),
            _ => None,
        }
    }
}

impl fmt::Display for Selection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.code())
    }
}

pub fn sign_of_goals(home: u8, away: u8) -> Selection {
    if home > away {
        Selection::Home
    } else if home < away {
        Selection::Away
    } else {
        Selection::Draw
    }
}

pub fn sign_of(score: TrialScore) -> Selection {
    sign_of_goals(score.home_goals, score.away_goals)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn market_codes_round_trip_through_from_str() {
        for m in Market::ALL {
            assert_eq!(m.code().parse::<Market>().unwrap(), m);
        }
        assert!("ASIAN".parse::<Market>().is_err());
    }

    #[test]
    fn predicted_value_includes_goal_line() {
        assert_eq!(Selection::Over.predicted_value(Market::OverUnder25), "Over 2.5");
        assert_eq!(
            Selection::Score { home: 2, away: 1 }.predicted_value(Market::ExactScore),
            "2-1"
        );
        assert_eq!(Selection::HomeOrDraw.predicted_value(Market::DoubleChance), "1X");
    }

    #[test]
    fn exact_scores_map_to_signs() {
        assert_eq!(Selection::Score { home: 0, away: 0 }.as_sign(), Some(Selection::Draw));
        assert_eq!(Selection::Score { home: 0, away: 2 }.as_sign(), Some(Selection::Away));
        assert_eq!(Selection::Over.as_sign(), None);
    }
}
