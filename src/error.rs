use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::orchestrator::{EngineKind, FixtureStage};
use crate::team_strength::Signal;

/// Whole-run configuration problems. Any of these aborts the batch before a fixture is touched.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("trials must be at least 1")]
    ZeroTrials,

    #[error("no engine variant enabled")]
    NoEnginesEnabled,

    #[error("the production engine cannot be disabled")]
    ProductionDisabled,

    #[error("strength weights must be non-negative and sum to 1 (got {sum:.6})")]
    InvalidWeights { sum: f64 },

    #[error("merge tolerance must be within 0..=100 (got {0})")]
    InvalidTolerance(f64),

    #[error("confidence threshold for {market} must be within 0..=100 (got {value})")]
    InvalidThreshold { market: String, value: f64 },

    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },

    #[error("unknown simulation mode {0:?}")]
    UnknownMode(String),

    #[error("unknown engine {0:?}")]
    UnknownEngine(String),

    #[error("unknown market {0:?}")]
    UnknownMarket(String),

    #[error("cannot read config {path}: {reason}")]
    File { path: String, reason: String },
}

/// Errors local to one fixture or one engine variant. The batch isolates them.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("power rating missing for {side} side")]
    MissingRating { side: &'static str },

    #[error("engine {engine} exceeded its deadline of {budget:?}")]
    EngineTimeout { engine: EngineKind, budget: Duration },

    #[error("fixture {fixture_id} is malformed: {reason}")]
    MalformedFixture { fixture_id: String, reason: String },

    #[error("malformed identifier {field}: {value:?}")]
    MalformedIdentifier { field: &'static str, value: String },

    #[error("simulation run contains no trials")]
    EmptyRun,

    #[error("fixture {fixture_id} has no successful engine")]
    NoSuccessfulEngine { fixture_id: String },

    #[error("fixture cannot move from {from:?} to {to:?}")]
    InvalidTransition { from: FixtureStage, to: FixtureStage },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl EngineError {
    /// Timeouts and missing engines leave the fixture eligible for a later retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::EngineTimeout { .. } | EngineError::NoSuccessfulEngine { .. }
        )
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt stored value {0:?}")]
    Corrupt(String),
}

/// A signal that was absent on a profile and replaced by a default. Recoverable by definition.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct MissingSignalWarning {
    pub team_id: String,
    pub signal: Signal,
    pub substituted: f64,
}

impl fmt::Display for MissingSignalWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "team {} missing {}; substituted {:.3}",
            self.team_id, self.signal, self.substituted
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_are_retryable_but_malformed_fixtures_are_not() {
        let timeout = EngineError::EngineTimeout {
            engine: EngineKind::Sandbox,
            budget: Duration::from_millis(10),
        };
        assert!(timeout.is_retryable());

        let malformed = EngineError::MalformedFixture {
            fixture_id: "f1".to_string(),
            reason: "same team on both sides".to_string(),
        };
        assert!(!malformed.is_retryable());
    }

    #[test]
    fn config_errors_convert_into_engine_errors() {
        let err: EngineError = ConfigError::ZeroTrials.into();
        assert_eq!(err.to_string(), "trials must be at least 1");
    }
}
