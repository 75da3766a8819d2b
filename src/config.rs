use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::confidence::AnalyzerSettings;
use crate::error::ConfigError;
use crate::markets::{DEFAULT_THRESHOLDS, Market};
use crate::orchestrator::{EngineBudget, EngineKind, EngineVariant, MergePolicy};
use crate::simulator::{SimMode, SimParams};
use crate::team_strength::StrengthWeights;

const DEFAULT_TRIALS: usize = 10_000;
/// Upper bound for any single engine's trial count, heavy multiplier included.
pub const MAX_TRIALS: usize = 5_000_000;
const DEFAULT_MERGE_TOLERANCE: f64 = 15.0;
const DEFAULT_SEED: u64 = 0x5EED_2026;
const DEFAULT_HEAVY_MULTIPLIER: usize = 8;
const DEFAULT_H2H_WEIGHT: f64 = 6.0;
const DEFAULT_ENGINE_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_FIXTURE_TIMEOUT_MS: u64 = 120_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub weights: StrengthWeights,
    pub mode: SimMode,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            weights: StrengthWeights::sandbox(),
            mode: SimMode::DefensiveLeaning,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Trials per fixture for the production and sandbox engines.
    pub trials: usize,
    /// Variance preset of the production engine.
    pub mode: SimMode,
    pub engines_enabled: Vec<EngineKind>,
    /// Minimum merged confidence per market; missing markets use the built-in defaults.
    pub confidence_thresholds: BTreeMap<Market, f64>,
    pub merge_tolerance: f64,
    pub seed: u64,
    pub weights: StrengthWeights,
    pub sandbox: SandboxConfig,
    pub heavy_trials_multiplier: usize,
    pub simulation: SimParams,
    pub analyzer: AnalyzerSettings,
    pub h2h_weight: f64,
    /// `None` disables the limit.
    pub engine_timeout_ms: Option<u64>,
    pub fixture_timeout_ms: Option<u64>,
    /// 0 lets rayon pick.
    pub worker_threads: usize,
    pub include_settled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            trials: DEFAULT_TRIALS,
            mode: SimMode::Balanced,
            engines_enabled: vec![EngineKind::Production, EngineKind::Sandbox],
            confidence_thresholds: (*DEFAULT_THRESHOLDS).clone(),
            merge_tolerance: DEFAULT_MERGE_TOLERANCE,
            seed: DEFAULT_SEED,
            weights: StrengthWeights::default(),
            sandbox: SandboxConfig::default(),
            heavy_trials_multiplier: DEFAULT_HEAVY_MULTIPLIER,
            simulation: SimParams::default(),
            analyzer: AnalyzerSettings::default(),
            h2h_weight: DEFAULT_H2H_WEIGHT,
            engine_timeout_ms: Some(DEFAULT_ENGINE_TIMEOUT_MS),
            fixture_timeout_ms: Some(DEFAULT_FIXTURE_TIMEOUT_MS),
            worker_threads: 0,
            include_settled: false,
        }
    }
}

impl EngineConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let file_err = |reason: String| ConfigError::File {
            path: path.display().to_string(),
            reason,
        };
        let raw = fs::read_to_string(path).map_err(|e| file_err(e.to_string()))?;
        serde_json::from_str(&raw).map_err(|e| file_err(e.to_string()))
    }

    /// File (or defaults), then process environment, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut cfg = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        cfg.apply_env_with(|key| env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Applies overrides from `lookup`. Blank values are ignored.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(v) = get("SIM_TRIALS") {
            self.trials = parse_value("SIM_TRIALS", &v)?;
        }
        if let Some(v) = get("SIM_MODE") {
            self.mode = v.parse()?;
        }
        if let Some(v) = get("ENGINES_ENABLED") {
            self.engines_enabled = split_list(&v)
                .map(EngineKind::from_str)
                .collect::<Result<Vec<_>, ConfigError>>()?;
        }
        if let Some(v) = get("MERGE_TOLERANCE") {
            self.merge_tolerance = parse_value("MERGE_TOLERANCE", &v)?;
        }
        if let Some(v) = get("CONFIDENCE_THRESHOLDS") {
            for part in split_list(&v) {
                let Some((market, value)) = part.split_once('=') else {
                    return Err(ConfigError::InvalidValue {
                        key: "CONFIDENCE_THRESHOLDS".to_string(),
                        value: part.to_string(),
                    });
                };
                let market: Market = market.parse()?;
                let value = parse_value("CONFIDENCE_THRESHOLDS", value)?;
                self.confidence_thresholds.insert(market, value);
            }
        }
        if let Some(v) = get("SIM_SEED") {
            self.seed = parse_value("SIM_SEED", &v)?;
        }
        if let Some(v) = get("WORKER_THREADS") {
            self.worker_threads = parse_value("WORKER_THREADS", &v)?;
        }
        if let Some(v) = get("ENGINE_TIMEOUT_MS") {
            self.engine_timeout_ms = parse_timeout("ENGINE_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get("FIXTURE_TIMEOUT_MS") {
            self.fixture_timeout_ms = parse_timeout("FIXTURE_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get("INCLUDE_SETTLED") {
            self.include_settled = parse_bool("INCLUDE_SETTLED", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.trials == 0 {
            return Err(ConfigError::ZeroTrials);
        }
        if self.trials > MAX_TRIALS {
            return Err(ConfigError::InvalidValue {
                key: "trials".to_string(),
                value: self.trials.to_string(),
            });
        }
        if self.engines_enabled.is_empty() {
            return Err(ConfigError::NoEnginesEnabled);
        }
        if !self.engines_enabled.contains(&EngineKind::Production) {
            return Err(ConfigError::ProductionDisabled);
        }
        self.weights.validate()?;
        if self.engines_enabled.contains(&EngineKind::Sandbox) {
            self.sandbox.weights.validate()?;
        }
        if !self.merge_tolerance.is_finite() || !(0.0..=100.0).contains(&self.merge_tolerance) {
            return Err(ConfigError::InvalidTolerance(self.merge_tolerance));
        }
        for (market, value) in &self.confidence_thresholds {
            if !value.is_finite() || !(0.0..=100.0).contains(value) {
                return Err(ConfigError::InvalidThreshold {
                    market: market.to_string(),
                    value: *value,
                });
            }
        }
        if self.heavy_trials_multiplier == 0 {
            return Err(ConfigError::InvalidValue {
                key: "heavy_trials_multiplier".to_string(),
                value: "0".to_string(),
            });
        }
        if self.engines_enabled.contains(&EngineKind::HeavyMonteCarlo)
            && self.heavy_trials().is_none_or(|t| t > MAX_TRIALS)
        {
            return Err(ConfigError::InvalidValue {
                key: "heavy_trials_multiplier".to_string(),
                value: self.heavy_trials_multiplier.to_string(),
            });
        }
        if !self.h2h_weight.is_finite() {
            return Err(ConfigError::InvalidValue {
                key: "h2h_weight".to_string(),
                value: self.h2h_weight.to_string(),
            });
        }
        Ok(())
    }

    /// Trials of the heavy engine, `None` on overflow.
    pub fn heavy_trials(&self) -> Option<usize> {
        self.trials.checked_mul(self.heavy_trials_multiplier)
    }

    /// Enabled variants in tie-break order, each listed once.
    pub fn variants(&self) -> Vec<EngineVariant> {
        EngineKind::ALL
            .into_iter()
            .filter(|k| self.engines_enabled.contains(k))
            .map(|kind| {
                let (weights, mode, trials) = match kind {
                    EngineKind::Production => (self.weights, self.mode, self.trials),
                    EngineKind::Sandbox => (self.sandbox.weights, self.sandbox.mode, self.trials),
                    EngineKind::HeavyMonteCarlo => (
                        self.weights,
                        self.mode,
                        self.heavy_trials().unwrap_or(MAX_TRIALS),
                    ),
                };
                EngineVariant {
                    kind,
                    weights,
                    mode,
                    trials,
                    params: self.simulation,
                    analyzer: self.analyzer,
                }
            })
            .collect()
    }

    pub fn merge_policy(&self) -> MergePolicy {
        let mut thresholds = (*DEFAULT_THRESHOLDS).clone();
        thresholds.extend(self.confidence_thresholds.iter().map(|(m, v)| (*m, *v)));
        MergePolicy {
            tolerance: self.merge_tolerance,
            thresholds,
        }
    }

    pub fn budget(&self, fixture_started: Instant) -> EngineBudget {
        EngineBudget {
            engine_timeout: self.engine_timeout_ms.map(Duration::from_millis),
            fixture_deadline: self
                .fixture_timeout_ms
                .map(|ms| fixture_started + Duration::from_millis(ms)),
        }
    }
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split([',', ';', ' '])
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse::<T>().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: raw.to_string(),
    })
}

fn parse_timeout(key: &str, raw: &str) -> Result<Option<u64>, ConfigError> {
    let ms: u64 = parse_value(key, raw)?;
    Ok((ms > 0).then_some(ms))
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let cfg = EngineConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.variants().len(), 2);
    }

    #[test]
    fn env_overrides_apply() {
        let mut cfg = EngineConfig::default();
        cfg.apply_env_with(env_of(&[
            ("SIM_TRIALS", "2500"),
            ("SIM_MODE", "upset_prone"),
            ("ENGINES_ENABLED", "production, heavy"),
            ("CONFIDENCE_THRESHOLDS", "1X2=62,ou2.5=58"),
            ("ENGINE_TIMEOUT_MS", "0"),
            ("INCLUDE_SETTLED", "yes"),
            ("WORKER_THREADS", " "),
        ]))
        .unwrap();
        assert_eq!(cfg.trials, 2500);
        assert_eq!(cfg.mode, SimMode::UpsetProne);
        assert_eq!(
            cfg.engines_enabled,
            vec![EngineKind::Production, EngineKind::HeavyMonteCarlo]
        );
        assert_eq!(cfg.confidence_thresholds[&Market::Sign], 62.0);
        assert_eq!(cfg.confidence_thresholds[&Market::OverUnder25], 58.0);
        assert_eq!(cfg.engine_timeout_ms, None);
        assert!(cfg.include_settled);
        assert_eq!(cfg.worker_threads, 0);

        let variants = cfg.variants();
        assert_eq!(variants[1].kind, EngineKind::HeavyMonteCarlo);
        assert_eq!(variants[1].trials, 2500 * DEFAULT_HEAVY_MULTIPLIER);
    }

    #[test]
    fn zero_trials_is_rejected_not_coerced() {
        let mut cfg = EngineConfig::default();
        cfg.apply_env_with(env_of(&[("SIM_TRIALS", "0")])).unwrap();
        assert_eq!(cfg.trials, 0);
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroTrials));
    }

    #[test]
    fn oversized_trial_counts_are_rejected() {
        let mut cfg = EngineConfig {
            trials: usize::MAX / 4,
            engines_enabled: vec![EngineKind::Production],
            ..EngineConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidValue { ref key, .. }) if key == "trials"
        ));

        cfg.trials = MAX_TRIALS;
        assert_eq!(cfg.validate(), Ok(()));

        // Fine on its own, too large once multiplied for the heavy engine.
        cfg.engines_enabled.push(EngineKind::HeavyMonteCarlo);
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidValue { ref key, .. }) if key == "heavy_trials_multiplier"
        ));

        cfg.trials = 1000;
        cfg.heavy_trials_multiplier = usize::MAX;
        assert_eq!(cfg.heavy_trials(), None);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn production_is_mandatory() {
        let mut cfg = EngineConfig::default();
        cfg.engines_enabled = vec![EngineKind::Sandbox];
        assert_eq!(cfg.validate(), Err(ConfigError::ProductionDisabled));
        cfg.engines_enabled.clear();
        assert_eq!(cfg.validate(), Err(ConfigError::NoEnginesEnabled));
    }

    #[test]
    fn unparseable_values_are_errors() {
        let mut cfg = EngineConfig::default();
        assert!(matches!(
            cfg.apply_env_with(env_of(&[("MERGE_TOLERANCE", "wide")])),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            cfg.apply_env_with(env_of(&[("ENGINES_ENABLED", "production,turbo")])),
            Err(ConfigError::UnknownEngine(_))
        ));
        cfg.merge_tolerance = 120.0;
        assert_eq!(cfg.validate(), Err(ConfigError::InvalidTolerance(120.0)));
    }

    #[test]
    fn json_config_fills_missing_fields_with_defaults() {
        let cfg: EngineConfig = serde_json::from_str(
            r#"{"trials": 3000, "mode": "defensive-leaning", "confidence_thresholds": {"BTTS": 70}}"#,
        )
        .unwrap();
        assert_eq!(cfg.trials, 3000);
        assert_eq!(cfg.mode, SimMode::DefensiveLeaning);
        assert_eq!(cfg.merge_tolerance, DEFAULT_MERGE_TOLERANCE);
        assert_eq!(cfg.merge_policy().threshold(Market::Btts), 70.0);
        assert_eq!(cfg.merge_policy().threshold(Market::Sign), 55.0);
    }
}
