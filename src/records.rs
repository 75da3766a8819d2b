use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::markets::Market;
use crate::match_analysis::{Finding, Severity};
use crate::orchestrator::{EngineKind, Recommendation};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendationRecord {
    pub fixture_id: String,
    pub market_type: Market,
    pub predicted_value: String,
    pub confidence: f64,
    pub stars: u8,
    pub provenance: Vec<EngineKind>,
    pub generated_at: DateTime<Utc>,
}

impl From<&Recommendation> for RecommendationRecord {
    fn from(r: &Recommendation) -> Self {
        Self {
            fixture_id: r.fixture_id.clone(),
            market_type: r.market,
            predicted_value: r.predicted_value.clone(),
            confidence: (r.confidence * 10.0).round() / 10.0,
            stars: r.stars,
            provenance: r.provenance.clone(),
            generated_at: r.generated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindingRecord {
    pub fixture_id: String,
    pub severity: Severity,
    pub message: String,
}

impl From<&Finding> for FindingRecord {
    fn from(f: &Finding) -> Self {
        Self {
            fixture_id: f.fixture_id.clone(),
            severity: f.severity,
            message: f.message.clone(),
        }
    }
}

/// Records are keyed by `(fixture_id, market)`; reruns replace, never duplicate.
pub trait RecordStore {
    /// Replaces every record of `fixture_id` with the given sets, atomically.
    fn replace_fixture(
        &mut self,
        fixture_id: &str,
        recommendations: &[RecommendationRecord],
        findings: &[FindingRecord],
    ) -> Result<(), StoreError>;

    fn recommendations(&self, fixture_id: &str) -> Result<Vec<RecommendationRecord>, StoreError>;

    fn findings(&self, fixture_id: &str) -> Result<Vec<FindingRecord>, StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    recommendations: BTreeMap<String, BTreeMap<Market, RecommendationRecord>>,
    findings: BTreeMap<String, Vec<FindingRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fixture_count(&self) -> usize {
        self.recommendations
            .keys()
            .chain(self.findings.keys())
            .collect::<std::collections::BTreeSet<_>>()
            .len()
    }

    pub fn recommendation_count(&self) -> usize {
        self.recommendations.values().map(BTreeMap::len).sum()
    }
}

impl RecordStore for MemoryStore {
    fn replace_fixture(
        &mut self,
        fixture_id: &str,
        recommendations: &[RecommendationRecord],
        findings: &[FindingRecord],
    ) -> Result<(), StoreError> {
        let by_market = recommendations
            .iter()
            .map(|r| (r.market_type, r.clone()))
            .collect();
        self.recommendations.insert(fixture_id.to_string(), by_market);
        self.findings
            .insert(fixture_id.to_string(), findings.to_vec());
        Ok(())
    }

    fn recommendations(&self, fixture_id: &str) -> Result<Vec<RecommendationRecord>, StoreError> {
        Ok(self
            .recommendations
            .get(fixture_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }

    fn findings(&self, fixture_id: &str) -> Result<Vec<FindingRecord>, StoreError> {
        Ok(self.findings.get(fixture_id).cloned().unwrap_or_default())
    }
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        init_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self { conn })
    }
}

fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS recommendations (
            fixture_id TEXT NOT NULL,
            market_type TEXT NOT NULL,
            predicted_value TEXT NOT NULL,
            confidence REAL NOT NULL,
            stars INTEGER NOT NULL,
            provenance TEXT NOT NULL,
            generated_at TEXT NOT NULL,
            PRIMARY KEY (fixture_id, market_type)
        );

        CREATE TABLE IF NOT EXISTS findings (
            fixture_id TEXT NOT NULL,
            seq INTEGER NOT NULL,
            severity TEXT NOT NULL,
            message TEXT NOT NULL,
            PRIMARY KEY (fixture_id, seq)
        );
        CREATE INDEX IF NOT EXISTS idx_findings_severity ON findings(severity);
        "#,
    )?;
    Ok(())
}

impl RecordStore for SqliteStore {
    fn replace_fixture(
        &mut self,
        fixture_id: &str,
        recommendations: &[RecommendationRecord],
        findings: &[FindingRecord],
    ) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM recommendations WHERE fixture_id = ?1",
            params![fixture_id],
        )?;
        tx.execute("DELETE FROM findings WHERE fixture_id = ?1", params![fixture_id])?;

        for r in recommendations {
            tx.execute(
                r#"
                INSERT INTO recommendations (
                    fixture_id, market_type, predicted_value, confidence, stars, provenance, generated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(fixture_id, market_type) DO UPDATE SET
                    predicted_value = excluded.predicted_value,
                    confidence = excluded.confidence,
                    stars = excluded.stars,
                    provenance = excluded.provenance,
                    generated_at = excluded.generated_at
                "#,
                params![
                    fixture_id,
                    r.market_type.code(),
                    r.predicted_value,
                    r.confidence,
                    r.stars as i64,
                    serde_json::to_string(&r.provenance)?,
                    r.generated_at.to_rfc3339(),
                ],
            )?;
        }
        for (seq, f) in findings.iter().enumerate() {
            tx.execute(
                "INSERT INTO findings (fixture_id, seq, severity, message) VALUES (?1, ?2, ?3, ?4)",
                params![fixture_id, seq as i64, f.severity.label(), f.message],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn recommendations(&self, fixture_id: &str) -> Result<Vec<RecommendationRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT market_type, predicted_value, confidence, stars, provenance, generated_at
            FROM recommendations
            WHERE fixture_id = ?1
            ORDER BY market_type ASC
            "#,
        )?;
        let rows = stmt.query_map(params![fixture_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (market, predicted_value, confidence, stars, provenance, generated_at) = row?;
            out.push(RecommendationRecord {
                fixture_id: fixture_id.to_string(),
                market_type: market.parse().map_err(|_| corrupt(&market))?,
                predicted_value,
                confidence,
                stars: stars.clamp(0, 5) as u8,
                provenance: serde_json::from_str(&provenance)?,
                generated_at: DateTime::parse_from_rfc3339(&generated_at)
                    .map_err(|_| corrupt(&generated_at))?
                    .with_timezone(&Utc),
            });
        }
        out.sort_by_key(|r| r.market_type);
        Ok(out)
    }

    fn findings(&self, fixture_id: &str) -> Result<Vec<FindingRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT severity, message FROM findings WHERE fixture_id = ?1 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![fixture_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (severity, message) = row?;
            let severity = match severity.as_str() {
                "info" => Severity::Info,
                "warning" => Severity::Warning,
                "critical" => Severity::Critical,
                other => return Err(corrupt(other)),
            };
            out.push(FindingRecord {
                fixture_id: fixture_id.to_string(),
                severity,
                message,
            });
        }
        Ok(out)
    }
}

fn corrupt(value: &str) -> StoreError {
    StoreError::Corrupt(value.to_string())
}

/// Writes `value` as pretty JSON through a temp file and a rename.
pub fn write_json_report<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    if let Some(dir) = path.parent()
        && !dir.as_os_str().is_empty()
    {
        fs::create_dir_all(dir)?;
    }
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
