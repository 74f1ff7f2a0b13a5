use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tokio::sync::RwLock;

use crate::captcha_repo::{parse_timestamp, SqliteCaptchaRepository};

pub(crate) const CREATE_ANALYSES: &str = "CREATE TABLE IF NOT EXISTS market_analyses (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    search_text TEXT NOT NULL,
    analyzed_at TEXT NOT NULL,
    average_price REAL,
    report TEXT NOT NULL
)";

pub(crate) const CREATE_ANALYSES_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS market_analyses_by_search ON market_analyses (search_text, analyzed_at)";

/// One saved market analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub search_text: String,
    pub analyzed_at: DateTime<Utc>,
    /// Mean listing price, absent when the analysis found nothing priced.
    pub average_price: Option<f64>,
    pub report: JsonValue,
}

/// Past analyses keyed by search text, used for price trends.
#[async_trait]
pub trait AnalysisHistory: Send + Sync {
    async fn save_analysis(&self, record: &AnalysisRecord) -> Result<()>;

    /// Newest first, at most `limit` analyses whose search text equals `search_text`.
    async fn get_historical_analyses(
        &self,
        search_text: &str,
        limit: usize,
    ) -> Result<Vec<AnalysisRecord>>;
}

#[derive(Debug, Default)]
pub struct MemoryAnalysisHistory {
    records: RwLock<Vec<AnalysisRecord>>,
}

impl MemoryAnalysisHistory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AnalysisHistory for MemoryAnalysisHistory {
    async fn save_analysis(&self, record: &AnalysisRecord) -> Result<()> {
        self.records.write().await.push(record.clone());
        Ok(())
    }

    async fn get_historical_analyses(
        &self,
        search_text: &str,
        limit: usize,
    ) -> Result<Vec<AnalysisRecord>> {
        let records = self.records.read().await;
        let mut matching: Vec<AnalysisRecord> = records
            .iter()
            .rev()
            .filter(|r| r.search_text == search_text)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.analyzed_at.cmp(&a.analyzed_at));
        matching.truncate(limit);
        Ok(matching)
    }
}

fn analysis_from_row(row: &SqliteRow) -> Result<AnalysisRecord> {
    let analyzed_at: String = row.try_get("analyzed_at")?;
    let report: String = row.try_get("report")?;
    Ok(AnalysisRecord {
        search_text: row.try_get("search_text")?,
        analyzed_at: parse_timestamp(&analyzed_at)?,
        average_price: row.try_get("average_price")?,
        report: serde_json::from_str(&report).context("parsing stored report")?,
    })
}

#[async_trait]
impl AnalysisHistory for SqliteCaptchaRepository {
    async fn save_analysis(&self, record: &AnalysisRecord) -> Result<()> {
        let report = serde_json::to_string(&record.report).context("serializing report")?;
        sqlx::query(
            "INSERT INTO market_analyses (search_text, analyzed_at, average_price, report) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(&record.search_text)
        .bind(record.analyzed_at.to_rfc3339_opts(SecondsFormat::Micros, true))
        .bind(record.average_price)
        .bind(report)
        .execute(self.pool())
        .await
        .with_context(|| format!("saving analysis of {:?}", record.search_text))?;
        Ok(())
    }

    async fn get_historical_analyses(
        &self,
        search_text: &str,
        limit: usize,
    ) -> Result<Vec<AnalysisRecord>> {
        let rows = sqlx::query(
            "SELECT search_text, analyzed_at, average_price, report FROM market_analyses \
             WHERE search_text = ? ORDER BY analyzed_at DESC, id DESC LIMIT ?",
        )
        .bind(search_text)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(self.pool())
        .await
        .with_context(|| format!("loading analyses of {search_text:?}"))?;
        rows.iter().map(analysis_from_row).collect()
    }
}
