//! Cross-marketplace search fan-out and the runtime wiring used by the CLI.

mod config;
mod runtime;
mod summary;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::join_all;
use scout_core::{sort_results, PlatformFailure, ScoutError, SearchQuery, SearchResult};
use scout_providers::normalize::normalize_query_text;
use scout_providers::{normalize_tag, ProviderFactory};
use scout_storage::{AnalysisHistory, AnalysisRecord};
use serde::Serialize;
use tracing::{debug, info, warn};

pub use config::{ScoutConfig, DEFAULT_DATABASE_URL};
pub use runtime::ScoutRuntime;
pub use summary::{price_trend, MarketSummary, PriceStats};

pub const CRATE_NAME: &str = "scout-analysis";

pub const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(20);

/// How many earlier analyses, at most, feed the price trend.
const TREND_HISTORY_LIMIT: usize = 30;
const TREND_WINDOW_DAYS: i64 = 30;

/// Key under which analyses of `text` are saved: typo-corrected, lowercased, single-spaced.
pub fn history_key(text: &str) -> String {
    normalize_query_text(text).to_lowercase()
}

/// How one platform fared in a fan-out.
#[derive(Debug, Clone, Serialize)]
pub struct PlatformOutcome {
    pub platform: String,
    pub result_count: usize,
    pub error_kind: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MarketReport {
    pub query: SearchQuery,
    pub generated_at: DateTime<Utc>,
    pub platforms: Vec<PlatformOutcome>,
    pub results: Vec<SearchResult>,
    pub summary: MarketSummary,
}

impl MarketReport {
    pub fn failed_platforms(&self) -> Vec<&str> {
        self.platforms
            .iter()
            .filter(|p| p.error.is_some())
            .map(|p| p.platform.as_str())
            .collect()
    }
}

/// Runs one query against several marketplaces at once and merges what comes back.
pub struct MarketAnalyzer {
    factory: Arc<ProviderFactory>,
    provider_timeout: Duration,
    check_availability: bool,
    history: Option<Arc<dyn AnalysisHistory>>,
}

impl MarketAnalyzer {
    pub fn new(factory: Arc<ProviderFactory>) -> Self {
        Self {
            factory,
            provider_timeout: DEFAULT_PROVIDER_TIMEOUT,
            check_availability: false,
            history: None,
        }
    }

    /// Save every report and derive the 30-day price trend from earlier ones.
    pub fn with_history(mut self, history: Arc<dyn AnalysisHistory>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn with_provider_timeout(mut self, timeout: Duration) -> Self {
        self.provider_timeout = timeout;
        self
    }

    /// Check each provider before searching and skip the unreachable ones.
    pub fn with_availability_check(mut self, enabled: bool) -> Self {
        self.check_availability = enabled;
        self
    }

    pub fn factory(&self) -> &Arc<ProviderFactory> {
        &self.factory
    }

    /// Merged, sorted results from every platform that answered. Fails only when all of
    /// them failed.
    pub async fn analyze_market(
        &self,
        query: &SearchQuery,
        platforms: &[String],
    ) -> Result<Vec<SearchResult>, ScoutError> {
        Ok(self.analyze_market_report(query, platforms).await?.results)
    }

    pub async fn analyze_market_report(
        &self,
        query: &SearchQuery,
        platforms: &[String],
    ) -> Result<MarketReport, ScoutError> {
        query.validate()?;
        let tags = dedup_tags(platforms);
        if tags.is_empty() {
            return Err(ScoutError::validation("at least one platform is required"));
        }

        let settled = join_all(tags.iter().map(|tag| self.search_platform(tag, query))).await;

        let mut results = Vec::new();
        let mut outcomes = Vec::with_capacity(tags.len());
        let mut failures = Vec::new();
        for (tag, outcome) in tags.into_iter().zip(settled) {
            match outcome {
                Ok(found) => {
                    outcomes.push(PlatformOutcome {
                        platform: tag,
                        result_count: found.len(),
                        error_kind: None,
                        error: None,
                    });
                    results.extend(found);
                }
                Err(error) => {
                    outcomes.push(PlatformOutcome {
                        platform: tag.clone(),
                        result_count: 0,
                        error_kind: Some(error.kind().to_string()),
                        error: Some(error.to_string()),
                    });
                    failures.push(PlatformFailure {
                        platform: tag,
                        error,
                    });
                }
            }
        }

        if failures.len() == outcomes.len() {
            return Err(ScoutError::AggregateFailure(failures));
        }
        for failure in &failures {
            warn!(platform = %failure.platform, error = %failure.error, "platform search failed");
        }

        sort_results(&mut results, query.sort);
        let mut report = MarketReport {
            query: query.clone(),
            generated_at: Utc::now(),
            summary: MarketSummary::from_results(&results),
            platforms: outcomes,
            results,
        };
        if let Some(history) = &self.history {
            record_history(history.as_ref(), &mut report).await;
        }
        info!(
            results = report.results.len(),
            platforms = report.platforms.len(),
            failed = failures.len(),
            trend = report.summary.price_trend_30d,
            "market analysis complete"
        );
        Ok(report)
    }

    /// Earlier analyses of the same search, newest first. Empty without a history store.
    pub async fn historical_analyses(
        &self,
        text: &str,
        limit: usize,
    ) -> Result<Vec<AnalysisRecord>, ScoutError> {
        let Some(history) = &self.history else {
            return Ok(Vec::new());
        };
        Ok(history.get_historical_analyses(&history_key(text), limit).await?)
    }

    async fn search_platform(
        &self,
        tag: &str,
        query: &SearchQuery,
    ) -> Result<Vec<SearchResult>, ScoutError> {
        let provider = self.factory.get_provider(tag)?;
        if self.check_availability && !provider.is_available().await {
            return Err(ScoutError::unavailable(tag, "availability check failed"));
        }
        match tokio::time::timeout(self.provider_timeout, provider.search(query)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ScoutError::unavailable(
                tag,
                format!("search timed out after {:?}", self.provider_timeout),
            )),
        }
    }
}

/// Sets the price trend from earlier analyses, then saves the report. History errors are
/// logged and never fail the analysis.
async fn record_history(history: &dyn AnalysisHistory, report: &mut MarketReport) {
    let key = history_key(&report.query.text);
    let window_start = report.generated_at - ChronoDuration::days(TREND_WINDOW_DAYS);
    match history.get_historical_analyses(&key, TREND_HISTORY_LIMIT).await {
        Ok(earlier) => {
            let averages: Vec<f64> = earlier
                .iter()
                .filter(|r| r.analyzed_at >= window_start)
                .filter_map(|r| r.average_price)
                .collect();
            let current = report.summary.price.as_ref().map(|p| p.average);
            report.summary.price_trend_30d = price_trend(current, &averages);
            debug!(search = %key, earlier = averages.len(), "price trend computed");
        }
        Err(err) => warn!(search = %key, error = %err, "loading analysis history failed"),
    }

    let saved = match serde_json::to_value(&*report) {
        Ok(value) => {
            history
                .save_analysis(&AnalysisRecord {
                    search_text: key.clone(),
                    analyzed_at: report.generated_at,
                    average_price: report.summary.price.as_ref().map(|p| p.average),
                    report: value,
                })
                .await
        }
        Err(err) => Err(err.into()),
    };
    if let Err(err) = saved {
        warn!(search = %key, error = %err, "saving analysis failed");
    }
}

/// Normalized tags in request order, first occurrence wins.
fn dedup_tags(platforms: &[String]) -> Vec<String> {
    let mut tags: Vec<String> = Vec::with_capacity(platforms.len());
    for tag in platforms.iter().map(|t| normalize_tag(t)) {
        if !tag.is_empty() && !tags.contains(&tag) {
            tags.push(tag);
        }
    }
    tags
}
