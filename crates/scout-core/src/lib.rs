//! Core domain model, error taxonomy and result ranking for market scout.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "scout-core";

#[derive(Debug, Error)]
pub enum ScoutError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("authentication failed for {provider}: {reason}")]
    Authentication { provider: String, reason: String },
    #[error("rate limited by {provider}")]
    RateLimit {
        provider: String,
        retry_after_secs: Option<u64>,
    },
    #[error("provider {provider} unavailable: {reason}")]
    ProviderUnavailable { provider: String, reason: String },
    #[error("all {} platforms failed: {}", .0.len(), describe_failures(.0))]
    AggregateFailure(Vec<PlatformFailure>),
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl ScoutError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn authentication(provider: &str, reason: impl Into<String>) -> Self {
        Self::Authentication {
            provider: provider.to_string(),
            reason: reason.into(),
        }
    }

    pub fn unavailable(provider: &str, reason: impl Into<String>) -> Self {
        Self::ProviderUnavailable {
            provider: provider.to_string(),
            reason: reason.into(),
        }
    }

    /// Stable machine-readable name of the error class.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::Authentication { .. } => "authentication",
            Self::RateLimit { .. } => "rate_limit",
            Self::ProviderUnavailable { .. } => "provider_unavailable",
            Self::AggregateFailure(_) => "aggregate_failure",
            Self::UnknownProvider(_) => "unknown_provider",
            Self::Storage(_) => "storage",
        }
    }
}

/// One platform's failure inside a fan-out search.
#[derive(Debug)]
pub struct PlatformFailure {
    pub platform: String,
    pub error: ScoutError,
}

fn describe_failures(failures: &[PlatformFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.platform, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    PriceAsc,
    PriceDesc,
    Newest,
    Relevance,
}

impl SortKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PriceAsc => "price_asc",
            Self::PriceDesc => "price_desc",
            Self::Newest => "newest",
            Self::Relevance => "relevance",
        }
    }
}

impl fmt::Display for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SortKey {
    type Err = ScoutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "price_asc" => Ok(Self::PriceAsc),
            "price_desc" => Ok(Self::PriceDesc),
            "newest" => Ok(Self::Newest),
            "relevance" => Ok(Self::Relevance),
            other => Err(ScoutError::validation(format!("unknown sort key `{other}`"))),
        }
    }
}

/// Marketplace-agnostic search input.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SearchQuery {
    pub text: String,
    #[serde(default)]
    pub min_price: Option<f64>,
    #[serde(default)]
    pub max_price: Option<f64>,
    #[serde(default)]
    pub brands: BTreeSet<String>,
    #[serde(default)]
    pub sizes: BTreeSet<String>,
    #[serde(default)]
    pub conditions: BTreeSet<String>,
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub sort: Option<SortKey>,
}

impl SearchQuery {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_price_range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.min_price = min;
        self.max_price = max;
        self
    }

    pub fn with_sort(mut self, sort: SortKey) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn with_page(mut self, page: u32, limit: u32) -> Self {
        self.page = Some(page);
        self.limit = Some(limit);
        self
    }

    pub fn with_brand(mut self, brand: impl Into<String>) -> Self {
        self.brands.insert(brand.into());
        self
    }

    pub fn with_size(mut self, size: impl Into<String>) -> Self {
        self.sizes.insert(size.into());
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.conditions.insert(condition.into());
        self
    }

    /// Pages are 1-based; absent or zero means the first page.
    pub fn page_or_default(&self) -> u32 {
        self.page.unwrap_or(1).max(1)
    }

    /// Zero-based index of the first result on the requested page.
    pub fn offset(&self, limit: u32) -> u32 {
        (self.page_or_default() - 1).saturating_mul(limit)
    }

    pub fn limit_or(&self, default: u32) -> u32 {
        self.limit.unwrap_or(default)
    }

    pub fn validate(&self) -> Result<(), ScoutError> {
        if self.text.trim().is_empty() {
            return Err(ScoutError::validation("query text must not be blank"));
        }
        for (name, bound) in [("min_price", self.min_price), ("max_price", self.max_price)] {
            if let Some(value) = bound {
                if !value.is_finite() || value < 0.0 {
                    return Err(ScoutError::validation(format!(
                        "{name} must be a non-negative number, got {value}"
                    )));
                }
            }
        }
        if let (Some(min), Some(max)) = (self.min_price, self.max_price) {
            if min > max {
                return Err(ScoutError::validation(format!(
                    "min_price {min} exceeds max_price {max}"
                )));
            }
        }
        if self.limit == Some(0) {
            return Err(ScoutError::validation("limit must be greater than zero"));
        }
        Ok(())
    }
}

/// Normalized listing returned by every provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub id: Uuid,
    pub title: String,
    pub price: f64,
    pub currency: String,
    pub brand: Option<String>,
    pub size: Option<String>,
    pub condition: Option<String>,
    pub url: String,
    pub image_url: Option<String>,
    pub provider: String,
    pub native_id: String,
    pub posted_at: Option<DateTime<Utc>>,
    /// Platform id of the seller, when the listing exposes one.
    #[serde(default)]
    pub seller_id: Option<String>,
}

impl SearchResult {
    /// Deterministic id for a provider + native id pair.
    pub fn result_id(provider: &str, native_id: &str) -> Uuid {
        Uuid::new_v5(
            &Uuid::NAMESPACE_URL,
            format!("{provider}:{native_id}").as_bytes(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SellerSummary {
    pub id: String,
    pub username: String,
    pub rating: Option<f64>,
    pub feedback_count: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemDetails {
    #[serde(flatten)]
    pub listing: SearchResult,
    pub description: String,
    pub seller: SellerSummary,
    pub images: Vec<String>,
    pub attributes: BTreeMap<String, String>,
}

/// Credential bundle for one provider.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AuthTokens {
    pub session_cookie: Option<String>,
    pub bearer_token: Option<String>,
    pub csrf_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl AuthTokens {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            bearer_token: Some(token.into()),
            ..Default::default()
        }
    }

    pub fn expiring_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// A bundle without an expiry never goes stale; otherwise the expiry must be strictly ahead of `now`.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |expires_at| expires_at > now)
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Pending,
    Success,
    Failure,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }

    pub fn from_success(success: bool) -> Self {
        if success {
            Self::Success
        } else {
            Self::Failure
        }
    }
}

impl FromStr for AttemptOutcome {
    type Err = ScoutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            other => Err(ScoutError::validation(format!("unknown attempt outcome `{other}`"))),
        }
    }
}

/// Where a challenge image came from and what it hashed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub reference: String,
    pub sha256: String,
    pub archived_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptchaAttempt {
    pub id: Uuid,
    pub challenge_image: ImageRef,
    pub piece_image: ImageRef,
    pub metadata: Option<JsonValue>,
    pub estimated_position: u32,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    pub actual_position: Option<u32>,
    pub validated_at: Option<DateTime<Utc>>,
}

impl CaptchaAttempt {
    pub fn is_terminal(&self) -> bool {
        self.outcome != AttemptOutcome::Pending
    }
}

/// Human correction as received from the application boundary; fields are optional so
/// missing input can be reported instead of rejected at deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ManualAnnotation {
    pub attempt_id: Option<Uuid>,
    pub gap_position: Option<i64>,
    pub annotated_by: Option<String>,
}

impl ManualAnnotation {
    pub fn new(attempt_id: Uuid, gap_position: i64, annotated_by: impl Into<String>) -> Self {
        Self {
            attempt_id: Some(attempt_id),
            gap_position: Some(gap_position),
            annotated_by: Some(annotated_by.into()),
        }
    }
}

pub const LABEL_ESTIMATE_CORRECT: &str = "estimate_correct";
pub const LABEL_ESTIMATE_INCORRECT: &str = "estimate_incorrect";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingData {
    pub attempt_id: Uuid,
    pub corrected_position: u32,
    pub annotated_by: String,
    pub estimated_position: u32,
    pub position_error: u32,
    pub estimate_was_correct: bool,
    pub label: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TrainingData {
    /// Builds a labeled row; `tolerance` is the largest pixel error still counted as correct.
    pub fn labeled(
        attempt: &CaptchaAttempt,
        corrected_position: u32,
        annotated_by: String,
        tolerance: u32,
        now: DateTime<Utc>,
    ) -> Self {
        let position_error = attempt.estimated_position.abs_diff(corrected_position);
        let estimate_was_correct = position_error <= tolerance;
        Self {
            attempt_id: attempt.id,
            corrected_position,
            annotated_by,
            estimated_position: attempt.estimated_position,
            position_error,
            estimate_was_correct,
            label: if estimate_was_correct {
                LABEL_ESTIMATE_CORRECT.to_string()
            } else {
                LABEL_ESTIMATE_INCORRECT.to_string()
            },
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TrainingStats {
    pub total_attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub pending: u64,
    pub manually_annotated: u64,
    pub success_ratio: f64,
    pub mean_position_error: Option<f64>,
}

impl TrainingStats {
    pub fn from_records(attempts: &[CaptchaAttempt], training: &[TrainingData]) -> Self {
        let mut stats = Self {
            total_attempts: attempts.len() as u64,
            manually_annotated: training.len() as u64,
            ..Default::default()
        };
        for attempt in attempts {
            match attempt.outcome {
                AttemptOutcome::Success => stats.successes += 1,
                AttemptOutcome::Failure => stats.failures += 1,
                AttemptOutcome::Pending => stats.pending += 1,
            }
        }
        if stats.total_attempts > 0 {
            stats.success_ratio = stats.successes as f64 / stats.total_attempts as f64;
        }
        if !training.is_empty() {
            let total_error: u64 = training.iter().map(|t| u64::from(t.position_error)).sum();
            stats.mean_position_error = Some(total_error as f64 / training.len() as f64);
        }
        stats
    }
}

/// Stable in-place ranking of merged results.
///
/// `Newest` puts undated listings after every dated one; relevance (or no key) keeps
/// arrival order untouched.
pub fn sort_results(results: &mut [SearchResult], sort: Option<SortKey>) {
    match sort {
        Some(SortKey::PriceAsc) => results.sort_by(|a, b| a.price.total_cmp(&b.price)),
        Some(SortKey::PriceDesc) => results.sort_by(|a, b| b.price.total_cmp(&a.price)),
        Some(SortKey::Newest) => results.sort_by(|a, b| match (a.posted_at, b.posted_at) {
            (Some(x), Some(y)) => y.cmp(&x),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }),
        Some(SortKey::Relevance) | None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn listing(provider: &str, native_id: &str, price: f64) -> SearchResult {
        SearchResult {
            id: SearchResult::result_id(provider, native_id),
            title: format!("item {native_id}"),
            price,
            currency: "EUR".into(),
            brand: None,
            size: None,
            condition: None,
            url: format!("https://{provider}.test/items/{native_id}"),
            image_url: None,
            provider: provider.into(),
            native_id: native_id.into(),
            posted_at: None,
            seller_id: None,
        }
    }

    fn prices(results: &[SearchResult]) -> Vec<f64> {
        results.iter().map(|r| r.price).collect()
    }

    fn attempt_with(outcome: AttemptOutcome, estimated_position: u32) -> CaptchaAttempt {
        let image = ImageRef {
            reference: "mem://img".into(),
            sha256: "00".into(),
            archived_path: None,
        };
        CaptchaAttempt {
            id: Uuid::new_v4(),
            challenge_image: image.clone(),
            piece_image: image,
            metadata: None,
            estimated_position,
            confidence: 0.9,
            created_at: Utc::now(),
            outcome,
            actual_position: None,
            validated_at: None,
        }
    }

    #[test]
    fn price_sorting_in_both_directions() {
        let mut results = vec![listing("a", "1", 30.0), listing("a", "2", 10.0), listing("b", "3", 20.0)];
        sort_results(&mut results, Some(SortKey::PriceAsc));
        assert_eq!(prices(&results), vec![10.0, 20.0, 30.0]);
        sort_results(&mut results, Some(SortKey::PriceDesc));
        assert_eq!(prices(&results), vec![30.0, 20.0, 10.0]);
    }

    #[test]
    fn equal_prices_keep_platform_order() {
        let mut results = vec![listing("vinted", "1", 5.0), listing("ebay", "1", 5.0), listing("vinted", "2", 1.0)];
        sort_results(&mut results, Some(SortKey::PriceAsc));
        let providers: Vec<_> = results.iter().map(|r| r.provider.as_str()).collect();
        assert_eq!(providers, vec!["vinted", "vinted", "ebay"]);
        assert_eq!(results[1].native_id, "1");
    }

    #[test]
    fn newest_puts_undated_listings_last() {
        let base = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().unwrap();
        let mut old = listing("a", "old", 1.0);
        old.posted_at = Some(base);
        let mut new = listing("a", "new", 1.0);
        new.posted_at = Some(base + Duration::days(2));
        let undated = listing("b", "undated", 1.0);

        let mut results = vec![undated, old, new];
        sort_results(&mut results, Some(SortKey::Newest));
        let ids: Vec<_> = results.iter().map(|r| r.native_id.as_str()).collect();
        assert_eq!(ids, vec!["new", "old", "undated"]);
    }

    #[test]
    fn relevance_keeps_arrival_order() {
        let mut results = vec![listing("a", "1", 30.0), listing("a", "2", 10.0)];
        sort_results(&mut results, Some(SortKey::Relevance));
        assert_eq!(prices(&results), vec![30.0, 10.0]);
        sort_results(&mut results, None);
        assert_eq!(prices(&results), vec![30.0, 10.0]);
    }

    #[test]
    fn query_validation_rejects_bad_bounds() {
        assert!(SearchQuery::new("nike air").validate().is_ok());
        assert!(matches!(
            SearchQuery::new("  ").validate(),
            Err(ScoutError::Validation(_))
        ));
        assert!(matches!(
            SearchQuery::new("x").with_price_range(Some(50.0), Some(10.0)).validate(),
            Err(ScoutError::Validation(_))
        ));
        assert!(matches!(
            SearchQuery::new("x").with_price_range(Some(-1.0), None).validate(),
            Err(ScoutError::Validation(_))
        ));
        assert!(matches!(
            SearchQuery::new("x").with_page(0, 0).validate(),
            Err(ScoutError::Validation(_))
        ));
    }

    #[test]
    fn pages_are_one_based() {
        assert_eq!(SearchQuery::new("x").page_or_default(), 1);
        assert_eq!(SearchQuery::new("x").with_page(0, 10).page_or_default(), 1);
        assert_eq!(SearchQuery::new("x").with_page(3, 20).offset(20), 40);
        assert_eq!(SearchQuery::new("x").offset(50), 0);
    }

    #[test]
    fn sort_key_parses_wire_names() {
        assert_eq!("price_desc".parse::<SortKey>().unwrap(), SortKey::PriceDesc);
        assert_eq!(" Newest ".parse::<SortKey>().unwrap(), SortKey::Newest);
        assert!("cheapest".parse::<SortKey>().is_err());
        let json = serde_json::to_string(&SortKey::PriceAsc).unwrap();
        assert_eq!(json, "\"price_asc\"");
    }

    #[test]
    fn token_validity_follows_expiry() {
        let now = Utc::now();
        assert!(AuthTokens::bearer("t").is_valid_at(now));
        assert!(AuthTokens::bearer("t").expiring_at(now + Duration::minutes(5)).is_valid_at(now));
        assert!(!AuthTokens::bearer("t").expiring_at(now).is_valid_at(now));
        assert!(!AuthTokens::bearer("t").expiring_at(now - Duration::seconds(1)).is_valid_at(now));
    }

    #[test]
    fn result_ids_are_scoped_by_provider() {
        assert_eq!(SearchResult::result_id("vinted", "42"), SearchResult::result_id("vinted", "42"));
        assert_ne!(SearchResult::result_id("vinted", "42"), SearchResult::result_id("ebay", "42"));
    }

    #[test]
    fn stats_ratio_counts_every_attempt() {
        let attempts = vec![
            attempt_with(AttemptOutcome::Success, 10),
            attempt_with(AttemptOutcome::Success, 20),
            attempt_with(AttemptOutcome::Failure, 30),
        ];
        let stats = TrainingStats::from_records(&attempts, &[]);
        assert_eq!(stats.total_attempts, 3);
        assert_eq!(stats.successes, 2);
        assert_eq!(stats.failures, 1);
        assert!((stats.success_ratio - 2.0 / 3.0).abs() < f64::EPSILON);
        assert_eq!(stats.mean_position_error, None);
    }

    #[test]
    fn stats_ratio_is_zero_without_attempts() {
        let stats = TrainingStats::from_records(&[], &[]);
        assert_eq!(stats.success_ratio, 0.0);
        assert_eq!(stats.total_attempts, 0);
    }

    #[test]
    fn training_label_uses_tolerance() {
        let attempt = attempt_with(AttemptOutcome::Failure, 100);
        let now = Utc::now();
        let close = TrainingData::labeled(&attempt, 103, "ana".into(), 5, now);
        assert!(close.estimate_was_correct);
        assert_eq!(close.label, LABEL_ESTIMATE_CORRECT);
        let far = TrainingData::labeled(&attempt, 80, "ana".into(), 5, now);
        assert_eq!(far.position_error, 20);
        assert_eq!(far.label, LABEL_ESTIMATE_INCORRECT);

        let stats = TrainingStats::from_records(&[attempt], &[close, far]);
        assert_eq!(stats.manually_annotated, 2);
        assert_eq!(stats.mean_position_error, Some(11.5));
    }

    #[test]
    fn aggregate_failure_lists_each_platform() {
        let err = ScoutError::AggregateFailure(vec![
            PlatformFailure {
                platform: "vinted".into(),
                error: ScoutError::unavailable("vinted", "timeout"),
            },
            PlatformFailure {
                platform: "ebay".into(),
                error: ScoutError::UnknownProvider("ebay".into()),
            },
        ]);
        let text = err.to_string();
        assert!(text.starts_with("all 2 platforms failed"));
        assert!(text.contains("vinted: provider vinted unavailable: timeout"));
        assert!(text.contains("ebay: unknown provider: ebay"));
        assert_eq!(err.kind(), "aggregate_failure");
    }
}
