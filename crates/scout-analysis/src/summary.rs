use std::collections::{BTreeMap, BTreeSet};

use scout_core::SearchResult;
use scout_providers::normalize::normalize_brand;
use serde::{Deserialize, Serialize};

const UNSPECIFIED: &str = "unspecified";
const RECOMMENDED_PRICE_FACTOR: f64 = 0.95;

fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PriceStats {
    pub min: f64,
    pub max: f64,
    pub average: f64,
    pub median: f64,
}

impl PriceStats {
    /// `None` for an empty slice.
    pub fn from_prices(prices: &[f64]) -> Option<Self> {
        if prices.is_empty() {
            return None;
        }
        let mut sorted = prices.to_vec();
        sorted.sort_by(f64::total_cmp);
        let mid = sorted.len() / 2;
        let median = if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        };
        Some(Self {
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            average: round_cents(sorted.iter().sum::<f64>() / sorted.len() as f64),
            median,
        })
    }
}

/// Aggregate view over the merged listings of one analysis.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MarketSummary {
    pub items_found: usize,
    pub price: Option<PriceStats>,
    /// Average minus five percent, a starting point for pricing a comparable item.
    pub recommended_price: Option<f64>,
    pub brand_distribution: BTreeMap<String, usize>,
    pub condition_distribution: BTreeMap<String, usize>,
    pub provider_distribution: BTreeMap<String, usize>,
    /// Distinct sellers among listings that name one.
    pub sellers_count: usize,
    /// Percent change of the average price against the oldest recent analysis of the same
    /// search; 0 without enough history.
    pub price_trend_30d: f64,
}

impl MarketSummary {
    pub fn from_results(results: &[SearchResult]) -> Self {
        let prices: Vec<f64> = results.iter().map(|r| r.price).collect();
        let price = PriceStats::from_prices(&prices);
        let mut summary = Self {
            items_found: results.len(),
            recommended_price: price
                .as_ref()
                .map(|p| round_cents(p.average * RECOMMENDED_PRICE_FACTOR)),
            price,
            ..Default::default()
        };
        summary.sellers_count = results
            .iter()
            .filter_map(|r| r.seller_id.as_deref())
            .collect::<BTreeSet<_>>()
            .len();
        for result in results {
            let brand = result
                .brand
                .as_deref()
                .map(normalize_brand)
                .unwrap_or_else(|| UNSPECIFIED.to_string());
            *summary.brand_distribution.entry(brand).or_default() += 1;
            let condition = result
                .condition
                .clone()
                .unwrap_or_else(|| UNSPECIFIED.to_string());
            *summary.condition_distribution.entry(condition).or_default() += 1;
            *summary
                .provider_distribution
                .entry(result.provider.clone())
                .or_default() += 1;
        }
        summary
    }
}

/// `(current - oldest) / oldest * 100`, rounded to cents. `history` holds earlier averages,
/// newest first; fewer than two of them, or a non-positive oldest one, yields 0.
pub fn price_trend(current_average: Option<f64>, history: &[f64]) -> f64 {
    let (Some(current), [_, .., oldest]) = (current_average, history) else {
        return 0.0;
    };
    if *oldest <= 0.0 {
        return 0.0;
    }
    round_cents((current - oldest) / oldest * 100.0)
}
