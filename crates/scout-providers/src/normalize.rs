//! Brand-name normalization and the client-side filters every provider applies.

use scout_core::{SearchQuery, SearchResult};
use strsim::jaro_winkler;

/// Frequent misspellings seen in marketplace search boxes.
const BRAND_TYPOS: &[(&str, &str)] = &[
    ("nik", "nike"),
    ("nikey", "nike"),
    ("addidas", "adidas"),
    ("adiddas", "adidas"),
    ("pumaa", "puma"),
    ("zaraa", "zara"),
    ("levis", "levi's"),
];

const KNOWN_BRANDS: &[&str] = &[
    "adidas",
    "asics",
    "carhartt",
    "converse",
    "h&m",
    "lacoste",
    "levi's",
    "new balance",
    "nike",
    "puma",
    "ralph lauren",
    "reebok",
    "the north face",
    "tommy hilfiger",
    "vans",
    "zara",
];

const FUZZY_BRAND_THRESHOLD: f64 = 0.93;

fn fold(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Canonical lowercase brand name: typo table first, then the closest known brand when it is
/// similar enough, otherwise the folded input.
pub fn normalize_brand(raw: &str) -> String {
    let folded = fold(raw);
    if let Some((_, fixed)) = BRAND_TYPOS.iter().find(|(typo, _)| *typo == folded) {
        return (*fixed).to_string();
    }
    if KNOWN_BRANDS.contains(&folded.as_str()) {
        return folded;
    }
    KNOWN_BRANDS
        .iter()
        .map(|brand| (*brand, jaro_winkler(brand, &folded)))
        .filter(|(_, score)| *score >= FUZZY_BRAND_THRESHOLD)
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(brand, _)| brand.to_string())
        .unwrap_or(folded)
}

/// Fixes known brand typos word by word, leaving every other word as typed.
pub fn normalize_query_text(text: &str) -> String {
    text.split_whitespace()
        .map(|word| {
            let lower = word.to_lowercase();
            BRAND_TYPOS
                .iter()
                .find(|(typo, _)| *typo == lower)
                .map(|(_, fixed)| (*fixed).to_string())
                .unwrap_or_else(|| word.to_string())
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// First known brand appearing as whole words in a listing title.
pub fn brand_from_title(title: &str) -> Option<String> {
    let words: Vec<String> = title
        .split(|c: char| !(c.is_alphanumeric() || c == '\'' || c == '&'))
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect();
    let joined = format!(" {} ", words.join(" "));
    KNOWN_BRANDS
        .iter()
        .find(|brand| joined.contains(&format!(" {brand} ")))
        .map(|brand| brand.to_string())
}

/// Case, spacing and separator insensitive form of sizes and condition labels.
fn fold_label(label: &str) -> String {
    label
        .chars()
        .filter(|c| !matches!(c, ' ' | '_' | '-'))
        .flat_map(char::to_lowercase)
        .collect()
}

pub fn brand_matches(query: &SearchQuery, brand: Option<&str>) -> bool {
    if query.brands.is_empty() {
        return true;
    }
    let Some(brand) = brand else {
        return false;
    };
    let brand = normalize_brand(brand);
    query.brands.iter().any(|wanted| normalize_brand(wanted) == brand)
}

fn label_matches(wanted: &std::collections::BTreeSet<String>, value: Option<&str>) -> bool {
    if wanted.is_empty() {
        return true;
    }
    value.is_some_and(|value| {
        let value = fold_label(value);
        wanted.iter().any(|w| fold_label(w) == value)
    })
}

fn price_matches(query: &SearchQuery, price: f64) -> bool {
    query.min_price.map_or(true, |min| price >= min) && query.max_price.map_or(true, |max| price <= max)
}

pub fn matches_query(query: &SearchQuery, result: &SearchResult) -> bool {
    label_matches(&query.sizes, result.size.as_deref()) && matches_except_size(query, result)
}

fn matches_except_size(query: &SearchQuery, result: &SearchResult) -> bool {
    brand_matches(query, result.brand.as_deref())
        && label_matches(&query.conditions, result.condition.as_deref())
        && price_matches(query, result.price)
}

/// Drops results the platform returned that do not satisfy the query filters.
pub fn apply_filters(query: &SearchQuery, results: Vec<SearchResult>) -> Vec<SearchResult> {
    results
        .into_iter()
        .filter(|result| matches_query(query, result))
        .collect()
}

/// For platforms that only sometimes report a size: a listing without one passes the size
/// filter, a listing with a different one does not.
pub fn apply_filters_keeping_unsized(
    query: &SearchQuery,
    results: Vec<SearchResult>,
) -> Vec<SearchResult> {
    results
        .into_iter()
        .filter(|result| match result.size {
            Some(_) => matches_query(query, result),
            None => matches_except_size(query, result),
        })
        .collect()
}
