use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use scout_core::{
    AuthTokens, ItemDetails, ScoutError, SearchQuery, SearchResult, SellerSummary, SortKey,
};
use scout_storage::{HttpRequest, StatusCode};
use serde::Deserialize;
use tracing::debug;

use crate::normalize::{apply_filters_keeping_unsized, brand_from_title, normalize_query_text};
use crate::{
    check_reachable, check_status, parse_json, send, send_authorized, settle_authentication,
    text_or_none, MarketplaceProvider, ProviderContext, WireAmount,
};

pub const EBAY_TAG: &str = "ebay";

const DEFAULT_BASE_URL: &str = "https://api.ebay.com";
const DEFAULT_MARKETPLACE: &str = "EBAY_FR";
const OAUTH_SCOPE: &str = "https://api.ebay.com/oauth/api_scope";
const DEFAULT_LIMIT: u32 = 50;
const MAX_LIMIT: u32 = 200;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct EbayPrice {
    value: WireAmount,
    currency: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EbayImage {
    image_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ItemSummary {
    item_id: String,
    title: String,
    price: Option<EbayPrice>,
    #[serde(default)]
    brand: Option<String>,
    #[serde(default)]
    condition: Option<String>,
    #[serde(default)]
    item_web_url: Option<String>,
    #[serde(default)]
    image: Option<EbayImage>,
    #[serde(default)]
    item_creation_date: Option<DateTime<Utc>>,
    /// Only some summaries carry aspects; the item endpoint always does.
    #[serde(default)]
    localized_aspects: Vec<Aspect>,
    #[serde(default)]
    seller: Option<EbaySeller>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchPage {
    #[serde(default)]
    item_summaries: Vec<ItemSummary>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EbaySeller {
    username: String,
    feedback_percentage: Option<WireAmount>,
    feedback_score: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct Aspect {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EbayItem {
    #[serde(flatten)]
    summary: ItemSummary,
    #[serde(default)]
    short_description: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    additional_images: Vec<EbayImage>,
}

fn sort_param(sort: SortKey) -> Option<&'static str> {
    match sort {
        SortKey::PriceAsc => Some("price"),
        SortKey::PriceDesc => Some("-price"),
        SortKey::Newest => Some("newlyListed"),
        SortKey::Relevance => None,
    }
}

/// Browse API `filter` expression for the price bounds, e.g. `price:[10..50],priceCurrency:EUR`.
fn price_filter(query: &SearchQuery, currency: &str) -> Option<String> {
    if query.min_price.is_none() && query.max_price.is_none() {
        return None;
    }
    let bound = |value: Option<f64>| value.map(|v| v.to_string()).unwrap_or_default();
    Some(format!(
        "price:[{}..{}],priceCurrency:{currency}",
        bound(query.min_price),
        bound(query.max_price)
    ))
}

fn currency_for(marketplace: &str) -> &'static str {
    match marketplace {
        "EBAY_US" => "USD",
        "EBAY_GB" => "GBP",
        "EBAY_CA" => "CAD",
        "EBAY_AU" => "AUD",
        _ => "EUR",
    }
}

fn size_from_aspects(aspects: &[Aspect]) -> Option<String> {
    aspects
        .iter()
        .find(|a| {
            let name = a.name.to_lowercase();
            name.contains("size") || name.contains("taille") || name.contains("pointure")
        })
        .and_then(|a| text_or_none(Some(a.value.clone())))
}

/// eBay Browse API with an application token from the client-credentials grant.
pub struct EbayProvider {
    ctx: ProviderContext,
    base_url: String,
    marketplace: String,
    client_id: Option<String>,
    client_secret: Option<String>,
}

impl EbayProvider {
    pub fn new(ctx: ProviderContext) -> Self {
        let settings = ctx.settings(EBAY_TAG);
        Self {
            base_url: settings.base_url_or(DEFAULT_BASE_URL),
            marketplace: text_or_none(settings.marketplace_id)
                .unwrap_or_else(|| DEFAULT_MARKETPLACE.to_string()),
            client_id: text_or_none(settings.client_id),
            client_secret: text_or_none(settings.client_secret),
            ctx,
        }
    }

    fn authorize(&self, request: HttpRequest, tokens: &AuthTokens) -> HttpRequest {
        let mut request = request
            .header("Accept", "application/json")
            .header("X-EBAY-C-MARKETPLACE-ID", self.marketplace.clone());
        if let Some(token) = &tokens.bearer_token {
            request = request.bearer(token.clone());
        }
        request
    }

    fn search_request(&self, query: &SearchQuery, tokens: &AuthTokens) -> HttpRequest {
        let limit = query.limit_or(DEFAULT_LIMIT).min(MAX_LIMIT);
        let mut request = HttpRequest::get(format!("{}/buy/browse/v1/item_summary/search", self.base_url))
            .query("q", normalize_query_text(&query.text))
            .query("limit", limit)
            .query("offset", query.offset(limit));
        if let Some(filter) = price_filter(query, currency_for(&self.marketplace)) {
            request = request.query("filter", filter);
        }
        if let Some(sort) = query.sort.and_then(sort_param) {
            request = request.query("sort", sort);
        }
        self.authorize(request, tokens)
    }

    async fn login(&self) -> Result<AuthTokens, ScoutError> {
        let (Some(client_id), Some(client_secret)) = (&self.client_id, &self.client_secret) else {
            return Err(ScoutError::authentication(
                EBAY_TAG,
                "client credentials are not configured",
            ));
        };
        let request = HttpRequest::post(format!("{}/identity/v1/oauth2/token", self.base_url))
            .basic_auth(client_id.clone(), client_secret.clone())
            .header("Accept", "application/json")
            .form(vec![
                ("grant_type".to_string(), "client_credentials".to_string()),
                ("scope".to_string(), OAUTH_SCOPE.to_string()),
            ]);
        let response = send(&self.ctx, EBAY_TAG, &request).await?;
        if response.status.is_client_error() && response.status != StatusCode::TOO_MANY_REQUESTS {
            return Err(ScoutError::authentication(
                EBAY_TAG,
                format!("client credentials rejected ({})", response.status),
            ));
        }
        let response = check_status(EBAY_TAG, response)?;
        let token: TokenResponse = parse_json(EBAY_TAG, &response)?;
        let mut tokens = AuthTokens::bearer(token.access_token);
        if let Some(seconds) = token.expires_in {
            tokens = tokens.expiring_at(Utc::now() + Duration::seconds(seconds));
        }
        Ok(tokens)
    }

    fn to_result(&self, item: ItemSummary) -> Option<SearchResult> {
        let Some(price) = item.price.as_ref().and_then(|p| p.value.value()) else {
            debug!(item_id = %item.item_id, "skipping listing without a readable price");
            return None;
        };
        let currency = item
            .price
            .and_then(|p| p.currency)
            .unwrap_or_else(|| currency_for(&self.marketplace).to_string());
        let brand = text_or_none(item.brand).or_else(|| brand_from_title(&item.title));
        let size = size_from_aspects(&item.localized_aspects);
        Some(SearchResult {
            id: SearchResult::result_id(EBAY_TAG, &item.item_id),
            url: text_or_none(item.item_web_url)
                .unwrap_or_else(|| format!("https://www.ebay.com/itm/{}", item.item_id)),
            title: item.title,
            price,
            currency,
            brand,
            size,
            condition: text_or_none(item.condition),
            image_url: item.image.map(|i| i.image_url),
            provider: EBAY_TAG.to_string(),
            native_id: item.item_id,
            posted_at: item.item_creation_date,
            seller_id: item.seller.map(|s| s.username),
        })
    }
}

#[async_trait]
impl MarketplaceProvider for EbayProvider {
    fn tag(&self) -> &str {
        EBAY_TAG
    }

    async fn authenticate(&self) -> Result<AuthTokens, ScoutError> {
        settle_authentication(&self.ctx, EBAY_TAG, self.login().await).await
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchResult>, ScoutError> {
        query.validate()?;
        let response =
            send_authorized(self, &self.ctx, |tokens| self.search_request(query, tokens)).await?;
        let page: SearchPage = parse_json(EBAY_TAG, &response)?;
        let results = page
            .item_summaries
            .into_iter()
            .filter_map(|item| self.to_result(item))
            .collect();
        Ok(apply_filters_keeping_unsized(query, results))
    }

    async fn get_item(&self, item_id: &str) -> Result<ItemDetails, ScoutError> {
        let item_id = item_id.trim();
        if item_id.is_empty() {
            return Err(ScoutError::validation("item id must not be blank"));
        }
        let url = format!("{}/buy/browse/v1/item/{item_id}", self.base_url);
        let response = send_authorized(self, &self.ctx, |tokens| {
            self.authorize(HttpRequest::get(url.clone()), tokens)
        })
        .await?;
        let item: EbayItem = parse_json(EBAY_TAG, &response)?;

        let attributes: BTreeMap<String, String> = item
            .summary
            .localized_aspects
            .iter()
            .map(|a| (a.name.clone(), a.value.clone()))
            .collect();
        let mut images: Vec<String> = item
            .summary
            .image
            .as_ref()
            .map(|i| i.image_url.clone())
            .into_iter()
            .collect();
        images.extend(item.additional_images.into_iter().map(|i| i.image_url));
        let seller = item
            .summary
            .seller
            .as_ref()
            .map(|s| SellerSummary {
                id: s.username.clone(),
                username: s.username.clone(),
                rating: s
                    .feedback_percentage
                    .as_ref()
                    .and_then(WireAmount::value)
                    .map(|percent| percent / 100.0),
                feedback_count: s.feedback_score,
            })
            .unwrap_or_default();
        let description = text_or_none(item.short_description)
            .or_else(|| text_or_none(item.description))
            .unwrap_or_default();
        let listing = self.to_result(item.summary).ok_or_else(|| {
            ScoutError::unavailable(EBAY_TAG, format!("item {item_id} has no readable price"))
        })?;

        Ok(ItemDetails {
            listing,
            description,
            seller,
            images,
            attributes,
        })
    }

    async fn is_available(&self) -> bool {
        check_reachable(
            &self.ctx,
            EBAY_TAG,
            &format!("{}/buy/browse/v1/item_summary/search", self.base_url),
        )
        .await
    }
}
