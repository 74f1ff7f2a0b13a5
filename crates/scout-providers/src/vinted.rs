use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scout_core::{
    AuthTokens, ItemDetails, ScoutError, SearchQuery, SearchResult, SellerSummary, SortKey,
};
use scout_storage::{FetchedResponse, HttpRequest};
use scraper::{Html, Selector};
use serde::Deserialize;
use tracing::debug;

use crate::challenge::fetch_through_challenge;
use crate::normalize::{apply_filters, brand_from_title, normalize_query_text};
use crate::{
    check_reachable, cookie_header, parse_json, send_authorized, settle_authentication,
    text_or_none, MarketplaceProvider, ProviderContext, WireAmount,
};

pub const VINTED_TAG: &str = "vinted";

const DEFAULT_BASE_URL: &str = "https://www.vinted.fr";
const DEFAULT_PER_PAGE: u32 = 96;
const ACCESS_TOKEN_COOKIE: &str = "access_token_web";

#[derive(Debug, Deserialize)]
struct CatalogPage {
    #[serde(default)]
    items: Vec<VintedItem>,
}

#[derive(Debug, Deserialize)]
struct VintedPrice {
    amount: WireAmount,
    currency_code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HighResolution {
    timestamp: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct VintedPhoto {
    url: Option<String>,
    high_resolution: Option<HighResolution>,
}

#[derive(Debug, Deserialize)]
struct VintedItem {
    id: u64,
    title: String,
    price: VintedPrice,
    #[serde(default)]
    brand_title: Option<String>,
    #[serde(default)]
    size_title: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    photo: Option<VintedPhoto>,
    #[serde(default)]
    user: Option<VintedUser>,
}

#[derive(Debug, Deserialize)]
struct VintedUser {
    id: u64,
    login: String,
    feedback_reputation: Option<f64>,
    feedback_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct PhotoUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct VintedItemDetail {
    #[serde(flatten)]
    summary: VintedItem,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    color1: Option<String>,
    #[serde(default)]
    photos: Vec<PhotoUrl>,
}

#[derive(Debug, Deserialize)]
struct ItemEnvelope {
    item: VintedItemDetail,
}

fn order_param(sort: SortKey) -> &'static str {
    match sort {
        SortKey::PriceAsc => "price_low_to_high",
        SortKey::PriceDesc => "price_high_to_low",
        SortKey::Newest => "newest_first",
        SortKey::Relevance => "relevance",
    }
}

fn csrf_from_html(html: &str) -> Option<String> {
    let selector = Selector::parse(r#"meta[name="csrf-token"]"#).ok()?;
    Html::parse_document(html)
        .select(&selector)
        .next()
        .and_then(|node| node.value().attr("content"))
        .and_then(|token| text_or_none(Some(token.to_string())))
}

/// Second-hand fashion marketplace; its web API accepts the token the homepage sets.
pub struct VintedProvider {
    ctx: ProviderContext,
    base_url: String,
    preset_token: Option<String>,
}

impl VintedProvider {
    pub fn new(ctx: ProviderContext) -> Self {
        let settings = ctx.settings(VINTED_TAG);
        Self {
            base_url: settings.base_url_or(DEFAULT_BASE_URL),
            preset_token: text_or_none(settings.access_token),
            ctx,
        }
    }

    fn authorize(&self, request: HttpRequest, tokens: &AuthTokens) -> HttpRequest {
        let mut request = request.header("Accept", "application/json");
        if let Some(token) = &tokens.bearer_token {
            request = request.bearer(token.clone());
        }
        if let Some(cookie) = &tokens.session_cookie {
            request = request.header("Cookie", cookie.clone());
        }
        if let Some(csrf) = &tokens.csrf_token {
            request = request.header("X-CSRF-Token", csrf.clone());
        }
        request
    }

    fn catalog_request(&self, query: &SearchQuery, tokens: &AuthTokens) -> HttpRequest {
        let mut request = HttpRequest::get(format!("{}/api/v2/catalog/items", self.base_url))
            .query("search_text", normalize_query_text(&query.text))
            .query("page", query.page_or_default())
            .query("per_page", query.limit_or(DEFAULT_PER_PAGE));
        if let Some(min) = query.min_price {
            request = request.query("price_from", min);
        }
        if let Some(max) = query.max_price {
            request = request.query("price_to", max);
        }
        if let Some(sort) = query.sort {
            request = request.query("order", order_param(sort));
        }
        self.authorize(request, tokens)
    }

    fn tokens_from_homepage(
        &self,
        response: &FetchedResponse,
        cookies: &[(String, String)],
    ) -> Result<AuthTokens, ScoutError> {
        let bearer = cookies
            .iter()
            .find(|(name, _)| name == ACCESS_TOKEN_COOKIE)
            .map(|(_, value)| value.clone())
            .ok_or_else(|| {
                ScoutError::authentication(VINTED_TAG, "homepage did not set access_token_web")
            })?;
        let session: Vec<(String, String)> = cookies
            .iter()
            .filter(|(name, _)| name != ACCESS_TOKEN_COOKIE)
            .cloned()
            .collect();
        Ok(AuthTokens {
            session_cookie: (!session.is_empty()).then(|| cookie_header(&session)),
            bearer_token: Some(bearer),
            csrf_token: csrf_from_html(&response.text()),
            expires_at: None,
        })
    }

    async fn login(&self) -> Result<AuthTokens, ScoutError> {
        if let Some(token) = &self.preset_token {
            return Ok(AuthTokens::bearer(token.clone()));
        }
        let homepage = HttpRequest::get(format!("{}/", self.base_url)).header("Accept", "text/html");
        let (response, cookies) = fetch_through_challenge(&self.ctx, VINTED_TAG, homepage).await?;
        self.tokens_from_homepage(&response, &cookies)
    }

    fn to_result(&self, item: VintedItem) -> Option<SearchResult> {
        let Some(price) = item.price.amount.value() else {
            debug!(item_id = item.id, "skipping listing without a readable price");
            return None;
        };
        let native_id = item.id.to_string();
        let brand = text_or_none(item.brand_title).or_else(|| brand_from_title(&item.title));
        let (image_url, posted_at) = match item.photo {
            Some(photo) => (
                text_or_none(photo.url),
                photo
                    .high_resolution
                    .and_then(|hr| hr.timestamp)
                    .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0)),
            ),
            None => (None, None),
        };
        Some(SearchResult {
            id: SearchResult::result_id(VINTED_TAG, &native_id),
            url: text_or_none(item.url)
                .unwrap_or_else(|| format!("{}/items/{native_id}", self.base_url)),
            title: item.title,
            price,
            currency: item.price.currency_code.unwrap_or_else(|| "EUR".to_string()),
            brand,
            size: text_or_none(item.size_title),
            condition: text_or_none(item.status),
            image_url,
            provider: VINTED_TAG.to_string(),
            native_id,
            posted_at,
            seller_id: item.user.map(|user| user.id.to_string()),
        })
    }
}

#[async_trait]
impl MarketplaceProvider for VintedProvider {
    fn tag(&self) -> &str {
        VINTED_TAG
    }

    async fn authenticate(&self) -> Result<AuthTokens, ScoutError> {
        settle_authentication(&self.ctx, VINTED_TAG, self.login().await).await
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchResult>, ScoutError> {
        query.validate()?;
        let response =
            send_authorized(self, &self.ctx, |tokens| self.catalog_request(query, tokens)).await?;
        let page: CatalogPage = parse_json(VINTED_TAG, &response)?;
        let results = page
            .items
            .into_iter()
            .filter_map(|item| self.to_result(item))
            .collect();
        Ok(apply_filters(query, results))
    }

    async fn get_item(&self, item_id: &str) -> Result<ItemDetails, ScoutError> {
        let item_id = item_id.trim();
        if item_id.is_empty() {
            return Err(ScoutError::validation("item id must not be blank"));
        }
        let url = format!("{}/api/v2/items/{item_id}", self.base_url);
        let response = send_authorized(self, &self.ctx, |tokens| {
            self.authorize(HttpRequest::get(url.clone()), tokens)
        })
        .await?;
        let envelope: ItemEnvelope = parse_json(VINTED_TAG, &response)?;
        let detail = envelope.item;

        let mut attributes = BTreeMap::new();
        for (key, value) in [
            ("brand", detail.summary.brand_title.clone()),
            ("size", detail.summary.size_title.clone()),
            ("condition", detail.summary.status.clone()),
            ("color", detail.color1.clone()),
        ] {
            if let Some(value) = text_or_none(value) {
                attributes.insert(key.to_string(), value);
            }
        }
        let images: Vec<String> = detail.photos.into_iter().map(|p| p.url).collect();
        let seller = detail
            .summary
            .user
            .as_ref()
            .map(|user| SellerSummary {
                id: user.id.to_string(),
                username: user.login.clone(),
                rating: user.feedback_reputation,
                feedback_count: user.feedback_count,
            })
            .unwrap_or_default();
        let listing = self.to_result(detail.summary).ok_or_else(|| {
            ScoutError::unavailable(VINTED_TAG, format!("item {item_id} has no readable price"))
        })?;

        Ok(ItemDetails {
            listing,
            description: detail.description.unwrap_or_default(),
            seller,
            images,
            attributes,
        })
    }

    async fn is_available(&self) -> bool {
        check_reachable(&self.ctx, VINTED_TAG, &format!("{}/", self.base_url)).await
    }
}
