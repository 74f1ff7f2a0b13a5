use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use scout_core::{
    AuthTokens, ItemDetails, ScoutError, SearchQuery, SearchResult, SellerSummary, SortKey,
};
use scout_storage::HttpRequest;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tracing::debug;

use crate::challenge::fetch_through_challenge;
use crate::normalize::{apply_filters, brand_from_title, normalize_query_text};
use crate::{
    check_reachable, cookie_header, parse_json, send_authorized, settle_authentication,
    text_or_none, MarketplaceProvider, ProviderContext, WireAmount,
};

pub const LEBONCOIN_TAG: &str = "leboncoin";

const DEFAULT_BASE_URL: &str = "https://api.leboncoin.fr";
const DEFAULT_LIMIT: u32 = 35;
const ANTI_BOT_COOKIE: &str = "datadome";
const PUBLICATION_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const SIZE_KEYS: &[&str] = &["shoe_size", "clothing_size", "size"];
const CONDITION_KEYS: &[&str] = &["item_condition", "condition"];

#[derive(Debug, Deserialize)]
struct Attribute {
    key: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    value_label: Option<String>,
}

impl Attribute {
    fn label(&self) -> Option<String> {
        text_or_none(self.value_label.clone()).or_else(|| text_or_none(self.value.clone()))
    }
}

#[derive(Debug, Default, Deserialize)]
struct Images {
    #[serde(default)]
    thumb_url: Option<String>,
    #[serde(default)]
    urls: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Owner {
    user_id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct Ad {
    list_id: u64,
    subject: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    price: Vec<WireAmount>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    first_publication_date: Option<String>,
    #[serde(default)]
    images: Images,
    #[serde(default)]
    attributes: Vec<Attribute>,
    #[serde(default)]
    owner: Option<Owner>,
}

impl Ad {
    fn attribute(&self, keys: &[&str]) -> Option<String> {
        keys.iter().find_map(|key| {
            self.attributes
                .iter()
                .find(|a| a.key == *key)
                .and_then(Attribute::label)
        })
    }
}

#[derive(Debug, Deserialize)]
struct FinderPage {
    #[serde(default)]
    ads: Vec<Ad>,
}

fn sort_fields(sort: Option<SortKey>) -> (&'static str, &'static str) {
    match sort {
        Some(SortKey::PriceAsc) => ("price", "asc"),
        Some(SortKey::PriceDesc) => ("price", "desc"),
        Some(SortKey::Newest) => ("time", "desc"),
        Some(SortKey::Relevance) | None => ("relevance", "desc"),
    }
}

/// Publication dates come as naive `YYYY-MM-DD HH:MM:SS` strings in UTC.
fn parse_publication_date(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw.trim(), PUBLICATION_DATE_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// French classifieds site. Its finder API sits behind an anti-bot cookie that the
/// homepage hands out, sometimes only after a slider challenge.
pub struct LeboncoinProvider {
    ctx: ProviderContext,
    base_url: String,
    api_key: Option<String>,
}

impl LeboncoinProvider {
    pub fn new(ctx: ProviderContext) -> Self {
        let settings = ctx.settings(LEBONCOIN_TAG);
        Self {
            base_url: settings.base_url_or(DEFAULT_BASE_URL),
            api_key: text_or_none(settings.api_key),
            ctx,
        }
    }

    fn authorize(&self, request: HttpRequest, tokens: &AuthTokens) -> HttpRequest {
        let mut request = request.header("Accept", "application/json");
        if let Some(key) = &self.api_key {
            request = request.header("api_key", key.clone());
        }
        if let Some(cookie) = &tokens.session_cookie {
            request = request.header("Cookie", cookie.clone());
        }
        request
    }

    fn finder_body(query: &SearchQuery) -> JsonValue {
        let limit = query.limit_or(DEFAULT_LIMIT);
        let (sort_by, sort_order) = sort_fields(query.sort);
        let mut filters = json!({
            "keywords": { "text": normalize_query_text(&query.text) },
        });
        if query.min_price.is_some() || query.max_price.is_some() {
            let mut price = serde_json::Map::new();
            if let Some(min) = query.min_price {
                price.insert("min".to_string(), json!(min));
            }
            if let Some(max) = query.max_price {
                price.insert("max".to_string(), json!(max));
            }
            filters["ranges"] = json!({ "price": price });
        }
        json!({
            "filters": filters,
            "limit": limit,
            "offset": query.offset(limit),
            "sort_by": sort_by,
            "sort_order": sort_order,
        })
    }

    async fn login(&self) -> Result<AuthTokens, ScoutError> {
        let homepage = HttpRequest::get(format!("{}/", self.base_url)).header("Accept", "text/html");
        let (_, cookies) = fetch_through_challenge(&self.ctx, LEBONCOIN_TAG, homepage).await?;
        if !cookies.iter().any(|(name, _)| name == ANTI_BOT_COOKIE) {
            return Err(ScoutError::authentication(
                LEBONCOIN_TAG,
                "homepage did not set the datadome cookie",
            ));
        }
        Ok(AuthTokens {
            session_cookie: Some(cookie_header(&cookies)),
            ..Default::default()
        })
    }

    fn to_result(&self, ad: &Ad) -> Option<SearchResult> {
        let Some(price) = ad.price.first().and_then(WireAmount::value) else {
            debug!(list_id = ad.list_id, "skipping ad without a readable price");
            return None;
        };
        let native_id = ad.list_id.to_string();
        let brand = ad
            .attribute(&["brand"])
            .or_else(|| brand_from_title(&ad.subject));
        let image_url = text_or_none(ad.images.thumb_url.clone())
            .or_else(|| ad.images.urls.first().cloned());
        Some(SearchResult {
            id: SearchResult::result_id(LEBONCOIN_TAG, &native_id),
            title: ad.subject.clone(),
            price,
            currency: "EUR".to_string(),
            brand,
            size: ad.attribute(SIZE_KEYS),
            condition: ad.attribute(CONDITION_KEYS),
            url: text_or_none(ad.url.clone())
                .unwrap_or_else(|| format!("https://www.leboncoin.fr/ad/{native_id}")),
            image_url,
            provider: LEBONCOIN_TAG.to_string(),
            native_id,
            posted_at: ad
                .first_publication_date
                .as_deref()
                .and_then(parse_publication_date),
            seller_id: ad.owner.as_ref().map(|owner| owner.user_id.clone()),
        })
    }
}

#[async_trait]
impl MarketplaceProvider for LeboncoinProvider {
    fn tag(&self) -> &str {
        LEBONCOIN_TAG
    }

    async fn authenticate(&self) -> Result<AuthTokens, ScoutError> {
        settle_authentication(&self.ctx, LEBONCOIN_TAG, self.login().await).await
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchResult>, ScoutError> {
        query.validate()?;
        let url = format!("{}/finder/search", self.base_url);
        let body = Self::finder_body(query);
        let response = send_authorized(self, &self.ctx, |tokens| {
            self.authorize(HttpRequest::post(url.clone()).json(body.clone()), tokens)
        })
        .await?;
        let page: FinderPage = parse_json(LEBONCOIN_TAG, &response)?;
        let results = page
            .ads
            .iter()
            .filter_map(|ad| self.to_result(ad))
            .collect();
        Ok(apply_filters(query, results))
    }

    async fn get_item(&self, item_id: &str) -> Result<ItemDetails, ScoutError> {
        let item_id = item_id.trim();
        if item_id.is_empty() {
            return Err(ScoutError::validation("item id must not be blank"));
        }
        let url = format!("{}/finder/classified/{item_id}", self.base_url);
        let response = send_authorized(self, &self.ctx, |tokens| {
            self.authorize(HttpRequest::get(url.clone()), tokens)
        })
        .await?;
        let ad: Ad = parse_json(LEBONCOIN_TAG, &response)?;
        let listing = self.to_result(&ad).ok_or_else(|| {
            ScoutError::unavailable(LEBONCOIN_TAG, format!("ad {item_id} has no readable price"))
        })?;

        let attributes: BTreeMap<String, String> = ad
            .attributes
            .iter()
            .filter_map(|a| a.label().map(|label| (a.key.clone(), label)))
            .collect();
        let seller = ad
            .owner
            .map(|owner| SellerSummary {
                id: owner.user_id,
                username: owner.name,
                rating: None,
                feedback_count: None,
            })
            .unwrap_or_default();

        Ok(ItemDetails {
            listing,
            description: ad.body.unwrap_or_default(),
            seller,
            images: ad.images.urls,
            attributes,
        })
    }

    async fn is_available(&self) -> bool {
        check_reachable(&self.ctx, LEBONCOIN_TAG, &format!("{}/", self.base_url)).await
    }
}
