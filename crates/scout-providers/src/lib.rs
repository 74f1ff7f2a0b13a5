//! Marketplace provider contracts, the provider factory and the concrete platform adapters.

mod challenge;
mod config;
mod ebay;
mod leboncoin;
pub mod normalize;
mod vinted;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use scout_captcha::CaptchaSolver;
use scout_core::{AuthTokens, ItemDetails, ScoutError, SearchQuery, SearchResult};
use scout_storage::{FetchError, FetchedResponse, HttpRequest, HttpTransport, StatusCode, TokenStore};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info, warn};

pub use challenge::{clear_challenge, detect_challenge, fetch_through_challenge, CaptchaChallenge};
pub use config::{CaptchaPolicy, ProviderSettings, ProvidersConfig};
pub use ebay::{EbayProvider, EBAY_TAG};
pub use leboncoin::{LeboncoinProvider, LEBONCOIN_TAG};
pub use vinted::{VintedProvider, VINTED_TAG};

pub const CRATE_NAME: &str = "scout-providers";

/// Tags the default factory can construct.
pub const BUILTIN_TAGS: &[&str] = &[VINTED_TAG, EBAY_TAG, LEBONCOIN_TAG];

const REACHABILITY_TIMEOUT: Duration = Duration::from_secs(5);

/// One external marketplace behind a uniform search interface.
#[async_trait]
pub trait MarketplaceProvider: Send + Sync {
    fn tag(&self) -> &str;

    /// Establishes fresh credentials and stores them in the token store. A failure clears
    /// the stored bundle.
    async fn authenticate(&self) -> Result<AuthTokens, ScoutError>;

    async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchResult>, ScoutError>;

    async fn get_item(&self, item_id: &str) -> Result<ItemDetails, ScoutError>;

    /// Cheap reachability check; never fails.
    async fn is_available(&self) -> bool;
}

/// Shared collaborators handed to every provider the factory builds.
#[derive(Clone)]
pub struct ProviderContext {
    pub http: Arc<dyn HttpTransport>,
    pub tokens: Arc<dyn TokenStore>,
    pub solver: Option<Arc<CaptchaSolver>>,
    pub config: ProvidersConfig,
}

impl ProviderContext {
    pub fn new(http: Arc<dyn HttpTransport>, tokens: Arc<dyn TokenStore>) -> Self {
        Self {
            http,
            tokens,
            solver: None,
            config: ProvidersConfig::default(),
        }
    }

    pub fn with_solver(mut self, solver: Arc<CaptchaSolver>) -> Self {
        self.solver = Some(solver);
        self
    }

    pub fn with_config(mut self, config: ProvidersConfig) -> Self {
        self.config = config;
        self
    }

    pub fn settings(&self, tag: &str) -> ProviderSettings {
        self.config.settings(tag)
    }
}

pub type ProviderConstructor =
    Arc<dyn Fn(&ProviderContext) -> Arc<dyn MarketplaceProvider> + Send + Sync>;

pub fn normalize_tag(tag: &str) -> String {
    tag.trim().to_ascii_lowercase()
}

/// Lazily builds providers by tag and hands out one shared instance per tag.
pub struct ProviderFactory {
    context: ProviderContext,
    constructors: Mutex<BTreeMap<String, ProviderConstructor>>,
    instances: Mutex<HashMap<String, Arc<dyn MarketplaceProvider>>>,
}

impl ProviderFactory {
    /// Factory with the built-in marketplaces registered.
    pub fn new(context: ProviderContext) -> Self {
        let factory = Self::empty(context);
        factory.register(VINTED_TAG, |ctx| Arc::new(VintedProvider::new(ctx.clone())));
        factory.register(EBAY_TAG, |ctx| Arc::new(EbayProvider::new(ctx.clone())));
        factory.register(LEBONCOIN_TAG, |ctx| Arc::new(LeboncoinProvider::new(ctx.clone())));
        factory
    }

    pub fn empty(context: ProviderContext) -> Self {
        Self {
            context,
            constructors: Mutex::new(BTreeMap::new()),
            instances: Mutex::new(HashMap::new()),
        }
    }

    pub fn context(&self) -> &ProviderContext {
        &self.context
    }

    /// Adds or replaces the constructor for `tag`. A cached instance built by the old
    /// constructor is dropped.
    pub fn register<F>(&self, tag: &str, constructor: F)
    where
        F: Fn(&ProviderContext) -> Arc<dyn MarketplaceProvider> + Send + Sync + 'static,
    {
        let tag = normalize_tag(tag);
        self.constructors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tag.clone(), Arc::new(constructor));
        self.instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&tag);
    }

    pub fn known_tags(&self) -> Vec<String> {
        self.constructors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn get_provider(&self, tag: &str) -> Result<Arc<dyn MarketplaceProvider>, ScoutError> {
        let key = normalize_tag(tag);
        let mut instances = self.instances.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(provider) = instances.get(&key) {
            return Ok(Arc::clone(provider));
        }

        let constructor = self
            .constructors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned()
            .ok_or_else(|| ScoutError::UnknownProvider(tag.trim().to_string()))?;
        if !self.context.config.is_enabled(&key) {
            return Err(ScoutError::unavailable(&key, "disabled in configuration"));
        }

        let provider = constructor(&self.context);
        debug!(provider = %key, "provider constructed");
        instances.insert(key, Arc::clone(&provider));
        Ok(provider)
    }
}

pub(crate) fn transport_error(tag: &str, err: FetchError) -> ScoutError {
    if err.is_timeout() {
        ScoutError::unavailable(tag, "request timed out")
    } else {
        ScoutError::unavailable(tag, err.to_string())
    }
}

/// Maps a non-success response onto the error taxonomy.
pub fn check_status(tag: &str, response: FetchedResponse) -> Result<FetchedResponse, ScoutError> {
    let status = response.status;
    if status.is_success() {
        return Ok(response);
    }
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ScoutError::authentication(
            tag,
            format!("status {status} from {}", response.final_url),
        ),
        StatusCode::NOT_FOUND => ScoutError::NotFound(format!("{tag}: {}", response.final_url)),
        StatusCode::TOO_MANY_REQUESTS => ScoutError::RateLimit {
            provider: tag.to_string(),
            retry_after_secs: response
                .header_str("retry-after")
                .and_then(|v| v.trim().parse().ok()),
        },
        status if status.is_server_error() => ScoutError::unavailable(tag, format!("status {status}")),
        status => ScoutError::unavailable(
            tag,
            format!("unexpected status {status} from {}", response.final_url),
        ),
    })
}

fn is_rejection(status: StatusCode) -> bool {
    matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN)
}

pub(crate) fn parse_json<T: DeserializeOwned>(
    tag: &str,
    response: &FetchedResponse,
) -> Result<T, ScoutError> {
    response.json().map_err(|err| {
        ScoutError::unavailable(
            tag,
            format!("malformed response from {}: {err}", response.final_url),
        )
    })
}

/// Provider calls go out exactly once; the transport never resends them.
pub(crate) async fn send(
    ctx: &ProviderContext,
    tag: &str,
    request: &HttpRequest,
) -> Result<FetchedResponse, ScoutError> {
    ctx.http
        .execute(tag, &request.clone().no_retries())
        .await
        .map_err(|err| transport_error(tag, err))
}

pub(crate) async fn check_reachable(ctx: &ProviderContext, tag: &str, url: &str) -> bool {
    let request = HttpRequest::get(url).timeout(REACHABILITY_TIMEOUT).no_retries();
    match ctx.http.execute(tag, &request).await {
        Ok(response) => !response.status.is_server_error(),
        Err(err) => {
            debug!(provider = tag, error = %err, "availability check failed");
            false
        }
    }
}

/// Persists a successful login, or clears the provider's bundle. Outages and throttling
/// keep their kind; anything else the login step hit is an authentication failure.
pub(crate) async fn settle_authentication(
    ctx: &ProviderContext,
    tag: &str,
    outcome: Result<AuthTokens, ScoutError>,
) -> Result<AuthTokens, ScoutError> {
    match outcome {
        Ok(tokens) => {
            ctx.tokens.save_tokens(tag, tokens.clone()).await;
            info!(provider = tag, "authenticated");
            Ok(tokens)
        }
        Err(err) => {
            ctx.tokens.clear_tokens(tag).await;
            warn!(provider = tag, error = %err, kind = err.kind(), "authentication failed");
            Err(match err {
                err @ (ScoutError::Authentication { .. }
                | ScoutError::RateLimit { .. }
                | ScoutError::ProviderUnavailable { .. }) => err,
                other => ScoutError::authentication(tag, other.to_string()),
            })
        }
    }
}

async fn session_tokens<P>(provider: &P, ctx: &ProviderContext) -> Result<AuthTokens, ScoutError>
where
    P: MarketplaceProvider + ?Sized,
{
    match ctx.tokens.get_tokens(provider.tag()).await {
        Some(tokens) if tokens.is_valid() => Ok(tokens),
        _ => provider.authenticate().await,
    }
}

/// Sends a request built from the current tokens. A 401/403 clears the bundle,
/// re-authenticates once and retries once.
pub(crate) async fn send_authorized<P, B>(
    provider: &P,
    ctx: &ProviderContext,
    build: B,
) -> Result<FetchedResponse, ScoutError>
where
    P: MarketplaceProvider + ?Sized,
    B: Fn(&AuthTokens) -> HttpRequest + Send + Sync,
{
    let tag = provider.tag();
    let tokens = session_tokens(provider, ctx).await?;
    let response = send(ctx, tag, &build(&tokens)).await?;
    if !is_rejection(response.status) {
        return check_status(tag, response);
    }

    debug!(provider = tag, status = %response.status, "token rejected; re-authenticating");
    ctx.tokens.clear_tokens(tag).await;
    let tokens = provider.authenticate().await?;
    let response = send(ctx, tag, &build(&tokens)).await?;
    if is_rejection(response.status) {
        ctx.tokens.clear_tokens(tag).await;
        return Err(ScoutError::authentication(
            tag,
            format!("token rejected again after re-authentication ({})", response.status),
        ));
    }
    check_status(tag, response)
}

pub(crate) fn cookie_header(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Cookies set by `later` replace same-named cookies from `earlier`.
pub(crate) fn merge_cookies(
    earlier: Vec<(String, String)>,
    later: Vec<(String, String)>,
) -> Vec<(String, String)> {
    let mut merged: Vec<(String, String)> = earlier
        .into_iter()
        .filter(|(name, _)| !later.iter().any(|(n, _)| n == name))
        .collect();
    merged.extend(later);
    merged
}

pub(crate) fn text_or_none(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Prices arrive as numbers on some platforms and decimal strings on others.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum WireAmount {
    Number(f64),
    Text(String),
}

impl WireAmount {
    pub(crate) fn value(&self) -> Option<f64> {
        let value = match self {
            Self::Number(value) => Some(*value),
            Self::Text(text) => text.trim().replace(',', ".").parse().ok(),
        };
        value.filter(|value: &f64| value.is_finite() && *value >= 0.0)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use scout_captcha::{CaptchaSolver, GapEstimate, GapEstimator};
    use scout_core::ScoutError;
    use scout_storage::{
        CaptchaRepository, FetchError, FetchedResponse, HttpMethod, HttpRequest, HttpTransport,
        MemoryCaptchaRepository, MemoryTokenStore, StatusCode,
    };

    use crate::ProviderContext;

    type Route = (HttpMethod, String, VecDeque<FetchedResponse>);

    /// Replays canned responses keyed by method and URL; the last response of a route repeats.
    #[derive(Default)]
    pub struct ScriptedTransport {
        routes: Mutex<Vec<Route>>,
        requests: Mutex<Vec<HttpRequest>>,
    }

    impl ScriptedTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn on(&self, method: HttpMethod, url: &str, response: FetchedResponse) {
            let mut routes = self.routes.lock().unwrap();
            match routes.iter_mut().find(|(m, u, _)| *m == method && u == url) {
                Some((_, _, queue)) => queue.push_back(response),
                None => routes.push((method, url.to_string(), VecDeque::from([response]))),
            }
        }

        pub fn requests(&self) -> Vec<HttpRequest> {
            self.requests.lock().unwrap().clone()
        }

        pub fn requests_to(&self, url: &str) -> Vec<HttpRequest> {
            self.requests().into_iter().filter(|r| r.url == url).collect()
        }
    }

    #[async_trait]
    impl HttpTransport for ScriptedTransport {
        async fn execute(&self, _: &str, request: &HttpRequest) -> Result<FetchedResponse, FetchError> {
            self.requests.lock().unwrap().push(request.clone());
            let mut routes = self.routes.lock().unwrap();
            let queue = routes
                .iter_mut()
                .find(|(m, u, _)| *m == request.method && *u == request.url)
                .map(|(_, _, queue)| queue)
                .ok_or_else(|| FetchError::Transport(format!("no scripted response for {}", request.url)))?;
            let response = if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            };
            response.ok_or_else(|| FetchError::Transport(format!("empty script for {}", request.url)))
        }
    }

    pub struct FixedEstimator(GapEstimate);

    #[async_trait]
    impl GapEstimator for FixedEstimator {
        async fn estimate(&self, _: &[u8], _: &[u8]) -> Result<GapEstimate, ScoutError> {
            Ok(self.0)
        }
    }

    pub fn fixed_estimator(position: u32, confidence: f64) -> FixedEstimator {
        FixedEstimator(GapEstimate {
            position,
            confidence,
        })
    }

    pub fn context(
        transport: Arc<ScriptedTransport>,
        estimator: Option<FixedEstimator>,
    ) -> (ProviderContext, Arc<dyn CaptchaRepository>) {
        let repository: Arc<dyn CaptchaRepository> = Arc::new(MemoryCaptchaRepository::new());
        let mut ctx = ProviderContext::new(transport, Arc::new(MemoryTokenStore::new()));
        if let Some(estimator) = estimator {
            ctx = ctx.with_solver(Arc::new(CaptchaSolver::with_estimator(
                Arc::clone(&repository),
                Arc::new(estimator),
            )));
        }
        (ctx, repository)
    }

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    pub fn fixture(provider: &str, name: &str) -> Vec<u8> {
        let path = workspace_root().join("fixtures").join(provider).join(name);
        std::fs::read(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
    }

    pub fn ok(url: &str, body: Vec<u8>) -> FetchedResponse {
        FetchedResponse::new(StatusCode::OK, url, body)
    }

    pub fn status(url: &str, status: StatusCode) -> FetchedResponse {
        FetchedResponse::new(status, url, b"{}".to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{context, ScriptedTransport};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NamedProvider(String);

    #[async_trait]
    impl MarketplaceProvider for NamedProvider {
        fn tag(&self) -> &str {
            &self.0
        }

        async fn authenticate(&self) -> Result<AuthTokens, ScoutError> {
            Ok(AuthTokens::default())
        }

        async fn search(&self, _: &SearchQuery) -> Result<Vec<SearchResult>, ScoutError> {
            Ok(Vec::new())
        }

        async fn get_item(&self, item_id: &str) -> Result<ItemDetails, ScoutError> {
            Err(ScoutError::NotFound(item_id.to_string()))
        }

        async fn is_available(&self) -> bool {
            true
        }
    }

    fn factory() -> ProviderFactory {
        let (ctx, _) = context(Arc::new(ScriptedTransport::new()), None);
        ProviderFactory::new(ctx)
    }

    #[test]
    fn same_tag_yields_same_instance() {
        let factory = factory();
        let a = factory.get_provider("vinted").unwrap();
        let b = factory.get_provider(" Vinted ").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.tag(), VINTED_TAG);
        assert!(!Arc::ptr_eq(&a, &factory.get_provider("ebay").unwrap()));
    }

    #[test]
    fn unknown_tags_are_rejected() {
        let err = factory().get_provider("unknown-tag").err().unwrap();
        assert!(matches!(err, ScoutError::UnknownProvider(tag) if tag == "unknown-tag"));
    }

    #[test]
    fn builtin_tags_are_known() {
        assert_eq!(factory().known_tags(), vec!["ebay", "leboncoin", "vinted"]);
    }

    #[test]
    fn disabled_providers_are_unavailable() {
        let (ctx, _) = context(Arc::new(ScriptedTransport::new()), None);
        let config = ProvidersConfig::from_yaml_str("providers:\n  ebay:\n    enabled: false\n").unwrap();
        let factory = ProviderFactory::new(ctx.with_config(config));
        assert!(matches!(
            factory.get_provider("ebay").err().unwrap(),
            ScoutError::ProviderUnavailable { .. }
        ));
        assert!(factory.get_provider("vinted").is_ok());
    }

    #[test]
    fn concurrent_first_access_constructs_once() {
        let factory = Arc::new(ProviderFactory::empty(context(Arc::new(ScriptedTransport::new()), None).0));
        let built = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&built);
        factory.register("fake", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Arc::new(NamedProvider("fake".into()))
        });

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let factory = Arc::clone(&factory);
                std::thread::spawn(move || factory.get_provider("FAKE").unwrap())
            })
            .collect();
        let providers: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(built.load(Ordering::SeqCst), 1);
        assert!(providers.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[test]
    fn re_registering_replaces_the_cached_instance() {
        let factory = factory();
        let before = factory.get_provider("vinted").unwrap();
        factory.register("vinted", |_| Arc::new(NamedProvider("vinted-fake".into())));
        let after = factory.get_provider("vinted").unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(after.tag(), "vinted-fake");
    }

    #[test]
    fn status_mapping_follows_error_taxonomy() {
        let url = "https://x.test/api";
        let map = |status| check_status("vinted", testing::status(url, status)).err().unwrap();
        assert!(matches!(map(StatusCode::UNAUTHORIZED), ScoutError::Authentication { .. }));
        assert!(matches!(map(StatusCode::NOT_FOUND), ScoutError::NotFound(_)));
        assert!(matches!(map(StatusCode::BAD_GATEWAY), ScoutError::ProviderUnavailable { .. }));

        let limited = check_status(
            "vinted",
            testing::status(url, StatusCode::TOO_MANY_REQUESTS).with_header("retry-after", "30"),
        )
        .err()
        .unwrap();
        assert!(matches!(limited, ScoutError::RateLimit { retry_after_secs: Some(30), .. }));
        assert!(check_status("vinted", testing::ok(url, b"{}".to_vec())).is_ok());
    }

    #[test]
    fn wire_amounts_accept_numbers_and_decimal_strings() {
        let parse = |raw: &str| serde_json::from_str::<WireAmount>(raw).unwrap().value();
        assert_eq!(parse("12.5"), Some(12.5));
        assert_eq!(parse("\"12,50\""), Some(12.5));
        assert_eq!(parse("\"n/a\""), None);
        assert_eq!(parse("-3"), None);
    }

    #[test]
    fn later_cookies_override_earlier_ones() {
        let merged = merge_cookies(
            vec![("a".into(), "1".into()), ("b".into(), "1".into())],
            vec![("b".into(), "2".into())],
        );
        assert_eq!(cookie_header(&merged), "a=1; b=2");
    }
}
