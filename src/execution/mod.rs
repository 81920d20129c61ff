//! Authenticated access to the exchange's spot REST API.
//!
//! [`ExchangeGateway`] is the seam the order splitter talks to;
//! [`BinanceSpotGateway`] is the live implementation against the Binance
//! spot (testnet by default) REST endpoints.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Method;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::{Credentials, ExchangeConfig};
use crate::signing::{self, SignError};
use crate::util::{decimal_string, infer_decimal_scale, now_millis};

const MBX_API_KEY_HEADER: &str = "X-MBX-APIKEY";
const HTTP_POOL_MAX_IDLE_PER_HOST: usize = 8;
const HTTP_POOL_IDLE_TIMEOUT_SECS: u64 = 90;
const ERROR_BODY_SNIPPET_MAX_CHARS: usize = 300;
const REQUEST_DECIMALS: u32 = 8;

/// Exchange error code for "Unknown order sent", returned by the bulk cancel
/// endpoint when the symbol has nothing open.
pub const NO_OPEN_ORDERS_CODE: i64 = -2011;

/// Free quantity per asset.
pub type Balances = BTreeMap<String, f64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    #[serde(alias = "buy", alias = "Buy")]
    Buy,
    #[serde(alias = "sell", alias = "Sell")]
    Sell,
}

impl Side {
    pub fn as_binance(self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeInForce {
    Gtc,
}

impl TimeInForce {
    fn as_binance(self) -> &'static str {
        match self {
            Self::Gtc => "GTC",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LimitOrder {
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub price: f64,
    pub time_in_force: TimeInForce,
}

impl LimitOrder {
    pub fn gtc(symbol: impl Into<String>, side: Side, quantity: f64, price: f64) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            quantity,
            price,
            time_in_force: TimeInForce::Gtc,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderAck {
    pub order_id: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpenOrder {
    pub order_id: u64,
    pub side: String,
    pub price: f64,
    pub orig_qty: f64,
}

/// Tick, lot and minimum-notional rules the exchange enforces on a symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolFilters {
    pub tick_size: f64,
    pub step_size: f64,
    pub min_notional: Option<f64>,
}

impl SymbolFilters {
    pub fn price_decimals(&self) -> u32 {
        infer_decimal_scale(self.tick_size)
    }

    pub fn qty_decimals(&self) -> u32 {
        infer_decimal_scale(self.step_size)
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("http request error on {path}: {source}")]
    Http {
        #[source]
        source: Box<reqwest::Error>,
        path: String,
        body_snippet: Option<String>,
    },
    #[error("json parse error: {0}")]
    Json(#[source] Box<serde_json::Error>),
    #[error("signature error: {0}")]
    Signature(#[from] SignError),
    #[error("binance api error (status={status}, code={code:?}): {msg}")]
    Api {
        status: u16,
        code: Option<i64>,
        msg: String,
        path: String,
        body_snippet: String,
    },
    #[error("binance rate limit: {0}")]
    RateLimited(String),
    #[error("invalid balance for asset {asset}: {value}")]
    BalanceParse { asset: String, value: String },
    #[error("exchange info missing symbol {0}")]
    ExchangeInfoSymbolMissing(String),
    #[error("exchange info missing filter {filter} for symbol {symbol}")]
    ExchangeInfoFilterMissing {
        symbol: String,
        filter: &'static str,
    },
    #[error("invalid exchange info filter value for symbol {symbol}: {field}={value}")]
    InvalidExchangeInfoFilter {
        symbol: String,
        field: &'static str,
        value: String,
    },
}

impl GatewayError {
    pub fn api_code(&self) -> Option<i64> {
        match self {
            Self::Api { code, .. } => *code,
            _ => None,
        }
    }

    /// Exchange response body (or transport message) kept for diagnostics.
    pub fn body_snippet(&self) -> Option<&str> {
        match self {
            Self::Api { body_snippet, .. } => Some(body_snippet),
            Self::Http { body_snippet, .. } => body_snippet.as_deref(),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(error: serde_json::Error) -> Self {
        Self::Json(Box::new(error))
    }
}

/// The four account operations an execution run needs.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    async fn account_balances(&self) -> Result<Balances, GatewayError>;

    /// Free quantity of `asset`, `None` when the account has no such entry.
    async fn free_balance(&self, asset: &str) -> Result<Option<f64>, GatewayError> {
        let balances = self.account_balances().await?;
        Ok(balances.get(asset).copied())
    }

    async fn open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, GatewayError>;

    /// Cancels every open order on `symbol` and returns how many were
    /// canceled. Nothing open is `Ok(0)`.
    async fn cancel_all_orders(&self, symbol: &str) -> Result<usize, GatewayError>;

    async fn place_limit_order(&self, order: &LimitOrder) -> Result<OrderAck, GatewayError>;
}

#[derive(Clone)]
pub struct BinanceSpotGateway {
    http: reqwest::Client,
    credentials: Credentials,
    rest_url: String,
    recv_window_ms: u64,
    rate_limiter: Arc<Mutex<SimpleRateLimiter>>,
}

impl BinanceSpotGateway {
    pub fn new(cfg: &ExchangeConfig, credentials: Credentials) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms()))
            .connect_timeout(Duration::from_millis(cfg.timeout_ms().min(2_000)))
            .pool_max_idle_per_host(HTTP_POOL_MAX_IDLE_PER_HOST)
            .pool_idle_timeout(Some(Duration::from_secs(HTTP_POOL_IDLE_TIMEOUT_SECS)))
            .build()
            .map_err(|error| GatewayError::Http {
                source: Box::new(error),
                path: "<client>".to_string(),
                body_snippet: None,
            })?;

        Ok(Self {
            http,
            credentials,
            rest_url: cfg.rest_url.trim_end_matches('/').to_string(),
            recv_window_ms: cfg.recv_window_ms(),
            rate_limiter: Arc::new(Mutex::new(SimpleRateLimiter::new(cfg.rate_limit_per_s()))),
        })
    }

    pub async fn fetch_symbol_filters(&self, symbol: &str) -> Result<SymbolFilters, GatewayError> {
        let path = "/api/v3/exchangeInfo";
        let symbol = symbol.to_uppercase();
        let response = self
            .send_public_get(path, vec![("symbol", symbol.clone())])
            .await?;
        let payload: BinanceExchangeInfoResponse = decode(response, path).await?;
        filters_from_exchange_info(&symbol, payload)
    }

    async fn send_public_get(
        &self,
        path: &str,
        params: Vec<(&str, String)>,
    ) -> Result<reqwest::Response, GatewayError> {
        let query = signing::canonical_query(&params)?;
        let url = build_url_with_query(&self.rest_url, path, &query);
        self.wait_rate_limit().await;

        let response = self.http.get(url).send().await;
        self.check_response(path, response).await
    }

    async fn send_signed(
        &self,
        method: Method,
        path: &str,
        params: Vec<(&str, String)>,
    ) -> Result<reqwest::Response, GatewayError> {
        let params = with_auth_params(params, now_millis(), self.recv_window_ms);
        let query = signing::signed_query(&params, self.credentials.api_secret.as_bytes())?;
        let url = build_url_with_query(&self.rest_url, path, &query);
        self.wait_rate_limit().await;

        let started = Instant::now();
        let response = self
            .http
            .request(method.clone(), url)
            .header(MBX_API_KEY_HEADER, &self.credentials.api_key)
            .send()
            .await;
        debug!(
            %method,
            path,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "rest request sent"
        );
        self.check_response(path, response).await
    }

    async fn check_response(
        &self,
        path: &str,
        response: Result<reqwest::Response, reqwest::Error>,
    ) -> Result<reqwest::Response, GatewayError> {
        match response {
            Ok(response) if response.status().is_success() => Ok(response),
            Ok(response) => {
                let status = response.status().as_u16();
                let error = parse_api_error(response, path).await;
                let code = error.api_code();
                // The bulk cancel's "nothing open" answer is expected.
                if code != Some(NO_OPEN_ORDERS_CODE) {
                    log_rest_http_error(path, Some(status), code, error.body_snippet());
                }
                Err(error)
            }
            Err(error) => {
                let snippet = body_snippet(&error.to_string());
                log_rest_http_error(path, None, None, Some(&snippet));
                Err(GatewayError::Http {
                    source: Box::new(error),
                    path: path.to_string(),
                    body_snippet: Some(snippet),
                })
            }
        }
    }

    async fn wait_rate_limit(&self) {
        let sleep_for = {
            let mut limiter = self.rate_limiter.lock().await;
            limiter.reserve_delay()
        };

        if !sleep_for.is_zero() {
            sleep(sleep_for).await;
        }
    }
}

#[async_trait]
impl ExchangeGateway for BinanceSpotGateway {
    async fn account_balances(&self) -> Result<Balances, GatewayError> {
        let path = "/api/v3/account";
        let response = self.send_signed(Method::GET, path, Vec::new()).await?;
        let payload: BinanceAccountResponse = decode(response, path).await?;
        balances_from_account(payload)
    }

    async fn open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, GatewayError> {
        let path = "/api/v3/openOrders";
        let response = self
            .send_signed(Method::GET, path, symbol_params(symbol))
            .await?;
        let payload: Vec<BinanceOrderResponse> = decode(response, path).await?;
        Ok(payload.into_iter().map(open_order_from_response).collect())
    }

    async fn cancel_all_orders(&self, symbol: &str) -> Result<usize, GatewayError> {
        let path = "/api/v3/openOrders";
        match self
            .send_signed(Method::DELETE, path, symbol_params(symbol))
            .await
        {
            Ok(response) => {
                let canceled: Vec<serde_json::Value> = decode(response, path).await?;
                Ok(canceled.len())
            }
            Err(error) => treat_no_open_orders_as_success(error),
        }
    }

    async fn place_limit_order(&self, order: &LimitOrder) -> Result<OrderAck, GatewayError> {
        let path = "/api/v3/order";
        let response = self
            .send_signed(Method::POST, path, limit_order_params(order))
            .await?;
        let payload: BinanceOrderResponse = decode(response, path).await?;
        Ok(OrderAck {
            order_id: payload.order_id,
        })
    }
}

#[derive(Debug)]
struct SimpleRateLimiter {
    min_interval: Duration,
    next_allowed: Instant,
}

impl SimpleRateLimiter {
    fn new(rate_limit_per_s: u32) -> Self {
        let per_second = rate_limit_per_s.max(1) as f64;
        Self {
            min_interval: Duration::from_secs_f64(1.0 / per_second),
            next_allowed: Instant::now(),
        }
    }

    fn reserve_delay(&mut self) -> Duration {
        let now = Instant::now();
        let base = self.next_allowed.max(now);
        let delay = base - now;
        self.next_allowed = base + self.min_interval;
        delay
    }
}

#[derive(Debug, Deserialize)]
struct BinanceAccountResponse {
    balances: Vec<BinanceBalance>,
}

#[derive(Debug, Deserialize)]
struct BinanceBalance {
    asset: String,
    free: String,
}

#[derive(Debug, Deserialize)]
struct BinanceOrderResponse {
    #[serde(rename = "orderId")]
    order_id: u64,
    #[serde(default)]
    side: String,
    #[serde(default)]
    price: String,
    #[serde(rename = "origQty", default)]
    orig_qty: String,
}

#[derive(Debug, Deserialize)]
struct BinanceErrorResponse {
    code: Option<i64>,
    msg: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BinanceExchangeInfoResponse {
    symbols: Vec<BinanceExchangeInfoSymbol>,
}

#[derive(Debug, Deserialize)]
struct BinanceExchangeInfoSymbol {
    symbol: String,
    filters: Vec<BinanceExchangeFilter>,
}

#[derive(Debug, Deserialize)]
struct BinanceExchangeFilter {
    #[serde(rename = "filterType")]
    filter_type: String,
    #[serde(rename = "tickSize")]
    tick_size: Option<String>,
    #[serde(rename = "stepSize")]
    step_size: Option<String>,
    #[serde(rename = "minNotional")]
    min_notional: Option<String>,
}

async fn decode<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    path: &str,
) -> Result<T, GatewayError> {
    let body = response.text().await.map_err(|error| GatewayError::Http {
        source: Box::new(error),
        path: path.to_string(),
        body_snippet: None,
    })?;
    Ok(serde_json::from_str(&body)?)
}

fn balances_from_account(payload: BinanceAccountResponse) -> Result<Balances, GatewayError> {
    let mut balances = Balances::new();
    for entry in payload.balances {
        let free = entry
            .free
            .parse::<f64>()
            .ok()
            .filter(|value| value.is_finite() && *value >= 0.0)
            .ok_or_else(|| GatewayError::BalanceParse {
                asset: entry.asset.clone(),
                value: entry.free.clone(),
            })?;
        balances.insert(entry.asset, free);
    }
    Ok(balances)
}

fn open_order_from_response(payload: BinanceOrderResponse) -> OpenOrder {
    OpenOrder {
        order_id: payload.order_id,
        side: payload.side,
        price: parse_non_negative_decimal_or_zero(&payload.price),
        orig_qty: parse_non_negative_decimal_or_zero(&payload.orig_qty),
    }
}

fn symbol_params(symbol: &str) -> Vec<(&'static str, String)> {
    vec![("symbol", symbol.to_uppercase())]
}

/// Request parameters of a new limit order, in the order they are signed.
fn limit_order_params(order: &LimitOrder) -> Vec<(&'static str, String)> {
    vec![
        ("symbol", order.symbol.to_uppercase()),
        ("side", order.side.as_binance().to_string()),
        ("type", "LIMIT".to_string()),
        ("timeInForce", order.time_in_force.as_binance().to_string()),
        ("quantity", decimal_string(order.quantity, REQUEST_DECIMALS)),
        ("price", decimal_string(order.price, REQUEST_DECIMALS)),
    ]
}

/// Appends `timestamp` and `recvWindow`; the signature goes after them.
fn with_auth_params<'a>(
    mut params: Vec<(&'a str, String)>,
    timestamp_ms: u64,
    recv_window_ms: u64,
) -> Vec<(&'a str, String)> {
    params.push(("timestamp", timestamp_ms.to_string()));
    params.push(("recvWindow", recv_window_ms.to_string()));
    params
}

fn treat_no_open_orders_as_success(error: GatewayError) -> Result<usize, GatewayError> {
    if error.api_code() == Some(NO_OPEN_ORDERS_CODE) {
        debug!("no open orders to cancel");
        return Ok(0);
    }
    Err(error)
}

fn parse_non_negative_decimal_or_zero(raw: &str) -> f64 {
    raw.parse::<f64>()
        .ok()
        .filter(|value| value.is_finite() && *value >= 0.0)
        .unwrap_or(0.0)
}

fn build_url_with_query(base: &str, path: &str, query: &str) -> String {
    let extra = if query.is_empty() { 0 } else { 1 + query.len() };
    let mut url = String::with_capacity(base.len() + path.len() + extra);
    url.push_str(base);
    url.push_str(path);

    if !query.is_empty() {
        url.push('?');
        url.push_str(query);
    }
    url
}

fn filters_from_exchange_info(
    symbol: &str,
    payload: BinanceExchangeInfoResponse,
) -> Result<SymbolFilters, GatewayError> {
    let info = payload
        .symbols
        .into_iter()
        .find(|item| item.symbol.eq_ignore_ascii_case(symbol))
        .ok_or_else(|| GatewayError::ExchangeInfoSymbolMissing(symbol.to_string()))?;

    let mut tick_size = None;
    let mut step_size = None;
    let mut min_notional = None;
    for filter in info.filters {
        let (slot, field, raw, allow_zero) = match filter.filter_type.as_str() {
            "PRICE_FILTER" => (&mut tick_size, "tickSize", filter.tick_size, false),
            "LOT_SIZE" => (&mut step_size, "stepSize", filter.step_size, false),
            "MIN_NOTIONAL" | "NOTIONAL" => {
                (&mut min_notional, "minNotional", filter.min_notional, true)
            }
            _ => continue,
        };
        if let Some(raw) = raw {
            *slot = Some(parse_filter_number(symbol, field, &raw, allow_zero)?);
        }
    }

    let missing = |filter: &'static str| GatewayError::ExchangeInfoFilterMissing {
        symbol: symbol.to_string(),
        filter,
    };
    Ok(SymbolFilters {
        tick_size: tick_size.ok_or_else(|| missing("PRICE_FILTER.tickSize"))?,
        step_size: step_size.ok_or_else(|| missing("LOT_SIZE.stepSize"))?,
        min_notional: min_notional.filter(|value: &f64| *value > 0.0),
    })
}

fn parse_filter_number(
    symbol: &str,
    field: &'static str,
    raw: &str,
    allow_zero: bool,
) -> Result<f64, GatewayError> {
    match raw.parse::<f64>() {
        Ok(value) if value.is_finite() && (value > 0.0 || (allow_zero && value == 0.0)) => {
            Ok(value)
        }
        _ => Err(GatewayError::InvalidExchangeInfoFilter {
            symbol: symbol.to_string(),
            field,
            value: raw.to_string(),
        }),
    }
}

pub fn explicit_rest_error_reason(
    http_status: Option<u16>,
    binance_code: Option<i64>,
) -> Option<&'static str> {
    match (http_status, binance_code) {
        (_, Some(-1022)) => Some("invalid_signature"),
        (_, Some(-1021)) => Some("invalid_timestamp"),
        (_, Some(-2015)) => Some("invalid_api_key_or_permissions"),
        (_, Some(-2014)) => Some("invalid_api_key_format"),
        (_, Some(-2010)) => Some("new_order_rejected"),
        (_, Some(NO_OPEN_ORDERS_CODE)) => Some("unknown_order"),
        (Some(401), _) => Some("unauthorized"),
        (Some(403), _) => Some("forbidden"),
        (Some(429), _) | (Some(418), _) => Some("rate_limited"),
        _ => None,
    }
}

fn log_rest_http_error(
    path: &str,
    http_status: Option<u16>,
    binance_code: Option<i64>,
    body_snippet: Option<&str>,
) {
    let error_reason = explicit_rest_error_reason(http_status, binance_code);
    warn!(
        transport = "rest",
        path,
        http_status = ?http_status,
        binance_code = ?binance_code,
        error_reason = ?error_reason,
        last_error_body_snippet = ?body_snippet,
        "exchange rest request failed"
    );
}

fn body_snippet(body: &str) -> String {
    body.chars().take(ERROR_BODY_SNIPPET_MAX_CHARS).collect()
}

async fn parse_api_error(response: reqwest::Response, path: &str) -> GatewayError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    api_error_from_body(status.as_u16(), &body, path)
}

fn api_error_from_body(status: u16, body: &str, path: &str) -> GatewayError {
    let snippet = body_snippet(body);
    let (code, msg) = match serde_json::from_str::<BinanceErrorResponse>(body) {
        Ok(payload) => (
            payload.code,
            payload
                .msg
                .unwrap_or_else(|| "unknown binance api error".to_string()),
        ),
        Err(_) => (None, snippet.clone()),
    };

    if status == StatusCode::TOO_MANY_REQUESTS.as_u16() || code == Some(-1003) {
        return GatewayError::RateLimited(msg);
    }

    GatewayError::Api {
        status,
        code,
        msg,
        path: path.to_string(),
        body_snippet: snippet,
    }
}
