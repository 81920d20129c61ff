use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::execution::Side;
use crate::splitter::{Instrument, RetryPolicy, TradeSpec};

pub const BINANCE_API_KEY_ENV: &str = "BINANCE_API_KEY";
pub const BINANCE_API_SECRET_ENV: &str = "BINANCE_API_SECRET";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub instrument: InstrumentConfig,
    pub trade: TradeConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub run: RunConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeConfig {
    #[serde(default = "default_exchange_rest_url")]
    pub rest_url: String,
    #[serde(default = "default_exchange_recv_window_ms")]
    pub recv_window_ms: u64,
    #[serde(default = "default_exchange_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_exchange_rate_limit_per_s")]
    pub rate_limit_per_s: u32,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            rest_url: default_exchange_rest_url(),
            recv_window_ms: default_exchange_recv_window_ms(),
            timeout_ms: default_exchange_timeout_ms(),
            rate_limit_per_s: default_exchange_rate_limit_per_s(),
        }
    }
}

impl ExchangeConfig {
    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms.max(100)
    }

    /// The exchange refuses windows above one minute.
    pub fn recv_window_ms(&self) -> u64 {
        self.recv_window_ms.clamp(1, 60_000)
    }

    pub fn rate_limit_per_s(&self) -> u32 {
        self.rate_limit_per_s.max(1)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstrumentConfig {
    /// Exchange symbol such as `BTCUSDT`; when set, the base asset is what
    /// precedes `quote_asset` in it and `base_asset` is ignored.
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default = "default_base_asset")]
    pub base_asset: String,
    #[serde(default = "default_quote_asset")]
    pub quote_asset: String,
    #[serde(default = "default_price_decimals")]
    pub price_decimals: u32,
    #[serde(default = "default_qty_decimals")]
    pub qty_decimals: u32,
    #[serde(default)]
    pub fetch_filters: bool,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            symbol: None,
            base_asset: default_base_asset(),
            quote_asset: default_quote_asset(),
            price_decimals: default_price_decimals(),
            qty_decimals: default_qty_decimals(),
            fetch_filters: false,
        }
    }
}

impl InstrumentConfig {
    pub fn price_decimals(&self) -> u32 {
        self.price_decimals.min(12)
    }

    pub fn qty_decimals(&self) -> u32 {
        self.qty_decimals.min(12)
    }

    pub fn instrument(&self) -> Result<Instrument, ConfigError> {
        let instrument = match self.symbol.as_deref() {
            Some(symbol) => Instrument::from_symbol(symbol, &self.quote_asset).ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "instrument.symbol {symbol} does not end with quote asset {}",
                    self.quote_asset
                ))
            })?,
            None if self.base_asset.trim().is_empty() => {
                return Err(ConfigError::Invalid("instrument.base_asset is empty".into()));
            }
            None => Instrument::new(self.base_asset.trim(), self.quote_asset.trim()),
        };
        Ok(instrument.with_precision(self.price_decimals(), self.qty_decimals()))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TradeConfig {
    pub volume: f64,
    pub number: u32,
    #[serde(default)]
    pub amount_dif: f64,
    pub side: Side,
    pub price_min: f64,
    pub price_max: f64,
}

impl TradeConfig {
    pub fn to_spec(&self) -> TradeSpec {
        TradeSpec {
            volume: self.volume,
            number: self.number,
            amount_dif: self.amount_dif,
            side: self.side,
            price_min: self.price_min,
            price_max: self.price_max,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_probe_max_attempts")]
    pub probe_max_attempts: u32,
    #[serde(default = "default_probe_initial_backoff_ms")]
    pub probe_initial_backoff_ms: u64,
    #[serde(default = "default_probe_max_backoff_ms")]
    pub probe_max_backoff_ms: u64,
    #[serde(default = "default_cancel_max_attempts")]
    pub cancel_max_attempts: u32,
    #[serde(default = "default_cancel_initial_backoff_ms")]
    pub cancel_initial_backoff_ms: u64,
    #[serde(default = "default_cancel_max_backoff_ms")]
    pub cancel_max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            probe_max_attempts: default_probe_max_attempts(),
            probe_initial_backoff_ms: default_probe_initial_backoff_ms(),
            probe_max_backoff_ms: default_probe_max_backoff_ms(),
            cancel_max_attempts: default_cancel_max_attempts(),
            cancel_initial_backoff_ms: default_cancel_initial_backoff_ms(),
            cancel_max_backoff_ms: default_cancel_max_backoff_ms(),
        }
    }
}

impl RetryConfig {
    pub fn probe_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.probe_max_attempts,
            self.probe_initial_backoff_ms,
            self.probe_max_backoff_ms,
        )
    }

    pub fn cancel_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.cancel_max_attempts,
            self.cancel_initial_backoff_ms,
            self.cancel_max_backoff_ms,
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_cancel_before_run")]
    pub cancel_before_run: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            cancel_before_run: default_cancel_before_run(),
        }
    }
}

/// API key pair. Never printed: `Debug` redacts both halves.
#[derive(Clone)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = read_credential(BINANCE_API_KEY_ENV)?;
        let api_secret = read_credential(BINANCE_API_SECRET_ENV)?;
        Ok(Self {
            api_key,
            api_secret,
        })
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"<redacted>")
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

fn read_credential(var: &'static str) -> Result<String, ConfigError> {
    match std::env::var(var) {
        Ok(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
        _ => Err(ConfigError::MissingCredentials(var)),
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("missing required env var {0}")]
    MissingCredentials(&'static str),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl AppConfig {
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let cfg: Self = toml::from_str(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.instrument.quote_asset.trim().is_empty() {
            return Err(ConfigError::Invalid("instrument.quote_asset is empty".into()));
        }
        self.instrument.instrument()?;
        if !self.exchange.rest_url.starts_with("http") {
            return Err(ConfigError::Invalid(format!(
                "exchange.rest_url must be an http(s) url, got {}",
                self.exchange.rest_url
            )));
        }
        Ok(())
    }
}

fn default_exchange_rest_url() -> String {
    "https://testnet.binance.vision".to_string()
}

fn default_exchange_recv_window_ms() -> u64 {
    5_000
}

fn default_exchange_timeout_ms() -> u64 {
    5_000
}

fn default_exchange_rate_limit_per_s() -> u32 {
    8
}

fn default_base_asset() -> String {
    "BTC".to_string()
}

fn default_quote_asset() -> String {
    "USDT".to_string()
}

fn default_price_decimals() -> u32 {
    2
}

fn default_qty_decimals() -> u32 {
    6
}

fn default_probe_max_attempts() -> u32 {
    5
}

fn default_probe_initial_backoff_ms() -> u64 {
    250
}

fn default_probe_max_backoff_ms() -> u64 {
    4_000
}

fn default_cancel_max_attempts() -> u32 {
    3
}

fn default_cancel_initial_backoff_ms() -> u64 {
    250
}

fn default_cancel_max_backoff_ms() -> u64 {
    2_000
}

fn default_cancel_before_run() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::{AppConfig, ConfigError, Credentials};
    use crate::execution::Side;

    const MINIMAL: &str = r#"
        [trade]
        volume = 10000.0
        number = 4
        amount_dif = 50.0
        side = "BUY"
        price_min = 25200.0
        price_max = 25300.0
    "#;

    #[test]
    fn fills_defaults_for_missing_sections() {
        let cfg = AppConfig::from_toml_str(MINIMAL).expect("config should parse");
        assert_eq!(cfg.exchange.rest_url, "https://testnet.binance.vision");
        assert_eq!(cfg.exchange.recv_window_ms(), 5_000);
        assert_eq!(cfg.instrument.base_asset, "BTC");
        assert_eq!(cfg.instrument.quote_asset, "USDT");
        assert_eq!(cfg.instrument.price_decimals(), 2);
        assert_eq!(cfg.instrument.qty_decimals(), 6);
        assert_eq!(cfg.retry.probe_max_attempts, 5);
        assert!(cfg.run.cancel_before_run);

        let spec = cfg.trade.to_spec();
        assert_eq!(spec.side, Side::Buy);
        assert_eq!(spec.number, 4);
    }

    #[test]
    fn accepts_lowercase_side() {
        let raw = MINIMAL.replace("\"BUY\"", "\"sell\"");
        let cfg = AppConfig::from_toml_str(&raw).expect("config should parse");
        assert_eq!(cfg.trade.side, Side::Sell);
    }

    #[test]
    fn rejects_empty_quote_asset() {
        let raw = format!("[instrument]\nquote_asset = \"\"\n{MINIMAL}");
        let err = AppConfig::from_toml_str(&raw).expect_err("should reject");
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn builds_instrument_from_symbol_or_assets() {
        let cfg = AppConfig::from_toml_str(MINIMAL).expect("config should parse");
        let instrument = cfg.instrument.instrument().expect("instrument");
        assert_eq!(instrument.pair(), "BTCUSDT");
        assert_eq!(instrument.price_decimals, 2);
        assert_eq!(instrument.qty_decimals, 6);

        let raw = format!("[instrument]\nsymbol = \"ethusdt\"\nqty_decimals = 4\n{MINIMAL}");
        let cfg = AppConfig::from_toml_str(&raw).expect("config should parse");
        let instrument = cfg.instrument.instrument().expect("instrument");
        assert_eq!(instrument.base, "ETH");
        assert_eq!(instrument.quote, "USDT");
        assert_eq!(instrument.qty_decimals, 4);
    }

    #[test]
    fn rejects_symbol_without_quote_suffix() {
        let raw = format!("[instrument]\nsymbol = \"ETHBTC\"\n{MINIMAL}");
        let err = AppConfig::from_toml_str(&raw).expect_err("should reject");
        assert!(matches!(err, ConfigError::Invalid(ref msg) if msg.contains("ETHBTC")));

        let raw = format!("[instrument]\nbase_asset = \" \"\n{MINIMAL}");
        let err = AppConfig::from_toml_str(&raw).expect_err("should reject");
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn clamps_recv_window() {
        let raw = format!("[exchange]\nrecv_window_ms = 120000\n{MINIMAL}");
        let cfg = AppConfig::from_toml_str(&raw).expect("config should parse");
        assert_eq!(cfg.exchange.recv_window_ms(), 60_000);
    }

    #[test]
    fn credentials_debug_is_redacted() {
        let creds = Credentials::new("key-123", "secret-456");
        let rendered = format!("{creds:?}");
        assert!(!rendered.contains("key-123"));
        assert!(!rendered.contains("secret-456"));
    }

    #[test]
    fn ships_a_parseable_default_config() {
        let raw = include_str!("../../config/default.toml");
        let cfg = AppConfig::from_toml_str(raw).expect("default config should parse");
        assert_eq!(cfg.trade.number, 4);
        assert_eq!(cfg.retry.cancel_max_attempts, 3);
        let instrument = cfg.instrument.instrument().expect("instrument");
        assert_eq!(instrument.pair(), "BTCUSDT");
    }
}
