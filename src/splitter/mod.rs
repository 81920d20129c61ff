//! Splits a target notional into randomized limit orders and places them one
//! at a time, cancelling everything on the symbol if a placement fails.
//!
//! A run is two phases. The attempt phase checks the balance, then for each
//! child order probes connectivity, draws jitter and price, and submits.
//! The compensation phase is a bulk cancel on the symbol; it runs whenever the
//! attempt phase stops early and is itself retried.

use std::fmt;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::execution::{ExchangeGateway, GatewayError, LimitOrder, Side, SymbolFilters};
use crate::util::{backoff_delay, round_to_scale, round_within};

#[derive(Debug, Error)]
pub enum SplitError {
    #[error("invalid trade spec: {0}")]
    InvalidSpec(String),
}

/// What to trade in one run. Amounts are in quote currency.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeSpec {
    pub volume: f64,
    pub number: u32,
    pub amount_dif: f64,
    pub side: Side,
    pub price_min: f64,
    pub price_max: f64,
}

impl TradeSpec {
    pub fn validate(&self) -> Result<(), SplitError> {
        let finite = [self.volume, self.amount_dif, self.price_min, self.price_max]
            .iter()
            .all(|value| value.is_finite());
        if !finite {
            return Err(SplitError::InvalidSpec("values must be finite".into()));
        }
        // Jitter and price are drawn across these widths.
        if !(2.0 * self.amount_dif).is_finite() || !(self.price_max - self.price_min).is_finite()
        {
            return Err(SplitError::InvalidSpec(format!(
                "amount_dif {} or price band [{}, {}] is too wide",
                self.amount_dif, self.price_min, self.price_max
            )));
        }
        if self.volume <= 0.0 {
            return Err(SplitError::InvalidSpec(format!(
                "volume must be > 0, got {}",
                self.volume
            )));
        }
        if self.number == 0 {
            return Err(SplitError::InvalidSpec("number must be >= 1".into()));
        }
        if self.amount_dif < 0.0 {
            return Err(SplitError::InvalidSpec(format!(
                "amount_dif must be >= 0, got {}",
                self.amount_dif
            )));
        }
        if self.price_min <= 0.0 || self.price_min > self.price_max {
            return Err(SplitError::InvalidSpec(format!(
                "price band must satisfy 0 < price_min <= price_max, got [{}, {}]",
                self.price_min, self.price_max
            )));
        }
        Ok(())
    }

    /// Worst-case balance needed: base quantity at the lowest price for a sell,
    /// the full notional for a buy.
    pub fn required_balance(&self) -> f64 {
        match self.side {
            Side::Sell => self.volume / self.price_min,
            Side::Buy => self.volume,
        }
    }
}

/// A spot pair plus the precision its orders are rounded to.
#[derive(Debug, Clone, PartialEq)]
pub struct Instrument {
    pub base: String,
    pub quote: String,
    pub price_decimals: u32,
    pub qty_decimals: u32,
    /// Smallest notional the exchange accepts for one order, when known.
    pub min_notional: Option<f64>,
}

impl Instrument {
    pub fn new(base: impl Into<String>, quote: impl Into<String>) -> Self {
        Self {
            base: base.into().to_uppercase(),
            quote: quote.into().to_uppercase(),
            price_decimals: 2,
            qty_decimals: 6,
            min_notional: None,
        }
    }

    /// Splits `BTCUSDT` into `BTC` / `USDT` given the quote asset.
    pub fn from_symbol(symbol: &str, quote: &str) -> Option<Self> {
        let symbol = symbol.trim().to_uppercase();
        let quote = quote.trim().to_uppercase();
        let base = symbol.strip_suffix(quote.as_str())?;
        if base.is_empty() {
            return None;
        }
        Some(Self::new(base, quote))
    }

    pub fn with_precision(mut self, price_decimals: u32, qty_decimals: u32) -> Self {
        self.price_decimals = price_decimals;
        self.qty_decimals = qty_decimals;
        self
    }

    pub fn with_min_notional(mut self, min_notional: Option<f64>) -> Self {
        self.min_notional = min_notional;
        self
    }

    /// Takes precision and minimum notional from the exchange's symbol rules.
    pub fn with_filters(self, filters: &SymbolFilters) -> Self {
        self.with_precision(filters.price_decimals(), filters.qty_decimals())
            .with_min_notional(filters.min_notional)
    }

    pub fn pair(&self) -> String {
        format!("{}{}", self.base, self.quote)
    }

    /// Asset that must cover the trade: base for a sell, quote for a buy.
    pub fn balance_asset(&self, side: Side) -> &str {
        match side {
            Side::Sell => &self.base,
            Side::Buy => &self.quote,
        }
    }
}

/// Attempt budget and exponential backoff for a retried gateway call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff_ms: u64, max_backoff_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff: Duration::from_millis(initial_backoff_ms),
            max_backoff: Duration::from_millis(max_backoff_ms.max(initial_backoff_ms)),
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        backoff_delay(attempt, self.initial_backoff, self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, 250, 4_000)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlacedOrder {
    pub index: u32,
    pub price: f64,
    pub quantity: f64,
    /// Un-rounded notional that went into the running total.
    pub notional: f64,
    pub order_id: u64,
}

/// Running totals of one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionState {
    pub total_spent: f64,
    pub prices_issued: Vec<f64>,
    pub orders: Vec<PlacedOrder>,
}

impl ExecutionState {
    pub fn orders_created(&self) -> u32 {
        self.orders.len() as u32
    }

    fn record(&mut self, order: PlacedOrder) {
        self.total_spent += order.notional;
        self.prices_issued.push(order.price);
        self.orders.push(order);
    }

    pub fn average_price(&self) -> Option<f64> {
        if self.prices_issued.is_empty() {
            return None;
        }
        Some(self.prices_issued.iter().sum::<f64>() / self.prices_issued.len() as f64)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AbortReason {
    SubmissionFailed { index: u32, error: String },
    ProbeExhausted { attempts: u32, error: String },
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SubmissionFailed { index, error } => {
                write!(f, "order #{} failed: {}", index + 1, error)
            }
            Self::ProbeExhausted { attempts, error } => {
                write!(f, "exchange unreachable after {attempts} attempts: {error}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CancelOutcome {
    Canceled(usize),
    Failed { attempts: u32, error: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunStatus {
    Completed,
    InsufficientBalance {
        required: f64,
        available: Option<f64>,
    },
    Aborted {
        reason: AbortReason,
        cancel: CancelOutcome,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub symbol: String,
    pub side: Side,
    pub balance_asset: String,
    pub orders_requested: u32,
    pub status: RunStatus,
    pub state: ExecutionState,
    pub balance_before: Option<f64>,
    pub balance_after: Option<f64>,
}

impl RunReport {
    pub fn orders_created(&self) -> u32 {
        self.state.orders_created()
    }

    pub fn total_spent(&self) -> f64 {
        self.state.total_spent
    }

    pub fn average_price(&self) -> Option<f64> {
        self.state.average_price()
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.status, RunStatus::Completed)
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.status {
            RunStatus::InsufficientBalance {
                required,
                available,
            } => {
                let available = available
                    .map(|value| value.to_string())
                    .unwrap_or_else(|| "unavailable".to_string());
                return writeln!(
                    f,
                    "Insufficient {} balance for {} {}: required {required}, available {available}",
                    self.balance_asset,
                    self.side.as_binance(),
                    self.symbol
                );
            }
            RunStatus::Aborted { reason, cancel } => {
                writeln!(f, "Run aborted: {reason}")?;
                match cancel {
                    CancelOutcome::Canceled(count) => {
                        writeln!(f, "Open orders canceled: {count}")?
                    }
                    CancelOutcome::Failed { attempts, error } => writeln!(
                        f,
                        "Cancel-all FAILED after {attempts} attempts, orders may still be open: {error}"
                    )?,
                }
            }
            RunStatus::Completed => {}
        }

        writeln!(
            f,
            "Orders placed: {}/{}",
            self.orders_created(),
            self.orders_requested
        )?;
        if let Some(average) = self.average_price() {
            writeln!(f, "Average price: {average:.2}")?;
        }
        writeln!(f, "Total spent: {:.2}", self.total_spent())?;
        if let Some(before) = self.balance_before {
            writeln!(f, "{} balance before: {before}", self.balance_asset)?;
        }
        if let Some(after) = self.balance_after {
            writeln!(f, "{} balance after: {after}", self.balance_asset)?;
        }
        Ok(())
    }
}

/// Notional of child order `index` before jitter. The last order takes the
/// residual so the partition sums to the volume whatever the earlier jitter.
pub fn target_notional(spec: &TradeSpec, index: u32, total_spent: f64) -> f64 {
    if index + 1 < spec.number {
        spec.volume / spec.number as f64
    } else {
        spec.volume - total_spent
    }
}

// Draws scale a unit sample so no range width is ever formed from the bounds.
fn draw_symmetric<R: Rng>(rng: &mut R, amplitude: f64) -> f64 {
    if amplitude <= 0.0 {
        return 0.0;
    }
    let unit: f64 = rng.gen_range(-1.0..=1.0);
    (amplitude * unit).clamp(-amplitude, amplitude)
}

fn draw_price<R: Rng>(rng: &mut R, spec: &TradeSpec, decimals: u32) -> f64 {
    let raw = if spec.price_max > spec.price_min {
        let unit: f64 = rng.gen_range(0.0..=1.0);
        (spec.price_min + (spec.price_max - spec.price_min) * unit)
            .clamp(spec.price_min, spec.price_max)
    } else {
        spec.price_min
    };
    round_within(raw, decimals, spec.price_min, spec.price_max)
}

pub struct OrderSplitter<G> {
    gateway: G,
    probe_policy: RetryPolicy,
    cancel_policy: RetryPolicy,
}

impl<G: ExchangeGateway> OrderSplitter<G> {
    pub fn new(gateway: G) -> Self {
        Self {
            gateway,
            probe_policy: RetryPolicy::default(),
            cancel_policy: RetryPolicy::new(3, 250, 2_000),
        }
    }

    pub fn with_probe_policy(mut self, policy: RetryPolicy) -> Self {
        self.probe_policy = policy;
        self
    }

    pub fn with_cancel_policy(mut self, policy: RetryPolicy) -> Self {
        self.cancel_policy = policy;
        self
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    pub async fn execute(
        &self,
        spec: &TradeSpec,
        instrument: &Instrument,
    ) -> Result<RunReport, SplitError> {
        let mut rng = StdRng::from_entropy();
        self.execute_with_rng(spec, instrument, &mut rng).await
    }

    pub async fn execute_with_rng<R: Rng + Send>(
        &self,
        spec: &TradeSpec,
        instrument: &Instrument,
        rng: &mut R,
    ) -> Result<RunReport, SplitError> {
        spec.validate()?;

        let symbol = instrument.pair();
        let asset = instrument.balance_asset(spec.side).to_string();
        let required = spec.required_balance();

        let mut report = RunReport {
            symbol: symbol.clone(),
            side: spec.side,
            balance_asset: asset.clone(),
            orders_requested: spec.number,
            status: RunStatus::Completed,
            state: ExecutionState::default(),
            balance_before: None,
            balance_after: None,
        };

        let available = match self.gateway.free_balance(&asset).await {
            Ok(value) => value,
            Err(error) => {
                warn!(%asset, error = %error, "balance check failed");
                None
            }
        };
        report.balance_before = available;

        let sufficient = available.is_some_and(|free| required <= free);
        if !sufficient {
            warn!(
                %symbol,
                %asset,
                required,
                available = ?available,
                "insufficient balance, no orders placed"
            );
            report.status = RunStatus::InsufficientBalance {
                required,
                available,
            };
            return Ok(report);
        }

        info!(
            %symbol,
            side = spec.side.as_binance(),
            volume = spec.volume,
            number = spec.number,
            amount_dif = spec.amount_dif,
            price_min = spec.price_min,
            price_max = spec.price_max,
            "starting split execution"
        );

        for index in 0..spec.number {
            if let Err((attempts, error)) = self.probe().await {
                let reason = AbortReason::ProbeExhausted {
                    attempts,
                    error: error.to_string(),
                };
                return Ok(self.abort(report, reason).await);
            }

            let notional = target_notional(spec, index, report.state.total_spent)
                + draw_symmetric(rng, spec.amount_dif);
            let price = draw_price(rng, spec, instrument.price_decimals);
            let quantity = round_to_scale(notional / price, instrument.qty_decimals);

            if !quantity.is_finite() || quantity <= 0.0 {
                let reason = AbortReason::SubmissionFailed {
                    index,
                    error: format!(
                        "quantity rounds to {quantity} for notional {notional:.8} at price {price}"
                    ),
                };
                return Ok(self.abort(report, reason).await);
            }
            if let Some(min_notional) = instrument.min_notional {
                let order_notional = quantity * price;
                if order_notional < min_notional {
                    warn!(
                        %symbol,
                        order = index + 1,
                        order_notional,
                        min_notional,
                        "order below exchange minimum notional, rolling back"
                    );
                    let reason = AbortReason::SubmissionFailed {
                        index,
                        error: format!(
                            "notional {order_notional:.8} is below the exchange minimum {min_notional}"
                        ),
                    };
                    return Ok(self.abort(report, reason).await);
                }
            }

            let order = LimitOrder::gtc(symbol.clone(), spec.side, quantity, price);
            match self.gateway.place_limit_order(&order).await {
                Ok(ack) => {
                    info!(
                        %symbol,
                        order = index + 1,
                        of = spec.number,
                        order_id = ack.order_id,
                        price,
                        quantity,
                        notional,
                        "limit order placed"
                    );
                    report.state.record(PlacedOrder {
                        index,
                        price,
                        quantity,
                        notional,
                        order_id: ack.order_id,
                    });
                }
                Err(error) => {
                    warn!(
                        %symbol,
                        order = index + 1,
                        error = %error,
                        body = ?error.body_snippet(),
                        "order placement failed, rolling back"
                    );
                    let reason = AbortReason::SubmissionFailed {
                        index,
                        error: describe_gateway_error(&error),
                    };
                    return Ok(self.abort(report, reason).await);
                }
            }
        }

        report.balance_after = match self.gateway.free_balance(&asset).await {
            Ok(value) => value,
            Err(error) => {
                warn!(%asset, error = %error, "post-run balance unavailable");
                None
            }
        };

        info!(
            %symbol,
            orders_created = report.orders_created(),
            total_spent = report.total_spent(),
            average_price = ?report.average_price(),
            "split execution completed"
        );
        Ok(report)
    }

    /// Cancels every open order on `symbol`, retrying with backoff.
    pub async fn cancel_all(&self, symbol: &str) -> CancelOutcome {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.gateway.cancel_all_orders(symbol).await {
                Ok(count) => {
                    info!(%symbol, canceled = count, "open orders canceled");
                    return CancelOutcome::Canceled(count);
                }
                Err(error) if attempt >= self.cancel_policy.max_attempts => {
                    error!(
                        %symbol,
                        attempts = attempt,
                        error = %error,
                        "cancel-all failed, orders may remain open"
                    );
                    return CancelOutcome::Failed {
                        attempts: attempt,
                        error: describe_gateway_error(&error),
                    };
                }
                Err(error) => {
                    let delay = self.cancel_policy.delay_for(attempt);
                    warn!(
                        %symbol,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %error,
                        "cancel-all failed, retrying"
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    async fn probe(&self) -> Result<(), (u32, GatewayError)> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.gateway.account_balances().await {
                Ok(_) => return Ok(()),
                Err(error) if attempt >= self.probe_policy.max_attempts => {
                    return Err((attempt, error));
                }
                Err(error) => {
                    let delay = self.probe_policy.delay_for(attempt);
                    warn!(
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %error,
                        "exchange connectivity probe failed, retrying"
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    async fn abort(&self, mut report: RunReport, reason: AbortReason) -> RunReport {
        warn!(
            symbol = %report.symbol,
            orders_created = report.orders_created(),
            reason = %reason,
            "aborting run"
        );
        let cancel = self.cancel_all(&report.symbol).await;
        report.status = RunStatus::Aborted { reason, cancel };
        report
    }
}

fn describe_gateway_error(error: &GatewayError) -> String {
    match error.body_snippet() {
        Some(body) if !body.is_empty() => format!("{error} (body: {body})"),
        _ => error.to_string(),
    }
}
