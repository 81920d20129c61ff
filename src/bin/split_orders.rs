use anyhow::{Context, Result};
use tracing::{info, warn};

use splitbot::config::{AppConfig, Credentials};
use splitbot::execution::{BinanceSpotGateway, ExchangeGateway};
use splitbot::splitter::{CancelOutcome, OrderSplitter};
use splitbot::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/default.toml".to_string());

    let cfg = AppConfig::load_from_path(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path))?;

    telemetry::init("split_orders");

    let credentials = Credentials::from_env().context("exchange credentials are required")?;
    let gateway = BinanceSpotGateway::new(&cfg.exchange, credentials)
        .context("failed to build exchange client")?;
    info!(rest_url = %cfg.exchange.rest_url, "exchange client ready");

    let mut instrument = cfg.instrument.instrument()?;
    let symbol = instrument.pair();

    if cfg.instrument.fetch_filters {
        let filters = gateway
            .fetch_symbol_filters(&symbol)
            .await
            .with_context(|| format!("failed to fetch exchange filters for {symbol}"))?;
        instrument = instrument.with_filters(&filters);
        info!(
            %symbol,
            tick_size = filters.tick_size,
            step_size = filters.step_size,
            min_notional = ?filters.min_notional,
            "using exchange filters"
        );
    }

    match gateway.account_balances().await {
        Ok(balances) => {
            for (asset, free) in balances.iter().filter(|(_, free)| **free > 0.0) {
                info!(%asset, free, "account balance");
            }
        }
        Err(error) => warn!(error = %error, "could not read account balances"),
    }

    let splitter = OrderSplitter::new(gateway)
        .with_probe_policy(cfg.retry.probe_policy())
        .with_cancel_policy(cfg.retry.cancel_policy());

    if cfg.run.cancel_before_run {
        match splitter.gateway().open_orders(&symbol).await {
            Ok(orders) => {
                info!(%symbol, open = orders.len(), "clearing open orders before run");
                for order in &orders {
                    info!(
                        %symbol,
                        order_id = order.order_id,
                        side = %order.side,
                        price = order.price,
                        orig_qty = order.orig_qty,
                        "open order"
                    );
                }
            }
            Err(error) => warn!(
                %symbol,
                error = %error,
                "could not list open orders, cancelling anyway"
            ),
        }
        if let CancelOutcome::Failed { error, .. } = splitter.cancel_all(&symbol).await {
            anyhow::bail!("could not clear open orders on {symbol}: {error}");
        }
    }

    let spec = cfg.trade.to_spec();
    let report = splitter
        .execute(&spec, &instrument)
        .await
        .context("trade spec rejected")?;

    print!("{report}");
    info!(
        %symbol,
        completed = report.is_completed(),
        orders_created = report.orders_created(),
        "split_orders finished"
    );
    Ok(())
}
