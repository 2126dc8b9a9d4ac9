use std::sync::Arc;

use pulsewatch::{
    MarketMonitor, MonitorConfig, alert::rule::AlertRuleStore, market::SymbolFilter,
    notify::NotificationSink, rest::MarketDataApi,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::{binance::BinanceFuturesApi, rules::JsonRuleStore, telegram::TelegramNotifier};

/// Binance USD-M futures REST client.
mod binance;
/// File-backed alert rule store.
mod rules;
/// Telegram Bot API notification sink.
mod telegram;

/// Instrument filter for the USD-M futures feed: admits USDT-quoted
/// perpetuals and rejects leveraged token products, which carry ticker
/// streams of their own but are not monitorable markets.
struct UsdtPerpFilter;

impl SymbolFilter for UsdtPerpFilter {
    fn is_eligible(&self, symbol: &str) -> bool {
        symbol.ends_with("USDT")
            && !symbol.ends_with("UPUSDT")
            && !symbol.ends_with("DOWNUSDT")
    }
}

#[tokio::main]
async fn main() {
    init_logging();

    let config = MonitorConfig::from_env();
    info!(feed_url = %config.feed.url, "starting pulsewatch monitor");

    let filter: Arc<dyn SymbolFilter> = Arc::new(UsdtPerpFilter);
    let api: Arc<dyn MarketDataApi> = Arc::new(BinanceFuturesApi::from_env());
    let store: Arc<dyn AlertRuleStore> = Arc::new(JsonRuleStore::from_env());
    let notifier: Arc<dyn NotificationSink> = Arc::new(TelegramNotifier::from_env());

    let mut monitor = MarketMonitor::new(config, filter, api, store, notifier);
    if let Err(error) = monitor.start().await {
        error!(%error, "failed to start monitor");
        std::process::exit(1);
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(error) => error!(%error, "failed to listen for shutdown signal"),
    }

    monitor.stop().await;
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}
