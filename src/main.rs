use anyhow::Context;
use clap::{Parser, Subcommand};
use reversal_autopilot::api::{
    BinanceMarketClient, CandleSource, OrderGateway, PaperOrderGateway, PriceSource,
    TradeRecorder,
};
use reversal_autopilot::autopilot::ReversalAutopilot;
use reversal_autopilot::backtest::{MarketScenario, SyntheticMarket};
use reversal_autopilot::config::AppConfig;
use reversal_autopilot::db::PostgresTradeStore;
use reversal_autopilot::execution::OrderManager;
use reversal_autopilot::persistence::RedisTrailingStore;
use reversal_autopilot::reversal::MtfReversalAnalyzer;
use reversal_autopilot::Timeframe;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "reversal-autopilot", version, about = "Multi-timeframe reversal autopilot")]
struct Cli {
    /// TOML config file (defaults to ./autopilot.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one multi-timeframe analysis per symbol and print it as JSON
    Scan {
        /// Symbols to scan (defaults to the configured list)
        #[arg(short, long, value_delimiter = ',')]
        symbols: Vec<String>,

        /// Candles per pattern window
        #[arg(short = 'n', long)]
        candles: Option<usize>,
    },
    /// Scan and manage positions until Ctrl+C
    Run,
    /// Offline replay against a seeded synthetic market
    Replay {
        #[arg(long, default_value_t = 42)]
        seed: u64,

        #[arg(long, default_value = "BTCUSDT")]
        symbol: String,

        /// Order manager sweeps to run after the entry
        #[arg(long, default_value_t = 10)]
        sweeps: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Command::Scan { symbols, candles } => scan(&config, symbols, candles).await,
        Command::Run => run(config).await,
        Command::Replay {
            seed,
            symbol,
            sweeps,
        } => replay(config, seed, &symbol, sweeps).await,
    }
}

fn setup_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("reversal_autopilot=info"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn market_client(config: &AppConfig) -> Arc<BinanceMarketClient> {
    Arc::new(BinanceMarketClient::with_base_url(
        &config.exchange.base_url,
        config.exchange.requests_per_second,
    ))
}

async fn scan(
    config: &AppConfig,
    symbols: Vec<String>,
    candles: Option<usize>,
) -> anyhow::Result<()> {
    let analyzer = MtfReversalAnalyzer::new(market_client(config));
    let count = candles.unwrap_or(config.reversal.consecutive_candles);
    let symbols = if symbols.is_empty() {
        config.reversal.symbols.clone()
    } else {
        symbols
    };

    for symbol in symbols {
        let analysis = analyzer.analyze(&symbol, count).await;
        println!("{}", serde_json::to_string_pretty(&analysis)?);
    }

    Ok(())
}

async fn connect_to_postgres(database_url: Option<&str>) -> Option<Arc<PostgresTradeStore>> {
    let database_url = database_url?;

    match PostgresTradeStore::new(database_url).await {
        Ok(store) => {
            tracing::info!("Postgres trade store enabled");
            Some(Arc::new(store))
        }
        Err(e) => {
            tracing::warn!(
                "Failed to connect to Postgres ({}), continuing without trade history",
                e
            );
            None
        }
    }
}

async fn connect_to_redis(redis_url: Option<&str>) -> Option<Arc<RedisTrailingStore>> {
    let redis_url = redis_url?;

    match RedisTrailingStore::new(redis_url).await {
        Ok(store) => Some(Arc::new(store)),
        Err(e) => {
            tracing::warn!(
                "Failed to connect to Redis ({}), continuing without trailing cache",
                e
            );
            None
        }
    }
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
    tracing::info!("🚀 Reversal autopilot starting");

    let market = market_client(&config);
    // Signed order routing is not wired in; entries and stops go to the paper book
    let gateway: Arc<dyn OrderGateway> = Arc::new(PaperOrderGateway::new());

    let postgres = connect_to_postgres(config.storage.database_url.as_deref()).await;
    let redis = connect_to_redis(config.storage.redis_url.as_deref()).await;

    // Postgres keeps the trade history; Redis is the fallback for trailing state
    let recorder: Option<Arc<dyn TradeRecorder>> = match (&postgres, &redis) {
        (Some(pg), _) => Some(pg.clone() as Arc<dyn TradeRecorder>),
        (None, Some(redis)) => Some(redis.clone() as Arc<dyn TradeRecorder>),
        (None, None) => None,
    };

    let order_manager = OrderManager::new(
        config.order_manager.clone(),
        gateway.clone(),
        market.clone(),
        recorder,
    );

    let mut autopilot = ReversalAutopilot::new(
        market.clone(),
        order_manager.clone(),
        gateway,
        config.reversal.clone(),
        config.trading.clone(),
    );
    if let Some(store) = postgres {
        autopilot = autopilot.with_trade_store(store);
    }

    tracing::info!("\n📊 Configuration:");
    tracing::info!("  Symbols: {}", config.reversal.symbols.join(", "));
    tracing::info!("  Window: {} candles", config.reversal.consecutive_candles);
    let policy = order_manager.config();
    tracing::info!(
        "  TP/SL: {}% / {}%",
        policy.take_profit_percent,
        policy.stop_loss_percent
    );
    tracing::info!(
        "  Trailing: {} (trail {}%, activation {}%)",
        policy.trailing_stop_enabled,
        policy.trailing_stop_percent,
        policy.trailing_activation_percent
    );
    tracing::info!("  Dry run: {}", config.trading.dry_run);
    tracing::info!("\nPress Ctrl+C to stop...\n");

    order_manager.start();

    let cancel = CancellationToken::new();
    let mut scan_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { autopilot.run(cancel).await })
    };

    // Wait for Ctrl+C or the scan loop giving up
    let finished = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("\n⚠️  Received Ctrl+C, shutting down...");
            None
        }
        result = &mut scan_task => Some(result),
    };

    cancel.cancel();
    let result = match finished {
        Some(result) => result,
        None => scan_task.await,
    };
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("Scan loop exited: {}", e),
        Err(e) => tracing::error!("Scan loop panicked: {}", e),
    }

    for position in order_manager.managed_positions().await? {
        tracing::info!(
            "  Open: {} {} @ {:.4} (SL {:.4}, trailing {})",
            position.side,
            position.symbol,
            position.entry_price,
            position.stop_loss_price,
            position.trailing_active
        );
    }
    order_manager.shutdown().await;

    tracing::info!("👋 Reversal autopilot stopped");
    Ok(())
}

async fn replay(config: AppConfig, seed: u64, symbol: &str, sweeps: usize) -> anyhow::Result<()> {
    tracing::info!(seed, symbol, sweeps, "🧪 Replaying against synthetic market");

    let market = Arc::new(SyntheticMarket::new(seed));
    market.set_scenario(symbol, Timeframe::M5, MarketScenario::Selloff);
    market.set_scenario(symbol, Timeframe::M15, MarketScenario::Selloff);

    let candles: Arc<dyn CandleSource> = market.clone();
    let prices: Arc<dyn PriceSource> = market.clone();
    let gateway = Arc::new(PaperOrderGateway::new());

    let order_manager = OrderManager::new(
        config.order_manager.clone(),
        gateway.clone(),
        prices,
        None,
    );
    let mut reversal = config.reversal.clone();
    reversal.symbols = vec![symbol.to_string()];
    let mut trading = config.trading.clone();
    trading.dry_run = true;

    let autopilot =
        ReversalAutopilot::new(candles, order_manager.clone(), gateway.clone(), reversal, trading);

    let report = autopilot.scan_symbol(symbol).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    let Some(registration) = report.registration else {
        tracing::info!(decision = ?report.decision, "No position opened");
        return Ok(());
    };

    // Recovery leg: half a percent per sweep, then a pullback
    let entry = registration.position.entry_price;
    let mut path: Vec<f64> = (1..=sweeps)
        .map(|i| entry * (1.0 + 0.005 * i as f64))
        .collect();
    if let Some(top) = path.last().copied() {
        path.push(top * 0.995);
    }
    market.set_price_path(symbol, &path);

    for _ in 0..=sweeps {
        let sweep = order_manager.sweep_now().await?;
        println!("{}", serde_json::to_string(&sweep)?);
    }

    if let Some(position) = order_manager.managed_position(symbol).await? {
        println!("{}", serde_json::to_string_pretty(&position)?);
    }
    tracing::info!(
        open_orders = gateway.open_orders().len(),
        "Replay complete"
    );

    order_manager.shutdown().await;
    Ok(())
}
