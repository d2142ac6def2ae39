use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use thresholdbot::config::{Settings, TradingMode};
use thresholdbot::db::{InMemoryStore, PostgresStore, ReferenceStore};
use thresholdbot::events::{spawn_notifiers, EventBus, LogNotifier, Notifier};
use thresholdbot::exchange::{BinanceGateway, OrderGateway, PaperGateway};
use thresholdbot::execution::{TradeCoordinator, TradeReport};
use thresholdbot::feed::{BinanceTickerTransport, FeedConfig, StreamManager};
use thresholdbot::persistence::RedisSink;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};

#[derive(Parser, Debug)]
#[command(name = "thresholdbot", about = "Percentage-threshold spot trading engine", version)]
struct Cli {
    /// Settings file (defaults to config/default.toml when present)
    #[arg(long, global = true, env = "THRESHOLDBOT_CONFIG")]
    config: Option<String>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stream prices and trade automatically (default)
    Run,
    /// Open a position at market
    FirstPurchase {
        #[arg(long)]
        symbol: String,
        /// Quote amount; defaults to the symbol's investment_amount
        #[arg(long)]
        amount: Option<f64>,
    },
    /// Liquidate the full ledger position at market
    SellAll {
        #[arg(long)]
        symbol: String,
    },
    /// Show thresholds, holdings and recent trades
    Status {
        #[arg(long)]
        symbol: Option<String>,
    },
}

// ============================================================================
// Shared State
// ============================================================================

struct Runtime {
    settings: Settings,
    coordinator: Arc<TradeCoordinator>,
    /// Set in paper mode; fills need a price before the first tick arrives
    paper: Option<Arc<PaperGateway>>,
    bus: EventBus,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("loading settings")?;
    let runtime = build_runtime(settings).await?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(runtime).await,
        Command::FirstPurchase { symbol, amount } => {
            prime_paper_price(&runtime, &symbol).await?;
            let report = runtime.coordinator.first_purchase(&symbol, amount).await?;
            print_report(&report);
            Ok(())
        }
        Command::SellAll { symbol } => {
            prime_paper_price(&runtime, &symbol).await?;
            let report = runtime.coordinator.sell_all(&symbol).await?;
            print_report(&report);
            Ok(())
        }
        Command::Status { symbol } => {
            let symbols = match symbol {
                Some(symbol) => vec![symbol],
                None => runtime.coordinator.symbols(),
            };
            for symbol in symbols {
                print_status(&runtime, &symbol).await?;
            }
            Ok(())
        }
    }
}

// ============================================================================
// Initialization Functions
// ============================================================================

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "thresholdbot=info".into()),
        )
        .init();
}

async fn build_runtime(settings: Settings) -> Result<Runtime> {
    let store = connect_store(&settings).await?;

    let paper = (settings.trading.mode == TradingMode::Paper).then(|| Arc::new(PaperGateway::new()));
    let gateway: Arc<dyn OrderGateway> = match &paper {
        Some(paper) => paper.clone(),
        None => Arc::new(
            BinanceGateway::new(&settings.exchange).context("building exchange client")?,
        ),
    };

    let bus = EventBus::default();
    let coordinator = Arc::new(TradeCoordinator::from_settings(
        &settings,
        store,
        gateway.clone(),
        bus.clone(),
    ));

    tracing::info!("\n📊 Configuration:");
    tracing::info!("  Mode: {:?} ({})", settings.trading.mode, gateway.name());
    for entry in &settings.symbols {
        tracing::info!(
            "    - {}: buy -{:.2}%, sell +{:.2}%, ${:.2} per buy",
            entry.symbol,
            entry.buy_pct * 100.0,
            entry.sell_pct * 100.0,
            entry.investment_amount
        );
    }

    Ok(Runtime {
        settings,
        coordinator,
        paper,
        bus,
    })
}

/// Live trading requires Postgres; paper mode falls back to memory
async fn connect_store(settings: &Settings) -> Result<Arc<dyn ReferenceStore>> {
    match PostgresStore::connect(&settings.database).await {
        Ok(store) => {
            tracing::info!("Postgres persistence enabled");
            Ok(Arc::new(store))
        }
        Err(e) if settings.trading.mode == TradingMode::Paper => {
            tracing::warn!(
                "Failed to connect to Postgres ({}), paper trading with in-memory state",
                e
            );
            Ok(Arc::new(InMemoryStore::new()))
        }
        Err(e) => Err(e).context("connecting to Postgres"),
    }
}

async fn connect_redis(settings: &Settings) -> Option<RedisSink> {
    let url = settings.redis.url.as_deref()?;
    match RedisSink::new(url).await {
        Ok(sink) => Some(sink),
        Err(e) => {
            tracing::warn!("Failed to connect to Redis ({}), dashboard cache disabled", e);
            None
        }
    }
}

/// Paper fills use the last seen price; outside `run` there is no feed yet
async fn prime_paper_price(runtime: &Runtime, symbol: &str) -> Result<()> {
    let Some(paper) = &runtime.paper else {
        return Ok(());
    };
    let symbol = thresholdbot::normalize_symbol(symbol);
    let client = BinanceGateway::new(&runtime.settings.exchange)?;
    let price = client
        .ticker_price(&symbol)
        .await
        .with_context(|| format!("fetching {} price", symbol))?;
    paper.set_price(&symbol, price);
    Ok(())
}

// ============================================================================
// Main Loop
// ============================================================================

async fn run(runtime: Runtime) -> Result<()> {
    let Runtime {
        settings,
        coordinator,
        bus,
        ..
    } = runtime;

    tracing::info!("🚀 thresholdbot starting");

    let mut notifiers: Vec<Arc<dyn Notifier>> = vec![Arc::new(LogNotifier)];
    let mut tick_cache = None;
    if let Some(sink) = connect_redis(&settings).await {
        tick_cache = Some(sink.spawn_tick_cache(&bus));
        notifiers.push(Arc::new(sink));
    }
    let notifier_task = spawn_notifiers(&bus, notifiers);

    let changed = coordinator.recompute_all().await;
    tracing::info!("🔁 Startup recompute updated {} symbol(s)", changed);

    let (tick_tx, tick_rx) = mpsc::channel(settings.stream.tick_channel_capacity.max(1));
    let (status_tx, status_rx) = mpsc::unbounded_channel();
    let mut router = coordinator.clone().spawn_router(tick_rx, status_rx);

    let manager = StreamManager::new(
        Arc::new(BinanceTickerTransport::new(settings.stream.ws_url.clone())),
        FeedConfig::from(&settings.stream),
        tick_tx,
        status_tx,
    );
    let subscription = manager.subscribe(settings.symbols());

    let recompute_task = {
        let coordinator = coordinator.clone();
        let period = settings.recompute_interval();
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let changed = coordinator.recompute_all().await;
                if changed > 0 {
                    tracing::info!("🔁 Recompute updated {} symbol(s)", changed);
                }
            }
        })
    };

    tracing::info!("✅ Streaming {} symbol(s)", manager.active_symbols().len());
    tracing::info!("\nPress Ctrl+C to stop...\n");

    let outcome = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            tracing::info!("\n⚠️  Received Ctrl+C, shutting down...");
            signal.map_err(|e| anyhow!("listening for Ctrl+C: {}", e))
        }
        result = &mut router => {
            tracing::error!("Tick router exited: {:?}", result);
            Err(anyhow!("tick router exited"))
        }
    };

    manager.unsubscribe(subscription);
    manager.shutdown();
    recompute_task.abort();
    router.abort();
    if let Some(task) = tick_cache {
        task.abort();
    }

    // Let in-flight notifications drain before the bus goes away
    drop(coordinator);
    drop(bus);
    let _ = tokio::time::timeout(std::time::Duration::from_secs(2), notifier_task).await;

    tracing::info!("👋 thresholdbot stopped");
    outcome
}

// ============================================================================
// Output
// ============================================================================

fn print_report(report: &TradeReport) {
    let trade = &report.trade;
    println!(
        "{} {} {:.8} @ ${:.4} (${:.2}) order {}",
        trade.action.as_str().to_uppercase(),
        trade.symbol,
        trade.quantity,
        trade.price,
        trade.quote_amount,
        trade.exchange_order_id
    );
    println!(
        "  next buy ≤ ${:.4}, next sell ≥ ${:.4}{}",
        report.reference.next_buy_price,
        report.reference.next_sell_price,
        if report.corrected { " (corrected)" } else { "" }
    );
}

async fn print_status(runtime: &Runtime, symbol: &str) -> Result<()> {
    let snapshot = runtime.coordinator.snapshot(symbol).await?;
    let reference = &snapshot.reference;

    println!("\n{}", snapshot.symbol);
    println!("  Holdings:        {:.8}", snapshot.holdings);
    println!("  First price:     ${:.4}", reference.first_transaction_price);
    println!("  Last price:      ${:.4}", reference.last_transaction_price);
    println!("  Next buy  ≤      ${:.4}", reference.next_buy_price);
    println!("  Next sell ≥      ${:.4}", reference.next_sell_price);
    println!("  Updated:         {}", reference.updated_at.to_rfc3339());
    if !snapshot.recent_trades.is_empty() {
        println!("  Recent trades:");
        for trade in &snapshot.recent_trades {
            println!(
                "    {} {} {:.8} @ ${:.4} [{}]",
                trade.timestamp.format("%Y-%m-%d %H:%M:%S"),
                trade.action,
                trade.quantity,
                trade.price,
                trade.origin.as_str()
            );
        }
    }
    Ok(())
}
