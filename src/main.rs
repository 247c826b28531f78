use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tidetrader::config::Config;
use tidetrader::engine::{
    detect_drift, Account, BacktestEngine, BacktestOptions, ExecutionTarget, LiveExecutor,
    MonitorLoop, PaperEngine,
};
use tidetrader::events::EconomicEvent;
use tidetrader::exchange::{BinanceFuturesClient, Broker};
use tidetrader::notifications::LogNotifier;
use tidetrader::storage::JsonlAppender;
use tidetrader::strategies::StrategyRegistry;
use tidetrader::types::{Candle, FillEvent};

#[derive(Parser)]
#[command(name = "tidetrader", about = "Automated crypto trading engine")]
struct Cli {
    /// Path to the configuration file (YAML/TOML/JSON).
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Directory for scenario snapshots, logs, and caches.
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the intra-candle simulator over recent history.
    Backtest {
        /// Candles to fetch per symbol.
        #[arg(long, default_value_t = 1000)]
        limit: u32,
        /// Evaluate exits on closes only instead of highs/lows.
        #[arg(long)]
        no_intracandle: bool,
        /// Accrue 8h funding as on futures.
        #[arg(long)]
        futures: bool,
        /// Uniform funding rate per 8h, e.g. 0.0001.
        #[arg(long)]
        avg_funding_rate: Option<String>,
    },
    /// Trade a simulated account against live candles.
    Paper,
    /// Trade a real account with exchange-native protective stops.
    Live,
    /// Compare paper and live fill quality.
    Drift {
        #[arg(long)]
        paper_scenario: String,
        #[arg(long)]
        live_scenario: String,
        /// Drift threshold in percent.
        #[arg(long, default_value = "0.5")]
        threshold: String,
    },
}

fn load_config(path: &PathBuf) -> Result<Config> {
    if path.exists() {
        Config::load(path)
    } else {
        warn!(path = %path.display(), "config file not found, using defaults");
        Ok(Config::default())
    }
}

fn load_events(data_dir: &PathBuf) -> Vec<EconomicEvent> {
    let path = data_dir.join("events.json");
    match std::fs::read(&path) {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(events) => events,
            Err(err) => {
                warn!(%err, "unreadable event calendar, ignoring");
                Vec::new()
            }
        },
        Err(_) => Vec::new(),
    }
}

async fn fetch_backtest_data(
    broker: &dyn Broker,
    config: &Config,
    limit: u32,
) -> Result<HashMap<String, Vec<Candle>>> {
    let mut data = HashMap::new();
    for symbol in &config.symbols {
        info!(%symbol, "fetching history");
        let candles = broker
            .get_klines(symbol, config.timeframe, limit)
            .await
            .with_context(|| format!("fetching klines for {symbol}"))?;
        info!(%symbol, candles = candles.len(), "history fetched");
        data.insert(symbol.clone(), candles);
    }
    Ok(data)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    std::fs::create_dir_all(&cli.data_dir)?;

    match cli.command {
        Command::Backtest {
            limit,
            no_intracandle,
            futures,
            avg_funding_rate,
        } => {
            let broker = BinanceFuturesClient::public_only();
            let data = fetch_backtest_data(&broker, &config, limit).await?;

            let avg_rate = avg_funding_rate
                .map(|raw| Decimal::from_str(&raw).context("parsing --avg-funding-rate"))
                .transpose()?;
            let options = BacktestOptions {
                initial_usdt: config.paper.initial_usdt,
                fee_rate: config.paper.fee_rate,
                slippage_percent: config.paper.slippage_percent,
                intracandle: !no_intracandle,
                futures,
                avg_funding_rate_per_8h: avg_rate,
                ..BacktestOptions::default()
            };
            let mut engine = BacktestEngine::new(config, options)?;
            let report = engine.run(data)?;
            report.print_summary();
        }
        Command::Paper => {
            let registry = Arc::new(StrategyRegistry::with_builtins());
            let paper = PaperEngine::new(config.clone(), &cli.data_dir, registry.clone(), Utc::now())?;
            let broker: Arc<dyn Broker> = Arc::new(BinanceFuturesClient::public_only());
            let events = load_events(&cli.data_dir);
            let mut monitor = MonitorLoop::new(
                config,
                broker,
                registry,
                ExecutionTarget::Paper(paper),
                Arc::new(LogNotifier),
                events,
            );
            monitor.run().await?;
        }
        Command::Live => {
            let api_key = std::env::var("BINANCE_API_KEY")
                .context("BINANCE_API_KEY must be set for live trading")?;
            let secret_key = std::env::var("BINANCE_SECRET_KEY")
                .context("BINANCE_SECRET_KEY must be set for live trading")?;
            let broker: Arc<dyn Broker> =
                Arc::new(BinanceFuturesClient::new(api_key, secret_key));

            let registry = Arc::new(StrategyRegistry::with_builtins());
            let notifier = Arc::new(LogNotifier);
            let scenario = config.paper.scenario_id.clone();
            let snapshot = cli.data_dir.join(format!("live-{scenario}.json"));
            let initial = match broker.get_usdt_balance().await {
                Ok(balance) if balance > Decimal::ZERO => balance,
                Ok(_) | Err(_) => config.paper.initial_usdt,
            };
            let account = Account::load_or_new(&snapshot, initial, Utc::now());
            let executor = LiveExecutor::new(broker.clone(), notifier.clone(), config.clone());
            let events = load_events(&cli.data_dir);

            let mut monitor = MonitorLoop::new(
                config,
                broker,
                registry,
                ExecutionTarget::Live { executor, account },
                notifier,
                events,
            );
            monitor.run().await?;
        }
        Command::Drift {
            paper_scenario,
            live_scenario,
            threshold,
        } => {
            let threshold = Decimal::from_str(&threshold).context("parsing --threshold")?;
            let read_fills = |scenario: &str| -> Vec<FillEvent> {
                JsonlAppender::new(
                    cli.data_dir
                        .join("logs")
                        .join(format!("fills-{scenario}.jsonl")),
                )
                .read_all()
            };
            let paper_fills = read_fills(&paper_scenario);
            let live_fills = read_fills(&live_scenario);
            let report = detect_drift(&paper_fills, &live_fills, threshold);

            println!("Drift report ({paper_scenario} vs {live_scenario})");
            println!("  pairs:              {}", report.total_pairs);
            println!("  avg drift:          {:.4}%", report.avg_drift_percent);
            println!("  max drift:          {:.4}%", report.max_drift_percent);
            println!(
                "  above {:.2}%:         {}",
                report.threshold_percent, report.exceeding_threshold
            );
            for (symbol, drift) in &report.by_symbol {
                println!(
                    "  {symbol}: {} pairs, avg {:.4}%",
                    drift.pairs, drift.avg_drift_percent
                );
            }
        }
    }
    Ok(())
}
