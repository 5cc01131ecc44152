#![allow(dead_code)]
//! Botfleet - Multi-Bot Futures Trading Orchestrator
//!
//! Runs concurrent grid and trend bots against a Bitget-compatible futures
//! gateway, with per-user allocation, position isolation and bounded
//! automatic recovery.

mod adapters;
mod application;
mod config;
mod domain;
mod ports;
mod strategy;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use rust_decimal::prelude::*;
use rust_decimal_macros::dec;
use tracing_subscriber::{fmt, EnvFilter};

use crate::adapters::bitget::{BitgetClient, BitgetConfig};
use crate::adapters::cli::{BotsCmd, CliApp, Command, RunCmd, StatusCmd, ValidateCmd};
use crate::adapters::notify::{LogNotifier, WebhookConfig, WebhookNotifier};
use crate::adapters::paper::PaperExchange;
use crate::adapters::store::MemoryStore;
use crate::application::grid_loop::GridLoopConfig;
use crate::application::market_data::{spawn_price_poller, MarketFeed, Tick};
use crate::application::trend_loop::TrendLoopConfig;
use crate::application::{BotOrchestrator, Services};
use crate::config::{load_config, Config};
use crate::domain::allocation::AllocationLedger;
use crate::domain::isolation::PositionIsolationRegistry;
use crate::ports::exchange::ExchangePort;
use crate::ports::notify::NotifierPort;
use crate::ports::store::StorePort;

/// Paper-mode starting balance.
const PAPER_BALANCE: rust_decimal::Decimal = dec!(10000);

#[tokio::main]
async fn main() -> Result<()> {
    // Secrets live in .env, not in config.toml.
    dotenvy::dotenv().ok();

    let app = CliApp::parse();
    init_logging(app.verbose, app.debug);

    match app.command {
        Command::Run(cmd) => run_command(cmd).await,
        Command::Status(cmd) => status_command(cmd).await,
        Command::Bots(cmd) => bots_command(cmd).await,
        Command::ValidateConfig(cmd) => validate_command(cmd).await,
    }
}

fn init_logging(verbose: bool, debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else if verbose {
        EnvFilter::new("info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    fmt().with_env_filter(filter).init();
}

async fn run_command(cmd: RunCmd) -> Result<()> {
    let config = load_config(&cmd.config).context("Failed to load configuration")?;

    let store: Arc<MemoryStore> = Arc::new(
        MemoryStore::with_snapshot(config.storage.expanded_path())
            .context("Failed to open store snapshot")?,
    );
    seed_store(&config, &store).await?;

    let feed = MarketFeed::default();
    let symbols: Vec<String> = {
        let mut s: Vec<String> = config.bots.iter().map(|b| b.symbol.clone()).collect();
        s.sort();
        s.dedup();
        s
    };

    let mut feeder_tasks = Vec::new();
    let exchange: Arc<dyn ExchangePort> = if cmd.paper {
        tracing::warn!("PAPER TRADING MODE - no real orders will be placed");
        let paper = Arc::new(PaperExchange::new(PAPER_BALANCE));
        feeder_tasks.push(paper.attach_feed(&feed));
        feeder_tasks.push(spawn_paper_ticker(&config, symbols.clone(), feed.clone()));
        paper
    } else {
        let client = BitgetClient::with_config(BitgetConfig {
            api_base_url: config.exchange.rest_url.clone(),
            api_key: config.exchange.get_api_key(),
            passphrase: config.exchange.get_passphrase(),
            margin_coin: config.exchange.margin_coin.clone(),
            product_type: config.exchange.product_type.clone(),
            ..Default::default()
        })
        .context("Failed to create exchange client")?;
        let exchange: Arc<dyn ExchangePort> = Arc::new(client);
        feeder_tasks.push(spawn_price_poller(
            Arc::clone(&exchange),
            symbols.clone(),
            Duration::from_secs(config.feed.poll_interval_secs),
            feed.clone(),
        ));
        exchange
    };

    let notifier: Arc<dyn NotifierPort> = if config.alerts.webhook_enabled {
        Arc::new(WebhookNotifier::new(WebhookConfig::new(
            config.alerts.webhook_url.clone(),
        )))
    } else {
        Arc::new(LogNotifier::new())
    };

    let store_port: Arc<dyn StorePort> = store.clone();
    let ledger = Arc::new(
        AllocationLedger::new(Arc::clone(&exchange))
            .with_balance_ttl(Duration::from_secs(config.allocation.balance_ttl_secs)),
    );
    let isolation = Arc::new(
        PositionIsolationRegistry::new(Arc::clone(&store_port))
            .with_shared_symbols(config.allocation.allow_shared_symbol),
    );
    let services = Services::new(exchange, store_port, notifier, feed)
        .with_ledger(ledger)
        .with_isolation(isolation);

    let orchestrator = Arc::new(
        BotOrchestrator::new(services)
            .with_trend_config(TrendLoopConfig {
                tick_wait: Duration::from_secs(config.trend.tick_wait_secs),
                stop_loss_pct: config.trend.stop_loss_pct,
                take_profit_pct: config.trend.take_profit_pct,
                candle_period_secs: config.trend.candle_period_secs,
                candle_capacity: config.trend.candle_capacity,
                ..Default::default()
            })
            .with_grid_config(GridLoopConfig {
                check_interval: Duration::from_secs(config.grid.check_interval_secs),
                ..Default::default()
            }),
    );

    // Isolation cache must be rebuilt before any loop trades.
    orchestrator.startup().await.context("startup sync failed")?;

    for bot in &config.bots {
        if let Err(e) = orchestrator.start_instance(bot.id, bot.user_id).await {
            tracing::error!(bot_id = bot.id, error = %e, "failed to start bot");
        }
    }

    tracing::info!(bots = config.bots.len(), "botfleet running; ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("signal handler failed")?;
    tracing::info!("shutdown signal received");

    orchestrator.stop_all().await;
    for task in feeder_tasks {
        task.abort();
    }
    tracing::info!("botfleet stopped");
    Ok(())
}

/// Synthetic random-walk ticker for paper mode.
fn spawn_paper_ticker(
    config: &Config,
    symbols: Vec<String>,
    feed: MarketFeed,
) -> tokio::task::JoinHandle<()> {
    use rand::Rng;

    // Grid bots anchor at their ladder midpoint; everything else starts at
    // a flat reference price.
    let mut prices: Vec<(String, f64)> = Vec::new();
    for symbol in symbols {
        let anchor = config
            .bots
            .iter()
            .find(|b| b.symbol == symbol && b.grid.is_some())
            .and_then(|b| b.grid.as_ref())
            .map(|g| ((g.lower_price + g.upper_price) / dec!(2)).to_f64().unwrap_or(100.0))
            .unwrap_or(100.0);
        prices.push((symbol, anchor));
    }
    let interval = Duration::from_secs(config.feed.poll_interval_secs.max(1));

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            for (symbol, price) in prices.iter_mut() {
                let step = {
                    let mut rng = rand::thread_rng();
                    rng.gen_range(-0.002..0.002)
                };
                *price *= 1.0 + step;
                if let Some(decimal) = rust_decimal::Decimal::from_f64(*price) {
                    feed.publish(Tick::new(symbol.clone(), decimal.round_dp(6)));
                }
            }
        }
    })
}

async fn seed_store(config: &Config, store: &Arc<MemoryStore>) -> Result<()> {
    for section in &config.bots {
        let incoming = section.to_instance();
        match store.bot(section.id).await? {
            // Known bot: adopt the config shape, keep runtime state/stats.
            Some(mut existing) => {
                existing.name = incoming.name;
                existing.symbol = incoming.symbol;
                existing.bot_type = incoming.bot_type;
                existing.max_leverage = incoming.max_leverage;
                existing.allocation_percent = incoming.allocation_percent;
                existing.strategy = incoming.strategy;
                existing.grid = incoming.grid;
                store.save_bot(&existing).await?;
            }
            None => store.save_bot(&incoming).await?,
        }
        store
            .seed_risk_settings(section.user_id, config.risk.to_settings())
            .await;
    }
    Ok(())
}

async fn status_command(cmd: StatusCmd) -> Result<()> {
    let config = load_config(&cmd.config)?;
    let store = MemoryStore::with_snapshot(config.storage.expanded_path())?;

    let bots = store.all_bots().await?;
    if bots.is_empty() {
        println!("No bots in snapshot; run `botfleet run` first.");
        return Ok(());
    }

    println!("{:<6} {:<16} {:<6} {:<10} {:<9} {:>7} {:>10}", "ID", "NAME", "TYPE", "SYMBOL", "RUNNING", "TRADES", "PNL");
    for bot in &bots {
        println!(
            "{:<6} {:<16} {:<6} {:<10} {:<9} {:>7} {:>10}",
            bot.id,
            bot.name,
            match bot.bot_type {
                domain::bot::BotType::Trend => "trend",
                domain::bot::BotType::Grid => "grid",
            },
            bot.symbol,
            bot.is_running,
            bot.total_trades,
            bot.total_pnl.round_dp(2),
        );
        if let Some(ref err) = bot.last_error {
            println!("       last error: {err}");
        }
    }

    let positions = store.open_positions(None).await?;
    if !positions.is_empty() {
        println!("\nOpen positions:");
        for p in positions {
            println!(
                "  user {} bot {:?} {} {} {} @ {}",
                p.user_id, p.bot_id, p.symbol, p.side, p.size, p.entry_price
            );
        }
    }
    Ok(())
}

async fn bots_command(cmd: BotsCmd) -> Result<()> {
    let config = load_config(&cmd.config)?;
    println!("Configured bots ({}):", config.bots.len());
    for bot in &config.bots {
        let detail = match bot.bot_type {
            domain::bot::BotType::Trend => bot
                .strategy
                .as_ref()
                .map(|s| format!("strategy={}", s.name()))
                .unwrap_or_else(|| "strategy=MISSING".to_string()),
            domain::bot::BotType::Grid => bot
                .grid
                .as_ref()
                .map(|g| format!("grid {}..{} x{}", g.lower_price, g.upper_price, g.grid_count))
                .unwrap_or_else(|| "grid=MISSING".to_string()),
        };
        println!(
            "  #{} {} user={} {} alloc={}% {}",
            bot.id, bot.name, bot.user_id, bot.symbol, bot.allocation_percent, detail
        );
    }
    Ok(())
}

async fn validate_command(cmd: ValidateCmd) -> Result<()> {
    match load_config(&cmd.config) {
        Ok(config) => {
            println!("OK: {} ({} bots)", cmd.config, config.bots.len());
            Ok(())
        }
        Err(e) => {
            eprintln!("INVALID: {e}");
            std::process::exit(1);
        }
    }
}
