//! Multi-bot coordination integration tests
//!
//! End-to-end scenarios over the real service graph (allocation ledger,
//! isolation registry, risk gate, recovery scheduler, loops, orchestrator)
//! with mock exchange/store/notifier adapters. Deterministic: no network,
//! no real clock dependence beyond tokio's paused time where used.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::watch;

use botfleet::application::grid_loop::{GridBotLoop, GridLoopConfig};
use botfleet::application::market_data::MarketFeed;
use botfleet::application::trend_loop::{TrendBotLoop, TrendLoopConfig};
use botfleet::application::{BotOrchestrator, Services};
use botfleet::domain::bot::{BotInstance, BotRuntimeStatus, BotType};
use botfleet::domain::grid::{GridBotConfig, GridMode, GridRungStatus};
use botfleet::domain::position::Side;
use botfleet::domain::risk::RiskSettings;
use botfleet::ports::mocks::{MockExchange, MockNotifier, MockStore};
use botfleet::ports::store::StorePort;
use botfleet::strategy::{Signal, SmaCrossParams, StrategySpec};

// ============================================================================
// Fixtures
// ============================================================================

struct Harness {
    exchange: Arc<MockExchange>,
    store: Arc<MockStore>,
    notifier: Arc<MockNotifier>,
    services: Services,
}

async fn harness(balance: Decimal) -> Harness {
    let exchange = Arc::new(MockExchange::new(balance));
    let store = Arc::new(MockStore::new());
    let notifier = Arc::new(MockNotifier::new());
    let services = Services::new(
        exchange.clone(),
        store.clone(),
        notifier.clone(),
        MarketFeed::default(),
    );
    Harness { exchange, store, notifier, services }
}

fn trend_bot(id: i64, user: i64, symbol: &str, percent: Decimal) -> BotInstance {
    BotInstance::new(id, user, format!("trend-{id}"), BotType::Trend, symbol, 10, percent)
        .with_strategy(StrategySpec::SmaCross(SmaCrossParams::default()))
}

fn grid_config() -> GridBotConfig {
    GridBotConfig {
        lower_price: dec!(100),
        upper_price: dec!(200),
        grid_count: 5,
        mode: GridMode::Arithmetic,
        total_investment: dec!(1000),
        leverage: 1,
        taker_fee_rate: dec!(0.0006),
        effective_grids: None,
    }
}

async fn trend_loop_for(h: &Harness, bot: BotInstance) -> TrendBotLoop {
    h.services
        .ledger
        .register_bot(bot.user_id, bot.id, bot.allocation_percent)
        .await;
    let (_tx, rx) = watch::channel(false);
    TrendBotLoop::new(bot, h.services.clone(), TrendLoopConfig::default(), rx).unwrap()
}

// ============================================================================
// Scenario: end-to-end trend entry
// ============================================================================

#[tokio::test]
async fn trend_entry_reserves_allocates_and_records() {
    let h = harness(dec!(1000)).await;
    h.exchange.set_mark_price("ETHUSDT", dec!(2000)).await;
    h.store
        .seed_risk_settings(
            1,
            RiskSettings {
                daily_loss_limit: dec!(500),
                max_leverage: 20,
                max_positions: 5,
            },
        )
        .await;

    let mut bot_loop = trend_loop_for(&h, trend_bot(7, 1, "ETHUSDT", dec!(100))).await;

    // Strategy says buy with 0.8 confidence.
    bot_loop
        .handle_signal(dec!(2000), Signal::buy(0.8, "scenario entry"))
        .await
        .unwrap();

    // An order reached the exchange and a trade row exists with no exit.
    let open = bot_loop.open_trade().expect("position opened");
    let trade = h.store.trade(open.trade_id).await.unwrap();
    assert!(trade.exit_price.is_none());
    assert_eq!(trade.side, Side::Long);

    // The reservation never exceeds the available balance.
    assert!(open.reserved <= dec!(1000));
    assert_eq!(h.services.ledger.used_amount(1, 7).await, open.reserved);

    // The isolation registry granted and now tracks the symbol.
    assert_eq!(h.services.isolation.holder(1, "ETHUSDT").await, Some(Some(7)));

    let calls = h.exchange.calls().await;
    assert!(calls.iter().any(|c| c.starts_with("market(ETHUSDT,Buy")));
}

// ============================================================================
// Scenario: blocked by daily loss
// ============================================================================

#[tokio::test]
async fn trend_entry_blocked_by_daily_loss_continues_quietly() {
    let h = harness(dec!(1000)).await;
    h.exchange.set_mark_price("ETHUSDT", dec!(2000)).await;
    h.store.seed_daily_pnl(1, dec!(-600)).await;
    h.store
        .seed_risk_settings(1, RiskSettings { daily_loss_limit: dec!(500), ..Default::default() })
        .await;

    let mut bot_loop = trend_loop_for(&h, trend_bot(7, 1, "ETHUSDT", dec!(100))).await;

    // The signal is swallowed: no error, no order, no reservation.
    bot_loop
        .handle_signal(dec!(2000), Signal::buy(0.8, "blocked entry"))
        .await
        .unwrap();

    assert!(bot_loop.open_trade().is_none());
    assert_eq!(h.services.ledger.used_amount(1, 7).await, dec!(0));
    let calls = h.exchange.calls().await;
    assert!(!calls.iter().any(|c| c.starts_with("market(")));
}

// ============================================================================
// Two bots fighting over one symbol
// ============================================================================

#[tokio::test]
async fn isolation_keeps_second_bot_off_the_symbol() {
    let h = harness(dec!(1000)).await;
    h.exchange.set_mark_price("ETHUSDT", dec!(2000)).await;

    let mut first = trend_loop_for(&h, trend_bot(7, 1, "ETHUSDT", dec!(50))).await;
    let mut second = trend_loop_for(&h, trend_bot(8, 1, "ETHUSDT", dec!(50))).await;

    first
        .handle_signal(dec!(2000), Signal::buy(0.8, "first"))
        .await
        .unwrap();
    second
        .handle_signal(dec!(2000), Signal::buy(0.9, "second"))
        .await
        .unwrap();

    assert!(first.open_trade().is_some());
    assert!(second.open_trade().is_none());
    assert_eq!(h.services.isolation.holder(1, "ETHUSDT").await, Some(Some(7)));

    // Exactly one entry order went out.
    let entries = h
        .exchange
        .calls()
        .await
        .into_iter()
        .filter(|c| c.starts_with("market(ETHUSDT,Buy"))
        .count();
    assert_eq!(entries, 1);
}

// ============================================================================
// Allocation shared across a user's bots
// ============================================================================

#[tokio::test]
async fn two_bots_cannot_jointly_overcommit_the_balance() {
    let h = harness(dec!(1000)).await;
    h.exchange.set_mark_price("ETHUSDT", dec!(2000)).await;
    h.exchange.set_mark_price("BTCUSDT", dec!(60000)).await;

    let mut eth = trend_loop_for(&h, trend_bot(7, 1, "ETHUSDT", dec!(60))).await;
    let mut btc = trend_loop_for(&h, trend_bot(8, 1, "BTCUSDT", dec!(40))).await;

    eth.handle_signal(dec!(2000), Signal::buy(0.8, "eth"))
        .await
        .unwrap();
    btc.handle_signal(dec!(60000), Signal::buy(0.8, "btc"))
        .await
        .unwrap();

    let used_eth = h.services.ledger.used_amount(1, 7).await;
    let used_btc = h.services.ledger.used_amount(1, 8).await;
    assert!(used_eth <= dec!(600));
    assert!(used_btc <= dec!(400));
    assert!(used_eth + used_btc <= dec!(1000));
}

// ============================================================================
// Round trip: exit releases everything
// ============================================================================

#[tokio::test]
async fn trend_round_trip_flushes_bookkeeping() {
    let h = harness(dec!(1000)).await;
    h.exchange.set_mark_price("ETHUSDT", dec!(2000)).await;

    let mut bot_loop = trend_loop_for(&h, trend_bot(7, 1, "ETHUSDT", dec!(100))).await;
    bot_loop
        .handle_signal(dec!(2000), Signal::buy(0.8, "entry"))
        .await
        .unwrap();
    let trade_id = bot_loop.open_trade().unwrap().trade_id;

    h.exchange.set_mark_price("ETHUSDT", dec!(2100)).await;
    bot_loop
        .handle_signal(dec!(2100), Signal::close(0.9, "reverse"))
        .await
        .unwrap();

    let trade = h.store.trade(trade_id).await.unwrap();
    assert!(trade.is_closed());
    assert!(trade.pnl.unwrap() > Decimal::ZERO);

    assert_eq!(h.services.ledger.used_amount(1, 7).await, dec!(0));
    assert_eq!(h.services.isolation.holder(1, "ETHUSDT").await, None);

    // A second bot can now take the symbol.
    let mut second = trend_loop_for(&h, trend_bot(8, 1, "ETHUSDT", dec!(50))).await;
    second
        .handle_signal(dec!(2100), Signal::buy(0.7, "takeover"))
        .await
        .unwrap();
    assert!(second.open_trade().is_some());

    let events = h.notifier.events().await;
    assert!(events.iter().any(|e| e.starts_with("trade_opened")));
    assert!(events.iter().any(|e| e.starts_with("trade_closed")));
}

// ============================================================================
// Grid: full cycle through the orchest-free loop
// ============================================================================

#[tokio::test]
async fn grid_cycle_profit_and_restart_at_same_price() {
    let h = harness(dec!(10000)).await;
    let bot = BotInstance::new(20, 1, "grid", BotType::Grid, "BTCUSDT", 5, dec!(100))
        .with_grid(grid_config());
    h.services.ledger.register_bot(1, 20, dec!(100)).await;

    let (_tx, rx) = watch::channel(false);
    let mut grid_loop =
        GridBotLoop::new(bot, h.services.clone(), GridLoopConfig::default(), rx).unwrap();
    grid_loop.prepare().await.unwrap();

    // Market at 130: rungs 100 and 125 get resting buys.
    grid_loop.poll_cycle(dec!(130)).await.unwrap();
    let buy_id = grid_loop.rungs()[1].buy_order_id.clone().unwrap();

    // Buy fills, paired sell goes one rung above at 150.
    h.exchange.fill_order(&buy_id, dec!(125)).await;
    grid_loop.poll_cycle(dec!(130)).await.unwrap();
    assert_eq!(grid_loop.rungs()[1].status, GridRungStatus::SellPlaced);
    assert_eq!(grid_loop.rungs()[1].sell_price, Some(dec!(150)));

    // Sell fills: profit booked net of fees, rung restarts at 125.
    let sell_id = grid_loop.rungs()[1].sell_order_id.clone().unwrap();
    h.exchange.fill_order(&sell_id, dec!(150)).await;
    grid_loop.poll_cycle(dec!(140)).await.unwrap();

    let rung = &grid_loop.rungs()[1];
    assert_eq!(rung.cycles_completed, 1);
    assert_eq!(rung.grid_price, dec!(125));
    assert_eq!(rung.status, GridRungStatus::BuyPlaced);

    let trades = h.store.all_trades().await;
    assert_eq!(trades.len(), 1);
    let qty = trades[0].qty;
    let expected = (dec!(150) - dec!(125)) * qty - (dec!(125) + dec!(150)) * qty * dec!(0.0006);
    assert_eq!(rung.profit, expected);
    assert_eq!(trades[0].pnl, Some(expected));
    assert!(expected > Decimal::ZERO);
}

// ============================================================================
// Grid: restart safety (no duplicate orders after a crash)
// ============================================================================

#[tokio::test]
async fn grid_restart_reconciles_instead_of_replacing() {
    let h = harness(dec!(10000)).await;
    let bot = BotInstance::new(20, 1, "grid", BotType::Grid, "BTCUSDT", 5, dec!(100))
        .with_grid(grid_config());
    h.services.ledger.register_bot(1, 20, dec!(100)).await;

    {
        let (_tx, rx) = watch::channel(false);
        let mut first =
            GridBotLoop::new(bot.clone(), h.services.clone(), GridLoopConfig::default(), rx)
                .unwrap();
        first.prepare().await.unwrap();
        first.poll_cycle(dec!(130)).await.unwrap();
        // Process "crashes" here; ladder with live order ids is persisted.
    }

    let placed_before = h
        .exchange
        .calls()
        .await
        .into_iter()
        .filter(|c| c.starts_with("limit("))
        .count();

    // One resting buy filled while the process was down.
    let persisted = h.store.grid_rungs(20).await.unwrap();
    let buy_id = persisted[0].buy_order_id.clone().unwrap();
    h.exchange.fill_order(&buy_id, dec!(100)).await;

    let (_tx, rx) = watch::channel(false);
    let mut resumed =
        GridBotLoop::new(bot, h.services.clone(), GridLoopConfig::default(), rx).unwrap();
    resumed.prepare().await.unwrap();

    // The fill was applied and no fresh buy orders were submitted by the
    // resume itself.
    assert_eq!(resumed.rungs()[0].status, GridRungStatus::BuyFilled);
    let placed_after = h
        .exchange
        .calls()
        .await
        .into_iter()
        .filter(|c| c.starts_with("limit("))
        .count();
    assert_eq!(placed_before, placed_after);
}

// ============================================================================
// Recovery: fatal error stops the bot through the orchestrator
// ============================================================================

#[tokio::test]
async fn fatal_error_stops_bot_and_records_reason() {
    let h = harness(dec!(10000)).await;
    let orchestrator = Arc::new(
        BotOrchestrator::new(h.services.clone()).with_grid_config(GridLoopConfig {
            tick_wait: Duration::from_millis(50),
            check_interval: Duration::from_millis(50),
            ..Default::default()
        }),
    );

    let bot = BotInstance::new(30, 1, "doomed-grid", BotType::Grid, "BTCUSDT", 5, dec!(100))
        .with_grid(grid_config());
    h.store.save_bot(&bot).await.unwrap();

    // The first exchange call the loop makes (the REST price fallback,
    // since the feed is silent) fails with a non-recoverable auth error.
    h.exchange.fail_next_with("API key invalid").await;

    orchestrator.start_instance(30, 1).await.unwrap();

    let mut stopped = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if !orchestrator.is_instance_running(30).await {
            stopped = true;
            break;
        }
    }
    assert!(stopped, "bot should stop after a fatal classification");

    let bot = h.store.bot(30).await.unwrap().unwrap();
    assert!(!bot.is_running);
    assert!(bot.last_error.as_deref().unwrap_or("").contains("ApiKey"));
    assert_eq!(
        orchestrator.runtime_status(30).await.unwrap(),
        BotRuntimeStatus::DbStoppedMemoryStopped
    );

    let events = h.notifier.events().await;
    assert!(events.iter().any(|e| e.starts_with("bot_stopped:1:30")));
}

// ============================================================================
// Orchestrator: full start/stop round trip over the public API
// ============================================================================

#[tokio::test]
async fn orchestrator_start_stop_contract() {
    let h = harness(dec!(1000)).await;
    let orchestrator = Arc::new(
        BotOrchestrator::new(h.services.clone()).with_stop_grace(Duration::from_secs(2)),
    );

    h.store.save_bot(&trend_bot(1, 100, "ETHUSDT", dec!(40))).await.unwrap();
    h.store.save_bot(&trend_bot(2, 100, "BTCUSDT", dec!(40))).await.unwrap();
    h.store.save_bot(&trend_bot(3, 200, "ETHUSDT", dec!(80))).await.unwrap();

    orchestrator.startup().await.unwrap();
    orchestrator.start_instance(1, 100).await.unwrap();
    orchestrator.start_instance(2, 100).await.unwrap();
    orchestrator.start_instance(3, 200).await.unwrap();

    assert_eq!(
        orchestrator.get_user_running_bots(100).await,
        std::collections::HashSet::from([1, 2])
    );
    assert_eq!(
        orchestrator.get_user_running_bots(200).await,
        std::collections::HashSet::from([3])
    );

    orchestrator.stop_instance(1, 100).await.unwrap();
    assert!(!orchestrator.is_instance_running(1).await);
    assert!(orchestrator.is_instance_running(2).await);

    orchestrator.stop_all().await;
    assert!(orchestrator.get_user_running_bots(100).await.is_empty());
    assert!(orchestrator.get_user_running_bots(200).await.is_empty());

    let events = h.notifier.events().await;
    assert!(events.iter().filter(|e| e.starts_with("bot_started")).count() >= 3);
}
