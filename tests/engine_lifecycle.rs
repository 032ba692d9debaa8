//! End-to-end engine behavior against a scripted in-memory broker:
//! entry scan through fill and exit placement, duplicate-entry protection,
//! and orphan adoption by the reconciler.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use skimmer::broker::{BrokerClient, MarketDataClient, Trade};
use skimmer::config::{
    AppConfig, BrokerConfig, DryRunConfig, EntryConfig, LifecycleConfig, LoggingConfig,
    PricingConfig, QuotesConfig, ReconciliationConfig, RiskConfig, SymbolsConfig,
};
use skimmer::domain::{
    Account, Asset, Bar, Clock, Order, OrderRequest, OrderSide, OrderStatus, OrderType, Orderbook,
    Position, Quote, QuoteSource, SymbolKey, TimeInForce,
};
use skimmer::error::{Result, SkimmerError};
use skimmer::Engine;

#[derive(Default)]
struct BrokerState {
    orders: HashMap<String, Order>,
    positions: Vec<Position>,
    submitted: Vec<OrderRequest>,
}

struct MockBroker {
    state: Mutex<BrokerState>,
    next_id: AtomicU64,
    quote: Mutex<Quote>,
    /// When set, limit buys rest on the book instead of filling instantly.
    rest_limit_buys: AtomicBool,
    /// Quantity an IOC sell fills before cancelling; None fills fully.
    ioc_sell_fill: Mutex<Option<Decimal>>,
    market_open: AtomicBool,
}

impl MockBroker {
    fn new(symbol: &SymbolKey, bid: Decimal, ask: Decimal) -> Self {
        Self {
            state: Mutex::new(BrokerState::default()),
            next_id: AtomicU64::new(1),
            quote: Mutex::new(
                Quote::new(symbol, bid, ask, Utc::now(), QuoteSource::Quotes).unwrap(),
            ),
            rest_limit_buys: AtomicBool::new(false),
            ioc_sell_fill: Mutex::new(None),
            market_open: AtomicBool::new(true),
        }
    }

    fn set_quote(&self, symbol: &SymbolKey, bid: Decimal, ask: Decimal) {
        *self.quote.lock().unwrap() =
            Quote::new(symbol, bid, ask, Utc::now(), QuoteSource::Quotes).unwrap();
    }

    fn seed_position(&self, symbol: &SymbolKey, qty: Decimal, avg: Decimal) {
        self.state.lock().unwrap().positions.push(Position {
            symbol: symbol.clone(),
            qty,
            avg_entry_price: avg,
            market_value: None,
            unrealized_pnl: None,
        });
    }

    fn seed_open_sell(&self, symbol: &SymbolKey, id: &str, qty: Decimal, limit: Decimal) {
        self.state.lock().unwrap().orders.insert(
            id.to_string(),
            Order {
                id: id.to_string(),
                client_order_id: format!("external-{id}"),
                symbol: symbol.clone(),
                side: OrderSide::Sell,
                order_type: skimmer::domain::OrderType::Limit,
                qty,
                filled_qty: Decimal::ZERO,
                limit_price: Some(limit),
                filled_avg_price: None,
                max_fill_price: None,
                status: OrderStatus::Accepted,
                submitted_at: Utc::now(),
                legs: vec![],
            },
        );
    }

    fn submitted_count(&self) -> usize {
        self.state.lock().unwrap().submitted.len()
    }

    fn submitted_sides(&self) -> Vec<OrderSide> {
        self.state
            .lock()
            .unwrap()
            .submitted
            .iter()
            .map(|r| r.side)
            .collect()
    }
}

#[async_trait]
impl BrokerClient for MockBroker {
    fn is_dry_run(&self) -> bool {
        false
    }

    async fn get_account(&self) -> Result<Account> {
        Ok(Account {
            buying_power: dec!(10000),
            cash: dec!(10000),
            equity: dec!(10000),
            trading_blocked: false,
        })
    }

    async fn get_positions(&self) -> Result<Vec<Position>> {
        Ok(self.state.lock().unwrap().positions.clone())
    }

    async fn get_position(&self, symbol: &SymbolKey) -> Result<Option<Position>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .positions
            .iter()
            .find(|p| &p.symbol == symbol)
            .cloned())
    }

    async fn get_open_orders(&self) -> Result<Vec<Order>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .orders
            .values()
            .filter(|o| o.status.is_active())
            .cloned()
            .collect())
    }

    async fn get_order(&self, order_id: &str) -> Result<Order> {
        self.state
            .lock()
            .unwrap()
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| SkimmerError::OrderNotFound {
                order_id: order_id.to_string(),
            })
    }

    async fn submit_order(&self, request: &OrderRequest) -> Result<Order> {
        let id = format!("ord-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let quote = self.quote.lock().unwrap().clone();
        let mut state = self.state.lock().unwrap();
        state.submitted.push(request.clone());

        // Marketable orders fill instantly at the touch; GTC limit sells
        // rest on the book; limit buys rest only when configured to.
        let (status, filled_qty, filled_avg) = match (request.side, request.order_type) {
            (OrderSide::Buy, OrderType::Limit)
                if self.rest_limit_buys.load(Ordering::SeqCst) =>
            {
                (OrderStatus::Accepted, Decimal::ZERO, None)
            }
            (OrderSide::Buy, OrderType::Limit) => {
                (OrderStatus::Filled, request.qty, request.limit_price)
            }
            (OrderSide::Buy, OrderType::Market) => {
                (OrderStatus::Filled, request.qty, Some(quote.ask))
            }
            (OrderSide::Sell, OrderType::Market) => {
                (OrderStatus::Filled, request.qty, Some(quote.bid))
            }
            (OrderSide::Sell, OrderType::Limit)
                if request.time_in_force == TimeInForce::Ioc =>
            {
                let fill = self
                    .ioc_sell_fill
                    .lock()
                    .unwrap()
                    .unwrap_or(request.qty)
                    .min(request.qty);
                let status = if fill == request.qty {
                    OrderStatus::Filled
                } else {
                    OrderStatus::Canceled
                };
                let avg = (fill > Decimal::ZERO).then_some(request.limit_price).flatten();
                (status, fill, avg)
            }
            (OrderSide::Sell, OrderType::Limit) => (OrderStatus::Accepted, Decimal::ZERO, None),
        };
        let order = Order {
            id: id.clone(),
            client_order_id: request.client_order_id.as_str().to_string(),
            symbol: request.symbol.clone(),
            side: request.side,
            order_type: request.order_type,
            qty: request.qty,
            filled_qty,
            limit_price: request.limit_price,
            filled_avg_price: filled_avg,
            max_fill_price: filled_avg,
            status,
            submitted_at: Utc::now(),
            legs: vec![],
        };
        if request.side == OrderSide::Buy && filled_qty > Decimal::ZERO {
            state.positions.push(Position {
                symbol: request.symbol.clone(),
                qty: filled_qty,
                avg_entry_price: filled_avg.unwrap_or(Decimal::ZERO),
                market_value: None,
                unrealized_pnl: None,
            });
        }
        state.orders.insert(id, order.clone());
        Ok(order)
    }

    async fn replace_order(
        &self,
        order_id: &str,
        limit_price: Decimal,
        _qty: Option<Decimal>,
    ) -> Result<Order> {
        let mut state = self.state.lock().unwrap();
        let mut order = state
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| SkimmerError::OrderNotFound {
                order_id: order_id.to_string(),
            })?;
        order.limit_price = Some(limit_price);
        state.orders.insert(order_id.to_string(), order.clone());
        Ok(order)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        match state.orders.get_mut(order_id) {
            Some(order) if order.status.is_active() => {
                order.status = OrderStatus::Canceled;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(SkimmerError::OrderNotFound {
                order_id: order_id.to_string(),
            }),
        }
    }

    async fn get_asset(&self, symbol: &SymbolKey) -> Result<Asset> {
        Ok(Asset {
            symbol: symbol.clone(),
            tradable: true,
            fractionable: true,
            price_increment: Some(dec!(0.01)),
            min_order_size: Some(dec!(0.001)),
        })
    }

    async fn get_clock(&self) -> Result<Clock> {
        Ok(Clock {
            is_open: self.market_open.load(Ordering::SeqCst),
            next_open: Utc::now(),
            next_close: Utc::now() + Duration::hours(8),
        })
    }
}

#[async_trait]
impl MarketDataClient for MockBroker {
    async fn latest_quotes(&self, symbols: &[SymbolKey]) -> Result<HashMap<SymbolKey, Quote>> {
        let mut quote = self.quote.lock().unwrap().clone();
        quote.observed_at = Utc::now();
        let mut out = HashMap::new();
        out.insert(symbols[0].clone(), quote);
        Ok(out)
    }

    async fn latest_trades(&self, _symbols: &[SymbolKey]) -> Result<HashMap<SymbolKey, Trade>> {
        Ok(HashMap::new())
    }

    async fn bars(&self, _symbol: &SymbolKey, limit: usize) -> Result<Vec<Bar>> {
        let start = Utc::now() - Duration::minutes(limit as i64);
        Ok((0..limit)
            .map(|i| Bar {
                open: dec!(100),
                high: dec!(100),
                low: dec!(100),
                close: dec!(100),
                volume: dec!(10),
                timestamp: start + Duration::minutes(i as i64),
            })
            .collect())
    }

    async fn orderbook(&self, symbol: &SymbolKey) -> Result<Orderbook> {
        Err(SkimmerError::NoData {
            symbol: symbol.to_string(),
        })
    }
}

fn test_config() -> AppConfig {
    let mut entry = EntryConfig::default();
    entry.orderbook_gate = false;
    entry.ev_guard = false;
    // Near-zero quote TTL so ticks see quote changes made mid-test.
    let mut quotes = QuotesConfig::default();
    quotes.crypto_ttl_ms = 1;
    AppConfig {
        broker: BrokerConfig {
            trading_url: "http://localhost".into(),
            data_url: "http://localhost".into(),
            key_id: "test".into(),
            secret: "test".into(),
            data_timeout_ms: 1000,
            trading_timeout_ms: 1000,
            trading_concurrency: 4,
            data_concurrency: 8,
            max_retries: 1,
        },
        symbols: SymbolsConfig {
            watch: vec!["BTC/USD".into()],
        },
        quotes,
        entry,
        pricing: PricingConfig::default(),
        lifecycle: LifecycleConfig::default(),
        reconciliation: ReconciliationConfig::default(),
        risk: RiskConfig::default(),
        dry_run: DryRunConfig { enabled: false },
        logging: LoggingConfig::default(),
    }
}

fn sym() -> SymbolKey {
    SymbolKey::parse("BTC/USD").unwrap()
}

fn build_engine(broker: Arc<MockBroker>) -> Arc<Engine> {
    build_engine_with(test_config(), broker)
}

fn build_engine_with(cfg: AppConfig, broker: Arc<MockBroker>) -> Arc<Engine> {
    Arc::new(Engine::new(cfg, broker.clone(), broker).unwrap())
}

#[tokio::test]
async fn entry_fill_then_exit_placement() {
    let broker = Arc::new(MockBroker::new(&sym(), dec!(100.00), dec!(100.01)));
    let engine = build_engine(broker.clone());

    engine.scan_once().await;

    let status = engine.status();
    assert_eq!(status.positions.len(), 1, "position should be tracked");
    let pos = &status.positions[0];
    assert!(pos.qty > Decimal::ZERO);
    assert!(pos.sell_order_id.is_none(), "sell placed on tick, not entry");

    engine.tick_once().await;

    let status = engine.status();
    let pos = &status.positions[0];
    assert!(pos.sell_order_id.is_some(), "tick must cover the position");
    let sides = broker.submitted_sides();
    assert_eq!(sides, vec![OrderSide::Buy, OrderSide::Sell]);

    // The working sell must clear the entry basis.
    let sell_limit = pos.sell_order_limit.unwrap();
    assert!(sell_limit > pos.effective_entry_price);
    assert!(sell_limit >= pos.breakeven_price);
}

#[tokio::test]
async fn no_duplicate_entry_for_held_symbol() {
    let broker = Arc::new(MockBroker::new(&sym(), dec!(100.00), dec!(100.01)));
    let engine = build_engine(broker.clone());

    engine.scan_once().await;
    let after_first = broker.submitted_count();
    assert_eq!(after_first, 1);

    // Second and third scans: symbol is tracked, nothing new goes out.
    engine.scan_once().await;
    engine.scan_once().await;
    assert_eq!(broker.submitted_count(), after_first);
}

#[tokio::test]
async fn scan_reconciles_before_entering() {
    let broker = Arc::new(MockBroker::new(&sym(), dec!(100.00), dec!(100.01)));
    // The broker holds a position this engine never opened (restart, or a
    // fill the previous process missed).
    broker.seed_position(&sym(), dec!(10), dec!(100));

    let engine = build_engine(broker.clone());
    engine.scan_once().await;

    // The scan must adopt the orphan, not buy on top of it.
    assert_eq!(broker.submitted_count(), 0);
    let status = engine.status();
    assert_eq!(status.positions.len(), 1);
    assert_eq!(status.positions[0].qty, dec!(10));
    assert!(status.entries_halted.is_none());
}

#[tokio::test]
async fn taker_flip_sweeps_remainder_with_market_order() {
    let broker = Arc::new(MockBroker::new(&sym(), dec!(100.00), dec!(100.01)));
    let engine = build_engine(broker.clone());

    engine.scan_once().await; // buy 9.999 @ 100.01
    engine.tick_once().await; // maker sell placed

    // Bid runs through the taker target, but the IOC only fills part.
    *broker.ioc_sell_fill.lock().unwrap() = Some(dec!(4));
    broker.set_quote(&sym(), dec!(102.00), dec!(102.02));
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;

    engine.tick_once().await;

    // Two realized slices: the IOC fill and the market-order remainder.
    let status = engine.status();
    assert_eq!(status.pnl.trades, 2);
    assert!(status.positions.is_empty(), "position must be fully closed");

    let submitted = broker.state.lock().unwrap().submitted.clone();
    let remainder = submitted
        .iter()
        .find(|r| r.side == OrderSide::Sell && r.order_type == OrderType::Market)
        .expect("remainder must go out as a market order");
    assert_eq!(remainder.qty, dec!(5.999));
}

#[tokio::test]
async fn cancelled_sell_partial_fill_books_a_slice() {
    let broker = Arc::new(MockBroker::new(&sym(), dec!(100.00), dec!(100.01)));
    let engine = build_engine(broker.clone());

    engine.scan_once().await;
    engine.tick_once().await;
    let sell_id = engine.status().positions[0]
        .sell_order_id
        .clone()
        .expect("maker sell must be working");

    // The broker cancels the sell after a partial fill (venue-side cancel).
    {
        let mut state = broker.state.lock().unwrap();
        let order = state.orders.get_mut(&sell_id).unwrap();
        order.status = OrderStatus::Canceled;
        order.filled_qty = dec!(4);
        order.filled_avg_price = Some(dec!(101));
    }

    engine.tick_once().await;

    let status = engine.status();
    // The filled portion is realized, the rest re-covered.
    assert_eq!(status.pnl.trades, 1);
    assert_eq!(status.positions.len(), 1);
    let pos = &status.positions[0];
    assert_eq!(pos.qty, dec!(5.999));
    let new_sell = pos.sell_order_id.clone().expect("replacement sell");
    assert_ne!(new_sell, sell_id);

    let submitted = broker.state.lock().unwrap().submitted.clone();
    assert_eq!(submitted.last().unwrap().qty, dec!(5.999));
}

fn fallback_config() -> AppConfig {
    let mut cfg = test_config();
    cfg.lifecycle.market_fallback = true;
    cfg.lifecycle.entry_timeout_ms = 100;
    cfg.lifecycle.poll_interval_ms = 10;
    cfg
}

#[tokio::test]
async fn market_fallback_skipped_when_spread_widens() {
    let broker = Arc::new(MockBroker::new(&sym(), dec!(100.00), dec!(100.01)));
    broker.rest_limit_buys.store(true, Ordering::SeqCst);
    let engine = build_engine_with(fallback_config(), broker.clone());

    // The book blows out while the limit entry waits for a fill.
    let widen = async {
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        broker.set_quote(&sym(), dec!(99.00), dec!(100.00));
    };
    tokio::join!(engine.scan_once(), widen);

    assert!(engine.status().positions.is_empty());
    let submitted = broker.state.lock().unwrap().submitted.clone();
    assert_eq!(submitted.len(), 1, "only the resting limit buy goes out");
    assert_eq!(submitted[0].order_type, OrderType::Limit);
}

#[tokio::test]
async fn market_fallback_pays_taker_fee_on_entry() {
    let broker = Arc::new(MockBroker::new(&sym(), dec!(100.00), dec!(100.01)));
    broker.rest_limit_buys.store(true, Ordering::SeqCst);
    let engine = build_engine_with(fallback_config(), broker.clone());

    // Spread stays tight through the timeout: fallback fires and fills.
    engine.scan_once().await;

    let status = engine.status();
    assert_eq!(status.positions.len(), 1);
    let submitted = broker.state.lock().unwrap().submitted.clone();
    assert!(submitted
        .iter()
        .any(|r| r.side == OrderSide::Buy && r.order_type == OrderType::Market));

    // Breakeven carries the taker fee on both legs: 100.01 * 1.0050,
    // rounded up to the tick. A maker entry basis would give 100.42.
    assert_eq!(status.positions[0].breakeven_price, dec!(100.52));
}

#[tokio::test]
async fn equity_scan_waits_for_market_open() {
    let aapl = SymbolKey::parse("AAPL").unwrap();
    let broker = Arc::new(MockBroker::new(&aapl, dec!(100.00), dec!(100.01)));
    broker.market_open.store(false, Ordering::SeqCst);

    let mut cfg = test_config();
    cfg.symbols.watch = vec!["AAPL".into()];
    let engine = build_engine_with(cfg, broker.clone());

    engine.scan_once().await;
    assert_eq!(broker.submitted_count(), 0, "closed session must not trade");

    broker.market_open.store(true, Ordering::SeqCst);
    engine.scan_once().await;
    assert_eq!(broker.submitted_count(), 1);
    assert_eq!(engine.status().positions.len(), 1);
}

#[tokio::test]
async fn reconciler_adopts_orphan_with_matching_sell() {
    let broker = Arc::new(MockBroker::new(&sym(), dec!(50.00), dec!(50.02)));
    // A position opened by a previous run, with its exit still working.
    broker.seed_position(&sym(), dec!(10), dec!(50));
    broker.seed_open_sell(&sym(), "s1", dec!(10), dec!(52));

    let engine = build_engine(broker.clone());

    let report = engine.reconcile_once().await.unwrap();
    assert_eq!(report.orphans_found, 1);
    assert_eq!(report.adopted, 1);
    assert_eq!(report.adopted_with_sell, 1);

    let status = engine.status();
    assert_eq!(status.positions.len(), 1);
    let pos = &status.positions[0];
    assert_eq!(pos.qty, dec!(10));
    assert_eq!(pos.entry_price, dec!(50));
    assert_eq!(pos.sell_order_id.as_deref(), Some("s1"));
    assert_eq!(pos.sell_order_limit, Some(dec!(52)));

    // Repair succeeded, so entries must not stay halted.
    assert!(status.entries_halted.is_none());

    // A second pass finds nothing to heal.
    let report = engine.reconcile_once().await.unwrap();
    assert_eq!(report.orphans_found, 0);
    assert!(report.is_clean());
}

#[tokio::test]
async fn reconciler_untracks_externally_closed_position() {
    let broker = Arc::new(MockBroker::new(&sym(), dec!(100.00), dec!(100.01)));
    let engine = build_engine(broker.clone());

    engine.scan_once().await;
    assert_eq!(engine.status().positions.len(), 1);

    // The position disappears at the broker (manual flatten).
    broker.state.lock().unwrap().positions.clear();

    let report = engine.reconcile_once().await.unwrap();
    assert_eq!(report.closed_externally, 1);
    assert!(engine.status().positions.is_empty());
}
