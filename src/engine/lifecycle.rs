//! Per-symbol order lifecycle: one `ExitState` per open position, a pure
//! decision function, and the async tick driver that executes its verdicts.
//!
//! Ticks never queue behind each other: a symbol whose state mutex is held
//! is skipped and picked up on the next interval. A working sell order is
//! only ever cancelled inside an atomic replace or taker flip; the engine
//! never leaves a position uncovered on purpose.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::broker::BrokerClient;
use crate::config::LifecycleConfig;
use crate::domain::{Order, OrderIntent, OrderRequest, OrderSide, Quote, SymbolKey};
use crate::engine::guard::ConcurrencyGuard;
use crate::engine::pnl::{PnlLog, RealizedPnl};
use crate::engine::quotes::QuoteService;
use crate::error::{Result, SkimmerError};

const BPS: Decimal = Decimal::from_parts(10_000, 0, 0, false, 0);

/// Everything the tick needs to manage one open position.
#[derive(Debug, Clone, Serialize)]
pub struct ExitState {
    pub symbol: SymbolKey,
    pub qty: Decimal,
    /// Average entry fill price.
    pub entry_price: Decimal,
    /// Conservative entry basis (maximum observed fill price). All exit
    /// targets derive from this, never from the average.
    pub effective_entry_price: Decimal,
    pub entry_time: DateTime<Utc>,
    pub entry_order_id: Option<String>,
    /// Required gross move for a maker exit (bps over effective entry).
    pub required_exit_bps: Decimal,
    /// Required gross move when crossing the spread as a taker (bps).
    pub taker_required_bps: Decimal,
    pub target_price: Decimal,
    pub breakeven_price: Decimal,
    pub stop_price: Decimal,
    pub tick_size: Decimal,
    pub sell_order_id: Option<String>,
    pub sell_order_submitted_at: Option<DateTime<Utc>>,
    pub sell_order_limit: Option<Decimal>,
    pub last_bid: Option<Decimal>,
    pub last_ask: Option<Decimal>,
}

impl ExitState {
    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.entry_time).num_seconds()
    }

    /// Price at which a taker exit still nets the required move.
    pub fn taker_target_price(&self) -> Decimal {
        self.effective_entry_price * (Decimal::ONE + self.taker_required_bps / BPS)
    }

    fn sell_order_age_secs(&self, now: DateTime<Utc>) -> Option<i64> {
        self.sell_order_submitted_at
            .map(|t| (now - t).num_seconds())
    }
}

/// Verdict of one management tick. One decision per tick; the taker flip
/// settles its own unfilled remainder with a market order.
#[derive(Debug, Clone, PartialEq)]
pub enum TickAction {
    Hold,
    /// Place the resting maker sell at `limit`.
    SubmitMakerSell { limit: Decimal },
    /// Atomically replace the working sell's limit price.
    Reprice { order_id: String, limit: Decimal },
    /// Cross the spread now: cancel the resting sell (when present) and
    /// submit an IOC limit at `limit`. The intent records why.
    TakerFlip {
        cancel: Option<String>,
        limit: Decimal,
        intent: OrderIntent,
    },
}

/// Pure per-tick decision. Priority order, first match wins:
/// taker flip on touch, hard stop, force exit, max-hold harvest,
/// ensure the maker sell exists, reprice it, hold.
///
/// `action_allowed` is the per-symbol action cooldown. It throttles the
/// discretionary actions (taker flip, max-hold harvest, reprice) but
/// never the loss protection: the hard stop and an expired force-exit
/// deadline fire on the same tick they trigger, cooldown or not.
///
/// The maker sell is (re)created whenever none is working, without
/// waiting for the ask to reach breakeven: an uncovered position is a
/// bigger exposure than a sell resting above the market.
pub fn decide(
    state: &ExitState,
    quote: &Quote,
    cfg: &LifecycleConfig,
    action_allowed: bool,
    now: DateTime<Utc>,
) -> TickAction {
    let bid = quote.bid;

    // 1. Taker flip: the bid already clears the taker-fee-adjusted target,
    //    so crossing the spread locks the profit instead of waiting for a
    //    maker fill that may never come.
    if cfg.taker_exits && bid >= state.taker_target_price() && action_allowed {
        return TickAction::TakerFlip {
            cancel: state.sell_order_id.clone(),
            limit: bid,
            intent: OrderIntent::TakerExit,
        };
    }

    // 2. Hard stop. Not subject to the action cooldown.
    if bid <= state.stop_price {
        return TickAction::TakerFlip {
            cancel: state.sell_order_id.clone(),
            limit: bid,
            intent: OrderIntent::StopExit,
        };
    }

    let age = state.age_secs(now);

    // 3. Force exit after the hard deadline, also cooldown-exempt. Without
    //    the at-loss flag this only fires once the bid covers breakeven.
    if age >= cfg.force_exit_secs as i64 && (cfg.force_exit_at_loss || bid >= state.breakeven_price)
    {
        return TickAction::TakerFlip {
            cancel: state.sell_order_id.clone(),
            limit: bid,
            intent: OrderIntent::ForceExit,
        };
    }

    // 4. Max-hold harvest: past the soft deadline, take any profitable bid.
    if age >= cfg.max_hold_secs as i64 && bid >= state.breakeven_price && action_allowed {
        return TickAction::TakerFlip {
            cancel: state.sell_order_id.clone(),
            limit: bid,
            intent: OrderIntent::ForceExit,
        };
    }

    // 5. The position must always have a working sell.
    let Some(order_id) = state.sell_order_id.clone() else {
        return TickAction::SubmitMakerSell {
            limit: state.target_price,
        };
    };

    // 6. Reprice toward the current target, but only when the resting
    //    order has aged, the distance is material, the action cooldown has
    //    lapsed, and never below breakeven.
    if let Some(current_limit) = state.sell_order_limit {
        let desired = state.target_price.max(state.breakeven_price);
        if desired > Decimal::ZERO && current_limit > Decimal::ZERO {
            let distance_bps = ((current_limit - desired).abs() / desired) * BPS;
            let aged = state
                .sell_order_age_secs(now)
                .is_some_and(|a| a >= cfg.reprice_min_age_secs as i64);
            if aged && distance_bps >= cfg.reprice_min_distance_bps && action_allowed {
                return TickAction::Reprice {
                    order_id,
                    limit: desired,
                };
            }
        }
    }

    TickAction::Hold
}

/// Drives the per-symbol state machines against the live broker.
pub struct LifecycleEngine {
    broker: Arc<dyn BrokerClient>,
    quotes: Arc<QuoteService>,
    guard: Arc<ConcurrencyGuard>,
    pnl: Arc<PnlLog>,
    cfg: LifecycleConfig,
    max_quote_age_ms: i64,
    arena: DashMap<SymbolKey, Arc<Mutex<ExitState>>>,
}

impl LifecycleEngine {
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        quotes: Arc<QuoteService>,
        guard: Arc<ConcurrencyGuard>,
        pnl: Arc<PnlLog>,
        cfg: LifecycleConfig,
        max_quote_age_ms: i64,
    ) -> Self {
        Self {
            broker,
            quotes,
            guard,
            pnl,
            cfg,
            max_quote_age_ms,
            arena: DashMap::new(),
        }
    }

    pub fn attach(&self, state: ExitState) {
        info!(
            symbol = %state.symbol,
            qty = %state.qty,
            entry = %state.effective_entry_price,
            target = %state.target_price,
            "tracking position"
        );
        self.arena
            .insert(state.symbol.clone(), Arc::new(Mutex::new(state)));
    }

    pub fn tracked_symbols(&self) -> Vec<SymbolKey> {
        self.arena.iter().map(|e| e.key().clone()).collect()
    }

    pub fn active_count(&self) -> usize {
        self.arena.len()
    }

    pub fn is_tracked(&self, symbol: &SymbolKey) -> bool {
        self.arena.contains_key(symbol)
    }

    pub fn snapshot(&self, symbol: &SymbolKey) -> Option<ExitState> {
        let entry = self.arena.get(symbol)?;
        entry.value().try_lock().ok().map(|s| s.clone())
    }

    pub fn snapshots(&self) -> Vec<ExitState> {
        self.arena
            .iter()
            .filter_map(|e| e.value().try_lock().ok().map(|s| s.clone()))
            .collect()
    }

    /// Mutate a tracked state under its lock; used by the reconciler.
    pub async fn with_state<F>(&self, symbol: &SymbolKey, f: F) -> bool
    where
        F: FnOnce(&mut ExitState),
    {
        let Some(entry) = self.arena.get(symbol).map(|e| e.value().clone()) else {
            return false;
        };
        let mut state = entry.lock().await;
        f(&mut state);
        true
    }

    pub fn untrack(&self, symbol: &SymbolKey) {
        self.arena.remove(symbol);
        self.guard.forget_symbol(symbol);
        self.quotes.forget(symbol);
    }

    /// One pass over every tracked symbol, ticking them concurrently.
    /// Held locks are skipped, never awaited.
    pub async fn tick_all(&self) {
        let entries: Vec<(SymbolKey, Arc<Mutex<ExitState>>)> = self
            .arena
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let ticks = entries.into_iter().map(|(symbol, lock)| async move {
            let Ok(mut state) = lock.try_lock() else {
                debug!(symbol = %symbol, "tick skipped, state busy");
                return;
            };
            if let Err(e) = self.tick_symbol(&mut state).await {
                if e.is_skip() {
                    debug!(symbol = %symbol, "tick deferred: {e}");
                } else {
                    warn!(symbol = %symbol, "tick failed: {e}");
                }
            }
        });
        join_all(ticks).await;
        self.sweep_closed().await;
    }

    /// Refresh the sell order, pick an action, execute it.
    async fn tick_symbol(&self, state: &mut ExitState) -> Result<()> {
        if self.refresh_sell_order(state).await? {
            // Position closed; swept by the caller.
            return Ok(());
        }

        let quote = match self
            .quotes
            .get_quote(&state.symbol, self.max_quote_age_ms)
            .await
        {
            Ok(q) => q,
            Err(
                e @ (SkimmerError::StaleQuote { .. }
                | SkimmerError::QuoteCooldown { .. }
                | SkimmerError::MarketDataCooldown { .. }
                | SkimmerError::NoData { .. }),
            ) => {
                // Stale or cooled-down feed: manage on the last known quote
                // rather than going blind.
                match self.quotes.last_known(&state.symbol) {
                    Some(q) => {
                        debug!(symbol = %state.symbol, "managing on last known quote: {e}");
                        q
                    }
                    None => return Err(e),
                }
            }
            Err(e) => return Err(e),
        };

        state.last_bid = Some(quote.bid);
        state.last_ask = Some(quote.ask);

        let now = Utc::now();
        let action_allowed = self.guard.action_allowed(
            &state.symbol,
            Duration::seconds(self.cfg.action_cooldown_secs as i64),
            now,
        );
        let action = decide(state, &quote, &self.cfg, action_allowed, now);
        self.execute(state, action, now).await
    }

    /// Poll the working sell. Returns true when the position fully closed.
    async fn refresh_sell_order(&self, state: &mut ExitState) -> Result<bool> {
        let Some(order_id) = state.sell_order_id.clone() else {
            return Ok(false);
        };

        let order = match self.broker.get_order(&order_id).await {
            Ok(o) => o,
            Err(SkimmerError::OrderNotFound { .. }) => {
                warn!(symbol = %state.symbol, %order_id, "working sell vanished");
                state.sell_order_id = None;
                state.sell_order_submitted_at = None;
                state.sell_order_limit = None;
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        match order.status {
            s if s == crate::domain::OrderStatus::Filled => {
                self.record_close(state, &order);
                Ok(true)
            }
            s if s.is_terminal() => {
                debug!(symbol = %state.symbol, status = ?s, "sell order terminal, will re-cover");
                if order.filled_qty > Decimal::ZERO {
                    let price = order
                        .filled_avg_price
                        .or(order.limit_price)
                        .unwrap_or(state.target_price);
                    self.record_slice(state, order.filled_qty, price);
                }
                state.sell_order_id = None;
                state.sell_order_submitted_at = None;
                state.sell_order_limit = None;
                Ok(state.qty <= Decimal::ZERO)
            }
            _ => Ok(false),
        }
    }

    async fn execute(
        &self,
        state: &mut ExitState,
        action: TickAction,
        now: DateTime<Utc>,
    ) -> Result<()> {
        match action {
            TickAction::Hold => Ok(()),

            TickAction::SubmitMakerSell { limit } => {
                let request = OrderRequest::limit(
                    state.symbol.clone(),
                    OrderSide::Sell,
                    OrderIntent::Exit,
                    state.qty,
                    limit,
                );
                info!(symbol = %state.symbol, %limit, qty = %state.qty, "placing maker sell");
                let order = self.broker.submit_order(&request).await?;
                state.sell_order_id = Some(order.id);
                state.sell_order_submitted_at = Some(now);
                state.sell_order_limit = Some(limit);
                Ok(())
            }

            TickAction::Reprice { order_id, limit } => {
                info!(
                    symbol = %state.symbol,
                    from = ?state.sell_order_limit,
                    to = %limit,
                    "repricing sell"
                );
                let replaced = self.broker.replace_order(&order_id, limit, None).await?;
                state.sell_order_id = Some(replaced.id);
                state.sell_order_submitted_at = Some(now);
                state.sell_order_limit = Some(limit);
                self.guard.record_action(&state.symbol, now);
                Ok(())
            }

            TickAction::TakerFlip {
                cancel,
                limit,
                intent,
            } => {
                if let Some(order_id) = cancel {
                    // Cancel inside the flip only; a false return means the
                    // broker already saw the order terminal, in which case
                    // the next refresh settles the quantity first.
                    if !self.broker.cancel_order(&order_id).await? {
                        debug!(symbol = %state.symbol, %order_id, "cancel raced a terminal order");
                        state.sell_order_id = Some(order_id);
                        return Ok(());
                    }
                    state.sell_order_id = None;
                    state.sell_order_submitted_at = None;
                    state.sell_order_limit = None;
                }

                let request = OrderRequest::ioc_limit(
                    state.symbol.clone(),
                    OrderSide::Sell,
                    intent,
                    state.qty,
                    limit,
                );
                info!(symbol = %state.symbol, %limit, %intent, "crossing the spread to exit");
                let order = self.broker.submit_order(&request).await?;
                self.guard.record_action(&state.symbol, now);

                // IOC settles immediately in either direction.
                let settled = self.broker.get_order(&order.id).await.unwrap_or(order);
                if settled.status == crate::domain::OrderStatus::Filled {
                    self.record_close(state, &settled);
                    return Ok(());
                }
                if settled.filled_qty > Decimal::ZERO {
                    let price = settled
                        .filled_avg_price
                        .or(settled.limit_price)
                        .unwrap_or(limit);
                    self.record_slice(state, settled.filled_qty, price);
                }

                // Any unfilled remainder goes out as a market order; the
                // taker and stop paths must not leave the position
                // half-exited on the book.
                if state.qty > Decimal::ZERO {
                    warn!(
                        symbol = %state.symbol,
                        remaining = %state.qty,
                        %intent,
                        "taker leg left a remainder, sending market order"
                    );
                    let fallback = OrderRequest::market(
                        state.symbol.clone(),
                        OrderSide::Sell,
                        intent,
                        state.qty,
                    );
                    let market = self.broker.submit_order(&fallback).await?;
                    let settled = self.broker.get_order(&market.id).await.unwrap_or(market);
                    if settled.status == crate::domain::OrderStatus::Filled {
                        self.record_close(state, &settled);
                    } else {
                        // Track it so the next refresh settles the fill.
                        state.sell_order_id = Some(settled.id);
                        state.sell_order_submitted_at = Some(now);
                        state.sell_order_limit = None;
                    }
                }
                Ok(())
            }
        }
    }

    /// Book a realized slice for a partial exit fill and shrink the open
    /// quantity accordingly.
    fn record_slice(&self, state: &mut ExitState, qty: Decimal, exit_price: Decimal) {
        if qty <= Decimal::ZERO {
            return;
        }
        let record = RealizedPnl::new(
            &state.symbol,
            qty,
            state.entry_price,
            exit_price,
            state.entry_time,
            Utc::now(),
        );
        info!(
            symbol = %state.symbol,
            qty = %qty,
            exit = %exit_price,
            gross = %record.gross_pnl,
            "partial exit filled"
        );
        self.pnl.record(record);
        state.qty = (state.qty - qty).max(Decimal::ZERO);
    }

    fn record_close(&self, state: &mut ExitState, order: &Order) {
        let exit_price = order
            .filled_avg_price
            .or(order.limit_price)
            .unwrap_or(state.target_price);
        let record = RealizedPnl::new(
            &state.symbol,
            state.qty,
            state.entry_price,
            exit_price,
            state.entry_time,
            Utc::now(),
        );
        info!(
            symbol = %state.symbol,
            qty = %state.qty,
            entry = %state.entry_price,
            exit = %exit_price,
            gross = %record.gross_pnl,
            "position closed"
        );
        self.pnl.record(record);
        // Mark for the sweep; removal happens outside the lock.
        state.qty = Decimal::ZERO;
        state.sell_order_id = None;
    }

    /// Remove states whose quantity hit zero.
    async fn sweep_closed(&self) {
        let closed: Vec<SymbolKey> = self
            .arena
            .iter()
            .filter_map(|e| {
                e.value()
                    .try_lock()
                    .ok()
                    .filter(|s| s.qty <= Decimal::ZERO)
                    .map(|_| e.key().clone())
            })
            .collect();
        for symbol in closed {
            info!(symbol = %symbol, "untracking closed position");
            self.untrack(&symbol);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::QuoteSource;
    use rust_decimal_macros::dec;

    fn state() -> ExitState {
        ExitState {
            symbol: SymbolKey::parse("BTC/USD").unwrap(),
            qty: dec!(0.5),
            entry_price: dec!(100),
            effective_entry_price: dec!(100),
            entry_time: Utc::now(),
            entry_order_id: Some("e1".into()),
            required_exit_bps: dec!(130),
            taker_required_bps: dec!(150),
            target_price: dec!(101.31),
            breakeven_price: dec!(100.31),
            stop_price: dec!(99.40),
            tick_size: dec!(0.01),
            sell_order_id: Some("s1".into()),
            sell_order_submitted_at: Some(Utc::now() - Duration::seconds(60)),
            sell_order_limit: Some(dec!(101.31)),
            last_bid: None,
            last_ask: None,
        }
    }

    fn quote(bid: Decimal, ask: Decimal) -> Quote {
        Quote::new(
            &SymbolKey::parse("BTC/USD").unwrap(),
            bid,
            ask,
            Utc::now(),
            QuoteSource::Quotes,
        )
        .unwrap()
    }

    fn cfg() -> LifecycleConfig {
        LifecycleConfig::default()
    }

    #[test]
    fn holds_when_nothing_to_do() {
        let s = state();
        let action = decide(&s, &quote(dec!(100.5), dec!(100.52)), &cfg(), true, Utc::now());
        assert_eq!(action, TickAction::Hold);
    }

    #[test]
    fn taker_flip_when_bid_clears_taker_target() {
        let s = state();
        // taker target = 100 * 1.0150 = 101.50
        let action = decide(&s, &quote(dec!(101.60), dec!(101.62)), &cfg(), true, Utc::now());
        match action {
            TickAction::TakerFlip { cancel, intent, .. } => {
                assert_eq!(cancel, Some("s1".to_string()));
                assert_eq!(intent, OrderIntent::TakerExit);
            }
            other => panic!("expected taker flip, got {other:?}"),
        }
    }

    #[test]
    fn stop_fires_below_stop_price() {
        let s = state();
        let action = decide(&s, &quote(dec!(99.30), dec!(99.35)), &cfg(), true, Utc::now());
        assert!(matches!(
            action,
            TickAction::TakerFlip {
                intent: OrderIntent::StopExit,
                ..
            }
        ));
    }

    #[test]
    fn force_exit_after_deadline_only_if_profitable_by_default() {
        let mut s = state();
        s.entry_time = Utc::now() - Duration::seconds(20_000);
        let c = cfg();
        assert!(!c.force_exit_at_loss);

        // Bid below breakeven: no forced loss
        let action = decide(&s, &quote(dec!(100.10), dec!(100.12)), &c, true, Utc::now());
        assert_eq!(action, TickAction::Hold);

        // Bid above breakeven: harvest
        let action = decide(&s, &quote(dec!(100.40), dec!(100.42)), &c, true, Utc::now());
        assert!(matches!(
            action,
            TickAction::TakerFlip {
                intent: OrderIntent::ForceExit,
                ..
            }
        ));
    }

    #[test]
    fn force_exit_at_loss_when_enabled() {
        let mut s = state();
        s.entry_time = Utc::now() - Duration::seconds(20_000);
        // Keep the bid above the stop so the force path is exercised
        s.stop_price = dec!(90);
        let mut c = cfg();
        c.force_exit_at_loss = true;
        let action = decide(&s, &quote(dec!(99.50), dec!(99.52)), &c, true, Utc::now());
        assert!(matches!(
            action,
            TickAction::TakerFlip {
                intent: OrderIntent::ForceExit,
                ..
            }
        ));
    }

    #[test]
    fn max_hold_harvests_profitable_position() {
        let mut s = state();
        s.entry_time = Utc::now() - Duration::seconds(4_000); // past 1h, before 4h
        let action = decide(&s, &quote(dec!(100.50), dec!(100.52)), &cfg(), true, Utc::now());
        assert!(matches!(action, TickAction::TakerFlip { .. }));

        // Unprofitable past max-hold: keep waiting
        let action = decide(&s, &quote(dec!(100.10), dec!(100.12)), &cfg(), true, Utc::now());
        assert_eq!(action, TickAction::Hold);
    }

    #[test]
    fn missing_sell_is_recovered() {
        let mut s = state();
        s.sell_order_id = None;
        s.sell_order_limit = None;
        let action = decide(&s, &quote(dec!(100.5), dec!(100.52)), &cfg(), true, Utc::now());
        assert_eq!(
            action,
            TickAction::SubmitMakerSell {
                limit: dec!(101.31)
            }
        );
    }

    #[test]
    fn reprice_requires_age_distance_and_cooldown() {
        let mut s = state();
        s.sell_order_limit = Some(dec!(103)); // ~167 bps off target
        let c = cfg();

        // Fresh order: no reprice
        s.sell_order_submitted_at = Some(Utc::now() - Duration::seconds(5));
        let action = decide(&s, &quote(dec!(100.5), dec!(100.52)), &c, true, Utc::now());
        assert_eq!(action, TickAction::Hold);

        // Aged order: reprice to target
        s.sell_order_submitted_at = Some(Utc::now() - Duration::seconds(60));
        let action = decide(&s, &quote(dec!(100.5), dec!(100.52)), &c, true, Utc::now());
        assert_eq!(
            action,
            TickAction::Reprice {
                order_id: "s1".into(),
                limit: dec!(101.31)
            }
        );

        // Cooldown active: hold even when aged
        let action = decide(&s, &quote(dec!(100.5), dec!(100.52)), &c, false, Utc::now());
        assert_eq!(action, TickAction::Hold);
    }

    #[test]
    fn reprice_never_goes_below_breakeven() {
        let mut s = state();
        s.target_price = dec!(100.20); // below breakeven 100.31
        s.sell_order_limit = Some(dec!(103));
        s.sell_order_submitted_at = Some(Utc::now() - Duration::seconds(60));
        let action = decide(&s, &quote(dec!(100.5), dec!(100.52)), &cfg(), true, Utc::now());
        match action {
            TickAction::Reprice { limit, .. } => assert_eq!(limit, dec!(100.31)),
            other => panic!("expected reprice, got {other:?}"),
        }
    }

    #[test]
    fn cooldown_blocks_taker_flip() {
        let s = state();
        let action = decide(&s, &quote(dec!(101.60), dec!(101.62)), &cfg(), false, Utc::now());
        assert_eq!(action, TickAction::Hold);
    }

    #[test]
    fn stop_fires_during_action_cooldown() {
        // Bid well through the stop while the cooldown is active: the stop
        // must not wait it out.
        let s = state();
        let action = decide(&s, &quote(dec!(95.00), dec!(95.02)), &cfg(), false, Utc::now());
        assert!(matches!(
            action,
            TickAction::TakerFlip {
                intent: OrderIntent::StopExit,
                ..
            }
        ));
    }

    #[test]
    fn force_exit_ignores_action_cooldown() {
        let mut s = state();
        s.entry_time = Utc::now() - Duration::seconds(20_000);
        s.stop_price = dec!(90);
        let mut c = cfg();
        c.force_exit_at_loss = true;
        let action = decide(&s, &quote(dec!(99.50), dec!(99.52)), &c, false, Utc::now());
        assert!(matches!(
            action,
            TickAction::TakerFlip {
                intent: OrderIntent::ForceExit,
                ..
            }
        ));
    }
}
