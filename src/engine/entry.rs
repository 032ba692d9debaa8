//! Entry execution: turns a ready signal into a filled position with an
//! attached exit plan.
//!
//! The whole attempt runs under an in-flight intent marker so a slow fill
//! wait can never race a second attempt for the same symbol. The marker is
//! released on every path out, success or failure.

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::time::{sleep, Duration as StdDuration, Instant};
use tracing::{debug, info, warn};

use crate::broker::BrokerClient;
use crate::config::{LifecycleConfig, PricingConfig, RiskConfig};
use crate::domain::{
    Asset, ClientOrderId, Order, OrderIntent, OrderRequest, OrderSide, OrderType, SymbolKey,
};
use crate::engine::guard::ConcurrencyGuard;
use crate::engine::lifecycle::{ExitState, LifecycleEngine};
use crate::engine::pricing::{self, ExitRequirement};
use crate::engine::quotes::QuoteService;
use crate::engine::signal::EntrySignal;
use crate::error::{Result, SkimmerError};

enum PollOutcome {
    Filled(Order),
    TimedOut(Order),
    Terminal(Order),
}

pub struct EntryExecutor {
    broker: Arc<dyn BrokerClient>,
    quotes: Arc<QuoteService>,
    guard: Arc<ConcurrencyGuard>,
    lifecycle: Arc<LifecycleEngine>,
    cfg: LifecycleConfig,
    pricing_cfg: PricingConfig,
    risk: RiskConfig,
    max_spread_bps: i64,
    max_quote_age_ms: i64,
}

impl EntryExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        quotes: Arc<QuoteService>,
        guard: Arc<ConcurrencyGuard>,
        lifecycle: Arc<LifecycleEngine>,
        cfg: LifecycleConfig,
        pricing_cfg: PricingConfig,
        risk: RiskConfig,
        max_spread_bps: i64,
        max_quote_age_ms: i64,
    ) -> Self {
        Self {
            broker,
            quotes,
            guard,
            lifecycle,
            cfg,
            pricing_cfg,
            risk,
            max_spread_bps,
            max_quote_age_ms,
        }
    }

    /// Attempt one entry for a ready signal. Returns `Ok(true)` when a
    /// position was opened and is now tracked.
    pub async fn try_enter(&self, signal: &EntrySignal) -> Result<bool> {
        let symbol = &signal.symbol;

        if self.lifecycle.is_tracked(symbol) {
            debug!(symbol = %symbol, "already holding, entry skipped");
            return Ok(false);
        }
        if self.risk.max_active_symbols > 0
            && self.lifecycle.active_count() >= self.risk.max_active_symbols
        {
            debug!(symbol = %symbol, "active-symbol cap reached, entry skipped");
            return Ok(false);
        }

        let now = Utc::now();
        // Held for the full attempt; dropped on every return path.
        let _intent = self.guard.begin_entry(
            symbol,
            "signal",
            Duration::seconds(self.cfg.intent_ttl_secs as i64),
            now,
        )?;

        // A working entry from a previous run (or a crashed attempt in the
        // same bucket) also blocks.
        let open_orders = self.broker.get_open_orders().await?;
        if open_orders.iter().any(|o| {
            ClientOrderId::matches_intent(&o.client_order_id, symbol, OrderIntent::Entry)
        }) {
            return Err(SkimmerError::ExistingEntryIntent {
                symbol: symbol.to_string(),
                reason: "open entry order at broker".to_string(),
            });
        }

        let quote = signal
            .quote
            .clone()
            .ok_or_else(|| SkimmerError::Validation("ready signal without quote".to_string()))?;
        let asset = self.broker.get_asset(symbol).await?;
        let account = self.broker.get_account().await?;

        let notional = account.buying_power * self.cfg.portfolio_fraction;
        let qty = size_qty(notional, quote.ask, &asset);
        let min_qty = self
            .cfg
            .min_qty
            .max(asset.min_order_size.unwrap_or(Decimal::ZERO));
        if qty < min_qty || qty * quote.ask < self.cfg.min_notional_usd {
            return Err(SkimmerError::NotionalTooSmall {
                notional: qty * quote.ask,
                min_notional: self.cfg.min_notional_usd,
            });
        }

        let request = OrderRequest::limit(
            symbol.clone(),
            OrderSide::Buy,
            OrderIntent::Entry,
            qty,
            quote.ask,
        );
        info!(symbol = %symbol, qty = %qty, limit = %quote.ask, "submitting entry");
        let order = self.broker.submit_order(&request).await?;

        match self.poll_order(&order.id).await? {
            PollOutcome::Filled(filled) => {
                self.attach_exit(signal, &filled, &asset);
                Ok(true)
            }
            PollOutcome::Terminal(order) => {
                if order.filled_qty > Decimal::ZERO {
                    // Partial fill before the terminal status: keep it.
                    self.attach_exit(signal, &order, &asset);
                    return Ok(true);
                }
                Err(SkimmerError::OrderRejected {
                    code: "entry_unfilled".to_string(),
                    message: format!("entry ended {:?} unfilled", order.status),
                })
            }
            PollOutcome::TimedOut(order) => self.handle_timeout(signal, order, &asset).await,
        }
    }

    /// Cancel a timed-out entry; keep whatever filled. Optionally retry as
    /// a market order when configured and the book is still acceptable.
    async fn handle_timeout(
        &self,
        signal: &EntrySignal,
        order: Order,
        asset: &Asset,
    ) -> Result<bool> {
        let symbol = &signal.symbol;
        warn!(symbol = %symbol, order_id = %order.id, "entry fill timed out, cancelling");

        if let Err(e) = self.broker.cancel_order(&order.id).await {
            // The cancel itself failing is not fatal: the order may have
            // filled in the race. Re-read and act on what actually happened.
            warn!(symbol = %symbol, "entry cancel failed: {e}");
        }
        let settled = self.broker.get_order(&order.id).await?;
        if settled.filled_qty > Decimal::ZERO {
            self.attach_exit(signal, &settled, asset);
            return Ok(true);
        }

        if self.cfg.market_fallback && self.spread_still_acceptable(symbol).await {
            info!(symbol = %symbol, "falling back to market entry");
            let request = OrderRequest::market(
                symbol.clone(),
                OrderSide::Buy,
                OrderIntent::Entry,
                order.qty,
            );
            let market = self.broker.submit_order(&request).await?;
            if let PollOutcome::Filled(filled) | PollOutcome::Terminal(filled) =
                self.poll_order(&market.id).await?
            {
                if filled.filled_qty > Decimal::ZERO {
                    self.attach_exit(signal, &filled, asset);
                    return Ok(true);
                }
            }
        }

        Err(SkimmerError::OrderTimeout {
            elapsed_ms: self.cfg.entry_timeout_ms,
        })
    }

    /// Re-check the book before crossing it: the spread gate that admitted
    /// the signal must still hold by the time the fallback fires.
    async fn spread_still_acceptable(&self, symbol: &SymbolKey) -> bool {
        match self.quotes.get_quote(symbol, self.max_quote_age_ms).await {
            Ok(q) if q.spread_bps() <= Decimal::from(self.max_spread_bps) => true,
            Ok(q) => {
                warn!(
                    symbol = %symbol,
                    spread_bps = %q.spread_bps(),
                    "spread widened during fill wait, market fallback skipped"
                );
                false
            }
            Err(e) => {
                warn!(symbol = %symbol, "quote unavailable, market fallback skipped: {e}");
                false
            }
        }
    }

    async fn poll_order(&self, order_id: &str) -> Result<PollOutcome> {
        let deadline = Instant::now() + StdDuration::from_millis(self.cfg.entry_timeout_ms);
        loop {
            let order = self.broker.get_order(order_id).await?;
            if order.status == crate::domain::OrderStatus::Filled {
                return Ok(PollOutcome::Filled(order));
            }
            if order.status.is_terminal() {
                return Ok(PollOutcome::Terminal(order));
            }
            if Instant::now() >= deadline {
                return Ok(PollOutcome::TimedOut(order));
            }
            sleep(StdDuration::from_millis(self.cfg.poll_interval_ms)).await;
        }
    }

    /// Build the exit plan from the actual fills and hand the position to
    /// the lifecycle engine.
    fn attach_exit(&self, signal: &EntrySignal, order: &Order, asset: &Asset) {
        let avg = order
            .filled_avg_price
            .or(order.limit_price)
            .unwrap_or(Decimal::ZERO);
        // Conservative basis: the worst fill observed, never the average.
        let effective = order.conservative_fill_price().unwrap_or(avg).max(avg);
        let tick = asset
            .price_increment
            .filter(|p| *p > Decimal::ZERO)
            .unwrap_or(self.pricing_cfg.default_tick_size);

        // The fee on the entry leg depends on how it actually filled, not
        // on how it was first submitted.
        let entry_fee = entry_fee_bps(order.order_type, &self.pricing_cfg);
        let req = ExitRequirement {
            desired_net_bps: self.pricing_cfg.desired_net_bps,
            entry_fee_bps: entry_fee,
            exit_fee_bps: self.pricing_cfg.maker_fee_bps,
            slippage_bps: self.pricing_cfg.slippage_bps,
            spread_buffer_bps: self.pricing_cfg.spread_buffer_bps,
            profit_buffer_bps: self.pricing_cfg.profit_buffer_bps,
            cap_bps: self.pricing_cfg.cap_bps,
            min_gross_tp_bps: self.pricing_cfg.min_gross_tp_bps,
        };
        let required_bps = pricing::spread_aware_required_bps(
            pricing::required_exit_bps(&req),
            signal.spread_bps,
            self.pricing_cfg.spread_clamp_floor_bps,
            self.pricing_cfg.spread_clamp_cap_bps,
            self.pricing_cfg.spread_mult,
            self.pricing_cfg.spread_add_bps,
        );
        let taker_req = ExitRequirement {
            exit_fee_bps: self.pricing_cfg.taker_fee_bps,
            ..req
        };
        let taker_required_bps = pricing::required_exit_bps(&taker_req);

        let stop_mult = Decimal::ONE - signal.stop_loss_bps / Decimal::from(10_000);
        let state = ExitState {
            symbol: signal.symbol.clone(),
            qty: order.filled_qty,
            entry_price: avg,
            effective_entry_price: effective,
            entry_time: Utc::now(),
            entry_order_id: Some(order.id.clone()),
            required_exit_bps: required_bps,
            taker_required_bps,
            target_price: pricing::target_sell_price(effective, required_bps, tick),
            breakeven_price: pricing::breakeven_price(
                effective,
                entry_fee,
                self.pricing_cfg.taker_fee_bps,
                tick,
            ),
            stop_price: effective * stop_mult,
            tick_size: tick,
            sell_order_id: None,
            sell_order_submitted_at: None,
            sell_order_limit: None,
            last_bid: None,
            last_ask: None,
        };
        self.lifecycle.attach(state);
    }
}

/// Fee tier paid on the entry leg. A market fill crossed the spread and
/// pays the taker rate; a resting limit pays the maker rate.
fn entry_fee_bps(order_type: OrderType, pricing: &PricingConfig) -> Decimal {
    match order_type {
        OrderType::Market => pricing.taker_fee_bps,
        OrderType::Limit => pricing.maker_fee_bps,
    }
}

/// Position size for a notional budget, floored to the asset's quantity
/// increment.
fn size_qty(notional: Decimal, ask: Decimal, asset: &Asset) -> Decimal {
    if ask <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let raw = notional / ask;
    match asset.min_order_size.filter(|s| *s > Decimal::ZERO) {
        Some(step) => ((raw / step).floor()) * step,
        None => raw.round_dp(8),
    }
}
