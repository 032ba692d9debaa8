//! Reconciliation: periodically compares broker truth (positions and open
//! orders) against tracked state and heals the differences.
//!
//! The broker is authoritative. A fetch failure aborts the pass without
//! touching local state; reconciliation repairs on evidence, never on its
//! absence. Untracked positions are adopted with a fresh exit plan rather
//! than liquidated.

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::broker::BrokerClient;
use crate::config::{PricingConfig, ReconciliationConfig};
use crate::domain::{Order, OrderSide, Position, SymbolKey};
use crate::engine::guard::ConcurrencyGuard;
use crate::engine::lifecycle::{ExitState, LifecycleEngine};
use crate::engine::pricing::{self, ExitRequirement};
use crate::error::Result;

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Serialize, Default)]
pub struct OrphanReport {
    pub orphans_found: usize,
    pub adopted: usize,
    pub adopted_with_sell: usize,
    pub vanished_sells_cleared: usize,
    pub closed_externally: usize,
}

impl OrphanReport {
    pub fn is_clean(&self) -> bool {
        self.orphans_found == 0
            && self.vanished_sells_cleared == 0
            && self.closed_externally == 0
    }
}

pub struct Reconciler {
    broker: Arc<dyn BrokerClient>,
    lifecycle: Arc<LifecycleEngine>,
    guard: Arc<ConcurrencyGuard>,
    cfg: ReconciliationConfig,
    pricing_cfg: PricingConfig,
}

impl Reconciler {
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        lifecycle: Arc<LifecycleEngine>,
        guard: Arc<ConcurrencyGuard>,
        cfg: ReconciliationConfig,
        pricing_cfg: PricingConfig,
    ) -> Self {
        Self {
            broker,
            lifecycle,
            guard,
            cfg,
            pricing_cfg,
        }
    }

    /// One full pass. Errors mean the pass could not establish broker
    /// truth; nothing local is modified in that case.
    pub async fn reconcile(&self) -> Result<OrphanReport> {
        let positions = self.broker.get_positions().await?;
        let open_orders = flatten_orders(self.broker.get_open_orders().await?);

        let mut report = OrphanReport::default();

        let mut open_sells: HashMap<SymbolKey, Vec<Order>> = HashMap::new();
        let mut open_ids: HashMap<String, ()> = HashMap::new();
        for order in open_orders {
            open_ids.insert(order.id.clone(), ());
            if order.side == OrderSide::Sell && order.status.is_active() {
                open_sells.entry(order.symbol.clone()).or_default().push(order);
            }
        }

        let live: HashMap<SymbolKey, Position> = positions
            .into_iter()
            .filter(|p| p.qty.abs() > self.cfg.dust_qty)
            .map(|p| (p.symbol.clone(), p))
            .collect();

        // Pass 1: tracked state against broker truth.
        for symbol in self.lifecycle.tracked_symbols() {
            match live.get(&symbol) {
                None => {
                    // Position gone and no working sell left: it was closed
                    // outside a tick (manual flatten, external fill).
                    let has_sell = open_sells.contains_key(&symbol);
                    if !has_sell {
                        warn!(symbol = %symbol, "tracked position vanished at broker, untracking");
                        self.lifecycle.untrack(&symbol);
                        report.closed_externally += 1;
                    }
                }
                Some(position) => {
                    let qty = position.qty;
                    let mut sell_cleared = false;
                    self.lifecycle
                        .with_state(&symbol, |state| {
                            if state.qty != qty {
                                info!(
                                    symbol = %symbol,
                                    tracked = %state.qty,
                                    broker = %qty,
                                    "adjusting tracked quantity to broker"
                                );
                                state.qty = qty;
                            }
                            if let Some(id) = state.sell_order_id.clone() {
                                if !open_ids.contains_key(&id) {
                                    // The tick settles fills; here we only
                                    // clear references to orders the broker
                                    // no longer lists.
                                    state.sell_order_id = None;
                                    state.sell_order_submitted_at = None;
                                    state.sell_order_limit = None;
                                    sell_cleared = true;
                                }
                            }
                        })
                        .await;
                    if sell_cleared {
                        warn!(symbol = %symbol, "working sell vanished at broker, cleared");
                        report.vanished_sells_cleared += 1;
                    }
                }
            }
        }

        // Pass 2: broker positions nobody tracks.
        let orphans: Vec<&Position> = live
            .values()
            .filter(|p| !self.lifecycle.is_tracked(&p.symbol))
            .collect();
        report.orphans_found = orphans.len();

        if !orphans.is_empty() && self.cfg.halt_on_orphans {
            self.guard
                .halt_entries(format!("{} orphan position(s) under repair", orphans.len()));
        }

        let mut all_repaired = true;
        for position in orphans {
            match self.adopt(position, open_sells.get(&position.symbol)).await {
                Ok(with_sell) => {
                    report.adopted += 1;
                    if with_sell {
                        report.adopted_with_sell += 1;
                    }
                }
                Err(e) => {
                    warn!(symbol = %position.symbol, "orphan adoption failed: {e}");
                    all_repaired = false;
                }
            }
        }

        if self.cfg.halt_on_orphans && all_repaired {
            self.guard.clear_halt();
        }

        if !report.is_clean() {
            info!(
                orphans = report.orphans_found,
                adopted = report.adopted,
                closed_externally = report.closed_externally,
                "reconciliation repaired state"
            );
        }
        Ok(report)
    }

    /// Build an exit plan for a position we did not open (or lost across a
    /// restart) and start tracking it. Re-uses the best-matching working
    /// sell instead of stacking a second one.
    async fn adopt(&self, position: &Position, sells: Option<&Vec<Order>>) -> Result<bool> {
        let symbol = &position.symbol;
        let entry_price = position.avg_entry_price;

        let tick = match self.broker.get_asset(symbol).await {
            Ok(asset) => asset
                .price_increment
                .filter(|p| *p > Decimal::ZERO)
                .unwrap_or(self.pricing_cfg.default_tick_size),
            Err(e) => {
                warn!(symbol = %symbol, "asset lookup failed, using default tick: {e}");
                self.pricing_cfg.default_tick_size
            }
        };

        let req = ExitRequirement {
            desired_net_bps: self.pricing_cfg.desired_net_bps,
            entry_fee_bps: self.pricing_cfg.maker_fee_bps,
            exit_fee_bps: self.pricing_cfg.maker_fee_bps,
            slippage_bps: self.pricing_cfg.slippage_bps,
            spread_buffer_bps: self.pricing_cfg.spread_buffer_bps,
            profit_buffer_bps: self.pricing_cfg.profit_buffer_bps,
            cap_bps: self.pricing_cfg.cap_bps,
            min_gross_tp_bps: self.pricing_cfg.min_gross_tp_bps,
        };
        let required_bps = pricing::required_exit_bps(&req);
        let taker_req = ExitRequirement {
            exit_fee_bps: self.pricing_cfg.taker_fee_bps,
            ..req
        };
        let target = pricing::target_sell_price(entry_price, required_bps, tick);

        let matched = sells
            .and_then(|orders| best_matching_sell(orders, position.qty, target))
            .cloned();

        let mut state = ExitState {
            symbol: symbol.clone(),
            qty: position.qty,
            entry_price,
            effective_entry_price: entry_price,
            entry_time: Utc::now(),
            entry_order_id: None,
            required_exit_bps: required_bps,
            taker_required_bps: pricing::required_exit_bps(&taker_req),
            target_price: target,
            breakeven_price: pricing::breakeven_price(
                entry_price,
                self.pricing_cfg.maker_fee_bps,
                self.pricing_cfg.taker_fee_bps,
                tick,
            ),
            stop_price: Decimal::ZERO,
            tick_size: tick,
            sell_order_id: None,
            sell_order_submitted_at: None,
            sell_order_limit: None,
            last_bid: None,
            last_ask: None,
        };

        let with_sell = match matched {
            Some(order) => {
                info!(
                    symbol = %symbol,
                    order_id = %order.id,
                    limit = ?order.limit_price,
                    "adopting orphan with existing sell"
                );
                state.sell_order_id = Some(order.id);
                state.sell_order_submitted_at = Some(order.submitted_at);
                state.sell_order_limit = order.limit_price;
                true
            }
            None => {
                info!(symbol = %symbol, qty = %position.qty, entry = %entry_price,
                    "adopting orphan, exit will be placed on next tick");
                false
            }
        };

        self.lifecycle.attach(state);
        Ok(with_sell)
    }
}

/// Multi-leg orders arrive nested; reconciliation works on the flat list.
pub fn flatten_orders(orders: Vec<Order>) -> Vec<Order> {
    let mut flat = Vec::with_capacity(orders.len());
    for mut order in orders {
        let legs = std::mem::take(&mut order.legs);
        flat.push(order);
        flat.extend(flatten_orders(legs));
    }
    flat
}

/// Best candidate among working sells for an adopted position: closest
/// quantity first, then the limit closest to the desired target.
pub fn best_matching_sell<'a>(
    orders: &'a [Order],
    qty: Decimal,
    target: Decimal,
) -> Option<&'a Order> {
    orders.iter().min_by(|a, b| {
        let qty_a = (a.remaining_qty() - qty).abs();
        let qty_b = (b.remaining_qty() - qty).abs();
        qty_a.cmp(&qty_b).then_with(|| {
            let price_a = a.limit_price.map(|p| (p - target).abs());
            let price_b = b.limit_price.map(|p| (p - target).abs());
            match (price_a, price_b) {
                (Some(a), Some(b)) => a.cmp(&b),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            }
        })
    })
}
