use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::SymbolKey;

/// Trading account snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub buying_power: Decimal,
    pub cash: Decimal,
    pub equity: Decimal,
    pub trading_blocked: bool,
}

/// Open position as the broker reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: SymbolKey,
    pub qty: Decimal,
    pub avg_entry_price: Decimal,
    pub market_value: Option<Decimal>,
    pub unrealized_pnl: Option<Decimal>,
}

/// Tradability metadata for an instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub symbol: SymbolKey,
    pub tradable: bool,
    pub fractionable: bool,
    /// Minimum price increment, when the broker reports one.
    pub price_increment: Option<Decimal>,
    pub min_order_size: Option<Decimal>,
}

/// A single OHLCV bar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bar {
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// One side level of the order book.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: Decimal,
    pub size: Decimal,
}

/// Top-of-book depth snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Orderbook {
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    pub observed_at: DateTime<Utc>,
}

impl Orderbook {
    /// Total notional resting on the ask side within `band_bps` of best ask.
    pub fn ask_depth_within_bps(&self, band_bps: i64) -> Decimal {
        let Some(best) = self.asks.first() else {
            return Decimal::ZERO;
        };
        let limit = best.price * (Decimal::ONE + Decimal::from(band_bps) / Decimal::from(10_000));
        self.asks
            .iter()
            .take_while(|l| l.price <= limit)
            .map(|l| l.price * l.size)
            .sum()
    }

    /// Walk the ask side accumulating notional until `target_notional` is
    /// met; returns the VWAP deviation from best ask in bps, or None when
    /// the book is too thin to fill the target.
    pub fn impact_bps(&self, target_notional: Decimal) -> Option<Decimal> {
        let best = self.asks.first()?.price;
        if best <= Decimal::ZERO || target_notional <= Decimal::ZERO {
            return None;
        }
        let mut remaining = target_notional;
        let mut cost = Decimal::ZERO;
        let mut qty = Decimal::ZERO;
        for level in &self.asks {
            let level_notional = level.price * level.size;
            let take = level_notional.min(remaining);
            if level.price.is_zero() {
                continue;
            }
            cost += take;
            qty += take / level.price;
            remaining -= take;
            if remaining <= Decimal::ZERO {
                break;
            }
        }
        if remaining > Decimal::ZERO || qty.is_zero() {
            return None;
        }
        let vwap = cost / qty;
        Some((vwap - best) / best * Decimal::from(10_000))
    }

    /// Order-book imbalance over the top `levels`: (bid - ask) / (bid + ask)
    /// by notional, in [-1, 1].
    pub fn imbalance(&self, levels: usize) -> Decimal {
        let bid: Decimal = self
            .bids
            .iter()
            .take(levels)
            .map(|l| l.price * l.size)
            .sum();
        let ask: Decimal = self
            .asks
            .iter()
            .take(levels)
            .map(|l| l.price * l.size)
            .sum();
        let total = bid + ask;
        if total.is_zero() {
            return Decimal::ZERO;
        }
        (bid - ask) / total
    }
}

/// Market clock (equities have sessions; crypto trades around the clock).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Clock {
    pub is_open: bool,
    pub next_open: DateTime<Utc>,
    pub next_close: DateTime<Utc>,
}
