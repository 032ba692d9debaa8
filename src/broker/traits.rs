use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain::{
    Account, Asset, Bar, Clock, Order, OrderRequest, Orderbook, Position, Quote, SymbolKey,
};
use crate::error::{Result, SkimmerError};

/// Latest-trade observation, used to synthesize quotes when the quotes
/// endpoint has no usable bid/ask.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
}

fn unsupported(feature: &str) -> SkimmerError {
    SkimmerError::Validation(format!("{feature} is not supported by this broker client"))
}

/// Trading-side broker API. Implementers substitute their own client;
/// the engine only ever sees this trait.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    fn is_dry_run(&self) -> bool;

    async fn get_account(&self) -> Result<Account>;

    async fn get_positions(&self) -> Result<Vec<Position>>;

    async fn get_position(&self, symbol: &SymbolKey) -> Result<Option<Position>>;

    /// All non-terminal orders, multi-leg orders included (not flattened).
    async fn get_open_orders(&self) -> Result<Vec<Order>>;

    async fn get_order(&self, order_id: &str) -> Result<Order>;

    async fn submit_order(&self, request: &OrderRequest) -> Result<Order>;

    /// Atomically replace the price (and optionally quantity) of a working
    /// order. Returns the replacement order.
    async fn replace_order(
        &self,
        order_id: &str,
        limit_price: Decimal,
        qty: Option<Decimal>,
    ) -> Result<Order>;

    /// Best-effort cancel. `Ok(false)` means the broker reported the order
    /// as already terminal.
    async fn cancel_order(&self, order_id: &str) -> Result<bool>;

    async fn get_asset(&self, symbol: &SymbolKey) -> Result<Asset>;

    /// Market session clock; the scanner skips equities outside the session.
    async fn get_clock(&self) -> Result<Clock>;
}

/// Market-data API, batch-keyed by symbol lists where the wire supports it.
#[async_trait]
pub trait MarketDataClient: Send + Sync {
    async fn latest_quotes(&self, symbols: &[SymbolKey]) -> Result<HashMap<SymbolKey, Quote>>;

    async fn latest_trades(&self, symbols: &[SymbolKey]) -> Result<HashMap<SymbolKey, Trade>>;

    /// Most recent 1-minute bars, oldest first.
    async fn bars(&self, symbol: &SymbolKey, limit: usize) -> Result<Vec<Bar>>;

    async fn orderbook(&self, symbol: &SymbolKey) -> Result<Orderbook> {
        let _ = symbol;
        Err(unsupported("orderbook"))
    }
}
