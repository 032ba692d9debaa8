use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::SymbolKey;

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "buy"),
            OrderSide::Sell => write!(f, "sell"),
        }
    }
}

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Limit,
    Market,
}

/// Time in force
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeInForce {
    /// Good Till Cancelled
    Gtc,
    /// Immediate Or Cancel
    Ioc,
    /// Day order
    Day,
}

/// Order status as reported by the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    New,
    Accepted,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
    PendingNew,
    PendingCancel,
    PendingReplace,
    Replaced,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Canceled
                | OrderStatus::Rejected
                | OrderStatus::Expired
                | OrderStatus::Replaced
        )
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

/// The order's purpose, encoded into the client order id so that
/// reconciliation can recognize our orders by prefix after a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderIntent {
    Entry,
    Exit,
    TakerExit,
    StopExit,
    ForceExit,
}

impl OrderIntent {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderIntent::Entry => "entry",
            OrderIntent::Exit => "exit",
            OrderIntent::TakerExit => "taker",
            OrderIntent::StopExit => "stop",
            OrderIntent::ForceExit => "force",
        }
    }
}

impl std::fmt::Display for OrderIntent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Caller-assigned idempotency token:
/// `skim-{symbol}-{side}-{intent}-{bucket}-{nonce}`.
///
/// The prefix (everything before the nonce) identifies symbol, side,
/// intent, and a time bucket; resubmitting within the same bucket produces
/// the same prefix, which is how duplicates are detected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientOrderId(String);

impl ClientOrderId {
    /// Width of an intent time bucket in seconds.
    pub const BUCKET_SECS: i64 = 60;

    pub fn generate(
        symbol: &SymbolKey,
        side: OrderSide,
        intent: OrderIntent,
        now: DateTime<Utc>,
    ) -> Self {
        let bucket = now.timestamp() / Self::BUCKET_SECS;
        let nonce = Uuid::new_v4().simple().to_string();
        Self(format!(
            "skim-{}-{}-{}-{}-{}",
            symbol.to_compact(),
            side,
            intent,
            bucket,
            &nonce[..8]
        ))
    }

    /// The idempotency prefix shared by resubmissions in the same bucket.
    pub fn prefix(&self) -> &str {
        self.0.rfind('-').map(|i| &self.0[..i]).unwrap_or(&self.0)
    }

    /// Prefix an order in this symbol/side/intent would carry at `now`.
    pub fn prefix_for(
        symbol: &SymbolKey,
        side: OrderSide,
        intent: OrderIntent,
        now: DateTime<Utc>,
    ) -> String {
        let bucket = now.timestamp() / Self::BUCKET_SECS;
        format!("skim-{}-{}-{}-{}", symbol.to_compact(), side, intent, bucket)
    }

    /// Whether `raw` is one of ours with the given intent, any bucket.
    pub fn matches_intent(raw: &str, symbol: &SymbolKey, intent: OrderIntent) -> bool {
        raw.starts_with(&format!("skim-{}-", symbol.to_compact()))
            && raw.contains(&format!("-{}-", intent))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClientOrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Order request (what we want to do)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_order_id: ClientOrderId,
    pub symbol: SymbolKey,
    pub side: OrderSide,
    pub qty: Decimal,
    pub order_type: OrderType,
    pub limit_price: Option<Decimal>,
    pub time_in_force: TimeInForce,
}

impl OrderRequest {
    pub fn limit(
        symbol: SymbolKey,
        side: OrderSide,
        intent: OrderIntent,
        qty: Decimal,
        price: Decimal,
    ) -> Self {
        Self {
            client_order_id: ClientOrderId::generate(&symbol, side, intent, Utc::now()),
            symbol,
            side,
            qty,
            order_type: OrderType::Limit,
            limit_price: Some(price),
            time_in_force: TimeInForce::Gtc,
        }
    }

    pub fn market(symbol: SymbolKey, side: OrderSide, intent: OrderIntent, qty: Decimal) -> Self {
        Self {
            client_order_id: ClientOrderId::generate(&symbol, side, intent, Utc::now()),
            symbol,
            side,
            qty,
            order_type: OrderType::Market,
            limit_price: None,
            time_in_force: TimeInForce::Gtc,
        }
    }

    /// Immediate-or-cancel marketable limit, used by taker flips and stops.
    pub fn ioc_limit(
        symbol: SymbolKey,
        side: OrderSide,
        intent: OrderIntent,
        qty: Decimal,
        price: Decimal,
    ) -> Self {
        Self {
            client_order_id: ClientOrderId::generate(&symbol, side, intent, Utc::now()),
            symbol,
            side,
            qty,
            order_type: OrderType::Limit,
            limit_price: Some(price),
            time_in_force: TimeInForce::Ioc,
        }
    }

    /// Notional value at the limit price (zero for market orders).
    pub fn notional(&self) -> Decimal {
        self.limit_price.map(|p| p * self.qty).unwrap_or(Decimal::ZERO)
    }
}

/// Order as the broker reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub client_order_id: String,
    pub symbol: SymbolKey,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub qty: Decimal,
    pub filled_qty: Decimal,
    pub limit_price: Option<Decimal>,
    pub filled_avg_price: Option<Decimal>,
    /// Highest fill price across partial executions, when reported.
    /// Used as the conservative entry basis.
    pub max_fill_price: Option<Decimal>,
    pub status: OrderStatus,
    pub submitted_at: DateTime<Utc>,
    /// Child legs of a multi-leg order; flattened during reconciliation.
    #[serde(default)]
    pub legs: Vec<Order>,
}

impl Order {
    pub fn remaining_qty(&self) -> Decimal {
        (self.qty - self.filled_qty).max(Decimal::ZERO)
    }

    pub fn is_fully_filled(&self) -> bool {
        self.status == OrderStatus::Filled && self.filled_qty >= self.qty
    }

    /// The fill basis for exit pricing: the maximum observed fill price
    /// when available, otherwise the average.
    pub fn conservative_fill_price(&self) -> Option<Decimal> {
        self.max_fill_price.or(self.filled_avg_price)
    }
}
