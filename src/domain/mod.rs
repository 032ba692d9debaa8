pub mod account;
pub mod order;
pub mod quote;
pub mod symbol;

pub use account::{Account, Asset, Bar, BookLevel, Clock, Orderbook, Position};
pub use order::{
    ClientOrderId, Order, OrderIntent, OrderRequest, OrderSide, OrderStatus, OrderType,
    TimeInForce,
};
pub use quote::{Quote, QuoteSource};
pub use symbol::SymbolKey;
