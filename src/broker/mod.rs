pub mod rest;
pub mod traits;

pub use rest::RestBroker;
pub use traits::{BrokerClient, MarketDataClient, Trade};
