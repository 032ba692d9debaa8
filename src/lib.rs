//! Automated position entry/exit engine against a brokerage REST API.
//!
//! The engine scans a watchlist for entry opportunities, opens positions
//! with idempotent limit orders, and manages each open position through a
//! per-symbol exit state machine until it closes. A reconciliation loop
//! keeps tracked state aligned with broker truth across restarts.

pub mod broker;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;

pub use config::AppConfig;
pub use engine::Engine;
pub use error::{Result, SkimmerError};
