//! In-memory realized PnL ledger.
//!
//! Fills are the source of truth for position closes; this log is a
//! process-local convenience for the status surface and shutdown summary,
//! not an accounting system.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Mutex;
use tracing::info;

use crate::domain::SymbolKey;

#[derive(Debug, Clone, Serialize)]
pub struct RealizedPnl {
    pub symbol: SymbolKey,
    pub qty: Decimal,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub gross_pnl: Decimal,
    pub gross_bps: Decimal,
    pub entered_at: DateTime<Utc>,
    pub exited_at: DateTime<Utc>,
}

impl RealizedPnl {
    pub fn new(
        symbol: &SymbolKey,
        qty: Decimal,
        entry_price: Decimal,
        exit_price: Decimal,
        entered_at: DateTime<Utc>,
        exited_at: DateTime<Utc>,
    ) -> Self {
        let gross_pnl = (exit_price - entry_price) * qty;
        let gross_bps = if entry_price > Decimal::ZERO {
            (exit_price / entry_price - Decimal::ONE) * Decimal::from(10_000)
        } else {
            Decimal::ZERO
        };
        Self {
            symbol: symbol.clone(),
            qty,
            entry_price,
            exit_price,
            gross_pnl,
            gross_bps,
            entered_at,
            exited_at,
        }
    }

    pub fn hold_secs(&self) -> i64 {
        (self.exited_at - self.entered_at).num_seconds()
    }
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct PnlSummary {
    pub trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub gross_pnl: Decimal,
    pub avg_gross_bps: Decimal,
    pub avg_hold_secs: i64,
}

#[derive(Debug, Default)]
pub struct PnlLog {
    records: Mutex<Vec<RealizedPnl>>,
}

impl PnlLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, record: RealizedPnl) {
        self.records
            .lock()
            .expect("pnl lock poisoned")
            .push(record);
    }

    pub fn records(&self) -> Vec<RealizedPnl> {
        self.records.lock().expect("pnl lock poisoned").clone()
    }

    pub fn summary(&self) -> PnlSummary {
        let records = self.records.lock().expect("pnl lock poisoned");
        if records.is_empty() {
            return PnlSummary::default();
        }
        let trades = records.len();
        let wins = records.iter().filter(|r| r.gross_pnl > Decimal::ZERO).count();
        let gross_pnl: Decimal = records.iter().map(|r| r.gross_pnl).sum();
        let total_bps: Decimal = records.iter().map(|r| r.gross_bps).sum();
        let total_hold: i64 = records.iter().map(|r| r.hold_secs()).sum();
        PnlSummary {
            trades,
            wins,
            losses: trades - wins,
            gross_pnl,
            avg_gross_bps: total_bps / Decimal::from(trades as i64),
            avg_hold_secs: total_hold / trades as i64,
        }
    }

    pub fn log_summary(&self) {
        let s = self.summary();
        info!(
            trades = s.trades,
            wins = s.wins,
            losses = s.losses,
            gross_pnl = %s.gross_pnl,
            avg_gross_bps = %s.avg_gross_bps,
            "session pnl"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn sym() -> SymbolKey {
        SymbolKey::parse("BTC/USD").unwrap()
    }

    #[test]
    fn records_gross_pnl_and_bps() {
        let t0 = Utc::now();
        let r = RealizedPnl::new(&sym(), dec!(2), dec!(100), dec!(101), t0, t0);
        assert_eq!(r.gross_pnl, dec!(2));
        assert_eq!(r.gross_bps, dec!(100));
    }

    #[test]
    fn summary_aggregates() {
        let log = PnlLog::new();
        let t0 = Utc::now();
        log.record(RealizedPnl::new(
            &sym(),
            dec!(1),
            dec!(100),
            dec!(102),
            t0,
            t0 + Duration::seconds(100),
        ));
        log.record(RealizedPnl::new(
            &sym(),
            dec!(1),
            dec!(100),
            dec!(99),
            t0,
            t0 + Duration::seconds(300),
        ));
        let s = log.summary();
        assert_eq!(s.trades, 2);
        assert_eq!(s.wins, 1);
        assert_eq!(s.losses, 1);
        assert_eq!(s.gross_pnl, dec!(1));
        assert_eq!(s.avg_hold_secs, 200);
    }

    #[test]
    fn empty_summary_is_zeroed() {
        let s = PnlLog::new().summary();
        assert_eq!(s.trades, 0);
        assert_eq!(s.gross_pnl, Decimal::ZERO);
    }
}
