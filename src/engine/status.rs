//! Point-in-time status snapshot for the `status` command and periodic
//! status logging.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;

use crate::engine::guard::ConcurrencyGuard;
use crate::engine::lifecycle::{ExitState, LifecycleEngine};
use crate::engine::pnl::{PnlLog, PnlSummary};
use crate::engine::quotes::{QuoteObservation, QuoteService};

#[derive(Debug, Clone, Serialize)]
pub struct IntentSnapshot {
    pub symbol: String,
    pub reason: String,
    pub expires_in_secs: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuoteSnapshot {
    pub symbol: String,
    #[serde(flatten)]
    pub observation: QuoteObservation,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub positions: Vec<ExitState>,
    pub in_flight_entries: Vec<IntentSnapshot>,
    pub entries_halted: Option<String>,
    pub market_data_breaker_open: bool,
    pub quotes: Vec<QuoteSnapshot>,
    pub pnl: PnlSummary,
}

pub fn collect(
    lifecycle: &Arc<LifecycleEngine>,
    guard: &Arc<ConcurrencyGuard>,
    quotes: &Arc<QuoteService>,
    pnl: &Arc<PnlLog>,
) -> StatusReport {
    let now = Utc::now();
    StatusReport {
        positions: lifecycle.snapshots(),
        in_flight_entries: guard
            .in_flight_entries()
            .into_iter()
            .map(|(symbol, intent)| IntentSnapshot {
                symbol: symbol.to_string(),
                reason: intent.reason,
                expires_in_secs: (intent.expires_at - now).num_seconds(),
            })
            .collect(),
        entries_halted: guard.entries_halted(),
        market_data_breaker_open: guard.breaker().is_open(now),
        quotes: quotes
            .observations()
            .into_iter()
            .map(|(symbol, observation)| QuoteSnapshot {
                symbol: symbol.to_string(),
                observation,
            })
            .collect(),
        pnl: pnl.summary(),
    }
}
