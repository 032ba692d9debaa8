//! Concurrency guard: entry in-flight registry, per-symbol action
//! cooldowns, the market-data circuit breaker, and the orphan halt flag.
//!
//! Per-symbol tick mutual exclusion lives in the `ExitState` arena
//! (`DashMap<SymbolKey, Arc<Mutex<ExitState>>>`) owned by the engine; a
//! tick that finds the mutex held skips entirely rather than queuing.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use tracing::{info, warn};

use crate::domain::SymbolKey;
use crate::error::{Result, SkimmerError};

/// In-flight entry marker blocking a second attempt for the same symbol.
#[derive(Debug, Clone, Serialize)]
pub struct EntryIntent {
    pub reason: String,
    pub expires_at: DateTime<Utc>,
}

/// Releases the in-flight marker when the entry attempt finishes,
/// successfully or not.
#[derive(Debug)]
pub struct IntentGuard {
    intents: Arc<DashMap<SymbolKey, EntryIntent>>,
    symbol: SymbolKey,
}

impl Drop for IntentGuard {
    fn drop(&mut self) {
        self.intents.remove(&self.symbol);
    }
}

/// Sliding-window failure counter with a time-boxed cooldown.
#[derive(Debug)]
pub struct MarketDataBreaker {
    window: Mutex<VecDeque<DateTime<Utc>>>,
    threshold: u32,
    window_secs: i64,
    cooldown_ms: i64,
    cooldown_until: Mutex<Option<DateTime<Utc>>>,
}

impl MarketDataBreaker {
    pub fn new(threshold: u32, cooldown_ms: i64) -> Self {
        Self {
            window: Mutex::new(VecDeque::new()),
            threshold,
            window_secs: 60,
            cooldown_ms,
            cooldown_until: Mutex::new(None),
        }
    }

    /// Short-circuit when the breaker is open.
    pub fn check(&self, now: DateTime<Utc>) -> Result<()> {
        let until = self.cooldown_until.lock().expect("breaker lock poisoned");
        if let Some(until) = *until {
            if now < until {
                return Err(SkimmerError::MarketDataCooldown {
                    remaining_ms: (until - now).num_milliseconds(),
                });
            }
        }
        Ok(())
    }

    pub fn record_failure(&self, now: DateTime<Utc>) {
        let mut window = self.window.lock().expect("breaker lock poisoned");
        window.push_back(now);
        let cutoff = now - Duration::seconds(self.window_secs);
        while window.front().is_some_and(|t| *t < cutoff) {
            window.pop_front();
        }
        if window.len() as u32 >= self.threshold {
            let until = now + Duration::milliseconds(self.cooldown_ms);
            *self.cooldown_until.lock().expect("breaker lock poisoned") = Some(until);
            window.clear();
            warn!(
                cooldown_ms = self.cooldown_ms,
                "market-data circuit breaker opened"
            );
        }
    }

    pub fn record_success(&self) {
        self.window.lock().expect("breaker lock poisoned").clear();
    }

    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        self.check(now).is_err()
    }
}

/// Process-wide guard shared by the entry scanner, tick driver, and
/// reconciler.
pub struct ConcurrencyGuard {
    intents: Arc<DashMap<SymbolKey, EntryIntent>>,
    last_action: DashMap<SymbolKey, DateTime<Utc>>,
    breaker: Arc<MarketDataBreaker>,
    entries_halted: Mutex<Option<String>>,
}

impl ConcurrencyGuard {
    pub fn new(breaker: Arc<MarketDataBreaker>) -> Self {
        Self {
            intents: Arc::new(DashMap::new()),
            last_action: DashMap::new(),
            breaker,
            entries_halted: Mutex::new(None),
        }
    }

    pub fn breaker(&self) -> &Arc<MarketDataBreaker> {
        &self.breaker
    }

    /// Register an entry attempt for `symbol`. Fails with
    /// `ExistingEntryIntent` while an unexpired attempt is in flight.
    pub fn begin_entry(
        &self,
        symbol: &SymbolKey,
        reason: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<IntentGuard> {
        if let Some(halt) = self.entries_halted() {
            return Err(SkimmerError::EntriesHalted(halt));
        }

        // Expired markers are replaced; live ones block.
        let mut blocked: Option<String> = None;
        let entry = self.intents.entry(symbol.clone());
        entry
            .and_modify(|existing| {
                if existing.expires_at > now {
                    blocked = Some(existing.reason.clone());
                } else {
                    existing.reason = reason.to_string();
                    existing.expires_at = now + ttl;
                }
            })
            .or_insert_with(|| EntryIntent {
                reason: reason.to_string(),
                expires_at: now + ttl,
            });

        if let Some(existing_reason) = blocked {
            return Err(SkimmerError::ExistingEntryIntent {
                symbol: symbol.to_string(),
                reason: existing_reason,
            });
        }

        Ok(IntentGuard {
            intents: self.intents.clone(),
            symbol: symbol.clone(),
        })
    }

    pub fn in_flight_entries(&self) -> Vec<(SymbolKey, EntryIntent)> {
        self.intents
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Rate-limit reprice/taker-flip actions per symbol.
    pub fn action_allowed(&self, symbol: &SymbolKey, cooldown: Duration, now: DateTime<Utc>) -> bool {
        match self.last_action.get(symbol) {
            Some(last) => now - *last >= cooldown,
            None => true,
        }
    }

    pub fn record_action(&self, symbol: &SymbolKey, now: DateTime<Utc>) {
        self.last_action.insert(symbol.clone(), now);
    }

    pub fn forget_symbol(&self, symbol: &SymbolKey) {
        self.last_action.remove(symbol);
        self.intents.remove(symbol);
    }

    pub fn halt_entries(&self, reason: String) {
        info!(%reason, "halting new entries");
        *self.entries_halted.lock().expect("halt lock poisoned") = Some(reason);
    }

    pub fn clear_halt(&self) {
        let mut halt = self.entries_halted.lock().expect("halt lock poisoned");
        if halt.take().is_some() {
            info!("entry halt cleared");
        }
    }

    pub fn entries_halted(&self) -> Option<String> {
        self.entries_halted
            .lock()
            .expect("halt lock poisoned")
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym() -> SymbolKey {
        SymbolKey::parse("BTC/USD").unwrap()
    }

    #[test]
    fn second_entry_attempt_blocked() {
        let guard = ConcurrencyGuard::new(Arc::new(MarketDataBreaker::new(5, 1000)));
        let now = Utc::now();
        let _held = guard
            .begin_entry(&sym(), "scan", Duration::seconds(60), now)
            .unwrap();
        let err = guard
            .begin_entry(&sym(), "scan", Duration::seconds(60), now)
            .unwrap_err();
        assert!(matches!(err, SkimmerError::ExistingEntryIntent { .. }));
    }

    #[test]
    fn intent_released_on_drop() {
        let guard = ConcurrencyGuard::new(Arc::new(MarketDataBreaker::new(5, 1000)));
        let now = Utc::now();
        {
            let _held = guard
                .begin_entry(&sym(), "scan", Duration::seconds(60), now)
                .unwrap();
        }
        assert!(guard
            .begin_entry(&sym(), "scan", Duration::seconds(60), now)
            .is_ok());
    }

    #[test]
    fn expired_intent_replaced() {
        let guard = ConcurrencyGuard::new(Arc::new(MarketDataBreaker::new(5, 1000)));
        let now = Utc::now();
        let held = guard
            .begin_entry(&sym(), "scan", Duration::seconds(10), now)
            .unwrap();
        // Leak the guard so the marker stays in the map past its expiry
        std::mem::forget(held);
        let later = now + Duration::seconds(11);
        assert!(guard
            .begin_entry(&sym(), "rescan", Duration::seconds(10), later)
            .is_ok());
    }

    #[test]
    fn halt_blocks_entries() {
        let guard = ConcurrencyGuard::new(Arc::new(MarketDataBreaker::new(5, 1000)));
        guard.halt_entries("orphans".to_string());
        let err = guard
            .begin_entry(&sym(), "scan", Duration::seconds(60), Utc::now())
            .unwrap_err();
        assert!(matches!(err, SkimmerError::EntriesHalted(_)));
        guard.clear_halt();
        assert!(guard
            .begin_entry(&sym(), "scan", Duration::seconds(60), Utc::now())
            .is_ok());
    }

    #[test]
    fn action_cooldown() {
        let guard = ConcurrencyGuard::new(Arc::new(MarketDataBreaker::new(5, 1000)));
        let now = Utc::now();
        assert!(guard.action_allowed(&sym(), Duration::seconds(10), now));
        guard.record_action(&sym(), now);
        assert!(!guard.action_allowed(&sym(), Duration::seconds(10), now + Duration::seconds(5)));
        assert!(guard.action_allowed(&sym(), Duration::seconds(10), now + Duration::seconds(10)));
    }

    #[test]
    fn breaker_opens_after_threshold() {
        let breaker = MarketDataBreaker::new(3, 5_000);
        let now = Utc::now();
        assert!(breaker.check(now).is_ok());
        breaker.record_failure(now);
        breaker.record_failure(now);
        assert!(breaker.check(now).is_ok());
        breaker.record_failure(now);
        assert!(breaker.is_open(now));
        // Closed again after the cooldown window
        assert!(breaker.check(now + Duration::seconds(6)).is_ok());
    }

    #[test]
    fn breaker_success_resets_window() {
        let breaker = MarketDataBreaker::new(3, 5_000);
        let now = Utc::now();
        breaker.record_failure(now);
        breaker.record_failure(now);
        breaker.record_success();
        breaker.record_failure(now);
        assert!(breaker.check(now).is_ok());
    }
}
