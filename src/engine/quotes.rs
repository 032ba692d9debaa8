//! Quote service: read-through cache over the market-data client with a
//! staleness policy, a last-trade fallback, and per-symbol failure
//! cooldowns.
//!
//! Fallback precedence (one ladder, applied in order):
//! fresh cache -> quotes endpoint -> latest-trade synthesis -> typed error.
//! The managing tick applies its own last-known-price fallback on top; this
//! service never fabricates prices beyond the trade synthesis.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::broker::MarketDataClient;
use crate::config::QuotesConfig;
use crate::domain::{Quote, QuoteSource, SymbolKey};
use crate::engine::guard::MarketDataBreaker;
use crate::error::{Result, SkimmerError};

/// Last observation per symbol, consumed by status reporting.
#[derive(Debug, Clone, Serialize, Default)]
pub struct QuoteObservation {
    pub observed_at: Option<DateTime<Utc>>,
    pub source: Option<QuoteSource>,
    pub last_failure: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct FailureState {
    consecutive: u32,
    cooldown_until: Option<DateTime<Utc>>,
}

pub struct QuoteService {
    data: Arc<dyn MarketDataClient>,
    cfg: QuotesConfig,
    cache: DashMap<SymbolKey, Quote>,
    /// Per-symbol fetch serialization: concurrent cache misses share one
    /// upstream call instead of issuing duplicates.
    fetch_locks: DashMap<SymbolKey, Arc<Mutex<()>>>,
    failures: DashMap<SymbolKey, FailureState>,
    observed: DashMap<SymbolKey, QuoteObservation>,
    breaker: Arc<MarketDataBreaker>,
}

impl QuoteService {
    pub fn new(
        data: Arc<dyn MarketDataClient>,
        cfg: QuotesConfig,
        breaker: Arc<MarketDataBreaker>,
    ) -> Self {
        Self {
            data,
            cfg,
            cache: DashMap::new(),
            fetch_locks: DashMap::new(),
            failures: DashMap::new(),
            observed: DashMap::new(),
            breaker,
        }
    }

    fn ttl_ms(&self, symbol: &SymbolKey) -> i64 {
        if symbol.is_crypto() {
            self.cfg.crypto_ttl_ms
        } else {
            self.cfg.equity_ttl_ms
        }
    }

    /// Fetch a quote no older than `max_age_ms`.
    ///
    /// The cache satisfies the request when its copy is within both
    /// `max_age_ms` and the symbol-class TTL; otherwise one caller at a
    /// time goes upstream and the rest re-read the refreshed cache.
    pub async fn get_quote(&self, symbol: &SymbolKey, max_age_ms: i64) -> Result<Quote> {
        let now = Utc::now();
        let effective_max = max_age_ms.min(self.ttl_ms(symbol).max(1));

        if let Some(hit) = self.cache_hit(symbol, effective_max, now) {
            return Ok(hit);
        }

        self.check_cooldown(symbol, now)?;
        self.breaker.check(now)?;

        let lock = self
            .fetch_locks
            .entry(symbol.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _fetching = lock.lock().await;

        // Another caller may have refreshed the cache while we waited.
        let now = Utc::now();
        if let Some(hit) = self.cache_hit(symbol, effective_max, now) {
            return Ok(hit);
        }

        match self.fetch_fresh(symbol, max_age_ms, now).await {
            Ok(quote) => {
                self.cache.insert(symbol.clone(), quote.clone());
                self.failures.remove(symbol);
                self.breaker.record_success();
                self.observed.insert(
                    symbol.clone(),
                    QuoteObservation {
                        observed_at: Some(quote.observed_at),
                        source: Some(quote.source),
                        last_failure: None,
                    },
                );
                Ok(quote)
            }
            Err(e) => {
                self.record_failure(symbol, &e, now);
                Err(e)
            }
        }
    }

    fn cache_hit(&self, symbol: &SymbolKey, max_age_ms: i64, now: DateTime<Utc>) -> Option<Quote> {
        let cached = self.cache.get(symbol)?;
        let age = cached.age_ms(now);
        if (0..=max_age_ms).contains(&age) {
            Some(cached.as_cached())
        } else {
            None
        }
    }

    fn check_cooldown(&self, symbol: &SymbolKey, now: DateTime<Utc>) -> Result<()> {
        if let Some(state) = self.failures.get(symbol) {
            if let Some(until) = state.cooldown_until {
                if now < until {
                    return Err(SkimmerError::QuoteCooldown {
                        symbol: symbol.to_string(),
                        remaining_ms: (until - now).num_milliseconds(),
                    });
                }
            }
        }
        Ok(())
    }

    async fn fetch_fresh(
        &self,
        symbol: &SymbolKey,
        max_age_ms: i64,
        now: DateTime<Utc>,
    ) -> Result<Quote> {
        let symbols = [symbol.clone()];
        let quote = match self.data.latest_quotes(&symbols).await {
            Ok(mut quotes) => quotes.remove(symbol),
            Err(e) => {
                debug!(symbol = %symbol, "quotes endpoint failed, trying trades: {e}");
                None
            }
        };

        if let Some(quote) = quote {
            let age = quote.age_ms(now);
            if age > self.cfg.absurd_age_ms || age < -self.cfg.absurd_age_ms {
                // Clock anomaly: discard rather than accept
                warn!(symbol = %symbol, age_ms = age, "discarding quote with absurd age");
            } else if age <= max_age_ms {
                return Ok(quote);
            } else {
                debug!(symbol = %symbol, age_ms = age, "quote stale, trying trade fallback");
                return self.trade_fallback(symbol, max_age_ms, now).await.map_err(
                    |_| SkimmerError::StaleQuote {
                        symbol: symbol.to_string(),
                        age_ms: age,
                        max_age_ms,
                    },
                );
            }
        }

        self.trade_fallback(symbol, max_age_ms, now).await
    }

    async fn trade_fallback(
        &self,
        symbol: &SymbolKey,
        max_age_ms: i64,
        now: DateTime<Utc>,
    ) -> Result<Quote> {
        let symbols = [symbol.clone()];
        let mut trades = self.data.latest_trades(&symbols).await?;
        let trade = trades.remove(symbol).ok_or_else(|| SkimmerError::NoData {
            symbol: symbol.to_string(),
        })?;

        let age = (now - trade.timestamp).num_milliseconds();
        if age > self.cfg.absurd_age_ms || age < -self.cfg.absurd_age_ms {
            return Err(SkimmerError::AbsurdQuoteAge {
                symbol: symbol.to_string(),
                age_ms: age,
            });
        }
        if age > max_age_ms {
            return Err(SkimmerError::StaleQuote {
                symbol: symbol.to_string(),
                age_ms: age,
                max_age_ms,
            });
        }
        Quote::from_trade(symbol, trade.price, trade.timestamp)
    }

    fn record_failure(&self, symbol: &SymbolKey, error: &SkimmerError, now: DateTime<Utc>) {
        // Stale classifications have their own fallback path and do not
        // advance the cooldown counter.
        let counts = !matches!(
            error,
            SkimmerError::StaleQuote { .. } | SkimmerError::QuoteCooldown { .. }
        );

        if counts {
            let mut state = self.failures.entry(symbol.clone()).or_default();
            state.consecutive += 1;
            if state.consecutive >= self.cfg.failure_threshold {
                state.cooldown_until = Some(now + Duration::milliseconds(self.cfg.cooldown_ms));
                state.consecutive = 0;
                warn!(symbol = %symbol, cooldown_ms = self.cfg.cooldown_ms,
                    "quote failures crossed threshold, entering cooldown");
            }
            if matches!(error, SkimmerError::Network(_) | SkimmerError::Http { .. }) {
                self.breaker.record_failure(now);
            }
        }

        let mut obs = self.observed.entry(symbol.clone()).or_default();
        obs.last_failure = Some(error.to_string());
    }

    /// Last cached quote regardless of age; the managing tick uses this as
    /// a conservative basis when live quotes are classified stale.
    pub fn last_known(&self, symbol: &SymbolKey) -> Option<Quote> {
        self.cache.get(symbol).map(|q| q.as_cached())
    }

    pub fn observations(&self) -> Vec<(SymbolKey, QuoteObservation)> {
        self.observed
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn forget(&self, symbol: &SymbolKey) {
        self.cache.remove(symbol);
        self.failures.remove(symbol);
        self.fetch_locks.remove(symbol);
    }
}
