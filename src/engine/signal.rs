//! Entry signal engine.
//!
//! A sequence of gates evaluated per symbol on every scan, short-circuiting
//! on the first failure. Each failure records a skip reason used for
//! diagnostics; skip reasons are expected outcomes, not errors.

use chrono::Utc;
use dashmap::DashMap;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

use crate::broker::MarketDataClient;
use crate::config::{EntryConfig, PricingConfig};
use crate::domain::{Orderbook, Quote, SymbolKey};
use crate::engine::pricing::{self, ExitRequirement};
use crate::engine::quotes::QuoteService;

/// Why a symbol was not ready this scan.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    QuoteUnavailable(String),
    SpreadGate,
    ThinBook,
    ImpactGate,
    InsufficientBars,
    EvFloor,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::QuoteUnavailable(e) => write!(f, "quote_unavailable: {e}"),
            SkipReason::SpreadGate => write!(f, "spread_gate"),
            SkipReason::ThinBook => write!(f, "thin_book"),
            SkipReason::ImpactGate => write!(f, "impact_gate"),
            SkipReason::InsufficientBars => write!(f, "insufficient_bars"),
            SkipReason::EvFloor => write!(f, "ev_floor"),
        }
    }
}

/// Ephemeral scan result; recomputed every scan and never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct EntrySignal {
    pub symbol: SymbolKey,
    pub ready: bool,
    pub reason: Option<SkipReason>,
    pub required_gross_exit_bps: Decimal,
    pub stop_loss_bps: Decimal,
    pub expected_value_bps: f64,
    pub p_win: f64,
    pub spread_bps: Decimal,
    #[serde(skip)]
    pub quote: Option<Quote>,
}

impl EntrySignal {
    fn skip(symbol: &SymbolKey, reason: SkipReason) -> Self {
        Self {
            symbol: symbol.clone(),
            ready: false,
            reason: Some(reason),
            required_gross_exit_bps: Decimal::ZERO,
            stop_loss_bps: Decimal::ZERO,
            expected_value_bps: 0.0,
            p_win: 0.0,
            spread_bps: Decimal::ZERO,
            quote: None,
        }
    }
}

/// Per-symbol EWMA state carried across scans.
#[derive(Debug, Clone, Default)]
struct SymbolStats {
    /// EWMA of squared per-bar log returns
    var_ewma: f64,
    vol_samples: usize,
    /// EWMA-smoothed observed spread in bps
    spread_ewma_bps: f64,
    /// EWMA-smoothed slippage estimate in bps (from book impact)
    slippage_ewma_bps: f64,
    last_bar_ts: Option<chrono::DateTime<Utc>>,
}

/// Probability that price touches the profit target before the stop,
/// under a driftless assumption: `stop / (profit + stop)`, clamped.
pub fn barrier_touch_probability(profit_bps: f64, stop_bps: f64) -> f64 {
    if profit_bps + stop_bps <= 0.0 {
        return 0.5;
    }
    (stop_bps / (profit_bps + stop_bps)).clamp(0.05, 0.95)
}

/// Clamp a bias contribution to its allowed band.
pub fn clamped_bias(raw: f64, band: f64) -> f64 {
    raw.clamp(-band, band)
}

/// Expected value in bps: `p*win - (1-p)*loss - fees - spread - slippage`.
pub fn expected_value_bps(
    p_win: f64,
    win_bps: f64,
    loss_bps: f64,
    fee_bps: f64,
    spread_bps: f64,
    slippage_bps: f64,
) -> f64 {
    p_win * win_bps - (1.0 - p_win) * loss_bps - fee_bps - spread_bps - slippage_bps
}

/// EWMA update with a half-life expressed in samples.
fn ewma_update(prev: f64, sample: f64, half_life: f64, initialized: bool) -> f64 {
    if !initialized {
        return sample;
    }
    let alpha = 1.0 - (-std::f64::consts::LN_2 / half_life.max(1.0)).exp();
    prev + alpha * (sample - prev)
}

pub struct SignalEngine {
    quotes: Arc<QuoteService>,
    data: Arc<dyn MarketDataClient>,
    entry_cfg: EntryConfig,
    pricing_cfg: PricingConfig,
    stats: DashMap<SymbolKey, SymbolStats>,
}

impl SignalEngine {
    pub fn new(
        quotes: Arc<QuoteService>,
        data: Arc<dyn MarketDataClient>,
        entry_cfg: EntryConfig,
        pricing_cfg: PricingConfig,
    ) -> Self {
        Self {
            quotes,
            data,
            entry_cfg,
            pricing_cfg,
            stats: DashMap::new(),
        }
    }

    /// Evaluate all gates for one symbol.
    pub async fn evaluate(&self, symbol: &SymbolKey, max_quote_age_ms: i64) -> EntrySignal {
        // Gate 1: quote availability and validity
        let quote = match self.quotes.get_quote(symbol, max_quote_age_ms).await {
            Ok(q) => q,
            Err(e) => {
                debug!(symbol = %symbol, "entry skip: {e}");
                return EntrySignal::skip(symbol, SkipReason::QuoteUnavailable(e.to_string()));
            }
        };

        // Gate 2: spread
        let spread_bps = quote.spread_bps();
        self.update_spread_ewma(symbol, spread_bps);
        if spread_bps > Decimal::from(self.entry_cfg.max_spread_bps) {
            debug!(symbol = %symbol, spread = %spread_bps, "entry skip: spread_gate");
            let mut sig = EntrySignal::skip(symbol, SkipReason::SpreadGate);
            sig.spread_bps = spread_bps;
            return sig;
        }

        // Gate 3: order-book depth and impact (optional; crypto books only)
        let mut obi = 0.0f64;
        if self.entry_cfg.orderbook_gate && symbol.is_crypto() {
            match self.data.orderbook(symbol).await {
                Ok(book) => {
                    if let Some(reason) = self.book_gate(symbol, &book) {
                        let mut sig = EntrySignal::skip(symbol, reason);
                        sig.spread_bps = spread_bps;
                        return sig;
                    }
                    obi = book.imbalance(5).to_f64().unwrap_or(0.0);
                }
                Err(e) => {
                    // No book is not a rejection; the depth gate just
                    // cannot add information this scan.
                    debug!(symbol = %symbol, "orderbook unavailable: {e}");
                }
            }
        }

        // Gate 4: bar history
        let bars = match self
            .data
            .bars(symbol, self.entry_cfg.bar_limit)
            .await
        {
            Ok(b) => b,
            Err(e) => {
                debug!(symbol = %symbol, "bars unavailable: {e}");
                return EntrySignal::skip(symbol, SkipReason::QuoteUnavailable(e.to_string()));
            }
        };
        if bars.len() < self.entry_cfg.min_bar_samples {
            return EntrySignal::skip(symbol, SkipReason::InsufficientBars);
        }

        // Gate 5: EWMA realized volatility from log returns
        let sigma_bps = self.update_volatility(symbol, &bars);

        // Gate 6: required move, stop distance, touch probability
        let req = ExitRequirement {
            desired_net_bps: self.pricing_cfg.desired_net_bps,
            entry_fee_bps: self.pricing_cfg.maker_fee_bps,
            exit_fee_bps: self.pricing_cfg.maker_fee_bps,
            slippage_bps: self.pricing_cfg.slippage_bps,
            spread_buffer_bps: self.pricing_cfg.spread_buffer_bps,
            profit_buffer_bps: self.pricing_cfg.profit_buffer_bps,
            cap_bps: self.pricing_cfg.cap_bps,
            min_gross_tp_bps: self.pricing_cfg.min_gross_tp_bps,
        };
        let required_bps = pricing::spread_aware_required_bps(
            pricing::required_exit_bps(&req),
            spread_bps,
            self.pricing_cfg.spread_clamp_floor_bps,
            self.pricing_cfg.spread_clamp_cap_bps,
            self.pricing_cfg.spread_mult,
            self.pricing_cfg.spread_add_bps,
        );

        let stop_bps_f = (sigma_bps * self.entry_cfg.stop_vol_mult)
            .max(self.entry_cfg.min_stop_bps as f64);
        let stop_bps = Decimal::from_f64_retain(stop_bps_f)
            .unwrap_or(Decimal::from(self.entry_cfg.min_stop_bps))
            .round_dp(2);

        let profit_bps_f = required_bps.to_f64().unwrap_or(0.0);
        let mut p_win = barrier_touch_probability(profit_bps_f, stop_bps_f);

        // Microstructure: where the mid sits versus the last close
        let last_close = bars.last().map(|b| b.close).unwrap_or(Decimal::ZERO);
        let micro_bps = if last_close > Decimal::ZERO {
            ((quote.mid() / last_close - Decimal::ONE) * Decimal::from(10_000))
                .to_f64()
                .unwrap_or(0.0)
        } else {
            0.0
        };
        p_win += clamped_bias(micro_bps / (2.0 * sigma_bps.max(1.0)) * 0.08, 0.08);

        // Momentum: trailing 5-bar return scaled by volatility
        let momentum_bps = trailing_return_bps(&bars, 5);
        p_win += clamped_bias(
            momentum_bps / (sigma_bps.max(1.0) * 5.0f64.sqrt()) * 0.15,
            0.15,
        );

        // Order-book imbalance, already in [-1, 1]
        p_win += clamped_bias(obi * 0.05, 0.05);
        p_win = p_win.clamp(0.05, 0.95);

        // Gate 7: expected value
        let stats = self.stats.get(symbol).map(|s| s.clone()).unwrap_or_default();
        let fee_bps = (self.pricing_cfg.maker_fee_bps * Decimal::from(2))
            .to_f64()
            .unwrap_or(0.0);
        let ev = expected_value_bps(
            p_win,
            profit_bps_f,
            stop_bps_f,
            fee_bps,
            stats.spread_ewma_bps,
            stats.slippage_ewma_bps,
        );
        if self.entry_cfg.ev_guard && ev < self.entry_cfg.min_ev_bps {
            debug!(symbol = %symbol, ev_bps = ev, "entry skip: ev_floor");
            let mut sig = EntrySignal::skip(symbol, SkipReason::EvFloor);
            sig.expected_value_bps = ev;
            sig.p_win = p_win;
            sig.spread_bps = spread_bps;
            return sig;
        }

        EntrySignal {
            symbol: symbol.clone(),
            ready: true,
            reason: None,
            required_gross_exit_bps: required_bps,
            stop_loss_bps: stop_bps,
            expected_value_bps: ev,
            p_win,
            spread_bps,
            quote: Some(quote),
        }
    }

    fn book_gate(&self, symbol: &SymbolKey, book: &Orderbook) -> Option<SkipReason> {
        let depth = book.ask_depth_within_bps(self.entry_cfg.depth_band_bps);
        if depth < self.entry_cfg.min_depth_usd {
            debug!(symbol = %symbol, %depth, "entry skip: thin_book");
            return Some(SkipReason::ThinBook);
        }
        match book.impact_bps(self.entry_cfg.reference_notional_usd) {
            Some(impact) => {
                // Feed the slippage estimator before gating
                self.update_slippage_ewma(symbol, impact);
                if impact > Decimal::from(self.entry_cfg.max_impact_bps) {
                    debug!(symbol = %symbol, %impact, "entry skip: impact_gate");
                    return Some(SkipReason::ImpactGate);
                }
                None
            }
            None => {
                debug!(symbol = %symbol, "entry skip: book too thin for reference notional");
                Some(SkipReason::ThinBook)
            }
        }
    }

    fn update_spread_ewma(&self, symbol: &SymbolKey, spread_bps: Decimal) {
        let sample = spread_bps.to_f64().unwrap_or(0.0);
        let mut stats = self.stats.entry(symbol.clone()).or_default();
        let initialized = stats.spread_ewma_bps > 0.0;
        stats.spread_ewma_bps = ewma_update(
            stats.spread_ewma_bps,
            sample,
            self.entry_cfg.vol_half_life_bars,
            initialized,
        );
    }

    fn update_slippage_ewma(&self, symbol: &SymbolKey, impact_bps: Decimal) {
        let sample = impact_bps.to_f64().unwrap_or(0.0);
        let mut stats = self.stats.entry(symbol.clone()).or_default();
        let initialized = stats.slippage_ewma_bps > 0.0;
        stats.slippage_ewma_bps = ewma_update(
            stats.slippage_ewma_bps,
            sample,
            self.entry_cfg.vol_half_life_bars,
            initialized,
        );
    }

    /// Fold new bars into the per-symbol variance EWMA; returns the
    /// current per-bar volatility estimate in bps.
    fn update_volatility(&self, symbol: &SymbolKey, bars: &[crate::domain::Bar]) -> f64 {
        let mut stats = self.stats.entry(symbol.clone()).or_default();

        let mut prev_close: Option<f64> = None;
        for bar in bars {
            // Only bars newer than the last fold advance the estimate
            let is_new = stats.last_bar_ts.is_none_or(|ts| bar.timestamp > ts);
            let close = bar.close.to_f64().unwrap_or(0.0);
            if close <= 0.0 {
                continue;
            }
            if let Some(prev) = prev_close {
                if is_new && prev > 0.0 {
                    let r = (close / prev).ln();
                    stats.var_ewma = ewma_update(
                        stats.var_ewma,
                        r * r,
                        self.entry_cfg.vol_half_life_bars,
                        stats.vol_samples > 0,
                    );
                    stats.vol_samples += 1;
                    stats.last_bar_ts = Some(bar.timestamp);
                }
            }
            prev_close = Some(close);
        }

        stats.var_ewma.sqrt() * 10_000.0
    }

    /// Current EWMA estimates for a symbol, for status snapshots.
    pub fn estimates(&self, symbol: &SymbolKey) -> Option<(f64, f64, f64)> {
        self.stats
            .get(symbol)
            .map(|s| (s.var_ewma.sqrt() * 10_000.0, s.spread_ewma_bps, s.slippage_ewma_bps))
    }
}

fn trailing_return_bps(bars: &[crate::domain::Bar], window: usize) -> f64 {
    if bars.len() < window + 1 {
        return 0.0;
    }
    let last = bars[bars.len() - 1].close.to_f64().unwrap_or(0.0);
    let base = bars[bars.len() - 1 - window].close.to_f64().unwrap_or(0.0);
    if base <= 0.0 {
        return 0.0;
    }
    (last / base - 1.0) * 10_000.0
}
