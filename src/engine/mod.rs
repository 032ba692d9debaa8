//! Engine wiring: owns the component graph and the three periodic loops
//! (entry scan, lifecycle tick, reconciliation).

pub mod entry;
pub mod guard;
pub mod lifecycle;
pub mod pnl;
pub mod pricing;
pub mod quotes;
pub mod reconcile;
pub mod signal;
pub mod status;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerClient, MarketDataClient};
use crate::config::AppConfig;
use crate::domain::SymbolKey;
use crate::error::{Result, SkimmerError};
use self::entry::EntryExecutor;
use self::guard::{ConcurrencyGuard, MarketDataBreaker};
use self::lifecycle::LifecycleEngine;
use self::pnl::PnlLog;
use self::quotes::QuoteService;
use self::reconcile::Reconciler;
use self::signal::SignalEngine;
use self::status::StatusReport;

pub struct Engine {
    cfg: AppConfig,
    watchlist: std::sync::RwLock<Vec<SymbolKey>>,
    broker: Arc<dyn BrokerClient>,
    quotes: Arc<QuoteService>,
    guard: Arc<ConcurrencyGuard>,
    signals: Arc<SignalEngine>,
    lifecycle: Arc<LifecycleEngine>,
    entries: Arc<EntryExecutor>,
    reconciler: Arc<Reconciler>,
    pnl: Arc<PnlLog>,
    running: AtomicBool,
}

impl Engine {
    pub fn new(
        cfg: AppConfig,
        broker: Arc<dyn BrokerClient>,
        data: Arc<dyn MarketDataClient>,
    ) -> Result<Self> {
        let watchlist = cfg
            .symbols
            .watch
            .iter()
            .map(|raw| SymbolKey::parse(raw))
            .collect::<Result<Vec<_>>>()?;

        let breaker = Arc::new(MarketDataBreaker::new(
            cfg.quotes.breaker_threshold,
            cfg.quotes.breaker_cooldown_ms,
        ));
        let guard = Arc::new(ConcurrencyGuard::new(breaker.clone()));
        let quotes = Arc::new(QuoteService::new(
            data.clone(),
            cfg.quotes.clone(),
            breaker,
        ));
        let pnl = Arc::new(PnlLog::new());
        let lifecycle = Arc::new(LifecycleEngine::new(
            broker.clone(),
            quotes.clone(),
            guard.clone(),
            pnl.clone(),
            cfg.lifecycle.clone(),
            cfg.quotes.max_age_ms,
        ));
        let signals = Arc::new(SignalEngine::new(
            quotes.clone(),
            data,
            cfg.entry.clone(),
            cfg.pricing.clone(),
        ));
        let entries = Arc::new(EntryExecutor::new(
            broker.clone(),
            quotes.clone(),
            guard.clone(),
            lifecycle.clone(),
            cfg.lifecycle.clone(),
            cfg.pricing.clone(),
            cfg.risk.clone(),
            cfg.entry.max_spread_bps,
            cfg.quotes.max_age_ms,
        ));
        let reconciler = Arc::new(Reconciler::new(
            broker.clone(),
            lifecycle.clone(),
            guard.clone(),
            cfg.reconciliation.clone(),
            cfg.pricing.clone(),
        ));

        Ok(Self {
            cfg,
            watchlist: std::sync::RwLock::new(watchlist),
            broker,
            quotes,
            guard,
            signals,
            lifecycle,
            entries,
            reconciler,
            pnl,
            running: AtomicBool::new(false),
        })
    }

    pub fn watchlist(&self) -> Vec<SymbolKey> {
        self.watchlist
            .read()
            .expect("watchlist lock poisoned")
            .clone()
    }

    /// Verify tradability of every watched instrument at startup; symbols
    /// the broker will not trade are dropped from the scan with a warning.
    pub async fn refresh_assets(&self) -> Vec<SymbolKey> {
        let current = self.watchlist();
        let mut tradable = Vec::with_capacity(current.len());
        for symbol in &current {
            match self.broker.get_asset(symbol).await {
                Ok(asset) if asset.tradable => {
                    debug!(symbol = %symbol, fractionable = asset.fractionable, "asset ok");
                    tradable.push(symbol.clone());
                }
                Ok(_) => warn!(symbol = %symbol, "asset not tradable, dropped from scan"),
                Err(e) => {
                    warn!(symbol = %symbol, "asset lookup failed, keeping anyway: {e}");
                    tradable.push(symbol.clone());
                }
            }
        }
        *self.watchlist.write().expect("watchlist lock poisoned") = tradable.clone();
        tradable
    }

    /// One entry scan over the watchlist.
    pub async fn scan_once(&self) {
        if let Some(reason) = self.guard.entries_halted() {
            debug!(%reason, "scan skipped, entries halted");
            return;
        }
        if self.broker.is_dry_run() {
            debug!("scanning in dry-run mode");
        }

        let watch = self.watchlist();

        // Equities only trade during the session; crypto runs around the
        // clock. A clock failure assumes open rather than stalling the scan.
        let mut market_open = true;
        if watch.iter().any(|s| !s.is_crypto()) {
            match self.broker.get_clock().await {
                Ok(clock) => market_open = clock.is_open,
                Err(e) => debug!("market clock unavailable, assuming open: {e}"),
            }
        }

        for symbol in &watch {
            if !symbol.is_crypto() && !market_open {
                debug!(symbol = %symbol, "market closed, scan skipped");
                continue;
            }
            if self.lifecycle.is_tracked(symbol) {
                continue;
            }
            let sig = self
                .signals
                .evaluate(symbol, self.cfg.quotes.max_age_ms)
                .await;
            if !sig.ready {
                if let Some(reason) = &sig.reason {
                    debug!(symbol = %symbol, %reason, "not ready");
                }
                continue;
            }

            info!(
                symbol = %symbol,
                required_bps = %sig.required_gross_exit_bps,
                stop_bps = %sig.stop_loss_bps,
                p_win = sig.p_win,
                ev_bps = sig.expected_value_bps,
                "entry signal"
            );

            // Broker truth may have drifted since the last timed pass;
            // reconcile before committing new capital so an orphan is
            // repaired, not doubled down on.
            if let Err(e) = self.reconcile_once().await {
                warn!(symbol = %symbol, "pre-entry reconciliation failed, entry skipped: {e}");
                continue;
            }
            if let Some(reason) = self.guard.entries_halted() {
                warn!(%reason, "entries halted mid-scan");
                return;
            }
            if self.lifecycle.is_tracked(symbol) {
                debug!(symbol = %symbol, "position adopted during reconciliation, entry skipped");
                continue;
            }

            match self.entries.try_enter(&sig).await {
                Ok(true) => info!(symbol = %symbol, "position opened"),
                Ok(false) => {}
                Err(e) if e.is_skip() => debug!(symbol = %symbol, "entry skipped: {e}"),
                Err(e) => warn!(symbol = %symbol, "entry failed: {e}"),
            }
        }
    }

    /// Evaluate the entry gates for one symbol without acting on them.
    pub async fn evaluate_symbol(&self, symbol: &SymbolKey) -> signal::EntrySignal {
        self.signals
            .evaluate(symbol, self.cfg.quotes.max_age_ms)
            .await
    }

    pub async fn tick_once(&self) {
        self.lifecycle.tick_all().await;
    }

    pub async fn reconcile_once(&self) -> Result<reconcile::OrphanReport> {
        self.reconciler.reconcile().await
    }

    pub fn status(&self) -> StatusReport {
        status::collect(&self.lifecycle, &self.guard, &self.quotes, &self.pnl)
    }

    /// Spawn the three periodic loops. They stop when `shutdown` is called.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        self.running.store(true, Ordering::SeqCst);
        info!(
            symbols = self.watchlist().len(),
            dry_run = self.broker.is_dry_run(),
            "engine starting"
        );

        let mut handles = Vec::new();

        let engine = self.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(engine.cfg.entry.scan_interval_secs));
            while engine.running.load(Ordering::SeqCst) {
                ticker.tick().await;
                engine.scan_once().await;
            }
        }));

        let engine = self.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker =
                interval(Duration::from_secs(engine.cfg.lifecycle.tick_interval_secs));
            while engine.running.load(Ordering::SeqCst) {
                ticker.tick().await;
                engine.tick_once().await;
            }
        }));

        let engine = self.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(
                engine.cfg.reconciliation.interval_secs,
            ));
            while engine.running.load(Ordering::SeqCst) {
                ticker.tick().await;
                match engine.reconcile_once().await {
                    Ok(report) if !report.is_clean() => {
                        info!(orphans = report.orphans_found, "reconciliation report");
                    }
                    Ok(_) => {}
                    Err(e) => match e {
                        SkimmerError::Network(_) | SkimmerError::Http { .. } => {
                            warn!("reconciliation pass skipped: {e}")
                        }
                        _ => error!("reconciliation failed: {e}"),
                    },
                }
            }
        }));

        handles
    }

    pub fn shutdown(&self) {
        info!("engine shutting down");
        self.running.store(false, Ordering::SeqCst);
        self.pnl.log_summary();
    }
}
