use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub broker: BrokerConfig,
    pub symbols: SymbolsConfig,
    #[serde(default)]
    pub quotes: QuotesConfig,
    #[serde(default)]
    pub entry: EntryConfig,
    #[serde(default)]
    pub pricing: PricingConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    pub dry_run: DryRunConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// REST API endpoint for trading (account, orders, positions)
    pub trading_url: String,
    /// REST API endpoint for market data (quotes, trades, bars, orderbooks)
    pub data_url: String,
    /// API key id
    pub key_id: String,
    /// API secret
    pub secret: String,
    /// Timeout for market-data reads in milliseconds
    #[serde(default = "default_data_timeout_ms")]
    pub data_timeout_ms: u64,
    /// Timeout for order mutations in milliseconds
    #[serde(default = "default_trading_timeout_ms")]
    pub trading_timeout_ms: u64,
    /// Maximum concurrent in-flight trading requests
    #[serde(default = "default_trading_concurrency")]
    pub trading_concurrency: usize,
    /// Maximum concurrent in-flight market-data requests
    #[serde(default = "default_data_concurrency")]
    pub data_concurrency: usize,
    /// Bounded retry attempts for idempotent reads
    #[serde(default = "default_max_retries")]
    pub max_retries: u8,
}

fn default_data_timeout_ms() -> u64 {
    3_000
}
fn default_trading_timeout_ms() -> u64 {
    10_000
}
fn default_trading_concurrency() -> usize {
    4
}
fn default_data_concurrency() -> usize {
    8
}
fn default_max_retries() -> u8 {
    3
}

#[derive(Debug, Clone, Deserialize)]
pub struct SymbolsConfig {
    /// Instruments to scan, in canonical form ("BTC/USD", "AAPL")
    pub watch: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuotesConfig {
    /// Cache TTL for crypto quotes in milliseconds
    #[serde(default = "default_crypto_ttl_ms")]
    pub crypto_ttl_ms: i64,
    /// Cache TTL for equity quotes in milliseconds
    #[serde(default = "default_equity_ttl_ms")]
    pub equity_ttl_ms: i64,
    /// Maximum acceptable quote age in milliseconds
    #[serde(default = "default_max_age_ms")]
    pub max_age_ms: i64,
    /// Age above which a quote timestamp is treated as a clock anomaly
    #[serde(default = "default_absurd_age_ms")]
    pub absurd_age_ms: i64,
    /// Consecutive non-stale failures before a per-symbol cooldown
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Per-symbol cooldown window in milliseconds
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: i64,
    /// Global market-data failures before the circuit breaker opens
    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: u32,
    /// Global circuit-breaker window in milliseconds
    #[serde(default = "default_breaker_cooldown_ms")]
    pub breaker_cooldown_ms: i64,
}

fn default_crypto_ttl_ms() -> i64 {
    2_000
}
fn default_equity_ttl_ms() -> i64 {
    5_000
}
fn default_max_age_ms() -> i64 {
    30_000
}
fn default_absurd_age_ms() -> i64 {
    86_400_000 // 24h: anything older is a clock anomaly, not a quote
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_cooldown_ms() -> i64 {
    60_000
}
fn default_breaker_threshold() -> u32 {
    10
}
fn default_breaker_cooldown_ms() -> i64 {
    120_000
}

impl Default for QuotesConfig {
    fn default() -> Self {
        Self {
            crypto_ttl_ms: default_crypto_ttl_ms(),
            equity_ttl_ms: default_equity_ttl_ms(),
            max_age_ms: default_max_age_ms(),
            absurd_age_ms: default_absurd_age_ms(),
            failure_threshold: default_failure_threshold(),
            cooldown_ms: default_cooldown_ms(),
            breaker_threshold: default_breaker_threshold(),
            breaker_cooldown_ms: default_breaker_cooldown_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EntryConfig {
    /// Seconds between entry scans
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,
    /// Maximum spread in basis points to accept
    #[serde(default = "default_max_spread_bps")]
    pub max_spread_bps: i64,
    /// Enable the order-book depth/impact gate
    #[serde(default = "default_true")]
    pub orderbook_gate: bool,
    /// Minimum USD notional resting within the price band
    #[serde(default = "default_min_depth_usd")]
    pub min_depth_usd: Decimal,
    /// Band around best ask for the depth check (bps)
    #[serde(default = "default_depth_band_bps")]
    pub depth_band_bps: i64,
    /// Maximum estimated price impact for the reference notional (bps)
    #[serde(default = "default_max_impact_bps")]
    pub max_impact_bps: i64,
    /// Reference notional used to estimate the impact of an entry
    #[serde(default = "default_reference_notional_usd")]
    pub reference_notional_usd: Decimal,
    /// Minimum bar closes required before the volatility estimate is trusted
    #[serde(default = "default_min_bar_samples")]
    pub min_bar_samples: usize,
    /// Bars fetched per scan
    #[serde(default = "default_bar_limit")]
    pub bar_limit: usize,
    /// EWMA half-life in bars for realized-volatility estimation
    #[serde(default = "default_vol_half_life_bars")]
    pub vol_half_life_bars: f64,
    /// Stop-loss distance as a multiple of per-bar realized volatility
    #[serde(default = "default_stop_vol_mult")]
    pub stop_vol_mult: f64,
    /// Floor for the volatility-scaled stop distance (bps)
    #[serde(default = "default_min_stop_bps")]
    pub min_stop_bps: i64,
    /// Reject entries whose expected value falls below this floor (bps)
    #[serde(default = "default_min_ev_bps")]
    pub min_ev_bps: f64,
    /// Enable the expected-value floor gate
    #[serde(default = "default_true")]
    pub ev_guard: bool,
}

fn default_scan_interval_secs() -> u64 {
    15
}
fn default_max_spread_bps() -> i64 {
    25
}
fn default_true() -> bool {
    true
}
fn default_min_depth_usd() -> Decimal {
    Decimal::from(5_000)
}
fn default_depth_band_bps() -> i64 {
    20
}
fn default_max_impact_bps() -> i64 {
    10
}
fn default_reference_notional_usd() -> Decimal {
    Decimal::from(1_000)
}
fn default_min_bar_samples() -> usize {
    20
}
fn default_bar_limit() -> usize {
    60
}
fn default_vol_half_life_bars() -> f64 {
    10.0
}
fn default_stop_vol_mult() -> f64 {
    2.0
}
fn default_min_stop_bps() -> i64 {
    30
}
fn default_min_ev_bps() -> f64 {
    0.0
}

impl Default for EntryConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: default_scan_interval_secs(),
            max_spread_bps: default_max_spread_bps(),
            orderbook_gate: true,
            min_depth_usd: default_min_depth_usd(),
            depth_band_bps: default_depth_band_bps(),
            max_impact_bps: default_max_impact_bps(),
            reference_notional_usd: default_reference_notional_usd(),
            min_bar_samples: default_min_bar_samples(),
            bar_limit: default_bar_limit(),
            vol_half_life_bars: default_vol_half_life_bars(),
            stop_vol_mult: default_stop_vol_mult(),
            min_stop_bps: default_min_stop_bps(),
            min_ev_bps: default_min_ev_bps(),
            ev_guard: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PricingConfig {
    /// Desired net profit after all fees and costs (bps)
    #[serde(default = "default_desired_net_bps")]
    pub desired_net_bps: Decimal,
    /// Assumed slippage cost (bps)
    #[serde(default = "default_slippage_bps")]
    pub slippage_bps: Decimal,
    /// Buffer added for spread risk (bps)
    #[serde(default = "default_spread_buffer_bps")]
    pub spread_buffer_bps: Decimal,
    /// Extra profit buffer (bps)
    #[serde(default = "default_profit_buffer_bps")]
    pub profit_buffer_bps: Decimal,
    /// Cap on the required gross move (bps); never cuts below the safety floor
    #[serde(default = "default_cap_bps")]
    pub cap_bps: Decimal,
    /// Floor on the required gross move (bps)
    #[serde(default = "default_min_gross_tp_bps")]
    pub min_gross_tp_bps: Decimal,
    /// Spread clamp floor for the spread-aware requirement (bps)
    #[serde(default = "default_spread_clamp_floor_bps")]
    pub spread_clamp_floor_bps: Decimal,
    /// Spread clamp cap (bps)
    #[serde(default = "default_spread_clamp_cap_bps")]
    pub spread_clamp_cap_bps: Decimal,
    /// Multiplier applied to the clamped spread
    #[serde(default = "default_spread_mult")]
    pub spread_mult: Decimal,
    /// Additive term applied after the spread multiplier (bps)
    #[serde(default = "default_spread_add_bps")]
    pub spread_add_bps: Decimal,
    /// Maker fee (bps, one way)
    #[serde(default = "default_maker_fee_bps")]
    pub maker_fee_bps: Decimal,
    /// Taker fee (bps, one way)
    #[serde(default = "default_taker_fee_bps")]
    pub taker_fee_bps: Decimal,
    /// Default price tick size when the asset does not report one
    #[serde(default = "default_tick_size")]
    pub default_tick_size: Decimal,
}

fn default_desired_net_bps() -> Decimal {
    Decimal::from(100)
}
fn default_slippage_bps() -> Decimal {
    Decimal::from(5)
}
fn default_spread_buffer_bps() -> Decimal {
    Decimal::from(5)
}
fn default_profit_buffer_bps() -> Decimal {
    Decimal::from(5)
}
fn default_cap_bps() -> Decimal {
    Decimal::from(500)
}
fn default_min_gross_tp_bps() -> Decimal {
    Decimal::from(20)
}
fn default_spread_clamp_floor_bps() -> Decimal {
    Decimal::from(2)
}
fn default_spread_clamp_cap_bps() -> Decimal {
    Decimal::from(50)
}
fn default_spread_mult() -> Decimal {
    Decimal::from(2)
}
fn default_spread_add_bps() -> Decimal {
    Decimal::from(10)
}
fn default_maker_fee_bps() -> Decimal {
    Decimal::from(15)
}
fn default_taker_fee_bps() -> Decimal {
    Decimal::from(25)
}
fn default_tick_size() -> Decimal {
    use rust_decimal_macros::dec;
    dec!(0.01)
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            desired_net_bps: default_desired_net_bps(),
            slippage_bps: default_slippage_bps(),
            spread_buffer_bps: default_spread_buffer_bps(),
            profit_buffer_bps: default_profit_buffer_bps(),
            cap_bps: default_cap_bps(),
            min_gross_tp_bps: default_min_gross_tp_bps(),
            spread_clamp_floor_bps: default_spread_clamp_floor_bps(),
            spread_clamp_cap_bps: default_spread_clamp_cap_bps(),
            spread_mult: default_spread_mult(),
            spread_add_bps: default_spread_add_bps(),
            maker_fee_bps: default_maker_fee_bps(),
            taker_fee_bps: default_taker_fee_bps(),
            default_tick_size: default_tick_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LifecycleConfig {
    /// Seconds between management ticks per symbol
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// Fraction of buying power committed per entry (0..1)
    #[serde(default = "default_portfolio_fraction")]
    pub portfolio_fraction: Decimal,
    /// Minimum order notional in USD; entries below are skipped
    #[serde(default = "default_min_notional_usd")]
    pub min_notional_usd: Decimal,
    /// Minimum order quantity; entries below are skipped
    #[serde(default = "default_min_qty")]
    pub min_qty: Decimal,
    /// Entry fill-wait timeout in milliseconds
    #[serde(default = "default_entry_timeout_ms")]
    pub entry_timeout_ms: u64,
    /// Polling interval while waiting for fills, milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Fall back to a market entry when the limit times out and the
    /// spread is still within the gate
    #[serde(default)]
    pub market_fallback: bool,
    /// Enable taker-on-touch exits
    #[serde(default = "default_true")]
    pub taker_exits: bool,
    /// Minimum seconds between taker flips / reprices per symbol
    #[serde(default = "default_action_cooldown_secs")]
    pub action_cooldown_secs: u64,
    /// Force-exit positions older than this many seconds
    #[serde(default = "default_force_exit_secs")]
    pub force_exit_secs: u64,
    /// Allow the force-exit to realize a loss
    #[serde(default)]
    pub force_exit_at_loss: bool,
    /// Exit positions held longer than this if still profitable (seconds)
    #[serde(default = "default_max_hold_secs")]
    pub max_hold_secs: u64,
    /// Minimum resting-order age before a reprice is considered (seconds)
    #[serde(default = "default_reprice_min_age_secs")]
    pub reprice_min_age_secs: u64,
    /// Minimum distance between the resting limit and the desired limit
    /// before a reprice is considered (bps)
    #[serde(default = "default_reprice_min_distance_bps")]
    pub reprice_min_distance_bps: Decimal,
    /// Entry-intent expiry in seconds
    #[serde(default = "default_intent_ttl_secs")]
    pub intent_ttl_secs: u64,
}

fn default_tick_interval_secs() -> u64 {
    5
}
fn default_portfolio_fraction() -> Decimal {
    use rust_decimal_macros::dec;
    dec!(0.10)
}
fn default_min_notional_usd() -> Decimal {
    Decimal::from(10)
}
fn default_min_qty() -> Decimal {
    use rust_decimal_macros::dec;
    dec!(0.0001)
}
fn default_entry_timeout_ms() -> u64 {
    30_000
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_action_cooldown_secs() -> u64 {
    10
}
fn default_force_exit_secs() -> u64 {
    14_400 // 4h
}
fn default_max_hold_secs() -> u64 {
    3_600
}
fn default_reprice_min_age_secs() -> u64 {
    30
}
fn default_reprice_min_distance_bps() -> Decimal {
    Decimal::from(5)
}
fn default_intent_ttl_secs() -> u64 {
    120
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval_secs(),
            portfolio_fraction: default_portfolio_fraction(),
            min_notional_usd: default_min_notional_usd(),
            min_qty: default_min_qty(),
            entry_timeout_ms: default_entry_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            market_fallback: false,
            taker_exits: true,
            action_cooldown_secs: default_action_cooldown_secs(),
            force_exit_secs: default_force_exit_secs(),
            force_exit_at_loss: false,
            max_hold_secs: default_max_hold_secs(),
            reprice_min_age_secs: default_reprice_min_age_secs(),
            reprice_min_distance_bps: default_reprice_min_distance_bps(),
            intent_ttl_secs: default_intent_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconciliationConfig {
    /// Seconds between reconciliation passes
    #[serde(default = "default_reconcile_interval_secs")]
    pub interval_secs: u64,
    /// Block all new entries while unrepaired orphans exist
    #[serde(default = "default_true")]
    pub halt_on_orphans: bool,
    /// Residual quantities at or below this are ignored
    #[serde(default = "default_dust_qty")]
    pub dust_qty: Decimal,
}

fn default_reconcile_interval_secs() -> u64 {
    30
}
fn default_dust_qty() -> Decimal {
    use rust_decimal_macros::dec;
    dec!(0.000001)
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reconcile_interval_secs(),
            halt_on_orphans: true,
            dust_qty: default_dust_qty(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    /// Maximum symbols with an open position at once (0 = unlimited)
    #[serde(default = "default_max_active_symbols")]
    pub max_active_symbols: usize,
}

fn default_max_active_symbols() -> usize {
    5
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_active_symbols: default_max_active_symbols(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DryRunConfig {
    /// Enable dry run mode (no real orders)
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("dry_run.enabled", true)?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            .add_source(
                File::from(config_dir.join(
                    std::env::var("SKIMMER_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (SKIMMER_BROKER__KEY_ID, etc.)
            .add_source(
                Environment::with_prefix("SKIMMER")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.symbols.watch.is_empty() {
            errors.push("symbols.watch must not be empty".to_string());
        }

        if self.lifecycle.portfolio_fraction <= Decimal::ZERO
            || self.lifecycle.portfolio_fraction > Decimal::ONE
        {
            errors.push("lifecycle.portfolio_fraction must be in (0, 1]".to_string());
        }

        if self.pricing.desired_net_bps < Decimal::ZERO {
            errors.push("pricing.desired_net_bps must be non-negative".to_string());
        }

        if self.pricing.maker_fee_bps < Decimal::ZERO || self.pricing.taker_fee_bps < Decimal::ZERO
        {
            errors.push("fees must be non-negative".to_string());
        }

        if self.quotes.max_age_ms <= 0 {
            errors.push("quotes.max_age_ms must be positive".to_string());
        }

        if self.quotes.absurd_age_ms <= self.quotes.max_age_ms {
            errors.push("quotes.absurd_age_ms must exceed quotes.max_age_ms".to_string());
        }

        if self.entry.max_spread_bps <= 0 {
            errors.push("entry.max_spread_bps must be positive".to_string());
        }

        if self.lifecycle.force_exit_secs <= self.lifecycle.max_hold_secs {
            errors.push(
                "lifecycle.force_exit_secs should exceed lifecycle.max_hold_secs".to_string(),
            );
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn base_config() -> AppConfig {
        AppConfig {
            broker: BrokerConfig {
                trading_url: "https://paper-api.example.com".into(),
                data_url: "https://data.example.com".into(),
                key_id: "key".into(),
                secret: "secret".into(),
                data_timeout_ms: default_data_timeout_ms(),
                trading_timeout_ms: default_trading_timeout_ms(),
                trading_concurrency: default_trading_concurrency(),
                data_concurrency: default_data_concurrency(),
                max_retries: default_max_retries(),
            },
            symbols: SymbolsConfig {
                watch: vec!["BTC/USD".into(), "AAPL".into()],
            },
            quotes: QuotesConfig::default(),
            entry: EntryConfig::default(),
            pricing: PricingConfig::default(),
            lifecycle: LifecycleConfig::default(),
            reconciliation: ReconciliationConfig::default(),
            risk: RiskConfig::default(),
            dry_run: DryRunConfig { enabled: true },
            logging: LoggingConfig::default(),
        }
    }

    #[test]
    fn default_config_validates() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn rejects_empty_watchlist() {
        let mut cfg = base_config();
        cfg.symbols.watch.clear();
        let errors = cfg.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("watch")));
    }

    #[test]
    fn rejects_bad_portfolio_fraction() {
        let mut cfg = base_config();
        cfg.lifecycle.portfolio_fraction = dec!(1.5);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_absurd_age_below_max_age() {
        let mut cfg = base_config();
        cfg.quotes.absurd_age_ms = cfg.quotes.max_age_ms - 1;
        assert!(cfg.validate().is_err());
    }
}
