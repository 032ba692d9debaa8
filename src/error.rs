use thiserror::Error;

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum SkimmerError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Network errors (timeout / connection)
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("HTTP {status}: {snippet}")]
    Http { status: u16, snippet: String },

    #[error("Rate limited: {0}")]
    RateLimited(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Quote / market data errors
    #[error("No market data for {symbol}")]
    NoData { symbol: String },

    #[error("Stale quote for {symbol}: age {age_ms}ms > max {max_age_ms}ms")]
    StaleQuote {
        symbol: String,
        age_ms: i64,
        max_age_ms: i64,
    },

    #[error("Absurd quote age for {symbol}: {age_ms}ms")]
    AbsurdQuoteAge { symbol: String, age_ms: i64 },

    #[error("Quote cooldown for {symbol}: {remaining_ms}ms remaining")]
    QuoteCooldown { symbol: String, remaining_ms: i64 },

    #[error("Market data cooldown: {remaining_ms}ms remaining")]
    MarketDataCooldown { remaining_ms: i64 },

    #[error("Invalid market data: {0}")]
    InvalidMarketData(String),

    // Skip conditions (not failures; logged as structured skip reasons)
    #[error("Insufficient liquidity: {0}")]
    InsufficientLiquidity(String),

    #[error("Spread too wide: {spread_bps} bps > {max_bps} bps")]
    SpreadTooWide { spread_bps: i64, max_bps: i64 },

    #[error("Notional too small: {notional} < {min_notional}")]
    NotionalTooSmall {
        notional: rust_decimal::Decimal,
        min_notional: rust_decimal::Decimal,
    },

    // Order execution errors
    #[error("Order submission failed: {0}")]
    OrderSubmission(String),

    #[error("Order rejected ({code}): {message}")]
    OrderRejected { code: String, message: String },

    #[error("Order timeout after {elapsed_ms}ms")]
    OrderTimeout { elapsed_ms: u64 },

    #[error("Order not found: {order_id}")]
    OrderNotFound { order_id: String },

    #[error("Duplicate entry intent for {symbol}: {reason}")]
    ExistingEntryIntent { symbol: String, reason: String },

    // Risk / guard errors
    #[error("Entries halted: {0}")]
    EntriesHalted(String),

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for SkimmerError
pub type Result<T> = std::result::Result<T, SkimmerError>;

impl SkimmerError {
    /// Whether a bounded retry is appropriate.
    ///
    /// Network timeouts and 5xx responses are retryable; everything else
    /// either has a dedicated fallback path (stale quotes) or is deliberate
    /// (cooldowns, skips, rejections).
    pub fn is_retryable(&self) -> bool {
        match self {
            SkimmerError::Network(_) => true,
            SkimmerError::Http { status, .. } => *status >= 500,
            SkimmerError::RateLimited(_) => true,
            _ => false,
        }
    }

    /// Skip conditions are expected outcomes of gating, not failures.
    /// They advance no failure counters and are logged at debug level.
    pub fn is_skip(&self) -> bool {
        matches!(
            self,
            SkimmerError::InsufficientLiquidity(_)
                | SkimmerError::SpreadTooWide { .. }
                | SkimmerError::NotionalTooSmall { .. }
                | SkimmerError::ExistingEntryIntent { .. }
                | SkimmerError::EntriesHalted(_)
        )
    }

    /// Terminal order failures clear the tracked order reference so the
    /// next management tick recreates it; everything else holds state.
    pub fn is_terminal_order_failure(&self) -> bool {
        matches!(
            self,
            SkimmerError::OrderRejected { .. } | SkimmerError::OrderNotFound { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(SkimmerError::Http {
            status: 503,
            snippet: "unavailable".into()
        }
        .is_retryable());
        assert!(!SkimmerError::Http {
            status: 403,
            snippet: "forbidden".into()
        }
        .is_retryable());
        assert!(!SkimmerError::QuoteCooldown {
            symbol: "BTC/USD".into(),
            remaining_ms: 1000
        }
        .is_retryable());
    }

    #[test]
    fn skip_classification() {
        assert!(SkimmerError::SpreadTooWide {
            spread_bps: 40,
            max_bps: 25
        }
        .is_skip());
        assert!(!SkimmerError::StaleQuote {
            symbol: "AAPL".into(),
            age_ms: 600_000,
            max_age_ms: 30_000
        }
        .is_skip());
    }

    #[test]
    fn terminal_order_failures() {
        assert!(SkimmerError::OrderRejected {
            code: "insufficient_buying_power".into(),
            message: "not enough cash".into()
        }
        .is_terminal_order_failure());
        assert!(!SkimmerError::OrderTimeout { elapsed_ms: 5000 }.is_terminal_order_failure());
    }
}
