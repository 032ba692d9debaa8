use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::domain::SymbolKey;
use crate::error::{Result, SkimmerError};

/// Where a quote came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuoteSource {
    /// Best bid/ask from the quotes endpoint
    Quotes,
    /// Synthesized from the latest trade (bid = ask = trade price)
    LastTrade,
    /// Cached copy of an earlier fetch
    Cache,
}

impl std::fmt::Display for QuoteSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuoteSource::Quotes => write!(f, "quotes"),
            QuoteSource::LastTrade => write!(f, "last_trade"),
            QuoteSource::Cache => write!(f, "cache"),
        }
    }
}

/// A validated best bid/ask observation. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub bid: Decimal,
    pub ask: Decimal,
    pub observed_at: DateTime<Utc>,
    pub source: QuoteSource,
}

impl Quote {
    /// Construct a quote, rejecting (never clamping) invalid bid/ask.
    pub fn new(
        symbol: &SymbolKey,
        bid: Decimal,
        ask: Decimal,
        observed_at: DateTime<Utc>,
        source: QuoteSource,
    ) -> Result<Self> {
        if bid <= Decimal::ZERO || ask <= Decimal::ZERO {
            return Err(SkimmerError::InvalidMarketData(format!(
                "{symbol}: non-positive bid/ask {bid}/{ask}"
            )));
        }
        if bid > ask {
            return Err(SkimmerError::InvalidMarketData(format!(
                "{symbol}: crossed quote bid {bid} > ask {ask}"
            )));
        }
        Ok(Self {
            bid,
            ask,
            observed_at,
            source,
        })
    }

    /// Synthesize a quote from a last-trade price.
    pub fn from_trade(
        symbol: &SymbolKey,
        price: Decimal,
        observed_at: DateTime<Utc>,
    ) -> Result<Self> {
        Self::new(symbol, price, price, observed_at, QuoteSource::LastTrade)
    }

    pub fn mid(&self) -> Decimal {
        (self.bid + self.ask) / dec!(2)
    }

    /// Spread in basis points relative to mid.
    pub fn spread_bps(&self) -> Decimal {
        let mid = self.mid();
        if mid.is_zero() {
            return Decimal::ZERO;
        }
        (self.ask - self.bid) / mid * Decimal::from(10_000)
    }

    /// Age in milliseconds relative to `now`. May be negative when the
    /// upstream clock runs ahead; callers treat out-of-range values as
    /// clock anomalies.
    pub fn age_ms(&self, now: DateTime<Utc>) -> i64 {
        (now - self.observed_at).num_milliseconds()
    }

    /// Copy of this quote tagged as served from cache.
    pub fn as_cached(&self) -> Self {
        Self {
            source: QuoteSource::Cache,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym() -> SymbolKey {
        SymbolKey::parse("BTC/USD").unwrap()
    }

    #[test]
    fn valid_quote_accepted() {
        let q = Quote::new(&sym(), dec!(100), dec!(101), Utc::now(), QuoteSource::Quotes).unwrap();
        assert_eq!(q.mid(), dec!(100.5));
    }

    #[test]
    fn crossed_quote_rejected_not_clamped() {
        let err = Quote::new(&sym(), dec!(101), dec!(100), Utc::now(), QuoteSource::Quotes)
            .unwrap_err();
        assert!(matches!(err, SkimmerError::InvalidMarketData(_)));
    }

    #[test]
    fn non_positive_rejected() {
        assert!(Quote::new(&sym(), dec!(0), dec!(1), Utc::now(), QuoteSource::Quotes).is_err());
        assert!(Quote::new(&sym(), dec!(-1), dec!(1), Utc::now(), QuoteSource::Quotes).is_err());
    }

    #[test]
    fn trade_synthesis_is_flat() {
        let q = Quote::from_trade(&sym(), dec!(50), Utc::now()).unwrap();
        assert_eq!(q.bid, q.ask);
        assert_eq!(q.source, QuoteSource::LastTrade);
        assert_eq!(q.spread_bps(), Decimal::ZERO);
    }

    #[test]
    fn spread_bps_math() {
        // bid 99.875, ask 100.125 -> spread 0.25 on mid 100 = 25 bps
        let q = Quote::new(
            &sym(),
            dec!(99.875),
            dec!(100.125),
            Utc::now(),
            QuoteSource::Quotes,
        )
        .unwrap();
        assert_eq!(q.spread_bps(), dec!(25));
    }
}
