use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, SkimmerError};

/// Known quote currencies for decoding the broker's compact pair form.
/// Longest suffix wins so "ETHUSDT" decodes as ETH/USDT, not ETHUSD+T.
const QUOTE_CURRENCIES: [&str; 6] = ["USDT", "USDC", "USD", "BTC", "ETH", "EUR"];

/// Canonical instrument identifier.
///
/// Crypto pairs carry a slash ("BTC/USD"); equities are bare symbols
/// ("AAPL"). Internal state only ever stores this canonical form; the
/// broker's compact form ("BTCUSD") is converted at the wire boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SymbolKey(String);

impl SymbolKey {
    /// Parse a canonical symbol string.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(SkimmerError::Validation("empty symbol".to_string()));
        }

        match trimmed.split_once('/') {
            Some((base, quote)) => {
                if base.is_empty() || quote.is_empty() {
                    return Err(SkimmerError::Validation(format!(
                        "malformed pair symbol: {trimmed}"
                    )));
                }
                Ok(Self(format!(
                    "{}/{}",
                    base.to_ascii_uppercase(),
                    quote.to_ascii_uppercase()
                )))
            }
            None => {
                if !trimmed.chars().all(|c| c.is_ascii_alphanumeric() || c == '.') {
                    return Err(SkimmerError::Validation(format!(
                        "invalid equity symbol: {trimmed}"
                    )));
                }
                Ok(Self(trimmed.to_ascii_uppercase()))
            }
        }
    }

    /// Decode the broker's compact pair form ("BTCUSD" -> "BTC/USD").
    ///
    /// A bare equity symbol passes through unchanged. A compact crypto
    /// symbol with an unrecognized quote currency is rejected rather than
    /// guessed at.
    pub fn from_compact(raw: &str, is_crypto: bool) -> Result<Self> {
        let trimmed = raw.trim().to_ascii_uppercase();
        if !is_crypto {
            return Self::parse(&trimmed);
        }
        if trimmed.contains('/') {
            return Self::parse(&trimmed);
        }
        for quote in QUOTE_CURRENCIES {
            if let Some(base) = trimmed.strip_suffix(quote) {
                if !base.is_empty() {
                    return Ok(Self(format!("{base}/{quote}")));
                }
            }
        }
        Err(SkimmerError::Validation(format!(
            "cannot decode compact symbol: {trimmed}"
        )))
    }

    /// The broker's compact wire form ("BTC/USD" -> "BTCUSD").
    pub fn to_compact(&self) -> String {
        self.0.replace('/', "")
    }

    /// Crypto pairs carry a slash; everything else is treated as an equity.
    pub fn is_crypto(&self) -> bool {
        self.0.contains('/')
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SymbolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SymbolKey {
    type Err = SkimmerError;

    fn from_str(raw: &str) -> Result<Self> {
        Self::parse(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pair_and_equity() {
        assert_eq!(SymbolKey::parse("btc/usd").unwrap().as_str(), "BTC/USD");
        assert_eq!(SymbolKey::parse("aapl").unwrap().as_str(), "AAPL");
        assert_eq!(SymbolKey::parse("BRK.B").unwrap().as_str(), "BRK.B");
    }

    #[test]
    fn rejects_malformed() {
        assert!(SymbolKey::parse("").is_err());
        assert!(SymbolKey::parse("/USD").is_err());
        assert!(SymbolKey::parse("BTC/").is_err());
        assert!(SymbolKey::parse("AA PL").is_err());
    }

    #[test]
    fn compact_round_trip() {
        let key = SymbolKey::from_compact("BTCUSD", true).unwrap();
        assert_eq!(key.as_str(), "BTC/USD");
        assert_eq!(key.to_compact(), "BTCUSD");
        assert!(key.is_crypto());
    }

    #[test]
    fn compact_longest_suffix_wins() {
        let key = SymbolKey::from_compact("ETHUSDT", true).unwrap();
        assert_eq!(key.as_str(), "ETH/USDT");
    }

    #[test]
    fn compact_unknown_quote_rejected() {
        assert!(SymbolKey::from_compact("BTCXYZ", true).is_err());
    }

    #[test]
    fn compact_equity_passthrough() {
        let key = SymbolKey::from_compact("AAPL", false).unwrap();
        assert_eq!(key.as_str(), "AAPL");
        assert!(!key.is_crypto());
    }
}
