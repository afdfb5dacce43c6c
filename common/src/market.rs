//! Market data types
//!
//! Ticks are what the upstream feed delivers to the hub. `SpotPrice` and `Spread` are the
//! derived snapshots the built-in agents exchange through the store and the bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Instrument identifier, e.g. `AAPL`
pub type Symbol = String;

/// Top-of-book quote
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: Symbol,
    pub bid_price: f64,
    pub ask_price: f64,
    pub bid_size: f64,
    pub ask_size: f64,
    pub timestamp: DateTime<Utc>,
}

impl Quote {
    /// Bid-ask spread (ask - bid)
    pub fn spread(&self) -> f64 {
        self.ask_price - self.bid_price
    }

    /// Midpoint between bid and ask
    pub fn mid(&self) -> f64 {
        (self.bid_price + self.ask_price) / 2.0
    }

    /// Volume-weighted average of both sides, each price weighted by its own size
    pub fn vwap(&self) -> Option<f64> {
        let total = self.total_size()?;
        Some((self.bid_price * self.bid_size + self.ask_price * self.ask_size) / total)
    }

    /// Each side's price weighted by the opposite side's size.
    ///
    /// A heavy bid pulls the fair price towards the ask and vice versa.
    pub fn crossed_vwap(&self) -> Option<f64> {
        let total = self.total_size()?;
        Some((self.bid_price * self.ask_size + self.ask_price * self.bid_size) / total)
    }

    /// Fair price according to `method`, if it can be computed from this quote
    pub fn fair_price(&self, method: FairPriceMethod) -> Option<f64> {
        let price = match method {
            FairPriceMethod::Vwap => self.vwap(),
            FairPriceMethod::CrossedVwap => self.crossed_vwap(),
            FairPriceMethod::Mid => Some(self.mid()),
        }?;
        price.is_finite().then_some(price)
    }

    fn total_size(&self) -> Option<f64> {
        let total = self.bid_size + self.ask_size;
        (total > 0.0).then_some(total)
    }
}

/// Last trade print
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub symbol: Symbol,
    pub price: f64,
    pub size: f64,
    pub timestamp: DateTime<Utc>,
}

/// One inbound market-data update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Tick {
    Quote(Quote),
    Trade(Trade),
}

impl Tick {
    pub fn symbol(&self) -> &str {
        match self {
            Tick::Quote(q) => &q.symbol,
            Tick::Trade(t) => &t.symbol,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Tick::Quote(q) => q.timestamp,
            Tick::Trade(t) => t.timestamp,
        }
    }

    pub fn as_quote(&self) -> Option<&Quote> {
        match self {
            Tick::Quote(q) => Some(q),
            Tick::Trade(_) => None,
        }
    }
}

/// Method used to derive a fair price from a quote
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FairPriceMethod {
    Vwap,
    #[default]
    CrossedVwap,
    Mid,
}

impl FairPriceMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            FairPriceMethod::Vwap => "VWAP",
            FairPriceMethod::CrossedVwap => "CROSSED_VWAP",
            FairPriceMethod::Mid => "MID",
        }
    }
}

impl fmt::Display for FairPriceMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FairPriceMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "VWAP" => Ok(FairPriceMethod::Vwap),
            "CROSSED_VWAP" => Ok(FairPriceMethod::CrossedVwap),
            "MID" => Ok(FairPriceMethod::Mid),
            other => Err(format!("unknown fair price method '{}'", other)),
        }
    }
}

/// Computed spot price snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpotPrice {
    pub instrument: Symbol,
    pub timestamp: DateTime<Utc>,
    pub fair_price: f64,
    pub method: FairPriceMethod,
    pub raw_quote: Quote,
}

/// Averaged bid-ask spread snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spread {
    pub instrument: Symbol,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub samples: usize,
}

/// Topic carrying `SpotPrice` updates for `symbol`
pub fn spot_price_topic(symbol: &str) -> String {
    format!("SPOT_PRICE('{}')", symbol)
}

/// Topic carrying `Spread` updates for `symbol`
pub fn spread_topic(symbol: &str) -> String {
    format!("SPREAD('{}')", symbol)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quote(bid: f64, ask: f64, bid_size: f64, ask_size: f64) -> Quote {
        Quote {
            symbol: "AAPL".to_string(),
            bid_price: bid,
            ask_price: ask,
            bid_size,
            ask_size,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_quote_analytics() {
        let q = quote(100.0, 102.0, 300.0, 100.0);
        assert_eq!(q.spread(), 2.0);
        assert_eq!(q.mid(), 101.0);
        // (100*300 + 102*100) / 400
        assert!((q.vwap().unwrap() - 100.5).abs() < 1e-9);
        // (100*100 + 102*300) / 400
        assert!((q.crossed_vwap().unwrap() - 101.5).abs() < 1e-9);
    }

    #[test]
    fn test_fair_price_without_size() {
        let q = quote(100.0, 102.0, 0.0, 0.0);
        assert_eq!(q.fair_price(FairPriceMethod::CrossedVwap), None);
        assert_eq!(q.fair_price(FairPriceMethod::Vwap), None);
        assert_eq!(q.fair_price(FairPriceMethod::Mid), Some(101.0));
    }

    #[test]
    fn test_fair_price_method_parsing() {
        assert_eq!("vwap".parse::<FairPriceMethod>().unwrap(), FairPriceMethod::Vwap);
        assert_eq!(
            "CROSSED_VWAP".parse::<FairPriceMethod>().unwrap(),
            FairPriceMethod::CrossedVwap
        );
        assert!("median".parse::<FairPriceMethod>().is_err());
        assert_eq!(FairPriceMethod::default(), FairPriceMethod::CrossedVwap);
    }

    #[test]
    fn test_topics() {
        assert_eq!(spot_price_topic("AAPL"), "SPOT_PRICE('AAPL')");
        assert_eq!(spread_topic("MSFT"), "SPREAD('MSFT')");
    }
}
