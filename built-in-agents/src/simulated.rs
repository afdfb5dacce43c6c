//! Simulated market data: a random-walk quote feed for demos and local runs

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

use agent_hub::{MarketFeed, PaperExecutionClient, ProviderError};
use common::{Quote, Symbol, Tick, Utc};

/// Random-walk feed parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedConfig {
    #[serde(default = "default_start_price")]
    pub start_price: f64,

    /// Standard deviation of each step, as a fraction of the price
    #[serde(default = "default_volatility")]
    pub volatility: f64,

    /// Quoted spread in basis points of the mid price
    #[serde(default = "default_spread_bps")]
    pub spread_bps: f64,

    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Stop after this many rounds of quotes; stream forever when unset
    #[serde(default)]
    pub max_rounds: Option<u64>,

    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            start_price: default_start_price(),
            volatility: default_volatility(),
            spread_bps: default_spread_bps(),
            interval_ms: default_interval_ms(),
            max_rounds: None,
            seed: None,
        }
    }
}

fn default_start_price() -> f64 {
    100.0
}

fn default_volatility() -> f64 {
    0.001
}

fn default_spread_bps() -> f64 {
    5.0
}

fn default_interval_ms() -> u64 {
    250
}

struct WalkState {
    rng: fastrand::Rng,
    prices: HashMap<Symbol, f64>,
}

/// Produces one quote per subscribed symbol every `interval_ms`.
///
/// Prices persist across reconnects. When a paper execution client is attached, every
/// quote's mid price becomes that symbol's mark.
pub struct RandomWalkFeed {
    config: FeedConfig,
    state: Mutex<WalkState>,
    marks: Option<Arc<PaperExecutionClient>>,
}

impl RandomWalkFeed {
    pub fn new(config: FeedConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => fastrand::Rng::with_seed(seed),
            None => fastrand::Rng::new(),
        };
        Self {
            config,
            state: Mutex::new(WalkState {
                rng,
                prices: HashMap::new(),
            }),
            marks: None,
        }
    }

    pub fn with_marks(mut self, execution: Arc<PaperExecutionClient>) -> Self {
        self.marks = Some(execution);
        self
    }

    /// Advance `symbol` one step and quote around the new mid
    fn next_quote(&self, symbol: &str) -> Quote {
        let mut state = self.state.lock();
        let WalkState { rng, prices } = &mut *state;

        // sum of uniforms approximates a unit normal
        let shock: f64 = (0..12).map(|_| rng.f64()).sum::<f64>() - 6.0;
        let price = prices
            .entry(symbol.to_string())
            .or_insert(self.config.start_price);
        *price = (*price * (1.0 + self.config.volatility * shock)).max(0.01);

        let half_spread = *price * self.config.spread_bps / 20_000.0;
        Quote {
            symbol: symbol.to_string(),
            bid_price: *price - half_spread,
            ask_price: *price + half_spread,
            bid_size: rng.u32(1..=10) as f64 * 100.0,
            ask_size: rng.u32(1..=10) as f64 * 100.0,
            timestamp: Utc::now(),
        }
    }
}

#[async_trait]
impl MarketFeed for RandomWalkFeed {
    async fn stream(&self, symbols: &[Symbol], sink: mpsc::Sender<Tick>) -> Result<(), ProviderError> {
        info!(symbols = ?symbols, "Random walk feed started");
        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.interval_ms.max(1)));
        let mut rounds: u64 = 0;

        loop {
            if let Some(max) = self.config.max_rounds {
                if rounds >= max {
                    info!(rounds, "Random walk feed finished");
                    return Ok(());
                }
            }
            ticker.tick().await;
            rounds += 1;

            for symbol in symbols {
                let quote = self.next_quote(symbol);
                if let Some(execution) = &self.marks {
                    execution.set_mark(symbol, quote.mid());
                }
                debug!(symbol = %symbol, bid = quote.bid_price, ask = quote.ask_price, "Simulated quote");
                sink.send(Tick::Quote(quote))
                    .await
                    .map_err(|_| ProviderError::Connection("dispatch channel closed".to_string()))?;
            }
        }
    }
}
