//! Spotter - derives a fair spot price from every quote and shares it

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, info, warn};

use agent_hub::{Agent, AgentConfig, AgentContext, AgentKind, ConfigError, Trigger};
use common::{spot_price_topic, FairPriceMethod, SpotPrice, Symbol, Utc};

/// Store path holding the latest `SpotPrice` for `symbol`
pub fn spot_path(symbol: &str) -> String {
    format!("sys/SPOTTER/{}/SPOT", symbol)
}

/// Event-driven agent that turns quotes into `SpotPrice` snapshots.
///
/// Each snapshot is written to [`spot_path`] and published on [`spot_price_topic`].
pub struct Spotter {
    name: String,
    config: AgentConfig,
    instruments: BTreeSet<Symbol>,
    throttle: Duration,
    method: FairPriceMethod,
}

impl Spotter {
    pub fn from_config(config: &AgentConfig) -> Result<Self, ConfigError> {
        let instruments: BTreeSet<Symbol> = config.instruments()?.into_iter().collect();
        let throttle = config.interval()?;
        let method = config.parse_or("fair_price_method", FairPriceMethod::default())?;
        let name = config.get_str("name")?.unwrap_or("spotter").to_string();

        info!(
            "Spotter initialized for {} instruments. Fair price is calculated with method: {}",
            instruments.len(),
            method
        );

        Ok(Self {
            name,
            config: config.clone(),
            instruments,
            throttle,
            method,
        })
    }

    pub fn method(&self) -> FairPriceMethod {
        self.method
    }
}

#[async_trait]
impl Agent for Spotter {
    fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> AgentConfig {
        self.config.clone()
    }

    fn kind(&self) -> AgentKind {
        AgentKind::event_driven(self.throttle)
    }

    fn interested_symbols(&self) -> BTreeSet<Symbol> {
        self.instruments.clone()
    }

    async fn run(&self, ctx: &AgentContext, trigger: Trigger) -> anyhow::Result<()> {
        let Some(tick) = trigger.tick() else {
            return Ok(());
        };
        let instrument = tick.symbol();
        if !self.instruments.contains(instrument) {
            return Ok(());
        }
        let Some(quote) = tick.as_quote() else {
            return Ok(());
        };

        let Some(fair_price) = quote.fair_price(self.method) else {
            warn!(instrument, "Could not calculate fair price from quote");
            return Ok(());
        };

        let spot = SpotPrice {
            instrument: instrument.to_string(),
            timestamp: Utc::now(),
            fair_price,
            method: self.method,
            raw_quote: quote.clone(),
        };

        ctx.store().set(spot_path(instrument), spot.clone())?;
        ctx.publish(&spot_price_topic(instrument), spot).await;

        debug!(instrument, fair_price, "Processed quote");
        Ok(())
    }
}
