//! SpreadCalculator - rolling average of quoted bid-ask spreads

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, info};

use agent_hub::{Agent, AgentConfig, AgentContext, AgentKind, ConfigError, Trigger};
use common::{spread_topic, Spread, Symbol, Utc};

/// Store path holding the raw spread samples for `symbol`
pub fn spread_values_path(symbol: &str) -> String {
    format!("sys/SPREADS/{}/SPREAD_VALUES", symbol)
}

/// Store path holding the latest averaged `Spread` for `symbol`
pub fn spread_path(symbol: &str) -> String {
    format!("sys/SPREADS/{}/SPREAD", symbol)
}

pub struct SpreadCalculator {
    name: String,
    config: AgentConfig,
    instruments: BTreeSet<Symbol>,
    throttle: Duration,
    min_data_size: usize,
    window: usize,
}

impl SpreadCalculator {
    pub fn from_config(config: &AgentConfig) -> Result<Self, ConfigError> {
        let instruments: BTreeSet<Symbol> = config.instruments()?.into_iter().collect();
        let throttle = config.interval()?;
        let min_data_size = config.get_usize("min_data_size", 60)?;
        let window = config.get_usize("window", 500)?;
        if window <= min_data_size {
            return Err(ConfigError::invalid(
                "window",
                format!("must be larger than min_data_size ({})", min_data_size),
            ));
        }
        let name = config.get_str("name")?.unwrap_or("spread_calculator").to_string();

        info!(
            "SpreadCalculator initialized for {} instruments (min_data_size: {}, window: {})",
            instruments.len(),
            min_data_size,
            window
        );

        Ok(Self {
            name,
            config: config.clone(),
            instruments,
            throttle,
            min_data_size,
            window,
        })
    }
}

#[async_trait]
impl Agent for SpreadCalculator {
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
        let Some(quote) = trigger.tick().and_then(|tick| tick.as_quote()) else {
            return Ok(());
        };
        let instrument = quote.symbol.as_str();
        if !self.instruments.contains(instrument) {
            return Ok(());
        }

        let spread_value = quote.spread();
        let window = self.window;
        let samples = ctx
            .store()
            .update::<Vec<f64>, _>(spread_values_path(instrument), |current| {
                let mut samples = current.cloned().unwrap_or_default();
                samples.push(spread_value);
                if samples.len() > window {
                    let excess = samples.len() - window;
                    samples.drain(..excess);
                }
                samples
            })?;

        if samples.len() <= self.min_data_size {
            return Ok(());
        }

        let average = samples.iter().sum::<f64>() / samples.len() as f64;
        let spread = Spread {
            instrument: instrument.to_string(),
            timestamp: Utc::now(),
            value: average,
            samples: samples.len(),
        };

        ctx.store().set(spread_path(instrument), spread.clone())?;
        ctx.publish(&spread_topic(instrument), spread).await;

        debug!(instrument, spread = spread_value, average, "Processed quote");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_hub::{CommunicationBus, SharedStore};
    use common::{Quote, Tick};
    use std::sync::Arc;

    fn context() -> AgentContext {
        AgentContext::new(
            "spreads",
            Arc::new(SharedStore::new()),
            Arc::new(CommunicationBus::new()),
            None,
        )
    }

    fn quote(symbol: &str, spread: f64) -> Trigger {
        Trigger::Tick(Arc::new(Tick::Quote(Quote {
            symbol: symbol.to_string(),
            bid_price: 100.0,
            ask_price: 100.0 + spread,
            bid_size: 1.0,
            ask_size: 1.0,
            timestamp: Utc::now(),
        })))
    }

    fn calculator(min_data_size: usize, window: usize) -> SpreadCalculator {
        SpreadCalculator::from_config(
            &AgentConfig::new()
                .with("instruments", vec!["AAPL"])
                .with("min_data_size", min_data_size)
                .with("window", window),
        )
        .unwrap()
    }

    #[test]
    fn test_window_must_exceed_min_data_size() {
        let config = AgentConfig::new()
            .with("instruments", vec!["AAPL"])
            .with("min_data_size", 10)
            .with("window", 10);
        assert!(matches!(
            SpreadCalculator::from_config(&config),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[tokio::test]
    async fn test_waits_for_enough_samples() {
        let agent = calculator(3, 10);
        let ctx = context();

        for _ in 0..3 {
            agent.run(&ctx, quote("AAPL", 1.0)).await.unwrap();
        }
        assert_eq!(
            ctx.store().get::<Vec<f64>>(spread_values_path("AAPL")).map(|v| v.len()),
            Some(3)
        );
        assert!(ctx.store().get::<Spread>(spread_path("AAPL")).is_none());

        agent.run(&ctx, quote("AAPL", 3.0)).await.unwrap();
        let spread = ctx.store().get::<Spread>(spread_path("AAPL")).unwrap();
        assert!((spread.value - 1.5).abs() < 1e-9);
        assert_eq!(spread.samples, 4);
    }

    #[tokio::test]
    async fn test_window_bounds_history() {
        let agent = calculator(1, 3);
        let ctx = context();

        for spread in [1.0, 2.0, 3.0, 4.0, 5.0] {
            agent.run(&ctx, quote("AAPL", spread)).await.unwrap();
        }

        let samples = ctx.store().get::<Vec<f64>>(spread_values_path("AAPL")).unwrap();
        assert_eq!(*samples, vec![3.0, 4.0, 5.0]);
        let spread = ctx.store().get::<Spread>(spread_path("AAPL")).unwrap();
        assert!((spread.value - 4.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_ignores_unconfigured_symbols() {
        let agent = calculator(1, 3);
        let ctx = context();
        agent.run(&ctx, quote("MSFT", 1.0)).await.unwrap();
        assert!(!ctx.store().exists("sys/SPREADS"));
    }
}
