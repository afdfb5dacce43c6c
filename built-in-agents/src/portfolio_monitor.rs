//! PortfolioMonitor - periodic summary of cached market state and the account

use async_trait::async_trait;
use std::time::Duration;
use tracing::{info, warn};

use agent_hub::{Agent, AgentConfig, AgentContext, AgentKind, ConfigError, SharedStore, Trigger};
use common::{SpotPrice, Spread, Symbol};

use crate::spotter::spot_path;
use crate::spread_calculator::spread_path;

/// What the store currently knows about one instrument
#[derive(Debug, Clone, PartialEq)]
pub struct InstrumentSnapshot {
    pub symbol: Symbol,
    pub fair_price: Option<f64>,
    pub spread: Option<f64>,
}

pub struct PortfolioMonitor {
    name: String,
    config: AgentConfig,
    period: Duration,
    instruments: Vec<Symbol>,
}

impl PortfolioMonitor {
    pub fn from_config(config: &AgentConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            config: config.clone(),
            name: config.get_str("name")?.unwrap_or("portfolio_monitor").to_string(),
            period: config.interval()?,
            instruments: config.instruments()?,
        })
    }

    pub fn snapshot(&self, store: &SharedStore) -> Vec<InstrumentSnapshot> {
        self.instruments
            .iter()
            .map(|symbol| InstrumentSnapshot {
                symbol: symbol.clone(),
                fair_price: store.get::<SpotPrice>(spot_path(symbol)).map(|s| s.fair_price),
                spread: store.get::<Spread>(spread_path(symbol)).map(|s| s.value),
            })
            .collect()
    }
}

#[async_trait]
impl Agent for PortfolioMonitor {
    fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> AgentConfig {
        self.config.clone()
    }

    fn kind(&self) -> AgentKind {
        AgentKind::periodic(self.period)
    }

    async fn run(&self, ctx: &AgentContext, _trigger: Trigger) -> anyhow::Result<()> {
        for snapshot in self.snapshot(ctx.store()) {
            info!(
                symbol = %snapshot.symbol,
                fair_price = ?snapshot.fair_price,
                spread = ?snapshot.spread,
                "Market snapshot"
            );
        }

        // the monitor also runs without an execution client
        let Ok(execution) = ctx.execution() else {
            return Ok(());
        };

        match execution.get_account().await {
            Ok(account) => info!(
                cash = account.cash,
                equity = account.equity,
                "Account snapshot"
            ),
            Err(e) => warn!("Failed to fetch account: {}", e),
        }

        let positions = execution.get_all_positions().await?;
        for position in positions {
            info!(
                symbol = %position.symbol,
                qty = position.qty,
                market_value = position.market_value,
                "Position"
            );
        }
        Ok(())
    }
}
