//! DeltaHedger - periodically trims every position back towards a delta limit
//!
//! For each position the excess `market_value - instrument_delta_limit` is converted into
//! a whole number of shares at the current price and offset with a limit order, priced at
//! the Spotter's cached fair price when one exists.

use anyhow::Context;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, error, info};

use agent_hub::{Agent, AgentConfig, AgentContext, AgentKind, ConfigError, ExecutionClient, Trigger};
use common::{OrderSide, Position, SpotPrice, Symbol};

use crate::spotter::spot_path;

/// A rebalancing order derived from one position
#[derive(Debug, Clone, PartialEq)]
pub struct HedgeOrder {
    pub symbol: Symbol,
    pub side: OrderSide,
    pub qty: f64,
    pub price: f64,
}

/// Work out the order that brings `position` back to `delta_limit`, if any.
///
/// Differences under half a share are ignored, and the quantity never exceeds what the
/// position has available.
pub fn plan_hedge(position: &Position, delta_limit: f64, fair_price: Option<f64>) -> Option<HedgeOrder> {
    let current_price = position.current_price;
    if !current_price.is_finite() || current_price <= 0.0 {
        return None;
    }

    let difference = position.market_value - delta_limit;
    if difference.abs() < current_price * 0.5 {
        return None;
    }

    let shares = (difference / current_price).floor();
    let side = if shares > 0.0 { OrderSide::Sell } else { OrderSide::Buy };
    let qty = shares.abs().min(position.qty_available.abs().trunc());
    if qty == 0.0 {
        return None;
    }

    Some(HedgeOrder {
        symbol: position.symbol.clone(),
        side,
        qty,
        price: fair_price.unwrap_or(current_price),
    })
}

pub struct DeltaHedger {
    name: String,
    config: AgentConfig,
    period: Duration,
    delta_limit: f64,
}

impl DeltaHedger {
    pub fn from_config(config: &AgentConfig) -> Result<Self, ConfigError> {
        let period = config.interval()?;
        let delta_limit = config.get_f64("instrument_delta_limit", 0.0)?;
        let name = config.get_str("name")?.unwrap_or("delta_hedger").to_string();

        info!("DeltaHedger initialized. Period: {:?}, delta limit: {}", period, delta_limit);

        Ok(Self {
            name,
            config: config.clone(),
            period,
            delta_limit,
        })
    }

    async fn hedge(
        &self,
        ctx: &AgentContext,
        execution: &dyn ExecutionClient,
        position: &Position,
    ) -> anyhow::Result<()> {
        let fair_price = ctx
            .store()
            .get::<SpotPrice>(spot_path(&position.symbol))
            .map(|spot| spot.fair_price);

        let Some(order) = plan_hedge(position, self.delta_limit, fair_price) else {
            return Ok(());
        };

        let submitted = execution
            .submit_limit_order(&order.symbol, order.price, order.qty, order.side)
            .await?;

        info!(
            order_id = %submitted.id,
            "DeltaHedger submitted order: {} {} {} @ {:.4}",
            order.side, order.qty, order.symbol, order.price
        );
        Ok(())
    }
}

#[async_trait]
impl Agent for DeltaHedger {
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
        let execution = ctx.execution()?;
        let positions = execution
            .get_all_positions()
            .await
            .context("DeltaHedger failed to get positions")?;

        debug!(positions = positions.len(), "DeltaHedger running hedging logic");

        for position in &positions {
            if let Err(e) = self.hedge(ctx, execution.as_ref(), position).await {
                error!(symbol = %position.symbol, "Error during hedging logic: {:#}", e);
            }
        }
        Ok(())
    }
}
