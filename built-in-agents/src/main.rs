use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn, Level};

use agent_hub::{ExecutionClient, Hub, PaperExecutionClient};
use built_in_agents::{build_agent, load_config, DeploymentConfig, RandomWalkFeed};
use common::OrderSide;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let level = std::env::var("HUB_LOG_LEVEL")
        .ok()
        .and_then(|level| level.parse::<Level>().ok())
        .unwrap_or(Level::INFO);
    tracing_subscriber::fmt().with_max_level(level).init();

    info!("🚀 Starting Agent Hub");

    let path = std::env::var("HUB_CONFIG").unwrap_or_else(|_| "hub.toml".to_string());
    let deployment = if Path::new(&path).exists() {
        info!("Loading deployment from {}", path);
        load_config(&path)?
    } else {
        warn!("{} not found, running the demo deployment", path);
        DeploymentConfig::demo()
    };

    // Paper account, seeded at the feed's start price
    let execution = Arc::new(PaperExecutionClient::new(deployment.paper.starting_cash));
    for symbol in deployment.symbols() {
        execution.set_mark(&symbol, deployment.feed.start_price);
    }
    for (symbol, qty) in &deployment.paper.positions {
        let side = if *qty >= 0.0 { OrderSide::Buy } else { OrderSide::Sell };
        execution.submit_market_order(symbol, qty.abs(), side).await?;
    }

    let feed = Arc::new(RandomWalkFeed::new(deployment.feed.clone()).with_marks(execution.clone()));

    let mut hub = Hub::new(deployment.hub.clone())
        .with_feed(feed)
        .with_execution(execution.clone());

    for spec in &deployment.agents {
        hub.register(build_agent(spec)?).await?;
    }
    info!(
        agents = hub.agents().len(),
        instruments = ?hub.subscribed_instruments(),
        "Deployment ready"
    );

    let handle = hub.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("👋 Shutting down gracefully...");
            handle.stop();
        }
    });

    hub.start().await?;

    let account = execution.get_account().await?;
    info!(cash = account.cash, equity = account.equity, "Final paper account");
    Ok(())
}
