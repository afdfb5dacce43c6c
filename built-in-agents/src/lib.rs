//! Built-in agents for the agent hub
//!
//! This crate provides ready-made agents and the pieces needed to run them:
//! - Spotter: fair spot price per instrument from quotes
//! - SpreadCalculator: rolling average bid-ask spread
//! - DeltaHedger: periodic rebalancing of positions against a delta limit
//! - PortfolioMonitor: periodic logging of cached market state and the account
//! - RandomWalkFeed: simulated quotes for local runs
//! - Deployment configuration loaded from TOML

pub mod config;
pub mod delta_hedger;
pub mod portfolio_monitor;
pub mod simulated;
pub mod spotter;
pub mod spread_calculator;

// Re-export commonly used types
pub use config::{build_agent, load_config, AgentSpec, AgentType, DeploymentConfig, PaperConfig};
pub use delta_hedger::{plan_hedge, DeltaHedger, HedgeOrder};
pub use portfolio_monitor::{InstrumentSnapshot, PortfolioMonitor};
pub use simulated::{FeedConfig, RandomWalkFeed};
pub use spotter::{spot_path, Spotter};
pub use spread_calculator::{spread_path, spread_values_path, SpreadCalculator};
