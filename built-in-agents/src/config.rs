//! Deployment configuration: hub settings plus the list of agents to run

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use agent_hub::{Agent, AgentConfig, ConfigError, HubConfig};

use crate::delta_hedger::DeltaHedger;
use crate::portfolio_monitor::PortfolioMonitor;
use crate::simulated::FeedConfig;
use crate::spotter::Spotter;
use crate::spread_calculator::SpreadCalculator;

/// Built-in agent implementations selectable from a deployment file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    Spotter,
    SpreadCalculator,
    DeltaHedger,
    PortfolioMonitor,
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AgentType::Spotter => "spotter",
            AgentType::SpreadCalculator => "spread_calculator",
            AgentType::DeltaHedger => "delta_hedger",
            AgentType::PortfolioMonitor => "portfolio_monitor",
        };
        f.write_str(name)
    }
}

/// One `[[agents]]` entry: the agent type plus its flat configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSpec {
    pub kind: AgentType,

    #[serde(flatten)]
    pub config: AgentConfig,
}

impl AgentSpec {
    pub fn new(kind: AgentType, config: AgentConfig) -> Self {
        Self { kind, config }
    }
}

/// Paper account settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperConfig {
    #[serde(default = "default_starting_cash")]
    pub starting_cash: f64,

    /// Positions bought at the feed's start price before the hub starts
    #[serde(default)]
    pub positions: BTreeMap<String, f64>,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            starting_cash: default_starting_cash(),
            positions: BTreeMap::new(),
        }
    }
}

fn default_starting_cash() -> f64 {
    100_000.0
}

/// Complete deployment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentConfig {
    #[serde(default)]
    pub hub: HubConfig,

    #[serde(default)]
    pub feed: FeedConfig,

    #[serde(default)]
    pub paper: PaperConfig,

    #[serde(default)]
    pub agents: Vec<AgentSpec>,
}

impl DeploymentConfig {
    /// Deployment used when no configuration file is present
    pub fn demo() -> Self {
        let instruments = vec!["AAPL", "MSFT"];
        Self {
            hub: HubConfig::default(),
            feed: FeedConfig::default(),
            paper: PaperConfig {
                starting_cash: default_starting_cash(),
                positions: BTreeMap::from([("AAPL".to_string(), 20.0)]),
            },
            agents: vec![
                AgentSpec::new(
                    AgentType::Spotter,
                    AgentConfig::new()
                        .with("instruments", instruments.clone())
                        .with("throttle", "500ms"),
                ),
                AgentSpec::new(
                    AgentType::SpreadCalculator,
                    AgentConfig::new()
                        .with("instruments", instruments.clone())
                        .with("throttle", "0ms")
                        .with("min_data_size", 20),
                ),
                AgentSpec::new(
                    AgentType::DeltaHedger,
                    AgentConfig::new()
                        .with("period", "5s")
                        .with("instrument_delta_limit", 500.0),
                ),
                AgentSpec::new(
                    AgentType::PortfolioMonitor,
                    AgentConfig::new()
                        .with("instruments", instruments)
                        .with("period", "10s"),
                ),
            ],
        }
    }

    /// Every symbol named by an agent's `instruments` or the paper positions
    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self
            .agents
            .iter()
            .filter_map(|spec| spec.config.instruments().ok())
            .flatten()
            .chain(self.paper.positions.keys().cloned())
            .collect();
        symbols.sort();
        symbols.dedup();
        symbols
    }
}

/// Parse a deployment from TOML
pub fn from_toml_str(content: &str) -> anyhow::Result<DeploymentConfig> {
    Ok(toml::from_str(content)?)
}

/// Load a deployment from a TOML file
pub fn load_config(path: &str) -> anyhow::Result<DeploymentConfig> {
    let content = std::fs::read_to_string(path)?;
    from_toml_str(&content)
}

/// Construct the agent described by `spec`
pub fn build_agent(spec: &AgentSpec) -> Result<Arc<dyn Agent>, ConfigError> {
    let agent: Arc<dyn Agent> = match spec.kind {
        AgentType::Spotter => Arc::new(Spotter::from_config(&spec.config)?),
        AgentType::SpreadCalculator => Arc::new(SpreadCalculator::from_config(&spec.config)?),
        AgentType::DeltaHedger => Arc::new(DeltaHedger::from_config(&spec.config)?),
        AgentType::PortfolioMonitor => Arc::new(PortfolioMonitor::from_config(&spec.config)?),
    };
    Ok(agent)
}
