//! Agent Hub - in-memory coordination layer for streaming agents
//!
//! This crate provides the substrate that independent agents run on:
//! - Shared hierarchical store addressed by `/`-separated paths
//! - Publish/subscribe bus, with a stateful variant that replays the last value
//! - Agent contract: periodic or event-driven with a throttle
//! - Hub that aggregates instrument interest, fans ticks out and runs periodic loops
//!
//! Market data and order execution are reached through the [`MarketFeed`] and
//! [`ExecutionClient`] traits.

pub mod agent;
pub mod bus;
pub mod config;
pub mod duration;
pub mod error;
pub mod execution;
pub mod feed;
pub mod hub;
pub mod store;

// Re-export commonly used types
pub use agent::{
    Admission, Agent, AgentConfig, AgentContext, AgentDescriptor, AgentKind, AgentStats,
    ExecutionSlot, Trigger,
};
pub use bus::{listener_fn, CommunicationBus, Delivery, Listener, Message, MessageBus, StatefulBus};
pub use config::{BusKind, HubConfig, ReconnectConfig};
pub use duration::parse_duration;
pub use error::{ConfigError, DurationParseError, HubError, ProviderError, StoreError};
pub use execution::{ExecutionClient, PaperExecutionClient};
pub use feed::{ChannelFeed, FeedSender, MarketFeed};
pub use hub::{Hub, HubHandle, HubStatus};
pub use store::{SharedStore, StorePath};

// Re-export common types for convenience
pub use common;
