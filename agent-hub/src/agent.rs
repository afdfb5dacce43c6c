//! Agent contract and per-agent execution gate
//!
//! Every agent is either periodic (run on its own clock) or event-driven (run on upstream
//! ticks, subject to a throttle). The hub wraps each registered agent in an [`AgentRunner`]
//! that owns the throttle/single-flight gate, catches failures and keeps statistics.

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use common::{Symbol, Tick};

use crate::bus::{Delivery, Listener, MessageBus};
use crate::duration::parse_duration;
use crate::error::{ConfigError, ProviderError};
use crate::execution::ExecutionClient;
use crate::store::SharedStore;

/// Interval used when an agent config sets neither `throttle` nor `period`
pub const DEFAULT_INTERVAL: &str = "1s";

/// Execution mode, fixed for the agent's lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentKind {
    /// Run once per period until the hub stops
    Periodic { period: Duration },
    /// Run on upstream ticks, at most once per throttle window
    EventDriven { throttle: Duration },
}

impl AgentKind {
    pub fn periodic(period: Duration) -> Self {
        AgentKind::Periodic { period }
    }

    pub fn event_driven(throttle: Duration) -> Self {
        AgentKind::EventDriven { throttle }
    }

    /// The period or throttle
    pub fn interval(&self) -> Duration {
        match self {
            AgentKind::Periodic { period } => *period,
            AgentKind::EventDriven { throttle } => *throttle,
        }
    }

    pub fn is_periodic(&self) -> bool {
        matches!(self, AgentKind::Periodic { .. })
    }
}

/// What caused an agent run
#[derive(Debug, Clone)]
pub enum Trigger {
    /// An upstream tick for one of the agent's instruments
    Tick(Arc<Tick>),
    /// A periodic timer firing
    Interval,
}

impl Trigger {
    pub fn tick(&self) -> Option<&Tick> {
        match self {
            Trigger::Tick(tick) => Some(tick.as_ref()),
            Trigger::Interval => None,
        }
    }
}

/// Flat key/value agent configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentConfig(BTreeMap<String, serde_json::Value>);

impl AgentConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<serde_json::Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// The required, non-empty `instruments` list.
    ///
    /// Accepts a list of strings or a single comma-separated string.
    pub fn instruments(&self) -> Result<Vec<Symbol>, ConfigError> {
        const KEY: &str = "instruments";
        let value = self.get(KEY).ok_or_else(|| ConfigError::missing(KEY))?;

        let instruments: Vec<Symbol> = match value {
            serde_json::Value::Array(items) => items
                .iter()
                .map(|item| {
                    item.as_str()
                        .map(|s| s.trim().to_string())
                        .ok_or_else(|| ConfigError::invalid(KEY, "expected a list of symbols"))
                })
                .collect::<Result<_, _>>()?,
            serde_json::Value::String(list) => list.split(',').map(|s| s.trim().to_string()).collect(),
            _ => return Err(ConfigError::invalid(KEY, "expected a list of symbols")),
        };

        let instruments: Vec<Symbol> = instruments.into_iter().filter(|s| !s.is_empty()).collect();
        if instruments.is_empty() {
            return Err(ConfigError::invalid(KEY, "at least one instrument is required"));
        }
        Ok(instruments)
    }

    /// The `throttle` (or `period`) duration, defaulting to one second
    pub fn interval(&self) -> Result<Duration, ConfigError> {
        let raw = match self.get_str("throttle")? {
            Some(raw) => raw,
            None => self.get_str("period")?.unwrap_or(DEFAULT_INTERVAL),
        };
        Ok(parse_duration(raw)?)
    }

    pub fn get_str(&self, key: &str) -> Result<Option<&str>, ConfigError> {
        match self.get(key) {
            None => Ok(None),
            Some(serde_json::Value::String(s)) => Ok(Some(s.as_str())),
            Some(other) => Err(ConfigError::invalid(key, format!("expected a string, got {}", other))),
        }
    }

    pub fn get_f64(&self, key: &str, default: f64) -> Result<f64, ConfigError> {
        match self.get(key) {
            None => Ok(default),
            Some(value) => value
                .as_f64()
                .ok_or_else(|| ConfigError::invalid(key, format!("expected a number, got {}", value))),
        }
    }

    pub fn get_usize(&self, key: &str, default: usize) -> Result<usize, ConfigError> {
        match self.get(key) {
            None => Ok(default),
            Some(value) => value
                .as_u64()
                .and_then(|n| usize::try_from(n).ok())
                .ok_or_else(|| {
                    ConfigError::invalid(key, format!("expected a non-negative integer, got {}", value))
                }),
        }
    }

    /// Parse a string key through `FromStr`, falling back to `default` when absent
    pub fn parse_or<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get_str(key)? {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::invalid(key, e.to_string())),
        }
    }
}

/// Execution client shared between the hub and every context it hands out.
///
/// Setting it on the hub makes it visible to agents registered before and after.
pub type ExecutionSlot = Arc<RwLock<Option<Arc<dyn ExecutionClient>>>>;

/// Everything the hub hands an agent: its store, its bus and the optional execution client
#[derive(Clone)]
pub struct AgentContext {
    agent: Arc<str>,
    store: Arc<SharedStore>,
    bus: Arc<dyn MessageBus>,
    execution: ExecutionSlot,
}

impl AgentContext {
    pub fn new(
        agent: &str,
        store: Arc<SharedStore>,
        bus: Arc<dyn MessageBus>,
        execution: Option<Arc<dyn ExecutionClient>>,
    ) -> Self {
        Self::with_execution_slot(agent, store, bus, Arc::new(RwLock::new(execution)))
    }

    /// Context whose execution client follows `slot`
    pub fn with_execution_slot(
        agent: &str,
        store: Arc<SharedStore>,
        bus: Arc<dyn MessageBus>,
        slot: ExecutionSlot,
    ) -> Self {
        Self {
            agent: Arc::from(agent),
            store,
            bus,
            execution: slot,
        }
    }

    /// Name of the agent this context belongs to
    pub fn agent_name(&self) -> &str {
        &self.agent
    }

    pub fn store(&self) -> &Arc<SharedStore> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<dyn MessageBus> {
        &self.bus
    }

    pub fn execution(&self) -> Result<Arc<dyn ExecutionClient>, ProviderError> {
        self.execution.read().clone().ok_or(ProviderError::Unavailable)
    }

    pub async fn publish<T>(&self, topic: &str, value: T) -> Delivery
    where
        T: std::any::Any + Send + Sync,
    {
        self.bus.publish(topic, value).await
    }

    pub async fn subscribe(&self, topic: &str, listener: Arc<dyn Listener>) -> bool {
        self.bus.subscribe(topic, listener).await
    }
}

/// Base trait that all agents implement
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    /// Execution mode; read once at registration
    fn kind(&self) -> AgentKind;

    /// Instruments whose ticks this agent wants; read once at registration
    fn interested_symbols(&self) -> BTreeSet<Symbol> {
        BTreeSet::new()
    }

    /// Configuration the agent was built from, reported in its descriptor
    fn config(&self) -> AgentConfig {
        AgentConfig::default()
    }

    /// Called during registration, before any run
    async fn initialize(&self, _ctx: &AgentContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn run(&self, ctx: &AgentContext, trigger: Trigger) -> anyhow::Result<()>;

    /// Called once after the hub has stopped every loop
    async fn on_stop(&self, _ctx: &AgentContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Outcome of offering a tick (or a timer) to an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The agent ran and returned Ok
    Executed,
    /// The agent ran and returned an error or panicked
    Failed,
    /// Dropped: inside the throttle window
    Throttled,
    /// Dropped: the previous run is still executing
    Busy,
}

/// Snapshot of an agent's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AgentStats {
    pub executed: u64,
    pub failed: u64,
    pub throttled: u64,
    pub busy: u64,
}

#[derive(Default)]
struct Counters {
    executed: AtomicU64,
    failed: AtomicU64,
    throttled: AtomicU64,
    busy: AtomicU64,
}

/// Point-in-time view of a registered agent
#[derive(Debug, Clone)]
pub struct AgentDescriptor {
    pub name: String,
    pub kind: AgentKind,
    pub instruments: BTreeSet<Symbol>,
    pub config: AgentConfig,
    pub last_execution: Option<Instant>,
    pub stats: AgentStats,
}

#[derive(Debug, Default)]
struct GateState {
    last_execution: Option<Instant>,
    in_flight: bool,
}

/// Held for the duration of an admitted run; releases the single-flight slot on drop
pub struct RunPermit {
    gate: Arc<Mutex<GateState>>,
}

impl Drop for RunPermit {
    fn drop(&mut self) {
        self.gate.lock().in_flight = false;
    }
}

/// A registered agent together with its context, gate and statistics
pub struct AgentRunner {
    agent: Arc<dyn Agent>,
    name: String,
    kind: AgentKind,
    instruments: BTreeSet<Symbol>,
    config: AgentConfig,
    ctx: AgentContext,
    gate: Arc<Mutex<GateState>>,
    counters: Counters,
}

impl AgentRunner {
    pub fn new(agent: Arc<dyn Agent>, ctx: AgentContext) -> Self {
        let name = agent.name().to_string();
        let kind = agent.kind();
        let instruments = match kind {
            AgentKind::EventDriven { .. } => agent.interested_symbols(),
            AgentKind::Periodic { .. } => BTreeSet::new(),
        };
        let config = agent.config();

        Self {
            agent,
            name,
            kind,
            instruments,
            config,
            ctx,
            gate: Arc::new(Mutex::new(GateState::default())),
            counters: Counters::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> AgentKind {
        self.kind
    }

    pub fn instruments(&self) -> &BTreeSet<Symbol> {
        &self.instruments
    }

    pub fn context(&self) -> &AgentContext {
        &self.ctx
    }

    /// Throttle and single-flight check, with the check-and-update under one lock.
    ///
    /// On success `last_execution` is set to now and the returned permit holds the
    /// single-flight slot until dropped.
    pub fn try_admit(&self) -> Result<RunPermit, Admission> {
        let now = Instant::now();
        let mut gate = self.gate.lock();

        if gate.in_flight {
            self.counters.busy.fetch_add(1, Ordering::Relaxed);
            return Err(Admission::Busy);
        }

        if let AgentKind::EventDriven { throttle } = self.kind {
            if let Some(last) = gate.last_execution {
                if now.saturating_duration_since(last) < throttle {
                    self.counters.throttled.fetch_add(1, Ordering::Relaxed);
                    return Err(Admission::Throttled);
                }
            }
        }

        gate.last_execution = Some(now);
        gate.in_flight = true;
        Ok(RunPermit {
            gate: self.gate.clone(),
        })
    }

    /// Offer a tick: run it if the gate admits, otherwise report why it was dropped
    pub async fn admit(&self, tick: Arc<Tick>) -> Admission {
        match self.try_admit() {
            Ok(permit) => {
                let outcome = self.execute(Trigger::Tick(tick)).await;
                drop(permit);
                outcome
            }
            Err(dropped) => dropped,
        }
    }

    /// Run the agent once, containing any error or panic
    pub async fn execute(&self, trigger: Trigger) -> Admission {
        let result = AssertUnwindSafe(self.agent.run(&self.ctx, trigger))
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(())) => {
                self.counters.executed.fetch_add(1, Ordering::Relaxed);
                Admission::Executed
            }
            Ok(Err(e)) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(agent = %self.name, "Agent run failed: {:#}", e);
                Admission::Failed
            }
            Err(_) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(agent = %self.name, "Agent run panicked");
                Admission::Failed
            }
        }
    }

    /// One periodic iteration: stamp the execution time and run
    pub async fn tick_interval(&self) -> Admission {
        match self.try_admit() {
            Ok(permit) => {
                let outcome = self.execute(Trigger::Interval).await;
                drop(permit);
                outcome
            }
            Err(dropped) => dropped,
        }
    }

    pub async fn initialize(&self) -> anyhow::Result<()> {
        debug!(agent = %self.name, kind = ?self.kind, "Initializing agent");
        self.agent.initialize(&self.ctx).await
    }

    pub async fn stop(&self) {
        match AssertUnwindSafe(self.agent.on_stop(&self.ctx)).catch_unwind().await {
            Ok(Ok(())) => info!(agent = %self.name, "Agent stopped"),
            Ok(Err(e)) => warn!(agent = %self.name, "Agent stop hook failed: {:#}", e),
            Err(_) => error!(agent = %self.name, "Agent stop hook panicked"),
        }
    }

    pub fn last_execution(&self) -> Option<Instant> {
        self.gate.lock().last_execution
    }

    pub fn stats(&self) -> AgentStats {
        AgentStats {
            executed: self.counters.executed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            throttled: self.counters.throttled.load(Ordering::Relaxed),
            busy: self.counters.busy.load(Ordering::Relaxed),
        }
    }

    pub fn descriptor(&self) -> AgentDescriptor {
        AgentDescriptor {
            name: self.name.clone(),
            kind: self.kind,
            instruments: self.instruments.clone(),
            config: self.config.clone(),
            last_execution: self.last_execution(),
            stats: self.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::CommunicationBus;
    use common::{Quote, Utc};
    use std::sync::atomic::AtomicUsize;

    struct CountingAgent {
        kind: AgentKind,
        runs: Arc<AtomicUsize>,
        delay: Duration,
    }

    #[async_trait]
    impl Agent for CountingAgent {
        fn name(&self) -> &str {
            "counting"
        }

        fn kind(&self) -> AgentKind {
            self.kind
        }

        fn interested_symbols(&self) -> BTreeSet<Symbol> {
            BTreeSet::from(["AAPL".to_string()])
        }

        async fn run(&self, _ctx: &AgentContext, _trigger: Trigger) -> anyhow::Result<()> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingAgent;

    #[async_trait]
    impl Agent for FailingAgent {
        fn name(&self) -> &str {
            "failing"
        }

        fn kind(&self) -> AgentKind {
            AgentKind::event_driven(Duration::ZERO)
        }

        async fn run(&self, _ctx: &AgentContext, trigger: Trigger) -> anyhow::Result<()> {
            if trigger.tick().is_some() {
                panic!("tick handler exploded");
            }
            anyhow::bail!("timer handler failed")
        }
    }

    fn context() -> AgentContext {
        AgentContext::new(
            "test",
            Arc::new(SharedStore::new()),
            Arc::new(CommunicationBus::new()),
            None,
        )
    }

    fn runner(kind: AgentKind, delay: Duration) -> (AgentRunner, Arc<AtomicUsize>) {
        let runs = Arc::new(AtomicUsize::new(0));
        let agent = CountingAgent {
            kind,
            runs: runs.clone(),
            delay,
        };
        (AgentRunner::new(Arc::new(agent), context()), runs)
    }

    fn tick() -> Arc<Tick> {
        Arc::new(Tick::Quote(Quote {
            symbol: "AAPL".to_string(),
            bid_price: 99.0,
            ask_price: 101.0,
            bid_size: 10.0,
            ask_size: 10.0,
            timestamp: Utc::now(),
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_drops_inside_window() {
        let (runner, runs) = runner(AgentKind::event_driven(Duration::from_secs(1)), Duration::ZERO);

        assert_eq!(runner.admit(tick()).await, Admission::Executed);
        tokio::time::advance(Duration::from_millis(200)).await;
        assert_eq!(runner.admit(tick()).await, Admission::Throttled);

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(runner.stats().throttled, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_admits_after_window() {
        let (runner, runs) = runner(AgentKind::event_driven(Duration::from_secs(1)), Duration::ZERO);

        assert_eq!(runner.admit(tick()).await, Admission::Executed);
        tokio::time::advance(Duration::from_millis(1500)).await;
        assert_eq!(runner.admit(tick()).await, Admission::Executed);

        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_throttle_never_throttles() {
        let (runner, runs) = runner(AgentKind::event_driven(Duration::ZERO), Duration::ZERO);
        for _ in 0..5 {
            assert_eq!(runner.admit(tick()).await, Admission::Executed);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_flight_drops_overlapping_run() {
        let (runner, runs) = runner(AgentKind::event_driven(Duration::ZERO), Duration::from_millis(100));

        let permit = runner.try_admit().unwrap();
        let stamped = runner.last_execution();
        tokio::time::advance(Duration::from_millis(10)).await;

        assert!(matches!(runner.try_admit(), Err(Admission::Busy)));
        // a busy drop leaves the execution time alone
        assert_eq!(runner.last_execution(), stamped);

        drop(permit);
        assert_eq!(runner.admit(tick()).await, Admission::Executed);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(runner.stats().busy, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_admits_run_once() {
        const CALLERS: usize = 16;
        let (runner, runs) = runner(AgentKind::event_driven(Duration::ZERO), Duration::from_millis(200));
        let runner = Arc::new(runner);
        let barrier = Arc::new(tokio::sync::Barrier::new(CALLERS));

        let callers: Vec<_> = (0..CALLERS)
            .map(|_| {
                let runner = runner.clone();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    runner.admit(tick()).await
                })
            })
            .collect();

        let mut outcomes = Vec::new();
        for caller in callers {
            outcomes.push(caller.await.unwrap());
        }

        let executed = outcomes.iter().filter(|o| **o == Admission::Executed).count();
        let busy = outcomes.iter().filter(|o| **o == Admission::Busy).count();
        assert_eq!(executed, 1);
        assert_eq!(busy, CALLERS - 1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(runner.stats().busy, (CALLERS - 1) as u64);
    }

    #[tokio::test]
    async fn test_failures_are_contained() {
        let runner = AgentRunner::new(Arc::new(FailingAgent), context());

        assert_eq!(runner.admit(tick()).await, Admission::Failed);
        assert_eq!(runner.execute(Trigger::Interval).await, Admission::Failed);

        // the slot is released even after a panic
        assert!(runner.try_admit().is_ok());
        assert_eq!(runner.stats().failed, 2);
    }

    #[test]
    fn test_periodic_agents_have_no_instruments() {
        let (runner, _) = runner(AgentKind::periodic(Duration::from_secs(2)), Duration::ZERO);
        assert!(runner.instruments().is_empty());

        let descriptor = runner.descriptor();
        assert_eq!(descriptor.name, "counting");
        assert!(descriptor.kind.is_periodic());
        assert!(descriptor.last_execution.is_none());
    }

    #[test]
    fn test_config_instruments() {
        let config = AgentConfig::new().with("instruments", vec!["AAPL", "MSFT"]);
        assert_eq!(config.instruments().unwrap(), vec!["AAPL", "MSFT"]);

        let config = AgentConfig::new().with("instruments", "AAPL, MSFT");
        assert_eq!(config.instruments().unwrap(), vec!["AAPL", "MSFT"]);

        assert_eq!(
            AgentConfig::new().instruments(),
            Err(ConfigError::missing("instruments"))
        );
        assert!(matches!(
            AgentConfig::new()
                .with("instruments", Vec::<String>::new())
                .instruments(),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(AgentConfig::new().with("instruments", 5).instruments().is_err());
    }

    #[test]
    fn test_config_interval() {
        assert_eq!(AgentConfig::new().interval().unwrap(), Duration::from_secs(1));
        assert_eq!(
            AgentConfig::new().with("throttle", "500ms").interval().unwrap(),
            Duration::from_millis(500)
        );
        assert_eq!(
            AgentConfig::new().with("period", "2s").interval().unwrap(),
            Duration::from_secs(2)
        );
        assert!(matches!(
            AgentConfig::new().with("throttle", "5x").interval(),
            Err(ConfigError::Duration(_))
        ));
    }

    #[test]
    fn test_config_typed_accessors() {
        let config: AgentConfig = serde_json::from_value(serde_json::json!({
            "window": 500,
            "limit": -2.5,
            "method": "MID",
        }))
        .unwrap();

        assert_eq!(config.get_usize("window", 0).unwrap(), 500);
        assert_eq!(config.get_usize("missing", 60).unwrap(), 60);
        assert_eq!(config.get_f64("limit", 0.0).unwrap(), -2.5);
        assert!(config.get_usize("limit", 0).is_err());
        assert_eq!(config.get_str("method").unwrap(), Some("MID"));
        assert!(config.get_str("window").is_err());
        assert_eq!(
            config.parse_or("method", common::FairPriceMethod::CrossedVwap).unwrap(),
            common::FairPriceMethod::Mid
        );
    }
}
