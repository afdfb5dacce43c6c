//! Hub - registers agents, owns the shared store and bus, and drives execution
//!
//! The hub manages:
//! - Agent registration and classification (periodic vs event-driven)
//! - One upstream subscription for the union of event-driven interest
//! - Concurrent tick fan-out, gated per agent by throttle and single-flight
//! - One independent loop per periodic agent
//! - Shutdown and upstream reconnection

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, error, info, trace, warn};

use common::{Symbol, Tick};

use crate::agent::{
    Agent, AgentContext, AgentDescriptor, AgentKind, AgentRunner, ExecutionSlot, Trigger,
};
use crate::bus::{CommunicationBus, MessageBus, StatefulBus};
use crate::config::{BusKind, HubConfig, ReconnectConfig};
use crate::error::{HubError, ProviderError};
use crate::execution::ExecutionClient;
use crate::feed::MarketFeed;
use crate::store::SharedStore;

/// Lifecycle state of the hub
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubStatus {
    Created,
    Running,
    Stopped,
}

/// Cloneable handle used to stop a running hub from elsewhere
#[derive(Clone)]
pub struct HubHandle {
    shutdown: Arc<watch::Sender<bool>>,
    status: Arc<RwLock<HubStatus>>,
}

impl HubHandle {
    /// Signal shutdown. Periodic loops stop between iterations, the upstream
    /// subscription is dropped and `start()` returns once in-flight runs finish.
    pub fn stop(&self) {
        info!("Hub shutdown requested");
        self.shutdown.send_replace(true);
    }

    pub fn is_stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub async fn status(&self) -> HubStatus {
        *self.status.read().await
    }
}

/// Hub - supervises a set of agents sharing one store and one bus
pub struct Hub {
    config: HubConfig,
    store: Arc<SharedStore>,
    bus: Arc<dyn MessageBus>,
    feed: Option<Arc<dyn MarketFeed>>,
    execution: ExecutionSlot,

    // Registered agents, in registration order
    event_agents: Vec<Arc<AgentRunner>>,
    periodic_agents: Vec<Arc<AgentRunner>>,
    subscribed_instruments: BTreeSet<Symbol>,

    // State
    status: Arc<RwLock<HubStatus>>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Hub {
    /// Create a hub with a fresh store and the bus selected by `config.bus`
    pub fn new(config: HubConfig) -> Self {
        let bus: Arc<dyn MessageBus> = match config.bus {
            BusKind::Plain => Arc::new(CommunicationBus::new()),
            BusKind::Stateful => Arc::new(StatefulBus::new()),
        };
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            store: Arc::new(SharedStore::new()),
            bus,
            feed: None,
            execution: ExecutionSlot::default(),
            event_agents: Vec::new(),
            periodic_agents: Vec::new(),
            subscribed_instruments: BTreeSet::new(),
            status: Arc::new(RwLock::new(HubStatus::Created)),
            shutdown: Arc::new(shutdown),
        }
    }

    /// Set the upstream market-data feed
    pub fn with_feed(mut self, feed: Arc<dyn MarketFeed>) -> Self {
        self.feed = Some(feed);
        self
    }

    /// Set the execution client seen by every agent, whether registered before or after
    pub fn with_execution(self, execution: Arc<dyn ExecutionClient>) -> Self {
        *self.execution.write() = Some(execution);
        self
    }

    pub fn store(&self) -> &Arc<SharedStore> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<dyn MessageBus> {
        &self.bus
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn handle(&self) -> HubHandle {
        HubHandle {
            shutdown: self.shutdown.clone(),
            status: self.status.clone(),
        }
    }

    pub async fn status(&self) -> HubStatus {
        *self.status.read().await
    }

    /// Union of the event-driven agents' instruments
    pub fn subscribed_instruments(&self) -> &BTreeSet<Symbol> {
        &self.subscribed_instruments
    }

    /// Descriptors of every registered agent, event-driven first
    pub fn agents(&self) -> Vec<AgentDescriptor> {
        self.event_agents
            .iter()
            .chain(self.periodic_agents.iter())
            .map(|runner| runner.descriptor())
            .collect()
    }

    /// Register an agent: classify it, merge its instrument interest, hand it its
    /// context and run its `initialize` hook.
    pub async fn register(&mut self, agent: Arc<dyn Agent>) -> Result<(), HubError> {
        if *self.status.read().await != HubStatus::Created {
            return Err(HubError::AlreadyStarted);
        }

        let ctx = AgentContext::with_execution_slot(
            agent.name(),
            self.store.clone(),
            self.bus.clone(),
            self.execution.clone(),
        );
        let runner = Arc::new(AgentRunner::new(agent, ctx));

        runner
            .initialize()
            .await
            .map_err(|source| HubError::Initialization {
                agent: runner.name().to_string(),
                source,
            })?;

        match runner.kind() {
            AgentKind::Periodic { period } => {
                info!(agent = %runner.name(), ?period, "Registered periodic agent");
                self.periodic_agents.push(runner);
            }
            AgentKind::EventDriven { throttle } => {
                if runner.instruments().is_empty() {
                    debug!(agent = %runner.name(), "Event-driven agent declares no instruments, it still receives every tick");
                }
                self.subscribed_instruments
                    .extend(runner.instruments().iter().cloned());
                info!(
                    agent = %runner.name(),
                    ?throttle,
                    instruments = ?runner.instruments(),
                    "Registered event-driven agent"
                );
                self.event_agents.push(runner);
            }
        }

        Ok(())
    }

    /// Run every periodic loop and the upstream subscription until the hub is stopped,
    /// the upstream ends, or the upstream fails unrecoverably.
    pub async fn start(&self) -> Result<(), HubError> {
        {
            let mut status = self.status.write().await;
            if *status != HubStatus::Created {
                return Err(HubError::AlreadyStarted);
            }
            if self.event_agents.is_empty() && self.periodic_agents.is_empty() {
                warn!("No agents registered. The hub will do nothing.");
                *status = HubStatus::Stopped;
                return Ok(());
            }
            *status = HubStatus::Running;
        }

        info!(
            event_agents = self.event_agents.len(),
            periodic_agents = self.periodic_agents.len(),
            "Starting hub"
        );

        let mut tasks: JoinSet<Result<(), HubError>> = JoinSet::new();

        let floor = self.config.min_period();
        for runner in &self.periodic_agents {
            let period = runner.kind().interval().max(floor);
            tasks.spawn(run_periodic(runner.clone(), period, self.shutdown.subscribe()));
        }

        if !self.event_agents.is_empty() {
            match &self.feed {
                _ if self.subscribed_instruments.is_empty() => {
                    warn!("Event-driven agents registered but no instruments to subscribe to");
                }
                None => warn!("Event-driven agents registered but no market feed configured"),
                Some(feed) => {
                    let upstream = Upstream {
                        feed: feed.clone(),
                        symbols: self.subscribed_instruments.iter().cloned().collect(),
                        dispatcher: Dispatcher {
                            agents: self.event_agents.clone(),
                        },
                        reconnect: self.config.reconnect.clone(),
                        buffer: self.config.tick_buffer.max(1),
                    };
                    tasks.spawn(upstream.run(self.shutdown.subscribe()));
                }
            }
        }

        let mut outcome = Ok(());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("Stopping hub: {}", e);
                    self.shutdown.send_replace(true);
                    if outcome.is_ok() {
                        outcome = Err(e);
                    }
                }
                Err(e) => error!("Hub task aborted: {}", e),
            }
        }

        for runner in self.event_agents.iter().chain(self.periodic_agents.iter()) {
            runner.stop().await;
        }

        *self.status.write().await = HubStatus::Stopped;
        info!("Hub stopped");
        outcome
    }
}

/// Resolves once shutdown is signalled (or the hub is gone)
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// One periodic agent's loop: run, then sleep a full period. Iterations never overlap and
/// a run in progress is never cancelled.
async fn run_periodic(
    runner: Arc<AgentRunner>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), HubError> {
    info!(agent = %runner.name(), ?period, "Starting periodic loop");

    loop {
        if *shutdown.borrow() {
            break;
        }

        runner.tick_interval().await;

        tokio::select! {
            _ = tokio::time::sleep(period) => {}
            _ = stopped(&mut shutdown) => break,
        }
    }

    debug!(agent = %runner.name(), "Periodic loop stopped");
    Ok(())
}

/// Offers every tick to every event-driven agent; agents filter symbols themselves
struct Dispatcher {
    agents: Vec<Arc<AgentRunner>>,
}

impl Dispatcher {
    /// The admission decision is taken here, synchronously, so at most one run task
    /// per agent exists at any time.
    fn dispatch(&self, tick: Arc<Tick>, in_flight: &mut JoinSet<()>) {
        for runner in &self.agents {
            match runner.try_admit() {
                Ok(permit) => {
                    let runner = runner.clone();
                    let tick = tick.clone();
                    in_flight.spawn(async move {
                        runner.execute(Trigger::Tick(tick)).await;
                        drop(permit);
                    });
                }
                Err(dropped) => {
                    trace!(agent = %runner.name(), symbol = tick.symbol(), ?dropped, "Tick not admitted");
                }
            }
        }

        while in_flight.try_join_next().is_some() {}
    }
}

enum StreamEnd {
    Cancelled,
    Closed,
    Failed(ProviderError),
}

/// Supervises the single upstream subscription
struct Upstream {
    feed: Arc<dyn MarketFeed>,
    symbols: Vec<Symbol>,
    dispatcher: Dispatcher,
    reconnect: ReconnectConfig,
    buffer: usize,
}

impl Upstream {
    async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), HubError> {
        let mut in_flight = JoinSet::new();
        let mut failures: u32 = 0;

        let result = loop {
            info!(instruments = ?self.symbols, "Subscribing to upstream feed");
            let (end, dispatched) = self.connect(&mut shutdown, &mut in_flight).await;
            if dispatched > 0 {
                failures = 0;
            }

            match end {
                StreamEnd::Cancelled => break Ok(()),
                StreamEnd::Closed => {
                    info!("Upstream feed ended");
                    break Ok(());
                }
                StreamEnd::Failed(e) if !e.is_retryable() => {
                    error!("Upstream feed failed permanently: {}", e);
                    break Err(HubError::Upstream(e));
                }
                StreamEnd::Failed(e) => {
                    failures += 1;
                    if let Some(max) = self.reconnect.max_attempts {
                        if failures >= max {
                            error!("Upstream feed failed {} times in a row: {}", failures, e);
                            break Err(HubError::UpstreamExhausted {
                                attempts: failures,
                                last: e,
                            });
                        }
                    }

                    let delay = self.reconnect.delay_for_attempt(failures - 1);
                    warn!(
                        error = %e,
                        attempt = failures,
                        "Upstream feed disconnected, reconnecting in {:?}",
                        delay
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = stopped(&mut shutdown) => break Ok(()),
                    }
                }
            }
        };

        // let admitted runs finish
        while in_flight.join_next().await.is_some() {}
        result
    }

    /// One connection: stream ticks into the dispatcher until the feed ends or shutdown
    async fn connect(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        in_flight: &mut JoinSet<()>,
    ) -> (StreamEnd, u64) {
        let (tx, mut rx) = mpsc::channel(self.buffer);
        let stream = self.feed.stream(&self.symbols, tx);
        tokio::pin!(stream);

        let mut dispatched: u64 = 0;
        let end = loop {
            tokio::select! {
                _ = stopped(shutdown) => break StreamEnd::Cancelled,
                Some(tick) = rx.recv() => {
                    self.dispatcher.dispatch(Arc::new(tick), in_flight);
                    dispatched += 1;
                }
                result = &mut stream => {
                    break match result {
                        Ok(()) => StreamEnd::Closed,
                        Err(e) => StreamEnd::Failed(e),
                    };
                }
            }
        };

        if !matches!(end, StreamEnd::Cancelled) {
            // ticks queued before the stream ended
            while let Ok(tick) = rx.try_recv() {
                self.dispatcher.dispatch(Arc::new(tick), in_flight);
                dispatched += 1;
            }
        }

        (end, dispatched)
    }
}
