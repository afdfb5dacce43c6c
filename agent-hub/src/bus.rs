//! Communication bus for agent-to-agent messaging
//!
//! Two flavours share the `MessageBus` trait:
//! - `CommunicationBus` delivers each publish to the listeners subscribed at that moment
//!   and forgets the value.
//! - `StatefulBus` also remembers the last value of every topic and replays it to a
//!   listener as part of its subscribe call.
//!
//! A publish polls every listener concurrently and returns once all of them finished.
//! Listener errors and panics are logged and counted, never propagated to the publisher.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use futures::FutureExt;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

/// Opaque published value
pub type Payload = Arc<dyn Any + Send + Sync>;

/// A value published on a topic
#[derive(Clone)]
pub struct Message {
    topic: Arc<str>,
    payload: Payload,
    published_at: DateTime<Utc>,
}

impl Message {
    pub fn new(topic: &str, payload: Payload) -> Self {
        Self {
            topic: Arc::from(topic),
            payload,
            published_at: Utc::now(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Payload as `T`, if it has that type
    pub fn payload<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }

    pub fn raw_payload(&self) -> &Payload {
        &self.payload
    }

    pub fn published_at(&self) -> DateTime<Utc> {
        self.published_at
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("topic", &self.topic)
            .field("published_at", &self.published_at)
            .finish_non_exhaustive()
    }
}

/// Receiver of bus messages
#[async_trait]
pub trait Listener: Send + Sync {
    async fn on_message(&self, message: &Message) -> anyhow::Result<()>;
}

struct FnListener<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Listener for FnListener<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn on_message(&self, message: &Message) -> anyhow::Result<()> {
        (self.f)(message.clone()).await
    }
}

/// Wrap an async closure as a listener.
///
/// Listener identity is the returned `Arc`: subscribing the same `Arc` twice to a topic
/// is a no-op, while two separately created listeners are two subscriptions.
pub fn listener_fn<F, Fut>(f: F) -> Arc<dyn Listener>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnListener { f })
}

fn same_listener(a: &Arc<dyn Listener>, b: &Arc<dyn Listener>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Outcome of a publish (or of a subscribe replay)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub failed: usize,
}

impl Delivery {
    pub fn listeners(&self) -> usize {
        self.delivered + self.failed
    }
}

/// Publish/subscribe interface shared by both bus flavours
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Add `listener` to `topic`. Returns false if it was already subscribed.
    async fn subscribe(&self, topic: &str, listener: Arc<dyn Listener>) -> bool;

    /// Remove `listener` from `topic`. Returns true if it was subscribed.
    async fn unsubscribe(&self, topic: &str, listener: &Arc<dyn Listener>) -> bool;

    /// Deliver `payload` to every current subscriber of `topic`
    async fn publish_payload(&self, topic: &str, payload: Payload) -> Delivery;

    /// Last value published on `topic`, for buses that keep one
    async fn last_value(&self, topic: &str) -> Option<Message> {
        let _ = topic;
        None
    }

    /// Number of listeners subscribed to `topic`
    async fn subscriber_count(&self, topic: &str) -> usize;
}

impl dyn MessageBus {
    /// Publish a typed value
    pub async fn publish<T: Any + Send + Sync>(&self, topic: &str, value: T) -> Delivery {
        self.publish_payload(topic, Arc::new(value)).await
    }
}

/// Invoke every listener concurrently with `message`, isolating failures
async fn deliver(listeners: &[Arc<dyn Listener>], message: &Message) -> Delivery {
    let calls = listeners
        .iter()
        .map(|listener| AssertUnwindSafe(listener.on_message(message)).catch_unwind());

    let mut delivery = Delivery::default();
    for outcome in join_all(calls).await {
        match outcome {
            Ok(Ok(())) => delivery.delivered += 1,
            Ok(Err(e)) => {
                warn!(topic = %message.topic(), error = %e, "Listener failed");
                delivery.failed += 1;
            }
            Err(_) => {
                error!(topic = %message.topic(), "Listener panicked");
                delivery.failed += 1;
            }
        }
    }
    delivery
}

fn add_listener(listeners: &mut Vec<Arc<dyn Listener>>, listener: Arc<dyn Listener>) -> bool {
    if listeners.iter().any(|l| same_listener(l, &listener)) {
        return false;
    }
    listeners.push(listener);
    true
}

fn remove_listener(listeners: &mut Vec<Arc<dyn Listener>>, listener: &Arc<dyn Listener>) -> bool {
    let before = listeners.len();
    listeners.retain(|l| !same_listener(l, listener));
    listeners.len() != before
}

/// Fire-and-forget bus: no value is retained after a publish
#[derive(Default)]
pub struct CommunicationBus {
    subscriptions: DashMap<String, Vec<Arc<dyn Listener>>>,
}

impl CommunicationBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn publish<T: Any + Send + Sync>(&self, topic: &str, value: T) -> Delivery {
        self.publish_payload(topic, Arc::new(value)).await
    }
}

#[async_trait]
impl MessageBus for CommunicationBus {
    async fn subscribe(&self, topic: &str, listener: Arc<dyn Listener>) -> bool {
        let added = add_listener(
            &mut self.subscriptions.entry(topic.to_string()).or_default(),
            listener,
        );
        debug!(topic, added, "Subscribe");
        added
    }

    async fn unsubscribe(&self, topic: &str, listener: &Arc<dyn Listener>) -> bool {
        match self.subscriptions.get_mut(topic) {
            Some(mut listeners) => remove_listener(&mut listeners, listener),
            None => false,
        }
    }

    async fn publish_payload(&self, topic: &str, payload: Payload) -> Delivery {
        // Snapshot so no map guard is held across the awaits below
        let listeners = match self.subscriptions.get(topic) {
            Some(listeners) if !listeners.is_empty() => listeners.value().clone(),
            _ => return Delivery::default(),
        };

        deliver(&listeners, &Message::new(topic, payload)).await
    }

    async fn subscriber_count(&self, topic: &str) -> usize {
        self.subscriptions.get(topic).map(|l| l.len()).unwrap_or(0)
    }
}

#[derive(Default)]
struct TopicState {
    listeners: Vec<Arc<dyn Listener>>,
    last: Option<Message>,
}

/// Bus that remembers the last value per topic and replays it to late subscribers.
///
/// Subscribe and publish on one topic are serialized by that topic's lock: a subscriber
/// either is part of a publish's listener snapshot and gets the live delivery, or joins
/// after it and gets the value as a replay, never both.
#[derive(Default)]
pub struct StatefulBus {
    topics: DashMap<String, Arc<Mutex<TopicState>>>,
}

impl StatefulBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn publish<T: Any + Send + Sync>(&self, topic: &str, value: T) -> Delivery {
        self.publish_payload(topic, Arc::new(value)).await
    }

    fn topic(&self, topic: &str) -> Arc<Mutex<TopicState>> {
        self.topics.entry(topic.to_string()).or_default().clone()
    }

    /// Topics that currently hold a last value
    pub async fn topics_with_value(&self) -> Vec<String> {
        let states: Vec<(String, Arc<Mutex<TopicState>>)> = self
            .topics
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut topics = Vec::new();
        for (name, state) in states {
            if state.lock().await.last.is_some() {
                topics.push(name);
            }
        }
        topics.sort();
        topics
    }
}

#[async_trait]
impl MessageBus for StatefulBus {
    async fn subscribe(&self, topic: &str, listener: Arc<dyn Listener>) -> bool {
        let state = self.topic(topic);
        let mut guard = state.lock().await;

        if !add_listener(&mut guard.listeners, listener.clone()) {
            return false;
        }

        if let Some(last) = guard.last.clone() {
            debug!(topic, "Replaying last value to new subscriber");
            // Replay happens under the topic lock so no publish can interleave
            deliver(std::slice::from_ref(&listener), &last).await;
        }
        true
    }

    async fn unsubscribe(&self, topic: &str, listener: &Arc<dyn Listener>) -> bool {
        let Some(state) = self.topics.get(topic).map(|s| s.clone()) else {
            return false;
        };
        let mut guard = state.lock().await;
        remove_listener(&mut guard.listeners, listener)
    }

    async fn publish_payload(&self, topic: &str, payload: Payload) -> Delivery {
        let message = Message::new(topic, payload);

        let state = self.topic(topic);
        let listeners = {
            let mut guard = state.lock().await;
            guard.last = Some(message.clone());
            guard.listeners.clone()
        };

        if listeners.is_empty() {
            return Delivery::default();
        }
        deliver(&listeners, &message).await
    }

    async fn last_value(&self, topic: &str) -> Option<Message> {
        let state = self.topics.get(topic).map(|s| s.clone())?;
        let guard = state.lock().await;
        guard.last.clone()
    }

    async fn subscriber_count(&self, topic: &str) -> usize {
        let Some(state) = self.topics.get(topic).map(|s| s.clone()) else {
            return 0;
        };
        let guard = state.lock().await;
        guard.listeners.len()
    }
}
