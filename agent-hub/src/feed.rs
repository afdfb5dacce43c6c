//! Upstream market-data feed interface
//!
//! The hub opens exactly one stream for the union of its event-driven agents' instruments
//! and reconnects it when it fails with a retryable error.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use tokio::sync::mpsc;
use tracing::{debug, info};

use common::{Symbol, Tick};

use crate::error::ProviderError;

/// Source of ticks for the hub's single upstream subscription
#[async_trait]
pub trait MarketFeed: Send + Sync {
    /// Subscribe to `symbols` and push their ticks into `sink` until the connection ends.
    ///
    /// Returns `Ok` on a clean end of stream and a provider error on failure.
    async fn stream(&self, symbols: &[Symbol], sink: mpsc::Sender<Tick>) -> Result<(), ProviderError>;
}

enum FeedEvent {
    Tick(Tick),
    Disconnect(ProviderError),
}

/// Producer side of a [`ChannelFeed`]
#[derive(Clone)]
pub struct FeedSender {
    tx: mpsc::UnboundedSender<FeedEvent>,
}

impl FeedSender {
    /// Push a tick to the connected stream. Returns false once the feed has been dropped.
    pub fn send(&self, tick: Tick) -> bool {
        self.tx.send(FeedEvent::Tick(tick)).is_ok()
    }

    /// End the current connection with `error`
    pub fn disconnect(&self, error: ProviderError) -> bool {
        self.tx.send(FeedEvent::Disconnect(error)).is_ok()
    }
}

/// In-process feed driven through a [`FeedSender`].
///
/// Ticks for symbols outside the subscription are filtered out. Dropping every sender
/// ends the stream cleanly; [`FeedSender::disconnect`] ends it with an error, after which
/// the next `stream` call resumes from the same channel.
pub struct ChannelFeed {
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<FeedEvent>>,
    subscriptions: Mutex<Vec<Vec<Symbol>>>,
}

impl ChannelFeed {
    pub fn new() -> (Self, FeedSender) {
        let (tx, rx) = mpsc::unbounded_channel();
        let feed = Self {
            rx: tokio::sync::Mutex::new(rx),
            subscriptions: Mutex::new(Vec::new()),
        };
        (feed, FeedSender { tx })
    }

    /// Symbol sets requested by every `stream` call so far, in call order
    pub fn subscriptions(&self) -> Vec<Vec<Symbol>> {
        self.subscriptions.lock().clone()
    }
}

#[async_trait]
impl MarketFeed for ChannelFeed {
    async fn stream(&self, symbols: &[Symbol], sink: mpsc::Sender<Tick>) -> Result<(), ProviderError> {
        let mut rx = self
            .rx
            .try_lock()
            .map_err(|_| ProviderError::Rejected("channel feed is already streaming".to_string()))?;

        self.subscriptions.lock().push(symbols.to_vec());
        let wanted: HashSet<&str> = symbols.iter().map(String::as_str).collect();
        info!(symbols = ?symbols, "Channel feed subscribed");

        while let Some(event) = rx.recv().await {
            match event {
                FeedEvent::Tick(tick) => {
                    if !wanted.contains(tick.symbol()) {
                        debug!(symbol = tick.symbol(), "Skipping tick outside subscription");
                        continue;
                    }
                    sink.send(tick)
                        .await
                        .map_err(|_| ProviderError::Connection("dispatch channel closed".to_string()))?;
                }
                FeedEvent::Disconnect(error) => return Err(error),
            }
        }

        info!("Channel feed closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{Trade, Utc};

    fn trade(symbol: &str, price: f64) -> Tick {
        Tick::Trade(Trade {
            symbol: symbol.to_string(),
            price,
            size: 1.0,
            timestamp: Utc::now(),
        })
    }

    #[tokio::test]
    async fn test_filters_and_ends_cleanly() {
        let (feed, sender) = ChannelFeed::new();
        let (tx, mut rx) = mpsc::channel(16);

        assert!(sender.send(trade("AAPL", 1.0)));
        assert!(sender.send(trade("TSLA", 2.0)));
        assert!(sender.send(trade("AAPL", 3.0)));
        drop(sender);

        let result = feed.stream(&["AAPL".to_string()], tx).await;
        assert_eq!(result, Ok(()));

        let mut prices = Vec::new();
        while let Some(Tick::Trade(t)) = rx.recv().await {
            prices.push(t.price);
        }
        assert_eq!(prices, vec![1.0, 3.0]);
        assert_eq!(feed.subscriptions(), vec![vec!["AAPL".to_string()]]);
    }

    #[tokio::test]
    async fn test_disconnect_then_resume() {
        let (feed, sender) = ChannelFeed::new();
        let symbols = vec!["AAPL".to_string()];

        sender.disconnect(ProviderError::Connection("reset".into()));
        sender.send(trade("AAPL", 5.0));

        let (tx, _rx) = mpsc::channel(16);
        let first = feed.stream(&symbols, tx).await;
        assert_eq!(first, Err(ProviderError::Connection("reset".into())));

        drop(sender);
        let (tx, mut rx) = mpsc::channel(16);
        assert_eq!(feed.stream(&symbols, tx).await, Ok(()));
        assert!(matches!(rx.recv().await, Some(Tick::Trade(t)) if t.price == 5.0));
        assert_eq!(feed.subscriptions().len(), 2);
    }
}
