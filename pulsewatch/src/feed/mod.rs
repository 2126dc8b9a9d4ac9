use std::sync::Arc;

use derive_more::Display;
use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use smol_str::SmolStr;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use self::connection::Driver;
use crate::config::FeedConfig;
use crate::error::MonitorError;

/// Reconnecting transport session owned by the feed driver task.
mod connection;

/// Wire formats for the combined-stream endpoint.
pub mod protocol;

/// Lifecycle of the feed connection as observed through [`FeedClient::state`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Display, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedState {
    #[display("disconnected")]
    Disconnected,
    #[display("connecting")]
    Connecting,
    #[display("connected")]
    Connected,
    #[display("reconnecting")]
    Reconnecting,
    /// Reconnect budget exhausted or the endpoint rejected us outright.
    /// The driver has exited and a fresh [`FeedClient::connect`] is required.
    #[display("failed")]
    Failed,
}

/// Handle for one registered stream callback.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Display)]
#[display("{_0}")]
pub struct SubscriptionId(pub u64);

type StreamCallback = Box<dyn Fn(&Value) + Send + Sync>;

struct Subscriber {
    stream: SmolStr,
    callback: StreamCallback,
}

/// Stream subscribers in registration order.
#[derive(Default)]
struct Registry {
    subscribers: IndexMap<SubscriptionId, Subscriber>,
    next_id: u64,
}

impl Registry {
    fn add(&mut self, stream: SmolStr, callback: StreamCallback) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.subscribers.insert(id, Subscriber { stream, callback });
        id
    }

    fn remove(&mut self, id: SubscriptionId) -> Option<Subscriber> {
        self.subscribers.shift_remove(&id)
    }

    /// Distinct stream names with at least one subscriber, oldest first.
    fn streams(&self) -> Vec<String> {
        self.subscribers
            .values()
            .map(|subscriber| subscriber.stream.as_str())
            .collect::<IndexSet<_>>()
            .into_iter()
            .map(String::from)
            .collect()
    }

    fn has_stream(&self, stream: &str) -> bool {
        self.subscribers
            .values()
            .any(|subscriber| subscriber.stream == stream)
    }

    /// Invoke every callback registered for `stream`, in registration order.
    fn dispatch(&self, stream: &str, data: &Value) -> usize {
        let mut delivered = 0;
        for subscriber in self.subscribers.values() {
            if subscriber.stream == stream {
                (subscriber.callback)(data);
                delivered += 1;
            }
        }
        delivered
    }

    fn clear(&mut self) {
        self.subscribers.clear();
    }

    fn len(&self) -> usize {
        self.subscribers.len()
    }
}

#[derive(Debug)]
enum FeedCommand {
    Subscribe(SmolStr),
    Unsubscribe(SmolStr),
    Shutdown,
}

/// Market data feed client with automatic reconnection.
///
/// Subscriptions are held client side, so they can be registered before
/// the first [`connect`](Self::connect) and survive reconnects: every new
/// session replays the full set of live streams before pumping frames.
pub struct FeedClient {
    config: FeedConfig,
    registry: Arc<Mutex<Registry>>,
    state_tx: Arc<watch::Sender<FeedState>>,
    state_rx: watch::Receiver<FeedState>,
    command_tx: Option<mpsc::Sender<FeedCommand>>,
    driver: Option<JoinHandle<()>>,
}

impl FeedClient {
    pub fn new(config: FeedConfig) -> Self {
        let (state_tx, state_rx) = watch::channel(FeedState::Disconnected);
        Self {
            config,
            registry: Arc::new(Mutex::new(Registry::default())),
            state_tx: Arc::new(state_tx),
            state_rx,
            command_tx: None,
            driver: None,
        }
    }

    pub fn config(&self) -> &FeedConfig {
        &self.config
    }

    /// Register a callback for one stream name.
    ///
    /// Callbacks run synchronously on the driver task, so they should hand
    /// heavy work to a channel rather than do it inline. If the connection
    /// is live and this is the first subscriber for the stream, a
    /// subscribe request goes out before returning.
    pub async fn subscribe(
        &mut self,
        stream: impl Into<SmolStr>,
        callback: impl Fn(&Value) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let stream = stream.into();
        let mut registry = self.registry.lock();
        let already_live = registry.has_stream(&stream);
        let id = registry.add(stream.clone(), Box::new(callback));
        drop(registry);

        debug!(stream = %stream, id = %id, "registered stream subscriber");
        if !already_live {
            self.send_command(FeedCommand::Subscribe(stream)).await;
        }
        id
    }

    /// Drop one subscriber. Returns false for unknown ids.
    ///
    /// When the last subscriber of a stream goes away the stream itself is
    /// unsubscribed from the venue.
    pub async fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let mut registry = self.registry.lock();
        let Some(removed) = registry.remove(id) else {
            return false;
        };
        let last_for_stream = !registry.has_stream(&removed.stream);
        drop(registry);

        debug!(stream = %removed.stream, id = %id, "removed stream subscriber");
        if last_for_stream {
            self.send_command(FeedCommand::Unsubscribe(removed.stream)).await;
        }
        true
    }

    /// Spawn the connection driver. No-op when it is already running.
    pub fn connect(&mut self) -> Result<(), MonitorError> {
        if let Some(driver) = &self.driver {
            if !driver.is_finished() {
                debug!("feed driver already running");
                return Ok(());
            }
        }
        Url::parse(&self.config.url)?;

        let (command_tx, command_rx) = mpsc::channel(self.config.command_buffer_size);
        let driver = Driver::new(
            self.config.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.state_tx),
            command_rx,
        );
        self.command_tx = Some(command_tx);
        self.driver = Some(tokio::spawn(driver.run()));
        Ok(())
    }

    /// Close the connection, stop the driver and drop every subscriber.
    pub async fn disconnect(&mut self) {
        if let Some(command_tx) = self.command_tx.take() {
            let _ = command_tx.send(FeedCommand::Shutdown).await;
        }
        if let Some(driver) = self.driver.take() {
            let _ = driver.await;
        }
        self.registry.lock().clear();
        self.state_tx.send_replace(FeedState::Disconnected);
        info!("feed disconnected");
    }

    /// Watch the connection state machine.
    pub fn state(&self) -> watch::Receiver<FeedState> {
        self.state_rx.clone()
    }

    pub fn current_state(&self) -> FeedState {
        *self.state_rx.borrow()
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.lock().len()
    }

    async fn send_command(&self, command: FeedCommand) {
        let Some(command_tx) = &self.command_tx else {
            return;
        };
        if let Err(error) = command_tx.send(command).await {
            warn!(%error, "feed command not delivered, registry replays on next connect");
        }
    }
}

impl Default for FeedClient {
    fn default() -> Self {
        Self::new(FeedConfig::default())
    }
}
