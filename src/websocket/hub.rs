//! Hub Control Loop
//!
//! The hub owns every piece of connection and subscription state. Nothing
//! outside [`Hub::run`] ever touches its maps: connections and publishers
//! talk to it through a [`HubHandle`], and the loop applies one event at a
//! time.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use super::connection::{Connection, ConnectionId, Outgoing};
use super::error::HubError;
use super::messages::{subscription_ack, MailMessage, Message, Subscription};
use super::token::{self, Tokenizer};

/// What the hub does when a connection's outbound buffer is full
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlowConsumerPolicy {
    /// Wait for room. A stalled client stalls every delivery until its
    /// buffer drains or its connection is torn down.
    #[default]
    Block,
    /// Skip the message for that connection and log a warning
    Drop,
}

/// Configuration for the hub and its connection pumps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Largest inbound frame accepted from a client, in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Idle time after which a silent connection is dropped
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,

    /// Time allowed for a single frame write
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,

    /// Keepalive ping period; must be shorter than the read timeout
    #[serde(default = "default_ping_interval")]
    pub ping_interval_ms: u64,

    /// Outbound buffer capacity per connection
    #[serde(default = "default_buffer")]
    pub send_buffer: usize,

    /// Capacity of each hub event queue
    #[serde(default = "default_buffer")]
    pub event_buffer: usize,

    /// Hosts allowed in the `Origin` header; `*` or an empty list allows all
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,

    #[serde(default)]
    pub slow_consumer: SlowConsumerPolicy,

    /// Send a frame back after every subscription attempt
    #[serde(default)]
    pub acknowledge_subscriptions: bool,
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_read_timeout() -> u64 {
    60_000
}

fn default_write_timeout() -> u64 {
    10_000
}

fn default_ping_interval() -> u64 {
    default_read_timeout() * 9 / 10
}

fn default_buffer() -> usize {
    256
}

fn default_allowed_origins() -> Vec<String> {
    vec!["*".to_string()]
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
            read_timeout_ms: default_read_timeout(),
            write_timeout_ms: default_write_timeout(),
            ping_interval_ms: default_ping_interval(),
            send_buffer: default_buffer(),
            event_buffer: default_buffer(),
            allowed_origins: default_allowed_origins(),
            slow_consumer: SlowConsumerPolicy::default(),
            acknowledge_subscriptions: false,
        }
    }
}

impl HubConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Keepalive period, never shorter than one millisecond
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms.max(1))
    }

    /// Check values the pumps cannot work with
    pub fn validate(&self) -> Result<(), String> {
        if self.ping_interval_ms == 0 || self.write_timeout_ms == 0 {
            return Err("ping_interval_ms and write_timeout_ms must be positive".to_string());
        }
        if self.ping_interval_ms >= self.read_timeout_ms {
            return Err(format!(
                "ping_interval_ms ({}) must be less than read_timeout_ms ({})",
                self.ping_interval_ms, self.read_timeout_ms
            ));
        }
        if self.send_buffer == 0 || self.event_buffer == 0 {
            return Err("send_buffer and event_buffer must be positive".to_string());
        }
        if self.max_message_size == 0 {
            return Err("max_message_size must be positive".to_string());
        }
        Ok(())
    }
}

/// Snapshot of hub state, read through the control loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    /// Registered connections, authenticated or not
    pub connections: usize,
    /// Connections bound to a subscriber
    pub authenticated: usize,
    /// Distinct usernames with at least one connection
    pub subscribers: usize,
}

/// Events produced on behalf of a connection
///
/// They share one queue so the hub sees each connection's register,
/// subscribe and unregister in the order they happened.
enum Control {
    Register(Connection),
    Unregister(ConnectionId),
    Subscribe(Subscription),
    Stats(oneshot::Sender<HubStats>),
}

/// Cloneable handle for talking to a running hub
#[derive(Clone)]
pub struct HubHandle {
    control: mpsc::Sender<Control>,
    broadcast: mpsc::Sender<Message>,
    mailbox: mpsc::Sender<MailMessage>,
    config: Arc<HubConfig>,
}

impl HubHandle {
    pub fn config(&self) -> &Arc<HubConfig> {
        &self.config
    }

    /// Add a connection in the unauthenticated state
    pub async fn register(&self, connection: Connection) -> Result<(), HubError> {
        self.send_control(Control::Register(connection)).await
    }

    /// Detach and close a connection
    pub async fn unregister(&self, id: ConnectionId) -> Result<(), HubError> {
        self.send_control(Control::Unregister(id)).await
    }

    /// Ask the hub to bind a connection to a username
    pub async fn subscribe(&self, subscription: Subscription) -> Result<(), HubError> {
        self.send_control(Control::Subscribe(subscription)).await
    }

    /// Queue a message for every connected client
    pub async fn broadcast(&self, message: Message) -> Result<(), HubError> {
        self.broadcast
            .send(message)
            .await
            .map_err(|_| HubError::Stopped)
    }

    /// Queue a message for the connections subscribed as `mail.username`
    pub async fn mailbox(&self, mail: MailMessage) -> Result<(), HubError> {
        self.mailbox.send(mail).await.map_err(|_| HubError::Stopped)
    }

    /// Current connection and subscriber counts
    pub async fn stats(&self) -> Result<HubStats, HubError> {
        let (tx, rx) = oneshot::channel();
        self.send_control(Control::Stats(tx)).await?;
        rx.await.map_err(|_| HubError::Stopped)
    }

    async fn send_control(&self, event: Control) -> Result<(), HubError> {
        self.control.send(event).await.map_err(|_| HubError::Stopped)
    }
}

/// Connections sharing one username
#[derive(Debug)]
struct Subscriber {
    connections: HashSet<ConnectionId>,
}

/// A registered connection and the username it is bound to, if any
#[derive(Debug)]
struct Registration {
    connection: Connection,
    username: Option<String>,
}

/// The state-owning control loop
pub struct Hub {
    /// ConnectionId → connection and its subscriber
    connections: HashMap<ConnectionId, Registration>,
    /// Username → subscriber; present only while it has connections
    subscribers: HashMap<String, Subscriber>,
    tokenizer: Option<Arc<dyn Tokenizer>>,
    config: Arc<HubConfig>,
    control_rx: mpsc::Receiver<Control>,
    broadcast_rx: mpsc::Receiver<Message>,
    mailbox_rx: mpsc::Receiver<MailMessage>,
}

impl Hub {
    /// Create a hub and the handle used to feed it
    ///
    /// Without a tokenizer every subscription attempt is rejected, but
    /// broadcasts still reach every connection.
    pub fn new(config: HubConfig, tokenizer: Option<Arc<dyn Tokenizer>>) -> (Self, HubHandle) {
        if let Err(e) = config.validate() {
            tracing::warn!(error = %e, "Hub configuration is out of range");
        }
        let capacity = config.event_buffer.max(1);
        let (control, control_rx) = mpsc::channel(capacity);
        let (broadcast, broadcast_rx) = mpsc::channel(capacity);
        let (mailbox, mailbox_rx) = mpsc::channel(capacity);
        let config = Arc::new(config);

        let hub = Self {
            connections: HashMap::new(),
            subscribers: HashMap::new(),
            tokenizer,
            config: Arc::clone(&config),
            control_rx,
            broadcast_rx,
            mailbox_rx,
        };
        let handle = HubHandle {
            control,
            broadcast,
            mailbox,
            config,
        };
        (hub, handle)
    }

    /// Create a hub and run it on a background task
    pub fn spawn(config: HubConfig, tokenizer: Option<Arc<dyn Tokenizer>>) -> HubHandle {
        let (hub, handle) = Self::new(config, tokenizer);
        tokio::spawn(hub.run());
        handle
    }

    /// Process events until every handle has been dropped
    pub async fn run(mut self) {
        tracing::debug!("Hub started");

        loop {
            tokio::select! {
                Some(event) = self.control_rx.recv() => self.handle_control(event).await,
                Some(message) = self.broadcast_rx.recv() => self.broadcast(&message).await,
                Some(mail) = self.mailbox_rx.recv() => self.mailbox(&mail).await,
                else => break,
            }
        }

        for registration in self.connections.values() {
            registration.connection.close();
        }
        tracing::debug!(
            connections = self.connections.len(),
            "Hub stopped, closed remaining connections"
        );
    }

    async fn handle_control(&mut self, event: Control) {
        match event {
            Control::Register(connection) => self.register(connection),
            Control::Unregister(id) => self.unregister(id),
            Control::Subscribe(subscription) => self.subscribe(subscription).await,
            Control::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
        }
    }

    fn register(&mut self, connection: Connection) {
        let id = connection.id();
        self.connections.insert(
            id,
            Registration {
                connection,
                username: None,
            },
        );
        tracing::debug!(connection_id = %id, total = self.connections.len(), "Registered connection");
    }

    fn unregister(&mut self, id: ConnectionId) {
        let registration = match self.connections.remove(&id) {
            Some(registration) => registration,
            None => {
                tracing::warn!(connection_id = %id, "Cannot unregister connection, it is not registered");
                return;
            }
        };

        if let Some(username) = &registration.username {
            self.detach(id, username);
        }

        // Dropping the registration drops the outbound sender as well
        registration.connection.close();
        tracing::debug!(connection_id = %id, total = self.connections.len(), "Unregistered connection");
    }

    async fn subscribe(&mut self, subscription: Subscription) {
        let accepted = self.bind(&subscription);

        if !self.config.acknowledge_subscriptions {
            return;
        }
        let registration = match self.connections.get(&subscription.connection) {
            Some(registration) => registration,
            None => return,
        };
        let payload = match subscription_ack(&subscription.username, accepted).to_json() {
            Ok(text) => Outgoing::from(text),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize subscription ack");
                return;
            }
        };
        if let Err(e) = registration
            .connection
            .enqueue(payload, self.config.slow_consumer)
            .await
        {
            tracing::debug!(connection_id = %subscription.connection, error = %e, "Subscription ack not delivered");
        }
    }

    /// Validate the token and bind the connection to its subscriber
    fn bind(&mut self, subscription: &Subscription) -> bool {
        let id = subscription.connection;
        let username = &subscription.username;

        let tokenizer = match self.tokenizer.as_deref() {
            Some(tokenizer) => tokenizer,
            None => {
                tracing::debug!("Subscription tokenizer is not set, cannot validate subscriptions");
                return false;
            }
        };

        if !self.connections.contains_key(&id) {
            tracing::warn!(connection_id = %id, username = %username, "Subscription from unregistered connection");
            return false;
        }

        if !token::verify(tokenizer, username, &subscription.token) {
            tracing::warn!(connection_id = %id, username = %username, "Subscription token does not match");
            return false;
        }

        let previous = self
            .connections
            .get_mut(&id)
            .and_then(|registration| registration.username.replace(username.clone()));
        if let Some(previous) = previous {
            if &previous != username {
                self.detach(id, &previous);
            }
        }

        self.subscribers
            .entry(username.clone())
            .or_insert_with(|| Subscriber {
                connections: HashSet::new(),
            })
            .connections
            .insert(id);

        tracing::debug!(connection_id = %id, username = %username, "Subscribed");
        true
    }

    /// Remove a connection from a subscriber, dropping the subscriber once empty
    fn detach(&mut self, id: ConnectionId, username: &str) {
        if let Some(subscriber) = self.subscribers.get_mut(username) {
            subscriber.connections.remove(&id);
            tracing::debug!(connection_id = %id, username = %username, "Detached one of the subscriber's connections");

            if subscriber.connections.is_empty() {
                self.subscribers.remove(username);
                tracing::debug!(username = %username, "Unsubscribed, no more open connections");
            }
        }
    }

    async fn broadcast(&self, message: &Message) {
        let payload = match message.to_json() {
            Ok(text) => Outgoing::from(text),
            Err(e) => {
                tracing::warn!(topic = %message.topic, error = %e, "Failed to serialize message");
                return;
            }
        };

        let mut delivered = 0;
        for (id, registration) in &self.connections {
            if self.deliver(*id, &registration.connection, &payload).await {
                delivered += 1;
            }
        }

        tracing::debug!(topic = %message.topic, delivered, "Broadcast message");
    }

    async fn mailbox(&self, mail: &MailMessage) {
        let subscriber = match self.subscribers.get(&mail.username) {
            Some(subscriber) => subscriber,
            None => {
                tracing::debug!(username = %mail.username, "There are no subscriptions from user");
                return;
            }
        };

        let payload = match mail.message.to_json() {
            Ok(text) => Outgoing::from(text),
            Err(e) => {
                tracing::warn!(username = %mail.username, error = %e, "Failed to serialize message");
                return;
            }
        };

        let mut delivered = 0;
        for id in &subscriber.connections {
            if let Some(registration) = self.connections.get(id) {
                if self.deliver(*id, &registration.connection, &payload).await {
                    delivered += 1;
                }
            }
        }

        tracing::debug!(
            username = %mail.username,
            topic = %mail.message.topic,
            delivered,
            "Delivered mailbox message"
        );
    }

    async fn deliver(&self, id: ConnectionId, connection: &Connection, payload: &Outgoing) -> bool {
        match connection
            .enqueue(Arc::clone(payload), self.config.slow_consumer)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                match self.config.slow_consumer {
                    SlowConsumerPolicy::Drop => {
                        tracing::warn!(connection_id = %id, error = %e, "Dropped message for slow connection")
                    }
                    SlowConsumerPolicy::Block => {
                        tracing::debug!(connection_id = %id, error = %e, "Message not delivered")
                    }
                }
                false
            }
        }
    }

    fn stats(&self) -> HubStats {
        HubStats {
            connections: self.connections.len(),
            authenticated: self
                .connections
                .values()
                .filter(|registration| registration.username.is_some())
                .count(),
            subscribers: self.subscribers.len(),
        }
    }

    #[cfg(test)]
    fn subscriber_size(&self, username: &str) -> Option<usize> {
        self.subscribers.get(username).map(|s| s.connections.len())
    }
}
