//! Connection Pumps
//!
//! Every accepted socket gets two tasks: a read pump that decodes
//! subscription frames and hands them to the hub, and a write pump that
//! flushes queued envelopes and keeps the peer alive with pings. Whichever
//! side fails first closes the connection; the close guard makes sure that
//! happens exactly once.

use axum::extract::ws::Message as WsMessage;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant, MissedTickBehavior};
use uuid::Uuid;

use super::error::ConnectionError;
use super::hub::{HubConfig, HubHandle, SlowConsumerPolicy};
use super::messages::{Subscription, SubscriptionFrame};

/// Unique identifier for a connection
pub type ConnectionId = Uuid;

/// Serialized envelope waiting in a connection's outbound buffer
///
/// Shared so a fan-out serializes once no matter how many connections
/// receive it.
pub type Outgoing = Arc<str>;

/// Close-once flag shared by the hub and both pumps
///
/// The flag lives in a watch channel: the compare-and-set in
/// [`CloseGuard::close`] runs under the channel's lock, and waiters wake as
/// soon as it flips.
#[derive(Debug)]
struct CloseGuard {
    closed: watch::Sender<bool>,
}

impl CloseGuard {
    fn new() -> Self {
        let (closed, _) = watch::channel(false);
        Self { closed }
    }

    /// Returns true for the single caller that performed the close
    fn close(&self) -> bool {
        self.closed.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        })
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        // The sender lives as long as self, so this cannot fail
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

fn close_once(id: ConnectionId, guard: &CloseGuard) -> bool {
    let first = guard.close();
    if first {
        tracing::debug!(connection_id = %id, "Closing connection");
    } else {
        tracing::debug!(connection_id = %id, "Connection was already closed");
    }
    first
}

/// The hub's handle on one live connection
///
/// Owns the sending half of the outbound buffer. Dropping it (which the hub
/// does on unregister) tells the write pump no more envelopes are coming.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    sender: mpsc::Sender<Outgoing>,
    guard: Arc<CloseGuard>,
}

impl Connection {
    /// Create a connection with an outbound buffer of `capacity` envelopes
    ///
    /// Returns the hub-side handle and the pump-side receiver.
    pub fn new(capacity: usize) -> (Self, Outbound) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let id = Uuid::new_v4();
        let guard = Arc::new(CloseGuard::new());

        let connection = Self {
            id,
            sender,
            guard: Arc::clone(&guard),
        };
        let outbound = Outbound {
            id,
            receiver,
            guard,
        };
        (connection, outbound)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.guard.is_closed()
    }

    /// Close the connection; only the first call has any effect
    pub fn close(&self) -> bool {
        close_once(self.id, &self.guard)
    }

    /// A cloneable handle that can close this connection or wait for it
    pub fn closer(&self) -> Closer {
        Closer {
            id: self.id,
            guard: Arc::clone(&self.guard),
        }
    }

    /// Queue an envelope for the write pump
    pub async fn enqueue(
        &self,
        payload: Outgoing,
        policy: SlowConsumerPolicy,
    ) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }

        match policy {
            SlowConsumerPolicy::Block => self
                .sender
                .send(payload)
                .await
                .map_err(|_| ConnectionError::Closed),
            SlowConsumerPolicy::Drop => self.sender.try_send(payload).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => ConnectionError::Backlogged,
                mpsc::error::TrySendError::Closed(_) => ConnectionError::Closed,
            }),
        }
    }
}

/// Pump-side end of a connection's outbound buffer
#[derive(Debug)]
pub struct Outbound {
    id: ConnectionId,
    receiver: mpsc::Receiver<Outgoing>,
    guard: Arc<CloseGuard>,
}

impl Outbound {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub async fn recv(&mut self) -> Option<Outgoing> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Outgoing> {
        self.receiver.try_recv().ok()
    }

    /// Stop accepting envelopes and mark the connection closed
    fn shutdown(&mut self) {
        self.receiver.close();
        close_once(self.id, &self.guard);
    }
}

/// Cloneable close handle held by the read pump
#[derive(Debug, Clone)]
pub struct Closer {
    id: ConnectionId,
    guard: Arc<CloseGuard>,
}

impl Closer {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn close(&self) -> bool {
        close_once(self.id, &self.guard)
    }

    pub fn is_closed(&self) -> bool {
        self.guard.is_closed()
    }

    /// Resolves once the connection has been closed by anyone
    pub async fn closed(&self) {
        self.guard.closed().await
    }
}

/// Drive one accepted socket until it closes
///
/// Registers the connection, spawns the write pump and runs the read pump on
/// the calling task. Returns after the socket has been closed.
pub async fn serve<S, E>(socket: S, hub: HubHandle)
where
    S: Stream<Item = Result<WsMessage, E>> + Sink<WsMessage, Error = E> + Send + 'static,
    E: Display + Send + 'static,
{
    let config = Arc::clone(hub.config());
    let (connection, outbound) = Connection::new(config.send_buffer);
    let closer = connection.closer();
    let id = connection.id();

    if hub.register(connection).await.is_err() {
        tracing::warn!(connection_id = %id, "Hub is not running, dropping connection");
        return;
    }
    tracing::debug!(connection_id = %id, "Connection registered");

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_pump(sink, outbound, Arc::clone(&config)));

    let reason = read_pump(stream, &closer, &hub, &config).await;
    tracing::debug!(connection_id = %id, reason = %reason, "Read pump stopped");

    if hub.unregister(id).await.is_err() {
        tracing::debug!(connection_id = %id, "Hub stopped before connection was unregistered");
    }
    closer.close();

    if let Err(e) = writer.await {
        tracing::error!(connection_id = %id, error = %e, "Write pump panicked");
    }
}

async fn read_pump<R, E>(
    mut stream: R,
    closer: &Closer,
    hub: &HubHandle,
    config: &HubConfig,
) -> ConnectionError
where
    R: Stream<Item = Result<WsMessage, E>> + Unpin,
    E: Display,
{
    let id = closer.id();
    let read_timeout = config.read_timeout();

    loop {
        // Every received frame, pongs included, restarts the idle deadline
        let next = tokio::select! {
            _ = closer.closed() => return ConnectionError::Closed,
            next = time::timeout(read_timeout, stream.next()) => next,
        };

        let frame = match next {
            Err(_) => return ConnectionError::ReadTimeout,
            Ok(None) => return ConnectionError::PeerClosed,
            Ok(Some(Err(e))) => return ConnectionError::Transport(e.to_string()),
            Ok(Some(Ok(frame))) => frame,
        };

        let payload: &[u8] = match &frame {
            WsMessage::Text(text) => text.as_bytes(),
            WsMessage::Binary(data) => data.as_slice(),
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
            WsMessage::Close(_) => return ConnectionError::PeerClosed,
        };

        if payload.len() > config.max_message_size {
            return ConnectionError::FrameTooLarge {
                size: payload.len(),
                limit: config.max_message_size,
            };
        }

        match SubscriptionFrame::parse(payload) {
            Ok(frame) => {
                if hub.subscribe(Subscription::new(frame, id)).await.is_err() {
                    return ConnectionError::HubStopped;
                }
            }
            Err(e) => {
                tracing::warn!(
                    connection_id = %id,
                    error = %e,
                    frame = %String::from_utf8_lossy(payload),
                    "Invalid subscription frame"
                );
            }
        }
    }
}

async fn write_pump<W, E>(mut sink: W, mut outbound: Outbound, config: Arc<HubConfig>)
where
    W: Sink<WsMessage, Error = E> + Unpin,
    E: Display,
{
    let id = outbound.id();
    let write_timeout = config.write_timeout();
    let ping_interval = config.ping_interval();
    let guard = Arc::clone(&outbound.guard);

    let mut ticker = time::interval_at(Instant::now() + ping_interval, ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let reason = loop {
        tokio::select! {
            payload = outbound.receiver.recv() => match payload {
                Some(payload) => {
                    let frame = WsMessage::Text(payload.to_string());
                    if let Err(e) = write_frame(&mut sink, frame, write_timeout).await {
                        break e;
                    }
                }
                None => {
                    // The hub dropped its handle: the connection is unregistered
                    say_goodbye(&mut sink, id, write_timeout).await;
                    break ConnectionError::Closed;
                }
            },
            _ = ticker.tick() => {
                if let Err(e) = write_frame(&mut sink, WsMessage::Ping(Vec::new()), write_timeout).await {
                    break e;
                }
            }
            _ = guard.closed() => {
                say_goodbye(&mut sink, id, write_timeout).await;
                break ConnectionError::Closed;
            }
        }
    };
    tracing::debug!(connection_id = %id, reason = %reason, "Write pump stopped");

    outbound.shutdown();

    match time::timeout(write_timeout, sink.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::debug!(connection_id = %id, error = %e, "Socket was already closed");
        }
        Err(_) => {
            tracing::debug!(connection_id = %id, "Timed out closing socket");
        }
    }
}

async fn write_frame<W, E>(
    sink: &mut W,
    frame: WsMessage,
    write_timeout: Duration,
) -> Result<(), ConnectionError>
where
    W: Sink<WsMessage, Error = E> + Unpin,
    E: Display,
{
    match time::timeout(write_timeout, sink.send(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ConnectionError::Transport(e.to_string())),
        Err(_) => Err(ConnectionError::WriteTimeout),
    }
}

async fn say_goodbye<W, E>(sink: &mut W, id: ConnectionId, write_timeout: Duration)
where
    W: Sink<WsMessage, Error = E> + Unpin,
    E: Display,
{
    if let Err(e) = write_frame(sink, WsMessage::Close(None), write_timeout).await {
        tracing::debug!(connection_id = %id, error = %e, "Socket already closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::{Hub, Message, Tokenizer};
    use serde_json::json;
    use std::io;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::task::{Context, Poll};

    type Inbound = Result<WsMessage, io::Error>;

    /// In-memory socket: the test plays the peer through [`Peer`]
    struct FakeSocket {
        inbound: mpsc::UnboundedReceiver<Inbound>,
        outbound: mpsc::UnboundedSender<WsMessage>,
        closes: Arc<AtomicUsize>,
        fail_writes: Arc<AtomicBool>,
    }

    struct Peer {
        inbound: mpsc::UnboundedSender<Inbound>,
        outbound: mpsc::UnboundedReceiver<WsMessage>,
        closes: Arc<AtomicUsize>,
        fail_writes: Arc<AtomicBool>,
    }

    fn fake_socket() -> (FakeSocket, Peer) {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let closes = Arc::new(AtomicUsize::new(0));
        let fail_writes = Arc::new(AtomicBool::new(false));

        let socket = FakeSocket {
            inbound: in_rx,
            outbound: out_tx,
            closes: Arc::clone(&closes),
            fail_writes: Arc::clone(&fail_writes),
        };
        let peer = Peer {
            inbound: in_tx,
            outbound: out_rx,
            closes,
            fail_writes,
        };
        (socket, peer)
    }

    impl Stream for FakeSocket {
        type Item = Inbound;

        fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Inbound>> {
            self.inbound.poll_recv(cx)
        }
    }

    impl Sink<WsMessage> for FakeSocket {
        type Error = io::Error;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(self: Pin<&mut Self>, item: WsMessage) -> io::Result<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe"));
            }
            let _ = self.outbound.send(item);
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Poll::Ready(Ok(()))
        }
    }

    impl Peer {
        fn send_text(&self, text: &str) {
            self.inbound
                .send(Ok(WsMessage::Text(text.to_string())))
                .unwrap();
        }

        /// Next data frame, skipping keepalive pings
        async fn next_text(&mut self) -> Option<String> {
            loop {
                let frame = time::timeout(Duration::from_secs(2), self.outbound.recv())
                    .await
                    .ok()??;
                match frame {
                    WsMessage::Text(text) => return Some(text),
                    WsMessage::Ping(_) => continue,
                    _ => return None,
                }
            }
        }

        fn closes(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }
    }

    fn fake_tokenizer() -> Arc<dyn Tokenizer> {
        Arc::new(|username: &str| format!("token-{}", username))
    }

    fn test_config() -> HubConfig {
        HubConfig {
            read_timeout_ms: 2_000,
            write_timeout_ms: 500,
            ping_interval_ms: 1_000,
            ..Default::default()
        }
    }

    async fn wait_until<F>(hub: &HubHandle, done: F)
    where
        F: Fn(&crate::websocket::HubStats) -> bool,
    {
        for _ in 0..200 {
            let stats = hub.stats().await.unwrap();
            if done(&stats) {
                return;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        panic!("hub never reached the expected state");
    }

    async fn wait_for_closes(peer: &Peer, expected: usize) {
        for _ in 0..200 {
            if peer.closes() >= expected {
                return;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn test_close_guard_single_winner() {
        let (connection, _outbound) = Connection::new(4);
        let closer = connection.closer();

        assert!(!connection.is_closed());
        assert!(closer.close());
        assert!(!connection.close());
        assert!(!closer.close());
        assert!(connection.is_closed());
    }

    #[tokio::test]
    async fn test_concurrent_close_has_one_winner() {
        let (connection, _outbound) = Connection::new(4);
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let closer = connection.closer();
            tasks.push(tokio::spawn(async move { closer.close() }));
        }

        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_enqueue_after_close_is_rejected() {
        let (connection, mut outbound) = Connection::new(4);
        connection
            .enqueue(Arc::from("one"), SlowConsumerPolicy::Block)
            .await
            .unwrap();
        connection.close();

        let result = connection
            .enqueue(Arc::from("two"), SlowConsumerPolicy::Block)
            .await;
        assert!(matches!(result, Err(ConnectionError::Closed)));
        assert_eq!(outbound.try_recv().as_deref(), Some("one"));
        assert!(outbound.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_drop_policy_reports_full_buffer() {
        let (connection, _outbound) = Connection::new(1);
        connection
            .enqueue(Arc::from("one"), SlowConsumerPolicy::Drop)
            .await
            .unwrap();

        let result = connection
            .enqueue(Arc::from("two"), SlowConsumerPolicy::Drop)
            .await;
        assert!(matches!(result, Err(ConnectionError::Backlogged)));
    }

    #[tokio::test]
    async fn test_subscribe_over_socket_then_receive_mail() {
        let hub = Hub::spawn(test_config(), Some(fake_tokenizer()));
        let (socket, mut peer) = fake_socket();
        tokio::spawn(serve(socket, hub.clone()));

        wait_until(&hub, |s| s.connections == 1).await;
        peer.send_text("not a subscription");
        peer.send_text(r#"{"Username": "alice", "Token": "token-alice"}"#);
        wait_until(&hub, |s| s.subscribers == 1).await;

        hub.mailbox(crate::websocket::MailMessage::new(
            "alice",
            Message::new("task", json!("hello")),
        ))
        .await
        .unwrap();

        let text = peer.next_text().await.unwrap();
        assert_eq!(text, r#"{"data":"hello","topic":"task"}"#);
    }

    #[tokio::test]
    async fn test_wrong_token_stays_unauthenticated() {
        let hub = Hub::spawn(test_config(), Some(fake_tokenizer()));
        let (socket, peer) = fake_socket();
        tokio::spawn(serve(socket, hub.clone()));

        wait_until(&hub, |s| s.connections == 1).await;
        peer.send_text(r#"{"Username": "alice", "Token": "token-bob"}"#);
        // Round-trip through the control queue after the subscribe attempt
        peer.send_text(r#"{"Username": "bob", "Token": "token-bob"}"#);
        wait_until(&hub, |s| s.subscribers == 1).await;

        let stats = hub.stats().await.unwrap();
        assert_eq!(stats.connections, 1);
        assert_eq!(stats.authenticated, 1);
    }

    #[tokio::test]
    async fn test_peer_disconnect_unregisters_and_closes_once() {
        let hub = Hub::spawn(test_config(), Some(fake_tokenizer()));
        let (socket, mut peer) = fake_socket();
        let server = tokio::spawn(serve(socket, hub.clone()));

        wait_until(&hub, |s| s.connections == 1).await;
        peer.send_text(r#"{"Username": "alice", "Token": "token-alice"}"#);
        wait_until(&hub, |s| s.subscribers == 1).await;

        peer.inbound.send(Ok(WsMessage::Close(None))).unwrap();
        server.await.unwrap();

        let stats = hub.stats().await.unwrap();
        assert_eq!(stats.connections, 0);
        assert_eq!(stats.subscribers, 0);
        assert_eq!(peer.closes(), 1);

        // Final frame is the close frame
        let mut last = None;
        while let Ok(frame) = peer.outbound.try_recv() {
            last = Some(frame);
        }
        assert!(matches!(last, Some(WsMessage::Close(None))));
    }

    #[tokio::test]
    async fn test_read_and_write_errors_race_to_one_close() {
        let hub = Hub::spawn(test_config(), None);
        let (socket, peer) = fake_socket();
        let server = tokio::spawn(serve(socket, hub.clone()));

        wait_until(&hub, |s| s.connections == 1).await;
        peer.fail_writes.store(true, Ordering::SeqCst);
        hub.broadcast(Message::new("boom", json!(null))).await.unwrap();
        peer.inbound
            .send(Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")))
            .unwrap();

        server.await.unwrap();
        wait_until(&hub, |s| s.connections == 0).await;
        assert_eq!(peer.closes(), 1);
    }

    #[tokio::test]
    async fn test_oversized_frame_is_fatal() {
        let config = HubConfig {
            max_message_size: 32,
            ..test_config()
        };
        let hub = Hub::spawn(config, Some(fake_tokenizer()));
        let (socket, peer) = fake_socket();
        let server = tokio::spawn(serve(socket, hub.clone()));

        wait_until(&hub, |s| s.connections == 1).await;
        peer.send_text(&"x".repeat(64));

        server.await.unwrap();
        assert_eq!(hub.stats().await.unwrap().connections, 0);
        assert_eq!(peer.closes(), 1);
    }

    #[tokio::test]
    async fn test_idle_peer_times_out_after_pings() {
        let config = HubConfig {
            read_timeout_ms: 200,
            ping_interval_ms: 50,
            ..test_config()
        };
        let hub = Hub::spawn(config, None);
        let (socket, mut peer) = fake_socket();
        let server = tokio::spawn(serve(socket, hub.clone()));

        server.await.unwrap();
        wait_for_closes(&peer, 1).await;
        assert_eq!(peer.closes(), 1);
        assert_eq!(hub.stats().await.unwrap().connections, 0);

        let mut pings = 0;
        while let Ok(frame) = peer.outbound.try_recv() {
            if matches!(frame, WsMessage::Ping(_)) {
                pings += 1;
            }
        }
        assert!(pings >= 1);
    }

    #[tokio::test]
    async fn test_pongs_keep_connection_alive() {
        let config = HubConfig {
            read_timeout_ms: 150,
            ping_interval_ms: 50,
            ..test_config()
        };
        let hub = Hub::spawn(config, None);
        let (socket, mut peer) = fake_socket();
        tokio::spawn(serve(socket, hub.clone()));

        wait_until(&hub, |s| s.connections == 1).await;
        // Answer every ping for well past the read deadline
        let deadline = Instant::now() + Duration::from_millis(600);
        while Instant::now() < deadline {
            if let Ok(Some(WsMessage::Ping(_))) =
                time::timeout(Duration::from_millis(100), peer.outbound.recv()).await
            {
                peer.inbound.send(Ok(WsMessage::Pong(Vec::new()))).unwrap();
            }
        }

        assert_eq!(hub.stats().await.unwrap().connections, 1);
        assert_eq!(peer.closes(), 0);
    }

    #[tokio::test]
    async fn test_zero_ping_interval_still_delivers() {
        let config = HubConfig {
            ping_interval_ms: 0,
            ..test_config()
        };
        let hub = Hub::spawn(config, None);
        let (socket, mut peer) = fake_socket();
        let server = tokio::spawn(serve(socket, hub.clone()));

        wait_until(&hub, |s| s.connections == 1).await;
        hub.broadcast(Message::new("tick", json!(1))).await.unwrap();

        let text = peer.next_text().await.unwrap();
        assert_eq!(text, r#"{"data":1,"topic":"tick"}"#);

        peer.inbound.send(Ok(WsMessage::Close(None))).unwrap();
        server.await.unwrap();
        assert_eq!(hub.stats().await.unwrap().connections, 0);
        assert_eq!(peer.closes(), 1);
    }
}
