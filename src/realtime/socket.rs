//! Channel Socket
//!
//! Single responsibility: Own one WebSocket connection and the three tasks
//! that keep it running.
//!
//! | Task      | Responsibility                                          |
//! |-----------|---------------------------------------------------------|
//! | read      | Decode inbound frames, route them to channels by topic  |
//! | write     | Drain the bounded outbound queue into the sink          |
//! | heartbeat | Push `phoenix`/`heartbeat` on a fixed interval          |
//!
//! All three stop when the shared shutdown signal fires. The signal is
//! permanent: once a socket is closed every send fails with
//! [`CourierError::SocketClosed`] and every pending reply wait resolves with
//! the same error.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tracing::{debug, info, trace, warn};

use super::channel::Channel;
use super::codec::{self, Message, HEARTBEAT_EVENT, HEARTBEAT_TOPIC};
use super::transport::{self, WsSink, WsStream};
use crate::types::{CourierError, Result};

/// Socket tuning knobs.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Bound on the WebSocket handshake
    pub handshake_timeout: Duration,
    /// Interval between heartbeats
    pub heartbeat_interval: Duration,
    /// Capacity of the outbound queue
    pub queue_capacity: usize,
    /// How long `send` waits for room in a full queue
    pub send_wait: Duration,
    /// How long `disconnect` waits for the tasks before aborting them
    pub close_timeout: Duration,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            queue_capacity: 1000,
            send_wait: Duration::from_millis(100),
            close_timeout: Duration::from_secs(2),
        }
    }
}

/// An outbound frame waiting in the send queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl From<Frame> for WsMessage {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => WsMessage::Text(text),
            Frame::Binary(data) => WsMessage::Binary(data),
        }
    }
}

/// State shared between the socket handle, its channels and its tasks.
pub(crate) struct SocketShared {
    next_ref: AtomicU64,
    pub(crate) channels: DashMap<String, Arc<Channel>>,
    outbound: mpsc::Sender<Frame>,
    closed: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    send_wait: Duration,
}

impl SocketShared {
    pub(crate) fn next_ref(&self) -> u64 {
        self.next_ref.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) async fn send(&self, frame: Frame) -> Result<()> {
        if self.is_closed() {
            return Err(CourierError::SocketClosed);
        }

        match self.outbound.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(CourierError::SocketClosed),
            Err(mpsc::error::TrySendError::Full(frame)) => {
                match tokio::time::timeout(self.send_wait, self.outbound.send(frame)).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(_)) => Err(CourierError::SocketClosed),
                    Err(_) => Err(CourierError::QueueFull),
                }
            }
        }
    }

    /// Mark the socket closed. Returns false if it already was.
    pub(crate) fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }

        let _ = self.shutdown_tx.send(());
        for channel in self.channels.iter() {
            channel.value().fail_pending();
        }
        true
    }

    fn dispatch(&self, decoded: Result<Message>) {
        let msg = match decoded {
            Ok(msg) => msg,
            Err(e) => {
                trace!(error = %e, "Dropping undecodable frame");
                return;
            }
        };

        let channel = self
            .channels
            .get(&msg.topic)
            .map(|entry| Arc::clone(entry.value()));

        match channel {
            Some(channel) => channel.handle_message(msg),
            None => trace!(topic = %msg.topic, event = %msg.event, "Dropping message for unknown topic"),
        }
    }
}

/// A connected channel socket.
///
/// Created by [`Socket::connect`]; the connection lives until
/// [`Socket::disconnect`] is called, the server goes away, or the handle is
/// dropped.
pub struct Socket {
    shared: Arc<SocketShared>,
    url: String,
    close_timeout: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Socket {
    /// Connect to `endpoint` authenticating with `token`.
    pub async fn connect(endpoint: &str, token: &str, config: SocketConfig) -> Result<Self> {
        let url = transport::socket_url(endpoint, token)?;
        let display_url = transport::redacted(&url);
        info!(url = %display_url, "Connecting socket");

        let (sink, stream) = transport::connect(&url, config.handshake_timeout).await?;

        info!(url = %display_url, "Socket connected");
        Ok(Self::start(sink, stream, display_url, config))
    }

    fn start(sink: WsSink, stream: WsStream, url: String, config: SocketConfig) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.queue_capacity);
        let (shutdown_tx, _) = broadcast::channel(1);

        let shared = Arc::new(SocketShared {
            next_ref: AtomicU64::new(1),
            channels: DashMap::new(),
            outbound: outbound_tx,
            closed: AtomicBool::new(false),
            shutdown_tx,
            send_wait: config.send_wait,
        });

        // Subscribe before spawning so no task can miss the shutdown signal
        let read_shutdown = shared.shutdown_tx.subscribe();
        let write_shutdown = shared.shutdown_tx.subscribe();
        let heartbeat_shutdown = shared.shutdown_tx.subscribe();

        let tasks = vec![
            tokio::spawn(read_loop(Arc::clone(&shared), stream, read_shutdown)),
            tokio::spawn(write_loop(Arc::clone(&shared), sink, outbound_rx, write_shutdown)),
            tokio::spawn(heartbeat_loop(
                Arc::clone(&shared),
                config.heartbeat_interval,
                heartbeat_shutdown,
            )),
        ];

        Self {
            shared,
            url,
            close_timeout: config.close_timeout,
            tasks: Mutex::new(tasks),
        }
    }

    /// Get the channel for `topic`, creating and registering it if needed.
    pub fn channel(&self, topic: &str) -> Arc<Channel> {
        self.shared
            .channels
            .entry(topic.to_string())
            .or_insert_with(|| Arc::new(Channel::new(topic, Arc::downgrade(&self.shared))))
            .value()
            .clone()
    }

    /// Allocate the next request reference.
    pub fn next_ref(&self) -> u64 {
        self.shared.next_ref()
    }

    /// Queue a frame for the write task.
    pub async fn send(&self, frame: Frame) -> Result<()> {
        self.shared.send(frame).await
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Number of channels currently registered.
    pub fn channel_count(&self) -> usize {
        self.shared.channels.len()
    }

    /// Connection URL with the token redacted.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Close the connection and stop all tasks.
    ///
    /// Safe to call repeatedly and concurrently; only the first call does
    /// any work.
    pub async fn disconnect(&self) {
        self.shared.close();

        let tasks = {
            let mut guard = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
            std::mem::take(&mut *guard)
        };
        if tasks.is_empty() {
            return;
        }

        for mut task in tasks {
            if tokio::time::timeout(self.close_timeout, &mut task).await.is_err() {
                warn!("Socket task did not stop in time, aborting");
                task.abort();
            }
        }

        self.shared.channels.clear();
        info!(url = %self.url, "Socket disconnected");
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        if self.shared.close() {
            debug!("Socket dropped without disconnect, shutting down tasks");
        }
    }
}

/// Read loop - decodes frames and routes them to channels.
async fn read_loop(
    shared: Arc<SocketShared>,
    mut stream: WsStream,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    debug!("Read loop started");

    loop {
        let msg = tokio::select! {
            _ = shutdown_rx.recv() => break,
            msg = stream.next() => msg,
        };

        match msg {
            Some(Ok(WsMessage::Text(text))) => shared.dispatch(codec::decode_text(text.as_bytes())),
            Some(Ok(WsMessage::Binary(data))) => shared.dispatch(codec::decode_binary(&data)),
            Some(Ok(WsMessage::Close(frame))) => {
                info!(frame = ?frame, "Server closed connection");
                break;
            }
            Some(Ok(_)) => {
                // Ping/pong is handled by tungstenite
            }
            Some(Err(e)) => {
                warn!(error = %e, "WebSocket read failed");
                break;
            }
            None => break,
        }
    }

    shared.close();
    debug!("Read loop ended");
}

/// Write loop - drains the outbound queue into the sink.
async fn write_loop(
    shared: Arc<SocketShared>,
    mut sink: WsSink,
    mut outbound_rx: mpsc::Receiver<Frame>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    debug!("Write loop started");

    let mut healthy = true;
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            frame = outbound_rx.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = sink.send(frame.into()).await {
                    warn!(error = %e, "WebSocket write failed");
                    healthy = false;
                    shared.close();
                    break;
                }
            }
        }
    }

    // Flush what was queued before shutdown, e.g. a final phx_leave
    if healthy {
        let mut flushed = 0usize;
        while let Ok(frame) = outbound_rx.try_recv() {
            if sink.send(frame.into()).await.is_err() {
                break;
            }
            flushed += 1;
        }
        if flushed > 0 {
            trace!(flushed, "Flushed queued frames on shutdown");
        }
    }

    let _ = sink.close().await;
    debug!("Write loop ended");
}

/// Heartbeat loop - keeps the server from timing the connection out.
async fn heartbeat_loop(
    shared: Arc<SocketShared>,
    interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = ticker.tick() => {
                let reference = shared.next_ref();
                let frame = Frame::Text(codec::encode_text(
                    None,
                    reference,
                    HEARTBEAT_TOPIC,
                    HEARTBEAT_EVENT,
                    None,
                ));
                match shared.send(frame).await {
                    Ok(()) => trace!(reference, "Heartbeat sent"),
                    Err(CourierError::SocketClosed) => break,
                    Err(e) => warn!(error = %e, "Heartbeat not sent"),
                }
            }
        }
    }
}
