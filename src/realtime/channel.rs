//! Topic Channels
//!
//! Single responsibility: Join a topic, push events on it, and hand replies
//! back to whoever is waiting for them.
//!
//! Replies are correlated by ref only. Each waiting caller parks on a
//! `oneshot` receiver registered under its ref; the socket's read task fires
//! the sender and removes the entry. A reply whose ref has no entry (late,
//! duplicated, or for a heartbeat) is dropped.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, trace, warn};

use super::codec::{
    self, Message, MessageKind, Payload, PHX_CLOSE, PHX_ERROR, PHX_JOIN, PHX_LEAVE,
};
use super::socket::{Frame, SocketShared};
use crate::types::{CourierError, Result};

const EVENT_BUFFER: usize = 64;

/// Lifecycle of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Closed,
    Joining,
    Joined,
    Leaving,
    Errored,
}

/// A server reply, normalized across both wire encodings.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub status: String,
    pub response: Value,
}

impl Reply {
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }

    /// Turn an error reply into [`CourierError::PushRejected`].
    pub fn into_result(self, event: &str) -> Result<Value> {
        if self.is_ok() {
            Ok(self.response)
        } else {
            Err(CourierError::PushRejected {
                event: event.to_string(),
                reason: reason_of(&self.response),
            })
        }
    }
}

/// Best human-readable reason from an error response.
fn reason_of(response: &Value) -> String {
    match response {
        Value::String(s) => s.clone(),
        Value::Object(map) => map
            .get("reason")
            .or_else(|| map.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| response.to_string()),
        Value::Null => "no reason given".to_string(),
        other => other.to_string(),
    }
}

/// A topic-scoped handle on a [`Socket`](super::Socket).
pub struct Channel {
    topic: String,
    socket: Weak<SocketShared>,
    join_ref: AtomicU64,
    state: Mutex<ChannelState>,
    pending: DashMap<u64, oneshot::Sender<Reply>>,
    events: broadcast::Sender<Message>,
}

impl Channel {
    pub(crate) fn new(topic: &str, socket: Weak<SocketShared>) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            topic: topic.to_string(),
            socket,
            join_ref: AtomicU64::new(0),
            state: Mutex::new(ChannelState::Closed),
            pending: DashMap::new(),
            events,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// The ref assigned by the most recent join, if any.
    pub fn join_ref(&self) -> Option<u64> {
        match self.join_ref.load(Ordering::SeqCst) {
            0 => None,
            r => Some(r),
        }
    }

    pub fn state(&self) -> ChannelState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Number of callers waiting on a reply.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Subscribe to server-pushed events on this topic.
    pub fn events(&self) -> broadcast::Receiver<Message> {
        self.events.subscribe()
    }

    /// Join the topic with empty params.
    pub async fn join(&self, timeout: Duration) -> Result<()> {
        self.join_with(Value::Object(Default::default()), timeout)
            .await
            .map(|_| ())
    }

    /// Join the topic, returning the server's join response.
    pub async fn join_with(&self, params: Value, timeout: Duration) -> Result<Value> {
        let socket = self.socket()?;
        let join_ref = socket.next_ref();
        self.join_ref.store(join_ref, Ordering::SeqCst);
        self.set_state(ChannelState::Joining);

        debug!(topic = %self.topic, join_ref, "Joining channel");

        let frame = Frame::Text(codec::encode_text(
            Some(join_ref),
            join_ref,
            &self.topic,
            PHX_JOIN,
            Some(&params),
        ));
        let reply = match self.request(&socket, join_ref, frame, "join", timeout).await {
            Ok(reply) => reply,
            Err(e) => {
                self.set_state(ChannelState::Errored);
                return Err(e);
            }
        };

        if reply.is_ok() {
            self.set_state(ChannelState::Joined);
            info!(topic = %self.topic, join_ref, "Joined channel");
            Ok(reply.response)
        } else {
            self.set_state(ChannelState::Errored);
            let reason = reason_of(&reply.response);
            warn!(topic = %self.topic, reason = %reason, "Join rejected");
            Err(CourierError::JoinRejected(reason))
        }
    }

    /// Push a JSON event without waiting for a reply. Returns its ref.
    pub async fn push(&self, event: &str, payload: &Value) -> Result<u64> {
        let socket = self.socket()?;
        let reference = socket.next_ref();
        socket.send(self.text_frame(reference, event, payload)).await?;
        Ok(reference)
    }

    /// Push raw bytes as a binary frame without waiting for a reply.
    pub async fn push_binary(&self, event: &str, payload: &[u8]) -> Result<u64> {
        let socket = self.socket()?;
        let reference = socket.next_ref();
        socket.send(self.binary_frame(reference, event, payload)?).await?;
        Ok(reference)
    }

    /// Push a file (metadata + content framing) without waiting for a reply.
    pub async fn push_binary_file(
        &self,
        event: &str,
        metadata: &BTreeMap<String, String>,
        content: &[u8],
    ) -> Result<u64> {
        let framed = codec::encode_binary_file(metadata, content)?;
        self.push_binary(event, &framed).await
    }

    /// Push a JSON event and wait for its reply.
    ///
    /// An `"error"` reply becomes [`CourierError::PushRejected`].
    pub async fn call(&self, event: &str, payload: &Value, timeout: Duration) -> Result<Value> {
        let socket = self.socket()?;
        let reference = socket.next_ref();
        let frame = self.text_frame(reference, event, payload);
        self.request(&socket, reference, frame, event, timeout)
            .await?
            .into_result(event)
    }

    /// Push a file and wait for its reply.
    pub async fn call_binary_file(
        &self,
        event: &str,
        metadata: &BTreeMap<String, String>,
        content: &[u8],
        timeout: Duration,
    ) -> Result<Value> {
        let framed = codec::encode_binary_file(metadata, content)?;
        let socket = self.socket()?;
        let reference = socket.next_ref();
        let frame = self.binary_frame(reference, event, &framed)?;
        self.request(&socket, reference, frame, event, timeout)
            .await?
            .into_result(event)
    }

    /// Leave the topic. Does not wait for the server to acknowledge.
    pub async fn leave(&self) -> Result<()> {
        let socket = self.socket()?;
        self.set_state(ChannelState::Leaving);

        let reference = socket.next_ref();
        let frame = Frame::Text(codec::encode_text(
            self.join_ref(),
            reference,
            &self.topic,
            PHX_LEAVE,
            None,
        ));
        let sent = socket.send(frame).await;

        socket
            .channels
            .remove_if(&self.topic, |_, registered| std::ptr::eq(Arc::as_ptr(registered), self));
        self.set_state(ChannelState::Closed);

        debug!(topic = %self.topic, "Left channel");
        sent
    }

    /// Route one inbound message. Called from the socket's read task.
    pub(crate) fn handle_message(&self, msg: Message) {
        if let (Some(status), Some(reference)) = (msg.status.as_ref(), msg.reference) {
            match self.pending.remove(&reference) {
                Some((_, tx)) => {
                    let response = match msg.payload {
                        Payload::Json(value) => value,
                        Payload::Binary(_) => Value::Null,
                    };
                    let _ = tx.send(Reply {
                        status: status.clone(),
                        response,
                    });
                }
                None => trace!(topic = %self.topic, reference, "Dropping reply with no pending request"),
            }
            return;
        }

        let stale = matches!((msg.join_ref, self.join_ref()), (Some(theirs), Some(ours)) if theirs != ours);

        if !stale && msg.event == PHX_ERROR {
            warn!(topic = %self.topic, "Channel errored on server");
            self.set_state(ChannelState::Errored);
            return;
        }
        if !stale && msg.event == PHX_CLOSE {
            info!(topic = %self.topic, "Channel closed by server");
            self.set_state(ChannelState::Closed);
            return;
        }

        // No subscribers is fine; the event is simply dropped
        let _ = self.events.send(msg);
    }

    /// Drop every pending sender so waiters observe a closed socket.
    pub(crate) fn fail_pending(&self) {
        self.pending.clear();
        self.set_state(ChannelState::Closed);
    }

    async fn request(
        &self,
        socket: &SocketShared,
        reference: u64,
        frame: Frame,
        what: &str,
        timeout: Duration,
    ) -> Result<Reply> {
        // Register before sending so a fast reply cannot be missed
        let (tx, rx) = oneshot::channel();
        self.pending.insert(reference, tx);

        if let Err(e) = socket.send(frame).await {
            self.pending.remove(&reference);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(CourierError::SocketClosed),
            Err(_) => {
                self.pending.remove(&reference);
                Err(CourierError::Timeout(format!(
                    "{} on {} after {:?}",
                    what, self.topic, timeout
                )))
            }
        }
    }

    fn socket(&self) -> Result<Arc<SocketShared>> {
        let socket = self.socket.upgrade().ok_or(CourierError::SocketClosed)?;
        if socket.is_closed() {
            return Err(CourierError::SocketClosed);
        }
        Ok(socket)
    }

    fn text_frame(&self, reference: u64, event: &str, payload: &Value) -> Frame {
        Frame::Text(codec::encode_text(
            self.join_ref(),
            reference,
            &self.topic,
            event,
            Some(payload),
        ))
    }

    fn binary_frame(&self, reference: u64, event: &str, payload: &[u8]) -> Result<Frame> {
        codec::encode_binary(
            MessageKind::Push,
            self.join_ref(),
            reference,
            &self.topic,
            event,
            payload,
        )
        .map(Frame::Binary)
    }

    fn set_state(&self, state: ChannelState) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = state;
    }
}
