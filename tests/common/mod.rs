//! Shared fixtures: a scriptable Phoenix channel server and token signing.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ed25519_dalek::{Signer, SigningKey};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use courier::auth::{ed25519_jwk, KeySet};
use courier::realtime::codec::{self, PHX_REPLY};
use courier::realtime::{Message, MessageKind};

/// How the server answers one inbound message.
#[derive(Debug, Clone)]
pub struct MockReply {
    pub status: String,
    pub response: Value,
    pub delay: Duration,
}

impl MockReply {
    pub fn ok(response: Value) -> Self {
        Self {
            status: "ok".into(),
            response,
            delay: Duration::ZERO,
        }
    }

    pub fn error(reason: &str) -> Self {
        Self {
            status: "error".into(),
            response: json!({ "reason": reason }),
            delay: Duration::ZERO,
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

type Handler = Arc<dyn Fn(&Message) -> Option<MockReply> + Send + Sync>;

/// What the server does with an accepted connection.
#[derive(Debug, Clone, Copy)]
enum Mode {
    Serve,
    Reject(StatusCode),
    /// Complete the handshake, then never read.
    Stall,
}

/// A Phoenix channel server on a random local port.
///
/// Every decoded inbound message is recorded. Replies use the same encoding
/// as the request: text for text pushes, binary for binary pushes.
pub struct MockServer {
    pub addr: SocketAddr,
    received: Arc<Mutex<Vec<Message>>>,
    queries: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl MockServer {
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(&Message) -> Option<MockReply> + Send + Sync + 'static,
    {
        Self::spawn(Arc::new(handler), Mode::Serve).await
    }

    /// A server that refuses every handshake with `status`.
    pub async fn rejecting(status: StatusCode) -> Self {
        Self::spawn(no_replies(), Mode::Reject(status)).await
    }

    /// A server that accepts the connection and then stops reading, so the
    /// client's writes eventually block.
    pub async fn stalled() -> Self {
        Self::spawn(no_replies(), Mode::Stall).await
    }

    async fn spawn(handler: Handler, mode: Mode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let queries = Arc::new(Mutex::new(Vec::new()));

        let task = {
            let received = Arc::clone(&received);
            let queries = Arc::clone(&queries);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let handler = Arc::clone(&handler);
                    let received = Arc::clone(&received);
                    let queries = Arc::clone(&queries);
                    tokio::spawn(async move {
                        let callback = |req: &Request, resp: Response| {
                            queries
                                .lock()
                                .unwrap()
                                .push(req.uri().query().unwrap_or_default().to_string());
                            match mode {
                                Mode::Reject(status) => {
                                    let mut err = ErrorResponse::new(Some("rejected".into()));
                                    *err.status_mut() = status;
                                    Err(err)
                                }
                                Mode::Serve | Mode::Stall => Ok(resp),
                            }
                        };
                        let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
                            return;
                        };
                        match mode {
                            Mode::Stall => {
                                let _held = ws;
                                std::future::pending::<()>().await;
                            }
                            _ => serve(ws, handler, received).await,
                        }
                    });
                }
            })
        };

        Self {
            addr,
            received,
            queries,
            task,
        }
    }

    /// Endpoint to hand to `Socket::connect`.
    pub fn endpoint(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn received(&self) -> Vec<Message> {
        self.received.lock().unwrap().clone()
    }

    pub fn received_events(&self, event: &str) -> Vec<Message> {
        self.received()
            .into_iter()
            .filter(|m| m.event == event)
            .collect()
    }

    /// Query strings of every handshake seen.
    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }

    /// Wait until a message with `event` has been recorded.
    pub async fn wait_for(&self, event: &str) -> Message {
        for _ in 0..200 {
            if let Some(msg) = self.received_events(event).into_iter().next() {
                return msg;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("server never received {:?}", event);
    }
}

fn no_replies() -> Handler {
    Arc::new(|_: &Message| -> Option<MockReply> { None })
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve<S>(
    ws: tokio_tungstenite::WebSocketStream<S>,
    handler: Handler,
    received: Arc<Mutex<Vec<Message>>>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = ws.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WsMessage>();

    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if sink.send(frame).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(frame)) = stream.next().await {
        let (decoded, binary) = match frame {
            WsMessage::Text(text) => (codec::decode_text(text.as_bytes()), false),
            WsMessage::Binary(data) => (codec::decode_binary(&data), true),
            WsMessage::Close(_) => break,
            _ => continue,
        };
        let Ok(msg) = decoded else { continue };
        received.lock().unwrap().push(msg.clone());

        let Some(reply) = handler(&msg) else { continue };
        let frame = reply_frame(&msg, &reply, binary);
        let out_tx = out_tx.clone();
        if reply.delay.is_zero() {
            let _ = out_tx.send(frame);
        } else {
            tokio::spawn(async move {
                tokio::time::sleep(reply.delay).await;
                let _ = out_tx.send(frame);
            });
        }
    }

    drop(out_tx);
    let _ = writer.await;
}

fn reply_frame(msg: &Message, reply: &MockReply, binary: bool) -> WsMessage {
    if binary {
        let payload = codec::encode_reply_payload(&reply.status, &reply.response).unwrap();
        let data = codec::encode_binary(
            MessageKind::Reply,
            msg.join_ref,
            msg.reference.unwrap_or_default(),
            &msg.topic,
            PHX_REPLY,
            &payload,
        )
        .unwrap();
        WsMessage::Binary(data)
    } else {
        WsMessage::Text(
            json!([
                msg.join_ref.map(|r| r.to_string()),
                msg.reference.map(|r| r.to_string()),
                msg.topic,
                PHX_REPLY,
                { "status": reply.status, "response": reply.response }
            ])
            .to_string(),
        )
    }
}

/// A canned HTTP response for one path. `None` never answers.
#[derive(Debug, Clone)]
pub struct HttpRoute {
    pub path: &'static str,
    pub response: Option<(u16, String)>,
}

impl HttpRoute {
    pub fn json(path: &'static str, status: u16, body: Value) -> Self {
        Self {
            path,
            response: Some((status, body.to_string())),
        }
    }

    pub fn raw(path: &'static str, status: u16, body: &str) -> Self {
        Self {
            path,
            response: Some((status, body.to_string())),
        }
    }

    pub fn silent(path: &'static str) -> Self {
        Self {
            path,
            response: None,
        }
    }
}

/// One request as the stub saw it.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub body: String,
}

/// A minimal HTTP/1.1 server answering from a fixed route table.
/// Unknown paths get 404.
pub struct HttpStub {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<HttpRequest>>>,
    task: JoinHandle<()>,
}

impl HttpStub {
    pub async fn start(routes: Vec<HttpRoute>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let routes = Arc::new(routes);

        let task = {
            let requests = Arc::clone(&requests);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let routes = Arc::clone(&routes);
                    let requests = Arc::clone(&requests);
                    tokio::spawn(answer(stream, routes, requests));
                }
            })
        };

        Self {
            addr,
            requests,
            task,
        }
    }

    pub fn endpoint(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Drop for HttpStub {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn answer(
    mut stream: TcpStream,
    routes: Arc<Vec<HttpRoute>>,
    requests: Arc<Mutex<Vec<HttpRequest>>>,
) {
    let Some(request) = read_request(&mut stream).await else {
        return;
    };
    let route = routes.iter().find(|r| r.path == request.path).cloned();
    requests.lock().unwrap().push(request);

    let (status, body) = match route {
        Some(HttpRoute { response: Some(response), .. }) => response,
        Some(HttpRoute { response: None, .. }) => {
            std::future::pending::<()>().await;
            return;
        }
        None => (404, "not found".to_string()),
    };

    let head = format!(
        "HTTP/1.1 {} Stub\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status,
        body.len()
    );
    let _ = stream.write_all(head.as_bytes()).await;
    let _ = stream.write_all(body.as_bytes()).await;
    let _ = stream.shutdown().await;
}

async fn read_request(stream: &mut TcpStream) -> Option<HttpRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.lines();
    let mut request_line = lines.next()?.split_whitespace();
    let method = request_line.next()?.to_string();
    let path = request_line.next()?.to_string();
    let content_length = lines
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);

    while buf.len() < header_end + content_length {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let body = String::from_utf8_lossy(&buf[header_end..]).to_string();

    Some(HttpRequest { method, path, body })
}

/// Answers joins with ok and nothing else.
pub fn join_only(msg: &Message) -> Option<MockReply> {
    (msg.event == codec::PHX_JOIN).then(|| MockReply::ok(json!({})))
}

pub const TEST_KID: &str = "test-key";

pub fn signing_key() -> SigningKey {
    SigningKey::from_bytes(&[7u8; 32])
}

pub fn key_set(key: &SigningKey) -> KeySet {
    KeySet {
        keys: vec![ed25519_jwk(TEST_KID, &key.verifying_key())],
    }
}

/// An EdDSA token with `claims`, signed by `key` under [`TEST_KID`].
pub fn sign_token(key: &SigningKey, claims: &Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(json!({"alg": "EdDSA", "typ": "JWT", "kid": TEST_KID}).to_string());
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    let signature = key.sign(format!("{}.{}", header, payload).as_bytes());
    format!(
        "{}.{}.{}",
        header,
        payload,
        URL_SAFE_NO_PAD.encode(signature.to_bytes())
    )
}
