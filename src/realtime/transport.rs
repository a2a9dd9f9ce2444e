//! WebSocket Transport Layer
//!
//! Single responsibility: Build the socket URL and perform the WebSocket
//! handshake. No knowledge of channels, refs or replies.

use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::StreamExt;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{client::IntoClientRequest, protocol::Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::debug;
use url::Url;

use crate::types::{CourierError, Result};

/// Serializer version negotiated in the query string.
pub const PROTOCOL_VSN: &str = "2.0.0";

const SOCKET_PATH: &str = "/socket/websocket";

/// Type alias for the WebSocket send half
pub type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>, Message>;

/// Type alias for the WebSocket receive half
pub type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Derive the socket URL from a service endpoint.
///
/// `https` becomes `wss` and `http` becomes `ws`; a bare host is treated as
/// `wss`. The socket path is appended unless already present, followed by
/// the `vsn` and `token` query parameters.
pub fn socket_url(endpoint: &str, token: &str) -> Result<Url> {
    let endpoint = endpoint.trim();
    let with_scheme = if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("wss://{}", endpoint)
    };

    let mut url = Url::parse(&with_scheme)
        .map_err(|e| CourierError::Config(format!("invalid endpoint {:?}: {}", endpoint, e)))?;

    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(CourierError::Config(format!(
                "unsupported endpoint scheme {:?}",
                other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| CourierError::Config(format!("cannot use scheme {} for {}", scheme, endpoint)))?;

    if !url.path().ends_with(SOCKET_PATH) {
        let path = format!("{}{}", url.path().trim_end_matches('/'), SOCKET_PATH);
        url.set_path(&path);
    }

    url.query_pairs_mut()
        .append_pair("vsn", PROTOCOL_VSN)
        .append_pair("token", token);

    Ok(url)
}

/// Connect to a WebSocket endpoint within `handshake_timeout`.
///
/// A handshake answered with 401/403 maps to [`CourierError::Unauthorized`];
/// anything else that fails is a [`CourierError::Connect`].
pub async fn connect(url: &Url, handshake_timeout: Duration) -> Result<(WsSink, WsStream)> {
    debug!(host = url.host_str().unwrap_or_default(), "Connecting to WebSocket");

    let request = url
        .as_str()
        .into_client_request()
        .map_err(|e| CourierError::Connect(format!("Failed to build request: {}", e)))?;

    let (ws, response) =
        tokio::time::timeout(handshake_timeout, connect_async_with_config(request, None, false))
            .await
            .map_err(|_| {
                CourierError::Timeout(format!("WebSocket handshake after {:?}", handshake_timeout))
            })??;

    debug!(status = %response.status(), "WebSocket connected");
    Ok(ws.split())
}

/// Strip the token from a URL before it is logged.
pub fn redacted(url: &Url) -> String {
    let mut safe = url.clone();
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            let v = if k == "token" { "***".to_string() } else { v.into_owned() };
            (k.into_owned(), v)
        })
        .collect();
    safe.query_pairs_mut().clear().extend_pairs(pairs);
    safe.to_string()
}
