//! Error types for Courier
//!
//! Variants are grouped by the layer that produces them so callers can
//! match on the kind instead of parsing messages.

use tokio_tungstenite::tungstenite;

/// Reasons a signed access token was not trusted.
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("Malformed token: {0}")]
    Malformed(String),

    #[error("Unsupported signing algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("No matching verification key for kid {0:?}")]
    KeyNotFound(String),

    #[error("Invalid verification key: {0}")]
    InvalidKey(String),

    #[error("Signature verification failed")]
    InvalidSignature,
}

/// Main error type for Courier operations
#[derive(Debug, thiserror::Error)]
pub enum CourierError {
    // Transport
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Connection rejected with HTTP {status}: check the API key")]
    Unauthorized { status: u16 },

    #[error("Socket closed")]
    SocketClosed,

    #[error("Send queue full")]
    QueueFull,

    #[error("Timeout: {0}")]
    Timeout(String),

    // Protocol
    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    // Channel
    #[error("Join rejected: {0}")]
    JoinRejected(String),

    #[error("Push '{event}' rejected: {reason}")]
    PushRejected { event: String, reason: String },

    // Upload
    #[error("Upload of {path} failed: {source}")]
    Upload {
        path: String,
        #[source]
        source: Box<CourierError>,
    },

    // Auth exchange
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Empty access token")]
    EmptyAccessToken,

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("HTTP error: {0}")]
    Http(String),

    // Auth verification
    #[error("Token verification failed: {0}")]
    Verification(#[from] VerifyError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CourierError {
    /// Whether this error came from a wait that ran out of time.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Whether this error means the server refused our credentials,
    /// either during the token exchange or the socket handshake.
    pub fn is_auth(&self) -> bool {
        match self {
            Self::Unauthorized { .. }
            | Self::AuthFailed(_)
            | Self::EmptyAccessToken
            | Self::Verification(_) => true,
            Self::Upload { source, .. } => source.is_auth(),
            _ => false,
        }
    }
}

// Implement From conversions for common error types

impl From<serde_json::Error> for CourierError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(format!("JSON error: {}", err))
    }
}

impl From<reqwest::Error> for CourierError {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(err.to_string())
    }
}

impl From<tungstenite::Error> for CourierError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Http(response)
                if response.status().as_u16() == 401 || response.status().as_u16() == 403 =>
            {
                Self::Unauthorized {
                    status: response.status().as_u16(),
                }
            }
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                Self::SocketClosed
            }
            other => Self::Connect(other.to_string()),
        }
    }
}

/// Result type alias for Courier operations
pub type Result<T> = std::result::Result<T, CourierError>;
