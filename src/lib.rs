//! Courier - authenticated deployments over a Phoenix channel
//!
//! Courier keeps one WebSocket open to a deployment service, speaks the
//! Phoenix channel protocol (serializer `2.0.0`) over it, and uses it to
//! negotiate and upload an application version.
//!
//! ## Architecture
//!
//! ```text
//! Deployer ──token──> Authenticator ──HTTPS──> /auth/login, /.well-known/jwks.json
//!     │
//!     └──> Socket ──wss──> /socket/websocket
//!            └── Channel "deploy:<app_id>"
//!                  manifest → upload* → deploy → install
//! ```
//!
//! - `realtime`: codec, socket tasks, channels and reply correlation
//! - `auth`: API key exchange, EdDSA verification, token cache
//! - `deploy`: the deployment sequence on top of both

pub mod auth;
pub mod config;
pub mod deploy;
pub mod realtime;
pub mod types;

pub use auth::{Authenticator, TokenProvider};
pub use config::Args;
pub use deploy::{DeployOptions, DeployRequest, DeployResult, Deployer};
pub use realtime::{Channel, Socket, SocketConfig};
pub use types::{CourierError, Result};
