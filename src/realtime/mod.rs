//! Real-time Channel Protocol
//!
//! Client for the Phoenix channel protocol (serializer `2.0.0`) over a
//! single WebSocket.
//!
//! | Module      | Responsibility                                       |
//! |-------------|------------------------------------------------------|
//! | `codec`     | Text and binary wire formats, file framing           |
//! | `transport` | URL derivation and WebSocket handshake               |
//! | `socket`    | Connection lifecycle, read/write/heartbeat tasks     |
//! | `channel`   | Join/leave/push on a topic, reply correlation        |
//!
//! # Usage
//!
//! ```ignore
//! use courier::realtime::{Socket, SocketConfig};
//!
//! let socket = Socket::connect("https://api.example.com", &token, SocketConfig::default()).await?;
//! let channel = socket.channel("deploy:my-app");
//! channel.join(Duration::from_secs(10)).await?;
//! let reply = channel.call("manifest", &payload, Duration::from_secs(30)).await?;
//! channel.leave().await?;
//! socket.disconnect().await;
//! ```

pub mod codec;
pub mod transport;

mod channel;
mod socket;

pub use channel::{Channel, ChannelState, Reply};
pub use codec::{Message, MessageKind, Payload};
pub use socket::{Frame, Socket, SocketConfig};
