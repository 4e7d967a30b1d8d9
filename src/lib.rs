//! Bidirectional event-messaging server over WebSocket.
//!
//! Implements the Engine.IO v3/v4 + Socket.IO wire format on the server
//! side: open handshake, liveness pings, namespaced CONNECT/DISCONNECT,
//! EVENT dispatch, and request/reply ACKs. Application code registers named
//! event handlers, emits to single peers, broadcasts to rooms, and awaits
//! acknowledgements.
//!
//! ```no_run
//! use std::net::SocketAddr;
//! use serde_json::json;
//! use wavelink::{event, Server, Transport};
//!
//! #[tokio::main]
//! async fn main() {
//!     let server = Server::new(Transport::v4());
//!     server.on(event::CONNECTION, |channel, _| async move {
//!         tracing::info!(sid = %channel.id(), "connected");
//!         Ok(None)
//!     });
//!     server.on("msg", |channel, args| async move {
//!         channel.broadcast_to("lobby", "msg", args)?;
//!         Ok(Some(json!(["ok"])))
//!     });
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:4100").await.unwrap();
//!     axum::serve(
//!         listener,
//!         server.router().into_make_service_with_connect_info::<SocketAddr>(),
//!     )
//!     .await
//!     .unwrap();
//! }
//! ```

pub mod ack;
pub mod channel;
pub mod config;
pub mod error;
pub mod handler;
pub mod liveness;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod transport;

pub use channel::{Channel, RequestInfo};
pub use config::Config;
pub use error::{Error, Result};
pub use handler::{event, HandlerResult};
pub use protocol::{Message, MessageKind, ProtocolVersion};
pub use server::Server;
pub use transport::Transport;
