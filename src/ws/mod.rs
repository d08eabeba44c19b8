//! WebSocket session component.
//!
//! Speaks the WAMP basic profile with the JSON serializer over
//! `tokio-tungstenite`, which is all the command line client needs.
//!
//! # Architecture
//!
//! - [`WebSocketComponent`]: connection loop with backoff reconnection and heartbeat
//! - [`WsSession`]: the joined session, routing replies and events by id
//! - [`message`]: the message codec
//!
//! # Example
//!
//! ```ignore
//! let config = ConnectionConfig::for_url("realm1", "ws://localhost:8080/ws")?;
//! let connection = ConnectionManager::<WebSocketComponent>::new(config, Config::default())?;
//! let session = connection.session().await?;
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod message;
pub mod session;

pub use config::Config;
pub use connection::WebSocketComponent;
#[expect(
    clippy::module_name_repetitions,
    reason = "WsError includes module name for clarity when used outside this module"
)]
pub use error::WsError;
pub use session::{WsSession, WsSubscription};
