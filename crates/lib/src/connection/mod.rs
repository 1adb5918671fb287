//! Persistent subscription connection: the connector seam, the lifecycle manager
//! with its watchdog, and the default WebSocket connector.
//!
//! The manager owns the single live connection. A `Connector` opens it and hands
//! every inbound envelope to the `EventSink` it was given; the sink stamps liveness
//! and forwards to the router.

mod manager;
mod websocket;

pub use manager::{
    ConnectionManager, ConnectionState, EventSink, HealthSnapshot, RestartTrigger,
    WatchdogAction, WatchdogSettings,
};
pub use websocket::WebSocketConnector;

use async_trait::async_trait;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("platform credentials not configured (appId / appSecret)")]
    MissingCredentials,
    #[error("endpoint discovery failed: {0}")]
    Endpoint(String),
    #[error("endpoint request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("connect did not finish within {0:?}")]
    ConnectTimeout(Duration),
    #[error("stop did not finish within {0:?}")]
    StopTimeout(Duration),
    #[error("{0}")]
    Other(String),
}

/// Opens the platform subscription.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection delivering inbound envelopes to `sink`. The connection keeps
    /// delivering until closed or dropped by the platform.
    async fn connect(&self, sink: EventSink) -> Result<Box<dyn Connection>, ConnectionError>;
}

/// A live subscription.
#[async_trait]
pub trait Connection: Send + Sync {
    /// False once the underlying transport has ended.
    fn is_alive(&self) -> bool;

    /// Graceful close. The manager bounds how long it waits.
    async fn close(self: Box<Self>) -> Result<(), ConnectionError>;
}
