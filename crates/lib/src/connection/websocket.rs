//! WebSocket subscription: discover the endpoint over HTTP, then read JSON envelopes
//! from the socket and hand them to the event sink.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::{Connection, ConnectionError, Connector, EventSink};
use crate::config::{resolve_app_id, resolve_app_secret, Config};

const ENDPOINT_PATH: &str = "/callback/ws/endpoint";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;

#[derive(Debug, Deserialize)]
struct EndpointResponse {
    code: i64,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    data: Option<EndpointData>,
}

#[derive(Debug, Deserialize)]
struct EndpointData {
    #[serde(rename = "URL", default)]
    url: Option<String>,
}

pub struct WebSocketConnector {
    app_id: Option<String>,
    app_secret: Option<String>,
    api_base: String,
    client: reqwest::Client,
}

impl WebSocketConnector {
    pub fn new(app_id: Option<String>, app_secret: Option<String>, api_base: impl Into<String>) -> Self {
        Self {
            app_id,
            app_secret,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            resolve_app_id(config),
            resolve_app_secret(config),
            config.platform.api_base.clone(),
        )
        .with_request_timeout(Duration::from_secs(
            config.watchdog.connect_timeout_secs.max(1),
        ))
    }

    /// Bound each endpoint discovery request.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        match reqwest::Client::builder().timeout(timeout).build() {
            Ok(client) => self.client = client,
            Err(e) => log::warn!(
                "connection: discovery client without timeout ({}); relying on connect timeout",
                e
            ),
        }
        self
    }

    /// Ask the platform for a WebSocket URL.
    async fn endpoint_url(&self) -> Result<String, ConnectionError> {
        let (Some(app_id), Some(app_secret)) = (self.app_id.as_ref(), self.app_secret.as_ref())
        else {
            return Err(ConnectionError::MissingCredentials);
        };
        let url = format!("{}{}", self.api_base, ENDPOINT_PATH);
        let res = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "AppID": app_id, "AppSecret": app_secret }))
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(ConnectionError::Endpoint(format!("{} {}", status, body)));
        }
        let data: EndpointResponse = res.json().await?;
        if data.code != 0 {
            return Err(ConnectionError::Endpoint(format!(
                "code {}: {}",
                data.code,
                data.msg.unwrap_or_default()
            )));
        }
        data.data
            .and_then(|d| d.url)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| ConnectionError::Endpoint("response carried no URL".to_string()))
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, sink: EventSink) -> Result<Box<dyn Connection>, ConnectionError> {
        let url = self.endpoint_url().await?;
        let (stream, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
        log::info!("connection: websocket open");
        let (write, read) = stream.split();
        let writer = Arc::new(Mutex::new(write));
        let alive = Arc::new(AtomicBool::new(true));
        let reader = tokio::spawn(read_loop(read, writer.clone(), sink, alive.clone()));
        Ok(Box::new(WebSocketConnection {
            reader,
            writer,
            alive,
        }))
    }
}

struct WebSocketConnection {
    reader: JoinHandle<()>,
    writer: Arc<Mutex<WsWriter>>,
    alive: Arc<AtomicBool>,
}

#[async_trait]
impl Connection for WebSocketConnection {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.reader.is_finished()
    }

    async fn close(self: Box<Self>) -> Result<(), ConnectionError> {
        let was_alive = self.is_alive();
        // Abort first so an intentional close is not reported as a lost connection.
        self.reader.abort();
        self.alive.store(false, Ordering::SeqCst);
        let mut writer = self.writer.lock().await;
        match writer.close().await {
            Ok(()) => Ok(()),
            Err(e) if !was_alive => {
                log::debug!("connection: close on ended socket: {}", e);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

async fn read_loop(
    mut read: SplitStream<WsStream>,
    writer: Arc<Mutex<WsWriter>>,
    sink: EventSink,
    alive: Arc<AtomicBool>,
) {
    let reason = loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => handle_frame(&sink, text.as_bytes()),
            Some(Ok(Message::Binary(data))) => handle_frame(&sink, &data),
            Some(Ok(Message::Ping(data))) => {
                let mut w = writer.lock().await;
                if let Err(e) = w.send(Message::Pong(data)).await {
                    log::debug!("connection: pong failed: {}", e);
                }
            }
            Some(Ok(Message::Close(frame))) => {
                break match frame {
                    Some(f) => format!("closed by server ({} {})", f.code, f.reason),
                    None => "closed by server".to_string(),
                };
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => break format!("read error: {}", e),
            None => break "stream ended".to_string(),
        }
    };
    alive.store(false, Ordering::SeqCst);
    sink.connection_lost(&reason);
}

fn handle_frame(sink: &EventSink, bytes: &[u8]) {
    match serde_json::from_slice::<Value>(bytes) {
        Ok(envelope) => {
            sink.deliver(&envelope);
        }
        Err(e) => sink.undecodable_frame(&e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::connection::{ConnectionManager, ConnectionState, WatchdogSettings};
    use crate::ingest::{AdmissionPolicy, DedupCache, DedupSettings};
    use crate::routing::{EventRouter, HandlerRegistry, MessageClassifier, ParticipationStore};
    use axum::extract::ws::{Message as AxumMessage, WebSocketUpgrade};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use std::time::Duration;

    fn manager_with(connector: WebSocketConnector) -> Arc<ConnectionManager> {
        let clock = Arc::new(SystemClock);
        let dedup = Arc::new(DedupCache::new(DedupSettings::default(), clock.clone()));
        let classifier =
            MessageClassifier::new(None, Vec::new(), Arc::new(ParticipationStore::new(8)));
        let router = Arc::new(EventRouter::new(
            clock.clone(),
            AdmissionPolicy::default(),
            dedup,
            classifier,
            HandlerRegistry::new(),
        ));
        Arc::new(ConnectionManager::new(
            Arc::new(connector),
            router,
            clock,
            WatchdogSettings::default(),
        ))
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn missing_credentials_fail_without_network() {
        let connector = WebSocketConnector::new(Some("cli_a".into()), None, "http://127.0.0.1:1");
        assert!(matches!(
            connector.endpoint_url().await,
            Err(ConnectionError::MissingCredentials)
        ));
    }

    #[tokio::test]
    async fn endpoint_error_code_is_reported() {
        let app = Router::new().route(
            ENDPOINT_PATH,
            post(|| async { Json(serde_json::json!({ "code": 1000040345, "msg": "bad app" })) }),
        );
        let base = serve(app).await;
        let connector = WebSocketConnector::new(Some("a".into()), Some("s".into()), base);
        match connector.endpoint_url().await {
            Err(ConnectionError::Endpoint(msg)) => assert!(msg.contains("bad app")),
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn silent_endpoint_times_out() {
        let app = Router::new().route(
            ENDPOINT_PATH,
            post(|| async {
                std::future::pending::<()>().await;
                Json(serde_json::json!({}))
            }),
        );
        let base = serve(app).await;
        let connector = WebSocketConnector::new(Some("a".into()), Some("s".into()), base)
            .with_request_timeout(Duration::from_millis(100));
        let result = tokio::time::timeout(Duration::from_secs(2), connector.endpoint_url())
            .await
            .expect("discovery bounded by the request timeout");
        assert!(matches!(result, Err(ConnectionError::Request(_))));
    }

    #[tokio::test]
    async fn frames_reach_the_router_and_close_marks_connection_lost() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let ws_url = format!("ws://{}/ws", addr);
        let app = Router::new()
            .route(
                ENDPOINT_PATH,
                post(move || {
                    let ws_url = ws_url.clone();
                    async move { Json(serde_json::json!({ "code": 0, "data": { "URL": ws_url } })) }
                }),
            )
            .route(
                "/ws",
                get(|ws: WebSocketUpgrade| async {
                    ws.on_upgrade(|mut socket| async move {
                        let now = chrono::Utc::now().timestamp_millis();
                        let envelope = serde_json::json!({
                            "header": { "event_id": "ev-ws", "event_type": "im.message.receive_v1", "create_time": now.to_string() },
                            "event": { "message": { "message_id": "om_ws", "chat_id": "oc_1", "chat_type": "p2p", "content": "{\"text\":\"hi\"}" } }
                        });
                        let _ = socket.send(AxumMessage::Text("not json".into())).await;
                        let _ = socket.send(AxumMessage::Binary(vec![0x08, 0x01, 0xff])).await;
                        let _ = socket.send(AxumMessage::Text(envelope.to_string())).await;
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        let _ = socket.send(AxumMessage::Close(None)).await;
                    })
                }),
            );
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let manager = manager_with(WebSocketConnector::new(
            Some("a".into()),
            Some("s".into()),
            format!("http://{}", addr),
        ));
        assert!(manager.start("test").await);
        for _ in 0..100 {
            if manager.state() == ConnectionState::Degraded {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let health = manager.health();
        assert_eq!(health.dedup_entries, 1);
        assert_eq!(health.undecodable_frames, 2);
        assert_eq!(health.state, ConnectionState::Degraded);
        assert_eq!(health.consecutive_failures, 1);
        assert!(manager.stop("test").await.is_ok());
    }
}
